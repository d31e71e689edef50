//! Stages: the fixed stage catalogue, the executor interface and the
//! ready-made executors for asset production and feedback review.

mod asset_stage;
mod batch;
mod catalog;
mod executor;
mod review_stage;
mod routing;

pub use asset_stage::{AssetGenerator, AssetRequest, AssetStage, Composer, MergeStage};
pub use batch::{produce_assets, BatchFailure, BatchReport};
pub use catalog::{CompletionCopy, Phase, StageId};
pub use executor::{StageContext, StageExecutor, StageRegistry, StageRegistryBuilder};
pub use review_stage::{ReviewStage, TextModel};
pub use routing::{PreserveSet, Routing, TargetIds};

#[cfg(test)]
pub(crate) use asset_stage::{MockAssetGenerator, MockComposer};
#[cfg(test)]
pub(crate) use review_stage::MockTextModel;
