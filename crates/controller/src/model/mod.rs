pub mod pipeline;
pub mod record;

pub use pipeline::{
    ConfigMode, CustomConfig, ImageSettings, JobDefinition, PipelineConfig, RuntimeSettings,
    SourceSettings, StackType, StandardConfig,
};
pub use record::{
    BuildRecord, BuildSnapshot, BuildStatus, FailureRecord, JobPhase, JobRecord, Operation,
    ReconcileStep, TrackingState,
};
