//! Allocation and teardown of cloud instance groups.
//!
//! Identity lives in the cloud: every managed instance carries an ownership
//! tag holding its virtual id, and every lookup goes through that tag (or,
//! for scaling groups, through the provider id).

pub mod errors;
pub mod logger;
pub mod reconciliation;
pub mod retry;
pub mod services;
pub mod settings;
pub mod state_machine;
pub mod strategy;
pub mod tagging;
pub mod volumes;

pub use errors::{OrchestratorError, Result};
pub use reconciliation::{IdResolution, InstanceReconciler, Resolution};
pub use retry::{retry_until, CancelHandle, Cancellation, RetryError, RetryPolicy};
pub use services::AllocationOrchestrator;
pub use settings::Settings;
pub use strategy::{
    build_strategy, Allocation, AllocationStrategy, StrategyContext, StrategyKind, VolumeAttachMode,
};
pub use tagging::IdentityTagger;
pub use volumes::EbsVolumeOrchestrator;
