//! Pipeline run orchestration for sitepipe.
//!
//! Drives a [`sitepipe_core::pipeline::PipelineRun`] through the stages of a
//! stack definition, suspending at manual approvals and handing the build
//! and deploy work to the configured ports.

pub mod approval;
pub mod orchestrator;
pub mod retry;
pub mod trigger;

pub use approval::{AutoApprove, ManualApprovalGate};
pub use orchestrator::{PipelineEvent, PipelineOrchestrator, PipelineResult};
pub use retry::{RetryPolicy, RetryingBuildRunner, RetryingDeployer};
pub use trigger::{PushTrigger, WebhookDelivery, definition_update_trigger, verify_github_signature};
