//! Manual approval port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ResourceId, Result};

/// A pending request for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: ResourceId,
    pub stage: String,
    pub action: String,
    pub additional_information: String,
    pub requested_at: DateTime<Utc>,
}

/// The outcome of a manual gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    Approved { by: Option<String> },
    Rejected { by: Option<String>, reason: String },
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approved { .. })
    }
}

/// How long a run waits at a manual gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ApprovalPolicy {
    pub fn unbounded() -> Self {
        Self { timeout: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Suspends a run until an external decision arrives.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn wait_for_decision(&self, request: ApprovalRequest) -> Result<ApprovalDecision>;
}
