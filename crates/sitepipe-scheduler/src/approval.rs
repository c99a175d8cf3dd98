//! Approval gate implementations.

use async_trait::async_trait;
use sitepipe_core::approval::{ApprovalDecision, ApprovalGate, ApprovalRequest};
use sitepipe_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::info;

struct PendingApproval {
    request: ApprovalRequest,
    respond: oneshot::Sender<ApprovalDecision>,
}

/// Holds each run at its approval until an operator decides.
///
/// A run whose wait was abandoned (for example by an approval timeout)
/// is forgotten at once and can no longer be decided.
#[derive(Default)]
pub struct ManualApprovalGate {
    waiting: Mutex<HashMap<ResourceId, PendingApproval>>,
}

/// Removes a run's entry when its wait ends, however it ends.
struct WaitGuard<'a> {
    gate: &'a ManualApprovalGate,
    run_id: ResourceId,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.gate.waiting().remove(&self.run_id);
    }
}

impl ManualApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiting(&self) -> MutexGuard<'_, HashMap<ResourceId, PendingApproval>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Approvals currently waiting, oldest first.
    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> =
            self.waiting().values().map(|p| p.request.clone()).collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    pub async fn approve(&self, run_id: ResourceId, by: Option<String>) -> Result<()> {
        self.decide(run_id, ApprovalDecision::Approved { by }).await
    }

    pub async fn reject(
        &self,
        run_id: ResourceId,
        by: Option<String>,
        reason: impl Into<String>,
    ) -> Result<()> {
        let reason = reason.into();
        self.decide(run_id, ApprovalDecision::Rejected { by, reason }).await
    }

    async fn decide(&self, run_id: ResourceId, decision: ApprovalDecision) -> Result<()> {
        let pending = self
            .waiting()
            .remove(&run_id)
            .ok_or_else(|| Error::NotFound(format!("no approval pending for run {}", run_id)))?;

        info!(
            run_id = %run_id,
            action = %pending.request.action,
            approved = decision.is_approved(),
            "Approval decided"
        );
        pending
            .respond
            .send(decision)
            .map_err(|_| Error::NotFound(format!("run {} is no longer waiting", run_id)))
    }
}

#[async_trait]
impl ApprovalGate for ManualApprovalGate {
    async fn wait_for_decision(&self, request: ApprovalRequest) -> Result<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let run_id = request.run_id;
        info!(
            run_id = %run_id,
            action = %request.action,
            message = %request.additional_information,
            "Waiting for manual approval"
        );
        self.waiting().insert(
            run_id,
            PendingApproval {
                request,
                respond: tx,
            },
        );
        let _guard = WaitGuard { gate: self, run_id };
        rx.await.map_err(|_| Error::Cancelled)
    }
}

/// Approves every request immediately. For unattended tracks.
#[derive(Debug, Clone)]
pub struct AutoApprove {
    by: String,
}

impl Default for AutoApprove {
    fn default() -> Self {
        Self {
            by: "auto-approve".to_string(),
        }
    }
}

impl AutoApprove {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn wait_for_decision(&self, request: ApprovalRequest) -> Result<ApprovalDecision> {
        info!(run_id = %request.run_id, action = %request.action, "Approval granted automatically");
        Ok(ApprovalDecision::Approved {
            by: Some(self.by.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(run_id: ResourceId) -> ApprovalRequest {
        ApprovalRequest {
            run_id,
            stage: "Approval".to_string(),
            action: "Manual-Approval".to_string(),
            additional_information: "This deploy is scary, are u sure?!".to_string(),
            requested_at: Utc::now(),
        }
    }

    async fn wait_until_pending(gate: &ManualApprovalGate) -> ApprovalRequest {
        loop {
            if let Some(r) = gate.pending().await.into_iter().next() {
                return r;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_approve_releases_waiter() {
        let gate = Arc::new(ManualApprovalGate::new());
        let run_id = ResourceId::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_for_decision(request(run_id)).await })
        };

        let pending = wait_until_pending(&gate).await;
        assert_eq!(pending.run_id, run_id);

        gate.approve(run_id, Some("ops".to_string())).await.unwrap();
        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(
            decision,
            ApprovalDecision::Approved {
                by: Some("ops".to_string())
            }
        );
        assert!(gate.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_reject_carries_reason() {
        let gate = Arc::new(ManualApprovalGate::new());
        let run_id = ResourceId::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_for_decision(request(run_id)).await })
        };
        wait_until_pending(&gate).await;

        gate.reject(run_id, None, "not today").await.unwrap();
        let decision = waiter.await.unwrap().unwrap();
        assert!(!decision.is_approved());
        assert!(matches!(
            decision,
            ApprovalDecision::Rejected { ref reason, .. } if reason == "not today"
        ));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let gate = ManualApprovalGate::new();
        assert!(matches!(
            gate.approve(ResourceId::new(), None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_is_not_pending() {
        let gate = ManualApprovalGate::new();
        let run_id = ResourceId::new();
        let waited =
            tokio::time::timeout(Duration::from_secs(60), gate.wait_for_decision(request(run_id)))
                .await;
        assert!(waited.is_err());

        assert!(gate.waiting().is_empty());
        assert!(gate.pending().await.is_empty());
        assert!(gate.approve(run_id, None).await.is_err());
    }

    #[tokio::test]
    async fn test_auto_approve() {
        let decision = AutoApprove::new()
            .wait_for_decision(request(ResourceId::new()))
            .await
            .unwrap();
        assert!(decision.is_approved());
    }
}
