//! What starts a pipeline run: pushes and definition updates.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sitepipe_core::pipeline::{PipelineDefinition, RunTrigger, SourceTrigger};
use sitepipe_core::source::PushEvent;
use sitepipe_core::stack::ProvisionOutcome;
use sitepipe_core::{Error, Result};
use tracing::{debug, info, warn};

pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// A received GitHub webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    /// Value of the `X-GitHub-Event` header.
    pub event: String,
    /// Value of the `X-Hub-Signature-256` header.
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

/// Check a `sha256=<hex>` signature of `body`.
pub fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Turns push webhooks into runs of a pipeline.
#[derive(Debug, Clone, Default)]
pub struct PushTrigger {
    secret: Option<String>,
}

impl PushTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require deliveries to be signed with `secret`.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// A run trigger if `delivery` is a push to a branch a webhook-triggered
    /// source action of `pipeline` tracks.
    ///
    /// Unsigned or wrongly signed deliveries are `Forbidden` when a secret is
    /// configured. Other events and unrelated pushes yield `None`.
    pub fn handle(
        &self,
        pipeline: &PipelineDefinition,
        delivery: &WebhookDelivery,
    ) -> Result<Option<RunTrigger>> {
        if let Some(secret) = &self.secret {
            if !verify_github_signature(secret, &delivery.body, delivery.signature.as_deref()) {
                warn!(pipeline = %pipeline.name, "Invalid webhook signature");
                return Err(Error::Forbidden("invalid webhook signature".to_string()));
            }
        }

        match delivery.event.as_str() {
            "push" => {}
            "ping" => {
                info!(pipeline = %pipeline.name, "Webhook ping received");
                return Ok(None);
            }
            other => {
                debug!(event = other, "Ignoring webhook event");
                return Ok(None);
            }
        }

        let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&delivery.body) else {
            warn!(pipeline = %pipeline.name, "Webhook payload is not JSON");
            return Ok(None);
        };
        let Some(push) = PushEvent::from_github_payload(&payload) else {
            return Ok(None);
        };

        let tracked = pipeline.source_actions().any(|source| {
            source.trigger == SourceTrigger::Webhook
                && push.targets(&source.owner, &source.repository, &source.branch)
        });
        if !tracked {
            debug!(
                repository = %push.repository_full_name,
                r#ref = %push.r#ref,
                "Push does not target this pipeline"
            );
            return Ok(None);
        }

        info!(
            pipeline = %pipeline.name,
            commit = %push.after,
            pusher = %push.pusher,
            "Push triggers pipeline run"
        );
        Ok(Some(RunTrigger::Webhook {
            commit: push.after,
            pusher: push.pusher,
        }))
    }
}

/// A run trigger when applying the definition changed the pipeline and the
/// pipeline restarts on updates.
pub fn definition_update_trigger(
    pipeline: &PipelineDefinition,
    outcome: &ProvisionOutcome,
) -> Option<RunTrigger> {
    (pipeline.restart_execution_on_update && outcome.pipeline_changed).then(|| {
        RunTrigger::DefinitionUpdated {
            fingerprint: outcome.stack.pipeline_fingerprint.clone(),
        }
    })
}
