//! Approval prompt on the controlling terminal.

use async_trait::async_trait;
use sitepipe_core::approval::{ApprovalDecision, ApprovalGate, ApprovalRequest};
use sitepipe_core::{Error, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::Mutex;

/// Asks the operator on stdin. Anything but `y`/`yes` declines.
pub struct PromptApproval<R = BufReader<Stdin>> {
    input: Mutex<R>,
    operator: Option<String>,
}

impl PromptApproval {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> PromptApproval<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: Mutex::new(input),
            operator: std::env::var("USER").ok(),
        }
    }
}

#[async_trait]
impl<R> ApprovalGate for PromptApproval<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn wait_for_decision(&self, request: ApprovalRequest) -> Result<ApprovalDecision> {
        let mut stdout = tokio::io::stdout();
        let prompt = format!(
            "\n⏸ {} / {}: {}\n  Approve? [y/N] ",
            request.stage, request.action, request.additional_information
        );
        let io = |e: std::io::Error| Error::Internal(format!("approval prompt: {}", e));
        stdout.write_all(prompt.as_bytes()).await.map_err(io)?;
        stdout.flush().await.map_err(io)?;

        let mut line = String::new();
        self.input
            .lock()
            .await
            .read_line(&mut line)
            .await
            .map_err(io)?;

        let by = self.operator.clone();
        Ok(match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => ApprovalDecision::Approved { by },
            _ => ApprovalDecision::Rejected {
                by,
                reason: "declined at prompt".to_string(),
            },
        })
    }
}
