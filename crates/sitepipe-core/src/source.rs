//! Source checkout port and push events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::artifact::ArtifactBundle;

/// What the source action asks a provider to check out.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub owner: String,
    pub repository: String,
    pub branch: String,
    /// Resolved OAuth token. Never logged.
    pub token: String,
}

impl SourceRequest {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repository)
    }

    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}.git", self.full_name())
    }
}

/// A checked-out revision of the tracked branch.
#[derive(Debug, Clone)]
pub struct SourceRevision {
    pub commit: Option<String>,
    pub bundle: ArtifactBundle,
}

/// Fetches the tracked branch.
///
/// Authentication failures and unknown branches surface as execution errors.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch(&self, request: &SourceRequest) -> Result<SourceRevision>;
}

/// Push event parsed from a GitHub webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub r#ref: String,
    pub before: String,
    pub after: String,
    pub repository_full_name: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub pusher: String,
}

impl PushEvent {
    /// Parse a GitHub push webhook payload
    pub fn from_github_payload(payload: &serde_json::Value) -> Option<Self> {
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let before = payload.get("before")?.as_str()?.to_string();
        let after = payload.get("after")?.as_str()?.to_string();
        let repository_full_name = payload
            .get("repository")?
            .get("full_name")?
            .as_str()?
            .to_string();

        let branch = r#ref.strip_prefix("refs/heads/").map(str::to_string);
        let tag = r#ref.strip_prefix("refs/tags/").map(str::to_string);

        let pusher = payload
            .get("pusher")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or_default()
            .to_string();

        Some(PushEvent {
            r#ref,
            before,
            after,
            repository_full_name,
            branch,
            tag,
            pusher,
        })
    }

    /// Whether this push landed on `branch` of `owner/repository`.
    pub fn targets(&self, owner: &str, repository: &str, branch: &str) -> bool {
        self.repository_full_name
            .eq_ignore_ascii_case(&format!("{}/{}", owner, repository))
            && self.branch.as_deref() == Some(branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_branch_push() {
        let payload = json!({
            "ref": "refs/heads/master",
            "before": "000",
            "after": "abc123",
            "repository": { "full_name": "acme/react-aod" },
            "pusher": { "name": "dev" }
        });

        let event = PushEvent::from_github_payload(&payload).unwrap();
        assert_eq!(event.branch.as_deref(), Some("master"));
        assert!(event.tag.is_none());
        assert_eq!(event.pusher, "dev");
        assert!(event.targets("acme", "react-aod", "master"));
        assert!(event.targets("ACME", "React-AoD", "master"));
        assert!(!event.targets("acme", "react-aod", "develop"));
        assert!(!event.targets("other", "react-aod", "master"));
    }

    #[test]
    fn test_parse_tag_push() {
        let payload = json!({
            "ref": "refs/tags/v1.0.0",
            "before": "000",
            "after": "abc123",
            "repository": { "full_name": "acme/site" }
        });

        let event = PushEvent::from_github_payload(&payload).unwrap();
        assert!(event.branch.is_none());
        assert_eq!(event.tag.as_deref(), Some("v1.0.0"));
        assert!(!event.targets("acme", "site", "master"));
    }

    #[test]
    fn test_missing_fields() {
        assert!(PushEvent::from_github_payload(&json!({ "zen": "hi" })).is_none());
    }

    #[test]
    fn test_clone_url() {
        let req = SourceRequest {
            owner: "acme".into(),
            repository: "site".into(),
            branch: "master".into(),
            token: "t".into(),
        };
        assert_eq!(req.clone_url(), "https://github.com/acme/site.git");
    }
}
