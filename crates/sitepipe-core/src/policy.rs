//! Principals, policy statements and roles.
//!
//! A [`Role`] is built up by attaching [`PolicyStatement`]s and is then frozen
//! with [`Role::without_policy_updates`] before being handed to a consumer.
//! The returned [`RoleRef`] records a digest of the policy at hand-off time so
//! later tampering can be detected.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, LogicalId, Result};

/// The service principal that executes build actions.
pub const BUILD_SERVICE_PRINCIPAL: &str = "codebuild.amazonaws.com";

/// Who a grant or trust relationship applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Principal {
    /// A platform service (e.g. the build service).
    Service(String),
    /// The access identity of a distribution front, qualified by the stack
    /// that declares it.
    AccessIdentity { stack: String, logical_id: LogicalId },
    /// A human operator.
    User(String),
    /// Unauthenticated callers.
    Anonymous,
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::Service(s) => write!(f, "service:{}", s),
            Principal::AccessIdentity { stack, logical_id } => {
                write!(f, "access-identity:{}/{}", stack, logical_id)
            }
            Principal::User(u) => write!(f, "user:{}", u),
            Principal::Anonymous => write!(f, "anonymous"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// A single grant: an effect over a set of action and resource patterns.
///
/// Patterns support `*` (any run of characters) and `?` (one character).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub effect: Effect,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

impl PolicyStatement {
    pub fn allow<A, R>(actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            effect: Effect::Allow,
            actions: actions.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn deny<A, R>(actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            effect: Effect::Deny,
            ..Self::allow(actions, resources)
        }
    }

    /// All actions on all resources.
    pub fn allow_all() -> Self {
        Self::allow(["*"], ["*"])
    }

    /// True for an allow statement covering every action on every resource.
    pub fn is_unrestricted(&self) -> bool {
        self.effect == Effect::Allow
            && self.actions.iter().any(|a| a == "*")
            && self.resources.iter().any(|r| r == "*")
    }

    pub fn matches(&self, action: &str, resource: &str) -> bool {
        self.actions.iter().any(|p| wildcard_match(p, action))
            && self.resources.iter().any(|p| wildcard_match(p, resource))
    }
}

/// A capability principal with attached policy statements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub logical_id: LogicalId,
    pub assumed_by: Principal,
    pub description: String,
    statements: Vec<PolicyStatement>,
    frozen: bool,
}

impl Role {
    pub fn new(
        logical_id: impl Into<LogicalId>,
        assumed_by: Principal,
        description: impl Into<String>,
    ) -> Self {
        Self {
            logical_id: logical_id.into(),
            assumed_by,
            description: description.into(),
            statements: Vec::new(),
            frozen: false,
        }
    }

    /// Attach a statement. Fails once the role has been handed off.
    pub fn add_to_policy(&mut self, statement: PolicyStatement) -> Result<()> {
        if self.frozen {
            return Err(Error::Conflict(format!(
                "role '{}' no longer accepts policy updates",
                self.logical_id
            )));
        }
        self.statements.push(statement);
        Ok(())
    }

    /// Freeze the policy and return a reference for the consumer.
    pub fn without_policy_updates(&mut self) -> RoleRef {
        self.frozen = true;
        RoleRef {
            logical_id: self.logical_id.clone(),
            policy_digest: self.policy_digest(),
        }
    }

    pub fn statements(&self) -> &[PolicyStatement] {
        &self.statements
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn can_be_assumed_by(&self, principal: &Principal) -> bool {
        &self.assumed_by == principal
    }

    /// Deny statements win over allow statements.
    pub fn is_allowed(&self, action: &str, resource: &str) -> bool {
        let mut allowed = false;
        for statement in &self.statements {
            if statement.matches(action, resource) {
                match statement.effect {
                    Effect::Deny => return false,
                    Effect::Allow => allowed = true,
                }
            }
        }
        allowed
    }

    pub fn is_unrestricted(&self) -> bool {
        self.statements.iter().any(PolicyStatement::is_unrestricted)
            && !self.statements.iter().any(|s| s.effect == Effect::Deny)
    }

    /// SHA-256 of the attached statements.
    pub fn policy_digest(&self) -> String {
        let encoded = serde_json::to_vec(&self.statements).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }
}

/// A read-only handle to a frozen role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    pub logical_id: LogicalId,
    pub policy_digest: String,
}

impl RoleRef {
    /// Whether `role` is the role this reference was issued for, unchanged.
    pub fn is_current(&self, role: &Role) -> bool {
        role.is_frozen()
            && role.logical_id == self.logical_id
            && role.policy_digest() == self.policy_digest
    }
}

/// Match `value` against a pattern containing `*` and `?` wildcards.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    let (mut pi, mut vi) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while vi < v.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, vi));
            pi += 1;
        } else if let Some((star_pi, star_vi)) = star {
            pi = star_pi + 1;
            vi = star_vi + 1;
            star = Some((star_pi, star_vi + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_role() -> Role {
        Role::new(
            "codeBuildRole",
            Principal::Service(BUILD_SERVICE_PRINCIPAL.to_string()),
            "Role for builds",
        )
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("s3:*", "s3:GetObject"));
        assert!(wildcard_match("arn:bucket/*", "arn:bucket/a/b.html"));
        assert!(wildcard_match("s3:Get?bject", "s3:GetObject"));
        assert!(!wildcard_match("s3:*", "logs:PutLogEvents"));
        assert!(!wildcard_match("abc", "abcd"));
        assert!(wildcard_match("a*c*e", "abcde"));
    }

    #[test]
    fn test_wildcard_statement_is_unrestricted() {
        let mut role = build_role();
        role.add_to_policy(PolicyStatement::allow_all()).unwrap();

        assert!(role.is_unrestricted());
        assert!(role.is_allowed("iam:DeleteRole", "arn:anything"));
    }

    #[test]
    fn test_narrow_policy() {
        let mut role = build_role();
        role.add_to_policy(PolicyStatement::allow(["s3:*"], ["arn:site/*"]))
            .unwrap();

        assert!(!role.is_unrestricted());
        assert!(role.is_allowed("s3:PutObject", "arn:site/index.html"));
        assert!(!role.is_allowed("iam:CreateUser", "*"));
    }

    #[test]
    fn test_deny_overrides_allow() {
        let mut role = build_role();
        role.add_to_policy(PolicyStatement::allow_all()).unwrap();
        role.add_to_policy(PolicyStatement::deny(["iam:*"], ["*"]))
            .unwrap();

        assert!(!role.is_allowed("iam:CreateUser", "x"));
        assert!(role.is_allowed("s3:GetObject", "x"));
        assert!(!role.is_unrestricted());
    }

    #[test]
    fn test_frozen_role_rejects_updates() {
        let mut role = build_role();
        role.add_to_policy(PolicyStatement::allow_all()).unwrap();
        let handle = role.without_policy_updates();

        let err = role
            .add_to_policy(PolicyStatement::allow(["s3:*"], ["*"]))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(role.statements().len(), 1);
        assert!(handle.is_current(&role));
    }

    #[test]
    fn test_role_ref_detects_tampering() {
        let mut role = build_role();
        role.add_to_policy(PolicyStatement::allow_all()).unwrap();
        let handle = role.without_policy_updates();

        let mut tampered = role.clone();
        tampered.statements.push(PolicyStatement::deny(["*"], ["*"]));
        assert!(!handle.is_current(&tampered));
    }

    #[test]
    fn test_trust_is_limited_to_build_service() {
        let role = build_role();
        assert!(role.can_be_assumed_by(&Principal::Service(BUILD_SERVICE_PRINCIPAL.into())));
        assert!(!role.can_be_assumed_by(&Principal::User("alice".into())));
        assert!(!role.can_be_assumed_by(&Principal::Service("lambda.amazonaws.com".into())));
    }
}
