//! The permission grantor: the single role the build worker assumes.

use crate::ConfigResult;
use sitepipe_core::policy::{BUILD_SERVICE_PRINCIPAL, PolicyStatement, Principal, Role};
use tracing::warn;

pub const BUILD_ROLE_ID: &str = "codeBuildRole";
pub const BUILD_ROLE_DESCRIPTION: &str = "Role for CodeBuild have the right permissions";

/// Build the role assumed by the build service.
///
/// With no configured policy the role gets one statement allowing every
/// action on every resource. That grant is reproduced as declared and
/// reported with a warning.
pub fn build_role(policy: Option<&[PolicyStatement]>) -> ConfigResult<Role> {
    let mut role = Role::new(
        BUILD_ROLE_ID,
        Principal::Service(BUILD_SERVICE_PRINCIPAL.to_string()),
        BUILD_ROLE_DESCRIPTION,
    );

    match policy {
        Some(statements) => {
            for statement in statements {
                role.add_to_policy(statement.clone())?;
            }
        }
        None => role.add_to_policy(PolicyStatement::allow_all())?,
    }

    if role.is_unrestricted() {
        warn!(
            role = %role.logical_id,
            "Build role grants every action on every resource; add a policy block to narrow it"
        );
    }

    Ok(role)
}
