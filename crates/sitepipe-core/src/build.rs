//! Build projects and the build stage runner port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::artifact::ArtifactBundle;
use crate::policy::RoleRef;
use crate::{Error, LogicalId, ResourceId, Result};

/// Managed image the build runs in when none is configured.
pub const AMAZON_LINUX_2: &str = "aws/codebuild/amazonlinux2-x86_64-standard:3.0";

/// Reference to a build procedure file inside the source artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpecRef {
    pub path: String,
}

impl BuildSpecRef {
    pub fn from_source_filename(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// The path must be relative to the source root and name a YAML file.
    pub fn validate(&self) -> Result<()> {
        let path = self.path.trim();
        if path.is_empty() {
            return Err(Error::InvalidDefinition(
                "build specification path is empty".to_string(),
            ));
        }
        if path.starts_with('/') || path.split('/').any(|segment| segment == "..") {
            return Err(Error::InvalidDefinition(format!(
                "build specification '{}' must stay inside the source",
                path
            )));
        }
        if !(path.ends_with(".yml") || path.ends_with(".yaml")) {
            return Err(Error::InvalidDefinition(format!(
                "build specification '{}' is not a YAML file",
                path
            )));
        }
        Ok(())
    }

    /// Path relative to the source root, without a leading `./`.
    pub fn relative_path(&self) -> &str {
        self.path.trim().trim_start_matches("./")
    }
}

/// Environment a build project runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEnvironment {
    pub build_image: String,
}

impl Default for BuildEnvironment {
    fn default() -> Self {
        Self {
            build_image: AMAZON_LINUX_2.to_string(),
        }
    }
}

/// A build project bound to a frozen role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProject {
    pub logical_id: LogicalId,
    pub build_spec: BuildSpecRef,
    pub role: RoleRef,
    pub environment: BuildEnvironment,
}

/// One invocation of a build project.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub run_id: ResourceId,
    pub action: String,
    pub project: BuildProject,
    pub source: ArtifactBundle,
    /// Action-level variables; these override variables from the build procedure.
    pub env: BTreeMap<String, String>,
}

/// Runs a declared build procedure against a source bundle.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Produce the output bundle, or fail with an execution error.
    async fn run(&self, request: BuildRequest) -> Result<ArtifactBundle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buildspec_path_validation() {
        assert!(BuildSpecRef::from_source_filename("./buildspec-prod.yml")
            .validate()
            .is_ok());
        assert!(BuildSpecRef::from_source_filename("ci/buildspec.yaml")
            .validate()
            .is_ok());
        assert!(BuildSpecRef::from_source_filename("").validate().is_err());
        assert!(BuildSpecRef::from_source_filename("/etc/buildspec.yml")
            .validate()
            .is_err());
        assert!(BuildSpecRef::from_source_filename("../buildspec.yml")
            .validate()
            .is_err());
        assert!(BuildSpecRef::from_source_filename("buildspec.json")
            .validate()
            .is_err());
    }

    #[test]
    fn test_relative_path() {
        let spec = BuildSpecRef::from_source_filename("./buildspec-prod.yml");
        assert_eq!(spec.relative_path(), "buildspec-prod.yml");
    }
}
