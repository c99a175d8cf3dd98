//! Build specification files.
//!
//! A build specification is a YAML file kept in the source repository:
//!
//! ```yaml
//! version: 0.2
//! env:
//!   variables:
//!     NODE_ENV: production
//! phases:
//!   install:
//!     commands:
//!       - npm ci
//!   build:
//!     commands:
//!       - npm run build
//! artifacts:
//!   base-directory: build
//!   files:
//!     - '**/*'
//! ```

use serde::Deserialize;
use sitepipe_core::policy::wildcard_match;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildSpecError {
    #[error("invalid build specification: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported build specification version: {0}")]
    UnsupportedVersion(String),

    #[error("build specification has no commands")]
    NoCommands,

    #[error("invalid artifact path: {0}")]
    InvalidArtifactPath(String),
}

impl From<BuildSpecError> for sitepipe_core::Error {
    fn from(err: BuildSpecError) -> Self {
        sitepipe_core::Error::ExecutionFailed(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildSpec {
    pub version: serde_yaml::Value,
    #[serde(default)]
    pub env: BuildSpecEnv,
    #[serde(default)]
    pub phases: Phases,
    #[serde(default)]
    pub artifacts: Option<ArtifactsSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildSpecEnv {
    #[serde(default)]
    pub variables: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Phases {
    pub install: Option<Phase>,
    pub pre_build: Option<Phase>,
    pub build: Option<Phase>,
    pub post_build: Option<Phase>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Phase {
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsSection {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(rename = "base-directory")]
    pub base_directory: Option<String>,
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl BuildSpec {
    pub fn parse(yaml: &str) -> Result<Self, BuildSpecError> {
        let spec: BuildSpec = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn version(&self) -> String {
        scalar_to_string(&self.version).unwrap_or_default()
    }

    fn validate(&self) -> Result<(), BuildSpecError> {
        let version = self.version();
        if !matches!(version.as_str(), "0.1" | "0.2") {
            return Err(BuildSpecError::UnsupportedVersion(version));
        }
        if self.commands().is_empty() {
            return Err(BuildSpecError::NoCommands);
        }
        if let Some(base) = self.base_directory() {
            if base.starts_with('/') || base.split('/').any(|s| s == "..") {
                return Err(BuildSpecError::InvalidArtifactPath(base.to_string()));
            }
        }
        Ok(())
    }

    /// Declared variables rendered as strings.
    pub fn variables(&self) -> BTreeMap<String, String> {
        self.env
            .variables
            .iter()
            .filter_map(|(k, v)| scalar_to_string(v).map(|v| (k.clone(), v)))
            .collect()
    }

    /// Commands of every phase, in execution order.
    pub fn commands(&self) -> Vec<(&'static str, &str)> {
        let phases = [
            ("install", &self.phases.install),
            ("pre_build", &self.phases.pre_build),
            ("build", &self.phases.build),
            ("post_build", &self.phases.post_build),
        ];
        phases
            .into_iter()
            .filter_map(|(name, phase)| phase.as_ref().map(|p| (name, p)))
            .flat_map(|(name, phase)| phase.commands.iter().map(move |c| (name, c.as_str())))
            .collect()
    }

    /// A POSIX shell script running every phase, stopping at the first failure.
    pub fn script(&self) -> String {
        let mut script = String::from("set -e\n");
        let mut current = "";
        for (phase, command) in self.commands() {
            if phase != current {
                script.push_str(&format!("echo '[sitepipe] entering phase {}'\n", phase));
                current = phase;
            }
            script.push_str(command);
            script.push('\n');
        }
        script
    }

    /// Directory, relative to the source root, that artifacts are collected from.
    pub fn base_directory(&self) -> Option<&str> {
        self.artifacts
            .as_ref()
            .and_then(|a| a.base_directory.as_deref())
            .map(|d| d.trim_start_matches("./").trim_end_matches('/'))
            .filter(|d| !d.is_empty() && *d != ".")
    }

    /// Whether `path`, relative to the base directory, is an artifact.
    pub fn is_artifact(&self, path: &str) -> bool {
        let Some(artifacts) = &self.artifacts else {
            return false;
        };
        artifacts.files.iter().any(|pattern| {
            let pattern = pattern.trim_start_matches("./");
            wildcard_match(pattern, path)
                || pattern
                    .strip_prefix("**/")
                    .is_some_and(|rest| wildcard_match(rest, path))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REACT_BUILDSPEC: &str = r#"
version: 0.2
env:
  variables:
    NODE_ENV: production
    RETRIES: 3
phases:
  install:
    commands:
      - npm ci
  build:
    commands:
      - npm run build
      - echo done
artifacts:
  base-directory: ./build/
  files:
    - '**/*'
"#;

    #[test]
    fn test_parse_buildspec() {
        let spec = BuildSpec::parse(REACT_BUILDSPEC).unwrap();
        assert_eq!(spec.version(), "0.2");
        assert_eq!(spec.base_directory(), Some("build"));

        let vars = spec.variables();
        assert_eq!(vars.get("NODE_ENV").unwrap(), "production");
        assert_eq!(vars.get("RETRIES").unwrap(), "3");

        let commands = spec.commands();
        assert_eq!(
            commands,
            vec![
                ("install", "npm ci"),
                ("build", "npm run build"),
                ("build", "echo done")
            ]
        );
    }

    #[test]
    fn test_script_stops_on_failure() {
        let spec = BuildSpec::parse(REACT_BUILDSPEC).unwrap();
        let script = spec.script();
        assert!(script.starts_with("set -e\n"));
        assert_eq!(script.matches("entering phase").count(), 2);
        assert!(script.find("npm ci").unwrap() < script.find("npm run build").unwrap());
    }

    #[test]
    fn test_artifact_patterns() {
        let spec = BuildSpec::parse(REACT_BUILDSPEC).unwrap();
        assert!(spec.is_artifact("index.html"));
        assert!(spec.is_artifact("static/js/main.js"));

        let narrow = BuildSpec::parse(
            "version: 0.2\nphases:\n  build:\n    commands: [make]\nartifacts:\n  files: ['*.html']\n",
        )
        .unwrap();
        assert!(narrow.is_artifact("index.html"));
        assert!(!narrow.is_artifact("app.js"));
        assert!(narrow.base_directory().is_none());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let err = BuildSpec::parse("version: 1.0\nphases:\n  build:\n    commands: [make]\n")
            .unwrap_err();
        assert!(matches!(err, BuildSpecError::UnsupportedVersion(_)));
    }

    #[test]
    fn test_rejects_empty_phases() {
        let err = BuildSpec::parse("version: 0.2\n").unwrap_err();
        assert!(matches!(err, BuildSpecError::NoCommands));
    }

    #[test]
    fn test_rejects_escaping_base_directory() {
        let err = BuildSpec::parse(
            "version: 0.2\nphases:\n  build:\n    commands: [make]\nartifacts:\n  base-directory: ../out\n  files: ['*']\n",
        )
        .unwrap_err();
        assert!(matches!(err, BuildSpecError::InvalidArtifactPath(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            BuildSpec::parse("version: [").unwrap_err(),
            BuildSpecError::Yaml(_)
        ));
    }
}
