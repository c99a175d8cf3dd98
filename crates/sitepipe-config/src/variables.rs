//! `${...}` interpolation in stack configuration values.
//!
//! Two namespaces are understood:
//! - `${env.NAME}` reads the environment captured in the context
//! - `${stack.name}`, `${stack.branch}` and `${stack.label}` describe the
//!   stack block being parsed
//!
//! A reference that resolves to nothing is a definition-time error.

use crate::{ConfigError, ConfigResult};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StackScope {
    name: String,
    branch: String,
    label: String,
}

#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    env: HashMap<String, String>,
    stack: Option<StackScope>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current process environment.
    pub fn from_env() -> Self {
        Self::new().with_env(std::env::vars())
    }

    pub fn with_env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    /// Scope to one stack block. `branch` and `label` may themselves hold
    /// `${env.*}` references.
    pub fn for_stack(&self, name: &str, branch: &str, label: &str) -> Self {
        let stack = StackScope {
            name: name.to_string(),
            branch: self.interpolate(branch),
            label: self.interpolate(label),
        };
        Self {
            env: self.env.clone(),
            stack: Some(stack),
        }
    }

    pub fn resolve(&self, var_name: &str) -> Option<&str> {
        match var_name.split_once('.')? {
            ("env", name) => self.env_var(name),
            ("stack", field) => {
                let stack = self.stack.as_ref()?;
                let value = match field {
                    "name" => &stack.name,
                    "branch" => &stack.branch,
                    "label" => &stack.label,
                    _ => return None,
                };
                Some(value.as_str())
            }
            _ => None,
        }
    }

    /// Substitute every resolvable reference, leaving the others verbatim.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .into_owned()
    }

    /// Interpolate in place, failing on the first unresolved reference.
    pub fn interpolate_in(&self, value: &mut String) -> ConfigResult<()> {
        if !value.contains("${") {
            return Ok(());
        }
        if let Some(missing) = self.unresolved(value).into_iter().next() {
            return Err(ConfigError::UnresolvedVariable(missing));
        }
        *value = self.interpolate(value);
        Ok(())
    }

    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> VariableContext {
        VariableContext::new().with_env([("OWNER", "acme"), ("TRACK", "prod")])
    }

    #[test]
    fn test_env_variables() {
        assert_eq!(ctx().interpolate("${env.OWNER}/react-aod"), "acme/react-aod");
        assert_eq!(ctx().env_var("TRACK"), Some("prod"));
    }

    #[test]
    fn test_stack_scope() {
        let scoped = ctx().for_stack("CICDProdStack", "master", "${env.TRACK}");
        assert_eq!(
            scoped.interpolate("${stack.name}:${stack.branch}:${stack.label}"),
            "CICDProdStack:master:prod"
        );
        // stack variables only exist inside a stack block
        assert_eq!(ctx().resolve("stack.name"), None);
    }

    #[test]
    fn test_unknown_variables() {
        let ctx = ctx();
        assert_eq!(ctx.interpolate("x ${env.MISSING}"), "x ${env.MISSING}");
        assert_eq!(ctx.unresolved("${env.MISSING} ${custom} ${env.OWNER}").len(), 2);

        let mut value = "CFEndpoint-${env.MISSING}".to_string();
        assert!(matches!(
            ctx.interpolate_in(&mut value),
            Err(ConfigError::UnresolvedVariable(ref name)) if name == "env.MISSING"
        ));
        assert_eq!(value, "CFEndpoint-${env.MISSING}");
    }

    #[test]
    fn test_interpolate_in_place() {
        let ctx = ctx().for_stack("CICDDevStack", "develop", "dev");
        let mut value = "AmplifyEnv-${stack.label}".to_string();
        ctx.interpolate_in(&mut value).unwrap();
        assert_eq!(value, "AmplifyEnv-dev");
    }
}
