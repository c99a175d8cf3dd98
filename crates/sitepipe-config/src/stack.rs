//! Stack configuration parsing.
//!
//! A `sitepipe.kdl` file declares the repository coordinates once and one
//! `stack` block per delivery track:
//!
//! ```kdl
//! github owner="acme" repository="react-aod"
//!
//! stack "CICDProdStack" {
//!     pipeline "MasterAoD" restart-on-update=#true
//!     branch "master"
//!     env-label "prod"
//!     build {
//!         buildspec "./buildspec-prod.yml"
//!     }
//! }
//! ```
//!
//! Every knob not set in the file keeps the value from [`StackConfig::default`].

use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sitepipe_core::build::{AMAZON_LINUX_2, BuildSpecRef};
use sitepipe_core::pipeline::SourceTrigger;
use sitepipe_core::policy::{Effect, PolicyStatement};
use sitepipe_core::store::RemovalPolicy;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

pub const OWNER_ENV: &str = "SITEPIPE_GITHUB_OWNER";
pub const REPOSITORY_ENV: &str = "SITEPIPE_GITHUB_REPOSITORY";

static COORDINATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());

/// Source-control coordinates of the tracked repository.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub owner: String,
    pub repository: String,
}

impl GitHubConfig {
    pub fn new(owner: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repository: repository.into(),
        }
    }

    /// Read the coordinates from `SITEPIPE_GITHUB_OWNER` and
    /// `SITEPIPE_GITHUB_REPOSITORY`.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_variables(&VariableContext::from_env())
    }

    pub fn from_variables(ctx: &VariableContext) -> ConfigResult<Self> {
        let owner = ctx
            .env_var(OWNER_ENV)
            .ok_or_else(|| ConfigError::MissingField(OWNER_ENV.to_string()))?;
        let repository = ctx
            .env_var(REPOSITORY_ENV)
            .ok_or_else(|| ConfigError::MissingField(REPOSITORY_ENV.to_string()))?;
        Ok(Self::new(owner, repository))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (field, value) in [("owner", &self.owner), ("repository", &self.repository)] {
            if value.is_empty() {
                return Err(ConfigError::MissingField(format!("github {}", field)));
            }
            if !COORDINATE_REGEX.is_match(value) {
                return Err(ConfigError::invalid(
                    format!("github {}", field),
                    format!("'{}' may only contain letters, digits, '_', '.' and '-'", value),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub action_name: String,
    pub secret_id: String,
    pub secret_field: Option<String>,
    pub trigger: SourceTrigger,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            action_name: "SourceMasterAod".to_string(),
            secret_id: "GitHubToken".to_string(),
            secret_field: Some("GitHubToken".to_string()),
            trigger: SourceTrigger::Webhook,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub action_name: String,
    pub message: String,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            action_name: "Manual-Approval".to_string(),
            message: "This deploy is scary, are u sure?!".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub action_name: String,
    pub buildspec: String,
    pub image: String,
    /// Variable that carries the env label into the build.
    pub label_variable: String,
    /// Extra variables passed to the build action.
    pub variables: BTreeMap<String, String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            action_name: "BuildMasterAod".to_string(),
            buildspec: "./buildspec-prod.yml".to_string(),
            image: AMAZON_LINUX_2.to_string(),
            label_variable: "AmplifyEnvProd".to_string(),
            variables: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    pub action_name: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            action_name: "DeployMasterAod".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub index_document: String,
    pub error_document: String,
    pub removal_policy: RemovalPolicy,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            index_document: "index.html".to_string(),
            error_document: "index.html".to_string(),
            removal_policy: RemovalPolicy::Destroy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub logical_id: String,
    pub export_name: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            logical_id: "OutputId".to_string(),
            export_name: Some("CFEndpoint:".to_string()),
        }
    }
}

/// Everything the assembler needs to build one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    pub name: String,
    pub github: GitHubConfig,
    pub pipeline_name: String,
    pub restart_execution_on_update: bool,
    pub branch: String,
    /// Deploy track label surfaced to the build (e.g., "prod").
    pub env_label: String,
    pub source: SourceConfig,
    pub approval: ApprovalConfig,
    pub build: BuildConfig,
    pub deploy: DeployConfig,
    pub site: SiteConfig,
    pub output: OutputConfig,
    /// Replaces the unrestricted build policy when set.
    pub policy: Option<Vec<PolicyStatement>>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: "CICDProdStack".to_string(),
            github: GitHubConfig::default(),
            pipeline_name: "MasterAoD".to_string(),
            restart_execution_on_update: true,
            branch: "master".to_string(),
            env_label: "prod".to_string(),
            source: SourceConfig::default(),
            approval: ApprovalConfig::default(),
            build: BuildConfig::default(),
            deploy: DeployConfig::default(),
            site: SiteConfig::default(),
            output: OutputConfig::default(),
            policy: None,
        }
    }
}

impl StackConfig {
    /// The production track for `github`.
    pub fn new(github: GitHubConfig) -> Self {
        Self {
            github,
            ..Self::default()
        }
    }

    /// Variables handed to the build action.
    pub fn build_variables(&self) -> BTreeMap<String, String> {
        let mut vars = self.build.variables.clone();
        vars.insert(self.build.label_variable.clone(), self.env_label.clone());
        vars
    }

    /// Definition-time checks.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("stack name".to_string()));
        }
        self.github.validate()?;

        if self.pipeline_name.trim().is_empty() {
            return Err(ConfigError::MissingField("pipeline name".to_string()));
        }
        if self.branch.trim().is_empty() {
            return Err(ConfigError::MissingField("branch".to_string()));
        }
        if self.source.secret_id.trim().is_empty() {
            return Err(ConfigError::MissingField("source secret".to_string()));
        }
        if self.build.label_variable.trim().is_empty() {
            return Err(ConfigError::MissingField("build label-variable".to_string()));
        }
        BuildSpecRef::from_source_filename(&self.build.buildspec)
            .validate()
            .map_err(|e| ConfigError::invalid("buildspec", e.to_string()))?;

        let mut names = HashSet::new();
        for name in [
            &self.source.action_name,
            &self.approval.action_name,
            &self.build.action_name,
            &self.deploy.action_name,
        ] {
            if name.trim().is_empty() {
                return Err(ConfigError::MissingField("action name".to_string()));
            }
            if !names.insert(name.as_str()) {
                return Err(ConfigError::Duplicate(format!("action '{}'", name)));
            }
        }

        if let Some(statements) = &self.policy {
            if statements.is_empty() {
                return Err(ConfigError::invalid(
                    "policy",
                    "policy block declares no statements",
                ));
            }
            for statement in statements {
                if statement.actions.is_empty() || statement.resources.is_empty() {
                    return Err(ConfigError::invalid(
                        "policy statement",
                        "actions and resources must not be empty",
                    ));
                }
            }
        }

        Ok(())
    }

    fn interpolate(&mut self, ctx: &VariableContext) -> ConfigResult<()> {
        for value in [
            &mut self.github.owner,
            &mut self.github.repository,
            &mut self.pipeline_name,
            &mut self.branch,
            &mut self.env_label,
            &mut self.source.secret_id,
            &mut self.approval.message,
            &mut self.build.buildspec,
            &mut self.build.image,
            &mut self.site.index_document,
            &mut self.site.error_document,
        ] {
            ctx.interpolate_in(value)?;
        }
        if let Some(field) = &mut self.source.secret_field {
            ctx.interpolate_in(field)?;
        }
        if let Some(export) = &mut self.output.export_name {
            ctx.interpolate_in(export)?;
        }
        for value in self.build.variables.values_mut() {
            ctx.interpolate_in(value)?;
        }
        Ok(())
    }
}

/// Parse a file that declares exactly one stack.
pub fn parse_stack_config(kdl: &str, ctx: &VariableContext) -> ConfigResult<StackConfig> {
    let mut stacks = parse_stack_configs(kdl, ctx)?;
    if stacks.len() > 1 {
        return Err(ConfigError::invalid(
            "stack",
            format!("expected one stack, found {}", stacks.len()),
        ));
    }
    stacks
        .pop()
        .ok_or_else(|| ConfigError::MissingField("stack".to_string()))
}

/// Parse every `stack` block in a configuration file.
pub fn parse_stack_configs(kdl: &str, ctx: &VariableContext) -> ConfigResult<Vec<StackConfig>> {
    let doc: KdlDocument = kdl.parse()?;

    let mut shared_github = None;
    let mut stack_nodes = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "github" => shared_github = Some(parse_github(node)?),
            "stack" => stack_nodes.push(node),
            _ => {} // Ignore unknown nodes
        }
    }

    if stack_nodes.is_empty() {
        return Err(ConfigError::MissingField("stack".to_string()));
    }

    let mut seen = HashSet::new();
    let mut stacks = Vec::with_capacity(stack_nodes.len());
    for node in stack_nodes {
        let mut stack = parse_stack(node, shared_github.as_ref(), ctx)?;
        if !seen.insert(stack.name.clone()) {
            return Err(ConfigError::Duplicate(format!("stack '{}'", stack.name)));
        }
        let scoped = ctx.for_stack(&stack.name, &stack.branch, &stack.env_label);
        stack.interpolate(&scoped)?;
        stack.validate()?;
        stacks.push(stack);
    }

    Ok(stacks)
}

fn parse_github(node: &KdlNode) -> ConfigResult<GitHubConfig> {
    let owner = get_string_prop(node, "owner")
        .ok_or_else(|| ConfigError::MissingField("github owner".to_string()))?;
    let repository = get_string_prop(node, "repository")
        .ok_or_else(|| ConfigError::MissingField("github repository".to_string()))?;
    Ok(GitHubConfig::new(owner, repository))
}

fn parse_stack(
    node: &KdlNode,
    shared_github: Option<&GitHubConfig>,
    ctx: &VariableContext,
) -> ConfigResult<StackConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stack name".to_string()))?;

    let mut stack = StackConfig {
        name,
        ..StackConfig::default()
    };
    let mut github = shared_github.cloned();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "github" => github = Some(parse_github(child)?),
                "pipeline" => {
                    if let Some(name) = get_first_string_arg(child) {
                        stack.pipeline_name = name;
                    }
                    if let Some(restart) = get_bool_prop(child, "restart-on-update") {
                        stack.restart_execution_on_update = restart;
                    }
                }
                "branch" => {
                    stack.branch = get_first_string_arg(child).unwrap_or_default();
                }
                "env-label" => {
                    stack.env_label = get_first_string_arg(child).unwrap_or_default();
                }
                "source" => parse_source(child, &mut stack.source)?,
                "approval" => {
                    if let Some(message) = get_first_string_arg(child) {
                        stack.approval.message = message;
                    }
                    if let Some(action) = get_string_prop(child, "action") {
                        stack.approval.action_name = action;
                    }
                }
                "build" => parse_build(child, &mut stack.build),
                "deploy" => {
                    if let Some(action) = get_string_prop(child, "action") {
                        stack.deploy.action_name = action;
                    }
                }
                "site" => parse_site(child, &mut stack.site)?,
                "output" => {
                    if let Some(id) = get_first_string_arg(child) {
                        stack.output.logical_id = id;
                    }
                    if let Some(export) = get_string_prop(child, "export") {
                        stack.output.export_name = Some(export);
                    }
                }
                "policy" => stack.policy = Some(parse_policy(child)?),
                _ => {}
            }
        }
    }

    stack.github = match github {
        Some(github) => github,
        None => GitHubConfig::from_variables(ctx)?,
    };

    Ok(stack)
}

fn parse_source(node: &KdlNode, source: &mut SourceConfig) -> ConfigResult<()> {
    if let Some(action) = get_string_prop(node, "action") {
        source.action_name = action;
    }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "secret" => {
                    source.secret_id = get_first_string_arg(child).unwrap_or_default();
                    source.secret_field = get_string_prop(child, "field");
                }
                "trigger" => {
                    let trigger = get_first_string_arg(child).unwrap_or_default();
                    source.trigger = match trigger.as_str() {
                        "webhook" => SourceTrigger::Webhook,
                        "poll" => SourceTrigger::Poll,
                        "none" => SourceTrigger::None,
                        _ => {
                            return Err(ConfigError::invalid(
                                "source trigger",
                                format!("unknown trigger type: {}", trigger),
                            ));
                        }
                    };
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn parse_build(node: &KdlNode, build: &mut BuildConfig) {
    if let Some(action) = get_string_prop(node, "action") {
        build.action_name = action;
    }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "buildspec" => {
                    build.buildspec = get_first_string_arg(child).unwrap_or_default();
                }
                "image" => {
                    build.image = get_first_string_arg(child).unwrap_or_default();
                }
                "label-variable" => {
                    build.label_variable = get_first_string_arg(child).unwrap_or_default();
                }
                "env" => {
                    if let Some(grandchildren) = child.children() {
                        for gc in grandchildren.nodes() {
                            let key = gc.name().value().to_string();
                            if let Some(val) = get_first_string_arg(gc) {
                                build.variables.insert(key, val);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn parse_site(node: &KdlNode, site: &mut SiteConfig) -> ConfigResult<()> {
    if let Some(index) = get_string_prop(node, "index") {
        site.index_document = index;
    }
    if let Some(error) = get_string_prop(node, "error") {
        site.error_document = error;
    }
    if let Some(removal) = get_string_prop(node, "removal") {
        site.removal_policy = removal
            .parse()
            .map_err(|message: String| ConfigError::invalid("site removal", message))?;
    }
    Ok(())
}

fn parse_policy(node: &KdlNode) -> ConfigResult<Vec<PolicyStatement>> {
    let mut statements = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "statement" {
                continue;
            }
            let effect = match get_string_prop(child, "effect").as_deref() {
                None | Some("allow") => Effect::Allow,
                Some("deny") => Effect::Deny,
                Some(other) => {
                    return Err(ConfigError::invalid(
                        "policy effect",
                        format!("unknown effect: {}", other),
                    ));
                }
            };
            statements.push(PolicyStatement {
                effect,
                actions: get_string_list_prop(child, "actions"),
                resources: get_string_list_prop(child, "resources"),
            });
        }
    }
    Ok(statements)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Collects repeated `name="..."` properties, or the arguments of a
/// `name` child node.
fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let result: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().map(|n| n.value()) == Some(name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();

    if !result.is_empty() {
        return result;
    }

    node.children()
        .and_then(|children| children.nodes().iter().find(|c| c.name().value() == name))
        .map(get_all_string_args)
        .unwrap_or_default()
}
