//! CLI command implementations.

pub mod approval;
pub mod run;

use anyhow::{Context, Result, bail};
use sitepipe_config::{GitHubConfig, StackConfig, VariableContext, assemble, parse_stack_configs};
use sitepipe_core::stack::StackDefinition;
use std::path::Path;
use tracing::info;

const DEFAULT_CONFIG: &str = "sitepipe.kdl";

/// Stack configurations from `path`, `./sitepipe.kdl`, or the environment.
pub fn load_stacks(path: Option<&Path>) -> Result<Vec<StackConfig>> {
    let default = Path::new(DEFAULT_CONFIG);
    let path = match path {
        Some(path) => path,
        None if default.exists() => default,
        None => {
            info!("No {} found, configuring from the environment", DEFAULT_CONFIG);
            let github = GitHubConfig::from_env().context("Failed to read GitHub settings")?;
            return Ok(vec![StackConfig::new(github)]);
        }
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_stack_configs(&content, &VariableContext::from_env())
        .with_context(|| format!("Failed to parse stack config: {}", path.display()))
}

fn select(stacks: Vec<StackConfig>, name: Option<&str>) -> Result<StackConfig> {
    match name {
        Some(name) => {
            let names: Vec<String> = stacks.iter().map(|s| s.name.clone()).collect();
            stacks
                .into_iter()
                .find(|s| s.name == name)
                .with_context(|| format!("No stack named '{}' (have: {})", name, names.join(", ")))
        }
        None if stacks.len() == 1 => stacks.into_iter().next().context("No stack declared"),
        None => {
            let names: Vec<String> = stacks.into_iter().map(|s| s.name).collect();
            bail!("Several stacks declared, pick one with --stack: {}", names.join(", "))
        }
    }
}

/// Load and assemble one stack.
pub fn load_definition(path: Option<&Path>, stack: Option<&str>) -> Result<StackDefinition> {
    let config = select(load_stacks(path)?, stack)?;
    assemble(&config).with_context(|| format!("Stack '{}' is invalid", config.name))
}

pub fn synth(path: Option<&Path>, stack: Option<&str>) -> Result<()> {
    let definition = load_definition(path, stack)?;
    println!("{}", serde_json::to_string_pretty(&definition)?);
    Ok(())
}

pub fn validate(path: Option<&Path>) -> Result<()> {
    let stacks = load_stacks(path)?;
    let mut failed = 0;
    for config in &stacks {
        match assemble(config) {
            Ok(definition) => println!(
                "✓ {} ({} stages, fingerprint {})",
                definition.name,
                definition.pipeline.stages.len(),
                &definition.fingerprint()[..12]
            ),
            Err(e) => {
                println!("✗ {}: {}", config.name, e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} stacks are invalid", failed, stacks.len());
    }
    println!("Configuration is valid");
    Ok(())
}
