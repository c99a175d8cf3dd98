//! Stack configuration and pipeline assembly for sitepipe.
//!
//! This crate handles:
//! - Parsing stack definitions from `sitepipe.kdl`
//! - Variable interpolation
//! - Assembling a [`sitepipe_core::stack::StackDefinition`] from a [`StackConfig`]

pub mod assembler;
pub mod error;
pub mod grants;
pub mod hosting;
pub mod stack;
pub mod variables;

pub use assembler::assemble;
pub use error::{ConfigError, ConfigResult};
pub use stack::{GitHubConfig, StackConfig, parse_stack_config, parse_stack_configs};
pub use variables::VariableContext;
