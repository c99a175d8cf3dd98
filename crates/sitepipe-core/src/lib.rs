//! Core domain types and traits for sitepipe.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Pipeline definitions and the run state machine
//! - Roles and policy statements
//! - Content store and distribution declarations
//! - Port traits for executors, builds, sources, approvals, deploys and provisioning
//! - The immutable stack definition handed to a provisioner

pub mod approval;
pub mod artifact;
pub mod build;
pub mod deploy;
pub mod distribution;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;
pub mod policy;
pub mod secret;
pub mod source;
pub mod stack;
pub mod store;

pub use error::{Error, ErrorPhase, Result};
pub use id::{LogicalId, ResourceId};
