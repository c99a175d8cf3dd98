//! Local provisioning backend for sitepipe.
//!
//! [`LocalCloud`] holds buckets, distributions and applied stacks in
//! memory. The other types in this crate are views over that shared state:
//!
//! - [`LocalProvisioner`] applies and tears down stack definitions
//! - [`LocalContentStore`] enforces bucket read grants
//! - [`StoreDeployer`] replaces a bucket's contents with a website bundle
//! - [`LocalEdge`] serves a bucket through its distribution front
//! - [`InMemorySecretStore`] resolves secret references

pub mod cloud;
pub mod deployer;
pub mod edge;
pub mod provisioner;
pub mod secrets;
pub mod store;

pub use cloud::LocalCloud;
pub use deployer::StoreDeployer;
pub use edge::LocalEdge;
pub use provisioner::LocalProvisioner;
pub use secrets::InMemorySecretStore;
pub use store::LocalContentStore;
