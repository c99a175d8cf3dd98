//! Build execution backends and source providers for sitepipe.
//!
//! Provides:
//! - Executors: local Docker and host processes
//! - The build specification model
//! - [`ContainerBuildRunner`], the build stage runner
//! - Source providers: git checkouts and local directories

pub mod buildspec;
pub mod docker;
pub mod process;
pub mod runner;
pub mod source;
pub mod tree;

pub use buildspec::{BuildSpec, BuildSpecError};
pub use docker::DockerExecutor;
pub use process::ProcessExecutor;
pub use runner::ContainerBuildRunner;
pub use sitepipe_core::executor::{
    Executor, JobHandle, JobSpec, JobStatus, LogLine, LogStream,
};
pub use source::{DirectorySource, GitSourceProvider};
