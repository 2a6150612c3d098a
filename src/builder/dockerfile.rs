// file: src/builder/dockerfile.rs
// version: 1.0.0
// guid: 1e64b8d0-97cf-4a25-b3e6-d402f91c85a7

//! Pluggable Dockerfile-to-rootfs builder
//!
//! The engine does not prescribe how a Dockerfile becomes a rootfs; an
//! implementation may drive an external daemon, an in-process solver, or a
//! hypervisor-backed worker. Absence of an implementation is a clean
//! runtime error.

use crate::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Inputs for a Dockerfile build
#[derive(Debug, Clone)]
pub struct DockerfileBuildInput {
    /// Absolute path to the Dockerfile
    pub dockerfile: PathBuf,
    /// Absolute path to the build context
    pub context_dir: PathBuf,
    /// Optional multi-stage target
    pub target: Option<String>,
    pub build_args: BTreeMap<String, String>,
    /// Directory that receives the complete exported rootfs
    pub dest_dir: PathBuf,
}

/// A registered Dockerfile builder implementation
#[async_trait::async_trait]
pub trait DockerfileBuilder: Send + Sync {
    /// Materialize the Dockerfile's rootfs into `input.dest_dir`.
    async fn build_to_dir(
        &self,
        input: &DockerfileBuildInput,
        cancel: &CancellationToken,
    ) -> Result<()>;
}
