// file: src/builder/pipeline.rs
// version: 1.0.0
// guid: 92d47f0b-6c35-4e18-a9b2-f51e08c3d764

//! Pipeline orchestration
//!
//! Selects the step sequence for the recipe's strategy, runs steps
//! sequentially under a cancellation token, and guarantees that scratch
//! directories, mounts, and loop devices are released on every exit path.

use super::dockerfile::DockerfileBuilder;
use super::image::ImageBuilder;
use super::initramfs::InitramfsBuilder;
use super::oci::{ImageFetcher, SkopeoUmoci};
use crate::config::schema::{BuildRecipe, Strategy};
use crate::config::ManifestTemplate;
use crate::{FledgeError, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything a single build needs; frozen at pipeline entry.
pub struct BuildContext {
    pub recipe: BuildRecipe,
    pub manifest_template: Option<ManifestTemplate>,
    /// Directory relative recipe paths resolve against
    pub work_dir: PathBuf,
    pub output_path: PathBuf,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub dockerfile_builder: Option<Arc<dyn DockerfileBuilder>>,
    /// Host-supplied busybox binary, overriding the download
    pub busybox_path: Option<PathBuf>,
}

impl BuildContext {
    pub fn new(recipe: BuildRecipe, work_dir: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            recipe,
            manifest_template: None,
            work_dir: work_dir.into(),
            output_path: output_path.into(),
            fetcher: Arc::new(SkopeoUmoci),
            dockerfile_builder: None,
            busybox_path: None,
        }
    }

    pub fn with_manifest_template(mut self, template: ManifestTemplate) -> Self {
        self.manifest_template = Some(template);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_dockerfile_builder(mut self, builder: Arc<dyn DockerfileBuilder>) -> Self {
        self.dockerfile_builder = Some(builder);
        self
    }

    pub fn with_busybox_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.busybox_path = Some(path.into());
        self
    }
}

/// Outcome of a completed build
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub artifact_path: PathBuf,
    pub manifest_path: PathBuf,
    pub checksum: String,
}

/// Run a build to completion.
pub async fn build(ctx: BuildContext, cancel: CancellationToken) -> Result<BuildReport> {
    info!(
        "Starting {} build: {}",
        ctx.recipe.strategy.as_str(),
        ctx.output_path.display()
    );

    let report = match ctx.recipe.strategy {
        Strategy::Initramfs => InitramfsBuilder::new(ctx).build(&cancel).await?,
        Strategy::OciRootfs => ImageBuilder::new(ctx).build(&cancel).await?,
    };

    info!("Build complete: {}", report.artifact_path.display());
    Ok(report)
}

/// Run one named step, prefixing its failure with the step name.
///
/// Cancellation is checked before the step runs and passes through
/// unwrapped so callers can distinguish it from step failures.
pub(crate) async fn step<T, F>(name: &str, cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(FledgeError::Cancelled);
    }

    info!("{}", name);

    fut.await.map_err(|e| match e {
        FledgeError::Cancelled => FledgeError::Cancelled,
        other => FledgeError::Step {
            step: name.to_string(),
            source: Box::new(other),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_step_prefixes_failures() {
        let cancel = CancellationToken::new();
        let err = step("Create filesystem", &cancel, async {
            Err::<(), _>(FledgeError::Network("boom".to_string()))
        })
        .await
        .unwrap_err();

        match err {
            FledgeError::Step { step, source } => {
                assert_eq!(step, "Create filesystem");
                assert!(matches!(*source, FledgeError::Network(_)));
            }
            other => panic!("expected Step, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_step_passes_cancellation_through() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = step("Copy rootfs", &cancel, async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, FledgeError::Cancelled));
    }

    #[tokio::test]
    async fn test_step_returns_value() {
        let cancel = CancellationToken::new();
        let value = step("Calculate size", &cancel, async { Ok(41 + 1) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
}
