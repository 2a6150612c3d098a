// file: src/builder/oci.rs
// version: 1.0.1
// guid: ad59e3c8-2b71-4f06-9a84-61f3d0b7c2e9

//! OCI image fetch and unpack
//!
//! External tools do the heavy lifting: an image copier materializes an OCI
//! layout (local daemon first, remote registry as fallback) and an unpacker
//! applies the layers into a rootfs directory. The engine additionally
//! preserves the image config as a sidecar the guest agent can read.

use super::mapping;
use crate::process::ToolCommand;
use crate::{FledgeError, Result};
use serde::Deserialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Name of the config sidecar written into the rootfs under /etc
pub const CONFIG_SIDECAR_NAME: &str = "fsify-entrypoint";

/// Abstract OCI image fetch/unpack operations
#[async_trait::async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Copy `image_ref` into an OCI layout at `layout_dir` with tag "latest".
    async fn fetch(
        &self,
        image_ref: &str,
        layout_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Unpack the layout into `unpack_dir`, producing `unpack_dir/rootfs`.
    async fn unpack(
        &self,
        layout_dir: &Path,
        unpack_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Production fetcher shelling out to skopeo and umoci
pub struct SkopeoUmoci;

#[async_trait::async_trait]
impl ImageFetcher for SkopeoUmoci {
    async fn fetch(
        &self,
        image_ref: &str,
        layout_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let oci_dest = format!("oci:{}:latest", layout_dir.display());

        // Local daemon first, remote registry as fallback
        let local = ToolCommand::new("skopeo")
            .arg("copy")
            .arg(format!("docker-daemon:{}", image_ref))
            .arg(&oci_dest)
            .run(cancel)
            .await;

        match local {
            Ok(_) => {
                debug!("Copied from local daemon");
                Ok(())
            }
            Err(FledgeError::Cancelled) => Err(FledgeError::Cancelled),
            Err(local_err) => {
                debug!("Local daemon copy failed, trying remote registry: {}", local_err);

                ToolCommand::new("skopeo")
                    .arg("copy")
                    .arg(format!("docker://{}", image_ref))
                    .arg(&oci_dest)
                    .run(cancel)
                    .await
                    .map_err(|e| match e {
                        FledgeError::ToolFailure { output, .. } => {
                            FledgeError::ImageNotFound(format!("{}: {}", image_ref, output))
                        }
                        other => other,
                    })?;

                debug!("Copied from remote registry");
                Ok(())
            }
        }
    }

    async fn unpack(
        &self,
        layout_dir: &Path,
        unpack_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ToolCommand::new("umoci")
            .args(["unpack", "--image"])
            .arg(format!("{}:latest", layout_dir.display()))
            .arg(unpack_dir)
            .run(cancel)
            .await
            .map_err(|e| match e {
                FledgeError::ToolFailure { output, .. } => FledgeError::UnpackFailed(output),
                other => other,
            })?;

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct OciIndex {
    #[serde(default)]
    manifests: Vec<OciDescriptor>,
}

#[derive(Debug, Default, Deserialize)]
struct OciDescriptor {
    #[serde(default)]
    digest: String,
}

#[derive(Debug, Deserialize)]
struct OciManifestDoc {
    #[serde(default)]
    config: OciDescriptor,
}

/// Copy the image config JSON to `<rootfs>/etc/<sidecar>` for the guest agent.
///
/// Best-effort: a missing index, manifest, or config blob skips the step.
pub async fn extract_config_sidecar(layout_dir: &Path, rootfs: &Path) -> Result<()> {
    let index_path = layout_dir.join("index.json");
    let index_data = match tokio::fs::read(&index_path).await {
        Ok(data) => data,
        Err(_) => {
            debug!("No index.json found, skipping OCI config extraction");
            return Ok(());
        }
    };

    let Ok(index) = serde_json::from_slice::<OciIndex>(&index_data) else {
        debug!("Could not parse index.json, skipping config extraction");
        return Ok(());
    };

    let Some(manifest_descriptor) = index.manifests.first() else {
        debug!("No manifests found in index.json");
        return Ok(());
    };

    let Some(config_digest) = resolve_config_digest(layout_dir, &manifest_descriptor.digest).await
    else {
        debug!("No config digest found");
        return Ok(());
    };

    let config_blob = blob_path(layout_dir, &config_digest);
    if !config_blob.exists() {
        debug!("Config blob missing: {}", config_blob.display());
        return Ok(());
    }

    let etc_dir = rootfs.join("etc");
    mapping::create_dir_all_0755(&etc_dir)?;
    tokio::fs::copy(&config_blob, etc_dir.join(CONFIG_SIDECAR_NAME)).await?;

    info!("OCI config saved to /etc/{}", CONFIG_SIDECAR_NAME);
    Ok(())
}

/// Follow the first manifest descriptor to its config blob digest.
async fn resolve_config_digest(layout_dir: &Path, manifest_digest: &str) -> Option<String> {
    if manifest_digest.is_empty() {
        return None;
    }

    let manifest_path = blob_path(layout_dir, manifest_digest);
    let data = tokio::fs::read(&manifest_path).await.ok()?;
    let manifest: OciManifestDoc = serde_json::from_slice(&data).ok()?;

    if manifest.config.digest.is_empty() {
        return None;
    }
    Some(manifest.config.digest)
}

fn blob_path(layout_dir: &Path, digest: &str) -> std::path::PathBuf {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    layout_dir.join("blobs").join("sha256").join(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_blob(layout: &Path, digest_hex: &str, data: &[u8]) {
        let dir = layout.join("blobs/sha256");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(digest_hex), data).unwrap();
    }

    #[tokio::test]
    async fn test_sidecar_extracted_through_manifest_chain() {
        let dir = TempDir::new().unwrap();
        let layout = dir.path().join("layout");
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(&layout).unwrap();
        std::fs::create_dir_all(&rootfs).unwrap();

        let config_json = br#"{"config":{"Entrypoint":["/bin/sh"]}}"#;
        write_blob(&layout, "cfg111", config_json);
        write_blob(
            &layout,
            "man222",
            br#"{"config":{"digest":"sha256:cfg111"}}"#,
        );
        std::fs::write(
            layout.join("index.json"),
            br#"{"manifests":[{"digest":"sha256:man222"}]}"#,
        )
        .unwrap();

        extract_config_sidecar(&layout, &rootfs).await.unwrap();

        let sidecar = rootfs.join("etc").join(CONFIG_SIDECAR_NAME);
        assert_eq!(std::fs::read(&sidecar).unwrap(), config_json);
    }

    #[tokio::test]
    async fn test_missing_index_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let layout = dir.path().join("layout");
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(&layout).unwrap();
        std::fs::create_dir_all(&rootfs).unwrap();

        extract_config_sidecar(&layout, &rootfs).await.unwrap();
        assert!(!rootfs.join("etc").join(CONFIG_SIDECAR_NAME).exists());
    }

    #[tokio::test]
    async fn test_unparseable_index_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let layout = dir.path().join("layout");
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(&layout).unwrap();
        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::write(layout.join("index.json"), b"not json").unwrap();

        extract_config_sidecar(&layout, &rootfs).await.unwrap();
    }
}
