// file: src/builder/manifest.rs
// version: 1.0.0
// guid: c73e81b5-9d06-4f42-a1c8-05b6d2e94f71

//! Manifest sidecar generation
//!
//! Merges the runtime-defaults template with build metadata (artifact URL,
//! format tag, SHA-256) into `<artifact>.manifest.json`.

use crate::config::manifest::ManifestTemplate;
use crate::utils::checksum::calculate_sha256;
use crate::Result;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;

/// The kind of artifact being described, which keys the metadata block.
#[derive(Debug, Clone)]
pub enum ArtifactKind {
    /// CPIO.gz archive; metadata lands under "initramfs"
    Initramfs,
    /// Block filesystem image; metadata lands under "rootfs"
    BlockImage { format: String },
}

/// Emit the manifest sidecar next to the artifact.
///
/// Returns the sidecar path and the artifact's SHA-256.
pub async fn emit(
    artifact_path: &Path,
    template: Option<&ManifestTemplate>,
    kind: &ArtifactKind,
) -> Result<(PathBuf, String)> {
    info!("Generating manifest sidecar");

    let checksum = calculate_sha256(artifact_path).await?;
    info!("Computed artifact checksum: sha256:{}", checksum);

    let mut manifest = Map::new();

    match template {
        Some(tpl) => merge_template(&mut manifest, tpl),
        None => {
            manifest.insert("schema_version".to_string(), json!("v1"));
        }
    }

    let abs_path = tokio::fs::canonicalize(artifact_path).await?;
    let (key, format) = match kind {
        ArtifactKind::Initramfs => ("initramfs", "cpio.gz".to_string()),
        ArtifactKind::BlockImage { format } => ("rootfs", format.clone()),
    };

    manifest.insert(
        key.to_string(),
        json!({
            "url": format!("file://{}", abs_path.display()),
            "format": format,
            "checksum": format!("sha256:{}", checksum),
        }),
    );

    let manifest_path = PathBuf::from(format!("{}.manifest.json", artifact_path.display()));
    let data = serde_json::to_string_pretty(&Value::Object(manifest))?;
    tokio::fs::write(&manifest_path, data).await?;

    info!("Manifest generated: {}", manifest_path.display());
    Ok((manifest_path, checksum))
}

/// Copy template fields, leaving out empty collections.
fn merge_template(manifest: &mut Map<String, Value>, tpl: &ManifestTemplate) {
    manifest.insert("schema_version".to_string(), json!(tpl.schema_version));
    manifest.insert("name".to_string(), json!(tpl.name));
    manifest.insert("version".to_string(), json!(tpl.version));
    manifest.insert("runtime".to_string(), json!(tpl.runtime));

    if let Some(resources) = &tpl.resources {
        manifest.insert(
            "resources".to_string(),
            json!({
                "cpu_cores": resources.cpu_cores,
                "memory_mb": resources.memory_mb,
            }),
        );
    }

    if let Some(workload) = &tpl.workload {
        let mut block = Map::new();
        block.insert("entrypoint".to_string(), json!(workload.entrypoint));
        if !workload.args.is_empty() {
            block.insert("args".to_string(), json!(workload.args));
        }
        manifest.insert("workload".to_string(), Value::Object(block));
    }

    if !tpl.env.is_empty() {
        manifest.insert("env".to_string(), json!(tpl.env));
    }

    if let Some(network) = &tpl.network {
        let mut block = Map::new();
        block.insert("mode".to_string(), json!(network.mode));
        if !network.expose.is_empty() {
            let expose: Vec<Value> = network
                .expose
                .iter()
                .map(|port| {
                    let mut entry = Map::new();
                    entry.insert("port".to_string(), json!(port.port));
                    entry.insert("protocol".to_string(), json!(port.protocol));
                    if port.host_port > 0 {
                        entry.insert("host_port".to_string(), json!(port.host_port));
                    }
                    Value::Object(entry)
                })
                .collect();
            block.insert("expose".to_string(), Value::Array(expose));
        }
        manifest.insert("network".to_string(), Value::Object(block));
    }

    if !tpl.actions.is_empty() {
        let actions: Map<String, Value> = tpl
            .actions
            .iter()
            .map(|(name, action)| {
                (
                    name.clone(),
                    json!({ "path": action.path, "method": action.method }),
                )
            })
            .collect();
        manifest.insert("actions".to_string(), Value::Object(actions));
    }

    if let Some(cloud_init) = &tpl.cloud_init {
        let mut block = Map::new();
        if !cloud_init.datasource.is_empty() {
            block.insert("datasource".to_string(), json!(cloud_init.datasource));
        }
        if let Some(user_data) = &cloud_init.user_data {
            block.insert(
                "user_data".to_string(),
                json!({ "inline": user_data.inline, "content": user_data.content }),
            );
        }
        if !cloud_init.meta_data.is_empty() {
            block.insert("meta_data".to_string(), json!(cloud_init.meta_data));
        }
        if !block.is_empty() {
            manifest.insert("cloud_init".to_string(), Value::Object(block));
        }
    }

    if let Some(devices) = &tpl.devices {
        if !devices.pci_passthrough.is_empty() {
            manifest.insert(
                "devices".to_string(),
                json!({ "pci_passthrough": devices.pci_passthrough }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::manifest;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_checksum_matches_artifact_bytes() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("out.cpio.gz");
        tokio::fs::write(&artifact, b"artifact bytes").await.unwrap();

        let (manifest_path, checksum) = emit(&artifact, None, &ArtifactKind::Initramfs)
            .await
            .unwrap();

        assert_eq!(checksum, calculate_sha256(&artifact).await.unwrap());

        let data = tokio::fs::read_to_string(&manifest_path).await.unwrap();
        let parsed: Value = serde_json::from_str(&data).unwrap();
        assert_eq!(
            parsed["initramfs"]["checksum"],
            json!(format!("sha256:{}", checksum))
        );
        assert_eq!(parsed["initramfs"]["format"], json!("cpio.gz"));
        assert_eq!(parsed["schema_version"], json!("v1"));
    }

    #[tokio::test]
    async fn test_block_image_block_carries_fs_format() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("out.squashfs");
        tokio::fs::write(&artifact, b"squash").await.unwrap();

        let kind = ArtifactKind::BlockImage {
            format: "squashfs".to_string(),
        };
        let (manifest_path, _) = emit(&artifact, None, &kind).await.unwrap();

        let data = tokio::fs::read_to_string(&manifest_path).await.unwrap();
        let parsed: Value = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed["rootfs"]["format"], json!("squashfs"));
        assert!(parsed["rootfs"]["url"]
            .as_str()
            .unwrap()
            .starts_with("file:///"));
    }

    #[tokio::test]
    async fn test_template_fields_copied() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("out.cpio.gz");
        tokio::fs::write(&artifact, b"bytes").await.unwrap();

        let mut template: ManifestTemplate = toml::from_str(
            r#"
            name = "redis"
            version = "7.2.0"
            runtime = "redis"

            [workload]
            entrypoint = "/usr/bin/redis-server"
            args = ["--port", "6379"]

            [network]
            mode = "vsock"
            [[network.expose]]
            port = 6379
            "#,
        )
        .unwrap();
        manifest::apply_defaults(&mut template);

        let (manifest_path, _) = emit(&artifact, Some(&template), &ArtifactKind::Initramfs)
            .await
            .unwrap();

        let data = tokio::fs::read_to_string(&manifest_path).await.unwrap();
        let parsed: Value = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed["name"], json!("redis"));
        assert_eq!(parsed["resources"]["cpu_cores"], json!(1));
        assert_eq!(parsed["workload"]["args"][1], json!("6379"));
        assert_eq!(parsed["network"]["expose"][0]["protocol"], json!("tcp"));
    }
}
