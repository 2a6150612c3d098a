// file: src/config/loader.rs
// version: 1.1.0
// guid: 06b5f3d9-7a2e-4c81-9f40-e83d15c7a6b2

//! Recipe and manifest-template loading
//!
//! Loading is read -> parse -> defaults -> validate. The TOML surface is
//! deserialized into raw mirror structs and converted into the typed model
//! before any cross-field rule runs.

use super::manifest::{self, ManifestTemplate};
use super::schema::{
    AgentSource, BuildRecipe, BusyboxSource, FilesystemSpec, InitSpec, LegacyFsKind, RootfsSource,
    SourceSpec, Strategy, DEFAULT_SQUASHFS_LEVEL, DEFAULT_OVERLAY_SIZE, RECIPE_SCHEMA_VERSION,
};
use super::validator;
use crate::{FledgeError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Load, default, and validate a build recipe from a TOML file.
pub async fn load(path: impl AsRef<Path>) -> Result<BuildRecipe> {
    let path = path.as_ref();
    info!("Loading recipe from: {}", path.display());

    let data = tokio::fs::read_to_string(path).await?;
    let raw: RawRecipe = toml::from_str(&data)?;

    let recipe = convert(raw)?;
    validator::validate(&recipe)?;

    debug!(
        "Recipe loaded: strategy={}, mappings={}",
        recipe.strategy.as_str(),
        recipe.mappings.len()
    );
    Ok(recipe)
}

/// Load, default, and validate a manifest template from a TOML file.
pub async fn load_manifest_template(path: impl AsRef<Path>) -> Result<ManifestTemplate> {
    let path = path.as_ref();
    info!("Loading manifest template from: {}", path.display());

    let data = tokio::fs::read_to_string(path).await?;
    let mut template: ManifestTemplate = toml::from_str(&data)?;

    manifest::apply_defaults(&mut template);
    manifest::validate(&template)?;

    Ok(template)
}

#[derive(Debug, Deserialize)]
struct RawRecipe {
    version: Option<String>,
    strategy: Option<String>,
    agent: Option<RawAgent>,
    init: Option<RawInit>,
    #[serde(default)]
    source: RawSource,
    filesystem: Option<RawFilesystem>,
    #[serde(default)]
    mappings: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawAgent {
    source_strategy: Option<String>,
    version: Option<String>,
    path: Option<String>,
    url: Option<String>,
    checksum: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInit {
    path: Option<String>,
    none: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSource {
    image: Option<String>,
    dockerfile: Option<String>,
    context: Option<String>,
    target: Option<String>,
    #[serde(default)]
    build_args: BTreeMap<String, String>,
    busybox_url: Option<String>,
    busybox_sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFilesystem {
    #[serde(rename = "type")]
    kind: Option<String>,
    compression_level: Option<i64>,
    overlay_size: Option<String>,
    size_buffer_mb: Option<i64>,
    preallocate: Option<bool>,
}

/// Convert the raw TOML shape into the typed model, applying defaults.
fn convert(raw: RawRecipe) -> Result<BuildRecipe> {
    let version = match raw.version {
        Some(v) if !v.is_empty() => v,
        _ => return Err(FledgeError::config("version", "'version' field is required")),
    };
    if version != RECIPE_SCHEMA_VERSION {
        return Err(FledgeError::config(
            "version",
            format!("unsupported config version '{}', expected '1'", version),
        ));
    }

    let strategy = match raw.strategy.as_deref() {
        None | Some("") => {
            return Err(FledgeError::config("strategy", "'strategy' field is required"))
        }
        Some("oci_rootfs") => Strategy::OciRootfs,
        Some("initramfs") => Strategy::Initramfs,
        Some(other) => {
            return Err(FledgeError::config(
                "strategy",
                format!("invalid strategy '{}', must be 'oci_rootfs' or 'initramfs'", other),
            ))
        }
    };

    let init = convert_init(raw.init)?;
    let mut agent = raw.agent.map(convert_agent).transpose()?;

    // Default agent only in default init mode; custom and none modes forbid one.
    if strategy == Strategy::Initramfs && agent.is_none() && init == InitSpec::Default {
        agent = Some(AgentSource::default_release());
    }

    let source = convert_source(raw.source, strategy)?;

    let filesystem = match strategy {
        // Ignored for initramfs builds
        Strategy::Initramfs => None,
        Strategy::OciRootfs => Some(match raw.filesystem {
            None => FilesystemSpec::default_squashfs(),
            Some(fs) => convert_filesystem(fs)?,
        }),
    };

    Ok(BuildRecipe {
        version,
        strategy,
        agent,
        init,
        source,
        filesystem,
        mappings: raw.mappings,
    })
}

/// Determine the init mode from the raw `[init]` table.
///
/// Absent table or empty table means the default mode; `none = true` and a
/// non-empty `path` are mutually exclusive.
fn convert_init(raw: Option<RawInit>) -> Result<InitSpec> {
    let Some(raw) = raw else {
        return Ok(InitSpec::Default);
    };

    let none = raw.none.unwrap_or(false);
    let path = raw.path.unwrap_or_default();

    match (none, path.is_empty()) {
        (true, false) => Err(FledgeError::config(
            "init",
            "[init] cannot specify both none=true and path",
        )),
        (true, true) => Ok(InitSpec::None),
        (false, false) => Ok(InitSpec::Custom {
            path: PathBuf::from(path),
        }),
        (false, true) => Ok(InitSpec::Default),
    }
}

fn convert_agent(raw: RawAgent) -> Result<AgentSource> {
    match raw.source_strategy.as_deref() {
        None | Some("") => Err(FledgeError::config(
            "agent.source_strategy",
            "'agent.source_strategy' is required",
        )),
        Some("release") => match raw.version {
            Some(version) if !version.is_empty() => Ok(AgentSource::Release { version }),
            _ => Err(FledgeError::config(
                "agent.version",
                "'agent.version' is required when using 'release' source strategy",
            )),
        },
        Some("local") => match raw.path {
            Some(path) if !path.is_empty() => Ok(AgentSource::Local {
                path: PathBuf::from(path),
            }),
            _ => Err(FledgeError::config(
                "agent.path",
                "'agent.path' is required when using 'local' source strategy",
            )),
        },
        Some("http") => match raw.url {
            Some(url) if !url.is_empty() => Ok(AgentSource::Http {
                url,
                checksum: raw.checksum.filter(|c| !c.is_empty()),
            }),
            _ => Err(FledgeError::config(
                "agent.url",
                "'agent.url' is required when using 'http' source strategy",
            )),
        },
        Some(other) => Err(FledgeError::config(
            "agent.source_strategy",
            format!(
                "invalid agent.source_strategy '{}', must be one of: release, local, http",
                other
            ),
        )),
    }
}

fn convert_source(raw: RawSource, strategy: Strategy) -> Result<SourceSpec> {
    let image = raw.image.filter(|s| !s.is_empty());
    let dockerfile = raw.dockerfile.filter(|s| !s.is_empty());

    let rootfs = match (image, dockerfile) {
        (Some(_), Some(_)) => {
            return Err(FledgeError::config(
                "source",
                "only one of 'source.image' or 'source.dockerfile' may be specified",
            ))
        }
        (Some(reference), None) => RootfsSource::Image { reference },
        (None, Some(path)) => RootfsSource::Dockerfile {
            path: PathBuf::from(path),
            context: raw.context.filter(|s| !s.is_empty()).map(PathBuf::from),
            target: raw.target.filter(|s| !s.is_empty()),
            build_args: raw.build_args,
        },
        (None, None) => RootfsSource::None,
    };

    // The pinned sha belongs to the pinned binary; a custom URL without a
    // checksum downloads unverified (with a warning at install time).
    let busybox = match strategy {
        Strategy::Initramfs => Some(match raw.busybox_url.filter(|s| !s.is_empty()) {
            None => BusyboxSource::default(),
            Some(url) => BusyboxSource {
                url,
                sha256: raw.busybox_sha256.unwrap_or_default(),
            },
        }),
        Strategy::OciRootfs => None,
    };

    Ok(SourceSpec { rootfs, busybox })
}

fn convert_filesystem(raw: RawFilesystem) -> Result<FilesystemSpec> {
    let kind = raw.kind.unwrap_or_else(|| "squashfs".to_string());

    match kind.as_str() {
        "squashfs" => {
            let level = raw.compression_level.unwrap_or(0);
            if !(0..=22).contains(&level) {
                return Err(FledgeError::config(
                    "filesystem.compression_level",
                    format!("squashfs compression_level must be between 0-22, got {}", level),
                ));
            }
            // Level 0 means unset
            let compression_level = if level == 0 {
                DEFAULT_SQUASHFS_LEVEL
            } else {
                level as u32
            };
            let overlay_size = match raw.overlay_size {
                Some(size) if !size.is_empty() => size,
                _ => DEFAULT_OVERLAY_SIZE.to_string(),
            };
            Ok(FilesystemSpec::Squashfs {
                compression_level,
                overlay_size,
            })
        }
        "ext4" | "xfs" | "btrfs" => {
            let size_buffer_mb = raw.size_buffer_mb.unwrap_or(0);
            if size_buffer_mb < 0 {
                return Err(FledgeError::config(
                    "filesystem.size_buffer_mb",
                    format!("filesystem.size_buffer_mb must be non-negative, got {}", size_buffer_mb),
                ));
            }
            let kind = match kind.as_str() {
                "ext4" => LegacyFsKind::Ext4,
                "xfs" => LegacyFsKind::Xfs,
                _ => LegacyFsKind::Btrfs,
            };
            Ok(FilesystemSpec::Legacy {
                kind,
                size_buffer_mb: size_buffer_mb as u64,
                preallocate: raw.preallocate.unwrap_or(false),
            })
        }
        other => Err(FledgeError::config(
            "filesystem.type",
            format!(
                "invalid filesystem type '{}', must be one of: squashfs (recommended), ext4, xfs, btrfs",
                other
            ),
        )),
    }
}
