// file: src/config/validator.rs
// version: 1.0.1
// guid: 1c8f62ad-49e3-4b07-a2d6-5f90c3e817d4

//! Cross-field recipe validation

use super::schema::{BuildRecipe, FilesystemSpec, InitSpec, RootfsSource, Strategy};
use crate::{FledgeError, Result};
use std::collections::BTreeMap;

/// Validate a converted recipe for correctness and completeness.
pub fn validate(recipe: &BuildRecipe) -> Result<()> {
    match recipe.strategy {
        Strategy::OciRootfs => validate_oci_rootfs(recipe)?,
        Strategy::Initramfs => validate_initramfs(recipe)?,
    }

    validate_mappings(&recipe.mappings)
}

fn validate_oci_rootfs(recipe: &BuildRecipe) -> Result<()> {
    if matches!(recipe.source.rootfs, RootfsSource::None) {
        return Err(FledgeError::config(
            "source",
            "either 'source.image' or 'source.dockerfile' is required for oci_rootfs strategy",
        ));
    }

    let Some(filesystem) = &recipe.filesystem else {
        return Err(FledgeError::config(
            "filesystem",
            "'filesystem' section is required for oci_rootfs strategy",
        ));
    };

    match filesystem {
        FilesystemSpec::Squashfs {
            compression_level,
            overlay_size,
        } => {
            if *compression_level > 22 {
                return Err(FledgeError::config(
                    "filesystem.compression_level",
                    format!(
                        "squashfs compression_level must be between 0-22, got {}",
                        compression_level
                    ),
                ));
            }
            if overlay_size.is_empty() {
                return Err(FledgeError::config(
                    "filesystem.overlay_size",
                    "squashfs overlay_size is required",
                ));
            }
            if crate::utils::size::parse_size(overlay_size).is_none() {
                return Err(FledgeError::config(
                    "filesystem.overlay_size",
                    format!("invalid size string '{}'", overlay_size),
                ));
            }
        }
        FilesystemSpec::Legacy { .. } => {}
    }

    Ok(())
}

fn validate_initramfs(recipe: &BuildRecipe) -> Result<()> {
    // Agent presence is implied by the init mode
    match &recipe.init {
        InitSpec::Default => {
            if recipe.agent.is_none() {
                return Err(FledgeError::config(
                    "agent",
                    "'agent' section is required for default init mode (no [init] section)",
                ));
            }
        }
        InitSpec::Custom { .. } => {
            if recipe.agent.is_some() {
                return Err(FledgeError::config(
                    "agent",
                    "'agent' section cannot be specified with custom init mode ([init] path set)",
                ));
            }
        }
        InitSpec::None => {
            if recipe.agent.is_some() {
                return Err(FledgeError::config(
                    "agent",
                    "'agent' section cannot be specified with no-init mode ([init] none=true)",
                ));
            }
        }
    }

    Ok(())
}

fn validate_mappings(mappings: &BTreeMap<String, String>) -> Result<()> {
    for (src, dst) in mappings {
        if src.is_empty() {
            return Err(FledgeError::config(
                "mappings",
                "mapping source path cannot be empty",
            ));
        }
        if dst.is_empty() {
            return Err(FledgeError::config(
                "mappings",
                format!("mapping destination cannot be empty for source '{}'", src),
            ));
        }
        if !dst.starts_with('/') {
            return Err(FledgeError::config(
                "mappings",
                format!("mapping destination '{}' must be an absolute path (start with /)", dst),
            ));
        }
        if dst.contains("..") {
            return Err(FledgeError::config(
                "mappings",
                format!("mapping destination '{}' contains '..' which is not allowed", dst),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{AgentSource, SourceSpec};
    use std::path::PathBuf;

    fn minimal_initramfs() -> BuildRecipe {
        BuildRecipe {
            version: "1".to_string(),
            strategy: Strategy::Initramfs,
            agent: Some(AgentSource::default_release()),
            init: InitSpec::Default,
            source: SourceSpec {
                rootfs: RootfsSource::None,
                busybox: Some(Default::default()),
            },
            filesystem: None,
            mappings: BTreeMap::new(),
        }
    }

    #[test]
    fn test_initramfs_default_mode_requires_agent() {
        let mut recipe = minimal_initramfs();
        recipe.agent = None;

        let err = validate(&recipe).unwrap_err();
        assert!(err.to_string().contains("agent"));
    }

    #[test]
    fn test_initramfs_custom_init_rejects_agent() {
        let mut recipe = minimal_initramfs();
        recipe.init = InitSpec::Custom {
            path: PathBuf::from("./my-init"),
        };

        let err = validate(&recipe).unwrap_err();
        assert!(err.to_string().contains("custom init mode"));
    }

    #[test]
    fn test_initramfs_none_init_rejects_agent() {
        let mut recipe = minimal_initramfs();
        recipe.init = InitSpec::None;

        let err = validate(&recipe).unwrap_err();
        assert!(err.to_string().contains("no-init mode"));
    }

    #[test]
    fn test_mapping_destination_must_be_absolute() {
        let mut recipe = minimal_initramfs();
        recipe
            .mappings
            .insert("payload/app".to_string(), "usr/bin/app".to_string());

        let err = validate(&recipe).unwrap_err();
        assert!(err.to_string().contains("absolute path"));
    }

    #[test]
    fn test_mapping_destination_rejects_dotdot() {
        let mut recipe = minimal_initramfs();
        recipe
            .mappings
            .insert("payload/app".to_string(), "/usr/../etc/app".to_string());

        let err = validate(&recipe).unwrap_err();
        assert!(err.to_string().contains(".."));
    }

    #[test]
    fn test_overlay_size_must_parse() {
        let recipe = BuildRecipe {
            version: "1".to_string(),
            strategy: Strategy::OciRootfs,
            agent: None,
            init: InitSpec::Default,
            source: SourceSpec {
                rootfs: RootfsSource::Image {
                    reference: "alpine:3.19".to_string(),
                },
                busybox: None,
            },
            filesystem: Some(FilesystemSpec::Squashfs {
                compression_level: 15,
                overlay_size: "lots".to_string(),
            }),
            mappings: BTreeMap::new(),
        };

        let err = validate(&recipe).unwrap_err();
        assert!(err.to_string().contains("invalid size string"));
    }

    #[test]
    fn test_oci_rootfs_requires_source() {
        let recipe = BuildRecipe {
            version: "1".to_string(),
            strategy: Strategy::OciRootfs,
            agent: None,
            init: InitSpec::Default,
            source: SourceSpec::default(),
            filesystem: Some(FilesystemSpec::default_squashfs()),
            mappings: BTreeMap::new(),
        };

        let err = validate(&recipe).unwrap_err();
        assert!(err.to_string().contains("source.image"));
    }
}
