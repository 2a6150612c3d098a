// file: src/preflight/mod.rs
// version: 1.0.0
// guid: 6f17d3a8-42cb-4e90-b5f6-09e8c2d471a5

//! External tool preflight
//!
//! A build shells out to different tools depending on the strategy,
//! filesystem kind, and init mode. The front-end can run this check before
//! starting a build to report every missing tool at once instead of failing
//! midway through.

use crate::config::schema::{
    BuildRecipe, FilesystemSpec, InitSpec, LegacyFsKind, RootfsSource, Strategy,
};
use crate::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The external tools this recipe's build will invoke.
pub fn required_tools(recipe: &BuildRecipe) -> Vec<&'static str> {
    let mut tools: Vec<&'static str> = Vec::new();

    if matches!(recipe.source.rootfs, RootfsSource::Image { .. }) {
        tools.extend(["skopeo", "umoci"]);
    }

    match recipe.strategy {
        Strategy::Initramfs => {
            tools.extend(["sh", "find", "sort", "cpio", "gzip", "uname"]);
            if recipe.init == InitSpec::Default {
                tools.push("gcc");
            }
        }
        Strategy::OciRootfs => match &recipe.filesystem {
            Some(FilesystemSpec::Squashfs { .. }) | None => {
                tools.push("mksquashfs");
            }
            Some(FilesystemSpec::Legacy {
                kind, preallocate, ..
            }) => {
                tools.extend(["du", "losetup", "mount", "umount"]);
                tools.push(match kind {
                    LegacyFsKind::Ext4 => "mkfs.ext4",
                    LegacyFsKind::Xfs => "mkfs.xfs",
                    LegacyFsKind::Btrfs => "mkfs.btrfs",
                });
                tools.push(if *preallocate { "fallocate" } else { "dd" });
                if matches!(kind, LegacyFsKind::Ext4) {
                    tools.extend(["e2fsck", "dumpe2fs", "resize2fs"]);
                }
            }
        },
    }

    tools.sort_unstable();
    tools.dedup();
    tools
}

/// Verify that every tool the build needs is on PATH.
pub fn check(recipe: &BuildRecipe) -> Result<()> {
    let tools = required_tools(recipe);
    info!("Checking prerequisites: {} tools", tools.len());

    let missing: Vec<&str> = tools
        .iter()
        .copied()
        .filter(|tool| find_in_path(tool).is_none())
        .collect();

    if !missing.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("required tools not found on PATH: {}", missing.join(", ")),
        )
        .into());
    }

    debug!("All required tools available");
    Ok(())
}

/// Locate an executable on PATH.
fn find_in_path(tool: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;

    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(tool);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    None
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(info) => info.is_file() && info.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{AgentSource, SourceSpec};
    use std::collections::BTreeMap;

    fn initramfs_recipe() -> BuildRecipe {
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
    fn test_initramfs_default_mode_needs_compiler() {
        let tools = required_tools(&initramfs_recipe());
        assert!(tools.contains(&"gcc"));
        assert!(tools.contains(&"cpio"));
        assert!(!tools.contains(&"mksquashfs"));
    }

    #[test]
    fn test_initramfs_none_mode_skips_compiler() {
        let mut recipe = initramfs_recipe();
        recipe.init = InitSpec::None;
        recipe.agent = None;

        let tools = required_tools(&recipe);
        assert!(!tools.contains(&"gcc"));
    }

    #[test]
    fn test_image_source_needs_oci_tools() {
        let mut recipe = initramfs_recipe();
        recipe.source.rootfs = RootfsSource::Image {
            reference: "alpine:3.19".to_string(),
        };

        let tools = required_tools(&recipe);
        assert!(tools.contains(&"skopeo"));
        assert!(tools.contains(&"umoci"));
    }

    #[test]
    fn test_ext4_needs_shrink_tools() {
        let mut recipe = initramfs_recipe();
        recipe.strategy = Strategy::OciRootfs;
        recipe.init = InitSpec::Default;
        recipe.source.rootfs = RootfsSource::Image {
            reference: "alpine:3.19".to_string(),
        };
        recipe.filesystem = Some(FilesystemSpec::Legacy {
            kind: LegacyFsKind::Ext4,
            size_buffer_mb: 0,
            preallocate: false,
        });

        let tools = required_tools(&recipe);
        for tool in ["mkfs.ext4", "e2fsck", "dumpe2fs", "resize2fs", "losetup", "dd"] {
            assert!(tools.contains(&tool), "missing {}", tool);
        }
        assert!(!tools.contains(&"fallocate"));
    }

    #[test]
    fn test_squashfs_needs_mksquashfs_only() {
        let mut recipe = initramfs_recipe();
        recipe.strategy = Strategy::OciRootfs;
        recipe.source.rootfs = RootfsSource::Image {
            reference: "alpine:3.19".to_string(),
        };
        recipe.filesystem = Some(FilesystemSpec::default_squashfs());

        let tools = required_tools(&recipe);
        assert!(tools.contains(&"mksquashfs"));
        assert!(!tools.contains(&"losetup"));
    }

    #[test]
    fn test_find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-tool-name").is_none());
    }
}
