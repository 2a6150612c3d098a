// file: src/builder/rootfs.rs
// version: 1.0.1
// guid: 3d85c2f9-01ae-47b6-8d24-c96f0e73a5b8

//! Rootfs staging
//!
//! Assembles the working rootfs tree: FHS skeleton, source-image overlay,
//! agent installation, and the essential directories a Dockerfile exporter
//! may omit.

use super::mapping;
use crate::config::schema::AGENT_BINARY_NAME;
use crate::{FledgeError, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

/// FHS skeleton created for every staged rootfs
pub const FHS_SKELETON_DIRS: [&str; 12] = [
    "bin", "sbin", "etc", "proc", "sys", "dev", "tmp", "run", "usr/bin", "usr/sbin", "usr/lib",
    "var/log",
];

/// Directories a Dockerfile exporter may omit but the agent install needs
const ESSENTIAL_DIRS: [&str; 8] = [
    "bin",
    "usr",
    "usr/bin",
    "usr/local",
    "usr/local/bin",
    "etc",
    "tmp",
    "var",
];

/// Create the FHS directory skeleton under `rootfs`, all at mode 0755.
pub fn stage_skeleton(rootfs: &Path) -> Result<()> {
    info!("Setting up directory structure");

    for dir in FHS_SKELETON_DIRS {
        mapping::create_dir_all_0755(&rootfs.join(dir))?;
    }

    debug!("Directory structure created");
    Ok(())
}

/// Ensure the directories a Dockerfile export may have dropped.
pub fn ensure_essential_dirs(rootfs: &Path) -> Result<()> {
    for dir in ESSENTIAL_DIRS {
        mapping::create_dir_all_0755(&rootfs.join(dir))?;
    }
    debug!("Essential FHS directories ensured");
    Ok(())
}

/// Merge `src_root` onto `dst_root`, preserving file modes and symlinks.
///
/// Existing directories are kept; file collisions favor the source. Symlinks
/// are re-created with the original target string.
pub fn overlay_tree(src_root: &Path, dst_root: &Path, cancel: &CancellationToken) -> Result<()> {
    for entry in WalkDir::new(src_root).min_depth(1) {
        if cancel.is_cancelled() {
            return Err(FledgeError::Cancelled);
        }

        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src_root)
            .expect("walkdir yields paths under its root");
        let dst = dst_root.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            mapping::create_dir_all_0755(&dst)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            // Replace whatever is there to avoid dangling copies
            if let Ok(existing) = dst.symlink_metadata() {
                if existing.is_dir() {
                    std::fs::remove_dir_all(&dst)?;
                } else {
                    std::fs::remove_file(&dst)?;
                }
            }
            std::os::unix::fs::symlink(&target, &dst)?;
        } else {
            if let Some(parent) = dst.parent() {
                mapping::create_dir_all_0755(parent)?;
            }
            if dst.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                std::fs::remove_file(&dst)?;
            }
            std::fs::copy(entry.path(), &dst)?;
        }
    }

    Ok(())
}

/// Install the agent binary at `<rootfs>/bin/<agent>` with mode 0755.
pub fn install_agent_binary(rootfs: &Path, agent_path: &Path) -> Result<()> {
    let bin_dir = rootfs.join("bin");
    ensure_dest_dir(rootfs, &bin_dir)?;

    let dest = bin_dir.join(AGENT_BINARY_NAME);
    mapping::copy_file(agent_path, &dest, 0o755)?;

    info!("Agent installed at /bin/{}", AGENT_BINARY_NAME);
    Ok(())
}

/// Ensure a destination directory exists inside the rootfs.
///
/// A symlinked directory is followed only when its canonicalized target stays
/// within the rootfs; escapes are rejected as unsafe.
pub fn ensure_dest_dir(rootfs: &Path, dir: &Path) -> Result<()> {
    match std::fs::symlink_metadata(dir) {
        Ok(info) if info.file_type().is_symlink() => {
            let target = std::fs::read_link(dir)?;
            let target_path = resolve_symlink_target(rootfs, dir, &target);

            if target_path.strip_prefix(rootfs).is_err() {
                return Err(FledgeError::UnsafeSymlink {
                    link: dir.to_path_buf(),
                    target: target.to_string_lossy().into_owned(),
                });
            }

            mapping::create_dir_all_0755(&target_path)?;
            Ok(())
        }
        Ok(info) if !info.is_dir() => Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a directory", dir.display()),
        )
        .into()),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            mapping::create_dir_all_0755(dir)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolve a symlink target lexically against the rootfs.
fn resolve_symlink_target(rootfs: &Path, link: &Path, target: &Path) -> PathBuf {
    let joined = if target.is_absolute() {
        rootfs.join(target.strip_prefix("/").unwrap_or(target))
    } else {
        link.parent().unwrap_or(rootfs).join(target)
    };
    lexical_clean(&joined)
}

/// Normalize `.` and `..` components without touching the filesystem.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Set a file's permissions to `mode`.
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_skeleton_dirs_created_at_0755() {
        let dir = TempDir::new().unwrap();
        stage_skeleton(dir.path()).unwrap();

        for sub in FHS_SKELETON_DIRS {
            let path = dir.path().join(sub);
            assert!(path.is_dir(), "missing {}", sub);
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o755, "{} must be 0755", sub);
        }
    }

    #[test]
    fn test_overlay_preserves_symlinks_and_favors_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");

        std::fs::create_dir_all(src.join("etc")).unwrap();
        std::fs::write(src.join("etc/hosts"), b"overlay").unwrap();
        std::os::unix::fs::symlink("hosts", src.join("etc/hosts.link")).unwrap();

        std::fs::create_dir_all(dst.join("etc")).unwrap();
        std::fs::write(dst.join("etc/hosts"), b"skeleton").unwrap();

        let cancel = CancellationToken::new();
        overlay_tree(&src, &dst, &cancel).unwrap();

        assert_eq!(std::fs::read(dst.join("etc/hosts")).unwrap(), b"overlay");
        assert_eq!(
            std::fs::read_link(dst.join("etc/hosts.link")).unwrap(),
            PathBuf::from("hosts")
        );
    }

    #[test]
    fn test_install_agent_into_plain_bin() {
        let dir = TempDir::new().unwrap();
        stage_skeleton(dir.path()).unwrap();

        let agent = dir.path().join("agent-src");
        std::fs::write(&agent, b"\x7fELF-agent").unwrap();

        install_agent_binary(dir.path(), &agent).unwrap();

        let installed = dir.path().join("bin").join(AGENT_BINARY_NAME);
        assert_eq!(std::fs::read(&installed).unwrap(), b"\x7fELF-agent");
        let mode = std::fs::metadata(&installed).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_symlinked_bin_inside_rootfs_is_followed() {
        let dir = TempDir::new().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("usr/bin")).unwrap();
        std::os::unix::fs::symlink("usr/bin", rootfs.join("bin")).unwrap();

        ensure_dest_dir(&rootfs, &rootfs.join("bin")).unwrap();
        assert!(rootfs.join("usr/bin").is_dir());
    }

    #[test]
    fn test_symlinked_bin_escaping_rootfs_is_rejected() {
        let dir = TempDir::new().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        std::os::unix::fs::symlink("../../outside", rootfs.join("bin")).unwrap();

        let err = ensure_dest_dir(&rootfs, &rootfs.join("bin")).unwrap_err();
        assert!(matches!(err, FledgeError::UnsafeSymlink { .. }));
    }

    #[test]
    fn test_lexical_clean() {
        assert_eq!(
            lexical_clean(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}
