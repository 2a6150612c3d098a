// file: src/builder/mapping.rs
// version: 1.1.0
// guid: f2c94e07-6a1d-4b58-930f-8e57d0a2c6b1

//! User file mappings
//!
//! Translates recipe mappings into concrete copy operations with
//! FHS-appropriate permissions.

use crate::{FledgeError, Result};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

/// A resolved source-to-destination file mapping
#[derive(Debug, Clone)]
pub struct FileMapping {
    /// Resolved absolute source path on the host
    pub source: PathBuf,
    /// Absolute destination path inside the artifact
    pub destination: String,
    pub is_directory: bool,
    /// Permissions resolved by the FHS policy
    pub mode: u32,
}

/// FHS paths whose files should carry execute permissions
const FHS_EXECUTABLE_PATHS: [&str; 8] = [
    "/bin/",
    "/sbin/",
    "/usr/bin/",
    "/usr/sbin/",
    "/usr/local/bin/",
    "/usr/local/sbin/",
    "/opt/bin/",
    "/opt/sbin/",
];

/// FHS paths whose shared objects should carry execute permissions
const FHS_LIBRARY_PATHS: [&str; 6] = [
    "/lib/",
    "/lib64/",
    "/usr/lib/",
    "/usr/lib64/",
    "/usr/local/lib/",
    "/usr/local/lib64/",
];

/// Prepare and validate file mappings from the recipe.
///
/// Relative sources resolve against `work_dir`; missing sources are rejected.
/// The result is sorted by destination so application order is stable.
pub fn prepare_file_mappings(
    mappings: &BTreeMap<String, String>,
    work_dir: &Path,
) -> Result<Vec<FileMapping>> {
    if mappings.is_empty() {
        return Ok(Vec::new());
    }

    info!("Preparing file mappings: {}", mappings.len());

    let mut result = Vec::with_capacity(mappings.len());
    for (src, dst) in mappings {
        let src_path = if Path::new(src).is_absolute() {
            PathBuf::from(src)
        } else {
            work_dir.join(src)
        };

        let info = match std::fs::metadata(&src_path) {
            Ok(info) => info,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FledgeError::MissingSource(PathBuf::from(src)))
            }
            Err(e) => return Err(e.into()),
        };

        let mode = determine_file_mode(dst, &info);
        debug!(
            "Mapped {} -> {} (mode {:04o}, dir={})",
            src,
            dst,
            mode,
            info.is_dir()
        );

        result.push(FileMapping {
            source: src_path,
            destination: dst.clone(),
            is_directory: info.is_dir(),
            mode,
        });
    }

    // Stable application order regardless of recipe map iteration
    result.sort_by(|a, b| a.destination.cmp(&b.destination));

    Ok(result)
}

/// Resolve the file mode for a destination path per FHS conventions.
pub fn determine_file_mode(dest_path: &str, info: &Metadata) -> u32 {
    if info.is_dir() {
        return 0o755;
    }

    let base_mode = info.permissions().mode() & 0o7777;

    // Already executable: normalize to the common patterns
    if base_mode & 0o111 != 0 {
        return normalize_executable_mode(base_mode);
    }

    if is_in_fhs_executable_path(dest_path) {
        return 0o755;
    }

    // Shared objects need the execute bit for the dynamic linker
    if is_in_fhs_library_path(dest_path) {
        return 0o755;
    }

    0o644
}

/// Set the execute bit in each user class that has the read bit.
fn normalize_executable_mode(mode: u32) -> u32 {
    let mut new_mode = mode & 0o666;
    if mode & 0o400 != 0 {
        new_mode |= 0o100;
    }
    if mode & 0o040 != 0 {
        new_mode |= 0o010;
    }
    if mode & 0o004 != 0 {
        new_mode |= 0o001;
    }
    new_mode
}

fn is_in_fhs_executable_path(path: &str) -> bool {
    FHS_EXECUTABLE_PATHS
        .iter()
        .any(|prefix| path.starts_with(prefix) || path == prefix.trim_end_matches('/'))
}

fn is_in_fhs_library_path(path: &str) -> bool {
    if !FHS_LIBRARY_PATHS
        .iter()
        .any(|prefix| path.starts_with(prefix) || path == prefix.trim_end_matches('/'))
    {
        return false;
    }

    // Only shared objects, suffix or infix: libfoo.so, libfoo.so.1.2
    let basename = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    basename.ends_with(".so") || basename.contains(".so.")
}

/// Create a directory and any missing ancestors, all at mode 0755.
///
/// `create_dir_all` alone leaves the mode to the ambient umask; artifact
/// trees need 0755 regardless. Components that already exist keep their
/// mode.
pub fn create_dir_all_0755(path: &Path) -> Result<()> {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if current.as_os_str().is_empty() || current.symlink_metadata().is_ok() {
            break;
        }
        missing.push(current.to_path_buf());
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }

    std::fs::create_dir_all(path)?;

    for dir in missing.iter().rev() {
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}

/// Copy a single file, creating parent directories and applying `mode`.
pub fn copy_file(src: &Path, dst: &Path, mode: u32) -> Result<()> {
    debug!("Copying {} -> {} ({:04o})", src.display(), dst.display(), mode);

    if let Some(parent) = dst.parent() {
        create_dir_all_0755(parent)?;
    }

    std::fs::copy(src, dst)?;
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode))?;

    Ok(())
}

/// Recursively copy a directory, applying the mode policy per file.
///
/// `dest_prefix` is the rootfs-absolute destination of `dst`, used to resolve
/// per-file modes. Symlinks are re-created with their target verbatim.
pub fn copy_directory(src: &Path, dst: &Path, dest_prefix: &str) -> Result<()> {
    debug!("Copying directory {} -> {}", src.display(), dst.display());

    create_dir_all_0755(dst)?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dst.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            create_dir_all_0755(&target)?;
        } else if file_type.is_symlink() {
            let link_target = std::fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                let _ = std::fs::remove_file(&target);
            }
            std::os::unix::fs::symlink(&link_target, &target)?;
        } else {
            let info = entry.metadata().map_err(std::io::Error::from)?;
            let dest_path = format!(
                "{}/{}",
                dest_prefix.trim_end_matches('/'),
                rel.to_string_lossy()
            );
            let mode = determine_file_mode(&dest_path, &info);
            copy_file(entry.path(), &target, mode)?;
        }
    }

    Ok(())
}

/// Apply prepared mappings to the target rootfs directory.
pub fn apply_file_mappings(
    mappings: &[FileMapping],
    target_root: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    if mappings.is_empty() {
        debug!("No file mappings to apply");
        return Ok(());
    }

    info!("Applying file mappings: {} -> {}", mappings.len(), target_root.display());

    for (i, mapping) in mappings.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(FledgeError::Cancelled);
        }

        let dst = target_root.join(mapping.destination.trim_start_matches('/'));

        if mapping.is_directory {
            copy_directory(&mapping.source, &dst, &mapping.destination)?;
        } else {
            copy_file(&mapping.source, &dst, mapping.mode)?;
        }

        info!(
            "Applied mapping {}/{}: {} -> {}",
            i + 1,
            mappings.len(),
            mapping.source.display(),
            mapping.destination
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metadata_with_mode(dir: &TempDir, mode: u32) -> Metadata {
        let path = dir.path().join(format!("fixture-{:o}", mode));
        std::fs::write(&path, b"x").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        std::fs::metadata(&path).unwrap()
    }

    #[test]
    fn test_mode_directory() {
        let dir = TempDir::new().unwrap();
        let info = std::fs::metadata(dir.path()).unwrap();
        assert_eq!(determine_file_mode("/any/path", &info), 0o755);
    }

    #[test]
    fn test_mode_fhs_executable_paths() {
        let dir = TempDir::new().unwrap();
        let info = metadata_with_mode(&dir, 0o644);

        for path in [
            "/bin/myapp",
            "/sbin/daemon",
            "/usr/bin/tool",
            "/usr/sbin/admin",
            "/usr/local/bin/custom",
            "/usr/local/sbin/service",
            "/opt/bin/vendor-tool",
        ] {
            assert_eq!(determine_file_mode(path, &info), 0o755, "path {}", path);
        }
    }

    #[test]
    fn test_mode_non_executable_paths() {
        let dir = TempDir::new().unwrap();
        let info = metadata_with_mode(&dir, 0o644);

        for path in [
            "/etc/config.yml",
            "/var/log/app.log",
            "/usr/share/doc/README.md",
            "/home/user/data.txt",
        ] {
            assert_eq!(determine_file_mode(path, &info), 0o644, "path {}", path);
        }
    }

    #[test]
    fn test_mode_library_files() {
        let dir = TempDir::new().unwrap();
        let info = metadata_with_mode(&dir, 0o644);

        for path in [
            "/lib/libc.so",
            "/lib/libc.so.6",
            "/lib64/libm.so.6",
            "/usr/lib/libssl.so",
            "/usr/lib64/libcrypto.so.1.1",
            "/usr/local/lib/libcustom.so",
        ] {
            assert_eq!(determine_file_mode(path, &info), 0o755, "path {}", path);
        }

        assert_eq!(determine_file_mode("/lib/notso.txt", &info), 0o644);
        assert_eq!(determine_file_mode("/etc/lib/config", &info), 0o644);
    }

    #[test]
    fn test_mode_preserves_executable() {
        let dir = TempDir::new().unwrap();
        let info = metadata_with_mode(&dir, 0o755);
        let mode = determine_file_mode("/home/user/script.sh", &info);
        assert_ne!(mode & 0o111, 0);
    }

    #[test]
    fn test_normalize_executable_mode() {
        // Execute follows read per user class
        assert_eq!(normalize_executable_mode(0o755), 0o755);
        assert_eq!(normalize_executable_mode(0o744), 0o755);
        assert_eq!(normalize_executable_mode(0o700), 0o700);
        assert_eq!(normalize_executable_mode(0o740), 0o750);
    }

    #[test]
    fn test_fhs_executable_path_detection() {
        assert!(is_in_fhs_executable_path("/bin/ls"));
        assert!(is_in_fhs_executable_path("/usr/local/bin/app"));
        assert!(is_in_fhs_executable_path("/opt/bin/tool"));
        assert!(!is_in_fhs_executable_path("/etc/config"));
        assert!(!is_in_fhs_executable_path("/home/user/bin/script"));
    }

    #[test]
    fn test_prepare_resolves_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("test.txt"), b"test content").unwrap();
        std::fs::write(dir.path().join("executable"), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(
            dir.path().join("executable"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("testdir")).unwrap();

        let mut mappings = BTreeMap::new();
        mappings.insert("test.txt".to_string(), "/etc/config.txt".to_string());
        mappings.insert("executable".to_string(), "/bin/myapp".to_string());
        mappings.insert("testdir".to_string(), "/opt/data".to_string());

        let result = prepare_file_mappings(&mappings, dir.path()).unwrap();
        assert_eq!(result.len(), 3);

        // Sorted by destination
        let destinations: Vec<_> = result.iter().map(|m| m.destination.as_str()).collect();
        assert_eq!(destinations, ["/bin/myapp", "/etc/config.txt", "/opt/data"]);

        for mapping in &result {
            assert!(mapping.source.is_absolute());
            assert_ne!(mapping.mode, 0);
        }
    }

    #[test]
    fn test_prepare_missing_source() {
        let dir = TempDir::new().unwrap();
        let mut mappings = BTreeMap::new();
        mappings.insert("nonexistent.txt".to_string(), "/etc/file.txt".to_string());

        let err = prepare_file_mappings(&mappings, dir.path()).unwrap_err();
        assert!(matches!(err, FledgeError::MissingSource(_)));
    }

    #[test]
    fn test_prepare_empty() {
        let dir = TempDir::new().unwrap();
        let result = prepare_file_mappings(&BTreeMap::new(), dir.path()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_create_dir_all_0755_sets_new_dirs_only() {
        let dir = TempDir::new().unwrap();
        let existing = dir.path().join("keep");
        std::fs::create_dir(&existing).unwrap();
        std::fs::set_permissions(&existing, std::fs::Permissions::from_mode(0o700)).unwrap();

        let target = existing.join("a").join("b");
        create_dir_all_0755(&target).unwrap();

        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&existing), 0o700, "existing dirs keep their mode");
        assert_eq!(mode(&existing.join("a")), 0o755);
        assert_eq!(mode(&target), 0o755);
    }

    #[test]
    fn test_copy_file_sets_mode() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.txt");
        std::fs::write(&src, b"test content").unwrap();

        let dst = dir.path().join("dest").join("target.txt");
        copy_file(&src, &dst, 0o755).unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), b"test content");
        let mode = std::fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_copy_directory_preserves_symlinks() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source");
        std::fs::create_dir_all(src.join("subdir")).unwrap();
        std::fs::write(src.join("file1.txt"), b"content1").unwrap();
        std::fs::write(src.join("subdir/file2.txt"), b"content2").unwrap();
        std::os::unix::fs::symlink("file1.txt", src.join("link1")).unwrap();

        let dst = dir.path().join("dest");
        copy_directory(&src, &dst, "/opt/data").unwrap();

        assert_eq!(std::fs::read(dst.join("file1.txt")).unwrap(), b"content1");
        assert_eq!(std::fs::read(dst.join("subdir/file2.txt")).unwrap(), b"content2");

        let link = std::fs::read_link(dst.join("link1")).unwrap();
        assert_eq!(link, PathBuf::from("file1.txt"));
    }

    #[test]
    fn test_apply_mappings() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("app");
        std::fs::write(&src, b"app content").unwrap();

        let mappings = vec![FileMapping {
            source: src,
            destination: "/bin/app".to_string(),
            is_directory: false,
            mode: 0o755,
        }];

        let target = dir.path().join("target");
        let cancel = CancellationToken::new();
        apply_file_mappings(&mappings, &target, &cancel).unwrap();

        assert_eq!(std::fs::read(target.join("bin/app")).unwrap(), b"app content");
    }

    #[test]
    fn test_apply_mappings_cancelled() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("app");
        std::fs::write(&src, b"x").unwrap();

        let mappings = vec![FileMapping {
            source: src,
            destination: "/bin/app".to_string(),
            is_directory: false,
            mode: 0o755,
        }];

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err =
            apply_file_mappings(&mappings, &dir.path().join("target"), &cancel).unwrap_err();
        assert!(matches!(err, FledgeError::Cancelled));
    }
}
