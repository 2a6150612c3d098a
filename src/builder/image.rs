// file: src/builder/image.rs
// version: 1.1.0
// guid: 67f2a0c8-b94d-4e37-81a5-3dc60e58f912

//! Block-image assembly
//!
//! Converts a staged rootfs into a filesystem image. Squashfs images are
//! emitted directly by mksquashfs; ext4/xfs/btrfs go through the legacy
//! pipeline: allocate, mkfs, loop-mount, copy, unmount, shrink (ext4).

use super::dockerfile::DockerfileBuildInput;
use super::manifest::{self, ArtifactKind};
use super::oci;
use super::pipeline::{step, BuildContext, BuildReport};
use super::resources::{LoopDevice, MountGuard};
use super::{mapping, rootfs as staging};
use crate::agent;
use crate::config::schema::{FilesystemSpec, LegacyFsKind, RootfsSource};
use crate::process::ToolCommand;
use crate::{FledgeError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Builds OCI-derived filesystem images
pub struct ImageBuilder {
    ctx: BuildContext,
}

impl ImageBuilder {
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }

    /// Run the block-image pipeline to completion.
    pub async fn build(self, cancel: &CancellationToken) -> Result<BuildReport> {
        let Some(filesystem) = self.ctx.recipe.filesystem.clone() else {
            return Err(FledgeError::config(
                "filesystem",
                "'filesystem' section is required for oci_rootfs strategy",
            ));
        };

        let output_path = normalize_output_path(&self.ctx.output_path, &filesystem);
        info!(
            "Building OCI rootfs: {} ({})",
            output_path.display(),
            filesystem.format()
        );

        let scratch = tempfile::Builder::new().prefix("fledge-oci-").tempdir()?;
        let layout_dir = scratch.path().join("oci-layout");
        let unpacked_dir = scratch.path().join("unpacked-rootfs");
        let mount_point = scratch.path().join("mnt");
        let image_ext = match &filesystem {
            FilesystemSpec::Squashfs { .. } => ".squashfs",
            FilesystemSpec::Legacy { .. } => ".img",
        };
        let image_path = scratch.path().join(format!("fs-image{}", image_ext));

        for dir in [&layout_dir, &unpacked_dir, &mount_point] {
            std::fs::create_dir_all(dir)?;
        }
        debug!("Created temporary directories: {}", scratch.path().display());

        let rootfs = unpacked_dir.join("rootfs");

        let rootfs_ready = step(
            "Build Dockerfile (if provided)",
            cancel,
            self.build_dockerfile_if_needed(&rootfs, cancel),
        )
        .await?;

        if rootfs_ready {
            debug!("Skipping OCI fetch: rootfs built from Dockerfile");
        } else {
            step(
                "Download OCI image",
                cancel,
                self.download_image(&layout_dir, cancel),
            )
            .await?;
            step("Unpack image layers", cancel, async {
                self.ctx
                    .fetcher
                    .unpack(&layout_dir, &unpacked_dir, cancel)
                    .await
            })
            .await?;
            step(
                "Extract OCI config",
                cancel,
                oci::extract_config_sidecar(&layout_dir, &rootfs),
            )
            .await?;
        }

        step("Install agent", cancel, self.install_agent(&rootfs, cancel)).await?;

        step("Apply file mappings", cancel, async {
            let mappings =
                mapping::prepare_file_mappings(&self.ctx.recipe.mappings, &self.ctx.work_dir)?;
            mapping::apply_file_mappings(&mappings, &rootfs, cancel)
        })
        .await?;

        match &filesystem {
            FilesystemSpec::Squashfs {
                compression_level, ..
            } => {
                step(
                    "Create squashfs image",
                    cancel,
                    create_squashfs(&rootfs, &image_path, *compression_level, cancel),
                )
                .await?;
            }
            FilesystemSpec::Legacy {
                kind,
                size_buffer_mb,
                preallocate,
            } => {
                let rootfs_kb = step(
                    "Calculate disk size",
                    cancel,
                    measure_rootfs_kb(&rootfs, cancel),
                )
                .await?;
                let buffer_mb = compute_buffer_mb(*size_buffer_mb, rootfs_kb);

                step(
                    "Allocate image file",
                    cancel,
                    allocate_image(&image_path, rootfs_kb, buffer_mb, *preallocate, cancel),
                )
                .await?;
                step(
                    "Create filesystem",
                    cancel,
                    make_filesystem(&image_path, *kind, cancel),
                )
                .await?;

                let mut loop_dev = step(
                    "Attach loop device",
                    cancel,
                    LoopDevice::attach(&image_path, cancel),
                )
                .await?;
                let mut mount = step(
                    "Mount image",
                    cancel,
                    MountGuard::mount(loop_dev.device(), &mount_point, cancel),
                )
                .await?;

                step("Copy rootfs to image", cancel, async {
                    copy_tree_with_progress(&rootfs, &mount_point, cancel)
                })
                .await?;

                step("Unmount image", cancel, async {
                    mount.unmount().await?;
                    loop_dev.detach().await
                })
                .await?;

                if matches!(kind, LegacyFsKind::Ext4) {
                    step(
                        "Shrink to optimal size",
                        cancel,
                        shrink_filesystem(&image_path, *size_buffer_mb, rootfs_kb, cancel),
                    )
                    .await?;
                } else {
                    debug!("Skipping shrink for non-ext4 filesystem");
                }
            }
        }

        step("Move to final location", cancel, async {
            move_to_final(&image_path, &output_path)
        })
        .await?;

        let (manifest_path, checksum) = step(
            "Generate manifest",
            cancel,
            manifest::emit(
                &output_path,
                self.ctx.manifest_template.as_ref(),
                &ArtifactKind::BlockImage {
                    format: filesystem.format().to_string(),
                },
            ),
        )
        .await?;

        info!("OCI rootfs build complete: {}", output_path.display());
        Ok(BuildReport {
            artifact_path: output_path,
            manifest_path,
            checksum,
        })
    }

    /// Materialize the Dockerfile rootfs directly into the unpack directory.
    ///
    /// Returns true when the rootfs came from a Dockerfile and the OCI fetch
    /// should be skipped.
    async fn build_dockerfile_if_needed(
        &self,
        dest_rootfs: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let RootfsSource::Dockerfile {
            path,
            context,
            target,
            build_args,
        } = &self.ctx.recipe.source.rootfs
        else {
            return Ok(false);
        };

        let Some(builder) = &self.ctx.dockerfile_builder else {
            return Err(FledgeError::DockerfileUnsupported);
        };

        let dockerfile = self.resolve_path(path);
        let context_dir = match context {
            Some(dir) => self.resolve_path(dir),
            None => dockerfile
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.ctx.work_dir.clone()),
        };

        mapping::create_dir_all_0755(dest_rootfs)?;

        info!(
            "Building Dockerfile: {} (context {})",
            dockerfile.display(),
            context_dir.display()
        );

        let input = DockerfileBuildInput {
            dockerfile,
            context_dir,
            target: target.clone(),
            build_args: build_args.clone(),
            dest_dir: dest_rootfs.to_path_buf(),
        };
        builder.build_to_dir(&input, cancel).await?;

        if !dest_rootfs.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Dockerfile export verification failed: rootfs directory missing",
            )
            .into());
        }

        // Exporters may drop empty directories the agent install relies on
        staging::ensure_essential_dirs(dest_rootfs)?;

        info!("Dockerfile build complete; rootfs prepared");
        Ok(true)
    }

    async fn download_image(&self, layout_dir: &Path, cancel: &CancellationToken) -> Result<()> {
        let RootfsSource::Image { reference } = &self.ctx.recipe.source.rootfs else {
            return Err(FledgeError::config(
                "source",
                "either 'source.image' or 'source.dockerfile' is required for oci_rootfs strategy",
            ));
        };

        self.ctx.fetcher.fetch(reference, layout_dir, cancel).await
    }

    /// Install the agent when one is configured; block images without an
    /// agent section are left as-is.
    async fn install_agent(&self, rootfs: &Path, cancel: &CancellationToken) -> Result<()> {
        let Some(spec) = &self.ctx.recipe.agent else {
            warn!("No agent configured, skipping agent install");
            return Ok(());
        };

        mapping::create_dir_all_0755(rootfs)?;

        let handle = agent::source_agent(spec, true, cancel).await?;
        staging::install_agent_binary(rootfs, handle.path())
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.ctx.work_dir.join(path)
        }
    }
}

/// Rewrite the output extension to `.squashfs` when needed.
fn normalize_output_path(path: &Path, filesystem: &FilesystemSpec) -> PathBuf {
    if !matches!(filesystem, FilesystemSpec::Squashfs { .. }) {
        return path.to_path_buf();
    }

    let text = path.to_string_lossy();
    if text.ends_with(".squashfs") {
        path.to_path_buf()
    } else if let Some(stem) = text.strip_suffix(".img") {
        PathBuf::from(format!("{}.squashfs", stem))
    } else {
        PathBuf::from(format!("{}.squashfs", text))
    }
}

/// Map a compression level to the xz dictionary-size tier.
fn dict_size_for_level(level: u32) -> &'static str {
    match level {
        0..=7 => "25%",
        8..=15 => "50%",
        _ => "100%",
    }
}

/// Create a squashfs image with xz compression.
async fn create_squashfs(
    rootfs: &Path,
    image_path: &Path,
    compression_level: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    if !rootfs.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("rootfs directory does not exist: {}", rootfs.display()),
        )
        .into());
    }

    let dict_size = dict_size_for_level(compression_level);
    info!(
        "Creating squashfs image (level {}, dict {})",
        compression_level, dict_size
    );

    ToolCommand::new("mksquashfs")
        .arg(rootfs)
        .arg(image_path)
        .args(["-comp", "xz", "-Xdict-size", dict_size, "-noappend", "-no-progress"])
        .run(cancel)
        .await?;

    let size_mb = std::fs::metadata(image_path)?.len() as f64 / (1024.0 * 1024.0);
    info!("Squashfs image created: {:.2} MB", size_mb);

    Ok(())
}

/// Measure the staged rootfs in kilobytes via du.
async fn measure_rootfs_kb(rootfs: &Path, cancel: &CancellationToken) -> Result<u64> {
    let output = ToolCommand::new("du").arg("-sk").arg(rootfs).run(cancel).await?;

    let first = output.stdout.split_whitespace().next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("failed to parse du output: {:?}", output.stdout),
        )
    })?;

    first.parse().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("failed to parse rootfs size: {:?}", first),
        )
        .into()
    })
}

/// Buffer in MB: explicit when configured, tiered otherwise.
///
/// The tier is a quarter of the rootfs size clamped to [64, 1024] MB; the
/// floor covers agent bootstrap scratch space.
fn compute_buffer_mb(configured_mb: u64, rootfs_kb: u64) -> u64 {
    if configured_mb > 0 {
        return configured_mb;
    }

    let rootfs_mb = rootfs_kb / 1024;
    (rootfs_mb / 4).clamp(64, 1024)
}

/// Create the backing file: preallocated or sparse.
async fn allocate_image(
    image_path: &Path,
    rootfs_kb: u64,
    buffer_mb: u64,
    preallocate: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let buffer_kb = buffer_mb * 1024;
    let total_kb = rootfs_kb + buffer_kb;
    let total_bytes = total_kb * 1024;

    info!(
        "Calculated image size: rootfs {} KB, buffer {} KB, total {} KB",
        rootfs_kb, buffer_kb, total_kb
    );

    if preallocate {
        ToolCommand::new("fallocate")
            .arg("-l")
            .arg(total_bytes.to_string())
            .arg(image_path)
            .run(cancel)
            .await?;
    } else {
        ToolCommand::new("dd")
            .arg("if=/dev/zero")
            .arg(format!("of={}", image_path.display()))
            .args(["bs=1K", "count=0"])
            .arg(format!("seek={}", total_kb))
            .run(cancel)
            .await?;
    }

    debug!("Image file created: {}", image_path.display());
    Ok(())
}

/// mkfs with the type-appropriate force flag.
async fn make_filesystem(
    image_path: &Path,
    kind: LegacyFsKind,
    cancel: &CancellationToken,
) -> Result<()> {
    ToolCommand::new(format!("mkfs.{}", kind.as_str()))
        .arg(kind.force_flag())
        .arg(image_path)
        .run(cancel)
        .await?;

    debug!("Filesystem created: {}", kind.as_str());
    Ok(())
}

/// Copy the staged tree onto the mount point with a byte progress bar.
fn copy_tree_with_progress(
    src_root: &Path,
    dst_root: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut total_size = 0u64;
    for entry in WalkDir::new(src_root) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            total_size += entry.metadata().map_err(std::io::Error::from)?.len();
        }
    }

    let bar = ProgressBar::new(total_size);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    for entry in WalkDir::new(src_root).min_depth(1) {
        if cancel.is_cancelled() {
            bar.abandon();
            return Err(FledgeError::Cancelled);
        }

        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src_root)
            .expect("walkdir yields paths under its root");
        let dest = dst_root.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            mapping::create_dir_all_0755(&dest)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&target, &dest)?;
        } else {
            let copied = std::fs::copy(entry.path(), &dest)?;
            bar.inc(copied);
        }
    }

    bar.finish_with_message("Copy completed");
    Ok(())
}

/// Shrink an ext4 image to minimum-plus-buffer and truncate the backing file.
///
/// The rootfs measurement from allocation time is reused so the shrink buffer
/// agrees with the allocation buffer by construction.
async fn shrink_filesystem(
    image_path: &Path,
    configured_buffer_mb: u64,
    rootfs_kb: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Shrinking filesystem while preserving free space buffer");

    // e2fsck exits non-zero after repairs; that is not a failure here
    match ToolCommand::new("e2fsck")
        .args(["-f", "-y"])
        .arg(image_path)
        .run(cancel)
        .await
    {
        Ok(_) => {}
        Err(FledgeError::ToolFailure { output, .. }) => {
            debug!("e2fsck completed with non-zero exit: {}", output.trim());
        }
        Err(e) => return Err(e),
    }

    let dump = ToolCommand::new("dumpe2fs")
        .arg("-h")
        .arg(image_path)
        .run(cancel)
        .await?;
    let (current_blocks, block_size) = parse_fs_geometry(&dump.combined())?;

    let probe = ToolCommand::new("resize2fs")
        .arg("-P")
        .arg(image_path)
        .run(cancel)
        .await?;
    let min_blocks = parse_minimum_blocks(&probe.combined())?;

    let buffer_mb = compute_buffer_mb(configured_buffer_mb, rootfs_kb);
    let buffer_blocks = ((buffer_mb * 1024 * 1024) / block_size).max(1);

    let desired_blocks = (min_blocks + buffer_blocks).min(current_blocks);

    if desired_blocks < current_blocks {
        ToolCommand::new("resize2fs")
            .arg(image_path)
            .arg(desired_blocks.to_string())
            .run(cancel)
            .await?;
    }

    let fs_size = desired_blocks * block_size;
    let file = std::fs::OpenOptions::new().write(true).open(image_path)?;
    file.set_len(fs_size)?;

    info!(
        "Filesystem resized: final {:.2} MB, free buffer {} MB",
        fs_size as f64 / (1024.0 * 1024.0),
        buffer_mb
    );

    Ok(())
}

/// Pull block count and block size out of dumpe2fs header output.
fn parse_fs_geometry(output: &str) -> Result<(u64, u64)> {
    let mut blocks = 0u64;
    let mut block_size = 0u64;

    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Block count:") {
            blocks = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Block size:") {
            block_size = rest.trim().parse().unwrap_or(0);
        }
    }

    if blocks == 0 || block_size == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "failed to parse filesystem geometry from dumpe2fs",
        )
        .into());
    }

    Ok((blocks, block_size))
}

/// Parse "Estimated minimum size of the filesystem: N" from resize2fs -P.
fn parse_minimum_blocks(output: &str) -> Result<u64> {
    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("Estimated minimum size of the filesystem:") {
            if let Some(value) = line.split_whitespace().last() {
                if let Ok(blocks) = value.parse::<u64>() {
                    if blocks > 0 {
                        return Ok(blocks);
                    }
                }
            }
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("failed to parse minimum block count from resize2fs output: {:?}", output),
    )
    .into())
}

/// Move the finished image to the output path.
fn move_to_final(image_path: &Path, output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Rename fails across filesystems; fall back to copy
    match std::fs::rename(image_path, output_path) {
        Ok(()) => {}
        Err(_) => {
            std::fs::copy(image_path, output_path)?;
            let _ = std::fs::remove_file(image_path);
        }
    }

    debug!("Moved image to final location: {}", output_path.display());
    Ok(())
}
