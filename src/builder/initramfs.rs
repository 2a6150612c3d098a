// file: src/builder/initramfs.rs
// version: 1.1.0
// guid: 0b96e4d7-3c82-4f15-a6d0-84f21c7e9b53

//! Initramfs assembly
//!
//! Stages an FHS rootfs (skeleton, optional image overlay, busybox, init,
//! agent, user mappings), normalizes timestamps to a fixed epoch, and emits
//! a deterministic newc-format CPIO archive compressed with gzip.

use super::dockerfile::DockerfileBuildInput;
use super::manifest::{self, ArtifactKind};
use super::pipeline::{step, BuildContext, BuildReport};
use super::{mapping, rootfs as staging};
use crate::agent;
use crate::config::schema::{InitSpec, RootfsSource};
use crate::network::Downloader;
use crate::process::ToolCommand;
use crate::utils::checksum;
use crate::{FledgeError, Result};
use filetime::FileTime;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Timestamp applied to every archived entry (2024-01-01 00:00:00 UTC)
pub const REPRODUCIBLE_EPOCH: i64 = 1704067200;

/// Embedded C init source, compiled statically in default init mode
const INIT_C_SOURCE: &str = include_str!("embed/init.c");

/// Applets symlinked to busybox in /bin
const BUSYBOX_APPLETS: [&str; 35] = [
    "sh", "ash", "ls", "cat", "cp", "mv", "rm", "mkdir", "rmdir", "ln", "chmod", "chown", "ps",
    "kill", "mount", "umount", "grep", "sed", "awk", "find", "test", "echo", "printf", "true",
    "false", "sleep", "pwd", "cd", "env", "which", "tar", "gzip", "gunzip", "wget", "vi",
];

/// Module files needed to boot a squashfs+overlay root, when not built in
const KERNEL_MODULE_CANDIDATES: [&str; 9] = [
    "squashfs/squashfs.ko",
    "squashfs/squashfs.ko.xz",
    "squashfs/squashfs.ko.gz",
    "overlayfs/overlay.ko",
    "overlayfs/overlay.ko.xz",
    "overlayfs/overlay.ko.gz",
    "overlay.ko",
    "overlay.ko.xz",
    "overlay.ko.gz",
];

/// Builds initramfs archives
pub struct InitramfsBuilder {
    ctx: BuildContext,
}

impl InitramfsBuilder {
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }

    /// Run the initramfs pipeline to completion.
    pub async fn build(self, cancel: &CancellationToken) -> Result<BuildReport> {
        info!("Building initramfs: {}", self.ctx.output_path.display());

        let scratch = tempfile::Builder::new()
            .prefix("fledge-initramfs-")
            .tempdir()?;
        let rootfs = scratch.path().to_path_buf();
        debug!("Created rootfs directory: {}", rootfs.display());

        step("Set up directory structure", cancel, async {
            staging::stage_skeleton(&rootfs)
        })
        .await?;

        // Best-effort: most modern kernels carry squashfs and overlay built in
        match self.install_kernel_modules(&rootfs, cancel).await {
            Ok(()) => {}
            Err(FledgeError::Cancelled) => return Err(FledgeError::Cancelled),
            Err(e) => warn!(
                "Failed to install kernel modules (they may be built in to the kernel): {}",
                e
            ),
        }

        step(
            "Overlay source rootfs",
            cancel,
            self.overlay_source(&rootfs, cancel),
        )
        .await?;

        step(
            "Install busybox",
            cancel,
            self.install_busybox(&rootfs, cancel),
        )
        .await?;

        match &self.ctx.recipe.init {
            InitSpec::Default => {
                info!("Init mode: default");
                step("Compile init", cancel, self.compile_init(&rootfs, cancel)).await?;
                step(
                    "Install agent",
                    cancel,
                    self.install_agent(&rootfs, cancel),
                )
                .await?;
            }
            InitSpec::Custom { path } => {
                info!("Init mode: custom ({})", path.display());
                step(
                    "Install custom init",
                    cancel,
                    self.install_custom_init(&rootfs, path),
                )
                .await?;
            }
            InitSpec::None => {
                info!("Init mode: none; /init must be supplied via mappings");
            }
        }

        step("Apply file mappings", cancel, async {
            let mappings =
                mapping::prepare_file_mappings(&self.ctx.recipe.mappings, &self.ctx.work_dir)?;
            mapping::apply_file_mappings(&mappings, &rootfs, cancel)
        })
        .await?;

        step("Normalize timestamps", cancel, async {
            normalize_timestamps(&rootfs, cancel)
        })
        .await?;

        step(
            "Create archive",
            cancel,
            self.create_archive(&rootfs, cancel),
        )
        .await?;

        let (manifest_path, checksum) = step(
            "Generate manifest",
            cancel,
            manifest::emit(
                &self.ctx.output_path,
                self.ctx.manifest_template.as_ref(),
                &ArtifactKind::Initramfs,
            ),
        )
        .await?;

        info!("Initramfs build complete: {}", self.ctx.output_path.display());
        Ok(BuildReport {
            artifact_path: self.ctx.output_path.clone(),
            manifest_path,
            checksum,
        })
    }

    /// Copy squashfs/overlay kernel modules from the host, when present.
    async fn install_kernel_modules(
        &self,
        rootfs: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!("Installing kernel modules");

        let output = ToolCommand::new("uname").arg("-r").run(cancel).await?;
        let kernel_version = output.stdout.trim().to_string();

        let base_paths = [
            format!("/lib/modules/{}/kernel/fs", kernel_version),
            "/lib/modules/kernel/fs".to_string(),
        ];

        let modules_dir = rootfs.join("lib").join("modules");
        mapping::create_dir_all_0755(&modules_dir)?;

        let mut found_any = false;
        for base in &base_paths {
            for candidate in KERNEL_MODULE_CANDIDATES {
                let full = Path::new(base).join(candidate);
                if !full.is_file() {
                    continue;
                }
                let name = full.file_name().expect("candidate paths have file names");
                match mapping::copy_file(&full, &modules_dir.join(name), 0o644) {
                    Ok(()) => {
                        info!("Installed kernel module: {}", name.to_string_lossy());
                        found_any = true;
                    }
                    Err(e) => warn!("Failed to copy kernel module {}: {}", full.display(), e),
                }
            }
        }

        if !found_any {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no kernel modules found; squashfs and overlay must be available or built in",
            )
            .into());
        }

        Ok(())
    }

    /// Overlay a Dockerfile or OCI image rootfs onto the skeleton, if configured.
    async fn overlay_source(&self, rootfs: &Path, cancel: &CancellationToken) -> Result<()> {
        match &self.ctx.recipe.source.rootfs {
            RootfsSource::None => Ok(()),
            RootfsSource::Dockerfile {
                path,
                context,
                target,
                build_args,
            } => {
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

                let export = tempfile::Builder::new()
                    .prefix("fledge-init-df-rootfs-")
                    .tempdir()?;

                info!(
                    "Building Dockerfile for initramfs overlay: {} (context {})",
                    dockerfile.display(),
                    context_dir.display()
                );

                let input = DockerfileBuildInput {
                    dockerfile,
                    context_dir,
                    target: target.clone(),
                    build_args: build_args.clone(),
                    dest_dir: export.path().to_path_buf(),
                };
                builder.build_to_dir(&input, cancel).await?;

                staging::overlay_tree(export.path(), rootfs, cancel)
            }
            RootfsSource::Image { reference } => {
                let tmp = tempfile::Builder::new()
                    .prefix("fledge-init-overlay-")
                    .tempdir()?;
                let layout = tmp.path().join("oci-layout");
                let unpacked = tmp.path().join("unpacked");
                std::fs::create_dir_all(&layout)?;
                std::fs::create_dir_all(&unpacked)?;

                info!("Overlaying image rootfs: {}", reference);
                self.ctx.fetcher.fetch(reference, &layout, cancel).await?;
                self.ctx.fetcher.unpack(&layout, &unpacked, cancel).await?;

                staging::overlay_tree(&unpacked.join("rootfs"), rootfs, cancel)
            }
        }
    }

    /// Install busybox at /bin/busybox with applet symlinks.
    async fn install_busybox(&self, rootfs: &Path, cancel: &CancellationToken) -> Result<()> {
        let busybox_dest = rootfs.join("bin").join("busybox");

        if let Some(host_path) = &self.ctx.busybox_path {
            info!("Installing busybox from host: {}", host_path.display());
            mapping::copy_file(host_path, &busybox_dest, 0o755)?;
        } else {
            let busybox = self
                .ctx
                .recipe
                .source
                .busybox
                .as_ref()
                .ok_or_else(|| {
                    FledgeError::config("source.busybox_url", "busybox source is not configured")
                })?;

            info!("Installing busybox: {}", busybox.url);

            let downloader = Downloader::new();
            let tmp_path = downloader
                .download_to_temp(&busybox.url, true, cancel)
                .await?;

            let result = async {
                if !busybox.sha256.is_empty() {
                    info!("Verifying busybox checksum");
                    checksum::verify_checksum(&tmp_path, &busybox.sha256).await?;
                } else {
                    warn!("No busybox checksum configured, installing unverified");
                }
                mapping::copy_file(&tmp_path, &busybox_dest, 0o755)
            }
            .await;

            let _ = std::fs::remove_file(&tmp_path);
            result?;
        }

        self.create_busybox_symlinks(rootfs);

        info!("Busybox installed");
        Ok(())
    }

    /// Create applet symlinks; individual failures are warnings.
    fn create_busybox_symlinks(&self, rootfs: &Path) {
        debug!("Creating busybox symlinks");

        let bin_dir = rootfs.join("bin");
        for applet in BUSYBOX_APPLETS {
            let link = bin_dir.join(applet);
            if let Err(e) = std::os::unix::fs::symlink("busybox", &link) {
                warn!("Failed to create symlink for {}: {}", applet, e);
            }
        }
    }

    /// Compile the embedded init source statically to `<rootfs>/init`.
    async fn compile_init(&self, rootfs: &Path, cancel: &CancellationToken) -> Result<()> {
        info!("Compiling init binary");

        let source_path = rootfs.join("init.c");
        tokio::fs::write(&source_path, INIT_C_SOURCE).await?;

        let binary_path = rootfs.join("init");
        let result = ToolCommand::new("gcc")
            .args(["-static", "-Os", "-Wall", "-o"])
            .arg(&binary_path)
            .arg(&source_path)
            .run(cancel)
            .await;

        // The source must not end up in the archive
        let _ = std::fs::remove_file(&source_path);
        result?;

        staging::set_mode(&binary_path, 0o755)?;

        info!("Init binary compiled");
        Ok(())
    }

    /// Install the kestrel agent at /bin/kestrel.
    async fn install_agent(&self, rootfs: &Path, cancel: &CancellationToken) -> Result<()> {
        let Some(spec) = &self.ctx.recipe.agent else {
            return Err(FledgeError::config(
                "agent",
                "'agent' section is required for default init mode (no [init] section)",
            ));
        };

        let handle = agent::source_agent(spec, true, cancel).await?;
        staging::install_agent_binary(rootfs, handle.path())
    }

    /// Copy the user's init binary to `<rootfs>/init`.
    async fn install_custom_init(&self, rootfs: &Path, path: &Path) -> Result<()> {
        let src = self.resolve_path(path);
        if !src.exists() {
            return Err(FledgeError::MissingSource(src));
        }

        mapping::copy_file(&src, &rootfs.join("init"), 0o755)?;

        info!("Custom init installed");
        Ok(())
    }

    /// Emit the sorted newc CPIO stream and compress it deterministically.
    async fn create_archive(&self, rootfs: &Path, cancel: &CancellationToken) -> Result<()> {
        info!("Creating CPIO archive");

        if let Some(parent) = self.ctx.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_cpio = tempfile::Builder::new()
            .prefix("fledge-cpio-")
            .tempfile()?;
        let tmp_cpio_path = tmp_cpio.into_temp_path();

        // Sorted entries make the archive independent of readdir order;
        // --reproducible zeros the device and inode numbers newc would
        // otherwise copy from the staging directory
        let cpio_cmd = format!(
            "find . -print0 | LC_ALL=C sort -z | cpio --null --reproducible -o -H newc > '{}'",
            tmp_cpio_path.display()
        );
        ToolCommand::new("sh")
            .arg("-c")
            .arg(&cpio_cmd)
            .current_dir(rootfs)
            .run(cancel)
            .await?;

        info!("Compressing archive with gzip");

        // -n keeps the gzip header free of name and timestamp
        let gzip_cmd = format!(
            "gzip -n -9 < '{}' > '{}'",
            tmp_cpio_path.display(),
            self.ctx.output_path.display()
        );
        ToolCommand::new("sh").arg("-c").arg(&gzip_cmd).run(cancel).await?;

        info!("Archive created: {}", self.ctx.output_path.display());
        Ok(())
    }

    fn resolve_path(&self, path: &Path) -> std::path::PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.ctx.work_dir.join(path)
        }
    }
}

/// Pin mtime and atime of every entry to the reproducible epoch.
///
/// Per-entry failures are warnings; a build is not aborted over one
/// unsettable timestamp.
pub fn normalize_timestamps(rootfs: &Path, cancel: &CancellationToken) -> Result<()> {
    info!("Normalizing timestamps for reproducible builds");

    let epoch = FileTime::from_unix_time(REPRODUCIBLE_EPOCH, 0);

    for entry in WalkDir::new(rootfs) {
        if cancel.is_cancelled() {
            return Err(FledgeError::Cancelled);
        }
        let entry = entry.map_err(std::io::Error::from)?;
        if let Err(e) = filetime::set_symlink_file_times(entry.path(), epoch, epoch) {
            warn!("Failed to set timestamp on {}: {}", entry.path().display(), e);
        }
    }

    info!("Timestamps normalized");
    Ok(())
}
