// file: src/builder/resources.rs
// version: 1.0.0
// guid: 58c0d9e4-7f23-4a61-b85d-2e94a6f10c38

//! Scoped block-device resources
//!
//! Loop devices and mounts are held by guard values. Release is explicit and
//! idempotent ("not mounted" and "No such device" are non-errors); drop runs
//! a synchronous best-effort release so no device outlives a failed build.

use crate::process::ToolCommand;
use crate::Result;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An attached loop device
#[derive(Debug)]
pub struct LoopDevice {
    device: String,
    attached: bool,
}

impl LoopDevice {
    /// Find a free loop device and attach it to `image`.
    pub async fn attach(image: &Path, cancel: &CancellationToken) -> Result<Self> {
        let output = ToolCommand::new("losetup")
            .args(["--find", "--show"])
            .arg(image)
            .run(cancel)
            .await?;

        let device = output.stdout.trim().to_string();
        if device.is_empty() {
            return Err(crate::FledgeError::ToolFailure {
                tool: "losetup".to_string(),
                status: output.status,
                output: "losetup did not return a device path".to_string(),
            });
        }

        debug!("Attached loop device: {}", device);
        Ok(Self {
            device,
            attached: true,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Detach the device. Safe to call more than once.
    pub async fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }

        // Cleanup must proceed even when the build token is cancelled
        let token = CancellationToken::new();
        ToolCommand::new("losetup")
            .arg("-d")
            .arg(&self.device)
            .tolerate("No such device")
            .run(&token)
            .await?;

        self.attached = false;
        debug!("Detached loop device: {}", self.device);
        Ok(())
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        match std::process::Command::new("losetup")
            .arg("-d")
            .arg(&self.device)
            .output()
        {
            Ok(out) if out.status.success() => {
                debug!("Detached loop device on drop: {}", self.device)
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                if !stderr.contains("No such device") {
                    warn!("Failed to detach loop device {}: {}", self.device, stderr.trim());
                }
            }
            Err(e) => warn!("Failed to detach loop device {}: {}", self.device, e),
        }
    }
}

/// A mounted filesystem
#[derive(Debug)]
pub struct MountGuard {
    mount_point: PathBuf,
    mounted: bool,
}

impl MountGuard {
    /// Mount `device` at `mount_point`.
    pub async fn mount(device: &str, mount_point: &Path, cancel: &CancellationToken) -> Result<Self> {
        ToolCommand::new("mount")
            .arg(device)
            .arg(mount_point)
            .run(cancel)
            .await?;

        debug!("Mounted {} at {}", device, mount_point.display());
        Ok(Self {
            mount_point: mount_point.to_path_buf(),
            mounted: true,
        })
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Unmount. Safe to call more than once.
    pub async fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }

        let token = CancellationToken::new();
        ToolCommand::new("umount")
            .arg(&self.mount_point)
            .tolerate("not mounted")
            .run(&token)
            .await?;

        self.mounted = false;
        debug!("Unmounted {}", self.mount_point.display());
        Ok(())
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        match std::process::Command::new("umount")
            .arg(&self.mount_point)
            .output()
        {
            Ok(out) if out.status.success() => {
                debug!("Unmounted on drop: {}", self.mount_point.display())
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                if !stderr.contains("not mounted") {
                    warn!(
                        "Failed to unmount {}: {}",
                        self.mount_point.display(),
                        stderr.trim()
                    );
                }
            }
            Err(e) => warn!("Failed to unmount {}: {}", self.mount_point.display(), e),
        }
    }
}
