// file: src/agent/mod.rs
// version: 1.0.0
// guid: 7b3f90e2-a64c-4d18-b7a9-52c8e1f06d34

//! Kestrel agent sourcing
//!
//! Resolves the agent binary through one of three strategies (release
//! registry, local path, custom HTTP) into a [`AgentHandle`] that owns a
//! temporary executable and cleans it up on drop.

use crate::config::schema::{AgentSource, AGENT_BINARY_NAME, AGENT_RELEASE_REPO};
use crate::network::Downloader;
use crate::utils::checksum;
use crate::{FledgeError, Result};
use serde::Deserialize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A sourced agent binary with a scoped temporary-file lifetime.
///
/// Dropping the handle unlinks the file, but only when its containing
/// directory resolves to the system temp root; files the user owns are never
/// deleted.
#[derive(Debug)]
pub struct AgentHandle {
    path: PathBuf,
}

impl AgentHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        if !is_under_temp_root(&self.path) {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Cleaned up agent file: {}", self.path.display()),
            Err(e) => warn!("Failed to clean up agent file {}: {}", self.path.display(), e),
        }
    }
}

/// Whether the file's parent directory resolves to the system temp root.
/// Symlink-aware so macOS-style /tmp links compare equal.
fn is_under_temp_root(path: &Path) -> bool {
    let Some(dir) = path.parent() else {
        return false;
    };
    let resolved_dir = std::fs::canonicalize(dir);
    let resolved_tmp = std::fs::canonicalize(std::env::temp_dir());
    matches!((resolved_dir, resolved_tmp), (Ok(d), Ok(t)) if d == t)
}

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

/// Source the agent binary per the configured strategy.
pub async fn source_agent(
    spec: &AgentSource,
    show_progress: bool,
    cancel: &CancellationToken,
) -> Result<AgentHandle> {
    match spec {
        AgentSource::Release { version } => {
            info!("Sourcing agent from release registry: {}", version);
            source_from_release(version, show_progress, cancel).await
        }
        AgentSource::Local { path } => {
            info!("Sourcing agent from local path: {}", path.display());
            source_from_local(path).await
        }
        AgentSource::Http { url, checksum } => {
            info!("Sourcing agent from HTTP: {}", url);
            source_from_http(url, checksum.as_deref(), show_progress, cancel).await
        }
    }
}

async fn source_from_release(
    version: &str,
    show_progress: bool,
    cancel: &CancellationToken,
) -> Result<AgentHandle> {
    let release_url = if version == "latest" {
        format!("https://api.github.com/repos/{}/releases/latest", AGENT_RELEASE_REPO)
    } else {
        format!(
            "https://api.github.com/repos/{}/releases/tags/{}",
            AGENT_RELEASE_REPO, version
        )
    };

    debug!("Fetching release info: {}", release_url);

    let downloader = Downloader::new();
    let response = downloader.client().get(&release_url).send().await?;
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        // The registry has no such tag
        return Err(FledgeError::AgentNotFound(version.to_string()));
    }
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(FledgeError::Registry {
            status: status.as_u16(),
            detail,
        });
    }

    let release: ReleaseInfo = response.json().await?;

    let Some(asset) = release.assets.iter().find(|a| a.name == AGENT_BINARY_NAME) else {
        return Err(FledgeError::AgentNotFound(release.tag_name));
    };

    info!(
        "Downloading {} {} from {}",
        AGENT_BINARY_NAME, release.tag_name, asset.browser_download_url
    );

    let tmp_path = downloader
        .download_to_temp(&asset.browser_download_url, show_progress, cancel)
        .await?;

    if let Err(e) = make_executable(&tmp_path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    Ok(AgentHandle { path: tmp_path })
}

async fn source_from_local(local_path: &Path) -> Result<AgentHandle> {
    let info = match tokio::fs::metadata(local_path).await {
        Ok(info) => info,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FledgeError::MissingSource(local_path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    if info.is_dir() {
        return Err(FledgeError::config(
            "agent.path",
            format!("agent path is a directory, expected a file: {}", local_path.display()),
        ));
    }

    // Copy to a temp path so all strategies share cleanup semantics
    let tmp = tempfile::Builder::new().prefix("fledge-agent-").tempfile()?;
    let tmp_path = tmp.into_temp_path().keep().map_err(|e| e.error)?;

    let result = async {
        tokio::fs::copy(local_path, &tmp_path).await?;
        make_executable(&tmp_path)
    }
    .await;

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    debug!("Agent staged at: {}", tmp_path.display());
    Ok(AgentHandle { path: tmp_path })
}

async fn source_from_http(
    url: &str,
    expected_checksum: Option<&str>,
    show_progress: bool,
    cancel: &CancellationToken,
) -> Result<AgentHandle> {
    let downloader = Downloader::new();
    let tmp_path = downloader.download_to_temp(url, show_progress, cancel).await?;

    let result = async {
        if let Some(expected) = expected_checksum {
            info!("Verifying agent checksum");
            checksum::verify_checksum(&tmp_path, expected).await?;
        } else {
            warn!("No agent checksum configured, downloading unverified");
        }
        make_executable(&tmp_path)
    }
    .await;

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    Ok(AgentHandle { path: tmp_path })
}

fn make_executable(path: &Path) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_strategy_copies_and_marks_executable() {
        let dir = TempDir::new().unwrap();
        let agent_path = dir.path().join("test-kestrel");
        let content = b"#!/bin/sh\necho 'test agent'\n";
        tokio::fs::write(&agent_path, content).await.unwrap();

        let spec = AgentSource::Local {
            path: agent_path.clone(),
        };
        let cancel = CancellationToken::new();
        let handle = source_agent(&spec, false, &cancel).await.unwrap();

        let staged = tokio::fs::read(handle.path()).await.unwrap();
        assert_eq!(staged, content);

        let mode = std::fs::metadata(handle.path()).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "staged agent must be executable");

        let staged_path = handle.path().to_path_buf();
        drop(handle);
        assert!(!staged_path.exists(), "handle drop must remove the temp copy");
    }

    #[tokio::test]
    async fn test_local_strategy_missing_file() {
        let spec = AgentSource::Local {
            path: PathBuf::from("/nonexistent/path/to/agent"),
        };
        let cancel = CancellationToken::new();

        let err = source_agent(&spec, false, &cancel).await.unwrap_err();
        assert!(matches!(err, FledgeError::MissingSource(_)));
    }

    #[tokio::test]
    async fn test_local_strategy_rejects_directory() {
        let dir = TempDir::new().unwrap();
        let spec = AgentSource::Local {
            path: dir.path().to_path_buf(),
        };
        let cancel = CancellationToken::new();

        let err = source_agent(&spec, false, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("directory"));
    }

    #[test]
    fn test_handle_drop_spares_user_files() {
        let dir = TempDir::new().unwrap();
        let user_path = dir.path().join("agent");
        std::fs::write(&user_path, b"test").unwrap();

        drop(AgentHandle {
            path: user_path.clone(),
        });

        assert!(user_path.exists(), "files outside the temp root must survive");
    }
}
