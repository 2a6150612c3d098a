// file: src/network/download.rs
// version: 1.0.1
// guid: 9f30a6b2-c84e-47d1-b5f9-3a62e8d01c47

//! HTTP downloads to scoped temporary files

use crate::{FledgeError, Result};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(test)]
#[derive(Default)]
struct MockResponses {
    download_file: Option<Result<()>>,
}

#[cfg(test)]
static MOCK_RESPONSES: OnceLock<Mutex<MockResponses>> = OnceLock::new();

#[cfg(test)]
fn mock_storage() -> &'static Mutex<MockResponses> {
    MOCK_RESPONSES.get_or_init(|| Mutex::new(MockResponses::default()))
}

#[cfg(test)]
fn take_mock_download_file() -> Option<Result<()>> {
    mock_storage().lock().unwrap().download_file.take()
}

#[cfg(test)]
pub(crate) fn set_mock_download_file(result: Result<()>) {
    mock_storage().lock().unwrap().download_file = Some(result);
}

/// HTTP downloader with progress tracking
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    /// Create a new downloader
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(30))
                .user_agent(concat!("fledge/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    /// Shared HTTP client for non-download requests (registry lookups).
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Download a URL to a fresh temporary file and return its path.
    ///
    /// The caller owns the returned path and must schedule its deletion.
    /// Any partial file is removed on failure.
    pub async fn download_to_temp(
        &self,
        url: &str,
        show_progress: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let tmp = tempfile::Builder::new()
            .prefix("fledge-download-")
            .tempfile()?;
        let path = tmp.into_temp_path().keep().map_err(|e| e.error)?;

        match self.download_file(url, &path, show_progress, cancel).await {
            Ok(()) => Ok(path),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Download a URL to a destination path.
    pub async fn download_file(
        &self,
        url: &str,
        dest: impl AsRef<Path>,
        show_progress: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let dest = dest.as_ref();

        #[cfg(test)]
        if let Some(mock) = take_mock_download_file() {
            if mock.is_ok() {
                tokio::fs::write(dest, b"mock download").await?;
            }
            return mock;
        }

        info!("Downloading: {}", url);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FledgeError::Network(format!(
                "download from {} failed with status: {}",
                url,
                response.status()
            )));
        }

        // Progress indication only when the size is known
        let bar = match response.content_length() {
            Some(total) if show_progress => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                        .unwrap()
                        .progress_chars("#>-"),
                );
                Some(bar)
            }
            _ => None,
        };

        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(FledgeError::Cancelled);
            }
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(bar) = &bar {
                bar.set_position(downloaded);
            }
        }

        file.flush().await?;
        if let Some(bar) = bar {
            bar.finish_with_message("Download completed");
        }

        debug!("Downloaded to: {}", dest.display());
        Ok(())
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}
