//! Screenshot of the QA feedback page, downloaded and remembered for the session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::browser::{find_or_create_context, focus_context_and_window, Browser};
use crate::channel::{Action, MessageChannel};
use crate::constants::{qa_feedback, timeouts};
use crate::errors::RelayError;
use crate::storage::{self, Store, StoredData};

/// Saves captured images somewhere the user can find them.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn has_permission(&self) -> bool;

    /// Stores a `data:` URL under `file_name` and returns the download id.
    async fn download(
        &self,
        data_url: &str,
        file_name: &str,
        save_as: bool,
    ) -> Result<u64, RelayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaCapture {
    pub data_url: String,
    pub download_id: Option<u64>,
}

/// `<base>-<ISO timestamp with ':' and '.' replaced by '-'>.png`
pub fn capture_file_name(base: &str, with_timestamp: bool, now: DateTime<Utc>) -> String {
    if !with_timestamp {
        return format!("{base}.png");
    }
    let stamp = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{base}-{stamp}.png")
}

/// Splits a base64 `data:` URL into its media type and decoded bytes.
pub fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>), RelayError> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| RelayError::InvalidPayload("not a data url".into()))?;
    let (header, body) = rest
        .split_once(',')
        .ok_or_else(|| RelayError::InvalidPayload("data url has no payload".into()))?;
    let media_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| RelayError::InvalidPayload("data url is not base64 encoded".into()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| RelayError::InvalidPayload(format!("invalid base64 in data url: {e}")))?;
    Ok((media_type.to_string(), bytes))
}

pub async fn download_file(
    downloader: &dyn Downloader,
    data_url: &str,
    file_name: &str,
    save_as: bool,
) -> Result<u64, RelayError> {
    if !downloader.has_permission().await {
        error!("Permission not granted for downloads");
        return Err(RelayError::PermissionDenied("downloads".into()));
    }
    let id = downloader.download(data_url, file_name, save_as).await?;
    info!(id, file_name, "Downloaded file");
    Ok(id)
}

/// Opens (or reuses) the QA feedback page, focuses it and asks its content script for a
/// screenshot. The image is downloaded when a downloader is given and remembered in
/// session storage either way.
#[instrument(level = "debug", skip_all)]
pub async fn capture_qa_feedback(
    browser: &dyn Browser,
    channel: &MessageChannel,
    store: &dyn Store,
    downloader: Option<&dyn Downloader>,
) -> Result<QaCapture, RelayError> {
    let context =
        find_or_create_context(browser, qa_feedback::URL, true, false, timeouts::PAGE_LOAD)
            .await?;
    let (focused, _) =
        focus_context_and_window(browser, &context, true, Some(qa_feedback::URL)).await?;

    let data_url: Option<String> = channel
        .send_to_context(
            focused.id,
            Action::ScreenshotQaFeedback,
            Value::Null,
            timeouts::SCREENSHOT,
        )
        .await?
        .into_data()?;
    let data_url = data_url.ok_or_else(|| {
        RelayError::ResourceNotFound("QA feedback page returned no screenshot".into())
    })?;
    info!(len = data_url.len(), "Captured QA feedback page");

    let download_id = match downloader {
        Some(downloader) if qa_feedback::capture::DOWNLOAD => {
            let name = capture_file_name(
                qa_feedback::capture::DEFAULT_FILE_NAME,
                qa_feedback::capture::USE_TIME_STAMP,
                Utc::now(),
            );
            Some(
                download_file(
                    downloader,
                    &data_url,
                    &name,
                    qa_feedback::capture::OPEN_SAVE_AS_DIALOG,
                )
                .await?,
            )
        }
        _ => None,
    };

    let saved_at = Utc::now().timestamp_millis().to_string();
    if let Err(e) = storage::save_as(
        store,
        StoredData::QaCapture.key(),
        &(&data_url, download_id, saved_at),
        qa_feedback::capture::STORAGE,
    )
    .await
    {
        warn!("Could not remember QA feedback capture: {}", e);
    }

    Ok(QaCapture {
        data_url,
        download_id,
    })
}

/// Writes downloads into a local directory, renaming on conflict.
pub struct DirectoryDownloader {
    dir: PathBuf,
    next_id: AtomicU64,
}

impl DirectoryDownloader {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            next_id: AtomicU64::new(1),
        }
    }

    /// `name.png`, `name (1).png`, `name (2).png`, ...
    fn unique_path(&self, file_name: &str) -> PathBuf {
        let first = self.dir.join(file_name);
        if !first.exists() {
            return first;
        }
        let path = Path::new(file_name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        (1..)
            .map(|n| self.dir.join(format!("{stem} ({n}){ext}")))
            .find(|candidate| !candidate.exists())
            .unwrap_or(first)
    }
}

#[async_trait]
impl Downloader for DirectoryDownloader {
    async fn has_permission(&self) -> bool {
        match tokio::fs::create_dir_all(&self.dir).await {
            Ok(()) => true,
            Err(e) => {
                warn!(dir = %self.dir.display(), "Download directory unavailable: {}", e);
                false
            }
        }
    }

    async fn download(
        &self,
        data_url: &str,
        file_name: &str,
        save_as: bool,
    ) -> Result<u64, RelayError> {
        if save_as {
            debug!("Save-as dialog requested; writing to the download directory instead");
        }
        let (media_type, bytes) = decode_data_url(data_url)?;
        let path = self.unique_path(file_name);
        tokio::fs::write(&path, &bytes).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(
            id,
            path = %path.display(),
            media_type = %media_type,
            bytes = bytes.len(),
            "Saved download"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_replaces_colons_and_dots() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap();
        assert_eq!(
            capture_file_name("qa-feedback", true, now),
            "qa-feedback-2024-05-01T13-04-05-000Z.png"
        );
        assert_eq!(capture_file_name("qa-feedback", false, now), "qa-feedback.png");
    }

    #[test]
    fn data_url_must_be_base64() {
        let (media, bytes) = decode_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(media, "image/png");
        assert_eq!(bytes, b"hello");
        assert!(matches!(
            decode_data_url("data:text/plain,hello"),
            Err(RelayError::InvalidPayload(_))
        ));
        assert!(decode_data_url("https://example.com/a.png").is_err());
    }

    #[tokio::test]
    async fn directory_downloader_uniquifies_names() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = DirectoryDownloader::new(dir.path());
        let url = "data:image/png;base64,aGVsbG8=";
        let first = download_file(&downloader, url, "shot.png", false).await.unwrap();
        let second = download_file(&downloader, url, "shot.png", true).await.unwrap();
        assert_ne!(first, second);
        assert!(dir.path().join("shot.png").exists());
        assert!(dir.path().join("shot (1).png").exists());
    }
}
