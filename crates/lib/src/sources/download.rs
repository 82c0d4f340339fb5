//! Downloading with retries, verification and a sha256-keyed cache.

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::types::{is_remote_url, url_to_filename};
use super::{StageError, StagerConfig};
use crate::util::hash::hash_bytes;

/// Failure of a single fetch attempt.
pub(crate) enum AttemptError {
  /// Worth retrying: connection problems, timeouts, 5xx responses.
  Transient(String),
  /// Retrying will not help.
  Permanent(StageError),
}

/// Run `attempt` until it succeeds, fails permanently, or the attempt budget is spent.
pub(crate) async fn with_retries<T, F, Fut>(url: &str, config: &StagerConfig, mut attempt: F) -> Result<T, StageError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, AttemptError>>,
{
  let max_attempts = config.max_attempts.max(1);
  let mut last_error = String::new();

  for n in 1..=max_attempts {
    match attempt().await {
      Ok(value) => return Ok(value),
      Err(AttemptError::Permanent(e)) => return Err(e),
      Err(AttemptError::Transient(message)) => {
        warn!(url = %url, attempt = n, max_attempts, error = %message, "fetch attempt failed");
        last_error = message;
        if n < max_attempts {
          tokio::time::sleep(config.retry_backoff * n).await;
        }
      }
    }
  }

  Err(StageError::FetchFailed {
    url: url.to_string(),
    attempts: max_attempts,
    message: last_error,
  })
}

/// Fetch the raw bytes behind `url`.
///
/// `file://` URLs and plain paths are read from disk and never retried.
pub(crate) async fn fetch_bytes(url: &str, config: &StagerConfig) -> Result<Vec<u8>, StageError> {
  if !is_remote_url(url) {
    let path = url.strip_prefix("file://").unwrap_or(url);
    return fs::read(path).await.map_err(|e| StageError::FetchFailed {
      url: url.to_string(),
      attempts: 1,
      message: e.to_string(),
    });
  }

  let client = reqwest::Client::builder()
    .timeout(config.http_timeout)
    .build()
    .map_err(|e| StageError::FetchFailed {
      url: url.to_string(),
      attempts: 0,
      message: e.to_string(),
    })?;

  with_retries(url, config, || {
    let client = client.clone();
    async move {
      let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AttemptError::Transient(e.to_string()))?;

      let status = response.status();
      if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(AttemptError::Transient(format!("HTTP {}", status)));
      }
      if !status.is_success() {
        return Err(AttemptError::Permanent(StageError::FetchFailed {
          url: url.to_string(),
          attempts: 1,
          message: format!("HTTP {}", status),
        }));
      }

      let bytes = response
        .bytes()
        .await
        .map_err(|e| AttemptError::Transient(e.to_string()))?;
      Ok(bytes.to_vec())
    }
  })
  .await
}

/// Download `url` into `dest_dir`, verifying `expected_sha256` before anything is written.
///
/// Verified downloads are also kept in the cache directory under their
/// sha256 so repeated builds skip the network.
pub async fn download_verified(
  url: &str,
  expected_sha256: Option<&str>,
  dest_dir: &Path,
  config: &StagerConfig,
) -> Result<PathBuf, StageError> {
  fs::create_dir_all(dest_dir).await?;
  let dest_path = dest_dir.join(url_to_filename(url));

  let cached = match (expected_sha256, &config.cache_dir) {
    (Some(sha), Some(cache)) => Some(cache.join(sha.to_ascii_lowercase())),
    _ => None,
  };

  if let Some(cached) = &cached
    && let Ok(bytes) = fs::read(cached).await
  {
    if expected_sha256.is_some_and(|sha| hash_bytes(&bytes).matches(sha)) {
      debug!(url = %url, path = ?cached, "using cached download");
      fs::write(&dest_path, &bytes).await?;
      return Ok(dest_path);
    }
    debug!(path = ?cached, "cached download corrupted, re-fetching");
  }

  info!(url = %url, "fetching");
  let bytes = fetch_bytes(url, config).await?;

  if let Some(expected) = expected_sha256 {
    let actual = hash_bytes(&bytes);
    if !actual.matches(expected) {
      return Err(StageError::IntegrityMismatch {
        url: url.to_string(),
        expected: expected.to_string(),
        actual: actual.0,
      });
    }
  }

  let mut file = fs::File::create(&dest_path).await?;
  file.write_all(&bytes).await?;
  file.flush().await?;

  if let Some(cached) = cached {
    if let Some(parent) = cached.parent() {
      fs::create_dir_all(parent).await?;
    }
    if let Err(e) = fs::write(&cached, &bytes).await {
      warn!(path = ?cached, error = %e, "failed to populate download cache");
    }
  }

  info!(path = ?dest_path, size = bytes.len(), "download complete");
  Ok(dest_path)
}
