//! Recall pipeline
//!
//! Reconstructs a bounded time window of one speaker's historical audio
//! into a single playable file: resolve the window, fetch the finished
//! sessions in chronological order, decompress them in parallel, and hand
//! the ordered segments to the external transcoder.

use crate::compress;
use crate::engine::Recorder;
use crate::error::RecallError;
use crate::session::{LeaveReason, UserId};
use crate::store::StoreHandle;
use crate::transcode::Transcoder;
use crate::window::parse_lookback;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::task;

/// Recall pipeline over one session store
pub struct Recall {
    store: StoreHandle,
    transcoder: Transcoder,
}

impl Recall {
    pub fn new(store: StoreHandle, transcoder: Transcoder) -> Self {
        Self { store, transcoder }
    }

    /// Build the pipeline from configuration, resolving ffmpeg from the
    /// configured path or the usual locations.
    pub fn from_config(
        store: StoreHandle,
        config: &crate::config::RecallConfig,
    ) -> Result<Self, RecallError> {
        let transcoder = Transcoder::new(config.ffmpeg_path.as_deref())?;
        Ok(Self::new(store, transcoder))
    }

    /// Recall with a shorthand lookback string like `"30s"` or `"1h30m"`.
    pub async fn recall_shorthand(
        &self,
        user: UserId,
        lookback: &str,
        live: Option<Arc<Recorder>>,
    ) -> Result<NamedTempFile, RecallError> {
        let duration = parse_lookback(lookback)?;
        self.recall(user, duration, live).await
    }

    /// Reconstruct the last `lookback` of `user`'s audio into one file.
    ///
    /// When a live [`Recorder`] covers the speaker, their current session
    /// is split off first so the freshest audio is queryable instead of
    /// trapped in an in-memory buffer. The window widens backwards when
    /// the most recent session started before it, so a short lookback
    /// never truncates the speaker's last session.
    pub async fn recall(
        &self,
        user: UserId,
        lookback: Duration,
        live: Option<Arc<Recorder>>,
    ) -> Result<NamedTempFile, RecallError> {
        if lookback.is_zero() {
            return Err(RecallError::InvalidWindow(
                "zero-length lookback".to_string(),
            ));
        }
        let lookback = chrono::Duration::from_std(lookback)
            .map_err(|_| RecallError::InvalidWindow("lookback out of range".to_string()))?;

        if let Some(recorder) = live {
            task::spawn_blocking(move || recorder.cleanup_one(user, LeaveReason::Continued))
                .await
                .map_err(|e| RecallError::Worker(e.to_string()))??;
        }

        let mut starting_at = Utc::now() - lookback;

        let store = self.store.clone();
        let latest = task::spawn_blocking(move || store.latest_session_start(user))
            .await
            .map_err(|e| RecallError::Worker(e.to_string()))??;
        if let Some(latest) = latest {
            if latest < starting_at {
                tracing::debug!(
                    %user,
                    latest = %latest,
                    "widening window to cover the most recent session"
                );
                starting_at = latest;
            }
        }

        let store = self.store.clone();
        let records = task::spawn_blocking(move || store.sessions_since(user, starting_at))
            .await
            .map_err(|e| RecallError::Worker(e.to_string()))??;
        if records.is_empty() {
            return Err(RecallError::NothingFound(user));
        }

        // Decompression is independent per chunk; fan out and rejoin in
        // chronological order so the transcoder sees the spoken order.
        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id;
            let Some(data) = record.data else {
                // The range query filters on payload presence; a row
                // without one here means storage broke its contract.
                return Err(RecallError::Worker(format!(
                    "session {id} returned without payload"
                )));
            };
            pending.push((id, task::spawn_blocking(move || compress::inflate(&data))));
        }

        let mut segments = Vec::with_capacity(pending.len());
        for (id, handle) in pending {
            let raw = handle
                .await
                .map_err(|e| RecallError::Worker(e.to_string()))?
                .map_err(|source| RecallError::Decompress {
                    session: id,
                    source,
                })?;
            segments.push(raw);
        }

        tracing::info!(
            %user,
            segments = segments.len(),
            "recalling audio"
        );
        let output = self.transcoder.concat(&segments).await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use std::path::Path;
    use tempfile::TempDir;

    fn pipeline() -> (Recall, StoreHandle, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::spawn(&temp.path().join("index.db")).unwrap();
        let transcoder = Transcoder::new(Some(Path::new("/bin/sh"))).unwrap();
        (Recall::new(store.clone(), transcoder), store, temp)
    }

    #[test]
    fn test_from_config_with_explicit_ffmpeg() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::spawn(&temp.path().join("index.db")).unwrap();
        let config = crate::config::RecallConfig {
            ffmpeg_path: Some("/bin/sh".into()),
            ..Default::default()
        };
        assert!(Recall::from_config(store, &config).is_ok());
    }

    #[tokio::test]
    async fn test_zero_lookback_rejected_before_storage() {
        let (recall, _store, _temp) = pipeline();
        let result = recall.recall(UserId(1), Duration::ZERO, None).await;
        assert!(matches!(result, Err(RecallError::InvalidWindow(_))));
    }

    #[tokio::test]
    async fn test_bad_shorthand_rejected() {
        let (recall, _store, _temp) = pipeline();
        let result = recall.recall_shorthand(UserId(1), "soon", None).await;
        assert!(matches!(result, Err(RecallError::InvalidWindow(_))));
    }

    #[tokio::test]
    async fn test_empty_window_reports_nothing_found() {
        let (recall, _store, _temp) = pipeline();
        let result = recall
            .recall(UserId(1), Duration::from_secs(30), None)
            .await;
        assert!(matches!(result, Err(RecallError::NothingFound(UserId(1)))));
    }
}
