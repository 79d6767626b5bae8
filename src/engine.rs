//! Recording engine
//!
//! One [`Recorder`] per active voice connection. The voice transport
//! delivers decoded frames on its own worker threads via [`Recorder::write`];
//! frames for one speaker never arrive concurrently, but different
//! speakers' frames do, so the buffer map is shared state while the
//! storage round trips and compression always run with the lock released.
//!
//! Session lifecycle: a speaker's first frame opens a session row
//! synchronously, frames accumulate in memory, and the session is
//! finalized (compressed and committed) on leave, teardown, or when the
//! buffer crosses the split threshold.

use crate::compress;
use crate::error::EngineError;
use crate::session::{ChannelId, LeaveReason, SessionId, UserId};
use crate::store::StoreHandle;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// Seconds of audio one session may buffer before it is split.
pub const SPLIT_WINDOW_SECS: u64 = 30;

/// A split strictly shrinks the buffer, so two passes always suffice; the
/// explicit bound turns a broken threshold into an error instead of a spin.
const SPLIT_LOOP_LIMIT: u32 = 3;

/// Per-connection memoized permission decisions
///
/// Backed by durable storage with create-on-first-seen default allow; each
/// entity costs at most one storage round trip for the lifetime of the
/// recorder. A fresh connection re-checks.
pub struct AccessCache {
    store: StoreHandle,
    users: Mutex<HashMap<UserId, bool>>,
    channels: Mutex<HashMap<ChannelId, bool>>,
}

impl AccessCache {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            users: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// May this user's audio be recorded? Cached after the first lookup.
    pub fn user_allowed(&self, user: UserId) -> Result<bool, EngineError> {
        if let Some(&allowed) = self
            .users
            .lock()
            .map_err(|_| EngineError::Lock)?
            .get(&user)
        {
            return Ok(allowed);
        }
        let allowed = self.store.user_can_listen(user)?;
        self.users
            .lock()
            .map_err(|_| EngineError::Lock)?
            .insert(user, allowed);
        Ok(allowed)
    }

    /// May this channel be recorded? Cached after the first lookup.
    pub fn channel_allowed(&self, channel: ChannelId) -> Result<bool, EngineError> {
        if let Some(&allowed) = self
            .channels
            .lock()
            .map_err(|_| EngineError::Lock)?
            .get(&channel)
        {
            return Ok(allowed);
        }
        let allowed = self.store.channel_can_listen(channel)?;
        self.channels
            .lock()
            .map_err(|_| EngineError::Lock)?
            .insert(channel, allowed);
        Ok(allowed)
    }
}

/// Accumulated raw audio for one speaker's open session
struct FrameBuffer {
    session: SessionId,
    data: Vec<u8>,
}

impl FrameBuffer {
    fn new(session: SessionId) -> Self {
        Self {
            session,
            data: Vec::new(),
        }
    }
}

/// Recording engine for one voice connection
pub struct Recorder {
    store: StoreHandle,
    channel: ChannelId,
    max_buffer_len: usize,
    access: AccessCache,
    buffers: Mutex<HashMap<UserId, FrameBuffer>>,
    done: watch::Sender<bool>,
}

impl Recorder {
    /// Attach a recorder to a channel.
    ///
    /// Returns `Ok(None)` when the channel's privacy flag forbids
    /// recording. The split threshold defaults to [`SPLIT_WINDOW_SECS`]
    /// worth of bytes at the channel's bitrate unless `max_segment_bytes`
    /// overrides it.
    pub fn open(
        store: StoreHandle,
        channel: ChannelId,
        bitrate_bps: u32,
        max_segment_bytes: Option<usize>,
    ) -> Result<Option<Self>, EngineError> {
        let access = AccessCache::new(store.clone());
        if !access.channel_allowed(channel)? {
            tracing::info!(%channel, "channel privacy settings forbid recording");
            return Ok(None);
        }

        let max_buffer_len = max_segment_bytes
            .unwrap_or(bitrate_bps as usize / 8 * SPLIT_WINDOW_SECS as usize);
        tracing::info!(%channel, max_buffer_len, "recorder attached");

        let (done, _) = watch::channel(false);
        Ok(Some(Self {
            store,
            channel,
            max_buffer_len,
            access,
            buffers: Mutex::new(HashMap::new()),
            done,
        }))
    }

    /// Attach a recorder using configured defaults.
    ///
    /// The transport's reported bitrate wins over the configured fallback;
    /// an explicit `max_segment_bytes` in the config wins over both.
    pub fn from_config(
        store: StoreHandle,
        channel: ChannelId,
        bitrate_bps: Option<u32>,
        config: &crate::config::RecordingConfig,
    ) -> Result<Option<Self>, EngineError> {
        let bitrate = bitrate_bps.unwrap_or(config.default_bitrate);
        let max = config
            .max_segment_bytes
            .unwrap_or(bitrate as usize / 8 * config.split_window_secs as usize);
        Self::open(store, channel, bitrate, Some(max))
    }

    /// Handle one decoded audio frame for one speaker.
    ///
    /// Called from the frame-delivery thread; frames for the same speaker
    /// arrive in order and never concurrently. A denied speaker generates
    /// nothing at all: no buffer, no session row, no error.
    pub fn write(&self, frame: &[u8], user: UserId) -> Result<(), EngineError> {
        if !self.access.user_allowed(user)? {
            return Ok(());
        }

        for _ in 0..SPLIT_LOOP_LIMIT {
            let session = {
                let buffers = self.buffers.lock().map_err(|_| EngineError::Lock)?;
                buffers.get(&user).map(|b| b.session)
            };

            if session.is_none() {
                // The session id must exist before the frame is buffered,
                // so open the row synchronously.
                let id = self.store.open_session(user, self.channel, Utc::now())?;
                tracing::debug!(%user, session = %id, "session opened");
                self.buffers
                    .lock()
                    .map_err(|_| EngineError::Lock)?
                    .insert(user, FrameBuffer::new(id));
            }

            let full = {
                let mut buffers = self.buffers.lock().map_err(|_| EngineError::Lock)?;
                match buffers.get_mut(&user) {
                    Some(buffer) if buffer.data.len() >= self.max_buffer_len => true,
                    Some(buffer) => {
                        buffer.data.extend_from_slice(frame);
                        return Ok(());
                    }
                    // Popped out from under us by a cleanup; reopen.
                    None => continue,
                }
            };

            if full {
                // Split: close this session and write the triggering frame
                // into a fresh one on the next pass.
                self.cleanup_one(user, LeaveReason::Continued)?;
            }
        }

        Err(EngineError::SplitLoop(user))
    }

    /// Finalize one speaker's open session, if any.
    ///
    /// Compresses the buffered bytes and commits end time, reason, and
    /// payload in one storage transaction. Returns `Ok(None)` when the
    /// speaker had nothing buffered; calling again is a no-op, not an error.
    pub fn cleanup_one(
        &self,
        user: UserId,
        reason: LeaveReason,
    ) -> Result<Option<SessionId>, EngineError> {
        let buffer = self
            .buffers
            .lock()
            .map_err(|_| EngineError::Lock)?
            .remove(&user);
        let Some(buffer) = buffer else {
            return Ok(None);
        };

        let raw_len = buffer.data.len();
        let data = compress::deflate(&buffer.data).map_err(EngineError::Compress)?;
        self.store
            .finalize_session(buffer.session, Utc::now(), reason, data)?;

        tracing::debug!(
            %user,
            session = %buffer.session,
            %reason,
            raw_len,
            "session finalized"
        );
        Ok(Some(buffer.session))
    }

    /// Finalize every currently-buffered speaker and latch the completion
    /// signal.
    ///
    /// Finalizes run concurrently across speakers on a bounded set of
    /// threads; the signal does not fire until every finalize has either
    /// committed or failed. One speaker's storage failure never blocks the
    /// others. Returns the number of sessions finalized.
    pub fn cleanup_all(&self, reason: LeaveReason) -> Result<usize, EngineError> {
        let users: Vec<UserId> = self
            .buffers
            .lock()
            .map_err(|_| EngineError::Lock)?
            .keys()
            .copied()
            .collect();
        let total = users.len();

        let mut finalized = 0usize;
        let mut failed = 0usize;
        if !users.is_empty() {
            let workers = num_cpus::get().max(1).min(users.len());
            let chunk_size = users.len().div_ceil(workers);

            let results: Vec<Result<Option<SessionId>, EngineError>> =
                std::thread::scope(|scope| {
                    let handles: Vec<_> = users
                        .chunks(chunk_size)
                        .map(|chunk| {
                            let handle = scope.spawn(move || {
                                chunk
                                    .iter()
                                    .map(|&user| self.cleanup_one(user, reason))
                                    .collect::<Vec<_>>()
                            });
                            (chunk.len(), handle)
                        })
                        .collect();
                    handles
                        .into_iter()
                        .flat_map(|(len, handle)| {
                            handle.join().unwrap_or_else(|_| {
                                (0..len).map(|_| Err(EngineError::Lock)).collect()
                            })
                        })
                        .collect()
                });

            for (user, result) in users.iter().zip(results) {
                match result {
                    Ok(Some(_)) => finalized += 1,
                    Ok(None) => {}
                    Err(e) => {
                        failed += 1;
                        tracing::error!(%user, error = %e, "finalize failed during cleanup");
                    }
                }
            }
        }

        // Teardown waits on this; it must fire even when finalizes failed.
        self.done.send_replace(true);
        tracing::info!(channel = %self.channel, finalized, failed, "recording stopped");

        if failed > 0 {
            return Err(EngineError::CleanupIncomplete { failed, total });
        }
        Ok(finalized)
    }

    /// Completion signal: latched true exactly once, after
    /// [`Recorder::cleanup_all`] has finished every finalize.
    ///
    /// Await it with `finished().wait_for(|done| *done)`, or poll with
    /// `*finished().borrow()`.
    pub fn finished(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    /// Number of speakers with audio currently buffered.
    pub fn buffered_speakers(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// The channel this recorder is attached to.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}
