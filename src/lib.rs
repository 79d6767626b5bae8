//! earshot: per-speaker voice session recording and recall
//!
//! Records per-speaker audio streams from live group voice sessions,
//! persists them as zlib-compressed queryable segments in SQLite, and on
//! demand reconstructs a bounded time window of one speaker's audio into
//! a single playable file.
//!
//! The voice transport (frame delivery and membership events), the
//! command front-end, and process bootstrap are external collaborators;
//! this crate owns everything between a decoded frame and a durable,
//! recallable session.
//!
//! # Architecture
//!
//! ```text
//!  voice transport                         command layer
//!        │ frame + speaker                       │ recall(user, lookback)
//!        ▼                                       ▼
//! ┌──────────────┐                        ┌──────────────┐
//! │   Recorder   │  access gate, buffer,  │    Recall    │
//! │  (engine.rs) │  split, finalize       │  (recall.rs) │
//! └──────────────┘                        └──────────────┘
//!        │ open / finalize                        │ range query
//!        ▼                                        ▼
//! ┌─────────────────────────────────────────────────────┐
//! │        SessionStore thread (store.rs, SQLite)       │
//! └─────────────────────────────────────────────────────┘
//!                                                 │ compressed segments
//!                                                 ▼
//!                                         ┌──────────────┐
//!                                         │  Transcoder  │ ffmpeg concat
//!                                         │(transcode.rs)│
//!                                         └──────────────┘
//! ```
//!
//! Frame delivery runs on the transport's worker threads and talks to the
//! storage thread over a blocking request/response channel: one round trip
//! per uncached permission decision plus one per session open and close.

pub mod compress;
pub mod config;
pub mod engine;
pub mod error;
pub mod recall;
pub mod session;
pub mod store;
pub mod transcode;
pub mod window;

pub use config::Config;
pub use engine::{AccessCache, Recorder, SPLIT_WINDOW_SECS};
pub use error::{
    EarshotError, EngineError, RecallError, Result, StoreError, TranscodeError, WindowError,
};
pub use recall::Recall;
pub use session::{AuditEvent, ChannelId, LeaveReason, SessionId, SessionRecord, UserId};
pub use store::{SessionStore, StoreHandle, StoreRequest};
pub use transcode::Transcoder;
pub use window::parse_lookback;
