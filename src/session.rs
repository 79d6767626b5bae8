//! Core data types for recording sessions
//!
//! A session is one continuous recorded interval of one speaker's audio in
//! one voice channel. It is open while the speaker is being buffered and
//! becomes an immutable durable record once finalized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker identifier, assigned by the voice transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Voice channel identifier, assigned by the voice transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session identifier, assigned by storage on creation (SQLite rowid)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub i64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a session ended
///
/// Closed set; storage round trips go through [`LeaveReason::as_str`] and
/// [`LeaveReason::parse`], and an unknown string on read is a storage error
/// rather than a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// The speaker left the channel, or this is the final segment of a
    /// split session. The transport cannot distinguish a kick from a
    /// voluntary disconnect, so neither can we.
    Natural,
    /// The engine was torn down while the session was still open.
    BotDisconnected,
    /// The session was closed only because its buffer crossed the size
    /// threshold; a successor session opened immediately for the speaker.
    Continued,
}

impl LeaveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaveReason::Natural => "natural",
            LeaveReason::BotDisconnected => "bot_disconnected",
            LeaveReason::Continued => "continued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "natural" => Some(LeaveReason::Natural),
            "bot_disconnected" => Some(LeaveReason::BotDisconnected),
            "continued" => Some(LeaveReason::Continued),
            _ => None,
        }
    }
}

impl std::fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the sessions table
///
/// Invariant: a session is open iff `ended_at`, `data`, and `leave_reason`
/// are all absent, and finished once all three are present. A row with
/// `ended_at` set but `data` absent can only come from external damage;
/// the engine writes all three in one statement.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    pub channel: ChannelId,
    pub user: UserId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// zlib-compressed raw audio bytes
    pub data: Option<Vec<u8>>,
    pub leave_reason: Option<LeaveReason>,
}

impl SessionRecord {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none() && self.data.is_none() && self.leave_reason.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some() && self.data.is_some() && self.leave_reason.is_some()
    }
}

/// Administrative privacy-setting changes recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    UserListeningEnabled,
    UserListeningDisabled,
    ChannelListeningEnabled,
    ChannelListeningDisabled,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::UserListeningEnabled => "user_listening_enabled",
            AuditEvent::UserListeningDisabled => "user_listening_disabled",
            AuditEvent::ChannelListeningEnabled => "channel_listening_enabled",
            AuditEvent::ChannelListeningDisabled => "channel_listening_disabled",
        }
    }

    pub fn for_user(allowed: bool) -> Self {
        if allowed {
            AuditEvent::UserListeningEnabled
        } else {
            AuditEvent::UserListeningDisabled
        }
    }

    pub fn for_channel(allowed: bool) -> Self {
        if allowed {
            AuditEvent::ChannelListeningEnabled
        } else {
            AuditEvent::ChannelListeningDisabled
        }
    }
}
