//! Durable session store
//!
//! A dedicated thread owns the SQLite connection and serves requests over
//! a channel; every logical write is one transaction. This keeps all
//! durable-storage access in a single storage-owning context while frame
//! delivery and cleanup run on worker threads, which talk to it through
//! the blocking [`StoreHandle`] — one synchronous round trip per request.
//!
//! The request enum is public so tests can stand up a fake responder
//! instead of a real database.

use crate::error::StoreError;
use crate::session::{
    AuditEvent, ChannelId, LeaveReason, SessionId, SessionRecord, UserId,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

/// Reply channel for one request
pub type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Requests served by the storage thread
pub enum StoreRequest {
    OpenSession {
        user: UserId,
        channel: ChannelId,
        started_at: DateTime<Utc>,
        reply: Reply<SessionId>,
    },
    FinalizeSession {
        id: SessionId,
        ended_at: DateTime<Utc>,
        reason: LeaveReason,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    UserCanListen {
        user: UserId,
        reply: Reply<bool>,
    },
    ChannelCanListen {
        channel: ChannelId,
        reply: Reply<bool>,
    },
    ChannelAutoconnect {
        channel: ChannelId,
        reply: Reply<bool>,
    },
    SetUserCanListen {
        user: UserId,
        allowed: bool,
        changed_by: UserId,
        reply: Reply<()>,
    },
    SetChannelCanListen {
        channel: ChannelId,
        allowed: bool,
        changed_by: UserId,
        reply: Reply<()>,
    },
    LatestSessionStart {
        user: UserId,
        reply: Reply<Option<DateTime<Utc>>>,
    },
    SessionsSince {
        user: UserId,
        since: DateTime<Utc>,
        reply: Reply<Vec<SessionRecord>>,
    },
}

/// Cloneable handle to the storage thread
///
/// Methods block on the storage round trip, so they must be called from a
/// worker thread (or wrapped in `spawn_blocking` from async code), never
/// directly on a runtime worker.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreRequest>,
}

impl StoreHandle {
    /// Build a handle on top of an arbitrary responder. Tests use this to
    /// substitute a fake storage thread.
    pub fn from_channel(tx: mpsc::Sender<StoreRequest>) -> Self {
        Self { tx }
    }

    fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> StoreRequest,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .blocking_send(make(reply))
            .map_err(|_| StoreError::Disconnected)?;
        rx.blocking_recv().map_err(|_| StoreError::Disconnected)?
    }

    /// Insert an open session row and return its storage-assigned id.
    pub fn open_session(
        &self,
        user: UserId,
        channel: ChannelId,
        started_at: DateTime<Utc>,
    ) -> Result<SessionId, StoreError> {
        self.call(|reply| StoreRequest::OpenSession {
            user,
            channel,
            started_at,
            reply,
        })
    }

    /// Close a session: end time, leave reason, and compressed payload
    /// commit in a single statement.
    pub fn finalize_session(
        &self,
        id: SessionId,
        ended_at: DateTime<Utc>,
        reason: LeaveReason,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.call(|reply| StoreRequest::FinalizeSession {
            id,
            ended_at,
            reason,
            data,
            reply,
        })
    }

    /// May this user's audio be recorded? Unknown users are inserted with
    /// the default allow flag on first sight.
    pub fn user_can_listen(&self, user: UserId) -> Result<bool, StoreError> {
        self.call(|reply| StoreRequest::UserCanListen { user, reply })
    }

    /// May this channel be recorded? Same create-on-first-seen semantics.
    pub fn channel_can_listen(&self, channel: ChannelId) -> Result<bool, StoreError> {
        self.call(|reply| StoreRequest::ChannelCanListen { channel, reply })
    }

    /// Should the engine auto-attach to this channel when someone joins?
    pub fn channel_autoconnect(&self, channel: ChannelId) -> Result<bool, StoreError> {
        self.call(|reply| StoreRequest::ChannelAutoconnect { channel, reply })
    }

    /// Administrative flip of a user's privacy flag; audited.
    pub fn set_user_can_listen(
        &self,
        user: UserId,
        allowed: bool,
        changed_by: UserId,
    ) -> Result<(), StoreError> {
        self.call(|reply| StoreRequest::SetUserCanListen {
            user,
            allowed,
            changed_by,
            reply,
        })
    }

    /// Administrative flip of a channel's privacy flag; audited.
    pub fn set_channel_can_listen(
        &self,
        channel: ChannelId,
        allowed: bool,
        changed_by: UserId,
    ) -> Result<(), StoreError> {
        self.call(|reply| StoreRequest::SetChannelCanListen {
            channel,
            allowed,
            changed_by,
            reply,
        })
    }

    /// Start time of the user's most recent session, if any.
    pub fn latest_session_start(
        &self,
        user: UserId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.call(|reply| StoreRequest::LatestSessionStart { user, reply })
    }

    /// Finished sessions for a user with payloads present, started at or
    /// after `since`, in chronological order.
    pub fn sessions_since(
        &self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        self.call(|reply| StoreRequest::SessionsSince { user, since, reply })
    }
}

/// SQLite-backed session store
///
/// Owns the connection; lives on its own thread spawned by [`SessionStore::spawn`].
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    /// Open (or create) the database and spawn the storage thread.
    ///
    /// The thread exits once every handle has been dropped.
    pub fn spawn(db_path: &Path) -> Result<StoreHandle, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.init_schema()?;

        let (tx, mut rx) = mpsc::channel::<StoreRequest>(64);
        std::thread::Builder::new()
            .name("earshot-store".to_string())
            .spawn(move || {
                while let Some(request) = rx.blocking_recv() {
                    store.dispatch(request);
                }
                tracing::debug!("session store thread exiting");
            })?;

        Ok(StoreHandle { tx })
    }

    fn init_schema(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                data BLOB,
                leave_reason TEXT
            );

            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                can_listen INTEGER NOT NULL DEFAULT 1,
                audit_event_id INTEGER REFERENCES audit_log(id)
            );

            CREATE TABLE IF NOT EXISTS voice_channels (
                channel_id INTEGER PRIMARY KEY,
                can_listen INTEGER NOT NULL DEFAULT 1,
                autoconnect INTEGER NOT NULL DEFAULT 1,
                audit_event_id INTEGER REFERENCES audit_log(id)
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                responsible_user_id INTEGER NOT NULL,
                changed_at INTEGER NOT NULL,
                scope INTEGER,
                event_type TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user_started
                ON sessions(user_id, started_at);
            "#,
        )?;
        Ok(())
    }

    fn dispatch(&mut self, request: StoreRequest) {
        // A dropped reply receiver just means the caller gave up waiting.
        match request {
            StoreRequest::OpenSession {
                user,
                channel,
                started_at,
                reply,
            } => {
                let _ = reply.send(self.open_session(user, channel, started_at));
            }
            StoreRequest::FinalizeSession {
                id,
                ended_at,
                reason,
                data,
                reply,
            } => {
                let _ = reply.send(self.finalize_session(id, ended_at, reason, &data));
            }
            StoreRequest::UserCanListen { user, reply } => {
                let _ = reply.send(self.user_can_listen(user));
            }
            StoreRequest::ChannelCanListen { channel, reply } => {
                let _ = reply.send(self.channel_flag(channel, "can_listen"));
            }
            StoreRequest::ChannelAutoconnect { channel, reply } => {
                let _ = reply.send(self.channel_flag(channel, "autoconnect"));
            }
            StoreRequest::SetUserCanListen {
                user,
                allowed,
                changed_by,
                reply,
            } => {
                let _ = reply.send(self.set_user_can_listen(user, allowed, changed_by));
            }
            StoreRequest::SetChannelCanListen {
                channel,
                allowed,
                changed_by,
                reply,
            } => {
                let _ = reply.send(self.set_channel_can_listen(channel, allowed, changed_by));
            }
            StoreRequest::LatestSessionStart { user, reply } => {
                let _ = reply.send(self.latest_session_start(user));
            }
            StoreRequest::SessionsSince { user, since, reply } => {
                let _ = reply.send(self.sessions_since(user, since));
            }
        }
    }

    fn open_session(
        &mut self,
        user: UserId,
        channel: ChannelId,
        started_at: DateTime<Utc>,
    ) -> Result<SessionId, StoreError> {
        self.conn.execute(
            "INSERT INTO sessions (channel_id, user_id, started_at) VALUES (?1, ?2, ?3)",
            params![channel.0 as i64, user.0 as i64, started_at.timestamp_millis()],
        )?;
        Ok(SessionId(self.conn.last_insert_rowid()))
    }

    fn finalize_session(
        &mut self,
        id: SessionId,
        ended_at: DateTime<Utc>,
        reason: LeaveReason,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE sessions SET ended_at = ?2, data = ?3, leave_reason = ?4 WHERE id = ?1",
            params![
                id.0,
                ended_at.timestamp_millis(),
                data,
                reason.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(id));
        }
        Ok(())
    }

    fn user_can_listen(&mut self, user: UserId) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let existing: Option<bool> = tx
            .query_row(
                "SELECT can_listen FROM users WHERE user_id = ?1",
                params![user.0 as i64],
                |row| row.get::<_, i64>(0).map(|v| v != 0),
            )
            .optional()?;
        let allowed = match existing {
            Some(flag) => flag,
            None => {
                // Not in the database, therefore never disallowed.
                tx.execute(
                    "INSERT INTO users (user_id, can_listen) VALUES (?1, 1)",
                    params![user.0 as i64],
                )?;
                true
            }
        };
        tx.commit()?;
        Ok(allowed)
    }

    fn channel_flag(&mut self, channel: ChannelId, column: &str) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let existing: Option<bool> = tx
            .query_row(
                &format!(
                    "SELECT {} FROM voice_channels WHERE channel_id = ?1",
                    column
                ),
                params![channel.0 as i64],
                |row| row.get::<_, i64>(0).map(|v| v != 0),
            )
            .optional()?;
        let flag = match existing {
            Some(flag) => flag,
            None => {
                tx.execute(
                    "INSERT INTO voice_channels (channel_id) VALUES (?1)",
                    params![channel.0 as i64],
                )?;
                // Both flags default on.
                true
            }
        };
        tx.commit()?;
        Ok(flag)
    }

    fn set_user_can_listen(
        &mut self,
        user: UserId,
        allowed: bool,
        changed_by: UserId,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO audit_log (responsible_user_id, changed_at, scope, event_type)
             VALUES (?1, ?2, NULL, ?3)",
            params![
                changed_by.0 as i64,
                Utc::now().timestamp_millis(),
                AuditEvent::for_user(allowed).as_str()
            ],
        )?;
        let audit_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO users (user_id, can_listen, audit_event_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 can_listen = excluded.can_listen,
                 audit_event_id = excluded.audit_event_id",
            params![user.0 as i64, allowed as i64, audit_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn set_channel_can_listen(
        &mut self,
        channel: ChannelId,
        allowed: bool,
        changed_by: UserId,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO audit_log (responsible_user_id, changed_at, scope, event_type)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                changed_by.0 as i64,
                Utc::now().timestamp_millis(),
                channel.0 as i64,
                AuditEvent::for_channel(allowed).as_str()
            ],
        )?;
        let audit_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO voice_channels (channel_id, can_listen, audit_event_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(channel_id) DO UPDATE SET
                 can_listen = excluded.can_listen,
                 audit_event_id = excluded.audit_event_id",
            params![channel.0 as i64, allowed as i64, audit_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn latest_session_start(
        &mut self,
        user: UserId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let ts: Option<i64> = self
            .conn
            .query_row(
                "SELECT started_at FROM sessions WHERE user_id = ?1
                 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![user.0 as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts.map(ms_to_datetime))
    }

    fn sessions_since(
        &mut self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, channel_id, user_id, started_at, ended_at, data, leave_reason
             FROM sessions
             WHERE user_id = ?1 AND started_at >= ?2 AND data IS NOT NULL
             ORDER BY started_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![user.0 as i64, since.timestamp_millis()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<Vec<u8>>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, channel, uid, started, ended, data, reason) in rows {
            let leave_reason = match reason {
                Some(text) => Some(
                    LeaveReason::parse(&text).ok_or(StoreError::BadLeaveReason(text))?,
                ),
                None => None,
            };
            records.push(SessionRecord {
                id: SessionId(id),
                channel: ChannelId(channel as u64),
                user: UserId(uid as u64),
                started_at: ms_to_datetime(started),
                ended_at: ended.map(ms_to_datetime),
                data,
                leave_reason,
            });
        }
        Ok(records)
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spawn_test_store() -> (StoreHandle, TempDir) {
        let temp = TempDir::new().unwrap();
        let handle = SessionStore::spawn(&temp.path().join("index.db")).unwrap();
        (handle, temp)
    }

    fn at(ms: i64) -> DateTime<Utc> {
        ms_to_datetime(ms)
    }

    #[test]
    fn test_open_and_finalize_session() {
        let (store, _temp) = spawn_test_store();
        let id = store
            .open_session(UserId(1), ChannelId(2), at(1_000))
            .unwrap();

        store
            .finalize_session(id, at(5_000), LeaveReason::Natural, b"payload".to_vec())
            .unwrap();

        let records = store.sessions_since(UserId(1), at(0)).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_finished());
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].channel, ChannelId(2));
        assert_eq!(records[0].leave_reason, Some(LeaveReason::Natural));
        assert_eq!(records[0].data.as_deref(), Some(b"payload".as_slice()));
    }

    #[test]
    fn test_finalize_unknown_session_is_error() {
        let (store, _temp) = spawn_test_store();
        let result =
            store.finalize_session(SessionId(999), at(1), LeaveReason::Natural, vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn test_open_sessions_excluded_from_range_query() {
        let (store, _temp) = spawn_test_store();
        store
            .open_session(UserId(1), ChannelId(2), at(1_000))
            .unwrap();
        // Never finalized: data IS NULL, so the range query skips it.
        assert!(store.sessions_since(UserId(1), at(0)).unwrap().is_empty());
    }

    #[test]
    fn test_sessions_since_filters_and_orders() {
        let (store, _temp) = spawn_test_store();
        let user = UserId(7);
        // Insert out of chronological order on purpose.
        for (start, payload) in [(3_000i64, b"CCC"), (1_000, b"AAA"), (2_000, b"BBB")] {
            let id = store.open_session(user, ChannelId(1), at(start)).unwrap();
            store
                .finalize_session(id, at(start + 500), LeaveReason::Continued, payload.to_vec())
                .unwrap();
        }
        // One session for somebody else.
        let other = store.open_session(UserId(8), ChannelId(1), at(1_500)).unwrap();
        store
            .finalize_session(other, at(1_600), LeaveReason::Natural, b"XXX".to_vec())
            .unwrap();

        let records = store.sessions_since(user, at(1_500)).unwrap();
        let payloads: Vec<_> = records
            .iter()
            .map(|r| r.data.clone().unwrap())
            .collect();
        assert_eq!(payloads, vec![b"BBB".to_vec(), b"CCC".to_vec()]);

        let all = store.sessions_since(user, at(0)).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].data.as_deref(), Some(b"AAA".as_slice()));
    }

    #[test]
    fn test_latest_session_start() {
        let (store, _temp) = spawn_test_store();
        assert!(store.latest_session_start(UserId(1)).unwrap().is_none());

        store.open_session(UserId(1), ChannelId(2), at(1_000)).unwrap();
        store.open_session(UserId(1), ChannelId(2), at(9_000)).unwrap();

        let latest = store.latest_session_start(UserId(1)).unwrap().unwrap();
        assert_eq!(latest.timestamp_millis(), 9_000);
    }

    #[test]
    fn test_user_default_allow_on_first_sight() {
        let (store, _temp) = spawn_test_store();
        assert!(store.user_can_listen(UserId(42)).unwrap());
        // Second lookup reads the row created by the first.
        assert!(store.user_can_listen(UserId(42)).unwrap());
    }

    #[test]
    fn test_user_disallow_persists() {
        let (store, _temp) = spawn_test_store();
        store
            .set_user_can_listen(UserId(42), false, UserId(1))
            .unwrap();
        assert!(!store.user_can_listen(UserId(42)).unwrap());

        store
            .set_user_can_listen(UserId(42), true, UserId(1))
            .unwrap();
        assert!(store.user_can_listen(UserId(42)).unwrap());
    }

    #[test]
    fn test_channel_defaults() {
        let (store, _temp) = spawn_test_store();
        assert!(store.channel_can_listen(ChannelId(5)).unwrap());
        assert!(store.channel_autoconnect(ChannelId(5)).unwrap());

        store
            .set_channel_can_listen(ChannelId(5), false, UserId(1))
            .unwrap();
        assert!(!store.channel_can_listen(ChannelId(5)).unwrap());
        // Autoconnect flag is untouched by the can-listen flip.
        assert!(store.channel_autoconnect(ChannelId(5)).unwrap());
    }

    #[test]
    fn test_privacy_flips_are_audited() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("index.db");
        let store = SessionStore::spawn(&db_path).unwrap();

        store
            .set_user_can_listen(UserId(42), false, UserId(9))
            .unwrap();
        store
            .set_channel_can_listen(ChannelId(5), false, UserId(9))
            .unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let scope: Option<i64> = conn
            .query_row(
                "SELECT scope FROM audit_log WHERE event_type = ?1",
                params![AuditEvent::ChannelListeningDisabled.as_str()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(scope, Some(5));
    }

    #[test]
    fn test_bad_leave_reason_surfaces() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("index.db");
        let store = SessionStore::spawn(&db_path).unwrap();
        let id = store
            .open_session(UserId(1), ChannelId(2), at(1_000))
            .unwrap();
        store
            .finalize_session(id, at(2_000), LeaveReason::Natural, b"x".to_vec())
            .unwrap();

        let conn = Connection::open(&db_path).unwrap();
        conn.execute(
            "UPDATE sessions SET leave_reason = 'mystery' WHERE id = ?1",
            params![id.0],
        )
        .unwrap();

        let result = store.sessions_since(UserId(1), at(0));
        assert!(matches!(result, Err(StoreError::BadLeaveReason(_))));
    }

    #[test]
    fn test_fake_responder_substitutes_for_the_database() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = StoreHandle::from_channel(tx);
        std::thread::spawn(move || {
            while let Some(request) = rx.blocking_recv() {
                match request {
                    StoreRequest::UserCanListen { user, reply } => {
                        let _ = reply.send(Ok(user.0 % 2 == 0));
                    }
                    StoreRequest::OpenSession { reply, .. } => {
                        let _ = reply.send(Ok(SessionId(77)));
                    }
                    _ => {}
                }
            }
        });

        assert!(handle.user_can_listen(UserId(2)).unwrap());
        assert!(!handle.user_can_listen(UserId(3)).unwrap());
        assert_eq!(
            handle.open_session(UserId(1), ChannelId(1), at(0)).unwrap(),
            SessionId(77)
        );
    }

    #[test]
    fn test_dead_responder_is_disconnected() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let handle = StoreHandle::from_channel(tx);
        assert!(matches!(
            handle.user_can_listen(UserId(1)),
            Err(StoreError::Disconnected)
        ));
    }

    #[test]
    fn test_handle_clone_keeps_store_alive() {
        let (store, _temp) = spawn_test_store();
        let clone = store.clone();
        drop(store);
        // The thread only exits when all senders drop, so the clone still works.
        assert!(clone.user_can_listen(UserId(1)).is_ok());
    }
}
