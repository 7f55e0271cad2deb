//! [`SessionStore`] implementation over the in-process key-value engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use protocol::{SessionRecord, TestEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::kv::{MemoryKv, Txn};
use super::{SessionDelta, SessionStore, StoreError, DEFAULT_SESSION_TTL_SECS};

/// Key of the build-keyed record view.
pub fn build_key(build_number: &str) -> String {
    format!("session:{}", build_number)
}

/// Key of the session-keyed record view.
pub fn session_key(session_id: &str) -> String {
    format!("session_hash:{}", session_id)
}

/// Key of a session's event log.
pub fn events_key(session_id: &str) -> String {
    format!("tests:{}", session_id)
}

const SESSION_KEY_PREFIX: &str = "session_hash:";

fn decode(key: &str, map: &HashMap<String, String>) -> Result<SessionRecord, StoreError> {
    SessionRecord::from_fields(map).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn read_session(tx: &Txn<'_>, session_id: &str) -> Result<SessionRecord, StoreError> {
    let key = session_key(session_id);
    match tx.hgetall(&key)? {
        Some(map) => decode(&key, &map),
        None => Err(StoreError::NotFound(session_id.to_string())),
    }
}

/// Session store backed by [`MemoryKv`].
///
/// Both record views and the event log expire together after the configured
/// time-to-live, so a session that is never finished does not linger.
pub struct KvSessionStore {
    kv: Arc<MemoryKv>,
    ttl: Duration,
}

impl KvSessionStore {
    /// Creates a store over `kv` with the given session time-to-live.
    pub fn new(kv: Arc<MemoryKv>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Creates a store over a fresh engine with the default time-to-live.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryKv::new()),
            Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
        )
    }

    /// The session time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The underlying engine.
    pub fn kv(&self) -> &Arc<MemoryKv> {
        &self.kv
    }

    /// Starts a background task that periodically purges expired keys.
    ///
    /// The task exits when `cancel` fires.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Session store sweeper stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match store.kv.purge_expired() {
                            Ok(0) => {}
                            Ok(purged) => {
                                tracing::info!(purged, "Purged expired session keys");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Session store sweep failed");
                            }
                        }
                    }
                }
            }
        })
    }
}

impl Default for KvSessionStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl SessionStore for KvSessionStore {
    async fn create_if_absent(
        &self,
        build_number: &str,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError> {
        let ttl = self.ttl;
        let record = self.kv.transaction(|tx| {
            let bkey = build_key(build_number);
            if tx.exists(&bkey) {
                return Err(StoreError::Conflict(build_number.to_string()));
            }

            let session_id = Uuid::new_v4().to_string();
            let record = SessionRecord::new_active(session_id, build_number, operator, now);
            let skey = session_key(&record.session_id);

            tx.hset(&bkey, record.to_fields())?;
            tx.hset(&skey, record.to_fields())?;
            tx.expire(&bkey, ttl);
            tx.expire(&skey, ttl);
            Ok(record)
        })?;

        tracing::info!(
            session_id = %record.session_id,
            build_number = %record.build_number,
            operator = %record.operator,
            "Created session record"
        );
        Ok(record)
    }

    async fn lookup_by_build(
        &self,
        build_number: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let key = build_key(build_number);
        match self.kv.hgetall(&key)? {
            Some(map) => decode(&key, &map).map(Some),
            None => Ok(None),
        }
    }

    async fn lookup_by_session(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        self.kv.transaction(|tx| read_session(tx, session_id))
    }

    async fn update(
        &self,
        session_id: &str,
        delta: SessionDelta,
    ) -> Result<SessionRecord, StoreError> {
        self.kv.transaction(|tx| {
            let mut record = read_session(tx, session_id)?;

            let bkey = build_key(&record.build_number);
            let mirror = match tx.hgetall(&bkey)? {
                Some(map) => decode(&bkey, &map)?,
                None => {
                    return Err(StoreError::Corrupt {
                        key: bkey,
                        reason: "build view missing for open session".to_string(),
                    })
                }
            };
            if mirror.session_id != record.session_id {
                return Err(StoreError::Corrupt {
                    key: bkey,
                    reason: format!(
                        "build view points at session {}, expected {}",
                        mirror.session_id, record.session_id
                    ),
                });
            }

            if delta.is_empty() {
                return Ok(record);
            }
            delta.apply(&mut record);
            tx.hset(&bkey, record.to_fields())?;
            tx.hset(&session_key(session_id), record.to_fields())?;
            Ok(record)
        })
    }

    async fn append_event(&self, session_id: &str, event: &TestEvent) -> Result<usize, StoreError> {
        let json = event.to_json().map_err(|e| StoreError::Corrupt {
            key: events_key(session_id),
            reason: e.to_string(),
        })?;

        self.kv.transaction(|tx| {
            let skey = session_key(session_id);
            if !tx.exists(&skey) {
                return Err(StoreError::NotFound(session_id.to_string()));
            }

            let ekey = events_key(session_id);
            let len = tx.rpush(&ekey, json)?;
            if len == 1 {
                if let Some(remaining) = tx.ttl(&skey) {
                    tx.expire(&ekey, remaining);
                }
            }
            Ok(len)
        })
    }

    async fn drain_events(&self, session_id: &str) -> Result<Vec<TestEvent>, StoreError> {
        let raw = self.kv.lrange_all(&events_key(session_id))?;
        let mut events = Vec::with_capacity(raw.len());
        for (index, entry) in raw.iter().enumerate() {
            match TestEvent::from_json(entry) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        index,
                        error = %e,
                        "Skipping undecodable event log entry"
                    );
                }
            }
        }
        Ok(events)
    }

    async fn event_count(&self, session_id: &str) -> Result<usize, StoreError> {
        self.kv.transaction(|tx| tx.llen(&events_key(session_id)))
    }

    async fn delete_session(&self, session_id: &str, build_number: &str) -> Result<(), StoreError> {
        let removed = self.kv.transaction(|tx| {
            let mut removed = 0;
            for key in [
                build_key(build_number),
                session_key(session_id),
                events_key(session_id),
            ] {
                if tx.del(&key) {
                    removed += 1;
                }
            }
            Ok(removed)
        })?;

        tracing::debug!(
            session_id = %session_id,
            build_number = %build_number,
            removed,
            "Deleted session keys"
        );
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut records = self.kv.transaction(|tx| {
            let mut records = Vec::new();
            for key in tx.keys(SESSION_KEY_PREFIX) {
                let Some(map) = tx.hgetall(&key)? else {
                    continue;
                };
                match decode(&key, &map) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!(error = %e, "Skipping corrupt session record"),
                }
            }
            Ok(records)
        })?;
        records.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(records)
    }
}
