//! In-memory upload sessions and their registry.
//!
//! An `UploadSession` tracks one in-flight (or just-finished) upload: how many
//! bytes of the blob are safely readable, whether the writer finished or gave
//! up, and when it last made progress. Concurrent downloads of the same object
//! attach to the session and block on its change signal instead of polling the
//! filesystem.
//!
//! The `SessionRegistry` owns the id-to-session table and is the only place
//! object identifiers are minted, so uniqueness against both live sessions and
//! persisted objects is decided inside a single critical section.

use crate::identity::random_digits;
use crate::services::store::ObjectStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::debug;
use uuid::Uuid;

/// Shortest identifier the registry will mint; collisions widen it.
const MIN_ID_DIGITS: usize = 6;

/// How long a blocked reader waits in one slice before re-checking state.
const WAIT_SLICE: Duration = Duration::from_secs(5);

/// A reader observing no progress for this long gives up on the upload.
const STALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Why a blocked reader stopped waiting for more data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("upload was cancelled")]
    Cancelled,
    #[error("timed out waiting for upload data")]
    Stalled,
}

/// Successful outcome of [`UploadSession::await_more_data`].
#[derive(Debug, PartialEq, Eq)]
pub enum SessionProgress {
    /// More bytes became readable; the value is the new available cursor.
    Advanced(i64),
    /// The writer finished; the value is the final available cursor.
    Finished(i64),
}

#[derive(Clone, Debug)]
struct SessionState {
    available: i64,
    complete: bool,
    cancelled: bool,
    last_activity: Instant,
}

/// One in-flight upload.
///
/// The single writer mutates state through `advance` / `mark_complete` /
/// `mark_cancelled`; any number of readers observe it through accessors and
/// `await_more_data`. All mutation goes through a `watch` channel so every
/// state change wakes every waiter.
#[derive(Debug)]
pub struct UploadSession {
    id: String,
    owner: Uuid,
    declared_size: i64,
    updates: watch::Sender<SessionState>,
}

impl UploadSession {
    fn new(id: String, owner: Uuid, declared_size: i64) -> Self {
        let (updates, _) = watch::channel(SessionState {
            available: 0,
            complete: false,
            cancelled: false,
            last_activity: Instant::now(),
        });
        Self {
            id,
            owner,
            declared_size,
            updates,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Declared total size of the upload; -1 when unknown.
    pub fn declared_size(&self) -> i64 {
        self.declared_size
    }

    /// Byte offset up to which the blob is guaranteed fully written.
    pub fn available(&self) -> i64 {
        self.updates.borrow().available
    }

    pub fn is_complete(&self) -> bool {
        self.updates.borrow().complete
    }

    pub fn is_cancelled(&self) -> bool {
        self.updates.borrow().cancelled
    }

    /// Time since the writer last made progress or changed state.
    pub fn idle_for(&self) -> Duration {
        self.updates.borrow().last_activity.elapsed()
    }

    /// Publish a new available cursor. The caller is the single upload writer
    /// and must only move the cursor forward; bytes must already be on disk.
    /// Writes arriving after cancellation are discarded silently.
    pub fn advance(&self, new_available: i64) {
        self.updates.send_modify(|state| {
            if state.cancelled {
                return;
            }
            debug_assert!(
                new_available >= state.available,
                "available cursor must not decrease"
            );
            state.available = new_available;
            state.last_activity = Instant::now();
        });
    }

    /// Transition to the successful terminal state and wake all waiters.
    pub fn mark_complete(&self) {
        self.updates.send_modify(|state| {
            if state.complete || state.cancelled {
                return;
            }
            state.complete = true;
            state.last_activity = Instant::now();
        });
    }

    /// Transition to the failed terminal state and wake all waiters.
    pub fn mark_cancelled(&self) {
        self.updates.send_modify(|state| {
            if state.complete || state.cancelled {
                return;
            }
            state.cancelled = true;
            state.last_activity = Instant::now();
        });
    }

    /// Block until the available cursor moves past `current`, the session
    /// reaches a terminal state, or the stall timeout fires.
    ///
    /// The timeout is local to this call: it is measured from the moment the
    /// reader starts waiting, so a reader attaching after a stall began still
    /// gets a full window. Waits are sliced so a wake is never needed just to
    /// notice the deadline.
    pub async fn await_more_data(&self, current: i64) -> Result<SessionProgress, WaitError> {
        let mut changes = self.updates.subscribe();
        let deadline = Instant::now() + STALL_TIMEOUT;
        loop {
            {
                let state = changes.borrow_and_update();
                if state.cancelled {
                    return Err(WaitError::Cancelled);
                }
                if state.available > current {
                    return Ok(SessionProgress::Advanced(state.available));
                }
                if state.complete {
                    return Ok(SessionProgress::Finished(state.available));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Stalled);
            }
            let slice = WAIT_SLICE.min(deadline - now);
            let _ = time::timeout_at(now + slice, changes.changed()).await;
        }
    }
}

/// Table of live upload sessions, keyed by object identifier.
///
/// All table operations share one mutex. The lock is only ever held for map
/// mutation and path existence checks, never across blob I/O or an await.
pub struct SessionRegistry {
    store: ObjectStore,
    sessions: Mutex<HashMap<String, Arc<UploadSession>>>,
}

impl SessionRegistry {
    pub fn new(store: ObjectStore) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a previously-unused identifier and register a session for it.
    ///
    /// Candidates start at six digits and gain a digit per collision, so ids
    /// stay short while uniqueness holds against both the live table and the
    /// persisted blob/record paths at reservation time.
    pub fn reserve(&self, owner: Uuid, declared_size: i64) -> Arc<UploadSession> {
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        let mut digits = MIN_ID_DIGITS;
        let id = loop {
            let candidate = random_digits(digits);
            digits += 1;
            if !sessions.contains_key(&candidate) && !self.store.object_exists(&candidate) {
                break candidate;
            }
        };
        let session = Arc::new(UploadSession::new(id.clone(), owner, declared_size));
        sessions.insert(id, Arc::clone(&session));
        session
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .get(id)
            .cloned()
    }

    /// Cancel the session for `id`, if one is live. Returns whether one was.
    pub fn cancel(&self, id: &str) -> bool {
        match self.lookup(id) {
            Some(session) => {
                session.mark_cancelled();
                true
            }
            None => false,
        }
    }

    /// Detach a session from the table.
    ///
    /// A session that never completed takes its partial blob and record with
    /// it: the object never existed as far as consumers are concerned.
    pub async fn remove(&self, id: &str) {
        let session = self
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .remove(id);
        if let Some(session) = session {
            if !session.is_complete() {
                session.mark_cancelled();
                if let Err(err) = self.store.remove_files(session.id()).await {
                    debug!("failed to discard partial upload {}: {}", session.id(), err);
                }
            }
        }
    }

    /// Remove every session idle for longer than `max_idle`. Returns how many
    /// were evicted.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = {
            let sessions = self.sessions.lock().expect("session table lock poisoned");
            sessions
                .iter()
                .filter(|(_, session)| session.idle_for() > max_idle)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &stale {
            debug!("evicting idle upload session {}", id);
            self.remove(id).await;
        }
        stale.len()
    }

    /// Cancel and drop every live session. Used on shutdown; partial blobs
    /// are left for the retention sweep.
    pub fn drain(&self) {
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        for session in sessions.values() {
            session.mark_cancelled();
        }
        sessions.clear();
    }

    pub fn active(&self) -> usize {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .len()
    }
}
