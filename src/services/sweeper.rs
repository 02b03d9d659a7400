//! Background retention sweeper.
//!
//! Two cadences share one task: an hourly pass over persisted metadata that
//! removes expired objects, and a faster pass that evicts idle upload
//! sessions and compacts the abuse ledger. Individual entry failures are
//! logged and skipped; nothing aborts the loop.

use crate::services::abuse::AbuseLedger;
use crate::services::session::SessionRegistry;
use crate::services::store::ObjectStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

/// How often persisted metadata is scanned for expired objects.
const OBJECT_SWEEP_PERIOD: Duration = Duration::from_secs(3600);

/// How often idle sessions are evicted and the abuse ledger compacted.
const SESSION_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// A session untouched for this long is considered abandoned.
pub const SESSION_IDLE_WINDOW: Duration = Duration::from_secs(600);

/// Spawn the sweeper loop. The returned handle is only used to stop the loop
/// on shutdown.
pub fn spawn(
    store: ObjectStore,
    sessions: Arc<SessionRegistry>,
    abuse: Arc<AbuseLedger>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut object_tick = time::interval(OBJECT_SWEEP_PERIOD);
        let mut session_tick = time::interval(SESSION_SWEEP_PERIOD);
        loop {
            tokio::select! {
                _ = object_tick.tick() => {
                    sweep_objects_once(&store).await;
                }
                _ = session_tick.tick() => {
                    let evicted = sessions.evict_idle(SESSION_IDLE_WINDOW).await;
                    if evicted > 0 {
                        debug!("evicted {} idle upload sessions", evicted);
                    }
                    abuse.compact();
                }
            }
        }
    })
}

/// One pass over the content root: every object whose expiry has passed loses
/// both its record and blob. Unreadable entries are skipped, never deleted.
pub async fn sweep_objects_once(store: &ObjectStore) {
    let now = Utc::now();
    let mut entries = match tokio::fs::read_dir(store.content_root()).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!("retention sweep could not read content root: {}", err);
            return;
        }
    };
    let mut removed = 0usize;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("retention sweep stopped early: {}", err);
                break;
            }
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(id) = name.strip_suffix(".json") else {
            continue;
        };
        match store.read_record(id).await {
            Ok(object) if object.is_expired(now) => {
                if let Err(err) = store.remove_files(id).await {
                    warn!("failed to remove expired object {}: {}", id, err);
                } else {
                    removed += 1;
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("skipping unreadable record {}: {}", name, err);
            }
        }
    }
    if removed > 0 {
        debug!("retention sweep removed {} expired objects", removed);
    }
}
