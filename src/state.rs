//! Shared application state handed to every handler.

use crate::services::abuse::AbuseLedger;
use crate::services::session::SessionRegistry;
use crate::services::store::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Process-scoped state: the durable store plus the two in-memory tables.
/// Explicitly constructed, so tests get a fresh instance each.
#[derive(Clone)]
pub struct AppState {
    pub store: ObjectStore,
    pub sessions: Arc<SessionRegistry>,
    pub abuse: Arc<AbuseLedger>,
}

impl AppState {
    pub fn new(content_root: impl Into<PathBuf>) -> Self {
        let store = ObjectStore::new(content_root);
        let sessions = Arc::new(SessionRegistry::new(store.clone()));
        let abuse = Arc::new(AbuseLedger::new());
        Self {
            store,
            sessions,
            abuse,
        }
    }
}
