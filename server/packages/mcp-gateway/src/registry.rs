//! Process-wide registry of live streaming sessions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::session::SessionHandle;

/// Concurrency-safe map from connection id to session handle.
///
/// The registry only guards its own map; it never holds the lock across an
/// event write or a process operation. A session is present exactly while
/// its output stream is still live: `unregister` is final, a later `get`
/// for the same id returns `None`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<SessionHandle>) {
        let mut sessions = self.sessions.write().expect("registry lock");
        sessions.insert(session.connection_id().to_string(), session.clone());
    }

    pub fn unregister(&self, connection_id: &str) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.sessions.write().expect("registry lock");
        sessions.remove(connection_id)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<SessionHandle>> {
        let sessions = self.sessions.read().expect("registry lock");
        sessions.get(connection_id).cloned()
    }

    /// All live sessions attached to a configuration. Several clients may
    /// stream the same configuration at once.
    pub fn list_by_config(&self, config_id: i64) -> Vec<Arc<SessionHandle>> {
        let sessions = self.sessions.read().expect("registry lock");
        sessions
            .values()
            .filter(|session| session.config_id() == config_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every session, used during server shutdown.
    pub fn drain(&self) -> Vec<Arc<SessionHandle>> {
        let mut sessions = self.sessions.write().expect("registry lock");
        sessions.drain().map(|(_, session)| session).collect()
    }
}
