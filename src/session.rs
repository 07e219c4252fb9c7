//! Session identity and the registry of live sessions.

use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use tokio::task::JoinHandle;

/// Opaque token identifying one live language-server process, assigned by
/// the supervisor at start time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry key: at most one session exists per (language, project root).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ServerKey {
    pub language: String,
    pub root: PathBuf,
}

impl ServerKey {
    pub(crate) fn new(language: &str, root: &Path) -> Self {
        Self {
            language: language.to_string(),
            root: root.to_path_buf(),
        }
    }
}

pub(crate) struct Session {
    pub id: SessionId,
    pub language: String,
    pub root: PathBuf,
    pub initialized: bool,
    /// Open document URI -> synchronization version
    pub documents: HashMap<String, i32>,
    pub ref_count: u32,
    /// Scheduled idle teardown; aborted whenever the session is reacquired
    pub idle_cleanup: Option<JoinHandle<()>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, language: String, root: PathBuf) -> Self {
        Self {
            id,
            language,
            root,
            initialized: false,
            documents: HashMap::new(),
            ref_count: 1,
            idle_cleanup: None,
        }
    }

    pub(crate) fn cancel_idle_cleanup(&mut self) {
        if let Some(handle) = self.idle_cleanup.take() {
            handle.abort();
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            language: self.language.clone(),
            root: self.root.clone(),
            initialized: self.initialized,
            ref_count: self.ref_count,
            open_documents: self.documents.len(),
        }
    }
}

/// Point-in-time snapshot of one session, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub language: String,
    pub root: PathBuf,
    pub initialized: bool,
    pub ref_count: u32,
    pub open_documents: usize,
}

/// Live sessions, indexed by id and by (language, root).
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_key: HashMap<ServerKey, SessionId>,
}

impl SessionRegistry {
    pub(crate) fn insert(&mut self, session: Session) {
        let key = ServerKey::new(&session.language, &session.root);
        self.by_key.insert(key, session.id.clone());
        self.sessions.insert(session.id.clone(), session);
    }

    pub(crate) fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(id)?;
        self.by_key
            .remove(&ServerKey::new(&session.language, &session.root));
        session.cancel_idle_cleanup();
        Some(session)
    }

    pub(crate) fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub(crate) fn id_for_key(&self, key: &ServerKey) -> Option<&SessionId> {
        self.by_key.get(key)
    }

    pub(crate) fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn registry_indexes_by_key_and_id() {
        let mut registry = SessionRegistry::default();
        let id = SessionId::new("s1");
        registry.insert(Session::new(
            id.clone(),
            "go".to_string(),
            PathBuf::from("/repo"),
        ));

        let key = ServerKey::new("go", Path::new("/repo"));
        assert_eq!(registry.id_for_key(&key), Some(&id));
        assert_eq!(registry.get(&id).map(|s| s.ref_count), Some(1));

        let removed = registry.remove(&id).expect("session present");
        assert_eq!(removed.id, id);
        assert_eq!(registry.id_for_key(&key), None);
        assert!(registry.get(&id).is_none());
    }
}
