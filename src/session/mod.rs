use crate::executor::{SshError, SshSession};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type SessionId = String;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session '{0}' is already registered")]
    Duplicate(SessionId),
}

/// What the registry needs from a stored session: teardown and idle age.
/// `SshSession` is the production type; tests register stubs.
#[async_trait]
pub trait ManagedSession: Send + Sync + 'static {
    async fn disconnect(&self) -> Result<(), SshError>;
    fn idle_for(&self) -> Duration;
}

#[async_trait]
impl ManagedSession for SshSession {
    async fn disconnect(&self) -> Result<(), SshError> {
        SshSession::disconnect(self).await
    }

    fn idle_for(&self) -> Duration {
        self.activity().idle_for()
    }
}

/// Process-global store of live SSH sessions, keyed by the client's
/// session id. The registry is the sole owner of its sessions: nothing
/// else calls `disconnect` on a stored session directly.
pub struct SessionRegistry<S: ManagedSession = SshSession> {
    entries: DashMap<SessionId, Arc<S>>,
}

impl<S: ManagedSession> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ManagedSession> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a session. A second registration under the same id is a
    /// protocol violation; the first session is retained.
    pub fn put(&self, id: &str, session: Arc<S>) -> Result<(), RegistryError> {
        match self.entries.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::Duplicate(id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<S>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict and tear down a session. Disconnect failures are logged, not
    /// propagated; eviction always succeeds.
    pub async fn remove(&self, id: &str) {
        if let Some((_, session)) = self.entries.remove(id) {
            if let Err(e) = session.disconnect().await {
                tracing::warn!(session = %id, "disconnect during eviction failed: {}", e);
            }
            tracing::debug!(session = %id, "session evicted");
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&SessionId, &Arc<S>)) {
        for entry in self.entries.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Ids of sessions with no byte I/O for at least `ttl`. The caller runs
    /// the full cancellation routine for each; the registry only reports.
    pub fn collect_idle(&self, ttl: Duration) -> Vec<SessionId> {
        let mut idle = Vec::new();
        self.for_each(|id, session| {
            if session.idle_for() >= ttl {
                idle.push(id.clone());
            }
        });
        idle
    }
}
