use crate::core::config::SendCap;
use crate::core::errors::ClientError;
use crate::core::kernel::rate_limit::RestRateLimiter;
use crate::gateway::machine::SessionStatus;
use crate::gateway::session::{GatewayHandle, GatewaySession};
use crate::gateway::url::GatewayUrlCache;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Opaque id of a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

struct Entry {
    handle: GatewayHandle,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<Result<(), ClientError>>,
}

/// Owns every running session task, plus the state sessions share: the
/// REST rate limiter and the gateway URL cache.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Entry>,
    next_id: AtomicU64,
    limiter: Arc<RestRateLimiter>,
    urls: Arc<GatewayUrlCache>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SendCap::rest_default())
    }
}

impl SessionRegistry {
    pub fn new(rest_burst: SendCap) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            limiter: Arc::new(RestRateLimiter::new(rest_burst)),
            urls: Arc::new(GatewayUrlCache::new()),
        }
    }

    pub fn rate_limiter(&self) -> Arc<RestRateLimiter> {
        Arc::clone(&self.limiter)
    }

    pub fn url_cache(&self) -> Arc<GatewayUrlCache> {
        Arc::clone(&self.urls)
    }

    /// Start `session` on the runtime and track it
    pub fn spawn(
        &self,
        session: GatewaySession,
        handle: GatewayHandle,
        status: watch::Receiver<SessionStatus>,
    ) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = tokio::spawn(session.with_url_cache(self.url_cache()).run());
        self.sessions.insert(
            id,
            Entry {
                handle,
                status,
                task,
            },
        );
        info!(%id, "Session started");
        id
    }

    pub fn handle(&self, id: SessionId) -> Option<GatewayHandle> {
        self.sessions.get(&id).map(|e| e.handle.clone())
    }

    pub fn status(&self, id: SessionId) -> Option<SessionStatus> {
        self.sessions.get(&id).map(|e| e.status.borrow().clone())
    }

    pub fn watch_status(&self, id: SessionId) -> Option<watch::Receiver<SessionStatus>> {
        self.sessions.get(&id).map(|e| e.status.clone())
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Wait for a session to end on its own and forget it
    pub async fn wait(&self, id: SessionId) -> Option<Result<(), ClientError>> {
        let (_, entry) = self.sessions.remove(&id)?;
        Some(join(id, entry.task).await)
    }

    /// Disconnect a session, wait for it to stop and forget it
    pub async fn remove(&self, id: SessionId) -> Option<Result<(), ClientError>> {
        let (_, entry) = self.sessions.remove(&id)?;
        // A session that already stopped has dropped its receiver
        if let Err(e) = entry.handle.disconnect().await {
            info!(%id, error = %e, "Session already stopped");
        }
        Some(join(id, entry.task).await)
    }

    /// Disconnect every session
    pub async fn shutdown_all(&self) {
        for id in self.ids() {
            if let Some(Err(e)) = self.remove(id).await {
                warn!(%id, error = %e, "Session ended with error");
            }
        }
    }
}

async fn join(id: SessionId, task: JoinHandle<Result<(), ClientError>>) -> Result<(), ClientError> {
    task.await
        .map_err(|e| ClientError::Other(format!("{} task failed: {}", id, e)))?
}
