//! Connected-client registry and heartbeat staleness sweep

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use tether_common::heartbeat;

/// Grace period past the heartbeat interval before a session counts as stale.
pub const HEARTBEAT_GRACE: Duration = Duration::from_millis(2500);

/// Extra delay between sweeps on top of the heartbeat interval.
pub const SWEEP_SLACK: Duration = Duration::from_millis(5000);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: Uuid,
    pub client_id: Option<String>,
    pub authenticated: bool,
    pub state_counter: u64,
    pub last_heartbeat_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    /// Fired when the registry drops this session, so its connection can close.
    pub kick: Arc<Notify>,
}

impl ClientSession {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: None,
            authenticated: false,
            state_counter: 0,
            last_heartbeat_at: now,
            connected_at: now,
            kick: Arc::new(Notify::new()),
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        let elapsed = now.signed_duration_since(self.last_heartbeat_at);
        match elapsed.to_std() {
            Ok(elapsed) => elapsed > interval + HEARTBEAT_GRACE,
            Err(_) => false,
        }
    }
}

/// Sole owner of every live session. Handlers hold ids, never references.
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, ClientSession>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            sweeper: Mutex::new(None),
        }
    }

    /// Creates an unauthenticated session for a fresh transport connection.
    pub fn register(&self, now: DateTime<Utc>) -> ClientSession {
        let session = ClientSession::new(now);
        self.sessions.write().insert(session.id, session.clone());
        debug!("Session {} registered", session.id);
        session
    }

    pub fn authenticate(&self, id: Uuid, client_id: &str) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id).ok_or(RegistryError::SessionNotFound(id))?;
        session.authenticated = true;
        session.client_id = Some(client_id.to_string());
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<ClientSession, RegistryError> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::SessionNotFound(id))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn is_authenticated(&self, id: Uuid) -> bool {
        self.sessions
            .read()
            .get(&id)
            .map(|s| s.authenticated)
            .unwrap_or(false)
    }

    pub fn remove(&self, id: Uuid) -> Option<ClientSession> {
        self.sessions.write().remove(&id)
    }

    /// Applies the reconciliation rule to a reported counter and stamps the session.
    pub fn record_heartbeat(
        &self,
        id: Uuid,
        reported: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, RegistryError> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id).ok_or(RegistryError::SessionNotFound(id))?;
        session.state_counter = heartbeat::reconcile(session.state_counter, reported);
        session.last_heartbeat_at = now;
        Ok(session.state_counter)
    }

    /// Removes every session whose last heartbeat is older than `interval` plus grace.
    pub fn sweep(&self, now: DateTime<Utc>, interval: Duration) -> Vec<Uuid> {
        let mut sessions = self.sessions.write();
        let stale: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.is_stale(now, interval))
            .map(|s| s.id)
            .collect();

        for id in &stale {
            if let Some(session) = sessions.remove(id) {
                info!("Session {} timed out", id);
                session.kick.notify_one();
            }
        }

        stale
    }

    /// Starts the periodic sweep. A running sweeper is replaced.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let period = interval + SWEEP_SLACK;
        let registry = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let removed = registry.sweep(Utc::now(), interval);
                if !removed.is_empty() {
                    debug!("Sweep removed {} session(s)", removed.len());
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let registry = SessionRegistry::new();
        let session = registry.register(Utc::now());
        assert!(!registry.is_authenticated(session.id));

        registry.authenticate(session.id, "client-1").unwrap();
        assert!(registry.is_authenticated(session.id));
        assert_eq!(registry.get(session.id).unwrap().client_id.as_deref(), Some("client-1"));

        registry.remove(session.id);
        assert!(!registry.contains(session.id));
        assert!(registry.authenticate(session.id, "client-1").is_err());
    }

    #[test]
    fn test_heartbeat_reconciliation() {
        let registry = SessionRegistry::new();
        let id = registry.register(Utc::now()).id;
        let now = Utc::now();

        assert_eq!(registry.record_heartbeat(id, 0, now).unwrap(), 1);
        assert_eq!(registry.record_heartbeat(id, 1, now).unwrap(), 2);
        assert_eq!(registry.record_heartbeat(id, 0, now).unwrap(), 2);
        assert_eq!(registry.record_heartbeat(id, 10, now).unwrap(), 10);
    }

    #[test]
    fn test_heartbeat_after_removal_fails() {
        let registry = SessionRegistry::new();
        let id = registry.register(Utc::now()).id;
        registry.remove(id);
        assert!(matches!(
            registry.record_heartbeat(id, 0, Utc::now()),
            Err(RegistryError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_sweep_removes_stale_sessions() {
        let registry = SessionRegistry::new();
        let interval = Duration::from_millis(10_000);
        let start = Utc::now();

        let stale = registry.register(start);
        let fresh = registry.register(start);
        let later = start + chrono::Duration::milliseconds(12_600);
        registry.record_heartbeat(fresh.id, 0, later).unwrap();

        let removed = registry.sweep(later, interval);
        assert_eq!(removed, vec![stale.id]);
        assert!(!registry.contains(stale.id));
        assert!(registry.contains(fresh.id));
    }

    #[test]
    fn test_sweep_keeps_sessions_within_grace() {
        let registry = SessionRegistry::new();
        let start = Utc::now();
        let session = registry.register(start);

        let within = start + chrono::Duration::milliseconds(12_400);
        assert!(registry.sweep(within, Duration::from_millis(10_000)).is_empty());
        assert!(registry.contains(session.id));
    }

    #[tokio::test]
    async fn test_sweep_notifies_connection() {
        let registry = SessionRegistry::new();
        let start = Utc::now();
        let session = registry.register(start);

        registry.sweep(start + chrono::Duration::seconds(60), Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(1), session.kick.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_start_stop() {
        let registry = Arc::new(SessionRegistry::new());
        registry.start_sweeper(Duration::from_millis(10));
        registry.start_sweeper(Duration::from_millis(10));
        registry.stop_sweeper();
        assert!(registry.sweeper.lock().is_none());
    }
}
