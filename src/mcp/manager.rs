//! Session ownership.
//!
//! The [`SessionManager`] is the only owner of live sessions. Transport
//! adapters get a [`SessionHandle`], a weak reference that stops resolving
//! once the manager has dropped the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures_util::future::join_all;
use tokio::sync::mpsc;

use crate::error::ServerError;
use crate::mcp::protocol::ServerInfo;
use crate::mcp::registry::Registry;
use crate::mcp::session::{DrainReport, Envelope, Session, SessionOptions};
use crate::mcp::transport::TransportKind;

/// Creates, tracks and drains the sessions of one server.
#[derive(Debug)]
pub struct SessionManager {
    registry: Arc<Registry>,
    info: Arc<ServerInfo>,
    options: SessionOptions,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    /// Creates a manager with no sessions.
    #[must_use]
    pub fn new(registry: Arc<Registry>, info: ServerInfo, options: SessionOptions) -> Self {
        Self {
            registry,
            info: Arc::new(info),
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The registry new sessions snapshot.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Options applied to every session.
    #[must_use]
    pub const fn options(&self) -> SessionOptions {
        self.options
    }

    /// Opens a session against the current registry snapshot.
    pub fn create(&self, transport: TransportKind) -> (Arc<Session>, mpsc::Receiver<Envelope>) {
        let (session, rx) = Session::new(
            transport,
            self.registry.snapshot(),
            Arc::clone(&self.info),
            self.options,
        );
        self.lock()
            .insert(session.id().to_string(), Arc::clone(&session));
        (session, rx)
    }

    /// Looks up a live session.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    /// Removes a session and drains it. Returns `None` for unknown IDs.
    pub async fn close(&self, id: &str) -> Option<DrainReport> {
        let session = self.lock().remove(id)?;
        Some(session.drain(self.options.drain_grace).await)
    }

    /// Drains every session concurrently and returns the combined report.
    pub async fn shutdown(&self) -> DrainReport {
        let sessions: Vec<Arc<Session>> = self.lock().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return DrainReport::default();
        }
        tracing::info!(sessions = sessions.len(), "Draining all sessions");

        let grace = self.options.drain_grace;
        let reports = join_all(sessions.iter().map(|s| s.drain(grace))).await;
        reports.into_iter().fold(DrainReport::default(), |total, r| DrainReport {
            completed: total.completed + r.completed,
            abandoned: total.abandoned + r.abandoned,
        })
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// IDs of live sessions.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Where an HTTP app finds its session manager.
///
/// The slot starts empty. The app's [`Lifespan`](crate::mcp::host::Lifespan)
/// fills it on startup and empties it on shutdown, so a router whose lifespan
/// never ran refuses every request instead of silently serving nothing.
#[derive(Debug, Clone)]
pub struct ManagerSlot {
    mount: Arc<RwLock<String>>,
    manager: Arc<RwLock<Option<Arc<SessionManager>>>>,
}

impl ManagerSlot {
    /// Creates an empty slot for the app mounted at `mount`.
    #[must_use]
    pub fn new(mount: &str) -> Self {
        Self {
            mount: Arc::new(RwLock::new(mount.to_string())),
            manager: Arc::new(RwLock::new(None)),
        }
    }

    /// Mount path used in diagnostics, including any host prefixes.
    #[must_use]
    pub fn mount(&self) -> String {
        self.mount.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_mount(&self, mount: String) {
        *self.mount.write().unwrap_or_else(PoisonError::into_inner) = mount;
    }

    /// The installed manager.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::LifespanNotStarted`] while the slot is empty.
    pub fn get(&self) -> Result<Arc<SessionManager>, ServerError> {
        self.manager
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ServerError::LifespanNotStarted { mount: self.mount() })
    }

    pub(crate) fn install(&self, manager: Arc<SessionManager>) {
        *self.manager.write().unwrap_or_else(PoisonError::into_inner) = Some(manager);
    }

    pub(crate) fn take(&self) -> Option<Arc<SessionManager>> {
        self.manager
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Non-owning reference to a session, held by transport adapters.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    session: Weak<Session>,
}

impl SessionHandle {
    /// Creates a handle to `session`.
    #[must_use]
    pub fn new(session: &Arc<Session>) -> Self {
        Self {
            id: Arc::from(session.id()),
            session: Arc::downgrade(session),
        }
    }

    /// Session ID, available even after the session is gone.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolves the session if it is still owned by the manager.
    #[must_use]
    pub fn upgrade(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }
}
