//! Host integration.
//!
//! An HTTP transport is built as an [`McpApp`]: an axum [`Router`] plus a
//! [`Lifespan`] that owns the app's session manager. The router refuses
//! every request with 503 until the lifespan is started, so an app mounted
//! into a host that forgot to start it fails loudly instead of hanging.
//!
//! [`HostApp`] composes apps and custom routes into a tree. Mounting hands
//! each child's lifespans up to the parent, so only the root starts them,
//! and each exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::routing::MethodRouter;
use axum::Router;
use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::error::ServerError;
use crate::mcp::manager::{ManagerSlot, SessionManager};
use crate::mcp::session::DrainReport;

/// Startup and shutdown hooks of one mounted app.
///
/// Dropping a lifespan that was never started logs an integration error.
#[derive(Debug)]
pub struct Lifespan {
    mount: String,
    manager: Arc<SessionManager>,
    slot: ManagerSlot,
    started: AtomicBool,
}

impl Lifespan {
    pub(crate) fn new(slot: ManagerSlot, manager: Arc<SessionManager>) -> Self {
        Self {
            mount: slot.mount(),
            manager,
            slot,
            started: AtomicBool::new(false),
        }
    }

    /// Full mount path of the app's endpoint.
    #[must_use]
    pub fn mount(&self) -> &str {
        &self.mount
    }

    /// The session manager this lifespan installs.
    #[must_use]
    pub const fn session_manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Returns true once [`startup`](Self::startup) has run.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Installs the session manager so the app starts serving.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::LifespanAlreadyStarted`] on a second call.
    pub fn startup(&self) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::LifespanAlreadyStarted {
                mount: self.mount.clone(),
            });
        }
        self.manager.registry().server_started();
        self.slot.install(Arc::clone(&self.manager));
        tracing::info!(mount = %self.mount, "MCP app started");
        Ok(())
    }

    /// Prepends a host's mount prefix to this app's path.
    fn prefix(&mut self, prefix: &str) {
        self.mount = format!("{prefix}{}", self.mount);
        self.slot.set_mount(self.mount.clone());
    }

    /// Stops accepting requests and drains every session.
    pub async fn shutdown(&self) -> DrainReport {
        self.slot.take();
        let report = self.manager.shutdown().await;
        tracing::info!(
            mount = %self.mount,
            completed = report.completed,
            abandoned = report.abandoned,
            "MCP app stopped"
        );
        report
    }
}

impl Drop for Lifespan {
    fn drop(&mut self) {
        if !self.is_started() {
            tracing::error!(
                mount = %self.mount,
                "MCP app lifespan was dropped without being started; every request to it was \
                 refused. Start the lifespan from the outermost host application"
            );
        }
    }
}

/// A mountable MCP app: a router and the lifespan that powers it.
#[derive(Debug)]
pub struct McpApp {
    router: Router,
    lifespan: Lifespan,
}

impl McpApp {
    pub(crate) const fn new(router: Router, lifespan: Lifespan) -> Self {
        Self { router, lifespan }
    }

    /// The app's router. Requests fail with 503 until the lifespan starts.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// The app's lifespan.
    #[must_use]
    pub const fn lifespan(&self) -> &Lifespan {
        &self.lifespan
    }

    /// Hands the router and lifespan to a foreign host, which must call
    /// [`Lifespan::startup`] once and [`Lifespan::shutdown`] on exit.
    #[must_use]
    pub fn into_parts(self) -> (Router, Lifespan) {
        (self.router, self.lifespan)
    }

    /// Starts the app as its own root host.
    ///
    /// # Errors
    ///
    /// Returns an error if the lifespan was already started.
    pub fn start(self) -> Result<RunningHost, ServerError> {
        HostApp::new().mount("/", self)?.start()
    }
}

/// Something that can be mounted into a [`HostApp`].
pub trait IntoMount {
    /// Splits into a router and the lifespans the parent takes over.
    fn into_mount(self) -> (Router, Vec<Lifespan>);
}

impl IntoMount for McpApp {
    fn into_mount(self) -> (Router, Vec<Lifespan>) {
        (self.router, vec![self.lifespan])
    }
}

impl IntoMount for HostApp {
    fn into_mount(self) -> (Router, Vec<Lifespan>) {
        (self.router, self.lifespans)
    }
}

/// A tree of mounted apps and custom routes.
#[derive(Debug, Default)]
pub struct HostApp {
    router: Router,
    lifespans: Vec<Lifespan>,
}

impl HostApp {
    /// Creates an empty host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a custom route.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidRoute`] if `path` does not start with `/`.
    ///
    /// # Panics
    ///
    /// Panics if `path` is already routed, as [`Router::route`] does.
    pub fn route(mut self, path: &str, handler: MethodRouter) -> Result<Self, ServerError> {
        if !path.starts_with('/') {
            return Err(ServerError::invalid_route(path, "path must start with '/'"));
        }
        self.router = self.router.route(path, handler);
        Ok(self)
    }

    /// Mounts `child` under `prefix` and takes over its lifespans.
    ///
    /// `""` and `"/"` merge the child into this router.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidRoute`] if `prefix` does not start with `/`.
    pub fn mount(mut self, prefix: &str, child: impl IntoMount) -> Result<Self, ServerError> {
        let trimmed = prefix.trim_end_matches('/');
        if !trimmed.is_empty() && !trimmed.starts_with('/') {
            return Err(ServerError::invalid_route(prefix, "mount prefix must start with '/'"));
        }

        let (router, lifespans) = child.into_mount();
        self.router = if trimmed.is_empty() {
            self.router.merge(router)
        } else {
            self.router.nest(trimmed, router)
        };

        for mut lifespan in lifespans {
            lifespan.prefix(trimmed);
            tracing::debug!(mount = %lifespan.mount, "Delegated lifespan to parent host");
            self.lifespans.push(lifespan);
        }
        Ok(self)
    }

    /// Mount paths of the lifespans this host owns.
    #[must_use]
    pub fn mounts(&self) -> Vec<&str> {
        self.lifespans.iter().map(Lifespan::mount).collect()
    }

    /// Hands the router and every lifespan to a foreign host.
    #[must_use]
    pub fn into_parts(self) -> (Router, Vec<Lifespan>) {
        (self.router, self.lifespans)
    }

    /// Starts every lifespan, making this host the root.
    ///
    /// # Errors
    ///
    /// Returns an error if any lifespan was already started.
    pub fn start(self) -> Result<RunningHost, ServerError> {
        for lifespan in &self.lifespans {
            lifespan.startup()?;
        }
        Ok(RunningHost {
            router: self.router,
            lifespans: self.lifespans,
        })
    }
}

/// A started root host.
#[derive(Debug)]
pub struct RunningHost {
    router: Router,
    lifespans: Vec<Lifespan>,
}

impl RunningHost {
    /// The complete router.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Drains every mounted app.
    pub async fn shutdown(self) -> DrainReport {
        shutdown_all(&self.lifespans).await
    }

    /// Serves on `listener` until `shutdown` completes.
    ///
    /// Sessions are drained before connections are closed, so open event
    /// streams end cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<DrainReport, ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self { router, lifespans } = self;
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, apps = lifespans.len(), "Listening on http://{addr}");
        }

        let (report_tx, report_rx) = oneshot::channel();
        let drain_first = async move {
            shutdown.await;
            let report = shutdown_all(&lifespans).await;
            let _ = report_tx.send(report);
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(drain_first)
            .await?;
        Ok(report_rx.await.unwrap_or_default())
    }
}

async fn shutdown_all(lifespans: &[Lifespan]) -> DrainReport {
    let reports = join_all(lifespans.iter().map(Lifespan::shutdown)).await;
    reports.into_iter().fold(DrainReport::default(), |total, r| DrainReport {
        completed: total.completed + r.completed,
        abandoned: total.abandoned + r.abandoned,
    })
}
