//! Pipeline manager with a hot-swappable request router
//!
//! Registrations go into a staged router that is published after every change.
//! The listener never sees the staged router directly: each request loads the
//! active router from an [`ArcSwap`], so a reload replaces every route in one
//! atomic store.

use super::{Pipeline, PipelineError, metrics_handler};
use crate::document::ConfigHash;
use arc_swap::ArcSwap;
use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{MethodRouter, get, post},
};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

/// Lifecycle events delivered to the process main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Re-read configuration and rebuild every pipeline
    Reload,
    /// Current state cannot be served; exit so a supervisor restarts the process
    Restart,
    /// Drain and stop
    Terminate,
}

struct Staged {
    router: Router,
    pipelines: Vec<Arc<Pipeline>>,
    routes: BTreeSet<String>,
}

impl Staged {
    fn empty() -> Self {
        Self {
            router: Router::new(),
            pipelines: Vec::new(),
            routes: BTreeSet::new(),
        }
    }
}

struct ManagerCore {
    staged: Mutex<Staged>,
    active: ArcSwap<Router>,
}

impl ManagerCore {
    fn staged(&self) -> std::sync::MutexGuard<'_, Staged> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add every binding to the staged router and publish it in one swap
    ///
    /// Nothing is bound when any path is already registered or repeated.
    fn bind_all(&self, bindings: Vec<Binding>) -> Result<(), PipelineError> {
        let mut staged = self.staged();

        let mut paths = BTreeSet::new();
        for binding in &bindings {
            if staged.routes.contains(&binding.path) || !paths.insert(binding.path.as_str()) {
                return Err(PipelineError::DuplicateRoute(binding.path.clone()));
            }
        }

        for binding in bindings {
            staged.router =
                std::mem::take(&mut staged.router).route(&binding.path, binding.route);
            if let Some(pipeline) = binding.pipeline {
                staged.pipelines.push(pipeline);
            }
            tracing::info!(endpoint = %binding.path, "Endpoint registered");
            staged.routes.insert(binding.path);
        }
        self.active.store(Arc::new(staged.router.clone()));

        Ok(())
    }

    /// Publish an empty router, then unregister the collectors of every dropped pipeline
    ///
    /// The staging lock is released before unregistering: unregistering waits for
    /// in-flight collections of the same registry.
    fn clean_up(&self) -> Result<(), PipelineError> {
        let pipelines = {
            let mut staged = self.staged();
            let pipelines = std::mem::take(&mut staged.pipelines);
            *staged = Staged::empty();
            self.active.store(Arc::new(Router::new()));
            pipelines
        };

        for (index, pipeline) in pipelines.iter().enumerate() {
            if let Err(e) = pipeline.unregister_collectors() {
                let mut staged = self.staged();
                let registered_since = std::mem::take(&mut staged.pipelines);
                staged.pipelines = pipelines[index..].to_vec();
                staged.pipelines.extend(registered_since);
                return Err(e);
            }
        }

        tracing::info!(
            pipelines = pipelines.len(),
            "Pipelines cleaned up and router replaced"
        );
        Ok(())
    }
}

struct Binding {
    path: String,
    route: MethodRouter,
    pipeline: Option<Arc<Pipeline>>,
}

impl Binding {
    fn new(
        path: &str,
        route: MethodRouter,
        pipeline: Option<Arc<Pipeline>>,
    ) -> Result<Self, PipelineError> {
        validate_route(path)?;
        Ok(Self {
            path: path.to_string(),
            route,
            pipeline,
        })
    }
}

fn pipeline_route(path: &str, pipeline: Arc<Pipeline>) -> Result<Binding, PipelineError> {
    let route = get(metrics_handler).with_state(pipeline.clone());
    Binding::new(path, route, Some(pipeline))
}

fn reload_route(
    path: &str,
    core: &Arc<ManagerCore>,
    signals: mpsc::UnboundedSender<ControlSignal>,
) -> Result<Binding, PipelineError> {
    let state = ReloadState {
        core: Arc::downgrade(core),
        signals,
    };
    Binding::new(path, post(reload_handler).with_state(state), None)
}

fn config_hash_route(path: &str, hash: ConfigHash) -> Result<Binding, PipelineError> {
    let route = get(move || {
        let hash = hash.clone();
        async move {
            tracing::debug!(config_hash = %hash, "Responding with active configuration hash");
            hash.to_string()
        }
    });
    Binding::new(path, route, None)
}

fn health_check_route() -> Result<Binding, PipelineError> {
    Binding::new("/", get(|| async { "OK" }), None)
}

/// Routes collected off-line and published together by [`RouteBatch::publish`]
///
/// A clean-up that runs while a batch is being filled cannot remove part of it:
/// the batch reaches the router only when it is published.
pub struct RouteBatch<'a> {
    core: &'a Arc<ManagerCore>,
    bindings: Vec<Binding>,
}

impl RouteBatch<'_> {
    pub fn register_pipeline(
        &mut self,
        path: &str,
        pipeline: Arc<Pipeline>,
    ) -> Result<(), PipelineError> {
        self.bindings.push(pipeline_route(path, pipeline)?);
        Ok(())
    }

    pub fn register_reload(
        &mut self,
        path: &str,
        signals: mpsc::UnboundedSender<ControlSignal>,
    ) -> Result<(), PipelineError> {
        self.bindings.push(reload_route(path, self.core, signals)?);
        Ok(())
    }

    pub fn register_config_hash(
        &mut self,
        path: &str,
        hash: ConfigHash,
    ) -> Result<(), PipelineError> {
        self.bindings.push(config_hash_route(path, hash)?);
        Ok(())
    }

    pub fn register_health_check(&mut self) -> Result<(), PipelineError> {
        self.bindings.push(health_check_route()?);
        Ok(())
    }

    /// Bind every staged route and swap the router once
    pub fn publish(self) -> Result<(), PipelineError> {
        self.core.bind_all(self.bindings)
    }
}

/// Reject paths the router cannot bind verbatim
fn validate_route(path: &str) -> Result<(), PipelineError> {
    let invalid = |reason| PipelineError::InvalidRoute {
        path: path.to_string(),
        reason,
    };

    if !path.starts_with('/') {
        return Err(invalid("path must start with '/'"));
    }
    if path.contains(['{', '}']) {
        return Err(invalid("path must not contain braces"));
    }
    if path
        .split('/')
        .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
    {
        return Err(invalid("path segments must not start with ':' or '*'"));
    }
    Ok(())
}

#[derive(Clone)]
struct ReloadState {
    core: Weak<ManagerCore>,
    signals: mpsc::UnboundedSender<ControlSignal>,
}

async fn clean_up_blocking(core: Arc<ManagerCore>) -> Result<(), PipelineError> {
    tokio::task::spawn_blocking(move || core.clean_up())
        .await
        .unwrap_or_else(|e| Err(PipelineError::CleanUpAborted(e.to_string())))
}

async fn reload_handler(State(state): State<ReloadState>) -> Response {
    tracing::info!("Received hot reload request, cleaning up pipelines");

    let Some(core) = state.core.upgrade() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Manager is shutting down").into_response();
    };

    match clean_up_blocking(core).await {
        Ok(()) => {
            if state.signals.send(ControlSignal::Reload).is_err() {
                tracing::warn!("Reload signal dropped, no lifecycle loop is listening");
            }
            StatusCode::OK.into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to clean up pipelines, requesting restart");
            if state.signals.send(ControlSignal::Restart).is_err() {
                tracing::warn!("Restart signal dropped, no lifecycle loop is listening");
            }
            (StatusCode::INTERNAL_SERVER_ERROR, "Request failed").into_response()
        }
    }
}

async fn dispatch(State(core): State<Arc<ManagerCore>>, request: Request) -> Response {
    let router = core.active.load_full();
    Router::clone(&router)
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {})
}

struct ServerHandle {
    address: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// Owns the active pipelines and the HTTP surface serving them
pub struct PipelineManager {
    listen_address: SocketAddr,
    core: Arc<ManagerCore>,
    server: Mutex<Option<ServerHandle>>,
}

impl PipelineManager {
    pub fn new(listen_address: SocketAddr) -> Self {
        Self {
            listen_address,
            core: Arc::new(ManagerCore {
                staged: Mutex::new(Staged::empty()),
                active: ArcSwap::from_pointee(Router::new()),
            }),
            server: Mutex::new(None),
        }
    }

    /// Serve `pipeline` at `path` (GET) and track it for the next clean-up
    pub fn register_pipeline(
        &self,
        path: &str,
        pipeline: Arc<Pipeline>,
    ) -> Result<(), PipelineError> {
        self.core.bind_all(vec![pipeline_route(path, pipeline)?])
    }

    /// Bind the reload endpoint (POST only)
    ///
    /// A successful clean-up answers 200 and sends [`ControlSignal::Reload`]; a
    /// failed one answers 500 and sends [`ControlSignal::Restart`].
    pub fn register_reload(
        &self,
        path: &str,
        signals: mpsc::UnboundedSender<ControlSignal>,
    ) -> Result<(), PipelineError> {
        self.core
            .bind_all(vec![reload_route(path, &self.core, signals)?])
    }

    /// Bind a read-only endpoint returning the active document hash (GET only)
    pub fn register_config_hash(&self, path: &str, hash: ConfigHash) -> Result<(), PipelineError> {
        self.core.bind_all(vec![config_hash_route(path, hash)?])
    }

    /// Bind `GET /` answering `OK`
    pub fn register_health_check(&self) -> Result<(), PipelineError> {
        self.core.bind_all(vec![health_check_route()?])
    }

    /// Start collecting routes to publish in a single router swap
    pub fn batch(&self) -> RouteBatch<'_> {
        RouteBatch {
            core: &self.core,
            bindings: Vec::new(),
        }
    }

    /// Unregister every collector, drop every pipeline and install an empty router
    ///
    /// The empty router is published before any collector is unregistered, so no
    /// request reaches a pipeline that is being torn down. Unregistering waits for
    /// in-flight collections and runs on the blocking pool.
    pub async fn clean_up(&self) -> Result<(), PipelineError> {
        clean_up_blocking(self.core.clone()).await
    }

    /// Pipelines registered since the last clean-up, in registration order
    pub fn pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.core.staged().pipelines.clone()
    }

    /// Router currently serving requests
    pub fn router(&self) -> Arc<Router> {
        self.core.active.load_full()
    }

    /// HTTP service dispatching every request to the active router
    pub fn service(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.core.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the listener and serve in a background task
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(&self) -> Result<SocketAddr, PipelineError> {
        if self.running_address().is_some() {
            return Err(PipelineError::AlreadyStarted);
        }

        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .map_err(|source| PipelineError::Bind {
                address: self.listen_address.to_string(),
                source,
            })?;
        let address = listener
            .local_addr()
            .map_err(|source| PipelineError::Bind {
                address: self.listen_address.to_string(),
                source,
            })?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = self.service();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let mut server = self.server.lock().unwrap_or_else(PoisonError::into_inner);
        if server.is_some() {
            task.abort();
            return Err(PipelineError::AlreadyStarted);
        }
        *server = Some(ServerHandle {
            address,
            shutdown,
            task,
        });

        tracing::info!(address = %address, "Pipeline manager listening");
        Ok(address)
    }

    /// Address of the running listener, if any
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running_address()
    }

    /// Stop accepting connections and wait up to `timeout` for in-flight requests
    ///
    /// On timeout the server keeps running so that [`PipelineManager::close`] can
    /// stop it.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PipelineError> {
        let Some(handle) = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let ServerHandle {
            address,
            shutdown,
            mut task,
        } = handle;
        let _ = shutdown.send(());

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(()))) => {
                tracing::info!(address = %address, "Pipeline manager stopped gracefully");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(PipelineError::Server(e)),
            Ok(Err(e)) => Err(PipelineError::Server(std::io::Error::other(e))),
            Err(_) => {
                let (shutdown, _) = oneshot::channel();
                *self.server.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(ServerHandle {
                        address,
                        shutdown,
                        task,
                    });
                Err(PipelineError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Stop the server immediately, dropping in-flight requests
    pub fn close(&self) {
        if let Some(handle) = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.task.abort();
            tracing::warn!(address = %handle.address, "Pipeline manager closed");
        }
    }

    fn running_address(&self) -> Option<SocketAddr> {
        self.server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|handle| handle.address)
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.close();
    }
}
