use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use lq_bridge::devnet::DevnetSupervisor;
use lq_bridge::editor::{editor_dispatcher, Workspace};
use lq_bridge::handlers::builtin_dispatcher;
use lq_bridge::http_api::{api_router, AppState};
use lq_core::config::Config;
use lq_core::shutdown::ShutdownSignal;
use lq_session::{PtyPool, SessionRegistry, ShellSpec, TerminalDispatcher};
use tracing::{info, warn};

/// The dashboard backend.
///
/// Serves `/api/v1/*`, `/ws` and `/editor` until the [`ShutdownSignal`]
/// fires, then kills every terminal session and the devnet.
pub struct Daemon {
    config: Config,
    shutdown: ShutdownSignal,
    sessions: SessionRegistry,
    devnet: Arc<DevnetSupervisor>,
    state: AppState,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let shutdown = ShutdownSignal::new();
        let shell = ShellSpec::from_config(&config.terminal);
        let sessions = SessionRegistry::new(PtyPool::new(config.terminal.max_sessions), shell);
        let devnet = Arc::new(DevnetSupervisor::from_config(&config.devnet));
        let workspace = Arc::new(Workspace::from_config(&config.editor));

        let state = AppState::new(
            builtin_dispatcher(TerminalDispatcher::new(sessions.clone()), devnet.clone()),
            editor_dispatcher(workspace),
            config.dispatch.http_grace(),
        )
        .with_shutdown(shutdown.clone());

        Self {
            config,
            shutdown,
            sessions,
            devnet,
            state,
        }
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn devnet(&self) -> &DevnetSupervisor {
        &self.devnet
    }

    pub fn router(&self) -> Router {
        api_router(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.config.server.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown, then tear down.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        info!(
            %bind_addr,
            max_sessions = self.config.terminal.max_sessions,
            http_grace_ms = self.config.dispatch.http_grace_ms,
            "dashboard backend listening"
        );

        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await;

        self.teardown();
        served.context("API server error")?;
        info!("daemon stopped");
        Ok(())
    }

    fn teardown(&self) {
        let open = self.sessions.len();
        if open > 0 {
            warn!(sessions = open, "killing terminal sessions on shutdown");
        }
        self.sessions.kill_all();
        self.devnet.shutdown();
    }
}
