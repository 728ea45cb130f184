//! HTTP server module
//!
//! Accepts HTTP/1.1 connections, one tokio task each, and hands every request
//! to the protocol handler. A background task evicts idle uploads.

use crate::auth::{self, AuthError, Authenticator};
use crate::completion::FolderDispatcher;
use crate::config::{Config, ConfigError};
use crate::persistence::{PersistenceError, SqliteRecordStore};
use crate::router::TusRequestParser;
use crate::session::{SessionError, SessionManager};
use crate::store::{DiskStore, StoreError};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub mod handler;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    RuntimeError(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// State shared by every connection
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub parser: TusRequestParser,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Reject requests that carry no token
    pub auth_required: bool,
    pub max_size: Option<u64>,
    pub metrics_enabled: bool,
}

/// HTTP Server
pub struct Server {
    state: Arc<AppState>,
    listener: TcpListener,
    local_addr: SocketAddr,
    sweep_interval: Duration,
}

impl Server {
    /// Build the full stack from configuration and bind.
    ///
    /// Opens the disk store and the record database, then recovers sessions
    /// left over from a previous run.
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        config.validate()?;

        let store = Arc::new(DiskStore::new(&config.store.directory).await?);
        let records = Arc::new(SqliteRecordStore::open(&config.completion.database)?);
        let dispatcher = Arc::new(FolderDispatcher::new(config.dispatcher_config(), records));
        let manager = Arc::new(SessionManager::new(
            store,
            dispatcher,
            config.session_policy(),
        ));

        manager.recover().await?;

        Self::with_manager(&config, manager).await
    }

    /// Bind a server around an existing session manager
    pub async fn with_manager(
        config: &Config,
        manager: Arc<SessionManager>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .server
            .address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;

        // Actual bound address, important for port 0
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        let state = AppState {
            manager,
            parser: TusRequestParser::new(config.server.base_path.clone()),
            authenticator: auth::from_config(&config.auth)?,
            auth_required: config.auth.required,
            max_size: config.server.max_size,
            metrics_enabled: config.metrics.enabled,
        };

        info!(address = %local_addr, base_path = %config.server.base_path, "Server bound");

        Ok(Self {
            state: Arc::new(state),
            listener,
            local_addr,
            sweep_interval: Duration::from_secs(config.store.sweep_interval_seconds),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.state.manager)
    }

    /// Serve until ctrl-c
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves.
    ///
    /// Stops accepting connections on shutdown; requests already in flight
    /// run to completion on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!(address = %self.local_addr, "Starting server");

        let sweeper = tokio::spawn(sweep_idle(
            Arc::clone(&self.state.manager),
            self.sweep_interval,
        ));

        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { handler::handle_request(req, state).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(peer = %peer_addr, error = %e, "Error serving connection");
                }
            });
        }

        sweeper.abort();
        info!("Shutting down server");
        Ok(())
    }
}

async fn sweep_idle(manager: Arc<SessionManager>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // First tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        manager.expire_idle(chrono::Utc::now()).await;
    }
}
