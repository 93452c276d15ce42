use crate::config::DaemonConfig;
use crate::error::RbdVolError;
use crate::rbd::{BlockOps, RbdTool};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tracing::{error, info};

pub mod api;
pub mod driver;
pub mod engine;
pub mod error;
pub mod registry;
pub mod service;

use engine::LifecycleEngine;
use service::DockerPluginService;

pub struct VolumePlugin {
    config: DaemonConfig,
}

impl VolumePlugin {
    pub fn new(config: DaemonConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<(), RbdVolError> {
        let socket_path = self.config.socket_path();

        self.ensure_socket_path(&socket_path).await?;
        let listener = UnixListener::bind(&socket_path).map_err(RbdVolError::Io)?;

        let locker = engine::hostname_cookie();
        let ops: Arc<dyn BlockOps> = Arc::new(RbdTool::new(
            self.config.user.as_str(),
            locker.as_str(),
            self.config.shell_timeout.into(),
        ));
        let driver = Arc::new(LifecycleEngine::new(self.config.clone(), ops, locker));

        let service = DockerPluginService::new(driver);

        info!(socket = ?socket_path, pool = %self.config.pool, "Docker volume plugin listening");

        let exit = wait_for_signal();
        tokio::pin!(exit);

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let io = TokioIo::new(stream);
                            let svc = service.clone();

                            connections.spawn(async move {
                                if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                                    error!("Error serving connection: {:?}", err);
                                }
                            });
                        }
                        Err(e) => error!("Socket accept error: {}", e),
                    }
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                _ = &mut exit => {
                    break;
                }
            }
        }

        // Stop accepting and let in-flight verbs finish (or time out).
        info!(in_flight = connections.len(), "draining connections before exit");
        while connections.join_next().await.is_some() {}

        Ok(())
    }

    async fn ensure_socket_path(&self, path: &Path) -> Result<(), RbdVolError> {
        if path.exists() {
            info!("Removing existing socket file: {:?}", path);
            tokio::fs::remove_file(path).await.map_err(RbdVolError::Io)?;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(RbdVolError::Io)?;
        }
        Ok(())
    }
}

impl Drop for VolumePlugin {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.config.socket_path());
    }
}

/// Listens for shutdown signals. Any termination signal triggers shutdown.
pub async fn wait_for_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigquit.recv() => info!("Received SIGQUIT, shutting down..."),
    }
}
