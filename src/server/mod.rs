//! HTTP surface for the human-approval workflow.
//!
//! The run loop is synchronous; the server runs on its own tokio runtime
//! thread and shares the `GovernanceEngine` with it.

mod error;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::AppState;

use crate::governance::GovernanceEngine;

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route(
            "/approvals",
            get(handlers::list_approvals).post(handlers::create_approval),
        )
        .route("/approvals/:id", get(handlers::get_approval))
        .route("/approvals/:id/approve", post(handlers::approve))
        .route("/approvals/:id/reject", post(handlers::reject))
        .route("/approvals/:id/audit", get(handlers::approval_audit))
        .route("/webhooks/approval", post(handlers::approval_webhook));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on the current thread until Ctrl-C.
pub fn serve(bind: &str, engine: Arc<GovernanceEngine>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("binding {bind}"))?;
        tracing::info!(addr = %listener.local_addr()?, "approval server listening");
        axum::serve(listener, router(AppState::new(engine)))
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .context("approval server")?;
        Ok::<_, anyhow::Error>(())
    })
}

/// A server running on a background thread.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and join the server thread.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("approval server thread panicked");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

/// Start the server on its own runtime thread. Returns once the listener is
/// bound, so bind errors surface here.
pub fn spawn(bind: &str, engine: Arc<GovernanceEngine>) -> anyhow::Result<ServerHandle> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<anyhow::Result<SocketAddr>>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let bind = bind.to_string();

    let thread = std::thread::Builder::new()
        .name("phasegate-http".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(anyhow::Error::new(e).context("building tokio runtime")));
                    return;
                }
            };
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::bind(&bind).await {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(e).context(format!("binding {bind}"))));
                        return;
                    }
                };
                match listener.local_addr() {
                    Ok(addr) => {
                        let _ = ready_tx.send(Ok(addr));
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                }
                let result = axum::serve(listener, router(AppState::new(engine)))
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await;
                if let Err(e) = result {
                    tracing::error!(error = %e, "approval server stopped");
                }
            });
        })
        .context("spawning approval server thread")?;

    let addr = ready_rx
        .recv()
        .context("approval server thread exited before binding")??;
    tracing::info!(%addr, "approval server listening");
    Ok(ServerHandle {
        addr,
        shutdown: Some(shutdown_tx),
        thread: Some(thread),
    })
}
