//! Prometheus scrape endpoint
//!
//! `GET /metrics` renders the [`MetricRegistry`] in text format. The server
//! runs on its own thread with a current-thread tokio runtime so the sampling
//! thread never shares an executor with HTTP traffic.

use crate::registry::{MetricRegistry, RegistryError};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Path scraped by Prometheus
pub const METRICS_PATH: &str = "/metrics";

#[derive(Error, Debug)]
pub enum ExpositionError {
    #[error("Failed to bind metrics endpoint on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("Metrics server I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Metrics server thread panicked")]
    Panicked,
}

/// Scrape failure surfaced as HTTP 500
#[derive(Debug)]
struct ScrapeError(RegistryError);

impl IntoResponse for ScrapeError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "failed to encode metrics");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response()
    }
}

async fn metrics_handler(
    State(registry): State<Arc<MetricRegistry>>,
) -> Result<impl IntoResponse, ScrapeError> {
    let body = registry.encode_text().map_err(ScrapeError)?;
    debug!(entries = registry.len(), bytes = body.len(), "served scrape");
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}

/// Router exposing the registry
pub fn router(registry: Arc<MetricRegistry>) -> Router {
    Router::new()
        .route(METRICS_PATH, get(metrics_handler))
        .with_state(registry)
}

/// Running HTTP endpoint
#[derive(Debug)]
pub struct MetricsServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl MetricsServer {
    /// Bind `addr` and start serving
    ///
    /// Binding happens before this returns, so address errors are reported
    /// synchronously and port 0 resolves to a concrete port.
    pub fn bind(addr: SocketAddr, registry: Arc<MetricRegistry>) -> Result<Self, ExpositionError> {
        let listener =
            TcpListener::bind(addr).map_err(|source| ExpositionError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(registry);

        let thread = thread::Builder::new()
            .name("metrics-http".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = tokio::net::TcpListener::from_std(listener)?;
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async {
                            let _ = shutdown_rx.await;
                        })
                        .await
                })
            })?;

        info!(addr = %local_addr, path = METRICS_PATH, "metrics endpoint listening");

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting scrapes and wait for the server thread
    pub fn shutdown(mut self) -> Result<(), ExpositionError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), ExpositionError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => {
                thread.join().map_err(|_| ExpositionError::Panicked)??;
                debug!(addr = %self.local_addr, "metrics endpoint stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "metrics endpoint did not stop cleanly");
        }
    }
}
