//! Admin HTTP surface.
//!
//! Thin JSON routes over the broker, store, lock manager, and health
//! reporter. It never goes through the consumer engine.

pub mod routes;

pub use routes::router;

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::health::HealthReporter;
use crate::lock::LockManager;
use crate::store::KvStore;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn KvStore>,
    pub locks: LockManager,
    pub health: HealthReporter,
}

impl AppState {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn KvStore>) -> Self {
        Self {
            locks: LockManager::new(Arc::clone(&store)),
            health: HealthReporter::new(Arc::clone(&store), Arc::clone(&broker)),
            broker,
            store,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::StoreUnavailable(_) | Error::BrokerUnavailable(_) | Error::Store(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::QueueNotFound(_) => StatusCode::NOT_FOUND,
            Error::Payload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Serve the admin API on `port` until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin surface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("admin surface stopped");
    Ok(())
}
