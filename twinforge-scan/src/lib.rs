//! twinforge-scan library interface
//!
//! Exposes the router, state and pipeline modules for the binary and for
//! integration tests.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use crate::config::ServiceSettings;
use crate::db::ArchetypeRepository;
use crate::services::vision::VisionModel;
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Reference archetypes (vocabulary and bounds source)
    pub archetypes: ArchetypeRepository,
    /// Vision model used by the estimate, semantic and refine stages
    pub vision: Arc<dyn VisionModel>,
    pub settings: ServiceSettings,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last server-side error, reported by /health
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(db: SqlitePool, vision: Arc<dyn VisionModel>, settings: ServiceSettings) -> Self {
        Self {
            archetypes: ArchetypeRepository::new(db.clone()),
            db,
            vision,
            settings,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Remember a server-side failure for diagnostics
    pub async fn record_error(&self, error: &ApiError) {
        if error.status().is_server_error() {
            *self.last_error.write().await = Some(error.to_string());
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    with_service_layers(Router::new().merge(api::scan_routes()).merge(api::health_routes())).with_state(state)
}

/// Panic recovery, tracing and CORS, in that order from the handler out
fn with_service_layers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// A handler panic becomes the regular 500 JSON body
fn panic_response(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let details = if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else {
        "handler panicked".to_string()
    };
    tracing::error!(%details, "Handler panicked");
    ApiError::Internal(details).into_response()
}
