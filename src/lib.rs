//! Ephemeral file transfer links.
//!
//! Upload a file, get a short-lived and optionally password-protected link,
//! let others download it while it is valid.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::transfer_service::TransferService;
use tower_http::trace::TraceLayer;

/// Router with state and request tracing attached.
pub fn build_app(service: TransferService) -> Router {
    let max_upload_bytes = service.policy().max_upload_bytes;
    routes::routes::routes(max_upload_bytes)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
