//! Defines routes for the transfer link API.
//!
//! ## Structure
//! - `POST   /transfers`                   : upload a file, get a link
//! - `GET    /transfers`                   : caller's own transfers
//! - `GET    /transfers/events`            : SSE feed of the caller's transfers
//! - `GET    /transfers/{link_id}`         : public metadata
//! - `POST   /transfers/{link_id}/download`: stream the file (password in body)
//! - `DELETE /transfers/{link_id}`         : owner / creator delete
//! - `GET    /healthz`, `GET /readyz`       : probes

use crate::{
    handlers::{
        event_handlers::transfer_events,
        health_handlers::{healthz, readyz},
        transfer_handlers::{
            create_transfer, delete_transfer, download_transfer, get_transfer_metadata,
            list_transfers,
        },
    },
    services::transfer_service::TransferService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room for multipart boundaries and the small text parts.
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Build the router for all transfer routes.
///
/// Only the upload route lifts axum's default body limit, to just above
/// `max_upload_bytes`; the service enforces the exact limit while streaming.
pub fn routes(max_upload_bytes: u64) -> Router<TransferService> {
    let upload_limit =
        usize::try_from(max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES))
            .unwrap_or(usize::MAX);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/transfers",
            post(create_transfer)
                .layer(DefaultBodyLimit::max(upload_limit))
                .get(list_transfers),
        )
        .route("/transfers/events", get(transfer_events))
        .route(
            "/transfers/{link_id}",
            get(get_transfer_metadata).delete(delete_transfer),
        )
        .route("/transfers/{link_id}/download", post(download_transfer))
}
