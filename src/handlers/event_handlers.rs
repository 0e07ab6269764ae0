//! Server-Sent Events feed of the caller's own transfer changes.
//!
//! Backs the live dashboard: every committed create, download, delete or
//! expiry of a transfer owned by the caller is pushed as one event.

use crate::{
    errors::AppError,
    handlers::transfer_handlers::require_owner,
    services::{
        events::{TransferEvent, TransferEventKind},
        transfer_service::TransferService,
    },
};
use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use tokio::sync::broadcast::{Receiver, error::RecvError};

/// `GET /transfers/events`
pub async fn transfer_events(
    State(service): State<TransferService>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let owner = require_owner(&headers)?;
    let rx = service.subscribe();
    Ok(Sse::new(owner_events(rx, owner)).keep_alive(KeepAlive::default()))
}

fn owner_events(
    rx: Receiver<TransferEvent>,
    owner: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, owner), |(mut rx, owner)| async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.owner_id.as_deref() == Some(owner.as_str()) => {
                    let sse = to_sse(&event);
                    return Some((Ok(sse), (rx, owner)));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    let sse = Event::default()
                        .event("lagged")
                        .data(skipped.to_string());
                    return Some((Ok(sse), (rx, owner)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

fn to_sse(event: &TransferEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    let name = match event.kind {
        TransferEventKind::Created => "created",
        TransferEventKind::Downloaded => "downloaded",
        TransferEventKind::Deleted => "deleted",
        TransferEventKind::Expired => "expired",
    };
    Event::default().event(name).data(data)
}
