//! HTTP handlers for transfer links.
//! Streams upload and download bodies to avoid buffering in memory and
//! delegates the lifecycle to `TransferService`.

use crate::{
    errors::AppError,
    models::transfer::{CreatedTransfer, FileDescriptor, OwnedTransfer, TransferMetadata},
    services::transfer_service::{NewTransfer, Requester, TransferService},
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Identity of the signed-in caller, set by the upstream identity provider.
pub const OWNER_HEADER: &str = "x-owner-id";
/// Creator proof for anonymous transfers.
pub const DELETE_TOKEN_HEADER: &str = "x-delete-token";
pub const DOWNLOAD_COUNT_HEADER: &str = "x-download-count";

/// Optional body of `POST /transfers/{link_id}/download`.
#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub password: Option<String>,
}

/// `POST /transfers`: multipart upload.
///
/// `password` and `ttl_minutes` parts must precede the `file` part; the file
/// is streamed straight to storage as soon as it arrives. Any of those parts
/// showing up after the file undoes the upload and fails the request.
pub async fn create_transfer(
    State(service): State<TransferService>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CreatedTransfer>), AppError> {
    let owner_id = header_string(&headers, OWNER_HEADER);
    let mut password = None;
    let mut ttl_minutes = None;
    let mut created = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "password" => password = Some(field.text().await.map_err(multipart_error)?),
            "ttl_minutes" => {
                let raw = field.text().await.map_err(multipart_error)?;
                let parsed = raw.trim().parse::<u32>().map_err(|_| {
                    AppError::bad_request("ttl_minutes must be a positive whole number")
                })?;
                ttl_minutes = Some(parsed);
            }
            "file" => {
                let file = FileDescriptor {
                    file_name: field.file_name().unwrap_or_default().to_string(),
                    content_type: field.content_type().unwrap_or_default().to_string(),
                };
                let stream = field.map(|chunk| chunk.map_err(io::Error::other));
                let request = NewTransfer {
                    file,
                    password,
                    ttl_minutes,
                    owner_id: owner_id.clone(),
                };
                created = Some(service.create(request, stream).await?);
                break;
            }
            other => debug!("ignoring multipart field `{}`", other),
        }
    }

    let Some(created) = created else {
        return Err(AppError::bad_request("missing `file` part"));
    };

    if let Err(err) = reject_trailing_fields(&mut multipart).await {
        let requester = match (owner_id, created.delete_token.clone()) {
            (Some(owner), _) => Some(Requester::Owner(owner)),
            (None, Some(token)) => Some(Requester::Creator(token)),
            (None, None) => None,
        };
        if let Some(requester) = requester {
            if let Err(cleanup) = service.delete_owned(&created.link_id, requester).await {
                warn!(
                    "failed to undo transfer {} after a bad upload: {}",
                    created.link_id, cleanup
                );
            }
        }
        return Err(err);
    }

    Ok((StatusCode::CREATED, Json(created)))
}

/// Drains the parts after `file`. Settings there would otherwise be
/// silently dropped.
async fn reject_trailing_fields(multipart: &mut Multipart) -> Result<(), AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name().unwrap_or_default() {
            "password" | "ttl_minutes" | "file" => {
                return Err(AppError::bad_request(
                    "`password` and `ttl_minutes` must precede a single `file` part",
                ));
            }
            other => debug!("ignoring multipart field `{}`", other),
        }
    }
    Ok(())
}

/// `GET /transfers/{link_id}`: metadata safe to show before a password.
pub async fn get_transfer_metadata(
    State(service): State<TransferService>,
    Path(link_id): Path<String>,
) -> Result<Json<TransferMetadata>, AppError> {
    Ok(Json(service.metadata(&link_id).await?))
}

/// `POST /transfers/{link_id}/download`: stream the file.
pub async fn download_transfer(
    State(service): State<TransferService>,
    Path(link_id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ResolveRequest::default()
    } else {
        serde_json::from_slice::<ResolveRequest>(&body)
            .map_err(|_| AppError::bad_request("expected a JSON body like {\"password\": \"...\"}"))?
    };

    let resolved = service.resolve(&link_id, request.password).await?;
    let meta = resolved.metadata;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(resolved.reader)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.file_size_bytes.max(0)));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&meta.file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", resolved.etag)) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        HeaderName::from_static(DOWNLOAD_COUNT_HEADER),
        HeaderValue::from(meta.download_count),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok(response)
}

/// `DELETE /transfers/{link_id}`: owner or anonymous creator only.
pub async fn delete_transfer(
    State(service): State<TransferService>,
    Path(link_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let requester = if let Some(owner) = header_string(&headers, OWNER_HEADER) {
        Requester::Owner(owner)
    } else if let Some(token) = header_string(&headers, DELETE_TOKEN_HEADER) {
        Requester::Creator(token)
    } else {
        return Err(AppError::unauthenticated(format!(
            "send `{}` or `{}`",
            OWNER_HEADER, DELETE_TOKEN_HEADER
        )));
    };

    service.delete_owned(&link_id, requester).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /transfers`: the caller's own transfers, newest first.
pub async fn list_transfers(
    State(service): State<TransferService>,
    headers: HeaderMap,
) -> Result<Json<Vec<OwnedTransfer>>, AppError> {
    let owner = require_owner(&headers)?;
    let rows: Vec<OwnedTransfer> = service
        .owned_transfers(&owner)
        .try_collect::<Vec<_>>()
        .await?;
    Ok(Json(rows))
}

pub(crate) fn require_owner(headers: &HeaderMap) -> Result<String, AppError> {
    header_string(headers, OWNER_HEADER).ok_or_else(|| {
        AppError::unauthenticated(format!("missing `{}` header", OWNER_HEADER))
    })
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn multipart_error(err: MultipartError) -> AppError {
    let status = err.status();
    let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "payload_too_large"
    } else {
        "invalid_input"
    };
    AppError::new(status, code, err.body_text())
}

/// `attachment` disposition with an ASCII fallback name and the exact name
/// in RFC 5987 form.
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::with_capacity(file_name.len() * 3);
    for byte in file_name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}
