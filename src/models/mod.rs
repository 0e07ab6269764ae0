//! Core data models for the transfer link service.
//!
//! `TransferRecord` maps to the `transfers` table via `sqlx::FromRow`; the
//! other types are the caller-facing views that serialize as JSON via `serde`.

pub mod transfer;
