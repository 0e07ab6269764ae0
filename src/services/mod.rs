pub mod blob_store;
pub mod clock;
pub mod credential_guard;
pub mod events;
pub mod expiry;
pub mod link_id;
pub mod record_store;
pub mod transfer_service;
