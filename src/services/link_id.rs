//! Link identifiers and creator tokens.
//!
//! Ids are 128 random bits from the thread-local CSPRNG, encoded as
//! unpadded URL-safe base64 (22 characters). Nothing about the upload feeds
//! into them.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;

pub const LINK_ID_BYTES: usize = 16;
const DELETE_TOKEN_BYTES: usize = 32;

/// Source of fresh link ids. Swappable so collision handling can be tested.
pub trait LinkIdSource: Send + Sync {
    fn new_link_id(&self) -> String;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RandomLinkIds;

impl LinkIdSource for RandomLinkIds {
    fn new_link_id(&self) -> String {
        random_token(LINK_ID_BYTES)
    }
}

/// Secret handed to anonymous uploaders so they can delete their transfer.
pub fn new_delete_token() -> String {
    random_token(DELETE_TOKEN_BYTES)
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Shape check applied before any lookup, so junk never reaches the store.
pub fn is_well_formed(link_id: &str) -> bool {
    !link_id.is_empty()
        && link_id.len() <= 64
        && link_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
