//! Represents the metadata row kept for every uploaded ciphertext blob.

use sqlx::FromRow;

/// A single ephemeral drop.
///
/// The record never holds payload bytes; the ciphertext lives in a file
/// named after `id` inside the blob directory. All fields are fixed at
/// creation time.
#[derive(Clone, FromRow, Debug, PartialEq, Eq)]
pub struct DropRecord {
    /// Random UUID rendered in its hyphenated form. Also the blob filename.
    pub id: String,

    /// Unix timestamp (seconds) at which the drop stops being servable.
    pub expires_at: i64,

    /// Whether the first successful read deletes the drop.
    pub burn_after_read: bool,

    /// Owner secret required by `delete_with_token`. Never logged.
    pub delete_token: String,
}

impl DropRecord {
    /// True once `now` has reached the expiry instant.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}
