//! Represents a stored object: one uploaded file awaiting expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata record for a single stored object.
///
/// The record is persisted as a JSON file next to the binary blob, both named
/// by the object identifier. It is immutable once written; the object is gone
/// when the sweeper (or an owner-authorized delete) removes the pair.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoredObject {
    /// Object identifier; derived from the record's file name, not persisted
    /// inside the record itself.
    #[serde(skip)]
    pub id: String,

    /// Original filename as supplied by the uploader.
    pub display_name: String,

    /// Media type (MIME type) declared at upload time.
    pub media_type: String,

    /// Instant after which the object may no longer be served.
    pub expires_at: DateTime<Utc>,

    /// Network address the upload arrived from.
    pub owner_address: String,

    /// Pseudo-identity of the uploading client.
    pub owner_identity: Uuid,
}

impl StoredObject {
    /// True once `expires_at` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
