//! Represents a managed image registered into durable storage.

use super::listing::ListingId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Name of the pseudo-variant addressing the stored original.
pub const FULL_VARIANT: &str = "full";

/// A durable image record owned by a listing.
///
/// Created exactly once per listing and never updated afterwards. The
/// `listing_id` is a back-reference used for lookup only.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MediaAsset {
    /// Stable asset identifier.
    pub id: Uuid,

    /// Listing that owns this asset.
    pub listing_id: ListingId,

    /// Sanitized filename of the stored original.
    pub filename: String,

    /// MIME type detected from the file content.
    pub mime_type: String,

    /// Location of the original relative to the storage root.
    pub storage_path: String,

    /// Pixel width of the original.
    pub width: u32,

    /// Pixel height of the original.
    pub height: u32,

    /// Size of the original in bytes.
    pub size_bytes: i64,

    /// MD5 of the original payload, lowercase hex.
    pub checksum: String,

    pub created_at: DateTime<Utc>,

    /// Generated display sizes, ordered smallest first.
    pub variants: Vec<SizeVariant>,
}

impl MediaAsset {
    /// Look up a variant by name. `full` resolves to the original.
    pub fn variant_path(&self, name: &str) -> Option<(&str, &str)> {
        if name == FULL_VARIANT {
            return Some((self.storage_path.as_str(), self.mime_type.as_str()));
        }
        self.variants
            .iter()
            .find(|variant| variant.name == name)
            .map(|variant| (variant.storage_path.as_str(), variant.mime_type.as_str()))
    }
}

/// A generated display size of a media asset.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SizeVariant {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub storage_path: String,
}

/// Database row for `media_assets`.
#[derive(FromRow, Debug)]
pub(crate) struct MediaAssetRow {
    pub id: Uuid,
    pub listing_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub storage_path: String,
    pub width: i64,
    pub height: i64,
    pub size_bytes: i64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Database row for `media_variants`.
#[derive(FromRow, Debug)]
pub(crate) struct SizeVariantRow {
    pub name: String,
    pub width: i64,
    pub height: i64,
    pub mime_type: String,
    pub storage_path: String,
}

impl From<SizeVariantRow> for SizeVariant {
    fn from(row: SizeVariantRow) -> Self {
        Self {
            name: row.name,
            width: clamp_dimension(row.width),
            height: clamp_dimension(row.height),
            mime_type: row.mime_type,
            storage_path: row.storage_path,
        }
    }
}

impl MediaAssetRow {
    pub fn into_asset(self, variants: Vec<SizeVariant>) -> MediaAsset {
        MediaAsset {
            id: self.id,
            listing_id: ListingId(self.listing_id),
            filename: self.filename,
            mime_type: self.mime_type,
            storage_path: self.storage_path,
            width: clamp_dimension(self.width),
            height: clamp_dimension(self.height),
            size_bytes: self.size_bytes,
            checksum: self.checksum,
            created_at: self.created_at,
            variants,
        }
    }
}

fn clamp_dimension(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
