//! Represents a listing and the field values submitted with it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Form field name carrying the raw upload reference.
pub const FEATURED_LISTING_UPLOAD: &str = "featuredListingUpload";

/// Admin panel name of the same field.
pub const ADMIN_FEATURED_LISTING_UPLOAD: &str = "_featured_listing_upload";

/// Stable identifier of a listing owned by the submission flow.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ListingId(pub i64);

impl ListingId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Field values submitted with a listing update.
///
/// The set of recognized keys is closed: only `featuredListingUpload` is read.
/// Any other submitted field belongs to the generic persistence step and is
/// ignored here.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldValues {
    #[serde(
        rename = "featuredListingUpload",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub featured_listing_upload: Option<String>,
}

impl FieldValues {
    /// The raw upload reference, if one was submitted and is not blank.
    pub fn raw_upload_ref(&self) -> Option<&str> {
        self.featured_listing_upload
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}
