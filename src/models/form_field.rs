//! Declarative form-field metadata contributed to the submission form and the
//! admin listing panel.

use super::listing::{ADMIN_FEATURED_LISTING_UPLOAD, FEATURED_LISTING_UPLOAD};
use serde::Serialize;

/// Input kind rendered by the form collaborator.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    FileUpload,
}

/// A single form-field descriptor.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct FormField {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Ordering hint relative to the form's other fields.
    pub priority: u32,
}

/// The featured image upload field on the submission form.
pub fn featured_listing_upload() -> FormField {
    FormField {
        name: FEATURED_LISTING_UPLOAD,
        label: "Featured Listing Image",
        kind: FieldKind::FileUpload,
        required: false,
        priority: 10,
    }
}

/// The same upload as shown in the admin listing panel, keyed by its stored
/// field name.
pub fn admin_featured_listing_upload() -> FormField {
    FormField {
        name: ADMIN_FEATURED_LISTING_UPLOAD,
        label: "Featured Listing Upload",
        kind: FieldKind::FileUpload,
        required: false,
        priority: 10,
    }
}

/// Fields contributed to the submission form.
pub fn submission_fields() -> Vec<FormField> {
    vec![featured_listing_upload()]
}

/// Fields contributed to the admin listing panel.
pub fn admin_fields() -> Vec<FormField> {
    vec![admin_featured_listing_upload()]
}
