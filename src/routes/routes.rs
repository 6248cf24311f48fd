//! Defines routes for listing media operations.
//!
//! ## Structure
//! - **Listing endpoints**
//!   - `POST /listings/{id}/update`   — record upload reference, promote featured image
//!   - `GET  /listings/{id}/featured` — bound featured image and its variants
//!
//! - **Media endpoints**
//!   - `GET  /media/{asset_id}/{variant}` — stream a stored file (`full` = original)
//!
//! - **Form metadata**
//!   - `GET  /fields`       — submission form-field descriptors
//!   - `GET  /fields/admin` — admin panel form-field descriptors

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        listing_handlers::{
            get_featured, get_media, list_admin_fields, list_fields, update_listing,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all listing media routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/fields", get(list_fields))
        .route("/fields/admin", get(list_admin_fields))
        .route("/listings/{id}/update", post(update_listing))
        .route("/listings/{id}/featured", get(get_featured))
        .route("/media/{asset_id}/{variant}", get(get_media))
}
