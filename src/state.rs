use crate::services::{asset_store::SqliteAssetStore, featured_image::FeaturedImageBinder};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: SqliteAssetStore,
    pub binder: Arc<FeaturedImageBinder>,
}
