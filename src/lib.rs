//! Featured image ingestion for listings.
//!
//! A listing update carrying an uploaded image reference is validated against
//! the size policy, materialized once as a managed media asset with display
//! variants, and bound as the listing's featured image.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
