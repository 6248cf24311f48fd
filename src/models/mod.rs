//! Core data models for the listing media service.
//!
//! Listings are external entities; this service only reads their id and raw
//! upload reference and writes their featured image binding. Media assets map
//! to database tables via `sqlx::FromRow` row types and serialize as JSON via
//! `serde`.

pub mod form_field;
pub mod listing;
pub mod media_asset;
