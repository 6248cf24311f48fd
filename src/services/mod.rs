pub mod asset_store;
pub mod featured_image;
pub mod raw_upload;
pub mod size_policy;
