//! src/services/asset_store.rs
//!
//! AssetStore — durable media storage for listing images. Metadata lives in
//! SQLite and payloads on local disk, sharded beneath
//! `storage_root/{shard}/{shard}/listing-{id}/{asset_id}/`.

use crate::{
    config::StorageConfig,
    models::{
        listing::ListingId,
        media_asset::{MediaAsset, MediaAssetRow, SizeVariant, SizeVariantRow},
    },
    services::raw_upload::RawUpload,
};
use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, ImageFormat, imageops::FilterType};
use sqlx::SqlitePool;
use std::{
    io::{self, Cursor, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload `{}` could not be read: {source}", path.display())]
    UnreadableUpload {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{0}` is not a supported image format")]
    UnsupportedFormat(String),
    #[error("asset `{0}` not found")]
    AssetNotFound(Uuid),
    #[error("variant `{variant}` not found for asset `{asset_id}`")]
    VariantNotFound { asset_id: Uuid, variant: String },
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage seam used by the featured image pipeline.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Whether the listing already owns an image asset or a featured binding.
    ///
    /// Always answered from persisted state; this is the idempotency guard.
    async fn has_featured_asset(&self, listing_id: ListingId) -> StoreResult<bool>;

    /// Register a validated upload as a managed asset with display variants.
    async fn materialize(
        &self,
        upload: &RawUpload,
        listing_id: ListingId,
    ) -> StoreResult<MediaAsset>;

    /// Point the listing's featured image at `asset`.
    async fn bind(&self, listing_id: ListingId, asset: &MediaAsset) -> StoreResult<()>;

    /// Remove an asset that was materialized but never bound.
    ///
    /// An asset some listing already features is left alone.
    async fn discard(&self, asset: &MediaAsset) -> StoreResult<()>;
}

/// A display size generated for every asset when the original is large enough.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariantSpec {
    pub name: &'static str,
    /// Bounding width, `0` for unbounded.
    pub width: u32,
    /// Bounding height, `0` for unbounded.
    pub height: u32,
    /// Crop to exactly fill the box instead of fitting inside it.
    pub crop: bool,
}

/// Display sizes, smallest first.
pub const VARIANTS: [VariantSpec; 4] = [
    VariantSpec {
        name: "thumbnail",
        width: 150,
        height: 150,
        crop: true,
    },
    VariantSpec {
        name: "medium",
        width: 300,
        height: 300,
        crop: false,
    },
    VariantSpec {
        name: "medium_large",
        width: 768,
        height: 0,
        crop: false,
    },
    VariantSpec {
        name: "large",
        width: 1024,
        height: 1024,
        crop: false,
    },
];

impl VariantSpec {
    /// Output dimensions for an original of `width`×`height`, or `None` when
    /// the original already fits and no variant is produced.
    pub fn target_dimensions(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }

        if self.crop {
            let target = (
                bounded(self.width, width).min(width),
                bounded(self.height, height).min(height),
            );
            return (target != (width, height)).then_some(target);
        }

        let scale_w = (self.width > 0).then(|| self.width as f64 / width as f64);
        let scale_h = (self.height > 0).then(|| self.height as f64 / height as f64);
        let scale = match (scale_w, scale_h) {
            (Some(w), Some(h)) => w.min(h),
            (Some(s), None) | (None, Some(s)) => s,
            (None, None) => return None,
        };
        if scale >= 1.0 {
            return None;
        }

        let target_w = ((width as f64 * scale).round() as u32).max(1);
        let target_h = ((height as f64 * scale).round() as u32).max(1);
        Some((target_w, target_h))
    }
}

fn bounded(limit: u32, fallback: u32) -> u32 {
    if limit == 0 { fallback } else { limit }
}

/// SQLite + local disk implementation of [`AssetStore`].
#[derive(Clone)]
pub struct SqliteAssetStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub storage_root: PathBuf,
}

/// Encoded image bytes ready to be written, with their dimensions.
struct Rendition {
    name: String,
    filename: String,
    mime_type: String,
    width: u32,
    height: u32,
    bytes: Vec<u8>,
}

/// Output of decoding an upload and generating its variants.
struct Rendered {
    mime_type: String,
    width: u32,
    height: u32,
    variants: Vec<Rendition>,
}

impl SqliteAssetStore {
    pub fn new(db: Arc<SqlitePool>, config: StorageConfig) -> Self {
        Self {
            db,
            storage_root: config.storage_root,
        }
    }

    /// Two-level shard identifiers for a listing, from MD5 of its id.
    fn listing_shards(listing_id: ListingId) -> (String, String) {
        let digest = md5::compute(format!("listing/{}", listing_id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Storage-root-relative directory holding one asset's files.
    fn asset_dir(listing_id: ListingId, asset_id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::listing_shards(listing_id);
        let mut path = PathBuf::from(shard_a);
        path.push(shard_b);
        path.push(format!("listing-{}", listing_id));
        path.push(asset_id.to_string());
        path
    }

    /// Absolute path for a storage-root-relative key.
    pub fn absolute_path(&self, storage_path: &str) -> PathBuf {
        self.storage_root.join(storage_path)
    }

    /// Record the raw upload reference submitted for a listing.
    ///
    /// Creates the listing row on first sight.
    pub async fn record_upload_ref(
        &self,
        listing_id: ListingId,
        raw_upload_ref: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO listings (id, featured_listing_upload, featured_asset_id, updated_at)
             VALUES (?, ?, NULL, ?)
             ON CONFLICT(id) DO UPDATE SET
                featured_listing_upload = excluded.featured_listing_upload,
                updated_at = excluded.updated_at",
        )
        .bind(listing_id.get())
        .bind(raw_upload_ref)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// The listing's featured asset id, if one is bound.
    pub async fn featured_asset_id(&self, listing_id: ListingId) -> StoreResult<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Option<Uuid>>(
            "SELECT featured_asset_id FROM listings WHERE id = ?",
        )
        .bind(listing_id.get())
        .fetch_optional(&*self.db)
        .await?;
        Ok(id.flatten())
    }

    /// The listing's bound featured asset with its variants.
    pub async fn featured_asset(&self, listing_id: ListingId) -> StoreResult<Option<MediaAsset>> {
        match self.featured_asset_id(listing_id).await? {
            Some(asset_id) => self.asset(asset_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Fetch an asset and its variants by id.
    pub async fn asset(&self, asset_id: Uuid) -> StoreResult<MediaAsset> {
        let row = sqlx::query_as::<_, MediaAssetRow>(
            "SELECT id, listing_id, filename, mime_type, storage_path, width, height,
                    size_bytes, checksum, created_at
             FROM media_assets WHERE id = ?",
        )
        .bind(asset_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::AssetNotFound(asset_id),
            other => StoreError::Sqlx(other),
        })?;

        let variants = sqlx::query_as::<_, SizeVariantRow>(
            "SELECT name, width, height, mime_type, storage_path
             FROM media_variants WHERE asset_id = ?
             ORDER BY width ASC, name ASC",
        )
        .bind(asset_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(row.into_asset(variants.into_iter().map(SizeVariant::from).collect()))
    }

    /// Open a stored file for reading. `full` addresses the original.
    pub async fn open_variant(
        &self,
        asset_id: Uuid,
        variant: &str,
    ) -> StoreResult<(MediaAsset, String, File)> {
        let asset = self.asset(asset_id).await?;
        let (storage_path, mime_type) =
            asset
                .variant_path(variant)
                .ok_or_else(|| StoreError::VariantNotFound {
                    asset_id,
                    variant: variant.to_string(),
                })?;
        let mime_type = mime_type.to_string();
        let file = File::open(self.absolute_path(storage_path))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StoreError::VariantNotFound {
                        asset_id,
                        variant: variant.to_string(),
                    }
                } else {
                    StoreError::Io(err)
                }
            })?;
        Ok((asset, mime_type, file))
    }

    /// Write bytes to `path` via a fsynced temp file and an atomic rename.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "asset path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        Ok(())
    }

    /// Write the original and every rendition beneath `relative_dir`.
    async fn write_files(
        &self,
        original_path: &Path,
        original: &[u8],
        relative_dir: &Path,
        renditions: &[Rendition],
    ) -> StoreResult<Vec<SizeVariant>> {
        Self::write_atomic(&self.storage_root.join(original_path), original).await?;

        let mut variants = Vec::with_capacity(renditions.len());
        for rendition in renditions {
            let variant_path = relative_dir.join(&rendition.filename);
            Self::write_atomic(&self.storage_root.join(&variant_path), &rendition.bytes).await?;
            variants.push(SizeVariant {
                name: rendition.name.clone(),
                width: rendition.width,
                height: rendition.height,
                mime_type: rendition.mime_type.clone(),
                storage_path: storage_key(&variant_path),
            });
        }
        Ok(variants)
    }

    async fn insert_metadata(&self, asset: &MediaAsset) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO media_assets (
                id, listing_id, filename, mime_type, storage_path, width, height,
                size_bytes, checksum, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(asset.id)
        .bind(asset.listing_id.get())
        .bind(&asset.filename)
        .bind(&asset.mime_type)
        .bind(&asset.storage_path)
        .bind(i64::from(asset.width))
        .bind(i64::from(asset.height))
        .bind(asset.size_bytes)
        .bind(&asset.checksum)
        .bind(asset.created_at)
        .execute(&mut *tx)
        .await?;

        for variant in &asset.variants {
            sqlx::query(
                "INSERT INTO media_variants (asset_id, name, width, height, mime_type, storage_path)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(asset.id)
            .bind(&variant.name)
            .bind(i64::from(variant.width))
            .bind(i64::from(variant.height))
            .bind(&variant.mime_type)
            .bind(&variant.storage_path)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove an asset directory and any shard directories it leaves empty.
    async fn discard_files(&self, relative_dir: &Path) {
        let dir = self.storage_root.join(relative_dir);
        if let Err(err) = fs::remove_dir_all(&dir).await {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to remove asset directory {}: {}", dir.display(), err);
            }
        }
        if let Some(parent) = dir.parent() {
            self.prune_empty_dirs(parent, &self.storage_root).await;
        }
    }

    /// Recursively remove empty directories up to the storage root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl AssetStore for SqliteAssetStore {
    async fn has_featured_asset(&self, listing_id: ListingId) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS (
                SELECT 1 FROM media_assets
                WHERE listing_id = ?1 AND mime_type LIKE 'image/%'
             ) OR EXISTS (
                SELECT 1 FROM listings
                WHERE id = ?1 AND featured_asset_id IS NOT NULL
             )",
        )
        .bind(listing_id.get())
        .fetch_one(&*self.db)
        .await?;
        Ok(exists != 0)
    }

    /// Copy the upload into managed storage and record it.
    ///
    /// - Detects the format from content, falling back to the extension.
    /// - Decodes and renders variants on the blocking pool.
    /// - Writes every file atomically, then inserts metadata in one transaction.
    ///
    /// Files are removed again if writing or the metadata insert fails.
    async fn materialize(
        &self,
        upload: &RawUpload,
        listing_id: ListingId,
    ) -> StoreResult<MediaAsset> {
        let bytes = fs::read(&upload.path)
            .await
            .map_err(|source| StoreError::UnreadableUpload {
                path: upload.path.clone(),
                source,
            })?;

        let asset_id = Uuid::new_v4();
        let filename = sanitize_file_name(&upload.filename);
        let checksum = format!("{:x}", md5::compute(&bytes));
        let size_bytes = bytes.len() as i64;

        let rendered = {
            let filename = filename.clone();
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || render_variants(&bytes, &filename))
                .await
                .map_err(io::Error::other)??
        };

        let relative_dir = Self::asset_dir(listing_id, asset_id);
        let original_path = relative_dir.join(&filename);

        let variants = match self
            .write_files(&original_path, &bytes, &relative_dir, &rendered.variants)
            .await
        {
            Ok(variants) => variants,
            Err(err) => {
                self.discard_files(&relative_dir).await;
                return Err(err);
            }
        };

        let asset = MediaAsset {
            id: asset_id,
            listing_id,
            filename,
            mime_type: rendered.mime_type,
            storage_path: storage_key(&original_path),
            width: rendered.width,
            height: rendered.height,
            size_bytes,
            checksum,
            created_at: Utc::now(),
            variants,
        };

        if let Err(err) = self.insert_metadata(&asset).await {
            self.discard_files(&relative_dir).await;
            return Err(err);
        }

        info!(
            listing_id = %listing_id,
            asset_id = %asset.id,
            mime_type = %asset.mime_type,
            width = asset.width,
            height = asset.height,
            variants = asset.variants.len(),
            "materialized media asset"
        );
        Ok(asset)
    }

    async fn bind(&self, listing_id: ListingId, asset: &MediaAsset) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO listings (id, featured_listing_upload, featured_asset_id, updated_at)
             VALUES (?, NULL, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                featured_asset_id = excluded.featured_asset_id,
                updated_at = excluded.updated_at",
        )
        .bind(listing_id.get())
        .bind(asset.id)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        debug!(listing_id = %listing_id, asset_id = %asset.id, "bound featured image");
        Ok(())
    }

    async fn discard(&self, asset: &MediaAsset) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        let bound = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS (SELECT 1 FROM listings WHERE featured_asset_id = ?)",
        )
        .bind(asset.id)
        .fetch_one(&mut *tx)
        .await?;
        if bound != 0 {
            tx.rollback().await?;
            debug!(asset_id = %asset.id, "asset is featured; not discarding");
            return Ok(());
        }

        sqlx::query("DELETE FROM media_variants WHERE asset_id = ?")
            .bind(asset.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM media_assets WHERE id = ?")
            .bind(asset.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.discard_files(&Self::asset_dir(asset.listing_id, asset.id))
            .await;
        info!(listing_id = %asset.listing_id, asset_id = %asset.id, "discarded unbound media asset");
        Ok(())
    }
}

/// Decode `bytes` and render every applicable display variant.
fn render_variants(bytes: &[u8], filename: &str) -> StoreResult<Rendered> {
    let format = image::guess_format(bytes)
        .ok()
        .or_else(|| ImageFormat::from_path(filename).ok())
        .ok_or_else(|| StoreError::UnsupportedFormat(filename.to_string()))?;
    let img = image::load_from_memory_with_format(bytes, format)?;
    let (width, height) = (img.width(), img.height());

    let output_format = variant_format(format);
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("image");
    let extension = output_format.extensions_str().first().copied().unwrap_or("png");

    let mut variants = Vec::new();
    for spec in VARIANTS {
        let Some((target_w, target_h)) = spec.target_dimensions(width, height) else {
            continue;
        };
        let resized = if spec.crop {
            img.resize_to_fill(target_w, target_h, FilterType::Lanczos3)
        } else {
            img.resize_exact(target_w, target_h, FilterType::Lanczos3)
        };
        variants.push(Rendition {
            name: spec.name.to_string(),
            filename: format!("{}-{}x{}.{}", stem, target_w, target_h, extension),
            mime_type: output_format.to_mime_type().to_string(),
            width: target_w,
            height: target_h,
            bytes: encode(resized, output_format)?,
        });
    }

    Ok(Rendered {
        mime_type: format.to_mime_type().to_string(),
        width,
        height,
        variants,
    })
}

/// JPEG originals keep JPEG variants; everything else renders to PNG.
fn variant_format(source: ImageFormat) -> ImageFormat {
    match source {
        ImageFormat::Jpeg => ImageFormat::Jpeg,
        _ => ImageFormat::Png,
    }
}

fn encode(img: DynamicImage, format: ImageFormat) -> StoreResult<Vec<u8>> {
    // The JPEG encoder rejects alpha channels.
    let img = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img,
    };
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format)?;
    Ok(buf.into_inner())
}

/// Relative path rendered with `/` separators for storage in metadata.
fn storage_key(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Make an uploaded file name safe to store.
///
/// Whitespace becomes `-`, characters outside `[A-Za-z0-9._-]` are dropped,
/// runs of `-` collapse, and leading dots or dashes are trimmed.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let mapped = if c.is_whitespace() { '-' } else { c };
        if !(mapped.is_ascii_alphanumeric() || matches!(mapped, '.' | '_' | '-')) {
            continue;
        }
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_start_matches(['.', '-']).trim_end_matches('-');
    if trimmed.is_empty() {
        "image".to_string()
    } else {
        trimmed.to_string()
    }
}
