//! Promotion of a listing's uploaded image into its featured image.
//!
//! One call handles one listing-update event. The steps run strictly in
//! order and each depends on the previous one:
//!
//! 1. no upload reference: skip
//! 2. listing already owns an image: skip
//! 3. resolve the reference to a file in the upload directory
//! 4. read pixel dimensions
//! 5. apply the size policy
//! 6. materialize the asset
//! 7. bind it as the featured image
//!
//! Nothing observable changes before step 7 succeeds: an asset whose binding
//! fails is discarded again before the listing is released. Steps 2–7 are
//! serialized per listing so concurrent events cannot both pass the existence
//! check.

use crate::{
    models::listing::ListingId,
    services::{
        asset_store::{AssetStore, StoreError},
        raw_upload::{RawUpload, UploadError},
        size_policy::SizePolicy,
    },
};
use dashmap::DashMap;
use serde::Serialize;
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why an event left the listing untouched without failing.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoUpload,
    AlreadyBound,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoUpload => write!(f, "no upload provided"),
            SkipReason::AlreadyBound => write!(f, "already has featured image"),
        }
    }
}

/// Result of a successfully handled listing-update event.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Skipped { reason: SkipReason },
    Bound { asset_id: Uuid },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid upload: {0}")]
    Input(#[from] UploadError),
    #[error(
        "image is {width}x{height}; featured images must be at least {min_width}px wide and no taller than wide"
    )]
    Validation {
        width: u32,
        height: u32,
        min_width: u32,
    },
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    /// Binding failed and the new asset could not be removed again.
    #[error("asset {asset_id} was stored but not bound ({bind}); cleanup failed: {cleanup}")]
    Unbound {
        asset_id: Uuid,
        #[source]
        bind: StoreError,
        cleanup: StoreError,
    },
}

impl PipelineError {
    /// Short machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Input(_) => "input",
            PipelineError::Validation { .. } => "validation",
            PipelineError::Storage(_) | PipelineError::Unbound { .. } => "storage",
        }
    }

    /// Storage failures are transient in principle; nothing here retries them.
    ///
    /// An asset left behind by [`PipelineError::Unbound`] blocks the existence check, so
    /// retrying cannot succeed until it is removed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Storage(_))
    }
}

/// Stateless orchestrator over an [`AssetStore`] and a [`SizePolicy`].
pub struct FeaturedImageBinder {
    store: Arc<dyn AssetStore>,
    policy: SizePolicy,
    upload_dir: PathBuf,
    /// Per-listing guards held across the check-then-create sequence.
    in_flight: DashMap<ListingId, Arc<Mutex<()>>>,
}

impl FeaturedImageBinder {
    pub fn new(store: Arc<dyn AssetStore>, policy: SizePolicy, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            policy,
            upload_dir: upload_dir.into(),
            in_flight: DashMap::new(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Handle one listing-update event.
    pub async fn handle_listing_update(
        &self,
        listing_id: ListingId,
        raw_upload_ref: Option<&str>,
    ) -> Result<Outcome, PipelineError> {
        let Some(raw_upload_ref) = raw_upload_ref.map(str::trim).filter(|r| !r.is_empty()) else {
            debug!(listing_id = %listing_id, "no featured upload submitted");
            return Ok(Outcome::Skipped {
                reason: SkipReason::NoUpload,
            });
        };

        let slot = InFlight::enter(&self.in_flight, listing_id);
        let result = {
            let _guard = slot.lock.lock().await;
            self.promote(listing_id, raw_upload_ref).await
        };
        drop(slot);

        match &result {
            Ok(Outcome::Bound { asset_id }) => {
                info!(listing_id = %listing_id, asset_id = %asset_id, "featured image bound")
            }
            Ok(Outcome::Skipped { reason }) => {
                debug!(listing_id = %listing_id, reason = %reason, "featured image skipped")
            }
            Err(err) => warn!(
                listing_id = %listing_id,
                kind = err.kind(),
                error = %err,
                "featured image not bound"
            ),
        }
        result
    }

    async fn promote(
        &self,
        listing_id: ListingId,
        raw_upload_ref: &str,
    ) -> Result<Outcome, PipelineError> {
        if self.store.has_featured_asset(listing_id).await? {
            return Ok(Outcome::Skipped {
                reason: SkipReason::AlreadyBound,
            });
        }

        let upload = RawUpload::resolve(&self.upload_dir, raw_upload_ref).await?;
        let (width, height) = upload.dimensions().await?;
        if !self.policy.is_acceptable(width, height) {
            return Err(PipelineError::Validation {
                width,
                height,
                min_width: self.policy.min_width(),
            });
        }

        let asset = self.store.materialize(&upload, listing_id).await?;
        if let Err(bind) = self.store.bind(listing_id, &asset).await {
            return match self.store.discard(&asset).await {
                Ok(()) => Err(PipelineError::Storage(bind)),
                Err(cleanup) => Err(PipelineError::Unbound {
                    asset_id: asset.id,
                    bind,
                    cleanup,
                }),
            };
        }

        Ok(Outcome::Bound { asset_id: asset.id })
    }
}

/// A caller's share of a listing's lock. The map entry is removed when the
/// last share is dropped, also when the caller's future is cancelled.
struct InFlight<'a> {
    map: &'a DashMap<ListingId, Arc<Mutex<()>>>,
    listing_id: ListingId,
    lock: Arc<Mutex<()>>,
}

impl<'a> InFlight<'a> {
    fn enter(map: &'a DashMap<ListingId, Arc<Mutex<()>>>, listing_id: ListingId) -> Self {
        let lock = map.entry(listing_id).or_default().clone();
        Self {
            map,
            listing_id,
            lock,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // One reference is the map's, one is ours.
        self.map.remove_if(&self.listing_id, |_, entry| {
            Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::media_asset::MediaAsset;
    use crate::services::asset_store::StoreResult;
    use async_trait::async_trait;
    use chrono::Utc;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering},
    };
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        HasFeaturedAsset(ListingId),
        Materialize(ListingId, String),
        Bind(ListingId, Uuid),
        Discard(Uuid),
    }

    /// In-memory store that records every call it receives.
    #[derive(Default)]
    struct RecordingStore {
        calls: StdMutex<Vec<Call>>,
        /// Materialized assets, bound or not.
        assets: StdMutex<Vec<(ListingId, Uuid)>>,
        bound: StdMutex<Vec<(ListingId, Uuid)>>,
        fail_materialize: bool,
        /// Number of upcoming `bind` calls that fail.
        failing_binds: AtomicUsize,
        fail_discard: bool,
        /// Never answer the existence check.
        stall: bool,
    }

    impl RecordingStore {
        fn with_bound(listing_id: ListingId) -> Self {
            let store = Self::default();
            store.bound.lock().unwrap().push((listing_id, Uuid::new_v4()));
            store
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn materialize_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|call| matches!(call, Call::Materialize(..)))
                .count()
        }
    }

    #[async_trait]
    impl AssetStore for RecordingStore {
        async fn has_featured_asset(&self, listing_id: ListingId) -> StoreResult<bool> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::HasFeaturedAsset(listing_id));
            if self.stall {
                std::future::pending::<()>().await;
            }
            let owns = |list: &StdMutex<Vec<(ListingId, Uuid)>>| {
                list.lock().unwrap().iter().any(|(id, _)| *id == listing_id)
            };
            Ok(owns(&self.assets) || owns(&self.bound))
        }

        async fn materialize(
            &self,
            upload: &RawUpload,
            listing_id: ListingId,
        ) -> StoreResult<MediaAsset> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Materialize(listing_id, upload.filename.clone()));
            if self.fail_materialize {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            let id = Uuid::new_v4();
            self.assets.lock().unwrap().push((listing_id, id));
            Ok(MediaAsset {
                id,
                listing_id,
                filename: upload.filename.clone(),
                mime_type: "image/png".into(),
                storage_path: format!("listing-{}/{}", listing_id, upload.filename),
                width: 0,
                height: 0,
                size_bytes: 0,
                checksum: String::new(),
                created_at: Utc::now(),
                variants: Vec::new(),
            })
        }

        async fn bind(&self, listing_id: ListingId, asset: &MediaAsset) -> StoreResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Bind(listing_id, asset.id));
            let failing = self
                .failing_binds
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Io(std::io::Error::other("database is locked")));
            }
            self.bound.lock().unwrap().push((listing_id, asset.id));
            Ok(())
        }

        async fn discard(&self, asset: &MediaAsset) -> StoreResult<()> {
            self.calls.lock().unwrap().push(Call::Discard(asset.id));
            if self.fail_discard {
                return Err(StoreError::Io(std::io::Error::other("read-only file system")));
            }
            self.assets.lock().unwrap().retain(|(_, id)| *id != asset.id);
            Ok(())
        }
    }

    fn upload_dir_with(name: &str, width: u32, height: u32) -> TempDir {
        let dir = tempdir().unwrap();
        RgbImage::from_pixel(width, height, Rgb([200, 100, 50]))
            .save_with_format(dir.path().join(name), ImageFormat::Png)
            .unwrap();
        dir
    }

    fn binder(store: Arc<RecordingStore>, dir: &TempDir) -> FeaturedImageBinder {
        FeaturedImageBinder::new(store, SizePolicy::default(), dir.path())
    }

    #[tokio::test]
    async fn empty_reference_makes_no_store_calls() {
        let store = Arc::new(RecordingStore::default());
        let dir = tempdir().unwrap();
        let binder = binder(store.clone(), &dir);

        for reference in [None, Some(""), Some("   ")] {
            let outcome = binder
                .handle_listing_update(ListingId(7), reference)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                Outcome::Skipped {
                    reason: SkipReason::NoUpload
                }
            );
        }
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn already_bound_listing_is_skipped() {
        let store = Arc::new(RecordingStore::with_bound(ListingId(7)));
        let dir = upload_dir_with("front.png", 900, 600);
        let binder = binder(store.clone(), &dir);

        let outcome = binder
            .handle_listing_update(ListingId(7), Some("front.png"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Skipped {
                reason: SkipReason::AlreadyBound
            }
        );
        assert_eq!(outcome_reason(&outcome), "already has featured image");
        assert_eq!(store.calls(), vec![Call::HasFeaturedAsset(ListingId(7))]);
    }

    #[tokio::test]
    async fn small_image_fails_validation_without_materializing() {
        let store = Arc::new(RecordingStore::default());
        let dir = upload_dir_with("small.png", 300, 300);
        let binder = binder(store.clone(), &dir);

        let err = binder
            .handle_listing_update(ListingId(3), Some("https://example.test/uploads/small.png"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Validation {
                width: 300,
                height: 300,
                min_width: 450
            }
        ));
        assert!(!err.is_retryable());
        assert_eq!(store.materialize_count(), 0);
        assert!(store.bound.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn portrait_image_fails_validation() {
        let store = Arc::new(RecordingStore::default());
        let dir = upload_dir_with("tall.png", 600, 601);
        let binder = binder(store.clone(), &dir);

        let err = binder
            .handle_listing_update(ListingId(3), Some("tall.png"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(store.materialize_count(), 0);
    }

    #[tokio::test]
    async fn missing_upload_is_an_input_error() {
        let store = Arc::new(RecordingStore::default());
        let dir = tempdir().unwrap();
        let binder = binder(store.clone(), &dir);

        let err = binder
            .handle_listing_update(ListingId(3), Some("gone.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Input(UploadError::NotFound(_))));
        assert_eq!(store.materialize_count(), 0);
    }

    #[tokio::test]
    async fn unreadable_upload_is_an_input_error() {
        let store = Arc::new(RecordingStore::default());
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("corrupt.png"), b"\x89PNG garbage").unwrap();
        let binder = binder(store.clone(), &dir);

        let err = binder
            .handle_listing_update(ListingId(3), Some("corrupt.png"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "input");
        assert_eq!(store.materialize_count(), 0);
    }

    #[tokio::test]
    async fn storage_failure_does_not_bind() {
        let store = Arc::new(RecordingStore {
            fail_materialize: true,
            ..Default::default()
        });
        let dir = upload_dir_with("front.png", 900, 600);
        let binder = binder(store.clone(), &dir);

        let err = binder
            .handle_listing_update(ListingId(5), Some("front.png"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(
            !store
                .calls()
                .iter()
                .any(|call| matches!(call, Call::Bind(..)))
        );
    }

    #[tokio::test]
    async fn existence_check_precedes_materialize_and_bind() {
        let store = Arc::new(RecordingStore::default());
        let dir = upload_dir_with("front.png", 900, 600);
        let binder = binder(store.clone(), &dir);

        let outcome = binder
            .handle_listing_update(ListingId(42), Some("front.png"))
            .await
            .unwrap();

        let Outcome::Bound { asset_id } = outcome else {
            panic!("expected bound outcome, got {outcome:?}");
        };
        assert_eq!(
            store.calls(),
            vec![
                Call::HasFeaturedAsset(ListingId(42)),
                Call::Materialize(ListingId(42), "front.png".into()),
                Call::Bind(ListingId(42), asset_id),
            ]
        );
    }

    #[tokio::test]
    async fn second_event_creates_nothing_new() {
        let store = Arc::new(RecordingStore::default());
        let dir = upload_dir_with("front.png", 900, 600);
        let binder = binder(store.clone(), &dir);

        binder
            .handle_listing_update(ListingId(42), Some("front.png"))
            .await
            .unwrap();
        let second = binder
            .handle_listing_update(ListingId(42), Some("front.png"))
            .await
            .unwrap();

        assert_eq!(
            second,
            Outcome::Skipped {
                reason: SkipReason::AlreadyBound
            }
        );
        assert_eq!(store.materialize_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_events_for_one_listing_create_one_asset() {
        let store = Arc::new(RecordingStore::default());
        let dir = upload_dir_with("front.png", 900, 600);
        let binder = Arc::new(binder(store.clone(), &dir));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let binder = binder.clone();
                tokio::spawn(async move {
                    binder
                        .handle_listing_update(ListingId(9), Some("front.png"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut bound = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Outcome::Bound { .. }) {
                bound += 1;
            }
        }
        assert_eq!(bound, 1);
        assert_eq!(store.materialize_count(), 1);
        assert!(binder.in_flight.is_empty());
    }

    #[tokio::test]
    async fn failed_bind_discards_asset_so_retry_binds() {
        let store = Arc::new(RecordingStore {
            failing_binds: AtomicUsize::new(1),
            ..Default::default()
        });
        let dir = upload_dir_with("front.png", 900, 600);
        let binder = binder(store.clone(), &dir);

        let err = binder
            .handle_listing_update(ListingId(42), Some("front.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(StoreError::Io(_))));
        assert!(err.is_retryable());

        let calls = store.calls();
        let Some(Call::Bind(_, first_id)) = calls.get(2).cloned() else {
            panic!("expected bind as third call, got {calls:?}");
        };
        assert_eq!(calls.get(3), Some(&Call::Discard(first_id)));
        assert!(store.assets.lock().unwrap().is_empty());

        let retry = binder
            .handle_listing_update(ListingId(42), Some("front.png"))
            .await
            .unwrap();
        let Outcome::Bound { asset_id } = retry else {
            panic!("expected retry to bind, got {retry:?}");
        };
        assert_ne!(asset_id, first_id);
        assert_eq!(*store.bound.lock().unwrap(), vec![(ListingId(42), asset_id)]);
        assert_eq!(store.materialize_count(), 2);
    }

    #[tokio::test]
    async fn failed_cleanup_after_failed_bind_is_not_retryable() {
        let store = Arc::new(RecordingStore {
            failing_binds: AtomicUsize::new(1),
            fail_discard: true,
            ..Default::default()
        });
        let dir = upload_dir_with("front.png", 900, 600);
        let binder = binder(store.clone(), &dir);

        let err = binder
            .handle_listing_update(ListingId(42), Some("front.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Unbound { .. }));
        assert_eq!(err.kind(), "storage");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_event_releases_listing_slot() {
        let store = Arc::new(RecordingStore {
            stall: true,
            ..Default::default()
        });
        let dir = upload_dir_with("front.png", 900, 600);
        let binder = binder(store.clone(), &dir);

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            binder.handle_listing_update(ListingId(11), Some("front.png")),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(store.calls(), vec![Call::HasFeaturedAsset(ListingId(11))]);
        assert!(binder.in_flight.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_slot_to_holder() {
        let store = Arc::new(RecordingStore::default());
        let dir = upload_dir_with("front.png", 900, 600);
        let binder = binder(store.clone(), &dir);

        let holder = InFlight::enter(&binder.in_flight, ListingId(12));
        let held = holder.lock.lock().await;
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            binder.handle_listing_update(ListingId(12), Some("front.png")),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(binder.in_flight.len(), 1);

        drop(held);
        drop(holder);
        assert!(binder.in_flight.is_empty());
        assert!(store.calls().is_empty());
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(Outcome::Skipped {
            reason: SkipReason::NoUpload,
        })
        .unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["reason"], "no_upload");
    }

    fn outcome_reason(outcome: &Outcome) -> String {
        match outcome {
            Outcome::Skipped { reason } => reason.to_string(),
            Outcome::Bound { .. } => String::new(),
        }
    }
}
