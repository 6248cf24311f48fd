//! HTTP handlers for listing updates, featured image lookup and media
//! delivery. Pipeline logic lives in `FeaturedImageBinder`; these handlers
//! only translate between JSON and the service calls.

use crate::{
    errors::AppError,
    models::{
        form_field::{FormField, admin_fields, submission_fields},
        listing::{FieldValues, ListingId},
        media_asset::{FULL_VARIANT, MediaAsset},
    },
    services::featured_image::{Outcome, PipelineError},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Body of `POST /listings/{id}/update`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingUpdateReq {
    #[serde(default)]
    pub field_values: FieldValues,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingUpdateResp {
    pub listing_id: ListingId,
    pub image: ImageReport,
}

/// Result of the featured image sub-step, reported without failing the save.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ImageReport {
    Done(Outcome),
    Failed {
        outcome: &'static str,
        kind: &'static str,
        message: String,
        retryable: bool,
    },
}

impl From<Result<Outcome, PipelineError>> for ImageReport {
    fn from(result: Result<Outcome, PipelineError>) -> Self {
        match result {
            Ok(outcome) => ImageReport::Done(outcome),
            Err(err) => ImageReport::Failed {
                outcome: "error",
                kind: err.kind(),
                message: err.to_string(),
                retryable: err.is_retryable(),
            },
        }
    }
}

/// POST `/listings/{id}/update` — record the submitted upload reference and
/// try to promote it to the featured image.
///
/// The listing save succeeds even when the image step fails; the failure is
/// reported in the `image` field.
pub async fn update_listing(
    State(state): State<AppState>,
    Path(listing_id): Path<i64>,
    Json(payload): Json<ListingUpdateReq>,
) -> Result<Json<ListingUpdateResp>, AppError> {
    let listing_id = ListingId(listing_id);
    let raw_upload_ref = payload.field_values.raw_upload_ref();

    if let Some(reference) = raw_upload_ref {
        state.store.record_upload_ref(listing_id, reference).await?;
    }

    let result = state
        .binder
        .handle_listing_update(listing_id, raw_upload_ref)
        .await;

    Ok(Json(ListingUpdateResp {
        listing_id,
        image: result.into(),
    }))
}

/// GET `/listings/{id}/featured` — the bound featured image with its variants.
pub async fn get_featured(
    State(state): State<AppState>,
    Path(listing_id): Path<i64>,
) -> Result<Json<MediaAsset>, AppError> {
    let listing_id = ListingId(listing_id);
    state
        .store
        .featured_asset(listing_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("listing {} has no featured image", listing_id)))
}

/// GET `/media/{asset_id}/{variant}` — stream a stored file. `full` is the original.
pub async fn get_media(
    State(state): State<AppState>,
    Path((asset_id, variant)): Path<(Uuid, String)>,
) -> Result<Response, AppError> {
    let (asset, mime_type, file) = state.store.open_variant(asset_id, &variant).await?;
    let length = file
        .metadata()
        .await
        .map_err(|err| AppError::internal(err.to_string()))?
        .len();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    set_media_headers(
        response.headers_mut(),
        &asset,
        &mime_type,
        length,
        variant == FULL_VARIANT,
    );
    Ok(response)
}

/// GET `/fields` — form-field descriptors for the submission form.
pub async fn list_fields() -> Json<Vec<FormField>> {
    Json(submission_fields())
}

/// GET `/fields/admin` — form-field descriptors for the admin listing panel.
pub async fn list_admin_fields() -> Json<Vec<FormField>> {
    Json(admin_fields())
}

fn set_media_headers(
    headers: &mut HeaderMap,
    asset: &MediaAsset,
    mime_type: &str,
    length: u64,
    is_original: bool,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    if is_original {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", asset.checksum)) {
            headers.insert(header::ETAG, value);
        }
    }

    // Assets are immutable once created.
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    if let Ok(value) = HeaderValue::from_str(&asset.created_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
