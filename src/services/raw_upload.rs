//! Resolution of raw upload references into locally readable files.
//!
//! The upstream upload mechanism drops accepted files into a single upload
//! directory and hands the form a path or URL pointing at them. Only the final
//! segment of that reference is trusted; it is joined onto the configured
//! upload directory so a reference can never address a file outside it.

use image::ImageReader;
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no upload reference provided")]
    EmptyReference,
    #[error("upload reference `{0}` does not name a file")]
    InvalidReference(String),
    #[error("upload `{}` not found", .0.display())]
    NotFound(PathBuf),
    #[error("upload `{}` is not a readable image: {source}", path.display())]
    UnreadableImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A raw upload resolved to a file inside the upload directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawUpload {
    /// Reference exactly as submitted.
    pub reference: String,
    /// Final path segment of the reference.
    pub filename: String,
    /// Resolved location on disk.
    pub path: PathBuf,
}

impl RawUpload {
    /// Resolve `reference` against `upload_dir`.
    ///
    /// Fails when the reference has no usable file name or no regular file
    /// exists at the resolved location.
    pub async fn resolve(upload_dir: &Path, reference: &str) -> Result<Self, UploadError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(UploadError::EmptyReference);
        }

        let filename = reference_file_name(reference)
            .ok_or_else(|| UploadError::InvalidReference(reference.to_string()))?;
        let path = upload_dir.join(&filename);

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Self {
                reference: reference.to_string(),
                filename,
                path,
            }),
            Ok(_) => Err(UploadError::NotFound(path)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(UploadError::NotFound(path)),
            Err(err) => Err(UploadError::Io(err)),
        }
    }

    /// Read pixel dimensions from the image header.
    ///
    /// The format is sniffed from content first, falling back to the file
    /// extension. Corrupt or unsupported files are reported, never passed.
    pub async fn dimensions(&self) -> Result<(u32, u32), UploadError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let reader = ImageReader::open(&path)?.with_guessed_format()?;
            reader
                .into_dimensions()
                .map_err(|source| UploadError::UnreadableImage { path, source })
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Extract the final path segment from a path or URL reference.
///
/// Query strings and fragments are dropped. Segments that are empty, `.`,
/// `..`, or contain control characters are rejected.
fn reference_file_name(reference: &str) -> Option<String> {
    let without_fragment = reference.split('#').next().unwrap_or(reference);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);
    let name = without_query
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(without_query)
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    if name.chars().any(|c| c.is_control()) {
        return None;
    }
    Some(name.to_string())
}
