use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf};

use crate::services::size_policy::DEFAULT_MIN_WIDTH;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_root: String,
    pub upload_dir: String,
    pub database_url: String,
    pub min_width: u32,
}

/// Where managed media lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub storage_root: PathBuf,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Featured image ingestion for listings")]
pub struct Args {
    /// Host to bind to (overrides LISTING_MEDIA_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides LISTING_MEDIA_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where managed media is stored (overrides LISTING_MEDIA_STORAGE_ROOT)
    #[arg(long)]
    pub storage_root: Option<String>,

    /// Directory the upload mechanism writes raw uploads to (overrides LISTING_MEDIA_UPLOAD_DIR)
    #[arg(long)]
    pub upload_dir: Option<String>,

    /// Database URL (overrides LISTING_MEDIA_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Minimum featured image width in pixels (overrides LISTING_MEDIA_MIN_WIDTH)
    #[arg(long)]
    pub min_width: Option<u32>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::from_args(args)
    }

    fn from_args(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env::var("LISTING_MEDIA_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env("LISTING_MEDIA_PORT", 3000u16)?;
        let env_storage =
            env::var("LISTING_MEDIA_STORAGE_ROOT").unwrap_or_else(|_| "./data/media".into());
        let env_uploads =
            env::var("LISTING_MEDIA_UPLOAD_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_db = env::var("LISTING_MEDIA_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/listing_media.db".into());
        let env_min_width = parse_env("LISTING_MEDIA_MIN_WIDTH", DEFAULT_MIN_WIDTH)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_root: args.storage_root.unwrap_or(env_storage),
            upload_dir: args.upload_dir.unwrap_or(env_uploads),
            database_url: args.database_url.unwrap_or(env_db),
            min_width: args.min_width.unwrap_or(env_min_width),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            storage_root: PathBuf::from(&self.storage_root),
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
