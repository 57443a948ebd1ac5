use anyhow::{Context, Result};

/// Process-wide configuration, loaded once at startup from the environment
/// (populated by `dotenvy` before this is called, same convention as the
/// teacher's `AppConfig::from_env`).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub host: String,
    pub port: u16,

    /// Control-plane + event-store SQLite DSN. Modeled as one physical
    /// database standing in for the production relational control DB and
    /// the analytics event store (both external collaborators per spec §6).
    pub database_url: String,

    /// KV store DSN. Stands in for the production KV service; real
    /// deployments point this at the actual KV collaborator.
    pub kv_url: String,

    /// S3-compatible bucket for the "assets" blob namespace (§6).
    pub blob_assets_bucket: String,
    /// S3-compatible bucket for the per-user "drive" blob namespace (§6).
    pub blob_drive_bucket: String,
    pub blob_region: String,
    /// Non-AWS S3-compatible endpoint override, if any.
    pub blob_endpoint: Option<String>,

    /// Bounded deadline (ms) for upstream fetches (proxy / hosted-remote).
    pub request_timeout_ms: u64,

    /// Fast-path window (ms) for the destination cache (§4.14, Open Q3).
    pub dest_cache_fast_path_ms: u64,

    /// Platform-cache TTL (seconds), §4.15.
    pub platform_cache_ttl_secs: u64,

    /// Default blob-store folder served when the block filter trips and
    /// the bundle carries no explicit block destination (§4.4).
    pub safe_page_folder: String,

    /// How long an impression stays eligible for `/t/enrich` updates.
    pub enrich_token_ttl_secs: u64,
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self> {
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".into())
            .parse::<u16>()
            .context("PORT must be a valid port number (1-65535)")?;

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./dispatcher.db".into());

        let kv_url =
            std::env::var("KV_URL").unwrap_or_else(|_| "sqlite:./dispatcher_kv.db".into());

        let blob_assets_bucket =
            std::env::var("BLOB_ASSETS_BUCKET").unwrap_or_else(|_| "assets".into());
        let blob_drive_bucket =
            std::env::var("BLOB_DRIVE_BUCKET").unwrap_or_else(|_| "drive".into());
        let blob_region = std::env::var("BLOB_REGION").unwrap_or_else(|_| "us-east-1".into());
        let blob_endpoint = std::env::var("BLOB_ENDPOINT").ok();

        let request_timeout_ms = std::env::var("REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4000);

        let dest_cache_fast_path_ms = std::env::var("DEST_CACHE_FAST_PATH_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let platform_cache_ttl_secs = std::env::var("PLATFORM_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(900);

        let safe_page_folder =
            std::env::var("SAFE_PAGE_FOLDER").unwrap_or_else(|_| "safe/".into());

        let enrich_token_ttl_secs = std::env::var("ENRICH_TOKEN_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(600);

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port,
            database_url,
            kv_url,
            blob_assets_bucket,
            blob_drive_bucket,
            blob_region,
            blob_endpoint,
            request_timeout_ms,
            dest_cache_fast_path_ms,
            platform_cache_ttl_secs,
            safe_page_folder,
            enrich_token_ttl_secs,
        })
    }
}
