use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod blobstore;
mod blocklist;
mod clickout;
mod config;
mod context;
mod db;
mod destcache;
mod dispatch;
mod enrich;
mod error;
mod events;
mod fingerprint;
mod htmlrewrite;
mod hosted;
mod kv;
mod macros_engine;
mod matcher;
mod modifications;
mod platformcache;
mod postback;
mod proxy;
mod resolver;
mod rules;
mod selector;
#[cfg(test)]
mod seed;

use blobstore::S3BlobStore;
use db::ControlDb;
use destcache::DestinationCache;
use dispatch::{dispatch, proxy_session_response, DispatchOutcome, DispatchState};
use enrich::{enrich, TransportMeta};
use events::{EnrichmentUpdate, SqlxEventStore};
use kv::SqliteKv;
use platformcache::PlatformCache;
use std::collections::HashMap;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dispatcher=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::DispatcherConfig::from_env()?;
    tracing::info!("Starting dispatcher on {}:{}", config.host, config.port);

    let db_pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(
            config
                .database_url
                .trim_start_matches("sqlite:")
                .parse::<sqlx::sqlite::SqliteConnectOptions>()?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal),
        )
        .await?;
    ControlDb::migrate(&db_pool).await?;
    SqlxEventStore::migrate(&db_pool).await?;
    tracing::info!("Control-plane + event-store migrations applied");

    let kv_pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            config
                .kv_url
                .trim_start_matches("sqlite:")
                .parse::<sqlx::sqlite::SqliteConnectOptions>()?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal),
        )
        .await?;
    SqliteKv::migrate(&kv_pool).await?;

    let blobs = S3BlobStore::new(
        &config.blob_assets_bucket,
        &config.blob_drive_bucket,
        &config.blob_region,
        config.blob_endpoint.as_deref(),
    )?;

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
        .build()?;

    let state = Arc::new(DispatchState {
        kv: Arc::new(SqliteKv::new(kv_pool)),
        db: Arc::new(ControlDb::new(db_pool.clone())),
        events: Arc::new(SqlxEventStore::new(db_pool)),
        blobs: Arc::new(blobs),
        dest_cache: Arc::new(DestinationCache::new(config.dest_cache_fast_path_ms)),
        platform_cache: Arc::new(PlatformCache::new(config.platform_cache_ttl_secs)),
        http,
        config,
    });

    let app = Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route("/t/enrich", post(enrich_handler))
        .route("/postback", get(postback_handler))
        .route("/track.js", get(track_js_handler))
        .route("/proxy-session", get(proxy_session_handler))
        .route("/*path", get(catch_all))
        .route("/", get(catch_all))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let bind_addr = format!("{}:{}", std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()), std::env::var("PORT").unwrap_or_else(|_| "8080".into()));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

/// The catch-all path: every inbound marketing request that isn't one of
/// the three fixed control-surface routes (§6).
async fn catch_all(
    State(state): State<Arc<DispatchState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: axum::http::Uri,
) -> axum::response::Response {
    if crate::enrich::is_speculative(&headers) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let path = uri.path().to_string();
    let query: HashMap<String, String> = uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let transport = TransportMeta::default();
    let ctx = enrich(&headers, &host, &path, &query, addr.ip(), &transport);

    match dispatch(&state, &ctx).await {
        Ok(DispatchOutcome::Response(resp)) => resp,
        Ok(DispatchOutcome::NotFound) => (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => e.into_response(),
    }
}

/// §6 embed mode: `<script src="/track.js?url=...">` dispatches as if the
/// request were for the embedded `url`, then wraps the outcome as
/// JavaScript so a `<script>` tag can act on it (a redirect becomes a
/// `location.href` assignment, hosted/proxied content is injected via
/// `document.write`).
async fn track_js_handler(
    State(state): State<Arc<DispatchState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> axum::response::Response {
    if crate::enrich::is_speculative(&headers) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let Some(url_param) = q.get("url") else {
        return crate::error::DispatchError::InvalidEmbedUrl("missing url parameter".to_string()).into_response();
    };
    let Some((host, path, query)) = crate::enrich::parse_embed_target(url_param) else {
        return crate::error::DispatchError::InvalidEmbedUrl(url_param.clone()).into_response();
    };

    let transport = TransportMeta::default();
    let mut ctx = enrich(&headers, &host, &path, &query, addr.ip(), &transport);
    ctx.is_embed = true;

    match dispatch(&state, &ctx).await {
        Ok(DispatchOutcome::Response(resp)) => wrap_as_javascript(resp).await,
        Ok(DispatchOutcome::NotFound) => {
            (StatusCode::NOT_FOUND, [(axum::http::header::CONTENT_TYPE, "application/javascript")], "").into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// A redirect response becomes a `location.href` assignment; anything else
/// gets its body handed to `document.write` so the embedding page renders
/// it in place.
async fn wrap_as_javascript(resp: axum::response::Response) -> axum::response::Response {
    let status = resp.status();
    if let Some(location) = resp.headers().get(axum::http::header::LOCATION).and_then(|v| v.to_str().ok()) {
        let dest_json = serde_json::to_string(location).unwrap_or_else(|_| "\"\"".to_string());
        return (status, [(axum::http::header::CONTENT_TYPE, "application/javascript")], format!("location.href = {dest_json};"))
            .into_response();
    }

    let body = match axum::body::to_bytes(resp.into_body(), usize::MAX).await {
        Ok(b) => b,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    let html = String::from_utf8_lossy(&body);
    let html_json = serde_json::to_string(html.as_ref()).unwrap_or_else(|_| "\"\"".to_string());
    let script = format!("document.open();document.write({html_json});document.close();");
    (status, [(axum::http::header::CONTENT_TYPE, "application/javascript")], script).into_response()
}

/// §6 `/proxy-session`: transparent proxying that rewrites every link to
/// recurse back through this same endpoint.
async fn proxy_session_handler(
    State(state): State<Arc<DispatchState>>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> axum::response::Response {
    if crate::enrich::is_speculative(&headers) {
        return StatusCode::NO_CONTENT.into_response();
    }
    let Some(url) = q.get("url") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match proxy_session_response(&state, url).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

#[derive(serde::Deserialize)]
struct PostbackQuery {
    #[serde(rename = "clickId")]
    click_id: String,
    payout: Option<f64>,
    #[serde(rename = "conversionType")]
    conversion_type: Option<String>,
    #[serde(flatten)]
    rest: HashMap<String, String>,
}

async fn postback_handler(State(state): State<Arc<DispatchState>>, Query(q): Query<PostbackQuery>) -> axum::response::Response {
    let req = postback::PostbackRequest {
        click_id: &q.click_id,
        payout: q.payout,
        conversion_type: q.conversion_type.as_deref(),
        raw_query: &q.rest,
    };
    match postback::build_conversion_event(state.events.as_ref(), &req).await {
        Ok(event) => {
            postback::emit_conversion(state.events.clone(), event);
            StatusCode::OK.into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "postback rejected");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Always 204: this is a best-effort beacon from client JS (`sendBeacon` or
/// the redirect-latency stub's fetch), and a client that's already gone
/// can't do anything useful with a non-2xx status (§6).
async fn enrich_handler(State(state): State<Arc<DispatchState>>, Json(body): Json<EnrichmentUpdate>) -> axum::response::Response {
    if let Some(event_id) = &body.impression_id {
        if let Err(e) = state.events.update_enrichment(event_id, &body).await {
            tracing::warn!(error = %e, %event_id, "enrichment update failed");
        }
    } else {
        tracing::debug!("enrichment beacon missing impressionId");
    }
    StatusCode::NO_CONTENT.into_response()
}
