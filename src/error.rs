use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Domain errors the engine's own request-handling logic can produce.
/// Infrastructure setup (pool construction, config) stays on `anyhow::Result`
/// at the boundary, same split as the teacher's `main.rs` / `AppConfig`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no rule bundle for {0}")]
    RuleNotFound(String),

    #[error("invalid embed url: {0}")]
    InvalidEmbedUrl(String),

    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    #[error("upstream returned status {0}")]
    UpstreamStatus(StatusCode),

    #[error("blob not found: {0}")]
    BlobMiss(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("kv error: {0}")]
    Kv(String),
}

/// Maps each domain error onto the exact HTTP behavior spec.md §7 specifies.
/// `RuleNotFound` / `BlobMiss` become the generic 404 page, `InvalidEmbedUrl`
/// is the one case with a typed 400 body, everything else degrades to 500.
impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match self {
            DispatchError::RuleNotFound(_) | DispatchError::BlobMiss(_) => {
                (StatusCode::NOT_FOUND, "not found").into_response()
            }
            DispatchError::InvalidEmbedUrl(msg) => (
                StatusCode::BAD_REQUEST,
                [("content-type", "application/javascript")],
                format!("console.error({msg:?});"),
            )
                .into_response(),
            DispatchError::UpstreamStatus(status) => status.into_response(),
            DispatchError::UpstreamFetch(e) => {
                tracing::error!(error = %e, "upstream fetch failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "upstream error").into_response()
            }
            DispatchError::Db(e) => {
                tracing::error!(error = %e, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
            DispatchError::Kv(msg) => {
                tracing::error!(error = %msg, "kv error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        DispatchError::UpstreamFetch(e.to_string())
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
