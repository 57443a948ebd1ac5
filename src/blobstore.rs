use async_trait::async_trait;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob store request failed: {0}")]
    Backend(#[from] s3::error::S3Error),
}

/// A fetched blob with the content type the store believes it should be
/// served as (§4.9 fallback table, applied by the caller when the store
/// itself has no stored metadata).
pub struct Blob {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// The blob store collaborator (§6): two namespaces — a global "assets"
/// bucket keyed by path, and a per-user "drive" bucket keyed by
/// `{userId}/DRIVE_{driveName}/{subpath}` (§4.9).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_asset(&self, path: &str) -> Result<Blob, BlobError>;
    async fn get_drive_file(&self, user_id: &str, drive_name: &str, subpath: &str) -> Result<Blob, BlobError>;
}

pub struct S3BlobStore {
    assets: Bucket,
    drive: Bucket,
}

impl S3BlobStore {
    pub fn new(
        assets_bucket: &str,
        drive_bucket: &str,
        region: &str,
        endpoint: Option<&str>,
    ) -> anyhow::Result<Self> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                region: region.to_string(),
                endpoint: endpoint.to_string(),
            },
            None => region.parse()?,
        };
        let credentials = Credentials::default()?;
        let assets = Bucket::new(assets_bucket, region.clone(), credentials.clone())?;
        let drive = Bucket::new(drive_bucket, region, credentials)?;
        Ok(Self { assets, drive })
    }

    async fn fetch(bucket: &Bucket, key: &str) -> Result<Blob, BlobError> {
        let response = bucket.get_object(key).await?;
        if response.status_code() == 404 {
            return Err(BlobError::NotFound(key.to_string()));
        }
        let content_type = response
            .headers()
            .get("content-type")
            .map(|v| v.to_string())
            .or_else(|| Some(content_type_for_path(key).to_string()));
        Ok(Blob {
            bytes: response.bytes().to_vec(),
            content_type,
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get_asset(&self, path: &str) -> Result<Blob, BlobError> {
        Self::fetch(&self.assets, path.trim_start_matches('/')).await
    }

    async fn get_drive_file(&self, user_id: &str, drive_name: &str, subpath: &str) -> Result<Blob, BlobError> {
        let key = format!("{user_id}/DRIVE_{drive_name}/{}", subpath.trim_start_matches('/'));
        Self::fetch(&self.drive, &key).await
    }
}

/// §4.9's extension fallback table: when the store carries no stored
/// content-type metadata, fall back on the path's folder/extension.
pub fn content_type_for_path(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".css") || lower.contains("/styles/") {
        return "text/css";
    }
    if lower.ends_with(".js") || lower.contains("/scripts/") {
        return "application/javascript";
    }
    if lower.contains("/images/") || lower.contains("/img/") {
        return guess_image_type(&lower);
    }
    match lower.rsplit('.').next() {
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("woff") => "font/woff",
        _ => "application/octet-stream",
    }
}

fn guess_image_type(lower: &str) -> &'static str {
    match lower.rsplit('.').next() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_fallback_covers_css_js_img() {
        assert_eq!(content_type_for_path("/assets/app.css"), "text/css");
        assert_eq!(content_type_for_path("/assets/app.js"), "application/javascript");
        assert_eq!(content_type_for_path("/images/hero.png"), "image/png");
    }

    #[test]
    fn folder_hint_wins_over_missing_extension() {
        assert_eq!(content_type_for_path("/static/styles/theme"), "text/css");
        assert_eq!(content_type_for_path("/static/scripts/bundle"), "application/javascript");
    }

    #[test]
    fn unknown_extension_is_octet_stream() {
        assert_eq!(content_type_for_path("/files/report.xyz"), "application/octet-stream");
    }
}
