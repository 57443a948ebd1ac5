use crate::blobstore::{content_type_for_path, BlobError, BlobStore};
use crate::error::DispatchError;
use crate::htmlrewrite::rewrite_css_urls;
use crate::macros_engine::{expand, ExpandMode, MacroContext};

/// C9: serves hosted-folder content out of the blob store (§4.9). `folder`
/// is the campaign's hosted page folder (served from the global "assets"
/// namespace); `user_id`/`drive_name` select a per-user drive namespace
/// fallback when the asset isn't found under the folder.
pub struct HostedRequest<'a> {
    pub folder: &'a str,
    pub path: &'a str,
    pub user_id: Option<&'a str>,
    pub drive_name: Option<&'a str>,
}

pub struct HostedResponse {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// §4.9's fallback chain, in order:
///  1. `{folder}{path}` with `index.html` appended if `path` is page-like
///     and doesn't already end in a filename.
///  2. `{folder}{path}` verbatim (covers requests that already name a file).
///  3. the per-user drive namespace, if configured, at the same subpath.
/// A miss on every step is `DispatchError::BlobMiss`, which the caller maps
/// to the safe/404 page.
pub async fn serve_hosted(
    store: &dyn BlobStore,
    req: &HostedRequest<'_>,
    macro_ctx: &MacroContext,
) -> Result<HostedResponse, DispatchError> {
    let with_index = indexed_path(req.path);

    if let Some(indexed) = &with_index {
        let key = format!("{}{}", req.folder, indexed);
        match store.get_asset(&key).await {
            Ok(blob) => return Ok(render(blob.bytes, blob.content_type.unwrap_or_else(|| content_type_for_path(&key).to_string()), macro_ctx)),
            Err(BlobError::NotFound(_)) => {}
            Err(e) => return Err(DispatchError::BlobMiss(e.to_string())),
        }
    }

    let key = format!("{}{}", req.folder, req.path);
    match store.get_asset(&key).await {
        Ok(blob) => return Ok(render(blob.bytes, blob.content_type.unwrap_or_else(|| content_type_for_path(&key).to_string()), macro_ctx)),
        Err(BlobError::NotFound(_)) => {}
        Err(e) => return Err(DispatchError::BlobMiss(e.to_string())),
    }

    if let Some(filename) = req.path.rsplit('/').next().filter(|f| !f.is_empty()) {
        for dir in fallback_dirs(req.path) {
            let key = format!("{}{}/{}", req.folder, dir, filename);
            match store.get_asset(&key).await {
                Ok(blob) => return Ok(render(blob.bytes, blob.content_type.unwrap_or_else(|| content_type_for_path(&key).to_string()), macro_ctx)),
                Err(BlobError::NotFound(_)) => {}
                Err(e) => return Err(DispatchError::BlobMiss(e.to_string())),
            }
        }
    }

    if let (Some(user_id), Some(drive_name)) = (req.user_id, req.drive_name) {
        match store.get_drive_file(user_id, drive_name, req.path).await {
            Ok(blob) => {
                return Ok(render(
                    blob.bytes,
                    blob.content_type.unwrap_or_else(|| content_type_for_path(req.path).to_string()),
                    macro_ctx,
                ))
            }
            Err(BlobError::NotFound(_)) => {}
            Err(e) => return Err(DispatchError::BlobMiss(e.to_string())),
        }
    }

    Err(DispatchError::BlobMiss(format!("{}{}", req.folder, req.path)))
}

/// §4.9 step 3: the generic asset-directory fallback table, tried after the
/// indexed and verbatim paths both miss. Extension-mapped directories come
/// first (most specific), then the common flat dumping grounds.
const FLAT_DIR_FALLBACKS: &[&str] = &["assets", "static", "files", "_files"];

fn fallback_dirs(path: &str) -> Vec<&'static str> {
    let mut dirs = Vec::with_capacity(FLAT_DIR_FALLBACKS.len() + 1);
    if let Some(ext) = crate::context::extension_of(path) {
        if let Some(dir) = ext_fallback_dir(&ext.to_ascii_lowercase()) {
            dirs.push(dir);
        }
    }
    dirs.extend_from_slice(FLAT_DIR_FALLBACKS);
    dirs
}

fn ext_fallback_dir(ext: &str) -> Option<&'static str> {
    match ext {
        "css" => Some("styles"),
        "js" | "mjs" => Some("scripts"),
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" => Some("images"),
        _ => None,
    }
}

fn indexed_path(path: &str) -> Option<String> {
    if path.ends_with('/') {
        Some(format!("{path}index.html"))
    } else if path.is_empty() {
        Some("/index.html".to_string())
    } else {
        None
    }
}

/// HTML/CSS responses get macro-expanded before leaving the process (§4.7,
/// §4.9); everything else is served byte-for-byte.
fn render(bytes: Vec<u8>, content_type: String, macro_ctx: &MacroContext) -> HostedResponse {
    if content_type.starts_with("text/html") {
        let text = String::from_utf8_lossy(&bytes);
        let expanded = expand(&text, macro_ctx, ExpandMode::Raw);
        HostedResponse { body: expanded.into_bytes(), content_type }
    } else if content_type.starts_with("text/css") {
        let text = String::from_utf8_lossy(&bytes);
        let css_expanded = expand(&text, macro_ctx, ExpandMode::Raw);
        let rewritten = rewrite_css_urls(&css_expanded, |_| None);
        HostedResponse { body: rewritten.into_bytes(), content_type }
    } else {
        HostedResponse { body: bytes, content_type }
    }
}
