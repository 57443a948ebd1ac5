use crate::kv::KvStore;
use crate::rules::RuleBundle;
use crate::selector::{weighted_pick, Weighted};
use rand::RngCore;

/// Build the ordered list of KV keys to probe for `host`/`path`, per §4.3's
/// longest-matching-prefix walk. Candidates are listed from most to least
/// specific; the resolver returns on the first hit.
pub fn candidate_keys(host: &str, path: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut current = path.to_string();

    loop {
        candidates.push(format!("{host}{current}"));

        if current != "/" {
            if let Some(stripped) = current.strip_suffix('/') {
                candidates.push(format!("{host}{stripped}"));
            } else {
                candidates.push(format!("{host}{current}/"));
            }
        }

        if current == "/" {
            break;
        }
        current = strip_last_segment(&current);
    }

    // Special root fallback (§4.3 step 4): only when the ORIGINAL request
    // path is exactly "/", also try the bare host key.
    if path == "/" {
        candidates.push(host.to_string());
    }

    candidates
}

/// Strip the final path segment, returning the parent. `/a/b/c` -> `/a/b`,
/// `/a` -> `/`, `/` -> `/`.
fn strip_last_segment(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => "/".to_string(),
    }
}

/// Walk `candidate_keys` against the KV store and decode the first hit.
/// A full miss is not an error (§7 "KV miss ... treated as 'no rule'").
pub async fn resolve_bundle(
    kv: &dyn KvStore,
    host: &str,
    path: &str,
) -> Result<Option<RuleBundle>, crate::error::DispatchError> {
    for key in candidate_keys(host, path) {
        if let Some(raw) = kv.get(&key).await? {
            let bundle: RuleBundle = serde_json::from_str(&raw)
                .map_err(|e| crate::error::DispatchError::Kv(format!("malformed bundle at {key}: {e}")))?;
            return Ok(Some(bundle));
        }
    }
    Ok(None)
}

/// Resolved default destination for a bundle, after collapsing
/// `defaultDestinations` / `defaultOffers` arrays to a single winner and
/// resolving a bare `destinationId` via the destination cache (§4.3).
#[derive(Debug, Clone)]
pub struct ResolvedDefault {
    pub folder: String,
    pub mode: crate::rules::FolderMode,
}

/// Collapse a bundle's default destination arrays to one winner by weighted
/// sampling, falling back to a bare `defaultFolder`/`defaultFolderMode`, and
/// finally to resolving `destinationId` through the destination cache.
pub async fn resolve_default(
    bundle: &RuleBundle,
    destcache: &crate::destcache::DestinationCache,
    db: &crate::db::ControlDb,
    rng: &mut dyn RngCore,
) -> Option<ResolvedDefault> {
    if let Some(offers) = bundle
        .default_destinations
        .as_ref()
        .filter(|v| !v.is_empty())
        .or(bundle.default_offers.as_ref().filter(|v| !v.is_empty()))
    {
        let weighted: Vec<Weighted<&crate::rules::WeightedLP>> = offers
            .iter()
            .map(|o| Weighted {
                weight: o.weight.max(0) as u64,
                item: o,
            })
            .collect();
        if let Some(chosen) = weighted_pick(&weighted, rng) {
            let mode = chosen.mode.unwrap_or(crate::rules::FolderMode::Hosted);
            let folder = if let Some(url) = &chosen.url {
                url.clone()
            } else if let Some(id) = &chosen.id {
                destcache.resolve(db, id).await?
            } else {
                return None;
            };
            return Some(ResolvedDefault { folder, mode });
        }
    }

    if let Some(folder) = &bundle.default_folder {
        let mode = bundle.default_folder_mode.unwrap_or(crate::rules::FolderMode::Hosted);
        return Some(ResolvedDefault {
            folder: folder.clone(),
            mode,
        });
    }

    if let Some(id) = &bundle.destination_id {
        let url = destcache.resolve(db, id).await?;
        return Some(ResolvedDefault {
            folder: url,
            mode: crate::rules::FolderMode::Redirect,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deepest_prefix_tried_before_shallower() {
        let keys = candidate_keys("host", "/products/item/sub");
        let idx_deep = keys.iter().position(|k| k == "host/products/item").unwrap();
        let idx_shallow = keys.iter().position(|k| k == "host/products").unwrap();
        assert!(idx_deep < idx_shallow, "expected /products/item before /products: {keys:?}");
    }

    #[test]
    fn bare_host_only_tried_for_root_path() {
        let keys_root = candidate_keys("host", "/");
        assert!(keys_root.contains(&"host".to_string()));

        let keys_nonroot = candidate_keys("host", "/products/item/sub");
        assert!(!keys_nonroot.contains(&"host".to_string()));
    }

    #[test]
    fn trailing_slash_variants_are_both_tried() {
        let keys = candidate_keys("host", "/products/");
        assert!(keys.contains(&"host/products/".to_string()));
        assert!(keys.contains(&"host/products".to_string()));
    }

    #[test]
    fn root_with_and_without_slash_resolve_same_bundle() {
        // Both "/" requests and any request whose stripped form lands on "/"
        // eventually probe the bare "host/" key, which is what lets a rule
        // stored at `host/` answer for either spelling.
        let keys = candidate_keys("host", "/");
        assert_eq!(keys.last().unwrap(), "host");
        assert!(keys.contains(&"host/".to_string()));
    }
}
