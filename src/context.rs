use std::collections::HashMap;

/// Parsed User-Agent / Client-Hints information (§3 `RequestContext.ua`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UaInfo {
    pub browser: Option<String>,
    pub version: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub device: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub arch: Option<String>,
    pub raw: String,
}

/// Geo metadata supplied by the TLS-terminating collaborator (§3 `.geo`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub region_code: Option<String>,
    pub city: Option<String>,
    pub continent: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub tz: Option<String>,
    pub postal: Option<String>,
}

/// Transport-layer metadata from the TLS terminator (§3 `.cf`, §6 "Required
/// transport metadata").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CfMeta {
    pub asn: Option<u32>,
    pub as_org: Option<String>,
    pub colo: Option<String>,
    pub trust_score: Option<f64>,
    pub bot_score: Option<f64>,
    pub verified_bot: bool,
    pub http_proto: Option<String>,
    pub tls_version: Option<String>,
    pub tls_cipher: Option<String>,
}

/// The per-request immutable record every downstream component reads from.
/// Built once by the enricher (C1) and never mutated afterward; invariant
/// per spec §3: `session_id` is a pure function of stable request features.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub host: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub ip: String,
    pub org: Option<String>,
    pub referrer: Option<String>,
    pub is_embed: bool,
    pub session_id: String,
    pub impression_id: Option<String>,
    pub ua: UaInfo,
    pub geo: GeoInfo,
    pub cf: CfMeta,
}

impl RequestContext {
    /// Host + path in the canonical `{host}{path}` key form used throughout
    /// §4.3's resolver.
    pub fn host_path(&self) -> String {
        format!("{}{}", self.host, self.path)
    }

    /// OR of every bot signal named in §4.1: UA-based detection, low bot
    /// score, high trust score (an inverted signal in this source data —
    /// see enrich::is_bot_ua for the UA heuristic), or a verified-bot flag.
    pub fn is_bot(&self) -> bool {
        crate::enrich::is_bot_ua(&self.ua.raw)
            || self.cf.verified_bot
            || self.cf.bot_score.map(|s| s < 30.0).unwrap_or(false)
            || self.cf.trust_score.map(|s| s > 50.0).unwrap_or(false)
    }

    /// §4.12 "Redirect latency policy": whether the UA/Client-Hints signals
    /// already captured are detailed enough that a plain 302 doesn't need a
    /// client-side round trip to fill in screen/DPR/GPU/timezone. Desktop is
    /// sufficient unless its OS version falls in the known-stale set (UAs
    /// that never report a real one); mobile is sufficient only when an OS
    /// version is present and the device isn't Safari on iOS (which also
    /// never reports one).
    pub fn signals_sufficient(&self) -> bool {
        const STALE_OS_VERSIONS: &[&str] = &["10.15.7", "10.0"];
        let is_mobile = self.ua.device.as_deref().unwrap_or("").eq_ignore_ascii_case("mobile");
        if is_mobile {
            let has_os_version = self.ua.os_version.is_some();
            let is_safari_ios = self.ua.os.as_deref().unwrap_or("").eq_ignore_ascii_case("ios")
                && self.ua.browser.as_deref().unwrap_or("").eq_ignore_ascii_case("safari");
            has_os_version && !is_safari_ios
        } else {
            match self.ua.os_version.as_deref() {
                Some(v) => !STALE_OS_VERSIONS.contains(&v),
                None => false,
            }
        }
    }

    /// §4.5 "page-like" vs "asset" classification, used both by the matcher
    /// (params only applies on page-like requests) and by the hosted server
    /// (index.html append rule).
    pub fn is_page_like(&self) -> bool {
        is_page_like_path(&self.path)
    }
}

const ASSET_EXTENSIONS: &[&str] = &[
    "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "woff", "woff2", "ttf",
    "eot", "map", "json", "xml", "txt", "mp4", "webm", "mp3", "wasm", "pdf",
];

/// A path is "page-like" if it is `/`, ends with `/`, ends with `.html`/
/// `.htm`, or has no extension at all or an extension outside the known
/// asset set (§4.5).
pub fn is_page_like_path(path: &str) -> bool {
    if path == "/" || path.ends_with('/') {
        return true;
    }
    match extension_of(path) {
        None => true,
        Some(ext) => {
            let ext = ext.to_ascii_lowercase();
            ext == "html" || ext == "htm" || !ASSET_EXTENSIONS.contains(&ext.as_str())
        }
    }
}

pub fn extension_of(path: &str) -> Option<&str> {
    let last_segment = path.rsplit('/').next().unwrap_or(path);
    last_segment.rsplit_once('.').map(|(_, ext)| ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_page_like() {
        assert!(is_page_like_path("/"));
    }

    #[test]
    fn trailing_slash_is_page_like() {
        assert!(is_page_like_path("/products/"));
    }

    #[test]
    fn html_extension_is_page_like() {
        assert!(is_page_like_path("/index.html"));
    }

    #[test]
    fn no_extension_is_page_like() {
        assert!(is_page_like_path("/products/item"));
    }

    #[test]
    fn known_asset_extension_is_not_page_like() {
        assert!(!is_page_like_path("/static/app.js"));
        assert!(!is_page_like_path("/img/logo.png"));
    }

    #[test]
    fn unknown_extension_is_page_like() {
        assert!(is_page_like_path("/weird.xyz"));
    }

    fn ctx_with(device: Option<&str>, os: Option<&str>, os_version: Option<&str>, browser: Option<&str>) -> RequestContext {
        RequestContext {
            host: "example.com".into(),
            path: "/".into(),
            query: HashMap::new(),
            headers: HashMap::new(),
            ip: "1.2.3.4".into(),
            org: None,
            referrer: None,
            is_embed: false,
            session_id: "s".into(),
            impression_id: None,
            ua: UaInfo {
                device: device.map(str::to_string),
                os: os.map(str::to_string),
                os_version: os_version.map(str::to_string),
                browser: browser.map(str::to_string),
                ..Default::default()
            },
            geo: GeoInfo::default(),
            cf: CfMeta::default(),
        }
    }

    #[test]
    fn ua_bot_token_trips_is_bot_even_with_clean_transport_scores() {
        let mut ctx = ctx_with(None, None, None, None);
        ctx.ua.raw = "Mozilla/5.0 (compatible; Googlebot/2.1)".into();
        assert!(ctx.is_bot());
    }

    #[test]
    fn desktop_with_known_os_version_is_sufficient() {
        let ctx = ctx_with(Some("pc"), Some("Windows"), Some("11"), Some("Chrome"));
        assert!(ctx.signals_sufficient());
    }

    #[test]
    fn desktop_with_stale_os_version_is_insufficient() {
        let ctx = ctx_with(Some("pc"), Some("Mac OSX"), Some("10.15.7"), Some("Safari"));
        assert!(!ctx.signals_sufficient());
    }

    #[test]
    fn mobile_safari_ios_is_insufficient() {
        let ctx = ctx_with(Some("mobile"), Some("iOS"), Some("17.0"), Some("Safari"));
        assert!(!ctx.signals_sufficient());
    }

    #[test]
    fn mobile_with_os_version_non_safari_is_sufficient() {
        let ctx = ctx_with(Some("mobile"), Some("Android"), Some("14"), Some("Chrome"));
        assert!(ctx.signals_sufficient());
    }

    #[test]
    fn mobile_without_os_version_is_insufficient() {
        let ctx = ctx_with(Some("mobile"), Some("Android"), None, Some("Chrome"));
        assert!(!ctx.signals_sufficient());
    }
}
