use fnv::FnvHasher;
use std::hash::Hasher;
use uuid::Uuid;

/// Proxy/forwarding headers stripped from the header-order fingerprint
/// before it enters the session-id digest (§4.2).
const PROXY_HEADER_PREFIXES: &[&str] = &["cf-", "x-forwarded-for", "x-real-ip"];

/// Inputs to the session-id fingerprint, gathered by the enricher (C1) and
/// handed to `derive` unmodified. Field order here is NOT the digest order —
/// `derive` fixes that explicitly so the function stays stable regardless of
/// how this struct's fields get reordered over time.
#[derive(Debug, Clone, Default)]
pub struct FingerprintInput<'a> {
    pub ip: &'a str,
    pub tls_cipher: &'a str,
    pub http_protocol: &'a str,
    pub user_agent: &'a str,
    /// Raw header names in wire order, lowercased, NOT yet filtered.
    pub header_order: &'a [String],
    pub accept: &'a str,
    pub accept_language: &'a str,
    pub accept_encoding: &'a str,
    pub sec_ch_ua: &'a str,
    pub sec_ch_ua_platform: &'a str,
    pub sec_ch_ua_mobile: &'a str,
    pub connection: &'a str,
    pub upgrade_insecure_requests: &'a str,
}

/// First ~15 header names (lowercased, proxy headers removed), comma-joined —
/// the "header-order fingerprint" component of the session-id digest (§4.2).
pub fn header_order_fingerprint(header_order: &[String]) -> String {
    header_order
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .filter(|h| !PROXY_HEADER_PREFIXES.iter().any(|p| h.starts_with(p)))
        .take(15)
        .collect::<Vec<_>>()
        .join(",")
}

/// Derive the 8-character base36 session fingerprint. Deterministic and
/// stable across process restarts — it is a pure function of its input, with
/// no process-local salt or timestamp involved (§3 invariant, §8 invariant 1).
pub fn derive_session_id(input: &FingerprintInput) -> String {
    let order_fp = header_order_fingerprint(input.header_order);

    // Fixed pipe-joined order per §4.2 — this ordering is the contract, not
    // an implementation detail; changing it changes every existing session id.
    let joined = [
        input.ip,
        input.tls_cipher,
        input.http_protocol,
        input.user_agent,
        order_fp.as_str(),
        input.accept,
        input.accept_language,
        input.accept_encoding,
        input.sec_ch_ua,
        input.sec_ch_ua_platform,
        input.sec_ch_ua_mobile,
        input.connection,
        input.upgrade_insecure_requests,
    ]
    .join("|");

    let mut hasher = FnvHasher::default();
    hasher.write(joined.as_bytes());
    let digest = hasher.finish();

    to_base36_fixed(digest, 8)
}

/// Render `value` as lowercase base36, left-padded/truncated to exactly
/// `width` characters so the session id has a stable length.
fn to_base36_fixed(mut value: u64, width: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::with_capacity(width);
    if value == 0 {
        out.push(ALPHABET[0]);
    }
    while value > 0 {
        out.push(ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    let s = String::from_utf8(out).expect("base36 alphabet is ASCII");
    if s.len() >= width {
        s[s.len() - width..].to_string()
    } else {
        format!("{:0>width$}", s, width = width)
    }
}

/// Mint a fresh, time-ordered event id (§4.2: "UUIDv7 preferred").
pub fn new_event_id() -> String {
    Uuid::now_v7().to_string()
}
