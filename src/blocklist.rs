use crate::context::RequestContext;
use crate::matcher::{glob_match, ip_matches};
use crate::rules::BlockSet;

/// §4.4: evaluated before matching. A match of any one field short-circuits
/// the request to the safe page. Detected bots are routed here too by the
/// caller (see `dispatch::should_block`).
pub fn is_blocked(blocks: &BlockSet, ctx: &RequestContext) -> bool {
    blocks.ips.iter().any(|p| ip_matches(p, &ctx.ip))
        || blocks
            .orgs
            .iter()
            .any(|p| ctx.org.as_deref().map(|o| glob_match(p, o)).unwrap_or(false))
        || blocks.hostnames.iter().any(|p| glob_match(p, &ctx.host))
        || blocks
            .cities
            .iter()
            .any(|p| ctx.geo.city.as_deref().map(|c| glob_match(p, c)).unwrap_or(false))
        || blocks.countries.iter().any(|p| {
            ctx.geo
                .country
                .as_deref()
                .map(|c| c.eq_ignore_ascii_case(p))
                .unwrap_or(false)
        })
        || blocks
            .devices
            .iter()
            .any(|p| ctx.ua.device.as_deref().map(|d| d.eq_ignore_ascii_case(p)).unwrap_or(false))
        || blocks
            .browsers
            .iter()
            .any(|p| ctx.ua.browser.as_deref().map(|b| glob_match(p, b)).unwrap_or(false))
        || blocks
            .oses
            .iter()
            .any(|p| ctx.ua.os.as_deref().map(|o| glob_match(p, o)).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CfMeta, GeoInfo, UaInfo};
    use std::collections::HashMap;

    fn ctx() -> RequestContext {
        RequestContext {
            host: "example.com".into(),
            path: "/".into(),
            query: HashMap::new(),
            headers: HashMap::new(),
            ip: "9.9.9.9".into(),
            org: Some("BadCo Hosting".into()),
            referrer: None,
            is_embed: false,
            session_id: "s".into(),
            impression_id: None,
            ua: UaInfo::default(),
            geo: GeoInfo {
                country: Some("RU".into()),
                ..Default::default()
            },
            cf: CfMeta::default(),
        }
    }

    #[test]
    fn country_block_is_exact_case_insensitive() {
        let blocks = BlockSet {
            countries: vec!["ru".into()],
            ..Default::default()
        };
        assert!(is_blocked(&blocks, &ctx()));
    }

    #[test]
    fn org_block_is_wildcard() {
        let blocks = BlockSet {
            orgs: vec!["*hosting*".into()],
            ..Default::default()
        };
        assert!(is_blocked(&blocks, &ctx()));
    }

    #[test]
    fn no_match_is_not_blocked() {
        let blocks = BlockSet {
            countries: vec!["FR".into()],
            ..Default::default()
        };
        assert!(!is_blocked(&blocks, &ctx()));
    }
}
