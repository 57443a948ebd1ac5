use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A field that may be written in the KV JSON as either a scalar or a list.
/// Decodes into a list-of-one when scalar so matching code only ever deals
/// with lists (§9 "Field-or-list flags").
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct OneOrMany<T>(pub Vec<T>);

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OneOrMany<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            One(T),
            Many(Vec<T>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::One(v) => OneOrMany(vec![v]),
            Repr::Many(v) => OneOrMany(v),
        })
    }
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }
}

/// Fractional-UTC-hour half-open interval, §4.5 `time` predicate. Open
/// Question 1 (spec.md §9): whether `start > end` wraps past midnight. This
/// implementation takes the non-wrapping reading the spec calls out as the
/// current source's behavior — see DESIGN.md.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

/// One branch of a campaign's targeting table (§3 `FlagSet`). Every present
/// field must match for the set to match; a missing field is "don't care".
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlagSet {
    pub country: Option<OneOrMany<String>>,
    pub region: Option<OneOrMany<String>>,
    pub city: Option<OneOrMany<String>>,
    pub continent: Option<OneOrMany<String>>,
    pub asn: Option<OneOrMany<u32>>,
    pub colo: Option<OneOrMany<String>>,
    /// Exact / CIDR / `a-b` range / `*`-wildcard patterns (§4.5).
    pub ip: Option<OneOrMany<String>>,
    /// Case-insensitive glob with `*` against the AS-organization name.
    pub org: Option<OneOrMany<String>>,
    /// Primary subtag of `accept-language`.
    pub language: Option<OneOrMany<String>>,
    pub time: Option<TimeRange>,
    pub device: Option<OneOrMany<String>>,
    pub browser: Option<OneOrMany<String>>,
    /// Substring match, not equality (§4.5).
    pub os: Option<OneOrMany<String>>,
    pub brand: Option<OneOrMany<String>>,
    /// AND over entries; only evaluated on page-like requests (§4.5).
    pub params: Option<HashMap<String, OneOrMany<String>>>,
}

impl FlagSet {
    /// §4.5 asset-inheritance fallback: retry a match with `params` removed.
    pub fn without_params(&self) -> FlagSet {
        FlagSet {
            params: None,
            ..self.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.country.is_none()
            && self.region.is_none()
            && self.city.is_none()
            && self.continent.is_none()
            && self.asn.is_none()
            && self.colo.is_none()
            && self.ip.is_none()
            && self.org.is_none()
            && self.language.is_none()
            && self.time.is_none()
            && self.device.is_none()
            && self.browser.is_none()
            && self.os.is_none()
            && self.brand.is_none()
            && self.params.is_none()
    }
}

/// A destination referenced from a rule's `destinations` list (§3 `Rule`).
/// Either an inline URL or a destination id resolved via the destination
/// cache (C14).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedDest {
    pub id: Option<String>,
    pub url: Option<String>,
    #[serde(default = "default_dest_weight")]
    pub weight: i64,
}

/// A click-out destination referenced from a rule's `clickDestinations`.
pub type WeightedClickDest = WeightedDest;

/// Bundle-level default destination / offer collapsed to a single
/// `defaultFolder` + `defaultFolderMode` by weighted sampling (§4.3).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedLP {
    pub id: Option<String>,
    pub url: Option<String>,
    pub mode: Option<FolderMode>,
    #[serde(default = "default_dest_weight")]
    pub weight: i64,
}

pub type WeightedOffer = WeightedLP;

fn default_dest_weight() -> i64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderMode {
    Hosted,
    Proxy,
    Redirect,
}

/// One DOM edit applied by the modifications rewriter (C10).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Modification {
    pub selector: String,
    pub action: ModAction,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ModAction {
    SetText,
    SetHtml,
    SetCss,
    SetAttribute,
    Remove,
}

/// The `{name, value}` shape of a `setAttribute` modification's `value`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SetAttributeValue {
    pub name: String,
    pub value: String,
}

/// One targeting branch plus the single action it realizes when matched
/// (§3 `Rule`). Exactly one of the action fields is primary; `primary_action`
/// picks the first present in the documented precedence order.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Rule {
    pub flags: Option<FlagSet>,
    pub groups: Option<Vec<FlagSet>>,
    #[serde(default = "default_rule_weight")]
    pub weight: i64,
    pub variables: Option<HashMap<String, String>>,

    pub folder: Option<String>,
    pub proxy_url: Option<String>,
    pub redirect_url: Option<String>,
    pub modifications: Option<Vec<Modification>>,
    pub destinations: Option<Vec<WeightedDest>>,

    pub click_url: Option<String>,
    pub click_destinations: Option<Vec<WeightedClickDest>>,
}

impl Default for Rule {
    fn default() -> Self {
        Rule {
            flags: None,
            groups: None,
            weight: default_rule_weight(),
            variables: None,
            folder: None,
            proxy_url: None,
            redirect_url: None,
            modifications: None,
            destinations: None,
            click_url: None,
            click_destinations: None,
        }
    }
}

fn default_rule_weight() -> i64 {
    100
}

/// The polymorphic primary action a matched rule realizes (§9 "Polymorphic
/// action"). The executor is a single switch over this type.
#[derive(Debug, Clone)]
pub enum Action<'a> {
    Hosted(&'a str),
    Proxy(&'a str),
    Redirect(&'a str),
    Modifications(&'a [Modification]),
    Weighted(&'a [WeightedDest]),
}

impl Rule {
    /// §3 invariant: when `groups` is present and non-empty, `flags` is
    /// ignored.
    pub fn effective_condition_sets(&self) -> Vec<FlagSet> {
        match &self.groups {
            Some(groups) if !groups.is_empty() => groups.clone(),
            _ => vec![self.flags.clone().unwrap_or_default()],
        }
    }

    /// First present action in a fixed precedence order. Per §3, a
    /// well-formed rule carries exactly one; this order is what breaks the
    /// tie if more than one slipped into the KV JSON.
    pub fn primary_action(&self) -> Option<Action<'_>> {
        if let Some(f) = &self.folder {
            return Some(Action::Hosted(f));
        }
        if let Some(u) = &self.proxy_url {
            return Some(Action::Proxy(u));
        }
        if let Some(u) = &self.redirect_url {
            return Some(Action::Redirect(u));
        }
        if let Some(m) = &self.modifications {
            return Some(Action::Modifications(m));
        }
        if let Some(d) = &self.destinations {
            return Some(Action::Weighted(d));
        }
        None
    }

    /// Whether this rule is eligible as a click-out candidate (§4.11 step 1).
    pub fn has_click_action(&self) -> bool {
        self.click_url.is_some() || self.click_destinations.as_ref().is_some_and(|d| !d.is_empty())
    }
}

/// Deny-list evaluated before matching (C4). A match of any one field
/// short-circuits the request to the safe page.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockSet {
    pub ips: Vec<String>,
    /// Wildcard (`*`) glob over the AS-organization name.
    pub orgs: Vec<String>,
    /// Wildcard glob over the request host.
    pub hostnames: Vec<String>,
    /// Wildcard glob over the city name.
    pub cities: Vec<String>,
    /// Exact ISO country codes, case-insensitive.
    pub countries: Vec<String>,
    pub devices: Vec<String>,
    /// Wildcard glob over the browser name.
    pub browsers: Vec<String>,
    /// Wildcard glob over the OS name.
    pub oses: Vec<String>,
}

/// KV value keyed by `{host}{path}` (§3 `RuleBundle`). Decoded once into this
/// canonical in-memory form; unknown JSON fields are ignored for
/// forward-compatibility (§9 "Runtime reflection on bundles").
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleBundle {
    pub id: String,
    pub name: String,
    pub site_name: String,
    pub rules: Vec<Rule>,
    pub default_folder: Option<String>,
    pub destination_id: Option<String>,
    pub default_folder_mode: Option<FolderMode>,
    pub default_destinations: Option<Vec<WeightedLP>>,
    pub default_offers: Option<Vec<WeightedOffer>>,
    pub variables: Option<HashMap<String, String>>,
    pub blocks: Option<BlockSet>,
}

impl Default for RuleBundle {
    fn default() -> Self {
        RuleBundle {
            id: String::new(),
            name: String::new(),
            site_name: String::new(),
            rules: Vec::new(),
            default_folder: None,
            destination_id: None,
            default_folder_mode: None,
            default_destinations: None,
            default_offers: None,
            variables: None,
            blocks: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_flag_decodes_as_single_element_list() {
        let json = r#"{"country":"US"}"#;
        let flags: FlagSet = serde_json::from_str(json).unwrap();
        assert_eq!(flags.country.unwrap().0, vec!["US".to_string()]);
    }

    #[test]
    fn list_flag_decodes_as_is() {
        let json = r#"{"country":["US","CA"]}"#;
        let flags: FlagSet = serde_json::from_str(json).unwrap();
        assert_eq!(flags.country.unwrap().0, vec!["US".to_string(), "CA".to_string()]);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{"country":"US","somethingNew":{"nested":true}}"#;
        let flags: Result<FlagSet, _> = serde_json::from_str(json);
        assert!(flags.is_ok());
    }

    #[test]
    fn groups_override_flags_when_present() {
        let rule = Rule {
            flags: Some(FlagSet {
                country: Some(OneOrMany(vec!["US".into()])),
                ..Default::default()
            }),
            groups: Some(vec![FlagSet {
                country: Some(OneOrMany(vec!["CA".into()])),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let sets = rule.effective_condition_sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].country.as_ref().unwrap().0, vec!["CA".to_string()]);
    }

    #[test]
    fn primary_action_precedence_picks_folder_first() {
        let rule = Rule {
            folder: Some("a/".into()),
            redirect_url: Some("https://x.example".into()),
            ..Default::default()
        };
        matches!(rule.primary_action(), Some(Action::Hosted("a/")));
    }
}
