//! URN parsing and normalization helpers.
//!
//! Every item, collection and registry entry is identified by a URN of the
//! form `urn:{namespace}:{network}:{kind}:...`. All lookups in the crate are
//! case-insensitive, so normalization always case-folds. The legacy
//! `dcl://` alias scheme is resolved to canonical URN form here and nowhere
//! else.

const LEGACY_SCHEME: &str = "dcl://";
const BASE_CATALOG_COLLECTION: &str = "base-avatars";
const OFF_CHAIN_NETWORK: &str = "off-chain";
const THIRD_PARTY_KIND: &str = "collections-thirdparty";

/// A URN decomposed into its leading segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrn {
    pub namespace: String,
    pub network: String,
    pub kind: String,
    /// Segments after the kind (collection, item, token id)
    pub rest: Vec<String>,
}

/// Parse a case-folded URN into its segments. Returns `None` for anything
/// that is not a `urn:` identifier with at least a namespace, network and kind.
pub fn parse(value: &str) -> Option<ParsedUrn> {
    let lower = value.trim().to_lowercase();
    let mut parts = lower.split(':');
    if parts.next()? != "urn" {
        return None;
    }
    let namespace = parts.next()?.to_string();
    let network = parts.next()?.to_string();
    let kind = parts.next()?.to_string();
    Some(ParsedUrn {
        namespace,
        network,
        kind,
        rest: parts.map(str::to_string).collect(),
    })
}

/// Normalize an identifier to canonical lowercase URN form, resolving the
/// legacy `dcl://` alias scheme. Values that are neither URNs nor aliases
/// (e.g. bare emote slot ids) are only case-folded.
pub fn normalize(value: &str) -> String {
    let lower = value.trim().to_lowercase();
    if let Some(rest) = lower.strip_prefix(LEGACY_SCHEME) {
        if let Some((collection, item)) = rest.split_once('/') {
            if collection == BASE_CATALOG_COLLECTION {
                return format!("urn:decentraland:off-chain:base-avatars:{item}");
            }
            return format!("urn:decentraland:ethereum:collections-v1:{collection}:{item}");
        }
    }
    lower
}

/// True for items in the trusted base catalog (off-chain default wearables)
pub fn is_base_catalog(value: &str) -> bool {
    match parse(&normalize(value)) {
        Some(parsed) => {
            parsed.network == OFF_CHAIN_NETWORK
                && parsed.kind == BASE_CATALOG_COLLECTION
        }
        None => false,
    }
}

/// True when the identifier names an item in a third-party collection
pub fn is_third_party(value: &str) -> bool {
    matches!(parse(value), Some(parsed) if parsed.kind == THIRD_PARTY_KIND)
}

/// The third-party name embedded in a `collections-thirdparty` URN
pub fn third_party_name(value: &str) -> Option<String> {
    let parsed = parse(value)?;
    if parsed.kind != THIRD_PARTY_KIND {
        return None;
    }
    parsed.rest.first().cloned()
}

/// True when the identifier carries a network qualifier at all.
/// Bare emote slot ids (`wave`, `clap`) do not.
pub fn has_network(value: &str) -> bool {
    parse(value).is_some()
}

/// Split an optional trailing token id off an item URN.
///
/// A collection item URN canonically ends at the item id; one extra segment
/// is an explicit token identity appended under the token-identity policy.
pub fn split_token_id(value: &str) -> (String, Option<String>) {
    let lower = value.trim().to_lowercase();
    let Some(parsed) = parse(&lower) else {
        return (lower, None);
    };
    // Segments expected after the kind for a canonical item URN
    let canonical_rest = match parsed.kind.as_str() {
        "collections-v1" | "collections-v2" => 2,
        "collections-thirdparty" => 3,
        _ => return (lower, None),
    };
    if parsed.rest.len() == canonical_rest + 1 {
        let token = parsed.rest.last().cloned();
        let base = lower.rsplit_once(':').map(|(b, _)| b.to_string());
        if let (Some(base), Some(token)) = (base, token) {
            return (base, Some(token));
        }
    }
    (lower, None)
}
