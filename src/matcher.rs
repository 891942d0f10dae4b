//! Linked-wearables matcher.
//!
//! Pure predicate deciding whether an item's on-chain mapping rules are
//! satisfied by any token the address owns. Used both for bulk filtering of
//! collection entities and for single-URN checks (one-element ownership
//! list).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Ownership rules embedded in an item entity's metadata:
/// network -> contract address -> rules over token ids
pub type Mappings = HashMap<String, HashMap<String, Vec<MappingRule>>>;

/// A single rule over the token ids of one contract
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MappingRule {
    /// Any token of the contract backs the item
    Any,
    /// Exactly one token id
    Single { id: String },
    /// An explicit set of token ids
    Multiple { ids: Vec<String> },
    /// An inclusive decimal range of token ids
    Range { from: String, to: String },
}

/// A token the address owns, in `network:contract:tokenId` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedToken {
    pub network: String,
    pub contract: String,
    pub token_id: String,
}

impl OwnedToken {
    /// Parse `network:contract:tokenId`. Network and contract are
    /// case-folded; the token id is kept verbatim.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().splitn(3, ':');
        let network = parts.next()?.to_lowercase();
        let contract = parts.next()?.to_lowercase();
        let token_id = parts.next()?.to_string();
        if network.is_empty() || contract.is_empty() || token_id.is_empty() {
            return None;
        }
        Some(Self { network, contract, token_id })
    }
}

/// True iff any owned token satisfies any of the item's mapping rules
pub fn mappings_match_any(mappings: &Mappings, owned: &[OwnedToken]) -> bool {
    owned.iter().any(|token| {
        mappings
            .iter()
            .filter(|(network, _)| network.eq_ignore_ascii_case(&token.network))
            .flat_map(|(_, contracts)| contracts.iter())
            .filter(|(contract, _)| contract.eq_ignore_ascii_case(&token.contract))
            .flat_map(|(_, rules)| rules.iter())
            .any(|rule| rule_matches(rule, &token.token_id))
    })
}

fn rule_matches(rule: &MappingRule, token_id: &str) -> bool {
    match rule {
        MappingRule::Any => true,
        MappingRule::Single { id } => decimal_cmp(id, token_id) == Ordering::Equal,
        MappingRule::Multiple { ids } => {
            ids.iter().any(|id| decimal_cmp(id, token_id) == Ordering::Equal)
        }
        MappingRule::Range { from, to } => {
            decimal_cmp(from, token_id) != Ordering::Greater
                && decimal_cmp(to, token_id) != Ordering::Less
        }
    }
}

/// Compare two token ids as arbitrary-precision decimal strings.
/// Token ids can exceed u128, so no integer parse.
fn decimal_cmp(a: &str, b: &str) -> Ordering {
    let a = a.trim().trim_start_matches('0');
    let b = b.trim().trim_start_matches('0');
    match a.len().cmp(&b.len()) {
        Ordering::Equal => a.cmp(b),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings_with(rule: MappingRule) -> Mappings {
        let mut contracts = HashMap::new();
        contracts.insert("0xabc".to_string(), vec![rule]);
        let mut mappings = HashMap::new();
        mappings.insert("ethereum".to_string(), contracts);
        mappings
    }

    fn owned(value: &str) -> Vec<OwnedToken> {
        vec![OwnedToken::parse(value).unwrap()]
    }

    #[test]
    fn range_rule_bounds_are_inclusive() {
        let mappings = mappings_with(MappingRule::Range {
            from: "1".to_string(),
            to: "10".to_string(),
        });
        assert!(mappings_match_any(&mappings, &owned("ethereum:0xabc:5")));
        assert!(mappings_match_any(&mappings, &owned("ethereum:0xabc:1")));
        assert!(mappings_match_any(&mappings, &owned("ethereum:0xabc:10")));
        assert!(!mappings_match_any(&mappings, &owned("ethereum:0xabc:11")));
    }

    #[test]
    fn network_and_contract_must_match() {
        let mappings = mappings_with(MappingRule::Any);
        assert!(mappings_match_any(&mappings, &owned("ethereum:0xabc:1")));
        assert!(!mappings_match_any(&mappings, &owned("matic:0xabc:1")));
        assert!(!mappings_match_any(&mappings, &owned("ethereum:0xdef:1")));
    }

    #[test]
    fn comparison_is_case_insensitive() {
        let mappings = mappings_with(MappingRule::Any);
        assert!(mappings_match_any(&mappings, &owned("Ethereum:0xABC:7")));
    }

    #[test]
    fn single_and_multiple_rules() {
        let single = mappings_with(MappingRule::Single { id: "7".to_string() });
        assert!(mappings_match_any(&single, &owned("ethereum:0xabc:7")));
        assert!(!mappings_match_any(&single, &owned("ethereum:0xabc:8")));

        let multiple = mappings_with(MappingRule::Multiple {
            ids: vec!["3".to_string(), "9".to_string()],
        });
        assert!(mappings_match_any(&multiple, &owned("ethereum:0xabc:9")));
        assert!(!mappings_match_any(&multiple, &owned("ethereum:0xabc:4")));
    }

    #[test]
    fn token_ids_compare_as_big_decimals() {
        let mappings = mappings_with(MappingRule::Range {
            from: "340282366920938463463374607431768211456".to_string(),
            to: "340282366920938463463374607431768211460".to_string(),
        });
        // One above u128::MAX
        assert!(mappings_match_any(
            &mappings,
            &owned("ethereum:0xabc:340282366920938463463374607431768211457")
        ));
        assert!(!mappings_match_any(&mappings, &owned("ethereum:0xabc:9")));
    }

    #[test]
    fn leading_zeros_are_ignored() {
        let mappings = mappings_with(MappingRule::Single { id: "007".to_string() });
        assert!(mappings_match_any(&mappings, &owned("ethereum:0xabc:7")));
    }

    #[test]
    fn no_owned_tokens_never_matches() {
        let mappings = mappings_with(MappingRule::Any);
        assert!(!mappings_match_any(&mappings, &[]));
    }

    #[test]
    fn rule_deserializes_from_wire_form() {
        let rule: MappingRule =
            serde_json::from_str(r#"{"type":"range","from":"1","to":"10"}"#).unwrap();
        assert_eq!(
            rule,
            MappingRule::Range { from: "1".to_string(), to: "10".to_string() }
        );
    }
}
