//! Profile reconciliation.
//!
//! Merges a profile entity's declared avatar claims with ownership facts
//! from the database and from third-party verification, producing the
//! servable profile per address:
//!
//! - base-catalog wearables are trusted unconditionally
//! - everything else must be backed by an ownership record
//! - `has_claimed_name` is recomputed strictly from owned names
//! - snapshot references are rewritten to absolute content URLs
//! - synthetic identities (the reserved default namespace) bypass all
//!   ownership verification
//!
//! Failure handling is all-or-nothing: any error while building a batch
//! collapses the whole call to an empty result, never a partial one.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error};

use crate::content::{EmoteSlot, Entity, ProfileAvatar};
use crate::entities::EntitiesFetcher;
use crate::ownership::{OwnedItem, OwnershipStore, ThirdPartyItemChecker};
use crate::types::Result;
use crate::urn;

// ============================================================================
// Identity
// ============================================================================

/// Reserved namespace for non-wallet-backed placeholder profiles
const SYNTHETIC_PREFIX: &str = "default";

/// An address classified once at ingestion, so the synthetic-profile
/// convention is decided in one place instead of re-checked as a string
/// prefix throughout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressIdentity {
    /// A wallet address whose claims must be verified
    Real(String),
    /// A synthetic/default identity whose declared claims are trusted as-is
    Synthetic(String),
}

impl AddressIdentity {
    pub fn classify(address: &str) -> Self {
        let lower = address.trim().to_lowercase();
        if lower.starts_with(SYNTHETIC_PREFIX) {
            Self::Synthetic(lower)
        } else {
            Self::Real(lower)
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Self::Real(address) | Self::Synthetic(address) => address,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Synthetic(_))
    }
}

// ============================================================================
// Configuration and Output
// ============================================================================

/// Configuration for profile reconciliation
#[derive(Debug, Clone)]
pub struct ProfilesConfig {
    /// Token-identity policy: append the resolved token id to a kept
    /// wearable's URN when the ownership record resolves one
    pub ensure_erc721: bool,
    /// Base URL under which snapshot references are rewritten
    pub content_base_url: String,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            ensure_erc721: true,
            content_base_url: String::new(),
        }
    }
}

impl ProfilesConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("ENSURE_ERC721") {
            if let Ok(flag) = val.parse::<bool>() {
                config.ensure_erc721 = flag;
            }
        }
        if let Ok(val) = std::env::var("CONTENT_BASE_URL") {
            config.content_base_url = val;
        }
        config
    }
}

/// The reconciled profile served for one address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDocument {
    /// Entity timestamp, epoch milliseconds
    pub timestamp: u64,
    pub avatars: Vec<ProfileAvatar>,
}

/// Result of a batch reconciliation
#[derive(Debug)]
pub enum ProfilesOutcome {
    /// Every candidate entity was at or before the caller's threshold;
    /// distinct from an empty profile list
    NotModified,
    /// Reconciled profiles, one per address that resolved to an entity
    Profiles(Vec<ProfileDocument>),
}

// ============================================================================
// Reconciler
// ============================================================================

/// Builds servable profiles by reconciling declared claims against
/// ownership facts
pub struct ProfilesReconciler {
    config: ProfilesConfig,
    fetcher: Arc<EntitiesFetcher>,
    ownership: Arc<dyn OwnershipStore>,
    third_party: Arc<dyn ThirdPartyItemChecker>,
}

impl ProfilesReconciler {
    pub fn new(
        config: ProfilesConfig,
        fetcher: Arc<EntitiesFetcher>,
        ownership: Arc<dyn OwnershipStore>,
        third_party: Arc<dyn ThirdPartyItemChecker>,
    ) -> Self {
        Self { config, fetcher, ownership, third_party }
    }

    /// Reconcile a batch of addresses. Addresses with no resolvable entity
    /// are absent from the output. On any internal failure the whole batch
    /// collapses to an empty profile list (logged), favoring availability
    /// over precise error signaling.
    pub async fn get_profiles(
        &self,
        addresses: &[String],
        if_modified_since: Option<u64>,
    ) -> ProfilesOutcome {
        match self.build_profiles(addresses, if_modified_since).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    addresses = addresses.len(),
                    error = %e,
                    "Profile reconciliation failed, collapsing batch to empty result"
                );
                ProfilesOutcome::Profiles(Vec::new())
            }
        }
    }

    async fn build_profiles(
        &self,
        addresses: &[String],
        if_modified_since: Option<u64>,
    ) -> Result<ProfilesOutcome> {
        let identities: Vec<AddressIdentity> =
            addresses.iter().map(|a| AddressIdentity::classify(a)).collect();
        let pointers: Vec<String> =
            identities.iter().map(|i| i.address().to_string()).collect();

        let entities = self.fetcher.fetch_entities(&pointers).await?;
        let found: Vec<(&AddressIdentity, Entity)> = identities
            .iter()
            .zip(entities)
            .filter_map(|(identity, entity)| entity.map(|e| (identity, e)))
            .collect();

        if found.is_empty() {
            return Ok(ProfilesOutcome::Profiles(Vec::new()));
        }

        if let Some(threshold) = if_modified_since {
            // NotModified is decided for the batch as a whole: only when
            // EVERY entity is at or before the threshold does the call skip
            // recomputation. A caller polling several addresses with one
            // threshold therefore gets NotModified only if none changed,
            // but also cannot learn WHICH address changed from this signal.
            let all_stale = found
                .iter()
                .all(|(_, entity)| to_seconds(entity.timestamp) <= to_seconds(threshold));
            if all_stale {
                debug!(addresses = found.len(), "No profile changed since threshold");
                return Ok(ProfilesOutcome::NotModified);
            }
        }

        let results =
            join_all(found.iter().map(|(identity, entity)| self.reconcile_address(identity, entity)))
                .await;

        let mut profiles = Vec::with_capacity(results.len());
        for result in results {
            profiles.push(result?);
        }
        Ok(ProfilesOutcome::Profiles(profiles))
    }

    async fn reconcile_address(
        &self,
        identity: &AddressIdentity,
        entity: &Entity,
    ) -> Result<ProfileDocument> {
        if identity.is_synthetic() {
            debug!(address = identity.address(), "Synthetic identity, serving declared claims");
            let avatars = entity
                .metadata
                .avatars
                .iter()
                .map(|avatar| self.with_snapshots(avatar.clone(), entity))
                .collect();
            return Ok(ProfileDocument { timestamp: entity.timestamp, avatars });
        }

        let address = identity.address();

        // Third-party URNs across all declared avatars, registered for
        // batched verification
        let third_party_urns: Vec<String> = entity
            .metadata
            .avatars
            .iter()
            .flat_map(|avatar| avatar.avatar.wearables.iter())
            .map(|declared| urn::normalize(declared))
            .filter(|normalized| urn::is_third_party(normalized))
            .collect();

        let (wearables, emotes, names, third_party_owned) = tokio::try_join!(
            self.ownership.owned_wearables(address),
            self.ownership.owned_emotes(address),
            self.ownership.owned_names(address),
            self.third_party.owned_third_party_items(address, &third_party_urns),
        )?;

        let owned_wearables = index_owned(&wearables);
        let owned_emotes = index_owned(&emotes);

        let avatars = entity
            .metadata
            .avatars
            .iter()
            .map(|declared| {
                let mut avatar = declared.clone();
                avatar.avatar.wearables = declared
                    .avatar
                    .wearables
                    .iter()
                    .filter_map(|w| self.resolve_item(w, &owned_wearables, &third_party_owned))
                    .collect();
                avatar.avatar.emotes = declared
                    .avatar
                    .emotes
                    .iter()
                    .filter_map(|e| self.resolve_emote(e, &owned_emotes, &third_party_owned))
                    .collect();
                // Recomputed strictly from owned names, never from the
                // stored declaration
                avatar.has_claimed_name = names.iter().any(|name| name == &declared.name);
                self.with_snapshots(avatar, entity)
            })
            .collect();

        Ok(ProfileDocument { timestamp: entity.timestamp, avatars })
    }

    /// Decide whether a declared item survives reconciliation, and under
    /// which URN
    fn resolve_item(
        &self,
        declared: &str,
        owned: &HashMap<String, Option<String>>,
        third_party_owned: &HashSet<String>,
    ) -> Option<String> {
        let normalized = urn::normalize(declared);
        if urn::is_base_catalog(&normalized) {
            return Some(normalized);
        }

        let (base, declared_token) = urn::split_token_id(&normalized);

        if urn::is_third_party(&normalized) {
            if third_party_owned.contains(&base) || third_party_owned.contains(&normalized) {
                return Some(normalized);
            }
            return None;
        }

        let record = owned.get(&base)?;
        // A declared URN that already encodes a token identity is kept
        // verbatim; the ownership record only needs to match the base
        if declared_token.is_some() {
            return Some(normalized);
        }
        if self.config.ensure_erc721 {
            if let Some(token_id) = record {
                return Some(format!("{base}:{token_id}"));
            }
        }
        Some(base)
    }

    fn resolve_emote(
        &self,
        declared: &EmoteSlot,
        owned: &HashMap<String, Option<String>>,
        third_party_owned: &HashSet<String>,
    ) -> Option<EmoteSlot> {
        // A bare slot id has no network qualifier and passes through
        if !urn::has_network(&declared.urn) {
            return Some(declared.clone());
        }
        let resolved = self.resolve_item(&declared.urn, owned, third_party_owned)?;
        Some(EmoteSlot { slot: declared.slot, urn: resolved })
    }

    fn with_snapshots(&self, mut avatar: ProfileAvatar, entity: &Entity) -> ProfileAvatar {
        if let Some(hash) = entity.content_hash("body.png") {
            avatar.avatar.snapshots.body = self.content_url(hash);
        }
        if let Some(hash) = entity.content_hash("face256.png") {
            avatar.avatar.snapshots.face256 = self.content_url(hash);
        }
        avatar
    }

    fn content_url(&self, hash: &str) -> String {
        format!("{}/contents/{hash}", self.config.content_base_url.trim_end_matches('/'))
    }
}

/// Index ownership records by case-folded URN. The first record for a URN
/// wins; later duplicates cannot downgrade a resolved token id.
fn index_owned(items: &[OwnedItem]) -> HashMap<String, Option<String>> {
    let mut index = HashMap::with_capacity(items.len());
    for item in items {
        index
            .entry(item.urn.to_lowercase())
            .or_insert_with(|| item.token_id.clone());
    }
    index
}

fn to_seconds(timestamp_ms: u64) -> u64 {
    timestamp_ms / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{CollectionPage, ContentClient};
    use crate::entities::EntitiesFetcherConfig;
    use crate::types::VestiaryError;
    use async_trait::async_trait;

    struct NoContent;

    #[async_trait]
    impl ContentClient for NoContent {
        async fn entities_by_pointers(&self, _pointers: &[String]) -> Result<Vec<Entity>> {
            Ok(Vec::new())
        }

        async fn collection_page(
            &self,
            _collection_id: &str,
            _page_size: u32,
            _page_num: u32,
        ) -> Result<CollectionPage> {
            Ok(CollectionPage::default())
        }

        async fn synchronization_state(&self) -> Result<String> {
            Ok("Syncing".to_string())
        }
    }

    struct NoOwnership;

    #[async_trait]
    impl OwnershipStore for NoOwnership {
        async fn owned_wearables(&self, _address: &str) -> Result<Vec<OwnedItem>> {
            Ok(Vec::new())
        }

        async fn owned_emotes(&self, _address: &str) -> Result<Vec<OwnedItem>> {
            Ok(Vec::new())
        }

        async fn owned_names(&self, _address: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct NoThirdParty;

    #[async_trait]
    impl ThirdPartyItemChecker for NoThirdParty {
        async fn owned_third_party_items(
            &self,
            _address: &str,
            _urns: &[String],
        ) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }
    }

    fn reconciler(config: ProfilesConfig) -> ProfilesReconciler {
        let fetcher = Arc::new(EntitiesFetcher::new(
            Arc::new(NoContent),
            EntitiesFetcherConfig::default(),
        ));
        ProfilesReconciler::new(config, fetcher, Arc::new(NoOwnership), Arc::new(NoThirdParty))
    }

    fn owned(entries: &[(&str, Option<&str>)]) -> HashMap<String, Option<String>> {
        entries
            .iter()
            .map(|(urn, token)| (urn.to_string(), token.map(str::to_string)))
            .collect()
    }

    const V2_ITEM: &str = "urn:decentraland:matic:collections-v2:0xcontract:5";
    const BASE_ITEM: &str = "urn:decentraland:off-chain:base-avatars:eyebrows_00";

    #[test]
    fn classify_reserves_the_default_namespace() {
        assert!(AddressIdentity::classify("Default42").is_synthetic());
        assert!(!AddressIdentity::classify("0xAbC123").is_synthetic());
        assert_eq!(AddressIdentity::classify("0xAbC123").address(), "0xabc123");
    }

    #[test]
    fn base_catalog_items_are_kept_unconditionally() {
        let r = reconciler(ProfilesConfig::default());
        let resolved = r.resolve_item(BASE_ITEM, &owned(&[]), &HashSet::new());
        assert_eq!(resolved, Some(BASE_ITEM.to_string()));
    }

    #[test]
    fn unowned_items_are_dropped() {
        let r = reconciler(ProfilesConfig::default());
        assert_eq!(r.resolve_item(V2_ITEM, &owned(&[]), &HashSet::new()), None);
    }

    #[test]
    fn token_identity_policy_appends_resolved_token() {
        let records = owned(&[(V2_ITEM, Some("7"))]);

        let with_policy = reconciler(ProfilesConfig { ensure_erc721: true, ..Default::default() });
        assert_eq!(
            with_policy.resolve_item(V2_ITEM, &records, &HashSet::new()),
            Some(format!("{V2_ITEM}:7"))
        );

        let without_policy =
            reconciler(ProfilesConfig { ensure_erc721: false, ..Default::default() });
        assert_eq!(
            without_policy.resolve_item(V2_ITEM, &records, &HashSet::new()),
            Some(V2_ITEM.to_string())
        );
    }

    #[test]
    fn declared_token_identity_is_kept_verbatim() {
        let r = reconciler(ProfilesConfig::default());
        let records = owned(&[(V2_ITEM, Some("7"))]);
        let declared = format!("{V2_ITEM}:3");
        assert_eq!(
            r.resolve_item(&declared, &records, &HashSet::new()),
            Some(declared.clone())
        );
    }

    #[test]
    fn policy_without_resolved_token_keeps_base_urn() {
        let r = reconciler(ProfilesConfig::default());
        let records = owned(&[(V2_ITEM, None)]);
        assert_eq!(
            r.resolve_item(V2_ITEM, &records, &HashSet::new()),
            Some(V2_ITEM.to_string())
        );
    }

    #[test]
    fn third_party_items_require_checker_confirmation() {
        let r = reconciler(ProfilesConfig::default());
        let tp = "urn:decentraland:matic:collections-thirdparty:hats:summer:fedora";

        let mut confirmed = HashSet::new();
        confirmed.insert(tp.to_string());
        assert_eq!(
            r.resolve_item(tp, &owned(&[]), &confirmed),
            Some(tp.to_string())
        );
        assert_eq!(r.resolve_item(tp, &owned(&[]), &HashSet::new()), None);
    }

    #[test]
    fn legacy_aliases_resolve_before_matching() {
        let r = reconciler(ProfilesConfig::default());
        let resolved = r.resolve_item("dcl://base-avatars/Eyebrows_00", &owned(&[]), &HashSet::new());
        assert_eq!(resolved, Some(BASE_ITEM.to_string()));
    }

    #[test]
    fn bare_emote_slot_ids_pass_through() {
        let r = reconciler(ProfilesConfig::default());
        let declared = EmoteSlot { slot: 2, urn: "wave".to_string() };
        let resolved = r.resolve_emote(&declared, &owned(&[]), &HashSet::new()).unwrap();
        assert_eq!(resolved.urn, "wave");
        assert_eq!(resolved.slot, 2);
    }

    #[test]
    fn on_chain_emotes_need_an_ownership_record() {
        let r = reconciler(ProfilesConfig::default());
        let emote_urn = "urn:decentraland:matic:collections-v2:0xemote:1";
        let declared = EmoteSlot { slot: 0, urn: emote_urn.to_string() };

        assert!(r.resolve_emote(&declared, &owned(&[]), &HashSet::new()).is_none());
        let resolved = r
            .resolve_emote(&declared, &owned(&[(emote_urn, Some("9"))]), &HashSet::new())
            .unwrap();
        assert_eq!(resolved.urn, format!("{emote_urn}:9"));
    }

    #[test]
    fn snapshots_rewrite_under_the_configured_base() {
        let r = reconciler(ProfilesConfig {
            content_base_url: "https://content.example/".to_string(),
            ..Default::default()
        });
        let entity: Entity = serde_json::from_value(serde_json::json!({
            "id": "QmProfile",
            "timestamp": 1_700_000_000_000u64,
            "pointers": ["0xabc"],
            "content": [
                { "file": "body.png", "hash": "QmBody" },
                { "file": "face256.png", "hash": "QmFace" }
            ],
            "metadata": {}
        }))
        .unwrap();

        let avatar = r.with_snapshots(ProfileAvatar::default(), &entity);
        assert_eq!(avatar.avatar.snapshots.body, "https://content.example/contents/QmBody");
        assert_eq!(avatar.avatar.snapshots.face256, "https://content.example/contents/QmFace");
    }

    #[test]
    fn first_ownership_record_wins() {
        let items = vec![
            OwnedItem { urn: "URN:A".to_string(), token_id: Some("1".to_string()) },
            OwnedItem { urn: "urn:a".to_string(), token_id: Some("2".to_string()) },
        ];
        let index = index_owned(&items);
        assert_eq!(index.get("urn:a"), Some(&Some("1".to_string())));
    }

    #[tokio::test]
    async fn failing_ownership_collapses_the_batch() {
        struct FailingOwnership;

        #[async_trait]
        impl OwnershipStore for FailingOwnership {
            async fn owned_wearables(&self, _address: &str) -> Result<Vec<OwnedItem>> {
                Err(VestiaryError::TransientFetch("database down".to_string()))
            }

            async fn owned_emotes(&self, _address: &str) -> Result<Vec<OwnedItem>> {
                Ok(Vec::new())
            }

            async fn owned_names(&self, _address: &str) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
        }

        struct OneProfile;

        #[async_trait]
        impl ContentClient for OneProfile {
            async fn entities_by_pointers(&self, pointers: &[String]) -> Result<Vec<Entity>> {
                Ok(vec![serde_json::from_value(serde_json::json!({
                    "id": "QmProfile",
                    "timestamp": 1_700_000_000_000u64,
                    "pointers": [pointers[0].clone()],
                    "content": [],
                    "metadata": { "avatars": [{ "name": "ada", "avatar": {} }] }
                }))
                .unwrap()])
            }

            async fn collection_page(
                &self,
                _collection_id: &str,
                _page_size: u32,
                _page_num: u32,
            ) -> Result<CollectionPage> {
                Ok(CollectionPage::default())
            }

            async fn synchronization_state(&self) -> Result<String> {
                Ok("Syncing".to_string())
            }
        }

        let fetcher = Arc::new(EntitiesFetcher::new(
            Arc::new(OneProfile),
            EntitiesFetcherConfig::default(),
        ));
        let reconciler = ProfilesReconciler::new(
            ProfilesConfig::default(),
            fetcher,
            Arc::new(FailingOwnership),
            Arc::new(NoThirdParty),
        );

        let outcome = reconciler.get_profiles(&["0xabc".to_string()], None).await;
        match outcome {
            ProfilesOutcome::Profiles(profiles) => assert!(profiles.is_empty()),
            ProfilesOutcome::NotModified => panic!("unexpected NotModified"),
        }
    }
}
