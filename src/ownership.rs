//! Ownership boundary traits.
//!
//! The ownership database (a pre-computed relational store) and the
//! third-party ownership checker are external collaborators. This module
//! fixes their seams; implementations live with the embedding application.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::types::Result;

/// Minimal ownership projection: the item URN and, when the store resolves
/// one, a specific token id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedItem {
    pub urn: String,
    pub token_id: Option<String>,
}

/// Read access to the pre-computed ownership database
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    /// Wearables the address owns, as urn + token id pairs
    async fn owned_wearables(&self, address: &str) -> Result<Vec<OwnedItem>>;

    /// Emotes the address owns, as urn + token id pairs
    async fn owned_emotes(&self, address: &str) -> Result<Vec<OwnedItem>>;

    /// Names the address has claimed
    async fn owned_names(&self, address: &str) -> Result<Vec<String>>;
}

/// Batched third-party ownership verification
#[async_trait]
pub trait ThirdPartyItemChecker: Send + Sync {
    /// The subset of `urns` the address actually owns. URNs are compared
    /// case-insensitively; the returned set is case-folded.
    async fn owned_third_party_items(
        &self,
        address: &str,
        urns: &[String],
    ) -> Result<HashSet<String>>;
}
