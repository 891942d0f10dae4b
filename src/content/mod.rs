//! Content server boundary.
//!
//! Wire types and the [`ContentClient`] trait for the content-addressed
//! entity source, plus the reqwest-backed implementation. External data is
//! parsed into explicit structures here; nothing unvalidated flows past
//! this module.
//!
//! Wire contract:
//! - `POST {base}/entities/active` with a pointer list; unresolved pointers
//!   are simply absent from the response, not an error.
//! - `GET {base}/entities/active/collections/{id}?pageSize=&pageNum=`
//!   returns one page. HTTP 404 means "zero entities", any other
//!   non-success status is a page-level failure.
//! - `GET {base}/status` reports the server's synchronization state.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::matcher::Mappings;
use crate::types::{Result, VestiaryError};

// ============================================================================
// Wire Types
// ============================================================================

/// Immutable content-addressed entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    /// Unix epoch milliseconds
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub pointers: Vec<String>,
    #[serde(default)]
    pub content: Vec<ContentFile>,
    #[serde(default)]
    pub metadata: EntityMetadata,
}

impl Entity {
    /// Hash of a named content file, if the entity carries one
    pub fn content_hash(&self, file: &str) -> Option<&str> {
        self.content
            .iter()
            .find(|f| f.file.eq_ignore_ascii_case(file))
            .map(|f| f.hash.as_str())
    }

    /// Canonical URN for an item entity: the declared metadata id,
    /// falling back to the first pointer
    pub fn item_urn(&self) -> Option<&str> {
        self.metadata
            .id
            .as_deref()
            .or_else(|| self.pointers.first().map(String::as_str))
    }
}

/// One file referenced by an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentFile {
    pub file: String,
    pub hash: String,
}

/// Entity metadata. Item entities carry `id` and `mappings`;
/// profile entities carry `avatars`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<Mappings>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub avatars: Vec<ProfileAvatar>,
}

/// A declared avatar inside a profile entity. The reconciled output reuses
/// the same shape with verified claims.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileAvatar {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub has_claimed_name: bool,
    #[serde(default)]
    pub avatar: AvatarDetail,
}

/// The displayable part of an avatar declaration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarDetail {
    #[serde(default)]
    pub body_shape: String,
    #[serde(default)]
    pub wearables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emotes: Vec<EmoteSlot>,
    #[serde(default)]
    pub snapshots: Snapshots,
}

/// One equipped emote. `urn` is a bare slot id for off-chain emotes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmoteSlot {
    pub slot: u32,
    pub urn: String,
}

/// Snapshot image references, rewritten to absolute URLs on output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshots {
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub face256: String,
}

/// One page of a collection listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionPage {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    synchronization_status: SynchronizationStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynchronizationStatus {
    synchronization_state: String,
}

// ============================================================================
// Client Trait
// ============================================================================

/// Access to the content-addressed entity source
#[async_trait]
pub trait ContentClient: Send + Sync {
    /// Bulk lookup by pointers. Unresolved pointers are absent from the
    /// result.
    async fn entities_by_pointers(&self, pointers: &[String]) -> Result<Vec<Entity>>;

    /// One page of a collection. A 404 is returned as an empty page.
    async fn collection_page(
        &self,
        collection_id: &str,
        page_size: u32,
        page_num: u32,
    ) -> Result<CollectionPage>;

    /// Current synchronization state reported by the server's status probe
    async fn synchronization_state(&self) -> Result<String>;
}

// ============================================================================
// HTTP Implementation
// ============================================================================

/// reqwest-backed [`ContentClient`]
pub struct HttpContentClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpContentClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .user_agent("vestiary/0.1")
            .build()
            .map_err(|e| VestiaryError::ClientBuild(e.to_string()))?;
        Ok(Self { base_url, client })
    }

    fn fetch_error(context: &str, err: impl std::fmt::Display) -> VestiaryError {
        VestiaryError::TransientFetch(format!("{context}: {err}"))
    }
}

#[async_trait]
impl ContentClient for HttpContentClient {
    async fn entities_by_pointers(&self, pointers: &[String]) -> Result<Vec<Entity>> {
        let url = format!("{}/entities/active", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "pointers": pointers }))
            .send()
            .await
            .map_err(|e| Self::fetch_error("entities by pointers", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VestiaryError::TransientFetch(format!(
                "entities by pointers: status {status}"
            )));
        }

        response
            .json::<Vec<Entity>>()
            .await
            .map_err(|e| Self::fetch_error("entities by pointers body", e))
    }

    async fn collection_page(
        &self,
        collection_id: &str,
        page_size: u32,
        page_num: u32,
    ) -> Result<CollectionPage> {
        let url = format!(
            "{}/entities/active/collections/{collection_id}?pageSize={page_size}&pageNum={page_num}",
            self.base_url
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::fetch_error("collection page", e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // An unknown collection has zero entities; this is not a failure
            debug!(collection = collection_id, "Collection not found, treating as empty");
            return Ok(CollectionPage::default());
        }
        if !status.is_success() {
            return Err(VestiaryError::TransientFetch(format!(
                "collection {collection_id} page {page_num}: status {status}"
            )));
        }

        response
            .json::<CollectionPage>()
            .await
            .map_err(|e| Self::fetch_error("collection page body", e))
    }

    async fn synchronization_state(&self) -> Result<String> {
        let url = format!("{}/status", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::fetch_error("status probe", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VestiaryError::TransientFetch(format!(
                "status probe: status {status}"
            )));
        }

        let body = response
            .json::<StatusResponse>()
            .await
            .map_err(|e| Self::fetch_error("status probe body", e))?;
        Ok(body.synchronization_status.synchronization_state)
    }
}
