//! Entities fetcher.
//!
//! Resolves content-addressed entities by pointer with per-pointer caching,
//! and retrieves whole collections through paginated, partial-failure-aware
//! bulk fetching. Collections keep a lightweight cached projection
//! (`urn` + `mappings` per item) so an ownership filter can run before the
//! expensive per-entity fetch.
//!
//! Completeness semantics: a projection produced by a pagination with any
//! failed page is stored with `is_complete = false` and is never read back
//! as authoritative. The next caller re-paginates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStats, TtlCache};
use crate::content::{ContentClient, Entity};
use crate::matcher::{mappings_match_any, Mappings, OwnedToken};
use crate::types::{Result, VestiaryError};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the entities fetcher
#[derive(Debug, Clone)]
pub struct EntitiesFetcherConfig {
    /// Page size for collection pagination (default: 1000)
    pub page_size: u32,
    /// TTL for per-pointer entity cache (default: 6 hours)
    pub pointer_ttl: Duration,
    /// TTL for collection projections. Kept just under 48 hours so the
    /// warmer's 47-hour cycle refreshes entries before they expire.
    pub collection_ttl: Duration,
}

impl Default for EntitiesFetcherConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            pointer_ttl: Duration::from_secs(6 * 60 * 60),
            collection_ttl: Duration::from_secs(48 * 60 * 60 - 10 * 60),
        }
    }
}

impl EntitiesFetcherConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("ENTITIES_PAGE_SIZE") {
            if let Ok(size) = val.parse::<u32>() {
                config.page_size = size.max(1);
            }
        }
        if let Ok(val) = std::env::var("ENTITY_TTL_SECONDS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.pointer_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(val) = std::env::var("COLLECTION_TTL_SECONDS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.collection_ttl = Duration::from_secs(secs);
            }
        }
        config
    }
}

// ============================================================================
// Collection Projection
// ============================================================================

/// Minimal projection of one collection item
#[derive(Debug, Clone)]
pub struct ProjectedItem {
    pub urn: String,
    pub mappings: Mappings,
}

/// Cached projection of a collection. Trusted to skip re-pagination only
/// while `is_complete` is true.
#[derive(Debug, Clone)]
pub struct CollectionProjection {
    pub items: Vec<ProjectedItem>,
    pub is_complete: bool,
}

fn project(entities: &[Entity]) -> Vec<ProjectedItem> {
    entities
        .iter()
        .filter_map(|entity| {
            Some(ProjectedItem {
                urn: entity.item_urn()?.to_lowercase(),
                mappings: entity.metadata.mappings.clone()?,
            })
        })
        .collect()
}

// ============================================================================
// Fetcher
// ============================================================================

/// Resolves entities by pointer and by collection, with caching
pub struct EntitiesFetcher {
    client: Arc<dyn ContentClient>,
    config: EntitiesFetcherConfig,
    pointer_cache: TtlCache<Entity>,
    collection_cache: TtlCache<Arc<CollectionProjection>>,
    /// Per-pointer locks so concurrent misses for one pointer coalesce
    /// into a single upstream bulk call
    pointer_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Per-collection locks so concurrent callers coalesce into one
    /// pagination instead of racing the upstream
    collection_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EntitiesFetcher {
    pub fn new(client: Arc<dyn ContentClient>, config: EntitiesFetcherConfig) -> Self {
        info!(
            page_size = config.page_size,
            pointer_ttl_secs = config.pointer_ttl.as_secs(),
            collection_ttl_secs = config.collection_ttl.as_secs(),
            "EntitiesFetcher initialized"
        );
        Self {
            pointer_cache: TtlCache::new(config.pointer_ttl),
            collection_cache: TtlCache::new(config.collection_ttl),
            pointer_locks: DashMap::new(),
            collection_locks: DashMap::new(),
            client,
            config,
        }
    }

    /// Resolve entities by pointer, one result per input in input order.
    /// Cache hits are served directly; all misses go upstream in a single
    /// bulk call. Every pointer of a returned entity populates the cache.
    ///
    /// Concurrent callers missing the same pointer coalesce: the first one
    /// fetches, later ones wait on the per-pointer lock and then read the
    /// cache instead of issuing their own upstream call.
    pub async fn fetch_entities(&self, pointers: &[String]) -> Result<Vec<Option<Entity>>> {
        let mut resolved: Vec<Option<Entity>> = vec![None; pointers.len()];
        let mut misses: Vec<String> = Vec::new();

        for (slot, pointer) in resolved.iter_mut().zip(pointers) {
            match self.pointer_cache.get(pointer) {
                Some(entity) => *slot = Some(entity),
                None => {
                    let key = pointer.to_lowercase();
                    if !misses.contains(&key) {
                        misses.push(key);
                    }
                }
            }
        }

        if misses.is_empty() {
            return Ok(resolved);
        }

        // Locks are taken in sorted key order so overlapping batches
        // cannot deadlock
        misses.sort();
        let mut guards = Vec::with_capacity(misses.len());
        for key in &misses {
            guards.push(self.pointer_lock(key).lock_owned().await);
        }

        // A concurrent caller may have resolved some of these pointers
        // while we waited on the locks
        let still_missing: Vec<String> = misses
            .iter()
            .filter(|key| self.pointer_cache.get(key).is_none())
            .cloned()
            .collect();

        let mut by_pointer: HashMap<String, Entity> = HashMap::new();
        if !still_missing.is_empty() {
            debug!(
                requested = pointers.len(),
                misses = still_missing.len(),
                "Resolving pointer misses"
            );
            let fetched = self.client.entities_by_pointers(&still_missing).await?;
            for entity in fetched {
                for pointer in &entity.pointers {
                    self.pointer_cache.insert(pointer, entity.clone());
                    by_pointer.insert(pointer.to_lowercase(), entity.clone());
                }
            }
        }
        drop(guards);

        for (slot, pointer) in resolved.iter_mut().zip(pointers) {
            if slot.is_none() {
                let key = pointer.to_lowercase();
                *slot = by_pointer
                    .get(&key)
                    .cloned()
                    .or_else(|| self.pointer_cache.get(&key));
            }
        }
        Ok(resolved)
    }

    /// All entities of a collection, optionally filtered to those backed by
    /// one of the owned tokens. Set semantics, order not guaranteed.
    ///
    /// Never fails: any unexpected error degrades to an empty result.
    pub async fn fetch_collection_entities(
        &self,
        collection_id: &str,
        owned: Option<&[OwnedToken]>,
    ) -> Vec<Entity> {
        match self.collection_entities_inner(collection_id, owned).await {
            Ok(entities) => entities,
            Err(e) => {
                error!(
                    collection = collection_id,
                    error = %e,
                    "Collection fetch failed, serving empty result"
                );
                Vec::new()
            }
        }
    }

    /// Re-paginate a collection unconditionally and cache its projection.
    /// Unlike [`fetch_collection_entities`] this propagates failure, so the
    /// cache warmer can record it. Returns the number of projected items.
    ///
    /// [`fetch_collection_entities`]: Self::fetch_collection_entities
    pub async fn warm_collection(&self, collection_id: &str) -> Result<usize> {
        let key = collection_id.to_lowercase();
        let lock = self.collection_lock(&key);
        let _guard = lock.lock().await;

        let (entities, is_complete) = self.paginate(&key).await?;
        let items = project(&entities);
        let count = items.len();
        self.collection_cache
            .insert(&key, Arc::new(CollectionProjection { items, is_complete }));

        if !is_complete {
            return Err(VestiaryError::TransientFetch(format!(
                "collection {key}: pagination incomplete"
            )));
        }
        debug!(collection = %key, items = count, "Collection warmed");
        Ok(count)
    }

    pub fn pointer_cache_stats(&self) -> CacheStats {
        self.pointer_cache.stats()
    }

    pub fn collection_cache_stats(&self) -> CacheStats {
        self.collection_cache.stats()
    }

    async fn collection_entities_inner(
        &self,
        collection_id: &str,
        owned: Option<&[OwnedToken]>,
    ) -> Result<Vec<Entity>> {
        let key = collection_id.to_lowercase();

        if let Some(projection) = self.complete_projection(&key) {
            return self.entities_from_projection(&projection, owned).await;
        }

        let lock = self.collection_lock(&key);
        let _guard = lock.lock().await;

        // A concurrent caller may have finished the pagination while we
        // waited on the lock
        if let Some(projection) = self.complete_projection(&key) {
            return self.entities_from_projection(&projection, owned).await;
        }

        let (entities, is_complete) = self.paginate(&key).await?;
        let items = project(&entities);
        self.collection_cache
            .insert(&key, Arc::new(CollectionProjection { items, is_complete }));

        // The ownership filter applies to the fresh set only on this cold
        // path; the warm path filters the projection before fetching
        let entities = match owned {
            Some(tokens) => entities
                .into_iter()
                .filter(|entity| {
                    entity
                        .metadata
                        .mappings
                        .as_ref()
                        .is_some_and(|mappings| mappings_match_any(mappings, tokens))
                })
                .collect(),
            None => entities,
        };
        Ok(entities)
    }

    /// Reuse a cached projection: filter the lightweight items first, then
    /// fully fetch only the URNs that survive the filter
    async fn entities_from_projection(
        &self,
        projection: &CollectionProjection,
        owned: Option<&[OwnedToken]>,
    ) -> Result<Vec<Entity>> {
        let urns: Vec<String> = match owned {
            Some(tokens) => projection
                .items
                .iter()
                .filter(|item| mappings_match_any(&item.mappings, tokens))
                .map(|item| item.urn.clone())
                .collect(),
            None => projection.items.iter().map(|item| item.urn.clone()).collect(),
        };
        if urns.is_empty() {
            return Ok(Vec::new());
        }
        let entities = self.fetch_entities(&urns).await?;
        Ok(entities.into_iter().flatten().collect())
    }

    /// Paginate a whole collection. Page 1 is fetched synchronously to learn
    /// the total; pages 2..N race concurrently and are concatenated in page
    /// order. A failing page is recorded, not fatal. Entities without a
    /// mapping carry no ownership relation and are discarded.
    async fn paginate(&self, collection_id: &str) -> Result<(Vec<Entity>, bool)> {
        let page_size = self.config.page_size;
        let first = self.client.collection_page(collection_id, page_size, 1).await?;
        let total_pages = first.total.div_ceil(page_size as u64) as u32;

        let mut entities = first.entities;
        let mut failed_pages: Vec<u32> = Vec::new();

        if total_pages > 1 {
            let requests = (2..=total_pages)
                .map(|page| self.client.collection_page(collection_id, page_size, page));
            let results = join_all(requests).await;
            for (page, result) in (2..=total_pages).zip(results) {
                match result {
                    Ok(p) => entities.extend(p.entities),
                    Err(e) => {
                        warn!(collection = collection_id, page, error = %e, "Collection page failed");
                        failed_pages.push(page);
                    }
                }
            }
        }

        let before = entities.len();
        entities.retain(|entity| entity.metadata.mappings.is_some());
        if entities.len() < before {
            debug!(
                collection = collection_id,
                discarded = before - entities.len(),
                "Discarded entities without mappings"
            );
        }

        let is_complete = failed_pages.is_empty();
        if !is_complete {
            warn!(
                collection = collection_id,
                failed = failed_pages.len(),
                total_pages,
                "Collection pagination incomplete, projection will not be trusted"
            );
        }
        Ok((entities, is_complete))
    }

    fn complete_projection(&self, key: &str) -> Option<Arc<CollectionProjection>> {
        self.collection_cache
            .get(key)
            .filter(|projection| projection.is_complete)
    }

    fn pointer_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.pointer_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn collection_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.collection_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
