//! Collections cache warmer.
//!
//! Eliminates first-request pagination latency by re-fetching every
//! third-party collection with on-chain contracts before its cached
//! projection expires. A warm cycle:
//!
//! 1. Gates on the content server's readiness probe (fixed-count,
//!    fixed-delay retry loop; no exponential backoff).
//! 2. Loads the provider registry and keeps only providers with contracts.
//! 3. Splits them into fixed-size batches. Batches run sequentially,
//!    providers inside a batch run concurrently, and one provider's
//!    failure never stops its batch or later batches.
//!
//! Cycles are scheduled by a background task; a shutdown only prevents
//! future cycles, it cannot abort one already running.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::content::ContentClient;
use crate::entities::EntitiesFetcher;
use crate::third_party::ThirdPartyProvidersStorage;
use crate::types::{Result, VestiaryError};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the cache warmer
#[derive(Debug, Clone)]
pub struct WarmerConfig {
    /// A disabled warmer never runs
    pub enabled: bool,
    /// Delay before the first cycle after startup (default: 5 minutes)
    pub startup_delay: Duration,
    /// Interval between cycles. 47 hours lands each refresh just before
    /// the collection cache's just-under-48h expiry.
    pub interval: Duration,
    /// Delay between readiness probe attempts (default: 30 seconds)
    pub readiness_poll_interval: Duration,
    /// Maximum readiness probe attempts per cycle (default: 20)
    pub readiness_max_attempts: u32,
    /// Providers warmed concurrently within one batch (default: 10)
    pub max_concurrency: usize,
    /// Sync state the readiness probe must report before warming
    pub expected_sync_state: String,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_delay: Duration::from_secs(5 * 60),
            interval: Duration::from_secs(47 * 60 * 60),
            readiness_poll_interval: Duration::from_secs(30),
            readiness_max_attempts: 20,
            max_concurrency: 10,
            expected_sync_state: "Syncing".to_string(),
        }
    }
}

impl WarmerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("WARMER_ENABLED") {
            if let Ok(enabled) = val.parse::<bool>() {
                config.enabled = enabled;
            }
        }
        if let Ok(val) = std::env::var("WARMER_MAX_CONCURRENCY") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_concurrency = n.max(1);
            }
        }
        if let Ok(val) = std::env::var("WARMER_STARTUP_DELAY_SECONDS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.startup_delay = Duration::from_secs(secs);
            }
        }
        if let Ok(val) = std::env::var("WARMER_INTERVAL_SECONDS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.interval = Duration::from_secs(secs);
            }
        }
        config
    }
}

// ============================================================================
// Status
// ============================================================================

/// Point-in-time view of the warmer
#[derive(Debug, Clone)]
pub struct WarmerStatus {
    pub enabled: bool,
    pub collections_warmed: usize,
    pub total_collections: usize,
    pub errors: Vec<String>,
    pub is_warming: bool,
}

#[derive(Debug, Default)]
struct CycleCounters {
    collections_warmed: usize,
    total_collections: usize,
    errors: Vec<String>,
}

// ============================================================================
// Warmer
// ============================================================================

/// Handle for a scheduled warmer. Dropping it (or calling [`shutdown`])
/// prevents future cycles; a cycle already running completes on its own.
///
/// [`shutdown`]: WarmerHandle::shutdown
pub struct WarmerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl WarmerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Proactively repopulates collection caches ahead of expiry
pub struct CacheWarmer {
    config: WarmerConfig,
    client: Arc<dyn ContentClient>,
    fetcher: Arc<EntitiesFetcher>,
    providers: Arc<ThirdPartyProvidersStorage>,
    warming: AtomicBool,
    cycle: Mutex<CycleCounters>,
}

impl CacheWarmer {
    pub fn new(
        config: WarmerConfig,
        client: Arc<dyn ContentClient>,
        fetcher: Arc<EntitiesFetcher>,
        providers: Arc<ThirdPartyProvidersStorage>,
    ) -> Self {
        info!(
            enabled = config.enabled,
            interval_secs = config.interval.as_secs(),
            max_concurrency = config.max_concurrency,
            "CacheWarmer initialized"
        );
        Self {
            config,
            client,
            fetcher,
            providers,
            warming: AtomicBool::new(false),
            cycle: Mutex::new(CycleCounters::default()),
        }
    }

    /// Run one warm cycle. A request while another cycle is in progress is
    /// rejected outright; there is no queueing.
    pub async fn warm(&self) -> Result<()> {
        if !self.config.enabled {
            return Err(VestiaryError::WarmerDisabled);
        }
        if self
            .warming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Warm cycle requested while one is in progress, rejecting");
            return Err(VestiaryError::WarmInProgress);
        }

        let result = self.run_cycle().await;
        self.warming.store(false, Ordering::SeqCst);
        result
    }

    /// Schedule recurring warm cycles on a background task: one cycle after
    /// the startup delay, then every `interval`, each independent of the
    /// previous cycle's outcome.
    pub fn spawn(self: &Arc<Self>) -> WarmerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let warmer = Arc::clone(self);

        tokio::spawn(async move {
            if !warmer.config.enabled {
                info!("Cache warmer disabled, scheduler not starting");
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(warmer.config.startup_delay) => {}
                _ = shutdown_rx.changed() => return,
            }
            loop {
                if let Err(e) = warmer.warm().await {
                    warn!(error = %e, "Warm cycle failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(warmer.config.interval) => {}
                    _ = shutdown_rx.changed() => return,
                }
            }
        });

        WarmerHandle { shutdown_tx }
    }

    /// Current status. Errors reflect the most recent cycle (reset when a
    /// cycle starts).
    pub async fn status(&self) -> WarmerStatus {
        let cycle = self.cycle.lock().await;
        WarmerStatus {
            enabled: self.config.enabled,
            collections_warmed: cycle.collections_warmed,
            total_collections: cycle.total_collections,
            errors: cycle.errors.clone(),
            is_warming: self.warming.load(Ordering::SeqCst),
        }
    }

    async fn run_cycle(&self) -> Result<()> {
        {
            let mut cycle = self.cycle.lock().await;
            *cycle = CycleCounters::default();
        }

        if let Err(e) = self.await_readiness().await {
            self.record_error(format!("readiness: {e}")).await;
            return Err(e);
        }

        let providers = match self.providers.get_all().await {
            Ok(providers) => providers,
            Err(e) => {
                self.record_error(format!("providers: {e}")).await;
                return Err(e);
            }
        };

        let targets: Vec<_> = providers
            .iter()
            .filter(|provider| provider.has_contracts())
            .cloned()
            .collect();
        {
            let mut cycle = self.cycle.lock().await;
            cycle.total_collections = targets.len();
        }
        info!(total = targets.len(), "Warm cycle started");

        let batch_size = self.config.max_concurrency.max(1);
        for batch in targets.chunks(batch_size) {
            let results = join_all(batch.iter().map(|provider| async move {
                (provider.id.clone(), self.fetcher.warm_collection(&provider.id).await)
            }))
            .await;

            for (id, result) in results {
                match result {
                    Ok(items) => {
                        debug!(collection = %id, items, "Collection warmed");
                        self.cycle.lock().await.collections_warmed += 1;
                    }
                    Err(e) => {
                        warn!(collection = %id, error = %e, "Collection warm failed");
                        self.record_error(format!("{id}: {e}")).await;
                    }
                }
            }
        }

        let cycle = self.cycle.lock().await;
        info!(
            warmed = cycle.collections_warmed,
            total = cycle.total_collections,
            failed = cycle.errors.len(),
            "Warm cycle finished"
        );
        Ok(())
    }

    /// Poll the readiness probe until it reports the expected state, at a
    /// fixed interval up to a fixed attempt count
    async fn await_readiness(&self) -> Result<()> {
        let expected = &self.config.expected_sync_state;
        for attempt in 1..=self.config.readiness_max_attempts {
            match self.client.synchronization_state().await {
                Ok(state) if state == *expected => {
                    debug!(attempt, "Content server ready");
                    return Ok(());
                }
                Ok(state) => {
                    debug!(attempt, state = %state, "Content server not ready yet");
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Readiness probe failed");
                }
            }
            if attempt < self.config.readiness_max_attempts {
                tokio::time::sleep(self.config.readiness_poll_interval).await;
            }
        }
        Err(VestiaryError::ReadinessTimeout {
            attempts: self.config.readiness_max_attempts,
        })
    }

    async fn record_error(&self, message: String) {
        self.cycle.lock().await.errors.push(message);
    }
}
