//! Vestiary - entitlement resolution core for blockchain-backed avatar
//! profiles.
//!
//! Resolves which catalog items (wearables, emotes, claimed names) an
//! address is entitled to display, by reconciling declared claims against
//! independent authority sources: a pre-computed ownership store, paginated
//! content-addressed collections, and a third-party provider registry with
//! primary/fallback resolution.
//!
//! ## Components
//!
//! - **Entities Fetcher**: pointer resolution with per-pointer caching and
//!   partial-failure-aware collection pagination
//! - **Third-Party Providers Storage**: single-slot provider registry cache
//!   with stale-value reuse on failure
//! - **Cache Warmer**: readiness-gated, bounded-concurrency repopulation of
//!   collection caches ahead of expiry
//! - **Linked-Wearables Matcher**: pure mapping-rule predicate
//! - **Profile Reconciliation**: merges declared avatar claims with
//!   ownership facts into the servable profile
//!
//! HTTP route wiring, configuration loading and the ownership database's
//! SQL implementation are external collaborators; their seams are the
//! `ContentClient`, `ProviderSource`, `OwnershipStore` and
//! `ThirdPartyItemChecker` traits.

pub mod cache;
pub mod content;
pub mod entities;
pub mod matcher;
pub mod ownership;
pub mod profiles;
pub mod third_party;
pub mod types;
pub mod urn;
pub mod warmer;

pub use types::{Result, VestiaryError};
