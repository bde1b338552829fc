//! Host policy: which hosts may be crawled, when, and in what order
//!
//! This module contains the in-memory policy state shared by the fetcher
//! and parser workers:
//! - Host whitelisting and instance resolution
//! - Retry-After backoff holds
//! - URL priority strategies
//! - A bounded dedup cache for extracted links

mod backoff;
mod host_check;
mod mem_cache;
mod preference;

pub use backoff::{parse_retry_after, HoldPolicy};
pub use host_check::{resolve_instance, HostCheck};
pub use mem_cache::MemCache;
pub use preference::{make_preference, BreadthPreference, NoveltyPreference, Preference};
