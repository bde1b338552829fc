//! Crawler module: the fetch and parse stages of the pipeline
//!
//! This module contains the crawling logic, including:
//! - HTTP fetching with bounded concurrency and redirect canonicalization
//! - HTML link extraction and re-enqueueing
//! - Host rotation and the health-check circuit breaker
//! - Seeding and the `kick`/`retry` recovery operations

mod fetcher;
mod health;
mod notify;
mod parser;
mod scheduler;

pub use fetcher::{build_http_client, is_accepted, FetchStats, Fetcher};
pub(crate) use fetcher::store;
pub use health::HealthMonitor;
pub use notify::Waiter;
pub use parser::{extract_links, ExtractedLinks, ParseStats, Parser};
pub use scheduler::Scheduler;

use crate::policy::HostCheck;
use crate::storage::{channel_name, Storage, DOWNLOAD_READY, PARSE_READY};
use crate::url::normalize_url;
use crate::AmpError;
use url::Url;

/// Seed URLs always come before anything discovered
pub const SEED_PRIORITY: i64 = 0;

/// Registers hosts and enqueues start URLs
///
/// # Arguments
///
/// * `storage` - The queue store
/// * `hosts` - Host names to whitelist
/// * `urls` - URLs to enqueue; those on unknown hosts are skipped
/// * `instance` - Owner of the hosts; registered if new
/// * `match_domain` - Match URLs to hosts by registrable domain
///
/// # Returns
///
/// The number of URLs enqueued
pub fn seed<S: Storage>(
    storage: &mut S,
    hosts: &[String],
    urls: &[String],
    instance: Option<&str>,
    match_domain: bool,
) -> Result<usize, AmpError> {
    let instance_id = instance
        .map(|name| storage.insert_instance(name))
        .transpose()?;

    for host in hosts {
        let host_id = storage.insert_host(&host.trim().to_lowercase(), instance_id)?;
        tracing::debug!("Registered host {} as {}", host, host_id);
    }

    let check = HostCheck::load(storage, None, match_domain)?;
    let mut enqueued = 0;
    for raw in urls {
        let url = match normalize_url(raw) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Skipping seed {}: {}", raw, e);
                continue;
            }
        };
        let host_id = match check.host_id(&url) {
            Some(host_id) => host_id,
            None => {
                tracing::warn!("Skipping seed {}: host is not whitelisted", url);
                continue;
            }
        };

        let (url_id, _) = storage.insert_url(url.as_str())?;
        if storage.enqueue_download(url_id, SEED_PRIORITY, host_id)? {
            enqueued += 1;
        }
    }

    if enqueued > 0 {
        storage.notify(&channel_name(DOWNLOAD_READY, None))?;
    }
    tracing::info!("Seeded {} URLs", enqueued);
    Ok(enqueued)
}

/// Re-enqueues fetched documents that were never parsed
///
/// Recovers documents whose parser died between dequeue and `mark_parsed`.
pub fn kick<S: Storage>(storage: &mut S, instance_id: Option<i64>) -> Result<usize, AmpError> {
    let count = storage.enqueue_unparsed()?;
    if count > 0 {
        storage.notify(&channel_name(PARSE_READY, instance_id))?;
    }
    tracing::info!("Kicked {} unparsed documents", count);
    Ok(count)
}

/// Forgets failed downloads and puts them back on the download queue
pub fn retry<S: Storage>(storage: &mut S, match_domain: bool) -> Result<usize, AmpError> {
    let failed = storage.take_failed_downloads()?;
    let check = HostCheck::load(storage, None, match_domain)?;

    let mut enqueued = 0;
    for record in failed {
        let host_id = Url::parse(&record.url)
            .ok()
            .and_then(|url| check.host_id(&url));
        match host_id {
            Some(host_id) => {
                if storage.enqueue_download(record.id, SEED_PRIORITY, host_id)? {
                    enqueued += 1;
                }
            }
            None => tracing::warn!("Not retrying {}: host is not whitelisted", record.url),
        }
    }

    if enqueued > 0 {
        storage.notify(&channel_name(DOWNLOAD_READY, None))?;
    }
    tracing::info!("Re-enqueued {} failed downloads", enqueued);
    Ok(enqueued)
}
