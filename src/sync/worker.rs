//! Sync worker
//!
//! Pulls documents held by a peer instance into this instance's loose tier.
//! Each document moves through GET headers, GET body, local write, locality
//! update and finally a remote DELETE of both parts. The DELETE is only
//! issued once the local write has completed.

use crate::config::Config;
use crate::crawler::{build_http_client, store, HealthMonitor};
use crate::policy::resolve_instance;
use crate::storage::Storage;
use crate::volume::{member_name, Layout, Part};
use crate::AmpError;
use regex::Regex;
use reqwest::{Client, Response, StatusCode};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinSet;

const CANDIDATE_BATCH: usize = 256;

/// Counters of one sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Documents written locally
    pub pulled: usize,
    /// Pulls that failed before the local write completed
    pub failed: usize,
    /// Documents deleted on the peer
    pub released: usize,
}

enum Stage {
    Pulled {
        url_id: i64,
        result: Result<u64, AmpError>,
    },
    Released {
        url_id: i64,
        result: Result<(), AmpError>,
    },
}

/// Extracts the instance name from a handshake blob
///
/// An empty value means the peer runs without a configured instance.
pub fn parse_handshake(blob: &str) -> Result<Option<String>, AmpError> {
    let rx = Regex::new(r"instance\s*=(.*)")?;
    let name = rx
        .captures(blob)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .ok_or_else(|| AmpError::Handshake("no instance line in peer root".to_string()))?;

    Ok((!name.is_empty()).then(|| name.to_string()))
}

pub struct SyncWorker<S: Storage> {
    storage: S,
    client: Client,
    base: String,
    layout: Layout,
    health: HealthMonitor,
    instance_id: Option<i64>,
    peer_id: Option<i64>,
    max_num_conn: usize,
    in_progress: HashSet<i64>,
    pending: VecDeque<i64>,
    cursor: i64,
    exhausted: bool,
    idle_timeout: Duration,
    stats: SyncStats,
}

impl<S: Storage> SyncWorker<S> {
    /// Performs the handshake with the peer at `server`
    ///
    /// # Returns
    ///
    /// * `Ok(SyncWorker)` - The peer is a different, registered instance
    /// * `Err(AmpError::Handshake)` - The peer is unreachable, is this
    ///   instance, or neither side has an instance configured
    /// * `Err(AmpError::UnknownInstance)` - Either instance is not registered
    pub async fn connect(storage: S, config: &Config, server: &str) -> Result<Self, AmpError> {
        let instance_id = resolve_instance(&storage, config.instance.name.as_deref())?;
        let client = build_http_client(&config.download)?;
        let base = server.trim_end_matches('/').to_string();

        let response = client
            .get(format!("{}/", base))
            .send()
            .await
            .map_err(|e| AmpError::Handshake(format!("{}: {}", base, e)))?;
        if response.status() != StatusCode::OK {
            return Err(AmpError::Handshake(format!(
                "{} answered {}",
                base,
                response.status()
            )));
        }
        let peer_name = parse_handshake(&response.text().await?)?;
        let peer_id = resolve_instance(&storage, peer_name.as_deref())?;

        if peer_id == instance_id {
            return Err(AmpError::Handshake(match peer_name {
                Some(name) => format!("peer {} is this instance", name),
                None => "neither side has an instance configured".to_string(),
            }));
        }

        tracing::info!(
            "Syncing from {} ({})",
            base,
            peer_name.as_deref().unwrap_or("no instance")
        );

        Ok(Self {
            storage,
            client,
            base,
            layout: Layout::from_config(config),
            health: HealthMonitor::from_config(&config.health),
            instance_id,
            peer_id,
            max_num_conn: config.server.sync_max_num_conn.max(1),
            in_progress: HashSet::new(),
            pending: VecDeque::new(),
            cursor: 0,
            exhausted: false,
            idle_timeout: Duration::from_secs(config.server.idle_timeout),
            stats: SyncStats::default(),
        })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Runs the pull loop
    ///
    /// With `single_action` one sweep over the peer's documents is made.
    /// Otherwise the sweep restarts after `idle-timeout` seconds.
    pub async fn run(&mut self, single_action: bool) -> Result<SyncStats, AmpError> {
        let mut in_flight = JoinSet::new();

        loop {
            self.fill(&mut in_flight)?;

            match in_flight.join_next().await {
                Some(joined) => {
                    let stage = joined?;
                    self.complete(stage, &mut in_flight)?;
                }
                None => {
                    if single_action {
                        break;
                    }
                    tracing::debug!("Nothing left to pull, sleeping");
                    tokio::time::sleep(self.idle_timeout).await;
                    self.cursor = 0;
                    self.exhausted = false;
                }
            }
        }

        tracing::info!(
            "Sync finished: {} pulled, {} failed, {} released",
            self.stats.pulled,
            self.stats.failed,
            self.stats.released
        );
        Ok(self.stats)
    }

    fn fill(&mut self, in_flight: &mut JoinSet<Stage>) -> Result<(), AmpError> {
        while in_flight.len() < self.max_num_conn {
            let url_id = match self.next_candidate()? {
                Some(url_id) => url_id,
                None => break,
            };

            self.in_progress.insert(url_id);
            let client = self.client.clone();
            let headers_url = self.part_url(url_id, Part::Headers);
            let body_url = self.part_url(url_id, Part::Body);
            let header_path = self.layout.loose_path(url_id, Part::Headers);
            let body_path = self.layout.loose_path(url_id, Part::Body);

            tracing::debug!("Pulling URL {}", url_id);
            in_flight.spawn(async move {
                let result = pull(client, headers_url, body_url, header_path, body_path).await;
                Stage::Pulled { url_id, result }
            });
        }
        Ok(())
    }

    /// Next document held by the peer that no task is working on
    fn next_candidate(&mut self) -> Result<Option<i64>, AmpError> {
        loop {
            while let Some(url_id) = self.pending.pop_front() {
                if self.in_progress.contains(&url_id) {
                    continue;
                }
                // Archived documents are shared through their volume
                if self.storage.get_content(url_id)?.is_some() {
                    continue;
                }
                return Ok(Some(url_id));
            }

            if self.exhausted {
                return Ok(None);
            }

            let batch = self
                .storage
                .documents_held_by(self.peer_id, self.cursor, CANDIDATE_BATCH)?;
            match batch.last() {
                Some(&last) => self.cursor = last,
                None => self.exhausted = true,
            }
            self.pending.extend(batch);
        }
    }

    fn complete(&mut self, stage: Stage, in_flight: &mut JoinSet<Stage>) -> Result<(), AmpError> {
        match stage {
            Stage::Pulled { url_id, result } => {
                let size = match result {
                    Ok(size) => size,
                    Err(e) => {
                        tracing::warn!("Pull of URL {} failed: {}", url_id, e);
                        self.in_progress.remove(&url_id);
                        self.stats.failed += 1;
                        return self.health.record(true);
                    }
                };

                match self.instance_id {
                    Some(own) => self.storage.set_locality(url_id, own)?,
                    None => self.storage.delete_locality(url_id)?,
                }
                tracing::debug!("Pulled {} bytes for URL {}", size, url_id);
                self.stats.pulled += 1;

                let client = self.client.clone();
                let urls = [
                    self.part_url(url_id, Part::Body),
                    self.part_url(url_id, Part::Headers),
                ];
                in_flight.spawn(async move {
                    let result = release(client, urls).await;
                    Stage::Released { url_id, result }
                });
                self.health.record(false)
            }
            Stage::Released { url_id, result } => {
                self.in_progress.remove(&url_id);
                match result {
                    Ok(()) => self.stats.released += 1,
                    Err(e) => tracing::warn!("Remote delete of URL {} failed: {}", url_id, e),
                }
                Ok(())
            }
        }
    }

    fn part_url(&self, url_id: i64, part: Part) -> String {
        format!(
            "{}/{}/{}",
            self.base,
            self.layout.schema(),
            member_name(url_id, part)
        )
    }
}

/// Copies both parts of one document into the loose tier
async fn pull(
    client: Client,
    headers_url: String,
    body_url: String,
    header_path: PathBuf,
    body_path: PathBuf,
) -> Result<u64, AmpError> {
    let headers = check_status(client.get(&headers_url).send().await?, &[StatusCode::OK])?;
    let header_block = headers.bytes().await?.to_vec();

    let body = check_status(
        client.get(&body_url).send().await?,
        &[StatusCode::OK, StatusCode::NO_CONTENT],
    )?;
    let body = (body.status() == StatusCode::OK).then_some(body);

    store(body, header_block, header_path, body_path).await
}

/// Deletes the peer's copy, body first
async fn release(client: Client, urls: [String; 2]) -> Result<(), AmpError> {
    for url in &urls {
        check_status(client.delete(url).send().await?, &[StatusCode::OK])?;
    }
    Ok(())
}

fn check_status(response: Response, accepted: &[StatusCode]) -> Result<Response, AmpError> {
    if accepted.contains(&response.status()) {
        Ok(response)
    } else {
        Err(AmpError::Peer {
            url: response.url().to_string(),
            status: response.status().as_u16(),
        })
    }
}
