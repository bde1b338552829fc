//! HTTP fetcher implementation
//!
//! This module drives the download stage of the pipeline, including:
//! - Building the HTTP client (user agent, timeouts, redirects, proxy)
//! - A bounded set of concurrent transfers fed from the download queue
//! - Redirect canonicalization into `redirect` edges or alias pairs
//! - Content-type filtering before the body is captured
//! - Error recording and Retry-After backoff holds

use crate::config::{Config, DownloadConfig};
use crate::crawler::health::HealthMonitor;
use crate::crawler::notify::Waiter;
use crate::crawler::scheduler::Scheduler;
use crate::policy::{resolve_instance, HoldPolicy};
use crate::storage::{
    channel_name, DownloadQueueItem, Storage, StorageError, DOWNLOAD_READY, PARSE_READY,
};
use crate::url::normalize_url;
use crate::volume::{Layout, Part};
use crate::AmpError;
use chrono::Utc;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{redirect::Policy, Client, Proxy, Response};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;

/// Counters of one fetcher run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Documents stored with their body
    pub fetched: usize,
    /// Documents stored as headers only because of their content type
    pub rejected: usize,
    /// Redirects onto an already fetched URL
    pub aliased: usize,
    /// Transport errors and non-2xx responses
    pub failed: usize,
}

/// A transfer task finished one of its two phases
enum Stage {
    /// Response headers arrived (or the request failed)
    Headers {
        item: DownloadQueueItem,
        result: Result<Response, reqwest::Error>,
    },
    /// Loose files were written
    Stored {
        item: DownloadQueueItem,
        target_id: i64,
        with_body: bool,
        result: Result<u64, AmpError>,
    },
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The download configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client (e.g. a bad proxy URL)
pub fn build_http_client(config: &DownloadConfig) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.timeout))
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .redirect(Policy::limited(config.max_redirects))
        .gzip(true)
        .brotli(true);

    if let (Some(host), Some(port)) = (&config.proxy_host, config.proxy_port) {
        builder = builder.proxy(Proxy::all(format!("socks5h://{}:{}", host, port))?);
    }

    builder.build()
}

/// Returns true if a response with this Content-Type gets its body stored
///
/// Parameters are ignored; `text/html` is always accepted.
pub fn is_accepted(content_type: &str, whitelist: &[String]) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    media_type == "text/html"
        || whitelist
            .iter()
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(&media_type))
}

/// The download worker
///
/// Database work happens on the control loop only; transfer tasks do
/// network and file I/O and report back through a [`JoinSet`] whose size
/// never exceeds `max-num-conn`.
pub struct Fetcher<S: Storage> {
    storage: S,
    client: Client,
    layout: Layout,
    scheduler: Scheduler,
    health: HealthMonitor,
    holds: HoldPolicy,
    instance_id: Option<i64>,
    /// URL ids whose loose files an in-flight task may write
    claimed: HashSet<i64>,
    max_num_conn: usize,
    mime_whitelist: Vec<String>,
    notification_threshold: usize,
    unannounced: usize,
    poll_interval: Duration,
    idle_timeout: Duration,
    stats: FetchStats,
}

impl<S: Storage> Fetcher<S> {
    /// Creates a fetcher
    ///
    /// # Returns
    ///
    /// * `Ok(Fetcher)` - Ready to run
    /// * `Err(AmpError::UnknownInstance)` - The configured instance is not registered
    /// * `Err(AmpError)` - The HTTP client could not be built
    pub fn new(storage: S, config: &Config) -> Result<Self, AmpError> {
        let instance_id = resolve_instance(&storage, config.instance.name.as_deref())?;
        let client = build_http_client(&config.download)?;

        Ok(Self {
            storage,
            client,
            layout: Layout::from_config(config),
            scheduler: Scheduler::new(instance_id),
            health: HealthMonitor::from_config(&config.health),
            holds: HoldPolicy::new(config.download.max_hold),
            instance_id,
            claimed: HashSet::new(),
            max_num_conn: config.download.max_num_conn.max(1),
            mime_whitelist: config.download.mime_whitelist.clone(),
            notification_threshold: config.download.notification_threshold.max(1),
            unannounced: 0,
            poll_interval: Duration::from_millis(config.server.poll_interval),
            idle_timeout: Duration::from_secs(config.server.idle_timeout),
            stats: FetchStats::default(),
        })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    /// Runs the download loop
    ///
    /// With `single_action` the queue is sampled once, the claimed
    /// transfers are completed and the call returns. Otherwise the fetcher
    /// refills free slots after every completion and waits for a
    /// `download_ready` notification whenever it runs dry.
    pub async fn run(&mut self, single_action: bool) -> Result<FetchStats, AmpError> {
        let mut waiter = Waiter::subscribe(
            &self.storage,
            channel_name(DOWNLOAD_READY, None),
            self.poll_interval,
            self.idle_timeout,
        )?;
        let mut in_flight = JoinSet::new();
        let mut filling = true;

        loop {
            if filling {
                self.fill(&mut in_flight)?;
                filling = !single_action;
            }

            match in_flight.join_next().await {
                Some(joined) => {
                    let stage = joined?;
                    self.complete(stage, &mut in_flight)?;
                }
                None => {
                    self.announce()?;
                    if single_action {
                        break;
                    }
                    tracing::debug!("Download queue is empty, waiting on {}", waiter.channel());
                    waiter.wait(&self.storage).await?;
                }
            }
        }

        tracing::info!(
            "Fetcher finished: {} fetched, {} rejected, {} aliased, {} failed",
            self.stats.fetched,
            self.stats.rejected,
            self.stats.aliased,
            self.stats.failed
        );
        Ok(self.stats)
    }

    /// Claims work until every slot is busy or the queue has nothing eligible
    fn fill(&mut self, in_flight: &mut JoinSet<Stage>) -> Result<(), AmpError> {
        while in_flight.len() < self.max_num_conn {
            let now = Utc::now().timestamp();
            let item = match self.scheduler.next(&mut self.storage, now)? {
                Some(item) => item,
                None => break,
            };

            let record = match self.storage.get_url(item.url_id) {
                Ok(record) => record,
                Err(StorageError::UrlNotFound(id)) => {
                    tracing::warn!("Queued URL {} no longer exists", id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            // Typically reached earlier as the target of a redirect
            if record.checked_at.is_some() {
                tracing::debug!("Skipping {}, already fetched", record.url);
                continue;
            }
            if self.claimed.contains(&item.url_id) {
                tracing::debug!("Skipping {}, stored as a redirect target", record.url);
                continue;
            }

            tracing::debug!("Fetching {}", record.url);
            self.claimed.insert(item.url_id);
            let client = self.client.clone();
            in_flight.spawn(async move {
                let result = client.get(&record.url).send().await;
                Stage::Headers { item, result }
            });
        }
        Ok(())
    }

    fn complete(&mut self, stage: Stage, in_flight: &mut JoinSet<Stage>) -> Result<(), AmpError> {
        match stage {
            Stage::Headers { item, result } => self.on_headers(item, result, in_flight),
            Stage::Stored {
                item,
                target_id,
                with_body,
                result,
            } => self.on_stored(item, target_id, with_body, result),
        }
    }

    fn on_headers(
        &mut self,
        item: DownloadQueueItem,
        result: Result<Response, reqwest::Error>,
        in_flight: &mut JoinSet<Stage>,
    ) -> Result<(), AmpError> {
        self.claimed.remove(&item.url_id);
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let code = e.status().map(|status| status.as_u16());
                return self.fail(item, code, &e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            if let Some(retry_after) = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
            {
                if let Some(until) = self.holds.hold_until(retry_after, Utc::now()) {
                    tracing::info!("Holding host {} until {}", item.host_id, until);
                    self.storage.set_host_hold(item.host_id, until)?;
                }
            }
            return self.fail(item, Some(status.as_u16()), &format!("HTTP {}", status));
        }

        let effective = match normalize_url(response.url().as_str()) {
            Ok(url) => url,
            Err(e) => return self.fail(item, None, &format!("bad effective URL: {}", e)),
        };

        let mut target_id = item.url_id;
        if self.storage.get_url(item.url_id)?.url != effective.as_str() {
            let (to_id, _) = self.storage.insert_url(effective.as_str())?;
            if to_id != item.url_id {
                if self.storage.is_checked(to_id)? {
                    tracing::debug!("URL {} redirects to known {}", item.url_id, effective);
                    self.storage.insert_alias(item.url_id, to_id)?;
                    self.storage.mark_checked(item.url_id)?;
                    self.stats.aliased += 1;
                    return self.health.record(false);
                }

                let stored = self.storage.insert_redirect(item.url_id, to_id)?;
                if stored != to_id {
                    return Err(AmpError::DataIntegrity {
                        from_id: item.url_id,
                        existing: stored,
                        requested: to_id,
                    });
                }

                // Another transfer of this batch is already storing the target
                if self.claimed.contains(&to_id) {
                    tracing::debug!(
                        "URL {} redirects to {}, stored by another task",
                        item.url_id,
                        to_id
                    );
                    self.storage.mark_checked(item.url_id)?;
                    return self.health.record(false);
                }
                target_id = to_id;
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let with_body = is_accepted(&content_type, &self.mime_whitelist);
        if !with_body {
            tracing::debug!("Not capturing {} body of {}", content_type, effective);
        }

        let header_block = render_headers(&response);
        let header_path = self.layout.loose_path(target_id, Part::Headers);
        let body_path = self.layout.loose_path(target_id, Part::Body);
        let body = with_body.then_some(response);

        self.claimed.insert(target_id);
        in_flight.spawn(async move {
            let result = store(body, header_block, header_path, body_path).await;
            Stage::Stored {
                item,
                target_id,
                with_body,
                result,
            }
        });
        Ok(())
    }

    fn on_stored(
        &mut self,
        item: DownloadQueueItem,
        target_id: i64,
        with_body: bool,
        result: Result<u64, AmpError>,
    ) -> Result<(), AmpError> {
        self.claimed.remove(&target_id);
        let size = match result {
            Ok(size) => size,
            Err(e) => return self.fail(item, None, &e.to_string()),
        };

        self.storage.mark_checked(item.url_id)?;
        if target_id != item.url_id {
            self.storage.mark_checked(target_id)?;
        }
        if let Some(instance_id) = self.instance_id {
            self.storage.set_locality(target_id, instance_id)?;
        }

        if with_body {
            tracing::debug!("Stored {} bytes for URL {}", size, target_id);
            self.storage.enqueue_parse(target_id)?;
            self.stats.fetched += 1;
            self.unannounced += 1;
            if self.unannounced >= self.notification_threshold {
                self.announce()?;
            }
        } else {
            self.stats.rejected += 1;
        }

        self.health.record(false)
    }

    /// Records a failed transfer; fatal only through the health monitor
    fn fail(
        &mut self,
        item: DownloadQueueItem,
        code: Option<u16>,
        message: &str,
    ) -> Result<(), AmpError> {
        tracing::warn!("Download of URL {} failed: {}", item.url_id, message);
        self.storage.record_download_error(item.url_id, code, message)?;
        self.storage.mark_checked(item.url_id)?;
        self.stats.failed += 1;
        self.health.record(true)
    }

    /// Wakes parsers if documents were enqueued since the last notification
    fn announce(&mut self) -> Result<(), AmpError> {
        if self.unannounced == 0 {
            return Ok(());
        }
        self.storage.notify(&channel_name(PARSE_READY, self.instance_id))?;
        tracing::info!(
            "{} documents ready for parsing ({} fetched so far)",
            self.unannounced,
            self.stats.fetched
        );
        self.unannounced = 0;
        Ok(())
    }
}

/// Serializes the status line and headers the way they came off the wire
fn render_headers(response: &Response) -> Vec<u8> {
    let mut block = format!("{:?} {}\r\n", response.version(), response.status()).into_bytes();
    for (name, value) in response.headers() {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    block.extend_from_slice(b"\r\n");
    block
}

/// Writes the loose files of one document
///
/// The body goes first, so an existing header file always means the body
/// write (if any) completed. Both writes overwrite, which makes a repeated
/// fetch of the same URL safe.
pub(crate) async fn store(
    response: Option<Response>,
    header_block: Vec<u8>,
    header_path: PathBuf,
    body_path: PathBuf,
) -> Result<u64, AmpError> {
    if let Some(dir) = header_path.parent() {
        fs::create_dir_all(dir).await?;
    }

    let mut size = 0;
    if let Some(response) = response {
        let mut file = fs::File::create(&body_path).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
    }

    fs::write(&header_path, &header_block).await?;
    Ok(size)
}
