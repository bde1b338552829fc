//! Link extraction worker
//!
//! This module handles:
//! - Streaming link extraction from stored HTML (`a[href]`, `<head><base>`)
//! - Host whitelisting, regex and length filtering of discovered links
//! - Deduplication through the bounded memory cache
//! - Enqueueing new URLs with the configured priority strategy

use crate::config::Config;
use crate::crawler::notify::Waiter;
use crate::policy::{make_preference, resolve_instance, HostCheck, MemCache, Preference};
use crate::storage::{channel_name, Storage, StorageError, DOWNLOAD_READY, PARSE_READY};
use crate::url::{resolve_link, FilterVerdict, LinkFilter};
use crate::volume::{Layout, Part, VolumeHolder};
use crate::AmpError;
use lol_html::{element, HtmlRewriter, Settings};
use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;
use std::time::Duration;
use url::Url;

const CHUNK_SIZE: usize = 8192;

/// Raw link targets of one document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedLinks {
    /// First `<base href>` inside `<head>`
    pub base: Option<String>,
    /// Every `<a href>` in document order
    pub hrefs: Vec<String>,
}

impl ExtractedLinks {
    /// Absolute canonical links, resolved against the base if there is one
    pub fn resolve(&self, document_url: &Url) -> Vec<Url> {
        let base = self
            .base
            .as_deref()
            .and_then(|base| document_url.join(base.trim()).ok())
            .unwrap_or_else(|| document_url.clone());

        self.hrefs
            .iter()
            .filter_map(|href| resolve_link(&base, href).ok())
            .collect()
    }
}

/// Extracts link targets from an HTML stream
///
/// The document is fed through the rewriter in fixed-size chunks, so memory
/// use does not depend on document size.
pub fn extract_links<R: Read>(mut reader: R) -> Result<ExtractedLinks, AmpError> {
    let hrefs = Rc::new(RefCell::new(Vec::new()));
    let base = Rc::new(RefCell::new(None));
    let href_sink = Rc::clone(&hrefs);
    let base_sink = Rc::clone(&base);

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("head base[href]", move |el| {
                    let mut base = base_sink.borrow_mut();
                    if base.is_none() {
                        *base = el.get_attribute("href");
                    }
                    Ok(())
                }),
                element!("a[href]", move |el| {
                    if let Some(href) = el.get_attribute("href") {
                        href_sink.borrow_mut().push(href);
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        |_: &[u8]| {},
    );

    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        rewriter.write(&buf[..n])?;
    }
    rewriter.end()?;

    let links = ExtractedLinks {
        base: base.take(),
        hrefs: hrefs.take(),
    };
    Ok(links)
}

/// Counters of one parser run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub parsed: usize,
    /// Documents that could not be read or parsed
    pub failed: usize,
    /// Newly discovered URLs put on the download queue
    pub enqueued: usize,
}

/// The parse worker
pub struct Parser<S: Storage> {
    storage: S,
    holder: VolumeHolder,
    hosts: HostCheck,
    filter: LinkFilter,
    cache: MemCache,
    preference: Box<dyn Preference>,
    instance_id: Option<i64>,
    page_limit: usize,
    notification_threshold: usize,
    unannounced: usize,
    poll_interval: Duration,
    idle_timeout: Duration,
    stats: ParseStats,
}

impl<S: Storage> Parser<S> {
    /// Creates a parser
    ///
    /// Links are checked against every whitelisted host, whichever
    /// instance owns it; the fetcher of that instance picks them up.
    pub fn new(storage: S, config: &Config) -> Result<Self, AmpError> {
        let instance_id = resolve_instance(&storage, config.instance.name.as_deref())?;
        let hosts = HostCheck::load(&storage, None, config.instance.match_domain)?;
        if hosts.is_empty() {
            tracing::warn!("No whitelisted hosts, every link will be dropped");
        }

        Ok(Self {
            storage,
            holder: VolumeHolder::new(Layout::from_config(config)),
            hosts,
            filter: LinkFilter::from_config(&config.parse)?,
            cache: MemCache::new(config.parse.cache_high_mark, config.parse.cache_low_mark),
            preference: make_preference(config.download.preference, &config.parse),
            instance_id,
            page_limit: config.parse.page_limit,
            notification_threshold: config.parse.notification_threshold.max(1),
            unannounced: 0,
            poll_interval: Duration::from_millis(config.server.poll_interval),
            idle_timeout: Duration::from_secs(config.server.idle_timeout),
            stats: ParseStats::default(),
        })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Runs the parse loop
    ///
    /// With `single_action` one pass is made over the parse queue. Otherwise
    /// the parser waits for a `parse_ready` notification whenever the queue
    /// is drained. Either way it returns once `page-limit` documents have
    /// been processed.
    pub async fn run(&mut self, single_action: bool) -> Result<ParseStats, AmpError> {
        let mut waiter = Waiter::subscribe(
            &self.storage,
            channel_name(PARSE_READY, self.instance_id),
            self.poll_interval,
            self.idle_timeout,
        )?;

        loop {
            let drained = self.pass()?;
            if single_action || self.limit_reached() {
                break;
            }
            if drained {
                self.holder.release();
                tracing::debug!("Parse queue is empty, waiting on {}", waiter.channel());
                waiter.wait(&self.storage).await?;
            }
        }

        tracing::info!(
            "Parser finished: {} parsed, {} failed, {} URLs enqueued",
            self.stats.parsed,
            self.stats.failed,
            self.stats.enqueued
        );
        Ok(self.stats)
    }

    /// Processes queued documents until the queue is empty or the page limit is hit
    ///
    /// # Returns
    ///
    /// True if the queue was drained
    pub fn pass(&mut self) -> Result<bool, AmpError> {
        let mut count = 0;
        let mut drained = false;

        while !self.limit_reached() {
            let url_id = match self.storage.dequeue_parse()? {
                Some(url_id) => url_id,
                None => {
                    drained = true;
                    break;
                }
            };

            self.parse_document(url_id)?;
            count += 1;
            if count % self.notification_threshold == 0 {
                self.announce()?;
            }
        }

        self.preference.mark_batch();
        self.announce()?;
        Ok(drained)
    }

    /// True once this process has handled `page-limit` documents
    fn limit_reached(&self) -> bool {
        self.page_limit > 0 && self.stats.parsed + self.stats.failed >= self.page_limit
    }

    /// Extracts and enqueues the links of one document, then marks it parsed
    pub fn parse_document(&mut self, url_id: i64) -> Result<(), AmpError> {
        let record = match self.storage.get_url(url_id) {
            Ok(record) => record,
            Err(StorageError::UrlNotFound(id)) => {
                tracing::warn!("Parse item {} no longer exists", id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.extract(url_id, &record.url) {
            Ok(links) => {
                for link in links {
                    self.offer(link)?;
                }
                self.stats.parsed += 1;
            }
            Err(e) => {
                tracing::warn!("Cannot parse {}: {}", record.url, e);
                self.storage.record_parse_error(url_id, &e.to_string())?;
                self.stats.failed += 1;
            }
        }

        self.storage.mark_parsed(url_id)?;
        Ok(())
    }

    /// Links of a stored document; non-HTML documents have none
    fn extract(&mut self, url_id: i64, url: &str) -> Result<Vec<Url>, AmpError> {
        let document_url = Url::parse(url)?;

        let content_type = self
            .holder
            .content_type(&self.storage, url_id)?
            .ok_or_else(|| missing(url_id, Part::Headers))?;
        if !is_html(&content_type) {
            tracing::debug!("{} is {}, no links", url, content_type);
            return Ok(Vec::new());
        }

        let reader = self
            .holder
            .open(&self.storage, url_id, Part::Body)?
            .ok_or_else(|| missing(url_id, Part::Body))?;
        Ok(extract_links(reader)?.resolve(&document_url))
    }

    /// Runs one link through the filters and enqueues it if it is new
    fn offer(&mut self, link: Url) -> Result<(), AmpError> {
        let host_id = match self.hosts.host_id(&link) {
            Some(host_id) => host_id,
            None => return Ok(()),
        };

        let verdict = self.filter.check(link.as_str());
        if verdict != FilterVerdict::Accept {
            tracing::trace!("Dropping {}: {:?}", link, verdict);
            return Ok(());
        }

        if self.cache.check(link.as_str()) {
            return Ok(());
        }

        let (url_id, created) = self.storage.insert_url(link.as_str())?;
        if created {
            let priority = self.preference.prioritize(link.as_str());
            if self.storage.enqueue_download(url_id, priority, host_id)? {
                self.stats.enqueued += 1;
                self.unannounced += 1;
            }
        }
        Ok(())
    }

    /// Wakes fetchers if URLs were enqueued since the last notification
    fn announce(&mut self) -> Result<(), AmpError> {
        if self.unannounced == 0 {
            return Ok(());
        }
        self.storage.notify(&channel_name(DOWNLOAD_READY, None))?;
        tracing::info!(
            "{} new URLs ready for download ({} parsed so far)",
            self.unannounced,
            self.stats.parsed
        );
        self.unannounced = 0;
        Ok(())
    }
}

fn is_html(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case("text/html"))
}

fn missing(url_id: i64, part: Part) -> AmpError {
    AmpError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no {:?} stored for URL {}", part, url_id),
    ))
}
