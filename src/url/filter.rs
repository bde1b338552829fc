use crate::config::ParseConfig;
use crate::AmpError;
use regex::{Regex, RegexBuilder};

/// Outcome of running an extracted link through the [`LinkFilter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Accept,
    Blacklisted,
    NotWhitelisted,
    TooLong,
}

/// Regex and length rules applied to links before they are enqueued
#[derive(Debug, Clone)]
pub struct LinkFilter {
    blacklist: Regex,
    whitelist: Option<Regex>,
    max_length: usize,
}

impl LinkFilter {
    /// Compiles the filter from the parser configuration
    ///
    /// Both patterns are case-insensitive.
    pub fn from_config(config: &ParseConfig) -> Result<Self, AmpError> {
        let blacklist = RegexBuilder::new(&config.url_blacklist_rx)
            .case_insensitive(true)
            .build()?;
        let whitelist = config
            .url_whitelist_rx
            .as_deref()
            .map(|rx| RegexBuilder::new(rx).case_insensitive(true).build())
            .transpose()?;

        Ok(Self {
            blacklist,
            whitelist,
            max_length: config.max_url_length,
        })
    }

    /// Checks a canonical URL against the blacklist, whitelist and length limit
    pub fn check(&self, url: &str) -> FilterVerdict {
        if self.blacklist.is_match(url) {
            return FilterVerdict::Blacklisted;
        }

        if let Some(whitelist) = &self.whitelist {
            if !whitelist.is_match(url) {
                return FilterVerdict::NotWhitelisted;
            }
        }

        if url.len() > self.max_length {
            return FilterVerdict::TooLong;
        }

        FilterVerdict::Accept
    }
}
