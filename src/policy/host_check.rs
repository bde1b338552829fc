use crate::storage::Storage;
use crate::url::{host_key, registrable_domain};
use crate::AmpError;
use std::collections::HashMap;
use url::Url;

/// Resolves the configured instance name to its id
///
/// An unset name means a single-instance deployment. A name that is not
/// registered is a fatal misconfiguration.
pub fn resolve_instance<S: Storage>(
    storage: &S,
    name: Option<&str>,
) -> Result<Option<i64>, AmpError> {
    match name {
        None => Ok(None),
        Some(name) => storage
            .get_instance_id(name)?
            .map(Some)
            .ok_or_else(|| AmpError::UnknownInstance(name.to_string())),
    }
}

/// In-memory host whitelist
///
/// Loaded once per worker; hosts registered after startup are picked up on
/// the next restart.
#[derive(Debug, Clone)]
pub struct HostCheck {
    hosts: HashMap<String, i64>,
    match_domain: bool,
}

impl HostCheck {
    /// Loads the whitelist
    ///
    /// # Arguments
    ///
    /// * `storage` - The queue store
    /// * `instance_id` - Only load hosts owned by this instance
    /// * `match_domain` - Key hosts by registrable domain instead of full name
    pub fn load<S: Storage>(
        storage: &S,
        instance_id: Option<i64>,
        match_domain: bool,
    ) -> Result<Self, AmpError> {
        let mut hosts = HashMap::new();
        for record in storage.load_hosts(instance_id)? {
            let hostname = record.hostname.to_lowercase();
            let key = if match_domain {
                registrable_domain(&hostname).to_string()
            } else {
                hostname
            };
            // Lowest id wins when several hosts share a domain
            hosts.entry(key).or_insert(record.id);
        }

        tracing::debug!("Loaded {} whitelisted hosts", hosts.len());
        Ok(Self {
            hosts,
            match_domain,
        })
    }

    /// Returns the host id of a URL, or `None` if the host is not whitelisted
    pub fn host_id(&self, url: &Url) -> Option<i64> {
        host_key(url, self.match_domain).and_then(|key| self.hosts.get(&key).copied())
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
