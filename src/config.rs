use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::Storage;

/// Static description of what a backend supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub writable: bool,
    pub readable: bool,
    /// Whether the backend supports deletes, the way replication queues do.
    pub is_queue: bool,
    pub can_long_poll: bool,
    /// The `http://host:port` and optional path, without a trailing slash,
    /// that `/camli/*` gets appended to.
    pub url_base: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            writable: true,
            readable: true,
            is_queue: false,
            can_long_poll: false,
            url_base: None,
        }
    }
}

impl Config {
    pub fn queue() -> Self {
        Self {
            is_queue: true,
            ..Default::default()
        }
    }

    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_readable(mut self, readable: bool) -> Self {
        self.readable = readable;
        self
    }

    pub fn with_long_poll(mut self, can_long_poll: bool) -> Self {
        self.can_long_poll = can_long_poll;
        self
    }

    pub fn with_url_base(mut self, url_base: impl Into<String>) -> Self {
        let mut url_base = url_base.into();
        while url_base.ends_with('/') {
            url_base.pop();
        }
        self.url_base = Some(url_base);
        self
    }

    /// The wait a backend with this config actually honors.
    pub fn effective_wait(&self, wait: Duration) -> Duration {
        if self.can_long_poll {
            wait
        } else {
            Duration::ZERO
        }
    }

    /// The externally reachable URL of `path` below `/camli/`.
    pub fn camli_url(&self, path: &str) -> Option<String> {
        let base = self.url_base.as_deref()?;
        Some(format!("{base}/camli/{}", path.trim_start_matches('/')))
    }
}

/// Everything a caller may want to know about a backend before talking to it,
/// gathered once instead of probing on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub config: Config,
    pub max_enumerate: Option<usize>,
    pub can_create_queues: bool,
    pub can_wrap_context: bool,
}

impl Capabilities {
    pub fn of(storage: &dyn Storage) -> Self {
        let config = storage
            .as_configer()
            .map(|configer| configer.config())
            .unwrap_or_default();

        Self {
            config,
            max_enumerate: storage
                .as_max_enumerate_config()
                .map(|max| max.max_enumerate()),
            can_create_queues: storage.as_queue_creator().is_some(),
            can_wrap_context: storage.as_context_wrapper().is_some(),
        }
    }

    /// Backends that cannot long-poll treat any wait as zero.
    pub fn effective_wait(&self, wait: Duration) -> Duration {
        self.config.effective_wait(wait)
    }

    /// Bound an enumerate `limit` to what the backend serves in a single call.
    pub fn clamp_limit(&self, limit: usize) -> usize {
        match self.max_enumerate {
            Some(max) => limit.min(max),
            None => limit,
        }
    }

    pub fn allows_receive(&self) -> bool {
        self.config.writable
    }

    pub fn allows_fetch(&self) -> bool {
        self.config.readable
    }

    pub fn allows_remove(&self) -> bool {
        self.config.is_queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camli_urls() {
        let config = Config::default();
        assert_eq!(config.camli_url("sha1-abc"), None);

        let config = config.with_url_base("http://localhost:3179/bs/");
        assert_eq!(config.url_base.as_deref(), Some("http://localhost:3179/bs"));
        assert_eq!(
            config.camli_url("/stat").as_deref(),
            Some("http://localhost:3179/bs/camli/stat")
        );
    }

    #[test]
    fn queue_config_allows_deletes() {
        let config = Config::queue();
        assert!(config.is_queue);
        assert!(config.writable && config.readable);
        assert!(!Config::default().is_queue);
    }

    #[test]
    fn waits_need_long_poll() {
        let wait = Duration::from_secs(5);
        assert_eq!(Config::default().effective_wait(wait), Duration::ZERO);
        assert_eq!(Config::default().with_long_poll(true).effective_wait(wait), wait);
    }
}
