use std::time::Duration;

use anyhow::Context;
use gateway_lib::SyncOptions;
use serde::Deserialize;
use url::Url;

/// Environment configuration, every variable prefixed with `GATEWAY_`.
#[derive(Deserialize, Debug, Clone)]
pub struct GatewayConfig {
    /// Comma-separated peer endpoints, e.g.
    /// `http://lon-4.eu-west-1.arweave.net:1984,http://peer-2:1984`.
    pub nodes: String,
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_fetch_retry_limit")]
    pub fetch_retry_limit: u32,
    #[serde(default = "default_max_fork_depth")]
    pub max_fork_depth: u64,
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
}

fn default_parallel() -> usize {
    36
}

fn default_http_timeout_seconds() -> u64 {
    15
}

fn default_poll_interval_seconds() -> u64 {
    30
}

fn default_batch_size() -> usize {
    gateway_lib::DEFAULT_FLUSH_THRESHOLD
}

fn default_fetch_retry_limit() -> u32 {
    250
}

fn default_max_fork_depth() -> u64 {
    100
}

fn default_keyspace() -> String {
    "gateway".to_owned()
}

pub fn get_gateway_config() -> anyhow::Result<GatewayConfig> {
    Ok(envy::prefixed("GATEWAY_").from_env::<GatewayConfig>()?)
}

impl GatewayConfig {
    pub fn peer_urls(&self) -> anyhow::Result<Vec<Url>> {
        self.nodes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Url::parse(s).with_context(|| format!("invalid peer endpoint: {s}")))
            .collect()
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            parallel_fetches: self.parallel,
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            fetch_retry_limit: self.fetch_retry_limit,
            max_fork_depth: self.max_fork_depth,
            ..SyncOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_urls_split_and_validate() {
        let config = GatewayConfig {
            nodes: "http://peer-a:1984, http://peer-b:1984 ,".to_owned(),
            parallel: default_parallel(),
            http_timeout_seconds: default_http_timeout_seconds(),
            poll_interval_seconds: default_poll_interval_seconds(),
            batch_size: default_batch_size(),
            fetch_retry_limit: default_fetch_retry_limit(),
            max_fork_depth: default_max_fork_depth(),
            keyspace: default_keyspace(),
        };
        let urls = config.peer_urls().unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[1].as_str(), "http://peer-b:1984/");

        let bad = GatewayConfig {
            nodes: "not a url".to_owned(),
            ..config
        };
        assert!(bad.peer_urls().is_err());
    }
}
