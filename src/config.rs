//! Node configuration for the gossip transport and generation protocol.
//!
//! # Environment Variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `BROKER_ORDINAL` | `0` | This broker's ordinal |
//! | `GOSSIP_HOST` | `0.0.0.0` | Listen host |
//! | `GOSSIP_ADVERTISED_HOST` | `GOSSIP_HOST`, or `127.0.0.1` for `0.0.0.0` | Name peers know this node by |
//! | `GOSSIP_PORT` | `7946` | Listen port |
//! | `GOSSIP_PEERS` | empty | `1=host:port,2=host:port` |
//! | `GOSSIP_CONNECT_TIMEOUT_MS` | `5000` | Connect plus handshake deadline |
//! | `GOSSIP_REQUEST_TIMEOUT_MS` | `10000` | Per-request deadline |
//! | `WAIT_FOR_UP_INTERVAL_MS` | `200` | Startup barrier poll interval |
//! | `WAIT_FOR_UP_MAX_WAIT_SECS` | `600` | Startup barrier ceiling |
//! | `TRANSITION_TIMEOUT_MS` | `30000` | Follower acknowledgement deadline |
//! | `PROPOSAL_TIMEOUT_SECS` | `120` | Age at which proposals are cancelled |
//! | `PROPOSAL_SWEEP_INTERVAL_SECS` | `15` | Sweep interval |
//! | `MAX_CONCURRENT_STREAMS` | `2048` | HTTP/2 streams per inbound connection |

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_GOSSIP_PORT, DEFAULT_MAX_CONCURRENT_STREAMS,
    DEFAULT_PROPOSAL_SWEEP_INTERVAL, DEFAULT_PROPOSAL_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_TRANSITION_TIMEOUT, WAIT_FOR_UP_INTERVAL, WAIT_FOR_UP_MAX_WAIT,
};
use crate::gossip::PeerTimeouts;
use crate::types::Ordinal;

/// Configuration of one broker node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipConfig {
    pub ordinal: Ordinal,
    pub host: String,
    /// Host name other brokers reach this node under.
    pub advertised_host: String,
    pub port: u16,
    /// Gossip address of every other broker, by ordinal.
    pub peers: BTreeMap<Ordinal, String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub wait_for_up_interval: Duration,
    pub wait_for_up_max_wait: Duration,
    pub transition_timeout: Duration,
    pub proposal_timeout: Duration,
    pub proposal_sweep_interval: Duration,
    pub max_concurrent_streams: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            ordinal: Ordinal(0),
            host: "0.0.0.0".to_string(),
            advertised_host: "127.0.0.1".to_string(),
            port: DEFAULT_GOSSIP_PORT,
            peers: BTreeMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            wait_for_up_interval: WAIT_FOR_UP_INTERVAL,
            wait_for_up_max_wait: WAIT_FOR_UP_MAX_WAIT,
            transition_timeout: DEFAULT_TRANSITION_TIMEOUT,
            proposal_timeout: DEFAULT_PROPOSAL_TIMEOUT,
            proposal_sweep_interval: DEFAULT_PROPOSAL_SWEEP_INTERVAL,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
        }
    }
}

/// Parse `GOSSIP_PEERS`: comma-separated `ordinal=host:port` pairs.
pub fn parse_peers(value: &str) -> Result<BTreeMap<Ordinal, String>, String> {
    let mut peers = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (ordinal, address) = entry
            .split_once('=')
            .ok_or_else(|| format!("peer entry '{entry}' is not ordinal=host:port"))?;
        let ordinal: Ordinal = ordinal
            .parse()
            .map_err(|e| format!("invalid ordinal in '{entry}': {e}"))?;
        let address = address.trim();
        if !address.contains(':') {
            return Err(format!("peer address '{address}' has no port"));
        }
        if peers.insert(ordinal, address.to_string()).is_some() {
            return Err(format!("peer {ordinal} listed twice"));
        }
    }
    Ok(peers)
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| format!("Invalid {name}: {e}")),
        None => Ok(default),
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, String> {
    parse_var(lookup, name, default.as_millis() as u64).map(Duration::from_millis)
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, String> {
    parse_var(lookup, name, default.as_secs()).map(Duration::from_secs)
}

impl GossipConfig {
    /// Load configuration from environment variables, then validate it.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let host = lookup("GOSSIP_HOST").unwrap_or(defaults.host);
        let advertised_host = lookup("GOSSIP_ADVERTISED_HOST").unwrap_or_else(|| {
            if host == "0.0.0.0" {
                "127.0.0.1".to_string()
            } else {
                host.clone()
            }
        });
        let peers = match lookup("GOSSIP_PEERS") {
            Some(value) => parse_peers(&value).map_err(|e| format!("Invalid GOSSIP_PEERS: {e}"))?,
            None => BTreeMap::new(),
        };

        let config = Self {
            ordinal: Ordinal(parse_var(&lookup, "BROKER_ORDINAL", defaults.ordinal.value())?),
            host,
            advertised_host,
            port: parse_var(&lookup, "GOSSIP_PORT", defaults.port)?,
            peers,
            connect_timeout: parse_millis(&lookup, "GOSSIP_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
            request_timeout: parse_millis(&lookup, "GOSSIP_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            wait_for_up_interval: parse_millis(
                &lookup,
                "WAIT_FOR_UP_INTERVAL_MS",
                defaults.wait_for_up_interval,
            )?,
            wait_for_up_max_wait: parse_secs(
                &lookup,
                "WAIT_FOR_UP_MAX_WAIT_SECS",
                defaults.wait_for_up_max_wait,
            )?,
            transition_timeout: parse_millis(
                &lookup,
                "TRANSITION_TIMEOUT_MS",
                defaults.transition_timeout,
            )?,
            proposal_timeout: parse_secs(&lookup, "PROPOSAL_TIMEOUT_SECS", defaults.proposal_timeout)?,
            proposal_sweep_interval: parse_secs(
                &lookup,
                "PROPOSAL_SWEEP_INTERVAL_SECS",
                defaults.proposal_sweep_interval,
            )?,
            max_concurrent_streams: parse_var(
                &lookup,
                "MAX_CONCURRENT_STREAMS",
                defaults.max_concurrent_streams,
            )?,
        };

        if let Err(errors) = config.validate() {
            return Err(format!("Configuration validation failed: {}", errors.join("; ")).into());
        }
        Ok(config)
    }

    /// Validate the configuration and return any errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.peers.contains_key(&self.ordinal) {
            errors.push(format!(
                "GOSSIP_PEERS lists this broker's own ordinal {}",
                self.ordinal
            ));
        }
        if self.wait_for_up_interval.is_zero() {
            errors.push("wait_for_up_interval must be positive".to_string());
        }
        if self.wait_for_up_interval > self.wait_for_up_max_wait {
            errors.push(format!(
                "wait_for_up_interval ({:?}) must not exceed wait_for_up_max_wait ({:?})",
                self.wait_for_up_interval, self.wait_for_up_max_wait
            ));
        }
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            errors.push("peer timeouts must be positive".to_string());
        }
        // A proposal must outlive the attempt that created it.
        if self.proposal_timeout <= self.transition_timeout {
            errors.push(format!(
                "proposal_timeout ({:?}) must be greater than transition_timeout ({:?})",
                self.proposal_timeout, self.transition_timeout
            ));
        }
        if self.proposal_sweep_interval.is_zero() {
            errors.push("proposal_sweep_interval must be positive".to_string());
        }
        if self.max_concurrent_streams == 0 {
            errors.push("max_concurrent_streams must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// `host:port` the gossip server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn peer_timeouts(&self) -> PeerTimeouts {
        PeerTimeouts {
            connect: self.connect_timeout,
            request: self.request_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = GossipConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.wait_for_up_interval, Duration::from_millis(200));
        assert_eq!(config.wait_for_up_max_wait, Duration::from_secs(600));
        assert_eq!(config.max_concurrent_streams, 2048);
    }

    #[test]
    fn test_from_lookup_reads_every_variable() {
        let config = GossipConfig::from_lookup(lookup(&[
            ("BROKER_ORDINAL", "2"),
            ("GOSSIP_HOST", "10.0.0.2"),
            ("GOSSIP_PORT", "7000"),
            ("GOSSIP_PEERS", "1=broker-1:7000, 3=broker-3:7000"),
            ("GOSSIP_CONNECT_TIMEOUT_MS", "250"),
            ("TRANSITION_TIMEOUT_MS", "1500"),
            ("PROPOSAL_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.ordinal, Ordinal(2));
        assert_eq!(config.advertised_host, "10.0.0.2");
        assert_eq!(config.listen_addr(), "10.0.0.2:7000");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[&Ordinal(3)], "broker-3:7000");
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.transition_timeout, Duration::from_millis(1500));
        assert_eq!(config.proposal_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_wildcard_host_advertises_loopback() {
        let config = GossipConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.advertised_host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_values_are_reported() {
        assert!(GossipConfig::from_lookup(lookup(&[("GOSSIP_PORT", "70000")])).is_err());
        assert!(GossipConfig::from_lookup(lookup(&[("GOSSIP_PEERS", "1broker:7000")])).is_err());
        assert!(
            GossipConfig::from_lookup(lookup(&[
                ("BROKER_ORDINAL", "1"),
                ("GOSSIP_PEERS", "1=broker-1:7000"),
            ]))
            .is_err()
        );
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = GossipConfig {
            proposal_timeout: Duration::from_secs(1),
            transition_timeout: Duration::from_secs(5),
            max_concurrent_streams: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_parse_peers_rejects_duplicates() {
        assert!(parse_peers("1=a:1,1=b:2").is_err());
        assert!(parse_peers("").unwrap().is_empty());
    }
}
