//! Server configuration
//!
//! [`Config`] is the raw, user-facing form: it can be flattened into a node
//! binary's command line (`#[command(flatten)]`) or read from a JSON file.
//! [`Config::validate`] turns it into the [`Settings`] the server runs with.

use crate::wire::hash::{HashParseError, SubnetworkId};
use crate::wire::message::{ServiceFlags, PROTOCOL_VERSION};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default maximum number of inbound peers
pub const DEFAULT_MAX_INBOUND_PEERS: usize = 117;

/// Default number of outbound connections to maintain
pub const DEFAULT_TARGET_OUTBOUND_PEERS: usize = 8;

/// Default ban score threshold
pub const DEFAULT_BAN_THRESHOLD: u32 = 100;

/// Default ban duration (24 hours)
pub const DEFAULT_BAN_DURATION_SECS: u64 = 24 * 60 * 60;

/// Delay before the first rebroadcast tick
pub const DEFAULT_REBROADCAST_INITIAL_DELAY_SECS: u64 = 5 * 60;

/// Upper bound of the randomized rebroadcast interval
pub const DEFAULT_REBROADCAST_MAX_INTERVAL_SECS: u64 = 30 * 60;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid whitelist entry '{0}'")]
    InvalidWhitelist(String),
    #[error("Invalid subnetwork id: {0}")]
    InvalidSubnetwork(#[from] HashParseError),
    #[error("Ban threshold must be greater than zero")]
    InvalidBanThreshold,
    #[error("Rebroadcast interval must be at least one second")]
    InvalidRebroadcastInterval,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// P2P server options
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Max number of inbound peers
    #[arg(long = "maxinpeers", default_value_t = DEFAULT_MAX_INBOUND_PEERS)]
    pub max_inbound_peers: usize,

    /// Number of outbound peers to maintain
    #[arg(long = "outpeers", default_value_t = DEFAULT_TARGET_OUTBOUND_PEERS)]
    pub target_outbound_peers: usize,

    /// Disable banning of misbehaving peers
    #[arg(long = "nobanning")]
    pub disable_banning: bool,

    /// Maximum allowed ban score before disconnecting and banning misbehaving peers
    #[arg(long = "banthreshold", default_value_t = DEFAULT_BAN_THRESHOLD)]
    pub ban_threshold: u32,

    /// How long to ban misbehaving peers, in seconds
    #[arg(long = "banduration", default_value_t = DEFAULT_BAN_DURATION_SECS)]
    pub ban_duration_secs: u64,

    /// Add an IP network or IP that will not be banned (eg. 192.168.1.0/24 or ::1)
    #[arg(long = "whitelist")]
    pub whitelists: Vec<String>,

    /// Do not accept transactions from remote peers
    #[arg(long = "blocksonly")]
    pub blocks_only: bool,

    /// Disable bloom filtering support
    #[arg(long = "nopeerbloomfilters")]
    pub no_peer_bloom_filters: bool,

    /// Serve committed filters to peers
    #[arg(long = "cfindex")]
    pub enable_cf_index: bool,

    /// Use the simulation test network
    #[arg(long)]
    pub simnet: bool,

    /// Disable listening for incoming connections
    #[arg(long = "nolisten")]
    pub disable_listen: bool,

    /// Subnetwork to follow as a partial node (hex); full node when unset
    #[arg(long = "subnetwork")]
    pub subnetwork_id: Option<String>,

    /// Comment to add to the user agent
    #[arg(long = "uacomment")]
    pub user_agent_comments: Vec<String>,

    /// Seconds before the first rebroadcast of unconfirmed inventory
    #[arg(long = "rebroadcastdelay", default_value_t = DEFAULT_REBROADCAST_INITIAL_DELAY_SECS)]
    pub rebroadcast_initial_delay_secs: u64,

    /// Upper bound, in seconds, of the randomized rebroadcast interval
    #[arg(long = "rebroadcastinterval", default_value_t = DEFAULT_REBROADCAST_MAX_INTERVAL_SECS)]
    pub rebroadcast_max_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_inbound_peers: DEFAULT_MAX_INBOUND_PEERS,
            target_outbound_peers: DEFAULT_TARGET_OUTBOUND_PEERS,
            disable_banning: false,
            ban_threshold: DEFAULT_BAN_THRESHOLD,
            ban_duration_secs: DEFAULT_BAN_DURATION_SECS,
            whitelists: Vec::new(),
            blocks_only: false,
            no_peer_bloom_filters: false,
            enable_cf_index: false,
            simnet: false,
            disable_listen: false,
            subnetwork_id: None,
            user_agent_comments: Vec::new(),
            rebroadcast_initial_delay_secs: DEFAULT_REBROADCAST_INITIAL_DELAY_SECS,
            rebroadcast_max_interval_secs: DEFAULT_REBROADCAST_MAX_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Check the options and resolve them into runtime settings
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        if self.ban_threshold == 0 {
            return Err(ConfigError::InvalidBanThreshold);
        }
        if self.rebroadcast_max_interval_secs == 0 {
            return Err(ConfigError::InvalidRebroadcastInterval);
        }

        let whitelist = self
            .whitelists
            .iter()
            .map(|entry| entry.parse())
            .collect::<Result<Vec<IpNetwork>, _>>()?;

        let subnetwork_id = self
            .subnetwork_id
            .as_deref()
            .map(SubnetworkId::from_str)
            .transpose()?;

        let mut services = ServiceFlags::NODE_NETWORK;
        if !self.no_peer_bloom_filters {
            services |= ServiceFlags::NODE_BLOOM;
        }
        if self.enable_cf_index {
            services |= ServiceFlags::NODE_CF;
        }

        let mut user_agent = format!("/dagnet:{}/", env!("CARGO_PKG_VERSION"));
        if !self.user_agent_comments.is_empty() {
            user_agent.insert_str(
                user_agent.len() - 1,
                &format!("({})", self.user_agent_comments.join("; ")),
            );
        }

        Ok(Settings {
            max_inbound_peers: self.max_inbound_peers,
            target_outbound_peers: self.target_outbound_peers,
            disable_banning: self.disable_banning,
            ban_threshold: self.ban_threshold,
            ban_duration: Duration::from_secs(self.ban_duration_secs),
            whitelist: Whitelist(whitelist),
            blocks_only: self.blocks_only,
            services,
            simnet: self.simnet,
            disable_listen: self.disable_listen,
            subnetwork_id,
            protocol_version: PROTOCOL_VERSION,
            user_agent,
            rebroadcast_initial_delay: Duration::from_secs(self.rebroadcast_initial_delay_secs),
            rebroadcast_max_interval: Duration::from_secs(self.rebroadcast_max_interval_secs),
        })
    }
}

/// Validated settings shared by the server, its peers and handlers
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_inbound_peers: usize,
    pub target_outbound_peers: usize,
    pub disable_banning: bool,
    pub ban_threshold: u32,
    pub ban_duration: Duration,
    pub whitelist: Whitelist,
    pub blocks_only: bool,
    /// Services advertised to peers
    pub services: ServiceFlags,
    pub simnet: bool,
    pub disable_listen: bool,
    /// None for full nodes
    pub subnetwork_id: Option<SubnetworkId>,
    pub protocol_version: u32,
    pub user_agent: String,
    pub rebroadcast_initial_delay: Duration,
    pub rebroadcast_max_interval: Duration,
}

impl Settings {
    /// Total peer slots (inbound + outbound)
    pub fn max_peers(&self) -> usize {
        self.max_inbound_peers + self.target_outbound_peers
    }

    pub fn has_service(&self, service: ServiceFlags) -> bool {
        self.services.contains(service)
    }
}

/// An IP address or CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidWhitelist(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s.trim().parse().map_err(|_| invalid())?;
                let full = if addr.is_ipv4() { 32 } else { 128 };
                (addr, full)
            }
        };

        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p)),
    }
}

/// Networks exempt from ban scoring
#[derive(Debug, Clone, Default)]
pub struct Whitelist(Vec<IpNetwork>);

impl Whitelist {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.iter().any(|net| net.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn test_default_settings() {
        let settings = Config::default().validate().unwrap();
        assert_eq!(settings.ban_threshold, DEFAULT_BAN_THRESHOLD);
        assert!(settings.has_service(ServiceFlags::NODE_BLOOM));
        assert!(!settings.has_service(ServiceFlags::NODE_CF));
        assert!(settings.subnetwork_id.is_none());
        assert_eq!(settings.max_peers(), 125);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "dagnet",
            "--blocksonly",
            "--nopeerbloomfilters",
            "--banthreshold",
            "50",
            "--whitelist",
            "10.0.0.0/8",
            "--uacomment",
            "test",
        ]);
        let settings = cli.config.validate().unwrap();
        assert!(settings.blocks_only);
        assert!(!settings.has_service(ServiceFlags::NODE_BLOOM));
        assert_eq!(settings.ban_threshold, 50);
        assert!(settings.whitelist.contains(&"10.1.2.3".parse().unwrap()));
        assert!(settings.user_agent.ends_with("(test)/"));
    }

    #[test]
    fn test_json_config() {
        let config: Config =
            serde_json::from_str(r#"{"blocks_only": true, "ban_duration_secs": 60}"#).unwrap();
        assert!(config.blocks_only);
        assert_eq!(config.ban_duration_secs, 60);
        assert_eq!(config.max_inbound_peers, DEFAULT_MAX_INBOUND_PEERS);
    }

    #[test]
    fn test_whitelist_networks() {
        let net: IpNetwork = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains(&"192.168.1.77".parse().unwrap()));
        assert!(!net.contains(&"192.168.2.1".parse().unwrap()));

        let single: IpNetwork = "::1".parse().unwrap();
        assert!(single.contains(&"::1".parse().unwrap()));
        assert!(!single.contains(&"127.0.0.1".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<IpNetwork>().is_err());
        assert!("not-an-ip".parse::<IpNetwork>().is_err());
    }

    #[test]
    fn test_invalid_subnetwork() {
        let config = Config {
            subnetwork_id: Some("xyz".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSubnetwork(_))
        ));
    }
}
