use std::{net::IpAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use humantime::Duration;
use thiserror::Error;

use crate::types::ServiceType;

/// Upper bound on concurrently admitted peers.
pub const MAX_PEERS_LIMIT: u32 = 250;
const MAX_REMOTE_ADDR_LEN: usize = 63;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("moniker cannot be empty")]
    EmptyMoniker,
    #[error("at least one remote address is required")]
    NoRemoteAddrs,
    #[error("invalid remote address {0:?}: must be an IP address or DNS name of at most 63 characters")]
    InvalidRemoteAddr(String),
    #[error("max peers must be between 1 and {MAX_PEERS_LIMIT}, got {0}")]
    InvalidMaxPeers(u32),
    #[error("interval {0} cannot be zero")]
    ZeroInterval(&'static str),
}

#[derive(Clone, Parser, Debug)]
#[command(version)]
// keep `cargo test` arguments from being parsed as ours
#[cfg_attr(test, command(ignore_errors(true)))]
pub struct DvpnConfig {
    #[arg(long, env = "DVPN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "DVPN_DATABASE_PATH", default_value = "data.db")]
    pub database_path: PathBuf,

    #[arg(long, env = "DVPN_HTTP_BIND_ADDRESS")]
    pub http_bind_address: Option<IpAddr>,

    #[arg(long, env = "DVPN_HTTP_PORT", default_value_t = 7777)]
    pub http_port: u16,

    /// Ledger address of this node.
    #[arg(long, env = "DVPN_NODE_ADDR", default_value = "")]
    pub node_addr: String,

    #[arg(long, env = "DVPN_MONIKER", default_value = "dvpn-node")]
    pub moniker: String,

    /// Addresses advertised to clients after admission.
    #[arg(
        long,
        env = "DVPN_REMOTE_ADDRS",
        value_delimiter = ',',
        default_value = "127.0.0.1"
    )]
    pub remote_addrs: Vec<String>,

    #[arg(long, env = "DVPN_SERVICE_TYPE", default_value = "wireguard")]
    pub service_type: ServiceType,

    #[arg(long, env = "DVPN_MAX_PEERS", default_value_t = MAX_PEERS_LIMIT)]
    pub max_peers: u32,

    #[arg(long, env = "DVPN_LEDGER_URL", default_value = "http://localhost:1317")]
    pub ledger_url: String,

    #[arg(long, env = "DVPN_LEDGER_TIMEOUT", default_value = "15s")]
    pub ledger_timeout: Duration,

    #[arg(
        long,
        env = "DVPN_PEER_SERVICE_URL",
        default_value = "http://localhost:8585"
    )]
    pub peer_service_url: String,

    #[arg(
        long,
        env = "DVPN_INTERVAL_SESSION_USAGE_SYNC_WITH_DATABASE",
        default_value = "2s"
    )]
    pub interval_session_usage_sync_with_database: Duration,

    #[arg(
        long,
        env = "DVPN_INTERVAL_SESSION_USAGE_SYNC_WITH_LEDGER",
        default_value = "1h 55m"
    )]
    pub interval_session_usage_sync_with_ledger: Duration,

    #[arg(
        long,
        env = "DVPN_INTERVAL_SESSION_USAGE_VALIDATE",
        default_value = "5s"
    )]
    pub interval_session_usage_validate: Duration,

    #[arg(long, env = "DVPN_INTERVAL_SESSION_VALIDATE", default_value = "5m")]
    pub interval_session_validate: Duration,

    #[arg(long, env = "DVPN_INTERVAL_STATUS_UPDATE", default_value = "55m")]
    pub interval_status_update: Duration,

    #[arg(long, env = "DVPN_PUBLISHER_RETRY_DELAY", default_value = "5s")]
    pub publisher_retry_delay: Duration,

    #[command(subcommand)]
    pub cmd: Option<Command>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    #[command(about = "Delete every local session record of this node and exit.")]
    PurgeSessions,
}

impl DvpnConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::parse()
    }

    // avoid `cargo test` args being captured by `clap`
    #[must_use]
    pub fn new_test_config() -> Self {
        Self::parse_from::<[_; 0], String>([])
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.moniker.trim().is_empty() {
            return Err(ConfigError::EmptyMoniker);
        }
        if self.remote_addrs.is_empty() {
            return Err(ConfigError::NoRemoteAddrs);
        }
        for addr in &self.remote_addrs {
            if !is_valid_remote_addr(addr) {
                return Err(ConfigError::InvalidRemoteAddr(addr.clone()));
            }
        }
        if self.max_peers == 0 || self.max_peers > MAX_PEERS_LIMIT {
            return Err(ConfigError::InvalidMaxPeers(self.max_peers));
        }

        let intervals = [
            (
                "session_usage_sync_with_database",
                self.interval_session_usage_sync_with_database,
            ),
            (
                "session_usage_sync_with_ledger",
                self.interval_session_usage_sync_with_ledger,
            ),
            (
                "session_usage_validate",
                self.interval_session_usage_validate,
            ),
            ("session_validate", self.interval_session_validate),
            ("status_update", self.interval_status_update),
            ("publisher_retry_delay", self.publisher_retry_delay),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        Ok(())
    }
}

impl Default for DvpnConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn is_valid_remote_addr(addr: &str) -> bool {
    if addr.is_empty() || addr.len() > MAX_REMOTE_ADDR_LEN {
        return false;
    }
    addr.parse::<IpAddr>().is_ok() || is_dns_name(addr)
}

fn is_dns_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        DvpnConfig::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let config = DvpnConfig::new_test_config();
        assert_eq!(config.max_peers, 250);
        assert_eq!(config.service_type, ServiceType::Wireguard);
        assert_eq!(
            *config.interval_session_usage_sync_with_database,
            std::time::Duration::from_secs(2)
        );
        assert_eq!(
            *config.interval_session_usage_sync_with_ledger,
            std::time::Duration::from_secs(115 * 60)
        );
        assert_eq!(
            *config.interval_session_validate,
            std::time::Duration::from_secs(300)
        );
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_parse_args() {
        let config = DvpnConfig::parse_from([
            "dvpn",
            "--service-type",
            "v2ray",
            "--remote-addrs",
            "10.0.0.1,node.example.com",
            "--max-peers",
            "10",
        ]);
        assert_eq!(config.service_type, ServiceType::V2Ray);
        assert_eq!(config.remote_addrs, ["10.0.0.1", "node.example.com"]);
        assert_eq!(config.max_peers, 10);
        assert!(config.cmd.is_none());

        let config = DvpnConfig::parse_from(["dvpn", "purge-sessions"]);
        assert!(matches!(config.cmd, Some(Command::PurgeSessions)));
    }

    #[test]
    fn test_validate_max_peers() {
        let mut config = DvpnConfig::new_test_config();
        config.max_peers = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxPeers(0)));
        config.max_peers = 251;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxPeers(251)));
        config.max_peers = 1;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_remote_addrs() {
        let mut config = DvpnConfig::new_test_config();
        config.remote_addrs = vec!["2001:db8::1".into(), "vpn-1.example.org".into()];
        assert_eq!(config.validate(), Ok(()));

        config.remote_addrs = vec![];
        assert_eq!(config.validate(), Err(ConfigError::NoRemoteAddrs));

        for bad in ["", "-bad.example.com", "under_score.com", "a..b"] {
            config.remote_addrs = vec![bad.into()];
            assert_eq!(
                config.validate(),
                Err(ConfigError::InvalidRemoteAddr(bad.into()))
            );
        }

        let long = format!("{}.com", "a".repeat(60));
        config.remote_addrs = vec![long.clone()];
        assert_eq!(config.validate(), Err(ConfigError::InvalidRemoteAddr(long)));
    }

    #[test]
    fn test_validate_moniker_and_intervals() {
        let mut config = DvpnConfig::new_test_config();
        config.moniker = "  ".into();
        assert_eq!(config.validate(), Err(ConfigError::EmptyMoniker));

        let mut config = DvpnConfig::new_test_config();
        config.interval_session_validate = std::time::Duration::ZERO.into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("session_validate"))
        );
    }
}
