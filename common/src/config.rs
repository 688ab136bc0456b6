//! Runtime configuration.
//!
//! Layers, lowest precedence first: built-in defaults, a TOML file, then
//! `WSS_*` environment variables. File lookup order: explicit path, then
//! `~/.config/wss/config.toml`, then `/etc/wss/config.toml`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::datagram::MAX_PAYLOAD;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // ---
    /// UDP port the server beacon is broadcast to
    pub discovery_port: u16,

    /// UDP port the server listens on for client acknowledgements
    pub ack_port: u16,

    /// Multicast group carrying audio datagrams
    pub multicast_group: Ipv4Addr,

    /// Multicast port carrying audio datagrams
    pub stream_port: u16,

    /// TCP port of the recovery channel
    pub recovery_port: u16,

    /// Destination of presence beacons
    pub broadcast_addr: Ipv4Addr,

    pub beacon_interval_ms: u64,

    /// Silence after which a peer is dropped from the registry
    pub peer_timeout_ms: u64,

    /// Bounded wait of every blocking receive
    pub read_timeout_ms: u64,

    /// Pacing between multicast datagrams
    pub send_interval_us: u64,

    /// Largest song accepted by a receiver
    pub max_transfer_bytes: u64,

    pub cache_dir: PathBuf,
    pub cache_budget_bytes: u64,
    pub cache_prefix: String,
    pub cache_suffix: String,
}

impl Default for Config {
    fn default() -> Self {
        // ---
        Self {
            discovery_port: 6583,
            ack_port: 6584,
            multicast_group: Ipv4Addr::new(239, 255, 42, 100),
            stream_port: 6049,
            recovery_port: 6070,
            broadcast_addr: Ipv4Addr::BROADCAST,
            beacon_interval_ms: 2000,
            peer_timeout_ms: 4000,
            read_timeout_ms: 2000,
            send_interval_us: 500,
            max_transfer_bytes: 64 * 1024 * 1024,
            cache_dir: std::env::temp_dir().join("wss-cache"),
            cache_budget_bytes: 30 * 1024 * 1024,
            cache_prefix: "wss_".to_string(),
            cache_suffix: ".audio".to_string(),
        }
    }
}

impl Config {
    // ---
    /// Loads configuration from `path` (or the default locations) and
    /// applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns error if an explicitly given file cannot be read or parsed.
    /// Missing default-location files are not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // ---
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::from_default_locations(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parses a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        // ---
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
    }

    fn from_default_locations() -> Self {
        // ---
        for candidate in default_paths() {
            if !candidate.exists() {
                continue;
            }
            match Self::from_file(&candidate) {
                Ok(config) => {
                    debug!("Loaded config from {}", candidate.display());
                    return config;
                }
                Err(e) => warn!("Ignoring config {}: {:#}", candidate.display(), e),
            }
        }
        Self::default()
    }

    fn apply_env(&mut self) {
        // ---
        override_from_env("WSS_DISCOVERY_PORT", &mut self.discovery_port);
        override_from_env("WSS_ACK_PORT", &mut self.ack_port);
        override_from_env("WSS_STREAM_PORT", &mut self.stream_port);
        override_from_env("WSS_RECOVERY_PORT", &mut self.recovery_port);
        override_from_env("WSS_CACHE_BUDGET_BYTES", &mut self.cache_budget_bytes);
        if let Some(dir) = std::env::var_os("WSS_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Bounded wait used when stopping a worker.
    pub fn stop_timeout(&self) -> Duration {
        self.read_timeout().mul_f32(1.5)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_micros(self.send_interval_us)
    }

    pub fn multicast_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.multicast_group, self.stream_port)
    }

    /// Upper bound on the datagram count of one accepted stream.
    pub fn max_expected_count(&self) -> u32 {
        // ---
        let count = self.max_transfer_bytes.div_ceil(MAX_PAYLOAD as u64);
        count.min(u32::MAX as u64) as u32
    }
}

fn default_paths() -> Vec<PathBuf> {
    // ---
    let mut paths = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".config/wss/config.toml"));
    }
    paths.push(PathBuf::from("/etc/wss/config.toml"));
    paths
}

fn override_from_env<T: std::str::FromStr>(key: &str, slot: &mut T) {
    // ---
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!("Ignoring invalid {}={:?}", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_defaults() {
        // ---
        let config = Config::default();

        assert_eq!(config.discovery_port, 6583);
        assert_eq!(config.ack_port, 6584);
        assert_eq!(config.stream_port, 6049);
        assert_eq!(config.recovery_port, 6070);
        assert_eq!(config.multicast_addr().to_string(), "239.255.42.100:6049");
        assert_eq!(config.peer_timeout(), config.beacon_interval() * 2);
        assert_eq!(config.stop_timeout(), Duration::from_millis(3000));
    }

    #[test]
    fn test_partial_toml() {
        // ---
        let config: Config = toml::from_str(
            r#"
            stream_port = 7000
            cache_budget_bytes = 1024
            "#,
        )
        .expect("parse failed");

        assert_eq!(config.stream_port, 7000);
        assert_eq!(config.cache_budget_bytes, 1024);
        assert_eq!(config.recovery_port, 6070);
    }

    #[test]
    fn test_unknown_field_rejected() {
        // ---
        assert!(toml::from_str::<Config>("bogus = 1").is_err());
    }

    #[test]
    fn test_max_expected_count() {
        // ---
        let config = Config {
            max_transfer_bytes: 1400,
            ..Config::default()
        };
        assert_eq!(config.max_expected_count(), 2);
    }
}
