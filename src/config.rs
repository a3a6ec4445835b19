//! Configuration module for the tunnel session library
//!
//! This module provides TOML-based settings parsing and validation. Every
//! field has a serde default, so an empty document yields a usable
//! configuration.

use crate::error::{Result, TunError};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Host application identity and engine asset location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identifier of the application embedding the library. Never excluded
    /// from the tunnel.
    #[serde(default = "default_host_app_id")]
    pub host_app_id: String,
    /// Directory holding engine assets (geo data) and the bridge config file
    #[serde(default = "default_asset_path")]
    pub asset_path: PathBuf,
    /// Session name shown by the OS when no custom display name is set
    #[serde(default = "default_session_name")]
    pub session_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_app_id: default_host_app_id(),
            asset_path: default_asset_path(),
            session_name: default_session_name(),
        }
    }
}

/// Engine sequencing delays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pause after stopping a previous engine instance, in milliseconds
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Pause after engine start before the interface is built, in milliseconds
    #[serde(default = "default_readiness_delay")]
    pub readiness_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
            readiness_delay_ms: default_readiness_delay(),
        }
    }
}

impl EngineConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn readiness_delay(&self) -> Duration {
        Duration::from_millis(self.readiness_delay_ms)
    }
}

/// Virtual interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// MTU value
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Interface address with prefix
    #[serde(default = "default_interface_address")]
    pub address: Ipv4Net,
    /// Routes captured by the interface
    #[serde(default = "default_routes")]
    pub routes: Vec<Ipv4Net>,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            address: default_interface_address(),
            routes: default_routes(),
        }
    }
}

/// Local bridge (interface to SOCKS inbound) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_socks_address")]
    pub socks_address: Ipv4Addr,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_true")]
    pub tcp: bool,
    #[serde(default = "default_true")]
    pub udp: bool,
    #[serde(default = "default_true")]
    pub dns: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socks_address: default_socks_address(),
            socks_port: default_socks_port(),
            tcp: true,
            udp: true,
            dns: true,
        }
    }
}

impl BridgeConfig {
    /// Render the bridge configuration file consumed by the engine bridge
    pub fn render(&self) -> String {
        format!(
            "socks5:\n  address: {}\n  port: {}\ntcp:\n  enabled: {}\nudp:\n  enabled: {}\ndns:\n  enabled: {}\n",
            self.socks_address, self.socks_port, self.tcp, self.udp, self.dns
        )
    }
}

/// Traffic and health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Counter polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    /// Enable the no-traffic health guard
    #[serde(default = "default_true")]
    pub health_guard: bool,
    /// Delay before the health guard starts observing, in milliseconds
    #[serde(default = "default_health_grace")]
    pub health_grace_ms: u64,
    /// Consecutive unchanged ticks before a no-traffic signal
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            health_guard: true,
            health_grace_ms: default_health_grace(),
            stall_threshold: default_stall_threshold(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_millis(self.health_grace_ms)
    }
}

/// Quality profiler defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerConfig {
    #[serde(default = "default_probe_host")]
    pub host: String,
    #[serde(default = "default_probe_port")]
    pub port: u16,
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,
    #[serde(default = "default_probe_delay")]
    pub probe_delay_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            host: default_probe_host(),
            port: default_probe_port(),
            probe_count: default_probe_count(),
            probe_delay_ms: default_probe_delay(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub profiler: ProfilerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| TunError::Config(format!("Failed to read settings file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert settings to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TunError::Config(format!("Failed to serialize settings: {e}")))
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.session.host_app_id.is_empty() {
            return Err(TunError::Config(
                "Host application id cannot be empty".to_string(),
            ));
        }

        if self.interface.mtu < 576 || self.interface.mtu > 9000 {
            return Err(TunError::Config(
                "MTU must be between 576 and 9000".to_string(),
            ));
        }

        if self.interface.routes.is_empty() {
            return Err(TunError::Config(
                "At least one interface route is required".to_string(),
            ));
        }

        if self.bridge.socks_port == 0 {
            return Err(TunError::Config("Bridge port cannot be zero".to_string()));
        }

        if self.monitor.interval_ms == 0 {
            return Err(TunError::Config(
                "Monitor interval must be positive".to_string(),
            ));
        }

        if self.monitor.stall_threshold == 0 {
            return Err(TunError::Config(
                "Stall threshold must be positive".to_string(),
            ));
        }

        if self.profiler.probe_count == 0 {
            return Err(TunError::Config(
                "Probe count must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Path of the bridge configuration file written at session start
    pub fn bridge_config_path(&self) -> PathBuf {
        self.session.asset_path.join("bridge.yaml")
    }
}

impl FromStr for Settings {
    type Err = TunError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TunError::Config(format!("Failed to parse TOML: {e}")))
    }
}

/// Initialise `env_logger` from the logging section. `RUST_LOG` wins when set.
pub fn init_logging(config: &LoggingConfig) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.level.as_str()),
    )
    .try_init();
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_host_app_id() -> String {
    "io.tunsession.host".to_string()
}

fn default_asset_path() -> PathBuf {
    std::env::temp_dir().join("tunsession")
}

fn default_session_name() -> String {
    "Tunnel".to_string()
}

fn default_settle_delay() -> u64 {
    300
}

fn default_readiness_delay() -> u64 {
    1000
}

fn default_mtu() -> u16 {
    1500
}

fn default_interface_address() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(172, 19, 0, 1), 30).unwrap_or_default()
}

fn default_routes() -> Vec<Ipv4Net> {
    vec![Ipv4Net::default()]
}

fn default_socks_address() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_socks_port() -> u16 {
    crate::link::LOCAL_INBOUND_PORT
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_health_grace() -> u64 {
    10_000
}

fn default_stall_threshold() -> u32 {
    20
}

fn default_probe_host() -> String {
    "1.1.1.1".to_string()
}

fn default_probe_port() -> u16 {
    53
}

fn default_probe_count() -> u32 {
    10
}

fn default_probe_delay() -> u64 {
    100
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}
