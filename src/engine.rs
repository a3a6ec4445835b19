//! Tunneling engine capability
//!
//! The engine itself (protocol handling, encryption) lives outside this
//! crate. The session manager only depends on the [`Engine`] trait; hosts
//! implement it with an adapter over their native library.

use crate::error::Result;
use std::path::Path;

/// Status code the engine returns from a successful start
pub const ENGINE_OK: i32 = 0;

/// Counter array positions as laid out by the engine
const UPLOAD_BYTES_INDEX: usize = 1;
const DOWNLOAD_BYTES_INDEX: usize = 3;

/// Opaque descriptor of an established virtual interface
pub type InterfaceDescriptor = i32;

/// Capability interface over the external tunneling engine
///
/// Calls are assumed non-reentrant and potentially blocking; the session
/// manager serializes them and runs them off the async executor.
pub trait Engine: Send + Sync {
    /// Start the engine with a serialized configuration document
    fn start(&self, config: &str, asset_path: &Path) -> i32;

    /// Stop the engine. Must be safe to call when not running.
    fn stop(&self);

    /// Raw cumulative counters (`[rx_packets, tx_bytes, rx_packets, rx_bytes, ...]`)
    fn counters(&self) -> Vec<i64>;

    /// Dry-run a configuration. Returns the engine's message on rejection.
    fn validate(&self, _config: &str, _asset_path: &Path) -> Option<String> {
        None
    }

    /// Hand the interface descriptor to the engine's local bridge
    fn attach_bridge(&self, bridge_config: &Path, descriptor: InterfaceDescriptor) -> Result<()>;

    /// Release the bridge. Must be safe to call when not attached.
    fn detach_bridge(&self);
}

/// Cumulative byte counters read from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficCounters {
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

impl TrafficCounters {
    /// Decode the engine counter array. Shorter arrays carry no byte counts.
    pub fn from_raw(raw: &[i64]) -> Option<Self> {
        if raw.len() <= DOWNLOAD_BYTES_INDEX {
            return None;
        }
        Some(Self {
            upload_bytes: raw[UPLOAD_BYTES_INDEX].max(0) as u64,
            download_bytes: raw[DOWNLOAD_BYTES_INDEX].max(0) as u64,
        })
    }

    /// Read and decode the counters of a running engine
    pub fn read(engine: &dyn Engine) -> Option<Self> {
        Self::from_raw(&engine.counters())
    }
}
