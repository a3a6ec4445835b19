//! tunsession - Proxy Tunnel Session Library
//!
//! Client-side orchestration for a proxy tunnel: it turns share links into
//! engine configuration documents and drives the session lifecycle around an
//! external tunneling engine and an OS-provided virtual interface.
//!
//! ## What This Library Provides
//! - Link translation (`vless://`, `vmess://`, pass-through JSON documents)
//! - Session state machine with persisted run intent and boot resume
//! - Traffic rates and a no-traffic health signal while connected
//! - Connection quality profiling (latency, jitter, loss, score)
//! - Split tunneling by application identifier
//! - Engine restart on network changes
//! - C FFI bindings for the stateless helpers
//!
//! ## What Your Application Must Provide
//! - An [`engine::Engine`] adapter over the tunneling engine
//! - An [`tunnel::InterfaceProvider`] for the platform's virtual interface
//!   (a Linux TUN adapter ships behind the `tun-device` feature)
//! - Optionally a [`storage::KeyValueStore`] over the platform preferences

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod event;
pub mod link;
pub mod monitor;
pub mod profiler;
pub mod reconnect;
pub mod session;
pub mod split_tunnel;
pub mod storage;
pub mod tunnel;

#[cfg(test)]
mod testing;

// Re-export core types
pub use config::Settings;
pub use engine::{Engine, TrafficCounters};
pub use error::{ParseError, Result, TunError};
pub use event::{Envelope, EventBus, SessionEvent, SessionListener, StateTracker};
pub use link::{translate, TunnelConfig};
pub use monitor::{format_rate, TrafficSample};
pub use profiler::{QualityProfile, QualityProfiler};
pub use reconnect::{NetworkEvent, ReconnectController, ReconnectOutcome};
pub use session::{SessionManager, SessionState, Transition};
pub use storage::{FileStore, KeyValueStore, MemoryStore};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// C FFI Interface for cross-platform integration
pub mod ffi;
