//! Reconnection on network changes
//!
//! When the OS reports a new usable network, the engine is restarted in
//! place so its upstream sockets move to the new path. The interface and
//! session state are untouched.

use crate::link::TunnelConfig;
use crate::session::{SessionManager, SessionState};
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Available,
    Lost,
}

/// Why a network change did not trigger a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AutoReconnectDisabled,
    NotRunning,
    NotConnected(SessionState),
    NoSavedConfig,
    InvalidSavedConfig(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AutoReconnectDisabled => write!(f, "auto-reconnect disabled"),
            SkipReason::NotRunning => write!(f, "session not marked as running"),
            SkipReason::NotConnected(state) => write!(f, "session is {state}"),
            SkipReason::NoSavedConfig => write!(f, "no saved configuration"),
            SkipReason::InvalidSavedConfig(e) => write!(f, "saved configuration unusable: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Restarted,
    Skipped(SkipReason),
    Failed(String),
    /// Event needs no action
    Ignored,
}

pub struct ReconnectController {
    manager: SessionManager,
}

impl ReconnectController {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// Run the gates in order and restart the engine when all pass
    pub async fn handle(&self, event: NetworkEvent) -> ReconnectOutcome {
        match event {
            NetworkEvent::Lost => {
                log::warn!("Network connection lost");
                ReconnectOutcome::Ignored
            }
            NetworkEvent::Available => match self.gate() {
                Err(reason) => {
                    log::info!("Reconnect skipped: {reason}");
                    ReconnectOutcome::Skipped(reason)
                }
                Ok(config) => {
                    log::info!("Network changed, restarting engine");
                    match self.manager.restart_engine(&config).await {
                        Ok(()) => ReconnectOutcome::Restarted,
                        Err(e) => {
                            log::error!("Engine restart failed: {e}");
                            ReconnectOutcome::Failed(e.to_string())
                        }
                    }
                }
            },
        }
    }

    fn gate(&self) -> Result<TunnelConfig, SkipReason> {
        let persistence = self.manager.persistence();
        if !persistence.auto_reconnect() {
            return Err(SkipReason::AutoReconnectDisabled);
        }
        if !persistence.should_be_running() {
            return Err(SkipReason::NotRunning);
        }
        let state = self.manager.state();
        if state != SessionState::Connected {
            return Err(SkipReason::NotConnected(state));
        }
        let json = persistence.last_config().ok_or(SkipReason::NoSavedConfig)?;
        TunnelConfig::from_document(&json)
            .map_err(|e| SkipReason::InvalidSavedConfig(e.to_string()))
    }

    /// Drive the controller from a channel of network events until it closes
    pub fn spawn(self, mut events: mpsc::Receiver<NetworkEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let outcome = self.handle(event).await;
                log::debug!("{event:?} -> {outcome:?}");
            }
            log::debug!("Network event channel closed");
        })
    }
}
