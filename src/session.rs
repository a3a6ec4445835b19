//! Session state machine
//!
//! [`SessionManager`] owns the tunnel lifecycle: it persists the intent to
//! run, sequences the engine and the virtual interface, starts the traffic
//! monitor once connected and publishes every transition on the event bus.
//!
//! ```text
//! Idle/Disconnected/Error --start--> Connecting --ok--> Connected
//!                                        |                  |
//!                                      fail           stop / revoke
//!                                        v                  v
//!                                      Error             Stopping --> Disconnected
//! ```

use crate::config::Settings;
use crate::engine::{Engine, ENGINE_OK};
use crate::error::{IntoTunError, ParseError, Result, TunError};
use crate::event::{Envelope, EventBus, SessionEvent, SessionListener};
use crate::link::{self, TunnelConfig};
use crate::monitor::{Monitor, MonitorHandle};
use crate::split_tunnel::ExclusionRegistry;
use crate::storage::{KeyValueStore, SessionPersistence};
use crate::tunnel::{InterfaceHandle, InterfaceProvider, InterfaceSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle state of the tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Stopping,
    Disconnected,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Stopping => "STOPPING",
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Error => "ERROR",
        }
    }

    /// States from which a new start sequence may begin
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Disconnected | SessionState::Error
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDLE" => Ok(SessionState::Idle),
            "CONNECTING" => Ok(SessionState::Connecting),
            "CONNECTED" => Ok(SessionState::Connected),
            "STOPPING" => Ok(SessionState::Stopping),
            "DISCONNECTED" => Ok(SessionState::Disconnected),
            "ERROR" => Ok(SessionState::Error),
            other => Err(ParseError::MalformedPayload(format!(
                "unknown session state '{other}'"
            ))),
        }
    }
}

/// Outcome of a start or stop request
#[derive(Debug)]
pub enum Transition {
    /// A sequence was launched; the handle resolves to its final state
    Started(JoinHandle<SessionState>),
    /// Request was a no-op in the given state
    Ignored(SessionState),
}

impl Transition {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Transition::Ignored(_))
    }

    /// Wait for the launched sequence to settle
    pub async fn wait(self) -> SessionState {
        match self {
            Transition::Ignored(state) => state,
            Transition::Started(handle) => handle.await.unwrap_or_else(|e| {
                log::error!("Session sequence task failed: {e}");
                SessionState::Error
            }),
        }
    }
}

/// Resources owned by a live session
#[derive(Default)]
struct Runtime {
    interface: Option<Box<dyn InterfaceHandle>>,
    monitor: Option<MonitorHandle>,
    revoke_pending: bool,
    // bumped by every start and fault; sequences only act for their own
    generation: u64,
}

struct Shared {
    settings: Settings,
    engine: Arc<dyn Engine>,
    interfaces: Arc<dyn InterfaceProvider>,
    persistence: SessionPersistence,
    registry: ExclusionRegistry,
    bus: Arc<EventBus>,
    // lock order: state before runtime
    state: Mutex<SessionState>,
    runtime: Mutex<Runtime>,
    // one start/stop/restart sequence at a time
    sequence: tokio::sync::Mutex<()>,
}

/// Handle to the tunnel session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .into_tun_error("blocking task failed")?
}

impl SessionManager {
    pub fn new(
        settings: Settings,
        engine: Arc<dyn Engine>,
        interfaces: Arc<dyn InterfaceProvider>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        settings.validate()?;

        let persistence = SessionPersistence::new(store);
        let registry = ExclusionRegistry::new(persistence.clone());

        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                engine,
                interfaces,
                persistence,
                registry,
                bus: Arc::new(EventBus::new()),
                state: Mutex::new(SessionState::Idle),
                runtime: Mutex::new(Runtime::default()),
                sequence: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn persistence(&self) -> &SessionPersistence {
        &self.shared.persistence
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope> {
        self.shared.bus.subscribe()
    }

    pub fn register_listener(&self, listener: Arc<dyn SessionListener>) {
        self.shared.bus.register_listener(listener);
    }

    /// Set the state and publish while still holding the state lock, so
    /// sequence numbers follow the order of transitions. Listeners see it
    /// on the next [`EventBus::deliver`], once the lock is released.
    fn enter(&self, state: &mut MutexGuard<'_, SessionState>, to: SessionState) {
        log::info!("Session {} -> {}", **state, to);
        **state = to;
        self.shared.bus.publish(SessionEvent::StateChanged(to));
    }

    /// Move from `from` to `to` on behalf of `generation`. Returns the
    /// state the session ends up in.
    fn settle(&self, generation: u64, from: SessionState, to: SessionState) -> SessionState {
        let settled = {
            let mut state = lock(&self.shared.state);
            let current = lock(&self.shared.runtime).generation == generation;
            if current && *state == from {
                self.enter(&mut state, to);
            }
            *state
        };
        self.shared.bus.deliver();
        settled
    }

    /// Begin a session with an already translated configuration.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, config: &TunnelConfig) -> Result<Transition> {
        let json = config.to_json();
        let mut state = lock(&self.shared.state);

        if !state.can_start() {
            log::debug!("Start ignored while {}", *state);
            return Ok(Transition::Ignored(*state));
        }
        if !self.shared.interfaces.permission_granted() {
            return Err(TunError::Permission(
                "tunnel permission has not been granted".to_string(),
            ));
        }

        let persistence = &self.shared.persistence;
        persistence.save_config(&json)?;
        persistence.set_should_be_running(true)?;

        let generation = {
            let mut runtime = lock(&self.shared.runtime);
            runtime.revoke_pending = false;
            runtime.generation += 1;
            runtime.generation
        };
        self.enter(&mut state, SessionState::Connecting);
        drop(state);
        self.shared.bus.deliver();

        let manager = self.clone();
        Ok(Transition::Started(tokio::spawn(async move {
            manager.run_start_sequence(json, generation).await
        })))
    }

    /// Translate a link or document, let the engine vet it, then start
    pub async fn connect(&self, input: &str) -> Result<Transition> {
        let config = link::translate(input)?;

        let engine = self.shared.engine.clone();
        let json = config.to_json();
        let asset_path = self.shared.settings.session.asset_path.clone();
        let rejection = blocking(move || Ok(engine.validate(&json, &asset_path))).await?;
        if let Some(message) = rejection {
            log::warn!("Engine rejected configuration: {message}");
            return Err(TunError::Validation(message));
        }

        self.start(&config)
    }

    /// Resume a session that was running before the host restarted.
    /// Returns `None` when auto-start is off or nothing was running.
    pub fn resume(&self) -> Result<Option<Transition>> {
        let saved = self.shared.persistence.snapshot();
        if !saved.auto_start_on_boot || !saved.should_be_running {
            log::debug!("Boot resume not requested");
            return Ok(None);
        }
        let Some(json) = saved.last_config else {
            log::warn!("Boot resume requested but no configuration was saved");
            return Ok(None);
        };

        log::info!("Resuming previous session");
        let config = TunnelConfig::from_document(&json)?;
        self.start(&config).map(Some)
    }

    async fn run_start_sequence(&self, config: String, generation: u64) -> SessionState {
        let _sequence = self.shared.sequence.lock().await;
        let id = Uuid::new_v4();
        log::info!("[{id}] Start sequence (generation {generation})");

        // leftovers of a session whose own teardown was skipped
        self.teardown().await;

        if let Err(e) = self.bring_up(config).await {
            log::error!("[{id}] Session start failed: {e}");
            self.teardown().await;
            self.settle(generation, SessionState::Connecting, SessionState::Error);
            return SessionState::Error;
        }

        let outcome = {
            let mut state = lock(&self.shared.state);
            let mut runtime = lock(&self.shared.runtime);
            if runtime.generation != generation {
                // faulted while connecting; a newer start may already be queued
                Err(SessionState::Error)
            } else if *state == SessionState::Connecting
                && !std::mem::take(&mut runtime.revoke_pending)
            {
                self.enter(&mut state, SessionState::Connected);
                runtime.monitor = Some(Monitor::spawn(
                    self.shared.engine.clone(),
                    self.shared.bus.clone(),
                    &self.shared.settings.monitor,
                ));
                Ok(())
            } else {
                // revoked while connecting: unwind through Stopping
                if *state == SessionState::Connecting {
                    self.enter(&mut state, SessionState::Stopping);
                }
                Err(*state)
            }
        };
        self.shared.bus.deliver();

        let Err(current) = outcome else {
            log::info!("[{id}] Session connected");
            return SessionState::Connected;
        };

        log::info!("[{id}] Session abandoned while connecting");
        self.teardown().await;
        match current {
            SessionState::Stopping => {
                self.settle(generation, SessionState::Stopping, SessionState::Disconnected)
            }
            other => other,
        }
    }

    /// Engine and interface bring-up. Acquired resources are recorded in the
    /// runtime so a failed attempt can be torn down.
    async fn bring_up(&self, config: String) -> Result<()> {
        let settings = &self.shared.settings;
        let engine = self.shared.engine.clone();

        tokio::time::sleep(settings.engine.settle_delay()).await;

        let asset_path = settings.session.asset_path.clone();
        let status = {
            let engine = engine.clone();
            blocking(move || Ok(engine.start(&config, &asset_path))).await?
        };
        if status != ENGINE_OK {
            return Err(TunError::Engine(format!("engine start returned {status}")));
        }
        log::debug!("Engine started");
        tokio::time::sleep(settings.engine.readiness_delay()).await;

        let spec = self.interface_spec();
        let interfaces = self.shared.interfaces.clone();
        let handle = blocking(move || interfaces.establish(&spec)).await?;
        let descriptor = handle.descriptor();
        lock(&self.shared.runtime).interface = Some(handle);
        log::debug!("Interface established (descriptor {descriptor})");

        let bridge_path = settings.bridge_config_path();
        let bridge_config = settings.bridge.render();
        blocking(move || {
            if let Some(parent) = bridge_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&bridge_path, bridge_config)?;
            engine.attach_bridge(&bridge_path, descriptor)
        })
        .await
    }

    fn interface_spec(&self) -> InterfaceSpec {
        let settings = &self.shared.settings;
        let persistence = &self.shared.persistence;
        InterfaceSpec {
            session_name: persistence
                .display_name()
                .unwrap_or_else(|| settings.session.session_name.clone()),
            mtu: settings.interface.mtu,
            address: settings.interface.address,
            routes: settings.interface.routes.clone(),
            disallowed_apps: self
                .shared
                .registry
                .disallowed_for(&settings.session.host_app_id),
            blocking: persistence.kill_switch(),
        }
    }

    /// Release everything the session holds. Best effort.
    async fn teardown(&self) {
        let (monitor, interface) = {
            let mut runtime = lock(&self.shared.runtime);
            (runtime.monitor.take(), runtime.interface.take())
        };
        if let Some(monitor) = monitor {
            monitor.cancel();
        }

        let engine = self.shared.engine.clone();
        let result = blocking(move || {
            engine.detach_bridge();
            if let Some(interface) = interface {
                if let Err(e) = interface.close() {
                    log::warn!("Failed to close interface: {e}");
                }
            }
            engine.stop();
            Ok(())
        })
        .await;
        if let Err(e) = result {
            log::warn!("Teardown incomplete: {e}");
        }
    }

    /// Teardown on behalf of `generation`, skipped once a newer start owns
    /// the runtime. Call with the sequence lock held.
    async fn teardown_for(&self, generation: u64) {
        if lock(&self.shared.runtime).generation != generation {
            log::debug!("Skipping teardown for superseded generation {generation}");
            return;
        }
        self.teardown().await;
    }

    /// Stop a connected session. Must be called from within a tokio runtime.
    pub fn stop(&self) -> Transition {
        let mut state = lock(&self.shared.state);
        match *state {
            SessionState::Connected => {}
            SessionState::Error => {
                if let Err(e) = self.shared.persistence.set_should_be_running(false) {
                    log::warn!("Failed to persist stop request: {e}");
                }
                return Transition::Ignored(SessionState::Error);
            }
            other => {
                log::debug!("Stop ignored while {other}");
                return Transition::Ignored(other);
            }
        }

        if let Err(e) = self.shared.persistence.set_should_be_running(false) {
            log::warn!("Failed to persist stop request: {e}");
        }
        self.enter(&mut state, SessionState::Stopping);
        let generation = {
            let mut runtime = lock(&self.shared.runtime);
            if let Some(monitor) = runtime.monitor.take() {
                monitor.cancel();
            }
            runtime.generation
        };
        drop(state);
        self.shared.bus.deliver();

        let manager = self.clone();
        Transition::Started(tokio::spawn(async move {
            let _sequence = manager.shared.sequence.lock().await;
            manager.teardown_for(generation).await;
            manager.settle(generation, SessionState::Stopping, SessionState::Disconnected)
        }))
    }

    /// The OS withdrew tunnel permission
    pub fn revoke(&self) -> Transition {
        let state = lock(&self.shared.state);
        match *state {
            SessionState::Connected => {
                drop(state);
                log::warn!("Tunnel permission revoked");
                self.stop()
            }
            SessionState::Connecting => {
                lock(&self.shared.runtime).revoke_pending = true;
                drop(state);
                log::warn!("Tunnel permission revoked while connecting");
                if let Err(e) = self.shared.persistence.set_should_be_running(false) {
                    log::warn!("Failed to persist stop request: {e}");
                }
                Transition::Ignored(SessionState::Connecting)
            }
            other => Transition::Ignored(other),
        }
    }

    /// Unrecoverable fault: enter Error and release resources.
    /// Must be called from within a tokio runtime.
    pub fn report_fault(&self, reason: &str) -> JoinHandle<()> {
        log::error!("Session fault: {reason}");
        let generation = {
            let mut state = lock(&self.shared.state);
            if *state != SessionState::Error {
                self.enter(&mut state, SessionState::Error);
            }
            let mut runtime = lock(&self.shared.runtime);
            if let Some(monitor) = runtime.monitor.take() {
                monitor.cancel();
            }
            runtime.generation += 1;
            runtime.generation
        };
        self.shared.bus.deliver();

        let manager = self.clone();
        tokio::spawn(async move {
            let _sequence = manager.shared.sequence.lock().await;
            manager.teardown_for(generation).await;
        })
    }

    /// Restart the engine in place, keeping the interface and state.
    /// Rejected while another sequence runs or when not connected.
    pub async fn restart_engine(&self, config: &TunnelConfig) -> Result<()> {
        let Ok(_sequence) = self.shared.sequence.try_lock() else {
            return Err(TunError::InvalidState(
                "another session sequence is in flight".to_string(),
            ));
        };
        let state = self.state();
        if state != SessionState::Connected {
            return Err(TunError::InvalidState(format!(
                "engine restart requires a connected session, state is {state}"
            )));
        }

        let engine = self.shared.engine.clone();
        {
            let engine = engine.clone();
            blocking(move || {
                engine.stop();
                Ok(())
            })
            .await?;
        }
        tokio::time::sleep(self.shared.settings.engine.settle_delay()).await;

        let json = config.to_json();
        let asset_path = self.shared.settings.session.asset_path.clone();
        let status = blocking(move || Ok(engine.start(&json, &asset_path))).await?;
        if status != ENGINE_OK {
            return Err(TunError::Engine(format!("engine restart returned {status}")));
        }
        log::info!("Engine restarted");
        Ok(())
    }

    pub fn kill_switch(&self) -> bool {
        self.shared.persistence.kill_switch()
    }

    /// Takes effect on the next start
    pub fn set_kill_switch(&self, enabled: bool) -> Result<()> {
        self.shared.persistence.set_kill_switch(enabled)
    }

    pub fn auto_start_on_boot(&self) -> bool {
        self.shared.persistence.auto_start_on_boot()
    }

    pub fn set_auto_start_on_boot(&self, enabled: bool) -> Result<()> {
        self.shared.persistence.set_auto_start_on_boot(enabled)
    }

    pub fn auto_reconnect(&self) -> bool {
        self.shared.persistence.auto_reconnect()
    }

    pub fn set_auto_reconnect(&self, enabled: bool) -> Result<()> {
        self.shared.persistence.set_auto_reconnect(enabled)
    }

    pub fn display_name(&self) -> Option<String> {
        self.shared.persistence.display_name()
    }

    pub fn set_display_name(&self, name: Option<&str>) -> Result<()> {
        self.shared.persistence.set_display_name(name)
    }

    pub fn display_icon(&self) -> i64 {
        self.shared.persistence.display_icon()
    }

    pub fn set_display_icon(&self, icon: i64) -> Result<()> {
        self.shared.persistence.set_display_icon(icon)
    }

    /// Flip split-tunnel membership. Takes effect on the next start.
    pub fn toggle_excluded_app(&self, app_id: &str) -> Result<bool> {
        self.shared.registry.toggle(app_id)
    }

    pub fn excluded_apps(&self) -> BTreeSet<String> {
        self.shared.registry.members()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::EndpointBuilder;
    use crate::storage::MemoryStore;
    use crate::testing::{fast_settings, MockEngine, MockInterfaces};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const LINK: &str = "vless://123e4567-e89b-12d3-a456-426614174000@example.com:443?security=tls&sni=example.com";

    struct Fixture {
        manager: SessionManager,
        engine: Arc<MockEngine>,
        interfaces: Arc<MockInterfaces>,
        _assets: tempfile::TempDir,
    }

    fn fixture_with(engine: Arc<MockEngine>) -> Fixture {
        fixture_tuned(engine, |_| {})
    }

    fn fixture_tuned(engine: Arc<MockEngine>, tune: impl FnOnce(&mut Settings)) -> Fixture {
        let assets = tempfile::tempdir().unwrap();
        let interfaces = MockInterfaces::new();
        let mut settings = fast_settings(assets.path());
        tune(&mut settings);
        let manager = SessionManager::new(
            settings,
            engine.clone(),
            interfaces.clone(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        Fixture {
            manager,
            engine,
            interfaces,
            _assets: assets,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockEngine::new())
    }

    fn config() -> TunnelConfig {
        EndpointBuilder::vless()
            .server("example.com", 443)
            .credential("123e4567-e89b-12d3-a456-426614174000")
            .tls("example.com")
            .build()
            .unwrap()
    }

    fn states(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<SessionState> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e.event {
                SessionEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Connected.to_string(), "CONNECTED");
        assert_eq!("stopping".parse::<SessionState>().unwrap(), SessionState::Stopping);
        assert!("BOGUS".parse::<SessionState>().is_err());
        assert_eq!(
            serde_json::to_string(&SessionState::Disconnected).unwrap(),
            "\"DISCONNECTED\""
        );
    }

    #[tokio::test]
    async fn test_start_reaches_connected() {
        let f = fixture();
        f.manager.toggle_excluded_app("com.example.host").unwrap();
        f.manager.toggle_excluded_app("com.bank").unwrap();
        let mut rx = f.manager.subscribe();

        let final_state = f.manager.start(&config()).unwrap().wait().await;
        assert_eq!(final_state, SessionState::Connected);
        assert_eq!(f.manager.state(), SessionState::Connected);
        assert_eq!(
            states(&mut rx),
            vec![SessionState::Connecting, SessionState::Connected]
        );

        assert_eq!(f.engine.starts.lock().unwrap().as_slice(), &[config().to_json()]);
        let spec = f.interfaces.last_spec().unwrap();
        assert!(spec.disallowed_apps.contains("com.bank"));
        assert!(!spec.disallowed_apps.contains("com.example.host"));
        assert!(!spec.blocking);
        assert_eq!(spec.session_name, "Tunnel");

        let (bridge_path, descriptor) = f.engine.attached.lock().unwrap().clone().unwrap();
        assert_eq!(descriptor, 41);
        let bridge = std::fs::read_to_string(bridge_path).unwrap();
        assert!(bridge.contains("port: 20808"));

        let saved = f.manager.persistence().snapshot();
        assert!(saved.should_be_running);
        assert_eq!(saved.last_config, Some(config().to_json()));
    }

    #[tokio::test]
    async fn test_duplicate_start_while_connecting() {
        let f = fixture();
        let first = f.manager.start(&config()).unwrap();
        let second = f.manager.start(&config()).unwrap();
        assert!(matches!(second, Transition::Ignored(SessionState::Connecting)));

        assert_eq!(first.wait().await, SessionState::Connected);
        assert_eq!(f.engine.start_count(), 1);

        let third = f.manager.start(&config()).unwrap();
        assert!(matches!(third, Transition::Ignored(SessionState::Connected)));
    }

    #[tokio::test]
    async fn test_stop_from_idle_is_noop() {
        let f = fixture();
        let mut rx = f.manager.subscribe();
        assert!(matches!(f.manager.stop(), Transition::Ignored(SessionState::Idle)));
        assert!(states(&mut rx).is_empty());
        assert_eq!(f.engine.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_engine_failure_ends_in_error() {
        let f = fixture_with(MockEngine::failing(3));
        let mut rx = f.manager.subscribe();

        let final_state = f.manager.start(&config()).unwrap().wait().await;
        assert_eq!(final_state, SessionState::Error);
        assert_eq!(
            states(&mut rx),
            vec![SessionState::Connecting, SessionState::Error]
        );
        assert!(f.interfaces.last_spec().is_none());
        // the intent to run is kept
        assert!(f.manager.persistence().should_be_running());
    }

    #[tokio::test]
    async fn test_interface_failure_tears_down_engine() {
        let f = fixture();
        f.interfaces.fail.store(true, Ordering::SeqCst);

        let final_state = f.manager.start(&config()).unwrap().wait().await;
        assert_eq!(final_state, SessionState::Error);
        // once before start, once in teardown
        assert_eq!(f.engine.stops.load(Ordering::SeqCst), 2);

        // a new start is accepted from Error
        f.interfaces.fail.store(false, Ordering::SeqCst);
        let retry = f.manager.start(&config()).unwrap().wait().await;
        assert_eq!(retry, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_bridge_failure_closes_interface() {
        let f = fixture();
        f.engine.fail_attach.store(true, Ordering::SeqCst);

        let final_state = f.manager.start(&config()).unwrap().wait().await;
        assert_eq!(final_state, SessionState::Error);
        assert_eq!(f.interfaces.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_from_connected() {
        let f = fixture();
        f.engine.rx_bytes.store(4096, Ordering::SeqCst);
        let mut rx = f.manager.subscribe();
        f.manager.start(&config()).unwrap().wait().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stopping = f.manager.stop();
        assert_eq!(f.manager.state(), SessionState::Stopping);
        let seq_at_stop = f.manager.shared.bus.last_seq();
        assert_eq!(stopping.wait().await, SessionState::Disconnected);

        let envelopes: Vec<Envelope> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(envelopes
            .iter()
            .any(|e| matches!(e.event, SessionEvent::Traffic(_))));
        // only the Disconnected transition follows Stopping
        let after: Vec<_> = envelopes.iter().filter(|e| e.seq > seq_at_stop).collect();
        assert_eq!(after.len(), 1);
        assert_eq!(
            after[0].event,
            SessionEvent::StateChanged(SessionState::Disconnected)
        );

        assert!(!f.manager.persistence().should_be_running());
        assert_eq!(f.interfaces.closed.load(Ordering::SeqCst), 1);
        assert!(f.engine.attached.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let f = fixture();
        f.interfaces.denied.store(true, Ordering::SeqCst);
        let mut rx = f.manager.subscribe();

        assert!(matches!(
            f.manager.start(&config()),
            Err(TunError::Permission(_))
        ));
        assert_eq!(f.manager.state(), SessionState::Idle);
        assert!(states(&mut rx).is_empty());
        assert!(!f.manager.persistence().should_be_running());
    }

    #[tokio::test]
    async fn test_connect_surfaces_parse_and_validation_errors() {
        let f = fixture();
        assert!(matches!(
            f.manager.connect("trojan://secret@host:443").await,
            Err(TunError::Parse(ParseError::UnsupportedProtocol(_)))
        ));

        *f.engine.rejection.lock().unwrap() = Some("unknown field".to_string());
        match f.manager.connect(LINK).await {
            Err(TunError::Validation(message)) => assert_eq!(message, "unknown field"),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(f.manager.state(), SessionState::Idle);

        *f.engine.rejection.lock().unwrap() = None;
        let state = f.manager.connect(LINK).await.unwrap().wait().await;
        assert_eq!(state, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_revoke_while_connecting() {
        let f = fixture();
        let mut rx = f.manager.subscribe();
        let started = f.manager.start(&config()).unwrap();
        assert!(f.manager.revoke().is_ignored());

        assert_eq!(started.wait().await, SessionState::Disconnected);
        assert_eq!(
            states(&mut rx),
            vec![
                SessionState::Connecting,
                SessionState::Stopping,
                SessionState::Disconnected
            ]
        );
        assert!(!f.manager.persistence().should_be_running());
    }

    #[tokio::test]
    async fn test_revoke_while_connected_stops() {
        let f = fixture();
        f.manager.start(&config()).unwrap().wait().await;
        assert_eq!(f.manager.revoke().wait().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_report_fault() {
        let f = fixture();
        f.manager.start(&config()).unwrap().wait().await;
        f.manager.report_fault("engine crashed").await.unwrap();
        assert_eq!(f.manager.state(), SessionState::Error);
        assert_eq!(f.interfaces.closed.load(Ordering::SeqCst), 1);
        // stop from Error only clears the intent
        assert!(f.manager.stop().is_ignored());
        assert!(!f.manager.persistence().should_be_running());
    }

    #[tokio::test]
    async fn test_fault_while_connecting_then_restart() {
        let f = fixture_tuned(MockEngine::new(), |s| s.engine.readiness_delay_ms = 50);
        let first = f.manager.start(&config()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fault = f.manager.report_fault("engine exited");
        assert_eq!(f.manager.state(), SessionState::Error);
        let second = f.manager.start(&config()).unwrap();
        assert!(!second.is_ignored());

        assert_eq!(first.wait().await, SessionState::Error);
        fault.await.unwrap();
        assert_eq!(second.wait().await, SessionState::Connected);
        assert_eq!(f.manager.state(), SessionState::Connected);

        // the faulted attempt released its own interface only
        assert_eq!(f.interfaces.specs.lock().unwrap().len(), 2);
        assert_eq!(f.interfaces.closed.load(Ordering::SeqCst), 1);
        let (_, descriptor) = f.engine.attached.lock().unwrap().clone().unwrap();
        assert_eq!(descriptor, 42);
        let runtime = lock(&f.manager.shared.runtime);
        assert!(runtime.interface.is_some());
        assert!(runtime.monitor.is_some());
    }

    /// Reads and drives the manager from inside its callbacks
    #[derive(Default)]
    struct Reentrant {
        manager: std::sync::OnceLock<SessionManager>,
        seen: Mutex<Vec<(SessionState, SessionState)>>,
    }

    impl SessionListener for Reentrant {
        fn on_state_changed(&self, state: SessionState) {
            if let Some(manager) = self.manager.get() {
                self.seen.lock().unwrap().push((state, manager.state()));
            }
        }

        fn on_no_traffic(&self) {
            if let Some(manager) = self.manager.get() {
                manager.stop();
            }
        }
    }

    #[tokio::test]
    async fn test_listener_reenters_manager() {
        let f = fixture_tuned(MockEngine::new(), |s| {
            s.monitor.health_guard = true;
            s.monitor.health_grace_ms = 0;
            s.monitor.stall_threshold = 2;
        });
        f.engine.rx_bytes.store(4096, Ordering::SeqCst);
        let listener = Arc::new(Reentrant::default());
        f.manager.register_listener(listener.clone());
        let _ = listener.manager.set(f.manager.clone());

        assert_eq!(
            f.manager.start(&config()).unwrap().wait().await,
            SessionState::Connected
        );

        // the stalled counter makes the listener stop the session
        for _ in 0..100 {
            let done = listener
                .seen
                .lock()
                .unwrap()
                .last()
                .is_some_and(|(state, _)| *state == SessionState::Disconnected);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let seen = listener.seen.lock().unwrap().clone();
        let states: Vec<SessionState> = seen.iter().map(|(state, _)| *state).collect();
        assert_eq!(
            states,
            vec![
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::Stopping,
                SessionState::Disconnected
            ]
        );
        assert_eq!(seen[0], (SessionState::Connecting, SessionState::Connecting));
        assert_eq!(f.manager.state(), SessionState::Disconnected);
        assert!(!f.manager.persistence().should_be_running());
    }

    #[tokio::test]
    async fn test_blocking_panic_becomes_error() {
        let result: Result<()> = blocking(|| panic!("adapter blew up")).await;
        match result {
            Err(TunError::Other(message)) => assert!(message.starts_with("blocking task failed")),
            other => panic!("expected Other error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resume_gates() {
        let f = fixture();
        assert!(f.manager.resume().unwrap().is_none());

        f.manager.set_auto_start_on_boot(true).unwrap();
        f.manager.persistence().set_should_be_running(true).unwrap();
        // nothing saved yet
        assert!(f.manager.resume().unwrap().is_none());

        f.manager.persistence().save_config(&config().to_json()).unwrap();
        let state = f.manager.resume().unwrap().unwrap().wait().await;
        assert_eq!(state, SessionState::Connected);
        assert_eq!(f.engine.start_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_engine_requires_connected() {
        let f = fixture();
        assert!(matches!(
            f.manager.restart_engine(&config()).await,
            Err(TunError::InvalidState(_))
        ));

        f.manager.start(&config()).unwrap().wait().await;
        f.manager.restart_engine(&config()).await.unwrap();
        assert_eq!(f.engine.start_count(), 2);
        assert_eq!(f.manager.state(), SessionState::Connected);
        // interface untouched
        assert_eq!(f.interfaces.specs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_kill_switch_and_display_name_shape_interface() {
        let f = fixture();
        f.manager.set_kill_switch(true).unwrap();
        f.manager.set_display_name(Some("Office")).unwrap();
        f.manager.start(&config()).unwrap().wait().await;

        let spec = f.interfaces.last_spec().unwrap();
        assert!(spec.blocking);
        assert_eq!(spec.session_name, "Office");
    }
}
