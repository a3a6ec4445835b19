//! In-memory engine and interface doubles shared by the unit tests

use crate::config::Settings;
use crate::engine::{Engine, InterfaceDescriptor};
use crate::error::{Result, TunError};
use crate::tunnel::{InterfaceHandle, InterfaceProvider, InterfaceSpec};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct MockEngine {
    pub start_status: AtomicI32,
    pub starts: Mutex<Vec<String>>,
    pub stops: AtomicUsize,
    pub detaches: AtomicUsize,
    pub attached: Mutex<Option<(PathBuf, InterfaceDescriptor)>>,
    pub rejection: Mutex<Option<String>>,
    pub fail_attach: AtomicBool,
    pub rx_bytes: AtomicI64,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(status: i32) -> Arc<Self> {
        let engine = Self::default();
        engine.start_status.store(status, Ordering::SeqCst);
        Arc::new(engine)
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }
}

impl Engine for MockEngine {
    fn start(&self, config: &str, _asset_path: &Path) -> i32 {
        self.starts.lock().unwrap().push(config.to_string());
        self.start_status.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn counters(&self) -> Vec<i64> {
        let rx = self.rx_bytes.load(Ordering::SeqCst);
        vec![0, rx / 4, 0, rx]
    }

    fn validate(&self, _config: &str, _asset_path: &Path) -> Option<String> {
        self.rejection.lock().unwrap().clone()
    }

    fn attach_bridge(&self, bridge_config: &Path, descriptor: InterfaceDescriptor) -> Result<()> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(TunError::Engine("bridge refused descriptor".to_string()));
        }
        *self.attached.lock().unwrap() = Some((bridge_config.to_path_buf(), descriptor));
        Ok(())
    }

    fn detach_bridge(&self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
        *self.attached.lock().unwrap() = None;
    }
}

#[derive(Default)]
pub struct MockInterfaces {
    pub denied: AtomicBool,
    pub fail: AtomicBool,
    pub specs: Mutex<Vec<InterfaceSpec>>,
    pub closed: Arc<AtomicUsize>,
}

impl MockInterfaces {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_spec(&self) -> Option<InterfaceSpec> {
        self.specs.lock().unwrap().last().cloned()
    }
}

struct MockHandle {
    descriptor: InterfaceDescriptor,
    closed: Arc<AtomicUsize>,
}

impl InterfaceHandle for MockHandle {
    fn descriptor(&self) -> InterfaceDescriptor {
        self.descriptor
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl InterfaceProvider for MockInterfaces {
    fn permission_granted(&self) -> bool {
        !self.denied.load(Ordering::SeqCst)
    }

    fn establish(&self, spec: &InterfaceSpec) -> Result<Box<dyn InterfaceHandle>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TunError::Interface("establish refused".to_string()));
        }
        let mut specs = self.specs.lock().unwrap();
        specs.push(spec.clone());
        Ok(Box::new(MockHandle {
            descriptor: 40 + specs.len() as i32,
            closed: self.closed.clone(),
        }))
    }
}

/// Settings with near-zero delays and assets in `asset_dir`
pub fn fast_settings(asset_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.session.asset_path = asset_dir.to_path_buf();
    settings.session.host_app_id = "com.example.host".to_string();
    settings.engine.settle_delay_ms = 1;
    settings.engine.readiness_delay_ms = 1;
    settings.monitor.interval_ms = 20;
    settings.monitor.health_guard = false;
    settings
}
