//! Traffic and health monitor
//!
//! Polls the engine counters while a session is connected, turns them into
//! per-second rates and watches for a stalled receive counter.

use crate::config::MonitorConfig;
use crate::engine::{Engine, TrafficCounters};
use crate::event::{EventBus, SessionEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Throughput over one polling interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficSample {
    pub upload_bytes_per_sec: u64,
    pub download_bytes_per_sec: u64,
}

/// Converts cumulative counters into rates
#[derive(Debug, Clone)]
pub struct TrafficMeter {
    interval: Duration,
    baseline: Option<TrafficCounters>,
}

impl TrafficMeter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            baseline: None,
        }
    }

    /// First reading only establishes the baseline. A counter that went
    /// backwards (engine restart) also just resets it.
    pub fn sample(&mut self, current: TrafficCounters) -> TrafficSample {
        let Some(previous) = self.baseline.replace(current) else {
            return TrafficSample::default();
        };
        if current.upload_bytes < previous.upload_bytes
            || current.download_bytes < previous.download_bytes
        {
            log::debug!("Traffic counters went backwards, resetting baseline");
            return TrafficSample::default();
        }

        TrafficSample {
            upload_bytes_per_sec: self.per_second(current.upload_bytes - previous.upload_bytes),
            download_bytes_per_sec: self
                .per_second(current.download_bytes - previous.download_bytes),
        }
    }

    fn per_second(&self, delta: u64) -> u64 {
        let millis = self.interval.as_millis().max(1) as u64;
        if millis == 1000 {
            delta
        } else {
            delta.saturating_mul(1000) / millis
        }
    }
}

/// Detects a receive counter that stopped moving
///
/// Fires once after `threshold` consecutive unchanged non-zero readings,
/// then stays latched until the counter moves again.
#[derive(Debug, Clone)]
pub struct HealthGuard {
    threshold: u32,
    last_rx: Option<u64>,
    unchanged: u32,
    latched: bool,
}

impl HealthGuard {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            last_rx: None,
            unchanged: 0,
            latched: false,
        }
    }

    /// Feed one reading. Returns true when a no-traffic signal is due.
    pub fn observe(&mut self, rx_bytes: u64) -> bool {
        let stalled = self.last_rx == Some(rx_bytes);
        self.last_rx = Some(rx_bytes);

        if rx_bytes == 0 || !stalled {
            self.unchanged = 0;
            self.latched = false;
            return false;
        }
        if self.latched {
            return false;
        }

        self.unchanged += 1;
        if self.unchanged >= self.threshold {
            self.unchanged = 0;
            self.latched = true;
            return true;
        }
        false
    }
}

/// Running monitor tasks. Dropping the handle does not stop them; call
/// [`MonitorHandle::cancel`].
pub struct MonitorHandle {
    gate: Arc<Mutex<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop both loops. No event is emitted once this returns.
    pub fn cancel(self) {
        match self.gate.lock() {
            Ok(mut active) => *active = false,
            Err(poisoned) => *poisoned.into_inner() = false,
        }
        for task in self.tasks {
            task.abort();
        }
        log::debug!("Monitor cancelled");
    }
}

/// Publish only while the gate is open. Listeners are called after the
/// gate is released so they may cancel the monitor themselves.
fn emit_gated(gate: &Mutex<bool>, bus: &EventBus, event: SessionEvent) -> bool {
    {
        let Ok(active) = gate.lock() else {
            return false;
        };
        if !*active {
            return false;
        }
        bus.publish(event);
    }
    bus.deliver();
    true
}

pub struct Monitor;

impl Monitor {
    /// Start the traffic loop and, if enabled, the health loop.
    /// Must be called from within a tokio runtime.
    pub fn spawn(engine: Arc<dyn Engine>, bus: Arc<EventBus>, config: &MonitorConfig) -> MonitorHandle {
        let gate = Arc::new(Mutex::new(true));
        let interval = config.interval();
        let mut tasks = Vec::with_capacity(2);

        {
            let engine = engine.clone();
            let bus = bus.clone();
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut meter = TrafficMeter::new(interval);
                loop {
                    ticker.tick().await;
                    let sample = match TrafficCounters::read(engine.as_ref()) {
                        Some(counters) => meter.sample(counters),
                        None => TrafficSample::default(),
                    };
                    if !emit_gated(&gate, &bus, SessionEvent::Traffic(sample)) {
                        break;
                    }
                }
            }));
        }

        if config.health_guard {
            let gate = gate.clone();
            let grace = config.health_grace();
            let threshold = config.stall_threshold;
            tasks.push(tokio::spawn(async move {
                let mut ticker = time::interval_at(Instant::now() + grace, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut guard = HealthGuard::new(threshold);
                loop {
                    ticker.tick().await;
                    let Some(counters) = TrafficCounters::read(engine.as_ref()) else {
                        continue;
                    };
                    if guard.observe(counters.download_bytes) {
                        log::warn!(
                            "No inbound traffic for {threshold} consecutive checks"
                        );
                        if !emit_gated(&gate, &bus, SessionEvent::NoTraffic) {
                            break;
                        }
                    }
                }
            }));
        }

        log::debug!("Monitor started ({}ms interval)", config.interval_ms);
        MonitorHandle { gate, tasks }
    }
}

const RATE_UNITS: [&str; 5] = ["B/s", "KB/s", "MB/s", "GB/s", "TB/s"];

/// Human-readable rate, 1024 steps, at most one decimal, grouped thousands
pub fn format_rate(bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 {
        return format!("0 {}", RATE_UNITS[0]);
    }

    let mut value = bytes_per_sec as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < RATE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let tenths = (value * 10.0).round() as u64;
    let whole = group_thousands(tenths / 10);
    match tenths % 10 {
        0 => format!("{whole} {}", RATE_UNITS[unit]),
        frac => format!("{whole}.{frac} {}", RATE_UNITS[unit]),
    }
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::event::{Envelope, SessionListener};
    use crate::session::SessionState;
    use std::path::Path;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn counters(up: u64, down: u64) -> TrafficCounters {
        TrafficCounters {
            upload_bytes: up,
            download_bytes: down,
        }
    }

    #[test]
    fn test_meter_first_sample_is_zero() {
        let mut meter = TrafficMeter::new(Duration::from_secs(1));
        assert_eq!(meter.sample(counters(5000, 9000)), TrafficSample::default());
        assert_eq!(
            meter.sample(counters(6000, 12000)),
            TrafficSample {
                upload_bytes_per_sec: 1000,
                download_bytes_per_sec: 3000
            }
        );
    }

    #[test]
    fn test_meter_never_negative() {
        let mut meter = TrafficMeter::new(Duration::from_secs(1));
        meter.sample(counters(5000, 9000));
        // engine restarted
        assert_eq!(meter.sample(counters(10, 20)), TrafficSample::default());
        assert_eq!(
            meter.sample(counters(110, 220)),
            TrafficSample {
                upload_bytes_per_sec: 100,
                download_bytes_per_sec: 200
            }
        );
    }

    #[test]
    fn test_meter_scales_to_interval() {
        let mut meter = TrafficMeter::new(Duration::from_millis(500));
        meter.sample(counters(0, 0));
        assert_eq!(meter.sample(counters(100, 50)).upload_bytes_per_sec, 200);
    }

    #[test]
    fn test_health_guard_latches() {
        let mut guard = HealthGuard::new(3);
        assert!(!guard.observe(100)); // baseline
        assert!(!guard.observe(100));
        assert!(!guard.observe(100));
        assert!(guard.observe(100));
        // latched while stalled
        for _ in 0..10 {
            assert!(!guard.observe(100));
        }
        // counter moves, guard re-arms
        assert!(!guard.observe(200));
        assert!(!guard.observe(200));
        assert!(!guard.observe(200));
        assert!(guard.observe(200));
    }

    #[test]
    fn test_health_guard_ignores_zero_counter() {
        let mut guard = HealthGuard::new(1);
        for _ in 0..5 {
            assert!(!guard.observe(0));
        }
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(0), "0 B/s");
        assert_eq!(format_rate(512), "512 B/s");
        assert_eq!(format_rate(1000), "1,000 B/s");
        assert_eq!(format_rate(1024), "1 KB/s");
        assert_eq!(format_rate(1536), "1.5 KB/s");
        assert_eq!(format_rate(5 * 1024 * 1024), "5 MB/s");
        assert_eq!(format_rate(3 * 1024 * 1024 * 1024), "3 GB/s");
        assert_eq!(format_rate(2048 * 1024 * 1024 * 1024 * 1024), "2,048 TB/s");
    }

    /// Receive counter that grows by `step` on every read
    struct CountingEngine {
        rx: AtomicI64,
        step: i64,
    }

    impl CountingEngine {
        fn new(rx: i64, step: i64) -> Arc<Self> {
            Arc::new(Self {
                rx: AtomicI64::new(rx),
                step,
            })
        }
    }

    impl Engine for CountingEngine {
        fn start(&self, _config: &str, _asset_path: &Path) -> i32 {
            0
        }
        fn stop(&self) {}
        fn counters(&self) -> Vec<i64> {
            let rx = self.rx.fetch_add(self.step, Ordering::SeqCst);
            vec![0, rx / 2, 0, rx]
        }
        fn attach_bridge(&self, _path: &Path, _descriptor: i32) -> Result<()> {
            Ok(())
        }
        fn detach_bridge(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_emits_until_cancelled() {
        let engine = CountingEngine::new(0, 1024);
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let config = MonitorConfig {
            health_guard: false,
            ..MonitorConfig::default()
        };

        let handle = Monitor::spawn(engine, bus.clone(), &config);
        time::sleep(Duration::from_millis(2500)).await;
        handle.cancel();
        let emitted = bus.last_seq();

        let mut samples = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let SessionEvent::Traffic(sample) = envelope.event {
                samples.push(sample);
            }
        }
        // ticks at 0s, 1s, 2s
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], TrafficSample::default());
        assert_eq!(samples[1].download_bytes_per_sec, 1024);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(bus.last_seq(), emitted);
    }

    fn stalled_config() -> MonitorConfig {
        MonitorConfig {
            interval_ms: 1000,
            health_guard: true,
            health_grace_ms: 5000,
            stall_threshold: 3,
        }
    }

    fn drain_no_traffic(rx: &mut UnboundedReceiver<Envelope>) -> usize {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| e.event == SessionEvent::NoTraffic)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_guard_signals_once_after_grace() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let handle = Monitor::spawn(CountingEngine::new(4096, 0), bus.clone(), &stalled_config());

        // observing starts at 5s; the third unchanged reading lands at 8s
        time::sleep(Duration::from_millis(7500)).await;
        assert_eq!(drain_no_traffic(&mut rx), 0);

        time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(drain_no_traffic(&mut rx), 1);

        handle.cancel();
        let emitted = bus.last_seq();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bus.last_seq(), emitted);
        assert_eq!(drain_no_traffic(&mut rx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_guard_ignores_moving_counter() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let handle = Monitor::spawn(CountingEngine::new(0, 512), bus.clone(), &stalled_config());

        time::sleep(Duration::from_secs(15)).await;
        handle.cancel();
        assert_eq!(drain_no_traffic(&mut rx), 0);
    }

    /// Cancels the monitor from inside the no-traffic callback
    #[derive(Default)]
    struct CancelOnStall {
        handle: std::sync::Mutex<Option<MonitorHandle>>,
        stalls: AtomicUsize,
    }

    impl SessionListener for CancelOnStall {
        fn on_state_changed(&self, _state: SessionState) {}

        fn on_no_traffic(&self) {
            self.stalls.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = self.handle.lock().unwrap().take() {
                handle.cancel();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_can_cancel_monitor() {
        let bus = Arc::new(EventBus::new());
        let listener = Arc::new(CancelOnStall::default());
        bus.register_listener(listener.clone());

        let handle = Monitor::spawn(CountingEngine::new(4096, 0), bus.clone(), &stalled_config());
        *listener.handle.lock().unwrap() = Some(handle);

        time::sleep(Duration::from_secs(12)).await;
        assert_eq!(listener.stalls.load(Ordering::SeqCst), 1);
        assert!(listener.handle.lock().unwrap().is_none());

        let emitted = bus.last_seq();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bus.last_seq(), emitted);
    }
}
