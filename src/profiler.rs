//! Connection quality profiler
//!
//! Runs a short burst of sequential probes against a target and condenses
//! the round-trip times into a [`QualityProfile`]. Independent of the
//! session state.

use crate::config::ProfilerConfig;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};

/// Summary of one profiling run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityProfile {
    pub average_latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    /// 0 (unusable) to 100 (excellent)
    pub quality_score: u8,
}

impl QualityProfile {
    /// Build a profile from the round-trip times of the probes that answered
    pub fn from_samples(rtts: &[Duration], probe_count: u32) -> Self {
        if probe_count == 0 || rtts.is_empty() {
            return Self {
                average_latency_ms: 0.0,
                jitter_ms: 0.0,
                packet_loss_percent: 100.0,
                quality_score: 0,
            };
        }

        let millis: Vec<f64> = rtts.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        let received = millis.len().min(probe_count as usize);
        let lost = probe_count as usize - received;
        let loss = lost as f64 / f64::from(probe_count) * 100.0;

        let latency = millis.iter().sum::<f64>() / millis.len() as f64;
        let jitter = if millis.len() < 2 {
            0.0
        } else {
            let diffs: f64 = millis.windows(2).map(|w| (w[0] - w[1]).abs()).sum();
            diffs / (millis.len() - 1) as f64
        };

        Self {
            average_latency_ms: latency,
            jitter_ms: jitter,
            packet_loss_percent: loss,
            quality_score: quality_score(latency, jitter, loss),
        }
    }
}

/// Loss weighs heaviest, then jitter, then raw latency
pub fn quality_score(latency_ms: f64, jitter_ms: f64, loss_percent: f64) -> u8 {
    let penalty = loss_percent * 6.0 + jitter_ms / 1.5 + latency_ms / 25.0;
    let score = (100.0 - penalty).round();
    if score.is_nan() {
        return 0;
    }
    score.clamp(0.0, 100.0) as u8
}

/// A single round-trip measurement. `None` means the probe was lost.
pub trait Probe: Send + Sync {
    fn probe(&self, target: SocketAddr, timeout: Duration) -> BoxFuture<'_, Option<Duration>>;
}

/// Sends a minimal DNS query (root NS) and waits for the matching answer
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpDnsProbe;

impl UdpDnsProbe {
    fn query(id: u16) -> [u8; 17] {
        let id = id.to_be_bytes();
        [
            id[0], id[1], // transaction id
            0x01, 0x00, // standard query, recursion desired
            0x00, 0x01, // one question
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // no other records
            0x00, // root name
            0x00, 0x02, // NS
            0x00, 0x01, // IN
        ]
    }

    async fn round_trip(target: SocketAddr) -> std::io::Result<Duration> {
        let bind = if target.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;

        let id = fastrand::u16(..);
        let started = Instant::now();
        socket.send(&Self::query(id)).await?;

        let mut buffer = [0u8; 512];
        loop {
            let len = socket.recv(&mut buffer).await?;
            if len >= 2 && u16::from_be_bytes([buffer[0], buffer[1]]) == id {
                return Ok(started.elapsed());
            }
        }
    }
}

impl Probe for UdpDnsProbe {
    fn probe(&self, target: SocketAddr, timeout: Duration) -> BoxFuture<'_, Option<Duration>> {
        async move {
            match tokio::time::timeout(timeout, Self::round_trip(target)).await {
                Ok(Ok(rtt)) => Some(rtt),
                Ok(Err(e)) => {
                    log::debug!("DNS probe to {target} failed: {e}");
                    None
                }
                Err(_) => None,
            }
        }
        .boxed()
    }
}

/// Measures TCP connect time
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnectProbe;

impl Probe for TcpConnectProbe {
    fn probe(&self, target: SocketAddr, timeout: Duration) -> BoxFuture<'_, Option<Duration>> {
        async move {
            let started = Instant::now();
            match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
                Ok(Ok(_stream)) => Some(started.elapsed()),
                Ok(Err(e)) => {
                    log::debug!("TCP probe to {target} failed: {e}");
                    None
                }
                Err(_) => None,
            }
        }
        .boxed()
    }
}

pub struct QualityProfiler {
    probe: Arc<dyn Probe>,
    config: ProfilerConfig,
}

impl QualityProfiler {
    pub fn new(probe: Arc<dyn Probe>, config: ProfilerConfig) -> Self {
        Self { probe, config }
    }

    /// DNS-over-UDP profiler, the default
    pub fn udp(config: ProfilerConfig) -> Self {
        Self::new(Arc::new(UdpDnsProbe), config)
    }

    pub fn tcp(config: ProfilerConfig) -> Self {
        Self::new(Arc::new(TcpConnectProbe), config)
    }

    /// Profile the configured default target
    pub async fn profile_default(&self) -> QualityProfile {
        let host = self.config.host.clone();
        self.profile(&host, self.config.port, self.config.probe_count)
            .await
    }

    /// Run `count` sequential probes against `host:port`
    pub async fn profile(&self, host: &str, port: u16, count: u32) -> QualityProfile {
        let target = match tokio::net::lookup_host((host, port)).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                log::warn!("Failed to resolve {host}: {e}");
                None
            }
        };
        let Some(target) = target else {
            return QualityProfile::from_samples(&[], count);
        };

        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let delay = Duration::from_millis(self.config.probe_delay_ms);
        let mut rtts = Vec::with_capacity(count as usize);

        for i in 0..count {
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            if let Some(rtt) = self.probe.probe(target, timeout).await {
                rtts.push(rtt);
            }
        }

        let profile = QualityProfile::from_samples(&rtts, count);
        log::info!(
            "Profiled {target}: {:.1}ms latency, {:.1}ms jitter, {:.0}% loss, score {}",
            profile.average_latency_ms,
            profile.jitter_ms,
            profile.packet_loss_percent,
            profile.quality_score
        );
        profile
    }
}
