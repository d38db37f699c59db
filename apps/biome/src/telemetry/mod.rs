//! Timing probes for the hot paths of a running session, plus logging setup.
//!
//! Probes are inert unless `BIOME_PERF` is set. When enabled, each probe keeps
//! running totals and logs a summary under `biome::perf` every
//! [`SUMMARY_INTERVAL`] samples.

use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

pub mod logging;

const SUMMARY_INTERVAL: u64 = 240;

static PERF: Lazy<bool> = Lazy::new(|| flag("BIOME_PERF"));

static PROBES: Lazy<[Mutex<ProbeStats>; Probe::COUNT]> =
    Lazy::new(|| std::array::from_fn(|_| Mutex::new(ProbeStats::default())));

pub(crate) fn flag(var: &str) -> bool {
    std::env::var(var).is_ok_and(|v| !v.is_empty() && v != "0")
}

/// Places in the session loop worth timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// base64 payload of an inbound frame message.
    FrameBase64,
    /// Image decode on the blocking pool.
    FrameDecode,
    /// One input tick: snapshot plus control send.
    ControlDispatch,
}

impl Probe {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Probe::FrameBase64 => "frame_base64",
            Probe::FrameDecode => "frame_decode",
            Probe::ControlDispatch => "control_dispatch",
        }
    }

    /// Time a single sample may take before it counts as over budget.
    pub fn budget(self) -> Duration {
        match self {
            Probe::FrameBase64 => Duration::from_millis(2),
            Probe::FrameDecode => Duration::from_millis(16),
            Probe::ControlDispatch => Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStats {
    pub samples: u64,
    pub over_budget: u64,
    pub total: Duration,
    pub worst: Duration,
}

impl ProbeStats {
    fn observe(&mut self, elapsed: Duration, budget: Duration) {
        self.samples += 1;
        self.total += elapsed;
        self.worst = self.worst.max(elapsed);
        if elapsed > budget {
            self.over_budget += 1;
        }
    }

    pub fn mean(&self) -> Duration {
        match u32::try_from(self.samples) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.samples as f64),
        }
    }
}

pub fn enabled() -> bool {
    *PERF
}

pub fn record(probe: Probe, elapsed: Duration) {
    if !enabled() {
        return;
    }
    let Ok(mut stats) = PROBES[probe.index()].lock() else {
        return;
    };
    stats.observe(elapsed, probe.budget());
    if stats.samples % SUMMARY_INTERVAL == 0 {
        info!(
            target: "biome::perf",
            probe = probe.name(),
            samples = stats.samples,
            over_budget = stats.over_budget,
            mean_us = stats.mean().as_micros() as u64,
            worst_us = stats.worst.as_micros() as u64,
            "probe summary"
        );
    }
}

pub fn stats(probe: Probe) -> ProbeStats {
    PROBES[probe.index()]
        .lock()
        .map(|stats| *stats)
        .unwrap_or_default()
}

/// Times the enclosing scope. `None` when probes are off.
pub struct PerfGuard {
    probe: Probe,
    started: Instant,
}

impl PerfGuard {
    pub fn new(probe: Probe) -> Option<Self> {
        enabled().then(|| Self {
            probe,
            started: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        record(self.probe, self.started.elapsed());
    }
}
