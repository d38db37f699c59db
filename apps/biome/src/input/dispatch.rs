use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Control messages go out at roughly 60 Hz.
pub const DISPATCH_PERIOD: Duration = Duration::from_millis(16);

pub type TickSink = Arc<dyn Fn(u64) + Send + Sync>;

/// Periodic tick source for control dispatch.
///
/// The loop only posts `generation`-tagged ticks; the owner samples input and
/// sends. Each start gets a new generation, and stopping bumps it again so
/// ticks already queued from a stopped loop are recognisably stale.
pub struct DispatchLoop {
    period: Duration,
    tick: TickSink,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl DispatchLoop {
    pub fn new(tick: TickSink) -> Self {
        Self::with_period(DISPATCH_PERIOD, tick)
    }

    pub fn with_period(period: Duration, tick: TickSink) -> Self {
        Self {
            period,
            tick,
            generation: 0,
            task: None,
        }
    }

    /// Starts or stops the loop. Returns whether anything changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        match (enabled, self.task.is_some()) {
            (true, false) => {
                self.start();
                true
            }
            (false, true) => {
                self.stop();
                true
            }
            _ => false,
        }
    }

    fn start(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let period = self.period;
        let tick = self.tick.clone();
        debug!(target: "biome::input", generation, period_ms = period.as_millis() as u64, "dispatch loop started");
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick(generation);
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.generation += 1;
            debug!(target: "biome::input", "dispatch loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Whether a tick tagged `generation` comes from the running loop.
    pub fn accepts(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scales a raw motion delta by the sensitivity and rounds to device units.
pub fn scale_delta(delta: f64, sensitivity: f64) -> i32 {
    let scaled = (delta * sensitivity).round();
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}
