//! Periodic metrics: host CPU sampling plus the engine's inference summary.
//!
//! `MetricsPoller` does not own a timer. The consumer loop asks for
//! `next_due()` and calls `tick()` when that instant passes, so a stopped
//! poller has nothing left scheduled that could fire later.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::detect::DetectSummary;
use crate::engine::InferenceEngine;
use crate::ui::UiSink;

/// Tick period. Fixed.
pub const METRICS_INTERVAL: Duration = Duration::from_millis(1000);

// ----------------------------------------------------------------------------
// CPU sampling
// ----------------------------------------------------------------------------

pub trait CpuSampler: Send {
    /// Total user + system CPU time consumed by this process.
    fn process_cpu_time(&mut self) -> Option<Duration>;

    fn logical_cores(&self) -> usize;
}

/// Samples the current process through `sysinfo`.
pub struct ProcessCpuSampler {
    system: System,
    pid: Option<Pid>,
    cores: usize,
    reported_unavailable: bool,
}

impl ProcessCpuSampler {
    pub fn new() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                log::warn!("ProcessCpuSampler: CPU usage unavailable: {}", err);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
            cores,
            reported_unavailable: pid.is_none(),
        }
    }
}

impl Default for ProcessCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for ProcessCpuSampler {
    fn process_cpu_time(&mut self) -> Option<Duration> {
        let pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_cpu(),
        );
        match self.system.process(pid) {
            Some(process) => Some(Duration::from_millis(process.accumulated_cpu_time())),
            None => {
                if !self.reported_unavailable {
                    self.reported_unavailable = true;
                    log::warn!("ProcessCpuSampler: process {} not visible, CPU usage reads 0", pid);
                }
                None
            }
        }
    }

    fn logical_cores(&self) -> usize {
        self.cores
    }
}

/// `100 * cpu / (wall * cores)`.
///
/// Returns 0 for a non-positive wall delta, a negative CPU delta, zero cores or
/// any non-finite intermediate. Never NaN.
pub fn cpu_percent(cpu_delta_secs: f64, wall_delta_secs: f64, cores: usize) -> f32 {
    if cores == 0 || !(wall_delta_secs > 0.0) || !(cpu_delta_secs > 0.0) {
        return 0.0;
    }
    let percent = 100.0 * cpu_delta_secs / (wall_delta_secs * cores as f64);
    if percent.is_finite() {
        percent as f32
    } else {
        0.0
    }
}

// ----------------------------------------------------------------------------
// SummaryCache
// ----------------------------------------------------------------------------

/// Last known good inference summary.
pub struct SummaryCache {
    latest: Mutex<Option<DetectSummary>>,
}

impl SummaryCache {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(None),
        }
    }

    pub fn update(&self, summary: DetectSummary) {
        *self.lock() = Some(summary);
    }

    pub fn latest(&self) -> Option<DetectSummary> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    /// Freshness policy.
    ///
    /// While detecting, always ask the engine and keep the previous value if it
    /// has nothing. Otherwise serve the cache, fetching once if it is empty.
    pub fn get_latest(
        &self,
        actively_detecting: bool,
        engine: &dyn InferenceEngine,
    ) -> Option<DetectSummary> {
        if !actively_detecting {
            if let Some(cached) = self.latest() {
                return Some(cached);
            }
        }
        match engine.detect_summary() {
            Some(summary) => {
                let summary = summary.sanitized();
                self.update(summary.clone());
                Some(summary)
            }
            None => {
                log::debug!("SummaryCache: engine returned no summary, keeping previous");
                self.latest()
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<DetectSummary>> {
        self.latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SummaryCache {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// MetricsPoller
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct CpuSample {
    cpu: Option<Duration>,
    wall: Instant,
}

pub struct MetricsPoller {
    running: bool,
    next_tick: Option<Instant>,
    baseline: Option<CpuSample>,
    last_cpu_percent: f32,
    ticks: u64,
    sampler: Box<dyn CpuSampler>,
}

impl MetricsPoller {
    pub fn new(sampler: Box<dyn CpuSampler>) -> Self {
        Self {
            running: false,
            next_tick: None,
            baseline: None,
            last_cpu_percent: 0.0,
            ticks: 0,
            sampler,
        }
    }

    /// Schedule the first tick at `now`. Returns false if already running.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        self.baseline = None;
        self.next_tick = Some(now);
        log::debug!("MetricsPoller: started");
        true
    }

    /// Cancel the pending tick. Returns false if it was not running.
    pub fn stop(&mut self) -> bool {
        self.next_tick = None;
        if !self.running {
            return false;
        }
        self.running = false;
        log::debug!("MetricsPoller: stopped after {} ticks", self.ticks);
        true
    }

    /// Forget the CPU baseline and the last computed value.
    pub fn reset(&mut self) {
        self.baseline = None;
        self.last_cpu_percent = 0.0;
        self.ticks = 0;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.running && self.next_tick.is_some_and(|due| now >= due)
    }

    pub fn last_cpu_percent(&self) -> f32 {
        self.last_cpu_percent
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run one tick and publish the merged summary.
    ///
    /// A stopped poller does nothing. When neither the cache nor the engine
    /// has a summary, nothing is published and the previous display stays.
    pub fn tick(
        &mut self,
        now: Instant,
        cache: &SummaryCache,
        engine: &dyn InferenceEngine,
        actively_detecting: bool,
        ui: &dyn UiSink,
    ) -> Option<DetectSummary> {
        if !self.running {
            return None;
        }
        self.next_tick = Some(now + METRICS_INTERVAL);
        self.ticks += 1;
        self.last_cpu_percent = self.sample_cpu(now);

        let summary = cache
            .get_latest(actively_detecting, engine)?
            .with_cpu_usage(self.last_cpu_percent);
        ui.update_metrics(&summary);
        Some(summary)
    }

    fn sample_cpu(&mut self, now: Instant) -> f32 {
        let current = CpuSample {
            cpu: self.sampler.process_cpu_time(),
            wall: now,
        };
        let previous = self.baseline.replace(current);
        let Some(previous) = previous else {
            return 0.0;
        };
        match (previous.cpu, current.cpu) {
            (Some(before), Some(after)) => {
                let cpu_delta = after.as_secs_f64() - before.as_secs_f64();
                let wall_delta = now.saturating_duration_since(previous.wall).as_secs_f64();
                cpu_percent(cpu_delta, wall_delta, self.sampler.logical_cores())
            }
            _ => 0.0,
        }
    }
}
