//! Process memory observation and pressure handling
//!
//! Rust has no collector to invoke, so a "collection" here means asking every
//! registered [`Reclaimer`] (caches, buffers) to give memory back. The
//! optimizer samples the process through a [`MemoryProbe`], classifies the
//! result against configured thresholds and publishes alerts the scheduler
//! uses for backpressure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use crate::core::config::MemoryConfig;
use crate::core::errors::Result;
use crate::core::events::{CoreEvent, EventBus};

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub rss_bytes: u64,
    /// Virtual size of the process; allocator heap usage is not observable portably
    pub heap_bytes: u64,
}

/// Source of memory figures
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Samples the current process through `sysinfo`
#[derive(Debug)]
pub struct ProcessMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "Current process id unavailable, memory readings will be zero");
                None
            }
        };
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self) -> MemorySample {
        let Some(pid) = self.pid else {
            return MemorySample::default();
        };
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        if !system.refresh_process(pid) {
            return MemorySample::default();
        }
        system
            .process(pid)
            .map(|process| MemorySample {
                rss_bytes: process.memory(),
                heap_bytes: process.virtual_memory(),
            })
            .unwrap_or_default()
    }
}

/// Probe returning whatever was last set; for tests and simulations
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    rss_bytes: AtomicU64,
    heap_bytes: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(rss_bytes: u64) -> Self {
        let probe = Self::default();
        probe.set(rss_bytes);
        probe
    }

    pub fn set(&self, rss_bytes: u64) {
        self.rss_bytes.store(rss_bytes, Ordering::SeqCst);
        self.heap_bytes.store(rss_bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn sample(&self) -> MemorySample {
        MemorySample {
            rss_bytes: self.rss_bytes.load(Ordering::SeqCst),
            heap_bytes: self.heap_bytes.load(Ordering::SeqCst),
        }
    }
}

/// Something that can release memory on request
pub trait Reclaimer: Send + Sync {
    fn name(&self) -> &str;

    /// Release what can be released; returns bytes freed
    fn reclaim(&self, reason: &str) -> u64;

    /// Routine upkeep run on every monitoring tick, whatever the pressure
    fn sweep(&self) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub rss_bytes: u64,
    pub heap_bytes: u64,
    pub limit_bytes: u64,
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedMemoryStats {
    pub rss: String,
    pub heap: String,
    pub limit: String,
    pub utilization: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAlert {
    pub level: PressureLevel,
    pub utilization: f64,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcStats {
    pub runs: u64,
    pub skipped: u64,
    pub total_freed_bytes: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
    pub gc_trigger: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetrics {
    pub current: MemoryStats,
    pub level: PressureLevel,
    pub thresholds: Thresholds,
    pub gc: GcStats,
    pub alerts: Vec<MemoryAlert>,
}

/// Outcome of one collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcOutcome {
    pub freed_bytes: u64,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct OptimizerState {
    level: PressureLevel,
    gc: GcStats,
    last_gc_at: Option<Instant>,
    alerts: VecDeque<MemoryAlert>,
}

pub struct MemoryOptimizer {
    config: MemoryConfig,
    probe: Arc<dyn MemoryProbe>,
    reclaimers: RwLock<Vec<Arc<dyn Reclaimer>>>,
    state: Mutex<OptimizerState>,
    events: Option<Arc<EventBus>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl MemoryOptimizer {
    pub fn new(config: MemoryConfig) -> Result<Self> {
        Self::with_probe(config, Arc::new(ProcessMemoryProbe::new()))
    }

    pub fn with_probe(config: MemoryConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            probe,
            reclaimers: RwLock::new(Vec::new()),
            state: Mutex::new(OptimizerState::default()),
            events: None,
            monitor: Mutex::new(None),
            is_shutdown: AtomicBool::new(false),
        })
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn register_reclaimer(&self, reclaimer: Arc<dyn Reclaimer>) {
        if let Ok(mut reclaimers) = self.reclaimers.write() {
            debug!(reclaimer = reclaimer.name(), "Registered memory reclaimer");
            reclaimers.push(reclaimer);
        }
    }

    pub fn get_memory_stats(&self) -> MemoryStats {
        let sample = self.probe.sample();
        MemoryStats {
            rss_bytes: sample.rss_bytes,
            heap_bytes: sample.heap_bytes,
            limit_bytes: self.config.memory_limit_bytes,
            utilization: sample.rss_bytes as f64 / self.config.memory_limit_bytes as f64,
        }
    }

    pub fn formatted_stats(&self) -> FormattedMemoryStats {
        let stats = self.get_memory_stats();
        FormattedMemoryStats {
            rss: format!("{:.2} MB", stats.rss_bytes as f64 / MB),
            heap: format!("{:.2} MB", stats.heap_bytes as f64 / MB),
            limit: format!("{:.2} MB", stats.limit_bytes as f64 / MB),
            utilization: format!("{:.2}%", stats.utilization * 100.0),
        }
    }

    /// Manual collection; never rate-limited
    pub fn trigger_garbage_collection(&self, reason: &str) -> GcOutcome {
        self.collect(reason)
    }

    /// Sample once, raise an alert on a threshold crossing and collect when
    /// utilization passes the gc trigger.
    pub fn check(&self) -> PressureLevel {
        let stats = self.get_memory_stats();
        let level = self.classify(stats.utilization);

        let (crossed, gc_due) = {
            let mut state = self.lock_state();
            let crossed = level != state.level;
            if crossed && level != PressureLevel::Normal {
                state.alerts.push_back(MemoryAlert {
                    level,
                    utilization: stats.utilization,
                    raised_at: Utc::now(),
                });
                while state.alerts.len() > self.config.max_alert_history {
                    state.alerts.pop_front();
                }
            }
            state.level = level;

            let mut gc_due = stats.utilization >= self.config.gc_trigger_threshold;
            if gc_due {
                let recent = state
                    .last_gc_at
                    .map(|at| at.elapsed() < self.config.min_gc_interval)
                    .unwrap_or(false);
                if recent {
                    state.gc.skipped += 1;
                    gc_due = false;
                }
            }
            (crossed, gc_due)
        };

        if crossed {
            match level {
                PressureLevel::Normal => info!(utilization = stats.utilization, "Memory pressure relieved"),
                _ => {
                    warn!(?level, utilization = stats.utilization, "Memory pressure alert");
                    self.emit(CoreEvent::MemoryAlert {
                        level,
                        utilization: stats.utilization,
                    });
                }
            }
        }
        if gc_due {
            self.collect("threshold");
        }
        level
    }

    /// Level observed by the most recent `check`
    pub fn current_level(&self) -> PressureLevel {
        self.lock_state().level
    }

    pub fn get_metrics(&self) -> MemoryMetrics {
        let current = self.get_memory_stats();
        let state = self.lock_state();
        MemoryMetrics {
            current,
            level: state.level,
            thresholds: Thresholds {
                warning: self.config.warning_threshold,
                critical: self.config.critical_threshold,
                gc_trigger: self.config.gc_trigger_threshold,
            },
            gc: state.gc.clone(),
            alerts: state.alerts.iter().cloned().collect(),
        }
    }

    /// Spawn the periodic `check` loop. The task holds only a weak reference
    /// and exits once the optimizer is dropped or shut down.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.check_interval;
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(optimizer) = weak.upgrade() else {
                    break;
                };
                if optimizer.is_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                optimizer.check();
                optimizer.sweep();
            }
        }));
        info!(interval_ms = period.as_millis() as u64, "Memory monitoring started");
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .map(|m| m.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    fn classify(&self, utilization: f64) -> PressureLevel {
        if utilization >= self.config.critical_threshold {
            PressureLevel::Critical
        } else if utilization >= self.config.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    fn sweep(&self) {
        let reclaimers: Vec<Arc<dyn Reclaimer>> = self
            .reclaimers
            .read()
            .map(|r| r.clone())
            .unwrap_or_default();
        for reclaimer in reclaimers {
            reclaimer.sweep();
        }
    }

    fn collect(&self, reason: &str) -> GcOutcome {
        let started = Instant::now();
        let reclaimers: Vec<Arc<dyn Reclaimer>> = self
            .reclaimers
            .read()
            .map(|r| r.clone())
            .unwrap_or_default();
        let freed_bytes: u64 = reclaimers.iter().map(|r| r.reclaim(reason)).sum();
        let duration = started.elapsed();

        {
            let mut state = self.lock_state();
            state.last_gc_at = Some(Instant::now());
            state.gc.runs += 1;
            state.gc.total_freed_bytes += freed_bytes;
            state.gc.last_run_at = Some(Utc::now());
            state.gc.last_reason = Some(reason.to_string());
        }

        info!(reason, freed_bytes, duration_ms = duration.as_millis() as u64, "Memory collection completed");
        self.emit(CoreEvent::GcCompleted {
            reason: reason.to_string(),
            freed_bytes,
            duration_ms: duration.as_millis() as u64,
        });
        GcOutcome {
            freed_bytes,
            duration,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, OptimizerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CoreEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

impl Drop for MemoryOptimizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::BufferingEventSink;
    use pretty_assertions::assert_eq;

    const LIMIT: u64 = 1000;

    #[derive(Default)]
    struct CountingReclaimer {
        freed: u64,
        calls: AtomicU64,
        sweeps: AtomicU64,
    }

    impl Reclaimer for CountingReclaimer {
        fn name(&self) -> &str {
            "counting"
        }

        fn reclaim(&self, _reason: &str) -> u64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.freed
        }

        fn sweep(&self) {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn optimizer(probe: Arc<FixedMemoryProbe>) -> MemoryOptimizer {
        MemoryOptimizer::with_probe(
            MemoryConfig {
                memory_limit_bytes: LIMIT,
                ..Default::default()
            },
            probe,
        )
        .unwrap()
    }

    #[test]
    fn test_process_probe_reads_current_process() {
        let probe = ProcessMemoryProbe::new();
        let sample = probe.sample();
        assert!(sample.rss_bytes > 0);
        assert!(sample.heap_bytes >= sample.rss_bytes);
    }

    #[test]
    fn test_levels_and_alert_history() {
        let probe = Arc::new(FixedMemoryProbe::new(100));
        let opt = optimizer(probe.clone());

        assert_eq!(opt.check(), PressureLevel::Normal);
        probe.set(750);
        assert_eq!(opt.check(), PressureLevel::Warning);
        // Same level again is not a new crossing
        assert_eq!(opt.check(), PressureLevel::Warning);
        probe.set(950);
        assert_eq!(opt.check(), PressureLevel::Critical);
        probe.set(100);
        assert_eq!(opt.check(), PressureLevel::Normal);

        let levels: Vec<_> = opt.get_metrics().alerts.iter().map(|a| a.level).collect();
        assert_eq!(levels, vec![PressureLevel::Warning, PressureLevel::Critical]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_gc_is_rate_limited() {
        let probe = Arc::new(FixedMemoryProbe::new(850));
        let opt = optimizer(probe);
        let reclaimer = Arc::new(CountingReclaimer {
            freed: 64,
            ..Default::default()
        });
        opt.register_reclaimer(reclaimer.clone());

        opt.check();
        opt.check();
        assert_eq!(reclaimer.calls.load(Ordering::SeqCst), 1);

        // Manual triggers ignore the interval
        let outcome = opt.trigger_garbage_collection("manual");
        assert_eq!(outcome.freed_bytes, 64);

        tokio::time::advance(Duration::from_secs(61)).await;
        opt.check();

        let gc = opt.get_metrics().gc;
        assert_eq!(gc.runs, 3);
        assert_eq!(gc.skipped, 1);
        assert_eq!(gc.total_freed_bytes, 192);
        assert_eq!(gc.last_reason.as_deref(), Some("threshold"));
    }

    #[test]
    fn test_gc_emits_completion_event() {
        let bus = Arc::new(EventBus::new(8));
        let sink = Arc::new(BufferingEventSink::new());
        bus.attach_sink(sink.clone());
        let opt = optimizer(Arc::new(FixedMemoryProbe::new(0))).with_events(bus);

        opt.trigger_garbage_collection("test");
        let events = sink.get_events();
        assert!(matches!(
            &events[0].event,
            CoreEvent::GcCompleted { reason, freed_bytes: 0, .. } if reason == "test"
        ));
    }

    #[test]
    fn test_formatted_stats() {
        let opt = MemoryOptimizer::with_probe(
            MemoryConfig {
                memory_limit_bytes: 4 * 1024 * 1024,
                ..Default::default()
            },
            Arc::new(FixedMemoryProbe::new(1024 * 1024)),
        )
        .unwrap();
        let formatted = opt.formatted_stats();
        assert_eq!(formatted.rss, "1.00 MB");
        assert_eq!(formatted.limit, "4.00 MB");
        assert_eq!(formatted.utilization, "25.00%");
    }

    #[test]
    fn test_metrics_idempotent() {
        let opt = optimizer(Arc::new(FixedMemoryProbe::new(500)));
        opt.check();
        assert_eq!(opt.get_metrics(), opt.get_metrics());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_loop() {
        let probe = Arc::new(FixedMemoryProbe::new(950));
        let opt = Arc::new(optimizer(probe));
        let reclaimer = Arc::new(CountingReclaimer::default());
        opt.register_reclaimer(reclaimer.clone());
        opt.start_monitoring();
        assert!(opt.is_monitoring());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(opt.current_level(), PressureLevel::Critical);
        assert!(reclaimer.sweeps.load(Ordering::SeqCst) >= 1);

        opt.shutdown();
        assert!(!opt.is_monitoring());
    }
}
