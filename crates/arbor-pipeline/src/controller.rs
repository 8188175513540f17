//! Adaptive performance controller
//!
//! Closes the loop between measured render cost and pipeline throughput: frame
//! samples go in, a throttle level comes out on a watch channel read by the
//! gateway and the scheduler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arbor_core::config::ThrottleConfig;
use serde::Serialize;
use sysinfo::System;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::caches::PipelineCaches;
use crate::events::PipelineEvent;
use crate::throttle::{ThrottleReader, ThrottleState, clamp_level};

/// Memory use above which both caches are dropped.
pub const MEMORY_PRESSURE_PERCENT: f64 = 80.0;
/// CPU use above which the throttle level is raised.
pub const CPU_PRESSURE_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of process-wide resource readings.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Host readings through sysinfo.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        SysinfoProbe {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> ResourceUsage {
        let mut system = lock(&self.system);
        system.refresh_memory();
        system.refresh_cpu_usage();
        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };
        ResourceUsage {
            cpu_percent: system.global_cpu_usage() as f64,
            memory_percent,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct PerformanceController {
    config: ThrottleConfig,
    frames: Mutex<VecDeque<f64>>,
    state: watch::Sender<ThrottleState>,
    probe: Arc<dyn ResourceProbe>,
    ticks: AtomicU64,
    resources: Mutex<ResourceUsage>,
    caches: Arc<PipelineCaches>,
    events: broadcast::Sender<PipelineEvent>,
}

impl std::fmt::Debug for PerformanceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceController")
            .field("state", &self.state())
            .field("frames", &lock(&self.frames).len())
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .finish()
    }
}

impl PerformanceController {
    pub fn new(
        config: ThrottleConfig,
        probe: Arc<dyn ResourceProbe>,
        caches: Arc<PipelineCaches>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ThrottleState {
            adaptive_enabled: config.adaptive,
            ..ThrottleState::default()
        });
        PerformanceController {
            frames: Mutex::new(VecDeque::with_capacity(config.window)),
            config,
            state,
            probe,
            ticks: AtomicU64::new(0),
            resources: Mutex::new(ResourceUsage::default()),
            caches,
            events,
        }
    }

    /// Read side of the throttle state.
    pub fn subscribe(&self) -> ThrottleReader {
        self.state.subscribe()
    }

    pub fn state(&self) -> ThrottleState {
        *self.state.borrow()
    }

    /// Record one frame's render duration. Keeps the most recent `window` samples.
    pub fn sample_frame(&self, duration_ms: f64) {
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            debug!("Ignoring frame sample {}", duration_ms);
            return;
        }
        let mut frames = lock(&self.frames);
        frames.push_back(duration_ms);
        while frames.len() > self.config.window {
            frames.pop_front();
        }
    }

    /// Moving-average frames per second, `None` before any sample.
    pub fn fps(&self) -> Option<f64> {
        let frames = lock(&self.frames);
        if frames.is_empty() {
            return None;
        }
        let average = frames.iter().sum::<f64>() / frames.len() as f64;
        if average <= 0.0 {
            return None;
        }
        Some(1000.0 / average)
    }

    pub fn resources(&self) -> ResourceUsage {
        *lock(&self.resources)
    }

    /// One control step: adjust the level from FPS, and on every
    /// `resource_check_every`-th tick react to CPU and memory pressure.
    pub fn tick(&self) -> ThrottleState {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let current = self.state();
        let mut steps: i32 = 0;

        if current.adaptive_enabled {
            if let Some(fps) = self.fps() {
                if fps < self.config.min_fps {
                    steps += 2;
                } else if fps < self.config.target_fps {
                    steps += 1;
                } else if fps > self.config.target_fps * 1.5 {
                    steps -= 1;
                }
            }
        }

        let every = u64::from(self.config.resource_check_every.max(1));
        if ticks % every == 0 {
            let usage = self.probe.sample();
            *lock(&self.resources) = usage;
            debug!("Resource usage: cpu {:.1}%, memory {:.1}%", usage.cpu_percent, usage.memory_percent);

            if usage.memory_percent > MEMORY_PRESSURE_PERCENT {
                warn!("Memory at {:.1}%, clearing caches", usage.memory_percent);
                self.caches.clear_all();
                let _ = self.events.send(PipelineEvent::CachesCleared {
                    reason: "memory pressure".to_string(),
                });
            }
            if usage.cpu_percent > CPU_PRESSURE_PERCENT && current.adaptive_enabled {
                warn!("CPU at {:.1}%, raising throttle", usage.cpu_percent);
                steps += 2;
            }
        }

        if steps == 0 {
            return current;
        }
        self.write(ThrottleState {
            level: current.level + f64::from(steps) * self.config.step,
            ..current
        })
    }

    /// Manual override of the level; clamped to the valid range.
    pub fn set_level(&self, level: f64) -> ThrottleState {
        let current = self.state();
        self.write(ThrottleState { level, ..current })
    }

    pub fn set_adaptive(&self, enabled: bool) -> ThrottleState {
        let current = self.state();
        self.write(ThrottleState {
            adaptive_enabled: enabled,
            ..current
        })
    }

    fn write(&self, requested: ThrottleState) -> ThrottleState {
        let next = ThrottleState {
            level: clamp_level(requested.level),
            adaptive_enabled: requested.adaptive_enabled,
        };
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                "Throttle level {:.1} -> {:.1} (adaptive: {})",
                previous.level, next.level, next.adaptive_enabled
            );
            let _ = self.events.send(PipelineEvent::ThrottleChanged { state: next });
        }
        next
    }

    /// Tick on the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
        debug!("Performance controller stopped");
    }
}
