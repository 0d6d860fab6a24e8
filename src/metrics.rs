//! Counters and duration timers for pipeline calls.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

pub const FEEDBACK_SUCCESS: &str = "ai.feedback.processing.success";
pub const FEEDBACK_FAILURE: &str = "ai.feedback.processing.failure";
pub const FEEDBACK_DURATION: &str = "ai.feedback.processing.duration";
pub const COACHING_SUCCESS: &str = "ai.coaching.generation.success";
pub const COACHING_FAILURE: &str = "ai.coaching.generation.failure";
pub const COACHING_DURATION: &str = "ai.coaching.generation.duration";

/// Observability collaborator. Implementations must tolerate concurrent
/// callers from every pipeline.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str);
    fn record_duration(&self, name: &str, elapsed_ms: u64);
}

#[derive(Default)]
struct Timer {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl TimerSnapshot {
    pub fn mean_ms(&self) -> u64 {
        self.total_ms.checked_div(self.count).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub timers: BTreeMap<String, TimerSnapshot>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn timer(&self, name: &str) -> TimerSnapshot {
        self.timers.get(name).cloned().unwrap_or_default()
    }
}

/// Process-local sink. Series are created on first use and updated with
/// atomics; the map lock is only written when a new name appears.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    timers: RwLock<BTreeMap<String, Arc<Timer>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(c) = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return c.clone();
        }
        self.counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn timer(&self, name: &str) -> Arc<Timer> {
        if let Some(t) = self
            .timers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return t.clone();
        }
        self.timers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, c)| (name.clone(), c.load(Ordering::Relaxed)))
            .collect();
        let timers = self
            .timers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    TimerSnapshot {
                        count: t.count.load(Ordering::Relaxed),
                        total_ms: t.total_ms.load(Ordering::Relaxed),
                        max_ms: t.max_ms.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        MetricsSnapshot { counters, timers }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str) {
        self.counter(name).fetch_add(1, Ordering::Relaxed);
    }

    fn record_duration(&self, name: &str, elapsed_ms: u64) {
        let timer = self.timer(name);
        timer.count.fetch_add(1, Ordering::Relaxed);
        timer.total_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        timer.max_ms.fetch_max(elapsed_ms, Ordering::Relaxed);
    }
}
