//! Latency instrumentation at component boundaries, SLO windows and deadlines.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPath {
    /// Cache hit: one cache read plus deserialize.
    Fast,
    /// Cache miss: store snapshot, override gate, walk, cache fill.
    Slow,
}

/// Per-request timings, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyBreakdown {
    pub cache_us: u64,
    pub db_us: u64,
    pub deserialize_us: u64,
    pub walk_us: u64,
    pub total_us: u64,
    pub query_count: u32,
    pub memo_hits: u64,
}

impl LatencyBreakdown {
    pub fn total_ms(&self) -> f64 {
        self.total_us as f64 / 1000.0
    }
}

pub(crate) fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Wall-clock budget for one resolution request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// A deadline that never expires in practice (write-time dry runs, benches).
    pub fn unbounded() -> Self {
        Self::new(Duration::from_secs(u64::from(u32::MAX)))
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathReport {
    pub samples: usize,
    pub budget_ms: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub breaches: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloReport {
    pub fast_path: PathReport,
    pub slow_path: PathReport,
    pub timeouts: u64,
    pub deadline_ms: u64,
}

struct PathWindow {
    budget: Duration,
    samples: Mutex<VecDeque<u64>>,
    breaches: AtomicU64,
}

impl PathWindow {
    fn new(budget: Duration, capacity: usize) -> Self {
        Self {
            budget,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            breaches: AtomicU64::new(0),
        }
    }

    fn record(&self, elapsed: Duration, capacity: usize) -> bool {
        {
            let mut samples = self.samples.lock();
            if samples.len() == capacity {
                samples.pop_front();
            }
            samples.push_back(micros(elapsed));
        }
        let breached = elapsed > self.budget;
        if breached {
            self.breaches.fetch_add(1, Ordering::Relaxed);
        }
        breached
    }

    fn report(&self) -> PathReport {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        sorted.sort_unstable();
        PathReport {
            samples: sorted.len(),
            budget_ms: u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX),
            p50_ms: percentile_ms(&sorted, 50.0),
            p95_ms: percentile_ms(&sorted, 95.0),
            p99_ms: percentile_ms(&sorted, 99.0),
            breaches: self.breaches.load(Ordering::Relaxed),
        }
    }
}

/// Nearest-rank percentile over sorted microsecond samples, in milliseconds.
fn percentile_ms(sorted_us: &[u64], pct: f64) -> f64 {
    if sorted_us.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted_us.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, sorted_us.len()) - 1;
    sorted_us[idx] as f64 / 1000.0
}

/// Rolling latency windows for both paths. Each path has its own lock so
/// fast-path recording never waits on slow-path bookkeeping.
pub struct SloMonitor {
    capacity: usize,
    deadline: Duration,
    fast: PathWindow,
    slow: PathWindow,
    timeouts: AtomicU64,
}

impl SloMonitor {
    pub fn new(fast_budget: Duration, slow_budget: Duration, deadline: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            deadline,
            fast: PathWindow::new(fast_budget, capacity),
            slow: PathWindow::new(slow_budget, capacity),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Record one completed request; returns the breached budget, if any.
    pub fn record(&self, path: ResolutionPath, elapsed: Duration) -> Option<Duration> {
        let window = match path {
            ResolutionPath::Fast => &self.fast,
            ResolutionPath::Slow => &self.slow,
        };
        window
            .record(elapsed, self.capacity)
            .then_some(window.budget)
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> SloReport {
        SloReport {
            fast_path: self.fast.report(),
            slow_path: self.slow.report(),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            deadline_ms: u64::try_from(self.deadline.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
