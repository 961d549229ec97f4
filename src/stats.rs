use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Run counters shared by the dispatcher and the aggregation worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Rounds,
    Spawned,
    SpawnFailed,
    SkippedBackpressure,
    Completed,
    NonzeroExit,
    ParseFailures,
    EndpointRows,
    SecondaryRows,
    RawRemoved,
}

const COUNTER_CARDINALITY: usize = 10;

impl Counter {
    pub const ALL: [Counter; COUNTER_CARDINALITY] = [
        Self::Rounds,
        Self::Spawned,
        Self::SpawnFailed,
        Self::SkippedBackpressure,
        Self::Completed,
        Self::NonzeroExit,
        Self::ParseFailures,
        Self::EndpointRows,
        Self::SecondaryRows,
        Self::RawRemoved,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rounds => "rounds",
            Self::Spawned => "spawned",
            Self::SpawnFailed => "spawn_failed",
            Self::SkippedBackpressure => "skipped_backpressure",
            Self::Completed => "completed",
            Self::NonzeroExit => "nonzero_exit",
            Self::ParseFailures => "parse_failures",
            Self::EndpointRows => "endpoint_rows",
            Self::SecondaryRows => "secondary_rows",
            Self::RawRemoved => "raw_removed",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free run counters.
///
/// Totals are monotonic for the run. `snapshot()` reads and resets a
/// separate window so periodic reports show per-interval deltas.
pub struct RunStats {
    totals: [AtomicU64; COUNTER_CARDINALITY],
    window: [AtomicU64; COUNTER_CARDINALITY],
    in_flight: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            totals: std::array::from_fn(|_| AtomicU64::new(0)),
            window: std::array::from_fn(|_| AtomicU64::new(0)),
            in_flight: AtomicU64::new(0),
        }
    }

    /// Increment a counter by one.
    pub fn record(&self, c: Counter) {
        self.record_n(c, 1);
    }

    /// Increment a counter by n.
    pub fn record_n(&self, c: Counter, n: u64) {
        if n == 0 {
            return;
        }
        let idx = c as usize;
        if let (Some(total), Some(window)) = (self.totals.get(idx), self.window.get(idx)) {
            total.fetch_add(n, Ordering::Relaxed);
            window.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Run-lifetime value of a counter.
    pub fn total(&self, c: Counter) -> u64 {
        self.totals
            .get(c as usize)
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    pub fn set_in_flight(&self, n: usize) {
        self.in_flight.store(n as u64, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Atomically read and reset the window, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(Counter, u64)> {
        let mut result = Vec::new();

        for counter in Counter::ALL {
            if let Some(slot) = self.window.get(counter as usize) {
                let v = slot.swap(0, Ordering::Relaxed);
                if v > 0 {
                    result.push((counter, v));
                }
            }
        }

        result
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}
