//! Pipeline metrics: per-stage duration statistics and flow churn.
//!
//! Each stage pushes its own measurements; the status endpoint reads a
//! snapshot under the shared side of the lock.

use std::fmt::Write as FmtWrite;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::sampler::BatchStats;

/// Running duration statistics. Welford's method keeps the mean and
/// standard deviation incrementally.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationStats {
    pub total: Duration,
    pub n: u64,
    pub min: Duration,
    pub max: Duration,
    mean: f64,
    m2: f64,
}

impl DurationStats {
    pub fn push(&mut self, d: Duration) {
        if self.n == 0 {
            self.min = d;
            self.max = d;
            self.total = d;
        } else {
            if d < self.min {
                self.min = d;
            }
            if d > self.max {
                self.max = d;
            }
            self.total += d;
        }
        self.n += 1;

        let old_mean = self.mean;
        let fd = d.as_nanos() as f64;
        self.mean += (fd - old_mean) / self.n as f64;
        self.m2 += (fd - old_mean) * (fd - self.mean);
    }

    pub fn is_zero(&self) -> bool {
        self.n == 0
    }

    pub fn mean(&self) -> Duration {
        Duration::from_nanos(self.mean as u64)
    }

    pub fn variance(&self) -> f64 {
        if self.n > 1 {
            self.m2 / (self.n - 1) as f64
        } else {
            0.0
        }
    }

    pub fn stddev(&self) -> Duration {
        Duration::from_nanos(self.variance().sqrt() as u64)
    }
}

/// A copy of the current counters, safe to hold without the lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub sample_times: DurationStats,
    pub convert_times: DurationStats,
    pub track_times: DurationStats,
    pub analyze_times: DurationStats,
    pub write_times: DurationStats,

    pub tracked_flows: usize,
    pub ended_flows: u64,
    pub inst_churn_rate: f64,

    pub samples_total: u64,
    pub msgs_total: u64,
    pub msg_bytes_total: u64,
    pub sampler_errors: u64,
}

struct Inner {
    snap: Snapshot,
    prior_ended_flows: u64,
    prior_track_time: Option<Instant>,
}

pub struct Metrics {
    start: Instant,
    inner: RwLock<Inner>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            inner: RwLock::new(Inner {
                snap: Snapshot::default(),
                prior_ended_flows: 0,
                prior_track_time: None,
            }),
        }
    }

    pub fn push_sample(&self, d: Duration, stats: &BatchStats) {
        let mut inner = self.inner.write();
        inner.snap.sample_times.push(d);
        inner.snap.samples_total += stats.samples as u64;
        inner.snap.msgs_total += stats.msgs as u64;
        inner.snap.msg_bytes_total += stats.msgs_len as u64;
    }

    pub fn push_convert(&self, d: Duration) {
        self.inner.write().snap.convert_times.push(d);
    }

    pub fn push_track(&self, d: Duration, tracked: usize, ended: usize) {
        let now = Instant::now();
        let mut inner = self.inner.write();

        inner.snap.track_times.push(d);
        inner.snap.tracked_flows = tracked;
        inner.snap.ended_flows += ended as u64;

        if let Some(prior) = inner.prior_track_time {
            let secs = now.duration_since(prior).as_secs_f64();
            if secs > 0.0 {
                inner.snap.inst_churn_rate =
                    (inner.snap.ended_flows - inner.prior_ended_flows) as f64 / secs;
            }
        }
        inner.prior_ended_flows = inner.snap.ended_flows;
        inner.prior_track_time = Some(now);
    }

    pub fn push_analyze(&self, d: Duration) {
        self.inner.write().snap.analyze_times.push(d);
    }

    pub fn push_write(&self, d: Duration) {
        self.inner.write().snap.write_times.push(d);
    }

    pub fn record_sampler_error(&self) {
        self.inner.write().snap.sampler_errors += 1;
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.read().snap
    }

    /// Mean flow churn since startup, in flows per second.
    pub fn churn_rate(&self) -> f64 {
        let ended = self.inner.read().snap.ended_flows;
        let secs = self.start.elapsed().as_secs_f64();
        if secs > 0.0 {
            ended as f64 / secs
        } else {
            0.0
        }
    }

    /// Plain-text dump served by the status page and logged on demand.
    pub fn render(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::with_capacity(1024);

        let _ = writeln!(out, "Tracking {} flows", snap.tracked_flows);
        let _ = writeln!(out);
        let _ = writeln!(out, "Churn rate (flows/sec):");
        let _ = writeln!(out, "-----------------------");
        let _ = writeln!(out, "Instantaneous  {:.2}", snap.inst_churn_rate);
        let _ = writeln!(out, "Mean           {:.2}", self.churn_rate());
        let _ = writeln!(out);
        let _ = writeln!(out, "Pipeline stage times (us):");
        let _ = writeln!(out, "--------------------------");
        let _ = writeln!(
            out,
            "{:<8} {:>8} {:>10} {:>10} {:>10} {:>10}",
            "Stage", "Calls", "Min", "Mean", "Max", "Stddev",
        );
        for (name, st) in [
            ("Sample", snap.sample_times),
            ("Convert", snap.convert_times),
            ("Track", snap.track_times),
            ("Analyze", snap.analyze_times),
            ("Write", snap.write_times),
        ] {
            let _ = writeln!(
                out,
                "{:<8} {:>8} {:>10} {:>10} {:>10} {:>10}",
                name,
                st.n,
                st.min.as_micros(),
                st.mean().as_micros(),
                st.max.as_micros(),
                st.stddev().as_micros(),
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Sampler totals:");
        let _ = writeln!(out, "---------------");
        let _ = writeln!(out, "Samples   {}", snap.samples_total);
        let _ = writeln!(out, "Messages  {}", snap.msgs_total);
        let _ = writeln!(out, "Bytes     {}", snap.msg_bytes_total);
        let _ = writeln!(out, "Errors    {}", snap.sampler_errors);

        out
    }
}
