//! The flow table: stitches periodic snapshots into per-flow series.
//!
//! End-of-flow is defined as absence from the next snapshot. That is the
//! only signal the kernel gives for ESTABLISHED sockets leaving
//! ESTABLISHED, and it is why the sampler requests that state alone.

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use tracing::debug;

use crate::sampler::{FlowId, Sample, SampleData};

/// Tracker limits. Zero means unlimited in both cases.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// Maximum number of recorded (non-filtered) flows at a time. Flows
    /// over the limit are still tracked, but record nothing and are
    /// never emitted.
    pub max_flows: usize,
    /// Minimum series length an ended flow needs to be emitted.
    pub min_samples: usize,
}

/// One tracked flow and its accumulated series.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: FlowId,
    /// Snapshot rows in insertion order. Empty only for filtered flows.
    pub data: Vec<SampleData>,
    /// Wall time of first observation.
    pub start_time: SystemTime,
    /// Wall time the flow was recognized as ended.
    pub end_time: SystemTime,
    /// Admission rejected: tracked but nothing recorded, never emitted.
    pub filtered: bool,
    /// Seen in the current tick; cleared before the next one.
    pub sampled: bool,
    /// First observed on the tracker's initial tick, so it presumably
    /// predates this run.
    pub pre_existing: bool,
    /// The flow's lifetime extends beyond the observation window.
    pub partial: bool,
    /// Observations elided because they matched the previous row.
    pub samples_deduped: u32,
    /// Monotonic time of the last observation, deduplicated ones
    /// included, so it advances even when no row is appended.
    pub end_tstamp_ns: u64,
}

/// Per-tick counters, logged at debug level.
#[derive(Debug, Clone, Copy, Default)]
struct TickStats {
    new: usize,
    filtered: usize,
    updated: usize,
    deduped: usize,
    ended: usize,
    deleted: usize,
}

pub struct Tracker {
    cfg: Config,
    flows: HashMap<FlowId, Flow>,
    first_tick: bool,
}

impl Tracker {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            flows: HashMap::new(),
            first_tick: true,
        }
    }

    /// Number of flows currently in the table.
    pub fn tracked(&self) -> usize {
        self.flows.len()
    }

    /// One tick: fold the snapshot into the table, then sweep for flows
    /// the snapshot no longer contains. Returns the ended flows that
    /// pass admission, removed from the table.
    pub fn track(&mut self, samples: &[Sample]) -> Vec<Flow> {
        let t0 = Instant::now();
        let now = SystemTime::now();
        let mut stats = TickStats::default();

        self.update(samples, now, &mut stats);
        let ended = self.cleanup(now, &mut stats);
        stats.ended = ended.len();

        self.first_tick = false;

        debug!(
            elapsed_us = t0.elapsed().as_micros() as u64,
            new = stats.new,
            filtered = stats.filtered,
            updated = stats.updated,
            deduped = stats.deduped,
            ended = stats.ended,
            deleted = stats.deleted,
            tracked = self.flows.len(),
            "tracker tick",
        );

        ended
    }

    fn update(&mut self, samples: &[Sample], now: SystemTime, stats: &mut TickStats) {
        for s in samples {
            match self.flows.get_mut(&s.id) {
                None => {
                    let filtered =
                        self.cfg.max_flows > 0 && self.flows.len() + 1 > self.cfg.max_flows;
                    let mut data = Vec::new();
                    if !filtered {
                        data.reserve(16);
                        data.push(s.data);
                    }
                    self.flows.insert(s.id, Flow {
                        id: s.id,
                        data,
                        start_time: now,
                        end_time: SystemTime::UNIX_EPOCH,
                        filtered,
                        sampled: true,
                        pre_existing: self.first_tick,
                        partial: true,
                        samples_deduped: 0,
                        end_tstamp_ns: s.data.tstamp_ns,
                    });
                    if filtered {
                        stats.filtered += 1;
                    } else {
                        stats.new += 1;
                    }
                }
                Some(flow) => {
                    flow.sampled = true;
                    if flow.filtered {
                        continue;
                    }
                    // The end timestamp follows every observation, even
                    // ones that dedup away.
                    flow.end_tstamp_ns = s.data.tstamp_ns;
                    match flow.data.last_mut() {
                        Some(last) if last.equivalent_to(&s.data) => {
                            // Aggregate option bits across dropped rows
                            // so a flag seen only in an elided sample
                            // still surfaces in the summary.
                            last.options |= s.data.options;
                            flow.samples_deduped += 1;
                            stats.deduped += 1;
                            continue;
                        }
                        _ => {}
                    }
                    flow.data.push(s.data);
                    stats.updated += 1;
                }
            }
        }
    }

    /// Flows the snapshot skipped have ended. Filtered and under-length
    /// flows are deleted without being returned.
    fn cleanup(&mut self, now: SystemTime, stats: &mut TickStats) -> Vec<Flow> {
        let mut ended_ids = Vec::new();
        for (id, flow) in self.flows.iter_mut() {
            if flow.sampled {
                flow.sampled = false; // prepare for the next tick
            } else {
                ended_ids.push(*id);
            }
        }

        let mut ended = Vec::new();
        for id in &ended_ids {
            if let Some(mut flow) = self.flows.remove(id) {
                flow.partial = flow.pre_existing;
                flow.end_time = now;
                if !flow.filtered
                    && (self.cfg.min_samples == 0 || flow.data.len() >= self.cfg.min_samples)
                {
                    ended.push(flow);
                }
            }
        }

        stats.deleted = ended_ids.len();
        ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::options;

    fn id(n: u8) -> FlowId {
        FlowId {
            src_ip: [10, 0, 0, n],
            src_port: 5_000 + u16::from(n),
            dst_ip: [192, 0, 2, 1],
            dst_port: 443,
        }
    }

    fn sample(n: u8, tstamp_ns: u64, rtt_us: u32) -> Sample {
        Sample {
            id: id(n),
            data: SampleData {
                tstamp_ns,
                options: options::TIMESTAMPS,
                rtt_us,
                min_rtt_us: rtt_us / 2,
                snd_cwnd_bytes: 14_480,
                pacing_rate_bps: 1_000_000,
                total_retransmits: 0,
                bytes_acked: 1_000,
            },
        }
    }

    #[test]
    fn test_new_flow_then_end_by_absence() {
        let mut t = Tracker::new(Config::default());

        assert!(t.track(&[sample(1, 100, 500)]).is_empty());
        assert_eq!(t.tracked(), 1);

        let ended = t.track(&[]);
        assert_eq!(ended.len(), 1);
        assert_eq!(t.tracked(), 0, "ended flow removed from the table");

        let f = &ended[0];
        assert_eq!(f.id, id(1));
        assert_eq!(f.data.len(), 1);
        assert_eq!(f.end_tstamp_ns, 100);
        assert!(f.pre_existing, "first-tick flows are pre-existing");
        assert!(f.partial, "pre-existing flows end partial");
    }

    #[test]
    fn test_flow_ended_exactly_once() {
        let mut t = Tracker::new(Config::default());
        t.track(&[sample(1, 100, 500)]);
        assert_eq!(t.track(&[]).len(), 1);
        assert!(t.track(&[]).is_empty());
        assert!(t.track(&[]).is_empty());
    }

    #[test]
    fn test_dedup_idempotent() {
        let mut t = Tracker::new(Config::default());
        t.track(&[sample(1, 100, 500)]);
        // Same values, later timestamp: elided, but the end timestamp
        // still advances.
        t.track(&[sample(1, 200, 500)]);

        let ended = t.track(&[]);
        assert_eq!(ended.len(), 1);
        let f = &ended[0];
        assert_eq!(f.data.len(), 1, "row list unchanged by the duplicate");
        assert_eq!(f.samples_deduped, 1);
        assert_eq!(f.end_tstamp_ns, 200, "end timestamp takes the later value");
    }

    #[test]
    fn test_dedup_ignores_options_but_aggregates_them() {
        let mut t = Tracker::new(Config::default());
        let mut first = sample(1, 100, 500);
        first.data.options = options::TIMESTAMPS;
        let mut second = sample(1, 200, 500);
        second.data.options = options::TIMESTAMPS | options::ECN_SEEN;

        t.track(&[first]);
        t.track(&[second]);

        let ended = t.track(&[]);
        let f = &ended[0];
        assert_eq!(f.samples_deduped, 1, "options do not break equivalence");
        assert_eq!(
            f.data[0].options,
            options::TIMESTAMPS | options::ECN_SEEN,
            "flags from the elided sample still aggregate",
        );
    }

    #[test]
    fn test_changed_value_appends() {
        let mut t = Tracker::new(Config::default());
        t.track(&[sample(1, 100, 500)]);
        t.track(&[sample(1, 200, 501)]);
        t.track(&[sample(1, 300, 501)]);

        let ended = t.track(&[]);
        let f = &ended[0];
        assert_eq!(f.data.len(), 2);
        assert_eq!(f.samples_deduped, 1);
        assert_eq!(f.data[0].tstamp_ns, 100);
        assert_eq!(f.data[1].tstamp_ns, 200);
        assert_eq!(f.end_tstamp_ns, 300);
    }

    #[test]
    fn test_pre_existing_only_on_first_tick() {
        let mut t = Tracker::new(Config::default());
        t.track(&[sample(1, 100, 500)]);
        t.track(&[sample(1, 200, 501), sample(2, 200, 700)]);

        let mut ended = t.track(&[]);
        ended.sort_by_key(|f| f.id.src_port);
        assert_eq!(ended.len(), 2);
        assert!(ended[0].pre_existing && ended[0].partial);
        assert!(!ended[1].pre_existing && !ended[1].partial);
    }

    #[test]
    fn test_max_flows_admission() {
        let mut t = Tracker::new(Config {
            max_flows: 2,
            min_samples: 0,
        });

        // Three flows arrive in one tick; exactly one exceeds the limit
        // and stays filtered for its whole lifetime.
        t.track(&[sample(1, 100, 500), sample(2, 100, 500), sample(3, 100, 500)]);
        assert_eq!(t.tracked(), 3, "filtered flows still occupy the table");

        // Later ticks would have room again, but the filtered flow must
        // not be admitted retroactively.
        t.track(&[sample(1, 200, 501), sample(2, 200, 501), sample(3, 200, 501)]);

        let ended = t.track(&[]);
        assert_eq!(ended.len(), 2, "the filtered flow is never emitted");
        assert!(ended.iter().all(|f| !f.filtered));
        assert!(ended.iter().all(|f| !f.data.is_empty()));
        assert_eq!(t.tracked(), 0);
    }

    #[test]
    fn test_filtered_flow_records_nothing() {
        let mut t = Tracker::new(Config {
            max_flows: 1,
            min_samples: 0,
        });
        t.track(&[sample(1, 100, 500), sample(2, 100, 500)]);
        t.track(&[sample(2, 200, 777)]);

        // Flow 1 ends; flow 2 (filtered) ends next tick and vanishes.
        let ended = t.track(&[]);
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].id, id(1));
        assert!(t.track(&[]).is_empty());
    }

    #[test]
    fn test_min_samples_admission() {
        let mut t = Tracker::new(Config {
            max_flows: 0,
            min_samples: 5,
        });

        for tick in 0..4u64 {
            t.track(&[sample(1, 100 * (tick + 1), 500 + tick as u32)]);
        }
        assert!(t.track(&[]).is_empty(), "4 samples are silently discarded");

        for tick in 0..5u64 {
            t.track(&[sample(2, 100 * (tick + 1), 500 + tick as u32)]);
        }
        let ended = t.track(&[]);
        assert_eq!(ended.len(), 1, "5 samples pass admission");
        assert_eq!(ended[0].data.len(), 5);
    }

    #[test]
    fn test_series_invariant() {
        let mut t = Tracker::new(Config::default());
        t.track(&[sample(1, 100, 500)]);
        t.track(&[sample(1, 250, 600)]);
        let ended = t.track(&[]);
        let f = &ended[0];
        assert!(f.data[0].tstamp_ns <= f.end_tstamp_ns);
    }
}
