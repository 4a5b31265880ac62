//! Per-flow summary statistics computed when a flow ends.

pub mod stat;

use std::net::Ipv4Addr;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sampler::options;
use crate::tracker::Flow;

pub use stat::QuantileKind;

/// Sentinel emitted when a correlation is NaN or infinite, e.g. for a
/// constant series with zero variance.
pub const CORR_UNDEFINED: f64 = -2.0;

/// Sentinel emitted when a flow has fewer than two samples.
pub const CORR_INSUFFICIENT_SAMPLES: f64 = -3.0;

/// Seven-number summary percentiles.
const SEVEN_NUM_PCTS: [f64; 7] = [0.02, 0.09, 0.25, 0.5, 0.75, 0.91, 0.98];

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// The pacing interval between sample calls; the unit inter-sample
    /// weights are expressed in.
    pub sampler_interval: Duration,
    /// Quantile method for the seven-number summary.
    pub quantile_kind: QuantileKind,
    /// Compute correlations without inter-sample weights.
    pub unweighted_correlations: bool,
    /// Compute quantiles without inter-sample weights.
    pub unweighted_quantiles: bool,
    /// Adjusted correlation `r_adj = r * (1 + (1 - r^2)/2 * n)`.
    pub adjusted_correlation_1: bool,
    /// Adjusted correlation
    /// `r_adj = sqrt(1 - ((1 - r^2)(n - 1))/(n - 2))`, applied only when
    /// `n > 2`. Mutually exclusive with the first adjustment.
    pub adjusted_correlation_2: bool,
}

/// Flow identity in the output. The monotonic first-sample timestamp
/// disambiguates reuses of the same 4-tuple within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatsId {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub tstamp_start_ns: u64,
}

/// The per-flow record handed to the writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    pub id: FlowStatsId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Monotonic time from the first sample to the last observation.
    pub duration_ns: u64,
    /// Number of unique samples retained.
    pub samples: usize,
    pub samples_deduped: u32,
    pub partial: bool,
    /// Any sample had TCP timestamps enabled.
    pub timestamps: bool,
    /// Any sample had SACK enabled.
    pub sack: bool,
    /// Any sample had ECN negotiated.
    pub ecn: bool,
    /// At least one received packet carried ECT.
    pub ecn_seen: bool,
    /// Kernel-tracked minimum RTT from the last sample.
    pub min_rtt_kernel_ms: f64,
    /// Minimum smoothed RTT across the observed samples.
    pub min_rtt_observed_ms: f64,
    pub max_pacing_rate_observed_mbps: f64,
    pub rtt_seven_num_sum: [f64; 7],
    pub corr_rtt_cwnd: f64,
    pub corr_retrans_cwnd: f64,
    pub corr_pacing_cwnd: f64,
    pub total_retransmits: u32,
    pub bytes_acked: u64,
    /// Mean send throughput over the flow's wall-clock lifetime.
    pub send_throughput_mbps: f64,
}

pub struct Analyzer {
    cfg: Config,
}

impl Analyzer {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Computes statistics for each ended flow. Pure with respect to the
    /// inputs; filtered flows never reach this point.
    pub fn analyze(&self, flows: &[Flow]) -> Vec<FlowStats> {
        if flows.is_empty() {
            return Vec::new();
        }

        let t0 = Instant::now();

        let out: Vec<FlowStats> = flows
            .iter()
            .filter(|f| !f.data.is_empty())
            .map(|flow| {
                FlowView {
                    cfg: &self.cfg,
                    flow,
                }
                .analyze()
            })
            .collect();

        debug!(
            elapsed_us = t0.elapsed().as_micros() as u64,
            flows = out.len(),
            "analyzer",
        );

        out
    }
}

/// One flow under analysis.
struct FlowView<'a> {
    cfg: &'a Config,
    flow: &'a Flow,
}

impl FlowView<'_> {
    fn analyze(&self) -> FlowStats {
        let f = self.flow;
        let first = &f.data[0];
        let last = &f.data[f.data.len() - 1];
        let samples = f.data.len();

        let rtts = self.rtts_ms();
        let cwnds = self.cwnds();

        // Weights are shared between quantiles and correlations when
        // either wants them.
        let weights = if self.cfg.unweighted_quantiles && self.cfg.unweighted_correlations {
            None
        } else {
            Some(self.sample_weights())
        };

        let quantile_weights = if self.cfg.unweighted_quantiles {
            None
        } else {
            weights.as_deref()
        };
        let rtt_seven_num_sum = self.seven_num_sum(&rtts, quantile_weights);

        let (corr_rtt_cwnd, corr_retrans_cwnd, corr_pacing_cwnd) = if samples > 1 {
            let corr_weights = if self.cfg.unweighted_correlations {
                None
            } else {
                weights.as_deref()
            };
            (
                self.corr(&rtts, &cwnds, corr_weights),
                self.corr(&self.retrans_per_sec(), &cwnds, corr_weights),
                self.corr(&self.pacing(), &cwnds, corr_weights),
            )
        } else {
            (
                CORR_INSUFFICIENT_SAMPLES,
                CORR_INSUFFICIENT_SAMPLES,
                CORR_INSUFFICIENT_SAMPLES,
            )
        };

        FlowStats {
            id: FlowStatsId {
                src_ip: Ipv4Addr::from(f.id.src_ip),
                src_port: f.id.src_port,
                dst_ip: Ipv4Addr::from(f.id.dst_ip),
                dst_port: f.id.dst_port,
                tstamp_start_ns: first.tstamp_ns,
            },
            start_time: DateTime::<Utc>::from(f.start_time),
            end_time: DateTime::<Utc>::from(f.end_time),
            duration_ns: f.end_tstamp_ns.saturating_sub(first.tstamp_ns),
            samples,
            samples_deduped: f.samples_deduped,
            partial: f.partial,
            timestamps: self.opt_seen(options::TIMESTAMPS),
            sack: self.opt_seen(options::SACK),
            ecn: self.opt_seen(options::ECN),
            ecn_seen: self.opt_seen(options::ECN_SEEN),
            min_rtt_kernel_ms: us_to_ms(last.min_rtt_us),
            min_rtt_observed_ms: us_to_ms(self.min_rtt_observed()),
            max_pacing_rate_observed_mbps: bytes_ps_to_mbps(self.max_pacing_observed()),
            rtt_seven_num_sum,
            corr_rtt_cwnd,
            corr_retrans_cwnd,
            corr_pacing_cwnd,
            total_retransmits: last.total_retransmits,
            bytes_acked: last.bytes_acked,
            send_throughput_mbps: self.send_throughput_mbps(last.bytes_acked),
        }
    }

    fn opt_seen(&self, opt: u8) -> bool {
        self.flow.data.iter().any(|d| d.options & opt != 0)
    }

    fn min_rtt_observed(&self) -> u32 {
        self.flow
            .data
            .iter()
            .map(|d| d.rtt_us)
            .min()
            .unwrap_or_default()
    }

    fn max_pacing_observed(&self) -> u64 {
        self.flow
            .data
            .iter()
            .map(|d| d.pacing_rate_bps)
            .max()
            .unwrap_or_default()
    }

    fn rtts_ms(&self) -> Vec<f64> {
        self.flow.data.iter().map(|d| us_to_ms(d.rtt_us)).collect()
    }

    fn cwnds(&self) -> Vec<f64> {
        self.flow
            .data
            .iter()
            .map(|d| f64::from(d.snd_cwnd_bytes))
            .collect()
    }

    fn pacing(&self) -> Vec<f64> {
        self.flow
            .data
            .iter()
            .map(|d| d.pacing_rate_bps as f64)
            .collect()
    }

    /// Retransmits per second between adjacent samples; the first entry
    /// is zero. Counter deltas wrap like the kernel's counter does.
    fn retrans_per_sec(&self) -> Vec<f64> {
        let data = &self.flow.data;
        let mut r = vec![0.0; data.len()];
        for i in 1..data.len() {
            let delta_sec =
                data[i].tstamp_ns.saturating_sub(data[i - 1].tstamp_ns) as f64 / 1e9;
            let retrans = data[i]
                .total_retransmits
                .wrapping_sub(data[i - 1].total_retransmits);
            if delta_sec > 0.0 {
                r[i] = f64::from(retrans) / delta_sec;
            }
        }
        r
    }

    /// Per-sample weights: how many sampler intervals each sample stood
    /// for. The first sample's gap is unknown, so it gets the median of
    /// the rest; idle flows thus don't let one long gap dominate.
    fn sample_weights(&self) -> Vec<f64> {
        let data = &self.flow.data;
        let interval_ns = self.cfg.sampler_interval.as_nanos() as f64;

        let mut w = vec![0.0; data.len()];
        for i in 1..data.len() {
            w[i] = data[i].tstamp_ns.saturating_sub(data[i - 1].tstamp_ns) as f64 / interval_ns;
        }

        if w.len() > 1 {
            let mut rest = w[1..].to_vec();
            rest.sort_by(f64::total_cmp);
            w[0] = stat::quantile(0.5, QuantileKind::LinInterp, &rest, None);
        }

        w
    }

    /// Seven-number summary over a sorted copy of the series; the
    /// correlation inputs keep capture order.
    fn seven_num_sum(&self, series: &[f64], weights: Option<&[f64]>) -> [f64; 7] {
        let mut values = series.to_vec();
        let sorted_weights = weights.map(|w| {
            let mut ws = w.to_vec();
            stat::sort_with_weights(&mut values, &mut ws);
            ws
        });
        if sorted_weights.is_none() {
            values.sort_by(f64::total_cmp);
        }

        let mut out = [0.0; 7];
        for (slot, &p) in out.iter_mut().zip(SEVEN_NUM_PCTS.iter()) {
            *slot = stat::quantile(p, self.cfg.quantile_kind, &values, sorted_weights.as_deref());
        }
        out
    }

    fn corr(&self, xs: &[f64], ys: &[f64], ws: Option<&[f64]>) -> f64 {
        let r = stat::correlation(xs, ys, ws);
        if !r.is_finite() {
            return CORR_UNDEFINED;
        }
        self.adjust_correlation(r)
    }

    fn adjust_correlation(&self, r: f64) -> f64 {
        let n = self.flow.data.len() as f64;
        if self.cfg.adjusted_correlation_1 {
            r * (1.0 + (1.0 - r * r) / 2.0 * n)
        } else if self.cfg.adjusted_correlation_2 && n > 2.0 {
            (1.0 - ((1.0 - r * r) * (n - 1.0)) / (n - 2.0)).sqrt()
        } else {
            r
        }
    }

    fn send_throughput_mbps(&self, bytes_acked: u64) -> f64 {
        let wall_ns = self
            .flow
            .end_time
            .duration_since(self.flow.start_time)
            .unwrap_or_default()
            .as_nanos() as f64;
        if wall_ns == 0.0 {
            return 0.0;
        }
        bytes_acked as f64 * 8.0 / (wall_ns / 1e9) / 1e6
    }
}

fn us_to_ms(us: u32) -> f64 {
    f64::from(us) / 1000.0
}

fn bytes_ps_to_mbps(bytes_ps: u64) -> f64 {
    bytes_ps as f64 * 8.0 / 1e6
}
