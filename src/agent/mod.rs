//! Pipeline orchestration: paces sample calls, runs the stages either
//! serially or as independent tasks over bounded queues, and owns the
//! error/backoff and shutdown behavior.
//!
//! In pipelined mode the stop signal is the closing of the first queue:
//! each stage drains its input, processes the remainder, and closes its
//! output, so shutdown is the natural "input drained" termination.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::{Analyzer, FlowStats};
use crate::config;
use crate::diag::{DiagSampler, FilterCaps};
use crate::metrics::Metrics;
use crate::sampler::{Batch, Pools, Sample, Sampler};
use crate::tracker::{Flow, Tracker};
use crate::writer::{WriteError, Writer};

/// Bounded hand-off queue capacities, first stage to last.
const BATCH_QUEUE: usize = 128;
const SAMPLE_QUEUE: usize = 256;
const FLOW_QUEUE: usize = 256;
const STATS_QUEUE: usize = 1024;

/// Why a run ended unsuccessfully.
#[derive(Error, Debug)]
pub enum RunError {
    /// Too many consecutive sampler failures.
    #[error("aborted after {0} consecutive sampler errors")]
    MaxErrors(u32),

    /// The writer failed; this is the only stage error that short
    /// circuits the pipeline.
    #[error(transparent)]
    Writer(#[from] WriteError),

    /// The pipeline did not drain within the stop timeout.
    #[error("stop timed out waiting for pipeline drain")]
    StopTimeout,

    /// A stage task died.
    #[error("pipeline stage failed: {0}")]
    Stage(String),
}

/// The agent drives one run of the five-stage pipeline.
pub struct Agent<S: Sampler> {
    cfg: config::RunConfig,
    sampler: S,
    tracker: Tracker,
    analyzer: Analyzer,
    writer: Writer,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Agent<DiagSampler> {
    /// Builds the production agent: kernel sampler, flow table,
    /// analyzer and writer, all from the loaded configuration.
    pub fn new(cfg: &config::Config, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let caps = FilterCaps::detect();
        info!(eq_op = caps.eq_op, "kernel port equality filter op support");

        let sampler = DiagSampler::new(cfg.diag.clone(), caps);

        let tracker = Tracker::new(crate::tracker::Config {
            max_flows: cfg.tracker.max_flows,
            min_samples: cfg.tracker.min_samples,
        });

        let analyzer = Analyzer::new(crate::analyzer::Config {
            sampler_interval: cfg.run.interval,
            quantile_kind: cfg.analyzer.quantile_kind,
            unweighted_correlations: cfg.analyzer.unweighted_correlations,
            unweighted_quantiles: cfg.analyzer.unweighted_quantiles,
            adjusted_correlation_1: cfg.analyzer.adjusted_correlation_1,
            adjusted_correlation_2: cfg.analyzer.adjusted_correlation_2,
        });

        let writer = Writer::open(crate::writer::Config {
            dir: cfg.writer.dir.clone(),
            file: cfg.writer.file.clone(),
            compression_level: cfg.writer.compression_level,
            flush: cfg.writer.flush,
            rotate_interval: cfg.writer.rotate_interval,
            rotate_size: cfg.writer.rotate_size_bytes()?,
            partial: cfg.writer.partial,
        })
        .context("opening writer")?;

        Ok(Self::with_parts(
            cfg.run, sampler, tracker, analyzer, writer, metrics,
        ))
    }
}

impl<S: Sampler> Agent<S> {
    /// Assembles an agent from explicit parts; test fixtures substitute
    /// their own sample source here.
    pub fn with_parts(
        cfg: config::RunConfig,
        sampler: S,
        tracker: Tracker,
        analyzer: Analyzer,
        writer: Writer,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cfg,
            sampler,
            tracker,
            analyzer,
            writer,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs until stopped, the duration elapses, the source is
    /// exhausted, or a fatal error occurs. Both modes are behaviorally
    /// equivalent on the same input stream.
    pub async fn run(self) -> Result<(), RunError> {
        if self.cfg.serial {
            self.run_serial().await
        } else {
            self.run_pipelined().await
        }
    }

    async fn run_serial(self) -> Result<(), RunError> {
        let Agent {
            cfg,
            sampler,
            tracker,
            analyzer,
            writer,
            metrics,
            cancel,
        } = self;

        let pools = sampler.pools();
        let mut stages = Some(SerialStages {
            tracker,
            analyzer,
            writer,
            pools,
            metrics: Arc::clone(&metrics),
        });

        let mut master = MasterLoop::new(&cfg, &cancel, &metrics);
        let mut sampler = Some(sampler);
        let mut run_err = None;

        loop {
            let Some(current) = sampler.take() else {
                break;
            };
            let (returned, step) = master.next_batch(current).await;
            sampler = returned;

            match step {
                Step::Batch(batch) => {
                    let Some(mut current) = stages.take() else {
                        break;
                    };
                    // One worker drives every stage in order; the whole
                    // tick runs off the async threads.
                    let joined = tokio::task::spawn_blocking(move || {
                        let result = current.process(batch);
                        (current, result)
                    })
                    .await;

                    match joined {
                        Ok((returned, Ok(()))) => stages = Some(returned),
                        Ok((returned, Err(e))) => {
                            stages = Some(returned);
                            error!(error = %e, "writer failed, aborting run");
                            run_err = Some(RunError::Writer(e));
                            break;
                        }
                        Err(join) => {
                            run_err = Some(RunError::Stage(join.to_string()));
                            break;
                        }
                    }
                }
                Step::Stop => break,
                Step::Fatal(e) => {
                    run_err = Some(e);
                    break;
                }
            }
        }

        if let Some(mut s) = sampler {
            s.close();
        }

        if let Some(mut stages) = stages {
            let closed = tokio::task::spawn_blocking(move || stages.writer.close()).await;
            match closed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => run_err = run_err.or(Some(RunError::Writer(e))),
                Err(join) => run_err = run_err.or(Some(RunError::Stage(join.to_string()))),
            }
        }

        match run_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_pipelined(self) -> Result<(), RunError> {
        let Agent {
            cfg,
            sampler,
            tracker,
            analyzer,
            writer,
            metrics,
            cancel,
        } = self;

        let pools = sampler.pools();

        let (rc_tx, rc_rx) = mpsc::channel::<S::Batch>(BATCH_QUEUE);
        let (sc_tx, sc_rx) = mpsc::channel::<Vec<Sample>>(SAMPLE_QUEUE);
        let (fc_tx, fc_rx) = mpsc::channel::<Vec<Flow>>(FLOW_QUEUE);
        let (fsc_tx, fsc_rx) = mpsc::channel::<Vec<FlowStats>>(STATS_QUEUE);
        let (err_tx, mut err_rx) = mpsc::channel::<WriteError>(1);

        let convert = tokio::spawn(convert_stage(
            rc_rx,
            sc_tx,
            pools.clone(),
            Arc::clone(&metrics),
        ));
        let track = tokio::spawn(track_stage(
            tracker,
            sc_rx,
            fc_tx,
            pools,
            Arc::clone(&metrics),
        ));
        let analyze = tokio::spawn(analyze_stage(analyzer, fc_rx, fsc_tx, Arc::clone(&metrics)));
        let write = {
            let metrics = Arc::clone(&metrics);
            tokio::task::spawn_blocking(move || write_stage(writer, fsc_rx, err_tx, metrics))
        };

        let mut master = MasterLoop::new(&cfg, &cancel, &metrics);
        let mut sampler = Some(sampler);
        let mut run_err = None;

        loop {
            // A writer failure cascades up through closed queues; the
            // error channel names it promptly.
            if let Ok(e) = err_rx.try_recv() {
                error!(error = %e, "pipeline error");
                run_err = Some(RunError::Writer(e));
                break;
            }

            let Some(current) = sampler.take() else {
                break;
            };
            let (returned, step) = master.next_batch(current).await;
            sampler = returned;

            match step {
                Step::Batch(batch) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = rc_tx.send(batch) => {
                            if sent.is_err() {
                                // Downstream collapsed; the error
                                // channel explains why below.
                                break;
                            }
                        }
                    }
                }
                Step::Stop => break,
                Step::Fatal(e) => {
                    run_err = Some(e);
                    break;
                }
            }
        }

        if let Some(mut s) = sampler {
            s.close();
        }

        // Closing the first queue drains the pipeline stage by stage;
        // the writer task finishing means the final stage drained.
        info!("shutting down pipeline");
        drop(rc_tx);

        match tokio::time::timeout(cfg.stop_timeout, write).await {
            Err(_) => {
                warn!(
                    timeout_s = cfg.stop_timeout.as_secs(),
                    "pipeline drain timed out",
                );
                return Err(run_err.unwrap_or(RunError::StopTimeout));
            }
            Ok(Err(join)) => {
                return Err(run_err.unwrap_or_else(|| RunError::Stage(join.to_string())));
            }
            Ok(Ok(())) => {}
        }

        for handle in [convert, track, analyze] {
            if let Err(join) = handle.await {
                run_err = run_err.or(Some(RunError::Stage(join.to_string())));
            }
        }

        if run_err.is_none() {
            if let Ok(e) = err_rx.try_recv() {
                run_err = Some(RunError::Writer(e));
            }
        }

        match run_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// What the master loop decided for one iteration.
enum Step<B> {
    /// A batch arrived; hand it downstream.
    Batch(B),
    /// Stop cleanly (cancelled, duration elapsed, source exhausted).
    Stop,
    /// Abort the run.
    Fatal(RunError),
}

/// Pacing, duration bound, and consecutive-error backoff shared by both
/// execution modes.
struct MasterLoop<'a> {
    cfg: &'a config::RunConfig,
    cancel: &'a CancellationToken,
    metrics: &'a Arc<Metrics>,
    ticker: tokio::time::Interval,
    deadline: Option<tokio::time::Instant>,
    errs: u32,
}

impl<'a> MasterLoop<'a> {
    fn new(
        cfg: &'a config::RunConfig,
        cancel: &'a CancellationToken,
        metrics: &'a Arc<Metrics>,
    ) -> Self {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        Self {
            cfg,
            cancel,
            metrics,
            ticker,
            deadline: cfg.duration.map(|d| tokio::time::Instant::now() + d),
            errs: 0,
        }
    }

    /// Waits for the next tick (or backoff delay after a failure) and
    /// performs one sample call off the async threads. The sampler
    /// travels through the blocking task by value; it comes back `None`
    /// only if that task died.
    async fn next_batch<S: Sampler>(&mut self, sampler: S) -> (Option<S>, Step<S::Batch>) {
        let mut sampler = sampler;

        loop {
            // Exponential backoff between consecutive failures, doubling
            // from the configured initial delay.
            if self.errs > 0 {
                let delay = self
                    .cfg
                    .error_delay
                    .saturating_mul(1u32 << (self.errs - 1).min(31));
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    "waiting after sampler error",
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return (Some(sampler), Step::Stop),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return (Some(sampler), Step::Stop),
                _ = tokio::time::sleep_until(self.deadline.unwrap_or_else(far_future)),
                        if self.deadline.is_some() => {
                    info!("run duration elapsed, stopping");
                    return (Some(sampler), Step::Stop);
                }
                _ = self.ticker.tick() => {}
            }

            let t0 = Instant::now();
            let joined = tokio::task::spawn_blocking(move || {
                let result = sampler.sample();
                (sampler, result)
            })
            .await;

            let result = match joined {
                Ok((returned, result)) => {
                    sampler = returned;
                    result
                }
                Err(join) => {
                    return (None, Step::Fatal(RunError::Stage(join.to_string())));
                }
            };

            match result {
                Ok(Some(batch)) => {
                    self.errs = 0;
                    self.metrics.push_sample(t0.elapsed(), &batch.stats());
                    return (Some(sampler), Step::Batch(batch));
                }
                Ok(None) => {
                    info!("sample source exhausted, stopping");
                    return (Some(sampler), Step::Stop);
                }
                Err(e) => {
                    self.errs += 1;
                    self.metrics.record_sampler_error();
                    warn!(
                        error = %e,
                        consecutive = self.errs,
                        protocol = e.is_protocol(),
                        "sampler error",
                    );
                    if self.errs >= self.cfg.max_errors {
                        return (Some(sampler), Step::Fatal(RunError::MaxErrors(self.errs)));
                    }
                }
            }
        }
    }
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86_400 * 365)
}

/// The serial worker's stage state, moved in and out of blocking tasks.
struct SerialStages<B: Batch> {
    tracker: Tracker,
    analyzer: Analyzer,
    writer: Writer,
    pools: Option<Arc<Pools<B>>>,
    metrics: Arc<Metrics>,
}

impl<B: Batch> SerialStages<B> {
    fn process(&mut self, mut batch: B) -> Result<(), WriteError> {
        let t0 = Instant::now();
        let reuse = self
            .pools
            .as_ref()
            .and_then(|p| p.sample_bufs.take())
            .unwrap_or_default();
        let samples = batch.samples(reuse);
        if let Some(pools) = &self.pools {
            pools.batches.put(batch);
        }
        self.metrics.push_convert(t0.elapsed());

        let t0 = Instant::now();
        let ended = self.tracker.track(&samples);
        let tracked = self.tracker.tracked();
        if let Some(pools) = &self.pools {
            pools.sample_bufs.put(samples);
        }
        self.metrics.push_track(t0.elapsed(), tracked, ended.len());

        let t0 = Instant::now();
        let stats = self.analyzer.analyze(&ended);
        self.metrics.push_analyze(t0.elapsed());

        let t0 = Instant::now();
        self.writer.write(&stats)?;
        self.metrics.push_write(t0.elapsed());

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipelined stage tasks. Each drains its input queue and closes its
// output by dropping the sender when the input closes.
// ---------------------------------------------------------------------------

async fn convert_stage<B: Batch>(
    mut rx: mpsc::Receiver<B>,
    tx: mpsc::Sender<Vec<Sample>>,
    pools: Option<Arc<Pools<B>>>,
    metrics: Arc<Metrics>,
) {
    while let Some(mut batch) = rx.recv().await {
        let t0 = Instant::now();
        let reuse = pools
            .as_ref()
            .and_then(|p| p.sample_bufs.take())
            .unwrap_or_default();
        let samples = batch.samples(reuse);
        if let Some(pools) = &pools {
            pools.batches.put(batch);
        }
        metrics.push_convert(t0.elapsed());

        if tx.send(samples).await.is_err() {
            break;
        }
    }
}

async fn track_stage<B: Batch>(
    mut tracker: Tracker,
    mut rx: mpsc::Receiver<Vec<Sample>>,
    tx: mpsc::Sender<Vec<Flow>>,
    pools: Option<Arc<Pools<B>>>,
    metrics: Arc<Metrics>,
) {
    while let Some(samples) = rx.recv().await {
        let t0 = Instant::now();
        let ended = tracker.track(&samples);
        let tracked = tracker.tracked();
        if let Some(pools) = &pools {
            pools.sample_bufs.put(samples);
        }
        metrics.push_track(t0.elapsed(), tracked, ended.len());

        if tx.send(ended).await.is_err() {
            break;
        }
    }
}

async fn analyze_stage(
    analyzer: Analyzer,
    mut rx: mpsc::Receiver<Vec<Flow>>,
    tx: mpsc::Sender<Vec<FlowStats>>,
    metrics: Arc<Metrics>,
) {
    while let Some(flows) = rx.recv().await {
        let t0 = Instant::now();
        let stats = analyzer.analyze(&flows);
        metrics.push_analyze(t0.elapsed());

        if tx.send(stats).await.is_err() {
            break;
        }
    }
}

/// The writer stage runs blocking I/O on the blocking pool. Its first
/// error goes to the one-slot error channel and stops consumption; the
/// master loop observes it and aborts the run.
fn write_stage(
    mut writer: Writer,
    mut rx: mpsc::Receiver<Vec<FlowStats>>,
    err_tx: mpsc::Sender<WriteError>,
    metrics: Arc<Metrics>,
) {
    while let Some(batch) = rx.blocking_recv() {
        let t0 = Instant::now();
        match writer.write(&batch) {
            Ok(()) => metrics.push_write(t0.elapsed()),
            Err(e) => {
                let _ = err_tx.try_send(e);
                return;
            }
        }
    }

    if let Err(e) = writer.close() {
        let _ = err_tx.try_send(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::SamplerError;

    // Step only carries data; the master loop behavior is exercised
    // end to end in tests/pipeline.rs with a scripted sampler.
    #[test]
    fn test_run_error_display() {
        assert_eq!(
            RunError::MaxErrors(5).to_string(),
            "aborted after 5 consecutive sampler errors",
        );
        assert_eq!(
            RunError::StopTimeout.to_string(),
            "stop timed out waiting for pipeline drain",
        );
    }

    #[test]
    fn test_sampler_error_kind_flag() {
        assert!(SamplerError::Kernel { code: 13 }.is_protocol());
        assert!(!SamplerError::transport("send", std::io::Error::other("x")).is_protocol());
    }
}
