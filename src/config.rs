//! Configuration for the flowmon agent.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::analyzer::QuantileKind;

/// Top-level configuration, loaded from a YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Kernel diagnostics sampler configuration.
    #[serde(default)]
    pub diag: DiagConfig,

    /// Flow table limits.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Statistics configuration.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Output configuration.
    #[serde(default)]
    pub writer: WriterConfig,

    /// Pipeline execution configuration.
    #[serde(default)]
    pub run: RunConfig,

    /// HTTP status endpoint configuration.
    #[serde(default)]
    pub status: StatusConfig,
}

/// Kernel diagnostics sampler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiagConfig {
    /// Userspace read buffer size. Sizes above 32 KiB showed no benefit
    /// on kernels 4.9-5.2. Default: 32 KiB.
    #[serde(default = "default_read_bufsize")]
    pub read_bufsize: usize,

    /// Socket receive buffer size (SO_RCVBUF); zero leaves the system
    /// default.
    #[serde(default)]
    pub receive_bufsize: usize,

    /// Forced socket receive buffer size (SO_RCVBUFFORCE); requires
    /// CAP_NET_ADMIN. Zero disables.
    #[serde(default)]
    pub receive_bufsize_force: usize,

    /// Socket receive timeout. Default: 1s.
    #[serde(default = "default_receive_timeout", with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// Source (local) port ranges for the kernel-side filter, e.g.
    /// "80,443,8000-8080". Empty means unfiltered.
    #[serde(default)]
    pub src_ports: PortRanges,

    /// Destination (remote) port ranges for the kernel-side filter.
    #[serde(default)]
    pub dst_ports: PortRanges,
}

/// Flow table limits. Zero means unlimited for both.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TrackerConfig {
    /// Maximum number of recorded flows at a time; flows over the limit
    /// are tracked but record nothing.
    #[serde(default)]
    pub max_flows: usize,

    /// Minimum number of samples an ended flow needs to be emitted.
    #[serde(default)]
    pub min_samples: usize,
}

/// Statistics configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AnalyzerConfig {
    /// Quantile method for seven-number summaries: "empirical" uses only
    /// measured values, "lininterp" interpolates between them.
    #[serde(default = "default_quantile_kind")]
    pub quantile_kind: QuantileKind,

    /// Compute correlations without inter-sample time weights.
    #[serde(default)]
    pub unweighted_correlations: bool,

    /// Compute quantiles without inter-sample time weights.
    #[serde(default)]
    pub unweighted_quantiles: bool,

    /// Adjusted correlation r_adj = r * (1 + (1-r^2)/2*n).
    #[serde(default)]
    pub adjusted_correlation_1: bool,

    /// Adjusted correlation r_adj = sqrt(1 - ((1-r^2)(n-1))/(n-2)),
    /// applied with more than two samples.
    #[serde(default)]
    pub adjusted_correlation_2: bool,
}

/// Output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Output directory; unset writes to stdout.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Output file name. A ".gz" extension selects gzip compression.
    /// Default: "flowmon-<hostname>.json.gz".
    #[serde(default = "default_writer_file")]
    pub file: String,

    /// Gzip compression level, 1-9 where 9 is best compression.
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Flush after every batch (may degrade compression).
    #[serde(default)]
    pub flush: bool,

    /// Approximate interval on which to rotate output files; zero
    /// disables interval rotation. Default: 15m.
    #[serde(default = "default_rotate_interval", with = "humantime_serde")]
    pub rotate_interval: Duration,

    /// Approximate output size that triggers rotation; suffixes K, M
    /// and G are supported. Empty disables size rotation.
    #[serde(default)]
    pub rotate_size: String,

    /// Also write records for partial flows (those crossing a startup
    /// or shutdown boundary).
    #[serde(default)]
    pub partial: bool,
}

/// Pipeline execution configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RunConfig {
    /// Drive all stages from one worker instead of pipelining them.
    #[serde(default)]
    pub serial: bool,

    /// Time between sample calls. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Limit on run time; unset runs until stopped.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,

    /// Maximum consecutive sampler errors before the run aborts.
    /// Default: 5.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    /// Initial exponential backoff after a sampler error. Default: 1s.
    #[serde(default = "default_error_delay", with = "humantime_serde")]
    pub error_delay: Duration,

    /// Time to wait for pipeline drain on stop. Default: 15s.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

/// HTTP status endpoint configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusConfig {
    /// Listen address (e.g. "127.0.0.1:8080"); empty disables the
    /// endpoint.
    #[serde(default)]
    pub addr: String,
}

/// One inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

/// A list of port ranges, configured as a comma-separated list of ports
/// and dash-separated ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRanges(pub Vec<PortRange>);

impl PortRanges {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for PortRanges {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut ranges = Vec::new();
        if s.trim().is_empty() {
            return Ok(Self(ranges));
        }

        for part in s.split(',') {
            let part = part.trim();
            let (lo, hi) = match part.split_once('-') {
                Some((a, b)) => (
                    a.trim()
                        .parse::<u16>()
                        .with_context(|| format!("invalid port in range '{part}'"))?,
                    b.trim()
                        .parse::<u16>()
                        .with_context(|| format!("invalid port in range '{part}'"))?,
                ),
                None => {
                    let p = part
                        .parse::<u16>()
                        .with_context(|| format!("invalid port '{part}'"))?;
                    (p, p)
                }
            };
            if lo > hi {
                bail!("invalid port range '{part}': lower bound exceeds upper");
            }
            ranges.push(PortRange { lo, hi });
        }

        Ok(Self(ranges))
    }
}

impl fmt::Display for PortRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if r.lo == r.hi {
                write!(f, "{}", r.lo)?;
            } else {
                write!(f, "{}-{}", r.lo, r.hi)?;
            }
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for PortRanges {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_read_bufsize() -> usize {
    32 * 1024
}

fn default_receive_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_quantile_kind() -> QuantileKind {
    QuantileKind::LinInterp
}

fn default_writer_file() -> String {
    match hostname() {
        Some(h) if !h.is_empty() => format!("flowmon-{h}.json.gz"),
        _ => "flowmon.json.gz".to_string(),
    }
}

fn default_compression_level() -> u32 {
    9
}

fn default_rotate_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_errors() -> u32 {
    5
}

fn default_error_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(15)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            diag: DiagConfig::default(),
            tracker: TrackerConfig::default(),
            analyzer: AnalyzerConfig::default(),
            writer: WriterConfig::default(),
            run: RunConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

impl Default for DiagConfig {
    fn default() -> Self {
        Self {
            read_bufsize: default_read_bufsize(),
            receive_bufsize: 0,
            receive_bufsize_force: 0,
            receive_timeout: default_receive_timeout(),
            src_ports: PortRanges::default(),
            dst_ports: PortRanges::default(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            quantile_kind: default_quantile_kind(),
            unweighted_correlations: false,
            unweighted_quantiles: false,
            adjusted_correlation_1: false,
            adjusted_correlation_2: false,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            dir: None,
            file: default_writer_file(),
            compression_level: default_compression_level(),
            flush: false,
            rotate_interval: default_rotate_interval(),
            rotate_size: String::new(),
            partial: false,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            serial: false,
            interval: default_interval(),
            duration: None,
            max_errors: default_max_errors(),
            error_delay: default_error_delay(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.run.interval.is_zero() {
            bail!("run.interval must be positive");
        }

        if self.run.max_errors == 0 {
            bail!("run.max_errors must be positive");
        }

        if self.run.error_delay.is_zero() {
            bail!("run.error_delay must be positive");
        }

        if self.diag.read_bufsize == 0 {
            bail!("diag.read_bufsize must be positive");
        }

        if !(1..=9).contains(&self.writer.compression_level) {
            bail!(
                "invalid compression level {}, must be 1-9",
                self.writer.compression_level,
            );
        }

        if self.writer.file.is_empty() {
            bail!("writer.file is required");
        }

        if self.analyzer.adjusted_correlation_1 && self.analyzer.adjusted_correlation_2 {
            bail!("multiple adjusted correlations may not be used at the same time");
        }

        self.writer.rotate_size_bytes()?;

        Ok(())
    }
}

impl WriterConfig {
    /// The configured size-rotation threshold in bytes, if any.
    pub fn rotate_size_bytes(&self) -> Result<Option<u64>> {
        if self.rotate_size.is_empty() {
            return Ok(None);
        }
        parse_size(&self.rotate_size).map(Some)
    }
}

/// Parses a byte size with an optional K, M or G suffix.
pub fn parse_size(s: &str) -> Result<u64> {
    let (num, mult) = if let Some(n) = s.strip_suffix('K') {
        (n, 1u64 << 10)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1u64 << 20)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1u64 << 30)
    } else {
        (s, 1)
    };

    let value: u64 = num
        .trim()
        .parse()
        .with_context(|| format!("unable to parse size '{s}'"))?;

    Ok(value * mult)
}

/// The machine's hostname, used in the default output file name.
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes at most buf.len() bytes and
    // null-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).ok().map(str::to_owned)
}
