//! Serializes flow-statistics records to stdout or rotated output files.
//!
//! Records are written as tab-indented JSON objects, one per flow. A
//! ".gz" file extension selects gzip; the byte counter sits under the
//! compressor so rotation triggers on on-disk size.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write as IoWrite};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::analyzer::FlowStats;

/// Output configuration, resolved from the application config.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Output directory; `None` writes to stdout.
    pub dir: Option<PathBuf>,
    /// Output file name; a ".gz" extension selects gzip.
    pub file: String,
    /// Gzip compression level (1-9).
    pub compression_level: u32,
    /// Flush after every batch.
    pub flush: bool,
    /// Interval-based rotation; zero disables.
    pub rotate_interval: Duration,
    /// Size-based rotation threshold in bytes; `None` disables.
    pub rotate_size: Option<u64>,
    /// Keep records for partial flows instead of dropping them.
    pub partial: bool,
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("writer I/O: {0}")]
    Io(#[from] io::Error),

    #[error("record encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The writer stage's sink.
pub struct Writer {
    cfg: Config,
    out: Output,
}

enum Output {
    Stdout(BufWriter<io::Stdout>),
    File(FileOutput),
}

impl Writer {
    pub fn open(cfg: Config) -> Result<Self, WriteError> {
        let out = match &cfg.dir {
            Some(dir) => Output::File(FileOutput::open(&cfg, dir.clone())?),
            None => {
                debug!("writer using stdout");
                Output::Stdout(BufWriter::new(io::stdout()))
            }
        };
        Ok(Self { cfg, out })
    }

    /// Writes one batch of records, dropping partial flows unless
    /// configured otherwise. Reports the first error; the run treats
    /// any writer error as fatal.
    pub fn write(&mut self, batch: &[FlowStats]) -> Result<(), WriteError> {
        if batch.is_empty() {
            return Ok(());
        }

        let t0 = Instant::now();
        let mut written = 0usize;

        for s in batch {
            if s.partial && !self.cfg.partial {
                continue;
            }
            match &mut self.out {
                Output::Stdout(w) => encode_record(w, s)?,
                Output::File(f) => encode_record(f.sink(), s)?,
            }
            written += 1;
        }

        if self.cfg.flush {
            self.flush()?;
        }

        if let Output::File(f) = &mut self.out {
            f.maybe_rotate()?;
        }

        debug!(
            elapsed_us = t0.elapsed().as_micros() as u64,
            flows = batch.len(),
            written,
            "writer",
        );

        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), WriteError> {
        match &mut self.out {
            Output::Stdout(w) => w.flush()?,
            Output::File(f) => f.sink().flush()?,
        }
        Ok(())
    }

    /// Finishes compression and flushes buffers. The writer must not be
    /// used afterwards.
    pub fn close(&mut self) -> Result<(), WriteError> {
        match &mut self.out {
            Output::Stdout(w) => w.flush()?,
            Output::File(f) => f.close()?,
        }
        Ok(())
    }
}

/// One record as a tab-indented JSON object followed by a newline,
/// matching the encoder configuration of the stream's consumers.
fn encode_record<W: IoWrite + ?Sized>(w: &mut W, s: &FlowStats) -> Result<(), WriteError> {
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut *w, fmt);
    s.serialize(&mut ser)?;
    w.write_all(b"\n")?;
    Ok(())
}

/// File-backed output with rotation support.
struct FileOutput {
    path: PathBuf,
    file_name: String,
    compression_level: u32,
    rotate_interval: Duration,
    rotate_size: Option<u64>,
    stream: Option<Stream>,
    last_rotate: Option<Instant>,
}

impl FileOutput {
    fn open(cfg: &Config, dir: PathBuf) -> Result<Self, WriteError> {
        let meta = fs::metadata(&dir)?;
        if !meta.is_dir() {
            return Err(WriteError::Io(io::Error::other(format!(
                "writer directory '{}' is not a directory",
                dir.display(),
            ))));
        }

        let mut out = Self {
            path: dir.join(&cfg.file),
            file_name: cfg.file.clone(),
            compression_level: cfg.compression_level,
            rotate_interval: cfg.rotate_interval,
            rotate_size: cfg.rotate_size,
            stream: None,
            last_rotate: None,
        };

        out.open_stream(false)?;
        out.maybe_rotate()?;

        Ok(out)
    }

    fn open_stream(&mut self, quiet: bool) -> Result<(), WriteError> {
        if !quiet {
            info!(path = %self.path.display(), "writer opening output file");
        }

        // Inherit the size of an existing file so size rotation counts
        // what is already on disk.
        let existing = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        let counted = CountWriter {
            inner: BufWriter::new(file),
            count: existing,
        };

        let stream = if self.file_name.ends_with(".gz") {
            if !quiet {
                debug!(
                    level = self.compression_level,
                    "writer using gzip compression",
                );
            }
            Stream::Gzip(GzEncoder::new(
                counted,
                Compression::new(self.compression_level),
            ))
        } else {
            Stream::Plain(counted)
        };

        self.stream = Some(stream);
        Ok(())
    }

    fn sink(&mut self) -> &mut dyn IoWrite {
        // The stream is only ever None transiently inside rotate().
        match self.stream.as_mut() {
            Some(Stream::Plain(w)) => w,
            Some(Stream::Gzip(w)) => w,
            None => unreachable!("writer stream missing outside rotation"),
        }
    }

    fn count(&self) -> u64 {
        match &self.stream {
            Some(Stream::Plain(w)) => w.count,
            Some(Stream::Gzip(w)) => w.get_ref().count,
            None => 0,
        }
    }

    fn maybe_rotate(&mut self) -> Result<(), WriteError> {
        // The interval clock starts at the first opportunity to rotate.
        if self.last_rotate.is_none() {
            self.last_rotate = Some(Instant::now());
        }

        if self.rotate_size.is_some_and(|limit| self.count() >= limit) {
            debug!(
                path = %self.path.display(),
                bytes = self.count(),
                "writer rotating at size threshold",
            );
            return self.rotate();
        } else if !self.rotate_interval.is_zero() {
            let since = self.last_rotate.map(|t| t.elapsed()).unwrap_or_default();
            if since > self.rotate_interval {
                if self.count() == 0 {
                    // Nothing written yet; restart the interval instead
                    // of rotating an empty file.
                    self.last_rotate = Some(Instant::now());
                    return Ok(());
                }
                debug!(
                    path = %self.path.display(),
                    elapsed_s = since.as_secs(),
                    "writer rotating at interval",
                );
                return self.rotate();
            }
        }

        Ok(())
    }

    fn rotate(&mut self) -> Result<(), WriteError> {
        if let Some(stream) = self.stream.take() {
            stream.finish()?;
        }

        // Pick the first rotation index whose name is unused in both
        // compressed and uncompressed spellings.
        let dir = self.path.parent().map(PathBuf::from).unwrap_or_default();
        let rotated = {
            let mut n = 1usize;
            loop {
                let (name, gz) = rotated_file_name(&self.file_name, n);
                let twin = if gz {
                    name.trim_end_matches(".gz").to_string()
                } else {
                    format!("{name}.gz")
                };
                if !dir.join(&name).exists() && !dir.join(&twin).exists() {
                    break dir.join(name);
                }
                n += 1;
            }
        };

        debug!(
            from = %self.path.display(),
            to = %rotated.display(),
            "writer renaming rotated file",
        );
        fs::rename(&self.path, &rotated)?;

        self.open_stream(true)?;
        self.last_rotate = Some(Instant::now());

        Ok(())
    }

    fn close(&mut self) -> Result<(), WriteError> {
        if let Some(stream) = self.stream.take() {
            stream.finish()?;
        }
        Ok(())
    }
}

enum Stream {
    Plain(CountWriter<BufWriter<File>>),
    Gzip(GzEncoder<CountWriter<BufWriter<File>>>),
}

impl Stream {
    fn finish(self) -> io::Result<()> {
        match self {
            Stream::Plain(mut w) => w.flush(),
            Stream::Gzip(gz) => {
                let mut inner = gz.finish()?;
                inner.flush()
            }
        }
    }
}

/// Counts bytes on their way to the underlying writer.
struct CountWriter<W: IoWrite> {
    inner: W,
    count: u64,
}

impl<W: IoWrite> IoWrite for CountWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Rotated name for index `n`: "name.json.gz" becomes "name.N.json.gz".
/// Returns whether the name is compressed.
fn rotated_file_name(file: &str, n: usize) -> (String, bool) {
    let (base, gz) = match file.strip_suffix(".gz") {
        Some(base) => (base, true),
        None => (file, false),
    };
    let (stem, ext) = match base.rfind('.') {
        Some(i) => (&base[..i], &base[i..]),
        None => (base, ""),
    };
    let name = if gz {
        format!("{stem}.{n}{ext}.gz")
    } else {
        format!("{stem}.{n}{ext}")
    };
    (name, gz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::FlowStatsId;
    use chrono::{TimeZone, Utc};
    use std::net::Ipv4Addr;
    use std::path::Path;

    fn stats(port: u16, partial: bool) -> FlowStats {
        FlowStats {
            id: FlowStatsId {
                src_ip: Ipv4Addr::new(10, 0, 0, 1),
                src_port: port,
                dst_ip: Ipv4Addr::new(192, 0, 2, 1),
                dst_port: 443,
                tstamp_start_ns: 1_000,
            },
            start_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            end_time: Utc.timestamp_opt(1_700_000_010, 0).unwrap(),
            duration_ns: 10_000_000_000,
            samples: 3,
            samples_deduped: 1,
            partial,
            timestamps: true,
            sack: true,
            ecn: false,
            ecn_seen: false,
            min_rtt_kernel_ms: 1.5,
            min_rtt_observed_ms: 2.0,
            max_pacing_rate_observed_mbps: 100.0,
            rtt_seven_num_sum: [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
            corr_rtt_cwnd: 0.5,
            corr_retrans_cwnd: -2.0,
            corr_pacing_cwnd: -3.0,
            total_retransmits: 2,
            bytes_acked: 1_000_000,
            send_throughput_mbps: 0.8,
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "flowmon-writer-{tag}-{}",
            std::process::id(),
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn read_records(path: &Path) -> Vec<serde_json::Value> {
        let text = fs::read_to_string(path).unwrap();
        serde_json::Deserializer::from_str(&text)
            .into_iter::<serde_json::Value>()
            .map(|v| v.unwrap())
            .collect()
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = temp_dir("roundtrip");
        let mut w = Writer::open(Config {
            dir: Some(dir.clone()),
            file: "out.json".to_string(),
            compression_level: 9,
            rotate_interval: Duration::ZERO,
            ..Config::default()
        })
        .unwrap();

        w.write(&[stats(1, false), stats(2, false)]).unwrap();
        w.close().unwrap();

        let records = read_records(&dir.join("out.json"));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"]["srcIp"], "10.0.0.1");
        assert_eq!(records[0]["id"]["srcPort"], 1);
        assert_eq!(records[1]["id"]["srcPort"], 2);
        assert_eq!(records[0]["samples"], 3);
        assert_eq!(records[0]["samplesDeduped"], 1);
        assert_eq!(records[0]["corrRetransCwnd"], -2.0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_records_dropped_by_default() {
        let dir = temp_dir("partial");
        let mut w = Writer::open(Config {
            dir: Some(dir.clone()),
            file: "out.json".to_string(),
            compression_level: 9,
            rotate_interval: Duration::ZERO,
            ..Config::default()
        })
        .unwrap();

        w.write(&[stats(1, true), stats(2, false)]).unwrap();
        w.close().unwrap();

        let records = read_records(&dir.join("out.json"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"]["srcPort"], 2);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_records_kept_when_configured() {
        let dir = temp_dir("partial-kept");
        let mut w = Writer::open(Config {
            dir: Some(dir.clone()),
            file: "out.json".to_string(),
            compression_level: 9,
            rotate_interval: Duration::ZERO,
            partial: true,
            ..Config::default()
        })
        .unwrap();

        w.write(&[stats(1, true)]).unwrap();
        w.close().unwrap();

        let records = read_records(&dir.join("out.json"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["partial"], true);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_gzip_output() {
        let dir = temp_dir("gzip");
        let mut w = Writer::open(Config {
            dir: Some(dir.clone()),
            file: "out.json.gz".to_string(),
            compression_level: 6,
            rotate_interval: Duration::ZERO,
            ..Config::default()
        })
        .unwrap();

        w.write(&[stats(7, false)]).unwrap();
        w.close().unwrap();

        let raw = fs::read(dir.join("out.json.gz")).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(raw.as_slice());
        let mut text = String::new();
        io::Read::read_to_string(&mut decoder, &mut text).unwrap();
        assert!(text.contains("\"srcPort\": 7"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_size_rotation_picks_fresh_names() {
        let dir = temp_dir("rotate");
        let mut w = Writer::open(Config {
            dir: Some(dir.clone()),
            file: "out.json".to_string(),
            compression_level: 9,
            rotate_interval: Duration::ZERO,
            rotate_size: Some(1), // rotate after every batch
            ..Config::default()
        })
        .unwrap();

        w.write(&[stats(1, false)]).unwrap();
        w.write(&[stats(2, false)]).unwrap();
        w.write(&[stats(3, false)]).unwrap();
        w.close().unwrap();

        assert_eq!(read_records(&dir.join("out.1.json")).len(), 1);
        assert_eq!(read_records(&dir.join("out.2.json")).len(), 1);
        assert_eq!(read_records(&dir.join("out.3.json")).len(), 1);
        assert!(
            !dir.join("out.json").exists() || read_records(&dir.join("out.json")).is_empty(),
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_interval_rotation_with_size_threshold_configured() {
        let dir = temp_dir("rotate-both");
        // A size threshold that is never reached must not disable
        // interval rotation.
        let mut w = Writer::open(Config {
            dir: Some(dir.clone()),
            file: "out.json".to_string(),
            compression_level: 9,
            rotate_interval: Duration::from_millis(10),
            rotate_size: Some(1 << 30),
            ..Config::default()
        })
        .unwrap();

        w.write(&[stats(1, false)]).unwrap();
        std::thread::sleep(Duration::from_millis(25));
        w.write(&[stats(2, false)]).unwrap();
        w.close().unwrap();

        assert_eq!(
            read_records(&dir.join("out.1.json")).len(),
            2,
            "interval rotation fired with a size threshold configured",
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_size_rotation_wins_over_interval() {
        let dir = temp_dir("rotate-size-first");
        let mut w = Writer::open(Config {
            dir: Some(dir.clone()),
            file: "out.json".to_string(),
            compression_level: 9,
            rotate_interval: Duration::from_secs(3600),
            rotate_size: Some(1),
            ..Config::default()
        })
        .unwrap();

        w.write(&[stats(1, false)]).unwrap();
        w.close().unwrap();

        assert_eq!(read_records(&dir.join("out.1.json")).len(), 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_append_inherits_existing_size() {
        let dir = temp_dir("append");
        fs::write(dir.join("out.json"), vec![b' '; 128]).unwrap();

        let mut w = Writer::open(Config {
            dir: Some(dir.clone()),
            file: "out.json".to_string(),
            compression_level: 9,
            rotate_interval: Duration::ZERO,
            rotate_size: Some(64), // existing file already exceeds this
            ..Config::default()
        })
        .unwrap();

        // Opening rotated the oversized file away before any writes.
        assert!(dir.join("out.1.json").exists());

        w.write(&[stats(1, false)]).unwrap();
        w.close().unwrap();

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotated_file_name_forms() {
        assert_eq!(
            rotated_file_name("flow.json.gz", 2),
            ("flow.2.json.gz".to_string(), true),
        );
        assert_eq!(
            rotated_file_name("flow.json", 1),
            ("flow.1.json".to_string(), false),
        );
        assert_eq!(rotated_file_name("flow", 3), ("flow.3".to_string(), false));
    }

    #[test]
    fn test_open_rejects_non_directory() {
        let dir = temp_dir("notdir");
        let file_path = dir.join("plain");
        fs::write(&file_path, b"x").unwrap();

        let err = Writer::open(Config {
            dir: Some(file_path),
            file: "out.json".to_string(),
            compression_level: 9,
            ..Config::default()
        });
        assert!(err.is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let dir = temp_dir("empty");
        let mut w = Writer::open(Config {
            dir: Some(dir.clone()),
            file: "out.json".to_string(),
            compression_level: 9,
            rotate_interval: Duration::ZERO,
            ..Config::default()
        })
        .unwrap();

        w.write(&[]).unwrap();
        w.close().unwrap();

        assert_eq!(fs::metadata(dir.join("out.json")).unwrap().len(), 0);

        let _ = fs::remove_dir_all(&dir);
    }
}
