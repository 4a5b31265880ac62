//! The kernel-backed sample source.
//!
//! One session owns the diagnostics socket, its read buffer, and the
//! precomputed request (including filter bytecode). The session opens
//! lazily on the first sample call and is torn down on any error; the
//! next call reopens it.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use tracing::debug;

use crate::config::DiagConfig;
use crate::sampler::{
    Batch, BatchStats, FlowId, Pools, Sample, SampleData, Sampler, SamplerError,
};

use super::filter::{build_port_filter, FilterCaps};
use super::monotonic_ns;
use super::wire::{self, DatagramOutcome, WireRecord};

/// Recycle queue depth for batches and sample buffers.
const POOL_CAP: usize = 32;

/// One dump's worth of wire records plus call statistics.
pub struct DiagBatch {
    records: Vec<WireRecord>,
    stats: BatchStats,
}

impl Default for DiagBatch {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            stats: BatchStats::default(),
        }
    }
}

impl DiagBatch {
    fn reset(&mut self) {
        self.records.clear();
        self.stats = BatchStats::default();
    }

    #[cfg(test)]
    pub(crate) fn for_tests(records: Vec<WireRecord>) -> Self {
        let stats = BatchStats {
            samples: records.len(),
            msgs: 1,
            msgs_len: 0,
        };
        Self { records, stats }
    }
}

impl Batch for DiagBatch {
    fn samples(&mut self, reuse: Vec<Sample>) -> Vec<Sample> {
        let need = self.records.len();
        let mut out = if reuse.capacity() >= need {
            let mut out = reuse;
            out.clear();
            out
        } else {
            Vec::with_capacity(need * 2)
        };

        for r in &self.records {
            out.push(Sample {
                id: FlowId {
                    src_ip: r.src_addr,
                    src_port: r.src_port,
                    dst_ip: r.dst_addr,
                    dst_port: r.dst_port,
                },
                data: SampleData {
                    tstamp_ns: r.tstamp_ns,
                    options: r.options,
                    rtt_us: r.rtt_us,
                    min_rtt_us: r.min_rtt_us,
                    snd_cwnd_bytes: r.snd_cwnd_bytes,
                    pacing_rate_bps: r.pacing_rate_bps,
                    total_retransmits: r.total_retransmits,
                    bytes_acked: r.bytes_acked,
                },
            });
        }

        out
    }

    fn stats(&self) -> BatchStats {
        self.stats
    }
}

/// An open diagnostics socket with its read buffer and request bytes.
struct Session {
    fd: OwnedFd,
    read_buf: Vec<u8>,
    request: Vec<u8>,
}

impl Session {
    fn open(cfg: &DiagConfig, caps: FilterCaps) -> Result<Self, SamplerError> {
        // SAFETY: plain socket(2); ownership of the fd transfers to
        // OwnedFd immediately on success.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM,
                wire::NETLINK_SOCK_DIAG,
            )
        };
        if raw < 0 {
            return Err(SamplerError::transport(
                "socket open",
                io::Error::last_os_error(),
            ));
        }
        // SAFETY: raw was just returned by socket(2) and is not owned
        // elsewhere.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let timeout = libc::timeval {
            tv_sec: cfg.receive_timeout.as_secs() as libc::time_t,
            tv_usec: cfg.receive_timeout.subsec_micros() as libc::suseconds_t,
        };
        setsockopt(&fd, libc::SO_RCVTIMEO, &timeout, "set receive timeout")?;

        if cfg.receive_bufsize > 0 {
            let sz = cfg.receive_bufsize as libc::c_int;
            setsockopt(&fd, libc::SO_RCVBUF, &sz, "set receive buffer size")?;
        }
        if cfg.receive_bufsize_force > 0 {
            let sz = cfg.receive_bufsize_force as libc::c_int;
            setsockopt(&fd, libc::SO_RCVBUFFORCE, &sz, "force receive buffer size")?;
        }

        let rcv_bufsize = getsockopt_int(&fd, libc::SO_RCVBUF)?;

        let filter = build_port_filter(&cfg.src_ports.0, &cfg.dst_ports.0, caps);
        let request = wire::encode_dump_request(filter.as_deref());

        debug!(
            rcv_bufsize,
            filter_len = filter.as_ref().map_or(0, Vec::len),
            "opened diag session",
        );

        Ok(Self {
            fd,
            read_buf: vec![0u8; cfg.read_bufsize],
            request,
        })
    }

    /// One request/reply exchange: send the dump request, then read
    /// datagrams until the DONE sentinel, appending records into the
    /// batch. Each datagram's records share one receive timestamp.
    fn sample_into(&mut self, batch: &mut DiagBatch) -> Result<(), SamplerError> {
        self.send_request()?;

        loop {
            let n = self.recv()?;
            let tstamp_ns = monotonic_ns();
            batch.stats.msgs += 1;
            batch.stats.msgs_len += n;

            match wire::decode_datagram(&self.read_buf[..n], tstamp_ns, &mut batch.records)? {
                DatagramOutcome::Done => {
                    batch.stats.samples = batch.records.len();
                    return Ok(());
                }
                DatagramOutcome::More => {}
            }
        }
    }

    fn send_request(&self) -> Result<(), SamplerError> {
        // SAFETY: zeroed sockaddr_nl with the family set is the kernel
        // destination address.
        let mut sa: libc::sockaddr_nl = unsafe { mem::zeroed() };
        sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        // SAFETY: pointers and lengths come straight from live buffers.
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                self.request.as_ptr().cast(),
                self.request.len(),
                0,
                (&sa as *const libc::sockaddr_nl).cast(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(SamplerError::transport(
                "send dump request",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<usize, SamplerError> {
        // SAFETY: the buffer outlives the call and the length matches.
        let rc = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                self.read_buf.as_mut_ptr().cast(),
                self.read_buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(SamplerError::transport(
                "receive reply",
                io::Error::last_os_error(),
            ));
        }
        Ok(rc as usize)
    }
}

fn setsockopt<T>(
    fd: &OwnedFd,
    name: libc::c_int,
    value: &T,
    op: &'static str,
) -> Result<(), SamplerError> {
    // SAFETY: value points at a live T of the advertised size.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            (value as *const T).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(SamplerError::transport(op, io::Error::last_os_error()));
    }
    Ok(())
}

fn getsockopt_int(fd: &OwnedFd, name: libc::c_int) -> Result<libc::c_int, SamplerError> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value/len are live out-parameters of the advertised size.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(SamplerError::transport(
            "read receive buffer size",
            io::Error::last_os_error(),
        ));
    }
    Ok(value)
}

/// Samples per-connection TCP state through the kernel diagnostics
/// socket. Owns the recycling pools shared with the pipeline.
pub struct DiagSampler {
    cfg: DiagConfig,
    caps: FilterCaps,
    session: Option<Session>,
    pools: Arc<Pools<DiagBatch>>,
}

impl DiagSampler {
    pub fn new(cfg: DiagConfig, caps: FilterCaps) -> Self {
        Self {
            cfg,
            caps,
            session: None,
            pools: Arc::new(Pools::new(POOL_CAP)),
        }
    }
}

impl Sampler for DiagSampler {
    type Batch = DiagBatch;

    fn sample(&mut self) -> Result<Option<DiagBatch>, SamplerError> {
        let mut session = match self.session.take() {
            Some(s) => s,
            None => Session::open(&self.cfg, self.caps)?,
        };

        let mut batch = self.pools.batches.take().unwrap_or_default();
        batch.reset();

        match session.sample_into(&mut batch) {
            Ok(()) => {
                self.session = Some(session);
                debug!(
                    samples = batch.stats.samples,
                    msgs = batch.stats.msgs,
                    bytes = batch.stats.msgs_len,
                    "diag sample",
                );
                Ok(Some(batch))
            }
            // Dropping the session closes the socket; the next call
            // reopens it.
            Err(e) => Err(e),
        }
    }

    fn pools(&self) -> Option<Arc<Pools<DiagBatch>>> {
        Some(Arc::clone(&self.pools))
    }

    fn close(&mut self) {
        self.session = None;
    }
}
