//! Sample data model and the interface the pipeline expects from a
//! sample source.
//!
//! A source produces one [`Batch`] per kernel round-trip. Converting a
//! batch into the canonical [`Sample`] form is a separate pipeline stage
//! so it can run concurrently with the next round-trip.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// TCP option flags as reported by the kernel in the per-socket info
/// block (`TCPI_OPT_*`).
pub mod options {
    /// TCP timestamps were enabled.
    pub const TIMESTAMPS: u8 = 1;
    /// SACK was enabled.
    pub const SACK: u8 = 2;
    /// TCP window scaling was used.
    pub const WSCALE: u8 = 4;
    /// ECN was negotiated at session init.
    pub const ECN: u8 = 8;
    /// At least one packet was received with ECT.
    pub const ECN_SEEN: u8 = 16;
    /// SYN data was acked in SYN sent or received.
    pub const SYN_DATA: u8 = 32;
}

/// Identifies a flow within one run: local and remote IPv4 address and
/// port. Protocol is fixed (TCP), so four fields suffice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    /// Source (local) IPv4 address octets.
    pub src_ip: [u8; 4],
    /// Source (local) port, host byte order.
    pub src_port: u16,
    /// Destination (remote) IPv4 address octets.
    pub dst_ip: [u8; 4],
    /// Destination (remote) port, host byte order.
    pub dst_port: u16,
}

/// One congestion-control snapshot for a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleData {
    /// Monotonic nanosecond timestamp taken when the carrying kernel
    /// message was received. Records from the same message share it.
    pub tstamp_ns: u64,
    /// TCP option flags, see [`options`].
    pub options: u8,
    /// Smoothed RTT in microseconds.
    pub rtt_us: u32,
    /// Minimum RTT in microseconds, as tracked by the kernel.
    pub min_rtt_us: u32,
    /// Send congestion window in bytes (`snd_cwnd * snd_mss`).
    pub snd_cwnd_bytes: u32,
    /// Pacing rate in bytes per second.
    pub pacing_rate_bps: u64,
    /// Total retransmit counter.
    pub total_retransmits: u32,
    /// Bytes acked.
    pub bytes_acked: u64,
}

impl SampleData {
    /// True if all fields other than the timestamp and option flags
    /// match. This is the relation the tracker dedups by; changing the
    /// field set changes dedup counts and thus weight normalization.
    pub fn equivalent_to(&self, other: &SampleData) -> bool {
        self.rtt_us == other.rtt_us
            && self.bytes_acked == other.bytes_acked
            && self.pacing_rate_bps == other.pacing_rate_bps
            && self.total_retransmits == other.total_retransmits
            && self.snd_cwnd_bytes == other.snd_cwnd_bytes
            && self.min_rtt_us == other.min_rtt_us
    }
}

/// A flow ID together with one snapshot of its data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub id: FlowId,
    pub data: SampleData,
}

/// Wire-level statistics for one sample call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Socket snapshots extracted.
    pub samples: usize,
    /// Kernel messages read.
    pub msgs: usize,
    /// Total bytes across all messages.
    pub msgs_len: usize,
}

/// Errors a sample source can report.
///
/// Both variants close the source's session; the caller may retry and
/// the next call reopens it.
#[derive(Error, Debug)]
pub enum SamplerError {
    /// Socket open/send/receive failure.
    #[error("diag transport failure during {op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The kernel answered the dump with an explicit error record. The
    /// code is the kernel's errno, sign-inverted to positive.
    #[error("kernel returned diag error code {code}")]
    Kernel { code: i32 },

    /// A reply message was shorter than its own framing claims.
    #[error("truncated diag reply: {what}")]
    Truncated { what: &'static str },
}

impl SamplerError {
    pub(crate) fn transport(op: &'static str, source: io::Error) -> Self {
        Self::Transport { op, source }
    }

    /// True for failures of the kernel protocol itself (error record or
    /// framing violation), as opposed to socket transport.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Kernel { .. } | Self::Truncated { .. })
    }
}

/// One owned batch of snapshots from a single kernel round-trip.
pub trait Batch: Send + 'static {
    /// Converts the batch into canonical samples. `reuse` is used as the
    /// destination when its capacity suffices; otherwise a fresh buffer
    /// is allocated at twice the required length. Call at most once.
    fn samples(&mut self, reuse: Vec<Sample>) -> Vec<Sample>;

    /// Wire statistics for the round-trip that produced this batch.
    fn stats(&self) -> BatchStats;
}

/// A source of sample batches.
///
/// `sample` performs one synchronous request/reply exchange and returns
/// `Ok(None)` when the source has nothing further to produce. The
/// recycling pools are optional: the kernel sampler supplies them, test
/// sources typically do not.
pub trait Sampler: Send + 'static {
    type Batch: Batch;

    fn sample(&mut self) -> Result<Option<Self::Batch>, SamplerError>;

    /// Recycling pools shared with the downstream stages, if this source
    /// reuses buffers.
    fn pools(&self) -> Option<Arc<Pools<Self::Batch>>> {
        None
    }

    /// Releases any session state. The source may be sampled again
    /// afterwards; doing so reopens the session.
    fn close(&mut self) {}
}

/// Bounded multi-producer/multi-consumer object pool. `put` on a full
/// pool drops the object; `take` on an empty pool returns `None`.
pub struct Pool<T> {
    slots: Mutex<Vec<T>>,
    cap: usize,
}

impl<T> Pool<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    pub fn put(&self, value: T) {
        let mut slots = self.slots.lock();
        if slots.len() < self.cap {
            slots.push(value);
        }
    }

    pub fn take(&self) -> Option<T> {
        self.slots.lock().pop()
    }
}

/// The recycling pools a sampler shares with the pipeline: whole batches
/// returned after conversion, and sample buffers returned after
/// tracking. Held behind `Arc` so batches carry no back-pointer to the
/// sampler that produced them.
pub struct Pools<B> {
    pub batches: Pool<B>,
    pub sample_bufs: Pool<Vec<Sample>>,
}

impl<B> Pools<B> {
    pub fn new(cap: usize) -> Self {
        Self {
            batches: Pool::new(cap),
            sample_bufs: Pool::new(cap),
        }
    }
}
