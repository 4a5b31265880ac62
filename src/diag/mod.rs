//! Kernel socket-diagnostics sampling: session management, wire codec,
//! and the kernel-side port-filter bytecode.

pub mod filter;
pub mod sampler;
pub mod wire;

pub use filter::FilterCaps;
pub use sampler::DiagSampler;

/// Current monotonic clock value in nanoseconds. Sample timestamps come
/// from this clock so they order correctly across kernel round-trips
/// regardless of wall-clock adjustments.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime only writes into the timespec handed to it.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}
