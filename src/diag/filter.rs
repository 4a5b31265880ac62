//! Kernel-side port filtering.
//!
//! When port ranges are configured, the dump request carries a small
//! bytecode the kernel interprets per socket. The program is the
//! conjunction of two blocks (source ports, destination ports); within a
//! block, per-range predicates are OR'd by interleaved jumps. A failing
//! predicate in the source block must jump clear over the destination
//! block to reach the terminal reject, which is why emission of the
//! source side needs the destination side's op count.

use std::ffi::CStr;

use tracing::warn;

use crate::config::PortRange;

// Filter opcodes from the kernel's diag bytecode set. The equality ops
// exist only on kernels >= 4.16.
const BC_JMP: u8 = 1;
const BC_S_GE: u8 = 2;
const BC_S_LE: u8 = 3;
const BC_D_GE: u8 = 4;
const BC_D_LE: u8 = 5;
const BC_S_EQ: u8 = 11;
const BC_D_EQ: u8 = 12;

/// Every instruction is one 4-byte unit: opcode, yes-offset, no-offset.
/// Port predicates are followed by a second unit whose no-field holds
/// the port value.
const OP_SIZE: usize = 4;

/// Which filter ops the running kernel supports. Detected once at
/// startup and threaded through session construction; never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterCaps {
    /// Port equality ops are available (kernel >= 4.16). Without them a
    /// singleton range falls back to a ge+le pair.
    pub eq_op: bool,
}

impl FilterCaps {
    /// Probes the running kernel's version string.
    pub fn detect() -> Self {
        // SAFETY: uname only writes into the buffer handed to it.
        let mut un: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut un) } != 0 {
            warn!("uname failed, disabling port equality filter ops");
            return Self { eq_op: false };
        }

        // SAFETY: uname null-terminates the release field.
        let release = unsafe { CStr::from_ptr(un.release.as_ptr()) }.to_string_lossy();
        match Self::from_kernel_release(&release) {
            Some(caps) => caps,
            None => {
                warn!(
                    release = %release,
                    "unable to parse kernel release, disabling port equality filter ops",
                );
                Self { eq_op: false }
            }
        }
    }

    /// Parses a kernel release string such as "5.15.0-91-generic".
    pub fn from_kernel_release(release: &str) -> Option<Self> {
        let mut parts = release.split(|c: char| !c.is_ascii_digit());
        let maj: u32 = parts.next()?.parse().ok()?;
        let min: u32 = parts.next()?.parse().ok()?;
        Some(Self {
            eq_op: maj > 4 || (maj == 4 && min >= 16),
        })
    }
}

/// Builds the filter program for the configured port ranges, or `None`
/// when no ranges are configured and the dump should be unfiltered.
pub fn build_port_filter(
    src: &[PortRange],
    dst: &[PortRange],
    caps: FilterCaps,
) -> Option<Vec<u8>> {
    if src.is_empty() && dst.is_empty() {
        return None;
    }

    let sops = direction_ops(src, caps);
    let dops = direction_ops(dst, caps);

    let mut out = Vec::with_capacity((sops + dops) * OP_SIZE);
    emit_direction(&mut out, src, false, dops, caps);
    emit_direction(&mut out, dst, true, 0, caps);

    Some(out)
}

/// Number of instruction units one direction's predicates need: three
/// per equality, five per range (two of each are the value units, one is
/// the OR jump), minus the final predicate's omitted jump.
fn direction_ops(ranges: &[PortRange], caps: FilterCaps) -> usize {
    if ranges.is_empty() {
        return 0;
    }

    let mut n = 0;
    for r in ranges {
        n += if caps.eq_op && r.lo == r.hi { 3 } else { 5 };
    }
    n - 1
}

/// Emits one direction's OR'd predicates. `tail_ops` is the size of the
/// remainder of the program (the other direction), jumped over by the
/// final predicate's no-branch so a miss lands one unit past the end.
fn emit_direction(
    out: &mut Vec<u8>,
    ranges: &[PortRange],
    dest: bool,
    tail_ops: usize,
    caps: FilterCaps,
) {
    if ranges.is_empty() {
        return;
    }

    let end = out.len() / OP_SIZE + direction_ops(ranges, caps);

    for (i, r) in ranges.iter().enumerate() {
        let last = i == ranges.len() - 1;
        let tail = if last { tail_ops } else { 0 };

        if caps.eq_op && r.lo == r.hi {
            let code = if dest { BC_D_EQ } else { BC_S_EQ };
            push_op(out, code, 2 * OP_SIZE, (tail + 3) * OP_SIZE);
            push_value(out, r.lo);
        } else {
            let (ge, le) = if dest {
                (BC_D_GE, BC_D_LE)
            } else {
                (BC_S_GE, BC_S_LE)
            };
            push_op(out, ge, 2 * OP_SIZE, (tail + 5) * OP_SIZE);
            push_value(out, r.lo);
            push_op(out, le, 2 * OP_SIZE, (tail + 3) * OP_SIZE);
            push_value(out, r.hi);
        }

        if !last {
            let at = out.len() / OP_SIZE;
            push_op(out, BC_JMP, OP_SIZE, (end - at) * OP_SIZE);
        }
    }
}

fn push_op(out: &mut Vec<u8>, code: u8, yes: usize, no: usize) {
    out.push(code);
    out.push(yes as u8);
    out.extend_from_slice(&(no as u16).to_ne_bytes());
}

/// The value unit trailing a port predicate: the kernel reads the port
/// from the second unit's no-field.
fn push_value(out: &mut Vec<u8>, port: u16) {
    out.push(0);
    out.push(0);
    out.extend_from_slice(&port.to_ne_bytes());
}
