//! Wire encoding and decoding for the kernel socket-diagnostics dump.
//!
//! A dump request is one netlink message: header, `inet_diag_req_v2`,
//! and optionally the port-filter bytecode as an attribute. Replies
//! arrive as datagrams carrying a sequence of length-prefixed messages,
//! terminated by a DONE sentinel. Length checks happen once per message,
//! then fixed-offset reads extract the fields we keep.

use crate::sampler::SamplerError;

/// Netlink family for socket diagnostics (`NETLINK_SOCK_DIAG`, the
/// modern name for `NETLINK_INET_DIAG`).
pub const NETLINK_SOCK_DIAG: libc::c_int = 4;

const SOCK_DIAG_BY_FAMILY: u16 = 20;

const NLMSG_HDRLEN: usize = 16;
const NLMSG_DONE: u16 = 3;
const NLMSG_ERROR: u16 = 2;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_DUMP: u16 = 0x100 | 0x200; // NLM_F_ROOT | NLM_F_MATCH

/// Request attribute carrying filter bytecode.
const INET_DIAG_REQ_BYTECODE: u16 = 1;
/// Reply attribute carrying the per-socket TCP info block.
const INET_DIAG_INFO: u16 = 2;

/// `struct inet_diag_req_v2` is 56 bytes: 8 bytes of header fields plus
/// the 48-byte socket ID.
const DIAG_REQ_LEN: usize = 56;
/// `struct inet_diag_msg`: 4 header bytes, 48-byte socket ID, 20 bytes
/// of queue/uid/inode fields.
const DIAG_MSG_LEN: usize = 72;

/// TCP state bit for ESTABLISHED (state value 1). Only ESTABLISHED is
/// requested: sockets leaving the state manifest as absence from the
/// next dump, which is the tracker's end-of-flow signal.
const ESTABLISHED_MASK: u32 = 1 << 1;

// Offsets into `struct tcp_info` for the fields we extract.
const TCPI_OPTIONS: usize = 5;
const TCPI_SND_MSS: usize = 16;
const TCPI_RTT: usize = 68;
const TCPI_SND_CWND: usize = 80;
const TCPI_TOTAL_RETRANS: usize = 100;
const TCPI_PACING_RATE: usize = 104;
const TCPI_BYTES_ACKED: usize = 120;
const TCPI_MIN_RTT: usize = 148;

/// Minimum TCP-info payload covering every field above. Kernels older
/// than 4.6 report a shorter block; their records are skipped.
const TCP_INFO_MIN_LEN: usize = TCPI_MIN_RTT + 4;

/// How many records to add with each output-buffer growth.
const GROW_RECORDS_INCREMENT: usize = 4096;

/// One socket snapshot as lifted off the wire, before conversion into
/// the pipeline's canonical sample form. Ports are already in host byte
/// order; the cwnd is pre-multiplied into bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireRecord {
    pub tstamp_ns: u64,
    pub src_addr: [u8; 4],
    pub src_port: u16,
    pub dst_addr: [u8; 4],
    pub dst_port: u16,
    pub options: u8,
    pub rtt_us: u32,
    pub min_rtt_us: u32,
    pub snd_cwnd_bytes: u32,
    pub pacing_rate_bps: u64,
    pub total_retransmits: u32,
    pub bytes_acked: u64,
}

/// Encodes the one dump request this sampler ever sends: IPv4, TCP,
/// ESTABLISHED-only, TCP-info extension requested, with the port-filter
/// bytecode attached when present.
pub fn encode_dump_request(filter: Option<&[u8]>) -> Vec<u8> {
    let rta_len = filter.map_or(0, |f| 4 + f.len());
    let msg_len = NLMSG_HDRLEN + DIAG_REQ_LEN + rta_len;

    let mut buf = Vec::with_capacity(msg_len);

    // nlmsghdr
    buf.extend_from_slice(&(msg_len as u32).to_ne_bytes());
    buf.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_ne_bytes());
    buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // seq
    buf.extend_from_slice(&0u32.to_ne_bytes()); // pid

    // inet_diag_req_v2
    buf.push(libc::AF_INET as u8);
    buf.push(libc::IPPROTO_TCP as u8);
    buf.push(1 << (INET_DIAG_INFO - 1) as u8); // idiag_ext
    buf.push(0); // pad
    buf.extend_from_slice(&ESTABLISHED_MASK.to_ne_bytes());
    buf.extend_from_slice(&[0u8; 48]); // inet_diag_sockid, unused for dumps

    if let Some(f) = filter {
        buf.extend_from_slice(&(rta_len as u16).to_ne_bytes());
        buf.extend_from_slice(&INET_DIAG_REQ_BYTECODE.to_ne_bytes());
        buf.extend_from_slice(f);
    }

    buf
}

/// What a decoded datagram means for the reply loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramOutcome {
    /// More datagrams follow.
    More,
    /// The DONE sentinel was seen; the dump is complete.
    Done,
}

/// Walks one reply datagram, appending a record for every embedded
/// TCP-info block. All records from this datagram share `tstamp_ns`.
pub fn decode_datagram(
    data: &[u8],
    tstamp_ns: u64,
    records: &mut Vec<WireRecord>,
) -> Result<DatagramOutcome, SamplerError> {
    let mut off = 0;

    while off + NLMSG_HDRLEN <= data.len() {
        let msg_len = read_u32(data, off) as usize;
        let msg_type = read_u16(data, off + 4);

        if msg_len < NLMSG_HDRLEN || msg_len > data.len() - off {
            return Err(SamplerError::Truncated {
                what: "message length exceeds datagram",
            });
        }

        match msg_type {
            NLMSG_DONE => return Ok(DatagramOutcome::Done),
            NLMSG_ERROR => {
                if msg_len < NLMSG_HDRLEN + 4 {
                    return Err(SamplerError::Truncated {
                        what: "error record too short for its code",
                    });
                }
                let errno = read_i32(data, off + NLMSG_HDRLEN);
                return Err(SamplerError::Kernel { code: -errno });
            }
            _ => {
                let payload = &data[off + NLMSG_HDRLEN..off + msg_len];
                decode_diag_msg(payload, tstamp_ns, records)?;
            }
        }

        off += nlmsg_align(msg_len);
    }

    Ok(DatagramOutcome::More)
}

/// Decodes one diagnostic message: socket ID from the fixed header, then
/// an attribute scan for the TCP-info block.
fn decode_diag_msg(
    payload: &[u8],
    tstamp_ns: u64,
    records: &mut Vec<WireRecord>,
) -> Result<(), SamplerError> {
    if payload.len() < DIAG_MSG_LEN {
        return Err(SamplerError::Truncated {
            what: "diag message shorter than its fixed header",
        });
    }

    // inet_diag_sockid starts at offset 4: be16 ports, then 16-byte
    // address fields of which IPv4 uses the first four bytes.
    let src_port = read_u16_be(payload, 4);
    let dst_port = read_u16_be(payload, 6);
    let src_addr = read_addr4(payload, 8);
    let dst_addr = read_addr4(payload, 24);

    let mut off = DIAG_MSG_LEN;
    while off + 4 <= payload.len() {
        let rta_len = read_u16(payload, off) as usize;
        let rta_type = read_u16(payload, off + 2);

        if rta_len < 4 || rta_len > payload.len() - off {
            return Err(SamplerError::Truncated {
                what: "attribute length exceeds message",
            });
        }

        if rta_type == INET_DIAG_INFO {
            let info = &payload[off + 4..off + rta_len];
            if info.len() >= TCP_INFO_MIN_LEN {
                if records.len() == records.capacity() {
                    records.reserve(GROW_RECORDS_INCREMENT);
                }
                records.push(WireRecord {
                    tstamp_ns,
                    src_addr,
                    src_port,
                    dst_addr,
                    dst_port,
                    options: info[TCPI_OPTIONS],
                    rtt_us: read_u32(info, TCPI_RTT),
                    min_rtt_us: read_u32(info, TCPI_MIN_RTT),
                    snd_cwnd_bytes: read_u32(info, TCPI_SND_CWND)
                        .wrapping_mul(read_u32(info, TCPI_SND_MSS)),
                    pacing_rate_bps: read_u64(info, TCPI_PACING_RATE),
                    total_retransmits: read_u32(info, TCPI_TOTAL_RETRANS),
                    bytes_acked: read_u64(info, TCPI_BYTES_ACKED),
                });
            }
        }

        off += nlmsg_align(rta_len);
    }

    Ok(())
}

#[inline]
fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

// ---------------------------------------------------------------------------
// Byte-reading helpers. Callers verify lengths before reading fixed
// offsets; kernel structs are host byte order except the ports.
// ---------------------------------------------------------------------------

#[inline]
fn read_fixed<const N: usize>(data: &[u8], off: usize) -> [u8; N] {
    debug_assert!(off + N <= data.len());
    let mut out = [0u8; N];
    out.copy_from_slice(&data[off..off + N]);
    out
}

#[inline]
fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes(read_fixed::<2>(data, off))
}

#[inline]
fn read_u16_be(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(read_fixed::<2>(data, off))
}

#[inline]
fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(read_fixed::<4>(data, off))
}

#[inline]
fn read_i32(data: &[u8], off: usize) -> i32 {
    read_u32(data, off) as i32
}

#[inline]
fn read_u64(data: &[u8], off: usize) -> u64 {
    u64::from_ne_bytes(read_fixed::<8>(data, off))
}

#[inline]
fn read_addr4(data: &[u8], off: usize) -> [u8; 4] {
    read_fixed::<4>(data, off)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a full tcp_info block with our fields at their offsets.
    fn tcp_info(
        opts: u8,
        rtt: u32,
        min_rtt: u32,
        cwnd_segs: u32,
        mss: u32,
        pacing: u64,
        retrans: u32,
        acked: u64,
    ) -> Vec<u8> {
        let mut info = vec![0u8; TCP_INFO_MIN_LEN];
        info[TCPI_OPTIONS] = opts;
        info[TCPI_SND_MSS..TCPI_SND_MSS + 4].copy_from_slice(&mss.to_ne_bytes());
        info[TCPI_RTT..TCPI_RTT + 4].copy_from_slice(&rtt.to_ne_bytes());
        info[TCPI_SND_CWND..TCPI_SND_CWND + 4].copy_from_slice(&cwnd_segs.to_ne_bytes());
        info[TCPI_TOTAL_RETRANS..TCPI_TOTAL_RETRANS + 4].copy_from_slice(&retrans.to_ne_bytes());
        info[TCPI_PACING_RATE..TCPI_PACING_RATE + 8].copy_from_slice(&pacing.to_ne_bytes());
        info[TCPI_BYTES_ACKED..TCPI_BYTES_ACKED + 8].copy_from_slice(&acked.to_ne_bytes());
        info[TCPI_MIN_RTT..TCPI_MIN_RTT + 4].copy_from_slice(&min_rtt.to_ne_bytes());
        info
    }

    /// Builds one diag reply message carrying the given attributes.
    fn diag_msg(
        src: [u8; 4],
        sport: u16,
        dst: [u8; 4],
        dport: u16,
        attrs: &[(u16, &[u8])],
    ) -> Vec<u8> {
        let mut payload = vec![0u8; DIAG_MSG_LEN];
        payload[0] = libc::AF_INET as u8;
        payload[1] = 1; // established
        payload[4..6].copy_from_slice(&sport.to_be_bytes());
        payload[6..8].copy_from_slice(&dport.to_be_bytes());
        payload[8..12].copy_from_slice(&src);
        payload[24..28].copy_from_slice(&dst);

        for (rta_type, data) in attrs {
            let rta_len = 4 + data.len();
            payload.extend_from_slice(&(rta_len as u16).to_ne_bytes());
            payload.extend_from_slice(&rta_type.to_ne_bytes());
            payload.extend_from_slice(data);
            payload.resize(nlmsg_align(payload.len()), 0);
        }

        let mut msg = Vec::new();
        let msg_len = NLMSG_HDRLEN + payload.len();
        msg.extend_from_slice(&(msg_len as u32).to_ne_bytes());
        msg.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_ne_bytes());
        msg.extend_from_slice(&0u16.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(&payload);
        msg.resize(nlmsg_align(msg.len()), 0);
        msg
    }

    fn control_msg(msg_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        let msg_len = NLMSG_HDRLEN + payload.len();
        msg.extend_from_slice(&(msg_len as u32).to_ne_bytes());
        msg.extend_from_slice(&msg_type.to_ne_bytes());
        msg.extend_from_slice(&0u16.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(payload);
        msg
    }

    #[test]
    fn test_request_without_filter() {
        let req = encode_dump_request(None);
        assert_eq!(req.len(), NLMSG_HDRLEN + DIAG_REQ_LEN);
        assert_eq!(read_u32(&req, 0) as usize, req.len());
        assert_eq!(read_u16(&req, 4), SOCK_DIAG_BY_FAMILY);
        assert_eq!(read_u16(&req, 6), NLM_F_REQUEST | NLM_F_DUMP);
        assert_eq!(req[16], libc::AF_INET as u8);
        assert_eq!(req[17], libc::IPPROTO_TCP as u8);
        assert_eq!(req[18], 2, "TCP info extension bit");
        assert_eq!(read_u32(&req, 20), ESTABLISHED_MASK);
    }

    #[test]
    fn test_request_with_filter_attribute() {
        let filter = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let req = encode_dump_request(Some(&filter));
        assert_eq!(req.len(), NLMSG_HDRLEN + DIAG_REQ_LEN + 4 + filter.len());
        assert_eq!(read_u32(&req, 0) as usize, req.len());

        let rta_off = NLMSG_HDRLEN + DIAG_REQ_LEN;
        assert_eq!(read_u16(&req, rta_off) as usize, 4 + filter.len());
        assert_eq!(read_u16(&req, rta_off + 2), INET_DIAG_REQ_BYTECODE);
        assert_eq!(&req[rta_off + 4..], &filter);
    }

    #[test]
    fn test_decode_single_record() {
        let info = tcp_info(5, 10_000, 9_000, 10, 1_448, 2_000_000, 3, 65_536);
        let msg = diag_msg([192, 0, 2, 1], 443, [198, 51, 100, 7], 52_000, &[(
            INET_DIAG_INFO,
            &info,
        )]);

        let mut records = Vec::new();
        let outcome = decode_datagram(&msg, 77, &mut records).expect("decode");
        assert_eq!(outcome, DatagramOutcome::More);
        assert_eq!(records.len(), 1);

        let r = &records[0];
        assert_eq!(r.tstamp_ns, 77);
        assert_eq!(r.src_addr, [192, 0, 2, 1]);
        assert_eq!(r.src_port, 443);
        assert_eq!(r.dst_addr, [198, 51, 100, 7]);
        assert_eq!(r.dst_port, 52_000);
        assert_eq!(r.options, 5);
        assert_eq!(r.rtt_us, 10_000);
        assert_eq!(r.min_rtt_us, 9_000);
        assert_eq!(r.snd_cwnd_bytes, 14_480);
        assert_eq!(r.pacing_rate_bps, 2_000_000);
        assert_eq!(r.total_retransmits, 3);
        assert_eq!(r.bytes_acked, 65_536);
    }

    #[test]
    fn test_decode_multiple_messages_share_timestamp() {
        let info = tcp_info(0, 1, 1, 1, 1, 1, 0, 1);
        let mut datagram = diag_msg([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, &[(
            INET_DIAG_INFO,
            &info,
        )]);
        datagram.extend_from_slice(&diag_msg(
            [10, 0, 0, 3],
            3,
            [10, 0, 0, 4],
            4,
            &[(INET_DIAG_INFO, &info)],
        ));

        let mut records = Vec::new();
        decode_datagram(&datagram, 42, &mut records).expect("decode");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.tstamp_ns == 42));
        assert_eq!(records[1].src_port, 3);
    }

    #[test]
    fn test_decode_done_terminates() {
        let info = tcp_info(0, 1, 1, 1, 1, 1, 0, 1);
        let mut datagram = diag_msg([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, &[(
            INET_DIAG_INFO,
            &info,
        )]);
        datagram.extend_from_slice(&control_msg(NLMSG_DONE, &[]));
        // Anything after DONE must not be parsed.
        datagram.extend_from_slice(&[0xFF; 64]);

        let mut records = Vec::new();
        let outcome = decode_datagram(&datagram, 1, &mut records).expect("decode");
        assert_eq!(outcome, DatagramOutcome::Done);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_decode_kernel_error_sign_inverted() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(-13i32).to_ne_bytes()); // -EACCES
        let datagram = control_msg(NLMSG_ERROR, &payload);

        let mut records = Vec::new();
        let err = decode_datagram(&datagram, 1, &mut records).unwrap_err();
        assert!(matches!(err, SamplerError::Kernel { code: 13 }));
        assert!(err.is_protocol());
    }

    #[test]
    fn test_decode_error_record_too_short() {
        let datagram = control_msg(NLMSG_ERROR, &[]);
        let mut records = Vec::new();
        let err = decode_datagram(&datagram, 1, &mut records).unwrap_err();
        assert!(matches!(err, SamplerError::Truncated { .. }));
    }

    #[test]
    fn test_decode_overlong_message_length() {
        let mut datagram = control_msg(NLMSG_DONE, &[]);
        datagram[0..4].copy_from_slice(&(1024u32).to_ne_bytes());
        let mut records = Vec::new();
        assert!(decode_datagram(&datagram, 1, &mut records).is_err());
    }

    #[test]
    fn test_decode_skips_records_without_info_attribute() {
        let other_attr = [0u8; 8];
        let msg = diag_msg([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, &[(9, &other_attr)]);

        let mut records = Vec::new();
        decode_datagram(&msg, 1, &mut records).expect("decode");
        assert!(records.is_empty());
    }

    #[test]
    fn test_decode_skips_short_tcp_info() {
        let short_info = vec![0u8; TCP_INFO_MIN_LEN - 1];
        let msg = diag_msg([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, &[(
            INET_DIAG_INFO,
            &short_info,
        )]);

        let mut records = Vec::new();
        decode_datagram(&msg, 1, &mut records).expect("decode");
        assert!(records.is_empty());
    }

    #[test]
    fn test_decode_truncated_attribute_errors() {
        let info = tcp_info(0, 1, 1, 1, 1, 1, 0, 1);
        let mut msg = diag_msg([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, &[(
            INET_DIAG_INFO,
            &info,
        )]);
        // Corrupt the attribute length to reach past the message end.
        let attr_off = NLMSG_HDRLEN + DIAG_MSG_LEN;
        msg[attr_off..attr_off + 2].copy_from_slice(&4096u16.to_ne_bytes());

        let mut records = Vec::new();
        assert!(decode_datagram(&msg, 1, &mut records).is_err());
    }

    #[test]
    fn test_decode_empty_datagram() {
        let mut records = Vec::new();
        let outcome = decode_datagram(&[], 1, &mut records).expect("decode");
        assert_eq!(outcome, DatagramOutcome::More);
        assert!(records.is_empty());
    }
}
