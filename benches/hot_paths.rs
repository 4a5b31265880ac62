use criterion::{black_box, criterion_group, criterion_main, Criterion};

use flowmon::config::PortRange;
use flowmon::diag::filter::{build_port_filter, FilterCaps};
use flowmon::diag::wire::{decode_datagram, WireRecord};
use flowmon::sampler::{FlowId, Sample, SampleData};
use flowmon::tracker::{Config as TrackerConfig, Tracker};

const NLMSG_HDRLEN: usize = 16;
const DIAG_MSG_LEN: usize = 72;
const TCP_INFO_LEN: usize = 152;
const SOCK_DIAG_BY_FAMILY: u16 = 20;
const INET_DIAG_INFO: u16 = 2;

/// One diag reply message with a full TCP-info attribute.
fn diag_msg(sport: u16, dport: u16) -> Vec<u8> {
    let mut payload = vec![0u8; DIAG_MSG_LEN];
    payload[0] = libc::AF_INET as u8;
    payload[1] = 1; // established
    payload[4..6].copy_from_slice(&sport.to_be_bytes());
    payload[6..8].copy_from_slice(&dport.to_be_bytes());
    payload[8..12].copy_from_slice(&[10, 0, 0, 1]);
    payload[24..28].copy_from_slice(&[192, 0, 2, 7]);

    let mut info = vec![0u8; TCP_INFO_LEN];
    info[5] = 3; // options
    info[16..20].copy_from_slice(&1448u32.to_ne_bytes()); // snd_mss
    info[68..72].copy_from_slice(&25_000u32.to_ne_bytes()); // rtt
    info[80..84].copy_from_slice(&10u32.to_ne_bytes()); // snd_cwnd
    info[104..112].copy_from_slice(&12_500_000u64.to_ne_bytes()); // pacing
    info[120..128].copy_from_slice(&1_000_000u64.to_ne_bytes()); // bytes acked
    info[148..152].copy_from_slice(&20_000u32.to_ne_bytes()); // min rtt

    let rta_len = 4 + info.len();
    payload.extend_from_slice(&(rta_len as u16).to_ne_bytes());
    payload.extend_from_slice(&INET_DIAG_INFO.to_ne_bytes());
    payload.extend_from_slice(&info);

    let msg_len = NLMSG_HDRLEN + payload.len();
    let mut msg = Vec::with_capacity(msg_len);
    msg.extend_from_slice(&(msg_len as u32).to_ne_bytes());
    msg.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_ne_bytes());
    msg.extend_from_slice(&0u16.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&payload);
    msg
}

fn datagram(records: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    for i in 0..records {
        buf.extend_from_slice(&diag_msg(30_000 + i, 443));
    }
    buf
}

fn sample(n: u16, tstamp_ns: u64, rtt_us: u32) -> Sample {
    Sample {
        id: FlowId {
            src_ip: [10, 0, (n >> 8) as u8, n as u8],
            src_port: 30_000 + n,
            dst_ip: [192, 0, 2, 7],
            dst_port: 443,
        },
        data: SampleData {
            tstamp_ns,
            options: 3,
            rtt_us,
            min_rtt_us: rtt_us / 2,
            snd_cwnd_bytes: 14_480,
            pacing_rate_bps: 12_500_000,
            total_retransmits: 0,
            bytes_acked: 1_000_000,
        },
    }
}

fn bench_decode_datagram(c: &mut Criterion) {
    let data = datagram(128);
    c.bench_function("decode_datagram_128_records", |b| {
        b.iter(|| {
            let mut records: Vec<WireRecord> = Vec::with_capacity(128);
            decode_datagram(black_box(&data), 1, &mut records).expect("decode");
            black_box(records.len())
        })
    });
}

fn bench_build_port_filter(c: &mut Criterion) {
    let src = vec![
        PortRange { lo: 80, hi: 80 },
        PortRange { lo: 443, hi: 443 },
        PortRange {
            lo: 8000,
            hi: 8080,
        },
    ];
    let dst = vec![PortRange {
        lo: 9000,
        hi: 9100,
    }];

    c.bench_function("build_port_filter", |b| {
        b.iter(|| {
            black_box(build_port_filter(
                black_box(&src),
                black_box(&dst),
                FilterCaps { eq_op: true },
            ))
        })
    });
}

fn bench_tracker_tick(c: &mut Criterion) {
    let first: Vec<Sample> = (0..512).map(|n| sample(n, 0, 25_000)).collect();
    let second: Vec<Sample> = (0..512)
        .map(|n| sample(n, 10_000_000, 25_001))
        .collect();

    c.bench_function("tracker_tick_512_flows", |b| {
        b.iter(|| {
            let mut tracker = Tracker::new(TrackerConfig::default());
            tracker.track(black_box(&first));
            tracker.track(black_box(&second));
            black_box(tracker.track(&[]).len())
        })
    });
}

criterion_group!(
    benches,
    bench_decode_datagram,
    bench_build_port_filter,
    bench_tracker_tick,
);
criterion_main!(benches);
