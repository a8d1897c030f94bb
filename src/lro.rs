//! LRO flow admission.
//!
//! Decides whether a received TCP segment should start hardware
//! aggregation. Only well-behaved IPv4 TCP traffic qualifies: no
//! SYN/FIN/RST/URG, not a pure ACK, and either no TCP options or a
//! timestamp-only option block. Admission is idempotent (a second attempt
//! for a 4-tuple already in the flow cache is silently dropped) and
//! sampled: the check runs one packet in every N, with N a tuning knob
//! rather than an invariant.

use crate::flow::{FlowHashTable, FlowKey, InsertOutcome};
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOptionProfile {
    /// No effective options: a bare 20-byte header or NOP/END padding only.
    None,
    /// Only timestamp (plus NOP padding) options present.
    TimestampOnly,
    Other,
}

/// Parsed view of an IPv4 TCP segment, the admission algorithm's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedSegment {
    pub key: FlowKey,
    pub flags: TcpFlags,
    pub payload_len: usize,
    pub seq: u32,
    pub tsval: Option<u32>,
    pub options: TcpOptionProfile,
}

const IPV4_MIN_HDR: usize = 20;
const TCP_MIN_HDR: usize = 20;
const IPPROTO_TCP: u8 = 6;

/// Parse an IPv4 packet into a [`ParsedSegment`]. `None` for anything that
/// is not a well-formed IPv4 TCP segment; such traffic simply bypasses LRO.
pub fn parse_ipv4_tcp(raw: &[u8]) -> Option<ParsedSegment> {
    if raw.len() < IPV4_MIN_HDR {
        return None;
    }

    let version = raw[0] >> 4;
    let ihl = usize::from(raw[0] & 0x0f) * 4;
    if version != 4 || ihl < IPV4_MIN_HDR || raw.len() < ihl {
        return None;
    }

    let total_len = usize::from(u16::from_be_bytes([raw[2], raw[3]]));
    if raw[9] != IPPROTO_TCP || total_len < ihl + TCP_MIN_HDR || raw.len() < total_len {
        return None;
    }

    let tcp = &raw[ihl..total_len];
    let data_off = usize::from(tcp[12] >> 4) * 4;
    if data_off < TCP_MIN_HDR || tcp.len() < data_off {
        return None;
    }

    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    let seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
    let flags = TcpFlags::from_bits_truncate(tcp[13]);

    let (options, tsval) = classify_options(&tcp[TCP_MIN_HDR..data_off]);

    Some(ParsedSegment {
        key: FlowKey::v4(
            [raw[12], raw[13], raw[14], raw[15]],
            [raw[16], raw[17], raw[18], raw[19]],
            src_port,
            dst_port,
        ),
        flags,
        payload_len: tcp.len() - data_off,
        seq,
        tsval,
        options,
    })
}

fn classify_options(mut opts: &[u8]) -> (TcpOptionProfile, Option<u32>) {
    const OPT_END: u8 = 0;
    const OPT_NOP: u8 = 1;
    const OPT_TIMESTAMP: u8 = 8;
    const OPT_TIMESTAMP_LEN: usize = 10;

    if opts.is_empty() {
        return (TcpOptionProfile::None, None);
    }

    let mut tsval = None;
    while let Some(&kind) = opts.first() {
        match kind {
            OPT_END => break,
            OPT_NOP => opts = &opts[1..],
            OPT_TIMESTAMP => {
                if opts.len() < OPT_TIMESTAMP_LEN || usize::from(opts[1]) != OPT_TIMESTAMP_LEN {
                    return (TcpOptionProfile::Other, None);
                }
                tsval = Some(u32::from_be_bytes([opts[2], opts[3], opts[4], opts[5]]));
                opts = &opts[OPT_TIMESTAMP_LEN..];
            }
            _ => return (TcpOptionProfile::Other, None),
        }
    }

    // Reaching here means every option was timestamp or NOP/END padding.
    match tsval {
        Some(_) => (TcpOptionProfile::TimestampOnly, tsval),
        None => (TcpOptionProfile::None, None),
    }
}

/// Aggregation-worthiness gate.
pub fn lro_eligible(seg: &ParsedSegment) -> bool {
    if seg
        .flags
        .intersects(TcpFlags::SYN | TcpFlags::FIN | TcpFlags::RST | TcpFlags::URG)
    {
        return false;
    }
    if seg.payload_len == 0 {
        // Pure ACK; nothing to coalesce.
        return false;
    }
    matches!(
        seg.options,
        TcpOptionProfile::None | TcpOptionProfile::TimestampOnly
    )
}

/// One-in-N admission sampling. The counter is lock-free so the hot
/// receive path never serializes on it.
pub struct SampleGate {
    counter: AtomicU32,
    mask: u32,
}

impl SampleGate {
    /// `mask` 0 checks every packet; mask 3 checks one in four.
    pub fn new(mask: u32) -> Self {
        Self {
            counter: AtomicU32::new(0),
            mask,
        }
    }

    pub fn admit(&self) -> bool {
        self.counter.fetch_add(1, Ordering::Relaxed) & self.mask == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// New flow admitted; the returned request must be sent to firmware.
    Requested(crate::proto::FirmwareRequest),
    /// The flow is already being aggregated.
    AlreadyAggregating,
    /// Flow cache full; skip aggregation this time.
    CacheFull,
    /// Segment does not qualify for LRO.
    Ineligible,
}

/// Attempt LRO admission for one segment. The table insert is what makes
/// a racing duplicate admission collapse to exactly one flow entry and one
/// firmware request.
pub fn try_initiate_lro(
    table: &FlowHashTable,
    seg: &ParsedSegment,
    context_id: u32,
    rss_hash: u32,
) -> AdmissionOutcome {
    if !lro_eligible(seg) {
        return AdmissionOutcome::Ineligible;
    }

    match table.insert(seg.key, context_id) {
        InsertOutcome::Inserted(_) => {
            AdmissionOutcome::Requested(crate::proto::FirmwareRequest {
                context_id,
                completion_id: None,
                body: crate::proto::RequestBody::AddLroFlow {
                    key: seg.key,
                    rss_hash,
                    initial_seq: seg.seq,
                    tsval: seg.tsval,
                },
            })
        }
        InsertOutcome::AlreadyExists => AdmissionOutcome::AlreadyAggregating,
        InsertOutcome::CacheFull => AdmissionOutcome::CacheFull,
    }
}
