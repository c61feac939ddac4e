//! Binary video packet codec.
//!
//! A video packet is a single binary WebSocket message carrying a complete
//! encoded frame or one fragment of one. Layout, big-endian throughout:
//!
//! ```text
//! magic(4) "ARCS" | version(1) | type(1) | frame_no(4) | timestamp_us(8)
//! | flags(1) | payload_len(4) | [frag_index(2) frag_total(2)] | payload
//! | crc32(4) over all preceding bytes
//! ```
//!
//! The relay never looks inside the payload; it frames, routes, and drops.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Packet magic, the ASCII bytes "ARCS".
pub const MAGIC: [u8; 4] = [0x41, 0x52, 0x43, 0x53];

/// Current wire version.
pub const VERSION: u8 = 0x01;

/// Packet type for video frames. Other values are reserved.
pub const TYPE_VIDEO: u8 = 0x02;

/// Flag bit: this packet carries (the start of) a keyframe.
pub const FLAG_KEYFRAME: u8 = 0b0000_0001;
/// Flag bit: the payload is encrypted end-to-end. Opaque to the relay.
pub const FLAG_ENCRYPTED: u8 = 0b0000_0010;
/// Flag bit: this packet is one fragment of a larger frame.
pub const FLAG_FRAGMENT: u8 = 0b0000_0100;

/// Fixed header length for a non-fragment packet (up to and including
/// `payload_len`).
pub const HEADER_LEN: usize = 23;
/// Extra header bytes when the fragment flag is set.
pub const FRAGMENT_EXT_LEN: usize = 4;
/// Trailing CRC32 length.
pub const CRC_LEN: usize = 4;

/// Smallest well-formed packet: empty non-fragment payload.
pub const MIN_PACKET_LEN: usize = HEADER_LEN + CRC_LEN;

/// How long an incomplete fragment group is kept before being discarded.
pub const DEFAULT_GROUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Framing error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("bad magic")]
    BadMagic,

    #[error("unsupported version: {0}")]
    BadVersion(u8),

    #[error("unsupported packet type: {0}")]
    BadType(u8),

    #[error("declared payload length {declared} does not match actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("crc mismatch")]
    CrcMismatch,

    #[error("invalid fragment header: index {index} >= total {total}")]
    BadFragment { index: u16, total: u16 },

    #[error("max_packet_size {0} leaves no room for payload")]
    PacketSizeTooSmall(usize),

    #[error("payload needs {0} fragments, exceeding the u16 fragment space")]
    TooManyFragments(usize),
}

/// One decoded packet as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPacket {
    pub frame_no: u32,
    pub timestamp_us: u64,
    pub keyframe: bool,
    pub encrypted: bool,
    /// `(index, total)` when the fragment flag was set.
    pub fragment: Option<(u16, u16)>,
    pub payload: Bytes,
}

impl VideoPacket {
    /// Serialize this packet, appending the trailing CRC32.
    pub fn encode(&self) -> Bytes {
        let ext = if self.fragment.is_some() {
            FRAGMENT_EXT_LEN
        } else {
            0
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + ext + self.payload.len() + CRC_LEN);
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(TYPE_VIDEO);
        buf.put_u32(self.frame_no);
        buf.put_u64(self.timestamp_us);

        let mut flags = 0u8;
        if self.keyframe {
            flags |= FLAG_KEYFRAME;
        }
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if self.fragment.is_some() {
            flags |= FLAG_FRAGMENT;
        }
        buf.put_u8(flags);
        buf.put_u32(self.payload.len() as u32);
        if let Some((index, total)) = self.fragment {
            buf.put_u16(index);
            buf.put_u16(total);
        }
        buf.put_slice(&self.payload);

        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf.freeze()
    }
}

/// Parse a single packet off the wire.
///
/// Rejects anything whose magic, version, type, declared length, or CRC is
/// inconsistent with the actual bytes.
pub fn parse_packet(data: &[u8]) -> Result<VideoPacket, FrameError> {
    if data.len() < MIN_PACKET_LEN {
        return Err(FrameError::Truncated(data.len()));
    }

    // CRC covers everything before the trailing four bytes.
    let (body, tail) = data.split_at(data.len() - CRC_LEN);
    let declared_crc = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if crc32fast::hash(body) != declared_crc {
        return Err(FrameError::CrcMismatch);
    }

    let mut buf = body;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(FrameError::BadMagic);
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(FrameError::BadVersion(version));
    }
    let ptype = buf.get_u8();
    if ptype != TYPE_VIDEO {
        return Err(FrameError::BadType(ptype));
    }

    let frame_no = buf.get_u32();
    let timestamp_us = buf.get_u64();
    let flags = buf.get_u8();
    let payload_len = buf.get_u32() as usize;

    let fragment = if flags & FLAG_FRAGMENT != 0 {
        if buf.remaining() < FRAGMENT_EXT_LEN {
            return Err(FrameError::Truncated(data.len()));
        }
        let index = buf.get_u16();
        let total = buf.get_u16();
        if total == 0 || index >= total {
            return Err(FrameError::BadFragment { index, total });
        }
        Some((index, total))
    } else {
        None
    };

    if buf.remaining() != payload_len {
        return Err(FrameError::LengthMismatch {
            declared: payload_len,
            actual: buf.remaining(),
        });
    }

    Ok(VideoPacket {
        frame_no,
        timestamp_us,
        keyframe: flags & FLAG_KEYFRAME != 0,
        encrypted: flags & FLAG_ENCRYPTED != 0,
        fragment,
        payload: Bytes::copy_from_slice(buf),
    })
}

/// Encode one frame into an ordered list of wire packets.
///
/// The frame is fragmented iff a single packet would exceed
/// `max_packet_size`. Every fragment shares `frame_no` and `timestamp_us`;
/// the keyframe bit is set only on fragment 0; `fragment_total` is constant
/// across the group.
pub fn encode_frame(
    frame_no: u32,
    timestamp_us: u64,
    keyframe: bool,
    encrypted: bool,
    payload: &[u8],
    max_packet_size: usize,
) -> Result<Vec<Bytes>, FrameError> {
    let single = HEADER_LEN + payload.len() + CRC_LEN;
    if single <= max_packet_size {
        let packet = VideoPacket {
            frame_no,
            timestamp_us,
            keyframe,
            encrypted,
            fragment: None,
            payload: Bytes::copy_from_slice(payload),
        };
        return Ok(vec![packet.encode()]);
    }

    let frag_overhead = HEADER_LEN + FRAGMENT_EXT_LEN + CRC_LEN;
    if max_packet_size <= frag_overhead {
        return Err(FrameError::PacketSizeTooSmall(max_packet_size));
    }
    let chunk = max_packet_size - frag_overhead;
    let total = payload.len().div_ceil(chunk);
    if total > u16::MAX as usize {
        return Err(FrameError::TooManyFragments(total));
    }

    let mut packets = Vec::with_capacity(total);
    for (index, slice) in payload.chunks(chunk).enumerate() {
        let packet = VideoPacket {
            frame_no,
            timestamp_us,
            keyframe: keyframe && index == 0,
            encrypted,
            fragment: Some((index as u16, total as u16)),
            payload: Bytes::copy_from_slice(slice),
        };
        packets.push(packet.encode());
    }
    Ok(packets)
}

/// Cheap header peek for relay-side counters: does this packet start a new
/// frame? Fragments with a non-zero index continue a frame that was already
/// counted when fragment 0 passed through. Anything that does not look like
/// an ARCS packet counts as its own frame; the relay forwards it untouched
/// either way.
pub fn starts_new_frame(data: &[u8]) -> bool {
    if data.len() < MIN_PACKET_LEN {
        return true;
    }
    if data[0..4] != MAGIC || data[4] != VERSION || data[5] != TYPE_VIDEO {
        return true;
    }
    let flags = data[18];
    if flags & FLAG_FRAGMENT == 0 {
        return true;
    }
    if data.len() < HEADER_LEN + FRAGMENT_EXT_LEN + CRC_LEN {
        return true;
    }
    let index = u16::from_be_bytes([data[HEADER_LEN], data[HEADER_LEN + 1]]);
    index == 0
}

/// A fully reassembled frame, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub frame_no: u32,
    pub timestamp_us: u64,
    pub keyframe: bool,
    pub encrypted: bool,
    pub payload: Bytes,
}

struct FragmentGroup {
    total: u16,
    received: Vec<Option<Bytes>>,
    count: u16,
    keyframe: bool,
    encrypted: bool,
    timestamp_us: u64,
    first_seen: Instant,
}

/// Reassembles fragment groups back into frames.
///
/// Fragments are buffered by `frame_no` until all `fragment_total` indices
/// are present, then concatenated in index order. Incomplete groups are
/// discarded once they are older than the group timeout, or when a newer
/// `frame_no` completes first. Out-of-order delivery between distinct
/// groups is permitted.
pub struct Reassembler {
    pending: HashMap<u32, FragmentGroup>,
    group_timeout: Duration,
    rejected: u64,
    discarded_groups: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_GROUP_TIMEOUT)
    }

    pub fn with_timeout(group_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            group_timeout,
            rejected: 0,
            discarded_groups: 0,
        }
    }

    /// Feed one wire packet. Returns a frame when one becomes complete.
    ///
    /// Malformed packets are silently dropped and counted.
    pub fn accept(&mut self, data: &[u8]) -> Option<AssembledFrame> {
        let packet = match parse_packet(data) {
            Ok(p) => p,
            Err(_) => {
                self.rejected += 1;
                return None;
            }
        };
        self.evict_stale(Instant::now());

        let (index, total) = match packet.fragment {
            None => {
                return Some(AssembledFrame {
                    frame_no: packet.frame_no,
                    timestamp_us: packet.timestamp_us,
                    keyframe: packet.keyframe,
                    encrypted: packet.encrypted,
                    payload: packet.payload,
                });
            }
            Some(pair) => pair,
        };

        let group = self
            .pending
            .entry(packet.frame_no)
            .or_insert_with(|| FragmentGroup {
                total,
                received: vec![None; total as usize],
                count: 0,
                keyframe: false,
                encrypted: packet.encrypted,
                timestamp_us: packet.timestamp_us,
                first_seen: Instant::now(),
            });

        // A total that disagrees with the rest of the group is a protocol
        // violation; drop the packet.
        if group.total != total {
            self.rejected += 1;
            return None;
        }
        let slot = &mut group.received[index as usize];
        if slot.is_some() {
            // Duplicate fragment.
            self.rejected += 1;
            return None;
        }
        if index == 0 {
            group.keyframe = packet.keyframe;
        }
        *slot = Some(packet.payload);
        group.count += 1;

        if group.count < group.total {
            return None;
        }

        let group = self.pending.remove(&packet.frame_no).expect("group present");
        let mut payload = BytesMut::new();
        for part in group.received.into_iter() {
            payload.put_slice(&part.expect("all fragments present"));
        }

        // Anything older than a completed frame will never be useful.
        let frame_no = packet.frame_no;
        let before = self.pending.len();
        self.pending.retain(|&no, _| no > frame_no);
        self.discarded_groups += (before - self.pending.len()) as u64;

        Some(AssembledFrame {
            frame_no,
            timestamp_us: group.timestamp_us,
            keyframe: group.keyframe,
            encrypted: group.encrypted,
            payload: payload.freeze(),
        })
    }

    /// Drop incomplete groups older than the group timeout.
    pub fn evict_stale(&mut self, now: Instant) {
        let timeout = self.group_timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, group| now.duration_since(group.first_seen) < timeout);
        self.discarded_groups += (before - self.pending.len()) as u64;
    }

    /// Packets dropped for failing validation.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Incomplete fragment groups discarded.
    pub fn discarded_groups(&self) -> u64 {
        self.discarded_groups
    }

    /// Incomplete groups currently buffered.
    pub fn pending_groups(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_packet_round_trip() {
        let payload = b"not actually h264";
        let packets = encode_frame(7, 1_000_000, true, false, payload, usize::MAX).unwrap();
        assert_eq!(packets.len(), 1);

        let decoded = parse_packet(&packets[0]).unwrap();
        assert_eq!(decoded.frame_no, 7);
        assert_eq!(decoded.timestamp_us, 1_000_000);
        assert!(decoded.keyframe);
        assert!(!decoded.encrypted);
        assert_eq!(decoded.fragment, None);
        assert_eq!(decoded.payload.as_ref(), payload);
    }

    #[test]
    fn test_empty_payload() {
        let packets = encode_frame(0, 0, false, false, &[], 1024).unwrap();
        assert_eq!(packets.len(), 1);
        let decoded = parse_packet(&packets[0]).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let packets = encode_frame(1, 1, false, false, b"x", 1024).unwrap();
        let mut bytes = packets[0].to_vec();
        bytes[0] = 0x00;
        // Fix up the CRC so only the magic is wrong.
        let len = bytes.len();
        let crc = crc32fast::hash(&bytes[..len - 4]);
        bytes[len - 4..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(parse_packet(&bytes), Err(FrameError::BadMagic));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let packets = encode_frame(1, 1, false, false, b"abcd", 1024).unwrap();
        let mut bytes = packets[0].to_vec();
        // Declare one byte more than is present.
        bytes[22] += 1;
        let len = bytes.len();
        let crc = crc32fast::hash(&bytes[..len - 4]);
        bytes[len - 4..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            parse_packet(&bytes),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_large_frame_fragmentation_shape() {
        // A 600 000 byte frame at max_packet_size 65536 splits into 10
        // packets with a constant fragment_total of 10.
        let payload = vec![0xAAu8; 600_000];
        let packets = encode_frame(42, 99, true, false, &payload, 65_536).unwrap();
        assert_eq!(packets.len(), 10);
        for (i, raw) in packets.iter().enumerate() {
            assert!(raw.len() <= 65_536);
            let p = parse_packet(raw).unwrap();
            assert_eq!(p.fragment, Some((i as u16, 10)));
            assert_eq!(p.keyframe, i == 0);
        }
    }

    #[test]
    fn test_reassembly_in_order() {
        let payload: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
        let packets = encode_frame(3, 5, true, true, &payload, 4096).unwrap();

        let mut reassembler = Reassembler::new();
        let mut delivered = None;
        for raw in &packets {
            if let Some(frame) = reassembler.accept(raw) {
                delivered = Some(frame);
            }
        }
        let frame = delivered.expect("frame delivered");
        assert_eq!(frame.frame_no, 3);
        assert_eq!(frame.timestamp_us, 5);
        assert!(frame.keyframe);
        assert!(frame.encrypted);
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_reassembly_out_of_order_within_group() {
        let payload: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        let mut packets = encode_frame(9, 1, false, false, &payload, 1024).unwrap();
        packets.reverse();

        let mut reassembler = Reassembler::new();
        let mut delivered = None;
        for raw in &packets {
            if let Some(frame) = reassembler.accept(raw) {
                delivered = Some(frame);
            }
        }
        assert_eq!(delivered.unwrap().payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_newer_complete_group_discards_older() {
        let old = encode_frame(1, 1, false, false, &vec![1u8; 8000], 1024).unwrap();
        let new = encode_frame(2, 2, false, false, &vec![2u8; 8000], 1024).unwrap();

        let mut reassembler = Reassembler::new();
        // Only part of the old group arrives.
        assert!(reassembler.accept(&old[0]).is_none());
        for raw in &new {
            reassembler.accept(raw);
        }
        assert_eq!(reassembler.pending_groups(), 0);
        assert_eq!(reassembler.discarded_groups(), 1);
    }

    #[test]
    fn test_stale_group_eviction() {
        let packets = encode_frame(1, 1, false, false, &vec![0u8; 8000], 1024).unwrap();
        let mut reassembler = Reassembler::with_timeout(Duration::from_millis(10));
        assert!(reassembler.accept(&packets[0]).is_none());
        assert_eq!(reassembler.pending_groups(), 1);

        reassembler.evict_stale(Instant::now() + Duration::from_millis(20));
        assert_eq!(reassembler.pending_groups(), 0);
        assert_eq!(reassembler.discarded_groups(), 1);
    }

    #[test]
    fn test_rejected_counter() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.accept(b"garbage").is_none());
        assert!(reassembler.accept(&[0u8; 64]).is_none());
        assert_eq!(reassembler.rejected(), 2);
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            frame_no in any::<u32>(),
            timestamp_us in any::<u64>(),
            keyframe in any::<bool>(),
            encrypted in any::<bool>(),
            payload in prop::collection::vec(any::<u8>(), 0..4096),
        ) {
            let packets =
                encode_frame(frame_no, timestamp_us, keyframe, encrypted, &payload, usize::MAX)?;
            prop_assert_eq!(packets.len(), 1);
            let decoded = parse_packet(&packets[0])?;
            prop_assert_eq!(decoded.frame_no, frame_no);
            prop_assert_eq!(decoded.timestamp_us, timestamp_us);
            prop_assert_eq!(decoded.keyframe, keyframe);
            prop_assert_eq!(decoded.encrypted, encrypted);
            prop_assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        }

        #[test]
        fn prop_fragmentation(
            payload in prop::collection::vec(any::<u8>(), 1..20_000),
            max_packet_size in (HEADER_LEN + FRAGMENT_EXT_LEN + CRC_LEN + 1)..4096usize,
        ) {
            let packets = encode_frame(5, 10, true, false, &payload, max_packet_size)?;

            let mut reconstructed = Vec::new();
            let mut zero_index_count = 0;
            let mut totals = Vec::new();
            for (i, raw) in packets.iter().enumerate() {
                prop_assert!(raw.len() <= max_packet_size);
                let p = parse_packet(raw)?;
                if let Some((index, total)) = p.fragment {
                    prop_assert_eq!(index as usize, i);
                    if index == 0 {
                        zero_index_count += 1;
                    }
                    totals.push(total);
                }
                reconstructed.extend_from_slice(&p.payload);
            }
            prop_assert_eq!(reconstructed, payload);
            if packets.len() > 1 {
                prop_assert_eq!(zero_index_count, 1);
                totals.dedup();
                prop_assert_eq!(totals.len(), 1);
            }
        }

        #[test]
        fn prop_crc_tamper_detected(
            payload in prop::collection::vec(any::<u8>(), 0..512),
            flip in any::<usize>(),
            bit in 0u8..8,
        ) {
            let packets = encode_frame(1, 2, false, false, &payload, usize::MAX)?;
            let mut bytes = packets[0].to_vec();
            let pos = flip % bytes.len();
            bytes[pos] ^= 1 << bit;
            prop_assert!(parse_packet(&bytes).is_err());
        }
    }
}
