//! RTP packetization
//!
//! Fragments one encoded frame into RTP packets under a 1200-byte MTU:
//! 12-byte RTP header, one payload-descriptor byte, then payload. The
//! marker bit is set exactly on the last fragment; the descriptor's
//! start-of-partition bit is set exactly on the first. All packets of one
//! frame share a timestamp, which advances by `round(90000/fps)` between
//! frames on the 90 kHz clock. The sequence counter is shared across peers
//! and wraps modulo 2^16.

use bytes::Bytes;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use crate::video::CodecKind;

/// MTU ceiling for one RTP packet
pub const RTP_MTU: usize = 1200;

/// Dynamic payload type advertised in the SDP
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;

/// Video RTP clock
pub const VIDEO_CLOCK_RATE: u32 = 90000;

const RTP_HEADER_SIZE: usize = 12;
const DESCRIPTOR_SIZE: usize = 1;

/// Largest payload that fits one packet after header and descriptor
pub const MAX_PAYLOAD_SIZE: usize = RTP_MTU - RTP_HEADER_SIZE - DESCRIPTOR_SIZE;

/// Codec-specific payload-descriptor byte.
/// VP8: RFC 7741 S bit. H.264: FU-indicator-style start bit.
fn descriptor_byte(codec: CodecKind, first: bool) -> u8 {
    if !first {
        return 0;
    }
    match codec {
        CodecKind::Vp8 => 0x10,
        CodecKind::H264 => 0x80,
    }
}

/// Per-stream RTP send state shared by every peer of the stream
pub struct RtpPacketizer {
    codec: CodecKind,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    timestamp_step: u32,
}

impl RtpPacketizer {
    pub fn new(codec: CodecKind, ssrc: u32, fps: u32) -> Self {
        let fps = fps.max(1);
        Self {
            codec,
            ssrc,
            sequence: 0,
            timestamp: 0,
            // round(90000 / fps)
            timestamp_step: (VIDEO_CLOCK_RATE + fps / 2) / fps,
        }
    }

    pub fn timestamp_step(&self) -> u32 {
        self.timestamp_step
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Fragment one encoded frame. Sequence numbers are contiguous across
    /// the frame; exactly one marker is emitted, on the final fragment.
    pub fn packetize(&mut self, frame: &[u8]) -> Vec<Packet> {
        let timestamp = self.timestamp;
        self.timestamp = self.timestamp.wrapping_add(self.timestamp_step);

        if frame.is_empty() {
            return Vec::new();
        }

        let mut packets = Vec::with_capacity(frame.len() / MAX_PAYLOAD_SIZE + 1);
        let mut offset = 0;
        let mut first = true;

        while offset < frame.len() {
            let chunk = MAX_PAYLOAD_SIZE.min(frame.len() - offset);
            let last = offset + chunk >= frame.len();

            let mut payload = Vec::with_capacity(DESCRIPTOR_SIZE + chunk);
            payload.push(descriptor_byte(self.codec, first));
            payload.extend_from_slice(&frame[offset..offset + chunk]);

            packets.push(Packet {
                header: Header {
                    version: 2,
                    marker: last,
                    payload_type: VIDEO_PAYLOAD_TYPE,
                    sequence_number: self.sequence,
                    timestamp,
                    ssrc: self.ssrc,
                    ..Default::default()
                },
                payload: Bytes::from(payload),
            });

            self.sequence = self.sequence.wrapping_add(1);
            offset += chunk;
            first = false;
        }

        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packetizer() -> RtpPacketizer {
        RtpPacketizer::new(CodecKind::Vp8, 0x1234_5678, 30)
    }

    #[test]
    fn fragments_share_timestamp_and_ssrc_with_contiguous_sequence() {
        let mut p = packetizer();
        let frame = vec![0xAB; MAX_PAYLOAD_SIZE * 3 + 10];
        let packets = p.packetize(&frame);
        assert_eq!(packets.len(), 4);

        let ts = packets[0].header.timestamp;
        for (i, pkt) in packets.iter().enumerate() {
            assert_eq!(pkt.header.timestamp, ts);
            assert_eq!(pkt.header.ssrc, 0x1234_5678);
            assert_eq!(pkt.header.payload_type, VIDEO_PAYLOAD_TYPE);
            assert_eq!(pkt.header.sequence_number, i as u16);
        }
    }

    #[test]
    fn exactly_one_marker_on_the_final_fragment() {
        let mut p = packetizer();
        let frame = vec![0x00; MAX_PAYLOAD_SIZE * 2 + 1];
        let packets = p.packetize(&frame);
        let markers: Vec<bool> = packets.iter().map(|p| p.header.marker).collect();
        assert_eq!(markers.iter().filter(|&&m| m).count(), 1);
        assert!(markers.last().copied().unwrap());
    }

    #[test]
    fn start_bit_only_on_the_first_fragment() {
        let mut p = packetizer();
        let frame = vec![0x00; MAX_PAYLOAD_SIZE + 5];
        let packets = p.packetize(&frame);
        assert_eq!(packets[0].payload[0] & 0x10, 0x10);
        for pkt in &packets[1..] {
            assert_eq!(pkt.payload[0] & 0x10, 0);
        }

        let mut h264 = RtpPacketizer::new(CodecKind::H264, 1, 30);
        let packets = h264.packetize(&frame);
        assert_eq!(packets[0].payload[0] & 0x80, 0x80);
        assert_eq!(packets[1].payload[0], 0);
    }

    #[test]
    fn frame_at_the_mtu_boundary() {
        let mut p = packetizer();

        let exact = vec![0x42; MAX_PAYLOAD_SIZE];
        let packets = p.packetize(&exact);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload.len(), RTP_MTU - RTP_HEADER_SIZE);
        assert!(packets[0].header.marker);

        let over = vec![0x42; MAX_PAYLOAD_SIZE + 1];
        let packets = p.packetize(&over);
        assert_eq!(packets.len(), 2);
        // Descriptor plus one payload byte: the tail fragment is non-empty
        assert_eq!(packets[1].payload.len(), 2);
    }

    #[test]
    fn timestamp_advances_by_the_rounded_clock_step() {
        let mut p = packetizer();
        assert_eq!(p.timestamp_step(), 3000);

        let a = p.packetize(&[1, 2, 3]);
        let b = p.packetize(&[4, 5, 6]);
        assert_eq!(
            b[0].header.timestamp.wrapping_sub(a[0].header.timestamp),
            3000
        );

        // Non-divisor rates round to nearest
        let p24 = RtpPacketizer::new(CodecKind::Vp8, 1, 24);
        assert_eq!(p24.timestamp_step(), 3750);
        let p60 = RtpPacketizer::new(CodecKind::Vp8, 1, 60);
        assert_eq!(p60.timestamp_step(), 1500);
    }

    #[test]
    fn sequence_wraps_modulo_2_16() {
        let mut p = packetizer();
        p.sequence = u16::MAX;
        let packets = p.packetize(&[0xAA; 4]);
        assert_eq!(packets[0].header.sequence_number, u16::MAX);
        assert_eq!(p.sequence(), 0);
    }

    #[test]
    fn empty_frame_produces_no_packets() {
        let mut p = packetizer();
        assert!(p.packetize(&[]).is_empty());
    }
}
