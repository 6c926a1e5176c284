/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! RTP transport per RFC 3550: the fixed-header codec, the packetizer that
//! cuts PCM into packets with wrapping sequence/timestamp state, the
//! depacketizer that tracks loss and reordering, and the send/receive
//! sockets.

pub mod receiver;

pub use receiver::RtpReceiver;

use crate::{
    error::{RtpError, RtpResult},
    socket::create_tx_socket,
    utils::{WrappingU16, WrappingU32},
};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use tracing::instrument;

pub const RTP_HEADER_LEN: usize = 12;
pub const RTP_VERSION: u8 = 2;
pub const MAX_PACKET_LEN: usize = 1500;

/// A decoded RTP packet. Padding is stripped on decode and never generated
/// on encode; an extension header is carried opaquely so a decoded packet
/// re-encodes identically.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension: Option<RtpExtension>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    pub profile: u16,
    /// Extension words, a multiple of 4 bytes.
    pub data: Vec<u8>,
}

impl RtpPacket {
    pub fn decode(data: &[u8]) -> RtpResult<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtpError::Truncated {
                expected: RTP_HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::BadVersion(version));
        }
        let padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN;
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            if data.len() < offset + 4 {
                return Err(RtpError::Truncated {
                    expected: offset + 4,
                    actual: data.len(),
                });
            }
            csrc.push(u32::from_be_bytes(
                data[offset..offset + 4].try_into().expect("length checked"),
            ));
            offset += 4;
        }

        let extension = if has_extension {
            if data.len() < offset + 4 {
                return Err(RtpError::Truncated {
                    expected: offset + 4,
                    actual: data.len(),
                });
            }
            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            if data.len() < offset + words * 4 {
                return Err(RtpError::Truncated {
                    expected: offset + words * 4,
                    actual: data.len(),
                });
            }
            let extension_data = data[offset..offset + words * 4].to_vec();
            offset += words * 4;
            Some(RtpExtension {
                profile,
                data: extension_data,
            })
        } else {
            None
        };

        let mut payload_end = data.len();
        if padding {
            let pad = *data.last().expect("length checked") as usize;
            if pad == 0 || payload_end < offset + pad {
                return Err(RtpError::Truncated {
                    expected: offset + pad,
                    actual: payload_end,
                });
            }
            payload_end -= pad;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
            payload: data[offset..payload_end].to_vec(),
        })
    }

    pub fn encode(&self) -> RtpResult<Vec<u8>> {
        let len = self.encoded_len();
        if len > MAX_PACKET_LEN {
            return Err(RtpError::MaxMtuExceeded(len));
        }

        let mut out = Vec::with_capacity(len);
        let extension_bit = if self.extension.is_some() { 0x10 } else { 0 };
        out.push(RTP_VERSION << 6 | extension_bit | (self.csrc.len() as u8 & 0x0f));
        out.push((self.marker as u8) << 7 | (self.payload_type & 0x7f));
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in &self.csrc {
            out.extend_from_slice(&csrc.to_be_bytes());
        }
        if let Some(extension) = &self.extension {
            out.extend_from_slice(&extension.profile.to_be_bytes());
            out.extend_from_slice(&((extension.data.len() / 4) as u16).to_be_bytes());
            out.extend_from_slice(&extension.data);
        }
        out.extend_from_slice(&self.payload);

        Ok(out)
    }

    pub fn encoded_len(&self) -> usize {
        RTP_HEADER_LEN
            + self.csrc.len() * 4
            + self
                .extension
                .as_ref()
                .map(|extension| 4 + extension.data.len())
                .unwrap_or(0)
            + self.payload.len()
    }
}

/// Cuts a PCM byte stream into RTP packets. The SSRC is fixed for the
/// stream's lifetime; sequence number and timestamp advance by one packet
/// and one framecount respectively, wrapping modulo 2^16 / 2^32.
#[derive(Debug)]
pub struct Packetizer {
    ssrc: u32,
    payload_type: u8,
    sequence: WrappingU16,
    timestamp: WrappingU32,
    framecount: u32,
}

impl Packetizer {
    pub fn new(ssrc: u32, payload_type: u8, framecount: u32) -> Self {
        Self {
            ssrc,
            payload_type,
            sequence: WrappingU16::new(rand::random()),
            timestamp: WrappingU32::default(),
            framecount,
        }
    }

    /// Anchors the RTP timestamp, typically to the current media time at
    /// stream start.
    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp.set(timestamp);
    }

    pub fn set_framecount(&mut self, framecount: u32) {
        self.framecount = framecount;
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn next_timestamp(&self) -> u32 {
        self.timestamp.value()
    }

    pub fn next_sequence(&self) -> u16 {
        self.sequence.value()
    }

    /// Builds the next packet for one framecount worth of payload and
    /// advances the stream state.
    pub fn next_packet(&mut self, payload: &[u8]) -> RtpPacket {
        let packet = RtpPacket {
            marker: false,
            payload_type: self.payload_type,
            sequence_number: self.sequence.value(),
            timestamp: self.timestamp.value(),
            ssrc: self.ssrc,
            csrc: Vec::new(),
            extension: None,
            payload: payload.to_vec(),
        };
        self.sequence.increment(1);
        self.timestamp.increment(self.framecount);
        packet
    }
}

/// Sequence tracking for an incoming stream. `update` classifies each packet
/// against the expected wrapping sequence.
#[derive(Debug, Default)]
pub struct Depacketizer {
    sequence: Option<WrappingU16>,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceVerdict {
    /// The next expected packet.
    InSequence,
    /// Newer than expected; `gap` packets were skipped.
    Gap(u16),
    /// Older than the newest packet seen, dropped by the caller.
    Old,
}

impl Depacketizer {
    pub fn update(&mut self, sequence_number: u16) -> SequenceVerdict {
        self.packets_received += 1;
        let Some(sequence) = &mut self.sequence else {
            self.sequence = Some(WrappingU16::new(sequence_number));
            return SequenceVerdict::InSequence;
        };

        match sequence.update(sequence_number) {
            Some(1) => SequenceVerdict::InSequence,
            Some(0) => SequenceVerdict::Old, // Duplicate of the newest packet
            Some(distance) => {
                self.packets_lost += (distance - 1) as u64;
                SequenceVerdict::Gap(distance - 1)
            }
            None => {
                self.packets_rejected += 1;
                SequenceVerdict::Old
            }
        }
    }
}

/// The transmit half of the RTP transport: a multicast-capable UDP socket
/// bound to the outbound interface. `send_to` is synchronous; the packet
/// scheduler paces calls.
pub struct RtpTransmitter {
    socket: UdpSocket,
}

impl RtpTransmitter {
    #[instrument]
    pub fn new(interface_addr: Ipv4Addr, ttl: u32) -> RtpResult<Self> {
        Ok(Self {
            socket: create_tx_socket(interface_addr, ttl)?,
        })
    }

    pub fn send_to(&self, packet: &RtpPacket, destination: SocketAddr) -> RtpResult<usize> {
        let encoded = packet.encode()?;
        Ok(self.socket.send_to(&encoded, destination)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn example_packet() -> RtpPacket {
        RtpPacket {
            marker: true,
            payload_type: 98,
            sequence_number: 0xABCD,
            timestamp: 0xDEADBEEF,
            ssrc: 0x12345678,
            csrc: vec![1, 2],
            extension: None,
            payload: vec![0x11, 0x22, 0x33],
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let packets = [
            example_packet(),
            RtpPacket {
                csrc: Vec::new(),
                marker: false,
                ..example_packet()
            },
            RtpPacket {
                extension: Some(RtpExtension {
                    profile: 0xBEDE,
                    data: vec![0; 8],
                }),
                ..example_packet()
            },
            RtpPacket::default(),
        ];
        for packet in packets {
            let encoded = packet.encode().expect("encode");
            assert_eq!(packet, RtpPacket::decode(&encoded).expect("decode"));
        }
    }

    #[test]
    fn header_layout_is_network_byte_order() {
        let packet = example_packet();
        let encoded = packet.encode().expect("encode");
        assert_eq!(0x82, encoded[0]); // V=2, CC=2
        assert_eq!(0xFA, encoded[1]); // M=1, PT=98
        assert_eq!([0xAB, 0xCD], [encoded[2], encoded[3]]);
        assert_eq!([0xDE, 0xAD, 0xBE, 0xEF], encoded[4..8]);
        assert_eq!([0x12, 0x34, 0x56, 0x78], encoded[8..12]);
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let mut encoded = example_packet().encode().expect("encode");
        encoded[0] = 0x42; // version 1
        assert!(matches!(
            RtpPacket::decode(&encoded),
            Err(RtpError::BadVersion(1))
        ));
    }

    #[test]
    fn decode_strips_padding() {
        let packet = RtpPacket {
            csrc: Vec::new(),
            payload: vec![1, 2, 3, 4],
            ..example_packet()
        };
        let mut encoded = packet.encode().expect("encode");
        encoded[0] |= 0x20;
        encoded.extend_from_slice(&[0, 0, 0, 4]);
        let decoded = RtpPacket::decode(&encoded).expect("decode");
        assert_eq!(vec![1, 2, 3, 4], decoded.payload);
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let packet = RtpPacket {
            payload: vec![0; 1600],
            ..Default::default()
        };
        assert!(matches!(
            packet.encode(),
            Err(RtpError::MaxMtuExceeded(_))
        ));
    }

    #[test]
    fn packetizer_advances_sequence_and_timestamp() {
        let mut packetizer = Packetizer::new(0x1234, 98, 48);
        packetizer.set_timestamp(1000);
        let first = packetizer.next_packet(&[0; 288]);
        let second = packetizer.next_packet(&[0; 288]);
        assert_eq!(first.sequence_number.wrapping_add(1), second.sequence_number);
        assert_eq!(first.timestamp + 48, second.timestamp);
        assert_eq!(first.ssrc, second.ssrc);
    }

    #[test]
    fn timestamp_wraps_at_2_to_the_32() {
        let mut packetizer = Packetizer::new(1, 98, 48);
        packetizer.set_timestamp(0xFFFF_FFF0);
        let mut last = 0;
        for _ in 0..7 {
            last = packetizer.next_packet(&[]).timestamp;
        }
        // The 7th packet is 6 framecounts past the anchor, modulo 2^32
        assert_eq!(0xFFFF_FFF0u32.wrapping_add(6 * 48), last);
        assert_eq!(0xD0, last);
    }

    #[test]
    fn sequence_wraps_at_2_to_the_16() {
        let mut packetizer = Packetizer::new(1, 98, 48);
        packetizer.sequence = WrappingU16::new(65_530);
        for _ in 0..10 {
            packetizer.next_packet(&[]);
        }
        assert_eq!(4, packetizer.next_sequence());
    }

    #[test]
    fn depacketizer_classifies_sequences() {
        let mut depacketizer = Depacketizer::default();
        assert_eq!(SequenceVerdict::InSequence, depacketizer.update(100));
        assert_eq!(SequenceVerdict::InSequence, depacketizer.update(101));
        assert_eq!(SequenceVerdict::Gap(2), depacketizer.update(104));
        assert_eq!(SequenceVerdict::Old, depacketizer.update(103));
        assert_eq!(2, depacketizer.packets_lost);
        assert_eq!(1, depacketizer.packets_rejected);
    }
}
