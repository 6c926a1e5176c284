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

//! PTP message codec per IEEE 1588-2008 clause 13. All fields are big
//! endian; the common header is 34 bytes, timestamps are 6-byte seconds plus
//! 4-byte nanoseconds.

use super::types::{ClockIdentity, ClockQuality, PortIdentity, PtpTimeInterval, PtpTimestamp};
use crate::error::{PtpError, PtpResult};

pub const HEADER_LEN: usize = 34;
pub const TIMESTAMP_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtpMessageType {
    Sync,
    DelayReq,
    PdelayReq,
    PdelayResp,
    FollowUp,
    DelayResp,
    PdelayRespFollowUp,
    Announce,
    Signaling,
    Management,
}

impl PtpMessageType {
    pub fn from_nibble(value: u8) -> PtpResult<Self> {
        match value {
            0x0 => Ok(PtpMessageType::Sync),
            0x1 => Ok(PtpMessageType::DelayReq),
            0x2 => Ok(PtpMessageType::PdelayReq),
            0x3 => Ok(PtpMessageType::PdelayResp),
            0x8 => Ok(PtpMessageType::FollowUp),
            0x9 => Ok(PtpMessageType::DelayResp),
            0xA => Ok(PtpMessageType::PdelayRespFollowUp),
            0xB => Ok(PtpMessageType::Announce),
            0xC => Ok(PtpMessageType::Signaling),
            0xD => Ok(PtpMessageType::Management),
            other => Err(PtpError::UnknownMessageType(other)),
        }
    }

    pub fn to_nibble(self) -> u8 {
        match self {
            PtpMessageType::Sync => 0x0,
            PtpMessageType::DelayReq => 0x1,
            PtpMessageType::PdelayReq => 0x2,
            PtpMessageType::PdelayResp => 0x3,
            PtpMessageType::FollowUp => 0x8,
            PtpMessageType::DelayResp => 0x9,
            PtpMessageType::PdelayRespFollowUp => 0xA,
            PtpMessageType::Announce => 0xB,
            PtpMessageType::Signaling => 0xC,
            PtpMessageType::Management => 0xD,
        }
    }

    /// Event messages are timestamped on ingress/egress and travel on UDP
    /// port 319; general messages travel on port 320.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            PtpMessageType::Sync
                | PtpMessageType::DelayReq
                | PtpMessageType::PdelayReq
                | PtpMessageType::PdelayResp
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpVersion {
    pub major: u8,
    pub minor: u8,
}

impl Default for PtpVersion {
    fn default() -> Self {
        Self { major: 2, minor: 0 }
    }
}

/// The two flag octets of the common header. Octet 0 carries the transport
/// flags, octet 1 the timescale flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagField {
    pub alternate_master: bool,
    pub two_step: bool,
    pub unicast: bool,
    pub profile_specific_1: bool,
    pub profile_specific_2: bool,
    pub leap61: bool,
    pub leap59: bool,
    pub current_utc_offset_valid: bool,
    pub ptp_timescale: bool,
    pub time_traceable: bool,
    pub frequency_traceable: bool,
    pub synchronization_uncertain: bool,
}

impl FlagField {
    pub fn from_octets(octet0: u8, octet1: u8) -> Self {
        Self {
            alternate_master: octet0 & 0x01 != 0,
            two_step: octet0 & 0x02 != 0,
            unicast: octet0 & 0x04 != 0,
            profile_specific_1: octet0 & 0x20 != 0,
            profile_specific_2: octet0 & 0x40 != 0,
            leap61: octet1 & 0x01 != 0,
            leap59: octet1 & 0x02 != 0,
            current_utc_offset_valid: octet1 & 0x04 != 0,
            ptp_timescale: octet1 & 0x08 != 0,
            time_traceable: octet1 & 0x10 != 0,
            frequency_traceable: octet1 & 0x20 != 0,
            synchronization_uncertain: octet1 & 0x40 != 0,
        }
    }

    /// Packs to `octet0 << 8 | octet1`. Reserved bits stay zero.
    pub fn to_octets(self) -> u16 {
        let mut octet0 = 0u8;
        let mut octet1 = 0u8;
        if self.alternate_master {
            octet0 |= 0x01;
        }
        if self.two_step {
            octet0 |= 0x02;
        }
        if self.unicast {
            octet0 |= 0x04;
        }
        if self.profile_specific_1 {
            octet0 |= 0x20;
        }
        if self.profile_specific_2 {
            octet0 |= 0x40;
        }
        if self.leap61 {
            octet1 |= 0x01;
        }
        if self.leap59 {
            octet1 |= 0x02;
        }
        if self.current_utc_offset_valid {
            octet1 |= 0x04;
        }
        if self.ptp_timescale {
            octet1 |= 0x08;
        }
        if self.time_traceable {
            octet1 |= 0x10;
        }
        if self.frequency_traceable {
            octet1 |= 0x20;
        }
        if self.synchronization_uncertain {
            octet1 |= 0x40;
        }
        (octet0 as u16) << 8 | octet1 as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpMessageHeader {
    /// 12-bit sdoId, majorSdoId in the high nibble of byte 0, minorSdoId in
    /// byte 5.
    pub sdo_id: u16,
    pub message_type: PtpMessageType,
    pub version: PtpVersion,
    pub message_length: u16,
    pub domain_number: u8,
    pub flags: FlagField,
    pub correction_field: PtpTimeInterval,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub control_field: u8,
    pub log_message_interval: i8,
}

impl Default for PtpMessageHeader {
    fn default() -> Self {
        Self {
            sdo_id: 0,
            message_type: PtpMessageType::Announce,
            version: PtpVersion::default(),
            message_length: 0,
            domain_number: 0,
            flags: FlagField::default(),
            correction_field: PtpTimeInterval::default(),
            source_port_identity: PortIdentity::default(),
            sequence_id: 0,
            control_field: 0,
            log_message_interval: 0,
        }
    }
}

impl PtpMessageHeader {
    pub fn from_data(data: &[u8]) -> PtpResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(PtpError::Truncated {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let message_type = PtpMessageType::from_nibble(data[0] & 0x0f)?;
        let major_sdo_id = (data[0] >> 4) as u16;
        let version = PtpVersion {
            major: data[1] & 0x0f,
            minor: data[1] >> 4,
        };
        if version.major != 2 {
            return Err(PtpError::BadVersion(version.major));
        }

        let message_length = u16::from_be_bytes([data[2], data[3]]);
        let domain_number = data[4];
        let minor_sdo_id = data[5] as u16;
        let flags = FlagField::from_octets(data[6], data[7]);
        let correction_field = PtpTimeInterval::from_wire_format(i64::from_be_bytes(
            data[8..16].try_into().expect("slice length checked"),
        ));
        // bytes 16..20 are messageTypeSpecific and are not interpreted
        let mut clock_identity = [0u8; 8];
        clock_identity.copy_from_slice(&data[20..28]);
        let source_port_identity = PortIdentity {
            clock_identity: ClockIdentity(clock_identity),
            port_number: u16::from_be_bytes([data[28], data[29]]),
        };
        let sequence_id = u16::from_be_bytes([data[30], data[31]]);
        let control_field = data[32];
        let log_message_interval = data[33] as i8;

        Ok(Self {
            sdo_id: major_sdo_id << 8 | minor_sdo_id,
            message_type,
            version,
            message_length,
            domain_number,
            flags,
            correction_field,
            source_port_identity,
            sequence_id,
            control_field,
            log_message_interval,
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        let major_sdo_id = ((self.sdo_id >> 8) & 0x0f) as u8;
        let minor_sdo_id = (self.sdo_id & 0xff) as u8;
        out.push(major_sdo_id << 4 | self.message_type.to_nibble());
        out.push(self.version.minor << 4 | (self.version.major & 0x0f));
        out.extend_from_slice(&self.message_length.to_be_bytes());
        out.push(self.domain_number);
        out.push(minor_sdo_id);
        out.extend_from_slice(&self.flags.to_octets().to_be_bytes());
        out.extend_from_slice(&self.correction_field.to_wire_format_saturating().to_be_bytes());
        out.extend_from_slice(&[0u8; 4]); // messageTypeSpecific
        out.extend_from_slice(&self.source_port_identity.clock_identity.0);
        out.extend_from_slice(&self.source_port_identity.port_number.to_be_bytes());
        out.extend_from_slice(&self.sequence_id.to_be_bytes());
        out.push(self.control_field);
        out.push(self.log_message_interval as u8);
    }
}

fn read_timestamp(data: &[u8]) -> PtpResult<PtpTimestamp> {
    if data.len() < TIMESTAMP_LEN {
        return Err(PtpError::Truncated {
            expected: TIMESTAMP_LEN,
            actual: data.len(),
        });
    }
    let seconds = (data[0] as u64) << 40
        | (data[1] as u64) << 32
        | (data[2] as u64) << 24
        | (data[3] as u64) << 16
        | (data[4] as u64) << 8
        | data[5] as u64;
    let nanos = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
    Ok(PtpTimestamp::new(seconds, nanos))
}

fn write_timestamp(ts: &PtpTimestamp, out: &mut Vec<u8>) {
    let seconds = ts.seconds.to_be_bytes();
    out.extend_from_slice(&seconds[2..8]);
    out.extend_from_slice(&ts.nanos.to_be_bytes());
}

fn read_port_identity(data: &[u8]) -> PtpResult<PortIdentity> {
    if data.len() < 10 {
        return Err(PtpError::Truncated {
            expected: 10,
            actual: data.len(),
        });
    }
    let mut clock_identity = [0u8; 8];
    clock_identity.copy_from_slice(&data[0..8]);
    Ok(PortIdentity {
        clock_identity: ClockIdentity(clock_identity),
        port_number: u16::from_be_bytes([data[8], data[9]]),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceMessage {
    pub origin_timestamp: PtpTimestamp,
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: u8,
}

impl AnnounceMessage {
    pub const BODY_LEN: usize = 30;

    pub fn from_data(data: &[u8]) -> PtpResult<Self> {
        if data.len() < Self::BODY_LEN {
            return Err(PtpError::Truncated {
                expected: Self::BODY_LEN,
                actual: data.len(),
            });
        }
        let origin_timestamp = read_timestamp(data)?;
        let current_utc_offset = i16::from_be_bytes([data[10], data[11]]);
        // data[12] is reserved
        let grandmaster_priority1 = data[13];
        let grandmaster_clock_quality = ClockQuality {
            clock_class: data[14],
            clock_accuracy: data[15],
            offset_scaled_log_variance: u16::from_be_bytes([data[16], data[17]]),
        };
        let grandmaster_priority2 = data[18];
        let mut gm = [0u8; 8];
        gm.copy_from_slice(&data[19..27]);
        let steps_removed = u16::from_be_bytes([data[27], data[28]]);
        let time_source = data[29];

        Ok(Self {
            origin_timestamp,
            current_utc_offset,
            grandmaster_priority1,
            grandmaster_clock_quality,
            grandmaster_priority2,
            grandmaster_identity: ClockIdentity(gm),
            steps_removed,
            time_source,
        })
    }
}

/// Sync, Delay_Req, Follow_Up and Delay_Resp all carry a single timestamp;
/// Delay_Resp and the Pdelay responses additionally name the requesting port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampMessage {
    pub timestamp: PtpTimestamp,
}

impl TimestampMessage {
    pub fn from_data(data: &[u8]) -> PtpResult<Self> {
        Ok(Self {
            timestamp: read_timestamp(data)?,
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_timestamp(&self.timestamp, out);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortTimestampMessage {
    pub timestamp: PtpTimestamp,
    pub requesting_port_identity: PortIdentity,
}

impl PortTimestampMessage {
    pub const BODY_LEN: usize = 20;

    pub fn from_data(data: &[u8]) -> PtpResult<Self> {
        if data.len() < Self::BODY_LEN {
            return Err(PtpError::Truncated {
                expected: Self::BODY_LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            timestamp: read_timestamp(data)?,
            requesting_port_identity: read_port_identity(&data[10..])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtpMessage {
    Sync(TimestampMessage),
    DelayReq(TimestampMessage),
    PdelayReq(TimestampMessage),
    PdelayResp(PortTimestampMessage),
    FollowUp(TimestampMessage),
    DelayResp(PortTimestampMessage),
    PdelayRespFollowUp(PortTimestampMessage),
    Announce(AnnounceMessage),
    Signaling,
    Management,
}

impl PtpMessage {
    /// Decodes a datagram into header and message. The header length field
    /// is validated against the actual datagram size.
    pub fn parse(data: &[u8]) -> PtpResult<(PtpMessageHeader, PtpMessage)> {
        let header = PtpMessageHeader::from_data(data)?;
        if data.len() < header.message_length as usize {
            return Err(PtpError::Truncated {
                expected: header.message_length as usize,
                actual: data.len(),
            });
        }
        let body = &data[HEADER_LEN..];
        let message = match header.message_type {
            PtpMessageType::Sync => PtpMessage::Sync(TimestampMessage::from_data(body)?),
            PtpMessageType::DelayReq => PtpMessage::DelayReq(TimestampMessage::from_data(body)?),
            PtpMessageType::PdelayReq => PtpMessage::PdelayReq(TimestampMessage::from_data(body)?),
            PtpMessageType::PdelayResp => {
                PtpMessage::PdelayResp(PortTimestampMessage::from_data(body)?)
            }
            PtpMessageType::FollowUp => PtpMessage::FollowUp(TimestampMessage::from_data(body)?),
            PtpMessageType::DelayResp => {
                PtpMessage::DelayResp(PortTimestampMessage::from_data(body)?)
            }
            PtpMessageType::PdelayRespFollowUp => {
                PtpMessage::PdelayRespFollowUp(PortTimestampMessage::from_data(body)?)
            }
            PtpMessageType::Announce => PtpMessage::Announce(AnnounceMessage::from_data(body)?),
            PtpMessageType::Signaling => PtpMessage::Signaling,
            PtpMessageType::Management => PtpMessage::Management,
        };
        Ok((header, message))
    }
}

/// Encodes a Delay_Req message. The only message a slave-only clock sends.
pub fn encode_delay_req(
    domain_number: u8,
    source_port_identity: PortIdentity,
    sequence_id: u16,
) -> Vec<u8> {
    let header = PtpMessageHeader {
        message_type: PtpMessageType::DelayReq,
        message_length: (HEADER_LEN + TIMESTAMP_LEN) as u16,
        domain_number,
        source_port_identity,
        sequence_id,
        control_field: 0x01,
        log_message_interval: 0x7f,
        ..Default::default()
    };
    let mut out = Vec::with_capacity(HEADER_LEN + TIMESTAMP_LEN);
    header.write_to(&mut out);
    // originTimestamp is zero; the master timestamps on ingress
    write_timestamp(&PtpTimestamp::default(), &mut out);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn management_header_data() -> [u8; 34] {
        [
            0xfd, // majorSdoId & messageType
            0x12, // minorVersionPTP & versionPTP
            0x01, 0x2c, // messageLength (300)
            0x01, // domainNumber
            0x22, // minorSdoId
            0x00, 0xff, // flags
            0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x80, 0x00, // correctionField
            0x12, 0x34, 0x56, 0x78, // message type specific (ignored)
            0x12, 0x34, 0x56, 0x78, 0x00, 0x02, 0x80, 0x00, // clockIdentity
            0xab, 0xcd, // portNumber
            0x11, 0x22, // sequenceId
            0xff, // controlField (ignored)
            0x81, // logMessageInterval
        ]
    }

    #[test]
    fn header_unpacks_from_data() {
        let header = PtpMessageHeader::from_data(&management_header_data()).expect("header");

        assert_eq!(0xf22, header.sdo_id);
        assert_eq!(PtpMessageType::Management, header.message_type);
        assert_eq!(2, header.version.major);
        assert_eq!(1, header.version.minor);
        assert_eq!(300, header.message_length);
        assert_eq!(1, header.domain_number);

        assert!(!header.flags.alternate_master);
        assert!(!header.flags.two_step);
        assert!(!header.flags.unicast);
        assert!(header.flags.leap61);
        assert!(header.flags.leap59);
        assert!(header.flags.current_utc_offset_valid);
        assert!(header.flags.ptp_timescale);
        assert!(header.flags.time_traceable);
        assert!(header.flags.frequency_traceable);
        assert!(header.flags.synchronization_uncertain);

        assert_eq!(
            0x28000,
            header.correction_field.to_wire_format().expect("wire")
        );
        assert_eq!(
            ClockIdentity([0x12, 0x34, 0x56, 0x78, 0x00, 0x02, 0x80, 0x00]),
            header.source_port_identity.clock_identity
        );
        assert_eq!(0xabcd, header.source_port_identity.port_number);
        assert_eq!(0x1122, header.sequence_id);
        assert_eq!(-127, header.log_message_interval);
    }

    #[test]
    fn header_packs_to_wire() {
        let header = PtpMessageHeader {
            sdo_id: 0xf22,
            message_type: PtpMessageType::Management,
            version: PtpVersion { major: 2, minor: 1 },
            message_length: 300,
            domain_number: 1,
            correction_field: PtpTimeInterval::from_wire_format(0x28000),
            source_port_identity: PortIdentity {
                clock_identity: ClockIdentity([0x12, 0x34, 0x56, 0x78, 0x00, 0x02, 0x80, 0x00]),
                port_number: 0xabcd,
            },
            sequence_id: 0x1122,
            log_message_interval: -127,
            ..Default::default()
        };

        let mut out = Vec::new();
        header.write_to(&mut out);

        assert_eq!(HEADER_LEN, out.len());
        assert_eq!(0xfd, out[0]);
        assert_eq!(0x12, out[1]);
        assert_eq!(300, u16::from_be_bytes([out[2], out[3]]));
        assert_eq!(1, out[4]);
        assert_eq!(0x22, out[5]);
        assert_eq!(0x00, u16::from_be_bytes([out[6], out[7]]));
        assert_eq!(
            0x28000,
            i64::from_be_bytes(out[8..16].try_into().expect("len"))
        );
        assert_eq!(0x1122, u16::from_be_bytes([out[30], out[31]]));
        assert_eq!(-127, out[33] as i8);
    }

    #[test]
    fn all_flags_set_pack_to_67_7f() {
        let flags = FlagField {
            alternate_master: true,
            two_step: true,
            unicast: true,
            profile_specific_1: true,
            profile_specific_2: true,
            leap61: true,
            leap59: true,
            current_utc_offset_valid: true,
            ptp_timescale: true,
            time_traceable: true,
            frequency_traceable: true,
            synchronization_uncertain: true,
        };
        assert_eq!(0x677F, flags.to_octets());
        let [octet0, octet1] = flags.to_octets().to_be_bytes();
        assert_eq!(0x67, octet0);
        assert_eq!(0x7F, octet1);
    }

    #[test]
    fn flag_octets_roundtrip() {
        for octet0 in [0x00u8, 0x01, 0x02, 0x04, 0x20, 0x40, 0x67] {
            for octet1 in [0x00u8, 0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x7F] {
                let flags = FlagField::from_octets(octet0, octet1);
                assert_eq!((octet0 as u16) << 8 | octet1 as u16, flags.to_octets());
            }
        }
    }

    #[test]
    fn announce_unpacks_from_data() {
        let data: [u8; 30] = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // origin_timestamp.seconds
            0x07, 0x08, 0x09, 0x0a, // origin_timestamp.nanoseconds
            0x0b, 0x0c, // current_utc_offset
            0x00, // reserved
            0x0d, // grandmaster_priority1
            0x0e, 0x20, 0x10, 0x11, // grandmaster_clock_quality
            0x12, // grandmaster_priority2
            0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, // grandmaster_identity
            0x1b, 0x1c, // steps_removed
            0x40, // time source
        ];

        let announce = AnnounceMessage::from_data(&data).expect("announce");
        assert_eq!(0x010203040506, announce.origin_timestamp.seconds);
        assert_eq!(0x0708090a, announce.origin_timestamp.nanos);
        assert_eq!(0x0b0c, announce.current_utc_offset);
        assert_eq!(0x0d, announce.grandmaster_priority1);
        assert_eq!(0x0e, announce.grandmaster_clock_quality.clock_class);
        assert_eq!(0x20, announce.grandmaster_clock_quality.clock_accuracy);
        assert_eq!(
            0x1011,
            announce.grandmaster_clock_quality.offset_scaled_log_variance
        );
        assert_eq!(0x12, announce.grandmaster_priority2);
        assert_eq!(
            ClockIdentity([0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a]),
            announce.grandmaster_identity
        );
        assert_eq!(0x1b1c, announce.steps_removed);
        assert_eq!(0x40, announce.time_source);
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut data = management_header_data();
        data[1] = 0x13;
        assert!(matches!(
            PtpMessageHeader::from_data(&data),
            Err(PtpError::BadVersion(3))
        ));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let data = management_header_data();
        assert!(matches!(
            PtpMessageHeader::from_data(&data[..20]),
            Err(PtpError::Truncated { .. })
        ));
    }

    #[test]
    fn delay_req_roundtrips_through_parser() {
        let port = PortIdentity {
            clock_identity: ClockIdentity([1, 2, 3, 4, 5, 6, 7, 8]),
            port_number: 1,
        };
        let encoded = encode_delay_req(5, port, 42);
        assert_eq!(HEADER_LEN + TIMESTAMP_LEN, encoded.len());
        let (header, message) = PtpMessage::parse(&encoded).expect("parse");
        assert_eq!(PtpMessageType::DelayReq, header.message_type);
        assert_eq!(5, header.domain_number);
        assert_eq!(42, header.sequence_id);
        assert_eq!(port, header.source_port_identity);
        assert_eq!(
            PtpMessage::DelayReq(TimestampMessage {
                timestamp: PtpTimestamp::default()
            }),
            message
        );
    }
}
