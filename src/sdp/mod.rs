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

//! Session description per RFC 4566, restricted to the audio profile this
//! toolkit speaks: linear PCM over RTP/AVP with the RFC 7273 clock
//! attributes. Unknown attributes are preserved on parse and ignored by all
//! logic. Serialization is canonical, so `parse(serialize(s)) == s` for any
//! session this crate produces.

pub mod attributes;

pub use attributes::{
    ClockDomain, FilterMode, GroupDup, MediaClockSource, PtpVersion, ReferenceClock, SourceFilter,
};

use crate::{
    error::{SdpError, SdpResult},
    formats::{AudioEncoding, AudioFormat},
};
use std::{fmt::Write, str::FromStr};

pub const DEFAULT_PAYLOAD_TYPE: u8 = 98;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: u64,
    pub address_type: String,
    pub unicast_address: String,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            username: "-".to_owned(),
            session_id: "0".to_owned(),
            session_version: 0,
            address_type: "IP4".to_owned(),
            unicast_address: "0.0.0.0".to_owned(),
        }
    }
}

impl Origin {
    fn parse(value: &str, line: usize) -> SdpResult<Self> {
        let parts: Vec<&str> = value.split(' ').collect();
        if parts.len() != 6 {
            return Err(SdpError::parse(line, "origin: expected 6 fields"));
        }
        if parts[3] != "IN" {
            return Err(SdpError::parse(line, "origin: unsupported nettype"));
        }
        Ok(Self {
            username: parts[0].to_owned(),
            session_id: parts[1].to_owned(),
            session_version: parts[2]
                .parse()
                .map_err(|_| SdpError::parse(line, "origin: invalid session version"))?,
            address_type: parts[4].to_owned(),
            unicast_address: parts[5].to_owned(),
        })
    }

    fn encode(&self, out: &mut String) {
        write!(
            out,
            "o={} {} {} IN {} {}\r\n",
            self.username,
            self.session_id,
            self.session_version,
            self.address_type,
            self.unicast_address
        )
        .ok();
    }
}

/// Connection info with the multicast TTL / address count suffixes. For IPv6
/// only the address count is permitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub address_type: String,
    pub address: String,
    pub ttl: Option<u8>,
    pub number_of_addresses: Option<u32>,
}

impl ConnectionInfo {
    pub fn ipv4_multicast(address: impl Into<String>, ttl: u8) -> Self {
        Self {
            address_type: "IP4".to_owned(),
            address: address.into(),
            ttl: Some(ttl),
            number_of_addresses: None,
        }
    }

    fn parse(value: &str, line: usize) -> SdpResult<Self> {
        let parts: Vec<&str> = value.split(' ').collect();
        if parts.len() != 3 {
            return Err(SdpError::parse(line, "connection: expected 3 fields"));
        }
        if parts[0] != "IN" {
            return Err(SdpError::parse(line, "connection: unsupported nettype"));
        }
        let address_type = parts[1];
        if address_type != "IP4" && address_type != "IP6" {
            return Err(SdpError::parse(line, "connection: unsupported addrtype"));
        }

        let mut split = parts[2].split('/');
        let address = split
            .next()
            .ok_or_else(|| SdpError::parse(line, "connection: missing address"))?
            .to_owned();
        let first = split
            .next()
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|_| SdpError::parse(line, "connection: invalid suffix"))
            })
            .transpose()?;
        let second = split
            .next()
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|_| SdpError::parse(line, "connection: invalid suffix"))
            })
            .transpose()?;
        if split.next().is_some() {
            return Err(SdpError::parse(line, "connection: too many suffixes"));
        }

        let (ttl, number_of_addresses) = match (address_type, first, second) {
            ("IP4", ttl, count) => (ttl.map(|t| t as u8), count),
            ("IP6", None, None) => (None, None),
            ("IP6", Some(count), None) => (None, Some(count)),
            ("IP6", Some(_), Some(_)) => {
                return Err(SdpError::parse(line, "connection: IPv6 does not carry a TTL"));
            }
            _ => (None, None),
        };

        Ok(Self {
            address_type: address_type.to_owned(),
            address,
            ttl,
            number_of_addresses,
        })
    }

    fn encode(&self, out: &mut String) {
        write!(out, "c=IN {} {}", self.address_type, self.address).ok();
        if let Some(ttl) = self.ttl {
            write!(out, "/{ttl}").ok();
        }
        if let Some(count) = self.number_of_addresses {
            write!(out, "/{count}").ok();
        }
        out.push_str("\r\n");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeActive {
    pub start_time: u64,
    pub stop_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    RecvOnly,
    SendOnly,
    SendRecv,
}

impl Direction {
    fn name(&self) -> &'static str {
        match self {
            Direction::RecvOnly => "recvonly",
            Direction::SendOnly => "sendonly",
            Direction::SendRecv => "sendrecv",
        }
    }
}

/// One RTP payload format of a media section. A format with no rtpmap
/// carries only its payload type number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdpFormat {
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
    pub num_channels: u32,
}

impl SdpFormat {
    pub fn from_audio_format(format: &AudioFormat, payload_type: u8) -> SdpResult<Self> {
        let encoding_name = format
            .encoding
            .encoding_name()
            .map_err(|_| SdpError::UnsupportedEncoding(format!("{:?}", format.encoding)))?;
        Ok(Self {
            payload_type,
            encoding_name: encoding_name.to_owned(),
            clock_rate: format.sample_rate as u32,
            num_channels: format.num_channels as u32,
        })
    }

    /// The audio format this rtpmap describes. The encoding-name table is
    /// fixed: L8, L16, L24 and L32 map onto the linear PCM widths.
    pub fn to_audio_format(&self) -> SdpResult<AudioFormat> {
        let encoding = AudioEncoding::from_str(&self.encoding_name)
            .map_err(|_| SdpError::UnsupportedEncoding(self.encoding_name.clone()))?;
        Ok(AudioFormat::new(
            encoding,
            self.clock_rate as usize,
            self.num_channels.max(1) as usize,
        ))
    }

    fn parse_rtpmap(&mut self, value: &str, line: usize) -> SdpResult<()> {
        let mut parts = value.split('/');
        let encoding_name = parts
            .next()
            .ok_or_else(|| SdpError::parse(line, "rtpmap: missing encoding name"))?;
        let clock_rate = parts
            .next()
            .ok_or_else(|| SdpError::parse(line, "rtpmap: missing clock rate"))?
            .parse()
            .map_err(|_| SdpError::parse(line, "rtpmap: invalid clock rate"))?;
        let num_channels = match parts.next() {
            Some(channels) => channels
                .parse()
                .map_err(|_| SdpError::parse(line, "rtpmap: invalid channel count"))?,
            None => 1,
        };

        self.encoding_name = encoding_name.to_owned();
        self.clock_rate = clock_rate;
        self.num_channels = num_channels;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaDescription {
    pub media_type: String,
    pub port: u16,
    pub number_of_ports: u32,
    pub protocol: String,
    pub formats: Vec<SdpFormat>,
    pub connection_info: Option<ConnectionInfo>,
    pub direction: Option<Direction>,
    pub ptime: Option<f32>,
    pub max_ptime: Option<f32>,
    pub framecount: Option<u32>,
    pub source_filter: Option<SourceFilter>,
    pub clock_domain: Option<ClockDomain>,
    pub reference_clock: Option<ReferenceClock>,
    pub media_clock: Option<MediaClockSource>,
    pub sync_time: Option<u32>,
    pub unknown_attributes: Vec<String>,
}

impl MediaDescription {
    pub fn audio(port: u16) -> Self {
        Self {
            media_type: "audio".to_owned(),
            port,
            number_of_ports: 1,
            protocol: "RTP/AVP".to_owned(),
            ..Default::default()
        }
    }

    /// Parses an `m=` line into a fresh media section.
    fn parse(value: &str, line: usize) -> SdpResult<Self> {
        let parts: Vec<&str> = value.split(' ').collect();
        if parts.len() < 4 {
            return Err(SdpError::parse(line, "media: expected at least 4 fields"));
        }

        let (port, number_of_ports) = match parts[1].split_once('/') {
            Some((port, count)) => (
                port.parse()
                    .map_err(|_| SdpError::parse(line, "media: invalid port"))?,
                count
                    .parse()
                    .map_err(|_| SdpError::parse(line, "media: invalid port count"))?,
            ),
            None => (
                parts[1]
                    .parse()
                    .map_err(|_| SdpError::parse(line, "media: invalid port"))?,
                1,
            ),
        };

        let mut formats = Vec::new();
        for part in &parts[3..] {
            let payload_type: u8 = part
                .parse()
                .map_err(|_| SdpError::parse(line, "media: invalid payload type"))?;
            if payload_type > 127 {
                return Err(SdpError::parse(line, "media: payload type exceeds 127"));
            }
            formats.push(SdpFormat {
                payload_type,
                ..Default::default()
            });
        }

        Ok(Self {
            media_type: parts[0].to_owned(),
            port,
            number_of_ports,
            protocol: parts[2].to_owned(),
            formats,
            ..Default::default()
        })
    }

    fn parse_attribute(&mut self, value: &str, line: usize) -> SdpResult<()> {
        if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
            let (payload_type, mapping) = rtpmap
                .split_once(' ')
                .ok_or_else(|| SdpError::parse(line, "rtpmap: missing payload type"))?;
            let payload_type: u8 = payload_type
                .parse()
                .map_err(|_| SdpError::parse(line, "rtpmap: invalid payload type"))?;
            match self
                .formats
                .iter_mut()
                .find(|format| format.payload_type == payload_type)
            {
                Some(format) => format.parse_rtpmap(mapping, line)?,
                None => {
                    return Err(SdpError::parse(
                        line,
                        format!("rtpmap: unknown payload type {payload_type}"),
                    ));
                }
            }
        } else if let Some(ptime) = value.strip_prefix("ptime:") {
            self.ptime = Some(
                ptime
                    .parse()
                    .map_err(|_| SdpError::parse(line, "ptime: invalid value"))?,
            );
        } else if let Some(max_ptime) = value.strip_prefix("maxptime:") {
            self.max_ptime = Some(
                max_ptime
                    .parse()
                    .map_err(|_| SdpError::parse(line, "maxptime: invalid value"))?,
            );
        } else if let Some(framecount) = value.strip_prefix("framecount:") {
            self.framecount = Some(
                framecount
                    .parse()
                    .map_err(|_| SdpError::parse(line, "framecount: invalid value"))?,
            );
        } else if let Some(filter) = value.strip_prefix("source-filter:") {
            self.source_filter = Some(SourceFilter::parse(filter)?);
        } else if let Some(domain) = value.strip_prefix("clock-domain:") {
            self.clock_domain = Some(ClockDomain::parse(domain)?);
        } else if let Some(refclk) = value.strip_prefix("ts-refclk:") {
            self.reference_clock = Some(ReferenceClock::parse(refclk)?);
        } else if let Some(mediaclk) = value.strip_prefix("mediaclk:") {
            self.media_clock = Some(MediaClockSource::parse(mediaclk)?);
        } else if let Some(sync_time) = value.strip_prefix("sync-time:") {
            self.sync_time = Some(
                sync_time
                    .parse()
                    .map_err(|_| SdpError::parse(line, "sync-time: invalid value"))?,
            );
        } else if value == "recvonly" {
            self.direction = Some(Direction::RecvOnly);
        } else if value == "sendonly" {
            self.direction = Some(Direction::SendOnly);
        } else if value == "sendrecv" {
            self.direction = Some(Direction::SendRecv);
        } else {
            self.unknown_attributes.push(value.to_owned());
        }
        Ok(())
    }

    fn encode(&self, out: &mut String) {
        write!(out, "m={} {}", self.media_type, self.port).ok();
        if self.number_of_ports > 1 {
            write!(out, "/{}", self.number_of_ports).ok();
        }
        write!(out, " {}", self.protocol).ok();
        for format in &self.formats {
            write!(out, " {}", format.payload_type).ok();
        }
        out.push_str("\r\n");

        if let Some(connection_info) = &self.connection_info {
            connection_info.encode(out);
        }
        for format in &self.formats {
            if format.encoding_name.is_empty() {
                continue;
            }
            write!(
                out,
                "a=rtpmap:{} {}/{}",
                format.payload_type, format.encoding_name, format.clock_rate
            )
            .ok();
            if format.num_channels != 1 {
                write!(out, "/{}", format.num_channels).ok();
            }
            out.push_str("\r\n");
        }
        if let Some(filter) = &self.source_filter {
            write!(out, "a={filter}\r\n").ok();
        }
        if let Some(domain) = &self.clock_domain {
            write!(out, "a={domain}\r\n").ok();
        }
        if let Some(sync_time) = self.sync_time {
            write!(out, "a=sync-time:{sync_time}\r\n").ok();
        }
        if let Some(reference_clock) = &self.reference_clock {
            write!(out, "a={reference_clock}\r\n").ok();
        }
        if let Some(media_clock) = &self.media_clock {
            write!(out, "a={media_clock}\r\n").ok();
        }
        if let Some(direction) = self.direction {
            write!(out, "a={}\r\n", direction.name()).ok();
        }
        if let Some(ptime) = self.ptime {
            write!(out, "a=ptime:{ptime}\r\n").ok();
        }
        if let Some(max_ptime) = self.max_ptime {
            write!(out, "a=maxptime:{max_ptime}\r\n").ok();
        }
        if let Some(framecount) = self.framecount {
            write!(out, "a=framecount:{framecount}\r\n").ok();
        }
        for attribute in &self.unknown_attributes {
            write!(out, "a={attribute}\r\n").ok();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionDescription {
    pub origin: Origin,
    pub session_name: String,
    pub connection_info: Option<ConnectionInfo>,
    pub time_active: TimeActive,
    pub reference_clock: Option<ReferenceClock>,
    pub media_clock: Option<MediaClockSource>,
    pub clock_domain: Option<ClockDomain>,
    pub groups: Vec<GroupDup>,
    pub unknown_attributes: Vec<String>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(input: &str) -> SdpResult<Self> {
        let mut session = Self::default();
        let mut seen_version = false;

        for (index, raw_line) in input.lines().enumerate() {
            let line_number = index + 1;
            let line = raw_line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            let (kind, value) = line
                .split_once('=')
                .ok_or_else(|| SdpError::parse(line_number, "expected <type>=<value>"))?;

            match kind {
                "v" => {
                    if value != "0" {
                        return Err(SdpError::parse(line_number, "unsupported SDP version"));
                    }
                    seen_version = true;
                }
                "o" => session.origin = Origin::parse(value, line_number)?,
                "s" => session.session_name = value.to_owned(),
                "c" => {
                    let connection = ConnectionInfo::parse(value, line_number)?;
                    match session.media.last_mut() {
                        Some(media) => media.connection_info = Some(connection),
                        None => session.connection_info = Some(connection),
                    }
                }
                "t" => {
                    let (start, stop) = value
                        .split_once(' ')
                        .ok_or_else(|| SdpError::parse(line_number, "time: expected 2 fields"))?;
                    session.time_active = TimeActive {
                        start_time: start
                            .parse()
                            .map_err(|_| SdpError::parse(line_number, "time: invalid start"))?,
                        stop_time: stop
                            .parse()
                            .map_err(|_| SdpError::parse(line_number, "time: invalid stop"))?,
                    };
                }
                "m" => session
                    .media
                    .push(MediaDescription::parse(value, line_number)?),
                "a" => match session.media.last_mut() {
                    Some(media) => media.parse_attribute(value, line_number)?,
                    None => session.parse_session_attribute(value)?,
                },
                // Other defined types (i, u, e, p, b, z, k, r) are ignored
                _ => {}
            }
        }

        if !seen_version {
            return Err(SdpError::MissingField("v"));
        }
        if session.session_name.is_empty() {
            return Err(SdpError::MissingField("s"));
        }

        Ok(session)
    }

    fn parse_session_attribute(&mut self, value: &str) -> SdpResult<()> {
        if let Some(refclk) = value.strip_prefix("ts-refclk:") {
            self.reference_clock = Some(ReferenceClock::parse(refclk)?);
        } else if let Some(mediaclk) = value.strip_prefix("mediaclk:") {
            self.media_clock = Some(MediaClockSource::parse(mediaclk)?);
        } else if let Some(domain) = value.strip_prefix("clock-domain:") {
            self.clock_domain = Some(ClockDomain::parse(domain)?);
        } else if let Some(group) = value.strip_prefix("group:") {
            self.groups.push(GroupDup::parse(group)?);
        } else {
            self.unknown_attributes.push(value.to_owned());
        }
        Ok(())
    }

    /// Canonical serialization: v, o, s, c, t, session attributes, then each
    /// media section.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("v=0\r\n");
        self.origin.encode(&mut out);
        write!(out, "s={}\r\n", self.session_name).ok();
        if let Some(connection_info) = &self.connection_info {
            connection_info.encode(&mut out);
        }
        write!(
            out,
            "t={} {}\r\n",
            self.time_active.start_time, self.time_active.stop_time
        )
        .ok();
        for group in &self.groups {
            write!(out, "a={group}\r\n").ok();
        }
        if let Some(reference_clock) = &self.reference_clock {
            write!(out, "a={reference_clock}\r\n").ok();
        }
        if let Some(media_clock) = &self.media_clock {
            write!(out, "a={media_clock}\r\n").ok();
        }
        if let Some(clock_domain) = &self.clock_domain {
            write!(out, "a={clock_domain}\r\n").ok();
        }
        for attribute in &self.unknown_attributes {
            write!(out, "a={attribute}\r\n").ok();
        }
        for media in &self.media {
            media.encode(&mut out);
        }
        out
    }

    /// The first audio media section, which is the one a receiver joins.
    pub fn audio_media(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|media| media.media_type == "audio")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::formats::AudioEncoding;

    fn example_session() -> SessionDescription {
        let mut media = MediaDescription::audio(5004);
        media.connection_info = Some(ConnectionInfo::ipv4_multicast("239.1.15.52", 15));
        media.formats = vec![SdpFormat {
            payload_type: 98,
            encoding_name: "L24".to_owned(),
            clock_rate: 48_000,
            num_channels: 2,
        }];
        media.source_filter = Some(SourceFilter::include_ipv4("239.1.15.52", "192.168.15.52"));
        media.clock_domain = Some(ClockDomain::new(0));
        media.sync_time = Some(0);
        media.reference_clock = Some(ReferenceClock::ptp_2008("39-A7-94-FF-FE-07-CB-D0", 0));
        media.media_clock = Some(MediaClockSource::direct(0));
        media.direction = Some(Direction::RecvOnly);
        media.ptime = Some(1.0);
        media.framecount = Some(48);

        SessionDescription {
            origin: Origin {
                username: "-".to_owned(),
                session_id: "13".to_owned(),
                session_version: 0,
                address_type: "IP4".to_owned(),
                unicast_address: "192.168.15.52".to_owned(),
            },
            session_name: "studio-feed".to_owned(),
            connection_info: Some(ConnectionInfo::ipv4_multicast("239.1.15.52", 15)),
            time_active: TimeActive::default(),
            reference_clock: Some(ReferenceClock::ptp_2008("39-A7-94-FF-FE-07-CB-D0", 0)),
            media_clock: Some(MediaClockSource::direct(0)),
            clock_domain: Some(ClockDomain::new(0)),
            groups: Vec::new(),
            unknown_attributes: Vec::new(),
            media: vec![media],
        }
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let session = example_session();
        let serialized = session.serialize();
        let parsed = SessionDescription::parse(&serialized).expect("parse");
        assert_eq!(session, parsed);
    }

    #[test]
    fn parses_media_line_with_port_count_and_multiple_formats() {
        let sdp = "v=0\r\no=- 13 0 IN IP4 192.168.15.52\r\ns=x\r\nt=0 0\r\n\
                   m=audio 5004/2 RTP/AVP 98 99 100\r\n\
                   a=rtpmap:98 L16/48000/2\r\n\
                   a=rtpmap:100 L24/44100\r\n";
        let session = SessionDescription::parse(sdp).expect("parse");
        let media = session.audio_media().expect("media");
        assert_eq!(5004, media.port);
        assert_eq!(2, media.number_of_ports);
        assert_eq!(3, media.formats.len());
        assert_eq!("L16", media.formats[0].encoding_name);
        assert_eq!(2, media.formats[0].num_channels);
        // No rtpmap: only the payload type number is retained
        assert_eq!(99, media.formats[1].payload_type);
        assert!(media.formats[1].encoding_name.is_empty());
        assert_eq!("L24", media.formats[2].encoding_name);
        assert_eq!(1, media.formats[2].num_channels);
    }

    #[test]
    fn payload_type_above_127_is_rejected() {
        let sdp = "v=0\r\no=- 13 0 IN IP4 10.0.0.1\r\ns=x\r\nt=0 0\r\nm=audio 5004 RTP/AVP 128\r\n";
        assert!(SessionDescription::parse(sdp).is_err());
    }

    #[test]
    fn refclk_line_roundtrips_identically() {
        let line = "a=ts-refclk:ptp=IEEE1588-2008:39-A7-94-FF-FE-07-CB-D0:5";
        let sdp = format!(
            "v=0\r\no=- 1 0 IN IP4 10.0.0.1\r\ns=x\r\nt=0 0\r\n{line}\r\n"
        );
        let session = SessionDescription::parse(&sdp).expect("parse");
        let clock = session.reference_clock.as_ref().expect("refclk");
        assert_eq!(PtpVersion::Ieee1588_2008, clock.version);
        assert_eq!(Some("39-A7-94-FF-FE-07-CB-D0".to_owned()), clock.gmid);
        assert_eq!(Some(5), clock.domain);
        assert!(session.serialize().contains(&format!("{line}\r\n")));
    }

    #[test]
    fn unknown_attributes_are_preserved() {
        let sdp = "v=0\r\no=- 1 0 IN IP4 10.0.0.1\r\ns=x\r\nt=0 0\r\na=keywds:opaque\r\n";
        let session = SessionDescription::parse(sdp).expect("parse");
        assert_eq!(vec!["keywds:opaque".to_owned()], session.unknown_attributes);
        assert!(session.serialize().contains("a=keywds:opaque\r\n"));
    }

    #[test]
    fn ipv6_connection_rejects_ttl_with_count() {
        let sdp = "v=0\r\no=- 1 0 IN IP4 10.0.0.1\r\ns=x\r\nc=IN IP6 ff00::db8:0:101/127/3\r\nt=0 0\r\n";
        assert!(SessionDescription::parse(sdp).is_err());
        let sdp = "v=0\r\no=- 1 0 IN IP4 10.0.0.1\r\ns=x\r\nc=IN IP6 ff00::db8:0:101/3\r\nt=0 0\r\n";
        let session = SessionDescription::parse(sdp).expect("parse");
        let connection = session.connection_info.expect("connection");
        assert_eq!(None, connection.ttl);
        assert_eq!(Some(3), connection.number_of_addresses);
    }

    #[test]
    fn format_mapping_table_is_explicit() {
        for (encoding, name) in [
            (AudioEncoding::PcmU8, "L8"),
            (AudioEncoding::PcmS16, "L16"),
            (AudioEncoding::PcmS24, "L24"),
        ] {
            let format = AudioFormat::new(encoding, 48_000, 2);
            let sdp_format = SdpFormat::from_audio_format(&format, 98).expect("format");
            assert_eq!(name, sdp_format.encoding_name);
            assert_eq!(format, sdp_format.to_audio_format().expect("back"));
        }
        let float = AudioFormat::new(AudioEncoding::PcmFloat, 48_000, 2);
        assert!(SdpFormat::from_audio_format(&float, 98).is_err());
    }

    #[test]
    fn lf_only_input_is_accepted() {
        let sdp = "v=0\no=- 1 0 IN IP4 10.0.0.1\ns=x\nt=0 0\nm=audio 5004 RTP/AVP 98\na=recvonly\n";
        let session = SessionDescription::parse(sdp).expect("parse");
        assert_eq!(
            Some(Direction::RecvOnly),
            session.audio_media().expect("media").direction
        );
    }
}
