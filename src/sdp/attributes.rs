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

//! The RFC 7273 clock attributes, the RFC 4570 source filter and the
//! RAVENNA clock-domain attribute.

use crate::error::{SdpError, SdpResult};
use std::fmt;

/// `a=ts-refclk:ptp=IEEE1588-2008:<gmid>:<domain>`, RFC 7273.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceClock {
    pub version: PtpVersion,
    pub gmid: Option<String>,
    pub domain: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpVersion {
    Ieee1588_2002,
    Ieee1588_2008,
    Ieee8021As2011,
    Traceable,
}

impl fmt::Display for PtpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PtpVersion::Ieee1588_2002 => "IEEE1588-2002",
            PtpVersion::Ieee1588_2008 => "IEEE1588-2008",
            PtpVersion::Ieee8021As2011 => "IEEE802.1AS-2011",
            PtpVersion::Traceable => "traceable",
        };
        write!(f, "{name}")
    }
}

impl PtpVersion {
    fn parse(value: &str) -> SdpResult<Self> {
        match value {
            "IEEE1588-2002" => Ok(PtpVersion::Ieee1588_2002),
            "IEEE1588-2008" => Ok(PtpVersion::Ieee1588_2008),
            "IEEE802.1AS-2011" => Ok(PtpVersion::Ieee8021As2011),
            "traceable" => Ok(PtpVersion::Traceable),
            other => Err(SdpError::parse(0, format!("unknown ptp version: {other}"))),
        }
    }
}

impl ReferenceClock {
    pub fn ptp_2008(gmid: impl Into<String>, domain: i32) -> Self {
        Self {
            version: PtpVersion::Ieee1588_2008,
            gmid: Some(gmid.into()),
            domain: Some(domain),
        }
    }

    /// Parses the attribute value after `ts-refclk:`. Only the ptp clock
    /// source is supported.
    pub fn parse(value: &str) -> SdpResult<Self> {
        let (source, rest) = value
            .split_once('=')
            .ok_or_else(|| SdpError::parse(0, "ts-refclk: missing clock source"))?;
        if source != "ptp" {
            return Err(SdpError::parse(
                0,
                format!("ts-refclk: unsupported clock source: {source}"),
            ));
        }

        let mut parts = rest.split(':');
        let version = PtpVersion::parse(
            parts
                .next()
                .ok_or_else(|| SdpError::parse(0, "ts-refclk: missing ptp version"))?,
        )?;
        let gmid = parts.next().map(str::to_owned);
        let domain = match parts.next() {
            Some(domain) => Some(
                domain
                    .parse()
                    .map_err(|_| SdpError::parse(0, "ts-refclk: invalid domain"))?,
            ),
            None => None,
        };

        Ok(Self {
            version,
            gmid,
            domain,
        })
    }
}

impl fmt::Display for ReferenceClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts-refclk:ptp={}", self.version)?;
        if let Some(gmid) = &self.gmid {
            write!(f, ":{gmid}")?;
        }
        if let Some(domain) = self.domain {
            write!(f, ":{domain}")?;
        }
        Ok(())
    }
}

/// `a=mediaclk:direct=<offset>[ rate=<n>/<d>]`, RFC 7273. ST 2110-30 streams
/// use a zero offset exclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaClockSource {
    pub offset: Option<i64>,
    pub rate: Option<(i32, i32)>,
}

impl MediaClockSource {
    pub fn direct(offset: i64) -> Self {
        Self {
            offset: Some(offset),
            rate: None,
        }
    }

    pub fn parse(value: &str) -> SdpResult<Self> {
        let mut parts = value.split(' ');
        let mode_part = parts
            .next()
            .ok_or_else(|| SdpError::parse(0, "mediaclk: empty attribute"))?;

        let mut clock = Self {
            offset: None,
            rate: None,
        };

        match mode_part.split_once('=') {
            Some(("direct", offset)) => {
                clock.offset = Some(
                    offset
                        .parse()
                        .map_err(|_| SdpError::parse(0, "mediaclk: invalid offset"))?,
                );
            }
            None if mode_part == "direct" => {}
            _ => {
                return Err(SdpError::parse(
                    0,
                    format!("mediaclk: unsupported media clock mode: {mode_part}"),
                ));
            }
        }

        if let Some(rate_part) = parts.next() {
            let (key, value) = rate_part
                .split_once('=')
                .ok_or_else(|| SdpError::parse(0, "mediaclk: expecting rate"))?;
            if key != "rate" {
                return Err(SdpError::parse(0, "mediaclk: unexpected token"));
            }
            let (numerator, denominator) = value
                .split_once('/')
                .ok_or_else(|| SdpError::parse(0, "mediaclk: invalid rate"))?;
            clock.rate = Some((
                numerator
                    .parse()
                    .map_err(|_| SdpError::parse(0, "mediaclk: invalid rate numerator"))?,
                denominator
                    .parse()
                    .map_err(|_| SdpError::parse(0, "mediaclk: invalid rate denominator"))?,
            ));
        }

        Ok(clock)
    }
}

impl fmt::Display for MediaClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "mediaclk:direct={offset}")?,
            None => write!(f, "mediaclk:direct")?,
        }
        if let Some((numerator, denominator)) = self.rate {
            write!(f, " rate={numerator}/{denominator}")?;
        }
        Ok(())
    }
}

/// `a=clock-domain:PTPv2 <n>`, the RAVENNA clock domain attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockDomain {
    pub domain: i32,
}

impl ClockDomain {
    pub fn new(domain: i32) -> Self {
        Self { domain }
    }

    pub fn parse(value: &str) -> SdpResult<Self> {
        let (source, domain) = value
            .split_once(' ')
            .ok_or_else(|| SdpError::parse(0, "clock-domain: missing domain"))?;
        if source != "PTPv2" {
            return Err(SdpError::parse(
                0,
                format!("clock-domain: unsupported sync source: {source}"),
            ));
        }
        Ok(Self {
            domain: domain
                .parse()
                .map_err(|_| SdpError::parse(0, "clock-domain: invalid domain"))?,
        })
    }
}

impl fmt::Display for ClockDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clock-domain:PTPv2 {}", self.domain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Include,
    Exclude,
}

/// `a=source-filter: incl IN IP4 <dst> <src>…`, RFC 4570.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFilter {
    pub mode: FilterMode,
    pub address_type: String,
    pub destination: String,
    pub sources: Vec<String>,
}

impl SourceFilter {
    pub fn include_ipv4(destination: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            mode: FilterMode::Include,
            address_type: "IP4".to_owned(),
            destination: destination.into(),
            sources: vec![source.into()],
        }
    }

    pub fn parse(value: &str) -> SdpResult<Self> {
        let mut parts = value.trim_start().split(' ');
        let mode = match parts.next() {
            Some("incl") => FilterMode::Include,
            Some("excl") => FilterMode::Exclude,
            _ => return Err(SdpError::parse(0, "source-filter: invalid filter mode")),
        };
        match parts.next() {
            Some("IN") => {}
            _ => return Err(SdpError::parse(0, "source-filter: unsupported nettype")),
        }
        let address_type = match parts.next() {
            Some(t @ ("IP4" | "IP6" | "*")) => t.to_owned(),
            _ => return Err(SdpError::parse(0, "source-filter: unsupported addrtype")),
        };
        let destination = parts
            .next()
            .ok_or_else(|| SdpError::parse(0, "source-filter: missing destination"))?
            .to_owned();
        let sources: Vec<String> = parts.map(str::to_owned).collect();
        if sources.is_empty() {
            return Err(SdpError::parse(0, "source-filter: missing source list"));
        }

        Ok(Self {
            mode,
            address_type,
            destination,
            sources,
        })
    }
}

impl fmt::Display for SourceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            FilterMode::Include => "incl",
            FilterMode::Exclude => "excl",
        };
        write!(
            f,
            "source-filter: {mode} IN {} {}",
            self.address_type, self.destination
        )?;
        for source in &self.sources {
            write!(f, " {source}")?;
        }
        Ok(())
    }
}

/// `a=group:DUP <tag>…`, RFC 7104 stream duplication grouping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDup {
    pub tags: Vec<String>,
}

impl GroupDup {
    pub fn parse(value: &str) -> SdpResult<Self> {
        let mut parts = value.split(' ');
        match parts.next() {
            Some("DUP") => {}
            _ => return Err(SdpError::parse(0, "group: only DUP groups are supported")),
        }
        let tags: Vec<String> = parts.map(str::to_owned).collect();
        if tags.is_empty() {
            return Err(SdpError::parse(0, "group: missing tags"));
        }
        Ok(Self { tags })
    }
}

impl fmt::Display for GroupDup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group:DUP")?;
        for tag in &self.tags {
            write!(f, " {tag}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ts_refclk_roundtrip() {
        let line = "ts-refclk:ptp=IEEE1588-2008:39-A7-94-FF-FE-07-CB-D0:5";
        let value = line.strip_prefix("ts-refclk:").expect("prefix");
        let clock = ReferenceClock::parse(value).expect("parse");
        assert_eq!(PtpVersion::Ieee1588_2008, clock.version);
        assert_eq!(Some("39-A7-94-FF-FE-07-CB-D0".to_owned()), clock.gmid);
        assert_eq!(Some(5), clock.domain);
        assert_eq!(line, clock.to_string());
    }

    #[test]
    fn ts_refclk_rejects_unknown_source() {
        assert!(ReferenceClock::parse("ntp=pool.example.org").is_err());
    }

    #[test]
    fn mediaclk_with_offset_and_rate() {
        let clock = MediaClockSource::parse("direct=5 rate=48000/1").expect("parse");
        assert_eq!(Some(5), clock.offset);
        assert_eq!(Some((48000, 1)), clock.rate);
        assert_eq!("mediaclk:direct=5 rate=48000/1", clock.to_string());
    }

    #[test]
    fn mediaclk_zero_offset_roundtrip() {
        let clock = MediaClockSource::direct(0);
        assert_eq!("mediaclk:direct=0", clock.to_string());
        assert_eq!(clock, MediaClockSource::parse("direct=0").expect("parse"));
    }

    #[test]
    fn clock_domain_roundtrip() {
        let domain = ClockDomain::parse("PTPv2 0").expect("parse");
        assert_eq!(0, domain.domain);
        assert_eq!("clock-domain:PTPv2 0", domain.to_string());
    }

    #[test]
    fn source_filter_roundtrip() {
        let value = " incl IN IP4 239.1.15.52 192.168.15.52";
        let filter = SourceFilter::parse(value).expect("parse");
        assert_eq!(FilterMode::Include, filter.mode);
        assert_eq!("239.1.15.52", filter.destination);
        assert_eq!(vec!["192.168.15.52".to_owned()], filter.sources);
        assert_eq!(
            "source-filter: incl IN IP4 239.1.15.52 192.168.15.52",
            filter.to_string()
        );
    }

    #[test]
    fn group_dup_roundtrip() {
        let group = GroupDup::parse("DUP primary secondary").expect("parse");
        assert_eq!(vec!["primary".to_owned(), "secondary".to_owned()], group.tags);
        assert_eq!("group:DUP primary secondary", group.to_string());
    }
}
