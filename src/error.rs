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

use miette::Diagnostic;
use std::{io, net::AddrParseError};
use thiserror::Error;
use tokio::sync::oneshot;

/// Coarse failure categories shared by all subsystem errors. Parsing layers
/// report their own error type; this is the cross-cutting classification
/// callers can dispatch on without knowing which layer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    ResourceExhausted,
    NotFound,
    ProtocolError,
    InsufficientData,
    Overflow,
    Cancelled,
    Platform,
}

pub trait ErrorCategory {
    fn kind(&self) -> ErrorKind;
}

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid IP address: {0}")]
    InvalidIp(#[from] AddrParseError),
    #[error("Interface address must not be unspecified")]
    UnspecifiedInterface,
    #[error("IPv6 interface addresses are not supported for streaming")]
    Ipv6Interface,
    #[error("NIC with specified IP not found: {0}")]
    NoSuchNic(String),
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),
}

impl ErrorCategory for ConfigError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::YamlError(_) | ConfigError::InvalidIp(_) => ErrorKind::ProtocolError,
            ConfigError::IoError(_) => ErrorKind::Platform,
            ConfigError::UnspecifiedInterface
            | ConfigError::Ipv6Interface
            | ConfigError::InvalidLogLevel(_) => ErrorKind::InvalidArgument,
            ConfigError::NoSuchNic(_) => ErrorKind::NotFound,
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum ClockError {
    #[error("Could not read system clock: {0}")]
    IoError(#[from] io::Error),
    #[error("Local clock is not calibrated yet")]
    NotCalibrated,
}

impl ErrorCategory for ClockError {
    fn kind(&self) -> ErrorKind {
        match self {
            ClockError::IoError(_) => ErrorKind::Platform,
            ClockError::NotCalibrated => ErrorKind::InsufficientData,
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum PtpError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Clock error: {0}")]
    ClockError(#[from] ClockError),
    #[error("Port already bound to {0}")]
    AlreadyBound(String),
    #[error("Truncated PTP message: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Unsupported PTP version: {0}")]
    BadVersion(u8),
    #[error("Unknown PTP message type: {0:#x}")]
    UnknownMessageType(u8),
    #[error("PTP interval does not fit the wire format")]
    WireOverflow,
}

impl ErrorCategory for PtpError {
    fn kind(&self) -> ErrorKind {
        match self {
            PtpError::IoError(_) => ErrorKind::Platform,
            PtpError::ClockError(e) => e.kind(),
            PtpError::AlreadyBound(_) => ErrorKind::InvalidArgument,
            PtpError::Truncated { .. } => ErrorKind::InsufficientData,
            PtpError::BadVersion(_) | PtpError::UnknownMessageType(_) => ErrorKind::ProtocolError,
            PtpError::WireOverflow => ErrorKind::Overflow,
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    MdnsError(#[from] mdns_sd::Error),
    #[error("Malformed registration type: {0}")]
    BadRegType(String),
    #[error("Already browsing for {0}")]
    DuplicateBrowse(String),
    #[error("Service name conflict: {0}")]
    NameConflict(String),
    #[error("No such registration: {0}")]
    NoSuchRegistration(u64),
}

impl ErrorCategory for DiscoveryError {
    fn kind(&self) -> ErrorKind {
        match self {
            DiscoveryError::MdnsError(_) => ErrorKind::Platform,
            DiscoveryError::BadRegType(_) | DiscoveryError::DuplicateBrowse(_) => {
                ErrorKind::InvalidArgument
            }
            DiscoveryError::NameConflict(_) => ErrorKind::ResourceExhausted,
            DiscoveryError::NoSuchRegistration(_) => ErrorKind::NotFound,
        }
    }
}

/// Grammar level RTSP failures, one variant per parser rejection state.
#[derive(Error, Debug, Diagnostic, Clone, Copy, PartialEq, Eq)]
pub enum RtspParseError {
    #[error("bad method")]
    BadMethod,
    #[error("bad URI")]
    BadUri,
    #[error("bad protocol")]
    BadProtocol,
    #[error("bad version")]
    BadVersion,
    #[error("bad header")]
    BadHeader,
    #[error("bad end of headers")]
    BadEndOfHeaders,
    #[error("bad status code")]
    BadStatusCode,
    #[error("bad reason phrase")]
    BadReasonPhrase,
    #[error("unexpected blank line")]
    UnexpectedBlankLine,
}

#[derive(Error, Debug, Diagnostic)]
pub enum RtspError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("RTSP parse error: {0}")]
    ParseError(#[from] RtspParseError),
    #[error("No handler registered for path: {0}")]
    NoSuchPath(String),
    #[error("Request path must start with '/': {0}")]
    BadPath(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
}

impl ErrorCategory for RtspError {
    fn kind(&self) -> ErrorKind {
        match self {
            RtspError::IoError(_) => ErrorKind::Platform,
            RtspError::ParseError(_) => ErrorKind::ProtocolError,
            RtspError::NoSuchPath(_) => ErrorKind::NotFound,
            RtspError::BadPath(_) => ErrorKind::InvalidArgument,
            RtspError::ConnectionClosed | RtspError::ChannelError(_) => ErrorKind::Cancelled,
        }
    }
}

#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("SDP parse error in line {line}: {message}")]
    ParseError { line: usize, message: String },
    #[error("Unsupported audio encoding for SDP: {0}")]
    UnsupportedEncoding(String),
    #[error("Missing mandatory field: {0}")]
    MissingField(&'static str),
}

impl SdpError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        SdpError::ParseError {
            line,
            message: message.into(),
        }
    }
}

impl ErrorCategory for SdpError {
    fn kind(&self) -> ErrorKind {
        match self {
            SdpError::ParseError { .. } | SdpError::MissingField(_) => ErrorKind::ProtocolError,
            SdpError::UnsupportedEncoding(_) => ErrorKind::InvalidArgument,
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum RtpError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Truncated RTP packet: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Unsupported RTP version: {0}")]
    BadVersion(u8),
    #[error("RTP packet is too large: {0}. MTU is 1500.")]
    MaxMtuExceeded(usize),
    #[error("Already subscribed to port {port} ssrc {ssrc:#x}")]
    DuplicateSubscription { port: u16, ssrc: u32 },
}

impl ErrorCategory for RtpError {
    fn kind(&self) -> ErrorKind {
        match self {
            RtpError::IoError(_) => ErrorKind::Platform,
            RtpError::Truncated { .. } => ErrorKind::InsufficientData,
            RtpError::BadVersion(_) => ErrorKind::ProtocolError,
            RtpError::MaxMtuExceeded(_) | RtpError::DuplicateSubscription { .. } => {
                ErrorKind::InvalidArgument
            }
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum RavennaError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Clock error: {0}")]
    ClockError(#[from] ClockError),
    #[error("PTP error: {0}")]
    PtpError(#[from] PtpError),
    #[error("Discovery error: {0}")]
    DiscoveryError(#[from] DiscoveryError),
    #[error("RTSP error: {0}")]
    RtspError(#[from] RtspError),
    #[error("SDP error: {0}")]
    SdpError(#[from] SdpError),
    #[error("RTP error: {0}")]
    RtpError(#[from] RtpError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),
    #[error("Stream clock domain {actual} does not match local PTP domain {expected}")]
    ClockDomainMismatch { expected: u8, actual: i32 },
    #[error("Operation cancelled.")]
    Cancelled,
}

impl ErrorCategory for RavennaError {
    fn kind(&self) -> ErrorKind {
        match self {
            RavennaError::ConfigError(e) => e.kind(),
            RavennaError::ClockError(e) => e.kind(),
            RavennaError::PtpError(e) => e.kind(),
            RavennaError::DiscoveryError(e) => e.kind(),
            RavennaError::RtspError(e) => e.kind(),
            RavennaError::SdpError(e) => e.kind(),
            RavennaError::RtpError(e) => e.kind(),
            RavennaError::IoError(_) => ErrorKind::Platform,
            RavennaError::UnsupportedAudioFormat(_) => ErrorKind::InvalidArgument,
            RavennaError::ClockDomainMismatch { .. } => ErrorKind::InvalidArgument,
            RavennaError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

pub type RavennaResult<T> = Result<T, RavennaError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ClockResult<T> = Result<T, ClockError>;
pub type PtpResult<T> = Result<T, PtpError>;
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
pub type RtspResult<T> = Result<T, RtspError>;
pub type SdpResult<T> = Result<T, SdpError>;
pub type RtpResult<T> = Result<T, RtpError>;
