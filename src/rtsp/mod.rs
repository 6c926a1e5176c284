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

//! Session control: the RFC 2326 subset RAVENNA uses to exchange session
//! descriptions. Only OPTIONS, DESCRIBE and server-initiated ANNOUNCE are
//! interpreted; the client can additionally issue SETUP, PLAY and TEARDOWN.

pub mod client;
pub mod headers;
pub mod parser;
pub mod server;

pub use client::RtspClient;
pub use headers::RtspHeaders;
pub use parser::{ParseOutcome, RtspParser};
pub use server::RtspServer;

use std::fmt::Write;

pub const RTSP_VERSION: &str = "RTSP/1.0";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtspRequest {
    pub method: String,
    pub uri: String,
    pub headers: RtspHeaders,
    pub data: String,
}

impl RtspRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: RtspHeaders::new(),
            data: String::new(),
        }
    }

    /// The path component of the request URI, used for handler matching.
    pub fn path(&self) -> &str {
        let without_scheme = self
            .uri
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.uri);
        match without_scheme.find('/') {
            Some(index) => &without_scheme[index..],
            None if self.uri.starts_with('/') => &self.uri,
            None => "/",
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        write!(out, "{} {} {RTSP_VERSION}\r\n", self.method, self.uri).ok();
        self.headers.encode_append(&mut out);
        if !self.data.is_empty() {
            write!(out, "Content-Length: {}\r\n", self.data.len()).ok();
        }
        out.push_str("\r\n");
        out.push_str(&self.data);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspResponse {
    pub status_code: u16,
    pub reason: String,
    pub headers: RtspHeaders,
    pub data: String,
}

impl Default for RtspResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            reason: "OK".to_owned(),
            headers: RtspHeaders::new(),
            data: String::new(),
        }
    }
}

impl RtspResponse {
    pub fn new(status_code: u16, reason: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            status_code,
            reason: reason.into(),
            headers: RtspHeaders::new(),
            data: data.into(),
        }
    }

    pub fn ok(data: impl Into<String>) -> Self {
        Self::new(200, "OK", data)
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found", "")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        write!(out, "{RTSP_VERSION} {} {}\r\n", self.status_code, self.reason).ok();
        self.headers.encode_append(&mut out);
        if !self.data.is_empty() {
            write!(out, "Content-Length: {}\r\n", self.data.len()).ok();
        }
        out.push_str("\r\n");
        out.push_str(&self.data);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspMessage {
    Request(RtspRequest),
    Response(RtspResponse),
}

/// Builds an `rtsp://host:port/path` URI.
pub fn encode_uri(host: &str, port: u16, path: &str) -> String {
    format!("rtsp://{host}:{port}{path}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_encodes_with_crlf_and_content_length() {
        let mut request = RtspRequest::new("DESCRIBE", "rtsp://host:5005/by-name/session");
        request.headers.set("CSeq", "1");
        request.data = "0123456789".to_owned();
        let encoded = request.encode();
        assert_eq!(
            "DESCRIBE rtsp://host:5005/by-name/session RTSP/1.0\r\n\
             CSeq: 1\r\n\
             Content-Length: 10\r\n\
             \r\n\
             0123456789",
            encoded
        );
    }

    #[test]
    fn response_encodes_without_body() {
        let response = RtspResponse::new(404, "Not Found", "");
        assert_eq!("RTSP/1.0 404 Not Found\r\n\r\n", response.encode());
    }

    #[test]
    fn path_is_extracted_from_absolute_uri() {
        let request = RtspRequest::new("DESCRIBE", "rtsp://10.0.0.1:5005/by-id/7");
        assert_eq!("/by-id/7", request.path());
        let request = RtspRequest::new("DESCRIBE", "/by-name/foo");
        assert_eq!("/by-name/foo", request.path());
    }

    #[test]
    fn uri_encoding() {
        assert_eq!(
            "rtsp://192.168.1.2:5005/by-name/studio",
            encode_uri("192.168.1.2", 5005, "/by-name/studio")
        );
    }
}
