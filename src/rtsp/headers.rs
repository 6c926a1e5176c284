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

use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// An ordered collection of RTSP headers. Lookup is case-insensitive,
/// setting an existing name replaces its value in place.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtspHeaders {
    headers: Vec<Header>,
}

impl RtspHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, name: &str) -> Option<&Header> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
    }

    /// The value of a header, or an empty string when absent.
    pub fn get(&self, name: &str) -> &str {
        self.find(name).map(|header| header.value.as_str()).unwrap_or("")
    }

    pub fn content_length(&self) -> Option<usize> {
        self.find("content-length")
            .and_then(|header| header.value.trim().parse().ok())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        for header in &mut self.headers {
            if header.name.eq_ignore_ascii_case(&name) {
                header.value = value;
                return;
            }
        }
        self.headers.push(Header { name, value });
    }

    pub(crate) fn push_name_char(&mut self, c: char) {
        if let Some(last) = self.headers.last_mut() {
            last.name.push(c);
        }
    }

    pub(crate) fn push_value_char(&mut self, c: char) {
        if let Some(last) = self.headers.last_mut() {
            last.value.push(c);
        }
    }

    pub(crate) fn start_header(&mut self, c: char) {
        self.headers.push(Header {
            name: c.to_string(),
            value: String::new(),
        });
    }

    /// Appends a folded continuation line to the last header value.
    pub(crate) fn fold_continuation(&mut self) -> bool {
        match self.headers.last_mut() {
            Some(last) => {
                if !last.value.is_empty() {
                    last.value.push(' ');
                }
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    /// Encodes `Name: Value\r\n` lines, skipping any stale Content-Length:
    /// the message encoder writes the authoritative one.
    pub fn encode_append(&self, output: &mut String) {
        for header in &self.headers {
            if header.name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            write!(output, "{}: {}\r\n", header.name, header.value).ok();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = RtspHeaders::new();
        headers.set("Content-Type", "application/sdp");
        assert_eq!("application/sdp", headers.get("content-type"));
        assert_eq!("application/sdp", headers.get("CONTENT-TYPE"));
        assert_eq!("", headers.get("accept"));
    }

    #[test]
    fn set_replaces_existing_value() {
        let mut headers = RtspHeaders::new();
        headers.set("CSeq", "1");
        headers.set("cseq", "2");
        assert_eq!(1, headers.len());
        assert_eq!("2", headers.get("CSeq"));
    }

    #[test]
    fn content_length_parses() {
        let mut headers = RtspHeaders::new();
        assert_eq!(None, headers.content_length());
        headers.set("Content-Length", "28");
        assert_eq!(Some(28), headers.content_length());
    }

    #[test]
    fn encode_skips_content_length() {
        let mut headers = RtspHeaders::new();
        headers.set("CSeq", "5");
        headers.set("Content-Length", "99");
        let mut out = String::new();
        headers.encode_append(&mut out);
        assert_eq!("CSeq: 5\r\n", out);
    }
}
