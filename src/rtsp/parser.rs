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

//! Incremental RTSP message parser. Bytes are consumed one at a time, so a
//! message may arrive in arbitrary fragments; one complete message is
//! produced per [`ParseOutcome::Complete`] and the parser resets itself for
//! the next. Requests and responses are distinguished by the first token of
//! the start line. CR is optional on input, every line ends at LF.

use super::{RtspHeaders, RtspMessage, RtspRequest, RtspResponse};
use crate::error::RtspParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    FirstToken,
    RequestUri,
    RequestProtocol(usize),
    StartLineEnd,
    ResponseStatusCode,
    ResponseReason,
    HeaderStart,
    HeaderName,
    HeaderValueStart,
    HeaderValue,
    HeaderLineEnd,
    FinalLineEnd,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A complete message was parsed; the second tuple element of
    /// [`RtspParser::parse`] tells how many input bytes it consumed.
    Complete(RtspMessage),
    /// All input consumed, message still incomplete.
    Incomplete,
}

const PROTOCOL: &[u8] = b"RTSP/1.0";

#[derive(Debug, Default)]
pub struct RtspParser {
    state: Option<State>,
    token: String,
    is_response: bool,
    method: String,
    uri: String,
    status_code: u16,
    status_digits: usize,
    reason: String,
    headers: RtspHeaders,
    body: Vec<u8>,
    remaining_body: usize,
}

impl RtspParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Consumes input until one message completes or the input is exhausted.
    /// Returns the outcome and the number of bytes consumed; on a complete
    /// message the caller feeds the remaining bytes into the next call.
    pub fn parse(&mut self, data: &[u8]) -> Result<(ParseOutcome, usize), RtspParseError> {
        let mut consumed = 0;

        while consumed < data.len() {
            if self.remaining_body > 0 {
                let take = self.remaining_body.min(data.len() - consumed);
                self.body.extend_from_slice(&data[consumed..consumed + take]);
                self.remaining_body -= take;
                consumed += take;
                if self.remaining_body == 0 {
                    return Ok((ParseOutcome::Complete(self.take_message()), consumed));
                }
                return Ok((ParseOutcome::Incomplete, consumed));
            }

            let c = data[consumed];
            consumed += 1;

            match self.consume(c) {
                Ok(false) => {}
                Ok(true) => {
                    self.remaining_body = self.headers.content_length().unwrap_or(0);
                    if self.remaining_body > 0 {
                        continue;
                    }
                    return Ok((ParseOutcome::Complete(self.take_message()), consumed));
                }
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            }
        }

        Ok((ParseOutcome::Incomplete, consumed))
    }

    fn take_message(&mut self) -> RtspMessage {
        let headers = std::mem::take(&mut self.headers);
        let data = String::from_utf8_lossy(&self.body).into_owned();
        let message = if self.is_response {
            RtspMessage::Response(RtspResponse {
                status_code: self.status_code,
                reason: std::mem::take(&mut self.reason),
                headers,
                data,
            })
        } else {
            RtspMessage::Request(RtspRequest {
                method: std::mem::take(&mut self.method),
                uri: std::mem::take(&mut self.uri),
                headers,
                data,
            })
        };
        self.reset();
        message
    }

    /// Consumes one header-section byte. `Ok(true)` means the header section
    /// is complete.
    fn consume(&mut self, c: u8) -> Result<bool, RtspParseError> {
        let state = self.state.unwrap_or(State::Start);
        match state {
            State::Start => {
                if c == b'\r' || c == b'\n' {
                    return Err(RtspParseError::UnexpectedBlankLine);
                }
                if !is_start_token_char(c) {
                    return Err(RtspParseError::BadMethod);
                }
                self.token.push(c as char);
                self.state = Some(State::FirstToken);
                Ok(false)
            }
            State::FirstToken => {
                if c == b' ' {
                    self.first_token_complete()?;
                    return Ok(false);
                }
                if !is_start_token_char(c) {
                    return Err(RtspParseError::BadMethod);
                }
                self.token.push(c as char);
                Ok(false)
            }
            State::RequestUri => {
                if c == b' ' {
                    self.state = Some(State::RequestProtocol(0));
                    return Ok(false);
                }
                if is_ctl(c) {
                    return Err(RtspParseError::BadUri);
                }
                self.uri.push(c as char);
                Ok(false)
            }
            State::RequestProtocol(position) => {
                if position < PROTOCOL.len() && c == PROTOCOL[position] {
                    self.state = if position + 1 == PROTOCOL.len() {
                        Some(State::StartLineEnd)
                    } else {
                        Some(State::RequestProtocol(position + 1))
                    };
                    return Ok(false);
                }
                // The first five octets name the protocol, the rest the version
                if position < 5 {
                    Err(RtspParseError::BadProtocol)
                } else {
                    Err(RtspParseError::BadVersion)
                }
            }
            State::StartLineEnd => match c {
                b'\r' => Ok(false),
                b'\n' => {
                    self.state = Some(State::HeaderStart);
                    Ok(false)
                }
                _ => Err(RtspParseError::BadProtocol),
            },
            State::ResponseStatusCode => match c {
                b'0'..=b'9' => {
                    if self.status_digits == 3 {
                        return Err(RtspParseError::BadStatusCode);
                    }
                    self.status_code = self.status_code * 10 + (c - b'0') as u16;
                    self.status_digits += 1;
                    Ok(false)
                }
                b' ' if self.status_digits == 3 => {
                    self.state = Some(State::ResponseReason);
                    Ok(false)
                }
                b'\r' | b'\n' if self.status_digits == 3 => {
                    self.state = if c == b'\r' {
                        Some(State::StartLineEnd)
                    } else {
                        Some(State::HeaderStart)
                    };
                    Ok(false)
                }
                _ => Err(RtspParseError::BadStatusCode),
            },
            State::ResponseReason => match c {
                b'\r' => {
                    self.state = Some(State::StartLineEnd);
                    Ok(false)
                }
                b'\n' => {
                    self.state = Some(State::HeaderStart);
                    Ok(false)
                }
                c if is_ctl(c) && c != b'\t' => Err(RtspParseError::BadReasonPhrase),
                c => {
                    self.reason.push(c as char);
                    Ok(false)
                }
            },
            State::HeaderStart => match c {
                b'\r' => {
                    self.state = Some(State::FinalLineEnd);
                    Ok(false)
                }
                b'\n' => Ok(true),
                b' ' | b'\t' => {
                    // Folded continuation of the previous header value
                    if !self.headers.fold_continuation() {
                        return Err(RtspParseError::BadHeader);
                    }
                    self.state = Some(State::HeaderValueStart);
                    Ok(false)
                }
                c if is_token_char(c) => {
                    self.headers.start_header(c as char);
                    self.state = Some(State::HeaderName);
                    Ok(false)
                }
                _ => Err(RtspParseError::BadHeader),
            },
            State::HeaderName => match c {
                b':' => {
                    self.state = Some(State::HeaderValueStart);
                    Ok(false)
                }
                c if is_token_char(c) => {
                    self.headers.push_name_char(c as char);
                    Ok(false)
                }
                _ => Err(RtspParseError::BadHeader),
            },
            State::HeaderValueStart => match c {
                b' ' | b'\t' => Ok(false),
                b'\r' => {
                    self.state = Some(State::HeaderLineEnd);
                    Ok(false)
                }
                b'\n' => {
                    self.state = Some(State::HeaderStart);
                    Ok(false)
                }
                c if is_ctl(c) => Err(RtspParseError::BadHeader),
                c => {
                    self.headers.push_value_char(c as char);
                    self.state = Some(State::HeaderValue);
                    Ok(false)
                }
            },
            State::HeaderValue => match c {
                b'\r' => {
                    self.state = Some(State::HeaderLineEnd);
                    Ok(false)
                }
                b'\n' => {
                    self.state = Some(State::HeaderStart);
                    Ok(false)
                }
                c if is_ctl(c) => Err(RtspParseError::BadHeader),
                c => {
                    self.headers.push_value_char(c as char);
                    Ok(false)
                }
            },
            State::HeaderLineEnd => {
                if c == b'\n' {
                    self.state = Some(State::HeaderStart);
                    Ok(false)
                } else {
                    Err(RtspParseError::BadHeader)
                }
            }
            State::FinalLineEnd => {
                if c == b'\n' {
                    Ok(true)
                } else {
                    Err(RtspParseError::BadEndOfHeaders)
                }
            }
        }
    }

    fn first_token_complete(&mut self) -> Result<(), RtspParseError> {
        let token = std::mem::take(&mut self.token);
        if token.as_bytes() == PROTOCOL {
            self.is_response = true;
            self.state = Some(State::ResponseStatusCode);
            return Ok(());
        }
        if let Some(version) = token.strip_prefix("RTSP/") {
            return if version == "1.0" {
                Ok(())
            } else {
                Err(RtspParseError::BadVersion)
            };
        }
        if token.is_empty() || !token.bytes().all(is_method_char) {
            return Err(RtspParseError::BadMethod);
        }
        self.method = token;
        self.state = Some(State::RequestUri);
        Ok(())
    }
}

fn is_ctl(c: u8) -> bool {
    c <= 31 || c == 127
}

fn is_tspecial(c: u8) -> bool {
    matches!(
        c,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

fn is_token_char(c: u8) -> bool {
    c.is_ascii() && !is_ctl(c) && !is_tspecial(c)
}

fn is_method_char(c: u8) -> bool {
    is_token_char(c)
}

/// Characters allowed in the first token of a start line: method characters
/// plus the '/' and '.' that appear in "RTSP/1.0".
fn is_start_token_char(c: u8) -> bool {
    is_token_char(c) || c == b'/' || c == b'.'
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_all(parser: &mut RtspParser, data: &[u8]) -> Result<Vec<RtspMessage>, RtspParseError> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (outcome, consumed) = parser.parse(&data[offset..])?;
            offset += consumed;
            if let ParseOutcome::Complete(message) = outcome {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    #[test]
    fn parses_request_without_body() {
        let mut parser = RtspParser::new();
        let data = b"OPTIONS rtsp://host/path RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let messages = parse_all(&mut parser, data).expect("parse");
        assert_eq!(1, messages.len());
        match &messages[0] {
            RtspMessage::Request(request) => {
                assert_eq!("OPTIONS", request.method);
                assert_eq!("rtsp://host/path", request.uri);
                assert_eq!("1", request.headers.get("cseq"));
                assert!(request.data.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_request_with_body_fed_one_byte_at_a_time() {
        let mut parser = RtspParser::new();
        let data =
            b"DESCRIBE rtsp://h/p RTSP/1.0\r\nContent-Length: 28\r\n\r\nthis_is_the_part_called_data";

        let mut completed = Vec::new();
        for &byte in data.iter() {
            let (outcome, consumed) = parser.parse(&[byte]).expect("parse");
            assert_eq!(1, consumed);
            if let ParseOutcome::Complete(message) = outcome {
                completed.push(message);
            }
        }

        assert_eq!(1, completed.len());
        match &completed[0] {
            RtspMessage::Request(request) => {
                assert_eq!("DESCRIBE", request.method);
                assert_eq!(28, request.data.len());
                assert_eq!("this_is_the_part_called_data", request.data);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_response() {
        let mut parser = RtspParser::new();
        let data = b"RTSP/1.0 200 OK\r\nContent-Length: 3\r\n\r\nv=0";
        let messages = parse_all(&mut parser, data).expect("parse");
        match &messages[0] {
            RtspMessage::Response(response) => {
                assert_eq!(200, response.status_code);
                assert_eq!("OK", response.reason);
                assert_eq!("v=0", response.data);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn accepts_lf_only_line_endings() {
        let mut parser = RtspParser::new();
        let data = b"DESCRIBE /p RTSP/1.0\nCSeq: 2\n\n";
        let messages = parse_all(&mut parser, data).expect("parse");
        assert_eq!(1, messages.len());
    }

    #[test]
    fn folded_header_continuation_concatenates() {
        let mut parser = RtspParser::new();
        let data = b"OPTIONS / RTSP/1.0\r\nX-Long: first\r\n second\r\n\r\n";
        let messages = parse_all(&mut parser, data).expect("parse");
        match &messages[0] {
            RtspMessage::Request(request) => {
                assert_eq!("first second", request.headers.get("x-long"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_two_messages_back_to_back() {
        let mut parser = RtspParser::new();
        let data = b"OPTIONS / RTSP/1.0\r\n\r\nOPTIONS /other RTSP/1.0\r\n\r\n";
        let messages = parse_all(&mut parser, data).expect("parse");
        assert_eq!(2, messages.len());
    }

    #[test]
    fn rejects_bad_protocol() {
        let mut parser = RtspParser::new();
        let result = parse_all(&mut parser, b"DESCRIBE /p HTTP/1.0\r\n\r\n");
        assert_eq!(Err(RtspParseError::BadProtocol), result);
    }

    #[test]
    fn rejects_bad_version() {
        let mut parser = RtspParser::new();
        let result = parse_all(&mut parser, b"DESCRIBE /p RTSP/2.0\r\n\r\n");
        assert_eq!(Err(RtspParseError::BadVersion), result);
    }

    #[test]
    fn rejects_bad_status_code() {
        let mut parser = RtspParser::new();
        let result = parse_all(&mut parser, b"RTSP/1.0 20x OK\r\n\r\n");
        assert_eq!(Err(RtspParseError::BadStatusCode), result);
    }

    #[test]
    fn rejects_leading_blank_line() {
        let mut parser = RtspParser::new();
        let result = parse_all(&mut parser, b"\r\nOPTIONS / RTSP/1.0\r\n\r\n");
        assert_eq!(Err(RtspParseError::UnexpectedBlankLine), result);
    }

    #[test]
    fn rejects_bad_header() {
        let mut parser = RtspParser::new();
        let result = parse_all(&mut parser, b"OPTIONS / RTSP/1.0\r\nBad Header: x\r\n\r\n");
        assert_eq!(Err(RtspParseError::BadHeader), result);
    }

    #[test]
    fn roundtrips_encoded_request() {
        let mut request = RtspRequest::new("ANNOUNCE", "rtsp://host:5005/by-name/session");
        request.headers.set("CSeq", "7");
        request.headers.set("Content-Type", "application/sdp");
        request.data = "v=0\r\ns=test\r\n".to_owned();

        let mut parser = RtspParser::new();
        let messages = parse_all(&mut parser, request.encode().as_bytes()).expect("parse");
        assert_eq!(1, messages.len());
        match &messages[0] {
            RtspMessage::Request(parsed) => {
                assert_eq!(request.method, parsed.method);
                assert_eq!(request.uri, parsed.uri);
                assert_eq!(request.data, parsed.data);
                assert_eq!("7", parsed.headers.get("CSeq"));
                assert_eq!("application/sdp", parsed.headers.get("Content-Type"));
                assert_eq!(Some(request.data.len()), parsed.headers.content_length());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
