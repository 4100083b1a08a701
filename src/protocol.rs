//! AMI wire protocol parsing and frame handling.
//!
//! The manager protocol opens with a one-line version banner
//! (`Asterisk Call Manager/9.0.0`) and then exchanges frames: blocks of
//! `Key: Value` lines terminated by a blank line. A frame with an `Event`
//! key is an unsolicited event; a frame with a `Response` key is the reply
//! to an in-flight action.

use crate::{
    action::Fields,
    constants::{
        BANNER_PREFIX, BLOCK_TERMINATOR, KEY_EVENT, KEY_RESPONSE, MAX_BUFFER_SIZE,
        MAX_MESSAGE_SIZE,
    },
    error::{AmiError, AmiResult},
};

/// AMI frame types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Version banner line sent once at connect time.
    Banner,
    /// Reply to an action (`Response: …`).
    Response,
    /// Unsolicited event (`Event: …`).
    Event,
    /// Frame with neither key. Logged and skipped by the connection.
    Unknown,
}

/// Parsed AMI frame
#[derive(Debug, Clone)]
pub struct AmiFrame {
    /// Frame classification.
    pub kind: FrameKind,
    /// Ordered frame fields (duplicates preserved).
    pub fields: Fields,
    /// Banner text, set only for [`FrameKind::Banner`].
    pub banner: Option<String>,
}

/// Parser state for handling incomplete input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Waiting for the greeting line.
    AwaitingBanner,
    /// Waiting for the next blank-line-terminated block.
    AwaitingBlock,
}

/// Incremental AMI protocol parser.
///
/// Feed raw socket bytes with [`add_data`](Self::add_data) and drain
/// complete frames with [`parse_frame`](Self::parse_frame).
pub struct AmiParser {
    buffer: Vec<u8>,
    state: ParseState,
}

impl AmiParser {
    /// Create a new parser expecting the version banner first.
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            state: ParseState::AwaitingBanner,
        }
    }

    /// Create a parser that skips banner handling (for already-greeted
    /// streams, e.g. in tests).
    pub fn without_banner() -> Self {
        Self {
            buffer: Vec::new(),
            state: ParseState::AwaitingBlock,
        }
    }

    /// Add data to the parser buffer.
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > MAX_BUFFER_SIZE {
            return Err(AmiError::BufferOverflow {
                size: self.buffer.len(),
                limit: MAX_BUFFER_SIZE,
            });
        }
        Ok(())
    }

    /// Try to parse one complete frame from the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn parse_frame(&mut self) -> AmiResult<Option<AmiFrame>> {
        match self.state {
            ParseState::AwaitingBanner => {
                let Some(line) = self.extract_line() else {
                    return Ok(None);
                };
                let text = String::from_utf8(line)
                    .map_err(|_| AmiError::protocol_error("Invalid UTF-8 in banner"))?;
                if !text.starts_with(BANNER_PREFIX) {
                    return Err(AmiError::protocol_error(format!(
                        "Unexpected greeting line: {}",
                        text
                    )));
                }
                self.state = ParseState::AwaitingBlock;
                Ok(Some(AmiFrame {
                    kind: FrameKind::Banner,
                    fields: Fields::new(),
                    banner: Some(text),
                }))
            }
            ParseState::AwaitingBlock => {
                let Some(block) = self.extract_block()? else {
                    return Ok(None);
                };
                let text = String::from_utf8(block)
                    .map_err(|_| AmiError::protocol_error("Invalid UTF-8 in frame"))?;
                let fields = parse_block(&text)?;

                let kind = if fields.get(KEY_EVENT).is_some() {
                    FrameKind::Event
                } else if fields.get(KEY_RESPONSE).is_some() {
                    FrameKind::Response
                } else {
                    FrameKind::Unknown
                };

                Ok(Some(AmiFrame {
                    kind,
                    fields,
                    banner: None,
                }))
            }
        }
    }

    /// Extract one `\n`-terminated line, stripping the terminator (and a
    /// trailing `\r` if present). Returns `None` if no full line yet.
    fn extract_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop(); // '\n'
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Extract one blank-line-terminated block, stripping the terminator.
    ///
    /// Accepts both `\r\n\r\n` and bare `\n\n` framing. Enforces the
    /// per-frame size limit before a terminator is even found, so a peer
    /// cannot stall the parser with an endless unterminated frame.
    fn extract_block(&mut self) -> AmiResult<Option<Vec<u8>>> {
        if let Some((end, term_len)) = find_block_terminator(&self.buffer) {
            if end > MAX_MESSAGE_SIZE {
                return Err(AmiError::protocol_error(format!(
                    "Frame too large: {} bytes exceeds limit {}",
                    end, MAX_MESSAGE_SIZE
                )));
            }
            let block: Vec<u8> = self.buffer.drain(..end).collect();
            self.buffer.drain(..term_len);
            Ok(Some(block))
        } else {
            if self.buffer.len() > MAX_MESSAGE_SIZE {
                return Err(AmiError::protocol_error(format!(
                    "Unterminated frame exceeds limit {}",
                    MAX_MESSAGE_SIZE
                )));
            }
            Ok(None)
        }
    }
}

impl Default for AmiParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Locate the first blank line, returning (offset, terminator length).
fn find_block_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf
        .windows(4)
        .position(|w| w == BLOCK_TERMINATOR.as_bytes())
        .map(|p| (p, 4usize));
    let lf = buf
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|p| (p, 2usize));
    match (crlf, lf) {
        (Some((a, al)), Some((b, bl))) => {
            // "\r\n\r\n" contains "\n\n" at offset +1; prefer whichever
            // terminator starts first, CRLF winning ties.
            if a <= b + 1 {
                Some((a, al))
            } else {
                Some((b, bl))
            }
        }
        (Some(t), None) | (None, Some(t)) => Some(t),
        (None, None) => None,
    }
}

/// Parse a frame body into ordered fields.
///
/// Every non-empty line must be `Key: Value`. A colon-less line means the
/// stream has desynced (or the peer speaks a dialect with raw payload
/// lines, which this client does not support) and is surfaced as an error
/// so the connection gets dropped rather than misparsed.
fn parse_block(text: &str) -> AmiResult<Fields> {
    let mut fields = Fields::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        match line.find(':') {
            Some(pos) => {
                let key = line[..pos].trim();
                let value = line[pos + 1..].trim();
                fields.push(key, value);
            }
            None => {
                return Err(AmiError::InvalidLine {
                    line: line.to_string(),
                })
            }
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_banner() {
        let mut parser = AmiParser::new();
        parser
            .add_data(b"Asterisk Call Manager/9.0.0\r\n")
            .unwrap();
        let frame = parser.parse_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Banner);
        assert_eq!(
            frame.banner.as_deref(),
            Some("Asterisk Call Manager/9.0.0")
        );
    }

    #[test]
    fn test_unexpected_banner_rejected() {
        let mut parser = AmiParser::new();
        parser.add_data(b"HTTP/1.1 400 Bad Request\r\n").unwrap();
        assert!(parser.parse_frame().is_err());
    }

    #[test]
    fn test_parse_response_frame() {
        let mut parser = AmiParser::without_banner();
        parser
            .add_data(b"Response: Success\r\nActionID: abc\r\nMessage: Authentication accepted\r\n\r\n")
            .unwrap();
        let frame = parser.parse_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Response);
        assert_eq!(frame.fields.get("Response"), Some("Success"));
        assert_eq!(frame.fields.get("ActionID"), Some("abc"));
        assert_eq!(
            frame.fields.get("Message"),
            Some("Authentication accepted")
        );
    }

    #[test]
    fn test_parse_event_frame() {
        let mut parser = AmiParser::without_banner();
        parser
            .add_data(b"Event: Hangup\r\nChannel: PJSIP/1000-00000001\r\nCause: 17\r\n\r\n")
            .unwrap();
        let frame = parser.parse_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Event);
        assert_eq!(frame.fields.get("Event"), Some("Hangup"));
        assert_eq!(frame.fields.get("Cause"), Some("17"));
    }

    #[test]
    fn test_incomplete_frame_returns_none() {
        let mut parser = AmiParser::without_banner();
        parser.add_data(b"Response: Success\r\nAction").unwrap();
        assert!(parser.parse_frame().unwrap().is_none());

        // Completing the frame yields it.
        parser.add_data(b"ID: x\r\n\r\n").unwrap();
        let frame = parser.parse_frame().unwrap().unwrap();
        assert_eq!(frame.fields.get("ActionID"), Some("x"));
    }

    #[test]
    fn test_bare_lf_framing_accepted() {
        let mut parser = AmiParser::without_banner();
        parser
            .add_data(b"Event: Newchannel\nChannel: PJSIP/1000-0a\n\n")
            .unwrap();
        let frame = parser.parse_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Event);
        assert_eq!(frame.fields.get("Channel"), Some("PJSIP/1000-0a"));
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut parser = AmiParser::without_banner();
        parser
            .add_data(b"Event: DialBegin\r\n\r\nEvent: DialEnd\r\n\r\n")
            .unwrap();
        let first = parser.parse_frame().unwrap().unwrap();
        let second = parser.parse_frame().unwrap().unwrap();
        assert_eq!(first.fields.get("Event"), Some("DialBegin"));
        assert_eq!(second.fields.get("Event"), Some("DialEnd"));
        assert!(parser.parse_frame().unwrap().is_none());
    }

    #[test]
    fn test_duplicate_keys_preserved_in_order() {
        let mut parser = AmiParser::without_banner();
        parser
            .add_data(b"Event: VarSet\r\nVariable: a=1\r\nVariable: b=2\r\n\r\n")
            .unwrap();
        let frame = parser.parse_frame().unwrap().unwrap();
        let all: Vec<_> = frame.fields.get_all("Variable").collect();
        assert_eq!(all, vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_colonless_line_is_desync() {
        let mut parser = AmiParser::without_banner();
        parser
            .add_data(b"Response: Follows\r\nraw command output\r\n\r\n")
            .unwrap();
        assert!(parser.parse_frame().is_err());
    }

    #[test]
    fn test_frame_without_known_key_is_unknown() {
        let mut parser = AmiParser::without_banner();
        parser.add_data(b"Something: else\r\n\r\n").unwrap();
        let frame = parser.parse_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Unknown);
    }

    #[test]
    fn test_oversized_unterminated_frame_rejected() {
        let mut parser = AmiParser::without_banner();
        let line = b"Key: value\r\n".repeat(MAX_MESSAGE_SIZE / 12 + 2);
        parser.add_data(&line).unwrap();
        assert!(parser.parse_frame().is_err());
    }

    #[test]
    fn test_banner_then_frame() {
        let mut parser = AmiParser::new();
        parser
            .add_data(b"Asterisk Call Manager/7.0.3\r\nResponse: Success\r\n\r\n")
            .unwrap();
        let banner = parser.parse_frame().unwrap().unwrap();
        assert_eq!(banner.kind, FrameKind::Banner);
        let frame = parser.parse_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Response);
    }
}
