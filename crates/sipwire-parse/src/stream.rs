// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::{Buf, BytesMut};
use smol_str::SmolStr;
use tracing::debug;

use sipwire_core::SipMessage;

use crate::{parse_message, ParseError, MAX_CONTENT_LENGTH, MAX_HEAD_SIZE};

const HEAD_DELIMITER: &[u8] = b"\r\n\r\n";

/// Incremental decoder that recovers SIP messages from a byte stream.
///
/// Stream framing is Content-Length based: the header section ends at the
/// first CRLF-CRLF, and the body is exactly `Content-Length` bytes. A
/// missing Content-Length on a stream is a framing error (RFC 3261 §18.3),
/// unlike on datagram transports.
///
/// After a malformed frame the decoder discards input up to the next
/// plausible start line, so one bad message does not poison the
/// connection. Each call to [`next_message`](StreamParser::next_message)
/// that returns an error has already consumed the offending bytes; calling
/// again continues with the re-synchronized stream.
#[derive(Debug, Default)]
pub struct StreamParser {
    buf: BytesMut,
    stopped: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes to the decode buffer.
    pub fn feed(&mut self, data: &[u8]) {
        if !self.stopped {
            self.buf.extend_from_slice(data);
        }
    }

    /// Permanently stops the decoder; subsequent calls fail with
    /// [`ParseError::Stopped`].
    pub fn stop(&mut self) {
        self.stopped = true;
        self.buf.clear();
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode the next complete message.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Returns an error after
    /// discarding a malformed frame; decoding can continue afterwards.
    pub fn next_message(&mut self) -> Result<Option<SipMessage>, ParseError> {
        if self.stopped {
            return Err(ParseError::Stopped);
        }
        self.skip_leading_crlf();
        if self.buf.is_empty() {
            return Ok(None);
        }

        let Some(head_end) = find_delimiter(&self.buf) else {
            if self.buf.len() > MAX_HEAD_SIZE {
                self.resync();
                return Err(ParseError::InvalidHeader(SmolStr::new(
                    "header section exceeds size limit",
                )));
            }
            return Ok(None);
        };

        let head = &self.buf[..head_end];
        let declared = match content_length_of(head) {
            Ok(declared) => declared,
            Err(e) => {
                self.buf.advance(head_end + HEAD_DELIMITER.len());
                self.resync();
                return Err(e);
            }
        };

        let frame_len = head_end + HEAD_DELIMITER.len() + declared;
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let frame = self.buf.split_to(frame_len);
        match parse_message(&frame) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                // The frame is already consumed; look for the next start line.
                self.resync();
                Err(e)
            }
        }
    }

    fn skip_leading_crlf(&mut self) {
        while self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
        }
        // Bare LF keep-alives from sloppy peers.
        while self.buf.starts_with(b"\n") {
            self.buf.advance(1);
        }
    }

    /// Discards buffered lines until one that plausibly begins a message
    /// (it mentions the SIP version token).
    fn resync(&mut self) {
        loop {
            self.skip_leading_crlf();
            if self.buf.is_empty() {
                return;
            }
            let line_end = match self.buf.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                // An incomplete trailing line may still become a start line.
                None => return,
            };
            let line = &self.buf[..line_end];
            if contains_subslice(line, b"SIP/2.0") {
                debug!("stream parser re-synchronized on a start line");
                return;
            }
            self.buf.advance(line_end + 1);
        }
    }
}

/// Extracts and validates the Content-Length of a head block without fully
/// parsing it. Streams require the header to be present.
fn content_length_of(head: &[u8]) -> Result<usize, ParseError> {
    let head = std::str::from_utf8(head)
        .map_err(|_| ParseError::InvalidHeader(SmolStr::new("non-UTF-8 header section")))?;
    for line in head.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            let declared: usize = value
                .trim()
                .parse()
                .map_err(|_| ParseError::InvalidContentLength(SmolStr::new(value.trim())))?;
            if declared > MAX_CONTENT_LENGTH {
                return Err(ParseError::InvalidContentLength(SmolStr::new(value.trim())));
            }
            return Ok(declared);
        }
    }
    Err(ParseError::InvalidContentLength(SmolStr::new(
        "missing Content-Length on stream transport",
    )))
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_DELIMITER.len())
        .position(|w| w == HEAD_DELIMITER)
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
