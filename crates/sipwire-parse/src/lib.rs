// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message parsing and serialization.
//!
//! Two entry points cover the two framing models of RFC 3261 §18:
//! - [`parse_message`] decodes a whole datagram (UDP): the packet is the
//!   message, and a missing `Content-Length` means the body is simply the
//!   rest of the packet.
//! - [`StreamParser`] decodes a TCP byte stream incrementally: messages are
//!   framed by the CRLF-CRLF header boundary plus a mandatory
//!   `Content-Length`, and the decoder resynchronizes after malformed input
//!   by discarding up to the next plausible start line.
//!
//! Serialization normalises `Content-Length` to the actual body length so
//! retransmitted bytes always frame correctly.

use bytes::{Bytes, BytesMut};
use smol_str::SmolStr;
use thiserror::Error;

use sipwire_core::{
    CSeq, Headers, Method, NameAddr, Request, RequestLine, Response, SipMessage, SipUri,
    StatusLine, Via,
};

mod stream;

pub use stream::StreamParser;

/// Upper bound on the header section of a single message.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on a declared Content-Length. Larger values are treated as
/// malformed rather than allocated.
pub const MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

/// Errors produced while decoding SIP messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid start line: {0}")]
    InvalidStartLine(SmolStr),
    #[error("invalid header: {0}")]
    InvalidHeader(SmolStr),
    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(SmolStr),
    #[error("message body shorter than declared Content-Length")]
    ShortRead,
    #[error("parser stopped")]
    Stopped,
}

/// Parses one complete message from a datagram.
///
/// The body is the `Content-Length` prefix of the bytes after the blank
/// line, or all of them when the header is absent (RFC 3261 §18.3 allows
/// that on datagram transports only).
pub fn parse_message(datagram: &[u8]) -> Result<SipMessage, ParseError> {
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut message = parse_head(head)?;

    let body = match message.headers().content_length() {
        Some(declared) => {
            if declared > body_bytes.len() {
                return Err(ParseError::ShortRead);
            }
            Bytes::copy_from_slice(&body_bytes[..declared])
        }
        None => Bytes::copy_from_slice(body_bytes),
    };
    match &mut message {
        SipMessage::Request(req) => req.set_body(body),
        SipMessage::Response(res) => res.set_body(body),
    }
    Ok(message)
}

/// Serializes a request, normalising Content-Length and defaulting
/// Max-Forwards to 70 when the caller did not set one.
pub fn serialize_request(req: &Request) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();

    let _ = write!(
        buf,
        "{} {} {}\r\n",
        req.method().as_str(),
        req.uri(),
        req.start_line().version()
    );

    let mut has_max_forwards = false;
    for header in req.headers().iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        if header.name.eq_ignore_ascii_case("Max-Forwards") {
            has_max_forwards = true;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value);
    }
    if !has_max_forwards {
        buf.push_str("Max-Forwards: 70\r\n");
    }
    let _ = write!(buf, "Content-Length: {}\r\n\r\n", req.body().len());

    let mut out = BytesMut::with_capacity(buf.len() + req.body().len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(req.body());
    out.freeze()
}

/// Serializes a response, normalising Content-Length.
pub fn serialize_response(res: &Response) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();

    let _ = write!(
        buf,
        "{} {} {}\r\n",
        res.start_line().version(),
        res.code(),
        res.reason()
    );
    for header in res.headers().iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value);
    }
    let _ = write!(buf, "Content-Length: {}\r\n\r\n", res.body().len());

    let mut out = BytesMut::with_capacity(buf.len() + res.body().len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(res.body());
    out.freeze()
}

/// Serializes either message kind.
pub fn serialize_message(msg: &SipMessage) -> Bytes {
    match msg {
        SipMessage::Request(req) => serialize_request(req),
        SipMessage::Response(res) => serialize_response(res),
    }
}

/// Splits raw bytes at the CRLF-CRLF boundary. Without a boundary the whole
/// input is the head (a bodyless message).
fn split_head_body(data: &[u8]) -> Result<(&str, &[u8]), ParseError> {
    const DELIM: &[u8] = b"\r\n\r\n";
    let (head_bytes, body) = match data.windows(DELIM.len()).position(|w| w == DELIM) {
        Some(pos) => (&data[..pos], &data[pos + DELIM.len()..]),
        None => (data, &data[data.len()..]),
    };
    if head_bytes.len() > MAX_HEAD_SIZE {
        return Err(ParseError::InvalidHeader(SmolStr::new(
            "header section too large",
        )));
    }
    let head = std::str::from_utf8(head_bytes)
        .map_err(|_| ParseError::InvalidHeader(SmolStr::new("non-UTF-8 header section")))?;
    Ok((head, body))
}

/// Parses the start line and header block into a bodyless message.
fn parse_head(head: &str) -> Result<SipMessage, ParseError> {
    let mut lines = head.split("\r\n");
    let first = loop {
        // Tolerate leading empty lines (stream keep-alives).
        match lines.next() {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line.trim_end(),
            None => return Err(ParseError::InvalidStartLine(SmolStr::new(""))),
        }
    };

    let headers = parse_headers(lines)?;
    validate_headers(&headers)?;

    let is_response = first
        .get(..7)
        .map(|prefix| prefix.eq_ignore_ascii_case("SIP/2.0"))
        .unwrap_or(false);
    if is_response {
        let status = parse_status_line(first)?;
        return Ok(SipMessage::Response(Response::new(
            status,
            headers,
            Bytes::new(),
        )));
    }
    let request_line = parse_request_line(first)?;
    Ok(SipMessage::Request(Request::new(
        request_line,
        headers,
        Bytes::new(),
    )))
}

/// Parses `METHOD SP URI SP SIP/2.0` with nom.
fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let malformed = || ParseError::InvalidStartLine(SmolStr::new(line));
    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<&str>>(is_token_char),
        space1::<_, nom::error::Error<&str>>,
        take_while1::<_, _, nom::error::Error<&str>>(|c: char| !c.is_whitespace()),
        space1::<_, nom::error::Error<&str>>,
        rest::<_, nom::error::Error<&str>>,
    ));
    let (_, (method_token, _, uri_token, _, version)) = parser(line).map_err(|_| malformed())?;

    if !version.trim().eq_ignore_ascii_case("SIP/2.0") {
        return Err(malformed());
    }
    let uri = SipUri::parse(uri_token).map_err(|_| malformed())?;
    Ok(RequestLine::new(Method::from_token(method_token), uri))
}

/// Parses `SIP/2.0 SP code SP reason` with nom.
fn parse_status_line(line: &str) -> Result<StatusLine, ParseError> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let malformed = || ParseError::InvalidStartLine(SmolStr::new(line));
    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<&str>>("SIP/2.0"),
        space1::<_, nom::error::Error<&str>>,
        nom_u16::<_, nom::error::Error<&str>>,
        space1::<_, nom::error::Error<&str>>,
        rest::<_, nom::error::Error<&str>>,
    ));
    let (_, (_, _, code, _, reason)) = parser(line).map_err(|_| malformed())?;
    if !(100..700).contains(&code) {
        return Err(malformed());
    }
    Ok(StatusLine::new(code, reason.trim()))
}

/// Parses header lines, applying RFC 3261 §7.3.1 line folding: a line that
/// begins with SP or HTAB continues the previous header value.
fn parse_headers<'a, I>(lines: I) -> Result<Headers, ParseError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers: Vec<(SmolStr, String)> = Vec::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                    continue;
                }
                None => return Err(ParseError::InvalidHeader(SmolStr::new(line))),
            }
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::InvalidHeader(SmolStr::new(line)))?;
        let name = name.trim();
        if name.is_empty() || !name.chars().all(is_token_char) {
            return Err(ParseError::InvalidHeader(SmolStr::new(line)));
        }
        headers.push((canonical_header_name(name), value.trim().to_owned()));
    }

    let mut out = Headers::new();
    for (name, value) in headers {
        out.push(name, value);
    }
    Ok(out)
}

/// Eagerly validates the headers the transaction layer depends on. Other
/// headers, known or not, are preserved verbatim.
fn validate_headers(headers: &Headers) -> Result<(), ParseError> {
    for via in headers.get_all("Via") {
        for element in split_header_list(via) {
            Via::parse(element).map_err(|_| ParseError::InvalidHeader(via.clone()))?;
        }
    }
    for name in ["From", "To"] {
        if let Some(value) = headers.get(name) {
            NameAddr::parse(value).map_err(|_| ParseError::InvalidHeader(value.clone()))?;
        }
    }
    if let Some(value) = headers.get("Contact") {
        // A Contact of `*` is legal on REGISTER.
        if value.trim() != "*" {
            for element in split_header_list(value) {
                NameAddr::parse(element).map_err(|_| ParseError::InvalidHeader(value.clone()))?;
            }
        }
    }
    if let Some(value) = headers.get("CSeq") {
        value
            .parse::<CSeq>()
            .map_err(|_| ParseError::InvalidHeader(value.clone()))?;
    }
    if let Some(value) = headers.get("Content-Length") {
        let declared: usize = value
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidContentLength(value.clone()))?;
        if declared > MAX_CONTENT_LENGTH {
            return Err(ParseError::InvalidContentLength(value.clone()));
        }
    }
    for name in ["Max-Forwards", "Expires"] {
        if let Some(value) = headers.get(name) {
            value
                .trim()
                .parse::<u32>()
                .map_err(|_| ParseError::InvalidHeader(value.clone()))?;
        }
    }
    Ok(())
}

/// Comma-splitting shared with the typed accessors; quotes and angle
/// brackets protect embedded commas.
fn split_header_list(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0usize;
    for (idx, ch) in value.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                parts.push(value[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(value[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

fn canonical_header_name(name: &str) -> SmolStr {
    let canonical = match name.to_ascii_lowercase().as_str() {
        "i" => "Call-ID",
        "f" => "From",
        "t" => "To",
        "m" => "Contact",
        "l" => "Content-Length",
        "s" => "Subject",
        "k" => "Supported",
        "e" => "Content-Encoding",
        "c" => "Content-Type",
        "v" => "Via",
        _ => name,
    };
    SmolStr::new(canonical)
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '.' | '!' | '%' | '*' | '_' | '+' | '`' | '\'' | '~'
        )
}
