// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{
    cseq::CSeq, headers::Headers, method::Method, name_addr::NameAddr, uri::SipUri,
    version::SipVersion, via::Via,
};

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    uri: SipUri,
    version: SipVersion,
}

impl RequestLine {
    /// Creates a request line for the given method and target URI.
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            version: SipVersion::V2,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &SipUri {
        &self.uri
    }

    pub fn version(&self) -> &SipVersion {
        &self.version
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    version: SipVersion,
    code: u16,
    reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line with the provided code and reason phrase.
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            version: SipVersion::V2,
            code,
            reason: reason.into(),
        }
    }

    pub fn version(&self) -> &SipVersion {
        &self.version
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A SIP request: request line, ordered headers, body.
///
/// Logically immutable once handed to the transaction layer; the mutable
/// header access exists for the outbound preparation step that runs before
/// handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    start: RequestLine,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Builds a request from its components.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    pub fn start_line(&self) -> &RequestLine {
        &self.start
    }

    pub fn method(&self) -> &Method {
        self.start.method()
    }

    pub fn uri(&self) -> &SipUri {
        self.start.uri()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }
}

/// A SIP response: status line, ordered headers, body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    start: StatusLine,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Builds a response from its components.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Builds a response to `req`, copying the headers a response must echo:
    /// the full Via stack, From, To, Call-ID and CSeq (RFC 3261 §8.2.6.2).
    pub fn from_request(req: &Request, code: u16, reason: impl Into<SmolStr>) -> Self {
        let mut headers = Headers::new();
        for header in req.headers().iter() {
            if ["Via", "From", "To", "Call-ID", "CSeq"]
                .iter()
                .any(|name| header.name.eq_ignore_ascii_case(name))
            {
                headers.push(header.name.clone(), header.value.clone());
            }
        }
        Self {
            start: StatusLine::new(code, reason),
            headers,
            body: Bytes::new(),
        }
    }

    pub fn start_line(&self) -> &StatusLine {
        &self.start
    }

    pub fn code(&self) -> u16 {
        self.start.code()
    }

    pub fn reason(&self) -> &str {
        self.start.reason()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// Returns true for 1xx responses.
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code())
    }

    /// Returns true for 2xx–6xx responses.
    pub fn is_final(&self) -> bool {
        self.code() >= 200
    }

    /// Returns true for 2xx responses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code())
    }
}

/// Either a SIP request or a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => req.headers(),
            Self::Response(res) => res.headers(),
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Self::Request(req) => req.headers_mut(),
            Self::Response(res) => res.headers_mut(),
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Self::Request(req) => req.body(),
            Self::Response(res) => res.body(),
        }
    }

    /// One-line summary for logs, e.g. `INVITE sip:bob@example.com` or
    /// `200 OK (CSeq 1 INVITE)`.
    pub fn short(&self) -> String {
        match self {
            Self::Request(req) => format!("{} {}", req.method(), req.uri()),
            Self::Response(res) => match res.headers().cseq() {
                Some(cseq) => format!("{} {} (CSeq {})", res.code(), res.reason(), cseq),
                None => format!("{} {}", res.code(), res.reason()),
            },
        }
    }
}

/// Accessors shared by both message kinds.
macro_rules! header_accessors {
    ($ty:ty) => {
        impl $ty {
            /// Parses the top-most Via header value.
            pub fn top_via(&self) -> Option<Via> {
                self.headers().top_via()
            }

            /// Parses every Via value in received order.
            pub fn vias(&self) -> Vec<Via> {
                self.headers().vias()
            }

            /// Parses the From header.
            pub fn from_header(&self) -> Option<NameAddr> {
                self.headers().from_header()
            }

            /// Parses the To header.
            pub fn to_header(&self) -> Option<NameAddr> {
                self.headers().to_header()
            }

            /// Parses the first Contact header.
            pub fn contact(&self) -> Option<NameAddr> {
                self.headers().contact()
            }

            /// Returns the Call-ID value.
            pub fn call_id(&self) -> Option<&SmolStr> {
                self.headers().call_id()
            }

            /// Parses the CSeq header.
            pub fn cseq(&self) -> Option<CSeq> {
                self.headers().cseq()
            }

            /// Parses the Content-Length header.
            pub fn content_length(&self) -> Option<usize> {
                self.headers().content_length()
            }
        }
    };
}

header_accessors!(Request);
header_accessors!(Response);
header_accessors!(SipMessage);
