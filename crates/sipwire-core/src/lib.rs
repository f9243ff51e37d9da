// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types: messages, headers, methods, and URIs.
//!
//! This crate provides the value types shared by the rest of the stack:
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **Headers**: the ordered [`Headers`] container plus typed views
//!   ([`Via`], [`NameAddr`], [`CSeq`])
//! - **Methods**: the [`Method`] enum
//! - **URIs**: [`SipUri`], enough of RFC 3261 §19.1 for routing decisions
//!
//! Header names and values are stored as [`SmolStr`](smol_str::SmolStr) and
//! bodies as [`Bytes`](bytes::Bytes). A message is a plain owned value;
//! once handed to the transaction layer it is treated as immutable.

pub mod cseq;
pub mod headers;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod uri;
pub mod version;
pub mod via;

pub use cseq::CSeq;
pub use headers::{Header, HeaderError, Headers};
pub use method::Method;
pub use msg::{Request, RequestLine, Response, SipMessage, StatusLine};
pub use name_addr::NameAddr;
pub use uri::SipUri;
pub use version::SipVersion;
pub use via::Via;

/// Magic cookie that prefixes every RFC-3261-compliant Via branch.
pub const MAGIC_COOKIE: &str = "z9hG4bK";
