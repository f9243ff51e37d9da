use std::slice::{Iter, IterMut};

use smol_str::SmolStr;
use thiserror::Error;

use crate::{cseq::CSeq, name_addr::NameAddr, via::Via};

/// A single SIP header field as a name/value pair.
///
/// Values are kept verbatim as received; typed views are parsed on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmolStr,
    pub value: SmolStr,
}

/// Error produced when a typed view cannot be parsed from a header value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("malformed Via value: {0}")]
    Via(SmolStr),
    #[error("malformed address value: {0}")]
    Address(SmolStr),
    #[error("malformed URI: {0}")]
    Uri(SmolStr),
    #[error("malformed CSeq value: {0}")]
    CSeq(SmolStr),
}

/// Ordered collection of SIP headers.
///
/// Insertion order is preserved: Via ordering is load-bearing for routing
/// and transaction matching, so headers never get re-sorted or merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a header collection from the given vector without cloning.
    pub fn from_vec(headers: Vec<Header>) -> Self {
        Self(headers)
    }

    /// Appends a header to the collection.
    pub fn push(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replaces the first header with the given name, appending if absent.
    pub fn set(&mut self, name: &str, value: impl Into<SmolStr>) {
        match self
            .0
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(name))
        {
            Some(header) => header.value = value.into(),
            None => self.push(SmolStr::new(name), value),
        }
    }

    /// Removes every header with the given name.
    pub fn remove_all(&mut self, name: &str) {
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    /// Returns an iterator over the stored headers.
    pub fn iter(&self) -> Iter<'_, Header> {
        self.0.iter()
    }

    /// Returns a mutable iterator over the stored headers.
    pub fn iter_mut(&mut self) -> IterMut<'_, Header> {
        self.0.iter_mut()
    }

    /// Returns the number of headers present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when the collection contains no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Finds the first header whose name matches ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&SmolStr> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// Returns all values for the given name, preserving original order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SmolStr> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// Consumes the collection returning the underlying vector.
    pub fn into_inner(self) -> Vec<Header> {
        self.0
    }
}

/// Typed accessors for the headers the transaction and transport layers need.
impl Headers {
    /// Parses the top-most Via header value, if present and well-formed.
    ///
    /// A single Via header line may carry several comma-separated values;
    /// only the first one is the "top" Via.
    pub fn top_via(&self) -> Option<Via> {
        let value = self.get("Via")?;
        Via::parse(first_list_element(value)).ok()
    }

    /// Parses every Via value in received order, skipping malformed ones.
    pub fn vias(&self) -> Vec<Via> {
        self.get_all("Via")
            .flat_map(|value| split_list(value))
            .filter_map(|v| Via::parse(v).ok())
            .collect()
    }

    /// Rewrites the top-most Via header value.
    pub fn set_top_via(&mut self, via: &Via) {
        let rendered = via.to_string();
        if let Some(header) = self
            .0
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case("Via"))
        {
            let joined = {
                let mut elements = split_list(header.value.as_str());
                if elements.is_empty() {
                    rendered.clone()
                } else {
                    elements[0] = rendered.as_str();
                    elements.join(", ")
                }
            };
            header.value = SmolStr::new(joined);
        } else {
            self.push("Via", rendered);
        }
    }

    /// Parses the From header as a name-addr.
    pub fn from_header(&self) -> Option<NameAddr> {
        NameAddr::parse(self.get("From")?).ok()
    }

    /// Parses the To header as a name-addr.
    pub fn to_header(&self) -> Option<NameAddr> {
        NameAddr::parse(self.get("To")?).ok()
    }

    /// Parses the first Contact header as a name-addr.
    pub fn contact(&self) -> Option<NameAddr> {
        NameAddr::parse(first_list_element(self.get("Contact")?)).ok()
    }

    /// Returns the Call-ID value verbatim.
    pub fn call_id(&self) -> Option<&SmolStr> {
        self.get("Call-ID")
    }

    /// Parses the CSeq header.
    pub fn cseq(&self) -> Option<CSeq> {
        self.get("CSeq")?.parse().ok()
    }

    /// Parses the Content-Length header as a byte count.
    pub fn content_length(&self) -> Option<usize> {
        self.get("Content-Length")?.trim().parse().ok()
    }
}

/// Splits a comma-separated header value at the top level.
///
/// Commas inside quoted strings (display names) and angle brackets are not
/// separators.
pub(crate) fn split_list(value: &str) -> Vec<&str> {
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

fn first_list_element(value: &str) -> &str {
    split_list(value).first().copied().unwrap_or("")
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut h = Headers::new();
        for (name, value) in pairs {
            h.push(*name, *value);
        }
        h
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let h = headers(&[("Call-ID", "abc@host")]);
        assert_eq!(h.get("call-id").unwrap().as_str(), "abc@host");
    }

    #[test]
    fn preserves_via_order() {
        let h = headers(&[
            ("Via", "SIP/2.0/UDP one.example.com;branch=z9hG4bKaaa"),
            ("Via", "SIP/2.0/UDP two.example.com;branch=z9hG4bKbbb"),
        ]);
        let vias = h.vias();
        assert_eq!(vias.len(), 2);
        assert_eq!(vias[0].host.as_str(), "one.example.com");
        assert_eq!(vias[1].host.as_str(), "two.example.com");
    }

    #[test]
    fn top_via_takes_first_list_element() {
        let h = headers(&[(
            "Via",
            "SIP/2.0/UDP one.example.com;branch=z9hG4bKaaa, SIP/2.0/TCP two.example.com;branch=z9hG4bKbbb",
        )]);
        let via = h.top_via().unwrap();
        assert_eq!(via.host.as_str(), "one.example.com");
        assert_eq!(h.vias().len(), 2);
    }

    #[test]
    fn set_top_via_keeps_the_rest_of_the_stack() {
        let mut h = headers(&[(
            "Via",
            "SIP/2.0/UDP one.example.com;branch=z9hG4bKaaa, SIP/2.0/TCP two.example.com;branch=z9hG4bKbbb",
        )]);
        let mut via = h.top_via().unwrap();
        via.set_param("received", Some("192.0.2.7"));
        h.set_top_via(&via);

        let vias = h.vias();
        assert_eq!(vias.len(), 2);
        assert_eq!(vias[0].param("received"), Some("192.0.2.7"));
        assert_eq!(vias[1].host.as_str(), "two.example.com");
    }

    #[test]
    fn split_list_respects_quotes_and_brackets() {
        let parts = split_list(r#""Doe, Jane" <sip:jane@example.com>, <sip:bob@example.com>"#);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].contains("Doe, Jane"));
    }

    #[test]
    fn cseq_accessor() {
        let h = headers(&[("CSeq", "314159 INVITE")]);
        let cseq = h.cseq().unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, crate::Method::Invite);
    }

    #[test]
    fn content_length_accessor() {
        let h = headers(&[("Content-Length", " 42 ")]);
        assert_eq!(h.content_length(), Some(42));
    }
}
