use smol_str::SmolStr;

use crate::{headers::HeaderError, uri::SipUri};

/// Typed view of an address header (From, To, Contact): an optional display
/// name, a URI, and header parameters such as `tag`.
///
/// Accepts both the name-addr form (`"Alice" <sip:alice@example.com>;tag=x`)
/// and the bare addr-spec form (`sip:alice@example.com;tag=x`). In the
/// addr-spec form everything after the first `;` is treated as header
/// parameters, per RFC 3261 §20.10.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<SmolStr>,
    pub uri: SipUri,
    /// Ordered header parameters; `None` value means a flag parameter.
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl NameAddr {
    /// Wraps a URI with no display name and no parameters.
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    /// Parses a name-addr or addr-spec value.
    pub fn parse(value: &str) -> Result<Self, HeaderError> {
        let malformed = || HeaderError::Address(SmolStr::new(value));
        let value = value.trim();

        if let Some(open) = value.find('<') {
            let close = value[open..].find('>').ok_or_else(malformed)? + open;
            let display = value[..open].trim();
            let display_name = if display.is_empty() {
                None
            } else {
                Some(SmolStr::new(display.trim_matches('"')))
            };
            let uri = SipUri::parse(&value[open + 1..close])?;
            let params = parse_params(value[close + 1..].trim())?;
            return Ok(NameAddr {
                display_name,
                uri,
                params,
            });
        }

        // addr-spec form: header params start at the first semicolon.
        let (spec, rest) = match value.split_once(';') {
            Some((spec, rest)) => (spec, Some(rest)),
            None => (value, None),
        };
        let uri = SipUri::parse(spec)?;
        let params = match rest {
            Some(rest) => parse_params(&format!(";{}", rest))?,
            None => Vec::new(),
        };
        Ok(NameAddr {
            display_name: None,
            uri,
            params,
        })
    }

    /// Returns the value of a header parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    /// Returns the `tag` parameter value.
    pub fn tag(&self) -> Option<&str> {
        self.param("tag").filter(|t| !t.is_empty())
    }

    /// Sets or replaces a header parameter.
    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(SmolStr::new);
        match self
            .params
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value,
            None => self.params.push((SmolStr::new(name), value)),
        }
    }
}

fn parse_params(rest: &str) -> Result<Vec<(SmolStr, Option<SmolStr>)>, HeaderError> {
    let mut params = Vec::new();
    if rest.is_empty() {
        return Ok(params);
    }
    let rest = rest
        .strip_prefix(';')
        .ok_or_else(|| HeaderError::Address(SmolStr::new(rest)))?;
    for segment in rest.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(HeaderError::Address(SmolStr::new(rest)));
        }
        match segment.split_once('=') {
            Some((name, value)) => params.push((
                SmolStr::new(name.trim()),
                Some(SmolStr::new(value.trim())),
            )),
            None => params.push((SmolStr::new(segment), None)),
        }
    }
    Ok(params)
}

impl std::fmt::Display for NameAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}
