use smol_str::SmolStr;

use crate::headers::HeaderError;

/// Typed view of one Via header value (RFC 3261 §20.42).
///
/// ```text
/// Via: SIP/2.0/UDP pc33.example.com:5060;branch=z9hG4bK776asdhds;received=192.0.2.1
/// ```
///
/// Parameter order is preserved so a round-trip through [`Via::parse`] and
/// [`std::fmt::Display`] reproduces the original value byte for byte
/// (modulo surrounding whitespace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    /// Transport token from the sent-protocol, e.g. `UDP` or `TCP`.
    pub transport: SmolStr,
    /// Host part of sent-by. IPv6 references keep their brackets.
    pub host: SmolStr,
    /// Optional port part of sent-by.
    pub port: Option<u16>,
    /// Ordered parameters; `None` value means a flag parameter (`;rport`).
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl Via {
    /// Builds a minimal Via for outbound requests.
    pub fn new(transport: impl Into<SmolStr>, host: impl Into<SmolStr>, port: Option<u16>) -> Self {
        Self {
            transport: transport.into(),
            host: host.into(),
            port,
            params: Vec::new(),
        }
    }

    /// Parses a single Via value.
    pub fn parse(value: &str) -> Result<Self, HeaderError> {
        let malformed = || HeaderError::Via(SmolStr::new(value));
        let value = value.trim();

        let mut parts = value.splitn(2, char::is_whitespace);
        let protocol = parts.next().ok_or_else(malformed)?;
        let rest = parts.next().ok_or_else(malformed)?.trim_start();

        // sent-protocol = "SIP" "/" "2.0" "/" transport
        let mut protocol_parts = protocol.split('/');
        let name = protocol_parts.next().ok_or_else(malformed)?;
        let version = protocol_parts.next().ok_or_else(malformed)?;
        let transport = protocol_parts.next().ok_or_else(malformed)?;
        if !name.eq_ignore_ascii_case("SIP") || version != "2.0" || transport.is_empty() {
            return Err(malformed());
        }
        if protocol_parts.next().is_some() {
            return Err(malformed());
        }

        let mut segments = rest.split(';');
        let sent_by = segments.next().ok_or_else(malformed)?.trim();
        let (host, port) = parse_sent_by(sent_by).ok_or_else(malformed)?;

        let mut params = Vec::new();
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(malformed());
            }
            match segment.split_once('=') {
                Some((name, param_value)) => params.push((
                    SmolStr::new(name.trim()),
                    Some(SmolStr::new(param_value.trim())),
                )),
                None => params.push((SmolStr::new(segment), None)),
            }
        }

        Ok(Via {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            host: SmolStr::new(host),
            port,
            params,
        })
    }

    /// Returns the value of a parameter, with `Some("")` for flag params.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    /// Returns `true` if the parameter is present, valued or not.
    pub fn has_param(&self, name: &str) -> bool {
        self.params
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Sets or replaces a parameter, keeping its position if already present.
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

    /// Returns the branch parameter value.
    pub fn branch(&self) -> Option<&str> {
        self.param("branch").filter(|b| !b.is_empty())
    }

    /// Returns the `received` parameter value.
    pub fn received(&self) -> Option<&str> {
        self.param("received").filter(|r| !r.is_empty())
    }

    /// Returns the `rport` value: `None` when absent, `Some(None)` for the
    /// empty request form, `Some(Some(port))` once filled by the server.
    pub fn rport(&self) -> Option<Option<u16>> {
        if !self.has_param("rport") {
            return None;
        }
        Some(self.param("rport").and_then(|v| v.parse().ok()))
    }

    /// Renders the sent-by part (`host` or `host:port`).
    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.to_string(),
        }
    }
}

fn parse_sent_by(sent_by: &str) -> Option<(&str, Option<u16>)> {
    if sent_by.is_empty() {
        return None;
    }
    if let Some(end) = sent_by.find(']') {
        // IPv6 reference: keep the brackets as part of the host.
        if !sent_by.starts_with('[') {
            return None;
        }
        let host = &sent_by[..=end];
        let rest = &sent_by[end + 1..];
        if rest.is_empty() {
            return Some((host, None));
        }
        let port = rest.strip_prefix(':')?.parse().ok()?;
        return Some((host, Some(port)));
    }
    match sent_by.split_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host, Some(port.parse().ok()?))),
        Some(_) => None,
        None => Some((sent_by, None)),
    }
}

impl std::fmt::Display for Via {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by())?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}
