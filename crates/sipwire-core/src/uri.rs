use smol_str::SmolStr;

use crate::headers::HeaderError;

/// SIP URI (RFC 3261 §19.1), parsed far enough for first-hop routing:
/// scheme, user, host, port and uri-parameters. URI headers (`?...`) are
/// preserved verbatim but not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    /// `sip` or `sips`.
    pub scheme: SmolStr,
    pub user: Option<SmolStr>,
    /// Host name, IPv4 literal, or bracketed IPv6 reference.
    pub host: SmolStr,
    pub port: Option<u16>,
    /// Ordered uri-parameters; `None` value means a flag parameter (`;lr`).
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
    /// Raw `?`-suffix, kept for round-tripping.
    pub headers: Option<SmolStr>,
}

impl SipUri {
    /// Builds a bare `sip:host[:port]` URI.
    pub fn new(host: impl Into<SmolStr>, port: Option<u16>) -> Self {
        Self {
            scheme: SmolStr::new("sip"),
            user: None,
            host: host.into(),
            port,
            params: Vec::new(),
            headers: None,
        }
    }

    /// Parses a SIP or SIPS URI.
    pub fn parse(value: &str) -> Result<Self, HeaderError> {
        let malformed = || HeaderError::Uri(SmolStr::new(value));
        let value = value.trim();

        let (scheme, rest) = value.split_once(':').ok_or_else(malformed)?;
        if !scheme.eq_ignore_ascii_case("sip") && !scheme.eq_ignore_ascii_case("sips") {
            return Err(malformed());
        }

        let (rest, headers) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(SmolStr::new(h))),
            None => (rest, None),
        };

        let (userinfo, hostport_params) = match rest.rsplit_once('@') {
            Some((user, tail)) => (Some(user), tail),
            None => (None, rest),
        };
        // Strip any password component; the stack never uses it.
        let user = userinfo.map(|u| SmolStr::new(u.split(':').next().unwrap_or(u)));

        let mut segments = hostport_params.split(';');
        let hostport = segments.next().ok_or_else(malformed)?;
        let (host, port) = parse_host_port(hostport).ok_or_else(malformed)?;

        let mut params = Vec::new();
        for segment in segments {
            if segment.is_empty() {
                return Err(malformed());
            }
            match segment.split_once('=') {
                Some((name, v)) => params.push((SmolStr::new(name), Some(SmolStr::new(v)))),
                None => params.push((SmolStr::new(segment), None)),
            }
        }

        Ok(SipUri {
            scheme: SmolStr::new(scheme.to_ascii_lowercase()),
            user,
            host: SmolStr::new(host),
            port,
            params,
            headers,
        })
    }

    /// Returns the value of a uri-parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    /// Returns the `;transport=` parameter value, uppercased.
    pub fn transport_param(&self) -> Option<SmolStr> {
        self.param("transport")
            .map(|t| SmolStr::new(t.to_ascii_uppercase()))
    }
}

fn parse_host_port(hostport: &str) -> Option<(&str, Option<u16>)> {
    if hostport.is_empty() {
        return None;
    }
    if let Some(end) = hostport.find(']') {
        if !hostport.starts_with('[') {
            return None;
        }
        let host = &hostport[..=end];
        let rest = &hostport[end + 1..];
        if rest.is_empty() {
            return Some((host, None));
        }
        return Some((host, Some(rest.strip_prefix(':')?.parse().ok()?)));
    }
    match hostport.split_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host, Some(port.parse().ok()?))),
        Some(_) => None,
        None => Some((hostport, None)),
    }
}

impl std::fmt::Display for SipUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}
