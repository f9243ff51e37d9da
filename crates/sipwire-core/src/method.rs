use smol_str::SmolStr;

/// SIP request methods known to the stack.
///
/// Extension methods are preserved verbatim in the `Other` variant so they
/// can still key transactions and be routed to handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Update,
    Message,
    Prack,
    Refer,
    Subscribe,
    Notify,
    Publish,
    Other(SmolStr),
}

impl Method {
    /// Returns the canonical uppercase token for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Message => "MESSAGE",
            Method::Prack => "PRACK",
            Method::Refer => "REFER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Publish => "PUBLISH",
            Method::Other(token) => token.as_str(),
        }
    }

    /// Parses a method token, case-insensitively, returning `Other` for
    /// extension methods.
    pub fn from_token(token: &str) -> Self {
        match () {
            _ if token.eq_ignore_ascii_case("INVITE") => Method::Invite,
            _ if token.eq_ignore_ascii_case("ACK") => Method::Ack,
            _ if token.eq_ignore_ascii_case("BYE") => Method::Bye,
            _ if token.eq_ignore_ascii_case("CANCEL") => Method::Cancel,
            _ if token.eq_ignore_ascii_case("REGISTER") => Method::Register,
            _ if token.eq_ignore_ascii_case("OPTIONS") => Method::Options,
            _ if token.eq_ignore_ascii_case("INFO") => Method::Info,
            _ if token.eq_ignore_ascii_case("UPDATE") => Method::Update,
            _ if token.eq_ignore_ascii_case("MESSAGE") => Method::Message,
            _ if token.eq_ignore_ascii_case("PRACK") => Method::Prack,
            _ if token.eq_ignore_ascii_case("REFER") => Method::Refer,
            _ if token.eq_ignore_ascii_case("SUBSCRIBE") => Method::Subscribe,
            _ if token.eq_ignore_ascii_case("NOTIFY") => Method::Notify,
            _ if token.eq_ignore_ascii_case("PUBLISH") => Method::Publish,
            _ => Method::Other(SmolStr::new(token)),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_methods() {
        for token in ["INVITE", "ACK", "BYE", "CANCEL", "OPTIONS", "REGISTER"] {
            assert_eq!(Method::from_token(token).as_str(), token);
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Method::from_token("invite"), Method::Invite);
        assert_eq!(Method::from_token("Options"), Method::Options);
    }

    #[test]
    fn preserves_extension_methods() {
        let m = Method::from_token("FOO");
        assert_eq!(m, Method::Other(SmolStr::new("FOO")));
        assert_eq!(m.as_str(), "FOO");
    }
}
