/// SIP protocol version. Only SIP/2.0 exists on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SipVersion {
    #[default]
    V2,
}

impl SipVersion {
    /// Returns the wire representation of the version.
    pub fn as_str(&self) -> &'static str {
        "SIP/2.0"
    }
}

impl std::fmt::Display for SipVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
