use std::str::FromStr;

use smol_str::SmolStr;

use crate::{headers::HeaderError, method::Method};

/// Typed view of the CSeq header: a sequence number plus a method token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl FromStr for CSeq {
    type Err = HeaderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.split_whitespace();
        let seq = parts
            .next()
            .and_then(|t| t.parse::<u32>().ok())
            .ok_or_else(|| HeaderError::CSeq(SmolStr::new(value)))?;
        let method = parts
            .next()
            .map(Method::from_token)
            .ok_or_else(|| HeaderError::CSeq(SmolStr::new(value)))?;
        if parts.next().is_some() {
            return Err(HeaderError::CSeq(SmolStr::new(value)));
        }
        Ok(CSeq { seq, method })
    }
}

impl std::fmt::Display for CSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_renders() {
        let cseq: CSeq = "1 INVITE".parse().unwrap();
        assert_eq!(cseq.seq, 1);
        assert_eq!(cseq.method, Method::Invite);
        assert_eq!(cseq.to_string(), "1 INVITE");
    }

    #[test]
    fn rejects_garbage() {
        assert!("INVITE".parse::<CSeq>().is_err());
        assert!("x INVITE".parse::<CSeq>().is_err());
        assert!("1 INVITE extra".parse::<CSeq>().is_err());
    }
}
