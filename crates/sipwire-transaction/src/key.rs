// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction keys per RFC 3261 §17.1.3 and §17.2.3.
//!
//! Client transactions match on (top-Via branch, CSeq method); server
//! transactions additionally include the top-Via sent-by when the branch
//! carries the `z9hG4bK` magic cookie. Requests from RFC 2543 peers lack
//! the cookie and fall back to a digest over the identifying headers.
//!
//! For key purposes an ACK belongs to the INVITE transaction it
//! acknowledges, so the request-key constructors fold ACK into INVITE.
//! Response keys never fold: a response claiming `CSeq: n ACK` must not
//! match an INVITE client transaction.

use sha2::{Digest, Sha256};
use smol_str::SmolStr;

use sipwire_core::{Method, Request, Response, MAGIC_COOKIE};

use crate::TransactionError;

/// Key of a client (outbound-request) transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub branch: SmolStr,
    pub method: Method,
}

impl ClientKey {
    /// Key for an outbound request. ACK folds into INVITE so the
    /// transaction-generated ACK for a 3xx–6xx final shares the INVITE's key.
    pub fn from_request(req: &Request) -> Result<Self, TransactionError> {
        let via = req.top_via().ok_or(TransactionError::MissingBranch)?;
        let branch = via
            .branch()
            .map(SmolStr::new)
            .ok_or(TransactionError::MissingBranch)?;
        Ok(Self {
            branch,
            method: fold_ack(req.method().clone()),
        })
    }

    /// Key an inbound response matches against. The method comes from CSeq
    /// and is not folded.
    pub fn from_response(res: &Response) -> Result<Self, TransactionError> {
        let via = res.top_via().ok_or(TransactionError::MissingBranch)?;
        let branch = via
            .branch()
            .map(SmolStr::new)
            .ok_or(TransactionError::MissingBranch)?;
        let cseq = res.cseq().ok_or(TransactionError::MissingCSeq)?;
        Ok(Self {
            branch,
            method: cseq.method,
        })
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client/{}/{}", self.branch, self.method)
    }
}

/// Key of a server (inbound-request) transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerKey {
    /// RFC 3261 §17.2.3: magic-cookie branch plus sent-by plus method.
    Rfc3261 {
        branch: SmolStr,
        sent_by: SmolStr,
        method: Method,
    },
    /// RFC 2543 fallback: digest over the identifying headers.
    Legacy { digest: SmolStr },
}

impl ServerKey {
    /// Key for an inbound request. ACK folds into INVITE; CANCEL keys as
    /// itself and forms its own transaction.
    pub fn from_request(req: &Request) -> Result<Self, TransactionError> {
        let via = req.top_via().ok_or(TransactionError::MissingBranch)?;
        let method = fold_ack(req.method().clone());

        if let Some(branch) = via.branch().filter(|b| b.starts_with(MAGIC_COOKIE)) {
            return Ok(ServerKey::Rfc3261 {
                branch: SmolStr::new(branch),
                sent_by: SmolStr::new(via.sent_by()),
                method,
            });
        }

        // Legacy digest: From tag, Call-ID, CSeq, Request-URI, top Via.
        // SHA-256 truncated to 128 bits; the digest never leaves this
        // process, so only collision resistance matters.
        let from_tag = req
            .from_header()
            .and_then(|f| f.tag().map(str::to_owned))
            .unwrap_or_default();
        let call_id = req.call_id().map(|c| c.to_string()).unwrap_or_default();
        let cseq = req.cseq().ok_or(TransactionError::MissingCSeq)?;
        let mut hasher = Sha256::new();
        hasher.update(from_tag.as_bytes());
        hasher.update(b"|");
        hasher.update(call_id.as_bytes());
        hasher.update(b"|");
        hasher.update(cseq.seq.to_be_bytes());
        hasher.update(method.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(req.uri().to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(via.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(32);
        for byte in &digest[..16] {
            hex.push_str(&format!("{:02x}", byte));
        }
        Ok(ServerKey::Legacy {
            digest: SmolStr::new(hex),
        })
    }

    /// Sibling key with a different method, used to find the INVITE
    /// transaction an ACK or CANCEL refers to. Legacy keys have the method
    /// folded into the digest and cannot be re-targeted.
    pub fn with_method(&self, method: Method) -> Option<Self> {
        match self {
            ServerKey::Rfc3261 {
                branch, sent_by, ..
            } => Some(ServerKey::Rfc3261 {
                branch: branch.clone(),
                sent_by: sent_by.clone(),
                method,
            }),
            ServerKey::Legacy { .. } => None,
        }
    }

    /// Key a TU response maps back to. Responses echo the request's Via, so
    /// branch and sent-by are recoverable; the method comes from CSeq.
    /// Responses to legacy-keyed requests cannot be derived this way; the
    /// layer keeps a side index for those.
    pub fn from_response(res: &Response) -> Result<Self, TransactionError> {
        let via = res.top_via().ok_or(TransactionError::MissingBranch)?;
        let branch = via
            .branch()
            .filter(|b| b.starts_with(MAGIC_COOKIE))
            .map(SmolStr::new)
            .ok_or(TransactionError::MissingBranch)?;
        let cseq = res.cseq().ok_or(TransactionError::MissingCSeq)?;
        Ok(ServerKey::Rfc3261 {
            branch,
            sent_by: SmolStr::new(via.sent_by()),
            method: fold_ack(cseq.method),
        })
    }
}

impl std::fmt::Display for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerKey::Rfc3261 {
                branch,
                sent_by,
                method,
            } => write!(f, "server/{}/{}/{}", branch, sent_by, method),
            ServerKey::Legacy { digest } => write!(f, "server/legacy/{}", digest),
        }
    }
}

/// Index key used to map TU responses onto legacy-keyed server
/// transactions: From tag, Call-ID and CSeq survive into the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LegacyResponseKey {
    pub from_tag: SmolStr,
    pub call_id: SmolStr,
    pub cseq: SmolStr,
}

impl LegacyResponseKey {
    pub fn from_request(req: &Request) -> Option<Self> {
        Some(Self {
            from_tag: SmolStr::new(req.from_header()?.tag().unwrap_or("")),
            call_id: req.call_id()?.clone(),
            cseq: req.headers().get("CSeq")?.clone(),
        })
    }

    pub fn from_response(res: &Response) -> Option<Self> {
        Some(Self {
            from_tag: SmolStr::new(res.from_header()?.tag().unwrap_or("")),
            call_id: res.call_id()?.clone(),
            cseq: res.headers().get("CSeq")?.clone(),
        })
    }
}

fn fold_ack(method: Method) -> Method {
    if method == Method::Ack {
        Method::Invite
    } else {
        method
    }
}
