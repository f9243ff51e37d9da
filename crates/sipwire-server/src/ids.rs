// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Random identifier generation for dialogs and calls.
//!
//! Branch generation lives in `sipwire-transaction` next to the keys it
//! feeds; tags and Call-IDs are a user-agent concern and live here.

use rand::RngCore;
use smol_str::SmolStr;

pub use sipwire_transaction::generate_branch;

/// A From/To tag: 64 random bits, hex-encoded.
pub fn generate_tag() -> SmolStr {
    SmolStr::new(hex(8))
}

/// A Call-ID: 128 random bits, hex-encoded, scoped to the local host.
pub fn generate_call_id(host: &str) -> SmolStr {
    SmolStr::new(format!("{}@{}", hex(16), host))
}

fn hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    let mut out = String::with_capacity(bytes * 2);
    for byte in buf {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_64_bits_of_hex() {
        let tag = generate_tag();
        assert_eq!(tag.len(), 16);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn call_id_is_scoped_to_host() {
        let call_id = generate_call_id("example.com");
        let (random, host) = call_id.split_once('@').unwrap();
        assert_eq!(random.len(), 32);
        assert_eq!(host, "example.com");
        assert_ne!(call_id, generate_call_id("example.com"));
    }
}
