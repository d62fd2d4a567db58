//! Compact schema identity used during handshake negotiation.

use std::fmt;

use md5::{Digest, Md5};

/// A 16-byte MD5 digest identifying a protocol or schema by its canonical
/// JSON form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        Fingerprint(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Fingerprint(bytes)
    }

    pub fn bytes(&self) -> [u8; 16] {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_for_equal_input() {
        assert_eq!(Fingerprint::of(b"abc"), Fingerprint::of(b"abc"));
        assert_ne!(Fingerprint::of(b"abc"), Fingerprint::of(b"abd"));
    }

    #[test]
    fn displays_as_hex() {
        let fp = Fingerprint::from_bytes([0xAB; 16]);
        assert_eq!(fp.to_string(), "ab".repeat(16));
    }
}
