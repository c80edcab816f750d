//! SHA-256 hashing helpers.

use sha2::{Digest, Sha256};

use crate::Id256;

/// Computes the SHA-256 digest of the given data.
pub fn sha256(data: &[u8]) -> Id256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Id256::new(hasher.finalize().into())
}

/// Incremental SHA-256 hasher for digests over multiple parts.
#[derive(Default)]
pub struct Sha256Writer {
    inner: Sha256,
}

impl Sha256Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    pub fn finalize(self) -> Id256 {
        Id256::new(self.inner.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(
            sha256(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            sha256(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn writer_matches_one_shot() {
        let mut w = Sha256Writer::new();
        w.update(b"foo").update(b"bar");
        assert_eq!(w.finalize(), sha256(b"foobar"));
    }
}
