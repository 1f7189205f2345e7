// SPDX-License-Identifier: MIT
//! Constant-time credential comparison for the `token` and `password` auth
//! modes. Only a SHA-256 hash of the configured secret is ever held in
//! memory; comparison goes through [`subtle::ConstantTimeEq`] so response
//! timing can't leak how many leading bytes matched.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

#[derive(Clone)]
pub struct StoredSecret {
    hash: [u8; 32],
}

impl StoredSecret {
    pub fn from_plain(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hasher.finalize());
        Self { hash }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(candidate.as_bytes());
        let candidate_hash = hasher.finalize();
        self.hash.ct_eq(&candidate_hash[..]).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_the_original_secret() {
        let stored = StoredSecret::from_plain("hunter2");
        assert!(stored.verify("hunter2"));
    }

    #[test]
    fn verify_rejects_a_wrong_secret() {
        let stored = StoredSecret::from_plain("hunter2");
        assert!(!stored.verify("hunter3"));
    }
}
