//! The candidate-verification seam.
//!
//! Verification is the slow, one-way check the rest of the system treats as a
//! black box. The only backend shipped here is `$b3$` (BLAKE3 over salt and
//! candidate bytes); crypt(3)-family schemes are detected and named but need
//! an external implementation of [`Verifier`].

use thiserror::Error;

use crate::fingerprint::{HashKind, TargetFingerprint};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("no verifier backend for {0} fingerprints")]
    UnsupportedScheme(&'static str),
    #[error("verifier backend failure: {0}")]
    Backend(String),
}

/// One-way check of a single candidate against the target fingerprint.
pub trait Verifier: Send + Sync + 'static {
    fn verify(&self, candidate: &[u8], target: &TargetFingerprint) -> Result<bool, VerifyError>;
}

/// Reference backend: `hashed_value == salt ++ hex(blake3(salt ++ candidate))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Verifier;

impl Blake3Verifier {
    /// Mints a `$b3$<salt>$...` fingerprint for `candidate`, for tests and
    /// target preparation. `salt_body` must not contain `$`.
    pub fn fingerprint(salt_body: &str, candidate: &[u8]) -> String {
        let salt = format!("$b3${salt_body}$");
        let digest = Self::digest(&salt, candidate);
        format!("{salt}{digest}")
    }

    fn digest(salt: &str, candidate: &[u8]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(salt.as_bytes());
        hasher.update(candidate);
        hasher.finalize().to_hex().to_string()
    }
}

impl Verifier for Blake3Verifier {
    fn verify(&self, candidate: &[u8], target: &TargetFingerprint) -> Result<bool, VerifyError> {
        let digest = Self::digest(&target.salt, candidate);
        let expected = format!("{}{digest}", target.salt);
        Ok(expected == target.hashed_value)
    }
}

/// Picks the shipped backend for a fingerprint, or reports which external
/// scheme would be needed.
pub fn verifier_for(target: &TargetFingerprint) -> Result<Box<dyn Verifier>, VerifyError> {
    match target.kind() {
        HashKind::Blake3 => Ok(Box::new(Blake3Verifier)),
        other => Err(VerifyError::UnsupportedScheme(other.name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_roundtrip() {
        let hash = Blake3Verifier::fingerprint("pepper", b"hunter2");
        let target = TargetFingerprint::parse(&hash).unwrap();
        assert_eq!(target.salt, "$b3$pepper$");

        let v = Blake3Verifier;
        assert!(v.verify(b"hunter2", &target).unwrap());
        assert!(!v.verify(b"hunter3", &target).unwrap());
        assert!(!v.verify(b"", &target).unwrap());
    }

    #[test]
    fn verifier_for_rejects_external_schemes() {
        let target = TargetFingerprint::parse("$6$salt$digest").unwrap();
        assert_eq!(
            verifier_for(&target).err(),
            Some(VerifyError::UnsupportedScheme("sha512crypt"))
        );
        let target = TargetFingerprint::parse(&Blake3Verifier::fingerprint("s", b"x")).unwrap();
        assert!(verifier_for(&target).is_ok());
    }
}
