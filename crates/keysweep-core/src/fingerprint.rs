use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hash scheme named by a crypt-style `$id$` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Md5Crypt,
    Sha256Crypt,
    Sha512Crypt,
    Yescrypt,
    Bcrypt,
    Blake3,
    Unknown,
}

impl HashKind {
    pub fn detect(hashed: &str) -> Self {
        if hashed.starts_with("$1$") {
            Self::Md5Crypt
        } else if hashed.starts_with("$5$") {
            Self::Sha256Crypt
        } else if hashed.starts_with("$6$") {
            Self::Sha512Crypt
        } else if hashed.starts_with("$y$") {
            Self::Yescrypt
        } else if hashed.starts_with("$2a$") || hashed.starts_with("$2b$") || hashed.starts_with("$2y$") {
            Self::Bcrypt
        } else if hashed.starts_with("$b3$") {
            Self::Blake3
        } else {
            Self::Unknown
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5Crypt => "md5crypt",
            Self::Sha256Crypt => "sha256crypt",
            Self::Sha512Crypt => "sha512crypt",
            Self::Yescrypt => "yescrypt",
            Self::Bcrypt => "bcrypt",
            Self::Blake3 => "blake3",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("fingerprint has no salt section (expected $id$salt$digest)")]
    MissingSalt,
    #[error("fingerprint contains illegal character {0:?}")]
    IllegalCharacter(char),
}

/// The immutable search target: the full hash string plus its salt prefix.
///
/// Set once at controller startup and carried inside every assignment so a
/// node can start verifying without any prior handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFingerprint {
    pub hashed_value: String,
    pub salt: String,
}

impl TargetFingerprint {
    /// Parses a crypt-style hash string, extracting the salt prefix: everything
    /// through the third `$`, plus 22 further characters for bcrypt.
    pub fn parse(hashed: &str) -> Result<Self, FingerprintError> {
        for c in hashed.chars() {
            // The wire codec uses these as field delimiters.
            if c == ',' || c == ':' || c == '|' || c.is_whitespace() {
                return Err(FingerprintError::IllegalCharacter(c));
            }
        }

        let mut dollars = 0usize;
        let mut salt_end = None;
        for (i, c) in hashed.char_indices() {
            if c == '$' {
                dollars += 1;
                if dollars == 3 {
                    salt_end = Some(i + 1);
                    break;
                }
            }
        }
        let mut salt_end = salt_end.ok_or(FingerprintError::MissingSalt)?;

        if HashKind::detect(hashed) == HashKind::Bcrypt {
            // Bcrypt keeps its 22-character salt after the third dollar.
            salt_end = (salt_end + 22).min(hashed.len());
        }

        Ok(Self {
            hashed_value: hashed.to_string(),
            salt: hashed[..salt_end].to_string(),
        })
    }

    pub fn kind(&self) -> HashKind {
        HashKind::detect(&self.hashed_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_crypt_prefixes() {
        assert_eq!(HashKind::detect("$6$abc$rest"), HashKind::Sha512Crypt);
        assert_eq!(HashKind::detect("$5$abc$rest"), HashKind::Sha256Crypt);
        assert_eq!(HashKind::detect("$1$abc$rest"), HashKind::Md5Crypt);
        assert_eq!(HashKind::detect("$y$j9T$abc$rest"), HashKind::Yescrypt);
        assert_eq!(HashKind::detect("$2b$12$abcdef"), HashKind::Bcrypt);
        assert_eq!(HashKind::detect("$b3$s$deadbeef"), HashKind::Blake3);
        assert_eq!(HashKind::detect("plain"), HashKind::Unknown);
    }

    #[test]
    fn salt_is_prefix_through_third_dollar() {
        let fp = TargetFingerprint::parse("$6$somesalt$digestdigest").unwrap();
        assert_eq!(fp.salt, "$6$somesalt$");
        assert_eq!(fp.hashed_value, "$6$somesalt$digestdigest");
        assert_eq!(fp.kind(), HashKind::Sha512Crypt);
    }

    #[test]
    fn bcrypt_salt_keeps_22_chars_after_third_dollar() {
        let hash = "$2b$12$abcdefghijklmnopqrstuvXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX";
        let fp = TargetFingerprint::parse(hash).unwrap();
        assert_eq!(fp.salt, "$2b$12$abcdefghijklmnopqrstuv");
    }

    #[test]
    fn rejects_missing_salt_and_delimiters() {
        assert_eq!(
            TargetFingerprint::parse("nodollars"),
            Err(FingerprintError::MissingSalt)
        );
        assert_eq!(
            TargetFingerprint::parse("$6$a,b$c"),
            Err(FingerprintError::IllegalCharacter(','))
        );
        assert_eq!(
            TargetFingerprint::parse("$6$a b$c"),
            Err(FingerprintError::IllegalCharacter(' '))
        );
    }
}
