//! Message-digest credential handling.
//!
//! Stored credentials take one of three forms:
//!
//! - `salt$iterations$digest`: hex salt and hex digest of
//!   `H(salt || password)` re-hashed `iterations - 1` more times
//! - `{ALGORITHM}digest`: base64 digest of `H(password)` with the named
//!   algorithm
//! - `digest`: hex digest of `H(password)` with the handler's default
//!   algorithm

use crate::error::AuthError;
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha224 => "SHA-224",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha224 => 28,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }
        match self {
            DigestAlgorithm::Sha224 => run::<Sha224>(parts),
            DigestAlgorithm::Sha256 => run::<Sha256>(parts),
            DigestAlgorithm::Sha384 => run::<Sha384>(parts),
            DigestAlgorithm::Sha512 => run::<Sha512>(parts),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = AuthError;

    /// Accepts `SHA-256`, `SHA256` and `sha-256` alike.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "SHA224" => Ok(DigestAlgorithm::Sha224),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA384" => Ok(DigestAlgorithm::Sha384),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(AuthError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validates supplied passwords against stored credentials.
#[derive(Debug, Clone)]
pub struct CredentialHandler {
    algorithm: DigestAlgorithm,
    iterations: u32,
    salt_length: usize,
}

impl Default for CredentialHandler {
    fn default() -> Self {
        Self::new(DigestAlgorithm::Sha256)
    }
}

impl CredentialHandler {
    /// Defaults used by [`mutate`](Self::mutate).
    pub const DEFAULT_ITERATIONS: u32 = 1000;
    pub const DEFAULT_SALT_LENGTH: usize = 16;

    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            iterations: Self::DEFAULT_ITERATIONS,
            salt_length: Self::DEFAULT_SALT_LENGTH,
        }
    }

    pub fn with_iterations(mut self, iterations: u32) -> Result<Self, AuthError> {
        if iterations == 0 {
            return Err(AuthError::InvalidIterations(iterations));
        }
        self.iterations = iterations;
        Ok(self)
    }

    pub fn with_salt_length(mut self, salt_length: usize) -> Self {
        self.salt_length = salt_length;
        self
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Returns whether `supplied` matches the `stored` credential.
    pub fn validate(&self, stored: &str, supplied: &str) -> bool {
        let stored = stored.trim();
        if stored.is_empty() {
            return false;
        }

        if let Some(rest) = stored.strip_prefix('{') {
            let Some((name, encoded)) = rest.split_once('}') else {
                return false;
            };
            let Ok(algorithm) = name.parse::<DigestAlgorithm>() else {
                return false;
            };
            let Ok(expected) = general_purpose::STANDARD.decode(encoded) else {
                return false;
            };
            let actual = algorithm.digest(&[supplied.as_bytes()]);
            return constant_time_eq(&expected, &actual);
        }

        let mut parts = stored.splitn(3, '$');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(salt), Some(iterations), Some(digest)) => {
                let (Ok(salt), Ok(iterations), Ok(expected)) =
                    (hex::decode(salt), iterations.parse::<u32>(), hex::decode(digest))
                else {
                    return false;
                };
                let actual = self.salted_digest(supplied, &salt, iterations.max(1));
                constant_time_eq(&expected, &actual)
            }
            (Some(digest), None, None) => {
                let Ok(expected) = hex::decode(digest) else {
                    return false;
                };
                let actual = self.algorithm.digest(&[supplied.as_bytes()]);
                constant_time_eq(&expected, &actual)
            }
            _ => false,
        }
    }

    /// Produces a salted stored form for `password` with a random salt.
    pub fn mutate(&self, password: &str) -> String {
        let mut salt = vec![0u8; self.salt_length];
        rand::thread_rng().fill_bytes(&mut salt);
        self.mutate_with_salt(password, &salt)
    }

    pub fn mutate_with_salt(&self, password: &str, salt: &[u8]) -> String {
        let digest = self.salted_digest(password, salt, self.iterations);
        format!(
            "{}${}${}",
            hex::encode(salt),
            self.iterations,
            hex::encode(digest)
        )
    }

    fn salted_digest(&self, password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut digest = self.algorithm.digest(&[salt, password.as_bytes()]);
        for _ in 1..iterations {
            digest = self.algorithm.digest(&[digest.as_slice()]);
        }
        digest
    }
}

/// Compares two byte strings without stopping at the first difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
