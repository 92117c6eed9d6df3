//! Algorithm-tagged content digests.
//!
//! Textual form is `<algorithm>:<hex>`; a bare hex string is read as sha256, which is what
//! older directors send.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }
}

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("malformed digest `{0}`")]
    Malformed(String),
    #[error("expected {expected} but computed {actual}")]
    Mismatch { expected: String, actual: String },
    #[error("reading content: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    pub fn new(algorithm: DigestAlgorithm, hex: impl Into<String>) -> Result<Self, DigestError> {
        let hex = hex.into().to_ascii_lowercase();
        if hex.len() != algorithm.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigestError::Malformed(format!("{}:{}", algorithm.as_str(), hex)));
        }
        Ok(Self { algorithm, hex })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn of_bytes(algorithm: DigestAlgorithm, bytes: &[u8]) -> Self {
        let hex = match algorithm {
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            DigestAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
        };
        Self { algorithm, hex }
    }

    pub fn of_reader(algorithm: DigestAlgorithm, mut reader: impl Read) -> std::io::Result<Self> {
        let mut buf = [0u8; 64 * 1024];
        let hex = match algorithm {
            DigestAlgorithm::Sha256 => {
                let mut h = Sha256::new();
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 { break; }
                    h.update(&buf[..n]);
                }
                hex::encode(h.finalize())
            }
            DigestAlgorithm::Sha512 => {
                let mut h = Sha512::new();
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 { break; }
                    h.update(&buf[..n]);
                }
                hex::encode(h.finalize())
            }
        };
        Ok(Self { algorithm, hex })
    }

    pub fn of_file(algorithm: DigestAlgorithm, path: &Path) -> std::io::Result<Self> {
        Self::of_reader(algorithm, std::fs::File::open(path)?)
    }

    /// Recompute the digest of `path` with this digest's algorithm and compare.
    pub fn verify_file(&self, path: &Path) -> Result<(), DigestError> {
        let actual = Self::of_file(self.algorithm, path)?;
        self.verify(&actual)
    }

    fn verify(&self, actual: &Digest) -> Result<(), DigestError> {
        if actual.hex != self.hex {
            return Err(DigestError::Mismatch { expected: self.to_string(), actual: actual.to_string() });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(':') {
            Some(("sha256", hex)) => Digest::new(DigestAlgorithm::Sha256, hex),
            Some(("sha512", hex)) => Digest::new(DigestAlgorithm::Sha512, hex),
            Some(_) => Err(DigestError::Malformed(s.to_string())),
            None => Digest::new(DigestAlgorithm::Sha256, s),
        }
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

/// Set of digests of the same content under different algorithms, as returned on upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipleDigest(Vec<Digest>);

impl MultipleDigest {
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self(vec![
            Digest::of_file(DigestAlgorithm::Sha256, path)?,
            Digest::of_file(DigestAlgorithm::Sha512, path)?,
        ]))
    }

    pub fn digests(&self) -> &[Digest] {
        &self.0
    }

    pub fn strongest(&self) -> Option<&Digest> {
        self.0.iter().max_by_key(|d| d.algorithm())
    }
}
