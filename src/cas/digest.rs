use serde::{Deserialize, Serialize};
use std::fmt;

/// Hash algorithm used to address a blob.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    /// Default. Faster than SHA256, used for everything this client writes.
    Blake3,
    /// Kept for stores that were seeded by an older SHA256 writer.
    Sha256,
    /// The isolated-file wire format names this "sha-1"; never used for
    /// blobs this client produces, only for digests it's handed.
    #[serde(rename = "sha-1")]
    Sha1,
}

impl HashAlgorithm {
    fn byte_len(&self) -> usize {
        match self {
            HashAlgorithm::Blake3 | HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha1 => 20,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Blake3 => write!(f, "blake3"),
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Sha1 => write!(f, "sha-1"),
        }
    }
}

/// Content-addressable digest for a blob: `(algorithm, bytes)`. Equality of
/// a digest implies equality of content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub algorithm: HashAlgorithm,
    #[serde(with = "hex_serde")]
    pub bytes: Vec<u8>,
}

impl Digest {
    /// Hash content with the default algorithm (Blake3).
    pub fn from_content(data: &[u8]) -> Self {
        Self::from_content_with_algo(data, HashAlgorithm::Blake3)
    }

    pub fn from_content_with_algo(data: &[u8], algo: HashAlgorithm) -> Self {
        let bytes = match algo {
            HashAlgorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
            HashAlgorithm::Sha256 => {
                use sha2::{Digest as _, Sha256};
                Sha256::digest(data).to_vec()
            }
            HashAlgorithm::Sha1 => {
                use sha1::{Digest as _, Sha1};
                Sha1::digest(data).to_vec()
            }
        };
        Self {
            algorithm: algo,
            bytes,
        }
    }

    /// `"<algorithm>:<hex>"`, e.g. `"blake3:abc123..."`.
    pub fn to_key_string(&self) -> String {
        format!("{}:{}", self.algorithm, hex::encode(&self.bytes))
    }

    pub fn from_key_string(s: &str) -> Result<Self, crate::error::SwarmError> {
        let (algo_str, hex_str) = s
            .split_once(':')
            .ok_or_else(|| crate::error::SwarmError::Config(format!("invalid digest: {s}")))?;

        let algorithm = match algo_str {
            "blake3" => HashAlgorithm::Blake3,
            "sha256" => HashAlgorithm::Sha256,
            "sha-1" | "sha1" => HashAlgorithm::Sha1,
            other => {
                return Err(crate::error::SwarmError::Config(format!(
                    "unknown hash algorithm: {other}"
                )))
            }
        };

        let bytes = hex::decode(hex_str)
            .map_err(|e| crate::error::SwarmError::Config(format!("invalid digest hex: {e}")))?;

        if bytes.len() != algorithm.byte_len() {
            return Err(crate::error::SwarmError::Config(format!(
                "digest length mismatch for {}: expected {}, got {}",
                algorithm,
                algorithm.byte_len(),
                bytes.len()
            )));
        }

        Ok(Self { algorithm, bytes })
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Leading byte of the digest, hex-encoded, used for sharded storage
    /// layouts so no single directory accumulates too many entries.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.bytes[0..1])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key_string())
    }
}

mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
