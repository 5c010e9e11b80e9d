use crate::integrity::error::{IntegrityError, IntegrityResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// SHA-256 of some content; serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> IntegrityResult<Self> {
        let bytes = hex::decode(value.trim())
            .map_err(|e| IntegrityError::InvalidDigest(format!("{value}: {e}")))?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IntegrityError::InvalidDigest(format!("{value}: expected 32 bytes")))?;
        Ok(Self(array))
    }

    /// Parse a release-host digest such as `sha256:<hex>`. A bare hex string is accepted.
    pub fn parse_digest(value: &str) -> IntegrityResult<Self> {
        match value.split_once(':') {
            Some(("sha256", hex)) => Self::from_hex(hex),
            Some((algorithm, _)) => {
                Err(IntegrityError::UnsupportedAlgorithm(algorithm.to_string()))
            }
            None => Self::from_hex(value),
        }
    }

    pub fn to_digest(&self) -> String {
        format!("sha256:{}", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_digest(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse_digest(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_prefixed_digest() {
        let hash = ContentHash::parse_digest(&format!("sha256:{EMPTY_SHA256}")).unwrap();
        assert_eq!(hash.to_hex(), EMPTY_SHA256);
        assert_eq!(hash.to_digest(), format!("sha256:{EMPTY_SHA256}"));
    }

    #[test]
    fn test_rejects_other_algorithms() {
        let result = ContentHash::parse_digest("md5:abcd");
        assert!(matches!(result, Err(IntegrityError::UnsupportedAlgorithm(_))));
    }

    #[test]
    fn test_rejects_short_hex() {
        assert!(ContentHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = ContentHash::from_hex(EMPTY_SHA256).unwrap();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{EMPTY_SHA256}\""));

        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
