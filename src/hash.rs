use serde::{Deserialize, Serialize};
use thiserror::Error;

const HASH32_SIZE: usize = 32;

/// A 32-byte SHA-256 digest.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Hash32([u8; HASH32_SIZE]);

#[derive(Error, Debug, Eq, PartialEq)]
#[error("invalid length: expected: {}, got: {}", .expected, .found)]
pub struct InvalidLength {
    expected: usize,
    found: usize,
}

impl Hash32 {
    pub fn calculate(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash32(hasher.finalize().into())
    }

    fn from_fixed_bytes(val: [u8; HASH32_SIZE]) -> Hash32 {
        Hash32(val)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, InvalidLength> {
        let bytes: &[u8; HASH32_SIZE] = data.try_into().map_err(|_| InvalidLength {
            expected: HASH32_SIZE,
            found: data.len(),
        })?;
        Ok(Self::from_fixed_bytes(*bytes))
    }

    pub fn as_fixed_bytes(&self) -> &[u8; HASH32_SIZE] {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoding() {
        assert!(Hash32::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_calc() {
        let buf = hex::decode("88d4266fd4e6338d13b845fcf289579d209c897823b9217da3e161936f031589")
            .unwrap();
        assert_eq!(Hash32::calculate("abcd".as_bytes()).0.to_vec(), buf);
    }

    #[test]
    fn test_roundtrip() {
        let h = Hash32::calculate(b"roundtrip");
        assert_eq!(Hash32::from_bytes(&h.to_bytes()).unwrap(), h);
    }
}
