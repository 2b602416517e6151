//! Content identifiers.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A content identifier: the 32-byte BLAKE3 hash of a blob's bytes, rendered
/// as lowercase hex. The cid doubles as the blob's storage key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Hashes `data` into its cid.
    pub fn hash(data: impl AsRef<[u8]>) -> Self {
        Cid(blake3::hash(data.as_ref()).into())
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Reconstructs a cid from raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Cid(bytes)
    }

    /// The two-character shard prefix of the hex rendering.
    pub(crate) fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl From<blake3::Hash> for Cid {
    fn from(hash: blake3::Hash) -> Self {
        Cid(hash.into())
    }
}

impl Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}

/// Error parsing a cid from its hex rendering.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cid: {0:?}")]
pub struct InvalidCid(String);

impl FromStr for Cid {
    type Err = InvalidCid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| InvalidCid(s.to_owned()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| InvalidCid(s.to_owned()))?;
        Ok(Cid(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable_and_content_bound() {
        let a = Cid::hash(b"hello");
        assert_eq!(a, Cid::hash(b"hello"));
        assert_ne!(a, Cid::hash(b"hello "));
    }

    #[test]
    fn display_round_trips() {
        let cid = Cid::hash(b"round trip");
        let rendered = cid.to_string();
        assert_eq!(rendered.len(), 64);
        assert_eq!(rendered.parse::<Cid>().unwrap(), cid);
        assert!("zz".parse::<Cid>().is_err());
        assert!("abcd".parse::<Cid>().is_err());
    }

    #[test]
    fn shard_is_the_first_hex_byte() {
        let cid = Cid::hash(b"shard");
        assert_eq!(cid.shard(), cid.to_string()[..2]);
    }
}
