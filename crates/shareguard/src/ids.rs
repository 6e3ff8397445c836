//! identifiers for secrets and the parties that protect them

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// length of a secret id in bytes
pub const SECRET_ID_LEN: usize = 16;

/// opaque, globally unique id of one protected secret
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretId(pub [u8; SECRET_ID_LEN]);

impl SecretId {
    /// fresh random id
    pub fn random() -> Self {
        let mut bytes = [0u8; SECRET_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretId({})", self.to_hex())
    }
}

impl FromStr for SecretId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Encoding(e.to_string()))?;
        let arr: [u8; SECRET_ID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::Encoding("secret id must be 16 bytes".into()))?;
        Ok(Self(arr))
    }
}

/// sha-256 digest of a party's public key, used as sender/receiver on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyDigest(pub [u8; 32]);

impl KeyDigest {
    pub fn of_public_key(public_key: &[u8]) -> Self {
        Self(Sha256::digest(public_key).into())
    }
}

impl fmt::Display for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form is enough to tell helpers apart in logs
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDigest({})", hex::encode(self.0))
    }
}

/// a sharer or helper as known to the other side
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// human readable name
    pub name: String,
    /// out-of-band contact (e.g. email)
    pub contact: String,
    /// transport address the party is reached at
    pub address: String,
    /// digest of the party's public key
    pub public_key_digest: KeyDigest,
}

impl Identity {
    pub fn new(
        name: impl Into<String>,
        contact: impl Into<String>,
        address: impl Into<String>,
        public_key: &[u8],
    ) -> Self {
        Self {
            name: name.into(),
            contact: contact.into(),
            address: address.into(),
            public_key_digest: KeyDigest::of_public_key(public_key),
        }
    }

    pub fn digest(&self) -> KeyDigest {
        self.public_key_digest
    }
}
