//! wire message contract between sharer and helper
//!
//! every exchange is one request envelope carrying sharer bodies, answered by
//! one reply envelope carrying helper bodies. bodies are closed sum types so
//! both sides dispatch with an exhaustive match.
//!
//! ```text
//! Message
//! ├── protocol version (major, minor)
//! ├── sender / receiver key digests
//! ├── secret id (absent for listing)
//! ├── timestamp (unix seconds)
//! └── bodies: Sharer([SharerBody]) | Helper([HelperBody])
//! ```

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::{PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use crate::ids::{Identity, KeyDigest, SecretId};
use crate::{Error, Result};

/// outcome reported by a helper
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Fail,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

/// secret id to sorted version numbers held by a helper
pub type SecretVersions = BTreeMap<SecretId, Vec<u64>>;

/// requests issued by the sharer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharerBody {
    PairRequest {
        /// how the helper can reach the sharer (name, contact, address)
        communication_info: BTreeMap<String, String>,
    },
    UnpairRequest {
        memo: String,
    },
    StoreShareRequest {
        secret_id: SecretId,
        version_number: u64,
        fragment: Vec<u8>,
    },
    VerifyShareRequest {
        version_number: u64,
        nonce: u64,
    },
    ListVersionsRequest,
}

/// replies issued by a helper
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelperBody {
    PairResponse {
        status: Status,
        memo: String,
    },
    UnpairResponse {
        status: Status,
        memo: String,
    },
    StoreShareResponse {
        version_number: u64,
        status: Status,
        memo: String,
    },
    VerifyShareResponse {
        version_number: u64,
        nonce: u64,
        status: Status,
    },
    ListVersionsResponse {
        status: Status,
        memo: String,
        secrets: SecretVersions,
    },
}

impl SharerBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SharerBody::PairRequest { .. } => "pair request",
            SharerBody::UnpairRequest { .. } => "unpair request",
            SharerBody::StoreShareRequest { .. } => "store share request",
            SharerBody::VerifyShareRequest { .. } => "verify share request",
            SharerBody::ListVersionsRequest => "list versions request",
        }
    }

    /// pair request advertising how to reach `sharer`
    pub fn pair(sharer: &Identity) -> Self {
        let mut communication_info = BTreeMap::new();
        communication_info.insert("name".to_string(), sharer.name.clone());
        communication_info.insert("contact".to_string(), sharer.contact.clone());
        communication_info.insert("address".to_string(), sharer.address.clone());
        SharerBody::PairRequest { communication_info }
    }
}

impl HelperBody {
    pub fn kind(&self) -> &'static str {
        match self {
            HelperBody::PairResponse { .. } => "pair response",
            HelperBody::UnpairResponse { .. } => "unpair response",
            HelperBody::StoreShareResponse { .. } => "store share response",
            HelperBody::VerifyShareResponse { .. } => "verify share response",
            HelperBody::ListVersionsResponse { .. } => "list versions response",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bodies {
    Sharer(Vec<SharerBody>),
    Helper(Vec<HelperBody>),
}

/// request/response envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub protocol_version_major: u32,
    pub protocol_version_minor: u32,
    pub sender: KeyDigest,
    pub receiver: KeyDigest,
    pub secret_id: Option<SecretId>,
    /// unix seconds
    pub timestamp: u64,
    pub bodies: Bodies,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Message {
    /// single-body request from sharer to helper
    pub fn request(
        sender: KeyDigest,
        receiver: KeyDigest,
        secret_id: Option<SecretId>,
        body: SharerBody,
    ) -> Self {
        Self {
            protocol_version_major: PROTOCOL_VERSION_MAJOR,
            protocol_version_minor: PROTOCOL_VERSION_MINOR,
            sender,
            receiver,
            secret_id,
            timestamp: now_secs(),
            bodies: Bodies::Sharer(vec![body]),
        }
    }

    /// reply to `request`, addressed back to its sender
    pub fn reply(request: &Message, bodies: Vec<HelperBody>) -> Self {
        Self {
            protocol_version_major: PROTOCOL_VERSION_MAJOR,
            protocol_version_minor: PROTOCOL_VERSION_MINOR,
            sender: request.receiver,
            receiver: request.sender,
            secret_id: request.secret_id,
            timestamp: now_secs(),
            bodies: Bodies::Helper(bodies),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn check_version(&self) -> Result<()> {
        if self.protocol_version_major != PROTOCOL_VERSION_MAJOR {
            return Err(Error::UnexpectedMessage(format!(
                "protocol version {}.{} not supported",
                self.protocol_version_major, self.protocol_version_minor
            )));
        }
        Ok(())
    }

    /// sharer bodies of a request
    pub fn sharer_bodies(&self) -> Result<&[SharerBody]> {
        self.check_version()?;
        match &self.bodies {
            Bodies::Sharer(bodies) => Ok(bodies),
            Bodies::Helper(_) => Err(Error::UnexpectedMessage(
                "expected sharer bodies, got helper bodies".into(),
            )),
        }
    }

    /// the single helper body of a reply
    pub fn into_helper_body(self) -> Result<HelperBody> {
        self.check_version()?;
        match self.bodies {
            Bodies::Helper(mut bodies) if bodies.len() == 1 => Ok(bodies.remove(0)),
            Bodies::Helper(bodies) => Err(Error::UnexpectedMessage(format!(
                "expected one helper body, got {}",
                bodies.len()
            ))),
            Bodies::Sharer(_) => Err(Error::UnexpectedMessage(
                "expected helper bodies, got sharer bodies".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digests() -> (KeyDigest, KeyDigest) {
        (
            KeyDigest::of_public_key(b"sharer"),
            KeyDigest::of_public_key(b"helper"),
        )
    }

    #[test]
    fn test_store_request_survives_encoding() {
        let (sharer, helper) = digests();
        let id = SecretId::random();
        let msg = Message::request(
            sharer,
            helper,
            Some(id),
            SharerBody::StoreShareRequest {
                secret_id: id,
                version_number: 7,
                fragment: vec![1, 2, 3],
            },
        );
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.sharer_bodies().unwrap().len(), 1);
    }

    #[test]
    fn test_reply_swaps_parties() {
        let (sharer, helper) = digests();
        let req = Message::request(sharer, helper, None, SharerBody::ListVersionsRequest);
        let reply = Message::reply(
            &req,
            vec![HelperBody::UnpairResponse {
                status: Status::Ok,
                memo: String::new(),
            }],
        );
        assert_eq!(reply.sender, helper);
        assert_eq!(reply.receiver, sharer);
        assert!(matches!(
            reply.into_helper_body().unwrap(),
            HelperBody::UnpairResponse { .. }
        ));
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let (sharer, helper) = digests();
        let req = Message::request(sharer, helper, None, SharerBody::ListVersionsRequest);
        assert!(matches!(
            req.into_helper_body(),
            Err(Error::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn test_major_version_mismatch_rejected() {
        let (sharer, helper) = digests();
        let mut req = Message::request(sharer, helper, None, SharerBody::ListVersionsRequest);
        req.protocol_version_major = 9;
        assert!(req.sharer_bodies().is_err());
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(matches!(
            Message::decode(&[0xff, 0x01]),
            Err(Error::Encoding(_))
        ));
    }
}
