//! helper-side responder
//!
//! answers sharer requests from an in-process [`Storage`]. it gives the
//! coordination core a real counterpart to talk to; durable helper storage is
//! somebody else's problem.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use tracing::{debug, info};

use crate::ids::{Identity, KeyDigest, SecretId};
use crate::message::{HelperBody, Message, SecretVersions, SharerBody, Status};

/// a fragment held on behalf of a sharer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredShare {
    pub secret_id: SecretId,
    pub version_number: u64,
    pub fragment: Vec<u8>,
}

/// where a helper keeps its shares, keyed by the sharer's key digest
pub trait Storage: Send + Sync {
    fn put_share(&self, sender: KeyDigest, share: StoredShare);

    fn shares(&self, sender: &KeyDigest) -> Vec<StoredShare>;
}

/// volatile storage for tests and demos
#[derive(Default)]
pub struct MemoryStorage {
    shares: RwLock<HashMap<KeyDigest, Vec<StoredShare>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn put_share(&self, sender: KeyDigest, share: StoredShare) {
        let mut shares = self.shares.write().unwrap_or_else(|e| e.into_inner());
        let list = shares.entry(sender).or_default();
        list.retain(|s| !(s.secret_id == share.secret_id && s.version_number == share.version_number));
        list.push(share);
    }

    fn shares(&self, sender: &KeyDigest) -> Vec<StoredShare> {
        let shares = self.shares.read().unwrap_or_else(|e| e.into_inner());
        shares.get(sender).cloned().unwrap_or_default()
    }
}

/// answers every sharer body kind
pub struct HelperResponder {
    identity: Identity,
    storage: Box<dyn Storage>,
    paired: RwLock<HashSet<(KeyDigest, Option<SecretId>)>>,
}

impl HelperResponder {
    pub fn new(identity: Identity, storage: Box<dyn Storage>) -> Self {
        Self {
            identity,
            storage,
            paired: RwLock::new(HashSet::new()),
        }
    }

    /// responder backed by [`MemoryStorage`]
    pub fn in_memory(identity: Identity) -> Self {
        Self::new(identity, Box::new(MemoryStorage::new()))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// whether `sharer` is paired with this helper for `secret_id`
    pub fn is_paired(&self, sharer: &KeyDigest, secret_id: Option<SecretId>) -> bool {
        let paired = self.paired.read().unwrap_or_else(|e| e.into_inner());
        paired.contains(&(*sharer, secret_id))
    }

    /// process a request and build the reply
    pub fn respond(&self, request: &Message) -> Message {
        let bodies = match request.sharer_bodies() {
            Ok(bodies) => bodies.iter().map(|b| self.process(request, b)).collect(),
            Err(e) => {
                debug!(helper = %self.identity.name, "rejecting request: {}", e);
                Vec::new()
            }
        };
        Message::reply(request, bodies)
    }

    /// reply with a failure status to every body, without touching state
    pub fn reject(&self, request: &Message, memo: &str) -> Message {
        let bodies = request
            .sharer_bodies()
            .map(|bodies| bodies.iter().map(|b| failure(b, memo)).collect())
            .unwrap_or_default();
        Message::reply(request, bodies)
    }

    fn process(&self, request: &Message, body: &SharerBody) -> HelperBody {
        info!(helper = %self.identity.name, "received {}", body.kind());
        let sender = request.sender;
        let key = (sender, request.secret_id);

        match body {
            SharerBody::PairRequest { communication_info } => {
                debug!(
                    helper = %self.identity.name,
                    sharer = communication_info.get("name").map(String::as_str).unwrap_or("?"),
                    "pairing"
                );
                self.paired.write().unwrap_or_else(|e| e.into_inner()).insert(key);
                HelperBody::PairResponse {
                    status: Status::Ok,
                    memo: "paired".into(),
                }
            }
            SharerBody::UnpairRequest { memo } => {
                debug!(helper = %self.identity.name, reason = %memo, "unpairing");
                self.paired.write().unwrap_or_else(|e| e.into_inner()).remove(&key);
                HelperBody::UnpairResponse {
                    status: Status::Ok,
                    memo: "unpaired".into(),
                }
            }
            SharerBody::StoreShareRequest {
                secret_id,
                version_number,
                fragment,
            } => {
                if !self.is_paired(&sender, request.secret_id) {
                    return HelperBody::StoreShareResponse {
                        version_number: *version_number,
                        status: Status::Fail,
                        memo: "not paired".into(),
                    };
                }
                self.storage.put_share(
                    sender,
                    StoredShare {
                        secret_id: *secret_id,
                        version_number: *version_number,
                        fragment: fragment.clone(),
                    },
                );
                HelperBody::StoreShareResponse {
                    version_number: *version_number,
                    status: Status::Ok,
                    memo: "share stored".into(),
                }
            }
            SharerBody::VerifyShareRequest { version_number, nonce } => {
                let held = self.storage.shares(&sender).into_iter().any(|s| {
                    Some(s.secret_id) == request.secret_id && s.version_number == *version_number
                });
                HelperBody::VerifyShareResponse {
                    version_number: *version_number,
                    nonce: *nonce,
                    status: if held { Status::Ok } else { Status::Fail },
                }
            }
            SharerBody::ListVersionsRequest => {
                let mut secrets: SecretVersions = BTreeMap::new();
                for share in self.storage.shares(&sender) {
                    secrets.entry(share.secret_id).or_default().push(share.version_number);
                }
                for versions in secrets.values_mut() {
                    versions.sort_unstable();
                    versions.dedup();
                }
                HelperBody::ListVersionsResponse {
                    status: Status::Ok,
                    memo: format!("{} secrets", secrets.len()),
                    secrets,
                }
            }
        }
    }
}

fn failure(body: &SharerBody, memo: &str) -> HelperBody {
    match body {
        SharerBody::PairRequest { .. } => HelperBody::PairResponse {
            status: Status::Fail,
            memo: memo.into(),
        },
        SharerBody::UnpairRequest { .. } => HelperBody::UnpairResponse {
            status: Status::Fail,
            memo: memo.into(),
        },
        SharerBody::StoreShareRequest { version_number, .. } => HelperBody::StoreShareResponse {
            version_number: *version_number,
            status: Status::Fail,
            memo: memo.into(),
        },
        SharerBody::VerifyShareRequest { version_number, nonce } => HelperBody::VerifyShareResponse {
            version_number: *version_number,
            nonce: *nonce,
            status: Status::Fail,
        },
        SharerBody::ListVersionsRequest => HelperBody::ListVersionsResponse {
            status: Status::Fail,
            memo: memo.into(),
            secrets: BTreeMap::new(),
        },
    }
}
