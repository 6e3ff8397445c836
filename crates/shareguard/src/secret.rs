//! one protected value: its versions and the helpers holding them
//!
//! ```text
//!   update(v) ──▶ Version n ──split──▶ fragment per PAIRED helper ──send──▶ HelperClient
//!                    ▲                                                         │
//!                    └──────────── ack count (watch) ◀──── store OK ──────────┘
//! ```
//!
//! the roster and the version map sit behind separate locks, taken in that
//! order (versions, then roster) when both are needed. neither is shared with
//! a helper client's exchange lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SecretConfig;
use crate::helper_client::{HelperClient, PairingStatus};
use crate::ids::{Identity, KeyDigest, SecretId};
use crate::notification::NotificationBus;
use crate::splitter::{Splitter, MAX_FRAGMENTS};
use crate::transport::Transport;
use crate::version::Version;
use crate::{Error, Result};

struct Roster {
    helpers: Vec<Arc<HelperClient>>,
    /// next unused share index, starting at 1
    next_index: usize,
}

pub struct Secret {
    id: SecretId,
    description: String,
    config: SecretConfig,
    sharer: Identity,
    transport: Arc<dyn Transport>,
    splitter: Arc<dyn Splitter>,
    bus: NotificationBus,
    roster: Mutex<Roster>,
    versions: Mutex<BTreeMap<u64, Arc<Version>>>,
    closed: AtomicBool,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// completion of one helper's pairing, plus catch-up of earlier versions
pub struct PairingHandle {
    client: Arc<HelperClient>,
    task: JoinHandle<PairingStatus>,
}

impl fmt::Debug for PairingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingHandle")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl PairingHandle {
    pub fn helper(&self) -> KeyDigest {
        self.client.digest()
    }

    pub fn client(&self) -> &Arc<HelperClient> {
        &self.client
    }

    /// resolves with the settled pairing status
    pub async fn wait(self) -> PairingStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                warn!(helper = %self.client.id().name, "pairing task ended abnormally: {}", e);
                self.client.status()
            }
        }
    }
}

impl Secret {
    pub(crate) fn new(
        id: SecretId,
        description: impl Into<String>,
        config: SecretConfig,
        sharer: Identity,
        transport: Arc<dyn Transport>,
        splitter: Arc<dyn Splitter>,
        bus: NotificationBus,
    ) -> Result<Arc<Self>> {
        let threshold = config.threshold_for_recovery;
        if threshold == 0 || threshold > MAX_FRAGMENTS {
            return Err(Error::InvalidThreshold {
                threshold,
                count: MAX_FRAGMENTS,
            });
        }

        Ok(Arc::new(Self {
            id,
            description: description.into(),
            config,
            sharer,
            transport,
            splitter,
            bus,
            roster: Mutex::new(Roster {
                helpers: Vec::new(),
                next_index: 1,
            }),
            versions: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }))
    }

    fn roster(&self) -> MutexGuard<'_, Roster> {
        self.roster.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn versions_map(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<Version>>> {
        self.versions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SecretClosed);
        }
        Ok(())
    }

    pub fn id(&self) -> SecretId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn config(&self) -> &SecretConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn helpers(&self) -> Vec<Arc<HelperClient>> {
        self.roster().helpers.clone()
    }

    pub fn helper(&self, digest: &KeyDigest) -> Option<Arc<HelperClient>> {
        self.roster().helpers.iter().find(|c| c.digest() == *digest).cloned()
    }

    /// versions in ascending order
    pub fn versions(&self) -> Vec<Arc<Version>> {
        self.versions_map().values().cloned().collect()
    }

    pub fn version(&self, number: u64) -> Option<Arc<Version>> {
        self.versions_map().get(&number).cloned()
    }

    pub fn latest_version(&self) -> Option<Arc<Version>> {
        self.versions_map().values().next_back().cloned()
    }

    fn paired_helpers(&self) -> Vec<Arc<HelperClient>> {
        self.roster()
            .helpers
            .iter()
            .filter(|c| c.status() == PairingStatus::Paired)
            .cloned()
            .collect()
    }

    /// fragments at indices 1..=count of `value` as `number`
    fn split(&self, number: u64, value: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
        self.splitter
            .split(&self.id, number, value, count, self.config.threshold_for_recovery)
    }

    /// store a new version with every paired helper.
    ///
    /// blocks until the version is protected or `update_wait` elapses, and
    /// returns the version either way. returns at once when fewer helpers than
    /// the recovery threshold were sent a share.
    pub async fn update(&self, value: impl Into<Vec<u8>>) -> Result<Arc<Version>> {
        self.ensure_open()?;
        let value = value.into();

        let (version, helpers, fragments) = {
            let mut versions = self.versions_map();
            // a helper pairing after this read finds the new version in catch-up
            let helpers = self.paired_helpers();
            self.ensure_open()?;
            let count = helpers.iter().map(|c| c.index()).max().unwrap_or(0);
            let number = versions.keys().next_back().map_or(1, |n| n + 1);
            let fragments = if count > 0 {
                self.split(number, &value, count)?
            } else {
                Vec::new()
            };
            let version = Version::new(
                self.id,
                number,
                value,
                self.config.threshold_for_recovery,
                self.bus.clone(),
            );
            versions.insert(number, version.clone());
            (version, helpers, fragments)
        };
        info!(secret = %self.id, version = version.number(), helpers = helpers.len(), "distributing version");

        let mut sent = 0;
        for client in &helpers {
            let Some(fragment) = fragments.get(client.index() - 1).cloned() else {
                warn!(helper = %client.id().name, "splitter returned too few fragments");
                continue;
            };
            let share = version.add_share(client.digest(), fragment);
            match client.send(share) {
                Ok(()) => sent += 1,
                Err(e) => warn!(helper = %client.id().name, "skipping helper: {}", e),
            }
        }

        let threshold = version.threshold_for_recovery();
        if sent < threshold {
            warn!(
                secret = %self.id,
                version = version.number(),
                sent,
                threshold,
                "too few helpers reached to protect version, not waiting"
            );
            return Ok(version);
        }

        let wait = self.config.retry.update_wait;
        if tokio::time::timeout(wait, version.wait_protected()).await.is_err() {
            warn!(
                secret = %self.id,
                version = version.number(),
                acks = version.acknowledged_count(),
                threshold = version.threshold_for_recovery(),
                "version not protected after {:?}",
                wait
            );
        }
        Ok(version)
    }

    /// pair with `helpers`; each one receives every existing version once paired
    pub fn add_helpers(self: &Arc<Self>, helpers: Vec<Identity>) -> Result<Vec<PairingHandle>> {
        // close() flips `closed` under the roster lock, so a client pushed here
        // is either refused or already INVITED when close() snapshots the roster
        let mut roster = self.roster();
        self.ensure_open()?;

        for (i, helper) in helpers.iter().enumerate() {
            let digest = helper.digest();
            let known = roster.helpers.iter().any(|c| c.digest() == digest)
                || helpers[..i].iter().any(|h| h.digest() == digest);
            if known {
                return Err(Error::DuplicateHelper(digest));
            }
        }
        if roster.next_index + helpers.len() > MAX_FRAGMENTS + 1 {
            return Err(Error::InvalidThreshold {
                threshold: self.config.threshold_for_recovery,
                count: roster.next_index - 1 + helpers.len(),
            });
        }

        let mut handles = Vec::with_capacity(helpers.len());
        for helper in helpers {
            let client = HelperClient::new(
                self.id,
                self.sharer.clone(),
                helper,
                roster.next_index,
                self.transport.clone(),
                self.config.retry.clone(),
                self.bus.clone(),
            );
            roster.next_index += 1;
            roster.helpers.push(client.clone());
            client.pair()?;

            let secret = Arc::downgrade(self);
            let task_client = client.clone();
            let task = tokio::spawn(async move { catch_up(secret, task_client).await });
            handles.push(PairingHandle { client, task });
        }
        Ok(handles)
    }

    /// send every version `client` does not hold yet
    fn send_existing(&self, client: &Arc<HelperClient>) -> Result<usize> {
        let index = client.index();
        let mut sent = 0;
        for version in self.versions() {
            if client.share(version.number()).is_some() {
                continue;
            }
            let mut fragments = self.split(version.number(), version.protected_value(), index)?;
            if fragments.len() < index {
                return Err(Error::InvalidShareFormat);
            }
            let fragment = fragments.swap_remove(index - 1);
            client.send(version.add_share(client.digest(), fragment))?;
            sent += 1;
        }
        Ok(sent)
    }

    /// unpair `digest`, drop it from the roster and drop its shares from every
    /// version, so it no longer counts toward protection
    pub async fn remove_helper(&self, digest: &KeyDigest) -> Result<PairingStatus> {
        self.ensure_open()?;
        let client = self.helper(digest).ok_or(Error::UnknownHelper(*digest))?;

        let status = client.close().await;
        self.roster().helpers.retain(|c| !Arc::ptr_eq(c, &client));
        let dropped = self
            .versions()
            .iter()
            .filter(|v| v.remove_share(digest).is_some())
            .count();
        info!(secret = %self.id, helper = %client.id().name, %status, dropped, "helper removed");
        Ok(status)
    }

    /// challenge every paired helper holding a shared share of `number`.
    /// returns the number of challenges issued.
    pub fn verify_version(&self, number: u64) -> Result<usize> {
        self.ensure_open()?;
        if self.version(number).is_none() {
            return Err(Error::UnknownVersion(number));
        }

        let mut issued = 0;
        for client in self.paired_helpers() {
            let Some(share) = client.share(number) else {
                continue;
            };
            if !share.is_shared() {
                continue;
            }
            match client.verify(&share) {
                Ok(()) => issued += 1,
                Err(e) => warn!(helper = %client.id().name, version = number, "not verifying: {}", e),
            }
        }
        Ok(issued)
    }

    /// versions superseded by a newer one with enough acknowledgements to purge them.
    /// advisory only, nothing is deleted.
    pub fn deletable_versions(&self) -> Vec<u64> {
        let threshold = self.config.threshold_for_deletion;
        let versions = self.versions_map();
        let newest_confirmed = versions
            .values()
            .rev()
            .find(|v| v.acknowledged_count() >= threshold)
            .map(|v| v.number());

        match newest_confirmed {
            Some(newest) => versions.range(..newest).map(|(n, _)| *n).collect(),
            None => Vec::new(),
        }
    }

    /// refuse further mutation, then unpair every helper (bounded per helper)
    pub async fn close(&self) {
        let helpers = {
            let roster = self.roster();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            roster.helpers.clone()
        };
        info!(secret = %self.id, helpers = helpers.len(), "closing secret");

        let statuses = join_all(helpers.iter().map(|c| c.close())).await;
        for (client, status) in helpers.iter().zip(statuses) {
            debug!(helper = %client.id().name, %status, "helper closed");
        }
    }
}

async fn catch_up(secret: Weak<Secret>, client: Arc<HelperClient>) -> PairingStatus {
    let mut rx = client.subscribe_status();
    let status = match rx.wait_for(|s| !s.is_pending()).await {
        Ok(status) => *status,
        Err(_) => client.status(),
    };
    if status != PairingStatus::Paired {
        return status;
    }

    let Some(secret) = secret.upgrade() else {
        return status;
    };
    if secret.is_closed() {
        return status;
    }
    match secret.send_existing(&client) {
        Ok(0) => {}
        Ok(sent) => debug!(helper = %client.id().name, sent, "sent earlier versions"),
        Err(e) => warn!(helper = %client.id().name, "catch-up incomplete: {}", e),
    }
    status
}
