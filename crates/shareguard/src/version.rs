//! an immutable snapshot of a secret's value and the shares distributed for it

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::ids::{KeyDigest, SecretId};
use crate::notification::{Notification, NotificationBus, NotificationKind, Severity};
use crate::share::Share;

pub struct Version {
    secret_id: SecretId,
    number: u64,
    value: Vec<u8>,
    threshold_for_recovery: usize,
    shares: Mutex<BTreeMap<KeyDigest, Arc<Share>>>,
    /// acknowledged share count, for threshold waiters
    acks: watch::Sender<usize>,
    bus: NotificationBus,
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("secret_id", &self.secret_id)
            .field("number", &self.number)
            .field("acknowledged", &*self.acks.borrow())
            .field("threshold_for_recovery", &self.threshold_for_recovery)
            .finish()
    }
}

impl Version {
    pub(crate) fn new(
        secret_id: SecretId,
        number: u64,
        value: Vec<u8>,
        threshold_for_recovery: usize,
        bus: NotificationBus,
    ) -> Arc<Self> {
        let (acks, _) = watch::channel(0);
        Arc::new(Self {
            secret_id,
            number,
            value,
            threshold_for_recovery,
            shares: Mutex::new(BTreeMap::new()),
            acks,
            bus,
        })
    }

    fn shares_map(&self) -> MutexGuard<'_, BTreeMap<KeyDigest, Arc<Share>>> {
        self.shares.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// the share for `helper`, creating it from `content` if this is the first
    pub(crate) fn add_share(self: &Arc<Self>, helper: KeyDigest, content: Vec<u8>) -> Arc<Share> {
        self.shares_map()
            .entry(helper)
            .or_insert_with(|| Arc::new(Share::new(self, helper, content)))
            .clone()
    }

    /// forget `helper`'s share and recount
    pub(crate) fn remove_share(&self, helper: &KeyDigest) -> Option<Arc<Share>> {
        let removed = self.shares_map().remove(helper);
        if removed.is_some() {
            self.refresh();
        }
        removed
    }

    pub fn secret_id(&self) -> SecretId {
        self.secret_id
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// value of the secret at this version, before splitting
    pub fn protected_value(&self) -> &[u8] {
        &self.value
    }

    pub fn threshold_for_recovery(&self) -> usize {
        self.threshold_for_recovery
    }

    pub fn shares(&self) -> Vec<Arc<Share>> {
        self.shares_map().values().cloned().collect()
    }

    pub fn share_for(&self, helper: &KeyDigest) -> Option<Arc<Share>> {
        self.shares_map().get(helper).cloned()
    }

    /// shares whose store was acknowledged
    pub fn acknowledged_count(&self) -> usize {
        self.shares_map().values().filter(|s| s.is_shared()).count()
    }

    /// enough helpers hold a share for this version to be recovered
    pub fn is_protected(&self) -> bool {
        self.acknowledged_count() >= self.threshold_for_recovery
    }

    /// recount acknowledgements after a share result landed
    pub(crate) fn refresh(&self) {
        let shares = self.shares_map();
        let count = shares.values().filter(|s| s.is_shared()).count();
        let previous = self.acks.send_replace(count);
        drop(shares);

        let threshold = self.threshold_for_recovery;
        if previous < threshold && count >= threshold {
            info!(secret = %self.secret_id, version = self.number, acks = count, "version protected");
            self.bus.publish(
                Notification::new(
                    NotificationKind::VersionProtected,
                    Severity::Normal,
                    format!("version {} protected by {} helpers", self.number, count),
                )
                .secret(self.secret_id)
                .version(self.number),
            );
        } else if previous >= threshold && count < threshold {
            warn!(secret = %self.secret_id, version = self.number, acks = count, "version no longer protected");
        }
    }

    /// resolves once the recovery threshold is reached
    pub async fn wait_protected(&self) {
        let threshold = self.threshold_for_recovery;
        let mut rx = self.acks.subscribe();
        // the sender lives as long as self, so this only ends on success
        let _ = rx.wait_for(|count| *count >= threshold).await;
    }
}
