//! the sharer's session with one helper for one secret
//!
//! ## pairing state machine
//!
//! ```text
//!   NONE ──pair──▶ INVITED ──ok──▶ PAIRED ──unpair──▶ PENDING_REMOVAL ──ok──▶ REMOVED
//!    ▲               │                                   │
//!    │               └──fail──▶ FAILED ◀──────fail───────┘
//!    └─────────── (pair again) ──┘
//! ```
//!
//! every exchange is issued from the caller's thread and completed by a
//! spawned task. both sides take the client lock only for the in-memory
//! transition, never across the round trip.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::RetryParameters;
use crate::ids::{Identity, KeyDigest, SecretId};
use crate::message::{HelperBody, Message, SharerBody};
use crate::notification::{Notification, NotificationBus, NotificationKind, Severity};
use crate::share::{Applied, Share};
use crate::transport::Transport;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PairingStatus {
    /// pairing not yet attempted
    None,
    /// pair request sent
    Invited,
    Paired,
    /// unpair request sent
    PendingRemoval,
    /// unpaired, the client is about to be discarded
    Removed,
    Failed,
}

impl PairingStatus {
    /// an exchange is in flight that will move the status on
    pub fn is_pending(self) -> bool {
        matches!(self, PairingStatus::Invited | PairingStatus::PendingRemoval)
    }
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PairingStatus::None => "NONE",
            PairingStatus::Invited => "INVITED",
            PairingStatus::Paired => "PAIRED",
            PairingStatus::PendingRemoval => "PENDING_REMOVAL",
            PairingStatus::Removed => "REMOVED",
            PairingStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

struct ClientState {
    status: PairingStatus,
    /// shares sent to this helper, by version number
    shares: BTreeMap<u64, Arc<Share>>,
}

pub struct HelperClient {
    secret_id: SecretId,
    sharer: Identity,
    helper: Identity,
    /// x-coordinate of this helper's fragments, stable for the secret's life
    index: usize,
    transport: Arc<dyn Transport>,
    retry: RetryParameters,
    bus: NotificationBus,
    state: Mutex<ClientState>,
    status_tx: watch::Sender<PairingStatus>,
}

impl fmt::Debug for HelperClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperClient")
            .field("secret_id", &self.secret_id)
            .field("helper", &self.helper.name)
            .field("index", &self.index)
            .field("status", &self.status())
            .finish()
    }
}

impl HelperClient {
    pub(crate) fn new(
        secret_id: SecretId,
        sharer: Identity,
        helper: Identity,
        index: usize,
        transport: Arc<dyn Transport>,
        retry: RetryParameters,
        bus: NotificationBus,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(PairingStatus::None);
        Arc::new(Self {
            secret_id,
            sharer,
            helper,
            index,
            transport,
            retry,
            bus,
            state: Mutex::new(ClientState {
                status: PairingStatus::None,
                shares: BTreeMap::new(),
            }),
            status_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, state: &mut ClientState, status: PairingStatus) {
        debug!(helper = %self.helper.name, from = %state.status, to = %status, "pairing status");
        state.status = status;
        self.status_tx.send_replace(status);
    }

    pub fn id(&self) -> &Identity {
        &self.helper
    }

    pub fn digest(&self) -> KeyDigest {
        self.helper.digest()
    }

    pub fn secret_id(&self) -> SecretId {
        self.secret_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> PairingStatus {
        self.lock().status
    }

    /// watch pairing status changes
    pub fn subscribe_status(&self) -> watch::Receiver<PairingStatus> {
        self.status_tx.subscribe()
    }

    /// shares sent to this helper, oldest version first
    pub fn shares(&self) -> Vec<Arc<Share>> {
        self.lock().shares.values().cloned().collect()
    }

    pub fn share(&self, version: u64) -> Option<Arc<Share>> {
        self.lock().shares.get(&version).cloned()
    }

    fn notify(&self, kind: NotificationKind, severity: Severity, version: Option<u64>, message: String) {
        let mut n = Notification::new(kind, severity, message)
            .secret(self.secret_id)
            .helper(self.digest());
        n.version = version;
        self.bus.publish(n);
    }

    fn request(&self, body: SharerBody) -> Message {
        Message::request(self.sharer.digest(), self.helper.digest(), Some(self.secret_id), body)
    }

    async fn exchange(&self, message: Message) -> Result<HelperBody> {
        round_trip(self.transport.as_ref(), &self.helper, message, &self.retry).await
    }

    /// start pairing; legal from NONE or FAILED
    pub fn pair(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.lock();
            if !matches!(state.status, PairingStatus::None | PairingStatus::Failed) {
                return Err(Error::InvalidPairingState {
                    operation: "pair",
                    status: state.status,
                });
            }
            self.set_status(&mut state, PairingStatus::Invited);
        }

        let message = self.request(SharerBody::pair(&self.sharer));
        let client = self.clone();
        tokio::spawn(async move {
            let result = client.exchange(message).await;
            client.finish_pair(result);
        });
        Ok(())
    }

    fn finish_pair(&self, result: Result<HelperBody>) {
        let outcome = result.and_then(|body| match body {
            HelperBody::PairResponse { status, memo } if status.is_ok() => Ok(memo),
            HelperBody::PairResponse { memo, .. } => Err(Error::Protocol(memo)),
            other => Err(Error::UnexpectedMessage(other.kind().into())),
        });

        {
            let mut state = self.lock();
            if state.status != PairingStatus::Invited {
                debug!(helper = %self.helper.name, status = %state.status, "ignoring late pair response");
                return;
            }
            let next = if outcome.is_ok() {
                PairingStatus::Paired
            } else {
                PairingStatus::Failed
            };
            self.set_status(&mut state, next);
        }

        match outcome {
            Ok(memo) => self.notify(
                NotificationKind::HelperPaired,
                Severity::Normal,
                None,
                format!("{} paired: {}", self.helper.name, memo),
            ),
            Err(e) => {
                warn!(helper = %self.helper.name, "pairing failed: {}", e);
                self.notify(
                    NotificationKind::HelperNotPaired,
                    Severity::Warning,
                    None,
                    format!("{} not paired: {}", self.helper.name, e),
                );
            }
        }
    }

    /// start unpairing; legal from PAIRED
    pub fn unpair(self: &Arc<Self>, reason: &str) -> Result<()> {
        {
            let mut state = self.lock();
            if state.status != PairingStatus::Paired {
                return Err(Error::InvalidPairingState {
                    operation: "unpair",
                    status: state.status,
                });
            }
            self.set_status(&mut state, PairingStatus::PendingRemoval);
        }

        let message = self.request(SharerBody::UnpairRequest { memo: reason.to_string() });
        let client = self.clone();
        tokio::spawn(async move {
            let result = client.exchange(message).await;
            client.finish_unpair(result);
        });
        Ok(())
    }

    fn finish_unpair(&self, result: Result<HelperBody>) {
        let outcome = result.and_then(|body| match body {
            HelperBody::UnpairResponse { status, memo } if status.is_ok() => Ok(memo),
            HelperBody::UnpairResponse { memo, .. } => Err(Error::Protocol(memo)),
            other => Err(Error::UnexpectedMessage(other.kind().into())),
        });

        {
            let mut state = self.lock();
            if state.status != PairingStatus::PendingRemoval {
                debug!(helper = %self.helper.name, status = %state.status, "ignoring late unpair response");
                return;
            }
            let next = if outcome.is_ok() {
                PairingStatus::Removed
            } else {
                PairingStatus::Failed
            };
            self.set_status(&mut state, next);
        }

        match outcome {
            Ok(memo) => self.notify(
                NotificationKind::HelperUnpaired,
                Severity::Normal,
                None,
                format!("{} unpaired: {}", self.helper.name, memo),
            ),
            Err(e) => {
                warn!(helper = %self.helper.name, "unpairing failed: {}", e);
                self.notify(
                    NotificationKind::UnpairFailed,
                    Severity::Warning,
                    None,
                    format!("{} unpair failed: {}", self.helper.name, e),
                );
            }
        }
    }

    /// store `share` with the helper, superseding any exchange still in flight for it
    pub fn send(self: &Arc<Self>, share: Arc<Share>) -> Result<()> {
        {
            let mut state = self.lock();
            if state.status != PairingStatus::Paired {
                return Err(Error::InvalidPairingState {
                    operation: "send to",
                    status: state.status,
                });
            }
            state.shares.insert(share.version_number(), share.clone());
        }

        let generation = share.begin_exchange();
        let message = self.request(SharerBody::StoreShareRequest {
            secret_id: share.secret_id(),
            version_number: share.version_number(),
            fragment: share.content().to_vec(),
        });

        let client = self.clone();
        let task_share = share.clone();
        let handle = tokio::spawn(async move {
            let result = client.exchange(message).await;
            client.finish_store(&task_share, generation, result);
        });
        share.attach(generation, handle.abort_handle());
        Ok(())
    }

    fn finish_store(&self, share: &Share, generation: u64, result: Result<HelperBody>) {
        let expected = share.version_number();
        let outcome = result.and_then(|body| match body {
            HelperBody::StoreShareResponse {
                version_number,
                status,
                memo,
            } => {
                if version_number != expected {
                    Err(Error::UnexpectedMessage(format!(
                        "store acknowledged version {}, expected {}",
                        version_number, expected
                    )))
                } else if !status.is_ok() {
                    Err(Error::Protocol(memo))
                } else {
                    Ok(())
                }
            }
            other => Err(Error::UnexpectedMessage(other.kind().into())),
        });

        match share.complete_store(generation, outcome.as_ref().err().map(|e| e.to_string())) {
            Applied::Stale => {
                debug!(helper = %self.helper.name, version = expected, "dropping stale store result");
            }
            Applied::Succeeded => {
                if let Some(version) = share.version() {
                    version.refresh();
                }
                self.notify(
                    NotificationKind::ShareStored,
                    Severity::Normal,
                    Some(expected),
                    format!("{} stored version {}", self.helper.name, expected),
                );
            }
            Applied::Failed => {
                let reason = outcome.err().map(|e| e.to_string()).unwrap_or_default();
                warn!(helper = %self.helper.name, version = expected, "store failed: {}", reason);
                self.notify(
                    NotificationKind::ShareFailed,
                    Severity::Warning,
                    Some(expected),
                    format!("{} failed to store version {}: {}", self.helper.name, expected, reason),
                );
            }
        }
    }

    /// challenge the helper to prove it still holds `share`
    pub fn verify(self: &Arc<Self>, share: &Arc<Share>) -> Result<()> {
        {
            let state = self.lock();
            if state.status != PairingStatus::Paired {
                return Err(Error::InvalidPairingState {
                    operation: "verify with",
                    status: state.status,
                });
            }
            let known = state
                .shares
                .get(&share.version_number())
                .map(|s| Arc::ptr_eq(s, share))
                .unwrap_or(false);
            if !known || !share.is_shared() {
                return Err(Error::ShareNotShared);
            }
        }

        let (generation, nonce) = share.begin_verify();
        let message = self.request(SharerBody::VerifyShareRequest {
            version_number: share.version_number(),
            nonce,
        });

        let client = self.clone();
        let task_share = share.clone();
        let handle = tokio::spawn(async move {
            let result = client.exchange(message).await;
            client.finish_verify(&task_share, generation, nonce, result);
        });
        share.attach(generation, handle.abort_handle());
        Ok(())
    }

    fn finish_verify(&self, share: &Share, generation: u64, nonce: u64, result: Result<HelperBody>) {
        let expected = share.version_number();
        let outcome = result.and_then(|body| match body {
            HelperBody::VerifyShareResponse {
                version_number,
                nonce: echoed,
                status,
            } => {
                if !status.is_ok() {
                    Err(Error::Protocol("helper could not verify share".into()))
                } else if echoed != nonce {
                    Err(Error::Protocol("nonce mismatch".into()))
                } else if version_number != expected {
                    Err(Error::Protocol(format!(
                        "verified version {}, expected {}",
                        version_number, expected
                    )))
                } else {
                    Ok(())
                }
            }
            other => Err(Error::UnexpectedMessage(other.kind().into())),
        });

        match share.complete_verify(generation, outcome.as_ref().err().map(|e| e.to_string())) {
            Applied::Stale => {
                debug!(helper = %self.helper.name, version = expected, "dropping stale verify result");
            }
            Applied::Succeeded => self.notify(
                NotificationKind::VerifySucceeded,
                Severity::Normal,
                Some(expected),
                format!("{} verified version {}", self.helper.name, expected),
            ),
            Applied::Failed => {
                let reason = outcome.err().map(|e| e.to_string()).unwrap_or_default();
                warn!(helper = %self.helper.name, version = expected, "verify failed: {}", reason);
                self.notify(
                    NotificationKind::VerifyFailed,
                    Severity::Warning,
                    Some(expected),
                    format!("{} failed to verify version {}: {}", self.helper.name, expected, reason),
                );
            }
        }
    }

    /// wait until no pairing exchange is in flight, or `deadline` passes
    pub async fn wait_settled(&self, deadline: Instant) -> PairingStatus {
        let mut rx = self.status_tx.subscribe();
        let settled = tokio::time::timeout_at(deadline, rx.wait_for(|s| !s.is_pending())).await;
        match settled {
            Ok(Ok(status)) => *status,
            _ => self.status(),
        }
    }

    /// unpair if paired and wait (bounded) for the helper to confirm
    pub async fn close(self: &Arc<Self>) -> PairingStatus {
        let deadline = Instant::now() + self.retry.pairing_wait;

        // let an outstanding pairing land before deciding
        if self.status() == PairingStatus::Invited {
            self.wait_settled(deadline).await;
        }
        if self.status() == PairingStatus::Paired {
            if let Err(e) = self.unpair("helper client is closing") {
                debug!(helper = %self.helper.name, "not unpairing: {}", e);
            }
        }

        let status = self.wait_settled(deadline).await;
        if status.is_pending() {
            error!(
                helper = %self.helper.name,
                status = %status,
                "gave up waiting for pairing to settle after {:?}",
                self.retry.pairing_wait
            );
        }
        status
    }
}

/// one round trip, bounded by the response timeout, retried on transport failure
pub(crate) async fn round_trip(
    transport: &dyn Transport,
    helper: &Identity,
    message: Message,
    retry: &RetryParameters,
) -> Result<HelperBody> {
    let timeout = retry.response_timeout;
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(
            timeout,
            transport.send_request(&helper.address, message.clone(), timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        };

        match result {
            Err(e) if e.is_transport() && attempt < retry.max_retries => {
                attempt += 1;
                warn!(helper = %helper.name, attempt, "retrying after {}", e);
            }
            other => return other.and_then(Message::into_helper_body),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::helper::HelperResponder;
    use crate::loopback::{Behavior, LoopbackTransport};
    use crate::version::Version;

    async fn settle_within(client: &HelperClient, wait: Duration) -> PairingStatus {
        client.wait_settled(Instant::now() + wait).await
    }

    struct Fixture {
        transport: Arc<LoopbackTransport>,
        client: Arc<HelperClient>,
        helper: Identity,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(LoopbackTransport::new());
        let helper = Identity::new("helper", "h@example.com", "loopback://helper", b"helper");
        let sharer = Identity::new("sharer", "s@example.com", "loopback://sharer", b"sharer");
        transport.register(HelperResponder::in_memory(helper.clone()));
        let retry = RetryParameters {
            response_timeout: Duration::from_millis(200),
            pairing_wait: Duration::from_millis(500),
            ..Default::default()
        };
        let client = HelperClient::new(
            SecretId::random(),
            sharer,
            helper.clone(),
            1,
            transport.clone(),
            retry,
            NotificationBus::noop(),
        );
        Fixture {
            transport,
            client,
            helper,
        }
    }

    async fn paired() -> Fixture {
        let f = fixture();
        f.client.pair().unwrap();
        assert_eq!(
            settle_within(&f.client, Duration::from_secs(1)).await,
            PairingStatus::Paired
        );
        f
    }

    fn version_share(f: &Fixture, number: u64) -> (Arc<Version>, Arc<Share>) {
        let version = Version::new(f.client.secret_id(), number, b"v".to_vec(), 1, NotificationBus::noop());
        let share = version.add_share(f.client.digest(), vec![1, number as u8]);
        (version, share)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_pair_then_guard() {
        let f = paired().await;
        let err = f.client.pair().unwrap_err();
        assert!(err.is_state_violation());
    }

    #[tokio::test]
    async fn test_rejected_pairing_fails_and_can_retry() {
        let f = fixture();
        f.transport.set_behavior(&f.helper.address, Behavior::Reject);
        f.client.pair().unwrap();
        assert_eq!(
            settle_within(&f.client, Duration::from_secs(1)).await,
            PairingStatus::Failed
        );

        f.transport.set_behavior(&f.helper.address, Behavior::Respond);
        f.client.pair().unwrap();
        assert_eq!(
            settle_within(&f.client, Duration::from_secs(1)).await,
            PairingStatus::Paired
        );
    }

    #[tokio::test]
    async fn test_send_requires_pairing() {
        let f = fixture();
        let (_version, share) = version_share(&f, 1);
        assert!(matches!(
            f.client.send(share),
            Err(Error::InvalidPairingState { status: PairingStatus::None, .. })
        ));
        assert!(f.client.shares().is_empty());
    }

    #[tokio::test]
    async fn test_send_acknowledged() {
        let f = paired().await;
        let (version, share) = version_share(&f, 1);
        f.client.send(share.clone()).unwrap();
        wait_until(|| share.is_shared()).await;
        assert!(version.is_protected());
        assert!(!share.has_outstanding_exchange());
    }

    #[tokio::test]
    async fn test_resend_supersedes_outstanding_exchange() {
        let f = paired().await;
        let (_version, share) = version_share(&f, 1);

        f.transport
            .set_behavior(&f.helper.address, Behavior::DelayReject(Duration::from_millis(100)));
        f.client.send(share.clone()).unwrap();
        // let the first request reach the helper before superseding it
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.transport.set_behavior(&f.helper.address, Behavior::Respond);
        f.client.send(share.clone()).unwrap();

        wait_until(|| share.is_shared()).await;
        // the rejected first exchange would land here if it were not cancelled
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(share.is_shared());
        assert_eq!(share.last_error(), None);
        assert_eq!(f.client.shares().len(), 1);
    }

    #[tokio::test]
    async fn test_verify_requires_shared_share() {
        let f = paired().await;
        let (_version, share) = version_share(&f, 1);
        assert!(matches!(f.client.verify(&share), Err(Error::ShareNotShared)));
    }

    #[tokio::test]
    async fn test_verify_nonce_mismatch_fails() {
        let f = paired().await;
        let (_version, share) = version_share(&f, 1);
        f.client.send(share.clone()).unwrap();
        wait_until(|| share.is_shared()).await;

        f.transport.set_behavior(&f.helper.address, Behavior::WrongNonce);
        f.client.verify(&share).unwrap();
        wait_until(|| share.last_error().is_some()).await;
        assert!(!share.is_verified());

        f.transport.set_behavior(&f.helper.address, Behavior::Respond);
        f.client.verify(&share).unwrap();
        wait_until(|| share.is_verified()).await;
    }

    #[tokio::test]
    async fn test_verify_version_mismatch_fails() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let bus = NotificationBus::new(Some(Arc::new(move |n: Notification| sink.lock().unwrap().push(n))));
        let client = HelperClient::new(
            f.client.secret_id(),
            Identity::new("sharer", "s@example.com", "loopback://sharer", b"sharer"),
            f.helper.clone(),
            1,
            f.transport.clone(),
            RetryParameters {
                response_timeout: Duration::from_millis(200),
                pairing_wait: Duration::from_millis(500),
                ..Default::default()
            },
            bus,
        );
        client.pair().unwrap();
        assert_eq!(settle_within(&client, Duration::from_secs(1)).await, PairingStatus::Paired);

        let version = Version::new(client.secret_id(), 4, b"v".to_vec(), 1, NotificationBus::noop());
        let share = version.add_share(client.digest(), vec![1, 4]);
        client.send(share.clone()).unwrap();
        wait_until(|| share.is_shared()).await;

        // right nonce, wrong version: the helper vouches for something else
        f.transport.set_behavior(&f.helper.address, Behavior::WrongVersion);
        client.verify(&share).unwrap();
        wait_until(|| share.last_error().is_some()).await;
        assert!(!share.is_verified());
        assert!(share.last_error().unwrap().contains("expected 4"));

        wait_until(|| {
            seen.lock()
                .unwrap()
                .iter()
                .any(|n| n.kind == NotificationKind::VerifyFailed && n.version == Some(4))
        })
        .await;
        let failed = seen
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.kind == NotificationKind::VerifyFailed)
            .cloned()
            .unwrap();
        assert_eq!(failed.severity, Severity::Warning);
        assert_eq!(failed.helper, Some(f.helper.digest()));
    }

    #[tokio::test]
    async fn test_close_unpairs() {
        let f = paired().await;
        assert_eq!(f.client.close().await, PairingStatus::Removed);
        assert!(f.client.unpair("again").is_err());
    }

    #[tokio::test]
    async fn test_close_gives_up_on_silent_helper() {
        let f = paired().await;
        f.transport.set_behavior(&f.helper.address, Behavior::Silent);
        // response timeout (200ms) < pairing wait (500ms): unpair fails in time
        assert_eq!(f.client.close().await, PairingStatus::Failed);
    }

    #[tokio::test]
    async fn test_transport_failure_retried_within_budget() {
        let transport = Arc::new(LoopbackTransport::new());
        let helper = Identity::new("helper", "h@example.com", "loopback://helper", b"helper");
        transport.register(HelperResponder::in_memory(helper.clone()));
        transport.set_behavior(&helper.address, Behavior::Unreachable);
        let client = HelperClient::new(
            SecretId::random(),
            Identity::new("sharer", "s@example.com", "loopback://sharer", b"sharer"),
            helper.clone(),
            1,
            transport.clone(),
            RetryParameters {
                max_retries: 2,
                ..Default::default()
            },
            NotificationBus::noop(),
        );
        client.pair().unwrap();
        assert_eq!(
            settle_within(&client, Duration::from_secs(1)).await,
            PairingStatus::Failed
        );
        assert_eq!(transport.request_count(&helper.address), 3);
    }
}
