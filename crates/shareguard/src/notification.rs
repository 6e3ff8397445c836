//! status notifications
//!
//! producers enqueue into an unbounded channel and return immediately; a
//! dedicated delivery thread hands each notification to the listener. a slow or
//! re-entrant listener therefore can never stall a protocol exchange.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::ids::{KeyDigest, SecretId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

/// what happened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    HelperPaired,
    HelperNotPaired,
    HelperUnpaired,
    UnpairFailed,
    ShareStored,
    ShareFailed,
    VerifySucceeded,
    VerifyFailed,
    VersionProtected,
    ListAvailable,
    ListFailed,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::HelperPaired => "HELPER_PAIRED",
            NotificationKind::HelperNotPaired => "HELPER_NOT_PAIRED",
            NotificationKind::HelperUnpaired => "HELPER_UNPAIRED",
            NotificationKind::UnpairFailed => "UNPAIR_FAILED",
            NotificationKind::ShareStored => "SHARE_STORED",
            NotificationKind::ShareFailed => "SHARE_FAILED",
            NotificationKind::VerifySucceeded => "VERIFY_SUCCEEDED",
            NotificationKind::VerifyFailed => "VERIFY_FAILED",
            NotificationKind::VersionProtected => "VERSION_PROTECTED",
            NotificationKind::ListAvailable => "LIST_AVAILABLE",
            NotificationKind::ListFailed => "LIST_FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    /// absent for listings, which are not tied to a secret
    pub secret: Option<SecretId>,
    pub version: Option<u64>,
    pub helper: Option<KeyDigest>,
    pub severity: Severity,
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            secret: None,
            version: None,
            helper: None,
            severity,
            kind,
            message: message.into(),
        }
    }

    pub fn secret(mut self, id: SecretId) -> Self {
        self.secret = Some(id);
        self
    }

    pub fn version(mut self, number: u64) -> Self {
        self.version = Some(number);
        self
    }

    pub fn helper(mut self, digest: KeyDigest) -> Self {
        self.helper = Some(digest);
        self
    }
}

/// receives every notification published on a bus
pub type Listener = Arc<dyn Fn(Notification) + Send + Sync>;

/// fan-out of notifications to a single, replaceable listener
#[derive(Clone)]
pub struct NotificationBus {
    tx: mpsc::UnboundedSender<Notification>,
    listener: Arc<RwLock<Option<Listener>>>,
}

impl NotificationBus {
    /// bus delivering to `listener`, or discarding when none
    pub fn new(listener: Option<Listener>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let listener = Arc::new(RwLock::new(listener));

        let sink = listener.clone();
        // the thread exits once every sender is dropped
        thread::Builder::new()
            .name("shareguard-notify".into())
            .spawn(move || {
                while let Some(notification) = rx.blocking_recv() {
                    let current = sink.read().ok().and_then(|l| l.clone());
                    match current {
                        Some(deliver) => deliver(notification),
                        None => trace!(kind = %notification.kind, "notification discarded"),
                    }
                }
            })
            .map_err(|e| tracing::error!("cannot start notification thread: {}", e))
            .ok();

        Self { tx, listener }
    }

    /// bus that drops everything
    pub fn noop() -> Self {
        Self::new(None)
    }

    /// replace the listener for notifications not yet delivered
    pub fn set_listener(&self, listener: Option<Listener>) {
        if let Ok(mut slot) = self.listener.write() {
            *slot = listener;
        }
    }

    /// enqueue without blocking
    pub fn publish(&self, notification: Notification) {
        debug!(
            kind = %notification.kind,
            severity = ?notification.severity,
            version = ?notification.version,
            "{}",
            notification.message
        );
        if self.tx.send(notification).is_err() {
            trace!("notification bus closed");
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::noop()
    }
}
