//! one helper's fragment of one version
//!
//! a share carries at most one outstanding exchange. issuing a new exchange
//! aborts the previous one and bumps the share's generation; a completion
//! whose generation is no longer current is stale and gets dropped.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::task::AbortHandle;

use crate::ids::{KeyDigest, SecretId};
use crate::version::Version;

#[derive(Debug, Default)]
struct ShareState {
    is_shared: bool,
    is_verified: bool,
    nonce: Option<u64>,
    last_error: Option<String>,
    generation: u64,
    outstanding: Option<AbortHandle>,
}

/// outcome of applying a completed exchange to a share
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Applied {
    /// result of a superseded exchange, ignored
    Stale,
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub struct Share {
    secret_id: SecretId,
    version_number: u64,
    helper: KeyDigest,
    content: Vec<u8>,
    version: Weak<Version>,
    state: Mutex<ShareState>,
}

impl Share {
    pub(crate) fn new(
        version: &Arc<Version>,
        helper: KeyDigest,
        content: Vec<u8>,
    ) -> Self {
        Self {
            secret_id: version.secret_id(),
            version_number: version.number(),
            helper,
            content,
            version: Arc::downgrade(version),
            state: Mutex::new(ShareState::default()),
        }
    }

    // state is plain data, a poisoned lock still holds a usable value
    fn state(&self) -> MutexGuard<'_, ShareState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn secret_id(&self) -> SecretId {
        self.secret_id
    }

    pub fn version_number(&self) -> u64 {
        self.version_number
    }

    /// the version this share belongs to, while its secret is alive
    pub fn version(&self) -> Option<Arc<Version>> {
        self.version.upgrade()
    }

    pub fn helper(&self) -> KeyDigest {
        self.helper
    }

    /// fragment sent to the helper
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// helper acknowledged storing this share
    pub fn is_shared(&self) -> bool {
        self.state().is_shared
    }

    /// helper answered a verification challenge correctly
    pub fn is_verified(&self) -> bool {
        self.state().is_verified
    }

    /// challenge of the most recent verification
    pub fn nonce(&self) -> Option<u64> {
        self.state().nonce
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn has_outstanding_exchange(&self) -> bool {
        self.state().outstanding.is_some()
    }

    /// cancel any outstanding exchange and open a new generation
    pub(crate) fn begin_exchange(&self) -> u64 {
        let mut state = self.state();
        if let Some(stale) = state.outstanding.take() {
            stale.abort();
        }
        state.generation += 1;
        state.generation
    }

    /// like [`Share::begin_exchange`] but also draws a fresh challenge
    pub(crate) fn begin_verify(&self) -> (u64, u64) {
        let generation = self.begin_exchange();
        let nonce: u64 = rand::random();
        self.state().nonce = Some(nonce);
        (generation, nonce)
    }

    /// remember the task driving `generation` so a later exchange can abort it
    pub(crate) fn attach(&self, generation: u64, handle: AbortHandle) {
        let mut state = self.state();
        if state.generation == generation {
            state.outstanding = Some(handle);
        } else {
            handle.abort();
        }
    }

    pub(crate) fn complete_store(&self, generation: u64, error: Option<String>) -> Applied {
        let mut state = self.state();
        if state.generation != generation {
            return Applied::Stale;
        }
        state.outstanding = None;
        match error {
            None => {
                state.is_shared = true;
                state.last_error = None;
                Applied::Succeeded
            }
            Some(e) => {
                state.last_error = Some(e);
                Applied::Failed
            }
        }
    }

    pub(crate) fn complete_verify(&self, generation: u64, error: Option<String>) -> Applied {
        let mut state = self.state();
        if state.generation != generation {
            return Applied::Stale;
        }
        state.outstanding = None;
        match error {
            None => {
                state.is_verified = true;
                state.last_error = None;
                Applied::Succeeded
            }
            Some(e) => {
                state.last_error = Some(e);
                Applied::Failed
            }
        }
    }
}
