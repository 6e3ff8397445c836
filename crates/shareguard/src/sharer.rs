//! the secrets owned by one identity

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SharerConfig;
use crate::helper_client::round_trip;
use crate::ids::{Identity, SecretId};
use crate::message::{HelperBody, Message, SecretVersions, SharerBody};
use crate::notification::{Listener, Notification, NotificationBus, NotificationKind, Severity};
use crate::secret::Secret;
use crate::splitter::Splitter;
use crate::transport::Transport;
use crate::{Error, Result};

/// factory and registry of secrets
pub struct Sharer {
    identity: Identity,
    config: SharerConfig,
    transport: Arc<dyn Transport>,
    splitter: Arc<dyn Splitter>,
    bus: NotificationBus,
    secrets: RwLock<BTreeMap<SecretId, Arc<Secret>>>,
}

impl fmt::Debug for Sharer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sharer")
            .field("identity", &self.identity.name)
            .field("secrets", &self.secrets.read().map(|s| s.len()).unwrap_or(0))
            .finish()
    }
}

impl Sharer {
    pub fn new(
        identity: Identity,
        config: SharerConfig,
        transport: Arc<dyn Transport>,
        splitter: Arc<dyn Splitter>,
    ) -> Self {
        Self {
            identity,
            config,
            transport,
            splitter,
            bus: NotificationBus::noop(),
            secrets: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &SharerConfig {
        &self.config
    }

    /// replace the listener receiving every notification of this sharer's secrets
    pub fn set_listener(&self, listener: Option<Listener>) {
        self.bus.set_listener(listener);
    }

    /// create a secret under a fresh random id
    pub async fn new_secret(
        &self,
        description: &str,
        content: Option<Vec<u8>>,
        helpers: Vec<Identity>,
    ) -> Result<Arc<Secret>> {
        self.new_secret_with_id(SecretId::random(), description, content, helpers)
            .await
    }

    /// create a secret, pair with `helpers` and, when given, store `content` as version 1
    pub async fn new_secret_with_id(
        &self,
        id: SecretId,
        description: &str,
        content: Option<Vec<u8>>,
        helpers: Vec<Identity>,
    ) -> Result<Arc<Secret>> {
        let secret = Secret::new(
            id,
            description,
            self.config.secret.clone(),
            self.identity.clone(),
            self.transport.clone(),
            self.splitter.clone(),
            self.bus.clone(),
        )?;

        {
            let mut secrets = self.secrets.write().unwrap_or_else(|e| e.into_inner());
            if secrets.contains_key(&id) {
                return Err(Error::DuplicateSecret(id));
            }
            secrets.insert(id, secret.clone());
        }
        info!(secret = %id, description, helpers = helpers.len(), "new secret");

        let handles = match secret.add_helpers(helpers) {
            Ok(handles) => handles,
            Err(e) => {
                self.secrets.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
                return Err(e);
            }
        };
        let wait = self.config.secret.retry.pairing_wait;
        let paired = tokio::time::timeout(wait, join_all(handles.into_iter().map(|h| h.wait()))).await;
        if paired.is_err() {
            warn!(secret = %id, "not every helper settled pairing within {:?}", wait);
        }

        if let Some(content) = content {
            secret.update(content).await?;
        }
        Ok(secret)
    }

    pub fn secret(&self, id: &SecretId) -> Option<Arc<Secret>> {
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        secrets.get(id).cloned()
    }

    /// all secrets, ordered by id
    pub fn secrets(&self) -> Vec<Arc<Secret>> {
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        secrets.values().cloned().collect()
    }

    /// ask `helper` which versions of which secrets it holds for this sharer.
    ///
    /// never fails: on any error the result is empty and a warning is published.
    pub fn get_secret_ids_versions(&self, helper: &Identity) -> JoinHandle<SecretVersions> {
        let message = Message::request(
            self.identity.digest(),
            helper.digest(),
            None,
            SharerBody::ListVersionsRequest,
        );
        let transport = self.transport.clone();
        let retry = self.config.secret.retry.clone();
        let bus = self.bus.clone();
        let helper = helper.clone();

        tokio::spawn(async move {
            let result = round_trip(transport.as_ref(), &helper, message, &retry)
                .await
                .and_then(|body| match body {
                    HelperBody::ListVersionsResponse { status, secrets, .. } if status.is_ok() => Ok(secrets),
                    HelperBody::ListVersionsResponse { memo, .. } => Err(Error::Protocol(memo)),
                    other => Err(Error::UnexpectedMessage(other.kind().into())),
                });

            match result {
                Ok(mut secrets) => {
                    for versions in secrets.values_mut() {
                        versions.sort_unstable();
                        versions.dedup();
                    }
                    bus.publish(
                        Notification::new(
                            NotificationKind::ListAvailable,
                            Severity::Normal,
                            format!("{} holds {} secrets", helper.name, secrets.len()),
                        )
                        .helper(helper.digest()),
                    );
                    secrets
                }
                Err(e) => {
                    warn!(helper = %helper.name, "listing failed: {}", e);
                    bus.publish(
                        Notification::new(
                            NotificationKind::ListFailed,
                            Severity::Warning,
                            format!("listing {} failed: {}", helper.name, e),
                        )
                        .helper(helper.digest()),
                    );
                    SecretVersions::new()
                }
            }
        })
    }

    /// close every secret
    pub async fn close(&self) {
        let secrets = self.secrets();
        join_all(secrets.iter().map(|s| s.close())).await;
    }
}
