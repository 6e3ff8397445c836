//! human readable status summaries

use std::collections::BTreeMap;

use crate::ids::{KeyDigest, SecretId};
use crate::secret::Secret;
use crate::sharer::Sharer;

/// one "name: STATUS" line per helper, in roster order
pub fn helper_statuses(secret: &Secret) -> Vec<String> {
    secret
        .helpers()
        .iter()
        .map(|c| format!("{}: {}", c.id().name, c.status()))
        .collect()
}

/// one line per version with its protection state
pub fn version_statuses(secret: &Secret) -> Vec<String> {
    secret
        .versions()
        .iter()
        .map(|v| {
            let acks = v.acknowledged_count();
            if acks >= v.threshold_for_recovery() {
                format!("{}: protected ({} of {})", v.number(), acks, v.threshold_for_recovery())
            } else {
                format!("{}: unprotected ({} of {})", v.number(), acks, v.threshold_for_recovery())
            }
        })
        .collect()
}

/// versions `helper` acknowledged storing
pub fn versions_for_helper(secret: &Secret, helper: &KeyDigest) -> Vec<u64> {
    secret
        .helper(helper)
        .map(|c| {
            c.shares()
                .iter()
                .filter(|s| s.is_shared())
                .map(|s| s.version_number())
                .collect()
        })
        .unwrap_or_default()
}

/// which secrets each helper is on the roster of
pub fn helpers_and_secrets(sharer: &Sharer) -> BTreeMap<KeyDigest, Vec<SecretId>> {
    let mut map: BTreeMap<KeyDigest, Vec<SecretId>> = BTreeMap::new();
    for secret in sharer.secrets() {
        for client in secret.helpers() {
            map.entry(client.digest()).or_default().push(secret.id());
        }
    }
    map
}
