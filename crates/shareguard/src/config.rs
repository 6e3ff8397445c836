//! configuration for secrets and their exchanges

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// protocol version spoken by this implementation
pub const PROTOCOL_VERSION_MAJOR: u32 = 0;
pub const PROTOCOL_VERSION_MINOR: u32 = 9;

/// timeouts and retry budget for helper exchanges
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryParameters {
    /// how long close/remove wait for an outstanding pairing or unpairing
    #[serde(with = "millis")]
    pub pairing_wait: Duration,
    /// per-exchange response timeout
    #[serde(with = "millis")]
    pub response_timeout: Duration,
    /// connection timeout for network transports
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// how long update() blocks waiting for the recovery threshold
    #[serde(with = "millis")]
    pub update_wait: Duration,
    /// re-sends after a transport failure (0 = never retry)
    pub max_retries: u32,
}

impl Default for RetryParameters {
    fn default() -> Self {
        Self {
            pairing_wait: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            update_wait: Duration::from_secs(5),
            max_retries: 0,
        }
    }
}

/// per-secret thresholds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretConfig {
    /// acknowledgements needed for a version to count as protected
    pub threshold_for_recovery: usize,
    /// acknowledgements a newer version needs before older shares may be purged
    pub threshold_for_deletion: usize,
    #[serde(default)]
    pub retry: RetryParameters,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            threshold_for_recovery: 3,
            threshold_for_deletion: 4,
            retry: RetryParameters::default(),
        }
    }
}

/// defaults a sharer applies to the secrets it creates
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharerConfig {
    #[serde(default)]
    pub secret: SecretConfig,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
