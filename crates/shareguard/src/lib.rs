//! # shareguard
//!
//! sharer-side coordination for threshold secret sharing with helpers.
//!
//! a sharer splits each version of a secret into fragments, hands one to every
//! paired helper and considers the version protected once enough helpers
//! acknowledge storing theirs. splitting and transport are pluggable; this crate
//! owns the pairing state machines, the threshold bookkeeping and the wire
//! contract the two sides speak.
//!
//! ## architecture
//!
//! ```text
//!              ┌──────────┐
//!              │  Sharer  │  registry, listing
//!              └────┬─────┘
//!                   │ owns
//!              ┌────┴─────┐        ┌──────────┐
//!              │  Secret  │───────▶│ Version n│  ack count, protected?
//!              └────┬─────┘        └────┬─────┘
//!                   │ roster            │ shares
//!        ┌──────────┼──────────┐        │
//!        ▼          ▼          ▼        ▼
//!  ┌──────────┐┌──────────┐┌──────────┐
//!  │ Helper   ││ Helper   ││ Helper   │  pairing state, one exchange per share
//!  │ Client 1 ││ Client 2 ││ Client 3 │
//!  └────┬─────┘└────┬─────┘└────┬─────┘
//!       └───────────┼───────────┘
//!                   ▼ Transport (loopback / http)
//!             helpers, notifications ──▶ listener
//! ```
//!
//! ## usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use shareguard::{Identity, LoopbackTransport, ShamirSplitter, Sharer, SharerConfig};
//!
//! let transport = Arc::new(LoopbackTransport::new());
//! let me = Identity::new("me", "me@example.com", "loopback://me", &my_public_key);
//! let sharer = Sharer::new(me, SharerConfig::default(), transport, Arc::new(ShamirSplitter::new()));
//!
//! let secret = sharer.new_secret("vault key", Some(key.to_vec()), helpers).await?;
//! let v2 = secret.update(new_key.to_vec()).await?;
//! println!("protected: {}", v2.is_protected());
//! ```

pub mod config;
pub mod error;
pub mod helper;
pub mod helper_client;
pub mod ids;
pub mod loopback;
pub mod message;
pub mod notification;
pub mod report;
pub mod secret;
pub mod share;
pub mod sharer;
pub mod splitter;
pub mod transport;
pub mod version;

pub use config::{RetryParameters, SecretConfig, SharerConfig};
pub use error::{Error, Result};
pub use helper::{HelperResponder, MemoryStorage, Storage, StoredShare};
pub use helper_client::{HelperClient, PairingStatus};
pub use ids::{Identity, KeyDigest, SecretId};
pub use loopback::{Behavior, LoopbackTransport};
pub use message::{HelperBody, Message, SecretVersions, SharerBody, Status};
pub use notification::{Listener, Notification, NotificationBus, NotificationKind, Severity};
pub use secret::{PairingHandle, Secret};
pub use share::Share;
pub use sharer::Sharer;
pub use splitter::{ShamirSplitter, Splitter};
pub use transport::Transport;
pub use version::Version;

#[cfg(feature = "network")]
pub use transport::HttpTransport;
