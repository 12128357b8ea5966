//! # pinvault
//!
//! rate limited release of high entropy secrets behind short pins, plus an
//! authenticated key blob format.
//!
//! ## architecture
//!
//! ```text
//!   le_secret (pin)
//!        │ hkdf(salt)
//!        ▼
//!  ┌───────────────┐   challenge/response   ┌────────────────────┐
//!  │ policy signer │ ─────────────────────▶ │  sealing backend   │
//!  └───────────────┘                        │ (pcr bound, tpm or │
//!        ▲                                  │  software)         │
//!        │ salt, schedule, attempts         └─────────┬──────────┘
//!  ┌─────┴─────────────────────────┐                  │ he_secret
//!  │ hash tree store               │                  ▼
//!  │ leaves -> sha256 tree -> root │            caller
//!  │ root bound to a monotonic ctr │
//!  └───────────────────────────────┘
//! ```
//!
//! ## security properties
//!
//! - the delay schedule is evaluated before any work on the candidate pin
//! - wrong attempts are committed to the store before the error returns
//! - tampering with one leaf only breaks that label
//! - restoring an old copy of the store is caught by the anti-replay counter,
//!   which the root record binds under a key derived from the root key
//! - key blobs are bound to their hidden authorizations; any failure to open
//!   one looks the same to the caller
//!
//! ## usage
//!
//! ```rust,ignore
//! use pinvault::{counter::MemoryCounter, delay::{Delay, DelaySchedule}};
//! use pinvault::{manager::LeCredentialManager, sealing::SoftwareSealingBackend};
//! use pinvault::{store::HashTreeStore, tree::TreeGeometry};
//!
//! let store = HashTreeStore::open(dir, TreeGeometry::default(), MemoryCounter::new(), &root_key)?;
//! let backend = SoftwareSealingBackend::from_root_key(&root_key);
//! let auth = backend.auth_values();
//! let mut mgr = LeCredentialManager::new(store, backend, auth);
//!
//! let schedule = DelaySchedule::new().with(5, Delay::Infinite);
//! let label = mgr.insert_credential(b"1234", b"he secret", b"reset", &schedule, &[])?;
//! let secrets = mgr.check_credential(label, b"1234")?;
//! ```

pub mod authset;
pub mod clock;
pub mod config;
pub mod counter;
pub mod crypto;
pub mod delay;
mod encoding;
pub mod error;
pub mod key_provider;
pub mod keyblob;
pub mod manager;
pub mod sealing;
pub mod store;
pub mod tree;

pub use authset::{AuthorizationSet, KeyParam, Tag, TagType, Value};
pub use config::Config;
pub use delay::{Delay, DelaySchedule};
pub use error::{
    AuthSetError, ErrorClass, HashTreeError, KeyBlobError, LeCredError, SealingError,
};
pub use keyblob::{KeyBlobCodec, KeyBlobContext};
pub use manager::{CheckedSecrets, CredentialState, LeCredentialManager};
pub use sealing::{SecretSealingBackend, SoftwareSealingBackend};
pub use store::HashTreeStore;
