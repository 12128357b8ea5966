//! low entropy credential manager
//!
//! a credential is a short user secret (pin, password) that releases a high
//! entropy secret only while its guessing budget lasts. each credential
//! occupies one label of the hash tree store:
//!
//! ```text
//! insert: salt -> hkdf(le_secret, salt) -> ed25519 policy key
//!         seal (he_secret, reset_secret) to that key (+ pcr criteria)
//!         seal reset_secret to hkdf(reset_secret, reset_salt)
//!         store leaf { salt, schedule, attempts = 0, sealed blobs }
//!
//! check:  load leaf -> delay verdict -> unseal -> update attempts
//! ```
//!
//! the delay verdict runs before any cryptographic work on the candidate
//! secret, and wrong attempts are persisted through the store before the
//! error is returned.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::clock::{Clock, SystemClock};
use crate::crypto::{ct_eq, derive_key, random_bytes, SecretBytes};
use crate::delay::{DelaySchedule, Verdict};
use crate::encoding::{decode, encode};
use crate::error::{HashTreeError, LeCredError, LeCredResult, SealingError, SealingResult};
use crate::sealing::{
    AuthValues, PcrCriterion, PolicySigner, SealingPolicy, SecretSealingBackend, MAX_PCR_CRITERIA,
};
use crate::store::HashTreeStore;

/// longest le, he or reset secret accepted
pub const MAX_SECRET_LEN: usize = 64;

const LEAF_VERSION: u8 = 1;
const LE_AUTH_INFO: &[u8] = b"pinvault:le-auth";
const RESET_AUTH_INFO: &[u8] = b"pinvault:reset-auth";

/// everything a credential keeps in its leaf
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialLeaf {
    version: u8,
    salt: [u8; 32],
    reset_salt: [u8; 32],
    schedule: DelaySchedule,
    wrong_attempts: u32,
    /// unix seconds of the last wrong attempt
    last_failure: u64,
    pcr_bound: bool,
    /// (he_secret, reset_secret) under the le policy
    sealed_secrets: Vec<u8>,
    /// reset_secret under the reset policy
    sealed_reset: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SecretPair {
    he_secret: Vec<u8>,
    reset_secret: Vec<u8>,
}

impl Drop for SecretPair {
    fn drop(&mut self) {
        self.he_secret.zeroize();
        self.reset_secret.zeroize();
    }
}

/// secrets released by a successful check
pub struct CheckedSecrets {
    pub he_secret: SecretBytes,
    pub reset_secret: SecretBytes,
}

impl std::fmt::Debug for CheckedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CheckedSecrets(<redacted>)")
    }
}

/// lifecycle state of a label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Free,
    Provisioned,
    Locked,
    Corrupted,
}

pub struct LeCredentialManager<B: SecretSealingBackend> {
    store: HashTreeStore,
    backend: B,
    auth: AuthValues,
    clock: Box<dyn Clock>,
}

impl<B: SecretSealingBackend> LeCredentialManager<B> {
    pub fn new(store: HashTreeStore, backend: B, auth: AuthValues) -> Self {
        Self { store, backend, auth, clock: Box::new(SystemClock) }
    }

    /// replace the time source used for delay enforcement
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn store(&self) -> &HashTreeStore {
        &self.store
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// provision a new credential on the lowest free label
    pub fn insert_credential(
        &mut self,
        le_secret: &[u8],
        he_secret: &[u8],
        reset_secret: &[u8],
        schedule: &DelaySchedule,
        pcr_criteria: &[PcrCriterion],
    ) -> LeCredResult<u64> {
        check_secret_len(le_secret, "le secret must be 1..=64 bytes")?;
        check_secret_len(he_secret, "he secret must be 1..=64 bytes")?;
        check_secret_len(reset_secret, "reset secret must be 1..=64 bytes")?;
        schedule.validate().map_err(LeCredError::InvalidDelaySchedule)?;
        if pcr_criteria.len() > MAX_PCR_CRITERIA {
            return Err(LeCredError::InvalidArgument("too many pcr criteria"));
        }
        if pcr_criteria.iter().any(|c| !c.is_valid()) {
            return Err(LeCredError::InvalidArgument("pcr mask selects no register or an unknown one"));
        }

        let label = self.store.first_free_label().ok_or(LeCredError::NoFreeLabel)?;

        let salt: [u8; 32] = random_bytes();
        let reset_salt: [u8; 32] = random_bytes();

        let pair = SecretPair { he_secret: he_secret.to_vec(), reset_secret: reset_secret.to_vec() };
        let plaintext = Zeroizing::new(encode(&pair).ok_or(LeCredError::InvalidMetadata)?);

        let le_policy = SealingPolicy {
            public_key: le_signer(le_secret, &salt).public_key(),
            pcr_criteria: pcr_criteria.to_vec(),
        };
        let sealed_secrets = self.seal(&le_policy, &plaintext)?;

        let reset_policy = SealingPolicy {
            public_key: reset_signer(reset_secret, &reset_salt).public_key(),
            pcr_criteria: Vec::new(),
        };
        let sealed_reset = self.seal(&reset_policy, reset_secret)?;

        let leaf = CredentialLeaf {
            version: LEAF_VERSION,
            salt,
            reset_salt,
            schedule: schedule.clone(),
            wrong_attempts: 0,
            last_failure: 0,
            pcr_bound: !pcr_criteria.is_empty(),
            sealed_secrets,
            sealed_reset,
        };
        self.persist(label, &leaf)?;

        info!(label, pcr_bound = leaf.pcr_bound, "inserted credential");
        Ok(label)
    }

    /// verify `le_secret` and release the sealed secrets
    pub fn check_credential(&mut self, label: u64, le_secret: &[u8]) -> LeCredResult<CheckedSecrets> {
        let mut leaf = self.load_leaf(label)?;

        let now = self.clock.now();
        match leaf.schedule.check(leaf.wrong_attempts, leaf.last_failure, now) {
            Verdict::Allowed => {}
            Verdict::Wait { remaining_secs } => {
                info!(label, attempts = leaf.wrong_attempts, remaining_secs, "credential throttled");
                return Err(LeCredError::TooManyAttempts);
            }
            Verdict::Locked => {
                info!(label, attempts = leaf.wrong_attempts, "credential locked");
                return Err(LeCredError::TooManyAttempts);
            }
        }

        let signer = le_signer(le_secret, &leaf.salt);
        match self.unseal(&leaf.sealed_secrets, &signer) {
            Ok(plaintext) => {
                let mut pair: SecretPair = decode(&plaintext).ok_or(LeCredError::InvalidMetadata)?;
                let secrets = CheckedSecrets {
                    he_secret: Zeroizing::new(std::mem::take(&mut pair.he_secret)),
                    reset_secret: Zeroizing::new(std::mem::take(&mut pair.reset_secret)),
                };
                if leaf.wrong_attempts != 0 {
                    leaf.wrong_attempts = 0;
                    leaf.last_failure = 0;
                    self.persist(label, &leaf)?;
                }
                debug!(label, "credential check passed");
                Ok(secrets)
            }
            Err(SealingError::Mismatch) => {
                leaf.wrong_attempts = leaf.wrong_attempts.saturating_add(1);
                leaf.last_failure = now;
                self.persist(label, &leaf)?;
                info!(label, attempts = leaf.wrong_attempts, "wrong le secret");
                Err(LeCredError::InvalidLeSecret)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// clear the wrong attempt counter with the reset secret
    ///
    /// wrong reset secrets are not counted.
    pub fn reset_credential(&mut self, label: u64, reset_secret: &[u8]) -> LeCredResult<()> {
        let mut leaf = self.load_leaf(label)?;

        let signer = reset_signer(reset_secret, &leaf.reset_salt);
        let sealed = match self.unseal(&leaf.sealed_reset, &signer) {
            Ok(sealed) => sealed,
            Err(SealingError::Mismatch) => {
                info!(label, "wrong reset secret");
                return Err(LeCredError::InvalidResetSecret);
            }
            Err(e) => return Err(e.into()),
        };
        if !ct_eq(&sealed, reset_secret) {
            return Err(LeCredError::InvalidResetSecret);
        }

        leaf.wrong_attempts = 0;
        leaf.last_failure = 0;
        self.persist(label, &leaf)?;
        info!(label, "credential reset");
        Ok(())
    }

    /// erase the credential and free its label
    pub fn remove_credential(&mut self, label: u64) -> LeCredResult<()> {
        self.store.remove(label)?;
        info!(label, "removed credential");
        Ok(())
    }

    /// wrong attempts so far, or -1 if the label is missing or unreadable
    pub fn get_wrong_auth_attempts(&self, label: u64) -> i64 {
        match self.load_leaf(label) {
            Ok(leaf) => i64::from(leaf.wrong_attempts),
            Err(_) => -1,
        }
    }

    /// whether unsealing this credential depends on pcr state
    ///
    /// a free, out of range or unreadable label is an error here, never
    /// `false`, so callers cannot mistake a missing credential for one that
    /// needs no measurements.
    pub fn needs_pcr_binding(&self, label: u64) -> LeCredResult<bool> {
        Ok(self.load_leaf(label)?.pcr_bound)
    }

    pub fn credential_state(&self, label: u64) -> LeCredResult<CredentialState> {
        if !self.store.geometry().contains(label) {
            return Err(LeCredError::InvalidLabel);
        }
        match self.load_leaf(label) {
            Ok(leaf) if leaf.schedule.is_locked(leaf.wrong_attempts) => Ok(CredentialState::Locked),
            Ok(_) => Ok(CredentialState::Provisioned),
            Err(LeCredError::InvalidLabel) => Ok(CredentialState::Free),
            Err(LeCredError::InvalidMetadata) | Err(LeCredError::HashTree(HashTreeError::Corrupted(_))) => {
                Ok(CredentialState::Corrupted)
            }
            Err(e) => Err(e),
        }
    }

    fn load_leaf(&self, label: u64) -> LeCredResult<CredentialLeaf> {
        let loaded = self.store.load(label)?;
        let leaf: CredentialLeaf = decode(&loaded.payload).ok_or_else(|| {
            warn!(label, "credential leaf undecodable");
            LeCredError::InvalidMetadata
        })?;
        if leaf.version != LEAF_VERSION {
            warn!(label, version = leaf.version, "unsupported credential leaf version");
            return Err(LeCredError::InvalidMetadata);
        }
        Ok(leaf)
    }

    fn persist(&mut self, label: u64, leaf: &CredentialLeaf) -> LeCredResult<()> {
        let payload = encode(leaf).ok_or(LeCredError::InvalidMetadata)?;
        self.store.store(label, &payload)?;
        Ok(())
    }

    fn seal(&mut self, policy: &SealingPolicy, secret: &[u8]) -> SealingResult<Vec<u8>> {
        let session = self.backend.create_sealing_session(policy, &self.auth)?;
        self.backend.seal(session, secret)
    }

    fn unseal(&mut self, sealed: &[u8], signer: &PolicySigner) -> SealingResult<SecretBytes> {
        let session = self.backend.create_unsealing_session(sealed, &self.auth)?;
        let response = signer.respond(&session.challenge);
        self.backend.unseal(session.handle, &response)
    }
}

impl<B: SecretSealingBackend> std::fmt::Debug for LeCredentialManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeCredentialManager").field("store", &self.store).finish()
    }
}

fn check_secret_len(secret: &[u8], msg: &'static str) -> LeCredResult<()> {
    if secret.is_empty() || secret.len() > MAX_SECRET_LEN {
        return Err(LeCredError::InvalidArgument(msg));
    }
    Ok(())
}

fn le_signer(le_secret: &[u8], salt: &[u8; 32]) -> PolicySigner {
    PolicySigner::from_seed(&derive_key(le_secret, salt, LE_AUTH_INFO))
}

fn reset_signer(reset_secret: &[u8], reset_salt: &[u8; 32]) -> PolicySigner {
    PolicySigner::from_seed(&derive_key(reset_secret, reset_salt, RESET_AUTH_INFO))
}
