//! secret sealing backends
//!
//! a sealing backend binds a secret to a policy: an ed25519 public key
//! whose holder must answer a fresh challenge, plus optional pcr criteria
//! the platform state has to satisfy at unseal time.
//!
//! sessions are handles into a backend-owned arena. each handle is
//! consumed by exactly one `seal`/`unseal` call.
//!
//! implementations:
//! - software: chacha20poly1305 under a root key, in-process pcr bank.
//!   no hardware security, useful for development and tests.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{
    ct_eq, derive_key, mac, open_aead, random_bytes, seal_aead, sha256, Hash, SecretBytes, NONCE_LEN,
    TAG_LEN,
};
use crate::encoding::{decode, encode};
use crate::error::{SealingError, SealingResult};

/// number of platform configuration registers
pub const NUM_PCRS: usize = 24;

/// most pcr criteria a single policy may list
pub const MAX_PCR_CRITERIA: usize = 4;

/// most sessions a backend keeps open at once
pub const MAX_SESSIONS: usize = 64;

const CHALLENGE_DOMAIN: &[u8] = b"pinvault:unseal:v1";
const SEALED_VERSION: u8 = 1;

/// pcr selection plus the digest the selected registers must hash to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrCriterion {
    pub pcr_mask: u32,
    pub digest: Hash,
}

impl PcrCriterion {
    /// mask selects at least one register and none past the bank
    pub fn is_valid(&self) -> bool {
        self.pcr_mask != 0 && self.pcr_mask >> NUM_PCRS == 0
    }
}

/// software model of a pcr bank
#[derive(Debug, Clone)]
pub struct PcrBank {
    values: [Hash; NUM_PCRS],
}

impl Default for PcrBank {
    fn default() -> Self {
        Self { values: [[0u8; 32]; NUM_PCRS] }
    }
}

impl PcrBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, index: usize) -> Option<Hash> {
        self.values.get(index).copied()
    }

    /// pcr[index] = sha256(pcr[index] || data). false if index is out of range.
    pub fn extend(&mut self, index: usize, data: &[u8]) -> bool {
        match self.values.get_mut(index) {
            Some(v) => {
                *v = sha256(&[v.as_slice(), data]);
                true
            }
            None => false,
        }
    }

    /// sha256 over the selected registers in ascending index order
    pub fn digest(&self, pcr_mask: u32) -> Hash {
        let selected: Vec<&[u8]> = (0..NUM_PCRS)
            .filter(|i| pcr_mask & (1 << i) != 0)
            .map(|i| self.values[i].as_slice())
            .collect();
        sha256(&selected)
    }

    /// true when any criterion matches. an empty list matches nothing.
    pub fn satisfies(&self, criteria: &[PcrCriterion]) -> bool {
        criteria
            .iter()
            .any(|c| c.is_valid() && ct_eq(&self.digest(c.pcr_mask), &c.digest))
    }
}

/// what a sealed secret is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealingPolicy {
    /// ed25519 key that must sign the unseal challenge
    pub public_key: [u8; 32],
    /// empty means no pcr binding
    pub pcr_criteria: Vec<PcrCriterion>,
}

/// authorization presented to the backend itself
#[derive(Clone)]
pub struct AuthValues {
    pub delegate_blob: Vec<u8>,
    pub delegate_secret: SecretBytes,
}

impl std::fmt::Debug for AuthValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthValues")
            .field("delegate_blob", &format_args!("{} bytes", self.delegate_blob.len()))
            .field("delegate_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

/// an open unsealing session and the challenge its policy key must sign
#[derive(Debug, Clone)]
pub struct UnsealingSession {
    pub handle: SessionHandle,
    pub challenge: Vec<u8>,
}

/// the message an unseal challenge response signs
pub fn challenge_message(challenge: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(CHALLENGE_DOMAIN.len() + challenge.len());
    msg.extend_from_slice(CHALLENGE_DOMAIN);
    msg.extend_from_slice(challenge);
    msg
}

/// holder of a policy signing key
pub struct PolicySigner {
    key: SigningKey,
}

impl PolicySigner {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { key: SigningKey::from_bytes(seed) }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// answer an unseal challenge
    pub fn respond(&self, challenge: &[u8]) -> Vec<u8> {
        self.key.sign(&challenge_message(challenge)).to_bytes().to_vec()
    }
}

/// backend that seals secrets to a policy
pub trait SecretSealingBackend {
    /// open a session that will seal one secret under `policy`
    fn create_sealing_session(
        &mut self,
        policy: &SealingPolicy,
        auth: &AuthValues,
    ) -> SealingResult<SessionHandle>;

    /// seal `secret`, consuming the session
    fn seal(&mut self, session: SessionHandle, secret: &[u8]) -> SealingResult<Vec<u8>>;

    /// check the platform against the sealed policy and issue a challenge
    fn create_unsealing_session(
        &mut self,
        sealed: &[u8],
        auth: &AuthValues,
    ) -> SealingResult<UnsealingSession>;

    /// release the secret if `challenge_response` satisfies the policy key.
    /// the session is consumed either way.
    fn unseal(&mut self, session: SessionHandle, challenge_response: &[u8]) -> SealingResult<SecretBytes>;
}

#[derive(Serialize, Deserialize)]
struct SealedContents {
    public_key: [u8; 32],
    pcr_criteria: Vec<PcrCriterion>,
    secret: Vec<u8>,
}

impl Drop for SealedContents {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

enum Session {
    Sealing(SealingPolicy),
    Unsealing { contents: SealedContents, challenge: [u8; 32] },
}

/// software sealing backend
/// NOT SECURE - keys live in process memory
pub struct SoftwareSealingBackend {
    seal_key: Zeroizing<[u8; 32]>,
    delegate_secret: Zeroizing<[u8; 32]>,
    pcrs: PcrBank,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    available: bool,
}

impl SoftwareSealingBackend {
    /// backend with a fresh random root key
    pub fn new() -> Self {
        Self::from_root_key(&random_bytes())
    }

    /// backend whose keys derive from `root_key`; same root key, same backend
    pub fn from_root_key(root_key: &[u8; 32]) -> Self {
        let seal_key = derive_key(root_key, b"pinvault", b"sealing-key");
        let delegate_secret = Zeroizing::new(mac(root_key.as_slice(), &[b"pinvault:delegate:v1"]));
        Self {
            seal_key,
            delegate_secret,
            pcrs: PcrBank::new(),
            sessions: HashMap::new(),
            next_session: 1,
            available: true,
        }
    }

    /// the authorization values this backend accepts
    pub fn auth_values(&self) -> AuthValues {
        AuthValues {
            delegate_blob: b"software".to_vec(),
            delegate_secret: Zeroizing::new(self.delegate_secret.to_vec()),
        }
    }

    pub fn pcrs(&self) -> &PcrBank {
        &self.pcrs
    }

    pub fn pcrs_mut(&mut self) -> &mut PcrBank {
        &mut self.pcrs
    }

    /// simulate the backend going away (or coming back)
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn check_ready(&self, auth: &AuthValues) -> SealingResult<()> {
        if !self.available {
            return Err(SealingError::Unavailable("software backend disabled".into()));
        }
        if !ct_eq(&auth.delegate_secret, self.delegate_secret.as_slice()) {
            return Err(SealingError::Unauthorized);
        }
        Ok(())
    }

    fn open_session(&mut self, session: Session) -> SealingResult<SessionHandle> {
        if self.sessions.len() >= MAX_SESSIONS {
            return Err(SealingError::Unavailable("too many open sessions".into()));
        }
        let id = self.next_session;
        self.next_session = self.next_session.wrapping_add(1);
        self.sessions.insert(id, session);
        Ok(SessionHandle(id))
    }
}

impl Default for SoftwareSealingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretSealingBackend for SoftwareSealingBackend {
    fn create_sealing_session(
        &mut self,
        policy: &SealingPolicy,
        auth: &AuthValues,
    ) -> SealingResult<SessionHandle> {
        self.check_ready(auth)?;
        self.open_session(Session::Sealing(policy.clone()))
    }

    fn seal(&mut self, session: SessionHandle, secret: &[u8]) -> SealingResult<Vec<u8>> {
        let policy = match self.sessions.remove(&session.0) {
            Some(Session::Sealing(policy)) => policy,
            _ => return Err(SealingError::InvalidSession),
        };
        let contents = SealedContents {
            public_key: policy.public_key,
            pcr_criteria: policy.pcr_criteria,
            secret: secret.to_vec(),
        };
        let plaintext = Zeroizing::new(
            encode(&contents).ok_or_else(|| SealingError::Unavailable("encode failed".into()))?,
        );

        let nonce: [u8; NONCE_LEN] = random_bytes();
        let ciphertext = seal_aead(&self.seal_key, &nonce, &plaintext, &[SEALED_VERSION])
            .ok_or_else(|| SealingError::Unavailable("encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        sealed.push(SEALED_VERSION);
        sealed.extend_from_slice(&nonce);
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    fn create_unsealing_session(
        &mut self,
        sealed: &[u8],
        auth: &AuthValues,
    ) -> SealingResult<UnsealingSession> {
        self.check_ready(auth)?;
        if sealed.len() < 1 + NONCE_LEN + TAG_LEN || sealed[0] != SEALED_VERSION {
            return Err(SealingError::MalformedSealedData);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[1..1 + NONCE_LEN]);
        let plaintext = open_aead(&self.seal_key, &nonce, &sealed[1 + NONCE_LEN..], &[SEALED_VERSION])
            .ok_or(SealingError::MalformedSealedData)?;
        let contents: SealedContents = decode(&plaintext).ok_or(SealingError::MalformedSealedData)?;

        if !contents.pcr_criteria.is_empty() && !self.pcrs.satisfies(&contents.pcr_criteria) {
            debug!("unseal refused: pcr state does not match");
            return Err(SealingError::PcrMismatch);
        }

        let challenge: [u8; 32] = random_bytes();
        let handle = self.open_session(Session::Unsealing { contents, challenge })?;
        Ok(UnsealingSession { handle, challenge: challenge.to_vec() })
    }

    fn unseal(&mut self, session: SessionHandle, challenge_response: &[u8]) -> SealingResult<SecretBytes> {
        let (contents, challenge) = match self.sessions.remove(&session.0) {
            Some(Session::Unsealing { contents, challenge }) => (contents, challenge),
            Some(other) => {
                // wrong kind of session; it stays consumed
                drop(other);
                return Err(SealingError::InvalidSession);
            }
            None => return Err(SealingError::InvalidSession),
        };
        let key = VerifyingKey::from_bytes(&contents.public_key)
            .map_err(|_| SealingError::MalformedSealedData)?;
        let signature = Signature::from_slice(challenge_response).map_err(|_| SealingError::Mismatch)?;
        key.verify(&challenge_message(&challenge), &signature)
            .map_err(|_| SealingError::Mismatch)?;
        Ok(Zeroizing::new(contents.secret.clone()))
    }
}
