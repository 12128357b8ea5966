//! cryptographic primitives for pinvault
//!
//! - sha256 for tree nodes and cover hashes
//! - hkdf-sha256 for per-leaf auth values and backend keys
//! - hmac-sha256 for reset secrets and legacy blob tags
//! - chacha20poly1305 for authenticated encryption

use chacha20poly1305::{
    aead::{Aead, KeyInit as AeadKeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use hmac::{digest::KeyInit, Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// 32 byte digest
pub type Hash = [u8; 32];

/// secret bytes, wiped on drop
pub type SecretBytes = Zeroizing<Vec<u8>>;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// generate random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

pub fn sha256(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

/// compute hmac-sha256 tag
pub fn mac(key: &[u8], data: &[&[u8]]) -> Hash {
    // hmac accepts keys of any length, new_from_slice cannot fail
    let mut h = <HmacSha256 as KeyInit>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    for d in data {
        Mac::update(&mut h, d);
    }
    h.finalize().into_bytes().into()
}

/// hkdf-sha256 expand into a fixed 32 byte key
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    // 32 bytes is always a valid hkdf-sha256 output length
    if hk.expand(info, &mut okm[..]).is_err() {
        unreachable!("32 byte okm is within hkdf bounds");
    }
    okm
}

/// derive a reset secret from a long lived reset seed
///
/// lets several credentials share one reset capability without storing
/// the secret itself.
pub fn derive_reset_secret(reset_seed: &[u8], reset_salt: &[u8]) -> SecretBytes {
    Zeroizing::new(mac(reset_salt, &[reset_seed]).to_vec())
}

pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// encrypt data using chacha20poly1305, binding `aad`
pub fn seal_aead(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
    let cipher: ChaCha20Poly1305 = AeadKeyInit::new_from_slice(key).ok()?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .ok()
}

/// decrypt data using chacha20poly1305
///
/// `None` for any failure: wrong key, wrong aad or tampered bytes.
pub fn open_aead(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8], aad: &[u8]) -> Option<SecretBytes> {
    let cipher: ChaCha20Poly1305 = AeadKeyInit::new_from_slice(key).ok()?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .ok()
        .map(Zeroizing::new)
}
