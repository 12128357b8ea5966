//! key blob codec
//!
//! packs key material and its two authorization sets into an opaque blob.
//! the current format is authenticated encryption bound to the hidden
//! authorizations:
//!
//! ```text
//! 0x01 || nonce (12) || chacha20poly1305(key, bincode(KeyData), aad = hidden)
//! ```
//!
//! blobs from older versions used an integrity-only format that is still
//! read, never written:
//!
//! ```text
//! 0x00 || len || key material || len || hw set || len || sw set
//!      || hmac-sha256(fixed key, blob || hidden)[..8]
//! ```
//!
//! every decode failure is reported as `InvalidKeyBlob`, whatever the cause.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::authset::{AuthorizationSet, Tag, Value};
use crate::clock::{Clock, SystemClock};
use crate::crypto::{ct_eq, mac, open_aead, random_bytes, seal_aead, SecretBytes, NONCE_LEN, TAG_LEN};
use crate::encoding::{decode, encode};
use crate::error::{KeyBlobError, KeyBlobResult};
use crate::key_provider::EncryptionKeyProvider;

const ENCRYPTED_VERSION: u8 = 1;
const LEGACY_VERSION: u8 = 0;
const LEGACY_TAG_LEN: usize = 8;
const LEGACY_HMAC_KEY: &[u8] = b"IntegrityAssuredBlob0";

/// root of trust bound into every blob's hidden authorizations
pub const SOFTWARE_ROOT_OF_TRUST: &[u8] = b"SW";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobFormat {
    Encrypted,
    IntegrityAssured,
}

/// formats tried by [`KeyBlobCodec::deserialize_blob`], in order
const DECODE_ORDER: [BlobFormat; 2] = [BlobFormat::Encrypted, BlobFormat::IntegrityAssured];

#[derive(Serialize, Deserialize)]
enum KeySource {
    Local { key_material: Vec<u8> },
}

#[derive(Serialize, Deserialize)]
struct KeyData {
    /// `None` is a blob that names no key source
    data: Option<KeySource>,
    hw_enforced_tags: Vec<u8>,
    sw_enforced_tags: Vec<u8>,
}

impl Drop for KeyData {
    fn drop(&mut self) {
        if let Some(KeySource::Local { key_material }) = &mut self.data {
            key_material.zeroize();
        }
    }
}

/// contents of a decoded blob
pub struct UnpackedKeyBlob {
    pub key_material: SecretBytes,
    pub hw_enforced: AuthorizationSet,
    pub sw_enforced: AuthorizationSet,
    pub format: BlobFormat,
}

impl std::fmt::Debug for UnpackedKeyBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnpackedKeyBlob")
            .field("key_material", &"<redacted>")
            .field("hw_enforced", &self.hw_enforced)
            .field("sw_enforced", &self.sw_enforced)
            .field("format", &self.format)
            .finish()
    }
}

pub struct KeyBlobCodec<P: EncryptionKeyProvider> {
    provider: P,
}

impl<P: EncryptionKeyProvider> KeyBlobCodec<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// encrypt key material and authorizations into `key_blob`
    pub fn serialize_key_data_blob_into(
        &self,
        key_material: &[u8],
        hidden: &AuthorizationSet,
        hw_enforced: &AuthorizationSet,
        sw_enforced: &AuthorizationSet,
        key_blob: Option<&mut Vec<u8>>,
    ) -> KeyBlobResult<()> {
        let key_blob = key_blob.ok_or(KeyBlobError::OutputParameterNull)?;

        let key = self.provider.export_or_generate_encryption_key().map_err(|e| {
            warn!(error = %e, "cannot serialize key blob");
            KeyBlobError::SerializationError
        })?;

        let key_data = KeyData {
            data: Some(KeySource::Local { key_material: key_material.to_vec() }),
            hw_enforced_tags: hw_enforced.to_bytes(),
            sw_enforced_tags: sw_enforced.to_bytes(),
        };
        let plaintext = Zeroizing::new(encode(&key_data).ok_or(KeyBlobError::SerializationError)?);

        let nonce: [u8; NONCE_LEN] = random_bytes();
        let ciphertext = seal_aead(&key, &nonce, &plaintext, &hidden.to_bytes())
            .ok_or(KeyBlobError::SerializationError)?;

        key_blob.clear();
        key_blob.reserve(1 + NONCE_LEN + ciphertext.len());
        key_blob.push(ENCRYPTED_VERSION);
        key_blob.extend_from_slice(&nonce);
        key_blob.extend(ciphertext);
        Ok(())
    }

    pub fn serialize_key_data_blob(
        &self,
        key_material: &[u8],
        hidden: &AuthorizationSet,
        hw_enforced: &AuthorizationSet,
        sw_enforced: &AuthorizationSet,
    ) -> KeyBlobResult<Vec<u8>> {
        let mut blob = Vec::new();
        self.serialize_key_data_blob_into(key_material, hidden, hw_enforced, sw_enforced, Some(&mut blob))?;
        Ok(blob)
    }

    /// decrypt a current-format blob into the output slots
    pub fn deserialize_key_data_blob_into(
        &self,
        key_blob: &[u8],
        hidden: &AuthorizationSet,
        key_material: Option<&mut SecretBytes>,
        hw_enforced: Option<&mut AuthorizationSet>,
        sw_enforced: Option<&mut AuthorizationSet>,
    ) -> KeyBlobResult<()> {
        let (Some(key_material), Some(hw_enforced), Some(sw_enforced)) = (key_material, hw_enforced, sw_enforced)
        else {
            return Err(KeyBlobError::OutputParameterNull);
        };

        let unpacked = self.decode_encrypted(key_blob, hidden).ok_or_else(|| {
            debug!("key blob did not decrypt");
            KeyBlobError::InvalidKeyBlob
        })?;
        *key_material = unpacked.key_material;
        *hw_enforced = unpacked.hw_enforced;
        *sw_enforced = unpacked.sw_enforced;
        Ok(())
    }

    pub fn deserialize_key_data_blob(
        &self,
        key_blob: &[u8],
        hidden: &AuthorizationSet,
    ) -> KeyBlobResult<UnpackedKeyBlob> {
        self.decode_encrypted(key_blob, hidden).ok_or(KeyBlobError::InvalidKeyBlob)
    }

    /// decode a blob in any readable format, current format first
    pub fn deserialize_blob(&self, key_blob: &[u8], hidden: &AuthorizationSet) -> KeyBlobResult<UnpackedKeyBlob> {
        for format in DECODE_ORDER {
            let unpacked = match format {
                BlobFormat::Encrypted => self.decode_encrypted(key_blob, hidden),
                BlobFormat::IntegrityAssured => decode_integrity_assured(key_blob, hidden),
            };
            if let Some(unpacked) = unpacked {
                if format != BlobFormat::Encrypted {
                    debug!(?format, "read key blob in legacy format");
                }
                return Ok(unpacked);
            }
        }
        Err(KeyBlobError::InvalidKeyBlob)
    }

    fn decode_encrypted(&self, key_blob: &[u8], hidden: &AuthorizationSet) -> Option<UnpackedKeyBlob> {
        if key_blob.len() < 1 + NONCE_LEN + TAG_LEN || key_blob[0] != ENCRYPTED_VERSION {
            return None;
        }
        let key = match self.provider.export_or_generate_encryption_key() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "cannot deserialize key blob");
                return None;
            }
        };
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&key_blob[1..1 + NONCE_LEN]);
        let plaintext = open_aead(&key, &nonce, &key_blob[1 + NONCE_LEN..], &hidden.to_bytes())?;

        let key_data: KeyData = decode(&plaintext)?;
        let key_material = match &key_data.data {
            Some(KeySource::Local { key_material }) => Zeroizing::new(key_material.clone()),
            None => return None,
        };
        Some(UnpackedKeyBlob {
            key_material,
            hw_enforced: AuthorizationSet::from_bytes(&key_data.hw_enforced_tags).ok()?,
            sw_enforced: AuthorizationSet::from_bytes(&key_data.sw_enforced_tags).ok()?,
            format: BlobFormat::Encrypted,
        })
    }
}

fn legacy_tag(body: &[u8], hidden: &AuthorizationSet) -> [u8; LEGACY_TAG_LEN] {
    let hidden = hidden.to_bytes();
    let full = mac(LEGACY_HMAC_KEY, &[body, hidden.as_slice()]);
    let mut tag = [0u8; LEGACY_TAG_LEN];
    tag.copy_from_slice(&full[..LEGACY_TAG_LEN]);
    tag
}

fn decode_integrity_assured(key_blob: &[u8], hidden: &AuthorizationSet) -> Option<UnpackedKeyBlob> {
    if key_blob.len() < 1 + LEGACY_TAG_LEN || key_blob[0] != LEGACY_VERSION {
        return None;
    }
    let (body, tag) = key_blob.split_at(key_blob.len() - LEGACY_TAG_LEN);
    if !ct_eq(&legacy_tag(body, hidden), tag) {
        return None;
    }

    let mut rest = &body[1..];
    let key_material = Zeroizing::new(take_prefixed(&mut rest)?.to_vec());
    let hw_enforced = AuthorizationSet::from_bytes(take_prefixed(&mut rest)?).ok()?;
    let sw_enforced = AuthorizationSet::from_bytes(take_prefixed(&mut rest)?).ok()?;
    if !rest.is_empty() {
        return None;
    }
    Some(UnpackedKeyBlob { key_material, hw_enforced, sw_enforced, format: BlobFormat::IntegrityAssured })
}

fn take_prefixed<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let rest = &buf[4..];
    if rest.len() < len {
        return None;
    }
    let (field, rest) = rest.split_at(len);
    *buf = rest;
    Some(field)
}

#[cfg(test)]
pub(crate) fn serialize_integrity_assured_blob(
    key_material: &[u8],
    hidden: &AuthorizationSet,
    hw_enforced: &AuthorizationSet,
    sw_enforced: &AuthorizationSet,
) -> Vec<u8> {
    let mut blob = vec![LEGACY_VERSION];
    for field in [key_material.to_vec(), hw_enforced.to_bytes(), sw_enforced.to_bytes()] {
        blob.extend_from_slice(&(field.len() as u32).to_le_bytes());
        blob.extend_from_slice(&field);
    }
    let tag = legacy_tag(&blob, hidden);
    blob.extend_from_slice(&tag);
    blob
}

/// a freshly created blob and the authorizations it carries
#[derive(Debug, Clone)]
pub struct CreatedKeyBlob {
    pub key_blob: Vec<u8>,
    pub hw_enforced: AuthorizationSet,
    pub sw_enforced: AuthorizationSet,
}

/// tags enforced by the blob store itself
const ENFORCED_TAGS: &[Tag] = &[
    Tag::PURPOSE,
    Tag::ALGORITHM,
    Tag::KEY_SIZE,
    Tag::BLOCK_MODE,
    Tag::DIGEST,
    Tag::PADDING,
    Tag::CALLER_NONCE,
    Tag::MIN_MAC_LENGTH,
    Tag::EC_CURVE,
    Tag::RSA_PUBLIC_EXPONENT,
    Tag::USER_SECURE_ID,
    Tag::NO_AUTH_REQUIRED,
    Tag::USER_AUTH_TYPE,
    Tag::AUTH_TIMEOUT,
];

/// tags only the blob store may set
const RESERVED_TAGS: &[Tag] = &[
    Tag::ORIGIN,
    Tag::ROOT_OF_TRUST,
    Tag::OS_VERSION,
    Tag::OS_PATCHLEVEL,
    Tag::CREATION_DATETIME,
    Tag::UNIQUE_ID,
];

/// tags bound into the hidden set instead of being stored
const HIDDEN_TAGS: &[Tag] = &[Tag::APPLICATION_ID, Tag::APPLICATION_DATA];

/// key creation and loading on top of [`KeyBlobCodec`]
pub struct KeyBlobContext<P: EncryptionKeyProvider> {
    codec: KeyBlobCodec<P>,
    os_version: u32,
    os_patchlevel: u32,
    clock: Box<dyn Clock>,
}

impl<P: EncryptionKeyProvider> KeyBlobContext<P> {
    pub fn new(codec: KeyBlobCodec<P>, os_version: u32, os_patchlevel: u32) -> Self {
        Self { codec, os_version, os_patchlevel, clock: Box::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn codec(&self) -> &KeyBlobCodec<P> {
        &self.codec
    }

    /// wrap `key_material` described by `description`
    pub fn create_key_blob(
        &self,
        description: &AuthorizationSet,
        origin: u32,
        key_material: &[u8],
    ) -> KeyBlobResult<CreatedKeyBlob> {
        let (hw_enforced, sw_enforced) = self.split_authorizations(description, origin)?;
        let hidden = build_hidden_authorizations(description)?;
        let key_blob = self
            .codec
            .serialize_key_data_blob(key_material, &hidden, &hw_enforced, &sw_enforced)?;
        debug!(hw = hw_enforced.len(), sw = sw_enforced.len(), "created key blob");
        Ok(CreatedKeyBlob { key_blob, hw_enforced, sw_enforced })
    }

    /// unwrap a blob; `additional_params` must carry the same application id/data
    pub fn parse_key_blob(
        &self,
        key_blob: &[u8],
        additional_params: &AuthorizationSet,
    ) -> KeyBlobResult<UnpackedKeyBlob> {
        let hidden = build_hidden_authorizations(additional_params)?;
        let unpacked = self.codec.deserialize_blob(key_blob, &hidden)?;
        if !unpacked.hw_enforced.contains(Tag::ALGORITHM) && !unpacked.sw_enforced.contains(Tag::ALGORITHM) {
            return Err(KeyBlobError::InvalidArgument("key blob carries no algorithm"));
        }
        Ok(unpacked)
    }

    /// re-wrap a legacy blob in the current format; `None` if already current
    pub fn upgrade_key_blob(
        &self,
        key_blob: &[u8],
        additional_params: &AuthorizationSet,
    ) -> KeyBlobResult<Option<Vec<u8>>> {
        let unpacked = self.parse_key_blob(key_blob, additional_params)?;
        if unpacked.format == BlobFormat::Encrypted {
            return Ok(None);
        }
        let hidden = build_hidden_authorizations(additional_params)?;
        let upgraded = self.codec.serialize_key_data_blob(
            &unpacked.key_material,
            &hidden,
            &unpacked.hw_enforced,
            &unpacked.sw_enforced,
        )?;
        Ok(Some(upgraded))
    }

    fn split_authorizations(
        &self,
        description: &AuthorizationSet,
        origin: u32,
    ) -> KeyBlobResult<(AuthorizationSet, AuthorizationSet)> {
        let mut hw = AuthorizationSet::new();
        let mut sw = AuthorizationSet::new();
        for param in description.iter() {
            if RESERVED_TAGS.contains(&param.tag) {
                return Err(KeyBlobError::InvalidArgument("description sets a reserved tag"));
            }
            if HIDDEN_TAGS.contains(&param.tag) {
                continue;
            }
            let target = if ENFORCED_TAGS.contains(&param.tag) { &mut hw } else { &mut sw };
            target.push(param.tag, param.value.clone())?;
        }

        hw.push(Tag::ORIGIN, Value::U32(origin))?;
        hw.push(Tag::OS_VERSION, Value::U32(self.os_version))?;
        hw.push(Tag::OS_PATCHLEVEL, Value::U32(self.os_patchlevel))?;
        sw.push(Tag::CREATION_DATETIME, Value::U64(self.clock.now().saturating_mul(1000)))?;
        Ok((hw, sw))
    }
}

/// application id/data from `params` plus the root of trust
pub fn build_hidden_authorizations(params: &AuthorizationSet) -> KeyBlobResult<AuthorizationSet> {
    let mut hidden = AuthorizationSet::new();
    for tag in HIDDEN_TAGS {
        for value in params.get_all(*tag) {
            hidden.push(*tag, value.clone())?;
        }
    }
    hidden.push(Tag::ROOT_OF_TRUST, Value::Bytes(SOFTWARE_ROOT_OF_TRUST.to_vec()))?;
    Ok(hidden)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authset::{algorithm, origin};
    use crate::clock::ManualClock;
    use crate::key_provider::StaticKeyProvider;

    fn codec() -> KeyBlobCodec<StaticKeyProvider> {
        KeyBlobCodec::new(StaticKeyProvider::new([9u8; 32]))
    }

    fn sets() -> (AuthorizationSet, AuthorizationSet, AuthorizationSet) {
        let hidden = AuthorizationSet::new()
            .with(Tag::APPLICATION_ID, Value::Bytes(b"com.example".to_vec()))
            .unwrap();
        let hw = AuthorizationSet::new()
            .with(Tag::ALGORITHM, Value::U32(algorithm::AES))
            .unwrap()
            .with(Tag::KEY_SIZE, Value::U32(256))
            .unwrap();
        let sw = AuthorizationSet::new()
            .with(Tag::ACTIVE_DATETIME, Value::U64(1000))
            .unwrap();
        (hidden, hw, sw)
    }

    #[test]
    fn test_serialize_deserialize() {
        let codec = codec();
        let (hidden, hw, sw) = sets();
        let blob = codec.serialize_key_data_blob(b"key bytes", &hidden, &hw, &sw).unwrap();

        let unpacked = codec.deserialize_key_data_blob(&blob, &hidden).unwrap();
        assert_eq!(unpacked.key_material.as_slice(), b"key bytes");
        assert_eq!(unpacked.hw_enforced, hw);
        assert_eq!(unpacked.sw_enforced, sw);
        assert_eq!(unpacked.format, BlobFormat::Encrypted);
    }

    #[test]
    fn test_null_outputs() {
        let codec = codec();
        let (hidden, hw, sw) = sets();
        assert!(matches!(
            codec.serialize_key_data_blob_into(b"k", &hidden, &hw, &sw, None),
            Err(KeyBlobError::OutputParameterNull)
        ));

        let blob = codec.serialize_key_data_blob(b"k", &hidden, &hw, &sw).unwrap();
        let mut key = Zeroizing::new(Vec::new());
        let mut out_hw = AuthorizationSet::new();
        assert!(matches!(
            codec.deserialize_key_data_blob_into(&blob, &hidden, Some(&mut key), Some(&mut out_hw), None),
            Err(KeyBlobError::OutputParameterNull)
        ));

        let mut out_sw = AuthorizationSet::new();
        codec
            .deserialize_key_data_blob_into(&blob, &hidden, Some(&mut key), Some(&mut out_hw), Some(&mut out_sw))
            .unwrap();
        assert_eq!(key.as_slice(), b"k");
        assert_eq!(out_sw, sw);
    }

    #[test]
    fn test_wrong_hidden_or_key_is_invalid() {
        let codec = codec();
        let (hidden, hw, sw) = sets();
        let blob = codec.serialize_key_data_blob(b"k", &hidden, &hw, &sw).unwrap();

        let other_hidden = AuthorizationSet::new()
            .with(Tag::APPLICATION_ID, Value::Bytes(b"com.other".to_vec()))
            .unwrap();
        assert!(matches!(
            codec.deserialize_blob(&blob, &other_hidden),
            Err(KeyBlobError::InvalidKeyBlob)
        ));

        let other_key = KeyBlobCodec::new(StaticKeyProvider::new([1u8; 32]));
        assert!(matches!(other_key.deserialize_blob(&blob, &hidden), Err(KeyBlobError::InvalidKeyBlob)));

        for i in 0..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x80;
            assert!(matches!(codec.deserialize_blob(&tampered, &hidden), Err(KeyBlobError::InvalidKeyBlob)));
        }
        assert!(matches!(codec.deserialize_blob(&[], &hidden), Err(KeyBlobError::InvalidKeyBlob)));
    }

    #[test]
    fn test_provider_unavailable() {
        let (hidden, hw, sw) = sets();
        let blob = codec().serialize_key_data_blob(b"k", &hidden, &hw, &sw).unwrap();

        let broken = KeyBlobCodec::new(StaticKeyProvider::unavailable());
        assert!(matches!(
            broken.serialize_key_data_blob(b"k", &hidden, &hw, &sw),
            Err(KeyBlobError::SerializationError)
        ));
        assert!(matches!(broken.deserialize_key_data_blob(&blob, &hidden), Err(KeyBlobError::InvalidKeyBlob)));
    }

    #[test]
    fn test_missing_key_source_is_invalid() {
        let codec = codec();
        let (hidden, hw, sw) = sets();
        let key_data = KeyData { data: None, hw_enforced_tags: hw.to_bytes(), sw_enforced_tags: sw.to_bytes() };
        let plaintext = encode(&key_data).unwrap();
        let nonce = [0u8; NONCE_LEN];
        let mut blob = vec![ENCRYPTED_VERSION];
        blob.extend_from_slice(&nonce);
        blob.extend(seal_aead(&[9u8; 32], &nonce, &plaintext, &hidden.to_bytes()).unwrap());
        assert!(matches!(codec.deserialize_blob(&blob, &hidden), Err(KeyBlobError::InvalidKeyBlob)));
    }

    #[test]
    fn test_legacy_blob_readable() {
        let codec = codec();
        let (hidden, hw, sw) = sets();
        let legacy = serialize_integrity_assured_blob(b"old key", &hidden, &hw, &sw);

        // the current-format entry point does not accept it
        assert!(matches!(codec.deserialize_key_data_blob(&legacy, &hidden), Err(KeyBlobError::InvalidKeyBlob)));

        let unpacked = codec.deserialize_blob(&legacy, &hidden).unwrap();
        assert_eq!(unpacked.format, BlobFormat::IntegrityAssured);
        assert_eq!(unpacked.key_material.as_slice(), b"old key");
        assert_eq!(unpacked.hw_enforced, hw);

        let mut tampered = legacy.clone();
        tampered[6] ^= 1;
        assert!(matches!(codec.deserialize_blob(&tampered, &hidden), Err(KeyBlobError::InvalidKeyBlob)));
        assert!(matches!(
            codec.deserialize_blob(&legacy, &AuthorizationSet::new()),
            Err(KeyBlobError::InvalidKeyBlob)
        ));
    }

    fn context() -> KeyBlobContext<StaticKeyProvider> {
        KeyBlobContext::new(codec(), 130000, 202410).with_clock(ManualClock::new(1_700_000_000))
    }

    fn description() -> AuthorizationSet {
        AuthorizationSet::new()
            .with(Tag::ALGORITHM, Value::U32(algorithm::AES))
            .unwrap()
            .with(Tag::KEY_SIZE, Value::U32(128))
            .unwrap()
            .with(Tag::ACTIVE_DATETIME, Value::U64(5))
            .unwrap()
            .with(Tag::APPLICATION_ID, Value::Bytes(b"app".to_vec()))
            .unwrap()
    }

    #[test]
    fn test_create_and_parse() {
        let ctx = context();
        let created = ctx.create_key_blob(&description(), origin::GENERATED, &[7u8; 16]).unwrap();

        assert_eq!(created.hw_enforced.get_u32(Tag::ALGORITHM), Some(algorithm::AES));
        assert_eq!(created.hw_enforced.get_u32(Tag::ORIGIN), Some(origin::GENERATED));
        assert_eq!(created.hw_enforced.get_u32(Tag::OS_VERSION), Some(130000));
        assert_eq!(created.hw_enforced.get_u32(Tag::OS_PATCHLEVEL), Some(202410));
        assert_eq!(created.sw_enforced.get_u64(Tag::CREATION_DATETIME), Some(1_700_000_000_000));
        assert_eq!(created.sw_enforced.get_u64(Tag::ACTIVE_DATETIME), Some(5));
        assert!(!created.hw_enforced.contains(Tag::APPLICATION_ID));
        assert!(!created.sw_enforced.contains(Tag::APPLICATION_ID));

        let params = AuthorizationSet::new()
            .with(Tag::APPLICATION_ID, Value::Bytes(b"app".to_vec()))
            .unwrap();
        let unpacked = ctx.parse_key_blob(&created.key_blob, &params).unwrap();
        assert_eq!(unpacked.key_material.as_slice(), &[7u8; 16]);
        assert_eq!(unpacked.hw_enforced, created.hw_enforced);

        assert!(matches!(
            ctx.parse_key_blob(&created.key_blob, &AuthorizationSet::new()),
            Err(KeyBlobError::InvalidKeyBlob)
        ));
    }

    #[test]
    fn test_reserved_tag_rejected() {
        let ctx = context();
        let desc = description().with(Tag::ORIGIN, Value::U32(origin::IMPORTED)).unwrap();
        assert!(matches!(
            ctx.create_key_blob(&desc, origin::GENERATED, b"k"),
            Err(KeyBlobError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_parse_requires_algorithm() {
        let ctx = context();
        let hidden = build_hidden_authorizations(&AuthorizationSet::new()).unwrap();
        let blob = ctx
            .codec()
            .serialize_key_data_blob(b"k", &hidden, &AuthorizationSet::new(), &AuthorizationSet::new())
            .unwrap();
        assert!(matches!(
            ctx.parse_key_blob(&blob, &AuthorizationSet::new()),
            Err(KeyBlobError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_upgrade_legacy_blob() {
        let ctx = context();
        let params = AuthorizationSet::new();
        let hidden = build_hidden_authorizations(&params).unwrap();
        let (_, hw, sw) = sets();
        let legacy = serialize_integrity_assured_blob(b"old", &hidden, &hw, &sw);

        let upgraded = ctx.upgrade_key_blob(&legacy, &params).unwrap().unwrap();
        let unpacked = ctx.parse_key_blob(&upgraded, &params).unwrap();
        assert_eq!(unpacked.format, BlobFormat::Encrypted);
        assert_eq!(unpacked.key_material.as_slice(), b"old");
        assert_eq!(ctx.upgrade_key_blob(&upgraded, &params).unwrap(), None);
    }
}
