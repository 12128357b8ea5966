//! Key blob wrapping through the public api

use pinvault::authset::{algorithm, origin, purpose, AuthorizationSet, Tag, Value};
use pinvault::clock::ManualClock;
use pinvault::error::KeyBlobError;
use pinvault::key_provider::{FileKeyProvider, StaticKeyProvider};
use pinvault::keyblob::{build_hidden_authorizations, BlobFormat, KeyBlobCodec, KeyBlobContext};

fn authorizations() -> (AuthorizationSet, AuthorizationSet) {
    let hw = AuthorizationSet::new()
        .with(Tag::ALGORITHM, Value::U32(algorithm::AES))
        .unwrap()
        .with(Tag::KEY_SIZE, Value::U32(256))
        .unwrap()
        .with(Tag::PURPOSE, Value::U32(purpose::ENCRYPT))
        .unwrap()
        .with(Tag::PURPOSE, Value::U32(purpose::DECRYPT))
        .unwrap();
    let sw = AuthorizationSet::new().with(Tag::CREATION_DATETIME, Value::U64(1_700_000_000_000)).unwrap();
    (hw, sw)
}

fn hidden(app_id: &[u8]) -> AuthorizationSet {
    let params = AuthorizationSet::new().with(Tag::APPLICATION_ID, Value::Bytes(app_id.to_vec())).unwrap();
    build_hidden_authorizations(&params).unwrap()
}

#[test]
fn test_codec_roundtrip_and_hidden_binding() {
    let codec = KeyBlobCodec::new(StaticKeyProvider::new([0x5a; 32]));
    let (hw, sw) = authorizations();
    let km = hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f").unwrap();

    let blob = codec.serialize_key_data_blob(&km, &hidden(b"app"), &hw, &sw).unwrap();
    let unpacked = codec.deserialize_key_data_blob(&blob, &hidden(b"app")).unwrap();
    assert_eq!(unpacked.key_material.as_slice(), km.as_slice());
    assert_eq!(unpacked.hw_enforced, hw);
    assert_eq!(unpacked.sw_enforced, sw);
    assert_eq!(unpacked.format, BlobFormat::Encrypted);

    assert!(matches!(
        codec.deserialize_key_data_blob(&blob, &hidden(b"other app")),
        Err(KeyBlobError::InvalidKeyBlob)
    ));
    assert!(matches!(codec.deserialize_blob(&blob, &AuthorizationSet::new()), Err(KeyBlobError::InvalidKeyBlob)));

    // same inputs, fresh nonce
    let again = codec.serialize_key_data_blob(&km, &hidden(b"app"), &hw, &sw).unwrap();
    assert_ne!(blob, again);
}

#[test]
fn test_any_single_byte_flip_is_rejected() {
    let codec = KeyBlobCodec::new(StaticKeyProvider::new([0x5a; 32]));
    let (hw, sw) = authorizations();
    let blob = codec.serialize_key_data_blob(b"material", &hidden(b"app"), &hw, &sw).unwrap();

    for i in 0..blob.len() {
        let mut tampered = blob.clone();
        tampered[i] ^= 0x01;
        assert!(
            matches!(codec.deserialize_blob(&tampered, &hidden(b"app")), Err(KeyBlobError::InvalidKeyBlob)),
            "flip at byte {} accepted",
            i
        );
    }
    assert!(codec.deserialize_blob(&blob[..blob.len() - 1], &hidden(b"app")).is_err());
}

#[test]
fn test_wrong_key_and_missing_key() {
    let (hw, sw) = authorizations();
    let blob = KeyBlobCodec::new(StaticKeyProvider::new([1; 32]))
        .serialize_key_data_blob(b"material", &hidden(b"app"), &hw, &sw)
        .unwrap();

    let other = KeyBlobCodec::new(StaticKeyProvider::new([2; 32]));
    assert!(matches!(other.deserialize_blob(&blob, &hidden(b"app")), Err(KeyBlobError::InvalidKeyBlob)));

    let missing = KeyBlobCodec::new(StaticKeyProvider::unavailable());
    assert!(matches!(
        missing.serialize_key_data_blob(b"material", &hidden(b"app"), &hw, &sw),
        Err(KeyBlobError::SerializationError)
    ));
    assert!(matches!(missing.deserialize_blob(&blob, &hidden(b"app")), Err(KeyBlobError::InvalidKeyBlob)));
}

#[test]
fn test_context_with_key_file() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("keyblob.key");
    let context = |clock: &ManualClock| {
        KeyBlobContext::new(KeyBlobCodec::new(FileKeyProvider::new(&key_path)), 140000, 202501)
            .with_clock(clock.clone())
    };
    let clock = ManualClock::new(1_700_000_000);

    let description = AuthorizationSet::new()
        .with(Tag::ALGORITHM, Value::U32(algorithm::HMAC))
        .unwrap()
        .with(Tag::KEY_SIZE, Value::U32(256))
        .unwrap()
        .with(Tag::APPLICATION_ID, Value::Bytes(b"com.example".to_vec()))
        .unwrap();

    let created = context(&clock).create_key_blob(&description, origin::IMPORTED, b"hmac key").unwrap();
    assert!(key_path.exists());
    assert_eq!(created.hw_enforced.get_u32(Tag::ORIGIN), Some(origin::IMPORTED));
    assert_eq!(created.hw_enforced.get_u32(Tag::OS_PATCHLEVEL), Some(202501));
    assert!(!created.hw_enforced.contains(Tag::APPLICATION_ID));
    assert!(!created.sw_enforced.contains(Tag::APPLICATION_ID));

    // a new context over the same key file reads it back
    let params = AuthorizationSet::new().with(Tag::APPLICATION_ID, Value::Bytes(b"com.example".to_vec())).unwrap();
    let parsed = context(&clock).parse_key_blob(&created.key_blob, &params).unwrap();
    assert_eq!(parsed.key_material.as_slice(), b"hmac key");
    assert_eq!(parsed.hw_enforced, created.hw_enforced);
    assert_eq!(parsed.sw_enforced, created.sw_enforced);

    assert!(matches!(
        context(&clock).parse_key_blob(&created.key_blob, &AuthorizationSet::new()),
        Err(KeyBlobError::InvalidKeyBlob)
    ));
    assert_eq!(context(&clock).upgrade_key_blob(&created.key_blob, &params).unwrap(), None);
}

#[test]
fn test_context_rejects_reserved_tags() {
    let context = KeyBlobContext::new(KeyBlobCodec::new(StaticKeyProvider::new([4; 32])), 0, 0);
    let description = AuthorizationSet::new()
        .with(Tag::ALGORITHM, Value::U32(algorithm::AES))
        .unwrap()
        .with(Tag::ORIGIN, Value::U32(origin::GENERATED))
        .unwrap();
    assert!(matches!(
        context.create_key_blob(&description, origin::GENERATED, b"k"),
        Err(KeyBlobError::InvalidArgument(_))
    ));
}
