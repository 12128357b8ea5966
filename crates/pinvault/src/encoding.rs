//! bincode settings shared by every persisted structure
//!
//! fixed-width little endian integers, a size limit, and no tolerance for
//! trailing bytes, so one value has exactly one encoding.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

const LIMIT: u64 = 1 << 20;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(LIMIT)
        .reject_trailing_bytes()
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Option<Vec<u8>> {
    options().serialize(value).ok()
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    options().deserialize(bytes).ok()
}
