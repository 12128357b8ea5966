//! authorization sets - typed, ordered tag/value lists bound to key blobs
//!
//! a tag carries its value type in the high nibble. the set is always kept
//! sorted by (tag, value), so serialization is a straight walk and two sets
//! with the same content always produce the same bytes.
//!
//! wire format, all integers little endian:
//!
//! ```text
//! count: u32
//! repeated count times:
//!   tag: u32
//!   value: u8 (bool, always 1) | u32 (enum, uint) | u64 (ulong, date)
//!        | u32 len + bytes (bytes, bignum)
//! ```

use crate::error::{AuthSetError, AuthSetResult};

/// most entries a set may hold
pub const MAX_PARAMS: usize = 256;

/// longest bytes/bignum value
pub const MAX_BYTES_LEN: usize = 64 * 1024;

const TYPE_MASK: u32 = 0xf000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum TagType {
    Enum = 1 << 28,
    EnumRep = 2 << 28,
    UInt = 3 << 28,
    UIntRep = 4 << 28,
    ULong = 5 << 28,
    Date = 6 << 28,
    Bool = 7 << 28,
    Bignum = 8 << 28,
    Bytes = 9 << 28,
    ULongRep = 10 << 28,
}

impl TagType {
    fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & TYPE_MASK {
            x if x == TagType::Enum as u32 => TagType::Enum,
            x if x == TagType::EnumRep as u32 => TagType::EnumRep,
            x if x == TagType::UInt as u32 => TagType::UInt,
            x if x == TagType::UIntRep as u32 => TagType::UIntRep,
            x if x == TagType::ULong as u32 => TagType::ULong,
            x if x == TagType::Date as u32 => TagType::Date,
            x if x == TagType::Bool as u32 => TagType::Bool,
            x if x == TagType::Bignum as u32 => TagType::Bignum,
            x if x == TagType::Bytes as u32 => TagType::Bytes,
            x if x == TagType::ULongRep as u32 => TagType::ULongRep,
            _ => return None,
        })
    }

    pub fn is_repeatable(self) -> bool {
        matches!(self, TagType::EnumRep | TagType::UIntRep | TagType::ULongRep)
    }

    fn accepts(self, value: &Value) -> bool {
        match value {
            Value::Bool => self == TagType::Bool,
            Value::U32(_) => matches!(self, TagType::Enum | TagType::EnumRep | TagType::UInt | TagType::UIntRep),
            Value::U64(_) => matches!(self, TagType::ULong | TagType::ULongRep | TagType::Date),
            Value::Bytes(_) => matches!(self, TagType::Bytes | TagType::Bignum),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u32);

impl Tag {
    pub const PURPOSE: Tag = Tag(TagType::EnumRep as u32 | 1);
    pub const ALGORITHM: Tag = Tag(TagType::Enum as u32 | 2);
    pub const KEY_SIZE: Tag = Tag(TagType::UInt as u32 | 3);
    pub const BLOCK_MODE: Tag = Tag(TagType::EnumRep as u32 | 4);
    pub const DIGEST: Tag = Tag(TagType::EnumRep as u32 | 5);
    pub const PADDING: Tag = Tag(TagType::EnumRep as u32 | 6);
    pub const CALLER_NONCE: Tag = Tag(TagType::Bool as u32 | 7);
    pub const MIN_MAC_LENGTH: Tag = Tag(TagType::UInt as u32 | 8);
    pub const EC_CURVE: Tag = Tag(TagType::Enum as u32 | 10);
    pub const RSA_PUBLIC_EXPONENT: Tag = Tag(TagType::ULong as u32 | 200);
    pub const ACTIVE_DATETIME: Tag = Tag(TagType::Date as u32 | 400);
    pub const ORIGINATION_EXPIRE_DATETIME: Tag = Tag(TagType::Date as u32 | 401);
    pub const USAGE_EXPIRE_DATETIME: Tag = Tag(TagType::Date as u32 | 402);
    pub const USER_SECURE_ID: Tag = Tag(TagType::ULongRep as u32 | 502);
    pub const NO_AUTH_REQUIRED: Tag = Tag(TagType::Bool as u32 | 503);
    pub const USER_AUTH_TYPE: Tag = Tag(TagType::Enum as u32 | 504);
    pub const AUTH_TIMEOUT: Tag = Tag(TagType::UInt as u32 | 505);
    pub const APPLICATION_ID: Tag = Tag(TagType::Bytes as u32 | 601);
    pub const APPLICATION_DATA: Tag = Tag(TagType::Bytes as u32 | 700);
    pub const CREATION_DATETIME: Tag = Tag(TagType::Date as u32 | 701);
    pub const ORIGIN: Tag = Tag(TagType::Enum as u32 | 702);
    pub const ROOT_OF_TRUST: Tag = Tag(TagType::Bytes as u32 | 704);
    pub const OS_VERSION: Tag = Tag(TagType::UInt as u32 | 705);
    pub const OS_PATCHLEVEL: Tag = Tag(TagType::UInt as u32 | 706);
    pub const UNIQUE_ID: Tag = Tag(TagType::Bytes as u32 | 707);

    pub fn tag_type(self) -> Option<TagType> {
        TagType::from_bits(self.0)
    }

    pub fn is_repeatable(self) -> bool {
        self.tag_type().is_some_and(TagType::is_repeatable)
    }
}

/// values of [`Tag::ALGORITHM`]
pub mod algorithm {
    pub const RSA: u32 = 1;
    pub const EC: u32 = 3;
    pub const AES: u32 = 32;
    pub const TRIPLE_DES: u32 = 33;
    pub const HMAC: u32 = 128;
}

/// values of [`Tag::ORIGIN`]
pub mod origin {
    pub const GENERATED: u32 = 0;
    pub const DERIVED: u32 = 1;
    pub const IMPORTED: u32 = 2;
    pub const UNKNOWN: u32 = 3;
}

/// values of [`Tag::PURPOSE`]
pub mod purpose {
    pub const ENCRYPT: u32 = 0;
    pub const DECRYPT: u32 = 1;
    pub const SIGN: u32 = 2;
    pub const VERIFY: u32 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// bool tags are true when present
    Bool,
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyParam {
    pub tag: Tag,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AuthorizationSet {
    params: Vec<KeyParam>,
}

impl AuthorizationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// build a set from arbitrary params, normalizing as `push` does
    pub fn from_params(params: impl IntoIterator<Item = KeyParam>) -> AuthSetResult<Self> {
        let mut set = Self::new();
        for p in params {
            set.push(p.tag, p.value)?;
        }
        Ok(set)
    }

    /// insert `value` under `tag`
    ///
    /// an identical entry is a no-op; a non-repeatable tag replaces its
    /// previous value.
    pub fn push(&mut self, tag: Tag, value: Value) -> AuthSetResult<()> {
        let tag_type = tag.tag_type().ok_or(AuthSetError::UnknownTagType(tag.0))?;
        if !tag_type.accepts(&value) {
            return Err(AuthSetError::TypeMismatch(tag.0));
        }
        if let Value::Bytes(b) = &value {
            if b.len() > MAX_BYTES_LEN {
                return Err(AuthSetError::TooLarge("bytes value"));
            }
        }
        if !tag_type.is_repeatable() {
            self.params.retain(|p| p.tag != tag);
        }
        let param = KeyParam { tag, value };
        if let Err(pos) = self.params.binary_search(&param) {
            if self.params.len() >= MAX_PARAMS {
                return Err(AuthSetError::TooLarge("entry count"));
            }
            self.params.insert(pos, param);
        }
        Ok(())
    }

    /// builder form of `push`
    pub fn with(mut self, tag: Tag, value: Value) -> AuthSetResult<Self> {
        self.push(tag, value)?;
        Ok(self)
    }

    /// push every entry of `other`
    pub fn merge(&mut self, other: &AuthorizationSet) -> AuthSetResult<()> {
        for p in &other.params {
            self.push(p.tag, p.value.clone())?;
        }
        Ok(())
    }

    /// drop every entry for `tag`, returning how many went
    pub fn remove(&mut self, tag: Tag) -> usize {
        let before = self.params.len();
        self.params.retain(|p| p.tag != tag);
        before - self.params.len()
    }

    pub fn get(&self, tag: Tag) -> Option<&Value> {
        self.params.iter().find(|p| p.tag == tag).map(|p| &p.value)
    }

    pub fn get_all(&self, tag: Tag) -> impl Iterator<Item = &Value> + '_ {
        self.params.iter().filter(move |p| p.tag == tag).map(|p| &p.value)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.get(tag).is_some()
    }

    pub fn get_u32(&self, tag: Tag) -> Option<u32> {
        match self.get(tag)? {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, tag: Tag) -> Option<u64> {
        match self.get(tag)? {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, tag: Tag) -> Option<&[u8]> {
        match self.get(tag)? {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyParam> + '_ {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.params.len() * 12);
        out.extend_from_slice(&(self.params.len() as u32).to_le_bytes());
        for p in &self.params {
            out.extend_from_slice(&p.tag.0.to_le_bytes());
            match &p.value {
                Value::Bool => out.push(1),
                Value::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
                Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
                Value::Bytes(b) => {
                    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                    out.extend_from_slice(b);
                }
            }
        }
        out
    }

    /// strict decode: only the canonical encoding of a set is accepted
    pub fn from_bytes(bytes: &[u8]) -> AuthSetResult<Self> {
        let mut r = Reader { buf: bytes };
        let count = r.u32()? as usize;
        if count > MAX_PARAMS {
            return Err(AuthSetError::TooLarge("entry count"));
        }

        let mut params: Vec<KeyParam> = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = Tag(r.u32()?);
            let tag_type = tag.tag_type().ok_or(AuthSetError::UnknownTagType(tag.0))?;
            let value = match tag_type {
                TagType::Bool => match r.u8()? {
                    1 => Value::Bool,
                    _ => return Err(AuthSetError::TypeMismatch(tag.0)),
                },
                TagType::Enum | TagType::EnumRep | TagType::UInt | TagType::UIntRep => Value::U32(r.u32()?),
                TagType::ULong | TagType::ULongRep | TagType::Date => Value::U64(r.u64()?),
                TagType::Bytes | TagType::Bignum => {
                    let len = r.u32()? as usize;
                    if len > MAX_BYTES_LEN {
                        return Err(AuthSetError::TooLarge("bytes value"));
                    }
                    Value::Bytes(r.take(len)?.to_vec())
                }
            };
            let param = KeyParam { tag, value };

            if let Some(prev) = params.last() {
                if prev.tag == tag && !tag_type.is_repeatable() {
                    return Err(AuthSetError::DuplicateTag(tag.0));
                }
                if *prev >= param {
                    return Err(AuthSetError::NotCanonical);
                }
            }
            params.push(param);
        }

        if !r.buf.is_empty() {
            return Err(AuthSetError::TrailingBytes);
        }
        Ok(Self { params })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> AuthSetResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(AuthSetError::Truncated);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> AuthSetResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> AuthSetResult<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> AuthSetResult<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }
}
