use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Numeric identity of an interned value.
pub type Id = u64;

/// Opaque tag for a host type.
///
/// Rules are selected by `(subject type, product type)` pairs, and produced
/// values are checked against the requested product using this tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct TypeId(pub u64);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

/// Stable identity of one interned host value.
///
/// Equality and hashing only look at `id`: two keys with the same `id` always
/// carry the same `type_id`, because the interning table assigns ids per
/// [`Ident`].
#[derive(Clone, Copy, Debug)]
pub struct Key {
    id: Id,
    type_id: TypeId,
}

impl Key {
    pub(crate) fn new(id: Id, type_id: TypeId) -> Self {
        Self { id, type_id }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Key {}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}, {})", self.id, self.type_id.0)
    }
}

/// Externally computed identity of a host value.
///
/// The host guarantees that two values with an equal `Ident` are
/// interchangeable, so the interning table collapses them into one [`Key`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Ident {
    pub hash: i64,
    pub type_id: TypeId,
}

/// An interned reference to a host callable that a rule invokes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Function {
    pub key: Key,
}

/// A 32-byte BLAKE3 hash used for content addressing and fingerprints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid hex fingerprint '{0}'")]
pub struct ParseHashError(pub String);

impl FromStr for Hash32 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 64 {
            return Err(ParseHashError(s.to_string()));
        }

        fn nibble(c: u8) -> Option<u8> {
            match c {
                b'0'..=b'9' => Some(c - b'0'),
                b'a'..=b'f' => Some(c - b'a' + 10),
                b'A'..=b'F' => Some(c - b'A' + 10),
                _ => None,
            }
        }

        let mut out = [0u8; 32];
        for (i, chunk) in bytes.chunks(2).enumerate() {
            let hi = nibble(chunk[0]).ok_or_else(|| ParseHashError(s.to_string()))?;
            let lo = nibble(chunk[1]).ok_or_else(|| ParseHashError(s.to_string()))?;
            out[i] = (hi << 4) | lo;
        }

        Ok(Hash32(out))
    }
}

/// A content-addressed reference to a blob or directory in the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct Digest {
    pub hash: Hash32,
    pub size_bytes: usize,
}

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Digest {
            hash: Hash32::hash(bytes),
            size_bytes: bytes.len(),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

/// Digest of the empty byte string, and of the empty directory.
pub static EMPTY_DIGEST: std::sync::LazyLock<Digest> =
    std::sync::LazyLock::new(|| Digest::of_bytes(&[]));
