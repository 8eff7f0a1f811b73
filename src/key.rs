//! Internal-key encoding: a user key plus a sequence number, compared so that
//! equal user keys sort by descending sequence (newest version first).

use bytes::Bytes;
use std::cmp::Ordering;

/// `Key<T>` wraps a user-key byte container `T` together with a sequence number.
/// `T` is `&[u8]` for a borrowed `KeySlice`, `Vec<u8>` for an owned `KeyVec`, or
/// `Bytes` for a ref-counted `KeyBytes` that can be stored in maps cheaply.
#[derive(Debug, Default)]
pub struct Key<T: AsRef<[u8]>>(T, u64);

pub type KeySlice<'a> = Key<&'a [u8]>;
pub type KeyVec = Key<Vec<u8>>;
pub type KeyBytes = Key<Bytes>;

impl<T: AsRef<[u8]> + Clone> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone(), self.1)
    }
}

impl<T: AsRef<[u8]> + Copy> Copy for Key<T> {}

impl<T: AsRef<[u8]>> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key_ref() == other.key_ref() && self.1 == other.1
    }
}
impl<T: AsRef<[u8]>> Eq for Key<T> {}

impl<T: AsRef<[u8]>> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: AsRef<[u8]>> Ord for Key<T> {
    /// Ascending user-key order; within the same user key, descending sequence
    /// number so the newest version of a key always precedes older ones.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_ref()
            .cmp(other.key_ref())
            .then(other.1.cmp(&self.1))
    }
}

impl<T: AsRef<[u8]>> Key<T> {
    pub fn into_inner(self) -> T {
        self.0
    }

    pub fn key_ref(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn raw_ref(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn ts(&self) -> u64 {
        self.1
    }

    pub fn len(&self) -> usize {
        self.0.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_ref().is_empty()
    }

    /// Encoded length if this key were laid out as `key_len(2B) + key + ts(8B)`.
    pub fn raw_len(&self) -> usize {
        self.len() + std::mem::size_of::<u64>()
    }
}

impl Key<Vec<u8>> {
    pub fn new() -> Self {
        Self(Vec::new(), 0)
    }

    pub fn from_vec(key: Vec<u8>) -> Self {
        Self(key, 0)
    }

    pub fn from_vec_with_ts(key: Vec<u8>, ts: u64) -> Self {
        Self(key, ts)
    }

    pub fn set_from_slice(&mut self, key: KeySlice) {
        self.0.clear();
        self.0.extend_from_slice(key.key_ref());
        self.1 = key.ts();
    }

    pub fn set_ts(&mut self, ts: u64) {
        self.1 = ts;
    }

    /// Clears the backing buffer (keeping its allocation) and resets the
    /// sequence number, so the key can be reused as scratch space by an
    /// iterator that decodes one entry per step.
    pub fn clear_for_reuse(&mut self) {
        self.0.clear();
        self.1 = 0;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
    }

    pub fn as_key_slice(&self) -> KeySlice {
        Key(&self.0, self.1)
    }

    pub fn into_key_bytes(self) -> KeyBytes {
        Key(self.0.into(), self.1)
    }
}

impl Key<Bytes> {
    pub fn new() -> Self {
        Self(Bytes::new(), 0)
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes, 0)
    }

    pub fn from_bytes_with_ts(bytes: Bytes, ts: u64) -> Self {
        Self(bytes, ts)
    }

    pub fn as_key_slice(&self) -> KeySlice {
        Key(&self.0, self.1)
    }
}

impl<'a> Key<&'a [u8]> {
    pub fn from_slice(slice: &'a [u8], ts: u64) -> Self {
        Self(slice, ts)
    }

    pub fn to_key_vec(self) -> KeyVec {
        Key(self.0.to_vec(), self.1)
    }
}
