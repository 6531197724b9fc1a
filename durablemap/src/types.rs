use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use rustc_hash::FxHasher;

use crate::error::{DurableMapError, Result};

/// Reserved index value: never a legitimate key hash nor a stored id
pub const NO_VALUE: i32 = 0;

/// Serializes items of one type to/from byte buffers.
///
/// `encoded_size` must be exact: `write` is handed a buffer of exactly that length,
/// and `read` is handed exactly the bytes `write` produced.
pub trait DataExternalizer {
    type Item;

    fn encoded_size(item: &Self::Item) -> usize;

    fn write(item: &Self::Item, buf: &mut [u8]);

    fn read(buf: &[u8]) -> Result<Self::Item>;

    fn to_bytes(item: &Self::Item) -> Vec<u8> {
        let mut buf = vec![0u8; Self::encoded_size(item)];
        Self::write(item, &mut buf);
        buf
    }
}

/// Externalizer for map keys: adds hashing and equality
pub trait KeyDescriptor: DataExternalizer {
    fn hash_code(item: &Self::Item) -> i32;

    fn is_equal(l: &Self::Item, r: &Self::Item) -> bool;
}

/// Spreads the bits of a raw key hash, and keeps it away from [`NO_VALUE`]
pub fn adjust_hash(hash: i32) -> i32 {
    // murmur3 fmix32
    let mut h = hash as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    let h = h as i32;
    if h == NO_VALUE { 1 } else { h }
}

fn fx_hash<T: Hash + ?Sized>(item: &T) -> i32 {
    let mut hasher = FxHasher::default();
    item.hash(&mut hasher);
    hasher.finish() as i32
}

/// Wrapper for native types that can be represented as bytes (numbers, etc.)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Native<T>(PhantomData<T>);

impl<T> Default for Native<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

/// Wrapper for string types, items are owned `String`s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Str;

/// Wrapper for byte slice types, items are owned `Vec<u8>`s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Bytes;

impl<T> DataExternalizer for Native<T>
where
    T: bytemuck::Pod,
{
    type Item = T;

    fn encoded_size(_item: &T) -> usize {
        std::mem::size_of::<T>()
    }

    fn write(item: &T, buf: &mut [u8]) {
        buf.copy_from_slice(bytemuck::bytes_of(item));
    }

    fn read(buf: &[u8]) -> Result<T> {
        if buf.len() != std::mem::size_of::<T>() {
            return Err(DurableMapError::Decoding(format!(
                "Invalid byte length for {}: expected {}, got {}",
                std::any::type_name::<T>(),
                std::mem::size_of::<T>(),
                buf.len()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(buf))
    }
}

impl<T> KeyDescriptor for Native<T>
where
    T: bytemuck::Pod + Eq + Hash,
{
    fn hash_code(item: &T) -> i32 {
        fx_hash(item)
    }

    fn is_equal(l: &T, r: &T) -> bool {
        l == r
    }
}

impl DataExternalizer for Str {
    type Item = String;

    fn encoded_size(item: &String) -> usize {
        item.len()
    }

    fn write(item: &String, buf: &mut [u8]) {
        buf.copy_from_slice(item.as_bytes());
    }

    fn read(buf: &[u8]) -> Result<String> {
        Ok(std::str::from_utf8(buf)?.to_owned())
    }
}

impl KeyDescriptor for Str {
    fn hash_code(item: &String) -> i32 {
        fx_hash(item.as_str())
    }

    fn is_equal(l: &String, r: &String) -> bool {
        l == r
    }
}

impl DataExternalizer for Bytes {
    type Item = Vec<u8>;

    fn encoded_size(item: &Vec<u8>) -> usize {
        item.len()
    }

    fn write(item: &Vec<u8>, buf: &mut [u8]) {
        buf.copy_from_slice(item);
    }

    fn read(buf: &[u8]) -> Result<Vec<u8>> {
        Ok(buf.to_vec())
    }
}

impl KeyDescriptor for Bytes {
    fn hash_code(item: &Vec<u8>) -> i32 {
        fx_hash(item.as_slice())
    }

    fn is_equal(l: &Vec<u8>, r: &Vec<u8>) -> bool {
        l == r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_native_round_trip() {
        let bytes = Native::<u64>::to_bytes(&42);
        assert_eq!(bytes.len(), 8);
        assert_eq!(Native::<u64>::read(&bytes).unwrap(), 42);
    }

    #[test]
    fn test_native_wrong_length() {
        let err = Native::<u32>::read(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, DurableMapError::Decoding(_)));
    }

    #[test]
    fn test_str_invalid_utf8() {
        assert!(Str::read(&[0xff, 0xfe]).is_err());
        assert_eq!(Str::read(b"").unwrap(), "");
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = Str::hash_code(&"key".to_string());
        let b = Str::hash_code(&"key".to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn test_adjust_hash_never_no_value() {
        assert_ne!(adjust_hash(0), NO_VALUE);
        // fmix32 maps 0 to 0, so that input must be remapped
        assert_eq!(adjust_hash(0), 1);
    }

    proptest! {
        #[test]
        fn prop_adjust_hash_never_no_value(h in any::<i32>()) {
            prop_assert_ne!(adjust_hash(h), NO_VALUE);
        }

        #[test]
        fn prop_adjust_hash_is_stable(h in any::<i32>()) {
            prop_assert_eq!(adjust_hash(h), adjust_hash(h));
        }
    }
}
