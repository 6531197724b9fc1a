use modular_bitfield::prelude::*;

use crate::error::{DurableMapError, Result};
use crate::types::{DataExternalizer, KeyDescriptor, NO_VALUE};

pub const KEY_HEADER_SIZE: usize = 4;
pub const ITEM_HEADER_SIZE: usize = 4;

/// Longest key a record header can describe
pub const MAX_KEY_SIZE: usize = (1 << 15) - 1;

/// Marks an item of an appendable set as a removal rather than an insertion
const ITEM_REMOVED_MASK: u32 = 1 << 31;

/// First 32 bits of every record: `key_size` in the low 15 bits, then the "no value" flag
/// (mask `0b1000_0000_0000_0000`), the upper half is unused
#[bitfield(bits = 32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyHeader {
    pub key_size: B15,
    pub value_void: bool,
    #[skip]
    __: B16,
}

impl KeyHeader {
    pub fn for_key(key_size: usize, value_void: bool) -> Self {
        assert!(
            key_size <= MAX_KEY_SIZE,
            "key of {key_size} bytes is longer than the max {MAX_KEY_SIZE}"
        );
        KeyHeader::new()
            .with_key_size(key_size as u16)
            .with_value_void(value_void)
    }

    pub fn to_i32(self) -> i32 {
        i32::from_le_bytes(self.into_bytes())
    }

    pub fn from_i32(raw: i32) -> Self {
        KeyHeader::from_bytes(raw.to_le_bytes())
    }
}

/// Narrows a storage id to the `i32` kept by the index
pub fn to_stored_id(id: u64) -> i32 {
    let stored = i32::try_from(id)
        .unwrap_or_else(|_| panic!("storage id {id} doesn't fit the i32 index id space"));
    assert!(stored != NO_VALUE, "storage id {id} collides with NO_VALUE");
    stored
}

/// Widens an id read back from the index, which may be corrupted
pub fn from_stored_id(stored: i32) -> Result<u64> {
    if stored <= 0 {
        return Err(DurableMapError::Corrupted(format!(
            "stored id {stored} is not a valid storage id"
        )));
    }
    Ok(stored as u64)
}

/// Size of `[header][key][value?]`
pub fn entry_size<K: DataExternalizer, V: DataExternalizer>(
    key: &K::Item,
    value: Option<&V::Item>,
) -> usize {
    KEY_HEADER_SIZE + K::encoded_size(key) + value.map_or(0, |v| V::encoded_size(v))
}

/// Writes `[header][key][value?]` into `buf`, which must be exactly [`entry_size`] long
pub fn write_entry<K: DataExternalizer, V: DataExternalizer>(
    key: &K::Item,
    value: Option<&V::Item>,
    buf: &mut [u8],
) {
    let head = write_key::<K>(key, value.is_none(), buf);
    if let Some(value) = value {
        V::write(value, &mut buf[head..]);
    }
}

/// Writes `[header][key]` at the start of `buf`, returns the number of bytes written
pub fn write_key<K: DataExternalizer>(key: &K::Item, value_void: bool, buf: &mut [u8]) -> usize {
    let key_size = K::encoded_size(key);
    let header = KeyHeader::for_key(key_size, value_void);
    buf[..KEY_HEADER_SIZE].copy_from_slice(&header.to_i32().to_le_bytes());
    K::write(key, &mut buf[KEY_HEADER_SIZE..KEY_HEADER_SIZE + key_size]);
    KEY_HEADER_SIZE + key_size
}

/// Borrowed view over the bytes of one record
#[derive(Debug, Clone, Copy)]
pub struct EntryView<'a> {
    pub header: KeyHeader,
    pub key: &'a [u8],
    /// Everything after the key: a value for single-value records, items for appendable ones
    pub rest: &'a [u8],
}

impl<'a> EntryView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < KEY_HEADER_SIZE {
            return Err(DurableMapError::Corrupted(format!(
                "record of {} bytes has no key header",
                bytes.len()
            )));
        }
        let raw = i32::from_le_bytes(bytes[..KEY_HEADER_SIZE].try_into().unwrap_or_default());
        let header = KeyHeader::from_i32(raw);
        let key_end = KEY_HEADER_SIZE + header.key_size() as usize;
        if key_end > bytes.len() {
            return Err(DurableMapError::Corrupted(format!(
                "key of {} bytes overflows a record of {} bytes",
                header.key_size(),
                bytes.len()
            )));
        }
        Ok(Self {
            header,
            key: &bytes[KEY_HEADER_SIZE..key_end],
            rest: &bytes[key_end..],
        })
    }

    pub fn is_value_void(&self) -> bool {
        self.header.value_void()
    }

    pub fn key_matches<K: KeyDescriptor>(&self, key: &K::Item) -> Result<bool> {
        let candidate = K::read(self.key)?;
        Ok(K::is_equal(&candidate, key))
    }
}

pub fn item_header(size: usize, removed: bool) -> [u8; ITEM_HEADER_SIZE] {
    let size = u32::try_from(size)
        .ok()
        .filter(|s| s & ITEM_REMOVED_MASK == 0)
        .unwrap_or_else(|| panic!("item of {size} bytes is too large"));
    let raw = if removed { size | ITEM_REMOVED_MASK } else { size };
    raw.to_le_bytes()
}

/// One `[itemSize][itemBytes]` element of an appendable set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawItem<'a> {
    pub bytes: &'a [u8],
    pub removed: bool,
}

/// Splits a run of `[itemSize][itemBytes]` elements
pub fn parse_items(mut buf: &[u8]) -> Result<Vec<RawItem<'_>>> {
    let mut items = Vec::new();
    while !buf.is_empty() {
        if buf.len() < ITEM_HEADER_SIZE {
            return Err(DurableMapError::Corrupted(format!(
                "{} trailing bytes can't hold an item header",
                buf.len()
            )));
        }
        let raw = u32::from_le_bytes(buf[..ITEM_HEADER_SIZE].try_into().unwrap_or_default());
        let size = (raw & !ITEM_REMOVED_MASK) as usize;
        let end = ITEM_HEADER_SIZE + size;
        if end > buf.len() {
            return Err(DurableMapError::Corrupted(format!(
                "item of {size} bytes overflows the {} bytes left in its chunk",
                buf.len() - ITEM_HEADER_SIZE
            )));
        }
        items.push(RawItem {
            bytes: &buf[ITEM_HEADER_SIZE..end],
            removed: raw & ITEM_REMOVED_MASK != 0,
        });
        buf = &buf[end..];
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Native, Str};
    use proptest::prelude::*;

    #[test]
    fn test_key_header_layout() {
        let header = KeyHeader::for_key(5, true);
        assert_eq!(header.to_i32(), 0b1000_0000_0000_0000 | 5);
        assert_eq!(KeyHeader::from_i32(5).key_size(), 5);
        assert!(!KeyHeader::from_i32(5).value_void());
    }

    #[test]
    #[should_panic(expected = "longer than the max")]
    fn test_key_too_long() {
        KeyHeader::for_key(MAX_KEY_SIZE + 1, false);
    }

    #[test]
    fn test_entry_view() {
        let key = "abc".to_string();
        let size = entry_size::<Str, Native<u32>>(&key, Some(&7));
        assert_eq!(size, 4 + 3 + 4);

        let mut buf = vec![0u8; size];
        write_entry::<Str, Native<u32>>(&key, Some(&7), &mut buf);
        let view = EntryView::parse(&buf).unwrap();
        assert!(!view.is_value_void());
        assert!(view.key_matches::<Str>(&key).unwrap());
        assert!(!view.key_matches::<Str>(&"abd".to_string()).unwrap());
        assert_eq!(Native::<u32>::read(view.rest).unwrap(), 7);
    }

    #[test]
    fn test_void_entry_and_empty_key() {
        let key = String::new();
        let mut buf = vec![0u8; entry_size::<Str, Str>(&key, None)];
        write_entry::<Str, Str>(&key, None, &mut buf);
        let view = EntryView::parse(&buf).unwrap();
        assert!(view.is_value_void());
        assert!(view.key.is_empty());
        assert!(view.rest.is_empty());
    }

    #[test]
    fn test_parse_truncated_record() {
        assert!(EntryView::parse(&[1, 0]).is_err());
        // key_size = 10, but nothing follows
        assert!(EntryView::parse(&[10, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_items() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&item_header(2, false));
        buf.extend_from_slice(b"hi");
        buf.extend_from_slice(&item_header(0, false));
        buf.extend_from_slice(&item_header(2, true));
        buf.extend_from_slice(b"hi");

        let items = parse_items(&buf).unwrap();
        assert_eq!(
            items,
            vec![
                RawItem { bytes: b"hi", removed: false },
                RawItem { bytes: b"", removed: false },
                RawItem { bytes: b"hi", removed: true },
            ]
        );

        assert!(parse_items(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    #[should_panic(expected = "doesn't fit")]
    fn test_stored_id_overflow() {
        to_stored_id(i32::MAX as u64 + 1);
    }

    #[test]
    fn test_invalid_stored_id() {
        assert!(matches!(from_stored_id(-8), Err(DurableMapError::Corrupted(_))));
        assert!(matches!(from_stored_id(NO_VALUE), Err(DurableMapError::Corrupted(_))));
    }

    proptest! {
        #[test]
        fn prop_stored_id_is_lossless(id in 1u64..=i32::MAX as u64) {
            prop_assert_eq!(from_stored_id(to_stored_id(id)).unwrap(), id);
        }
    }
}
