use std::mem::size_of;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;

use crate::byte_store::{ByteStore, MMapFile, VecStore};
use crate::config::AllocationStrategy;
use crate::error::{DurableMapError, Result};

pub const NULL_ID: u64 = 0;

const MAGIC_WORD: u32 = u32::from_le_bytes(*b"BLOB");
const IMPLEMENTATION_VERSION: u32 = 1;
const HEADER_SIZE: usize = size_of::<StorageHeader>();
const RECORD_HEADER_SIZE: usize = size_of::<RecordHeader>();
const ALIGNMENT: usize = 8;
/// Redirect chains are short in practice, a longer one means a cycle
const MAX_REDIRECTS: usize = 1024;

/// `RecordHeader::length` marks, real lengths are always below them
const MOVED: u32 = u32::MAX;
const DELETED: u32 = u32::MAX - 1;
const MAX_CAPACITY: usize = (u32::MAX - 2) as usize;

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C)]
struct StorageHeader {
    magic: u32,
    version: u32,
    /// First byte past the last allocated record
    next_offset: u64,
    records_allocated: u64,
    records_relocated: u64,
    records_deleted: u64,
    _reserved: u64,
}

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C)]
struct RecordHeader {
    capacity: u32,
    length: u32,
    redirect_to: u32,
    _pad: u32,
}

fn align_up(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

fn offset_of(id: u64) -> usize {
    id as usize * ALIGNMENT
}

struct Blobs<BS: ByteStore> {
    store: BS,
}

impl<BS: ByteStore> Blobs<BS> {
    fn create(mut store: BS) -> Result<Self> {
        store.ensure_len(HEADER_SIZE)?;
        let mut blobs = Self { store };
        *blobs.header_mut() = StorageHeader {
            magic: MAGIC_WORD,
            version: IMPLEMENTATION_VERSION,
            next_offset: HEADER_SIZE as u64,
            records_allocated: 0,
            records_relocated: 0,
            records_deleted: 0,
            _reserved: 0,
        };
        Ok(blobs)
    }

    fn load(store: BS) -> Result<Self> {
        if store.len() < HEADER_SIZE {
            return Err(DurableMapError::Corrupted(format!(
                "blob storage is {} bytes, shorter than its header",
                store.len()
            )));
        }
        let blobs = Self { store };
        let header = blobs.header();
        if header.magic != MAGIC_WORD || header.version != IMPLEMENTATION_VERSION {
            return Err(DurableMapError::Corrupted(format!(
                "unexpected blob storage magic/version: {:#x}/{}",
                header.magic, header.version
            )));
        }
        if header.next_offset as usize > blobs.store.len() {
            return Err(DurableMapError::Corrupted(format!(
                "blob storage claims {} bytes, file has {}",
                header.next_offset,
                blobs.store.len()
            )));
        }
        Ok(blobs)
    }

    fn header(&self) -> &StorageHeader {
        bytemuck::from_bytes(&self.store.as_ref()[..HEADER_SIZE])
    }

    fn header_mut(&mut self) -> &mut StorageHeader {
        bytemuck::from_bytes_mut(&mut self.store.as_mut()[..HEADER_SIZE])
    }

    fn record_header(&self, id: u64) -> Result<RecordHeader> {
        let offset = offset_of(id);
        if id == NULL_ID
            || offset < HEADER_SIZE
            || offset + RECORD_HEADER_SIZE > self.header().next_offset as usize
        {
            return Err(DurableMapError::Corrupted(format!(
                "record id {id} is outside of the storage"
            )));
        }
        let header: RecordHeader =
            *bytemuck::from_bytes(&self.store.as_ref()[offset..offset + RECORD_HEADER_SIZE]);
        let end = offset + RECORD_HEADER_SIZE + header.capacity as usize;
        let length_ok = matches!(header.length, MOVED | DELETED) || header.length <= header.capacity;
        if !length_ok || end > self.header().next_offset as usize {
            return Err(DurableMapError::Corrupted(format!(
                "record {id} (capacity {}, length {}) overflows the storage",
                header.capacity, header.length
            )));
        }
        Ok(header)
    }

    fn record_header_mut(&mut self, id: u64) -> &mut RecordHeader {
        let offset = offset_of(id);
        bytemuck::from_bytes_mut(&mut self.store.as_mut()[offset..offset + RECORD_HEADER_SIZE])
    }

    fn payload(&self, id: u64, len: usize) -> &[u8] {
        let start = offset_of(id) + RECORD_HEADER_SIZE;
        &self.store.as_ref()[start..start + len]
    }

    fn payload_mut(&mut self, id: u64, len: usize) -> &mut [u8] {
        let start = offset_of(id) + RECORD_HEADER_SIZE;
        &mut self.store.as_mut()[start..start + len]
    }

    /// Follows redirects from `id` to the record that holds the bytes
    fn resolve(&self, id: u64) -> Result<(u64, RecordHeader)> {
        let mut current = id;
        for _ in 0..MAX_REDIRECTS {
            let header = self.record_header(current)?;
            match header.length {
                MOVED => current = header.redirect_to as u64,
                DELETED => {
                    return Err(DurableMapError::Corrupted(format!(
                        "record {id} is deleted"
                    )));
                }
                _ => return Ok((current, header)),
            }
        }
        Err(DurableMapError::Corrupted(format!(
            "record {id} redirects more than {MAX_REDIRECTS} times"
        )))
    }

    fn allocate(&mut self, capacity: usize) -> Result<u64> {
        let offset = self.header().next_offset as usize;
        let total = align_up(RECORD_HEADER_SIZE + capacity);
        self.store.ensure_len(offset + total)?;
        let id = (offset / ALIGNMENT) as u64;
        *self.record_header_mut(id) = RecordHeader {
            capacity: capacity as u32,
            length: 0,
            redirect_to: 0,
            _pad: 0,
        };
        let header = self.header_mut();
        header.next_offset += total as u64;
        header.records_allocated += 1;
        Ok(id)
    }

    /// Abandons `old` after its content went to `new`
    fn retire(&mut self, old: u64, new: u64, leave_redirect: bool) {
        let record = self.record_header_mut(old);
        if leave_redirect {
            record.length = MOVED;
            record.redirect_to = u32::try_from(new)
                .unwrap_or_else(|_| panic!("record id {new} doesn't fit a redirect"));
            self.header_mut().records_relocated += 1;
        } else {
            record.length = DELETED;
            self.header_mut().records_deleted += 1;
        }
    }
}

/// Storage of variable-size binary records addressed by `u64` ids.
///
/// A record keeps some spare capacity (see [`AllocationStrategy`]): rewrites and appends that
/// fit are done in place and keep the id, bigger ones relocate the record to a new id.
/// The old record then either redirects to the new one or is marked deleted.
pub struct BlobStorage<BS: ByteStore> {
    blobs: RwLock<Blobs<BS>>,
    strategy: AllocationStrategy,
    max_payload: usize,
}

impl BlobStorage<VecStore> {
    pub fn in_memory(strategy: AllocationStrategy, max_payload: usize) -> Result<Self> {
        let blobs = Blobs::create(VecStore::new())?;
        Ok(Self::new(blobs, strategy, max_payload))
    }
}

impl BlobStorage<MMapFile> {
    pub fn open(
        path: impl AsRef<Path>,
        initial_size: usize,
        strategy: AllocationStrategy,
        max_payload: usize,
    ) -> Result<Self> {
        let (store, created) = MMapFile::open_or_create(path, initial_size.max(HEADER_SIZE))?;
        let blobs = if created {
            Blobs::create(store)?
        } else {
            Blobs::load(store)?
        };
        Ok(Self::new(blobs, strategy, max_payload))
    }
}

impl<BS: ByteStore> BlobStorage<BS> {
    fn new(blobs: Blobs<BS>, strategy: AllocationStrategy, max_payload: usize) -> Self {
        Self {
            blobs: RwLock::new(blobs),
            strategy,
            max_payload: max_payload.min(MAX_CAPACITY),
        }
    }

    pub fn max_payload_supported(&self) -> usize {
        self.max_payload
    }

    fn check_payload(&self, size: usize) {
        assert!(
            size <= self.max_payload,
            "payload of {size} bytes exceeds the max supported {}",
            self.max_payload
        );
    }

    /// Runs `reader` over the payload of record `id`, following redirects
    pub fn read_record<T>(&self, id: u64, reader: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        let blobs = self.blobs.read();
        let (actual, header) = blobs.resolve(id)?;
        reader(blobs.payload(actual, header.length as usize))
    }

    /// Writes a `size`-byte payload into record `id`, or into a new record if `id` is [`NULL_ID`].
    /// Returns the id the payload ended up at.
    pub fn write_to_record(
        &self,
        id: u64,
        size: usize,
        leave_redirect: bool,
        writer: impl FnOnce(&mut [u8]),
    ) -> Result<u64> {
        self.check_payload(size);
        let mut blobs = self.blobs.write();

        if id != NULL_ID {
            let (actual, header) = blobs.resolve(id)?;
            if size <= header.capacity as usize {
                writer(blobs.payload_mut(actual, size));
                blobs.record_header_mut(actual).length = size as u32;
                return Ok(actual);
            }
            let new_id = blobs.allocate(self.strategy.capacity_for(size, self.max_payload))?;
            writer(blobs.payload_mut(new_id, size));
            blobs.record_header_mut(new_id).length = size as u32;
            blobs.retire(actual, new_id, leave_redirect);
            tracing::debug!(from = actual, to = new_id, size, "relocated record");
            return Ok(new_id);
        }

        let new_id = blobs.allocate(self.strategy.capacity_for(size, self.max_payload))?;
        writer(blobs.payload_mut(new_id, size));
        blobs.record_header_mut(new_id).length = size as u32;
        Ok(new_id)
    }

    /// Appends `extra` bytes, produced by `writer`, to the payload of record `id`.
    /// Returns the id the grown payload ended up at.
    pub fn append_to_record(
        &self,
        id: u64,
        extra: usize,
        leave_redirect: bool,
        writer: impl FnOnce(&mut [u8]),
    ) -> Result<u64> {
        let mut blobs = self.blobs.write();
        let (actual, header) = blobs.resolve(id)?;
        let old_len = header.length as usize;
        let new_len = old_len + extra;
        self.check_payload(new_len);

        if new_len <= header.capacity as usize {
            writer(&mut blobs.payload_mut(actual, new_len)[old_len..]);
            blobs.record_header_mut(actual).length = new_len as u32;
            return Ok(actual);
        }

        let new_id = blobs.allocate(self.strategy.capacity_for(new_len, self.max_payload))?;
        let old_payload = blobs.payload(actual, old_len).to_vec();
        let payload = blobs.payload_mut(new_id, new_len);
        payload[..old_len].copy_from_slice(&old_payload);
        writer(&mut payload[old_len..]);
        blobs.record_header_mut(new_id).length = new_len as u32;
        blobs.retire(actual, new_id, leave_redirect);
        tracing::debug!(from = actual, to = new_id, new_len, "relocated record on append");
        Ok(new_id)
    }

    pub fn delete_record(&self, id: u64) -> Result<()> {
        let mut blobs = self.blobs.write();
        let (actual, _) = blobs.resolve(id)?;
        blobs.record_header_mut(actual).length = DELETED;
        blobs.header_mut().records_deleted += 1;
        Ok(())
    }

    /// True if `id` resolves to a record that isn't deleted
    pub fn has_record(&self, id: u64) -> bool {
        self.blobs.read().resolve(id).is_ok()
    }

    /// Records neither relocated nor deleted
    pub fn live_records_count(&self) -> u64 {
        let blobs = self.blobs.read();
        let header = blobs.header();
        header.records_allocated - header.records_relocated - header.records_deleted
    }

    pub fn records_allocated(&self) -> u64 {
        self.blobs.read().header().records_allocated
    }

    pub fn records_relocated(&self) -> u64 {
        self.blobs.read().header().records_relocated
    }

    pub fn records_deleted(&self) -> u64 {
        self.blobs.read().header().records_deleted
    }

    pub fn force(&self) -> Result<()> {
        Ok(self.blobs.read().store.flush()?)
    }

    pub fn close(self) -> Result<()> {
        self.force()
    }

    pub fn close_and_clean(self) -> Result<()> {
        Ok(self.blobs.into_inner().store.remove_backing()?)
    }
}
