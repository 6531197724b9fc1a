use std::mem::size_of;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;

use crate::byte_store::{ByteStore, MMapFile, VecStore};
use crate::error::{DurableMapError, Result};

pub const NULL_CHUNK_ID: u64 = 0;

const MAGIC_WORD: u32 = u32::from_le_bytes(*b"CLOG");
const IMPLEMENTATION_VERSION: u32 = 1;
const HEADER_SIZE: usize = size_of::<LogHeader>();
const CHUNK_HEADER_SIZE: usize = 8;
const NEXT_ID_SIZE: usize = 8;
const ALIGNMENT: usize = 8;

/// Set in the capacity word of chunks that reserve a `next_chunk_id` field
const HAS_NEXT_FLAG: u32 = 1 << 31;
pub const MAX_CHUNK_CAPACITY: usize = (HAS_NEXT_FLAG - 1) as usize;

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C)]
struct LogHeader {
    magic: u32,
    version: u32,
    next_offset: u64,
    chunks_count: u64,
    _reserved: u64,
}

#[derive(Clone, Copy, Debug)]
struct ChunkLayout {
    offset: usize,
    capacity: usize,
    used: usize,
    has_next_field: bool,
}

impl ChunkLayout {
    fn payload_start(&self) -> usize {
        self.offset + CHUNK_HEADER_SIZE + if self.has_next_field { NEXT_ID_SIZE } else { 0 }
    }
}

struct Chunks<BS: ByteStore> {
    store: BS,
}

impl<BS: ByteStore> Chunks<BS> {
    fn create(mut store: BS) -> Result<Self> {
        store.ensure_len(HEADER_SIZE)?;
        let mut chunks = Self { store };
        *chunks.header_mut() = LogHeader {
            magic: MAGIC_WORD,
            version: IMPLEMENTATION_VERSION,
            next_offset: HEADER_SIZE as u64,
            chunks_count: 0,
            _reserved: 0,
        };
        Ok(chunks)
    }

    fn load(store: BS) -> Result<Self> {
        if store.len() < HEADER_SIZE {
            return Err(DurableMapError::Corrupted(format!(
                "chunked log is {} bytes, shorter than its header",
                store.len()
            )));
        }
        let chunks = Self { store };
        let header = chunks.header();
        if header.magic != MAGIC_WORD || header.version != IMPLEMENTATION_VERSION {
            return Err(DurableMapError::Corrupted(format!(
                "unexpected chunked log magic/version: {:#x}/{}",
                header.magic, header.version
            )));
        }
        if header.next_offset as usize > chunks.store.len() {
            return Err(DurableMapError::Corrupted(format!(
                "chunked log claims {} bytes, file has {}",
                header.next_offset,
                chunks.store.len()
            )));
        }
        Ok(chunks)
    }

    fn header(&self) -> &LogHeader {
        bytemuck::from_bytes(&self.store.as_ref()[..HEADER_SIZE])
    }

    fn header_mut(&mut self) -> &mut LogHeader {
        bytemuck::from_bytes_mut(&mut self.store.as_mut()[..HEADER_SIZE])
    }

    fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.store.as_ref()[at..at + 4].try_into().unwrap_or_default())
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.store.as_mut()[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(&self, at: usize) -> u64 {
        u64::from_le_bytes(self.store.as_ref()[at..at + 8].try_into().unwrap_or_default())
    }

    fn write_u64(&mut self, at: usize, value: u64) {
        self.store.as_mut()[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn layout(&self, id: u64) -> Result<ChunkLayout> {
        let offset = id as usize * ALIGNMENT;
        let end = self.header().next_offset as usize;
        if id == NULL_CHUNK_ID || offset < HEADER_SIZE || offset + CHUNK_HEADER_SIZE > end {
            return Err(DurableMapError::Corrupted(format!(
                "chunk id {id} is outside of the log"
            )));
        }
        let raw_capacity = self.read_u32(offset);
        let layout = ChunkLayout {
            offset,
            capacity: (raw_capacity & !HAS_NEXT_FLAG) as usize,
            used: self.read_u32(offset + 4) as usize,
            has_next_field: raw_capacity & HAS_NEXT_FLAG != 0,
        };
        if layout.used > layout.capacity || layout.payload_start() + layout.capacity > end {
            return Err(DurableMapError::Corrupted(format!(
                "chunk {id} (capacity {}, used {}) overflows the log",
                layout.capacity, layout.used
            )));
        }
        Ok(layout)
    }
}

/// Append-only log of chunks: fixed-capacity byte containers that are filled by appends
/// and never shrink or move.
///
/// A chunk may reserve a `next_chunk_id` field, which lets callers chain chunks into lists
/// that grow without rewriting what is already stored.
pub struct ChunkedLog<BS: ByteStore> {
    chunks: RwLock<Chunks<BS>>,
}

impl ChunkedLog<VecStore> {
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            chunks: RwLock::new(Chunks::create(VecStore::new())?),
        })
    }
}

impl ChunkedLog<MMapFile> {
    pub fn open(path: impl AsRef<Path>, initial_size: usize) -> Result<Self> {
        let (store, created) = MMapFile::open_or_create(path, initial_size.max(HEADER_SIZE))?;
        let chunks = if created {
            Chunks::create(store)?
        } else {
            Chunks::load(store)?
        };
        Ok(Self {
            chunks: RwLock::new(chunks),
        })
    }
}

impl<BS: ByteStore> ChunkedLog<BS> {
    /// Allocates an empty chunk able to hold `capacity` payload bytes
    pub fn append(&self, capacity: usize, reserve_next_chunk_id: bool) -> Result<LogChunk<'_, BS>> {
        assert!(
            capacity <= MAX_CHUNK_CAPACITY,
            "chunk capacity {capacity} exceeds the max {MAX_CHUNK_CAPACITY}"
        );
        let mut chunks = self.chunks.write();
        let offset = chunks.header().next_offset as usize;
        let next_field = if reserve_next_chunk_id { NEXT_ID_SIZE } else { 0 };
        let total = (CHUNK_HEADER_SIZE + next_field + capacity).next_multiple_of(ALIGNMENT);
        chunks.store.ensure_len(offset + total)?;

        let flag = if reserve_next_chunk_id { HAS_NEXT_FLAG } else { 0 };
        chunks.write_u32(offset, capacity as u32 | flag);
        chunks.write_u32(offset + 4, 0);
        if reserve_next_chunk_id {
            chunks.write_u64(offset + CHUNK_HEADER_SIZE, NULL_CHUNK_ID);
        }
        let header = chunks.header_mut();
        header.next_offset += total as u64;
        header.chunks_count += 1;

        Ok(LogChunk {
            log: self,
            id: (offset / ALIGNMENT) as u64,
            capacity,
            has_next_field: reserve_next_chunk_id,
        })
    }

    pub fn read(&self, id: u64) -> Result<LogChunk<'_, BS>> {
        let layout = self.chunks.read().layout(id)?;
        Ok(LogChunk {
            log: self,
            id,
            capacity: layout.capacity,
            has_next_field: layout.has_next_field,
        })
    }

    pub fn chunks_count(&self) -> u64 {
        self.chunks.read().header().chunks_count
    }

    pub fn force(&self) -> Result<()> {
        Ok(self.chunks.read().store.flush()?)
    }

    pub fn close(self) -> Result<()> {
        self.force()
    }

    pub fn close_and_clean(self) -> Result<()> {
        Ok(self.chunks.into_inner().store.remove_backing()?)
    }
}

/// Handle to one chunk of a [`ChunkedLog`]
pub struct LogChunk<'a, BS: ByteStore> {
    log: &'a ChunkedLog<BS>,
    id: u64,
    capacity: usize,
    has_next_field: bool,
}

impl<BS: ByteStore> LogChunk<'_, BS> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> Result<usize> {
        let layout = self.log.chunks.read().layout(self.id)?;
        Ok(layout.capacity - layout.used)
    }

    /// Runs `reader` over the bytes appended so far
    pub fn read<T>(&self, reader: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        let chunks = self.log.chunks.read();
        let layout = chunks.layout(self.id)?;
        let start = layout.payload_start();
        reader(&chunks.store.as_ref()[start..start + layout.used])
    }

    /// Appends `size` bytes produced by `writer`.
    /// Returns false, writing nothing, if the chunk doesn't have `size` bytes left.
    pub fn append(&self, size: usize, writer: impl FnOnce(&mut [u8])) -> Result<bool> {
        let mut chunks = self.log.chunks.write();
        let layout = chunks.layout(self.id)?;
        if layout.used + size > layout.capacity {
            return Ok(false);
        }
        let start = layout.payload_start() + layout.used;
        writer(&mut chunks.store.as_mut()[start..start + size]);
        chunks.write_u32(layout.offset + 4, (layout.used + size) as u32);
        Ok(true)
    }

    pub fn next_chunk_id(&self) -> Result<Option<u64>> {
        if !self.has_next_field {
            return Ok(None);
        }
        let chunks = self.log.chunks.read();
        let layout = chunks.layout(self.id)?;
        let next = chunks.read_u64(layout.offset + CHUNK_HEADER_SIZE);
        Ok((next != NULL_CHUNK_ID).then_some(next))
    }

    /// Links this chunk to `next`; the link can be set only once
    pub fn set_next_chunk_id(&self, next: u64) -> Result<()> {
        assert!(
            self.has_next_field,
            "chunk {} has no next_chunk_id field reserved",
            self.id
        );
        assert!(next != NULL_CHUNK_ID, "can't link chunk {} to the null chunk", self.id);
        let mut chunks = self.log.chunks.write();
        let layout = chunks.layout(self.id)?;
        let at = layout.offset + CHUNK_HEADER_SIZE;
        let current = chunks.read_u64(at);
        assert!(
            current == NULL_CHUNK_ID,
            "chunk {} already links to {current}",
            self.id
        );
        chunks.write_u64(at, next);
        Ok(())
    }
}
