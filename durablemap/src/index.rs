use std::io;
use std::mem::size_of;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;

use crate::byte_store::{ByteStore, MMapFile, VecStore};
use crate::error::{DurableMapError, Result};
use crate::types::NO_VALUE;

const MAGIC_WORD: u32 = u32::from_le_bytes(*b"IMMI");
const IMPLEMENTATION_VERSION: u32 = 1;
const HEADER_SIZE: usize = size_of::<IndexHeader>();
const MIN_CAPACITY: usize = 16;
/// Max share of non-free slots (alive + tombstones) before the table is rebuilt
const MAX_LOAD_FACTOR: f64 = 0.5;

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C)]
struct IndexHeader {
    magic: u32,
    version: u32,
    capacity: u32,
    alive: u32,
    tombstones: u32,
    _reserved: [u32; 3],
}

/// Table slots convention:
/// `(NO_VALUE, NO_VALUE)` is a free slot, `(NO_VALUE, v)` is a tombstone
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq, Eq)]
#[repr(C)]
struct Slot {
    key: i32,
    value: i32,
}

impl Slot {
    const FREE: Slot = Slot {
        key: NO_VALUE,
        value: NO_VALUE,
    };

    fn is_free(&self) -> bool {
        self.key == NO_VALUE && self.value == NO_VALUE
    }

    fn is_alive(&self) -> bool {
        self.key != NO_VALUE
    }
}

struct Table<BS: ByteStore> {
    store: BS,
}

impl<BS: ByteStore> Table<BS> {
    fn create(mut store: BS, capacity: usize) -> io::Result<Self> {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        store.ensure_len(HEADER_SIZE + capacity * size_of::<Slot>())?;
        let mut table = Self { store };
        *table.header_mut() = IndexHeader {
            magic: MAGIC_WORD,
            version: IMPLEMENTATION_VERSION,
            capacity: capacity as u32,
            alive: 0,
            tombstones: 0,
            _reserved: [0; 3],
        };
        table.slots_mut().fill(Slot::FREE);
        Ok(table)
    }

    fn load(store: BS) -> Result<Self> {
        if store.len() < HEADER_SIZE {
            return Err(DurableMapError::Corrupted(format!(
                "index is {} bytes, shorter than its header",
                store.len()
            )));
        }
        let table = Self { store };
        let header = table.header();
        if header.magic != MAGIC_WORD {
            return Err(DurableMapError::Corrupted(format!(
                "index magic word {:#x} != {:#x}",
                header.magic, MAGIC_WORD
            )));
        }
        if header.version != IMPLEMENTATION_VERSION {
            return Err(DurableMapError::Corrupted(format!(
                "index version {} is not supported (expected {})",
                header.version, IMPLEMENTATION_VERSION
            )));
        }
        let capacity = header.capacity as usize;
        if !capacity.is_power_of_two()
            || table.store.len() < HEADER_SIZE + capacity * size_of::<Slot>()
        {
            return Err(DurableMapError::Corrupted(format!(
                "index capacity {capacity} doesn't fit the file of {} bytes",
                table.store.len()
            )));
        }
        Ok(table)
    }

    fn header(&self) -> &IndexHeader {
        bytemuck::from_bytes(&self.store.as_ref()[..HEADER_SIZE])
    }

    fn header_mut(&mut self) -> &mut IndexHeader {
        bytemuck::from_bytes_mut(&mut self.store.as_mut()[..HEADER_SIZE])
    }

    fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    fn slots(&self) -> &[Slot] {
        let end = HEADER_SIZE + self.capacity() * size_of::<Slot>();
        bytemuck::cast_slice(&self.store.as_ref()[HEADER_SIZE..end])
    }

    fn slots_mut(&mut self) -> &mut [Slot] {
        let end = HEADER_SIZE + self.capacity() * size_of::<Slot>();
        bytemuck::cast_slice_mut(&mut self.store.as_mut()[HEADER_SIZE..end])
    }

    /// Slot sequence for `key`: every slot index, starting from the key's home slot
    fn slots_for(&self, key: i32) -> impl Iterator<Item = usize> {
        let capacity = self.capacity();
        let start = (key as u32).wrapping_mul(0x9E37_79B9) as usize & (capacity - 1);
        (0..capacity).map(move |step| (start + step) & (capacity - 1))
    }

    fn lookup(&self, key: i32, mut accept: impl FnMut(i32) -> Result<bool>) -> Result<i32> {
        let slots = self.slots();
        for idx in self.slots_for(key) {
            let slot = slots[idx];
            if slot.key == key {
                if accept(slot.value)? {
                    return Ok(slot.value);
                }
            } else if slot.is_free() {
                break;
            }
        }
        Ok(NO_VALUE)
    }

    fn find(&self, key: i32, value: i32) -> Option<usize> {
        let slots = self.slots();
        for idx in self.slots_for(key) {
            let slot = slots[idx];
            if slot.key == key && slot.value == value {
                return Some(idx);
            }
            if slot.is_free() {
                return None;
            }
        }
        None
    }

    fn put(&mut self, key: i32, value: i32) -> io::Result<bool> {
        if self.find(key, value).is_some() {
            return Ok(false);
        }
        self.reserve_one()?;

        let mut first_tombstone = None;
        let mut insert_at = None;
        for idx in self.slots_for(key) {
            let slot = self.slots()[idx];
            if slot.is_free() {
                insert_at = Some(first_tombstone.unwrap_or(idx));
                break;
            }
            if !slot.is_alive() && first_tombstone.is_none() {
                first_tombstone = Some(idx);
            }
        }
        // reserve_one() keeps at least half of the table free, so a slot always exists
        let idx = insert_at.or(first_tombstone).ok_or_else(|| {
            io::Error::other(format!("index table is full (capacity {})", self.capacity()))
        })?;

        let reused_tombstone = !self.slots()[idx].is_free();
        self.slots_mut()[idx] = Slot { key, value };
        let header = self.header_mut();
        header.alive += 1;
        if reused_tombstone {
            header.tombstones -= 1;
        }
        Ok(true)
    }

    fn remove(&mut self, key: i32, value: i32) -> bool {
        match self.find(key, value) {
            Some(idx) => {
                self.mark_deleted(idx);
                true
            }
            None => false,
        }
    }

    fn replace(&mut self, key: i32, old_value: i32, new_value: i32) -> bool {
        let old_idx = match self.find(key, old_value) {
            Some(idx) => idx,
            None => return false,
        };
        if self.find(key, new_value).is_some() {
            // the value set must stay a set: new value is already there, just drop the old one
            self.mark_deleted(old_idx);
        } else {
            self.slots_mut()[old_idx] = Slot {
                key,
                value: new_value,
            };
        }
        true
    }

    fn mark_deleted(&mut self, idx: usize) {
        // keep the value: (NO_VALUE, value) is the tombstone marker
        self.slots_mut()[idx].key = NO_VALUE;
        let header = self.header_mut();
        header.alive -= 1;
        header.tombstones += 1;
    }

    /// Makes room for one more entry, rebuilding the table if it gets too loaded
    fn reserve_one(&mut self) -> io::Result<()> {
        let header = *self.header();
        let used = (header.alive + header.tombstones + 1) as f64;
        if used <= self.capacity() as f64 * MAX_LOAD_FACTOR {
            return Ok(());
        }
        let wanted = ((header.alive + 1) as f64 / MAX_LOAD_FACTOR * 2.0) as usize;
        self.rebuild(wanted.max(self.capacity()))
    }

    /// Re-inserts every alive entry into a table of (at least) `capacity` slots, dropping tombstones
    fn rebuild(&mut self, capacity: usize) -> io::Result<()> {
        let alive: Vec<Slot> = self.slots().iter().copied().filter(Slot::is_alive).collect();
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        tracing::debug!(
            old_capacity = self.capacity(),
            new_capacity = capacity,
            alive = alive.len(),
            "rebuilding index table"
        );

        self.store
            .ensure_len(HEADER_SIZE + capacity * size_of::<Slot>())?;
        let header = self.header_mut();
        header.capacity = capacity as u32;
        header.alive = 0;
        header.tombstones = 0;
        self.slots_mut().fill(Slot::FREE);

        for slot in alive {
            let idx = self
                .slots_for(slot.key)
                .find(|&idx| self.slots()[idx].is_free())
                .ok_or_else(|| io::Error::other("index table is full during rebuild"))?;
            self.slots_mut()[idx] = slot;
            self.header_mut().alive += 1;
        }
        Ok(())
    }
}

/// Durable multimap `i32 -> {i32}`, an open-addressing hash table laid over a [`ByteStore`].
///
/// Keys are (adjusted) hashes, values are stored ids; a key may carry several values,
/// and callers resolve which one they need through the `lookup` predicate.
/// [`NO_VALUE`] is reserved and never accepted as a key or a value.
///
/// Thread-safe: guarded by its own lock, lookups run concurrently, mutations are exclusive.
pub struct IntToMultiIntMap<BS: ByteStore> {
    table: RwLock<Table<BS>>,
}

impl IntToMultiIntMap<VecStore> {
    pub fn in_memory(initial_capacity: usize) -> Result<Self> {
        let table = Table::create(VecStore::new(), initial_capacity)?;
        Ok(Self {
            table: RwLock::new(table),
        })
    }
}

impl IntToMultiIntMap<MMapFile> {
    /// Opens the index stored at `path`, or creates an empty one
    pub fn open(path: impl AsRef<Path>, initial_capacity: usize) -> Result<Self> {
        let capacity = initial_capacity.max(MIN_CAPACITY).next_power_of_two();
        let (store, created) =
            MMapFile::open_or_create(path, HEADER_SIZE + capacity * size_of::<Slot>())?;
        let table = if created {
            Table::create(store, capacity)?
        } else {
            Table::load(store)?
        };
        Ok(Self {
            table: RwLock::new(table),
        })
    }
}

fn check_not_no_value(name: &str, value: i32) {
    assert!(value != NO_VALUE, "{name} must not be NO_VALUE({NO_VALUE})");
}

impl<BS: ByteStore> IntToMultiIntMap<BS> {
    /// Wraps an existing store: an empty store gets a fresh table, otherwise the table is loaded
    pub fn with_store(store: BS, initial_capacity: usize) -> Result<Self> {
        let table = if store.is_empty() {
            Table::create(store, initial_capacity)?
        } else {
            Table::load(store)?
        };
        Ok(Self {
            table: RwLock::new(table),
        })
    }

    /// Returns the first value of `key` the predicate accepts, or [`NO_VALUE`]
    pub fn lookup(&self, key: i32, accept: impl FnMut(i32) -> Result<bool>) -> Result<i32> {
        check_not_no_value("key", key);
        self.table.read().lookup(key, accept)
    }

    pub fn has(&self, key: i32, value: i32) -> bool {
        check_not_no_value("key", key);
        check_not_no_value("value", value);
        self.table.read().find(key, value).is_some()
    }

    /// Adds `value` to the values of `key`, returns false if it was already there
    pub fn put(&self, key: i32, value: i32) -> Result<bool> {
        check_not_no_value("key", key);
        check_not_no_value("value", value);
        Ok(self.table.write().put(key, value)?)
    }

    pub fn remove(&self, key: i32, value: i32) -> bool {
        check_not_no_value("key", key);
        check_not_no_value("value", value);
        self.table.write().remove(key, value)
    }

    /// Replaces `old_value` with `new_value` among the values of `key`.
    /// Returns false (and changes nothing) if `old_value` isn't there.
    pub fn replace(&self, key: i32, old_value: i32, new_value: i32) -> bool {
        check_not_no_value("key", key);
        check_not_no_value("old_value", old_value);
        check_not_no_value("new_value", new_value);
        self.table.write().replace(key, old_value, new_value)
    }

    /// Visits every (key, value) pair in table order.
    /// Returns false if the visitor stopped the iteration early.
    pub fn for_each(&self, mut visitor: impl FnMut(i32, i32) -> Result<bool>) -> Result<bool> {
        let table = self.table.read();
        for slot in table.slots().iter().filter(|s| s.is_alive()) {
            if !visitor(slot.key, slot.value)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn size(&self) -> usize {
        self.table.read().header().alive as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.table.read().capacity()
    }

    pub fn flush(&self) -> Result<()> {
        Ok(self.table.read().store.flush()?)
    }

    pub fn close(self) -> Result<()> {
        self.flush()
    }

    pub fn close_and_clean(self) -> Result<()> {
        Ok(self.table.into_inner().store.remove_backing()?)
    }
}
