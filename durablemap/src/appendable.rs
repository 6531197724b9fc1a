use std::hash::Hash;
use std::marker::PhantomData;
use std::path::Path;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::byte_store::{ByteStore, MMapFile, VecStore};
use crate::chunked_log::ChunkedLog;
use crate::compaction::{compaction_score, Compactable};
use crate::config::DurableMapConfig;
use crate::error::{close_all, DurableMapError, Result};
use crate::index::IntToMultiIntMap;
use crate::record::{
    from_stored_id, item_header, parse_items, to_stored_id, write_key, EntryView, ITEM_HEADER_SIZE,
    KEY_HEADER_SIZE,
};
use crate::types::{adjust_hash, DataExternalizer, KeyDescriptor, NO_VALUE};

const CHUNKS_FILE: &str = "chunks.bin";
const INDEX_FILE: &str = "index.bin";

/// Small sets fit in the first chunk, larger ones amortize chunk allocation
const MIN_FIRST_CHUNK_CAPACITY: usize = 512;

/// Durable map from a key to a set of items, which grows by appending.
///
/// The set of a key is a chain of chunks in a [`ChunkedLog`]. The first chunk starts
/// with `[header][key]`, then every chunk holds `[itemSize][itemBytes]` elements in
/// append order. Appending an item costs the size of the item, the set is never rewritten.
/// Removing one appends a removal marker (the top bit of `itemSize`).
pub struct AppendableValuesMap<K, V, BS = MMapFile>
where
    K: KeyDescriptor,
    V: DataExternalizer,
    BS: ByteStore,
{
    index: IntToMultiIntMap<BS>,
    chunks: ChunkedLog<BS>,
    write_lock: Mutex<()>,
    config: DurableMapConfig,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: KeyDescriptor, V: DataExternalizer> AppendableValuesMap<K, V, MMapFile> {
    pub fn open(dir: impl AsRef<Path>, config: DurableMapConfig) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let chunks = ChunkedLog::open(dir.join(CHUNKS_FILE), config.storage_initial_size)?;
        let index = IntToMultiIntMap::open(dir.join(INDEX_FILE), config.index_initial_capacity)?;
        tracing::debug!(dir = %dir.display(), keys = index.size(), "opened appendable values map");
        Ok(Self::from_parts(index, chunks, config))
    }
}

impl<K: KeyDescriptor, V: DataExternalizer> AppendableValuesMap<K, V, VecStore> {
    pub fn in_memory(config: DurableMapConfig) -> Result<Self> {
        let chunks = ChunkedLog::in_memory()?;
        let index = IntToMultiIntMap::in_memory(config.index_initial_capacity)?;
        Ok(Self::from_parts(index, chunks, config))
    }
}

impl<K, V, BS> AppendableValuesMap<K, V, BS>
where
    K: KeyDescriptor,
    V: DataExternalizer,
    BS: ByteStore,
{
    pub fn from_parts(
        index: IntToMultiIntMap<BS>,
        chunks: ChunkedLog<BS>,
        config: DurableMapConfig,
    ) -> Self {
        Self {
            index,
            chunks,
            write_lock: Mutex::new(()),
            config,
            _marker: PhantomData,
        }
    }

    fn hash(key: &K::Item) -> i32 {
        adjust_hash(K::hash_code(key))
    }

    fn find(&self, hash: i32, key: &K::Item) -> Result<i32> {
        self.index.lookup(hash, |stored| {
            self.chunks.read(from_stored_id(stored)?)?.read(|bytes| {
                let entry = EntryView::parse(bytes)?;
                Ok(!entry.is_value_void() && entry.key_matches::<K>(key)?)
            })
        })
    }

    pub fn contains_mapping(&self, key: &K::Item) -> Result<bool> {
        Ok(self.find(Self::hash(key), key)? != NO_VALUE)
    }

    /// Cursor over the set of `key`, `None` if the key has no set
    pub fn items(&self, key: &K::Item) -> Result<Option<Items<'_, K, V, BS>>> {
        let hash = Self::hash(key);
        let stored = self.find(hash, key)?;
        if stored == NO_VALUE {
            return Ok(None);
        }
        let first_chunk_id = from_stored_id(stored)?;
        Ok(Some(Items {
            map: self,
            hash,
            first_chunk_id,
            tail_chunk_id: first_chunk_id,
        }))
    }

    /// Replaces the set of `key` with `values`; `None` removes the key
    pub fn put(&self, key: &K::Item, values: Option<&FxHashSet<V::Item>>) -> Result<()> {
        match values {
            Some(values) => {
                let encoded: Vec<Vec<u8>> = values.iter().map(V::to_bytes).collect();
                self.put_encoded(key, &encoded)
            }
            None => self.remove(key),
        }
    }

    pub fn remove(&self, key: &K::Item) -> Result<()> {
        let _guard = self.write_lock.lock();
        let hash = Self::hash(key);
        let existing = self.find(hash, key)?;
        if existing == NO_VALUE {
            return Ok(());
        }
        let head_size = KEY_HEADER_SIZE + K::encoded_size(key);
        let tombstone = self.chunks.append(head_size, false)?;
        tombstone.append(head_size, |buf| {
            write_key::<K>(key, true, buf);
        })?;
        self.index.remove(hash, existing);
        Ok(())
    }

    /// Writes a fresh chain holding `items` and points the index at it
    fn put_encoded(&self, key: &K::Item, items: &[Vec<u8>]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let hash = Self::hash(key);
        let existing = self.find(hash, key)?;

        let head_size = KEY_HEADER_SIZE + K::encoded_size(key);
        let first = self
            .chunks
            .append(head_size.max(MIN_FIRST_CHUNK_CAPACITY), true)?;
        first.append(head_size, |buf| {
            write_key::<K>(key, false, buf);
        })?;
        let first_id = first.id();
        let mut tail = first_id;
        for item in items {
            self.append_encoded(&mut tail, item, false)?;
        }

        let stored = to_stored_id(first_id);
        if existing == NO_VALUE {
            self.index.put(hash, stored)?;
        } else {
            self.index.replace(hash, existing, stored);
        }
        Ok(())
    }

    /// Appends one `[itemSize][itemBytes]` element to the chain whose last known chunk is `tail`.
    /// Must be called with the write lock held.
    fn append_encoded(&self, tail: &mut u64, item: &[u8], removed: bool) -> Result<()> {
        let size = ITEM_HEADER_SIZE + item.len();
        let write = |buf: &mut [u8]| {
            buf[..ITEM_HEADER_SIZE].copy_from_slice(&item_header(item.len(), removed));
            buf[ITEM_HEADER_SIZE..].copy_from_slice(item);
        };

        let mut chunk = self.chunks.read(*tail)?;
        while let Some(next) = chunk.next_chunk_id()? {
            chunk = self.chunks.read(next)?;
        }
        if !chunk.append(size, write)? {
            let next = self.chunks.append(chunk.capacity().max(size), true)?;
            next.append(size, write)?;
            // link once the element is in place, readers never see a half-written chunk
            chunk.set_next_chunk_id(next.id())?;
            tracing::trace!(from = chunk.id(), to = next.id(), "extended chunk chain");
            chunk = next;
        }
        *tail = chunk.id();
        Ok(())
    }

    /// Live item bytes of the chain starting at `first_chunk_id`, removals replayed
    fn live_items(&self, first_chunk_id: u64) -> Result<Vec<Vec<u8>>> {
        let mut elements: Vec<(Vec<u8>, bool)> = Vec::new();
        let collect = |bytes: &[u8], elements: &mut Vec<(Vec<u8>, bool)>| -> Result<()> {
            for item in parse_items(bytes)? {
                elements.push((item.bytes.to_vec(), item.removed));
            }
            Ok(())
        };

        let mut chunk = self.chunks.read(first_chunk_id)?;
        let void = chunk.read(|bytes| {
            let entry = EntryView::parse(bytes)?;
            if entry.is_value_void() {
                return Ok(true);
            }
            collect(entry.rest, &mut elements)?;
            Ok(false)
        })?;
        if void {
            return Ok(Vec::new());
        }
        while let Some(next) = chunk.next_chunk_id()? {
            chunk = self.chunks.read(next)?;
            chunk.read(|bytes| collect(bytes, &mut elements))?;
        }

        let mut live: Vec<Option<Vec<u8>>> = Vec::with_capacity(elements.len());
        for (bytes, removed) in elements {
            if removed {
                for slot in live.iter_mut() {
                    if slot.as_deref() == Some(bytes.as_slice()) {
                        *slot = None;
                    }
                }
            } else {
                live.push(Some(bytes));
            }
        }
        Ok(live.into_iter().flatten().collect())
    }

    fn chain_length(&self, first_chunk_id: u64) -> Result<u64> {
        let mut length = 1;
        let mut chunk = self.chunks.read(first_chunk_id)?;
        while let Some(next) = chunk.next_chunk_id()? {
            chunk = self.chunks.read(next)?;
            length += 1;
        }
        Ok(length)
    }

    /// Visits every key once, in no particular order, until `visitor` returns false
    pub fn process_keys(&self, mut visitor: impl FnMut(K::Item) -> bool) -> Result<bool> {
        self.index.for_each(|_, stored| {
            self.chunks.read(from_stored_id(stored)?)?.read(|bytes| {
                let entry = EntryView::parse(bytes)?;
                Ok(visitor(K::read(entry.key)?))
            })
        })
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn chunks_count(&self) -> u64 {
        self.chunks.chunks_count()
    }

    pub fn force(&self) -> Result<()> {
        self.index.flush()?;
        self.chunks.force()
    }

    pub fn is_dirty(&self) -> bool {
        false
    }

    pub fn close(self) -> Result<()> {
        let Self { index, chunks, .. } = self;
        close_all([
            (
                "index",
                Box::new(move || index.close()) as Box<dyn FnOnce() -> Result<()> + '_>,
            ),
            ("chunks", Box::new(move || chunks.close())),
        ])
    }

    pub fn close_and_unmap(self) -> Result<()> {
        let result = self.force();
        drop(self);
        result
    }

    pub fn close_and_clean(self) -> Result<()> {
        let Self { index, chunks, .. } = self;
        close_all([
            (
                "index",
                Box::new(move || index.close_and_clean()) as Box<dyn FnOnce() -> Result<()> + '_>,
            ),
            ("chunks", Box::new(move || chunks.close_and_clean())),
        ])
    }
}

impl<K, V, BS> AppendableValuesMap<K, V, BS>
where
    K: KeyDescriptor,
    V: DataExternalizer,
    V::Item: Eq + Hash,
    BS: ByteStore,
{
    pub fn get(&self, key: &K::Item) -> Result<Option<FxHashSet<V::Item>>> {
        match self.items(key)? {
            Some(items) => {
                let mut set = FxHashSet::default();
                items.for_each(|item| {
                    set.insert(item);
                })?;
                Ok(Some(set))
            }
            None => Ok(None),
        }
    }
}

impl<K, V, BS> Compactable for AppendableValuesMap<K, V, BS>
where
    K: KeyDescriptor,
    V: DataExternalizer,
    BS: ByteStore,
{
    /// Share of chunks no live chain links to
    fn compaction_score(&self) -> Result<f64> {
        let mut live = 0;
        self.index.for_each(|_, stored| {
            live += self.chain_length(from_stored_id(stored)?)?;
            Ok(true)
        })?;
        Ok(compaction_score(
            live,
            self.chunks.chunks_count(),
            &self.config.compaction,
        ))
    }

    fn compact<F>(&self, factory: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Self>,
    {
        let target = factory()?;
        self.index.for_each(|_, stored| {
            let first_chunk_id = from_stored_id(stored)?;
            let key = self
                .chunks
                .read(first_chunk_id)?
                .read(|bytes| K::read(EntryView::parse(bytes)?.key))?;
            target.put_encoded(&key, &self.live_items(first_chunk_id)?)?;
            Ok(true)
        })?;
        tracing::info!(
            keys = target.len(),
            chunks_before = self.chunks.chunks_count(),
            chunks_after = target.chunks.chunks_count(),
            "compacted appendable values map"
        );
        Ok(target)
    }
}

/// Cursor over the set of one key, bound to its chunk chain
pub struct Items<'a, K, V, BS>
where
    K: KeyDescriptor,
    V: DataExternalizer,
    BS: ByteStore,
{
    map: &'a AppendableValuesMap<K, V, BS>,
    hash: i32,
    first_chunk_id: u64,
    tail_chunk_id: u64,
}

impl<K, V, BS> Items<'_, K, V, BS>
where
    K: KeyDescriptor,
    V: DataExternalizer,
    BS: ByteStore,
{
    /// Appends `item` to the set.
    ///
    /// Fails with [`DurableMapError::KeyNotFound`] if the set was replaced by `put` or
    /// removed since this cursor was created.
    pub fn append(&mut self, item: &V::Item) -> Result<()> {
        self.append_element(&V::to_bytes(item), false)
    }

    /// Records the removal of every copy of `item` appended so far
    pub fn remove(&mut self, item: &V::Item) -> Result<()> {
        self.append_element(&V::to_bytes(item), true)
    }

    fn append_element(&mut self, item: &[u8], removed: bool) -> Result<()> {
        let _guard = self.map.write_lock.lock();
        if !self.map.index.has(self.hash, to_stored_id(self.first_chunk_id)) {
            return Err(DurableMapError::KeyNotFound);
        }
        self.map
            .append_encoded(&mut self.tail_chunk_id, item, removed)
    }

    /// Feeds the live items to `consumer`, in append order
    pub fn for_each(&self, mut consumer: impl FnMut(V::Item)) -> Result<()> {
        for bytes in self.map.live_items(self.first_chunk_id)? {
            consumer(V::read(&bytes)?);
        }
        Ok(())
    }
}
