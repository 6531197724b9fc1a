use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blob::{BlobStorage, NULL_ID};
use crate::byte_store::{ByteStore, MMapFile, VecStore};
use crate::compaction::{compaction_score, Compactable};
use crate::config::DurableMapConfig;
use crate::error::{close_all, DurableMapError, Result};
use crate::index::IntToMultiIntMap;
use crate::record::{entry_size, from_stored_id, to_stored_id, write_entry, EntryView};
use crate::types::{adjust_hash, DataExternalizer, KeyDescriptor, NO_VALUE};

const RECORDS_FILE: &str = "records.bin";
const INDEX_FILE: &str = "index.bin";

/// Decides whether two values are the same, letting `put` skip redundant writes
pub type ValueEquality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Durable map with one value per key.
///
/// Each entry is a `[header][key][value]` record in a [`BlobStorage`]; an
/// [`IntToMultiIntMap`] maps the adjusted key hash to the ids of the records
/// whose keys have that hash.
///
/// Reads run concurrently, mutations are serialized by a lock owned by the map.
/// Records are rewritten in place when the new entry fits, otherwise they move and
/// leave a redirect behind, so a reader racing with a write sees either the old or
/// the new entry.
pub struct DurableMap<K, V, BS = MMapFile>
where
    K: KeyDescriptor,
    V: DataExternalizer,
    BS: ByteStore,
{
    index: IntToMultiIntMap<BS>,
    records: BlobStorage<BS>,
    write_lock: Mutex<()>,
    value_equality: Option<ValueEquality<V::Item>>,
    config: DurableMapConfig,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: KeyDescriptor, V: DataExternalizer> DurableMap<K, V, MMapFile> {
    /// Opens the map stored in `dir`, creating it if the directory holds no map
    pub fn open(dir: impl AsRef<Path>, config: DurableMapConfig) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let records = BlobStorage::open(
            dir.join(RECORDS_FILE),
            config.storage_initial_size,
            config.allocation,
            config.max_payload,
        )?;
        let index = IntToMultiIntMap::open(dir.join(INDEX_FILE), config.index_initial_capacity)?;
        tracing::debug!(dir = %dir.display(), entries = index.size(), "opened durable map");
        Ok(Self::from_parts(index, records, config))
    }
}

impl<K: KeyDescriptor, V: DataExternalizer> DurableMap<K, V, VecStore> {
    pub fn in_memory(config: DurableMapConfig) -> Result<Self> {
        let records = BlobStorage::in_memory(config.allocation, config.max_payload)?;
        let index = IntToMultiIntMap::in_memory(config.index_initial_capacity)?;
        Ok(Self::from_parts(index, records, config))
    }
}

impl<K, V, BS> DurableMap<K, V, BS>
where
    K: KeyDescriptor,
    V: DataExternalizer,
    BS: ByteStore,
{
    pub fn from_parts(
        index: IntToMultiIntMap<BS>,
        records: BlobStorage<BS>,
        config: DurableMapConfig,
    ) -> Self {
        Self {
            index,
            records,
            write_lock: Mutex::new(()),
            value_equality: None,
            config,
            _marker: PhantomData,
        }
    }

    /// Makes `put` a no-op when the stored value is equal to the new one
    pub fn with_value_equality(
        mut self,
        equality: impl Fn(&V::Item, &V::Item) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.value_equality = Some(Arc::new(equality));
        self
    }

    pub fn config(&self) -> &DurableMapConfig {
        &self.config
    }

    fn hash(key: &K::Item) -> i32 {
        adjust_hash(K::hash_code(key))
    }

    /// Id of the index entry whose record holds `key`, or [`NO_VALUE`]
    fn find(&self, hash: i32, key: &K::Item) -> Result<i32> {
        self.index.lookup(hash, |stored| {
            self.records.read_record(from_stored_id(stored)?, |bytes| {
                let entry = EntryView::parse(bytes)?;
                Ok(!entry.is_value_void() && entry.key_matches::<K>(key)?)
            })
        })
    }

    pub fn contains_mapping(&self, key: &K::Item) -> Result<bool> {
        Ok(self.find(Self::hash(key), key)? != NO_VALUE)
    }

    pub fn get(&self, key: &K::Item) -> Result<Option<V::Item>> {
        let mut value = None;
        self.index.lookup(Self::hash(key), |stored| {
            self.records.read_record(from_stored_id(stored)?, |bytes| {
                let entry = EntryView::parse(bytes)?;
                if entry.is_value_void() || !entry.key_matches::<K>(key)? {
                    return Ok(false);
                }
                value = Some(V::read(entry.rest)?);
                Ok(true)
            })
        })?;
        Ok(value)
    }

    /// Maps `key` to `value`; `None` removes the mapping
    pub fn put(&self, key: &K::Item, value: Option<&V::Item>) -> Result<()> {
        let _guard = self.write_lock.lock();
        let hash = Self::hash(key);

        let mut same_value = false;
        let existing = self.index.lookup(hash, |stored| {
            self.records.read_record(from_stored_id(stored)?, |bytes| {
                let entry = EntryView::parse(bytes)?;
                if entry.is_value_void() || !entry.key_matches::<K>(key)? {
                    return Ok(false);
                }
                if let (Some(equality), Some(new_value)) = (&self.value_equality, value) {
                    same_value = equality(&V::read(entry.rest)?, new_value);
                }
                Ok(true)
            })
        })?;
        if same_value {
            return Ok(());
        }

        let size = entry_size::<K, V>(key, value);
        let write = |buf: &mut [u8]| write_entry::<K, V>(key, value, buf);
        match (existing, value) {
            (NO_VALUE, None) => {}
            (NO_VALUE, Some(_)) => {
                let id = self.records.write_to_record(NULL_ID, size, true, write)?;
                self.index.put(hash, to_stored_id(id))?;
            }
            (stored, None) => {
                // key-only record always fits in place
                self.records
                    .write_to_record(from_stored_id(stored)?, size, true, write)?;
                self.index.remove(hash, stored);
            }
            (stored, Some(_)) => {
                let id = self
                    .records
                    .write_to_record(from_stored_id(stored)?, size, true, write)?;
                let new_stored = to_stored_id(id);
                if new_stored != stored {
                    self.index.replace(hash, stored, new_stored);
                }
            }
        }
        Ok(())
    }

    pub fn remove(&self, key: &K::Item) -> Result<()> {
        self.put(key, None)
    }

    /// Appends `size` bytes produced by `writer` to the stored value of `key`.
    ///
    /// Grows the record in place when it has room, which saves rewriting the whole value.
    /// Fails with [`DurableMapError::KeyNotFound`] if `key` has no value.
    pub fn append(
        &self,
        key: &K::Item,
        size: usize,
        writer: impl FnOnce(&mut [u8]),
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let hash = Self::hash(key);
        let stored = self.find(hash, key)?;
        if stored == NO_VALUE {
            return Err(DurableMapError::KeyNotFound);
        }
        let id = self
            .records
            .append_to_record(from_stored_id(stored)?, size, true, writer)?;
        let new_stored = to_stored_id(id);
        if new_stored != stored {
            self.index.replace(hash, stored, new_stored);
        }
        Ok(())
    }

    fn try_for_each_entry(
        &self,
        mut visitor: impl FnMut(EntryView<'_>) -> Result<bool>,
    ) -> Result<bool> {
        self.index.for_each(|_, stored| {
            self.records.read_record(from_stored_id(stored)?, |bytes| {
                let entry = EntryView::parse(bytes)?;
                if entry.is_value_void() {
                    return Ok(true);
                }
                visitor(entry)
            })
        })
    }

    /// Visits every key once, in no particular order, until `visitor` returns false.
    /// Returns false if the iteration was stopped early.
    pub fn process_keys(&self, mut visitor: impl FnMut(K::Item) -> bool) -> Result<bool> {
        self.try_for_each_entry(|entry| Ok(visitor(K::read(entry.key)?)))
    }

    /// Like [`Self::process_keys`], for key-value pairs
    pub fn for_each_entry(
        &self,
        mut visitor: impl FnMut(K::Item, V::Item) -> bool,
    ) -> Result<bool> {
        self.try_for_each_entry(|entry| Ok(visitor(K::read(entry.key)?, V::read(entry.rest)?)))
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Storage records neither relocated nor deleted. A tombstone rewrites its record in place,
    /// so tombstoned keys still count here while [`len`](Self::len) drops them
    pub fn live_records_count(&self) -> u64 {
        self.records.live_records_count()
    }

    pub fn records_allocated(&self) -> u64 {
        self.records.records_allocated()
    }

    pub fn force(&self) -> Result<()> {
        self.index.flush()?;
        self.records.force()
    }

    /// Never dirty: every write lands in the mapped storage right away
    pub fn is_dirty(&self) -> bool {
        false
    }

    pub fn close(self) -> Result<()> {
        let Self { index, records, .. } = self;
        close_all([
            (
                "index",
                Box::new(move || index.close()) as Box<dyn FnOnce() -> Result<()> + '_>,
            ),
            ("records", Box::new(move || records.close())),
        ])
    }

    /// Closes the map and releases its mappings right away.
    ///
    /// Taking `self` by value guarantees nothing can touch the map afterwards.
    pub fn close_and_unmap(self) -> Result<()> {
        let result = self.force();
        drop(self);
        result
    }

    /// Closes the map and deletes its files
    pub fn close_and_clean(self) -> Result<()> {
        let Self { index, records, .. } = self;
        close_all([
            (
                "index",
                Box::new(move || index.close_and_clean()) as Box<dyn FnOnce() -> Result<()> + '_>,
            ),
            ("records", Box::new(move || records.close_and_clean())),
        ])
    }
}

impl<K, V, BS> Compactable for DurableMap<K, V, BS>
where
    K: KeyDescriptor,
    V: DataExternalizer,
    BS: ByteStore,
{
    /// Share of allocated records that no longer hold a live entry
    fn compaction_score(&self) -> Result<f64> {
        Ok(compaction_score(
            self.len() as u64,
            self.records.records_allocated(),
            &self.config.compaction,
        ))
    }

    fn compact<F>(&self, factory: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Self>,
    {
        let target = factory()?;
        self.try_for_each_entry(|entry| {
            let key = K::read(entry.key)?;
            let value = V::read(entry.rest)?;
            target.put(&key, Some(&value))?;
            Ok(true)
        })?;
        tracing::info!(
            entries = target.len(),
            records_before = self.records.records_allocated(),
            records_after = target.records.records_allocated(),
            "compacted durable map"
        );
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionConfig;
    use crate::types::{Bytes, Native, Str};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use tempfile::tempdir;

    type StrMap = DurableMap<Str, Native<i32>, VecStore>;

    fn str_map() -> StrMap {
        DurableMap::in_memory(DurableMapConfig::default()).unwrap()
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    /// Every key hashes to the same bucket
    struct Colliding;

    impl DataExternalizer for Colliding {
        type Item = String;

        fn encoded_size(item: &String) -> usize {
            Str::encoded_size(item)
        }

        fn write(item: &String, buf: &mut [u8]) {
            Str::write(item, buf)
        }

        fn read(buf: &[u8]) -> Result<String> {
            Str::read(buf)
        }
    }

    impl KeyDescriptor for Colliding {
        fn hash_code(_item: &String) -> i32 {
            42
        }

        fn is_equal(l: &String, r: &String) -> bool {
            l == r
        }
    }

    #[test]
    fn test_put_get_overwrite() {
        let map = str_map();
        map.put(&key("a"), Some(&1)).unwrap();
        map.put(&key("b"), Some(&2)).unwrap();
        map.put(&key("a"), Some(&3)).unwrap();

        assert_eq!(map.get(&key("a")).unwrap(), Some(3));
        assert_eq!(map.get(&key("b")).unwrap(), Some(2));
        assert_eq!(map.get(&key("c")).unwrap(), None);
        assert_eq!(map.len(), 2);

        let mut keys = HashSet::new();
        assert!(map.process_keys(|k| keys.insert(k)).unwrap());
        assert_eq!(keys, HashSet::from([key("a"), key("b")]));
    }

    #[test]
    fn test_empty_key_and_value() {
        let map: DurableMap<Str, Str, VecStore> =
            DurableMap::in_memory(DurableMapConfig::default()).unwrap();
        map.put(&key(""), Some(&key(""))).unwrap();
        assert!(map.contains_mapping(&key("")).unwrap());
        assert_eq!(map.get(&key("")).unwrap(), Some(key("")));
    }

    #[test]
    fn test_tombstone() {
        let map = str_map();
        map.put(&key("a"), Some(&1)).unwrap();
        map.put(&key("b"), Some(&2)).unwrap();
        assert_eq!(map.len(), 2);

        map.put(&key("a"), None).unwrap();
        assert_eq!(map.get(&key("a")).unwrap(), None);
        assert!(!map.contains_mapping(&key("a")).unwrap());
        assert_eq!(map.len(), 1);

        // removing an absent key changes nothing
        map.remove(&key("a")).unwrap();
        map.remove(&key("zzz")).unwrap();
        assert_eq!(map.len(), 1);

        map.put(&key("a"), Some(&5)).unwrap();
        assert_eq!(map.get(&key("a")).unwrap(), Some(5));
        assert_eq!(map.len(), 2);

        let mut entries = Vec::new();
        map.for_each_entry(|k, v| {
            entries.push((k, v));
            true
        })
        .unwrap();
        entries.sort();
        assert_eq!(entries, vec![(key("a"), 5), (key("b"), 2)]);
    }

    #[test]
    fn test_no_op_write_with_value_equality() {
        let map = str_map().with_value_equality(|l, r| l == r);
        map.put(&key("a"), Some(&1)).unwrap();
        let allocated = map.records_allocated();

        for _ in 0..10 {
            map.put(&key("a"), Some(&1)).unwrap();
        }
        assert_eq!(map.records_allocated(), allocated);
        assert_eq!(map.live_records_count(), 1);
        assert_eq!(map.get(&key("a")).unwrap(), Some(1));
    }

    #[test]
    fn test_growing_value_relocates() {
        let map: DurableMap<Str, Bytes, VecStore> =
            DurableMap::in_memory(DurableMapConfig::default()).unwrap();
        map.put(&key("k"), Some(&vec![1; 4])).unwrap();
        map.put(&key("k"), Some(&vec![2; 4096])).unwrap();
        assert_eq!(map.get(&key("k")).unwrap(), Some(vec![2; 4096]));
        assert_eq!(map.len(), 1);
        assert_eq!(map.records_allocated(), 2);
        assert_eq!(map.live_records_count(), 1);
    }

    #[test]
    fn test_tombstone_keeps_its_record_live() {
        let map = str_map();
        map.put(&key("a"), Some(&1)).unwrap();
        map.put(&key("b"), Some(&2)).unwrap();
        map.remove(&key("a")).unwrap();

        assert_eq!(map.len(), 1);
        assert_eq!(map.records_allocated(), 2);
        assert_eq!(map.live_records_count(), 2);
    }

    #[test]
    fn test_collisions() {
        let map: DurableMap<Colliding, Native<i32>, VecStore> =
            DurableMap::in_memory(DurableMapConfig::default()).unwrap();
        for (i, k) in ["x", "y", "z"].iter().enumerate() {
            map.put(&key(k), Some(&(i as i32))).unwrap();
        }
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&key("x")).unwrap(), Some(0));
        assert_eq!(map.get(&key("y")).unwrap(), Some(1));
        assert_eq!(map.get(&key("z")).unwrap(), Some(2));

        map.remove(&key("y")).unwrap();
        assert_eq!(map.get(&key("y")).unwrap(), None);
        assert_eq!(map.get(&key("x")).unwrap(), Some(0));
        assert_eq!(map.get(&key("z")).unwrap(), Some(2));

        map.put(&key("x"), Some(&10)).unwrap();
        assert_eq!(map.get(&key("x")).unwrap(), Some(10));
        assert_eq!(map.get(&key("z")).unwrap(), Some(2));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_append() {
        let config = DurableMapConfig::default()
            .with_allocation(crate::config::AllocationStrategy::new(16, 0));
        let map: DurableMap<Str, Bytes, VecStore> = DurableMap::in_memory(config).unwrap();

        let err = map.append(&key("k"), 1, |buf| buf[0] = 1).unwrap_err();
        assert!(matches!(err, DurableMapError::KeyNotFound));

        map.put(&key("k"), Some(&b"ab".to_vec())).unwrap();
        map.append(&key("k"), 2, |buf| buf.copy_from_slice(b"cd"))
            .unwrap();
        assert_eq!(map.records_allocated(), 1, "grew in place");

        map.append(&key("k"), 100, |buf| buf.fill(b'e')).unwrap();
        let mut expected = b"abcd".to_vec();
        expected.extend_from_slice(&[b'e'; 100]);
        assert_eq!(map.get(&key("k")).unwrap(), Some(expected));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_process_keys_early_stop() {
        let map = str_map();
        for i in 0..10 {
            map.put(&format!("key{i}"), Some(&i)).unwrap();
        }
        let mut visited = 0;
        let completed = map
            .process_keys(|_| {
                visited += 1;
                visited < 4
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(visited, 4);
    }

    #[test]
    #[should_panic(expected = "exceeds the max supported")]
    fn test_oversized_value() {
        let config = DurableMapConfig::default().with_max_payload(64);
        let map: DurableMap<Str, Bytes, VecStore> = DurableMap::in_memory(config).unwrap();
        map.put(&key("k"), Some(&vec![0; 128])).unwrap();
    }

    #[test]
    fn test_compaction() {
        let config = DurableMapConfig::default()
            .with_compaction(CompactionConfig::default().with_min_records_for_stable_score(0));
        let new_map = || DurableMap::<Str, Bytes, VecStore>::in_memory(config);
        let map = new_map().unwrap();

        for i in 0..100 {
            map.put(&format!("key{i}"), Some(&vec![i as u8; 8])).unwrap();
        }
        // growing overwrites relocate, leaving dead records behind
        for round in 1..=5 {
            for i in (0..100).step_by(2) {
                map.put(&format!("key{i}"), Some(&vec![round; 8 + round as usize * 100]))
                    .unwrap();
            }
        }
        map.remove(&key("key1")).unwrap();

        let score = map.compaction_score().unwrap();
        assert!(score > 0.3, "score {score}");

        let compacted = map.compact(new_map).unwrap();
        assert_eq!(compacted.len(), map.len());
        assert_eq!(compacted.live_records_count(), compacted.len() as u64);
        assert!(compacted.compaction_score().unwrap() < 0.01);

        map.for_each_entry(|k, v| {
            assert_eq!(compacted.get(&k).unwrap(), Some(v));
            true
        })
        .unwrap();
        assert_eq!(compacted.get(&key("key1")).unwrap(), None);
    }

    #[test]
    fn test_concurrent_readers_see_whole_records() {
        let map: Arc<DurableMap<Str, Bytes, VecStore>> =
            Arc::new(DurableMap::in_memory(DurableMapConfig::default()).unwrap());
        let keys: Vec<String> = (0..16u8).map(|i| format!("k{i}")).collect();
        for (i, k) in keys.iter().enumerate() {
            map.put(k, Some(&vec![i as u8; 1])).unwrap();
        }

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                let keys = keys.clone();
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        for (i, k) in keys.iter().enumerate() {
                            let value = map.get(k).unwrap().unwrap();
                            assert!(!value.is_empty());
                            assert!(value.iter().all(|&b| b == i as u8), "torn value for {k}");
                        }
                        map.for_each_entry(|k, v| {
                            let i: u8 = k[1..].parse().unwrap();
                            assert!(v.iter().all(|&b| b == i), "torn entry for {k}");
                            true
                        })
                        .unwrap();
                    }
                })
            })
            .collect();

        for round in 1..200usize {
            for (i, k) in keys.iter().enumerate() {
                map.put(k, Some(&vec![i as u8; round % 50 + 1])).unwrap();
            }
        }
        done.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(map.len(), keys.len());
    }

    #[test]
    fn test_reopen() {
        let dir = tempdir().unwrap();
        {
            let map: DurableMap<Str, Str> =
                DurableMap::open(dir.path(), DurableMapConfig::default()).unwrap();
            map.put(&key("a"), Some(&key("alpha"))).unwrap();
            map.put(&key("b"), Some(&key("beta"))).unwrap();
            map.put(&key("c"), Some(&key("gamma"))).unwrap();
            map.remove(&key("c")).unwrap();
            map.force().unwrap();
            assert!(!map.is_dirty());
            map.close().unwrap();
        }
        let map: DurableMap<Str, Str> =
            DurableMap::open(dir.path(), DurableMapConfig::default()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&key("a")).unwrap(), Some(key("alpha")));
        assert_eq!(map.get(&key("b")).unwrap(), Some(key("beta")));
        assert_eq!(map.get(&key("c")).unwrap(), None);

        map.close_and_clean().unwrap();
        assert!(!dir.path().join(RECORDS_FILE).exists());
        assert!(!dir.path().join(INDEX_FILE).exists());
    }

    #[test]
    fn test_close_and_unmap() {
        let dir = tempdir().unwrap();
        let map: DurableMap<Native<u64>, Native<u64>> =
            DurableMap::open(dir.path(), DurableMapConfig::default()).unwrap();
        map.put(&1, Some(&2)).unwrap();
        map.close_and_unmap().unwrap();

        let map: DurableMap<Native<u64>, Native<u64>> =
            DurableMap::open(dir.path(), DurableMapConfig::default()).unwrap();
        assert_eq!(map.get(&1).unwrap(), Some(2));
    }
}
