//! In-memory extendible hashing.
//!
//! A directory of `2^global_depth` slots references shared buckets; a bucket
//! with `local_depth` d is referenced by every slot agreeing with it on the
//! low d bits of the hash. Splitting a full bucket doubles the directory
//! only when the bucket's depth has caught up with the directory's.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

struct Bucket<K, V> {
    depth: usize,
    items: Vec<(K, V)>,
}

impl<K, V> Bucket<K, V> {
    fn new(depth: usize) -> Self {
        Self {
            depth,
            items: Vec::new(),
        }
    }
}

struct Directory<K, V> {
    global_depth: usize,
    slots: Vec<Arc<Mutex<Bucket<K, V>>>>,
}

/// Concurrent dynamic hash map with O(1) expected operations.
///
/// Used as the buffer pool's page table and as a general-purpose container.
/// A single mutex protects the whole structure.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    dir: Mutex<Directory<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size >= 1);
        Self {
            bucket_size,
            dir: Mutex::new(Directory {
                global_depth: 0,
                slots: vec![Arc::new(Mutex::new(Bucket::new(0)))],
            }),
        }
    }

    fn hash(key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize
    }

    fn slot_index(dir: &Directory<K, V>, key: &K) -> usize {
        Self::hash(key) & ((1 << dir.global_depth) - 1)
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let dir = self.dir.lock();
        let bucket = dir.slots[Self::slot_index(&dir, key)].lock();
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert, replacing the existing value on a key collision.
    pub fn insert(&self, key: K, value: V) {
        let mut dir = self.dir.lock();

        loop {
            let index = Self::slot_index(&dir, &key);
            let bucket_ref = dir.slots[index].clone();
            let mut bucket = bucket_ref.lock();

            if let Some(slot) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value;
                break;
            }
            if bucket.items.len() < self.bucket_size {
                bucket.items.push((key, value));
                break;
            }

            // Full bucket: grow the directory if this bucket's depth has
            // caught up, then split it and retry.
            if bucket.depth == dir.global_depth {
                let clones = dir.slots.clone();
                dir.slots.extend(clones);
                dir.global_depth += 1;
            }

            let new_depth = bucket.depth + 1;
            bucket.depth = new_depth;
            let high_bit = 1usize << (new_depth - 1);

            let sibling = Arc::new(Mutex::new(Bucket::new(new_depth)));
            {
                let mut sibling_bucket = sibling.lock();
                let mut kept = Vec::with_capacity(bucket.items.len());
                for (k, v) in bucket.items.drain(..) {
                    if Self::hash(&k) & high_bit != 0 {
                        sibling_bucket.items.push((k, v));
                    } else {
                        kept.push((k, v));
                    }
                }
                bucket.items = kept;
            }
            drop(bucket);

            for i in 0..dir.slots.len() {
                if Arc::ptr_eq(&dir.slots[i], &bucket_ref) && i & high_bit != 0 {
                    dir.slots[i] = sibling.clone();
                }
            }
        }

        debug_assert!(Self::verify_integrity(&dir));
    }

    pub fn remove(&self, key: &K) -> bool {
        let dir = self.dir.lock();
        let bucket_ref = dir.slots[Self::slot_index(&dir, key)].clone();
        let mut bucket = bucket_ref.lock();
        let before = bucket.items.len();
        bucket.items.retain(|(k, _)| k != key);
        before != bucket.items.len()
    }

    pub fn global_depth(&self) -> usize {
        self.dir.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> usize {
        let dir = self.dir.lock();
        let depth = dir.slots[dir_index].lock().depth;
        depth
    }

    pub fn num_buckets(&self) -> usize {
        let dir = self.dir.lock();
        let mut seen: Vec<*const Mutex<Bucket<K, V>>> = Vec::new();
        for slot in &dir.slots {
            let ptr = Arc::as_ptr(slot);
            if !seen.contains(&ptr) {
                seen.push(ptr);
            }
        }
        seen.len()
    }

    fn verify_integrity(dir: &Directory<K, V>) -> bool {
        if dir.slots.len() != 1 << dir.global_depth {
            return false;
        }
        for (i, slot) in dir.slots.iter().enumerate() {
            let depth = slot.lock().depth;
            if depth > dir.global_depth {
                return false;
            }
            // every slot agreeing on the low `depth` bits shares the bucket
            let canonical = i & ((1 << depth) - 1);
            if !Arc::ptr_eq(slot, &dir.slots[canonical]) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_insert_find_remove() {
        let table = ExtendibleHashTable::new(4);

        table.insert(1, "one");
        table.insert(2, "two");
        table.insert(3, "three");

        assert_eq!(table.find(&1), Some("one"));
        assert_eq!(table.find(&2), Some("two"));
        assert_eq!(table.find(&4), None);

        assert!(table.remove(&2));
        assert!(!table.remove(&2));
        assert_eq!(table.find(&2), None);
    }

    #[test]
    fn test_insert_replaces_value() {
        let table = ExtendibleHashTable::new(4);

        table.insert(7, 1);
        table.insert(7, 2);
        assert_eq!(table.find(&7), Some(2));
    }

    #[test]
    fn test_directory_growth() {
        let table = ExtendibleHashTable::new(2);

        for i in 0..64 {
            table.insert(i, i * 10);
        }
        for i in 0..64 {
            assert_eq!(table.find(&i), Some(i * 10), "key {} lost", i);
        }

        // 64 keys across buckets of two force repeated directory doubling
        assert!(table.global_depth() >= 5);
        assert!(table.num_buckets() > 1);
    }

    #[test]
    fn test_local_depth_bounded_by_global() {
        let table = ExtendibleHashTable::new(2);
        for i in 0..32 {
            table.insert(i, i);
        }
        let global = table.global_depth();
        for i in 0..(1 << global) {
            assert!(table.local_depth(i) <= global);
        }
    }

    #[test]
    fn test_remove_then_reinsert() {
        let table = ExtendibleHashTable::new(2);
        for i in 0..16 {
            table.insert(i, i);
        }
        for i in 0..16 {
            assert!(table.remove(&i));
        }
        for i in 0..16 {
            assert_eq!(table.find(&i), None);
        }
        for i in 0..16 {
            table.insert(i, i + 100);
        }
        for i in 0..16 {
            assert_eq!(table.find(&i), Some(i + 100));
        }
    }

    #[test]
    fn test_concurrent_inserts() {
        let table = Arc::new(ExtendibleHashTable::new(2));
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = vec![];

        for t in 0..4u64 {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..100u64 {
                    table.insert(t * 1000 + i, i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..4u64 {
            for i in 0..100u64 {
                assert_eq!(table.find(&(t * 1000 + i)), Some(i));
            }
        }
    }
}
