//! Chained hash table keyed by [`HashKey`].
//!
//! Each bucket is a chain whose head is the most recently inserted entry.
//! The table grows to `2 * size + 1` buckets once the entry count exceeds
//! three quarters of the bucket count.

use crate::key::{HashKey, KeyRef};

/// Smallest bucket count a table is created with.
pub const DEFAULT_TABLE_SIZE: usize = 101;

const LOAD_FACTOR: f64 = 0.75;

#[derive(Debug)]
struct Entry<V> {
    key: HashKey,
    hash: u32,
    value: V,
}

/// Chains are stored tail-first: the last element of each `Vec` is the
/// chain head.
#[derive(Debug)]
pub struct HashTable<V> {
    buckets: Vec<Vec<Entry<V>>>,
    len: usize,
}

fn bucket_index(hash: u32, table_size: usize) -> usize {
    (hash & 0x7FFF_FFFF) as usize % table_size
}

fn empty_buckets<V>(size: usize) -> Vec<Vec<Entry<V>>> {
    (0..size).map(|_| Vec::new()).collect()
}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HashTable<V> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TABLE_SIZE)
    }

    /// Create a table with at least `size` buckets (never fewer than
    /// [`DEFAULT_TABLE_SIZE`]).
    pub fn with_capacity(size: usize) -> Self {
        Self {
            buckets: empty_buckets(size.max(DEFAULT_TABLE_SIZE)),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current number of buckets.
    pub fn table_size(&self) -> usize {
        self.buckets.len()
    }

    /// Insert `value` under `key`. If the key is already present its value
    /// is replaced and the previous value returned.
    pub fn insert(&mut self, key: impl Into<HashKey>, value: V) -> Option<V> {
        let key = key.into();
        let hash = key.as_key_ref().hash();
        let index = bucket_index(hash, self.buckets.len());

        if let Some(entry) = self.buckets[index].iter_mut().rev().find(|e| e.key == key) {
            return Some(std::mem::replace(&mut entry.value, value));
        }

        self.buckets[index].push(Entry { key, hash, value });
        self.len += 1;
        if self.len as f64 > self.buckets.len() as f64 * LOAD_FACTOR {
            self.rehash();
        }
        None
    }

    pub fn get<'k>(&self, key: impl Into<KeyRef<'k>>) -> Option<&V> {
        let (bucket, pos) = self.find(key.into())?;
        Some(&self.buckets[bucket][pos].value)
    }

    pub fn get_mut<'k>(&mut self, key: impl Into<KeyRef<'k>>) -> Option<&mut V> {
        let (bucket, pos) = self.find(key.into())?;
        Some(&mut self.buckets[bucket][pos].value)
    }

    pub fn contains_key<'k>(&self, key: impl Into<KeyRef<'k>>) -> bool {
        self.find(key.into()).is_some()
    }

    /// Unlink the entry for `key` and hand its value back to the caller.
    pub fn remove<'k>(&mut self, key: impl Into<KeyRef<'k>>) -> Option<V> {
        let (bucket, pos) = self.find(key.into())?;
        self.len -= 1;
        Some(self.buckets[bucket].remove(pos).value)
    }

    /// Entries in bucket order, each chain from its head.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            buckets: &self.buckets,
            bucket: 0,
            chain: <&[Entry<V>]>::default().iter().rev(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &HashKey> {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }

    /// A detached cursor over the table; see [`Cursor`].
    pub fn cursor(&self) -> Cursor {
        Cursor::default()
    }

    /// Keep only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&HashKey, &mut V) -> bool) {
        let mut removed = 0;
        for chain in &mut self.buckets {
            let before = chain.len();
            chain.retain_mut(|e| keep(&e.key, &mut e.value));
            removed += before - chain.len();
        }
        self.len -= removed;
    }

    /// Remove every entry, returning them. The bucket count is kept.
    pub fn drain(&mut self) -> Vec<(HashKey, V)> {
        let size = self.buckets.len();
        let buckets = std::mem::replace(&mut self.buckets, empty_buckets(size));
        self.len = 0;
        buckets
            .into_iter()
            .flat_map(|chain| chain.into_iter().rev())
            .map(|e| (e.key, e.value))
            .collect()
    }

    fn find(&self, key: KeyRef<'_>) -> Option<(usize, usize)> {
        let index = bucket_index(key.hash(), self.buckets.len());
        self.buckets[index]
            .iter()
            .rposition(|e| e.key.as_key_ref() == key)
            .map(|pos| (index, pos))
    }

    fn rehash(&mut self) {
        let new_size = self.buckets.len() * 2 + 1;
        let old = std::mem::replace(&mut self.buckets, empty_buckets(new_size));
        for entry in old.into_iter().flatten() {
            let index = bucket_index(entry.hash, new_size);
            self.buckets[index].push(entry);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Iteration
// ─────────────────────────────────────────────────────────────────────────────

pub struct Iter<'a, V> {
    buckets: &'a [Vec<Entry<V>>],
    bucket: usize,
    chain: std::iter::Rev<std::slice::Iter<'a, Entry<V>>>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a HashKey, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.chain.next() {
                return Some((&entry.key, &entry.value));
            }
            let chain = self.buckets.get(self.bucket)?;
            self.bucket += 1;
            self.chain = chain.iter().rev();
        }
    }
}

/// Position in a table that does not hold a borrow between steps.
///
/// The cursor steps past an entry before yielding it, so the caller may
/// remove exactly that entry and keep going. Any other mutation between
/// steps (inserting, removing a different key) invalidates the position.
#[derive(Debug, Default)]
pub struct Cursor {
    bucket: usize,
    remaining: Option<usize>,
}

impl Cursor {
    pub fn next_entry<'t, V>(&mut self, table: &'t HashTable<V>) -> Option<(&'t HashKey, &'t V)> {
        loop {
            let chain = table.buckets.get(self.bucket)?;
            let remaining = self.remaining.unwrap_or(chain.len()).min(chain.len());
            if remaining == 0 {
                self.bucket += 1;
                self.remaining = None;
                continue;
            }
            self.remaining = Some(remaining - 1);
            let entry = &chain[remaining - 1];
            return Some((&entry.key, &entry.value));
        }
    }
}
