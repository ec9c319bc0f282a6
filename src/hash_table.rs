//! HashTable: chained buckets over a generational arena, threaded by a
//! global insertion-order list.
//!
//! Every entry sits in exactly one bucket chain (`hash & (capacity - 1)`)
//! and at exactly one position of the doubly-linked global list. Links are
//! arena keys, never addresses, so resizing only rewrites `Option<DefaultKey>`
//! fields and never moves an entry.
//!
//! Resizing is driven by load factor:
//! - grow doubles the bucket array once `len >= 0.75 * capacity`, splitting
//!   chain `i` into chains `i` and `i | capacity` with one bit test per entry;
//! - shrink halves it once a removal leaves `len <= 0.25 * capacity`,
//!   appending chain `i | n` to chain `i`.
//!
//! Both keep relative chain order and reuse the stored hash; `K: Hash` is
//! never called after insertion. Neither touches the global list, so
//! iteration order is the order of first insertion among live keys.

use crate::error::{AllocError, InsertError, InvariantError};
use crate::hasher::{rehash64, BytesHashBuilder};
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use slotmap::{DefaultKey, SecondaryMap, SlotMap};
use tracing::{debug, warn};

pub const MIN_CAPACITY: u32 = 16;
pub const MAX_CAPACITY: u32 = 0x1000_0000;

/// Stable reference to a live entry. Stops resolving once the entry is removed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle(DefaultKey);

impl Handle {
    pub fn key<'a, K, V, S>(&self, table: &'a HashTable<K, V, S>) -> Option<&'a K> {
        table.handle_key(*self)
    }

    pub fn value<'a, K, V, S>(&self, table: &'a HashTable<K, V, S>) -> Option<&'a V> {
        table.handle_value(*self)
    }

    pub fn value_mut<'a, K, V, S>(&self, table: &'a mut HashTable<K, V, S>) -> Option<&'a mut V> {
        table.handle_value_mut(*self)
    }
}

#[derive(Debug, Clone)]
struct Entry<K, V> {
    key: K,
    value: V,
    hash: u32,
    chain: Option<DefaultKey>,
    next: Option<DefaultKey>,
    before: Option<DefaultKey>,
}

type Buckets = Vec<Option<DefaultKey>>;

#[derive(Clone)]
pub struct HashTable<K, V, S = BytesHashBuilder> {
    hasher: S,
    slots: SlotMap<DefaultKey, Entry<K, V>>,
    buckets: Buckets,
    capacity: u32,
    minimum_capacity: u32,
    threshold_up: u32,
    threshold_down: u32,
    first: Option<DefaultKey>,
    last: Option<DefaultKey>,
}

/// Rounds a requested minimum capacity up to a power of two inside
/// `[MIN_CAPACITY, MAX_CAPACITY]`.
fn normalize_capacity(requested: u32) -> u32 {
    if requested <= MIN_CAPACITY {
        MIN_CAPACITY
    } else if requested >= MAX_CAPACITY {
        MAX_CAPACITY
    } else {
        requested.next_power_of_two()
    }
}

fn allocate_buckets(capacity: u32) -> Result<Buckets, AllocError> {
    if injected_failure() {
        return Err(AllocError { capacity });
    }
    let mut buckets = Vec::new();
    buckets
        .try_reserve_exact(capacity as usize)
        .map_err(|_| AllocError { capacity })?;
    buckets.resize(capacity as usize, None);
    Ok(buckets)
}

impl<K, V> HashTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_capacity_and_hasher(MIN_CAPACITY, BytesHashBuilder)
    }

    pub fn with_capacity(minimum_capacity: u32) -> Self {
        Self::with_capacity_and_hasher(minimum_capacity, BytesHashBuilder)
    }
}

impl<K, V> Default for HashTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> HashTable<K, V, S> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current bucket count; 0 only when the bucket array could not be allocated.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn minimum_capacity(&self) -> u32 {
        self.minimum_capacity
    }

    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Oldest live entry.
    pub fn first(&self) -> Option<(&K, &V)> {
        self.first
            .and_then(|k| self.slots.get(k))
            .map(|e| (&e.key, &e.value))
    }

    /// Newest live entry.
    pub fn last(&self) -> Option<(&K, &V)> {
        self.last
            .and_then(|k| self.slots.get(k))
            .map(|e| (&e.key, &e.value))
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: &self.slots,
            front: self.first,
            back: self.last,
            remaining: self.slots.len(),
        }
    }

    /// Entries in insertion order with mutable values.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        let mut position = SecondaryMap::with_capacity(self.slots.len());
        let mut cur = self.first;
        let mut i = 0usize;
        while let Some(k) = cur {
            position.insert(k, i);
            i += 1;
            cur = self.slots.get(k).and_then(|e| e.next);
        }
        let mut ordered: Vec<Option<(&K, &mut V)>> = (0..i).map(|_| None).collect();
        for (k, e) in self.slots.iter_mut() {
            if let Some(&p) = position.get(k) {
                ordered[p] = Some((&e.key, &mut e.value));
            }
        }
        IterMut {
            inner: ordered.into_iter().flatten(),
        }
    }

    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl DoubleEndedIterator<Item = &V> + '_ {
        self.iter().map(|(_, v)| v)
    }

    /// Drops every entry and resets the bucket array to the minimum capacity.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.first = None;
        self.last = None;
        self.buckets = Vec::new();
        self.reset_buckets();
    }

    /// Retries the initial bucket allocation of a table left without one.
    pub fn ensure_allocated(&mut self) -> Result<(), AllocError> {
        if self.capacity != 0 {
            return Ok(());
        }
        let buckets = allocate_buckets(self.minimum_capacity)?;
        self.install(buckets, self.minimum_capacity);
        Ok(())
    }

    pub(crate) fn handle_key(&self, h: Handle) -> Option<&K> {
        self.slots.get(h.0).map(|e| &e.key)
    }

    pub(crate) fn handle_value(&self, h: Handle) -> Option<&V> {
        self.slots.get(h.0).map(|e| &e.value)
    }

    pub(crate) fn handle_value_mut(&mut self, h: Handle) -> Option<&mut V> {
        self.slots.get_mut(h.0).map(|e| &mut e.value)
    }

    fn reset_buckets(&mut self) {
        match allocate_buckets(self.minimum_capacity) {
            Ok(buckets) => self.install(buckets, self.minimum_capacity),
            Err(e) => {
                warn!(error = %e, "hash table left without buckets");
                self.buckets = Vec::new();
                self.capacity = 0;
                self.threshold_up = 0;
                self.threshold_down = 0;
            }
        }
    }

    fn install(&mut self, buckets: Buckets, capacity: u32) {
        debug_assert_eq!(buckets.len(), capacity as usize);
        self.buckets = buckets;
        self.capacity = capacity;
        self.threshold_up = ((capacity as u64 * 3) / 4) as u32;
        self.threshold_down = capacity / 4;
    }

    #[inline]
    fn bucket_index(&self, hash: u32) -> usize {
        (hash & (self.capacity - 1)) as usize
    }

    fn grow(&mut self) {
        let n = self.capacity;
        if n == 0 || n >= MAX_CAPACITY {
            return;
        }
        let mut buckets = match allocate_buckets(n << 1) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, capacity = n, "grow skipped");
                return;
            }
        };
        for i in 0..n as usize {
            // Tails of the low (`i`) and high (`i | n`) sub-chains.
            let mut tails: [Option<DefaultKey>; 2] = [None, None];
            let mut cur = self.buckets[i];
            while let Some(k) = cur {
                let e = &mut self.slots[k];
                cur = e.chain.take();
                let side = usize::from(e.hash & n != 0);
                match tails[side] {
                    Some(t) => self.slots[t].chain = Some(k),
                    None => buckets[i | (side * n as usize)] = Some(k),
                }
                tails[side] = Some(k);
            }
        }
        self.install(buckets, n << 1);
        debug!(capacity = self.capacity, len = self.len(), "hash table grew");
    }

    fn shrink(&mut self) {
        let n = self.capacity >> 1;
        if n < self.minimum_capacity {
            return;
        }
        let mut buckets = match allocate_buckets(n) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, capacity = self.capacity, "shrink skipped");
                return;
            }
        };
        for i in 0..n as usize {
            let high = self.buckets[i | n as usize];
            buckets[i] = match self.buckets[i] {
                None => high,
                Some(head) => {
                    let mut tail = head;
                    while let Some(c) = self.slots[tail].chain {
                        tail = c;
                    }
                    self.slots[tail].chain = high;
                    Some(head)
                }
            };
        }
        self.install(buckets, n);
        debug!(capacity = self.capacity, len = self.len(), "hash table shrank");
    }

    /// Unlinks `k` from its chain and the global list, then frees it.
    fn unlink(&mut self, k: DefaultKey) -> Option<(K, V)> {
        let (hash, chain, before, next) = {
            let e = self.slots.get(k)?;
            (e.hash, e.chain, e.before, e.next)
        };

        let idx = self.bucket_index(hash);
        if self.buckets[idx] == Some(k) {
            self.buckets[idx] = chain;
        } else {
            let mut prev = self.buckets[idx];
            while let Some(p) = prev {
                let e = &mut self.slots[p];
                if e.chain == Some(k) {
                    e.chain = chain;
                    break;
                }
                prev = e.chain;
            }
        }

        match before {
            Some(b) => self.slots[b].next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.slots[n].before = before,
            None => self.last = before,
        }

        let entry = self.slots.remove(k)?;
        if self.slots.len() <= self.threshold_down as usize {
            self.shrink();
        }
        Some((entry.key, entry.value))
    }

    /// Removes the entry behind `handle`, if it is still live.
    pub fn remove_handle(&mut self, handle: Handle) -> Option<(K, V)> {
        self.unlink(handle.0)
    }

    /// Verifies chain membership, list links, counts and capacity bounds.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        let len = self.slots.len();
        if self.capacity == 0 {
            if !self.buckets.is_empty() || len != 0 || self.first.is_some() || self.last.is_some()
            {
                return Err(InvariantError::new("unallocated table is not empty"));
            }
            return Ok(());
        }
        if !self.capacity.is_power_of_two() {
            return Err(InvariantError::new(format!(
                "capacity {} is not a power of two",
                self.capacity
            )));
        }
        if self.capacity < self.minimum_capacity || self.capacity > MAX_CAPACITY {
            return Err(InvariantError::new(format!(
                "capacity {} outside [{}, {}]",
                self.capacity, self.minimum_capacity, MAX_CAPACITY
            )));
        }
        if self.buckets.len() != self.capacity as usize {
            return Err(InvariantError::new("bucket array length differs from capacity"));
        }

        let mut chained = 0usize;
        for (i, head) in self.buckets.iter().enumerate() {
            let mut cur = *head;
            while let Some(k) = cur {
                let e = self
                    .slots
                    .get(k)
                    .ok_or_else(|| InvariantError::new("chain references a freed entry"))?;
                if self.bucket_index(e.hash) != i {
                    return Err(InvariantError::new(format!("entry chained in wrong bucket {i}")));
                }
                chained += 1;
                if chained > len {
                    return Err(InvariantError::new("bucket chains hold more entries than len"));
                }
                cur = e.chain;
            }
        }
        if chained != len {
            return Err(InvariantError::new(format!(
                "bucket chains hold {chained} entries, len is {len}"
            )));
        }

        let mut listed = 0usize;
        let mut prev: Option<DefaultKey> = None;
        let mut cur = self.first;
        while let Some(k) = cur {
            let e = self
                .slots
                .get(k)
                .ok_or_else(|| InvariantError::new("list references a freed entry"))?;
            if e.before != prev {
                return Err(InvariantError::new("list back-link mismatch"));
            }
            listed += 1;
            if listed > len {
                return Err(InvariantError::new("global list is longer than len"));
            }
            prev = cur;
            cur = e.next;
        }
        if listed != len || self.last != prev {
            return Err(InvariantError::new(format!(
                "global list holds {listed} entries, len is {len}"
            )));
        }
        Ok(())
    }
}

impl<K, V, S> HashTable<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(MIN_CAPACITY, hasher)
    }

    /// `minimum_capacity` is clamped and rounded up to a power of two.
    pub fn with_capacity_and_hasher(minimum_capacity: u32, hasher: S) -> Self {
        let mut table = Self {
            hasher,
            slots: SlotMap::with_key(),
            buckets: Vec::new(),
            capacity: 0,
            minimum_capacity: normalize_capacity(minimum_capacity),
            threshold_up: 0,
            threshold_down: 0,
            first: None,
            last: None,
        };
        table.reset_buckets();
        table
    }

    fn make_hash<Q>(&self, q: &Q) -> u32
    where
        Q: ?Sized + Hash,
    {
        // Re-spread every code so hashers with weak low bits still fill buckets.
        rehash64(self.hasher.hash_one(q))
    }

    fn find_key<Q>(&self, hash: u32, q: &Q) -> Option<DefaultKey>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        if self.capacity == 0 {
            return None;
        }
        let mut cur = self.buckets[self.bucket_index(hash)];
        while let Some(k) = cur {
            let e = &self.slots[k];
            if e.hash == hash && e.key.borrow() == q {
                return Some(k);
            }
            cur = e.chain;
        }
        None
    }

    /// Returns `Ok(true)` when a new entry was linked, `Ok(false)` when an
    /// existing entry's value was overwritten in place.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool, InsertError> {
        let hash = self.make_hash(&key);
        if let Some(k) = self.find_key(hash, &key) {
            self.slots[k].value = value;
            return Ok(false);
        }
        self.ensure_allocated()?;

        let idx = self.bucket_index(hash);
        let before = self.last;
        let k = self.slots.insert(Entry {
            key,
            value,
            hash,
            chain: self.buckets[idx],
            next: None,
            before,
        });
        match before {
            Some(b) => self.slots[b].next = Some(k),
            None => self.first = Some(k),
        }
        self.last = Some(k);
        self.buckets[idx] = Some(k);

        if self.slots.len() >= self.threshold_up as usize {
            self.grow();
        }
        Ok(true)
    }

    pub fn find<Q>(&self, q: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.find_key(self.make_hash(q), q).map(Handle)
    }

    pub fn get<Q>(&self, q: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let k = self.find_key(self.make_hash(q), q)?;
        Some(&self.slots[k].value)
    }

    pub fn get_mut<Q>(&mut self, q: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let k = self.find_key(self.make_hash(q), q)?;
        Some(&mut self.slots[k].value)
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.find_key(self.make_hash(q), q).is_some()
    }

    pub fn remove_entry<Q>(&mut self, q: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let k = self.find_key(self.make_hash(q), q)?;
        self.unlink(k)
    }

    /// Returns whether an entry was removed.
    pub fn remove<Q>(&mut self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.remove_entry(q).is_some()
    }
}

impl<K, V, S> fmt::Debug for HashTable<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> Extend<(K, V)> for HashTable<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            if let Err(e) = self.insert(k, v) {
                warn!(error = %e, "dropping entry during extend");
            }
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashTable<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = Self::with_hasher(S::default());
        table.extend(iter);
        table
    }
}

impl<'a, K, V, S> IntoIterator for &'a HashTable<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Insertion-order iterator over `HashTable`.
pub struct Iter<'a, K, V> {
    slots: &'a SlotMap<DefaultKey, Entry<K, V>>,
    front: Option<DefaultKey>,
    back: Option<DefaultKey>,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let e = self.slots.get(self.front?)?;
        self.front = e.next;
        self.remaining -= 1;
        Some((&e.key, &e.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, K, V> DoubleEndedIterator for Iter<'a, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let e = self.slots.get(self.back?)?;
        self.back = e.before;
        self.remaining -= 1;
        Some((&e.key, &e.value))
    }
}

impl<'a, K, V> ExactSizeIterator for Iter<'a, K, V> {}

/// Insertion-order iterator yielding mutable values.
pub struct IterMut<'a, K, V> {
    inner: core::iter::Flatten<std::vec::IntoIter<Option<(&'a K, &'a mut V)>>>,
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

#[cfg(test)]
impl<K, V, S> HashTable<K, V, S> {
    /// Keys of every bucket chain, head first.
    pub(crate) fn chains(&self) -> Vec<Vec<&K>> {
        self.buckets
            .iter()
            .map(|head| {
                let mut chain = Vec::new();
                let mut cur = *head;
                while let Some(k) = cur {
                    let e = &self.slots[k];
                    chain.push(&e.key);
                    cur = e.chain;
                }
                chain
            })
            .collect()
    }
}

#[cfg(not(test))]
#[inline(always)]
fn injected_failure() -> bool {
    false
}

#[cfg(test)]
fn injected_failure() -> bool {
    fail_alloc::active()
}
