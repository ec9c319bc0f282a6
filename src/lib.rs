//! expiring-hashmap: an insertion-ordered hash table with split/merge
//! resizing, and a two-generation expiring map built on it.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: bounded-lifetime caching with O(1) eviction, on top of a table
//!   whose iteration order and resize cost are predictable.
//! - Layers:
//!   - `hasher`: Adler-style byte checksum plus a bit-spreading rehash; the
//!     default `BuildHasher` of every table.
//!   - `HashTable<K, V, S>`: chained buckets over a generational arena, with
//!     a global doubly-linked list in insertion order. Grows and shrinks by
//!     powers of two using one bit test per entry.
//!   - `Scheduler`: "run this every P, and stop (waiting for a running
//!     invocation)". `TimerScheduler` implements it on one thread.
//!   - `ExpiringMap<K, V, S>`: two `HashTable` generations behind one lock,
//!     rotated by a recurring task.
//!
//! Constraints
//! - Capacity is a power of two in `[MIN_CAPACITY, MAX_CAPACITY]` and never
//!   drops below the table's minimum capacity.
//! - Links are arena keys (`slotmap::DefaultKey`), never raw pointers; a
//!   removed entry's `Handle` stops resolving rather than aliasing.
//! - Each entry stores its 32-bit hash; resizing never calls `K: Hash`.
//! - Resize allocation failures are absorbed: the table keeps its current
//!   capacity. Only an insert into a table with no bucket array at all
//!   reports `InsertError`.
//!
//! Expiry semantics
//! - An entry untouched since the previous rotation is dropped at the next
//!   one, so lifetime is between one and two windows.
//! - Touching means `put`, or `get` with `refresh = true`. A plain `get`
//!   does not extend lifetime.
//!
//! Threading
//! - `HashTable` is a plain single-owner container.
//! - `ExpiringMap` is `Sync`; every operation and every rotation takes the
//!   map's one generation lock. Cancelling rotation (including on drop)
//!   waits for an in-flight rotation before returning.
//!
//! Logging goes through `tracing`; the crate installs no subscriber.

pub mod error;
pub mod expiring_map;
pub mod hash_table;
mod hash_table_proptest;
pub mod hasher;
pub mod scheduler;

// Public surface
pub use error::{AllocError, InsertError, InvariantError, RotationError, ScheduleError};
pub use expiring_map::{ExpiringMap, Generation};
pub use hash_table::{Handle, HashTable, MAX_CAPACITY, MIN_CAPACITY};
pub use hasher::{hash_bytes, rehash, rehash64, BytesHashBuilder, BytesHasher};
pub use scheduler::{default_scheduler, Scheduler, Task, TaskId, TimerScheduler};
