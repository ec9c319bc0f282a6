//! Error types shared by the table, the scheduler and the expiring map.
//!
//! Lookups on absent keys are never errors; they return `None`/`false`.
//! Resize failures are absorbed inside the table and only logged. What
//! remains here are the failures that make an operation itself impossible.

use std::io;
use thiserror::Error;

/// A bucket array of the requested size could not be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to allocate a bucket array of {capacity} slots")]
pub struct AllocError {
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InsertError {
    /// The table has no bucket array and retrying the allocation failed.
    #[error("table has no bucket array: {0}")]
    AllocationFailed(#[from] AllocError),
}

/// Returned by `HashTable::check_invariants` when the structure is inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hash table invariant violated: {0}")]
pub struct InvariantError(String);

impl InvariantError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduler has shut down")]
    ShutDown,
    #[error("failed to spawn scheduler thread")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum RotationError {
    /// No scheduler was passed and no process-wide default could be created.
    #[error("no scheduler available; rotation is not active")]
    MissingScheduler,
    #[error("scheduler rejected the rotation task")]
    Schedule(#[from] ScheduleError),
}
