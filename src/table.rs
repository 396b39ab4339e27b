// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! In-memory table storage: hash-indexed rows, point lookup only. Each row
//! pairs a value cell with the atomic metadata word from [crate::meta];
//! the word is the only synchronization the commit protocol relies on, the
//! value cell's lock just keeps the byte copy itself tearing-free.

use crate::meta;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// One record. The metadata word and the value are updated separately, so
/// readers snapshot with [Row::read]'s word-sandwich rather than assuming
/// the pair is atomic.
pub struct Row {
    meta: AtomicU64,
    value: RwLock<Vec<u8>>,
}

impl Row {
    fn new(value: Vec<u8>) -> Self {
        Row {
            meta: AtomicU64::new(0),
            value: RwLock::new(value),
        }
    }

    pub fn meta(&self) -> &AtomicU64 {
        &self.meta
    }

    /// Consistent (word, bytes) snapshot: load the word, copy the bytes,
    /// re-load; retry if a writer slipped in between or holds the lock.
    /// Writers only mutate under the lock bit, so the loop terminates as
    /// soon as the row is quiescent.
    pub fn read(&self) -> (u64, Vec<u8>) {
        loop {
            let before = self.meta.load(Ordering::Acquire);
            if meta::is_locked(before) {
                std::hint::spin_loop();
                continue;
            }
            let bytes = self.value.read().clone();
            let after = self.meta.load(Ordering::Acquire);
            if before == after {
                return (before, bytes);
            }
        }
    }

    pub fn write(&self, bytes: &[u8]) {
        let mut value = self.value.write();
        value.clear();
        value.extend_from_slice(bytes);
    }
}

/// The storage interface the engine consumes. One table holds one
/// partition's rows for one logical relation.
pub trait Table: Send + Sync {
    fn table_id(&self) -> usize;
    fn partition_id(&self) -> usize;
    fn search(&self, key: &[u8]) -> &Row;
    fn search_metadata(&self, key: &[u8]) -> &AtomicU64;
    fn update(&self, key: &[u8], value: &[u8]);
    fn value_size(&self) -> usize;
}

/// Hash-indexed table. The row set is fixed after loading; the engine only
/// does point lookups and in-place updates, so the map itself is never
/// mutated concurrently.
pub struct HashTable {
    table_id: usize,
    partition_id: usize,
    value_size: usize,
    rows: HashMap<Vec<u8>, Row>,
}

impl HashTable {
    pub fn new(table_id: usize, partition_id: usize, value_size: usize) -> Self {
        HashTable {
            table_id,
            partition_id,
            value_size,
            rows: HashMap::new(),
        }
    }

    /// Populate a row during load, before any worker runs.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        assert_eq!(value.len(), self.value_size);
        self.rows.insert(key, Row::new(value));
    }
}

impl Table for HashTable {
    fn table_id(&self) -> usize {
        self.table_id
    }

    fn partition_id(&self) -> usize {
        self.partition_id
    }

    fn search(&self, key: &[u8]) -> &Row {
        self.rows
            .get(key)
            .unwrap_or_else(|| panic!("no row for key {:?} in table {}", key, self.table_id))
    }

    fn search_metadata(&self, key: &[u8]) -> &AtomicU64 {
        self.search(key).meta()
    }

    fn update(&self, key: &[u8], value: &[u8]) {
        assert_eq!(value.len(), self.value_size);
        self.search(key).write(value);
    }

    fn value_size(&self) -> usize {
        self.value_size
    }
}
