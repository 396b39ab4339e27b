// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! An [RwKey] describes one record access made by a transaction: which
//! table and partition, the key bytes, the value bytes (filled in by the
//! read path, or supplied by the writer), the metadata word snapshotted
//! when the record was read, and a handful of protocol flag bits. The
//! transaction's read and write sets are plain vectors of these.

/// Flag bits on an [RwKey]. Packed into one byte; accessors below.
const READ_REQUEST: u8 = 1 << 0;
const LOCAL_INDEX_READ: u8 = 1 << 1;
const WRITE_LOCK: u8 = 1 << 2;
const VALIDATION_OK: u8 = 1 << 3;
const WTS_CHANGED: u8 = 1 << 4;

#[derive(Clone, Debug, Default)]
pub struct RwKey {
    table_id: usize,
    partition_id: usize,
    key: Vec<u8>,
    value: Vec<u8>,
    tid: u64,
    flags: u8,
}

impl RwKey {
    pub fn new(table_id: usize, partition_id: usize, key: Vec<u8>) -> Self {
        RwKey {
            table_id,
            partition_id,
            key,
            value: Vec::new(),
            tid: 0,
            flags: 0,
        }
    }

    pub fn table_id(&self) -> usize {
        self.table_id
    }

    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn set_value(&mut self, value: Vec<u8>) {
        self.value = value;
    }

    /// The metadata word captured for this access: at read time for read
    /// keys, at lock time for write keys.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn set_tid(&mut self, tid: u64) {
        self.tid = tid;
    }

    /// Two accesses address the same record iff table, partition and key
    /// bytes all agree. Used to find a write's matching read and to skip
    /// validation of reads that the write-set already covers.
    pub fn same_record(&self, other: &RwKey) -> bool {
        self.table_id == other.table_id
            && self.partition_id == other.partition_id
            && self.key == other.key
    }

    pub fn read_request(&self) -> bool {
        self.flags & READ_REQUEST != 0
    }

    pub fn set_read_request(&mut self) {
        self.flags |= READ_REQUEST;
    }

    pub fn clear_read_request(&mut self) {
        self.flags &= !READ_REQUEST;
    }

    pub fn local_index_read(&self) -> bool {
        self.flags & LOCAL_INDEX_READ != 0
    }

    pub fn set_local_index_read(&mut self) {
        self.flags |= LOCAL_INDEX_READ;
    }

    pub fn write_lock(&self) -> bool {
        self.flags & WRITE_LOCK != 0
    }

    pub fn set_write_lock(&mut self) {
        self.flags |= WRITE_LOCK;
    }

    pub fn validation_ok(&self) -> bool {
        self.flags & VALIDATION_OK != 0
    }

    pub fn set_validation_ok(&mut self) {
        self.flags |= VALIDATION_OK;
    }

    pub fn wts_changed(&self) -> bool {
        self.flags & WTS_CHANGED != 0
    }

    pub fn set_wts_changed(&mut self) {
        self.flags |= WTS_CHANGED;
    }
}
