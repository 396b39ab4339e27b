// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A Transaction is the read/write-set container one worker drives from
//! generation to commit or abort. It holds no behavior of its own beyond
//! set bookkeeping: the workload decides what to access, the commit
//! protocol decides what the sets mean, and everything that touches tables
//! or peers goes through the worker's [Conduit] capability, which the
//! transaction borrows only for the duration of each call.

use crate::{Conduit, Error, RwKey};
use std::time::Instant;

/// What the workload's execute step asks the executor to do next. `Abort`
/// and `AbortNoRetry` are both application aborts; neither is retried by
/// the executor (retry is reserved for protocol aborts, which replay the
/// same generation seed).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionResult {
    ReadyToCommit,
    Abort,
    AbortNoRetry,
}

pub struct Transaction {
    pub coordinator_id: usize,
    pub partition_id: usize,
    /// First-attempt start instant; preserved across retries so the
    /// recorded commit latency is end-to-end.
    pub start: Instant,
    pub read_set: Vec<RwKey>,
    pub write_set: Vec<RwKey>,
    /// Outstanding remote requests this transaction is waiting on.
    pub pending_responses: usize,
    pub abort_lock: bool,
    pub abort_read_validation: bool,
    pub commit_rts: u64,
    pub commit_wts: u64,
    /// Bytes of protocol traffic this transaction has emitted.
    pub network_size: usize,
}

impl Transaction {
    pub fn new(coordinator_id: usize, partition_id: usize) -> Self {
        Transaction {
            coordinator_id,
            partition_id,
            start: Instant::now(),
            read_set: Vec::new(),
            write_set: Vec::new(),
            pending_responses: 0,
            abort_lock: false,
            abort_read_validation: false,
            commit_rts: 0,
            commit_wts: 0,
            network_size: 0,
        }
    }

    /// Clear per-attempt state for a retry. The start instant survives;
    /// the executor reinstates the generation seed separately.
    pub fn reset(&mut self) {
        self.read_set.clear();
        self.write_set.clear();
        self.pending_responses = 0;
        self.abort_lock = false;
        self.abort_read_validation = false;
        self.commit_rts = 0;
        self.commit_wts = 0;
        self.network_size = 0;
    }

    /// Declare a read. The value is filled in later by
    /// [Transaction::process_requests]; returns the read-set index to fetch
    /// it back with.
    pub fn search_for_read(&mut self, table_id: usize, partition_id: usize, key: &[u8]) -> usize {
        let mut rk = RwKey::new(table_id, partition_id, key.to_vec());
        rk.set_read_request();
        self.read_set.push(rk);
        self.read_set.len() - 1
    }

    /// Declare a read against a local index. Served locally regardless of
    /// mastership and skipped during read validation.
    pub fn search_local_index(&mut self, table_id: usize, partition_id: usize, key: &[u8]) -> usize {
        let mut rk = RwKey::new(table_id, partition_id, key.to_vec());
        rk.set_read_request();
        rk.set_local_index_read();
        self.read_set.push(rk);
        self.read_set.len() - 1
    }

    /// Declare a write. Every write must be preceded by a read of the same
    /// record in the same attempt.
    pub fn update(&mut self, table_id: usize, partition_id: usize, key: &[u8], value: Vec<u8>) -> usize {
        let mut wk = RwKey::new(table_id, partition_id, key.to_vec());
        wk.set_value(value);
        self.write_set.push(wk);
        self.write_set.len() - 1
    }

    /// The value bytes of a completed read.
    pub fn read_value(&self, index: usize) -> &[u8] {
        let rk = &self.read_set[index];
        debug_assert!(!rk.read_request(), "read {} not processed yet", index);
        rk.value()
    }

    /// The read-set entry covering the same record as `write_set[index]`,
    /// if any. Matched by (table, partition, key bytes).
    pub fn matching_read(&self, index: usize) -> Option<&RwKey> {
        let wk = &self.write_set[index];
        self.read_set.iter().find(|rk| rk.same_record(wk))
    }

    /// Run the read path over every read-set entry still flagged pending,
    /// then flush and cooperatively drain until all remote reads have
    /// answered. On return every read's value and snapshot tid are
    /// populated.
    pub fn process_requests(&mut self, link: &mut Conduit<'_>) -> Result<(), Error> {
        for i in 0..self.read_set.len() {
            if !self.read_set[i].read_request() {
                continue;
            }
            link.read_one(self, i)?;
            self.read_set[i].clear_read_request();
        }
        link.flush()?;
        while self.pending_responses > 0 {
            link.pump(self)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_append_in_order() {
        let mut txn = Transaction::new(0, 3);
        assert_eq!(txn.search_for_read(0, 3, &[1]), 0);
        assert_eq!(txn.search_local_index(1, 3, &[2]), 1);
        assert_eq!(txn.update(0, 3, &[1], vec![9]), 0);
        assert!(txn.read_set[0].read_request());
        assert!(!txn.read_set[0].local_index_read());
        assert!(txn.read_set[1].local_index_read());
        assert_eq!(txn.write_set[0].value(), &[9]);
    }

    #[test]
    fn matching_read_is_by_record_not_index() {
        let mut txn = Transaction::new(0, 0);
        txn.search_for_read(0, 0, &[7]);
        txn.search_for_read(0, 0, &[8]);
        txn.update(0, 0, &[8], vec![0]);
        let rk = txn.matching_read(0).expect("read exists");
        assert_eq!(rk.key(), &[8]);
        txn.update(0, 1, &[8], vec![0]);
        assert!(txn.matching_read(1).is_none());
    }

    #[test]
    fn reset_clears_attempt_state_but_not_start() {
        let mut txn = Transaction::new(0, 0);
        txn.search_for_read(0, 0, &[1]);
        txn.update(0, 0, &[1], vec![2]);
        txn.pending_responses = 0;
        txn.abort_lock = true;
        txn.commit_wts = 9;
        txn.network_size = 40;
        let start = txn.start;
        txn.reset();
        assert!(txn.read_set.is_empty());
        assert!(txn.write_set.is_empty());
        assert!(!txn.abort_lock);
        assert_eq!(txn.commit_wts, 0);
        assert_eq!(txn.network_size, 0);
        assert_eq!(txn.start, start);
    }
}
