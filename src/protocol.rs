// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The commit protocol: a timestamp-ordered optimistic two-phase commit
//! over the transaction's read and write sets, extended to remote masters
//! and replicas by message passing.
//!
//! Phases run strictly in order:
//!
//!   1. _Lock_ the write set, in insertion order, master by master.
//!      Deadlock is not prevented; a lost try-lock aborts the transaction
//!      and the loser retries with its generation seed reinstated.
//!   2. _Compute_ the commit timestamps from the sets' metadata snapshots:
//!      `commit_rts = max(wts of reads)`,
//!      `commit_wts = max(commit_rts, max(rts of writes) + 1)`.
//!   3. _Validate_ every read not covered by the write set at `commit_wts`,
//!      extending read leases (or accepting a permissible wts advance)
//!      locally or via the partition master.
//!   4. _Write and replicate_: install values at the masters and ship every
//!      committed version to the partition's replicas.
//!   5. _Release_ the write locks, stamping the new versions with
//!      `commit_wts`. Fire-and-forget.
//!
//! Phases that emit requests flush the outbox and then pump the inbound
//! queue until every response has arrived, so two workers committing into
//! each other's partitions serve each other while they wait.

use crate::message::{
    AbortRequest, LockRequest, PieceKind, ReadValidationRequest, ReleaseLockRequest,
    ReplicationRequest, WriteRequest,
};
use crate::{meta, Conduit, Error, Transaction};
use tracing::debug;

/// Drive `txn` through the commit protocol. `Ok(false)` is an abort with
/// the reason flagged on the transaction and every acquired lock released;
/// `Ok(true)` is a durable-in-memory commit with all replicas notified.
pub fn commit(txn: &mut Transaction, link: &mut Conduit<'_>) -> Result<bool, Error> {
    for i in 0..txn.write_set.len() {
        assert!(txn.matching_read(i).is_some(), "write without matching read");
    }

    if lock_write_set(txn, link)? {
        abort(txn, link)?;
        return Ok(false);
    }

    compute_commit_ts(txn);

    if !validate_read_set(txn, link)? {
        abort(txn, link)?;
        return Ok(false);
    }

    write_and_replicate(txn, link)?;
    release_locks(txn, link)?;
    Ok(true)
}

/// Returns true if the transaction must abort.
fn lock_write_set(txn: &mut Transaction, link: &mut Conduit<'_>) -> Result<bool, Error> {
    for i in 0..txn.write_set.len() {
        let (table_id, partition_id) = {
            let wk = &txn.write_set[i];
            (wk.table_id(), wk.partition_id())
        };
        if link.partitioner.has_master_partition(partition_id) {
            let table = link.db.find_table(table_id, partition_id)?;
            let (latest, ok) = meta::try_lock(table.search_metadata(txn.write_set[i].key()));
            if !ok {
                txn.abort_lock = true;
                break;
            }
            {
                let wk = &mut txn.write_set[i];
                wk.set_write_lock();
                wk.set_tid(latest);
            }
            // A wts that moved since we read this record means another
            // writer committed in between; the lock is ours but the read
            // is already stale.
            let read_tid = txn.matching_read(i).expect("checked above").tid();
            if meta::wts(latest) != meta::wts(read_tid) {
                txn.abort_lock = true;
                break;
            }
        } else {
            let master = link.partitioner.master_coordinator(partition_id);
            let request = LockRequest {
                key: txn.write_set[i].key().to_vec(),
                write_offset: i as u32,
            };
            txn.pending_responses += 1;
            txn.network_size +=
                link.post(master, PieceKind::LockRequest, table_id, partition_id, &request);
        }
    }

    sync(txn, link, true)?;

    if txn.abort_lock {
        debug!(partition = txn.partition_id, "lock conflict, aborting");
    }
    Ok(txn.abort_lock)
}

fn compute_commit_ts(txn: &mut Transaction) {
    let mut ts = 0;
    for rk in &txn.read_set {
        ts = ts.max(meta::wts(rk.tid()));
    }
    txn.commit_rts = ts;

    for wk in &txn.write_set {
        ts = ts.max(meta::rts(wk.tid()) + 1);
    }
    txn.commit_wts = ts;
}

/// Returns true if every read validated.
fn validate_read_set(txn: &mut Transaction, link: &mut Conduit<'_>) -> Result<bool, Error> {
    let commit_ts = txn.commit_wts;

    for i in 0..txn.read_set.len() {
        if txn.read_set[i].local_index_read() {
            continue;
        }
        // Reads covered by the write set were validated by the lock sweep's
        // wts check, under a lock we hold.
        let in_write_set = {
            let rk = &txn.read_set[i];
            txn.write_set.iter().any(|wk| wk.same_record(rk))
        };
        if in_write_set {
            continue;
        }

        let (table_id, partition_id, snapshot) = {
            let rk = &txn.read_set[i];
            (rk.table_id(), rk.partition_id(), rk.tid())
        };
        debug_assert!(!meta::is_locked(snapshot));

        if link.partitioner.has_master_partition(partition_id) {
            let table = link.db.find_table(table_id, partition_id)?;
            let row_meta = table.search_metadata(txn.read_set[i].key());
            match meta::validate_read(row_meta, snapshot, commit_ts) {
                Some(word) => {
                    let rk = &mut txn.read_set[i];
                    rk.set_validation_ok();
                    if meta::wts(word) != meta::wts(snapshot) {
                        debug_assert!(meta::wts(word) > meta::wts(snapshot));
                        rk.set_wts_changed();
                        rk.set_tid(word);
                    }
                }
                None => {
                    txn.abort_read_validation = true;
                    break;
                }
            }
        } else {
            let master = link.partitioner.master_coordinator(partition_id);
            let request = ReadValidationRequest {
                key: txn.read_set[i].key().to_vec(),
                read_offset: i as u32,
                snapshot,
                commit_ts,
            };
            txn.pending_responses += 1;
            txn.network_size += link.post(
                master,
                PieceKind::ReadValidationRequest,
                table_id,
                partition_id,
                &request,
            );
        }
    }

    sync(txn, link, true)?;

    if txn.abort_read_validation {
        debug!(
            partition = txn.partition_id,
            commit_wts = txn.commit_wts,
            "read validation failed, aborting"
        );
    }
    Ok(!txn.abort_read_validation)
}

fn write_and_replicate(txn: &mut Transaction, link: &mut Conduit<'_>) -> Result<(), Error> {
    let commit_wts = txn.commit_wts;

    for i in 0..txn.write_set.len() {
        let (table_id, partition_id) = {
            let wk = &txn.write_set[i];
            (wk.table_id(), wk.partition_id())
        };
        let table = link.db.find_table(table_id, partition_id)?;
        let master = link.partitioner.master_coordinator(partition_id);

        // Primary write.
        if link.partitioner.has_master_partition(partition_id) {
            let wk = &txn.write_set[i];
            table.update(wk.key(), wk.value());
        } else {
            let request = WriteRequest {
                key: txn.write_set[i].key().to_vec(),
                value: txn.write_set[i].value().to_vec(),
            };
            txn.pending_responses += 1;
            txn.network_size +=
                link.post(master, PieceKind::WriteRequest, table_id, partition_id, &request);
        }

        // Ship the version to every replica of the partition.
        let mut replicated = 0;
        for k in 0..link.partitioner.total_coordinators() {
            if !link.partitioner.is_partition_replicated_on(partition_id, k) || k == master {
                continue;
            }
            replicated += 1;

            if k == link.coordinator_id {
                let wk = &txn.write_set[i];
                let row_meta = table.search_metadata(wk.key());
                let last = meta::lock(row_meta);
                assert!(meta::wts(last) < commit_wts);
                table.update(wk.key(), wk.value());
                meta::unlock(row_meta, commit_wts);
            } else {
                let request = ReplicationRequest {
                    key: txn.write_set[i].key().to_vec(),
                    value: txn.write_set[i].value().to_vec(),
                    commit_wts,
                };
                txn.pending_responses += 1;
                txn.network_size += link.post(
                    k,
                    PieceKind::ReplicationRequest,
                    table_id,
                    partition_id,
                    &request,
                );
            }
        }
        assert_eq!(replicated, link.partitioner.replica_num() - 1);
    }

    sync(txn, link, true)
}

fn release_locks(txn: &mut Transaction, link: &mut Conduit<'_>) -> Result<(), Error> {
    let commit_wts = txn.commit_wts;

    for i in 0..txn.write_set.len() {
        let (table_id, partition_id) = {
            let wk = &txn.write_set[i];
            (wk.table_id(), wk.partition_id())
        };
        if link.partitioner.has_master_partition(partition_id) {
            let table = link.db.find_table(table_id, partition_id)?;
            let wk = &txn.write_set[i];
            table.update(wk.key(), wk.value());
            meta::unlock(table.search_metadata(wk.key()), commit_wts);
        } else {
            let master = link.partitioner.master_coordinator(partition_id);
            let request = ReleaseLockRequest {
                key: txn.write_set[i].key().to_vec(),
                commit_wts,
            };
            txn.network_size += link.post(
                master,
                PieceKind::ReleaseLockRequest,
                table_id,
                partition_id,
                &request,
            );
        }
    }

    sync(txn, link, false)
}

/// Undo the lock phase: unlock every record this transaction managed to
/// lock, locally or by telling the remote master. Fire-and-forget.
fn abort(txn: &mut Transaction, link: &mut Conduit<'_>) -> Result<(), Error> {
    for i in 0..txn.write_set.len() {
        if !txn.write_set[i].write_lock() {
            continue;
        }
        let (table_id, partition_id) = {
            let wk = &txn.write_set[i];
            (wk.table_id(), wk.partition_id())
        };
        if link.partitioner.has_master_partition(partition_id) {
            let table = link.db.find_table(table_id, partition_id)?;
            meta::release(table.search_metadata(txn.write_set[i].key()));
        } else {
            let master = link.partitioner.master_coordinator(partition_id);
            let request = AbortRequest {
                key: txn.write_set[i].key().to_vec(),
            };
            txn.network_size +=
                link.post(master, PieceKind::AbortRequest, table_id, partition_id, &request);
        }
    }

    sync(txn, link, false)
}

/// Flush the outbox, then (when responses are expected) pump until every
/// one has arrived. The pump serves other workers' requests while this
/// transaction waits, which is what keeps cross-partition commits from
/// deadlocking on each other's attention.
fn sync(txn: &mut Transaction, link: &mut Conduit<'_>, wait: bool) -> Result<(), Error> {
    link.flush()?;
    if wait {
        while txn.pending_responses > 0 {
            link.pump(txn)?;
        }
    }
    debug_assert!(!wait || txn.pending_responses == 0);
    Ok(())
}
