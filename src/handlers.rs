// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! One handler per message type, dispatched from the worker's inbound pump
//! through a dense table indexed by [PieceKind]. Request handlers perform
//! the local operation on the receiving coordinator's copy of the row and
//! append the response piece to the reply frame; response handlers settle
//! the waiting slot in the in-flight transaction identified by the echoed
//! read/write-set offset and decrement its pending count.

use crate::message::{
    AbortRequest, LockRequest, LockResponse, Piece, PieceKind, ReadValidationRequest,
    ReadValidationResponse, ReleaseLockRequest, ReplicationRequest, ReplicationResponse,
    SearchRequest, SearchResponse, WriteRequest, WriteResponse, PIECE_KINDS,
};
use crate::{meta, Error, Frame, Table, Transaction};

pub type Handler = fn(&Piece, &mut Frame, &dyn Table, &mut Transaction) -> Result<(), Error>;

/// Dispatch table; index with `piece.kind as usize`.
pub const HANDLERS: [Handler; PIECE_KINDS] = [
    search_request,
    search_response,
    lock_request,
    lock_response,
    read_validation_request,
    read_validation_response,
    abort_request,
    write_request,
    write_response,
    replication_request,
    replication_response,
    release_lock_request,
];

fn search_request(
    piece: &Piece,
    reply: &mut Frame,
    table: &dyn Table,
    _txn: &mut Transaction,
) -> Result<(), Error> {
    let req: SearchRequest = piece.decode()?;
    let (tid, value) = table.search(&req.key).read();
    reply.append(
        PieceKind::SearchResponse,
        piece.table_id,
        piece.partition_id,
        &SearchResponse {
            key_offset: req.key_offset,
            tid,
            value,
        },
    );
    Ok(())
}

fn search_response(
    piece: &Piece,
    _reply: &mut Frame,
    _table: &dyn Table,
    txn: &mut Transaction,
) -> Result<(), Error> {
    let resp: SearchResponse = piece.decode()?;
    let rk = &mut txn.read_set[resp.key_offset as usize];
    rk.set_tid(resp.tid);
    rk.set_value(resp.value);
    txn.pending_responses -= 1;
    Ok(())
}

fn lock_request(
    piece: &Piece,
    reply: &mut Frame,
    table: &dyn Table,
    _txn: &mut Transaction,
) -> Result<(), Error> {
    let req: LockRequest = piece.decode()?;
    let (tid, success) = meta::try_lock(table.search_metadata(&req.key));
    reply.append(
        PieceKind::LockResponse,
        piece.table_id,
        piece.partition_id,
        &LockResponse {
            write_offset: req.write_offset,
            tid,
            success,
        },
    );
    Ok(())
}

fn lock_response(
    piece: &Piece,
    _reply: &mut Frame,
    _table: &dyn Table,
    txn: &mut Transaction,
) -> Result<(), Error> {
    let resp: LockResponse = piece.decode()?;
    let index = resp.write_offset as usize;
    if resp.success {
        {
            let wk = &mut txn.write_set[index];
            wk.set_write_lock();
            wk.set_tid(resp.tid);
        }
        // The writer must still be holding the version it read; a wts
        // moved under it is a conflict resolved by aborting.
        let read_tid = txn
            .matching_read(index)
            .expect("write without matching read")
            .tid();
        if meta::wts(resp.tid) != meta::wts(read_tid) {
            txn.abort_lock = true;
        }
    } else {
        txn.abort_lock = true;
    }
    txn.pending_responses -= 1;
    Ok(())
}

fn read_validation_request(
    piece: &Piece,
    reply: &mut Frame,
    table: &dyn Table,
    _txn: &mut Transaction,
) -> Result<(), Error> {
    let req: ReadValidationRequest = piece.decode()?;
    let outcome = meta::validate_read(
        table.search_metadata(&req.key),
        req.snapshot,
        req.commit_ts,
    );
    reply.append(
        PieceKind::ReadValidationResponse,
        piece.table_id,
        piece.partition_id,
        &ReadValidationResponse {
            read_offset: req.read_offset,
            tid: outcome.unwrap_or(0),
            success: outcome.is_some(),
        },
    );
    Ok(())
}

fn read_validation_response(
    piece: &Piece,
    _reply: &mut Frame,
    _table: &dyn Table,
    txn: &mut Transaction,
) -> Result<(), Error> {
    let resp: ReadValidationResponse = piece.decode()?;
    if resp.success {
        let rk = &mut txn.read_set[resp.read_offset as usize];
        rk.set_validation_ok();
        if meta::wts(resp.tid) != meta::wts(rk.tid()) {
            rk.set_wts_changed();
            rk.set_tid(resp.tid);
        }
    } else {
        txn.abort_read_validation = true;
    }
    txn.pending_responses -= 1;
    Ok(())
}

fn abort_request(
    piece: &Piece,
    _reply: &mut Frame,
    table: &dyn Table,
    _txn: &mut Transaction,
) -> Result<(), Error> {
    let req: AbortRequest = piece.decode()?;
    // Only sent for records the aborting transaction holds the lock on.
    meta::release(table.search_metadata(&req.key));
    Ok(())
}

fn write_request(
    piece: &Piece,
    reply: &mut Frame,
    table: &dyn Table,
    _txn: &mut Transaction,
) -> Result<(), Error> {
    let req: WriteRequest = piece.decode()?;
    // The requester locked this row earlier in its commit; the value lands
    // under that lock, and the matching release-lock request installs the
    // new timestamps.
    table.update(&req.key, &req.value);
    reply.append(
        PieceKind::WriteResponse,
        piece.table_id,
        piece.partition_id,
        &WriteResponse,
    );
    Ok(())
}

fn write_response(
    piece: &Piece,
    _reply: &mut Frame,
    _table: &dyn Table,
    txn: &mut Transaction,
) -> Result<(), Error> {
    let _: WriteResponse = piece.decode()?;
    txn.pending_responses -= 1;
    Ok(())
}

fn replication_request(
    piece: &Piece,
    reply: &mut Frame,
    table: &dyn Table,
    _txn: &mut Transaction,
) -> Result<(), Error> {
    let req: ReplicationRequest = piece.decode()?;
    let row_meta = table.search_metadata(&req.key);
    let last = meta::lock(row_meta);
    // Replication requests for one row can arrive from different masters'
    // workers in either order; only apply a version that moves wts forward.
    if meta::wts(last) < req.commit_wts {
        table.update(&req.key, &req.value);
        meta::unlock(row_meta, req.commit_wts);
    } else {
        meta::release(row_meta);
    }
    reply.append(
        PieceKind::ReplicationResponse,
        piece.table_id,
        piece.partition_id,
        &ReplicationResponse,
    );
    Ok(())
}

fn replication_response(
    piece: &Piece,
    _reply: &mut Frame,
    _table: &dyn Table,
    txn: &mut Transaction,
) -> Result<(), Error> {
    let _: ReplicationResponse = piece.decode()?;
    txn.pending_responses -= 1;
    Ok(())
}

fn release_lock_request(
    piece: &Piece,
    _reply: &mut Frame,
    table: &dyn Table,
    _txn: &mut Transaction,
) -> Result<(), Error> {
    let req: ReleaseLockRequest = piece.decode()?;
    // Value was installed by the preceding write request on this same
    // (worker, peer) FIFO; this installs the commit timestamp and unlocks.
    meta::unlock(table.search_metadata(&req.key), req.commit_wts);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashTable;

    fn table_with(key: &[u8], value: u64) -> HashTable {
        let mut t = HashTable::new(0, 0, 8);
        t.insert(key.to_vec(), value.to_le_bytes().to_vec());
        t
    }

    fn one_piece(frame: &Frame) -> Piece {
        let pieces = frame.pieces().expect("decodes");
        assert_eq!(pieces.len(), 1);
        pieces[0].clone()
    }

    #[test]
    fn search_round_trip_fills_slot() {
        let table = table_with(&[1], 10);
        let mut txn = Transaction::new(0, 0);
        let idx = txn.search_for_read(0, 0, &[1]);
        txn.pending_responses = 1;

        let mut request = Frame::new(0, 1, 0);
        request.append(
            PieceKind::SearchRequest,
            0,
            0,
            &SearchRequest {
                key: vec![1],
                key_offset: idx as u32,
            },
        );
        let mut reply = Frame::new(1, 0, 0);
        search_request(&one_piece(&request), &mut reply, &table, &mut txn).expect("handled");
        search_response(&one_piece(&reply), &mut Frame::new(0, 1, 0), &table, &mut txn)
            .expect("handled");

        assert_eq!(txn.pending_responses, 0);
        assert_eq!(txn.read_set[idx].value(), 10u64.to_le_bytes());
    }

    #[test]
    fn lock_request_is_exclusive_and_reported() {
        let table = table_with(&[1], 10);
        let mut txn = Transaction::new(0, 0);
        let mut request = Frame::new(0, 1, 0);
        request.append(
            PieceKind::LockRequest,
            0,
            0,
            &LockRequest {
                key: vec![1],
                write_offset: 0,
            },
        );
        let piece = one_piece(&request);

        let mut reply = Frame::new(1, 0, 0);
        lock_request(&piece, &mut reply, &table, &mut txn).expect("handled");
        let first: LockResponse = one_piece(&reply).decode().expect("payload");
        assert!(first.success);

        let mut reply = Frame::new(1, 0, 0);
        lock_request(&piece, &mut reply, &table, &mut txn).expect("handled");
        let second: LockResponse = one_piece(&reply).decode().expect("payload");
        assert!(!second.success);
    }

    #[test]
    fn failed_lock_response_flags_abort() {
        let table = table_with(&[1], 10);
        let mut txn = Transaction::new(0, 0);
        txn.search_for_read(0, 0, &[1]);
        txn.update(0, 0, &[1], vec![0; 8]);
        txn.pending_responses = 1;

        let mut frame = Frame::new(1, 0, 0);
        frame.append(
            PieceKind::LockResponse,
            0,
            0,
            &LockResponse {
                write_offset: 0,
                tid: 0,
                success: false,
            },
        );
        lock_response(&one_piece(&frame), &mut Frame::new(0, 1, 0), &table, &mut txn)
            .expect("handled");
        assert!(txn.abort_lock);
        assert_eq!(txn.pending_responses, 0);
    }

    #[test]
    fn stale_replication_is_not_applied() {
        let table = table_with(&[1], 10);
        meta::unlock(table.search_metadata(&[1]), 9);

        let mut txn = Transaction::new(0, 0);
        let mut frame = Frame::new(1, 0, 0);
        frame.append(
            PieceKind::ReplicationRequest,
            0,
            0,
            &ReplicationRequest {
                key: vec![1],
                value: 77u64.to_le_bytes().to_vec(),
                commit_wts: 5,
            },
        );
        let mut reply = Frame::new(0, 1, 0);
        replication_request(&one_piece(&frame), &mut reply, &table, &mut txn).expect("handled");

        let (word, value) = table.search(&[1]).read();
        assert_eq!(meta::wts(word), 9);
        assert_eq!(value, 10u64.to_le_bytes());
        // Still acked, so the writer's pending count drains.
        assert_eq!(one_piece(&reply).kind, PieceKind::ReplicationResponse);
    }

    #[test]
    fn fresh_replication_is_applied() {
        let table = table_with(&[1], 10);
        let mut txn = Transaction::new(0, 0);
        let mut frame = Frame::new(1, 0, 0);
        frame.append(
            PieceKind::ReplicationRequest,
            0,
            0,
            &ReplicationRequest {
                key: vec![1],
                value: 77u64.to_le_bytes().to_vec(),
                commit_wts: 5,
            },
        );
        let mut reply = Frame::new(0, 1, 0);
        replication_request(&one_piece(&frame), &mut reply, &table, &mut txn).expect("handled");

        let (word, value) = table.search(&[1]).read();
        assert_eq!(meta::wts(word), 5);
        assert_eq!(value, 77u64.to_le_bytes());
    }
}
