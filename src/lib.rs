// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This is the transaction execution and commit core of a partitioned,
//! replicated, in-memory OLTP database. It strives to be as small and
//! direct as possible while carrying the parts that are actually hard:
//!
//!   - Serializable optimistic commit, ordered by per-record logical
//!     timestamps rather than a global clock or sequencer.
//!
//!   - Distributed writes: a transaction may read and write records whose
//!     master copies live on other coordinators, driven entirely by typed
//!     messages.
//!
//!   - Synchronous replication of committed versions to every replica of a
//!     partition before locks are released.
//!
//!   - Cooperative workers: a worker waiting on remote responses serves
//!     other workers' requests instead of blocking, so the fleet needs no
//!     OS blocking primitive anywhere on the commit path.
//!
//! ## Summary
//!
//! The short version of the protocol is:
//!
//!   - Each record carries one atomic 64-bit word packing a write-lock bit,
//!     a read timestamp (rts) and a write timestamp (wts). The pair
//!     `[wts, rts]` is a lease: the stored version is known-valid for reads
//!     anywhere in that window ([meta]).
//!
//!   - A transaction executes against a read set and a write set of
//!     [RwKey]s, reading record values and metadata snapshots as it goes
//!     ([Transaction], [Workload]).
//!
//!   - At commit, the worker locks the write set (aborting on conflict
//!     rather than waiting), picks `commit_wts` just past every lease it
//!     read or is about to overwrite, validates that each read is still
//!     current at `commit_wts` (extending leases where possible), then
//!     writes, replicates, and releases ([protocol]).
//!
//!   - Records mastered elsewhere get the same treatment via request
//!     pieces to their master's worker, which answers from a dense handler
//!     table; responses settle slots in the waiting transaction
//!     ([Frame], [HANDLERS]).
//!
//!   - Each worker thread runs one [Executor]: generate, execute, commit,
//!     and on abort retry with the generation seed reinstated so the
//!     replay is byte-identical. Between and during attempts it drains its
//!     inbound queue, which is the only way remote requests are ever
//!     served.
//!
//! ## Caveats
//!
//!   - This is a core, not a database. Durability, recovery, secondary
//!     indexes, schema and SQL all live elsewhere or nowhere. Tables are
//!     hash-indexed rows with point lookup only ([Table], [HashTable]).
//!
//!   - The socket layer between coordinators is not here either: the core
//!     exposes bounded SPSC queues of addressed [Frame]s and assumes
//!     something reliable moves them ([Executor::in_queue],
//!     [Executor::out_queue]).
//!
//!   - Timestamps are packed into 32 (wts) and 31 (rts) bits; overflow is
//!     not handled.
//!
//! ## Name
//!
//! Wikipedia:
//!
//! > A gnomon (from Greek γνώμων, gnōmōn, 'one that knows or examines') is
//! > the part of a sundial that casts a shadow.
//!
//! The engine tells time the same way: nothing here owns a clock, the
//! ordering of commits is read off the shadows the records themselves
//! cast.

use thiserror::Error;

/// Faults that cross the library boundary. Transaction aborts are not
/// errors (they are flags on the [Transaction] and a retry); these are the
/// conditions under which a worker cannot meaningfully continue.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown message type tag {0}")]
    UnknownPieceKind(u16),
    #[error("frame buffer ends mid-piece")]
    TruncatedFrame,
    #[error("piece payload codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame header codec: {0}")]
    Header(#[from] std::io::Error),
    #[error("no table {table_id} for partition {partition_id}")]
    UnknownTable {
        table_id: usize,
        partition_id: usize,
    },
    #[error("out-queue to coordinator {0} is full")]
    QueueFull(usize),
}

mod context;
mod database;
mod executor;
mod handlers;
mod message;
pub mod meta;
mod metrics;
mod partitioner;
pub mod protocol;
mod random;
mod rwkey;
mod table;
mod transaction;
mod workload;

pub use context::Context;
pub use database::Database;
pub use executor::{Conduit, Executor, FrameQueue};
pub use handlers::{Handler, HANDLERS};
pub use message::{Frame, Piece, PieceKind, PIECE_KINDS};
pub use metrics::{Metrics, Percentile};
pub use partitioner::{HashReplicated, Partitioner};
pub use random::Random;
pub use rwkey::RwKey;
pub use table::{HashTable, Row, Table};
pub use transaction::{Transaction, TransactionResult};
pub use workload::Workload;
