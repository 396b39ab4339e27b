// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! One [Executor] per worker thread. Each executor owns exactly one
//! in-flight transaction, one open outbound [Frame] per peer coordinator,
//! and the pair of bounded SPSC queues it shares with the socket layer.
//! Workers never block on one another: whenever a transaction is waiting
//! for remote responses it repeatedly runs the inbound pump, which is also
//! the only way remote workers' requests get served here. Forward progress
//! of the whole fleet therefore rides on every wait being a pumping wait.
//!
//! The [Conduit] is the borrowed capability handed to workload execution
//! and the commit protocol: the worker's tables, partitioner, outbox and
//! queues bundled together, so the transaction side never holds a
//! reference to the executor itself. Custom drivers (phase executors,
//! test harnesses) can build one directly and drive
//! [crate::protocol::commit] by hand.

use crate::handlers::HANDLERS;
use crate::message::{PieceKind, SearchRequest};
use crate::{
    protocol, Context, Database, Error, Frame, Metrics, Partitioner, Percentile, Random,
    Transaction, TransactionResult, Workload,
};
use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub type FrameQueue = ArrayQueue<Frame>;

pub struct Conduit<'a> {
    pub coordinator_id: usize,
    pub worker_id: usize,
    pub db: &'a Database,
    pub partitioner: &'a dyn Partitioner,
    outbox: &'a mut Vec<Frame>,
    out_queue: &'a FrameQueue,
    in_queue: &'a FrameQueue,
}

impl<'a> Conduit<'a> {
    pub fn new(
        coordinator_id: usize,
        worker_id: usize,
        db: &'a Database,
        partitioner: &'a dyn Partitioner,
        outbox: &'a mut Vec<Frame>,
        out_queue: &'a FrameQueue,
        in_queue: &'a FrameQueue,
    ) -> Self {
        assert_eq!(outbox.len(), partitioner.total_coordinators());
        Conduit {
            coordinator_id,
            worker_id,
            db,
            partitioner,
            outbox,
            out_queue,
            in_queue,
        }
    }

    /// Append a piece to the open frame for `dest`; returns bytes added.
    pub fn post<P: Serialize>(
        &mut self,
        dest: usize,
        kind: PieceKind,
        table_id: usize,
        partition_id: usize,
        payload: &P,
    ) -> usize {
        debug_assert_ne!(dest, self.coordinator_id);
        self.outbox[dest].append(kind, table_id, partition_id, payload)
    }

    /// Serve one read-set entry. A locally-mastered (or local-index) read
    /// is answered synchronously from the table and returns the observed
    /// metadata word; anything else becomes a search request to the
    /// partition's master and returns 0, to be settled by the response
    /// handler while the transaction pumps.
    pub fn read_one(&mut self, txn: &mut Transaction, index: usize) -> Result<u64, Error> {
        let (table_id, partition_id) = {
            let rk = &txn.read_set[index];
            (rk.table_id(), rk.partition_id())
        };
        if self.partitioner.has_master_partition(partition_id)
            || txn.read_set[index].local_index_read()
        {
            let table = self.db.find_table(table_id, partition_id)?;
            let (word, value) = table.search(txn.read_set[index].key()).read();
            let rk = &mut txn.read_set[index];
            rk.set_tid(word);
            rk.set_value(value);
            Ok(word)
        } else {
            let master = self.partitioner.master_coordinator(partition_id);
            let request = SearchRequest {
                key: txn.read_set[index].key().to_vec(),
                key_offset: index as u32,
            };
            txn.network_size += self.post(
                master,
                PieceKind::SearchRequest,
                table_id,
                partition_id,
                &request,
            );
            txn.pending_responses += 1;
            Ok(0)
        }
    }

    /// Hand every non-empty outbound frame to the out-queue, replacing it
    /// with a fresh one. A full queue means the socket layer has fallen
    /// behind the configured depth, which the core cannot recover from.
    pub fn flush(&mut self) -> Result<(), Error> {
        for dest in 0..self.outbox.len() {
            if dest == self.coordinator_id || self.outbox[dest].is_empty() {
                continue;
            }
            let frame = std::mem::replace(
                &mut self.outbox[dest],
                Frame::new(self.coordinator_id, dest, self.worker_id),
            );
            self.out_queue
                .push(frame)
                .map_err(|_| Error::QueueFull(dest))?;
        }
        Ok(())
    }

    /// Drain the inbound queue, dispatching every piece through the handler
    /// table. Replies are appended to the frame for the piece's source and
    /// flushed as each inbound frame completes, so a peer spinning on its
    /// own pump sees them promptly. Returns the number of pieces served.
    pub fn pump(&mut self, txn: &mut Transaction) -> Result<usize, Error> {
        let mut served = 0;
        while let Some(frame) = self.in_queue.pop() {
            debug_assert_eq!(frame.dest(), self.coordinator_id);
            for piece in frame.pieces()? {
                let table = self.db.find_table(piece.table_id, piece.partition_id)?;
                let reply = &mut self.outbox[frame.source()];
                HANDLERS[piece.kind as usize](&piece, reply, table, txn)?;
                served += 1;
            }
            self.flush()?;
        }
        Ok(served)
    }
}

pub struct Executor<W: Workload> {
    coordinator_id: usize,
    worker_id: usize,
    context: Context,
    db: Arc<Database>,
    partitioner: Arc<dyn Partitioner>,
    workload: W,
    random: Random,
    metrics: Arc<Metrics>,
    stop: Arc<AtomicBool>,
    in_queue: Arc<FrameQueue>,
    out_queue: Arc<FrameQueue>,
    outbox: Vec<Frame>,
    latency: Percentile,
}

impl<W: Workload> Executor<W> {
    pub fn new(
        coordinator_id: usize,
        worker_id: usize,
        context: Context,
        db: Arc<Database>,
        partitioner: Arc<dyn Partitioner>,
        workload: W,
        metrics: Arc<Metrics>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let outbox = (0..context.coordinator_num)
            .map(|dest| Frame::new(coordinator_id, dest, worker_id))
            .collect();
        let in_queue = Arc::new(ArrayQueue::new(context.queue_depth));
        let out_queue = Arc::new(ArrayQueue::new(context.queue_depth));
        // Seed workers apart so they don't all draw the same partitions.
        let random = Random::new((coordinator_id as u64) << 32 | (worker_id as u64 + 1));
        Executor {
            coordinator_id,
            worker_id,
            context,
            db,
            partitioner,
            workload,
            random,
            metrics,
            stop,
            in_queue,
            out_queue,
            outbox,
            latency: Percentile::new(),
        }
    }

    /// The queue the socket layer pushes inbound frames onto.
    pub fn in_queue(&self) -> Arc<FrameQueue> {
        self.in_queue.clone()
    }

    /// The queue the socket layer drains outbound frames from.
    pub fn out_queue(&self) -> Arc<FrameQueue> {
        self.out_queue.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// The worker's main loop: generate, execute, commit, retry, while
    /// cooperatively serving remote requests between attempts. Runs until
    /// the stop flag is raised; an in-flight transaction always runs to
    /// commit or abort first.
    pub fn start(&mut self) -> Result<(), Error> {
        info!(
            coordinator = self.coordinator_id,
            worker = self.worker_id,
            "executor starts"
        );

        let mut txn = Transaction::new(self.coordinator_id, 0);
        let mut retry = false;
        let mut attempt_seed = self.random.seed();

        while !self.stop.load(Ordering::Relaxed) {
            retry = self.attempt(&mut txn, retry, &mut attempt_seed)?;
        }

        // One parting drain so peers mid-commit against our partitions
        // aren't left waiting on requests that already reached our queue.
        self.process_inbox(&mut txn)?;

        info!(
            coordinator = self.coordinator_id,
            worker = self.worker_id,
            "executor exits"
        );
        self.report();
        Ok(())
    }

    /// Run exactly `n` transactions to completion, retrying each through
    /// protocol aborts until it commits or the workload abandons it. The
    /// bounded twin of [Executor::start], for drivers that own their own
    /// pacing.
    pub fn run_queries(&mut self, n: usize) -> Result<(), Error> {
        let mut txn = Transaction::new(self.coordinator_id, 0);
        let mut attempt_seed = self.random.seed();
        for _ in 0..n {
            let mut retry = false;
            loop {
                retry = self.attempt(&mut txn, retry, &mut attempt_seed)?;
                if !retry {
                    break;
                }
            }
        }
        self.process_inbox(&mut txn)?;
        Ok(())
    }

    /// One attempt of one transaction; returns whether the same transaction
    /// must be retried.
    fn attempt(
        &mut self,
        txn: &mut Transaction,
        retry: bool,
        attempt_seed: &mut u64,
    ) -> Result<bool, Error> {
        let Self {
            coordinator_id,
            worker_id,
            ref context,
            ref db,
            ref partitioner,
            ref workload,
            ref mut random,
            ref metrics,
            ref in_queue,
            ref out_queue,
            ref mut outbox,
            ref mut latency,
            ..
        } = *self;
        let mut link = Conduit {
            coordinator_id,
            worker_id,
            db: &**db,
            partitioner: &**partitioner,
            outbox,
            out_queue: &**out_queue,
            in_queue: &**in_queue,
        };

        link.pump(txn)?;

        // Reinstating the seed saved before the aborted attempt makes the
        // partition draw and the workload's query generation replay
        // identically.
        if retry {
            random.set_seed(*attempt_seed);
            txn.reset();
        } else {
            *attempt_seed = random.seed();
        }

        let per_node = context.partitions_per_coordinator();
        let partition_id = random.uniform(0, per_node as u64 - 1) as usize
            * context.coordinator_num
            + coordinator_id;
        if !retry {
            *txn = Transaction::new(coordinator_id, partition_id);
        }
        debug_assert_eq!(txn.partition_id, partition_id);

        let query = workload.generate(context, partition_id, random);
        let result = workload.execute(&query, txn, &mut link)?;

        match result {
            TransactionResult::ReadyToCommit => {
                let committed = protocol::commit(txn, &mut link)?;
                metrics
                    .n_network_size
                    .fetch_add(txn.network_size as u64, Ordering::Relaxed);
                if committed {
                    metrics.n_commit.fetch_add(1, Ordering::Relaxed);
                    let micros = txn.start.elapsed().as_micros() as u64;
                    latency.add(micros);
                    metrics.observe_latency_micros(micros);
                    Ok(false)
                } else if txn.abort_lock {
                    metrics.n_abort_lock.fetch_add(1, Ordering::Relaxed);
                    Ok(true)
                } else {
                    debug_assert!(txn.abort_read_validation);
                    metrics
                        .n_abort_read_validation
                        .fetch_add(1, Ordering::Relaxed);
                    Ok(true)
                }
            }
            TransactionResult::Abort | TransactionResult::AbortNoRetry => {
                debug!(
                    coordinator = coordinator_id,
                    worker = worker_id,
                    "workload abandoned transaction"
                );
                metrics.n_abort_no_retry.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        }
    }

    /// Serve remote requests without driving transactions of our own, for
    /// workers that only host data during a round. Runs until the stop
    /// flag, with a final drain.
    pub fn serve(&mut self) -> Result<(), Error> {
        let mut scratch = Transaction::new(self.coordinator_id, 0);
        while !self.stop.load(Ordering::Relaxed) {
            if self.process_inbox(&mut scratch)? == 0 {
                std::thread::yield_now();
            }
        }
        self.process_inbox(&mut scratch)?;
        Ok(())
    }

    /// One pass of the inbound pump on behalf of `txn`.
    pub fn process_inbox(&mut self, txn: &mut Transaction) -> Result<usize, Error> {
        let Self {
            coordinator_id,
            worker_id,
            ref db,
            ref partitioner,
            ref in_queue,
            ref out_queue,
            ref mut outbox,
            ..
        } = *self;
        let mut link = Conduit {
            coordinator_id,
            worker_id,
            db: &**db,
            partitioner: &**partitioner,
            outbox,
            out_queue: &**out_queue,
            in_queue: &**in_queue,
        };
        link.pump(txn)
    }

    fn report(&mut self) {
        info!(
            coordinator = self.coordinator_id,
            worker = self.worker_id,
            commits = self.latency.size(),
            p50_us = self.latency.nth(50.0),
            p75_us = self.latency.nth(75.0),
            p95_us = self.latency.nth(95.0),
            p99_us = self.latency.nth(99.0),
            p999_us = self.latency.nth(99.9),
            "commit latency"
        );
    }
}
