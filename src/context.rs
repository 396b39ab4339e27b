// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Bootstrap configuration. Immutable after construction; shared by
//! reference everywhere. Process-wide state lives here and in
//! [crate::Metrics] and nowhere else.

#[derive(Clone, Debug)]
pub struct Context {
    /// Total partitions across the whole fleet.
    pub partition_num: usize,
    /// Number of coordinator nodes.
    pub coordinator_num: usize,
    /// Worker threads per coordinator.
    pub worker_num: usize,
    /// Copies of each partition, master included.
    pub replica_num: usize,
    /// Capacity of each SPSC frame queue.
    pub queue_depth: usize,
}

impl Context {
    pub fn new(partition_num: usize, coordinator_num: usize, worker_num: usize) -> Self {
        Context {
            partition_num,
            coordinator_num,
            worker_num,
            replica_num: 1,
            queue_depth: 1024,
        }
    }

    pub fn with_replicas(mut self, replica_num: usize) -> Self {
        assert!(replica_num >= 1 && replica_num <= self.coordinator_num);
        self.replica_num = replica_num;
        self
    }

    /// Partitions mastered by each coordinator. The partition count must
    /// divide evenly; uneven layouts are a bootstrap error.
    pub fn partitions_per_coordinator(&self) -> usize {
        assert!(self.partition_num % self.coordinator_num == 0);
        self.partition_num / self.coordinator_num
    }
}
