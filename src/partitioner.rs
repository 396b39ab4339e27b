// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Which coordinator masters which partition, and who keeps replicas.
//! The commit protocol consults this on every record access; it must be
//! pure arithmetic over the configured layout, identical on every node.

pub trait Partitioner: Send + Sync {
    /// True if the calling coordinator is the master of `partition`.
    fn has_master_partition(&self, partition: usize) -> bool;

    /// The coordinator authoritative for writes to `partition`.
    fn master_coordinator(&self, partition: usize) -> usize;

    /// True if coordinator `k` holds a copy of `partition` (as master or
    /// replica).
    fn is_partition_replicated_on(&self, partition: usize, k: usize) -> bool;

    fn replica_num(&self) -> usize;

    fn total_coordinators(&self) -> usize;
}

/// Round-robin mastership with the `replica_num - 1` following coordinators
/// holding replicas: partition `p` is mastered by `p % n` and replicated on
/// `p % n + 1 .. p % n + replica_num` (mod n).
pub struct HashReplicated {
    coordinator_id: usize,
    coordinator_num: usize,
    replica_num: usize,
}

impl HashReplicated {
    pub fn new(coordinator_id: usize, coordinator_num: usize, replica_num: usize) -> Self {
        assert!(coordinator_id < coordinator_num);
        assert!(replica_num >= 1 && replica_num <= coordinator_num);
        HashReplicated {
            coordinator_id,
            coordinator_num,
            replica_num,
        }
    }
}

impl Partitioner for HashReplicated {
    fn has_master_partition(&self, partition: usize) -> bool {
        self.master_coordinator(partition) == self.coordinator_id
    }

    fn master_coordinator(&self, partition: usize) -> usize {
        partition % self.coordinator_num
    }

    fn is_partition_replicated_on(&self, partition: usize, k: usize) -> bool {
        let master = self.master_coordinator(partition);
        let offset = (k + self.coordinator_num - master) % self.coordinator_num;
        offset < self.replica_num
    }

    fn replica_num(&self) -> usize {
        self.replica_num
    }

    fn total_coordinators(&self) -> usize {
        self.coordinator_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_mastership() {
        let p = HashReplicated::new(1, 3, 1);
        assert_eq!(p.master_coordinator(0), 0);
        assert_eq!(p.master_coordinator(1), 1);
        assert_eq!(p.master_coordinator(5), 2);
        assert!(p.has_master_partition(4));
        assert!(!p.has_master_partition(3));
    }

    #[test]
    fn replicas_follow_master() {
        let p = HashReplicated::new(0, 3, 2);
        // Partition 2 is mastered by 2, replicated on 0 (wrap-around).
        assert!(p.is_partition_replicated_on(2, 2));
        assert!(p.is_partition_replicated_on(2, 0));
        assert!(!p.is_partition_replicated_on(2, 1));
    }

    #[test]
    fn replica_count_matches_layout() {
        let p = HashReplicated::new(0, 4, 3);
        for partition in 0..8 {
            let copies = (0..4)
                .filter(|&k| p.is_partition_replicated_on(partition, k))
                .count();
            assert_eq!(copies, 3);
        }
    }
}
