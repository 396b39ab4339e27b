// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The table registry a coordinator hosts. Every coordinator materializes
//! every partition's tables with the same layout: the partitioner decides
//! which copies are authoritative and which merely receive replicated
//! versions, the registry itself is symmetric.

use crate::{Error, HashTable, Table};

pub struct Database {
    /// Indexed `[table_id][partition_id]`.
    tables: Vec<Vec<HashTable>>,
}

impl Database {
    pub fn new() -> Self {
        Database { tables: Vec::new() }
    }

    /// Register one relation across all partitions. Tables must be added
    /// in table-id order during bootstrap, before any worker starts.
    pub fn add_table(&mut self, partitions: Vec<HashTable>) -> usize {
        let table_id = self.tables.len();
        for (partition_id, t) in partitions.iter().enumerate() {
            assert_eq!(t.table_id(), table_id);
            assert_eq!(t.partition_id(), partition_id);
        }
        self.tables.push(partitions);
        table_id
    }

    pub fn find_table(&self, table_id: usize, partition_id: usize) -> Result<&dyn Table, Error> {
        self.tables
            .get(table_id)
            .and_then(|parts| parts.get(partition_id))
            .map(|t| t as &dyn Table)
            .ok_or(Error::UnknownTable {
                table_id,
                partition_id,
            })
    }

    /// Mutable lookup for bootstrap-time loading only.
    pub fn table_mut(&mut self, table_id: usize, partition_id: usize) -> &mut HashTable {
        &mut self.tables[table_id][partition_id]
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new()
    }
}
