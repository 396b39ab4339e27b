// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The seam between the engine and whatever generates its transactions.
//! The engine is generic over one [Workload]; the concrete choice is made
//! once at bootstrap.
//!
//! Query generation must be a pure function of (context, partition, the
//! generator's seed): the executor replays an aborted transaction by
//! reinstating the seed it saved before the attempt and generating again,
//! and correctness of the retry path assumes the replay touches the exact
//! same records.

use crate::{Conduit, Context, Error, Random, Transaction, TransactionResult};

pub trait Workload: Send {
    /// The access plan of one transaction, fixed at generation time.
    type Query;

    fn generate(&self, context: &Context, partition_id: usize, random: &mut Random)
        -> Self::Query;

    /// Run the query: declare reads, process them (which may pump remote
    /// responses through `link`), compute and declare writes, and say
    /// whether the transaction is ready to commit.
    fn execute(
        &self,
        query: &Self::Query,
        txn: &mut Transaction,
        link: &mut Conduit<'_>,
    ) -> Result<TransactionResult, Error>;
}
