// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use gnomon::*;


// The end-to-end tests live external to the crate to make sure the public
// API is usable without accidentally relying on crate-level-visibility
// stuff: everything a real embedder needs -- building databases, wiring
// queues to a socket layer, driving executors, even hand-rolling a
// protocol driver -- has to be reachable from here.

pub fn main() {
    println!("please run `cargo test` instead");
}
