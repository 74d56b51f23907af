//! # qAVM: object graph persistence for a Java-like contract VM
//!
//! - Contracts on this kind of VM keep their state as an ordinary object graph hanging off the
//!   static fields of their classes. Between transactions that graph has to live in the key-value
//!   store of the chain, and during a transaction it has to be brought back lazily, one object at
//!   a time, only as far as the contract actually looks.
//!
//! - qAVM is the persistence core of such a VM: the codecs that turn objects into records and
//!   back, the bookkeeping that keeps object identity intact across loads, the machinery for a
//!   contract calling into itself, and the cache that lets consecutive blocks skip the store.
//!   It does not interpret bytecode. A transaction body is a Rust closure working on the restored
//!   contract through [dapp::LoadedDApp].
//!
//! # Overview
//! The crate is organized bottom-up:
//!
//! - [persist::stream] and [persist::extent]: big-endian primitive codec and the `Extent` record,
//!   a pair of (primitive bytes, references).
//! - [persist::class]: class layouts with their fields in a fixed order, superclass fields first.
//!   This order is part of the wire format.
//! - [persist::graph]: walks an object or the statics of a class and emits its `Extent`, numbering
//!   every object reached. Reading resolves each number to exactly one live object.
//! - [persist::storage]: a contract's graph as it lives in the [kernel]. Objects come back as
//!   stubs and are loaded on first touch; saving writes only what changed.
//! - [persist::reentrant]: snapshot and swap of a contract's graph for a reentrant call, with
//!   commit and revert. Nested calls form a LIFO [persist::reentrant::CheckpointStack].
//! - [cache]: transformed code and graph roots per address, stamped with the block that produced
//!   them and only used when the block being executed descends from it.
//! - [exec]: ties everything together for one transaction.
//!
//! A contract goes through the following steps:
//!
//! - Deploy it with [exec::Executor::deploy]: the raw code (an RLP list of class declarations, see
//!   [code::DAppCode]) is transformed, the initializer runs, and the graph is saved.
//! - Call it with [exec::Executor::call], giving a [cache::BlockContext] that says where on the
//!   chain the execution happens.
//!
//! # Data Flow
//!
//! ```notrust
//!          [ Executor ] --- lookup/write ---> [ ExecutionCache ]
//!               |
//!               v
//!         [ LoadedDApp ]  <--- reentrant() ---> [ CheckpointStack ]
//!               |                                    |
//!       load_root()/save()                  capture()/commit()/revert()
//!               |                                    |
//!               v                                    v
//!        [ StorageGraph ]                     [ ReentrantGraph ]
//!               |
//!               v
//!        [ KernelOverlay ]  -- commit() on success -->  <Kernel>
//! ```
//!
//! Every record that moves between the store, the heap and a callee's heap is metered through
//! [persist::fee::StorageFeeProcessor] before anything is written. Running out of energy in the
//! middle of a save or a commit leaves both the store and the caller's objects untouched.

#[macro_use] extern crate num_derive;

pub mod cache;
pub mod code;
pub mod common;
pub mod config;
pub mod dapp;
pub mod exec;
pub mod kernel;
pub mod params;
pub mod persist;

pub use cache::{BlockContext, ExecutionCache, ExecutionType};
pub use exec::{CallError, Executor, Invocation, TxOutcome};
pub use kernel::{Kernel, SharedKernel};
