//! Summary: ember — an embedded, single-file, transactional key-value
//! engine built on a copy-on-write B+ tree.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The database is one file of 4KB pages viewed through growing mmap
//! chunks. Page 0 is the meta page — the single commit point; everything
//! else is immutable B+ tree nodes and free-list nodes. Commits write new
//! pages, fsync, rewrite the meta page, and fsync again, so a crash at any
//! point leaves either the old or the new state, never a mix.
//!
//! # Example
//!
//! ```no_run
//! use ember::Database;
//!
//! # fn main() -> ember::Result<()> {
//! let db = Database::open("app.db")?;
//!
//! let mut tx = db.begin_write()?;
//! tx.set(b"hello", b"world")?;
//! tx.commit()?;
//!
//! let tx = db.begin_read();
//! assert_eq!(tx.get(b"hello"), Some(b"world".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! # Transactions
//!
//! Reads are snapshot-isolated and lock-free. Writers buffer privately
//! and run concurrently; at commit, a transaction whose *read ranges*
//! intersect a concurrently committed *write set* fails with
//! [`Error::Conflict`] instead of silently losing the race.

pub mod btree;
pub mod db;
pub mod error;
#[cfg(feature = "failpoint")]
pub mod failpoint;
pub mod freelist;
pub mod iter;
pub mod meta;
pub mod node;
pub mod page;
pub mod pager;
pub mod tx;

pub use crate::btree::{BTree, MemPages, PageRead, PageStore, UpdateMode, UpdateRequest};
pub use crate::db::{AllocStats, Database, Options, Stats};
pub use crate::error::{Error, Result};
pub use crate::iter::{KvIter, RangeIter, Scan, SeekCmp, TreeIter};
pub use crate::page::{MAX_KEY_SIZE, MAX_VAL_SIZE, PAGE_SIZE};
pub use crate::tx::{ReadTx, TxIter, WriteTx};
