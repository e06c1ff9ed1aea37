//! # persistent-quotient-filter
//!
//! `persistent-quotient-filter` is a quotient filter whose entire state lives
//! in a memory-mapped pool. A quotient filter answers approximate membership
//! queries over caller-supplied 64-bit fingerprints with no false negatives
//! and a tunable false positive rate, and, unlike a Bloom filter, supports
//! deletion, enumeration of its contents, and merging. Every mutating
//! operation here is additionally crash-atomic: the pool wraps it in a
//! transaction that undo-logs every byte range before it changes, so a filter
//! that survives a crash is indistinguishable from one that saw either all or
//! none of the interrupted operation's effects.
//!
//! The filter does not hash for you: callers supply fingerprints (for
//! example from a keyed hasher), and only the low `qbits + rbits` bits of
//! each are stored. It does not resize, and a filter instance is not thread
//! safe.
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! persistent-quotient-filter = "*"
//! ```
//!
//! ```
//! use persistent_quotient_filter::pool::Pool;
//! use persistent_quotient_filter::quotient::QuotientFilter;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("filters.pool");
//!
//! {
//!     let mut pool = Pool::create(&path, 1 << 20).unwrap();
//!     let filter = QuotientFilter::init(&mut pool, 16, 8).unwrap();
//!     filter.insert(&mut pool, 0xdead_beef).unwrap();
//!
//!     // Persist the filter's handle so it can be found after a restart.
//!     let mut tx = pool.begin();
//!     tx.set_root(0, filter.state_handle());
//!     tx.commit().unwrap();
//! }
//!
//! // Reopen the pool (running crash recovery if needed) and rebind.
//! let pool = Pool::open(&path).unwrap();
//! let filter = QuotientFilter::open(&pool, pool.root(0)).unwrap();
//! assert!(filter.may_contain(&pool, 0xdead_beef));
//! ```
//!
//! ## References
//!
//!  - [Don't Thrash: How to Cache Your Hash on Flash](https://dl.acm.org/doi/10.14778/2350229.2350275)
//!  > Bender, Michael A., Martin Farach-Colton, Rob Johnson, Russell Kraner, Bradley C. Kuszmaul, Dzejla Medjedovic, Pablo Montes, Pradeep Shetty, Richard P. Spillane, and Erez Zadok. 2012. "Don't Thrash: How to Cache Your Hash on Flash." *Proc. VLDB Endow.* 5 (11): 1627–37. doi:[10.14778/2350229.2350275](https://doi.org/10.14778/2350229.2350275).
//!  - [Compact Hash Tables Using Bidirectional Linear Probing](https://ieeexplore.ieee.org/document/1676499)
//!  > Cleary, John G. 1984. "Compact Hash Tables Using Bidirectional Linear Probing." *IEEE Trans. Comput.* C-33 (9): 828–34. doi:[10.1109/TC.1984.1676499](https://doi.org/10.1109/TC.1984.1676499).

#![warn(missing_docs)]

mod error;
pub mod pool;
pub mod quotient;
mod table;

pub use crate::error::{Error, Result};
