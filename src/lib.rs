//! otterdb - embedded single-file key-value storage engine
//!
//! Data lives in one page-addressed file as a forest of B⁺-trees keyed by
//! ordered binary keys; a schema tree maps bucket names to tree roots.
//! Transactions are atomic and crash-safe through a write-ahead log with
//! checkpointing, with one writer and any number of snapshot readers.
//!
//! ```no_run
//! use otterdb::{Db, Options, Result};
//!
//! fn main() -> Result<()> {
//!     let db = Db::open("app.db", Options::default())?;
//!     let txn = db.begin_txn(true)?;
//!     let bucket = txn.create_bucket(b"users")?;
//!     bucket.put(b"alice", b"42")?;
//!     drop(bucket);
//!     txn.commit()?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod error;
pub mod os;
pub mod schema;
pub mod storage;
pub mod types;
pub mod util;

pub use api::{Bucket, Cursor, Db, Options, Txn};
pub use error::{Error, ErrorCode, Result, SubCode};
pub use types::{LockMode, SyncMode};
