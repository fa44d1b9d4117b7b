//! A library implementing the Bitcask log-structured storage model: an
//! append-only value log on disk, paired with an in-memory index mapping
//! each key to the newest record's location.
//!
//! ```no_run
//! use bitcask::{Database, DbOptions};
//!
//! let db = Database::open(DbOptions::new("/tmp/my-db"))?;
//! db.put("hello", "world")?;
//! assert_eq!(db.get(b"hello")?, b"world");
//! # Ok::<(), bitcask::Error>(())
//! ```

mod batch;
mod config;
mod dir;
mod engine;
mod error;
mod index;
mod iterator;
mod merge;
mod record;
mod recovery;
mod segment;

pub use batch::Batch;
pub use config::{DbOptions, IndexType};
pub use engine::{Database, Stats};
pub use error::{Error, Result};
pub use iterator::DbIterator;
