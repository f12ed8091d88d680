//! EmberDB is an embedded key-value store that persists every mutation
//! to per-datatype append-only logs and serves reads from in-memory
//! indexes. On top of the byte-key/byte-value substrate it offers five
//! logical datatypes: strings, hashes, lists, sets and sorted sets.
//!
//! Stale bytes left behind by overwrites and deletes are tracked per
//! segment and reclaimed by a background merge; recovery rebuilds every
//! index by replaying the logs in order.

pub mod config;
pub mod db;
pub mod discard;
pub mod encoding;
pub mod error;
pub mod index;
pub mod logfile;
pub mod scheduler;

pub use config::{IndexMode, IoType, Options};
pub use db::batch::{Batch, BatchOptions};
pub use db::Db;
pub use error::{Error, Result};
pub use logfile::DataType;
