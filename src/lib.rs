//! chunk-sync: chunked directory replication through a blob store.
//!
//! A large directory tree is split into size-bounded chunk archives plus one
//! bundle for everything outside its large subtree, checksummed into a manifest,
//! and moved through a [`store::BlobStore`]. Restores verify every artifact before
//! anything is extracted. An aggregate fingerprint of the source short-circuits
//! runs over an unchanged tree.
//!
//! The blocking entry points live in [`pipeline`].

pub mod archive;
pub mod blob;
pub mod bundle;
pub mod change;
pub mod cli;
pub mod config;
pub mod error;
pub mod layout;
pub mod load_config;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod planner;
pub mod scheduler;
pub mod store;

pub use blob::BlobRef;
pub use config::{EngineConfig, LogSink};
pub use error::{IntegrityError, Result, SyncError};
pub use pipeline::{chunk, download, pull, push, restore, upload, verify};
pub use store::{AwsCliBlobStore, BlobStore, LocalBlobStore};
