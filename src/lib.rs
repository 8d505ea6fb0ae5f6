#![deny(clippy::mod_module_files)]
//! Keeps a git-hosted document tree eventually consistent with local edits.
//!
//! Local mutations flow from a [`store::FileStore`] into the
//! [`sync::SyncEngine`], which batches them in a ledger and commits them to a
//! work branch through a [`remote::RemoteRepository`] on a debounce schedule.

pub mod config;
pub mod error;
pub mod path;
pub mod remote;
pub mod store;
pub mod sync;

pub use error::{Result, SyncError};
