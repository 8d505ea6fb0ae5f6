mod client;
mod content;
mod github;
mod memory;

pub use client::{
    BlobContent, CommitInfo, ContentResponse, EntryKind, FileContent, ListingEntry, MergeOutcome,
    RemoteRepository, TreeEntry, FILE_MODE,
};
pub use content::{decode_base64, resolve_file_bytes};
pub use github::GithubClient;
pub use memory::{MemoryRemote, RemoteOp};
