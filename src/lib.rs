/*!
 * kvbackup - deduplicating backups to a remote key-value store
 *
 * Files are fingerprinted twice: once over their bytes and once over their
 * bytes plus metadata. New content is compressed, split into chunks and
 * uploaded; known content with new metadata only gets a small pointer
 * entry. A local append-only ledger records everything already sent.
 */

pub mod backup;
pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod pipeline;
pub mod planner;
pub mod report;
pub mod scanner;
pub mod store;
pub mod types;
pub mod uploader;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export main components for easier access
pub use backup::BackupRun;
pub use config::Config;
pub use error::{BackupError, Result};
pub use ledger::{Ledger, LedgerWriter};
pub use lock::ProcessLock;
pub use pipeline::Transform;
pub use planner::{Plan, Planner};
pub use report::{ReportFormat, Reporter, RunSummary};
pub use scanner::Scanner;
pub use store::{CloudflareKv, MemoryStore, ObjectStore};
pub use types::Metadata;
pub use uploader::{ChunkedUploader, CHUNK_MAX};
pub use utils::format_file_size;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
