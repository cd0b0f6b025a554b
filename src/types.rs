/*!
 * Core types and data structures for kvbackup
 */

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Chunk-position tag for a file that was written as a single object
pub const SINGLE_FILE_INFO: &str = "file 1 of 1";

/// One ledger entry.
///
/// A *content entry* has an empty `foreign_key` and is keyed by the hash of
/// the file bytes. A *pointer entry* is keyed by the hash of the bytes plus
/// the encoded metadata and points at its content entry via `foreign_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Content hash or combined hash
    pub hash: String,
    /// Byte length of the original file
    pub size: u64,
    /// Absolute path used to reopen the file
    #[serde(rename = "filename")]
    pub file_name: String,
    /// Path relative to the home directory
    #[serde(rename = "filepath")]
    pub file_path: String,
    /// Chunk-position tag, e.g. "file 1 of 4"
    #[serde(rename = "file")]
    pub file_info: String,
    /// Chunk sequence number
    pub file_num: u32,
    /// Content hash this entry refers to, empty for content entries
    #[serde(rename = "foreignkey", default)]
    pub foreign_key: String,
    /// Free-form annotation
    #[serde(default)]
    pub notes: String,
    /// Source modification time
    pub mtime: DateTime<Utc>,
    /// Permission string captured at scan time
    #[serde(default)]
    pub permissions: String,
}

impl Metadata {
    /// Whether this entry carries its own payload
    pub fn is_content(&self) -> bool {
        self.foreign_key.is_empty()
    }

    /// Whether this entry only references another entry's payload
    pub fn is_pointer(&self) -> bool {
        !self.foreign_key.is_empty()
    }

    /// Hash of the stored bytes this entry describes
    pub fn content_key(&self) -> &str {
        if self.is_pointer() {
            &self.foreign_key
        } else {
            &self.hash
        }
    }

    /// Number of remote objects recorded in `file_info`, 1 when unknown
    pub fn chunk_count(&self) -> u32 {
        self.file_info
            .rsplit(" of ")
            .next()
            .and_then(|n| n.trim().parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1)
    }

    /// Modification time truncated to what the ledger file stores
    pub fn mtime_seconds(&self) -> i64 {
        self.mtime.timestamp()
    }
}

/// Convert unix seconds into the in-memory timestamp type
pub fn from_unix_seconds(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Format a chunk-position tag
pub fn file_info(index: u32, total: u32) -> String {
    format!("file {} of {}", index, total)
}

/// `file_info` for a chunk written before the total is known
pub fn partial_file_info(index: u32) -> String {
    format!("file {} of ?", index)
}

/// Where a single file is in its transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Classified by the planner
    Planned,
    /// Producer started on the compression pipeline
    Compressing,
    /// Writing the chunk with this index
    Uploading(u32),
    /// All remote writes succeeded, entries can be recorded
    Committed,
    /// Some remote write or local read failed
    Failed,
}
