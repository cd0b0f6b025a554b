/*!
 * Dedup planning
 *
 * Every candidate file gets two fingerprints from a single read:
 *
 * - the content hash, over the file bytes;
 * - the combined hash, over the file bytes followed by the file's encoded
 *   metadata.
 *
 * Which of the two the ledger already knows decides what has to be sent.
 */

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::codec;
use crate::error::{BackupError, Result};
use crate::ledger::Ledger;
use crate::types::{from_unix_seconds, Metadata, TransferState, SINGLE_FILE_INFO};
use crate::utils::permission_string;

const HASH_BUFFER: usize = 64 * 1024;

/// What has to be transferred for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Content and metadata are both known
    Skip,
    /// Content is known, only a pointer entry is new
    Pointer(Metadata),
    /// Content is new: upload it, then its pointer
    Full {
        /// Entry keyed by the content hash
        content: Metadata,
        /// Entry keyed by the combined hash, pointing at `content`
        pointer: Metadata,
    },
}

impl Plan {
    /// Entries this plan adds to the ledger, content first
    pub fn entries(&self) -> Vec<&Metadata> {
        match self {
            Plan::Skip => Vec::new(),
            Plan::Pointer(pointer) => vec![pointer],
            Plan::Full { content, pointer } => vec![content, pointer],
        }
    }
}

/// Content and combined hashes of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Hash of the file bytes
    pub content: String,
    /// Hash of the file bytes followed by the encoded metadata
    pub combined: String,
}

/// Classifies files against the ledger
#[derive(Debug, Clone)]
pub struct Planner {
    home: PathBuf,
}

impl Planner {
    /// Planner for files under `home`
    pub fn new(home: &Path) -> io::Result<Self> {
        Ok(Self {
            home: fs::canonicalize(home)?,
        })
    }

    /// Canonical home directory
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Stat `path` into a fresh content entry with an empty hash
    pub fn describe(&self, path: &Path) -> Result<Metadata> {
        let absolute = fs::canonicalize(path)?;
        let relative = absolute
            .strip_prefix(&self.home)
            .map_err(|_| BackupError::PathOutsideHome(absolute.clone()))?;

        let stat = fs::metadata(&absolute)?;
        let modified: DateTime<Utc> = stat.modified()?.into();
        // The ledger keeps whole seconds
        let mtime = from_unix_seconds(modified.timestamp()).unwrap_or(modified);

        Ok(Metadata {
            hash: String::new(),
            size: stat.len(),
            file_name: absolute.to_string_lossy().to_string(),
            file_path: relative.to_string_lossy().to_string(),
            file_info: SINGLE_FILE_INFO.to_string(),
            file_num: 0,
            foreign_key: String::new(),
            notes: String::new(),
            mtime,
            permissions: permission_string(&stat),
        })
    }

    /// Classify `path` and record the resulting entries in `ledger`
    pub fn plan(&self, ledger: &mut Ledger, path: &Path) -> Result<Plan> {
        let fresh = self.describe(path)?;
        let fingerprint = fingerprint(Path::new(&fresh.file_name), &fresh)?;

        let plan = if !ledger.contains_hash(&fingerprint.content) {
            let content = Metadata {
                hash: fingerprint.content.clone(),
                ..fresh.clone()
            };
            let pointer = Metadata {
                hash: fingerprint.combined,
                foreign_key: fingerprint.content,
                ..fresh
            };
            ledger.insert_content(content.clone());
            ledger.insert_pointer(pointer.clone());
            Plan::Full { content, pointer }
        } else if !ledger.contains_hash(&fingerprint.combined) {
            let pointer = Metadata {
                hash: fingerprint.combined,
                foreign_key: fingerprint.content,
                ..fresh
            };
            ledger.insert_pointer(pointer.clone());
            Plan::Pointer(pointer)
        } else {
            tracing::trace!("{} unchanged", fresh.file_path);
            return Ok(Plan::Skip);
        };

        ledger.sort_by_hash();
        tracing::debug!(
            "{}: {:?} {}",
            path.display(),
            TransferState::Planned,
            describe_plan(&plan)
        );
        Ok(plan)
    }
}

fn describe_plan(plan: &Plan) -> &'static str {
    match plan {
        Plan::Skip => "skip",
        Plan::Pointer(_) => "metadata only",
        Plan::Full { .. } => "full upload",
    }
}

/// Hash the file once, feeding both hashers
pub fn fingerprint(path: &Path, fresh: &Metadata) -> io::Result<Fingerprint> {
    let mut file = File::open(path)?;
    let mut content = blake3::Hasher::new();
    let mut combined = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BUFFER];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        content.update(&buf[..n]);
        combined.update(&buf[..n]);
    }
    combined.update(codec::encode_without_hash(fresh).as_bytes());

    Ok(Fingerprint {
        content: content.finalize().to_hex().to_string(),
        combined: combined.finalize().to_hex().to_string(),
    })
}
