/*!
 * One backup run
 *
 * Planning is sequential because it owns the ledger. Transfers then run on a
 * thread pool and report back over a channel to the calling thread, which
 * is the only one appending to the ledger file. A file's entries are
 * appended only after every remote write for it succeeded.
 */

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use indicatif::ProgressBar;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{BackupError, Result};
use crate::ledger::{Ledger, LedgerWriter};
use crate::pipeline::Transform;
use crate::planner::{Plan, Planner};
use crate::report::{FailedFile, RunSummary};
use crate::store::ObjectStore;
use crate::types::{file_info, Metadata, TransferState};
use crate::uploader::{ChunkedUploader, CHUNK_MAX};
use crate::utils::truncate_display;

/// Default number of files transferred at once
pub const DEFAULT_THREADS: usize = 4;

/// Content upload plus its pointer
#[derive(Debug, Clone)]
struct FullJob {
    content: Metadata,
    pointer: Metadata,
}

enum Outcome {
    Committed {
        path: String,
        entries: Vec<Metadata>,
        bytes: u64,
        /// Content hash, for full uploads
        content: Option<String>,
    },
    Failed {
        path: String,
        error: BackupError,
    },
}

/// Drives planning and transfer for a list of files
pub struct BackupRun<'a> {
    store: &'a dyn ObjectStore,
    transform: Transform,
    threads: usize,
    chunk_max: usize,
    progress: ProgressBar,
}

impl<'a> BackupRun<'a> {
    /// Run against `store`, compressing with `transform`
    pub fn new(store: &'a dyn ObjectStore, transform: Transform) -> Self {
        Self {
            store,
            transform,
            threads: DEFAULT_THREADS,
            chunk_max: CHUNK_MAX,
            progress: ProgressBar::hidden(),
        }
    }

    /// Number of files transferred in parallel
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Chunk size for content uploads
    pub fn with_chunk_max(mut self, chunk_max: usize) -> Self {
        self.chunk_max = chunk_max;
        self
    }

    /// Progress bar advanced once per transferred file
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Back up `files`.
    ///
    /// Per-file failures are collected in the summary. Ledger write
    /// failures and non file-scoped errors end the run with an error.
    pub fn run(
        &self,
        planner: &Planner,
        ledger: &mut Ledger,
        writer: &mut LedgerWriter,
        files: &[PathBuf],
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        let mut fulls = Vec::new();
        let mut pointers = Vec::new();

        for path in files {
            match planner.plan(ledger, path) {
                Ok(Plan::Skip) => summary.skipped += 1,
                Ok(Plan::Full { content, pointer }) => fulls.push(FullJob { content, pointer }),
                Ok(Plan::Pointer(pointer)) => pointers.push(pointer),
                Err(e) if e.is_file_scoped() => {
                    tracing::warn!("cannot plan {}: {}", path.display(), e);
                    summary.failed.push(FailedFile {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            "{} new, {} metadata-only, {} unchanged",
            fulls.len(),
            pointers.len(),
            summary.skipped
        );

        self.progress.set_length((fulls.len() + pointers.len()) as u64);

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| crate::error!(InvalidArgument, "cannot start workers: {}", e))?;
        let uploader =
            ChunkedUploader::new(self.store, self.transform).with_chunk_max(self.chunk_max);
        let abort = AtomicBool::new(false);
        let mut committed_content = HashSet::new();

        self.transfer(
            &pool,
            &abort,
            &fulls,
            |job| self.transfer_full(&uploader, job),
            writer,
            &mut summary,
            &mut committed_content,
        )?;

        // A pointer to content planned in this run waits for that content.
        let planned_content: HashSet<&str> =
            fulls.iter().map(|j| j.content.hash.as_str()).collect();
        let (ready, blocked): (Vec<Metadata>, Vec<Metadata>) =
            pointers.into_iter().partition(|p| {
                !planned_content.contains(p.foreign_key.as_str())
                    || committed_content.contains(&p.foreign_key)
            });
        for pointer in blocked {
            tracing::debug!("{}: {:?}", pointer.file_path, TransferState::Failed);
            self.progress.inc(1);
            summary.failed.push(FailedFile {
                path: pointer.file_path,
                reason: "content upload failed".to_string(),
            });
        }

        self.transfer(
            &pool,
            &abort,
            &ready,
            |pointer| self.transfer_pointer(&uploader, pointer),
            writer,
            &mut summary,
            &mut committed_content,
        )?;

        summary.duration = started.elapsed();
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer<T, F>(
        &self,
        pool: &ThreadPool,
        abort: &AtomicBool,
        jobs: &[T],
        work: F,
        writer: &mut LedgerWriter,
        summary: &mut RunSummary,
        committed_content: &mut HashSet<String>,
    ) -> Result<()>
    where
        T: Sync,
        F: Fn(&T) -> Outcome + Sync,
    {
        if jobs.is_empty() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let work = &work;
        let mut fatal: Option<BackupError> = None;

        thread::scope(|scope| {
            scope.spawn(move || {
                pool.install(|| {
                    jobs.par_iter().for_each_with(tx, |tx, job| {
                        if abort.load(Ordering::SeqCst) {
                            return;
                        }
                        // The receiver only goes away once the run is over.
                        let _ = tx.send(work(job));
                    });
                });
            });

            for outcome in rx {
                self.progress.inc(1);
                match outcome {
                    Outcome::Committed {
                        path,
                        entries,
                        bytes,
                        content,
                    } => {
                        if fatal.is_some() {
                            continue;
                        }
                        if let Err(e) = writer.append(&entries) {
                            tracing::error!("stopping: {}", e);
                            abort.store(true, Ordering::SeqCst);
                            fatal = Some(e);
                            continue;
                        }
                        tracing::info!("backed up {}", path);
                        summary.bytes_transferred += bytes;
                        match content {
                            Some(hash) => {
                                summary.backed_up += 1;
                                committed_content.insert(hash);
                            }
                            None => summary.metadata_only += 1,
                        }
                    }
                    Outcome::Failed { path, error } => {
                        tracing::warn!("{}: {}", path, error);
                        summary.failed.push(FailedFile {
                            path,
                            reason: error.to_string(),
                        });
                    }
                }
            }
        });

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn transfer_full(&self, uploader: &ChunkedUploader<'_>, job: &FullJob) -> Outcome {
        let path = job.content.file_path.clone();
        self.progress.set_message(truncate_display(&path, 40));

        let mut content = job.content.clone();
        content.notes = uploader.transform().to_string();

        let result = uploader.upload_content(&content).and_then(|receipt| {
            let mut pointer = job.pointer.clone();
            pointer.file_info = file_info(1, receipt.chunks);
            uploader.upload_pointer(&pointer)?;
            Ok((receipt, pointer))
        });

        match result {
            Ok((receipt, pointer)) => {
                tracing::debug!("{}: {:?}", path, TransferState::Committed);
                content.file_info = file_info(1, receipt.chunks);
                Outcome::Committed {
                    path,
                    entries: vec![content, pointer],
                    bytes: receipt.bytes,
                    content: Some(job.content.hash.clone()),
                }
            }
            Err(error) => {
                tracing::debug!("{}: {:?}", path, TransferState::Failed);
                Outcome::Failed { path, error }
            }
        }
    }

    fn transfer_pointer(&self, uploader: &ChunkedUploader<'_>, pointer: &Metadata) -> Outcome {
        let path = pointer.file_path.clone();
        self.progress.set_message(truncate_display(&path, 40));

        match uploader.upload_pointer(pointer) {
            Ok(()) => {
                tracing::debug!("{}: {:?}", path, TransferState::Committed);
                Outcome::Committed {
                    path,
                    entries: vec![pointer.clone()],
                    bytes: 0,
                    content: None,
                }
            }
            Err(error) => {
                tracing::debug!("{}: {:?}", path, TransferState::Failed);
                Outcome::Failed { path, error }
            }
        }
    }
}
