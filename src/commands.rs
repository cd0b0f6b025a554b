/*!
 * Command implementations
 *
 * Each function takes the resolved [`Config`] and whatever handles the
 * command needs, so they can run against an in-memory store in tests.
 */

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::CommandFactory;
use clap_complete::Shell;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;

use crate::backup::BackupRun;
use crate::config::{Args, Config};
use crate::error::Result;
use crate::ledger::{Ledger, LedgerWriter};
use crate::lock::ProcessLock;
use crate::pipeline::{decode_payload, Transform};
use crate::planner::Planner;
use crate::report::{ReportFormat, Reporter, RunSummary};
use crate::scanner::Scanner;
use crate::store::{CloudflareKv, KeyEntry, MemoryStore, ObjectStore};
use crate::types::{file_info, Metadata};
use crate::uploader::chunk_key;
use crate::{bail, ensure, error};

/// Store handle for the configured mode: in memory for dry runs,
/// Workers KV otherwise
pub fn open_store(config: &Config) -> Result<Box<dyn ObjectStore>> {
    if config.dry_run {
        tracing::info!("dry run: remote writes go to an in-memory store");
        return Ok(Box::new(MemoryStore::new()));
    }
    config.account.validate()?;
    let store = CloudflareKv::new(config.account.clone(), config.request_timeout)?;
    Ok(Box::new(store))
}

/// Ledger sink for the configured mode: the ledger file, or stdout for dry
/// runs
pub fn ledger_writer(config: &Config) -> LedgerWriter {
    if config.dry_run {
        LedgerWriter::transcript(io::stdout())
    } else {
        LedgerWriter::file(&config.ledger_path)
    }
}

/// Take the process lock unless this is a dry run
pub fn acquire_lock(config: &Config) -> Result<Option<ProcessLock>> {
    if config.dry_run {
        return Ok(None);
    }
    ProcessLock::acquire(&config.lock_path).map(Some)
}

/// Load the ledger. Dry runs do not create a missing file.
pub fn load_ledger(config: &Config) -> Result<Ledger> {
    if config.dry_run && !config.ledger_path.exists() {
        return Ok(Ledger::new());
    }
    Ledger::load(&config.ledger_path)
}

/// `keys`: list remote keys and their metadata
pub fn keys(store: &dyn ObjectStore) -> Result<Vec<KeyEntry>> {
    let keys = store.list_keys()?;
    Reporter::new(ReportFormat::ConsoleTable).print_keys(&keys);
    Ok(keys)
}

/// Top-level ledger entries found in a key listing.
///
/// Chunk keys (whose name is not the entry's own hash) are left out. The
/// chunk count of content entries is taken from the chunk keys present.
pub fn entries_from_keys(keys: &[KeyEntry]) -> Vec<Metadata> {
    let names: HashSet<&str> = keys.iter().map(|k| k.name.as_str()).collect();
    let mut entries = Vec::new();

    for key in keys {
        let Some(value) = &key.metadata else {
            continue;
        };
        let mut entry: Metadata = match serde_json::from_value(value.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("ignoring key {} with unreadable metadata: {}", key.name, e);
                continue;
            }
        };
        if entry.hash != key.name {
            continue;
        }
        entry.file_num = 0;
        if entry.is_content() {
            let mut chunks = 1u32;
            while names.contains(chunk_key(&entry.hash, chunks).as_str()) {
                chunks += 1;
            }
            entry.file_info = file_info(1, chunks);
        }
        entries.push(entry);
    }
    entries
}

/// `sync`: append remote entries the ledger does not know. Returns how
/// many were added.
pub fn sync(
    store: &dyn ObjectStore,
    ledger: &mut Ledger,
    writer: &mut LedgerWriter,
) -> Result<usize> {
    let keys = store.list_keys()?;
    let missing: Vec<Metadata> = entries_from_keys(&keys)
        .into_iter()
        .filter(|e| !ledger.contains_hash(&e.hash))
        .collect();

    writer.append(&missing)?;
    for entry in &missing {
        ledger.insert_existing(entry.clone());
    }
    ledger.sort_by_hash();

    tracing::info!("sync added {} of {} remote keys", missing.len(), keys.len());
    Ok(missing.len())
}

/// `search`: entries whose name or path matches, or whose hash starts with
/// `pattern`
pub fn search(ledger: &Ledger, pattern: &str) -> Result<Vec<Metadata>> {
    let regex = Regex::new(pattern)?;
    let mut found: Vec<Metadata> = ledger.search(&regex).into_iter().cloned().collect();
    found.sort_by(|a, b| a.file_path.cmp(&b.file_path).then(a.mtime.cmp(&b.mtime)));
    Ok(found)
}

/// `listAllFiles`: every entry by path, then modification time
pub fn list_all_files(ledger: &mut Ledger) -> Vec<Metadata> {
    ledger.sort_by_path();
    ledger.entries().to_vec()
}

/// `listRecentFiles`: the newest entry of every path
pub fn list_recent_files(ledger: &Ledger) -> Vec<Metadata> {
    ledger.recent_files().into_iter().cloned().collect()
}

/// Print entries as a table
pub fn print_entries(entries: &[Metadata]) {
    let refs: Vec<&Metadata> = entries.iter().collect();
    Reporter::new(ReportFormat::ConsoleTable).print_entries(&refs);
}

fn upload_progress() -> ProgressBar {
    let progress = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:.bold.cyan} {wide_msg:.dim.white} {pos}/{len} ({percent}%) Elapsed: {elapsed_precise}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    progress.set_style(style);
    progress.set_prefix("📤 Uploading");
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// `upload`: scan, plan and transfer the configured locations
pub fn upload(
    config: &Config,
    store: &dyn ObjectStore,
    ledger: &mut Ledger,
    writer: &mut LedgerWriter,
) -> Result<RunSummary> {
    ensure!(
        !config.locations.is_empty(),
        Config,
        "nothing to back up: set `location` in the preferences file or pass --location"
    );

    let scanner = Scanner::new(&config.home)?
        .with_ignore_patterns(config.ignore_patterns.clone())
        .exclude(&config.ledger_path)
        .exclude(&config.lock_path);
    let files = scanner.scan(&config.locations)?;
    let planner = Planner::new(&config.home)?;

    let progress = upload_progress();
    let run = BackupRun::new(store, config.transform)
        .with_threads(config.num_threads)
        .with_progress(progress.clone());
    let result = run.run(&planner, ledger, writer, &files);
    progress.finish_and_clear();

    let mut summary = result?;
    summary.dry_run = config.dry_run;
    Reporter::new(ReportFormat::ConsoleTable).print_summary(&summary);
    Ok(summary)
}

fn resolve_entry<'l>(ledger: &'l Ledger, hash: &str) -> Result<&'l Metadata> {
    if let Some(entry) = ledger.find(hash) {
        return Ok(entry);
    }
    let matches: Vec<&Metadata> = ledger
        .entries()
        .iter()
        .filter(|e| e.hash.starts_with(hash))
        .collect();
    let distinct: HashSet<&str> = matches.iter().map(|e| e.hash.as_str()).collect();
    match (matches.first(), distinct.len()) {
        (None, _) => bail!(
            InvalidArgument,
            "no ledger entry with hash {} (run sync to pull remote entries)",
            hash
        ),
        (Some(entry), 1) => Ok(*entry),
        (_, n) => bail!(InvalidArgument, "hash prefix {} matches {} entries", hash, n),
    }
}

/// Fetch and decode the stored bytes for `hash`
///
/// Pointers are followed to their content entry. The transform recorded
/// with the content wins over `fallback`.
pub fn fetch(
    store: &dyn ObjectStore,
    ledger: &Ledger,
    hash: &str,
    fallback: Transform,
) -> Result<(Metadata, Vec<u8>)> {
    let entry = resolve_entry(ledger, hash)?;
    let content = if entry.is_pointer() {
        ledger.find(&entry.foreign_key).unwrap_or(entry)
    } else {
        entry
    };

    let chunks = content.chunk_count().max(entry.chunk_count());
    let mut payload = Vec::new();
    for index in 0..chunks {
        let key = chunk_key(entry.content_key(), index);
        tracing::debug!("fetching {}", key);
        payload.extend(store.get(&key)?);
    }

    let transform = match content.notes.as_str() {
        "" => fallback,
        notes => Transform::from_setting(notes),
    };
    let bytes = decode_payload(transform, payload)?;
    Ok((entry.clone(), bytes))
}

/// `download`: write the stored file for `hash` to `output`, or to its
/// base name in the current directory. Returns where it was written.
pub fn download(
    config: &Config,
    store: &dyn ObjectStore,
    ledger: &Ledger,
    hash: &str,
    output: Option<&Path>,
) -> Result<PathBuf> {
    let (entry, bytes) = fetch(store, ledger, hash, config.transform)?;
    let target = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let name = Path::new(&entry.file_path)
                .file_name()
                .ok_or_else(|| error!(InvalidArgument, "entry {} has no file name", entry.hash))?;
            PathBuf::from(name)
        }
    };

    if bytes.len() as u64 != entry.size {
        tracing::warn!(
            "{}: expected {} bytes, got {}",
            entry.file_path,
            entry.size,
            bytes.len()
        );
    }

    if config.dry_run {
        tracing::info!(
            "dry run: would write {} bytes to {}",
            bytes.len(),
            target.display()
        );
    } else {
        fs::write(&target, &bytes)?;
        tracing::info!("wrote {} to {}", entry.file_path, target.display());
    }
    Ok(target)
}

/// `completions`: print a completion script for `shell`
pub fn completions(shell: Shell, out: &mut dyn Write) {
    let mut command = Args::command();
    let name = command.get_name().to_string();
    clap_complete::generate(shell, &mut command, name, out);
}
