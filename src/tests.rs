/*!
 * End-to-end tests for kvbackup runs against an in-memory store
 */

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use filetime::{set_file_mtime, FileTime};
use tempfile::{tempdir, TempDir};

use crate::backup::BackupRun;
use crate::codec;
use crate::commands;
use crate::config::{Args, Config, Preferences};
use crate::error::BackupError;
use crate::ledger::{Ledger, LedgerWriter};
use crate::pipeline::Transform;
use crate::planner::Planner;
use crate::store::{MemoryStore, ObjectStore};
use crate::uploader::chunk_key;

use clap::Parser;

// Captures dry-run transcripts
#[derive(Clone, Default)]
struct Transcript(Arc<Mutex<Vec<u8>>>);

impl Transcript {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for Transcript {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Fixture {
    home: TempDir,
    state: TempDir,
}

impl Fixture {
    fn new() -> io::Result<Self> {
        Ok(Self {
            home: tempdir()?,
            state: tempdir()?,
        })
    }

    fn write(&self, rel: &str, contents: &[u8], secs: i64) -> io::Result<PathBuf> {
        let path = self.home.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        set_file_mtime(&path, FileTime::from_unix_time(secs, 0))?;
        Ok(path)
    }

    fn ledger_path(&self) -> PathBuf {
        self.state.path().join("data.dat")
    }

    fn files(&self) -> Vec<PathBuf> {
        let scanner = crate::scanner::Scanner::new(self.home.path()).unwrap();
        scanner.scan(&[PathBuf::from(".")]).unwrap()
    }

    fn run(&self, store: &MemoryStore, transform: Transform) -> crate::Result<crate::RunSummary> {
        self.run_with(store, transform, 1024 * 1024)
    }

    fn run_with(
        &self,
        store: &MemoryStore,
        transform: Transform,
        chunk_max: usize,
    ) -> crate::Result<crate::RunSummary> {
        let mut ledger = Ledger::load(&self.ledger_path())?;
        let mut writer = LedgerWriter::file(self.ledger_path());
        let planner = Planner::new(self.home.path())?;
        BackupRun::new(store, transform)
            .with_threads(2)
            .with_chunk_max(chunk_max)
            .run(&planner, &mut ledger, &mut writer, &self.files())
    }

    fn ledger(&self) -> Ledger {
        Ledger::load(&self.ledger_path()).unwrap()
    }

    fn config(&self, extra: &[&str]) -> Config {
        let home = self.home.path().to_string_lossy().to_string();
        let ledger = self.ledger_path().to_string_lossy().to_string();
        let mut argv = vec!["kvbackup", "--home", &home, "--ledger", &ledger];
        argv.extend_from_slice(extra);
        let args = Args::try_parse_from(argv).unwrap();
        Config::from_parts(&args, Preferences::default()).unwrap()
    }
}

#[test]
fn test_hello_file_backup() -> crate::Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", b"hello", 1_626_394_466)?;
    let store = MemoryStore::new();

    let summary = fx.run(&store, Transform::Identity)?;
    assert_eq!(summary.backed_up, 1);
    assert_eq!(summary.bytes_transferred, 5);
    assert!(summary.is_success());

    let ledger = fx.ledger();
    assert_eq!(ledger.len(), 2);
    let content = &ledger.entries()[0];
    let pointer = &ledger.entries()[1];
    assert_eq!(content.hash, blake3::hash(b"hello").to_hex().to_string());
    assert_eq!(content.file_info, "file 1 of 1");
    assert_eq!(content.notes, "identity");
    assert_eq!(pointer.foreign_key, content.hash);

    assert_eq!(store.get(&content.hash)?, b"hello");
    assert!(store.get(&pointer.hash)?.is_empty());
    Ok(())
}

#[test]
fn test_second_run_sends_nothing() -> crate::Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", b"hello", 1_000)?;
    fx.write("docs/b.txt", b"world", 1_000)?;
    let store = MemoryStore::new();

    fx.run(&store, Transform::Zstd)?;
    let puts = store.put_log().len();
    let lines = fs::read_to_string(fx.ledger_path())?;

    let summary = fx.run(&store, Transform::Zstd)?;
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.backed_up + summary.metadata_only, 0);
    assert_eq!(store.put_log().len(), puts);
    assert_eq!(fs::read_to_string(fx.ledger_path())?, lines);
    Ok(())
}

#[test]
fn test_copies_share_content() -> crate::Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", b"same", 1_000)?;
    fx.write("copy/a.txt", b"same", 1_000)?;
    let store = MemoryStore::new();

    let summary = fx.run(&store, Transform::Identity)?;
    assert_eq!(summary.backed_up, 1);
    assert_eq!(summary.metadata_only, 1);
    assert_eq!(summary.bytes_transferred, 4);

    let ledger = fx.ledger();
    assert_eq!(ledger.len(), 3);
    let content_hash = blake3::hash(b"same").to_hex().to_string();
    let pointers: Vec<_> = ledger.entries().iter().filter(|e| e.is_pointer()).collect();
    assert_eq!(pointers.len(), 2);
    assert!(pointers.iter().all(|p| p.foreign_key == content_hash));
    Ok(())
}

#[test]
fn test_touch_sends_metadata_only() -> crate::Result<()> {
    let fx = Fixture::new()?;
    let path = fx.write("a.txt", b"hello", 1_000)?;
    let store = MemoryStore::new();
    fx.run(&store, Transform::Identity)?;

    set_file_mtime(&path, FileTime::from_unix_time(5_000, 0))?;
    let before = store.put_log().len();
    let summary = fx.run(&store, Transform::Identity)?;

    assert_eq!(summary.metadata_only, 1);
    assert_eq!(summary.bytes_transferred, 0);
    assert_eq!(store.put_log().len(), before + 1);
    assert_eq!(fx.ledger().len(), 3);
    Ok(())
}

#[test]
fn test_rejected_upload_is_not_recorded() -> crate::Result<()> {
    let fx = Fixture::new()?;
    fx.write("good.txt", b"good", 1_000)?;
    fx.write("bad.txt", b"bad", 1_000)?;
    fx.write("copy/bad.txt", b"bad", 1_000)?;
    let store = MemoryStore::new();
    store.reject(blake3::hash(b"bad").to_hex().to_string());

    let summary = fx.run(&store, Transform::Identity)?;
    assert_eq!(summary.backed_up, 1);
    assert_eq!(summary.failed.len(), 2);
    assert!(summary
        .failed
        .iter()
        .any(|f| f.reason == "content upload failed"));

    let ledger = fx.ledger();
    assert_eq!(ledger.len(), 2);
    assert!(ledger.entries().iter().all(|e| e.file_path == "good.txt"));

    // Nothing about the rejected content was committed, so the next run
    // tries again.
    let retry = MemoryStore::new();
    let summary = fx.run(&retry, Transform::Identity)?;
    assert_eq!(summary.backed_up, 1);
    assert_eq!(summary.skipped, 1);
    Ok(())
}

#[test]
fn test_failure_partway_through_a_file_commits_nothing() -> crate::Result<()> {
    let fx = Fixture::new()?;
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    fx.write("big.bin", &data, 1_000)?;
    fx.write("copy/big.bin", &data, 1_000)?;
    fx.write("small.txt", b"small", 1_000)?;
    let content_hash = blake3::hash(&data).to_hex().to_string();

    // Chunk 0 lands, chunk 1 is refused
    let store = MemoryStore::new();
    store.reject(chunk_key(&content_hash, 1));
    let summary = fx.run_with(&store, Transform::Identity, 4096)?;

    assert!(store.get(&content_hash).is_ok());
    assert_eq!(summary.backed_up, 1);
    assert_eq!(summary.failed.len(), 2);
    assert!(summary
        .failed
        .iter()
        .any(|f| f.reason == "content upload failed"));
    let ledger = fx.ledger();
    assert!(!ledger.contains_hash(&content_hash));
    assert!(ledger.entries().iter().all(|e| e.file_path == "small.txt"));

    // The next run sends the whole file again
    let retry = MemoryStore::new();
    let summary = fx.run_with(&retry, Transform::Identity, 4096)?;
    assert_eq!(summary.backed_up, 1);
    assert_eq!(summary.metadata_only, 1);
    assert!(fx.ledger().contains_hash(&content_hash));
    Ok(())
}

#[test]
fn test_multi_chunk_file_downloads_back() -> crate::Result<()> {
    let fx = Fixture::new()?;
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
    fx.write("big.bin", &data, 1_000)?;
    let store = MemoryStore::new();

    fx.run_with(&store, Transform::Identity, 4096)?;
    let ledger = fx.ledger();
    let content = ledger.entries().iter().find(|e| e.is_content()).unwrap();
    assert_eq!(content.file_info, "file 1 of 3");
    assert!(store.get(&chunk_key(&content.hash, 2)).is_ok());

    let pointer = ledger.entries().iter().find(|e| e.is_pointer()).unwrap();
    let (_, bytes) = commands::fetch(&store, &ledger, &pointer.hash[..10], Transform::Zstd)?;
    assert_eq!(bytes, data);
    Ok(())
}

#[test]
fn test_compressed_download() -> crate::Result<()> {
    let fx = Fixture::new()?;
    fx.write("notes/todo.txt", b"remember the milk, remember the milk", 1_000)?;
    let store = MemoryStore::new();
    fx.run(&store, Transform::Archive)?;

    let ledger = fx.ledger();
    let config = fx.config(&["download", "x"]);
    let out = fx.state.path().join("restored.txt");
    let content_hash = blake3::hash(b"remember the milk, remember the milk")
        .to_hex()
        .to_string();
    commands::download(&config, &store, &ledger, &content_hash, Some(out.as_path()))?;
    assert_eq!(fs::read(&out)?, b"remember the milk, remember the milk");
    Ok(())
}

#[test]
fn test_sync_rebuilds_ledger() -> crate::Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", b"hello", 1_000)?;
    fx.write("b.txt", b"hello", 2_000)?;
    let store = MemoryStore::new();
    fx.run_with(&store, Transform::Identity, 2)?;
    let original = fx.ledger();

    let fresh_path = fx.state.path().join("fresh.dat");
    let mut fresh = Ledger::load(&fresh_path)?;
    let mut writer = LedgerWriter::file(&fresh_path);
    let added = commands::sync(&store, &mut fresh, &mut writer)?;
    assert_eq!(added, original.len());

    let reloaded = Ledger::load(&fresh_path)?;
    let content = reloaded.entries().iter().find(|e| e.is_content()).unwrap();
    assert_eq!(content.file_info, "file 1 of 3");
    for entry in original.entries() {
        assert!(reloaded.contains_hash(&entry.hash));
    }

    // Nothing new the second time
    assert_eq!(commands::sync(&store, &mut fresh, &mut writer)?, 0);
    Ok(())
}

#[test]
fn test_dry_run_writes_transcript_only() -> crate::Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", b"hello", 1_000)?;
    let config = fx.config(&["--dry-run", "upload", "--location", "."]);
    assert!(config.dry_run);

    let store = commands::open_store(&config)?;
    let mut ledger = commands::load_ledger(&config)?;
    let transcript = Transcript::default();
    let mut writer = LedgerWriter::transcript(transcript.clone());

    let summary = commands::upload(&config, store.as_ref(), &mut ledger, &mut writer)?;
    assert!(summary.dry_run);
    assert_eq!(summary.backed_up, 1);
    assert!(!fx.ledger_path().exists());

    let lines: Vec<_> = transcript.text().lines().map(str::to_string).collect();
    assert_eq!(lines.len(), 2);
    assert!(codec::decode(&lines[0]).is_ok());
    Ok(())
}

#[test]
fn test_upload_without_locations() -> io::Result<()> {
    let fx = Fixture::new()?;
    let config = fx.config(&["upload"]);
    let store = MemoryStore::new();
    let mut ledger = Ledger::new();
    let mut writer = LedgerWriter::file(fx.ledger_path());

    let err = commands::upload(&config, &store, &mut ledger, &mut writer).unwrap_err();
    assert!(matches!(err, BackupError::Config(_)));
    Ok(())
}

#[test]
fn test_ledger_failure_is_fatal() -> crate::Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", b"hello", 1_000)?;
    let store = MemoryStore::new();
    let planner = Planner::new(fx.home.path())?;
    let mut ledger = Ledger::new();
    // A directory cannot be opened for append
    let mut writer = LedgerWriter::file(fx.state.path());

    let result = BackupRun::new(&store, Transform::Identity).run(
        &planner,
        &mut ledger,
        &mut writer,
        &fx.files(),
    );
    assert!(matches!(result, Err(BackupError::Ledger(_))));
    Ok(())
}

#[test]
fn test_search_and_listings() -> crate::Result<()> {
    let fx = Fixture::new()?;
    fx.write("docs/report.pdf", b"pdf", 1_000)?;
    fx.write("music/song.mp3", b"mp3", 1_000)?;
    let store = MemoryStore::new();
    fx.run(&store, Transform::Identity)?;
    fx.write("docs/report.pdf", b"pdf v2", 2_000)?;
    fx.run(&store, Transform::Identity)?;

    let mut ledger = fx.ledger();
    let found = commands::search(&ledger, r"\.pdf$")?;
    assert_eq!(found.len(), 4);

    let recent = commands::list_recent_files(&ledger);
    assert_eq!(recent.len(), 2);
    let report = recent.iter().find(|e| e.file_path.ends_with("report.pdf")).unwrap();
    assert_eq!(report.mtime_seconds(), 2_000);

    let all = commands::list_all_files(&mut ledger);
    assert_eq!(all.len(), 6);
    assert!(all.windows(2).all(|w| w[0].file_path <= w[1].file_path));
    assert!(Path::new(&all[0].file_path).starts_with("docs"));
    Ok(())
}

#[test]
fn test_completions_render() {
    let mut out = Vec::new();
    commands::completions(clap_complete::Shell::Bash, &mut out);
    let script = String::from_utf8(out).unwrap();
    assert!(script.contains("kvbackup"));
    assert!(script.contains("listAllFiles"));
}
