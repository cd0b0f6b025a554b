/*!
 * Local ledger of everything already transferred
 *
 * The file on disk is an append-only log of encoded entries. The in-memory
 * [`Ledger`] is rebuilt from it on every run and keeps a hash index so the
 * dedup lookup does not scan.
 */

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::codec;
use crate::error::{Result, ResultExt};
use crate::types::Metadata;

/// In-memory view of the ledger plus the aggregates of the current run
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    entries: Vec<Metadata>,
    hashes: HashSet<String>,
    /// Bytes of new content planned this run
    data_size: u64,
    /// Entries added this run
    count: usize,
    /// Lines that failed to decode during load
    skipped_lines: usize,
}

impl Ledger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from already decoded entries
    pub fn from_entries(entries: Vec<Metadata>) -> Self {
        let hashes = entries.iter().map(|e| e.hash.clone()).collect();
        Self {
            entries,
            hashes,
            ..Self::default()
        }
    }

    /// Load the ledger file, creating it if it does not exist.
    ///
    /// Lines that fail to decode are logged and skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("{} does not exist, creating an empty ledger", path.display());
                File::create(path)
                    .ledger_context(|| format!("cannot create {}", path.display()))?;
                return Ok(Self::new());
            }
            Err(e) => {
                return Err(e).ledger_context(|| format!("cannot open {}", path.display()));
            }
        };

        let mut ledger = Self::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.ledger_context(|| format!("cannot read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match codec::decode(&line) {
                Ok(entry) => ledger.push(entry),
                Err(e) => {
                    tracing::warn!("{}:{}: skipping entry: {}", path.display(), index + 1, e);
                    ledger.skipped_lines += 1;
                }
            }
        }

        tracing::debug!(
            "loaded {} entries from {} ({} skipped)",
            ledger.entries.len(),
            path.display(),
            ledger.skipped_lines
        );
        Ok(ledger)
    }

    /// All entries in their current order
    pub fn entries(&self) -> &[Metadata] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of new content added this run
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Entries added this run
    pub fn count(&self) -> usize {
        self.count
    }

    /// Lines skipped during load
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Dedup lookup
    pub fn contains_hash(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    /// First entry with exactly this hash
    pub fn find(&self, hash: &str) -> Option<&Metadata> {
        if !self.contains_hash(hash) {
            return None;
        }
        self.entries.iter().find(|e| e.hash == hash)
    }

    /// Add a new content entry, counting its bytes
    pub fn insert_content(&mut self, entry: Metadata) {
        self.data_size += entry.size;
        self.count += 1;
        self.push(entry);
    }

    /// Add a new pointer entry
    pub fn insert_pointer(&mut self, entry: Metadata) {
        self.count += 1;
        self.push(entry);
    }

    /// Add an entry that was already recorded elsewhere (e.g. pulled from the
    /// remote store) without touching the run counters
    pub fn insert_existing(&mut self, entry: Metadata) {
        self.push(entry);
    }

    fn push(&mut self, entry: Metadata) {
        self.hashes.insert(entry.hash.clone());
        self.entries.push(entry);
    }

    /// Stable ascending sort by hash
    pub fn sort_by_hash(&mut self) {
        self.entries.sort_by(|a, b| a.hash.cmp(&b.hash));
    }

    /// Stable ascending sort by relative path, ties by modification time
    pub fn sort_by_path(&mut self) {
        self.entries
            .sort_by(|a, b| a.file_path.cmp(&b.file_path).then(a.mtime.cmp(&b.mtime)));
    }

    /// Entries whose name or path matches `pattern`, or whose hash starts
    /// with the pattern text
    pub fn search(&self, pattern: &Regex) -> Vec<&Metadata> {
        self.entries
            .iter()
            .filter(|e| {
                e.hash.starts_with(pattern.as_str())
                    || pattern.is_match(&e.file_name)
                    || pattern.is_match(&e.file_path)
            })
            .collect()
    }

    /// Newest entry per relative path, in path order
    pub fn recent_files(&self) -> Vec<&Metadata> {
        let mut latest: HashMap<&str, &Metadata> = HashMap::new();
        for entry in &self.entries {
            latest
                .entry(entry.file_path.as_str())
                .and_modify(|current| {
                    if entry.mtime >= current.mtime {
                        *current = entry;
                    }
                })
                .or_insert(entry);
        }
        let mut recent: Vec<&Metadata> = latest.into_values().collect();
        recent.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        recent
    }
}

/// Destination for committed ledger lines
pub enum LedgerWriter {
    /// Append to the ledger file
    File(PathBuf),
    /// Dry run: write the lines that would have been appended
    Transcript(Box<dyn Write + Send>),
}

impl LedgerWriter {
    /// Writer appending to the ledger file at `path`
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Writer sending lines to `out` instead of the ledger file
    pub fn transcript(out: impl Write + Send + 'static) -> Self {
        Self::Transcript(Box::new(out))
    }

    /// Append one encoded line per entry and flush. Never truncates.
    pub fn append(&mut self, entries: &[Metadata]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        match self {
            Self::File(path) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .append(true)
                    .open(&*path)
                    .ledger_context(|| format!("cannot open {} for append", path.display()))?;
                let torn = ends_mid_line(&mut file)
                    .ledger_context(|| format!("cannot read the tail of {}", path.display()))?;
                if torn {
                    tracing::warn!(
                        "{} ends with an incomplete line, starting a new one",
                        path.display()
                    );
                }

                let mut writer = BufWriter::new(file);
                let newline: &[u8] = if torn { b"\n" } else { b"" };
                writer
                    .write_all(newline)
                    .and_then(|_| write_lines(&mut writer, entries))
                    .and_then(|_| writer.flush())
                    .ledger_context(|| format!("cannot append to {}", path.display()))?;
                tracing::debug!("appended {} entries to {}", entries.len(), path.display());
            }
            Self::Transcript(out) => {
                write_lines(out, entries)
                    .and_then(|_| out.flush())
                    .ledger_context(|| "cannot write dry-run transcript")?;
            }
        }
        Ok(())
    }
}

// Left by an append that was cut short
fn ends_mid_line(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn write_lines<W: Write + ?Sized>(writer: &mut W, entries: &[Metadata]) -> io::Result<()> {
    for entry in entries {
        writeln!(writer, "{}", codec::encode(entry))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, Mutex};

    use tempfile::tempdir;

    use crate::types::{from_unix_seconds, SINGLE_FILE_INFO};

    fn entry(hash: &str, path: &str, secs: i64) -> Metadata {
        Metadata {
            hash: hash.to_string(),
            size: 10,
            file_name: format!("/home/u/{}", path),
            file_path: path.to_string(),
            file_info: SINGLE_FILE_INFO.to_string(),
            file_num: 0,
            foreign_key: String::new(),
            notes: String::new(),
            mtime: from_unix_seconds(secs).unwrap(),
            permissions: "-rw-r--r--".to_string(),
        }
    }

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_missing_file_is_created() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.dat");
        let ledger = Ledger::load(&path)?;
        assert!(ledger.is_empty());
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn test_append_then_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.dat");
        let mut writer = LedgerWriter::file(&path);

        writer.append(&[entry("bb", "b.txt", 2)])?;
        writer.append(&[entry("aa", "a.txt", 1)])?;

        let ledger = Ledger::load(&path)?;
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.entries()[0].hash, "bb");
        assert!(ledger.contains_hash("aa"));
        assert!(!ledger.contains_hash("cc"));
        assert_eq!(ledger.count(), 0);
        Ok(())
    }

    #[test]
    fn test_corrupt_lines_are_skipped() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.dat");
        let good = codec::encode(&entry("aa", "a.txt", 1));
        fs::write(&path, format!("{}\nnot:a:line\n\n{}", good, &good[..20]))?;

        let ledger = Ledger::load(&path)?;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.skipped_lines(), 2);
        Ok(())
    }

    #[test]
    fn test_append_after_torn_tail() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.dat");
        fs::write(&path, format!("{}\nab", codec::encode(&entry("first", "a.txt", 1))))?;

        LedgerWriter::file(&path).append(&[entry("second", "b.txt", 2)])?;

        let ledger = Ledger::load(&path)?;
        let hashes: Vec<_> = ledger.entries().iter().map(|e| e.hash.as_str()).collect();
        assert_eq!(hashes, vec!["first", "second"]);
        assert_eq!(ledger.skipped_lines(), 1);
        Ok(())
    }

    #[test]
    fn test_counters_follow_insert_kind() {
        let mut ledger = Ledger::new();
        ledger.insert_content(entry("c", "a.txt", 1));
        let mut pointer = entry("p", "a.txt", 1);
        pointer.foreign_key = "c".to_string();
        ledger.insert_pointer(pointer);
        ledger.insert_existing(entry("old", "b.txt", 1));

        assert_eq!(ledger.count(), 2);
        assert_eq!(ledger.data_size(), 10);
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_sort_orders_are_stable() {
        let mut ledger = Ledger::from_entries(vec![
            entry("c", "b.txt", 5),
            entry("a", "b.txt", 1),
            entry("b", "a.txt", 9),
            entry("a", "c.txt", 3),
        ]);

        ledger.sort_by_hash();
        let order: Vec<_> = ledger
            .entries()
            .iter()
            .map(|e| (e.hash.as_str(), e.file_path.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("a", "b.txt"), ("a", "c.txt"), ("b", "a.txt"), ("c", "b.txt")]
        );

        ledger.sort_by_path();
        let order: Vec<_> = ledger.entries().iter().map(|e| e.hash.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c", "a"]);
    }

    #[test]
    fn test_recent_files_keeps_newest_per_path() {
        let ledger = Ledger::from_entries(vec![
            entry("1", "docs/a.txt", 1),
            entry("2", "docs/a.txt", 7),
            entry("3", "other/a.txt", 2),
        ]);
        let recent: Vec<_> = ledger.recent_files().iter().map(|e| e.hash.as_str()).collect();
        assert_eq!(recent, vec!["2", "3"]);
    }

    #[test]
    fn test_search_by_path_and_hash_prefix() -> Result<()> {
        let ledger = Ledger::from_entries(vec![
            entry("abc123", "docs/report.pdf", 1),
            entry("def456", "music/song.mp3", 1),
        ]);
        assert_eq!(ledger.search(&Regex::new(r"\.pdf$")?).len(), 1);
        assert_eq!(ledger.search(&Regex::new("def")?)[0].hash, "def456");
        assert!(ledger.search(&Regex::new("nothing")?).is_empty());
        Ok(())
    }

    #[test]
    fn test_transcript_leaves_file_alone() -> Result<()> {
        let out = Shared::default();
        let mut writer = LedgerWriter::transcript(out.clone());
        writer.append(&[entry("aa", "a.txt", 1)])?;

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, format!("{}\n", codec::encode(&entry("aa", "a.txt", 1))));
        Ok(())
    }
}
