/*!
 * Backup candidate discovery
 */

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use glob_match::glob_match;
use walkdir::{DirEntry, WalkDir};

use crate::error::{BackupError, Result};

/// File names never backed up
pub const DEFAULT_IGNORE: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", "ehthumbs.db"];

/// Collects regular files under the configured locations
#[derive(Debug, Clone)]
pub struct Scanner {
    /// Canonical home directory; nothing outside it is returned
    home: PathBuf,
    /// Glob patterns matched against file and directory names
    ignore_patterns: Vec<String>,
    /// Exact paths to leave out, e.g. the ledger and lock files
    excluded: Vec<PathBuf>,
}

impl Scanner {
    /// Scanner sandboxed to `home`
    pub fn new(home: &Path) -> Result<Self> {
        Ok(Self {
            home: fs::canonicalize(home)?,
            ignore_patterns: Vec::new(),
            excluded: Vec::new(),
        })
    }

    /// Skip names matching any of these globs
    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    /// Never return `path`, if it exists
    pub fn exclude(mut self, path: &Path) -> Self {
        if let Ok(path) = fs::canonicalize(path) {
            self.excluded.push(path);
        }
        self
    }

    /// Resolve a location against the home directory.
    ///
    /// Relative locations are taken from home. The result is canonical and
    /// must stay inside home.
    pub fn resolve(&self, location: &Path) -> Result<PathBuf> {
        let joined = if location.is_absolute() {
            location.to_path_buf()
        } else {
            self.home.join(location)
        };
        let resolved = fs::canonicalize(&joined)?;
        if !resolved.starts_with(&self.home) {
            return Err(BackupError::PathOutsideHome(resolved));
        }
        Ok(resolved)
    }

    /// Every regular file under `locations`, sorted and without duplicates.
    ///
    /// Unreadable entries are logged and skipped. A location that does not
    /// resolve, or resolves outside home, is an error.
    pub fn scan(&self, locations: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = BTreeSet::new();

        for location in locations {
            let root = self.resolve(location)?;
            tracing::info!("scanning {}", root.display());

            if root.is_file() {
                if !self.should_ignore(&root) {
                    files.insert(root);
                }
                continue;
            }

            let walker = WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !self.should_ignore(e.path()));

            for entry in walker {
                match entry {
                    Ok(entry) if is_regular_file(&entry) => {
                        files.insert(entry.into_path());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("skipping unreadable entry: {}", e),
                }
            }
        }

        tracing::debug!("found {} candidate files", files.len());
        Ok(files.into_iter().collect())
    }

    /// Check if a path should be ignored based on patterns and defaults
    pub fn should_ignore(&self, path: &Path) -> bool {
        let file_name = path.file_name().unwrap_or_default().to_string_lossy();

        if self
            .ignore_patterns
            .iter()
            .any(|pattern| glob_match(pattern, &file_name))
        {
            return true;
        }

        if DEFAULT_IGNORE.iter().any(|&p| p == file_name) {
            return true;
        }

        self.excluded.iter().any(|excluded| excluded == path)
    }
}

fn is_regular_file(entry: &DirEntry) -> bool {
    entry.file_type().is_file()
}
