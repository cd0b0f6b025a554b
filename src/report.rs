/*!
 * Reporting functionality for kvbackup
 *
 * Renders run summaries and ledger listings as console tables using the
 * tabled library.
 */

use std::time::Duration;

use tabled::{
    settings::{object::Columns, Alignment, Modify, Padding, Style},
    Table, Tabled,
};

use crate::store::KeyEntry;
use crate::types::Metadata;
use crate::utils::format_file_size;

/// A file whose transfer failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    /// Path relative to home
    pub path: String,
    /// Error text
    pub reason: String,
}

/// Outcome of one upload run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Wall time of the run
    pub duration: Duration,
    /// Files whose content was uploaded
    pub backed_up: usize,
    /// Files that only needed a new pointer entry
    pub metadata_only: usize,
    /// Payload bytes sent
    pub bytes_transferred: u64,
    /// Files already present in the ledger
    pub skipped: usize,
    /// Files that failed, with the reason
    pub failed: Vec<FailedFile>,
    /// Whether nothing was written
    pub dry_run: bool,
}

impl RunSummary {
    /// Whether every file made it
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Format of the report output
pub enum ReportFormat {
    /// Console table output
    ConsoleTable,
}

/// Report generator
pub struct Reporter {
    format: ReportFormat,
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Metric")]
    key: String,

    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Hash")]
    hash: String,

    #[tabled(rename = "File Path")]
    path: String,

    #[tabled(rename = "Size")]
    size: String,

    #[tabled(rename = "Modified")]
    modified: String,

    #[tabled(rename = "Kind")]
    kind: String,
}

#[derive(Tabled)]
struct KeyRow {
    #[tabled(rename = "Key")]
    name: String,

    #[tabled(rename = "File Path")]
    path: String,

    #[tabled(rename = "Chunk")]
    chunk: String,
}

impl Reporter {
    /// Create a new reporter
    pub fn new(format: ReportFormat) -> Self {
        Self { format }
    }

    /// Format a number with human-readable units
    fn format_number(&self, num: usize) -> String {
        if num >= 1_000_000 {
            format!("{:.1}M", num as f64 / 1_000_000.0)
        } else if num >= 1_000 {
            format!("{:.1}K", num as f64 / 1_000.0)
        } else {
            num.to_string()
        }
    }

    // Keep the tail of long paths, cutting at a separator when possible
    fn format_path(&self, path: &str, max_len: usize) -> String {
        if path.chars().count() <= max_len {
            return path.to_string();
        }

        let mut segments = Vec::new();
        let mut current_len = 3;
        for part in path.split('/').rev() {
            let part_len = part.chars().count() + 1;
            if current_len + part_len > max_len {
                break;
            }
            segments.push(part);
            current_len += part_len;
        }

        if segments.is_empty() {
            return crate::utils::truncate_display(path, max_len);
        }

        let mut result = String::from("...");
        for part in segments.iter().rev() {
            result.push('/');
            result.push_str(part);
        }
        result
    }

    fn short_hash(hash: &str) -> String {
        hash.chars().take(12).collect()
    }

    fn style(mut table: Table) -> String {
        table
            .with(Style::rounded())
            .with(Padding::new(1, 1, 0, 0))
            .with(Modify::new(Columns::new(..)).with(Alignment::left()));
        table.to_string()
    }

    /// Generate the end-of-run report
    pub fn generate_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            ReportFormat::ConsoleTable => self.console_summary(summary),
        }
    }

    /// Print the end-of-run report to stdout
    pub fn print_summary(&self, summary: &RunSummary) {
        println!("\n{}", self.generate_summary(summary));
    }

    fn console_summary(&self, summary: &RunSummary) -> String {
        let rows = vec![
            SummaryRow {
                key: "⏱️ Process Time".to_string(),
                value: format!("{:.4?}", summary.duration),
            },
            SummaryRow {
                key: "📤 Files Backed Up".to_string(),
                value: self.format_number(summary.backed_up),
            },
            SummaryRow {
                key: "🏷️ Metadata Updates".to_string(),
                value: self.format_number(summary.metadata_only),
            },
            SummaryRow {
                key: "📦 Bytes Transferred".to_string(),
                value: format_file_size(summary.bytes_transferred),
            },
            SummaryRow {
                key: "⏭️ Already Backed Up".to_string(),
                value: self.format_number(summary.skipped),
            },
            SummaryRow {
                key: "❌ Failed".to_string(),
                value: self.format_number(summary.failed.len()),
            },
        ];

        let title = match (summary.dry_run, summary.is_success()) {
            (true, _) => "🧪  DRY RUN COMPLETE (nothing was written)",
            (false, true) => "✅  BACKUP COMPLETE",
            (false, false) => "⚠️  BACKUP FINISHED WITH ERRORS",
        };
        let mut out = format!("{}\n{}", title, Self::style(Table::new(rows)));

        if !summary.failed.is_empty() {
            let failed: Vec<SummaryRow> = summary
                .failed
                .iter()
                .map(|f| SummaryRow {
                    key: self.format_path(&f.path, 50),
                    value: f.reason.clone(),
                })
                .collect();
            out.push_str("\n\n📋  FAILED FILES\n");
            out.push_str(&Self::style(Table::new(failed)));
        }
        out
    }

    /// Render ledger entries
    pub fn generate_entries(&self, entries: &[&Metadata]) -> String {
        let rows: Vec<EntryRow> = entries
            .iter()
            .map(|e| EntryRow {
                hash: Self::short_hash(&e.hash),
                path: self.format_path(&e.file_path, 60),
                size: format_file_size(e.size),
                modified: e.mtime.format("%Y-%m-%d %H:%M:%S").to_string(),
                kind: if e.is_pointer() {
                    format!("→ {}", Self::short_hash(&e.foreign_key))
                } else {
                    e.file_info.clone()
                },
            })
            .collect();
        format!(
            "{}\n📋  {} ENTRIES",
            Self::style(Table::new(rows)),
            self.format_number(entries.len())
        )
    }

    /// Print ledger entries to stdout
    pub fn print_entries(&self, entries: &[&Metadata]) {
        println!("{}", self.generate_entries(entries));
    }

    /// Render remote keys with their metadata
    pub fn generate_keys(&self, keys: &[KeyEntry]) -> String {
        let rows: Vec<KeyRow> = keys
            .iter()
            .map(|k| {
                let meta = k.metadata.as_ref();
                let field = |name: &str| {
                    meta.and_then(|m| m.get(name))
                        .map(|v| match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .unwrap_or_default()
                };
                KeyRow {
                    name: Self::short_hash(&k.name),
                    path: self.format_path(&field("filepath"), 60),
                    chunk: field("file"),
                }
            })
            .collect();
        format!(
            "{}\n🔑  {} KEYS",
            Self::style(Table::new(rows)),
            self.format_number(keys.len())
        )
    }

    /// Print remote keys to stdout
    pub fn print_keys(&self, keys: &[KeyEntry]) {
        println!("{}", self.generate_keys(keys));
    }
}
