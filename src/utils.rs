/*!
 * Utility functions for kvbackup
 */

use std::fs;

/// Format a human-readable file size
pub fn format_file_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}

/// `ls -l` style permission string, e.g. `-rw-r--r--`
#[cfg(unix)]
pub fn permission_string(metadata: &fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode();
    let kind = if metadata.is_dir() {
        'd'
    } else if metadata.file_type().is_symlink() {
        'l'
    } else {
        '-'
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// `ls -l` style permission string, e.g. `-rw-rw-rw-`
#[cfg(not(unix))]
pub fn permission_string(metadata: &fs::Metadata) -> String {
    let kind = if metadata.is_dir() { 'd' } else { '-' };
    if metadata.permissions().readonly() {
        format!("{}r--r--r--", kind)
    } else {
        format!("{}rw-rw-rw-", kind)
    }
}

/// Shorten a path for the progress bar, keeping its tail
pub fn truncate_display(name: &str, max: usize) -> String {
    let count = name.chars().count();
    if count <= max {
        return name.to_string();
    }
    // No room for the ellipsis
    if max <= 3 {
        return name.chars().skip(count - max).collect();
    }
    let tail: String = name.chars().skip(count - (max - 3)).collect();
    format!("...{}", tail)
}

/// Split a comma-separated list, dropping empty items
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
