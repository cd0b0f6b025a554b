/*!
 * Ledger line codec
 *
 * One entry per line, ten `:`-separated fields:
 *
 * ```text
 * hash:size:filename:filepath:fileInfo:fileNum:foreignKey:notes:mtime:permissions
 * ```
 *
 * The only escaping rule is for drive-letter paths: `C:\` inside the file name
 * and file path is written as `C;\` and restored on decode.
 */

use thiserror::Error;

use crate::types::{from_unix_seconds, Metadata};

/// Field delimiter
pub const DELIMITER: char = ':';

/// Number of fields in an encoded line
pub const FIELD_COUNT: usize = 10;

/// Errors produced while decoding a ledger line
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// Wrong number of delimiters
    #[error("expected 10 fields, found {0}")]
    FieldCount(usize),

    /// A numeric field did not parse
    #[error("invalid {field} value {value:?}")]
    InvalidNumber {
        /// Field name
        field: &'static str,
        /// Raw text
        value: String,
    },

    /// The mtime is outside the representable range
    #[error("mtime {0} is out of range")]
    InvalidTime(i64),
}

/// Encode an entry as a ledger line, without the trailing newline
pub fn encode(entry: &Metadata) -> String {
    format!("{}{}{}", entry.hash, DELIMITER, encode_without_hash(entry))
}

/// Encode every field except the hash.
///
/// This is the canonical metadata string mixed into the combined hash.
pub fn encode_without_hash(entry: &Metadata) -> String {
    [
        entry.size.to_string(),
        escape_drive(&entry.file_name),
        escape_drive(&entry.file_path),
        entry.file_info.clone(),
        entry.file_num.to_string(),
        entry.foreign_key.clone(),
        entry.notes.clone(),
        entry.mtime_seconds().to_string(),
        entry.permissions.clone(),
    ]
    .join(":")
}

/// Decode a ledger line
pub fn decode(line: &str) -> Result<Metadata, CodecError> {
    let line = line.trim_end();
    let fields: Vec<&str> = line.split(DELIMITER).collect();
    if fields.len() != FIELD_COUNT {
        return Err(CodecError::FieldCount(fields.len()));
    }

    let size = parse_number::<u64>("size", fields[1])?;
    let file_num = parse_number::<u32>("fileNum", fields[5])?;
    let secs = parse_number::<i64>("mtime", fields[8])?;
    let mtime = from_unix_seconds(secs).ok_or(CodecError::InvalidTime(secs))?;

    Ok(Metadata {
        hash: fields[0].to_string(),
        size,
        file_name: unescape_drive(fields[2]),
        file_path: unescape_drive(fields[3]),
        file_info: fields[4].to_string(),
        file_num,
        foreign_key: fields[6].to_string(),
        notes: fields[7].to_string(),
        mtime,
        permissions: fields[9].to_string(),
    })
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, CodecError> {
    raw.trim().parse::<T>().map_err(|_| CodecError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

// `X:\` -> `X;\`
fn escape_drive(path: &str) -> String {
    swap_after_letter(path, ':', ';')
}

// `X;\` -> `X:\`
fn unescape_drive(path: &str) -> String {
    swap_after_letter(path, ';', ':')
}

fn swap_after_letter(path: &str, from: char, to: char) -> String {
    let chars: Vec<char> = path.chars().collect();
    let mut out = String::with_capacity(path.len());
    for (i, &c) in chars.iter().enumerate() {
        let is_drive = c == from
            && i > 0
            && chars[i - 1].is_ascii_alphabetic()
            && chars.get(i + 1) == Some(&'\\');
        out.push(if is_drive { to } else { c });
    }
    out
}
