/*!
 * Chunked uploads to the object store
 *
 * Values larger than the store's size ceiling are split into numbered
 * chunks: the first one lives under the entry's hash, chunk `i` under
 * `hash + i`. Every chunk carries the entry's JSON as metadata, with
 * `file_info` telling its position. The total is only known once the last
 * chunk has been read, so earlier chunks say "file i of ?".
 */

use std::collections::VecDeque;
use std::io::{self, Read};
use std::path::Path;
use std::thread::{self, ScopedJoinHandle};

use crate::error::{BackupError, Result};
use crate::pipeline::{self, Transform};
use crate::store::{ObjectStore, MAX_VALUE_SIZE};
use crate::types::{file_info, partial_file_info, Metadata, TransferState};

/// Largest chunk written in a single put
pub const CHUNK_MAX: usize = 24 * 1024 * 1024;

/// Default number of chunk puts in flight per file
pub const DEFAULT_MAX_IN_FLIGHT: usize = 2;

/// What was written for one file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Number of chunks written
    pub chunks: u32,
    /// Payload bytes sent, after the transform
    pub bytes: u64,
}

/// Remote key of chunk `index` for an entry stored under `base_key`
pub fn chunk_key(base_key: &str, index: u32) -> String {
    if index == 0 {
        base_key.to_string()
    } else {
        format!("{}{}", base_key, index)
    }
}

/// Writes entries and their payloads to an [`ObjectStore`]
pub struct ChunkedUploader<'a> {
    store: &'a dyn ObjectStore,
    transform: Transform,
    chunk_max: usize,
    max_in_flight: usize,
}

impl<'a> ChunkedUploader<'a> {
    /// Uploader with the default chunk size and in-flight window
    pub fn new(store: &'a dyn ObjectStore, transform: Transform) -> Self {
        Self {
            store,
            transform,
            chunk_max: CHUNK_MAX,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Override the chunk size, capped at what the store accepts
    pub fn with_chunk_max(mut self, chunk_max: usize) -> Self {
        self.chunk_max = chunk_max.clamp(1, MAX_VALUE_SIZE);
        self
    }

    /// Override how many chunk puts may run at once
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Transform applied to file contents
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Stream the entry's file through the pipeline and upload it
    pub fn upload_content(&self, entry: &Metadata) -> Result<UploadReceipt> {
        tracing::debug!("{}: {:?}", entry.file_path, TransferState::Compressing);
        let mut stream = pipeline::open_stream(Path::new(&entry.file_name), self.transform)?;
        let result = self.upload_stream(&entry.hash, entry, &mut stream);
        stream.finish();
        result
    }

    /// Write a pointer entry: an empty value carrying the entry's JSON
    pub fn upload_pointer(&self, entry: &Metadata) -> Result<()> {
        tracing::debug!("{}: {:?}", entry.file_path, TransferState::Uploading(0));
        let metadata = serde_json::to_value(entry)?;
        put_chunk(self.store, &entry.hash, Vec::new(), &metadata)
    }

    /// Split `reader` into chunks and write them under `base_key`.
    ///
    /// Returns the first failure; once a put fails no further chunks are
    /// read. All started puts have finished when this returns.
    pub fn upload_stream<R: Read>(
        &self,
        base_key: &str,
        entry: &Metadata,
        mut reader: R,
    ) -> Result<UploadReceipt> {
        let store = self.store;

        thread::scope(|scope| {
            let mut in_flight: VecDeque<(String, ScopedJoinHandle<'_, Result<()>>)> =
                VecDeque::new();
            let mut receipt = UploadReceipt::default();
            let mut carry = None;
            let mut first_error: Option<BackupError> = None;

            'read: loop {
                let (buffer, more) = match self.next_chunk(&mut reader, &mut carry) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        first_error = Some(BackupError::Io(e));
                        break;
                    }
                };

                let index = receipt.chunks;
                let key = chunk_key(base_key, index);
                let mut chunk_entry = entry.clone();
                chunk_entry.file_num = index;
                chunk_entry.file_info = if more {
                    partial_file_info(index + 1)
                } else {
                    file_info(index + 1, index + 1)
                };
                let metadata = match serde_json::to_value(&chunk_entry) {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        first_error = Some(e.into());
                        break;
                    }
                };

                tracing::debug!(
                    "{}: {:?} as {} ({} bytes)",
                    entry.file_path,
                    TransferState::Uploading(index),
                    key,
                    buffer.len()
                );
                receipt.chunks += 1;
                receipt.bytes += buffer.len() as u64;

                let put_key = key.clone();
                let handle = scope.spawn(move || put_chunk(store, &put_key, buffer, &metadata));
                in_flight.push_back((key, handle));

                while in_flight.len() >= self.max_in_flight {
                    if let Some((key, handle)) = in_flight.pop_front() {
                        if let Err(e) = join_put(&key, handle) {
                            first_error = Some(e);
                            break 'read;
                        }
                    }
                }

                if !more {
                    break;
                }
            }

            for (key, handle) in in_flight {
                if let Err(e) = join_put(&key, handle) {
                    first_error.get_or_insert(e);
                }
            }

            match first_error {
                Some(e) => Err(e),
                None => Ok(receipt),
            }
        })
    }

    /// Read up to `chunk_max` bytes, then peek one byte to learn whether
    /// another chunk follows
    fn next_chunk<R: Read>(
        &self,
        reader: &mut R,
        carry: &mut Option<u8>,
    ) -> io::Result<(Vec<u8>, bool)> {
        let mut buffer = Vec::new();
        if let Some(byte) = carry.take() {
            buffer.push(byte);
        }
        let limit = (self.chunk_max - buffer.len()) as u64;
        reader.by_ref().take(limit).read_to_end(&mut buffer)?;
        if buffer.len() < self.chunk_max {
            return Ok((buffer, false));
        }

        let mut peek = [0u8; 1];
        loop {
            match reader.read(&mut peek) {
                Ok(0) => return Ok((buffer, false)),
                Ok(_) => {
                    *carry = Some(peek[0]);
                    return Ok((buffer, true));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn put_chunk(
    store: &dyn ObjectStore,
    key: &str,
    value: Vec<u8>,
    metadata: &serde_json::Value,
) -> Result<()> {
    let response = store.put(key, value, metadata)?;
    if response.success {
        Ok(())
    } else {
        let reason = if response.errors.is_empty() {
            "store reported failure".to_string()
        } else {
            response.errors.join("; ")
        };
        Err(BackupError::Transfer {
            key: key.to_string(),
            reason,
        })
    }
}

fn join_put(key: &str, handle: ScopedJoinHandle<'_, Result<()>>) -> Result<()> {
    handle.join().unwrap_or_else(|_| {
        Err(BackupError::Transfer {
            key: key.to_string(),
            reason: "upload thread panicked".to_string(),
        })
    })
}
