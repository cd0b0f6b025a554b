/*!
 * Streaming compression pipeline
 *
 * A producer thread reads the source file, runs it through the selected
 * transform and writes into a bounded in-memory pipe. The consumer reads the
 * other end at its own pace; a full pipe blocks the producer.
 */

use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use strum::{Display, EnumString};

/// Buffers held by the pipe before the producer blocks
pub const PIPE_CAPACITY: usize = 16;

const COPY_BUFFER: usize = 64 * 1024;

/// How file bytes are transformed before upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Transform {
    /// Byte-for-byte copy
    #[default]
    #[strum(to_string = "identity", serialize = "none", serialize = "")]
    Identity,
    /// Single-entry tar archive, gzip compressed
    #[strum(to_string = "archive", serialize = "zip", serialize = "tar")]
    Archive,
    /// Zstandard stream
    #[strum(to_string = "zstd", serialize = "zstandard")]
    Zstd,
}

impl Transform {
    /// Parse a preference value. Unknown values fall back to identity.
    pub fn from_setting(value: &str) -> Self {
        match value.trim().parse() {
            Ok(transform) => transform,
            Err(_) => {
                tracing::warn!("unknown compression {:?}, sending files uncompressed", value);
                Transform::Identity
            }
        }
    }
}

type Message = io::Result<Vec<u8>>;

/// Writing half of an in-memory pipe
pub struct PipeWriter {
    sender: SyncSender<Message>,
}

/// Reading half of an in-memory pipe
pub struct PipeReader {
    receiver: Receiver<Message>,
    current: Vec<u8>,
    pos: usize,
    failed: bool,
}

/// Create a pipe holding at most `capacity` pending buffers
pub fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    let (sender, receiver) = mpsc::sync_channel(capacity);
    (
        PipeReader {
            receiver,
            current: Vec::new(),
            pos: 0,
            failed: false,
        },
        PipeWriter { sender },
    )
}

impl PipeWriter {
    /// Close the pipe so the reader sees `err` instead of end-of-data
    pub fn fail(self, err: io::Error) {
        // A reader that is already gone does not need to hear about it.
        let _ = self.sender.send(Err(err));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.sender
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.failed {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            match self.receiver.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.failed = true;
                    return Err(e);
                }
                // Writer dropped: end of data
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Transformed file contents, produced on a background thread
pub struct CompressedStream {
    reader: PipeReader,
    producer: Option<JoinHandle<()>>,
}

impl CompressedStream {
    /// Wait for the producer thread to exit
    pub fn finish(mut self) {
        if let Some(handle) = self.producer.take() {
            // Drop the reader first so a producer blocked on a full pipe
            // sees BrokenPipe and exits.
            drop(self.reader);
            if handle.join().is_err() {
                tracing::error!("compression thread panicked");
            }
        }
    }
}

impl Read for CompressedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Open `path` and start streaming it through `transform`.
///
/// The file is opened before the producer starts, so a missing or
/// unreadable source fails here rather than mid-stream. Later read or
/// encoder errors reach the consumer as a read error.
pub fn open_stream(path: &Path, transform: Transform) -> io::Result<CompressedStream> {
    let file = File::open(path)?;
    let (reader, writer) = pipe(PIPE_CAPACITY);
    let source = path.to_path_buf();

    let producer = thread::Builder::new()
        .name(format!("compress-{}", transform))
        .spawn(move || produce(file, source, transform, writer))?;

    Ok(CompressedStream {
        reader,
        producer: Some(producer),
    })
}

fn produce(file: File, source: PathBuf, transform: Transform, mut writer: PipeWriter) {
    let result = match transform {
        Transform::Identity => copy_to(file, &mut writer),
        Transform::Zstd => zstd_to(file, &mut writer),
        Transform::Archive => archive_to(file, &source, &mut writer),
    };
    match result {
        Ok(written) => {
            tracing::trace!("{} produced {} bytes for {}", transform, written, source.display())
        }
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!("consumer stopped reading {}", source.display())
        }
        Err(e) => {
            tracing::debug!("{} failed for {}: {}", transform, source.display(), e);
            writer.fail(e);
        }
    }
}

fn copy_to<R: Read, W: Write>(mut source: R, dest: &mut W) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        dest.write_all(&buf[..n])?;
        total += n as u64;
    }
}

fn zstd_to(file: File, dest: &mut PipeWriter) -> io::Result<u64> {
    let mut encoder = zstd::stream::write::Encoder::new(dest, 0)?;
    let read = copy_to(file, &mut encoder)?;
    encoder.finish()?;
    Ok(read)
}

fn archive_to(mut file: File, source: &Path, dest: &mut PipeWriter) -> io::Result<u64> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "data".to_string());
    let size = file.metadata()?.len();

    let encoder = GzEncoder::new(dest, Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive.append_file(&name, &mut file)?;
    archive.into_inner()?.finish()?;
    Ok(size)
}

/// Undo `transform` on a downloaded payload
pub fn decode_payload(transform: Transform, payload: Vec<u8>) -> io::Result<Vec<u8>> {
    match transform {
        Transform::Identity => Ok(payload),
        Transform::Zstd => zstd::stream::decode_all(Cursor::new(payload)),
        Transform::Archive => {
            let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(payload)));
            let mut entries = archive.entries()?;
            let mut entry = entries.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "archive has no entries")
            })??;
            let mut out = Vec::new();
            entry.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}
