//! Durable tailing of the proxy access log.
//!
//! The file is reopened by path on every poll, so renames and recreations are
//! picked up the way `tail -F` does. Reads use synchronous `std::fs`.

use std::collections::VecDeque;
use std::fs::{self, Metadata};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lines longer than this are dropped.
const MAX_LINE_LEN: u64 = 1_048_576;

/// At most this much of one line is buffered.
const LINE_READ_LIMIT: u64 = MAX_LINE_LEN.saturating_add(1);

/// Failure to read the log file.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// The process may not read the file at all. Not retried.
    #[error("permission denied reading log file {}", path.display())]
    PermissionDenied {
        /// File that could not be opened.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Any other I/O failure. Retried on the next poll.
    #[error("failed to read log file {}: {source}", path.display())]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl ReaderError {
    /// Whether retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Classify an I/O error raised while reading `path`.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                path: path.to_path_buf(),
                source,
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Reader timing and start position.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Wait between polls when no new data is available.
    pub poll_interval: Duration,
    /// Wait between checks while the file does not exist or after an error.
    pub missing_retry: Duration,
    /// Skip content already present when the file is first opened.
    pub start_at_end: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            missing_retry: Duration::from_secs(2),
            start_at_end: true,
        }
    }
}

/// Tails one append-only text file.
///
/// Tracks the byte offset of the last complete line emitted. A partial line
/// at end of file is left unread until its newline arrives.
pub struct LogReader {
    path: PathBuf,
    options: ReaderOptions,
    offset: u64,
    identity: Option<u64>,
    positioned: bool,
    present: bool,
    discard_partial: bool,
    pending: VecDeque<String>,
}

impl LogReader {
    /// Create a reader for `path`. Nothing is opened until the first poll.
    pub fn new(path: PathBuf, options: ReaderOptions) -> Self {
        Self {
            path,
            options,
            offset: 0,
            identity: None,
            positioned: false,
            present: false,
            discard_partial: false,
            pending: VecDeque::new(),
        }
    }

    /// Path being tailed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset just past the last complete line read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read all complete lines appended since the previous poll.
    ///
    /// A missing file yields no lines. A file smaller than the tracked offset,
    /// or (on unix) one with a different inode, is read again from the start.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::PermissionDenied`] when the file cannot be
    /// opened for lack of permission, and [`ReaderError::Io`] for any other
    /// failure.
    pub fn poll_lines(&mut self) -> Result<Vec<String>, ReaderError> {
        let mut file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.mark_missing();
                return Ok(Vec::new());
            }
            Err(e) => return Err(ReaderError::from_io(&self.path, e)),
        };

        let metadata = file
            .metadata()
            .map_err(|e| ReaderError::from_io(&self.path, e))?;
        let file_len = metadata.len();
        let identity = file_identity(&metadata);

        if !self.present {
            self.present = true;
            info!(path = %self.path.display(), "log file found");
        }

        if !self.positioned {
            self.positioned = true;
            self.identity = identity;
            if self.options.start_at_end {
                self.offset = file_len;
                // A line still being written at startup is only half seen.
                self.discard_partial = file_len > 0
                    && !ends_with_newline(&mut file)
                        .map_err(|e| ReaderError::from_io(&self.path, e))?;
                debug!(offset = file_len, "starting at end of existing log");
                return Ok(Vec::new());
            }
        }

        if identity.is_some() && self.identity.is_some() && identity != self.identity {
            info!(path = %self.path.display(), "log file replaced, reading from start");
            self.reset();
        } else if file_len < self.offset {
            info!(
                path = %self.path.display(),
                previous_offset = self.offset,
                file_len,
                "log file truncated, reading from start"
            );
            self.reset();
        }
        self.identity = identity;

        if file_len == self.offset {
            return Ok(Vec::new());
        }

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(self.offset))
            .map_err(|e| ReaderError::from_io(&self.path, e))?;

        let mut lines = Vec::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let bytes_read = (&mut reader)
                .take(LINE_READ_LIMIT)
                .read_until(b'\n', &mut buf)
                .map_err(|e| ReaderError::from_io(&self.path, e))?;
            if bytes_read == 0 {
                break;
            }

            if !buf.ends_with(b"\n") {
                if to_u64(bytes_read) < LINE_READ_LIMIT {
                    // Partial line at end of file.
                    break;
                }
                let Some(rest) = skip_past_newline(&mut reader)
                    .map_err(|e| ReaderError::from_io(&self.path, e))?
                else {
                    // Oversized and still unterminated; rescanned next poll.
                    break;
                };
                let total = to_u64(bytes_read).saturating_add(rest);
                self.offset = self.offset.saturating_add(total);
                self.discard_partial = false;
                warn!(bytes = total, "dropping oversized log line");
                continue;
            }

            self.offset = self.offset.saturating_add(to_u64(bytes_read));
            if self.discard_partial {
                self.discard_partial = false;
                debug!(bytes = bytes_read, "skipping line that started before startup");
                continue;
            }

            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_owned());
            }
        }

        Ok(lines)
    }

    /// Wait for the next line, polling the file as needed.
    ///
    /// Returns `Ok(None)` once `shutdown` is set (or its sender is dropped).
    /// Lines already read are handed out before shutdown is honoured.
    /// Transient errors are logged and retried.
    ///
    /// # Errors
    ///
    /// Returns the error when it is fatal (see [`ReaderError::is_fatal`]).
    pub async fn next_line(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<String>, ReaderError> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            if *shutdown.borrow() {
                return Ok(None);
            }

            let wait = match self.poll_lines() {
                Ok(lines) if !lines.is_empty() => {
                    self.pending.extend(lines);
                    continue;
                }
                Ok(_) if self.present => self.options.poll_interval,
                Ok(_) => self.options.missing_retry,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "log read failed, retrying");
                    self.options.missing_retry
                }
            };

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn mark_missing(&mut self) {
        if self.present || !self.positioned {
            info!(path = %self.path.display(), "waiting for log file to be created");
        }
        self.present = false;
        // Whatever appears at this path next is a new file.
        self.positioned = true;
        self.identity = None;
        self.reset();
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.discard_partial = false;
    }
}

/// Where the monitor pulls lines from.
#[async_trait]
pub trait LineSource: Send {
    /// Wait for the next line. `Ok(None)` means shutdown was requested.
    async fn next_line(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<String>, ReaderError>;

    /// Human-readable origin of the lines, for logs.
    fn describe(&self) -> String;
}

#[async_trait]
impl LineSource for LogReader {
    async fn next_line(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<String>, ReaderError> {
        LogReader::next_line(self, shutdown).await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

fn ends_with_newline(file: &mut fs::File) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Consume through the next `\n`. Returns the bytes consumed, or `None` if
/// end of file came first.
fn skip_past_newline<R: BufRead>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut skipped: u64 = 0;
    loop {
        let (used, found) = {
            let available = reader.fill_buf()?;
            if available.is_empty() {
                return Ok(None);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos.saturating_add(1), true),
                None => (available.len(), false),
            }
        };
        reader.consume(used);
        skipped = skipped.saturating_add(to_u64(used));
        if found {
            return Ok(Some(skipped));
        }
    }
}

#[cfg(unix)]
fn file_identity(metadata: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &Metadata) -> Option<u64> {
    None
}
