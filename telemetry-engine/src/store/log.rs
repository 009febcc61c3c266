use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    checksum::hash_str,
    domain::Reading,
    error::{EngineError, Result},
};

/// Durable, append-only home of the reading log.
///
/// Implementations must make `append` durable before returning `Ok`; any
/// failure is reported as `StorageUnavailable`.
pub trait ReadingLog: Send + Sync {
    fn append(&self, reading: &Reading) -> Result<()>;

    /// Every entry ever appended, in append order.
    fn replay(&self) -> Result<Vec<Reading>>;
}

/// In-process log. Loses everything on drop; used for tests and simulations.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<Reading>>,
    failing: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail, as a lost disk or broken connection would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadingLog for MemoryLog {
    fn append(&self, reading: &Reading) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::StorageUnavailable("memory log is failing".to_string()));
        }
        self.entries.lock().push(reading.clone());
        Ok(())
    }

    fn replay(&self) -> Result<Vec<Reading>> {
        Ok(self.entries.lock().clone())
    }
}

/// Checksum over the canonical fields of a reading.
pub(crate) fn reading_checksum(r: &Reading) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&r.sequence.to_le_bytes());
    hash_str(&mut h, &r.meter_id);
    hash_str(&mut h, &r.region);
    hash_str(&mut h, r.category.as_str());
    h.update(&r.ts.unix_timestamp_nanos().to_le_bytes());
    h.update(&r.kwh.to_bits().to_le_bytes());
    h.finalize().to_hex().to_string()
}

#[derive(Serialize, Deserialize)]
struct LogLine {
    #[serde(flatten)]
    reading: Reading,
    checksum: String,
}

/// NDJSON file log: one checksummed reading per line, synced on every append.
///
/// A line cut short by a crash is dropped when the log is reopened. A failed
/// append truncates the file back to its previous length.
pub struct FileLog {
    path: PathBuf,
    writer: Mutex<LogTail>,
}

struct LogTail {
    file: File,
    len: u64,
}

/// Length of `bytes` once a torn final line is cut off.
///
/// The final line is torn if it lacks its newline or does not parse. Earlier
/// lines are left for [`ReadingLog::replay`] to judge.
fn intact_len(bytes: &[u8]) -> usize {
    let line_start = |end: usize| bytes[..end].iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);

    let mut keep = bytes.len();
    if keep > 0 && bytes[keep - 1] != b'\n' {
        keep = line_start(keep);
    }
    if keep > 0 {
        let start = line_start(keep - 1);
        let line = &bytes[start..keep - 1];
        let blank = line.iter().all(u8::is_ascii_whitespace);
        if !blank && serde_json::from_slice::<LogLine>(line).is_err() {
            keep = start;
        }
    }
    keep
}

impl FileLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    EngineError::StorageUnavailable(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let unavailable = |e: std::io::Error| EngineError::StorageUnavailable(format!("failed to open {}: {e}", path.display()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(unavailable)?;

        let bytes = fs::read(&path).map_err(unavailable)?;
        let keep = intact_len(&bytes);
        if keep < bytes.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() - keep,
                "truncating torn tail of reading log"
            );
            file.set_len(keep as u64).map_err(unavailable)?;
            file.sync_data().map_err(unavailable)?;
        }

        Ok(Self {
            path,
            writer: Mutex::new(LogTail {
                file,
                len: keep as u64,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReadingLog for FileLog {
    fn append(&self, reading: &Reading) -> Result<()> {
        let line = LogLine {
            reading: reading.clone(),
            checksum: reading_checksum(reading),
        };
        let mut encoded = serde_json::to_vec(&line)
            .map_err(|e| EngineError::StorageUnavailable(format!("failed to encode reading: {e}")))?;
        encoded.push(b'\n');

        let mut tail = self.writer.lock();
        let start = tail.len;
        let written = tail.file.write_all(&encoded).and_then(|()| tail.file.sync_data());
        match written {
            Ok(()) => {
                tail.len = start + encoded.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = tail.file.set_len(start) {
                    tracing::error!(path = %self.path.display(), error = %undo, "failed to roll back partial log write");
                }
                Err(EngineError::StorageUnavailable(format!("log write failed: {e}")))
            }
        }
    }

    fn replay(&self) -> Result<Vec<Reading>> {
        let file = File::open(&self.path)
            .map_err(|e| EngineError::StorageUnavailable(format!("failed to open {}: {e}", self.path.display())))?;

        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| EngineError::StorageUnavailable(format!("log read failed: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: LogLine = serde_json::from_str(&line).map_err(|e| {
                EngineError::StorageUnavailable(format!("corrupt log line {}: {e}", idx + 1))
            })?;
            if reading_checksum(&parsed.reading) != parsed.checksum {
                return Err(EngineError::StorageUnavailable(format!(
                    "checksum mismatch on log line {}",
                    idx + 1
                )));
            }
            out.push(parsed.reading);
        }

        Ok(out)
    }
}
