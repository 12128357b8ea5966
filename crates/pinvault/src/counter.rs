//! anti-replay counter
//!
//! a strictly increasing integer the hash tree store binds its committed
//! root to. a tree restored from an older snapshot carries an older counter
//! value and is rejected on open. production deployments back this with a
//! hardware nv counter; the file counter is only as tamper-evident as the
//! filesystem holding it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::CounterError;

pub trait MonotonicCounter: Send {
    /// current value
    fn read(&self) -> Result<u64, CounterError>;

    /// increment by one and return the new value
    fn increment(&mut self) -> Result<u64, CounterError>;
}

/// in-memory counter. clones share the same value.
#[derive(Debug, Clone, Default)]
pub struct MemoryCounter {
    value: Arc<AtomicU64>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(value: u64) -> Self {
        Self { value: Arc::new(AtomicU64::new(value)) }
    }
}

impl MonotonicCounter for MemoryCounter {
    fn read(&self) -> Result<u64, CounterError> {
        Ok(self.value.load(Ordering::SeqCst))
    }

    fn increment(&mut self) -> Result<u64, CounterError> {
        let prev = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
            .map_err(|_| CounterError::Overflow)?;
        Ok(prev + 1)
    }
}

/// counter persisted as 8 little endian bytes
#[derive(Debug)]
pub struct FileCounter {
    path: PathBuf,
    value: u64,
}

impl FileCounter {
    /// open the counter at `path`, starting from zero if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CounterError> {
        let path = path.as_ref().to_path_buf();
        let value = match fs::read(&path) {
            Ok(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CounterError::Unavailable("counter file has wrong length".into()))?;
                u64::from_le_bytes(arr)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, value })
    }

    fn persist(&self, value: u64) -> Result<(), CounterError> {
        let tmp = self.path.with_extension("tmp");
        let mut f = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        f.write_all(&value.to_le_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path)?;
        Ok(())
    }
}

/// fsync the directory holding `path` so a rename into it is durable
fn sync_parent(path: &Path) -> Result<(), CounterError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::File::open(parent)?.sync_all()?;
    Ok(())
}

impl MonotonicCounter for FileCounter {
    fn read(&self) -> Result<u64, CounterError> {
        Ok(self.value)
    }

    fn increment(&mut self) -> Result<u64, CounterError> {
        let next = self.value.checked_add(1).ok_or(CounterError::Overflow)?;
        self.persist(next)?;
        self.value = next;
        Ok(next)
    }
}
