pub mod model;
mod tables;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::debug;

use crate::error::Result;

pub use self::tables::Tables;

/// Durable home of the ledger snapshot.
///
/// The engine commits a full MessagePack snapshot after every transaction; a
/// backend only has to make `commit` atomic (either the old or the new bytes
/// survive a crash).
pub trait LedgerBackend: Send + Sync {
    fn load(&self) -> Result<Option<Vec<u8>>>;
    fn commit(&self, snapshot: &[u8]) -> Result<()>;
}

/// In-memory ledger backend. Thread-safe via Mutex.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Option<Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn commit(&self, snapshot: &[u8]) -> Result<()> {
        *self.data.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.to_vec());
        Ok(())
    }
}

/// Ledger snapshot stored in a single file, replaced by write-then-rename.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerBackend for FileBackend {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, snapshot: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(snapshot)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Transactional catalog shared by every engine component.
///
/// Writers are serialized; each transaction works on a copy of the tables and
/// only replaces the live copy after the backend accepted the new snapshot, so
/// an error inside the closure (or a failed commit) leaves no trace.
pub struct Ledger {
    backend: Box<dyn LedgerBackend>,
    tables: RwLock<Tables>,
    writer: Mutex<()>,
}

impl Ledger {
    pub fn open(backend: Box<dyn LedgerBackend>) -> Result<Self> {
        let tables = match backend.load()? {
            Some(bytes) => rmp_serde::from_slice(&bytes)?,
            None => Tables::default(),
        };
        debug!(seq = tables.seq(), "ledger opened");
        Ok(Self {
            backend,
            tables: RwLock::new(tables),
            writer: Mutex::new(()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend::new()),
            tables: RwLock::new(Tables::default()),
            writer: Mutex::new(()),
        }
    }

    /// Run a read-only query against the current snapshot.
    pub fn read<T>(&self, query: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        query(&tables)
    }

    /// Run a transaction. The closure sees a private copy of the tables; the
    /// copy becomes visible only if the closure succeeds and the commit lands.
    pub fn write<T>(&self, txn: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let _serial = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = self.read(Tables::clone);
        next.bump_seq();
        let out = txn(&mut next)?;
        let bytes = rmp_serde::to_vec_named(&next)?;
        self.backend.commit(&bytes)?;
        *self.tables.write().unwrap_or_else(|e| e.into_inner()) = next;
        Ok(out)
    }
}
