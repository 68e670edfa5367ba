use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::warn;

use crate::error::{DdbError, Result, WriteGate};

/// External "may this path be written" gate (ransomware protection and the like).
pub trait AccessControl: Send + Sync {
    fn write_permitted(&self, path: &Path) -> bool;
}

/// Gate that never refuses.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn write_permitted(&self, _path: &Path) -> bool {
        true
    }
}

/// Gate that denies writes below any of a set of path prefixes.
/// The prefixes are toggled at runtime, independently of WORM.
#[derive(Debug, Default)]
pub struct PathGate {
    denied: RwLock<Vec<PathBuf>>,
}

impl PathGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, prefix: impl Into<PathBuf>) {
        let prefix = prefix.into();
        let mut denied = self.denied.write().unwrap_or_else(|e| e.into_inner());
        if !denied.contains(&prefix) {
            denied.push(prefix);
        }
    }

    pub fn allow(&self, prefix: &Path) {
        self.denied
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p != prefix);
    }
}

impl AccessControl for PathGate {
    fn write_permitted(&self, path: &Path) -> bool {
        !self
            .denied
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }
}

/// Fail with `WriteDenied` if the gate refuses `path`. Never retried.
pub fn require_write(access: &dyn AccessControl, path: &Path) -> Result<()> {
    if access.write_permitted(path) {
        return Ok(());
    }
    warn!(path = %path.display(), "write denied by access control");
    Err(DdbError::WriteDenied {
        target: path.display().to_string(),
        gate: WriteGate::AccessControl,
    })
}
