//! Advisory per-workflow write locks.
//!
//! A lock is an `fs2` exclusive lock on `<workflow>/.lock`, so a second
//! process touching the same workflow fails fast. Locks taken by this process
//! are also tracked in memory so a second attempt from the same store fails
//! the same way regardless of platform lock semantics.

use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use crate::errors::StateError;

pub(crate) const LOCK_FILE: &str = ".lock";

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    held: Mutex<HashMap<String, File>>,
}

impl LockTable {
    pub(crate) fn acquire(&self, name: &str, dir: &Path) -> Result<(), StateError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.contains_key(name) {
            return Err(StateError::Locked(name.to_string()));
        }

        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StateError::io(&path, e))?;

        file.try_lock_exclusive()
            .map_err(|_| StateError::Locked(name.to_string()))?;

        held.insert(name.to_string(), file);
        Ok(())
    }

    /// Releasing a lock that is not held is a no-op.
    pub(crate) fn release(&self, name: &str) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = held.remove(name)
            && let Err(e) = FileExt::unlock(&file)
        {
            tracing::warn!(workflow = name, error = %e, "failed to release workflow lock");
        }
    }

    pub(crate) fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }
}
