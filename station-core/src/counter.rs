use crate::config::write_atomic;
use crate::models::PersistenceWarning;
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Durable count of successful flashes, stored as plain integer text.
///
/// The in-memory value is authoritative for the running process: if a write
/// fails the count keeps going and the next successful write catches the file
/// up.
pub struct CounterStore {
    path: PathBuf,
    value: u64,
}

/// Result of an increment: the new total, and a warning if it did not reach
/// the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdate {
    pub value: u64,
    pub warning: Option<PersistenceWarning>,
}

impl CounterStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let value = load(&path);
        CounterStore { path, value }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Re-reads the file. Missing or corrupt content counts as zero.
    pub fn load(&mut self) -> u64 {
        self.value = load(&self.path);
        self.value
    }

    pub fn increment_and_save(&mut self) -> CounterUpdate {
        self.value = self.value.saturating_add(1);
        let warning = match write_atomic(&self.path, self.value.to_string().as_bytes()) {
            Ok(()) => {
                debug!("Flash counter saved: {}", self.value);
                None
            }
            Err(e) => {
                warn!(
                    "Could not save flash counter to {}: {}",
                    self.path.display(),
                    e
                );
                Some(PersistenceWarning {
                    what: format!("flash counter {}", self.path.display()),
                    detail: e.to_string(),
                })
            }
        };
        CounterUpdate {
            value: self.value,
            warning,
        }
    }
}

fn load(path: &Path) -> u64 {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(
                "Flash counter {} is unreadable ({:?}), starting from 0",
                path.display(),
                raw.trim()
            );
            0
        }),
        Err(_) => 0,
    }
}
