//! Writes the diagnostic lock file. Failures are logged, never fatal.

use std::path::{Path, PathBuf};

use chrono::Utc;
use navrelay_protocol::{ClientRegistration, LockFileRecord};
use parking_lot::Mutex;
use tracing::{debug, warn};

pub struct LockFile {
    path: PathBuf,
    record: Mutex<LockFileRecord>,
}

impl LockFile {
    pub fn new(path: PathBuf, port: u16) -> Self {
        Self {
            path,
            record: Mutex::new(LockFileRecord::new(std::process::id(), port, Utc::now())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current record.
    pub fn write(&self) {
        let record = self.record.lock().clone();
        if let Err(e) = write_atomically(&self.path, &record) {
            warn!("Failed to write lock file {}: {e}", self.path.display());
        }
    }

    /// Replace the clients snapshot and rewrite the file.
    pub fn refresh(&self, clients: &[ClientRegistration]) {
        self.record.lock().refresh(clients);
        self.write();
    }

    /// Delete the file if it still describes this process.
    pub fn remove(&self) {
        let ours = self.record.lock().server_pid;
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                let owner = serde_json::from_str::<LockFileRecord>(&text)
                    .map(|record| record.server_pid)
                    .ok();
                if owner.is_some_and(|pid| pid != ours) {
                    debug!(
                        "Lock file {} belongs to another server; leaving it",
                        self.path.display()
                    );
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(_) => {}
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {e}", self.path.display());
        } else {
            debug!("Removed lock file {}", self.path.display());
        }
    }
}

fn write_atomically(path: &Path, record: &LockFileRecord) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(record)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{}.tmp", std::process::id()));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}
