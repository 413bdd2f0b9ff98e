//! Per-user enrollment record storage
//!
//! Records are loaded from `<data_dir>/users/<id>/iris_records.json` the
//! first time a user is touched and mutated in memory. Every mutation hands
//! a snapshot to a background writer task, so callers never wait on disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use iris_core::{record::unique_name, DeviceId, EnrollmentRecord, GroupId, TemplateId, UserId};

use crate::config::IrisConfig;
use crate::error::Result;

/// Current record file layout version
const RECORD_FILE_VERSION: u32 = 1;

/// On-disk layout of a user's record file
#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    version: u32,
    records: Vec<EnrollmentRecord>,
}

enum PersistCommand {
    Write {
        path: PathBuf,
        records: Vec<EnrollmentRecord>,
    },
    Flush(oneshot::Sender<()>),
}

/// Record stores for every user, keyed by user id
pub struct RecordStores {
    /// Config holding the data root; `None` keeps everything in memory
    config: Option<IrisConfig>,

    /// Loaded stores
    users: HashMap<UserId, Vec<EnrollmentRecord>>,

    /// Background writer
    persister: Option<mpsc::UnboundedSender<PersistCommand>>,
}

impl RecordStores {
    /// Open file-backed stores and start the background writer
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: &IrisConfig) -> Result<Self> {
        config.ensure_directories()?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_loop(rx));
        Ok(Self {
            config: Some(config.clone()),
            users: HashMap::new(),
            persister: Some(tx),
        })
    }

    /// Stores that never touch disk
    pub fn in_memory() -> Self {
        Self {
            config: None,
            users: HashMap::new(),
            persister: None,
        }
    }

    fn load(&mut self, user_id: UserId) -> &mut Vec<EnrollmentRecord> {
        let config = &self.config;
        self.users.entry(user_id).or_insert_with(|| match config {
            Some(config) => read_records(&config.records_path(user_id)),
            None => Vec::new(),
        })
    }

    fn schedule_write(&mut self, user_id: UserId) {
        let (Some(config), Some(tx)) = (&self.config, &self.persister) else {
            return;
        };
        let records = self.users.get(&user_id).cloned().unwrap_or_default();
        let path = config.records_path(user_id);
        if tx.send(PersistCommand::Write { path, records }).is_err() {
            error!("Record writer stopped; user {} records not saved", user_id);
        }
    }

    /// Records for a user
    pub fn list(&mut self, user_id: UserId) -> &[EnrollmentRecord] {
        self.load(user_id)
    }

    /// Record with the given template id
    pub fn get(&mut self, user_id: UserId, template_id: TemplateId) -> Option<EnrollmentRecord> {
        self.load(user_id)
            .iter()
            .find(|r| r.id == template_id)
            .cloned()
    }

    pub fn count(&mut self, user_id: UserId) -> usize {
        self.load(user_id).len()
    }

    pub fn has_enrolled(&mut self, user_id: UserId) -> bool {
        self.count(user_id) > 0
    }

    /// Add a record under a fresh unique name; an existing id is replaced
    pub fn add(
        &mut self,
        user_id: UserId,
        template_id: TemplateId,
        group_id: GroupId,
        device_id: DeviceId,
    ) -> EnrollmentRecord {
        let records = self.load(user_id);
        records.retain(|r| r.id != template_id);
        let record = EnrollmentRecord::new(template_id, unique_name(records), group_id, device_id);
        records.push(record.clone());
        debug!("Added record {} ({}) for user {}", record.id, record.name, user_id);
        self.schedule_write(user_id);
        record
    }

    /// Remove a record; false when no record had that id
    pub fn remove(&mut self, user_id: UserId, template_id: TemplateId) -> bool {
        let records = self.load(user_id);
        let before = records.len();
        records.retain(|r| r.id != template_id);
        let removed = records.len() != before;
        if removed {
            self.schedule_write(user_id);
        }
        removed
    }

    /// Rename a record; false when no record had that id
    pub fn rename(&mut self, user_id: UserId, template_id: TemplateId, name: &str) -> bool {
        let Some(record) = self.load(user_id).iter_mut().find(|r| r.id == template_id) else {
            return false;
        };
        record.name = name.to_string();
        self.schedule_write(user_id);
        true
    }

    /// Signal `done` once every write queued so far is on disk
    pub fn flush(&self, done: oneshot::Sender<()>) {
        let Some(persister) = &self.persister else {
            let _ = done.send(());
            return;
        };
        if let Err(mpsc::error::SendError(PersistCommand::Flush(done))) =
            persister.send(PersistCommand::Flush(done))
        {
            let _ = done.send(());
        }
    }
}

/// Read a record file; a missing or unreadable file yields an empty store
fn read_records(path: &Path) -> Vec<EnrollmentRecord> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            error!("Failed to read {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str::<RecordFile>(&content) {
        Ok(file) => {
            if file.version != RECORD_FILE_VERSION {
                warn!(
                    "{} has version {}, expected {}",
                    path.display(),
                    file.version,
                    RECORD_FILE_VERSION
                );
            }
            file.records
        }
        Err(e) => {
            error!("Failed to parse {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

async fn write_records(path: &Path, records: Vec<EnrollmentRecord>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = RecordFile {
        version: RECORD_FILE_VERSION,
        records,
    };
    let content = serde_json::to_string_pretty(&file)?;

    // Write to temp file first, then rename for atomicity
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, &content).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn persist_loop(mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Write { path, records } => {
                if let Err(e) = write_records(&path, records).await {
                    error!("Failed to write {}: {}", path.display(), e);
                }
            }
            PersistCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_list_remove() {
        let mut stores = RecordStores::in_memory();
        let record = stores.add(5, 7, 5, 1);
        assert_eq!(record.name, "Iris 1");
        assert!(stores.list(5).iter().any(|r| r.id == 7));
        assert!(stores.list(6).is_empty());

        assert!(stores.remove(5, 7));
        assert!(!stores.remove(5, 7));
        assert!(stores.list(5).is_empty());
    }

    #[test]
    fn test_names_stay_unique() {
        let mut stores = RecordStores::in_memory();
        stores.add(0, 1, 0, 1);
        stores.add(0, 2, 0, 1);
        stores.remove(0, 1);
        let third = stores.add(0, 3, 0, 1);
        assert_eq!(third.name, "Iris 1");
    }

    #[test]
    fn test_rename() {
        let mut stores = RecordStores::in_memory();
        stores.add(0, 4, 0, 1);
        assert!(stores.rename(0, 4, "Left eye"));
        assert!(!stores.rename(0, 99, "Nope"));
        assert_eq!(stores.get(0, 4).unwrap().name, "Left eye");
    }

    #[tokio::test]
    async fn test_write_behind_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config = IrisConfig::with_data_dir(temp_dir.path());

        let mut stores = RecordStores::open(&config).unwrap();
        stores.add(3, 21, 3, 9);
        stores.add(3, 22, 3, 9);
        stores.remove(3, 21);
        let (done, flushed) = oneshot::channel();
        stores.flush(done);
        flushed.await.unwrap();

        let mut reopened = RecordStores::open(&config).unwrap();
        let ids: Vec<TemplateId> = reopened.list(3).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![22]);
        assert!(!config.records_path(3).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let config = IrisConfig::with_data_dir(temp_dir.path());
        std::fs::create_dir_all(config.user_dir(0)).unwrap();
        std::fs::write(config.records_path(0), "not json").unwrap();

        let mut stores = RecordStores::open(&config).unwrap();
        assert!(stores.list(0).is_empty());
    }
}
