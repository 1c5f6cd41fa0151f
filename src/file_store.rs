use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::storage::{check_monotonic, FinishedRecord, InProgressSnapshot, RecordStore};

const IN_PROGRESS_FILE: &str = "in_progress.json";
const RECORDS_DIR: &str = "records";

/// Write to a sibling temp file, fsync, then rename over the target.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// JSON files under one directory:
///
/// ```text
/// <root>/in_progress.json
/// <root>/records/<record id>.json
/// ```
pub struct JsonFileStore {
    root: PathBuf,
    /// Sequence of the snapshot on disk, read lazily
    stored_sequence: Option<Option<u64>>,
}

impl JsonFileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(RECORDS_DIR))?;
        Ok(Self {
            root,
            stored_sequence: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn in_progress_path(&self) -> PathBuf {
        self.root.join(IN_PROGRESS_FILE)
    }

    pub fn record_path(&self, record_id: &str) -> PathBuf {
        self.root.join(RECORDS_DIR).join(format!("{}.json", record_id))
    }

    fn read_in_progress(&self) -> Result<Option<InProgressSnapshot>, StoreError> {
        let path = self.in_progress_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn stored_sequence(&mut self) -> Result<Option<u64>, StoreError> {
        if let Some(seq) = self.stored_sequence {
            return Ok(seq);
        }
        let seq = self.read_in_progress()?.map(|s| s.sequence);
        self.stored_sequence = Some(seq);
        Ok(seq)
    }

    pub fn load_finished(&self, record_id: &str) -> Result<Option<FinishedRecord>, StoreError> {
        let path = self.record_path(record_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Ids of all finished records, sorted
    pub fn finished_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(RECORDS_DIR))? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    ids.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl RecordStore for JsonFileStore {
    fn save_in_progress(&mut self, snapshot: &InProgressSnapshot) -> Result<(), StoreError> {
        check_monotonic(self.stored_sequence()?, snapshot.sequence)?;
        let data = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.in_progress_path(), &data)?;
        self.stored_sequence = Some(Some(snapshot.sequence));
        Ok(())
    }

    fn load_in_progress(&mut self) -> Result<Option<InProgressSnapshot>, StoreError> {
        let snapshot = self.read_in_progress()?;
        self.stored_sequence = Some(snapshot.as_ref().map(|s| s.sequence));
        Ok(snapshot)
    }

    fn clear_in_progress(&mut self) -> Result<(), StoreError> {
        let path = self.in_progress_path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        self.stored_sequence = Some(None);
        Ok(())
    }

    fn commit_finished(&mut self, record: &FinishedRecord) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_path(&record.id), &data)?;
        log::info!("[store] committed {} to {}", record.id, self.record_path(&record.id).display());
        Ok(())
    }

    fn discard(&mut self, snapshot: &InProgressSnapshot) -> Result<(), StoreError> {
        let path = self.record_path(&snapshot.record_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        log::info!("[store] discarded {}", snapshot.record_id);
        Ok(())
    }
}
