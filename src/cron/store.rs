//! Persistent job store.
//!
//! Jobs live in a single versioned JSON document. Writes serialize to a
//! temporary sibling file and rename over the original, so readers never
//! observe a torn document; a mutex serializes in-process writers.

use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::types::CronJob;
use crate::error::{KeeperError, Result};

/// On-disk document format version
const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobsDocument {
    version: u32,
    jobs: Vec<CronJob>,
}

impl Default for JobsDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            jobs: Vec::new(),
        }
    }
}

/// Job persistence with atomic whole-document writes
pub struct CronStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CronStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// All jobs in document order
    pub fn list(&self) -> Result<Vec<CronJob>> {
        Ok(self.read_document()?.jobs)
    }

    /// Fetch one job by id
    pub fn get(&self, id: &str) -> Result<CronJob> {
        self.read_document()?
            .jobs
            .into_iter()
            .find(|job| job.id == id)
            .ok_or_else(|| KeeperError::NotFound(format!("job {id}")))
    }

    /// Add a new job; duplicate ids conflict
    pub fn add(&self, job: CronJob) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut document = self.read_document()?;
        if document.jobs.iter().any(|existing| existing.id == job.id) {
            return Err(KeeperError::Conflict(format!("job {} already exists", job.id)));
        }
        document.jobs.push(job);
        self.write_document(&document)
    }

    /// Read-modify-write one job under the store lock, returning the
    /// updated value
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<CronJob>
    where
        F: FnOnce(&mut CronJob),
    {
        let _guard = self.write_lock.lock();
        let mut document = self.read_document()?;
        let job = document
            .jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| KeeperError::NotFound(format!("job {id}")))?;
        mutate(job);
        let updated = job.clone();
        self.write_document(&document)?;
        Ok(updated)
    }

    /// Remove a job by id
    pub fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut document = self.read_document()?;
        let before = document.jobs.len();
        document.jobs.retain(|job| job.id != id);
        if document.jobs.len() == before {
            return Err(KeeperError::NotFound(format!("job {id}")));
        }
        self.write_document(&document)
    }

    /// Enable or disable a job
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<CronJob> {
        self.update(id, |job| {
            job.enabled = enabled;
            job.updated_at_ms = crate::util::now_ms();
        })
    }

    fn read_document(&self) -> Result<JobsDocument> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JobsDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_document(&self, document: &JobsDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let serialized = serde_json::to_vec_pretty(document)?;
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
