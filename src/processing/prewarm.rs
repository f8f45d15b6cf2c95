use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::utils::short_hash;

/// Finished job records stay resolvable for this long.
const FINISHED_JOB_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub status: JobState,
    pub percent: u8,
    pub message: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub export_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_key: Option<String>,
}

#[derive(Debug)]
struct JobRecord {
    status: JobStatus,
    finished: Option<Instant>,
}

pub enum FingerprintOutcome {
    /// This job owns the fingerprint and should build the artifact.
    Proceed,
    /// An equivalent job already exists; the caller attaches to it.
    Attached,
}

/// Tracks prewarm jobs. Both the transient request key and the resolved
/// fingerprint key point at the same record, and create-or-join per
/// fingerprint is atomic under the single map lock.
pub struct PrewarmScheduler {
    jobs: Mutex<HashMap<String, Arc<StdMutex<JobRecord>>>>,
}

impl PrewarmScheduler {
    pub fn new() -> Self {
        Self { jobs: Mutex::new(HashMap::new()) }
    }

    /// Registers a new queued job and returns its transient key.
    pub async fn create_job(&self, export_url: String) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let key = short_hash(&format!("prewarm:{export_url}:{nanos}"));
        let record = Arc::new(StdMutex::new(JobRecord {
            status: JobStatus {
                status: JobState::Queued,
                percent: 0,
                message: "queued".to_string(),
                started_at: Utc::now().to_rfc3339(),
                finished_at: None,
                export_url,
                alias_key: None,
            },
            finished: None,
        }));
        let mut jobs = self.jobs.lock().await;
        Self::gc(&mut jobs);
        jobs.insert(key.clone(), record);
        key
    }

    /// Claims `fingerprint_key` for the job behind `transient_key`, or
    /// attaches the transient key to the job that already owns it.
    pub async fn register_fingerprint(&self, transient_key: &str, fingerprint_key: &str) -> FingerprintOutcome {
        let mut jobs = self.jobs.lock().await;

        if let Some(existing) = jobs.get(fingerprint_key) {
            let running = {
                let record = existing.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                record.status.status != JobState::Error
            };
            if running {
                let existing = Arc::clone(existing);
                jobs.insert(transient_key.to_string(), existing);
                return FingerprintOutcome::Attached;
            }
        }

        if let Some(record) = jobs.get(transient_key) {
            {
                let mut record = record.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                record.status.alias_key = Some(fingerprint_key.to_string());
            }
            let record = Arc::clone(record);
            jobs.insert(fingerprint_key.to_string(), record);
        }
        FingerprintOutcome::Proceed
    }

    pub async fn status(&self, key: &str) -> Option<JobStatus> {
        let jobs = self.jobs.lock().await;
        jobs.get(key).map(|record| {
            record.lock().unwrap_or_else(std::sync::PoisonError::into_inner).status.clone()
        })
    }

    pub async fn update<F>(&self, key: &str, mutate: F)
    where
        F: FnOnce(&mut JobStatus),
    {
        let jobs = self.jobs.lock().await;
        if let Some(record) = jobs.get(key) {
            let mut record = record.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            mutate(&mut record.status);
        }
    }

    pub async fn set_running(&self, key: &str, percent: u8, message: &str) {
        self.update(key, |status| {
            status.status = JobState::Running;
            status.percent = percent;
            status.message = message.to_string();
        })
        .await;
    }

    pub async fn finish(&self, key: &str, result: Result<(), String>) {
        let jobs = self.jobs.lock().await;
        if let Some(record) = jobs.get(key) {
            let mut record = record.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match result {
                Ok(()) => {
                    record.status.status = JobState::Done;
                    record.status.percent = 100;
                    record.status.message = "done".to_string();
                }
                Err(message) => {
                    record.status.status = JobState::Error;
                    record.status.message = message;
                }
            }
            record.status.finished_at = Some(Utc::now().to_rfc3339());
            record.finished = Some(Instant::now());
        }
    }

    fn gc(jobs: &mut HashMap<String, Arc<StdMutex<JobRecord>>>) {
        jobs.retain(|_, record| {
            let record = record.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match record.finished {
                Some(finished) => finished.elapsed() < FINISHED_JOB_RETENTION,
                None => true,
            }
        });
    }
}

impl Default for PrewarmScheduler {
    fn default() -> Self {
        Self::new()
    }
}
