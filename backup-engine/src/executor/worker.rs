//! Running engine operations as background jobs.
//!
//! Each job runs the synchronous [`BackupEngine`] on tokio's blocking pool,
//! streams its progress over a channel and can be cancelled by id. Jobs
//! touching the same destination directory run one at a time.

use super::{BackupEngine, BackupOutcome, BackupRequest, RestoreOutcome};
use crate::config::Config;
use crate::transfer::progress::ProgressSink;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard as SyncMutexGuard};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One progress report from a running job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub percent: u8,
    pub message: String,
}

/// Forwards engine progress into a job's channel
struct ChannelSink {
    job_id: String,
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, percentage: u8, message: &str) {
        // Receiver gone means nobody is listening; the job keeps going
        let _ = self.tx.send(ProgressUpdate {
            job_id: self.job_id.clone(),
            percent: percentage,
            message: message.to_string(),
        });
    }
}

/// One async mutex per destination directory.
///
/// Entries live only while a job holds or waits for the directory.
#[derive(Clone, Default)]
pub struct DestinationLocks {
    locks: Arc<SyncMutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl DestinationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other job holds `dest`, then hold it until the guard drops
    pub async fn acquire(&self, dest: &Path) -> DestinationGuard {
        let key = lock_key(dest);
        let lock = Arc::clone(self.map().entry(key.clone()).or_default());
        let guard = lock.lock_owned().await;
        DestinationGuard {
            key,
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    /// Directories currently held or waited on
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> SyncMutexGuard<'_, HashMap<PathBuf, Arc<Mutex<()>>>> {
        // Never held across an await or a panic-prone call
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive hold on one destination directory
pub struct DestinationGuard {
    key: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
    locks: DestinationLocks,
}

impl DestinationGuard {
    /// Normalized directory this guard holds
    pub fn path(&self) -> &Path {
        &self.key
    }
}

impl Drop for DestinationGuard {
    fn drop(&mut self) {
        // Release first so the map holds the only other reference when idle
        drop(self.guard.take());
        let mut map = self.locks.map();
        if map
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.key);
        }
    }
}

/// Map key for a destination: the same directory gives the same key whether
/// it exists yet or is reached through a symlink. The longest existing
/// ancestor is canonicalized and the missing components are appended.
fn lock_key(dest: &Path) -> PathBuf {
    let absolute = std::path::absolute(dest).unwrap_or_else(|_| dest.to_path_buf());
    let mut missing = Vec::new();

    for ancestor in absolute.ancestors() {
        if let Ok(resolved) = std::fs::canonicalize(ancestor) {
            return missing
                .iter()
                .rev()
                .fold(resolved, |key, part| key.join(part));
        }
        match ancestor.file_name() {
            Some(name) => missing.push(name),
            None => break,
        }
    }

    absolute
}

/// Tracks running jobs by id so they can be cancelled from outside
#[derive(Clone, Default)]
struct JobTracker {
    jobs: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl JobTracker {
    async fn register(&self, job_id: String, token: CancellationToken) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job_id, token);
    }

    async fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.jobs.read().await;
        match jobs.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn complete(&self, job_id: &str) {
        let mut jobs = self.jobs.write().await;
        jobs.remove(job_id);
    }

    async fn running_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

/// Handle to a spawned job
pub struct JobHandle<T> {
    job_id: String,
    progress: mpsc::UnboundedReceiver<ProgressUpdate>,
    cancel_token: CancellationToken,
    task: JoinHandle<Result<T>>,
}

impl<T> JobHandle<T> {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Request cancellation; the job stops at the next file boundary
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn progress(&mut self) -> &mut mpsc::UnboundedReceiver<ProgressUpdate> {
        &mut self.progress
    }

    /// Wait for the job to finish, discarding unread progress
    pub async fn wait(self) -> Result<T> {
        self.task
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?
    }

    /// Wait for the job, handing every progress update to `on_update` first
    pub async fn wait_with_progress<F>(mut self, mut on_update: F) -> Result<T>
    where
        F: FnMut(ProgressUpdate),
    {
        // The channel closes once the engine, and with it the sender, is dropped
        while let Some(update) = self.progress.recv().await {
            on_update(update);
        }
        self.wait().await
    }
}

/// Spawns engine operations as background jobs
#[derive(Clone)]
pub struct BackupWorker {
    config: Arc<Config>,
    locks: DestinationLocks,
    jobs: JobTracker,
}

impl BackupWorker {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            locks: DestinationLocks::new(),
            jobs: JobTracker::default(),
        }
    }

    pub fn locks(&self) -> &DestinationLocks {
        &self.locks
    }

    /// Start a backup; it waits for any other job on the same destination
    pub async fn spawn_backup(&self, request: BackupRequest) -> JobHandle<BackupOutcome> {
        let dest = request.dest_dir.clone();
        self.spawn(dest, move |engine| engine.create_backup(&request))
            .await
    }

    /// Start a restore; it waits for any other job on `restore_dir`
    pub async fn spawn_restore(
        &self,
        archive: PathBuf,
        restore_dir: PathBuf,
    ) -> JobHandle<RestoreOutcome> {
        self.spawn(restore_dir.clone(), move |engine| {
            engine.restore_backup(&archive, &restore_dir)
        })
        .await
    }

    /// Cancel a job by id. Returns false when no such job is running.
    pub async fn cancel(&self, job_id: &str) -> bool {
        self.jobs.cancel(job_id).await
    }

    pub async fn running_count(&self) -> usize {
        self.jobs.running_count().await
    }

    async fn spawn<T, F>(&self, lock_path: PathBuf, operation: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&BackupEngine) -> Result<T> + Send + 'static,
    {
        let job_id = Uuid::new_v4().to_string();
        let cancel_token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let sink = ChannelSink {
            job_id: job_id.clone(),
            tx,
        };
        let engine = BackupEngine::new((*self.config).clone())
            .with_cancel(cancel_token.clone())
            .with_progress(Arc::new(sink));

        self.jobs.register(job_id.clone(), cancel_token.clone()).await;

        let locks = self.locks.clone();
        let jobs = self.jobs.clone();
        let id = job_id.clone();

        let task = tokio::spawn(async move {
            let _guard = locks.acquire(&lock_path).await;
            debug!("Job {} acquired {}", id, lock_path.display());

            let result = if engine.cancel_token().is_cancelled() {
                Err(EngineError::Cancelled)
            } else {
                tokio::task::spawn_blocking(move || operation(&engine))
                    .await
                    .map_err(|e| EngineError::Worker(e.to_string()))
                    .and_then(|result| result)
            };

            match &result {
                Ok(_) => info!("Job {} finished", id),
                Err(EngineError::Cancelled) => info!("Job {} cancelled", id),
                Err(e) => warn!("Job {} failed: {}", id, e),
            }

            jobs.complete(&id).await;
            result
        });

        JobHandle {
            job_id,
            progress: rx,
            cancel_token,
            task,
        }
    }
}
