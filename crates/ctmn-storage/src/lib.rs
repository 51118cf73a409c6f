//! Local persistence for notification jobs: watermark state, sent-key history,
//! the run lock marker, and the per-job file layout.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{Local, NaiveDate, NaiveDateTime};
use ctmn_core::{iso_seconds, IdempotencyKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ctmn-storage";

pub const STATE_FILE_NAME: &str = "state.json";
pub const SENT_KEYS_FILE_NAME: &str = "sent_keys.json";
pub const DEFAULT_SENT_KEYS_MAX: usize = 20_000;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where one job keeps its logs, lock, and sent-records exports.
#[derive(Debug, Clone)]
pub struct JobPaths {
    log_dir: PathBuf,
    job_code: String,
}

impl JobPaths {
    pub fn new(log_dir: impl Into<PathBuf>, job_code: impl Into<String>) -> Self {
        Self {
            log_dir: log_dir.into(),
            job_code: job_code.into(),
        }
    }

    pub fn job_dir(&self) -> PathBuf {
        self.log_dir.join(&self.job_code)
    }

    /// `<log_dir>/<job>/locks/job.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.job_dir().join("locks").join("job.lock")
    }

    pub fn daily_log_path(&self, day: NaiveDate) -> PathBuf {
        self.job_dir()
            .join("logs")
            .join(format!("{}.log", day.format("%Y-%m-%d")))
    }

    pub fn sent_records_dir(&self, day: NaiveDate) -> PathBuf {
        self.job_dir().join("sent").join(day.format("%Y-%m-%d").to_string())
    }
}

/// Write bytes through a temp file in the same directory and rename into place,
/// so readers never observe a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WatermarkFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_max_timestamp: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SentKeysFile {
    #[serde(default)]
    keys: Vec<IdempotencyKey>,
}

/// Bounded, insertion-ordered set of idempotency keys. Once full, inserting
/// evicts the oldest key.
#[derive(Debug, Clone)]
pub struct SentKeySet {
    order: VecDeque<IdempotencyKey>,
    members: HashSet<IdempotencyKey>,
    capacity: usize,
}

impl SentKeySet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn from_keys(keys: impl IntoIterator<Item = IdempotencyKey>, capacity: usize) -> Self {
        let mut set = Self::new(capacity);
        for key in keys {
            set.insert(key);
        }
        set
    }

    pub fn contains(&self, key: &IdempotencyKey) -> bool {
        self.members.contains(key)
    }

    /// Returns `false` when the key was already present.
    pub fn insert(&mut self, key: IdempotencyKey) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdempotencyKey> {
        self.order.iter()
    }
}

/// Watermark + sent-key files for one (job, environment).
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    sent_keys_max: usize,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>, sent_keys_max: usize) -> Self {
        Self {
            dir: dir.into(),
            sent_keys_max: sent_keys_max.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    /// Sibling of the state file.
    pub fn sent_keys_path(&self) -> PathBuf {
        self.dir.join(SENT_KEYS_FILE_NAME)
    }

    /// `None` on cold start (no file or no timestamp recorded yet).
    pub async fn load_watermark(&self) -> anyhow::Result<Option<NaiveDateTime>> {
        let file: WatermarkFile = read_json_or_default(&self.state_path()).await?;
        Ok(file.last_max_timestamp)
    }

    pub async fn save_watermark(&self, watermark: NaiveDateTime) -> anyhow::Result<()> {
        let file = WatermarkFile {
            last_max_timestamp: Some(watermark),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("serializing watermark state")?;
        write_atomic(&self.state_path(), &bytes).await
    }

    pub async fn load_sent_keys(&self) -> anyhow::Result<SentKeySet> {
        let file: SentKeysFile = read_json_or_default(&self.sent_keys_path()).await?;
        Ok(SentKeySet::from_keys(file.keys, self.sent_keys_max))
    }

    pub async fn save_sent_keys(&self, keys: &SentKeySet) -> anyhow::Result<()> {
        let file = SentKeysFile {
            keys: keys.iter().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("serializing sent keys")?;
        write_atomic(&self.sent_keys_path(), &bytes).await
    }
}

async fn read_json_or_default<T>(path: &Path) -> anyhow::Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };
    serde_json::from_slice(&bytes).map_err(|source| {
        anyhow::Error::new(StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    })
}

#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(RunLockGuard),
    /// A fresh marker exists; another run is presumed active.
    Held { age: Duration },
}

/// Filesystem marker guarding against overlapping runs of the same job.
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    stale_after: Duration,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn acquire(&self) -> anyhow::Result<LockAcquisition> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating lock directory {}", parent.display()))?;
        }

        match fs::metadata(&self.path).await {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .with_context(|| format!("reading mtime of {}", self.path.display()))?;
                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO);
                if age < self.stale_after {
                    return Ok(LockAcquisition::Held { age });
                }
                warn!(
                    lock = %self.path.display(),
                    age_secs = age.as_secs(),
                    "found stale lock; replacing"
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("inspecting lock {}", self.path.display()));
            }
        }

        let stamp = iso_seconds(Local::now().naive_local());
        fs::write(&self.path, stamp.as_bytes())
            .await
            .with_context(|| format!("writing lock {}", self.path.display()))?;

        Ok(LockAcquisition::Acquired(RunLockGuard {
            path: self.path.clone(),
            released: false,
        }))
    }
}

/// Removes the marker on `release`, or on drop if the holder never released it.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    released: bool,
}

impl RunLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn release(mut self) {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(lock = %self.path.display(), error = %err, "failed to release lock"),
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
