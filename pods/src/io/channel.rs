//! File channel: JSON documents exchanged through a shared directory.
//!
//! Atomic rename is the only commit point: a document is written to a unique
//! temporary sibling, fsynced, then renamed over its final path, so a reader
//! that sees the path always sees a complete document. Locks (sibling
//! `<name>.lock` files created exclusively) are only needed when several
//! writers target the same path.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::io::config::OrchestratorConfig;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with [`ChannelError::Conflict`] if the target exists.
    #[default]
    CreateNew,
    Overwrite,
}

/// Paths written through a channel, shared by every scope derived from it.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Arc<Mutex<ManifestEntries>>,
}

#[derive(Debug, Default)]
struct ManifestEntries {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_file(&self, path: PathBuf) {
        self.lock().files.push(path);
    }

    pub fn record_dir(&self, path: PathBuf) {
        self.lock().dirs.push(path);
    }

    /// Files in the order they were committed.
    pub fn files(&self) -> Vec<PathBuf> {
        self.lock().files.clone()
    }

    /// Directories in the order they were recorded.
    pub fn dirs(&self) -> Vec<PathBuf> {
        self.lock().dirs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManifestEntries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Channel rooted at a directory. Relative paths resolve against the root.
#[derive(Debug, Clone)]
pub struct FileChannel {
    root: PathBuf,
    poll_interval: Duration,
    lock_timeout: Duration,
    stale_lock_after: Duration,
    manifest: Option<Manifest>,
}

impl FileChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
            manifest: None,
        }
    }

    /// Channel using the polling and locking settings of `config`.
    pub fn from_config(root: impl Into<PathBuf>, config: &OrchestratorConfig) -> Self {
        Self::new(root)
            .with_poll_interval(config.poll_interval)
            .with_lock_timeout(config.lock_timeout)
            .with_stale_lock_after(config.stale_lock_after)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_stale_lock_after(mut self, stale_lock_after: Duration) -> Self {
        self.stale_lock_after = stale_lock_after;
        self
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Channel for a subtree; shares settings and manifest.
    pub fn scoped(&self, subdir: impl AsRef<Path>) -> Self {
        Self {
            root: self.resolve(subdir),
            ..self.clone()
        }
    }

    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Serialize `document` and commit it at `path`.
    ///
    /// Returns the absolute committed path. The temporary file is removed on
    /// every failure path.
    pub async fn write_atomic<T>(
        &self,
        path: impl AsRef<Path>,
        document: &T,
        mode: WriteMode,
    ) -> Result<PathBuf, ChannelError>
    where
        T: Serialize + ?Sized,
    {
        let target = self.resolve(path);
        let mut contents =
            serde_json::to_vec_pretty(document).map_err(|source| ChannelError::Encode {
                path: target.clone(),
                source,
            })?;
        contents.push(b'\n');

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| ChannelError::io(parent, source))?;
        }

        self.with_lock(&target, || commit(&target, &contents, mode))
            .await??;

        if let Some(manifest) = &self.manifest {
            manifest.record_file(target.clone());
        }
        debug!(path = %target.display(), ?mode, bytes = contents.len(), "document committed");
        Ok(target)
    }

    /// Wait until `path` exists, then parse it.
    ///
    /// Polls at the channel's interval with async sleeps. A zero `timeout`
    /// checks exactly once.
    pub async fn read_when_present<T>(
        &self,
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<T, ChannelError>
    where
        T: DeserializeOwned,
    {
        let target = self.resolve(path);
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            match fs::read(&target).await {
                Ok(bytes) => {
                    return serde_json::from_slice(&bytes).map_err(|source| {
                        ChannelError::Malformed {
                            path: target.clone(),
                            source,
                        }
                    });
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ChannelError::Timeout {
                            path: target,
                            waited: now - started,
                        });
                    }
                    sleep(self.poll_interval.min(deadline - now)).await;
                }
                Err(source) => return Err(ChannelError::io(target, source)),
            }
        }
    }

    /// Run `f` while holding the exclusive lock for `path`.
    ///
    /// The lock is released when `f` completes, fails, panics, or is dropped
    /// mid-flight.
    pub async fn with_lock<F, Fut, T>(&self, path: impl AsRef<Path>, f: F) -> Result<T, ChannelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire_lock(&self.resolve(path)).await?;
        Ok(f().await)
    }

    /// Delete a file. Returns `false` if it was already absent.
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<bool, ChannelError> {
        let target = self.resolve(path);
        match fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ChannelError::io(target, source)),
        }
    }

    async fn acquire_lock(&self, target: &Path) -> Result<LockGuard, ChannelError> {
        let lock_path = sibling_path(target, |name| format!("{name}.lock"))?;
        let started = Instant::now();
        loop {
            let attempt = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await;
            match attempt {
                Ok(mut file) => {
                    let guard = LockGuard {
                        path: lock_path.clone(),
                    };
                    let owner = format!("{}\n", std::process::id());
                    if let Err(err) = file.write_all(owner.as_bytes()).await {
                        warn!(path = %lock_path.display(), err = %err, "failed to record lock owner");
                    }
                    return Ok(guard);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if self.break_if_stale(&lock_path).await {
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= self.lock_timeout {
                        return Err(ChannelError::LockTimeout {
                            path: target.to_path_buf(),
                            waited,
                        });
                    }
                    sleep(self.poll_interval).await;
                }
                Err(source) => return Err(ChannelError::io(lock_path, source)),
            }
        }
    }

    /// Remove `lock_path` if nobody has touched it for `stale_lock_after`.
    async fn break_if_stale(&self, lock_path: &Path) -> bool {
        let Ok(metadata) = fs::metadata(lock_path).await else {
            return false;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok());
        let Some(age) = age.filter(|age| *age >= self.stale_lock_after) else {
            return false;
        };
        let owner = fs::read_to_string(lock_path).await.unwrap_or_default();
        warn!(
            path = %lock_path.display(),
            owner = owner.trim(),
            age_secs = age.as_secs(),
            "breaking stale lock"
        );
        match fs::remove_file(lock_path).await {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => true,
            Err(err) => {
                warn!(path = %lock_path.display(), err = %err, "failed to break stale lock");
                false
            }
        }
    }
}

/// Removes the lock file when dropped.
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
    }
}

async fn commit(target: &Path, contents: &[u8], mode: WriteMode) -> Result<(), ChannelError> {
    if mode == WriteMode::CreateNew
        && fs::try_exists(target)
            .await
            .map_err(|source| ChannelError::io(target, source))?
    {
        return Err(ChannelError::Conflict {
            path: target.to_path_buf(),
        });
    }

    let tmp_path = sibling_path(target, |name| format!(".{name}.{}.tmp", Uuid::new_v4().simple()))?;
    let written = async {
        write_synced(&tmp_path, contents).await?;
        fs::rename(&tmp_path, target)
            .await
            .map_err(|source| ChannelError::io(target, source))
    }
    .await;

    if written.is_err()
        && let Err(err) = fs::remove_file(&tmp_path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(path = %tmp_path.display(), err = %err, "failed to remove temp file");
    }
    written
}

async fn write_synced(path: &Path, contents: &[u8]) -> Result<(), ChannelError> {
    let io_err = |source| ChannelError::io(path, source);
    let mut file = fs::File::create(path).await.map_err(io_err)?;
    file.write_all(contents).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    Ok(())
}

fn sibling_path(target: &Path, name: impl FnOnce(&str) -> String) -> Result<PathBuf, ChannelError> {
    let Some(file_name) = target.file_name() else {
        return Err(ChannelError::io(
            target,
            std::io::Error::new(ErrorKind::InvalidInput, "path has no file name"),
        ));
    };
    Ok(target.with_file_name(name(&file_name.to_string_lossy())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn channel(root: &Path) -> FileChannel {
        FileChannel::new(root)
            .with_poll_interval(Duration::from_millis(5))
            .with_lock_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn write_then_read_returns_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        let channel = channel(temp.path());
        let path = channel
            .write_atomic("a/b/doc.json", &json!({"result": 4}), WriteMode::CreateNew)
            .await
            .expect("write");
        assert_eq!(path, temp.path().join("a/b/doc.json"));

        let doc: Value = channel
            .read_when_present("a/b/doc.json", Duration::ZERO)
            .await
            .expect("read");
        assert_eq!(doc, json!({"result": 4}));
    }

    #[tokio::test]
    async fn create_new_rejects_existing_target_and_overwrite_replaces_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        let channel = channel(temp.path());
        channel
            .write_atomic("doc.json", &json!(1), WriteMode::CreateNew)
            .await
            .expect("first write");

        let err = channel
            .write_atomic("doc.json", &json!(2), WriteMode::CreateNew)
            .await
            .expect_err("conflict");
        assert!(matches!(err, ChannelError::Conflict { .. }));

        channel
            .write_atomic("doc.json", &json!(3), WriteMode::Overwrite)
            .await
            .expect("overwrite");
        let doc: Value = channel
            .read_when_present("doc.json", Duration::ZERO)
            .await
            .expect("read");
        assert_eq!(doc, json!(3));
    }

    /// No temp or lock files survive a successful write.
    #[tokio::test]
    async fn write_leaves_only_the_committed_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        channel(temp.path())
            .write_atomic("doc.json", &json!({"k": "v"}), WriteMode::CreateNew)
            .await
            .expect("write");
        let names: Vec<String> = std::fs::read_dir(temp.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["doc.json"]);
    }

    #[tokio::test]
    async fn read_waits_for_a_late_writer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reader = channel(temp.path());
        let writer = reader.clone();
        let write = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            writer
                .write_atomic("late.json", &json!("done"), WriteMode::CreateNew)
                .await
        });

        let doc: Value = reader
            .read_when_present("late.json", Duration::from_secs(2))
            .await
            .expect("read");
        assert_eq!(doc, json!("done"));
        write.await.expect("join").expect("write");
    }

    #[tokio::test]
    async fn read_times_out_when_document_never_appears() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = channel(temp.path())
            .read_when_present::<Value>("missing.json", Duration::from_millis(20))
            .await
            .expect_err("timeout");
        assert!(matches!(err, ChannelError::Timeout { .. }));
    }

    #[tokio::test]
    async fn malformed_document_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("bad.json"), "{not json").expect("write");
        let err = channel(temp.path())
            .read_when_present::<Value>("bad.json", Duration::ZERO)
            .await
            .expect_err("malformed");
        assert!(matches!(err, ChannelError::Malformed { .. }));
    }

    #[tokio::test]
    async fn lock_is_released_when_closure_finishes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let channel = channel(temp.path());
        let value = channel
            .with_lock("doc.json", || async { 7 })
            .await
            .expect("lock");
        assert_eq!(value, 7);
        assert!(!temp.path().join("doc.json.lock").exists());
    }

    #[tokio::test]
    async fn held_lock_times_out_other_writers() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("doc.json.lock"), "999\n").expect("stale lock");
        let err = channel(temp.path())
            .with_lock_timeout(Duration::from_millis(20))
            .write_atomic("doc.json", &json!(1), WriteMode::CreateNew)
            .await
            .expect_err("lock timeout");
        assert!(matches!(err, ChannelError::LockTimeout { .. }));
        assert!(!temp.path().join("doc.json").exists());
    }

    #[tokio::test]
    async fn abandoned_lock_is_broken_once_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock_path = temp.path().join("doc.json.lock");
        let lock = std::fs::File::create(&lock_path).expect("create lock");
        std::io::Write::write_all(&mut &lock, b"999\n").expect("write owner");
        lock.set_modified(std::time::SystemTime::now() - Duration::from_secs(3600))
            .expect("age lock");
        drop(lock);

        channel(temp.path())
            .with_lock_timeout(Duration::from_millis(20))
            .with_stale_lock_after(Duration::from_secs(60))
            .write_atomic("doc.json", &json!(1), WriteMode::CreateNew)
            .await
            .expect("stale lock broken");
        assert!(temp.path().join("doc.json").is_file());
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn manifest_records_writes_from_every_scope() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manifest = Manifest::new();
        let root = channel(temp.path()).with_manifest(manifest.clone());
        let scoped = root.scoped("pod-a");
        root.write_atomic("top.json", &json!(1), WriteMode::CreateNew)
            .await
            .expect("write top");
        scoped
            .write_atomic("inner.json", &json!(2), WriteMode::CreateNew)
            .await
            .expect("write inner");
        assert_eq!(
            manifest.files(),
            [
                temp.path().join("top.json"),
                temp.path().join("pod-a/inner.json")
            ]
        );
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let channel = channel(temp.path());
        channel
            .write_atomic("doc.json", &json!(1), WriteMode::CreateNew)
            .await
            .expect("write");
        assert!(channel.remove("doc.json").await.expect("remove"));
        assert!(!channel.remove("doc.json").await.expect("remove again"));
    }
}
