//! Snapshot Persistence Manager
//!
//! Saves the whole keyspace to one file and restores it at startup.
//!
//! ## Save paths
//!
//! - `SAVE`: [`Persistence::save`] runs inline and the client waits for it.
//! - `BGSAVE`: [`Persistence::bgsave`] spawns a tracked task and returns at once.
//! - `SAVE <seconds> <changes>`: [`Persistence::start_background_save`] starts a
//!   loop that wakes every `seconds` and saves if at least `changes` keys
//!   changed since the last snapshot. Starting a new loop stops the old one.
//!
//! After [`Persistence::shutdown`] both background paths are refused, so nothing
//! is left running once the server has joined its tasks.
//!
//! Every save writes `<path>.tmp`, syncs it and renames it over `<path>`, so a
//! crash mid-write never destroys the previous snapshot. Saves are serialized
//! so two of them never race on the temp file.

use crate::persistence::snapshot::{self, SnapshotError, SnapshotReader, SnapshotRecord};
use crate::storage::{now_ms, StorageEngine};
use bytes::Bytes;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Errors from saving or loading a snapshot.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("persistence is shut down")]
    Closed,
}

/// Outcome of a successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub keys: usize,
    pub bytes: usize,
    /// Dirty count captured with the image and cleared by this save
    pub changes: u64,
}

/// Outcome of a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// False when there was no snapshot file
    pub found: bool,
    pub strings: usize,
    pub lists: usize,
    pub expiries: usize,
    /// When the snapshot was written, ms since epoch
    pub written_at: Option<i64>,
}

/// Handle to the running background save loop.
#[derive(Debug)]
struct BackgroundSaver {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    interval: Duration,
    threshold: u64,
}

impl BackgroundSaver {
    /// Signals the loop and waits for it to exit.
    ///
    /// A save that is already running finishes first.
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Background save loop ended abnormally");
        }
        info!(
            interval_secs = self.interval.as_secs(),
            threshold = self.threshold,
            "Background save loop stopped"
        );
    }
}

/// Owns the snapshot file for one keyspace.
#[derive(Debug)]
pub struct Persistence {
    storage: Arc<StorageEngine>,
    path: PathBuf,
    save_lock: Mutex<()>,
    background: Mutex<Option<BackgroundSaver>>,
    bgsaves: StdMutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl Persistence {
    pub fn new(storage: Arc<StorageEngine>, path: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            path: path.into(),
            save_lock: Mutex::new(()),
            background: Mutex::new(None),
            bgsaves: StdMutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a full snapshot and clears the dirty changes it captured.
    pub async fn save(&self) -> Result<SaveReport, PersistenceError> {
        let _guard = self.save_lock.lock().await;
        let started = Instant::now();

        let image = self.storage.image();
        let data = snapshot::encode(&image, now_ms());
        let tmp = temp_path(&self.path);

        if let Err(e) = write_synced(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            error!(path = %self.path.display(), error = %e, "Snapshot write failed");
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            error!(path = %self.path.display(), error = %e, "Snapshot rename failed");
            return Err(e.into());
        }

        self.storage.mark_saved();

        let report = SaveReport {
            keys: image.key_count(),
            bytes: data.len(),
            changes: image.dirty,
        };
        info!(
            path = %self.path.display(),
            keys = report.keys,
            bytes = report.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot saved"
        );
        Ok(report)
    }

    /// Restores the keyspace from the snapshot file.
    ///
    /// A missing file is not an error. On a corrupt or unreadable file the
    /// records decoded before the failure stay applied.
    pub async fn load(&self) -> Result<LoadReport, PersistenceError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No snapshot file found, starting empty");
                return Ok(LoadReport::default());
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read snapshot");
                return Err(e.into());
            }
        };

        let mut report = LoadReport {
            found: true,
            ..Default::default()
        };

        if let Err(e) = self.apply_snapshot(data, &mut report) {
            error!(
                path = %self.path.display(),
                error = %e,
                strings = report.strings,
                lists = report.lists,
                expiries = report.expiries,
                "Snapshot load stopped early, keeping partially loaded keys"
            );
            return Err(e.into());
        }

        info!(
            path = %self.path.display(),
            strings = report.strings,
            lists = report.lists,
            expiries = report.expiries,
            written_at = report.written_at,
            "Snapshot loaded"
        );
        Ok(report)
    }

    fn apply_snapshot(&self, data: Bytes, report: &mut LoadReport) -> Result<(), SnapshotError> {
        let mut reader = SnapshotReader::new(data)?;
        report.written_at = Some(reader.header().written_at);

        while let Some(record) = reader.next_record()? {
            match record {
                SnapshotRecord::String { key, value } => {
                    self.storage.restore_string(key, value);
                    report.strings += 1;
                }
                SnapshotRecord::List { key, items } => {
                    self.storage.restore_list(key, items);
                    report.lists += 1;
                }
                SnapshotRecord::Expiry { key, expires_at } => {
                    if self.storage.restore_expiry(key, expires_at) {
                        report.expiries += 1;
                    } else {
                        debug!("Skipping expiry for a key with no value");
                    }
                }
            }
        }
        Ok(())
    }

    /// Starts one tracked snapshot in the background.
    pub fn bgsave(self: &Arc<Self>) -> Result<(), PersistenceError> {
        let this = Arc::clone(self);
        let mut tasks = self.bgsaves.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            warn!("Background save refused, persistence is shut down");
            return Err(PersistenceError::Closed);
        }

        // Reap finished saves so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            if let Err(e) = this.save().await {
                error!(error = %e, "Background save failed");
            }
        });
        Ok(())
    }

    /// Starts (or replaces) the dirty-triggered background save loop.
    pub async fn start_background_save(
        self: &Arc<Self>,
        interval: Duration,
        threshold: u64,
    ) -> Result<(), PersistenceError> {
        let mut slot = self.background.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            warn!("Background save loop refused, persistence is shut down");
            return Err(PersistenceError::Closed);
        }
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(background_loop(
            Arc::clone(self),
            interval,
            threshold,
            shutdown_rx,
        ));

        *slot = Some(BackgroundSaver {
            shutdown_tx,
            handle,
            interval,
            threshold,
        });

        info!(
            interval_secs = interval.as_secs(),
            threshold = threshold,
            "Background save loop started"
        );
        Ok(())
    }

    /// Interval and threshold of the running background loop, if any.
    pub async fn background_schedule(&self) -> Option<(Duration, u64)> {
        self.background
            .lock()
            .await
            .as_ref()
            .map(|saver| (saver.interval, saver.threshold))
    }

    /// Stops the background loop and waits for in-flight background saves.
    ///
    /// Later calls to [`bgsave`](Self::bgsave) and
    /// [`start_background_save`](Self::start_background_save) fail with
    /// [`PersistenceError::Closed`]. `save` keeps working.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let saver = self.background.lock().await.take();
        if let Some(saver) = saver {
            saver.stop().await;
        }

        let mut tasks =
            std::mem::take(&mut *self.bgsaves.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background save task ended abnormally");
            }
        }
    }
}

/// Sleeps, checks the dirty counter, saves; until told to stop.
async fn background_loop(
    persistence: Arc<Persistence>,
    interval: Duration,
    threshold: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Background save loop received shutdown signal");
                    return;
                }
            }
        }

        let dirty = persistence.storage.dirty();
        if dirty < threshold {
            continue;
        }

        match persistence.save().await {
            Ok(report) => info!(
                changes = report.changes,
                keys = report.keys,
                "Background save completed"
            ),
            Err(e) => error!(error = %e, "Background save failed"),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}
