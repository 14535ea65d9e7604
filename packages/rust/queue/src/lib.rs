//! Durable per-client work queue.
//!
//! Producers append raw records with [`QueueStore::push`]; the polling loop
//! takes everything with [`QueueStore::drain`]. The [`FileQueueStore`]
//! backend keeps one JSON array file per client:
//!
//! ```text
//! <data_dir>/
//! ├── <client>.json      pending records, arrival order
//! └── .<client>.lock     advisory lock, held around every read-modify-write
//! ```
//!
//! Every rewrite goes through a temp file and a rename, so a reader never
//! observes half-written JSON.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use tracing::{debug, info, instrument, warn};

use ctirelay_shared::{ClientId, CtiRelayError, RawRecord, Result};

/// File extension of queue files.
const QUEUE_EXT: &str = ".json";

// ---------------------------------------------------------------------------
// QueueStore
// ---------------------------------------------------------------------------

/// At-least-once work queue keyed by client.
pub trait QueueStore: Send + Sync {
    /// Append `records` to the client's queue, creating it if needed.
    /// Returns the number of records pending after the append.
    fn push(&self, client: &ClientId, records: &[RawRecord]) -> Result<usize>;

    /// Take every pending record and leave the queue empty.
    fn drain(&self, client: &ClientId) -> Result<Vec<RawRecord>>;

    /// Put previously drained records back in front of anything pushed since.
    fn requeue(&self, client: &ClientId, records: Vec<RawRecord>) -> Result<()>;

    /// All clients that currently own a queue, sorted.
    fn clients(&self) -> Result<Vec<ClientId>>;
}

// ---------------------------------------------------------------------------
// FileQueueStore
// ---------------------------------------------------------------------------

/// [`QueueStore`] backed by one JSON file per client.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    dir: PathBuf,
}

impl FileQueueStore {
    /// Open (creating if absent) a queue directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| CtiRelayError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Path of the client's queue file.
    pub fn queue_path(&self, client: &ClientId) -> PathBuf {
        self.dir.join(format!("{client}{QUEUE_EXT}"))
    }

    fn lock_path(&self, client: &ClientId) -> PathBuf {
        self.dir.join(format!(".{client}.lock"))
    }

    fn temp_path(&self, client: &ClientId) -> PathBuf {
        self.dir.join(format!(".{client}{QUEUE_EXT}.tmp"))
    }

    /// Acquire the client's exclusive lock, blocking until it is free.
    fn lock(&self, client: &ClientId) -> Result<ClientLock> {
        // The directory may have been removed underneath a long-running process.
        std::fs::create_dir_all(&self.dir).map_err(|e| CtiRelayError::io(&self.dir, e))?;

        let path = self.lock_path(client);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CtiRelayError::io(&path, e))?;
        file.lock_exclusive().map_err(|e| {
            CtiRelayError::Queue(format!("failed to lock {}: {e}", path.display()))
        })?;
        Ok(ClientLock { file })
    }

    /// Read the client's queue. Missing, empty, or unparsable content all
    /// yield an empty list; unparsable content is first copied aside.
    fn read_queue(&self, client: &ClientId) -> Result<Vec<RawRecord>> {
        let path = self.queue_path(client);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CtiRelayError::io(&path, e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        match serde_json::from_slice::<Vec<RawRecord>>(&bytes) {
            Ok(records) => Ok(records),
            Err(e) => {
                let backup = self.preserve_corrupt(&path, &bytes)?;
                warn!(
                    %client,
                    error = %e,
                    backup = %backup.display(),
                    "queue file is not a JSON array, treating as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    fn preserve_corrupt(&self, path: &Path, bytes: &[u8]) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let backup = PathBuf::from(format!("{}.corrupt-{stamp}", path.display()));
        std::fs::write(&backup, bytes).map_err(|e| CtiRelayError::io(&backup, e))?;
        Ok(backup)
    }

    /// Replace the client's queue in full (write temp, fsync, rename).
    fn write_queue(&self, client: &ClientId, records: &[RawRecord]) -> Result<()> {
        let target = self.queue_path(client);
        let temp = self.temp_path(client);

        let body = serde_json::to_vec(records)?;
        let mut file = File::create(&temp).map_err(|e| CtiRelayError::io(&temp, e))?;
        file.write_all(&body)
            .and_then(|()| file.sync_all())
            .map_err(|e| CtiRelayError::io(&temp, e))?;
        drop(file);

        std::fs::rename(&temp, &target).map_err(|e| CtiRelayError::io(&target, e))?;
        Ok(())
    }
}

impl QueueStore for FileQueueStore {
    #[instrument(skip_all, fields(client = %client, incoming = records.len()))]
    fn push(&self, client: &ClientId, records: &[RawRecord]) -> Result<usize> {
        let _guard = self.lock(client)?;

        let mut queued = self.read_queue(client)?;
        queued.extend_from_slice(records);
        self.write_queue(client, &queued)?;

        debug!(pending = queued.len(), "records appended");
        Ok(queued.len())
    }

    #[instrument(skip_all, fields(client = %client))]
    fn drain(&self, client: &ClientId) -> Result<Vec<RawRecord>> {
        let _guard = self.lock(client)?;

        let records = self.read_queue(client)?;
        if records.is_empty() && !self.queue_path(client).exists() {
            return Ok(records);
        }
        self.write_queue(client, &[])?;

        if !records.is_empty() {
            info!(drained = records.len(), "queue drained");
        }
        Ok(records)
    }

    #[instrument(skip_all, fields(client = %client, restored = records.len()))]
    fn requeue(&self, client: &ClientId, mut records: Vec<RawRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.lock(client)?;

        let newer = self.read_queue(client)?;
        records.extend(newer);
        self.write_queue(client, &records)?;

        info!(pending = records.len(), "records requeued");
        Ok(())
    }

    fn clients(&self) -> Result<Vec<ClientId>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CtiRelayError::io(&self.dir, e)),
        };

        let mut clients = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CtiRelayError::io(&self.dir, e))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(QUEUE_EXT) else {
                continue;
            };
            match ClientId::new(stem) {
                Ok(id) => clients.push(id),
                Err(_) => debug!(file = name, "ignoring foreign file in queue directory"),
            }
        }
        clients.sort();
        Ok(clients)
    }
}

/// Holds a client's advisory lock; released on drop.
struct ClientLock {
    file: File,
}

impl Drop for ClientLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well.
        let _ = FileExt::unlock(&self.file);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
