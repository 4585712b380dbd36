/*!
 * Append-Only Log Persistence
 *
 * Every accepted mutation is appended to a newline-delimited log file in
 * the shared command grammar. On startup the log is replayed to rebuild
 * the store; a periodic compaction rewrites the log down to the live
 * dataset and swaps it in with an atomic rename, so no reader ever
 * observes a half-written file.
 *
 * Durability stops at the OS write (no sync barrier), and an append
 * failure only degrades durability; it never takes the store down.
 */

use crate::protocol::Command;
use crate::shutdown::Shutdown;
use crate::storage::Store;
use anyhow::{Context, Result};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Append-only command log with periodic compaction.
///
/// Keeps one long-lived append handle behind a mutex; the same mutex
/// serializes appends against the compaction file swap.
pub struct Aof {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl Aof {
    /// Create a log bound to `path`.
    ///
    /// The file itself is opened lazily on first append, so a missing or
    /// unwritable path never prevents the store from serving.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one encoded command line.
    ///
    /// A failure to open or write the file is reported as a diagnostic
    /// and otherwise swallowed: the write is lost from the log but the
    /// operation in the store stands.
    pub fn append(&self, cmd: &Command) {
        let mut guard = self.file.lock();
        if guard.is_none() {
            match open_append(&self.path) {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    error!("failed to open log {}: {}", self.path.display(), e);
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            let mut line = cmd.to_string();
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()) {
                error!("log append failed, entry lost: {}", e);
                // drop the handle so the next append retries the open
                *guard = None;
            }
        }
    }

    /// Replay the log into `store`, in file order.
    ///
    /// Lines that fail to decode are skipped with a diagnostic; this is
    /// what tolerates the truncated trailing line a crash mid-append can
    /// leave behind. Returns the number of entries applied.
    pub fn replay(&self, store: &Store) -> Result<usize> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("no log at {}, starting empty", self.path.display());
                return Ok(0);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open log {}", self.path.display()))
            }
        };

        let mut applied = 0;
        for line in BufReader::new(file).lines() {
            let line = line.context("log read failed mid-replay")?;
            if line.trim().is_empty() {
                continue;
            }
            match Command::decode(&line) {
                Ok(cmd) => {
                    store.apply(&cmd);
                    applied += 1;
                }
                Err(e) => warn!("skipping undecodable log line {:?}: {}", line, e),
            }
        }
        Ok(applied)
    }

    /// Rewrite the log down to the store's current live dataset.
    ///
    /// The snapshot is written to a temporary file and renamed over the
    /// live path. The whole capture-to-swap sequence runs inside
    /// [`Store::freeze`] and under the append mutex, so no concurrent
    /// append can land between the snapshot and the rename and be lost.
    // TODO: skip the rewrite when the log has not grown past the live
    // set since the previous cycle.
    pub fn compact(&self, store: &Store) -> Result<()> {
        store.freeze(|snapshot| {
            let mut guard = self.file.lock();

            let mut tmp_path = self.path.as_os_str().to_owned();
            tmp_path.push(".tmp");
            let tmp_path = PathBuf::from(tmp_path);

            let tmp = File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            let mut writer = BufWriter::new(tmp);
            for cmd in snapshot {
                writeln!(writer, "{}", cmd).context("snapshot write failed")?;
            }
            writer.flush().context("snapshot flush failed")?;
            drop(writer);

            fs::rename(&tmp_path, &self.path)
                .with_context(|| format!("failed to swap in {}", self.path.display()))?;

            // the old handle points at the renamed-over inode; reopen
            *guard = match open_append(&self.path) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!("failed to reopen log after compaction: {}", e);
                    None
                }
            };

            info!("compacted log to {} live entries", snapshot.len());
            Ok(())
        })
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Spawn the periodic compaction task.
///
/// Compacts every `interval` until the shutdown token is triggered; a
/// failed cycle is logged and the next one runs as scheduled.
pub fn spawn_compactor(
    aof: Arc<Aof>,
    store: Arc<Store>,
    interval: Duration,
    shutdown: Shutdown,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("compactor".into())
        .spawn(move || {
            while !shutdown.wait(interval) {
                if let Err(e) = aof.compact(&store) {
                    error!("log compaction failed: {:#}", e);
                }
            }
        })
        .context("failed to spawn compactor thread")
}
