/*!
 * In-Memory Store Engine
 *
 * This module provides the core storage layer: a single map of keys to
 * TTL-carrying records behind one coarse reader/writer lock, using AHash
 * for fast lookups. An expired record is never observable through a
 * lookup, whether or not the background sweep has physically removed it.
 */

use crate::protocol::Command;
use crate::shutdown::Shutdown;
use anyhow::{Context, Result};
use log::debug;
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// AHash is designed for hash tables and outperforms the default SipHash
type AHashBuilder = BuildHasherDefault<ahash::AHasher>;

type Map = HashMap<String, Entry, AHashBuilder>;

/// Default maximum key length in bytes
pub const DEFAULT_MAX_KEY_LEN: usize = 1024;
/// Default maximum value length in bytes (1 MiB)
pub const DEFAULT_MAX_VALUE_LEN: usize = 1 << 20;

/// One stored record: a value and an optional absolute expiry instant.
///
/// Records are owned exclusively by the store and never leave its lock;
/// lookups hand out clones of the value.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Concurrent key-value store with per-record TTL.
///
/// All access serializes through one reader/writer lock over the whole
/// map (coarse-grained by design, not per-key). Size limits are enforced
/// on `set`; a violating write is rejected without touching the map.
pub struct Store {
    inner: RwLock<Map>,
    max_key_len: usize,
    max_value_len: usize,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create an empty store with the default size limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_KEY_LEN, DEFAULT_MAX_VALUE_LEN)
    }

    /// Create an empty store with explicit key/value size limits.
    pub fn with_limits(max_key_len: usize, max_value_len: usize) -> Self {
        Self {
            inner: RwLock::new(Map::default()),
            max_key_len,
            max_value_len,
        }
    }

    /// Insert or overwrite a key.
    ///
    /// Returns `false` (and leaves the store unmodified) if the key or
    /// value exceeds the configured limits. With a TTL, the expiry is
    /// fixed at `now + ttl` when the write lands.
    pub fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> bool {
        if key.len() > self.max_key_len || value.len() > self.max_value_len {
            return false;
        }
        let expires_at = ttl_seconds.map(|secs| Instant::now() + Duration::from_secs(secs));
        self.inner.write().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        true
    }

    /// Look up a key.
    ///
    /// An expired entry is treated as absent. Expiry is handled in two
    /// phases: a shared-mode probe, and only on an expired hit a separate
    /// exclusive-mode removal with a re-check, so the shared lock is
    /// never used to mutate. The re-check matters: the key may have been
    /// rewritten between the two lock acquisitions.
    pub fn get(&self, key: &str) -> Option<String> {
        {
            let map = self.inner.read();
            match map.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(Instant::now()) => {
                    return Some(entry.value.clone());
                }
                Some(_) => {} // expired: fall through to the evict path
            }
        }

        let mut map = self.inner.write();
        if let Some(entry) = map.get(key) {
            if entry.is_expired(Instant::now()) {
                map.remove(key);
            } else {
                return Some(entry.value.clone());
            }
        }
        None
    }

    /// Delete a key.
    ///
    /// Returns whether the key existed. Deletion is total removal, not a
    /// tombstone.
    pub fn del(&self, key: &str) -> bool {
        self.inner.write().remove(key).is_some()
    }

    /// Number of entries currently in the map.
    ///
    /// Deliberately weak semantics: expired entries that the sweep has
    /// not yet removed are still counted.
    pub fn size(&self) -> usize {
        self.inner.read().len()
    }

    /// Apply a decoded log/replication entry.
    ///
    /// Returns whether the command mutated the store (a rejected `SET` or
    /// a `DELETE` of an absent key does not).
    pub fn apply(&self, cmd: &Command) -> bool {
        match cmd {
            Command::Set { key, value, ttl } => self.set(key, value, *ttl),
            Command::Delete { key } => self.del(key),
        }
    }

    /// Remove every expired entry in one pass.
    ///
    /// Takes the exclusive lock once and scans the full map; linear cost
    /// per cycle, which is the accepted trade at this scale and a known
    /// limit at very large key counts.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut map = self.inner.write();
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired(now));
        let removed = before - map.len();
        drop(map);
        if removed > 0 {
            debug!("sweep removed {} expired entries", removed);
        }
    }

    /// Copy out every live entry as a `SET` command, TTLs recomputed as
    /// time remaining from this instant.
    pub fn snapshot_view(&self) -> Vec<Command> {
        Self::snapshot_of(&self.inner.read())
    }

    /// Run `f` against a snapshot while the store lock is still held,
    /// blocking every mutation until `f` returns.
    ///
    /// This is the sequencing primitive log compaction relies on: nothing
    /// can land between the snapshot capture and the file swap performed
    /// inside `f`.
    pub fn freeze<R>(&self, f: impl FnOnce(&[Command]) -> R) -> R {
        let map = self.inner.read();
        let snapshot = Self::snapshot_of(&map);
        f(&snapshot)
    }

    fn snapshot_of(map: &RwLockReadGuard<'_, Map>) -> Vec<Command> {
        let now = Instant::now();
        map.iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| Command::Set {
                key: key.clone(),
                value: entry.value.clone(),
                ttl: entry.expires_at.map(|at| remaining_seconds(at, now)),
            })
            .collect()
    }
}

/// Remaining TTL in whole seconds, rounded up so a key that is live at
/// capture never serializes to `EX 0` and dies instantly on replay.
fn remaining_seconds(expires_at: Instant, now: Instant) -> u64 {
    let remaining = expires_at - now;
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Spawn the periodic expiry sweep task.
///
/// Runs `store.sweep()` every `interval` until the shutdown token is
/// triggered; the wait itself is cancellable, so stopping does not cost
/// a full interval.
pub fn spawn_sweeper(
    store: Arc<Store>,
    interval: Duration,
    shutdown: Shutdown,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("sweeper".into())
        .spawn(move || {
            while !shutdown.wait(interval) {
                store.sweep();
            }
        })
        .context("failed to spawn sweeper thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del_roundtrip() {
        let store = Store::new();
        assert!(store.set("a", "1", None));
        assert_eq!(store.get("a"), Some("1".to_string()));
        assert!(store.del("a"));
        assert!(!store.del("a"));
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn oversized_writes_rejected_without_mutation() {
        let store = Store::with_limits(4, 8);
        assert!(!store.set("too-long-key", "v", None));
        assert!(!store.set("k", "value-too-long", None));
        assert_eq!(store.size(), 0);
        assert!(store.set("k", "v", None));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn expired_entry_invisible_before_sweep() {
        let store = Store::new();
        // ttl of zero expires immediately; no sweeper is running here
        assert!(store.set("gone", "x", Some(0)));
        assert_eq!(store.get("gone"), None);
        // the lazy path also evicted it
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn size_counts_unswept_expired_entries() {
        let store = Store::new();
        store.set("gone", "x", Some(0));
        store.set("kept", "y", None);
        // documented weak semantics: nothing has touched "gone" yet
        assert_eq!(store.size(), 2);
        store.sweep();
        assert_eq!(store.size(), 1);
        assert_eq!(store.get("kept"), Some("y".to_string()));
    }

    #[test]
    fn snapshot_skips_expired_and_keeps_ttls() {
        let store = Store::new();
        store.set("plain", "1", None);
        store.set("timed", "2", Some(50));
        store.set("gone", "3", Some(0));
        let snapshot = store.snapshot_view();
        assert_eq!(snapshot.len(), 2);
        for cmd in snapshot {
            match cmd {
                Command::Set { key, ttl, .. } if key == "plain" => assert_eq!(ttl, None),
                Command::Set { key, ttl, .. } if key == "timed" => {
                    let t = ttl.expect("ttl preserved");
                    assert!(t >= 49 && t <= 50, "remaining ttl {}", t);
                }
                other => panic!("unexpected snapshot entry {:?}", other),
            }
        }
    }

    #[test]
    fn concurrent_disjoint_writers_lose_nothing() {
        let store = Arc::new(Store::new());
        for i in 0..4 {
            store.set(&format!("pre{}", i), "seed", None);
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for round in 0..100 {
                    store.set(&format!("w{}", i), &format!("{}", round), None);
                }
            }));
        }
        for _ in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..400 {
                    assert_eq!(store.get(&format!("pre{}", i % 4)), Some("seed".to_string()));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.size(), 4 + 8);
        for i in 0..8 {
            assert_eq!(store.get(&format!("w{}", i)), Some("99".to_string()));
        }
    }
}
