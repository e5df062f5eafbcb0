//! Durable bucketed key-value storage backed by sled.
//!
//! Each bucket is a sled tree. Writes are flushed before returning so a
//! successful `set` survives a crash; reads go straight to sled and never
//! observe a partially applied write.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::error::{AgentError, Result};

pub const BUCKET_DATA: &str = "data";
pub const BUCKET_SESSIONS: &str = "sessions";
pub const BUCKET_MODULES: &str = "modules";
pub const BUCKET_CONFIG: &str = "config";

/// Buckets created when a store is opened
pub const DEFAULT_BUCKETS: [&str; 4] = [BUCKET_DATA, BUCKET_SESSIONS, BUCKET_MODULES, BUCKET_CONFIG];

const SLED_DEFAULT_TREE: &[u8] = b"__sled__default";

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub path: PathBuf,
    pub buckets: BTreeMap<String, usize>,
    pub total_keys: usize,
    pub size_on_disk: u64,
}

/// Handle to the agent's embedded store; clones share the same database
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    path: PathBuf,
    trees: Arc<RwLock<HashMap<String, sled::Tree>>>,
    /// Shared by writers; held exclusively while a backup snapshots the buckets
    writes: Arc<RwLock<()>>,
}

impl Store {
    /// Open (or create) the store at `path` and make sure the default buckets exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;

        let mut trees = HashMap::new();
        for name in db.tree_names() {
            if name.as_ref() == SLED_DEFAULT_TREE {
                continue;
            }
            let tree = db.open_tree(&name)?;
            trees.insert(String::from_utf8_lossy(&name).into_owned(), tree);
        }

        for bucket in DEFAULT_BUCKETS {
            if !trees.contains_key(bucket) {
                trees.insert(bucket.to_string(), db.open_tree(bucket)?);
            }
        }
        db.flush()?;

        tracing::debug!(
            path = %path.display(),
            buckets = trees.len(),
            recovered = db.was_recovered(),
            "Store opened"
        );

        Ok(Self {
            db,
            path,
            trees: Arc::new(RwLock::new(trees)),
            writes: Arc::new(RwLock::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bucket(&self, bucket: &str) -> Result<sled::Tree> {
        let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
        trees
            .get(bucket)
            .cloned()
            .ok_or_else(|| AgentError::BucketNotFound(bucket.to_string()))
    }

    fn write_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.writes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn bucket_or_create(&self, bucket: &str) -> Result<sled::Tree> {
        if let Ok(tree) = self.bucket(bucket) {
            return Ok(tree);
        }

        let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
        if let Some(tree) = trees.get(bucket) {
            return Ok(tree.clone());
        }
        let tree = self.db.open_tree(bucket)?;
        trees.insert(bucket.to_string(), tree.clone());
        tracing::debug!(bucket, "Bucket created");
        Ok(tree)
    }

    /// Make sure `bucket` exists without touching its contents
    pub fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.bucket_or_create(bucket).map(|_| ())
    }

    /// Write a value, creating the bucket on first use
    pub fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        let tree = self.bucket_or_create(bucket)?;
        let _write = self.write_guard();
        tree.insert(key.as_bytes(), value)?;
        tree.flush()?;
        Ok(())
    }

    pub fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let tree = self.bucket(bucket)?;
        tree.get(key.as_bytes())?
            .map(|v| v.to_vec())
            .ok_or_else(|| AgentError::KeyNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    /// Delete a key; deleting a missing key is not an error
    pub fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let tree = self.bucket(bucket)?;
        let _write = self.write_guard();
        tree.remove(key.as_bytes())?;
        tree.flush()?;
        Ok(())
    }

    pub fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let tree = self.bucket(bucket)?;
        Ok(tree.contains_key(key.as_bytes())?)
    }

    /// Keys in `bucket` starting with `prefix`, in key order
    pub fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let tree = self.bucket(bucket)?;
        let mut keys = Vec::new();
        for entry in tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    pub fn get_all(&self, bucket: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let tree = self.bucket(bucket)?;
        let mut all = BTreeMap::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            all.insert(String::from_utf8_lossy(&key).into_owned(), value.to_vec());
        }
        Ok(all)
    }

    /// Empty a bucket, recreating it if it does not exist
    pub fn clear_bucket(&self, bucket: &str) -> Result<()> {
        let tree = self.bucket_or_create(bucket)?;
        let _write = self.write_guard();
        tree.clear()?;
        tree.flush()?;
        tracing::debug!(bucket, "Bucket cleared");
        Ok(())
    }

    /// Serialize `value` as JSON and store it
    pub fn set_json<T: Serialize>(&self, bucket: &str, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(bucket, key, &bytes)
    }

    /// Load a JSON value, mapping a missing key to `None`
    pub fn get_json<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<Option<T>> {
        match self.get(bucket, key) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(AgentError::KeyNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Copy every bucket into a new database at `path`
    ///
    /// Writers are paused only while the buckets are read into memory, so the
    /// copy is a single point in time across all buckets. Writing the copy to
    /// disk happens after writers resume.
    pub fn backup(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let target = path.as_ref().to_path_buf();
        if target.exists() {
            return Err(AgentError::Storage(sled::Error::Unsupported(format!(
                "backup target already exists: {}",
                target.display()
            ))));
        }

        let snapshot = {
            let _paused = self.writes.write().unwrap_or_else(|e| e.into_inner());
            let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
            let mut snapshot = Vec::with_capacity(trees.len());
            for (name, tree) in trees.iter() {
                let entries = tree.iter().collect::<std::result::Result<Vec<_>, _>>()?;
                snapshot.push((name.clone(), entries));
            }
            snapshot
        };

        let backup = sled::open(&target)?;
        let mut copied = 0usize;
        for (name, entries) in snapshot {
            let destination = backup.open_tree(&name)?;
            for (key, value) in entries {
                destination.insert(key, value)?;
                copied += 1;
            }
        }
        backup.flush()?;

        tracing::info!(path = %target.display(), keys = copied, "Store backup written");
        Ok(target)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
        let buckets: BTreeMap<String, usize> = trees
            .iter()
            .map(|(name, tree)| (name.clone(), tree.len()))
            .collect();
        let total_keys = buckets.values().sum();

        Ok(StoreStats {
            path: self.path.clone(),
            buckets,
            total_keys,
            size_on_disk: self.db.size_on_disk()?,
        })
    }

    /// Flush outstanding writes; the database closes when the last handle drops
    pub fn close(&self) -> Result<()> {
        self.db.flush()?;
        tracing::debug!(path = %self.path.display(), "Store flushed for close");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("agent.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn set_then_get_returns_value() {
        let (_dir, store) = open_temp();

        store.set(BUCKET_DATA, "greeting", b"hello").unwrap();
        assert_eq!(store.get(BUCKET_DATA, "greeting").unwrap(), b"hello");

        store.set(BUCKET_DATA, "greeting", b"again").unwrap();
        assert_eq!(store.get(BUCKET_DATA, "greeting").unwrap(), b"again");
    }

    #[test]
    fn delete_makes_key_not_found() {
        let (_dir, store) = open_temp();

        store.set(BUCKET_DATA, "k", b"v").unwrap();
        assert!(store.exists(BUCKET_DATA, "k").unwrap());

        store.delete(BUCKET_DATA, "k").unwrap();
        assert!(!store.exists(BUCKET_DATA, "k").unwrap());
        assert!(matches!(
            store.get(BUCKET_DATA, "k"),
            Err(AgentError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn default_buckets_exist_after_open() {
        let (_dir, store) = open_temp();
        let stats = store.stats().unwrap();

        for bucket in DEFAULT_BUCKETS {
            assert!(stats.buckets.contains_key(bucket), "missing {bucket}");
        }
    }

    #[test]
    fn missing_bucket_operations_fail() {
        let (_dir, store) = open_temp();

        assert!(matches!(store.get("nope", "k"), Err(AgentError::BucketNotFound(_))));
        assert!(matches!(store.delete("nope", "k"), Err(AgentError::BucketNotFound(_))));
        assert!(matches!(store.exists("nope", "k"), Err(AgentError::BucketNotFound(_))));
        assert!(matches!(store.list("nope", ""), Err(AgentError::BucketNotFound(_))));
        assert!(matches!(store.get_all("nope"), Err(AgentError::BucketNotFound(_))));
    }

    #[test]
    fn set_creates_additional_bucket() {
        let (_dir, store) = open_temp();

        store.set("credentials", "u1/abc", b"{}").unwrap();
        assert_eq!(store.list("credentials", "u1/").unwrap(), vec!["u1/abc"]);
    }

    #[test]
    fn list_matches_prefix_within_bucket_only() {
        let (_dir, store) = open_temp();

        store.set(BUCKET_DATA, "app:one", b"1").unwrap();
        store.set(BUCKET_DATA, "app:two", b"2").unwrap();
        store.set(BUCKET_DATA, "other:three", b"3").unwrap();
        store.set(BUCKET_CONFIG, "app:four", b"4").unwrap();

        let keys = store.list(BUCKET_DATA, "app:").unwrap();
        assert_eq!(keys, vec!["app:one", "app:two"]);

        let all = store.list(BUCKET_DATA, "").unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn clear_bucket_leaves_other_buckets_untouched() {
        let (_dir, store) = open_temp();

        store.set(BUCKET_DATA, "a", b"1").unwrap();
        store.set(BUCKET_DATA, "b", b"2").unwrap();
        store.set(BUCKET_CONFIG, "c", b"3").unwrap();

        store.clear_bucket(BUCKET_DATA).unwrap();

        assert!(store.get_all(BUCKET_DATA).unwrap().is_empty());
        let config = store.get_all(BUCKET_CONFIG).unwrap();
        assert_eq!(config.get("c").map(Vec::as_slice), Some(&b"3"[..]));
    }

    #[test]
    fn clear_bucket_recreates_missing_bucket() {
        let (_dir, store) = open_temp();

        store.clear_bucket("scratch").unwrap();
        assert!(store.get_all("scratch").unwrap().is_empty());
    }

    #[test]
    fn json_helpers_round_trip_structs() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Record {
            name: String,
            count: u32,
        }

        let (_dir, store) = open_temp();
        let record = Record { name: "x".to_string(), count: 7 };

        store.set_json(BUCKET_DATA, "record", &record).unwrap();
        let loaded: Option<Record> = store.get_json(BUCKET_DATA, "record").unwrap();
        assert_eq!(loaded, Some(record));

        let missing: Option<Record> = store.get_json(BUCKET_DATA, "missing").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.db");

        {
            let store = Store::open(&path).unwrap();
            store.set("custom", "k", b"persisted").unwrap();
            store.close().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.get("custom", "k").unwrap(), b"persisted");
    }

    #[test]
    fn backup_copies_all_buckets() {
        let (dir, store) = open_temp();
        store.set(BUCKET_DATA, "a", b"1").unwrap();
        store.set("custom", "b", b"2").unwrap();

        let backup_path = dir.path().join("backup.db");
        store.backup(&backup_path).unwrap();

        let copy = Store::open(&backup_path).unwrap();
        assert_eq!(copy.get(BUCKET_DATA, "a").unwrap(), b"1");
        assert_eq!(copy.get("custom", "b").unwrap(), b"2");
    }

    #[test]
    fn backup_to_unwritable_target_is_an_error() {
        let (dir, store) = open_temp();
        let file = dir.path().join("plain-file");
        std::fs::write(&file, b"not a directory").unwrap();

        assert!(store.backup(file.join("backup.db")).is_err());
    }

    #[test]
    fn backup_while_writing_yields_openable_copy() {
        let (dir, store) = open_temp();
        store.set(BUCKET_CONFIG, "stable", b"kept").unwrap();
        for i in 0..50 {
            store.set(BUCKET_DATA, &format!("seed:{i:03}"), b"seed").unwrap();
        }

        // Each step writes `data` first and then `config`, so any point-in-time
        // copy that holds a `config` entry also holds the matching `data` entry.
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("live:{i:03}");
                    store.set(BUCKET_DATA, &key, &[b'x'; 256]).unwrap();
                    store.set(BUCKET_CONFIG, &key, b"done").unwrap();
                }
            })
        };

        let backup_path = dir.path().join("during.db");
        store.backup(&backup_path).unwrap();
        writer.join().unwrap();

        let copy = Store::open(&backup_path).unwrap();
        assert_eq!(copy.get(BUCKET_CONFIG, "stable").unwrap(), b"kept");
        assert_eq!(copy.list(BUCKET_DATA, "seed:").unwrap().len(), 50);
        for key in copy.list(BUCKET_DATA, "live:").unwrap() {
            assert_eq!(copy.get(BUCKET_DATA, &key).unwrap(), vec![b'x'; 256]);
        }
        for key in copy.list(BUCKET_CONFIG, "live:").unwrap() {
            assert!(copy.exists(BUCKET_DATA, &key).unwrap(), "{key} missing from data");
        }

        copy.set(BUCKET_DATA, "after", b"restore").unwrap();
        assert_eq!(copy.get(BUCKET_DATA, "after").unwrap(), b"restore");
    }

    #[test]
    fn backup_refuses_existing_target() {
        let (dir, store) = open_temp();
        let target = dir.path().join("exists");
        std::fs::create_dir_all(&target).unwrap();

        assert!(store.backup(&target).is_err());
    }

    #[test]
    fn concurrent_writers_and_readers_see_whole_values() {
        let (_dir, store) = open_temp();
        let value_a = vec![b'a'; 4096];
        let value_b = vec![b'b'; 4096];
        store.set(BUCKET_DATA, "shared", &value_a).unwrap();

        let writer = {
            let store = store.clone();
            let (a, b) = (value_a.clone(), value_b.clone());
            std::thread::spawn(move || {
                for i in 0..200 {
                    let v = if i % 2 == 0 { &a } else { &b };
                    store.set(BUCKET_DATA, "shared", v).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let read = store.get(BUCKET_DATA, "shared").unwrap();
            assert!(read == value_a || read == value_b);
        }
        writer.join().unwrap();
    }
}
