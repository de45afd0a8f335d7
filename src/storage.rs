// src/storage.rs
// RocksDB-backed persistence for blocks, pending transactions and the validator set.

use crate::errors::{ChainError, Result};
use rocksdb::{Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

/// Shared handle (Arc for cheap cloning)
pub type RocksDb = Arc<DB>;

/// Open RocksDB, retrying with backoff while another process releases the lock.
pub fn try_open_db<P: AsRef<Path>>(path: P) -> Result<RocksDb> {
    let path = path.as_ref();
    let max_attempts = 6u32;
    let mut attempt = 0u32;
    let mut wait = 250u64;

    loop {
        match open_rocksdb_internal(path) {
            Ok(db) => return Ok(Arc::new(db)),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(ChainError::Storage(format!(
                        "failed to open RocksDB at '{}' after {} attempts: {}",
                        path.display(),
                        attempt,
                        e
                    )));
                }
                log::warn!(
                    "STORAGE: open attempt {}/{} failed: {}, retrying in {}ms",
                    attempt,
                    max_attempts,
                    e,
                    wait
                );
                sleep(Duration::from_millis(wait));
                wait = std::cmp::min(wait * 2, 2000);
            }
        }
    }
}

fn open_rocksdb_internal(path: &Path) -> std::result::Result<DB, rocksdb::Error> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.increase_parallelism(num_cpus::get() as i32);
    opts.set_max_background_jobs(2);
    opts.set_write_buffer_size(16 * 1024 * 1024);
    opts.set_max_open_files(256);
    DB::open(&opts, path)
}

pub fn put<K: AsRef<[u8]>, V: Serialize>(db: &RocksDb, key: K, val: &V) -> Result<()> {
    let bytes = serde_json::to_vec(val)?;
    db.put(key, bytes)?;
    Ok(())
}

pub fn get<K: AsRef<[u8]>, T: DeserializeOwned>(db: &RocksDb, key: K) -> Result<Option<T>> {
    match db.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice::<T>(&bytes)?)),
        None => Ok(None),
    }
}

/// Values whose keys start with `prefix`, in key order.
pub fn iter_prefix<T: DeserializeOwned>(db: &RocksDb, prefix: &[u8]) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for item in db.prefix_iterator(prefix) {
        let (k, v) = item?;
        if !k.starts_with(prefix) {
            break;
        }
        out.push(serde_json::from_slice::<T>(&v)?);
    }
    Ok(out)
}

/// Puts and deletes applied together in one RocksDB write batch.
#[derive(Default)]
pub struct StoreBatch {
    batch: WriteBatch,
}

impl StoreBatch {
    pub fn put<K: AsRef<[u8]>, V: Serialize>(&mut self, key: K, val: &V) -> Result<()> {
        self.batch.put(key, serde_json::to_vec(val)?);
        Ok(())
    }

    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.batch.delete(key);
    }

    pub fn commit(self, db: &RocksDb) -> Result<()> {
        db.write(self.batch)?;
        Ok(())
    }
}
