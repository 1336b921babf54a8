//! Multistore: redb-backed row storage for one table replica.
//!
//! Rows are `&str` keys mapped to opaque `&[u8]` values. All access goes
//! through a [`StoreSubview`], which rejects keys outside its region and
//! scopes scans and erasure to it.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase};
use tracing::debug;

use tabula_core::{Region, RightBound, StoreKey};

use crate::error::{StoreError, StoreResult};
use crate::tables::ROWS;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// The storage of one table replica.
#[derive(Clone)]
pub struct Multistore {
    db: Arc<Database>,
}

impl Multistore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "multistore opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory multistore opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ROWS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// A view of the store restricted to `region`.
    pub fn subview(&self, region: Region) -> StoreSubview {
        StoreSubview {
            db: Arc::clone(&self.db),
            region,
        }
    }
}

/// A handle on one region of a [`Multistore`].
pub struct StoreSubview {
    db: Arc<Database>,
    region: Region,
}

impl std::fmt::Debug for StoreSubview {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSubview")
            .field("region", &self.region)
            .finish()
    }
}

impl StoreSubview {
    pub fn region(&self) -> &Region {
        &self.region
    }

    fn check_key(&self, key: &StoreKey) -> StoreResult<()> {
        if self.region.contains_key(key) {
            Ok(())
        } else {
            Err(StoreError::OutOfRegion {
                key: key.to_string(),
                region: self.region.to_string(),
            })
        }
    }

    pub fn get(&self, key: &StoreKey) -> StoreResult<Option<Vec<u8>>> {
        self.check_key(key)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROWS).map_err(map_err!(Table))?;
        let value = table
            .get(key.0.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Insert or overwrite a row.
    pub fn put(&self, key: &StoreKey, value: &[u8]) -> StoreResult<()> {
        self.check_key(key)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROWS).map_err(map_err!(Table))?;
            table
                .insert(key.0.as_str(), value)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Delete a row. Returns true if it existed.
    pub fn delete(&self, key: &StoreKey) -> StoreResult<bool> {
        self.check_key(key)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ROWS).map_err(map_err!(Table))?;
            existed = table
                .remove(key.0.as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Keys in this view's region, in order, up to `limit`.
    pub fn keys(&self, limit: Option<usize>) -> StoreResult<Vec<StoreKey>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROWS).map_err(map_err!(Table))?;
        let left = self.region.left.0.as_str();
        let range = match &self.region.right {
            RightBound::Key(right) => table.range::<&str>(left..right.0.as_str()),
            RightBound::Unbounded => table.range::<&str>(left..),
        }
        .map_err(map_err!(Read))?;

        let mut keys = Vec::new();
        for entry in range {
            if limit.is_some_and(|n| keys.len() >= n) {
                break;
            }
            let (key, _) = entry.map_err(map_err!(Read))?;
            keys.push(StoreKey(key.value().to_string()));
        }
        Ok(keys)
    }

    /// Delete up to `max` rows from this view's region in one transaction.
    ///
    /// Returns how many rows were deleted; zero means the region is empty.
    pub fn erase_chunk(&self, max: usize) -> StoreResult<usize> {
        let keys = self.keys(Some(max))?;
        if keys.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROWS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.0.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(region = %self.region, erased = keys.len(), "erased chunk");
        Ok(keys.len())
    }
}
