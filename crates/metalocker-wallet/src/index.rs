//! The wallet's root index: which records belong to which locker.
//!
//! The index is the fast path of `DataStore` loads and the authority for
//! revocations: it remembers, per record id, the locker, participant and
//! key index the record was attributed to. A redb-backed implementation
//! persists it next to the wallet; the in-memory one backs tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use metalocker::RecordOperation;
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// One attributed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIndexEntry {
    #[serde(rename = "recordID")]
    pub record_id: String,
    #[serde(rename = "lockerID")]
    pub locker_id: String,
    #[serde(rename = "participantID")]
    pub participant_id: String,
    #[serde(rename = "keyIndex")]
    pub key_index: u32,
    pub operation: RecordOperation,
    #[serde(rename = "blockNumber")]
    pub block_number: u64,
}

/// Write-and-lookup interface of the root index
pub trait RootIndex: Send + Sync {
    /// Registers an attributed record; idempotent per record id
    fn put_record(&self, entry: &RecordIndexEntry) -> Result<()>;
    /// Looks up the attribution of a record
    fn get_record(&self, record_id: &str) -> Result<Option<RecordIndexEntry>>;
    /// Lists all attributed records
    fn list_records(&self) -> Result<Vec<RecordIndexEntry>>;
}

/// An in-memory [`RootIndex`]
#[derive(Default)]
pub struct MemoryRootIndex {
    records: Mutex<HashMap<String, RecordIndexEntry>>,
}

impl MemoryRootIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RootIndex for MemoryRootIndex {
    fn put_record(&self, entry: &RecordIndexEntry) -> Result<()> {
        self.records
            .lock()
            .expect("the index mutex is never poisoned")
            .insert(entry.record_id.clone(), entry.clone());
        Ok(())
    }

    fn get_record(&self, record_id: &str) -> Result<Option<RecordIndexEntry>> {
        Ok(self
            .records
            .lock()
            .expect("the index mutex is never poisoned")
            .get(record_id)
            .cloned())
    }

    fn list_records(&self) -> Result<Vec<RecordIndexEntry>> {
        let mut entries: Vec<_> = self
            .records
            .lock()
            .expect("the index mutex is never poisoned")
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        Ok(entries)
    }
}

/// A redb-backed [`RootIndex`]
pub struct LocalRootIndex(redb::Database);

impl LocalRootIndex {
    /// Opens (or creates) the index database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let db = redb::Database::create(path).map_err(|e| {
            Error::Database(format!("cannot create index at {}: {e}", path.display()))
        })?;
        log::debug!("LocalRootIndex::open - path={}", path.display());
        Ok(Self(db))
    }
}

impl RootIndex for LocalRootIndex {
    fn put_record(&self, entry: &RecordIndexEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        let tx = self.0.begin_write().map_err(redb::Error::from)?;
        {
            let mut table = tx.open_table(RECORDS_TABLE).map_err(redb::Error::from)?;
            table
                .insert(entry.record_id.as_str(), bytes.as_slice())
                .map_err(redb::Error::from)?;
        }
        tx.commit().map_err(redb::Error::from)?;
        Ok(())
    }

    fn get_record(&self, record_id: &str) -> Result<Option<RecordIndexEntry>> {
        let tx = self.0.begin_read().map_err(redb::Error::from)?;
        let table = match tx.open_table(RECORDS_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(redb::Error::from(e).into()),
        };
        Ok(table
            .get(record_id)
            .map_err(redb::Error::from)?
            .map(|bytes| serde_json::from_slice(bytes.value()))
            .transpose()?)
    }

    fn list_records(&self) -> Result<Vec<RecordIndexEntry>> {
        let tx = self.0.begin_read().map_err(redb::Error::from)?;
        let table = match tx.open_table(RECORDS_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(redb::Error::from(e).into()),
        };
        let mut entries = Vec::new();
        for item in table.iter().map_err(redb::Error::from)? {
            let (_, bytes) = item.map_err(redb::Error::from)?;
            entries.push(serde_json::from_slice(bytes.value())?);
        }
        Ok(entries)
    }
}
