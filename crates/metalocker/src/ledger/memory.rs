//! In-memory ledger, suitable for tests and local development.
//!
//! Every submitted record is sealed into its own block and published
//! immediately, so callers observe the same interface a remote ledger
//! exposes, minus the latency.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};
use crate::ledger::{Block, BlockRecord, DataAssetState, Ledger, RecordState};
use crate::record::{verify_revocation_proof, Record, RecordOperation, RecordStatus};

#[derive(Default)]
struct Inner {
    blocks: Vec<Block>,
    block_records: HashMap<u64, Vec<BlockRecord>>,
    records: HashMap<String, Record>,
    heads: HashMap<String, String>,
    asset_refs: HashMap<String, HashSet<String>>,
}

/// An in-memory [`Ledger`]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        let genesis = Block {
            number: 0,
            hash: block_hash(0, ""),
            parent_hash: String::new(),
        };
        let mut inner = Inner::default();
        inner.blocks.push(genesis);
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("the ledger mutex is never poisoned")
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn block_hash(number: u64, parent_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(number.to_be_bytes());
    hasher.update(parent_hash.as_bytes());
    bs58::encode(hasher.finalize()).into_string()
}

impl Ledger for MemoryLedger {
    fn submit_record(&self, mut record: Record) -> Result<()> {
        if !record.verify()? {
            return Err(Error::InvalidSignature);
        }
        let mut inner = self.lock();
        if inner.records.contains_key(&record.id) {
            return Err(Error::InvalidRecord("record already submitted"));
        }

        match record.operation {
            RecordOperation::Lease => {
                for asset in &record.data_assets {
                    inner
                        .asset_refs
                        .entry(asset.clone())
                        .or_default()
                        .insert(record.id.clone());
                }
            }
            RecordOperation::LeaseRevocation => {
                let subject_id = record
                    .subject_record
                    .clone()
                    .ok_or(Error::InvalidRecord("revocation names no subject"))?;
                let subject = inner
                    .records
                    .get(&subject_id)
                    .ok_or(Error::RecordNotFound)?
                    .clone();
                let proof_ok = record
                    .revocation_proof
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|proof| verify_revocation_proof(proof, &subject));
                if !proof_ok {
                    return Err(Error::InvalidSignature);
                }
                revoke(&mut inner, &subject_id);
            }
            RecordOperation::AssetHead => {
                let head_id = record
                    .head_id
                    .clone()
                    .ok_or(Error::InvalidRecord("head record names no head id"))?;
                // Superseding an existing head requires proof over the
                // previous head record, which is then revoked
                if let Some(previous_id) = inner.heads.get(&head_id).cloned() {
                    let previous = inner
                        .records
                        .get(&previous_id)
                        .ok_or(Error::RecordNotFound)?
                        .clone();
                    let proof_ok = record.subject_record.as_deref() == Some(previous_id.as_str())
                        && record
                            .revocation_proof
                            .as_deref()
                            .unwrap_or_default()
                            .iter()
                            .any(|proof| verify_revocation_proof(proof, &previous));
                    if !proof_ok {
                        return Err(Error::InvalidSignature);
                    }
                    revoke(&mut inner, &previous_id);
                }
                inner.heads.insert(head_id, record.id.clone());
            }
        }

        let parent = inner.blocks.last().expect("genesis always exists").clone();
        let number = parent.number + 1;
        let block = Block {
            number,
            hash: block_hash(number, &parent.hash),
            parent_hash: parent.hash,
        };
        record.status = RecordStatus::Published;
        record.block_number = number;
        log::debug!(
            "MemoryLedger::submit_record - id={} block={number} operation={:?}",
            record.id,
            record.operation
        );

        inner.block_records.insert(
            number,
            vec![BlockRecord {
                record_id: record.id.clone(),
                routing_key: record.routing_key.clone(),
                key_index: record.key_index.to_string(),
            }],
        );
        inner.blocks.push(block);
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    fn get_record(&self, id: &str) -> Result<Record> {
        self.lock()
            .records
            .get(id)
            .cloned()
            .ok_or(Error::RecordNotFound)
    }

    fn get_record_state(&self, id: &str) -> Result<RecordState> {
        let inner = self.lock();
        let record = inner.records.get(id).ok_or(Error::RecordNotFound)?;
        Ok(RecordState {
            status: record.status,
            block_number: record.block_number,
        })
    }

    fn get_block(&self, number: u64) -> Result<Block> {
        self.lock()
            .blocks
            .get(number as usize)
            .cloned()
            .ok_or(Error::BlockNotFound)
    }

    fn get_block_records(&self, number: u64) -> Result<Vec<BlockRecord>> {
        let inner = self.lock();
        if number as usize >= inner.blocks.len() {
            return Err(Error::BlockNotFound);
        }
        Ok(inner.block_records.get(&number).cloned().unwrap_or_default())
    }

    fn get_chain(&self, start: u64, depth: u32) -> Result<Vec<Block>> {
        let inner = self.lock();
        if start as usize >= inner.blocks.len() {
            return Err(Error::BlockNotFound);
        }
        let end = (start as usize + depth as usize).min(inner.blocks.len());
        Ok(inner.blocks[start as usize..end].to_vec())
    }

    fn get_genesis_block(&self) -> Result<Block> {
        Ok(self.lock().blocks[0].clone())
    }

    fn get_top_block(&self) -> Result<Block> {
        Ok(self
            .lock()
            .blocks
            .last()
            .expect("genesis always exists")
            .clone())
    }

    fn get_data_asset_state(&self, asset_id: &str) -> Result<DataAssetState> {
        let inner = self.lock();
        match inner.asset_refs.get(asset_id) {
            Some(refs) if !refs.is_empty() => Ok(DataAssetState::Keep),
            Some(_) => Ok(DataAssetState::Remove),
            None => Err(Error::DataAssetNotFound),
        }
    }

    fn get_asset_head(&self, head_id: &str) -> Result<String> {
        self.lock()
            .heads
            .get(head_id)
            .cloned()
            .ok_or(Error::AssetHeadNotFound)
    }
}

/// Marks a record revoked and releases its data asset references
fn revoke(inner: &mut Inner, record_id: &str) {
    if let Some(record) = inner.records.get_mut(record_id) {
        record.status = RecordStatus::Revoked;
        let assets = record.data_assets.clone();
        for asset in assets {
            if let Some(refs) = inner.asset_refs.get_mut(&asset) {
                refs.remove(record_id);
            }
        }
    }
}
