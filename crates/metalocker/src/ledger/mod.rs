pub mod memory;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::record::{Record, RecordStatus};

/// A ledger block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    #[serde(rename = "parentHash")]
    pub parent_hash: String,
}

/// The per-record index entry of a block
///
/// This is all a scanner needs to attribute a record: the routing key
/// (base58) and the key index (decimal string) it was derived at. The full
/// record is only fetched on a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    #[serde(rename = "recordID")]
    pub record_id: String,
    #[serde(rename = "routingKey")]
    pub routing_key: String,
    #[serde(rename = "keyIndex")]
    pub key_index: String,
}

/// Ledger-side state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordState {
    pub status: RecordStatus,
    #[serde(rename = "blockNumber")]
    pub block_number: u64,
}

/// Whether a data asset is still referenced by any active lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataAssetState {
    Keep,
    Remove,
}

/// The append-only record ledger, as consumed by the wallet core
///
/// The core prescribes nothing about finality, ordering or gossip; any
/// implementation that can answer these queries over sealed [`Record`]s
/// will do.
pub trait Ledger: Send + Sync {
    /// Submits a sealed record for inclusion
    fn submit_record(&self, record: Record) -> Result<()>;
    /// Fetches a record by id
    fn get_record(&self, id: &str) -> Result<Record>;
    /// Fetches the ledger state of a record
    fn get_record_state(&self, id: &str) -> Result<RecordState>;
    /// Fetches a block header
    fn get_block(&self, number: u64) -> Result<Block>;
    /// Lists the record index entries of a block
    fn get_block_records(&self, number: u64) -> Result<Vec<BlockRecord>>;
    /// Streams up to `depth` block headers starting at `start`, ascending
    fn get_chain(&self, start: u64, depth: u32) -> Result<Vec<Block>>;
    /// The first block of the chain
    fn get_genesis_block(&self) -> Result<Block>;
    /// The newest block of the chain
    fn get_top_block(&self) -> Result<Block>;
    /// Whether any active lease still references the data asset
    fn get_data_asset_state(&self, asset_id: &str) -> Result<DataAssetState>;
    /// Resolves a head id to the current head record id
    fn get_asset_head(&self, head_id: &str) -> Result<String>;
}
