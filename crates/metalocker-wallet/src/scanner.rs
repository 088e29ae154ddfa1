//! Locker-keyed streaming discovery of ledger records.
//!
//! The scanner walks the chain in widening windows, matching every block's
//! record index entries against the locker root public keys of its
//! subscriptions. Matches are delivered per block, in ledger order, to
//! each subscription's consumer.

use std::collections::BTreeMap;
use std::sync::Arc;

use metalocker_keys::LockerRootPub;

use metalocker::{Ledger, Record, RecordOperation};

use crate::errors::{Error, Result};

/// Default number of blocks fetched per chain call
const DEFAULT_BATCH_SIZE: u32 = 10;

/// One locker participant key a subscription watches
#[derive(Debug, Clone)]
pub struct LockerConfig {
    /// Stable identifier of this key within the subscription
    pub key_id: String,
    /// The last block this key has fully processed
    pub last_block: u64,
    /// The participant's extended public root key
    pub root_public_key: LockerRootPub,
}

/// A record attributed to a subscription key
#[derive(Debug, Clone)]
pub struct DatasetNotification {
    pub key_id: String,
    pub record_id: String,
    pub operation: RecordOperation,
    pub key_index: u32,
    pub record: Record,
}

/// All records of one block attributed to one subscription
#[derive(Debug, Clone)]
pub struct BlockNotification {
    pub block: u64,
    pub datasets: Vec<DatasetNotification>,
}

/// The consumer side of a subscription
///
/// `deliver` may return [`Error::IndexResultPending`] to signal that the
/// consumer needs out-of-band work before it can accept more blocks; the
/// subscription is paused and the scan round restarts. Any other error
/// marks the subscription failed for the round.
pub trait IndexConsumer: Send {
    fn deliver(&mut self, notification: BlockNotification) -> Result<()>;
    fn notify_scan_completed(&mut self, top_block: u64) -> Result<()>;
}

/// Lifecycle of a subscription within the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Error,
}

struct Subscription {
    configs: Vec<LockerConfig>,
    consumer: Box<dyn IndexConsumer>,
    status: SubscriptionStatus,
}

/// Outcome of one scan round
#[derive(Debug, Default)]
pub struct ScanReport {
    /// The top block at the time of the scan
    pub top_block: u64,
    /// Subscriptions that failed this round, with their errors
    pub errors: Vec<(String, String)>,
    /// Subscriptions paused awaiting out-of-band consumer work
    pub paused: Vec<String>,
}

/// A single-flight ledger scanner over a set of subscriptions
///
/// Never concurrent internally: one `scan` runs at a time, inside the
/// caller's thread. Adding or removing subscriptions between scans is the
/// caller's responsibility to serialize.
pub struct Scanner {
    ledger: Arc<dyn Ledger>,
    batch_size: u32,
    subscriptions: BTreeMap<String, Subscription>,
}

impl Scanner {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            batch_size: DEFAULT_BATCH_SIZE,
            subscriptions: BTreeMap::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Registers a subscription under `index_id`
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockerStateExists`] if the id is already
    /// registered.
    pub fn add_subscription(
        &mut self,
        index_id: impl Into<String>,
        configs: Vec<LockerConfig>,
        consumer: Box<dyn IndexConsumer>,
    ) -> Result<()> {
        let index_id = index_id.into();
        if self.subscriptions.contains_key(&index_id) {
            return Err(Error::LockerStateExists);
        }
        self.subscriptions.insert(
            index_id,
            Subscription {
                configs,
                consumer,
                status: SubscriptionStatus::Active,
            },
        );
        Ok(())
    }

    /// Adds a locker key to an existing subscription
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriptionNotFound`] for unknown subscriptions
    /// and [`Error::LockerStateExists`] for duplicate key ids.
    pub fn add_locker_config(&mut self, index_id: &str, config: LockerConfig) -> Result<()> {
        let subscription = self
            .subscriptions
            .get_mut(index_id)
            .ok_or(Error::SubscriptionNotFound)?;
        if subscription.configs.iter().any(|c| c.key_id == config.key_id) {
            return Err(Error::LockerStateExists);
        }
        subscription.configs.push(config);
        Ok(())
    }

    pub fn remove_subscription(&mut self, index_id: &str) -> Result<()> {
        self.subscriptions
            .remove(index_id)
            .map(|_| ())
            .ok_or(Error::SubscriptionNotFound)
    }

    /// Reactivates a subscription paused by `IndexResultPending`
    pub fn resume_subscription(&mut self, index_id: &str) -> Result<()> {
        let subscription = self
            .subscriptions
            .get_mut(index_id)
            .ok_or(Error::SubscriptionNotFound)?;
        if subscription.status == SubscriptionStatus::Paused {
            subscription.status = SubscriptionStatus::Active;
        }
        Ok(())
    }

    /// Current status of a subscription
    pub fn subscription_status(&self, index_id: &str) -> Result<SubscriptionStatus> {
        self.subscriptions
            .get(index_id)
            .map(|s| s.status)
            .ok_or(Error::SubscriptionNotFound)
    }

    /// Runs one scan round up to the current top block
    ///
    /// Records are delivered to each consumer in ledger order; ordering
    /// across subscriptions is unspecified. Per-subscription consumer
    /// failures do not fail the round: they are reported in the returned
    /// [`ScanReport`].
    pub fn scan(&mut self) -> Result<ScanReport> {
        let top_block = self.ledger.get_top_block()?.number;
        let mut report = ScanReport {
            top_block,
            ..Default::default()
        };

        'round: loop {
            // The stream starts at the oldest outstanding lastBlock and
            // widens as it passes each config's boundary: a config only
            // participates in blocks beyond its own lastBlock
            let Some(first) = self
                .subscriptions
                .values()
                .filter(|s| s.status == SubscriptionStatus::Active)
                .flat_map(|s| s.configs.iter().map(|c| c.last_block))
                .filter(|b| *b < top_block)
                .min()
            else {
                break;
            };

            let mut block = first + 1;
            while block <= top_block {
                let batch = self.ledger.get_chain(block, self.batch_size)?;
                if batch.is_empty() {
                    break;
                }
                let batch_len = batch.len() as u64;
                for header in batch {
                    match self.scan_block(header.number, &mut report) {
                        BlockOutcome::Continue => {}
                        BlockOutcome::Restart => continue 'round,
                    }
                }
                block += batch_len;
            }
            break;
        }

        // Completion callbacks for every subscription that reached the top
        for (index_id, subscription) in &mut self.subscriptions {
            if subscription.status != SubscriptionStatus::Active {
                continue;
            }
            if subscription
                .configs
                .iter()
                .all(|c| c.last_block >= top_block)
            {
                if let Err(e) = subscription.consumer.notify_scan_completed(top_block) {
                    log::warn!("Scanner::scan - completion callback failed for {index_id}: {e}");
                }
            }
        }

        report.paused = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.status == SubscriptionStatus::Paused)
            .map(|(id, _)| id.clone())
            .collect();
        Ok(report)
    }

    fn scan_block(&mut self, block_number: u64, report: &mut ScanReport) -> BlockOutcome {
        let entries = match self.ledger.get_block_records(block_number) {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("Scanner::scan_block - block {block_number}: {e:#}");
                return BlockOutcome::Continue;
            }
        };

        for (index_id, subscription) in &mut self.subscriptions {
            if subscription.status != SubscriptionStatus::Active {
                continue;
            }
            let mut datasets = Vec::new();
            for entry in &entries {
                let Ok(key_index) = entry.key_index.parse::<u32>() else {
                    continue;
                };
                let Ok(routing_key) = bs58::decode(&entry.routing_key).into_vec() else {
                    continue;
                };
                let matched_key = subscription
                    .configs
                    .iter()
                    .filter(|c| c.last_block < block_number)
                    .find(|c| {
                        c.root_public_key
                            .derive_record(key_index)
                            .map(|derived| derived[..] == routing_key[..])
                            .unwrap_or(false)
                    })
                    .map(|c| c.key_id.clone());
                if let Some(key_id) = matched_key {
                    // Only fetch the full record once a key matches
                    let record = match self.ledger.get_record(&entry.record_id) {
                        Ok(record) => record,
                        Err(e) => {
                            log::error!(
                                "Scanner::scan_block - record {}: {e:#}",
                                entry.record_id
                            );
                            continue;
                        }
                    };
                    datasets.push(DatasetNotification {
                        key_id,
                        record_id: entry.record_id.clone(),
                        operation: record.operation,
                        key_index,
                        record,
                    });
                }
            }

            if !datasets.is_empty() {
                let notification = BlockNotification {
                    block: block_number,
                    datasets,
                };
                match subscription.consumer.deliver(notification) {
                    Ok(()) => {}
                    Err(Error::IndexResultPending) => {
                        log::debug!(
                            "Scanner::scan_block - subscription {index_id} pending at block {block_number}"
                        );
                        subscription.status = SubscriptionStatus::Paused;
                        return BlockOutcome::Restart;
                    }
                    Err(e) => {
                        subscription.status = SubscriptionStatus::Error;
                        report.errors.push((index_id.clone(), e.to_string()));
                        continue;
                    }
                }
            }

            for config in &mut subscription.configs {
                if config.last_block < block_number {
                    config.last_block = block_number;
                }
            }
        }
        BlockOutcome::Continue
    }
}

enum BlockOutcome {
    Continue,
    Restart,
}
