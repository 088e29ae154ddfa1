//! Ledger-facing dataset operations.
//!
//! `DataStore` owns no wallet state: lockers are passed in explicitly, and
//! all key derivation is a pure function of the participant material and
//! the record key index. The wallet composes it with its caches.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use metalocker::envelope::{decrypt_aes_gcm, encrypt_aes_gcm};
use metalocker::record::{
    head_id, requesting_commitment, revocation_proof, RecordBuilder,
};
use metalocker::{
    CommitmentType, DataAssetState, Error as CoreError, HeadBody, Lease, Ledger, Locker,
    LockerParticipant, Record, RecordOperation, RecordStatus, FLAG_PUBLIC,
};
use metalocker::{BlobManager, OffChainStorage};
use metalocker_keys::random_record_index;

use crate::errors::{Error, Result};
use crate::index::{RecordIndexEntry, RootIndex};

/// Poll interval of [`RecordFuture::wait`]
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Options of a lease submission
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Store the lease payload unencrypted and set the record's Public
    /// flag
    pub cleartext: bool,
    /// Head names to (re)point at the new lease record, emitted as
    /// separate records after the lease record
    pub head_names: Vec<String>,
}

/// Submit, load, revoke, share and head operations over the ledger
pub struct DataStore {
    ledger: Arc<dyn Ledger>,
    off_chain: Arc<dyn OffChainStorage>,
    blobs: Arc<dyn BlobManager>,
    index: Arc<dyn RootIndex>,
}

/// A loaded dataset: the decrypted lease plus its ledger record
pub struct DataSet {
    lease: Lease,
    record: Record,
    locker_id: Option<String>,
    participant_id: Option<String>,
    ledger: Arc<dyn Ledger>,
    blobs: Arc<dyn BlobManager>,
}

/// A caller-driven wait handle over submitted record ids
///
/// The future completes when every record in its wait list is Published;
/// it fails as soon as any reaches Failed or Revoked. Cancellation (by
/// dropping the future or timing out) stops polling but does not revoke
/// anything already submitted.
pub struct RecordFuture {
    ledger: Arc<dyn Ledger>,
    record_ids: Vec<String>,
}

impl RecordFuture {
    fn new(ledger: Arc<dyn Ledger>, record_ids: Vec<String>) -> Self {
        Self { ledger, record_ids }
    }

    /// The id of the primary (first-submitted) record
    pub fn record_id(&self) -> &str {
        &self.record_ids[0]
    }

    /// All record ids the future waits on, in submission order
    pub fn record_ids(&self) -> &[String] {
        &self.record_ids
    }

    /// Blocks until all records are Published, any fails, or `timeout`
    /// elapses
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut all_published = true;
            for id in &self.record_ids {
                let state = self.ledger.get_record_state(id)?;
                match state.status {
                    RecordStatus::Published => {}
                    RecordStatus::Failed | RecordStatus::Revoked => {
                        return Err(Error::RecordFailed(id.clone()));
                    }
                    RecordStatus::Pending => all_published = false,
                }
            }
            if all_published {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::ConfirmationTimeout);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

impl DataStore {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        off_chain: Arc<dyn OffChainStorage>,
        blobs: Arc<dyn BlobManager>,
        index: Arc<dyn RootIndex>,
    ) -> Self {
        Self {
            ledger,
            off_chain,
            blobs,
            index,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn blobs(&self) -> &Arc<dyn BlobManager> {
        &self.blobs
    }

    pub fn index(&self) -> &Arc<dyn RootIndex> {
        &self.index
    }

    /// Submits a lease into a locker, then any requested head records
    ///
    /// The lease record is submitted strictly before its head records, and
    /// the returned future completes only once all of them are confirmed.
    pub fn submit_lease(
        &self,
        lease: &Lease,
        locker: &Locker,
        options: SubmitOptions,
    ) -> Result<RecordFuture> {
        if locker.is_expired(chrono::Utc::now()) {
            return Err(CoreError::ForbiddenOperation.into());
        }
        let participant = locker.us().ok_or(CoreError::ForbiddenOperation)?;
        let keypair = participant.derive_record(random_record_index())?;
        let routing_key = keypair.routing_key();

        let payload = serde_json::to_vec(lease)?;
        let (payload, flags) = if options.cleartext {
            (payload, FLAG_PUBLIC)
        } else {
            let key = participant.record_symmetric_key(&routing_key);
            (encrypt_aes_gcm(&key, &payload)?, 0)
        };
        let operation_address = self.off_chain.send_operation(&payload)?;

        let record = RecordBuilder {
            operation_address,
            requesting_commitment: requesting_commitment(&lease.id, &lease.expires_at),
            requesting_commitment_type: CommitmentType::Algo1,
            data_assets: lease.data_asset_ids(),
            flags,
            ..Default::default()
        }
        .seal(RecordOperation::Lease, &keypair)?;

        self.submit_and_index(record.clone(), locker, participant)?;
        log::debug!(
            "DataStore::submit_lease - lease={} record={} locker={}",
            lease.id,
            record.id,
            locker.id
        );

        let mut record_ids = vec![record.id.clone()];
        for head_name in &options.head_names {
            let head_future =
                self.set_asset_head(&lease.impression.asset, locker, head_name, &record.id)?;
            record_ids.extend(head_future.record_ids().iter().cloned());
        }
        Ok(RecordFuture::new(self.ledger.clone(), record_ids))
    }

    /// Loads and decrypts a dataset by record id
    ///
    /// The root index provides the fast path; otherwise every candidate
    /// locker's participants are tried against the record's routing key,
    /// starting with `locker_hint`. Public records load without any
    /// matching participant.
    pub fn load(
        &self,
        record_id: &str,
        lockers: &[Locker],
        locker_hint: Option<&str>,
    ) -> Result<DataSet> {
        let record = self.ledger.get_record(record_id)?;
        let routing_key = record.routing_key_bytes()?;

        let matched = self
            .match_via_index(&record, lockers, &routing_key)?
            .or_else(|| match_by_iteration(&record, lockers, locker_hint, &routing_key));

        let Some((locker, participant)) = matched else {
            if record.is_public() {
                return self.open_data_set(record, None);
            }
            log::debug!("DataStore::load - no participant matches record {record_id}");
            return Err(Error::DataSetNotFound);
        };
        self.open_data_set(record, Some((locker, participant)))
    }

    fn match_via_index<'a>(
        &self,
        record: &Record,
        lockers: &'a [Locker],
        routing_key: &[u8],
    ) -> Result<Option<(&'a Locker, &'a LockerParticipant)>> {
        let Some(entry) = self.index.get_record(&record.id)? else {
            return Ok(None);
        };
        let Some(locker) = lockers.iter().find(|l| l.id == entry.locker_id) else {
            return Ok(None);
        };
        let Some(participant) = locker.participant(&entry.participant_id) else {
            return Ok(None);
        };
        match participant.derive_routing_key(record.key_index) {
            Ok(derived) if derived[..] == *routing_key => Ok(Some((locker, participant))),
            _ => Ok(None),
        }
    }

    fn open_data_set(
        &self,
        record: Record,
        matched: Option<(&Locker, &LockerParticipant)>,
    ) -> Result<DataSet> {
        if !record.verify()? {
            return Err(CoreError::InvalidSignature.into());
        }
        let payload = match self.off_chain.get_operation(&record.operation_address) {
            Ok(payload) => payload,
            Err(CoreError::OperationNotFound) => {
                let state = self.ledger.get_record_state(&record.id)?;
                if state.status == RecordStatus::Revoked {
                    return Err(CoreError::LeaseRevokedAndPurged.into());
                }
                return Err(CoreError::OperationNotFound.into());
            }
            Err(e) => return Err(e.into()),
        };

        let lease: Lease = if record.is_public() {
            serde_json::from_slice(&payload)?
        } else {
            let (_, participant) = matched.expect("private records always have a participant");
            let key = participant.record_symmetric_key(&record.routing_key_bytes()?);
            serde_json::from_slice(&decrypt_aes_gcm(&key, &payload)?)?
        };

        Ok(DataSet {
            lease,
            record,
            locker_id: matched.map(|(l, _)| l.id.clone()),
            participant_id: matched.map(|(_, p)| p.id.clone()),
            ledger: self.ledger.clone(),
            blobs: self.blobs.clone(),
        })
    }

    /// Revokes a record owned by one of the given lockers
    ///
    /// Only the participant that submitted the record (its own Self) can
    /// build the revocation proof; anyone can verify it against the
    /// subject's authorising commitment.
    pub fn revoke(&self, record_id: &str, lockers: &[Locker]) -> Result<RecordFuture> {
        let entry = self
            .index
            .get_record(record_id)?
            .ok_or(Error::DataSetNotFound)?;
        let locker = lockers
            .iter()
            .find(|l| l.id == entry.locker_id)
            .ok_or(Error::LockerNotFound)?;
        let participant = locker
            .participant(&entry.participant_id)
            .ok_or(Error::DataSetNotFound)?;
        if !participant.self_ {
            return Err(CoreError::ForbiddenOperation.into());
        }

        let subject = self.ledger.get_record(record_id)?;
        let subject_pair = participant.derive_record(subject.key_index)?;
        let proof = revocation_proof(&subject_pair.secret_bytes(), &subject.operation_address);

        let keypair = participant.derive_record(random_record_index())?;
        let operation_address = self.off_chain.send_operation(b"{}")?;
        let record = RecordBuilder {
            operation_address,
            subject_record: Some(subject.id.clone()),
            revocation_proof: Some(vec![proof]),
            ..Default::default()
        }
        .seal(RecordOperation::LeaseRevocation, &keypair)?;

        self.submit_and_index(record.clone(), locker, participant)?;
        log::debug!("DataStore::revoke - subject={} revocation={}", subject.id, record.id);
        Ok(RecordFuture::new(self.ledger.clone(), vec![record.id]))
    }

    /// Points the named head of `(asset, locker, participant)` at a record
    ///
    /// If a previous head record exists it becomes the subject of this
    /// one, with a revocation proof authorising the supersession, forming
    /// a single-writer chain.
    pub fn set_asset_head(
        &self,
        asset_id: &str,
        locker: &Locker,
        head_name: &str,
        target_record_id: &str,
    ) -> Result<RecordFuture> {
        let participant = locker.us().ok_or(CoreError::ForbiddenOperation)?;
        let head = head_id(asset_id, &locker.id, &participant.id, head_name);

        let keypair = participant.derive_record(random_record_index())?;
        let symmetric_key = participant.record_symmetric_key(&keypair.routing_key());
        let body = HeadBody {
            asset_id: asset_id.to_owned(),
            locker_id: locker.id.clone(),
            participant_id: participant.id.clone(),
            head_name: head_name.to_owned(),
            record_id: target_record_id.to_owned(),
        };
        let sealed_body = encrypt_aes_gcm(&symmetric_key, &serde_json::to_vec(&body)?)?;
        let operation_address = self.off_chain.send_operation(&sealed_body)?;

        let (subject_record, revocation) = match self.ledger.get_asset_head(&head) {
            Ok(previous_id) => {
                let previous = self.ledger.get_record(&previous_id)?;
                let previous_pair = participant.derive_record(previous.key_index)?;
                let proof =
                    revocation_proof(&previous_pair.secret_bytes(), &previous.operation_address);
                (Some(previous_id), Some(vec![proof]))
            }
            Err(CoreError::AssetHeadNotFound) => (None, None),
            Err(e) => return Err(e.into()),
        };

        let record = RecordBuilder {
            operation_address,
            head_id: Some(head.clone()),
            head_body: Some(BASE64.encode(&sealed_body)),
            subject_record,
            revocation_proof: revocation,
            ..Default::default()
        }
        .seal(RecordOperation::AssetHead, &keypair)?;

        self.submit_and_index(record.clone(), locker, participant)?;
        log::debug!("DataStore::set_asset_head - head={head} record={}", record.id);
        Ok(RecordFuture::new(self.ledger.clone(), vec![record.id]))
    }

    /// Resolves the named head to the lease record id it points at
    pub fn asset_head(&self, asset_id: &str, locker: &Locker, head_name: &str) -> Result<String> {
        let participant = locker.us().ok_or(CoreError::ForbiddenOperation)?;
        let head = head_id(asset_id, &locker.id, &participant.id, head_name);
        let head_record_id = self.ledger.get_asset_head(&head)?;
        let head_record = self.ledger.get_record(&head_record_id)?;

        let sealed = BASE64
            .decode(
                head_record
                    .head_body
                    .as_deref()
                    .ok_or(CoreError::InvalidRecord("head record carries no body"))?,
            )
            .map_err(|_| CoreError::InvalidRecord("head body is not base64"))?;
        let key = participant.record_symmetric_key(&head_record.routing_key_bytes()?);
        let body: HeadBody = serde_json::from_slice(&decrypt_aes_gcm(&key, &sealed)?)?;
        Ok(body.record_id)
    }

    /// Shares a loaded dataset into another locker
    ///
    /// The new lease carries the source impression untouched plus a
    /// share-provenance entity signed by `creator`; `copy_mode` decides
    /// whether resource blobs are re-uploaded, referenced, or omitted.
    pub fn share(
        &self,
        source: &DataSet,
        locker: &Locker,
        creator: &metalocker::Did,
        vault_name: &str,
        copy_mode: crate::lease_builder::CopyMode,
        expires_at: metalocker::Expiry,
    ) -> Result<RecordFuture> {
        let recipient = locker
            .participants
            .iter()
            .find(|p| !p.self_)
            .or_else(|| locker.us())
            .map(|p| p.id.clone())
            .ok_or(CoreError::ForbiddenOperation)?;

        let mut builder =
            crate::lease_builder::LeaseBuilder::new(self.blobs.clone(), creator.clone(), vault_name);
        builder.with_parent(source, copy_mode, &[], false)?;
        builder.for_sharing(recipient);
        let lease = builder.build(expires_at)?;
        log::debug!(
            "DataStore::share - source={} lease={} locker={}",
            source.record.id,
            lease.id,
            locker.id
        );
        self.submit_lease(&lease, locker, SubmitOptions::default())
    }

    /// Deletes the off-chain footprint of a revoked record
    ///
    /// Valid only once the record is revoked. Purges every data asset no
    /// longer referenced by any active lease, then the off-chain
    /// operation; already-purged targets are tolerated.
    pub fn purge_data_assets(&self, record_id: &str, lockers: &[Locker]) -> Result<()> {
        let state = self.ledger.get_record_state(record_id)?;
        if state.status != RecordStatus::Revoked {
            return Err(CoreError::ForbiddenOperation.into());
        }
        let data_set = self.load(record_id, lockers, None)?;

        for resource in &data_set.lease.resources {
            match self.ledger.get_data_asset_state(&resource.asset) {
                Ok(DataAssetState::Remove) | Err(CoreError::DataAssetNotFound) => {
                    match self.blobs.purge_blob(resource) {
                        Ok(()) | Err(CoreError::BlobNotFound) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(DataAssetState::Keep) => {
                    log::debug!(
                        "DataStore::purge_data_assets - asset {} still referenced, keeping",
                        resource.asset
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        match self
            .off_chain
            .purge_operation(&data_set.record.operation_address)
        {
            Ok(()) | Err(CoreError::OperationNotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn submit_and_index(
        &self,
        record: Record,
        locker: &Locker,
        participant: &LockerParticipant,
    ) -> Result<()> {
        let record_id = record.id.clone();
        let key_index = record.key_index;
        let operation = record.operation;
        self.ledger.submit_record(record)?;
        let state = self.ledger.get_record_state(&record_id)?;
        self.index.put_record(&RecordIndexEntry {
            record_id,
            locker_id: locker.id.clone(),
            participant_id: participant.id.clone(),
            key_index,
            operation,
            block_number: state.block_number,
        })
    }
}

impl DataSet {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn block_number(&self) -> u64 {
        self.record.block_number
    }

    /// The locker the dataset was attributed to, when not a blind public
    /// load
    pub fn locker_id(&self) -> Option<&str> {
        self.locker_id.as_deref()
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    /// Opens the meta-resource blob
    pub fn meta_resource(&self) -> Result<Box<dyn Read + Send>> {
        let asset = self.lease.impression.meta_resource.clone();
        self.resource(&asset)
    }

    /// Opens a resource blob by asset id
    ///
    /// # Errors
    ///
    /// Once the record is revoked, blob access is forbidden; after the
    /// assets are purged this becomes [`CoreError::LeaseRevokedAndPurged`].
    pub fn resource(&self, asset_id: &str) -> Result<Box<dyn Read + Send>> {
        let resource = self.lease.resource(asset_id)?;
        let state = self.ledger.get_record_state(&self.record.id)?;
        let access_token = resource.mac.clone().unwrap_or_default();
        if state.status == RecordStatus::Revoked {
            return match self.blobs.get_blob(resource, &access_token) {
                Err(CoreError::BlobNotFound) => Err(CoreError::LeaseRevokedAndPurged.into()),
                _ => Err(CoreError::ForbiddenOperation.into()),
            };
        }
        Ok(self.blobs.get_blob(resource, &access_token)?)
    }
}

fn match_by_iteration<'a>(
    record: &Record,
    lockers: &'a [Locker],
    locker_hint: Option<&str>,
    routing_key: &[u8],
) -> Option<(&'a Locker, &'a LockerParticipant)> {
    let hinted = lockers.iter().filter(|l| Some(l.id.as_str()) == locker_hint);
    let rest = lockers.iter().filter(|l| Some(l.id.as_str()) != locker_hint);
    for locker in hinted.chain(rest) {
        for participant in &locker.participants {
            if let Ok(derived) = participant.derive_routing_key(record.key_index) {
                if derived[..] == *routing_key {
                    return Some((locker, participant));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use metalocker::ledger::memory::MemoryLedger;
    use metalocker::storage::{MemoryBlobManager, MemoryOffChainStorage};
    use metalocker::{AccessLevel, Expiry};
    use metalocker::locker::{LockerOptions, Party};
    use std::io::Cursor;

    use crate::index::MemoryRootIndex;
    use crate::lease_builder::LeaseBuilder;

    fn data_store() -> DataStore {
        DataStore::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryOffChainStorage::new()),
            Arc::new(MemoryBlobManager::new()),
            Arc::new(MemoryRootIndex::new()),
        )
    }

    fn uni_locker(did: &str) -> Locker {
        Locker::new(
            "mine",
            AccessLevel::Managed,
            vec![Party::us(did)],
            LockerOptions::default(),
        )
        .unwrap()
    }

    fn build_lease(store: &DataStore, creator: &metalocker::Did, meta: &[u8]) -> Lease {
        let mut builder = LeaseBuilder::new(store.blobs().clone(), creator.clone(), "local");
        builder
            .add_meta_resource(&mut Cursor::new(meta.to_vec()), None)
            .unwrap();
        builder.build(Expiry::never()).unwrap()
    }

    #[test]
    fn private_submit_hides_the_lease_from_the_ledger() {
        let store = data_store();
        let creator = metalocker::Did::generate();
        let locker = uni_locker(creator.id());
        let lease = build_lease(&store, &creator, b"{}");

        let future = store
            .submit_lease(&lease, &locker, SubmitOptions::default())
            .unwrap();
        future.wait(Duration::from_secs(5)).unwrap();

        let record = store.ledger().get_record(future.record_id()).unwrap();
        assert!(!record.is_public());
        assert_eq!(record.operation, RecordOperation::Lease);

        // Without the locker nothing matches
        assert!(matches!(
            store.load(future.record_id(), &[], None),
            Err(Error::DataSetNotFound)
        ));
        // With it, the fast path resolves through the index
        let loaded = store
            .load(future.record_id(), &[locker.clone()], None)
            .unwrap();
        assert_eq!(loaded.locker_id(), Some(locker.id.as_str()));
        assert_eq!(loaded.lease().id, lease.id);
    }

    #[test]
    fn public_submit_loads_without_a_matching_participant() {
        let store = data_store();
        let creator = metalocker::Did::generate();
        let locker = uni_locker(creator.id());
        let lease = build_lease(&store, &creator, b"{\"open\":true}");

        let future = store
            .submit_lease(
                &lease,
                &locker,
                SubmitOptions {
                    cleartext: true,
                    head_names: Vec::new(),
                },
            )
            .unwrap();

        let record = store.ledger().get_record(future.record_id()).unwrap();
        assert!(record.is_public());

        // A reader with no lockers at all still decodes the lease
        let loaded = store.load(future.record_id(), &[], None).unwrap();
        assert!(loaded.locker_id().is_none());
        assert_eq!(loaded.lease().id, lease.id);
    }

    #[test]
    fn hinted_locker_is_tried_first() {
        let store = data_store();
        let creator = metalocker::Did::generate();
        let locker = uni_locker(creator.id());
        let decoy = uni_locker(creator.id());
        let lease = build_lease(&store, &creator, b"{}");

        let future = store
            .submit_lease(&lease, &locker, SubmitOptions::default())
            .unwrap();

        // Force the iteration path by looking up through a foreign index
        let blind_store = DataStore::new(
            store.ledger().clone(),
            store.off_chain.clone(),
            store.blobs().clone(),
            Arc::new(MemoryRootIndex::new()),
        );
        let loaded = blind_store
            .load(
                future.record_id(),
                &[decoy, locker.clone()],
                Some(&locker.id),
            )
            .unwrap();
        assert_eq!(loaded.locker_id(), Some(locker.id.as_str()));
    }

    #[test]
    fn expired_lockers_refuse_submissions() {
        let store = data_store();
        let creator = metalocker::Did::generate();
        let mut locker = uni_locker(creator.id());
        locker.expires_at = Expiry::at(chrono::Utc::now() - chrono::Duration::hours(1));
        let lease = build_lease(&store, &creator, b"{}");

        assert!(matches!(
            store.submit_lease(&lease, &locker, SubmitOptions::default()),
            Err(Error::Core(CoreError::ForbiddenOperation))
        ));
    }

    #[test]
    fn record_future_reports_unknown_records() {
        let store = data_store();
        let future = RecordFuture::new(store.ledger().clone(), vec!["missing".to_owned()]);
        assert!(matches!(
            future.wait(Duration::from_millis(50)),
            Err(Error::Core(CoreError::RecordNotFound))
        ));
    }
}
