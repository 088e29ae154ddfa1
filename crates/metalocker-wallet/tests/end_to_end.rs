//! End-to-end flows over the in-memory backends: wallets exchanging
//! datasets through lockers, head chains, revocation and discovery.

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use metalocker::ledger::memory::MemoryLedger;
use metalocker::storage::{MemoryBlobManager, MemoryOffChainStorage};
use metalocker::{
    AccessLevel, Account, AccountTemplate, Error as CoreError, Expiry, GenerateOptions,
    GeneratedAccount, Ledger, RecordStatus,
};
use metalocker_wallet::{
    AccountBackend, BlockNotification, CopyMode, Error, IndexConsumer, LocalNotificationService,
    LockLevel, LockerConfig, MemoryAccountBackend, MemoryRootIndex, Result, Scanner, Wallet,
    WalletServices,
};

const WAIT: Duration = Duration::from_secs(5);

fn test_services() -> WalletServices {
    WalletServices {
        backend: Arc::new(MemoryAccountBackend::new()),
        ledger: Arc::new(MemoryLedger::new()),
        off_chain: Arc::new(MemoryOffChainStorage::new()),
        blobs: Arc::new(MemoryBlobManager::new()),
        index: Arc::new(MemoryRootIndex::new()),
        notifications: Arc::new(LocalNotificationService::new()),
        vault_name: "local".to_owned(),
    }
}

fn create_wallet(
    services: &WalletServices,
    name: &str,
    passphrase: &str,
) -> (Wallet, GeneratedAccount) {
    let generated = Account::generate(
        AccountTemplate {
            name: name.to_owned(),
            access_level: AccessLevel::Hosted,
            parent_account: None,
            master_account: None,
        },
        GenerateOptions {
            passphrase: passphrase.to_owned(),
            with_recovery: true,
            ..Default::default()
        },
    )
    .unwrap();

    services.backend.create_account(&generated.account).unwrap();
    for envelope in &generated.encrypted_identities {
        services
            .backend
            .store_identity(&generated.account.id, envelope)
            .unwrap();
    }
    for envelope in &generated.encrypted_lockers {
        services
            .backend
            .store_locker(&generated.account.id, envelope)
            .unwrap();
    }

    let wallet = Wallet::new(generated.account.id.clone(), services.clone());
    wallet.unlock(passphrase).unwrap();
    (wallet, generated)
}

#[test]
fn bidirectional_locker_roundtrip() {
    let services = test_services();
    let (alice, _) = create_wallet(&services, "alice", "pass-a");
    let (bob, _) = create_wallet(&services, "bob", "pass-b");
    let bob_did = bob.root_identity().unwrap().id().to_owned();

    // Alice generates the locker for both parties and hands Bob his
    // perspective
    let locker = alice
        .create_locker("alice-bob", AccessLevel::Hosted, Some(&bob_did), Expiry::never())
        .unwrap();
    assert!(locker.accepted_at_block.is_some());
    let bob_view = locker.perspective(&bob_did).unwrap();
    bob.import_locker(bob_view).unwrap();

    // Alice publishes a dataset into the locker
    let meta = br#"{"type":"TestDataset1","value":42}"#.to_vec();
    let mut builder = alice.new_lease_builder().unwrap();
    builder
        .add_meta_resource(&mut Cursor::new(meta.clone()), Some("application/json".to_owned()))
        .unwrap();
    let future = builder
        .submit(Expiry::never(), alice.data_store(), &alice.locker(&locker.id).unwrap())
        .unwrap();
    future.wait(WAIT).unwrap();

    // Bob loads it by record id and reads the identical bytes back
    let data_set = bob
        .data_store()
        .load(future.record_id(), &bob.lockers().unwrap(), None)
        .unwrap();
    assert!(data_set.lease().impression.verify().unwrap());

    let mut reader = data_set.meta_resource().unwrap();
    let mut content = Vec::new();
    reader.read_to_end(&mut content).unwrap();
    assert_eq!(content, meta);

    // A third wallet sees nothing
    let (carol, _) = create_wallet(&services, "carol", "pass-c");
    assert!(matches!(
        carol
            .data_store()
            .load(future.record_id(), &carol.lockers().unwrap(), None),
        Err(Error::DataSetNotFound)
    ));
}

#[test]
fn head_update_chain() {
    let services = test_services();
    let (alice, _) = create_wallet(&services, "alice", "pass-a");
    let locker = alice
        .create_locker("mine", AccessLevel::Hosted, None, Expiry::never())
        .unwrap();
    let locker = alice.locker(&locker.id).unwrap();

    // First revision, head "test" points at it
    let mut builder = alice.new_lease_builder().unwrap();
    builder
        .add_meta_resource(
            &mut Cursor::new(br#"{"type":"TestDataset1"}"#.to_vec()),
            Some("application/json".to_owned()),
        )
        .unwrap();
    builder.set_heads(&["test"]);
    let first = builder
        .submit(Expiry::never(), alice.data_store(), &locker)
        .unwrap();
    first.wait(WAIT).unwrap();
    assert_eq!(first.record_ids().len(), 2);

    let first_set = alice
        .data_store()
        .load(first.record_id(), &alice.lockers().unwrap(), None)
        .unwrap();
    let asset = first_set.lease().impression.asset.clone();
    assert_eq!(
        alice
            .data_store()
            .asset_head(&asset, &locker, "test")
            .unwrap(),
        first.record_id()
    );

    // Second revision under the same head name
    let mut builder = alice.new_lease_builder().unwrap();
    builder
        .with_parent(&first_set, CopyMode::Shallow, &[], true)
        .unwrap();
    builder
        .add_meta_resource(
            &mut Cursor::new(br#"{"type":"TestDataset2"}"#.to_vec()),
            Some("application/json".to_owned()),
        )
        .unwrap();
    builder.set_heads(&["test"]);
    let second = builder
        .submit(Expiry::never(), alice.data_store(), &locker)
        .unwrap();
    second.wait(WAIT).unwrap();

    // The head moved to the revision
    assert_eq!(
        alice
            .data_store()
            .asset_head(&asset, &locker, "test")
            .unwrap(),
        second.record_id()
    );
    let revision = alice
        .data_store()
        .load(second.record_id(), &alice.lockers().unwrap(), None)
        .unwrap();
    assert_eq!(revision.lease().impression.asset, asset);
    assert_eq!(revision.lease().impression.revision_number, 2);

    // The superseded head record is revoked
    let old_head_record = &first.record_ids()[1];
    assert_eq!(
        services
            .ledger
            .get_record_state(old_head_record)
            .unwrap()
            .status,
        RecordStatus::Revoked
    );
}

#[test]
fn revocation_and_purge_gating() {
    let services = test_services();
    let (alice, _) = create_wallet(&services, "alice", "pass-a");
    let (bob, _) = create_wallet(&services, "bob", "pass-b");
    let bob_did = bob.root_identity().unwrap().id().to_owned();

    let locker = alice
        .create_locker("alice-bob", AccessLevel::Hosted, Some(&bob_did), Expiry::never())
        .unwrap();
    bob.import_locker(locker.perspective(&bob_did).unwrap())
        .unwrap();
    let locker = alice.locker(&locker.id).unwrap();

    let mut builder = alice.new_lease_builder().unwrap();
    builder
        .add_resource(&mut Cursor::new(b"attachment bytes".to_vec()))
        .unwrap();
    builder
        .add_meta_resource(
            &mut Cursor::new(br#"{"type":"TestDataset1"}"#.to_vec()),
            Some("application/json".to_owned()),
        )
        .unwrap();
    let future = builder
        .submit(Expiry::never(), alice.data_store(), &locker)
        .unwrap();
    future.wait(WAIT).unwrap();
    let record_id = future.record_id().to_owned();

    // Only the owning participant can revoke
    assert!(matches!(
        bob.data_store().revoke(&record_id, &bob.lockers().unwrap()),
        Err(Error::Core(CoreError::ForbiddenOperation))
    ));

    alice
        .data_store()
        .revoke(&record_id, &alice.lockers().unwrap())
        .unwrap()
        .wait(WAIT)
        .unwrap();
    assert_eq!(
        services.ledger.get_record_state(&record_id).unwrap().status,
        RecordStatus::Revoked
    );

    // Before the purge the lease still loads, but blob access is
    // forbidden
    let loaded = alice
        .data_store()
        .load(&record_id, &alice.lockers().unwrap(), None)
        .unwrap();
    assert!(matches!(
        loaded.meta_resource(),
        Err(Error::Core(CoreError::ForbiddenOperation))
    ));

    alice
        .data_store()
        .purge_data_assets(&record_id, &alice.lockers().unwrap())
        .unwrap();

    // After the purge the blobs are gone and the lease is unreachable
    assert!(matches!(
        loaded.meta_resource(),
        Err(Error::Core(CoreError::LeaseRevokedAndPurged))
    ));
    assert!(matches!(
        alice
            .data_store()
            .load(&record_id, &alice.lockers().unwrap(), None),
        Err(Error::Core(CoreError::LeaseRevokedAndPurged))
    ));
}

#[test]
fn sharing_reenvelopes_the_impression() {
    let services = test_services();
    let (alice, _) = create_wallet(&services, "alice", "pass-a");
    let (bob, _) = create_wallet(&services, "bob", "pass-b");
    let bob_did = bob.root_identity().unwrap().id().to_owned();

    // Alice keeps the original in her own uni-locker
    let own_locker = alice
        .create_locker("mine", AccessLevel::Hosted, None, Expiry::never())
        .unwrap();
    let own_locker = alice.locker(&own_locker.id).unwrap();
    let mut builder = alice.new_lease_builder().unwrap();
    let meta = br#"{"type":"SharedDataset"}"#.to_vec();
    builder
        .add_meta_resource(&mut Cursor::new(meta.clone()), Some("application/json".to_owned()))
        .unwrap();
    let original = builder
        .submit(Expiry::never(), alice.data_store(), &own_locker)
        .unwrap();
    original.wait(WAIT).unwrap();

    // Then shares it into the locker with Bob
    let shared_locker = alice
        .create_locker("alice-bob", AccessLevel::Hosted, Some(&bob_did), Expiry::never())
        .unwrap();
    bob.import_locker(shared_locker.perspective(&bob_did).unwrap())
        .unwrap();
    let shared_locker = alice.locker(&shared_locker.id).unwrap();

    let source = alice
        .data_store()
        .load(original.record_id(), &alice.lockers().unwrap(), None)
        .unwrap();
    let creator = alice.root_identity().unwrap().did;
    let shared = alice
        .data_store()
        .share(
            &source,
            &shared_locker,
            &creator,
            "local",
            CopyMode::Shallow,
            Expiry::never(),
        )
        .unwrap();
    shared.wait(WAIT).unwrap();

    // Bob receives the identical impression plus a share-provenance
    let received = bob
        .data_store()
        .load(shared.record_id(), &bob.lockers().unwrap(), None)
        .unwrap();
    assert_eq!(received.lease().impression, source.lease().impression);
    let share_provenance = received.lease().share_provenance.as_ref().unwrap();
    assert_eq!(
        share_provenance.was_quoted_from.as_deref(),
        Some(source.lease().impression.id.as_str())
    );
    assert_eq!(share_provenance.was_accessible_to.as_deref(), Some(bob_did.as_str()));
    assert!(share_provenance.verify().unwrap());

    let mut reader = received.meta_resource().unwrap();
    let mut content = Vec::new();
    reader.read_to_end(&mut content).unwrap();
    assert_eq!(content, meta);
}

struct Discovered(Arc<std::sync::Mutex<Vec<String>>>);

impl IndexConsumer for Discovered {
    fn deliver(&mut self, notification: BlockNotification) -> Result<()> {
        let mut seen = self.0.lock().unwrap();
        for dataset in notification.datasets {
            seen.push(dataset.record_id);
        }
        Ok(())
    }

    fn notify_scan_completed(&mut self, _top_block: u64) -> Result<()> {
        Ok(())
    }
}

#[test]
fn scanner_discovers_records_for_imported_lockers() {
    let services = test_services();
    let (alice, _) = create_wallet(&services, "alice", "pass-a");
    let (bob, _) = create_wallet(&services, "bob", "pass-b");
    let bob_did = bob.root_identity().unwrap().id().to_owned();

    let locker = alice
        .create_locker("alice-bob", AccessLevel::Hosted, Some(&bob_did), Expiry::never())
        .unwrap();
    bob.import_locker(locker.perspective(&bob_did).unwrap())
        .unwrap();

    // Bob watches every participant key of his lockers
    let mut scanner = Scanner::new(services.ledger.clone());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let configs: Vec<LockerConfig> = bob
        .lockers()
        .unwrap()
        .iter()
        .flat_map(|l| {
            l.participants.iter().map(|p| LockerConfig {
                key_id: format!("{}/{}", l.id, p.id),
                last_block: l.first_block,
                root_public_key: p.root_public_key,
            })
        })
        .collect();
    scanner
        .add_subscription("bob", configs, Box::new(Discovered(seen.clone())))
        .unwrap();

    // Nothing for Bob yet
    scanner.scan().unwrap();
    let already_seen = seen.lock().unwrap().len();

    let mut builder = alice.new_lease_builder().unwrap();
    builder
        .add_meta_resource(&mut Cursor::new(b"{}".to_vec()), None)
        .unwrap();
    let future = builder
        .submit(Expiry::never(), alice.data_store(), &alice.locker(&locker.id).unwrap())
        .unwrap();
    future.wait(WAIT).unwrap();

    let report = scanner.scan().unwrap();
    assert!(report.errors.is_empty());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), already_seen + 1);
    assert!(seen.contains(&future.record_id().to_owned()));
}

#[test]
fn wallet_lock_lifecycle() {
    let services = test_services();
    let (wallet, _) = create_wallet(&services, "alice", "pass-a");
    assert_eq!(wallet.lock_level(), LockLevel::Hosted);

    // Unlock is idempotent for the same passphrase
    wallet.unlock("pass-a").unwrap();
    assert_eq!(wallet.lock_level(), LockLevel::Hosted);

    wallet.lock();
    assert_eq!(wallet.lock_level(), LockLevel::None);
    assert!(matches!(
        wallet.root_identity(),
        Err(Error::WalletLocked)
    ));

    // A wrong passphrase leaves the wallet locked
    assert!(matches!(
        wallet.unlock("wrong"),
        Err(Error::Core(CoreError::InvalidPassphrase))
    ));
    assert_eq!(wallet.lock_level(), LockLevel::None);

    wallet.unlock("pass-a").unwrap();
    assert_eq!(wallet.lock_level(), LockLevel::Hosted);
}

#[test]
fn access_key_unlock_path() {
    let services = test_services();
    let (wallet, generated) = create_wallet(&services, "alice", "pass-a");

    let (access_key, client) = wallet.create_access_key(AccessLevel::Hosted).unwrap();
    assert_eq!(access_key.account_id, generated.account.id);

    // A fresh wallet instance unlocks with only the key id and secret
    let restricted = Wallet::new(generated.account.id.clone(), services.clone());
    restricted
        .unlock_with_access_key(&access_key.id, &client.secret_string())
        .unwrap();
    assert_eq!(restricted.lock_level(), LockLevel::Hosted);
    assert!(restricted.root_locker().is_ok());

    // Deleting the key cuts future unlocks off
    wallet.delete_access_key(&access_key.id).unwrap();
    let late = Wallet::new(generated.account.id.clone(), services.clone());
    assert!(matches!(
        late.unlock_with_access_key(&access_key.id, &client.secret_string()),
        Err(Error::AccessKeyNotFound)
    ));
}

#[test]
fn sub_account_is_recoverable_from_the_parent_node() {
    let services = test_services();
    let (parent, _) = create_wallet(&services, "alice", "pass-a");

    let generated = parent
        .create_sub_account("team", AccessLevel::Hosted, "sub-pass")
        .unwrap();
    assert_eq!(
        generated.account.parent_account.as_deref(),
        Some(parent.account_id())
    );
    assert_ne!(generated.account.derivation_index, 0);

    // The child unlocks from the parent's root node, no passphrase
    let child = Wallet::new(generated.account.id.clone(), services.clone());
    child.unlock_as_child(&parent.root_node().unwrap()).unwrap();
    assert_eq!(child.lock_level(), LockLevel::Hosted);
    assert!(child.root_locker().is_ok());

    // And independently with its own passphrase
    child.lock();
    child.unlock("sub-pass").unwrap();
    assert_eq!(child.lock_level(), LockLevel::Hosted);
}

#[test]
fn managed_unlock_limits_access() {
    let services = test_services();
    let (wallet, generated) = create_wallet(&services, "alice", "pass-a");

    // Derive the managed payload key the way a restricted client would
    // receive it
    let managed_key = generated
        .account
        .managed_secret_store
        .as_ref()
        .unwrap()
        .unseal_payload_key(&metalocker::envelope::password_hash("pass-a"))
        .unwrap();

    wallet.lock();
    wallet.unlock_as_managed(&managed_key).unwrap();
    assert_eq!(wallet.lock_level(), LockLevel::Managed);

    // Hosted entities are out of reach
    assert!(matches!(
        wallet.create_locker("h", AccessLevel::Hosted, None, Expiry::never()),
        Err(Error::InsufficientLockLevel { .. })
    ));
    // Managed entities are fine
    assert!(wallet
        .create_locker("m", AccessLevel::Managed, None, Expiry::never())
        .is_ok());
}

#[test]
fn properties_roundtrip() {
    let services = test_services();
    let (wallet, _) = create_wallet(&services, "alice", "pass-a");

    let value = serde_json::json!({"theme": "dark"});
    wallet
        .save_property("settings", &value, AccessLevel::Managed)
        .unwrap();
    assert_eq!(wallet.property("settings").unwrap(), value);

    wallet.delete_property("settings").unwrap();
    assert!(matches!(
        wallet.property("settings"),
        Err(Error::PropertyNotFound)
    ));
    assert!(matches!(
        wallet.delete_property("settings"),
        Err(Error::PropertyNotFound)
    ));
}

#[test]
fn passphrase_change_keeps_the_wallet_working() {
    let services = test_services();
    let (wallet, _) = create_wallet(&services, "alice", "old pass");

    wallet.change_passphrase("old pass", "new pass").unwrap();

    wallet.lock();
    assert!(wallet.unlock("old pass").is_err());
    wallet.unlock("new pass").unwrap();
    assert_eq!(wallet.lock_level(), LockLevel::Hosted);
    assert!(wallet.root_locker().is_ok());
}
