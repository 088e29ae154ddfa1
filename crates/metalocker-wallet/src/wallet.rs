//! Wallet orchestration: lock state, caches, sub-accounts and updates.
//!
//! The wallet composes the account backend, the ledger-facing data store
//! and the notification seam. Its mutable state is two locks: the lock
//! state (key material, guarded by `lock_state`) and the entity caches
//! (identities and lockers, guarded by `cache`). Every secret is wiped
//! when the wallet locks, and on any unlock failure.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metalocker::envelope::password_hash;
use metalocker::{
    AccessLevel, Account, AccountState, AccountTemplate, DataEnvelope, Error as CoreError, Expiry,
    GenerateOptions, GeneratedAccount, Identity, IdentityType, Ledger, Locker, LockerOptions,
    NotificationService, OffChainStorage, Party, PublishMode,
};
use metalocker::{BlobManager, SecretStorePayload};
use metalocker_keys::{
    hosted_crypto_key, managed_crypto_key, new_derivation_index, AesKey, ExtendedNode, HmacKey,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::access_key::{
    issue_access_key, open_key_material, AccessKey, ClientAccessKey,
};
use crate::data_store::{DataStore, RecordFuture};
use crate::errors::{Error, Result};
use crate::index::RootIndex;
use crate::lease_builder::LeaseBuilder;

/// Topic on which account updates are published
pub const ACCOUNT_UPDATES_TOPIC: &str = "account-updates";

/// How long a synchronous account update waits for confirmation
const UPDATE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// The wallet's lock level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LockLevel {
    #[default]
    None,
    Restricted,
    Managed,
    Hosted,
}

/// Server-side storage of accounts and their encrypted entities
///
/// The backend never sees cleartext: identities, lockers and properties
/// arrive as [`DataEnvelope`]s keyed by blind hashes.
pub trait AccountBackend: Send + Sync {
    fn create_account(&self, account: &Account) -> Result<()>;
    fn get_account(&self, id: &str) -> Result<Account>;
    fn update_account(&self, account: &Account) -> Result<()>;
    fn store_identity(&self, account_id: &str, envelope: &DataEnvelope) -> Result<()>;
    fn list_identities(&self, account_id: &str) -> Result<Vec<DataEnvelope>>;
    fn store_locker(&self, account_id: &str, envelope: &DataEnvelope) -> Result<()>;
    fn list_lockers(&self, account_id: &str) -> Result<Vec<DataEnvelope>>;
    fn store_property(&self, account_id: &str, envelope: &DataEnvelope) -> Result<()>;
    fn list_properties(&self, account_id: &str) -> Result<Vec<DataEnvelope>>;
    fn delete_property(&self, account_id: &str, hash: &str) -> Result<()>;
    fn store_access_key(&self, access_key: &AccessKey) -> Result<()>;
    fn get_access_key(&self, id: &str) -> Result<AccessKey>;
    fn delete_access_key(&self, id: &str) -> Result<()>;
}

/// The external collaborators a wallet is constructed over
///
/// No process-global registries: every backend handle is passed in
/// explicitly.
#[derive(Clone)]
pub struct WalletServices {
    pub backend: Arc<dyn AccountBackend>,
    pub ledger: Arc<dyn Ledger>,
    pub off_chain: Arc<dyn OffChainStorage>,
    pub blobs: Arc<dyn BlobManager>,
    pub index: Arc<dyn RootIndex>,
    pub notifications: Arc<dyn NotificationService>,
    pub vault_name: String,
}

#[derive(Default)]
struct LockState {
    level: LockLevel,
    managed_crypto: Option<AesKey>,
    hosted_crypto: Option<AesKey>,
    managed_hmac: Option<HmacKey>,
    managed_enc: Option<AesKey>,
    hosted_hmac: Option<HmacKey>,
    hosted_enc: Option<AesKey>,
    root_node: Option<ExtendedNode>,
    passphrase_digest: Option<([u8; 16], Zeroizing<[u8; 64]>)>,
}

impl LockState {
    /// Drops every piece of key material; the key types wipe themselves
    fn clear(&mut self) {
        *self = LockState::default();
    }
}

#[derive(Default)]
struct DataCache {
    identities: HashMap<String, Identity>,
    lockers: HashMap<String, Locker>,
    managed_root_locker: Option<String>,
    hosted_root_locker: Option<String>,
}

/// A data wallet bound to one account
pub struct Wallet {
    account_id: String,
    services: WalletServices,
    data_store: DataStore,
    lock_state: RwLock<LockState>,
    cache: RwLock<DataCache>,
}

impl Wallet {
    pub fn new(account_id: impl Into<String>, services: WalletServices) -> Self {
        let data_store = DataStore::new(
            services.ledger.clone(),
            services.off_chain.clone(),
            services.blobs.clone(),
            services.index.clone(),
        );
        Self {
            account_id: account_id.into(),
            services,
            data_store,
            lock_state: RwLock::new(LockState::default()),
            cache: RwLock::new(DataCache::default()),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn data_store(&self) -> &DataStore {
        &self.data_store
    }

    pub fn lock_level(&self) -> LockLevel {
        self.read_lock_state().level
    }

    /// Unlocks with the account passphrase
    ///
    /// For hosted accounts the hosted secret store is opened (one scrypt
    /// derivation); a salted digest of the passphrase is stashed so
    /// repeating the call with the same phrase is an idempotent no-op
    /// without re-running scrypt.
    pub fn unlock(&self, passphrase: &str) -> Result<()> {
        {
            let state = self.read_lock_state();
            if state.level != LockLevel::None {
                if let Some((salt, digest)) = &state.passphrase_digest {
                    if *passphrase_digest(salt, passphrase) == **digest {
                        log::debug!("Wallet::unlock - already unlocked, idempotent");
                        return Ok(());
                    }
                }
            }
        }
        self.unlock_with(|account| {
            if let Some(store) = &account.hosted_secret_store {
                let payload_key = store.unseal_payload_key(passphrase)?;
                let payload = store.open(&payload_key)?;
                Ok((LockLevel::Hosted, payload_key, payload))
            } else {
                let store = account
                    .managed_secret_store
                    .as_ref()
                    .ok_or(CoreError::InvalidSecretStore("account carries no store"))?;
                let payload_key = store.unseal_payload_key(&password_hash(passphrase))?;
                let payload = store.open(&payload_key)?;
                Ok((LockLevel::Managed, payload_key, payload))
            }
        })
        .map(|_| {
            let salt: [u8; 16] = rand::random();
            let digest = passphrase_digest(&salt, passphrase);
            self.write_lock_state().passphrase_digest = Some((salt, digest));
        })
    }

    /// Unlocks with a pre-derived managed payload key
    pub fn unlock_as_managed(&self, managed_key: &AesKey) -> Result<()> {
        let managed_key = managed_key.clone();
        self.unlock_with(move |account| {
            let store = account
                .managed_secret_store
                .as_ref()
                .ok_or(CoreError::InvalidSecretStore("account carries no store"))?;
            let payload = store.open(&managed_key)?;
            Ok((LockLevel::Managed, managed_key.clone(), payload))
        })
    }

    /// Unlocks with an access key id and client secret
    ///
    /// The secret reconstructs the Ed25519 management key, which decrypts
    /// the wallet key material carried by the stored access key; the
    /// wallet then proceeds as hosted or managed.
    pub fn unlock_with_access_key(&self, id: &str, secret: &str) -> Result<()> {
        let access_key = self.services.backend.get_access_key(id)?;
        let client = ClientAccessKey::parse(id, secret)?;
        let (managed_key, hosted_key) = open_key_material(&access_key, &client)?;
        let restricted = access_key.access_level == AccessLevel::Restricted;

        self.unlock_with(move |account| {
            if let (Some(hosted_key), Some(store)) = (&hosted_key, &account.hosted_secret_store) {
                let payload = store.open(hosted_key)?;
                return Ok((LockLevel::Hosted, hosted_key.clone(), payload));
            }
            let managed_key = managed_key
                .as_ref()
                .ok_or(Error::InvalidAccessKeySecret)?;
            let store = account
                .managed_secret_store
                .as_ref()
                .ok_or(CoreError::InvalidSecretStore("account carries no store"))?;
            let payload = store.open(managed_key)?;
            let level = if restricted {
                LockLevel::Restricted
            } else {
                LockLevel::Managed
            };
            Ok((level, managed_key.clone(), payload))
        })
    }

    /// Unlocks a sub-account from its parent's root node
    ///
    /// Re-derives the child node at the account's derivation index and
    /// reproduces the deterministic crypto key chain, then opens the
    /// stores exactly as a passphrase unlock would.
    pub fn unlock_as_child(&self, parent_node: &ExtendedNode) -> Result<()> {
        let account = self.services.backend.get_account(&self.account_id)?;
        let child = parent_node.derive_hardened(account.derivation_index)?;
        let hosted_key = hosted_crypto_key(&child);

        self.unlock_with(move |account| {
            if let Some(store) = &account.hosted_secret_store {
                let payload = store.open(&hosted_key)?;
                return Ok((LockLevel::Hosted, hosted_key.clone(), payload));
            }
            let managed_key = managed_crypto_key(&hosted_key);
            let store = account
                .managed_secret_store
                .as_ref()
                .ok_or(CoreError::InvalidSecretStore("account carries no store"))?;
            let payload = store.open(&managed_key)?;
            Ok((LockLevel::Managed, managed_key, payload))
        })
    }

    /// Locks the wallet, wiping all key material and cached entities
    pub fn lock(&self) {
        self.write_lock_state().clear();
        let mut cache = self.write_cache();
        *cache = DataCache::default();
        log::debug!("Wallet::lock - locked");
    }

    /// The shared unlock tail: populate lock state and caches
    ///
    /// Any failure clears the lock state before surfacing.
    fn unlock_with<F>(&self, open: F) -> Result<()>
    where
        F: FnOnce(&Account) -> Result<(LockLevel, AesKey, SecretStorePayload)>,
    {
        let outcome = (|| {
            let account = self.services.backend.get_account(&self.account_id)?;
            if account.state != AccountState::Active {
                return Err(CoreError::ForbiddenOperation.into());
            }
            let (level, payload_key, payload) = open(&account)?;
            self.populate(level, payload_key, payload)
        })();
        if outcome.is_err() {
            self.write_lock_state().clear();
            *self.write_cache() = DataCache::default();
        }
        outcome
    }

    fn populate(
        &self,
        level: LockLevel,
        payload_key: AesKey,
        payload: SecretStorePayload,
    ) -> Result<()> {
        let mut state = self.write_lock_state();
        let mut cache = self.write_cache();
        state.clear();
        *cache = DataCache::default();

        state.level = level;
        state.managed_hmac = Some(payload.managed_hmac_key.clone());
        state.managed_enc = Some(payload.managed_encryption_key.clone());
        state.hosted_hmac = payload.hosted_hmac_key.clone();
        state.hosted_enc = payload.hosted_encryption_key.clone();
        state.root_node = payload.account_root_key.clone();
        if level == LockLevel::Hosted {
            state.hosted_crypto = Some(payload_key.clone());
            state.managed_crypto = Some(managed_crypto_key(&payload_key));
        } else {
            state.managed_crypto = Some(payload_key);
        }

        cache.managed_root_locker = payload.managed_root_locker.clone();
        cache.hosted_root_locker = payload.hosted_root_locker.clone();
        for identity in payload.identities {
            cache.identities.insert(identity.id().to_owned(), identity);
        }

        // Hydrate the server-side envelopes we can open at this level
        for envelope in self.services.backend.list_identities(&self.account_id)? {
            if let Some(enc) = envelope_key(&state, envelope.access_level) {
                if let Ok(identity) = envelope.open::<Identity>(enc) {
                    cache
                        .identities
                        .entry(identity.id().to_owned())
                        .or_insert(identity);
                }
            }
        }
        for envelope in self.services.backend.list_lockers(&self.account_id)? {
            if let Some(enc) = envelope_key(&state, envelope.access_level) {
                if let Ok(locker) = envelope.open::<Locker>(enc) {
                    cache.lockers.insert(locker.id.clone(), locker);
                }
            }
        }
        log::debug!(
            "Wallet::populate - level={level:?} identities={} lockers={}",
            cache.identities.len(),
            cache.lockers.len()
        );
        Ok(())
    }

    /// Requires the wallet to be unlocked at or above the level that can
    /// open `level` entities
    fn require_level(&self, level: AccessLevel) -> Result<()> {
        let actual = self.lock_level();
        let required = lock_level_for(level);
        if actual == LockLevel::None {
            return Err(Error::WalletLocked);
        }
        if actual < required {
            return Err(Error::InsufficientLockLevel { required, actual });
        }
        Ok(())
    }

    /// The root identity of the account
    pub fn root_identity(&self) -> Result<Identity> {
        self.require_level(AccessLevel::Managed)?;
        self.read_cache()
            .identities
            .values()
            .find(|i| i.identity_type == IdentityType::Root)
            .cloned()
            .ok_or(Error::IdentityNotFound)
    }

    /// Looks up a cached identity by DID
    pub fn identity(&self, id: &str) -> Result<Identity> {
        self.require_level(AccessLevel::Managed)?;
        self.read_cache()
            .identities
            .get(id)
            .cloned()
            .ok_or(Error::IdentityNotFound)
    }

    /// Creates and stores a new identity
    pub fn create_identity(
        &self,
        name: &str,
        identity_type: IdentityType,
        access_level: AccessLevel,
    ) -> Result<Identity> {
        self.require_level(access_level)?;
        let identity = Identity::new(name, identity_type, access_level);
        let envelope = {
            let state = self.read_lock_state();
            let (enc, hmac) = level_keys(&state, access_level)?;
            DataEnvelope::seal(identity.id(), &identity, access_level, enc, hmac)?
        };
        self.services
            .backend
            .store_identity(&self.account_id, &envelope)?;
        self.write_cache()
            .identities
            .insert(identity.id().to_owned(), identity.clone());

        self.send_account_update("AddIdentity", identity.id(), false)?;
        Ok(identity)
    }

    /// Creates a locker, waits for the ledger to accept the announcement
    ///
    /// The `AddLocker` account update is submitted synchronously so the
    /// returned locker's `accepted_at_block` is accurate; scanners
    /// attached to the account learn about the new locker from it.
    pub fn create_locker(
        &self,
        name: &str,
        access_level: AccessLevel,
        them: Option<&str>,
        expires_at: Expiry,
    ) -> Result<Locker> {
        self.require_level(access_level)?;
        let us = self.root_identity()?;
        let first_block = self.services.ledger.get_top_block()?.number;

        let mut parties = vec![Party::us(us.id())];
        if let Some(them) = them {
            parties.push(Party::them(them));
        }
        let mut locker = Locker::new(
            name,
            access_level,
            parties,
            LockerOptions {
                expires_at,
                first_block,
            },
        )?;

        let accepted = self.send_account_update("AddLocker", &locker.id, true)?;
        locker.accepted_at_block = accepted;

        self.store_locker(&locker)?;
        Ok(locker)
    }

    /// Imports a locker received from another participant
    pub fn import_locker(&self, locker: Locker) -> Result<Locker> {
        self.require_level(locker.access_level)?;
        if self.read_cache().lockers.contains_key(&locker.id) {
            return Err(Error::LockerStateExists);
        }
        self.store_locker(&locker)?;
        self.send_account_update("AddLocker", &locker.id, false)?;
        Ok(locker)
    }

    fn store_locker(&self, locker: &Locker) -> Result<()> {
        let envelope = {
            let state = self.read_lock_state();
            let (enc, hmac) = level_keys(&state, locker.access_level)?;
            DataEnvelope::seal(&locker.id, locker, locker.access_level, enc, hmac)?
        };
        self.services
            .backend
            .store_locker(&self.account_id, &envelope)?;
        self.write_cache()
            .lockers
            .insert(locker.id.clone(), locker.clone());
        Ok(())
    }

    /// Looks up a cached locker
    pub fn locker(&self, id: &str) -> Result<Locker> {
        self.require_level(AccessLevel::Managed)?;
        self.read_cache()
            .lockers
            .get(id)
            .cloned()
            .ok_or(Error::LockerNotFound)
    }

    /// All lockers visible at the current lock level
    pub fn lockers(&self) -> Result<Vec<Locker>> {
        self.require_level(AccessLevel::Managed)?;
        let mut lockers: Vec<Locker> = self.read_cache().lockers.values().cloned().collect();
        lockers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(lockers)
    }

    /// The account's root locker at the highest unlocked level
    pub fn root_locker(&self) -> Result<Locker> {
        self.require_level(AccessLevel::Managed)?;
        let hosted = self.lock_level() == LockLevel::Hosted;
        let cache = self.read_cache();
        let id = cache
            .hosted_root_locker
            .as_ref()
            .filter(|_| hosted)
            .or(cache.managed_root_locker.as_ref())
            .ok_or(Error::LockerNotFound)?;
        cache.lockers.get(id).cloned().ok_or(Error::LockerNotFound)
    }

    /// Starts a lease builder writing into the wallet's vault
    pub fn new_lease_builder(&self) -> Result<LeaseBuilder> {
        self.require_level(AccessLevel::Managed)?;
        let creator = self.root_identity()?;
        Ok(LeaseBuilder::new(
            self.services.blobs.clone(),
            creator.did,
            self.services.vault_name.clone(),
        ))
    }

    /// Stores a property value under a blind key
    pub fn save_property(&self, key: &str, value: &Value, access_level: AccessLevel) -> Result<()> {
        self.require_level(access_level)?;
        let envelope = {
            let state = self.read_lock_state();
            let (enc, hmac) = level_keys(&state, access_level)?;
            DataEnvelope::seal(key, value, access_level, enc, hmac)?
        };
        self.services
            .backend
            .store_property(&self.account_id, &envelope)
    }

    /// Reads a property by key
    pub fn property(&self, key: &str) -> Result<Value> {
        self.require_level(AccessLevel::Managed)?;
        let state = self.read_lock_state();
        for envelope in self.services.backend.list_properties(&self.account_id)? {
            let Some((enc, hmac)) = opened_level_keys(&state, envelope.access_level) else {
                continue;
            };
            if envelope.hash == metalocker::envelope::hash_id(key, hmac) {
                return Ok(envelope.open(enc)?);
            }
        }
        Err(Error::PropertyNotFound)
    }

    /// Deletes a property by key
    pub fn delete_property(&self, key: &str) -> Result<()> {
        self.require_level(AccessLevel::Managed)?;
        let hashes: Vec<String> = {
            let state = self.read_lock_state();
            [
                state.managed_hmac.as_ref(),
                state.hosted_hmac.as_ref(),
            ]
            .into_iter()
            .flatten()
            .map(|hmac| metalocker::envelope::hash_id(key, hmac))
            .collect()
        };
        for hash in hashes {
            match self.services.backend.delete_property(&self.account_id, &hash) {
                Ok(()) => return Ok(()),
                Err(Error::PropertyNotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::PropertyNotFound)
    }

    /// Issues an access key carrying the wallet keys of `access_level`
    pub fn create_access_key(&self, access_level: AccessLevel) -> Result<(AccessKey, ClientAccessKey)> {
        self.require_level(access_level)?;
        let (managed, hosted) = {
            let state = self.read_lock_state();
            let hosted = (access_level == AccessLevel::Hosted)
                .then(|| state.hosted_crypto.clone())
                .flatten();
            (state.managed_crypto.clone(), hosted)
        };
        let (access_key, client) = issue_access_key(
            &self.account_id,
            access_level,
            managed.as_ref(),
            hosted.as_ref(),
        )?;
        self.services.backend.store_access_key(&access_key)?;
        Ok((access_key, client))
    }

    /// Revokes an access key
    pub fn delete_access_key(&self, id: &str) -> Result<()> {
        self.require_level(AccessLevel::Managed)?;
        self.services.backend.delete_access_key(id)
    }

    /// Creates a deterministically recoverable sub-account
    ///
    /// The child root node is derived at a fresh hardened index recorded
    /// on the sub-account, so [`Wallet::unlock_as_child`] can always
    /// reproduce its keys from the parent node.
    pub fn create_sub_account(
        &self,
        name: &str,
        access_level: AccessLevel,
        passphrase: &str,
    ) -> Result<GeneratedAccount> {
        self.require_level(AccessLevel::Hosted)?;
        let parent_node = self
            .read_lock_state()
            .root_node
            .clone()
            .ok_or(Error::WalletLocked)?;

        let derivation_index = new_derivation_index();
        let child = parent_node.derive_hardened(derivation_index)?;
        let generated = Account::generate(
            AccountTemplate {
                name: name.to_owned(),
                access_level,
                parent_account: Some(self.account_id.clone()),
                master_account: Some(self.account_id.clone()),
            },
            GenerateOptions {
                passphrase: passphrase.to_owned(),
                passphrase_is_hashed: false,
                root_node: Some(child),
                derivation_index,
                with_recovery: false,
            },
        )?;

        self.services.backend.create_account(&generated.account)?;
        for envelope in &generated.encrypted_identities {
            self.services
                .backend
                .store_identity(&generated.account.id, envelope)?;
        }
        for envelope in &generated.encrypted_lockers {
            self.services
                .backend
                .store_locker(&generated.account.id, envelope)?;
        }

        self.send_account_update("AddSubAccount", &generated.account.id, false)?;
        Ok(generated)
    }

    /// Changes the account passphrase and re-stashes the unlock digest
    ///
    /// The stores' payload keys are re-wrapped on the backend copy of the
    /// account; the wallet stays unlocked and subsequent unlocks use the
    /// new passphrase.
    pub fn change_passphrase(&self, old_passphrase: &str, new_passphrase: &str) -> Result<()> {
        self.require_level(AccessLevel::Managed)?;
        let mut account = self.services.backend.get_account(&self.account_id)?;
        let is_hash = self.lock_level() < LockLevel::Hosted;
        let (old_passphrase, new_passphrase) = if is_hash {
            (password_hash(old_passphrase), password_hash(new_passphrase))
        } else {
            (old_passphrase.to_owned(), new_passphrase.to_owned())
        };
        account.change_passphrase(&old_passphrase, &new_passphrase, is_hash)?;
        self.services.backend.update_account(&account)?;
        self.write_lock_state().passphrase_digest = None;
        Ok(())
    }

    /// The account root node; hosted unlock only
    pub fn root_node(&self) -> Result<ExtendedNode> {
        self.require_level(AccessLevel::Hosted)?;
        self.read_lock_state()
            .root_node
            .clone()
            .ok_or(Error::WalletLocked)
    }

    /// Submits an `AccountUpdate` dataset into the root locker
    ///
    /// Synchronous updates wait for ledger confirmation and return the
    /// block number; fire-and-forget updates return `None`. Either way a
    /// notification goes out on the account-updates topic so attached
    /// scanners learn to refresh.
    fn send_account_update(
        &self,
        action: &str,
        subject: &str,
        wait_confirm: bool,
    ) -> Result<Option<u64>> {
        let root_locker = self.root_locker()?;
        let creator = self.root_identity()?;

        let message = json!({
            "type": "AccountUpdate",
            "account": self.account_id,
            "action": action,
            "subject": subject,
        });
        let mut builder = LeaseBuilder::new(
            self.services.blobs.clone(),
            creator.did.clone(),
            self.services.vault_name.clone(),
        );
        builder.data_set_type("AccountUpdate");
        builder.add_meta_resource(
            &mut Cursor::new(serde_json::to_vec(&message)?),
            Some("application/json".to_owned()),
        )?;
        let future: RecordFuture = builder.submit(Expiry::never(), &self.data_store, &root_locker)?;

        self.services.notifications.publish(
            &message,
            PublishMode::Try,
            true,
            &[ACCOUNT_UPDATES_TOPIC.to_owned()],
        )?;

        if !wait_confirm {
            return Ok(None);
        }
        future.wait(UPDATE_CONFIRM_TIMEOUT)?;
        let state = self
            .services
            .ledger
            .get_record_state(future.record_id())?;
        Ok(Some(state.block_number))
    }

    fn read_lock_state(&self) -> std::sync::RwLockReadGuard<'_, LockState> {
        self.lock_state
            .read()
            .expect("the lock-state lock is never poisoned")
    }

    fn write_lock_state(&self) -> std::sync::RwLockWriteGuard<'_, LockState> {
        self.lock_state
            .write()
            .expect("the lock-state lock is never poisoned")
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, DataCache> {
        self.cache.read().expect("the cache lock is never poisoned")
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, DataCache> {
        self.cache.write().expect("the cache lock is never poisoned")
    }
}

/// The lock level required to open entities of `level`
fn lock_level_for(level: AccessLevel) -> LockLevel {
    match level {
        AccessLevel::None => LockLevel::None,
        AccessLevel::Restricted => LockLevel::Restricted,
        AccessLevel::Managed | AccessLevel::Local => LockLevel::Managed,
        AccessLevel::Hosted => LockLevel::Hosted,
    }
}

/// The envelope keys of `level`, requiring them to be present
fn level_keys<'a>(state: &'a LockState, level: AccessLevel) -> Result<(&'a AesKey, &'a HmacKey)> {
    opened_level_keys(state, level).ok_or(Error::WalletLocked)
}

fn opened_level_keys<'a>(
    state: &'a LockState,
    level: AccessLevel,
) -> Option<(&'a AesKey, &'a HmacKey)> {
    match level {
        AccessLevel::Hosted => Some((state.hosted_enc.as_ref()?, state.hosted_hmac.as_ref()?)),
        _ => Some((state.managed_enc.as_ref()?, state.managed_hmac.as_ref()?)),
    }
}

fn envelope_key<'a>(state: &'a LockState, level: AccessLevel) -> Option<&'a AesKey> {
    opened_level_keys(state, level).map(|(enc, _)| enc)
}

fn passphrase_digest(salt: &[u8; 16], passphrase: &str) -> Zeroizing<[u8; 64]> {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(passphrase.as_bytes());
    Zeroizing::new(hasher.finalize().into())
}

/// An in-memory [`AccountBackend`]
#[derive(Default)]
pub struct MemoryAccountBackend {
    accounts: Mutex<HashMap<String, Account>>,
    identities: Mutex<HashMap<String, Vec<DataEnvelope>>>,
    lockers: Mutex<HashMap<String, Vec<DataEnvelope>>>,
    properties: Mutex<HashMap<String, Vec<DataEnvelope>>>,
    access_keys: Mutex<HashMap<String, AccessKey>>,
}

impl MemoryAccountBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountBackend for MemoryAccountBackend {
    fn create_account(&self, account: &Account) -> Result<()> {
        let mut accounts = self.accounts.lock().expect("never poisoned");
        if accounts.contains_key(&account.id) {
            return Err(CoreError::AccountExists.into());
        }
        accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    fn get_account(&self, id: &str) -> Result<Account> {
        self.accounts
            .lock()
            .expect("never poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::AccountNotFound.into())
    }

    fn update_account(&self, account: &Account) -> Result<()> {
        let mut accounts = self.accounts.lock().expect("never poisoned");
        if !accounts.contains_key(&account.id) {
            return Err(CoreError::AccountNotFound.into());
        }
        accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    fn store_identity(&self, account_id: &str, envelope: &DataEnvelope) -> Result<()> {
        self.identities
            .lock()
            .expect("never poisoned")
            .entry(account_id.to_owned())
            .or_default()
            .push(envelope.clone());
        Ok(())
    }

    fn list_identities(&self, account_id: &str) -> Result<Vec<DataEnvelope>> {
        Ok(self
            .identities
            .lock()
            .expect("never poisoned")
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    fn store_locker(&self, account_id: &str, envelope: &DataEnvelope) -> Result<()> {
        self.lockers
            .lock()
            .expect("never poisoned")
            .entry(account_id.to_owned())
            .or_default()
            .push(envelope.clone());
        Ok(())
    }

    fn list_lockers(&self, account_id: &str) -> Result<Vec<DataEnvelope>> {
        Ok(self
            .lockers
            .lock()
            .expect("never poisoned")
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    fn store_property(&self, account_id: &str, envelope: &DataEnvelope) -> Result<()> {
        let mut properties = self.properties.lock().expect("never poisoned");
        let entries = properties.entry(account_id.to_owned()).or_default();
        entries.retain(|e| e.hash != envelope.hash);
        entries.push(envelope.clone());
        Ok(())
    }

    fn list_properties(&self, account_id: &str) -> Result<Vec<DataEnvelope>> {
        Ok(self
            .properties
            .lock()
            .expect("never poisoned")
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    fn delete_property(&self, account_id: &str, hash: &str) -> Result<()> {
        let mut properties = self.properties.lock().expect("never poisoned");
        let entries = properties
            .get_mut(account_id)
            .ok_or(Error::PropertyNotFound)?;
        let before = entries.len();
        entries.retain(|e| e.hash != hash);
        if entries.len() == before {
            return Err(Error::PropertyNotFound);
        }
        Ok(())
    }

    fn store_access_key(&self, access_key: &AccessKey) -> Result<()> {
        self.access_keys
            .lock()
            .expect("never poisoned")
            .insert(access_key.id.clone(), access_key.clone());
        Ok(())
    }

    fn get_access_key(&self, id: &str) -> Result<AccessKey> {
        self.access_keys
            .lock()
            .expect("never poisoned")
            .get(id)
            .cloned()
            .ok_or(Error::AccessKeyNotFound)
    }

    fn delete_access_key(&self, id: &str) -> Result<()> {
        self.access_keys
            .lock()
            .expect("never poisoned")
            .remove(id)
            .map(|_| ())
            .ok_or(Error::AccessKeyNotFound)
    }
}
