mod secret_store;

pub use secret_store::{SecretStore, SecretStorePayload};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use metalocker_keys::{
    generate_encryption_key, generate_hmac_key, hosted_crypto_key, managed_crypto_key, AesKey,
    ExtendedNode, RecoveryKit,
};
use serde::{Deserialize, Serialize};

use crate::access::AccessLevel;
use crate::did::Did;
use crate::envelope::{anon_encrypt, password_hash, DataEnvelope};
use crate::errors::{Error, Result};
use crate::identity::{Identity, IdentityType};
use crate::locker::{Locker, LockerOptions, Party};
use crate::utils::random_id;

/// Lifecycle state of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountState {
    #[default]
    Active,
    Suspended,
    Recovery,
    Deleted,
}

impl AccountState {
    /// True if the transition `self -> next` is allowed
    ///
    /// The machine is `active -> suspended -> active | deleted` and
    /// `active -> recovery -> active`.
    pub fn can_transition(self, next: AccountState) -> bool {
        use AccountState::*;
        matches!(
            (self, next),
            (Active, Suspended)
                | (Suspended, Active)
                | (Suspended, Deleted)
                | (Active, Recovery)
                | (Recovery, Active)
        )
    }
}

/// An account record
///
/// The account id equals the root identity's DID and never changes once
/// the account exists. Secret material lives in the encrypted secret
/// stores; everything else here is visible to the hosting service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub state: AccountState,
    pub name: String,
    #[serde(rename = "accessLevel")]
    pub access_level: AccessLevel,
    #[serde(rename = "encryptedPassword")]
    pub encrypted_password: String,
    #[serde(rename = "parentAccount", default, skip_serializing_if = "Option::is_none")]
    pub parent_account: Option<String>,
    #[serde(rename = "masterAccount", default, skip_serializing_if = "Option::is_none")]
    pub master_account: Option<String>,
    #[serde(
        rename = "managedSecretStore",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub managed_secret_store: Option<SecretStore>,
    #[serde(
        rename = "hostedSecretStore",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hosted_secret_store: Option<SecretStore>,
    #[serde(rename = "derivationIndex", default)]
    pub derivation_index: u32,
    #[serde(
        rename = "recoveryPublicKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub recovery_public_key: Option<String>,
    #[serde(
        rename = "encryptedRecoverySecret",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub encrypted_recovery_secret: Option<String>,
}

/// Inputs describing the account to generate
#[derive(Debug, Clone)]
pub struct AccountTemplate {
    pub name: String,
    pub access_level: AccessLevel,
    pub parent_account: Option<String>,
    pub master_account: Option<String>,
}

/// Options controlling account generation
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Cleartext passphrase, or its transport hash when
    /// `passphrase_is_hashed`
    pub passphrase: String,
    /// The passphrase is already the transport hash; only acceptable for
    /// managed accounts
    pub passphrase_is_hashed: bool,
    /// Pre-derived root node; used when the account is a sub-account of a
    /// parent node
    pub root_node: Option<ExtendedNode>,
    /// Hardened index the root node was derived at (sub-accounts)
    pub derivation_index: u32,
    /// Generate a recovery phrase and encrypted recovery secret
    pub with_recovery: bool,
}

/// Everything produced by [`Account::generate`]
pub struct GeneratedAccount {
    pub account: Account,
    pub recovery_phrase: Option<String>,
    pub second_level_recovery_code: Option<String>,
    /// The root identities, hydrated with their signing keys
    pub root_identities: Vec<Identity>,
    pub encrypted_identities: Vec<DataEnvelope>,
    pub encrypted_lockers: Vec<DataEnvelope>,
}

impl Account {
    /// Generates a new account with its secret stores, root identity and
    /// root lockers
    ///
    /// Managed accounts get the managed secret store only; hosted accounts
    /// get both, with the managed payload a strict subset of the hosted
    /// one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAccessLevel`] for non-account levels and
    /// [`Error::InvalidPassphrase`] when a hosted account is generated
    /// from a hashed passphrase (the hosted store binds to the raw form).
    pub fn generate(template: AccountTemplate, opts: GenerateOptions) -> Result<GeneratedAccount> {
        if !matches!(
            template.access_level,
            AccessLevel::Managed | AccessLevel::Hosted
        ) {
            return Err(Error::InvalidAccessLevel(template.access_level as u8));
        }
        let hosted = template.access_level == AccessLevel::Hosted;
        if hosted && opts.passphrase_is_hashed {
            return Err(Error::InvalidPassphrase);
        }

        let root_node = match opts.root_node {
            Some(node) => node,
            None => {
                let seed: [u8; 32] = rand::random();
                ExtendedNode::new_master(&seed)?
            }
        };
        let hosted_crypto = hosted_crypto_key(&root_node);
        let managed_crypto = managed_crypto_key(&hosted_crypto);

        // The root identity's DID is bound to the root node, so the
        // account id is reproducible from the node alone
        let root_did = Did::from_signing_key(root_node.signing_key());
        let account_id = root_did.id().to_owned();
        let root_identity = Identity {
            did: root_did,
            created: chrono::Utc::now(),
            name: format!("{} (root)", template.name),
            identity_type: IdentityType::Root,
            access_level: template.access_level,
            lockers: None,
        };

        let managed_hmac = generate_hmac_key();
        let managed_enc = generate_encryption_key();
        let hosted_hmac = generate_hmac_key();
        let hosted_enc = generate_encryption_key();

        let managed_root_locker = Locker::new(
            "root (managed)",
            AccessLevel::Managed,
            vec![Party::us(&account_id)],
            LockerOptions::default(),
        )?;
        let hosted_root_locker = hosted
            .then(|| {
                Locker::new(
                    "root (hosted)",
                    AccessLevel::Hosted,
                    vec![Party::us(&account_id)],
                    LockerOptions::default(),
                )
            })
            .transpose()?;

        let mut encrypted_lockers = vec![DataEnvelope::seal(
            &managed_root_locker.id,
            &managed_root_locker,
            AccessLevel::Managed,
            &managed_enc,
            &managed_hmac,
        )?];
        if let Some(locker) = &hosted_root_locker {
            encrypted_lockers.push(DataEnvelope::seal(
                &locker.id,
                locker,
                AccessLevel::Hosted,
                &hosted_enc,
                &hosted_hmac,
            )?);
        }

        let (identity_enc, identity_hmac) = if hosted {
            (&hosted_enc, &hosted_hmac)
        } else {
            (&managed_enc, &managed_hmac)
        };
        let encrypted_identities = vec![DataEnvelope::seal(
            root_identity.id(),
            &root_identity,
            template.access_level,
            identity_enc,
            identity_hmac,
        )?];

        let full_payload = SecretStorePayload {
            managed_hmac_key: managed_hmac,
            managed_encryption_key: managed_enc,
            hosted_hmac_key: hosted.then_some(hosted_hmac),
            hosted_encryption_key: hosted.then_some(hosted_enc),
            account_root_key: hosted.then(|| root_node.clone()),
            managed_root_locker: Some(managed_root_locker.id.clone()),
            hosted_root_locker: hosted_root_locker.as_ref().map(|l| l.id.clone()),
            identities: vec![root_identity.clone()],
        };

        let hashed_passphrase = if opts.passphrase_is_hashed {
            opts.passphrase.clone()
        } else {
            password_hash(&opts.passphrase)
        };

        let managed_secret_store = SecretStore::seal(
            AccessLevel::Managed,
            &full_payload.managed_subset(),
            &managed_crypto,
            &hashed_passphrase,
        )?;
        let hosted_secret_store = hosted
            .then(|| {
                SecretStore::seal(
                    AccessLevel::Hosted,
                    &full_payload,
                    &hosted_crypto,
                    &opts.passphrase,
                )
            })
            .transpose()?;

        let (recovery_phrase, recovery_public_key, encrypted_recovery_secret) =
            if opts.with_recovery {
                let (mnemonic, kit) = RecoveryKit::generate();
                let secret =
                    BASE64.encode(anon_encrypt(&kit.verifying_key(), hosted_crypto.as_bytes())?);
                (
                    Some(mnemonic.to_string()),
                    Some(kit.public_key_base58()),
                    Some(secret),
                )
            } else {
                (None, None, None)
            };
        let second_level_recovery_code =
            (opts.with_recovery && !hosted).then(|| random_id(32));

        let account = Account {
            id: account_id,
            state: AccountState::Active,
            name: template.name,
            access_level: template.access_level,
            encrypted_password: hashed_passphrase,
            parent_account: template.parent_account,
            master_account: template.master_account,
            managed_secret_store: Some(managed_secret_store),
            hosted_secret_store,
            derivation_index: opts.derivation_index,
            recovery_public_key,
            encrypted_recovery_secret,
        };
        account.validate()?;

        Ok(GeneratedAccount {
            account,
            recovery_phrase,
            second_level_recovery_code,
            root_identities: vec![root_identity],
            encrypted_identities,
            encrypted_lockers,
        })
    }

    /// Checks the structural invariants of the account record
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidRecord("account id is empty"));
        }
        match self.access_level {
            AccessLevel::Managed if self.managed_secret_store.is_none() => Err(
                Error::InvalidSecretStore("managed accounts carry a managed secret store"),
            ),
            AccessLevel::Hosted
                if self.managed_secret_store.is_none() || self.hosted_secret_store.is_none() =>
            {
                Err(Error::InvalidSecretStore(
                    "hosted accounts carry both secret stores",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Moves the account to a new lifecycle state
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForbiddenOperation`] for transitions outside the
    /// state machine.
    pub fn transition(&mut self, next: AccountState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(Error::ForbiddenOperation);
        }
        log::debug!(
            "Account::transition - id={} {:?} -> {next:?}",
            self.id,
            self.state
        );
        self.state = next;
        Ok(())
    }

    /// Restores access with the recovered hosted crypto key
    ///
    /// Re-wraps the secret stores' payload keys for `new_passphrase`; the
    /// managed store receives the demoted form of the crypto key. Leaves
    /// the account active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when `crypto_key` does not open the
    /// account's stores.
    pub fn recover(&mut self, crypto_key: &AesKey, new_passphrase: &str) -> Result<()> {
        if let Some(store) = &mut self.hosted_secret_store {
            // Prove the key before touching anything
            store.open(crypto_key)?;
            store.rewrap_payload_key(crypto_key, new_passphrase)?;
        }
        let managed_key = managed_crypto_key(crypto_key);
        if let Some(store) = &mut self.managed_secret_store {
            store.open(&managed_key)?;
            store.rewrap_payload_key(&managed_key, &password_hash(new_passphrase))?;
        }
        self.encrypted_password = password_hash(new_passphrase);
        self.state = AccountState::Active;
        Ok(())
    }

    /// Changes the account passphrase
    ///
    /// Hosted accounts require the cleartext passphrases (`is_hash` must
    /// be false): the hosted store binds to the raw form, the managed
    /// store to the transport hash. Managed-only accounts accept either
    /// form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPassphrase`] when the old passphrase does
    /// not unwrap the stores, or when `is_hash` is set for a hosted
    /// account.
    pub fn change_passphrase(
        &mut self,
        old_passphrase: &str,
        new_passphrase: &str,
        is_hash: bool,
    ) -> Result<()> {
        if self.hosted_secret_store.is_some() && is_hash {
            return Err(Error::InvalidPassphrase);
        }
        let (old_hashed, new_hashed) = if is_hash {
            (old_passphrase.to_owned(), new_passphrase.to_owned())
        } else {
            (password_hash(old_passphrase), password_hash(new_passphrase))
        };
        if let Some(store) = &mut self.hosted_secret_store {
            store.change_passphrase(old_passphrase, new_passphrase)?;
        }
        if let Some(store) = &mut self.managed_secret_store {
            store.change_passphrase(&old_hashed, &new_hashed)?;
        }
        self.encrypted_password = new_hashed;
        Ok(())
    }
}
