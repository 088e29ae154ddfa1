//! Incremental assembly of dataset leases.
//!
//! A builder accumulates resources, provenance and head declarations, then
//! produces a signed lease: either a fresh impression (optionally chained
//! as a revision of a parent) or a sharing re-envelope of an existing one.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::sync::Arc;

use chrono::Utc;
use metalocker::lease::{LEASE_TYPE, PROV_AGENT_TYPE, PROV_ENTITY_TYPE};
use metalocker::utils::random_id;
use metalocker::{
    BlobManager, Did, Error as CoreError, Expiry, Impression, Lease, ProvenanceEntity,
    StoredResource,
};

use metalocker::Locker;

use crate::data_store::{DataSet, DataStore, RecordFuture, SubmitOptions};
use crate::errors::Result;

/// Template provenance id, bound to the next meta-resource's asset id
pub const RESOURCE_TEMPLATE_ID: &str = "%%resource%%";

/// Default dataset type when none is declared
const DEFAULT_DATA_SET_TYPE: &str = "Dataset";

/// How resources travel when a lease is derived from a parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// Re-upload the blobs into the target vault
    Deep,
    /// Import the parent's resource handles as-is
    #[default]
    Shallow,
    /// Carry no resources
    None,
}

struct ParentContext {
    lease: Lease,
    copy_mode: CopyMode,
}

/// Assembles a [`Lease`] from incremental operations
pub struct LeaseBuilder {
    blobs: Arc<dyn BlobManager>,
    creator: Did,
    vault_name: String,
    data_set_type: String,
    resources: Vec<StoredResource>,
    meta_asset: Option<String>,
    content_type: Option<String>,
    provenance: BTreeMap<String, ProvenanceEntity>,
    parent: Option<ParentContext>,
    sharing_recipient: Option<String>,
    head_names: Vec<String>,
}

impl LeaseBuilder {
    pub fn new(blobs: Arc<dyn BlobManager>, creator: Did, vault_name: impl Into<String>) -> Self {
        Self {
            blobs,
            creator,
            vault_name: vault_name.into(),
            data_set_type: DEFAULT_DATA_SET_TYPE.to_owned(),
            resources: Vec::new(),
            meta_asset: None,
            content_type: None,
            provenance: BTreeMap::new(),
            parent: None,
            sharing_recipient: None,
            head_names: Vec::new(),
        }
    }

    /// Declares the dataset type of the resulting lease
    pub fn data_set_type(&mut self, data_set_type: impl Into<String>) -> &mut Self {
        self.data_set_type = data_set_type.into();
        self
    }

    /// Uploads a blob and attaches it as a resource; returns its asset id
    ///
    /// Duplicate content is deduplicated: the second upload is purged and
    /// the existing asset id returned.
    pub fn add_resource(&mut self, reader: &mut dyn Read) -> Result<String> {
        let stored = self
            .blobs
            .send_blob(reader, false, &self.vault_name)?;
        if let Some(existing) = self.resources.iter().find(|r| r.asset == stored.asset) {
            let asset = existing.asset.clone();
            log::debug!("LeaseBuilder::add_resource - duplicate of {asset}, purging");
            self.blobs.purge_blob(&stored)?;
            return Ok(asset);
        }
        let asset = stored.asset.clone();
        self.resources.push(stored);
        Ok(asset)
    }

    /// Attaches an already-stored resource handle
    pub fn import_resource(&mut self, stored: StoredResource) -> &mut Self {
        if !self.resources.iter().any(|r| r.asset == stored.asset) {
            self.resources.push(stored);
        }
        self
    }

    /// Uploads the dataset's meta-resource; returns its asset id
    ///
    /// Binds any pending `%%resource%%` provenance template to the new
    /// asset id. The content type is recorded on the impression when
    /// given.
    pub fn add_meta_resource(
        &mut self,
        reader: &mut dyn Read,
        content_type: Option<String>,
    ) -> Result<String> {
        let asset = self.add_resource(reader)?;
        self.meta_asset = Some(asset.clone());
        self.content_type = content_type;

        if let Some(mut template) = self.provenance.remove(RESOURCE_TEMPLATE_ID) {
            template.id = asset.clone();
            self.provenance.insert(asset.clone(), template);
        }
        Ok(asset)
    }

    /// Writes a provenance entity at `id`
    ///
    /// Without `overwrite`, an existing entity at the same id wins.
    pub fn add_provenance(
        &mut self,
        id: impl Into<String>,
        mut entity: ProvenanceEntity,
        overwrite: bool,
    ) -> &mut Self {
        let id = id.into();
        if overwrite || !self.provenance.contains_key(&id) {
            entity.id = id.clone();
            self.provenance.insert(id, entity);
        }
        self
    }

    /// Derives this lease from a parent dataset
    ///
    /// For revisions, the parent's resources are carried over (minus
    /// `detachments`, and minus its meta-resource when `detach_meta`) and
    /// its provenance entries are inherited for resources this builder
    /// does not respecify. For sharing (see [`LeaseBuilder::for_sharing`])
    /// the parent's impression is reused wholesale and `copy_mode`
    /// decides how the resources travel.
    pub fn with_parent(
        &mut self,
        parent: &DataSet,
        copy_mode: CopyMode,
        detachments: &[String],
        detach_meta: bool,
    ) -> Result<&mut Self> {
        let lease = parent.lease().clone();
        let detached: HashSet<&str> = detachments.iter().map(String::as_str).collect();

        for resource in &lease.resources {
            if detached.contains(resource.asset.as_str()) {
                continue;
            }
            if detach_meta && resource.asset == lease.impression.meta_resource {
                continue;
            }
            match copy_mode {
                CopyMode::None => {}
                CopyMode::Shallow => {
                    self.import_resource(resource.clone());
                }
                CopyMode::Deep => {
                    let mut reader = parent.resource(&resource.asset)?;
                    let copied = self.blobs.send_blob(&mut reader, false, &self.vault_name)?;
                    self.import_resource(copied);
                }
            }
        }

        // Inherit the parent's provenance for anything not respecified
        for entity in &lease.impression.provenance {
            if !self.provenance.contains_key(&entity.id) {
                self.provenance.insert(entity.id.clone(), entity.clone());
            }
        }
        self.parent = Some(ParentContext { lease, copy_mode });
        Ok(self)
    }

    /// Switches the builder into sharing mode towards `recipient`
    ///
    /// The parent's impression is reused; the lease gains a
    /// share-provenance entity signed by this builder's creator.
    pub fn for_sharing(&mut self, recipient: impl Into<String>) -> &mut Self {
        self.sharing_recipient = Some(recipient.into());
        self
    }

    /// Declares head names to point at the lease record on submission
    pub fn set_heads(&mut self, names: &[&str]) -> &mut Self {
        self.head_names = names.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    /// Produces the signed lease
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidLease`] when a fresh lease has no
    /// meta-resource, or a sharing lease no parent.
    pub fn build(&mut self, expires_at: Expiry) -> Result<Lease> {
        if let Some(recipient) = self.sharing_recipient.clone() {
            return self.build_share(recipient, expires_at);
        }

        let meta_asset = self
            .meta_asset
            .clone()
            .ok_or(CoreError::InvalidLease("a lease describes a meta-resource"))?;

        // The creator always appears in the provenance graph
        if !self.provenance.contains_key(self.creator.id()) {
            let mut agent = ProvenanceEntity::new(self.creator.id(), PROV_AGENT_TYPE);
            agent.generated_at_time = Some(Utc::now());
            self.provenance.insert(self.creator.id().to_owned(), agent);
        }

        // Revisions keep the parent's logical asset id; fresh datasets
        // mint one
        let mut impression = match &self.parent {
            Some(parent) => Impression::new("", meta_asset.clone())
                .as_revision_of(&parent.lease.impression),
            None => Impression::new(
                format!("did:asset:{}", random_id(32)),
                meta_asset.clone(),
            ),
        };
        impression.content_type = self.content_type.clone();
        impression.provenance = self.provenance.values().cloned().collect();
        impression.sign(&self.creator)?;

        Ok(Lease {
            id: random_id(32),
            lease_type: LEASE_TYPE.to_owned(),
            expires_at,
            data_set_type: self.data_set_type.clone(),
            resources: self.resources.clone(),
            impression,
            share_provenance: None,
        })
    }

    fn build_share(&mut self, recipient: String, expires_at: Expiry) -> Result<Lease> {
        let parent = self
            .parent
            .as_ref()
            .ok_or(CoreError::InvalidLease("sharing requires a parent lease"))?;

        // Chain from the previous share when the parent was itself shared
        let quoted_from = parent
            .lease
            .share_provenance
            .as_ref()
            .map(|p| p.id.clone())
            .unwrap_or_else(|| parent.lease.impression.id.clone());

        let mut share_provenance = ProvenanceEntity::new("", PROV_ENTITY_TYPE);
        share_provenance.was_quoted_from = Some(quoted_from);
        share_provenance.was_accessible_to = Some(recipient);
        share_provenance.generated_at_time = Some(Utc::now());
        share_provenance.sign(&self.creator)?;

        let resources = match parent.copy_mode {
            CopyMode::None => Vec::new(),
            _ => self.resources.clone(),
        };

        Ok(Lease {
            id: random_id(32),
            lease_type: LEASE_TYPE.to_owned(),
            expires_at,
            data_set_type: parent.lease.data_set_type.clone(),
            resources,
            impression: parent.lease.impression.clone(),
            share_provenance: Some(share_provenance),
        })
    }

    /// Builds the lease and submits it into `locker`
    pub fn submit(
        &mut self,
        expires_at: Expiry,
        data_store: &DataStore,
        locker: &Locker,
    ) -> Result<RecordFuture> {
        let lease = self.build(expires_at)?;
        let options = SubmitOptions {
            cleartext: false,
            head_names: self.head_names.clone(),
        };
        data_store.submit_lease(&lease, locker, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metalocker::storage::MemoryBlobManager;
    use std::io::Cursor;

    fn builder() -> LeaseBuilder {
        LeaseBuilder::new(
            Arc::new(MemoryBlobManager::new()),
            Did::generate(),
            "local",
        )
    }

    #[test]
    fn build_requires_a_meta_resource() {
        let mut builder = builder();
        assert!(builder.build(Expiry::never()).is_err());
    }

    #[test]
    fn resources_are_deduplicated() {
        let mut builder = builder();
        let a = builder
            .add_resource(&mut Cursor::new(b"same".to_vec()))
            .unwrap();
        let b = builder
            .add_resource(&mut Cursor::new(b"same".to_vec()))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(builder.resources.len(), 1);
    }

    #[test]
    fn built_lease_is_signed_and_complete() {
        let mut builder = builder();
        let creator_id = builder.creator.id().to_owned();
        builder.data_set_type("TestDataset");
        builder
            .add_resource(&mut Cursor::new(b"payload".to_vec()))
            .unwrap();
        let meta = builder
            .add_meta_resource(
                &mut Cursor::new(br#"{"type":"TestDataset1"}"#.to_vec()),
                Some("application/json".to_owned()),
            )
            .unwrap();

        let lease = builder.build(Expiry::never()).unwrap();
        assert_eq!(lease.data_set_type, "TestDataset");
        assert_eq!(lease.impression.meta_resource, meta);
        assert!(lease.impression.asset.starts_with("did:asset:"));
        assert!(lease.impression.verify().unwrap());
        assert_eq!(lease.resources.len(), 2);

        // The creator agent was auto-added
        assert!(lease
            .impression
            .provenance
            .iter()
            .any(|p| p.id == creator_id && p.entity_type == PROV_AGENT_TYPE));

        // Provenance is sorted by id for deterministic signing
        let ids: Vec<_> = lease.impression.provenance.iter().map(|p| &p.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn resource_template_binds_to_the_meta_resource() {
        let mut builder = builder();
        let mut entity = ProvenanceEntity::new(RESOURCE_TEMPLATE_ID, PROV_ENTITY_TYPE);
        entity.was_attributed_to = Some("did:metalocker:author".to_owned());
        builder.add_provenance(RESOURCE_TEMPLATE_ID, entity, false);

        let meta = builder
            .add_meta_resource(&mut Cursor::new(b"{}".to_vec()), None)
            .unwrap();
        let lease = builder.build(Expiry::never()).unwrap();

        let bound = lease
            .impression
            .provenance
            .iter()
            .find(|p| p.id == meta)
            .expect("template bound to the meta asset");
        assert_eq!(
            bound.was_attributed_to.as_deref(),
            Some("did:metalocker:author")
        );
        assert!(!lease
            .impression
            .provenance
            .iter()
            .any(|p| p.id == RESOURCE_TEMPLATE_ID));
    }

    #[test]
    fn explicit_provenance_respects_overwrite() {
        let mut builder = builder();
        let mut first = ProvenanceEntity::new("", PROV_ENTITY_TYPE);
        first.was_attributed_to = Some("did:metalocker:first".to_owned());
        let mut second = ProvenanceEntity::new("", PROV_ENTITY_TYPE);
        second.was_attributed_to = Some("did:metalocker:second".to_owned());

        builder.add_provenance("did:asset:x", first, false);
        builder.add_provenance("did:asset:x", second.clone(), false);
        assert_eq!(
            builder.provenance["did:asset:x"].was_attributed_to.as_deref(),
            Some("did:metalocker:first")
        );

        builder.add_provenance("did:asset:x", second, true);
        assert_eq!(
            builder.provenance["did:asset:x"].was_attributed_to.as_deref(),
            Some("did:metalocker:second")
        );
    }
}
