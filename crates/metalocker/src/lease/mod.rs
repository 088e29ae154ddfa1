pub mod signing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::did::Did;
use crate::errors::{Error, Result};
use crate::expiry::Expiry;

pub use signing::MerkleSignature;

/// The JSON-LD type of a lease
pub const LEASE_TYPE: &str = "Lease";
/// The JSON-LD type of an impression
pub const IMPRESSION_TYPE: &str = "Impression";
/// Provenance entity type
pub const PROV_ENTITY_TYPE: &str = "Entity";
/// Provenance agent type
pub const PROV_AGENT_TYPE: &str = "Agent";

/// A pointer to an opaque blob held by a vault
///
/// The resource is identified by the content fingerprint of the blob (its
/// asset id); `method`, `id` and `params` tell the vault how to locate and
/// open it, and `mac` authenticates the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResource {
    pub asset: String,
    pub vault: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// One node of a dataset's provenance graph
///
/// Common PROV-O properties are first-class fields; anything else the
/// application supplies travels in the flattened remainder. Entities that
/// assert authorship are merkle-signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntity {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(rename = "wasQuotedFrom", default, skip_serializing_if = "Option::is_none")]
    pub was_quoted_from: Option<String>,
    #[serde(
        rename = "wasAccessibleTo",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub was_accessible_to: Option<String>,
    #[serde(
        rename = "wasAttributedTo",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub was_attributed_to: Option<String>,
    #[serde(
        rename = "generatedAtTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub generated_at_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<MerkleSignature>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProvenanceEntity {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            was_quoted_from: None,
            was_accessible_to: None,
            was_attributed_to: None,
            generated_at_time: None,
            signature: None,
            extra: Map::new(),
        }
    }

    /// Merkle-signs the entity in place; its id becomes content-addressable
    pub fn sign(&mut self, creator: &Did) -> Result<()> {
        let mut value = serde_json::to_value(&*self)?;
        signing::sign_entity(&mut value, creator)?;
        *self = serde_json::from_value(value)?;
        Ok(())
    }

    /// Verifies the entity's merkle signature
    pub fn verify(&self) -> Result<bool> {
        signing::verify_entity(&serde_json::to_value(self)?)
    }
}

/// The signed, content-addressable summary of a dataset revision
///
/// The impression binds the dataset's logical asset id, its meta-resource
/// content fingerprint, the revision chain and the provenance graph into
/// one merkle-signed entity. Its id is set by the signing step and is
/// invariant thereafter. The logical asset id is stable across revisions;
/// the meta-resource fingerprint changes with the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Impression {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub impression_type: String,
    pub asset: String,
    #[serde(rename = "metaResource")]
    pub meta_resource: String,
    #[serde(
        rename = "wasRevisionOf",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub was_revision_of: Option<String>,
    #[serde(rename = "revisionNumber", default)]
    pub revision_number: u64,
    #[serde(rename = "generatedAtTime")]
    pub generated_at_time: DateTime<Utc>,
    #[serde(rename = "contentType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provenance: Vec<ProvenanceEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<MerkleSignature>,
}

impl Impression {
    /// Starts an unsigned impression of a logical asset and its
    /// meta-resource content
    pub fn new(asset: impl Into<String>, meta_resource: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            impression_type: IMPRESSION_TYPE.to_owned(),
            asset: asset.into(),
            meta_resource: meta_resource.into(),
            was_revision_of: None,
            revision_number: 1,
            generated_at_time: Utc::now(),
            content_type: None,
            provenance: Vec::new(),
            signature: None,
        }
    }

    /// Chains this impression as a revision of `previous`
    ///
    /// The logical asset id is carried over; only the content changes.
    pub fn as_revision_of(mut self, previous: &Impression) -> Self {
        self.asset = previous.asset.clone();
        self.was_revision_of = Some(previous.id.clone());
        self.revision_number = previous.revision_number + 1;
        self
    }

    /// Merkle-signs the impression; sorts provenance for determinism first
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForbiddenOperation`] if the creator DID is
    /// neutered.
    pub fn sign(&mut self, creator: &Did) -> Result<()> {
        self.provenance.sort_by(|a, b| a.id.cmp(&b.id));
        let mut value = serde_json::to_value(&*self)?;
        signing::sign_entity(&mut value, creator)?;
        *self = serde_json::from_value(value)?;
        Ok(())
    }

    /// Verifies the impression's merkle signature and id
    pub fn verify(&self) -> Result<bool> {
        signing::verify_entity(&serde_json::to_value(self)?)
    }
}

/// A signed descriptor of a dataset: the unit a locker distributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    #[serde(rename = "type")]
    pub lease_type: String,
    #[serde(rename = "expiresAt", default, skip_serializing_if = "Expiry::is_never")]
    pub expires_at: Expiry,
    #[serde(rename = "dataSetType")]
    pub data_set_type: String,
    pub resources: Vec<StoredResource>,
    pub impression: Impression,
    #[serde(
        rename = "shareProvenance",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub share_provenance: Option<ProvenanceEntity>,
}

impl Lease {
    /// The stored resource backing the impression's meta-resource
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataAssetNotFound`] when the meta-resource asset is
    /// not among the lease's resources.
    pub fn meta_resource(&self) -> Result<&StoredResource> {
        self.resource(&self.impression.meta_resource)
    }

    /// Looks up a stored resource by asset id
    pub fn resource(&self, asset_id: &str) -> Result<&StoredResource> {
        self.resources
            .iter()
            .find(|r| r.asset == asset_id)
            .ok_or(Error::DataAssetNotFound)
    }

    /// All distinct asset ids referenced by the lease, in resource order
    pub fn data_asset_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.resources
            .iter()
            .filter(|r| seen.insert(r.asset.as_str()))
            .map(|r| r.asset.clone())
            .collect()
    }

    /// True once the lease has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(asset: &str) -> StoredResource {
        StoredResource {
            asset: asset.to_owned(),
            vault: "local".to_owned(),
            method: "memory".to_owned(),
            id: None,
            params: None,
            mac: None,
        }
    }

    fn test_lease() -> Lease {
        let mut impression = Impression::new("did:asset:logical", "did:asset:meta");
        impression.sign(&Did::generate()).unwrap();
        Lease {
            id: "lease-1".to_owned(),
            lease_type: LEASE_TYPE.to_owned(),
            expires_at: Expiry::never(),
            data_set_type: "Dataset".to_owned(),
            resources: vec![stored("did:asset:meta"), stored("did:asset:blob")],
            impression,
            share_provenance: None,
        }
    }

    #[test]
    fn impression_signing_is_content_addressable() {
        let creator = Did::generate();
        let mut impression = Impression::new("did:asset:logical", "did:asset:meta");
        impression.provenance.push(ProvenanceEntity::new(
            "did:asset:meta",
            PROV_ENTITY_TYPE,
        ));
        impression.sign(&creator).unwrap();

        assert!(impression.id.starts_with("did:stamp:"));
        assert!(impression.verify().unwrap());

        // The neutered creator key embedded in the signature is enough
        let signature = impression.signature.as_ref().unwrap();
        assert_eq!(signature.creator, creator.id());

        // Mutating any field invalidates the signature
        let mut tampered = impression.clone();
        tampered.revision_number = 9;
        assert!(!tampered.verify().unwrap());
    }

    #[test]
    fn provenance_is_sorted_before_signing() {
        let creator = Did::generate();
        let make = |order: &[&str]| {
            let mut impression = Impression::new("did:asset:logical", "did:asset:meta");
            // Pin the timestamp so both impressions hash the same
            impression.generated_at_time = "2022-12-26T11:30:15Z".parse().unwrap();
            for id in order {
                impression
                    .provenance
                    .push(ProvenanceEntity::new(*id, PROV_ENTITY_TYPE));
            }
            impression.sign(&creator).unwrap();
            impression
        };
        let a = make(&["did:x:1", "did:x:2"]);
        let b = make(&["did:x:2", "did:x:1"]);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn revision_chain_links_ids() {
        let creator = Did::generate();
        let mut first = Impression::new("did:asset:logical", "did:asset:v1");
        first.sign(&creator).unwrap();
        let mut second =
            Impression::new("did:asset:other", "did:asset:v2").as_revision_of(&first);
        second.sign(&creator).unwrap();

        assert_eq!(second.was_revision_of.as_deref(), Some(first.id.as_str()));
        assert_eq!(second.revision_number, 2);
        assert_ne!(second.id, first.id);
        // The logical asset follows the chain
        assert_eq!(second.asset, first.asset);
        assert_ne!(second.meta_resource, first.meta_resource);
    }

    #[test]
    fn signed_provenance_entity_roundtrip() {
        let sender = Did::generate();
        let mut entity = ProvenanceEntity::new("", PROV_ENTITY_TYPE);
        entity.was_quoted_from = Some("did:stamp:source".to_owned());
        entity.was_accessible_to = Some("did:metalocker:recipient".to_owned());
        entity.sign(&sender).unwrap();

        assert!(entity.id.starts_with("did:stamp:"));
        assert!(entity.verify().unwrap());

        let json = serde_json::to_string(&entity).unwrap();
        let restored: ProvenanceEntity = serde_json::from_str(&json).unwrap();
        assert!(restored.verify().unwrap());
        assert_eq!(restored, entity);
    }

    #[test]
    fn lease_resource_lookups() {
        let lease = test_lease();
        assert_eq!(lease.meta_resource().unwrap().asset, "did:asset:meta");
        assert_eq!(lease.resource("did:asset:blob").unwrap().asset, "did:asset:blob");
        assert!(matches!(
            lease.resource("did:asset:unknown"),
            Err(Error::DataAssetNotFound)
        ));
        assert_eq!(
            lease.data_asset_ids(),
            vec!["did:asset:meta".to_owned(), "did:asset:blob".to_owned()]
        );
    }

    #[test]
    fn lease_wire_shape() {
        let lease = test_lease();
        let wire = serde_json::to_value(&lease).unwrap();
        assert_eq!(wire["type"], "Lease");
        assert!(wire.get("dataSetType").is_some());
        // A never-expiry is omitted from the wire
        assert!(wire.get("expiresAt").is_none());
        let restored: Lease = serde_json::from_value(wire).unwrap();
        assert_eq!(restored, lease);
    }
}
