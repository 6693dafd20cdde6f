//! Directory store collaborator interface.
//!
//! The replication engine reads and writes a hierarchical, DN-addressed
//! attribute store through this trait: scoped search with show-deleted and
//! extended-identifier controls, short-lived single-writer transactions, and
//! a monotonic global sequence counter. The store's own query engine is not
//! part of this crate; the filter surface below is exactly what the engine
//! needs and nothing more.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::ident::{Dn, Guid, ObjectIdentifier, Sid};
use crate::metadata::MetadataVector;
use crate::schema::{attrs, AttrId};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by the directory store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("lookup was ambiguous: {0}")]
    Ambiguous(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("transaction already closed")]
    TransactionClosed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Tree-position flag: the object heads a naming context.
pub const INSTANCE_TYPE_NC_HEAD: u32 = 0x1;
/// Tree-position flag: the replica of this object is writeable here.
pub const INSTANCE_TYPE_WRITEABLE: u32 = 0x4;

/// Named extended rights checked against object ACLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ControlRight {
    /// Manage replication partner references on an NC root.
    ManageTopology,
    /// Read replicated changes from an NC.
    ReplicateChanges,
    /// Read replicated changes including secret attributes.
    ReplicateSecrets,
}

impl std::fmt::Display for ControlRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlRight::ManageTopology => "Manage-Replication-Topology",
            ControlRight::ReplicateChanges => "Replicate-Changes",
            ControlRight::ReplicateSecrets => "Replicate-Changes-All",
        };
        write!(f, "{}", s)
    }
}

/// One access-control entry on a directory object.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AclEntry {
    /// The SID granted the right.
    pub sid: Sid,
    /// The granted right.
    pub right: ControlRight,
}

/// Search scope relative to the base DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The base object only.
    Base,
    /// Immediate children of the base.
    OneLevel,
    /// The base and everything beneath it.
    Subtree,
}

/// Result-shaping controls for a search.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchControls {
    /// Return SIDs inside object identifiers.
    pub extended_dn: bool,
    /// Include tombstoned objects.
    pub show_deleted: bool,
    /// Include recycled objects (implies tombstones remain visible).
    pub show_recycled: bool,
}

/// Value filter for a search. Fields combine conjunctively.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Only objects whose change sequence number is strictly greater.
    pub usn_above: Option<u64>,
    /// Only objects marked critical for a functional replica.
    pub critical_only: bool,
    /// Only the object with this GUID.
    pub object_guid: Option<Guid>,
}

/// A scoped directory search.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Base DN of the search.
    pub base: Dn,
    /// Scope relative to the base.
    pub scope: Scope,
    /// Value filter.
    pub filter: SearchFilter,
    /// Result-shaping controls.
    pub controls: SearchControls,
    /// Deterministic DN ordering of the result set.
    pub sort_by_dn: bool,
}

impl SearchRequest {
    /// A base-scope lookup of a single DN with default controls.
    pub fn base_object(dn: Dn) -> Self {
        Self {
            base: dn,
            scope: Scope::Base,
            filter: SearchFilter::default(),
            controls: SearchControls {
                extended_dn: true,
                ..Default::default()
            },
            sort_by_dn: false,
        }
    }
}

/// A materialized directory object as returned by search.
#[derive(Debug, Clone)]
pub struct DirectoryObject {
    /// Identifier; the SID is present only under extended-DN control.
    pub id: ObjectIdentifier,
    /// GUID of the immediate parent; absent only for a tree root.
    pub parent_guid: Option<Guid>,
    /// Tree-position flags.
    pub instance_type: u32,
    /// Sequence number of the last write touching this object.
    pub usn_changed: u64,
    /// Tombstone marker.
    pub is_deleted: bool,
    /// Attribute values keyed by attribute id.
    pub attributes: BTreeMap<AttrId, Vec<Vec<u8>>>,
    /// Access-control entries for extended-right checks.
    pub acl: Vec<AclEntry>,
}

impl DirectoryObject {
    /// All values of an attribute.
    pub fn attr(&self, id: AttrId) -> Option<&Vec<Vec<u8>>> {
        self.attributes.get(&id)
    }

    /// First value of an attribute.
    pub fn attr_first(&self, id: AttrId) -> Option<&[u8]> {
        self.attributes
            .get(&id)
            .and_then(|v| v.first())
            .map(|v| v.as_slice())
    }

    /// First value of an attribute, interpreted as UTF-8.
    pub fn attr_str(&self, id: AttrId) -> Option<String> {
        self.attr_first(id)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Whether the object is marked critical for a functional replica.
    pub fn is_critical(&self) -> bool {
        self.attr_first(attrs::IS_CRITICAL_SYSTEM_OBJECT) == Some(b"TRUE".as_slice())
    }

    /// Whether the object heads a naming context.
    pub fn is_nc_head(&self) -> bool {
        self.instance_type & INSTANCE_TYPE_NC_HEAD != 0
    }

    /// Decode the stored per-attribute replication metadata blob.
    pub fn metadata(&self) -> Result<MetadataVector, crate::metadata::MetadataError> {
        match self.attr_first(attrs::REPL_METADATA) {
            Some(blob) => MetadataVector::from_blob(blob),
            None => Ok(MetadataVector::new()),
        }
    }
}

/// The directory store seen by the replication engine.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Execute a scoped search.
    async fn search(&self, req: &SearchRequest) -> StoreResult<Vec<DirectoryObject>>;

    /// Open a single-writer transaction. Transactions are short-lived,
    /// all-or-nothing and never nested.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    /// Current value of the global monotonic sequence counter.
    async fn highest_usn(&self) -> StoreResult<u64>;

    /// Invocation id of this DSA's store instance.
    fn invocation_id(&self) -> Guid;

    /// Fetch exactly one object by DN.
    async fn object_by_dn(&self, dn: &Dn) -> StoreResult<DirectoryObject> {
        let mut req = SearchRequest::base_object(dn.clone());
        req.controls.show_deleted = true;
        let mut found = self.search(&req).await?;
        match found.len() {
            0 => Err(StoreError::NotFound(dn.to_string())),
            1 => Ok(found.remove(0)),
            _ => Err(StoreError::Ambiguous(dn.to_string())),
        }
    }

    /// Fetch exactly one object by GUID, searching from the given root.
    async fn object_by_guid(&self, root: &Dn, guid: Guid) -> StoreResult<DirectoryObject> {
        let req = SearchRequest {
            base: root.clone(),
            scope: Scope::Subtree,
            filter: SearchFilter {
                object_guid: Some(guid),
                ..Default::default()
            },
            controls: SearchControls {
                extended_dn: true,
                show_deleted: true,
                show_recycled: true,
            },
            sort_by_dn: false,
        };
        let mut found = self.search(&req).await?;
        match found.len() {
            0 => Err(StoreError::NotFound(guid.to_string())),
            1 => Ok(found.remove(0)),
            _ => Err(StoreError::Ambiguous(guid.to_string())),
        }
    }
}

/// A single-writer store transaction.
///
/// Mutations are staged and become visible atomically at `commit`; dropping
/// or cancelling a transaction discards them all.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read an object in its committed (pre-transaction) state.
    fn object(&self, dn: &Dn) -> StoreResult<DirectoryObject>;

    /// Stage a full replacement of one attribute's value list.
    fn replace_attr(&mut self, dn: &Dn, attr: AttrId, values: Vec<Vec<u8>>) -> StoreResult<()>;

    /// Stage a tombstone deletion of an object.
    fn delete_object(&mut self, dn: &Dn) -> StoreResult<()>;

    /// Apply all staged mutations atomically.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discard all staged mutations.
    fn cancel(self: Box<Self>);
}
