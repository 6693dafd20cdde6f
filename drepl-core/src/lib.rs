//! Drepl Core Library
//!
//! Core functionality for Drepl including:
//! - Object identifiers (DN, GUID, SID)
//! - Attribute schema and the closed secret set
//! - Per-attribute replication metadata and high-watermarks
//! - Directory store abstraction and in-memory implementation
//! - Up-to-date vector management
//! - Security gate (token level and object ACL authorization)
//! - Attribute codec (redaction, session-key sealing)

pub mod codec;
pub mod error;
pub mod ident;
pub mod memory;
pub mod metadata;
pub mod schema;
pub mod security;
pub mod store;
pub mod udv;

pub use codec::{AttributeCodec, WireAttribute};
pub use error::{ReplError, ReplResult, WireStatus};
pub use ident::{Dn, Guid, ObjectIdentifier, Sid};
pub use memory::{ForestConfig, ForestInfo, MemoryDirectory, NewObject};
pub use metadata::{AttributeMetadata, HighWatermark, MetadataVector, METADATA_BLOB_VERSION};
pub use schema::{attrs, AttrId, AttributeSchema};
pub use security::{GateConfig, SecurityGate, SecurityLevel, SecurityToken};
pub use store::{
    AclEntry, ControlRight, DirectoryObject, DirectoryStore, Scope, SearchControls, SearchFilter,
    SearchRequest, StoreError, StoreResult, StoreTransaction, INSTANCE_TYPE_NC_HEAD,
    INSTANCE_TYPE_WRITEABLE,
};
pub use udv::{UdvCursor, UpToDateVector, UpToDateVectorManager, UDV_VERSION};
