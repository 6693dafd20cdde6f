//! Per-attribute replication metadata.
//!
//! Every object carries a versioned blob recording, for each replicated
//! attribute, where and when its current value originated and the local
//! sequence number of the write that applied it. The blob is the basis for
//! incremental change filtering.

use serde::{Deserialize, Serialize};

use crate::ident::Guid;
use crate::schema::AttrId;

/// The only stored-blob layout version this engine understands.
pub const METADATA_BLOB_VERSION: u32 = 1;

/// Errors raised while decoding a stored metadata blob.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The blob's layout version is not recognized.
    #[error("unrecognized metadata blob version {0}")]
    UnknownVersion(u32),

    /// The blob could not be decoded at all.
    #[error("malformed metadata blob: {0}")]
    Malformed(String),
}

/// Metadata for one attribute of one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMetadata {
    /// The attribute this entry describes.
    pub attr_id: AttrId,
    /// Originating change version, starting at 1.
    pub version: u32,
    /// Originating change time (Unix seconds). Zeroed for redacted secrets.
    pub originating_time: i64,
    /// Invocation id of the DSA where the change originated.
    pub originating_invocation_id: Guid,
    /// Sequence number the change had at the originating DSA.
    pub originating_usn: u64,
    /// Sequence number of the local write that applied the change.
    pub local_usn: u64,
}

/// The decoded per-object metadata vector, sorted by attribute id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataVector {
    /// Blob layout version.
    pub version: u32,
    /// One entry per replicated attribute carried by the object.
    pub entries: Vec<AttributeMetadata>,
}

impl MetadataVector {
    /// An empty current-version vector.
    pub fn new() -> Self {
        Self {
            version: METADATA_BLOB_VERSION,
            entries: Vec::new(),
        }
    }

    /// Find the entry for an attribute.
    pub fn get(&self, attr_id: AttrId) -> Option<&AttributeMetadata> {
        self.entries.iter().find(|e| e.attr_id == attr_id)
    }

    /// Insert or replace the entry for an attribute, keeping id order.
    pub fn upsert(&mut self, meta: AttributeMetadata) {
        match self.entries.iter_mut().find(|e| e.attr_id == meta.attr_id) {
            Some(slot) => *slot = meta,
            None => {
                self.entries.push(meta);
                self.entries.sort_by_key(|e| e.attr_id);
            }
        }
    }

    /// Serialize to the stored blob form.
    pub fn to_blob(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Decode a stored blob, rejecting unknown layout versions.
    pub fn from_blob(data: &[u8]) -> Result<Self, MetadataError> {
        let decoded: MetadataVector =
            bincode::deserialize(data).map_err(|e| MetadataError::Malformed(e.to_string()))?;
        if decoded.version != METADATA_BLOB_VERSION {
            return Err(MetadataError::UnknownVersion(decoded.version));
        }
        Ok(decoded)
    }
}

/// Paired scratch/committed watermark for a change enumeration.
///
/// The scratch value accumulates the highest sequence number seen while a
/// page is built; the committed value only advances when a drain completes,
/// and never decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWatermark {
    /// Running accumulator for the in-flight enumeration.
    pub scratch: u64,
    /// Last fully-drained position.
    pub committed: u64,
}

impl HighWatermark {
    /// Start an enumeration from a committed position.
    pub fn starting_at(committed: u64) -> Self {
        Self {
            scratch: committed,
            committed,
        }
    }

    /// Fold one object's sequence number into the scratch accumulator.
    pub fn observe(&mut self, usn: u64) {
        if usn > self.scratch {
            self.scratch = usn;
        }
    }

    /// Promote the scratch value at the end of a full drain.
    pub fn commit(&mut self) {
        if self.scratch > self.committed {
            self.committed = self.scratch;
        }
    }
}
