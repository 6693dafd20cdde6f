//! Up-to-date vector management.
//!
//! Each NC root carries a persisted vector of cursors, one per source DSA,
//! recording the highest originating sequence number already incorporated
//! from that DSA. The vector shipped at the end of a drain additionally
//! carries this server's own position, so partners can suppress redundant
//! re-propagation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ReplError, ReplResult};
use crate::ident::{Dn, Guid};
use crate::schema::attrs;
use crate::store::DirectoryStore;

/// Vector layout version written and understood by this engine.
pub const UDV_VERSION: u32 = 2;

/// One per-source-DSA cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdvCursor {
    /// Invocation id of the source DSA.
    pub invocation_id: Guid,
    /// Highest originating sequence number incorporated from that DSA.
    pub highest_usn: u64,
    /// Time of the last successful sync (Unix seconds).
    pub last_sync: i64,
}

/// A wire-sorted set of cursors, unique by invocation id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpToDateVector {
    /// Layout version.
    pub version: u32,
    /// Cursors sorted by invocation id.
    pub cursors: Vec<UdvCursor>,
}

impl UpToDateVector {
    /// An empty current-version vector.
    pub fn new() -> Self {
        Self {
            version: UDV_VERSION,
            cursors: Vec::new(),
        }
    }

    /// The cursor for a given source DSA, if present.
    pub fn get(&self, invocation_id: Guid) -> Option<&UdvCursor> {
        self.cursors
            .iter()
            .find(|c| c.invocation_id == invocation_id)
    }

    /// Insert or replace the cursor for its source DSA, keeping the set
    /// unique and sorted by invocation id.
    pub fn merge(&mut self, cursor: UdvCursor) {
        match self
            .cursors
            .iter_mut()
            .find(|c| c.invocation_id == cursor.invocation_id)
        {
            Some(slot) => *slot = cursor,
            None => {
                self.cursors.push(cursor);
            }
        }
        self.cursors.sort_by_key(|c| c.invocation_id);
    }

    /// Serialize to the persisted blob form.
    pub fn to_blob(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Decode a persisted blob.
    ///
    /// Undecodable bytes are treated as recoverable (the vector restarts
    /// empty, which only costs redundant transfer); a decoded vector with a
    /// layout version newer than this engine understands is not.
    pub fn from_blob(data: &[u8]) -> ReplResult<Self> {
        match bincode::deserialize::<UpToDateVector>(data) {
            Ok(v) if v.version <= UDV_VERSION => Ok(v),
            Ok(v) => Err(ReplError::Internal(format!(
                "up-to-date vector has unsupported version {}",
                v.version
            ))),
            Err(e) => {
                warn!("discarding undecodable up-to-date vector: {}", e);
                Ok(Self::new())
            }
        }
    }
}

/// Loads and assembles up-to-date vectors for NC roots.
pub struct UpToDateVectorManager;

impl UpToDateVectorManager {
    /// Read the persisted vector for an NC, defaulting to an empty
    /// current-version vector when absent.
    pub async fn load(store: &dyn DirectoryStore, nc: &Dn) -> ReplResult<UpToDateVector> {
        let root = store
            .object_by_dn(nc)
            .await
            .map_err(|e| ReplError::Internal(format!("loading vector for {}: {}", nc, e)))?;
        match root.attr_first(attrs::UP_TO_DATE_VECTOR) {
            Some(blob) => UpToDateVector::from_blob(blob),
            None => Ok(UpToDateVector::new()),
        }
    }

    /// The persisted vector plus this server's own current position,
    /// replacing any stale self-entry, sorted for deterministic output.
    pub async fn current(store: &dyn DirectoryStore, nc: &Dn) -> ReplResult<UpToDateVector> {
        let mut vector = Self::load(store, nc).await?;
        let own_usn = store
            .highest_usn()
            .await
            .map_err(|e| ReplError::Internal(format!("reading sequence counter: {}", e)))?;
        vector.merge(UdvCursor {
            invocation_id: store.invocation_id(),
            highest_usn: own_usn,
            last_sync: Utc::now().timestamp(),
        });
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ForestConfig, MemoryDirectory};
    use crate::schema::attrs;
    use crate::store::StoreTransaction;

    #[test]
    fn test_merge_replaces_and_sorts() {
        let a = Guid::generate();
        let b = Guid::generate();
        let mut v = UpToDateVector::new();
        v.merge(UdvCursor {
            invocation_id: b,
            highest_usn: 10,
            last_sync: 1,
        });
        v.merge(UdvCursor {
            invocation_id: a,
            highest_usn: 5,
            last_sync: 1,
        });
        v.merge(UdvCursor {
            invocation_id: b,
            highest_usn: 20,
            last_sync: 2,
        });

        assert_eq!(v.cursors.len(), 2);
        assert!(v.cursors[0].invocation_id < v.cursors[1].invocation_id);
        assert_eq!(v.get(b).unwrap().highest_usn, 20);
    }

    #[test]
    fn test_blob_roundtrip_and_garbage() {
        let mut v = UpToDateVector::new();
        v.merge(UdvCursor {
            invocation_id: Guid::generate(),
            highest_usn: 42,
            last_sync: 7,
        });
        let decoded = UpToDateVector::from_blob(&v.to_blob()).unwrap();
        assert_eq!(decoded, v);

        // Garbage decodes to an empty vector rather than failing the call.
        let recovered = UpToDateVector::from_blob(&[0xde, 0xad]).unwrap();
        assert!(recovered.cursors.is_empty());
    }

    #[test]
    fn test_future_version_rejected() {
        let mut v = UpToDateVector::new();
        v.version = UDV_VERSION + 1;
        assert!(UpToDateVector::from_blob(&v.to_blob()).is_err());
    }

    #[tokio::test]
    async fn test_current_includes_self_entry() {
        let store = MemoryDirectory::new(Guid::generate());
        let info = store
            .bootstrap_forest(&ForestConfig::default())
            .await
            .unwrap();

        // Persist a foreign cursor on the NC root.
        let foreign = Guid::generate();
        let mut persisted = UpToDateVector::new();
        persisted.merge(UdvCursor {
            invocation_id: foreign,
            highest_usn: 99,
            last_sync: 1,
        });
        let mut txn = store.begin().await.unwrap();
        txn.replace_attr(
            &info.nc_root,
            attrs::UP_TO_DATE_VECTOR,
            vec![persisted.to_blob()],
        )
        .unwrap();
        txn.commit().await.unwrap();

        let current = UpToDateVectorManager::current(&store, &info.nc_root)
            .await
            .unwrap();
        assert_eq!(current.cursors.len(), 2);
        assert_eq!(current.get(foreign).unwrap().highest_usn, 99);

        let own = current.get(store.invocation_id()).unwrap();
        assert_eq!(own.highest_usn, store.highest_usn().await.unwrap());
    }
}
