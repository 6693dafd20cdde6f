//! Bind handle table and per-session state.
//!
//! Live binds are kept in a table keyed by an opaque handle id. The table
//! owns each `BindState`; entries leave the table only through an explicit
//! unbind or a connection-teardown sweep. A bind's change cursor is not
//! designed for concurrent advancement, so each entry carries an in-flight
//! guard and a second call on the same handle is rejected, never interleaved.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use drepl_core::metadata::HighWatermark;
use drepl_core::{
    Dn, DirectoryObject, Guid, ObjectIdentifier, ReplError, ReplResult, SecurityToken, Sid,
};

/// Elevated directory session attached to a DC-privileged bind.
///
/// Set once at bind time and never mutated afterwards; used for privileged
/// writes such as secret SPN updates and retired-server pruning.
#[derive(Debug, Clone)]
pub struct ElevatedSession {
    /// The system-level token the session acts under.
    pub token: SecurityToken,
}

/// Immutable per-bind session state.
#[derive(Debug, Clone)]
pub struct BindState {
    /// Opaque handle id.
    pub handle: Guid,
    /// Server bind GUID for this session.
    pub local_bind_guid: Guid,
    /// Caller bind GUID.
    pub remote_bind_guid: Guid,
    /// Fixed local capability bitmask.
    pub local_caps: u32,
    /// Caller-asserted capability bitmask.
    pub remote_caps: u32,
    /// Caller-asserted site GUID.
    pub remote_site_guid: Guid,
    /// Caller-asserted process id.
    pub pid: u32,
    /// GUID of this server's site object.
    pub site_guid: Guid,
    /// This server's replication epoch.
    pub repl_epoch: u32,
    /// SID of the token that created the bind; all calls must match.
    pub owner_sid: Sid,
    /// Per-connection symmetric key for sealing sensitive values.
    pub session_key: Vec<u8>,
    /// Elevated session, present only for DC-privileged binds.
    pub elevated: Option<ElevatedSession>,
}

/// Frozen enumeration state for one NC. At most one per bind.
#[derive(Debug, Clone)]
pub struct ChangeCursor {
    /// Root of the NC being drained.
    pub nc: Dn,
    /// Identifier of the NC root object.
    pub nc_root: ObjectIdentifier,
    /// Point-in-time candidate set in deterministic DN order. Writes after
    /// the snapshot was taken stay invisible until a new snapshot begins.
    pub snapshot: Vec<DirectoryObject>,
    /// Read offset into the snapshot.
    pub offset: usize,
    /// Partner watermark the snapshot was cut against.
    pub low_watermark: u64,
    /// Running/committed watermark pair for this drain.
    pub watermark: HighWatermark,
}

/// One live bind: immutable state plus the cursor slot and in-flight guard.
pub struct BindEntry {
    /// Immutable session state.
    pub state: BindState,
    /// The at-most-one change cursor.
    pub cursor: Mutex<Option<ChangeCursor>>,
    /// Guards against interleaved calls on the same handle.
    in_flight: Arc<Mutex<()>>,
}

impl BindEntry {
    fn new(state: BindState) -> Self {
        Self {
            state,
            cursor: Mutex::new(None),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// Claim the handle for one call. A second call while one is running is
    /// rejected rather than queued.
    pub fn begin_call(&self) -> ReplResult<OwnedMutexGuard<()>> {
        Arc::clone(&self.in_flight).try_lock_owned().map_err(|_| {
            ReplError::Conflict("another call is already in flight on this handle".into())
        })
    }
}

/// Table of live binds, keyed by opaque handle id.
#[derive(Default)]
pub struct HandleTable {
    binds: RwLock<HashMap<Guid, Arc<BindEntry>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-constructed bind. No partially-initialised state ever
    /// enters the table.
    pub async fn insert(&self, state: BindState) -> Arc<BindEntry> {
        let handle = state.handle;
        let entry = Arc::new(BindEntry::new(state));
        self.binds.write().await.insert(handle, Arc::clone(&entry));
        entry
    }

    /// Resolve a handle for a caller, enforcing token ownership.
    pub async fn get(&self, handle: Guid, token: &SecurityToken) -> ReplResult<Arc<BindEntry>> {
        let binds = self.binds.read().await;
        let entry = binds
            .get(&handle)
            .ok_or_else(|| ReplError::Parameter(format!("unknown bind handle {}", handle)))?;
        if entry.state.owner_sid != token.user_sid {
            return Err(ReplError::Parameter(format!(
                "bind handle {} is not owned by the calling token",
                handle
            )));
        }
        Ok(Arc::clone(entry))
    }

    /// Remove a handle, enforcing token ownership.
    pub async fn remove(&self, handle: Guid, token: &SecurityToken) -> ReplResult<()> {
        let mut binds = self.binds.write().await;
        match binds.get(&handle) {
            Some(entry) if entry.state.owner_sid == token.user_sid => {
                binds.remove(&handle);
                Ok(())
            }
            Some(_) => Err(ReplError::Parameter(format!(
                "bind handle {} is not owned by the calling token",
                handle
            ))),
            None => Err(ReplError::Parameter(format!(
                "unknown bind handle {}",
                handle
            ))),
        }
    }

    /// Drop every bind owned by a departing connection's token.
    pub async fn remove_all_for(&self, owner: &Sid) -> usize {
        let mut binds = self.binds.write().await;
        let before = binds.len();
        binds.retain(|_, entry| entry.state.owner_sid != *owner);
        before - binds.len()
    }

    /// Number of live binds.
    pub async fn len(&self) -> usize {
        self.binds.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.binds.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drepl_core::SecurityLevel;

    fn token(sid: &str) -> SecurityToken {
        SecurityToken {
            account: "t".into(),
            user_sid: Sid::new(sid),
            group_sids: vec![],
            level: SecurityLevel::DomainController,
        }
    }

    fn state(owner: &str) -> BindState {
        BindState {
            handle: Guid::generate(),
            local_bind_guid: Guid::generate(),
            remote_bind_guid: Guid::generate(),
            local_caps: 0x3f,
            remote_caps: 0x1,
            remote_site_guid: Guid::nil(),
            pid: 42,
            site_guid: Guid::generate(),
            repl_epoch: 0,
            owner_sid: Sid::new(owner),
            session_key: vec![1, 2, 3],
            elevated: None,
        }
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let table = HandleTable::new();
        let owner = token("S-1-5-21-1-2-3-1000");
        let entry = table.insert(state("S-1-5-21-1-2-3-1000")).await;
        let handle = entry.state.handle;

        assert!(table.get(handle, &owner).await.is_ok());
        table.remove(handle, &owner).await.unwrap();
        assert!(table.get(handle, &owner).await.is_err());
    }

    #[tokio::test]
    async fn test_owner_enforced() {
        let table = HandleTable::new();
        let entry = table.insert(state("S-1-5-21-1-2-3-1000")).await;
        let stranger = token("S-1-5-21-9-9-9-1111");

        assert!(matches!(
            table.get(entry.state.handle, &stranger).await,
            Err(ReplError::Parameter(_))
        ));
        assert!(matches!(
            table.remove(entry.state.handle, &stranger).await,
            Err(ReplError::Parameter(_))
        ));
        // The bind survives the stranger's attempts.
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let table = HandleTable::new();
        let owner = token("S-1-5-21-1-2-3-1000");
        assert!(matches!(
            table.remove(Guid::generate(), &owner).await,
            Err(ReplError::Parameter(_))
        ));
    }

    #[tokio::test]
    async fn test_in_flight_guard_rejects_second_call() {
        let table = HandleTable::new();
        let entry = table.insert(state("S-1-5-21-1-2-3-1000")).await;

        let first = entry.begin_call().unwrap();
        assert!(matches!(
            entry.begin_call(),
            Err(ReplError::Conflict(_))
        ));
        drop(first);
        assert!(entry.begin_call().is_ok());
    }

    #[tokio::test]
    async fn test_teardown_sweep() {
        let table = HandleTable::new();
        table.insert(state("S-1-5-21-1-2-3-1000")).await;
        table.insert(state("S-1-5-21-1-2-3-1000")).await;
        table.insert(state("S-1-5-21-9-9-9-1111")).await;

        let dropped = table.remove_all_for(&Sid::new("S-1-5-21-1-2-3-1000")).await;
        assert_eq!(dropped, 2);
        assert_eq!(table.len().await, 1);
    }
}
