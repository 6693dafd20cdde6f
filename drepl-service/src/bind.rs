//! Session bind and unbind.
//!
//! A bind resolves the server's site and replication-epoch objects, decides
//! whether the caller earns an elevated session, fixes the local capability
//! bitmask and derives the per-session sealing key. Failure at any step is
//! fatal to the call; no partial bind state ever becomes visible.

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use drepl_core::{attrs, DirectoryStore, Guid, ReplError, ReplResult, SecurityLevel, SecurityToken};

use crate::handle::{BindState, ElevatedSession};
use crate::messages::{caps, BindRequest, BindResponse, UnbindRequest};
use crate::ReplicationService;

/// Create a session and return its opaque handle.
pub(crate) async fn bind(
    svc: &ReplicationService,
    token: &SecurityToken,
    req: BindRequest,
) -> ReplResult<BindResponse> {
    // Both required objects must resolve to exactly one match.
    let site = svc
        .store
        .object_by_dn(&svc.config.site_dn())
        .await
        .map_err(|e| ReplError::Internal(format!("resolving site object: {}", e)))?;
    let settings = svc
        .store
        .object_by_dn(&svc.config.settings_dn())
        .await
        .map_err(|e| ReplError::Internal(format!("resolving settings object: {}", e)))?;

    let repl_epoch = settings
        .attr_str(attrs::REPLICATION_EPOCH)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    // DC-privileged callers get an elevated session for later privileged
    // writes. Stored once, reused, never mutated.
    let elevated = if token.level >= SecurityLevel::DomainController {
        debug!("granting elevated session to {}", token.account);
        Some(ElevatedSession {
            token: SecurityToken::system(),
        })
    } else {
        None
    };

    let handle = Guid::generate();
    let local_bind_guid = Guid::generate();
    let session_key = derive_session_key(
        svc.config.session_secret.as_bytes(),
        req.bind_guid,
        local_bind_guid,
    );

    let state = BindState {
        handle,
        local_bind_guid,
        remote_bind_guid: req.bind_guid,
        local_caps: caps::LOCAL,
        remote_caps: req.info.caps(),
        remote_site_guid: req.info.site_guid(),
        pid: req.info.pid(),
        site_guid: site.id.guid,
        repl_epoch,
        owner_sid: token.user_sid.clone(),
        session_key,
        elevated,
    };
    svc.handles.insert(state).await;

    info!(
        "bound session {} for {} (caps local={:#x} remote={:#x}, epoch {})",
        handle,
        token.account,
        caps::LOCAL,
        req.info.caps(),
        repl_epoch
    );

    Ok(BindResponse {
        handle,
        bind_guid: local_bind_guid,
        server_caps: caps::LOCAL,
        site_guid: site.id.guid,
        repl_epoch,
    })
}

/// Release a session handle.
pub(crate) async fn unbind(
    svc: &ReplicationService,
    token: &SecurityToken,
    req: UnbindRequest,
) -> ReplResult<()> {
    svc.handles.remove(req.handle, token).await?;
    info!("unbound session {}", req.handle);
    Ok(())
}

/// Per-session sealing key: both bind GUIDs folded into the server secret.
fn derive_session_key(secret: &[u8], remote_bind_guid: Guid, local_bind_guid: Guid) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(remote_bind_guid.0.as_bytes());
    hasher.update(local_bind_guid.0.as_bytes());
    hasher.finalize().to_vec()
}
