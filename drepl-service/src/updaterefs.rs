//! Replication partner reference management.
//!
//! Partner links live as one multi-valued attribute on the NC root and are
//! only ever created or removed inside a single store transaction: a failed
//! update cancels the transaction and leaves no partial link-list state
//! observable.

use tracing::{info, warn};

use drepl_core::{
    attrs, ControlRight, DirectoryStore, Dn, ReplError, ReplResult, SecurityLevel, SecurityToken,
    StoreTransaction,
};

use crate::messages::{flags, ReplicationLink, UpdateRefsRequest};
use crate::ReplicationService;

/// Decode the stored link set from the NC root's partner attribute.
pub(crate) fn decode_links(values: Option<&Vec<Vec<u8>>>) -> ReplResult<Vec<ReplicationLink>> {
    let mut links = Vec::new();
    if let Some(values) = values {
        for value in values {
            let link: ReplicationLink = bincode::deserialize(value)
                .map_err(|e| ReplError::Internal(format!("corrupt partner link entry: {}", e)))?;
            links.push(link);
        }
    }
    Ok(links)
}

fn encode_links(links: &[ReplicationLink]) -> ReplResult<Vec<Vec<u8>>> {
    links
        .iter()
        .map(|l| {
            bincode::serialize(l)
                .map_err(|e| ReplError::Internal(format!("encoding partner link: {}", e)))
        })
        .collect()
}

/// Add and/or remove a replication partner reference on an NC.
pub(crate) async fn update_refs(
    svc: &ReplicationService,
    token: &SecurityToken,
    req: UpdateRefsRequest,
) -> ReplResult<()> {
    let entry = svc.handles.get(req.handle, token).await?;
    let _call = entry.begin_call()?;

    if req.flags & (flags::ADD_REF | flags::DEL_REF) == 0 {
        return Err(ReplError::Parameter(
            "update-refs flags select neither add nor delete".into(),
        ));
    }
    if req.dest_guid.is_nil() {
        return Err(ReplError::Parameter("destination DSA guid is nil".into()));
    }

    // Topology-management right on the NC root.
    svc.gate
        .authorize_on_object(svc.store.as_ref(), token, &req.nc, ControlRight::ManageTopology)
        .await?;

    // Self-registration guard: a non-administrator may only manage a
    // reference whose destination is their own account.
    if token.level < SecurityLevel::Administrator && !svc.gate_disabled() {
        let dest = svc
            .store
            .object_by_guid(&req.nc, req.dest_guid)
            .await
            .map_err(|_| {
                warn!(
                    "self-registration guard: destination {} not resolvable, caller token: {}",
                    req.dest_guid, token
                );
                ReplError::AccessDenied
            })?;
        if dest.id.sid.as_ref() != Some(&token.user_sid) {
            warn!(
                "self-registration guard: destination {} does not map to caller SID, caller token: {}",
                req.dest_guid, token
            );
            return Err(ReplError::AccessDenied);
        }
    }

    let mut txn = svc
        .store
        .begin()
        .await
        .map_err(|e| ReplError::Internal(format!("opening transaction: {}", e)))?;

    let root = match txn.object(&req.nc) {
        Ok(root) => root,
        Err(e) => {
            txn.cancel();
            return Err(ReplError::Internal(format!(
                "reading NC root {}: {}",
                req.nc, e
            )));
        }
    };

    let mut links = match decode_links(root.attr(attrs::PARTNER_LINKS)) {
        Ok(links) => links,
        Err(e) => {
            txn.cancel();
            return Err(e);
        }
    };

    if req.flags & flags::DEL_REF != 0 {
        let before = links.len();
        links.retain(|l| l.dest_guid != req.dest_guid);
        if links.len() == before
            && req.flags & (flags::CHECK | flags::ADD_REF) == 0
        {
            txn.cancel();
            return Err(ReplError::NotFound(format!(
                "no replication reference for {} on {}",
                req.dest_guid, req.nc
            )));
        }
    }

    if req.flags & flags::ADD_REF != 0 {
        if links.iter().any(|l| l.dest_guid == req.dest_guid) {
            if req.flags & flags::CHECK != 0 {
                // Tolerated: the desired end state already holds.
                txn.cancel();
                info!(
                    "update-refs: reference for {} already present on {} (check)",
                    req.dest_guid, req.nc
                );
                return Ok(());
            }
            txn.cancel();
            return Err(ReplError::Conflict(format!(
                "replication reference for {} already exists on {}",
                req.dest_guid, req.nc
            )));
        }
        links.push(ReplicationLink {
            dest_guid: req.dest_guid,
            dest_dns_name: req.dest_dns_name.clone(),
            flags: req.flags & !flags::REF_CONTROL_BITS,
        });
    }

    let encoded = match encode_links(&links) {
        Ok(encoded) => encoded,
        Err(e) => {
            txn.cancel();
            return Err(e);
        }
    };
    if let Err(e) = txn.replace_attr(&req.nc, attrs::PARTNER_LINKS, encoded) {
        txn.cancel();
        return Err(ReplError::Internal(format!(
            "staging partner links on {}: {}",
            req.nc, e
        )));
    }
    txn.commit()
        .await
        .map_err(|e| ReplError::Internal(format!("committing partner links on {}: {}", req.nc, e)))?;

    info!(
        "update-refs on {}: dest {} ({}) flags {:#x}, {} link(s) now stored",
        req.nc,
        req.dest_guid,
        req.dest_dns_name,
        req.flags,
        links.len()
    );
    Ok(())
}

/// Read the stored link set of an NC outside a transaction.
pub(crate) async fn read_links(
    svc: &ReplicationService,
    nc: &Dn,
) -> ReplResult<Vec<ReplicationLink>> {
    let root = svc
        .store
        .object_by_dn(nc)
        .await
        .map_err(|e| ReplError::Internal(format!("reading NC root {}: {}", nc, e)))?;
    decode_links(root.attr(attrs::PARTNER_LINKS))
}
