//! Paged change enumeration.
//!
//! The first call for an NC freezes a point-in-time snapshot of every object
//! whose change sequence number exceeds the partner's watermark; subsequent
//! calls page through it. An object whose sequence number qualifies is always
//! transmitted, even when no individual attribute survives metadata
//! filtering: a rename or move with no other change must still reach the
//! partner. When the snapshot is exhausted the committed watermark advances,
//! a fresh up-to-date vector is assembled and the cursor is torn down.

use tracing::{debug, info};

use drepl_core::metadata::MetadataVector;
use drepl_core::{
    attrs, AttributeCodec, DirectoryObject, DirectoryStore, Guid, HighWatermark,
    ObjectIdentifier, ReplError, ReplResult, Scope, SearchControls, SearchFilter, SearchRequest,
    SecurityLevel, SecurityToken, UpToDateVectorManager, WireAttribute,
};

use crate::handle::{BindEntry, ChangeCursor};
use crate::messages::{
    flags, GetChangesRequest, GetChangesResponse, ReplicatedObject, GETCHANGES_LEVELS,
};
use crate::ReplicationService;

/// Serve one page of changes for the requested NC.
pub(crate) async fn get_changes(
    svc: &ReplicationService,
    token: &SecurityToken,
    req: GetChangesRequest,
) -> ReplResult<GetChangesResponse> {
    if !GETCHANGES_LEVELS.contains(&req.level) {
        return Err(ReplError::UnknownLevel(req.level));
    }
    let nc = req
        .nc
        .clone()
        .ok_or_else(|| ReplError::Parameter("request carries no NC identifier".into()))?;

    let entry = svc.handles.get(req.handle, token).await?;
    let _call = entry.begin_call()?;

    // Read-replication entry point: DC level, same escape hatch as writes.
    svc.gate
        .authorize(token, SecurityLevel::DomainController, None)?;

    let mut cursor_slot = entry.cursor.lock().await;

    // Exactly one NC in flight per bind: a different NC discards any prior
    // cursor and starts a fresh snapshot.
    let mut cursor = match cursor_slot.take() {
        Some(existing) if existing.nc == nc.dn => existing,
        _ => build_snapshot(svc, &nc, &req).await?,
    };

    let cap = effective_cap(svc.config.max_objects_per_call, req.max_objects);
    let mut objects = Vec::new();

    while cursor.offset < cursor.snapshot.len() && objects.len() < cap {
        let obj = cursor.snapshot[cursor.offset].clone();
        cursor.watermark.observe(obj.usn_changed);

        let replicated = build_object(svc, &entry, &cursor, &obj, &req).await?;
        objects.push(replicated);
        cursor.offset += 1;
    }

    let exhausted = cursor.offset >= cursor.snapshot.len();
    if exhausted {
        cursor.watermark.commit();
        let udv = UpToDateVectorManager::current(svc.store.as_ref(), &cursor.nc).await?;
        let response = GetChangesResponse {
            source_invocation_id: svc.store.invocation_id(),
            nc: cursor.nc_root.clone(),
            objects,
            more_data: false,
            new_high_watermark: cursor.watermark.committed,
            up_to_date_vector: Some(udv),
        };
        info!(
            "change enumeration of {} drained at watermark {}",
            cursor.nc, cursor.watermark.committed
        );
        // Cursor torn down: the next call for any NC starts fresh.
        *cursor_slot = None;
        return Ok(response);
    }

    debug!(
        "change enumeration of {} paused at offset {}/{} (scratch watermark {})",
        cursor.nc,
        cursor.offset,
        cursor.snapshot.len(),
        cursor.watermark.scratch
    );
    let response = GetChangesResponse {
        source_invocation_id: svc.store.invocation_id(),
        nc: cursor.nc_root.clone(),
        objects,
        more_data: true,
        new_high_watermark: cursor.watermark.scratch,
        up_to_date_vector: None,
    };
    *cursor_slot = Some(cursor);
    Ok(response)
}

/// Freeze the candidate set for a fresh enumeration.
async fn build_snapshot(
    svc: &ReplicationService,
    nc: &ObjectIdentifier,
    req: &GetChangesRequest,
) -> ReplResult<ChangeCursor> {
    let root = svc
        .store
        .object_by_dn(&nc.dn)
        .await
        .map_err(|_| ReplError::NotFound(format!("no such naming context: {}", nc.dn)))?;

    // Extended identifiers and tombstone visibility keep SIDs and deletions
    // replicable; deterministic DN order makes paging resumable.
    let search = SearchRequest {
        base: root.id.dn.clone(),
        scope: Scope::Subtree,
        filter: SearchFilter {
            usn_above: Some(req.low_watermark),
            critical_only: req.flags & flags::CRITICAL_ONLY != 0,
            object_guid: req.single_object,
        },
        controls: SearchControls {
            extended_dn: true,
            show_deleted: true,
            show_recycled: true,
        },
        sort_by_dn: true,
    };
    let snapshot = svc
        .store
        .search(&search)
        .await
        .map_err(|e| ReplError::Internal(format!("snapshot query on {}: {}", nc.dn, e)))?;

    info!(
        "snapshot of {} above watermark {}: {} candidate object(s)",
        nc.dn,
        req.low_watermark,
        snapshot.len()
    );
    Ok(ChangeCursor {
        nc: root.id.dn.clone(),
        nc_root: root.id,
        snapshot,
        offset: 0,
        low_watermark: req.low_watermark,
        watermark: HighWatermark::starting_at(req.low_watermark),
    })
}

/// Translate one snapshot object into its wire form.
async fn build_object(
    svc: &ReplicationService,
    entry: &BindEntry,
    cursor: &ChangeCursor,
    obj: &DirectoryObject,
    req: &GetChangesRequest,
) -> ReplResult<ReplicatedObject> {
    // Stored metadata must decode; an unrecognized blob version is corrupt
    // state, not a skippable object.
    let meta = obj.metadata().map_err(|e| {
        ReplError::Internal(format!(
            "metadata of {}: {}",
            AttributeCodec::identifier_to_string(&obj.id),
            e
        ))
    })?;

    let (is_nc_root, parent_guid) = resolve_position(svc, cursor, obj).await?;

    let mut replicated = ReplicatedObject::new(obj.id.clone(), is_nc_root, parent_guid);
    let secret_processing = req.flags & flags::SPECIAL_SECRET_PROCESSING != 0;
    let rid = obj
        .id
        .sid
        .as_ref()
        .and_then(|sid| sid.rid())
        .unwrap_or(0);

    for entry_meta in filter_metadata(&meta, cursor.low_watermark) {
        let values = obj.attr(entry_meta.attr_id).cloned().unwrap_or_default();
        let mut attr = WireAttribute::new(entry_meta.attr_id, values);
        let mut meta_out = entry_meta.clone();

        if secret_processing {
            AttributeCodec::redact_if_secret(&mut attr, &mut meta_out);
        }
        AttributeCodec::encrypt_sensitive(&mut attr, &entry.state.session_key, rid)?;

        replicated.push(attr, meta_out);
    }
    Ok(replicated)
}

/// Determine tree position: NC root, or the immediate parent's GUID.
///
/// A subordinate partition head is re-read from the store first so the
/// cross-partition parent is never taken from a stale snapshot view.
async fn resolve_position(
    svc: &ReplicationService,
    cursor: &ChangeCursor,
    obj: &DirectoryObject,
) -> ReplResult<(bool, Option<Guid>)> {
    if obj.id.dn == cursor.nc {
        return Ok((true, None));
    }

    let parent_guid = if obj.is_nc_head() {
        let fresh = svc.store.object_by_dn(&obj.id.dn).await.map_err(|e| {
            ReplError::Internal(format!("re-reading partition head {}: {}", obj.id.dn, e))
        })?;
        fresh.parent_guid
    } else {
        obj.parent_guid
    };

    match parent_guid {
        Some(guid) => Ok((false, Some(guid))),
        None => Err(ReplError::Internal(format!(
            "object {} below {} has no resolvable parent",
            obj.id.dn, cursor.nc
        ))),
    }
}

/// Keep metadata entries whose local sequence number exceeds the watermark.
/// The structural instance-type attribute is always retained even when
/// unchanged; the naming RDN attribute is always dropped.
fn filter_metadata(
    meta: &MetadataVector,
    low_watermark: u64,
) -> impl Iterator<Item = &drepl_core::AttributeMetadata> {
    meta.entries.iter().filter(move |entry| {
        if entry.attr_id == attrs::NAME {
            return false;
        }
        entry.attr_id == attrs::INSTANCE_TYPE || entry.local_usn > low_watermark
    })
}

fn effective_cap(server_default: u32, requested: u32) -> usize {
    let cap = if requested == 0 {
        server_default
    } else {
        requested.min(server_default)
    };
    cap.max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use drepl_core::AttributeMetadata;

    fn meta(attr_id: u32, local_usn: u64) -> AttributeMetadata {
        AttributeMetadata {
            attr_id,
            version: 1,
            originating_time: 0,
            originating_invocation_id: Guid::nil(),
            originating_usn: local_usn,
            local_usn,
        }
    }

    #[test]
    fn test_filter_keeps_instance_type_drops_rdn() {
        let mut vector = MetadataVector::new();
        vector.upsert(meta(attrs::INSTANCE_TYPE, 5));
        vector.upsert(meta(attrs::NAME, 500));
        vector.upsert(meta(attrs::DESCRIPTION, 50));
        vector.upsert(meta(attrs::OBJECT_CLASS, 5));

        let kept: Vec<u32> = filter_metadata(&vector, 40).map(|m| m.attr_id).collect();
        // Instance type survives below the watermark; the RDN never ships.
        assert!(kept.contains(&attrs::INSTANCE_TYPE));
        assert!(kept.contains(&attrs::DESCRIPTION));
        assert!(!kept.contains(&attrs::NAME));
        assert!(!kept.contains(&attrs::OBJECT_CLASS));
    }

    #[test]
    fn test_effective_cap() {
        assert_eq!(effective_cap(256, 0), 256);
        assert_eq!(effective_cap(256, 10), 10);
        assert_eq!(effective_cap(256, 4096), 256);
        assert_eq!(effective_cap(0, 0), 1);
    }
}
