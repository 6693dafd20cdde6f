//! Auxiliary service operations: replication state reports, name
//! translation, SPN maintenance and retired-server removal.

use tracing::{info, warn};

use drepl_core::{
    attrs, DirectoryStore, Dn, Guid, ReplError, ReplResult, SecurityLevel, SecurityToken,
    StoreError, StoreTransaction, UpToDateVectorManager, WireStatus,
};

use crate::messages::{
    info_type, name_format, CrackNamesRequest, CrackNamesResponse, CrackedName,
    GetReplInfoRequest, RemoveServerRequest, ReplInfo, SpnOperation, WriteSpnRequest,
};
use crate::updaterefs::read_links;
use crate::ReplicationService;

/// Report an NC's partner references or up-to-date vector cursors.
pub(crate) async fn get_repl_info(
    svc: &ReplicationService,
    token: &SecurityToken,
    req: GetReplInfoRequest,
) -> ReplResult<ReplInfo> {
    let entry = svc.handles.get(req.handle, token).await?;
    let _call = entry.begin_call()?;

    svc.gate
        .authorize(token, SecurityLevel::Administrator, None)?;

    match req.info_type {
        info_type::NEIGHBORS => {
            let links = read_links(svc, &req.nc).await?;
            Ok(ReplInfo::Neighbors(links))
        }
        info_type::CURSORS => {
            let udv = UpToDateVectorManager::current(svc.store.as_ref(), &req.nc).await?;
            Ok(ReplInfo::Cursors(udv))
        }
        other => Err(ReplError::Parameter(format!(
            "unknown replication info type {}",
            other
        ))),
    }
}

/// Translate names between GUID, DN and canonical forms.
///
/// Translation failures are per-name outcomes; the call itself succeeds.
pub(crate) async fn crack_names(
    svc: &ReplicationService,
    token: &SecurityToken,
    req: CrackNamesRequest,
) -> ReplResult<CrackNamesResponse> {
    let entry = svc.handles.get(req.handle, token).await?;
    let _call = entry.begin_call()?;

    svc.gate.authorize(token, SecurityLevel::User, None)?;

    let mut answers = Vec::with_capacity(req.names.len());
    for name in &req.names {
        answers.push(crack_one(svc, req.format_offered, req.format_desired, name).await);
    }
    Ok(CrackNamesResponse { answers })
}

async fn crack_one(
    svc: &ReplicationService,
    format_offered: u32,
    format_desired: u32,
    name: &str,
) -> CrackedName {
    let default_nc = svc.config.default_nc();

    let dn = match format_offered {
        name_format::DN => Dn::new(name),
        name_format::GUID => {
            let guid = match Guid::parse(name) {
                Ok(guid) => guid,
                Err(_) => return CrackedName {
                    status: WireStatus::Parameter,
                    result: None,
                },
            };
            match svc.store.object_by_guid(&default_nc, guid).await {
                Ok(obj) => obj.id.dn,
                Err(_) => {
                    return CrackedName {
                        status: WireStatus::NotFound,
                        result: None,
                    }
                }
            }
        }
        _ => {
            return CrackedName {
                status: WireStatus::Parameter,
                result: None,
            }
        }
    };

    let obj = match svc.store.object_by_dn(&dn).await {
        Ok(obj) => obj,
        Err(_) => {
            return CrackedName {
                status: WireStatus::NotFound,
                result: None,
            }
        }
    };

    let result = match format_desired {
        name_format::DN => Some(obj.id.dn.to_string()),
        name_format::GUID => Some(obj.id.guid.to_string()),
        name_format::CANONICAL => Some(dn_to_canonical(&obj.id.dn)),
        _ => None,
    };
    match result {
        Some(result) => CrackedName {
            status: WireStatus::Ok,
            result: Some(result),
        },
        None => CrackedName {
            status: WireStatus::Parameter,
            result: None,
        },
    }
}

/// `cn=Bob,cn=Users,dc=example,dc=com` → `example.com/Users/Bob`.
fn dn_to_canonical(dn: &Dn) -> String {
    let mut domain_parts = Vec::new();
    let mut path_parts = Vec::new();
    for component in dn.as_str().split(',') {
        let component = component.trim();
        match component.split_once('=') {
            Some((kind, value)) if kind.trim().eq_ignore_ascii_case("dc") => {
                domain_parts.push(value.trim().to_string());
            }
            Some((_, value)) => path_parts.push(value.trim().to_string()),
            None => {}
        }
    }
    path_parts.reverse();
    let mut out = domain_parts.join(".");
    for part in path_parts {
        out.push('/');
        out.push_str(&part);
    }
    out
}

/// Add, replace or delete service principal names on an account object.
///
/// Runs under the bind's elevated session when one was provisioned;
/// otherwise the caller must be an administrator or the account itself.
pub(crate) async fn write_spn(
    svc: &ReplicationService,
    token: &SecurityToken,
    req: WriteSpnRequest,
) -> ReplResult<()> {
    let entry = svc.handles.get(req.handle, token).await?;
    let _call = entry.begin_call()?;

    svc.gate.authorize(token, SecurityLevel::User, None)?;

    let account = svc
        .store
        .object_by_dn(&req.account_dn)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(dn) => ReplError::NotFound(dn),
            e => ReplError::Internal(format!("resolving {}: {}", req.account_dn, e)),
        })?;

    let effective = match &entry.state.elevated {
        Some(session) => {
            info!(
                "SPN update on {} under elevated session for {}",
                req.account_dn, token.account
            );
            session.token.clone()
        }
        None => token.clone(),
    };
    if effective.level < SecurityLevel::Administrator
        && account.id.sid.as_ref() != Some(&effective.user_sid)
        && !svc.gate_disabled()
    {
        warn!(
            "SPN update on {} denied, caller token: {}",
            req.account_dn, token
        );
        return Err(ReplError::AccessDenied);
    }

    let mut spns: Vec<String> = account
        .attr(attrs::SERVICE_PRINCIPAL_NAME)
        .map(|values| {
            values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect()
        })
        .unwrap_or_default();

    match req.operation {
        SpnOperation::Add => {
            for spn in &req.spns {
                if !spns.contains(spn) {
                    spns.push(spn.clone());
                }
            }
        }
        SpnOperation::Replace => {
            spns = req.spns.clone();
        }
        SpnOperation::Delete => {
            spns.retain(|existing| !req.spns.contains(existing));
        }
    }

    let values: Vec<Vec<u8>> = spns.iter().map(|s| s.as_bytes().to_vec()).collect();
    let mut txn = svc
        .store
        .begin()
        .await
        .map_err(|e| ReplError::Internal(format!("opening transaction: {}", e)))?;
    if let Err(e) = txn.replace_attr(&req.account_dn, attrs::SERVICE_PRINCIPAL_NAME, values) {
        txn.cancel();
        return Err(ReplError::Internal(format!(
            "staging SPN update on {}: {}",
            req.account_dn, e
        )));
    }
    txn.commit().await.map_err(|e| {
        ReplError::Internal(format!("committing SPN update on {}: {}", req.account_dn, e))
    })?;

    info!(
        "SPN update on {}: {:?} ({} value(s) now stored)",
        req.account_dn,
        req.operation,
        spns.len()
    );
    Ok(())
}

/// Tombstone a retired server object and its settings child.
pub(crate) async fn remove_server(
    svc: &ReplicationService,
    token: &SecurityToken,
    req: RemoveServerRequest,
) -> ReplResult<()> {
    let entry = svc.handles.get(req.handle, token).await?;
    let _call = entry.begin_call()?;

    svc.gate
        .authorize(token, SecurityLevel::Administrator, None)?;

    let server = svc
        .store
        .object_by_dn(&req.server_dn)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(dn) => ReplError::NotFound(dn),
            e => ReplError::Internal(format!("resolving {}: {}", req.server_dn, e)),
        })?;
    if server.is_deleted {
        return Err(ReplError::NotFound(format!(
            "server object already removed: {}",
            req.server_dn
        )));
    }

    if entry.state.elevated.is_some() {
        info!(
            "removing server {} under elevated session for {}",
            req.server_dn, token.account
        );
    }

    let settings_dn = Dn::new(format!("cn=ntds settings,{}", req.server_dn));
    let mut txn = svc
        .store
        .begin()
        .await
        .map_err(|e| ReplError::Internal(format!("opening transaction: {}", e)))?;

    // The settings child goes first when present; both removals commit
    // together or not at all.
    if txn.object(&settings_dn).is_ok() {
        if let Err(e) = txn.delete_object(&settings_dn) {
            txn.cancel();
            return Err(ReplError::Internal(format!(
                "staging removal of {}: {}",
                settings_dn, e
            )));
        }
    }
    if let Err(e) = txn.delete_object(&req.server_dn) {
        txn.cancel();
        return Err(ReplError::Internal(format!(
            "staging removal of {}: {}",
            req.server_dn, e
        )));
    }
    txn.commit().await.map_err(|e| {
        ReplError::Internal(format!("committing removal of {}: {}", req.server_dn, e))
    })?;

    info!("server object {} removed", req.server_dn);
    Ok(())
}
