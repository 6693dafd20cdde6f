//! Bind lifecycle, forwarded operations and auxiliary call tests.

use std::sync::Arc;

use drepl_core::{
    attrs, Dn, DirectoryStore, ForestConfig, ForestInfo, Guid, MemoryDirectory, NewObject,
    SecurityLevel, SecurityToken, Sid, WireStatus,
};
use drepl_service::messages::{
    caps, flags, info_type, name_format, BindRequest, BindResponse, ClientInfo,
    CrackNamesRequest, DrsReply, DrsRequest, ExecuteKccRequest, GetReplInfoRequest,
    RemoveServerRequest, ReplInfo, ReplicaSyncRequest, SpnOperation, UnbindRequest,
    UpdateRefsRequest, WriteSpnRequest,
};
use drepl_service::{ReplicationService, ServiceConfig};

async fn setup() -> (Arc<MemoryDirectory>, ForestInfo, ReplicationService) {
    let store = Arc::new(MemoryDirectory::new(Guid::generate()));
    let info = store
        .bootstrap_forest(&ForestConfig::default())
        .await
        .unwrap();
    let config = ServiceConfig::for_forest(&info);
    let service =
        ReplicationService::new(Arc::clone(&store) as Arc<dyn DirectoryStore>, config);
    (store, info, service)
}

fn token(info: &ForestInfo, level: SecurityLevel) -> SecurityToken {
    let sid = match level {
        SecurityLevel::Administrator | SecurityLevel::System => info.admin_sid.clone(),
        SecurityLevel::DomainController => info.dc_sid.clone(),
        _ => Sid::new(format!("{}-1110", info.domain_sid)),
    };
    SecurityToken {
        account: format!("{}-caller", level),
        user_sid: sid,
        group_sids: vec![],
        level,
    }
}

async fn bind_full(
    service: &ReplicationService,
    token: &SecurityToken,
    client_info: ClientInfo,
) -> BindResponse {
    let reply = service
        .dispatch(
            token,
            DrsRequest::Bind(BindRequest {
                bind_guid: Guid::generate(),
                info: client_info,
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Ok);
    match reply.reply.unwrap() {
        DrsReply::Bind(resp) => resp,
        other => panic!("unexpected reply: {:?}", other),
    }
}

async fn bind(service: &ReplicationService, token: &SecurityToken) -> Guid {
    bind_full(
        service,
        token,
        ClientInfo::Compact {
            caps: caps::BASE,
            site_guid: Guid::nil(),
            pid: 7,
        },
    )
    .await
    .handle
}

#[tokio::test]
async fn test_bind_accepts_both_client_info_shapes() {
    let (store, info, service) = setup().await;
    let caller = token(&info, SecurityLevel::DomainController);

    let compact = bind_full(
        &service,
        &caller,
        ClientInfo::Compact {
            caps: caps::BASE,
            site_guid: Guid::generate(),
            pid: 11,
        },
    )
    .await;
    let extended = bind_full(
        &service,
        &caller,
        ClientInfo::Extended {
            caps: caps::LOCAL,
            site_guid: Guid::generate(),
            pid: 12,
            ext_flags: 1,
            config_dn: Some(info.config_nc.to_string()),
        },
    )
    .await;

    // Both produce live handles advertising the same fixed capability set.
    assert_eq!(compact.server_caps, caps::LOCAL);
    assert_eq!(extended.server_caps, caps::LOCAL);
    assert_ne!(compact.handle, extended.handle);
    assert_eq!(service.live_binds().await, 2);

    // The server resolved its own site object.
    let site = store.object_by_dn(&info.site_dn).await.unwrap();
    assert_eq!(compact.site_guid, site.id.guid);
    assert_eq!(compact.repl_epoch, 0);
}

#[tokio::test]
async fn test_unbind_enforces_owner() {
    let (_, info, service) = setup().await;
    let owner = token(&info, SecurityLevel::DomainController);
    let stranger = token(&info, SecurityLevel::User);
    let handle = bind(&service, &owner).await;

    let reply = service
        .dispatch(&stranger, DrsRequest::Unbind(UnbindRequest { handle }))
        .await;
    assert_eq!(reply.status, WireStatus::Parameter);
    assert_eq!(service.live_binds().await, 1);

    let reply = service
        .dispatch(&owner, DrsRequest::Unbind(UnbindRequest { handle }))
        .await;
    assert_eq!(reply.status, WireStatus::Ok);
    assert_eq!(service.live_binds().await, 0);

    // Double unbind fails like any unknown handle.
    let reply = service
        .dispatch(&owner, DrsRequest::Unbind(UnbindRequest { handle }))
        .await;
    assert_eq!(reply.status, WireStatus::Parameter);
}

#[tokio::test]
async fn test_teardown_drops_all_binds_for_caller() {
    let (_, info, service) = setup().await;
    let caller = token(&info, SecurityLevel::DomainController);
    bind(&service, &caller).await;
    bind(&service, &caller).await;

    assert_eq!(service.teardown_for(&caller).await, 2);
    assert_eq!(service.live_binds().await, 0);
}

#[tokio::test]
async fn test_replica_sync_forwards_and_replies() {
    let (_, info, service) = setup().await;
    let caller = token(&info, SecurityLevel::DomainController);
    let handle = bind(&service, &caller).await;

    let reply = service
        .dispatch(
            &caller,
            DrsRequest::ReplicaSync(ReplicaSyncRequest {
                handle,
                nc: info.nc_root.clone(),
                source_dsa: Some(Guid::generate()),
                flags: 0,
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Ok);

    // Asynchronous opt-in takes the unbounded-park path.
    let reply = service
        .dispatch(
            &caller,
            DrsRequest::ReplicaSync(ReplicaSyncRequest {
                handle,
                nc: info.nc_root.clone(),
                source_dsa: None,
                flags: flags::ASYNC_OP,
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Ok);

    // A sync of a nonexistent NC completes with not-found.
    let reply = service
        .dispatch(
            &caller,
            DrsRequest::ReplicaSync(ReplicaSyncRequest {
                handle,
                nc: Dn::new("dc=missing,dc=com"),
                source_dsa: None,
                flags: 0,
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::NotFound);
}

#[tokio::test]
async fn test_replica_sync_requires_dc_level() {
    let (_, info, service) = setup().await;
    let caller = token(&info, SecurityLevel::User);
    let handle = bind(&service, &caller).await;

    let reply = service
        .dispatch(
            &caller,
            DrsRequest::ReplicaSync(ReplicaSyncRequest {
                handle,
                nc: info.nc_root.clone(),
                source_dsa: None,
                flags: 0,
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::AccessDenied);
}

#[tokio::test]
async fn test_execute_kcc() {
    let (_, info, service) = setup().await;
    let caller = token(&info, SecurityLevel::Administrator);
    let handle = bind(&service, &caller).await;

    let reply = service
        .dispatch(&caller, DrsRequest::ExecuteKcc(ExecuteKccRequest { handle, flags: 0 }))
        .await;
    assert_eq!(reply.status, WireStatus::Ok);
}

#[tokio::test]
async fn test_get_repl_info() {
    let (_, info, service) = setup().await;
    let caller = token(&info, SecurityLevel::Administrator);
    let handle = bind(&service, &caller).await;

    // Seed one partner reference.
    let reply = service
        .dispatch(
            &caller,
            DrsRequest::UpdateRefs(UpdateRefsRequest {
                handle,
                nc: info.nc_root.clone(),
                dest_guid: Guid::generate(),
                dest_dns_name: "dsa2.example.com".into(),
                flags: flags::ADD_REF,
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Ok);

    let reply = service
        .dispatch(
            &caller,
            DrsRequest::GetReplInfo(GetReplInfoRequest {
                handle,
                info_type: info_type::NEIGHBORS,
                nc: info.nc_root.clone(),
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Ok);
    match reply.reply.unwrap() {
        DrsReply::GetReplInfo(ReplInfo::Neighbors(links)) => {
            assert_eq!(links.len(), 1);
            assert_eq!(links[0].dest_dns_name, "dsa2.example.com");
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    let reply = service
        .dispatch(
            &caller,
            DrsRequest::GetReplInfo(GetReplInfoRequest {
                handle,
                info_type: info_type::CURSORS,
                nc: info.nc_root.clone(),
            }),
        )
        .await;
    match reply.reply.unwrap() {
        DrsReply::GetReplInfo(ReplInfo::Cursors(udv)) => {
            assert!(!udv.cursors.is_empty());
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    // Unknown info type is a parameter error.
    let reply = service
        .dispatch(
            &caller,
            DrsRequest::GetReplInfo(GetReplInfoRequest {
                handle,
                info_type: 42,
                nc: info.nc_root.clone(),
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Parameter);
}

#[tokio::test]
async fn test_crack_names() {
    let (store, info, service) = setup().await;
    let caller = token(&info, SecurityLevel::Administrator);
    let handle = bind(&service, &caller).await;

    let user_dn = format!("cn=Bob,{}", info.nc_root);
    let created = store
        .add_object(NewObject::container(&user_dn, "user"))
        .await
        .unwrap();

    let reply = service
        .dispatch(
            &caller,
            DrsRequest::CrackNames(CrackNamesRequest {
                handle,
                format_offered: name_format::DN,
                format_desired: name_format::CANONICAL,
                names: vec![user_dn.clone(), "cn=Ghost,dc=example,dc=com".into()],
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Ok);
    match reply.reply.unwrap() {
        DrsReply::CrackNames(resp) => {
            assert_eq!(resp.answers.len(), 2);
            assert_eq!(resp.answers[0].status, WireStatus::Ok);
            assert_eq!(resp.answers[0].result.as_deref(), Some("example.com/Bob"));
            // Translation failures are per-name, not call failures.
            assert_eq!(resp.answers[1].status, WireStatus::NotFound);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    // GUID form resolves through the default NC.
    let reply = service
        .dispatch(
            &caller,
            DrsRequest::CrackNames(CrackNamesRequest {
                handle,
                format_offered: name_format::GUID,
                format_desired: name_format::DN,
                names: vec![created.guid.to_string()],
            }),
        )
        .await;
    match reply.reply.unwrap() {
        DrsReply::CrackNames(resp) => {
            assert_eq!(
                resp.answers[0].result.as_deref().map(str::to_lowercase),
                Some(user_dn.to_lowercase())
            );
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_write_spn_under_elevated_session() {
    let (store, info, service) = setup().await;

    let account_dn = Dn::new(format!("cn=svc01,{}", info.nc_root));
    store
        .add_object(
            NewObject::container(account_dn.as_str(), "user")
                .with_sid(Sid::new(format!("{}-1111", info.domain_sid))),
        )
        .await
        .unwrap();

    // A DC bind carries an elevated session and may update any account.
    let dc = token(&info, SecurityLevel::DomainController);
    let handle = bind(&service, &dc).await;
    let reply = service
        .dispatch(
            &dc,
            DrsRequest::WriteSpn(WriteSpnRequest {
                handle,
                operation: SpnOperation::Add,
                account_dn: account_dn.clone(),
                spns: vec!["HOST/svc01.example.com".into(), "HOST/svc01".into()],
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Ok);

    let account = store.object_by_dn(&account_dn).await.unwrap();
    assert_eq!(account.attr(attrs::SERVICE_PRINCIPAL_NAME).unwrap().len(), 2);

    // Delete one value.
    let reply = service
        .dispatch(
            &dc,
            DrsRequest::WriteSpn(WriteSpnRequest {
                handle,
                operation: SpnOperation::Delete,
                account_dn: account_dn.clone(),
                spns: vec!["HOST/svc01".into()],
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Ok);
    let account = store.object_by_dn(&account_dn).await.unwrap();
    assert_eq!(account.attr(attrs::SERVICE_PRINCIPAL_NAME).unwrap().len(), 1);

    // A plain user bind has no elevated session and cannot touch a foreign
    // account.
    let user = token(&info, SecurityLevel::User);
    let user_handle = bind(&service, &user).await;
    let reply = service
        .dispatch(
            &user,
            DrsRequest::WriteSpn(WriteSpnRequest {
                handle: user_handle,
                operation: SpnOperation::Replace,
                account_dn: account_dn.clone(),
                spns: vec!["HOST/evil".into()],
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::AccessDenied);
}

#[tokio::test]
async fn test_remove_server() {
    let (store, info, service) = setup().await;
    let caller = token(&info, SecurityLevel::Administrator);
    let handle = bind(&service, &caller).await;

    let server_dn = Dn::new(format!(
        "cn=DSA9,cn=servers,{}",
        info.site_dn
    ));
    store
        .add_object(NewObject::container(server_dn.as_str(), "server"))
        .await
        .unwrap();
    store
        .add_object(NewObject::container(
            format!("cn=ntds settings,{}", server_dn),
            "nTDSDSA",
        ))
        .await
        .unwrap();

    let reply = service
        .dispatch(
            &caller,
            DrsRequest::RemoveServer(RemoveServerRequest {
                handle,
                server_dn: server_dn.clone(),
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Ok);

    let server = store.object_by_dn(&server_dn).await.unwrap();
    assert!(server.is_deleted);

    // Removing it again reports not-found.
    let reply = service
        .dispatch(
            &caller,
            DrsRequest::RemoveServer(RemoveServerRequest {
                handle,
                server_dn: server_dn.clone(),
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::NotFound);
}

#[tokio::test]
async fn test_remove_server_requires_admin() {
    let (_, info, service) = setup().await;
    let caller = token(&info, SecurityLevel::DomainController);
    let handle = bind(&service, &caller).await;

    let reply = service
        .dispatch(
            &caller,
            DrsRequest::RemoveServer(RemoveServerRequest {
                handle,
                server_dn: Dn::new(format!("cn=DSA1,cn=servers,{}", info.site_dn)),
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::AccessDenied);
}
