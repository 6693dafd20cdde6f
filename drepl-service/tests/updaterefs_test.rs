//! Partner-reference management tests through the service dispatch surface.

use std::sync::Arc;

use drepl_core::{
    attrs, DirectoryStore, ForestConfig, ForestInfo, Guid, MemoryDirectory, NewObject,
    SecurityLevel, SecurityToken, Sid, WireStatus,
};
use drepl_service::messages::{
    caps, flags, BindRequest, ClientInfo, DrsReply, DrsRequest, UpdateRefsRequest,
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

fn admin_token(info: &ForestInfo) -> SecurityToken {
    SecurityToken {
        account: "admin".to_string(),
        user_sid: info.admin_sid.clone(),
        group_sids: vec![],
        level: SecurityLevel::Administrator,
    }
}

async fn bind(service: &ReplicationService, token: &SecurityToken) -> Guid {
    let reply = service
        .dispatch(
            token,
            DrsRequest::Bind(BindRequest {
                bind_guid: Guid::generate(),
                info: ClientInfo::Compact {
                    caps: caps::BASE,
                    site_guid: Guid::nil(),
                    pid: 7,
                },
            }),
        )
        .await;
    assert_eq!(reply.status, WireStatus::Ok);
    match reply.reply.unwrap() {
        DrsReply::Bind(resp) => resp.handle,
        other => panic!("unexpected reply: {:?}", other),
    }
}

fn refs_request(
    handle: Guid,
    info: &ForestInfo,
    dest_guid: Guid,
    update_flags: u32,
) -> UpdateRefsRequest {
    UpdateRefsRequest {
        handle,
        nc: info.nc_root.clone(),
        dest_guid,
        dest_dns_name: "dsa2.example.com".to_string(),
        flags: update_flags,
    }
}

async fn update(
    service: &ReplicationService,
    token: &SecurityToken,
    req: UpdateRefsRequest,
) -> WireStatus {
    service
        .dispatch(token, DrsRequest::UpdateRefs(req))
        .await
        .status
}

async fn stored_links(store: &MemoryDirectory, info: &ForestInfo) -> usize {
    let root = store.object_by_dn(&info.nc_root).await.unwrap();
    root.attr(attrs::PARTNER_LINKS).map(|v| v.len()).unwrap_or(0)
}

#[tokio::test]
async fn test_double_add_conflicts_without_check() {
    let (store, info, service) = setup().await;
    let token = admin_token(&info);
    let handle = bind(&service, &token).await;
    let dest = Guid::generate();

    let status = update(&service, &token, refs_request(handle, &info, dest, flags::ADD_REF)).await;
    assert_eq!(status, WireStatus::Ok);

    let status = update(&service, &token, refs_request(handle, &info, dest, flags::ADD_REF)).await;
    assert_eq!(status, WireStatus::Conflict);

    assert_eq!(stored_links(&store, &info).await, 1);
}

#[tokio::test]
async fn test_double_add_tolerated_with_check() {
    let (store, info, service) = setup().await;
    let token = admin_token(&info);
    let handle = bind(&service, &token).await;
    let dest = Guid::generate();

    let with_check = flags::ADD_REF | flags::CHECK;
    assert_eq!(
        update(&service, &token, refs_request(handle, &info, dest, with_check)).await,
        WireStatus::Ok
    );
    assert_eq!(
        update(&service, &token, refs_request(handle, &info, dest, with_check)).await,
        WireStatus::Ok
    );

    // Exactly one entry remains.
    assert_eq!(stored_links(&store, &info).await, 1);
}

#[tokio::test]
async fn test_delete_absent_not_found_and_no_mutation() {
    let (store, info, service) = setup().await;
    let token = admin_token(&info);
    let handle = bind(&service, &token).await;

    let root_before = store.object_by_dn(&info.nc_root).await.unwrap();

    let status = update(
        &service,
        &token,
        refs_request(handle, &info, Guid::generate(), flags::DEL_REF),
    )
    .await;
    assert_eq!(status, WireStatus::NotFound);

    // The failed call mutated nothing.
    let root_after = store.object_by_dn(&info.nc_root).await.unwrap();
    assert_eq!(root_after.usn_changed, root_before.usn_changed);
    assert_eq!(stored_links(&store, &info).await, 0);
}

#[tokio::test]
async fn test_delete_absent_tolerated_with_check() {
    let (_, info, service) = setup().await;
    let token = admin_token(&info);
    let handle = bind(&service, &token).await;

    let status = update(
        &service,
        &token,
        refs_request(handle, &info, Guid::generate(), flags::DEL_REF | flags::CHECK),
    )
    .await;
    assert_eq!(status, WireStatus::Ok);
}

#[tokio::test]
async fn test_add_and_delete_roundtrip() {
    let (store, info, service) = setup().await;
    let token = admin_token(&info);
    let handle = bind(&service, &token).await;
    let dest = Guid::generate();

    assert_eq!(
        update(
            &service,
            &token,
            refs_request(handle, &info, dest, flags::ADD_REF | flags::WRITEABLE | flags::GCSPN),
        )
        .await,
        WireStatus::Ok
    );
    assert_eq!(stored_links(&store, &info).await, 1);

    // Control bits never reach storage.
    let root = store.object_by_dn(&info.nc_root).await.unwrap();
    let raw = &root.attr(attrs::PARTNER_LINKS).unwrap()[0];
    let link: drepl_service::messages::ReplicationLink = bincode::deserialize(raw).unwrap();
    assert_eq!(link.flags & flags::REF_CONTROL_BITS, 0);
    assert_ne!(link.flags & flags::WRITEABLE, 0);
    assert_ne!(link.flags & flags::GCSPN, 0);

    assert_eq!(
        update(&service, &token, refs_request(handle, &info, dest, flags::DEL_REF)).await,
        WireStatus::Ok
    );
    assert_eq!(stored_links(&store, &info).await, 0);
}

#[tokio::test]
async fn test_neither_add_nor_delete_rejected() {
    let (_, info, service) = setup().await;
    let token = admin_token(&info);
    let handle = bind(&service, &token).await;

    let status = update(
        &service,
        &token,
        refs_request(handle, &info, Guid::generate(), flags::GCSPN),
    )
    .await;
    assert_eq!(status, WireStatus::Parameter);
}

#[tokio::test]
async fn test_requires_topology_right() {
    let (_, info, service) = setup().await;
    let stranger = SecurityToken {
        account: "mallory".to_string(),
        user_sid: Sid::new("S-1-5-21-9-9-9-1105"),
        group_sids: vec![],
        level: SecurityLevel::User,
    };
    let handle = bind(&service, &stranger).await;

    let status = update(
        &service,
        &stranger,
        refs_request(handle, &info, Guid::generate(), flags::ADD_REF),
    )
    .await;
    assert_eq!(status, WireStatus::AccessDenied);
}

#[tokio::test]
async fn test_self_registration_guard() {
    let (store, info, service) = setup().await;

    // A machine account with the topology right but no administrator level.
    let machine_sid = Sid::new(format!("{}-1106", info.domain_sid));
    let machine_guid = Guid::generate();
    store
        .add_object(
            NewObject::container(format!("cn=member01,{}", info.nc_root), "computer")
                .with_sid(machine_sid.clone())
                .with_guid(machine_guid),
        )
        .await
        .unwrap();

    // The account holds the topology right through its DC group membership
    // but stays below administrator level, so the guard applies.
    let token = SecurityToken {
        account: "member01$".to_string(),
        user_sid: machine_sid,
        group_sids: vec![info.dc_sid.clone()],
        level: SecurityLevel::DomainController,
    };
    let handle = bind(&service, &token).await;

    // Registering itself succeeds.
    let status = update(
        &service,
        &token,
        refs_request(handle, &info, machine_guid, flags::ADD_REF),
    )
    .await;
    assert_eq!(status, WireStatus::Ok);

    // Registering a reference for some other destination does not.
    let status = update(
        &service,
        &token,
        refs_request(handle, &info, Guid::generate(), flags::ADD_REF),
    )
    .await;
    assert_eq!(status, WireStatus::AccessDenied);
}
