//! In-memory directory store.
//!
//! A complete, transaction-capable implementation of [`DirectoryStore`]
//! backing the server binary and the test suites. Writes are staged in a
//! single-writer transaction and stamp per-attribute replication metadata and
//! the global sequence counter exactly the way the engine expects to read
//! them back.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::ident::{Dn, Guid, ObjectIdentifier, Sid};
use crate::metadata::{AttributeMetadata, MetadataVector};
use crate::schema::{attrs, AttrId, AttributeSchema};
use crate::store::{
    AclEntry, ControlRight, DirectoryObject, DirectoryStore, Scope, SearchRequest, StoreError,
    StoreResult, StoreTransaction, INSTANCE_TYPE_NC_HEAD, INSTANCE_TYPE_WRITEABLE,
};

/// Shared mutable state behind the store handle.
struct DirState {
    /// Objects keyed by lowercased DN.
    objects: HashMap<String, DirectoryObject>,
    /// Global monotonic sequence counter.
    usn: u64,
}

/// Description of an object to seed into the store.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub dn: Dn,
    pub guid: Option<Guid>,
    pub sid: Option<Sid>,
    pub object_class: String,
    pub instance_type: u32,
    pub critical: bool,
    pub attributes: Vec<(AttrId, Vec<Vec<u8>>)>,
    pub acl: Vec<AclEntry>,
}

impl NewObject {
    /// A plain container-style object beneath an existing parent.
    pub fn container(dn: impl Into<String>, object_class: impl Into<String>) -> Self {
        Self {
            dn: Dn::new(dn),
            guid: None,
            sid: None,
            object_class: object_class.into(),
            instance_type: INSTANCE_TYPE_WRITEABLE,
            critical: false,
            attributes: Vec::new(),
            acl: Vec::new(),
        }
    }

    pub fn with_sid(mut self, sid: Sid) -> Self {
        self.sid = Some(sid);
        self
    }

    pub fn with_guid(mut self, guid: Guid) -> Self {
        self.guid = Some(guid);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn instance_type(mut self, it: u32) -> Self {
        self.instance_type = it;
        self
    }

    pub fn attr(mut self, id: AttrId, values: Vec<Vec<u8>>) -> Self {
        self.attributes.push((id, values));
        self
    }

    pub fn attr_str(self, id: AttrId, value: &str) -> Self {
        self.attr(id, vec![value.as_bytes().to_vec()])
    }

    pub fn ace(mut self, sid: Sid, right: ControlRight) -> Self {
        self.acl.push(AclEntry { sid, right });
        self
    }
}

/// In-memory [`DirectoryStore`] implementation.
pub struct MemoryDirectory {
    state: Arc<Mutex<DirState>>,
    invocation_id: Guid,
}

impl MemoryDirectory {
    /// Create an empty store for the DSA with the given invocation id.
    pub fn new(invocation_id: Guid) -> Self {
        Self {
            state: Arc::new(Mutex::new(DirState {
                objects: HashMap::new(),
                usn: 0,
            })),
            invocation_id,
        }
    }

    /// Seed one object, stamping metadata and the sequence counter.
    ///
    /// The parent must already exist unless the object is a tree root
    /// (an NC head with no parent present in the store).
    pub async fn add_object(&self, new: NewObject) -> StoreResult<ObjectIdentifier> {
        let mut state = self.state.lock().await;

        let key = new.dn.key();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(new.dn.to_string()));
        }

        let parent_guid = match new.dn.parent() {
            Some(parent) => match state.objects.get(&parent.key()) {
                Some(p) => Some(p.id.guid),
                None if new.instance_type & INSTANCE_TYPE_NC_HEAD != 0 => None,
                None => return Err(StoreError::NotFound(parent.to_string())),
            },
            None => None,
        };

        state.usn += 1;
        let usn = state.usn;
        let guid = new.guid.unwrap_or_else(Guid::generate);
        let now = Utc::now().timestamp();

        let mut attributes: BTreeMap<AttrId, Vec<Vec<u8>>> = BTreeMap::new();
        attributes.insert(
            attrs::OBJECT_CLASS,
            vec![new.object_class.as_bytes().to_vec()],
        );
        attributes.insert(
            attrs::INSTANCE_TYPE,
            vec![new.instance_type.to_string().into_bytes()],
        );
        if let Some(rdn) = new.dn.rdn_value() {
            attributes.insert(attrs::NAME, vec![rdn.as_bytes().to_vec()]);
        }
        if new.critical {
            attributes.insert(attrs::IS_CRITICAL_SYSTEM_OBJECT, vec![b"TRUE".to_vec()]);
        }
        for (id, values) in new.attributes {
            attributes.insert(id, values);
        }

        let schema = AttributeSchema::global();
        let mut meta = MetadataVector::new();
        for id in attributes.keys() {
            if schema.is_replicated(*id) {
                meta.upsert(AttributeMetadata {
                    attr_id: *id,
                    version: 1,
                    originating_time: now,
                    originating_invocation_id: self.invocation_id,
                    originating_usn: usn,
                    local_usn: usn,
                });
            }
        }
        attributes.insert(attrs::REPL_METADATA, vec![meta.to_blob()]);

        let id = ObjectIdentifier {
            dn: new.dn.clone(),
            guid,
            sid: new.sid,
        };
        let object = DirectoryObject {
            id: id.clone(),
            parent_guid,
            instance_type: new.instance_type,
            usn_changed: usn,
            is_deleted: false,
            attributes,
            acl: new.acl,
        };
        state.objects.insert(key, object);
        Ok(id)
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn search(&self, req: &SearchRequest) -> StoreResult<Vec<DirectoryObject>> {
        let state = self.state.lock().await;

        let mut results: Vec<DirectoryObject> = state
            .objects
            .values()
            .filter(|obj| match req.scope {
                Scope::Base => obj.id.dn == req.base,
                Scope::OneLevel => obj.id.dn.is_child_of(&req.base),
                Scope::Subtree => obj.id.dn.is_under(&req.base),
            })
            .filter(|obj| {
                if obj.is_deleted && !(req.controls.show_deleted || req.controls.show_recycled) {
                    return false;
                }
                if let Some(floor) = req.filter.usn_above {
                    if obj.usn_changed <= floor {
                        return false;
                    }
                }
                if req.filter.critical_only && !obj.is_critical() {
                    return false;
                }
                if let Some(guid) = req.filter.object_guid {
                    if obj.id.guid != guid {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        if !req.controls.extended_dn {
            for obj in &mut results {
                obj.id.sid = None;
            }
        }
        if req.sort_by_dn {
            results.sort_by_key(|o| o.id.dn.key());
        }
        Ok(results)
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            invocation_id: self.invocation_id,
            ops: Vec::new(),
        }))
    }

    async fn highest_usn(&self) -> StoreResult<u64> {
        Ok(self.state.lock().await.usn)
    }

    fn invocation_id(&self) -> Guid {
        self.invocation_id
    }
}

/// Staged mutation inside a transaction.
enum PendingOp {
    ReplaceAttr {
        dn: Dn,
        attr: AttrId,
        values: Vec<Vec<u8>>,
    },
    Delete {
        dn: Dn,
    },
}

/// Single-writer transaction over the in-memory store.
///
/// Holding the owned guard for the transaction's lifetime is what makes the
/// store single-writer; transactions are expected to stay short-lived.
struct MemoryTransaction {
    guard: OwnedMutexGuard<DirState>,
    invocation_id: Guid,
    ops: Vec<PendingOp>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn object(&self, dn: &Dn) -> StoreResult<DirectoryObject> {
        self.guard
            .objects
            .get(&dn.key())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(dn.to_string()))
    }

    fn replace_attr(&mut self, dn: &Dn, attr: AttrId, values: Vec<Vec<u8>>) -> StoreResult<()> {
        if !self.guard.objects.contains_key(&dn.key()) {
            return Err(StoreError::NotFound(dn.to_string()));
        }
        self.ops.push(PendingOp::ReplaceAttr {
            dn: dn.clone(),
            attr,
            values,
        });
        Ok(())
    }

    fn delete_object(&mut self, dn: &Dn) -> StoreResult<()> {
        if !self.guard.objects.contains_key(&dn.key()) {
            return Err(StoreError::NotFound(dn.to_string()));
        }
        self.ops.push(PendingOp::Delete { dn: dn.clone() });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let schema = AttributeSchema::global();
        let invocation_id = self.invocation_id;
        let now = Utc::now().timestamp();

        let ops = std::mem::take(&mut self.ops);
        for op in ops {
            match op {
                PendingOp::ReplaceAttr { dn, attr, values } => {
                    self.guard.usn += 1;
                    let usn = self.guard.usn;
                    let obj = self
                        .guard
                        .objects
                        .get_mut(&dn.key())
                        .ok_or_else(|| StoreError::NotFound(dn.to_string()))?;
                    obj.attributes.insert(attr, values);
                    obj.usn_changed = usn;
                    if schema.is_replicated(attr) {
                        stamp_metadata(obj, attr, invocation_id, usn, now)?;
                    }
                }
                PendingOp::Delete { dn } => {
                    self.guard.usn += 1;
                    let usn = self.guard.usn;
                    let obj = self
                        .guard
                        .objects
                        .get_mut(&dn.key())
                        .ok_or_else(|| StoreError::NotFound(dn.to_string()))?;
                    obj.is_deleted = true;
                    obj.usn_changed = usn;
                    obj.attributes
                        .insert(attrs::IS_DELETED, vec![b"TRUE".to_vec()]);
                    stamp_metadata(obj, attrs::IS_DELETED, invocation_id, usn, now)?;
                }
            }
        }
        Ok(())
    }

    fn cancel(self: Box<Self>) {
        // Dropping the guard discards all staged operations.
    }
}

/// Bump one attribute's metadata entry after a local originating write.
fn stamp_metadata(
    obj: &mut DirectoryObject,
    attr: AttrId,
    invocation_id: Guid,
    usn: u64,
    now: i64,
) -> StoreResult<()> {
    let mut meta = obj
        .metadata()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let version = meta.get(attr).map(|m| m.version + 1).unwrap_or(1);
    meta.upsert(AttributeMetadata {
        attr_id: attr,
        version,
        originating_time: now,
        originating_invocation_id: invocation_id,
        originating_usn: usn,
        local_usn: usn,
    });
    obj.attributes
        .insert(attrs::REPL_METADATA, vec![meta.to_blob()]);
    Ok(())
}

/// Parameters for seeding a minimal forest into an empty store.
#[derive(Debug, Clone)]
pub struct ForestConfig {
    /// DN of the domain naming context root.
    pub nc: String,
    /// Site name.
    pub site_name: String,
    /// This server's name.
    pub server_name: String,
    /// This server's DNS host name.
    pub dns_name: String,
    /// Domain SID prefix.
    pub domain_sid: String,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            nc: "dc=example,dc=com".to_string(),
            site_name: "Default-First-Site".to_string(),
            server_name: "DSA1".to_string(),
            dns_name: "dsa1.example.com".to_string(),
            domain_sid: "S-1-5-21-1000-2000-3000".to_string(),
        }
    }
}

/// DNs and SIDs of the objects created by [`MemoryDirectory::bootstrap_forest`].
#[derive(Debug, Clone)]
pub struct ForestInfo {
    pub nc_root: Dn,
    pub config_nc: Dn,
    pub site_dn: Dn,
    pub settings_dn: Dn,
    pub domain_sid: Sid,
    pub admin_sid: Sid,
    pub dc_sid: Sid,
}

impl MemoryDirectory {
    /// Seed the minimal tree the replication service depends on: the domain
    /// NC root, a configuration partition head beneath it, the site and
    /// server objects, and a settings object carrying this DSA's invocation
    /// id and replication epoch.
    pub async fn bootstrap_forest(&self, cfg: &ForestConfig) -> StoreResult<ForestInfo> {
        let nc_root = Dn::new(&cfg.nc);
        let config_nc = Dn::new(format!("cn=configuration,{}", cfg.nc));
        let sites_dn = Dn::new(format!("cn=sites,{}", config_nc));
        let site_dn = Dn::new(format!("cn={},{}", cfg.site_name, sites_dn));
        let servers_dn = Dn::new(format!("cn=servers,{}", site_dn));
        let server_dn = Dn::new(format!("cn={},{}", cfg.server_name, servers_dn));
        let settings_dn = Dn::new(format!("cn=ntds settings,{}", server_dn));

        let domain_sid = Sid::new(&cfg.domain_sid);
        let admin_sid = Sid::new(format!("{}-500", cfg.domain_sid));
        let dc_sid = Sid::new(format!("{}-1000", cfg.domain_sid));

        self.add_object(
            NewObject::container(nc_root.as_str(), "domainDNS")
                .instance_type(INSTANCE_TYPE_NC_HEAD | INSTANCE_TYPE_WRITEABLE)
                .critical()
                .ace(admin_sid.clone(), ControlRight::ManageTopology)
                .ace(admin_sid.clone(), ControlRight::ReplicateChanges)
                .ace(admin_sid.clone(), ControlRight::ReplicateSecrets)
                .ace(dc_sid.clone(), ControlRight::ManageTopology)
                .ace(dc_sid.clone(), ControlRight::ReplicateChanges)
                .ace(dc_sid.clone(), ControlRight::ReplicateSecrets),
        )
        .await?;

        // Subordinate partition head directly beneath the domain NC.
        self.add_object(
            NewObject::container(config_nc.as_str(), "configuration")
                .instance_type(INSTANCE_TYPE_NC_HEAD | INSTANCE_TYPE_WRITEABLE)
                .critical(),
        )
        .await?;

        self.add_object(NewObject::container(sites_dn.as_str(), "sitesContainer").critical())
            .await?;
        self.add_object(NewObject::container(site_dn.as_str(), "site").critical())
            .await?;
        self.add_object(NewObject::container(servers_dn.as_str(), "serversContainer"))
            .await?;
        self.add_object(
            NewObject::container(server_dn.as_str(), "server")
                .attr_str(attrs::DNS_HOST_NAME, &cfg.dns_name),
        )
        .await?;
        self.add_object(
            NewObject::container(settings_dn.as_str(), "nTDSDSA")
                .critical()
                .attr_str(attrs::INVOCATION_ID, &self.invocation_id.to_string())
                .attr_str(attrs::REPLICATION_EPOCH, "0")
                .attr_str(attrs::OPTIONS, "1"),
        )
        .await?;

        Ok(ForestInfo {
            nc_root,
            config_nc,
            site_dn,
            settings_dn,
            domain_sid,
            admin_sid,
            dc_sid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SearchControls, SearchFilter};

    async fn seeded() -> (MemoryDirectory, ForestInfo) {
        let store = MemoryDirectory::new(Guid::generate());
        let info = store
            .bootstrap_forest(&ForestConfig::default())
            .await
            .unwrap();
        (store, info)
    }

    #[tokio::test]
    async fn test_bootstrap_creates_tree() {
        let (store, info) = seeded().await;
        let root = store.object_by_dn(&info.nc_root).await.unwrap();
        assert!(root.is_nc_head());
        assert!(root.parent_guid.is_none());

        let settings = store.object_by_dn(&info.settings_dn).await.unwrap();
        assert!(settings.parent_guid.is_some());
        assert_eq!(
            settings.attr_str(attrs::REPLICATION_EPOCH).as_deref(),
            Some("0")
        );
    }

    #[tokio::test]
    async fn test_add_requires_parent() {
        let (store, _) = seeded().await;
        let err = store
            .add_object(NewObject::container(
                "cn=orphan,ou=missing,dc=example,dc=com",
                "container",
            ))
            .await;
        assert!(matches!(err, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_search_scopes() {
        let (store, info) = seeded().await;

        let base = store
            .search(&SearchRequest::base_object(info.nc_root.clone()))
            .await
            .unwrap();
        assert_eq!(base.len(), 1);

        let subtree = store
            .search(&SearchRequest {
                base: info.nc_root.clone(),
                scope: Scope::Subtree,
                filter: SearchFilter::default(),
                controls: SearchControls {
                    extended_dn: true,
                    show_deleted: true,
                    show_recycled: true,
                },
                sort_by_dn: true,
            })
            .await
            .unwrap();
        assert!(subtree.len() >= 7);
        // Deterministic DN order.
        let keys: Vec<String> = subtree.iter().map(|o| o.id.dn.key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn test_usn_filter_and_critical_filter() {
        let (store, info) = seeded().await;
        let floor = store.highest_usn().await.unwrap();

        store
            .add_object(
                NewObject::container(format!("cn=users,{}", info.nc_root), "container").critical(),
            )
            .await
            .unwrap();
        store
            .add_object(NewObject::container(
                format!("cn=plain,{}", info.nc_root),
                "container",
            ))
            .await
            .unwrap();

        let changed = store
            .search(&SearchRequest {
                base: info.nc_root.clone(),
                scope: Scope::Subtree,
                filter: SearchFilter {
                    usn_above: Some(floor),
                    ..Default::default()
                },
                controls: SearchControls::default(),
                sort_by_dn: true,
            })
            .await
            .unwrap();
        assert_eq!(changed.len(), 2);

        let critical = store
            .search(&SearchRequest {
                base: info.nc_root.clone(),
                scope: Scope::Subtree,
                filter: SearchFilter {
                    usn_above: Some(floor),
                    critical_only: true,
                    ..Default::default()
                },
                controls: SearchControls::default(),
                sort_by_dn: true,
            })
            .await
            .unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].id.dn.rdn_value(), Some("users"));
    }

    #[tokio::test]
    async fn test_transaction_commit_stamps_metadata() {
        let (store, info) = seeded().await;
        let before = store.object_by_dn(&info.nc_root).await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.replace_attr(
            &info.nc_root,
            attrs::DESCRIPTION,
            vec![b"primary naming context".to_vec()],
        )
        .unwrap();
        txn.commit().await.unwrap();

        let after = store.object_by_dn(&info.nc_root).await.unwrap();
        assert!(after.usn_changed > before.usn_changed);
        let meta = after.metadata().unwrap();
        let entry = meta.get(attrs::DESCRIPTION).unwrap();
        assert_eq!(entry.local_usn, after.usn_changed);
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn test_transaction_cancel_discards() {
        let (store, info) = seeded().await;
        let before = store.highest_usn().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.replace_attr(&info.nc_root, attrs::DESCRIPTION, vec![b"x".to_vec()])
            .unwrap();
        txn.cancel();

        assert_eq!(store.highest_usn().await.unwrap(), before);
        let root = store.object_by_dn(&info.nc_root).await.unwrap();
        assert!(root.attr(attrs::DESCRIPTION).is_none());
    }

    #[tokio::test]
    async fn test_tombstone_visibility() {
        let (store, info) = seeded().await;
        let victim = Dn::new(format!("cn=victim,{}", info.nc_root));
        store
            .add_object(NewObject::container(victim.as_str(), "container"))
            .await
            .unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.delete_object(&victim).unwrap();
        txn.commit().await.unwrap();

        // Hidden from a plain search, visible with show-deleted.
        let mut plain = SearchRequest::base_object(victim.clone());
        plain.controls.show_deleted = false;
        assert!(store.search(&plain).await.unwrap().is_empty());

        let obj = store.object_by_dn(&victim).await.unwrap();
        assert!(obj.is_deleted);
        assert_eq!(obj.attr_first(attrs::IS_DELETED), Some(b"TRUE".as_slice()));
    }

    #[tokio::test]
    async fn test_object_by_guid() {
        let (store, info) = seeded().await;
        let site = store.object_by_dn(&info.site_dn).await.unwrap();
        let found = store
            .object_by_guid(&info.nc_root, site.id.guid)
            .await
            .unwrap();
        assert_eq!(found.id.dn, info.site_dn);
    }
}
