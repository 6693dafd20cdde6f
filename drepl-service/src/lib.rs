//! Drepl replication service.
//!
//! Implements the directory replication call surface:
//! - Session bind/unbind and the handle table
//! - Paged change enumeration (GetNCChanges)
//! - Replication partner reference management (UpdateRefs)
//! - Forwarded operations (ReplicaSync, ExecuteKCC)
//! - State reports, name translation, SPN and server maintenance
//!
//! Each call arrives as a [`messages::CallEnvelope`] from the transport and
//! is dispatched exactly once; the reply envelope always carries one status.

pub mod bind;
pub mod forward;
pub mod getncchanges;
pub mod handle;
pub mod messages;
pub mod ops;
pub mod updaterefs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use drepl_core::{
    Dn, DirectoryStore, ForestInfo, GateConfig, ReplError, SecurityGate, SecurityLevel,
    SecurityToken, WireStatus,
};

use crate::forward::SyncExecutor;
use crate::handle::HandleTable;
use crate::messages::{flags, DrsReply, DrsRequest, ReplyEnvelope};

/// Service configuration stored at `drepl-config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// DN of this server's site object.
    pub site_dn: String,
    /// DN of this server's settings object.
    pub settings_dn: String,
    /// Default NC used for GUID-based name resolution.
    pub default_nc: String,
    /// Per-call object cap for change enumeration.
    pub max_objects_per_call: u32,
    /// Bounded wait for forwarded calls whose caller did not opt into
    /// asynchronous semantics.
    pub forward_timeout_secs: u64,
    /// Server secret folded into per-session sealing keys.
    pub session_secret: String,
    /// Security gate configuration.
    #[serde(default)]
    pub gate: GateConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            site_dn: "cn=Default-First-Site,cn=sites,cn=configuration,dc=example,dc=com"
                .to_string(),
            settings_dn:
                "cn=ntds settings,cn=DSA1,cn=servers,cn=Default-First-Site,cn=sites,cn=configuration,dc=example,dc=com"
                    .to_string(),
            default_nc: "dc=example,dc=com".to_string(),
            max_objects_per_call: 256,
            forward_timeout_secs: 30,
            session_secret: "drepl-dev-secret".to_string(),
            gate: GateConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Configuration pointing at the objects a forest bootstrap created.
    pub fn for_forest(info: &ForestInfo) -> Self {
        Self {
            site_dn: info.site_dn.to_string(),
            settings_dn: info.settings_dn.to_string(),
            default_nc: info.nc_root.to_string(),
            ..Default::default()
        }
    }

    /// Load service config from a directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("drepl-config.json");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read service config from {:?}", config_path))?;
        let config: ServiceConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse service config JSON")?;
        Ok(config)
    }

    /// Save service config to a directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join("drepl-config.json");
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn site_dn(&self) -> Dn {
        Dn::new(&self.site_dn)
    }

    pub fn settings_dn(&self) -> Dn {
        Dn::new(&self.settings_dn)
    }

    pub fn default_nc(&self) -> Dn {
        Dn::new(&self.default_nc)
    }
}

/// The replication service: one instance per server process.
pub struct ReplicationService {
    pub(crate) store: Arc<dyn DirectoryStore>,
    pub(crate) config: ServiceConfig,
    pub(crate) gate: SecurityGate,
    pub(crate) handles: HandleTable,
    executor: SyncExecutor,
}

impl ReplicationService {
    /// Build the service and spawn its sync executor.
    pub fn new(store: Arc<dyn DirectoryStore>, config: ServiceConfig) -> Self {
        let gate = SecurityGate::new(config.gate.clone());
        let executor = SyncExecutor::spawn(Arc::clone(&store));
        Self {
            store,
            config,
            gate,
            handles: HandleTable::new(),
            executor,
        }
    }

    pub(crate) fn gate_disabled(&self) -> bool {
        self.config.gate.disable_security_check
    }

    /// Number of live binds, for diagnostics.
    pub async fn live_binds(&self) -> usize {
        self.handles.len().await
    }

    /// Drop every bind owned by a departing caller (connection teardown).
    pub async fn teardown_for(&self, token: &SecurityToken) -> usize {
        self.handles.remove_all_for(&token.user_sid).await
    }

    /// Service one call and produce its reply envelope.
    pub async fn dispatch(&self, token: &SecurityToken, request: DrsRequest) -> ReplyEnvelope {
        let op = request.name();
        debug!("dispatching {} for {}", op, token.account);

        let outcome: Result<DrsReply, ReplError> = match request {
            DrsRequest::Bind(req) => bind::bind(self, token, req).await.map(DrsReply::Bind),
            DrsRequest::Unbind(req) => bind::unbind(self, token, req)
                .await
                .map(|()| DrsReply::Unbind),
            DrsRequest::GetChanges(req) => getncchanges::get_changes(self, token, req)
                .await
                .map(DrsReply::GetChanges),
            DrsRequest::UpdateRefs(req) => updaterefs::update_refs(self, token, req)
                .await
                .map(|()| DrsReply::UpdateRefs),
            DrsRequest::ReplicaSync(req) => self.replica_sync(token, req).await,
            DrsRequest::ExecuteKcc(req) => self.execute_kcc(token, req).await,
            DrsRequest::GetReplInfo(req) => ops::get_repl_info(self, token, req)
                .await
                .map(DrsReply::GetReplInfo),
            DrsRequest::CrackNames(req) => ops::crack_names(self, token, req)
                .await
                .map(DrsReply::CrackNames),
            DrsRequest::WriteSpn(req) => ops::write_spn(self, token, req)
                .await
                .map(|()| DrsReply::WriteSpn),
            DrsRequest::RemoveServer(req) => ops::remove_server(self, token, req)
                .await
                .map(|()| DrsReply::RemoveServer),
        };

        match outcome {
            Ok(reply) => ReplyEnvelope::ok(reply),
            Err(e) => {
                warn!("{} failed: {}", op, e);
                ReplyEnvelope::failed(e.status())
            }
        }
    }

    /// Trigger-immediate-sync: forwarded to the sync executor, replied to
    /// exactly once when the completion callback fires.
    async fn replica_sync(
        &self,
        token: &SecurityToken,
        req: messages::ReplicaSyncRequest,
    ) -> Result<DrsReply, ReplError> {
        let entry = self.handles.get(req.handle, token).await?;
        let _call = entry.begin_call()?;
        self.gate
            .authorize(token, SecurityLevel::DomainController, None)?;

        let async_op = req.flags & flags::ASYNC_OP != 0;
        let status = self
            .executor
            .forward_sync(
                req.nc,
                req.source_dsa,
                async_op,
                Duration::from_secs(self.config.forward_timeout_secs),
            )
            .await?;
        match status {
            WireStatus::Ok => Ok(DrsReply::ReplicaSync),
            WireStatus::NotFound => Err(ReplError::NotFound("sync target NC".into())),
            other => Err(ReplError::Internal(format!(
                "forwarded sync completed with status {}",
                other
            ))),
        }
    }

    /// Topology recalculation: forwarded like replica sync.
    async fn execute_kcc(
        &self,
        token: &SecurityToken,
        req: messages::ExecuteKccRequest,
    ) -> Result<DrsReply, ReplError> {
        let entry = self.handles.get(req.handle, token).await?;
        let _call = entry.begin_call()?;
        self.gate
            .authorize(token, SecurityLevel::Administrator, None)?;

        let async_op = req.flags & flags::ASYNC_OP != 0;
        let status = self
            .executor
            .forward_topology_check(
                async_op,
                Duration::from_secs(self.config.forward_timeout_secs),
            )
            .await?;
        match status {
            WireStatus::Ok => Ok(DrsReply::ExecuteKcc),
            other => Err(ReplError::Internal(format!(
                "topology check completed with status {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.max_objects_per_call, 256);
        assert!(!config.gate.disable_security_check);
        assert_eq!(config.default_nc(), Dn::new("DC=EXAMPLE,DC=COM"));
    }

    #[test]
    fn test_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = ServiceConfig {
            max_objects_per_call: 64,
            forward_timeout_secs: 5,
            ..Default::default()
        };
        config.save(tmp.path()).unwrap();
        let loaded = ServiceConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded.max_objects_per_call, 64);
        assert_eq!(loaded.forward_timeout_secs, 5);
    }

    #[test]
    fn test_config_load_missing_is_default() {
        let tmp = tempfile::TempDir::new().unwrap();
        let loaded = ServiceConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded.max_objects_per_call, 256);
    }
}
