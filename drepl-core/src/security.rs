//! Caller authorization for replication operations.
//!
//! Two gate forms: a token-level check (optionally scoped to a domain SID)
//! and a directory-level extended-right check against a specific object's
//! ACL. Every mutating operation and the read-replication entry point runs
//! one of these before touching any state.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ReplError, ReplResult};
use crate::ident::{Dn, Sid};
use crate::store::{ControlRight, DirectoryStore, SearchRequest, StoreError};

/// Privilege level derived from a caller's security token.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum SecurityLevel {
    #[default]
    Anonymous,
    User,
    DomainController,
    Administrator,
    System,
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SecurityLevel::Anonymous => "anonymous",
            SecurityLevel::User => "user",
            SecurityLevel::DomainController => "domain-controller",
            SecurityLevel::Administrator => "administrator",
            SecurityLevel::System => "system",
        };
        write!(f, "{}", s)
    }
}

/// A caller's security token as presented by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityToken {
    /// Account name, for audit logs.
    pub account: String,
    /// The caller's own SID.
    pub user_sid: Sid,
    /// Group SIDs the caller holds.
    pub group_sids: Vec<Sid>,
    /// Privilege level.
    pub level: SecurityLevel,
}

impl SecurityToken {
    /// The token used for the local system itself.
    pub fn system() -> Self {
        Self {
            account: "SYSTEM".to_string(),
            user_sid: Sid::new("S-1-5-18"),
            group_sids: Vec::new(),
            level: SecurityLevel::System,
        }
    }

    /// All SIDs the token carries, own SID first.
    pub fn sids(&self) -> impl Iterator<Item = &Sid> {
        std::iter::once(&self.user_sid).chain(self.group_sids.iter())
    }
}

impl std::fmt::Display for SecurityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "account={} sid={} level={} groups=[{}]",
            self.account,
            self.user_sid,
            self.level,
            self.group_sids
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

/// Gate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Disable all checks. Exists for test setups only and defaults to off.
    #[serde(default)]
    pub disable_security_check: bool,
}

/// Authorizes callers by token level and/or object ACL.
#[derive(Debug, Clone, Default)]
pub struct SecurityGate {
    config: GateConfig,
}

impl SecurityGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Require at least `min_level`, optionally also requiring the caller's
    /// SID to belong to `domain_sid`.
    pub fn authorize(
        &self,
        token: &SecurityToken,
        min_level: SecurityLevel,
        domain_sid: Option<&Sid>,
    ) -> ReplResult<()> {
        if self.config.disable_security_check {
            debug!("security check disabled by configuration");
            return Ok(());
        }
        if token.level < min_level {
            warn!(
                "authorization failed: required level {}, caller token: {}",
                min_level, token
            );
            return Err(ReplError::AccessDenied);
        }
        if let Some(domain) = domain_sid {
            if token.level < SecurityLevel::System && !token.user_sid.in_domain(domain) {
                warn!(
                    "authorization failed: caller outside domain {}, caller token: {}",
                    domain, token
                );
                return Err(ReplError::AccessDenied);
            }
        }
        Ok(())
    }

    /// Require a named extended right on a specific object.
    ///
    /// On denial the caller's full token is logged and a detail-free
    /// `AccessDenied` is returned.
    pub async fn authorize_on_object(
        &self,
        store: &dyn DirectoryStore,
        token: &SecurityToken,
        object_dn: &Dn,
        right: ControlRight,
    ) -> ReplResult<()> {
        if self.config.disable_security_check {
            debug!("security check disabled by configuration");
            return Ok(());
        }
        if token.level >= SecurityLevel::System {
            return Ok(());
        }

        let object = match store.search(&SearchRequest::base_object(object_dn.clone())).await {
            Ok(mut found) => match found.len() {
                1 => found.remove(0),
                0 => {
                    return Err(ReplError::Internal(format!(
                        "access check target missing: {}",
                        object_dn
                    )))
                }
                _ => {
                    return Err(ReplError::Internal(format!(
                        "access check target ambiguous: {}",
                        object_dn
                    )))
                }
            },
            Err(StoreError::NotFound(dn)) => {
                return Err(ReplError::Internal(format!(
                    "access check target missing: {}",
                    dn
                )))
            }
            Err(e) => {
                return Err(ReplError::Internal(format!(
                    "access check on {} failed: {}",
                    object_dn, e
                )))
            }
        };

        let granted = object
            .acl
            .iter()
            .any(|ace| ace.right == right && token.sids().any(|sid| *sid == ace.sid));
        if granted {
            Ok(())
        } else {
            warn!(
                "extended right {} denied on {}, caller token: {}",
                right, object_dn, token
            );
            Err(ReplError::AccessDenied)
        }
    }
}
