//! Attribute schema for replicated objects.
//!
//! A fixed table mapping attribute ids to their directory names and
//! replication behaviour: which attributes are structural, which carry the
//! naming RDN, and which belong to the closed secret set that is never
//! shipped in the clear.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Numeric attribute identifier used on the wire and in stored metadata.
pub type AttrId = u32;

/// Well-known attribute ids.
pub mod attrs {
    use super::AttrId;

    /// Object class chain.
    pub const OBJECT_CLASS: AttrId = 0x0002_0000;
    /// Structural tree-position flags; always retained in change pages.
    pub const INSTANCE_TYPE: AttrId = 0x0002_0001;
    /// Naming (RDN) attribute; never shipped in change pages.
    pub const NAME: AttrId = 0x0002_0002;
    /// Deletion marker for tombstoned objects.
    pub const IS_DELETED: AttrId = 0x0002_0003;
    /// Marks objects required for a functional replica.
    pub const IS_CRITICAL_SYSTEM_OBJECT: AttrId = 0x0002_0004;
    /// Free-form description.
    pub const DESCRIPTION: AttrId = 0x0002_0005;
    /// Registered service principal names of an account.
    pub const SERVICE_PRINCIPAL_NAME: AttrId = 0x0002_0006;
    /// DNS host name of a server object.
    pub const DNS_HOST_NAME: AttrId = 0x0002_0007;
    /// Per-DSA invocation id stored on a settings object.
    pub const INVOCATION_ID: AttrId = 0x0002_0008;
    /// Behaviour options bitmask on a settings object.
    pub const OPTIONS: AttrId = 0x0002_0009;
    /// Replication epoch stamped on a settings object.
    pub const REPLICATION_EPOCH: AttrId = 0x0002_000a;

    // Closed secret set. Values are zeroed when secret processing is
    // requested and otherwise encrypted under the session key.
    pub const UNICODE_PWD: AttrId = 0x0009_0001;
    pub const NT_PWD_HISTORY: AttrId = 0x0009_0002;
    pub const LM_PWD_HISTORY: AttrId = 0x0009_0003;
    pub const SUPPLEMENTAL_CREDENTIALS: AttrId = 0x0009_0004;
    pub const TRUST_AUTH_INCOMING: AttrId = 0x0009_0005;
    pub const TRUST_AUTH_OUTGOING: AttrId = 0x0009_0006;
    pub const CURRENT_VALUE: AttrId = 0x0009_0007;
    pub const PRIOR_VALUE: AttrId = 0x0009_0008;
    pub const INITIAL_AUTH_INCOMING: AttrId = 0x0009_0009;
    pub const INITIAL_AUTH_OUTGOING: AttrId = 0x0009_000a;

    // Replication bookkeeping attributes on NC roots. Never included in
    // change pages; read and written by the engine itself.
    pub const PARTNER_LINKS: AttrId = 0x000b_0001;
    pub const UP_TO_DATE_VECTOR: AttrId = 0x000b_0002;
    /// Per-attribute replication metadata blob present on every object.
    pub const REPL_METADATA: AttrId = 0x000b_0003;
}

/// Definition of a single schema attribute.
#[derive(Debug, Clone)]
pub struct AttrDef {
    /// Numeric id.
    pub id: AttrId,
    /// Directory name.
    pub name: &'static str,
    /// Member of the closed secret set.
    pub secret: bool,
    /// Included in change pages when changed.
    pub replicated: bool,
}

/// The fixed attribute schema.
pub struct AttributeSchema {
    by_id: HashMap<AttrId, AttrDef>,
    by_name: HashMap<&'static str, AttrId>,
}

impl AttributeSchema {
    fn build() -> Self {
        use attrs::*;

        let defs = [
            def(OBJECT_CLASS, "objectClass", false, true),
            def(INSTANCE_TYPE, "instanceType", false, true),
            def(NAME, "name", false, true),
            def(IS_DELETED, "isDeleted", false, true),
            def(
                IS_CRITICAL_SYSTEM_OBJECT,
                "isCriticalSystemObject",
                false,
                true,
            ),
            def(DESCRIPTION, "description", false, true),
            def(SERVICE_PRINCIPAL_NAME, "servicePrincipalName", false, true),
            def(DNS_HOST_NAME, "dNSHostName", false, true),
            def(INVOCATION_ID, "invocationId", false, true),
            def(OPTIONS, "options", false, true),
            def(REPLICATION_EPOCH, "replicationEpoch", false, true),
            def(UNICODE_PWD, "unicodePwd", true, true),
            def(NT_PWD_HISTORY, "ntPwdHistory", true, true),
            def(LM_PWD_HISTORY, "lmPwdHistory", true, true),
            def(
                SUPPLEMENTAL_CREDENTIALS,
                "supplementalCredentials",
                true,
                true,
            ),
            def(TRUST_AUTH_INCOMING, "trustAuthIncoming", true, true),
            def(TRUST_AUTH_OUTGOING, "trustAuthOutgoing", true, true),
            def(CURRENT_VALUE, "currentValue", true, true),
            def(PRIOR_VALUE, "priorValue", true, true),
            def(INITIAL_AUTH_INCOMING, "initialAuthIncoming", true, true),
            def(INITIAL_AUTH_OUTGOING, "initialAuthOutgoing", true, true),
            def(PARTNER_LINKS, "partnerLinks", false, false),
            def(UP_TO_DATE_VECTOR, "upToDateVector", false, false),
            def(REPL_METADATA, "replAttributeMetaData", false, false),
        ];

        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for d in defs {
            by_name.insert(d.name, d.id);
            by_id.insert(d.id, d);
        }
        Self { by_id, by_name }
    }

    /// The process-wide schema instance.
    pub fn global() -> &'static AttributeSchema {
        static SCHEMA: OnceLock<AttributeSchema> = OnceLock::new();
        SCHEMA.get_or_init(AttributeSchema::build)
    }

    /// Look up a definition by id.
    pub fn get(&self, id: AttrId) -> Option<&AttrDef> {
        self.by_id.get(&id)
    }

    /// Look up an attribute id by directory name.
    pub fn id_of(&self, name: &str) -> Option<AttrId> {
        self.by_name.get(name).copied()
    }

    /// Directory name for an id, or a hex placeholder for unknown ids.
    pub fn name_of(&self, id: AttrId) -> String {
        match self.by_id.get(&id) {
            Some(d) => d.name.to_string(),
            None => format!("attr-{:08x}", id),
        }
    }

    /// Whether the attribute is in the closed secret set.
    pub fn is_secret(&self, id: AttrId) -> bool {
        self.by_id.get(&id).map(|d| d.secret).unwrap_or(false)
    }

    /// Whether the attribute is shipped in change pages.
    pub fn is_replicated(&self, id: AttrId) -> bool {
        self.by_id.get(&id).map(|d| d.replicated).unwrap_or(true)
    }
}

fn def(id: AttrId, name: &'static str, secret: bool, replicated: bool) -> AttrDef {
    AttrDef {
        id,
        name,
        secret,
        replicated,
    }
}
