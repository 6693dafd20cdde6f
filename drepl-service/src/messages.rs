//! Wire protocol definitions for the replication service.
//!
//! Each operation is a fixed, versioned binary request/response pair carried
//! in a length-prefixed bincode envelope. NDR-style marshalling proper is the
//! transport's concern, not this crate's; these types are the stable call
//! surface the transport delivers to.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use drepl_core::metadata::AttributeMetadata;
use drepl_core::{
    Dn, Guid, ObjectIdentifier, SecurityToken, UpToDateVector, WireAttribute, WireStatus,
};

/// Protocol version constant.
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for the replication wire protocol.
pub const PROTOCOL_MAGIC: &[u8; 4] = b"DRPL";

/// Maximum single message size (64 MB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Capability bits negotiated at bind time.
pub mod caps {
    /// Baseline protocol support.
    pub const BASE: u32 = 0x0000_0001;
    /// Identifiers carry SIDs.
    pub const EXTENDED_IDENTIFIERS: u32 = 0x0000_0002;
    /// Critical-objects-only enumeration.
    pub const CRITICAL_ONLY: u32 = 0x0000_0004;
    /// Secret redaction on request.
    pub const SECRET_PROCESSING: u32 = 0x0000_0008;
    /// Forwarded operations may complete asynchronously.
    pub const ASYNC_FORWARDING: u32 = 0x0000_0010;
    /// Compressed reply envelopes.
    pub const COMPRESSED_REPLIES: u32 = 0x0000_0020;

    /// The fixed capability set this server advertises.
    pub const LOCAL: u32 = BASE
        | EXTENDED_IDENTIFIERS
        | CRITICAL_ONLY
        | SECRET_PROCESSING
        | ASYNC_FORWARDING
        | COMPRESSED_REPLIES;
}

/// Request flag bits.
pub mod flags {
    /// Restrict enumeration to critical system objects.
    pub const CRITICAL_ONLY: u32 = 0x0000_0001;
    /// Zero secret-set attributes instead of shipping them sealed.
    pub const SPECIAL_SECRET_PROCESSING: u32 = 0x0000_0002;
    /// Caller opted into asynchronous completion of forwarded calls.
    pub const ASYNC_OP: u32 = 0x0000_0004;
    /// Add a replication partner reference.
    pub const ADD_REF: u32 = 0x0000_0008;
    /// Remove a replication partner reference.
    pub const DEL_REF: u32 = 0x0000_0010;
    /// The partner also wants global-catalog SPN maintenance.
    pub const GCSPN: u32 = 0x0000_0020;
    /// Tolerate already-present/already-absent reference states.
    pub const CHECK: u32 = 0x0000_0040;
    /// The destination holds a writeable replica.
    pub const WRITEABLE: u32 = 0x0000_0080;

    /// Bits that steer `UpdateRefs` itself and are never stored on a link.
    pub const REF_CONTROL_BITS: u32 = ADD_REF | DEL_REF | CHECK;
}

/// Request structure levels accepted by the change-enumeration entry point.
pub const GETCHANGES_LEVELS: &[u32] = &[8, 10];

/// Name formats understood by `CrackNames`.
pub mod name_format {
    /// Hyphenated object GUID string.
    pub const GUID: u32 = 1;
    /// Distinguished name.
    pub const DN: u32 = 2;
    /// Canonical `domain.tld/Container/Leaf` form.
    pub const CANONICAL: u32 = 3;
}

/// Info types understood by `GetReplInfo`.
pub mod info_type {
    /// Replication partner references of an NC.
    pub const NEIGHBORS: u32 = 0;
    /// Up-to-date vector cursors of an NC.
    pub const CURSORS: u32 = 1;
}

/// Client-asserted bind information. Both the compact and the extended wire
/// shape are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientInfo {
    Compact {
        caps: u32,
        site_guid: Guid,
        pid: u32,
    },
    Extended {
        caps: u32,
        site_guid: Guid,
        pid: u32,
        ext_flags: u32,
        config_dn: Option<String>,
    },
}

impl ClientInfo {
    pub fn caps(&self) -> u32 {
        match self {
            ClientInfo::Compact { caps, .. } | ClientInfo::Extended { caps, .. } => *caps,
        }
    }

    pub fn site_guid(&self) -> Guid {
        match self {
            ClientInfo::Compact { site_guid, .. } | ClientInfo::Extended { site_guid, .. } => {
                *site_guid
            }
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            ClientInfo::Compact { pid, .. } | ClientInfo::Extended { pid, .. } => *pid,
        }
    }
}

/// Session bind request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindRequest {
    /// Caller's bind GUID.
    pub bind_guid: Guid,
    /// Asserted capability/site/process information.
    pub info: ClientInfo,
}

/// Session bind reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindResponse {
    /// Opaque handle for subsequent calls, scoped to the caller's token.
    pub handle: Guid,
    /// Server's bind GUID.
    pub bind_guid: Guid,
    /// Server capability bitmask.
    pub server_caps: u32,
    /// GUID of the server's site object.
    pub site_guid: Guid,
    /// Server replication epoch.
    pub repl_epoch: u32,
}

/// Session unbind request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnbindRequest {
    pub handle: Guid,
}

/// Paged change-enumeration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChangesRequest {
    pub handle: Guid,
    /// Request structure level.
    pub level: u32,
    /// Target NC root. Required.
    pub nc: Option<ObjectIdentifier>,
    /// Partner's highest already-known sequence number for this NC.
    pub low_watermark: u64,
    /// Partner's up-to-date vector. Carried for wire fidelity.
    pub partner_udv: Option<UpToDateVector>,
    /// `flags::*` bits.
    pub flags: u32,
    /// Restrict the enumeration to a single object.
    pub single_object: Option<Guid>,
    /// Per-call object cap; 0 selects the server default.
    pub max_objects: u32,
}

/// One object in a change page. The attribute and metadata arrays are the
/// same length and co-indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatedObject {
    pub identifier: ObjectIdentifier,
    pub is_nc_root: bool,
    /// Absent only for the NC root.
    pub parent_guid: Option<Guid>,
    pub attributes: Vec<WireAttribute>,
    pub metadata: Vec<AttributeMetadata>,
}

impl ReplicatedObject {
    pub fn new(identifier: ObjectIdentifier, is_nc_root: bool, parent_guid: Option<Guid>) -> Self {
        Self {
            identifier,
            is_nc_root,
            parent_guid,
            attributes: Vec::new(),
            metadata: Vec::new(),
        }
    }

    /// Append one attribute with its metadata, preserving co-indexing.
    pub fn push(&mut self, attr: WireAttribute, meta: AttributeMetadata) {
        self.attributes.push(attr);
        self.metadata.push(meta);
    }
}

/// Change-enumeration reply page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChangesResponse {
    /// Invocation id of this source DSA.
    pub source_invocation_id: Guid,
    /// Identifier of the NC root.
    pub nc: ObjectIdentifier,
    /// The page.
    pub objects: Vec<ReplicatedObject>,
    /// More objects remain; call again with the same NC.
    pub more_data: bool,
    /// Highest sequence number covered so far (committed at exhaustion).
    pub new_high_watermark: u64,
    /// Present only on the final page of a drain.
    pub up_to_date_vector: Option<UpToDateVector>,
}

/// One stored replication partner reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationLink {
    /// Destination DSA GUID. Unique within one NC's link set.
    pub dest_guid: Guid,
    /// Destination DSA DNS name.
    pub dest_dns_name: String,
    /// Stored flag bits (control bits stripped).
    pub flags: u32,
}

/// Replication partner reference update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRefsRequest {
    pub handle: Guid,
    /// NC whose link set is updated.
    pub nc: Dn,
    pub dest_guid: Guid,
    pub dest_dns_name: String,
    /// `flags::*` bits; must include `ADD_REF` and/or `DEL_REF`.
    pub flags: u32,
}

/// Trigger-immediate-sync request, forwarded to the sync executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSyncRequest {
    pub handle: Guid,
    pub nc: Dn,
    /// Pull from this source DSA only.
    pub source_dsa: Option<Guid>,
    pub flags: u32,
}

/// Topology-recalculation request, forwarded to the sync executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteKccRequest {
    pub handle: Guid,
    pub flags: u32,
}

/// Replication state report request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReplInfoRequest {
    pub handle: Guid,
    /// `info_type::*` selector.
    pub info_type: u32,
    pub nc: Dn,
}

/// Replication state report payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplInfo {
    Neighbors(Vec<ReplicationLink>),
    Cursors(UpToDateVector),
}

/// Name translation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrackNamesRequest {
    pub handle: Guid,
    /// `name_format::*` of the inputs.
    pub format_offered: u32,
    /// `name_format::*` of the outputs.
    pub format_desired: u32,
    pub names: Vec<String>,
}

/// Per-name translation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrackedName {
    pub status: WireStatus,
    pub result: Option<String>,
}

/// Name translation reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrackNamesResponse {
    pub answers: Vec<CrackedName>,
}

/// SPN maintenance operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpnOperation {
    Add,
    Replace,
    Delete,
}

/// SPN maintenance request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteSpnRequest {
    pub handle: Guid,
    pub operation: SpnOperation,
    /// DN of the target account object.
    pub account_dn: Dn,
    pub spns: Vec<String>,
}

/// Retired-server removal request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveServerRequest {
    pub handle: Guid,
    /// DN of the server object to retire.
    pub server_dn: Dn,
}

/// Tagged union of all request bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DrsRequest {
    Bind(BindRequest),
    Unbind(UnbindRequest),
    GetChanges(GetChangesRequest),
    UpdateRefs(UpdateRefsRequest),
    ReplicaSync(ReplicaSyncRequest),
    ExecuteKcc(ExecuteKccRequest),
    GetReplInfo(GetReplInfoRequest),
    CrackNames(CrackNamesRequest),
    WriteSpn(WriteSpnRequest),
    RemoveServer(RemoveServerRequest),
}

impl DrsRequest {
    /// Operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            DrsRequest::Bind(_) => "Bind",
            DrsRequest::Unbind(_) => "Unbind",
            DrsRequest::GetChanges(_) => "GetNCChanges",
            DrsRequest::UpdateRefs(_) => "UpdateRefs",
            DrsRequest::ReplicaSync(_) => "ReplicaSync",
            DrsRequest::ExecuteKcc(_) => "ExecuteKCC",
            DrsRequest::GetReplInfo(_) => "ReplicaGetInfo",
            DrsRequest::CrackNames(_) => "CrackNames",
            DrsRequest::WriteSpn(_) => "WriteAccountSpn",
            DrsRequest::RemoveServer(_) => "RemoveDSServer",
        }
    }
}

/// Tagged union of all reply bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DrsReply {
    Bind(BindResponse),
    Unbind,
    GetChanges(GetChangesResponse),
    UpdateRefs,
    ReplicaSync,
    ExecuteKcc,
    GetReplInfo(ReplInfo),
    CrackNames(CrackNamesResponse),
    WriteSpn,
    RemoveServer,
}

/// One call as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Protocol version.
    pub version: u32,
    /// Caller token established by the transport's authentication layer.
    pub token: SecurityToken,
    /// Request body.
    pub request: DrsRequest,
}

/// One reply as handed back to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Call status.
    pub status: WireStatus,
    /// Reply body; absent on failure.
    pub reply: Option<DrsReply>,
}

impl ReplyEnvelope {
    pub fn ok(reply: DrsReply) -> Self {
        Self {
            status: WireStatus::Ok,
            reply: Some(reply),
        }
    }

    pub fn failed(status: WireStatus) -> Self {
        Self {
            status,
            reply: None,
        }
    }
}

/// Serialize a frame to bytes with a length prefix.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(msg).map_err(|e| anyhow!("Failed to serialize frame: {}", e))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "Frame too large: {} bytes (max {})",
            payload.len(),
            MAX_MESSAGE_SIZE
        ));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a frame from bytes (after the length prefix).
pub fn decode_frame<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| anyhow!("Failed to deserialize frame: {}", e))
}

/// Encode with zstd compression.
/// Header: [magic(4)] [flags(1)] [uncompressed_len(4)] [compressed_len(4)] [data]
pub fn encode_frame_compressed<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(msg).map_err(|e| anyhow!("Failed to serialize frame: {}", e))?;
    let compressed = zstd::encode_all(&payload[..], 3)
        .map_err(|e| anyhow!("Failed to compress frame: {}", e))?;
    let mut buf = Vec::with_capacity(13 + compressed.len());
    buf.extend_from_slice(PROTOCOL_MAGIC);
    buf.push(0x01); // flags: compressed
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    buf.extend_from_slice(&compressed);
    Ok(buf)
}

/// Decode a compressed frame.
pub fn decode_frame_compressed<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    if data.len() < 13 {
        return Err(anyhow!("Frame too short for header"));
    }
    if &data[0..4] != PROTOCOL_MAGIC {
        return Err(anyhow!("Invalid protocol magic"));
    }
    let frame_flags = data[4];
    let _uncompressed_len = u32::from_le_bytes(data[5..9].try_into().unwrap()) as usize;
    let compressed_len = u32::from_le_bytes(data[9..13].try_into().unwrap()) as usize;

    if data.len() < 13 + compressed_len {
        return Err(anyhow!("Frame truncated"));
    }

    let payload = if frame_flags & 0x01 != 0 {
        zstd::decode_all(&data[13..13 + compressed_len])
            .map_err(|e| anyhow!("Failed to decompress frame: {}", e))?
    } else {
        data[13..13 + compressed_len].to_vec()
    };

    decode_frame(&payload)
}
