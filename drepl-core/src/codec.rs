//! Attribute translation between the store and the wire.
//!
//! Three concerns live here: the extended identifier rendering used in
//! diagnostics, redaction of the closed secret-attribute set, and sealing of
//! sensitive values under the session key. Redaction always runs before
//! encryption; a redacted attribute has nothing left to seal.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ReplError, ReplResult};
use crate::ident::ObjectIdentifier;
use crate::metadata::AttributeMetadata;
use crate::schema::{AttrId, AttributeSchema};

/// Nonce length prepended to each sealed value.
const NONCE_LEN: usize = 12;

/// An attribute as shipped in a change page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAttribute {
    /// Schema attribute id.
    pub attr_id: AttrId,
    /// Value list; empty after secret redaction.
    pub values: Vec<Vec<u8>>,
    /// Set when the values are sealed under the session key.
    pub encrypted: bool,
}

impl WireAttribute {
    /// A plain-text wire attribute.
    pub fn new(attr_id: AttrId, values: Vec<Vec<u8>>) -> Self {
        Self {
            attr_id,
            values,
            encrypted: false,
        }
    }
}

/// Translates directory attributes to wire attributes and back.
pub struct AttributeCodec;

impl AttributeCodec {
    /// Canonical `"<GUID=…>;<SID=…>;dn"` rendering, used only for
    /// diagnostics and logging.
    pub fn identifier_to_string(id: &ObjectIdentifier) -> String {
        match &id.sid {
            Some(sid) => format!("<GUID={}>;<SID={}>;{}", id.guid, sid, id.dn),
            None => format!("<GUID={}>;{}", id.guid, id.dn),
        }
    }

    /// Clear the value list and zero the originating-change-time of any
    /// value-carrying attribute in the closed secret set. No-op otherwise.
    ///
    /// Must run before encryption, never after.
    pub fn redact_if_secret(attr: &mut WireAttribute, meta: &mut AttributeMetadata) {
        if !AttributeSchema::global().is_secret(attr.attr_id) {
            return;
        }
        if attr.values.is_empty() {
            return;
        }
        attr.values.clear();
        meta.originating_time = 0;
    }

    /// Seal the values of a secret-set attribute under the session key,
    /// additionally keyed by the target account's RID. Non-secret
    /// attributes and empty value lists pass through untouched.
    pub fn encrypt_sensitive(
        attr: &mut WireAttribute,
        session_key: &[u8],
        rid: u32,
    ) -> ReplResult<()> {
        if !AttributeSchema::global().is_secret(attr.attr_id) || attr.values.is_empty() {
            return Ok(());
        }
        let cipher = cipher_for(session_key, rid);
        let mut sealed = Vec::with_capacity(attr.values.len());
        for value in &attr.values {
            let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
            let ct = cipher
                .encrypt(&nonce, value.as_slice())
                .map_err(|_| ReplError::Internal("attribute value sealing failed".into()))?;
            let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ct);
            sealed.push(out);
        }
        attr.values = sealed;
        attr.encrypted = true;
        Ok(())
    }

    /// Unseal values produced by [`AttributeCodec::encrypt_sensitive`].
    pub fn decrypt_sensitive(
        attr: &mut WireAttribute,
        session_key: &[u8],
        rid: u32,
    ) -> ReplResult<()> {
        if !attr.encrypted {
            return Ok(());
        }
        let cipher = cipher_for(session_key, rid);
        let mut plain = Vec::with_capacity(attr.values.len());
        for value in &attr.values {
            if value.len() < NONCE_LEN {
                return Err(ReplError::Internal(
                    "sealed attribute value shorter than its nonce".into(),
                ));
            }
            let (nonce, ct) = value.split_at(NONCE_LEN);
            let pt = cipher
                .decrypt(Nonce::from_slice(nonce), ct)
                .map_err(|_| ReplError::Internal("attribute value unsealing failed".into()))?;
            plain.push(pt);
        }
        attr.values = plain;
        attr.encrypted = false;
        Ok(())
    }
}

/// Per-value cipher keyed by the session key and the target account's RID.
fn cipher_for(session_key: &[u8], rid: u32) -> ChaCha20Poly1305 {
    let mut hasher = Sha256::new();
    hasher.update(session_key);
    hasher.update(rid.to_le_bytes());
    let key_bytes = hasher.finalize();
    ChaCha20Poly1305::new(Key::from_slice(&key_bytes))
}
