//! HTTP client for a running drepl server.
//!
//! Wraps the binary call envelope exchanged with POST /drs/call and the JSON
//! diagnostics at GET /drs/info.

use anyhow::{anyhow, bail, Context, Result};

use drepl_core::{Guid, SecurityToken};
use drepl_service::messages::{
    decode_frame_compressed, encode_frame_compressed, BindRequest, CallEnvelope, ClientInfo,
    DrsReply, DrsRequest, GetChangesRequest, GetChangesResponse, ReplyEnvelope, UnbindRequest,
    caps, PROTOCOL_VERSION,
};

/// Client for one drepl server.
pub struct DrsClient {
    base_url: String,
    http: reqwest::Client,
    token: SecurityToken,
}

impl DrsClient {
    /// Create a new client targeting `base_url` (e.g. `http://server:8389`).
    pub fn new(base_url: &str, token: SecurityToken) -> Result<Self> {
        let url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            base_url: url,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .context("Failed to create HTTP client")?,
            token,
        })
    }

    /// GET /drs/info
    pub async fn info(&self) -> Result<serde_json::Value> {
        let url = format!("{}/drs/info", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET /drs/info failed ({}): {}", status, body));
        }
        resp.json()
            .await
            .context("Failed to parse /drs/info response")
    }

    /// POST one call envelope and unwrap the reply body.
    pub async fn call(&self, request: DrsRequest) -> Result<DrsReply> {
        let op = request.name();
        let envelope = CallEnvelope {
            version: PROTOCOL_VERSION,
            token: self.token.clone(),
            request,
        };
        let body = encode_frame_compressed(&envelope)?;

        let url = format!("{}/drs/call", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("{} failed ({}): {}", op, status, text));
        }

        let bytes = resp.bytes().await.context("Failed to read reply body")?;
        let reply: ReplyEnvelope = decode_frame_compressed(&bytes)?;
        if !reply.status.is_ok() {
            bail!("{} returned status {}", op, reply.status);
        }
        reply
            .reply
            .ok_or_else(|| anyhow!("{} returned success without a reply body", op))
    }

    /// Bind a session and return its handle.
    pub async fn bind(&self) -> Result<Guid> {
        let reply = self
            .call(DrsRequest::Bind(BindRequest {
                bind_guid: Guid::generate(),
                info: ClientInfo::Extended {
                    caps: caps::LOCAL,
                    site_guid: Guid::nil(),
                    pid: std::process::id(),
                    ext_flags: 0,
                    config_dn: None,
                },
            }))
            .await?;
        match reply {
            DrsReply::Bind(resp) => Ok(resp.handle),
            other => bail!("unexpected reply to Bind: {:?}", other),
        }
    }

    /// Release a session handle.
    pub async fn unbind(&self, handle: Guid) -> Result<()> {
        self.call(DrsRequest::Unbind(UnbindRequest { handle }))
            .await?;
        Ok(())
    }

    /// Fetch one change page.
    pub async fn get_changes_page(
        &self,
        req: GetChangesRequest,
    ) -> Result<GetChangesResponse> {
        match self.call(DrsRequest::GetChanges(req)).await? {
            DrsReply::GetChanges(page) => Ok(page),
            other => bail!("unexpected reply to GetNCChanges: {:?}", other),
        }
    }
}
