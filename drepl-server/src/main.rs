//! Drepl Server - Directory Replication Service
//!
//! Hosts the replication call surface over an HTTP/1 carrier:
//!   POST /drs/call  → one binary call envelope in, one reply envelope out
//!   GET  /drs/info  → server identity & replication state (JSON)
//!
//! The carrier is deliberately thin; authentication and wire marshalling
//! proper belong to the transport layer in front of this process.

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drepl_core::{DirectoryStore, ForestConfig, Guid, MemoryDirectory};
use drepl_service::messages::{
    decode_frame_compressed, encode_frame_compressed, CallEnvelope, ReplyEnvelope,
    PROTOCOL_VERSION,
};
use drepl_service::{ReplicationService, ServiceConfig};

/// Drepl Server Configuration
#[derive(Parser, Debug)]
#[command(name = "drepld")]
#[command(author = "Drepl Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Directory replication service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:8389)
        #[arg(short, long, default_value = "0.0.0.0:8389")]
        addr: String,

        /// Directory holding drepl-config.json
        #[arg(short, long, default_value = "./data")]
        config_dir: String,

        /// Naming context to bootstrap
        #[arg(long, default_value = "dc=example,dc=com")]
        nc: String,

        /// Site name to bootstrap
        #[arg(long, default_value = "Default-First-Site")]
        site: String,

        /// Server name to bootstrap
        #[arg(long, default_value = "DSA1")]
        server_name: String,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Write a default configuration file
    Init {
        /// Directory to place drepl-config.json in
        path: String,
    },
}

/// Shared per-process state handed to every connection task.
struct ServerState {
    service: ReplicationService,
    store: Arc<MemoryDirectory>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            config_dir,
            nc,
            site,
            server_name,
            debug,
        } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            info!("Starting drepl server on {}", addr);

            let forest = ForestConfig {
                nc,
                site_name: site,
                server_name: server_name.clone(),
                dns_name: format!("{}.example.com", server_name.to_lowercase()),
                ..Default::default()
            };
            let store = Arc::new(MemoryDirectory::new(Guid::generate()));
            let info = store
                .bootstrap_forest(&forest)
                .await
                .expect("Failed to bootstrap forest");
            info!(
                "Bootstrapped forest: NC {} (invocation id {})",
                info.nc_root,
                store.invocation_id()
            );

            let mut config = ServiceConfig::load(std::path::Path::new(&config_dir))
                .unwrap_or_default();
            config.site_dn = info.site_dn.to_string();
            config.settings_dn = info.settings_dn.to_string();
            config.default_nc = info.nc_root.to_string();
            if config.gate.disable_security_check {
                warn!("security checks are DISABLED by configuration");
            }

            let state = Arc::new(ServerState {
                service: ReplicationService::new(
                    Arc::clone(&store) as Arc<dyn DirectoryStore>,
                    config,
                ),
                store,
            });

            let addr: SocketAddr = addr.parse()?;
            let listener = TcpListener::bind(addr).await?;
            info!("Server listening on {}", addr);
            info!("Ready to accept replication partners");

            loop {
                let (stream, peer) = listener.accept().await?;
                let state = Arc::clone(&state);
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(move |req| handle_request(req, Arc::clone(&state))),
                        )
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", peer, e);
                    }
                });
            }
        }

        Commands::Init { path } => {
            std::fs::create_dir_all(&path)?;
            let config = ServiceConfig::default();
            config.save(std::path::Path::new(&path))?;
            println!("Wrote default configuration to {}/drepl-config.json", path);
            println!("Start the server with:");
            println!("  drepld start --config-dir {}", path);
            Ok(())
        }
    }
}

/// Handle incoming HTTP request.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    let response = match (method.as_str(), path.as_str()) {
        ("POST", "/drs/call") => {
            let body = req.into_body().collect().await?.to_bytes();
            handle_call(&body, &state).await
        }
        ("GET", "/drs/info") => handle_info(&state).await,
        _ => json_error(404, &format!("Unknown endpoint: {} {}", method, path)),
    };
    Ok(response)
}

/// POST /drs/call — decode, dispatch, encode.
async fn handle_call(body: &[u8], state: &ServerState) -> Response<Full<Bytes>> {
    let call: CallEnvelope = match decode_frame_compressed(body) {
        Ok(call) => call,
        Err(e) => {
            warn!("rejecting undecodable call envelope: {}", e);
            return json_error(400, &format!("Invalid call envelope: {}", e));
        }
    };
    if call.version != PROTOCOL_VERSION {
        return json_error(
            400,
            &format!(
                "Unsupported protocol version {} (expected {})",
                call.version, PROTOCOL_VERSION
            ),
        );
    }

    let reply: ReplyEnvelope = state.service.dispatch(&call.token, call.request).await;
    match encode_frame_compressed(&reply) {
        Ok(encoded) => Response::builder()
            .status(200)
            .header("Content-Type", "application/octet-stream")
            .body(Full::new(Bytes::from(encoded)))
            .unwrap(),
        Err(e) => {
            error!("failed to encode reply envelope: {}", e);
            json_error(500, "Failed to encode reply")
        }
    }
}

/// GET /drs/info — server identity and replication state.
async fn handle_info(state: &ServerState) -> Response<Full<Bytes>> {
    #[derive(serde::Serialize)]
    struct ServerInfo {
        protocol_version: u32,
        invocation_id: String,
        highest_usn: u64,
        live_binds: usize,
        capabilities: Vec<String>,
    }

    let highest_usn = match state.store.highest_usn().await {
        Ok(usn) => usn,
        Err(e) => {
            error!("failed to read sequence counter: {}", e);
            return json_error(500, "Failed to read sequence counter");
        }
    };
    let info = ServerInfo {
        protocol_version: PROTOCOL_VERSION,
        invocation_id: state.store.invocation_id().to_string(),
        highest_usn,
        live_binds: state.service.live_binds().await,
        capabilities: vec![
            "paged-changes".into(),
            "critical-only".into(),
            "secret-processing".into(),
            "async-forwarding".into(),
            "compressed-replies".into(),
        ],
    };
    json_ok(&info)
}

fn json_ok<T: serde::Serialize>(data: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(data).unwrap_or_default();
    Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn json_error(status: u16, message: &str) -> Response<Full<Bytes>> {
    #[derive(serde::Serialize)]
    struct ErrorBody {
        error: String,
    }
    let body = serde_json::to_vec(&ErrorBody {
        error: message.to_string(),
    })
    .unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
