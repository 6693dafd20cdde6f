//! drepl-admin — replication administration tool for drepl servers.
//!
//! Supports:
//! - Server state inspection (info)
//! - Full change drains with paging (drain)
//! - Partner reference management (show-refs/add-ref/del-ref)
//! - Triggering immediate sync and topology checks (sync/kcc)
//! - Name translation and SPN maintenance (crack/spn)
//!
//! # Usage
//!
//! ```bash
//! # Inspect a server
//! drepl-admin info --server http://localhost:8389
//!
//! # Drain all changes above a watermark
//! drepl-admin drain --server http://localhost:8389 --nc dc=example,dc=com --watermark 0
//!
//! # Manage partner references
//! drepl-admin add-ref --server ... --nc dc=example,dc=com \
//!     --dest-guid <guid> --dest-dns dsa2.example.com
//! ```

mod client;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use client::DrsClient;
use drepl_core::{Guid, SecurityLevel, SecurityToken, Sid};
use drepl_service::messages::{
    flags, info_type, name_format, CrackNamesRequest, DrsReply, DrsRequest, ExecuteKccRequest,
    GetChangesRequest, GetReplInfoRequest, ReplInfo, ReplicaSyncRequest, SpnOperation,
    UpdateRefsRequest, WriteSpnRequest,
};

#[derive(Parser, Debug)]
#[command(name = "drepl-admin")]
#[command(author = "Drepl Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Drepl replication administration tool")]
struct Cli {
    /// Server base URL
    #[arg(short, long, global = true, default_value = "http://127.0.0.1:8389")]
    server: String,

    /// Account name asserted to the server
    #[arg(long, global = true, default_value = "admin")]
    account: String,

    /// SID asserted to the server
    #[arg(long, global = true, default_value = "S-1-5-21-1000-2000-3000-500")]
    sid: String,

    /// Privilege level asserted to the server
    /// (anonymous|user|domain-controller|administrator|system)
    #[arg(long, global = true, default_value = "administrator")]
    level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Display server identity and replication state
    Info,

    /// Drain all changes above a watermark, paging to exhaustion
    Drain {
        /// Naming context to drain
        #[arg(long)]
        nc: String,
        /// Partner watermark to start from
        #[arg(long, default_value_t = 0)]
        watermark: u64,
        /// Restrict to critical system objects
        #[arg(long)]
        critical_only: bool,
        /// Request secret redaction
        #[arg(long)]
        redact_secrets: bool,
        /// Per-page object cap (0 = server default)
        #[arg(long, default_value_t = 0)]
        page_size: u32,
    },

    /// Show stored partner references of an NC
    #[command(name = "show-refs")]
    ShowRefs {
        #[arg(long)]
        nc: String,
    },

    /// Add a partner reference
    #[command(name = "add-ref")]
    AddRef {
        #[arg(long)]
        nc: String,
        /// Destination DSA GUID
        #[arg(long)]
        dest_guid: String,
        /// Destination DSA DNS name
        #[arg(long)]
        dest_dns: String,
        /// Tolerate an already-present reference
        #[arg(long)]
        check: bool,
        /// Destination holds a writeable replica
        #[arg(long)]
        writeable: bool,
    },

    /// Delete a partner reference
    #[command(name = "del-ref")]
    DelRef {
        #[arg(long)]
        nc: String,
        /// Destination DSA GUID
        #[arg(long)]
        dest_guid: String,
        /// Tolerate an already-absent reference
        #[arg(long)]
        check: bool,
    },

    /// Trigger an immediate replica sync
    Sync {
        #[arg(long)]
        nc: String,
        /// Pull from this source DSA only
        #[arg(long)]
        source: Option<String>,
        /// Opt into asynchronous completion
        #[arg(long)]
        async_op: bool,
    },

    /// Trigger a topology recalculation
    Kcc,

    /// Translate a name between GUID, DN and canonical forms
    Crack {
        /// Input name
        name: String,
        /// Input format (guid|dn)
        #[arg(long, default_value = "dn")]
        offered: String,
        /// Output format (guid|dn|canonical)
        #[arg(long, default_value = "canonical")]
        desired: String,
    },

    /// Maintain service principal names on an account
    Spn {
        /// Operation (add|replace|delete)
        #[arg(long, default_value = "add")]
        op: String,
        /// Target account DN
        #[arg(long)]
        account_dn: String,
        /// SPN values
        spns: Vec<String>,
    },

    /// Tombstone a retired server object
    #[command(name = "remove-server")]
    RemoveServer {
        /// DN of the server object
        #[arg(long)]
        server_dn: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("drepl_admin=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let token = SecurityToken {
        account: cli.account.clone(),
        user_sid: Sid::new(&cli.sid),
        group_sids: vec![],
        level: parse_level(&cli.level)?,
    };
    let client = DrsClient::new(&cli.server, token)?;

    match cli.command {
        Commands::Info => cmd_info(&client).await,
        Commands::Drain {
            nc,
            watermark,
            critical_only,
            redact_secrets,
            page_size,
        } => cmd_drain(&client, nc, watermark, critical_only, redact_secrets, page_size).await,
        Commands::ShowRefs { nc } => cmd_show_refs(&client, nc).await,
        Commands::AddRef {
            nc,
            dest_guid,
            dest_dns,
            check,
            writeable,
        } => {
            let mut ref_flags = flags::ADD_REF;
            if check {
                ref_flags |= flags::CHECK;
            }
            if writeable {
                ref_flags |= flags::WRITEABLE;
            }
            cmd_update_refs(&client, nc, dest_guid, dest_dns, ref_flags).await
        }
        Commands::DelRef {
            nc,
            dest_guid,
            check,
        } => {
            let mut ref_flags = flags::DEL_REF;
            if check {
                ref_flags |= flags::CHECK;
            }
            cmd_update_refs(&client, nc, dest_guid, String::new(), ref_flags).await
        }
        Commands::Sync {
            nc,
            source,
            async_op,
        } => cmd_sync(&client, nc, source, async_op).await,
        Commands::Kcc => cmd_kcc(&client).await,
        Commands::Crack {
            name,
            offered,
            desired,
        } => cmd_crack(&client, name, offered, desired).await,
        Commands::Spn {
            op,
            account_dn,
            spns,
        } => cmd_spn(&client, op, account_dn, spns).await,
        Commands::RemoveServer { server_dn } => cmd_remove_server(&client, server_dn).await,
    }
}

fn parse_level(s: &str) -> Result<SecurityLevel> {
    Ok(match s {
        "anonymous" => SecurityLevel::Anonymous,
        "user" => SecurityLevel::User,
        "domain-controller" | "dc" => SecurityLevel::DomainController,
        "administrator" | "admin" => SecurityLevel::Administrator,
        "system" => SecurityLevel::System,
        other => bail!("unknown privilege level: {}", other),
    })
}

async fn cmd_info(client: &DrsClient) -> Result<()> {
    let info = client.info().await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn cmd_drain(
    client: &DrsClient,
    nc: String,
    watermark: u64,
    critical_only: bool,
    redact_secrets: bool,
    page_size: u32,
) -> Result<()> {
    let handle = client.bind().await?;

    let mut req_flags = 0u32;
    if critical_only {
        req_flags |= flags::CRITICAL_ONLY;
    }
    if redact_secrets {
        req_flags |= flags::SPECIAL_SECRET_PROCESSING;
    }

    let mut total = 0usize;
    let mut pages = 0usize;
    loop {
        let page = client
            .get_changes_page(GetChangesRequest {
                handle,
                level: 10,
                nc: Some(drepl_core::ObjectIdentifier::new(
                    drepl_core::Dn::new(&nc),
                    Guid::nil(),
                )),
                low_watermark: watermark,
                partner_udv: None,
                flags: req_flags,
                single_object: None,
                max_objects: page_size,
            })
            .await?;

        pages += 1;
        total += page.objects.len();
        for obj in &page.objects {
            let marker = if obj.is_nc_root { " [NC root]" } else { "" };
            println!(
                "  {} ({} attribute(s)){}",
                obj.identifier.dn,
                obj.attributes.len(),
                marker
            );
        }

        if !page.more_data {
            println!(
                "Drained {} object(s) in {} page(s); committed watermark {}",
                total, pages, page.new_high_watermark
            );
            if let Some(udv) = &page.up_to_date_vector {
                println!("Up-to-date vector ({} cursor(s)):", udv.cursors.len());
                for cursor in &udv.cursors {
                    println!(
                        "  {} highest-usn={} last-sync={}",
                        cursor.invocation_id, cursor.highest_usn, cursor.last_sync
                    );
                }
            }
            break;
        }
    }

    client.unbind(handle).await?;
    Ok(())
}

async fn cmd_show_refs(client: &DrsClient, nc: String) -> Result<()> {
    let handle = client.bind().await?;
    let reply = client
        .call(DrsRequest::GetReplInfo(GetReplInfoRequest {
            handle,
            info_type: info_type::NEIGHBORS,
            nc: drepl_core::Dn::new(&nc),
        }))
        .await?;
    match reply {
        DrsReply::GetReplInfo(ReplInfo::Neighbors(links)) => {
            println!("{} partner reference(s) on {}:", links.len(), nc);
            for link in links {
                println!(
                    "  {} {} flags={:#x}",
                    link.dest_guid, link.dest_dns_name, link.flags
                );
            }
        }
        other => bail!("unexpected reply: {:?}", other),
    }
    client.unbind(handle).await?;
    Ok(())
}

async fn cmd_update_refs(
    client: &DrsClient,
    nc: String,
    dest_guid: String,
    dest_dns: String,
    ref_flags: u32,
) -> Result<()> {
    let dest_guid = Guid::parse(&dest_guid)?;
    let handle = client.bind().await?;
    client
        .call(DrsRequest::UpdateRefs(UpdateRefsRequest {
            handle,
            nc: drepl_core::Dn::new(&nc),
            dest_guid,
            dest_dns_name: dest_dns,
            flags: ref_flags,
        }))
        .await?;
    println!("Partner references updated on {}", nc);
    client.unbind(handle).await?;
    Ok(())
}

async fn cmd_sync(
    client: &DrsClient,
    nc: String,
    source: Option<String>,
    async_op: bool,
) -> Result<()> {
    let source_dsa = match source {
        Some(s) => Some(Guid::parse(&s)?),
        None => None,
    };
    let mut sync_flags = 0u32;
    if async_op {
        sync_flags |= flags::ASYNC_OP;
    }

    let handle = client.bind().await?;
    client
        .call(DrsRequest::ReplicaSync(ReplicaSyncRequest {
            handle,
            nc: drepl_core::Dn::new(&nc),
            source_dsa,
            flags: sync_flags,
        }))
        .await?;
    println!("Replica sync of {} completed", nc);
    client.unbind(handle).await?;
    Ok(())
}

async fn cmd_kcc(client: &DrsClient) -> Result<()> {
    let handle = client.bind().await?;
    client
        .call(DrsRequest::ExecuteKcc(ExecuteKccRequest {
            handle,
            flags: 0,
        }))
        .await?;
    println!("Topology recalculation completed");
    client.unbind(handle).await?;
    Ok(())
}

fn parse_format(s: &str) -> Result<u32> {
    Ok(match s {
        "guid" => name_format::GUID,
        "dn" => name_format::DN,
        "canonical" => name_format::CANONICAL,
        other => bail!("unknown name format: {}", other),
    })
}

async fn cmd_crack(
    client: &DrsClient,
    name: String,
    offered: String,
    desired: String,
) -> Result<()> {
    let handle = client.bind().await?;
    let reply = client
        .call(DrsRequest::CrackNames(CrackNamesRequest {
            handle,
            format_offered: parse_format(&offered)?,
            format_desired: parse_format(&desired)?,
            names: vec![name],
        }))
        .await?;
    match reply {
        DrsReply::CrackNames(resp) => {
            for answer in resp.answers {
                match answer.result {
                    Some(result) => println!("{}", result),
                    None => println!("<{}>", answer.status),
                }
            }
        }
        other => bail!("unexpected reply: {:?}", other),
    }
    client.unbind(handle).await?;
    Ok(())
}

async fn cmd_spn(
    client: &DrsClient,
    op: String,
    account_dn: String,
    spns: Vec<String>,
) -> Result<()> {
    let operation = match op.as_str() {
        "add" => SpnOperation::Add,
        "replace" => SpnOperation::Replace,
        "delete" => SpnOperation::Delete,
        other => bail!("unknown SPN operation: {}", other),
    };

    let handle = client.bind().await?;
    client
        .call(DrsRequest::WriteSpn(WriteSpnRequest {
            handle,
            operation,
            account_dn: drepl_core::Dn::new(&account_dn),
            spns,
        }))
        .await?;
    println!("SPN update applied to {}", account_dn);
    client.unbind(handle).await?;
    Ok(())
}

async fn cmd_remove_server(client: &DrsClient, server_dn: String) -> Result<()> {
    let handle = client.bind().await?;
    client
        .call(DrsRequest::RemoveServer(
            drepl_service::messages::RemoveServerRequest {
                handle,
                server_dn: drepl_core::Dn::new(&server_dn),
            },
        ))
        .await?;
    println!("Server object {} removed", server_dn);
    client.unbind(handle).await?;
    Ok(())
}
