//! # Tool lifecycle.
//!
//! Initialises this process as a PMIx tool and, for the launch modes,
//! connects it to a server after the spawn. The attribute set handed to
//! tool-init is what distinguishes the three modes:
//!
//! - **proxy** — do not connect anywhere yet; the tool is itself a launcher
//!   and rendezvous point, so it claims its own namespace and rank.
//! - **non-proxy** — connect to the system server first; one session is live
//!   as soon as init returns.
//! - **attach** — connect to the server owned by the target PID.
//!
//! Finalisation is a refcount on the context and lives there; every
//! teardown path may call it.

use std::sync::Arc;
use std::time::Duration;

use crate::context::ShimContext;
use crate::error::ShimError;
use crate::pmix::{Info, Key, ProcId, Rank};
use crate::{Mode, ShimConfig};

/// Name under which the tool registers; the full identity is
/// `"<TOOL_NAME>.<pid>"`, rank 0.
pub(crate) const TOOL_NAME: &str = "mpir";

/// Bound on the post-spawn server connect.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialises the PMIx tool session for the resolved mode.
pub(crate) fn initialize_as_tool(
    ctx: &Arc<ShimContext>,
    config: &ShimConfig,
) -> Result<(), ShimError> {
    let ident = ProcId::new(format!("{TOOL_NAME}.{}", std::process::id()), Rank(0));
    tracing::debug!(tool = %ident, "requesting tool namespace");

    let mut attrs = Vec::new();
    match ctx.mode() {
        Mode::Proxy => {
            // Rendezvous with the spawned launcher comes later; no server to
            // connect to yet.
            attrs.push(Info::bool(Key::DoNotConnect, true));
            attrs.push(Info::string(Key::ToolNspace, ident.nspace.clone()));
            attrs.push(Info::u32(Key::ToolRank, 0));
            attrs.push(Info::bool(Key::Launcher, true));
        }
        Mode::NonProxy => {
            attrs.push(Info::bool(Key::ConnectSystemFirst, true));
        }
        Mode::Attach => {
            attrs.push(Info::u32(Key::ServerPidInfo, config.target_pid));
        }
    }
    if let Some(prefix) = &config.pmix_prefix {
        tracing::debug!(prefix = %prefix, "using explicit PMIx prefix");
        attrs.push(Info::string(Key::Prefix, prefix.clone()));
    }

    let assigned = ctx.client().tool_init(&ident, attrs).map_err(|status| {
        eprintln!("Unable to initialize as a PMIx tool: {status}");
        ShimError::Pmix {
            op: "PMIx_tool_init",
            status,
        }
    })?;

    tracing::debug!(tool = %assigned, "tool session initialized");
    ctx.set_tool(assigned);
    if matches!(ctx.mode(), Mode::NonProxy | Mode::Attach) {
        ctx.set_session_count(1);
    }
    ctx.note_initialized();
    Ok(())
}

/// Connects the tool to the server after the launcher has been spawned,
/// bounded by [`CONNECT_TIMEOUT`]. Each successful connect is one more live
/// session.
pub(crate) async fn connect_to_server(ctx: &Arc<ShimContext>) -> Result<(), ShimError> {
    let tool = ctx.tool().ok_or(ShimError::MissingIdentity { which: "tool" })?;

    let mut attrs = vec![
        Info::bool(Key::WaitForConnection, true),
        Info::u32(Key::Timeout, CONNECT_TIMEOUT.as_secs() as u32),
    ];
    if ctx.mode() == Mode::NonProxy {
        attrs.push(Info::bool(Key::ConnectSystemFirst, true));
    }

    let connect = ctx.client().connect_to_server(&tool, attrs);
    match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(())) => {}
        Ok(Err(status)) => {
            eprintln!("An error occurred connecting to the PMIx server: {status}");
            return Err(ShimError::Pmix {
                op: "PMIx_tool_connect_to_server",
                status,
            });
        }
        Err(_) => {
            eprintln!("Timed out connecting to the PMIx server");
            return Err(ShimError::Pmix {
                op: "PMIx_tool_connect_to_server",
                status: crate::pmix::Status::Timeout,
            });
        }
    }

    ctx.add_sessions(1);
    tracing::debug!(sessions = ctx.session_count(), "connected to server");
    Ok(())
}
