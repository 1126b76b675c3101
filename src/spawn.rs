//! # Launcher driver.
//!
//! Builds the spawn request for the launcher process (`mpirun`, `prterun`,
//! `prun`, …) and submits it. The launcher is spawned as a single process
//! (`maxprocs = 1`); it spawns the application itself, with the nested
//! launch directives telling it to hold the application ranks in init until
//! the debugger has attached.
//!
//! In both launch modes the tool's own server URI is exported to the child
//! as `LAUNCHER_RNDZ_URI`; that is the rendezvous channel the launcher calls
//! back on. A proxy run additionally hands the child a full copy of the
//! current environment, so the launcher and the application see everything
//! the tool sees.

use std::sync::Arc;

use crate::context::ShimContext;
use crate::error::ShimError;
use crate::pmix::{AppContext, Info, Key, ProcId, Rank, Status, Value};
use crate::Mode;

/// Environment variable naming the rendezvous URI in the child.
pub(crate) const RENDEZVOUS_URI_ENV: &str = "LAUNCHER_RNDZ_URI";

/// Spawns the launcher described by `run_args` and records its identity.
pub(crate) async fn spawn_launcher(
    ctx: &Arc<ShimContext>,
    run_args: &[String],
) -> Result<(), ShimError> {
    let cmd = run_args
        .first()
        .ok_or(ShimError::MissingLauncherCommand)?
        .clone();

    let mut env: Vec<(String, String)> = Vec::new();
    if ctx.mode() == Mode::Proxy {
        env.extend(std::env::vars());
    }
    env.push((RENDEZVOUS_URI_ENV.to_string(), rendezvous_uri(ctx)?));

    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let app = AppContext {
        cmd: cmd.clone(),
        argv: run_args.to_vec(),
        env,
        cwd,
        maxprocs: 1,
    };

    let directives = vec![
        Info::string(Key::MapBy, "slot"),
        Info::bool(Key::FwdStdout, true),
        Info::bool(Key::FwdStderr, true),
        Info::bool(Key::NotifyCompletion, true),
        Info::bool(Key::NotifyJobEvents, true),
        // Handed through to the application job: every rank blocks in init
        // until the debugger releases it.
        Info::infos(
            Key::LaunchDirectives,
            vec![Info::bool(Key::DebugStopInInit, true)],
        ),
    ];

    tracing::debug!(cmd = %cmd, "spawning launcher");
    let outcome = ctx.client().spawn(directives, vec![app]).await;
    tracing::debug!(status = %outcome.status, nspace = %outcome.nspace, "spawn returned");

    if !outcome.status.ok() {
        eprintln!(
            "An error occurred launching {cmd}: {status}",
            status = outcome.status
        );
        return Err(ShimError::Pmix {
            op: "PMIx_Spawn",
            status: outcome.status,
        });
    }

    ctx.set_launcher(ProcId::new(outcome.nspace, Rank(0)));
    Ok(())
}

/// The tool's own server URI, preferred key first.
fn rendezvous_uri(ctx: &Arc<ShimContext>) -> Result<String, ShimError> {
    let tool = ctx.tool().ok_or(ShimError::MissingIdentity { which: "tool" })?;
    for key in [Key::MyServerUri, Key::ServerUri] {
        if let Ok(Value::String(uri)) = ctx.client().get(&tool, key) {
            return Ok(uri);
        }
    }
    Err(ShimError::Pmix {
        op: "PMIx_Get(SERVER_URI)",
        status: Status::NotFound,
    })
}
