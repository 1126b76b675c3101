//! # Driver sequence.
//!
//! [`Shim`] owns one run of the shim, from option resolution to the
//! launcher's exit code. The driver thread performs setup, spawn and
//! sequencing, and blocks on the named latches; the event handlers run on
//! client-library threads and post them.
//!
//! ```text
//!  launch modes                                attach mode
//!  ────────────                                ───────────
//!  install shutdown hooks                      install shutdown hooks
//!  tool init, default handler                  tool init, default handler
//!  spawn launcher                              launcher identity ◄ keystore
//!  connect to server (10 s bound)              query application namespace
//!  register terminate + ready handlers         build proc table
//!  release launcher rank 0                     MPIR_Breakpoint
//!  register launch-complete handler            finalize, exit 0
//!  wait ready-for-debug ◄─── launcher
//!  build proc table, MPIR_Breakpoint
//!  register app terminate (proxy)
//!  release application ranks
//!  wait launch-term ◄─────── launcher
//!  finalize, exit with launcher's code
//! ```
//!
//! Every wait is guarded by the launcher-terminated token; when a wait is
//! satisfied by termination instead of its event, the driver skips the rest
//! of the protocol and falls through to teardown, so an early launcher death
//! still yields the launcher's exit code.

use std::sync::Arc;

use crate::context::ShimContext;
use crate::error::ShimError;
use crate::pmix::PmixClient;
use crate::{events, proctable, release, session, shutdown, spawn};
use crate::{Mode, ShimConfig};

/// One configured run of the shim.
pub struct Shim {
    config: ShimConfig,
    mode: Mode,
    ctx: Arc<ShimContext>,
}

impl std::fmt::Debug for Shim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shim").field("mode", &self.mode).finish()
    }
}

impl Shim {
    /// Resolves the configuration and prepares a run against the given
    /// client library.
    ///
    /// Fails with a configuration error (no PMIx traffic yet) when the mode
    /// cannot be resolved.
    pub fn new(client: Arc<dyn PmixClient>, config: ShimConfig) -> Result<Self, ShimError> {
        let mode = config.resolve()?;
        if config.debug {
            // Best effort; the embedder may already have a subscriber.
            let _ = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .try_init();
        }
        let ctx = ShimContext::new(client, mode);
        Ok(Self { config, mode, ctx })
    }

    /// The shared state of this run.
    ///
    /// Useful to embedders that want to observe the run or replace the
    /// callback-safe exit path before calling [`Shim::run`].
    pub fn context(&self) -> Arc<ShimContext> {
        self.ctx.clone()
    }

    /// Drives the full sequence and returns the process exit code: the
    /// launcher's own code in the launch modes, 0 in attach mode.
    pub async fn run(self) -> Result<i32, ShimError> {
        let Shim { config, mode, ctx } = self;
        tracing::debug!(?mode, args = ?config.run_args, "starting mpir shim");

        shutdown::install(&ctx)?;
        session::initialize_as_tool(&ctx, &config)?;
        events::register_default_handler(&ctx).await?;

        match mode {
            Mode::Attach => run_attach(&ctx).await,
            Mode::Proxy | Mode::NonProxy => run_launch(&ctx, &config).await,
        }
    }
}

/// Entry point: resolve `config`, drive the run, return the exit code.
pub async fn run(client: Arc<dyn PmixClient>, config: ShimConfig) -> Result<i32, ShimError> {
    Shim::new(client, config)?.run().await
}

async fn run_launch(ctx: &Arc<ShimContext>, config: &ShimConfig) -> Result<i32, ShimError> {
    spawn::spawn_launcher(ctx, &config.run_args).await?;
    session::connect_to_server(ctx).await?;

    // These two cannot be registered before the server connect.
    events::register_launcher_terminate_handler(ctx).await?;
    events::register_launcher_ready_handler(ctx).await?;

    // The ready handler is in place; the launcher may proceed.
    let launcher = ctx.launcher().ok_or(ShimError::MissingIdentity {
        which: "launcher",
    })?;
    release::release_procs(ctx, launcher)?;

    events::register_launcher_complete_handler(ctx).await?;

    tracing::debug!("waiting for the launcher to become ready");
    ctx.latches()
        .ready_for_debug
        .wait(ctx.terminated_token())
        .await;

    if !ctx.launcher_terminated() {
        // The launch-complete handler has populated the application
        // identity by the time the launcher declares itself ready.
        proctable::build_proctable(ctx).await?;

        if ctx.mode() == Mode::Proxy {
            events::register_application_terminate_handler(ctx).await?;
        }

        release_application_processes(ctx)?;
    }

    tracing::debug!("waiting for the launcher to terminate");
    ctx.latches()
        .launch_term
        .wait(ctx.terminated_token())
        .await;

    let _ = ctx.finalize_as_tool();
    let code = ctx.launcher_exit_code();
    tracing::debug!(exit_code = code, "run finished");
    Ok(code)
}

async fn run_attach(ctx: &Arc<ShimContext>) -> Result<i32, ShimError> {
    proctable::query_launcher_identity(ctx)?;
    proctable::query_application_namespace(ctx).await?;
    proctable::build_proctable(ctx).await?;

    let _ = ctx.finalize_as_tool();
    Ok(0)
}

#[cfg(not(feature = "testcase"))]
fn release_application_processes(ctx: &Arc<ShimContext>) -> Result<(), ShimError> {
    let application = ctx.application().ok_or(ShimError::MissingIdentity {
        which: "application",
    })?;
    release::release_procs(ctx, application)
}

/// Testcase builds keep the application paused; the test driver releases it
/// through `release_application` when it is ready.
#[cfg(feature = "testcase")]
fn release_application_processes(_ctx: &Arc<ShimContext>) -> Result<(), ShimError> {
    Ok(())
}
