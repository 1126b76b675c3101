//! # Signal and atexit shutdown.
//!
//! Two guarantees regardless of how the process ends:
//!
//! - SIGHUP, SIGINT and SIGTERM finalize the tool session and exit(1), so a
//!   Ctrl-C never strands the launcher waiting on a dead tool;
//! - an atexit callback finalizes (idempotently) and frees the published
//!   proc table, covering every `exit` path including the signal one.
//!
//! The atexit callback is C-rank code: it reaches the active context through
//! a process-global slot and must not panic or block.

use std::sync::{Arc, Mutex, Once};

use tokio::signal::unix::{signal, SignalKind};

use crate::context::ShimContext;
use crate::error::ShimError;
use crate::mpir;

/// The context the atexit callback and the signal task act on. Replaced by
/// every `install`; the last run wins.
static ACTIVE: Mutex<Option<Arc<ShimContext>>> = Mutex::new(None);

static ATEXIT_ONCE: Once = Once::new();

fn active_context() -> Option<Arc<ShimContext>> {
    ACTIVE.lock().ok().and_then(|g| g.clone())
}

extern "C" fn at_exit_cleanup() {
    // Finalizing makes sure the launcher is told this tool is gone.
    if let Some(ctx) = active_context() {
        let _ = ctx.finalize_as_tool();
    }
    mpir::free_proctable();
}

/// Installs the atexit callback and the signal listeners for this run.
pub(crate) fn install(ctx: &Arc<ShimContext>) -> Result<(), ShimError> {
    if let Ok(mut active) = ACTIVE.lock() {
        *active = Some(ctx.clone());
    }

    let mut atexit_ok = true;
    ATEXIT_ONCE.call_once(|| {
        atexit_ok = unsafe { libc::atexit(at_exit_cleanup) } == 0;
    });
    if !atexit_ok {
        eprintln!("An error occurred setting an exit handler.");
        return Err(ShimError::Install { what: "exit" });
    }

    spawn_signal_task().map_err(|err| {
        eprintln!("An error occurred setting a signal handler: {err}.");
        ShimError::Install { what: "signal" }
    })
}

/// Listens for the termination signals; any of them finalizes the tool and
/// exits. `exit(1)` runs the atexit callback, which frees the proc table.
fn spawn_signal_task() -> std::io::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = hangup.recv() => {}
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        tracing::debug!("termination signal received");
        if let Some(ctx) = active_context() {
            let _ = ctx.finalize_as_tool();
        }
        std::process::exit(1);
    });
    Ok(())
}
