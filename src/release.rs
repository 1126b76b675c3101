//! # Debugger-release protocol.
//!
//! Suspended processes are resumed with a `DEBUGGER_RELEASE` notification
//! delivered over a custom range naming exactly the target processes, and
//! flagged non-default so no default handler intercepts it on the way.
//!
//! A launch run releases twice: launcher rank 0 first (so it proceeds to
//! launch the application), then every application rank once the debugger
//! has read the proc table.

use crate::context::ShimContext;
use crate::error::ShimError;
use crate::pmix::{EventCode, Info, Key, ProcId, Range};

/// Notifies the given processes that they may resume.
pub(crate) fn release_procs(ctx: &ShimContext, target: ProcId) -> Result<(), ShimError> {
    tracing::debug!(target = %target, "releasing processes");

    let attrs = vec![
        Info::proc(Key::EventCustomRange, target),
        Info::bool(Key::EventNonDefault, true),
    ];
    let status = ctx
        .client()
        .notify_event(EventCode::DebuggerRelease, Range::Custom, attrs);
    if !status.ok() {
        eprintln!("An error occurred resuming processes: {status}");
        return Err(ShimError::Pmix {
            op: "PMIx_Notify_event",
            status,
        });
    }
    Ok(())
}

/// Releases every application rank from its init barrier.
///
/// Exposed for test drivers built with the `testcase` feature, which
/// suppress the automatic release after the breakpoint and issue it
/// manually.
#[cfg(feature = "testcase")]
pub fn release_application(ctx: &ShimContext) -> Result<(), ShimError> {
    let application = ctx.application().ok_or(ShimError::MissingIdentity {
        which: "application",
    })?;
    release_procs(ctx, application)
}
