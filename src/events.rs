//! # Event-handler registry.
//!
//! Five handlers are registered with the client library over the course of a
//! run:
//!
//! | Handler | Event | Filter |
//! |---------|-------|--------|
//! | default | any, unfiltered | none |
//! | launcher-complete | `LAUNCH_COMPLETE` | none |
//! | launcher-ready | `READY_FOR_DEBUG` | launcher |
//! | launcher-terminated | `JOB_TERMINATED` | launcher |
//! | application-terminated | `JOB_TERMINATED` | application |
//!
//! Registration completes asynchronously on a library thread. Each request
//! carries its own oneshot reply, and the context's registration gate keeps
//! at most one registration in flight, so an id can never be attributed to
//! the wrong handler. The completion wait is bounded by the
//! launcher-terminated token, like every other suspension point.
//!
//! Handlers run on library-owned threads, concurrently with the driver. They
//! only touch latches, atomics and the MPIR surface, and they hand the
//! supplied continuation back with `EVENT_ACTION_COMPLETE` on every path so
//! the notification chain progresses.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::context::{ShimContext, Termination};
use crate::error::ShimError;
use crate::pmix::{
    Completion, EventAction, EventCode, EventHandlerFn, HandlerId, Info, Key, Notification,
    RegistrationRequest, Status, Value,
};

/// Registers one handler and waits for its completion reply.
async fn register(
    ctx: &Arc<ShimContext>,
    name: &'static str,
    codes: Vec<EventCode>,
    mut infos: Vec<Info>,
    handler: Arc<EventHandlerFn>,
) -> Result<HandlerId, ShimError> {
    // One registration in flight at a time.
    let _in_flight = ctx.registration_gate().lock().await;

    infos.insert(0, Info::string(Key::EventHandlerName, name));
    let (reply_tx, reply_rx) = oneshot::channel();
    ctx.client().register_event_handler(RegistrationRequest {
        codes,
        infos,
        handler,
        reply: reply_tx,
    });

    // Biased: a completion that already arrived wins over a concurrent
    // termination, so a finished registration is never reported as cut off.
    let reply = tokio::select! {
        biased;
        reply = reply_rx => reply.map_err(|_| ShimError::Registration {
            name,
            status: Status::Unreachable,
        })?,
        _ = ctx.terminated_token().cancelled() => {
            return Err(ShimError::Registration {
                name,
                status: Status::Unreachable,
            });
        }
    };

    if reply.status != Status::Success {
        eprintln!("An error occurred registering the {name} handler: {}", reply.status);
        return Err(ShimError::Registration {
            name,
            status: reply.status,
        });
    }
    tracing::debug!(handler = name, id = reply.id.0, "handler registered");
    Ok(reply.id)
}

/// Registers the unfiltered default handler. Must precede all others.
pub(crate) async fn register_default_handler(ctx: &Arc<ShimContext>) -> Result<(), ShimError> {
    let id = register(ctx, "DEFAULT", Vec::new(), Vec::new(), default_handler(ctx.clone())).await?;
    if let Ok(mut ids) = ctx.handler_ids().lock() {
        ids.default = Some(id);
    }
    Ok(())
}

/// Registers for the launcher's launch-complete notification.
pub(crate) async fn register_launcher_complete_handler(
    ctx: &Arc<ShimContext>,
) -> Result<(), ShimError> {
    let id = register(
        ctx,
        "LAUNCHER-COMPLETE",
        vec![EventCode::LaunchComplete],
        Vec::new(),
        launcher_complete_handler(ctx.clone()),
    )
    .await?;
    if let Ok(mut ids) = ctx.handler_ids().lock() {
        ids.launcher_complete = Some(id);
    }
    Ok(())
}

/// Registers for the launcher's ready-for-debug notification.
pub(crate) async fn register_launcher_ready_handler(
    ctx: &Arc<ShimContext>,
) -> Result<(), ShimError> {
    let launcher = ctx.launcher().ok_or(ShimError::MissingIdentity {
        which: "launcher",
    })?;
    let id = register(
        ctx,
        "LAUNCHER-READY",
        vec![EventCode::ReadyForDebug],
        vec![Info::proc(Key::EventAffectedProc, launcher)],
        launcher_ready_handler(ctx.clone()),
    )
    .await?;
    if let Ok(mut ids) = ctx.handler_ids().lock() {
        ids.launcher_ready = Some(id);
    }
    Ok(())
}

/// Registers for the launcher's own termination.
pub(crate) async fn register_launcher_terminate_handler(
    ctx: &Arc<ShimContext>,
) -> Result<(), ShimError> {
    let launcher = ctx.launcher().ok_or(ShimError::MissingIdentity {
        which: "launcher",
    })?;
    let id = register(
        ctx,
        "LAUNCHER-TERMINATED",
        vec![EventCode::JobTerminated],
        vec![Info::proc(Key::EventAffectedProc, launcher)],
        launcher_terminate_handler(ctx.clone()),
    )
    .await?;
    if let Ok(mut ids) = ctx.handler_ids().lock() {
        ids.launcher_terminate = Some(id);
    }
    Ok(())
}

/// Registers for the application's termination.
pub(crate) async fn register_application_terminate_handler(
    ctx: &Arc<ShimContext>,
) -> Result<(), ShimError> {
    let application = ctx.application().ok_or(ShimError::MissingIdentity {
        which: "application",
    })?;
    let id = register(
        ctx,
        "APPLICATION-TERMINATED",
        vec![EventCode::JobTerminated],
        vec![Info::proc(Key::EventAffectedProc, application)],
        application_terminate_handler(ctx.clone()),
    )
    .await?;
    if let Ok(mut ids) = ctx.handler_ids().lock() {
        ids.application_terminate = Some(id);
    }
    Ok(())
}

// === Handler bodies ===

fn default_handler(ctx: Arc<ShimContext>) -> Arc<EventHandlerFn> {
    Arc::new(move |n: &Notification, completion: Completion| {
        tracing::debug!(event = %n.code, "default handler");
        if n.code == EventCode::LostConnectionToServer {
            let sessions = ctx.session_count();
            eprintln!("Connection to the job being debugged was lost (sessions {sessions}).");
            if sessions == 1 {
                // This may run inside a library callback, where finalizing
                // can deadlock; unblock the driver and leave without
                // touching the atexit path.
                ctx.latches().release_all();
                ctx.hard_exit(1);
                return;
            }
            ctx.add_sessions(-1);
        }
        completion.complete(EventAction::Complete);
    })
}

fn launcher_complete_handler(ctx: Arc<ShimContext>) -> Arc<EventHandlerFn> {
    Arc::new(move |n: &Notification, completion: Completion| {
        // The notification may name several namespaces; the application's is
        // the last one.
        let mut nspace: Option<String> = None;
        for info in &n.infos {
            if info.key == Key::Nspace {
                if let Value::String(s) = &info.value {
                    nspace = Some(s.clone());
                }
            }
        }

        match nspace {
            Some(ns) => {
                tracing::debug!(namespace = %ns, "launch complete");
                ctx.set_application(crate::pmix::ProcId::wildcard(ns));
                ctx.latches().launch_complete.post();
            }
            None => {
                eprintln!("No application namespace found in notification.");
                ctx.fatal(
                    None,
                    "launched application namespace wasn't returned in the notification",
                );
            }
        }

        completion.complete(EventAction::Complete);
    })
}

fn launcher_ready_handler(ctx: Arc<ShimContext>) -> Arc<EventHandlerFn> {
    Arc::new(move |n: &Notification, completion: Completion| {
        tracing::debug!(source = ?n.source, "launcher ready for debug");
        ctx.latches().ready_for_debug.post();
        completion.complete(EventAction::Complete);
    })
}

/// Exit code carried by a termination notification, under either key the
/// launcher may use.
fn exit_code_of(n: &Notification) -> i32 {
    let mut code = 0;
    for info in &n.infos {
        match info.key {
            Key::ExitCode | Key::JobTermStatus => {
                if let Some(c) = info.value.as_i32() {
                    code = c;
                }
            }
            _ => {}
        }
    }
    code
}

fn launcher_terminate_handler(ctx: Arc<ShimContext>) -> Arc<EventHandlerFn> {
    Arc::new(move |n: &Notification, completion: Completion| {
        let code = exit_code_of(n);
        tracing::debug!(
            affected = ?n.affected_proc(),
            exit_code = code,
            "launcher terminated"
        );
        ctx.record_launcher_exit(code);

        // Any wait from here on is already satisfied; the broadcast keeps
        // the driver from hanging on a latch that will never be posted.
        ctx.mark_launcher_terminated(Termination::LauncherExited);
        ctx.latches().launch_term.post();
        ctx.latches().release_all();

        completion.complete(EventAction::Complete);
    })
}

fn application_terminate_handler(ctx: Arc<ShimContext>) -> Arc<EventHandlerFn> {
    Arc::new(move |n: &Notification, completion: Completion| {
        let code = exit_code_of(n);
        tracing::debug!(
            affected = ?n.affected_proc(),
            exit_code = code,
            "application terminated"
        );
        ctx.record_application_exit(code);
        ctx.mark_application_terminated();

        ctx.mark_launcher_terminated(Termination::ViaApplication);
        ctx.latches().launch_term.post();
        ctx.latches().release_all();

        completion.complete(EventAction::Complete);
    })
}
