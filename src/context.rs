//! # Shared shim state.
//!
//! [`ShimContext`] is the single owned value holding everything the driver
//! and the event handlers share: the three process identities, the session
//! accounting, the termination marker, the latch set, and the teardown
//! paths. Handlers receive it as an `Arc` captured in their closures, the
//! Rust shape of the return-object mechanism.
//!
//! Two termination paths exist. The safe one, [`ShimContext::finalize_as_tool`],
//! runs the full teardown and is idempotent. The callback-safe one,
//! [`ShimContext::hard_exit`], broadcasts nothing and bypasses the atexit
//! chain entirely, because finalizing from inside a client-library callback
//! can deadlock.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::ShimError;
use crate::latch::Latches;
use crate::mpir;
use crate::pmix::{HandlerId, PmixClient, ProcId, Status};
use crate::Mode;

/// How the launcher was observed to terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Termination {
    /// The launcher is (as far as we know) still alive.
    Running = 0,
    /// The launcher's own termination event arrived.
    LauncherExited = 1,
    /// Termination was observed through the application's termination event.
    ViaApplication = 2,
}

impl Termination {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Termination::LauncherExited,
            2 => Termination::ViaApplication,
            _ => Termination::Running,
        }
    }
}

/// Handler ids assigned by the client library, one slot per handler.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HandlerIds {
    pub(crate) default: Option<HandlerId>,
    pub(crate) launcher_complete: Option<HandlerId>,
    pub(crate) launcher_ready: Option<HandlerId>,
    pub(crate) launcher_terminate: Option<HandlerId>,
    pub(crate) application_terminate: Option<HandlerId>,
}

type HardExitFn = Box<dyn Fn(i32) + Send>;

/// State shared between the driver and the event handlers.
pub struct ShimContext {
    mode: Mode,
    client: Arc<dyn PmixClient>,

    tool: Mutex<Option<ProcId>>,
    launcher: Mutex<Option<ProcId>>,
    application: Mutex<Option<ProcId>>,

    /// Tool-init refcount consumed by `finalize_as_tool`.
    init_count: AtomicI32,
    /// Live server connections (2 in non-proxy mode).
    session_count: AtomicI32,

    termination: AtomicU8,
    app_terminated: AtomicBool,
    launcher_exit_code: AtomicI32,
    app_exit_code: AtomicI32,

    /// Cancelled the moment the launcher is known terminated; every latch
    /// wait is guarded by it.
    terminated: CancellationToken,
    latches: Latches,

    /// One registration in flight at a time.
    registration_gate: tokio::sync::Mutex<()>,
    handler_ids: Mutex<HandlerIds>,

    hard_exit: Mutex<HardExitFn>,
}

impl ShimContext {
    pub(crate) fn new(client: Arc<dyn PmixClient>, mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            client,
            tool: Mutex::new(None),
            launcher: Mutex::new(None),
            application: Mutex::new(None),
            init_count: AtomicI32::new(0),
            session_count: AtomicI32::new(0),
            termination: AtomicU8::new(Termination::Running as u8),
            app_terminated: AtomicBool::new(false),
            launcher_exit_code: AtomicI32::new(0),
            app_exit_code: AtomicI32::new(0),
            terminated: CancellationToken::new(),
            latches: Latches::new(),
            registration_gate: tokio::sync::Mutex::new(()),
            handler_ids: Mutex::new(HandlerIds::default()),
            hard_exit: Mutex::new(Box::new(|code| {
                // Bypasses atexit on purpose; see the module docs.
                unsafe { libc::_exit(code) }
            })),
        })
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn client(&self) -> &Arc<dyn PmixClient> {
        &self.client
    }

    pub(crate) fn latches(&self) -> &Latches {
        &self.latches
    }

    pub(crate) fn terminated_token(&self) -> &CancellationToken {
        &self.terminated
    }

    pub(crate) fn registration_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.registration_gate
    }

    pub(crate) fn handler_ids(&self) -> &Mutex<HandlerIds> {
        &self.handler_ids
    }

    // === Identities ===

    pub(crate) fn tool(&self) -> Option<ProcId> {
        self.tool.lock().ok().and_then(|g| g.clone())
    }

    pub(crate) fn set_tool(&self, proc: ProcId) {
        if let Ok(mut g) = self.tool.lock() {
            *g = Some(proc);
        }
    }

    /// Launcher identity; populated after spawn, or from the keystore in
    /// attach mode.
    pub fn launcher(&self) -> Option<ProcId> {
        self.launcher.lock().ok().and_then(|g| g.clone())
    }

    pub(crate) fn set_launcher(&self, proc: ProcId) {
        if let Ok(mut g) = self.launcher.lock() {
            *g = Some(proc);
        }
    }

    /// Application identity; populated from the launch-complete event or a
    /// namespace query.
    pub fn application(&self) -> Option<ProcId> {
        self.application.lock().ok().and_then(|g| g.clone())
    }

    pub(crate) fn set_application(&self, proc: ProcId) {
        if let Ok(mut g) = self.application.lock() {
            *g = Some(proc);
        }
    }

    // === Session accounting ===

    /// Number of server connections this tool currently holds.
    pub fn session_count(&self) -> i32 {
        self.session_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_session_count(&self, n: i32) {
        self.session_count.store(n, Ordering::SeqCst);
    }

    pub(crate) fn add_sessions(&self, delta: i32) {
        self.session_count.fetch_add(delta, Ordering::SeqCst);
    }

    // === Termination bookkeeping ===

    /// Marks the launcher terminated and wakes every guarded wait.
    pub(crate) fn mark_launcher_terminated(&self, how: Termination) {
        self.termination.store(how as u8, Ordering::SeqCst);
        self.terminated.cancel();
    }

    pub(crate) fn mark_application_terminated(&self) {
        self.app_terminated.store(true, Ordering::SeqCst);
    }

    /// How the launcher terminated, if it did.
    pub fn termination(&self) -> Termination {
        Termination::from_u8(self.termination.load(Ordering::SeqCst))
    }

    /// True once the launcher is known dead, through either event.
    pub fn launcher_terminated(&self) -> bool {
        self.termination() != Termination::Running
    }

    pub(crate) fn application_terminated(&self) -> bool {
        self.app_terminated.load(Ordering::SeqCst)
    }

    /// Records the launcher's exit code; a non-zero code flips the MPIR
    /// state to aborting with a reason.
    pub(crate) fn record_launcher_exit(&self, code: i32) {
        self.launcher_exit_code.store(code, Ordering::SeqCst);
        if code != 0 {
            mpir::set_aborting(&format!("The launcher exited with return code {code}"));
        }
    }

    pub(crate) fn record_application_exit(&self, code: i32) {
        self.app_exit_code.store(code, Ordering::SeqCst);
        if code != 0 {
            mpir::set_aborting(&format!("The application exited with return code {code}"));
        }
    }

    /// The launcher's exit code, mirrored as the shim's own exit code.
    pub fn launcher_exit_code(&self) -> i32 {
        self.launcher_exit_code.load(Ordering::SeqCst)
    }

    pub(crate) fn application_exit_code(&self) -> i32 {
        self.app_exit_code.load(Ordering::SeqCst)
    }

    // === Tool lifecycle ===

    pub(crate) fn note_initialized(&self) {
        self.init_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Finalizes one tool session if any is live.
    ///
    /// Safe to call from every teardown path; a no-op once the count is
    /// zero, so repeated calls leave the same state as one.
    pub fn finalize_as_tool(&self) -> Result<(), ShimError> {
        if self.init_count.load(Ordering::SeqCst) > 0 {
            tracing::debug!(count = self.session_count(), "finalizing as tool");
            match self.client.tool_finalize() {
                Ok(()) => {
                    self.init_count.fetch_sub(1, Ordering::SeqCst);
                }
                Err(status) => {
                    eprintln!("PMIx tool finalize failed: {status}");
                    return Err(ShimError::Pmix {
                        op: "PMIx_tool_finalize",
                        status,
                    });
                }
            }
        }
        Ok(())
    }

    // === Failure paths ===

    /// Prints a fatal error, finalizes the tool and exits the process.
    ///
    /// Reserved for invariant violations that leave nothing to recover:
    /// missing namespaces, malformed query responses.
    pub(crate) fn fatal(&self, status: Option<Status>, msg: &str) -> ! {
        match status {
            Some(s) => eprintln!("FATAL ERROR: {msg}: {s}"),
            None => eprintln!("FATAL ERROR: {msg}"),
        }
        let _ = self.finalize_as_tool();
        std::process::exit(1);
    }

    /// Callback-safe exit: no finalize, no atexit.
    ///
    /// Used when termination is detected inside a client-library callback,
    /// where re-entering the library would deadlock. Latches must be
    /// released before calling this.
    pub(crate) fn hard_exit(&self, code: i32) {
        if let Ok(exit) = self.hard_exit.lock() {
            (*exit)(code);
        }
    }

    /// Replaces the callback-safe exit path.
    ///
    /// Embedders hosting the shim inside a larger tool process can intercept
    /// the emergency exit; the replacement must not return control to the
    /// client library (park the thread or unwind the process itself).
    pub fn set_hard_exit(&self, exit: impl Fn(i32) + Send + 'static) {
        if let Ok(mut g) = self.hard_exit.lock() {
            *g = Box::new(exit);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-crate client double shared by the unit tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::pmix::{
        AppContext, EventCode, Info, Key, Query, Range, RegistrationReply, RegistrationRequest,
        SpawnOutcome, Value,
    };

    /// Counts lifecycle calls; every other operation is inert.
    #[derive(Default)]
    pub(crate) struct CountingClient {
        pub(crate) finalize_calls: AtomicUsize,
    }

    #[async_trait]
    impl PmixClient for CountingClient {
        fn tool_init(&self, ident: &ProcId, _attrs: Vec<Info>) -> Result<ProcId, Status> {
            Ok(ident.clone())
        }

        fn tool_finalize(&self) -> Result<(), Status> {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn connect_to_server(
            &self,
            _ident: &ProcId,
            _attrs: Vec<Info>,
        ) -> Result<(), Status> {
            Ok(())
        }

        async fn spawn(&self, _directives: Vec<Info>, _apps: Vec<AppContext>) -> SpawnOutcome {
            SpawnOutcome {
                status: Status::Success,
                nspace: "launcher.1".into(),
            }
        }

        async fn query(&self, _queries: Vec<Query>) -> Result<Vec<Info>, Status> {
            Ok(Vec::new())
        }

        fn get(&self, _proc: &ProcId, _key: Key) -> Result<Value, Status> {
            Err(Status::NotFound)
        }

        fn register_event_handler(&self, req: RegistrationRequest) {
            let _ = req.reply.send(RegistrationReply {
                status: Status::Success,
                id: HandlerId(1),
            });
        }

        fn notify_event(&self, _code: EventCode, _range: Range, _attrs: Vec<Info>) -> Status {
            Status::Success
        }
    }

    pub(crate) fn counting_context() -> (Arc<ShimContext>, Arc<CountingClient>) {
        let client = Arc::new(CountingClient::default());
        let ctx = ShimContext::new(client.clone(), Mode::Proxy);
        (ctx, client)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::counting_context;
    use super::*;
    use crate::mpir::test_support;

    #[test]
    fn finalize_is_idempotent() {
        let (ctx, client) = counting_context();
        ctx.note_initialized();

        for _ in 0..4 {
            ctx.finalize_as_tool().unwrap();
        }
        assert_eq!(client.finalize_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finalize_consumes_each_init_once() {
        let (ctx, client) = counting_context();
        ctx.note_initialized();
        ctx.note_initialized();

        ctx.finalize_as_tool().unwrap();
        ctx.finalize_as_tool().unwrap();
        ctx.finalize_as_tool().unwrap();
        assert_eq!(client.finalize_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn termination_marker_cancels_waits() {
        let (ctx, _) = counting_context();
        assert!(!ctx.launcher_terminated());
        assert_eq!(ctx.termination(), Termination::Running);

        ctx.mark_launcher_terminated(Termination::ViaApplication);
        assert!(ctx.launcher_terminated());
        assert_eq!(ctx.termination(), Termination::ViaApplication);
        assert!(ctx.terminated_token().is_cancelled());
    }

    #[test]
    fn nonzero_launcher_exit_sets_abort_state() {
        let _guard = test_support::lock();
        test_support::reset();

        let (ctx, _) = counting_context();
        ctx.record_launcher_exit(42);
        assert_eq!(ctx.launcher_exit_code(), 42);
        assert_eq!(mpir::debug_state(), mpir::MPIR_DEBUG_ABORTING);
        assert_eq!(
            mpir::abort_string().as_deref(),
            Some("The launcher exited with return code 42")
        );
        test_support::reset();
    }

    #[test]
    fn zero_exit_leaves_debug_state_alone() {
        let _guard = test_support::lock();
        test_support::reset();

        let (ctx, _) = counting_context();
        ctx.record_launcher_exit(0);
        ctx.record_application_exit(0);
        assert_eq!(mpir::debug_state(), mpir::MPIR_NULL);
        assert!(mpir::abort_string().is_none());
    }
}
