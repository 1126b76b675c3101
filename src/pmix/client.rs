//! # Client library seam.
//!
//! [`PmixClient`] is the boundary between the shim's coordination core and
//! the PMIx client library. Everything the shim needs from the library is
//! expressed here; a production build plugs in a binding over the real
//! library, tests plug in a scripted double.
//!
//! Event-handler registration completes asynchronously on a library-owned
//! thread. Instead of parking the result in shared slots, each registration
//! carries its own [`oneshot`] reply channel; the registry keeps at most one
//! registration in flight, so handler-id delivery is never ambiguous.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::types::{
    Completion, EventCode, Info, Key, Notification, ProcId, Query, Range, Status, Value,
};

/// Signature shared by every registered event handler.
///
/// Handlers run on threads owned by the client library, concurrently with the
/// driver, and must hand the [`Completion`] back on every path.
pub type EventHandlerFn = dyn Fn(&Notification, Completion) + Send + Sync;

/// Identifier assigned to a registered handler by the client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Registration outcome delivered on the request's reply channel.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationReply {
    pub status: Status,
    pub id: HandlerId,
}

/// One event-handler registration.
pub struct RegistrationRequest {
    /// Event codes the handler receives; empty means unfiltered (default
    /// handler).
    pub codes: Vec<EventCode>,
    /// Registration metadata: handler name, affected-proc filter.
    pub infos: Vec<Info>,
    /// The handler itself.
    pub handler: Arc<EventHandlerFn>,
    /// Completion channel written by the library once the handler is live.
    pub reply: oneshot::Sender<RegistrationReply>,
}

impl RegistrationRequest {
    /// Handler name carried in the registration metadata, for diagnostics.
    pub fn name(&self) -> Option<&str> {
        self.infos
            .iter()
            .find(|i| i.key == Key::EventHandlerName)
            .and_then(|i| i.value.as_str())
    }

    /// Affected-proc filter carried in the registration metadata.
    pub fn affected(&self) -> Option<&ProcId> {
        self.infos
            .iter()
            .find(|i| i.key == Key::EventAffectedProc)
            .and_then(|i| i.value.as_proc())
    }
}

/// Result of spawning the launcher job.
///
/// The raw status is preserved because callers accept both
/// [`Status::Success`] and [`Status::OperationSucceeded`].
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub status: Status,
    pub nspace: String,
}

/// One application context of a spawn request.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub cmd: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    pub maxprocs: u32,
}

/// Operations the shim requires from a PMIx client library.
#[async_trait]
pub trait PmixClient: Send + Sync {
    /// Initialise this process as a tool with the given identity and
    /// attribute set; returns the identity assigned by the library.
    fn tool_init(&self, ident: &ProcId, attrs: Vec<Info>) -> Result<ProcId, Status>;

    /// Tear down one tool session.
    fn tool_finalize(&self) -> Result<(), Status>;

    /// Connect the tool to a server.
    async fn connect_to_server(&self, ident: &ProcId, attrs: Vec<Info>) -> Result<(), Status>;

    /// Spawn a job described by `apps` under the given job-level directives.
    async fn spawn(&self, directives: Vec<Info>, apps: Vec<AppContext>) -> SpawnOutcome;

    /// Resolve queries against the connected server.
    async fn query(&self, queries: Vec<Query>) -> Result<Vec<Info>, Status>;

    /// Look up a key in the tool's own keystore.
    fn get(&self, proc: &ProcId, key: Key) -> Result<Value, Status>;

    /// Register an event handler; the outcome arrives on the request's reply
    /// channel from a library thread.
    fn register_event_handler(&self, req: RegistrationRequest);

    /// Emit a notification.
    fn notify_event(&self, code: EventCode, range: Range, attrs: Vec<Info>) -> Status;
}
