//! # PMIx vocabulary types.
//!
//! The shim talks to the launcher through a PMIx client library. That library
//! is an external collaborator, so this module defines the typed vocabulary
//! the two sides exchange: operation statuses, event codes, attribute keys,
//! tagged values, process identities, and the per-process records returned by
//! a proc-table query.
//!
//! Attribute lists replace the C-style `pmix_info_t` arrays: an [`Info`] is a
//! [`Key`] plus a typed [`Value`], and nested directive arrays are just
//! `Value::Infos`.

use std::fmt;

/// Outcome of a PMIx operation.
///
/// Spawn and notify report `OperationSucceeded` when the request completed
/// synchronously; both it and `Success` count as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    OperationSucceeded,
    Error,
    BadParam,
    NotFound,
    Timeout,
    Unreachable,
    LostConnection,
}

impl Status {
    /// True for both of the accepted success codes.
    pub fn ok(self) -> bool {
        matches!(self, Status::Success | Status::OperationSucceeded)
    }

    /// Numeric code, reported next to the error string on failure paths.
    pub fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::OperationSucceeded => 1,
            Status::Error => -1,
            Status::BadParam => -2,
            Status::NotFound => -3,
            Status::Timeout => -4,
            Status::Unreachable => -5,
            Status::LostConnection => -6,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::OperationSucceeded => "OPERATION_SUCCEEDED",
            Status::Error => "ERROR",
            Status::BadParam => "BAD_PARAM",
            Status::NotFound => "NOT_FOUND",
            Status::Timeout => "TIMEOUT",
            Status::Unreachable => "UNREACHABLE",
            Status::LostConnection => "LOST_CONNECTION_TO_SERVER",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Codes carried by event notifications, in both directions.
///
/// The launcher raises `LaunchComplete`, `ReadyForDebug` and `JobTerminated`;
/// the shim raises `DebuggerRelease`; the client library itself raises
/// `LostConnectionToServer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    LaunchComplete,
    ReadyForDebug,
    JobTerminated,
    DebuggerRelease,
    LostConnectionToServer,
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventCode::LaunchComplete => "LAUNCH_COMPLETE",
            EventCode::ReadyForDebug => "READY_FOR_DEBUG",
            EventCode::JobTerminated => "JOB_TERMINATED",
            EventCode::DebuggerRelease => "DEBUGGER_RELEASE",
            EventCode::LostConnectionToServer => "LOST_CONNECTION_TO_SERVER",
        };
        f.write_str(s)
    }
}

/// Attribute keys understood by the client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    // === Tool init ===
    DoNotConnect,
    ToolNspace,
    ToolRank,
    Launcher,
    ConnectSystemFirst,
    ServerPidInfo,
    Prefix,

    // === Server connect ===
    WaitForConnection,
    Timeout,

    // === Spawn directives ===
    MapBy,
    FwdStdout,
    FwdStderr,
    NotifyCompletion,
    NotifyJobEvents,
    LaunchDirectives,
    DebugStopInInit,

    // === Event registration and notification ===
    EventHandlerName,
    EventAffectedProc,
    EventCustomRange,
    EventNonDefault,

    // === Notification payloads ===
    Nspace,
    Rank,
    ExitCode,
    JobTermStatus,

    // === Keystore and query keys ===
    ServerUri,
    MyServerUri,
    ServerNspace,
    ServerRank,
    QueryNamespaces,
    QueryProcTable,
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Key::DoNotConnect => "TOOL_DO_NOT_CONNECT",
            Key::ToolNspace => "TOOL_NSPACE",
            Key::ToolRank => "TOOL_RANK",
            Key::Launcher => "LAUNCHER",
            Key::ConnectSystemFirst => "CONNECT_SYSTEM_FIRST",
            Key::ServerPidInfo => "SERVER_PIDINFO",
            Key::Prefix => "PREFIX",
            Key::WaitForConnection => "WAIT_FOR_CONNECTION",
            Key::Timeout => "TIMEOUT",
            Key::MapBy => "MAPBY",
            Key::FwdStdout => "FWD_STDOUT",
            Key::FwdStderr => "FWD_STDERR",
            Key::NotifyCompletion => "NOTIFY_COMPLETION",
            Key::NotifyJobEvents => "NOTIFY_JOB_EVENTS",
            Key::LaunchDirectives => "LAUNCH_DIRECTIVES",
            Key::DebugStopInInit => "DEBUG_STOP_IN_INIT",
            Key::EventHandlerName => "EVENT_HDLR_NAME",
            Key::EventAffectedProc => "EVENT_AFFECTED_PROC",
            Key::EventCustomRange => "EVENT_CUSTOM_RANGE",
            Key::EventNonDefault => "EVENT_NON_DEFAULT",
            Key::Nspace => "NSPACE",
            Key::Rank => "RANK",
            Key::ExitCode => "EXIT_CODE",
            Key::JobTermStatus => "JOB_TERM_STATUS",
            Key::ServerUri => "SERVER_URI",
            Key::MyServerUri => "MYSERVER_URI",
            Key::ServerNspace => "SERVER_NSPACE",
            Key::ServerRank => "SERVER_RANK",
            Key::QueryNamespaces => "QUERY_NAMESPACES",
            Key::QueryProcTable => "QUERY_PROC_TABLE",
        };
        f.write_str(s)
    }
}

/// Process rank within a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rank(pub u32);

impl Rank {
    /// Matches every rank in a namespace.
    pub const WILDCARD: Rank = Rank(u32::MAX);

    pub fn is_wildcard(self) -> bool {
        self == Rank::WILDCARD
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            f.write_str("*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Namespace plus rank, identifying one process or (with a wildcard rank)
/// every process of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcId {
    pub nspace: String,
    pub rank: Rank,
}

impl ProcId {
    pub fn new(nspace: impl Into<String>, rank: Rank) -> Self {
        Self {
            nspace: nspace.into(),
            rank,
        }
    }

    /// Identity covering every rank of `nspace`.
    pub fn wildcard(nspace: impl Into<String>) -> Self {
        Self::new(nspace, Rank::WILDCARD)
    }

    /// True when `other` falls within this identity (wildcards match any rank).
    pub fn covers(&self, other: &ProcId) -> bool {
        self.nspace == other.nspace
            && (self.rank.is_wildcard() || other.rank.is_wildcard() || self.rank == other.rank)
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.nspace, self.rank)
    }
}

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    String(String),
    U32(u32),
    I32(i32),
    Rank(Rank),
    Proc(ProcId),
    Infos(Vec<Info>),
    ProcInfos(Vec<ProcInfo>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            Value::U32(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_rank(&self) -> Option<Rank> {
        match self {
            Value::Rank(r) => Some(*r),
            Value::U32(v) => Some(Rank(*v)),
            _ => None,
        }
    }

    pub fn as_proc(&self) -> Option<&ProcId> {
        match self {
            Value::Proc(p) => Some(p),
            _ => None,
        }
    }
}

/// One attribute: a key with its typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    pub key: Key,
    pub value: Value,
}

impl Info {
    pub fn bool(key: Key, value: bool) -> Self {
        Self {
            key,
            value: Value::Bool(value),
        }
    }

    pub fn string(key: Key, value: impl Into<String>) -> Self {
        Self {
            key,
            value: Value::String(value.into()),
        }
    }

    pub fn u32(key: Key, value: u32) -> Self {
        Self {
            key,
            value: Value::U32(value),
        }
    }

    pub fn i32(key: Key, value: i32) -> Self {
        Self {
            key,
            value: Value::I32(value),
        }
    }

    pub fn rank(key: Key, value: Rank) -> Self {
        Self {
            key,
            value: Value::Rank(value),
        }
    }

    pub fn proc(key: Key, value: ProcId) -> Self {
        Self {
            key,
            value: Value::Proc(value),
        }
    }

    /// Nested attribute list (directive arrays).
    pub fn infos(key: Key, value: Vec<Info>) -> Self {
        Self {
            key,
            value: Value::Infos(value),
        }
    }
}

/// Life-cycle state of one application process, as reported by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcState {
    #[default]
    Undefined,
    Launched,
    Running,
    Terminated,
}

/// One record of a proc-table query response.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcInfo {
    pub proc: ProcId,
    pub hostname: String,
    pub executable_name: String,
    pub pid: u32,
    pub exit_code: i32,
    pub state: ProcState,
}

/// A keyed query with qualifiers narrowing its scope.
#[derive(Debug, Clone)]
pub struct Query {
    pub keys: Vec<Key>,
    pub qualifiers: Vec<Info>,
}

/// Delivery range of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Range {
    /// Deliver only to the processes named by an `EventCustomRange` attribute.
    Custom,
}

/// Chain action reported back to the client library when a handler finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EventAction {
    Complete,
}

/// An event delivered to a registered handler.
#[derive(Debug, Clone)]
pub struct Notification {
    pub code: EventCode,
    pub source: Option<ProcId>,
    pub infos: Vec<Info>,
}

impl Notification {
    /// First value carried under `key`, if any.
    pub fn find(&self, key: Key) -> Option<&Value> {
        self.infos.iter().find(|i| i.key == key).map(|i| &i.value)
    }

    /// The process this event reports on, when the sender attached one.
    pub fn affected_proc(&self) -> Option<&ProcId> {
        self.find(Key::EventAffectedProc).and_then(Value::as_proc)
    }
}

/// Continuation handed to an event handler; handlers report
/// [`EventAction::Complete`] so the notification chain can progress.
pub struct Completion(Option<Box<dyn FnOnce(EventAction) + Send>>);

impl Completion {
    pub fn new(f: impl FnOnce(EventAction) + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A continuation that ignores the action (no chain behind the event).
    pub fn none() -> Self {
        Self(None)
    }

    pub fn complete(mut self, action: EventAction) {
        if let Some(f) = self.0.take() {
            f(action);
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Completion")
            .field(&self.0.is_some())
            .finish()
    }
}
