//! Scripted PMIx client double for the end-to-end scenarios.
//!
//! The double plays both the client library and the launcher behind it: it
//! records every call the shim makes, and reacts to the debugger-release
//! notifications by emitting the events a real launcher would, from its own
//! threads, the way the library's progress pool does.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mpir_shim::pmix::{
    AppContext, Completion, EventCode, EventHandlerFn, HandlerId, Info, Key, Notification,
    PmixClient, ProcId, ProcInfo, ProcState, Query, Range, Rank, RegistrationReply,
    RegistrationRequest, SpawnOutcome, Status, Value,
};

/// What the scripted launcher does once it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Launch completes, the job runs, the launcher exits with the scripted
    /// code after the application is released.
    Normal,
    /// The launcher dies with the scripted code before ever becoming ready.
    AbortBeforeReady,
    /// After the application is released, the server connection drops
    /// instead of the job terminating.
    LoseConnection,
}

/// One scripted run.
#[derive(Debug, Clone)]
pub struct Script {
    pub launcher_nspace: String,
    pub app_nspace: String,
    pub proctable: Vec<ProcInfo>,
    pub launcher_exit_code: i32,
    pub behavior: Behavior,
}

impl Script {
    /// A healthy launch of `nprocs` application ranks.
    ///
    /// Proc-table records are scripted in reverse rank order on purpose.
    pub fn launch(nprocs: u32) -> Self {
        let proctable = (0..nprocs)
            .rev()
            .map(|rank| ProcInfo {
                proc: ProcId::new("app.1", Rank(rank)),
                hostname: format!("node{}", rank % 2),
                executable_name: "./hello".to_string(),
                pid: 4200 + rank,
                exit_code: 0,
                state: ProcState::Running,
            })
            .collect();
        Self {
            launcher_nspace: "prterun.57621".to_string(),
            app_nspace: "app.1".to_string(),
            proctable,
            launcher_exit_code: 0,
            behavior: Behavior::Normal,
        }
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.launcher_exit_code = code;
        self
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }
}

struct Registered {
    name: String,
    codes: Vec<EventCode>,
    affected: Option<ProcId>,
    handler: Arc<EventHandlerFn>,
}

#[derive(Default)]
struct State {
    handlers: Vec<Registered>,
    next_handler_id: u64,
    calls: Vec<String>,
    init_attrs: Vec<Info>,
    finalize_calls: usize,
}

pub struct MockPmix {
    script: Script,
    state: Mutex<State>,
    completions: AtomicUsize,
    me: Mutex<Weak<MockPmix>>,
}

impl MockPmix {
    pub fn new(script: Script) -> Arc<Self> {
        let mock = Arc::new(Self {
            script,
            state: Mutex::new(State::default()),
            completions: AtomicUsize::new(0),
            me: Mutex::new(Weak::new()),
        });
        *mock.me.lock().unwrap() = Arc::downgrade(&mock);
        mock
    }

    fn arc(&self) -> Arc<Self> {
        self.me.lock().unwrap().upgrade().expect("mock still alive")
    }

    /// Every call the shim made, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_index(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn finalize_calls(&self) -> usize {
        self.state.lock().unwrap().finalize_calls
    }

    /// Number of event-handler continuations invoked.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn init_attr_keys(&self) -> Vec<Key> {
        self.state
            .lock()
            .unwrap()
            .init_attrs
            .iter()
            .map(|i| i.key)
            .collect()
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }

    fn has_handler_for(&self, code: EventCode) -> bool {
        self.state
            .lock()
            .unwrap()
            .handlers
            .iter()
            .any(|h| h.codes.contains(&code))
    }

    fn wait_for_handler(&self, code: EventCode) {
        for _ in 0..2000 {
            if self.has_handler_for(code) {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("no handler registered for {code} within the wait budget");
    }

    /// Delivers an event the way the library would: to every matching
    /// code-specific handler, or to the default handlers when none match.
    fn dispatch(&self, code: EventCode, source: Option<ProcId>, infos: Vec<Info>) {
        let affected = infos
            .iter()
            .find(|i| i.key == Key::EventAffectedProc)
            .and_then(|i| i.value.as_proc())
            .cloned();

        let handlers: Vec<Arc<EventHandlerFn>> = {
            let state = self.state.lock().unwrap();
            let specific: Vec<_> = state
                .handlers
                .iter()
                .filter(|h| {
                    h.codes.contains(&code)
                        && match (&h.affected, &affected) {
                            (Some(filter), Some(affected)) => filter.covers(affected),
                            (Some(_), None) => false,
                            (None, _) => true,
                        }
                })
                .map(|h| h.handler.clone())
                .collect();
            if !specific.is_empty() {
                specific
            } else {
                state
                    .handlers
                    .iter()
                    .filter(|h| h.codes.is_empty())
                    .map(|h| h.handler.clone())
                    .collect()
            }
        };

        let notification = Notification {
            code,
            source,
            infos,
        };
        for handler in handlers {
            let me = self.arc();
            let completion = Completion::new(move |_| {
                me.completions.fetch_add(1, Ordering::SeqCst);
            });
            (handler.as_ref())(&notification, completion);
        }
    }

    fn launcher_rank0(&self) -> ProcId {
        ProcId::new(self.script.launcher_nspace.clone(), Rank(0))
    }

    /// The launcher was released: play the scripted launch sequence.
    fn launcher_released(self: Arc<Self>) {
        std::thread::spawn(move || {
            let launcher_all = ProcId::wildcard(self.script.launcher_nspace.clone());

            // The launch-complete handler is registered after the release;
            // a real launcher takes long enough that it is always in place.
            self.wait_for_handler(EventCode::LaunchComplete);

            if self.script.behavior == Behavior::AbortBeforeReady {
                self.dispatch(
                    EventCode::JobTerminated,
                    Some(self.launcher_rank0()),
                    vec![
                        Info::i32(Key::ExitCode, self.script.launcher_exit_code),
                        Info::proc(Key::EventAffectedProc, launcher_all),
                    ],
                );
                return;
            }
            self.dispatch(
                EventCode::LaunchComplete,
                Some(self.launcher_rank0()),
                vec![
                    Info::string(Key::Nspace, self.script.launcher_nspace.clone()),
                    Info::string(Key::Nspace, self.script.app_nspace.clone()),
                ],
            );
            self.dispatch(
                EventCode::ReadyForDebug,
                Some(self.launcher_rank0()),
                vec![Info::proc(Key::EventAffectedProc, launcher_all)],
            );
        });
    }

    /// The application was released: run to completion or drop the
    /// connection, per the script.
    fn application_released(self: Arc<Self>) {
        std::thread::spawn(move || {
            if self.script.behavior == Behavior::LoseConnection {
                self.dispatch(EventCode::LostConnectionToServer, None, Vec::new());
                return;
            }
            let launcher_all = ProcId::wildcard(self.script.launcher_nspace.clone());
            self.dispatch(
                EventCode::JobTerminated,
                Some(self.launcher_rank0()),
                vec![
                    Info::i32(Key::ExitCode, self.script.launcher_exit_code),
                    Info::proc(Key::EventAffectedProc, launcher_all),
                ],
            );
        });
    }
}

#[async_trait]
impl PmixClient for MockPmix {
    fn tool_init(&self, ident: &ProcId, attrs: Vec<Info>) -> Result<ProcId, Status> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push("tool_init".to_string());
            state.init_attrs = attrs;
        }
        Ok(ident.clone())
    }

    fn tool_finalize(&self) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("tool_finalize".to_string());
        state.finalize_calls += 1;
        Ok(())
    }

    async fn connect_to_server(&self, _ident: &ProcId, _attrs: Vec<Info>) -> Result<(), Status> {
        self.record("connect_to_server");
        Ok(())
    }

    async fn spawn(&self, _directives: Vec<Info>, apps: Vec<AppContext>) -> SpawnOutcome {
        self.record(format!("spawn {}", apps[0].cmd));
        SpawnOutcome {
            status: Status::OperationSucceeded,
            nspace: self.script.launcher_nspace.clone(),
        }
    }

    async fn query(&self, queries: Vec<Query>) -> Result<Vec<Info>, Status> {
        let key = *queries[0].keys.first().ok_or(Status::BadParam)?;
        self.record(format!("query {key}"));
        match key {
            Key::QueryNamespaces => Ok(vec![Info::string(
                Key::QueryNamespaces,
                self.script.app_nspace.clone(),
            )]),
            Key::QueryProcTable => Ok(vec![Info {
                key: Key::QueryProcTable,
                value: Value::ProcInfos(self.script.proctable.clone()),
            }]),
            _ => Err(Status::NotFound),
        }
    }

    fn get(&self, _proc: &ProcId, key: Key) -> Result<Value, Status> {
        match key {
            Key::MyServerUri => Ok(Value::String("pmix://127.0.0.1:12345".to_string())),
            Key::ServerNspace => Ok(Value::String(self.script.launcher_nspace.clone())),
            Key::ServerRank => Ok(Value::Rank(Rank(0))),
            _ => Err(Status::NotFound),
        }
    }

    fn register_event_handler(&self, req: RegistrationRequest) {
        let name = req.name().unwrap_or("<unnamed>").to_string();
        let affected = req.affected().cloned();
        self.record(format!("register {name}"));
        let RegistrationRequest {
            codes,
            handler,
            reply,
            ..
        } = req;

        let id = {
            let mut state = self.state.lock().unwrap();
            state.next_handler_id += 1;
            HandlerId(state.next_handler_id)
        };
        // The reply is buffered before the handler becomes visible, so no
        // scripted event can outrun its own registration completion.
        let _ = reply.send(RegistrationReply {
            status: Status::Success,
            id,
        });
        self.state.lock().unwrap().handlers.push(Registered {
            name,
            codes,
            affected,
            handler,
        });
    }

    fn notify_event(&self, code: EventCode, _range: Range, attrs: Vec<Info>) -> Status {
        let target = attrs
            .iter()
            .find(|i| i.key == Key::EventCustomRange)
            .and_then(|i| i.value.as_proc())
            .cloned();
        let Some(target) = target else {
            return Status::BadParam;
        };
        self.record(format!("notify {code} -> {target}"));

        if code == EventCode::DebuggerRelease {
            if target.nspace == self.script.launcher_nspace {
                self.arc().launcher_released();
            } else if target.nspace == self.script.app_nspace {
                self.arc().application_released();
            }
        }
        Status::OperationSucceeded
    }
}
