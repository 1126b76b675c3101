//! # PMIx interface model.
//!
//! The PMIx client library sits outside this crate; the shim reaches it only
//! through the [`PmixClient`] trait and the vocabulary types defined here.

mod client;
mod types;

pub use client::{
    AppContext, EventHandlerFn, HandlerId, PmixClient, RegistrationReply, RegistrationRequest,
    SpawnOutcome,
};
pub use types::{
    Completion, EventAction, EventCode, Info, Key, Notification, ProcId, ProcInfo, ProcState,
    Query, Range, Rank, Status, Value,
};
