//! # Namespace and proc-table resolution.
//!
//! Resolves which job to describe and turns the launcher's answer into the
//! MPIR descriptor table:
//!
//! - in attach mode, the launcher identity comes from the tool's own
//!   keystore and the application namespace from a namespace query;
//! - in the launch modes both identities are already known by the time the
//!   table is built.
//!
//! The proc-table query returns one record per application process, in no
//! particular order; materialisation places each record at its rank index
//! and copies the strings, because the query response does not outlive the
//! call. Malformed responses are invariant violations and take the fatal
//! path: there is no debugging session to salvage without a table.

use std::sync::Arc;

use crate::context::ShimContext;
use crate::error::ShimError;
use crate::mpir::{self, TableEntry};
use crate::pmix::{Info, Key, ProcId, ProcInfo, Query, Value};

/// Learns the launcher identity from the tool keystore (attach mode).
pub(crate) fn query_launcher_identity(ctx: &Arc<ShimContext>) -> Result<(), ShimError> {
    let tool = ctx.tool().ok_or(ShimError::MissingIdentity { which: "tool" })?;

    let nspace = match ctx.client().get(&tool, Key::ServerNspace) {
        Ok(Value::String(s)) => s,
        Ok(_) | Err(_) => ctx.fatal(None, "server namespace is not available from the keystore"),
    };
    let rank = match ctx.client().get(&tool, Key::ServerRank) {
        Ok(v) => match v.as_rank() {
            Some(r) => r,
            None => ctx.fatal(None, "server rank has the wrong type in the keystore"),
        },
        Err(_) => ctx.fatal(None, "server rank is not available from the keystore"),
    };

    let launcher = ProcId::new(nspace, rank);
    tracing::debug!(launcher = %launcher, "launcher identity from keystore");
    ctx.set_launcher(launcher);
    Ok(())
}

/// Asks the launcher for the application namespace (attach mode).
pub(crate) async fn query_application_namespace(ctx: &Arc<ShimContext>) -> Result<(), ShimError> {
    let launcher = ctx.launcher().ok_or(ShimError::MissingIdentity {
        which: "launcher",
    })?;

    let query = Query {
        keys: vec![Key::QueryNamespaces],
        qualifiers: vec![
            Info::string(Key::Nspace, launcher.nspace.clone()),
            Info::rank(Key::Rank, launcher.rank),
        ],
    };

    let response = ctx
        .client()
        .query(vec![query])
        .await
        .map_err(|status| {
            eprintln!("An error occurred querying the application namespace: {status}");
            ShimError::Pmix {
                op: "PMIx_Query_info",
                status,
            }
        })?;

    if response.len() != 1 {
        ctx.fatal(None, "the response to the namespace query has the wrong format");
    }
    let nspace = match response[0].value.as_str() {
        Some(s) if !s.is_empty() => s.to_owned(),
        _ => ctx.fatal(None, "the response to the namespace query has the wrong format"),
    };

    tracing::debug!(namespace = %nspace, "application namespace");
    ctx.set_application(ProcId::wildcard(nspace));
    Ok(())
}

/// Queries the application's proc table, publishes the MPIR descriptor
/// array, and notifies the debugger through the breakpoint.
pub(crate) async fn build_proctable(ctx: &Arc<ShimContext>) -> Result<(), ShimError> {
    let application = ctx.application().ok_or(ShimError::MissingIdentity {
        which: "application",
    })?;

    let query = Query {
        keys: vec![Key::QueryProcTable],
        qualifiers: vec![Info::string(Key::Nspace, application.nspace.clone())],
    };

    let mut response = ctx
        .client()
        .query(vec![query])
        .await
        .map_err(|status| {
            eprintln!("An error occurred querying the proc table: {status}");
            ShimError::Pmix {
                op: "PMIx_Query_info",
                status,
            }
        })?;

    if response.len() != 1 {
        ctx.fatal(None, "proc table query returned no data");
    }
    let records = match response.pop().map(|i| i.value) {
        Some(Value::ProcInfos(records)) => records,
        _ => ctx.fatal(None, "proc table response has an incorrect data type"),
    };

    let entries = match materialize(&records) {
        Ok(entries) => entries,
        Err(msg) => ctx.fatal(None, &msg),
    };

    tracing::debug!(size = entries.len(), "publishing proc table");
    mpir::publish_proctable(entries);
    mpir::set_spawned();

    // The table and the state are visible before the debugger is notified.
    mpir::MPIR_Breakpoint();
    Ok(())
}

/// Orders the query records into a rank-indexed descriptor table.
///
/// Records may arrive in any order; each rank in `[0, N)` must appear
/// exactly once.
pub(crate) fn materialize(records: &[ProcInfo]) -> Result<Vec<TableEntry>, String> {
    if records.is_empty() {
        return Err("proc table query returned no processes".to_string());
    }

    let size = records.len();
    let mut slots: Vec<Option<TableEntry>> = (0..size).map(|_| None).collect();
    for record in records {
        let rank = record.proc.rank;
        let index = rank.0 as usize;
        if rank.is_wildcard() || index >= size {
            return Err(format!(
                "proc table rank {rank} is outside a table of {size} entries"
            ));
        }
        if slots[index].is_some() {
            return Err(format!("proc table has two entries for rank {rank}"));
        }
        slots[index] = Some(TableEntry {
            host_name: record.hostname.clone(),
            executable_name: record.executable_name.clone(),
            pid: record.pid as i32,
        });
    }

    // Every slot is filled: N records, N slots, no duplicates.
    slots
        .into_iter()
        .enumerate()
        .map(|(rank, slot)| slot.ok_or(format!("proc table is missing rank {rank}")))
        .collect()
}
