//! # Exported MPIR process-acquisition surface.
//!
//! These are the well-known symbols a parallel debugger locates in the
//! starter's symbol table, per the MPIR Process Acquisition Interface v1.1.
//! Only the subset needed for job-spawn and abort notification is provided;
//! per-rank state tracking and message-queue inspection are out of scope.
//!
//! | Symbol | Read/written by |
//! |--------|-----------------|
//! | `MPIR_being_debugged` | written by the debugger, never by the shim |
//! | `MPIR_proctable`, `MPIR_proctable_size` | written once before the breakpoint |
//! | `MPIR_debug_state` | NULL → SPAWNED → ABORTING, monotonic |
//! | `MPIR_debug_abort_string` | set at most once, first writer wins |
//! | `MPIR_i_am_starter` & co. | presence flags, value irrelevant |
//! | `MPIR_Breakpoint` | the debugger's breakpoint target |
//!
//! The mutable symbols are atomics: they have the same object layout as the
//! plain `volatile int` / pointer the contract describes, and they make the
//! unsynchronised writes from event-handler threads well-defined.

#![allow(non_upper_case_globals, non_snake_case)]

use std::ffi::{c_char, c_int, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};

/// No MPIR event pending; the tool ignores the state and continues.
pub const MPIR_NULL: i32 = 0;
/// The starter has spawned the job and filled in the process descriptor
/// table.
pub const MPIR_DEBUG_SPAWNED: i32 = 1;
/// The job has aborted; `MPIR_debug_abort_string` carries the reason.
pub const MPIR_DEBUG_ABORTING: i32 = 2;

/// Process descriptor for a single MPI rank.
///
/// Field order and types are part of the external contract: the debugger
/// reads them through debug symbols.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct MPIR_PROCDESC {
    pub host_name: *mut c_char,
    pub executable_name: *mut c_char,
    pub pid: c_int,
}

/// Set by the debugger to announce its presence; the shim only exports it.
#[no_mangle]
pub static MPIR_being_debugged: AtomicI32 = AtomicI32::new(0);

/// Descriptor table, indexed by MPI rank. Null until published.
#[no_mangle]
pub static MPIR_proctable: AtomicPtr<MPIR_PROCDESC> = AtomicPtr::new(ptr::null_mut());

/// Number of entries in `MPIR_proctable`.
#[no_mangle]
pub static MPIR_proctable_size: AtomicI32 = AtomicI32::new(0);

/// Job state observed by the debugger when `MPIR_Breakpoint` is hit.
#[no_mangle]
pub static MPIR_debug_state: AtomicI32 = AtomicI32::new(MPIR_NULL);

/// Human-readable abort reason, lazily allocated when the job aborts.
#[no_mangle]
pub static MPIR_debug_abort_string: AtomicPtr<c_char> = AtomicPtr::new(ptr::null_mut());

/// Presence marks this process as a starter, not an MPI rank 0.
#[no_mangle]
pub static MPIR_i_am_starter: c_int = 0;

/// Presence asks the tool to show the main subprogram after acquisition.
#[no_mangle]
pub static MPIR_force_to_main: c_int = 0;

/// Presence declares that attaching to a subset of ranks is supported.
#[no_mangle]
pub static MPIR_partial_attach_ok: c_int = 0;

/// Presence asks the tool to suppress message-queue support.
#[no_mangle]
pub static MPIR_ignore_queues: c_int = 0;

// Hook slot invoked from MPIR_Breakpoint. Stable Rust has no weak symbols,
// so the testcase hook of the MPIR document is a settable function pointer.
static BREAKPOINT_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Installs a hook called from [`MPIR_Breakpoint`].
///
/// Production code never sets one; test drivers use it to observe that the
/// breakpoint fired with the table and state already published.
pub fn set_breakpoint_hook(hook: fn()) {
    BREAKPOINT_HOOK.store(hook as usize, Ordering::SeqCst);
}

/// The debugger's breakpoint target.
///
/// The starter calls it after `MPIR_debug_state` and the descriptor table are
/// visible; the body is otherwise empty and must stay out-of-line so the
/// symbol remains a valid breakpoint address.
#[no_mangle]
#[inline(never)]
pub extern "C" fn MPIR_Breakpoint() {
    let hook = BREAKPOINT_HOOK.load(Ordering::SeqCst);
    if hook != 0 {
        // Stored from `fn()` in set_breakpoint_hook; transmuting back is the
        // inverse of that cast.
        let hook: fn() = unsafe { std::mem::transmute(hook) };
        hook();
    }
}

/// One owned descriptor row, prior to publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub host_name: String,
    pub executable_name: String,
    pub pid: i32,
}

fn into_c(s: String) -> *mut c_char {
    CString::new(s).unwrap_or_default().into_raw()
}

/// Publishes the descriptor table, replacing (and reclaiming) any previous
/// one. The table is read-only after publication until freed.
pub(crate) fn publish_proctable(entries: Vec<TableEntry>) {
    let descs: Vec<MPIR_PROCDESC> = entries
        .into_iter()
        .map(|e| MPIR_PROCDESC {
            host_name: into_c(e.host_name),
            executable_name: into_c(e.executable_name),
            pid: e.pid,
        })
        .collect();
    let len = descs.len();
    let table = Box::into_raw(descs.into_boxed_slice()) as *mut MPIR_PROCDESC;

    free_proctable();
    MPIR_proctable.store(table, Ordering::SeqCst);
    MPIR_proctable_size.store(len as i32, Ordering::SeqCst);
}

/// Frees the published table and every string it owns, exactly once.
///
/// Runs from the atexit path; safe to call when nothing is published.
pub(crate) fn free_proctable() {
    let size = MPIR_proctable_size.swap(0, Ordering::SeqCst);
    let table = MPIR_proctable.swap(ptr::null_mut(), Ordering::SeqCst);
    if table.is_null() {
        return;
    }
    // Reconstructs the allocation from publish_proctable; the swap above
    // guarantees single ownership even if two teardown paths race here.
    unsafe {
        let mut entries = Box::from_raw(ptr::slice_from_raw_parts_mut(table, size as usize));
        for desc in entries.iter_mut() {
            if !desc.host_name.is_null() {
                drop(CString::from_raw(desc.host_name));
            }
            if !desc.executable_name.is_null() {
                drop(CString::from_raw(desc.executable_name));
            }
        }
    }
}

/// Marks the job spawn event.
pub(crate) fn set_spawned() {
    MPIR_debug_state.store(MPIR_DEBUG_SPAWNED, Ordering::SeqCst);
}

/// Marks the job aborted and records the reason.
///
/// The state store and the string publication are each single writes; the
/// compare-exchange keeps the first reason when the launcher- and
/// application-termination handlers race, and the loser reclaims its own
/// allocation.
pub(crate) fn set_aborting(message: &str) {
    MPIR_debug_state.store(MPIR_DEBUG_ABORTING, Ordering::SeqCst);
    let owned = CString::new(message).unwrap_or_default().into_raw();
    if MPIR_debug_abort_string
        .compare_exchange(ptr::null_mut(), owned, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        unsafe { drop(CString::from_raw(owned)) };
    }
}

/// Current `MPIR_debug_state` value.
pub fn debug_state() -> i32 {
    MPIR_debug_state.load(Ordering::SeqCst)
}

/// Current abort reason, if one has been recorded.
pub fn abort_string() -> Option<String> {
    let p = MPIR_debug_abort_string.load(Ordering::SeqCst);
    if p.is_null() {
        None
    } else {
        // The pointer is published once and never freed while the process
        // lives; the debugger may still be reading it at teardown.
        Some(unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
    }
}

/// Number of published descriptor rows.
pub fn proctable_size() -> i32 {
    MPIR_proctable_size.load(Ordering::SeqCst)
}

/// True when a descriptor table is published.
pub fn proctable_is_published() -> bool {
    !MPIR_proctable.load(Ordering::SeqCst).is_null()
}


#[cfg(test)]
mod tests {
    use super::test_support;
    use super::*;

    fn entry(host: &str, exec: &str, pid: i32) -> TableEntry {
        TableEntry {
            host_name: host.into(),
            executable_name: exec.into(),
            pid,
        }
    }

    #[test]
    fn publish_and_free_roundtrip() {
        let _guard = test_support::lock();
        test_support::reset();

        publish_proctable(vec![entry("n0", "/bin/a", 100), entry("n1", "/bin/a", 101)]);
        assert!(proctable_is_published());
        assert_eq!(proctable_size(), 2);

        let table = MPIR_proctable.load(Ordering::SeqCst);
        let first = unsafe { &*table };
        assert_eq!(
            unsafe { CStr::from_ptr(first.host_name) }.to_str().unwrap(),
            "n0"
        );
        assert_eq!(first.pid, 100);

        free_proctable();
        assert!(!proctable_is_published());
        assert_eq!(proctable_size(), 0);

        // Freeing again is a no-op.
        free_proctable();
    }

    #[test]
    fn republish_replaces_previous_table() {
        let _guard = test_support::lock();
        test_support::reset();

        publish_proctable(vec![entry("n0", "/bin/a", 1)]);
        publish_proctable(vec![entry("n0", "/bin/b", 2), entry("n1", "/bin/b", 3)]);
        assert_eq!(proctable_size(), 2);
        free_proctable();
    }

    #[test]
    fn first_abort_reason_wins() {
        let _guard = test_support::lock();
        test_support::reset();

        set_aborting("The launcher exited with return code 42");
        set_aborting("The application exited with return code 7");
        assert_eq!(debug_state(), MPIR_DEBUG_ABORTING);
        assert_eq!(
            abort_string().as_deref(),
            Some("The launcher exited with return code 42")
        );
    }

    #[test]
    fn breakpoint_invokes_hook() {
        let _guard = test_support::lock();
        test_support::reset();

        static HITS: AtomicI32 = AtomicI32::new(0);
        HITS.store(0, Ordering::SeqCst);
        set_breakpoint_hook(|| {
            HITS.fetch_add(1, Ordering::SeqCst);
        });
        MPIR_Breakpoint();
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        test_support::reset();
    }
}
