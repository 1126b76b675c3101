//! # Named latches.
//!
//! A [`Latch`] is a bistable gate the driver blocks on until an event handler
//! posts it. It starts armed; `post` disarms it and wakes every waiter; a
//! completed wait re-arms it so the same latch can gate the next phase.
//!
//! Every wait is additionally bounded by the launcher-terminated token: once
//! the launcher is known dead there is nothing left to wait for, so waits
//! return instead of hanging the driver.
//!
//! ```text
//!   driver ──wait──► ┌─────────────┐ ◄──post── event handler
//!                    │ Latch       │
//!                    │ armed: bool │ ◄──post── release_all (termination)
//!                    └─────────────┘
//! ```

use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A named, re-armable gate.
pub(crate) struct Latch {
    name: &'static str,
    armed: Mutex<bool>,
    notify: Notify,
}

impl Latch {
    /// Creates the latch armed: the next wait will block until a post.
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            armed: Mutex::new(true),
            notify: Notify::new(),
        }
    }

    pub(crate) fn armed(&self) -> bool {
        self.armed.lock().map(|g| *g).unwrap_or(false)
    }

    /// Disarms the latch and wakes every current waiter.
    ///
    /// Callable from any thread, including the client library's callback
    /// pool.
    pub(crate) fn post(&self) {
        if let Ok(mut armed) = self.armed.lock() {
            *armed = false;
        }
        self.notify.notify_waiters();
        tracing::debug!(latch = self.name, "posted");
    }

    /// Blocks while the latch is armed and the launcher is not known
    /// terminated, then re-arms for the next use.
    pub(crate) async fn wait(&self, terminated: &CancellationToken) {
        tracing::debug!(latch = self.name, "waiting");
        loop {
            // The waiter must be enabled before the armed check, otherwise a
            // post landing between the check and the await would be lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.armed() || terminated.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = terminated.cancelled() => {}
            }
        }
        if let Ok(mut armed) = self.armed.lock() {
            *armed = true;
        }
        tracing::debug!(latch = self.name, "resumed");
    }
}

/// The latch set owned by the shim context.
pub(crate) struct Latches {
    pub(crate) launch_complete: Latch,
    pub(crate) ready_for_debug: Latch,
    pub(crate) launch_term: Latch,
}

impl Latches {
    pub(crate) fn new() -> Self {
        Self {
            launch_complete: Latch::new("launch-complete"),
            ready_for_debug: Latch::new("ready-for-debug"),
            launch_term: Latch::new("launch-term"),
        }
    }

    /// Posts every still-armed latch so no waiter outlives the launcher.
    ///
    /// This is the only safe way to unblock the driver during abnormal
    /// termination; it runs from the termination handlers and from the
    /// lost-connection branch of the default handler.
    pub(crate) fn release_all(&self) {
        for latch in [
            &self.launch_complete,
            &self.ready_for_debug,
            &self.launch_term,
        ] {
            if latch.armed() {
                latch.post();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_after_post_returns_immediately() {
        let latch = Latch::new("t");
        let token = CancellationToken::new();
        latch.post();
        tokio::time::timeout(Duration::from_secs(1), latch.wait(&token))
            .await
            .expect("wait should not block after a post");
        // The completed wait re-armed the latch.
        assert!(latch.armed());
    }

    #[tokio::test]
    async fn post_from_another_thread_wakes_waiter() {
        let latch = Arc::new(Latch::new("t"));
        let token = CancellationToken::new();
        let poster = latch.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poster.post();
        });
        tokio::time::timeout(Duration::from_secs(2), latch.wait(&token))
            .await
            .expect("post should wake the waiter");
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn terminated_token_unblocks_armed_latch() {
        let latch = Arc::new(Latch::new("t"));
        let token = CancellationToken::new();
        let canceller = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        tokio::time::timeout(Duration::from_secs(2), latch.wait(&token))
            .await
            .expect("termination should wake the waiter");
        handle.join().unwrap();
        // Never posted: the latch stays armed for the next (non-)use.
        assert!(latch.armed());
    }

    #[tokio::test]
    async fn release_all_posts_only_armed_latches() {
        let latches = Latches::new();
        latches.ready_for_debug.post();
        assert!(!latches.ready_for_debug.armed());

        latches.release_all();
        assert!(!latches.launch_complete.armed());
        assert!(!latches.launch_term.armed());

        let token = CancellationToken::new();
        for latch in [
            &latches.launch_complete,
            &latches.ready_for_debug,
            &latches.launch_term,
        ] {
            tokio::time::timeout(Duration::from_secs(1), latch.wait(&token))
                .await
                .expect("no latch may block after release_all");
        }
    }
}
