//! # mpir-shim
//!
//! **mpir-shim** bridges a parallel debugger and a PMIx-based launcher of
//! distributed jobs (`mpirun`, `prterun`, `prun`, …).
//!
//! Towards the debugger it presents the MPIR Process Acquisition Interface
//! v1.1: the well-known symbols ([`mpir`]) a tool inspects through the
//! starter's symbol table, and the `MPIR_Breakpoint` trap point. Towards the
//! launcher it acts as a PMIx tool: it spawns the launcher, synchronises
//! with it through event notifications, materialises the per-rank process
//! descriptor table, and releases the suspended processes once the debugger
//! has attached.
//!
//! | Area | Description | Key types / modules |
//! |------|-------------|---------------------|
//! | **Modes** | Proxy, non-proxy and attach operation, resolved from the launcher's name. | [`RunMode`], [`Mode`], [`ShimConfig`] |
//! | **Driver** | The launch/attach sequence, latched against launcher events. | [`Shim`], [`run`] |
//! | **MPIR surface** | Exported symbols read by the debugger. | [`mpir`] |
//! | **Client seam** | The PMIx library behind a trait, typed vocabulary included. | [`pmix`] |
//! | **Errors** | Configuration and operation failures. | [`ShimError`] |
//!
//! The PMIx client library itself is not part of this crate: production
//! embedders supply a binding over the real library as a
//! [`PmixClient`](pmix::PmixClient), and the test suite drives the full
//! sequence against a scripted double.
//!
//! ## Example
//! ```no_run
//! # use std::sync::Arc;
//! # async fn demo(client: Arc<dyn mpir_shim::pmix::PmixClient>) -> Result<(), mpir_shim::ShimError> {
//! use mpir_shim::ShimConfig;
//!
//! let mut config = ShimConfig::default();
//! config.run_args = vec!["mpirun".into(), "-n".into(), "4".into(), "./hello".into()];
//!
//! // Mirrors the launcher's exit code once the job is done.
//! let exit_code = mpir_shim::run(client, config).await?;
//! # let _ = exit_code;
//! # Ok(())
//! # }
//! ```
//!
//! ## Optional features
//! - `testcase`: keep the application paused after `MPIR_Breakpoint` and
//!   expose `release_application` so test drivers control the release.

mod config;
mod context;
mod error;
mod events;
mod latch;
pub mod mpir;
pub mod pmix;
mod proctable;
mod release;
mod session;
mod shim;
mod shutdown;
mod spawn;

// ---- Public re-exports ----

pub use config::{Mode, RunMode, ShimConfig};
pub use context::{ShimContext, Termination};
pub use error::ShimError;
pub use shim::{run, Shim};

// Optional: manual application release for test drivers.
// Enable with: `--features testcase`
#[cfg(feature = "testcase")]
pub use release::release_application;
