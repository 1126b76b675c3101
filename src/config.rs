//! # Run configuration and mode resolution.
//!
//! [`ShimConfig`] captures everything the entry point accepts: the requested
//! [`RunMode`], the attach target PID, the debug flag, the launcher command
//! line, and an optional PMIx installation prefix.
//!
//! `RunMode::Dynamic` is resolved at startup by looking at the launcher
//! binary's basename: `prun` selects non-proxy operation (the tool spawns
//! through an existing system server), anything else selects proxy operation
//! (the tool itself is the rendezvous point for the spawned launcher).
//!
//! # Example
//! ```
//! use mpir_shim::{Mode, RunMode, ShimConfig};
//!
//! let mut cfg = ShimConfig::default();
//! cfg.run_args = vec!["mpirun".into(), "-n".into(), "4".into(), "./hello".into()];
//! assert_eq!(cfg.resolve().unwrap(), Mode::Proxy);
//! ```

use std::path::Path;

use crate::error::ShimError;

/// Requested operating mode, as given on the command line or by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Decide between [`Proxy`](Mode::Proxy) and [`NonProxy`](Mode::NonProxy)
    /// from the launcher binary's name.
    #[default]
    Dynamic,
    /// Force proxy operation.
    Proxy,
    /// Force non-proxy operation.
    NonProxy,
    /// Bind to an already-running launcher identified by PID.
    Attach,
}

/// Operating mode after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Proxy,
    NonProxy,
    Attach,
}

/// Options consumed by the shim entry point.
///
/// `run_args` is the launcher command and its arguments, exactly as they
/// would be typed in a shell (`["mpirun", "-n", "4", "./hello"]`); it is
/// empty in attach mode.
#[derive(Debug, Clone, Default)]
pub struct ShimConfig {
    /// Requested operating mode.
    pub mode: RunMode,
    /// PID of the running launcher to bind to (attach mode only).
    pub target_pid: u32,
    /// Enable debug output from the shim.
    pub debug: bool,
    /// Launcher command line, `argv[0]` included.
    pub run_args: Vec<String>,
    /// Explicit PMIx installation prefix, if the default lookup is wrong.
    pub pmix_prefix: Option<String>,
}

impl ShimConfig {
    /// Resolves the requested mode against the captured arguments.
    ///
    /// Fails with a configuration error when attach mode has no usable PID
    /// or a launch mode has no launcher command.
    pub fn resolve(&self) -> Result<Mode, ShimError> {
        match self.mode {
            RunMode::Attach => {
                if self.target_pid == 0 {
                    eprintln!("Invalid connect pid {}.", self.target_pid);
                    return Err(ShimError::InvalidTargetPid {
                        pid: self.target_pid,
                    });
                }
                Ok(Mode::Attach)
            }
            RunMode::Proxy => {
                self.launcher_basename()?;
                Ok(Mode::Proxy)
            }
            RunMode::NonProxy => {
                self.launcher_basename()?;
                Ok(Mode::NonProxy)
            }
            RunMode::Dynamic => {
                if self.launcher_basename()? == "prun" {
                    Ok(Mode::NonProxy)
                } else {
                    Ok(Mode::Proxy)
                }
            }
        }
    }

    fn launcher_basename(&self) -> Result<&str, ShimError> {
        let first = self.run_args.first().ok_or_else(|| {
            eprintln!("No launcher command line provided.");
            ShimError::MissingLauncherCommand
        })?;
        Ok(Path::new(first)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(first))
    }
}
