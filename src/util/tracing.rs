//! Tracing helpers
// (c) 2025 Ross Younger

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing_subscriber::EnvFilter;

static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Environment variable that controls what gets logged to stderr
const STANDARD_ENV_VAR: &str = "RUST_LOG";

/// Computes the trace level for a given set of [`crate::client::Parameters`]
pub(crate) fn trace_level(args: &crate::client::Parameters) -> &'static str {
    if args.verbose {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    }
}

/// Log filter setup: use `RUST_LOG` if set, otherwise log only our own
/// items at the given level.
fn filter_for(trace_level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_env(STANDARD_ENV_VAR).or_else(|e| {
        if std::env::var(STANDARD_ENV_VAR).is_ok() {
            anyhow::bail!("{STANDARD_ENV_VAR} (set in environment) was not understood: {e}");
        }
        Ok(EnvFilter::try_new(format!("hpnscp={trace_level}"))?)
    })
}

/// Sets up the tracing subsystem, logging to stderr.
///
/// Remote mode logs too: its stderr is carried back over the ssh channel
/// and surfaced by the client.
pub(crate) fn setup_tracing(trace_level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(trace_level)?)
        .with_writer(std::io::stderr)
        .init();
    TRACING_INITIALIZED.store(true, Ordering::Release);
    Ok(())
}

/// Has tracing been set up? Errors before that point have to go straight
/// to stderr.
pub fn tracing_is_initialised() -> bool {
    TRACING_INITIALIZED.load(Ordering::Acquire)
}
