//! Main CLI for hpnscp
// (c) 2025 Ross Younger

use std::process::ExitCode;

use clap::Parser as _;
use indicatif::{MultiProgress, ProgressDrawTarget};

use super::args::CliArgs;
use crate::client::progress::MAX_UPDATE_FPS;
use crate::util::{setup_tracing, trace_level, tracing_is_initialised};

/// Main CLI entrypoint
///
/// Call this from `main`. It reads argv.
#[must_use]
pub fn cli() -> ExitCode {
    match cli_inner() {
        Err(e) => {
            if tracing_is_initialised() {
                tracing::error!("{e}");
            } else {
                eprintln!("hpnscp: {e}");
            }
            ExitCode::FAILURE
        }
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
    }
}

/// Inner CLI entrypoint
#[tokio::main(flavor = "current_thread")]
async fn cli_inner() -> anyhow::Result<bool> {
    let args = CliArgs::parse();
    setup_tracing(trace_level(&args.client))?;

    if args.from || args.to {
        crate::remote::remote_main(args.from, &args.client).await
    } else {
        let display = MultiProgress::with_draw_target(if args.client.quiet {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stderr_with_hz(MAX_UPDATE_FPS)
        });
        crate::client::client_main(&args.client, display).await
    }
}
