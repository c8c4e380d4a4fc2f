//! remote-side event loop, driven over our own stdio
// (c) 2025 Ross Younger
//!
//! A stock-compatible peer invokes us as `hpnscp -f <paths>` (send) or
//! `hpnscp -t <target>` (receive) at the far end of the secure channel;
//! stdin and stdout *are* the peer streams. Anything user-facing goes to
//! stderr, which ssh carries back out of band.

use std::path::{Path, PathBuf};

use anyhow::Result;
use indicatif::{MultiProgress, ProgressDrawTarget};
use nix::sys::stat::{Mode, umask};
use tracing::debug;

use crate::client::Parameters;
use crate::protocol::{PeerStreams, ReceivingStream, SendingStream};
use crate::session::{Session, SessionConfig, sink::sink, source::source};

impl SendingStream for tokio::io::Stdout {}
impl ReceivingStream for tokio::io::Stdin {}

/// Remote mode event loop.
///
/// ## Return
/// true if every file transferred cleanly.
pub(crate) async fn remote_main(sending: bool, params: &Parameters) -> Result<bool> {
    anyhow::ensure!(!params.paths.is_empty(), "ambiguous target");
    if !sending {
        anyhow::ensure!(params.paths.len() == 1, "ambiguous target");
    }

    let mask = umask(Mode::empty());
    if !params.preserve {
        let _ = umask(mask);
    }
    let config = SessionConfig {
        recursive: params.recursive,
        preserve: params.preserve,
        target_is_dir: params.target_directory,
        resume: params.resume,
        remote: true,
        limit_kbps: params.limit_kbps,
        umask: mask.bits(),
        quiet: true,
    };
    debug!("remote mode ({}): {config:?}", if sending { "-f" } else { "-t" });

    let streams = PeerStreams::from((tokio::io::stdout(), tokio::io::stdin()));
    let display = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
    let mut session = Session::new(streams, config, display);

    if sending {
        let paths: Vec<PathBuf> = params.paths.iter().map(PathBuf::from).collect();
        source(&mut session, &paths).await?;
    } else {
        sink(&mut session, Path::new(&params.paths[0]), None).await?;
    }
    Ok(session.errors() == 0)
}
