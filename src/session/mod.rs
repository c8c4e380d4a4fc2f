//! The resumable copy session: sender and receiver state machines
// (c) 2025 Ross Younger
//!
//! One [`Session`] exists per invocation, wrapping the peer stream pair and
//! the immutable configuration for the transfer. The two driver entry
//! points are [`source::source`] (walk local paths, emit records and file
//! bodies) and [`sink::sink`] (consume records, negotiate resume, write
//! files). Both maintain the protocol's strict call/response ordering:
//! every control record is answered by exactly one response byte before the
//! next record is sent.

pub mod hash;
pub mod limiter;
pub mod sink;
pub mod source;
#[cfg(test)]
mod test;

use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressFinish};
use tracing::debug;

use crate::client::progress::style_for;
use crate::protocol::wire::{Response, read_response, write_error};
use crate::protocol::{PeerStreams, ReceivingStream, SendingStream};
use limiter::BandwidthLimiter;

/// I/O chunk size for file bodies, matching the historical copy buffer
pub(crate) const COPY_BUFLEN: usize = 16384;

/// Immutable per-invocation configuration.
///
/// The original kept these as process-wide flags; gathering them here keeps
/// the driver honest about what it depends on.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Descend into directories (`-r`)
    pub recursive: bool,
    /// Preserve modes and times (`-p`)
    pub preserve: bool,
    /// The target must be a directory (`-d`)
    pub target_is_dir: bool,
    /// Negotiate hash-verified resume (`-Z`)
    pub resume: bool,
    /// We are the remote end: peer-reported errors are not echoed locally
    pub remote: bool,
    /// Bandwidth limit in kbit/s
    pub limit_kbps: Option<u64>,
    /// The process umask, applied when creating files without `-p`
    pub umask: u32,
    /// Suppress progress and informational chatter
    pub quiet: bool,
}

/// Per-invocation transfer state over a peer stream pair.
pub struct Session<S: SendingStream, R: ReceivingStream> {
    pub(crate) send: S,
    pub(crate) recv: R,
    pub(crate) config: SessionConfig,
    pub(crate) limiter: Option<BandwidthLimiter>,
    pub(crate) display: MultiProgress,
    /// Count of non-fatal errors; any error makes the session exit nonzero
    pub(crate) errs: u64,
    /// First-noted local I/O error, surfaced once at end of file
    pub(crate) deferred: Option<String>,
}

impl<S: SendingStream, R: ReceivingStream> Session<S, R> {
    /// Constructor
    pub fn new(streams: PeerStreams<S, R>, config: SessionConfig, display: MultiProgress) -> Self {
        let limiter = config
            .limit_kbps
            .map(|kbps| BandwidthLimiter::new(kbps, COPY_BUFLEN));
        Self {
            send: streams.send,
            recv: streams.recv,
            config,
            limiter,
            display,
            errs: 0,
            deferred: None,
        }
    }

    /// Number of non-fatal errors accumulated so far
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errs
    }

    /// Reads the peer's response to our last record or body.
    ///
    /// Returns true for OK, false for a non-fatal error (which has been
    /// counted and reported). A fatal error or an unrecognisable response
    /// ends the session.
    pub(crate) async fn response(&mut self) -> Result<bool> {
        match read_response(&mut self.recv).await? {
            Response::Ok => Ok(true),
            Response::Error(msg) => {
                self.errs += 1;
                self.report_local(&msg);
                Ok(false)
            }
            Response::Fatal(msg) => {
                self.errs += 1;
                self.report_local(&msg);
                anyhow::bail!("{msg}");
            }
        }
    }

    /// Reports a non-fatal per-file error to the peer (and locally).
    /// This stands in as the response byte for the current exchange.
    pub(crate) async fn run_err(&mut self, msg: &str) -> Result<()> {
        self.errs += 1;
        self.report_local(msg);
        write_error(&mut self.send, false, msg).await
    }

    /// Handles an error record received from the peer. Fatal errors end
    /// the session; non-fatal ones are counted and echoed.
    pub(crate) fn peer_error(&mut self, msg: &str, fatal: bool) -> Result<()> {
        self.errs += 1;
        self.report_local(msg);
        if fatal {
            anyhow::bail!("{}", msg.trim_end());
        }
        Ok(())
    }

    /// Notes a local I/O error during a file body without reporting it yet;
    /// only the first error per file is retained.
    pub(crate) fn note_err(&mut self, msg: String) {
        debug!("noting error: {msg}");
        if self.deferred.is_none() {
            self.deferred = Some(msg);
        }
    }

    /// End-of-file epilogue: surfaces any noted error as the response to
    /// the peer, or returns false meaning the caller should send the OK.
    pub(crate) async fn flush_deferred(&mut self) -> Result<bool> {
        match self.deferred.take() {
            Some(msg) => {
                self.run_err(&msg).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Prints an error locally, unless we are the remote end (in which case
    /// the peer will print what we send it on the wire).
    pub(crate) fn report_local(&self, msg: &str) {
        if !self.config.remote {
            let msg = msg.trim_end();
            self.display.suspend(|| eprintln!("hpnscp: {msg}"));
        }
    }

    /// Adds a per-file progress bar to the display.
    pub(crate) fn progress_bar_for(&self, name: &str, steps: u64) -> ProgressBar {
        self.display.add(
            ProgressBar::new(steps)
                .with_style(
                    indicatif::ProgressStyle::with_template(style_for(name.len()))
                        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
                )
                .with_message(name.to_string())
                .with_finish(ProgressFinish::AndClear),
        )
    }

    /// Applies the bandwidth limit to a completed chunk transfer.
    pub(crate) async fn throttle(&mut self, bytes: u64) {
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.limit(bytes).await;
        }
    }
}
