//! Subprocess management (client side)
// (c) 2025 Ross Younger

use std::process::Stdio;

use tokio::process::{ChildStdin, ChildStdout, Command};

use anyhow::{Result, anyhow};
use tracing::warn;

use crate::protocol::PeerStreams;
use crate::protocol::{ReceivingStream, SendingStream};

impl SendingStream for ChildStdin {}
impl ReceivingStream for ChildStdout {}

/// A child process (usually ssh) that implements the connection to the remote
#[derive(Debug)]
pub(crate) struct ProcessWrapper {
    process: tokio::process::Child,
}

impl Drop for ProcessWrapper {
    fn drop(&mut self) {
        // Tidy up as best we can.
        if let Ok(Some(_)) = self.process.try_wait() {
            return;
        }
        let _ = self
            .process
            .start_kill()
            .map_err(|e| warn!("killing connection process: {e}"));
        let _ = self
            .process
            .try_wait()
            .map_err(|e| warn!("reaping connection process: {e}"));
    }
}

impl ProcessWrapper {
    /// Wraps a [`tokio::process::Command`] with our stream wrapper.
    pub(crate) fn spawn(mut cmd: Command) -> Result<Self> {
        let process = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("could not spawn child process: {e}"))?;
        Ok(Self { process })
    }

    /// A reasonably controlled shutdown, reporting whether the child
    /// exited successfully.
    /// (If you don't mind being rough, simply drop the [`ProcessWrapper`].)
    pub(crate) async fn close(&mut self) -> Result<bool> {
        // wait() closes the child process stdin
        let status = self.process.wait().await?;
        Ok(status.success())
    }

    /// Accessor for the communication channels.
    /// Note that this can only be called once; future calls error.
    pub(crate) fn stream_pair(&mut self) -> Result<PeerStreams<ChildStdin, ChildStdout>> {
        let sp = PeerStreams::from((
            self.process
                .stdin
                .take()
                .ok_or_else(|| anyhow!("could not access process stdin"))?,
            self.process
                .stdout
                .take()
                .ok_or_else(|| anyhow!("could not access process stdout"))?,
        ));
        Ok(sp)
    }
}
