//! client-side (_local machine_) main loop
// (c) 2025 Ross Younger

mod job;
pub use job::{CopyJobSpec, Direction, FileSpec};
mod options;
pub use options::Parameters;
pub(crate) mod progress;
pub(crate) mod ssh;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use indicatif::MultiProgress;
use nix::sys::stat::{Mode, umask};
use tracing::{debug, warn};

use crate::session::{Session, SessionConfig, sink::sink, source::source};
use crate::util::process::ProcessWrapper;

/// Main client mode event loop.
///
/// ## Return
/// true if the job was successful.
pub(crate) async fn client_main(params: &Parameters, display: MultiProgress) -> Result<bool> {
    let job = CopyJobSpec::from_args(&params.paths)?;
    let mut params = params.clone();
    if job.multiple_sources() {
        // several sources landing in one target: it must be a directory
        params.target_directory = true;
    }

    tokio::select! {
        result = run_job(&params, &job, display) => result,
        () = interrupted() => {
            // dropping the job future kills and reaps the ssh child
            anyhow::bail!("interrupted");
        }
    }
}

/// Resolves when the user has asked us to stop.
async fn interrupted() {
    use tokio::signal::unix::{SignalKind, signal};
    let sigterm = signal(SignalKind::terminate());
    let sigint = tokio::signal::ctrl_c();
    match sigterm {
        Ok(mut term) => {
            tokio::select! {
                _ = sigint => (),
                _ = term.recv() => (),
            }
        }
        Err(e) => {
            warn!("could not install SIGTERM handler: {e}");
            let _ = sigint.await;
        }
    }
}

/// Captures the process umask, zeroing it for the duration of a
/// mode-preserving session as the protocol expects.
fn read_umask(preserve: bool) -> u32 {
    let mask = umask(Mode::empty());
    if !preserve {
        let _ = umask(mask);
    }
    mask.bits()
}

fn session_config(params: &Parameters) -> SessionConfig {
    SessionConfig {
        recursive: params.recursive,
        preserve: params.preserve,
        target_is_dir: params.target_directory,
        resume: params.resume,
        remote: false,
        limit_kbps: params.limit_kbps,
        umask: read_umask(params.preserve),
        quiet: params.quiet,
    }
}

/// Defaults an empty path (e.g. `host:`) to the home/current directory.
fn path_or_dot(filename: &str) -> &str {
    if filename.is_empty() { "." } else { filename }
}

async fn run_job(params: &Parameters, job: &CopyJobSpec, display: MultiProgress) -> Result<bool> {
    match job.direction() {
        Direction::ToRemote => to_remote(params, job, display).await,
        Direction::ToLocal => to_local(params, job, display).await,
    }
}

/// Local sources, remote sink: one ssh connection carries every file.
async fn to_remote(params: &Parameters, job: &CopyJobSpec, display: MultiProgress) -> Result<bool> {
    let host = job
        .destination
        .user_at_host
        .as_deref()
        .expect("destination must be remote here");
    let command = ssh::remote_command(params, "-t", path_or_dot(&job.destination.filename));
    let mut wrapper = ProcessWrapper::spawn(ssh::ssh_command(params, host, &command))
        .context("could not launch connection to remote server")?;
    let streams = wrapper.stream_pair()?;
    let mut session = Session::new(streams, session_config(params), display);

    let paths: Vec<PathBuf> = job
        .sources
        .iter()
        .map(|s| PathBuf::from(&s.filename))
        .collect();
    let result = source(&mut session, &paths).await;
    let errs = session.errors();
    drop(session); // closes the child's stdin
    result?;

    let child_ok = wrapper.close().await.unwrap_or(false);
    debug!("transfer complete: {errs} errors, child ok: {child_ok}");
    Ok(errs == 0 && child_ok)
}

/// Remote sources, local sink: one ssh connection per source argument.
async fn to_local(params: &Parameters, job: &CopyJobSpec, display: MultiProgress) -> Result<bool> {
    let target = job.destination.filename.clone();
    let mut ok = true;
    for src in &job.sources {
        let host = src
            .user_at_host
            .as_deref()
            .expect("sources must be remote here");
        let command = ssh::remote_command(params, "-f", &src.filename);
        let mut wrapper =
            match ProcessWrapper::spawn(ssh::ssh_command(params, host, &command)) {
                Ok(w) => w,
                Err(e) => {
                    eprintln!("hpnscp: {e}");
                    ok = false;
                    continue;
                }
            };
        let streams = wrapper.stream_pair()?;
        let mut session = Session::new(streams, session_config(params), display.clone());
        let result = sink(
            &mut session,
            Path::new(path_or_dot(&target)),
            Some(&src.filename),
        )
        .await;
        if session.errors() > 0 {
            ok = false;
        }
        drop(session);
        result?;
        if !wrapper.close().await.unwrap_or(false) {
            ok = false;
        }
    }
    Ok(ok)
}
