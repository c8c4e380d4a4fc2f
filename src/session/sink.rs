//! Receiving side of the copy session
// (c) 2025 Ross Younger
//!
//! Consumes the peer's record stream, creating files and directories under
//! the target. In resume mode each incoming file triggers a negotiation:
//! the destination's current bytes are hashed and the sender told whether
//! to skip, append a suffix, or resend from scratch. Appended suffixes land
//! in a randomly-suffixed sidecar file which is concatenated onto the
//! original only once the transfer completes, so an interrupted append
//! never corrupts what was already on disk.
//!
//! A local write error mid-body must not desynchronise the streams: the
//! declared byte count is consumed regardless and the first-noted error is
//! surfaced in place of the final acknowledgement.

use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow};
use async_recursion::async_recursion;
use indicatif::ProgressBar;
use nix::sys::stat::utimes;
use nix::sys::time::TimeVal;
use rand::Rng as _;
use rand::distributions::Alphanumeric;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tracing::{debug, trace};

use super::{COPY_BUFLEN, Session};
use crate::buffer::RecordBuffer;
use crate::protocol::pattern::NamePatterns;
use crate::protocol::wire::{
    Control, MODE_MASK, MatchStatus, ResumeReply, read_control_line, read_match_status, write_ack,
    write_error,
};
use crate::protocol::{ReceivingStream, SendingStream};
use crate::session::hash::file_prefix_hash;

/// Length of the random sidecar suffix
const SIDECAR_SUFFIX_LEN: usize = 8;

/// Timestamps from a `T` record, pending application to the next file or
/// directory.
#[derive(Debug, Clone, Copy)]
struct PendingTimes {
    mtime: TimeVal,
    atime: TimeVal,
}

/// Receives the peer's stream into `target`.
///
/// `request` is the original filename request, used to constrain incoming
/// basenames (after brace expansion) in non-recursive mode.
pub async fn sink<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    target: &Path,
    request: Option<&str>,
) -> Result<()> {
    if session.config.target_is_dir {
        let meta = tokio::fs::metadata(target).await;
        if !meta.map(|m| m.is_dir()).unwrap_or(false) {
            session
                .run_err(&format!("{}: Not a directory", target.display()))
                .await?;
            anyhow::bail!("{}: Not a directory", target.display());
        }
    }
    let patterns = match request {
        Some(req) if !session.config.recursive => Some(
            NamePatterns::compile(req).with_context(|| format!("could not expand pattern {req}"))?,
        ),
        _ => None,
    };
    sink_level(session, target, patterns.as_ref()).await
}

/// One directory level of the receive loop. The entry acknowledgement
/// doubles as the response to the `D` record that opened this level.
#[async_recursion]
async fn sink_level<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    targ: &Path,
    patterns: Option<&'async_recursion NamePatterns>,
) -> Result<()> {
    write_ack(&mut session.send).await?;
    let targ_is_dir = tokio::fs::metadata(targ)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    let mut pending_times: Option<PendingTimes> = None;
    let mut first = true;

    loop {
        let Some(line) = read_control_line(&mut session.recv).await? else {
            return Ok(());
        };
        let first_record = std::mem::replace(&mut first, false);
        trace!("sink record: {line:?}");

        match line.as_bytes()[0] {
            1 | 2 => {
                session.peer_error(&line[1..], line.as_bytes()[0] == 2)?;
                continue;
            }
            b'E' => {
                write_ack(&mut session.send).await?;
                return Ok(());
            }
            b'T' => {
                pending_times = parse_times(session, &line).await?;
                write_ack(&mut session.send).await?;
                continue;
            }
            b'C' | b'D' => (),
            _ => {
                // A peer-side shell may emit noise ("No match.") before the
                // remote copy of this tool even starts; surface it verbatim.
                if first_record {
                    session.errs += 1;
                    session.report_local(&line);
                    anyhow::bail!("{line}");
                }
                return Err(protocol_error(session, "expected control record").await);
            }
        }

        let record = match Control::parse(&line, session.config.resume) {
            Ok(r) => r,
            Err(e) => return Err(protocol_error(session, &e.to_string()).await),
        };
        match record {
            Control::Directory { mode, name } => {
                if let Some(p) = patterns {
                    if !p.matches(&name) {
                        return Err(
                            protocol_error(session, "filename does not match request").await
                        );
                    }
                }
                let np = destination_path(targ, targ_is_dir, &name);
                let times = pending_times.take();
                receive_directory(session, &np, mode, times).await?;
            }
            Control::File {
                mode,
                size,
                hash,
                name,
            } => {
                if let Some(p) = patterns {
                    if !p.matches(&name) {
                        return Err(
                            protocol_error(session, "filename does not match request").await
                        );
                    }
                }
                let np = destination_path(targ, targ_is_dir, &name);
                let times = pending_times.take();
                receive_file(session, &np, mode, size, hash.as_deref(), times).await?;
            }
            Control::Times { .. } | Control::EndDirectory => unreachable!(),
        }
    }
}

/// Sends a fatal protocol diagnostic to the peer and builds the error that
/// ends the session.
async fn protocol_error<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    why: &str,
) -> anyhow::Error {
    session.errs += 1;
    let msg = format!("protocol error: {why}");
    session.report_local(&msg);
    let _ = write_error(&mut session.send, true, &msg).await;
    anyhow!("{msg}")
}

/// Parses a `T` record into pending timestamps. Out-of-range seconds
/// silently disable the subsequent apply, as a stock peer would expect.
async fn parse_times<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    line: &str,
) -> Result<Option<PendingTimes>> {
    let (mtime_sec, mtime_usec, atime_sec, atime_usec) = match Control::parse(line, false) {
        Ok(Control::Times {
            mtime_sec,
            mtime_usec,
            atime_sec,
            atime_usec,
        }) => (mtime_sec, mtime_usec, atime_sec, atime_usec),
        Ok(_) => return Err(protocol_error(session, "expected times record").await),
        Err(e) => return Err(protocol_error(session, &e.to_string()).await),
    };
    let (Ok(mtime_sec), Ok(atime_sec)) = (i64::try_from(mtime_sec), i64::try_from(atime_sec))
    else {
        return Ok(None); // out of range: skip the apply, stay in sync
    };
    Ok(Some(PendingTimes {
        mtime: TimeVal::new(mtime_sec, i64::from(mtime_usec)),
        atime: TimeVal::new(atime_sec, i64::from(atime_usec)),
    }))
}

fn destination_path(targ: &Path, targ_is_dir: bool, name: &str) -> PathBuf {
    if targ_is_dir {
        targ.join(name)
    } else {
        targ.to_path_buf()
    }
}

/// Strips the process umask from a mode unless we are preserving modes.
fn effective_mode<S: SendingStream, R: ReceivingStream>(
    session: &Session<S, R>,
    mode: u32,
) -> u32 {
    if session.config.preserve {
        mode
    } else {
        mode & !session.config.umask
    }
}

/// Handles a `D` record: create or validate the directory, recurse into it,
/// then apply times and final mode.
async fn receive_directory<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    np: &Path,
    mode: u32,
    times: Option<PendingTimes>,
) -> Result<()> {
    if !session.config.recursive {
        return Err(protocol_error(session, "received directory without -r").await);
    }
    let mode = effective_mode(session, mode);
    let mut apply_mode = session.config.preserve;
    match tokio::fs::metadata(np).await {
        Ok(meta) if meta.is_dir() => {
            if session.config.preserve {
                let _ = std::fs::set_permissions(np, std::fs::Permissions::from_mode(mode));
            }
        }
        Ok(_) => {
            return session
                .run_err(&format!("{}: Not a directory", np.display()))
                .await;
        }
        Err(_) => {
            // grant owner-write while we populate it, in case the source
            // directory was read-only
            apply_mode = true;
            let mut builder = tokio::fs::DirBuilder::new();
            builder.mode(mode | 0o700);
            if let Err(e) = builder.create(np).await {
                return session.run_err(&format!("{}: {e}", np.display())).await;
            }
        }
    }

    sink_level(session, np, None).await?;

    if let Some(t) = times {
        let _ = utimes(np, &t.atime, &t.mtime);
    }
    if apply_mode {
        let _ = std::fs::set_permissions(np, std::fs::Permissions::from_mode(mode));
    }
    Ok(())
}

/// The resume negotiation's decision about where body bytes should land.
struct TransferPlan {
    /// Bytes the sender will stream
    xfer: u64,
    /// Where those bytes are written
    write_path: PathBuf,
    /// Set when `write_path` is a sidecar to concatenate onto the original
    sidecar: bool,
}

/// Handles a `C` record through to its final acknowledgement.
#[allow(clippy::too_many_lines)]
async fn receive_file<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    np: &Path,
    mode: u32,
    size: u64,
    remote_hash: Option<&str>,
    times: Option<PendingTimes>,
) -> Result<()> {
    let dest_meta = tokio::fs::metadata(np).await.ok();
    let dest_exists = dest_meta.is_some();
    let omode = effective_mode(session, mode);
    let open_mode = omode | 0o200;

    let mut plan = TransferPlan {
        xfer: size,
        write_path: np.to_path_buf(),
        sidecar: false,
    };

    if session.config.resume {
        match negotiate_resume(session, np, dest_meta.as_ref(), size, remote_hash).await? {
            Some(negotiated) => plan = negotiated,
            None => return Ok(()), // skipped
        }
    }

    // Open the destination (or sidecar). In resume mode our response is
    // already on the wire, so a failure here must still consume the body.
    let open_result = OpenOptions::new()
        .write(true)
        .create(true)
        .mode(open_mode)
        .open(&plan.write_path)
        .await;
    let mut ofd = match open_result {
        Ok(f) => Some(f),
        Err(e) => {
            if !session.config.resume {
                return session.run_err(&format!("{}: {e}", np.display())).await;
            }
            session.note_err(format!("{}: {e}", np.display()));
            None
        }
    };
    if !session.config.resume {
        write_ack(&mut session.send).await?;
    }

    debug!(
        "receiving {} bytes into {}",
        plan.xfer,
        plan.write_path.display()
    );
    let name = np
        .file_name()
        .map_or_else(|| np.display().to_string(), |n| n.to_string_lossy().into_owned());
    let bar = session.progress_bar_for(&name, plan.xfer);
    receive_body(session, ofd.as_mut(), np, plan.xfer, &bar).await?;
    bar.finish_and_clear();

    // Trim anything left over from a longer previous incarnation.
    let dest_is_regular = dest_meta.as_ref().is_none_or(std::fs::Metadata::is_file);
    if session.deferred.is_none() && dest_is_regular {
        if let Some(f) = &ofd {
            if let Err(e) = f.set_len(plan.xfer).await {
                session.note_err(format!("{}: truncate: {e}", np.display()));
            }
        }
    }
    drop(ofd);

    if plan.sidecar {
        if let Err(e) = concatenate_sidecar(np, &plan.write_path).await {
            session.note_err(format!("{}: {e}", np.display()));
        }
    }

    apply_final_mode(session, np, omode, open_mode, dest_exists);

    // The sender's own end-of-body status
    let _ = session.response().await?;

    if session.deferred.is_none() {
        if let Some(t) = times {
            if let Err(e) = utimes(np, &t.atime, &t.mtime) {
                session.note_err(format!("{}: set times: {e}", np.display()));
            }
        }
    }

    if !session.flush_deferred().await? {
        write_ack(&mut session.send).await?;
    }
    Ok(())
}

/// Runs the receiver's half of the resume negotiation: reply envelope,
/// early acknowledgement, match byte. Returns `None` when the file is to be
/// skipped outright, otherwise where the body should be written.
async fn negotiate_resume<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    np: &Path,
    dest_meta: Option<&std::fs::Metadata>,
    size: u64,
    remote_hash: Option<&str>,
) -> Result<Option<TransferPlan>> {
    let dest_size = dest_meta.map_or(0, std::fs::Metadata::len);
    let dest_mode = dest_meta.map_or(0, |m| m.permissions().mode() & MODE_MASK);

    // An unwritable destination is skipped, but the sender still gets the
    // envelope and acknowledgement it is committed to reading.
    if dest_meta.is_some() {
        if let Err(e) = OpenOptions::new().write(true).open(np).await {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                session.report_local(&format!("{}: Permission denied", np.display()));
                send_envelope_and_ack(session, &ResumeReply::Skip).await?;
                return Ok(None);
            }
        }
    }

    let mut plan = TransferPlan {
        xfer: size,
        write_path: np.to_path_buf(),
        sidecar: false,
    };

    if dest_size == size && dest_size > 0 {
        let local_hash = file_prefix_hash(np, dest_size).unwrap_or_default();
        if Some(local_hash.as_str()) == remote_hash {
            send_envelope_and_ack(session, &ResumeReply::Skip).await?;
            if !session.config.remote && !session.config.quiet {
                let np = np.display().to_string();
                session
                    .display
                    .suspend(|| eprintln!("Skipping identical file: {np}"));
            }
            return Ok(None);
        }
        // same size, different content: full overwrite
        send_envelope_and_ack(
            session,
            &ResumeReply::Overwrite {
                mode: dest_mode,
                size: dest_size,
                hash: Some(local_hash),
            },
        )
        .await?;
    } else if dest_size < size {
        // absent, empty or partial destination: offer to resume
        let local_hash = if dest_meta.is_some() {
            file_prefix_hash(np, dest_size).unwrap_or_default()
        } else {
            String::new()
        };
        send_envelope_and_ack(
            session,
            &ResumeReply::Resume {
                mode: dest_mode,
                size: dest_size,
                hash: local_hash,
            },
        )
        .await?;
        plan.xfer = size - dest_size;
        plan.write_path = sidecar_path(np);
        plan.sidecar = true;
    } else {
        // destination is longer than the source: plain overwrite
        send_envelope_and_ack(
            session,
            &ResumeReply::Overwrite {
                mode: dest_mode,
                size: dest_size,
                hash: None,
            },
        )
        .await?;
    }

    // The sender always follows with its verdict. Anything but a match
    // means a full resend into the original destination.
    let status = read_match_status(&mut session.recv).await?;
    debug!("match status for {}: {status:?}", np.display());
    if status != MatchStatus::Match {
        plan.xfer = size;
        plan.write_path = np.to_path_buf();
        plan.sidecar = false;
    }
    Ok(Some(plan))
}

async fn send_envelope_and_ack<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    reply: &ResumeReply,
) -> Result<()> {
    let mut buf = RecordBuffer::new();
    reply.marshal(&mut buf)?;
    session.send.write_all(buf.as_slice()).await?;
    write_ack(&mut session.send).await
}

/// Names the sidecar used during a resumed append: the destination plus a
/// random alphanumeric suffix, so a stray peer name cannot clobber an
/// unrelated local file.
fn sidecar_path(np: &Path) -> PathBuf {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SIDECAR_SUFFIX_LEN)
        .map(char::from)
        .collect();
    let mut os = np.to_path_buf().into_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Consumes exactly `xfer` bytes from the peer, writing them to `ofd`.
///
/// Write failures are noted, not propagated: the stream must be drained to
/// the declared size regardless, or both sides lose their place.
async fn receive_body<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    mut ofd: Option<&mut File>,
    np: &Path,
    xfer: u64,
    bar: &ProgressBar,
) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUFLEN];
    let mut remaining = xfer;
    while remaining > 0 {
        #[allow(clippy::cast_possible_truncation)]
        let amt = remaining.min(COPY_BUFLEN as u64) as usize;
        let chunk = &mut buf[..amt];
        session
            .recv
            .read_exact(chunk)
            .await
            .context("dropped connection")?;
        if session.deferred.is_none() {
            if let Some(f) = ofd.as_deref_mut() {
                if let Err(e) = f.write_all(chunk).await {
                    session.note_err(format!("{}: {e}", np.display()));
                }
            }
        }
        bar.inc(amt as u64);
        session.throttle(amt as u64).await;
        remaining -= amt as u64;
    }
    if let Some(f) = ofd {
        if let Err(e) = f.flush().await {
            session.note_err(format!("{}: {e}", np.display()));
        }
    }
    Ok(())
}

/// Appends the sidecar's contents onto the original destination, then
/// removes the sidecar.
async fn concatenate_sidecar(np: &Path, sidecar: &Path) -> Result<()> {
    {
        let mut orig = OpenOptions::new().append(true).create(true).open(np).await?;
        let mut tmp = File::open(sidecar).await?;
        tokio::io::copy(&mut tmp, &mut orig).await?;
        orig.flush().await?;
    }
    tokio::fs::remove_file(sidecar).await?;
    Ok(())
}

/// Applies the file's final permission bits, mirroring what a stock peer
/// does: preserve mode chmods whenever the file pre-existed or carried no
/// owner-write bit; otherwise only newly created files are corrected,
/// umask-filtered.
fn apply_final_mode<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    np: &Path,
    omode: u32,
    open_mode: u32,
    dest_exists: bool,
) {
    let wanted = if session.config.preserve {
        (dest_exists || omode != open_mode).then_some(omode)
    } else {
        (!dest_exists && omode != open_mode).then(|| omode & !session.config.umask)
    };
    if let Some(bits) = wanted {
        if let Err(e) = std::fs::set_permissions(np, std::fs::Permissions::from_mode(bits)) {
            session.note_err(format!("{}: set mode: {e}", np.display()));
        }
    }
}
