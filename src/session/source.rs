//! Sending side of the copy session
// (c) 2025 Ross Younger
//!
//! Walks the requested local paths and drives the wire protocol: a `T`
//! record (when preserving times), the `C`/`D` record, the resume
//! negotiation when enabled, then exactly the agreed number of body bytes
//! and a status byte. Per-file failures are reported to the peer and the
//! walk continues; only protocol-level failures abort the session.

use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_recursion::async_recursion;
use tokio::fs::File;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tracing::{debug, trace};

use super::{COPY_BUFLEN, Session};
use crate::buffer::RecordBuffer;
use crate::protocol::wire::{
    Control, MODE_MASK, MatchStatus, ResumeReply, read_envelope, write_ack, write_match_status,
};
use crate::protocol::{ReceivingStream, SendingStream};
use crate::session::hash::file_prefix_hash;

/// Sends every named path to the peer.
///
/// Consumes the receiver's session-opening acknowledgement first; records
/// may not flow until the peer has signalled readiness.
pub async fn source<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    paths: &[PathBuf],
) -> Result<()> {
    eprintln!("DBG source: before initial response");
    let _ = session.response().await?;
    eprintln!("DBG source: after initial response");
    for path in paths {
        source_one(session, path).await?;
    }
    eprintln!("DBG source: done");
    Ok(())
}

/// Marshals a control record and sends it.
async fn send_control<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    record: &Control,
) -> Result<()> {
    let mut buf = RecordBuffer::new();
    record.marshal(&mut buf)?;
    trace!("sending record: {record:?}");
    session.send.write_all(buf.as_slice()).await?;
    session.send.flush().await?;
    Ok(())
}

/// Sends a `T` record for this file's timestamps and awaits the response.
/// Returns false if the peer refused.
async fn send_times<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    meta: &std::fs::Metadata,
) -> Result<bool> {
    #[allow(clippy::cast_sign_loss)]
    let clamp = |t: i64| if t < 0 { 0 } else { t as u64 };
    send_control(
        session,
        &Control::Times {
            mtime_sec: clamp(meta.mtime()),
            mtime_usec: 0,
            atime_sec: clamp(meta.atime()),
            atime_usec: 0,
        },
    )
    .await?;
    session.response().await
}

#[async_recursion]
async fn source_one<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    name: &Path,
) -> Result<()> {
    let mut file = match File::open(name).await {
        Ok(f) => f,
        Err(e) => {
            return session.run_err(&format!("{}: {e}", name.display())).await;
        }
    };
    let meta = match file.metadata().await {
        Ok(m) => m,
        Err(e) => {
            return session.run_err(&format!("{}: {e}", name.display())).await;
        }
    };
    if meta.is_dir() {
        drop(file);
        if session.config.recursive {
            eprintln!("DBG source_one: recursing into {}", name.display());
            let r = rsource(session, name, &meta).await;
            eprintln!("DBG source_one: returned from rsource {}: {r:?}", name.display());
            return r;
        }
        return session
            .run_err(&format!("{}: not a regular file", name.display()))
            .await;
    }
    if !meta.is_file() {
        return session
            .run_err(&format!("{}: not a regular file", name.display()))
            .await;
    }
    let Some(base) = name.file_name().and_then(std::ffi::OsStr::to_str) else {
        return session
            .run_err(&format!("{}: unencodable filename", name.display()))
            .await;
    };
    if base.contains('\n') {
        return session
            .run_err(&format!("{}: filename contains a newline", name.display()))
            .await;
    }
    let base = base.to_string();
    let size = meta.len();

    // Hash up front in resume mode; the record carries it.
    let hash = if session.config.resume {
        Some(file_prefix_hash(name, size).unwrap_or_default())
    } else {
        None
    };

    if session.config.preserve && !send_times(session, &meta).await? {
        return Ok(());
    }

    send_control(
        session,
        &Control::File {
            mode: meta.permissions().mode() & MODE_MASK,
            size,
            hash,
            name: base.clone(),
        },
    )
    .await?;

    // In resume mode the receiver's fixed-size reply precedes its response
    // byte; read both in that order or the streams drift.
    let reply = if session.config.resume {
        Some(read_envelope(&mut session.recv).await?)
    } else {
        None
    };
    if !session.response().await? {
        return Ok(());
    }

    let mut xfer = size;
    if let Some(reply) = reply {
        debug!("resume reply for {}: {reply:?}", name.display());
        let mut status = MatchStatus::NoResume;
        match reply {
            ResumeReply::Skip => {
                trace!("peer skipped {}", name.display());
                return Ok(());
            }
            ResumeReply::Resume {
                size: dest_size,
                hash: dest_hash,
                ..
            } => {
                let local = file_prefix_hash(name, dest_size).unwrap_or_default();
                if !dest_hash.is_empty() && local == dest_hash {
                    // true prefix: ship only the suffix
                    match file.seek(SeekFrom::Start(dest_size)).await {
                        Ok(_) => {
                            status = MatchStatus::Match;
                            xfer = size - dest_size.min(size);
                        }
                        Err(e) => {
                            debug!("seek failed on {}: {e}", name.display());
                            status = MatchStatus::Mismatch;
                        }
                    }
                } else {
                    status = MatchStatus::Mismatch;
                }
            }
            ResumeReply::Overwrite { .. } => {
                // full resend; no resume applies
            }
        }
        // Sent whatever the outcome, or the two sides desynchronise.
        write_match_status(&mut session.send, status).await?;
    }

    send_body(session, &mut file, &base, name, xfer).await?;
    let _ = session.response().await?;
    Ok(())
}

/// Streams exactly `xfer` bytes of `file`, then the trailing status byte.
///
/// A local read error part way through must not abort the stream mid-body:
/// the remainder is sent as zeroes to retain sync and the error reported in
/// place of the final OK.
async fn send_body<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    file: &mut File,
    base: &str,
    name: &Path,
    xfer: u64,
) -> Result<()> {
    let bar = session.progress_bar_for(base, xfer);
    let mut buf = vec![0u8; COPY_BUFLEN];
    let mut remaining = xfer;
    let mut read_error: Option<String> = None;
    while remaining > 0 {
        #[allow(clippy::cast_possible_truncation)]
        let amt = remaining.min(COPY_BUFLEN as u64) as usize;
        let chunk = &mut buf[..amt];
        if read_error.is_none() {
            if let Err(e) = file.read_exact(chunk).await {
                read_error = Some(format!("{}: {e}", name.display()));
                chunk.fill(0);
            }
        } else {
            chunk.fill(0);
        }
        session
            .send
            .write_all(chunk)
            .await
            .context("lost connection")?;
        bar.inc(amt as u64);
        session.throttle(amt as u64).await;
        remaining -= amt as u64;
    }
    bar.finish_and_clear();
    match read_error {
        Some(msg) => session.run_err(&msg).await,
        None => write_ack(&mut session.send).await,
    }
}

/// Recursively sends a directory: `T` (optionally), `D`, contents, `E`.
async fn rsource<S: SendingStream, R: ReceivingStream>(
    session: &mut Session<S, R>,
    path: &Path,
    meta: &std::fs::Metadata,
) -> Result<()> {
    let mut dir = match tokio::fs::read_dir(path).await {
        Ok(d) => d,
        Err(e) => {
            return session.run_err(&format!("{}: {e}", path.display())).await;
        }
    };
    let Some(base) = path.file_name().and_then(std::ffi::OsStr::to_str) else {
        return session
            .run_err(&format!("{}: unencodable filename", path.display()))
            .await;
    };
    if session.config.preserve && !send_times(session, meta).await? {
        return Ok(());
    }
    debug!("entering directory {}", path.display());
    eprintln!("DBG rsource: sending D control for {}", path.display());
    send_control(
        session,
        &Control::Directory {
            mode: meta.permissions().mode() & MODE_MASK,
            name: base.to_string(),
        },
    )
    .await?;
    eprintln!("DBG rsource: sent D control for {}, awaiting response", path.display());
    if !session.response().await? {
        eprintln!("DBG rsource: response false for {}", path.display());
        return Ok(());
    }
    eprintln!("DBG rsource: response true for {}", path.display());

    let mut entries = Vec::new();
    loop {
        match dir.next_entry().await {
            Ok(Some(entry)) => entries.push(entry.path()),
            Ok(None) => break,
            Err(e) => {
                session.run_err(&format!("{}: {e}", path.display())).await?;
                break;
            }
        }
    }
    drop(dir);
    entries.sort();
    eprintln!("DBG rsource: entries for {}: {entries:?}", path.display());
    for entry in &entries {
        source_one(session, entry).await?;
    }

    eprintln!("DBG rsource: sending EndDirectory for {}", path.display());
    send_control(session, &Control::EndDirectory).await?;
    let _ = session.response().await?;
    eprintln!("DBG rsource: done {}", path.display());
    Ok(())
}
