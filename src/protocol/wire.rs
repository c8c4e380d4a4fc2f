//! Record formats and line-level I/O for the copy protocol
// (c) 2025 Ross Younger

use anyhow::{Context as _, Result, bail, ensure};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{ReceivingStream, SendingStream};
use crate::buffer::RecordBuffer;

/// Length of a fragment hash on the wire: BLAKE2b-512 as lowercase hex
pub const HASH_LEN: usize = 128;
/// Fixed size of resume-mode out-of-band replies (hash plus field headroom)
pub const ENVELOPE_LEN: usize = HASH_LEN + 64;
/// Bytes of an envelope actually crossing the wire
pub const WIRE_ENVELOPE_LEN: usize = ENVELOPE_LEN - 1;
/// Cap on any control record line
const MAX_RECORD_LEN: usize = 16384;

/// Permission bits carried in mode fields (setuid, setgid, rwx for all)
pub const MODE_MASK: u32 = 0o6777;

/// A control record, as exchanged on the wire one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// `T<mtime> <mtime.usec> <atime> <atime.usec>`: timestamps to apply to
    /// the next file or directory
    Times {
        /// modification time, seconds
        mtime_sec: u64,
        /// modification time, microseconds
        mtime_usec: u32,
        /// access time, seconds
        atime_sec: u64,
        /// access time, microseconds
        atime_usec: u32,
    },
    /// `C<mode> <size> [<hash>] <name>`: begin a regular file
    File {
        /// permission bits
        mode: u32,
        /// exact byte count of the body to follow
        size: u64,
        /// fragment hash, present only in resume mode
        hash: Option<String>,
        /// basename of the file
        name: String,
    },
    /// `D<mode> 0 <name>`: descend into a directory
    Directory {
        /// permission bits
        mode: u32,
        /// basename of the directory
        name: String,
    },
    /// `E`: ascend out of the current directory
    EndDirectory,
}

impl Control {
    /// Appends this record, newline-terminated, to a marshalling buffer.
    pub fn marshal(&self, buf: &mut RecordBuffer) -> Result<()> {
        let line = match self {
            Control::Times {
                mtime_sec,
                mtime_usec,
                atime_sec,
                atime_usec,
            } => format!("T{mtime_sec} {mtime_usec} {atime_sec} {atime_usec}\n"),
            Control::File {
                mode,
                size,
                hash: Some(hash),
                name,
            } => format!("C{mode:04o} {size} {hash} {name}\n"),
            Control::File {
                mode,
                size,
                hash: None,
                name,
            } => format!("C{mode:04o} {size} {name}\n"),
            Control::Directory { mode, name } => format!("D{mode:04o} 0 {name}\n"),
            Control::EndDirectory => "E\n".to_string(),
        };
        buf.put(line.as_bytes())?;
        Ok(())
    }

    /// Parses a control record line (without its terminating newline).
    ///
    /// `resume` governs whether a `C` record is expected to carry a hash
    /// field; the two forms are not self-describing.
    pub fn parse(line: &str, resume: bool) -> Result<Self> {
        let mut scan = Scanner::new(line);
        match scan.take_byte() {
            Some('T') => {
                let mtime_sec = scan.number("mtime.sec")?;
                scan.delimiter("mtime.sec")?;
                let mtime_usec = scan.usec("mtime.usec")?;
                scan.delimiter("mtime.usec")?;
                let atime_sec = scan.number("atime.sec")?;
                scan.delimiter("atime.sec")?;
                let atime_usec = scan.usec("atime.usec")?;
                ensure!(scan.rest().is_empty(), "atime.usec not delimited");
                Ok(Control::Times {
                    mtime_sec,
                    mtime_usec,
                    atime_sec,
                    atime_usec,
                })
            }
            Some(leader @ ('C' | 'D')) => {
                let mode = scan.octal_mode()?;
                scan.expect(' ', "mode not delimited")?;
                let size = scan.number("size")?;
                scan.delimiter("size")?;
                let hash = if resume && leader == 'C' {
                    let h = scan.fixed(HASH_LEN).ok_or_else(|| {
                        anyhow::anyhow!("hash not present")
                    })?;
                    let h = h.to_string();
                    scan.expect(' ', "hash not delimited")?;
                    Some(h)
                } else {
                    None
                };
                let name = scan.rest();
                if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                    bail!("unexpected filename: {name}");
                }
                let name = name.to_string();
                if leader == 'C' {
                    Ok(Control::File {
                        mode,
                        size,
                        hash,
                        name,
                    })
                } else {
                    Ok(Control::Directory { mode, name })
                }
            }
            Some('E') => {
                ensure!(scan.rest().is_empty(), "expected control record");
                Ok(Control::EndDirectory)
            }
            _ => bail!("expected control record"),
        }
    }
}

/// Field-by-field scanner over a record line
struct Scanner<'a> {
    s: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(s: &'a str) -> Self {
        Self { s }
    }

    fn take_byte(&mut self) -> Option<char> {
        let mut chars = self.s.chars();
        let c = chars.next()?;
        self.s = chars.as_str();
        Some(c)
    }

    fn expect(&mut self, c: char, why: &str) -> Result<()> {
        match self.take_byte() {
            Some(got) if got == c => Ok(()),
            _ => bail!("{why}"),
        }
    }

    fn delimiter(&mut self, field: &str) -> Result<()> {
        self.expect(' ', &format!("{field} not delimited"))
    }

    /// A decimal number; overflow is a protocol error.
    fn number(&mut self, field: &str) -> Result<u64> {
        let end = self
            .s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(self.s.len());
        ensure!(end > 0, "{field} not present");
        let n = self.s[..end]
            .parse::<u64>()
            .with_context(|| format!("{field} out of range"))?;
        self.s = &self.s[end..];
        Ok(n)
    }

    /// A microseconds field, range-checked.
    fn usec(&mut self, field: &str) -> Result<u32> {
        let n = self.number(field)?;
        ensure!(n <= 999_999, "{field} not delimited");
        #[allow(clippy::cast_possible_truncation)]
        Ok(n as u32)
    }

    /// Exactly four octal digits.
    fn octal_mode(&mut self) -> Result<u32> {
        let mut mode = 0u32;
        for _ in 0..4 {
            match self.take_byte() {
                Some(c @ '0'..='7') => mode = (mode << 3) | (c as u32 - '0' as u32),
                _ => bail!("bad mode"),
            }
        }
        Ok(mode)
    }

    /// Takes exactly `n` bytes, if present.
    fn fixed(&mut self, n: usize) -> Option<&'a str> {
        if self.s.len() < n || !self.s.is_char_boundary(n) {
            return None;
        }
        let (head, tail) = self.s.split_at(n);
        self.s = tail;
        Some(head)
    }

    fn rest(&self) -> &'a str {
        self.s
    }
}

/// The peer's answer to a record or file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// All well; carry on (a single `0x00` byte)
    Ok,
    /// Non-fatal error: note it and continue with the next file
    Error(String),
    /// Fatal error: the session is over
    Fatal(String),
}

/// Reads one response from the peer.
///
/// Anything other than the three defined leaders is a stream we no longer
/// understand, which is fatal (the unexpected byte is kept as part of the
/// message).
pub async fn read_response<R: ReceivingStream>(recv: &mut R) -> Result<Response> {
    let mut byte = [0u8; 1];
    let n = recv.read(&mut byte).await.context("lost connection")?;
    ensure!(n == 1, "lost connection");
    let leader = byte[0];
    if leader == 0 {
        return Ok(Response::Ok);
    }
    let mut msg = Vec::new();
    if leader != 1 && leader != 2 {
        msg.push(leader);
    }
    loop {
        let n = recv.read(&mut byte).await.context("lost connection")?;
        ensure!(n == 1, "lost connection");
        if byte[0] == b'\n' {
            break;
        }
        if msg.len() < MAX_RECORD_LEN {
            msg.push(byte[0]);
        }
    }
    let text = String::from_utf8_lossy(&msg).into_owned();
    if leader == 1 {
        Ok(Response::Error(text))
    } else {
        Ok(Response::Fatal(text))
    }
}

/// Writes the single-byte OK acknowledgement.
pub async fn write_ack<W: SendingStream>(send: &mut W) -> Result<()> {
    send.write_all(&[0u8]).await?;
    send.flush().await?;
    Ok(())
}

/// Writes an error record. Fatal errors use leader `0x02`, non-fatal `0x01`.
pub async fn write_error<W: SendingStream>(send: &mut W, fatal: bool, msg: &str) -> Result<()> {
    let leader = if fatal { 2u8 } else { 1u8 };
    send.write_all(&[leader]).await?;
    send.write_all(format!("hpnscp: {msg}\n").as_bytes()).await?;
    send.flush().await?;
    Ok(())
}

/// Reads one control record line. Returns `None` at a clean end of stream.
///
/// The record leader must not itself be a newline; a line longer than the
/// cap or a stream that ends mid-line is a protocol error.
pub async fn read_control_line<R: ReceivingStream>(recv: &mut R) -> Result<Option<String>> {
    let mut byte = [0u8; 1];
    if recv.read(&mut byte).await? == 0 {
        return Ok(None);
    }
    ensure!(byte[0] != b'\n', "unexpected <newline>");
    let mut buf = RecordBuffer::new();
    buf.set_max_size(MAX_RECORD_LEN)?;
    buf.put(&byte)?;
    loop {
        let n = recv.read(&mut byte).await.context("lost connection")?;
        ensure!(n == 1, "lost connection");
        if byte[0] == b'\n' {
            break;
        }
        ensure!(buf.len() < MAX_RECORD_LEN, "record too long");
        buf.put(&byte)?;
    }
    Ok(Some(String::from_utf8_lossy(buf.as_slice()).into_owned()))
}

/// The receiver's out-of-band reply to a resume-mode `C` record.
///
/// These are padded to [`WIRE_ENVELOPE_LEN`] bytes so the sender always
/// reads a fixed amount; a variable-length reply here would desynchronise a
/// peer that reads before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeReply {
    /// `R<mode> <size> <hash>`: destination holds `size` bytes hashing to
    /// `hash`; send the suffix if the sender's prefix matches
    Resume {
        /// destination's current permission bits
        mode: u32,
        /// destination's current length
        size: u64,
        /// hash of the destination's existing bytes (empty if none)
        hash: String,
    },
    /// `S`: destination is identical; skip the body entirely
    Skip,
    /// `C<mode> <size> [<hash>]`: destination differs; expect a full resend
    Overwrite {
        /// destination's current permission bits
        mode: u32,
        /// destination's current length
        size: u64,
        /// hash of the destination, when the sizes matched
        hash: Option<String>,
    },
}

impl ResumeReply {
    /// Appends the space-padded wire form to a marshalling buffer.
    pub fn marshal(&self, buf: &mut RecordBuffer) -> Result<()> {
        let body = match self {
            ResumeReply::Resume { mode, size, hash } => {
                format!("R{mode:04o} {size} {hash}")
            }
            ResumeReply::Skip => "S".to_string(),
            ResumeReply::Overwrite {
                mode,
                size,
                hash: Some(hash),
            } => format!("C{mode:04o} {size} {hash}"),
            ResumeReply::Overwrite {
                mode,
                size,
                hash: None,
            } => format!("C{mode:04o} {size}"),
        };
        ensure!(body.len() <= WIRE_ENVELOPE_LEN, "envelope overflow");
        buf.put(body.as_bytes())?;
        buf.reserve(WIRE_ENVELOPE_LEN - body.len())?.fill(b' ');
        Ok(())
    }

    /// Parses a received envelope (trailing padding included).
    pub fn parse(envelope: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(envelope)
            .context("envelope is not valid UTF-8")?
            .trim_end_matches([' ', '\0']);
        let mut scan = Scanner::new(text);
        match scan.take_byte() {
            Some('S') => Ok(ResumeReply::Skip),
            Some('R') => {
                let mode = scan.octal_mode()?;
                scan.expect(' ', "mode not delimited")?;
                let size = scan.number("size")?;
                let hash = match scan.take_byte() {
                    Some(' ') => scan.rest().to_string(),
                    None => String::new(),
                    Some(_) => bail!("size not delimited"),
                };
                Ok(ResumeReply::Resume { mode, size, hash })
            }
            Some('C') => {
                let mode = scan.octal_mode()?;
                scan.expect(' ', "mode not delimited")?;
                let size = scan.number("size")?;
                let hash = match scan.take_byte() {
                    Some(' ') => Some(scan.rest().to_string()),
                    None => None,
                    Some(_) => bail!("size not delimited"),
                };
                Ok(ResumeReply::Overwrite { mode, size, hash })
            }
            _ => bail!("expected resume reply"),
        }
    }
}

/// Writes an envelope to the peer.
pub async fn write_envelope<W: SendingStream>(send: &mut W, reply: &ResumeReply) -> Result<()> {
    let mut buf = RecordBuffer::new();
    reply.marshal(&mut buf)?;
    send.write_all(buf.as_slice()).await?;
    send.flush().await?;
    Ok(())
}

/// Reads the fixed-size envelope from the peer.
pub async fn read_envelope<R: ReceivingStream>(recv: &mut R) -> Result<ResumeReply> {
    let mut envelope = [0u8; WIRE_ENVELOPE_LEN];
    recv.read_exact(&mut envelope)
        .await
        .context("lost connection")?;
    ResumeReply::parse(&envelope)
}

/// The sender's verdict on the receiver's resume reply.
///
/// Sent after every [`ResumeReply::Resume`] or [`ResumeReply::Overwrite`],
/// whatever the verdict; a [`ResumeReply::Skip`] ends the exchange with no
/// match byte at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    /// Fragments match: receiver should append the incoming suffix (`M`)
    Match,
    /// Fragments differ: receiver should overwrite from scratch (`F`)
    Mismatch,
    /// No resume applies: treat as a normal full transfer (`0x00`)
    NoResume,
}

impl MatchStatus {
    fn to_byte(self) -> u8 {
        match self {
            MatchStatus::Match => b'M',
            MatchStatus::Mismatch => b'F',
            MatchStatus::NoResume => 0,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            b'M' => MatchStatus::Match,
            b'F' => MatchStatus::Mismatch,
            _ => MatchStatus::NoResume,
        }
    }
}

/// Sends the match-status byte.
pub async fn write_match_status<W: SendingStream>(send: &mut W, status: MatchStatus) -> Result<()> {
    send.write_all(&[status.to_byte()]).await?;
    send.flush().await?;
    Ok(())
}

/// Reads the match-status byte.
pub async fn read_match_status<R: ReceivingStream>(recv: &mut R) -> Result<MatchStatus> {
    let mut byte = [0u8; 1];
    let n = recv.read(&mut byte).await.context("lost connection")?;
    ensure!(n == 1, "lost connection");
    Ok(MatchStatus::from_byte(byte[0]))
}
