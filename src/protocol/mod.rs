//! The legacy copy protocol: wire records and name patterns
// (c) 2025 Ross Younger
//!
//! The copy protocol runs over a pair of byte streams to a peer process
//! (conventionally the stdin/stdout of an ssh child running this tool in
//! remote mode). All control records are ASCII lines:
//!
//! * Sender ➡️ Receiver: `T<mtime> 0 <atime> 0\n` — preserve times for the
//!   next file or directory
//! * Sender ➡️ Receiver: `C<mode> <size> <name>\n` — begin a regular file;
//!   `<mode>` is four octal digits, `<size>` decimal bytes
//! * Sender ➡️ Receiver: `D<mode> 0 <name>\n` / `E\n` — enter/leave a
//!   directory (recursive mode)
//! * Either direction: a single `0x00` byte acknowledges the last record;
//!   `0x01 <text>\n` reports a non-fatal error; `0x02 <text>\n` is fatal.
//!
//! Every control record is answered by exactly one response byte before the
//! next record is sent; each file body is exactly the declared size and is
//! terminated by a `0x00` from the sender.
//!
//! # Resume extension
//!
//! When both ends opt in (`-Z`), the `C` record additionally carries a
//! 128-hex-character BLAKE2b-512 digest of the file between the size and the
//! name. The receiver answers with an out-of-band reply — `R` (resume from
//! its current length), `S` (skip, identical) or `C` (overwrite) — padded to
//! a fixed [`wire::ENVELOPE_LEN`] so that the sender can read a predictable number
//! of bytes, followed by the usual response byte. After an `R` or `C` reply
//! the sender follows with exactly one match-status byte (`M`, `F` or
//! `0x00`), whatever it decided; an `S` reply ends the exchange there, with
//! no match byte and no file body. A peer that reads a match byte after `S`,
//! or skips it after `R`/`C`, desynchronises the two sides. See [`wire`] for
//! the shapes.

pub mod pattern;
#[cfg(test)]
pub(crate) mod test_helpers;
pub mod wire;

use tokio::io::{AsyncRead, AsyncWrite};

/// Marker trait for streams used for sending data to the peer
pub trait SendingStream: AsyncWrite + Send + Unpin {}

/// Marker trait for streams used for receiving data from the peer
pub trait ReceivingStream: AsyncRead + Send + Unpin {}

/// The pair of streams connecting us to the peer process
#[derive(Debug)]
pub struct PeerStreams<S: SendingStream, R: ReceivingStream> {
    /// outbound data (the peer's stdin)
    pub send: S,
    /// inbound data (the peer's stdout)
    pub recv: R,
}

impl<S: SendingStream, R: ReceivingStream> From<(S, R)> for PeerStreams<S, R> {
    fn from(value: (S, R)) -> Self {
        Self {
            send: value.0,
            recv: value.1,
        }
    }
}
