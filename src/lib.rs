// (c) 2025 Ross Younger

//! `hpnscp` is a high-performance secure file copy utility in the mould of
//! `scp`, with an opt-in hash-verified resume mode for interrupted
//! transfers.
//!
//! ## Overview
//! - 🔧 Works the way `scp` does: `hpnscp myfile some-server:some-directory/`
//! - 🛡️ User authentication and transport security come from the `ssh`
//!   binary on your system; hpnscp runs a copy of itself at the far end
//!   over the resulting channel and stays wire-compatible with the classic
//!   copy protocol.
//! - ⏯️ Resume (`-Z`): both ends hash what is already at the destination.
//!   Identical files are skipped without sending a byte of file body; a
//!   destination that proves to be a true prefix of the source is completed
//!   in place rather than resent from scratch. Requires hpnscp at both ends;
//!   without `-Z` the wire format is exactly the stock protocol.
//!
//! ## How it works
//!
//! 1. We ssh to the remote machine and run `hpnscp -t` (receive) or
//!    `hpnscp -f` (send) there.
//! 2. Control records and file bodies flow over the child's stdin/stdout —
//!    see [protocol] for the wire format.
//! 3. In resume mode, each file's record carries a BLAKE2b-512 digest and
//!    the receiver answers with a fixed-size reply naming what it already
//!    has.
//!
//! The heavy lifting lives in three places: the [protocol] records, the
//! [session] state machines driving them, and the [keystream] engine that
//! parallelises counter-mode cipher generation for the high-throughput
//! transport variants.

pub(crate) mod cli;
pub use cli::cli;
pub(crate) mod client;
pub use client::{CopyJobSpec, FileSpec, Parameters};

pub mod buffer;
pub mod keystream;
pub mod protocol;
pub(crate) mod remote;
pub mod session;
pub(crate) mod util;
pub use util::tracing_is_initialised;

mod version;
