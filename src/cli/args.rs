//! Command-line argument definitions
// (c) 2025 Ross Younger

use clap::Parser;

use crate::client::Parameters;

/// The full command line, including the hidden flags a peer copy of this
/// tool uses to put us into remote mode.
#[derive(Debug, Parser, Clone)]
#[command(
    author,
    version = crate::version::short(),
    about = "Secure file copy with hash-verified resume",
    before_help = "e.g.   hpnscp some/file my-server:some-dir/",
    infer_long_args(true)
)]
pub(crate) struct CliArgs {
    /// Remote sender mode. The peer invokes this over the secure channel;
    /// not for interactive use.
    #[arg(short = 'f', long = "from", hide = true, conflicts_with("to"))]
    pub(crate) from: bool,

    /// Remote receiver mode. The peer invokes this over the secure
    /// channel; not for interactive use.
    #[arg(short = 't', long = "to", hide = true)]
    pub(crate) to: bool,

    /// Everything else
    #[command(flatten)]
    pub(crate) client: Parameters,
}
