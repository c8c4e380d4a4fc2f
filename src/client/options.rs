//! Options specific to hpnscp client-mode
// (c) 2025 Ross Younger

use clap::Parser;

/// Client-side options, shaped to stay familiar to scp users.
#[derive(Debug, Parser, Clone, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Parameters {
    /// Enable detailed debug output
    ///
    /// This has the same effect as setting `RUST_LOG=hpnscp=debug` in the
    /// environment. If present, `RUST_LOG` overrides this option.
    #[arg(short, long, action, help_heading("Output"), display_order(0))]
    pub verbose: bool,

    /// Quiet mode
    ///
    /// Switches off the progress meter; reports only errors
    #[arg(short, long, action, conflicts_with("verbose"), help_heading("Output"))]
    pub quiet: bool,

    /// Recursively copy entire directories
    #[arg(short, long, action)]
    pub recursive: bool,

    /// Preserve modification times, access times and modes from the
    /// original file
    #[arg(short, long, action)]
    pub preserve: bool,

    /// Target must be a directory
    #[arg(short = 'd', action, hide = true)]
    pub target_directory: bool,

    /// Resume interrupted transfers
    ///
    /// Both ends hash what is already present at the destination; identical
    /// files are skipped and true prefixes are completed in place rather
    /// than resent. Requires hpnscp at both ends.
    #[arg(short = 'Z', long, action)]
    pub resume: bool,

    /// Limit the bandwidth, specified in Kbit/s
    #[arg(
        short = 'l',
        long = "limit",
        value_name("KBITS"),
        help_heading("Network")
    )]
    pub limit_kbps: Option<u64>,

    /// Connect to this port on the remote host
    #[arg(short = 'P', long, value_name("PORT"), help_heading("Network"))]
    pub port: Option<u16>,

    /// Pass compression on to ssh
    #[arg(short = 'C', action, help_heading("Ssh"))]
    pub compression: bool,

    /// Cipher selection, passed through to ssh
    #[arg(short = 'c', value_name("CIPHER"), help_heading("Ssh"))]
    pub cipher: Option<String>,

    /// Identity (private key) file, passed through to ssh
    #[arg(short = 'i', value_name("FILE"), help_heading("Ssh"))]
    pub identity: Option<String>,

    /// ssh configuration file
    #[arg(short = 'F', value_name("FILE"), help_heading("Ssh"))]
    pub ssh_config: Option<String>,

    /// Jump host specification, passed through to ssh
    #[arg(short = 'J', value_name("DESTINATION"), help_heading("Ssh"))]
    pub jump_host: Option<String>,

    /// Additional options, passed through to ssh verbatim
    #[arg(short = 'o', value_name("OPTION"), help_heading("Ssh"))]
    pub ssh_option: Vec<String>,

    /// The ssh client program to use for connection setup
    #[arg(
        short = 'S',
        long = "ssh",
        value_name("PROGRAM"),
        default_value("ssh"),
        help_heading("Ssh")
    )]
    pub ssh_program: String,

    /// Path to this program on the remote host
    #[arg(
        short = 'z',
        long = "remote-program",
        value_name("PATH"),
        default_value("hpnscp")
    )]
    pub remote_program: String,

    // JOB SPECIFICATION ==================================================
    // (POSITIONAL ARGUMENTS!)
    /// Sources followed by the destination. Remote files are specified as
    /// HOST:FILE or USER@HOST:FILE; in remote mode this is the single
    /// target path.
    #[arg(value_name = "SOURCE... TARGET")]
    pub paths: Vec<String>,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod test {
    use super::Parameters;
    use clap::Parser;

    #[test]
    fn defaults() {
        let p = Parameters::try_parse_from(["hpnscp", "a", "host:b"]).unwrap();
        assert!(!p.resume);
        assert!(!p.recursive);
        assert_eq!(p.ssh_program, "ssh");
        assert_eq!(p.remote_program, "hpnscp");
        assert_eq!(p.paths, vec!["a", "host:b"]);
    }

    #[test]
    fn flag_soup() {
        let p = Parameters::try_parse_from([
            "hpnscp", "-r", "-p", "-Z", "-C", "-P", "2222", "-l", "800", "-i", "key", "-o",
            "StrictHostKeyChecking=no", "src", "host:dst",
        ])
        .unwrap();
        assert!(p.recursive && p.preserve && p.resume && p.compression);
        assert_eq!(p.port, Some(2222));
        assert_eq!(p.limit_kbps, Some(800));
        assert_eq!(p.identity.as_deref(), Some("key"));
        assert_eq!(p.ssh_option, vec!["StrictHostKeyChecking=no"]);
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Parameters::try_parse_from(["hpnscp", "-q", "-v", "a", "h:b"]).is_err());
    }
}
