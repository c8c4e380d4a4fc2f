//! Job specifications for the client
// (c) 2025 Ross Younger

use std::str::FromStr;

/// One file argument from the command line: a local path, or a path on a
/// remote host.
///
/// Unlike a single-file copier, an invocation may name several sources; the
/// parsing layer here also enforces that a source set agrees on where it
/// lives (see [`FileSpec::parse_sources`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSpec {
    /// The remote `[user@]host` holding the file — a hostname, an IP
    /// address, or anything else the ssh client will accept as a
    /// destination. `None` for a local file.
    pub user_at_host: Option<String>,
    /// Path on whichever side the file lives. For a destination this may
    /// name a directory.
    pub filename: String,
}

impl FileSpec {
    fn local(filename: &str) -> Self {
        Self {
            user_at_host: None,
            filename: filename.to_owned(),
        }
    }

    fn remote(host: &str, filename: &str) -> Self {
        Self {
            user_at_host: Some(host.to_owned()),
            filename: filename.to_owned(),
        }
    }

    /// Does this file live on the far side?
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.user_at_host.is_some()
    }

    /// Parses a full source set, which must be uniform: either every source
    /// is local (pushed to a remote target) or every source is remote
    /// (pulled down one connection each). The first argument that breaks
    /// ranks is named in the error.
    pub(crate) fn parse_sources(args: &[String]) -> anyhow::Result<Vec<Self>> {
        let mut sources: Vec<Self> = Vec::with_capacity(args.len());
        for arg in args {
            let spec = Self::from_str(arg)?;
            if let Some(first) = sources.first() {
                if spec.is_remote() != first.is_remote() {
                    anyhow::bail!(
                        "cannot mix local and remote sources ({first} vs {spec})"
                    );
                }
            }
            sources.push(spec);
        }
        Ok(sources)
    }
}

impl FromStr for FileSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A raw IPv6 address must be bracketed ([2001:db8::1]:path), or the
        // address's own colons would be taken for the host/path separator.
        // The brackets are shed here so the remainder reads as a hostname.
        if let Some(inner) = s.strip_prefix('[') {
            return Ok(match inner.split_once("]:") {
                Some((host, filename)) => Self::remote(host, filename),
                // never closed: not an address after all, just an odd filename
                None => Self::local(s),
            });
        }
        // user@host:path, host:path, 1.2.3.4:path — or a plain local path
        Ok(match s.split_once(':') {
            Some((host, filename)) => Self::remote(host, filename),
            None => Self::local(s),
        })
    }
}

impl std::fmt::Display for FileSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user_at_host {
            Some(host) => write!(f, "{host}:{}", self.filename),
            None => f.write_str(&self.filename),
        }
    }
}

/// Which way the data flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local sources, remote destination: we run the protocol source
    ToRemote,
    /// Remote sources, local destination: we run the protocol sink
    ToLocal,
}

/// Details of a file copy job: one or more sources and a destination,
/// exactly one side of which is remote.
#[derive(Debug, Clone)]
pub struct CopyJobSpec {
    pub(crate) sources: Vec<FileSpec>,
    pub(crate) destination: FileSpec,
}

impl CopyJobSpec {
    /// Validates and builds a job from raw command-line paths.
    pub(crate) fn from_args(args: &[String]) -> anyhow::Result<Self> {
        anyhow::ensure!(args.len() >= 2, "source and destination are required");
        let (dest, srcs) = args.split_last().expect("length checked above");
        let destination = FileSpec::from_str(dest)?;
        let sources = FileSpec::parse_sources(srcs)?;

        // the source set is uniform by now; it must sit opposite the target
        if destination.is_remote() {
            anyhow::ensure!(
                !sources[0].is_remote(),
                "sources must be local when the target is remote"
            );
        } else {
            anyhow::ensure!(
                sources[0].is_remote(),
                "one side of the copy must be remote"
            );
        }
        Ok(Self {
            sources,
            destination,
        })
    }

    /// What direction is this copy?
    pub(crate) fn direction(&self) -> Direction {
        if self.destination.is_remote() {
            Direction::ToRemote
        } else {
            Direction::ToLocal
        }
    }

    /// A target shared by several sources has to be a directory.
    pub(crate) fn multiple_sources(&self) -> bool {
        self.sources.len() > 1
    }
}
