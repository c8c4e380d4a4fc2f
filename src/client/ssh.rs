//! ssh invocation for the control connection
// (c) 2025 Ross Younger
//!
//! hpnscp does not speak the secure channel itself; it execs the system ssh
//! client and runs its peer over the resulting pipe pair. The argument
//! baseline disables every ssh feature that could inject bytes into the
//! session (local commands, forwardings, a remote tty), since anything
//! unexpected on the wire is a protocol error.

use tokio::process::Command;
use tracing::debug;

use super::Parameters;

/// Arguments always passed to ssh
const BASE_ARGS: &[&str] = &[
    "-x",
    "-oPermitLocalCommand=no",
    "-oClearAllForwardings=yes",
    "-oRemoteCommand=none",
    "-oRequestTTY=no",
];

/// Assembles the ssh argument vector for a connection to `user_at_host`
/// running `remote_command` there.
fn ssh_cli_args(params: &Parameters, user_at_host: &str, remote_command: &str) -> Vec<String> {
    let mut args: Vec<String> = BASE_ARGS.iter().map(ToString::to_string).collect();

    if params.verbose {
        args.push("-v".to_owned());
    }
    if params.quiet {
        args.push("-q".to_owned());
    }
    if params.compression {
        args.push("-C".to_owned());
    }
    if let Some(cipher) = &params.cipher {
        args.push("-c".to_owned());
        args.push(cipher.clone());
    }
    if let Some(identity) = &params.identity {
        args.push("-i".to_owned());
        args.push(identity.clone());
    }
    if let Some(config) = &params.ssh_config {
        args.push("-F".to_owned());
        args.push(config.clone());
    }
    if let Some(jump) = &params.jump_host {
        args.push("-J".to_owned());
        args.push(jump.clone());
    }
    if let Some(port) = params.port {
        args.push("-p".to_owned());
        args.push(port.to_string());
    }
    for opt in &params.ssh_option {
        args.push("-o".to_owned());
        args.push(opt.clone());
    }
    // Last, so the user's -o options cannot re-enable it
    args.push("-oForwardAgent=no".to_owned());

    args.push("--".to_owned());
    args.push(user_at_host.to_owned());
    args.push(remote_command.to_owned());
    args
}

/// The command string executed on the remote host, propagating the session
/// flags so both ends agree on the dialect.
pub(crate) fn remote_command(params: &Parameters, mode_flag: &str, path: &str) -> String {
    format!(
        "{program}{verbose}{recursive}{preserve}{dirtarget}{resume} {mode_flag} {path}",
        program = params.remote_program,
        verbose = if params.verbose { " -v" } else { "" },
        recursive = if params.recursive { " -r" } else { "" },
        preserve = if params.preserve { " -p" } else { "" },
        dirtarget = if params.target_directory { " -d" } else { "" },
        resume = if params.resume { " -Z" } else { "" },
    )
}

/// Builds the ssh command ready to spawn.
pub(crate) fn ssh_command(
    params: &Parameters,
    user_at_host: &str,
    remote_cmd: &str,
) -> Command {
    let mut command = Command::new(&params.ssh_program);
    let _ = command.args(ssh_cli_args(params, user_at_host, remote_cmd));
    debug!("ssh command: {command:?}");
    command
}
