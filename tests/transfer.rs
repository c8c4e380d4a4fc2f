//! Wire-level tests driving the real binary in remote mode
// (c) 2025 Ross Younger

use std::io::{Read as _, Write as _};
use std::os::unix::fs::PermissionsExt as _;
use std::process::{Command, Stdio};

fn hpnscp() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin("hpnscp"))
}

/// Stock-protocol receive: feed a scripted sender conversation into
/// `hpnscp -t` and check the file lands intact.
#[test]
fn remote_sink_receives_a_file() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut child = hpnscp()
        .current_dir(tmp.path())
        .args(["-t", "."])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let mut script = b"C0644 5 hello\nworld".to_vec();
    script.push(0); // sender's end-of-body status
    child.stdin.take().unwrap().write_all(&script).unwrap();

    let mut responses = Vec::new();
    let _ = child
        .stdout
        .take()
        .unwrap()
        .read_to_end(&mut responses)
        .unwrap();
    let status = child.wait().unwrap();
    assert!(status.success());
    // session-opening ack, record ack, completion ack
    assert_eq!(responses, vec![0u8, 0, 0]);
    assert_eq!(std::fs::read(tmp.path().join("hello")).unwrap(), b"world");
}

/// Stock-protocol send: `hpnscp -f` against a scripted receiver produces
/// byte-exact classic wire output.
#[test]
fn remote_source_is_wire_compatible() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(tmp.path().join("payload"), b"0123456789").unwrap();
    std::fs::set_permissions(
        tmp.path().join("payload"),
        std::fs::Permissions::from_mode(0o644),
    )
    .unwrap();

    let mut child = hpnscp()
        .current_dir(tmp.path())
        .args(["-f", "payload"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // every response the sender will ask for is an OK
    child.stdin.take().unwrap().write_all(&[0u8; 3]).unwrap();

    let mut wire = Vec::new();
    let _ = child.stdout.take().unwrap().read_to_end(&mut wire).unwrap();
    assert!(child.wait().unwrap().success());

    let mut expected = b"C0644 10 payload\n".to_vec();
    expected.extend_from_slice(b"0123456789");
    expected.push(0);
    assert_eq!(wire, expected);
}

/// Plumbs a real `-f -Z` process into a real `-t -Z` process and lets
/// resume complete a half-transferred file.
#[test]
fn resume_between_two_live_processes() {
    let tmp = tempfile::TempDir::new().unwrap();
    let srcdir = tmp.path().join("src");
    let dstdir = tmp.path().join("dst");
    std::fs::create_dir_all(&srcdir).unwrap();
    std::fs::create_dir_all(&dstdir).unwrap();
    let contents = b"a file that was interrupted halfway through its journey";
    std::fs::write(srcdir.join("f"), contents).unwrap();
    std::fs::write(dstdir.join("f"), &contents[..20]).unwrap();

    // full-duplex plumbing: sender stdout -> receiver stdin and vice versa
    let (r1, w1) = nix::unistd::pipe().unwrap();
    let (r2, w2) = nix::unistd::pipe().unwrap();

    let mut sender = hpnscp()
        .current_dir(&srcdir)
        .args(["-Z", "-f", "f"])
        .stdin(Stdio::from(r2))
        .stdout(Stdio::from(w1))
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut receiver = hpnscp()
        .current_dir(&dstdir)
        .args(["-Z", "-t", "."])
        .stdin(Stdio::from(r1))
        .stdout(Stdio::from(w2))
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    assert!(sender.wait().unwrap().success());
    assert!(receiver.wait().unwrap().success());
    assert_eq!(std::fs::read(dstdir.join("f")).unwrap(), contents);
    // no sidecar left behind
    assert_eq!(std::fs::read_dir(&dstdir).unwrap().count(), 1);
}

/// Two identical live processes skip the body entirely and leave both
/// files alone.
#[test]
fn skip_between_two_live_processes() {
    let tmp = tempfile::TempDir::new().unwrap();
    let srcdir = tmp.path().join("src");
    let dstdir = tmp.path().join("dst");
    std::fs::create_dir_all(&srcdir).unwrap();
    std::fs::create_dir_all(&dstdir).unwrap();
    std::fs::write(srcdir.join("f"), b"twinned content").unwrap();
    std::fs::write(dstdir.join("f"), b"twinned content").unwrap();

    let (r1, w1) = nix::unistd::pipe().unwrap();
    let (r2, w2) = nix::unistd::pipe().unwrap();

    let mut sender = hpnscp()
        .current_dir(&srcdir)
        .args(["-Z", "-f", "f"])
        .stdin(Stdio::from(r2))
        .stdout(Stdio::from(w1))
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut receiver = hpnscp()
        .current_dir(&dstdir)
        .args(["-Z", "-t", "."])
        .stdin(Stdio::from(r1))
        .stdout(Stdio::from(w2))
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    assert!(sender.wait().unwrap().success());
    assert!(receiver.wait().unwrap().success());
    assert_eq!(
        std::fs::read(dstdir.join("f")).unwrap(),
        b"twinned content"
    );
}

/// Recursive directory transfer through real processes.
#[test]
fn recursive_tree_between_two_live_processes() {
    let tmp = tempfile::TempDir::new().unwrap();
    let srcdir = tmp.path().join("src");
    let dstdir = tmp.path().join("dst");
    std::fs::create_dir_all(srcdir.join("tree/sub")).unwrap();
    std::fs::create_dir_all(&dstdir).unwrap();
    std::fs::write(srcdir.join("tree/f1"), b"alpha").unwrap();
    std::fs::write(srcdir.join("tree/sub/f2"), b"beta").unwrap();

    let (r1, w1) = nix::unistd::pipe().unwrap();
    let (r2, w2) = nix::unistd::pipe().unwrap();

    let mut sender = hpnscp()
        .current_dir(&srcdir)
        .args(["-r", "-f", "tree"])
        .stdin(Stdio::from(r2))
        .stdout(Stdio::from(w1))
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut receiver = hpnscp()
        .current_dir(&dstdir)
        .args(["-r", "-t", "."])
        .stdin(Stdio::from(r1))
        .stdout(Stdio::from(w2))
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    assert!(sender.wait().unwrap().success());
    assert!(receiver.wait().unwrap().success());
    assert_eq!(std::fs::read(dstdir.join("tree/f1")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(dstdir.join("tree/sub/f2")).unwrap(), b"beta");
}
