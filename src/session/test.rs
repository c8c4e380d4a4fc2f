//! End-to-end tests for the copy session, driven over in-memory pipes
// (c) 2025 Ross Younger

use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use indicatif::{MultiProgress, ProgressDrawTarget};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use super::{Session, SessionConfig, hash::file_prefix_hash, sink::sink, source::source};
use crate::protocol::test_helpers::new_test_plumbing;
use crate::protocol::wire::{ResumeReply, WIRE_ENVELOPE_LEN};
use crate::buffer::RecordBuffer;

fn hidden() -> MultiProgress {
    MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
}

fn config(resume: bool, recursive: bool, preserve: bool) -> SessionConfig {
    SessionConfig {
        recursive,
        preserve,
        resume,
        umask: 0o022,
        quiet: true,
        remote: true, // keep test output clean
        ..Default::default()
    }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) {
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

/// Serialises an envelope the way the receiver would.
fn envelope_bytes(reply: &ResumeReply) -> Vec<u8> {
    let mut buf = RecordBuffer::new();
    reply.marshal(&mut buf).unwrap();
    assert_eq!(buf.len(), WIRE_ENVELOPE_LEN);
    buf.as_slice().to_vec()
}

/// Runs source and sink against each other, returning their session error
/// counts.
async fn transfer(
    src_paths: &[std::path::PathBuf],
    target: &Path,
    request: Option<&str>,
    src_config: SessionConfig,
    dst_config: SessionConfig,
) -> (u64, u64) {
    let (pipe1, pipe2) = new_test_plumbing();
    let mut sender = Session::new(pipe1, src_config, hidden());
    let mut receiver = Session::new(pipe2, dst_config, hidden());
    let (r1, r2) = tokio::join!(
        source(&mut sender, src_paths),
        sink(&mut receiver, target, request)
    );
    r1.unwrap();
    r2.unwrap();
    (sender.errors(), receiver.errors())
}

#[tokio::test]
async fn plain_small_file() {
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("src.txt");
    let dstdir = tmp.path().join("out");
    std::fs::create_dir(&dstdir).unwrap();
    write_file(&src, b"hello wire", 0o644);

    let (e1, e2) = transfer(
        &[src.clone()],
        &dstdir,
        Some("src.txt"),
        config(false, false, false),
        config(false, false, false),
    )
    .await;
    assert_eq!((e1, e2), (0, 0));
    assert_eq!(std::fs::read(dstdir.join("src.txt")).unwrap(), b"hello wire");
}

#[tokio::test]
async fn wire_compatibility_byte_exact() {
    // A 1 KiB file produces exactly the records a stock peer emits.
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("blob");
    let payload = vec![0x42u8; 1024];
    write_file(&src, &payload, 0o600);

    let (ours, mut theirs) = new_test_plumbing();
    // every response in this exchange is an OK byte
    theirs.send.write_all(&[0u8; 4]).await.unwrap();
    let mut session = Session::new(ours, config(false, false, false), hidden());
    source(&mut session, &[src]).await.unwrap();
    assert_eq!(session.errors(), 0);
    drop(session);

    let mut wire = Vec::new();
    let _ = theirs.recv.read_to_end(&mut wire).await.unwrap();
    let mut expected = b"C0600 1024 blob\n".to_vec();
    expected.extend_from_slice(&payload);
    expected.push(0);
    assert_eq!(wire, expected);
}

#[tokio::test]
async fn directory_recursion_wire_order() {
    let tmp = tempfile::TempDir::new().unwrap();
    let dir = tmp.path().join("dir");
    let sub = dir.join("sub");
    std::fs::create_dir_all(&sub).unwrap();
    write_file(&dir.join("f1"), b"abcde", 0o644);
    write_file(&sub.join("f2"), b"1234567", 0o644);
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::fs::set_permissions(&sub, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (ours, mut theirs) = new_test_plumbing();
    theirs.send.write_all(&[0u8; 16]).await.unwrap();
    let mut session = Session::new(ours, config(false, true, false), hidden());
    source(&mut session, &[dir]).await.unwrap();
    drop(session);

    let mut wire = Vec::new();
    let _ = theirs.recv.read_to_end(&mut wire).await.unwrap();
    let mut expected = Vec::new();
    expected.extend_from_slice(b"D0755 0 dir\n");
    expected.extend_from_slice(b"C0644 5 f1\n");
    expected.extend_from_slice(b"abcde\0");
    expected.extend_from_slice(b"D0755 0 sub\n");
    expected.extend_from_slice(b"C0644 7 f2\n");
    expected.extend_from_slice(b"1234567\0");
    expected.extend_from_slice(b"E\n");
    expected.extend_from_slice(b"E\n");
    assert_eq!(wire, expected);
}

#[tokio::test]
async fn recursive_round_trip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let dir = tmp.path().join("tree");
    std::fs::create_dir_all(dir.join("nested")).unwrap();
    write_file(&dir.join("a"), b"top level", 0o644);
    write_file(&dir.join("nested/b"), b"below", 0o600);
    let dstdir = tmp.path().join("out");
    std::fs::create_dir(&dstdir).unwrap();

    let (e1, e2) = transfer(
        &[dir],
        &dstdir,
        None,
        config(false, true, false),
        config(false, true, false),
    )
    .await;
    assert_eq!((e1, e2), (0, 0));
    assert_eq!(std::fs::read(dstdir.join("tree/a")).unwrap(), b"top level");
    assert_eq!(std::fs::read(dstdir.join("tree/nested/b")).unwrap(), b"below");
}

#[tokio::test]
async fn preserved_times_applied() {
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("dated");
    write_file(&src, b"old news", 0o644);
    let times = std::fs::FileTimes::new()
        .set_accessed(std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(12_345))
        .set_modified(std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(654_321));
    std::fs::File::options()
        .write(true)
        .open(&src)
        .unwrap()
        .set_times(times)
        .unwrap();
    let dstdir = tmp.path().join("out");
    std::fs::create_dir(&dstdir).unwrap();

    let (e1, e2) = transfer(
        &[src],
        &dstdir,
        None,
        config(false, false, true),
        config(false, false, true),
    )
    .await;
    assert_eq!((e1, e2), (0, 0));
    let meta = std::fs::metadata(dstdir.join("dated")).unwrap();
    assert_eq!(
        meta.modified().unwrap(),
        std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(654_321)
    );
}

#[tokio::test]
async fn resume_skip_sends_no_body() {
    // Sender's view: a Skip reply means the C record is the only traffic.
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("same");
    write_file(&src, b"identical content here", 0o644);

    let (ours, mut theirs) = new_test_plumbing();
    let mut script = vec![0u8]; // session-opening acknowledgement
    script.extend_from_slice(&envelope_bytes(&ResumeReply::Skip));
    script.push(0); // the response byte after the envelope
    theirs.send.write_all(&script).await.unwrap();

    let mut session = Session::new(ours, config(true, false, false), hidden());
    source(&mut session, &[src.clone()]).await.unwrap();
    assert_eq!(session.errors(), 0);
    drop(session);

    let mut wire = Vec::new();
    let _ = theirs.recv.read_to_end(&mut wire).await.unwrap();
    let hash = file_prefix_hash(&src, 22).unwrap();
    let expected = format!("C0644 22 {hash} same\n");
    assert_eq!(wire, expected.as_bytes());
    // source unchanged
    assert_eq!(std::fs::read(&src).unwrap(), b"identical content here");
}

#[tokio::test]
async fn resume_append_sends_only_the_suffix() {
    // Sender's view: a Resume reply whose hash matches our prefix yields an
    // M byte and exactly size - dest_size body bytes.
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("grow");
    write_file(&src, b"prefix+suffix", 0o644);
    let prefix_hash = file_prefix_hash(&src, 7).unwrap();

    let (ours, mut theirs) = new_test_plumbing();
    let mut script = vec![0u8]; // session-opening acknowledgement
    script.extend_from_slice(&envelope_bytes(&ResumeReply::Resume {
        mode: 0o644,
        size: 7,
        hash: prefix_hash,
    }));
    script.push(0); // envelope response
    script.push(0); // final response after the body
    theirs.send.write_all(&script).await.unwrap();

    let mut session = Session::new(ours, config(true, false, false), hidden());
    source(&mut session, &[src.clone()]).await.unwrap();
    assert_eq!(session.errors(), 0);
    drop(session);

    let mut wire = Vec::new();
    let _ = theirs.recv.read_to_end(&mut wire).await.unwrap();
    let full_hash = file_prefix_hash(&src, 13).unwrap();
    let mut expected = format!("C0644 13 {full_hash} grow\n").into_bytes();
    expected.push(b'M');
    expected.extend_from_slice(b"+suffix");
    expected.push(0);
    assert_eq!(wire, expected);
}

#[tokio::test]
async fn resume_mismatched_prefix_resends_everything() {
    // Sender's view: a Resume reply with a wrong hash yields F and the
    // whole file.
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("clash");
    write_file(&src, b"0123456789", 0o644);

    let (ours, mut theirs) = new_test_plumbing();
    let mut script = vec![0u8]; // session-opening acknowledgement
    script.extend_from_slice(&envelope_bytes(&ResumeReply::Resume {
        mode: 0o644,
        size: 4,
        hash: "ff".repeat(64),
    }));
    script.push(0);
    script.push(0);
    theirs.send.write_all(&script).await.unwrap();

    let mut session = Session::new(ours, config(true, false, false), hidden());
    source(&mut session, &[src.clone()]).await.unwrap();
    drop(session);

    let mut wire = Vec::new();
    let _ = theirs.recv.read_to_end(&mut wire).await.unwrap();
    let full_hash = file_prefix_hash(&src, 10).unwrap();
    let mut expected = format!("C0644 10 {full_hash} clash\n").into_bytes();
    expected.push(b'F');
    expected.extend_from_slice(b"0123456789");
    expected.push(0);
    assert_eq!(wire, expected);
}

#[tokio::test]
async fn resume_skip_full_session() {
    // Both ends live: identical source and destination, nothing rewritten.
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("samefile");
    let dstdir = tmp.path().join("out");
    std::fs::create_dir(&dstdir).unwrap();
    let dst = dstdir.join("samefile");
    write_file(&src, b"matching bytes", 0o644);
    write_file(&dst, b"matching bytes", 0o644);
    let before = std::fs::metadata(&dst).unwrap().modified().unwrap();

    let (e1, e2) = transfer(
        &[src.clone()],
        &dstdir,
        Some("samefile"),
        config(true, false, false),
        config(true, false, false),
    )
    .await;
    assert_eq!((e1, e2), (0, 0));
    assert_eq!(std::fs::read(&dst).unwrap(), b"matching bytes");
    assert_eq!(std::fs::metadata(&dst).unwrap().modified().unwrap(), before);
}

#[tokio::test]
async fn resume_append_full_session() {
    // Destination is a strict prefix: it ends up byte-identical and no
    // sidecar survives.
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("f");
    let dstdir = tmp.path().join("out");
    std::fs::create_dir(&dstdir).unwrap();
    let dst = dstdir.join("f");
    write_file(&src, b"the quick brown fox jumps over the lazy dog", 0o644);
    write_file(&dst, b"the quick brown fox ", 0o644);

    let (e1, e2) = transfer(
        &[src.clone()],
        &dstdir,
        Some("f"),
        config(true, false, false),
        config(true, false, false),
    )
    .await;
    assert_eq!((e1, e2), (0, 0));
    assert_eq!(
        std::fs::read(&dst).unwrap(),
        b"the quick brown fox jumps over the lazy dog"
    );
    // only the destination remains in the target directory
    let names: Vec<_> = std::fs::read_dir(&dstdir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("f")]);
}

#[tokio::test]
async fn resume_same_size_mismatch_full_session() {
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("f");
    let dstdir = tmp.path().join("out");
    std::fs::create_dir(&dstdir).unwrap();
    let dst = dstdir.join("f");
    write_file(&src, b"right contents", 0o644);
    write_file(&dst, b"wrong contents", 0o644); // same length

    let (e1, e2) = transfer(
        &[src.clone()],
        &dstdir,
        Some("f"),
        config(true, false, false),
        config(true, false, false),
    )
    .await;
    assert_eq!((e1, e2), (0, 0));
    assert_eq!(std::fs::read(&dst).unwrap(), b"right contents");
}

#[tokio::test]
async fn resume_longer_destination_overwritten() {
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("f");
    let dstdir = tmp.path().join("out");
    std::fs::create_dir(&dstdir).unwrap();
    let dst = dstdir.join("f");
    write_file(&src, b"short", 0o644);
    write_file(&dst, b"a much longer previous version", 0o644);

    let (e1, e2) = transfer(
        &[src.clone()],
        &dstdir,
        Some("f"),
        config(true, false, false),
        config(true, false, false),
    )
    .await;
    assert_eq!((e1, e2), (0, 0));
    assert_eq!(std::fs::read(&dst).unwrap(), b"short");
}

#[tokio::test]
async fn resume_into_empty_destination() {
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("f");
    let dstdir = tmp.path().join("out");
    std::fs::create_dir(&dstdir).unwrap();
    write_file(&src, b"fresh transfer", 0o644);

    let (e1, e2) = transfer(
        &[src.clone()],
        &dstdir,
        Some("f"),
        config(true, false, false),
        config(true, false, false),
    )
    .await;
    assert_eq!((e1, e2), (0, 0));
    assert_eq!(std::fs::read(dstdir.join("f")).unwrap(), b"fresh transfer");
}

#[tokio::test]
async fn unmatched_filename_is_fatal() {
    let tmp = tempfile::TempDir::new().unwrap();
    let src = tmp.path().join("unrequested");
    let dstdir = tmp.path().join("out");
    std::fs::create_dir(&dstdir).unwrap();
    write_file(&src, b"x", 0o644);

    let (pipe1, pipe2) = new_test_plumbing();
    let mut sender = Session::new(pipe1, config(false, false, false), hidden());
    let mut receiver = Session::new(pipe2, config(false, false, false), hidden());
    let srcs = [src];
    let (_r1, r2) = tokio::join!(
        source(&mut sender, &srcs),
        sink(&mut receiver, &dstdir, Some("a{b,c}"))
    );
    let err = r2.unwrap_err().to_string();
    assert!(err.contains("does not match"), "unexpected error: {err}");
}

#[tokio::test]
async fn missing_source_is_nonfatal() {
    let tmp = tempfile::TempDir::new().unwrap();
    let dstdir = tmp.path().join("out");
    std::fs::create_dir(&dstdir).unwrap();
    let good = tmp.path().join("good");
    write_file(&good, b"survives", 0o644);

    let (e1, e2) = transfer(
        &[tmp.path().join("no-such-file"), good],
        &dstdir,
        None,
        config(false, false, false),
        config(false, false, false),
    )
    .await;
    // the sender noted the failure, the receiver echoed it
    assert_eq!(e1, 1);
    assert_eq!(e2, 1);
    assert_eq!(std::fs::read(dstdir.join("good")).unwrap(), b"survives");
}
