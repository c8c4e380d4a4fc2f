//! Test plumbing for functions dealing with the wire protocol
// (c) 2025 Ross Younger

use super::{PeerStreams, ReceivingStream, SendingStream};

use tokio::io::{ReadHalf, SimplexStream, WriteHalf, simplex};

type TestStreamPair = PeerStreams<WriteHalf<SimplexStream>, ReadHalf<SimplexStream>>;

impl SendingStream for WriteHalf<SimplexStream> {}
impl ReceivingStream for ReadHalf<SimplexStream> {}

// Byte-slice streams are convenient for one-directional parser tests.
impl ReceivingStream for &[u8] {}
impl SendingStream for Vec<u8> {}

const STREAM_BUFFER_SIZE: usize = 65_536;

/// A bi-directional in-memory stream pair: each side gets one reader and the
/// opposite side's writer, as a protocol function under test expects.
pub(crate) fn new_test_plumbing() -> (TestStreamPair, TestStreamPair) {
    let p1 = simplex(STREAM_BUFFER_SIZE);
    let p2 = simplex(STREAM_BUFFER_SIZE);
    let r1 = (p1.1, p2.0).into();
    let r2 = (p2.1, p1.0).into();
    (r1, r2)
}
