//! Growable byte queue used for protocol assembly and parsing
// (c) 2025 Ross Younger
//!
//! A [`RecordBuffer`] is an append-only region with a consume cursor at the
//! front, used both as a serialisation sink (build a record, then drain it to
//! the peer) and as a parsing source (accumulate peer bytes, then consume
//! them field by field).
//!
//! Buffers come in two flavours:
//! * **Owned** buffers are mutable and growable, up to a settable maximum.
//! * **Views** borrow a window of refcounted bytes ([`bytes::Bytes`]) without
//!   copying them. A view of a view shares the same backing store, so a
//!   child always keeps its parent's storage alive and a view never outlives
//!   the bytes it points into. Views are read-only; mutating operations on
//!   them fail with [`BufferError::ReadOnly`].
//!
//! # Growth policy
//!
//! Owned buffers grow in 32 KiB increments. Incremental growth is
//! pathologically slow when a stream's flow-control window is large and the
//! buffer has to climb from a few hundred bytes to several hundred KiB, so a
//! buffer may carry an advisory *window hint*: when a growth request rounds
//! past the 256 KiB watershed while the capacity is still below the hint,
//! the allocation jumps straight to the hint (clamped to the maximum).

use bytes::Bytes;

/// Initial and post-[`reset`](RecordBuffer::reset) capacity of an owned buffer
pub const SIZE_INIT: usize = 256;
/// Allocation increment
const SIZE_INC: usize = 32 * 1024;
/// Hard ceiling on any buffer's capacity
pub const SIZE_MAX: usize = 0x0800_0000;
/// Minimum consumed prefix before packing is considered
const PACK_MIN: usize = 8192;
/// Growth requests rounding past this point consult the window hint
const WATERSHED: usize = 256 * 1024;

const fn roundup(x: usize, inc: usize) -> usize {
    x.div_ceil(inc) * inc
}

/// Failure modes of buffer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The operation would mutate a read-only view
    #[error("buffer is read-only")]
    ReadOnly,
    /// The operation would exceed the buffer's maximum capacity
    #[error("no buffer space available")]
    NoSpace,
    /// More bytes were requested than are currently buffered
    #[error("incomplete message in buffer")]
    Incomplete,
}

enum Storage {
    /// Mutable backing; the vector's length is the allocated capacity.
    Owned(Vec<u8>),
    /// Read-only refcounted window into externally owned (or parent) bytes.
    View(Bytes),
}

/// A single-owner growable byte queue with a consume cursor.
pub struct RecordBuffer {
    store: Storage,
    /// Consume offset; bytes before this point have been drained.
    off: usize,
    /// Live-size watermark; bytes in `off..size` are the live region.
    size: usize,
    /// Upper bound on capacity growth.
    max_size: usize,
    /// Advisory growth target; 0 means unset.
    window_hint: usize,
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordBuffer {
    /// Creates an empty, mutable buffer with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Storage::Owned(vec![0u8; SIZE_INIT]),
            off: 0,
            size: 0,
            max_size: SIZE_MAX,
            window_hint: 0,
        }
    }

    /// Creates a read-only view over externally owned bytes, without copying.
    ///
    /// The backing storage is refcounted; it is released when the last view
    /// over it is dropped.
    pub fn view<B: Into<Bytes>>(blob: B) -> Result<Self, BufferError> {
        let bytes = blob.into();
        if bytes.len() > SIZE_MAX {
            return Err(BufferError::NoSpace);
        }
        let size = bytes.len();
        Ok(Self {
            store: Storage::View(bytes),
            off: 0,
            size,
            max_size: size,
            window_hint: 0,
        })
    }

    /// Converts this buffer into a read-only view of its live region.
    ///
    /// Zero-copy; further views taken with [`subview`](Self::subview) share
    /// the same backing store.
    #[must_use]
    pub fn into_view(mut self) -> Self {
        self.sanity();
        if self.is_read_only() {
            return self;
        }
        let Storage::Owned(d) = &mut self.store else {
            unreachable!()
        };
        let bytes = Bytes::from(std::mem::take(d)).slice(self.off..self.size);
        let size = bytes.len();
        Self {
            store: Storage::View(bytes),
            off: 0,
            size,
            max_size: size,
            window_hint: 0,
        }
    }

    /// Creates a child view of this view's live region.
    ///
    /// The child borrows the same backing bytes (extending their refcount)
    /// and cannot outlive them. Owned buffers must be frozen with
    /// [`into_view`](Self::into_view) first.
    pub fn subview(&self) -> Result<Self, BufferError> {
        self.sanity();
        match &self.store {
            Storage::Owned(_) => Err(BufferError::ReadOnly),
            Storage::View(b) => Self::view(b.slice(self.off..self.size)),
        }
    }

    /// Number of live (unconsumed) bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.sanity();
        self.size - self.off
    }

    /// True if there are no live bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Currently allocated capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        match &self.store {
            Storage::Owned(d) => d.len(),
            Storage::View(b) => b.len(),
        }
    }

    /// Maximum capacity this buffer may grow to
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// True for read-only views
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self.store, Storage::View(_))
    }

    /// The live region
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.sanity();
        match &self.store {
            Storage::Owned(d) => &d[self.off..self.size],
            Storage::View(b) => &b[self.off..self.size],
        }
    }

    /// Sets the advisory growth target. 0 clears it.
    pub fn set_window_hint(&mut self, hint: usize) {
        self.window_hint = hint.min(SIZE_MAX);
    }

    /// Clears the buffer, shrinking the allocation back toward the default.
    ///
    /// On a read-only view this cannot touch the bytes; the view merely
    /// appears empty afterwards.
    pub fn reset(&mut self) {
        self.sanity();
        match &mut self.store {
            Storage::View(_) => {
                self.off = self.size;
            }
            Storage::Owned(d) => {
                self.off = 0;
                self.size = 0;
                d.fill(0);
                if d.len() != SIZE_INIT {
                    d.clear();
                    d.resize(SIZE_INIT, 0);
                    d.shrink_to(SIZE_INIT);
                }
            }
        }
    }

    /// Bounds future growth by `max_size`, shrinking the backing region if
    /// it is larger than needed.
    pub fn set_max_size(&mut self, max_size: usize) -> Result<(), BufferError> {
        self.sanity();
        if max_size == self.max_size {
            return Ok(());
        }
        if max_size > SIZE_MAX {
            return Err(BufferError::NoSpace);
        }
        let Storage::Owned(_) = &self.store else {
            return Err(BufferError::ReadOnly);
        };
        self.pack(max_size < self.size);
        let Storage::Owned(d) = &mut self.store else {
            unreachable!()
        };
        if max_size < d.len() && max_size > self.size {
            let rlen = roundup(self.size.max(SIZE_INIT), SIZE_INC).min(max_size);
            let mut nd = vec![0u8; rlen];
            nd[..self.size].copy_from_slice(&d[..self.size]);
            d.fill(0);
            *d = nd;
        }
        if max_size < d.len() {
            // live bytes no longer fit under the requested bound
            return Err(BufferError::NoSpace);
        }
        self.max_size = max_size;
        Ok(())
    }

    /// Appends `len` bytes and returns the freshly appended region for the
    /// caller to fill in.
    pub fn reserve(&mut self, len: usize) -> Result<&mut [u8], BufferError> {
        self.allocate(len)?;
        let start = self.size;
        self.size += len;
        let Storage::Owned(d) = &mut self.store else {
            unreachable!()
        };
        Ok(&mut d[start..start + len])
    }

    /// Appends a slice of bytes.
    pub fn put(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.reserve(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Advances the consume cursor past `len` live bytes.
    ///
    /// A consume that empties the buffer collapses the cursor back to the
    /// start of the allocation.
    pub fn consume(&mut self, len: usize) -> Result<(), BufferError> {
        self.sanity();
        if len > self.len() {
            return Err(BufferError::Incomplete);
        }
        self.off += len;
        if self.off == self.size {
            self.off = 0;
            self.size = 0;
        }
        Ok(())
    }

    /// Shrinks the live region by `len` bytes from the tail.
    pub fn consume_end(&mut self, len: usize) -> Result<(), BufferError> {
        self.sanity();
        if len > self.len() {
            return Err(BufferError::Incomplete);
        }
        self.size -= len;
        Ok(())
    }

    /// Shifts the live region down to offset zero when worthwhile (or forced).
    fn pack(&mut self, force: bool) {
        let Storage::Owned(d) = &mut self.store else {
            return;
        };
        if self.off == 0 {
            return;
        }
        if force || (self.off >= PACK_MIN && self.off >= self.size / 2) {
            d.copy_within(self.off..self.size, 0);
            self.size -= self.off;
            self.off = 0;
        }
    }

    /// Ensures at least `len` bytes can be appended, growing the allocation
    /// if necessary.
    fn allocate(&mut self, len: usize) -> Result<(), BufferError> {
        self.sanity();
        if matches!(self.store, Storage::View(_)) {
            return Err(BufferError::ReadOnly);
        }
        if len > self.max_size || self.max_size - len < self.size - self.off {
            return Err(BufferError::NoSpace);
        }
        self.pack(self.size + len > self.max_size);
        let Storage::Owned(d) = &mut self.store else {
            unreachable!()
        };
        if self.size + len <= d.len() {
            return Ok(());
        }
        let mut need = self.size + len - d.len();
        let mut rlen = roundup(d.len() + need, SIZE_INC);
        // A buffer climbing past the watershed on a hinted (hot) stream jumps
        // straight to the hint instead of crawling up one increment at a time.
        if rlen > WATERSHED && self.window_hint != 0 && d.len() < self.window_hint {
            need = self.window_hint;
            rlen = roundup(d.len() + need, SIZE_INC).min(self.max_size);
        }
        if rlen > self.max_size {
            rlen = d.len() + need;
        }
        let mut nd = vec![0u8; rlen];
        nd[..self.size].copy_from_slice(&d[..self.size]);
        d.fill(0);
        *d = nd;
        Ok(())
    }

    /// Internal invariant check. Corrupted buffer state is not recoverable;
    /// this panics rather than attempting repair.
    fn sanity(&self) {
        let alloc = match &self.store {
            Storage::Owned(d) => d.len(),
            Storage::View(b) => b.len(),
        };
        assert!(
            self.off <= self.size && self.size <= alloc && self.max_size <= SIZE_MAX,
            "buffer internals corrupted (off={}, size={}, alloc={alloc}, max={})",
            self.off,
            self.size,
            self.max_size,
        );
    }
}

impl Drop for RecordBuffer {
    fn drop(&mut self) {
        if let Storage::Owned(d) = &mut self.store {
            d.fill(0);
        }
    }
}

impl std::fmt::Debug for RecordBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBuffer")
            .field("read_only", &self.is_read_only())
            .field("off", &self.off)
            .field("size", &self.size)
            .field("alloc", &self.capacity())
            .field("max_size", &self.max_size)
            .field("window_hint", &self.window_hint)
            .finish()
    }
}
