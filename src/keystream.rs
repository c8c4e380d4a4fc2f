//! Multi-threaded AES-CTR keystream pregeneration
// (c) 2025 Ross Younger
//!
//! Counter-mode encryption reduces to XORing plaintext against a keystream,
//! and the keystream depends only on (key, counter) — so it can be computed
//! ahead of the data. This module keeps a ring of fixed-size keystream
//! queues topped up by a pool of worker threads, leaving an aligned XOR as
//! the only work on the encrypt/decrypt hot path.
//!
//! Each queue holds [`KQLEN`] preformed 16-byte blocks and a counter naming
//! the next block to generate into it. Queues cycle through the states
//! Empty → Filling → Full → Draining → Empty; queue 0 additionally starts in
//! Init, which the first worker resolves before the engine accepts data.
//! Queue `i` is seeded with `iv + i·KQLEN`, so the ring covers contiguous,
//! non-overlapping counter ranges and the consumed keystream is exactly the
//! sequence a single-threaded CTR implementation would produce.
//!
//! Workers have no cancellation points of their own; [`KeystreamEngine::stop`]
//! raises a stop flag and broadcasts on every queue, and workers re-check the
//! flag whenever they wake. Stop latency is bounded by one queue fill.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use anyhow::Result;
use tracing::debug;

/// AES block size; the unit of all counter and keystream arithmetic
pub const BLOCK_SIZE: usize = 16;
/// Number of keystream blocks held by one queue (128 KiB of keystream)
pub const KQLEN: usize = 8192;
/// Upper bound on worker threads; more has been measured to hurt
const MAX_THREADS: usize = 6;
/// Upper bound on the queue ring
const MAX_NUMKQ: usize = MAX_THREADS * 4;

/// One 16-byte counter / keystream block
type Block = [u8; BLOCK_SIZE];

/// Increments a big-endian counter block by one.
fn ctr_inc(ctr: &mut Block) {
    for b in ctr.iter_mut().rev() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            return;
        }
    }
}

/// Adds `num` to a big-endian counter block, with carry.
fn ctr_add(ctr: &mut Block, num: u64) {
    let mut num = num;
    let mut carry = 0u16;
    for b in ctr.iter_mut().rev() {
        if num == 0 && carry == 0 {
            break;
        }
        #[allow(clippy::cast_possible_truncation)]
        let n = u16::from(*b) + ((num & 0xff) as u16) + carry;
        num >>= 8;
        *b = (n & 0xff) as u8;
        carry = n >> 8;
    }
}

/// The block primitive, selected by key length at install time.
enum BlockCipher {
    Aes128(Box<Aes128>),
    Aes192(Box<Aes192>),
    Aes256(Box<Aes256>),
}

impl BlockCipher {
    fn new(key: &[u8]) -> Result<Self> {
        Ok(match key.len() {
            16 => Self::Aes128(Box::new(Aes128::new(GenericArray::from_slice(key)))),
            24 => Self::Aes192(Box::new(Aes192::new(GenericArray::from_slice(key)))),
            32 => Self::Aes256(Box::new(Aes256::new(GenericArray::from_slice(key)))),
            n => anyhow::bail!("invalid AES key length {} bits", n * 8),
        })
    }

    /// Encrypts the counter, yielding one keystream block.
    fn keystream_block(&self, ctr: &Block, out: &mut Block) {
        let src = GenericArray::from_slice(ctr);
        let dst = GenericArray::from_mut_slice(out);
        match self {
            Self::Aes128(c) => c.encrypt_block_b2b(src, dst),
            Self::Aes192(c) => c.encrypt_block_b2b(src, dst),
            Self::Aes256(c) => c.encrypt_block_b2b(src, dst),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueState {
    /// Awaiting the bootstrap fill (queue 0 only, once per key install)
    Init,
    /// Ready to be claimed by a worker
    Empty,
    /// A worker is generating into this queue
    Filling,
    /// Ready for the consumer
    Full,
    /// The consumer is reading this queue
    Draining,
}

struct QueueInner {
    state: QueueState,
    /// Counter naming the next block to be generated into this queue
    ctr: Block,
    blocks: Box<[Block]>,
}

struct KeystreamQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl KeystreamQueue {
    fn new(state: QueueState, ctr: Block) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                state,
                ctr,
                blocks: vec![[0u8; BLOCK_SIZE]; KQLEN].into_boxed_slice(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State shared between the consumer and the worker pool.
struct Shared {
    queues: Vec<KeystreamQueue>,
    cipher: BlockCipher,
    /// Cooperative stop request, checked by workers whenever they wake
    stop: RwLock<bool>,
}

impl Shared {
    fn should_stop(&self) -> bool {
        *self.stop.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn numkq(&self) -> usize {
        self.queues.len()
    }
}

/// Fills every slot of a queue, advancing `ctr` one block at a time.
fn generate(cipher: &BlockCipher, ctr: &mut Block, blocks: &mut [Block]) {
    for out in blocks {
        cipher.keystream_block(ctr, out);
        ctr_inc(ctr);
    }
}

/// The life of a pregen worker: find empty queues and fill them, skipping
/// queues claimed by peers and waiting out queues the consumer still owns.
fn worker_loop(shared: &Shared, index: usize) {
    let numkq = shared.numkq();

    // Startup special case: exactly one worker fills queue 0 and hands it
    // straight to the consumer, releasing the installer's wait.
    if index == 0 {
        let q = &shared.queues[0];
        let mut inner = q.lock();
        if inner.state == QueueState::Init {
            let QueueInner { ctr, blocks, .. } = &mut *inner;
            generate(&shared.cipher, ctr, blocks);
            #[allow(clippy::cast_possible_truncation)]
            ctr_add(&mut inner.ctr, (KQLEN * (numkq - 1)) as u64);
            inner.state = QueueState::Draining;
            q.cond.notify_all();
        }
    }

    let mut qidx = 1 % numkq;
    loop {
        if shared.should_stop() {
            return;
        }
        let q = &shared.queues[qidx];
        let mut inner = q.lock();
        while matches!(inner.state, QueueState::Draining | QueueState::Init) {
            if shared.should_stop() {
                return;
            }
            inner = q
                .cond
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if inner.state != QueueState::Empty {
            // another worker got here first
            drop(inner);
            qidx = (qidx + 1) % numkq;
            continue;
        }

        // Claim it, then generate without holding the lock.
        inner.state = QueueState::Filling;
        let mut ctr = inner.ctr;
        q.cond.notify_all();
        drop(inner);

        let mut fresh = vec![[0u8; BLOCK_SIZE]; KQLEN].into_boxed_slice();
        generate(&shared.cipher, &mut ctr, &mut fresh);

        // Re-lock, install the blocks, advance the counter past the rest of
        // the ring so the next fill of this queue carries straight on.
        let mut inner = q.lock();
        inner.blocks = fresh;
        #[allow(clippy::cast_possible_truncation)]
        ctr_add(&mut ctr, (KQLEN * (numkq - 1)) as u64);
        inner.ctr = ctr;
        inner.state = QueueState::Full;
        q.cond.notify_all();
        drop(inner);

        qidx = (qidx + 1) % numkq;
    }
}

/// Picks a worker count for this host.
///
/// Half the core count without SMT, a quarter with (the sibling threads
/// contribute nothing to AES throughput), clamped to `[2, MAX_THREADS]`.
fn pick_thread_count() -> usize {
    let logical = num_cpus::get();
    let physical = num_cpus::get_physical();
    let divisor = if logical > physical { 4 } else { 2 };
    (logical / divisor).clamp(2, MAX_THREADS)
}

/// A multi-threaded AES-CTR keystream engine.
///
/// Install a key with [`new`](Self::new) (or [`rekey`](Self::rekey) on a
/// live engine), then call [`process`](Self::process) /
/// [`process_in_place`](Self::process_in_place) with block-aligned data.
/// Encryption and decryption are the same operation in counter mode.
pub struct KeystreamEngine {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    threads: usize,
    /// Queue currently being drained
    qidx: usize,
    /// Next unconsumed block within that queue
    ridx: usize,
}

impl KeystreamEngine {
    /// Creates an engine for the given key (128, 192 or 256 bits) and
    /// 16-byte initial counter block, sizing the worker pool for this host.
    ///
    /// Blocks until the first keystream queue is ready.
    pub fn new(key: &[u8], iv: &Block) -> Result<Self> {
        Self::with_threads(key, iv, pick_thread_count())
    }

    /// As [`new`](Self::new) with an explicit worker count.
    pub fn with_threads(key: &[u8], iv: &Block, threads: usize) -> Result<Self> {
        let threads = threads.clamp(1, MAX_THREADS);
        let numkq = (threads * 4).min(MAX_NUMKQ).max(2);
        let cipher = BlockCipher::new(key)?;
        debug!("starting {threads} keystream threads and {numkq} queues");

        let queues = (0..numkq)
            .map(|i| {
                let mut ctr = *iv;
                #[allow(clippy::cast_possible_truncation)]
                ctr_add(&mut ctr, (i * KQLEN) as u64);
                let state = if i == 0 {
                    QueueState::Init
                } else {
                    QueueState::Empty
                };
                KeystreamQueue::new(state, ctr)
            })
            .collect();

        let shared = Arc::new(Shared {
            queues,
            cipher,
            stop: RwLock::new(false),
        });

        let workers = (0..threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("keystream-{i}"))
                    .spawn(move || worker_loop(&shared, i))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Hold the installer until the bootstrap fill completes.
        {
            let q = &shared.queues[0];
            let mut inner = q.lock();
            while inner.state == QueueState::Init {
                inner = q
                    .cond
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        Ok(Self {
            shared,
            workers,
            threads,
            qidx: 0,
            ridx: 0,
        })
    }

    /// Installs a fresh key and counter, tearing down the previous worker
    /// pool and reinitialising every queue. The next
    /// [`process`](Self::process) call consumes keystream from `iv` onward.
    pub fn rekey(&mut self, key: &[u8], iv: &Block) -> Result<()> {
        self.stop();
        *self = Self::with_threads(key, iv, self.threads)?;
        Ok(())
    }

    /// XORs `buf` with the next `buf.len() / 16` keystream blocks.
    ///
    /// `buf.len()` must be a multiple of the block size.
    pub fn process_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        anyhow::ensure!(
            buf.len() % BLOCK_SIZE == 0,
            "keystream data length {} is not block-aligned",
            buf.len()
        );
        let shared = Arc::clone(&self.shared);
        let numkq = shared.numkq();

        let mut chunks = buf.chunks_exact_mut(BLOCK_SIZE);
        'queues: loop {
            let q = &shared.queues[self.qidx];
            let mut inner = q.lock();
            loop {
                let Some(chunk) = chunks.next() else {
                    break 'queues;
                };
                let key = &inner.blocks[self.ridx];
                for (d, k) in chunk.iter_mut().zip(key.iter()) {
                    *d ^= k;
                }
                self.ridx += 1;
                if self.ridx == KQLEN {
                    drop(inner);
                    self.advance_queue(numkq);
                    continue 'queues;
                }
            }
        }
        Ok(())
    }

    /// XORs `src` with the keystream into `dst`. Lengths must match and be
    /// block-aligned.
    pub fn process(&mut self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        anyhow::ensure!(
            src.len() == dst.len(),
            "keystream source and destination lengths differ"
        );
        dst.copy_from_slice(src);
        self.process_in_place(dst)
    }

    /// Rolls over to the next queue: claim it from the producers (waiting
    /// for Full if need be), then hand the exhausted queue back.
    ///
    /// Releasing the drained queue *after* claiming the next gives the
    /// producers strict priority on refilling it.
    fn advance_queue(&mut self, numkq: usize) {
        let oldq = &self.shared.queues[self.qidx];
        self.qidx = (self.qidx + 1) % numkq;
        self.ridx = 0;

        let next = &self.shared.queues[self.qidx];
        let mut inner = next.lock();
        while inner.state != QueueState::Full {
            inner = next
                .cond
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        inner.state = QueueState::Draining;
        next.cond.notify_all();
        drop(inner);

        let mut old = oldq.lock();
        old.state = QueueState::Empty;
        oldq.cond.notify_all();
    }

    /// Stops and joins the worker pool, then scrubs the queued keystream.
    /// Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        {
            let mut stop = self
                .shared
                .stop
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *stop = true;
        }
        for q in &self.shared.queues {
            let _guard = q.lock();
            q.cond.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        for q in &self.shared.queues {
            let mut inner = q.lock();
            for block in &mut *inner.blocks {
                block.fill(0);
            }
            inner.ctr.fill(0);
        }
    }

    /// True once the worker pool has been stopped and joined.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Drop for KeystreamEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
