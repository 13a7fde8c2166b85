// src/core/buffer.rs - Reusable buffers and the bounded pool behind every port
//
// Core features:
// - Fixed-count, fixed-size pool allocated eagerly at construction
// - Blocking acquire with condvar wakeup (the pipeline's back-pressure point)
// - Bounded acquire for worker loops that must observe a stop request
// - Drop-based recycling: a buffer that goes out of scope anywhere returns
//   its storage to the pool it came from, so the pool never leaks capacity

use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Default number of buffers a pool holds.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Default payload capacity in bytes of each buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Out-of-band control marker carried alongside buffer payload.
///
/// Tags are multiplexed into the data stream so a consumer can react to
/// stream boundaries without a separate control channel: `Start` marks
/// stream begin, `End` a clean stop, `Eos` source exhaustion and `Break`
/// a discontinuity (the socket receiver also tags its disconnect sentinel
/// with `Break`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Tag {
    #[default]
    None = 0,
    Start = 1,
    Break = 2,
    End = 3,
    Eos = 4,
}

impl Tag {
    /// Wire encoding used by the socket transport.
    pub(crate) fn to_byte(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_byte(byte: u8) -> Tag {
        match byte {
            1 => Tag::Start,
            2 => Tag::Break,
            3 => Tag::End,
            4 => Tag::Eos,
            _ => Tag::None,
        }
    }
}

struct PoolShared {
    free: Mutex<Vec<Box<[u8]>>>,
    available: Condvar,
    capacity: usize,
    buffer_size: usize,
}

/// Bounded set of reusable buffers owned by one port direction.
///
/// The pool size is fixed at construction: it caps how many buffers may be
/// in flight for a port and is the flow-control mechanism of the whole
/// pipeline. A producer that fills buffers faster than its consumer drains
/// them eventually blocks in [`BufferPool::acquire`].
///
/// Cloning a `BufferPool` clones a handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers, each holding up to
    /// `buffer_size` bytes. All storage is allocated here.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        assert!(capacity >= 1, "pool must hold at least one buffer");
        let free = (0..capacity)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                available: Condvar::new(),
                capacity,
                buffer_size,
            }),
        }
    }

    /// Acquire a free buffer, blocking until one is recycled.
    pub fn acquire(&self) -> Buffer {
        let mut free = self.shared.free.lock().expect("pool lock poisoned");
        loop {
            if let Some(storage) = free.pop() {
                return self.wrap(storage);
            }
            free = self
                .shared
                .available
                .wait(free)
                .expect("pool lock poisoned");
        }
    }

    /// Acquire a free buffer, giving up after `timeout`. Worker loops use
    /// this so a stop request is observed promptly even when the pool is
    /// drained.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Buffer> {
        let deadline = Instant::now() + timeout;
        let mut free = self.shared.free.lock().expect("pool lock poisoned");
        loop {
            if let Some(storage) = free.pop() {
                return Ok(self.wrap(storage));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::PoolExhausted);
            }
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(free, deadline - now)
                .expect("pool lock poisoned");
            free = guard;
        }
    }

    /// Non-blocking acquire.
    pub fn try_acquire(&self) -> Option<Buffer> {
        let mut free = self.shared.free.lock().expect("pool lock poisoned");
        free.pop().map(|storage| self.wrap(storage))
    }

    /// Explicitly return a buffer to its originating pool.
    ///
    /// Dropping the buffer has the same effect; this exists so call sites
    /// can make the hand-back visible. The buffer's length and tag are
    /// cleared on return.
    pub fn release(&self, buffer: Buffer) {
        drop(buffer);
    }

    /// Number of buffers currently free.
    pub fn free_count(&self) -> usize {
        self.shared.free.lock().expect("pool lock poisoned").len()
    }

    /// Total number of buffers this pool owns.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Payload capacity in bytes of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    fn wrap(&self, storage: Box<[u8]>) -> Buffer {
        Buffer {
            storage: Some(storage),
            len: 0,
            tag: Tag::None,
            pool: Arc::downgrade(&self.shared),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_CAPACITY)
    }
}

/// A fixed-capacity data cell: payload bytes, occupied length and a
/// control [`Tag`].
///
/// `Buffer` is a single-owner handle. It moves between the pool's free
/// set, the holder that filled it, and a filled queue; it is never aliased
/// by two collections at once. Wherever it is dropped, its storage returns
/// to the pool it was acquired from - the pool reference travels with the
/// buffer, not with any port, so recycling works even after a port has
/// been reconnected elsewhere.
pub struct Buffer {
    storage: Option<Box<[u8]>>,
    len: usize,
    tag: Tag,
    pool: Weak<PoolShared>,
}

impl Buffer {
    /// Copy `src` into the payload, replacing previous contents. Fails
    /// without writing anything if `src` exceeds the buffer's capacity.
    pub fn write_data(&mut self, src: &[u8]) -> Result<()> {
        let storage = self.storage.as_mut().expect("buffer storage taken");
        if src.len() > storage.len() {
            return Err(Error::CapacityExceeded {
                len: src.len(),
                capacity: storage.len(),
            });
        }
        storage[..src.len()].copy_from_slice(src);
        self.len = src.len();
        Ok(())
    }

    /// The occupied part of the payload.
    pub fn data(&self) -> &[u8] {
        let storage = self.storage.as_ref().expect("buffer storage taken");
        &storage[..self.len]
    }

    /// Occupied length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().expect("buffer storage taken").len()
    }

    pub fn set_tag(&mut self, tag: Tag) {
        self.tag = tag;
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(storage) = self.storage.take() else {
            return;
        };
        // Pool already destroyed: let the storage go with it.
        if let Some(shared) = self.pool.upgrade() {
            let mut free = shared.free.lock().expect("pool lock poisoned");
            free.push(storage);
            shared.available.notify_one();
        }
    }
}
