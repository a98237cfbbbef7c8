//! Buffer Pool
//!
//! Fixed-size byte buffers shared by the listener threads and the sender tasks.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Thread-safe pool of equally sized buffers.
///
/// Buffers are handed out as [`PooledBuffer`] guards and go back to the pool
/// when the guard is dropped, so every exit path returns them. The pool never
/// discards a returned buffer: once all guards are gone, `available()` equals
/// `allocated()`.
#[derive(Debug)]
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicUsize,
}

impl BufferPool {
    pub fn new(buf_size: usize, initial: usize) -> Arc<Self> {
        let buffers = (0..initial).map(|_| vec![0u8; buf_size]).collect();
        Arc::new(BufferPool {
            buf_size,
            buffers: Mutex::new(buffers),
            allocated: AtomicUsize::new(initial),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Borrow a buffer, allocating a new one if the pool is empty
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self.lock().pop().unwrap_or_else(|| {
            tracing::debug!("no buffer in pool: creating new buffer");
            self.allocated.fetch_add(1, Ordering::SeqCst);
            vec![0u8; self.buf_size]
        });

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently sitting in the pool
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    /// Buffers created over the pool's lifetime
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        // Send paths may have shrunk the vector; restore the full working length.
        buf.clear();
        buf.resize(self.buf_size, 0);
        self.lock().push(buf);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        // A panic while holding this lock cannot leave the Vec half-updated.
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A buffer borrowed from a [`BufferPool`]; returned on drop
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        self.buf.get_or_insert_with(Vec::new)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_vec_mut().as_mut_slice()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}
