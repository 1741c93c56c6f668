// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Scratch buffer pool.
//!
//! Buffers are matched by "big enough" rather than exact size. They are meant
//! for data that never leaves the call that acquired them (length prefixes,
//! encoded envelope prefixes); payload bytes handed to handlers are always
//! freshly allocated.

use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Capacity of a freshly allocated buffer when the request is smaller.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024;
/// Number of idle buffers kept around by default.
pub const DEFAULT_MAX_IDLE: usize = 256;

pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
    buffer_capacity: usize,
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self::with_buffer_capacity(max_idle, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_buffer_capacity(max_idle: usize, buffer_capacity: usize) -> Self {
        BufferPool {
            idle: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
            buffer_capacity,
        }
    }

    /// Returns a zeroed buffer of exactly `len` bytes.
    ///
    /// An idle buffer is reused when its capacity covers `len`, otherwise a
    /// new one is allocated. The buffer goes back to the pool when the guard
    /// is dropped.
    pub fn acquire(&self, len: usize) -> PooledBuf<'_> {
        let reused = {
            let mut idle = self.idle.lock();
            idle.iter()
                .rposition(|buf| buf.capacity() >= len)
                .map(|pos| idle.swap_remove(pos))
        };
        let mut buf =
            reused.unwrap_or_else(|| Vec::with_capacity(len.max(self.buffer_capacity)));
        buf.clear();
        buf.resize(len, 0);
        PooledBuf {
            buf: Some(buf),
            pool: self,
        }
    }

    /// Hands a buffer back for reuse. Buffers beyond `max_idle` are dropped.
    pub fn release(&self, buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle_count())
            .field("max_idle", &self.max_idle)
            .field("buffer_capacity", &self.buffer_capacity)
            .finish()
    }
}

/// A scratch buffer borrowed from a [`BufferPool`].
pub struct PooledBuf<'a> {
    buf: Option<Vec<u8>>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl fmt::Debug for PooledBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_returns_exact_length() {
        let pool = BufferPool::default();
        let buf = pool.acquire(4);
        assert_eq!(buf.len(), 4);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn released_buffer_is_reused_and_cleared() {
        let pool = BufferPool::default();
        {
            let mut buf = pool.acquire(16);
            buf.copy_from_slice(&[0xAB; 16]);
        }
        assert_eq!(pool.idle_count(), 1);

        let buf = pool.acquire(8);
        assert_eq!(buf.len(), 8);
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn larger_request_than_idle_capacity_allocates() {
        let pool = BufferPool::with_buffer_capacity(4, 8);
        drop(pool.acquire(8));
        assert_eq!(pool.idle_count(), 1);

        let big = pool.acquire(64);
        assert_eq!(big.len(), 64);
        // the small buffer stays in the pool untouched
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn idle_list_is_bounded() {
        let pool = BufferPool::new(2);
        let a = pool.acquire(1);
        let b = pool.acquire(1);
        let c = pool.acquire(1);
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn concurrent_acquire_release() {
        let pool = Arc::new(BufferPool::new(8));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let mut buf = pool.acquire(4 + (n + i) % 32);
                        buf[0] = i as u8;
                        assert_eq!(buf[0], i as u8);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(pool.idle_count() <= 8);
    }
}
