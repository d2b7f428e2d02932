/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct PoolInner {
    buffer_size: usize,
    max_cached: usize,
    free: Mutex<Vec<Vec<u8>>>,
    created: AtomicUsize,
    recycled: AtomicUsize,
}

/// Shared pool of byte buffers. Buffers are handed out empty with at least
/// `buffer_size` capacity and go back to the pool when dropped.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_cached: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_cached,
                free: Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
                recycled: AtomicUsize::new(0),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn take(&self) -> PooledBuffer {
        let buf = self.inner.free.lock().unwrap().pop();

        let buf = match buf {
            Some(buf) => buf,
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);

                Vec::with_capacity(self.inner.buffer_size)
            }
        };

        PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers allocated by the pool so far.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }

    pub fn recycled(&self) -> usize {
        self.inner.recycled.load(Ordering::Relaxed)
    }

    pub fn cached(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Detaches the bytes from the pool.
    pub fn into_vec(mut self) -> Vec<u8> {
        mem::take(&mut self.buf)
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = mem::take(&mut self.buf);

        // oversized or detached buffers are not worth keeping
        if buf.capacity() < self.pool.buffer_size || buf.capacity() > self.pool.buffer_size * 4 {
            return;
        }

        buf.clear();

        let free = &mut *self.pool.free.lock().unwrap();

        if free.len() < self.pool.max_cached {
            free.push(buf);
            self.pool.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }
}
