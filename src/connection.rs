/*
 * Copyright (C) 2020-2023 Fanout, Inc.
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

//! Connection state machine.
//!
//! An [`AsyncConnection`] owns one stream and allows at most one read and
//! one write to be in flight at a time. A read and a write may run
//! concurrently, e.g. from the same `select`. Starting a second read (or
//! write) while one is pending fails immediately without disturbing the
//! first. Writes only complete once every byte has been written.

use crate::core::buffer::{BufferPool, PooledBuffer};
use crate::core::io::{AsyncRead, AsyncWrite};
use arrayvec::{ArrayString, ArrayVec};
use log::debug;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use thiserror::Error;

pub const ID_MAX: usize = 32;

const WRITE_VECTORED_MAX: usize = 8;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("a read is already pending")]
    ReadPending,

    #[error("a write is already pending")]
    WritePending,

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Holds responses of one pipelined batch until they can be written in
/// request order.
#[derive(Debug, Default)]
pub struct PipelineBuffer {
    count: usize,
    next: usize,
    pending: BTreeMap<usize, Vec<u8>>,
}

impl PipelineBuffer {
    /// Buffers the response for slot `index` (1-based) of a batch of
    /// `count` and moves every response that is now due into `out`.
    /// Returns true if `out` has bytes ready to be written.
    pub fn append(&mut self, index: usize, count: usize, data: Vec<u8>, out: &mut Vec<u8>) -> bool {
        if count <= 1 || index == 0 {
            out.extend_from_slice(&data);

            return !out.is_empty();
        }

        if self.count == 0 {
            self.count = count;
            self.next = 1;
        }

        self.pending.insert(index, data);

        while let Some(data) = self.pending.remove(&self.next) {
            out.extend_from_slice(&data);
            self.next += 1;
        }

        if self.next > self.count {
            self.count = 0;
            self.next = 0;
        }

        !out.is_empty()
    }

    /// Responses that were buffered but are not yet due.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.next = 0;
        self.pending.clear();
    }
}

pub struct AsyncConnection<S> {
    stream: RefCell<S>,
    id: ArrayString<ID_MAX>,
    peer: Option<SocketAddr>,
    buffers: BufferPool,
    read_pending: Cell<bool>,
    write_pending: Cell<bool>,
    closed: Cell<bool>,
    keep_alive: Cell<bool>,
    pipeline: RefCell<PipelineBuffer>,
    pipeline_out: RefCell<Vec<u8>>,
    read_time: Cell<Option<Instant>>,
    write_time: Cell<Option<Instant>>,
    bytes_read: Cell<u64>,
    bytes_written: Cell<u64>,
}

impl<S: AsyncRead + AsyncWrite> AsyncConnection<S> {
    pub fn new(stream: S, id: &str, peer: Option<SocketAddr>, buffers: BufferPool) -> Self {
        let mut s = ArrayString::new();

        // ids longer than the limit are truncated
        for c in id.chars() {
            if s.try_push(c).is_err() {
                break;
            }
        }

        Self {
            stream: RefCell::new(stream),
            id: s,
            peer,
            buffers,
            read_pending: Cell::new(false),
            write_pending: Cell::new(false),
            closed: Cell::new(false),
            keep_alive: Cell::new(true),
            pipeline: RefCell::new(PipelineBuffer::default()),
            pipeline_out: RefCell::new(Vec::new()),
            read_time: Cell::new(None),
            write_time: Cell::new(None),
            bytes_read: Cell::new(0),
            bytes_written: Cell::new(0),
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive.get()
    }

    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.keep_alive.set(keep_alive);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Fails all future operations. Pending operations fail the next time
    /// they are polled.
    pub fn close(&self) {
        if !self.closed.replace(true) {
            debug!("conn {}: closed", self.id);
        }

        self.keep_alive.set(false);
    }

    pub fn read_time(&self) -> Option<Instant> {
        self.read_time.get()
    }

    pub fn write_time(&self) -> Option<Instant> {
        self.write_time.get()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.get()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.get()
    }

    /// Reads whatever is available, at most one pool buffer's worth.
    pub fn read(&self) -> ReadFuture<'_, S> {
        let state = if self.closed.get() {
            OpState::Failed(Some(ConnectionError::Closed))
        } else if self.read_pending.replace(true) {
            OpState::Failed(Some(ConnectionError::ReadPending))
        } else {
            OpState::Active(self.buffers.take())
        };

        ReadFuture { c: self, state }
    }

    pub fn write<'a>(&'a self, buf: &'a [u8]) -> WriteFuture<'a, S> {
        self.start_write(WriteSource::Slice(buf))
    }

    pub fn write_vectored<'a>(&'a self, bufs: &'a [&'a [u8]]) -> WriteFuture<'a, S> {
        self.start_write(WriteSource::Vectored(bufs))
    }

    /// Writes out the contents of `buf`, removing bytes from it as they are
    /// written. Dropping the future before completion leaves exactly the
    /// unwritten bytes in `buf`.
    pub fn write_shared<'a>(&'a self, buf: &'a RefCell<Vec<u8>>) -> WriteFuture<'a, S> {
        self.start_write(WriteSource::Shared(buf))
    }

    /// Buffers a pipelined response. See [`PipelineBuffer::append`].
    pub fn append_pipeline(&self, index: usize, count: usize, data: Vec<u8>) -> bool {
        let pipeline = &mut *self.pipeline.borrow_mut();
        let out = &mut *self.pipeline_out.borrow_mut();

        pipeline.append(index, count, data, out)
    }

    pub fn has_pipeline_data(&self) -> bool {
        self.pipeline.borrow().has_pending() || !self.pipeline_out.borrow().is_empty()
    }

    /// Writes every pipelined response that is due.
    pub fn flush_pipeline(&self) -> WriteFuture<'_, S> {
        self.write_shared(&self.pipeline_out)
    }

    /// Drops buffered pipeline data, e.g. after a failed exchange.
    pub fn clear_pipeline(&self) {
        self.pipeline.borrow_mut().clear();
        self.pipeline_out.borrow_mut().clear();
    }

    fn start_write<'a>(&'a self, src: WriteSource<'a>) -> WriteFuture<'a, S> {
        let state = if self.closed.get() {
            OpState::Failed(Some(ConnectionError::Closed))
        } else if self.write_pending.replace(true) {
            OpState::Failed(Some(ConnectionError::WritePending))
        } else {
            OpState::Active(src)
        };

        WriteFuture {
            c: self,
            state,
            written: 0,
        }
    }

    fn fail(&self, e: ConnectionError) -> ConnectionError {
        debug!("conn {}: I/O error: {}", self.id, e);

        self.close();

        e
    }
}

enum OpState<T> {
    Active(T),
    Failed(Option<ConnectionError>),
    Done,
}

pub struct ReadFuture<'a, S: AsyncRead + AsyncWrite> {
    c: &'a AsyncConnection<S>,
    state: OpState<PooledBuffer>,
}

impl<S: AsyncRead + AsyncWrite> Future for ReadFuture<'_, S> {
    type Output = Result<PooledBuffer, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let f = &mut *self;
        let c = f.c;

        if let OpState::Active(_) = &f.state {
            if c.closed.get() {
                f.state = OpState::Done;
                c.read_pending.set(false);

                return Poll::Ready(Err(ConnectionError::Closed));
            }
        }

        let buf = match &mut f.state {
            OpState::Active(buf) => buf,
            OpState::Failed(e) => {
                let e = e.take().unwrap_or(ConnectionError::Closed);

                return Poll::Ready(Err(e));
            }
            OpState::Done => return Poll::Ready(Err(ConnectionError::Closed)),
        };

        let start = buf.len();
        let size = c.buffers.buffer_size().max(1);
        buf.resize(start + size, 0);

        let ret = {
            let stream = &mut *c.stream.borrow_mut();

            Pin::new(stream).poll_read(cx, &mut buf[start..])
        };

        let ret = match ret {
            Poll::Ready(ret) => ret,
            Poll::Pending => {
                buf.truncate(start);

                return Poll::Pending;
            }
        };

        let ret = match ret {
            Ok(0) => {
                buf.truncate(start);

                Err(c.fail(ConnectionError::Closed))
            }
            Ok(n) => {
                buf.truncate(start + n);

                c.bytes_read.set(c.bytes_read.get() + n as u64);
                c.read_time.set(Some(Instant::now()));

                match mem::replace(&mut f.state, OpState::Done) {
                    OpState::Active(buf) => Ok(buf),
                    _ => Err(ConnectionError::Closed),
                }
            }
            Err(e) => {
                buf.truncate(start);

                Err(c.fail(e.into()))
            }
        };

        f.state = OpState::Done;
        c.read_pending.set(false);

        Poll::Ready(ret)
    }
}

impl<S: AsyncRead + AsyncWrite> Drop for ReadFuture<'_, S> {
    fn drop(&mut self) {
        if let OpState::Active(_) = &self.state {
            self.c.stream.borrow_mut().cancel_read();
            self.c.read_pending.set(false);
        }
    }
}

enum WriteSource<'a> {
    Slice(&'a [u8]),
    Vectored(&'a [&'a [u8]]),
    Shared(&'a RefCell<Vec<u8>>),
}

pub struct WriteFuture<'a, S: AsyncRead + AsyncWrite> {
    c: &'a AsyncConnection<S>,
    state: OpState<WriteSource<'a>>,
    written: usize,
}

impl<S: AsyncRead + AsyncWrite> WriteFuture<'_, S> {
    // one attempt to write whatever remains. Ready(None) means nothing was
    // left to write
    fn poll_write_once(&mut self, cx: &mut Context) -> Poll<Option<Result<usize, io::Error>>> {
        let src = match &self.state {
            OpState::Active(src) => src,
            _ => return Poll::Ready(None),
        };

        let stream = &mut *self.c.stream.borrow_mut();

        let ret = match src {
            WriteSource::Slice(buf) => {
                let buf = &buf[self.written..];

                if buf.is_empty() {
                    return Poll::Ready(None);
                }

                Pin::new(stream).poll_write(cx, buf)
            }
            WriteSource::Vectored(bufs) => {
                let mut skip = self.written;
                let mut slices = ArrayVec::<io::IoSlice, WRITE_VECTORED_MAX>::new();

                for buf in bufs.iter() {
                    if skip >= buf.len() {
                        skip -= buf.len();
                        continue;
                    }

                    slices.push(io::IoSlice::new(&buf[skip..]));
                    skip = 0;

                    if slices.is_full() {
                        break;
                    }
                }

                if slices.is_empty() {
                    return Poll::Ready(None);
                }

                Pin::new(stream).poll_write_vectored(cx, &slices)
            }
            WriteSource::Shared(cell) => {
                let ret = {
                    let buf = cell.borrow();

                    if buf.is_empty() {
                        return Poll::Ready(None);
                    }

                    Pin::new(stream).poll_write(cx, &buf)
                };

                if let Poll::Ready(Ok(n)) = &ret {
                    cell.borrow_mut().drain(..*n);
                }

                ret
            }
        };

        ret.map(Some)
    }
}

impl<S: AsyncRead + AsyncWrite> Future for WriteFuture<'_, S> {
    type Output = Result<usize, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let f = &mut *self;
        let c = f.c;

        match &mut f.state {
            OpState::Active(_) => {}
            OpState::Failed(e) => {
                let e = e.take().unwrap_or(ConnectionError::Closed);

                return Poll::Ready(Err(e));
            }
            OpState::Done => return Poll::Ready(Err(ConnectionError::Closed)),
        }

        let ret = loop {
            if c.closed.get() {
                break Err(ConnectionError::Closed);
            }

            match f.poll_write_once(cx) {
                Poll::Ready(None) => break Ok(f.written),
                Poll::Ready(Some(Ok(0))) => {
                    let e = io::Error::from(io::ErrorKind::WriteZero);

                    break Err(c.fail(e.into()));
                }
                Poll::Ready(Some(Ok(n))) => {
                    f.written += n;

                    c.bytes_written.set(c.bytes_written.get() + n as u64);
                    c.write_time.set(Some(Instant::now()));
                }
                Poll::Ready(Some(Err(e))) => break Err(c.fail(e.into())),
                Poll::Pending => return Poll::Pending,
            }
        };

        f.state = OpState::Done;
        c.write_pending.set(false);

        Poll::Ready(ret)
    }
}

impl<S: AsyncRead + AsyncWrite> Drop for WriteFuture<'_, S> {
    fn drop(&mut self) {
        if let OpState::Active(_) = &self.state {
            self.c.stream.borrow_mut().cancel_write();
            self.c.write_pending.set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test::{poll_once, AsyncFakeSock, FakeSock};
    use std::rc::Rc;

    fn setup() -> (Rc<RefCell<FakeSock>>, AsyncConnection<AsyncFakeSock>) {
        let sock = Rc::new(RefCell::new(FakeSock::new()));

        let conn = AsyncConnection::new(
            AsyncFakeSock::new(Rc::clone(&sock)),
            "test-1",
            None,
            BufferPool::new(16, 4),
        );

        (sock, conn)
    }

    #[test]
    fn read() {
        let (sock, conn) = setup();

        let mut fut = conn.read();
        assert!(poll_once(&mut fut).is_pending());

        sock.borrow_mut().add_readable(b"hello");

        match poll_once(&mut fut) {
            Poll::Ready(Ok(buf)) => assert_eq!(&buf[..], b"hello"),
            _ => panic!("expected data"),
        }

        drop(fut);

        assert_eq!(conn.bytes_read(), 5);
        assert!(conn.read_time().is_some());
    }

    #[test]
    fn read_limited_to_buffer_size() {
        let (sock, conn) = setup();

        sock.borrow_mut().add_readable(&[b'a'; 20]);

        match poll_once(&mut conn.read()) {
            Poll::Ready(Ok(buf)) => assert_eq!(buf.len(), 16),
            _ => panic!("expected data"),
        }

        match poll_once(&mut conn.read()) {
            Poll::Ready(Ok(buf)) => assert_eq!(buf.len(), 4),
            _ => panic!("expected data"),
        };
    }

    #[test]
    fn second_read_fails_fast() {
        let (sock, conn) = setup();

        let mut first = conn.read();
        assert!(poll_once(&mut first).is_pending());

        let mut second = conn.read();
        assert!(matches!(
            poll_once(&mut second),
            Poll::Ready(Err(ConnectionError::ReadPending))
        ));
        drop(second);

        // the first read is unaffected
        sock.borrow_mut().add_readable(b"x");
        assert!(matches!(poll_once(&mut first), Poll::Ready(Ok(_))));
        drop(first);

        // and the slot is free again
        sock.borrow_mut().add_readable(b"y");
        assert!(matches!(poll_once(&mut conn.read()), Poll::Ready(Ok(_))));
    }

    #[test]
    fn dropped_read_frees_slot() {
        let (_sock, conn) = setup();

        let mut fut = conn.read();
        assert!(poll_once(&mut fut).is_pending());
        drop(fut);

        assert!(poll_once(&mut conn.read()).is_pending());
    }

    #[test]
    fn read_end_of_stream() {
        let (sock, conn) = setup();

        sock.borrow_mut().close();

        assert!(matches!(
            poll_once(&mut conn.read()),
            Poll::Ready(Err(ConnectionError::Closed))
        ));
        assert!(conn.is_closed());
        assert!(!conn.is_keep_alive());

        assert!(matches!(
            poll_once(&mut conn.write(b"x")),
            Poll::Ready(Err(ConnectionError::Closed))
        ));
    }

    #[test]
    fn write_drains_partial() {
        let (sock, conn) = setup();

        let mut fut = conn.write(b"hello world");
        assert!(poll_once(&mut fut).is_pending());

        sock.borrow_mut().allow_write(4);
        assert!(poll_once(&mut fut).is_pending());
        assert_eq!(sock.borrow_mut().take_writable(), b"hell");

        let mut second = conn.write(b"!");
        assert!(matches!(
            poll_once(&mut second),
            Poll::Ready(Err(ConnectionError::WritePending))
        ));
        drop(second);

        sock.borrow_mut().allow_write(100);
        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(11))));
        assert_eq!(sock.borrow_mut().take_writable(), b"o world");
        assert_eq!(conn.bytes_written(), 11);
    }

    #[test]
    fn write_vectored_in_order() {
        let (sock, conn) = setup();

        let bufs: [&[u8]; 3] = [b"abc", b"", b"defgh"];

        let mut fut = conn.write_vectored(&bufs);

        sock.borrow_mut().allow_write(2);
        assert!(poll_once(&mut fut).is_pending());

        sock.borrow_mut().allow_write(3);
        assert!(poll_once(&mut fut).is_pending());

        sock.borrow_mut().allow_write(10);
        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(8))));

        assert_eq!(sock.borrow_mut().take_writable(), b"abcdefgh");
    }

    #[test]
    fn write_shared_resumes() {
        let (sock, conn) = setup();

        let buf = RefCell::new(b"0123456789".to_vec());

        {
            let mut fut = conn.write_shared(&buf);

            sock.borrow_mut().allow_write(3);
            assert!(poll_once(&mut fut).is_pending());
        }

        assert_eq!(&buf.borrow()[..], b"3456789");

        buf.borrow_mut().extend_from_slice(b"ab");

        sock.borrow_mut().allow_write(100);
        assert!(matches!(
            poll_once(&mut conn.write_shared(&buf)),
            Poll::Ready(Ok(9))
        ));

        assert!(buf.borrow().is_empty());
        assert_eq!(sock.borrow_mut().take_writable(), b"0123456789ab");
    }

    #[test]
    fn read_and_write_concurrently() {
        let (sock, conn) = setup();

        let mut r = conn.read();
        let mut w = conn.write(b"out");

        assert!(poll_once(&mut r).is_pending());
        assert!(poll_once(&mut w).is_pending());

        sock.borrow_mut().allow_write(3);
        assert!(matches!(poll_once(&mut w), Poll::Ready(Ok(3))));

        sock.borrow_mut().add_readable(b"in");
        assert!(matches!(poll_once(&mut r), Poll::Ready(Ok(_))));
    }

    #[test]
    fn pipeline_order() {
        let (sock, conn) = setup();

        assert!(!conn.append_pipeline(3, 3, b"c".to_vec()));
        assert!(!conn.append_pipeline(2, 3, b"b".to_vec()));
        assert!(conn.has_pipeline_data());

        assert!(conn.append_pipeline(1, 3, b"a".to_vec()));

        sock.borrow_mut().allow_write(100);
        assert!(matches!(
            poll_once(&mut conn.flush_pipeline()),
            Poll::Ready(Ok(3))
        ));
        assert_eq!(sock.borrow_mut().take_writable(), b"abc");
        assert!(!conn.has_pipeline_data());

        // next batch starts fresh
        assert!(conn.append_pipeline(1, 2, b"d".to_vec()));
        assert!(conn.append_pipeline(2, 2, b"e".to_vec()));
        assert!(matches!(
            poll_once(&mut conn.flush_pipeline()),
            Poll::Ready(Ok(2))
        ));
        assert_eq!(sock.borrow_mut().take_writable(), b"de");
    }

    #[test]
    fn pipeline_partial_prefix() {
        let mut p = PipelineBuffer::default();
        let mut out = Vec::new();

        assert!(p.append(1, 3, b"a".to_vec(), &mut out));
        assert_eq!(out, b"a");

        out.clear();
        assert!(!p.append(3, 3, b"c".to_vec(), &mut out));
        assert!(p.has_pending());

        assert!(p.append(2, 3, b"b".to_vec(), &mut out));
        assert_eq!(out, b"bc");
        assert!(!p.has_pending());
    }

    #[test]
    fn long_id_truncated() {
        let sock = Rc::new(RefCell::new(FakeSock::new()));

        let conn = AsyncConnection::new(
            AsyncFakeSock::new(sock),
            &"x".repeat(40),
            None,
            BufferPool::new(16, 1),
        );

        assert_eq!(conn.id().len(), ID_MAX);
    }
}
