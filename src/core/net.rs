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

use crate::core::io::{AsyncRead, AsyncWrite};
use crate::core::reactor::{IoEvented, Reactor};
use log::error;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use socket2::SockRef;
use std::future::Future;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

pub const SOCKET_BUFFER_SIZE_DEFAULT: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOpts {
    pub nodelay: bool,
    pub keepalive: bool,
    pub reuse_address: bool,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl Default for SocketOpts {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: true,
            reuse_address: true,
            recv_buffer_size: SOCKET_BUFFER_SIZE_DEFAULT,
            send_buffer_size: SOCKET_BUFFER_SIZE_DEFAULT,
        }
    }
}

/// Applies socket options, logging failures instead of returning them. A
/// connection with a missing option still works.
pub fn set_socket_opts(stream: &TcpStream, opts: &SocketOpts) {
    let sock = SockRef::from(stream);

    if opts.nodelay {
        if let Err(e) = sock.set_nodelay(true) {
            error!("set nodelay failed: {:?}", e);
        }
    }

    if opts.keepalive {
        if let Err(e) = sock.set_keepalive(true) {
            error!("set keepalive failed: {:?}", e);
        }
    }

    if opts.reuse_address {
        if let Err(e) = sock.set_reuse_address(true) {
            error!("set reuse address failed: {:?}", e);
        }
    }

    if opts.recv_buffer_size > 0 {
        if let Err(e) = sock.set_recv_buffer_size(opts.recv_buffer_size) {
            error!("set recv buffer size failed: {:?}", e);
        }
    }

    if opts.send_buffer_size > 0 {
        if let Err(e) = sock.set_send_buffer_size(opts.send_buffer_size) {
            error!("set send buffer size failed: {:?}", e);
        }
    }
}

fn current_reactor() -> Result<Reactor, io::Error> {
    Reactor::current()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no reactor on this thread"))
}

pub struct AsyncTcpListener {
    evented: IoEvented<TcpListener>,
}

impl AsyncTcpListener {
    pub fn new(l: TcpListener) -> Result<Self, io::Error> {
        let evented = IoEvented::new(l, Interest::READABLE, &current_reactor()?)?;

        // there may be pending connections from before registration
        evented.registration().set_ready(Interest::READABLE);

        Ok(Self { evented })
    }

    pub fn bind(addr: SocketAddr) -> Result<Self, io::Error> {
        Self::new(TcpListener::bind(addr)?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.evented.io().local_addr()
    }

    pub fn accept(&self) -> AcceptFuture<'_> {
        AcceptFuture { l: self }
    }
}

pub struct AcceptFuture<'a> {
    l: &'a AsyncTcpListener,
}

impl Future for AcceptFuture<'_> {
    type Output = Result<(TcpStream, SocketAddr), io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let reg = self.l.evented.registration();

        reg.set_waker(cx.waker(), Interest::READABLE);

        if !reg.is_ready(Interest::READABLE) {
            return Poll::Pending;
        }

        if !reg.pull_from_budget() {
            return Poll::Pending;
        }

        match self.l.evented.io().accept() {
            Ok((stream, peer_addr)) => Poll::Ready(Ok((stream, peer_addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                reg.clear_ready(Interest::READABLE);

                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for AcceptFuture<'_> {
    fn drop(&mut self) {
        self.l.evented.registration().clear_waker(Interest::READABLE);
    }
}

/// A TCP stream that registers with the reactor only after an I/O attempt
/// would block, and then only for the direction that blocked.
pub struct AsyncTcpStream {
    evented: IoEvented<TcpStream>,
}

impl AsyncTcpStream {
    pub fn new(s: TcpStream) -> Result<Self, io::Error> {
        let evented = IoEvented::new_lazy(s, &current_reactor()?)?;

        Ok(Self { evented })
    }

    pub async fn connect(addr: SocketAddr) -> Result<Self, io::Error> {
        let stream = TcpStream::connect(addr)?;

        let mut stream = Self::new(stream)?;

        // writability signals connect completion, so wait for it
        stream
            .evented
            .registration()
            .clear_ready(Interest::READABLE | Interest::WRITABLE);
        stream.evented.ensure_interest(Interest::WRITABLE)?;

        TcpConnectFuture { s: &mut stream }.await?;

        Ok(stream)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, io::Error> {
        self.evented.io().peer_addr()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.evented.io().local_addr()
    }

    pub fn shutdown(&self) -> Result<(), io::Error> {
        self.evented.io().shutdown(Shutdown::Both)
    }

    pub fn into_inner(self) -> TcpStream {
        self.evented.into_inner()
    }

    fn would_block(&mut self, interest: Interest) -> Poll<Result<usize, io::Error>> {
        self.evented.registration().clear_ready(interest);

        match self.evented.ensure_interest(interest) {
            Ok(()) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

struct TcpConnectFuture<'a> {
    s: &'a mut AsyncTcpStream,
}

impl Future for TcpConnectFuture<'_> {
    type Output = Result<(), io::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let f = &mut *self;
        let reg = f.s.evented.registration();

        reg.set_waker(cx.waker(), Interest::WRITABLE);

        if !reg.is_ready(Interest::WRITABLE) {
            return Poll::Pending;
        }

        // mio documentation says to use take_error() and peer_addr() to
        // check for connected

        if let Ok(Some(e)) | Err(e) = f.s.evented.io().take_error() {
            return Poll::Ready(Err(e));
        }

        match f.s.evented.io().peer_addr() {
            Ok(_) => {
                // connected. reads may be attempted right away
                reg.set_ready(Interest::READABLE);

                Poll::Ready(Ok(()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                reg.clear_ready(Interest::WRITABLE);

                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for TcpConnectFuture<'_> {
    fn drop(&mut self) {
        self.s.evented.registration().clear_waker(Interest::WRITABLE);
    }
}

impl AsyncRead for AsyncTcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<Result<usize, io::Error>> {
        let f = &mut *self;
        let reg = f.evented.registration();

        reg.set_waker(cx.waker(), Interest::READABLE);

        if !reg.is_ready(Interest::READABLE) {
            return Poll::Pending;
        }

        if !reg.pull_from_budget() {
            return Poll::Pending;
        }

        let ret = (&*f.evented.io()).read(buf);

        match ret {
            Ok(size) => Poll::Ready(Ok(size)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => f.would_block(Interest::READABLE),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn cancel_read(&mut self) {
        self.evented.registration().clear_waker(Interest::READABLE);
    }
}

impl AsyncWrite for AsyncTcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let f = &mut *self;
        let reg = f.evented.registration();

        reg.set_waker(cx.waker(), Interest::WRITABLE);

        if !reg.is_ready(Interest::WRITABLE) {
            return Poll::Pending;
        }

        if !reg.pull_from_budget() {
            return Poll::Pending;
        }

        let ret = (&*f.evented.io()).write(buf);

        match ret {
            Ok(size) => Poll::Ready(Ok(size)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => f.would_block(Interest::WRITABLE),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        let f = &mut *self;
        let reg = f.evented.registration();

        reg.set_waker(cx.waker(), Interest::WRITABLE);

        if !reg.is_ready(Interest::WRITABLE) {
            return Poll::Pending;
        }

        if !reg.pull_from_budget() {
            return Poll::Pending;
        }

        let ret = (&*f.evented.io()).write_vectored(bufs);

        match ret {
            Ok(size) => Poll::Ready(Ok(size)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => f.would_block(Interest::WRITABLE),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn cancel_write(&mut self) {
        self.evented.registration().clear_waker(Interest::WRITABLE);
    }
}
