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
use crate::core::reactor::{Reactor, Registration};
use log::debug;
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::Interest;
use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, SslAcceptor, SslMethod, SslStream,
};
use openssl::x509::X509;
use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("no certificate found")]
    NoCertificate,

    #[error(transparent)]
    Ssl(#[from] ErrorStack),
}

fn want_from_code(code: ErrorCode) -> Option<Interest> {
    if code == ErrorCode::WANT_READ {
        Some(Interest::READABLE)
    } else if code == ErrorCode::WANT_WRITE {
        Some(Interest::WRITABLE)
    } else {
        None
    }
}

enum Stream {
    Ssl(SslStream<TcpStream>),
    MidHandshakeSsl(MidHandshakeSslStream<TcpStream>),
}

pub struct TlsAcceptor {
    acceptor: SslAcceptor,
}

impl TlsAcceptor {
    /// Builds an acceptor from a PEM certificate chain (leaf first) and a
    /// PEM private key.
    pub fn from_pem(cert_chain: &[u8], key: &[u8]) -> Result<Self, TlsConfigError> {
        let mut certs = X509::stack_from_pem(cert_chain)?.into_iter();

        let cert = certs.next().ok_or(TlsConfigError::NoCertificate)?;
        let key = PKey::private_key_from_pem(key)?;

        let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;

        acceptor.set_certificate(&cert)?;

        for c in certs {
            acceptor.add_extra_chain_cert(c)?;
        }

        acceptor.set_private_key(&key)?;
        acceptor.check_private_key()?;

        Ok(Self {
            acceptor: acceptor.build(),
        })
    }

    pub fn from_files(cert_file: &Path, key_file: &Path) -> Result<Self, TlsConfigError> {
        let read = |path: &Path| {
            fs::read(path).map_err(|e| TlsConfigError::Read {
                path: path.display().to_string(),
                source: e,
            })
        };

        Self::from_pem(&read(cert_file)?, &read(key_file)?)
    }

    pub fn accept(&self, stream: TcpStream) -> Result<TlsStream, ErrorStack> {
        let stream = match self.acceptor.accept(stream) {
            Ok(stream) => Stream::Ssl(stream),
            Err(HandshakeError::SetupFailure(e)) => return Err(e),
            Err(HandshakeError::Failure(stream)) => Stream::MidHandshakeSsl(stream),
            Err(HandshakeError::WouldBlock(stream)) => Stream::MidHandshakeSsl(stream),
        };

        Ok(TlsStream {
            stream: Some(stream),
            want: Interest::READABLE,
        })
    }
}

/// Server side TLS over a non-blocking TCP stream. The handshake is driven
/// by the first read or write.
pub struct TlsStream {
    stream: Option<Stream>,
    want: Interest,
}

impl TlsStream {
    pub fn get_tcp(&self) -> Option<&TcpStream> {
        match &self.stream {
            Some(Stream::Ssl(stream)) => Some(stream.get_ref()),
            Some(Stream::MidHandshakeSsl(stream)) => Some(stream.get_ref()),
            None => None,
        }
    }

    /// Readiness the engine needs before the last operation that would
    /// have blocked can make progress.
    pub fn want(&self) -> Interest {
        self.want
    }

    pub fn is_handshake_done(&self) -> bool {
        matches!(&self.stream, Some(Stream::Ssl(_)))
    }

    fn ensure_handshake(&mut self) -> Result<&mut SslStream<TcpStream>, io::Error> {
        if let Some(Stream::MidHandshakeSsl(_)) = &self.stream {
            let stream = match self.stream.take() {
                Some(Stream::MidHandshakeSsl(stream)) => stream,
                _ => return Err(io::Error::from(io::ErrorKind::Other)),
            };

            match stream.handshake() {
                Ok(stream) => {
                    debug!("tls handshake success");

                    self.stream = Some(Stream::Ssl(stream));
                }
                Err(HandshakeError::WouldBlock(stream)) => {
                    if let Some(want) = want_from_code(stream.error().code()) {
                        self.want = want;
                    }

                    self.stream = Some(Stream::MidHandshakeSsl(stream));

                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                Err(HandshakeError::SetupFailure(e)) => {
                    return Err(io::Error::new(io::ErrorKind::Other, e));
                }
                Err(HandshakeError::Failure(stream)) => {
                    debug!("tls handshake failed: {}", stream.error());

                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "tls handshake failed",
                    ));
                }
            }
        }

        match &mut self.stream {
            Some(Stream::Ssl(stream)) => Ok(stream),
            _ => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn map_ssl_error(&mut self, e: openssl::ssl::Error) -> Result<usize, io::Error> {
        let code = e.code();

        if let Some(want) = want_from_code(code) {
            self.want = want;

            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        // clean close, or an unexpected EOF from the peer
        if code == ErrorCode::ZERO_RETURN || (code == ErrorCode::SYSCALL && e.io_error().is_none())
        {
            return Ok(0);
        }

        Err(match e.into_io_error() {
            Ok(e) => e,
            Err(e) => io::Error::new(io::ErrorKind::Other, e),
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        let ret = self.ensure_handshake()?.ssl_read(buf);

        match ret {
            Ok(size) => Ok(size),
            Err(e) => self.map_ssl_error(e),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        let ret = self.ensure_handshake()?.ssl_write(buf);

        match ret {
            Ok(size) => Ok(size),
            Err(e) => self.map_ssl_error(e),
        }
    }
}

/// A [`TlsStream`] driven by the current thread's reactor. Registration
/// is lazy like [`AsyncTcpStream`](crate::core::net::AsyncTcpStream), and
/// follows whichever direction the TLS engine is waiting on.
pub struct AsyncTlsStream {
    registration: Registration,
    stream: TlsStream,
    fd: RawFd,
    read_want: Interest,
    write_want: Interest,
}

impl AsyncTlsStream {
    pub fn new(stream: TlsStream) -> Result<Self, io::Error> {
        let reactor = Reactor::current()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no reactor on this thread"))?;

        let fd = match stream.get_tcp() {
            Some(tcp) => tcp.as_raw_fd(),
            None => return Err(io::Error::from(io::ErrorKind::NotConnected)),
        };

        let registration = reactor.register_lazy(Some(Interest::READABLE | Interest::WRITABLE))?;

        Ok(Self {
            registration,
            stream,
            fd,
            read_want: Interest::READABLE,
            write_want: Interest::WRITABLE,
        })
    }

    pub fn inner(&self) -> &TlsStream {
        &self.stream
    }

    fn poll_op<F>(
        &mut self,
        cx: &mut Context,
        dir: Interest,
        op: F,
    ) -> Poll<Result<usize, io::Error>>
    where
        F: FnOnce(&mut TlsStream) -> Result<usize, io::Error>,
    {
        // readiness this direction is waiting on. a read may need the
        // socket to be writable, e.g. to flush handshake data
        let need = if dir.is_readable() {
            self.read_want
        } else {
            self.write_want
        };

        let reg = &self.registration;

        reg.set_waker(cx.waker(), need);

        if !reg.is_ready(need) {
            return Poll::Pending;
        }

        if !reg.pull_from_budget() {
            return Poll::Pending;
        }

        let (ret, want) = match op(&mut self.stream) {
            Ok(size) => (Poll::Ready(Ok(size)), dir),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let want = self.stream.want();

                reg.clear_ready(want);
                reg.set_waker(cx.waker(), want);

                match reg.ensure_interest(&mut SourceFd(&self.fd), want) {
                    Ok(()) => (Poll::Pending, want),
                    Err(e) => (Poll::Ready(Err(e)), dir),
                }
            }
            Err(e) => (Poll::Ready(Err(e)), dir),
        };

        if dir.is_readable() {
            self.read_want = want;
        } else {
            self.write_want = want;
        }

        ret
    }
}

impl Drop for AsyncTlsStream {
    fn drop(&mut self) {
        let _ = self.registration.deregister_io(&mut SourceFd(&self.fd));
    }
}

impl AsyncRead for AsyncTlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<Result<usize, io::Error>> {
        self.poll_op(cx, Interest::READABLE, |s| s.read(buf))
    }

    fn cancel_read(&mut self) {
        self.registration
            .clear_waker(Interest::READABLE | Interest::WRITABLE);
    }
}

impl AsyncWrite for AsyncTlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        self.poll_op(cx, Interest::WRITABLE, |s| s.write(buf))
    }

    fn cancel_write(&mut self) {
        self.registration
            .clear_waker(Interest::READABLE | Interest::WRITABLE);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::Executor;
    use crate::core::net::AsyncTcpListener;
    use openssl::ssl::{SslConnector, SslVerifyMode};
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn bad_key() {
        let (cert, _) = testutil::self_signed();

        assert!(TlsAcceptor::from_pem(&cert, b"not a key").is_err());
        assert!(matches!(
            TlsAcceptor::from_pem(b"", b""),
            Err(TlsConfigError::NoCertificate) | Err(TlsConfigError::Ssl(_))
        ));
    }

    #[test]
    fn echo() {
        let (cert, key) = testutil::self_signed();
        let acceptor = TlsAcceptor::from_pem(&cert, &key).unwrap();

        let reactor = Reactor::new(4).unwrap();
        let executor = Executor::new(1);

        let listener = AsyncTcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        executor
            .spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();

                let mut stream = AsyncTlsStream::new(acceptor.accept(stream).unwrap()).unwrap();

                let mut buf = [0; 5];
                let mut pos = 0;

                while pos < buf.len() {
                    let size = std::future::poll_fn(|cx| {
                        Pin::new(&mut stream).poll_read(cx, &mut buf[pos..])
                    })
                    .await
                    .unwrap();
                    assert!(size > 0);

                    pos += size;
                }

                assert!(stream.inner().is_handshake_done());

                let mut pos = 0;

                while pos < buf.len() {
                    pos += std::future::poll_fn(|cx| {
                        Pin::new(&mut stream).poll_write(cx, &buf[pos..])
                    })
                    .await
                    .unwrap();
                }
            })
            .unwrap();

        let client = thread::spawn(move || {
            let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
            connector.set_verify(SslVerifyMode::NONE);
            let connector = connector.build();

            let tcp = std::net::TcpStream::connect(addr).unwrap();
            let mut s = connector.connect("localhost", tcp).unwrap();

            s.write_all(b"hello").unwrap();

            let mut buf = [0; 5];
            s.read_exact(&mut buf).unwrap();

            buf
        });

        executor.run(|timeout| reactor.poll(timeout)).unwrap();

        assert_eq!(&client.join().unwrap(), b"hello");
    }
}
