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

use crate::codec::{FrameError, FrameReader, Header, Mode, Progress, HEADER_SIZE};
use crate::config::ServerConfig;
use crate::connection::{AsyncConnection, ConnectionError};
use crate::core::buffer::BufferPool;
use crate::core::channel::{self, local_channel, AsyncReceiver, LocalReceiver, LocalSender};
use crate::core::counter::{Counter, CounterGuard};
use crate::core::executor::{Executor, Spawner};
use crate::core::io::{AsyncRead, AsyncWrite};
use crate::core::net::{set_socket_opts, AsyncTcpListener, AsyncTcpStream, SocketOpts};
use crate::core::reactor::{Reactor, Timeout};
use crate::core::select::{select_2, select_3, Select2, Select3};
use crate::core::workers::WorkerPool;
use crate::dispatcher::{Dispatcher, Exchange, ExchangePool, Step};
use crate::tls::{AsyncTlsStream, TlsAcceptor, TlsConfigError};
use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;
use thiserror::Error;

const LISTENER_REGISTRATIONS_MAX: usize = 16;
const LISTENER_TASKS_MAX: usize = 1;

// connection tasks per I/O thread when no connection limit is set
const WORKER_CONNECTIONS_DEFAULT: usize = 4096;

// the main task plus slack
const WORKER_NON_CONNECTION_TASKS_MAX: usize = 4;

// stream, read timeout and spare
const REGISTRATIONS_PER_TASK_MAX: usize = 3;

const ACCEPT_QUEUE_SIZE: usize = 64;
const RESULTS_QUEUE_SIZE: usize = 1024;
const REACTOR_BUDGET: u32 = 100;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error(transparent)]
    Tls(#[from] TlsConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
enum ServeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),

    #[error("idle timeout")]
    Idle,

    #[error("exchange failed")]
    Failed,

    #[error("server stopping")]
    Stopped,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Connection counters owned by one server.
pub struct ServerStats {
    created: AtomicU64,
    living: Arc<Counter>,
    closed: AtomicU64,
    refused: AtomicU64,
}

impl ServerStats {
    fn new(maxconns: i64) -> Self {
        let living = if maxconns < 1 {
            Counter::new(0)
        } else {
            Counter::with_limit(0, maxconns as usize)
        };

        Self {
            created: AtomicU64::new(0),
            living: Arc::new(living),
            closed: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn living(&self) -> usize {
        self.living.value()
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub created: u64,
    pub living: usize,
    pub closed: u64,
    pub refused: u64,
    pub executed: u64,
    pub illegal_requests: u64,
}

/// One admitted connection. Dropping it updates the counters.
struct LiveConn {
    _living: CounterGuard,
    stats: Arc<ServerStats>,
}

impl LiveConn {
    fn admit(stats: &Arc<ServerStats>) -> Option<Self> {
        let living = CounterGuard::acquire(&stats.living).ok()?;

        stats.created.fetch_add(1, Ordering::Relaxed);

        Some(Self {
            _living: living,
            stats: Arc::clone(stats),
        })
    }
}

impl Drop for LiveConn {
    fn drop(&mut self) {
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
    }
}

type Accepted = (TcpStream, SocketAddr, LiveConn);

enum NetStream {
    Plain(AsyncTcpStream),
    Tls(AsyncTlsStream),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }

    fn cancel_read(&mut self) {
        match self {
            NetStream::Plain(s) => s.cancel_read(),
            NetStream::Tls(s) => s.cancel_read(),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            NetStream::Tls(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn cancel_write(&mut self) {
        match self {
            NetStream::Plain(s) => s.cancel_write(),
            NetStream::Tls(s) => s.cancel_write(),
        }
    }
}

struct Listener {
    thread: Option<thread::JoinHandle<()>>,
    stop: Option<channel::Sender<()>>,
}

impl Listener {
    fn new(
        listener: TcpListener,
        senders: Vec<channel::Sender<Accepted>>,
        stats: Arc<ServerStats>,
    ) -> Result<Self, io::Error> {
        let (stop, r_stop) = channel::channel(1);

        let thread = thread::Builder::new()
            .name("sncp-listener".to_string())
            .spawn(move || {
                let reactor = match Reactor::new(LISTENER_REGISTRATIONS_MAX) {
                    Ok(reactor) => reactor,
                    Err(e) => {
                        error!("listener: failed to create reactor: {}", e);
                        return;
                    }
                };

                let executor = Executor::new(LISTENER_TASKS_MAX);

                if executor
                    .spawn(Self::run(r_stop, listener, senders, stats))
                    .is_err()
                {
                    error!("listener: failed to spawn task");
                    return;
                }

                if let Err(e) = executor.run(|timeout| reactor.poll(timeout)) {
                    error!("listener: {}", e);
                }
            })?;

        Ok(Self {
            thread: Some(thread),
            stop: Some(stop),
        })
    }

    async fn run(
        stop: channel::Receiver<()>,
        listener: TcpListener,
        senders: Vec<channel::Sender<Accepted>>,
        stats: Arc<ServerStats>,
    ) {
        let (stop, listener) = match (AsyncReceiver::new(stop), AsyncTcpListener::new(listener)) {
            (Ok(stop), Ok(listener)) => (stop, listener),
            _ => {
                error!("listener: failed to register");
                return;
            }
        };

        let opts = SocketOpts::default();
        let mut senders_pos = 0;

        loop {
            let (stream, peer_addr) = match select_2(stop.recv(), listener.accept()).await {
                Select2::R1(_) => break,
                Select2::R2(Ok(ret)) => ret,
                Select2::R2(Err(e)) => {
                    error!("accept error: {:?}", e);
                    continue;
                }
            };

            let live = match LiveConn::admit(&stats) {
                Some(live) => live,
                None => {
                    stats.refused.fetch_add(1, Ordering::Relaxed);

                    debug!("refusing connection from {}: too many connections", peer_addr);

                    continue;
                }
            };

            debug!("accepted connection from {}", peer_addr);

            set_socket_opts(&stream, &opts);

            let mut pending = Some((stream, peer_addr, live));

            for _ in 0..senders.len() {
                let sender = &senders[senders_pos];
                senders_pos = (senders_pos + 1) % senders.len();

                if let Some(item) = pending.take() {
                    match sender.try_send(item) {
                        Ok(()) => break,
                        Err(mpsc::TrySendError::Full(item)) => pending = Some(item),
                        Err(mpsc::TrySendError::Disconnected(_)) => {
                            // this could happen during shutdown
                            debug!("worker disconnected");
                        }
                    }
                }
            }

            if pending.is_some() {
                warn!("all workers busy, dropping connection from {}", peer_addr);
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Parts of the server shared by every I/O thread.
#[derive(Clone)]
struct Shared {
    dispatcher: Arc<Dispatcher>,
    blocking: Arc<WorkerPool>,
    tls: Option<Arc<TlsAcceptor>>,
    buffers: BufferPool,
    read_timeout: Duration,
    max_body: usize,
    exchange_pool_max: usize,
    conns_max: usize,
}

/// Per-thread state of an I/O worker.
struct WorkerCtx {
    id: usize,
    shared: Shared,
    reactor: Reactor,
    results: channel::Sender<Box<Exchange>>,
    exchanges: RefCell<ExchangePool>,
    routes: RefCell<HashMap<u64, LocalSender<Box<Exchange>>>>,
    next_key: Cell<u64>,
    inbox_size: usize,
}

impl WorkerCtx {
    fn route(&self, ex: Box<Exchange>) {
        let ret = match self.routes.borrow().get(&ex.conn()) {
            Some(sender) => sender.try_send(ex),
            None => Err(mpsc::TrySendError::Disconnected(ex)),
        };

        if let Err(e) = ret {
            let ex = match e {
                mpsc::TrySendError::Full(ex) => ex,
                mpsc::TrySendError::Disconnected(ex) => ex,
            };

            debug!(
                "worker {}: dropping result for connection {}",
                self.id,
                ex.conn()
            );

            self.exchanges.borrow_mut().put(ex);
        }
    }
}

struct IoWorker {
    thread: Option<thread::JoinHandle<()>>,
    stop: Option<channel::Sender<()>>,
}

impl IoWorker {
    fn new(
        id: usize,
        shared: Shared,
        conns: channel::Receiver<Accepted>,
    ) -> Result<Self, io::Error> {
        debug!("worker {}: starting", id);

        let (stop, r_stop) = channel::channel(1);

        let thread = thread::Builder::new()
            .name(format!("sncp-io-{}", id))
            .spawn(move || {
                let tasks_max = shared.conns_max + WORKER_NON_CONNECTION_TASKS_MAX;
                let registrations_max = REGISTRATIONS_PER_TASK_MAX * tasks_max;

                let reactor = match Reactor::new(registrations_max) {
                    Ok(reactor) => reactor,
                    Err(e) => {
                        error!("worker {}: failed to create reactor: {}", id, e);
                        return;
                    }
                };

                let executor = Executor::new(tasks_max);

                {
                    let reactor = reactor.clone();

                    executor.set_pre_poll(move || {
                        reactor.set_budget(Some(REACTOR_BUDGET));
                    });
                }

                let spawner = executor.spawner();

                if executor
                    .spawn(Self::run(
                        id,
                        r_stop,
                        conns,
                        shared,
                        reactor.clone(),
                        spawner,
                    ))
                    .is_err()
                {
                    error!("worker {}: failed to spawn task", id);
                    return;
                }

                if let Err(e) = executor.run(|timeout| reactor.poll(timeout)) {
                    error!("worker {}: {}", id, e);
                }

                debug!("worker {}: stopped", id);
            })?;

        Ok(Self {
            thread: Some(thread),
            stop: Some(stop),
        })
    }

    async fn run(
        id: usize,
        stop: channel::Receiver<()>,
        conns: channel::Receiver<Accepted>,
        shared: Shared,
        reactor: Reactor,
        spawner: Spawner,
    ) {
        let (s_results, r_results) = channel::channel(RESULTS_QUEUE_SIZE);

        let (stop, conns, results) = match (
            AsyncReceiver::new(stop),
            AsyncReceiver::new(conns),
            AsyncReceiver::new(r_results),
        ) {
            (Ok(stop), Ok(conns), Ok(results)) => (stop, conns, results),
            _ => {
                error!("worker {}: failed to register channels", id);
                return;
            }
        };

        // every frame of one read may be in flight at once
        let inbox_size = shared.buffers.buffer_size() / HEADER_SIZE + 1;

        let ctx = Rc::new(WorkerCtx {
            id,
            exchanges: RefCell::new(ExchangePool::new(shared.exchange_pool_max)),
            shared,
            reactor,
            results: s_results,
            routes: RefCell::new(HashMap::new()),
            next_key: Cell::new(0),
            inbox_size,
        });

        loop {
            match select_3(stop.recv(), conns.recv(), results.recv()).await {
                Select3::R1(_) => break,
                Select3::R2(Ok((stream, peer_addr, live))) => {
                    let key = ctx.next_key.get();
                    ctx.next_key.set(key + 1);

                    let (sender, inbox) = local_channel(ctx.inbox_size);

                    ctx.routes.borrow_mut().insert(key, sender);

                    let fut = connection_task(Rc::clone(&ctx), key, stream, peer_addr, live, inbox);

                    if spawner.spawn(fut).is_err() {
                        warn!("worker {}: no room for connection from {}", id, peer_addr);

                        ctx.routes.borrow_mut().remove(&key);
                    }
                }
                Select3::R2(Err(_)) => break,
                Select3::R3(Ok(ex)) => ctx.route(ex),
                Select3::R3(Err(_)) => break,
            }
        }

        // connection tasks see their inbox disconnect and finish
        ctx.routes.borrow_mut().clear();

        debug!("worker {}: task stopped: main", id);
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn connection_task(
    ctx: Rc<WorkerCtx>,
    key: u64,
    stream: TcpStream,
    peer_addr: SocketAddr,
    live: LiveConn,
    inbox: LocalReceiver<Box<Exchange>>,
) {
    let id = format!("{}-{}", ctx.id, key);

    let stream = match &ctx.shared.tls {
        Some(acceptor) => match acceptor.accept(stream) {
            Ok(stream) => AsyncTlsStream::new(stream).map(NetStream::Tls),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        },
        None => AsyncTcpStream::new(stream).map(NetStream::Plain),
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            debug!("conn {}: setup failed: {}", id, e);

            ctx.routes.borrow_mut().remove(&key);
            return;
        }
    };

    let conn = AsyncConnection::new(stream, &id, Some(peer_addr), ctx.shared.buffers.clone());

    debug!("conn {}: serving {}", id, peer_addr);

    match serve_connection(&ctx, key, &conn, &inbox).await {
        Ok(()) | Err(ServeError::Connection(ConnectionError::Closed)) => {
            debug!("conn {}: closed", id)
        }
        Err(e) => debug!("conn {}: closing: {}", id, e),
    }

    conn.close();

    ctx.routes.borrow_mut().remove(&key);

    // drain results that arrived after the last read
    while let Ok(ex) = inbox.try_recv() {
        ctx.exchanges.borrow_mut().put(ex);
    }

    drop(live);
}

enum Outcome {
    Continue,
    Close,
}

/// Buffers the response of a finished exchange. A response without output
/// is an error completion and ends the connection.
fn finish_exchange<S: AsyncRead + AsyncWrite>(
    ctx: &WorkerCtx,
    conn: &AsyncConnection<S>,
    mut ex: Box<Exchange>,
) -> Outcome {
    let c = ex.complete();

    ctx.exchanges.borrow_mut().put(ex);

    match c.output {
        Some(output) => {
            conn.append_pipeline(c.pipeline_index, c.pipeline_count, output);

            if !c.keep_alive {
                conn.set_keep_alive(false);
            }

            Outcome::Continue
        }
        None => {
            conn.set_keep_alive(false);
            conn.clear_pipeline();

            Outcome::Close
        }
    }
}

async fn flush<S: AsyncRead + AsyncWrite>(conn: &AsyncConnection<S>) -> Result<(), ServeError> {
    if conn.has_pipeline_data() {
        conn.flush_pipeline().await?;
    }

    Ok(())
}

async fn serve_connection<S: AsyncRead + AsyncWrite>(
    ctx: &WorkerCtx,
    key: u64,
    conn: &AsyncConnection<S>,
    inbox: &LocalReceiver<Box<Exchange>>,
) -> Result<(), ServeError> {
    let shared = &ctx.shared;

    let mut reader = FrameReader::new(Mode::Request, shared.max_body);
    let mut timeout = Timeout::new(ctx.reactor.now() + shared.read_timeout)?;

    loop {
        timeout.set_deadline(ctx.reactor.now() + shared.read_timeout)?;

        let buf = match select_3(conn.read(), timeout.elapsed(), inbox.recv()).await {
            Select3::R1(ret) => ret?,
            Select3::R2(()) => return Err(ServeError::Idle),
            Select3::R3(Ok(ex)) => {
                // nothing is in flight while reading
                ctx.exchanges.borrow_mut().put(ex);
                continue;
            }
            Select3::R3(Err(_)) => return Err(ServeError::Stopped),
        };

        // every frame completed by this read forms one batch
        let mut frames = Vec::new();
        let mut pos = 0;

        while pos < buf.len() {
            let (size, progress) = reader.read(&buf[pos..])?;
            pos += size;

            if progress == Progress::Complete {
                if let Some(frame) = reader.take_frame() {
                    frames.push(frame);
                }
            }
        }

        drop(buf);

        let batch = frames.len();
        let mut outstanding = 0;

        for (i, frame) in frames.into_iter().enumerate() {
            let (index, count) = if batch > 1 { (i + 1, batch) } else { (0, 0) };

            if frame.header.is_ping() {
                let mut out = [0; HEADER_SIZE];
                Header::ping().encode(&mut out);

                conn.append_pipeline(index, count, out.to_vec());

                continue;
            }

            let mut ex = ctx.exchanges.borrow_mut().take();

            ex.request.prepare(frame, index, count, conn.peer_addr());
            ex.set_conn(key);

            shared.dispatcher.prepare(&mut ex);

            match shared.dispatcher.dispatch(ex, &shared.blocking, &ctx.results) {
                Step::Done(ex) => {
                    if let Outcome::Close = finish_exchange(ctx, conn, ex) {
                        return Err(ServeError::Failed);
                    }
                }
                Step::Submitted => outstanding += 1,
            }
        }

        flush(conn).await?;

        while outstanding > 0 {
            let ex = match inbox.recv().await {
                Ok(ex) => ex,
                Err(_) => return Err(ServeError::Stopped),
            };

            outstanding -= 1;

            if let Outcome::Close = finish_exchange(ctx, conn, ex) {
                return Err(ServeError::Failed);
            }

            flush(conn).await?;
        }

        if !conn.is_keep_alive() {
            return Ok(());
        }
    }
}

/// Accepts connections and serves them with the dispatcher.
pub struct ProtocolServer {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    dispatcher: Arc<Dispatcher>,

    // stopped in this order: listener, I/O workers, blocking pool
    listener: Option<Listener>,
    workers: Vec<IoWorker>,
    blocking: Option<Arc<WorkerPool>>,
}

impl ProtocolServer {
    pub fn start(
        config: &ServerConfig,
        dispatcher: Arc<Dispatcher>,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|_| ServerError::InvalidAddress(config.listen.clone()))?;

        let listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;

        let addr = listener.local_addr()?;

        let tls = match tls {
            Some(tls) => Some(tls),
            None => match config.tls_files() {
                Some((cert, key)) => Some(TlsAcceptor::from_files(&cert, &key)?),
                None => None,
            },
        };

        dispatcher.init();

        let worker_count = config.workers.max(1);

        let conns_max = if config.maxconns > 0 {
            (config.maxconns as usize).min(WORKER_CONNECTIONS_DEFAULT)
        } else {
            WORKER_CONNECTIONS_DEFAULT
        };

        let blocking = Arc::new(WorkerPool::new(
            "sncp-worker",
            config.blocking_threads,
            config.blocking_queue,
        )?);

        let shared = Shared {
            dispatcher: Arc::clone(&dispatcher),
            blocking: Arc::clone(&blocking),
            tls: tls.map(Arc::new),
            buffers: BufferPool::new(config.buffer_size, config.buffer_pool_max),
            read_timeout: config.read_timeout(),
            max_body: config.max_body,
            exchange_pool_max: config.exchange_pool_max,
            conns_max,
        };

        let stats = Arc::new(ServerStats::new(config.maxconns));

        let mut workers = Vec::with_capacity(worker_count);
        let mut senders = Vec::with_capacity(worker_count);

        for i in 0..worker_count {
            let (s, r) = channel::channel(ACCEPT_QUEUE_SIZE);

            workers.push(IoWorker::new(i, shared.clone(), r)?);
            senders.push(s);
        }

        let listener = Listener::new(listener, senders, Arc::clone(&stats))?;

        info!(
            "listening on {}{}",
            addr,
            if shared.tls.is_some() { " (tls)" } else { "" }
        );

        Ok(Self {
            addr,
            stats,
            dispatcher,
            listener: Some(listener),
            workers,
            blocking: Some(blocking),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn counters(&self) -> &ServerStats {
        &self.stats
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            created: self.stats.created(),
            living: self.stats.living(),
            closed: self.stats.closed(),
            refused: self.stats.refused(),
            executed: self.dispatcher.execute_count(),
            illegal_requests: self.dispatcher.illegal_request_count(),
        }
    }
}

impl Drop for ProtocolServer {
    fn drop(&mut self) {
        self.listener = None;
        self.workers.clear();
        self.blocking = None;

        self.dispatcher.destroy();

        info!("server on {} stopped", self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, Frame, DEFAULT_MAX_BODY, RETCODE_ILLEGAL_SERVICE};
    use crate::dispatcher::{HandlerError, ServiceServlet};
    use std::io::{Read, Write};
    use std::net;
    use std::time::Instant;
    use test_log::test;

    const ECHO: u128 = 0xec40;
    const SLOW: u128 = 0x5105;
    const FAIL: u128 = 0xfa11;

    fn dispatcher() -> Arc<Dispatcher> {
        let d = Dispatcher::new();

        d.add_servlet(
            ECHO,
            Arc::new(ServiceServlet::new(true).action(1, |req, resp| {
                resp.finish(req.body())?;

                Ok(())
            })),
        );

        // the first request of a batch takes longest
        d.add_servlet(
            SLOW,
            Arc::new(ServiceServlet::new(false).action(1, |req, resp| {
                let delay = 60u64.saturating_sub(req.seqid() as u64 * 20);
                thread::sleep(Duration::from_millis(delay));

                resp.finish(req.body())?;

                Ok(())
            })),
        );

        d.add_servlet(
            FAIL,
            Arc::new(
                ServiceServlet::new(true)
                    .action(1, |_, _| Err(HandlerError::Failed("boom".to_string()))),
            ),
        );

        Arc::new(d)
    }

    fn config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            workers: 2,
            blocking_threads: 3,
            ..Default::default()
        }
    }

    fn request(seqid: i64, service_id: u128, body: &[u8]) -> Vec<u8> {
        let header = Header {
            seqid,
            service_id,
            action_id: 1,
            body_len: body.len() as i32,
            ..Default::default()
        };

        let mut out = Vec::new();
        encode_frame(&header, body, &mut out).unwrap();

        out
    }

    fn connect(server: &ProtocolServer) -> net::TcpStream {
        let client = net::TcpStream::connect(server.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        client
    }

    fn read_frame(client: &mut net::TcpStream) -> Frame {
        let mut reader = FrameReader::new(Mode::Response, DEFAULT_MAX_BODY);
        let mut buf = [0; 1024];

        loop {
            let size = client.read(&mut buf[..1]).unwrap();
            assert_eq!(size, 1, "unexpected end of stream");

            let (_, progress) = reader.read(&buf[..size]).unwrap();

            if progress == Progress::Complete {
                return reader.take_frame().unwrap();
            }
        }
    }

    fn read_eof(client: &mut net::TcpStream) -> Vec<u8> {
        let mut out = Vec::new();

        // a reset counts as closed too
        let _ = client.read_to_end(&mut out);

        out
    }

    fn wait_for<F: Fn() -> bool>(f: F) {
        let start = Instant::now();

        while !f() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn echo_and_ping() {
        let server = ProtocolServer::start(&config(), dispatcher(), None).unwrap();

        let mut client = connect(&server);

        client.write_all(&request(1, ECHO, b"hello")).unwrap();

        let frame = read_frame(&mut client);
        assert_eq!(frame.header.seqid, 1);
        assert_eq!(frame.header.retcode, 0);
        assert_eq!(frame.body, b"hello");

        client.write_all(&request(0, 0, b"")).unwrap();

        let frame = read_frame(&mut client);
        assert!(frame.header.is_ping());

        // keep-alive
        client.write_all(&request(2, ECHO, b"again")).unwrap();

        let frame = read_frame(&mut client);
        assert_eq!(frame.header.seqid, 2);
        assert_eq!(frame.body, b"again");

        assert_eq!(server.stats().executed, 2);
        assert_eq!(server.stats().created, 1);
    }

    #[test]
    fn pipelined_responses_in_order() {
        let server = ProtocolServer::start(&config(), dispatcher(), None).unwrap();

        let mut client = connect(&server);

        let mut data = Vec::new();
        data.extend(request(1, SLOW, b"one"));
        data.extend(request(2, SLOW, b"two"));
        data.extend(request(0, 0, b""));
        data.extend(request(3, ECHO, b"three"));
        client.write_all(&data).unwrap();

        let mut seqids = Vec::new();

        for _ in 0..4 {
            seqids.push(read_frame(&mut client).header.seqid);
        }

        assert_eq!(seqids, vec![1, 2, 0, 3]);
    }

    #[test]
    fn unknown_service_keeps_connection() {
        let server = ProtocolServer::start(&config(), dispatcher(), None).unwrap();

        let mut client = connect(&server);

        client.write_all(&request(1, 0xdead, b"x")).unwrap();

        let frame = read_frame(&mut client);
        assert_eq!(frame.header.retcode, RETCODE_ILLEGAL_SERVICE);

        client.write_all(&request(2, ECHO, b"y")).unwrap();

        let frame = read_frame(&mut client);
        assert_eq!(frame.body, b"y");

        assert_eq!(server.stats().illegal_requests, 1);
    }

    #[test]
    fn handler_error_closes() {
        let server = ProtocolServer::start(&config(), dispatcher(), None).unwrap();

        let mut client = connect(&server);

        client.write_all(&request(1, FAIL, b"x")).unwrap();

        assert!(read_eof(&mut client).is_empty());

        wait_for(|| server.counters().closed() == 1);
        assert_eq!(server.counters().living(), 0);
    }

    #[test]
    fn bad_frame_closes() {
        let server = ProtocolServer::start(&config(), dispatcher(), None).unwrap();

        let mut client = connect(&server);

        let mut data = request(1, ECHO, b"x");

        // non-zero return code on a request
        data[56..60].copy_from_slice(&1i32.to_be_bytes());

        client.write_all(&data).unwrap();

        assert!(read_eof(&mut client).is_empty());
    }

    #[test]
    fn maxconns() {
        let mut c = config();
        c.maxconns = 1;

        let server = ProtocolServer::start(&c, dispatcher(), None).unwrap();

        let mut first = connect(&server);
        first.write_all(&request(1, ECHO, b"a")).unwrap();
        assert_eq!(read_frame(&mut first).body, b"a");

        let mut second = connect(&server);
        let _ = second.write_all(&request(1, ECHO, b"b"));

        assert!(read_eof(&mut second).is_empty());

        wait_for(|| server.counters().refused() == 1);

        let stats = server.stats();
        assert_eq!(stats.living, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.executed, 1);

        // the first connection still works
        first.write_all(&request(2, ECHO, b"c")).unwrap();
        assert_eq!(read_frame(&mut first).body, b"c");
    }

    #[test]
    fn idle_timeout() {
        let mut c = config();
        c.read_timeout_ms = 50;

        let server = ProtocolServer::start(&c, dispatcher(), None).unwrap();

        let mut client = connect(&server);

        assert!(read_eof(&mut client).is_empty());

        wait_for(|| server.counters().closed() == 1);
    }

    #[test]
    fn stop_with_open_connections() {
        let server = ProtocolServer::start(&config(), dispatcher(), None).unwrap();

        let mut client = connect(&server);
        client.write_all(&request(1, ECHO, b"a")).unwrap();
        assert_eq!(read_frame(&mut client).body, b"a");

        drop(server);

        assert!(read_eof(&mut client).is_empty());
    }

    #[test]
    fn tls_echo() {
        use crate::tls::testutil::self_signed;
        use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

        let (cert, key) = self_signed();
        let acceptor = TlsAcceptor::from_pem(&cert, &key).unwrap();

        let server = ProtocolServer::start(&config(), dispatcher(), Some(acceptor)).unwrap();

        let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
        builder.set_verify(SslVerifyMode::NONE);
        let connector = builder.build();

        let client = connect(&server);
        let mut client = connector.connect("localhost", client).unwrap();

        client.write_all(&request(9, ECHO, b"secret")).unwrap();

        let mut reader = FrameReader::new(Mode::Response, DEFAULT_MAX_BODY);
        let mut buf = [0; 1024];

        let frame = loop {
            let size = client.read(&mut buf).unwrap();
            assert!(size > 0);

            let (_, progress) = reader.read(&buf[..size]).unwrap();

            if progress == Progress::Complete {
                break reader.take_frame().unwrap();
            }
        };

        assert_eq!(frame.header.seqid, 9);
        assert_eq!(frame.body, b"secret");
    }
}
