/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2023-2024 Fastly, Inc.
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

use crate::clientconn::{
    ClientConnection, ClientError, ClientFuture, Correlation, SncpCodec, SncpRequest,
};
use crate::codec::Frame;
use crate::config::ClientConfig;
use crate::connection::{AsyncConnection, ConnectionError};
use crate::core::buffer::BufferPool;
use crate::core::channel::{self, local_channel, AsyncReceiver, LocalReceiver, LocalSender};
use crate::core::executor::{Executor, Spawner};
use crate::core::net::AsyncTcpStream;
use crate::core::reactor::{Reactor, Timeout};
use crate::core::select::{select_2, select_4, select_option, Select2, Select4};
use crate::pool::{Checkout, ConnectionPool, EntryKey, Vacancy};
use log::{debug, error};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

const COMMANDS_QUEUE_SIZE: usize = 1024;

// connections outside the slots, by address or by thread
const EXTRA_CONNECTIONS_MAX: usize = 256;

// the main task plus slack
const NON_CONNECTION_TASKS_MAX: usize = 4;

// stream, timer, connect timer
const REGISTRATIONS_PER_TASK_MAX: usize = 3;

const BUFFER_POOL_MAX: usize = 64;

// wakeup interval for a connection with no request deadlines
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

// how much longer a caller waits than the connect itself may take
const CONNECT_GRACE: Duration = Duration::from_secs(1);

struct Outgoing {
    request: SncpRequest,
    future: ClientFuture<Frame>,
    deadline: Option<Instant>,
}

enum Command {
    Connect {
        id: u64,
        addr: SocketAddr,
        vacancy: Vacancy<u64>,
        done: ClientFuture<()>,
    },
    Send {
        id: u64,
        msg: Outgoing,
    },
    Close {
        id: u64,
    },
}

thread_local! {
    // connections owned by this thread, released when it exits
    static LOCAL_CONNS: RefCell<Vec<LocalConn>> = RefCell::new(Vec::new());
}

/// A thread's own connection. Dropping it takes the connection out of the
/// pool and closes it.
struct LocalConn {
    id: u64,
    key: EntryKey,
    pool: ConnectionPool<u64>,
    commands: Weak<channel::Sender<Command>>,
}

impl LocalConn {
    fn bind(self) {
        let ret = LOCAL_CONNS.try_with(|conns| {
            let conns = &mut *conns.borrow_mut();

            // one per client, and none for clients that are gone
            conns.retain(|c| {
                c.commands.strong_count() > 0 && !Weak::ptr_eq(&c.commands, &self.commands)
            });

            conns.push(self);
        });

        if ret.is_err() {
            debug!("client: thread exiting, local connection not bound");
        }
    }
}

impl Drop for LocalConn {
    fn drop(&mut self) {
        let id = self.id;

        if !self.pool.remove(&self.key, |c| *c == id) {
            return;
        }

        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Close { id });
        }
    }
}

#[derive(Clone, Copy)]
enum Target {
    Slot,
    Address(SocketAddr),
    Local,
}

#[derive(Clone)]
struct Shared {
    pool: ConnectionPool<u64>,
    connect_timeout: Duration,
    max_body: usize,
    buffer_size: usize,
    inbox_size: usize,
    correlation: Correlation,
}

struct IoCtx {
    shared: Shared,
    buffers: BufferPool,
    routes: RefCell<HashMap<u64, LocalSender<Outgoing>>>,
}

impl IoCtx {
    fn route(&self, id: u64, msg: Outgoing) {
        let ret = match self.routes.borrow().get(&id) {
            Some(sender) => sender.try_send(msg).map_err(|e| match e {
                mpsc::TrySendError::Full(msg) => (msg, ClientError::PipelineFull),
                mpsc::TrySendError::Disconnected(msg) => (msg, ClientError::Closed),
            }),
            None => Err((msg, ClientError::Closed)),
        };

        if let Err((msg, e)) = ret {
            msg.future.complete(Err(e));
        }
    }
}

fn conn_error(e: ConnectionError) -> ClientError {
    match e {
        ConnectionError::Io(e) => ClientError::Io(e),
        _ => ClientError::Closed,
    }
}

async fn connect(addr: SocketAddr, timeout: Duration) -> Result<AsyncTcpStream, ClientError> {
    let timeout = Timeout::new(Instant::now() + timeout)?;

    match select_2(pin!(AsyncTcpStream::connect(addr)), timeout.elapsed()).await {
        Select2::R1(ret) => Ok(ret?),
        Select2::R2(_) => Err(ClientError::ConnectTimeout),
    }
}

async fn drive(
    conn: &AsyncConnection<AsyncTcpStream>,
    cc: &mut ClientConnection<SncpCodec>,
    inbox: &LocalReceiver<Outgoing>,
) -> Result<(), ClientError> {
    let out = RefCell::new(Vec::new());

    let mut timer = Timeout::new(Instant::now() + IDLE_WAKEUP)?;

    loop {
        if cc.has_outbound() {
            let mut pending = cc.take_outbound();
            out.borrow_mut().append(&mut pending);
        }

        let deadline = cc
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

        timer.set_deadline(deadline)?;

        let write = if out.borrow().is_empty() {
            None
        } else {
            Some(conn.write_shared(&out))
        };

        match select_4(
            conn.read(),
            inbox.recv(),
            select_option(write),
            timer.elapsed(),
        )
        .await
        {
            Select4::R1(Ok(buf)) => {
                cc.handle_incoming(&buf)?;
            }
            Select4::R1(Err(e)) => return Err(conn_error(e)),
            Select4::R2(Ok(msg)) => {
                if let Err(e) = cc.send(msg.request, msg.future.clone(), msg.deadline) {
                    msg.future.complete(Err(e));
                }
            }
            // client stopped
            Select4::R2(Err(_)) => return Ok(()),
            Select4::R3(Ok(_)) => {
                if cc.is_write_paused() {
                    cc.resume_half_write(None);
                }
            }
            Select4::R3(Err(e)) => return Err(conn_error(e)),
            Select4::R4(_) => {
                let count = cc.process_timeouts(Instant::now());

                if count > 0 {
                    debug!("client conn {:?}: {} requests timed out", cc.index(), count);
                }
            }
        }
    }
}

async fn connection_task(
    ctx: Rc<IoCtx>,
    id: u64,
    addr: SocketAddr,
    vacancy: Vacancy<u64>,
    done: ClientFuture<()>,
    inbox: LocalReceiver<Outgoing>,
) {
    let key = vacancy.key();
    let index = vacancy.index();
    let waiting = vacancy.waiting().clone();

    match connect(addr, ctx.shared.connect_timeout).await {
        Ok(stream) => {
            vacancy.fill(id);
            done.complete(Ok(()));

            debug!("client conn {}: connected to {} at {}", id, addr, index.to_legacy());

            let conn = AsyncConnection::new(
                stream,
                &format!("client-{}", id),
                Some(addr),
                ctx.buffers.clone(),
            );

            let mut cc = ClientConnection::new(
                index,
                SncpCodec::new(ctx.shared.max_body),
                ctx.shared.correlation,
                waiting,
            );

            if let Err(e) = drive(&conn, &mut cc, &inbox).await {
                debug!("client conn {}: {}", id, e);
            }

            cc.dispose();

            ctx.shared.pool.remove(&key, |c| *c == id);

            debug!(
                "client conn {}: closed after {} requests, {} responses",
                id,
                cc.done_requests(),
                cc.done_responses()
            );
        }
        Err(e) => {
            debug!("client conn {}: connect to {} failed: {}", id, addr, e);

            drop(vacancy);
            done.complete(Err(e));
        }
    }

    ctx.routes.borrow_mut().remove(&id);

    // nothing new can arrive once the route is gone
    while let Ok(msg) = inbox.try_recv() {
        msg.future.complete(Err(ClientError::Closed));
    }
}

async fn run(commands: channel::Receiver<Command>, shared: Shared, spawner: Spawner) {
    let commands = match AsyncReceiver::new(commands) {
        Ok(commands) => commands,
        Err(e) => {
            error!("client: failed to register channel: {}", e);
            return;
        }
    };

    let ctx = Rc::new(IoCtx {
        buffers: BufferPool::new(shared.buffer_size, BUFFER_POOL_MAX),
        shared,
        routes: RefCell::new(HashMap::new()),
    });

    loop {
        match commands.recv().await {
            Ok(Command::Connect {
                id,
                addr,
                vacancy,
                done,
            }) => {
                let (sender, inbox) = local_channel(ctx.shared.inbox_size);

                ctx.routes.borrow_mut().insert(id, sender);

                let fut = connection_task(Rc::clone(&ctx), id, addr, vacancy, done.clone(), inbox);

                if spawner.spawn(fut).is_err() {
                    error!("client: no room for connection to {}", addr);

                    ctx.routes.borrow_mut().remove(&id);
                    done.complete(Err(ClientError::Closed));
                }
            }
            Ok(Command::Send { id, msg }) => ctx.route(id, msg),
            Ok(Command::Close { id }) => {
                // the task sees its inbox disconnect and finishes
                ctx.routes.borrow_mut().remove(&id);
            }
            Err(_) => break,
        }
    }

    // connection tasks see their inbox disconnect and finish
    ctx.routes.borrow_mut().clear();

    debug!("client: task stopped: main");
}

/// Sends SNCP requests from any thread. Connections are pooled and driven
/// by one I/O thread owned by the client. With [`Correlation::Id`] requests
/// are correlated by sequence id, which is assigned when a request has
/// none. With [`Correlation::Sequential`] requests are sent as given and
/// responses are paired by order.
pub struct Client {
    addr: SocketAddr,
    config: ClientConfig,
    pool: ConnectionPool<u64>,
    commands: Option<Arc<channel::Sender<Command>>>,
    thread: Option<thread::JoinHandle<()>>,
    next_seqid: AtomicI64,
    next_conn: AtomicU64,
}

impl Client {
    pub fn new(addr: SocketAddr, config: &ClientConfig) -> Result<Self, ClientError> {
        let pool = ConnectionPool::new(config.max_conns, config.max_pipeline.max(1));

        let shared = Shared {
            pool: pool.clone(),
            connect_timeout: config.connect_timeout(),
            max_body: config.max_body,
            buffer_size: config.buffer_size,
            inbox_size: config.max_pipeline.max(1),
            correlation: config.correlation,
        };

        let (commands, r_commands) = channel::channel(COMMANDS_QUEUE_SIZE);

        let tasks_max = config.max_conns + EXTRA_CONNECTIONS_MAX + NON_CONNECTION_TASKS_MAX;
        let registrations_max = REGISTRATIONS_PER_TASK_MAX * tasks_max;

        let thread = thread::Builder::new()
            .name("sncp-client".to_string())
            .spawn(move || {
                let reactor = match Reactor::new(registrations_max) {
                    Ok(reactor) => reactor,
                    Err(e) => {
                        error!("client: failed to create reactor: {}", e);
                        return;
                    }
                };

                let executor = Executor::new(tasks_max);

                if executor
                    .spawn(run(r_commands, shared, executor.spawner()))
                    .is_err()
                {
                    error!("client: failed to spawn task");
                    return;
                }

                if let Err(e) = executor.run(|timeout| reactor.poll(timeout)) {
                    error!("client: {}", e);
                }

                debug!("client: stopped");
            })?;

        Ok(Self {
            addr,
            config: config.clone(),
            pool,
            commands: Some(Arc::new(commands)),
            thread: Some(thread),
            next_seqid: AtomicI64::new(1),
            next_conn: AtomicU64::new(0),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn open_connections(&self) -> usize {
        self.pool.open_count()
    }

    /// Requests sent and not yet resolved.
    pub fn waiting(&self) -> usize {
        self.pool.waiting_total()
    }

    /// Sends on one of the pooled slot connections.
    pub fn send(&self, request: SncpRequest) -> Result<ClientFuture<Frame>, ClientError> {
        self.dispatch(Target::Slot, request)
    }

    /// Sends on the shared connection to `addr`.
    pub fn send_to(
        &self,
        addr: SocketAddr,
        request: SncpRequest,
    ) -> Result<ClientFuture<Frame>, ClientError> {
        self.dispatch(Target::Address(addr), request)
    }

    /// Sends on the calling thread's own connection. The connection is
    /// closed when the thread exits.
    pub fn send_local(&self, request: SncpRequest) -> Result<ClientFuture<Frame>, ClientError> {
        self.dispatch(Target::Local, request)
    }

    /// Sends a request and blocks until its response body arrives.
    pub fn call(
        &self,
        service_id: u128,
        action_id: u128,
        body: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let request = SncpRequest::new(service_id, 0, action_id, body.to_vec());

        Ok(self.send(request)?.wait()?.body)
    }

    fn seqid(&self) -> i64 {
        loop {
            let seqid = self.next_seqid.fetch_add(1, Ordering::Relaxed);

            if seqid != 0 {
                return seqid;
            }
        }
    }

    fn dispatch(
        &self,
        target: Target,
        mut request: SncpRequest,
    ) -> Result<ClientFuture<Frame>, ClientError> {
        let commands = self.commands.as_ref().ok_or(ClientError::Closed)?;

        if self.config.correlation == Correlation::Id && request.seqid() == 0 {
            request.set_seqid(self.seqid());
        }

        let connect_timeout = self.config.connect_timeout();
        let deadline = Instant::now() + connect_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            let checkout = match target {
                Target::Slot => self.pool.checkout_slot(remaining)?,
                Target::Address(addr) => self.pool.checkout_addr(addr, remaining)?,
                Target::Local => self.pool.checkout_local(remaining)?,
            };

            match checkout {
                Checkout::Existing {
                    conn, reservation, ..
                } => {
                    let future = ClientFuture::new(Some(reservation));

                    let msg = Outgoing {
                        request,
                        future: future.clone(),
                        deadline: self.config.request_timeout().map(|t| Instant::now() + t),
                    };

                    if commands.send(Command::Send { id: conn, msg }).is_err() {
                        future.complete(Err(ClientError::Closed));
                    }

                    return Ok(future);
                }
                Checkout::Vacant(vacancy) => {
                    let id = self.next_conn.fetch_add(1, Ordering::Relaxed);

                    let addr = match target {
                        Target::Address(addr) => addr,
                        _ => self.addr,
                    };

                    let key = vacancy.key();
                    let done = ClientFuture::new(None);

                    let cmd = Command::Connect {
                        id,
                        addr,
                        vacancy,
                        done: done.clone(),
                    };

                    if commands.send(cmd).is_err() {
                        return Err(ClientError::Closed);
                    }

                    // the new connection is picked up on the next checkout
                    match done.wait_timeout(connect_timeout + CONNECT_GRACE) {
                        Ok(()) => {}
                        Err(ClientError::Timeout) => return Err(ClientError::ConnectTimeout),
                        Err(e) => return Err(e),
                    }

                    if let Target::Local = target {
                        LocalConn {
                            id,
                            key,
                            pool: self.pool.clone(),
                            commands: Arc::downgrade(commands),
                        }
                        .bind();
                    }
                }
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.commands = None;

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
