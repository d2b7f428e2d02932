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

//! Client side of one outbound connection, without any I/O.
//!
//! [`ClientConnection`] turns requests into outbound bytes and incoming
//! bytes into completed [`ClientFuture`]s. The owner moves bytes between it
//! and the socket, feeds it the current time, and calls
//! [`ClientConnection::resume_half_write`] after the outbound bytes of a
//! partially written request have been flushed.

use crate::codec::{encode_frame, Frame, FrameError, FrameReader, Header, Mode, Progress};
use crate::core::counter::{Counter, CounterGuard};
use crate::core::timer::TimerQueue;
use crate::pool::ConnIndex;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("too many requests in flight on the connection")]
    PipelineFull,

    #[error("request has no id")]
    MissingRequestId,

    #[error("request id {0} already in flight")]
    DuplicateRequestId(i64),

    #[error("remote returned code {retcode}")]
    Remote { retcode: i32 },

    #[error("bad frame: {0}")]
    Codec(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Shared count of requests waiting for a response on one connection.
/// Slots are reserved before a request is handed to the I/O thread, so the
/// count is accurate under concurrent submission.
#[derive(Clone)]
pub struct Waiting {
    counter: Arc<Counter>,
}

impl Waiting {
    pub fn new(max: usize) -> Self {
        Self {
            counter: Arc::new(Counter::with_limit(0, max)),
        }
    }

    pub fn count(&self) -> usize {
        self.counter.value()
    }

    pub fn max(&self) -> usize {
        self.counter.limit().unwrap_or(usize::MAX)
    }

    pub fn reserve(&self) -> Result<Reservation, ClientError> {
        match CounterGuard::acquire(&self.counter) {
            Ok(guard) => Ok(Reservation { _guard: guard }),
            Err(_) => Err(ClientError::PipelineFull),
        }
    }
}

/// One pipeline slot, released on drop.
pub struct Reservation {
    _guard: CounterGuard,
}

struct FutureState<P> {
    result: Option<Result<P, ClientError>>,
    done: bool,
    waker: Option<Waker>,
    merge_count: usize,
    reservation: Option<Reservation>,
}

struct FutureShared<P> {
    state: Mutex<FutureState<P>>,
    cond: Condvar,
}

/// Promise for the response to one request. Clones refer to the same
/// promise. Only the first `complete` has any effect, and the result can be
/// taken once, by awaiting or by one of the `wait` methods.
pub struct ClientFuture<P> {
    shared: Arc<FutureShared<P>>,
}

impl<P> Clone for ClientFuture<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P> ClientFuture<P> {
    /// The reservation, if any, is released when the future completes.
    pub fn new(reservation: Option<Reservation>) -> Self {
        Self {
            shared: Arc::new(FutureShared {
                state: Mutex::new(FutureState {
                    result: None,
                    done: false,
                    waker: None,
                    merge_count: 0,
                    reservation,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn complete(&self, result: Result<P, ClientError>) -> bool {
        let (waker, reservation) = {
            let state = &mut *self.shared.state.lock().unwrap();

            if state.done {
                return false;
            }

            state.done = true;
            state.result = Some(result);

            (state.waker.take(), state.reservation.take())
        };

        drop(reservation);

        self.shared.cond.notify_all();

        if let Some(waker) = waker {
            waker.wake();
        }

        true
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().unwrap().done
    }

    /// Requests written together with this one, not counting itself.
    pub fn merge_count(&self) -> usize {
        self.shared.state.lock().unwrap().merge_count
    }

    fn add_merge_count(&self, n: usize) {
        self.shared.state.lock().unwrap().merge_count += n;
    }

    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn wait(self) -> Result<P, ClientError> {
        let mut state = self.shared.state.lock().unwrap();

        while !state.done {
            state = self.shared.cond.wait(state).unwrap();
        }

        state.result.take().unwrap_or(Err(ClientError::Closed))
    }

    /// Waits at most `timeout`. Giving up does not complete the future.
    pub fn wait_timeout(self, timeout: Duration) -> Result<P, ClientError> {
        let deadline = Instant::now() + timeout;

        let mut state = self.shared.state.lock().unwrap();

        while !state.done {
            let now = Instant::now();

            if now >= deadline {
                return Err(ClientError::Timeout);
            }

            state = self.shared.cond.wait_timeout(state, deadline - now).unwrap().0;
        }

        state.result.take().unwrap_or(Err(ClientError::Closed))
    }
}

impl<P> Future for ClientFuture<P> {
    type Output = Result<P, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let state = &mut *self.shared.state.lock().unwrap();

        if state.done {
            return Poll::Ready(state.result.take().unwrap_or(Err(ClientError::Closed)));
        }

        state.waker = Some(cx.waker().clone());

        Poll::Pending
    }
}

pub trait ClientRequest {
    /// Requests with an id are correlated by id, the others by order.
    fn request_id(&self) -> Option<i64> {
        None
    }

    /// Close requests never time out.
    fn is_close_type(&self) -> bool {
        false
    }

    /// Whether the request may be written in one batch with others.
    fn can_merge(&self) -> bool {
        false
    }

    /// Readies the request for writing. Called once, before the request is
    /// registered. An error rejects the request.
    fn prepare(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    /// Appends the next part of the request to `out`.
    fn write_to(&mut self, out: &mut Vec<u8>);

    /// False while part of the request is still unwritten.
    fn is_completed(&self) -> bool {
        true
    }

    fn create_time(&self) -> Instant;

    fn trace_id(&self) -> Option<&str> {
        None
    }
}

pub struct Decoded<P> {
    pub request_id: Option<i64>,
    pub result: Result<P, ClientError>,
}

pub trait ClientCodec {
    type Request: ClientRequest;
    type Response;

    /// Consumes input and returns how much was used, along with a response
    /// if one was completed. An error means the stream is unusable.
    fn decode(
        &mut self,
        src: &[u8],
    ) -> Result<(usize, Option<Decoded<Self::Response>>), ClientError>;
}

/// How a connection pairs responses with requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Correlation {
    /// By the request id echoed in each response.
    #[default]
    Id,

    /// By order. The peer must answer in the order requests were sent.
    Sequential,
}

impl Correlation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Correlation::Id => "id",
            Correlation::Sequential => "sequential",
        }
    }
}

struct Pending<P> {
    future: ClientFuture<P>,
    timer: Option<usize>,
}

/// How responses find their futures. Fixed for the life of a connection.
pub enum Correlator<P> {
    Id(HashMap<i64, Pending<P>>),

    /// Requires the peer to respond in request order.
    Sequential(VecDeque<Pending<P>>),
}

impl<P> Correlator<P> {
    fn len(&self) -> usize {
        match self {
            Correlator::Id(map) => map.len(),
            Correlator::Sequential(queue) => queue.len(),
        }
    }

    fn remove_future(&mut self, future: &ClientFuture<P>) -> Option<Pending<P>> {
        match self {
            Correlator::Id(map) => {
                let id = map
                    .iter()
                    .find(|(_, p)| p.future.same(future))
                    .map(|(id, _)| *id)?;

                map.remove(&id)
            }
            Correlator::Sequential(queue) => {
                let pos = queue.iter().position(|p| p.future.same(future))?;

                queue.remove(pos)
            }
        }
    }

    fn remove_timer(&mut self, timer: usize) -> Option<Pending<P>> {
        match self {
            Correlator::Id(map) => {
                let id = map
                    .iter()
                    .find(|(_, p)| p.timer == Some(timer))
                    .map(|(id, _)| *id)?;

                map.remove(&id)
            }
            Correlator::Sequential(queue) => {
                let pos = queue.iter().position(|p| p.timer == Some(timer))?;

                queue.remove(pos)
            }
        }
    }

    fn drain(&mut self) -> Vec<Pending<P>> {
        match self {
            Correlator::Id(map) => map.drain().map(|(_, p)| p).collect(),
            Correlator::Sequential(queue) => queue.drain(..).collect(),
        }
    }
}

pub enum WriteState<R, P> {
    Idle,

    /// A request could only be partly written. Later requests queue up
    /// behind it until it is resumed.
    Paused {
        half: Option<(R, ClientFuture<P>)>,
        queued: VecDeque<(R, ClientFuture<P>)>,
    },
}

pub struct ClientConnection<C: ClientCodec> {
    index: ConnIndex,
    codec: C,
    correlator: Correlator<C::Response>,
    write_state: WriteState<C::Request, C::Response>,
    outbound: Vec<u8>,
    waiting: Waiting,
    timers: TimerQueue,
    start: Instant,
    done_requests: u64,
    done_responses: u64,
    disposed: bool,
}

impl<C: ClientCodec> ClientConnection<C> {
    pub fn new(index: ConnIndex, codec: C, correlation: Correlation, waiting: Waiting) -> Self {
        let correlator = match correlation {
            Correlation::Id => Correlator::Id(HashMap::new()),
            Correlation::Sequential => Correlator::Sequential(VecDeque::new()),
        };

        let timers_max = waiting.max().clamp(1, 65_536);

        Self {
            index,
            codec,
            correlator,
            write_state: WriteState::Idle,
            outbound: Vec::new(),
            waiting,
            timers: TimerQueue::new(timers_max),
            start: Instant::now(),
            done_requests: 0,
            done_responses: 0,
            disposed: false,
        }
    }

    pub fn index(&self) -> ConnIndex {
        self.index
    }

    pub fn waiting(&self) -> &Waiting {
        &self.waiting
    }

    pub fn reserve(&self) -> Result<Reservation, ClientError> {
        self.waiting.reserve()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn is_write_paused(&self) -> bool {
        matches!(self.write_state, WriteState::Paused { .. })
    }

    /// Futures waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.correlator.len()
    }

    pub fn contains_request_id(&self, id: i64) -> bool {
        match &self.correlator {
            Correlator::Id(map) => map.contains_key(&id),
            Correlator::Sequential(_) => false,
        }
    }

    pub fn done_requests(&self) -> u64 {
        self.done_requests
    }

    pub fn done_responses(&self) -> u64 {
        self.done_responses
    }

    /// Bytes ready to be written to the socket.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        mem::take(&mut self.outbound)
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Registers `future` for the response to `request` and writes the
    /// request, or queues it behind a partly written one. On error the
    /// future is left untouched.
    pub fn send(
        &mut self,
        mut request: C::Request,
        future: ClientFuture<C::Response>,
        deadline: Option<Instant>,
    ) -> Result<(), ClientError> {
        if self.disposed {
            return Err(ClientError::Closed);
        }

        request.prepare()?;

        if let Correlator::Id(map) = &self.correlator {
            match request.request_id() {
                Some(id) if map.contains_key(&id) => {
                    return Err(ClientError::DuplicateRequestId(id))
                }
                Some(_) => {}
                None => return Err(ClientError::MissingRequestId),
            }
        }

        let timer = match deadline {
            Some(deadline) if !request.is_close_type() => {
                let ticks = self.ticks(deadline);

                match self.timers.add(ticks, 0) {
                    Ok(key) => Some(key),
                    Err(_) => return Err(ClientError::PipelineFull),
                }
            }
            _ => None,
        };

        let pending = Pending {
            future: future.clone(),
            timer,
        };

        match &mut self.correlator {
            Correlator::Id(map) => {
                if let Some(id) = request.request_id() {
                    map.insert(id, pending);
                }
            }
            Correlator::Sequential(queue) => queue.push_back(pending),
        }

        match &mut self.write_state {
            WriteState::Paused { queued, .. } => queued.push_back((request, future)),
            WriteState::Idle => self.write_request(request, future),
        }

        Ok(())
    }

    fn write_request(&mut self, mut request: C::Request, future: ClientFuture<C::Response>) {
        request.write_to(&mut self.outbound);

        if request.is_completed() {
            self.done_requests += 1;
        } else {
            self.write_state = WriteState::Paused {
                half: Some((request, future)),
                queued: VecDeque::new(),
            };
        }
    }

    /// Continues after the outbound bytes were flushed. With an error, the
    /// partly written request fails with it and the connection is disposed,
    /// since the peer has seen a torn frame.
    pub fn resume_half_write(&mut self, error: Option<ClientError>) {
        if let Some(e) = error {
            if let WriteState::Paused {
                half: Some((_, future)),
                ..
            } = &self.write_state
            {
                let future = future.clone();

                if let Some(p) = self.correlator.remove_future(&future) {
                    self.cancel_timer(p.timer);
                }

                future.complete(Err(e));
            }

            self.dispose();

            return;
        }

        let (half, mut queued) = match mem::replace(&mut self.write_state, WriteState::Idle) {
            WriteState::Idle => return,
            WriteState::Paused { half, queued } => (half, queued),
        };

        if let Some((request, future)) = half {
            self.write_request(request, future);
        }

        if queued.len() > 1 && !self.is_write_paused() && queued.iter().all(|(r, _)| r.can_merge())
        {
            if let Some((_, first)) = queued.front() {
                first.add_merge_count(queued.len() - 1);
            }
        }

        while !self.is_write_paused() {
            match queued.pop_front() {
                Some((request, future)) => self.write_request(request, future),
                None => break,
            }
        }

        if let WriteState::Paused { queued: q, .. } = &mut self.write_state {
            q.extend(queued);
        }
    }

    /// Feeds bytes read from the socket. Every completed response resolves
    /// its future. Responses with no matching future are dropped.
    pub fn handle_incoming(&mut self, src: &[u8]) -> Result<usize, ClientError> {
        let mut pos = 0;

        while pos < src.len() {
            let (size, decoded) = self.codec.decode(&src[pos..])?;
            pos += size;

            if let Some(decoded) = decoded {
                self.done_responses += 1;
                self.complete_response(decoded);
            } else if size == 0 {
                break;
            }
        }

        Ok(pos)
    }

    fn complete_response(&mut self, decoded: Decoded<C::Response>) {
        let pending = match &mut self.correlator {
            Correlator::Id(map) => match decoded.request_id {
                Some(id) => map.remove(&id),
                None => None,
            },
            Correlator::Sequential(queue) => queue.pop_front(),
        };

        match pending {
            Some(p) => {
                self.cancel_timer(p.timer);
                p.future.complete(decoded.result);
            }
            None => debug!(
                "conn {:?}: dropping response for unknown request {:?}",
                self.index, decoded.request_id
            ),
        }
    }

    /// Fails every future whose deadline is not after `now`.
    pub fn process_timeouts(&mut self, now: Instant) -> usize {
        let ticks = self.ticks(now);
        self.timers.update(ticks);

        let mut count = 0;

        while let Some((key, _)) = self.timers.take_expired() {
            // the request itself may still go out
            if let Some(p) = self.correlator.remove_timer(key) {
                if p.future.complete(Err(ClientError::Timeout)) {
                    count += 1;
                }
            }
        }

        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let ticks = self.timers.timeout()?;

        Some(self.start + Duration::from_millis(self.timers.current() + ticks))
    }

    /// Fails every outstanding future with `Closed`. Further sends fail.
    pub fn dispose(&mut self) {
        self.disposed = true;

        let mut futures: Vec<ClientFuture<C::Response>> = Vec::new();

        for p in self.correlator.drain() {
            self.cancel_timer(p.timer);
            futures.push(p.future);
        }

        if let WriteState::Paused { half, queued } =
            mem::replace(&mut self.write_state, WriteState::Idle)
        {
            futures.extend(half.into_iter().map(|(_, f)| f));
            futures.extend(queued.into_iter().map(|(_, f)| f));
        }

        for f in futures {
            f.complete(Err(ClientError::Closed));
        }

        self.outbound.clear();
    }

    fn cancel_timer(&mut self, timer: Option<usize>) {
        if let Some(key) = timer {
            self.timers.remove(key);
        }
    }

    fn ticks(&self, t: Instant) -> u64 {
        t.saturating_duration_since(self.start).as_millis() as u64
    }
}

/// Request to an SNCP service. Requests with a zero sequence id carry no
/// request id.
pub struct SncpRequest {
    header: Header,
    body: Vec<u8>,
    mergeable: bool,
    chunk_size: Option<usize>,
    encoded: Option<Vec<u8>>,
    written: usize,
    create_time: Instant,
    trace_id: Option<String>,
}

impl SncpRequest {
    pub fn new(service_id: u128, service_version: i32, action_id: u128, body: Vec<u8>) -> Self {
        Self {
            header: Header {
                service_id,
                service_version,
                action_id,
                ..Default::default()
            },
            body,
            mergeable: false,
            chunk_size: None,
            encoded: None,
            written: 0,
            create_time: Instant::now(),
            trace_id: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(0, 0, 0, Vec::new())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn seqid(&self) -> i64 {
        self.header.seqid
    }

    pub fn set_seqid(&mut self, seqid: i64) {
        self.header.seqid = seqid;
    }

    pub fn with_seqid(mut self, seqid: i64) -> Self {
        self.set_seqid(seqid);

        self
    }

    pub fn set_mergeable(&mut self, mergeable: bool) {
        self.mergeable = mergeable;
    }

    /// Writes at most `size` bytes per call to `write_to`, so a large
    /// request goes out in parts.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));

        self
    }

    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = Some(trace_id.to_string());
    }
}

impl ClientRequest for SncpRequest {
    fn request_id(&self) -> Option<i64> {
        if self.header.seqid != 0 {
            Some(self.header.seqid)
        } else {
            None
        }
    }

    fn can_merge(&self) -> bool {
        self.mergeable
    }

    fn prepare(&mut self) -> Result<(), ClientError> {
        if self.encoded.is_none() {
            let mut encoded = Vec::new();
            encode_frame(&self.header, &self.body, &mut encoded)?;

            self.encoded = Some(encoded);
            self.written = 0;
        }

        Ok(())
    }

    fn write_to(&mut self, out: &mut Vec<u8>) {
        // encoded by prepare
        let encoded = match &self.encoded {
            Some(encoded) => encoded,
            None => return,
        };

        let remaining = &encoded[self.written..];

        let size = match self.chunk_size {
            Some(chunk) => chunk.min(remaining.len()),
            None => remaining.len(),
        };

        out.extend_from_slice(&remaining[..size]);
        self.written += size;
    }

    fn is_completed(&self) -> bool {
        match &self.encoded {
            Some(encoded) => self.written == encoded.len(),
            None => false,
        }
    }

    fn create_time(&self) -> Instant {
        self.create_time
    }

    fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }
}

/// Decodes SNCP response frames. A non-zero return code fails the request.
pub struct SncpCodec {
    reader: FrameReader,
}

impl SncpCodec {
    pub fn new(max_body: usize) -> Self {
        Self {
            reader: FrameReader::new(Mode::Response, max_body),
        }
    }
}

impl ClientCodec for SncpCodec {
    type Request = SncpRequest;
    type Response = Frame;

    fn decode(&mut self, src: &[u8]) -> Result<(usize, Option<Decoded<Frame>>), ClientError> {
        let (size, progress) = self.reader.read(src)?;

        if progress != Progress::Complete {
            return Ok((size, None));
        }

        let frame = match self.reader.take_frame() {
            Some(frame) => frame,
            None => return Ok((size, None)),
        };

        let request_id = if frame.header.seqid != 0 {
            Some(frame.header.seqid)
        } else {
            None
        };

        let result = if frame.header.retcode != 0 {
            Err(ClientError::Remote {
                retcode: frame.header.retcode,
            })
        } else {
            Ok(frame)
        };

        Ok((size, Some(Decoded { request_id, result })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DEFAULT_MAX_BODY, HEADER_SIZE, RETCODE_ILLEGAL_ACTION};
    use crate::core::test::poll_once;
    use std::thread;
    use test_log::test;

    const SERVICE: u128 = 0x77;

    fn conn(correlation: Correlation, max: usize) -> ClientConnection<SncpCodec> {
        ClientConnection::new(
            ConnIndex::Slot(0),
            SncpCodec::new(DEFAULT_MAX_BODY),
            correlation,
            Waiting::new(max),
        )
    }

    fn send(
        c: &mut ClientConnection<SncpCodec>,
        req: SncpRequest,
        deadline: Option<Instant>,
    ) -> ClientFuture<Frame> {
        let fut = ClientFuture::new(Some(c.reserve().unwrap()));
        c.send(req, fut.clone(), deadline).unwrap();

        fut
    }

    fn response(seqid: i64, retcode: i32, body: &[u8]) -> Vec<u8> {
        let req = Header {
            seqid,
            service_id: SERVICE,
            action_id: 1,
            ..Default::default()
        };

        let mut out = Vec::new();
        encode_frame(&Header::response_to(&req, retcode), body, &mut out).unwrap();

        out
    }

    fn request(seqid: i64, body: &[u8]) -> SncpRequest {
        SncpRequest::new(SERVICE, 0, 1, body.to_vec()).with_seqid(seqid)
    }

    #[test]
    fn id_correlation() {
        let mut c = conn(Correlation::Id, 8);

        let f7 = send(&mut c, request(7, b"a"), None);
        let f42 = send(&mut c, request(42, b"b"), None);

        assert_eq!(c.take_outbound().len(), (HEADER_SIZE + 1) * 2);
        assert!(c.contains_request_id(42));
        assert_eq!(c.waiting().count(), 2);

        let data = response(42, 0, b"forty-two");
        assert_eq!(c.handle_incoming(&data).unwrap(), data.len());

        assert!(!c.contains_request_id(42));
        assert!(c.contains_request_id(7));
        assert!(!f7.is_done());

        let frame = f42.wait().unwrap();
        assert_eq!(frame.header.seqid, 42);
        assert_eq!(frame.body, b"forty-two");

        assert_eq!(c.pending_count(), 1);
        assert_eq!(c.waiting().count(), 1);
        assert_eq!(c.done_requests(), 2);
        assert_eq!(c.done_responses(), 1);
    }

    #[test]
    fn sequential_correlation() {
        let mut c = conn(Correlation::Sequential, 8);

        let futures: Vec<_> = (0..3)
            .map(|_| send(&mut c, request(0, b"x"), None))
            .collect();

        // matched by position, not by content
        let mut data = Vec::new();
        data.extend(response(100, 0, b"first"));
        data.extend(response(5, 0, b"second"));
        data.extend(response(0, 0, b"third"));

        // arrives in pieces
        for chunk in data.chunks(7) {
            assert_eq!(c.handle_incoming(chunk).unwrap(), chunk.len());
        }

        let bodies: Vec<Vec<u8>> = futures
            .into_iter()
            .map(|f| f.wait().unwrap().body)
            .collect();

        assert_eq!(bodies, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
        assert_eq!(c.pending_count(), 0);
    }

    #[test]
    fn missing_and_duplicate_ids() {
        let mut c = conn(Correlation::Id, 8);

        let f = ClientFuture::new(None);
        assert!(matches!(
            c.send(request(0, b""), f.clone(), None),
            Err(ClientError::MissingRequestId)
        ));

        send(&mut c, request(1, b""), None);

        assert!(matches!(
            c.send(request(1, b""), f.clone(), None),
            Err(ClientError::DuplicateRequestId(1))
        ));

        assert!(!f.is_done());
    }

    #[test]
    fn remote_error() {
        let mut c = conn(Correlation::Id, 8);

        let f = send(&mut c, request(3, b""), None);

        c.handle_incoming(&response(3, RETCODE_ILLEGAL_ACTION, b""))
            .unwrap();

        assert!(matches!(
            f.wait(),
            Err(ClientError::Remote {
                retcode: RETCODE_ILLEGAL_ACTION
            })
        ));
    }

    #[test]
    fn timeout() {
        let mut c = conn(Correlation::Id, 8);

        let now = Instant::now();

        let f1 = send(&mut c, request(1, b""), Some(now + Duration::from_millis(100)));
        let f2 = send(&mut c, request(2, b""), Some(now + Duration::from_millis(500)));
        let f3 = send(&mut c, request(3, b""), None);

        let next = c.next_deadline().unwrap();
        assert!(next >= now + Duration::from_millis(99));
        assert!(next <= now + Duration::from_millis(101));

        assert_eq!(c.process_timeouts(now + Duration::from_millis(50)), 0);
        assert_eq!(c.process_timeouts(now + Duration::from_millis(200)), 1);

        assert!(matches!(f1.clone().wait(), Err(ClientError::Timeout)));
        assert!(!c.contains_request_id(1));
        assert!(!f2.is_done());

        // a late response is dropped
        c.handle_incoming(&response(1, 0, b"late")).unwrap();

        // response wins over the later timeout
        c.handle_incoming(&response(2, 0, b"ok")).unwrap();
        assert_eq!(c.process_timeouts(now + Duration::from_secs(1)), 0);
        assert_eq!(f2.wait().unwrap().body, b"ok");

        assert!(!f1.complete(Ok(Frame {
            header: Header::default(),
            body: Vec::new(),
        })));

        assert!(c.next_deadline().is_none());
        assert!(!f3.is_done());
    }

    #[test]
    fn dispose() {
        let mut c = conn(Correlation::Sequential, 8);

        let f1 = send(&mut c, request(0, b"aaaa"), None);
        let f2 = send(&mut c, request(0, b"bbbb").with_chunk_size(10), None);
        let f3 = send(&mut c, request(0, b"cccc"), None);

        assert!(c.is_write_paused());

        c.dispose();

        for f in [f1, f2, f3] {
            assert!(matches!(f.wait(), Err(ClientError::Closed)));
        }

        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.waiting().count(), 0);
        assert!(!c.has_outbound());

        let f = ClientFuture::new(None);
        assert!(matches!(
            c.send(request(0, b""), f, None),
            Err(ClientError::Closed)
        ));
    }

    #[test]
    fn half_write() {
        let mut c = conn(Correlation::Id, 8);

        let big = request(1, &[b'x'; 100]).with_chunk_size(64);
        let small = request(2, b"small");

        let mut expected = Vec::new();
        encode_frame(big.header(), &[b'x'; 100], &mut expected).unwrap();
        encode_frame(small.header(), b"small", &mut expected).unwrap();

        send(&mut c, big, None);
        assert!(c.is_write_paused());

        // queued behind the partly written request
        send(&mut c, small, None);
        assert_eq!(c.done_requests(), 0);

        let mut written = Vec::new();

        while c.has_outbound() {
            let out = c.take_outbound();
            assert!(out.len() <= 64 + HEADER_SIZE + 5);
            written.extend(out);

            c.resume_half_write(None);
        }

        assert!(!c.is_write_paused());
        assert_eq!(written, expected);
        assert_eq!(c.done_requests(), 2);
        assert_eq!(c.pending_count(), 2);
    }

    #[test]
    fn half_write_error() {
        let mut c = conn(Correlation::Id, 8);

        let f1 = send(&mut c, request(1, &[0; 100]).with_chunk_size(10), None);
        let f2 = send(&mut c, request(2, b"next"), None);

        c.take_outbound();
        c.resume_half_write(Some(ClientError::Io(io::ErrorKind::BrokenPipe.into())));

        assert!(matches!(f1.wait(), Err(ClientError::Io(_))));

        // nothing more may follow a torn frame
        assert!(c.is_disposed());
        assert!(!c.is_write_paused());
        assert!(matches!(f2.wait(), Err(ClientError::Closed)));
        assert_eq!(c.pending_count(), 0);
        assert!(!c.has_outbound());

        let f3 = ClientFuture::new(None);
        assert!(matches!(
            c.send(request(3, b"late"), f3, None),
            Err(ClientError::Closed)
        ));
    }

    #[test]
    fn merge_queued() {
        let mut c = conn(Correlation::Id, 8);

        send(&mut c, request(1, &[0; 100]).with_chunk_size(200), None);

        let f_half = send(&mut c, request(2, &[0; 100]).with_chunk_size(50), None);
        assert!(c.is_write_paused());

        let mut queued = Vec::new();

        for id in 3..6 {
            let mut r = request(id, b"m");
            r.set_mergeable(true);
            queued.push(send(&mut c, r, None));
        }

        c.take_outbound();

        // finish the partly written request, then the queue goes out at once
        while c.is_write_paused() {
            c.resume_half_write(None);
        }

        assert_eq!(f_half.merge_count(), 0);
        assert_eq!(queued[0].merge_count(), 2);
        assert_eq!(queued[1].merge_count(), 0);
        assert_eq!(c.done_requests(), 5);
    }

    #[test]
    fn pipeline_limit() {
        let mut c = conn(Correlation::Id, 2);

        let f1 = send(&mut c, request(1, b""), None);
        let _f2 = send(&mut c, request(2, b""), None);

        assert!(matches!(c.reserve(), Err(ClientError::PipelineFull)));

        c.handle_incoming(&response(1, 0, b"")).unwrap();
        assert!(f1.is_done());

        assert!(c.reserve().is_ok());
    }

    #[test]
    fn future_completes_once() {
        let f: ClientFuture<u32> = ClientFuture::new(None);

        {
            let f = f.clone();

            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                assert!(f.complete(Ok(1)));
                assert!(!f.complete(Ok(2)));
            });
        }

        assert_eq!(f.clone().wait().unwrap(), 1);

        // the result was taken
        assert!(matches!(f.wait(), Err(ClientError::Closed)));
    }

    #[test]
    fn future_poll_and_wait_timeout() {
        let mut f: ClientFuture<u32> = ClientFuture::new(None);

        assert!(poll_once(&mut f).is_pending());
        assert!(matches!(
            f.clone().wait_timeout(Duration::from_millis(10)),
            Err(ClientError::Timeout)
        ));
        assert!(!f.is_done());

        f.complete(Ok(5));

        match poll_once(&mut f) {
            Poll::Ready(Ok(v)) => assert_eq!(v, 5),
            _ => panic!("expected ready"),
        }
    }
}
