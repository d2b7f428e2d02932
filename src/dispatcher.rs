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

//! Request dispatch.
//!
//! Each decoded request walks the filter chain (highest priority first) and
//! then the servlet registered for its service id. Steps that are declared
//! non-blocking run inline on the I/O thread. At the first blocking step the
//! whole [`Exchange`] moves to the worker pool, which runs the remaining
//! steps in order and sends the exchange back to the I/O thread.

use crate::codec::{
    encode_frame, Frame, FrameError, Header, RETCODE_ILLEGAL_ACTION, RETCODE_ILLEGAL_SERVICE,
    RETCODE_ILLEGAL_VERSION,
};
use crate::core::channel::Sender;
use crate::core::workers::WorkerPool;
use log::{debug, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response already finished")]
    AlreadyFinished,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler returned without finishing the response")]
    Unfinished,

    #[error("worker pool rejected the exchange")]
    Rejected,

    #[error(transparent)]
    Response(#[from] ResponseError),
}

pub type ErrorHandler = Box<dyn FnOnce(&Request, &mut Response, &HandlerError) + Send>;
pub type RecycleListener = Box<dyn FnOnce(&Request, &Response) + Send>;
pub type AfterFinishListener = Box<dyn FnOnce() + Send>;

type SharedErrorHandler = Arc<dyn Fn(&Request, &mut Response, &HandlerError) + Send + Sync>;

pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// Filters with a higher priority run first.
    fn priority(&self) -> i32 {
        0
    }

    fn non_blocking(&self) -> bool {
        false
    }

    fn init(&self) {}

    fn destroy(&self) {}

    /// Finishing the response ends the walk. Otherwise the next step runs.
    fn do_filter(&self, req: &mut Request, resp: &mut Response) -> Result<(), HandlerError>;
}

pub trait Servlet: Send + Sync {
    fn non_blocking(&self) -> bool {
        false
    }

    fn init(&self) {}

    fn destroy(&self) {}

    /// Must finish the response before returning `Ok`.
    fn execute(&self, req: &Request, resp: &mut Response) -> Result<(), HandlerError>;
}

pub struct Request {
    header: Header,
    body: Vec<u8>,
    pipeline_index: usize,
    pipeline_count: usize,
    peer: Option<SocketAddr>,
    create_time: Instant,
}

impl Request {
    pub fn new() -> Self {
        Self {
            header: Header::default(),
            body: Vec::new(),
            pipeline_index: 0,
            pipeline_count: 0,
            peer: None,
            create_time: Instant::now(),
        }
    }

    /// Loads a decoded frame. `pipeline_index` is 1-based within a batch of
    /// `pipeline_count` requests decoded from one read, or 0 when the
    /// request arrived alone.
    pub fn prepare(
        &mut self,
        frame: Frame,
        pipeline_index: usize,
        pipeline_count: usize,
        peer: Option<SocketAddr>,
    ) {
        self.header = frame.header;
        self.body = frame.body;
        self.pipeline_index = pipeline_index;
        self.pipeline_count = pipeline_count;
        self.peer = peer;
        self.create_time = Instant::now();
    }

    pub fn recycle(&mut self) {
        self.header = Header::default();
        self.body.clear();
        self.pipeline_index = 0;
        self.pipeline_count = 0;
        self.peer = None;
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn seqid(&self) -> i64 {
        self.header.seqid
    }

    pub fn service_id(&self) -> u128 {
        self.header.service_id
    }

    pub fn service_version(&self) -> i32 {
        self.header.service_version
    }

    pub fn action_id(&self) -> u128 {
        self.header.action_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn pipeline_index(&self) -> usize {
        self.pipeline_index
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipeline_count
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn create_time(&self) -> Instant {
        self.create_time
    }

    pub fn is_ping(&self) -> bool {
        self.header.is_ping()
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Response {
    req_header: Header,
    output: Option<Vec<u8>>,
    finished: bool,
    keep_alive: bool,
    error: Option<HandlerError>,
    error_handler: Option<ErrorHandler>,
    recycle_listener: Option<RecycleListener>,
    after_finish: Vec<AfterFinishListener>,
}

impl Response {
    pub fn new() -> Self {
        Self {
            req_header: Header::default(),
            output: None,
            finished: false,
            keep_alive: true,
            error: None,
            error_handler: None,
            recycle_listener: None,
            after_finish: Vec::new(),
        }
    }

    fn prepare(&mut self, req: &Request) {
        self.req_header = req.header;
        self.keep_alive = true;
    }

    pub fn recycle(&mut self) {
        self.req_header = Header::default();
        self.output = None;
        self.finished = false;
        self.keep_alive = true;
        self.error = None;
        self.error_handler = None;
        self.recycle_listener = None;
        self.after_finish.clear();
    }

    pub fn finish(&mut self, body: &[u8]) -> Result<(), ResponseError> {
        self.finish_code(0, body)
    }

    /// Completes the response with a return code. Only the first call has
    /// any effect.
    pub fn finish_code(&mut self, retcode: i32, body: &[u8]) -> Result<(), ResponseError> {
        if self.finished {
            return Err(ResponseError::AlreadyFinished);
        }

        let mut out = Vec::new();
        encode_frame(&Header::response_to(&self.req_header, retcode), body, &mut out)?;

        self.output = Some(out);
        self.finished = true;

        Ok(())
    }

    /// Error completion. A registered error handler gets the chance to
    /// finish the response. Otherwise nothing is sent and the connection
    /// will be closed.
    pub fn finish_error(&mut self, req: &Request, e: HandlerError) {
        if self.finished {
            return;
        }

        if let Some(handler) = self.error_handler.take() {
            handler(req, self, &e);

            if self.finished {
                return;
            }
        }

        self.output = None;
        self.keep_alive = false;
        self.error = Some(e);
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    pub fn error(&self) -> Option<&HandlerError> {
        self.error.as_ref()
    }

    pub fn output(&self) -> Option<&[u8]> {
        self.output.as_deref()
    }

    pub fn set_error_handler<F>(&mut self, f: F)
    where
        F: FnOnce(&Request, &mut Response, &HandlerError) + Send + 'static,
    {
        self.error_handler = Some(Box::new(f));
    }

    pub fn set_recycle_listener<F>(&mut self, f: F)
    where
        F: FnOnce(&Request, &Response) + Send + 'static,
    {
        self.recycle_listener = Some(Box::new(f));
    }

    pub fn add_after_finish_listener<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.after_finish.push(Box::new(f));
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

/// What a finished exchange leaves for the connection.
#[derive(Debug)]
pub struct Completion {
    pub output: Option<Vec<u8>>,
    pub keep_alive: bool,
    pub pipeline_index: usize,
    pub pipeline_count: usize,
}

/// A request/response pair plus the position of its walk through the
/// chain. Exactly one thread owns an exchange at a time.
pub struct Exchange {
    pub request: Request,
    pub response: Response,
    chain: Arc<[Arc<dyn Filter>]>,
    servlet: Option<Arc<dyn Servlet>>,
    step: usize,
    conn: u64,
}

impl Exchange {
    fn new() -> Self {
        Self {
            request: Request::new(),
            response: Response::new(),
            chain: Arc::from(Vec::new()),
            servlet: None,
            step: 0,
            conn: 0,
        }
    }

    /// Connection this exchange belongs to.
    pub fn conn(&self) -> u64 {
        self.conn
    }

    pub fn set_conn(&mut self, conn: u64) {
        self.conn = conn;
    }

    /// Runs the completion listeners and hands back what is to be written.
    /// Called on the I/O thread once the response is finished.
    pub fn complete(&mut self) -> Completion {
        for f in self.response.after_finish.drain(..) {
            f();
        }

        if let Some(f) = self.response.recycle_listener.take() {
            f(&self.request, &self.response);
        }

        Completion {
            output: self.response.output.take(),
            keep_alive: self.response.keep_alive,
            pipeline_index: self.request.pipeline_index,
            pipeline_count: self.request.pipeline_count,
        }
    }

    fn recycle(&mut self) {
        self.request.recycle();
        self.response.recycle();
        self.chain = Arc::from(Vec::new());
        self.servlet = None;
        self.step = 0;
        self.conn = 0;
    }
}

/// Exchanges kept for reuse by one I/O thread.
pub struct ExchangePool {
    free: Vec<Box<Exchange>>,
    max: usize,
    created: usize,
}

impl ExchangePool {
    pub fn new(max: usize) -> Self {
        Self {
            free: Vec::with_capacity(max),
            max,
            created: 0,
        }
    }

    pub fn take(&mut self) -> Box<Exchange> {
        match self.free.pop() {
            Some(ex) => ex,
            None => {
                self.created += 1;

                Box::new(Exchange::new())
            }
        }
    }

    pub fn put(&mut self, mut ex: Box<Exchange>) {
        if self.free.len() < self.max {
            ex.recycle();
            self.free.push(ex);
        }
    }

    pub fn created(&self) -> usize {
        self.created
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

pub enum Step {
    /// The response is finished and the exchange is back with the caller.
    Done(Box<Exchange>),

    /// The exchange moved to the worker pool and will arrive on the
    /// results channel.
    Submitted,
}

type Action = Box<dyn Fn(&Request, &mut Response) -> Result<(), HandlerError> + Send + Sync>;

/// Servlet routing by action id to closures.
pub struct ServiceServlet {
    version: Option<i32>,
    non_blocking: bool,
    actions: HashMap<u128, Action>,
}

impl ServiceServlet {
    pub fn new(non_blocking: bool) -> Self {
        Self {
            version: None,
            non_blocking,
            actions: HashMap::new(),
        }
    }

    /// Requests for any other service version are refused.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = Some(version);

        self
    }

    pub fn action<F>(mut self, action_id: u128, f: F) -> Self
    where
        F: Fn(&Request, &mut Response) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.actions.insert(action_id, Box::new(f));

        self
    }
}

impl Servlet for ServiceServlet {
    fn non_blocking(&self) -> bool {
        self.non_blocking
    }

    fn execute(&self, req: &Request, resp: &mut Response) -> Result<(), HandlerError> {
        if let Some(version) = self.version {
            if req.service_version() != version {
                resp.finish_code(RETCODE_ILLEGAL_VERSION, &[])?;

                return Ok(());
            }
        }

        match self.actions.get(&req.action_id()) {
            Some(f) => f(req, resp),
            None => {
                resp.finish_code(RETCODE_ILLEGAL_ACTION, &[])?;

                Ok(())
            }
        }
    }
}

fn sorted_chain(filters: &[Arc<dyn Filter>]) -> Arc<[Arc<dyn Filter>]> {
    let mut v: Vec<Arc<dyn Filter>> = filters.to_vec();

    // stable, so equal priorities keep registration order
    v.sort_by(|a, b| b.priority().cmp(&a.priority()));

    Arc::from(v)
}

pub struct Dispatcher {
    filters: Mutex<Vec<Arc<dyn Filter>>>,
    chain: RwLock<Arc<[Arc<dyn Filter>]>>,
    servlets: RwLock<HashMap<u128, Arc<dyn Servlet>>>,
    error_handler: RwLock<Option<SharedErrorHandler>>,
    inited: AtomicBool,
    execute_count: AtomicU64,
    illegal_request_count: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            filters: Mutex::new(Vec::new()),
            chain: RwLock::new(Arc::from(Vec::new())),
            servlets: RwLock::new(HashMap::new()),
            error_handler: RwLock::new(None),
            inited: AtomicBool::new(false),
            execute_count: AtomicU64::new(0),
            illegal_request_count: AtomicU64::new(0),
        }
    }

    pub fn add_filter(&self, filter: Arc<dyn Filter>) {
        let mut filters = self.filters.lock().unwrap();

        if self.inited.load(Ordering::Acquire) {
            filter.init();
        }

        filters.push(filter);

        *self.chain.write().unwrap() = sorted_chain(&filters);
    }

    pub fn remove_filter(&self, name: &str) -> Option<Arc<dyn Filter>> {
        let mut filters = self.filters.lock().unwrap();

        let pos = filters.iter().position(|f| f.name() == name)?;
        let filter = filters.remove(pos);

        *self.chain.write().unwrap() = sorted_chain(&filters);

        if self.inited.load(Ordering::Acquire) {
            filter.destroy();
        }

        Some(filter)
    }

    pub fn contains_filter(&self, name: &str) -> bool {
        self.chain.read().unwrap().iter().any(|f| f.name() == name)
    }

    /// Filter names in the order they run.
    pub fn filter_names(&self) -> Vec<String> {
        self.chain
            .read()
            .unwrap()
            .iter()
            .map(|f| f.name().to_string())
            .collect()
    }

    pub fn add_servlet(&self, service_id: u128, servlet: Arc<dyn Servlet>) {
        if self.inited.load(Ordering::Acquire) {
            servlet.init();
        }

        let prev = self
            .servlets
            .write()
            .unwrap()
            .insert(service_id, servlet);

        if let Some(prev) = prev {
            if self.inited.load(Ordering::Acquire) {
                prev.destroy();
            }
        }
    }

    pub fn remove_servlet(&self, service_id: u128) -> Option<Arc<dyn Servlet>> {
        let servlet = self.servlets.write().unwrap().remove(&service_id)?;

        if self.inited.load(Ordering::Acquire) {
            servlet.destroy();
        }

        Some(servlet)
    }

    pub fn contains_servlet(&self, service_id: u128) -> bool {
        self.servlets.read().unwrap().contains_key(&service_id)
    }

    /// Default error handler installed on every response.
    pub fn set_error_handler<F>(&self, f: F)
    where
        F: Fn(&Request, &mut Response, &HandlerError) + Send + Sync + 'static,
    {
        *self.error_handler.write().unwrap() = Some(Arc::new(f));
    }

    pub fn init(&self) {
        let filters = self.filters.lock().unwrap();

        if self.inited.swap(true, Ordering::AcqRel) {
            return;
        }

        let chain = sorted_chain(&filters);

        for f in chain.iter() {
            f.init();
        }

        for s in self.servlets.read().unwrap().values() {
            s.init();
        }

        *self.chain.write().unwrap() = chain;
    }

    pub fn destroy(&self) {
        let _filters = self.filters.lock().unwrap();

        if !self.inited.swap(false, Ordering::AcqRel) {
            return;
        }

        for f in self.chain.read().unwrap().iter() {
            f.destroy();
        }

        for s in self.servlets.read().unwrap().values() {
            s.destroy();
        }
    }

    pub fn execute_count(&self) -> u64 {
        self.execute_count.load(Ordering::Relaxed)
    }

    pub fn illegal_request_count(&self) -> u64 {
        self.illegal_request_count.load(Ordering::Relaxed)
    }

    /// Binds the exchange to the current chain and the servlet for its
    /// service. The request must already be loaded.
    pub fn prepare(&self, ex: &mut Exchange) {
        ex.chain = Arc::clone(&*self.chain.read().unwrap());
        ex.servlet = self
            .servlets
            .read()
            .unwrap()
            .get(&ex.request.service_id())
            .cloned();
        ex.step = 0;

        ex.response.prepare(&ex.request);

        if let Some(h) = &*self.error_handler.read().unwrap() {
            let h = Arc::clone(h);

            ex.response
                .set_error_handler(move |req, resp, e| h(req, resp, e));
        }
    }

    /// Runs non-blocking steps inline. At the first blocking step the
    /// exchange is handed to `workers`, and once finished it is sent to
    /// `results`.
    pub fn dispatch(
        self: &Arc<Self>,
        mut ex: Box<Exchange>,
        workers: &WorkerPool,
        results: &Sender<Box<Exchange>>,
    ) -> Step {
        loop {
            if ex.response.is_finished() {
                return Step::Done(ex);
            }

            if self.step_non_blocking(&ex) {
                self.run_step(&mut ex);
                continue;
            }

            // from here on every step runs on the worker
            let slot = Arc::new(Mutex::new(Some(ex)));

            let job = {
                let this = Arc::clone(self);
                let slot = Arc::clone(&slot);
                let results = results.clone();

                move || {
                    let ex = slot.lock().unwrap().take();

                    if let Some(mut ex) = ex {
                        this.run_remaining(&mut ex);

                        if results.send(ex).is_err() {
                            debug!("exchange finished after its connection went away");
                        }
                    }
                }
            };

            return match workers.submit(job) {
                Ok(()) => Step::Submitted,
                Err(e) => {
                    warn!("dispatch to worker pool failed: {}", e);

                    let ex = slot.lock().unwrap().take();

                    match ex {
                        Some(mut ex) => {
                            let e = HandlerError::Rejected;
                            let ex_ref = &mut *ex;

                            ex_ref.response.finish_error(&ex_ref.request, e);

                            Step::Done(ex)
                        }
                        None => Step::Submitted,
                    }
                }
            };
        }
    }

    /// Runs every remaining step on the calling thread.
    pub fn run_remaining(&self, ex: &mut Exchange) {
        while !ex.response.is_finished() {
            self.run_step(ex);
        }
    }

    fn step_non_blocking(&self, ex: &Exchange) -> bool {
        match ex.chain.get(ex.step) {
            Some(f) => f.non_blocking(),
            None => match &ex.servlet {
                Some(s) => s.non_blocking(),

                // only a canned response is written
                None => true,
            },
        }
    }

    fn run_step(&self, ex: &mut Exchange) {
        let step = ex.step;
        ex.step += 1;

        let ret = if let Some(f) = ex.chain.get(step) {
            let f = Arc::clone(f);

            f.do_filter(&mut ex.request, &mut ex.response)
        } else if step == ex.chain.len() {
            self.execute_count.fetch_add(1, Ordering::Relaxed);

            match &ex.servlet {
                Some(s) => {
                    let ret = s.execute(&ex.request, &mut ex.response);

                    if ret.is_ok() && !ex.response.is_finished() {
                        Err(HandlerError::Unfinished)
                    } else {
                        ret
                    }
                }
                None => {
                    self.illegal_request_count.fetch_add(1, Ordering::Relaxed);

                    debug!(
                        "no servlet for service {:x} (seqid {})",
                        ex.request.service_id(),
                        ex.request.seqid()
                    );

                    ex.response
                        .finish_code(RETCODE_ILLEGAL_SERVICE, &[])
                        .map_err(HandlerError::from)
                }
            }
        } else {
            Err(HandlerError::Unfinished)
        };

        if let Err(e) = ret {
            warn!(
                "request seqid={} service={:x} action={:x} failed: {}",
                ex.request.seqid(),
                ex.request.service_id(),
                ex.request.action_id(),
                e
            );

            let request = &ex.request;
            ex.response.finish_error(request, e);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameReader, Mode, Progress, DEFAULT_MAX_BODY, RETCODE_THROW_EXCEPTION};
    use crate::core::channel::channel;
    use test_log::test;

    struct RecordFilter {
        name: String,
        priority: i32,
        non_blocking: bool,
        finish: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordFilter {
        fn new(name: &str, priority: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                priority,
                non_blocking: true,
                finish: false,
                log: Arc::clone(log),
            }
        }
    }

    impl Filter for RecordFilter {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn non_blocking(&self) -> bool {
            self.non_blocking
        }

        fn do_filter(&self, _req: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
            let tname = std::thread::current().name().unwrap_or("").to_string();

            self.log
                .lock()
                .unwrap()
                .push(format!("{}@{}", self.name, tname));

            if self.finish {
                resp.finish(b"from filter")?;
            }

            Ok(())
        }
    }

    const SERVICE: u128 = 0x1234;

    fn echo_servlet(non_blocking: bool) -> Arc<dyn Servlet> {
        Arc::new(ServiceServlet::new(non_blocking).action(1, |req, resp| {
            resp.finish(req.body())?;

            Ok(())
        }))
    }

    fn exchange(d: &Dispatcher, service_id: u128, action_id: u128, body: &[u8]) -> Box<Exchange> {
        let mut ex = Box::new(Exchange::new());

        let header = Header {
            seqid: 7,
            service_id,
            action_id,
            body_len: body.len() as i32,
            ..Default::default()
        };

        ex.request.prepare(
            Frame {
                header,
                body: body.to_vec(),
            },
            0,
            0,
            None,
        );

        d.prepare(&mut ex);

        ex
    }

    fn decode(out: &[u8]) -> Frame {
        let mut r = FrameReader::new(Mode::Response, DEFAULT_MAX_BODY);

        let (size, p) = r.read(out).unwrap();
        assert_eq!(size, out.len());
        assert_eq!(p, Progress::Complete);

        r.take_frame().unwrap()
    }

    fn done(step: Step) -> Box<Exchange> {
        match step {
            Step::Done(ex) => ex,
            Step::Submitted => panic!("expected inline completion"),
        }
    }

    #[test]
    fn filter_order() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let d = Dispatcher::new();
        d.add_filter(Arc::new(RecordFilter::new("low", -5, &log)));
        d.add_filter(Arc::new(RecordFilter::new("a", 0, &log)));
        d.add_filter(Arc::new(RecordFilter::new("high", 10, &log)));
        d.add_filter(Arc::new(RecordFilter::new("b", 0, &log)));
        d.init();

        assert_eq!(d.filter_names(), vec!["high", "a", "b", "low"]);

        assert!(d.contains_filter("a"));
        assert!(d.remove_filter("a").is_some());
        assert!(!d.contains_filter("a"));
        assert!(d.remove_filter("a").is_none());
        assert_eq!(d.filter_names(), vec!["high", "b", "low"]);
    }

    #[test]
    fn inline_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let d = Arc::new(Dispatcher::new());
        d.add_filter(Arc::new(RecordFilter::new("f", 0, &log)));
        d.add_servlet(SERVICE, echo_servlet(true));
        d.init();

        let workers = WorkerPool::new("test-dispatch", 1, 4).unwrap();
        let (s, _r) = channel(4);

        let mut ex = done(d.dispatch(exchange(&d, SERVICE, 1, b"hello"), &workers, &s));

        let c = ex.complete();
        assert!(c.keep_alive);

        let frame = decode(&c.output.unwrap());
        assert_eq!(frame.header.seqid, 7);
        assert_eq!(frame.header.retcode, 0);
        assert_eq!(frame.body, b"hello");

        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(d.execute_count(), 1);
    }

    #[test]
    fn blocking_step_moves_to_worker() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut first = RecordFilter::new("first", 10, &log);
        first.non_blocking = true;

        let mut second = RecordFilter::new("second", 5, &log);
        second.non_blocking = false;

        // non-blocking, but runs after a blocking step
        let third = RecordFilter::new("third", 0, &log);

        let d = Arc::new(Dispatcher::new());
        d.add_filter(Arc::new(third));
        d.add_filter(Arc::new(second));
        d.add_filter(Arc::new(first));
        d.add_servlet(SERVICE, echo_servlet(false));
        d.init();

        let workers = WorkerPool::new("test-dispatch", 1, 4).unwrap();
        let (s, r) = channel(4);

        let this = std::thread::current().name().unwrap_or("").to_string();

        assert!(matches!(
            d.dispatch(exchange(&d, SERVICE, 1, b"hi"), &workers, &s),
            Step::Submitted
        ));

        let mut ex = r.recv().unwrap();
        assert!(ex.response.is_finished());

        let frame = decode(&ex.complete().output.unwrap());
        assert_eq!(frame.body, b"hi");

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                format!("first@{}", this),
                "second@test-dispatch-0".to_string(),
                "third@test-dispatch-0".to_string(),
            ]
        );
    }

    #[test]
    fn filter_can_finish() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut f = RecordFilter::new("auth", 0, &log);
        f.finish = true;

        let d = Arc::new(Dispatcher::new());
        d.add_filter(Arc::new(f));
        d.add_servlet(SERVICE, echo_servlet(true));
        d.init();

        let workers = WorkerPool::new("test-dispatch", 1, 4).unwrap();
        let (s, _r) = channel(4);

        let mut ex = done(d.dispatch(exchange(&d, SERVICE, 1, b"x"), &workers, &s));

        let frame = decode(&ex.complete().output.unwrap());
        assert_eq!(frame.body, b"from filter");
        assert_eq!(d.execute_count(), 0);
    }

    #[test]
    fn unknown_service() {
        let d = Arc::new(Dispatcher::new());
        d.add_servlet(SERVICE, echo_servlet(false));
        d.init();

        let workers = WorkerPool::new("test-dispatch", 1, 4).unwrap();
        let (s, _r) = channel(4);

        let mut ex = done(d.dispatch(exchange(&d, 0x9999, 1, b"x"), &workers, &s));

        let c = ex.complete();
        assert!(c.keep_alive);

        let frame = decode(&c.output.unwrap());
        assert_eq!(frame.header.retcode, RETCODE_ILLEGAL_SERVICE);
        assert!(frame.body.is_empty());

        assert_eq!(d.illegal_request_count(), 1);
    }

    #[test]
    fn unknown_action() {
        let d = Arc::new(Dispatcher::new());
        d.add_servlet(SERVICE, echo_servlet(true));

        let workers = WorkerPool::new("test-dispatch", 1, 4).unwrap();
        let (s, _r) = channel(4);

        let mut ex = done(d.dispatch(exchange(&d, SERVICE, 2, b"x"), &workers, &s));

        let frame = decode(&ex.complete().output.unwrap());
        assert_eq!(frame.header.retcode, RETCODE_ILLEGAL_ACTION);
    }

    #[test]
    fn handler_error_closes() {
        let d = Arc::new(Dispatcher::new());
        d.add_servlet(
            SERVICE,
            Arc::new(ServiceServlet::new(true).action(1, |_, _| {
                Err(HandlerError::Failed("boom".to_string()))
            })),
        );

        let workers = WorkerPool::new("test-dispatch", 1, 4).unwrap();
        let (s, _r) = channel(4);

        let mut ex = done(d.dispatch(exchange(&d, SERVICE, 1, b"x"), &workers, &s));

        assert_eq!(
            ex.response.error(),
            Some(&HandlerError::Failed("boom".to_string()))
        );

        let c = ex.complete();
        assert!(c.output.is_none());
        assert!(!c.keep_alive);
    }

    #[test]
    fn error_handler_recovers() {
        let d = Arc::new(Dispatcher::new());
        d.add_servlet(
            SERVICE,
            Arc::new(ServiceServlet::new(true).action(1, |_, _| {
                Err(HandlerError::Failed("boom".to_string()))
            })),
        );
        d.set_error_handler(|_, resp, e| {
            let _ = resp.finish_code(RETCODE_THROW_EXCEPTION, e.to_string().as_bytes());
        });

        let workers = WorkerPool::new("test-dispatch", 1, 4).unwrap();
        let (s, _r) = channel(4);

        let mut ex = done(d.dispatch(exchange(&d, SERVICE, 1, b"x"), &workers, &s));

        let c = ex.complete();
        assert!(c.keep_alive);

        let frame = decode(&c.output.unwrap());
        assert_eq!(frame.header.retcode, RETCODE_THROW_EXCEPTION);
        assert_eq!(frame.body, b"handler failed: boom");
    }

    #[test]
    fn unfinished_is_error() {
        let d = Arc::new(Dispatcher::new());
        d.add_servlet(
            SERVICE,
            Arc::new(ServiceServlet::new(true).action(1, |_, _| Ok(()))),
        );

        let workers = WorkerPool::new("test-dispatch", 1, 4).unwrap();
        let (s, _r) = channel(4);

        let ex = done(d.dispatch(exchange(&d, SERVICE, 1, b"x"), &workers, &s));

        assert_eq!(ex.response.error(), Some(&HandlerError::Unfinished));
        assert!(!ex.response.is_keep_alive());
    }

    #[test]
    fn finish_once() {
        let mut resp = Response::new();

        assert!(resp.finish(b"a").is_ok());
        assert_eq!(resp.finish(b"b"), Err(ResponseError::AlreadyFinished));
        assert_eq!(
            resp.finish_code(1, b"c"),
            Err(ResponseError::AlreadyFinished)
        );

        let frame = decode(resp.output().unwrap());
        assert_eq!(frame.body, b"a");

        // error completion after a normal finish changes nothing
        resp.finish_error(&Request::new(), HandlerError::Unfinished);
        assert!(resp.error().is_none());
        assert!(resp.is_keep_alive());
    }

    #[test]
    fn listeners() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let d = Arc::new(Dispatcher::new());

        {
            let log = Arc::clone(&log);

            d.add_servlet(
                SERVICE,
                Arc::new(ServiceServlet::new(true).action(1, move |_, resp| {
                    let l1 = Arc::clone(&log);
                    let l2 = Arc::clone(&log);

                    resp.add_after_finish_listener(move || l1.lock().unwrap().push("after"));
                    resp.set_recycle_listener(move |req, _| {
                        assert_eq!(req.seqid(), 7);
                        l2.lock().unwrap().push("recycle");
                    });

                    resp.finish(b"")?;

                    Ok(())
                })),
            );
        }

        let workers = WorkerPool::new("test-dispatch", 1, 4).unwrap();
        let (s, _r) = channel(4);

        let mut ex = done(d.dispatch(exchange(&d, SERVICE, 1, b""), &workers, &s));
        assert!(log.lock().unwrap().is_empty());

        ex.complete();
        assert_eq!(*log.lock().unwrap(), vec!["after", "recycle"]);
    }

    #[test]
    fn exchange_pool() {
        let mut pool = ExchangePool::new(1);

        let mut a = pool.take();
        a.set_conn(5);
        a.response.set_keep_alive(false);

        let b = pool.take();
        assert_eq!(pool.created(), 2);

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.available(), 1);

        let a = pool.take();
        assert_eq!(a.conn(), 0);
        assert!(a.response.is_keep_alive());
        assert!(!a.response.is_finished());
        assert_eq!(pool.created(), 2);
    }
}
