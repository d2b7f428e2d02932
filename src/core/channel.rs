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

use crate::core::event::Notifier;
use crate::core::reactor::{Reactor, Registration};
use log::error;
use mio::Interest;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

// the receiving side's notifier, once it has been bound to a reactor
struct Shared {
    notifier: Mutex<Option<Notifier>>,
}

impl Shared {
    fn notify(&self) {
        if let Some(notifier) = &*self.notifier.lock().unwrap() {
            if let Err(e) = notifier.notify() {
                error!("channel notify failed: {:?}", e);
            }
        }
    }
}

pub struct Sender<T> {
    sender: Option<mpsc::SyncSender<T>>,
    shared: Arc<Shared>,
}

impl<T> Sender<T> {
    pub fn try_send(&self, t: T) -> Result<(), mpsc::TrySendError<T>> {
        match &self.sender {
            Some(sender) => sender.try_send(t)?,
            None => return Err(mpsc::TrySendError::Disconnected(t)),
        }

        self.shared.notify();

        Ok(())
    }

    /// Blocks while the channel is full. Only for threads without a reactor.
    pub fn send(&self, t: T) -> Result<(), mpsc::SendError<T>> {
        match &self.sender {
            Some(sender) => sender.send(t)?,
            None => return Err(mpsc::SendError(t)),
        }

        self.shared.notify();

        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.sender = None;

        // wake the receiver so it can observe the disconnect
        self.shared.notify();
    }
}

pub struct Receiver<T> {
    receiver: mpsc::Receiver<T>,
    shared: Arc<Shared>,
}

impl<T> Receiver<T> {
    pub fn try_recv(&self) -> Result<T, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv(&self) -> Result<T, mpsc::RecvError> {
        self.receiver.recv()
    }
}

pub fn channel<T>(bound: usize) -> (Sender<T>, Receiver<T>) {
    let (s, r) = mpsc::sync_channel::<T>(bound);

    let shared = Arc::new(Shared {
        notifier: Mutex::new(None),
    });

    let sender = Sender {
        sender: Some(s),
        shared: Arc::clone(&shared),
    };

    let receiver = Receiver {
        receiver: r,
        shared,
    };

    (sender, receiver)
}

/// Receiving end bound to the current thread's reactor.
pub struct AsyncReceiver<T> {
    registration: Registration,
    inner: Receiver<T>,
}

impl<T> AsyncReceiver<T> {
    pub fn new(r: Receiver<T>) -> Result<Self, io::Error> {
        let reactor = Reactor::current()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no reactor on this thread"))?;

        let (registration, notifier) = reactor.register_remote()?;

        *r.shared.notifier.lock().unwrap() = Some(notifier);

        // items may have been queued before the notifier was installed
        registration.set_ready(Interest::READABLE);

        Ok(Self {
            registration,
            inner: r,
        })
    }

    pub fn try_recv(&self) -> Result<T, mpsc::TryRecvError> {
        self.inner.try_recv()
    }

    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture { r: self }
    }
}

impl<T> Drop for AsyncReceiver<T> {
    fn drop(&mut self) {
        *self.inner.shared.notifier.lock().unwrap() = None;
    }
}

pub struct RecvFuture<'a, T> {
    r: &'a AsyncReceiver<T>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, mpsc::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let reg = &self.r.registration;

        reg.set_waker(cx.waker(), Interest::READABLE);

        if !reg.is_ready(Interest::READABLE) {
            return Poll::Pending;
        }

        if !reg.pull_from_budget() {
            return Poll::Pending;
        }

        match self.r.inner.try_recv() {
            Ok(v) => Poll::Ready(Ok(v)),
            Err(mpsc::TryRecvError::Empty) => {
                reg.clear_ready(Interest::READABLE);

                Poll::Pending
            }
            Err(mpsc::TryRecvError::Disconnected) => Poll::Ready(Err(mpsc::RecvError)),
        }
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        self.r.registration.clear_waker(Interest::READABLE);
    }
}

struct LocalShared<T> {
    queue: VecDeque<T>,
    bound: usize,
    waker: Option<Waker>,
    senders: usize,
    receiver: bool,
}

/// Sending end of a channel between tasks of the same thread.
pub struct LocalSender<T> {
    shared: Rc<RefCell<LocalShared<T>>>,
}

impl<T> LocalSender<T> {
    pub fn try_send(&self, t: T) -> Result<(), mpsc::TrySendError<T>> {
        let shared = &mut *self.shared.borrow_mut();

        if !shared.receiver {
            return Err(mpsc::TrySendError::Disconnected(t));
        }

        if shared.queue.len() >= shared.bound {
            return Err(mpsc::TrySendError::Full(t));
        }

        shared.queue.push_back(t);

        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        !self.shared.borrow().receiver
    }
}

impl<T> Clone for LocalSender<T> {
    fn clone(&self) -> Self {
        self.shared.borrow_mut().senders += 1;

        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T> Drop for LocalSender<T> {
    fn drop(&mut self) {
        let shared = &mut *self.shared.borrow_mut();

        shared.senders -= 1;

        if shared.senders == 0 {
            if let Some(waker) = shared.waker.take() {
                waker.wake();
            }
        }
    }
}

pub struct LocalReceiver<T> {
    shared: Rc<RefCell<LocalShared<T>>>,
}

impl<T> LocalReceiver<T> {
    pub fn try_recv(&self) -> Result<T, mpsc::TryRecvError> {
        let shared = &mut *self.shared.borrow_mut();

        match shared.queue.pop_front() {
            Some(t) => Ok(t),
            None if shared.senders == 0 => Err(mpsc::TryRecvError::Disconnected),
            None => Err(mpsc::TryRecvError::Empty),
        }
    }

    pub fn recv(&self) -> LocalRecvFuture<'_, T> {
        LocalRecvFuture { r: self }
    }
}

impl<T> Drop for LocalReceiver<T> {
    fn drop(&mut self) {
        let shared = &mut *self.shared.borrow_mut();

        shared.receiver = false;
        shared.queue.clear();
    }
}

pub fn local_channel<T>(bound: usize) -> (LocalSender<T>, LocalReceiver<T>) {
    let shared = Rc::new(RefCell::new(LocalShared {
        queue: VecDeque::with_capacity(bound),
        bound,
        waker: None,
        senders: 1,
        receiver: true,
    }));

    let sender = LocalSender {
        shared: Rc::clone(&shared),
    };

    let receiver = LocalReceiver { shared };

    (sender, receiver)
}

pub struct LocalRecvFuture<'a, T> {
    r: &'a LocalReceiver<T>,
}

impl<T> Future for LocalRecvFuture<'_, T> {
    type Output = Result<T, mpsc::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.r.try_recv() {
            Ok(t) => Poll::Ready(Ok(t)),
            Err(mpsc::TryRecvError::Disconnected) => Poll::Ready(Err(mpsc::RecvError)),
            Err(mpsc::TryRecvError::Empty) => {
                self.r.shared.borrow_mut().waker = Some(cx.waker().clone());

                Poll::Pending
            }
        }
    }
}

impl<T> Drop for LocalRecvFuture<'_, T> {
    fn drop(&mut self) {
        self.r.shared.borrow_mut().waker = None;
    }
}
