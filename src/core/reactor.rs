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

use crate::core::event::{self, Notifier, Poller};
use crate::core::timer::TimerQueue;
use mio::Interest;
use slab::Slab;
use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

const TICK_DURATION_MS: u64 = 1;

thread_local! {
    static REACTOR: RefCell<Option<Weak<ReactorData>>> = const { RefCell::new(None) };
}

fn duration_to_ticks_round_down(d: Duration) -> u64 {
    (d.as_millis() / (TICK_DURATION_MS as u128)) as u64
}

fn duration_to_ticks_round_up(d: Duration) -> u64 {
    d.as_millis().div_ceil(TICK_DURATION_MS as u128) as u64
}

fn ticks_to_duration(t: u64) -> Duration {
    Duration::from_millis(t * TICK_DURATION_MS)
}

fn registration_full() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "reactor registrations exhausted")
}

struct RegistrationData {
    readiness: Option<Interest>,
    interest: Option<Interest>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    timer_key: Option<usize>,
}

impl RegistrationData {
    fn new(readiness: Option<Interest>) -> Self {
        Self {
            readiness,
            interest: None,
            read_waker: None,
            write_waker: None,
            timer_key: None,
        }
    }

    fn wake(&mut self, interest: Interest) {
        if interest.is_readable() {
            if let Some(waker) = self.read_waker.take() {
                waker.wake();
            }
        }

        if interest.is_writable() {
            if let Some(waker) = self.write_waker.take() {
                waker.wake();
            }
        }
    }
}

struct TimerData {
    queue: TimerQueue,
    start: Instant,
}

struct ReactorData {
    registrations: RefCell<Slab<RegistrationData>>,
    poller: RefCell<Poller>,
    timer: RefCell<TimerData>,
    budget: RefCell<Option<u32>>,
}

/// Handle to one slot in the reactor.
///
/// Readiness and wakers are tracked per direction, so a read and a write
/// waiting on the same socket are woken independently.
pub struct Registration {
    reactor: Weak<ReactorData>,
    key: usize,
}

impl Registration {
    fn data(&self) -> Rc<ReactorData> {
        self.reactor.upgrade().expect("reactor is gone")
    }

    pub fn key(&self) -> usize {
        self.key
    }

    pub fn readiness(&self) -> Option<Interest> {
        let reactor = self.data();
        let registrations = &*reactor.registrations.borrow();

        registrations[self.key].readiness
    }

    pub fn is_ready(&self, interest: Interest) -> bool {
        event::contains_any(self.readiness(), interest)
    }

    pub fn set_ready(&self, interest: Interest) {
        let reactor = self.data();
        let registrations = &mut *reactor.registrations.borrow_mut();

        let reg_data = &mut registrations[self.key];

        reg_data.readiness = Some(event::union(reg_data.readiness, interest));
    }

    pub fn clear_ready(&self, interest: Interest) {
        let reactor = self.data();
        let registrations = &mut *reactor.registrations.borrow_mut();

        let reg_data = &mut registrations[self.key];

        if let Some(cur) = reg_data.readiness {
            reg_data.readiness = cur.remove(interest);
        }
    }

    /// Interest currently registered with the OS poller, if any.
    pub fn interest(&self) -> Option<Interest> {
        let reactor = self.data();
        let registrations = &*reactor.registrations.borrow();

        registrations[self.key].interest
    }

    pub fn set_waker(&self, waker: &Waker, interest: Interest) {
        let reactor = self.data();
        let registrations = &mut *reactor.registrations.borrow_mut();

        let reg_data = &mut registrations[self.key];

        if interest.is_readable() {
            match &reg_data.read_waker {
                Some(w) if w.will_wake(waker) => {}
                _ => reg_data.read_waker = Some(waker.clone()),
            }
        }

        if interest.is_writable() {
            match &reg_data.write_waker {
                Some(w) if w.will_wake(waker) => {}
                _ => reg_data.write_waker = Some(waker.clone()),
            }
        }
    }

    pub fn clear_waker(&self, interest: Interest) {
        let reactor = self.data();
        let registrations = &mut *reactor.registrations.borrow_mut();

        let reg_data = &mut registrations[self.key];

        if interest.is_readable() {
            reg_data.read_waker = None;
        }

        if interest.is_writable() {
            reg_data.write_waker = None;
        }
    }

    /// Registers `source` with the OS poller on first use, and afterwards
    /// extends the registered interest. Interest is only ever added.
    pub fn ensure_interest<S>(&self, source: &mut S, interest: Interest) -> Result<(), io::Error>
    where
        S: mio::event::Source + ?Sized,
    {
        let reactor = self.data();
        let registrations = &mut *reactor.registrations.borrow_mut();

        let reg_data = &mut registrations[self.key];

        if event::contains_all(reg_data.interest, interest) {
            return Ok(());
        }

        let poller = &*reactor.poller.borrow();
        let token = event::token_for_key(self.key);

        match reg_data.interest {
            Some(cur) => {
                let new = cur | interest;
                poller.registry().reregister(source, token, new)?;
                reg_data.interest = Some(new);
            }
            None => {
                poller.registry().register(source, token, interest)?;
                reg_data.interest = Some(interest);
            }
        }

        Ok(())
    }

    pub fn deregister_io<S>(&self, source: &mut S) -> Result<(), io::Error>
    where
        S: mio::event::Source + ?Sized,
    {
        let reactor = self.data();
        let registrations = &mut *reactor.registrations.borrow_mut();

        let reg_data = &mut registrations[self.key];

        if reg_data.interest.take().is_some() {
            reactor.poller.borrow().registry().deregister(source)?;
        }

        Ok(())
    }

    pub fn reset_timer(&self, expires: Instant) -> Result<(), io::Error> {
        let reactor = self.data();
        let registrations = &mut *reactor.registrations.borrow_mut();
        let timer = &mut *reactor.timer.borrow_mut();

        let reg_data = &mut registrations[self.key];

        if let Some(timer_key) = reg_data.timer_key.take() {
            timer.queue.remove(timer_key);
        }

        let expires_ticks =
            duration_to_ticks_round_up(expires.saturating_duration_since(timer.start));

        let timer_key = timer
            .queue
            .add(expires_ticks, self.key)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        reg_data.timer_key = Some(timer_key);
        reg_data.readiness = None;

        Ok(())
    }

    pub fn pull_from_budget(&self) -> bool {
        let reactor = self.data();
        let budget = &mut *reactor.budget.borrow_mut();

        let ok = match budget {
            Some(budget) => {
                if *budget > 0 {
                    *budget -= 1;

                    true
                } else {
                    false
                }
            }
            None => true,
        };

        // out of budget. wake so the operation is retried on a later pass
        if !ok {
            let registrations = &mut *reactor.registrations.borrow_mut();

            registrations[self.key].wake(Interest::READABLE | Interest::WRITABLE);
        }

        ok
    }

    pub fn notifier(&self) -> Notifier {
        let reactor = self.data();
        let poller = &*reactor.poller.borrow();

        poller.notifier(self.key)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(reactor) = self.reactor.upgrade() {
            let registrations = &mut *reactor.registrations.borrow_mut();

            if let Some(timer_key) = registrations[self.key].timer_key {
                let timer = &mut *reactor.timer.borrow_mut();

                timer.queue.remove(timer_key);
            }

            registrations.remove(self.key);
        }
    }
}

#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorData>,
}

impl Reactor {
    pub fn new(registrations_max: usize) -> Result<Self, io::Error> {
        Self::new_with_time(registrations_max, Instant::now())
    }

    pub fn new_with_time(registrations_max: usize, start_time: Instant) -> Result<Self, io::Error> {
        let timer_data = TimerData {
            queue: TimerQueue::new(registrations_max),
            start: start_time,
        };

        let inner = Rc::new(ReactorData {
            registrations: RefCell::new(Slab::with_capacity(registrations_max)),
            poller: RefCell::new(Poller::new(registrations_max)?),
            timer: RefCell::new(timer_data),
            budget: RefCell::new(None),
        });

        REACTOR.with(|r| {
            if r.borrow().is_some() {
                panic!("thread already has a Reactor");
            }

            r.replace(Some(Rc::downgrade(&inner)));
        });

        Ok(Self { inner })
    }

    fn insert(&self, data: RegistrationData) -> Result<Registration, io::Error> {
        let registrations = &mut *self.inner.registrations.borrow_mut();

        if registrations.len() == registrations.capacity() {
            return Err(registration_full());
        }

        let key = registrations.insert(data);

        Ok(Registration {
            reactor: Rc::downgrade(&self.inner),
            key,
        })
    }

    /// Reserves a slot without registering anything with the OS poller.
    /// Readiness starts out as `assume_ready` so the first I/O attempt is
    /// made right away.
    pub fn register_lazy(&self, assume_ready: Option<Interest>) -> Result<Registration, io::Error> {
        self.insert(RegistrationData::new(assume_ready))
    }

    pub fn register_io<S>(
        &self,
        source: &mut S,
        interest: Interest,
    ) -> Result<Registration, io::Error>
    where
        S: mio::event::Source + ?Sized,
    {
        let reg = self.insert(RegistrationData::new(None))?;

        reg.ensure_interest(source, interest)?;

        Ok(reg)
    }

    /// Registration that other threads can mark readable through the
    /// returned notifier.
    pub fn register_remote(&self) -> Result<(Registration, Notifier), io::Error> {
        let reg = self.insert(RegistrationData::new(None))?;
        let notifier = reg.notifier();

        Ok((reg, notifier))
    }

    pub fn register_timer(&self, expires: Instant) -> Result<Registration, io::Error> {
        let reg = self.insert(RegistrationData::new(None))?;

        reg.reset_timer(expires)?;

        Ok(reg)
    }

    pub fn poll(&self, timeout: Option<Duration>) -> Result<(), io::Error> {
        let timer_timeout = self.advance_timers(Instant::now());

        let timeout = match (timeout, timer_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        self.poll_for_events(timeout)
    }

    // return the timeout that would have been used for a blocking poll
    pub fn poll_nonblocking(&self, current_time: Instant) -> Result<Option<Duration>, io::Error> {
        let timeout = self.advance_timers(current_time);

        self.poll_for_events(Some(Duration::from_millis(0)))?;

        Ok(timeout)
    }

    pub fn now(&self) -> Instant {
        let timer = &*self.inner.timer.borrow();

        timer.start + ticks_to_duration(timer.queue.current())
    }

    pub fn set_budget(&self, budget: Option<u32>) {
        *self.inner.budget.borrow_mut() = budget;
    }

    pub fn current() -> Option<Self> {
        REACTOR.with(|r| {
            r.borrow()
                .as_ref()
                .and_then(|inner| inner.upgrade())
                .map(|inner| Self { inner })
        })
    }

    fn advance_timers(&self, current_time: Instant) -> Option<Duration> {
        let timer = &mut *self.inner.timer.borrow_mut();

        let ticks =
            duration_to_ticks_round_down(current_time.saturating_duration_since(timer.start));

        timer.queue.update(ticks);

        timer.queue.timeout().map(ticks_to_duration)
    }

    fn poll_for_events(&self, timeout: Option<Duration>) -> Result<(), io::Error> {
        let poller = &mut *self.inner.poller.borrow_mut();

        poller.poll(timeout)?;

        let registrations = &mut *self.inner.registrations.borrow_mut();

        for &(key, readiness) in poller.ready() {
            if let Some(reg_data) = registrations.get_mut(key) {
                reg_data.readiness = Some(event::union(reg_data.readiness, readiness));
                reg_data.wake(readiness);
            }
        }

        let timer = &mut *self.inner.timer.borrow_mut();

        while let Some((_, key)) = timer.queue.take_expired() {
            if let Some(reg_data) = registrations.get_mut(key) {
                reg_data.timer_key = None;
                reg_data.readiness = Some(Interest::READABLE);
                reg_data.wake(Interest::READABLE);
            }
        }

        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        REACTOR.with(|r| {
            if Rc::strong_count(&self.inner) == 1 {
                r.replace(None);
            }
        });
    }
}

/// An I/O source bound to a registration.
pub struct IoEvented<S: mio::event::Source> {
    registration: Registration,
    io: Option<S>,
}

impl<S: mio::event::Source> IoEvented<S> {
    pub fn new(mut io: S, interest: Interest, reactor: &Reactor) -> Result<Self, io::Error> {
        let registration = reactor.register_io(&mut io, interest)?;

        Ok(Self {
            registration,
            io: Some(io),
        })
    }

    /// Binds the source without registering it. I/O is attempted right
    /// away and the source is handed to the OS poller only once an attempt
    /// would block.
    pub fn new_lazy(io: S, reactor: &Reactor) -> Result<Self, io::Error> {
        let registration = reactor.register_lazy(Some(Interest::READABLE | Interest::WRITABLE))?;

        Ok(Self {
            registration,
            io: Some(io),
        })
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn io(&self) -> &S {
        self.io.as_ref().expect("io taken")
    }

    pub fn ensure_interest(&mut self, interest: Interest) -> Result<(), io::Error> {
        let io = self.io.as_mut().expect("io taken");

        self.registration.ensure_interest(io, interest)
    }

    pub fn into_inner(mut self) -> S {
        let mut io = self.io.take().expect("io taken");

        // the fd is about to be handed off. failure to deregister only
        // leaves a stale entry that its new owner will replace
        let _ = self.registration.deregister_io(&mut io);

        io
    }
}

impl<S: mio::event::Source> Drop for IoEvented<S> {
    fn drop(&mut self) {
        if let Some(mut io) = self.io.take() {
            let _ = self.registration.deregister_io(&mut io);
        }
    }
}

pub struct TimerEvented {
    registration: Registration,
    expires: Instant,
}

impl TimerEvented {
    pub fn new(expires: Instant, reactor: &Reactor) -> Result<Self, io::Error> {
        let registration = reactor.register_timer(expires)?;

        Ok(Self {
            registration,
            expires,
        })
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn expires(&self) -> Instant {
        self.expires
    }

    pub fn set_expires(&mut self, expires: Instant) -> Result<(), io::Error> {
        self.registration.reset_timer(expires)?;
        self.expires = expires;

        Ok(())
    }
}

/// A resettable deadline.
pub struct Timeout {
    evented: TimerEvented,
}

impl Timeout {
    pub fn new(deadline: Instant) -> Result<Self, io::Error> {
        let reactor = Reactor::current().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no reactor on this thread")
        })?;

        Ok(Self {
            evented: TimerEvented::new(deadline, &reactor)?,
        })
    }

    pub fn deadline(&self) -> Instant {
        self.evented.expires()
    }

    pub fn set_deadline(&mut self, deadline: Instant) -> Result<(), io::Error> {
        self.evented.set_expires(deadline)
    }

    pub fn elapsed(&self) -> TimeoutFuture<'_> {
        TimeoutFuture { t: self }
    }
}

pub struct TimeoutFuture<'a> {
    t: &'a Timeout,
}

impl Future for TimeoutFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let reg = self.t.evented.registration();

        reg.set_waker(cx.waker(), Interest::READABLE);

        if reg.is_ready(Interest::READABLE) {
            return Poll::Ready(());
        }

        Poll::Pending
    }
}

impl Drop for TimeoutFuture<'_> {
    fn drop(&mut self) {
        self.t
            .evented
            .registration()
            .clear_waker(Interest::READABLE);
    }
}
