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

use mio::{Interest, Token};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAKER_TOKEN: Token = Token(0);

pub fn token_for_key(key: usize) -> Token {
    Token(key + 1)
}

fn key_for_token(token: Token) -> Option<usize> {
    usize::from(token).checked_sub(1)
}

pub fn union(a: Option<Interest>, b: Interest) -> Interest {
    match a {
        Some(a) => a | b,
        None => b,
    }
}

pub fn contains_any(a: Option<Interest>, b: Interest) -> bool {
    match a {
        Some(a) => (a.is_readable() && b.is_readable()) || (a.is_writable() && b.is_writable()),
        None => false,
    }
}

pub fn contains_all(a: Option<Interest>, b: Interest) -> bool {
    match a {
        Some(a) => (a.is_readable() || !b.is_readable()) && (a.is_writable() || !b.is_writable()),
        None => false,
    }
}

struct RemoteShared {
    waker: mio::Waker,
    pending: Mutex<Vec<usize>>,
}

/// Marks a registration readable from any thread.
#[derive(Clone)]
pub struct Notifier {
    shared: Arc<RemoteShared>,
    key: usize,
}

impl Notifier {
    pub fn notify(&self) -> Result<(), io::Error> {
        let was_empty = {
            let pending = &mut *self.shared.pending.lock().unwrap();

            let was_empty = pending.is_empty();
            pending.push(self.key);

            was_empty
        };

        // only the first notification since the last poll needs to
        // interrupt it
        if was_empty {
            self.shared.waker.wake()?;
        }

        Ok(())
    }
}

/// OS readiness polling plus notifications posted by other threads.
pub struct Poller {
    poll: mio::Poll,
    events: mio::Events,
    shared: Arc<RemoteShared>,
    ready: Vec<(usize, Interest)>,
}

impl Poller {
    pub fn new(events_max: usize) -> Result<Self, io::Error> {
        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            poll,
            events: mio::Events::with_capacity(events_max),
            shared: Arc::new(RemoteShared {
                waker,
                pending: Mutex::new(Vec::new()),
            }),
            ready: Vec::with_capacity(events_max),
        })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    pub fn notifier(&self, key: usize) -> Notifier {
        Notifier {
            shared: Arc::clone(&self.shared),
            key,
        }
    }

    /// Waits for events. Readiness found is available from [`ready`] until
    /// the next call.
    ///
    /// [`ready`]: Poller::ready
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<(), io::Error> {
        self.ready.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let key = match key_for_token(event.token()) {
                Some(key) => key,
                None => continue,
            };

            let mut readiness = None;

            if event.is_readable() || event.is_read_closed() || event.is_error() {
                readiness = Some(Interest::READABLE);
            }

            if event.is_writable() || event.is_write_closed() || event.is_error() {
                readiness = Some(union(readiness, Interest::WRITABLE));
            }

            if let Some(readiness) = readiness {
                self.ready.push((key, readiness));
            }
        }

        let pending = &mut *self.shared.pending.lock().unwrap();

        for key in pending.drain(..) {
            self.ready.push((key, Interest::READABLE));
        }

        Ok(())
    }

    pub fn ready(&self) -> &[(usize, Interest)] {
        &self.ready
    }
}
