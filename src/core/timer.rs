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

use slab::Slab;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("timer queue is full")]
pub struct TimerFull;

struct Entry {
    expires: u64,
    user_data: usize,
}

/// Deadline queue measured in ticks.
///
/// Entries are ordered by expiration and then by key, so timers sharing a
/// tick fire in the order they were added as long as keys are not reused in
/// between. The owner decides what a tick is and calls [`update`] with the
/// current tick before collecting expired entries.
///
/// [`update`]: TimerQueue::update
pub struct TimerQueue {
    entries: Slab<Entry>,
    order: BTreeSet<(u64, usize)>,
    current: u64,
}

impl TimerQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Slab::with_capacity(capacity),
            order: BTreeSet::new(),
            current: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Schedules `user_data` to expire at tick `expires`. The returned key
    /// cancels the timer via [`remove`](TimerQueue::remove).
    pub fn add(&mut self, expires: u64, user_data: usize) -> Result<usize, TimerFull> {
        if self.entries.len() == self.entries.capacity() {
            return Err(TimerFull);
        }

        let key = self.entries.insert(Entry { expires, user_data });
        self.order.insert((expires, key));

        Ok(key)
    }

    pub fn remove(&mut self, key: usize) -> Option<usize> {
        let entry = self.entries.try_remove(key)?;
        self.order.remove(&(entry.expires, key));

        Some(entry.user_data)
    }

    pub fn expires(&self, key: usize) -> Option<u64> {
        self.entries.get(key).map(|e| e.expires)
    }

    pub fn update(&mut self, current: u64) {
        // time never goes backwards
        if current > self.current {
            self.current = current;
        }
    }

    /// Ticks until the next timer expires, zero if one already has.
    pub fn timeout(&self) -> Option<u64> {
        let (expires, _) = self.order.iter().next()?;

        Some(expires.saturating_sub(self.current))
    }

    pub fn take_expired(&mut self) -> Option<(usize, usize)> {
        let &(expires, key) = self.order.iter().next()?;

        if expires > self.current {
            return None;
        }

        self.order.remove(&(expires, key));
        let entry = self.entries.remove(key);

        Some((key, entry.user_data))
    }
}
