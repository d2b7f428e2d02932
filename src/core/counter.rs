/*
 * Copyright (C) 2023 Fastly, Inc.
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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("counter out of range")]
pub struct CounterError;

/// An unsigned integer that can be shared between threads, optionally
/// capped at a limit. Operations use Relaxed ordering, so the value cannot
/// be assumed to be in sync with other atomics.
pub struct Counter {
    value: AtomicUsize,
    limit: Option<usize>,
}

impl Counter {
    pub fn new(value: usize) -> Self {
        Self {
            value: AtomicUsize::new(value),
            limit: None,
        }
    }

    pub fn with_limit(value: usize, limit: usize) -> Self {
        Self {
            value: AtomicUsize::new(value),
            limit: Some(limit),
        }
    }

    pub fn value(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn inc(&self, amount: usize) -> Result<(), CounterError> {
        if amount == 0 {
            return Ok(());
        }

        let max = self.limit.unwrap_or(usize::MAX);

        loop {
            let value = self.value.load(Ordering::Relaxed);

            if amount > max - value.min(max) {
                return Err(CounterError);
            }

            if self
                .value
                .compare_exchange(value, value + amount, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        Ok(())
    }

    pub fn dec(&self, amount: usize) -> Result<(), CounterError> {
        if amount == 0 {
            return Ok(());
        }

        loop {
            let value = self.value.load(Ordering::Relaxed);

            if amount > value {
                return Err(CounterError);
            }

            if self
                .value
                .compare_exchange(value, value - amount, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        Ok(())
    }
}

/// Holds one unit of a shared counter, released on drop.
pub struct CounterGuard {
    counter: Arc<Counter>,
}

impl CounterGuard {
    pub fn acquire(counter: &Arc<Counter>) -> Result<Self, CounterError> {
        counter.inc(1)?;

        Ok(Self {
            counter: Arc::clone(counter),
        })
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        assert!(self.counter.dec(1).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter() {
        let c = Counter::new(2);

        assert!(c.dec(1).is_ok());
        assert!(c.dec(1).is_ok());
        assert!(c.dec(1).is_err());

        assert!(c.inc(1).is_ok());
        assert!(c.dec(2).is_err());
        assert!(c.dec(1).is_ok());
        assert_eq!(c.value(), 0);
    }

    #[test]
    fn limit() {
        let c = Counter::with_limit(0, 2);

        assert!(c.inc(2).is_ok());
        assert_eq!(c.inc(1), Err(CounterError));

        assert!(c.dec(1).is_ok());
        assert!(c.inc(1).is_ok());
        assert_eq!(c.value(), 2);
    }

    #[test]
    fn guard() {
        let c = Arc::new(Counter::with_limit(0, 1));

        let g = CounterGuard::acquire(&c).unwrap();
        assert!(CounterGuard::acquire(&c).is_err());

        drop(g);
        assert_eq!(c.value(), 0);
        assert!(CounterGuard::acquire(&c).is_ok());
    }
}
