/*
 * Copyright (C) 2023 Fanout, Inc.
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

use crate::clientconn::{ClientError, Reservation, Waiting};
use std::cmp;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

// upper bound on a single wait, so freed pipeline capacity is noticed
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Where a pooled connection lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnIndex {
    ThreadLocal,
    Address,
    Slot(usize),
}

impl ConnIndex {
    /// Integer form used in logs and stats: -2, -1 or the slot number.
    pub fn to_legacy(self) -> i64 {
        match self {
            ConnIndex::ThreadLocal => -2,
            ConnIndex::Address => -1,
            ConnIndex::Slot(n) => n as i64,
        }
    }

    pub fn from_legacy(v: i64) -> Option<Self> {
        match v {
            -2 => Some(ConnIndex::ThreadLocal),
            -1 => Some(ConnIndex::Address),
            n if n >= 0 => Some(ConnIndex::Slot(n as usize)),
            _ => None,
        }
    }
}

/// Counting semaphore. Permits return on drop of the [`SemaphorePermit`].
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap()
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<SemaphorePermit> {
        let permits = &mut *self.permits.lock().unwrap();

        if *permits == 0 {
            return None;
        }

        *permits -= 1;

        Some(SemaphorePermit {
            sem: Arc::clone(self),
        })
    }

    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<SemaphorePermit, ClientError> {
        let deadline = Instant::now() + timeout;

        let mut permits = self.permits.lock().unwrap();

        while *permits == 0 {
            let now = Instant::now();

            if now >= deadline {
                return Err(ClientError::PoolTimeout);
            }

            permits = self.cond.wait_timeout(permits, deadline - now).unwrap().0;
        }

        *permits -= 1;

        Ok(SemaphorePermit {
            sem: Arc::clone(self),
        })
    }
}

pub struct SemaphorePermit {
    sem: Arc<Semaphore>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        *self.sem.permits.lock().unwrap() += 1;

        self.sem.cond.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Slot(usize),
    Address(SocketAddr),
    ThreadLocal(ThreadId),
}

impl EntryKey {
    pub fn index(&self) -> ConnIndex {
        match self {
            EntryKey::Slot(n) => ConnIndex::Slot(*n),
            EntryKey::Address(_) => ConnIndex::Address,
            EntryKey::ThreadLocal(_) => ConnIndex::ThreadLocal,
        }
    }
}

struct ConnEntry<T> {
    conn: T,
    waiting: Waiting,
    _permit: Option<SemaphorePermit>,
}

enum Entry<T> {
    Connecting,
    Open(ConnEntry<T>),
}

struct Inner<T> {
    entries: Mutex<HashMap<EntryKey, Entry<T>>>,
    changed: Condvar,
    slots: Arc<Semaphore>,
    max_slots: usize,
    max_pipeline: usize,
}

impl<T> Inner<T> {
    fn release(&self, key: &EntryKey) {
        let entries = &mut *self.entries.lock().unwrap();

        if let Some(Entry::Connecting) = entries.get(key) {
            entries.remove(key);
        }

        self.changed.notify_all();
    }
}

pub enum Checkout<T> {
    Existing {
        conn: T,
        reservation: Reservation,
        index: ConnIndex,
    },

    /// No usable connection. The holder should connect and call
    /// [`Vacancy::fill`]. Dropping the vacancy gives up the spot.
    Vacant(Vacancy<T>),
}

pub struct Vacancy<T> {
    inner: Arc<Inner<T>>,
    key: EntryKey,
    permit: Option<SemaphorePermit>,
    waiting: Waiting,
    filled: bool,
}

impl<T> Vacancy<T> {
    pub fn key(&self) -> EntryKey {
        self.key
    }

    pub fn index(&self) -> ConnIndex {
        self.key.index()
    }

    /// Pipeline counter the new connection must use.
    pub fn waiting(&self) -> &Waiting {
        &self.waiting
    }

    pub fn fill(mut self, conn: T) {
        let entry = ConnEntry {
            conn,
            waiting: self.waiting.clone(),
            _permit: self.permit.take(),
        };

        self.inner
            .entries
            .lock()
            .unwrap()
            .insert(self.key, Entry::Open(entry));

        self.filled = true;

        self.inner.changed.notify_all();
    }
}

impl<T> Drop for Vacancy<T> {
    fn drop(&mut self) {
        if !self.filled {
            self.inner.release(&self.key);
        }
    }
}

/// Outbound connections by slot, by address, and by thread. Each connection
/// carries a [`Waiting`] counter capping its in-flight requests.
pub struct ConnectionPool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> ConnectionPool<T> {
    pub fn new(max_slots: usize, max_pipeline: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                changed: Condvar::new(),
                slots: Arc::new(Semaphore::new(max_slots)),
                max_slots,
                max_pipeline,
            }),
        }
    }

    pub fn max_slots(&self) -> usize {
        self.inner.max_slots
    }

    /// Picks the least busy open slot with room, or a vacant slot. Waits up
    /// to `timeout` when every slot is open and full.
    pub fn checkout_slot(&self, timeout: Duration) -> Result<Checkout<T>, ClientError> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let entries = &mut *self.inner.entries.lock().unwrap();

                let mut best: Option<(usize, &ConnEntry<T>)> = None;

                for n in 0..self.inner.max_slots {
                    if let Some(Entry::Open(e)) = entries.get(&EntryKey::Slot(n)) {
                        let count = e.waiting.count();

                        let less_busy = best.map_or(true, |(_, b)| count < b.waiting.count());

                        if count < e.waiting.max() && less_busy {
                            best = Some((n, e));
                        }
                    }
                }

                if let Some((n, e)) = best {
                    if let Ok(reservation) = e.waiting.reserve() {
                        return Ok(Checkout::Existing {
                            conn: e.conn.clone(),
                            reservation,
                            index: ConnIndex::Slot(n),
                        });
                    }
                }

                if let Some(permit) = self.inner.slots.try_acquire() {
                    return Ok(Checkout::Vacant(self.vacate(entries, permit)));
                }
            }

            let now = Instant::now();

            if now >= deadline {
                return Err(ClientError::PoolTimeout);
            }

            // wakes early when a slot closes
            if let Ok(permit) = self.inner.slots.acquire(cmp::min(deadline - now, WAIT_SLICE)) {
                let entries = &mut *self.inner.entries.lock().unwrap();

                return Ok(Checkout::Vacant(self.vacate(entries, permit)));
            }
        }
    }

    fn vacate(
        &self,
        entries: &mut HashMap<EntryKey, Entry<T>>,
        permit: SemaphorePermit,
    ) -> Vacancy<T> {
        // a permit is held for every occupied slot, so one is free
        let n = (0..self.inner.max_slots)
            .find(|n| !entries.contains_key(&EntryKey::Slot(*n)))
            .unwrap_or(0);

        let key = EntryKey::Slot(n);
        entries.insert(key, Entry::Connecting);

        Vacancy {
            inner: Arc::clone(&self.inner),
            key,
            permit: Some(permit),
            waiting: Waiting::new(self.inner.max_pipeline),
            filled: false,
        }
    }

    /// The one connection for `addr`, outside the slots.
    pub fn checkout_addr(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Checkout<T>, ClientError> {
        self.checkout_keyed(EntryKey::Address(addr), timeout)
    }

    /// The calling thread's own connection.
    pub fn checkout_local(&self, timeout: Duration) -> Result<Checkout<T>, ClientError> {
        self.checkout_keyed(EntryKey::ThreadLocal(thread::current().id()), timeout)
    }

    fn checkout_keyed(&self, key: EntryKey, timeout: Duration) -> Result<Checkout<T>, ClientError> {
        let deadline = Instant::now() + timeout;

        let mut entries = self.inner.entries.lock().unwrap();

        loop {
            match entries.get(&key) {
                Some(Entry::Open(e)) => {
                    return Ok(Checkout::Existing {
                        conn: e.conn.clone(),
                        reservation: e.waiting.reserve()?,
                        index: key.index(),
                    });
                }
                Some(Entry::Connecting) => {
                    let now = Instant::now();

                    if now >= deadline {
                        return Err(ClientError::PoolTimeout);
                    }

                    entries = self.inner.changed.wait_timeout(entries, deadline - now).unwrap().0;
                }
                None => {
                    entries.insert(key, Entry::Connecting);

                    return Ok(Checkout::Vacant(Vacancy {
                        inner: Arc::clone(&self.inner),
                        key,
                        permit: None,
                        waiting: Waiting::new(self.inner.max_pipeline),
                        filled: false,
                    }));
                }
            }
        }
    }

    /// Removes the open entry at `key` if `pred` accepts its connection.
    pub fn remove<F>(&self, key: &EntryKey, pred: F) -> bool
    where
        F: FnOnce(&T) -> bool,
    {
        let removed = {
            let entries = &mut *self.inner.entries.lock().unwrap();

            let matched = match entries.get(key) {
                Some(Entry::Open(e)) => pred(&e.conn),
                _ => false,
            };

            if matched {
                entries.remove(key)
            } else {
                None
            }
        };

        if removed.is_some() {
            self.inner.changed.notify_all();
        }

        // slot permit released here, outside the lock
        removed.is_some()
    }

    pub fn open_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| matches!(e, Entry::Open(_)))
            .count()
    }

    /// Requests in flight across all open connections.
    pub fn waiting_total(&self) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap()
            .values()
            .map(|e| match e {
                Entry::Open(e) => e.waiting.count(),
                Entry::Connecting => 0,
            })
            .sum()
    }

    pub fn free_slots(&self) -> usize {
        self.inner.slots.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn expect_vacant<T>(c: Checkout<T>) -> Vacancy<T> {
        match c {
            Checkout::Vacant(v) => v,
            Checkout::Existing { .. } => panic!("expected vacant"),
        }
    }

    fn expect_existing<T>(c: Checkout<T>) -> (T, Reservation, ConnIndex) {
        match c {
            Checkout::Existing {
                conn,
                reservation,
                index,
            } => (conn, reservation, index),
            Checkout::Vacant(_) => panic!("expected existing"),
        }
    }

    #[test]
    fn legacy_index() {
        assert_eq!(ConnIndex::ThreadLocal.to_legacy(), -2);
        assert_eq!(ConnIndex::Address.to_legacy(), -1);
        assert_eq!(ConnIndex::Slot(3).to_legacy(), 3);

        assert_eq!(ConnIndex::from_legacy(-2), Some(ConnIndex::ThreadLocal));
        assert_eq!(ConnIndex::from_legacy(0), Some(ConnIndex::Slot(0)));
        assert_eq!(ConnIndex::from_legacy(-3), None);
    }

    #[test]
    fn semaphore() {
        let sem = Arc::new(Semaphore::new(1));

        let p = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());
        assert!(matches!(
            sem.acquire(Duration::from_millis(10)),
            Err(ClientError::PoolTimeout)
        ));

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(p);
        });

        assert!(sem.acquire(Duration::from_secs(5)).is_ok());
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn slots_fill_then_share() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(2, 2);

        let v0 = expect_vacant(pool.checkout_slot(Duration::ZERO).unwrap());
        assert_eq!(v0.index(), ConnIndex::Slot(0));
        v0.fill(10);

        // the open slot has room
        let (conn, r1, index) = expect_existing(pool.checkout_slot(Duration::ZERO).unwrap());
        assert_eq!((conn, index), (10, ConnIndex::Slot(0)));

        let (_, r2, _) = expect_existing(pool.checkout_slot(Duration::ZERO).unwrap());

        // slot 0 full, slot 1 is vacant
        let v1 = expect_vacant(pool.checkout_slot(Duration::ZERO).unwrap());
        assert_eq!(v1.index(), ConnIndex::Slot(1));
        v1.fill(11);

        let (conn, _r3, _) = expect_existing(pool.checkout_slot(Duration::ZERO).unwrap());
        assert_eq!(conn, 11);

        assert_eq!(pool.open_count(), 2);
        assert_eq!(pool.waiting_total(), 3);
        assert_eq!(pool.free_slots(), 0);

        drop(r1);
        drop(r2);
        assert_eq!(pool.waiting_total(), 1);
    }

    #[test]
    fn slots_exhausted() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(1, 1);

        expect_vacant(pool.checkout_slot(Duration::ZERO).unwrap()).fill(1);

        let (_, r, _) = expect_existing(pool.checkout_slot(Duration::ZERO).unwrap());

        assert!(matches!(
            pool.checkout_slot(Duration::from_millis(30)),
            Err(ClientError::PoolTimeout)
        ));

        // capacity frees up while waiting
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(r);
        });

        let (conn, _r, _) = expect_existing(pool.checkout_slot(Duration::from_secs(5)).unwrap());
        assert_eq!(conn, 1);
    }

    #[test]
    fn dropped_vacancy_frees_slot() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(1, 4);

        let v = expect_vacant(pool.checkout_slot(Duration::ZERO).unwrap());
        assert_eq!(pool.free_slots(), 0);
        assert!(matches!(
            pool.checkout_slot(Duration::from_millis(10)),
            Err(ClientError::PoolTimeout)
        ));

        drop(v);
        assert_eq!(pool.free_slots(), 1);

        let v = expect_vacant(pool.checkout_slot(Duration::ZERO).unwrap());
        assert_eq!(v.index(), ConnIndex::Slot(0));
    }

    #[test]
    fn remove_checks_conn() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(1, 4);

        let v = expect_vacant(pool.checkout_slot(Duration::ZERO).unwrap());
        let key = v.key();
        v.fill(5);

        assert!(!pool.remove(&key, |c| *c == 6));
        assert_eq!(pool.open_count(), 1);

        assert!(pool.remove(&key, |c| *c == 5));
        assert_eq!(pool.open_count(), 0);
        assert_eq!(pool.free_slots(), 1);
    }

    #[test]
    fn by_address() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(0, 1);

        let a: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:1001".parse().unwrap();

        let va = expect_vacant(pool.checkout_addr(a, Duration::ZERO).unwrap());
        assert_eq!(va.index(), ConnIndex::Address);

        // someone else is connecting
        assert!(matches!(
            pool.checkout_addr(a, Duration::from_millis(10)),
            Err(ClientError::PoolTimeout)
        ));

        let vb = expect_vacant(pool.checkout_addr(b, Duration::ZERO).unwrap());

        va.fill(1);
        drop(vb);

        let (conn, _r, index) = expect_existing(pool.checkout_addr(a, Duration::ZERO).unwrap());
        assert_eq!((conn, index), (1, ConnIndex::Address));

        assert!(matches!(
            pool.checkout_addr(a, Duration::ZERO),
            Err(ClientError::PipelineFull)
        ));

        expect_vacant(pool.checkout_addr(b, Duration::ZERO).unwrap());
    }

    #[test]
    fn thread_local() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(0, 8);

        let v = expect_vacant(pool.checkout_local(Duration::ZERO).unwrap());
        assert_eq!(v.index(), ConnIndex::ThreadLocal);
        v.fill(1);

        let (conn, _, _) = expect_existing(pool.checkout_local(Duration::ZERO).unwrap());
        assert_eq!(conn, 1);

        let other = {
            let pool = pool.clone();

            thread::spawn(move || {
                matches!(pool.checkout_local(Duration::ZERO), Ok(Checkout::Vacant(_)))
            })
            .join()
            .unwrap()
        };

        assert!(other);
    }
}
