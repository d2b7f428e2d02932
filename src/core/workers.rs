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

use log::debug;
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker queue is full")]
    Full,

    #[error("worker pool is shut down")]
    Closed,
}

/// Fixed set of named threads running blocking jobs from a bounded queue.
pub struct WorkerPool {
    sender: Option<mpsc::SyncSender<Job>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize, queue_size: usize) -> Result<Self, io::Error> {
        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_size);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(threads);

        for i in 0..threads.max(1) {
            let receiver = Arc::clone(&receiver);

            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || loop {
                    let job = {
                        let receiver = receiver.lock().unwrap();

                        match receiver.recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        }
                    };

                    job();
                })?;

            handles.push(handle);
        }

        debug!("started {} {} threads", handles.len(), name);

        Ok(Self {
            sender: Some(sender),
            threads: handles,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn submit<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(SubmitError::Closed)?;

        match sender.try_send(Box::new(f)) {
            Ok(()) => Ok(()),
            Err(mpsc::TrySendError::Full(_)) => Err(SubmitError::Full),
            Err(mpsc::TrySendError::Disconnected(_)) => Err(SubmitError::Closed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // queued jobs still run before the threads exit
        self.sender = None;

        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn run_jobs() {
        let count = Arc::new(AtomicUsize::new(0));

        {
            let pool = WorkerPool::new("test-worker", 2, 16).unwrap();
            assert_eq!(pool.thread_count(), 2);

            for _ in 0..10 {
                let count = Arc::clone(&count);

                pool.submit(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            }
        }

        assert_eq!(count.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn full() {
        let pool = WorkerPool::new("test-worker", 1, 1).unwrap();

        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);

            pool.submit(move || {
                started.wait();
                release.wait();
            })
            .unwrap();
        }

        // the only thread is busy, so one job fits in the queue
        started.wait();
        pool.submit(|| {}).unwrap();
        assert_eq!(pool.submit(|| {}), Err(SubmitError::Full));

        release.wait();
    }

    #[test]
    fn thread_names() {
        let pool = WorkerPool::new("named", 1, 1).unwrap();

        let (s, r) = mpsc::channel();

        pool.submit(move || {
            s.send(thread::current().name().map(|s| s.to_string()))
                .unwrap();
        })
        .unwrap();

        assert_eq!(r.recv().unwrap().as_deref(), Some("named-0"));
    }
}
