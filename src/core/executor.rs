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

use crate::core::waker;
use log::debug;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::Context;
use std::time::Duration;
use thiserror::Error;

thread_local! {
    static EXECUTOR: RefCell<Option<Weak<Tasks>>> = const { RefCell::new(None) };
}

type BoxFuture = Pin<Box<dyn Future<Output = ()>>>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("executor has no free task slots")]
pub struct SpawnError;

struct TaskWaker {
    tasks: Weak<Tasks>,
    task_id: usize,
}

impl waker::RcWake for TaskWaker {
    fn wake(self: Rc<Self>) {
        if let Some(tasks) = self.tasks.upgrade() {
            tasks.wake(self.task_id);
        }
    }
}

struct Task {
    fut: Option<BoxFuture>,
    queued: bool,
}

struct Tasks {
    slots: RefCell<Slab<Task>>,
    queue: RefCell<VecDeque<usize>>,
    wakers: Vec<Rc<TaskWaker>>,
    current: Cell<Option<usize>>,
    pre_poll: RefCell<Option<Box<dyn FnMut()>>>,
}

impl Tasks {
    fn new(max: usize) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            slots: RefCell::new(Slab::with_capacity(max)),
            queue: RefCell::new(VecDeque::with_capacity(max)),
            wakers: (0..max)
                .map(|task_id| {
                    Rc::new(TaskWaker {
                        tasks: weak.clone(),
                        task_id,
                    })
                })
                .collect(),
            current: Cell::new(None),
            pre_poll: RefCell::new(None),
        })
    }

    fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    fn have_next(&self) -> bool {
        !self.queue.borrow().is_empty()
    }

    fn add<F>(&self, fut: F) -> Result<(), SpawnError>
    where
        F: Future<Output = ()> + 'static,
    {
        let slots = &mut *self.slots.borrow_mut();

        // wakers were preallocated per slot, so the slab must never grow
        if slots.len() == self.wakers.len() {
            return Err(SpawnError);
        }

        let task_id = slots.insert(Task {
            fut: Some(Box::pin(fut)),
            queued: true,
        });

        self.queue.borrow_mut().push_back(task_id);

        Ok(())
    }

    fn wake(&self, task_id: usize) {
        let slots = &mut *self.slots.borrow_mut();

        if let Some(task) = slots.get_mut(task_id) {
            if !task.queued {
                task.queued = true;
                self.queue.borrow_mut().push_back(task_id);
            }
        }
    }

    // poll every task that was queued when the pass started. tasks woken
    // during the pass wait for the next one
    fn process_queued(&self) {
        let count = self.queue.borrow().len();

        for _ in 0..count {
            let task_id = match self.queue.borrow_mut().pop_front() {
                Some(task_id) => task_id,
                None => break,
            };

            let fut = {
                let slots = &mut *self.slots.borrow_mut();

                match slots.get_mut(task_id) {
                    Some(task) => {
                        task.queued = false;
                        task.fut.take()
                    }
                    None => None,
                }
            };

            let mut fut = match fut {
                Some(fut) => fut,
                None => continue,
            };

            self.current.set(Some(task_id));

            if let Some(f) = &mut *self.pre_poll.borrow_mut() {
                f();
            }

            let waker = waker::into_std(Rc::clone(&self.wakers[task_id]));
            let mut cx = Context::from_waker(&waker);

            let done = fut.as_mut().poll(&mut cx).is_ready();

            self.current.set(None);

            let slots = &mut *self.slots.borrow_mut();

            if done {
                slots.remove(task_id);
            } else {
                slots[task_id].fut = Some(fut);
            }
        }
    }
}

pub struct Executor {
    tasks: Rc<Tasks>,
}

impl Executor {
    pub fn new(tasks_max: usize) -> Self {
        let tasks = Tasks::new(tasks_max);

        EXECUTOR.with(|ex| {
            if ex.borrow().is_some() {
                panic!("thread already has an Executor");
            }

            ex.replace(Some(Rc::downgrade(&tasks)));
        });

        Self { tasks }
    }

    pub fn spawn<F>(&self, fut: F) -> Result<(), SpawnError>
    where
        F: Future<Output = ()> + 'static,
    {
        debug!("spawning future with size {}", mem::size_of::<F>());

        self.tasks.add(fut)
    }

    pub fn set_pre_poll<F>(&self, pre_poll_fn: F)
    where
        F: FnMut() + 'static,
    {
        *self.tasks.pre_poll.borrow_mut() = Some(Box::new(pre_poll_fn));
    }

    pub fn have_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.slots.borrow().len()
    }

    pub fn run_until_stalled(&self) {
        while self.tasks.have_next() {
            self.tasks.process_queued();
        }
    }

    /// Runs until every task has completed. `park` is called whenever no
    /// task is ready, with a zero timeout if tasks woke themselves during
    /// the last pass.
    pub fn run<F>(&self, mut park: F) -> Result<(), io::Error>
    where
        F: FnMut(Option<Duration>) -> Result<(), io::Error>,
    {
        loop {
            self.tasks.process_queued();

            if !self.have_tasks() {
                break;
            }

            let timeout = if self.tasks.have_next() {
                Some(Duration::from_millis(0))
            } else {
                None
            };

            park(timeout)?;
        }

        Ok(())
    }

    pub fn current() -> Option<Self> {
        EXECUTOR.with(|ex| {
            ex.borrow()
                .as_ref()
                .and_then(|tasks| tasks.upgrade())
                .map(|tasks| Self { tasks })
        })
    }

    pub fn spawner(&self) -> Spawner {
        Spawner {
            tasks: Rc::downgrade(&self.tasks),
        }
    }

    pub fn current_task(&self) -> Option<usize> {
        self.tasks.current.get()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        EXECUTOR.with(|ex| {
            if Rc::strong_count(&self.tasks) == 1 {
                ex.replace(None);
            }
        });
    }
}

#[derive(Clone)]
pub struct Spawner {
    tasks: Weak<Tasks>,
}

impl Spawner {
    pub fn spawn<F>(&self, fut: F) -> Result<(), SpawnError>
    where
        F: Future<Output = ()> + 'static,
    {
        let tasks = self.tasks.upgrade().ok_or(SpawnError)?;

        tasks.add(fut)
    }
}
