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

use std::mem::ManuallyDrop;
use std::rc::Rc;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// Single-threaded counterpart of `std::task::Wake`.
///
/// Wakers produced by [`into_std`] are only valid on the thread that created
/// them. Work that completes on another thread must come back through a
/// reactor `Notifier` instead of calling one of these directly.
pub trait RcWake {
    fn wake(self: Rc<Self>);

    fn wake_by_ref(self: &Rc<Self>) {
        Rc::clone(self).wake();
    }
}

fn raw_waker<W: RcWake>(waker: Rc<W>) -> RawWaker {
    RawWaker::new(
        Rc::into_raw(waker) as *const (),
        &RawWakerVTable::new(
            clone_raw::<W>,
            wake_raw::<W>,
            wake_by_ref_raw::<W>,
            drop_raw::<W>,
        ),
    )
}

unsafe fn clone_raw<W: RcWake>(data: *const ()) -> RawWaker {
    // SAFETY: data was produced by Rc::into_raw in raw_waker()
    let waker = ManuallyDrop::new(Rc::from_raw(data as *const W));

    raw_waker(Rc::clone(&waker))
}

unsafe fn wake_raw<W: RcWake>(data: *const ()) {
    // SAFETY: ownership of the reference moves into the call
    let waker = Rc::from_raw(data as *const W);

    RcWake::wake(waker);
}

unsafe fn wake_by_ref_raw<W: RcWake>(data: *const ()) {
    // SAFETY: the reference stays owned by the caller
    let waker = ManuallyDrop::new(Rc::from_raw(data as *const W));

    RcWake::wake_by_ref(&*waker);
}

unsafe fn drop_raw<W: RcWake>(data: *const ()) {
    drop(Rc::from_raw(data as *const W));
}

pub fn into_std<W: RcWake + 'static>(waker: Rc<W>) -> Waker {
    // SAFETY: the vtable functions treat the data pointer as the Rc<W> it
    // was created from
    unsafe { Waker::from_raw(raw_waker(waker)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountWaker {
        count: Cell<u32>,
    }

    impl RcWake for CountWaker {
        fn wake(self: Rc<Self>) {
            self.count.set(self.count.get() + 1);
        }
    }

    #[test]
    fn wake_and_clone() {
        let data = Rc::new(CountWaker {
            count: Cell::new(0),
        });

        let waker = into_std(Rc::clone(&data));
        assert_eq!(Rc::strong_count(&data), 2);

        let other = waker.clone();
        assert_eq!(Rc::strong_count(&data), 3);

        waker.wake_by_ref();
        assert_eq!(data.count.get(), 1);

        other.wake();
        assert_eq!(data.count.get(), 2);
        assert_eq!(Rc::strong_count(&data), 2);

        drop(waker);
        assert_eq!(Rc::strong_count(&data), 1);
    }
}
