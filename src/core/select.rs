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

//! Wait on several futures at once. Futures are polled in argument order,
//! so earlier arguments take priority when more than one is ready.

use paste::paste;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

fn map_poll<F, W, V>(cx: &mut Context, fut: &mut F, wrap_func: W) -> Poll<V>
where
    F: Future + Unpin,
    W: FnOnce(F::Output) -> V,
{
    match Pin::new(fut).poll(cx) {
        Poll::Ready(v) => Poll::Ready(wrap_func(v)),
        Poll::Pending => Poll::Pending,
    }
}

macro_rules! declare_select {
    ($count: literal, ( $($num:literal),* )) => {
        paste! {
            pub enum [<Select $count>]<$([<O $num>], )*> {
                $(
                    [<R $num>]([<O $num>]),
                )*
            }

            pub struct [<Select $count Future>]<$([<F $num>], )*> {
                $(
                    [<f $num>]: [<F $num>],
                )*
            }

            impl<$([<F $num>], )*> Future for [<Select $count Future>]<$([<F $num>], )*>
            where
                $(
                    [<F $num>]: Future + Unpin,
                )*
            {
                type Output = [<Select $count>]<$([<F $num>]::Output, )*>;

                fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
                    let s = &mut *self;

                    $(
                        let p = map_poll(cx, &mut s.[<f $num>], |v| [<Select $count>]::[<R $num>](v));

                        if p.is_ready() {
                            return p;
                        }
                    )*

                    Poll::Pending
                }
            }

            pub fn [<select_ $count>]<$([<F $num>], )*>(
                $(
                    [<f $num>]: [<F $num>],
                )*
            ) -> [<Select $count Future>]<$([<F $num>], )*>
            where
                $(
                    [<F $num>]: Future + Unpin,
                )*
            {
                [<Select $count Future>] {
                    $(
                        [<f $num>],
                    )*
                }
            }
        }
    }
}

declare_select!(2, (1, 2));
declare_select!(3, (1, 2, 3));
declare_select!(4, (1, 2, 3, 4));

pub struct SelectOptionFuture<F> {
    fut: Option<F>,
}

impl<F, O> Future for SelectOptionFuture<F>
where
    F: Future<Output = O> + Unpin,
{
    type Output = O;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let s = &mut *self;

        match Pin::new(&mut s.fut).as_pin_mut() {
            Some(f) => f.poll(cx),
            None => Poll::Pending,
        }
    }
}

/// Resolves with the inner future, or never if there is none.
pub fn select_option<F, O>(fut: Option<F>) -> SelectOptionFuture<F>
where
    F: Future<Output = O>,
{
    SelectOptionFuture { fut }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test::poll_once;
    use std::future::{pending, ready};

    #[test]
    fn first_ready_wins() {
        let mut fut = select_3(pending::<u32>(), ready(2u32), ready(3u32));

        match poll_once(&mut fut) {
            Poll::Ready(Select3::R2(v)) => assert_eq!(v, 2),
            _ => panic!("unexpected result"),
        }
    }

    #[test]
    fn all_pending() {
        let mut fut = select_2(pending::<()>(), pending::<()>());

        assert!(poll_once(&mut fut).is_pending());
    }

    #[test]
    fn option() {
        let mut fut = select_option(None::<std::future::Ready<u32>>);
        assert!(poll_once(&mut fut).is_pending());

        let mut fut = select_option(Some(ready(7u32)));
        assert_eq!(poll_once(&mut fut), Poll::Ready(7));
    }
}
