// SPDX-License-Identifier: MIT OR Apache-2.0
//! Things playback waits on.

use futures::channel::oneshot;
use futures::future::{LocalBoxFuture, Shared};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Something that must resolve before playback may pass a point
#[derive(Clone)]
pub enum Blocker {
    /// A future created up front. Once resolved it stays resolved.
    Pending(Shared<LocalBoxFuture<'static, ()>>),
    /// A thunk called every time the point is reached
    Deferred(Rc<dyn Fn() -> LocalBoxFuture<'static, ()>>),
}

impl Blocker {
    /// Block on a future
    pub fn future(future: impl Future<Output = ()> + 'static) -> Self {
        Self::Pending(future.boxed_local().shared())
    }

    /// Block on a future produced when the point is reached
    pub fn deferred<F, Fut>(thunk: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Self::Deferred(Rc::new(move || thunk().boxed_local()))
    }

    pub(crate) fn wait(&self) -> LocalBoxFuture<'static, ()> {
        match self {
            Self::Pending(shared) => shared.clone().boxed_local(),
            Self::Deferred(thunk) => thunk(),
        }
    }
}

impl From<TimePromise> for Blocker {
    fn from(promise: TimePromise) -> Self {
        Self::future(promise)
    }
}

impl fmt::Debug for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(_) => f.write_str("Blocker::Pending"),
            Self::Deferred(_) => f.write_str("Blocker::Deferred"),
        }
    }
}

/// Resolves when a unit reaches a point of its timeline.
///
/// A promise whose unit is dropped before getting there resolves as well,
/// so nothing waits on a timeline that no longer exists.
#[derive(Debug)]
#[must_use = "a time promise does nothing unless awaited"]
pub struct TimePromise {
    receiver: Option<oneshot::Receiver<()>>,
}

impl TimePromise {
    pub(crate) fn channel() -> (oneshot::Sender<()>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver: Some(receiver) })
    }

    pub(crate) fn ready() -> Self {
        Self { receiver: None }
    }
}

impl Future for TimePromise {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.receiver.as_mut() {
            None => Poll::Ready(()),
            Some(receiver) => receiver.poll_unpin(cx).map(|_| ()),
        }
    }
}
