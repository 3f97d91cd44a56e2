//! Drain-latest coalescing for update streams

use futures::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};

/// Extension trait adding [`Coalesce`] to any stream.
pub trait CoalesceExt: Stream {
    /// Emit at most one item per `period`, always the newest one.
    ///
    /// Items arriving faster than the period replace each other in a single
    /// slot, so a slow consumer never builds a backlog. The final item of a
    /// finished stream is always delivered.
    fn coalesce(self, period: Duration) -> Coalesce<Self>
    where
        Self: Sized,
    {
        Coalesce::new(self, period)
    }
}

impl<T: Stream> CoalesceExt for T {}

pin_project! {
    /// Stream returned by [`CoalesceExt::coalesce`].
    pub struct Coalesce<S: Stream> {
        #[pin]
        inner: S,
        tick: Interval,
        latest: Option<S::Item>,
        superseded: u64,
        exhausted: bool,
    }
}

impl<S: Stream> Coalesce<S> {
    pub fn new(inner: S, period: Duration) -> Self {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { inner, tick, latest: None, superseded: 0, exhausted: false }
    }

    /// Number of items replaced by a newer one before they were emitted.
    pub fn superseded(&self) -> u64 {
        self.superseded
    }
}

impl<S: Stream> Stream for Coalesce<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        while !*this.exhausted {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    if this.latest.replace(item).is_some() {
                        *this.superseded += 1;
                    }
                }
                Poll::Ready(None) => *this.exhausted = true,
                Poll::Pending => break,
            }
        }

        if this.latest.is_none() {
            return if *this.exhausted { Poll::Ready(None) } else { Poll::Pending };
        }

        if !*this.exhausted {
            ready!(this.tick.poll_tick(cx));
        }
        Poll::Ready(this.latest.take())
    }
}
