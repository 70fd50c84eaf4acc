//! Adapts a `futures::Stream` into a [`DemandSource`].
//!
//! The stream is polled on its own task, and only while demand is outstanding. Demand is a
//! counter shared with the subscription; `UNBOUNDED` disables the accounting.

use std::convert::Infallible;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{Stream, StreamExt, stream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::BoxError;
use crate::reactive::{BoxSource, DemandSource, Subscriber, Subscription, UNBOUNDED};

/// A source backed by a stream of results; an `Err` item terminates it with an error.
pub struct StreamSource<S> {
    stream: S,
}

impl<S> StreamSource<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S, T, E> DemandSource<T> for StreamSource<S>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError>,
{
    fn subscribe(self: Box<Self>, mut subscriber: Box<dyn Subscriber<T>>) {
        let demand = Arc::new(Demand::default());
        let stream = self.stream;

        tokio::spawn(async move {
            subscriber.on_subscribe(Arc::clone(&demand) as Arc<dyn Subscription>);
            let mut stream = pin!(stream);

            loop {
                tokio::select! {
                    biased;
                    _ = demand.cancelled.cancelled() => break,
                    _ = demand.acquire() => {}
                }

                let item = tokio::select! {
                    biased;
                    _ = demand.cancelled.cancelled() => break,
                    item = stream.next() => item,
                };

                match item {
                    Some(Ok(item)) => subscriber.on_next(Some(item)),
                    Some(Err(e)) => {
                        subscriber.on_error(e.into());
                        return;
                    }
                    None => {
                        subscriber.on_complete();
                        return;
                    }
                }
            }
            debug!("source cancelled");
        });
    }
}

/// Outstanding demand of one subscription.
#[derive(Debug, Default)]
struct Demand {
    requested: AtomicU64,
    notify: Notify,
    cancelled: CancellationToken,
}

impl Demand {
    /// Waits until one item may be emitted and consumes it from the demand.
    async fn acquire(&self) {
        loop {
            let current = self.requested.load(Ordering::Acquire);
            if current == UNBOUNDED {
                return;
            }
            if current > 0 {
                if self.requested.compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    return;
                }
                continue;
            }
            self.notify.notified().await;
        }
    }
}

impl Subscription for Demand {
    fn request(&self, n: u64) {
        if n == 0 {
            trace!("ignore request of zero items");
            return;
        }
        let _ = self.requested.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| Some(current.saturating_add(n)));
        self.notify.notify_one();
    }

    fn cancel(&self) {
        self.cancelled.cancel();
    }
}

pub fn from_stream<S, T, E>(stream: S) -> BoxSource<T>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError> + 'static,
{
    Box::new(StreamSource::new(stream))
}

pub fn from_iter<I, T>(iter: I) -> BoxSource<T>
where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    T: Send + 'static,
{
    from_stream(stream::iter(iter.into_iter().map(Ok::<T, Infallible>)))
}

pub fn just<T: Send + 'static>(item: T) -> BoxSource<T> {
    from_iter([item])
}

pub fn empty<T: Send + 'static>() -> BoxSource<T> {
    from_stream(stream::empty::<Result<T, Infallible>>())
}

pub fn error<T, E>(e: E) -> BoxSource<T>
where
    T: Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    from_stream(stream::once(async move { Err::<T, E>(e) }))
}
