//! Outbound flush bridge: drains a [`DemandSource`](crate::reactive::DemandSource) into a
//! connection.
//!
//! Two strategies share the same lifecycle:
//!
//! - [`FlushEachSubscriber`] writes and flushes every unit, and requests the next unit only after
//!   the write of the previous one was acknowledged
//! - [`FlushLastSubscriber`] requests unbounded demand, writes without flushing and flushes once
//!   when the source terminates
//!
//! Exactly one of completion, error or connection-inactive releases a bridge. Completion and
//! error hand a [`Terminated`] signal to the connection through [`Outbound::execute`]; the
//! inactive path only cancels the source.
//!
//! Bridges never touch the socket or run on a foreign task. The connection executor owns them and
//! passes itself in as the [`Outbound`] on every call.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{HttpError, SendError};
use crate::reactive::{Subscription, Unit};

mod flush_each;
mod flush_last;

pub use flush_each::FlushEachSubscriber;
pub use flush_last::FlushLastSubscriber;

/// The connection as seen by a bridge.
pub trait Outbound {
    fn is_open(&self) -> bool;

    /// Queues one unit; `None` when nothing had to be written.
    fn send_next(&mut self, unit: Unit) -> Result<Option<WriteHandle>, HttpError>;

    /// Closes the current batch of writes, it goes to the socket in one piece.
    fn flush(&mut self);

    /// Reports the outcome of `handle` back to the bridge once it resolves.
    fn listen(&mut self, handle: WriteHandle, listen: Listen);

    /// Registers the bridge for the connection-inactive notification.
    fn on_inactive(&mut self) -> Cancellation;

    /// Runs the termination of the bridge on the connection executor, after the current event.
    fn execute(&mut self, terminated: Terminated);
}

/// Why a bridge listens to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listen {
    /// The acknowledgement grants demand for the next unit.
    Demand,
    /// The outcome is only logged.
    Diagnostic,
}

/// The completion signal of a bridge.
#[derive(Debug)]
pub struct Terminated {
    pub promise: CompletionPromise,
    /// The last write issued, the connection can sequence the end of the response after it.
    pub last_write: Option<WriteHandle>,
    pub error: Option<HttpError>,
}

/// Registration for the connection-inactive notification.
///
/// Disposing it is how a terminated bridge unregisters; the connection only notifies
/// registrations that are still live.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispose(&self) {
        self.token.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Resolves the completion future of one response, at most once.
#[derive(Debug, Default)]
pub struct CompletionPromise {
    sender: Option<oneshot::Sender<Result<(), HttpError>>>,
}

impl CompletionPromise {
    pub fn new() -> (Self, oneshot::Receiver<Result<(), HttpError>>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender: Some(sender) }, receiver)
    }

    /// A promise nobody waits for.
    pub fn none() -> Self {
        Self { sender: None }
    }

    pub fn try_success(&mut self) -> bool {
        self.complete(Ok(()))
    }

    pub fn try_failure(&mut self, e: HttpError) -> bool {
        self.complete(Err(e))
    }

    pub fn complete(&mut self, result: Result<(), HttpError>) -> bool {
        match self.sender.take() {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.sender.is_none()
    }
}

type WriteResult = Result<(), SendError>;

/// Resolves once the bytes of one write reached the socket, or failed to.
///
/// Cloneable, every clone observes the same outcome.
#[derive(Clone)]
pub struct WriteHandle {
    inner: Shared<oneshot::Receiver<WriteResult>>,
}

/// The connection side of a [`WriteHandle`].
#[derive(Debug)]
pub struct WriteResolver {
    sender: oneshot::Sender<WriteResult>,
}

pub fn write_handle() -> (WriteHandle, WriteResolver) {
    let (sender, receiver) = oneshot::channel();
    (WriteHandle { inner: receiver.shared() }, WriteResolver { sender })
}

impl WriteHandle {
    /// The outcome, if already known.
    pub fn peek(&self) -> Option<WriteResult> {
        self.inner.peek().map(|result| result.clone().unwrap_or(Err(SendError::Closed)))
    }
}

impl WriteResolver {
    pub fn resolve(self, result: WriteResult) {
        let _ = self.sender.send(result);
    }
}

impl Future for WriteHandle {
    type Output = WriteResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a dropped resolver means the connection went away with the write
        self.inner.poll_unpin(cx).map(|result| result.unwrap_or(Err(SendError::Closed)))
    }
}

impl fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHandle").field("done", &self.peek()).finish()
    }
}

/// The bridge attached to one response, in the strategy the response asked for.
#[derive(Debug)]
pub enum FlushBridge {
    Each(FlushEachSubscriber),
    Last(FlushLastSubscriber),
}

impl FlushBridge {
    pub fn new(flush_each: bool, promise: CompletionPromise) -> Self {
        if flush_each {
            FlushBridge::Each(FlushEachSubscriber::new(promise))
        } else {
            FlushBridge::Last(FlushLastSubscriber::new(promise))
        }
    }

    pub fn on_subscribe<O: Outbound + ?Sized>(&mut self, out: &mut O, subscription: Arc<dyn Subscription>) {
        match self {
            FlushBridge::Each(bridge) => bridge.on_subscribe(out, subscription),
            FlushBridge::Last(bridge) => bridge.on_subscribe(out, subscription),
        }
    }

    pub fn on_next<O: Outbound + ?Sized>(&mut self, out: &mut O, unit: Option<Unit>) -> Result<(), HttpError> {
        match self {
            FlushBridge::Each(bridge) => bridge.on_next(out, unit),
            FlushBridge::Last(bridge) => bridge.on_next(out, unit),
        }
    }

    pub fn on_write_complete(&mut self, listen: Listen, result: WriteResult) {
        match self {
            FlushBridge::Each(bridge) => bridge.on_write_complete(result),
            FlushBridge::Last(bridge) => bridge.on_write_complete(listen, result),
        }
    }

    pub fn on_complete<O: Outbound + ?Sized>(&mut self, out: &mut O) {
        match self {
            FlushBridge::Each(bridge) => bridge.on_complete(out),
            FlushBridge::Last(bridge) => bridge.on_complete(out),
        }
    }

    pub fn on_error<O: Outbound + ?Sized>(&mut self, out: &mut O, e: HttpError) -> Result<(), HttpError> {
        match self {
            FlushBridge::Each(bridge) => bridge.on_error(out, e),
            FlushBridge::Last(bridge) => bridge.on_error(out, e),
        }
    }

    /// Terminates with `e` and cancels the source, for a source that broke the contract.
    pub fn abort<O: Outbound + ?Sized>(&mut self, out: &mut O, e: HttpError) {
        match self {
            FlushBridge::Each(bridge) => bridge.abort(out, e),
            FlushBridge::Last(bridge) => bridge.abort(out, e),
        }
    }

    pub fn on_inactive(&mut self) {
        match self {
            FlushBridge::Each(bridge) => bridge.on_inactive(),
            FlushBridge::Last(bridge) => bridge.on_inactive(),
        }
    }

    /// Whether the bridge already released its subscription.
    pub fn is_terminated(&self) -> bool {
        match self {
            FlushBridge::Each(bridge) => bridge.is_terminated(),
            FlushBridge::Last(bridge) => bridge.is_terminated(),
        }
    }
}

/// Subscription state shared by both strategies.
///
/// The subscription goes from absent to live once, and from live to released once; the inactive
/// registration is disposed on release so the connection never notifies a finished bridge.
#[derive(Debug, Default)]
struct Lifecycle {
    subscription: Option<Arc<dyn Subscription>>,
    inactive: Option<Cancellation>,
    promise: CompletionPromise,
    subscribed: bool,
}

impl Lifecycle {
    fn new(promise: CompletionPromise) -> Self {
        Self { promise, ..Default::default() }
    }

    /// Accepts the first subscription on an open connection, cancels anything else.
    fn accept<O: Outbound + ?Sized>(&mut self, out: &mut O, subscription: Arc<dyn Subscription>) -> Option<Arc<dyn Subscription>> {
        if !out.is_open() {
            debug!("connection closed before the source was subscribed");
            subscription.cancel();
            return None;
        }
        if self.subscribed {
            debug!("bridge already subscribed, cancel the extra subscription");
            subscription.cancel();
            return None;
        }

        self.subscribed = true;
        self.inactive = Some(out.on_inactive());
        self.subscription = Some(Arc::clone(&subscription));
        Some(subscription)
    }

    /// The live subscription, or the reason no unit is accepted.
    fn live(&self, unit: &Option<Unit>) -> Result<Arc<dyn Subscription>, HttpError> {
        if unit.is_none() {
            return Err(HttpError::invalid_argument("outbound unit must not be absent"));
        }
        self.subscription.clone().ok_or_else(|| HttpError::illegal_state("unit received after the stream terminated"))
    }

    /// Releases the subscription; `None` when it was already released.
    fn release(&mut self) -> Option<(Arc<dyn Subscription>, CompletionPromise)> {
        let subscription = self.subscription.take()?;
        if let Some(inactive) = self.inactive.take() {
            inactive.dispose();
        }
        Some((subscription, std::mem::take(&mut self.promise)))
    }

    fn on_inactive(&mut self) {
        self.inactive = None;
        if let Some(subscription) = self.subscription.take() {
            debug!("connection inactive, cancel the source");
            subscription.cancel();
            self.promise.try_failure(HttpError::RemoteClosed);
        }
    }

    fn is_terminated(&self) -> bool {
        self.subscribed && self.subscription.is_none()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A recording [`Outbound`] for bridge tests.

    use super::*;

    #[derive(Debug)]
    pub enum Op {
        Write(Unit),
        Flush,
        Listen(Listen),
        Execute(Terminated),
    }

    #[derive(Debug, Default)]
    pub struct RecordingOutbound {
        pub closed: bool,
        pub fail_writes: bool,
        pub ops: Vec<Op>,
        pub resolvers: Vec<WriteResolver>,
        pub registrations: Vec<Cancellation>,
    }

    impl RecordingOutbound {
        pub fn writes(&self) -> usize {
            self.ops.iter().filter(|op| matches!(op, Op::Write(_))).count()
        }

        pub fn flushes(&self) -> usize {
            self.ops.iter().filter(|op| matches!(op, Op::Flush)).count()
        }

        pub fn terminated(&mut self) -> Vec<Terminated> {
            let mut terminated = Vec::new();
            for op in std::mem::take(&mut self.ops) {
                match op {
                    Op::Execute(t) => terminated.push(t),
                    op => self.ops.push(op),
                }
            }
            terminated
        }
    }

    impl Outbound for RecordingOutbound {
        fn is_open(&self) -> bool {
            !self.closed
        }

        fn send_next(&mut self, unit: Unit) -> Result<Option<WriteHandle>, HttpError> {
            if self.fail_writes {
                return Err(SendError::Closed.into());
            }
            let empty = unit.is_empty();
            self.ops.push(Op::Write(unit));
            if empty {
                return Ok(None);
            }
            let (handle, resolver) = write_handle();
            self.resolvers.push(resolver);
            Ok(Some(handle))
        }

        fn flush(&mut self) {
            self.ops.push(Op::Flush);
        }

        fn listen(&mut self, _handle: WriteHandle, listen: Listen) {
            self.ops.push(Op::Listen(listen));
        }

        fn on_inactive(&mut self) -> Cancellation {
            let cancellation = Cancellation::new();
            self.registrations.push(cancellation.clone());
            cancellation
        }

        fn execute(&mut self, terminated: Terminated) {
            self.ops.push(Op::Execute(terminated));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_handle_clones_share_outcome() {
        let (handle, resolver) = write_handle();
        let other = handle.clone();
        assert!(handle.peek().is_none());

        resolver.resolve(Err(SendError::invalid_body("x")));
        assert!(matches!(handle.await, Err(SendError::InvalidBody { .. })));
        assert!(matches!(other.peek(), Some(Err(SendError::InvalidBody { .. }))));
    }

    #[tokio::test]
    async fn dropped_resolver_reads_as_closed() {
        let (handle, resolver) = write_handle();
        drop(resolver);
        assert!(matches!(handle.await, Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn promise_resolves_once() {
        let (mut promise, receiver) = CompletionPromise::new();
        assert!(promise.try_failure(HttpError::RemoteClosed));
        assert!(!promise.try_success());
        assert!(promise.is_done());
        assert!(matches!(receiver.await, Ok(Err(HttpError::RemoteClosed))));
    }
}
