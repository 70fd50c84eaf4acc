use std::sync::Arc;

use tracing::{Level, debug, error};

use crate::bridge::{CompletionPromise, Lifecycle, Listen, Outbound, Terminated, WriteHandle};
use crate::protocol::{HttpError, SendError};
use crate::reactive::{Subscription, UNBOUNDED, Unit};

/// Requests everything up front, writes without flushing and flushes once at the end.
///
/// A failed write does not stop the stream; with debug logging enabled every write is observed
/// and failures are counted as undelivered units. The error surfaces when the final flush is
/// written.
#[derive(Debug, Default)]
pub struct FlushLastSubscriber {
    lifecycle: Lifecycle,
    last_write: Option<WriteHandle>,
    undelivered: usize,
}

impl FlushLastSubscriber {
    pub fn new(promise: CompletionPromise) -> Self {
        Self { lifecycle: Lifecycle::new(promise), ..Default::default() }
    }

    pub fn on_subscribe<O: Outbound + ?Sized>(&mut self, out: &mut O, subscription: Arc<dyn Subscription>) {
        if let Some(subscription) = self.lifecycle.accept(out, subscription) {
            subscription.request(UNBOUNDED);
        }
    }

    pub fn on_next<O: Outbound + ?Sized>(&mut self, out: &mut O, unit: Option<Unit>) -> Result<(), HttpError> {
        self.lifecycle.live(&unit)?;
        let Some(unit) = unit else {
            return Ok(());
        };

        match out.send_next(unit) {
            Ok(Some(handle)) => {
                if tracing::enabled!(Level::DEBUG) {
                    out.listen(handle.clone(), Listen::Diagnostic);
                }
                self.last_write = Some(handle);
            }
            Ok(None) => {}
            Err(e) => {
                error!(cause = %e, "failed to write outbound unit");
                self.abort(out, e);
            }
        }
        Ok(())
    }

    pub fn on_write_complete(&mut self, listen: Listen, result: Result<(), SendError>) {
        if let (Listen::Diagnostic, Err(e)) = (listen, result) {
            self.undelivered += 1;
            debug!(cause = %e, undelivered = self.undelivered, "outbound unit not delivered");
        }
    }

    pub fn on_complete<O: Outbound + ?Sized>(&mut self, out: &mut O) {
        self.terminate(out, None);
    }

    pub fn on_error<O: Outbound + ?Sized>(&mut self, out: &mut O, e: HttpError) -> Result<(), HttpError> {
        if self.lifecycle.subscription.is_none() {
            return Err(HttpError::illegal_state(format!("error after the stream terminated: {e}")));
        }
        self.terminate(out, Some(e));
        Ok(())
    }

    pub fn abort<O: Outbound + ?Sized>(&mut self, out: &mut O, e: HttpError) {
        if let Some(subscription) = self.terminate(out, Some(e)) {
            subscription.cancel();
        }
    }

    pub fn on_inactive(&mut self) {
        self.lifecycle.on_inactive();
    }

    pub fn is_terminated(&self) -> bool {
        self.lifecycle.is_terminated()
    }

    /// Units whose write failed, only counted while debug logging is enabled.
    pub fn undelivered(&self) -> usize {
        self.undelivered
    }

    fn terminate<O: Outbound + ?Sized>(&mut self, out: &mut O, error: Option<HttpError>) -> Option<Arc<dyn Subscription>> {
        let (subscription, promise) = self.lifecycle.release()?;
        out.flush();
        out.execute(Terminated { promise, last_write: self.last_write.take(), error });
        Some(subscription)
    }
}
