use std::sync::Arc;

use tracing::{debug, error};

use crate::bridge::{CompletionPromise, Lifecycle, Listen, Outbound, Terminated};
use crate::protocol::{HttpError, SendError};
use crate::reactive::{Subscription, Unit};

/// Writes and flushes every unit, one unit in flight at a time.
///
/// Demand for the next unit is only granted once the write of the previous unit was
/// acknowledged, so the source is paced by the socket.
#[derive(Debug, Default)]
pub struct FlushEachSubscriber {
    lifecycle: Lifecycle,
}

impl FlushEachSubscriber {
    pub fn new(promise: CompletionPromise) -> Self {
        Self { lifecycle: Lifecycle::new(promise) }
    }

    pub fn on_subscribe<O: Outbound + ?Sized>(&mut self, out: &mut O, subscription: Arc<dyn Subscription>) {
        if let Some(subscription) = self.lifecycle.accept(out, subscription) {
            subscription.request(1);
        }
    }

    pub fn on_next<O: Outbound + ?Sized>(&mut self, out: &mut O, unit: Option<Unit>) -> Result<(), HttpError> {
        let subscription = self.lifecycle.live(&unit)?;
        let Some(unit) = unit else {
            return Ok(());
        };

        match out.send_next(unit) {
            Ok(Some(handle)) => {
                out.listen(handle, Listen::Demand);
                out.flush();
            }
            Ok(None) => {
                out.flush();
                subscription.request(1);
            }
            Err(e) => {
                error!(cause = %e, "failed to write outbound unit");
                self.abort(out, e);
            }
        }
        Ok(())
    }

    /// The write of the last unit finished.
    pub fn on_write_complete(&mut self, result: Result<(), SendError>) {
        match result {
            Ok(()) => {
                if let Some(subscription) = &self.lifecycle.subscription {
                    subscription.request(1);
                }
            }
            Err(e) => {
                debug!(cause = %e, "write failed, stop requesting");
                self.lifecycle.promise.try_failure(e.into());
            }
        }
    }

    pub fn on_complete<O: Outbound + ?Sized>(&mut self, out: &mut O) {
        if let Some((_, promise)) = self.lifecycle.release() {
            out.execute(Terminated { promise, last_write: None, error: None });
        }
    }

    pub fn on_error<O: Outbound + ?Sized>(&mut self, out: &mut O, e: HttpError) -> Result<(), HttpError> {
        let Some((_, promise)) = self.lifecycle.release() else {
            return Err(HttpError::illegal_state(format!("error after the stream terminated: {e}")));
        };
        out.execute(Terminated { promise, last_write: None, error: Some(e) });
        Ok(())
    }

    pub fn abort<O: Outbound + ?Sized>(&mut self, out: &mut O, e: HttpError) {
        if let Some((subscription, promise)) = self.lifecycle.release() {
            out.execute(Terminated { promise, last_write: None, error: Some(e) });
            subscription.cancel();
        }
    }

    pub fn on_inactive(&mut self) {
        self.lifecycle.on_inactive();
    }

    pub fn is_terminated(&self) -> bool {
        self.lifecycle.is_terminated()
    }
}
