//! The outbound half of a connection, as seen from its executor.
//!
//! Writes are encoded into a pending buffer right away. [`Channel::flush`] closes the pending
//! buffer into a batch; batches go to the socket in order, and every [`WriteHandle`] of a batch
//! resolves once that batch was written and flushed.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::bridge::{Cancellation, WriteHandle, WriteResolver, write_handle};
use crate::protocol::SendError;

/// Bytes and the writes they complete.
#[derive(Debug)]
pub(crate) struct FlushBatch {
    pub(crate) bytes: Bytes,
    pub(crate) resolvers: Vec<WriteResolver>,
}

impl FlushBatch {
    pub(crate) fn resolve(self, result: Result<(), SendError>) {
        for resolver in self.resolvers {
            resolver.resolve(result.clone());
        }
    }
}

#[derive(Debug)]
pub(crate) struct Channel {
    open: bool,
    closing: bool,
    pending: BytesMut,
    unflushed: Vec<WriteResolver>,
    batches: VecDeque<FlushBatch>,
    inactive: Vec<Cancellation>,
}

impl Channel {
    pub(crate) fn new() -> Self {
        Self {
            open: true,
            closing: false,
            pending: BytesMut::new(),
            unflushed: Vec::new(),
            batches: VecDeque::new(),
            inactive: Vec::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open && !self.closing
    }

    /// Encodes one write; `None` when the encoder produced no bytes.
    pub(crate) fn write<F>(&mut self, encode: F) -> Result<Option<WriteHandle>, SendError>
    where
        F: FnOnce(&mut BytesMut) -> Result<(), SendError>,
    {
        if !self.is_open() {
            return Err(SendError::Closed);
        }

        let before = self.pending.len();
        encode(&mut self.pending)?;
        if self.pending.len() == before {
            return Ok(None);
        }

        let (handle, resolver) = write_handle();
        self.unflushed.push(resolver);
        Ok(Some(handle))
    }

    pub(crate) fn flush(&mut self) {
        if self.pending.is_empty() && self.unflushed.is_empty() {
            return;
        }
        let bytes = self.pending.split().freeze();
        trace!(size = bytes.len(), "flush batch");
        self.batches.push_back(FlushBatch { bytes, resolvers: std::mem::take(&mut self.unflushed) });
    }

    pub(crate) fn has_batches(&self) -> bool {
        !self.batches.is_empty()
    }

    pub(crate) fn next_batch(&mut self) -> Option<FlushBatch> {
        self.batches.pop_front()
    }

    pub(crate) fn on_inactive(&mut self) -> Cancellation {
        self.inactive.retain(|registration| !registration.is_disposed());
        let registration = Cancellation::new();
        self.inactive.push(registration.clone());
        registration
    }

    /// Refuses new writes; the connection ends once the queued batches are written.
    pub(crate) fn close_after_flush(&mut self) {
        self.flush();
        self.closing = true;
    }

    /// Whether the connection can end: closing and nothing left to write.
    pub(crate) fn is_drained(&self) -> bool {
        !self.open || (self.closing && self.batches.is_empty())
    }

    /// Marks the channel closed and fails every write that did not reach the socket.
    ///
    /// Returns `true` exactly once when a live inactive registration existed.
    pub(crate) fn close(&mut self, cause: SendError) -> bool {
        self.open = false;
        for resolver in self.unflushed.drain(..) {
            resolver.resolve(Err(cause.clone()));
        }
        self.pending.clear();
        for batch in self.batches.drain(..) {
            batch.resolve(Err(cause.clone()));
        }

        let mut notify = false;
        for registration in self.inactive.drain(..) {
            if !registration.is_disposed() {
                registration.dispose();
                notify = true;
            }
        }
        notify
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[tokio::test]
    async fn close_fails_queued_writes_and_notifies_once() {
        let mut channel = Channel::new();
        let registration = channel.on_inactive();

        let flushed = channel.write(|dst| Ok(dst.put_slice(b"a"))).unwrap().unwrap();
        channel.flush();
        let unflushed = channel.write(|dst| Ok(dst.put_slice(b"b"))).unwrap().unwrap();
        assert!(channel.write(|_| Ok(())).unwrap().is_none());

        assert!(channel.close(SendError::Closed));
        assert!(registration.is_disposed());
        assert!(!channel.close(SendError::Closed));

        assert!(matches!(flushed.await, Err(SendError::Closed)));
        assert!(matches!(unflushed.await, Err(SendError::Closed)));
        assert!(matches!(channel.write(|dst| Ok(dst.put_slice(b"c"))), Err(SendError::Closed)));
    }

    #[test]
    fn disposed_registration_is_not_notified() {
        let mut channel = Channel::new();
        channel.on_inactive().dispose();
        assert!(!channel.close(SendError::Closed));
    }

    #[test]
    fn flush_groups_writes() {
        let mut channel = Channel::new();
        channel.write(|dst| Ok(dst.put_slice(b"head"))).unwrap();
        channel.write(|dst| Ok(dst.put_slice(b"body"))).unwrap();
        channel.flush();
        channel.flush();

        let batch = channel.next_batch().unwrap();
        assert_eq!(&batch.bytes[..], b"headbody");
        assert_eq!(batch.resolvers.len(), 2);
        assert!(!channel.has_batches());
    }
}
