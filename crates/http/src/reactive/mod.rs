//! Demand-driven sources and the subscriber contract.
//!
//! A [`DemandSource`] emits an ordered sequence of items to exactly one [`Subscriber`], never more
//! items than were requested through the [`Subscription`], and nothing after a cancellation or a
//! terminal signal. The bridge in [`crate::bridge`] is the consumer side of this contract.
//!
//! Sources run on their own tokio task; signals reach the connection through a mailbox, so a
//! subscriber must be `Send`.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::Frame;
use crate::protocol::BoxError;

mod stream_source;

pub use stream_source::{StreamSource, empty, error, from_iter, from_stream, just};

/// Demand unit meaning "unbounded".
pub const UNBOUNDED: u64 = u64::MAX;

/// The link between one source and its subscriber.
#[cfg_attr(test, mockall::automock)]
pub trait Subscription: Debug + Send + Sync {
    /// Grants `n` more items. Grants add up and saturate at [`UNBOUNDED`].
    fn request(&self, n: u64);

    /// Stops the source, nothing is emitted afterwards.
    fn cancel(&self);
}

pub trait Subscriber<T>: Send {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);

    /// An item, `None` stands for an absent item and is a contract violation of the source.
    fn on_next(&mut self, item: Option<T>);

    fn on_error(&mut self, error: BoxError);

    fn on_complete(&mut self);
}

pub trait DemandSource<T>: Send {
    /// Attaches the single subscriber of this source.
    fn subscribe(self: Box<Self>, subscriber: Box<dyn Subscriber<T>>);
}

pub type BoxSource<T> = Box<dyn DemandSource<T>>;

/// One outbound unit of a response body or a websocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// Raw bytes; a binary frame on a websocket, or a text frame in plain-text mode.
    Binary(Bytes),
    /// Text; written as UTF-8 bytes on HTTP and as a text frame on a websocket.
    Text(String),
    /// A ready websocket frame, written as is.
    Frame(Frame),
}

impl Unit {
    pub fn len(&self) -> usize {
        match self {
            Unit::Binary(bytes) => bytes.len(),
            Unit::Text(text) => text.len(),
            Unit::Frame(frame) => frame.payload().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for Unit {
    fn from(bytes: Bytes) -> Self {
        Unit::Binary(bytes)
    }
}

impl From<Vec<u8>> for Unit {
    fn from(bytes: Vec<u8>) -> Self {
        Unit::Binary(bytes.into())
    }
}

impl From<&'static [u8]> for Unit {
    fn from(bytes: &'static [u8]) -> Self {
        Unit::Binary(Bytes::from_static(bytes))
    }
}

impl From<String> for Unit {
    fn from(text: String) -> Self {
        Unit::Text(text)
    }
}

impl From<&str> for Unit {
    fn from(text: &str) -> Self {
        Unit::Text(text.to_owned())
    }
}

impl From<Frame> for Unit {
    fn from(frame: Frame) -> Self {
        Unit::Frame(frame)
    }
}
