//! Core HTTP protocol abstractions.
//!
//! - **Message Handling** ([`Message`], [`PayloadItem`], [`PayloadSize`]): heads, payload
//!   chunks, the terminal empty-content marker and the framing of a payload
//! - **Request** ([`RequestHeader`]): the immutable decoded request line and headers
//! - **Response** ([`ResponseState`], [`ResponseHead`]): outbound status and headers, mutable
//!   until they are sent
//! - **Cookies** ([`Cookies`]): request cookie cache
//! - **Body Streaming** ([`body`]): the inbound body stream
//! - **Error Handling** ([`HttpError`], [`ParseError`], [`SendError`])

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;
pub(crate) use request::contains_token;

mod response;
pub use response::ResponseHead;
pub use response::ResponseState;

mod cookie;
pub use cookie::Cookies;

mod error;
pub use error::BoxError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

pub mod body;
