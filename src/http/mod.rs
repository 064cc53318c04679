//! HTTP/1.1 plumbing: body framing, `Range` handling, cookies, and the
//! HTTP view of a [`Connection`](crate::Connection).
pub mod cookie;
pub mod range;
pub mod stream;

mod conn;
mod handler;

pub use self::conn::{HttpConnection, RequestHead};
pub use self::cookie::Cookie;
pub use self::handler::HttpHandler;
pub use self::range::Ranges;
pub use self::stream::{ChunkedWriter, Framing, HttpInputStream};
