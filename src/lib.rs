//! ## Blocking HTTP/WebDAV server toolkit
//!
//! The pieces of a small HTTP/1.1 and WebDAV server, built on plain threads
//! and blocking sockets:
//!
//! - a [socket service][SocketService] that accepts connections and hands
//!   each one to a [`ConnectionHandler`] on a worker thread,
//! - [connections][Connection] that can be asked to present themselves as
//!   a reader, a writer, the raw socket or an [HTTP view][HttpConnection],
//!   with wrappers stacked on top of each other,
//! - an HTTP stream layer: chunked and fixed-length request bodies,
//!   chunked responses, [`Range`](crate::http::range) parsing and `Content-Range`
//!   formatting, cookies,
//! - a [routing layer][Selector] that walks an ordered list of
//!   [matchers][Matcher] and rewrites the path left to route as it descends
//!   into nested handlers,
//! - cookie-identified [sessions][SessionManager] with idle-timeout sweeping,
//! - an in-memory WebDAV [lock table][LockTable] that issues
//!   `opaquelocktoken:` tokens and enforces shared/exclusive scope,
//! - a [lifecycle state machine][Lifecycle] shared by long-lived components.
//!
//! There is no filesystem layer and no XML: WebDAV method handling is up to
//! the handlers you plug in.
//!
//! ## Example.
//!
//! A server that says hello under `/hello` and counts visits per session.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dav_kit::{
//!     Connection, HttpHandler, KitResult, PrefixMatcher, Selector, ServiceBuilder,
//!     SessionKey, SessionManager,
//! };
//! use http::StatusCode;
//!
//! let sessions = Arc::new(SessionManager::default());
//! let hello = move |conn: &mut dyn Connection| -> KitResult<()> {
//!     let session = sessions.find_session(SessionKey::Connection(&mut *conn), true);
//!     let visits = session.map_or(0, |s| {
//!         let n = s.get::<u64>("visits").map_or(1, |n| *n + 1);
//!         s.set("visits", n);
//!         n
//!     });
//!     let http = conn.http().expect("http view");
//!     http.send(StatusCode::OK, format!("hello #{}\n", visits).as_bytes())
//! };
//!
//! let selector = Selector::new().route(PrefixMatcher::new("/hello"), hello, true);
//! let service = ServiceBuilder::new(HttpHandler::new(selector))
//!     .port(4918)
//!     .pool_size(16)
//!     .http()
//!     .build();
//! service.create().unwrap();
//! service.start().unwrap();
//! println!("listening on port {:?}", service.port());
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

mod connection;
mod errors;
mod lifecycle;
mod service;
mod util;

pub mod http;
pub mod locks;
pub mod routing;
pub mod session;

pub use crate::connection::{
    Adapted, Attributes, BufferConnection, Capability, Connection, SharedBuffer, SocketConnection,
};
pub use crate::errors::{KitError, KitResult};
pub use crate::http::{HttpConnection, HttpHandler};
pub use crate::lifecycle::{ComponentState, Lifecycle, LifecycleListener, DEFAULT_DESTROY_WAIT};
pub use crate::locks::{Depth, Lock, LockScope, LockTable, LockTableConfig, LockType};
pub use crate::routing::{
    Matcher, PatternMatcher, PrefixMatcher, RoutedPath, Selector, WelcomeFileMatcher,
};
pub use crate::service::{ConnectionHandler, ConnectionWrapper, ServiceBuilder, SocketService};
pub use crate::session::{Session, SessionConfig, SessionKey, SessionManager};
pub use crate::util::normalize_path;
