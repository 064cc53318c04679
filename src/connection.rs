//! Connections and capability lookup.
//!
//! A [`Connection`] is a two-way channel that can be asked, through
//! [`Connection::adapt`], to present itself as one of a small, closed set of
//! [capabilities](Capability): a byte reader, a byte writer, the raw socket,
//! or the parsed HTTP view. Wrappers answer for themselves first and delegate
//! everything else to the connection they wrap, so layers can be stacked
//! without the inner connection knowing about them.
//!
//! Every connection also carries an [`Attributes`] bag that handlers use to
//! cache per-request derived state (cookies, session, routing cursor).
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::http::HttpConnection;

/// What a caller may ask a connection to present itself as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Reader,
    Writer,
    Socket,
    Http,
}

/// A borrowed view of a connection as some capability.
pub enum Adapted<'a> {
    Reader(&'a mut dyn Read),
    Writer(&'a mut dyn Write),
    Socket(&'a TcpStream),
    Http(&'a mut HttpConnection),
}

impl fmt::Debug for Adapted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Adapted::Reader(_) => "Reader",
            Adapted::Writer(_) => "Writer",
            Adapted::Socket(_) => "Socket",
            Adapted::Http(_) => "Http",
        };
        f.debug_tuple("Adapted").field(&name).finish()
    }
}

pub trait Connection: Send {
    /// Present this connection as `cap`, or `None` if nothing in the wrap
    /// chain supports it.
    fn adapt(&mut self, cap: Capability) -> Option<Adapted<'_>>;

    fn close(&mut self) -> io::Result<()>;

    fn is_closed(&self) -> bool;

    fn attributes(&self) -> &Attributes;

    fn attributes_mut(&mut self) -> &mut Attributes;
}

impl dyn Connection + '_ {
    pub fn reader(&mut self) -> Option<&mut dyn Read> {
        match self.adapt(Capability::Reader) {
            Some(Adapted::Reader(r)) => Some(r),
            _ => None,
        }
    }

    pub fn writer(&mut self) -> Option<&mut dyn Write> {
        match self.adapt(Capability::Writer) {
            Some(Adapted::Writer(w)) => Some(w),
            _ => None,
        }
    }

    pub fn socket(&mut self) -> Option<&TcpStream> {
        match self.adapt(Capability::Socket) {
            Some(Adapted::Socket(s)) => Some(s),
            _ => None,
        }
    }

    pub fn http(&mut self) -> Option<&mut HttpConnection> {
        match self.adapt(Capability::Http) {
            Some(Adapted::Http(h)) => Some(h),
            _ => None,
        }
    }
}

/// String-keyed bag of heterogeneous values.
#[derive(Default)]
pub struct Attributes {
    map: HashMap<String, Box<dyn Any + Send>>,
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}

impl Attributes {
    pub fn new() -> Attributes {
        Attributes::default()
    }

    pub fn insert<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.map.insert(key.into(), Box::new(value));
    }

    /// Value stored under `key`, if present and of type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.map.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.map.get_mut(key).and_then(|v| v.downcast_mut())
    }

    /// Remove `key`. The value is returned only if it was of type `T`.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        self.map
            .remove(key)
            .and_then(|v| v.downcast().ok())
            .map(|v| *v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Connection over an accepted TCP socket. This is the innermost link of
/// every chain the socket service builds.
pub struct SocketConnection {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    attributes: Attributes,
    closed: bool,
}

impl SocketConnection {
    pub fn new(stream: TcpStream) -> SocketConnection {
        let peer = stream.peer_addr().ok();
        SocketConnection {
            stream,
            peer,
            attributes: Attributes::new(),
            closed: false,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Connection for SocketConnection {
    fn adapt(&mut self, cap: Capability) -> Option<Adapted<'_>> {
        match cap {
            Capability::Reader => Some(Adapted::Reader(&mut self.stream)),
            Capability::Writer => Some(Adapted::Writer(&mut self.stream)),
            Capability::Socket => Some(Adapted::Socket(&self.stream)),
            Capability::Http => None,
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.stream.flush();
        match self.stream.shutdown(Shutdown::Both) {
            // peer already went away.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }
}

/// Growable output buffer that can be shared with whoever created the
/// connection, so writes stay observable after the connection is boxed.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory connection: reads come from a fixed input buffer, writes are
/// collected. Handy for driving handlers without a socket.
#[derive(Debug, Default)]
pub struct BufferConnection {
    input: Cursor<Vec<u8>>,
    output: SharedBuffer,
    attributes: Attributes,
    closed: bool,
}

impl BufferConnection {
    pub fn new(input: impl Into<Vec<u8>>) -> BufferConnection {
        BufferConnection {
            input: Cursor::new(input.into()),
            ..Default::default()
        }
    }

    /// Everything written to the connection so far.
    pub fn output(&self) -> Vec<u8> {
        self.output.contents()
    }

    /// A handle on the output that outlives moving the connection.
    pub fn output_handle(&self) -> SharedBuffer {
        self.output.clone()
    }
}

impl Connection for BufferConnection {
    fn adapt(&mut self, cap: Capability) -> Option<Adapted<'_>> {
        match cap {
            Capability::Reader => Some(Adapted::Reader(&mut self.input)),
            Capability::Writer => Some(Adapted::Writer(&mut self.output)),
            _ => None,
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }
}
