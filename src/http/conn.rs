//
// The HTTP view of a connection.
//
// HttpConnection wraps another connection, parses request heads off it,
// serves request bodies through a BodyDecoder and writes responses back,
// chunk-encoding them when no length is known up front.
//
use std::io::{self, ErrorKind, Read, Write};

use headers::HeaderMapExt;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING,
};
use http::{Method, StatusCode, Uri, Version};

use crate::connection::{Adapted, Attributes, Capability, Connection};
use crate::errors::{KitError, KitResult};
use crate::http::cookie::{parse_request_cookies, Cookie, CookieBuffer};
use crate::http::stream::{BodyDecoder, ChunkedWriter, Framing, DEFAULT_BUFFER_SIZE};

const MAX_LINE_LEN: usize = 8192;
const MAX_HEADERS: usize = 100;

/// Request line and headers of the current request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    None,
    Raw,
    Chunked,
}

#[derive(Debug)]
struct Response {
    status: StatusCode,
    headers: HeaderMap,
    cookies: CookieBuffer,
    mode: Option<BodyMode>,
    finished: bool,
}

impl Response {
    fn new() -> Response {
        Response {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            cookies: CookieBuffer::default(),
            mode: None,
            finished: false,
        }
    }
}

pub struct HttpConnection {
    inner: Box<dyn Connection>,
    decoder: BodyDecoder,
    request: Option<RequestHead>,
    request_cookies: Option<Vec<(String, String)>>,
    response: Response,
    // per-request attributes, cleared by read_request.
    attributes: Attributes,
}

fn inner_reader<'a>(inner: &'a mut dyn Connection) -> io::Result<&'a mut dyn Read> {
    match inner.adapt(Capability::Reader) {
        Some(Adapted::Reader(r)) => Ok(r),
        _ => Err(io::Error::new(ErrorKind::Unsupported, "connection is not readable")),
    }
}

fn inner_writer<'a>(inner: &'a mut dyn Connection) -> io::Result<&'a mut dyn Write> {
    match inner.adapt(Capability::Writer) {
        Some(Adapted::Writer(w)) => Ok(w),
        _ => Err(io::Error::new(ErrorKind::Unsupported, "connection is not writable")),
    }
}

impl HttpConnection {
    pub fn new(inner: Box<dyn Connection>) -> HttpConnection {
        HttpConnection::with_buffer_size(inner, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(inner: Box<dyn Connection>, size: usize) -> HttpConnection {
        HttpConnection {
            inner,
            decoder: BodyDecoder::new(Framing::Length(0), size),
            request: None,
            request_cookies: None,
            response: Response::new(),
            attributes: Attributes::new(),
        }
    }

    /// Read the next request head. Any unread part of the previous request
    /// body is discarded, and the response state and request attributes
    /// are reset.
    ///
    /// Returns `Ok(false)` if the peer closed the connection cleanly before
    /// sending another request.
    pub fn read_request(&mut self) -> KitResult<bool> {
        if self.request.is_some() {
            io::copy(self, &mut io::sink())?;
        }
        self.request = None;
        self.request_cookies = None;
        self.response = Response::new();
        self.attributes = Attributes::new();
        self.decoder.reset(Framing::Length(0));

        let reader = inner_reader(&mut *self.inner)?;

        // RFC 7230 3.5: ignore empty lines before the request line.
        let line = loop {
            match self.decoder.read_line(reader, MAX_LINE_LEN).map_err(head_error)? {
                None => return Ok(false),
                Some(l) if l.is_empty() => continue,
                Some(l) => break l,
            }
        };
        let (method, uri, version) = parse_request_line(&line)?;

        let mut headers = HeaderMap::new();
        loop {
            let line = self
                .decoder
                .read_line(reader, MAX_LINE_LEN)
                .map_err(head_error)?
                .ok_or_else(bad_request)?;
            if line.is_empty() {
                break;
            }
            if headers.len() >= MAX_HEADERS {
                return Err(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE.into());
            }
            let (name, value) = parse_header_line(&line)?;
            headers.append(name, value);
        }

        let framing = request_framing(&headers)?;
        debug!("{} {} {:?} body {:?}", method, uri, version, framing);
        self.decoder.reset(framing);
        self.request = Some(RequestHead {
            method,
            uri,
            version,
            headers,
        });
        Ok(true)
    }

    pub fn request(&self) -> Option<&RequestHead> {
        self.request.as_ref()
    }

    pub fn method(&self) -> Option<&Method> {
        self.request.as_ref().map(|r| &r.method)
    }

    /// Path of the request URI, as sent (not decoded).
    pub fn path(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.uri.path())
    }

    pub fn query(&self) -> Option<&str> {
        self.request.as_ref().and_then(|r| r.uri.query())
    }

    pub fn version(&self) -> Version {
        self.request
            .as_ref()
            .map(|r| r.version)
            .unwrap_or(Version::HTTP_11)
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.request.as_ref().map(|r| &r.headers)
    }

    /// First value of a request header, if it is valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()?.get(name)?.to_str().ok()
    }

    /// Request cookies, parsed on first use.
    pub fn request_cookies(&mut self) -> &[(String, String)] {
        if self.request_cookies.is_none() {
            let parsed = self
                .headers()
                .map(parse_request_cookies)
                .unwrap_or_default();
            self.request_cookies = Some(parsed);
        }
        self.request_cookies.as_deref().unwrap_or_default()
    }

    pub fn cookie(&mut self, name: &str) -> Option<&str> {
        self.request_cookies()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Should the connection stay open after this exchange?
    ///
    /// False if the response says `Connection: close`, which is also the
    /// case when an HTTP/1.0 body is delimited by closing the connection.
    pub fn keep_alive(&self) -> bool {
        let req = match self.request {
            Some(ref r) => r,
            None => return false,
        };
        let closing = self
            .response
            .headers
            .typed_get::<headers::Connection>()
            .map_or(false, |c| c.contains("close"));
        if closing {
            return false;
        }
        let conn = req.headers.typed_get::<headers::Connection>();
        match req.version {
            Version::HTTP_11 => !conn.map(|c| c.contains("close")).unwrap_or(false),
            Version::HTTP_10 => conn.map(|c| c.contains("keep-alive")).unwrap_or(false),
            _ => false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.response.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if self.is_committed() {
            warn!("status {} set after response was committed", status);
        }
        self.response.status = status;
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response.headers
    }

    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.response.headers
    }

    /// Queue a response cookie. Returns false if it can no longer be sent.
    pub fn add_cookie(&mut self, cookie: Cookie) -> bool {
        if self.is_committed() {
            warn!("cookie {} set after response was committed", cookie.name);
            return false;
        }
        self.response.cookies.add(cookie)
    }

    pub fn pending_cookies(&self) -> &[Cookie] {
        self.response.cookies.pending()
    }

    pub fn is_committed(&self) -> bool {
        self.response.mode.is_some()
    }

    /// Write the response head. Idempotent.
    pub fn commit(&mut self) -> KitResult<()> {
        if self.is_committed() {
            return Ok(());
        }
        let version = self.version();
        let keep_alive = self.keep_alive();
        let status = self.response.status;
        let is_head = self.method() == Some(&Method::HEAD);
        let res = &mut self.response;
        res.cookies.flush_into(&mut res.headers);

        let mode = if is_head
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            BodyMode::None
        } else if res.headers.contains_key(CONTENT_LENGTH) {
            BodyMode::Raw
        } else if version == Version::HTTP_11 {
            res.headers
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            BodyMode::Chunked
        } else {
            res.headers
                .typed_insert(headers::Connection::close());
            BodyMode::Raw
        };
        if keep_alive && version == Version::HTTP_10 && !res.headers.contains_key(CONNECTION) {
            res.headers.typed_insert(headers::Connection::keep_alive());
        }

        let mut head = Vec::with_capacity(256);
        let v = if version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" };
        write!(
            head,
            "{} {} {}\r\n",
            v,
            status.as_str(),
            status.canonical_reason().unwrap_or("")
        )?;
        for (name, value) in res.headers.iter() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        res.mode = Some(mode);

        let w = inner_writer(&mut *self.inner)?;
        w.write_all(&head)?;
        trace!("response head written: {}", status);
        Ok(())
    }

    /// Commit if needed and end the response body.
    pub fn finish(&mut self) -> KitResult<()> {
        self.commit()?;
        if self.response.finished {
            return Ok(());
        }
        self.response.finished = true;
        let chunked = self.response.mode == Some(BodyMode::Chunked);
        let w = inner_writer(&mut *self.inner)?;
        if chunked {
            ChunkedWriter::new(&mut *w).finish()?;
        }
        w.flush()?;
        Ok(())
    }

    /// Send a complete response with a fixed body.
    pub fn send(&mut self, status: StatusCode, body: &[u8]) -> KitResult<()> {
        self.set_status(status);
        self.response.headers.typed_insert(headers::ContentLength(body.len() as u64));
        self.commit()?;
        self.write_all(body)?;
        self.finish()
    }

    /// Send an error response, unless a response is already under way.
    pub fn send_error(&mut self, err: &KitError) -> KitResult<()> {
        if self.is_committed() {
            return Ok(());
        }
        if err.must_close() {
            self.response.headers.typed_insert(headers::Connection::close());
        }
        self.send(err.statuscode(), b"")
    }

    pub fn into_inner(self) -> Box<dyn Connection> {
        self.inner
    }
}

fn bad_request() -> KitError {
    KitError::Http(StatusCode::BAD_REQUEST)
}

// a head cut short is the client's fault.
fn head_error(e: io::Error) -> KitError {
    if e.kind() == ErrorKind::UnexpectedEof {
        bad_request()
    } else {
        e.into()
    }
}

fn parse_request_line(line: &[u8]) -> KitResult<(Method, Uri, Version)> {
    let line = std::str::from_utf8(line).map_err(|_| bad_request())?;
    let mut parts = line.split_ascii_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err(bad_request()),
    };
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| bad_request())?;
    let uri = target.parse::<Uri>().map_err(|_| bad_request())?;
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        _ => return Err(StatusCode::HTTP_VERSION_NOT_SUPPORTED.into()),
    };
    Ok((method, uri, version))
}

fn parse_header_line(line: &[u8]) -> KitResult<(HeaderName, HeaderValue)> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(bad_request)?;
    let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| bad_request())?;
    let value = trim_ows(&line[colon + 1..]);
    let value = HeaderValue::from_bytes(value).map_err(|_| bad_request())?;
    Ok((name, value))
}

fn trim_ows(mut v: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = v {
        v = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = v {
        v = rest;
    }
    v
}

fn request_framing(headers: &HeaderMap) -> KitResult<Framing> {
    if headers.contains_key(TRANSFER_ENCODING) {
        return match headers.typed_get::<headers::TransferEncoding>() {
            Some(te) if te.is_chunked() => Ok(Framing::Chunked),
            _ => Err(StatusCode::NOT_IMPLEMENTED.into()),
        };
    }
    if headers.contains_key(CONTENT_LENGTH) {
        return match headers.typed_get::<headers::ContentLength>() {
            Some(headers::ContentLength(n)) => Ok(Framing::Length(n)),
            None => Err(bad_request()),
        };
    }
    Ok(Framing::Length(0))
}

impl Read for HttpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.request.is_none() {
            return Ok(0);
        }
        let reader = inner_reader(&mut *self.inner)?;
        self.decoder.read(reader, buf)
    }
}

impl Write for HttpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.commit()?;
        if self.response.finished {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "response already finished"));
        }
        let mode = self.response.mode;
        let w = inner_writer(&mut *self.inner)?;
        match mode {
            Some(BodyMode::Chunked) => ChunkedWriter::new(&mut *w).write(buf),
            Some(BodyMode::None) => Ok(buf.len()),
            _ => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        inner_writer(&mut *self.inner)?.flush()
    }
}

impl Connection for HttpConnection {
    fn adapt(&mut self, cap: Capability) -> Option<Adapted<'_>> {
        match cap {
            Capability::Http => Some(Adapted::Http(self)),
            Capability::Reader => Some(Adapted::Reader(self)),
            Capability::Writer => Some(Adapted::Writer(self)),
            _ => self.inner.adapt(cap),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.is_committed() && !self.response.finished {
            if let Err(e) = self.finish() {
                debug!("finishing response on close: {}", e);
            }
        }
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }
}
