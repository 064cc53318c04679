//! Framing-aware HTTP body streams.
//!
//! [`HttpInputStream`] strips HTTP/1.1 framing off a byte source: it caps
//! reads at a declared `Content-Length`, or decodes `Transfer-Encoding:
//! chunked`. Whatever the framing, and whether or not buffering is enabled,
//! the bytes produced by any sequence of reads are exactly the payload.
//!
//! The decoding state lives in [`BodyDecoder`], separate from the reader, so
//! that [`HttpConnection`](super::HttpConnection) can keep the state across
//! requests while borrowing its underlying connection per call.
use std::io::{self, ErrorKind, Read, Write};

use bytes::{Buf, Bytes, BytesMut};

/// Default size of the read-ahead buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

// Upper bound for a chunk-size or trailer line.
const MAX_LINE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No framing: read until the underlying source is exhausted.
    Identity,
    /// Exactly this many bytes.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    // expecting a chunk-size line.
    Size,
    // inside chunk data, this many bytes left.
    Data(u64),
    // after chunk data, expecting CRLF.
    DataEnd,
    Done,
}

/// Decoding state plus read-ahead buffer.
#[derive(Debug)]
pub struct BodyDecoder {
    framing: Framing,
    remaining: u64,
    chunk: ChunkState,
    buf: BytesMut,
    capacity: usize,
}

impl BodyDecoder {
    /// A decoder with a read-ahead buffer of `capacity` bytes (0 disables buffering).
    pub fn new(framing: Framing, capacity: usize) -> BodyDecoder {
        let mut this = BodyDecoder {
            framing: Framing::Identity,
            remaining: 0,
            chunk: ChunkState::Size,
            buf: BytesMut::with_capacity(capacity),
            capacity,
        };
        this.reset(framing);
        this
    }

    /// Start decoding a new body, keeping any already-buffered bytes.
    pub fn reset(&mut self, framing: Framing) {
        self.framing = framing;
        self.remaining = match framing {
            Framing::Length(n) => n,
            _ => 0,
        };
        self.chunk = ChunkState::Size;
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Bytes read ahead from the source but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Take the read-ahead bytes out of the decoder.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Whether the current body has been read to its end.
    pub fn is_done(&self) -> bool {
        match self.framing {
            Framing::Identity => false,
            Framing::Length(_) => self.remaining == 0,
            Framing::Chunked => self.chunk == ChunkState::Done,
        }
    }

    // Read raw (still framed) bytes, going through the buffer.
    fn read_raw<R: Read + ?Sized>(&mut self, inner: &mut R, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buf.is_empty() {
            // Large reads, or no buffer at all: skip the copy.
            if out.len() >= self.capacity {
                return inner.read(out);
            }
            self.buf.resize(self.capacity, 0);
            let n = match inner.read(&mut self.buf[..]) {
                Ok(n) => n,
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            };
            self.buf.truncate(n);
            trace!("buffer fill: {} bytes", n);
        }
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(n)
    }

    fn read_byte<R: Read + ?Sized>(&mut self, inner: &mut R) -> io::Result<Option<u8>> {
        let mut b = [0u8; 1];
        loop {
            match self.read_raw(inner, &mut b) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(b[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one CRLF (or bare LF) terminated line, without the terminator.
    /// Returns `None` on a clean end of input before any byte was read.
    pub fn read_line<R: Read + ?Sized>(
        &mut self,
        inner: &mut R,
        max_len: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        loop {
            match self.read_byte(inner)? {
                None if line.is_empty() => return Ok(None),
                None => return Err(ErrorKind::UnexpectedEof.into()),
                Some(b'\n') => {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(Some(line));
                }
                Some(b) => {
                    if line.len() >= max_len {
                        return Err(invalid("line too long"));
                    }
                    line.push(b);
                }
            }
        }
    }

    fn expect_crlf<R: Read + ?Sized>(&mut self, inner: &mut R) -> io::Result<()> {
        let mut b = self.read_byte(inner)?;
        if b == Some(b'\r') {
            b = self.read_byte(inner)?;
        }
        match b {
            Some(b'\n') => Ok(()),
            Some(_) => Err(invalid("missing CRLF after chunk data")),
            None => Err(ErrorKind::UnexpectedEof.into()),
        }
    }

    /// Read decoded body bytes into `out`. Returns 0 at the end of the body.
    pub fn read<R: Read + ?Sized>(&mut self, inner: &mut R, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        match self.framing {
            Framing::Identity => self.read_raw(inner, out),
            Framing::Length(_) => {
                if self.remaining == 0 {
                    return Ok(0);
                }
                let max = clamp(out.len(), self.remaining);
                let n = self.read_raw(inner, &mut out[..max])?;
                if n == 0 {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("body ended with {} bytes missing", self.remaining),
                    ));
                }
                self.remaining -= n as u64;
                Ok(n)
            }
            Framing::Chunked => self.read_chunked(inner, out),
        }
    }

    fn read_chunked<R: Read + ?Sized>(&mut self, inner: &mut R, out: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.chunk {
                ChunkState::Done => return Ok(0),
                ChunkState::DataEnd => {
                    self.expect_crlf(inner)?;
                    self.chunk = ChunkState::Size;
                }
                ChunkState::Size => {
                    let line = self
                        .read_line(inner, MAX_LINE_LEN)?
                        .ok_or_else(|| io::Error::from(ErrorKind::UnexpectedEof))?;
                    let size = parse_chunk_size(&line)?;
                    trace!("chunk size {}", size);
                    if size == 0 {
                        self.skip_trailers(inner)?;
                        self.chunk = ChunkState::Done;
                        return Ok(0);
                    }
                    self.chunk = ChunkState::Data(size);
                }
                ChunkState::Data(left) => {
                    let max = clamp(out.len(), left);
                    let n = self.read_raw(inner, &mut out[..max])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            ErrorKind::UnexpectedEof,
                            "chunk data truncated",
                        ));
                    }
                    let left = left - n as u64;
                    self.chunk = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                    return Ok(n);
                }
            }
        }
    }

    // Trailer headers after the last chunk are read and dropped, up to the
    // empty line that ends the body.
    fn skip_trailers<R: Read + ?Sized>(&mut self, inner: &mut R) -> io::Result<()> {
        loop {
            match self.read_line(inner, MAX_LINE_LEN)? {
                Some(line) if line.is_empty() => return Ok(()),
                Some(_) => {}
                None => return Err(ErrorKind::UnexpectedEof.into()),
            }
        }
    }
}

fn clamp(len: usize, limit: u64) -> usize {
    usize::try_from(limit).map_or(len, |l| len.min(l))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg.to_string())
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let end = line.iter().position(|&b| b == b';').unwrap_or(line.len());
    let hex = std::str::from_utf8(&line[..end])
        .map_err(|_| invalid("chunk size is not ASCII"))?
        .trim();
    if hex.is_empty() || hex.len() > 16 {
        return Err(invalid("bad chunk size"));
    }
    u64::from_str_radix(hex, 16).map_err(|_| invalid("bad chunk size"))
}

/// A `Read` adapter that removes HTTP body framing from `inner`.
#[derive(Debug)]
pub struct HttpInputStream<R> {
    inner: R,
    decoder: BodyDecoder,
}

impl<R: Read> HttpInputStream<R> {
    pub fn new(inner: R, framing: Framing) -> HttpInputStream<R> {
        HttpInputStream::with_buffer_size(inner, framing, DEFAULT_BUFFER_SIZE)
    }

    /// Buffer size 0 means unbuffered: every read goes straight to `inner`.
    pub fn with_buffer_size(inner: R, framing: Framing, size: usize) -> HttpInputStream<R> {
        HttpInputStream {
            inner,
            decoder: BodyDecoder::new(framing, size),
        }
    }

    pub fn is_done(&self) -> bool {
        self.decoder.is_done()
    }

    /// Return the source and any bytes read ahead beyond what was consumed.
    pub fn into_parts(mut self) -> (R, Bytes) {
        let rest = self.decoder.take_buffered();
        (self.inner, rest)
    }
}

impl<R: Read> Read for HttpInputStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decoder.read(&mut self.inner, buf)
    }
}

/// Writes its input as HTTP chunks. Empty writes produce no chunk, since a
/// zero-sized chunk would end the body; call [`ChunkedWriter::finish`] for that.
#[derive(Debug)]
pub struct ChunkedWriter<W: Write> {
    inner: W,
    finished: bool,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W) -> ChunkedWriter<W> {
        ChunkedWriter {
            inner,
            finished: false,
        }
    }

    /// Write the terminating zero-sized chunk. Idempotent.
    pub fn finish(&mut self) -> io::Result<()> {
        if !self.finished {
            self.finished = true;
            self.inner.write_all(b"0\r\n\r\n")?;
            self.inner.flush()?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "chunked body already finished",
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        write!(self.inner, "{:X}\r\n", buf.len())?;
        self.inner.write_all(buf)?;
        self.inner.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Payload with every byte value, long enough to span many buffers.
    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    // Encode `data` as chunks of varying size.
    fn chunked(data: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut w = ChunkedWriter::new(Vec::new());
        for c in data.chunks(chunk_size) {
            w.write_all(c).unwrap();
        }
        w.finish().unwrap();
        w.into_inner()
    }

    fn read_in_pieces<R: Read>(mut r: R, piece: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; piece];
        loop {
            let n = r.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    // A reader that hands out at most `step` bytes per call, like a socket.
    struct Trickle<R> {
        inner: R,
        step: usize,
    }

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.step);
            self.inner.read(&mut buf[..n])
        }
    }

    #[test]
    fn fidelity_matrix() {
        for &len in &[0usize, 1, 17, 1000, 20000] {
            let data = payload(len);
            for &chunked_mode in &[true, false] {
                for &bufsize in &[0usize, 64, DEFAULT_BUFFER_SIZE] {
                    for &piece in &[1usize, 3, 100, 4096, 50000] {
                        let wire = if chunked_mode {
                            chunked(&data, 333)
                        } else {
                            data.clone()
                        };
                        let framing = if chunked_mode {
                            Framing::Chunked
                        } else {
                            Framing::Length(len as u64)
                        };
                        let src = Trickle {
                            inner: Cursor::new(wire),
                            step: 509,
                        };
                        let stream = HttpInputStream::with_buffer_size(src, framing, bufsize);
                        let got = read_in_pieces(stream, piece);
                        assert!(
                            got == data,
                            "len {len} chunked {chunked_mode} buffer {bufsize} piece {piece}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn content_length_stops_early() {
        let mut wire = b"hello".to_vec();
        wire.extend_from_slice(b"GET / HTTP/1.1\r\n");
        let mut s = HttpInputStream::new(Cursor::new(wire), Framing::Length(5));
        let mut body = String::new();
        s.read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello");
        assert!(s.is_done());
        let (mut inner, rest) = s.into_parts();
        let mut tail = rest.to_vec();
        inner.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn short_body_is_an_error() {
        let mut s = HttpInputStream::new(Cursor::new(b"abc".to_vec()), Framing::Length(10));
        let mut body = Vec::new();
        let err = s.read_to_end(&mut body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn chunk_extensions_and_trailers() {
        let wire = b"5;name=value\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT";
        let mut s = HttpInputStream::with_buffer_size(Cursor::new(wire.to_vec()), Framing::Chunked, 0);
        let mut body = String::new();
        s.read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello world");
        let (mut inner, rest) = s.into_parts();
        assert!(rest.is_empty());
        let mut tail = String::new();
        inner.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "NEXT");
    }

    #[test]
    fn malformed_chunks() {
        let cases: [&[u8]; 3] = [
            b"zz\r\nhello\r\n0\r\n\r\n",
            b"5\r\nhelloXX0\r\n\r\n",
            b"\r\n",
        ];
        for wire in cases {
            let mut s = HttpInputStream::new(Cursor::new(wire.to_vec()), Framing::Chunked);
            let mut body = Vec::new();
            let err = s.read_to_end(&mut body).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidData, "{:?}", wire);
        }
    }

    #[test]
    fn truncated_chunk() {
        let mut s = HttpInputStream::new(Cursor::new(b"a\r\nabc".to_vec()), Framing::Chunked);
        let mut body = Vec::new();
        let err = s.read_to_end(&mut body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn writer_finish_is_idempotent() {
        let mut w = ChunkedWriter::new(Vec::new());
        w.write_all(b"abc").unwrap();
        w.write_all(b"").unwrap();
        w.finish().unwrap();
        w.finish().unwrap();
        assert!(w.write(b"x").is_err());
        assert_eq!(w.into_inner(), b"3\r\nabc\r\n0\r\n\r\n");
    }
}
