use std::sync::Arc;

use http::StatusCode;

use crate::connection::Connection;
use crate::errors::{KitError, KitResult};
use crate::service::ConnectionHandler;

/// Runs the request/response loop of an HTTP/1.1 connection, calling the
/// inner handler once per request.
///
/// The connection must present an [`HttpConnection`](super::HttpConnection)
/// (see [`ServiceBuilder::http`](crate::ServiceBuilder::http)). Handler
/// errors are turned into error responses when nothing was sent yet, and
/// end the connection.
#[derive(Clone)]
pub struct HttpHandler {
    inner: Arc<dyn ConnectionHandler>,
    max_requests: Option<usize>,
}

impl HttpHandler {
    pub fn new(inner: impl ConnectionHandler + 'static) -> HttpHandler {
        HttpHandler {
            inner: Arc::new(inner),
            max_requests: None,
        }
    }

    /// Close the connection after this many requests.
    pub fn max_requests(self, max: usize) -> Self {
        let mut this = self;
        this.max_requests = Some(max);
        this
    }
}

fn not_http() -> KitError {
    KitError::Handler("connection has no HTTP view".to_string())
}

impl ConnectionHandler for HttpHandler {
    fn handle(&self, conn: &mut dyn Connection) -> KitResult<()> {
        let mut served = 0;
        loop {
            let http = conn.http().ok_or_else(not_http)?;
            match http.read_request() {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => {
                    debug!("bad request: {}", e);
                    let _ = http.send_error(&e);
                    return Err(e);
                }
            }

            let result = self.inner.handle(conn);

            let http = conn.http().ok_or_else(not_http)?;
            if let Err(e) = result {
                let _ = http.send_error(&e);
                return Err(e);
            }
            if !http.is_committed() {
                // handler did not answer at all.
                http.send(StatusCode::NOT_FOUND, b"")?;
            }
            http.finish()?;
            served += 1;
            if !http.keep_alive() || self.max_requests.map_or(false, |m| served >= m) {
                return Ok(());
            }
        }
    }
}
