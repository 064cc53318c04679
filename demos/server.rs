//
//  Sample application.
//
//  Listens on localhost:4918, plain http, no ssl.
//
//  /          welcome text
//  /hello     counts visits per session
//  /files/..  in-memory files: GET (with Range), PUT, DELETE, LOCK, UNLOCK
//
use std::collections::HashMap;
use std::error::Error;
use std::io::Read;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http::header::{HeaderValue, CONTENT_RANGE};
use http::StatusCode;
use parking_lot::Mutex;

use dav_kit::http::Ranges;
use dav_kit::locks::parse_timeout;
use dav_kit::routing::routed_path;
use dav_kit::{
    ComponentState, Connection, ConnectionHandler, Depth, HttpConnection, HttpHandler, KitError,
    KitResult, LockScope, LockTable, LockTableConfig, LockType, PrefixMatcher, Selector,
    ServiceBuilder, SessionConfig, SessionKey, SessionManager, WelcomeFileMatcher,
};

const INDEX: &str = "dav-kit sample server\n\ntry /hello or /files/\n";

fn http_view(conn: &mut dyn Connection) -> KitResult<&mut HttpConnection> {
    conn.http()
        .ok_or_else(|| KitError::Handler("not an http connection".to_string()))
}

// the token inside the first <...> of a header, as in `If: (<token>)`.
fn token_in(value: Option<&str>) -> Option<String> {
    let value = value?;
    let start = value.find('<')? + 1;
    let end = start + value[start..].find('>')?;
    Some(value[start..end].to_string())
}

struct Files {
    store: Mutex<HashMap<String, Vec<u8>>>,
    locks: LockTable,
}

impl Files {
    fn new() -> Files {
        Files {
            store: Mutex::new(HashMap::new()),
            locks: LockTableConfig::new()
                .harvest_min_interval(Duration::from_secs(10))
                .build(),
        }
    }

    fn get(&self, http: &mut HttpConnection, resource: &str) -> KitResult<()> {
        let data = match self.store.lock().get(resource) {
            Some(data) => data.clone(),
            None => return http.send(StatusCode::NOT_FOUND, b""),
        };
        if let Some(mut ranges) = http.header("range").and_then(Ranges::parse) {
            ranges.set_size(data.len() as u64);
            if !ranges.is_satisfiable() {
                return http.send(StatusCode::RANGE_NOT_SATISFIABLE, b"");
            }
            if let (Some((from, to)), Some(value)) = (ranges.single(), ranges.format()) {
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| KitError::Handler(e.to_string()))?;
                http.response_headers_mut().insert(CONTENT_RANGE, value);
                return http.send(
                    StatusCode::PARTIAL_CONTENT,
                    &data[from as usize..=to as usize],
                );
            }
            // several disjoint ranges: send the whole thing.
        }
        http.send(StatusCode::OK, &data)
    }

    fn put(&self, http: &mut HttpConnection, resource: &str) -> KitResult<()> {
        let token = token_in(http.header("if"));
        if !self.locks.is_access_allowed(resource, token.as_deref()) {
            return http.send(StatusCode::LOCKED, b"");
        }
        let mut body = Vec::new();
        http.read_to_end(&mut body)?;
        let created = self.store.lock().insert(resource.to_string(), body).is_none();
        let status = if created {
            StatusCode::CREATED
        } else {
            StatusCode::NO_CONTENT
        };
        http.send(status, b"")
    }

    fn delete(&self, http: &mut HttpConnection, resource: &str) -> KitResult<()> {
        let token = token_in(http.header("if"));
        if !self.locks.is_access_allowed(resource, token.as_deref()) {
            return http.send(StatusCode::LOCKED, b"");
        }
        if self.store.lock().remove(resource).is_none() {
            return http.send(StatusCode::NOT_FOUND, b"");
        }
        self.locks.remove_locks(resource);
        http.send(StatusCode::NO_CONTENT, b"")
    }

    fn lock(&self, http: &mut HttpConnection, resource: &str) -> KitResult<()> {
        let timeout = http
            .header("timeout")
            .and_then(parse_timeout)
            .unwrap_or(Some(Duration::from_secs(600)));

        // refresh of a lock we handed out earlier.
        if let Some(token) = token_in(http.header("if")) {
            return match self.locks.refresh_lock(&token, timeout) {
                Some(_) => http.send(StatusCode::OK, b""),
                None => http.send(StatusCode::PRECONDITION_FAILED, b""),
            };
        }

        let depth = http
            .header("depth")
            .and_then(Depth::from_header)
            .unwrap_or(Depth::Infinity);
        let scope = match http.header("x-lock-scope") {
            Some(s) if s.eq_ignore_ascii_case("shared") => LockScope::Shared,
            _ => LockScope::Exclusive,
        };
        let lock = self
            .locks
            .create_lock(LockType::Write, scope, None, timeout, depth);
        if !self.locks.lock_resource(&lock, resource) {
            self.locks.unlock_resources(&lock);
            return http.send(StatusCode::LOCKED, b"");
        }
        let value = HeaderValue::from_str(&format!("<{}>", lock.token))
            .map_err(|e| KitError::Handler(e.to_string()))?;
        http.response_headers_mut().insert("lock-token", value);
        http.send(StatusCode::OK, b"")
    }

    fn unlock(&self, http: &mut HttpConnection, resource: &str) -> KitResult<()> {
        let lock = token_in(http.header("lock-token")).and_then(|t| self.locks.get_lock(&t));
        match lock {
            Some(lock) if self.locks.lock_resources(&lock.token).iter().any(|r| r == resource) => {
                self.locks.unlock_resources(&lock);
                http.send(StatusCode::NO_CONTENT, b"")
            }
            _ => http.send(StatusCode::CONFLICT, b""),
        }
    }
}

impl ConnectionHandler for Files {
    fn handle(&self, conn: &mut dyn Connection) -> KitResult<()> {
        let resource = routed_path(conn)?.component_resource_path().to_string();
        let http = http_view(conn)?;
        let method = http.method().map(|m| m.as_str().to_string()).unwrap_or_default();
        match method.as_str() {
            "GET" | "HEAD" => self.get(http, &resource),
            "PUT" => self.put(http, &resource),
            "DELETE" => self.delete(http, &resource),
            "LOCK" => self.lock(http, &resource),
            "UNLOCK" => self.unlock(http, &resource),
            _ => http.send(StatusCode::METHOD_NOT_ALLOWED, b""),
        }
    }
}

fn hello(sessions: Arc<SessionManager>) -> impl ConnectionHandler {
    move |conn: &mut dyn Connection| -> KitResult<()> {
        let visits = match sessions.find_session(SessionKey::Connection(&mut *conn), true) {
            Some(session) => {
                let n = session.get::<u64>("visits").map_or(1, |n| *n + 1);
                session.set("visits", n);
                n
            }
            None => 0,
        };
        let reply = format!("hello, visit #{}\n", visits);
        http_view(conn)?.send(StatusCode::OK, reply.as_bytes())
    }
}

#[derive(Debug, clap::Parser)]
#[command(about, version)]
struct Cli {
    /// port to listen on
    #[arg(short, long, default_value = "4918")]
    port: u16,
    /// address to bind to
    #[arg(short, long, default_value = "127.0.0.1")]
    addr: IpAddr,
    /// number of worker threads (default: one thread per connection)
    #[arg(short, long)]
    workers: Option<usize>,
    /// idle session timeout in seconds
    #[arg(long, default_value = "1800")]
    session_timeout: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let sessions = Arc::new(
        SessionConfig::new()
            .timeout(Duration::from_secs(cli.session_timeout))
            .build(),
    );
    let index = |conn: &mut dyn Connection| -> KitResult<()> {
        http_view(conn)?.send(StatusCode::OK, INDEX.as_bytes())
    };
    let selector = Selector::new()
        // rewrite "/" to "/index.txt" and keep routing.
        .route(
            WelcomeFileMatcher::new("index.txt"),
            |_: &mut dyn Connection| -> KitResult<()> { Ok(()) },
            false,
        )
        .route(PrefixMatcher::new("/index.txt"), index, true)
        .route(PrefixMatcher::new("/hello"), hello(sessions), true)
        .route(PrefixMatcher::new("/files"), Files::new(), true);

    let mut builder = ServiceBuilder::new(HttpHandler::new(selector))
        .addr(cli.addr)
        .port(cli.port);
    if let Some(workers) = cli.workers {
        builder = builder.pool_size(workers);
    }
    let service = builder.http().build();
    service.create()?;
    service.start()?;
    println!("Serving on {}", service.local_addr().map_or(String::new(), |a| a.to_string()));

    service
        .lifecycle()
        .wait_for_state(ComponentState::Stopped, Duration::ZERO);
    Ok(())
}
