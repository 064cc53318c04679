//! Cookie-identified sessions.
//!
//! A [`SessionManager`] keeps a server-wide table of [`Session`]s keyed by
//! an opaque id. The id travels in a cookie (`JSESSIONID` by default). A
//! session found or created for a connection is cached in the connection's
//! attribute bag, so later lookups during the same request skip the cookie
//! and the table.
//!
//! Idle sessions are evicted lazily: every public method first runs a sweep,
//! but only if at least `min_scan_interval` passed since the previous one.
//! An expired session can therefore still be returned for up to that long.
//!
//! Session ids come from a seeded [`StdRng`]. They are not meant to be
//! unguessable.
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::connection::Connection;
use crate::http::Cookie;
use crate::routing::context_path;

/// Default name of the session cookie.
pub const DEFAULT_COOKIE_NAME: &str = "JSESSIONID";

/// Attribute key under which the session of a connection is cached.
pub const SESSION_ATTRIBUTE: &str = "dav-kit.session";

type Value = Arc<dyn Any + Send + Sync>;

pub struct Session {
    id: String,
    attributes: Mutex<HashMap<String, Value>>,
    last_accessed: Mutex<Instant>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("attributes", &self.attributes.lock().keys().collect::<Vec<_>>())
            .field("last_accessed", &*self.last_accessed.lock())
            .finish()
    }
}

impl Session {
    fn new(id: String) -> Session {
        Session {
            id,
            attributes: Mutex::new(HashMap::new()),
            last_accessed: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attribute `key`, if set and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.attributes.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attributes.lock().insert(key.into(), Arc::new(value));
    }

    /// Returns whether the attribute was present.
    pub fn remove(&self, key: &str) -> bool {
        self.attributes.lock().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.attributes.lock().keys().cloned().collect()
    }

    /// Mark the session as used now.
    pub fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }
}

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    cookie_name: String,
    cookie_path: Option<String>,
    timeout: Option<Duration>,
    min_scan_interval: Duration,
    seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_path: None,
            timeout: None,
            min_scan_interval: Duration::from_secs(60),
            seed: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig::default()
    }

    pub fn cookie_name(mut self, name: &str) -> Self {
        self.cookie_name = name.to_string();
        self
    }

    /// Path attribute of the session cookie. Without it the context path
    /// of the request that created the session is used.
    pub fn cookie_path(mut self, path: &str) -> Self {
        self.cookie_path = Some(path.to_string());
        self
    }

    /// Evict sessions idle for longer than `timeout`. Without a timeout
    /// sessions live until removed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Minimum time between two sweeps for idle sessions.
    pub fn min_scan_interval(mut self, interval: Duration) -> Self {
        self.min_scan_interval = interval;
        self
    }

    /// Seed the id generator, for reproducible ids.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> SessionManager {
        SessionManager::new(self)
    }
}

/// What to look a session up by.
pub enum SessionKey<'a> {
    /// A raw session id.
    Id(&'a str),
    /// A connection: its cached session, or the id in its session cookie.
    Connection(&'a mut dyn Connection),
}

struct Table {
    sessions: HashMap<String, Arc<Session>>,
    rng: StdRng,
    last_sweep: Instant,
}

impl Table {
    fn create(&mut self) -> Arc<Session> {
        let id = loop {
            let id = format!("{:032x}", self.rng.gen::<u128>());
            if !self.sessions.contains_key(&id) {
                break id;
            }
        };
        self.insert(id)
    }

    fn insert(&mut self, id: String) -> Arc<Session> {
        let session = Arc::new(Session::new(id.clone()));
        self.sessions.insert(id, session.clone());
        session
    }
}

pub struct SessionManager {
    config: SessionConfig,
    table: Mutex<Table>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> SessionManager {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        SessionManager {
            config,
            table: Mutex::new(Table {
                sessions: HashMap::new(),
                rng,
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Find the session for `key`.
    ///
    /// If there is none and `create` is set, a new session is created. A
    /// session looked up by id is stored under that id, so the same id finds
    /// it again; an empty id gets a fresh random one. A session created for a
    /// connection always gets a fresh id, and a cookie carrying it is queued
    /// on the connection's response.
    pub fn find_session(&self, key: SessionKey<'_>, create: bool) -> Option<Arc<Session>> {
        self.sweep();
        match key {
            SessionKey::Id(id) => {
                let mut table = self.table.lock();
                if let Some(session) = table.sessions.get(id) {
                    session.touch();
                    return Some(session.clone());
                }
                if !create {
                    return None;
                }
                let session = if id.is_empty() {
                    table.create()
                } else {
                    table.insert(id.to_string())
                };
                debug!("created session {}", session.id());
                Some(session)
            }
            SessionKey::Connection(conn) => self.find_for_connection(conn, create),
        }
    }

    fn find_for_connection(&self, conn: &mut dyn Connection, create: bool) -> Option<Arc<Session>> {
        let cached = conn
            .attributes()
            .get::<Arc<Session>>(SESSION_ATTRIBUTE)
            .cloned();
        let mut table = self.table.lock();

        if let Some(session) = cached {
            // the cache may outlive a removal or a sweep.
            if table.sessions.get(session.id()).map_or(false, |s| Arc::ptr_eq(s, &session)) {
                session.touch();
                return Some(session);
            }
            conn.attributes_mut().remove::<Arc<Session>>(SESSION_ATTRIBUTE);
        }

        let found = self
            .cookie_id(conn)
            .and_then(|id| table.sessions.get(&id).cloned());
        let session = match found {
            Some(session) => {
                session.touch();
                session
            }
            None if create => {
                let session = table.create();
                drop(table);
                let path = match self.config.cookie_path {
                    Some(ref path) => path.clone(),
                    None => context_path(conn),
                };
                debug!("created session {} (cookie path {})", session.id(), path);
                if let Some(http) = conn.http() {
                    let cookie = Cookie::new(self.config.cookie_name.as_str(), session.id())
                        .path(path)
                        .http_only(true);
                    http.add_cookie(cookie);
                }
                session
            }
            None => return None,
        };
        conn.attributes_mut().insert(SESSION_ATTRIBUTE, session.clone());
        Some(session)
    }

    fn cookie_id(&self, conn: &mut dyn Connection) -> Option<String> {
        let http = conn.http()?;
        http.cookie(&self.config.cookie_name).map(str::to_string)
    }

    /// Remove the session for `key`. For a connection this also clears its
    /// cached session.
    pub fn remove_session(&self, key: SessionKey<'_>) -> Option<Arc<Session>> {
        match key {
            SessionKey::Id(id) => self.remove_session_by_id(id),
            SessionKey::Connection(conn) => {
                let cached = conn.attributes_mut().remove::<Arc<Session>>(SESSION_ATTRIBUTE);
                let id = match cached {
                    Some(session) => Some(session.id().to_string()),
                    None => self.cookie_id(conn),
                };
                id.and_then(|id| self.remove_session_by_id(&id))
            }
        }
    }

    pub fn remove_session_by_id(&self, id: &str) -> Option<Arc<Session>> {
        self.sweep();
        let removed = self.table.lock().sessions.remove(id);
        if removed.is_some() {
            debug!("removed session {}", id);
        }
        removed
    }

    /// Hook for carrying the session id in URLs. Sessions travel in
    /// cookies only, so the url is returned unchanged.
    pub fn rewrite_url(&self, url: &str) -> String {
        self.sweep();
        url.to_string()
    }

    pub fn len(&self) -> usize {
        self.sweep();
        self.table.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self) {
        let timeout = match self.config.timeout {
            Some(timeout) => timeout,
            None => return,
        };
        let mut table = self.table.lock();
        let now = Instant::now();
        if now.saturating_duration_since(table.last_sweep) < self.config.min_scan_interval {
            return;
        }
        table.last_sweep = now;
        let before = table.sessions.len();
        table
            .sessions
            .retain(|_, s| now.saturating_duration_since(s.last_accessed()) <= timeout);
        let evicted = before - table.sessions.len();
        if evicted > 0 {
            debug!("evicted {} idle sessions", evicted);
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        SessionManager::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BufferConnection;
    use crate::http::HttpConnection;
    use crate::routing::{routed_path, Matcher, PrefixMatcher};
    use std::thread;

    fn request(head: &str) -> HttpConnection {
        let mut conn = HttpConnection::new(Box::new(BufferConnection::new(head.as_bytes())));
        assert!(conn.read_request().unwrap());
        conn
    }

    #[test]
    fn session_attributes() {
        let s = Session::new("x".to_string());
        s.set("n", 5u32);
        assert_eq!(s.get::<u32>("n").as_deref(), Some(&5));
        assert!(s.get::<String>("n").is_none());
        assert_eq!(s.keys(), vec!["n".to_string()]);
        assert!(s.remove("n"));
        assert!(!s.remove("n"));
    }

    #[test]
    fn find_by_id_is_idempotent() {
        let m = SessionManager::default();
        assert!(m.find_session(SessionKey::Id("abc"), false).is_none());
        let s = m.find_session(SessionKey::Id("abc"), true).unwrap();
        assert_eq!(s.id(), "abc");
        let found = m.find_session(SessionKey::Id("abc"), false).unwrap();
        assert!(Arc::ptr_eq(&s, &found));
        let again = m.find_session(SessionKey::Id("abc"), true).unwrap();
        assert!(Arc::ptr_eq(&s, &again));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn empty_id_gets_a_random_one() {
        let m = SessionManager::default();
        let s = m.find_session(SessionKey::Id(""), true).unwrap();
        assert_eq!(s.id().len(), 32);
        assert!(s.id().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(m.find_session(SessionKey::Id(""), false).is_none());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn seeded_ids_are_reproducible() {
        let a = SessionConfig::new().seed(7).build();
        let b = SessionConfig::new().seed(7).build();
        let sa = a.find_session(SessionKey::Id(""), true).unwrap();
        let sb = b.find_session(SessionKey::Id(""), true).unwrap();
        assert_eq!(sa.id(), sb.id());
    }

    #[test]
    fn created_for_connection_queues_one_cookie() {
        let m = SessionManager::default();
        let mut conn = request("GET /app/page HTTP/1.1\r\n\r\n");
        assert!(PrefixMatcher::new("/app").matches(routed_path(&mut conn).unwrap()));

        assert!(m.find_session(SessionKey::Connection(&mut conn), false).is_none());
        let s = m.find_session(SessionKey::Connection(&mut conn), true).unwrap();
        let again = m.find_session(SessionKey::Connection(&mut conn), true).unwrap();
        assert!(Arc::ptr_eq(&s, &again));

        let cookies = conn.pending_cookies();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, DEFAULT_COOKIE_NAME);
        assert_eq!(cookies[0].value, s.id());
        assert_eq!(cookies[0].path.as_deref(), Some("/app"));
    }

    #[test]
    fn cookie_path_defaults_to_root() {
        let m = SessionConfig::new().cookie_name("SID").build();
        let mut conn = request("GET /x HTTP/1.1\r\n\r\n");
        m.find_session(SessionKey::Connection(&mut conn), true).unwrap();
        assert_eq!(conn.pending_cookies()[0].name, "SID");
        assert_eq!(conn.pending_cookies()[0].path.as_deref(), Some("/"));
    }

    #[test]
    fn found_through_cookie() {
        let m = SessionManager::default();
        let s = m.find_session(SessionKey::Id(""), true).unwrap();
        let mut conn = request(&format!(
            "GET / HTTP/1.1\r\nCookie: other=1; JSESSIONID={}\r\n\r\n",
            s.id()
        ));
        let found = m.find_session(SessionKey::Connection(&mut conn), true).unwrap();
        assert!(Arc::ptr_eq(&s, &found));
        assert!(conn.pending_cookies().is_empty());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn remove_through_connection_clears_cache() {
        let m = SessionManager::default();
        let mut conn = request("GET / HTTP/1.1\r\n\r\n");
        let s = m.find_session(SessionKey::Connection(&mut conn), true).unwrap();
        let removed = m.remove_session(SessionKey::Connection(&mut conn)).unwrap();
        assert!(Arc::ptr_eq(&s, &removed));
        assert!(!conn.attributes().contains(SESSION_ATTRIBUTE));
        assert!(m.is_empty());
        assert!(m.find_session(SessionKey::Connection(&mut conn), false).is_none());
    }

    #[test]
    fn stale_cache_is_ignored() {
        let m = SessionManager::default();
        let mut conn = request("GET / HTTP/1.1\r\n\r\n");
        let s = m.find_session(SessionKey::Connection(&mut conn), true).unwrap();
        m.remove_session_by_id(s.id()).unwrap();
        assert!(m.find_session(SessionKey::Connection(&mut conn), false).is_none());
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let m = SessionConfig::new()
            .timeout(Duration::from_millis(50))
            .min_scan_interval(Duration::ZERO)
            .build();
        let s = m.find_session(SessionKey::Id(""), true).unwrap();
        let id = s.id().to_string();
        thread::sleep(Duration::from_millis(120));
        assert!(m.find_session(SessionKey::Id(&id), false).is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn sweeps_are_rate_limited() {
        let m = SessionConfig::new()
            .timeout(Duration::from_millis(1))
            .min_scan_interval(Duration::from_secs(3600))
            .build();
        let s = m.find_session(SessionKey::Id(""), true).unwrap();
        thread::sleep(Duration::from_millis(20));
        // expired, but no sweep is due yet.
        assert!(m.find_session(SessionKey::Id(s.id()), false).is_some());
    }

    #[test]
    fn without_timeout_nothing_expires() {
        let m = SessionConfig::new().min_scan_interval(Duration::ZERO).build();
        m.find_session(SessionKey::Id(""), true).unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(m.len(), 1);
        assert_eq!(m.rewrite_url("/a?b=c"), "/a?b=c");
    }
}
