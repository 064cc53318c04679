//! Path-based request routing.
//!
//! A [`Selector`] walks an ordered list of [`Matcher`]s over the request
//! path. Each request carries a [`RoutedPath`] cursor in its attribute bag:
//! the part of the path that matchers have already consumed (the component
//! path) and the part still left for the next handler. Matchers move text
//! from the remaining part to the consumed part when they match, so that
//! `component_path + request_path` always spells the path being served.
use std::sync::Arc;

use http::StatusCode;

use crate::connection::Connection;
use crate::errors::{KitError, KitResult};
use crate::service::ConnectionHandler;
use crate::util::normalize_path;

mod matchers;

pub use self::matchers::{PatternMatcher, PrefixMatcher, WelcomeFileMatcher};

/// Attribute key under which the [`RoutedPath`] of a request is stored.
pub const ROUTED_PATH: &str = "dav-kit.routed-path";

/// Routing cursor for one request.
///
/// `component_path + component_resource_path == request_path` holds after
/// every matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPath {
    original_path: String,
    request_path: String,
    component_path: String,
    component_resource_path: String,
}

impl RoutedPath {
    /// Start routing `path`. The path is percent-decoded and normalized
    /// first; `None` means it is relative or climbs above the root.
    pub fn new(path: &str) -> Option<RoutedPath> {
        let path = normalize_path(path)?;
        Some(RoutedPath {
            original_path: path.clone(),
            request_path: path.clone(),
            component_path: String::new(),
            component_resource_path: path,
        })
    }

    /// The normalized path as it arrived.
    pub fn original_path(&self) -> &str {
        &self.original_path
    }

    /// The path being served. Differs from the original path only after a
    /// welcome file was substituted.
    pub fn request_path(&self) -> &str {
        &self.request_path
    }

    /// The part of the path consumed by matchers so far.
    pub fn component_path(&self) -> &str {
        &self.component_path
    }

    /// The part of the path left to route.
    pub fn component_resource_path(&self) -> &str {
        &self.component_resource_path
    }

    /// Move the first `len` bytes of the remaining path to the consumed part.
    /// Panics if `len` is not a char boundary of the remaining path.
    pub(crate) fn consume(&mut self, len: usize) {
        let rest = self.component_resource_path.split_off(len);
        self.component_path.push_str(&self.component_resource_path);
        self.component_resource_path = rest;
    }

    /// Replace the remaining path.
    pub(crate) fn set_component_resource_path(&mut self, path: String) {
        self.request_path = format!("{}{}", self.component_path, path);
        self.component_resource_path = path;
    }
}

/// The routing cursor of the current request, creating it from the HTTP
/// request path the first time it is asked for.
pub fn routed_path(conn: &mut dyn Connection) -> KitResult<&mut RoutedPath> {
    if !conn.attributes().contains(ROUTED_PATH) {
        let path = conn
            .http()
            .and_then(|http| http.path().map(str::to_string))
            .ok_or_else(|| KitError::Handler("no request path to route".to_string()))?;
        let routed = RoutedPath::new(&path).ok_or(KitError::Http(StatusCode::BAD_REQUEST))?;
        conn.attributes_mut().insert(ROUTED_PATH, routed);
    }
    conn.attributes_mut()
        .get_mut::<RoutedPath>(ROUTED_PATH)
        .ok_or_else(|| KitError::Handler(format!("{} has the wrong type", ROUTED_PATH)))
}

/// Path of the component serving this request, `/` when nothing was
/// consumed. Used as the default cookie path.
pub fn context_path(conn: &dyn Connection) -> String {
    match conn.attributes().get::<RoutedPath>(ROUTED_PATH) {
        Some(rp) if !rp.component_path.is_empty() => rp.component_path.clone(),
        _ => "/".to_string(),
    }
}

/// Decides whether a route applies, adjusting the routing cursor when it
/// does. A matcher that returns `false` must leave the cursor untouched.
pub trait Matcher: Send + Sync {
    fn matches(&self, path: &mut RoutedPath) -> bool;
}

struct Route {
    matcher: Box<dyn Matcher>,
    handler: Arc<dyn ConnectionHandler>,
    stop_on_match: bool,
}

/// Dispatches a connection to the handlers whose matcher accepts its path.
///
/// Routes are tried in order. A matching route whose `stop_on_match` is set
/// ends the walk; otherwise the next routes are tried against the cursor as
/// the matcher left it. If no route matched, the fallback handler runs.
#[derive(Default)]
pub struct Selector {
    routes: Vec<Route>,
    fallback: Option<Arc<dyn ConnectionHandler>>,
}

impl Selector {
    pub fn new() -> Selector {
        Selector::default()
    }

    pub fn route(
        mut self,
        matcher: impl Matcher + 'static,
        handler: impl ConnectionHandler + 'static,
        stop_on_match: bool,
    ) -> Self {
        self.add(Box::new(matcher), Arc::new(handler), stop_on_match);
        self
    }

    pub fn add(
        &mut self,
        matcher: Box<dyn Matcher>,
        handler: Arc<dyn ConnectionHandler>,
        stop_on_match: bool,
    ) {
        self.routes.push(Route {
            matcher,
            handler,
            stop_on_match,
        });
    }

    /// Handler to run when no route matched.
    pub fn fallback(mut self, handler: impl ConnectionHandler + 'static) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl ConnectionHandler for Selector {
    fn handle(&self, conn: &mut dyn Connection) -> KitResult<()> {
        let mut matched = false;
        for (idx, route) in self.routes.iter().enumerate() {
            let rp = routed_path(conn)?;
            if !route.matcher.matches(rp) {
                continue;
            }
            trace!(
                "route {} matched: component {:?}, remaining {:?}",
                idx,
                rp.component_path(),
                rp.component_resource_path()
            );
            matched = true;
            route.handler.handle(conn)?;
            if route.stop_on_match {
                return Ok(());
            }
        }
        match self.fallback {
            Some(ref fallback) if !matched => fallback.handle(conn),
            _ => Ok(()),
        }
    }
}
