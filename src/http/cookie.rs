//! Request and response cookies.
use std::time::{Duration, SystemTime};

use http::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};

use crate::util::systemtime_to_httpdate;

/// A response cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub expires: Option<SystemTime>,
    pub max_age: Option<Duration>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Cookie {
        Cookie {
            name: name.into(),
            value: value.into(),
            expires: None,
            max_age: None,
            domain: None,
            path: None,
            secure: false,
            http_only: false,
        }
    }

    pub fn path(self, path: impl Into<String>) -> Self {
        let mut this = self;
        this.path = Some(path.into());
        this
    }

    pub fn domain(self, domain: impl Into<String>) -> Self {
        let mut this = self;
        this.domain = Some(domain.into());
        this
    }

    pub fn expires(self, at: SystemTime) -> Self {
        let mut this = self;
        this.expires = Some(at);
        this
    }

    pub fn max_age(self, age: Duration) -> Self {
        let mut this = self;
        this.max_age = Some(age);
        this
    }

    pub fn secure(self, secure: bool) -> Self {
        let mut this = self;
        this.secure = secure;
        this
    }

    pub fn http_only(self, http_only: bool) -> Self {
        let mut this = self;
        this.http_only = http_only;
        this
    }

    /// The `Set-Cookie` header value for this cookie.
    pub fn to_header_value(&self) -> String {
        let mut s = format!("{}={}", self.name, self.value);
        if let Some(t) = self.expires {
            s.push_str("; Expires=");
            s.push_str(&systemtime_to_httpdate(t));
        }
        if let Some(age) = self.max_age {
            s.push_str(&format!("; Max-Age={}", age.as_secs()));
        }
        if let Some(ref domain) = self.domain {
            s.push_str("; Domain=");
            s.push_str(domain);
        }
        if let Some(ref path) = self.path {
            s.push_str("; Path=");
            s.push_str(path);
        }
        if self.secure {
            s.push_str("; Secure");
        }
        if self.http_only {
            s.push_str("; HttpOnly");
        }
        s
    }
}

/// Parse all `Cookie` request headers into `(name, value)` pairs, in order.
pub fn parse_request_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for value in headers.get_all(COOKIE) {
        let value = match value.to_str() {
            Ok(v) => v,
            Err(_) => continue,
        };
        for pair in value.split(';') {
            let mut kv = pair.splitn(2, '=');
            let name = kv.next().unwrap_or_default().trim();
            if name.is_empty() {
                continue;
            }
            let value = kv.next().unwrap_or_default().trim().trim_matches('"');
            cookies.push((name.to_string(), value.to_string()));
        }
    }
    cookies
}

/// Response cookies waiting for the response head to be written.
///
/// A cookie replaces any pending cookie of the same name. Once flushed, a
/// name can not be sent again on the same connection.
#[derive(Debug, Default)]
pub struct CookieBuffer {
    pending: Vec<Cookie>,
    flushed: Vec<String>,
}

impl CookieBuffer {
    /// Queue a cookie. Returns false if a cookie with this name was already
    /// flushed to the client.
    pub fn add(&mut self, cookie: Cookie) -> bool {
        if self.flushed.iter().any(|n| *n == cookie.name) {
            return false;
        }
        match self.pending.iter_mut().find(|c| c.name == cookie.name) {
            Some(c) => *c = cookie,
            None => self.pending.push(cookie),
        }
        true
    }

    pub fn pending(&self) -> &[Cookie] {
        &self.pending
    }

    /// Append a `Set-Cookie` header for each pending cookie.
    pub fn flush_into(&mut self, headers: &mut HeaderMap) {
        for cookie in self.pending.drain(..) {
            match HeaderValue::from_str(&cookie.to_header_value()) {
                Ok(v) => {
                    headers.append(SET_COOKIE, v);
                }
                Err(_) => warn!("dropping cookie {} with invalid value", cookie.name),
            }
            self.flushed.push(cookie.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn header_value() {
        let c = Cookie::new("JSESSIONID", "abc")
            .path("/app")
            .domain("example.com")
            .expires(UNIX_EPOCH + Duration::from_secs(1622040683))
            .secure(true)
            .http_only(true);
        assert_eq!(
            c.to_header_value(),
            "JSESSIONID=abc; Expires=Wed, 26 May 2021 14:51:23 GMT; \
             Domain=example.com; Path=/app; Secure; HttpOnly"
        );
        assert_eq!(Cookie::new("a", "b").max_age(Duration::from_secs(60)).to_header_value(), "a=b; Max-Age=60");
    }

    #[test]
    fn request_cookies() {
        let mut h = HeaderMap::new();
        h.append(COOKIE, HeaderValue::from_static("a=1; b=\"two\""));
        h.append(COOKIE, HeaderValue::from_static("c=3;;flag"));
        assert_eq!(
            parse_request_cookies(&h),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string()),
                ("c".to_string(), "3".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn last_write_per_name_wins() {
        let mut buf = CookieBuffer::default();
        assert!(buf.add(Cookie::new("a", "1")));
        assert!(buf.add(Cookie::new("b", "1")));
        assert!(buf.add(Cookie::new("a", "2")));
        let mut h = HeaderMap::new();
        buf.flush_into(&mut h);
        let values: Vec<_> = h.get_all(SET_COOKIE).iter().map(|v| v.to_str().unwrap()).collect();
        assert_eq!(values, vec!["a=2", "b=1"]);
        assert!(!buf.add(Cookie::new("a", "3")));
        assert!(buf.pending().is_empty());
    }
}
