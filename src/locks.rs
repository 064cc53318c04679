//! In-memory WebDAV lock table.
//!
//! Locks are created with [`LockTable::create_lock`], which hands out a
//! fresh `opaquelocktoken:` token, and are then attached to one or more
//! resources with [`LockTable::lock_resource`]. The table keeps two
//! indices, token to resources and resource to tokens, and retires a lock
//! once its last resource is released.
//!
//! Scope is enforced here: a resource holds either any number of shared
//! locks or a single exclusive one.
//!
//! Expired locks are harvested lazily on the next call, at most once per
//! `harvest_min_interval`. Until then an expired lock still counts.
//!
//! Each call is atomic on its own. Check-then-lock sequences across calls
//! need external synchronization.
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Depth {
    /// Parse a `Depth` header value.
    pub fn from_header(value: &str) -> Option<Depth> {
        match value.trim() {
            "0" => Some(Depth::Zero),
            "1" => Some(Depth::One),
            v if v.eq_ignore_ascii_case("infinity") => Some(Depth::Infinity),
            _ => None,
        }
    }
}

/// Parse a `Timeout` header value such as `Second-3600` or `Infinite`.
///
/// The header may list several alternatives; the first one understood is
/// used. `Some(None)` stands for an infinite timeout.
pub fn parse_timeout(value: &str) -> Option<Option<Duration>> {
    for part in value.split(',').map(str::trim) {
        if part.eq_ignore_ascii_case("infinite") {
            return Some(None);
        }
        let secs = part
            .get(..7)
            .filter(|p| p.eq_ignore_ascii_case("second-"))
            .and_then(|_| part[7..].parse::<u64>().ok());
        if let Some(secs) = secs {
            return Some(Some(Duration::from_secs(secs)));
        }
    }
    None
}

// a timeout too large to represent counts as infinite.
fn deadline(timeout: Option<Duration>) -> Option<SystemTime> {
    timeout.and_then(|t| SystemTime::now().checked_add(t))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub lock_type: LockType,
    pub scope: LockScope,
    pub owner: Option<String>,
    pub depth: Depth,
    /// `None` for locks that never expire.
    pub valid_until: Option<SystemTime>,
    pub token: String,
}

impl Lock {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.valid_until.map_or(false, |t| t < now)
    }
}

#[derive(Debug, Clone)]
pub struct LockTableConfig {
    harvest_min_interval: Duration,
    start_counter: u64,
}

impl Default for LockTableConfig {
    fn default() -> Self {
        LockTableConfig {
            harvest_min_interval: Duration::from_secs(60),
            start_counter: 0,
        }
    }
}

impl LockTableConfig {
    pub fn new() -> LockTableConfig {
        LockTableConfig::default()
    }

    /// Minimum time between two scans for expired locks.
    pub fn harvest_min_interval(mut self, interval: Duration) -> Self {
        self.harvest_min_interval = interval;
        self
    }

    /// First value of the token counter.
    pub fn start_counter(mut self, counter: u64) -> Self {
        self.start_counter = counter;
        self
    }

    pub fn build(self) -> LockTable {
        LockTable::new(self)
    }
}

#[derive(Debug)]
struct Inner {
    locks: HashMap<String, Lock>,
    lock_resources: HashMap<String, BTreeSet<String>>,
    resource_locks: HashMap<String, Vec<String>>,
    counter: u64,
    last_harvest: Instant,
}

impl Inner {
    fn next_token(&mut self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);
        format!("opaquelocktoken:{:x}-{:x}", millis, counter)
    }

    // drop the lock from the token index and from every resource it holds.
    fn retire(&mut self, token: &str) -> Option<Lock> {
        let lock = self.locks.remove(token)?;
        for resource in self.lock_resources.remove(token).unwrap_or_default() {
            self.detach(&resource, token);
        }
        Some(lock)
    }

    fn detach(&mut self, resource: &str, token: &str) {
        if let Some(tokens) = self.resource_locks.get_mut(resource) {
            tokens.retain(|t| t != token);
            if tokens.is_empty() {
                self.resource_locks.remove(resource);
            }
        }
    }

    fn locks_on(&self, resource: &str) -> Vec<Lock> {
        self.resource_locks
            .get(resource)
            .map(|tokens| tokens.iter().filter_map(|t| self.locks.get(t).cloned()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct LockTable {
    config: LockTableConfig,
    inner: Mutex<Inner>,
}

impl Default for LockTable {
    fn default() -> Self {
        LockTable::new(LockTableConfig::default())
    }
}

impl LockTable {
    pub fn new(config: LockTableConfig) -> LockTable {
        let inner = Inner {
            locks: HashMap::new(),
            lock_resources: HashMap::new(),
            resource_locks: HashMap::new(),
            counter: config.start_counter,
            last_harvest: Instant::now(),
        };
        LockTable {
            config,
            inner: Mutex::new(inner),
        }
    }

    fn lock_inner(&self) -> parking_lot::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if now.saturating_duration_since(inner.last_harvest) >= self.config.harvest_min_interval {
            inner.last_harvest = now;
            let wall = SystemTime::now();
            let expired: Vec<String> = inner
                .locks
                .values()
                .filter(|l| l.is_expired(wall))
                .map(|l| l.token.clone())
                .collect();
            for token in expired {
                debug!("lock {} expired", token);
                inner.retire(&token);
            }
        }
        inner
    }

    /// Allocate a new lock. It holds no resources until
    /// [`lock_resource`](Self::lock_resource) is called.
    pub fn create_lock(
        &self,
        lock_type: LockType,
        scope: LockScope,
        owner: Option<&str>,
        timeout: Option<Duration>,
        depth: Depth,
    ) -> Lock {
        let mut inner = self.lock_inner();
        let lock = Lock {
            lock_type,
            scope,
            owner: owner.map(str::to_string),
            depth,
            valid_until: deadline(timeout),
            token: inner.next_token(),
        };
        debug!("created lock {} ({:?}, {:?})", lock.token, scope, depth);
        inner.locks.insert(lock.token.clone(), lock.clone());
        inner.lock_resources.insert(lock.token.clone(), BTreeSet::new());
        lock
    }

    /// Attach `lock` to `resource`.
    ///
    /// Fails if the lock is unknown (never created, released or expired),
    /// if it is already attached to the resource, or if the resource's
    /// current locks conflict with its scope.
    pub fn lock_resource(&self, lock: &Lock, resource: &str) -> bool {
        let mut inner = self.lock_inner();
        let scope = match inner.locks.get(&lock.token) {
            Some(l) => l.scope,
            None => return false,
        };
        let held = inner.locks_on(resource);
        if held.iter().any(|l| l.token == lock.token) {
            return false;
        }
        let conflict = match scope {
            LockScope::Exclusive => !held.is_empty(),
            LockScope::Shared => held.iter().any(|l| l.scope == LockScope::Exclusive),
        };
        if conflict {
            debug!("lock {} conflicts on {}", lock.token, resource);
            return false;
        }
        inner
            .resource_locks
            .entry(resource.to_string())
            .or_default()
            .push(lock.token.clone());
        inner
            .lock_resources
            .entry(lock.token.clone())
            .or_default()
            .insert(resource.to_string());
        true
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.lock_inner().resource_locks.contains_key(resource)
    }

    /// Locks held on `resource`, in the order they were attached.
    pub fn get_locks(&self, resource: &str) -> Vec<Lock> {
        self.lock_inner().locks_on(resource)
    }

    pub fn get_lock(&self, token: &str) -> Option<Lock> {
        self.lock_inner().locks.get(token).cloned()
    }

    /// Resources `token` is attached to, sorted.
    pub fn lock_resources(&self, token: &str) -> Vec<String> {
        self.lock_inner()
            .lock_resources
            .get(token)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True if the resource is unlocked, or `token` is one of its locks.
    pub fn is_access_allowed(&self, resource: &str, token: Option<&str>) -> bool {
        let inner = self.lock_inner();
        match inner.resource_locks.get(resource) {
            None => true,
            Some(tokens) => token.map_or(false, |t| tokens.iter().any(|held| held == t)),
        }
    }

    /// Release `lock` from every resource and forget it. Returns whether
    /// the lock was known.
    pub fn unlock_resources(&self, lock: &Lock) -> bool {
        let released = self.lock_inner().retire(&lock.token).is_some();
        if released {
            debug!("released lock {}", lock.token);
        }
        released
    }

    /// Release every lock on `resource`. Locks left without resources are
    /// retired. Returns the locks that were detached.
    pub fn remove_locks(&self, resource: &str) -> Vec<Lock> {
        let mut inner = self.lock_inner();
        let detached = inner.locks_on(resource);
        inner.resource_locks.remove(resource);
        for lock in &detached {
            let empty = match inner.lock_resources.get_mut(&lock.token) {
                Some(resources) => {
                    resources.remove(resource);
                    resources.is_empty()
                }
                None => false,
            };
            if empty {
                inner.lock_resources.remove(&lock.token);
                inner.locks.remove(&lock.token);
                debug!("retired lock {}", lock.token);
            }
        }
        detached
    }

    /// Restart the timeout of a lock. Returns the updated lock.
    pub fn refresh_lock(&self, token: &str, timeout: Option<Duration>) -> Option<Lock> {
        let mut inner = self.lock_inner();
        let lock = inner.locks.get_mut(token)?;
        lock.valid_until = deadline(timeout);
        Some(lock.clone())
    }

    /// Number of live locks.
    pub fn len(&self) -> usize {
        self.lock_inner().locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn shared(t: &LockTable) -> Lock {
        t.create_lock(LockType::Write, LockScope::Shared, Some("alice"), None, Depth::Zero)
    }

    fn exclusive(t: &LockTable) -> Lock {
        t.create_lock(LockType::Write, LockScope::Exclusive, None, None, Depth::Infinity)
    }

    #[test]
    fn tokens_are_unique() {
        let t = LockTableConfig::new().start_counter(0xff).build();
        let a = shared(&t);
        let b = shared(&t);
        assert_ne!(a.token, b.token);
        assert!(a.token.starts_with("opaquelocktoken:"));
        assert!(a.token.ends_with("-ff"), "{}", a.token);
        assert!(b.token.ends_with("-100"), "{}", b.token);
        assert_eq!(a.owner.as_deref(), Some("alice"));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn shared_locks_coexist() {
        let t = LockTable::default();
        let (a, b) = (shared(&t), shared(&t));
        assert!(t.lock_resource(&a, "/f"));
        assert!(t.lock_resource(&b, "/f"));
        assert!(!t.lock_resource(&a, "/f"));
        assert!(!t.lock_resource(&exclusive(&t), "/f"));
        let tokens: Vec<_> = t.get_locks("/f").into_iter().map(|l| l.token).collect();
        assert_eq!(tokens, vec![a.token, b.token]);
    }

    #[test]
    fn exclusive_lock_excludes() {
        let t = LockTable::default();
        let x = exclusive(&t);
        assert!(t.lock_resource(&x, "/f"));
        assert!(!t.lock_resource(&exclusive(&t), "/f"));
        assert!(!t.lock_resource(&shared(&t), "/f"));
        assert!(t.lock_resource(&shared(&t), "/g"));
    }

    #[test]
    fn unknown_lock_is_rejected() {
        let t = LockTable::default();
        let a = shared(&t);
        assert!(t.unlock_resources(&a));
        assert!(!t.unlock_resources(&a));
        assert!(!t.lock_resource(&a, "/f"));
        assert!(!t.is_locked("/f"));
    }

    #[test]
    fn access_checks() {
        let t = LockTable::default();
        let a = exclusive(&t);
        assert!(t.is_access_allowed("/f", None));
        t.lock_resource(&a, "/f");
        assert!(t.is_locked("/f"));
        assert!(!t.is_access_allowed("/f", None));
        assert!(!t.is_access_allowed("/f", Some("opaquelocktoken:0-0")));
        assert!(t.is_access_allowed("/f", Some(&a.token)));
        assert!(t.is_access_allowed("/g", None));
    }

    #[test]
    fn unlock_releases_every_resource() {
        let t = LockTable::default();
        let a = shared(&t);
        let b = shared(&t);
        for r in ["/x", "/y"] {
            assert!(t.lock_resource(&a, r));
        }
        assert!(t.lock_resource(&b, "/y"));
        assert_eq!(t.lock_resources(&a.token), vec!["/x".to_string(), "/y".to_string()]);

        assert!(t.unlock_resources(&a));
        assert!(!t.is_locked("/x"));
        assert_eq!(t.get_locks("/y"), vec![b.clone()]);
        assert!(t.get_lock(&a.token).is_none());
        assert!(t.lock_resources(&a.token).is_empty());
    }

    #[test]
    fn remove_locks_retires_orphans() {
        let t = LockTable::default();
        let a = shared(&t);
        let b = shared(&t);
        t.lock_resource(&a, "/x");
        t.lock_resource(&a, "/y");
        t.lock_resource(&b, "/y");

        let detached = t.remove_locks("/y");
        assert_eq!(detached.len(), 2);
        assert!(!t.is_locked("/y"));
        // a still holds /x, b had nothing else.
        assert_eq!(t.lock_resources(&a.token), vec!["/x".to_string()]);
        assert!(t.get_lock(&a.token).is_some());
        assert!(t.get_lock(&b.token).is_none());
        assert!(t.remove_locks("/nothing").is_empty());
    }

    #[test]
    fn expired_locks_are_harvested() {
        let t = LockTableConfig::new()
            .harvest_min_interval(Duration::ZERO)
            .build();
        let a = t.create_lock(
            LockType::Write,
            LockScope::Exclusive,
            None,
            Some(Duration::from_millis(10)),
            Depth::Zero,
        );
        assert!(t.lock_resource(&a, "/f"));
        thread::sleep(Duration::from_millis(40));
        assert!(!t.is_locked("/f"));
        assert!(t.get_lock(&a.token).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn harvest_is_rate_limited() {
        let t = LockTableConfig::new()
            .harvest_min_interval(Duration::from_secs(3600))
            .build();
        let a = t.create_lock(
            LockType::Write,
            LockScope::Shared,
            None,
            Some(Duration::from_millis(1)),
            Depth::Zero,
        );
        t.lock_resource(&a, "/f");
        thread::sleep(Duration::from_millis(20));
        assert!(t.is_locked("/f"));
        assert!(t.get_lock(&a.token).unwrap().is_expired(SystemTime::now()));
    }

    #[test]
    fn refresh_extends_validity() {
        let t = LockTable::default();
        let a = t.create_lock(
            LockType::Write,
            LockScope::Shared,
            None,
            Some(Duration::from_secs(1)),
            Depth::Zero,
        );
        let before = a.valid_until.unwrap();
        let refreshed = t.refresh_lock(&a.token, Some(Duration::from_secs(3600))).unwrap();
        assert!(refreshed.valid_until.unwrap() > before);
        let forever = t.refresh_lock(&a.token, None).unwrap();
        assert_eq!(forever.valid_until, None);
        assert!(t.refresh_lock("opaquelocktoken:0-0", None).is_none());
    }

    #[test]
    fn huge_timeouts_never_expire() {
        let t = LockTable::default();
        let huge = parse_timeout("Second-18446744073709551615").unwrap();
        assert_eq!(huge, Some(Duration::from_secs(u64::MAX)));
        let a = t.create_lock(LockType::Write, LockScope::Exclusive, None, huge, Depth::Zero);
        assert_eq!(a.valid_until, None);
        assert!(t.lock_resource(&a, "/r"));
        let refreshed = t.refresh_lock(&a.token, huge).unwrap();
        assert_eq!(refreshed.valid_until, None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn header_values() {
        assert_eq!(parse_timeout("Second-3600"), Some(Some(Duration::from_secs(3600))));
        assert_eq!(parse_timeout("Infinite, Second-10"), Some(None));
        assert_eq!(parse_timeout("bogus, second-10"), Some(Some(Duration::from_secs(10))));
        assert_eq!(parse_timeout("Second-x"), None);
        assert_eq!(parse_timeout(""), None);

        assert_eq!(Depth::from_header("0"), Some(Depth::Zero));
        assert_eq!(Depth::from_header("1"), Some(Depth::One));
        assert_eq!(Depth::from_header("Infinity"), Some(Depth::Infinity));
        assert_eq!(Depth::from_header("2"), None);
    }
}
