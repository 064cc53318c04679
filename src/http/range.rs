//! `Range` request header parsing and `Content-Range` formatting.
//!
//! A `Range` header is parsed without knowing the size of the resource, so
//! open-ended (`500-`) and suffix (`-500`) specs stay unresolved until
//! [`Ranges::set_size`] is called. After that the specs are clamped,
//! sorted and coalesced into disjoint intervals.
use regex::Regex;

lazy_static! {
    static ref RANGE_SPEC: Regex = Regex::new(r"^\s*(\d*)\s*-\s*(\d*)\s*$").unwrap();
}

/// One `Range` spec as it appeared in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRangeSpec {
    /// `from-to`, both inclusive.
    FromTo(u64, u64),
    /// `from-`, up to the end of the resource.
    From(u64),
    /// `-n`, the last `n` bytes.
    Last(u64),
}

impl ByteRangeSpec {
    fn parse(spec: &str) -> Option<ByteRangeSpec> {
        let caps = RANGE_SPEC.captures(spec)?;
        let from = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let to = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        match (from.is_empty(), to.is_empty()) {
            (true, true) => None,
            (false, true) => Some(ByteRangeSpec::From(from.parse().ok()?)),
            (true, false) => Some(ByteRangeSpec::Last(to.parse().ok()?)),
            (false, false) => {
                let from = from.parse().ok()?;
                let to = to.parse().ok()?;
                (from <= to).then_some(ByteRangeSpec::FromTo(from, to))
            }
        }
    }

    // Resolve against the resource size. `None` if unsatisfiable.
    fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }
        let last = size - 1;
        match *self {
            ByteRangeSpec::FromTo(from, to) => (from <= last).then(|| (from, to.min(last))),
            ByteRangeSpec::From(from) => (from <= last).then_some((from, last)),
            ByteRangeSpec::Last(0) => None,
            ByteRangeSpec::Last(n) => Some((size.saturating_sub(n), last)),
        }
    }
}

/// Parsed `Range: bytes=...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranges {
    specs: Vec<ByteRangeSpec>,
    size: Option<u64>,
    intervals: Vec<(u64, u64)>,
}

impl Ranges {
    /// Parse a `Range` header value. Returns `None` if the value is not a
    /// well-formed `bytes=` range set, in which case the request should be
    /// served as a plain, unranged one.
    pub fn parse(value: &str) -> Option<Ranges> {
        let set = value.trim().strip_prefix("bytes=")?;
        let specs = set
            .split(',')
            .map(ByteRangeSpec::parse)
            .collect::<Option<Vec<_>>>()?;
        if specs.is_empty() {
            return None;
        }
        Some(Ranges {
            specs,
            size: None,
            intervals: Vec::new(),
        })
    }

    pub fn specs(&self) -> &[ByteRangeSpec] {
        &self.specs
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Resolve the specs against the size of the resource.
    pub fn set_size(&mut self, size: u64) {
        let mut v: Vec<(u64, u64)> = self.specs.iter().filter_map(|s| s.resolve(size)).collect();
        v.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(v.len());
        for (from, to) in v {
            match merged.last_mut() {
                Some(prev) if from <= prev.1.saturating_add(1) => prev.1 = prev.1.max(to),
                _ => merged.push((from, to)),
            }
        }
        self.size = Some(size);
        self.intervals = merged;
    }

    /// Disjoint, sorted, inclusive intervals. Empty until `set_size`.
    pub fn intervals(&self) -> &[(u64, u64)] {
        &self.intervals
    }

    /// After `set_size`: does at least one spec overlap the resource?
    pub fn is_satisfiable(&self) -> bool {
        !self.intervals.is_empty()
    }

    /// The single interval, if the request collapsed into exactly one.
    pub fn single(&self) -> Option<(u64, u64)> {
        match self.intervals[..] {
            [one] => Some(one),
            _ => None,
        }
    }

    /// `Content-Range` value (`bytes X-Y/size`) for a single-interval result.
    /// Disjoint multi-range results have no single representation.
    pub fn format(&self) -> Option<String> {
        let size = self.size?;
        let (from, to) = self.single()?;
        Some(format!("bytes {from}-{to}/{size}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(value: &str, size: u64) -> Option<String> {
        let mut r = Ranges::parse(value)?;
        r.set_size(size);
        r.format()
    }

    #[test]
    fn single_ranges() {
        assert_eq!(resolved("bytes=10-20", 30).as_deref(), Some("bytes 10-20/30"));
        assert_eq!(resolved("bytes=-20", 30).as_deref(), Some("bytes 10-29/30"));
        assert_eq!(resolved("bytes=10-", 30).as_deref(), Some("bytes 10-29/30"));
        assert_eq!(resolved("bytes=0-100", 30).as_deref(), Some("bytes 0-29/30"));
        assert_eq!(resolved("bytes=-100", 30).as_deref(), Some("bytes 0-29/30"));
        assert_eq!(resolved("bytes= 1 - 2 ", 30).as_deref(), Some("bytes 1-2/30"));
    }

    #[test]
    fn malformed() {
        for v in [
            "bytes=w10-20",
            "bytes=,10-20",
            "bytes=10-20,",
            "bytes=-",
            "bytes=",
            "10-20",
            "items=10-20",
            "bytes=20-10",
            "bytes=1-2-3",
            "bytes=99999999999999999999-",
        ] {
            assert!(Ranges::parse(v).is_none(), "{v}");
        }
    }

    #[test]
    fn coalescing() {
        assert_eq!(resolved("bytes=10-20,-40", 50).as_deref(), Some("bytes 10-49/50"));
        assert_eq!(resolved("bytes=10-20,21-30", 50).as_deref(), Some("bytes 10-30/50"));
        assert_eq!(resolved("bytes=30-40,10-35", 50).as_deref(), Some("bytes 10-40/50"));

        let mut r = Ranges::parse("bytes=10-20,30-40").unwrap();
        r.set_size(50);
        assert_eq!(r.intervals(), &[(10, 20), (30, 40)]);
        assert_eq!(r.format(), None);
    }

    #[test]
    fn unsatisfiable() {
        let mut r = Ranges::parse("bytes=100-200").unwrap();
        r.set_size(50);
        assert!(!r.is_satisfiable());
        assert_eq!(r.format(), None);

        let mut r = Ranges::parse("bytes=100-200,0-0").unwrap();
        r.set_size(50);
        assert_eq!(r.format().as_deref(), Some("bytes 0-0/50"));

        let mut r = Ranges::parse("bytes=0-").unwrap();
        r.set_size(0);
        assert!(!r.is_satisfiable());
    }

    #[test]
    fn unresolved_until_sized() {
        let r = Ranges::parse("bytes=-5").unwrap();
        assert_eq!(r.specs(), &[ByteRangeSpec::Last(5)]);
        assert_eq!(r.format(), None);
        assert!(r.intervals().is_empty());
    }
}
