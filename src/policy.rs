//! Cache policy value type
//!
//! Every stored entry carries a policy deciding when it expires and whether
//! a fetch must consult the origin before the cache. The wire encoding is
//! the string stored in the sidecar `p` field: `keep`, `update`, or a
//! decimal expiry time in seconds since the Unix epoch. Anything that fails
//! to parse decodes as `Keep`.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Expiry/refresh directive attached to each cache entry.
#[derive(Debug, Clone, Copy)]
pub enum CachePolicy {
    /// Take the policy from the enclosing group or context
    Default,
    /// Never expires, never re-validated
    Keep,
    /// Force a source fetch before the store is consulted
    Update,
    /// Expired once the given epoch time (seconds) is in the past
    ExpiredAt(f64),
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

impl CachePolicy {
    /// Expire `seconds` from now.
    pub fn in_seconds(seconds: f64) -> Self {
        CachePolicy::ExpiredAt(now_epoch() + seconds)
    }

    /// Expire `minutes` from now.
    pub fn in_minutes(minutes: f64) -> Self {
        Self::in_seconds(minutes * 60.0)
    }

    /// Expire `hours` from now.
    pub fn in_hours(hours: f64) -> Self {
        Self::in_seconds(hours * 3600.0)
    }

    /// Expire `days` from now.
    pub fn in_days(days: f64) -> Self {
        Self::in_seconds(days * 86400.0)
    }

    /// Expire at an absolute point in time.
    pub fn at(date: SystemTime) -> Self {
        let epoch = date
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        CachePolicy::ExpiredAt(epoch)
    }

    /// True once an `ExpiredAt` deadline has passed. `Default`, `Keep` and
    /// `Update` never expire.
    pub fn is_expired(&self) -> bool {
        match self {
            CachePolicy::ExpiredAt(t) => *t < now_epoch(),
            _ => false,
        }
    }

    /// Decode the wire form. Unrecognized input decodes as `Keep`.
    pub fn parse(value: &str) -> Self {
        match value {
            "keep" => CachePolicy::Keep,
            "update" => CachePolicy::Update,
            other => match other.parse::<f64>() {
                Ok(t) => CachePolicy::ExpiredAt(t),
                Err(_) => CachePolicy::Keep,
            },
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Default denotes the same stored state as Keep
            CachePolicy::Default | CachePolicy::Keep => write!(f, "keep"),
            CachePolicy::Update => write!(f, "update"),
            CachePolicy::ExpiredAt(t) => write!(f, "{}", t),
        }
    }
}

impl PartialEq for CachePolicy {
    fn eq(&self, other: &Self) -> bool {
        use CachePolicy::*;
        match (self, other) {
            // Default and Keep denote the same stored state
            (Default | Keep, Default | Keep) => true,
            (Update, Update) => true,
            (ExpiredAt(a), ExpiredAt(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_never_expires() {
        assert!(!CachePolicy::Keep.is_expired());
        assert!(!CachePolicy::Default.is_expired());
        assert!(!CachePolicy::Update.is_expired());
    }

    #[test]
    fn test_expired_at_past_time_is_expired() {
        assert!(CachePolicy::ExpiredAt(1.0).is_expired());
    }

    #[test]
    fn test_expired_at_future_time_is_live() {
        assert!(!CachePolicy::in_hours(1.0).is_expired());
    }

    #[test]
    fn test_convenience_constructors_agree() {
        // The constructors only differ in their unit scale; sampled within
        // the same instant they must land within a second of each other.
        let a = CachePolicy::in_minutes(2.0);
        let b = CachePolicy::in_seconds(120.0);
        match (a, b) {
            (CachePolicy::ExpiredAt(ta), CachePolicy::ExpiredAt(tb)) => {
                assert!((ta - tb).abs() < 1.0);
            }
            _ => panic!("constructors must yield ExpiredAt"),
        }
    }

    #[test]
    fn test_at_uses_absolute_time() {
        let date = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            CachePolicy::at(date),
            CachePolicy::ExpiredAt(1_700_000_000.0)
        );
    }

    #[test]
    fn test_wire_encoding_round_trip() {
        assert_eq!(CachePolicy::Keep.to_string(), "keep");
        assert_eq!(CachePolicy::Update.to_string(), "update");
        assert_eq!(CachePolicy::parse("keep"), CachePolicy::Keep);
        assert_eq!(CachePolicy::parse("update"), CachePolicy::Update);

        let policy = CachePolicy::ExpiredAt(1_700_000_000.5);
        assert_eq!(CachePolicy::parse(&policy.to_string()), policy);
    }

    #[test]
    fn test_default_encodes_as_keep() {
        assert_eq!(CachePolicy::Default.to_string(), "keep");
    }

    #[test]
    fn test_parse_failure_yields_keep() {
        assert_eq!(CachePolicy::parse("whenever"), CachePolicy::Keep);
        assert_eq!(CachePolicy::parse(""), CachePolicy::Keep);
    }

    #[test]
    fn test_default_and_keep_compare_equal() {
        // Both tags denote the same stored state. Write-time group policy
        // resolution is the one code path that distinguishes them, and it
        // matches on the tag rather than using equality.
        assert_eq!(CachePolicy::Default, CachePolicy::Keep);
        assert_eq!(CachePolicy::Keep, CachePolicy::Default);
        assert_ne!(CachePolicy::Keep, CachePolicy::Update);
        assert_ne!(CachePolicy::Update, CachePolicy::ExpiredAt(5.0));
    }

    #[test]
    fn test_expired_at_compares_by_time() {
        assert_eq!(CachePolicy::ExpiredAt(7.0), CachePolicy::ExpiredAt(7.0));
        assert_ne!(CachePolicy::ExpiredAt(7.0), CachePolicy::ExpiredAt(8.0));
    }
}
