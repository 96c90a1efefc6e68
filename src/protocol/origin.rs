//! Sender address validation.
//!
//! Every inbound message carries the address its sender *claims* to have.
//! Both roles run it through [`TrustPolicy::accepts`] before looking at the
//! payload.
//!
//! The default [`TrustPolicy::Prefix`] accepts any reported address that
//! starts with the trusted one. That is not origin equality:
//! `https://good.com` is a prefix of `https://good.com.evil.io`. It stays the
//! default for compatibility with existing peers; use [`TrustPolicy::Exact`]
//! when both sides agree on exact addresses.

/// How a reported sender address is matched against the trusted address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Accept when the reported address begins with the trusted address.
    #[default]
    Prefix,
    /// Accept only when the reported address equals the trusted address.
    Exact,
}

impl TrustPolicy {
    /// Whether a message reporting `reported` may be processed.
    #[inline]
    pub fn accepts(self, trusted: &str, reported: &str) -> bool {
        match self {
            TrustPolicy::Prefix => reported.starts_with(trusted),
            TrustPolicy::Exact => reported == trusted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_accepts_same_and_longer() {
        let policy = TrustPolicy::Prefix;
        assert!(policy.accepts("mock.com", "mock.com"));
        assert!(policy.accepts("https://good.com", "https://good.com/page"));
        assert!(!policy.accepts("mock.com", "not-origin.com"));
        assert!(!policy.accepts("https://good.com/page", "https://good.com"));
    }

    #[test]
    fn test_prefix_is_spoofable() {
        // Known gap of the compatible policy.
        assert!(TrustPolicy::Prefix.accepts("https://good.com", "https://good.com.evil.io"));
        assert!(!TrustPolicy::Exact.accepts("https://good.com", "https://good.com.evil.io"));
    }

    #[test]
    fn test_exact() {
        assert!(TrustPolicy::Exact.accepts("mock.com", "mock.com"));
        assert!(!TrustPolicy::Exact.accepts("mock.com", "mock.com/"));
    }

    #[test]
    fn test_default_is_prefix() {
        assert_eq!(TrustPolicy::default(), TrustPolicy::Prefix);
    }
}
