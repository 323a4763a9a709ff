//! Stream tokens and identifier helpers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in a logical change stream.
///
/// Tokens are strictly increasing per allocator. Zero means nothing has been
/// issued yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamToken(pub u64);

impl StreamToken {
    pub const ZERO: StreamToken = StreamToken(0);

    pub fn get(self) -> u64 {
        self.0
    }

    /// The token immediately after this one.
    pub fn next(self) -> StreamToken {
        StreamToken(self.0.saturating_add(1))
    }

    /// The token immediately before this one, stopping at zero.
    pub fn prev(self) -> StreamToken {
        StreamToken(self.0.saturating_sub(1))
    }
}

impl From<u64> for StreamToken {
    fn from(value: u64) -> Self {
        StreamToken(value)
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Domain part of a namespaced identifier such as `@alice:example.org`.
///
/// Everything after the first `:` is the domain, so ports survive
/// (`@bob:example.org:8448` → `example.org:8448`). Returns `None` when the
/// identifier has no `:` separator or an empty domain.
pub fn get_domain_from_id(id: &str) -> Option<&str> {
    let (_, domain) = id.split_once(':')?;
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// Local part of a user id, without the sigil: `@alice:example.org` → `alice`.
pub fn get_localpart_from_id(id: &str) -> Option<&str> {
    let (local, _) = id.split_once(':')?;
    Some(local.strip_prefix('@').unwrap_or(local))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ordering() {
        assert!(StreamToken(3) > StreamToken(2));
        assert_eq!(StreamToken(5).next(), StreamToken(6));
        assert_eq!(StreamToken::ZERO.prev(), StreamToken::ZERO);
    }

    #[test]
    fn test_domain_from_id() {
        assert_eq!(get_domain_from_id("@alice:example.org"), Some("example.org"));
        assert_eq!(get_domain_from_id("@bob:example.org:8448"), Some("example.org:8448"));
        assert_eq!(get_domain_from_id("no-separator"), None);
        assert_eq!(get_domain_from_id("@trailing:"), None);
    }

    #[test]
    fn test_localpart_from_id() {
        assert_eq!(get_localpart_from_id("@alice:a"), Some("alice"));
        assert_eq!(get_localpart_from_id("bare"), None);
    }
}
