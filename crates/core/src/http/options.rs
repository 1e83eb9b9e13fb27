//! Per-deferred HTTP logging/tracing option bits.

use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Bitset steering what a deferred logs or traces about its HTTP calls.
///
/// `OAUTH2` and `NON_OAUTH2` select which client's lines pass the filter;
/// `LOG` emits lines immediately, `TRACE` buffers them for a failure flush,
/// `REDACT` scrubs credentials before either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpOptions(u8);

impl HttpOptions {
    pub const NONE: Self = Self(0);
    pub const LOG: Self = Self(1 << 0);
    pub const TRACE: Self = Self(1 << 1);
    pub const REDACT: Self = Self(1 << 2);
    pub const OAUTH2: Self = Self(1 << 3);
    pub const NON_OAUTH2: Self = Self(1 << 4);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for HttpOptions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for HttpOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for HttpOptions {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for HttpOptions {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_contains() {
        let mut options = HttpOptions::OAUTH2 | HttpOptions::TRACE | HttpOptions::REDACT;
        assert!(options.contains(HttpOptions::TRACE));
        assert!(!options.contains(HttpOptions::LOG));

        options.insert(HttpOptions::LOG);
        assert!(options.contains(HttpOptions::LOG | HttpOptions::TRACE));

        options.remove(HttpOptions::REDACT);
        assert!(!options.contains(HttpOptions::REDACT));
    }

    #[test]
    fn channel_bits_are_disjoint() {
        let oauth2 = (HttpOptions::OAUTH2 | HttpOptions::TRACE) & !HttpOptions::NON_OAUTH2;
        assert!(oauth2.intersects(HttpOptions::OAUTH2));
        assert!(!oauth2.intersects(HttpOptions::NON_OAUTH2));
    }
}
