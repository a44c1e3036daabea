//! Correlation tokens for in-flight shadow publishes.
//!
//! Tokens are derived from a monotonic millisecond clock (modulo 1,000,000) so
//! they stay six digits on the wire. The clock is anchored to the wall clock
//! once per process and then advances with `Instant`, so later wall-clock
//! jumps cannot repeat tokens. Consecutive tokens from one tracker never
//! collide: a repeated value is advanced by one.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Token values wrap at this modulus.
pub const TOKEN_MODULUS: u64 = 1_000_000;

/// Digits of a token on the wire.
pub const TOKEN_DIGITS: usize = 6;

/// An opaque correlation value carried as the document `clientToken`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(u32);

impl CorrelationToken {
    /// Raw token value.
    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }

    fn from_millis(ms: u64) -> Self {
        // modulus keeps the value below 10^6
        Self(u32::try_from(ms % TOKEN_MODULUS).unwrap_or(0))
    }

    fn next(self) -> Self {
        Self::from_millis(u64::from(self.0) + 1)
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl FromStr for CorrelationToken {
    type Err = InvalidToken;

    /// Accepts only the exact wire form: six ASCII digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TOKEN_DIGITS || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidToken(s.to_string()));
        }
        s.parse().map(Self).map_err(|_| InvalidToken(s.to_string()))
    }
}

/// A clientToken that is not in the six-digit wire form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid correlation token: {0:?}")]
pub struct InvalidToken(String);

/// Shadow operation a token correlates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Delete request
    Delete,
    /// Update request
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete => f.write_str("delete"),
            Self::Update => f.write_str("update"),
        }
    }
}

/// Issues tokens and tracks the one pending token per operation.
#[derive(Debug, Clone, Default)]
pub struct CorrelationTracker {
    last_issued: Option<CorrelationToken>,
    pending_delete: Option<CorrelationToken>,
    pending_update: Option<CorrelationToken>,
}

impl CorrelationTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token from the monotonic clock.
    pub fn issue(&mut self) -> CorrelationToken {
        self.issue_at(current_time_ms())
    }

    pub(crate) fn issue_at(&mut self, now_ms: u64) -> CorrelationToken {
        let mut token = CorrelationToken::from_millis(now_ms);
        if self.last_issued == Some(token) {
            token = token.next();
        }
        self.last_issued = Some(token);
        token
    }

    /// Arm `token` as the pending token for `operation`, replacing any
    /// previous one.
    pub fn remember(&mut self, operation: Operation, token: CorrelationToken) {
        *self.slot(operation) = Some(token);
    }

    /// Currently pending token for `operation`.
    #[must_use]
    pub fn pending(&self, operation: Operation) -> Option<CorrelationToken> {
        match operation {
            Operation::Delete => self.pending_delete,
            Operation::Update => self.pending_update,
        }
    }

    /// Check `token` against the pending token for `operation`.
    ///
    /// Returns true and retires the pending token on a match. On a mismatch
    /// the pending token stays armed.
    pub fn confirm(&mut self, operation: Operation, token: Option<CorrelationToken>) -> bool {
        let slot = self.slot(operation);
        if token.is_some() && *slot == token {
            *slot = None;
            return true;
        }
        false
    }

    /// Discard every pending token.
    pub fn abandon(&mut self) {
        self.pending_delete = None;
        self.pending_update = None;
    }

    fn slot(&mut self, operation: Operation) -> &mut Option<CorrelationToken> {
        match operation {
            Operation::Delete => &mut self.pending_delete,
            Operation::Update => &mut self.pending_update,
        }
    }
}

struct MonotonicClock {
    origin: Instant,
    origin_ms: u64,
}

static CLOCK: OnceLock<MonotonicClock> = OnceLock::new();

/// Milliseconds on a clock that never goes backwards. The epoch offset is
/// read once per process so tokens still differ across restarts.
fn current_time_ms() -> u64 {
    let clock = CLOCK.get_or_init(|| MonotonicClock {
        origin: Instant::now(),
        origin_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| millis(elapsed.as_millis())),
    });
    clock
        .origin_ms
        .saturating_add(millis(clock.origin.elapsed().as_millis()))
}

fn millis(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
