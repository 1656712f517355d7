//! Error types.

use thiserror::Error;

/// The errors surfaced by the overlay.
///
/// Lost messages aren't errors, they are recovered by the heartbeat, timeout and retry loops.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An identifier didn't have exactly 40 hexadecimal digits.
    #[error("identifier must have 40 hex digits, got {len}")]
    InvalidIdLength { len: usize },

    /// An identifier contained a non-hexadecimal character.
    #[error("identifier contains a non-hex digit: {0}")]
    InvalidIdDigit(String),

    /// The leafset is split into two equal halves around the local identifier.
    #[error("leafset size must be even, got {0}")]
    OddLeafsetSize(usize),

    #[error("leafset size must be greater than zero")]
    ZeroLeafsetSize,

    /// A bootstrap endpoint couldn't be parsed as `ip[:port]`.
    #[error("invalid bootstrap endpoint: {0}")]
    InvalidEndpoint(String),

    /// A nearest node search didn't complete in time.
    #[error("nearest node search timed out")]
    SearchTimedOut,

    /// Every nearest node search attempt failed.
    #[error("nearest node search produced no result")]
    NoSearchResult,
}
