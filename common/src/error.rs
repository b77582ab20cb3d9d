use thiserror::Error;

/// Errors surfaced by the block repository and its codecs.
///
/// User input never panics the core; it comes back as one of these. Only
/// invariant violations (indexing a pixel on a too-shallow coordinate,
/// ascending past the root) are treated as caller bugs and panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Malformed input: bad coordinate encoding, bad color string, or a
    /// coordinate too shallow to address a pixel.
    #[error("{0}")]
    BadArgument(String),

    /// The requested block has never been materialized.
    #[error("block does not exist")]
    NotFound,

    /// The target pixel is dry (timed out or fully covered) and immutable.
    #[error("pixel is dry")]
    PixelDry,

    /// The coordinate is deeper than the configured maximum.
    #[error("coordinates exceed the maximum depth")]
    MaxDepthExceeded,

    /// Unexpected condition. Translates to a 500 at the HTTP boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BlockError {
    pub fn bad(message: impl Into<String>) -> Self {
        BlockError::BadArgument(message.into())
    }
}
