// ABOUTME: Codec error types: malformed input on decode, unrepresentable values on encode

use thiserror::Error;

/// Why a byte buffer could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReason {
    /// Buffer ended before the value was complete
    #[error("buffer truncated: needed {needed} more byte(s)")]
    Truncated {
        /// Bytes still required to finish the current item
        needed: usize,
    },

    /// Tag byte outside the closed tag set
    #[error("unknown tag byte 0x{0:02X}")]
    UnknownTag(u8),

    /// A length or count prefix claims more data than the buffer holds
    #[error("declared length {declared} exceeds remaining {remaining} byte(s)")]
    LengthOverrun {
        /// Length announced by the prefix
        declared: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// Container nesting deeper than the decoder allows
    #[error("nesting depth exceeds limit of {limit}")]
    DepthExceeded {
        /// Configured depth limit
        limit: usize,
    },

    /// String payload or field name is not valid UTF-8
    #[error("invalid UTF-8")]
    InvalidUtf8,

    /// NaN or infinite float on the wire
    #[error("non-finite float")]
    NonFiniteFloat,

    /// String or byte payload larger than the configured cap
    #[error("payload of {len} bytes exceeds cap of {max}")]
    PayloadTooLarge {
        /// Announced payload length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Bytes left over after a frame that must be consumed exactly
    #[error("{0} trailing byte(s) after value")]
    TrailingBytes(usize),

    /// Structurally valid value with the wrong shape for the expected message
    #[error("unexpected shape: {0}")]
    UnexpectedShape(String),
}

/// Errors produced by the BSATN codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Input bytes are truncated, carry an unknown tag, or violate a limit
    #[error("malformed input at offset {offset}: {reason}")]
    MalformedInput {
        /// Byte offset where decoding stopped
        offset: usize,
        /// What went wrong
        reason: MalformedReason,
    },

    /// Value lies outside the representable set (non-finite float, oversized payload)
    #[error("value cannot be encoded: {0}")]
    Unrepresentable(String),
}

impl CodecError {
    pub(crate) const fn malformed(offset: usize, reason: MalformedReason) -> Self {
        Self::MalformedInput { offset, reason }
    }

    /// Malformed input whose shape, not its bytes, is wrong.
    pub fn shape(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            offset: 0,
            reason: MalformedReason::UnexpectedShape(message.into()),
        }
    }

    /// Returns true for decode-side failures.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedInput { .. })
    }
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;
