//! Unified error types for shade

use core::fmt;

/// all errors that can occur during analysis and relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadeError {
    // === analysis ===
    /// bytes at the given offset could not be decoded as a complete instruction
    DecodeFailed { offset: usize },

    /// the analyzed chunk is too large for the translation map's offset range
    ChunkTooLarge { bytes: usize },

    // === relocation ===
    /// the destination buffer cannot hold the emitted code
    DestinationTooSmall { needed: usize, capacity: usize },

    /// a rewritten instruction does not carry the expected immediate encoding
    UnexpectedEncoding { offset: usize },

    // === fix-up ===
    /// no translation-map entry exists for the given source offset
    TranslationNotFound { offset: u8 },
}

impl fmt::Display for ShadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecodeFailed { offset } => {
                write!(f, "failed to decode instruction at offset {offset:#x}")
            }
            Self::ChunkTooLarge { bytes } => {
                write!(
                    f,
                    "analyzed chunk of {bytes} bytes exceeds the translation map range"
                )
            }
            Self::DestinationTooSmall { needed, capacity } => {
                write!(
                    f,
                    "destination buffer too small: need {needed} bytes, have {capacity}"
                )
            }
            Self::UnexpectedEncoding { offset } => {
                write!(
                    f,
                    "unexpected immediate encoding in instruction at offset {offset:#x}"
                )
            }
            Self::TranslationNotFound { offset } => {
                write!(f, "no relocated instruction for source offset {offset:#x}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ShadeError {}

/// result type alias using ShadeError
pub type Result<T> = core::result::Result<T, ShadeError>;
