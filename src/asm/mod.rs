//! Instruction-level primitives
//!
//! Decoding (via iced-x86) and the small emission helpers the relocation
//! engine is built on.

pub mod decoder;
pub mod encoder;

pub use decoder::{DecodedInstruction, InstructionDecoder, RawField};
pub use encoder::{calc_relative_offset, offset_fits, write_relative_jump};
pub use encoder::{JCC_REL32_SIZE, JMP_REL32_SIZE, JMP_REL8_SIZE};
