//! Code relocation engine
//!
//! Moving the first instructions of a function into a trampoline buffer
//! is a three-step process:
//!
//! 1. [`analyze_instructions`] decodes the source chunk and builds the
//!    cross-reference graph between instructions that target each other.
//! 2. [`relocate_instruction`] emits each instruction into the
//!    destination, rewriting external relative branches and RIP-relative
//!    displacements for the new address.
//! 3. [`update_instruction_offsets`] patches the displacements of
//!    instructions whose targets lie inside the chunk, once every
//!    destination offset is final.
//!
//! [`Relocator`] drives all three steps; the individual operations stay
//! public for hook installers that need finer control.

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::vec::Vec;

#[cfg(feature = "std")]
use std::vec::Vec;

pub mod analysis;
pub mod context;
pub mod migrate;
pub mod relocate;

pub use analysis::{
    analyze_instructions, is_relative_branch, is_relative_memory, AnalyzedInstruction,
    InstructionAnalysis,
};
pub use context::{TranslationContext, TranslationEntry};
pub use migrate::{translate_ip, MigrationDirection};
pub use relocate::{relocate_instruction, update_instruction_offsets};

use crate::asm::decoder::InstructionDecoder;
use crate::asm::encoder::{write_relative_jump, JMP_REL32_SIZE};
use crate::error::Result;

/// default capacity of the analyzed-instruction list
const INSTRUCTION_CAPACITY: usize = 16;

/// result of relocating a source chunk
#[derive(Debug, Clone)]
pub struct RelocatedCode {
    /// bytes consumed from the source buffer
    pub bytes_read: usize,
    /// bytes emitted into the destination buffer
    pub bytes_written: usize,
    /// number of source instructions processed
    pub instructions_read: usize,
    /// source-offset → destination-offset correspondences
    pub translation_map: Vec<TranslationEntry>,
}

/// code relocator for a fixed bitness
pub struct Relocator {
    decoder: InstructionDecoder,
}

impl Relocator {
    /// create relocator for the compilation target
    pub fn native() -> Self {
        Self {
            decoder: InstructionDecoder::native(),
        }
    }

    /// create 64-bit relocator
    pub fn x64() -> Self {
        Self {
            decoder: InstructionDecoder::x64(),
        }
    }

    /// create 32-bit relocator
    pub fn x86() -> Self {
        Self {
            decoder: InstructionDecoder::x86(),
        }
    }

    /// relocate at least `min_bytes` of code from `source` into
    /// `destination`
    ///
    /// `source_address` and `destination_address` are the runtime
    /// addresses of the two regions. More than `min_bytes` source bytes
    /// are consumed when needed to keep the final instruction intact. On
    /// error the destination prefix is indeterminate and must be
    /// discarded.
    pub fn relocate(
        &self,
        source: &[u8],
        source_address: u64,
        destination: &mut [u8],
        destination_address: u64,
        min_bytes: usize,
    ) -> Result<RelocatedCode> {
        let analysis = analyze_instructions(
            &self.decoder,
            source,
            source_address,
            min_bytes,
            INSTRUCTION_CAPACITY,
        )?;

        let mut ctx = TranslationContext::new(
            &analysis,
            source,
            source_address,
            destination,
            destination_address,
        );

        let instructions = ctx.instructions;
        for inst in instructions {
            relocate_instruction(&mut ctx, inst)?;
        }
        update_instruction_offsets(&mut ctx)?;

        Ok(RelocatedCode {
            bytes_read: ctx.bytes_read,
            bytes_written: ctx.bytes_written,
            instructions_read: ctx.instructions_read,
            translation_map: ctx.into_translation_map(),
        })
    }

    /// relocate and append the near jump back to the first untouched
    /// source instruction, producing a complete trampoline body
    ///
    /// The returned `bytes_written` includes the 5-byte tail jump; the
    /// translation map covers only the relocated instructions.
    pub fn build_trampoline(
        &self,
        source: &[u8],
        source_address: u64,
        destination: &mut [u8],
        destination_address: u64,
        min_bytes: usize,
    ) -> Result<RelocatedCode> {
        let mut relocated = self.relocate(
            source,
            source_address,
            destination,
            destination_address,
            min_bytes,
        )?;

        write_relative_jump(
            &mut destination[relocated.bytes_written..],
            destination_address + relocated.bytes_written as u64,
            source_address + relocated.bytes_read as u64,
        )?;
        relocated.bytes_written += JMP_REL32_SIZE;

        Ok(relocated)
    }
}
