//! Relocation state
//!
//! `TranslationContext` carries everything one relocation run mutates:
//! the read/write cursors, the analyzed instruction list and the
//! append-only translation map recording where each emitted piece of the
//! source lives in the destination. All destination writes funnel through
//! the bounds-checked helpers here.

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::vec::Vec;

#[cfg(feature = "std")]
use std::vec::Vec;

use crate::error::{Result, ShadeError};
use crate::reloc::analysis::{AnalyzedInstruction, InstructionAnalysis};

/// one source-offset → destination-offset correspondence
///
/// A source instruction rewritten into several destination instructions
/// contributes one entry per emitted instruction, all sharing the source
/// offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// byte offset of the instruction in the source buffer
    pub source_offset: u8,
    /// byte offset of the emitted instruction in the destination buffer
    pub destination_offset: u8,
}

/// mutable state carried through one relocation run
pub struct TranslationContext<'a> {
    source: &'a [u8],
    source_address: u64,
    destination: &'a mut [u8],
    destination_address: u64,
    /// bytes consumed from the source buffer
    pub bytes_read: usize,
    /// bytes emitted into the destination buffer
    pub bytes_written: usize,
    /// source instructions processed so far
    pub instructions_read: usize,
    pub(crate) instructions: &'a [AnalyzedInstruction],
    translation_map: Vec<TranslationEntry>,
}

impl<'a> TranslationContext<'a> {
    /// create a context over an analyzed source chunk and a caller-owned
    /// destination buffer
    ///
    /// `source_address` and `destination_address` are the runtime
    /// addresses the two regions execute at; reach computations use them
    /// rather than the slices' own locations.
    pub fn new(
        analysis: &'a InstructionAnalysis,
        source: &'a [u8],
        source_address: u64,
        destination: &'a mut [u8],
        destination_address: u64,
    ) -> Self {
        Self {
            source,
            source_address,
            destination,
            destination_address,
            bytes_read: 0,
            bytes_written: 0,
            instructions_read: 0,
            instructions: &analysis.instructions,
            translation_map: Vec::with_capacity(analysis.instructions.len()),
        }
    }

    /// runtime address of the source region
    pub fn source_address(&self) -> u64 {
        self.source_address
    }

    /// runtime address of the destination region
    pub fn destination_address(&self) -> u64 {
        self.destination_address
    }

    /// the translation map built so far
    pub fn translation_map(&self) -> &[TranslationEntry] {
        &self.translation_map
    }

    /// bytes of the current source instruction
    pub(crate) fn source_bytes(&self, length: usize) -> &'a [u8] {
        let source = self.source;
        &source[self.bytes_read..self.bytes_read + length]
    }

    /// write bytes at an absolute destination offset
    pub(crate) fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len();
        if end > self.destination.len() {
            return Err(ShadeError::DestinationTooSmall {
                needed: end,
                capacity: self.destination.len(),
            });
        }

        self.destination[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// write a signed field of the given bit width at an absolute
    /// destination offset
    pub(crate) fn patch_field(&mut self, offset: usize, size: usize, value: i32) -> Result<()> {
        match size {
            8 => self.write_at(offset, &(value as i8).to_le_bytes()),
            16 => self.write_at(offset, &(value as i16).to_le_bytes()),
            32 => self.write_at(offset, &value.to_le_bytes()),
            _ => unreachable!("relative operand width {size}"),
        }
    }

    /// append a translation-map entry and account for the emitted bytes
    pub(crate) fn push_translation(
        &mut self,
        written: usize,
        source_offset: usize,
        destination_offset: usize,
    ) -> Result<()> {
        let source_offset = u8::try_from(source_offset)
            .map_err(|_| ShadeError::ChunkTooLarge {
                bytes: source_offset,
            })?;
        let destination_offset = u8::try_from(destination_offset)
            .map_err(|_| ShadeError::ChunkTooLarge {
                bytes: destination_offset,
            })?;

        self.translation_map.push(TranslationEntry {
            source_offset,
            destination_offset,
        });
        self.bytes_written += written;

        Ok(())
    }

    /// destination offset of the relocated instruction that starts at the
    /// given source offset
    ///
    /// If the source instruction was rewritten into a block of several
    /// instructions, the offset of the first one is returned.
    pub fn relocated_offset(&self, source_offset: u8) -> Result<u8> {
        self.translation_map
            .iter()
            .find(|item| item.source_offset == source_offset)
            .map(|item| item.destination_offset)
            .ok_or(ShadeError::TranslationNotFound {
                offset: source_offset,
            })
    }

    pub(crate) fn into_translation_map(self) -> Vec<TranslationEntry> {
        self.translation_map
    }
}
