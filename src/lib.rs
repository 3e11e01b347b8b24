#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]

//! shade: instruction relocation core for x86/x64 inline hooking
//!
//! When a hook overwrites the first bytes of a function with a jump to a
//! detour, the displaced instructions must keep working from a trampoline
//! buffer at a different address. This crate implements the machinery
//! that makes that possible:
//!
//! - Analysis of a raw byte buffer into an instruction list with a
//!   cross-reference graph between branches and their in-chunk targets
//! - Relocation of each instruction: verbatim copies, displacement
//!   repatching, enlargement of short branches to their near forms, and
//!   synthesis of jump blocks for branches that have no near form
//!   (`JCXZ`/`JECXZ`/`JRCXZ`, `LOOP`/`LOOPE`/`LOOPNE`)
//! - Adjustment of RIP-relative memory displacements
//! - A translation map relating source offsets to destination offsets,
//!   usable for migrating parked instruction pointers
//!
//! Everything operates on caller-owned buffers with explicit runtime
//! addresses; allocating executable memory, patching the hooked function
//! and suspending threads are the installer's business.
//!
//! # Example
//!
//! ```
//! use shade::Relocator;
//!
//! // push rbp; mov rbp, rsp; sub rsp, 0x28
//! let prologue = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x28];
//! let mut trampoline = [0u8; 32];
//!
//! let relocated = Relocator::x64()
//!     .build_trampoline(&prologue, 0x1000, &mut trampoline, 0x2000, 5)
//!     .unwrap();
//!
//! assert_eq!(relocated.bytes_read, 8);
//! // relocated prologue plus the 5-byte jump back to 0x1008
//! assert_eq!(relocated.bytes_written, 13);
//! ```
//!
//! # Feature Flags
//!
//! - `std` (default): Use the standard library. Disable for `no_std`
//!   environments.
//! - `alloc`: Enable heap allocation in `no_std` mode (requires an
//!   allocator).

#[cfg(all(not(feature = "std"), feature = "alloc"))]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod arch;
pub mod asm;
pub mod error;
pub mod reloc;

// re-exports for convenience
pub use error::{Result, ShadeError};
pub use reloc::{
    analyze_instructions, is_relative_branch, is_relative_memory, relocate_instruction,
    translate_ip, update_instruction_offsets, AnalyzedInstruction, InstructionAnalysis,
    MigrationDirection, RelocatedCode, Relocator, TranslationContext, TranslationEntry,
};

pub use asm::{DecodedInstruction, InstructionDecoder};

/// library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
