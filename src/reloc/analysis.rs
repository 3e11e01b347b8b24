//! Source-buffer instruction analysis
//!
//! First phase of relocation: decode the source chunk into an ordered list
//! of instructions and build the cross-reference graph between
//! instructions whose relative operands target other instructions in the
//! same chunk.

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::vec::Vec;

#[cfg(feature = "std")]
use std::vec::Vec;

use iced_x86::Mnemonic;

use crate::asm::decoder::{DecodedInstruction, InstructionDecoder};
use crate::error::{Result, ShadeError};

/// one decoded source instruction with its cross-reference state
#[derive(Debug, Clone)]
pub struct AnalyzedInstruction {
    /// byte offset of the instruction within the source buffer
    pub address_offset: usize,
    /// absolute runtime address of the instruction
    pub address: u64,
    /// decoded form
    pub decoded: DecodedInstruction,
    /// the instruction refers to a target through a relative operand
    pub has_relative_target: bool,
    /// the relative target lies outside the analyzed chunk
    pub has_external_target: bool,
    /// at least one instruction in the chunk targets this one
    pub is_internal_target: bool,
    /// resolved absolute target address, or 0 without a relative target
    pub absolute_target_address: u64,
    /// indices of chunk instructions targeting this one; non-empty iff
    /// `is_internal_target`
    pub incoming: Vec<u8>,
    /// index of the chunk instruction this one targets, if internal
    pub outgoing: Option<u8>,
}

/// result of analyzing a source chunk
#[derive(Debug, Clone)]
pub struct InstructionAnalysis {
    /// analyzed instructions in source order
    pub instructions: Vec<AnalyzedInstruction>,
    /// exact number of bytes covered; at least `bytes_to_analyze`
    pub bytes_read: usize,
}

/// analyze the code at the start of `buffer`
///
/// Decodes instructions sequentially until at least `bytes_to_analyze`
/// bytes are covered; more bytes are read when needed so that no
/// instruction is split. `address` is the runtime address of the buffer
/// (pass `buffer.as_ptr() as u64` for in-place analysis). A byte sequence
/// the decoder rejects aborts the analysis.
pub fn analyze_instructions(
    decoder: &InstructionDecoder,
    buffer: &[u8],
    address: u64,
    bytes_to_analyze: usize,
    capacity: usize,
) -> Result<InstructionAnalysis> {
    let mut instructions: Vec<AnalyzedInstruction> = Vec::with_capacity(capacity);

    // first pass: decode and resolve absolute targets
    let mut offset = 0usize;
    while offset < bytes_to_analyze {
        if offset > u8::MAX as usize {
            return Err(ShadeError::ChunkTooLarge { bytes: offset });
        }

        let decoded = decoder
            .decode_at(address + offset as u64, &buffer[offset..])
            .ok_or(ShadeError::DecodeFailed { offset })?;
        let length = decoded.length;

        let has_relative_target = decoded.is_relative;
        instructions.push(AnalyzedInstruction {
            address_offset: offset,
            address: address + offset as u64,
            has_relative_target,
            has_external_target: has_relative_target,
            is_internal_target: false,
            absolute_target_address: decoded.target.unwrap_or(0),
            incoming: Vec::new(),
            outgoing: None,
            decoded,
        });

        offset += length;
    }
    let bytes_read = offset;

    // second pass: connect relative operands to the instructions they
    // target inside the chunk; targets that do not land exactly on an
    // instruction start stay external
    for i in 0..instructions.len() {
        for j in 0..instructions.len() {
            if instructions[j].has_relative_target
                && instructions[j].absolute_target_address == instructions[i].address
            {
                instructions[j].has_external_target = false;
                instructions[j].outgoing = Some(i as u8);

                instructions[i].is_internal_target = true;
                instructions[i].incoming.push(j as u8);
            }
        }
    }

    Ok(InstructionAnalysis {
        instructions,
        bytes_read,
    })
}

/// true for the relative branch instructions the relocator handles:
/// `JMP`, all `Jcc`, `JCXZ`/`JECXZ`/`JRCXZ` and `LOOP`/`LOOPE`/`LOOPNE`
pub fn is_relative_branch(decoded: &DecodedInstruction) -> bool {
    if !decoded.imm_is_relative {
        return false;
    }

    matches!(
        decoded.mnemonic(),
        Mnemonic::Jmp
            | Mnemonic::Jo
            | Mnemonic::Jno
            | Mnemonic::Jb
            | Mnemonic::Jae
            | Mnemonic::Je
            | Mnemonic::Jne
            | Mnemonic::Jbe
            | Mnemonic::Ja
            | Mnemonic::Js
            | Mnemonic::Jns
            | Mnemonic::Jp
            | Mnemonic::Jnp
            | Mnemonic::Jl
            | Mnemonic::Jge
            | Mnemonic::Jle
            | Mnemonic::Jg
            | Mnemonic::Jcxz
            | Mnemonic::Jecxz
            | Mnemonic::Jrcxz
            | Mnemonic::Loop
            | Mnemonic::Loope
            | Mnemonic::Loopne
    )
}

/// true for instructions with a RIP-relative memory operand
///
/// This is the long-mode reading of ModR/M `mod = 00, rm = 101`; the
/// 32-bit interpretation of that encoding is an absolute address and is
/// never PC-relative, so it does not classify.
pub fn is_relative_memory(decoded: &DecodedInstruction) -> bool {
    decoded.inner.is_ip_rel_memory_operand()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(bytes: &[u8], address: u64, min: usize) -> InstructionAnalysis {
        analyze_instructions(&InstructionDecoder::x64(), bytes, address, min, 8).unwrap()
    }

    #[test]
    fn test_analyze_nops() {
        let code = [0x90, 0x90, 0x90, 0x90, 0x90];
        let analysis = analyze(&code, 0x1000, 5);

        assert_eq!(analysis.bytes_read, 5);
        assert_eq!(analysis.instructions.len(), 5);
        for (i, inst) in analysis.instructions.iter().enumerate() {
            assert_eq!(inst.address_offset, i);
            assert_eq!(inst.address, 0x1000 + i as u64);
            assert!(!inst.has_relative_target);
            assert!(!inst.has_external_target);
            assert!(!inst.is_internal_target);
            assert_eq!(inst.outgoing, None);
            assert!(inst.incoming.is_empty());
        }
    }

    #[test]
    fn test_analyze_reads_whole_instructions() {
        // mov rbp, rsp is 3 bytes; asking for 2 must not split it
        let code = [0x48, 0x89, 0xE5, 0x90];
        let analysis = analyze(&code, 0x1000, 2);

        assert_eq!(analysis.bytes_read, 3);
        assert_eq!(analysis.instructions.len(), 1);
    }

    #[test]
    fn test_analyze_byte_count_invariant() {
        // push rbp; mov rbp, rsp; sub rsp, 0x28
        let code = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x28];
        let analysis = analyze(&code, 0x1000, 5);

        let total: usize = analysis.instructions.iter().map(|i| i.decoded.length).sum();
        assert_eq!(total, analysis.bytes_read);
        assert!(analysis.bytes_read >= 5);
    }

    #[test]
    fn test_analyze_internal_branch() {
        // jmp +1; nop; ret -- the jump lands on the ret
        let code = [0xEB, 0x01, 0x90, 0xC3];
        let analysis = analyze(&code, 0x1000, 4);

        assert_eq!(analysis.instructions.len(), 3);

        let jmp = &analysis.instructions[0];
        assert!(jmp.has_relative_target);
        assert!(!jmp.has_external_target);
        assert_eq!(jmp.outgoing, Some(2));
        assert_eq!(jmp.absolute_target_address, 0x1003);

        let ret = &analysis.instructions[2];
        assert!(ret.is_internal_target);
        assert_eq!(ret.incoming, [0]);
    }

    #[test]
    fn test_analyze_external_branch() {
        // jmp +0x50 leaves the chunk
        let code = [0xEB, 0x50, 0x90];
        let analysis = analyze(&code, 0x1000, 3);

        let jmp = &analysis.instructions[0];
        assert!(jmp.has_relative_target);
        assert!(jmp.has_external_target);
        assert_eq!(jmp.outgoing, None);
        assert_eq!(jmp.absolute_target_address, 0x1052);
    }

    #[test]
    fn test_analyze_target_inside_instruction_is_external() {
        // jmp -1 points at its own displacement byte, not at an
        // instruction start
        let code = [0xEB, 0xFF, 0x90];
        let analysis = analyze(&code, 0x1000, 3);

        let jmp = &analysis.instructions[0];
        assert_eq!(jmp.absolute_target_address, 0x1001);
        assert!(jmp.has_external_target);
        assert_eq!(jmp.outgoing, None);
        assert!(!analysis.instructions[0].is_internal_target);
        assert!(!analysis.instructions[1].is_internal_target);
    }

    #[test]
    fn test_analyze_self_target() {
        // jmp -2 targets itself
        let code = [0xEB, 0xFE];
        let analysis = analyze(&code, 0x1000, 2);

        let jmp = &analysis.instructions[0];
        assert!(!jmp.has_external_target);
        assert_eq!(jmp.outgoing, Some(0));
        assert!(jmp.is_internal_target);
        assert_eq!(jmp.incoming, [0]);
    }

    #[test]
    fn test_analyze_backward_branch() {
        // nop; jz -3 -- the jump lands on the nop
        let code = [0x90, 0x74, 0xFD];
        let analysis = analyze(&code, 0x1000, 3);

        let jz = &analysis.instructions[1];
        assert_eq!(jz.absolute_target_address, 0x1000);
        assert!(!jz.has_external_target);
        assert_eq!(jz.outgoing, Some(0));
        assert_eq!(analysis.instructions[0].incoming, [1]);
    }

    #[test]
    fn test_analyze_rip_relative_internal_target() {
        // mov rax, [rip+2] reads the ret at offset 9
        let code = [
            0x48, 0x8B, 0x05, 0x02, 0x00, 0x00, 0x00, // mov rax, [rip+2]
            0x90, 0x90, // nop; nop
            0xC3, // ret
        ];
        let analysis = analyze(&code, 0x1000, 10);

        let mov = &analysis.instructions[0];
        assert!(mov.has_relative_target);
        assert_eq!(mov.absolute_target_address, 0x1009);
        assert!(!mov.has_external_target);
        assert_eq!(mov.outgoing, Some(3));
    }

    #[test]
    fn test_analyze_decode_failure() {
        // truncated instruction at the end of the buffer
        let code = [0x90, 0x48, 0x8B];
        let err = analyze_instructions(&InstructionDecoder::x64(), &code, 0x1000, 3, 8)
            .unwrap_err();
        assert_eq!(err, ShadeError::DecodeFailed { offset: 1 });
    }

    #[test]
    fn test_analyze_zero_bytes() {
        let analysis = analyze(&[0x90], 0x1000, 0);
        assert_eq!(analysis.bytes_read, 0);
        assert!(analysis.instructions.is_empty());
    }

    #[test]
    fn test_classify_branches() {
        let decoder = InstructionDecoder::x64();

        let jmp = decoder.decode_at(0x1000, &[0xEB, 0x10]).unwrap();
        assert!(is_relative_branch(&jmp));
        assert!(!is_relative_memory(&jmp));

        let jz = decoder.decode_at(0x1000, &[0x74, 0x10]).unwrap();
        assert!(is_relative_branch(&jz));

        let jrcxz = decoder.decode_at(0x1000, &[0xE3, 0x10]).unwrap();
        assert!(is_relative_branch(&jrcxz));

        let loop_ = decoder.decode_at(0x1000, &[0xE2, 0x10]).unwrap();
        assert!(is_relative_branch(&loop_));

        // call is relative but not part of the handled branch set
        let call = decoder.decode_at(0x1000, &[0xE8, 0, 0, 0, 0]).unwrap();
        assert!(!is_relative_branch(&call));

        let nop = decoder.decode_at(0x1000, &[0x90]).unwrap();
        assert!(!is_relative_branch(&nop));
    }

    #[test]
    fn test_classify_memory() {
        let decoder = InstructionDecoder::x64();

        let mov = decoder
            .decode_at(0x1000, &[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00])
            .unwrap();
        assert!(is_relative_memory(&mov));
        assert!(!is_relative_branch(&mov));

        // plain register-indirect load does not classify
        let mov_reg = decoder.decode_at(0x1000, &[0x48, 0x8B, 0x00]).unwrap();
        assert!(!is_relative_memory(&mov_reg));
    }
}
