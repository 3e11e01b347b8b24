//! Instruction decoding bridge over iced-x86
//!
//! The relocation engine only needs a handful of facts about each
//! instruction: its length, its mnemonic, whether it carries a PC-relative
//! operand, the resolved absolute target, and where the encoded
//! immediate / displacement fields sit inside the instruction bytes. This
//! module extracts those facts once at decode time so the rest of the
//! engine never touches decoder internals.

use iced_x86::{Code, Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind};

use crate::arch;

/// position of an encoded operand field within an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawField {
    /// byte offset of the field from the instruction start
    pub offset: usize,
    /// field width in bits (8, 16 or 32)
    pub size: usize,
}

/// decoded instruction with the metadata relocation needs
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    /// the raw iced-x86 instruction
    pub inner: Instruction,
    /// instruction length in bytes
    pub length: usize,
    /// whether the instruction encodes a PC-relative operand
    /// (branch displacement or RIP-relative memory operand)
    pub is_relative: bool,
    /// encoded position of the first immediate, if any
    pub imm: Option<RawField>,
    /// whether the first immediate is a PC-relative branch displacement
    pub imm_is_relative: bool,
    /// encoded position of the RIP-relative memory displacement, if any
    pub disp: Option<RawField>,
    /// resolved absolute target address for PC-relative operands
    pub target: Option<u64>,
}

impl DecodedInstruction {
    /// get the instruction mnemonic
    pub fn mnemonic(&self) -> Mnemonic {
        self.inner.mnemonic()
    }
}

/// instruction decoder for a fixed bitness
pub struct InstructionDecoder {
    bitness: u32,
}

impl InstructionDecoder {
    /// create decoder for the compilation target
    pub fn native() -> Self {
        Self {
            bitness: arch::native_bitness(),
        }
    }

    /// create 64-bit decoder
    pub fn x64() -> Self {
        Self { bitness: 64 }
    }

    /// create 32-bit decoder
    pub fn x86() -> Self {
        Self { bitness: 32 }
    }

    /// decoder bitness (32 or 64)
    pub fn bitness(&self) -> u32 {
        self.bitness
    }

    /// decode a single instruction located at the given runtime address
    pub fn decode_at(&self, address: u64, bytes: &[u8]) -> Option<DecodedInstruction> {
        if bytes.is_empty() {
            return None;
        }

        let mut decoder = Decoder::with_ip(self.bitness, bytes, address, DecoderOptions::NONE);

        if !decoder.can_decode() {
            return None;
        }

        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return None;
        }

        Some(analyze_instruction(instruction))
    }
}

fn analyze_instruction(instruction: Instruction) -> DecodedInstruction {
    let length = instruction.len();
    let (imm_first, imm_total) = immediate_bytes(&instruction);

    let mut is_relative = false;
    let mut imm_is_relative = false;
    let mut target = None;

    // trailing immediate bytes, if the instruction has immediate operands
    let mut imm = (imm_total > 0).then(|| RawField {
        offset: length - imm_total,
        size: imm_first * 8,
    });

    // a near-branch operand supersedes the immediate view: the branch
    // displacement is the trailing field of the instruction
    if has_near_branch_operand(&instruction) {
        let size = branch_displacement_bytes(&instruction);
        imm = Some(RawField {
            offset: length - size,
            size: size * 8,
        });
        imm_is_relative = true;
        is_relative = true;
        target = Some(instruction.near_branch_target());
    }

    // RIP-relative memory operand: disp32 sits between ModR/M (or SIB)
    // and any immediate bytes
    let mut disp = None;
    if instruction.is_ip_rel_memory_operand() {
        disp = Some(RawField {
            offset: length - 4 - imm_total,
            size: 32,
        });
        is_relative = true;
        target = Some(instruction.ip_rel_memory_address());
    }

    DecodedInstruction {
        inner: instruction,
        length,
        is_relative,
        imm,
        imm_is_relative,
        disp,
        target,
    }
}

fn has_near_branch_operand(instruction: &Instruction) -> bool {
    match instruction.flow_control() {
        FlowControl::UnconditionalBranch
        | FlowControl::ConditionalBranch
        | FlowControl::Call
        | FlowControl::XbeginXabortXend => matches!(
            instruction.op0_kind(),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        ),
        _ => false,
    }
}

/// encoded width of a branch displacement in bytes
fn branch_displacement_bytes(instruction: &Instruction) -> usize {
    if instruction.is_jcc_short()
        || instruction.is_jmp_short()
        || instruction.is_jcx_short()
        || instruction.is_loop()
        || instruction.is_loopcc()
    {
        return 1;
    }

    match instruction.code() {
        Code::Jmp_rel16
        | Code::Call_rel16
        | Code::Xbegin_rel16
        | Code::Jo_rel16
        | Code::Jno_rel16
        | Code::Jb_rel16
        | Code::Jae_rel16
        | Code::Je_rel16
        | Code::Jne_rel16
        | Code::Jbe_rel16
        | Code::Ja_rel16
        | Code::Js_rel16
        | Code::Jns_rel16
        | Code::Jp_rel16
        | Code::Jnp_rel16
        | Code::Jl_rel16
        | Code::Jge_rel16
        | Code::Jle_rel16
        | Code::Jg_rel16 => 2,
        _ => 4,
    }
}

/// encoded size of the first immediate and the total immediate bytes
fn immediate_bytes(instruction: &Instruction) -> (usize, usize) {
    let mut first = 0;
    let mut total = 0;

    for i in 0..instruction.op_count() {
        let size = match instruction.op_kind(i) {
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64 => 1,
            OpKind::Immediate16 => 2,
            OpKind::Immediate32 | OpKind::Immediate32to64 => 4,
            OpKind::Immediate64 => 8,
            _ => 0,
        };
        if size != 0 {
            if first == 0 {
                first = size;
            }
            total += size;
        }
    }

    (first, total)
}
