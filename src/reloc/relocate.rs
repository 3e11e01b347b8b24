//! Per-instruction relocation strategies and the offset fix-up pass
//!
//! Each analyzed instruction is emitted through one of three strategies:
//! a verbatim copy, a relative-branch rewrite (repatch, enlarge to the
//! 32-bit near form, or synthesize a short-branch block for the
//! mnemonics that have no near form), or a RIP-relative displacement
//! adjustment. Instructions whose relative target lies inside the chunk
//! are copied as placeholders and resolved by [`update_instruction_offsets`]
//! once every destination offset is final.

use iced_x86::Mnemonic;

use crate::asm::decoder::RawField;
use crate::asm::encoder::{self, JCC_REL32_SIZE, JMP_REL32_SIZE};
use crate::error::{Result, ShadeError};
use crate::reloc::analysis::{is_relative_branch, is_relative_memory, AnalyzedInstruction};
use crate::reloc::context::TranslationContext;

/// relocate a single instruction and update the context
pub fn relocate_instruction(
    ctx: &mut TranslationContext<'_>,
    inst: &AnalyzedInstruction,
) -> Result<()> {
    if inst.has_relative_target {
        relocate_relative(ctx, inst)?;
    } else {
        relocate_common(ctx, inst)?;
    }

    ctx.bytes_read += inst.decoded.length;
    ctx.instructions_read += 1;

    Ok(())
}

fn relocate_relative(ctx: &mut TranslationContext<'_>, inst: &AnalyzedInstruction) -> Result<()> {
    if is_relative_branch(&inst.decoded) {
        return relocate_relative_branch(ctx, inst);
    }

    if is_relative_memory(&inst.decoded) {
        return relocate_relative_memory(ctx, inst);
    }

    // analysis only marks branch displacements and RIP-relative memory
    // operands as relative
    unreachable!(
        "unhandled relative instruction at offset {:#x}",
        inst.address_offset
    );
}

/// copy the instruction unchanged
fn relocate_common(ctx: &mut TranslationContext<'_>, inst: &AnalyzedInstruction) -> Result<()> {
    let length = inst.decoded.length;

    let bytes = ctx.source_bytes(length);
    ctx.write_at(ctx.bytes_written, bytes)?;
    ctx.push_translation(length, ctx.bytes_read, ctx.bytes_written)?;

    Ok(())
}

/// true if the branch cannot reach its target from the new location at
/// the encoded displacement width
fn should_rewrite_branch(
    ctx: &TranslationContext<'_>,
    inst: &AnalyzedInstruction,
    size: usize,
) -> bool {
    let source_address = ctx.destination_address() + ctx.bytes_written as u64;
    let distance = inst.absolute_target_address as i64
        - source_address as i64
        - inst.decoded.length as i64;

    !encoder::offset_fits(distance, size)
}

fn relocate_relative_branch(
    ctx: &mut TranslationContext<'_>,
    inst: &AnalyzedInstruction,
) -> Result<()> {
    if !inst.has_external_target {
        // internal offsets are fixed up by `update_instruction_offsets`
        // after all instructions have been emitted
        return relocate_common(ctx, inst);
    }

    let imm = match inst.decoded.imm {
        Some(field) => field,
        None => unreachable!("relative branch without an immediate"),
    };

    if should_rewrite_branch(ctx, inst, imm.size) {
        return match inst.decoded.mnemonic() {
            // no near form exists for these; build the three-instruction
            // block instead
            Mnemonic::Jcxz
            | Mnemonic::Jecxz
            | Mnemonic::Jrcxz
            | Mnemonic::Loop
            | Mnemonic::Loope
            | Mnemonic::Loopne => synthesize_short_branch(ctx, inst, imm),
            _ => enlarge_branch(ctx, inst),
        };
    }

    // still reachable at the encoded width: copy, then recompute the
    // displacement for the new position
    let offset_address = ctx.bytes_written + imm.offset;
    relocate_common(ctx, inst)?;

    let value = encoder::calc_relative_offset(
        0,
        ctx.destination_address() + ctx.bytes_written as u64,
        inst.absolute_target_address,
    );
    ctx.patch_field(offset_address, imm.size, value)
}

/// rewrite an unenlargeable short branch into
/// `<orig, imm=+2> | JMP SHORT +5 | JMP NEAR target`
///
/// Taking the branch falls into the near jump; falling through skips it.
fn synthesize_short_branch(
    ctx: &mut TranslationContext<'_>,
    inst: &AnalyzedInstruction,
    imm: RawField,
) -> Result<()> {
    let length = inst.decoded.length;

    // the retargeted hop below overwrites a single trailing immediate byte
    if imm.size != 8 || imm.offset != length - 1 {
        return Err(ShadeError::UnexpectedEncoding {
            offset: inst.address_offset,
        });
    }

    let start = ctx.bytes_written;

    // copy the original instruction, retargeted into the near jump
    let bytes = ctx.source_bytes(length);
    ctx.write_at(start, bytes)?;
    ctx.write_at(start + imm.offset, &[0x02])?;
    ctx.push_translation(length, ctx.bytes_read, start)?;

    // fall-through path skips the near jump
    ctx.write_at(start + length, &[0xEB, 0x05])?;
    ctx.push_translation(2, ctx.bytes_read, start + length)?;

    // near jump to the external target
    let jmp_offset = start + length + 2;
    let mut jmp = [0u8; JMP_REL32_SIZE];
    encoder::write_relative_jump(
        &mut jmp,
        ctx.destination_address() + jmp_offset as u64,
        inst.absolute_target_address,
    )?;
    ctx.write_at(jmp_offset, &jmp)?;
    ctx.push_translation(JMP_REL32_SIZE, ctx.bytes_read, jmp_offset)?;

    Ok(())
}

/// replace a branch with its 32-bit-displacement near form
fn enlarge_branch(ctx: &mut TranslationContext<'_>, inst: &AnalyzedInstruction) -> Result<()> {
    let start = ctx.bytes_written;

    let mut buf = [0u8; JCC_REL32_SIZE];
    let (head, total) = match inst.decoded.mnemonic() {
        Mnemonic::Jmp => {
            buf[0] = 0xE9;
            (1, JMP_REL32_SIZE)
        }
        mnemonic => {
            buf[0] = 0x0F;
            buf[1] = 0x80 + condition_code(mnemonic);
            (2, JCC_REL32_SIZE)
        }
    };

    let value = encoder::calc_relative_offset(
        4,
        ctx.destination_address() + (start + head) as u64,
        inst.absolute_target_address,
    );
    buf[head..head + 4].copy_from_slice(&value.to_le_bytes());

    ctx.write_at(start, &buf[..total])?;
    ctx.push_translation(total, ctx.bytes_read, start)?;

    Ok(())
}

/// 4-bit condition code of a conditional branch mnemonic
fn condition_code(mnemonic: Mnemonic) -> u8 {
    match mnemonic {
        Mnemonic::Jo => 0x0,
        Mnemonic::Jno => 0x1,
        Mnemonic::Jb => 0x2,
        Mnemonic::Jae => 0x3,
        Mnemonic::Je => 0x4,
        Mnemonic::Jne => 0x5,
        Mnemonic::Jbe => 0x6,
        Mnemonic::Ja => 0x7,
        Mnemonic::Js => 0x8,
        Mnemonic::Jns => 0x9,
        Mnemonic::Jp => 0xA,
        Mnemonic::Jnp => 0xB,
        Mnemonic::Jl => 0xC,
        Mnemonic::Jge => 0xD,
        Mnemonic::Jle => 0xE,
        Mnemonic::Jg => 0xF,
        _ => unreachable!("branch mnemonic {mnemonic:?} has no near form"),
    }
}

fn relocate_relative_memory(
    ctx: &mut TranslationContext<'_>,
    inst: &AnalyzedInstruction,
) -> Result<()> {
    if !inst.has_external_target {
        // internal displacement is fixed up later
        return relocate_common(ctx, inst);
    }

    let disp = match inst.decoded.disp {
        Some(field) => field,
        None => unreachable!("relative memory instruction without a displacement"),
    };

    // copy, then rewrite the displacement so it still reaches the
    // original absolute target
    let offset_address = ctx.bytes_written + disp.offset;
    relocate_common(ctx, inst)?;

    let value = encoder::calc_relative_offset(
        0,
        ctx.destination_address() + ctx.bytes_written as u64,
        inst.absolute_target_address,
    );
    ctx.patch_field(offset_address, disp.size, value)
}

/// rewrite the displacements of instructions with internal relative
/// targets once all destination offsets are final
///
/// Rewritten and enlarged neighbours shift instructions inside the
/// destination buffer, so the placeholder displacements copied during
/// relocation may no longer point at their targets.
pub fn update_instruction_offsets(ctx: &mut TranslationContext<'_>) -> Result<()> {
    let instructions = ctx.instructions;

    for inst in instructions {
        if !inst.has_relative_target || inst.has_external_target {
            continue;
        }

        let field = if is_relative_branch(&inst.decoded) {
            inst.decoded.imm
        } else if is_relative_memory(&inst.decoded) {
            inst.decoded.disp
        } else {
            None
        };
        let field = match field {
            Some(field) => field,
            None => unreachable!("internal relative target without a patchable field"),
        };

        let own_offset = ctx.relocated_offset(inst.address_offset as u8)?;

        let outgoing = match inst.outgoing {
            Some(index) => index,
            None => unreachable!("internal relative target without an outgoing edge"),
        };
        let target = &instructions[outgoing as usize];
        let target_offset = ctx.relocated_offset(target.address_offset as u8)?;

        let value = encoder::calc_relative_offset(
            inst.decoded.length,
            own_offset as u64,
            target_offset as u64,
        );
        ctx.patch_field(own_offset as usize + field.offset, field.size, value)?;
    }

    Ok(())
}
