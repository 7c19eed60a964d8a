//! The ARM (AArch32) backend: relocation classification and application,
//! PLT stub encodings, and target section layout hints.
//!
//! Little-endian EABI, REL-form dynamic relocations. Thumb interworking is
//! limited to stripping the Thumb bit from function addresses at ingest;
//! veneers between states are not generated.

use crate::elf::*;
use crate::module::Module;
use crate::section::{Section, SectionFlags, SectionKind};
use crate::symbol::ResolveInfo;
use crate::target::{ApplyVars, Backend, RelocClass, RelocStatus, SectionOrder};

pub fn backend() -> Backend {
    Backend {
        name: "arm",
        machine: EM_ARM,
        elf_flags: EF_ARM_ABI_VER5 | EF_ARM_ABI_FLOAT_HARD,
        plt0_size: 20,
        plt1_size: 16,
        got_entry_size: 4,
        rel_entry_size: REL32_SIZE as u64,
        rel_glob_dat: R_ARM_GLOB_DAT,
        rel_jump_slot: R_ARM_JUMP_SLOT,
        rel_relative: R_ARM_RELATIVE,
        rel_abs: R_ARM_ABS32,
        classify,
        apply,
        section_order,
        init_target_sections,
        make_plt0,
        make_plt1,
        finalize_symbol,
    }
}

// ── Classification ───────────────────────────────────────────────────────────

fn classify(rtype: u32) -> RelocClass {
    match rtype {
        // PC24 is the pre-EABI branch form: still applied, but the scanner
        // reserves nothing for it.
        R_ARM_NONE | R_ARM_V4BX | R_ARM_PC24 => RelocClass::None,

        // Word-sized absolute references survive as dynamic relocations.
        R_ARM_ABS32 | R_ARM_TARGET1 => RelocClass::Absolute { dyn_ok: true },
        // Narrow fields cannot be fixed up by the dynamic linker.
        R_ARM_ABS16 | R_ARM_ABS12 | R_ARM_THM_ABS5 | R_ARM_ABS8 | R_ARM_BASE_ABS
        | R_ARM_MOVW_ABS_NC | R_ARM_MOVT_ABS | R_ARM_THM_MOVW_ABS_NC | R_ARM_THM_MOVT_ABS => {
            RelocClass::Absolute { dyn_ok: false }
        }

        R_ARM_REL32 | R_ARM_BASE_PREL | R_ARM_MOVW_PREL_NC | R_ARM_MOVT_PREL
        | R_ARM_THM_MOVW_PREL_NC | R_ARM_THM_MOVT_PREL => RelocClass::PcRel { dyn_ok: false },

        R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PLT32 | R_ARM_THM_CALL | R_ARM_THM_JUMP24
        | R_ARM_THM_JUMP11 | R_ARM_THM_JUMP8 | R_ARM_PREL31 => RelocClass::Branch,

        R_ARM_GOTOFF32 | R_ARM_GOTOFF12 => RelocClass::GotOff,
        R_ARM_GOT_BREL | R_ARM_GOT_PREL | R_ARM_GOT_ABS | R_ARM_TARGET2 => {
            RelocClass::GotIndirect
        }

        R_ARM_COPY | R_ARM_GLOB_DAT | R_ARM_JUMP_SLOT | R_ARM_RELATIVE => RelocClass::DynOnly,

        _ => RelocClass::Unsupported,
    }
}

// ── Application ──────────────────────────────────────────────────────────────

fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn apply(vars: &ApplyVars) -> (u64, RelocStatus) {
    let data = vars.data as u32;
    let s = vars.s as i64;
    let p = vars.p as i64;
    let word = |x: i64| x as u32 as u64;

    match vars.rtype {
        R_ARM_NONE | R_ARM_V4BX => (vars.data, RelocStatus::Ok),

        R_ARM_ABS32 | R_ARM_TARGET1 => {
            let a = sign_extend(data as u64, 32) + vars.a;
            (word(s + a), RelocStatus::Ok)
        }

        R_ARM_REL32 => {
            let a = sign_extend(data as u64, 32) + vars.a;
            (word(s + a - p), RelocStatus::Ok)
        }

        R_ARM_PREL31 => {
            let a = sign_extend(data as u64 & 0x7fff_ffff, 31) + vars.a;
            let x = s + a - p;
            if !(-(1 << 30)..(1 << 30)).contains(&x) {
                return (vars.data, RelocStatus::Overflow);
            }
            ((data as u64 & 0x8000_0000) | (x as u32 as u64 & 0x7fff_ffff), RelocStatus::Ok)
        }

        R_ARM_PC24 | R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PLT32 => {
            // BL/B: imm24 holds a signed word offset; the pipeline offset is
            // folded into the assembled addend.
            let a = sign_extend(((data & 0x00ff_ffff) << 2) as u64, 26) + vars.a;
            let x = s + a - p;
            if x & 3 != 0 {
                return (vars.data, RelocStatus::BadReloc);
            }
            if !(-(1 << 25)..(1 << 25)).contains(&x) {
                return (vars.data, RelocStatus::Overflow);
            }
            let imm24 = ((x >> 2) as u32) & 0x00ff_ffff;
            (((data & 0xff00_0000) | imm24) as u64, RelocStatus::Ok)
        }

        R_ARM_THM_CALL | R_ARM_THM_JUMP24 => {
            let a = decode_thm_branch(data) + vars.a;
            let x = s + a - p;
            if x & 1 != 0 {
                return (vars.data, RelocStatus::BadReloc);
            }
            if !(-(1 << 24)..(1 << 24)).contains(&x) {
                return (vars.data, RelocStatus::Overflow);
            }
            (encode_thm_branch(data, x as i32) as u64, RelocStatus::Ok)
        }

        R_ARM_THM_JUMP11 => {
            // 16-bit B (T2): low halfword of the scratch word.
            let insn = data & 0xffff;
            let a = sign_extend(((insn & 0x7ff) << 1) as u64, 12) + vars.a;
            let x = s + a - p;
            if !(-(1 << 11)..(1 << 11)).contains(&x) {
                return (vars.data, RelocStatus::Overflow);
            }
            let imm11 = ((x >> 1) as u32) & 0x7ff;
            (((data & 0xffff_f800) | imm11) as u64, RelocStatus::Ok)
        }

        R_ARM_THM_JUMP8 => {
            let insn = data & 0xffff;
            let a = sign_extend(((insn & 0xff) << 1) as u64, 9) + vars.a;
            let x = s + a - p;
            if !(-(1 << 8)..(1 << 8)).contains(&x) {
                return (vars.data, RelocStatus::Overflow);
            }
            let imm8 = ((x >> 1) as u32) & 0xff;
            (((data & 0xffff_ff00) | imm8) as u64, RelocStatus::Ok)
        }

        R_ARM_MOVW_ABS_NC | R_ARM_MOVW_PREL_NC => {
            let a = sign_extend(decode_movw_movt(data) as u64, 16) + vars.a;
            let mut x = s + a;
            if vars.rtype == R_ARM_MOVW_PREL_NC {
                x -= p;
            }
            (encode_movw_movt(data, (x as u32) & 0xffff) as u64, RelocStatus::Ok)
        }

        R_ARM_MOVT_ABS | R_ARM_MOVT_PREL => {
            let a = sign_extend(decode_movw_movt(data) as u64, 16) + vars.a;
            let mut x = s + a;
            if vars.rtype == R_ARM_MOVT_PREL {
                x -= p;
            }
            (
                encode_movw_movt(data, ((x as u32) >> 16) & 0xffff) as u64,
                RelocStatus::Ok,
            )
        }

        R_ARM_THM_MOVW_ABS_NC | R_ARM_THM_MOVW_PREL_NC => {
            let a = sign_extend(decode_thm_movw_movt(data) as u64, 16) + vars.a;
            let mut x = s + a;
            if vars.rtype == R_ARM_THM_MOVW_PREL_NC {
                x -= p;
            }
            (
                encode_thm_movw_movt(data, (x as u32) & 0xffff) as u64,
                RelocStatus::Ok,
            )
        }

        R_ARM_THM_MOVT_ABS | R_ARM_THM_MOVT_PREL => {
            let a = sign_extend(decode_thm_movw_movt(data) as u64, 16) + vars.a;
            let mut x = s + a;
            if vars.rtype == R_ARM_THM_MOVT_PREL {
                x -= p;
            }
            (
                encode_thm_movw_movt(data, ((x as u32) >> 16) & 0xffff) as u64,
                RelocStatus::Ok,
            )
        }

        R_ARM_BASE_PREL => {
            let a = sign_extend(data as u64, 32) + vars.a;
            (word(vars.got_origin as i64 + a - p), RelocStatus::Ok)
        }

        R_ARM_GOTOFF32 => {
            let a = sign_extend(data as u64, 32) + vars.a;
            (word(s + a - vars.got_origin as i64), RelocStatus::Ok)
        }

        R_ARM_GOTOFF12 => {
            let x = s + vars.a - vars.got_origin as i64;
            if !(0..0x1000).contains(&x) {
                return (vars.data, RelocStatus::Overflow);
            }
            (((data & 0xffff_f000) | (x as u32 & 0xfff)) as u64, RelocStatus::Ok)
        }

        R_ARM_GOT_BREL => {
            let a = sign_extend(data as u64, 32) + vars.a;
            (
                word(vars.got_entry as i64 + a - vars.got_origin as i64),
                RelocStatus::Ok,
            )
        }

        R_ARM_GOT_PREL | R_ARM_TARGET2 => {
            let a = sign_extend(data as u64, 32) + vars.a;
            (word(vars.got_entry as i64 + a - p), RelocStatus::Ok)
        }

        R_ARM_GOT_ABS => {
            let a = sign_extend(data as u64, 32) + vars.a;
            (word(vars.got_entry as i64 + a), RelocStatus::Ok)
        }

        R_ARM_COPY | R_ARM_GLOB_DAT | R_ARM_JUMP_SLOT | R_ARM_RELATIVE => {
            (vars.data, RelocStatus::BadReloc)
        }

        _ => (vars.data, RelocStatus::Unsupported),
    }
}

// ── Instruction field codecs ─────────────────────────────────────────────────

/// Immediate of an ARM MOVW/MOVT: imm4:imm12.
fn decode_movw_movt(insn: u32) -> u32 {
    ((insn >> 4) & 0xf000) | (insn & 0xfff)
}

fn encode_movw_movt(insn: u32, val: u32) -> u32 {
    let imm12 = val & 0xfff;
    let imm4 = (val >> 12) & 0xf;
    (insn & 0xfff0_f000) | (imm4 << 16) | imm12
}

/// Byte offset carried by a Thumb-2 BL/B.W stored as two little-endian
/// halfwords in one scratch word (upper half first in memory).
fn decode_thm_branch(insn: u32) -> i64 {
    let upper = insn & 0xffff;
    let lower = (insn >> 16) & 0xffff;
    let s = (upper >> 10) & 1;
    let imm10 = upper & 0x3ff;
    let j1 = (lower >> 13) & 1;
    let j2 = (lower >> 11) & 1;
    let imm11 = lower & 0x7ff;
    let i1 = !(j1 ^ s) & 1;
    let i2 = !(j2 ^ s) & 1;
    let raw = (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1);
    sign_extend(raw as u64, 25)
}

fn encode_thm_branch(insn: u32, offset: i32) -> u32 {
    let upper = insn & 0xffff;
    let lower = (insn >> 16) & 0xffff;

    let s = if offset < 0 { 1u32 } else { 0u32 };
    let uoffset = (offset as u32) >> 1;
    let imm11 = uoffset & 0x7ff;
    let imm10 = (uoffset >> 11) & 0x3ff;
    let i2 = (uoffset >> 21) & 1;
    let i1 = (uoffset >> 22) & 1;
    let j1 = ((i1 ^ s) ^ 1) & 1;
    let j2 = ((i2 ^ s) ^ 1) & 1;

    let new_upper = (upper & 0xf800) | (s << 10) | imm10;
    let new_lower = (lower & 0xd000) | (j1 << 13) | (j2 << 11) | imm11;
    new_upper | (new_lower << 16)
}

/// Immediate of a Thumb-2 MOVW/MOVT: imm4:i:imm3:imm8 across both halfwords.
fn decode_thm_movw_movt(insn: u32) -> u32 {
    let upper = insn & 0xffff;
    let lower = (insn >> 16) & 0xffff;
    let imm4 = upper & 0xf;
    let i = (upper >> 10) & 1;
    let imm3 = (lower >> 12) & 0x7;
    let imm8 = lower & 0xff;
    (imm4 << 12) | (i << 11) | (imm3 << 8) | imm8
}

fn encode_thm_movw_movt(insn: u32, val: u32) -> u32 {
    let upper = insn & 0xffff;
    let lower = (insn >> 16) & 0xffff;

    let imm8 = val & 0xff;
    let imm3 = (val >> 8) & 0x7;
    let i = (val >> 11) & 1;
    let imm4 = (val >> 12) & 0xf;

    let new_upper = (upper & 0xfbf0) | (i << 10) | imm4;
    let new_lower = (lower & 0x8f00) | (imm3 << 12) | imm8;
    new_upper | (new_lower << 16)
}

// ── PLT stubs ────────────────────────────────────────────────────────────────

/// PLT0: push the link register, compute the `.got.plt` base, and jump to
/// the resolver through slot 2.
fn make_plt0(plt_addr: u64, gotplt_addr: u64) -> Vec<u8> {
    let got_offset = (gotplt_addr as i64 - plt_addr as i64 - 16) as i32;
    let mut out = Vec::with_capacity(20);
    out.extend_from_slice(&0xe52d_e004u32.to_le_bytes()); // str lr, [sp, #-4]!
    out.extend_from_slice(&0xe59f_e004u32.to_le_bytes()); // ldr lr, [pc, #4]
    out.extend_from_slice(&0xe08f_e00eu32.to_le_bytes()); // add lr, pc, lr
    out.extend_from_slice(&0xe5be_f008u32.to_le_bytes()); // ldr pc, [lr, #8]!
    out.extend_from_slice(&(got_offset as u32).to_le_bytes());
    out
}

/// PLT1: indirect jump through the entry's `.got.plt` slot.
fn make_plt1(entry_addr: u64, gotplt_slot_addr: u64) -> Vec<u8> {
    let offset = (gotplt_slot_addr as i64 - entry_addr as i64 - 12) as i32;
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&0xe59f_c004u32.to_le_bytes()); // ldr ip, [pc, #4]
    out.extend_from_slice(&0xe08f_c00cu32.to_le_bytes()); // add ip, pc, ip
    out.extend_from_slice(&0xe59c_f000u32.to_le_bytes()); // ldr pc, [ip]
    out.extend_from_slice(&(offset as u32).to_le_bytes());
    out
}

// ── Layout hints & target sections ───────────────────────────────────────────

fn section_order(section: &Section) -> SectionOrder {
    match section.name.as_str() {
        ".interp" => return SectionOrder::Interp,
        ".dynsym" | ".dynstr" | ".hash" => return SectionOrder::NamePool,
        ".rel.dyn" | ".rel.plt" => return SectionOrder::Rel,
        ".init" => return SectionOrder::Init,
        ".plt" => return SectionOrder::Plt,
        ".text" | ".fini" => return SectionOrder::Text,
        ".got" | ".got.plt" | ".dynamic" | ".init_array" | ".fini_array" | ".preinit_array"
        | ".ctors" | ".dtors" => return SectionOrder::Relro,
        _ => {}
    }
    match section.kind {
        SectionKind::Null => SectionOrder::Null,
        SectionKind::Bss => SectionOrder::Bss,
        SectionKind::Debug => SectionOrder::Debug,
        SectionKind::Plt => SectionOrder::Plt,
        SectionKind::Target => {
            if section.is_alloc() {
                SectionOrder::Data
            } else {
                SectionOrder::Debug
            }
        }
        SectionKind::Regular if section.is_exec() => SectionOrder::Text,
        SectionKind::Data
        | SectionKind::ReadOnly
        | SectionKind::Note
        | SectionKind::GccExceptTable
        | SectionKind::Regular
        | SectionKind::Got => SectionOrder::Data,
        _ => SectionOrder::Undefined,
    }
}

/// Pre-create the ARM-specific output sections so input content has a home.
/// Empty ones are pruned at layout.
fn init_target_sections(module: &mut Module) {
    module.get_or_create_output(
        ".ARM.exidx",
        SectionKind::Target,
        SHT_ARM_EXIDX,
        SectionFlags::ALLOC | SectionFlags::LINK_ORDER,
        4,
    );
    module.get_or_create_output(
        ".ARM.extab",
        SectionKind::Target,
        SHT_PROGBITS,
        SectionFlags::ALLOC,
        4,
    );
    module.get_or_create_output(
        ".ARM.attributes",
        SectionKind::Target,
        SHT_ARM_ATTRIBUTES,
        SectionFlags::empty(),
        1,
    );
}

/// No target-specific symbol finalization on ARM; the generic FragmentRef
/// walk decides every value.
fn finalize_symbol(_sym: &mut ResolveInfo) -> bool {
    false
}
