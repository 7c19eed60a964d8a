//! The layout engine: orders output sections, assigns file offsets and
//! virtual addresses, and finalizes symbol values.
//!
//! Single pass once inclusion is fixed. Sections sort by the backend's order
//! hint with read-only content ahead of writable, which yields exactly two
//! loadable runs: text|read-only, then read-write with BSS at its tail.
//! Re-running after stub insertion just repeats the pass; every offset after
//! the first moved fragment is recomputed.

use crate::config::{Config, OutputType};
use crate::elf::{self, align_up};
use crate::error::LinkError;
use crate::fragment::{FragmentKind, FragmentRef};
use crate::module::{Module, SectionId};
use crate::section::{SectionData, SectionKind};
use crate::symbol::SymbolDesc;
use crate::target::Backend;

/// Load-segment granularity; p_vaddr and p_offset stay congruent modulo
/// this.
pub const PAGE_SIZE: u64 = 0x10000;

#[derive(Debug, Clone)]
pub struct Segment {
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

/// Everything the writer needs beyond the sections themselves.
pub struct LayoutInfo {
    pub segments: Vec<Segment>,
    pub phdr_count: u32,
    pub entry: u64,
    /// One past the last byte any section occupies in the file.
    pub file_end: u64,
    pub base: u64,
    /// Sections in file order, pruned of empty ones.
    pub ordered: Vec<SectionId>,
}

/// Order, place, and finalize. Inclusion and reservation are frozen before
/// this runs.
pub fn layout(module: &mut Module, config: &Config, backend: &Backend) -> Result<LayoutInfo, LinkError> {
    allocate_commons(module);

    // Prune empty sections; the GOT pair stays because the applier and the
    // dynamic section address them even when no regular entry exists.
    let mut ordered: Vec<SectionId> = module
        .output_sections
        .iter()
        .copied()
        .filter(|&id| {
            let sec = module.section(id);
            sec.size > 0 || matches!(sec.kind, SectionKind::Got | SectionKind::Plt)
        })
        .collect();
    ordered.sort_by_key(|&id| {
        let sec = module.section(id);
        ((backend.section_order)(sec).rank(), sec.is_writable())
    });

    let base = match config.output_type {
        OutputType::Exec => config.base_address,
        _ => 0,
    };

    let phdr_count = count_phdrs(module, config, &ordered);
    let headers = elf::EHDR32_SIZE as u64 + phdr_count as u64 * elf::PHDR32_SIZE as u64;

    let mut file_offset = headers;
    let mut vaddr = base + headers;
    let mut seen_writable = false;
    let mut segments: Vec<Segment> = Vec::new();
    let mut current: Option<Segment> = None;

    for &id in &ordered {
        if !module.section(id).is_alloc() {
            continue;
        }
        module.recompute_offsets(id);
        let sec = module.section(id);
        let align = sec.align.max(1) as u64;
        let writable = sec.is_writable();
        let exec = sec.is_exec();
        let nobits = sec.sh_type == elf::SHT_NOBITS;

        if writable && !seen_writable {
            // New permission run: next page, congruent with the file offset.
            seen_writable = true;
            if let Some(seg) = current.take() {
                segments.push(seg);
            }
            vaddr = align_up(vaddr, PAGE_SIZE) + file_offset % PAGE_SIZE;
        }

        file_offset = align_up(file_offset, align);
        vaddr = align_up(vaddr, align);
        let sec = module.section_mut(id);
        sec.offset = file_offset;
        sec.addr = vaddr;
        let size = sec.size;

        let seg = current.get_or_insert_with(|| Segment {
            flags: elf::PF_R,
            // The first segment maps the headers too.
            offset: if segments.is_empty() { 0 } else { file_offset },
            vaddr: if segments.is_empty() {
                base
            } else {
                vaddr
            },
            filesz: 0,
            memsz: 0,
        });
        if writable {
            seg.flags |= elf::PF_W;
        }
        if exec {
            seg.flags |= elf::PF_X;
        }
        if !nobits {
            file_offset += size;
            seg.filesz = file_offset - seg.offset;
        }
        vaddr += size;
        seg.memsz = vaddr - seg.vaddr;
    }
    if let Some(seg) = current.take() {
        segments.push(seg);
    }

    // Non-alloc content (attributes, kept debug payloads) trails the image.
    for &id in &ordered {
        if module.section(id).is_alloc() {
            continue;
        }
        module.recompute_offsets(id);
        let sec = module.section_mut(id);
        let align = sec.align.max(1) as u64;
        file_offset = align_up(file_offset, align);
        sec.offset = file_offset;
        sec.addr = 0;
        if sec.sh_type != elf::SHT_NOBITS {
            file_offset += sec.size;
        }
    }

    finalize_symbols(module, backend);

    let entry = entry_address(module, config);
    log::debug!(
        "layout: {} sections, {} segments, entry {:#x}",
        ordered.len(),
        segments.len(),
        entry
    );

    Ok(LayoutInfo {
        segments,
        phdr_count,
        entry,
        file_end: file_offset,
        base,
        ordered,
    })
}

/// Tentative definitions surviving resolution get space in `.bss`.
fn allocate_commons(module: &mut Module) {
    let mut commons: Vec<(crate::module::SymbolId, String)> = module
        .symtab
        .globals()
        .filter(|(_, s)| s.is_common() && !s.is_dyn)
        .map(|(id, s)| (id, s.name.clone()))
        .collect();
    if commons.is_empty() {
        return;
    }
    commons.sort_by(|a, b| a.1.cmp(&b.1));

    let bss = module.get_or_create_output(
        ".bss",
        SectionKind::Bss,
        elf::SHT_NOBITS,
        crate::section::SectionFlags::ALLOC | crate::section::SectionFlags::WRITE,
        4,
    );
    for (id, name) in commons {
        let (size, align) = {
            let info = module.symtab.get(id);
            (info.size.max(1), info.value.max(1) as u32)
        };
        let frag = module.append_fragment(bss, FragmentKind::Fill { size, value: 0 }, align);
        let info = module.symtab.get_mut(id);
        info.desc = SymbolDesc::Define;
        info.frag = Some(FragmentRef::new(frag, 0));
        log::debug!("allocated common `{}' ({} bytes) into .bss", name, size);
    }
}

fn count_phdrs(module: &Module, config: &Config, ordered: &[SectionId]) -> u32 {
    let mut n = 1; // PHDR
    if module.output_section(".interp").is_some() {
        n += 1;
    }
    let has_rw = ordered
        .iter()
        .any(|&id| module.section(id).is_alloc() && module.section(id).is_writable());
    n += if has_rw { 2 } else { 1 }; // LOAD runs
    if module.output_section(".dynamic").is_some() {
        n += 1;
    }
    n += 1; // GNU_STACK
    let _ = config;
    n
}

/// Resolve every symbol's final value through its FragmentRef.
fn finalize_symbols(module: &mut Module, backend: &Backend) {
    let got_origin = module.got.as_ref().map(|g| g.origin(module));
    for idx in 0..module.symtab.len() {
        let id = crate::module::SymbolId(idx as u32);
        let frag = module.symtab.get(id).frag;
        let value = match frag {
            Some(fref) => Some(module.frag_addr(fref)),
            None => None,
        };
        let info = module.symtab.get_mut(id);
        if (backend.finalize_symbol)(info) {
            continue;
        }
        if info.is_absolute() {
            continue;
        }
        if let Some(v) = value {
            info.value = v;
        }
    }
    if let Some(origin) = got_origin {
        if let Some(id) = module.symtab.lookup("_GLOBAL_OFFSET_TABLE_") {
            module.symtab.get_mut(id).value = origin;
        }
    }

    // Section-boundary symbols the linker owns.
    let (bss_start, bss_end) = match module.output_section(".bss") {
        Some(id) => {
            let sec = module.section(id);
            (sec.addr, sec.addr + sec.size)
        }
        None => {
            let end = module
                .output_section(".data")
                .map(|id| {
                    let sec = module.section(id);
                    sec.addr + sec.size
                })
                .unwrap_or(0);
            (end, end)
        }
    };
    for (name, value) in [
        ("__bss_start", bss_start),
        ("_edata", bss_start),
        ("_end", bss_end),
        ("__end__", bss_end),
    ] {
        if let Some(id) = module.symtab.lookup(name) {
            let info = module.symtab.get_mut(id);
            if info.is_undef() {
                info.desc = SymbolDesc::Define;
                info.value = value;
            }
        }
    }
}

fn entry_address(module: &Module, config: &Config) -> u64 {
    if config.output_type != OutputType::Exec {
        return 0;
    }
    if let Some(id) = module.symtab.lookup(&config.entry) {
        let info = module.symtab.get(id);
        if info.is_define() {
            return info.value;
        }
    }
    log::warn!(
        "cannot find entry symbol `{}'; defaulting to start of .text",
        config.entry
    );
    module
        .output_section(".text")
        .map_or(config.base_address, |s| module.section(s).addr)
}

/// Debug-build verification that layout produced disjoint ranges.
pub fn check_totality(module: &Module, info: &LayoutInfo) -> Result<(), String> {
    for &id in &info.ordered {
        let sec = module.section(id);
        if let SectionData::Fragments(frags) = &sec.data {
            let mut cursor = 0u64;
            for &f in frags {
                let frag = module.fragment(f);
                if frag.offset < cursor {
                    return Err(format!(
                        "fragment overlap in {} at {:#x}",
                        sec.name, frag.offset
                    ));
                }
                cursor = frag.offset + frag.kind.size();
            }
            if cursor > sec.size {
                return Err(format!("fragments exceed {} size", sec.name));
            }
        }
    }
    let mut last_end = 0u64;
    for seg in &info.segments {
        if seg.offset < last_end {
            return Err(format!("segment overlap at {:#x}", seg.offset));
        }
        last_end = seg.offset + seg.filesz;
    }
    Ok(())
}
