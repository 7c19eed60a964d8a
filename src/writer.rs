//! The output writer: serialises the laid-out module into the output file
//! through the byte-region store.
//!
//! Emits the ELF header, program headers, every section's content, then the
//! symbol table, string tables, and section header table. BSS writes
//! nothing. Each region is synced before the file handle is dropped.

use std::collections::HashMap;

use crate::config::{Config, Endianness, OutputType};
use crate::dynamic::{self, DynamicLayout};
use crate::elf::{self, align_up};
use crate::error::LinkError;
use crate::fragment::FragmentKind;
use crate::layout::{LayoutInfo, PAGE_SIZE};
use crate::mem::MemoryArea;
use crate::module::{Module, SectionId};
use crate::section::SectionData;
use crate::target::Backend;

/// Write the final image. Layout and apply have both completed.
pub fn write_output(
    module: &Module,
    config: &Config,
    backend: &Backend,
    layout: &LayoutInfo,
    dyn_layout: &DynamicLayout,
) -> Result<(), LinkError> {
    // Section header indices: null entry, laid-out sections, then the
    // late tables.
    let mut shndx: HashMap<SectionId, u16> = HashMap::new();
    for (i, &id) in layout.ordered.iter().enumerate() {
        shndx.insert(id, (i + 1) as u16);
    }
    let symtab_ndx = (layout.ordered.len() + 1) as u16;
    let strtab_ndx = symtab_ndx + 1;
    let shstrtab_ndx = strtab_ndx + 1;
    let shnum = shstrtab_ndx + 1;

    let (symtab, strtab, first_global) = build_symtab(module, &shndx);

    let mut shstrtab: Vec<u8> = vec![0];
    let mut shstr_offsets: Vec<u32> = Vec::new();
    for &id in &layout.ordered {
        shstr_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(module.section(id).name.as_bytes());
        shstrtab.push(0);
    }
    let symtab_name = push_name(&mut shstrtab, ".symtab");
    let strtab_name = push_name(&mut shstrtab, ".strtab");
    let shstrtab_name = push_name(&mut shstrtab, ".shstrtab");

    let symtab_off = align_up(layout.file_end, 4);
    let strtab_off = symtab_off + symtab.len() as u64;
    let shstrtab_off = strtab_off + strtab.len() as u64;
    let e_shoff = align_up(shstrtab_off + shstrtab.len() as u64, 4);
    let total = e_shoff + shnum as u64 * elf::SHDR32_SIZE as u64;

    let area = MemoryArea::create(&config.output, total)?;

    write_ehdr(&area, config, backend, layout, e_shoff, shnum, shstrtab_ndx)?;
    write_phdrs(&area, module, layout, dyn_layout)?;

    // Section content.
    for &id in &layout.ordered {
        let sec = module.section(id);
        if sec.sh_type == elf::SHT_NOBITS {
            continue;
        }
        let bytes = section_bytes(module, config, dyn_layout, id, &shndx);
        if bytes.is_empty() {
            continue;
        }
        let mut region = area.request(sec.offset, bytes.len() as u64)?;
        region.write(0, &bytes);
        region.sync()?;
    }

    // Late tables.
    for (off, bytes) in [
        (symtab_off, &symtab),
        (strtab_off, &strtab),
        (shstrtab_off, &shstrtab),
    ] {
        let mut region = area.request(off, bytes.len() as u64)?;
        region.write(0, bytes);
        region.sync()?;
    }

    // Section header table.
    let mut shdrs = vec![0u8; shnum as usize * elf::SHDR32_SIZE as usize];
    for (i, &id) in layout.ordered.iter().enumerate() {
        let sec = module.section(id);
        let (link, info) = section_links(module, dyn_layout, id, &shndx, symtab_ndx);
        write_shdr(
            &mut shdrs,
            i + 1,
            shstr_offsets[i],
            sec.sh_type,
            sec.flags.bits(),
            sec.addr as u32,
            sec.offset as u32,
            sec.size as u32,
            link,
            info,
            sec.align,
            sec.entsize,
        );
    }
    write_shdr(
        &mut shdrs,
        symtab_ndx as usize,
        symtab_name,
        elf::SHT_SYMTAB,
        0,
        0,
        symtab_off as u32,
        symtab.len() as u32,
        strtab_ndx as u32,
        first_global,
        4,
        elf::SYM32_SIZE,
    );
    write_shdr(
        &mut shdrs,
        strtab_ndx as usize,
        strtab_name,
        elf::SHT_STRTAB,
        0,
        0,
        strtab_off as u32,
        strtab.len() as u32,
        0,
        0,
        1,
        0,
    );
    write_shdr(
        &mut shdrs,
        shstrtab_ndx as usize,
        shstrtab_name,
        elf::SHT_STRTAB,
        0,
        0,
        shstrtab_off as u32,
        shstrtab.len() as u32,
        0,
        0,
        1,
        0,
    );
    let mut region = area.request(e_shoff, shdrs.len() as u64)?;
    region.write(0, &shdrs);
    region.sync()?;

    if config.output_type != OutputType::Relocatable {
        set_executable(&config.output);
    }
    Ok(())
}

fn push_name(pool: &mut Vec<u8>, name: &str) -> u32 {
    let off = pool.len() as u32;
    pool.extend_from_slice(name.as_bytes());
    pool.push(0);
    off
}

fn write_ehdr(
    area: &MemoryArea,
    config: &Config,
    backend: &Backend,
    layout: &LayoutInfo,
    e_shoff: u64,
    shnum: u16,
    shstrndx: u16,
) -> Result<(), LinkError> {
    let mut hdr = [0u8; elf::EHDR32_SIZE as usize];
    hdr[0..4].copy_from_slice(&elf::ELF_MAGIC);
    hdr[4] = elf::ELFCLASS32;
    hdr[5] = match config.endian {
        Endianness::Little => elf::ELFDATA2LSB,
        Endianness::Big => elf::ELFDATA2MSB,
    };
    hdr[6] = elf::EV_CURRENT;
    let e_type = match config.output_type {
        OutputType::Exec => elf::ET_EXEC,
        OutputType::DynObj => elf::ET_DYN,
        OutputType::Relocatable => elf::ET_REL,
    };
    elf::write_u16(&mut hdr, 16, e_type);
    elf::write_u16(&mut hdr, 18, backend.machine);
    elf::write_u32(&mut hdr, 20, 1);
    elf::write_u32(&mut hdr, 24, layout.entry as u32);
    elf::write_u32(&mut hdr, 28, elf::EHDR32_SIZE);
    elf::write_u32(&mut hdr, 32, e_shoff as u32);
    elf::write_u32(&mut hdr, 36, backend.elf_flags);
    elf::write_u16(&mut hdr, 40, elf::EHDR32_SIZE as u16);
    elf::write_u16(&mut hdr, 42, elf::PHDR32_SIZE as u16);
    elf::write_u16(&mut hdr, 44, layout.phdr_count as u16);
    elf::write_u16(&mut hdr, 46, elf::SHDR32_SIZE as u16);
    elf::write_u16(&mut hdr, 48, shnum);
    elf::write_u16(&mut hdr, 50, shstrndx);

    let mut region = area.request(0, hdr.len() as u64)?;
    region.write(0, &hdr);
    region.sync()
}

fn write_phdrs(
    area: &MemoryArea,
    module: &Module,
    layout: &LayoutInfo,
    dyn_layout: &DynamicLayout,
) -> Result<(), LinkError> {
    let mut out = vec![0u8; layout.phdr_count as usize * elf::PHDR32_SIZE as usize];
    let mut at = 0usize;
    let mut push = |out: &mut Vec<u8>,
                    p_type: u32,
                    offset: u64,
                    vaddr: u64,
                    filesz: u64,
                    memsz: u64,
                    flags: u32,
                    align: u64| {
        let b = at * elf::PHDR32_SIZE as usize;
        elf::write_u32(out, b, p_type);
        elf::write_u32(out, b + 4, offset as u32);
        elf::write_u32(out, b + 8, vaddr as u32);
        elf::write_u32(out, b + 12, vaddr as u32);
        elf::write_u32(out, b + 16, filesz as u32);
        elf::write_u32(out, b + 20, memsz as u32);
        elf::write_u32(out, b + 24, flags);
        elf::write_u32(out, b + 28, align as u32);
        at += 1;
    };

    let phdr_size = layout.phdr_count as u64 * elf::PHDR32_SIZE as u64;
    push(
        &mut out,
        elf::PT_PHDR,
        elf::EHDR32_SIZE as u64,
        layout.base + elf::EHDR32_SIZE as u64,
        phdr_size,
        phdr_size,
        elf::PF_R,
        4,
    );
    if let Some(interp) = dyn_layout.interp {
        let sec = module.section(interp);
        push(
            &mut out,
            elf::PT_INTERP,
            sec.offset,
            sec.addr,
            sec.size,
            sec.size,
            elf::PF_R,
            1,
        );
    }
    for seg in &layout.segments {
        push(
            &mut out,
            elf::PT_LOAD,
            seg.offset,
            seg.vaddr,
            seg.filesz,
            seg.memsz,
            seg.flags,
            PAGE_SIZE,
        );
    }
    if let Some(dynamic) = dyn_layout.dynamic {
        let sec = module.section(dynamic);
        push(
            &mut out,
            elf::PT_DYNAMIC,
            sec.offset,
            sec.addr,
            sec.size,
            sec.size,
            elf::PF_R | elf::PF_W,
            4,
        );
    }
    push(&mut out, elf::PT_GNU_STACK, 0, 0, 0, 0, elf::PF_R | elf::PF_W, 0x10);

    let mut region = area.request(elf::EHDR32_SIZE as u64, out.len() as u64)?;
    region.write(0, &out);
    region.sync()
}

/// Serialise one section's body.
fn section_bytes(
    module: &Module,
    config: &Config,
    dyn_layout: &DynamicLayout,
    id: SectionId,
    shndx: &HashMap<SectionId, u16>,
) -> Vec<u8> {
    let sec = module.section(id);
    match &sec.data {
        SectionData::Fragments(frags) => {
            let mut out = vec![0u8; sec.size as usize];
            for &f in frags {
                let frag = module.fragment(f);
                let at = frag.offset as usize;
                match &frag.kind {
                    FragmentKind::Region { bytes } => {
                        out[at..at + bytes.len()].copy_from_slice(bytes);
                    }
                    FragmentKind::Fill { size, value } => {
                        out[at..at + *size as usize].fill(*value);
                    }
                    FragmentKind::Alignment { .. } => {}
                    FragmentKind::RelocEntry {
                        r_offset,
                        r_sym,
                        r_type,
                        ..
                    } => {
                        elf::write_u32(&mut out, at, *r_offset as u32);
                        elf::write_u32(&mut out, at + 4, elf::r_info32(*r_sym, *r_type));
                    }
                    FragmentKind::GotEntry { value, .. } => {
                        elf::write_u32(&mut out, at, *value as u32);
                    }
                    FragmentKind::PltEntry { bytes, .. } | FragmentKind::Stub { bytes } => {
                        out[at..at + bytes.len()].copy_from_slice(bytes);
                    }
                }
            }
            out
        }
        SectionData::Raw(bytes) => {
            if Some(id) == dyn_layout.dynsym {
                dynamic::serialize_dynsym(module, dyn_layout, shndx)
            } else if Some(id) == dyn_layout.dynamic {
                dynamic::serialize_dynamic(module, config, dyn_layout)
            } else {
                bytes.clone()
            }
        }
        SectionData::Relocs(_) | SectionData::None => Vec::new(),
    }
}

fn section_links(
    module: &Module,
    dyn_layout: &DynamicLayout,
    id: SectionId,
    shndx: &HashMap<SectionId, u16>,
    symtab_ndx: u16,
) -> (u32, u32) {
    let lookup = |sid: Option<SectionId>| sid.and_then(|s| shndx.get(&s)).copied().unwrap_or(0) as u32;
    let sec = module.section(id);
    match sec.name.as_str() {
        ".dynsym" => (lookup(dyn_layout.dynstr), 1),
        ".hash" => (lookup(dyn_layout.dynsym), 0),
        ".dynamic" => (lookup(dyn_layout.dynstr), 0),
        ".rel.dyn" => (lookup(dyn_layout.dynsym), 0),
        ".rel.plt" => (
            lookup(dyn_layout.dynsym),
            lookup(module.output_section(".plt")),
        ),
        _ => {
            let _ = symtab_ndx;
            (0, 0)
        }
    }
}

/// Static symbol table: null, named locals, then globals.
fn build_symtab(module: &Module, shndx: &HashMap<SectionId, u16>) -> (Vec<u8>, Vec<u8>, u32) {
    let mut strtab: Vec<u8> = vec![0];
    let mut locals: Vec<[u8; 16]> = Vec::new();
    let mut globals: Vec<[u8; 16]> = Vec::new();

    for (_, info) in module.symtab.iter() {
        if info.name.is_empty()
            || matches!(
                info.ty,
                crate::symbol::SymbolType::Section | crate::symbol::SymbolType::File
            )
        {
            continue;
        }
        let name_off = push_name(&mut strtab, &info.name);
        let ndx = if info.is_absolute() {
            elf::SHN_ABS
        } else if let Some(fref) = info.frag {
            let sec = module.fragment(fref.frag).section;
            shndx.get(&sec).copied().unwrap_or(elf::SHN_UNDEF)
        } else if info.is_define() {
            elf::SHN_ABS
        } else {
            elf::SHN_UNDEF
        };
        let value = if info.is_define() { info.value } else { 0 };
        let mut e = [0u8; 16];
        elf::write_u32(&mut e, 0, name_off);
        elf::write_u32(&mut e, 4, value as u32);
        elf::write_u32(&mut e, 8, info.size as u32);
        e[12] = (info.binding.to_elf() << 4) | info.ty.to_elf();
        elf::write_u16(&mut e, 14, ndx);
        if info.is_local() {
            locals.push(e);
        } else {
            globals.push(e);
        }
    }

    let first_global = (locals.len() + 1) as u32;
    let mut out = vec![0u8; 16];
    for e in locals.into_iter().chain(globals) {
        out.extend_from_slice(&e);
    }
    (out, strtab, first_global)
}

#[allow(clippy::too_many_arguments)]
fn write_shdr(
    out: &mut [u8],
    idx: usize,
    name: u32,
    sh_type: u32,
    flags: u32,
    addr: u32,
    offset: u32,
    size: u32,
    link: u32,
    info: u32,
    align: u32,
    entsize: u32,
) {
    let b = idx * elf::SHDR32_SIZE as usize;
    elf::write_u32(out, b, name);
    elf::write_u32(out, b + 4, sh_type);
    elf::write_u32(out, b + 8, flags);
    elf::write_u32(out, b + 12, addr);
    elf::write_u32(out, b + 16, offset);
    elf::write_u32(out, b + 20, size);
    elf::write_u32(out, b + 24, link);
    elf::write_u32(out, b + 28, info);
    elf::write_u32(out, b + 32, align);
    elf::write_u32(out, b + 36, entsize);
}

fn set_executable(path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755));
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symtab_orders_locals_first() {
        let mut module = Module::new();
        let g = module.symtab.declare("global_one");
        module.symtab.get_mut(g).desc = crate::symbol::SymbolDesc::Define;
        let mut local = crate::symbol::ResolveInfo::undefined("local_one");
        local.binding = crate::symbol::Binding::Local;
        local.desc = crate::symbol::SymbolDesc::Define;
        module.symtab.add_local(local);

        let shndx = HashMap::new();
        let (symtab, strtab, first_global) = build_symtab(&module, &shndx);
        assert_eq!(symtab.len(), 3 * 16);
        assert_eq!(first_global, 2);
        let name_off = elf::read_u32(&symtab, 16);
        assert_eq!(elf::read_cstr(&strtab, name_off as usize), "local_one");
    }
}
