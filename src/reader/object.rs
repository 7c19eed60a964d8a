//! ELF32 relocatable object reader.
//!
//! Creates one arena section per input section header so symbol `st_shndx`
//! values index straight into `Input::sections`. Content sections get their
//! bytes appended to the matching output section as a region fragment;
//! relocation sections become `SectionData::Relocs` targeting those
//! fragments.

use crate::config::Config;
use crate::elf::*;
use crate::error::LinkError;
use crate::fragment::{FragmentKind, FragmentRef};
use crate::module::{FragmentId, InputId, Module};
use crate::relocate::RelocationFactory;
use crate::section::{output_section_name, section_kind, Section, SectionData, SectionFlags};
use crate::symbol::{Binding, ResolveInfo, SymbolDesc, SymbolType, Visibility};

struct Shdr {
    name: String,
    sh_type: u32,
    flags: u32,
    offset: usize,
    size: usize,
    link: u32,
    info: u32,
    addralign: u32,
    entsize: usize,
}

/// Parse one relocatable object and merge its content into the module.
pub fn read_object(
    module: &mut Module,
    config: &Config,
    factory: &RelocationFactory,
    input_id: InputId,
    bytes: &[u8],
    expected_machine: u16,
) -> Result<(), LinkError> {
    let path = module.input(input_id).name.clone();
    let bad = |reason: &str| LinkError::invalid(&path, reason);

    if bytes.len() < EHDR32_SIZE as usize || bytes[0..4] != ELF_MAGIC {
        return Err(bad("not an ELF file"));
    }
    if bytes[4] != ELFCLASS32 {
        return Err(bad("not ELF32"));
    }
    if bytes[5] != ELFDATA2LSB {
        return Err(bad("not little-endian"));
    }
    if read_u16(bytes, 16) != ET_REL {
        return Err(bad("not a relocatable object"));
    }
    let machine = read_u16(bytes, 18);
    if machine != expected_machine {
        return Err(bad(&format!("wrong machine {}", machine)));
    }

    let e_shoff = read_u32(bytes, 32) as usize;
    let e_shentsize = read_u16(bytes, 46) as usize;
    let e_shnum = read_u16(bytes, 48) as usize;
    let e_shstrndx = read_u16(bytes, 50) as usize;
    if e_shnum == 0 || e_shstrndx >= e_shnum {
        return Err(bad("missing section headers"));
    }
    if e_shoff + e_shnum * e_shentsize > bytes.len() {
        return Err(bad("section header table out of range"));
    }

    let raw_shdr = |i: usize| -> Shdr {
        let off = e_shoff + i * e_shentsize;
        Shdr {
            name: String::new(),
            sh_type: read_u32(bytes, off + 4),
            flags: read_u32(bytes, off + 8),
            offset: read_u32(bytes, off + 16) as usize,
            size: read_u32(bytes, off + 20) as usize,
            link: read_u32(bytes, off + 24),
            info: read_u32(bytes, off + 28),
            addralign: read_u32(bytes, off + 32).max(1),
            entsize: read_u32(bytes, off + 36) as usize,
        }
    };

    let shstr = raw_shdr(e_shstrndx);
    if shstr.offset + shstr.size > bytes.len() {
        return Err(bad("section string table out of range"));
    }
    let shstrtab = &bytes[shstr.offset..shstr.offset + shstr.size];

    let mut shdrs: Vec<Shdr> = Vec::with_capacity(e_shnum);
    for i in 0..e_shnum {
        let mut sh = raw_shdr(i);
        let name_off = read_u32(bytes, e_shoff + i * e_shentsize) as usize;
        sh.name = read_cstr(shstrtab, name_off).to_string();
        if sh.sh_type != SHT_NOBITS && sh.offset + sh.size > bytes.len() {
            return Err(bad(&format!("section {} out of range", sh.name)));
        }
        shdrs.push(sh);
    }

    // Pass 1: arena records for every header; content lands in the output
    // sections as region/fill fragments.
    let mut frags: Vec<Option<FragmentId>> = vec![None; e_shnum];
    for (i, sh) in shdrs.iter().enumerate() {
        let kind = section_kind(&sh.name, sh.sh_type, sh.flags);
        let mut record = Section::new(
            &sh.name,
            kind,
            sh.sh_type,
            SectionFlags::from_bits_truncate(sh.flags),
            sh.addralign,
        );
        record.link = sh.link;
        record.info = sh.info;
        record.entsize = sh.entsize as u32;
        record.size = sh.size as u64;

        if let Some(out_name) = output_section_name(&sh.name, sh.sh_type, sh.flags) {
            if include_in_output(module, out_name) {
                let out = module.get_or_create_output(
                    out_name,
                    kind,
                    output_sh_type(out_name, sh.sh_type),
                    SectionFlags::from_bits_truncate(sh.flags),
                    sh.addralign,
                );
                let frag_kind = if sh.sh_type == SHT_NOBITS {
                    FragmentKind::Fill {
                        size: sh.size as u64,
                        value: 0,
                    }
                } else {
                    FragmentKind::Region {
                        bytes: bytes[sh.offset..sh.offset + sh.size].to_vec(),
                    }
                };
                let frag = module.append_fragment(out, frag_kind, sh.addralign);
                frags[i] = Some(frag);
                record.data = SectionData::Fragments(vec![frag]);
            }
        }
        let sec_id = module.add_section(record);
        module.input_mut(input_id).sections.push(sec_id);
    }

    // Pass 2: symbols.
    let symtab_idx = shdrs.iter().position(|s| s.sh_type == SHT_SYMTAB);
    if let Some(si) = symtab_idx {
        let symtab = &shdrs[si];
        let strtab = shdrs
            .get(symtab.link as usize)
            .ok_or_else(|| bad("symtab string table missing"))?;
        let str_data = &bytes[strtab.offset..strtab.offset + strtab.size];
        let sym_data = &bytes[symtab.offset..symtab.offset + symtab.size];
        let count = sym_data.len() / SYM32_SIZE as usize;

        for i in 0..count {
            let off = i * SYM32_SIZE as usize;
            let name = read_cstr(str_data, read_u32(sym_data, off) as usize).to_string();
            let value = read_u32(sym_data, off + 4);
            let size = read_u32(sym_data, off + 8);
            let info = sym_data[off + 12];
            let other = sym_data[off + 13];
            let shndx = read_u16(sym_data, off + 14);

            let sym_id = ingest_symbol(
                module, config, input_id, &frags, &name, value, size, info, other, shndx,
            )?;
            module.input_mut(input_id).symbols.push(sym_id);
        }
    }

    // Pass 3: relocations, only for targets that made it into the output.
    for (i, sh) in shdrs.iter().enumerate() {
        if sh.sh_type != SHT_REL && sh.sh_type != SHT_RELA {
            continue;
        }
        let target = sh.info as usize;
        let target_frag = match frags.get(target).copied().flatten() {
            Some(f) => f,
            None => continue,
        };
        let entsize = if sh.entsize > 0 {
            sh.entsize
        } else if sh.sh_type == SHT_REL {
            REL32_SIZE as usize
        } else {
            RELA32_SIZE as usize
        };
        let data = &bytes[sh.offset..sh.offset + sh.size];
        let count = data.len() / entsize;
        let mut records = Vec::with_capacity(count);
        for r in 0..count {
            let off = r * entsize;
            let r_offset = read_u32(data, off) as u64;
            let r_info = read_u32(data, off + 4);
            let addend = if sh.sh_type == SHT_RELA {
                read_i32(data, off + 8) as i64
            } else {
                0
            };
            let sym_idx = (r_info >> 8) as usize;
            let rtype = r_info & 0xff;
            let symbol = *module
                .input(input_id)
                .symbols
                .get(sym_idx)
                .ok_or_else(|| bad("relocation symbol index out of range"))?;
            let target_ref = FragmentRef::new(target_frag, r_offset);
            records.push(factory.produce(module, rtype, target_ref, symbol, addend)?);
        }
        let sec_id = module.input(input_id).sections[i];
        module.section_mut(sec_id).data = SectionData::Relocs(records);
    }

    Ok(())
}

/// `.ARM.attributes` is taken from the first input that provides it; other
/// outputs concatenate.
fn include_in_output(module: &Module, out_name: &str) -> bool {
    if out_name != ".ARM.attributes" {
        return true;
    }
    module
        .output_section(out_name)
        .map_or(true, |id| module.section(id).size == 0)
}

fn output_sh_type(out_name: &str, input_type: u32) -> u32 {
    match out_name {
        ".bss" => SHT_NOBITS,
        ".init_array" => SHT_INIT_ARRAY,
        ".fini_array" => SHT_FINI_ARRAY,
        ".preinit_array" => SHT_PREINIT_ARRAY,
        ".note" => SHT_NOTE,
        ".ARM.exidx" => SHT_ARM_EXIDX,
        ".ARM.attributes" => SHT_ARM_ATTRIBUTES,
        _ if input_type == SHT_NOBITS => SHT_PROGBITS,
        _ => input_type,
    }
}

#[allow(clippy::too_many_arguments)]
fn ingest_symbol(
    module: &mut Module,
    config: &Config,
    input_id: InputId,
    frags: &[Option<FragmentId>],
    name: &str,
    value: u32,
    size: u32,
    info: u8,
    other: u8,
    shndx: u16,
) -> Result<crate::module::SymbolId, LinkError> {
    let binding = match info >> 4 {
        STB_WEAK => Binding::Weak,
        STB_LOCAL => Binding::Local,
        _ => Binding::Global,
    };
    let ty = SymbolType::from_elf(info & 0xf);
    // Thumb functions carry the state bit in st_value.
    let sym_val = if ty == SymbolType::Function {
        value & !1
    } else {
        value
    };

    let mut record = ResolveInfo::undefined(name);
    record.ty = ty;
    record.binding = binding;
    record.visibility = Visibility::from_elf(other);
    record.size = size as u64;
    record.source = Some(input_id);

    match shndx {
        SHN_UNDEF => {}
        SHN_ABS => {
            record.desc = SymbolDesc::Define;
            record.absolute = true;
            record.value = value as u64;
        }
        SHN_COMMON => {
            record.desc = SymbolDesc::Common;
            // Common symbols carry their alignment in st_value.
            record.value = value.max(1) as u64;
        }
        idx if (idx as usize) < frags.len() && idx < SHN_LORESERVE => {
            record.desc = SymbolDesc::Define;
            record.frag = frags[idx as usize].map(|f| FragmentRef::new(f, sym_val as u64));
        }
        _ => {
            return Err(LinkError::invalid(
                &module.input(input_id).name,
                format!("symbol `{}' has bad section index {}", name, shndx),
            ));
        }
    }

    if binding == Binding::Local {
        return Ok(module.symtab.add_local(record));
    }

    let allow_multiple = config.allow_multiple_definition;
    let inputs = std::mem::take(&mut module.inputs);
    let result = module.symtab.insert_global(record, allow_multiple, &inputs);
    module.inputs = inputs;
    let (id, _) = result?;

    // A reference satisfied by a shared object keeps that library needed.
    let info = module.symtab.get(id);
    if info.is_dyn {
        if let Some(src) = info.source {
            module.input_mut(src).referenced = true;
        }
    }
    Ok(id)
}
