//! Dynamic-linking output sections: `.rel.dyn`, `.rel.plt`, `.dynsym`,
//! `.dynstr`, `.hash`, `.dynamic`, and `.interp`.
//!
//! Reservation happens while scanning; the structural build (symbol set,
//! string pool, table sizes) runs between scanning and layout so the layout
//! engine sees final sizes; the address-dependent bytes are serialised by
//! the writer after layout.

use std::collections::HashMap;

use crate::config::{Config, OutputType};
use crate::elf;
use crate::fragment::FragmentKind;
use crate::module::{FragmentId, Module, SectionId, SymbolId};
use crate::section::{SectionData, SectionFlags, SectionKind};
use crate::symbol::{Binding, Visibility};
use crate::target::Backend;

// ── Dynamic relocation sections ──────────────────────────────────────────────

/// `.rel.dyn` / `.rel.plt`: a pool of reserved record slots, filled in order
/// during the apply phase.
pub struct DynRelSection {
    pub section: SectionId,
    entries: Vec<FragmentId>,
    used: usize,
}

impl DynRelSection {
    pub fn create(module: &mut Module, backend: &Backend, name: &str) -> DynRelSection {
        let section = module.get_or_create_output(
            name,
            SectionKind::Relocation,
            elf::SHT_REL,
            SectionFlags::ALLOC,
            4,
        );
        module.section_mut(section).entsize = backend.rel_entry_size as u32;
        DynRelSection {
            section,
            entries: Vec::new(),
            used: 0,
        }
    }

    /// Reserve one record slot.
    pub fn reserve_entry(&mut self, module: &mut Module, backend: &Backend) -> FragmentId {
        let frag = module.append_fragment(
            self.section,
            FragmentKind::RelocEntry {
                size: backend.rel_entry_size,
                r_offset: 0,
                r_sym: 0,
                r_type: 0,
                filled: false,
            },
            4,
        );
        self.entries.push(frag);
        frag
    }

    /// Fill the next reserved slot with a finished record. Reservation and
    /// fill counts match by construction; a shortfall here grows the section,
    /// which layout has already frozen, so it is logged loudly.
    pub fn fill_next(&mut self, module: &mut Module, r_offset: u64, r_sym: u32, r_type: u32) {
        if self.used == self.entries.len() {
            log::error!(
                "dynamic relocation slot shortfall in {}",
                module.section(self.section).name
            );
            return;
        }
        let frag = self.entries[self.used];
        self.used += 1;
        if let FragmentKind::RelocEntry {
            r_offset: o,
            r_sym: s,
            r_type: t,
            filled,
            ..
        } = &mut module.fragment_mut(frag).kind
        {
            *o = r_offset;
            *s = r_sym;
            *t = r_type;
            *filled = true;
        }
    }

    pub fn reserved_count(&self) -> usize {
        self.entries.len()
    }

    pub fn filled_count(&self) -> usize {
        self.used
    }
}

// ── Structural build ─────────────────────────────────────────────────────────

/// Sections and string offsets shared between the structural build and the
/// writer's final serialisation.
pub struct DynamicLayout {
    pub dynsym: Option<SectionId>,
    pub dynstr: Option<SectionId>,
    pub hash: Option<SectionId>,
    pub dynamic: Option<SectionId>,
    pub interp: Option<SectionId>,
    dynstr_map: HashMap<String, u32>,
    needed_offsets: Vec<u32>,
    soname_offset: Option<u32>,
}

impl DynamicLayout {
    pub fn empty() -> DynamicLayout {
        DynamicLayout {
            dynsym: None,
            dynstr: None,
            hash: None,
            dynamic: None,
            interp: None,
            dynstr_map: HashMap::new(),
            needed_offsets: Vec::new(),
            soname_offset: None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic.is_some()
    }
}

/// Whether this link needs a dynamic section at all.
pub fn needs_dynamic(module: &Module, config: &Config) -> bool {
    config.output_type == OutputType::DynObj
        || !module.needed.is_empty()
        || module.plt.is_some()
        || module
            .rel_dyn
            .as_ref()
            .map_or(false, |r| r.reserved_count() > 0)
}

/// Pick the dynamic symbol set, build `.dynstr`/`.hash`, and size `.dynsym`
/// and `.dynamic`. Runs after scanning, before layout.
pub fn build(module: &mut Module, config: &Config) -> DynamicLayout {
    if !needs_dynamic(module, config) {
        return DynamicLayout::empty();
    }

    // Dynamic symbol set: everything the scanner reserved entries for, plus
    // every exportable definition when producing a shared object.
    let mut members: Vec<SymbolId> = Vec::new();
    for (id, info) in module.symtab.iter() {
        if info.binding == Binding::Local {
            continue;
        }
        let exported = config.output_type == OutputType::DynObj
            && info.is_define()
            && !info.is_dyn
            && matches!(info.visibility, Visibility::Default | Visibility::Protected);
        let imported = !info.reserved.is_empty();
        let undef_weak = info.is_undef() && info.is_weak() && !info.is_dyn;
        if exported || imported || undef_weak {
            members.push(id);
        }
    }
    members.sort();
    members.dedup();
    for (i, id) in members.iter().enumerate() {
        module.symtab.get_mut(*id).dynsym_index = Some((i + 1) as u32);
    }
    module.dynsyms = members.clone();

    // String pool: null byte, then needed sonames, soname, symbol names.
    let mut dynstr: Vec<u8> = vec![0];
    let mut map: HashMap<String, u32> = HashMap::new();
    let mut intern = |pool: &mut Vec<u8>, map: &mut HashMap<String, u32>, s: &str| -> u32 {
        if let Some(&off) = map.get(s) {
            return off;
        }
        let off = pool.len() as u32;
        pool.extend_from_slice(s.as_bytes());
        pool.push(0);
        map.insert(s.to_string(), off);
        off
    };
    let needed_offsets: Vec<u32> = module
        .needed
        .clone()
        .iter()
        .map(|n| intern(&mut dynstr, &mut map, n))
        .collect();
    let soname_offset = config
        .soname
        .as_deref()
        .map(|s| intern(&mut dynstr, &mut map, s));
    let names: Vec<String> = members
        .iter()
        .map(|id| module.symtab.get(*id).name.clone())
        .collect();
    for name in &names {
        intern(&mut dynstr, &mut map, name);
    }

    let pool_flags = SectionFlags::ALLOC;
    let dynsym_sec = module.get_or_create_output(
        ".dynsym",
        SectionKind::NamePool,
        elf::SHT_DYNSYM,
        pool_flags,
        4,
    );
    {
        let sec = module.section_mut(dynsym_sec);
        sec.entsize = elf::SYM32_SIZE;
        sec.info = 1; // one local: the null entry
        sec.size = ((members.len() + 1) as u64) * elf::SYM32_SIZE as u64;
        sec.data = SectionData::Raw(Vec::new());
    }

    let dynstr_sec = module.get_or_create_output(
        ".dynstr",
        SectionKind::NamePool,
        elf::SHT_STRTAB,
        pool_flags,
        1,
    );
    {
        let sec = module.section_mut(dynstr_sec);
        sec.size = dynstr.len() as u64;
        sec.data = SectionData::Raw(dynstr);
    }

    let hash_bytes = build_hash(&names);
    let hash_sec = module.get_or_create_output(
        ".hash",
        SectionKind::NamePool,
        elf::SHT_HASH,
        pool_flags,
        4,
    );
    {
        let sec = module.section_mut(hash_sec);
        sec.entsize = 4;
        sec.size = hash_bytes.len() as u64;
        sec.data = SectionData::Raw(hash_bytes);
    }

    let dynamic_sec = module.get_or_create_output(
        ".dynamic",
        SectionKind::Regular,
        elf::SHT_DYNAMIC,
        SectionFlags::ALLOC | SectionFlags::WRITE,
        4,
    );
    {
        let count = count_entries(module, config);
        let sec = module.section_mut(dynamic_sec);
        sec.entsize = elf::DYN32_SIZE;
        sec.size = (count as u64) * elf::DYN32_SIZE as u64;
        sec.data = SectionData::Raw(Vec::new());
    }

    let interp = if config.output_type == OutputType::Exec {
        let mut bytes = config.interpreter.clone().into_bytes();
        bytes.push(0);
        let sec = module.get_or_create_output(
            ".interp",
            SectionKind::ReadOnly,
            elf::SHT_PROGBITS,
            SectionFlags::ALLOC,
            1,
        );
        module.section_mut(sec).size = bytes.len() as u64;
        module.section_mut(sec).data = SectionData::Raw(bytes);
        Some(sec)
    } else {
        None
    };

    log::debug!(
        "dynamic build: {} dynsyms, {} needed, interp={}",
        module.dynsyms.len(),
        module.needed.len(),
        interp.is_some()
    );

    DynamicLayout {
        dynsym: Some(dynsym_sec),
        dynstr: Some(dynstr_sec),
        hash: Some(hash_sec),
        dynamic: Some(dynamic_sec),
        interp,
        dynstr_map: map,
        needed_offsets,
        soname_offset,
    }
}

fn count_entries(module: &Module, config: &Config) -> usize {
    let mut n = module.needed.len();
    if config.soname.is_some() {
        n += 1;
    }
    n += 5; // HASH, STRTAB, SYMTAB, STRSZ, SYMENT
    if module.output_section(".init").is_some() {
        n += 1;
    }
    if module.output_section(".fini").is_some() {
        n += 1;
    }
    if module.output_section(".init_array").is_some() {
        n += 2;
    }
    if module.output_section(".fini_array").is_some() {
        n += 2;
    }
    if module
        .rel_dyn
        .as_ref()
        .map_or(false, |r| r.reserved_count() > 0)
    {
        n += 3; // REL, RELSZ, RELENT
    }
    if module.plt.is_some() {
        n += 4; // PLTGOT, PLTRELSZ, PLTREL, JMPREL
    }
    if config.bsymbolic {
        n += 1;
    }
    if config.output_type == OutputType::Exec {
        n += 1; // DEBUG
    }
    n + 1 // NULL
}

// ── Final serialisation (writer-side) ────────────────────────────────────────

/// Serialise `.dynsym` with final symbol values.
pub fn serialize_dynsym(
    module: &Module,
    layout: &DynamicLayout,
    shndx_map: &HashMap<SectionId, u16>,
) -> Vec<u8> {
    let mut out = vec![0u8; elf::SYM32_SIZE as usize];
    for &id in &module.dynsyms {
        let info = module.symtab.get(id);
        let name_off = layout.dynstr_map.get(&info.name).copied().unwrap_or(0);
        let (value, shndx) = if info.is_define() && !info.is_dyn {
            let shndx = if info.is_absolute() {
                elf::SHN_ABS
            } else {
                info.frag
                    .and_then(|f| shndx_map.get(&module.fragment(f.frag).section))
                    .copied()
                    .unwrap_or(elf::SHN_ABS)
            };
            (info.value, shndx)
        } else {
            (0, elf::SHN_UNDEF)
        };
        let mut entry = [0u8; 16];
        elf::write_u32(&mut entry, 0, name_off);
        elf::write_u32(&mut entry, 4, value as u32);
        elf::write_u32(&mut entry, 8, info.size as u32);
        entry[12] = (info.binding.to_elf() << 4) | info.ty.to_elf();
        entry[13] = 0;
        elf::write_u16(&mut entry, 14, shndx);
        out.extend_from_slice(&entry);
    }
    out
}

/// Serialise `.dynamic` with final addresses.
pub fn serialize_dynamic(module: &Module, config: &Config, layout: &DynamicLayout) -> Vec<u8> {
    let mut out = Vec::new();
    let mut push = |tag: i32, val: u32| {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&val.to_le_bytes());
    };
    let addr_of = |id: Option<SectionId>| id.map_or(0, |s| module.section(s).addr as u32);
    let size_of = |id: Option<SectionId>| id.map_or(0, |s| module.section(s).size as u32);

    for &off in &layout.needed_offsets {
        push(elf::DT_NEEDED, off);
    }
    if let Some(off) = layout.soname_offset {
        push(elf::DT_SONAME, off);
    }
    push(elf::DT_HASH, addr_of(layout.hash));
    push(elf::DT_STRTAB, addr_of(layout.dynstr));
    push(elf::DT_SYMTAB, addr_of(layout.dynsym));
    push(elf::DT_STRSZ, size_of(layout.dynstr));
    push(elf::DT_SYMENT, elf::SYM32_SIZE);
    if let Some(init) = module.output_section(".init") {
        push(elf::DT_INIT, module.section(init).addr as u32);
    }
    if let Some(fini) = module.output_section(".fini") {
        push(elf::DT_FINI, module.section(fini).addr as u32);
    }
    if let Some(ia) = module.output_section(".init_array") {
        push(elf::DT_INIT_ARRAY, module.section(ia).addr as u32);
        push(elf::DT_INIT_ARRAYSZ, module.section(ia).size as u32);
    }
    if let Some(fa) = module.output_section(".fini_array") {
        push(elf::DT_FINI_ARRAY, module.section(fa).addr as u32);
        push(elf::DT_FINI_ARRAYSZ, module.section(fa).size as u32);
    }
    if let Some(rel_dyn) = &module.rel_dyn {
        if rel_dyn.reserved_count() > 0 {
            let sec = module.section(rel_dyn.section);
            push(elf::DT_REL, sec.addr as u32);
            push(elf::DT_RELSZ, sec.size as u32);
            push(elf::DT_RELENT, elf::REL32_SIZE);
        }
    }
    if module.plt.is_some() {
        let gotplt = module
            .got
            .as_ref()
            .map_or(0, |g| g.got_plt_addr(module) as u32);
        push(elf::DT_PLTGOT, gotplt);
        let relplt = module.rel_plt.as_ref().map(|r| module.section(r.section));
        push(elf::DT_PLTRELSZ, relplt.map_or(0, |s| s.size as u32));
        push(elf::DT_PLTREL, elf::DT_REL as u32);
        push(elf::DT_JMPREL, relplt.map_or(0, |s| s.addr as u32));
    }
    if config.bsymbolic {
        push(elf::DT_SYMBOLIC, 0);
    }
    if config.output_type == OutputType::Exec {
        push(elf::DT_DEBUG, 0);
    }
    push(elf::DT_NULL, 0);
    out
}

// ── SysV hash ────────────────────────────────────────────────────────────────

pub fn sysv_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in name {
        h = (h << 4).wrapping_add(b as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// Bucket/chain table over the dynamic symbol names (index 0 is the null
/// symbol and stays unhashed).
pub fn build_hash(names: &[String]) -> Vec<u8> {
    let nbuckets: u32 = if names.is_empty() {
        1
    } else {
        names.len().next_power_of_two() as u32
    };
    let nchains = (names.len() + 1) as u32;

    let mut buckets = vec![0u32; nbuckets as usize];
    let mut chains = vec![0u32; nchains as usize];
    for (i, name) in names.iter().enumerate() {
        let sym_idx = (i + 1) as u32;
        let bucket = (sysv_hash(name.as_bytes()) % nbuckets) as usize;
        chains[sym_idx as usize] = buckets[bucket];
        buckets[bucket] = sym_idx;
    }

    let mut out = Vec::with_capacity(8 + 4 * (buckets.len() + chains.len()));
    out.extend_from_slice(&nbuckets.to_le_bytes());
    out.extend_from_slice(&nchains.to_le_bytes());
    for b in &buckets {
        out.extend_from_slice(&b.to_le_bytes());
    }
    for c in &chains {
        out.extend_from_slice(&c.to_le_bytes());
    }
    out
}
