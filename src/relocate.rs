//! Relocation records and the apply engine.
//!
//! A [`Relocation`] caches `target_data`, the datum read from the place it
//! patches, converted to host byte order exactly once when the record is
//! produced. The applier hands that host-endian scratch word to the
//! backend's per-type function and byte-swaps exactly once more on
//! write-back. Nothing else in the pipeline touches target byte order.

use std::collections::HashSet;

use crate::config::{BitClass, Config, Endianness};
use crate::error::LinkError;
use crate::fragment::FragmentRef;
use crate::got::Got;
use crate::module::{Module, SymbolId};
use crate::scan::preemptible;
use crate::section::{SectionData, SectionKind};
use crate::symbol::{ReserveFlags, ResolveInfo};
use crate::target::{ApplyVars, Backend, RelocClass, RelocStatus};

/// One relocation from an input section.
#[derive(Debug)]
pub struct Relocation {
    pub rtype: u32,
    /// The place being patched.
    pub target: FragmentRef,
    pub symbol: SymbolId,
    /// Explicit addend (RELA inputs); REL inputs carry theirs in
    /// `target_data`.
    pub addend: i64,
    /// Pre-read datum in host byte order.
    pub target_data: u64,
    /// Set once the scanner has classified this record; keeps re-scans from
    /// reserving twice.
    pub scanned: bool,
}

/// Produces relocations with the endianness contract applied. Mirrors the
/// allocation scope of relocations: one factory per ingest run.
pub struct RelocationFactory {
    snapshot: Option<(Endianness, BitClass)>,
}

impl RelocationFactory {
    pub fn new() -> RelocationFactory {
        RelocationFactory { snapshot: None }
    }

    pub fn set_config(&mut self, config: &Config) {
        self.snapshot = Some((config.endian, config.bitclass));
    }

    /// Build a relocation, pre-reading the target datum. Fails when no
    /// configuration has been installed.
    pub fn produce(
        &self,
        module: &Module,
        rtype: u32,
        target: FragmentRef,
        symbol: SymbolId,
        addend: i64,
    ) -> Result<Relocation, LinkError> {
        let (endian, bitclass) = self
            .snapshot
            .ok_or_else(|| LinkError::Config("relocation factory used before configuration".into()))?;
        let target_data = module.read_word(target, bitclass.bytes(), endian);
        Ok(Relocation {
            rtype,
            target,
            symbol,
            addend,
            target_data,
            scanned: false,
        })
    }
}

impl Default for RelocationFactory {
    fn default() -> Self {
        RelocationFactory::new()
    }
}

// ── Apply phase ──────────────────────────────────────────────────────────────

/// Patch every input relocation and fill the reserved GOT/PLT/dynamic-reloc
/// entries. Runs after layout; reservation bits are frozen by then.
pub fn apply_relocations(
    module: &mut Module,
    config: &Config,
    backend: &Backend,
) -> Result<(), LinkError> {
    // PLT machinery first: stub bytes, .got.plt slots, JUMP_SLOT records.
    if let Some(plt) = module.plt.take() {
        let got = module.got.take().expect("PLT without GOT");
        let mut rel_plt = module.rel_plt.take().expect("PLT without .rel.plt");
        plt.apply(module, backend, &got, &mut rel_plt);
        module.rel_plt = Some(rel_plt);
        module.got = Some(got);
        module.plt = Some(plt);
    }
    if let Some(got) = module.got.take() {
        let dynamic_addr = module
            .output_section(".dynamic")
            .map_or(0, |s| module.section(s).addr);
        got.apply_header(module, dynamic_addr);
        module.got = Some(got);
    }

    let mut state = ApplyState {
        got_filled: HashSet::new(),
    };

    for idx in 0..module.inputs.len() {
        if module.inputs[idx].itype != crate::input::InputType::Object {
            continue;
        }
        let input_name = module.inputs[idx].name.clone();
        let sections = module.inputs[idx].sections.clone();
        for sec_id in sections {
            if module.section(sec_id).kind != SectionKind::Relocation {
                continue;
            }
            let relocs = match &mut module.section_mut(sec_id).data {
                SectionData::Relocs(list) => std::mem::take(list),
                _ => continue,
            };
            let mut result = Ok(());
            for reloc in &relocs {
                result = apply_one(module, config, backend, &input_name, reloc, &mut state);
                if result.is_err() {
                    break;
                }
            }
            if let SectionData::Relocs(list) = &mut module.section_mut(sec_id).data {
                *list = relocs;
            }
            result?;
        }
    }
    Ok(())
}

struct ApplyState {
    /// Symbols whose GOT entry (and its dynamic relocation, when reserved)
    /// has been produced already.
    got_filled: HashSet<SymbolId>,
}

fn apply_one(
    module: &mut Module,
    config: &Config,
    backend: &Backend,
    input_name: &str,
    reloc: &Relocation,
    state: &mut ApplyState,
) -> Result<(), LinkError> {
    let sym = module.symtab.get(reloc.symbol).clone();
    let class = (backend.classify)(reloc.rtype);
    let place = module.frag_addr(reloc.target);

    let plt_addr = sym
        .plt_index
        .and_then(|i| module.plt.as_ref().map(|p| p.entry_addr(module, i)));
    let s = match class {
        // Branches and absolute references divert through the PLT when one
        // was reserved for the symbol.
        RelocClass::Branch | RelocClass::Absolute { .. } if plt_addr.is_some() => plt_addr.unwrap(),
        _ if sym.is_undef() && sym.is_weak() => 0,
        _ => sym.value,
    };

    let got_entry_frag = module.got.as_ref().and_then(|g| g.entry_for(reloc.symbol));
    let got_entry = got_entry_frag.map_or(0, |f| module.frag_addr(FragmentRef::new(f, 0)));
    let got_origin = module.got.as_ref().map_or(0, |g| g.origin(module));

    let vars = ApplyVars {
        rtype: reloc.rtype,
        s,
        a: reloc.addend,
        p: place,
        data: reloc.target_data,
        got_origin,
        got_entry,
        bitclass: config.bitclass,
    };
    let (mut value, status) = (backend.apply)(&vars);
    match status {
        RelocStatus::Ok => {}
        RelocStatus::Overflow => {
            let section = module.section(module.fragment(reloc.target.frag).section);
            return Err(LinkError::RelocOverflow {
                rtype: reloc.rtype,
                symbol: sym.name.clone(),
                section: section.name.clone(),
                offset: module.fragment(reloc.target.frag).offset + reloc.target.offset,
            });
        }
        RelocStatus::BadReloc | RelocStatus::Unsupported => {
            return Err(LinkError::UnsupportedReloc {
                rtype: reloc.rtype,
                symbol: sym.name.clone(),
                input: input_name.to_string(),
            });
        }
    }

    // Produce the dynamic-side effects the scanner reserved room for.
    match class {
        RelocClass::Absolute { .. } if sym.reserved.contains(ReserveFlags::REL_RESERVED) => {
            let symbolic = sym.is_dyn
                || sym.is_undef()
                || (sym.dynsym_index.is_some() && preemptible(config, &sym));
            if let Some(mut rel_dyn) = module.rel_dyn.take() {
                if symbolic {
                    rel_dyn.fill_next(
                        module,
                        place,
                        sym.dynsym_index.unwrap_or(0),
                        backend.rel_abs,
                    );
                    // The stored word is the addend the dynamic linker adds
                    // to the runtime symbol value.
                    value = implicit_addend(reloc, config);
                } else {
                    // The place holds the link-time value; the loader adds
                    // the load bias.
                    rel_dyn.fill_next(module, place, 0, backend.rel_relative);
                }
                module.rel_dyn = Some(rel_dyn);
            }
        }
        RelocClass::GotIndirect => {
            if let Some(frag) = got_entry_frag {
                if state.got_filled.insert(reloc.symbol) {
                    fill_got_entry(module, config, backend, &sym, frag, got_entry)?;
                }
            }
        }
        _ => {}
    }

    module.write_word(
        reloc.target,
        config.bitclass.bytes(),
        config.endian,
        value,
    );
    Ok(())
}

/// The addend carried by the relocation itself: explicit plus the pre-read
/// in-place word (REL inputs).
fn implicit_addend(reloc: &Relocation, config: &Config) -> u64 {
    let implicit = match config.bitclass {
        BitClass::Class32 => reloc.target_data as u32 as i32 as i64,
        BitClass::Class64 => reloc.target_data as i64,
    };
    implicit.wrapping_add(reloc.addend) as u64
}

/// Resolve one GOT slot and, when the scanner reserved it, the dynamic
/// relocation that patches the slot at load time.
fn fill_got_entry(
    module: &mut Module,
    config: &Config,
    backend: &Backend,
    sym: &ResolveInfo,
    frag: crate::module::FragmentId,
    slot_addr: u64,
) -> Result<(), LinkError> {
    if sym.reserved.contains(ReserveFlags::GOT_REL) {
        let mut rel_dyn = module
            .rel_dyn
            .take()
            .expect("GOT_REL reserved without .rel.dyn");
        if sym.is_dyn || sym.is_undef() || preemptible(config, sym) {
            // Slot starts zero; the dynamic linker writes the final address.
            rel_dyn.fill_next(
                module,
                slot_addr,
                sym.dynsym_index.unwrap_or(0),
                backend.rel_glob_dat,
            );
            Got::set_value(module, frag, 0);
        } else {
            // Locally resolved but the image can slide: relative fixup.
            rel_dyn.fill_next(module, slot_addr, 0, backend.rel_relative);
            Got::set_value(module, frag, sym.value);
        }
        module.rel_dyn = Some(rel_dyn);
    } else {
        Got::set_value(module, frag, sym.value);
    }
    Ok(())
}
