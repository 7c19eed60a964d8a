//! Relocation scanning: decide, per relocation, which GOT/PLT/dynamic-reloc
//! entries the output needs, and record the decision in the symbol's
//! reservation bits.
//!
//! All effects are reservations; nothing is resolved here. The per-symbol
//! bits make symbol-scoped reservations idempotent, and every record carries
//! a scanned flag so a second pass over the same relocation is a no-op.

use crate::config::{Config, OutputType};
use crate::dynamic::DynRelSection;
use crate::error::LinkError;
use crate::got::Got;
use crate::input::InputType;
use crate::module::{Module, SymbolId};
use crate::plt::Plt;
use crate::relocate::Relocation;
use crate::section::{SectionData, SectionKind};
use crate::symbol::{ReserveFlags, ResolveInfo, SymbolType, Visibility};
use crate::target::{Backend, RelocClass};

// ── Predicates ───────────────────────────────────────────────────────────────

/// A symbol whose binding the dynamic linker may override at load time.
pub fn preemptible(config: &Config, sym: &ResolveInfo) -> bool {
    sym.visibility == Visibility::Default
        && config.output_type == OutputType::DynObj
        && !config.bsymbolic
}

/// Function symbols that must be called through the PLT when building a
/// shared object.
fn needs_plt(config: &Config, sym: &ResolveInfo) -> bool {
    config.output_type == OutputType::DynObj
        && sym.ty == SymbolType::Function
        && (sym.is_dyn || sym.is_undef() || preemptible(config, sym))
}

/// References that need a dynamic relocation so the loader can finish them.
fn needs_dyn_reloc(config: &Config, sym: &ResolveInfo, is_abs: bool) -> bool {
    if sym.is_undef() && config.output_type == OutputType::Exec {
        return false;
    }
    if sym.is_absolute() {
        return false;
    }
    if config.output_type == OutputType::DynObj && is_abs {
        return true;
    }
    sym.is_dyn || sym.is_undef()
}

// ── Scanner ──────────────────────────────────────────────────────────────────

/// Walk every relocation of every object input and reserve entries.
pub fn scan_relocations(
    module: &mut Module,
    config: &Config,
    backend: &Backend,
) -> Result<(), LinkError> {
    for idx in 0..module.inputs.len() {
        if module.inputs[idx].itype != InputType::Object {
            continue;
        }
        let input_name = module.inputs[idx].name.clone();
        let sections = module.inputs[idx].sections.clone();
        for sec_id in sections {
            if module.section(sec_id).kind != SectionKind::Relocation {
                continue;
            }
            let mut relocs = match &mut module.section_mut(sec_id).data {
                SectionData::Relocs(list) => std::mem::take(list),
                _ => continue,
            };
            let mut result = Ok(());
            for reloc in &mut relocs {
                result = scan_one(module, config, backend, &input_name, reloc);
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

fn scan_one(
    module: &mut Module,
    config: &Config,
    backend: &Backend,
    input_name: &str,
    reloc: &mut Relocation,
) -> Result<(), LinkError> {
    if reloc.scanned {
        return Ok(());
    }
    reloc.scanned = true;

    let sym_id = reloc.symbol;
    let sym = module.symtab.get(sym_id).clone();

    // A reference to _GLOBAL_OFFSET_TABLE_ implies the GOT exists even when
    // no relocation otherwise demands it.
    if module.got.is_none() && sym.name == "_GLOBAL_OFFSET_TABLE_" {
        ensure_got(module, backend);
    }

    let class = (backend.classify)(reloc.rtype);
    if sym.is_local() {
        scan_local(module, config, backend, input_name, reloc, class)
    } else {
        scan_global(module, config, backend, input_name, reloc, sym_id, &sym, class)
    }
}

fn scan_local(
    module: &mut Module,
    config: &Config,
    backend: &Backend,
    input_name: &str,
    reloc: &Relocation,
    class: RelocClass,
) -> Result<(), LinkError> {
    let sym_id = reloc.symbol;
    match class {
        RelocClass::Absolute { dyn_ok } => {
            // PIC images relocate absolute references at load time.
            if config.output_type == OutputType::DynObj {
                check_valid_reloc(reloc, dyn_ok, input_name, module)?;
                reserve_rel_dyn(module, backend, sym_id);
            }
        }
        RelocClass::GotOff => {
            ensure_got(module, backend);
        }
        RelocClass::GotIndirect => {
            if module.symtab.get(sym_id).reserved.any_got() {
                return Ok(());
            }
            ensure_got(module, backend);
            reserve_got_entry(module, backend, sym_id);
            if config.output_type == OutputType::DynObj {
                // The GOT slot itself needs a relative fixup.
                ensure_rel_dyn(module, backend);
                let mut rel_dyn = module.rel_dyn.take().unwrap();
                rel_dyn.reserve_entry(module, backend);
                module.rel_dyn = Some(rel_dyn);
                set_reserved(module, sym_id, ReserveFlags::GOT_REL);
            } else {
                set_reserved(module, sym_id, ReserveFlags::GOT);
            }
        }
        RelocClass::DynOnly => {
            return Err(LinkError::UnexpectedReloc {
                rtype: reloc.rtype,
                input: input_name.to_string(),
            });
        }
        _ => {}
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn scan_global(
    module: &mut Module,
    config: &Config,
    backend: &Backend,
    input_name: &str,
    reloc: &Relocation,
    sym_id: SymbolId,
    sym: &ResolveInfo,
    class: RelocClass,
) -> Result<(), LinkError> {
    match class {
        RelocClass::Absolute { dyn_ok } => {
            if needs_plt(config, sym) && !sym.reserved.contains(ReserveFlags::PLT) {
                reserve_plt_entry(module, backend, sym_id);
            }
            // Re-read: the PLT reservation may matter for later passes but
            // not for the dynamic-reloc decision below.
            if needs_dyn_reloc(config, sym, true) {
                check_valid_reloc(reloc, dyn_ok, input_name, module)?;
                reserve_rel_dyn(module, backend, sym_id);
            }
        }
        RelocClass::PcRel { dyn_ok } => {
            if needs_dyn_reloc(config, sym, false) {
                check_valid_reloc(reloc, dyn_ok, input_name, module)?;
                reserve_rel_dyn(module, backend, sym_id);
            }
        }
        RelocClass::Branch => {
            if sym.reserved.contains(ReserveFlags::PLT) {
                return Ok(());
            }
            // Defined here and not preemptible: the branch binds directly.
            if sym.is_define() && !sym.is_dyn && !preemptible(config, sym) {
                return Ok(());
            }
            reserve_plt_entry(module, backend, sym_id);
        }
        RelocClass::GotIndirect => {
            if sym.reserved.any_got() {
                return Ok(());
            }
            ensure_got(module, backend);
            reserve_got_entry(module, backend, sym_id);
            if config.output_type == OutputType::DynObj || sym.is_undef() || sym.is_dyn {
                ensure_rel_dyn(module, backend);
                let mut rel_dyn = module.rel_dyn.take().unwrap();
                rel_dyn.reserve_entry(module, backend);
                module.rel_dyn = Some(rel_dyn);
                set_reserved(module, sym_id, ReserveFlags::GOT_REL);
            } else {
                set_reserved(module, sym_id, ReserveFlags::GOT);
            }
        }
        RelocClass::GotOff => {
            ensure_got(module, backend);
        }
        RelocClass::DynOnly => {
            return Err(LinkError::UnexpectedReloc {
                rtype: reloc.rtype,
                input: input_name.to_string(),
            });
        }
        RelocClass::None => {}
        RelocClass::Unsupported => {
            return Err(LinkError::UnsupportedReloc {
                rtype: reloc.rtype,
                symbol: sym.name.clone(),
                input: input_name.to_string(),
            });
        }
    }
    Ok(())
}

/// A dynamic relocation is about to be generated for this place; the type
/// must be one the dynamic linker processes, or the input needs rebuilding
/// as position-independent code.
fn check_valid_reloc(
    reloc: &Relocation,
    dyn_ok: bool,
    input_name: &str,
    module: &Module,
) -> Result<(), LinkError> {
    if dyn_ok {
        return Ok(());
    }
    Err(LinkError::UnsupportedReloc {
        rtype: reloc.rtype,
        symbol: module.symtab.get(reloc.symbol).name.clone(),
        input: input_name.to_string(),
    })
}

// ── Reservation helpers ──────────────────────────────────────────────────────

fn set_reserved(module: &mut Module, sym: SymbolId, bits: ReserveFlags) {
    let info = module.symtab.get_mut(sym);
    info.reserved |= bits;
    log::debug!("reserve {:?} for `{}'", bits, info.name);
}

fn ensure_got(module: &mut Module, backend: &Backend) {
    if module.got.is_none() {
        let got = Got::create(module, backend);
        module.got = Some(got);
    }
}

fn ensure_rel_dyn(module: &mut Module, backend: &Backend) {
    if module.rel_dyn.is_none() {
        module.rel_dyn = Some(DynRelSection::create(module, backend, ".rel.dyn"));
    }
}

fn ensure_plt(module: &mut Module, backend: &Backend) {
    ensure_got(module, backend);
    if module.plt.is_none() {
        module.rel_plt = Some(DynRelSection::create(module, backend, ".rel.plt"));
        module.plt = Some(Plt::create(module, backend));
    }
}

/// Reserve one `.rel.dyn` record for the current relocation and mark the
/// symbol. Entries are per-location; the bit is per-symbol.
fn reserve_rel_dyn(module: &mut Module, backend: &Backend, sym: SymbolId) {
    ensure_rel_dyn(module, backend);
    let mut rel_dyn = module.rel_dyn.take().unwrap();
    rel_dyn.reserve_entry(module, backend);
    module.rel_dyn = Some(rel_dyn);
    set_reserved(module, sym, ReserveFlags::REL_RESERVED);
}

fn reserve_got_entry(module: &mut Module, backend: &Backend, sym: SymbolId) {
    let mut got = module.got.take().expect("GOT must exist before reserving");
    got.reserve_entry(module, backend, sym);
    module.got = Some(got);
}

/// Reserve a PLT entry together with its GOT slot and `.rel.plt` record.
fn reserve_plt_entry(module: &mut Module, backend: &Backend, sym: SymbolId) {
    ensure_plt(module, backend);
    let mut got = module.got.take().unwrap();
    let mut plt = module.plt.take().unwrap();
    let mut rel_plt = module.rel_plt.take().unwrap();
    plt.reserve_entry(module, backend, &mut got, &mut rel_plt, sym);
    module.rel_plt = Some(rel_plt);
    module.plt = Some(plt);
    module.got = Some(got);
    set_reserved(module, sym, ReserveFlags::PLT);
}
