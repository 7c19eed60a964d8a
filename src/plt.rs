//! The Procedure Linkage Table.
//!
//! `.plt` starts with the resolver stub (PLT0) followed by one entry per
//! lazily-bound symbol. Reserving an entry simultaneously reserves the
//! paired `.got.plt` slot and the `R_ARM_JUMP_SLOT`-style record in
//! `.rel.plt`; the three tables stay index-aligned by construction.

use std::collections::HashMap;

use crate::dynamic::DynRelSection;
use crate::elf;
use crate::fragment::{FragmentKind, FragmentRef};
use crate::got::{Got, GOTPLT_RESERVED};
use crate::module::{FragmentId, Module, SectionId, SymbolId};
use crate::section::{SectionFlags, SectionKind};
use crate::target::Backend;

pub struct Plt {
    pub section: SectionId,
    plt0: FragmentId,
    entries: Vec<FragmentId>,
    symbols: Vec<SymbolId>,
    by_symbol: HashMap<SymbolId, u32>,
}

impl Plt {
    /// Create `.plt` with its PLT0 stub. The GOT must already exist; the
    /// scanner creates it first so PLT0 can reach `.got.plt`.
    pub fn create(module: &mut Module, backend: &Backend) -> Plt {
        let section = module.get_or_create_output(
            ".plt",
            SectionKind::Plt,
            elf::SHT_PROGBITS,
            SectionFlags::ALLOC | SectionFlags::EXECINSTR,
            4,
        );
        let plt0 = module.append_fragment(
            section,
            FragmentKind::PltEntry {
                symbol: None,
                size: backend.plt0_size,
                bytes: Vec::new(),
            },
            4,
        );
        Plt {
            section,
            plt0,
            entries: Vec::new(),
            symbols: Vec::new(),
            by_symbol: HashMap::new(),
        }
    }

    /// Reserve a PLT entry for `symbol` plus its `.got.plt` slot and
    /// `.rel.plt` record. Returns the entry index.
    pub fn reserve_entry(
        &mut self,
        module: &mut Module,
        backend: &Backend,
        got: &mut Got,
        rel_plt: &mut DynRelSection,
        symbol: SymbolId,
    ) -> u32 {
        if let Some(&index) = self.by_symbol.get(&symbol) {
            return index;
        }
        let frag = module.append_fragment(
            self.section,
            FragmentKind::PltEntry {
                symbol: Some(symbol),
                size: backend.plt1_size,
                bytes: Vec::new(),
            },
            4,
        );
        got.reserve_plt_slot(module, backend, symbol);
        rel_plt.reserve_entry(module, backend);

        let index = self.entries.len() as u32;
        self.entries.push(frag);
        self.symbols.push(symbol);
        self.by_symbol.insert(symbol, index);
        module.symtab.get_mut(symbol).plt_index = Some(index);
        index
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Address of PLT entry `index`; meaningful after layout.
    pub fn entry_addr(&self, module: &Module, index: u32) -> u64 {
        module.frag_addr(FragmentRef::new(self.entries[index as usize], 0))
    }

    pub fn addr(&self, module: &Module) -> u64 {
        module.section(self.section).addr
    }

    /// Emit the final stub bytes and wire up the lazy-binding state: each
    /// `.got.plt` slot initially points back at PLT0, and each `.rel.plt`
    /// record asks the dynamic linker to patch that slot.
    pub fn apply(
        &self,
        module: &mut Module,
        backend: &Backend,
        got: &Got,
        rel_plt: &mut DynRelSection,
    ) {
        let plt0_addr = module.frag_addr(FragmentRef::new(self.plt0, 0));
        let gotplt_addr = got.got_plt_addr(module);
        let plt0_bytes = (backend.make_plt0)(plt0_addr, gotplt_addr);
        debug_assert_eq!(plt0_bytes.len() as u64, backend.plt0_size);
        if let FragmentKind::PltEntry { bytes, .. } = &mut module.fragment_mut(self.plt0).kind {
            *bytes = plt0_bytes;
        }

        for (i, &entry) in self.entries.iter().enumerate() {
            let entry_addr = module.frag_addr(FragmentRef::new(entry, 0));
            let slot = got.plt_slot(i);
            let slot_addr = module.frag_addr(FragmentRef::new(slot, 0));
            let bytes = (backend.make_plt1)(entry_addr, slot_addr);
            debug_assert_eq!(bytes.len() as u64, backend.plt1_size);
            if let FragmentKind::PltEntry { bytes: b, .. } = &mut module.fragment_mut(entry).kind {
                *b = bytes;
            }
            Got::set_value(module, slot, plt0_addr);

            let dynsym_index = module
                .symtab
                .get(self.symbols[i])
                .dynsym_index
                .unwrap_or(0);
            rel_plt.fill_next(module, slot_addr, dynsym_index, backend.rel_jump_slot);
        }
    }

    /// `.got.plt` slots the PLT claims beyond the reserved triple.
    pub fn claimed_got_slots(&self) -> usize {
        self.entries.len() + GOTPLT_RESERVED
    }
}
