//! The Global Offset Table: `.got` for data indirection, `.got.plt` for the
//! lazy-binding slots the PLT jumps through.
//!
//! Creating the GOT also defines `_GLOBAL_OFFSET_TABLE_`; its value is fixed
//! up by the layout engine once `.got` has an address. The first three
//! `.got.plt` slots belong to the dynamic linker (`_DYNAMIC`, link map,
//! resolver) and are reserved at creation.

use std::collections::HashMap;

use crate::elf;
use crate::fragment::FragmentKind;
use crate::module::{FragmentId, Module, SectionId, SymbolId};
use crate::section::{SectionFlags, SectionKind};
use crate::symbol::{Binding, ResolveInfo, SymbolDesc, SymbolType, Visibility};
use crate::target::Backend;

pub const GOTPLT_RESERVED: usize = 3;

pub struct Got {
    /// `.got`: one slot per GOT-indirect symbol.
    pub section: SectionId,
    /// `.got.plt`: reserved triple plus one slot per PLT entry.
    pub got_plt: SectionId,
    entries: Vec<FragmentId>,
    plt_slots: Vec<FragmentId>,
    by_symbol: HashMap<SymbolId, FragmentId>,
}

impl Got {
    /// Create `.got` and `.got.plt` and define `_GLOBAL_OFFSET_TABLE_`.
    pub fn create(module: &mut Module, backend: &Backend) -> Got {
        let flags = SectionFlags::ALLOC | SectionFlags::WRITE;
        let section = module.get_or_create_output(
            ".got",
            SectionKind::Got,
            elf::SHT_PROGBITS,
            flags,
            backend.got_entry_size as u32,
        );
        let got_plt = module.get_or_create_output(
            ".got.plt",
            SectionKind::Got,
            elf::SHT_PROGBITS,
            flags,
            backend.got_entry_size as u32,
        );
        let mut got = Got {
            section,
            got_plt,
            entries: Vec::new(),
            plt_slots: Vec::new(),
            by_symbol: HashMap::new(),
        };
        for _ in 0..GOTPLT_RESERVED {
            got.append_slot(module, backend, got_plt, None);
        }

        let mut info = ResolveInfo::undefined("_GLOBAL_OFFSET_TABLE_");
        info.ty = SymbolType::Object;
        info.binding = Binding::Local;
        info.visibility = Visibility::Hidden;
        info.desc = SymbolDesc::Define;
        let id = module.symtab.declare("_GLOBAL_OFFSET_TABLE_");
        let reserved = module.symtab.get(id).reserved;
        *module.symtab.get_mut(id) = info;
        module.symtab.get_mut(id).reserved = reserved;

        got
    }

    fn append_slot(
        &mut self,
        module: &mut Module,
        backend: &Backend,
        section: SectionId,
        symbol: Option<SymbolId>,
    ) -> FragmentId {
        module.append_fragment(
            section,
            FragmentKind::GotEntry {
                symbol,
                size: backend.got_entry_size,
                value: 0,
            },
            backend.got_entry_size as u32,
        )
    }

    /// Reserve one `.got` slot for a symbol. Idempotence is the caller's
    /// business (the scanner checks the reservation bits first).
    pub fn reserve_entry(
        &mut self,
        module: &mut Module,
        backend: &Backend,
        symbol: SymbolId,
    ) -> FragmentId {
        let frag = self.append_slot(module, backend, self.section, Some(symbol));
        self.entries.push(frag);
        self.by_symbol.insert(symbol, frag);
        module.symtab.get_mut(symbol).got_index = Some((self.entries.len() - 1) as u32);
        frag
    }

    /// Reserve the `.got.plt` slot paired with a new PLT entry.
    pub fn reserve_plt_slot(
        &mut self,
        module: &mut Module,
        backend: &Backend,
        symbol: SymbolId,
    ) -> FragmentId {
        let frag = self.append_slot(module, backend, self.got_plt, Some(symbol));
        self.plt_slots.push(frag);
        frag
    }

    pub fn entry_for(&self, symbol: SymbolId) -> Option<FragmentId> {
        self.by_symbol.get(&symbol).copied()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// `.got.plt` slots excluding the reserved triple.
    pub fn plt_slot_count(&self) -> usize {
        self.plt_slots.len()
    }

    pub fn plt_slot(&self, index: usize) -> FragmentId {
        self.plt_slots[index]
    }

    /// GOT origin address; meaningful after layout.
    pub fn origin(&self, module: &Module) -> u64 {
        module.section(self.section).addr
    }

    pub fn got_plt_addr(&self, module: &Module) -> u64 {
        module.section(self.got_plt).addr
    }

    /// Store a resolved value into a GOT slot.
    pub fn set_value(module: &mut Module, frag: FragmentId, value: u64) {
        if let FragmentKind::GotEntry { value: slot, .. } = &mut module.fragment_mut(frag).kind {
            *slot = value;
        }
    }

    /// Fill the reserved `.got.plt` header: slot 0 holds the address of
    /// `.dynamic`, the next two belong to the dynamic linker at run time.
    pub fn apply_header(&self, module: &mut Module, dynamic_addr: u64) {
        let list = module.section(self.got_plt).fragment_list().to_vec();
        if let Some(&first) = list.first() {
            Got::set_value(module, first, dynamic_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::arm;

    #[test]
    fn test_create_reserves_header_and_defines_got_symbol() {
        let mut module = Module::new();
        let backend = arm::backend();
        let got = Got::create(&mut module, &backend);
        assert_eq!(module.section(got.got_plt).size, 12);
        assert_eq!(module.section(got.section).size, 0);
        assert_eq!(got.plt_slot_count(), 0);

        let id = module.symtab.lookup("_GLOBAL_OFFSET_TABLE_").unwrap();
        let info = module.symtab.get(id);
        assert!(info.is_define());
        assert_eq!(info.binding, Binding::Local);
        assert_eq!(info.visibility, Visibility::Hidden);
    }

    #[test]
    fn test_reserve_entry_tracks_symbol() {
        let mut module = Module::new();
        let backend = arm::backend();
        let mut got = Got::create(&mut module, &backend);
        let sym = module.symtab.declare("x");
        assert!(got.entry_for(sym).is_none());
        let frag = got.reserve_entry(&mut module, &backend, sym);
        assert_eq!(got.entry_for(sym), Some(frag));
        assert_eq!(got.entry_count(), 1);
        assert_eq!(module.section(got.section).size, 4);
        assert_eq!(module.symtab.get(sym).got_index, Some(0));
    }
}
