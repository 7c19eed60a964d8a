//! Symbol records (`ResolveInfo`) and the interned symbol table.
//!
//! One `ResolveInfo` exists per distinct global name; local symbols get
//! uninterned entries of their own. The reservation mask on each record is
//! the canonical scanner state: bits survive across scanner passes, which is
//! what makes reservation idempotent.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::elf;
use crate::fragment::FragmentRef;
use crate::module::{InputId, SymbolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    NoType,
    Object,
    Function,
    Section,
    File,
    CommonBlock,
    ThreadLocal,
}

impl SymbolType {
    pub fn from_elf(st_type: u8) -> SymbolType {
        match st_type {
            elf::STT_OBJECT => SymbolType::Object,
            elf::STT_FUNC => SymbolType::Function,
            elf::STT_SECTION => SymbolType::Section,
            elf::STT_FILE => SymbolType::File,
            elf::STT_COMMON => SymbolType::CommonBlock,
            elf::STT_TLS => SymbolType::ThreadLocal,
            _ => SymbolType::NoType,
        }
    }

    pub fn to_elf(self) -> u8 {
        match self {
            SymbolType::NoType => elf::STT_NOTYPE,
            SymbolType::Object => elf::STT_OBJECT,
            SymbolType::Function => elf::STT_FUNC,
            SymbolType::Section => elf::STT_SECTION,
            SymbolType::File => elf::STT_FILE,
            SymbolType::CommonBlock => elf::STT_COMMON,
            SymbolType::ThreadLocal => elf::STT_TLS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local,
    Global,
    Weak,
}

impl Binding {
    pub fn to_elf(self) -> u8 {
        match self {
            Binding::Local => elf::STB_LOCAL,
            Binding::Global => elf::STB_GLOBAL,
            Binding::Weak => elf::STB_WEAK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Internal,
    Hidden,
    Protected,
}

impl Visibility {
    pub fn from_elf(st_other: u8) -> Visibility {
        match st_other & 0x3 {
            elf::STV_INTERNAL => Visibility::Internal,
            elf::STV_HIDDEN => Visibility::Hidden,
            elf::STV_PROTECTED => Visibility::Protected,
            _ => Visibility::Default,
        }
    }
}

/// How far resolution has taken this name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolDesc {
    Undefined,
    Define,
    Common,
    Indirect,
}

bitflags! {
    /// Scanner reservation state. A set bit means the corresponding entry
    /// (dynamic relocation, GOT slot, GOT slot with dynamic relocation, PLT
    /// entry) has already been claimed for this symbol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReserveFlags: u8 {
        const REL_RESERVED = 0x1;
        const GOT = 0x2;
        const GOT_REL = 0x4;
        const PLT = 0x8;
    }
}

impl ReserveFlags {
    /// Either flavor of GOT reservation.
    pub fn any_got(self) -> bool {
        self.intersects(ReserveFlags::GOT | ReserveFlags::GOT_REL)
    }
}

/// The unified per-name resolution record.
#[derive(Debug, Clone)]
pub struct ResolveInfo {
    pub name: String,
    pub ty: SymbolType,
    pub binding: Binding,
    pub visibility: Visibility,
    pub desc: SymbolDesc,
    pub size: u64,
    /// Final value after layout. For absolute symbols, the absolute value;
    /// for commons before allocation, the required alignment.
    pub value: u64,
    /// Where the definition lives, when it has a place in the image.
    pub frag: Option<FragmentRef>,
    pub absolute: bool,
    pub reserved: ReserveFlags,
    /// Defined by a shared object.
    pub is_dyn: bool,
    pub source: Option<InputId>,
    pub got_index: Option<u32>,
    pub plt_index: Option<u32>,
    pub dynsym_index: Option<u32>,
}

impl ResolveInfo {
    pub fn undefined(name: &str) -> ResolveInfo {
        ResolveInfo {
            name: name.to_string(),
            ty: SymbolType::NoType,
            binding: Binding::Global,
            visibility: Visibility::Default,
            desc: SymbolDesc::Undefined,
            size: 0,
            value: 0,
            frag: None,
            absolute: false,
            reserved: ReserveFlags::empty(),
            is_dyn: false,
            source: None,
            got_index: None,
            plt_index: None,
            dynsym_index: None,
        }
    }

    pub fn is_undef(&self) -> bool {
        self.desc == SymbolDesc::Undefined
    }

    pub fn is_define(&self) -> bool {
        self.desc == SymbolDesc::Define
    }

    pub fn is_common(&self) -> bool {
        self.desc == SymbolDesc::Common
    }

    pub fn is_local(&self) -> bool {
        self.binding == Binding::Local
    }

    pub fn is_global(&self) -> bool {
        self.binding == Binding::Global
    }

    pub fn is_weak(&self) -> bool {
        self.binding == Binding::Weak
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }
}

/// Name-interned symbol store. Globals and weaks share one record per name;
/// locals are appended without interning.
pub struct SymbolTable {
    infos: Vec<ResolveInfo>,
    by_name: HashMap<String, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            infos: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Intern `name`, creating an undefined placeholder on first sight.
    pub fn declare(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = SymbolId(self.infos.len() as u32);
        self.infos.push(ResolveInfo::undefined(name));
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Append a record that does not take part in name resolution.
    pub fn add_local(&mut self, info: ResolveInfo) -> SymbolId {
        let id = SymbolId(self.infos.len() as u32);
        self.infos.push(info);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: SymbolId) -> &ResolveInfo {
        &self.infos[id.index()]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut ResolveInfo {
        &mut self.infos[id.index()]
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Interned (global-scope) records only, in id order.
    pub fn globals(&self) -> impl Iterator<Item = (SymbolId, &ResolveInfo)> {
        self.by_name.values().map(|id| (*id, self.get(*id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &ResolveInfo)> {
        self.infos
            .iter()
            .enumerate()
            .map(|(i, info)| (SymbolId(i as u32), info))
    }

    /// Names that still need a definition: undefined, non-weak, not supplied
    /// by a shared object. This is the archive-member pull-in predicate.
    pub fn undefined_strong_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .globals()
            .filter(|(_, s)| s.is_undef() && !s.is_weak() && !s.is_dyn)
            .map(|(_, s)| s.name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_interns_once() {
        let mut tab = SymbolTable::new();
        let a = tab.declare("printf");
        let b = tab.declare("printf");
        assert_eq!(a, b);
        assert_eq!(tab.len(), 1);
        assert!(tab.get(a).is_undef());
    }

    #[test]
    fn test_locals_do_not_intern() {
        let mut tab = SymbolTable::new();
        let mut info = ResolveInfo::undefined(".Lanchor");
        info.binding = Binding::Local;
        let a = tab.add_local(info.clone());
        let b = tab.add_local(info);
        assert_ne!(a, b);
        assert_eq!(tab.lookup(".Lanchor"), None);
    }

    #[test]
    fn test_reserve_flags_got_query() {
        let mut r = ReserveFlags::empty();
        assert!(!r.any_got());
        r |= ReserveFlags::GOT_REL;
        assert!(r.any_got());
        r = ReserveFlags::PLT;
        assert!(!r.any_got());
    }

    #[test]
    fn test_undefined_strong_names_filters() {
        let mut tab = SymbolTable::new();
        tab.declare("need_me");
        let weak = tab.declare("weak_ref");
        tab.get_mut(weak).binding = Binding::Weak;
        let from_so = tab.declare("sin");
        tab.get_mut(from_so).is_dyn = true;
        assert_eq!(tab.undefined_strong_names(), vec!["need_me".to_string()]);
    }
}
