//! The link-time object model: arenas for inputs, sections, fragments and
//! symbols, plus the output-section registry.
//!
//! Everything cross-references through typed `u32` indices rather than
//! pointers, so the section ↔ fragment ↔ symbol cycles of a linker become
//! plain index cycles. Arenas grow during ingest and scanning and are
//! released together when the [`Module`] is dropped at link end.

use std::collections::HashMap;

use crate::config::Endianness;
use crate::dynamic::DynRelSection;
use crate::fragment::{Fragment, FragmentKind, FragmentRef};
use crate::got::Got;
use crate::input::Input;
use crate::plt::Plt;
use crate::section::{Section, SectionData, SectionFlags, SectionKind};
use crate::symbol::SymbolTable;

macro_rules! arena_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(InputId);
arena_id!(SectionId);
arena_id!(FragmentId);
arena_id!(SymbolId);

/// Owner of every arena in one link job.
pub struct Module {
    pub inputs: Vec<Input>,
    pub sections: Vec<Section>,
    pub fragments: Vec<Fragment>,
    pub symtab: SymbolTable,
    /// Output sections in creation (inclusion) order.
    pub output_sections: Vec<SectionId>,
    output_by_name: HashMap<String, SectionId>,
    /// Dynamic-linking state, created on demand by the scanner.
    pub got: Option<Got>,
    pub plt: Option<Plt>,
    pub rel_dyn: Option<DynRelSection>,
    pub rel_plt: Option<DynRelSection>,
    /// Sonames to emit as DT_NEEDED, in first-reference order.
    pub needed: Vec<String>,
    /// Dynamic symbol table order (null entry excluded).
    pub dynsyms: Vec<SymbolId>,
}

impl Module {
    pub fn new() -> Module {
        Module {
            inputs: Vec::new(),
            sections: Vec::new(),
            fragments: Vec::new(),
            symtab: SymbolTable::new(),
            output_sections: Vec::new(),
            output_by_name: HashMap::new(),
            got: None,
            plt: None,
            rel_dyn: None,
            rel_plt: None,
            needed: Vec::new(),
            dynsyms: Vec::new(),
        }
    }

    // ── Arena accessors ──────────────────────────────────────────────────────

    pub fn add_input(&mut self, input: Input) -> InputId {
        let id = InputId(self.inputs.len() as u32);
        self.inputs.push(input);
        id
    }

    pub fn input(&self, id: InputId) -> &Input {
        &self.inputs[id.index()]
    }

    pub fn input_mut(&mut self, id: InputId) -> &mut Input {
        &mut self.inputs[id.index()]
    }

    pub fn add_section(&mut self, section: Section) -> SectionId {
        let id = SectionId(self.sections.len() as u32);
        self.sections.push(section);
        id
    }

    /// Create a section owned by an existing input. Embedders that emit
    /// objects directly (instead of handing the linker file bytes) build
    /// their inputs through this plus [`Module::append_fragment`].
    pub fn add_input_section(&mut self, input: InputId, section: Section) -> SectionId {
        let id = self.add_section(section);
        self.inputs[input.index()].sections.push(id);
        id
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.index()]
    }

    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.index()]
    }

    pub fn fragment(&self, id: FragmentId) -> &Fragment {
        &self.fragments[id.index()]
    }

    pub fn fragment_mut(&mut self, id: FragmentId) -> &mut Fragment {
        &mut self.fragments[id.index()]
    }

    // ── Output sections ──────────────────────────────────────────────────────

    pub fn output_section(&self, name: &str) -> Option<SectionId> {
        self.output_by_name.get(name).copied()
    }

    /// Find the output section by name or create it with the given header.
    pub fn get_or_create_output(
        &mut self,
        name: &str,
        kind: SectionKind,
        sh_type: u32,
        flags: SectionFlags,
        align: u32,
    ) -> SectionId {
        if let Some(id) = self.output_by_name.get(name) {
            return *id;
        }
        let id = self.add_section(Section::new(name, kind, sh_type, flags, align));
        self.output_by_name.insert(name.to_string(), id);
        self.output_sections.push(id);
        id
    }

    // ── Fragment append ──────────────────────────────────────────────────────

    /// Append a fragment to a section's body, padding with an alignment
    /// fragment first when the current size is not aligned. Returns the id of
    /// the content fragment. The section's size grows by pad + content.
    pub fn append_fragment(
        &mut self,
        section: SectionId,
        kind: FragmentKind,
        align: u32,
    ) -> FragmentId {
        let align = align.max(1) as u64;
        let cur = self.sections[section.index()].size;
        let pad = crate::elf::align_up(cur, align) - cur;
        if pad > 0 {
            let pad_id = self.push_fragment(Fragment {
                section,
                offset: cur,
                kind: FragmentKind::Alignment {
                    boundary: align,
                    pad,
                },
            });
            self.attach(section, pad_id, pad);
        }
        let offset = self.sections[section.index()].size;
        let size = kind.size();
        let id = self.push_fragment(Fragment {
            section,
            offset,
            kind,
        });
        self.attach(section, id, size);
        if (align as u32) > self.sections[section.index()].align {
            self.sections[section.index()].align = align as u32;
        }
        id
    }

    fn push_fragment(&mut self, frag: Fragment) -> FragmentId {
        let id = FragmentId(self.fragments.len() as u32);
        self.fragments.push(frag);
        id
    }

    fn attach(&mut self, section: SectionId, frag: FragmentId, size: u64) {
        let sec = &mut self.sections[section.index()];
        match &mut sec.data {
            SectionData::Fragments(list) => list.push(frag),
            other => {
                *other = SectionData::Fragments(vec![frag]);
            }
        }
        sec.size += size;
    }

    /// Re-walk a section's fragment list and reassign offsets. Needed after
    /// mid-list insertion (stub placement): alignment pads are recomputed and
    /// every following fragment shifts.
    pub fn recompute_offsets(&mut self, section: SectionId) {
        let list = match &self.sections[section.index()].data {
            SectionData::Fragments(list) => list.clone(),
            _ => return,
        };
        let mut cursor = 0u64;
        for id in list {
            let frag = &mut self.fragments[id.index()];
            if let FragmentKind::Alignment { boundary, pad } = &mut frag.kind {
                *pad = crate::elf::align_up(cursor, *boundary) - cursor;
            }
            frag.offset = cursor;
            cursor += frag.kind.size();
        }
        self.sections[section.index()].size = cursor;
    }

    /// Insert a fragment immediately after `anchor` in its section and
    /// cascade offsets. Used for branch-range stubs.
    pub fn insert_fragment_after(&mut self, anchor: FragmentId, kind: FragmentKind) -> FragmentId {
        let section = self.fragments[anchor.index()].section;
        let id = self.push_fragment(Fragment {
            section,
            offset: 0,
            kind,
        });
        if let SectionData::Fragments(list) = &mut self.sections[section.index()].data {
            let at = list.iter().position(|&f| f == anchor).map_or(list.len(), |i| i + 1);
            list.insert(at, id);
        }
        self.recompute_offsets(section);
        id
    }

    // ── Addressing ──────────────────────────────────────────────────────────

    /// Final address of a fragment-relative location. Valid after layout.
    pub fn frag_addr(&self, fref: FragmentRef) -> u64 {
        let frag = self.fragment(fref.frag);
        let sec = self.section(frag.section);
        sec.addr + frag.offset + fref.offset
    }

    /// Offset of a fragment-relative location within the output file.
    pub fn frag_file_offset(&self, fref: FragmentRef) -> u64 {
        let frag = self.fragment(fref.frag);
        let sec = self.section(frag.section);
        sec.offset + frag.offset + fref.offset
    }

    /// Read an n-byte word from a region fragment's bytes, converting to host
    /// endianness when the target disagrees. This is the single point where
    /// target bytes become host-order scratch data.
    pub fn read_word(&self, fref: FragmentRef, nbytes: usize, endian: Endianness) -> u64 {
        let frag = self.fragment(fref.frag);
        let bytes = match &frag.kind {
            FragmentKind::Region { bytes } => bytes,
            _ => return 0,
        };
        let at = fref.offset as usize;
        if at + nbytes > bytes.len() {
            return 0;
        }
        let mut word = [0u8; 8];
        word[..nbytes].copy_from_slice(&bytes[at..at + nbytes]);
        let raw = u64::from_le_bytes(word);
        match endian {
            Endianness::Little => raw,
            Endianness::Big => {
                // stored big-endian on target: reinterpret the n bytes
                let mut v = 0u64;
                for b in &bytes[at..at + nbytes] {
                    v = (v << 8) | *b as u64;
                }
                v
            }
        }
    }

    /// Write an n-byte host-endian word back into a region fragment,
    /// converting to target byte order. The inverse of [`Module::read_word`].
    pub fn write_word(&mut self, fref: FragmentRef, nbytes: usize, endian: Endianness, value: u64) {
        let frag = self.fragment_mut(fref.frag);
        let bytes = match &mut frag.kind {
            FragmentKind::Region { bytes } => bytes,
            _ => return,
        };
        let at = fref.offset as usize;
        if at + nbytes > bytes.len() {
            return;
        }
        match endian {
            Endianness::Little => {
                bytes[at..at + nbytes].copy_from_slice(&value.to_le_bytes()[..nbytes]);
            }
            Endianness::Big => {
                for (i, slot) in bytes[at..at + nbytes].iter_mut().enumerate() {
                    *slot = (value >> (8 * (nbytes - 1 - i))) as u8;
                }
            }
        }
    }
}

impl Default for Module {
    fn default() -> Self {
        Module::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::SectionFlags;

    fn scratch_section(module: &mut Module) -> SectionId {
        module.get_or_create_output(
            ".text",
            SectionKind::Regular,
            crate::elf::SHT_PROGBITS,
            SectionFlags::ALLOC | SectionFlags::EXECINSTR,
            4,
        )
    }

    #[test]
    fn test_append_pads_to_alignment() {
        let mut module = Module::new();
        let sec = scratch_section(&mut module);
        module.append_fragment(sec, FragmentKind::Region { bytes: vec![1, 2, 3] }, 1);
        let frag = module.append_fragment(sec, FragmentKind::Region { bytes: vec![4] }, 4);
        assert_eq!(module.fragment(frag).offset, 4);
        assert_eq!(module.section(sec).size, 5);
    }

    #[test]
    fn test_insert_after_cascades_offsets() {
        let mut module = Module::new();
        let sec = scratch_section(&mut module);
        let a = module.append_fragment(sec, FragmentKind::Region { bytes: vec![0; 8] }, 4);
        let b = module.append_fragment(sec, FragmentKind::Region { bytes: vec![0; 8] }, 4);
        module.insert_fragment_after(a, FragmentKind::Stub { bytes: vec![0; 12] });
        assert_eq!(module.fragment(b).offset, 20);
        assert_eq!(module.section(sec).size, 28);
    }

    #[test]
    fn test_word_round_trip_little_endian() {
        let mut module = Module::new();
        let sec = scratch_section(&mut module);
        let frag = module.append_fragment(sec, FragmentKind::Region { bytes: vec![0; 8] }, 1);
        let fref = FragmentRef::new(frag, 0);
        module.write_word(fref, 4, Endianness::Little, 0x1234_5678);
        assert_eq!(module.read_word(fref, 4, Endianness::Little), 0x1234_5678);
    }

    #[test]
    fn test_word_round_trip_big_endian() {
        let mut module = Module::new();
        let sec = scratch_section(&mut module);
        let frag = module.append_fragment(sec, FragmentKind::Region { bytes: vec![0; 8] }, 1);
        let fref = FragmentRef::new(frag, 0);
        module.write_word(fref, 4, Endianness::Big, 0xdead_beef);
        // target byte order in the fragment must be big-endian
        if let FragmentKind::Region { bytes } = &module.fragment(frag).kind {
            assert_eq!(&bytes[..4], &[0xde, 0xad, 0xbe, 0xef]);
        } else {
            unreachable!();
        }
        assert_eq!(module.read_word(fref, 4, Endianness::Big), 0xdead_beef);
    }
}
