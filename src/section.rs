//! Section headers, bodies, and the input-to-output name mapping.

use bitflags::bitflags;

use crate::elf::{self, SHT_FINI_ARRAY, SHT_INIT_ARRAY, SHT_NOBITS, SHT_NOTE, SHT_PREINIT_ARRAY};
use crate::module::FragmentId;
use crate::relocate::Relocation;

/// Semantic kind of a section, orthogonal to its format-specific type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Null,
    Regular,
    Bss,
    NamePool,
    Relocation,
    Target,
    Debug,
    GccExceptTable,
    Version,
    Note,
    MetaData,
    Group,
    StackNote,
    SymbolTable,
    StringTable,
    Got,
    Plt,
    Data,
    ReadOnly,
}

bitflags! {
    /// ELF section flags, kept as a typed word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const WRITE = elf::SHF_WRITE;
        const ALLOC = elf::SHF_ALLOC;
        const EXECINSTR = elf::SHF_EXECINSTR;
        const MERGE = elf::SHF_MERGE;
        const STRINGS = elf::SHF_STRINGS;
        const LINK_ORDER = elf::SHF_LINK_ORDER;
        const GROUP = elf::SHF_GROUP;
        const TLS = elf::SHF_TLS;
    }
}

/// The body of a section: placed content, relocation records, or bytes the
/// writer serialises verbatim.
#[derive(Debug)]
pub enum SectionData {
    /// Ordered fragment list (output sections, merged input content).
    Fragments(Vec<FragmentId>),
    /// Relocation records read from an input relocation section.
    Relocs(Vec<Relocation>),
    /// Opaque bytes (`.interp`, name pools built late).
    Raw(Vec<u8>),
    None,
}

/// One section header plus its body.
#[derive(Debug)]
pub struct Section {
    pub name: String,
    pub kind: SectionKind,
    pub sh_type: u32,
    pub flags: SectionFlags,
    pub align: u32,
    /// `sh_link` / `sh_info` as the input declared them; for input relocation
    /// sections `info` is the target section's index within the same input.
    pub link: u32,
    pub info: u32,
    pub entsize: u32,
    pub data: SectionData,
    /// Total byte size; maintained by fragment append, final after layout.
    pub size: u64,
    /// Virtual address, assigned by the layout engine.
    pub addr: u64,
    /// File offset, assigned by the layout engine.
    pub offset: u64,
}

impl Section {
    pub fn new(
        name: &str,
        kind: SectionKind,
        sh_type: u32,
        flags: SectionFlags,
        align: u32,
    ) -> Section {
        Section {
            name: name.to_string(),
            kind,
            sh_type,
            flags,
            align: align.max(1),
            link: 0,
            info: 0,
            entsize: 0,
            data: SectionData::None,
            size: 0,
            addr: 0,
            offset: 0,
        }
    }

    pub fn is_alloc(&self) -> bool {
        self.flags.contains(SectionFlags::ALLOC)
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(SectionFlags::WRITE)
    }

    pub fn is_exec(&self) -> bool {
        self.flags.contains(SectionFlags::EXECINSTR)
    }

    /// Whether this section occupies bytes in the output file.
    pub fn has_file_content(&self) -> bool {
        self.sh_type != SHT_NOBITS && !matches!(self.data, SectionData::None)
    }

    pub fn fragment_list(&self) -> &[FragmentId] {
        match &self.data {
            SectionData::Fragments(list) => list,
            _ => &[],
        }
    }
}

/// Classify an input section header into a semantic kind.
pub fn section_kind(name: &str, sh_type: u32, flags: u32) -> SectionKind {
    match sh_type {
        elf::SHT_NULL => return SectionKind::Null,
        elf::SHT_REL | elf::SHT_RELA => return SectionKind::Relocation,
        elf::SHT_SYMTAB | elf::SHT_DYNSYM => return SectionKind::SymbolTable,
        elf::SHT_STRTAB => return SectionKind::StringTable,
        elf::SHT_GROUP => return SectionKind::Group,
        elf::SHT_NOTE => return SectionKind::Note,
        elf::SHT_ARM_EXIDX | elf::SHT_ARM_ATTRIBUTES => return SectionKind::Target,
        _ => {}
    }
    if name == ".note.GNU-stack" {
        return SectionKind::StackNote;
    }
    if name == ".comment" {
        return SectionKind::MetaData;
    }
    if name.starts_with(".debug") || name.starts_with(".line") || name.starts_with(".stab") {
        return SectionKind::Debug;
    }
    if name.starts_with(".gcc_except_table") {
        return SectionKind::GccExceptTable;
    }
    if name.starts_with(".gnu.version") {
        return SectionKind::Version;
    }
    if name.starts_with(".ARM.") {
        return SectionKind::Target;
    }
    if sh_type == SHT_NOBITS {
        return SectionKind::Bss;
    }
    if flags & elf::SHF_ALLOC != 0 {
        if flags & elf::SHF_EXECINSTR != 0 {
            return SectionKind::Regular;
        }
        if flags & elf::SHF_WRITE != 0 {
            return SectionKind::Data;
        }
        return SectionKind::ReadOnly;
    }
    SectionKind::MetaData
}

/// Map an input section to the name of the output section that absorbs it.
/// `None` drops the input section from the image.
pub fn output_section_name(name: &str, sh_type: u32, flags: u32) -> Option<&str> {
    match section_kind(name, sh_type, flags) {
        SectionKind::Null
        | SectionKind::Relocation
        | SectionKind::SymbolTable
        | SectionKind::StringTable
        | SectionKind::Group
        | SectionKind::StackNote
        | SectionKind::MetaData
        | SectionKind::Version
        | SectionKind::Debug => return None,
        SectionKind::Target => return Some(target_section_name(name)),
        _ => {}
    }
    if name.starts_with(".text") {
        return Some(".text");
    }
    if name == ".init" || name == ".fini" {
        return Some(name);
    }
    if name.starts_with(".rodata") {
        return Some(".rodata");
    }
    if name == ".eh_frame" || name.starts_with(".gcc_except_table") {
        return Some(".eh_frame");
    }
    if name == ".ctors" || name.starts_with(".ctors.") {
        return Some(".ctors");
    }
    if name == ".dtors" || name.starts_with(".dtors.") {
        return Some(".dtors");
    }
    if name == ".preinit_array" || sh_type == SHT_PREINIT_ARRAY {
        return Some(".preinit_array");
    }
    if name.starts_with(".init_array") || sh_type == SHT_INIT_ARRAY {
        return Some(".init_array");
    }
    if name.starts_with(".fini_array") || sh_type == SHT_FINI_ARRAY {
        return Some(".fini_array");
    }
    if name.starts_with(".data") {
        return Some(".data");
    }
    if name.starts_with(".bss") || sh_type == SHT_NOBITS {
        return Some(".bss");
    }
    if sh_type == SHT_NOTE {
        return Some(".note");
    }
    if flags & elf::SHF_ALLOC != 0 {
        if flags & elf::SHF_EXECINSTR != 0 {
            return Some(".text");
        }
        if flags & elf::SHF_WRITE != 0 {
            return Some(".data");
        }
        return Some(".rodata");
    }
    None
}

fn target_section_name(name: &str) -> &'static str {
    if name.starts_with(".ARM.exidx") {
        ".ARM.exidx"
    } else if name.starts_with(".ARM.extab") {
        ".ARM.extab"
    } else {
        ".ARM.attributes"
    }
}
