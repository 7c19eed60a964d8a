//! Test-only builder for synthetic ELF32 relocatable objects.
//!
//! Produces byte-exact little-endian ARM objects the real readers parse, so
//! scenario tests can drive the whole pipeline without fixture files.

use crate::elf::*;

#[derive(Clone, Copy)]
pub enum Place {
    Undef,
    Abs,
    Common,
    Section(usize),
}

struct TestSection {
    name: String,
    sh_type: u32,
    flags: u32,
    align: u32,
    data: Vec<u8>,
    relocs: Vec<(u32, u32, String, i32)>,
}

struct TestSymbol {
    name: String,
    binding: u8,
    sym_type: u8,
    place: Place,
    value: u32,
    size: u32,
}

/// Builder for one relocatable object.
pub struct TestObject {
    sections: Vec<TestSection>,
    symbols: Vec<TestSymbol>,
}

impl TestObject {
    pub fn new() -> TestObject {
        TestObject {
            sections: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// Add a section; returns its builder index for `Place::Section`.
    pub fn section(
        &mut self,
        name: &str,
        sh_type: u32,
        flags: u32,
        align: u32,
        data: Vec<u8>,
    ) -> usize {
        self.sections.push(TestSection {
            name: name.to_string(),
            sh_type,
            flags,
            align,
            data,
            relocs: Vec::new(),
        });
        self.sections.len() - 1
    }

    pub fn text(&mut self, data: Vec<u8>) -> usize {
        self.section(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, 4, data)
    }

    pub fn data(&mut self, data: Vec<u8>) -> usize {
        self.section(".data", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, 4, data)
    }

    pub fn bss(&mut self, size: u32) -> usize {
        self.section(
            ".bss",
            SHT_NOBITS,
            SHF_ALLOC | SHF_WRITE,
            4,
            vec![0u8; size as usize],
        )
    }

    pub fn symbol(
        &mut self,
        name: &str,
        binding: u8,
        sym_type: u8,
        place: Place,
        value: u32,
        size: u32,
    ) -> &mut Self {
        self.symbols.push(TestSymbol {
            name: name.to_string(),
            binding,
            sym_type,
            place,
            value,
            size,
        });
        self
    }

    pub fn global_func(&mut self, name: &str, section: usize, value: u32) -> &mut Self {
        self.symbol(name, STB_GLOBAL, STT_FUNC, Place::Section(section), value, 4)
    }

    pub fn global_object(&mut self, name: &str, section: usize, value: u32, size: u32) -> &mut Self {
        self.symbol(name, STB_GLOBAL, STT_OBJECT, Place::Section(section), value, size)
    }

    pub fn undef(&mut self, name: &str) -> &mut Self {
        self.symbol(name, STB_GLOBAL, STT_NOTYPE, Place::Undef, 0, 0)
    }

    pub fn undef_func(&mut self, name: &str) -> &mut Self {
        self.symbol(name, STB_GLOBAL, STT_FUNC, Place::Undef, 0, 0)
    }

    pub fn reloc(&mut self, section: usize, offset: u32, rtype: u32, sym: &str, addend: i32) -> &mut Self {
        self.sections[section]
            .relocs
            .push((offset, rtype, sym.to_string(), addend));
        self
    }

    /// Serialise: null shdr, content sections, one `.rel.*` per relocated
    /// section, `.symtab`, `.strtab`, `.shstrtab`.
    pub fn build(&self) -> Vec<u8> {
        let ncontent = self.sections.len();
        let rel_sections: Vec<usize> = (0..ncontent)
            .filter(|&i| !self.sections[i].relocs.is_empty())
            .collect();
        let symtab_idx = 1 + ncontent + rel_sections.len();
        let strtab_idx = symtab_idx + 1;
        let shstrtab_idx = strtab_idx + 1;
        let shnum = shstrtab_idx + 1;

        // Symbol table: null, locals, then globals/weaks.
        let mut order: Vec<usize> = (0..self.symbols.len()).collect();
        order.sort_by_key(|&i| (self.symbols[i].binding != STB_LOCAL) as u8);
        let first_global = 1 + order
            .iter()
            .filter(|&&i| self.symbols[i].binding == STB_LOCAL)
            .count();
        let sym_index_of = |name: &str| -> u32 {
            for (pos, &i) in order.iter().enumerate() {
                if self.symbols[i].name == name {
                    return (pos + 1) as u32;
                }
            }
            0
        };

        let mut strtab: Vec<u8> = vec![0];
        let mut symtab: Vec<u8> = vec![0u8; 16];
        for &i in &order {
            let sym = &self.symbols[i];
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
            let shndx = match sym.place {
                Place::Undef => SHN_UNDEF,
                Place::Abs => SHN_ABS,
                Place::Common => SHN_COMMON,
                Place::Section(s) => (s + 1) as u16,
            };
            let mut e = [0u8; 16];
            write_u32(&mut e, 0, name_off);
            write_u32(&mut e, 4, sym.value);
            write_u32(&mut e, 8, sym.size);
            e[12] = (sym.binding << 4) | sym.sym_type;
            write_u16(&mut e, 14, shndx);
            symtab.extend_from_slice(&e);
        }

        let mut rel_bodies: Vec<Vec<u8>> = Vec::new();
        for &si in &rel_sections {
            let mut body = Vec::new();
            for (offset, rtype, sym, _addend) in &self.sections[si].relocs {
                let mut e = [0u8; 8];
                write_u32(&mut e, 0, *offset);
                write_u32(&mut e, 4, r_info32(sym_index_of(sym), *rtype));
                body.extend_from_slice(&e);
            }
            rel_bodies.push(body);
        }

        let mut shstrtab: Vec<u8> = vec![0];
        let mut shname = |s: &str| -> u32 {
            let off = shstrtab.len() as u32;
            shstrtab.extend_from_slice(s.as_bytes());
            shstrtab.push(0);
            off
        };
        let content_names: Vec<u32> = self.sections.iter().map(|s| shname(&s.name)).collect();
        let rel_names: Vec<u32> = rel_sections
            .iter()
            .map(|&i| shname(&format!(".rel{}", self.sections[i].name)))
            .collect();
        let symtab_name = shname(".symtab");
        let strtab_name = shname(".strtab");
        let shstrtab_name = shname(".shstrtab");

        // Place bodies after the ELF header, section header table at the end.
        let mut offset = EHDR32_SIZE as usize;
        let mut body_offsets: Vec<usize> = Vec::new();
        let mut bodies: Vec<&[u8]> = Vec::new();
        let mut place = |data: &[u8], offset: &mut usize, body_offsets: &mut Vec<usize>| {
            *offset = (*offset + 3) & !3;
            body_offsets.push(*offset);
            *offset += data.len();
        };
        for sec in &self.sections {
            if sec.sh_type == SHT_NOBITS {
                body_offsets.push(offset);
                bodies.push(&[]);
            } else {
                place(&sec.data, &mut offset, &mut body_offsets);
                bodies.push(&sec.data);
            }
        }
        for body in &rel_bodies {
            place(body, &mut offset, &mut body_offsets);
            bodies.push(body);
        }
        place(&symtab, &mut offset, &mut body_offsets);
        bodies.push(&symtab);
        place(&strtab, &mut offset, &mut body_offsets);
        bodies.push(&strtab);
        place(&shstrtab, &mut offset, &mut body_offsets);
        bodies.push(&shstrtab);

        let e_shoff = (offset + 3) & !3;
        let total = e_shoff + shnum * SHDR32_SIZE as usize;
        let mut out = vec![0u8; total];

        out[0..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELFCLASS32;
        out[5] = ELFDATA2LSB;
        out[6] = EV_CURRENT;
        write_u16(&mut out, 16, ET_REL);
        write_u16(&mut out, 18, EM_ARM);
        write_u32(&mut out, 32, e_shoff as u32);
        write_u16(&mut out, 46, SHDR32_SIZE as u16);
        write_u16(&mut out, 48, shnum as u16);
        write_u16(&mut out, 50, shstrtab_idx as u16);

        for (i, body) in bodies.iter().enumerate() {
            let off = body_offsets[i];
            out[off..off + body.len()].copy_from_slice(body);
        }

        let mut write_shdr =
            |idx: usize, name: u32, sh_type: u32, flags: u32, off: usize, size: usize, link: u32, info: u32, align: u32, entsize: u32| {
                let base = e_shoff + idx * SHDR32_SIZE as usize;
                write_u32(&mut out, base, name);
                write_u32(&mut out, base + 4, sh_type);
                write_u32(&mut out, base + 8, flags);
                write_u32(&mut out, base + 16, off as u32);
                write_u32(&mut out, base + 20, size as u32);
                write_u32(&mut out, base + 24, link);
                write_u32(&mut out, base + 28, info);
                write_u32(&mut out, base + 32, align);
                write_u32(&mut out, base + 36, entsize);
            };

        for (i, sec) in self.sections.iter().enumerate() {
            write_shdr(
                1 + i,
                content_names[i],
                sec.sh_type,
                sec.flags,
                body_offsets[i],
                sec.data.len(),
                0,
                0,
                sec.align,
                0,
            );
        }
        for (r, &si) in rel_sections.iter().enumerate() {
            write_shdr(
                1 + ncontent + r,
                rel_names[r],
                SHT_REL,
                0,
                body_offsets[ncontent + r],
                rel_bodies[r].len(),
                symtab_idx as u32,
                (si + 1) as u32,
                4,
                REL32_SIZE,
            );
        }
        write_shdr(
            symtab_idx,
            symtab_name,
            SHT_SYMTAB,
            0,
            body_offsets[ncontent + rel_sections.len()],
            symtab.len(),
            strtab_idx as u32,
            first_global as u32,
            4,
            SYM32_SIZE,
        );
        write_shdr(
            strtab_idx,
            strtab_name,
            SHT_STRTAB,
            0,
            body_offsets[ncontent + rel_sections.len() + 1],
            strtab.len(),
            0,
            0,
            1,
            0,
        );
        write_shdr(
            shstrtab_idx,
            shstrtab_name,
            SHT_STRTAB,
            0,
            body_offsets[ncontent + rel_sections.len() + 2],
            shstrtab.len(),
            0,
            0,
            1,
            0,
        );

        out
    }
}

impl Default for TestObject {
    fn default() -> Self {
        TestObject::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::probe_type;

    #[test]
    fn test_built_object_probes_as_object() {
        let mut obj = TestObject::new();
        let text = obj.text(vec![0; 8]);
        obj.global_func("main", text, 0);
        let bytes = obj.build();
        assert_eq!(probe_type(&bytes), crate::input::InputType::Object);
    }
}
