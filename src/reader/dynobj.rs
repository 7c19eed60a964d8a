//! Shared-object reader: dynamic symbol table, soname, and the library's own
//! DT_NEEDED list.

use crate::elf::*;
use crate::error::LinkError;

#[derive(Debug)]
pub struct DynSymbol {
    pub name: String,
    pub value: u32,
    pub size: u32,
    pub binding: u8,
    pub sym_type: u8,
    pub visibility: u8,
    pub defined: bool,
}

#[derive(Debug)]
pub struct DynObjInfo {
    pub soname: Option<String>,
    pub needed: Vec<String>,
    pub symbols: Vec<DynSymbol>,
}

/// Parse the dynamic linking surface of an ELF32 shared object.
pub fn read_dynobj(bytes: &[u8], path: &str) -> Result<DynObjInfo, LinkError> {
    let bad = |reason: &str| LinkError::invalid(path, reason);

    if bytes.len() < EHDR32_SIZE as usize || bytes[0..4] != ELF_MAGIC {
        return Err(bad("not an ELF file"));
    }
    if bytes[4] != ELFCLASS32 || bytes[5] != ELFDATA2LSB {
        return Err(bad("not a little-endian ELF32 file"));
    }
    if read_u16(bytes, 16) != ET_DYN {
        return Err(bad("not a shared object"));
    }

    let e_shoff = read_u32(bytes, 32) as usize;
    let e_shentsize = read_u16(bytes, 46) as usize;
    let e_shnum = read_u16(bytes, 48) as usize;
    if e_shnum == 0 || e_shoff + e_shnum * e_shentsize > bytes.len() {
        return Err(bad("missing section headers"));
    }

    let shdr = |i: usize| -> (u32, usize, usize, u32) {
        let off = e_shoff + i * e_shentsize;
        (
            read_u32(bytes, off + 4),           // type
            read_u32(bytes, off + 16) as usize, // offset
            read_u32(bytes, off + 20) as usize, // size
            read_u32(bytes, off + 24),          // link
        )
    };

    let mut dynsym: Option<(usize, usize, u32)> = None;
    let mut dynamic: Option<(usize, usize, u32)> = None;
    for i in 0..e_shnum {
        let (sh_type, offset, size, link) = shdr(i);
        if offset + size > bytes.len() && sh_type != SHT_NOBITS {
            return Err(bad("section out of range"));
        }
        match sh_type {
            SHT_DYNSYM => dynsym = Some((offset, size, link)),
            SHT_DYNAMIC => dynamic = Some((offset, size, link)),
            _ => {}
        }
    }
    let (sym_off, sym_size, sym_link) = dynsym.ok_or_else(|| bad("no dynamic symbol table"))?;
    let (_, str_off, str_size, _) = shdr(sym_link as usize);
    let strtab = &bytes[str_off..str_off + str_size];

    let mut symbols = Vec::new();
    let count = sym_size / SYM32_SIZE as usize;
    for i in 1..count {
        let off = sym_off + i * SYM32_SIZE as usize;
        let name = read_cstr(strtab, read_u32(bytes, off) as usize);
        if name.is_empty() {
            continue;
        }
        let info = bytes[off + 12];
        let shndx = read_u16(bytes, off + 14);
        symbols.push(DynSymbol {
            name: name.to_string(),
            value: read_u32(bytes, off + 4),
            size: read_u32(bytes, off + 8),
            binding: info >> 4,
            sym_type: info & 0xf,
            visibility: bytes[off + 13] & 0x3,
            defined: shndx != SHN_UNDEF,
        });
    }

    // Walk .dynamic for DT_SONAME and DT_NEEDED; both index the same string
    // table as .dynsym.
    let mut soname = None;
    let mut needed = Vec::new();
    if let Some((dyn_off, dyn_size, dyn_link)) = dynamic {
        let (_, dstr_off, dstr_size, _) = shdr(dyn_link as usize);
        let dstr = if dstr_off + dstr_size <= bytes.len() {
            &bytes[dstr_off..dstr_off + dstr_size]
        } else {
            strtab
        };
        let count = dyn_size / DYN32_SIZE as usize;
        for i in 0..count {
            let off = dyn_off + i * DYN32_SIZE as usize;
            let tag = read_i32(bytes, off);
            let val = read_u32(bytes, off + 4) as usize;
            match tag {
                DT_NULL => break,
                DT_SONAME => soname = Some(read_cstr(dstr, val).to_string()),
                DT_NEEDED => needed.push(read_cstr(dstr, val).to_string()),
                _ => {}
            }
        }
    }

    Ok(DynObjInfo {
        soname,
        needed,
        symbols,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Serialise a minimal ELF32 shared object: null section, .dynsym,
    /// .dynstr, .dynamic, .shstrtab.
    pub(crate) fn build_dynobj(
        soname: Option<&str>,
        needed: &[&str],
        symbols: &[(&str, u8, u8, bool)], // name, binding, type, defined
    ) -> Vec<u8> {
        let mut dynstr: Vec<u8> = vec![0];
        let mut intern = |pool: &mut Vec<u8>, s: &str| -> u32 {
            let off = pool.len() as u32;
            pool.extend_from_slice(s.as_bytes());
            pool.push(0);
            off
        };

        let needed_offs: Vec<u32> = needed.iter().map(|n| intern(&mut dynstr, n)).collect();
        let soname_off = soname.map(|s| intern(&mut dynstr, s));

        let mut dynsym: Vec<u8> = vec![0u8; 16];
        for (name, binding, sym_type, defined) in symbols {
            let name_off = intern(&mut dynstr, name);
            let mut e = [0u8; 16];
            write_u32(&mut e, 0, name_off);
            write_u32(&mut e, 4, 0x1000);
            write_u32(&mut e, 8, 4);
            e[12] = (binding << 4) | sym_type;
            write_u16(&mut e, 14, if *defined { 1 } else { SHN_UNDEF });
            dynsym.extend_from_slice(&e);
        }

        let mut dynamic: Vec<u8> = Vec::new();
        let mut push_dyn = |tag: i32, val: u32| {
            dynamic.extend_from_slice(&tag.to_le_bytes());
            dynamic.extend_from_slice(&val.to_le_bytes());
        };
        for off in &needed_offs {
            push_dyn(DT_NEEDED, *off);
        }
        if let Some(off) = soname_off {
            push_dyn(DT_SONAME, off);
        }
        push_dyn(DT_NULL, 0);

        let shstrtab = b"\0.dynsym\0.dynstr\0.dynamic\0.shstrtab\0".to_vec();

        // File layout: ehdr, 5 shdrs, dynsym, dynstr, dynamic, shstrtab.
        let shoff = EHDR32_SIZE as usize;
        let data_start = shoff + 5 * SHDR32_SIZE as usize;
        let dynsym_off = data_start;
        let dynstr_off = dynsym_off + dynsym.len();
        let dynamic_off = dynstr_off + dynstr.len();
        let shstrtab_off = dynamic_off + dynamic.len();

        let mut out = vec![0u8; shstrtab_off + shstrtab.len()];
        out[0..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELFCLASS32;
        out[5] = ELFDATA2LSB;
        out[6] = EV_CURRENT;
        write_u16(&mut out, 16, ET_DYN);
        write_u16(&mut out, 18, EM_ARM);
        write_u32(&mut out, 32, shoff as u32);
        write_u16(&mut out, 46, SHDR32_SIZE as u16);
        write_u16(&mut out, 48, 5);
        write_u16(&mut out, 50, 4);

        let mut write_shdr = |i: usize, name: u32, sh_type: u32, off: usize, size: usize, link: u32, entsize: u32| {
            let base = shoff + i * SHDR32_SIZE as usize;
            write_u32(&mut out, base, name);
            write_u32(&mut out, base + 4, sh_type);
            write_u32(&mut out, base + 16, off as u32);
            write_u32(&mut out, base + 20, size as u32);
            write_u32(&mut out, base + 24, link);
            write_u32(&mut out, base + 36, entsize);
        };
        write_shdr(1, 1, SHT_DYNSYM, dynsym_off, dynsym.len(), 2, SYM32_SIZE);
        write_shdr(2, 9, SHT_STRTAB, dynstr_off, dynstr.len(), 0, 0);
        write_shdr(3, 17, SHT_DYNAMIC, dynamic_off, dynamic.len(), 2, DYN32_SIZE);
        write_shdr(4, 26, SHT_STRTAB, shstrtab_off, shstrtab.len(), 0, 0);

        out[dynsym_off..dynsym_off + dynsym.len()].copy_from_slice(&dynsym);
        out[dynstr_off..dynstr_off + dynstr.len()].copy_from_slice(&dynstr);
        out[dynamic_off..dynamic_off + dynamic.len()].copy_from_slice(&dynamic);
        out[shstrtab_off..shstrtab_off + shstrtab.len()].copy_from_slice(&shstrtab);
        out
    }

    #[test]
    fn test_read_symbols_and_soname() {
        let bytes = build_dynobj(
            Some("libm.so.6"),
            &["libc.so.6"],
            &[
                ("sin", STB_GLOBAL, STT_FUNC, true),
                ("cos", STB_WEAK, STT_FUNC, true),
                ("free", STB_GLOBAL, STT_FUNC, false),
            ],
        );
        let info = read_dynobj(&bytes, "libm.so").unwrap();
        assert_eq!(info.soname.as_deref(), Some("libm.so.6"));
        assert_eq!(info.needed, vec!["libc.so.6".to_string()]);
        assert_eq!(info.symbols.len(), 3);
        assert_eq!(info.symbols[0].name, "sin");
        assert!(info.symbols[0].defined);
        assert_eq!(info.symbols[1].binding, STB_WEAK);
        assert!(!info.symbols[2].defined);
    }

    #[test]
    fn test_reject_non_dynobj() {
        let mut bytes = build_dynobj(None, &[], &[]);
        write_u16(&mut bytes, 16, ET_REL);
        assert!(read_dynobj(&bytes, "x.so").is_err());
    }
}
