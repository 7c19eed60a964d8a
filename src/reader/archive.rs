//! `ar` archive reader: member table, extended names, and the SysV symbol
//! index the group reader drives member extraction with.

use std::collections::{HashMap, HashSet};

use crate::elf::read_cstr;
use crate::error::LinkError;

const HEADER_LEN: usize = 60;
const GLOBAL_MAGIC: &[u8] = b"!<arch>\n";

#[derive(Debug)]
pub struct ArchiveMember {
    pub name: String,
    /// Offset of the member header within the archive.
    pub header_offset: usize,
    /// Offset of the member's payload.
    pub data_offset: usize,
    pub size: usize,
}

/// A parsed archive plus extraction state.
pub struct Archive {
    pub path: String,
    pub members: Vec<ArchiveMember>,
    /// Symbol name → member header offset, from the index member.
    symbol_map: HashMap<String, usize>,
    by_header_offset: HashMap<usize, usize>,
    extracted: HashSet<usize>,
}

impl Archive {
    pub fn parse(bytes: &[u8], path: &str) -> Result<Archive, LinkError> {
        if bytes.len() < GLOBAL_MAGIC.len() || &bytes[..GLOBAL_MAGIC.len()] != GLOBAL_MAGIC {
            return Err(LinkError::invalid(path, "not an archive"));
        }

        let mut members = Vec::new();
        let mut symbol_map = HashMap::new();
        let mut extended_names: &[u8] = &[];
        let mut pos = GLOBAL_MAGIC.len();

        while pos + HEADER_LEN <= bytes.len() {
            let header = &bytes[pos..pos + HEADER_LEN];
            if &header[58..60] != b"`\n" {
                return Err(LinkError::invalid(path, "bad member header"));
            }
            let size = parse_decimal(&header[48..58])
                .ok_or_else(|| LinkError::invalid(path, "bad member size"))?;
            let data_offset = pos + HEADER_LEN;
            if data_offset + size > bytes.len() {
                return Err(LinkError::invalid(path, "member exceeds archive"));
            }
            let raw_name = trim_ascii(&header[0..16]);

            if raw_name == b"/" {
                symbol_map = parse_symbol_index(&bytes[data_offset..data_offset + size]);
            } else if raw_name == b"//" {
                extended_names = &bytes[data_offset..data_offset + size];
            } else {
                let name = member_name(raw_name, extended_names);
                members.push(ArchiveMember {
                    name,
                    header_offset: pos,
                    data_offset,
                    size,
                });
            }

            pos = data_offset + size;
            if pos % 2 == 1 {
                pos += 1;
            }
        }

        let by_header_offset = members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.header_offset, i))
            .collect();
        Ok(Archive {
            path: path.to_string(),
            members,
            symbol_map,
            by_header_offset,
            extracted: HashSet::new(),
        })
    }

    /// Which member defines `symbol`, per the archive's index.
    pub fn member_defining(&self, symbol: &str) -> Option<usize> {
        let header = self.symbol_map.get(symbol)?;
        self.by_header_offset.get(header).copied()
    }

    /// Mark a member as pulled into the link; returns false when it already
    /// was, so callers never ingest a member twice.
    pub fn extract(&mut self, member: usize) -> bool {
        self.extracted.insert(member)
    }

    pub fn is_extracted(&self, member: usize) -> bool {
        self.extracted.contains(&member)
    }

    pub fn member_bytes<'a>(&self, bytes: &'a [u8], member: usize) -> &'a [u8] {
        let m = &self.members[member];
        &bytes[m.data_offset..m.data_offset + m.size]
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

fn parse_decimal(bytes: &[u8]) -> Option<usize> {
    let s = std::str::from_utf8(trim_ascii(bytes)).ok()?;
    s.parse().ok()
}

fn member_name(raw: &[u8], extended: &[u8]) -> String {
    if raw.first() == Some(&b'/') {
        // "/123": offset into the extended-name table; entries end with "/\n".
        if let Ok(off) = std::str::from_utf8(&raw[1..]).unwrap_or("").parse::<usize>() {
            let name = read_cstr(extended, off);
            let name = name.split('\n').next().unwrap_or(name);
            return name.trim_end_matches('/').to_string();
        }
    }
    let name = String::from_utf8_lossy(raw).to_string();
    name.trim_end_matches('/').to_string()
}

/// SysV index: big-endian count, that many big-endian member offsets, then
/// NUL-terminated names in the same order.
fn parse_symbol_index(data: &[u8]) -> HashMap<String, usize> {
    let mut map = HashMap::new();
    if data.len() < 4 {
        return map;
    }
    let count = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let mut name_pos = 4 + count * 4;
    for i in 0..count {
        let off = 4 + i * 4;
        if off + 4 > data.len() || name_pos >= data.len() {
            break;
        }
        let member = u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        let name = read_cstr(data, name_pos);
        name_pos += name.len() + 1;
        map.entry(name.to_string()).or_insert(member as usize);
    }
    map
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a SysV archive from (member name, payload) pairs, with a symbol
    /// index mapping each listed symbol to its member.
    pub(crate) fn build_archive(members: &[(&str, &[u8], &[&str])]) -> Vec<u8> {
        let mut long_names: Vec<u8> = Vec::new();
        let mut stored_names: Vec<String> = Vec::new();
        for (name, _, _) in members {
            let with_slash = format!("{}/", name);
            if with_slash.len() > 16 {
                let off = long_names.len();
                long_names.extend_from_slice(with_slash.as_bytes());
                long_names.push(b'\n');
                stored_names.push(format!("/{}", off));
            } else {
                stored_names.push(with_slash);
            }
        }

        let header = |name: &str, size: usize| -> Vec<u8> {
            let mut h = vec![b' '; HEADER_LEN];
            h[..name.len()].copy_from_slice(name.as_bytes());
            let sz = size.to_string();
            h[48..48 + sz.len()].copy_from_slice(sz.as_bytes());
            h[58] = b'`';
            h[59] = b'\n';
            h
        };

        // Lay out member offsets: magic, symbol index, extended names, members.
        let mut index_names: Vec<u8> = Vec::new();
        let mut sym_count = 0usize;
        for (_, _, syms) in members {
            for s in *syms {
                index_names.extend_from_slice(s.as_bytes());
                index_names.push(0);
                sym_count += 1;
            }
        }
        let index_size = 4 + sym_count * 4 + index_names.len();
        let mut pos = GLOBAL_MAGIC.len() + HEADER_LEN + index_size;
        if pos % 2 == 1 {
            pos += 1;
        }
        if !long_names.is_empty() {
            pos += HEADER_LEN + long_names.len();
            if pos % 2 == 1 {
                pos += 1;
            }
        }
        let mut member_offsets = Vec::new();
        for (_, data, _) in members {
            member_offsets.push(pos);
            pos += HEADER_LEN + data.len();
            if pos % 2 == 1 {
                pos += 1;
            }
        }

        let mut index: Vec<u8> = Vec::new();
        index.extend_from_slice(&(sym_count as u32).to_be_bytes());
        for (i, (_, _, syms)) in members.iter().enumerate() {
            for _ in *syms {
                index.extend_from_slice(&(member_offsets[i] as u32).to_be_bytes());
            }
        }
        index.extend_from_slice(&index_names);

        let mut out: Vec<u8> = Vec::new();
        out.extend_from_slice(GLOBAL_MAGIC);
        out.extend_from_slice(&header("/", index.len()));
        out.extend_from_slice(&index);
        if out.len() % 2 == 1 {
            out.push(b'\n');
        }
        if !long_names.is_empty() {
            out.extend_from_slice(&header("//", long_names.len()));
            out.extend_from_slice(&long_names);
            if out.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        for ((_, data, _), off) in members.iter().zip(&member_offsets) {
            assert_eq!(out.len(), *off);
            out.extend_from_slice(&header(&stored_names.remove(0), data.len()));
            out.extend_from_slice(data);
            if out.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn test_parse_members_and_index() {
        let bytes = build_archive(&[
            ("first.o", b"AAAA", &["alpha", "beta"]),
            ("second.o", b"BBBBBB", &["gamma"]),
        ]);
        let ar = Archive::parse(&bytes, "lib.a").unwrap();
        assert_eq!(ar.members.len(), 2);
        assert_eq!(ar.members[0].name, "first.o");
        assert_eq!(ar.members[1].name, "second.o");
        assert_eq!(ar.member_bytes(&bytes, 0), b"AAAA");
        assert_eq!(ar.member_bytes(&bytes, 1), b"BBBBBB");

        assert_eq!(ar.member_defining("alpha"), Some(0));
        assert_eq!(ar.member_defining("beta"), Some(0));
        assert_eq!(ar.member_defining("gamma"), Some(1));
        assert_eq!(ar.member_defining("delta"), None);
    }

    #[test]
    fn test_long_member_names() {
        let bytes = build_archive(&[("a_member_with_a_rather_long_name.o", b"XY", &["sym"])]);
        let ar = Archive::parse(&bytes, "lib.a").unwrap();
        assert_eq!(ar.members[0].name, "a_member_with_a_rather_long_name.o");
        assert_eq!(ar.member_defining("sym"), Some(0));
    }

    #[test]
    fn test_extract_once() {
        let bytes = build_archive(&[("m.o", b"ZZ", &["z"])]);
        let mut ar = Archive::parse(&bytes, "lib.a").unwrap();
        assert!(ar.extract(0));
        assert!(!ar.extract(0));
        assert!(ar.is_extracted(0));
    }

    #[test]
    fn test_reject_garbage() {
        assert!(Archive::parse(b"not an archive at all", "x.a").is_err());
        let mut bad = GLOBAL_MAGIC.to_vec();
        bad.extend_from_slice(&[0u8; HEADER_LEN]);
        assert!(Archive::parse(&bad, "x.a").is_err());
    }
}
