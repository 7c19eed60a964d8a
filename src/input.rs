//! Inputs and the ordered input tree.
//!
//! The front-end appends leaves (files, `-l` namespecs) and group markers to
//! an [`InputTreeBuilder`]; positional options set builder state that is
//! stamped onto every later leaf. The core walks the finished tree in order
//! and never re-reads the command line.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::elf;
use crate::error::LinkError;
use crate::module::{InputId, SectionId, SymbolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Unknown,
    Object,
    DynObj,
    Archive,
    Script,
    MemoryImage,
}

/// Positional attributes captured from the command line position where the
/// input appeared.
#[derive(Debug, Clone, Copy)]
pub struct InputAttrs {
    /// --whole-archive: include every member regardless of need.
    pub whole_archive: bool,
    /// --as-needed: emit DT_NEEDED only if a symbol is actually used.
    pub as_needed: bool,
    /// --add-needed: propagate the shared object's own DT_NEEDED entries.
    pub add_needed: bool,
    /// -Bstatic: `-l` resolves archives only.
    pub static_only: bool,
}

impl Default for InputAttrs {
    fn default() -> InputAttrs {
        InputAttrs {
            whole_archive: false,
            as_needed: false,
            add_needed: true,
            static_only: false,
        }
    }
}

/// One input file. Owns its parsed sections and symbols once ingested.
#[derive(Debug)]
pub struct Input {
    pub name: String,
    pub path: PathBuf,
    pub itype: InputType,
    pub attrs: InputAttrs,
    /// Sections parsed out of this input, by arena id, in header order.
    pub sections: Vec<SectionId>,
    /// Symbol ids aligned with the input's symbol table indices.
    pub symbols: Vec<SymbolId>,
    /// DynObj only: the soname to record in DT_NEEDED.
    pub soname: Option<String>,
    /// DynObj only: set once one of its definitions satisfies a reference.
    pub referenced: bool,
    /// MemoryImage inputs carry their bytes instead of a path.
    pub bytes: Option<Vec<u8>>,
    /// DynObj only: the library's own DT_NEEDED entries, propagated into the
    /// output when --add-needed is in effect.
    pub dt_needed: Vec<String>,
}

impl Input {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, itype: InputType) -> Input {
        Input {
            name: name.into(),
            path: path.into(),
            itype,
            attrs: InputAttrs::default(),
            sections: Vec::new(),
            symbols: Vec::new(),
            soname: None,
            referenced: false,
            bytes: None,
            dt_needed: Vec::new(),
        }
    }
}

/// Probe the leading bytes of a file to classify an `Unknown` input.
pub fn probe_type(bytes: &[u8]) -> InputType {
    if bytes.len() >= 20 && bytes[0..4] == elf::ELF_MAGIC {
        return match elf::read_u16(bytes, 16) {
            elf::ET_REL => InputType::Object,
            elf::ET_DYN => InputType::DynObj,
            _ => InputType::Unknown,
        };
    }
    if bytes.len() >= 8 && &bytes[0..8] == b"!<arch>\n" {
        return InputType::Archive;
    }
    // A leading printable body is most likely a linker script.
    if !bytes.is_empty()
        && bytes
            .iter()
            .take(64)
            .all(|&b| b == b'\n' || b == b'\t' || (0x20..0x7f).contains(&b))
    {
        return InputType::Script;
    }
    InputType::Unknown
}

/// A node of the input tree: leaves are inputs, inner nodes bracket groups.
#[derive(Debug)]
pub enum TreeNode {
    Leaf(InputId),
    Group(Vec<TreeNode>),
}

#[derive(Debug, Default)]
pub struct InputTree {
    pub roots: Vec<TreeNode>,
}

impl InputTree {
    /// Flat iteration over every leaf, depth-first.
    pub fn leaves(&self) -> Vec<InputId> {
        fn walk(nodes: &[TreeNode], out: &mut Vec<InputId>) {
            for node in nodes {
                match node {
                    TreeNode::Leaf(id) => out.push(*id),
                    TreeNode::Group(inner) => walk(inner, out),
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.roots, &mut out);
        out
    }
}

/// Builds the tree and the input list while tracking positional state.
pub struct InputTreeBuilder {
    pub inputs: Vec<Input>,
    roots: Vec<TreeNode>,
    /// Stack of open groups; nodes append to the innermost.
    group_stack: Vec<Vec<TreeNode>>,
    attrs: InputAttrs,
}

impl InputTreeBuilder {
    pub fn new() -> InputTreeBuilder {
        InputTreeBuilder {
            inputs: Vec::new(),
            roots: Vec::new(),
            group_stack: Vec::new(),
            attrs: InputAttrs::default(),
        }
    }

    // ── Positional option state ──────────────────────────────────────────────

    pub fn set_whole_archive(&mut self, on: bool) {
        self.attrs.whole_archive = on;
    }

    pub fn set_as_needed(&mut self, on: bool) {
        self.attrs.as_needed = on;
    }

    pub fn set_add_needed(&mut self, on: bool) {
        self.attrs.add_needed = on;
    }

    pub fn set_static(&mut self, on: bool) {
        self.attrs.static_only = on;
    }

    // ── Tree construction ────────────────────────────────────────────────────

    pub fn enter_group(&mut self) {
        self.group_stack.push(Vec::new());
    }

    pub fn leave_group(&mut self) -> Result<(), LinkError> {
        let group = self
            .group_stack
            .pop()
            .ok_or_else(|| LinkError::Config("--end-group without --start-group".into()))?;
        self.push_node(TreeNode::Group(group));
        Ok(())
    }

    fn push_node(&mut self, node: TreeNode) {
        match self.group_stack.last_mut() {
            Some(open) => open.push(node),
            None => self.roots.push(node),
        }
    }

    /// Append a file path as a leaf with the current positional attributes.
    pub fn add_file(&mut self, path: &Path, itype: InputType) -> InputId {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("<input>")
            .to_string();
        let mut input = Input::new(name, path, itype);
        input.attrs = self.attrs;
        let id = InputId(self.inputs.len() as u32);
        self.inputs.push(input);
        self.push_node(TreeNode::Leaf(id));
        id
    }

    /// Append an in-memory image as a leaf; probed and ingested like a file.
    pub fn add_memory(&mut self, name: &str, bytes: Vec<u8>) -> InputId {
        let mut input = Input::new(name, name, InputType::MemoryImage);
        input.attrs = self.attrs;
        input.bytes = Some(bytes);
        let id = InputId(self.inputs.len() as u32);
        self.inputs.push(input);
        self.push_node(TreeNode::Leaf(id));
        id
    }

    /// `-l NAMESPEC`: search `lib<spec>.so` / `lib<spec>.a` through the
    /// configured directories, honouring -Bstatic state.
    pub fn add_namespec(&mut self, spec: &str, config: &Config) -> Result<InputId, LinkError> {
        let path = search_namespec(spec, config, self.attrs.static_only).ok_or_else(|| {
            LinkError::Config(format!("cannot find -l{}", spec))
        })?;
        let itype = if path.extension().map_or(false, |e| e == "a") {
            InputType::Archive
        } else {
            InputType::DynObj
        };
        Ok(self.add_file(&path, itype))
    }

    pub fn finish(mut self) -> Result<(InputTree, Vec<Input>), LinkError> {
        if !self.group_stack.is_empty() {
            return Err(LinkError::Config("--start-group without --end-group".into()));
        }
        Ok((
            InputTree {
                roots: std::mem::take(&mut self.roots),
            },
            self.inputs,
        ))
    }
}

impl Default for InputTreeBuilder {
    fn default() -> Self {
        InputTreeBuilder::new()
    }
}

fn search_namespec(spec: &str, config: &Config, static_only: bool) -> Option<PathBuf> {
    let sysroot = config.sysroot.clone().unwrap_or_default();
    for dir in &config.search_dirs {
        let dir = if dir.is_absolute() && config.sysroot.is_some() {
            sysroot.join(dir.strip_prefix("/").unwrap_or(dir))
        } else {
            dir.clone()
        };
        if !static_only {
            let shared = dir.join(format!("lib{}.so", spec));
            if shared.exists() {
                return Some(shared);
            }
        }
        let archive = dir.join(format!("lib{}.a", spec));
        if archive.exists() {
            return Some(archive);
        }
    }
    None
}
