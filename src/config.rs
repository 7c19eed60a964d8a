//! Link configuration handed to the core by the front-end.
//!
//! The core never parses command lines; the driver (or an embedding
//! compiler) fills in a [`Config`] and an input tree, then calls `link()`.

use std::path::PathBuf;

/// Kind of image the link produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Exec,
    DynObj,
    Relocatable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Endianness of the machine running the linker.
    pub fn host() -> Self {
        if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }
}

/// Output ELF word size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitClass {
    Class32,
    Class64,
}

impl BitClass {
    pub fn bytes(self) -> usize {
        match self {
            BitClass::Class32 => 4,
            BitClass::Class64 => 8,
        }
    }
}

/// Everything the engine needs to know that came from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub output: PathBuf,
    pub output_type: OutputType,
    pub endian: Endianness,
    pub bitclass: BitClass,
    pub pic: bool,
    pub bsymbolic: bool,
    /// -soname for DynObj outputs.
    pub soname: Option<String>,
    /// Entry symbol for executables.
    pub entry: String,
    pub sysroot: Option<PathBuf>,
    /// -L search directories, in command-line order.
    pub search_dirs: Vec<PathBuf>,
    /// --allow-multiple-definition: keep the first strong definition.
    pub allow_multiple_definition: bool,
    /// Program interpreter for dynamically linked executables.
    pub interpreter: String,
    /// Load address of the first segment for executables.
    pub base_address: u64,
}

impl Config {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Config {
            output: output.into(),
            output_type: OutputType::Exec,
            endian: Endianness::Little,
            bitclass: BitClass::Class32,
            pic: false,
            bsymbolic: false,
            soname: None,
            entry: "_start".to_string(),
            sysroot: None,
            search_dirs: Vec::new(),
            allow_multiple_definition: false,
            interpreter: "/lib/ld-linux-armhf.so.3".to_string(),
            base_address: 0x10000,
        }
    }

    pub fn is_dyn_obj(&self) -> bool {
        self.output_type == OutputType::DynObj
    }

    /// Shared objects and PIC executables both need position-independent
    /// treatment during scanning.
    pub fn is_pic(&self) -> bool {
        self.pic || self.output_type == OutputType::DynObj
    }

    /// Whether the host must byte-swap data read from target images.
    pub fn needs_swap(&self) -> bool {
        self.endian != Endianness::host()
    }
}
