//! Byte-region store: file-backed byte spaces and views into them.
//!
//! A [`MemoryArea`] owns one contiguous byte space per file, either mapped
//! from disk or held on the heap. Callers never touch the space directly;
//! they request [`MemoryRegion`] views parametrised by `(offset, length)`.
//! Views are value-typed and deliberately not `Clone` so aliased writers are
//! visible in the code that creates them. Overlapping writable views are
//! allowed; writers hand off by calling [`MemoryRegion::sync`] in between.
//!
//! The space itself is reference-counted: it stays alive while any view or
//! the area handle exists, and unmaps when the last one is dropped.

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::LinkError;

enum Space {
    Heap(Vec<u8>),
    Mapped(Mmap),
    MappedMut(MmapMut),
}

impl Space {
    fn len(&self) -> usize {
        match self {
            Space::Heap(v) => v.len(),
            Space::Mapped(m) => m.len(),
            Space::MappedMut(m) => m.len(),
        }
    }
}

struct SpaceHandle {
    space: RefCell<Space>,
    path: PathBuf,
}

/// A contiguous byte space backing one input or output file.
pub struct MemoryArea {
    handle: Rc<SpaceHandle>,
}

impl MemoryArea {
    /// Map an existing file read-only. Falls back to a heap copy when the
    /// path cannot be mapped (pipes, some filesystems).
    pub fn open(path: &Path) -> Result<MemoryArea, LinkError> {
        let file = std::fs::File::open(path).map_err(|e| LinkError::IoRead {
            path: path.display().to_string(),
            source: e,
        })?;
        let space = match unsafe { Mmap::map(&file) } {
            Ok(map) => Space::Mapped(map),
            Err(_) => {
                let bytes = std::fs::read(path).map_err(|e| LinkError::IoRead {
                    path: path.display().to_string(),
                    source: e,
                })?;
                Space::Heap(bytes)
            }
        };
        Ok(MemoryArea::with_space(space, path.to_path_buf()))
    }

    /// Create (or truncate) an output file of the given size and map it
    /// writable.
    pub fn create(path: &Path, size: u64) -> Result<MemoryArea, LinkError> {
        let io_err = |e| LinkError::IoWrite {
            path: path.display().to_string(),
            source: e,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(io_err)?;
        file.set_len(size).map_err(io_err)?;
        let map = unsafe { MmapOptions::new().map_mut(&file) }.map_err(io_err)?;
        Ok(MemoryArea::with_space(
            Space::MappedMut(map),
            path.to_path_buf(),
        ))
    }

    /// Wrap an in-memory buffer; used by tests and embedders that hand the
    /// linker bytes they already produced.
    pub fn from_bytes(bytes: Vec<u8>, name: impl Into<PathBuf>) -> MemoryArea {
        MemoryArea::with_space(Space::Heap(bytes), name.into())
    }

    fn with_space(space: Space, path: PathBuf) -> MemoryArea {
        MemoryArea {
            handle: Rc::new(SpaceHandle {
                space: RefCell::new(space),
                path,
            }),
        }
    }

    pub fn size(&self) -> u64 {
        self.handle.space.borrow().len() as u64
    }

    pub fn path(&self) -> &Path {
        &self.handle.path
    }

    /// Hand out a view of `[offset, offset + len)`. Requests past the end of
    /// the space are fatal.
    pub fn request(&self, offset: u64, len: u64) -> Result<MemoryRegion, LinkError> {
        let total = self.size();
        if offset.checked_add(len).map_or(true, |end| end > total) {
            return Err(LinkError::IoRead {
                path: self.handle.path.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("region {:#x}+{:#x} exceeds size {:#x}", offset, len, total),
                ),
            });
        }
        Ok(MemoryRegion {
            handle: Rc::clone(&self.handle),
            start: offset,
            len,
        })
    }
}

/// A `(offset, length)` view into a [`MemoryArea`].
pub struct MemoryRegion {
    handle: Rc<SpaceHandle>,
    start: u64,
    len: u64,
}

impl MemoryRegion {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    /// Copy out the whole view.
    pub fn to_vec(&self) -> Vec<u8> {
        let space = self.handle.space.borrow();
        let (a, b) = (self.start as usize, (self.start + self.len) as usize);
        match &*space {
            Space::Heap(v) => v[a..b].to_vec(),
            Space::Mapped(m) => m[a..b].to_vec(),
            Space::MappedMut(m) => m[a..b].to_vec(),
        }
    }

    /// Copy `out.len()` bytes starting at `offset` within the view.
    pub fn read(&self, offset: u64, out: &mut [u8]) {
        let space = self.handle.space.borrow();
        let a = (self.start + offset) as usize;
        let b = a + out.len();
        debug_assert!(offset + out.len() as u64 <= self.len);
        match &*space {
            Space::Heap(v) => out.copy_from_slice(&v[a..b]),
            Space::Mapped(m) => out.copy_from_slice(&m[a..b]),
            Space::MappedMut(m) => out.copy_from_slice(&m[a..b]),
        }
    }

    /// Store `src` at `offset` within the view. Read-only spaces ignore the
    /// write; output spaces are always writable.
    pub fn write(&mut self, offset: u64, src: &[u8]) {
        let mut space = self.handle.space.borrow_mut();
        let a = (self.start + offset) as usize;
        let b = a + src.len();
        debug_assert!(offset + src.len() as u64 <= self.len);
        match &mut *space {
            Space::Heap(v) => v[a..b].copy_from_slice(src),
            Space::Mapped(_) => {}
            Space::MappedMut(m) => m[a..b].copy_from_slice(src),
        }
    }

    /// Flush modifications in this view back to the file before the next
    /// writer takes over or the space is unmapped.
    pub fn sync(&mut self) -> Result<(), LinkError> {
        let space = self.handle.space.borrow();
        if let Space::MappedMut(m) = &*space {
            m.flush_range(self.start as usize, self.len as usize)
                .map_err(|e| LinkError::IoWrite {
                    path: self.handle.path.display().to_string(),
                    source: e,
                })?;
        }
        Ok(())
    }
}
