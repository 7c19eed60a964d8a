//! Input readers: relocatable objects, `ar` archives, shared objects.
//!
//! Readers turn file bytes into the structured object model (sections,
//! fragments, symbols, relocations) the engine consumes; nothing downstream
//! of ingest looks at raw input bytes again.

pub mod archive;
pub mod dynobj;
pub mod object;

use std::path::Path;

use crate::error::LinkError;
use crate::mem::MemoryArea;

/// Pull a whole input file through the byte-region store.
pub fn load_bytes(path: &Path) -> Result<Vec<u8>, LinkError> {
    let area = MemoryArea::open(path)?;
    let region = area.request(0, area.size())?;
    Ok(region.to_vec())
}
