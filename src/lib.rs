//! ccld: a static ELF linker core for 32-bit ARM.
//!
//! The engine consumes relocatable objects, archives, and shared objects,
//! resolves symbols across them, reserves and builds the dynamic-linking
//! tables (GOT, PLT, `.rel.*`), lays sections out into segments, applies
//! relocations, and writes an executable or shared object.
//!
//! The pipeline is a fixed sequence of phases, each running to completion:
//!
//! ```text
//! ingest → resolve → scan → layout → apply → write
//! ```
//!
//! [`linker::link`] is the top-level entry; [`driver::Driver`] wraps it with
//! an ld-compatible command line. Embedders can instead build an input tree
//! with [`input::InputTreeBuilder`] (including in-memory images) and call
//! the engine directly.

pub mod config;
pub mod driver;
pub mod dynamic;
pub mod elf;
pub mod error;
pub mod fragment;
pub mod got;
pub mod group;
pub mod input;
pub mod layout;
pub mod linker;
pub mod mem;
pub mod module;
pub mod plt;
pub mod reader;
pub mod relocate;
pub mod resolver;
pub mod scan;
pub mod section;
pub mod symbol;
pub mod target;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{BitClass, Config, Endianness, OutputType};
pub use error::LinkError;
pub use linker::{link, LinkOutcome};
