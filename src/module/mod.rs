//! PE image loading and the module table.
//!
//! - [`PeFile`] - PE32+ parsing, virtual layout, relocation and directory decoding
//! - [`ModuleManager`] - mapping images into guest memory, import binding with
//!   recursive dependency loading, stub trampolines, export lookup with forwarder
//!   chasing, case-insensitive name resolution
//! - [`Module`] - one mapped image: sections, exports, bound imports, TLS

mod manager;
mod pe;

pub use manager::{BoundImport, Module, ModuleManager, StubTable};
pub use pe::{
    ExportEntry, ExportTable, ImportDescriptor, ImportEntry, ImportTarget, PeFile, SectionInfo,
    TlsDirectory,
};
