//! Loading PE images into the emulated address space.
//!
//! The [`ModuleManager`] owns every mapped image: it reserves and commits the image
//! region, copies headers and sections, applies relocations when the preferred base
//! is taken, resolves the import directory (loading dependencies recursively from
//! the filesystem view, or materializing stub trampolines for modules outside the
//! emulation allowlist), patches the IAT, and finally locks section protections
//! down to their declared characteristics.
//!
//! Failures during a load roll back: regions reserved for the failing image are
//! released and the module table is left unchanged.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use crate::{
    cpu::CpuEngine,
    memory::{page_align_up, MemoryManager, MemoryProtection, RegionTag},
    module::pe::{
        ExportEntry, ExportTable, ImportTarget, PeFile, SectionInfo, TlsDirectory,
    },
    Error, Result,
};

/// Maximum forwarder chain length tolerated before giving up.
const MAX_FORWARD_DEPTH: usize = 8;

/// Byte size of one stub trampoline slot.
const STUB_SLOT_SIZE: u64 = 16;

/// Total stub region size (4096 slots).
const STUB_REGION_SIZE: u64 = 0x1_0000;

/// One import after binding: where it was patched and what it resolved to.
#[derive(Clone, Debug)]
pub struct BoundImport {
    /// Dependency library name as written in the import directory.
    pub library: String,
    /// Imported symbol (name or `#ordinal`).
    pub symbol: String,
    /// Guest address of the patched IAT slot.
    pub iat_address: u64,
    /// Resolved target address written into the slot.
    pub target: u64,
}

/// A mapped image.
#[derive(Clone, Debug)]
pub struct Module {
    /// Module file name (e.g. `app.exe`, `ntdll.dll`).
    pub name: String,
    /// Host path the image was read from, if it came from a file.
    pub path: Option<PathBuf>,
    /// Base address the image is mapped at.
    pub base: u64,
    /// `SizeOfImage`.
    pub size: u64,
    /// Entry point VA, if any.
    pub entry_point: Option<u64>,
    /// Section table.
    pub sections: Vec<SectionInfo>,
    /// Export directory.
    pub exports: ExportTable,
    /// Bound import table.
    pub imports: Vec<BoundImport>,
    /// TLS directory (VAs as mapped) and the assigned TLS index.
    pub tls: Option<(TlsDirectory, u32)>,
    /// `true` for the primary executable.
    pub is_primary: bool,
}

impl Module {
    /// Returns the module name without its extension, lowercase.
    #[must_use]
    pub fn stem(&self) -> String {
        let lower = self.name.to_ascii_lowercase();
        match lower.rfind('.') {
            Some(dot) => lower[..dot].to_string(),
            None => lower,
        }
    }

    /// Returns the exclusive end address of the image.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.size
    }
}

/// How an import dependency is satisfied.
enum Dependency {
    /// A real image mapped at this base.
    Real(u64),
    /// Synthetic trampolines; the kernel layer emulates the API.
    Stub,
}

/// The stub trampoline region: one 16-byte `syscall; ret` slot per stubbed export.
///
/// Execution reaching a slot surfaces through the engine's syscall exit; the
/// dispatcher classifies by address before decoding a service number.
#[derive(Clone, Debug, Default)]
pub struct StubTable {
    /// Base of the trampoline region (0 until first use).
    pub region: u64,
    /// Next free offset inside the region.
    pub next: u64,
    /// Slot address → (library, symbol).
    pub by_address: BTreeMap<u64, (String, String)>,
    by_key: FxHashMap<(String, String), u64>,
}

impl StubTable {
    /// Returns the trampoline for `(library, symbol)`, allocating one on first use.
    fn slot(
        &mut self,
        cpu: &mut dyn CpuEngine,
        memory: &mut MemoryManager,
        library: &str,
        symbol: &str,
    ) -> Result<u64> {
        let key = (library.to_ascii_lowercase(), symbol.to_string());
        if let Some(&address) = self.by_key.get(&key) {
            return Ok(address);
        }

        if self.region == 0 {
            let base = memory.reserve(
                0,
                STUB_REGION_SIZE,
                MemoryProtection::READ_EXECUTE,
                RegionTag::Private,
            )?;
            memory.commit(cpu, base, STUB_REGION_SIZE, MemoryProtection::READ_EXECUTE)?;
            self.region = base;
        }
        if self.next + STUB_SLOT_SIZE > STUB_REGION_SIZE {
            return Err(Error::AddressSpaceExhausted(STUB_SLOT_SIZE));
        }

        let address = self.region + self.next;
        self.next += STUB_SLOT_SIZE;
        // syscall; ret
        memory.write_privileged(cpu, address, &[0x0F, 0x05, 0xC3])?;

        self.by_address.insert(address, key.clone());
        self.by_key.insert(key, address);
        Ok(address)
    }

    /// Looks up the (library, symbol) pair behind a trampoline address.
    #[must_use]
    pub fn find(&self, address: u64) -> Option<(&str, &str)> {
        self.by_address
            .get(&address)
            .map(|(library, symbol)| (library.as_str(), symbol.as_str()))
    }

    /// Returns `true` if `address` lies inside the trampoline region.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.region != 0 && address >= self.region && address < self.region + STUB_REGION_SIZE
    }

    /// Rebuilds the reverse index after snapshot restore.
    pub fn rebuild_index(&mut self) {
        self.by_key = self
            .by_address
            .iter()
            .map(|(address, key)| (key.clone(), *address))
            .collect();
    }
}

/// Owner of all mapped modules and the stub trampoline table.
#[derive(Debug, Default)]
pub struct ModuleManager {
    pub(crate) modules: BTreeMap<u64, Module>,
    pub(crate) stubs: StubTable,
    root: PathBuf,
    path_mappings: Vec<(String, PathBuf)>,
    emulated: BTreeSet<String>,
    pub(crate) next_tls_index: u32,
}

impl ModuleManager {
    /// Creates a module manager over the given filesystem view.
    ///
    /// `emulated` is the lowercase allowlist of modules loaded from real files;
    /// imports from any other library resolve to stub trampolines.
    #[must_use]
    pub fn new(
        root: PathBuf,
        path_mappings: Vec<(String, PathBuf)>,
        emulated: BTreeSet<String>,
    ) -> Self {
        Self {
            modules: BTreeMap::new(),
            stubs: StubTable::default(),
            root,
            path_mappings,
            emulated,
            next_tls_index: 0,
        }
    }

    /// Maps the primary executable from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageLoad`] on parse, relocation or import failures;
    /// partial state is rolled back.
    pub fn map_primary(
        &mut self,
        cpu: &mut dyn CpuEngine,
        memory: &mut MemoryManager,
        bytes: &[u8],
        name: &str,
    ) -> Result<u64> {
        self.map_image(cpu, memory, bytes, name, None, true)
    }

    /// Maps a non-primary image from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageLoad`] on parse, relocation or import failures;
    /// partial state is rolled back.
    pub fn map_module(
        &mut self,
        cpu: &mut dyn CpuEngine,
        memory: &mut MemoryManager,
        bytes: &[u8],
        name: &str,
    ) -> Result<u64> {
        self.map_image(cpu, memory, bytes, name, None, false)
    }

    /// Maps an image from the host filesystem view.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if the file cannot be read, otherwise as
    /// [`map_module`](Self::map_module).
    pub fn map_file(
        &mut self,
        cpu: &mut dyn CpuEngine,
        memory: &mut MemoryManager,
        path: &Path,
        is_primary: bool,
    ) -> Result<u64> {
        let bytes = read_image_file(path)?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("unknown")
            .to_string();
        self.map_image(cpu, memory, &bytes, &name, Some(path.to_path_buf()), is_primary)
    }

    /// Unmaps a module, releasing its image region. Memory and module tables end
    /// up byte-equal to their state before the matching map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if no module is mapped at `base`.
    pub fn unmap_module(
        &mut self,
        cpu: &mut dyn CpuEngine,
        memory: &mut MemoryManager,
        base: u64,
    ) -> Result<()> {
        if self.modules.remove(&base).is_none() {
            return Err(Error::InvalidParameter(format!(
                "no module mapped at {base:#x}"
            )));
        }
        memory.release(cpu, base)
    }

    /// Returns the module covering `address` (O(log n) range lookup).
    #[must_use]
    pub fn get_by_address(&self, address: u64) -> Option<&Module> {
        self.modules
            .range(..=address)
            .next_back()
            .map(|(_, module)| module)
            .filter(|module| address < module.end())
    }

    /// Finds a module by name, case-insensitively, with or without extension.
    /// The primary executable also matches the application base name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&Module> {
        let lower = name.to_ascii_lowercase();
        let stem = match lower.rfind('.') {
            Some(dot) => lower[..dot].to_string(),
            None => lower.clone(),
        };
        self.modules
            .values()
            .find(|module| module.name.to_ascii_lowercase() == lower || module.stem() == stem)
    }

    /// Returns the primary executable, if one is mapped.
    #[must_use]
    pub fn primary(&self) -> Option<&Module> {
        self.modules.values().find(|module| module.is_primary)
    }

    /// Iterates over all modules in base-address order.
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Resolves an export of the module at `base` by name, honoring forwarders
    /// by recursing into the forwarded module.
    #[must_use]
    pub fn get_export(&self, base: u64, name: &str) -> Option<u64> {
        let module = self.modules.get(&base)?;
        self.resolve_entry(module, module.exports.find_by_name(name)?, 0)
    }

    /// Resolves an export of the module at `base` by ordinal, honoring forwarders.
    #[must_use]
    pub fn get_export_by_ordinal(&self, base: u64, ordinal: u32) -> Option<u64> {
        let module = self.modules.get(&base)?;
        self.resolve_entry(module, module.exports.find_by_ordinal(ordinal)?, 0)
    }

    /// Looks up the stub trampoline behind `address`, if any.
    #[must_use]
    pub fn stub_export(&self, address: u64) -> Option<(&str, &str)> {
        self.stubs.find(address)
    }

    /// Returns `true` if `address` lies in the stub trampoline region.
    #[must_use]
    pub fn is_stub_address(&self, address: u64) -> bool {
        self.stubs.contains(address)
    }

    /// Translates a guest path (NT-style, backslashes) to a host path through the
    /// mount table, falling back to the emulation root.
    #[must_use]
    pub fn resolve_guest_path(&self, guest_path: &str) -> PathBuf {
        let lower = guest_path.to_ascii_lowercase();
        for (prefix, host) in &self.path_mappings {
            if let Some(rest) = lower.strip_prefix(&prefix.to_ascii_lowercase()) {
                return host.join(rest.trim_start_matches(['\\', '/']).replace('\\', "/"));
            }
        }
        // Strip a drive letter and re-root under the emulation root.
        let relative = match guest_path.get(1..2) {
            Some(":") => &guest_path[2..],
            _ => guest_path,
        };
        self.root
            .join(relative.trim_start_matches(['\\', '/']).replace('\\', "/"))
    }

    fn resolve_entry(&self, module: &Module, entry: &ExportEntry, depth: usize) -> Option<u64> {
        match entry {
            ExportEntry::Rva(rva) => Some(module.base + u64::from(*rva)),
            ExportEntry::Forwarder(target) => {
                if depth >= MAX_FORWARD_DEPTH {
                    return None;
                }
                let (library, symbol) = target.split_once('.')?;
                let forwarded = self.find_by_name(library)?;
                let entry = if let Some(ordinal) = symbol.strip_prefix('#') {
                    forwarded
                        .exports
                        .find_by_ordinal(ordinal.parse().ok()?)?
                } else {
                    forwarded.exports.find_by_name(symbol)?
                };
                self.resolve_entry(forwarded, entry, depth + 1)
            }
        }
    }

    fn map_image(
        &mut self,
        cpu: &mut dyn CpuEngine,
        memory: &mut MemoryManager,
        bytes: &[u8],
        name: &str,
        path: Option<PathBuf>,
        is_primary: bool,
    ) -> Result<u64> {
        let mut pe = PeFile::parse(bytes, name)?;
        let size = pe.size_of_image;

        // Preferred base first; relocate into a fresh reservation otherwise.
        let base = match memory.reserve(
            pe.preferred_base,
            size,
            MemoryProtection::READ_WRITE_EXECUTE,
            RegionTag::Image,
        ) {
            Ok(base) => base,
            Err(_) => {
                let base = memory.reserve(
                    0,
                    size,
                    MemoryProtection::READ_WRITE_EXECUTE,
                    RegionTag::Image,
                )?;
                if let Err(error) = pe.relocate(base, name) {
                    let _ = memory.release(cpu, base);
                    return Err(error);
                }
                base
            }
        };

        match self.map_image_at(cpu, memory, &pe, base, name, path, is_primary) {
            Ok(()) => {
                log::debug!("mapped {name} at {base:#x} ({size:#x} bytes)");
                Ok(base)
            }
            Err(error) => {
                self.modules.remove(&base);
                let _ = memory.release(cpu, base);
                Err(error)
            }
        }
    }

    fn map_image_at(
        &mut self,
        cpu: &mut dyn CpuEngine,
        memory: &mut MemoryManager,
        pe: &PeFile,
        base: u64,
        name: &str,
        path: Option<PathBuf>,
        is_primary: bool,
    ) -> Result<()> {
        memory.commit(cpu, base, pe.size_of_image, MemoryProtection::READ_WRITE)?;
        memory.write_privileged(cpu, base, &pe.image)?;

        let exports = pe.exports(name)?;
        let import_directory = pe.imports(name)?;

        let tls = match pe.tls() {
            Some(directory) => {
                let index = self.next_tls_index;
                self.next_tls_index += 1;
                // The image's index slot receives the assigned module TLS index.
                memory.write_privileged(
                    cpu,
                    directory.address_of_index,
                    &index.to_le_bytes(),
                )?;
                Some((directory, index))
            }
            None => None,
        };

        // Insert before binding so circular imports resolve against this image.
        self.modules.insert(
            base,
            Module {
                name: name.to_string(),
                path,
                base,
                size: pe.size_of_image,
                entry_point: pe.entry_point_rva.map(|rva| base + u64::from(rva)),
                sections: pe.sections.clone(),
                exports,
                imports: Vec::new(),
                tls,
                is_primary,
            },
        );

        let mut bound = Vec::new();
        for descriptor in import_directory {
            let dependency = self.ensure_dependency(cpu, memory, &descriptor.library)?;
            for entry in descriptor.entries {
                let symbol = entry.target.to_string();
                let target = match &dependency {
                    Dependency::Real(dep_base) => {
                        let resolved = match &entry.target {
                            ImportTarget::Name(import_name) => {
                                self.get_export(*dep_base, import_name)
                            }
                            ImportTarget::Ordinal(ordinal) => {
                                self.get_export_by_ordinal(*dep_base, *ordinal)
                            }
                        };
                        resolved.ok_or_else(|| Error::ImageLoad {
                            module: name.to_string(),
                            reason: format!(
                                "unresolved import {}!{symbol}",
                                descriptor.library
                            ),
                        })?
                    }
                    Dependency::Stub => {
                        self.stubs
                            .slot(cpu, memory, &descriptor.library, &symbol)?
                    }
                };

                let iat_address = base + u64::from(entry.iat_rva);
                memory.write_privileged(cpu, iat_address, &target.to_le_bytes())?;
                bound.push(BoundImport {
                    library: descriptor.library.clone(),
                    symbol,
                    iat_address,
                    target,
                });
            }
        }

        // Lock protections down: headers read-only, sections per characteristics.
        memory.protect(
            cpu,
            base,
            page_align_up(pe.size_of_headers.max(1)),
            MemoryProtection::READ,
        )?;
        for section in &pe.sections {
            let length = page_align_up(u64::from(section.virtual_size.max(1)));
            memory.protect(
                cpu,
                base + u64::from(section.virtual_address),
                length.min(pe.size_of_image - u64::from(section.virtual_address)),
                section.protection,
            )?;
        }

        let module = self.modules.get_mut(&base).expect("inserted above");
        module.imports = bound;
        Ok(())
    }

    /// Loads or stubs an import dependency.
    fn ensure_dependency(
        &mut self,
        cpu: &mut dyn CpuEngine,
        memory: &mut MemoryManager,
        library: &str,
    ) -> Result<Dependency> {
        if let Some(module) = self.find_by_name(library) {
            return Ok(Dependency::Real(module.base));
        }

        let lower = library.to_ascii_lowercase();
        if !self.emulated.contains(&lower) {
            return Ok(Dependency::Stub);
        }

        let path = self.locate_system_module(&lower).ok_or_else(|| Error::ImageLoad {
            module: library.to_string(),
            reason: "module is on the emulation list but not present in the filesystem view"
                .to_string(),
        })?;
        let base = self.map_file(cpu, memory, &path, false)?;
        Ok(Dependency::Real(base))
    }

    /// Searches the filesystem view for a system module.
    fn locate_system_module(&self, lower_name: &str) -> Option<PathBuf> {
        let candidates = [
            self.root.join("windows/system32").join(lower_name),
            self.root.join(lower_name),
        ];
        candidates.into_iter().find(|path| path.is_file())
    }
}

/// Reads an image file through a memory map.
fn read_image_file(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    // Safety: the mapping is read-only and copied out immediately; the emulator
    // does not keep it alive past this call.
    let mapping = unsafe { memmap2::Mmap::map(&file)? };
    Ok(mapping.to_vec())
}
