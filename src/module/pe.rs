//! PE image parsing and in-memory layout.
//!
//! [`PeFile`] parses a PE32+ image with goblin, lays its headers and sections out at
//! their virtual addresses, and exposes the directories the module manager needs:
//! exports (name and ordinal, with forwarder strings), imports (per-library thunk
//! lists with their IAT slots), base relocations and the TLS directory.
//!
//! Only 64-bit images are accepted; the emulator targets x86-64 guests exclusively.

use rustc_hash::FxHashMap;

use crate::{
    memory::MemoryProtection,
    Error, Result,
};

/// Base relocation types from the PE format specification.
mod reloc_type {
    /// No-op relocation, used for padding to maintain alignment.
    pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
    /// 32-bit address fixup (add delta to DWORD at offset).
    pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
    /// 64-bit address fixup (add delta to QWORD at offset).
    pub const IMAGE_REL_BASED_DIR64: u16 = 10;
}

/// Information about a PE section within a loaded image.
///
/// Protection flags are derived from the section characteristics using the
/// standard `IMAGE_SCN_MEM_*` bits.
#[derive(Clone, Debug)]
pub struct SectionInfo {
    /// Section name (e.g., ".text", ".data", ".rdata").
    pub name: String,
    /// Virtual address (RVA) relative to the image base.
    pub virtual_address: u32,
    /// Virtual size of the section in memory.
    pub virtual_size: u32,
    /// File offset to the raw section data.
    pub raw_data_offset: u32,
    /// Size of raw data in the file (may differ from virtual size).
    pub raw_data_size: u32,
    /// PE section characteristics flags (from `IMAGE_SECTION_HEADER`).
    pub characteristics: u32,
    /// Protection flags derived from the characteristics.
    pub protection: MemoryProtection,
}

impl SectionInfo {
    /// Derives protection flags from `IMAGE_SCN_MEM_*` characteristics bits.
    #[must_use]
    pub fn protection_from_characteristics(characteristics: u32) -> MemoryProtection {
        let mut protection = MemoryProtection::empty();
        if characteristics & 0x4000_0000 != 0 {
            // IMAGE_SCN_MEM_READ
            protection |= MemoryProtection::READ;
        }
        if characteristics & 0x8000_0000 != 0 {
            // IMAGE_SCN_MEM_WRITE
            protection |= MemoryProtection::WRITE;
        }
        if characteristics & 0x2000_0000 != 0 {
            // IMAGE_SCN_MEM_EXECUTE
            protection |= MemoryProtection::EXECUTE;
        }
        protection
    }
}

/// An exported symbol: either an RVA into the image or a forwarder string
/// (`"NTDLL.RtlAllocateHeap"` or `"DLL.#12"`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportEntry {
    /// Export resolves to an RVA within the exporting image.
    Rva(u32),
    /// Export forwards to a symbol in another module.
    Forwarder(String),
}

/// The export directory of an image: name → entry and ordinal → entry.
#[derive(Clone, Debug, Default)]
pub struct ExportTable {
    /// Lowest ordinal value (the `Base` field of the export directory).
    pub ordinal_base: u32,
    /// Entries indexed by biased ordinal (`ordinal - ordinal_base`).
    pub by_ordinal: Vec<Option<ExportEntry>>,
    /// Name → biased ordinal index.
    pub by_name: FxHashMap<String, u32>,
}

impl ExportTable {
    /// Looks up an export by name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&ExportEntry> {
        let index = *self.by_name.get(name)?;
        self.by_ordinal.get(index as usize)?.as_ref()
    }

    /// Looks up an export by (unbiased) ordinal.
    #[must_use]
    pub fn find_by_ordinal(&self, ordinal: u32) -> Option<&ExportEntry> {
        let index = ordinal.checked_sub(self.ordinal_base)?;
        self.by_ordinal.get(index as usize)?.as_ref()
    }

    /// Returns an iterator over all named exports as `(name, entry)` pairs.
    pub fn names(&self) -> impl Iterator<Item = (&str, &ExportEntry)> {
        self.by_name.iter().filter_map(|(name, index)| {
            self.by_ordinal
                .get(*index as usize)
                .and_then(Option::as_ref)
                .map(|entry| (name.as_str(), entry))
        })
    }
}

/// What an import thunk refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportTarget {
    /// Import by symbol name (with its hint).
    Name(String),
    /// Import by ordinal.
    Ordinal(u32),
}

impl std::fmt::Display for ImportTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportTarget::Name(name) => f.write_str(name),
            ImportTarget::Ordinal(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

/// One import thunk: the symbol it names and the IAT slot to patch.
#[derive(Clone, Debug)]
pub struct ImportEntry {
    /// The imported symbol.
    pub target: ImportTarget,
    /// RVA of the 8-byte IAT slot to receive the resolved address.
    pub iat_rva: u32,
}

/// All imports from one dependency library.
#[derive(Clone, Debug)]
pub struct ImportDescriptor {
    /// Name of the dependency as written in the import directory.
    pub library: String,
    /// The thunks imported from it.
    pub entries: Vec<ImportEntry>,
}

/// The TLS directory of an image (`IMAGE_TLS_DIRECTORY64`), with addresses kept as
/// the virtual addresses stored in the image (relocated together with it).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlsDirectory {
    /// VA of the start of the TLS template data.
    pub start_of_raw_data: u64,
    /// VA one past the end of the TLS template data.
    pub end_of_raw_data: u64,
    /// VA of the slot receiving the module's TLS index.
    pub address_of_index: u64,
    /// VA of the NULL-terminated TLS callback array (0 if none).
    pub address_of_callbacks: u64,
    /// Bytes of zero fill appended after the template.
    pub size_of_zero_fill: u32,
}

/// A parsed PE32+ image laid out at its virtual addresses.
///
/// `parse` validates the headers, copies headers and sections into a buffer shaped
/// like the mapped image, and records the directory locations. [`relocate`](Self::relocate)
/// rebases the buffer; the directory accessors then decode from the laid-out bytes,
/// exactly as the loader will see them in guest memory.
#[derive(Clone, Debug)]
pub struct PeFile {
    /// Preferred base address from the optional header.
    pub preferred_base: u64,
    /// `SizeOfImage`, page-rounded total mapped size.
    pub size_of_image: u64,
    /// `SizeOfHeaders`, the mapped header prefix.
    pub size_of_headers: u64,
    /// Entry point RVA, if the image has one.
    pub entry_point_rva: Option<u32>,
    /// Whether the image is a DLL.
    pub is_dll: bool,
    /// Section table with derived protections.
    pub sections: Vec<SectionInfo>,
    /// The image laid out at virtual addresses (headers + sections, zero filled).
    pub image: Vec<u8>,
    export_dir: Option<(u32, u32)>,
    import_dir: Option<(u32, u32)>,
    tls_dir: Option<(u32, u32)>,
    reloc_dir: Option<(u32, u32)>,
}

impl PeFile {
    /// Parses a PE32+ image and lays it out at virtual addresses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageLoad`] for non-64-bit images, malformed headers or
    /// sections that fall outside the declared image size.
    pub fn parse(bytes: &[u8], name: &str) -> Result<Self> {
        let pe = goblin::pe::PE::parse(bytes).map_err(|error| Error::ImageLoad {
            module: name.to_string(),
            reason: error.to_string(),
        })?;

        if !pe.is_64 {
            return Err(Error::ImageLoad {
                module: name.to_string(),
                reason: "only PE32+ (x86-64) images are supported".to_string(),
            });
        }

        let optional = pe.header.optional_header.ok_or_else(|| Error::ImageLoad {
            module: name.to_string(),
            reason: "missing optional header".to_string(),
        })?;

        let size_of_image = u64::from(optional.windows_fields.size_of_image);
        if size_of_image == 0 || size_of_image > 0x1000_0000 {
            return Err(Error::ImageLoad {
                module: name.to_string(),
                reason: format!("implausible SizeOfImage {size_of_image:#x}"),
            });
        }
        let size_of_headers = u64::from(optional.windows_fields.size_of_headers);

        let entry_rva = optional.standard_fields.address_of_entry_point;
        let entry_point_rva = if entry_rva != 0 {
            Some(entry_rva as u32)
        } else {
            None
        };

        // IMAGE_FILE_DLL
        let is_dll = pe.header.coff_header.characteristics & 0x2000 != 0;

        // Lay the image out at virtual addresses: headers first, then each section.
        let mut image = vec![0u8; size_of_image as usize];
        let headers_len = (size_of_headers as usize).min(bytes.len()).min(image.len());
        image[..headers_len].copy_from_slice(&bytes[..headers_len]);

        let mut sections = Vec::with_capacity(pe.sections.len());
        for section in &pe.sections {
            let section_name = String::from_utf8_lossy(&section.name)
                .trim_end_matches('\0')
                .to_string();
            let virtual_address = section.virtual_address;
            let virtual_size = section.virtual_size;
            let raw_size = section.size_of_raw_data;
            let raw_offset = section.pointer_to_raw_data as usize;
            let characteristics = section.characteristics;

            let dest_offset = virtual_address as usize;
            let copy_size = raw_size.min(virtual_size.max(raw_size)) as usize;
            let copy_size = copy_size
                .min(bytes.len().saturating_sub(raw_offset))
                .min(image.len().saturating_sub(dest_offset));
            if dest_offset >= image.len() {
                return Err(Error::ImageLoad {
                    module: name.to_string(),
                    reason: format!(
                        "section '{section_name}' at RVA {virtual_address:#x} is outside the image"
                    ),
                });
            }
            image[dest_offset..dest_offset + copy_size]
                .copy_from_slice(&bytes[raw_offset..raw_offset + copy_size]);

            sections.push(SectionInfo {
                name: section_name,
                virtual_address,
                virtual_size,
                raw_data_offset: raw_offset as u32,
                raw_data_size: raw_size,
                characteristics,
                protection: SectionInfo::protection_from_characteristics(characteristics),
            });
        }

        let directory = |dd: Option<&goblin::pe::data_directories::DataDirectory>| {
            dd.filter(|dd| dd.size > 0)
                .map(|dd| (dd.virtual_address, dd.size))
        };
        let directories = &optional.data_directories;

        Ok(Self {
            preferred_base: pe.image_base as u64,
            size_of_image,
            size_of_headers,
            entry_point_rva,
            is_dll,
            sections,
            image,
            export_dir: directory(directories.get_export_table()),
            import_dir: directory(directories.get_import_table()),
            tls_dir: directory(directories.get_tls_table()),
            reloc_dir: directory(directories.get_base_relocation_table()),
        })
    }

    /// Applies base relocations so the image can run at `new_base`.
    ///
    /// The relocation table consists of blocks, each covering one 4 KiB page: a
    /// 4-byte page RVA, a 4-byte block size, then 16-bit entries with the type in the
    /// high 4 bits and the page offset in the low 12.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageLoad`] if the image has to move but carries no
    /// relocation directory, or if the directory is malformed.
    pub fn relocate(&mut self, new_base: u64, name: &str) -> Result<()> {
        let delta = new_base as i64 - self.preferred_base as i64;
        if delta == 0 {
            return Ok(());
        }

        let Some((reloc_rva, reloc_size)) = self.reloc_dir else {
            return Err(Error::ImageLoad {
                module: name.to_string(),
                reason: "image requires relocation but has no relocation directory".to_string(),
            });
        };

        let reloc_rva = reloc_rva as usize;
        let reloc_size = reloc_size as usize;
        if reloc_rva + reloc_size > self.image.len() {
            return Err(Error::ImageLoad {
                module: name.to_string(),
                reason: "relocation directory extends beyond image bounds".to_string(),
            });
        }

        let mut offset = reloc_rva;
        let end = reloc_rva + reloc_size;

        while offset + 8 <= end {
            let page_rva = read_u32(&self.image, offset) as usize;
            let block_size = read_u32(&self.image, offset + 4) as usize;
            if block_size < 8 || offset + block_size > end {
                break;
            }

            let entry_count = (block_size - 8) / 2;
            for i in 0..entry_count {
                let entry = read_u16(&self.image, offset + 8 + i * 2);
                let kind = entry >> 12;
                let target = page_rva + (entry & 0x0FFF) as usize;

                match kind {
                    reloc_type::IMAGE_REL_BASED_ABSOLUTE => {}
                    reloc_type::IMAGE_REL_BASED_HIGHLOW => {
                        if target + 4 <= self.image.len() {
                            let value = read_u32(&self.image, target);
                            let fixed = (i64::from(value) + delta) as u32;
                            self.image[target..target + 4].copy_from_slice(&fixed.to_le_bytes());
                        }
                    }
                    reloc_type::IMAGE_REL_BASED_DIR64 => {
                        if target + 8 <= self.image.len() {
                            let value = read_u64(&self.image, target);
                            let fixed = (value as i64 + delta) as u64;
                            self.image[target..target + 8].copy_from_slice(&fixed.to_le_bytes());
                        }
                    }
                    other => {
                        return Err(Error::ImageLoad {
                            module: name.to_string(),
                            reason: format!("unsupported relocation type {other}"),
                        });
                    }
                }
            }

            offset += block_size;
        }

        Ok(())
    }

    /// Decodes the export directory into an [`ExportTable`].
    ///
    /// Function RVAs that point back inside the export directory are forwarders and
    /// are captured as their forwarder strings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageLoad`] if directory contents fall outside the image.
    pub fn exports(&self, name: &str) -> Result<ExportTable> {
        let Some((dir_rva, dir_size)) = self.export_dir else {
            return Ok(ExportTable::default());
        };
        let dir = dir_rva as usize;
        self.check_range(dir, 40, name, "export directory")?;

        let ordinal_base = read_u32(&self.image, dir + 16);
        let function_count = read_u32(&self.image, dir + 20) as usize;
        let name_count = read_u32(&self.image, dir + 24) as usize;
        let functions_rva = read_u32(&self.image, dir + 28) as usize;
        let names_rva = read_u32(&self.image, dir + 32) as usize;
        let ordinals_rva = read_u32(&self.image, dir + 36) as usize;

        self.check_range(functions_rva, function_count * 4, name, "export functions")?;
        self.check_range(names_rva, name_count * 4, name, "export names")?;
        self.check_range(ordinals_rva, name_count * 2, name, "export ordinals")?;

        let forwarder_range = dir_rva..(dir_rva + dir_size);
        let mut by_ordinal = Vec::with_capacity(function_count);
        for i in 0..function_count {
            let rva = read_u32(&self.image, functions_rva + i * 4);
            if rva == 0 {
                by_ordinal.push(None);
            } else if forwarder_range.contains(&rva) {
                let forwarder = self.read_cstring(rva as usize, name)?;
                by_ordinal.push(Some(ExportEntry::Forwarder(forwarder)));
            } else {
                by_ordinal.push(Some(ExportEntry::Rva(rva)));
            }
        }

        let mut by_name = FxHashMap::default();
        for i in 0..name_count {
            let name_rva = read_u32(&self.image, names_rva + i * 4) as usize;
            let export_name = self.read_cstring(name_rva, name)?;
            let index = read_u16(&self.image, ordinals_rva + i * 2);
            by_name.insert(export_name, u32::from(index));
        }

        Ok(ExportTable {
            ordinal_base,
            by_ordinal,
            by_name,
        })
    }

    /// Decodes the import directory into per-library descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageLoad`] if directory contents fall outside the image.
    pub fn imports(&self, name: &str) -> Result<Vec<ImportDescriptor>> {
        let Some((dir_rva, _)) = self.import_dir else {
            return Ok(Vec::new());
        };

        let mut descriptors = Vec::new();
        let mut descriptor = dir_rva as usize;

        loop {
            self.check_range(descriptor, 20, name, "import descriptor")?;
            let original_first_thunk = read_u32(&self.image, descriptor);
            let name_rva = read_u32(&self.image, descriptor + 12);
            let first_thunk = read_u32(&self.image, descriptor + 16);
            if name_rva == 0 && first_thunk == 0 {
                break;
            }

            let library = self.read_cstring(name_rva as usize, name)?;

            // The lookup table names the imports; the IAT receives the addresses.
            // Some linkers leave OriginalFirstThunk zero, in which case the IAT
            // doubles as the lookup table.
            let lookup_rva = if original_first_thunk != 0 {
                original_first_thunk
            } else {
                first_thunk
            } as usize;

            let mut entries = Vec::new();
            let mut index = 0usize;
            loop {
                let thunk_offset = lookup_rva + index * 8;
                self.check_range(thunk_offset, 8, name, "import thunk")?;
                let thunk = read_u64(&self.image, thunk_offset);
                if thunk == 0 {
                    break;
                }

                let target = if thunk & (1 << 63) != 0 {
                    ImportTarget::Ordinal((thunk & 0xFFFF) as u32)
                } else {
                    let by_name_rva = (thunk & 0x7FFF_FFFF) as usize;
                    // Skip the 2-byte hint before the symbol name.
                    ImportTarget::Name(self.read_cstring(by_name_rva + 2, name)?)
                };

                entries.push(ImportEntry {
                    target,
                    iat_rva: first_thunk + (index * 8) as u32,
                });
                index += 1;
            }

            descriptors.push(ImportDescriptor { library, entries });
            descriptor += 20;
        }

        Ok(descriptors)
    }

    /// Decodes the TLS directory, if present.
    #[must_use]
    pub fn tls(&self) -> Option<TlsDirectory> {
        let (dir_rva, _) = self.tls_dir?;
        let dir = dir_rva as usize;
        if dir + 40 > self.image.len() {
            return None;
        }
        Some(TlsDirectory {
            start_of_raw_data: read_u64(&self.image, dir),
            end_of_raw_data: read_u64(&self.image, dir + 8),
            address_of_index: read_u64(&self.image, dir + 16),
            address_of_callbacks: read_u64(&self.image, dir + 24),
            size_of_zero_fill: read_u32(&self.image, dir + 32),
        })
    }

    /// Reads a NUL-terminated ASCII string at an RVA inside the laid-out image.
    fn read_cstring(&self, rva: usize, name: &str) -> Result<String> {
        let tail = self.image.get(rva..).ok_or_else(|| Error::ImageLoad {
            module: name.to_string(),
            reason: format!("string RVA {rva:#x} is outside the image"),
        })?;
        let len = tail.iter().position(|&b| b == 0).ok_or_else(|| Error::ImageLoad {
            module: name.to_string(),
            reason: format!("unterminated string at RVA {rva:#x}"),
        })?;
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }

    fn check_range(&self, offset: usize, len: usize, name: &str, what: &str) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.image.len()) {
            return Err(Error::ImageLoad {
                module: name.to_string(),
                reason: format!("{what} extends beyond image bounds"),
            });
        }
        Ok(())
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::pe::PeBuilder;

    #[test]
    fn test_parse_minimal_image() {
        let bytes = PeBuilder::new(0x1_4000_0000)
            .entry_point(0x1000)
            .text(&[0x0F, 0x05, 0xC3])
            .build();

        let pe = PeFile::parse(&bytes, "test.exe").unwrap();
        assert_eq!(pe.preferred_base, 0x1_4000_0000);
        assert_eq!(pe.entry_point_rva, Some(0x1000));
        assert_eq!(pe.sections.len(), 2);
        assert!(pe.sections[0].protection.contains(MemoryProtection::EXECUTE));
        assert_eq!(&pe.image[0x1000..0x1003], &[0x0F, 0x05, 0xC3]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            PeFile::parse(&[0u8; 64], "bad.dll"),
            Err(Error::ImageLoad { .. })
        ));
    }

    #[test]
    fn test_exports_by_name_and_ordinal() {
        let bytes = PeBuilder::new(0x1_8000_0000)
            .dll()
            .text(&[0xC3])
            .export("DoThing", 0x1000)
            .export("DoOther", 0x1010)
            .build();

        let pe = PeFile::parse(&bytes, "dep.dll").unwrap();
        let exports = pe.exports("dep.dll").unwrap();

        assert_eq!(
            exports.find_by_name("DoThing"),
            Some(&ExportEntry::Rva(0x1000))
        );
        assert_eq!(
            exports.find_by_name("DoOther"),
            Some(&ExportEntry::Rva(0x1010))
        );
        assert_eq!(exports.find_by_name("Missing"), None);

        let ordinal = exports.ordinal_base + exports.by_name["DoThing"];
        assert_eq!(exports.find_by_ordinal(ordinal), Some(&ExportEntry::Rva(0x1000)));
    }

    #[test]
    fn test_imports_list_iat_slots() {
        let bytes = PeBuilder::new(0x1_4000_0000)
            .entry_point(0x1000)
            .text(&[0xC3])
            .import("dep.dll", &["DoThing", "DoOther"])
            .build();

        let pe = PeFile::parse(&bytes, "test.exe").unwrap();
        let imports = pe.imports("test.exe").unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].library, "dep.dll");
        assert_eq!(imports[0].entries.len(), 2);
        assert_eq!(
            imports[0].entries[0].target,
            ImportTarget::Name("DoThing".to_string())
        );
        // IAT slots are consecutive 8-byte cells.
        assert_eq!(
            imports[0].entries[1].iat_rva,
            imports[0].entries[0].iat_rva + 8
        );
    }

    #[test]
    fn test_relocation_fixes_dir64() {
        let bytes = PeBuilder::new(0x1_4000_0000)
            .entry_point(0x1000)
            .text(&[0xC3])
            // A data cell holding an absolute pointer into the image.
            .data_u64(0x2000, 0x1_4000_1000)
            .reloc_dir64(0x2000)
            .build();

        let mut pe = PeFile::parse(&bytes, "test.exe").unwrap();
        pe.relocate(0x1_5000_0000, "test.exe").unwrap();
        assert_eq!(read_u64(&pe.image, 0x2000), 0x1_5000_1000);
    }

    #[test]
    fn test_relocation_without_directory_fails() {
        let bytes = PeBuilder::new(0x1_4000_0000)
            .entry_point(0x1000)
            .text(&[0xC3])
            .build();

        let mut pe = PeFile::parse(&bytes, "test.exe").unwrap();
        assert!(pe.relocate(0x1_5000_0000, "test.exe").is_err());
        // Staying at the preferred base needs no relocations.
        assert!(pe.relocate(0x1_4000_0000, "test.exe").is_ok());
    }
}
