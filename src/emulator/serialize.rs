//! Emulator snapshot serialization.
//!
//! The stream layout (after the magic/version header) is a fixed section order:
//! modules (with the stub trampoline table), memory regions (metadata, then the
//! bytes of committed regions), the object table, the handle table, per-thread
//! state (engine register blobs included), process scalars (PEB, clocks, RNG) and
//! emulator scalars, terminated by the CRC. Every map is written in a defined
//! order, so re-serializing a restored world yields the identical byte stream.

use std::collections::BTreeMap;

use crate::{
    cpu::{CpuEngine, X64Register},
    memory::{MemoryProtection, MemoryRegion, RegionState, RegionTag},
    module::{BoundImport, ExportEntry, ExportTable, Module, SectionInfo, TlsDirectory},
    process::{
        Apc, EmulatedThread, EventObject, FileBacking, FileObject, HandleEntry, HandleTable,
        HandleType, KernelObject, MutantObject, ObjectEntry, ObjectId, ObjectTable, ProcessClocks,
        SectionObject, SemaphoreObject, TimerObject, WaitKind, WaitRequest, WaitState,
    },
    snapshot::{BufferReader, BufferWriter},
    syscalls::NtStatus,
    Error, Result,
};

use super::Emulator;

impl Emulator {
    /// Serializes the complete observable state into a framed byte stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if a committed region cannot be read
    /// back from the engine (map desynchronization).
    pub fn serialize(&mut self) -> Result<Vec<u8>> {
        let mut writer = BufferWriter::new();

        // Modules + stubs.
        let modules: Vec<&Module> = self.modules.modules().collect();
        writer.write_u32(modules.len() as u32);
        for module in modules {
            write_module(&mut writer, module);
        }
        writer.write_u32(self.modules.next_tls_index);
        writer.write_u64(self.modules.stubs.region);
        writer.write_u64(self.modules.stubs.next);
        writer.write_u32(self.modules.stubs.by_address.len() as u32);
        for (address, (library, symbol)) in &self.modules.stubs.by_address {
            writer.write_u64(*address);
            writer.write_string(library);
            writer.write_string(symbol);
        }

        // Memory regions: metadata, then committed bytes.
        let regions: Vec<MemoryRegion> = self.memory.regions().cloned().collect();
        writer.write_u32(regions.len() as u32);
        for region in &regions {
            writer.write_u64(region.base);
            writer.write_u64(region.size);
            writer.write_bool(region.state == RegionState::Committed);
            writer.write_u32(region.protection.bits());
            writer.write_u8(tag_to_u8(region.tag));
            writer.write_u64(region.allocation_base);
            writer.write_u32(region.allocation_protection.bits());
            if region.state == RegionState::Committed {
                let mut bytes = vec![0u8; region.size as usize];
                if !self.cpu.read_memory(region.base, &mut bytes) {
                    return Err(Error::InvalidAddress {
                        address: region.base,
                        reason: "committed region missing from the engine".into(),
                    });
                }
                writer.write_bytes(&bytes);
            }
        }

        // Object table.
        let object_slots = self.process.objects.slots();
        writer.write_u32(object_slots.len() as u32);
        for slot in object_slots {
            match slot {
                Some(entry) => {
                    writer.write_bool(true);
                    writer.write_u32(entry.refs);
                    write_object(&mut writer, &entry.object);
                }
                None => writer.write_bool(false),
            }
        }

        // Handle table.
        let handle_slots: Vec<(u16, Option<HandleEntry>)> = self
            .process
            .handles
            .slots()
            .map(|(generation, entry)| (generation, entry.cloned()))
            .collect();
        writer.write_u32(handle_slots.len() as u32);
        for (generation, entry) in &handle_slots {
            writer.write_u16(*generation);
            match entry {
                Some(entry) => {
                    writer.write_bool(true);
                    writer.write_u32(entry.object.0);
                    writer.write_u8(entry.ty as u8);
                    writer.write_u32(entry.access);
                    writer.write_bool(entry.inherit);
                }
                None => writer.write_bool(false),
            }
        }

        // Threads; the active thread's registers are captured fresh.
        let active_blob = self
            .process
            .active_tid
            .map(|_| self.cpu.save_registers());
        writer.write_u32(self.process.threads.len() as u32);
        for (tid, thread) in &self.process.threads {
            writer.write_u32(*tid);
            writer.write_u32(thread.object.0);
            let blob = if Some(*tid) == self.process.active_tid {
                active_blob.as_deref().unwrap_or(&thread.registers)
            } else {
                &thread.registers
            };
            writer.write_bytes(blob);
            writer.write_u64(thread.teb);
            writer.write_u64(thread.stack_base);
            writer.write_u64(thread.stack_size);
            writer.write_u32(thread.suspend_count);
            writer.write_i32(thread.priority);
            writer.write_u64(thread.affinity);
            writer.write_u8(state_to_u8(thread.state));
            match &thread.wait {
                Some(wait) => {
                    writer.write_bool(true);
                    writer.write_u32(wait.objects.len() as u32);
                    for object in &wait.objects {
                        writer.write_u32(object.0);
                    }
                    writer.write_bool(wait.kind == WaitKind::All);
                    writer.write_opt_u64(wait.deadline);
                    writer.write_bool(wait.alertable);
                }
                None => writer.write_bool(false),
            }
            writer.write_opt_u32(thread.pending_status.map(|status| status.0));
            write_apcs(&mut writer, thread.user_apcs.iter());
            write_apcs(&mut writer, thread.kernel_apcs.iter());
            writer.write_u32(thread.last_status.0);
            writer.write_opt_u32(thread.exit_code);
            writer.write_u64(thread.instructions);
        }

        // Process scalars.
        writer.write_u64(self.process.peb);
        writer.write_u64(self.process.image_base);
        writer.write_utf16(&self.process.command_line);
        writer.write_utf16(&self.process.environment);
        writer.write_opt_u32(self.process.active_tid);
        writer.write_u32(self.process.ready_queue.len() as u32);
        for tid in &self.process.ready_queue {
            writer.write_u32(*tid);
        }
        writer.write_u32(self.process.next_tid());
        let (relative, steady, system_base, offset) = self.process.clocks.to_raw();
        writer.write_bool(relative);
        writer.write_u64(steady);
        writer.write_u64(system_base);
        writer.write_u64(offset);
        writer.write_u64(self.process.rng_state);
        writer.write_opt_u32(self.process.exit_status);

        // Emulator scalars.
        writer.write_bool(self.switch_pending);
        writer.write_bool(self.reached_main);
        writer.write_u64(self.entry_point);
        let ports: BTreeMap<u16, u16> = self
            .port_mappings
            .iter()
            .map(|(port, mapped)| (*port, *mapped))
            .collect();
        writer.write_u32(ports.len() as u32);
        for (port, mapped) in ports {
            writer.write_u16(port);
            writer.write_u16(mapped);
        }
        writer.write_bytes(&self.stdout_buffer);

        Ok(writer.finish())
    }

    /// Restores the complete observable state from a stream produced by
    /// [`serialize`](Self::serialize): wipes guest memory, replays the region
    /// map into the engine, and reinstates modules, objects, handles, threads,
    /// clocks and the active register file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Snapshot`] for framing, CRC or content failures.
    pub fn deserialize(&mut self, stream: &[u8]) -> Result<()> {
        let mut reader = BufferReader::new(stream)?;

        // Modules + stubs.
        let module_count = reader.read_u32()?;
        let mut modules = BTreeMap::new();
        for _ in 0..module_count {
            let module = read_module(&mut reader)?;
            modules.insert(module.base, module);
        }
        let next_tls_index = reader.read_u32()?;
        let stub_region = reader.read_u64()?;
        let stub_next = reader.read_u64()?;
        let stub_count = reader.read_u32()?;
        let mut stub_map = BTreeMap::new();
        for _ in 0..stub_count {
            let address = reader.read_u64()?;
            let library = reader.read_string()?;
            let symbol = reader.read_string()?;
            stub_map.insert(address, (library, symbol));
        }

        // Memory regions.
        let region_count = reader.read_u32()?;
        let mut regions = Vec::with_capacity(region_count as usize);
        for _ in 0..region_count {
            let base = reader.read_u64()?;
            let size = reader.read_u64()?;
            let committed = reader.read_bool()?;
            let protection = MemoryProtection::from_bits_retain(reader.read_u32()?);
            let tag = tag_from_u8(reader.read_u8()?)?;
            let allocation_base = reader.read_u64()?;
            let allocation_protection = MemoryProtection::from_bits_retain(reader.read_u32()?);
            let bytes = if committed { Some(reader.read_vec()?) } else { None };
            regions.push((
                MemoryRegion {
                    base,
                    size,
                    state: if committed {
                        RegionState::Committed
                    } else {
                        RegionState::Reserved
                    },
                    protection,
                    tag,
                    allocation_base,
                    allocation_protection,
                },
                bytes,
            ));
        }

        // Object table.
        let object_slot_count = reader.read_u32()?;
        let mut object_slots = Vec::with_capacity(object_slot_count as usize);
        for _ in 0..object_slot_count {
            if reader.read_bool()? {
                let refs = reader.read_u32()?;
                let object = read_object(&mut reader)?;
                object_slots.push(Some(ObjectEntry { object, refs }));
            } else {
                object_slots.push(None);
            }
        }

        // Handle table.
        let handle_slot_count = reader.read_u32()?;
        let mut handle_slots = Vec::with_capacity(handle_slot_count as usize);
        for _ in 0..handle_slot_count {
            let generation = reader.read_u16()?;
            let entry = if reader.read_bool()? {
                let object = ObjectId(reader.read_u32()?);
                let ty = HandleType::from_u8(reader.read_u8()?)
                    .ok_or_else(|| Error::Snapshot("bad handle type tag".into()))?;
                let access = reader.read_u32()?;
                let inherit = reader.read_bool()?;
                Some(HandleEntry {
                    object,
                    ty,
                    access,
                    inherit,
                })
            } else {
                None
            };
            handle_slots.push((generation, entry));
        }

        // Threads.
        let thread_count = reader.read_u32()?;
        let mut threads = BTreeMap::new();
        for _ in 0..thread_count {
            let id = reader.read_u32()?;
            let object = ObjectId(reader.read_u32()?);
            let registers = reader.read_vec()?;
            let teb = reader.read_u64()?;
            let stack_base = reader.read_u64()?;
            let stack_size = reader.read_u64()?;
            let suspend_count = reader.read_u32()?;
            let priority = reader.read_i32()?;
            let affinity = reader.read_u64()?;
            let state = state_from_u8(reader.read_u8()?)?;
            let wait = if reader.read_bool()? {
                let object_count = reader.read_u32()?;
                let mut objects = Vec::with_capacity(object_count as usize);
                for _ in 0..object_count {
                    objects.push(ObjectId(reader.read_u32()?));
                }
                let all = reader.read_bool()?;
                let deadline = reader.read_opt_u64()?;
                let alertable = reader.read_bool()?;
                Some(WaitRequest {
                    objects,
                    kind: if all { WaitKind::All } else { WaitKind::Any },
                    deadline,
                    alertable,
                })
            } else {
                None
            };
            let pending_status = reader.read_opt_u32()?.map(NtStatus);
            let user_apcs = read_apcs(&mut reader)?;
            let kernel_apcs = read_apcs(&mut reader)?;
            let last_status = NtStatus(reader.read_u32()?);
            let exit_code = reader.read_opt_u32()?;
            let instructions = reader.read_u64()?;

            threads.insert(
                id,
                EmulatedThread {
                    id,
                    object,
                    registers,
                    teb,
                    stack_base,
                    stack_size,
                    suspend_count,
                    priority,
                    affinity,
                    state,
                    wait,
                    pending_status,
                    user_apcs,
                    kernel_apcs,
                    last_status,
                    exit_code,
                    instructions,
                },
            );
        }

        // Process scalars.
        let peb = reader.read_u64()?;
        let image_base = reader.read_u64()?;
        let command_line = reader.read_utf16()?;
        let environment = reader.read_utf16()?;
        let active_tid = reader.read_opt_u32()?;
        let ready_count = reader.read_u32()?;
        let mut ready_queue = std::collections::VecDeque::with_capacity(ready_count as usize);
        for _ in 0..ready_count {
            ready_queue.push_back(reader.read_u32()?);
        }
        let next_tid = reader.read_u32()?;
        let relative = reader.read_bool()?;
        let steady = reader.read_u64()?;
        let system_base = reader.read_u64()?;
        let clock_offset = reader.read_u64()?;
        let rng_state = reader.read_u64()?;
        let exit_status = reader.read_opt_u32()?;

        // Emulator scalars.
        let switch_pending = reader.read_bool()?;
        let reached_main = reader.read_bool()?;
        let entry_point = reader.read_u64()?;
        let port_count = reader.read_u32()?;
        let mut port_mappings = std::collections::HashMap::new();
        for _ in 0..port_count {
            let port = reader.read_u16()?;
            let mapped = reader.read_u16()?;
            port_mappings.insert(port, mapped);
        }
        let stdout_buffer = reader.read_vec()?;

        // Everything parsed; install the new world.
        self.memory.clear(self.cpu.as_mut());
        for (region, bytes) in regions {
            let base = region.base;
            self.memory.insert_region(self.cpu.as_mut(), region);
            if let Some(bytes) = bytes {
                if !self.cpu.write_memory(base, &bytes) {
                    return Err(Error::Snapshot(format!(
                        "failed to replay region bytes at {base:#x}"
                    )));
                }
            }
        }

        self.modules.modules = modules;
        self.modules.next_tls_index = next_tls_index;
        self.modules.stubs.region = stub_region;
        self.modules.stubs.next = stub_next;
        self.modules.stubs.by_address = stub_map;
        self.modules.stubs.rebuild_index();

        self.process.objects = ObjectTable::from_slots(object_slots);
        self.process.handles = HandleTable::from_slots(handle_slots);
        self.process.threads = threads;
        self.process.peb = peb;
        self.process.image_base = image_base;
        self.process.command_line = command_line;
        self.process.environment = environment;
        self.process.active_tid = active_tid;
        self.process.ready_queue = ready_queue;
        self.process.set_next_tid(next_tid);
        self.process.clocks = ProcessClocks::from_raw(relative, steady, system_base, clock_offset);
        self.process.rng_state = rng_state;
        self.process.exit_status = exit_status;

        self.switch_pending = switch_pending;
        self.reached_main = reached_main;
        self.entry_point = entry_point;
        self.port_mappings = port_mappings;
        self.stdout_buffer = stdout_buffer;

        // Reinstate the active thread's register file in the engine.
        if let Some(tid) = self.process.active_tid {
            let blob = self
                .process
                .threads
                .get(&tid)
                .map(|thread| thread.registers.clone())
                .ok_or_else(|| Error::Snapshot("active thread missing from table".into()))?;
            self.cpu.restore_registers(&blob)?;
            let teb = self.process.threads[&tid].teb;
            self.cpu.write_u64(X64Register::GsBase, teb);
        }

        Ok(())
    }
}

fn write_module(writer: &mut BufferWriter, module: &Module) {
    writer.write_string(&module.name);
    match &module.path {
        Some(path) => {
            writer.write_bool(true);
            writer.write_string(&path.to_string_lossy());
        }
        None => writer.write_bool(false),
    }
    writer.write_u64(module.base);
    writer.write_u64(module.size);
    writer.write_opt_u64(module.entry_point);
    writer.write_bool(module.is_primary);

    writer.write_u32(module.sections.len() as u32);
    for section in &module.sections {
        writer.write_string(&section.name);
        writer.write_u32(section.virtual_address);
        writer.write_u32(section.virtual_size);
        writer.write_u32(section.raw_data_offset);
        writer.write_u32(section.raw_data_size);
        writer.write_u32(section.characteristics);
        writer.write_u32(section.protection.bits());
    }

    writer.write_u32(module.exports.ordinal_base);
    writer.write_u32(module.exports.by_ordinal.len() as u32);
    for entry in &module.exports.by_ordinal {
        match entry {
            None => writer.write_u8(0),
            Some(ExportEntry::Rva(rva)) => {
                writer.write_u8(1);
                writer.write_u32(*rva);
            }
            Some(ExportEntry::Forwarder(target)) => {
                writer.write_u8(2);
                writer.write_string(target);
            }
        }
    }
    let mut names: Vec<(&String, &u32)> = module.exports.by_name.iter().collect();
    names.sort();
    writer.write_u32(names.len() as u32);
    for (name, index) in names {
        writer.write_string(name);
        writer.write_u32(*index);
    }

    writer.write_u32(module.imports.len() as u32);
    for import in &module.imports {
        writer.write_string(&import.library);
        writer.write_string(&import.symbol);
        writer.write_u64(import.iat_address);
        writer.write_u64(import.target);
    }

    match &module.tls {
        Some((directory, index)) => {
            writer.write_bool(true);
            writer.write_u64(directory.start_of_raw_data);
            writer.write_u64(directory.end_of_raw_data);
            writer.write_u64(directory.address_of_index);
            writer.write_u64(directory.address_of_callbacks);
            writer.write_u32(directory.size_of_zero_fill);
            writer.write_u32(*index);
        }
        None => writer.write_bool(false),
    }
}

fn read_module(reader: &mut BufferReader<'_>) -> Result<Module> {
    let name = reader.read_string()?;
    let path = if reader.read_bool()? {
        Some(std::path::PathBuf::from(reader.read_string()?))
    } else {
        None
    };
    let base = reader.read_u64()?;
    let size = reader.read_u64()?;
    let entry_point = reader.read_opt_u64()?;
    let is_primary = reader.read_bool()?;

    let section_count = reader.read_u32()?;
    let mut sections = Vec::with_capacity(section_count as usize);
    for _ in 0..section_count {
        sections.push(SectionInfo {
            name: reader.read_string()?,
            virtual_address: reader.read_u32()?,
            virtual_size: reader.read_u32()?,
            raw_data_offset: reader.read_u32()?,
            raw_data_size: reader.read_u32()?,
            characteristics: reader.read_u32()?,
            protection: MemoryProtection::from_bits_retain(reader.read_u32()?),
        });
    }

    let ordinal_base = reader.read_u32()?;
    let ordinal_count = reader.read_u32()?;
    let mut by_ordinal = Vec::with_capacity(ordinal_count as usize);
    for _ in 0..ordinal_count {
        by_ordinal.push(match reader.read_u8()? {
            0 => None,
            1 => Some(ExportEntry::Rva(reader.read_u32()?)),
            2 => Some(ExportEntry::Forwarder(reader.read_string()?)),
            tag => return Err(Error::Snapshot(format!("bad export tag {tag}"))),
        });
    }
    let name_count = reader.read_u32()?;
    let mut by_name = rustc_hash::FxHashMap::default();
    for _ in 0..name_count {
        let export_name = reader.read_string()?;
        let index = reader.read_u32()?;
        by_name.insert(export_name, index);
    }

    let import_count = reader.read_u32()?;
    let mut imports = Vec::with_capacity(import_count as usize);
    for _ in 0..import_count {
        imports.push(BoundImport {
            library: reader.read_string()?,
            symbol: reader.read_string()?,
            iat_address: reader.read_u64()?,
            target: reader.read_u64()?,
        });
    }

    let tls = if reader.read_bool()? {
        let directory = TlsDirectory {
            start_of_raw_data: reader.read_u64()?,
            end_of_raw_data: reader.read_u64()?,
            address_of_index: reader.read_u64()?,
            address_of_callbacks: reader.read_u64()?,
            size_of_zero_fill: reader.read_u32()?,
        };
        let index = reader.read_u32()?;
        Some((directory, index))
    } else {
        None
    };

    Ok(Module {
        name,
        path,
        base,
        size,
        entry_point,
        sections,
        exports: ExportTable {
            ordinal_base,
            by_ordinal,
            by_name,
        },
        imports,
        tls,
        is_primary,
    })
}

fn write_object(writer: &mut BufferWriter, object: &KernelObject) {
    match object {
        KernelObject::Event(event) => {
            writer.write_u8(1);
            writer.write_bool(event.manual_reset);
            writer.write_bool(event.signaled);
        }
        KernelObject::Mutant(mutant) => {
            writer.write_u8(2);
            writer.write_opt_u32(mutant.owner);
            writer.write_u32(mutant.recursion);
            writer.write_bool(mutant.abandoned);
        }
        KernelObject::Semaphore(semaphore) => {
            writer.write_u8(3);
            writer.write_u32(semaphore.count);
            writer.write_u32(semaphore.maximum);
        }
        KernelObject::Timer(timer) => {
            writer.write_u8(4);
            writer.write_bool(timer.manual_reset);
            writer.write_bool(timer.signaled);
            writer.write_opt_u64(timer.due_time);
        }
        KernelObject::Section(section) => {
            writer.write_u8(5);
            writer.write_u64(section.size);
        }
        KernelObject::File(file) => {
            writer.write_u8(6);
            match &file.backing {
                FileBacking::Stdin => writer.write_u8(0),
                FileBacking::Stdout => writer.write_u8(1),
                FileBacking::Stderr => writer.write_u8(2),
                FileBacking::Host(path) => {
                    writer.write_u8(3);
                    writer.write_string(path);
                }
            }
            writer.write_u64(file.position);
        }
        KernelObject::Key(path) => {
            writer.write_u8(7);
            writer.write_string(path);
        }
        KernelObject::Thread(tid) => {
            writer.write_u8(8);
            writer.write_u32(*tid);
        }
        KernelObject::Directory(name) => {
            writer.write_u8(9);
            writer.write_string(name);
        }
        KernelObject::SymbolicLink(target) => {
            writer.write_u8(10);
            writer.write_string(target);
        }
        KernelObject::Token => writer.write_u8(11),
        KernelObject::Port(name) => {
            writer.write_u8(12);
            writer.write_string(name);
        }
        KernelObject::IoCompletion => writer.write_u8(13),
    }
}

fn read_object(reader: &mut BufferReader<'_>) -> Result<KernelObject> {
    Ok(match reader.read_u8()? {
        1 => KernelObject::Event(EventObject {
            manual_reset: reader.read_bool()?,
            signaled: reader.read_bool()?,
        }),
        2 => KernelObject::Mutant(MutantObject {
            owner: reader.read_opt_u32()?,
            recursion: reader.read_u32()?,
            abandoned: reader.read_bool()?,
        }),
        3 => KernelObject::Semaphore(SemaphoreObject {
            count: reader.read_u32()?,
            maximum: reader.read_u32()?,
        }),
        4 => KernelObject::Timer(TimerObject {
            manual_reset: reader.read_bool()?,
            signaled: reader.read_bool()?,
            due_time: reader.read_opt_u64()?,
        }),
        5 => KernelObject::Section(SectionObject {
            size: reader.read_u64()?,
        }),
        6 => {
            let backing = match reader.read_u8()? {
                0 => FileBacking::Stdin,
                1 => FileBacking::Stdout,
                2 => FileBacking::Stderr,
                3 => FileBacking::Host(reader.read_string()?),
                tag => return Err(Error::Snapshot(format!("bad file backing tag {tag}"))),
            };
            KernelObject::File(FileObject {
                backing,
                position: reader.read_u64()?,
            })
        }
        7 => KernelObject::Key(reader.read_string()?),
        8 => KernelObject::Thread(reader.read_u32()?),
        9 => KernelObject::Directory(reader.read_string()?),
        10 => KernelObject::SymbolicLink(reader.read_string()?),
        11 => KernelObject::Token,
        12 => KernelObject::Port(reader.read_string()?),
        13 => KernelObject::IoCompletion,
        tag => return Err(Error::Snapshot(format!("bad object tag {tag}"))),
    })
}

fn write_apcs<'a>(writer: &mut BufferWriter, apcs: impl ExactSizeIterator<Item = &'a Apc>) {
    writer.write_u32(apcs.len() as u32);
    for apc in apcs {
        writer.write_u64(apc.routine);
        writer.write_u64(apc.argument1);
        writer.write_u64(apc.argument2);
        writer.write_u64(apc.argument3);
    }
}

fn read_apcs(reader: &mut BufferReader<'_>) -> Result<std::collections::VecDeque<Apc>> {
    let count = reader.read_u32()?;
    let mut apcs = std::collections::VecDeque::with_capacity(count as usize);
    for _ in 0..count {
        apcs.push_back(Apc {
            routine: reader.read_u64()?,
            argument1: reader.read_u64()?,
            argument2: reader.read_u64()?,
            argument3: reader.read_u64()?,
        });
    }
    Ok(apcs)
}

fn tag_to_u8(tag: RegionTag) -> u8 {
    match tag {
        RegionTag::Private => 0,
        RegionTag::Image => 1,
        RegionTag::Stack => 2,
        RegionTag::Heap => 3,
        RegionTag::MappedFile => 4,
    }
}

fn tag_from_u8(value: u8) -> Result<RegionTag> {
    Ok(match value {
        0 => RegionTag::Private,
        1 => RegionTag::Image,
        2 => RegionTag::Stack,
        3 => RegionTag::Heap,
        4 => RegionTag::MappedFile,
        tag => return Err(Error::Snapshot(format!("bad region tag {tag}"))),
    })
}

fn state_to_u8(state: WaitState) -> u8 {
    match state {
        WaitState::Runnable => 0,
        WaitState::Waiting => 1,
        WaitState::Suspended => 2,
        WaitState::Terminated => 3,
    }
}

fn state_from_u8(value: u8) -> Result<WaitState> {
    Ok(match value {
        0 => WaitState::Runnable,
        1 => WaitState::Waiting,
        2 => WaitState::Suspended,
        3 => WaitState::Terminated,
        tag => return Err(Error::Snapshot(format!("bad thread state tag {tag}"))),
    })
}
