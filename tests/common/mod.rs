//! Shared test support for the integration suite: a scripted CPU engine, a tiny
//! assembler for its micro-op ISA, and a synthetic PE builder.
//!
//! The scripted engine implements [`CpuEngine`] over guest memory itself: code
//! bytes mapped into the guest encode micro-ops the engine fetches, decodes and
//! retires, honoring the page protections the memory manager mirrored down. That
//! is enough to drive real end-to-end scenarios - multi-threaded guests issuing
//! syscalls, faulting on protected pages, spinning loops - without a real CPU
//! backend.

#![allow(dead_code)]

use std::collections::BTreeMap;

use ntcradle::{
    memory::{MemoryProtection, PAGE_SIZE},
    AccessKind, CpuEngine, CpuExit, CpuStep, Error, Result, X64Register,
};

/// Register encoding used by the micro-op ISA (matches x64 numbering).
pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;

fn register_from_id(id: u8) -> X64Register {
    match id {
        RAX => X64Register::Rax,
        RCX => X64Register::Rcx,
        RDX => X64Register::Rdx,
        RBX => X64Register::Rbx,
        RSP => X64Register::Rsp,
        RBP => X64Register::Rbp,
        RSI => X64Register::Rsi,
        RDI => X64Register::Rdi,
        R8 => X64Register::R8,
        R9 => X64Register::R9,
        R10 => X64Register::R10,
        R11 => X64Register::R11,
        R12 => X64Register::R12,
        R13 => X64Register::R13,
        R14 => X64Register::R14,
        _ => X64Register::R15,
    }
}

/// A CPU engine interpreting the micro-op ISA out of guest memory.
pub struct ScriptedCpu {
    registers: BTreeMap<u8, u64>,
    pages: BTreeMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
    protections: BTreeMap<u64, MemoryProtection>,
    stop_requested: bool,
}

impl Default for ScriptedCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCpu {
    pub fn new() -> Self {
        Self {
            registers: BTreeMap::new(),
            pages: BTreeMap::new(),
            protections: BTreeMap::new(),
            stop_requested: false,
        }
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    /// Engine-side protection of the page covering `address`.
    pub fn protection_at(&self, address: u64) -> Option<MemoryProtection> {
        self.protections.get(&(address & !(PAGE_SIZE - 1))).copied()
    }

    fn reg(&self, id: u8) -> u64 {
        let key = register_key(register_from_id(id));
        self.registers.get(&key).copied().unwrap_or(0)
    }

    fn set_reg(&mut self, id: u8, value: u64) {
        let key = register_key(register_from_id(id));
        self.registers.insert(key, value);
    }

    fn host_read(&self, address: u64, buf: &mut [u8]) -> bool {
        let mut cursor = address;
        let mut copied = 0usize;
        while copied < buf.len() {
            let page = cursor & !(PAGE_SIZE - 1);
            let offset = (cursor - page) as usize;
            let Some(data) = self.pages.get(&page) else {
                return false;
            };
            let take = (PAGE_SIZE as usize - offset).min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&data[offset..offset + take]);
            copied += take;
            cursor += take as u64;
        }
        true
    }

    fn host_write(&mut self, address: u64, data: &[u8]) -> bool {
        let mut cursor = address;
        let mut written = 0usize;
        while written < data.len() {
            let page = cursor & !(PAGE_SIZE - 1);
            let offset = (cursor - page) as usize;
            let Some(slot) = self.pages.get_mut(&page) else {
                return false;
            };
            let take = (PAGE_SIZE as usize - offset).min(data.len() - written);
            slot[offset..offset + take].copy_from_slice(&data[written..written + take]);
            written += take;
            cursor += take as u64;
        }
        true
    }

    /// Guest-semantics access check over a byte range.
    fn check(&self, address: u64, len: u64, needed: MemoryProtection) -> bool {
        let end = address + len;
        let mut page = address & !(PAGE_SIZE - 1);
        while page < end {
            let Some(protection) = self.protections.get(&page) else {
                return false;
            };
            if !protection.contains(needed) || protection.contains(MemoryProtection::GUARD) {
                return false;
            }
            page += PAGE_SIZE;
        }
        true
    }

    fn guest_read_u64(&self, address: u64) -> Option<u64> {
        if !self.check(address, 8, MemoryProtection::READ) {
            return None;
        }
        let mut buf = [0u8; 8];
        if !self.host_read(address, &mut buf) {
            return None;
        }
        Some(u64::from_le_bytes(buf))
    }

    fn guest_write_u64(&mut self, address: u64, value: u64) -> bool {
        if !self.check(address, 8, MemoryProtection::WRITE) {
            return false;
        }
        self.host_write(address, &value.to_le_bytes())
    }

    fn fetch(&self, rip: u64, len: u64) -> Option<Vec<u8>> {
        if !self.check(rip, len, MemoryProtection::EXECUTE) {
            return None;
        }
        let mut buf = vec![0u8; len as usize];
        if !self.host_read(rip, &mut buf) {
            return None;
        }
        Some(buf)
    }
}

fn register_key(reg: X64Register) -> u8 {
    reg as u8
}

impl CpuEngine for ScriptedCpu {
    fn run(&mut self, max_instructions: u64) -> Result<CpuStep> {
        let mut executed = 0u64;
        loop {
            if self.stop_requested {
                self.stop_requested = false;
                return Ok(CpuStep {
                    exit: CpuExit::Stopped,
                    executed,
                });
            }
            if max_instructions > 0 && executed >= max_instructions {
                return Ok(CpuStep {
                    exit: CpuExit::InstructionLimit,
                    executed,
                });
            }

            let rip = self.read_u64(X64Register::Rip);
            let violation = move |address| CpuStep {
                exit: CpuExit::AccessViolation {
                    address,
                    access: AccessKind::Execute,
                },
                executed,
            };
            let Some(head) = self.fetch(rip, 1) else {
                return Ok(violation(rip));
            };

            match head[0] {
                // nop
                0x90 => {
                    self.write_u64(X64Register::Rip, rip + 1);
                    executed += 1;
                }
                // syscall
                0x0F => {
                    let Some(body) = self.fetch(rip, 2) else {
                        return Ok(violation(rip));
                    };
                    if body[1] != 0x05 {
                        return Err(Error::Engine(format!(
                            "undecodable opcode 0f {:02x} at {rip:#x}",
                            body[1]
                        )));
                    }
                    executed += 1;
                    return Ok(CpuStep {
                        exit: CpuExit::Syscall,
                        executed,
                    });
                }
                // ret
                0xC3 => {
                    let rsp = self.reg(RSP);
                    let Some(target) = self.guest_read_u64(rsp) else {
                        return Ok(CpuStep {
                            exit: CpuExit::AccessViolation {
                                address: rsp,
                                access: AccessKind::Read,
                            },
                            executed,
                        });
                    };
                    self.set_reg(RSP, rsp + 8);
                    self.write_u64(X64Register::Rip, target);
                    executed += 1;
                }
                // mov reg, imm64
                0xF0 => {
                    let Some(body) = self.fetch(rip, 10) else {
                        return Ok(violation(rip));
                    };
                    let value = u64::from_le_bytes(body[2..10].try_into().unwrap());
                    self.set_reg(body[1], value);
                    self.write_u64(X64Register::Rip, rip + 10);
                    executed += 1;
                }
                // jmp abs64
                0xF2 => {
                    let Some(body) = self.fetch(rip, 9) else {
                        return Ok(violation(rip));
                    };
                    let target = u64::from_le_bytes(body[1..9].try_into().unwrap());
                    self.write_u64(X64Register::Rip, target);
                    executed += 1;
                }
                // hlt
                0xF4 => {
                    executed += 1;
                    return Ok(CpuStep {
                        exit: CpuExit::Halted,
                        executed,
                    });
                }
                // load reg, [abs64]
                0xF5 => {
                    let Some(body) = self.fetch(rip, 10) else {
                        return Ok(violation(rip));
                    };
                    let address = u64::from_le_bytes(body[2..10].try_into().unwrap());
                    let Some(value) = self.guest_read_u64(address) else {
                        return Ok(CpuStep {
                            exit: CpuExit::AccessViolation {
                                address,
                                access: AccessKind::Read,
                            },
                            executed,
                        });
                    };
                    self.set_reg(body[1], value);
                    self.write_u64(X64Register::Rip, rip + 10);
                    executed += 1;
                }
                // dec reg; jnz abs64
                0xF6 => {
                    let Some(body) = self.fetch(rip, 10) else {
                        return Ok(violation(rip));
                    };
                    let target = u64::from_le_bytes(body[2..10].try_into().unwrap());
                    let value = self.reg(body[1]).wrapping_sub(1);
                    self.set_reg(body[1], value);
                    if value != 0 {
                        self.write_u64(X64Register::Rip, target);
                    } else {
                        self.write_u64(X64Register::Rip, rip + 10);
                    }
                    executed += 1;
                }
                // store [rsp+off32], imm64
                0xF8 => {
                    let Some(body) = self.fetch(rip, 13) else {
                        return Ok(violation(rip));
                    };
                    let offset = u32::from_le_bytes(body[1..5].try_into().unwrap());
                    let value = u64::from_le_bytes(body[5..13].try_into().unwrap());
                    let address = self.reg(RSP) + u64::from(offset);
                    if !self.guest_write_u64(address, value) {
                        return Ok(CpuStep {
                            exit: CpuExit::AccessViolation {
                                address,
                                access: AccessKind::Write,
                            },
                            executed,
                        });
                    }
                    self.write_u64(X64Register::Rip, rip + 13);
                    executed += 1;
                }
                // store [abs64], imm64
                0xF9 => {
                    let Some(body) = self.fetch(rip, 17) else {
                        return Ok(violation(rip));
                    };
                    let address = u64::from_le_bytes(body[1..9].try_into().unwrap());
                    let value = u64::from_le_bytes(body[9..17].try_into().unwrap());
                    if !self.guest_write_u64(address, value) {
                        return Ok(CpuStep {
                            exit: CpuExit::AccessViolation {
                                address,
                                access: AccessKind::Write,
                            },
                            executed,
                        });
                    }
                    self.write_u64(X64Register::Rip, rip + 17);
                    executed += 1;
                }
                // mov dst, src (registers)
                0xFA => {
                    let Some(body) = self.fetch(rip, 3) else {
                        return Ok(violation(rip));
                    };
                    let value = self.reg(body[2]);
                    self.set_reg(body[1], value);
                    self.write_u64(X64Register::Rip, rip + 3);
                    executed += 1;
                }
                // store [abs64], reg
                0xFB => {
                    let Some(body) = self.fetch(rip, 10) else {
                        return Ok(violation(rip));
                    };
                    let address = u64::from_le_bytes(body[2..10].try_into().unwrap());
                    let value = self.reg(body[1]);
                    if !self.guest_write_u64(address, value) {
                        return Ok(CpuStep {
                            exit: CpuExit::AccessViolation {
                                address,
                                access: AccessKind::Write,
                            },
                            executed,
                        });
                    }
                    self.write_u64(X64Register::Rip, rip + 10);
                    executed += 1;
                }
                opcode => {
                    return Err(Error::Engine(format!(
                        "undecodable opcode {opcode:02x} at {rip:#x}"
                    )));
                }
            }
        }
    }

    fn stop(&mut self) {
        self.stop_requested = true;
    }

    fn read_reg(&mut self, reg: X64Register, buf: &mut [u8]) -> usize {
        let value = self.registers.get(&register_key(reg)).copied().unwrap_or(0);
        let bytes = value.to_le_bytes();
        let len = buf.len().min(8);
        buf[..len].copy_from_slice(&bytes[..len]);
        reg.size()
    }

    fn write_reg(&mut self, reg: X64Register, data: &[u8]) -> usize {
        let mut bytes = [0u8; 8];
        let len = data.len().min(8);
        bytes[..len].copy_from_slice(&data[..len]);
        self.registers
            .insert(register_key(reg), u64::from_le_bytes(bytes));
        reg.size()
    }

    fn save_registers(&mut self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.registers.len() * 9);
        for (key, value) in &self.registers {
            blob.push(*key);
            blob.extend_from_slice(&value.to_le_bytes());
        }
        blob
    }

    fn restore_registers(&mut self, blob: &[u8]) -> Result<()> {
        if blob.len() % 9 != 0 {
            return Err(Error::Engine("malformed register blob".into()));
        }
        self.registers.clear();
        for chunk in blob.chunks_exact(9) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&chunk[1..9]);
            self.registers.insert(chunk[0], u64::from_le_bytes(bytes));
        }
        Ok(())
    }

    fn map_memory(&mut self, base: u64, size: u64, protection: MemoryProtection) -> bool {
        let mut page = base & !(PAGE_SIZE - 1);
        let end = base + size;
        while page < end {
            if self.pages.contains_key(&page) {
                return false;
            }
            page += PAGE_SIZE;
        }
        let mut page = base & !(PAGE_SIZE - 1);
        while page < end {
            self.pages.insert(page, Box::new([0u8; PAGE_SIZE as usize]));
            self.protections.insert(page, protection);
            page += PAGE_SIZE;
        }
        true
    }

    fn unmap_memory(&mut self, base: u64, size: u64) -> bool {
        let mut page = base & !(PAGE_SIZE - 1);
        let end = base + size;
        let mut any = false;
        while page < end {
            any |= self.pages.remove(&page).is_some();
            self.protections.remove(&page);
            page += PAGE_SIZE;
        }
        any
    }

    fn protect_memory(&mut self, base: u64, size: u64, protection: MemoryProtection) -> bool {
        let mut page = base & !(PAGE_SIZE - 1);
        let end = base + size;
        while page < end {
            if !self.pages.contains_key(&page) {
                return false;
            }
            self.protections.insert(page, protection);
            page += PAGE_SIZE;
        }
        true
    }

    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> bool {
        self.host_read(address, buf)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> bool {
        self.host_write(address, data)
    }
}

/// Assembler for the micro-op ISA.
pub struct Asm {
    base: u64,
    code: Vec<u8>,
}

impl Asm {
    /// Starts assembling at virtual address `base`.
    pub fn new(base: u64) -> Self {
        Self {
            base,
            code: Vec::new(),
        }
    }

    /// Address of the next instruction.
    pub fn here(&self) -> u64 {
        self.base + self.code.len() as u64
    }

    pub fn nop(&mut self) -> &mut Self {
        self.code.push(0x90);
        self
    }

    pub fn syscall(&mut self) -> &mut Self {
        self.code.extend_from_slice(&[0x0F, 0x05]);
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.code.push(0xC3);
        self
    }

    pub fn hlt(&mut self) -> &mut Self {
        self.code.push(0xF4);
        self
    }

    pub fn mov(&mut self, reg: u8, value: u64) -> &mut Self {
        self.code.push(0xF0);
        self.code.push(reg);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn movr(&mut self, dst: u8, src: u8) -> &mut Self {
        self.code.extend_from_slice(&[0xFA, dst, src]);
        self
    }

    pub fn jmp(&mut self, target: u64) -> &mut Self {
        self.code.push(0xF2);
        self.code.extend_from_slice(&target.to_le_bytes());
        self
    }

    pub fn load(&mut self, reg: u8, address: u64) -> &mut Self {
        self.code.push(0xF5);
        self.code.push(reg);
        self.code.extend_from_slice(&address.to_le_bytes());
        self
    }

    pub fn dec_jnz(&mut self, reg: u8, target: u64) -> &mut Self {
        self.code.push(0xF6);
        self.code.push(reg);
        self.code.extend_from_slice(&target.to_le_bytes());
        self
    }

    pub fn store_rsp(&mut self, offset: u32, value: u64) -> &mut Self {
        self.code.push(0xF8);
        self.code.extend_from_slice(&offset.to_le_bytes());
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn store(&mut self, address: u64, value: u64) -> &mut Self {
        self.code.push(0xF9);
        self.code.extend_from_slice(&address.to_le_bytes());
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn store_reg(&mut self, address: u64, reg: u8) -> &mut Self {
        self.code.push(0xFB);
        self.code.push(reg);
        self.code.extend_from_slice(&address.to_le_bytes());
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.code.clone()
    }
}

/// Synthetic PE32+ builder for the integration suite: `.text` (RX) at RVA 0x1000,
/// `.rdata` (R) at 0x2000 and `.data` (RW) at 0x3000.
pub struct GuestImage {
    image_base: u64,
    text: Vec<u8>,
    rdata_cells: Vec<(u32, Vec<u8>)>,
    data_cells: Vec<(u32, Vec<u8>)>,
}

/// Preferred image base used by the integration guests.
pub const IMAGE_BASE: u64 = 0x1_4000_0000;
/// VA of the `.text` section.
pub const TEXT_VA: u64 = IMAGE_BASE + 0x1000;
/// VA of the `.rdata` section.
pub const RDATA_VA: u64 = IMAGE_BASE + 0x2000;
/// VA of the `.data` section.
pub const DATA_VA: u64 = IMAGE_BASE + 0x3000;

impl GuestImage {
    pub fn new() -> Self {
        Self {
            image_base: IMAGE_BASE,
            text: Vec::new(),
            rdata_cells: Vec::new(),
            data_cells: Vec::new(),
        }
    }

    /// Sets the code of `.text`; the entry point is its first byte.
    pub fn code(mut self, code: Vec<u8>) -> Self {
        self.text = code;
        self
    }

    /// Places raw bytes at an offset inside `.rdata`.
    pub fn rdata(mut self, offset: u32, bytes: &[u8]) -> Self {
        self.rdata_cells.push((offset, bytes.to_vec()));
        self
    }

    /// Places an 8-byte cell at an offset inside `.data`.
    pub fn data_u64(mut self, offset: u32, value: u64) -> Self {
        self.data_cells.push((offset, value.to_le_bytes().to_vec()));
        self
    }

    /// Builds the PE image bytes.
    pub fn build(self) -> Vec<u8> {
        const TEXT_RAW: usize = 0x400;
        const RDATA_RAW: usize = 0x800;
        const DATA_RAW: usize = 0xC00;
        let mut file = vec![0u8; 0x1000];

        let put_u16 = |file: &mut [u8], offset: usize, value: u16| {
            file[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        };
        let put_u32 = |file: &mut [u8], offset: usize, value: u32| {
            file[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        };
        let put_u64 = |file: &mut [u8], offset: usize, value: u64| {
            file[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        };

        file[0] = b'M';
        file[1] = b'Z';
        put_u32(&mut file, 0x3C, 0x80);
        file[0x80..0x84].copy_from_slice(b"PE\0\0");
        put_u16(&mut file, 0x84, 0x8664);
        put_u16(&mut file, 0x86, 3); // sections
        put_u16(&mut file, 0x94, 0xF0);
        put_u16(&mut file, 0x96, 0x0022);

        let opt = 0x98usize;
        put_u16(&mut file, opt, 0x20B);
        put_u32(&mut file, opt + 16, 0x1000); // entry point
        put_u32(&mut file, opt + 20, 0x1000);
        put_u64(&mut file, opt + 24, self.image_base);
        put_u32(&mut file, opt + 32, 0x1000);
        put_u32(&mut file, opt + 36, 0x200);
        put_u16(&mut file, opt + 40, 6);
        put_u16(&mut file, opt + 48, 6);
        put_u32(&mut file, opt + 56, 0x4000); // size of image
        put_u32(&mut file, opt + 60, 0x400); // size of headers
        put_u16(&mut file, opt + 68, 3);
        put_u64(&mut file, opt + 72, 0x0010_0000);
        put_u64(&mut file, opt + 80, 0x1000);
        put_u64(&mut file, opt + 88, 0x0010_0000);
        put_u64(&mut file, opt + 96, 0x1000);
        put_u32(&mut file, opt + 108, 16);

        let mut write_section = |index: usize,
                                 name: &[u8; 8],
                                 rva: u32,
                                 raw_offset: u32,
                                 characteristics: u32| {
            let offset = opt + 0xF0 + index * 40;
            file[offset..offset + 8].copy_from_slice(name);
            put_u32(&mut file, offset + 8, 0x1000);
            put_u32(&mut file, offset + 12, rva);
            put_u32(&mut file, offset + 16, 0x400);
            put_u32(&mut file, offset + 20, raw_offset);
            put_u32(&mut file, offset + 36, characteristics);
        };
        write_section(0, b".text\0\0\0", 0x1000, TEXT_RAW as u32, 0x6000_0020);
        write_section(1, b".rdata\0\0", 0x2000, RDATA_RAW as u32, 0x4000_0040);
        write_section(2, b".data\0\0\0", 0x3000, DATA_RAW as u32, 0xC000_0040);

        let text_len = self.text.len().min(0x400);
        file[TEXT_RAW..TEXT_RAW + text_len].copy_from_slice(&self.text[..text_len]);
        for (offset, bytes) in &self.rdata_cells {
            let at = RDATA_RAW + *offset as usize;
            file[at..at + bytes.len()].copy_from_slice(bytes);
        }
        for (offset, bytes) in &self.data_cells {
            let at = DATA_RAW + *offset as usize;
            file[at..at + bytes.len()].copy_from_slice(bytes);
        }
        file
    }
}

impl Default for GuestImage {
    fn default() -> Self {
        Self::new()
    }
}

/// Service ids used by the guest programs, resolved from the default table.
pub fn service_id(name: &str) -> u64 {
    ntcradle::syscalls::ServiceTable::windows_default()
        .find_by_name(name)
        .unwrap_or_else(|| panic!("service {name} not in the default table"))
        .into()
}

/// Builds an emulator over a scripted CPU with deterministic settings.
pub fn make_emulator(quantum: u64) -> ntcradle::Emulator {
    let settings = ntcradle::EmulatorSettings {
        use_relative_time: true,
        instruction_quantum: quantum,
        ..Default::default()
    };
    ntcradle::Emulator::new(settings, Box::new(ScriptedCpu::new()))
}
