//! The per-process handle table.
//!
//! A [`Handle`] is the opaque 32-bit value guest code receives from object-producing
//! syscalls. Internally it packs a (type tag, generation, index) triple into the
//! per-process [`HandleTable`]. Closing a handle bumps the slot's generation, so a
//! stale value that aliases a recycled slot no longer resolves (no ABA reuse within
//! a run).
//!
//! Handles reference objects indirectly through [`ObjectId`]s; the object itself
//! lives in the [`ObjectTable`](crate::process::ObjectTable) and persists while any
//! handle holds a reference.

use crate::process::object::ObjectId;

/// Kernel object type tag carried inside handle values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum HandleType {
    Event = 1,
    Mutant = 2,
    Semaphore = 3,
    Timer = 4,
    Section = 5,
    File = 6,
    Key = 7,
    Thread = 8,
    Directory = 9,
    SymbolicLink = 10,
    Token = 11,
    Port = 12,
    IoCompletion = 13,
}

impl HandleType {
    /// Decodes a type tag from its numeric value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => HandleType::Event,
            2 => HandleType::Mutant,
            3 => HandleType::Semaphore,
            4 => HandleType::Timer,
            5 => HandleType::Section,
            6 => HandleType::File,
            7 => HandleType::Key,
            8 => HandleType::Thread,
            9 => HandleType::Directory,
            10 => HandleType::SymbolicLink,
            11 => HandleType::Token,
            12 => HandleType::Port,
            13 => HandleType::IoCompletion,
            _ => return None,
        })
    }
}

/// Opaque 32-bit handle value as seen by the guest.
///
/// Bit layout: index in bits 0..16, generation in bits 16..26, type tag in bits
/// 26..31. Bit 31 stays clear so handle values never collide with the negative
/// pseudo-handle range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Pseudo-handle for the current process (`(HANDLE)-1`).
    pub const CURRENT_PROCESS: u64 = 0xFFFF_FFFF_FFFF_FFFF;
    /// Pseudo-handle for the current thread (`(HANDLE)-2`).
    pub const CURRENT_THREAD: u64 = 0xFFFF_FFFF_FFFF_FFFE;

    const GENERATION_BITS: u32 = 10;
    const GENERATION_MASK: u32 = (1 << Self::GENERATION_BITS) - 1;

    fn from_parts(ty: HandleType, generation: u16, index: u16) -> Self {
        let value = u32::from(index)
            | ((u32::from(generation) & Self::GENERATION_MASK) << 16)
            | ((ty as u32) << 26);
        Self(value)
    }

    /// Reconstructs a handle from its raw guest-visible value.
    #[must_use]
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw guest-visible value.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Returns the slot index encoded in the handle.
    #[must_use]
    pub fn index(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Returns the generation encoded in the handle.
    #[must_use]
    pub fn generation(self) -> u16 {
        ((self.0 >> 16) & Self::GENERATION_MASK) as u16
    }

    /// Returns the type tag encoded in the handle, if valid.
    #[must_use]
    pub fn handle_type(self) -> Option<HandleType> {
        HandleType::from_u8(((self.0 >> 26) & 0x1F) as u8)
    }

    /// Returns `true` if a guest-supplied 64-bit value is one of the NT
    /// pseudo-handles rather than a table handle.
    #[must_use]
    pub fn is_pseudo(raw: u64) -> bool {
        raw == Self::CURRENT_PROCESS || raw == Self::CURRENT_THREAD
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One live handle entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleEntry {
    /// The referenced object.
    pub object: ObjectId,
    /// Type tag the handle was created with.
    pub ty: HandleType,
    /// Granted access rights mask.
    pub access: u32,
    /// Whether child processes inherit the handle.
    pub inherit: bool,
}

#[derive(Clone, Debug, Default)]
struct Slot {
    generation: u16,
    entry: Option<HandleEntry>,
}

/// The per-process handle table: an append-into-freelist allocator with
/// generation counters.
#[derive(Clone, Debug, Default)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u16>,
}

impl HandleTable {
    /// Creates an empty handle table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a handle for `object` with the given access and inheritance.
    pub fn insert(&mut self, object: ObjectId, ty: HandleType, access: u32, inherit: bool) -> Handle {
        let entry = HandleEntry {
            object,
            ty,
            access,
            inherit,
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            Handle::from_parts(ty, slot.generation, index)
        } else {
            let index = self.slots.len() as u16;
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            Handle::from_parts(ty, 0, index)
        }
    }

    /// Resolves a handle to its entry, validating generation and type bits.
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&HandleEntry> {
        let slot = self.slots.get(handle.index() as usize)?;
        if slot.generation & Handle::GENERATION_MASK as u16 != handle.generation() {
            return None;
        }
        let entry = slot.entry.as_ref()?;
        if Some(entry.ty) != handle.handle_type() {
            return None;
        }
        Some(entry)
    }

    /// Closes a handle, bumping the slot generation to invalidate stale values.
    ///
    /// Returns the removed entry so the caller can release the object reference.
    pub fn remove(&mut self, handle: Handle) -> Option<HandleEntry> {
        // Validate against the current state first.
        self.get(handle)?;
        let index = handle.index();
        let slot = &mut self.slots[index as usize];
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1) & Handle::GENERATION_MASK as u16;
        self.free.push(index);
        entry
    }

    /// Iterates over live handles as `(handle, entry)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &HandleEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    Handle::from_parts(entry.ty, slot.generation, index as u16),
                    entry,
                )
            })
        })
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// Returns `true` if no handles are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exposes raw slots for serialization as `(generation, entry)` pairs.
    pub fn slots(&self) -> impl Iterator<Item = (u16, Option<&HandleEntry>)> {
        self.slots
            .iter()
            .map(|slot| (slot.generation, slot.entry.as_ref()))
    }

    /// Rebuilds the table from serialized slots (snapshot restore).
    #[must_use]
    pub fn from_slots(slots: Vec<(u16, Option<HandleEntry>)>) -> Self {
        let free = slots
            .iter()
            .enumerate()
            .filter(|(_, (_, entry))| entry.is_none())
            .map(|(index, _)| index as u16)
            .collect();
        Self {
            slots: slots
                .into_iter()
                .map(|(generation, entry)| Slot { generation, entry })
                .collect(),
            free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_one() -> (HandleTable, Handle) {
        let mut table = HandleTable::new();
        let handle = table.insert(ObjectId(3), HandleType::Event, 0x1F0003, false);
        (table, handle)
    }

    #[test]
    fn test_handle_round_trips_parts() {
        let (_, handle) = table_with_one();
        assert_eq!(handle.index(), 0);
        assert_eq!(handle.generation(), 0);
        assert_eq!(handle.handle_type(), Some(HandleType::Event));
        assert_eq!(Handle::from_raw(handle.raw()), handle);
        // Bit 31 stays clear of the pseudo-handle range.
        assert_eq!(handle.raw() >> 31, 0);
    }

    #[test]
    fn test_valid_until_close_then_invalid() {
        let (mut table, handle) = table_with_one();
        assert!(table.get(handle).is_some());

        let removed = table.remove(handle).unwrap();
        assert_eq!(removed.object, ObjectId(3));

        assert!(table.get(handle).is_none(), "closed handle must not resolve");
        assert!(table.remove(handle).is_none(), "double close fails");
    }

    #[test]
    fn test_generation_prevents_aba_reuse() {
        let (mut table, stale) = table_with_one();
        table.remove(stale).unwrap();

        // The slot is recycled for a new handle of the same type.
        let fresh = table.insert(ObjectId(9), HandleType::Event, 0, false);
        assert_eq!(fresh.index(), stale.index());
        assert_ne!(fresh.generation(), stale.generation());

        assert!(table.get(stale).is_none(), "stale value must stay dead");
        assert_eq!(table.get(fresh).unwrap().object, ObjectId(9));
    }

    #[test]
    fn test_type_tag_mismatch_rejected() {
        let (table, handle) = table_with_one();
        // Forge a handle with the right index/generation but the wrong type.
        let forged = Handle::from_raw((handle.raw() & 0x03FF_FFFF) | ((HandleType::Mutant as u32) << 26));
        assert!(table.get(forged).is_none());
    }

    #[test]
    fn test_pseudo_handles() {
        assert!(Handle::is_pseudo(Handle::CURRENT_PROCESS));
        assert!(Handle::is_pseudo(Handle::CURRENT_THREAD));
        assert!(!Handle::is_pseudo(0x44));
    }
}
