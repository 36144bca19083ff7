//! Kernel object model.
//!
//! Every nameable NT object the emulator hands out through the handle table is a
//! [`KernelObject`] variant behind a thin capability set: a signal state, an acquire
//! action consumed by successful waits, and destruction when the last handle closes.
//! A tagged enum with a small dispatch keyed on the tag replaces an inheritance
//! hierarchy; cross-references are stable integer ids, never pointers.
//!
//! # Signal semantics
//!
//! - **Events** are notification (manual reset) or synchronization (auto reset);
//!   auto-reset events consume their signal when a wait completes.
//! - **Mutants** are signaled when unowned; acquisition is reentrant, and a mutant
//!   released by thread termination is abandoned: the next acquirer observes
//!   `STATUS_ABANDONED`.
//! - **Semaphores** are signaled while their count is positive; waits decrement.
//! - **Timers** signal when their due time passes; synchronization timers reset on
//!   acquire.
//! - **Thread objects** signal on termination (evaluated against the thread table).
//! - Files, keys, sections and the remaining types are always signaled for wait
//!   purposes, matching NT behavior for handles that are not synchronization objects.

use crate::process::handle::HandleType;

/// Stable identifier of an object in the process object table.
///
/// Object ids are the only way objects are referenced: handle entries, wait sets
/// and thread records all hold ids and look them up, which keeps snapshotting
/// trivial and avoids reference cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

/// An event object (notification or synchronization).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventObject {
    /// `true` for notification (manual reset) events.
    pub manual_reset: bool,
    /// Current signal state.
    pub signaled: bool,
}

/// A mutant (mutex) object with reentrant ownership and abandonment tracking.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MutantObject {
    /// Owning thread, or `None` when the mutant is free.
    pub owner: Option<u32>,
    /// Recursive acquisition count of the owner.
    pub recursion: u32,
    /// Set when the owner terminated without releasing.
    pub abandoned: bool,
}

impl MutantObject {
    /// Releases one level of ownership.
    ///
    /// Returns `Some(previous_recursion)` on success (the mutant is free again when
    /// the value was 1), or `None` if `tid` does not own the mutant.
    pub fn release(&mut self, tid: u32) -> Option<u32> {
        if self.owner != Some(tid) {
            return None;
        }
        let previous = self.recursion;
        self.recursion -= 1;
        if self.recursion == 0 {
            self.owner = None;
        }
        Some(previous)
    }
}

/// A counting semaphore object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SemaphoreObject {
    /// Current count; the semaphore is signaled while this is positive.
    pub count: u32,
    /// Maximum count accepted by release.
    pub maximum: u32,
}

/// A waitable timer object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerObject {
    /// `true` for notification timers; synchronization timers reset on acquire.
    pub manual_reset: bool,
    /// Current signal state.
    pub signaled: bool,
    /// Steady-clock tick (100ns) at which the timer signals, if armed.
    pub due_time: Option<u64>,
}

/// What a file object is backed by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileBacking {
    /// The process standard input.
    Stdin,
    /// The process standard output.
    Stdout,
    /// The process standard error.
    Stderr,
    /// A file in the host filesystem view.
    Host(String),
}

/// An open file object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileObject {
    /// Backing store.
    pub backing: FileBacking,
    /// Current byte offset for sequential access.
    pub position: u64,
}

/// A section (file mapping) object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionObject {
    /// Maximum size of the section in bytes.
    pub size: u64,
}

/// All kernel object types the handle table can refer to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelObject {
    /// Event object.
    Event(EventObject),
    /// Mutant (mutex) object.
    Mutant(MutantObject),
    /// Semaphore object.
    Semaphore(SemaphoreObject),
    /// Waitable timer object.
    Timer(TimerObject),
    /// Section (file mapping) object.
    Section(SectionObject),
    /// File object.
    File(FileObject),
    /// Registry key object, holding its NT path.
    Key(String),
    /// Thread object; the id refers into the thread table.
    Thread(u32),
    /// Object-namespace directory.
    Directory(String),
    /// Object-namespace symbolic link and its target.
    SymbolicLink(String),
    /// Access token object.
    Token,
    /// ALPC port object.
    Port(String),
    /// I/O completion object.
    IoCompletion,
}

impl KernelObject {
    /// Returns the handle-table type tag for this object.
    #[must_use]
    pub fn type_tag(&self) -> HandleType {
        match self {
            KernelObject::Event(_) => HandleType::Event,
            KernelObject::Mutant(_) => HandleType::Mutant,
            KernelObject::Semaphore(_) => HandleType::Semaphore,
            KernelObject::Timer(_) => HandleType::Timer,
            KernelObject::Section(_) => HandleType::Section,
            KernelObject::File(_) => HandleType::File,
            KernelObject::Key(_) => HandleType::Key,
            KernelObject::Thread(_) => HandleType::Thread,
            KernelObject::Directory(_) => HandleType::Directory,
            KernelObject::SymbolicLink(_) => HandleType::SymbolicLink,
            KernelObject::Token => HandleType::Token,
            KernelObject::Port(_) => HandleType::Port,
            KernelObject::IoCompletion => HandleType::IoCompletion,
        }
    }

    /// Returns the NT type name, as `NtQueryObject` would report it.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            KernelObject::Event(_) => "Event",
            KernelObject::Mutant(_) => "Mutant",
            KernelObject::Semaphore(_) => "Semaphore",
            KernelObject::Timer(_) => "Timer",
            KernelObject::Section(_) => "Section",
            KernelObject::File(_) => "File",
            KernelObject::Key(_) => "Key",
            KernelObject::Thread(_) => "Thread",
            KernelObject::Directory(_) => "Directory",
            KernelObject::SymbolicLink(_) => "SymbolicLink",
            KernelObject::Token => "Token",
            KernelObject::Port(_) => "ALPC Port",
            KernelObject::IoCompletion => "IoCompletion",
        }
    }

    /// Evaluates the signal state for wait purposes.
    ///
    /// Thread objects cannot be evaluated here (their state lives in the thread
    /// table); the process context resolves them before calling. For them this
    /// returns `false`.
    #[must_use]
    pub fn signal_state(&self) -> bool {
        match self {
            KernelObject::Event(event) => event.signaled,
            KernelObject::Mutant(mutant) => mutant.owner.is_none(),
            KernelObject::Semaphore(semaphore) => semaphore.count > 0,
            KernelObject::Timer(timer) => timer.signaled,
            KernelObject::Thread(_) => false,
            // Non-synchronization objects never block a wait.
            _ => true,
        }
    }

    /// Consumes the signal on behalf of a completing wait.
    ///
    /// Returns `true` if the caller acquired an abandoned mutant.
    pub fn acquire(&mut self, tid: u32) -> bool {
        match self {
            KernelObject::Event(event) => {
                if !event.manual_reset {
                    event.signaled = false;
                }
                false
            }
            KernelObject::Mutant(mutant) => {
                let was_abandoned = mutant.abandoned;
                if mutant.owner == Some(tid) {
                    mutant.recursion += 1;
                } else {
                    mutant.owner = Some(tid);
                    mutant.recursion = 1;
                }
                mutant.abandoned = false;
                was_abandoned
            }
            KernelObject::Semaphore(semaphore) => {
                semaphore.count = semaphore.count.saturating_sub(1);
                false
            }
            KernelObject::Timer(timer) => {
                if !timer.manual_reset {
                    timer.signaled = false;
                }
                false
            }
            _ => false,
        }
    }
}

/// One slot of the object table: the object plus the number of handles that
/// reference it. The object is destroyed when the count reaches zero.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    /// The object itself.
    pub object: KernelObject,
    /// Number of live handle references.
    pub refs: u32,
}

/// Arena of kernel objects referenced by [`ObjectId`].
///
/// Slots are recycled through a free list; ids stay valid while any handle holds
/// a reference.
#[derive(Clone, Debug, Default)]
pub struct ObjectTable {
    slots: Vec<Option<ObjectEntry>>,
    free: Vec<u32>,
}

impl ObjectTable {
    /// Creates an empty object table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an object with an initial reference count of one.
    pub fn insert(&mut self, object: KernelObject) -> ObjectId {
        let entry = ObjectEntry { object, refs: 1 };
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(entry);
            ObjectId(index)
        } else {
            self.slots.push(Some(entry));
            ObjectId((self.slots.len() - 1) as u32)
        }
    }

    /// Returns the object behind `id`, if it is alive.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&KernelObject> {
        self.slots
            .get(id.0 as usize)?
            .as_ref()
            .map(|entry| &entry.object)
    }

    /// Returns the object behind `id` for mutation, if it is alive.
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut KernelObject> {
        self.slots
            .get_mut(id.0 as usize)?
            .as_mut()
            .map(|entry| &mut entry.object)
    }

    /// Adds a handle reference (for duplication).
    pub fn add_ref(&mut self, id: ObjectId) {
        if let Some(entry) = self.slots.get_mut(id.0 as usize).and_then(Option::as_mut) {
            entry.refs += 1;
        }
    }

    /// Drops a handle reference; returns the object if this was the last one.
    pub fn release(&mut self, id: ObjectId) -> Option<KernelObject> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let entry = slot.as_mut()?;
        entry.refs -= 1;
        if entry.refs == 0 {
            let entry = slot.take().expect("slot checked above");
            self.free.push(id.0);
            Some(entry.object)
        } else {
            None
        }
    }

    /// Iterates over all live objects as `(id, entry)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ObjectEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|entry| (ObjectId(index as u32), entry)))
    }

    /// Number of live objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns `true` if the table holds no live objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuilds the table from serialized slots (snapshot restore).
    pub fn from_slots(slots: Vec<Option<ObjectEntry>>) -> Self {
        let free = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
            .collect();
        Self { slots, free }
    }

    /// Exposes raw slots for serialization.
    #[must_use]
    pub fn slots(&self) -> &[Option<ObjectEntry>] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_signal_semantics() {
        let mut auto = KernelObject::Event(EventObject {
            manual_reset: false,
            signaled: true,
        });
        assert!(auto.signal_state());
        auto.acquire(1);
        assert!(!auto.signal_state(), "auto-reset event consumes its signal");

        let mut manual = KernelObject::Event(EventObject {
            manual_reset: true,
            signaled: true,
        });
        manual.acquire(1);
        assert!(manual.signal_state(), "notification event stays signaled");
    }

    #[test]
    fn test_mutant_reentrancy_and_abandonment() {
        let mut mutant = KernelObject::Mutant(MutantObject::default());
        assert!(mutant.signal_state());

        assert!(!mutant.acquire(7));
        assert!(!mutant.signal_state());
        // Reentrant acquisition by the owner.
        assert!(!mutant.acquire(7));

        let KernelObject::Mutant(ref mut state) = mutant else {
            unreachable!()
        };
        assert_eq!(state.recursion, 2);
        assert_eq!(state.release(7), Some(2));
        assert_eq!(state.release(7), Some(1));
        assert!(state.owner.is_none());
        assert_eq!(state.release(7), None, "release without ownership fails");

        state.abandoned = true;
        assert!(mutant.acquire(9), "acquiring an abandoned mutant reports it");
        let KernelObject::Mutant(ref state) = mutant else {
            unreachable!()
        };
        assert!(!state.abandoned);
    }

    #[test]
    fn test_semaphore_counts() {
        let mut semaphore = KernelObject::Semaphore(SemaphoreObject {
            count: 2,
            maximum: 2,
        });
        assert!(semaphore.signal_state());
        semaphore.acquire(1);
        assert!(semaphore.signal_state());
        semaphore.acquire(1);
        assert!(!semaphore.signal_state());
    }

    #[test]
    fn test_object_table_refcounts() {
        let mut table = ObjectTable::new();
        let id = table.insert(KernelObject::Token);
        table.add_ref(id);

        assert!(table.release(id).is_none(), "first release keeps the object");
        assert!(table.get(id).is_some());
        assert!(matches!(table.release(id), Some(KernelObject::Token)));
        assert!(table.get(id).is_none());

        // Freed slots are recycled.
        let next = table.insert(KernelObject::IoCompletion);
        assert_eq!(next, id);
    }
}
