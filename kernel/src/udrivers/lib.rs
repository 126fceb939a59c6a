// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The user-space device-driver framework: ordinary threads register as
//! handlers for hardware interrupts or software "servers," receive
//! interrupts as messages through a per-driver FIFO, and are granted
//! scoped I/O-port and memory-mapped-I/O privileges.
//!
//! Driver ids split into three ranges: `[0, MAX_HW)` for hardware
//! devices named in [`DEVICE_TABLE`], `[MAX_HW, MIN_ASSIGNABLE)` for the
//! well-known software servers in [`SERVER_TABLE`], and
//! `[MIN_ASSIGNABLE, u32::MAX)` for dynamically assigned software
//! servers.

#![no_std]

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use lazy_static::lazy_static;
use lifecycle::Task;
use spin::Mutex as SpinLock;
use syscalls::Error;
use thread::{Status, Tid};

/// The exclusive upper bound of the hardware driver id range.
///
pub const MAX_HW: u32 = 16;
/// The exclusive upper bound of the well-known software server id range,
/// and the first id the kernel will hand out for [`ASSIGN_REQUEST`].
pub const MIN_ASSIGNABLE: u32 = 64;
/// Passed as the id to [`udriv_register`] to request a freshly assigned
/// software-server id instead of a specific one.
pub const ASSIGN_REQUEST: u32 = u32::MAX;

/// How many undelivered messages a driver's FIFO holds before further
/// sends are silently dropped.
const QUEUE_DEPTH: usize = 16;

/// An inclusive range of I/O ports a driver is allowed to touch.
///
#[derive(Clone, Copy)]
pub struct PortRegion {
    pub first: u16,
    pub last: u16,
}

impl PortRegion {
    const fn contains(&self, port: u16) -> bool {
        port >= self.first && port <= self.last
    }
}

/// An inclusive range of physical addresses a driver is allowed to map.
///
#[derive(Clone, Copy)]
pub struct MmioRegion {
    pub first: u32,
    pub last: u32,
}

impl MmioRegion {
    const fn contains(&self, first: u32, last: u32) -> bool {
        first >= self.first && last <= self.last
    }
}

/// A permission-table entry: the hardware vector (if any) and the port
/// and MMIO regions a given driver id is allowed to touch.
pub struct TableEntry {
    pub id: u32,
    pub idt_slot: u8,
    pub ports: &'static [PortRegion],
    pub mmio: &'static [MmioRegion],
}

/// The hardware devices this kernel knows about, by IDT slot.
///
pub static DEVICE_TABLE: &[TableEntry] = &[
    TableEntry {
        id: 0, // keyboard
        idt_slot: 33,
        ports: &[PortRegion { first: 0x60, last: 0x64 }],
        mmio: &[],
    },
    TableEntry {
        id: 1, // COM1 serial
        idt_slot: 36,
        ports: &[PortRegion { first: 0x3f8, last: 0x3ff }],
        mmio: &[],
    },
];

/// Well-known software servers with a reserved id below [`MIN_ASSIGNABLE`].
///
/// Empty for now; this kernel has no built-in software servers, but the
/// id range is reserved so one can be added without colliding with
/// dynamically assigned ids.
pub static SERVER_TABLE: &[TableEntry] = &[];

fn table_entry(id: u32) -> Option<&'static TableEntry> {
    DEVICE_TABLE
        .iter()
        .chain(SERVER_TABLE.iter())
        .find(|e| e.id == id)
}

struct DriverRecord {
    registered_thread: Tid,
    in_port: u16,
    in_bytes: u8,
    pending_messages: VecDeque<(u32, u8)>,
}

struct State {
    records: BTreeMap<u32, DriverRecord>,
    next_assignable: u32,
}

impl State {
    fn new() -> Self {
        State {
            records: BTreeMap::new(),
            next_assignable: MIN_ASSIGNABLE,
        }
    }
}

lazy_static! {
    static ref STATE: SpinLock<State> = SpinLock::new(State::new());
}

/// Registers the calling thread as the handler for driver `id`.
///
/// `id` may be [`ASSIGN_REQUEST`] to ask for a fresh dynamic id instead
/// of naming one. `in_port`/`in_bytes` describe the single hardware
/// input this driver expects per message (`in_bytes` bounded to 0 or 1
/// for hardware ids); they are otherwise only a record-keeping hint.
pub fn udriv_register(caller: Tid, id: u32, in_port: u16, in_bytes: u8) -> Result<u32, Error> {
    let mut state = STATE.lock();

    let resolved_id = if id == ASSIGN_REQUEST {
        let assigned = state.next_assignable;
        state.next_assignable = state.next_assignable.checked_add(1).ok_or(Error::NoMem)?;
        assigned
    } else {
        id
    };

    if state.records.contains_key(&resolved_id) {
        return Err(Error::Inval);
    }

    if resolved_id < MAX_HW {
        let entry = table_entry(resolved_id).ok_or(Error::Inval)?;
        if in_bytes > 1 || !entry.ports.iter().any(|r| r.contains(in_port)) {
            return Err(Error::Inval);
        }
    } else if in_bytes as usize > core::mem::size_of::<u32>() {
        return Err(Error::Inval);
    }

    state.records.insert(
        resolved_id,
        DriverRecord {
            registered_thread: caller,
            in_port,
            in_bytes,
            pending_messages: VecDeque::new(),
        },
    );
    if let Some(thread) = thread::get(caller) {
        thread.udriv_list.lock().push(resolved_id);
    }
    Ok(resolved_id)
}

/// Deregisters driver `id`, which must be owned by `caller`.
///
pub fn udriv_deregister(caller: Tid, id: u32) -> Result<(), Error> {
    let mut state = STATE.lock();
    match state.records.get(&id) {
        Some(record) if record.registered_thread == caller => {
            state.records.remove(&id);
        }
        _ => return Err(Error::Failure),
    }
    if let Some(thread) = thread::get(caller) {
        thread.udriv_list.lock().retain(|&owned| owned != id);
    }
    Ok(())
}

/// Delivers a message to driver `id`'s registered thread.
///
/// Called both by the syscall of the same name and by a device's
/// interrupt handler. If the registered thread is [`Status::Waiting`]
/// (blocked in [`udriv_wait`]), it is moved straight to the scheduler's
/// driver-priority queue.
pub fn udriv_send(id: u32, payload: u32, size: u8) -> Result<(), Error> {
    if size as usize > core::mem::size_of::<u32>() {
        return Err(Error::Inval);
    }
    let mut state = STATE.lock();
    let record = state.records.get_mut(&id).ok_or(Error::Failure)?;
    if size > 0 {
        if record.pending_messages.len() < QUEUE_DEPTH {
            record.pending_messages.push_back((payload, size));
        }
        // else: drop-newest-silent, per the bounded-FIFO contract.
    }
    let registered = record.registered_thread;
    drop(state);

    let thread = thread::get(registered).ok_or(Error::Failure)?;
    thread.pending_driver_queue.lock().push_back(id);
    if thread.status() == Status::Waiting {
        scheduler::wake_driver_priority(registered);
    }
    Ok(())
}

/// Blocks the calling thread until one of its registered drivers has a
/// pending message, then returns that driver's id and, if any, its
/// oldest queued payload.
pub fn udriv_wait(caller: &thread::Thread) -> Result<(u32, u32, u8), Error> {
    if caller.udriv_list.lock().is_empty() {
        return Err(Error::Failure);
    }

    loop {
        // The pop attempt and, on failure, the flip to `Waiting` happen
        // as one step with interrupts disabled: otherwise a `udriv_send`
        // landing in between could push a message and check `status`
        // before it becomes `Waiting`, missing the wake for good. Same
        // re-check-right-before-blocking shape as `do_deschedule`'s
        // reject flag.
        let popped = arch::without_interrupts(|| match caller.pending_driver_queue.lock().pop_front() {
            Some(id) => Some(id),
            None => {
                caller.set_status(Status::Waiting);
                None
            }
        });

        let id = match popped {
            Some(id) => id,
            None => {
                scheduler::context_switch();
                continue;
            }
        };

        let mut state = STATE.lock();
        let (payload, size) = state
            .records
            .get_mut(&id)
            .and_then(|r| r.pending_messages.pop_front())
            .unwrap_or((0, 0));
        return Ok((id, payload, size));
    }
}

/// Reads a byte from `port`, succeeding only if `caller` owns a
/// registered driver whose declared port region includes it.
pub fn udriv_inb(caller: Tid, port: u16) -> Result<u8, Error> {
    owns_port(caller, port)?;
    Ok(unsafe { arch::Port::<u8>::new(port).read() })
}

/// Writes a byte to `port`, under the same ownership check as
/// [`udriv_inb`].
pub fn udriv_outb(caller: Tid, port: u16, value: u8) -> Result<(), Error> {
    owns_port(caller, port)?;
    unsafe { arch::Port::<u8>::new(port).write(value) };
    Ok(())
}

fn owns_port(caller: Tid, port: u16) -> Result<(), Error> {
    let thread = thread::get(caller).ok_or(Error::Failure)?;
    let owned = thread.udriv_list.lock();
    let state = STATE.lock();
    let allowed = owned.iter().any(|&id| {
        table_entry(id).map_or(false, |entry| entry.ports.iter().any(|r| r.contains(port)))
            || state.records.get(&id).map_or(false, |r| r.in_port == port)
    });
    if allowed {
        Ok(())
    } else {
        Err(Error::Failure)
    }
}

/// Maps `len` bytes of physical memory at `phys` into the caller's
/// address space at `virt`, after validating that the range lies within
/// some declared MMIO region of a driver the caller owns.
pub fn udriv_mmap(caller: Tid, task: &Task, phys: u32, virt: u32, len: u32) -> Result<(), Error> {
    if !memlayout::is_page_aligned(phys) || !memlayout::is_page_aligned(virt) || !memlayout::is_page_aligned(len) {
        return Err(Error::Inval);
    }

    let thread = thread::get(caller).ok_or(Error::Failure)?;
    let owned = thread.udriv_list.lock();
    let last = phys + len - 1;
    let allowed = owned
        .iter()
        .filter_map(|&id| table_entry(id))
        .any(|entry| entry.mmio.iter().any(|r| r.contains(phys, last)));
    if !allowed {
        return Err(Error::Failure);
    }

    let space = task.space();
    virtmem::mmap(&space, phys, virt, len).map_err(|_| Error::NoMem)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        *STATE.lock() = State::new();
    }

    #[test]
    fn register_assigns_a_fresh_id_on_request() {
        reset();
        let first = udriv_register(Tid::from_u32(1), ASSIGN_REQUEST, 0, 0).unwrap();
        let second = udriv_register(Tid::from_u32(1), ASSIGN_REQUEST, 0, 0).unwrap();
        assert_ne!(first, second);
        assert!(first >= MIN_ASSIGNABLE);
    }

    #[test]
    fn register_rejects_a_hardware_id_with_a_bad_port() {
        reset();
        assert_eq!(udriv_register(Tid::from_u32(1), 0, 0x42, 1), Err(Error::Inval));
    }

    #[test]
    fn register_rejects_an_id_already_in_use() {
        reset();
        udriv_register(Tid::from_u32(1), 0, 0x60, 1).unwrap();
        assert_eq!(udriv_register(Tid::from_u32(2), 0, 0x60, 1), Err(Error::Inval));
    }

    #[test]
    fn deregister_fails_for_a_non_owning_thread() {
        reset();
        udriv_register(Tid::from_u32(1), 0, 0x60, 1).unwrap();
        assert_eq!(udriv_deregister(Tid::from_u32(2), 0), Err(Error::Failure));
    }

    #[test]
    fn send_fails_for_an_unregistered_id() {
        reset();
        assert_eq!(udriv_send(5, 0, 0), Err(Error::Failure));
    }
}
