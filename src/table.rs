//! Relay Table: a fixed-capacity array of relay slots with O(1)-scan allocate/release.

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

use crate::addr::RawSockAddr;
use crate::plugin::PluginRecord;

/// Sentinel returned by [`RelayTable::allocate`] when every slot is occupied.
pub const FULL: Option<usize> = None;

/// Per-connection engine state. Exactly the fields the spec's data model names, plus an internal
/// `generation` counter (never exposed to plugins) used to catch a stale `relay_id` being reused
/// across a release/reallocate boundary.
pub struct Slot {
    pub active: bool,
    pub fd: RawFd,
    pub src_addr: RawSockAddr,
    pub dst_addr: RawSockAddr,
    pub pending_out: Vec<u8>,
    pub shared_data: Box<[u8]>,
    pub takeovered: bool,
    pub read_armed: bool,
    pub write_armed: bool,
    pub plugin_state: Vec<PluginRecord>,
    pub generation: u32,
}

impl Slot {
    fn empty(buffer_size: usize) -> Self {
        Slot {
            active: false,
            fd: -1,
            src_addr: RawSockAddr { addr: 0, port: 0 },
            dst_addr: RawSockAddr { addr: 0, port: 0 },
            pending_out: Vec::new(),
            shared_data: vec![0u8; buffer_size].into_boxed_slice(),
            takeovered: false,
            read_armed: false,
            write_armed: false,
            plugin_state: Vec::new(),
            generation: 0,
        }
    }
}

pub struct RelayTable {
    // Fixed length, set once in `new` and never pushed/popped/reallocated again: the
    // `plugin_state` records below hold raw pointers into a slot's own `shared_data`/`src_addr`/
    // `dst_addr`/`takeovered` fields, which stay valid only as long as the `Slot` itself never
    // moves.
    slots: Box<[Slot]>,
    plugin_count: usize,
    live_count: usize,
}

impl RelayTable {
    pub fn new(max_relays: usize, plugin_count: usize, buffer_size: usize) -> Self {
        let slots = (0..max_relays)
            .map(|_| Slot::empty(buffer_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        RelayTable {
            slots,
            plugin_count,
            live_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn get(&self, slot_id: usize) -> &Slot {
        &self.slots[slot_id]
    }

    pub fn get_mut(&mut self, slot_id: usize) -> &mut Slot {
        &mut self.slots[slot_id]
    }

    /// Linear scan for the first inactive slot; initializes it per the data model and returns its
    /// index, or `None` if the table is full.
    pub fn allocate(&mut self, fd: RawFd, src: SocketAddrV4, dst: SocketAddrV4) -> Option<usize> {
        let idx = self.slots.iter().position(|s| !s.active)?;
        let buffer_size = self.slots[idx].shared_data.len();

        {
            let slot = &mut self.slots[idx];
            slot.active = true;
            slot.fd = fd;
            slot.src_addr = src.into();
            slot.dst_addr = dst.into();
            slot.pending_out.clear();
            slot.pending_out.reserve(buffer_size);
            // Re-zero on every allocate, not just the first: a reused slot index must never
            // expose a previous session's leftover bytes to the new session's plugins.
            slot.shared_data.iter_mut().for_each(|b| *b = 0);
            slot.takeovered = false;
            slot.read_armed = false;
            slot.write_armed = false;
            slot.generation = slot.generation.wrapping_add(1);
        }

        // Built in a second pass: each PluginRecord borrows raw pointers into *this same slot's*
        // just-initialized fields, which is only sound once those fields hold their final
        // addresses for the session (the `Slot` itself never moves again, see the `RelayTable`
        // field comment above).
        let plugin_count = self.plugin_count;
        let slot = &mut self.slots[idx];
        slot.plugin_state = (0..plugin_count)
            .map(|plugin_id| PluginRecord {
                plugin_id,
                relay_id: idx,
                data: std::ptr::null_mut(),
                shared_data: slot.shared_data.as_mut_ptr(),
                shared_data_len: slot.shared_data.len(),
                src_addr: &slot.src_addr as *const RawSockAddr,
                dst_addr: &slot.dst_addr as *const RawSockAddr,
                takeovered: &mut slot.takeovered as *mut bool,
            })
            .collect();

        self.live_count += 1;
        Some(idx)
    }

    /// Marks `slot_id` inactive and releases its buffers. Must be called exactly once per
    /// successful `allocate`.
    pub fn release(&mut self, slot_id: usize) {
        let slot = &mut self.slots[slot_id];
        slot.active = false;
        slot.fd = -1;
        slot.pending_out = Vec::new();
        slot.plugin_state.clear();
        slot.takeovered = false;
        slot.read_armed = false;
        slot.write_armed = false;
        self.live_count -= 1;
    }
}
