// Dispatcher-header synchronization objects. The guest kernel keeps the
// canonical state in guest memory (type/size/inserted/signal-state); the
// emulator mirrors per-object bookkeeping the header cannot hold: waiter
// FIFOs, mutant ownership, semaphore limits and timer programming.

use crate::memory::GuestMemory;
use std::collections::VecDeque;

/// Guest kernel object type tags.
pub mod object_type {
    pub const NOTIFICATION_EVENT: u8 = 0;
    pub const SYNCHRONIZATION_EVENT: u8 = 1;
    pub const MUTANT: u8 = 2;
    pub const PROCESS: u8 = 3;
    pub const QUEUE: u8 = 4;
    pub const SEMAPHORE: u8 = 5;
    pub const THREAD: u8 = 6;
    pub const TIMER_NOTIFICATION: u8 = 8;
    pub const TIMER_SYNCHRONIZATION: u8 = 9;
}

/// The four-byte prefix plus signal state every waitable object starts with.
#[derive(Debug, Copy, Clone, Default)]
pub struct DispatcherHeader {
    pub obj_type: u8,
    pub size: u8,
    pub inserted: u8,
    pub signal_state: i32,
}

impl DispatcherHeader {
    pub fn read(mem: &GuestMemory, addr: u32) -> Self {
        DispatcherHeader {
            obj_type: mem.read_u8(addr),
            size: mem.read_u8(addr.wrapping_add(1)),
            inserted: mem.read_u8(addr.wrapping_add(2)),
            signal_state: mem.read_u32(addr.wrapping_add(4)) as i32,
        }
    }

    pub fn write(&self, mem: &GuestMemory, addr: u32) {
        mem.write_u8(addr, self.obj_type);
        mem.write_u8(addr.wrapping_add(1), self.size);
        mem.write_u8(addr.wrapping_add(2), self.inserted);
        mem.write_u32(addr.wrapping_add(4), self.signal_state as u32);
    }

    pub fn signal_state(mem: &GuestMemory, addr: u32) -> i32 {
        mem.read_u32(addr.wrapping_add(4)) as i32
    }

    pub fn set_signal_state(mem: &GuestMemory, addr: u32, state: i32) {
        mem.write_u32(addr.wrapping_add(4), state as u32);
    }
}

/// Host-side companion state for one dispatcher object, keyed by its guest
/// address. Waiters are guest thread ids in FIFO order.
#[derive(Debug, Default)]
pub struct SyncObject {
    pub guest_addr: u32,
    pub obj_type: u8,
    pub waiters: VecDeque<u32>,
    // Mutant
    pub owner: Option<u32>,
    pub recursion: u32,
    // Ownership was handed to a woken waiter that has not re-polled yet;
    // its next wait completes the handoff instead of counting recursion.
    pub pending_transfer: bool,
    // Semaphore
    pub maximum: i32,
    // Timer
    pub due_time_ns: u64,
    pub period_ms: u32,
    pub timer_armed: bool,
}

impl SyncObject {
    pub fn new(guest_addr: u32, obj_type: u8) -> Self {
        SyncObject { guest_addr, obj_type, ..SyncObject::default() }
    }

    pub fn is_event(&self) -> bool {
        matches!(
            self.obj_type,
            object_type::NOTIFICATION_EVENT | object_type::SYNCHRONIZATION_EVENT
        )
    }

    pub fn is_timer(&self) -> bool {
        matches!(
            self.obj_type,
            object_type::TIMER_NOTIFICATION | object_type::TIMER_SYNCHRONIZATION
        )
    }

    /// Auto-reset objects consume their signal on a satisfied wait.
    pub fn auto_resets(&self) -> bool {
        matches!(
            self.obj_type,
            object_type::SYNCHRONIZATION_EVENT | object_type::TIMER_SYNCHRONIZATION
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn header_round_trip() {
        let mem = Arc::new(GuestMemory::new().unwrap());
        let header = DispatcherHeader {
            obj_type: object_type::SEMAPHORE,
            size: 5,
            inserted: 1,
            signal_state: -3,
        };
        header.write(&mem, 0x0040_0000);
        let back = DispatcherHeader::read(&mem, 0x0040_0000);
        assert_eq!(back.obj_type, object_type::SEMAPHORE);
        assert_eq!(back.size, 5);
        assert_eq!(back.inserted, 1);
        assert_eq!(back.signal_state, -3);
    }

    #[test]
    fn auto_reset_classification() {
        let sync = SyncObject::new(0, object_type::SYNCHRONIZATION_EVENT);
        assert!(sync.auto_resets());
        let notif = SyncObject::new(0, object_type::NOTIFICATION_EVENT);
        assert!(!notif.auto_resets());
        assert!(notif.is_event());
    }
}
