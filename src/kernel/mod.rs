// High-level-emulation kernel surface: the handle table, the import
// registry keyed by (module << 16) | ordinal, and syscall dispatch. The
// primitives the HLE functions build on (threads, waits, dispatcher objects)
// live in the threads/objects modules.

pub mod io;
pub mod objects;
pub mod threads;

use crate::context::ThreadContext;
use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use io::{FileSystem, GuestFile};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use threads::Scheduler;

pub const FIRST_HANDLE: u32 = 0x8000_0100;

/// A host-provided implementation of one guest kernel import.
pub type HleFn = Arc<dyn Fn(&mut ThreadContext, &Kernel, &Scheduler) + Send + Sync>;

/// What a handle refers to.
pub enum HandleObject {
    Thread(u32),
    File(Box<dyn GuestFile>),
    /// A dispatcher object living at a guest address.
    Dispatcher(u32),
    Module(u32),
}

struct HandleTable {
    // Closed handles leave a tombstone so double closes are distinguishable
    // from handles that never existed.
    entries: HashMap<u32, Option<HandleObject>>,
}

pub struct Kernel {
    memory: Arc<GuestMemory>,
    hle: RwLock<HashMap<u32, HleFn>>,
    handles: Mutex<HandleTable>,
    next_handle: AtomicU32,
    vfs: RwLock<Option<Arc<dyn FileSystem>>>,
    trace_syscalls: bool,
}

impl Kernel {
    pub fn new(memory: Arc<GuestMemory>, trace_syscalls: bool) -> Self {
        Kernel {
            memory,
            hle: RwLock::new(HashMap::new()),
            handles: Mutex::new(HandleTable { entries: HashMap::new() }),
            next_handle: AtomicU32::new(FIRST_HANDLE),
            vfs: RwLock::new(None),
            trace_syscalls,
        }
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    pub fn mount(&self, fs: Arc<dyn FileSystem>) {
        *self.vfs.write().unwrap() = Some(fs);
    }

    pub fn vfs(&self) -> Option<Arc<dyn FileSystem>> {
        self.vfs.read().unwrap().clone()
    }

    // ----- import registry -----

    pub fn register_hle(&self, module: u16, ordinal: u16, f: HleFn) {
        let key = ((module as u32) << 16) | ordinal as u32;
        self.hle.write().unwrap().insert(key, f);
    }

    /// Entry point for the `sc` path: r0 carries (module << 16) | ordinal,
    /// r3.. the arguments, r3 the status on return.
    pub fn dispatch_syscall(&self, ctx: &mut ThreadContext, sched: &Scheduler) {
        let id = ctx.gpr[0] as u32;
        let handler = self.hle.read().unwrap().get(&id).cloned();
        if self.trace_syscalls {
            trace!(
                "syscall {:04x}:{:04x} from thread {} at {:#010x}",
                id >> 16,
                id & 0xFFFF,
                ctx.thread_id,
                ctx.pc
            );
        }
        match handler {
            Some(f) => f(ctx, self, sched),
            None => {
                warn!("unimplemented kernel import {:04x}:{:04x}", id >> 16, id & 0xFFFF);
                ctx.gpr[3] = threads::status::UNSUCCESSFUL as u64;
            }
        }
    }

    // ----- handle table -----

    pub fn insert_handle(&self, object: HandleObject) -> u32 {
        let handle = self.next_handle.fetch_add(4, Ordering::SeqCst);
        self.handles.lock().unwrap().entries.insert(handle, Some(object));
        handle
    }

    pub fn close_handle(&self, handle: u32) -> Result<()> {
        let mut table = self.handles.lock().unwrap();
        match table.entries.get_mut(&handle) {
            Some(slot @ Some(_)) => {
                *slot = None;
                debug!("handle {:#010x} closed", handle);
                Ok(())
            }
            Some(None) => Err(Error::AlreadyClosed(handle)),
            None => Err(Error::InvalidHandle(handle)),
        }
    }

    /// Look up the thread id a handle names.
    pub fn thread_for_handle(&self, handle: u32) -> Result<u32> {
        let table = self.handles.lock().unwrap();
        match table.entries.get(&handle) {
            Some(Some(HandleObject::Thread(tid))) => Ok(*tid),
            Some(Some(_)) => Err(Error::InvalidHandle(handle)),
            Some(None) => Err(Error::AlreadyClosed(handle)),
            None => Err(Error::InvalidHandle(handle)),
        }
    }

    /// Look up the guest address of a dispatcher object handle.
    pub fn dispatcher_for_handle(&self, handle: u32) -> Result<u32> {
        let table = self.handles.lock().unwrap();
        match table.entries.get(&handle) {
            Some(Some(HandleObject::Dispatcher(addr))) => Ok(*addr),
            Some(Some(_)) => Err(Error::InvalidHandle(handle)),
            Some(None) => Err(Error::AlreadyClosed(handle)),
            None => Err(Error::InvalidHandle(handle)),
        }
    }

    /// Run a closure against the file a handle names.
    pub fn with_file<R>(
        &self,
        handle: u32,
        f: impl FnOnce(&mut Box<dyn GuestFile>) -> R,
    ) -> Result<R> {
        let mut table = self.handles.lock().unwrap();
        match table.entries.get_mut(&handle) {
            Some(Some(HandleObject::File(file))) => Ok(f(file)),
            Some(Some(_)) => Err(Error::InvalidHandle(handle)),
            Some(None) => Err(Error::AlreadyClosed(handle)),
            None => Err(Error::InvalidHandle(handle)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> Kernel {
        Kernel::new(Arc::new(GuestMemory::new().unwrap()), false)
    }

    #[test]
    fn handles_close_once() {
        let k = kernel();
        let h = k.insert_handle(HandleObject::Thread(7));
        assert_eq!(k.thread_for_handle(h).unwrap(), 7);
        k.close_handle(h).unwrap();
        assert!(matches!(k.close_handle(h), Err(Error::AlreadyClosed(_))));
        assert!(matches!(k.thread_for_handle(h), Err(Error::AlreadyClosed(_))));
        assert!(matches!(k.close_handle(0xDEAD), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn handles_are_distinct() {
        let k = kernel();
        let a = k.insert_handle(HandleObject::Dispatcher(0x1000));
        let b = k.insert_handle(HandleObject::Dispatcher(0x2000));
        assert_ne!(a, b);
        assert_eq!(k.dispatcher_for_handle(a).unwrap(), 0x1000);
        assert_eq!(k.dispatcher_for_handle(b).unwrap(), 0x2000);
    }
}
