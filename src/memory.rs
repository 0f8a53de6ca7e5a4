// Guest memory: 512 MB of big-endian RAM behind a 4 GB host reservation, with
// MMIO windows, write tracking, per-thread atomic reservations and the
// process-wide time base. Every accessor is total; accesses that hit neither
// RAM nor a registered window read as zero and drop writes.

use crate::error::{Error, Result};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub const RAM_SIZE: usize = 512 * 1024 * 1024;
pub const PHYS_MASK: u32 = 0x1FFF_FFFF;
pub const PAGE_SIZE: u32 = 4096;
pub const PAGE_SHIFT: u32 = 12;

// Cached-virtual mirror of physical memory.
pub const VIRT_BASE: u32 = 0x8000_0000;
pub const VIRT_END: u32 = 0xA000_0000;

// GPU register window and its alias in GPU virtual space.
pub const GPU_MMIO_BASE: u32 = 0x7FC0_0000;
pub const GPU_MMIO_END: u32 = 0x8000_0000;
pub const GPU_VIRT_BASE: u32 = 0xC000_0000;
pub const GPU_VIRT_END: u32 = 0xC400_0000;

const FASTMEM_RESERVE: usize = 4 * 1024 * 1024 * 1024;

bitflags::bitflags! {
    /// Protection and kind flags for guest memory regions.
    pub struct RegionFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const MMIO    = 1 << 3;
    }
}

/// A guest region created through the loader surface.
#[derive(Debug, Copy, Clone)]
pub struct MemoryRegion {
    pub base: u32,
    pub size: u64,
    pub flags: RegionFlags,
}

/// Translate a guest virtual address to a physical one. The cached-virtual
/// mirror folds onto physical memory; everything else passes through.
pub fn translate_address(addr: u32) -> u32 {
    if (VIRT_BASE..VIRT_END).contains(&addr) {
        addr & PHYS_MASK
    } else {
        addr
    }
}

pub type MmioReadFn = dyn Fn(u32) -> u32 + Send + Sync;
pub type MmioWriteFn = dyn Fn(u32, u32) + Send + Sync;
pub type WriteCallback = dyn Fn(u32, u64) + Send + Sync;

struct MmioRange {
    base: u32,
    size: u64,
    read: Arc<MmioReadFn>,
    write: Arc<MmioWriteFn>,
}

struct WriteTrack {
    base: u32,
    size: u64,
    callback: Arc<WriteCallback>,
}

// The host backing for guest RAM. On unix hosts this is a 4 GB PROT_NONE
// reservation with the first 512 MB committed read/write, so that
// base + (guest & PHYS_MASK) is always a valid host address for the physical
// window. Elsewhere a plain heap allocation backs the committed span only.
struct HostMapping {
    base: *mut u8,
    #[cfg(unix)]
    reserved: usize,
    #[cfg(not(unix))]
    _storage: Vec<u8>,
}

unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

impl HostMapping {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        unsafe {
            let base = libc::mmap(
                std::ptr::null_mut(),
                FASTMEM_RESERVE,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(Error::FastmemSetup("reservation failed".into()));
            }
            let committed = libc::mmap(
                base,
                RAM_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            );
            if committed == libc::MAP_FAILED {
                libc::munmap(base, FASTMEM_RESERVE);
                return Err(Error::FastmemSetup("commit failed".into()));
            }
            Ok(HostMapping { base: base as *mut u8, reserved: FASTMEM_RESERVE })
        }
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        let mut storage = vec![0u8; RAM_SIZE];
        let base = storage.as_mut_ptr();
        Ok(HostMapping { base, _storage: storage })
    }
}

#[cfg(unix)]
impl Drop for HostMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.reserved);
        }
    }
}

// Per-thread reservation slot packed into one atomic word so that writers can
// invalidate with a single exchange before their store becomes visible:
// bit 63 = valid, bits 40..48 = size, bits 0..32 = address.
const RES_VALID: u64 = 1 << 63;

fn pack_reservation(addr: u32, size: u32) -> u64 {
    RES_VALID | ((size as u64 & 0xff) << 40) | addr as u64
}

fn reservation_overlaps(slot: u64, addr: u32, size: u64) -> bool {
    if slot & RES_VALID == 0 {
        return false;
    }
    let r_addr = translate_address(slot as u32) as u64;
    let r_size = (slot >> 40) & 0xff;
    let a = translate_address(addr) as u64;
    a < r_addr + r_size && r_addr < a + size
}

/// Access statistics, all best-effort counters.
#[derive(Debug, Default)]
pub struct MemoryStats {
    pub out_of_range_reads: AtomicU64,
    pub out_of_range_writes: AtomicU64,
    pub mmio_reads: AtomicU64,
    pub mmio_writes: AtomicU64,
}

pub struct GuestMemory {
    host: HostMapping,
    mmio: RwLock<Vec<MmioRange>>,
    tracks: RwLock<Vec<WriteTrack>>,
    regions: RwLock<Vec<MemoryRegion>>,
    reservations: [AtomicU64; crate::context::NUM_HW_THREADS as usize],
    time_base: AtomicU64,
    trace_memory: bool,
    trace_mmio: bool,
    pub stats: MemoryStats,
}

impl GuestMemory {
    pub fn new() -> Result<Self> {
        Self::with_tracing(false, false)
    }

    pub fn with_tracing(trace_memory: bool, trace_mmio: bool) -> Result<Self> {
        let host = HostMapping::new()?;
        debug!("guest RAM committed at {:p} ({} MB)", host.base, RAM_SIZE >> 20);
        Ok(GuestMemory {
            host,
            mmio: RwLock::new(Vec::new()),
            tracks: RwLock::new(Vec::new()),
            regions: RwLock::new(Vec::new()),
            reservations: Default::default(),
            time_base: AtomicU64::new(0),
            trace_memory,
            trace_mmio,
            stats: MemoryStats::default(),
        })
    }

    /// Base of the host window; `base + (guest & PHYS_MASK)` addresses the
    /// physical byte. The bytes are raw (no byte swap).
    pub fn host_fastmem_base(&self) -> *mut u8 {
        self.host.base
    }

    /// Host pointer for a guest address, or None for MMIO / out-of-range.
    pub fn host_ptr(&self, addr: u32) -> Option<*mut u8> {
        if self.find_mmio(addr).is_some() {
            return None;
        }
        let phys = translate_address(addr) as usize;
        if phys >= RAM_SIZE {
            return None;
        }
        Some(unsafe { self.host.base.add(phys) })
    }

    fn find_mmio(&self, addr: u32) -> Option<(Arc<MmioReadFn>, Arc<MmioWriteFn>)> {
        let mmio = self.mmio.read().unwrap();
        for range in mmio.iter() {
            if addr >= range.base && (addr as u64) < range.base as u64 + range.size {
                return Some((Arc::clone(&range.read), Arc::clone(&range.write)));
            }
        }
        None
    }

    pub fn register_mmio(
        &self,
        base: u32,
        size: u64,
        read: Arc<MmioReadFn>,
        write: Arc<MmioWriteFn>,
    ) -> Result<()> {
        let mut mmio = self.mmio.write().unwrap();
        for range in mmio.iter() {
            if (base as u64) < range.base as u64 + range.size
                && (range.base as u64) < base as u64 + size
            {
                return Err(Error::MmioOverlap { base });
            }
        }
        debug!("MMIO window registered at {:#010x}+{:#x}", base, size);
        mmio.push(MmioRange { base, size, read, write });
        Ok(())
    }

    pub fn unregister_mmio(&self, base: u32) -> Result<()> {
        let mut mmio = self.mmio.write().unwrap();
        match mmio.iter().position(|r| r.base == base) {
            Some(idx) => {
                mmio.remove(idx);
                Ok(())
            }
            None => Err(Error::MmioNotRegistered { base }),
        }
    }

    pub fn track_writes(&self, base: u32, size: u64, callback: Arc<WriteCallback>) {
        self.tracks.write().unwrap().push(WriteTrack { base, size, callback });
    }

    pub fn untrack_writes(&self, base: u32) {
        self.tracks.write().unwrap().retain(|t| t.base != base);
    }

    // Every successful RAM write funnels through here: reservations are
    // invalidated with an exchange before the store lands, tracking callbacks
    // fire after it.
    fn pre_write(&self, addr: u32, size: u64) {
        for slot in self.reservations.iter() {
            let cur = slot.load(Ordering::Acquire);
            if reservation_overlaps(cur, addr, size) {
                slot.compare_exchange(cur, 0, Ordering::AcqRel, Ordering::Relaxed).ok();
            }
        }
    }

    fn post_write(&self, addr: u32, size: u64) {
        let tracks = self.tracks.read().unwrap();
        for track in tracks.iter() {
            if (addr as u64) < track.base as u64 + track.size
                && (track.base as u64) < addr as u64 + size
            {
                (track.callback)(addr, size);
            }
        }
    }

    // ----- Scalar accessors (big-endian) -----

    fn ram_read<const N: usize>(&self, addr: u32) -> Option<[u8; N]> {
        let phys = translate_address(addr) as usize;
        if phys + N > RAM_SIZE {
            self.stats.out_of_range_reads.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut buf = [0u8; N];
        unsafe {
            std::ptr::copy_nonoverlapping(self.host.base.add(phys), buf.as_mut_ptr(), N);
        }
        Some(buf)
    }

    fn ram_write(&self, addr: u32, bytes: &[u8]) -> bool {
        let phys = translate_address(addr) as usize;
        if phys + bytes.len() > RAM_SIZE {
            self.stats.out_of_range_writes.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.pre_write(addr, bytes.len() as u64);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.host.base.add(phys), bytes.len());
        }
        self.post_write(addr, bytes.len() as u64);
        true
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        if let Some((read, _)) = self.find_mmio(addr) {
            self.stats.mmio_reads.fetch_add(1, Ordering::Relaxed);
            return read(addr) as u8;
        }
        self.ram_read::<1>(addr).map(|b| b[0]).unwrap_or(0)
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        if let Some((read, _)) = self.find_mmio(addr) {
            self.stats.mmio_reads.fetch_add(1, Ordering::Relaxed);
            return read(addr) as u16;
        }
        self.ram_read::<2>(addr).map(u16::from_be_bytes).unwrap_or(0)
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        if let Some((read, _)) = self.find_mmio(addr) {
            self.stats.mmio_reads.fetch_add(1, Ordering::Relaxed);
            return read(addr);
        }
        self.ram_read::<4>(addr).map(u32::from_be_bytes).unwrap_or(0)
    }

    pub fn read_u64(&self, addr: u32) -> u64 {
        if let Some((read, _)) = self.find_mmio(addr) {
            self.stats.mmio_reads.fetch_add(1, Ordering::Relaxed);
            let hi = read(addr) as u64;
            let lo = read(addr.wrapping_add(4)) as u64;
            return (hi << 32) | lo;
        }
        self.ram_read::<8>(addr).map(u64::from_be_bytes).unwrap_or(0)
    }

    pub fn write_u8(&self, addr: u32, value: u8) {
        if self.trace_memory {
            trace!("w8  {:#010x} <- {:#04x}", addr, value);
        }
        if let Some((_, write)) = self.find_mmio(addr) {
            self.stats.mmio_writes.fetch_add(1, Ordering::Relaxed);
            write(addr, value as u32);
            return;
        }
        self.ram_write(addr, &[value]);
    }

    pub fn write_u16(&self, addr: u32, value: u16) {
        if self.trace_memory {
            trace!("w16 {:#010x} <- {:#06x}", addr, value);
        }
        if let Some((_, write)) = self.find_mmio(addr) {
            self.stats.mmio_writes.fetch_add(1, Ordering::Relaxed);
            write(addr, value as u32);
            return;
        }
        self.ram_write(addr, &value.to_be_bytes());
    }

    pub fn write_u32(&self, addr: u32, value: u32) {
        if self.trace_memory {
            trace!("w32 {:#010x} <- {:#010x}", addr, value);
        }
        if let Some((_, write)) = self.find_mmio(addr) {
            self.stats.mmio_writes.fetch_add(1, Ordering::Relaxed);
            if self.trace_mmio {
                trace!("mmio w {:#010x} <- {:#010x}", addr, value);
            }
            write(addr, value);
            return;
        }
        self.ram_write(addr, &value.to_be_bytes());
    }

    pub fn write_u64(&self, addr: u32, value: u64) {
        if self.trace_memory {
            trace!("w64 {:#010x} <- {:#018x}", addr, value);
        }
        if let Some((_, write)) = self.find_mmio(addr) {
            self.stats.mmio_writes.fetch_add(1, Ordering::Relaxed);
            write(addr, (value >> 32) as u32);
            write(addr.wrapping_add(4), value as u32);
            return;
        }
        self.ram_write(addr, &value.to_be_bytes());
    }

    // ----- Bulk operations (RAM only, clamped) -----

    fn clamp(&self, addr: u32, size: u64) -> Option<(usize, usize)> {
        let phys = translate_address(addr) as usize;
        if phys >= RAM_SIZE {
            return None;
        }
        let len = size.min((RAM_SIZE - phys) as u64) as usize;
        Some((phys, len))
    }

    pub fn read_bytes(&self, addr: u32, dest: &mut [u8]) {
        if let Some((phys, len)) = self.clamp(addr, dest.len() as u64) {
            unsafe {
                std::ptr::copy_nonoverlapping(self.host.base.add(phys), dest.as_mut_ptr(), len);
            }
        }
    }

    pub fn write_bytes(&self, addr: u32, src: &[u8]) {
        if let Some((phys, len)) = self.clamp(addr, src.len() as u64) {
            self.pre_write(addr, len as u64);
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), self.host.base.add(phys), len);
            }
            self.post_write(addr, len as u64);
        }
    }

    pub fn zero_bytes(&self, addr: u32, size: u64) {
        if let Some((phys, len)) = self.clamp(addr, size) {
            self.pre_write(addr, len as u64);
            unsafe {
                std::ptr::write_bytes(self.host.base.add(phys), 0, len);
            }
            self.post_write(addr, len as u64);
        }
    }

    pub fn copy_bytes(&self, dest: u32, src: u32, size: u64) {
        let (sphys, slen) = match self.clamp(src, size) {
            Some(v) => v,
            None => return,
        };
        let (dphys, dlen) = match self.clamp(dest, size) {
            Some(v) => v,
            None => return,
        };
        let len = slen.min(dlen);
        self.pre_write(dest, len as u64);
        unsafe {
            std::ptr::copy(self.host.base.add(sphys), self.host.base.add(dphys), len);
        }
        self.post_write(dest, len as u64);
    }

    // ----- Reservations -----

    pub fn set_reservation(&self, thread_id: u32, addr: u32, size: u32) {
        if let Some(slot) = self.reservations.get(thread_id as usize) {
            slot.store(pack_reservation(addr, size), Ordering::Release);
        }
    }

    pub fn check_reservation(&self, thread_id: u32, addr: u32, size: u32) -> bool {
        match self.reservations.get(thread_id as usize) {
            Some(slot) => slot.load(Ordering::Acquire) == pack_reservation(addr, size),
            None => false,
        }
    }

    pub fn clear_reservation(&self, thread_id: u32) {
        if let Some(slot) = self.reservations.get(thread_id as usize) {
            slot.store(0, Ordering::Release);
        }
    }

    // ----- Region bookkeeping for the loader surface -----

    pub fn allocate(&self, base: u32, size: u64, flags: RegionFlags) -> Result<()> {
        let mut regions = self.regions.write().unwrap();
        for region in regions.iter() {
            if (base as u64) < region.base as u64 + region.size
                && (region.base as u64) < base as u64 + size
            {
                return Err(Error::RegionConflict { base });
            }
        }
        regions.push(MemoryRegion { base, size, flags });
        Ok(())
    }

    pub fn free(&self, base: u32) {
        self.regions.write().unwrap().retain(|r| r.base != base);
    }

    pub fn protect(&self, base: u32, size: u64, flags: RegionFlags) -> Result<()> {
        let mut regions = self.regions.write().unwrap();
        for region in regions.iter_mut() {
            if region.base == base && region.size == size {
                region.flags = flags;
                return Ok(());
            }
        }
        Err(Error::RegionConflict { base })
    }

    pub fn query(&self, addr: u32) -> Option<MemoryRegion> {
        let regions = self.regions.read().unwrap();
        regions
            .iter()
            .find(|r| addr >= r.base && (addr as u64) < r.base as u64 + r.size)
            .copied()
    }

    // ----- Time base -----

    pub fn advance_time_base(&self, cycles: u64) {
        self.time_base.fetch_add(cycles, Ordering::Relaxed);
    }

    pub fn time_base(&self) -> u64 {
        self.time_base.load(Ordering::Relaxed)
    }

    /// Overwrite the counter (guest kernels program it at boot).
    pub fn set_time_base(&self, value: u64) {
        self.time_base.store(value, Ordering::Relaxed);
    }

    /// Dump of non-MMIO reads going nowhere; used when a title wedges.
    pub fn log_access_counters(&self) {
        let r = self.stats.out_of_range_reads.load(Ordering::Relaxed);
        let w = self.stats.out_of_range_writes.load(Ordering::Relaxed);
        if r != 0 || w != 0 {
            warn!("out-of-range accesses: {} reads, {} writes", r, w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn physical_round_trip() {
        let mem = GuestMemory::new().unwrap();
        mem.write_u32(0x0010_0000, 0xDEAD_BEEF);
        assert_eq!(mem.read_u32(0x0010_0000), 0xDEAD_BEEF);
    }

    #[test]
    fn virtual_mirror_aliases_physical() {
        let mem = GuestMemory::new().unwrap();
        mem.write_u32(0x8200_0100, 0xCAFE_F00D);
        assert_eq!(mem.read_u32(0x0200_0100), 0xCAFE_F00D);
        assert_eq!(mem.read_u32(0x8200_0100), mem.read_u32(0x8200_0100 & PHYS_MASK));
    }

    #[test]
    fn stores_are_big_endian_in_host_bytes() {
        let mem = GuestMemory::new().unwrap();
        mem.write_u32(0x8200_0100, 0xDEAD_BEEF);
        let mut raw = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(
                mem.host_fastmem_base().add(0x0200_0100),
                raw.as_mut_ptr(),
                4,
            );
        }
        assert_eq!(raw, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn boundary_accesses() {
        let mem = GuestMemory::new().unwrap();
        mem.write_u32(0x1FFF_FFFC, 0x1234_5678);
        assert_eq!(mem.read_u32(0x1FFF_FFFC), 0x1234_5678);
        mem.write_u32(0x1FFF_FFFE, 0x9999_9999);
        assert_eq!(mem.read_u32(0x1FFF_FFFE), 0);
    }

    #[test]
    fn mmio_dispatch_and_unregister() {
        let mem = GuestMemory::new().unwrap();
        let last = Arc::new(AtomicU32::new(0));
        let last_w = Arc::clone(&last);
        mem.register_mmio(
            0x7FC8_0000,
            0x1000,
            Arc::new(|addr| addr ^ 0xFFFF_FFFF),
            Arc::new(move |_, value| last_w.store(value, Ordering::SeqCst)),
        )
        .unwrap();
        assert_eq!(mem.read_u32(0x7FC8_0004), !0x7FC8_0004);
        mem.write_u32(0x7FC8_0000, 77);
        assert_eq!(last.load(Ordering::SeqCst), 77);

        // Overlap is refused.
        assert!(mem
            .register_mmio(0x7FC8_0800, 0x1000, Arc::new(|_| 0), Arc::new(|_, _| ()))
            .is_err());

        mem.unregister_mmio(0x7FC8_0000).unwrap();
        assert_eq!(mem.read_u32(0x7FC8_0004), 0);
    }

    #[test]
    fn write_tracking_sees_scalar_and_bulk_writes() {
        let mem = GuestMemory::new().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_cb = Arc::clone(&hits);
        mem.track_writes(
            0x0030_0000,
            0x1000,
            Arc::new(move |_, _| {
                hits_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        mem.write_u32(0x0030_0010, 1);
        mem.write_bytes(0x0030_0020, &[1, 2, 3]);
        mem.write_u32(0x0040_0000, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        mem.untrack_writes(0x0030_0000);
        mem.write_u32(0x0030_0010, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reservation_invalidated_by_write() {
        let mem = GuestMemory::new().unwrap();
        mem.set_reservation(0, 0x0010_0000, 4);
        assert!(mem.check_reservation(0, 0x0010_0000, 4));
        mem.write_u32(0x0010_0000, 5);
        assert!(!mem.check_reservation(0, 0x0010_0000, 4));
    }

    #[test]
    fn reservation_invalidated_through_mirror_alias() {
        let mem = GuestMemory::new().unwrap();
        mem.set_reservation(1, 0x0010_0000, 4);
        mem.write_u32(0x8010_0000, 5);
        assert!(!mem.check_reservation(1, 0x0010_0000, 4));
    }

    #[test]
    fn reservation_clear_round_trip() {
        let mem = GuestMemory::new().unwrap();
        mem.set_reservation(2, 0x0020_0000, 8);
        mem.clear_reservation(2);
        assert!(!mem.check_reservation(2, 0x0020_0000, 8));
    }

    #[test]
    fn time_base_advances() {
        let mem = GuestMemory::new().unwrap();
        mem.advance_time_base(4);
        mem.advance_time_base(4);
        assert_eq!(mem.time_base(), 8);
    }
}
