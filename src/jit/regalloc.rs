// Block-local mapping of guest GPRs onto host registers. Mapped registers
// come from the callee-saved pool so they survive helper calls; temps come
// from the caller-saved pool and never live across one.

use super::emitter::{Arm64Emitter, Reg, X10, X11, X12, X13, X14, X15, X19, X21, X22, X23, X24, X25, X26, X9};
use super::off_gpr;

pub const MAP_POOL: [Reg; 6] = [X21, X22, X23, X24, X25, X26];
pub const TEMP_POOL: [Reg; 7] = [X9, X10, X11, X12, X13, X14, X15];

pub struct RegisterAllocator {
    ppc_to_host: [Option<Reg>; 32],
    host_to_ppc: [Option<u8>; 6],
    dirty: u32,
    temp_in_use: u8,
    // Slots holding operands of the instruction being translated; never
    // eviction victims until unpinned.
    pinned: u8,
    victim: usize,
}

impl RegisterAllocator {
    pub fn new() -> Self {
        RegisterAllocator {
            ppc_to_host: [None; 32],
            host_to_ppc: [None; 6],
            dirty: 0,
            temp_in_use: 0,
            pinned: 0,
            victim: 0,
        }
    }

    /// Fresh state at the start of every block.
    pub fn reset(&mut self) {
        *self = RegisterAllocator::new();
    }

    fn pool_slot(host: Reg) -> usize {
        MAP_POOL.iter().position(|&r| r == host).expect("host reg in map pool")
    }

    /// Host register holding the guest GPR, loading it on first use. The
    /// slot stays pinned until `unpin_all`.
    pub fn get(&mut self, e: &mut Arm64Emitter, ppc: usize) -> Reg {
        if let Some(host) = self.ppc_to_host[ppc] {
            self.pinned |= 1 << Self::pool_slot(host);
            return host;
        }
        let host = self.take_slot(e);
        e.ldr(host, X19, off_gpr(ppc));
        self.bind(ppc, host);
        host
    }

    /// Host register for a guest GPR that will be fully overwritten; skips
    /// the load and marks the mapping dirty.
    pub fn get_dest(&mut self, e: &mut Arm64Emitter, ppc: usize) -> Reg {
        let host = match self.ppc_to_host[ppc] {
            Some(host) => {
                self.pinned |= 1 << Self::pool_slot(host);
                host
            }
            None => {
                let host = self.take_slot(e);
                self.bind(ppc, host);
                host
            }
        };
        self.mark_dirty(ppc);
        host
    }

    /// Release operand pins at the end of an instruction.
    pub fn unpin_all(&mut self) {
        self.pinned = 0;
    }

    pub fn mark_dirty(&mut self, ppc: usize) {
        self.dirty |= 1 << ppc;
    }

    fn bind(&mut self, ppc: usize, host: Reg) {
        let slot = Self::pool_slot(host);
        self.ppc_to_host[ppc] = Some(host);
        self.host_to_ppc[slot] = Some(ppc as u8);
        self.pinned |= 1 << slot;
    }

    // Round-robin eviction when the pool is full; the victim is written back
    // if dirty before its register is handed out again. Pinned slots are
    // skipped.
    fn take_slot(&mut self, e: &mut Arm64Emitter) -> Reg {
        for (slot, occupant) in self.host_to_ppc.iter().enumerate() {
            if occupant.is_none() && self.pinned & (1 << slot) == 0 {
                return MAP_POOL[slot];
            }
        }
        let mut slot = self.victim;
        let mut tries = 0;
        while self.pinned & (1 << slot) != 0 {
            slot = (slot + 1) % MAP_POOL.len();
            tries += 1;
            assert!(tries <= MAP_POOL.len(), "every mapping slot is pinned");
        }
        self.victim = (slot + 1) % MAP_POOL.len();
        let host = MAP_POOL[slot];
        let ppc = self.host_to_ppc[slot].expect("occupied slot") as usize;
        if self.dirty & (1 << ppc) != 0 {
            e.str(host, X19, off_gpr(ppc));
            self.dirty &= !(1 << ppc);
        }
        self.ppc_to_host[ppc] = None;
        self.host_to_ppc[slot] = None;
        host
    }

    /// Write every dirty mapping back to the context. Mappings stay valid.
    pub fn flush_all(&mut self, e: &mut Arm64Emitter) {
        for ppc in 0..32 {
            if self.dirty & (1 << ppc) != 0 {
                let host = self.ppc_to_host[ppc].expect("dirty reg is mapped");
                e.str(host, X19, off_gpr(ppc));
            }
        }
        self.dirty = 0;
    }

    pub fn alloc_temp(&mut self) -> Reg {
        for (i, &r) in TEMP_POOL.iter().enumerate() {
            if self.temp_in_use & (1 << i) == 0 {
                self.temp_in_use |= 1 << i;
                return r;
            }
        }
        panic!("temp pool exhausted");
    }

    pub fn free_temp(&mut self, reg: Reg) {
        let i = TEMP_POOL.iter().position(|&r| r == reg).expect("temp reg");
        self.temp_in_use &= !(1 << i);
    }

    pub fn free_all_temps(&mut self) {
        self.temp_in_use = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_load_once_and_spill_round_robin() {
        let mut buf = [0u8; 1024];
        let mut e = Arm64Emitter::new(&mut buf);
        let mut ra = RegisterAllocator::new();
        let h3 = ra.get(&mut e, 3);
        let again = ra.get(&mut e, 3);
        assert_eq!(h3, again);
        assert_eq!(e.pos(), 4); // one load only
        ra.unpin_all();

        // Fill the pool; the seventh mapping evicts one.
        for r in 4..9 {
            ra.get(&mut e, r);
            ra.unpin_all();
        }
        let before = e.pos();
        let h9 = ra.get(&mut e, 9);
        assert!(MAP_POOL.contains(&h9));
        // Clean victim: just a load, no spill store.
        assert_eq!(e.pos(), before + 4);
    }

    #[test]
    fn dirty_eviction_stores_back() {
        let mut buf = [0u8; 1024];
        let mut e = Arm64Emitter::new(&mut buf);
        let mut ra = RegisterAllocator::new();
        for r in 0..6 {
            ra.get_dest(&mut e, r);
            ra.unpin_all();
        }
        let before = e.pos();
        ra.get(&mut e, 10); // spill store + load
        assert_eq!(e.pos(), before + 8);
    }

    #[test]
    fn flush_all_clears_dirty() {
        let mut buf = [0u8; 1024];
        let mut e = Arm64Emitter::new(&mut buf);
        let mut ra = RegisterAllocator::new();
        ra.get_dest(&mut e, 1);
        ra.get_dest(&mut e, 2);
        let before = e.pos();
        ra.flush_all(&mut e);
        assert_eq!(e.pos(), before + 8);
        ra.flush_all(&mut e);
        assert_eq!(e.pos(), before + 8); // second flush is a no-op
    }

    #[test]
    fn temps_recycle() {
        let mut ra = RegisterAllocator::new();
        let t1 = ra.alloc_temp();
        ra.free_temp(t1);
        let t2 = ra.alloc_temp();
        assert_eq!(t1, t2);
    }
}
