// System-facing instructions: SPR moves, traps, sc, barriers and cache ops.

use crate::context::{interrupt, ThreadContext};
use crate::decoder::{DecodedInst, Op};
use crate::memory::GuestMemory;
use log::{debug, warn};
use std::sync::atomic::{fence, Ordering};

// SPR numbers the kernel and runtime actually touch.
const SPR_XER: u16 = 1;
const SPR_LR: u16 = 8;
const SPR_CTR: u16 = 9;
const SPR_TBL_READ: u16 = 268;
const SPR_TBU_READ: u16 = 269;
const SPR_TBL_WRITE: u16 = 284;
const SPR_TBU_WRITE: u16 = 285;

pub fn execute_spr(mem: &GuestMemory, ctx: &mut ThreadContext, inst: &DecodedInst) {
    let rd = inst.rd as usize;
    match inst.op {
        Op::Mfspr | Op::Mftb => {
            ctx.gpr[rd] = match inst.spr {
                SPR_XER => ctx.xer.to_u32() as u64,
                SPR_LR => ctx.lr,
                SPR_CTR => ctx.ctr,
                SPR_TBL_READ => mem.time_base() & 0xFFFF_FFFF,
                SPR_TBU_READ => mem.time_base() >> 32,
                other => {
                    debug!("mfspr from unmodeled SPR {}", other);
                    0
                }
            };
        }
        Op::Mtspr => match inst.spr {
            SPR_XER => ctx.xer = crate::context::Xer::from_u32(ctx.gpr[rd] as u32),
            SPR_LR => ctx.lr = ctx.gpr[rd],
            SPR_CTR => ctx.ctr = ctx.gpr[rd],
            SPR_TBL_WRITE => {
                let tb = mem.time_base();
                mem.set_time_base((tb & !0xFFFF_FFFF) | (ctx.gpr[rd] & 0xFFFF_FFFF));
            }
            SPR_TBU_WRITE => {
                let tb = mem.time_base();
                mem.set_time_base((tb & 0xFFFF_FFFF) | (ctx.gpr[rd] << 32));
            }
            other => debug!("mtspr to unmodeled SPR {}", other),
        },
        Op::Mfmsr => ctx.gpr[rd] = ctx.msr,
        Op::Mtmsrd => ctx.msr = ctx.gpr[rd],
        _ => unreachable!("non-SPR op routed to SPR unit"),
    }
}

pub fn execute_syscall(ctx: &mut ThreadContext, inst: &DecodedInst) {
    match inst.op {
        Op::Sc => {
            // PC is already past the sc; the dispatcher reads r0 for the id.
            ctx.interrupted = true;
            ctx.interrupt_reason = interrupt::SYSCALL;
        }
        Op::Rfid => {
            // Interrupt state is modeled abstractly; nothing to restore.
            debug!("rfid at {:#010x}", ctx.pc.wrapping_sub(4));
        }
        _ => unreachable!("non-syscall op routed to syscall unit"),
    }
}

pub fn execute_trap(ctx: &mut ThreadContext, inst: &DecodedInst, pc: u64) {
    let to = inst.rd;
    let (a, b): (i64, i64) = match inst.op {
        Op::Twi => (
            ctx.gpr[inst.ra as usize] as i32 as i64,
            inst.simm as i64,
        ),
        Op::Tw => (
            ctx.gpr[inst.ra as usize] as i32 as i64,
            ctx.gpr[inst.rb as usize] as i32 as i64,
        ),
        Op::Tdi => (ctx.gpr[inst.ra as usize] as i64, inst.simm as i64),
        Op::Td => (ctx.gpr[inst.ra as usize] as i64, ctx.gpr[inst.rb as usize] as i64),
        _ => unreachable!("non-trap op routed to trap unit"),
    };
    let (ua, ub) = (a as u64, b as u64);
    let fire = (to & 0x10 != 0 && a < b)
        || (to & 0x08 != 0 && a > b)
        || (to & 0x04 != 0 && a == b)
        || (to & 0x02 != 0 && ua < ub)
        || (to & 0x01 != 0 && ua > ub);
    if fire {
        warn!("trap taken at {:#010x}", pc);
        ctx.interrupted = true;
        ctx.interrupt_reason = interrupt::TRAP;
        ctx.fault_pc = pc;
    }
}

pub fn execute_sync(inst: &DecodedInst) {
    match inst.op {
        Op::Sync => fence(Ordering::SeqCst),
        Op::Lwsync => fence(Ordering::AcqRel),
        Op::Eieio => fence(Ordering::Release),
        Op::Isync => fence(Ordering::SeqCst),
        _ => unreachable!("non-barrier op routed to barrier unit"),
    }
}

pub fn execute_cache(mem: &GuestMemory, ctx: &mut ThreadContext, inst: &DecodedInst) {
    match inst.op {
        Op::Dcbz => {
            let ea = super::ea_x(ctx, inst) & !31;
            mem.zero_bytes(ea, 32);
        }
        // Hints and flushes have no observable effect on emulated memory.
        Op::Dcbf | Op::Dcbst | Op::Dcbt | Op::Dcbtst | Op::Icbi => {}
        _ => unreachable!("non-cache op routed to cache unit"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use std::sync::Arc;

    #[test]
    fn mflr_mtctr_round_trip() {
        let mem = Arc::new(GuestMemory::new().unwrap());
        let mut ctx = ThreadContext::new(0);
        ctx.lr = 0xBEEF;
        execute_spr(&mem, &mut ctx, &decode(0x7C08_02A6)); // mflr r0
        assert_eq!(ctx.gpr[0], 0xBEEF);
        execute_spr(&mem, &mut ctx, &decode(0x7C09_03A6)); // mtctr r0
        assert_eq!(ctx.ctr, 0xBEEF);
    }

    #[test]
    fn time_base_sprs_read_counter() {
        let mem = Arc::new(GuestMemory::new().unwrap());
        let mut ctx = ThreadContext::new(0);
        mem.set_time_base(0x1_2345_6789);
        // mfspr r3, 268
        let word = (31u32 << 26) | (3 << 21) | (12 << 16) | (8 << 11) | (339 << 1);
        execute_spr(&mem, &mut ctx, &decode(word));
        assert_eq!(ctx.gpr[3], 0x2345_6789);
        // mfspr r4, 269
        let word = (31u32 << 26) | (4 << 21) | (13 << 16) | (8 << 11) | (339 << 1);
        execute_spr(&mem, &mut ctx, &decode(word));
        assert_eq!(ctx.gpr[4], 1);
    }

    #[test]
    fn sc_interrupts_with_pc_past() {
        let mut ctx = ThreadContext::new(0);
        ctx.pc = 0x1004; // the interpreter advanced it already
        execute_syscall(&mut ctx, &decode(0x4400_0002));
        assert!(ctx.interrupted);
        assert_eq!(ctx.interrupt_reason, interrupt::SYSCALL);
        assert_eq!(ctx.pc, 0x1004);
    }

    #[test]
    fn trap_fires_on_condition() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[3] = 5;
        // twi 8, r3, 1 : trap if r3 > 1 signed
        let word = (3u32 << 26) | (8 << 21) | (3 << 16) | 1;
        execute_trap(&mut ctx, &decode(word), 0x2000);
        assert!(ctx.interrupted);
        assert_eq!(ctx.fault_pc, 0x2000);
    }

    #[test]
    fn dcbz_zeroes_aligned_line() {
        let mem = Arc::new(GuestMemory::new().unwrap());
        let mut ctx = ThreadContext::new(0);
        for i in 0..16 {
            mem.write_u32(0x0010_0000 + i * 4, 0xFFFF_FFFF);
        }
        ctx.gpr[4] = 0x0010_0010; // unaligned inside the line
        // dcbz 0, r4
        let word = (31u32 << 26) | (4 << 11) | (1014 << 1);
        execute_cache(&mem, &mut ctx, &decode(word));
        for i in 0..8 {
            assert_eq!(mem.read_u32(0x0010_0000 + i * 4), 0, "word {}", i);
        }
        assert_eq!(mem.read_u32(0x0010_0020), 0xFFFF_FFFF);
    }

    #[test]
    fn time_base_spr_reads_against_spr_numbers() {
        // mfspr encodes the SPR number with its halves swapped; 268 is
        // field 0b01000_01100.
        let d = decode((31u32 << 26) | (3 << 21) | (12 << 16) | (8 << 11) | (339 << 1));
        assert_eq!(d.spr, 268);
    }
}
