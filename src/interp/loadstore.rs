// Loads and stores, including update forms, byte-reversed and multiple
// variants, the reservation pair, and the float/vector transfers.

use super::{ea_d, ea_x};
use crate::context::{ThreadContext, VectorReg};
use crate::decoder::{DecodedInst, Op};
use crate::memory::GuestMemory;

pub fn execute(mem: &GuestMemory, ctx: &mut ThreadContext, inst: &DecodedInst) {
    let rd = inst.rd as usize;
    let ra = inst.ra as usize;
    match inst.op {
        // ----- Byte loads -----
        Op::Lbz => ctx.gpr[rd] = mem.read_u8(ea_d(ctx, inst)) as u64,
        Op::Lbzx => ctx.gpr[rd] = mem.read_u8(ea_x(ctx, inst)) as u64,
        Op::Lbzu => {
            let ea = ea_d(ctx, inst);
            ctx.gpr[rd] = mem.read_u8(ea) as u64;
            ctx.gpr[ra] = ea as u64;
        }
        Op::Lbzux => {
            let ea = ea_x(ctx, inst);
            ctx.gpr[rd] = mem.read_u8(ea) as u64;
            ctx.gpr[ra] = ea as u64;
        }
        // ----- Half loads -----
        Op::Lhz => ctx.gpr[rd] = mem.read_u16(ea_d(ctx, inst)) as u64,
        Op::Lhzx => ctx.gpr[rd] = mem.read_u16(ea_x(ctx, inst)) as u64,
        Op::Lhzu => {
            let ea = ea_d(ctx, inst);
            ctx.gpr[rd] = mem.read_u16(ea) as u64;
            ctx.gpr[ra] = ea as u64;
        }
        Op::Lhzux => {
            let ea = ea_x(ctx, inst);
            ctx.gpr[rd] = mem.read_u16(ea) as u64;
            ctx.gpr[ra] = ea as u64;
        }
        Op::Lha => ctx.gpr[rd] = mem.read_u16(ea_d(ctx, inst)) as i16 as i64 as u64,
        Op::Lhax => ctx.gpr[rd] = mem.read_u16(ea_x(ctx, inst)) as i16 as i64 as u64,
        Op::Lhau => {
            let ea = ea_d(ctx, inst);
            ctx.gpr[rd] = mem.read_u16(ea) as i16 as i64 as u64;
            ctx.gpr[ra] = ea as u64;
        }
        Op::Lhaux => {
            let ea = ea_x(ctx, inst);
            ctx.gpr[rd] = mem.read_u16(ea) as i16 as i64 as u64;
            ctx.gpr[ra] = ea as u64;
        }
        // ----- Word loads -----
        Op::Lwz => ctx.gpr[rd] = mem.read_u32(ea_d(ctx, inst)) as u64,
        Op::Lwzx => ctx.gpr[rd] = mem.read_u32(ea_x(ctx, inst)) as u64,
        Op::Lwzu => {
            let ea = ea_d(ctx, inst);
            ctx.gpr[rd] = mem.read_u32(ea) as u64;
            ctx.gpr[ra] = ea as u64;
        }
        Op::Lwzux => {
            let ea = ea_x(ctx, inst);
            ctx.gpr[rd] = mem.read_u32(ea) as u64;
            ctx.gpr[ra] = ea as u64;
        }
        Op::Lwa => ctx.gpr[rd] = mem.read_u32(ea_d(ctx, inst)) as i32 as i64 as u64,
        Op::Lwax => ctx.gpr[rd] = mem.read_u32(ea_x(ctx, inst)) as i32 as i64 as u64,
        Op::Lwaux => {
            let ea = ea_x(ctx, inst);
            ctx.gpr[rd] = mem.read_u32(ea) as i32 as i64 as u64;
            ctx.gpr[ra] = ea as u64;
        }
        // ----- Doubleword loads -----
        Op::Ld => ctx.gpr[rd] = mem.read_u64(ea_d(ctx, inst)),
        Op::Ldx => ctx.gpr[rd] = mem.read_u64(ea_x(ctx, inst)),
        Op::Ldu => {
            let ea = ea_d(ctx, inst);
            ctx.gpr[rd] = mem.read_u64(ea);
            ctx.gpr[ra] = ea as u64;
        }
        Op::Ldux => {
            let ea = ea_x(ctx, inst);
            ctx.gpr[rd] = mem.read_u64(ea);
            ctx.gpr[ra] = ea as u64;
        }
        // ----- Byte-reversed -----
        Op::Lhbrx => ctx.gpr[rd] = mem.read_u16(ea_x(ctx, inst)).swap_bytes() as u64,
        Op::Lwbrx => ctx.gpr[rd] = mem.read_u32(ea_x(ctx, inst)).swap_bytes() as u64,
        Op::Sthbrx => {
            mem.write_u16(ea_x(ctx, inst), (ctx.gpr[rd] as u16).swap_bytes());
        }
        Op::Stwbrx => {
            mem.write_u32(ea_x(ctx, inst), (ctx.gpr[rd] as u32).swap_bytes());
        }
        // ----- Multiple -----
        Op::Lmw => {
            let mut ea = ea_d(ctx, inst);
            for r in rd..32 {
                ctx.gpr[r] = mem.read_u32(ea) as u64;
                ea = ea.wrapping_add(4);
            }
        }
        Op::Stmw => {
            let mut ea = ea_d(ctx, inst);
            for r in rd..32 {
                mem.write_u32(ea, ctx.gpr[r] as u32);
                ea = ea.wrapping_add(4);
            }
        }
        // ----- Reservation pair -----
        Op::Lwarx => {
            let ea = ea_x(ctx, inst);
            mem.set_reservation(ctx.hw_thread, ea, 4);
            ctx.reserve_addr = ea;
            ctx.reserve_size = 4;
            ctx.reserve_valid = true;
            ctx.gpr[rd] = mem.read_u32(ea) as u64;
        }
        Op::Ldarx => {
            let ea = ea_x(ctx, inst);
            mem.set_reservation(ctx.hw_thread, ea, 8);
            ctx.reserve_addr = ea;
            ctx.reserve_size = 8;
            ctx.reserve_valid = true;
            ctx.gpr[rd] = mem.read_u64(ea);
        }
        Op::Stwcx => {
            let ea = ea_x(ctx, inst);
            let ok = mem.check_reservation(ctx.hw_thread, ea, 4);
            if ok {
                mem.write_u32(ea, ctx.gpr[rd] as u32);
            }
            finish_store_conditional(mem, ctx, ok);
        }
        Op::Stdcx => {
            let ea = ea_x(ctx, inst);
            let ok = mem.check_reservation(ctx.hw_thread, ea, 8);
            if ok {
                mem.write_u64(ea, ctx.gpr[rd]);
            }
            finish_store_conditional(mem, ctx, ok);
        }
        // ----- Stores -----
        Op::Stb => mem.write_u8(ea_d(ctx, inst), ctx.gpr[rd] as u8),
        Op::Stbx => mem.write_u8(ea_x(ctx, inst), ctx.gpr[rd] as u8),
        Op::Stbu => {
            let ea = ea_d(ctx, inst);
            mem.write_u8(ea, ctx.gpr[rd] as u8);
            ctx.gpr[ra] = ea as u64;
        }
        Op::Stbux => {
            let ea = ea_x(ctx, inst);
            mem.write_u8(ea, ctx.gpr[rd] as u8);
            ctx.gpr[ra] = ea as u64;
        }
        Op::Sth => mem.write_u16(ea_d(ctx, inst), ctx.gpr[rd] as u16),
        Op::Sthx => mem.write_u16(ea_x(ctx, inst), ctx.gpr[rd] as u16),
        Op::Sthu => {
            let ea = ea_d(ctx, inst);
            mem.write_u16(ea, ctx.gpr[rd] as u16);
            ctx.gpr[ra] = ea as u64;
        }
        Op::Sthux => {
            let ea = ea_x(ctx, inst);
            mem.write_u16(ea, ctx.gpr[rd] as u16);
            ctx.gpr[ra] = ea as u64;
        }
        Op::Stw => mem.write_u32(ea_d(ctx, inst), ctx.gpr[rd] as u32),
        Op::Stwx => mem.write_u32(ea_x(ctx, inst), ctx.gpr[rd] as u32),
        Op::Stwu => {
            let ea = ea_d(ctx, inst);
            mem.write_u32(ea, ctx.gpr[rd] as u32);
            ctx.gpr[ra] = ea as u64;
        }
        Op::Stwux => {
            let ea = ea_x(ctx, inst);
            mem.write_u32(ea, ctx.gpr[rd] as u32);
            ctx.gpr[ra] = ea as u64;
        }
        Op::Std => mem.write_u64(ea_d(ctx, inst), ctx.gpr[rd]),
        Op::Stdx => mem.write_u64(ea_x(ctx, inst), ctx.gpr[rd]),
        Op::Stdu => {
            let ea = ea_d(ctx, inst);
            mem.write_u64(ea, ctx.gpr[rd]);
            ctx.gpr[ra] = ea as u64;
        }
        Op::Stdux => {
            let ea = ea_x(ctx, inst);
            mem.write_u64(ea, ctx.gpr[rd]);
            ctx.gpr[ra] = ea as u64;
        }
        // ----- Float transfers; singles convert at the boundary -----
        Op::Lfs => ctx.fpr[rd] = f32::from_bits(mem.read_u32(ea_d(ctx, inst))) as f64,
        Op::Lfsx => ctx.fpr[rd] = f32::from_bits(mem.read_u32(ea_x(ctx, inst))) as f64,
        Op::Lfsu => {
            let ea = ea_d(ctx, inst);
            ctx.fpr[rd] = f32::from_bits(mem.read_u32(ea)) as f64;
            ctx.gpr[ra] = ea as u64;
        }
        Op::Lfsux => {
            let ea = ea_x(ctx, inst);
            ctx.fpr[rd] = f32::from_bits(mem.read_u32(ea)) as f64;
            ctx.gpr[ra] = ea as u64;
        }
        Op::Lfd => ctx.fpr[rd] = f64::from_bits(mem.read_u64(ea_d(ctx, inst))),
        Op::Lfdx => ctx.fpr[rd] = f64::from_bits(mem.read_u64(ea_x(ctx, inst))),
        Op::Lfdu => {
            let ea = ea_d(ctx, inst);
            ctx.fpr[rd] = f64::from_bits(mem.read_u64(ea));
            ctx.gpr[ra] = ea as u64;
        }
        Op::Lfdux => {
            let ea = ea_x(ctx, inst);
            ctx.fpr[rd] = f64::from_bits(mem.read_u64(ea));
            ctx.gpr[ra] = ea as u64;
        }
        Op::Stfs => mem.write_u32(ea_d(ctx, inst), (ctx.fpr[rd] as f32).to_bits()),
        Op::Stfsx => mem.write_u32(ea_x(ctx, inst), (ctx.fpr[rd] as f32).to_bits()),
        Op::Stfsu => {
            let ea = ea_d(ctx, inst);
            mem.write_u32(ea, (ctx.fpr[rd] as f32).to_bits());
            ctx.gpr[ra] = ea as u64;
        }
        Op::Stfsux => {
            let ea = ea_x(ctx, inst);
            mem.write_u32(ea, (ctx.fpr[rd] as f32).to_bits());
            ctx.gpr[ra] = ea as u64;
        }
        Op::Stfd => mem.write_u64(ea_d(ctx, inst), ctx.fpr[rd].to_bits()),
        Op::Stfdx => mem.write_u64(ea_x(ctx, inst), ctx.fpr[rd].to_bits()),
        Op::Stfdu => {
            let ea = ea_d(ctx, inst);
            mem.write_u64(ea, ctx.fpr[rd].to_bits());
            ctx.gpr[ra] = ea as u64;
        }
        Op::Stfdux => {
            let ea = ea_x(ctx, inst);
            mem.write_u64(ea, ctx.fpr[rd].to_bits());
            ctx.gpr[ra] = ea as u64;
        }
        // ----- Vector transfers, 16-byte aligned -----
        Op::Lvx => {
            let ea = ea_x(ctx, inst) & !15;
            let mut bytes = [0u8; 16];
            mem.read_bytes(ea, &mut bytes);
            ctx.vr[rd] = VectorReg::from_be_bytes(bytes);
        }
        Op::Stvx => {
            let ea = ea_x(ctx, inst) & !15;
            mem.write_bytes(ea, &ctx.vr[rd].to_be_bytes());
        }
        _ => unreachable!("non-memory op routed to load/store unit"),
    }
}

// CR0 reports the outcome: EQ on success, SO copied; the reservation is
// consumed either way.
fn finish_store_conditional(mem: &GuestMemory, ctx: &mut ThreadContext, ok: bool) {
    mem.clear_reservation(ctx.hw_thread);
    ctx.reserve_valid = false;
    ctx.cr[0].lt = false;
    ctx.cr[0].gt = false;
    ctx.cr[0].eq = ok;
    ctx.cr[0].so = ctx.xer.so;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use std::sync::Arc;

    fn machine() -> (Arc<GuestMemory>, ThreadContext) {
        (Arc::new(GuestMemory::new().unwrap()), ThreadContext::new(0))
    }

    #[test]
    fn update_form_writes_back_effective_address() {
        let (mem, mut ctx) = machine();
        mem.write_u32(0x0010_0010, 0x1122_3344);
        ctx.gpr[4] = 0x0010_0000;
        // lwzu r3, 0x10(r4)
        let inst = decode((33u32 << 26) | (3 << 21) | (4 << 16) | 0x10);
        execute(&mem, &mut ctx, &inst);
        assert_eq!(ctx.gpr[3], 0x1122_3344);
        assert_eq!(ctx.gpr[4], 0x0010_0010);
    }

    #[test]
    fn byte_reversed_load() {
        let (mem, mut ctx) = machine();
        mem.write_u32(0x0010_0000, 0x1122_3344);
        ctx.gpr[4] = 0x0010_0000;
        // lwbrx r3, 0, r4
        let inst = decode((31u32 << 26) | (3 << 21) | (4 << 11) | (534 << 1));
        execute(&mem, &mut ctx, &inst);
        assert_eq!(ctx.gpr[3], 0x4433_2211);
    }

    #[test]
    fn store_multiple_walks_registers() {
        let (mem, mut ctx) = machine();
        for r in 29..32 {
            ctx.gpr[r] = r as u64;
        }
        ctx.gpr[4] = 0x0020_0000;
        // stmw r29, 0(r4)
        let inst = decode((47u32 << 26) | (29 << 21) | (4 << 16));
        execute(&mem, &mut ctx, &inst);
        assert_eq!(mem.read_u32(0x0020_0000), 29);
        assert_eq!(mem.read_u32(0x0020_0004), 30);
        assert_eq!(mem.read_u32(0x0020_0008), 31);
    }

    #[test]
    fn store_conditional_fails_after_foreign_write() {
        let (mem, mut ctx) = machine();
        ctx.gpr[4] = 0x0010_0000;
        // lwarx r3, 0, r4
        let lwarx = decode((31u32 << 26) | (3 << 21) | (4 << 11) | (20 << 1));
        execute(&mem, &mut ctx, &lwarx);
        assert!(mem.check_reservation(0, 0x0010_0000, 4));
        // Another thread stores to the reserved word.
        mem.write_u32(0x0010_0000, 0x5555_5555);
        ctx.gpr[5] = 0xAAAA_AAAA;
        // stwcx. r5, 0, r4
        let stwcx = decode((31u32 << 26) | (5 << 21) | (4 << 11) | (150 << 1) | 1);
        execute(&mem, &mut ctx, &stwcx);
        assert!(!ctx.cr[0].eq);
        assert!(!mem.check_reservation(0, 0x0010_0000, 4));
        assert_eq!(mem.read_u32(0x0010_0000), 0x5555_5555);
    }

    #[test]
    fn store_conditional_succeeds_unmolested() {
        let (mem, mut ctx) = machine();
        ctx.gpr[4] = 0x0010_0000;
        let lwarx = decode((31u32 << 26) | (3 << 21) | (4 << 11) | (20 << 1));
        execute(&mem, &mut ctx, &lwarx);
        ctx.gpr[5] = 0x1234_5678;
        let stwcx = decode((31u32 << 26) | (5 << 21) | (4 << 11) | (150 << 1) | 1);
        execute(&mem, &mut ctx, &stwcx);
        assert!(ctx.cr[0].eq);
        assert_eq!(mem.read_u32(0x0010_0000), 0x1234_5678);
    }

    #[test]
    fn vector_round_trip() {
        let (mem, mut ctx) = machine();
        ctx.gpr[4] = 0x0030_0000;
        ctx.vr[7] = VectorReg { w: [1, 2, 3, 4] };
        // stvx v7, 0, r4 then lvx v8, 0, r4
        let stvx = decode((31u32 << 26) | (7 << 21) | (4 << 11) | (231 << 1));
        execute(&mem, &mut ctx, &stvx);
        let lvx = decode((31u32 << 26) | (8 << 21) | (4 << 11) | (103 << 1));
        execute(&mem, &mut ctx, &lvx);
        assert_eq!(ctx.vr[8], ctx.vr[7]);
    }
}
