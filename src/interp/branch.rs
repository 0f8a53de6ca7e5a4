// Branch family. BO is decoded msb-first: 0x10 skips the CR test, 0x08 gives
// the wanted CR value, 0x04 skips the CTR decrement, 0x02 asks for CTR == 0.

use crate::context::ThreadContext;
use crate::decoder::{DecodedInst, Op};

fn condition_met(ctx: &mut ThreadContext, bo: u8, bi: u8) -> bool {
    if bo & 0x04 == 0 {
        ctx.ctr = ctx.ctr.wrapping_sub(1);
    }
    let ctr_ok = bo & 0x04 != 0 || (ctx.ctr == 0) == (bo & 0x02 != 0);
    let cond_ok = bo & 0x10 != 0 || ctx.cr_bit(bi) == (bo & 0x08 != 0);
    ctr_ok && cond_ok
}

pub fn execute(ctx: &mut ThreadContext, inst: &DecodedInst, pc: u64) {
    match inst.op {
        Op::B => {
            let target = if inst.aa {
                inst.li as i64 as u64
            } else {
                pc.wrapping_add(inst.li as i64 as u64)
            };
            if inst.lk {
                ctx.lr = pc.wrapping_add(4);
            }
            ctx.pc = target;
        }
        Op::Bc => {
            let taken = condition_met(ctx, inst.bo, inst.bi);
            if inst.lk {
                ctx.lr = pc.wrapping_add(4);
            }
            if taken {
                ctx.pc = if inst.aa {
                    inst.li as i64 as u64
                } else {
                    pc.wrapping_add(inst.li as i64 as u64)
                };
            }
        }
        Op::Bclr => {
            let taken = condition_met(ctx, inst.bo, inst.bi);
            let target = ctx.lr & !3;
            if inst.lk {
                ctx.lr = pc.wrapping_add(4);
            }
            if taken {
                ctx.pc = target;
            }
        }
        Op::Bcctr => {
            // No CTR decrement through the count register itself.
            let cond_ok = inst.bo & 0x10 != 0 || ctx.cr_bit(inst.bi) == (inst.bo & 0x08 != 0);
            if inst.lk {
                ctx.lr = pc.wrapping_add(4);
            }
            if cond_ok {
                ctx.pc = ctx.ctr & !3;
            }
        }
        _ => unreachable!("non-branch op routed to branch unit"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;

    fn exec(ctx: &mut ThreadContext, word: u32, pc: u64) {
        let inst = decode(word);
        ctx.pc = pc + 4;
        execute(ctx, &inst, pc);
    }

    #[test]
    fn unconditional_branch_and_link() {
        let mut ctx = ThreadContext::new(0);
        exec(&mut ctx, 0x4800_0009, 0x1000); // bl +8
        assert_eq!(ctx.pc, 0x1008);
        assert_eq!(ctx.lr, 0x1004);
    }

    #[test]
    fn bdnz_decrements_and_loops() {
        let mut ctx = ThreadContext::new(0);
        ctx.ctr = 2;
        // bdnz -8 : bo=16, bi=0
        let word = (16u32 << 26) | (16 << 21) | ((-8i32 as u32) & 0xFFFC);
        exec(&mut ctx, word, 0x2000);
        assert_eq!(ctx.ctr, 1);
        assert_eq!(ctx.pc, 0x1FF8);
        // Second time CTR hits zero and falls through.
        exec(&mut ctx, word, 0x1FF8);
        assert_eq!(ctx.ctr, 0);
        assert_eq!(ctx.pc, 0x1FFC);
    }

    #[test]
    fn beq_follows_cr_bit() {
        let mut ctx = ThreadContext::new(0);
        ctx.cr[0].eq = true;
        exec(&mut ctx, 0x4182_0010, 0x3000); // beq +0x10
        assert_eq!(ctx.pc, 0x3010);
        ctx.cr[0].eq = false;
        exec(&mut ctx, 0x4182_0010, 0x3000);
        assert_eq!(ctx.pc, 0x3004);
    }

    #[test]
    fn blr_masks_low_bits() {
        let mut ctx = ThreadContext::new(0);
        ctx.lr = 0x4003;
        exec(&mut ctx, 0x4E80_0020, 0x1000); // blr
        assert_eq!(ctx.pc, 0x4000);
    }

    #[test]
    fn bctrl_masks_and_links() {
        let mut ctx = ThreadContext::new(0);
        ctx.ctr = 0x5002;
        exec(&mut ctx, 0x4E80_0421, 0x1000); // bctrl
        assert_eq!(ctx.pc, 0x5000);
        assert_eq!(ctx.lr, 0x1004);
    }
}
