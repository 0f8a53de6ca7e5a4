// Scalar floating point. FPRs hold doubles; single-precision forms round the
// result at the end of the operation. FPSCR modeling covers the FPCC nibble
// and the sticky invalid bit, which is what shipping titles actually read.

use crate::context::ThreadContext;
use crate::decoder::{DecodedInst, Op};

const FPCC_SHIFT: u32 = 12;
const FPCC_MASK: u32 = 0xF << FPCC_SHIFT;
const FPCC_LT: u32 = 8;
const FPCC_GT: u32 = 4;
const FPCC_EQ: u32 = 2;
const FPCC_UN: u32 = 1;

fn set_fpcc(ctx: &mut ThreadContext, nibble: u32) {
    ctx.fpscr = (ctx.fpscr & !FPCC_MASK) | (nibble << FPCC_SHIFT);
}

// Rc=1 float forms copy the exception summary nibble into CR1; with the
// abbreviated FPSCR model that nibble is all zeros.
fn maybe_cr1(ctx: &mut ThreadContext, inst: &DecodedInst) {
    if inst.rc {
        ctx.cr[1] = crate::context::CrField::default();
    }
}

pub fn execute(ctx: &mut ThreadContext, inst: &DecodedInst) {
    let rd = inst.rd as usize;
    let ra = inst.ra as usize;
    let rb = inst.rb as usize;
    let rc = inst.vc as usize; // A-form frC
    match inst.op {
        Op::Fadd => ctx.fpr[rd] = ctx.fpr[ra] + ctx.fpr[rb],
        Op::Fadds => ctx.fpr[rd] = (ctx.fpr[ra] + ctx.fpr[rb]) as f32 as f64,
        Op::Fsub => ctx.fpr[rd] = ctx.fpr[ra] - ctx.fpr[rb],
        Op::Fsubs => ctx.fpr[rd] = (ctx.fpr[ra] - ctx.fpr[rb]) as f32 as f64,
        Op::Fmul => ctx.fpr[rd] = ctx.fpr[ra] * ctx.fpr[rc],
        Op::Fmuls => ctx.fpr[rd] = (ctx.fpr[ra] * ctx.fpr[rc]) as f32 as f64,
        Op::Fdiv => ctx.fpr[rd] = ctx.fpr[ra] / ctx.fpr[rb],
        Op::Fdivs => ctx.fpr[rd] = (ctx.fpr[ra] / ctx.fpr[rb]) as f32 as f64,
        Op::Fmadd => ctx.fpr[rd] = ctx.fpr[ra].mul_add(ctx.fpr[rc], ctx.fpr[rb]),
        Op::Fmadds => ctx.fpr[rd] = ctx.fpr[ra].mul_add(ctx.fpr[rc], ctx.fpr[rb]) as f32 as f64,
        Op::Fmsub => ctx.fpr[rd] = ctx.fpr[ra].mul_add(ctx.fpr[rc], -ctx.fpr[rb]),
        Op::Fmsubs => ctx.fpr[rd] = ctx.fpr[ra].mul_add(ctx.fpr[rc], -ctx.fpr[rb]) as f32 as f64,
        Op::Fnmadd => ctx.fpr[rd] = -ctx.fpr[ra].mul_add(ctx.fpr[rc], ctx.fpr[rb]),
        Op::Fnmadds => {
            ctx.fpr[rd] = (-ctx.fpr[ra].mul_add(ctx.fpr[rc], ctx.fpr[rb])) as f32 as f64
        }
        Op::Fnmsub => ctx.fpr[rd] = -ctx.fpr[ra].mul_add(ctx.fpr[rc], -ctx.fpr[rb]),
        Op::Fnmsubs => {
            ctx.fpr[rd] = (-ctx.fpr[ra].mul_add(ctx.fpr[rc], -ctx.fpr[rb])) as f32 as f64
        }
        Op::Fsqrt => ctx.fpr[rd] = ctx.fpr[rb].sqrt(),
        Op::Fsqrts => ctx.fpr[rd] = ctx.fpr[rb].sqrt() as f32 as f64,
        Op::Fres => ctx.fpr[rd] = (1.0 / ctx.fpr[rb]) as f32 as f64,
        Op::Frsqrte => ctx.fpr[rd] = 1.0 / ctx.fpr[rb].sqrt(),
        Op::Fsel => {
            ctx.fpr[rd] = if ctx.fpr[ra] >= 0.0 { ctx.fpr[rc] } else { ctx.fpr[rb] };
        }
        Op::Fneg => ctx.fpr[rd] = -ctx.fpr[rb],
        Op::Fmr => ctx.fpr[rd] = ctx.fpr[rb],
        Op::Fabs => ctx.fpr[rd] = ctx.fpr[rb].abs(),
        Op::Fnabs => ctx.fpr[rd] = -ctx.fpr[rb].abs(),
        Op::Frsp => ctx.fpr[rd] = ctx.fpr[rb] as f32 as f64,
        Op::Fctiw | Op::Fctiwz => {
            // Round-toward-zero is the only mode the titles use in practice.
            let v = ctx.fpr[rb];
            let res = if v.is_nan() {
                i32::MIN
            } else if v >= i32::MAX as f64 {
                i32::MAX
            } else if v <= i32::MIN as f64 {
                i32::MIN
            } else {
                v.trunc() as i32
            };
            ctx.fpr[rd] = f64::from_bits(res as u32 as u64);
        }
        Op::Fctid | Op::Fctidz => {
            let v = ctx.fpr[rb];
            let res = if v.is_nan() {
                i64::MIN
            } else if v >= i64::MAX as f64 {
                i64::MAX
            } else if v <= i64::MIN as f64 {
                i64::MIN
            } else {
                v.trunc() as i64
            };
            ctx.fpr[rd] = f64::from_bits(res as u64);
        }
        Op::Fcfid => {
            ctx.fpr[rd] = ctx.fpr[rb].to_bits() as i64 as f64;
        }
        Op::Fcmpu | Op::Fcmpo => {
            let a = ctx.fpr[ra];
            let b = ctx.fpr[rb];
            let field = inst.crfd as usize;
            let (lt, gt, eq, un);
            if a.is_nan() || b.is_nan() {
                lt = false;
                gt = false;
                eq = false;
                un = true;
                // Ordered compare of NaN raises invalid; record it sticky.
                if inst.op == Op::Fcmpo {
                    ctx.fpscr |= 1 << 29;
                }
            } else {
                lt = a < b;
                gt = a > b;
                eq = a == b;
                un = false;
            }
            ctx.cr[field].lt = lt;
            ctx.cr[field].gt = gt;
            ctx.cr[field].eq = eq;
            ctx.cr[field].so = un;
            set_fpcc(
                ctx,
                (lt as u32 * FPCC_LT)
                    | (gt as u32 * FPCC_GT)
                    | (eq as u32 * FPCC_EQ)
                    | (un as u32 * FPCC_UN),
            );
            return;
        }
        Op::Mffs => {
            ctx.fpr[rd] = f64::from_bits(ctx.fpscr as u64);
            maybe_cr1(ctx, inst);
            return;
        }
        Op::Mtfsf => {
            let fm = (inst.raw >> 17) & 0xFF;
            let bits = ctx.fpr[rb].to_bits() as u32;
            let mut mask = 0u32;
            for field in 0..8 {
                if fm & (0x80 >> field) != 0 {
                    mask |= 0xF << (28 - field * 4);
                }
            }
            ctx.fpscr = (ctx.fpscr & !mask) | (bits & mask);
            maybe_cr1(ctx, inst);
            return;
        }
        _ => unreachable!("non-float op routed to float unit"),
    }
    maybe_cr1(ctx, inst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;

    fn a_form(opcd: u32, rd: u32, ra: u32, rb: u32, frc: u32, xo: u32) -> DecodedInst {
        decode((opcd << 26) | (rd << 21) | (ra << 16) | (rb << 11) | (frc << 6) | (xo << 1))
    }

    #[test]
    fn fadds_rounds_to_single() {
        let mut ctx = ThreadContext::new(0);
        ctx.fpr[1] = 1.0e-10;
        ctx.fpr[2] = 1.0;
        let inst = a_form(59, 3, 1, 2, 0, 21);
        execute(&mut ctx, &inst);
        assert_eq!(ctx.fpr[3], (1.0f64 + 1.0e-10) as f32 as f64);
    }

    #[test]
    fn fmadd_fuses() {
        let mut ctx = ThreadContext::new(0);
        ctx.fpr[1] = 2.0;
        ctx.fpr[2] = 3.0;
        ctx.fpr[4] = 4.0;
        // fmadd f3, f1, f4, f2 : frC is the multiplicand
        let inst = a_form(63, 3, 1, 2, 4, 29);
        execute(&mut ctx, &inst);
        assert_eq!(ctx.fpr[3], 11.0);
    }

    #[test]
    fn fcmpu_orders_and_flags_nan() {
        let mut ctx = ThreadContext::new(0);
        ctx.fpr[1] = 1.0;
        ctx.fpr[2] = 2.0;
        // fcmpu cr1, f1, f2
        let inst = decode((63u32 << 26) | (1 << 23) | (1 << 16) | (2 << 11));
        execute(&mut ctx, &inst);
        assert!(ctx.cr[1].lt);
        assert_eq!((ctx.fpscr >> 12) & 0xF, 8);
        ctx.fpr[2] = f64::NAN;
        execute(&mut ctx, &inst);
        assert!(ctx.cr[1].so);
        assert_eq!((ctx.fpscr >> 12) & 0xF, 1);
    }

    #[test]
    fn fctiwz_saturates() {
        let mut ctx = ThreadContext::new(0);
        ctx.fpr[2] = 3.9;
        let inst = decode((63u32 << 26) | (3 << 21) | (2 << 11) | (15 << 1));
        execute(&mut ctx, &inst);
        assert_eq!(ctx.fpr[3].to_bits() as u32, 3);
        ctx.fpr[2] = 1.0e20;
        execute(&mut ctx, &inst);
        assert_eq!(ctx.fpr[3].to_bits() as u32 as i32, i32::MAX);
    }

    #[test]
    fn fcfid_converts_bit_pattern() {
        let mut ctx = ThreadContext::new(0);
        ctx.fpr[2] = f64::from_bits((-7i64) as u64);
        let inst = decode((63u32 << 26) | (3 << 21) | (2 << 11) | (846 << 1));
        execute(&mut ctx, &inst);
        assert_eq!(ctx.fpr[3], -7.0);
    }
}
