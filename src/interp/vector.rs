// VMX128 subset: the float lane math, logicals, splats, merges, shifts and
// permutes that the runtime libraries leaned on. Lane 0 is the leftmost
// (big-endian) element throughout.

use crate::context::{ThreadContext, VectorReg};
use crate::decoder::{DecodedInst, Op};

fn lanewise_f(a: &VectorReg, b: &VectorReg, f: impl Fn(f32, f32) -> f32) -> VectorReg {
    let (av, bv) = (a.f32x4(), b.f32x4());
    let mut out = VectorReg::default();
    out.set_f32x4([f(av[0], bv[0]), f(av[1], bv[1]), f(av[2], bv[2]), f(av[3], bv[3])]);
    out
}

fn lanewise_u(a: &VectorReg, b: &VectorReg, f: impl Fn(u32, u32) -> u32) -> VectorReg {
    let mut out = VectorReg::default();
    for i in 0..4 {
        out.w[i] = f(a.w[i], b.w[i]);
    }
    out
}

// Record-form compares report lane unanimity in CR6.
fn set_cr6(ctx: &mut ThreadContext, result: &VectorReg) {
    let all = result.w.iter().all(|&w| w == u32::MAX);
    let none = result.w.iter().all(|&w| w == 0);
    ctx.cr[6].lt = all;
    ctx.cr[6].gt = false;
    ctx.cr[6].eq = none;
    ctx.cr[6].so = false;
}

pub fn execute(ctx: &mut ThreadContext, inst: &DecodedInst) {
    let rd = inst.rd as usize;
    let ra = inst.ra as usize;
    let rb = inst.rb as usize;
    let rc = inst.vc as usize;
    match inst.op {
        Op::Vaddfp => ctx.vr[rd] = lanewise_f(&ctx.vr[ra], &ctx.vr[rb], |a, b| a + b),
        Op::Vsubfp => ctx.vr[rd] = lanewise_f(&ctx.vr[ra], &ctx.vr[rb], |a, b| a - b),
        Op::Vmaxfp => ctx.vr[rd] = lanewise_f(&ctx.vr[ra], &ctx.vr[rb], f32::max),
        Op::Vminfp => ctx.vr[rd] = lanewise_f(&ctx.vr[ra], &ctx.vr[rb], f32::min),
        Op::Vmaddfp => {
            // vD = vA * vC + vB
            let (a, b, c) = (ctx.vr[ra].f32x4(), ctx.vr[rb].f32x4(), ctx.vr[rc].f32x4());
            let mut out = VectorReg::default();
            out.set_f32x4([
                a[0].mul_add(c[0], b[0]),
                a[1].mul_add(c[1], b[1]),
                a[2].mul_add(c[2], b[2]),
                a[3].mul_add(c[3], b[3]),
            ]);
            ctx.vr[rd] = out;
        }
        Op::Vnmsubfp => {
            let (a, b, c) = (ctx.vr[ra].f32x4(), ctx.vr[rb].f32x4(), ctx.vr[rc].f32x4());
            let mut out = VectorReg::default();
            out.set_f32x4([
                -(a[0].mul_add(c[0], -b[0])),
                -(a[1].mul_add(c[1], -b[1])),
                -(a[2].mul_add(c[2], -b[2])),
                -(a[3].mul_add(c[3], -b[3])),
            ]);
            ctx.vr[rd] = out;
        }
        Op::Vrefp => {
            let b = ctx.vr[rb].f32x4();
            let mut out = VectorReg::default();
            out.set_f32x4([1.0 / b[0], 1.0 / b[1], 1.0 / b[2], 1.0 / b[3]]);
            ctx.vr[rd] = out;
        }
        Op::Vrsqrtefp => {
            let b = ctx.vr[rb].f32x4();
            let mut out = VectorReg::default();
            out.set_f32x4([
                1.0 / b[0].sqrt(),
                1.0 / b[1].sqrt(),
                1.0 / b[2].sqrt(),
                1.0 / b[3].sqrt(),
            ]);
            ctx.vr[rd] = out;
        }
        Op::Vand => ctx.vr[rd] = lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| a & b),
        Op::Vandc => ctx.vr[rd] = lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| a & !b),
        Op::Vor => ctx.vr[rd] = lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| a | b),
        Op::Vxor => ctx.vr[rd] = lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| a ^ b),
        Op::Vnor => ctx.vr[rd] = lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| !(a | b)),
        Op::Vadduwm => {
            ctx.vr[rd] = lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| a.wrapping_add(b))
        }
        Op::Vsubuwm => {
            ctx.vr[rd] = lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| a.wrapping_sub(b))
        }
        Op::Vslw => ctx.vr[rd] = lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| a << (b & 31)),
        Op::Vsrw => ctx.vr[rd] = lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| a >> (b & 31)),
        Op::Vsraw => {
            ctx.vr[rd] =
                lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| ((a as i32) >> (b & 31)) as u32)
        }
        Op::Vspltw => {
            let lane = (inst.ra & 3) as usize;
            ctx.vr[rd] = VectorReg::splat(ctx.vr[rb].w[lane]);
        }
        Op::Vsplth => {
            let lane = (inst.ra & 7) as usize;
            let bytes = ctx.vr[rb].to_be_bytes();
            let half = u16::from_be_bytes([bytes[lane * 2], bytes[lane * 2 + 1]]);
            let word = ((half as u32) << 16) | half as u32;
            ctx.vr[rd] = VectorReg::splat(word);
        }
        Op::Vspltb => {
            let lane = (inst.ra & 15) as usize;
            let byte = ctx.vr[rb].byte(lane) as u32;
            let word = byte << 24 | byte << 16 | byte << 8 | byte;
            ctx.vr[rd] = VectorReg::splat(word);
        }
        Op::Vspltisb => {
            let v = sign5(inst.ra) as i8 as u8 as u32;
            let word = v << 24 | v << 16 | v << 8 | v;
            ctx.vr[rd] = VectorReg::splat(word);
        }
        Op::Vspltish => {
            let v = sign5(inst.ra) as i16 as u16 as u32;
            ctx.vr[rd] = VectorReg::splat((v << 16) | v);
        }
        Op::Vspltisw => {
            ctx.vr[rd] = VectorReg::splat(sign5(inst.ra) as u32);
        }
        Op::Vmrghw => {
            let (a, b) = (ctx.vr[ra], ctx.vr[rb]);
            ctx.vr[rd] = VectorReg { w: [a.w[0], b.w[0], a.w[1], b.w[1]] };
        }
        Op::Vmrglw => {
            let (a, b) = (ctx.vr[ra], ctx.vr[rb]);
            ctx.vr[rd] = VectorReg { w: [a.w[2], b.w[2], a.w[3], b.w[3]] };
        }
        Op::Vperm => {
            let concat: Vec<u8> = ctx.vr[ra]
                .to_be_bytes()
                .iter()
                .chain(ctx.vr[rb].to_be_bytes().iter())
                .copied()
                .collect();
            let sel = ctx.vr[rc].to_be_bytes();
            let mut out = [0u8; 16];
            for i in 0..16 {
                out[i] = concat[(sel[i] & 0x1F) as usize];
            }
            ctx.vr[rd] = VectorReg::from_be_bytes(out);
        }
        Op::Vsel => {
            let (a, b, m) = (ctx.vr[ra], ctx.vr[rb], ctx.vr[rc]);
            ctx.vr[rd] = VectorReg {
                w: [
                    (b.w[0] & m.w[0]) | (a.w[0] & !m.w[0]),
                    (b.w[1] & m.w[1]) | (a.w[1] & !m.w[1]),
                    (b.w[2] & m.w[2]) | (a.w[2] & !m.w[2]),
                    (b.w[3] & m.w[3]) | (a.w[3] & !m.w[3]),
                ],
            };
        }
        Op::Vsldoi => {
            let shift = (inst.vc & 0xF) as usize; // SHB field
            let concat: Vec<u8> = ctx.vr[ra]
                .to_be_bytes()
                .iter()
                .chain(ctx.vr[rb].to_be_bytes().iter())
                .copied()
                .collect();
            let mut out = [0u8; 16];
            out.copy_from_slice(&concat[shift..shift + 16]);
            ctx.vr[rd] = VectorReg::from_be_bytes(out);
        }
        Op::Vcmpequw => {
            let res =
                lanewise_u(&ctx.vr[ra], &ctx.vr[rb], |a, b| if a == b { u32::MAX } else { 0 });
            if inst.raw >> 10 & 1 != 0 {
                set_cr6(ctx, &res);
            }
            ctx.vr[rd] = res;
        }
        Op::Vcmpeqfp => {
            let (a, b) = (ctx.vr[ra].f32x4(), ctx.vr[rb].f32x4());
            let mut res = VectorReg::default();
            for i in 0..4 {
                res.w[i] = if a[i] == b[i] { u32::MAX } else { 0 };
            }
            if inst.raw >> 10 & 1 != 0 {
                set_cr6(ctx, &res);
            }
            ctx.vr[rd] = res;
        }
        Op::Vcmpgtfp => {
            let (a, b) = (ctx.vr[ra].f32x4(), ctx.vr[rb].f32x4());
            let mut res = VectorReg::default();
            for i in 0..4 {
                res.w[i] = if a[i] > b[i] { u32::MAX } else { 0 };
            }
            if inst.raw >> 10 & 1 != 0 {
                set_cr6(ctx, &res);
            }
            ctx.vr[rd] = res;
        }
        _ => unreachable!("non-vector op routed to vector unit"),
    }
}

// 5-bit sign-extended immediate in the vA slot.
fn sign5(field: u8) -> i32 {
    ((field as i32) << 27) >> 27
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;

    fn vx(rd: u32, ra: u32, rb: u32, xo: u32) -> DecodedInst {
        decode((4u32 << 26) | (rd << 21) | (ra << 16) | (rb << 11) | xo)
    }

    #[test]
    fn vaddfp_adds_lanes() {
        let mut ctx = ThreadContext::new(0);
        ctx.vr[1].set_f32x4([1.0, 2.0, 3.0, 4.0]);
        ctx.vr[2].set_f32x4([10.0, 20.0, 30.0, 40.0]);
        execute(&mut ctx, &vx(3, 1, 2, 10));
        assert_eq!(ctx.vr[3].f32x4(), [11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn vspltw_broadcasts_lane() {
        let mut ctx = ThreadContext::new(0);
        ctx.vr[2] = VectorReg { w: [5, 6, 7, 8] };
        // vspltw v3, v2, 1
        execute(&mut ctx, &vx(3, 1, 2, 652));
        assert_eq!(ctx.vr[3].w, [6, 6, 6, 6]);
    }

    #[test]
    fn vspltisw_sign_extends() {
        let mut ctx = ThreadContext::new(0);
        // vspltisw v0, -1 : SIMM field = 31
        execute(&mut ctx, &vx(0, 31, 0, 908));
        assert_eq!(ctx.vr[0].w, [u32::MAX; 4]);
    }

    #[test]
    fn vperm_selects_bytes() {
        let mut ctx = ThreadContext::new(0);
        ctx.vr[1] = VectorReg::from_be_bytes([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        ctx.vr[2] = VectorReg::from_be_bytes([
            16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31,
        ]);
        // Select byte 31 (last of vB) into every lane.
        ctx.vr[3] = VectorReg::from_be_bytes([31; 16]);
        // vperm v4, v1, v2, v3
        let inst = decode((4u32 << 26) | (4 << 21) | (1 << 16) | (2 << 11) | (3 << 6) | 43);
        execute(&mut ctx, &inst);
        assert_eq!(ctx.vr[4].to_be_bytes(), [31u8; 16]);
    }

    #[test]
    fn vcmpequw_record_sets_cr6() {
        let mut ctx = ThreadContext::new(0);
        ctx.vr[1] = VectorReg { w: [7; 4] };
        ctx.vr[2] = VectorReg { w: [7; 4] };
        // vcmpequw. v3, v1, v2
        let inst = decode((4u32 << 26) | (3 << 21) | (1 << 16) | (2 << 11) | (1 << 10) | 134);
        execute(&mut ctx, &inst);
        assert_eq!(ctx.vr[3].w, [u32::MAX; 4]);
        assert!(ctx.cr[6].lt);
        assert!(!ctx.cr[6].eq);
    }

    #[test]
    fn vmrghw_interleaves_high_words() {
        let mut ctx = ThreadContext::new(0);
        ctx.vr[1] = VectorReg { w: [1, 2, 3, 4] };
        ctx.vr[2] = VectorReg { w: [5, 6, 7, 8] };
        execute(&mut ctx, &vx(3, 1, 2, 140));
        assert_eq!(ctx.vr[3].w, [1, 5, 2, 6]);
    }
}
