// Integer arithmetic, logical, shift, rotate, compare and CR-field ops.

use crate::context::ThreadContext;
use crate::decoder::{DecodedInst, Op};

#[inline]
fn low32(v: u64) -> u32 {
    v as u32
}

// MB/ME mask: a contiguous run when mb <= me, the inverted complement when
// mb > me (IBM bit 0 is the most significant).
pub fn mask32(mb: u32, me: u32) -> u32 {
    let x = u32::MAX >> mb;
    let y = u32::MAX << (31 - me);
    if mb <= me {
        x & y
    } else {
        x | y
    }
}

pub fn mask64(mb: u32, me: u32) -> u64 {
    let x = u64::MAX >> mb;
    let y = u64::MAX << (63 - me);
    if mb <= me {
        x & y
    } else {
        x | y
    }
}

fn add_full(
    ctx: &mut ThreadContext,
    rd: usize,
    a: u64,
    b: u64,
    carry_in: u64,
    set_ca: bool,
    inst: &DecodedInst,
) {
    let (s1, c1) = a.overflowing_add(b);
    let (res, c2) = s1.overflowing_add(carry_in);
    if set_ca {
        ctx.xer.ca = c1 || c2;
    }
    if inst.oe {
        ctx.xer.set_overflow(((a ^ res) & (b ^ res)) >> 63 != 0);
    }
    ctx.gpr[rd] = res;
    if inst.rc {
        ctx.update_cr0(res as i64);
    }
}

pub fn execute(ctx: &mut ThreadContext, inst: &DecodedInst) {
    let rd = inst.rd as usize;
    let ra = inst.ra as usize;
    let rb = inst.rb as usize;
    match inst.op {
        Op::Addi => {
            let base = if inst.ra == 0 { 0 } else { ctx.gpr[ra] };
            ctx.gpr[rd] = base.wrapping_add(inst.simm as i64 as u64);
        }
        Op::Addis => {
            let base = if inst.ra == 0 { 0 } else { ctx.gpr[ra] };
            ctx.gpr[rd] = base.wrapping_add(((inst.simm as i64) << 16) as u64);
        }
        Op::Addic | Op::AddicRc => {
            let a = ctx.gpr[ra];
            let b = inst.simm as i64 as u64;
            let (res, ca) = a.overflowing_add(b);
            ctx.xer.ca = ca;
            ctx.gpr[rd] = res;
            if inst.op == Op::AddicRc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Add => {
            let (a, b) = (ctx.gpr[ra], ctx.gpr[rb]);
            add_full(ctx, rd, a, b, 0, false, inst);
        }
        Op::Addc => {
            let (a, b) = (ctx.gpr[ra], ctx.gpr[rb]);
            add_full(ctx, rd, a, b, 0, true, inst);
        }
        Op::Adde => {
            let (a, b, ca) = (ctx.gpr[ra], ctx.gpr[rb], ctx.xer.ca as u64);
            add_full(ctx, rd, a, b, ca, true, inst);
        }
        Op::Addme => {
            let (a, ca) = (ctx.gpr[ra], ctx.xer.ca as u64);
            add_full(ctx, rd, a, u64::MAX, ca, true, inst);
        }
        Op::Addze => {
            let (a, ca) = (ctx.gpr[ra], ctx.xer.ca as u64);
            add_full(ctx, rd, a, 0, ca, true, inst);
        }
        Op::Subfic => {
            let a = ctx.gpr[ra];
            let b = inst.simm as i64 as u64;
            let (s1, c1) = (!a).overflowing_add(b);
            let (res, c2) = s1.overflowing_add(1);
            ctx.xer.ca = c1 || c2;
            ctx.gpr[rd] = res;
        }
        Op::Subf => {
            let (a, b) = (!ctx.gpr[ra], ctx.gpr[rb]);
            add_full(ctx, rd, a, b, 1, false, inst);
        }
        Op::Subfc => {
            let (a, b) = (!ctx.gpr[ra], ctx.gpr[rb]);
            add_full(ctx, rd, a, b, 1, true, inst);
        }
        Op::Subfe => {
            let (a, b, ca) = (!ctx.gpr[ra], ctx.gpr[rb], ctx.xer.ca as u64);
            add_full(ctx, rd, a, b, ca, true, inst);
        }
        Op::Subfme => {
            let (a, ca) = (!ctx.gpr[ra], ctx.xer.ca as u64);
            add_full(ctx, rd, a, u64::MAX, ca, true, inst);
        }
        Op::Subfze => {
            let (a, ca) = (!ctx.gpr[ra], ctx.xer.ca as u64);
            add_full(ctx, rd, a, 0, ca, true, inst);
        }
        Op::Neg => {
            let a = ctx.gpr[ra];
            let res = (a as i64).wrapping_neg() as u64;
            if inst.oe {
                ctx.xer.set_overflow(a == 1 << 63);
            }
            ctx.gpr[rd] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Mulli => {
            ctx.gpr[rd] = (ctx.gpr[ra] as i64).wrapping_mul(inst.simm as i64) as u64;
        }
        Op::Mullw => {
            let a = low32(ctx.gpr[ra]) as i32 as i64;
            let b = low32(ctx.gpr[rb]) as i32 as i64;
            let prod = a.wrapping_mul(b);
            if inst.oe {
                ctx.xer.set_overflow(prod != prod as i32 as i64);
            }
            ctx.gpr[rd] = prod as u64;
            if inst.rc {
                ctx.update_cr0(prod);
            }
        }
        Op::Mulld => {
            let a = ctx.gpr[ra] as i64;
            let b = ctx.gpr[rb] as i64;
            let res = a.wrapping_mul(b);
            if inst.oe {
                let wide = (a as i128).wrapping_mul(b as i128);
                ctx.xer.set_overflow(wide != res as i128);
            }
            ctx.gpr[rd] = res as u64;
            if inst.rc {
                ctx.update_cr0(res);
            }
        }
        Op::Mulhw => {
            let a = low32(ctx.gpr[ra]) as i32 as i64;
            let b = low32(ctx.gpr[rb]) as i32 as i64;
            let res = (a.wrapping_mul(b) >> 32) as u64;
            ctx.gpr[rd] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Mulhwu => {
            let a = low32(ctx.gpr[ra]) as u64;
            let b = low32(ctx.gpr[rb]) as u64;
            let res = (a * b) >> 32;
            ctx.gpr[rd] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Mulhd => {
            let res = (((ctx.gpr[ra] as i64 as i128) * (ctx.gpr[rb] as i64 as i128)) >> 64) as u64;
            ctx.gpr[rd] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Mulhdu => {
            let res = (((ctx.gpr[ra] as u128) * (ctx.gpr[rb] as u128)) >> 64) as u64;
            ctx.gpr[rd] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Divw => {
            let a = low32(ctx.gpr[ra]) as i32;
            let b = low32(ctx.gpr[rb]) as i32;
            let bad = b == 0 || (a == i32::MIN && b == -1);
            let res = if bad { 0 } else { a.wrapping_div(b) };
            if inst.oe {
                ctx.xer.set_overflow(bad);
            }
            ctx.gpr[rd] = res as i64 as u64;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Divwu => {
            let a = low32(ctx.gpr[ra]);
            let b = low32(ctx.gpr[rb]);
            let res = if b == 0 { 0 } else { a / b };
            if inst.oe {
                ctx.xer.set_overflow(b == 0);
            }
            ctx.gpr[rd] = res as u64;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Divd => {
            let a = ctx.gpr[ra] as i64;
            let b = ctx.gpr[rb] as i64;
            let bad = b == 0 || (a == i64::MIN && b == -1);
            let res = if bad { 0 } else { a.wrapping_div(b) };
            if inst.oe {
                ctx.xer.set_overflow(bad);
            }
            ctx.gpr[rd] = res as u64;
            if inst.rc {
                ctx.update_cr0(res);
            }
        }
        Op::Divdu => {
            let a = ctx.gpr[ra];
            let b = ctx.gpr[rb];
            let res = if b == 0 { 0 } else { a / b };
            if inst.oe {
                ctx.xer.set_overflow(b == 0);
            }
            ctx.gpr[rd] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Cmpi | Op::Cmp => {
            let l64 = inst.rd & 1 != 0;
            let a = ctx.gpr[ra] as i64;
            let b = if inst.op == Op::Cmpi {
                inst.simm as i64
            } else {
                ctx.gpr[rb] as i64
            };
            let (a, b) = if l64 { (a, b) } else { (a as i32 as i64, b as i32 as i64) };
            let field = &mut ctx.cr[inst.crfd as usize];
            field.lt = a < b;
            field.gt = a > b;
            field.eq = a == b;
            field.so = ctx.xer.so;
        }
        Op::Cmpli | Op::Cmpl => {
            let l64 = inst.rd & 1 != 0;
            let a = ctx.gpr[ra];
            let b = if inst.op == Op::Cmpli {
                inst.uimm as u64
            } else {
                ctx.gpr[rb]
            };
            let (a, b) = if l64 { (a, b) } else { (a as u32 as u64, b as u32 as u64) };
            let field = &mut ctx.cr[inst.crfd as usize];
            field.lt = a < b;
            field.gt = a > b;
            field.eq = a == b;
            field.so = ctx.xer.so;
        }
        // Logical immediates: rs is in the rd slot, target is ra.
        Op::Andi => {
            let res = ctx.gpr[rd] & inst.uimm as u64;
            ctx.gpr[ra] = res;
            ctx.update_cr0(res as i64);
        }
        Op::Andis => {
            let res = ctx.gpr[rd] & ((inst.uimm as u64) << 16);
            ctx.gpr[ra] = res;
            ctx.update_cr0(res as i64);
        }
        Op::Ori => ctx.gpr[ra] = ctx.gpr[rd] | inst.uimm as u64,
        Op::Oris => ctx.gpr[ra] = ctx.gpr[rd] | ((inst.uimm as u64) << 16),
        Op::Xori => ctx.gpr[ra] = ctx.gpr[rd] ^ inst.uimm as u64,
        Op::Xoris => ctx.gpr[ra] = ctx.gpr[rd] ^ ((inst.uimm as u64) << 16),
        Op::And | Op::Andc | Op::Or | Op::Orc | Op::Xor | Op::Eqv | Op::Nand | Op::Nor => {
            let s = ctx.gpr[rd];
            let b = ctx.gpr[rb];
            let res = match inst.op {
                Op::And => s & b,
                Op::Andc => s & !b,
                Op::Or => s | b,
                Op::Orc => s | !b,
                Op::Xor => s ^ b,
                Op::Eqv => !(s ^ b),
                Op::Nand => !(s & b),
                _ => !(s | b),
            };
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Extsb => {
            let res = ctx.gpr[rd] as i8 as i64 as u64;
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Extsh => {
            let res = ctx.gpr[rd] as i16 as i64 as u64;
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Extsw => {
            let res = ctx.gpr[rd] as i32 as i64 as u64;
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Cntlzw => {
            let res = low32(ctx.gpr[rd]).leading_zeros() as u64;
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Cntlzd => {
            let res = ctx.gpr[rd].leading_zeros() as u64;
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Slw => {
            let n = ctx.gpr[rb] & 0x3F;
            let res = if n > 31 { 0 } else { ((low32(ctx.gpr[rd]) as u64) << n) as u32 as u64 };
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Srw => {
            let n = ctx.gpr[rb] & 0x3F;
            let res = if n > 31 { 0 } else { (low32(ctx.gpr[rd]) >> n) as u64 };
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Sraw => {
            let n = ctx.gpr[rb] & 0x3F;
            let s = low32(ctx.gpr[rd]) as i32;
            let res;
            if n > 31 {
                res = (s >> 31) as i64 as u64;
                ctx.xer.ca = s < 0;
            } else {
                res = (s >> n) as i64 as u64;
                ctx.xer.ca = s < 0 && (s as u32) << (32 - n.max(1)) != 0 && n != 0;
            }
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Srawi => {
            let n = inst.sh as u32 & 0x1F;
            let s = low32(ctx.gpr[rd]) as i32;
            let res = (s >> n) as i64 as u64;
            ctx.xer.ca = s < 0 && n != 0 && (s as u32) << (32 - n) != 0;
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Sld => {
            let n = ctx.gpr[rb] & 0x7F;
            let res = if n > 63 { 0 } else { ctx.gpr[rd] << n };
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Srd => {
            let n = ctx.gpr[rb] & 0x7F;
            let res = if n > 63 { 0 } else { ctx.gpr[rd] >> n };
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Srad => {
            let n = ctx.gpr[rb] & 0x7F;
            let s = ctx.gpr[rd] as i64;
            let res;
            if n > 63 {
                res = (s >> 63) as u64;
                ctx.xer.ca = s < 0;
            } else {
                res = (s >> n) as u64;
                ctx.xer.ca = s < 0 && n != 0 && (s as u64) << (64 - n) != 0;
            }
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Sradi => {
            let n = inst.sh as u32;
            let s = ctx.gpr[rd] as i64;
            let res = (s >> n) as u64;
            ctx.xer.ca = s < 0 && n != 0 && (s as u64) << (64 - n) != 0;
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Rlwinm => {
            let r = low32(ctx.gpr[rd]).rotate_left(inst.sh as u32);
            let res = (r & mask32(inst.mb as u32, inst.me as u32)) as u64;
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Rlwnm => {
            let n = (ctx.gpr[rb] & 0x1F) as u32;
            let r = low32(ctx.gpr[rd]).rotate_left(n);
            let res = (r & mask32(inst.mb as u32, inst.me as u32)) as u64;
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Rlwimi => {
            let r = low32(ctx.gpr[rd]).rotate_left(inst.sh as u32);
            let m = mask32(inst.mb as u32, inst.me as u32);
            let res = ((r & m) | (low32(ctx.gpr[ra]) & !m)) as u64;
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Rldicl => {
            let r = ctx.gpr[rd].rotate_left(inst.sh as u32);
            let res = r & mask64(inst.mb as u32, 63);
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Rldicr => {
            let r = ctx.gpr[rd].rotate_left(inst.sh as u32);
            let res = r & mask64(0, inst.mb as u32);
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Rldic => {
            let sh = inst.sh as u32;
            let r = ctx.gpr[rd].rotate_left(sh);
            let res = r & mask64(inst.mb as u32, 63 - sh);
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Rldimi => {
            let sh = inst.sh as u32;
            let r = ctx.gpr[rd].rotate_left(sh);
            let m = mask64(inst.mb as u32, 63 - sh);
            let res = (r & m) | (ctx.gpr[ra] & !m);
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Rldcl => {
            let n = (ctx.gpr[rb] & 0x3F) as u32;
            let r = ctx.gpr[rd].rotate_left(n);
            let res = r & mask64(inst.mb as u32, 63);
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        Op::Rldcr => {
            let n = (ctx.gpr[rb] & 0x3F) as u32;
            let r = ctx.gpr[rd].rotate_left(n);
            let res = r & mask64(0, inst.mb as u32);
            ctx.gpr[ra] = res;
            if inst.rc {
                ctx.update_cr0(res as i64);
            }
        }
        _ => unreachable!("non-integer op routed to integer unit"),
    }
}

pub fn execute_cr(ctx: &mut ThreadContext, inst: &DecodedInst) {
    match inst.op {
        Op::Crand | Op::Crandc | Op::Creqv | Op::Crnand | Op::Crnor | Op::Cror | Op::Crorc
        | Op::Crxor => {
            let a = ctx.cr_bit(inst.ra);
            let b = ctx.cr_bit(inst.rb);
            let res = match inst.op {
                Op::Crand => a & b,
                Op::Crandc => a & !b,
                Op::Creqv => !(a ^ b),
                Op::Crnand => !(a & b),
                Op::Crnor => !(a | b),
                Op::Cror => a | b,
                Op::Crorc => a | !b,
                _ => a ^ b,
            };
            ctx.set_cr_bit(inst.rd, res);
        }
        Op::Mcrf => {
            ctx.cr[inst.crfd as usize] = ctx.cr[inst.crfs as usize];
        }
        Op::Mfcr => {
            ctx.gpr[inst.rd as usize] = ctx.cr_word() as u64;
        }
        Op::Mtcrf => {
            let crm = (inst.raw >> 12) & 0xFF;
            let value = ctx.gpr[inst.rd as usize] as u32;
            for field in 0..8 {
                if crm & (0x80 >> field) != 0 {
                    let nibble = ((value >> (28 - field * 4)) & 0xF) as u8;
                    ctx.cr[field as usize] = crate::context::CrField::from_nibble(nibble);
                }
            }
        }
        _ => unreachable!("non-CR op routed to CR unit"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;

    fn run(ctx: &mut ThreadContext, word: u32) {
        let inst = decode(word);
        execute(ctx, &inst);
    }

    #[test]
    fn masks_cover_inverted_runs() {
        assert_eq!(mask32(0, 31), u32::MAX);
        assert_eq!(mask32(24, 31), 0xFF);
        assert_eq!(mask32(0, 7), 0xFF00_0000);
        // mb > me wraps around
        assert_eq!(mask32(28, 3), 0xF000_000F);
        assert_eq!(mask64(48, 63), 0xFFFF);
    }

    #[test]
    fn addic_sets_carry() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[4] = u64::MAX;
        // addic r3, r4, 1 : opcd 12
        let word = (12u32 << 26) | (3 << 21) | (4 << 16) | 1;
        run(&mut ctx, word);
        assert_eq!(ctx.gpr[3], 0);
        assert!(ctx.xer.ca);
    }

    #[test]
    fn subfic_borrows() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[4] = 2;
        // subfic r3, r4, 1 -> 1 - 2 = -1, ca clear (borrow)
        let word = (8u32 << 26) | (3 << 21) | (4 << 16) | 1;
        run(&mut ctx, word);
        assert_eq!(ctx.gpr[3] as i64, -1);
        assert!(!ctx.xer.ca);
    }

    #[test]
    fn add_record_updates_cr0() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[3] = 5;
        ctx.gpr[4] = (-7i64) as u64;
        run(&mut ctx, 0x7C63_2215); // add. r3, r3, r4
        assert_eq!(ctx.gpr[3] as i64, -2);
        assert!(ctx.cr[0].lt);
        assert!(!ctx.cr[0].gt);
        assert!(!ctx.cr[0].eq);
    }

    #[test]
    fn addo_sets_overflow_and_summary() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[3] = i64::MAX as u64;
        ctx.gpr[4] = 1;
        run(&mut ctx, 0x7C63_2614); // addo r3, r3, r4
        assert!(ctx.xer.ov);
        assert!(ctx.xer.so);
        // A following non-overflowing addo clears ov but so is sticky.
        ctx.gpr[4] = 0;
        run(&mut ctx, 0x7C63_2614);
        assert!(!ctx.xer.ov);
        assert!(ctx.xer.so);
    }

    #[test]
    fn cmpi_signed_and_cmpli_unsigned() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[5] = (-1i64) as u64;
        // cmpwi cr2, r5, 0
        let word = (11u32 << 26) | (2 << 23) | (5 << 16);
        run(&mut ctx, word);
        assert!(ctx.cr[2].lt);
        // cmplwi cr3, r5, 0 treats -1 as big unsigned
        let word = (10u32 << 26) | (3 << 23) | (5 << 16);
        run(&mut ctx, word);
        assert!(ctx.cr[3].gt);
    }

    #[test]
    fn rlwinm_masks() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[3] = 0x0000_00FF;
        run(&mut ctx, 0x5463_103A); // rlwinm r3, r3, 2, 0, 29
        assert_eq!(ctx.gpr[3], 0x0000_03FC);
    }

    #[test]
    fn rlwimi_merges_under_mask() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[4] = 0x1234_5678;
        ctx.gpr[3] = 0xAAAA_AAAA;
        // rlwimi r3, r4, 0, 24, 31 : insert low byte of r4 into r3
        let word = (20u32 << 26) | (4 << 21) | (3 << 16) | (0 << 11) | (24 << 6) | (31 << 1);
        run(&mut ctx, word);
        assert_eq!(ctx.gpr[3], 0xAAAA_AA78);
    }

    #[test]
    fn srawi_carry_from_shifted_out_bits() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[3] = (-5i32) as u32 as u64;
        // srawi r3, r3, 1
        let word = (31u32 << 26) | (3 << 21) | (3 << 16) | (1 << 11) | (824 << 1);
        run(&mut ctx, word);
        assert_eq!(ctx.gpr[3] as i64, -3);
        assert!(ctx.xer.ca);
    }

    #[test]
    fn divw_zero_divisor_is_total() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[3] = 10;
        ctx.gpr[4] = 0;
        // divwo r5, r3, r4
        let word = (31u32 << 26) | (5 << 21) | (3 << 16) | (4 << 11) | (1 << 10) | (491 << 1);
        run(&mut ctx, word);
        assert_eq!(ctx.gpr[5], 0);
        assert!(ctx.xer.ov);
    }

    #[test]
    fn cr_logical_ops() {
        let mut ctx = ThreadContext::new(0);
        ctx.set_cr_bit(4, true);
        ctx.set_cr_bit(5, false);
        // cror 6, 4, 5
        let word = (19u32 << 26) | (6 << 21) | (4 << 16) | (5 << 11) | (449 << 1);
        let inst = decode(word);
        execute_cr(&mut ctx, &inst);
        assert!(ctx.cr_bit(6));
    }

    #[test]
    fn mtcrf_writes_selected_fields() {
        let mut ctx = ThreadContext::new(0);
        ctx.gpr[3] = 0xF000_0002;
        // mtcrf 0x81, r3 : fields 0 and 7
        let word = (31u32 << 26) | (3 << 21) | (0x81 << 12) | (144 << 1);
        let inst = decode(word);
        execute_cr(&mut ctx, &inst);
        assert_eq!(ctx.cr[0].to_nibble(), 0xF);
        assert_eq!(ctx.cr[7].to_nibble(), 0x2);
        assert_eq!(ctx.cr[3].to_nibble(), 0);
    }
}
