// Raw ARM64 instruction emission into a caller-provided buffer. The emitter
// is mechanical: one method per instruction form, capacity checked on every
// word, no codegen decisions. Offsets are byte offsets, branch displacements
// are relative to the instruction being emitted.

pub type Reg = u32;

pub const X0: Reg = 0;
pub const X1: Reg = 1;
pub const X2: Reg = 2;
pub const X3: Reg = 3;
pub const X4: Reg = 4;
pub const X5: Reg = 5;
pub const X6: Reg = 6;
pub const X7: Reg = 7;
pub const X8: Reg = 8;
pub const X9: Reg = 9;
pub const X10: Reg = 10;
pub const X11: Reg = 11;
pub const X12: Reg = 12;
pub const X13: Reg = 13;
pub const X14: Reg = 14;
pub const X15: Reg = 15;
pub const X16: Reg = 16;
pub const X17: Reg = 17;
pub const X19: Reg = 19;
pub const X20: Reg = 20;
pub const X21: Reg = 21;
pub const X22: Reg = 22;
pub const X23: Reg = 23;
pub const X24: Reg = 24;
pub const X25: Reg = 25;
pub const X26: Reg = 26;
pub const X27: Reg = 27;
pub const X28: Reg = 28;
pub const X29: Reg = 29;
pub const X30: Reg = 30;
pub const XZR: Reg = 31;
pub const SP: Reg = 31;

/// ARM64 condition codes.
pub mod cond {
    pub const EQ: u32 = 0;
    pub const NE: u32 = 1;
    pub const CS: u32 = 2;
    pub const CC: u32 = 3;
    pub const MI: u32 = 4;
    pub const PL: u32 = 5;
    pub const VS: u32 = 6;
    pub const VC: u32 = 7;
    pub const HI: u32 = 8;
    pub const LS: u32 = 9;
    pub const GE: u32 = 10;
    pub const LT: u32 = 11;
    pub const GT: u32 = 12;
    pub const LE: u32 = 13;
    pub const AL: u32 = 14;

    pub fn invert(c: u32) -> u32 {
        c ^ 1
    }
}

/// Encode an unconditional B to a byte displacement, if it fits 26 bits.
pub fn encode_b(offset: i64) -> Option<u32> {
    if offset & 3 != 0 || !(-(128 << 20)..128 << 20).contains(&offset) {
        return None;
    }
    Some(0x1400_0000 | (((offset >> 2) as u32) & 0x03FF_FFFF))
}

/// Encode a conditional branch to a byte displacement, if it fits 19 bits.
pub fn encode_b_cond(c: u32, offset: i64) -> Option<u32> {
    if offset & 3 != 0 || !(-(1 << 20)..1 << 20).contains(&offset) {
        return None;
    }
    Some(0x5400_0000 | ((((offset >> 2) as u32) & 0x7FFFF) << 5) | c)
}

pub struct Arm64Emitter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    overflow: bool,
}

impl<'a> Arm64Emitter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Arm64Emitter { buf, pos: 0, overflow: false }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn word_at(&self, pos: usize) -> u32 {
        u32::from_le_bytes([
            self.buf[pos],
            self.buf[pos + 1],
            self.buf[pos + 2],
            self.buf[pos + 3],
        ])
    }

    /// Overwrite a previously emitted word (label fixups).
    pub fn patch_at(&mut self, pos: usize, word: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&word.to_le_bytes());
    }

    fn emit32(&mut self, word: u32) {
        if self.pos + 4 > self.buf.len() {
            self.overflow = true;
            return;
        }
        self.buf[self.pos..self.pos + 4].copy_from_slice(&word.to_le_bytes());
        self.pos += 4;
    }

    // ----- Moves -----

    pub fn movz(&mut self, rd: Reg, imm16: u16, shift: u32) {
        self.emit32(0xD280_0000 | ((shift / 16) << 21) | ((imm16 as u32) << 5) | rd);
    }

    pub fn movk(&mut self, rd: Reg, imm16: u16, shift: u32) {
        self.emit32(0xF280_0000 | ((shift / 16) << 21) | ((imm16 as u32) << 5) | rd);
    }

    pub fn movn(&mut self, rd: Reg, imm16: u16, shift: u32) {
        self.emit32(0x9280_0000 | ((shift / 16) << 21) | ((imm16 as u32) << 5) | rd);
    }

    /// Materialize an arbitrary 64-bit constant with the fewest moves.
    pub fn mov_imm(&mut self, rd: Reg, imm: u64) {
        if imm == 0 {
            self.movz(rd, 0, 0);
            return;
        }
        let mut first = true;
        for half in 0..4 {
            let chunk = ((imm >> (half * 16)) & 0xFFFF) as u16;
            if chunk != 0 {
                if first {
                    self.movz(rd, chunk, half * 16);
                    first = false;
                } else {
                    self.movk(rd, chunk, half * 16);
                }
            }
        }
    }

    pub fn mov_reg(&mut self, rd: Reg, rm: Reg) {
        self.orr(rd, XZR, rm);
    }

    // ----- Arithmetic, immediate -----

    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u32) {
        self.emit32(0x9100_0000 | ((imm12 & 0xFFF) << 10) | (rn << 5) | rd);
    }

    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u32) {
        self.emit32(0xD100_0000 | ((imm12 & 0xFFF) << 10) | (rn << 5) | rd);
    }

    pub fn adds_imm(&mut self, rd: Reg, rn: Reg, imm12: u32) {
        self.emit32(0xB100_0000 | ((imm12 & 0xFFF) << 10) | (rn << 5) | rd);
    }

    pub fn subs_imm(&mut self, rd: Reg, rn: Reg, imm12: u32) {
        self.emit32(0xF100_0000 | ((imm12 & 0xFFF) << 10) | (rn << 5) | rd);
    }

    pub fn cmp_imm(&mut self, rn: Reg, imm12: u32) {
        self.subs_imm(XZR, rn, imm12);
    }

    // ----- Arithmetic, register -----

    pub fn add(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x8B00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn adds(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xAB00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn sub(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xCB00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn subs(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xEB00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn adc(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x9A00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn adcs(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xBA00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn sbc(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xDA00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn neg(&mut self, rd: Reg, rm: Reg) {
        self.sub(rd, XZR, rm);
    }

    pub fn cmp(&mut self, rn: Reg, rm: Reg) {
        self.subs(XZR, rn, rm);
    }

    /// Compare of the low 32 bits only.
    pub fn cmp_w(&mut self, rn: Reg, rm: Reg) {
        self.emit32(0x6B00_0000 | (rm << 16) | (rn << 5) | XZR);
    }

    pub fn add_shifted(&mut self, rd: Reg, rn: Reg, rm: Reg, lsl: u32) {
        self.emit32(0x8B00_0000 | (rm << 16) | ((lsl & 0x3F) << 10) | (rn << 5) | rd);
    }

    // ----- Logical, register -----

    pub fn and(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x8A00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn ands(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xEA00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xAA00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn orn(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xAA20_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn eor(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xCA00_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn eon(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xCA20_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn bic(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x8A20_0000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn mvn(&mut self, rd: Reg, rm: Reg) {
        self.orn(rd, XZR, rm);
    }

    pub fn tst(&mut self, rn: Reg, rm: Reg) {
        self.ands(XZR, rn, rm);
    }

    // ----- Logical, immediate -----

    fn logical_imm_fields(imm: u64) -> Option<u32> {
        if imm == 0 || imm == u64::MAX {
            return None;
        }
        let mut size = 64u32;
        while size > 2 {
            let half = size / 2;
            let mask = (1u64 << half) - 1;
            if (imm & mask) == ((imm >> half) & mask) {
                size = half;
            } else {
                break;
            }
        }
        let mask = if size == 64 { u64::MAX } else { (1u64 << size) - 1 };
        let elem = imm & mask;
        let ones = elem.count_ones();
        if ones == 0 || ones == size {
            return None;
        }
        let run = (1u64 << ones) - 1;
        let ror = |x: u64, r: u32| -> u64 {
            if r == 0 {
                x
            } else {
                ((x >> r) | (x << (size - r))) & mask
            }
        };
        let mut immr = None;
        for r in 0..size {
            if ror(run, r) == elem {
                immr = Some(r);
                break;
            }
        }
        let immr = immr?;
        let n = (size == 64) as u32;
        let imms = if size == 64 {
            ones - 1
        } else {
            (0x3F & !(size + size - 1)) | (ones - 1)
        };
        Some((n << 12) | (immr << 6) | imms)
    }

    fn logical_imm(&mut self, base: u32, rd: Reg, rn: Reg, imm: u64) -> bool {
        match Self::logical_imm_fields(imm) {
            Some(fields) => {
                let n = (fields >> 12) & 1;
                let immr = (fields >> 6) & 0x3F;
                let imms = fields & 0x3F;
                self.emit32(base | (n << 22) | (immr << 16) | (imms << 10) | (rn << 5) | rd);
                true
            }
            None => false,
        }
    }

    /// Returns false when the constant is not encodable; callers fall back to
    /// materializing it in a scratch register.
    pub fn and_imm(&mut self, rd: Reg, rn: Reg, imm: u64) -> bool {
        self.logical_imm(0x9200_0000, rd, rn, imm)
    }

    pub fn orr_imm(&mut self, rd: Reg, rn: Reg, imm: u64) -> bool {
        self.logical_imm(0xB200_0000, rd, rn, imm)
    }

    pub fn eor_imm(&mut self, rd: Reg, rn: Reg, imm: u64) -> bool {
        self.logical_imm(0xD200_0000, rd, rn, imm)
    }

    pub fn ands_imm(&mut self, rd: Reg, rn: Reg, imm: u64) -> bool {
        self.logical_imm(0xF200_0000, rd, rn, imm)
    }

    // ----- Shifts -----

    pub fn lslv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x9AC0_2000 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn lsrv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x9AC0_2400 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn asrv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x9AC0_2800 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn rorv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x9AC0_2C00 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn ubfm(&mut self, rd: Reg, rn: Reg, immr: u32, imms: u32) {
        self.emit32(0xD340_0000 | (immr << 16) | (imms << 10) | (rn << 5) | rd);
    }

    pub fn sbfm(&mut self, rd: Reg, rn: Reg, immr: u32, imms: u32) {
        self.emit32(0x9340_0000 | (immr << 16) | (imms << 10) | (rn << 5) | rd);
    }

    pub fn lsl_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        let shift = shift & 63;
        if shift == 0 {
            self.mov_reg(rd, rn);
        } else {
            self.ubfm(rd, rn, 64 - shift, 63 - shift);
        }
    }

    pub fn lsr_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        self.ubfm(rd, rn, shift & 63, 63);
    }

    pub fn asr_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        self.sbfm(rd, rn, shift & 63, 63);
    }

    pub fn extr(&mut self, rd: Reg, rn: Reg, rm: Reg, lsb: u32) {
        self.emit32(0x93C0_0000 | (rm << 16) | ((lsb & 0x3F) << 10) | (rn << 5) | rd);
    }

    pub fn ror_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        self.extr(rd, rn, rn, shift);
    }

    /// Rotate of the low 32 bits: EXTR on W registers.
    pub fn ror_imm_w(&mut self, rd: Reg, rn: Reg, shift: u32) {
        self.emit32(0x1380_0000 | (rn << 16) | ((shift & 0x1F) << 10) | (rn << 5) | rd);
    }

    // ----- Extensions -----

    pub fn uxtb(&mut self, rd: Reg, rn: Reg) {
        self.emit32(0x5300_1C00 | (rn << 5) | rd);
    }

    pub fn uxth(&mut self, rd: Reg, rn: Reg) {
        self.emit32(0x5300_3C00 | (rn << 5) | rd);
    }

    pub fn uxtw(&mut self, rd: Reg, rn: Reg) {
        // UBFM 64-bit, immr 0, imms 31
        self.ubfm(rd, rn, 0, 31);
    }

    pub fn sxtb(&mut self, rd: Reg, rn: Reg) {
        self.sbfm(rd, rn, 0, 7);
    }

    pub fn sxth(&mut self, rd: Reg, rn: Reg) {
        self.sbfm(rd, rn, 0, 15);
    }

    pub fn sxtw(&mut self, rd: Reg, rn: Reg) {
        self.sbfm(rd, rn, 0, 31);
    }

    // ----- Multiply and divide -----

    pub fn madd(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.emit32(0x9B00_0000 | (rm << 16) | (ra << 10) | (rn << 5) | rd);
    }

    pub fn msub(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.emit32(0x9B00_8000 | (rm << 16) | (ra << 10) | (rn << 5) | rd);
    }

    pub fn mul(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.madd(rd, rn, rm, XZR);
    }

    pub fn smulh(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x9B40_7C00 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn umulh(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x9BC0_7C00 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn sdiv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x9AC0_0C00 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn udiv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x9AC0_0800 | (rm << 16) | (rn << 5) | rd);
    }

    // ----- Bit manipulation -----

    pub fn clz(&mut self, rd: Reg, rn: Reg) {
        self.emit32(0xDAC0_1000 | (rn << 5) | rd);
    }

    pub fn clz_w(&mut self, rd: Reg, rn: Reg) {
        self.emit32(0x5AC0_1000 | (rn << 5) | rd);
    }

    pub fn rev(&mut self, rd: Reg, rn: Reg) {
        self.emit32(0xDAC0_0C00 | (rn << 5) | rd);
    }

    pub fn rev_w(&mut self, rd: Reg, rn: Reg) {
        self.emit32(0x5AC0_0800 | (rn << 5) | rd);
    }

    pub fn rev16_w(&mut self, rd: Reg, rn: Reg) {
        self.emit32(0x5AC0_0400 | (rn << 5) | rd);
    }

    // ----- Conditional select -----

    pub fn csel(&mut self, rd: Reg, rn: Reg, rm: Reg, c: u32) {
        self.emit32(0x9A80_0000 | (rm << 16) | (c << 12) | (rn << 5) | rd);
    }

    pub fn csinc(&mut self, rd: Reg, rn: Reg, rm: Reg, c: u32) {
        self.emit32(0x9A80_0400 | (rm << 16) | (c << 12) | (rn << 5) | rd);
    }

    pub fn csinv(&mut self, rd: Reg, rn: Reg, rm: Reg, c: u32) {
        self.emit32(0xDA80_0000 | (rm << 16) | (c << 12) | (rn << 5) | rd);
    }

    pub fn cset(&mut self, rd: Reg, c: u32) {
        self.csinc(rd, XZR, XZR, cond::invert(c));
    }

    pub fn csetm(&mut self, rd: Reg, c: u32) {
        self.csinv(rd, XZR, XZR, cond::invert(c));
    }

    // ----- Loads and stores, scaled unsigned offset -----

    pub fn ldrb(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit32(0x3940_0000 | ((offset & 0xFFF) << 10) | (rn << 5) | rt);
    }

    pub fn ldrh(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit32(0x7940_0000 | (((offset / 2) & 0xFFF) << 10) | (rn << 5) | rt);
    }

    pub fn ldr_w(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit32(0xB940_0000 | (((offset / 4) & 0xFFF) << 10) | (rn << 5) | rt);
    }

    pub fn ldr(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit32(0xF940_0000 | (((offset / 8) & 0xFFF) << 10) | (rn << 5) | rt);
    }

    pub fn ldrsw(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit32(0xB980_0000 | (((offset / 4) & 0xFFF) << 10) | (rn << 5) | rt);
    }

    pub fn strb(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit32(0x3900_0000 | ((offset & 0xFFF) << 10) | (rn << 5) | rt);
    }

    pub fn strh(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit32(0x7900_0000 | (((offset / 2) & 0xFFF) << 10) | (rn << 5) | rt);
    }

    pub fn str_w(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit32(0xB900_0000 | (((offset / 4) & 0xFFF) << 10) | (rn << 5) | rt);
    }

    pub fn str(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit32(0xF900_0000 | (((offset / 8) & 0xFFF) << 10) | (rn << 5) | rt);
    }

    // ----- Loads and stores, register offset -----

    pub fn ldrb_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x3860_6800 | (rm << 16) | (rn << 5) | rt);
    }

    pub fn ldrh_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x7860_6800 | (rm << 16) | (rn << 5) | rt);
    }

    pub fn ldr_w_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xB860_6800 | (rm << 16) | (rn << 5) | rt);
    }

    pub fn ldr_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xF860_6800 | (rm << 16) | (rn << 5) | rt);
    }

    pub fn strb_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x3820_6800 | (rm << 16) | (rn << 5) | rt);
    }

    pub fn strh_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x7820_6800 | (rm << 16) | (rn << 5) | rt);
    }

    pub fn str_w_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xB820_6800 | (rm << 16) | (rn << 5) | rt);
    }

    pub fn str_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit32(0xF820_6800 | (rm << 16) | (rn << 5) | rt);
    }

    // ----- Pairs -----

    pub fn stp(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        let imm7 = ((offset / 8) & 0x7F) as u32;
        self.emit32(0xA900_0000 | (imm7 << 15) | (rt2 << 10) | (rn << 5) | rt);
    }

    pub fn ldp(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        let imm7 = ((offset / 8) & 0x7F) as u32;
        self.emit32(0xA940_0000 | (imm7 << 15) | (rt2 << 10) | (rn << 5) | rt);
    }

    pub fn stp_pre(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        let imm7 = ((offset / 8) & 0x7F) as u32;
        self.emit32(0xA980_0000 | (imm7 << 15) | (rt2 << 10) | (rn << 5) | rt);
    }

    pub fn ldp_post(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        let imm7 = ((offset / 8) & 0x7F) as u32;
        self.emit32(0xA8C0_0000 | (imm7 << 15) | (rt2 << 10) | (rn << 5) | rt);
    }

    // ----- Branches -----

    pub fn b(&mut self, offset: i64) {
        match encode_b(offset) {
            Some(word) => self.emit32(word),
            None => self.overflow = true,
        }
    }

    pub fn b_cond(&mut self, c: u32, offset: i64) {
        match encode_b_cond(c, offset) {
            Some(word) => self.emit32(word),
            None => self.overflow = true,
        }
    }

    pub fn bl(&mut self, offset: i64) {
        match encode_b(offset) {
            Some(word) => self.emit32(0x9400_0000 | (word & 0x03FF_FFFF)),
            None => self.overflow = true,
        }
    }

    pub fn cbz(&mut self, rt: Reg, offset: i64) {
        self.emit32(0xB400_0000 | ((((offset >> 2) as u32) & 0x7FFFF) << 5) | rt);
    }

    pub fn cbnz(&mut self, rt: Reg, offset: i64) {
        self.emit32(0xB500_0000 | ((((offset >> 2) as u32) & 0x7FFFF) << 5) | rt);
    }

    pub fn tbz(&mut self, rt: Reg, bit: u32, offset: i64) {
        let b5 = (bit >> 5) & 1;
        self.emit32(
            0x3600_0000
                | (b5 << 31)
                | ((bit & 0x1F) << 19)
                | ((((offset >> 2) as u32) & 0x3FFF) << 5)
                | rt,
        );
    }

    pub fn tbnz(&mut self, rt: Reg, bit: u32, offset: i64) {
        let b5 = (bit >> 5) & 1;
        self.emit32(
            0x3700_0000
                | (b5 << 31)
                | ((bit & 0x1F) << 19)
                | ((((offset >> 2) as u32) & 0x3FFF) << 5)
                | rt,
        );
    }

    pub fn br(&mut self, rn: Reg) {
        self.emit32(0xD61F_0000 | (rn << 5));
    }

    pub fn blr(&mut self, rn: Reg) {
        self.emit32(0xD63F_0000 | (rn << 5));
    }

    pub fn ret(&mut self) {
        self.emit32(0xD65F_03C0);
    }

    // ----- System -----

    pub fn nop(&mut self) {
        self.emit32(0xD503_201F);
    }

    pub fn brk(&mut self, imm: u16) {
        self.emit32(0xD420_0000 | ((imm as u32) << 5));
    }

    pub fn dmb_ish(&mut self) {
        self.emit32(0xD503_3BBF);
    }

    pub fn dmb_ishld(&mut self) {
        self.emit32(0xD503_39BF);
    }

    pub fn dmb_ishst(&mut self) {
        self.emit32(0xD503_3ABF);
    }

    pub fn dsb_ish(&mut self) {
        self.emit32(0xD503_3B9F);
    }

    pub fn isb(&mut self) {
        self.emit32(0xD503_3FDF);
    }

    // ----- Scalar floating point (double unless suffixed) -----

    pub fn fadd_d(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x1E60_2800 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn fsub_d(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x1E60_3800 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn fmul_d(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x1E60_0800 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn fdiv_d(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit32(0x1E60_1800 | (rm << 16) | (rn << 5) | rd);
    }

    pub fn fneg_d(&mut self, rd: Reg, rn: Reg) {
        self.emit32(0x1E61_4000 | (rn << 5) | rd);
    }

    pub fn fabs_d(&mut self, rd: Reg, rn: Reg) {
        self.emit32(0x1E60_C000 | (rn << 5) | rd);
    }

    pub fn fsqrt_d(&mut self, rd: Reg, rn: Reg) {
        self.emit32(0x1E61_C000 | (rn << 5) | rd);
    }

    pub fn fmadd_d(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.emit32(0x1F40_0000 | (rm << 16) | (ra << 10) | (rn << 5) | rd);
    }

    pub fn fcmp_d(&mut self, rn: Reg, rm: Reg) {
        self.emit32(0x1E60_2000 | (rm << 16) | (rn << 5));
    }

    pub fn ldr_d(&mut self, vt: Reg, rn: Reg, offset: u32) {
        self.emit32(0xFD40_0000 | (((offset / 8) & 0xFFF) << 10) | (rn << 5) | vt);
    }

    pub fn str_d(&mut self, vt: Reg, rn: Reg, offset: u32) {
        self.emit32(0xFD00_0000 | (((offset / 8) & 0xFFF) << 10) | (rn << 5) | vt);
    }

    // ----- NEON (128-bit) -----

    pub fn ldr_q(&mut self, vt: Reg, rn: Reg, offset: u32) {
        self.emit32(0x3DC0_0000 | (((offset / 16) & 0xFFF) << 10) | (rn << 5) | vt);
    }

    pub fn str_q(&mut self, vt: Reg, rn: Reg, offset: u32) {
        self.emit32(0x3D80_0000 | (((offset / 16) & 0xFFF) << 10) | (rn << 5) | vt);
    }

    pub fn add_4s(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x4EA0_8400 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn sub_4s(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x6EA0_8400 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn and_16b(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x4E20_1C00 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn orr_16b(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x4EA0_1C00 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn eor_16b(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x6E20_1C00 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn not_16b(&mut self, vd: Reg, vn: Reg) {
        self.emit32(0x6E20_5800 | (vn << 5) | vd);
    }

    pub fn fadd_4s(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x4E20_D400 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn fsub_4s(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x4EA0_D400 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn fmul_4s(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x6E20_DC00 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn fmla_4s(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x4E20_CC00 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn fmax_4s(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x4E20_F400 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn fmin_4s(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x4EA0_F400 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn cmeq_4s(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x6EA0_8C00 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn cmgt_4s(&mut self, vd: Reg, vn: Reg, vm: Reg) {
        self.emit32(0x4EA0_3400 | (vm << 16) | (vn << 5) | vd);
    }

    pub fn dup_4s_elem(&mut self, vd: Reg, vn: Reg, index: u32) {
        let imm5 = 0x4 | ((index & 3) << 3);
        self.emit32(0x4E00_0400 | (imm5 << 16) | (vn << 5) | vd);
    }

    pub fn dup_4s_gen(&mut self, vd: Reg, rn: Reg) {
        self.emit32(0x4E04_0C00 | (rn << 5) | vd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut Arm64Emitter)) -> Vec<u32> {
        let mut buf = [0u8; 256];
        let mut e = Arm64Emitter::new(&mut buf);
        f(&mut e);
        assert!(!e.overflowed());
        e.bytes()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn movz_movk() {
        let words = emit(|e| {
            e.movz(X0, 0x1234, 0);
            e.movk(X0, 0x5678, 16);
        });
        assert_eq!(words[0], 0xD282_4680);
        assert_eq!(words[1], 0xF2AA_CF00);
    }

    #[test]
    fn add_sub_forms() {
        let words = emit(|e| {
            e.add(X0, X1, X2);
            e.add_imm(X3, X4, 0x10);
            e.subs(XZR, X5, X6);
        });
        assert_eq!(words[0], 0x8B02_0020);
        assert_eq!(words[1], 0x9100_4083);
        assert_eq!(words[2], 0xEB06_00BF);
    }

    #[test]
    fn loads_scale_offsets() {
        let words = emit(|e| {
            e.ldr(X0, X19, 0x18); // offset 24 -> imm12 3
            e.str_w(X1, X19, 0x10);
            e.ldrb(X2, X20, 5);
        });
        assert_eq!(words[0], 0xF940_0E60);
        assert_eq!(words[1], 0xB900_1261);
        assert_eq!(words[2], 0x3940_1682);
    }

    #[test]
    fn register_offset_loads() {
        let words = emit(|e| {
            e.ldr_w_reg(X0, X20, X9);
            e.str_reg(X1, X20, X9);
        });
        assert_eq!(words[0], 0xB869_6A80);
        assert_eq!(words[1], 0xF829_6A81);
    }

    #[test]
    fn branches_encode_displacement() {
        assert_eq!(encode_b(8), Some(0x1400_0002));
        assert_eq!(encode_b(-4), Some(0x17FF_FFFF));
        assert_eq!(encode_b(1), None);
        assert_eq!(encode_b_cond(cond::EQ, 8), Some(0x5400_0040));
        // 26-bit range limit
        assert!(encode_b(128 << 20).is_none());
        assert!(encode_b((128 << 20) - 4).is_some());
    }

    #[test]
    fn rev_and_shift_aliases() {
        let words = emit(|e| {
            e.rev_w(X0, X1);
            e.rev(X2, X3);
            e.lsr_imm(X4, X5, 2);
            e.lsl_imm(X6, X7, 3);
        });
        assert_eq!(words[0], 0x5AC0_0820);
        assert_eq!(words[1], 0xDAC0_0C62);
        assert_eq!(words[2], 0xD342_FCA4); // UBFM x4, x5, #2, #63
        assert_eq!(words[3], 0xD37D_F0E6); // UBFM x6, x7, #61, #60
    }

    #[test]
    fn logical_immediates_encode_or_refuse() {
        let words = emit(|e| {
            assert!(e.and_imm(X0, X1, 0xFF));
            assert!(e.orr_imm(X2, X3, 0xFFFF_0000_FFFF_0000));
        });
        assert_eq!(words.len(), 2);
        let mut buf = [0u8; 16];
        let mut e = Arm64Emitter::new(&mut buf);
        assert!(!e.and_imm(X0, X1, 0x1234_5678)); // not a bitmask pattern
        assert_eq!(e.pos(), 0);
    }

    #[test]
    fn stp_ldp_frames() {
        let words = emit(|e| {
            e.stp_pre(X29, X30, SP, -96);
            e.stp(X19, X20, SP, 16);
            e.ldp(X19, X20, SP, 16);
            e.ldp_post(X29, X30, SP, 96);
        });
        assert_eq!(words[0], 0xA9BA_7BFD);
        assert_eq!(words[1], 0xA901_53F3);
        assert_eq!(words[2], 0xA941_53F3);
        assert_eq!(words[3], 0xA8C6_7BFD);
    }

    #[test]
    fn buffer_overflow_is_detected_not_written() {
        let mut buf = [0u8; 4];
        let mut e = Arm64Emitter::new(&mut buf);
        e.nop();
        e.nop();
        assert!(e.overflowed());
        assert_eq!(e.pos(), 4);
    }

    #[test]
    fn cset_inverts_condition() {
        let words = emit(|e| e.cset(X0, cond::EQ));
        // CSINC x0, xzr, xzr, NE
        assert_eq!(words[0], 0x9A9F_17E0);
    }
}
