// This is where the dirty grunt work of making sense of our binary input
// happens: one 32-bit PowerPC word in, one typed operation with operand
// fields out. The decoder is pure; classification is authoritative for
// dispatch, and anything it cannot name comes back as Op::Unknown.

// Primary opcodes (bits 0-5, IBM numbering):
//  2/3   tdi/twi            31  extended (integer, load/store, system)
//  4     vector             32..47  D-form loads/stores
//  7     mulli              48..55  float loads/stores
//  8     subfic             58  ld/ldu/lwa (DS-form)
//  10/11 cmpli/cmpi         59  float single arithmetic
//  12/13 addic/addic.       62  std/stdu (DS-form)
//  14/15 addi/addis         63  float double arithmetic
//  16    bc  17 sc  18 b
//  19    extended (bclr, bcctr, CR logical)
//  20/21/23 rlwimi/rlwinm/rlwnm
//  24..29 ori/oris/xori/xoris/andi./andis.
//  30    64-bit rotates (MD/MDS-form)

/// Dispatch class of a decoded operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Category {
    Integer,
    LoadStore,
    Branch,
    CrLogical,
    Float,
    Vector,
    Trap,
    Syscall,
    Sync,
    Cache,
    SprMove,
    Unknown,
}

/// Fine-grained operation, one variant per implemented mnemonic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Op {
    // Integer arithmetic
    Addi, Addis, Addic, AddicRc, Add, Addc, Adde, Addme, Addze,
    Subfic, Subf, Subfc, Subfe, Subfme, Subfze, Neg,
    Mulli, Mullw, Mulld, Mulhw, Mulhwu, Mulhd, Mulhdu,
    Divw, Divwu, Divd, Divdu,
    // Compares
    Cmpi, Cmpli, Cmp, Cmpl,
    // Logical
    Andi, Andis, Ori, Oris, Xori, Xoris,
    And, Andc, Or, Orc, Xor, Eqv, Nand, Nor,
    Extsb, Extsh, Extsw, Cntlzw, Cntlzd,
    // Shifts
    Slw, Srw, Sraw, Srawi, Sld, Srd, Srad, Sradi,
    // Rotates
    Rlwimi, Rlwinm, Rlwnm,
    Rldicl, Rldicr, Rldic, Rldimi, Rldcl, Rldcr,
    // Branches
    B, Bc, Bclr, Bcctr,
    // CR logical and moves
    Crand, Crandc, Creqv, Crnand, Crnor, Cror, Crorc, Crxor, Mcrf,
    Mfcr, Mtcrf,
    // SPR moves
    Mfspr, Mtspr, Mftb, Mfmsr, Mtmsrd,
    // Loads
    Lbz, Lbzu, Lbzx, Lbzux,
    Lhz, Lhzu, Lhzx, Lhzux,
    Lha, Lhau, Lhax, Lhaux,
    Lwz, Lwzu, Lwzx, Lwzux,
    Lwa, Lwax, Lwaux,
    Ld, Ldu, Ldx, Ldux,
    Lhbrx, Lwbrx, Lmw,
    Lwarx, Ldarx,
    // Stores
    Stb, Stbu, Stbx, Stbux,
    Sth, Sthu, Sthx, Sthux,
    Stw, Stwu, Stwx, Stwux,
    Std, Stdu, Stdx, Stdux,
    Sthbrx, Stwbrx, Stmw,
    Stwcx, Stdcx,
    // Float loads/stores
    Lfs, Lfsu, Lfsx, Lfsux, Lfd, Lfdu, Lfdx, Lfdux,
    Stfs, Stfsu, Stfsx, Stfsux, Stfd, Stfdu, Stfdx, Stfdux,
    // Float arithmetic (double and single forms)
    Fadd, Fadds, Fsub, Fsubs, Fmul, Fmuls, Fdiv, Fdivs,
    Fmadd, Fmadds, Fmsub, Fmsubs, Fnmadd, Fnmadds, Fnmsub, Fnmsubs,
    Fsqrt, Fsqrts, Fres, Frsqrte, Fsel,
    Fneg, Fmr, Fabs, Fnabs, Frsp,
    Fctiw, Fctiwz, Fctid, Fctidz, Fcfid,
    Fcmpu, Fcmpo, Mffs, Mtfsf,
    // Vector loads/stores and arithmetic
    Lvx, Stvx,
    Vaddfp, Vsubfp, Vmaddfp, Vnmsubfp, Vrefp, Vrsqrtefp, Vmaxfp, Vminfp,
    Vand, Vandc, Vor, Vxor, Vnor,
    Vadduwm, Vsubuwm, Vslw, Vsrw, Vsraw,
    Vspltb, Vsplth, Vspltw, Vspltisb, Vspltish, Vspltisw,
    Vmrghw, Vmrglw, Vperm, Vsel, Vsldoi,
    Vcmpequw, Vcmpeqfp, Vcmpgtfp,
    // Traps and system
    Twi, Tw, Tdi, Td, Sc, Rfid,
    Sync, Lwsync, Eieio, Isync,
    Dcbf, Dcbst, Dcbt, Dcbtst, Dcbz, Icbi,
    Unknown,
}

/// A decoded instruction with every operand field pre-extracted.
#[derive(Debug, Copy, Clone)]
pub struct DecodedInst {
    pub raw: u32,
    pub opcd: u8,
    pub xo: u16,
    pub rd: u8, // also rs / frD / vD / TO / crbD
    pub ra: u8,
    pub rb: u8,
    pub vc: u8, // VA-form third source
    pub rc: bool,
    pub oe: bool,
    pub aa: bool,
    pub lk: bool,
    pub simm: i16,
    pub uimm: u16,
    pub li: i32, // sign-extended branch displacement (I- and B-form)
    pub bo: u8,
    pub bi: u8,
    pub sh: u8, // 6-bit for the rld family
    pub mb: u8,
    pub me: u8,
    pub crfd: u8,
    pub crfs: u8,
    pub spr: u16,
    pub op: Op,
}

impl DecodedInst {
    pub fn category(&self) -> Category {
        use Op::*;
        match self.op {
            Addi | Addis | Addic | AddicRc | Add | Addc | Adde | Addme | Addze | Subfic
            | Subf | Subfc | Subfe | Subfme | Subfze | Neg | Mulli | Mullw | Mulld | Mulhw
            | Mulhwu | Mulhd | Mulhdu | Divw | Divwu | Divd | Divdu | Cmpi | Cmpli | Cmp
            | Cmpl | Andi | Andis | Ori | Oris | Xori | Xoris | And | Andc | Or | Orc | Xor
            | Eqv | Nand | Nor | Extsb | Extsh | Extsw | Cntlzw | Cntlzd | Slw | Srw | Sraw
            | Srawi | Sld | Srd | Srad | Sradi | Rlwimi | Rlwinm | Rlwnm | Rldicl | Rldicr
            | Rldic | Rldimi | Rldcl | Rldcr => Category::Integer,
            B | Bc | Bclr | Bcctr => Category::Branch,
            Crand | Crandc | Creqv | Crnand | Crnor | Cror | Crorc | Crxor | Mcrf | Mfcr
            | Mtcrf => Category::CrLogical,
            Mfspr | Mtspr | Mftb | Mfmsr | Mtmsrd => Category::SprMove,
            Lbz | Lbzu | Lbzx | Lbzux | Lhz | Lhzu | Lhzx | Lhzux | Lha | Lhau | Lhax
            | Lhaux | Lwz | Lwzu | Lwzx | Lwzux | Lwa | Lwax | Lwaux | Ld | Ldu | Ldx
            | Ldux | Lhbrx | Lwbrx | Lmw | Lwarx | Ldarx | Stb | Stbu | Stbx | Stbux | Sth
            | Sthu | Sthx | Sthux | Stw | Stwu | Stwx | Stwux | Std | Stdu | Stdx | Stdux
            | Sthbrx | Stwbrx | Stmw | Stwcx | Stdcx | Lfs | Lfsu | Lfsx | Lfsux | Lfd
            | Lfdu | Lfdx | Lfdux | Stfs | Stfsu | Stfsx | Stfsux | Stfd | Stfdu | Stfdx
            | Stfdux | Lvx | Stvx => Category::LoadStore,
            Fadd | Fadds | Fsub | Fsubs | Fmul | Fmuls | Fdiv | Fdivs | Fmadd | Fmadds
            | Fmsub | Fmsubs | Fnmadd | Fnmadds | Fnmsub | Fnmsubs | Fsqrt | Fsqrts | Fres
            | Frsqrte | Fsel | Fneg | Fmr | Fabs | Fnabs | Frsp | Fctiw | Fctiwz | Fctid
            | Fctidz | Fcfid | Fcmpu | Fcmpo | Mffs | Mtfsf => Category::Float,
            Vaddfp | Vsubfp | Vmaddfp | Vnmsubfp | Vrefp | Vrsqrtefp | Vmaxfp | Vminfp
            | Vand | Vandc | Vor | Vxor | Vnor | Vadduwm | Vsubuwm | Vslw | Vsrw | Vsraw
            | Vspltb | Vsplth | Vspltw | Vspltisb | Vspltish | Vspltisw | Vmrghw | Vmrglw
            | Vperm | Vsel | Vsldoi | Vcmpequw | Vcmpeqfp | Vcmpgtfp => Category::Vector,
            Twi | Tw | Tdi | Td => Category::Trap,
            Sc | Rfid => Category::Syscall,
            Sync | Lwsync | Eieio | Isync => Category::Sync,
            Dcbf | Dcbst | Dcbt | Dcbtst | Dcbz | Icbi => Category::Cache,
            Unknown => Category::Unknown,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        use Op::*;
        match self.op {
            Addi => "addi", Addis => "addis", Addic => "addic", AddicRc => "addic.",
            Add => "add", Addc => "addc", Adde => "adde", Addme => "addme", Addze => "addze",
            Subfic => "subfic", Subf => "subf", Subfc => "subfc", Subfe => "subfe",
            Subfme => "subfme", Subfze => "subfze", Neg => "neg",
            Mulli => "mulli", Mullw => "mullw", Mulld => "mulld", Mulhw => "mulhw",
            Mulhwu => "mulhwu", Mulhd => "mulhd", Mulhdu => "mulhdu",
            Divw => "divw", Divwu => "divwu", Divd => "divd", Divdu => "divdu",
            Cmpi => "cmpi", Cmpli => "cmpli", Cmp => "cmp", Cmpl => "cmpl",
            Andi => "andi.", Andis => "andis.", Ori => "ori", Oris => "oris",
            Xori => "xori", Xoris => "xoris",
            And => "and", Andc => "andc", Or => "or", Orc => "orc", Xor => "xor",
            Eqv => "eqv", Nand => "nand", Nor => "nor",
            Extsb => "extsb", Extsh => "extsh", Extsw => "extsw",
            Cntlzw => "cntlzw", Cntlzd => "cntlzd",
            Slw => "slw", Srw => "srw", Sraw => "sraw", Srawi => "srawi",
            Sld => "sld", Srd => "srd", Srad => "srad", Sradi => "sradi",
            Rlwimi => "rlwimi", Rlwinm => "rlwinm", Rlwnm => "rlwnm",
            Rldicl => "rldicl", Rldicr => "rldicr", Rldic => "rldic",
            Rldimi => "rldimi", Rldcl => "rldcl", Rldcr => "rldcr",
            B => "b", Bc => "bc", Bclr => "bclr", Bcctr => "bcctr",
            Crand => "crand", Crandc => "crandc", Creqv => "creqv", Crnand => "crnand",
            Crnor => "crnor", Cror => "cror", Crorc => "crorc", Crxor => "crxor",
            Mcrf => "mcrf", Mfcr => "mfcr", Mtcrf => "mtcrf",
            Mfspr => "mfspr", Mtspr => "mtspr", Mftb => "mftb",
            Mfmsr => "mfmsr", Mtmsrd => "mtmsrd",
            Lbz => "lbz", Lbzu => "lbzu", Lbzx => "lbzx", Lbzux => "lbzux",
            Lhz => "lhz", Lhzu => "lhzu", Lhzx => "lhzx", Lhzux => "lhzux",
            Lha => "lha", Lhau => "lhau", Lhax => "lhax", Lhaux => "lhaux",
            Lwz => "lwz", Lwzu => "lwzu", Lwzx => "lwzx", Lwzux => "lwzux",
            Lwa => "lwa", Lwax => "lwax", Lwaux => "lwaux",
            Ld => "ld", Ldu => "ldu", Ldx => "ldx", Ldux => "ldux",
            Lhbrx => "lhbrx", Lwbrx => "lwbrx", Lmw => "lmw",
            Lwarx => "lwarx", Ldarx => "ldarx",
            Stb => "stb", Stbu => "stbu", Stbx => "stbx", Stbux => "stbux",
            Sth => "sth", Sthu => "sthu", Sthx => "sthx", Sthux => "sthux",
            Stw => "stw", Stwu => "stwu", Stwx => "stwx", Stwux => "stwux",
            Std => "std", Stdu => "stdu", Stdx => "stdx", Stdux => "stdux",
            Sthbrx => "sthbrx", Stwbrx => "stwbrx", Stmw => "stmw",
            Stwcx => "stwcx.", Stdcx => "stdcx.",
            Lfs => "lfs", Lfsu => "lfsu", Lfsx => "lfsx", Lfsux => "lfsux",
            Lfd => "lfd", Lfdu => "lfdu", Lfdx => "lfdx", Lfdux => "lfdux",
            Stfs => "stfs", Stfsu => "stfsu", Stfsx => "stfsx", Stfsux => "stfsux",
            Stfd => "stfd", Stfdu => "stfdu", Stfdx => "stfdx", Stfdux => "stfdux",
            Fadd => "fadd", Fadds => "fadds", Fsub => "fsub", Fsubs => "fsubs",
            Fmul => "fmul", Fmuls => "fmuls", Fdiv => "fdiv", Fdivs => "fdivs",
            Fmadd => "fmadd", Fmadds => "fmadds", Fmsub => "fmsub", Fmsubs => "fmsubs",
            Fnmadd => "fnmadd", Fnmadds => "fnmadds", Fnmsub => "fnmsub", Fnmsubs => "fnmsubs",
            Fsqrt => "fsqrt", Fsqrts => "fsqrts", Fres => "fres", Frsqrte => "frsqrte",
            Fsel => "fsel",
            Fneg => "fneg", Fmr => "fmr", Fabs => "fabs", Fnabs => "fnabs", Frsp => "frsp",
            Fctiw => "fctiw", Fctiwz => "fctiwz", Fctid => "fctid", Fctidz => "fctidz",
            Fcfid => "fcfid", Fcmpu => "fcmpu", Fcmpo => "fcmpo",
            Mffs => "mffs", Mtfsf => "mtfsf",
            Lvx => "lvx", Stvx => "stvx",
            Vaddfp => "vaddfp", Vsubfp => "vsubfp", Vmaddfp => "vmaddfp",
            Vnmsubfp => "vnmsubfp", Vrefp => "vrefp", Vrsqrtefp => "vrsqrtefp",
            Vmaxfp => "vmaxfp", Vminfp => "vminfp",
            Vand => "vand", Vandc => "vandc", Vor => "vor", Vxor => "vxor", Vnor => "vnor",
            Vadduwm => "vadduwm", Vsubuwm => "vsubuwm",
            Vslw => "vslw", Vsrw => "vsrw", Vsraw => "vsraw",
            Vspltb => "vspltb", Vsplth => "vsplth", Vspltw => "vspltw",
            Vspltisb => "vspltisb", Vspltish => "vspltish", Vspltisw => "vspltisw",
            Vmrghw => "vmrghw", Vmrglw => "vmrglw",
            Vperm => "vperm", Vsel => "vsel", Vsldoi => "vsldoi",
            Vcmpequw => "vcmpequw", Vcmpeqfp => "vcmpeqfp", Vcmpgtfp => "vcmpgtfp",
            Twi => "twi", Tw => "tw", Tdi => "tdi", Td => "td",
            Sc => "sc", Rfid => "rfid",
            Sync => "sync", Lwsync => "lwsync", Eieio => "eieio", Isync => "isync",
            Dcbf => "dcbf", Dcbst => "dcbst", Dcbt => "dcbt", Dcbtst => "dcbtst",
            Dcbz => "dcbz", Icbi => "icbi",
            Unknown => "<unknown>",
        }
    }
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Decode one instruction word.
pub fn decode(raw: u32) -> DecodedInst {
    let opcd = (raw >> 26) as u8;
    let mut d = DecodedInst {
        raw,
        opcd,
        xo: ((raw >> 1) & 0x3FF) as u16,
        rd: ((raw >> 21) & 0x1F) as u8,
        ra: ((raw >> 16) & 0x1F) as u8,
        rb: ((raw >> 11) & 0x1F) as u8,
        vc: ((raw >> 6) & 0x1F) as u8,
        rc: raw & 1 != 0,
        oe: (raw >> 10) & 1 != 0,
        aa: (raw >> 1) & 1 != 0,
        lk: raw & 1 != 0,
        simm: (raw & 0xFFFF) as i16,
        uimm: (raw & 0xFFFF) as u16,
        li: 0,
        bo: ((raw >> 21) & 0x1F) as u8,
        bi: ((raw >> 16) & 0x1F) as u8,
        sh: ((raw >> 11) & 0x1F) as u8,
        mb: ((raw >> 6) & 0x1F) as u8,
        me: ((raw >> 1) & 0x1F) as u8,
        crfd: ((raw >> 23) & 0x7) as u8,
        crfs: ((raw >> 18) & 0x7) as u8,
        spr: (((raw >> 16) & 0x1F) | (((raw >> 11) & 0x1F) << 5)) as u16,
        op: Op::Unknown,
    };

    d.op = match opcd {
        2 => Op::Tdi,
        3 => Op::Twi,
        4 => decode_vector(raw),
        7 => Op::Mulli,
        8 => Op::Subfic,
        10 => Op::Cmpli,
        11 => Op::Cmpi,
        12 => Op::Addic,
        13 => Op::AddicRc,
        14 => Op::Addi,
        15 => Op::Addis,
        16 => {
            d.li = sign_extend(raw & 0xFFFC, 16);
            Op::Bc
        }
        17 => Op::Sc,
        18 => {
            d.li = sign_extend(raw & 0x03FF_FFFC, 26);
            Op::B
        }
        19 => decode_ext19(raw),
        20 => Op::Rlwimi,
        21 => Op::Rlwinm,
        23 => Op::Rlwnm,
        24 => Op::Ori,
        25 => Op::Oris,
        26 => Op::Xori,
        27 => Op::Xoris,
        28 => Op::Andi,
        29 => Op::Andis,
        30 => {
            // MD/MDS-form: 6-bit shift and mask-start fields with their high
            // bits folded into odd corners of the word.
            d.sh = (((raw >> 11) & 0x1F) | ((raw & 0x2) << 4)) as u8;
            d.mb = (((raw >> 6) & 0x1F) | (((raw >> 5) & 1) << 5)) as u8;
            match (raw >> 2) & 0x7 {
                0 => Op::Rldicl,
                1 => Op::Rldicr,
                2 => Op::Rldic,
                3 => Op::Rldimi,
                _ => match (raw >> 1) & 0xF {
                    8 => Op::Rldcl,
                    9 => Op::Rldcr,
                    _ => Op::Unknown,
                },
            }
        }
        31 => decode_ext31(raw, &mut d),
        32 => Op::Lwz,
        33 => Op::Lwzu,
        34 => Op::Lbz,
        35 => Op::Lbzu,
        36 => Op::Stw,
        37 => Op::Stwu,
        38 => Op::Stb,
        39 => Op::Stbu,
        40 => Op::Lhz,
        41 => Op::Lhzu,
        42 => Op::Lha,
        43 => Op::Lhau,
        44 => Op::Sth,
        45 => Op::Sthu,
        46 => Op::Lmw,
        47 => Op::Stmw,
        48 => Op::Lfs,
        49 => Op::Lfsu,
        50 => Op::Lfd,
        51 => Op::Lfdu,
        52 => Op::Stfs,
        53 => Op::Stfsu,
        54 => Op::Stfd,
        55 => Op::Stfdu,
        58 => {
            // DS-form: displacement is simm with the low two bits as sub-op.
            d.simm = (d.simm as u16 & 0xFFFC) as i16;
            match raw & 3 {
                0 => Op::Ld,
                1 => Op::Ldu,
                2 => Op::Lwa,
                _ => Op::Unknown,
            }
        }
        59 => decode_float(raw, true),
        62 => {
            d.simm = (d.simm as u16 & 0xFFFC) as i16;
            match raw & 3 {
                0 => Op::Std,
                1 => Op::Stdu,
                _ => Op::Unknown,
            }
        }
        63 => decode_float(raw, false),
        _ => Op::Unknown,
    };
    d
}

fn decode_ext19(raw: u32) -> Op {
    match (raw >> 1) & 0x3FF {
        0 => Op::Mcrf,
        16 => Op::Bclr,
        18 => Op::Rfid,
        33 => Op::Crnor,
        129 => Op::Crandc,
        150 => Op::Isync,
        193 => Op::Crxor,
        225 => Op::Crnand,
        257 => Op::Crand,
        289 => Op::Creqv,
        417 => Op::Crorc,
        449 => Op::Cror,
        528 => Op::Bcctr,
        _ => Op::Unknown,
    }
}

fn decode_ext31(raw: u32, d: &mut DecodedInst) -> Op {
    // sradi is XS-form: the 9-bit opcode sits one bit higher so the 6-bit
    // shift amount can steal bit 30.
    if (raw >> 2) & 0x1FF == 413 {
        d.sh = (((raw >> 11) & 0x1F) | ((raw & 0x2) << 4)) as u8;
        return Op::Sradi;
    }
    let xo10 = (raw >> 1) & 0x3FF;
    let known = match xo10 {
        0 => Op::Cmp,
        4 => Op::Tw,
        19 => Op::Mfcr,
        20 => Op::Lwarx,
        21 => Op::Ldx,
        23 => Op::Lwzx,
        24 => Op::Slw,
        26 => Op::Cntlzw,
        27 => Op::Sld,
        28 => Op::And,
        32 => Op::Cmpl,
        53 => Op::Ldux,
        54 => Op::Dcbst,
        55 => Op::Lwzux,
        58 => Op::Cntlzd,
        60 => Op::Andc,
        68 => Op::Td,
        83 => Op::Mfmsr,
        84 => Op::Ldarx,
        86 => Op::Dcbf,
        87 => Op::Lbzx,
        103 => Op::Lvx,
        119 => Op::Lbzux,
        124 => Op::Nor,
        144 => Op::Mtcrf,
        146 => Op::Mtmsrd,
        149 => Op::Stdx,
        150 => Op::Stwcx,
        151 => Op::Stwx,
        178 => Op::Mtmsrd,
        181 => Op::Stdux,
        183 => Op::Stwux,
        214 => Op::Stdcx,
        215 => Op::Stbx,
        231 => Op::Stvx,
        246 => Op::Dcbtst,
        247 => Op::Stbux,
        278 => Op::Dcbt,
        279 => Op::Lhzx,
        284 => Op::Eqv,
        311 => Op::Lhzux,
        316 => Op::Xor,
        339 => Op::Mfspr,
        341 => Op::Lwax,
        343 => Op::Lhax,
        371 => Op::Mftb,
        373 => Op::Lwaux,
        375 => Op::Lhaux,
        407 => Op::Sthx,
        412 => Op::Orc,
        439 => Op::Sthux,
        444 => Op::Or,
        467 => Op::Mtspr,
        476 => Op::Nand,
        534 => Op::Lwbrx,
        535 => Op::Lfsx,
        536 => Op::Srw,
        539 => Op::Srd,
        567 => Op::Lfsux,
        598 => {
            // L field picks the flavor: 0 sync, 1 lwsync.
            if (raw >> 21) & 0x3 == 1 {
                Op::Lwsync
            } else {
                Op::Sync
            }
        }
        599 => Op::Lfdx,
        631 => Op::Lfdux,
        662 => Op::Stwbrx,
        663 => Op::Stfsx,
        695 => Op::Stfsux,
        727 => Op::Stfdx,
        759 => Op::Stfdux,
        790 => Op::Lhbrx,
        792 => Op::Sraw,
        794 => Op::Srad,
        824 => Op::Srawi,
        854 => Op::Eieio,
        918 => Op::Sthbrx,
        922 => Op::Extsh,
        954 => Op::Extsb,
        982 => Op::Icbi,
        986 => Op::Extsw,
        1014 => Op::Dcbz,
        _ => Op::Unknown,
    };
    if known != Op::Unknown {
        return known;
    }
    // XO-form arithmetic: 9-bit opcode, bit 21 is OE.
    match (raw >> 1) & 0x1FF {
        8 => Op::Subfc,
        9 => Op::Mulhdu,
        10 => Op::Addc,
        11 => Op::Mulhwu,
        40 => Op::Subf,
        73 => Op::Mulhd,
        75 => Op::Mulhw,
        104 => Op::Neg,
        136 => Op::Subfe,
        138 => Op::Adde,
        200 => Op::Subfze,
        202 => Op::Addze,
        232 => Op::Subfme,
        233 => Op::Mulld,
        234 => Op::Addme,
        235 => Op::Mullw,
        266 => Op::Add,
        457 => Op::Divdu,
        459 => Op::Divwu,
        489 => Op::Divd,
        491 => Op::Divw,
        _ => Op::Unknown,
    }
}

fn decode_float(raw: u32, single: bool) -> Op {
    // A-form arithmetic uses a 5-bit opcode in bits 26-30; everything else in
    // the float space is X/XFL-form with the full 10-bit opcode.
    let xo5 = (raw >> 1) & 0x1F;
    let a_form = match xo5 {
        18 => Some(if single { Op::Fdivs } else { Op::Fdiv }),
        20 => Some(if single { Op::Fsubs } else { Op::Fsub }),
        21 => Some(if single { Op::Fadds } else { Op::Fadd }),
        22 => Some(if single { Op::Fsqrts } else { Op::Fsqrt }),
        23 => Some(if single { Op::Unknown } else { Op::Fsel }),
        24 => Some(if single { Op::Fres } else { Op::Unknown }),
        25 => Some(if single { Op::Fmuls } else { Op::Fmul }),
        26 => Some(if single { Op::Unknown } else { Op::Frsqrte }),
        28 => Some(if single { Op::Fmsubs } else { Op::Fmsub }),
        29 => Some(if single { Op::Fmadds } else { Op::Fmadd }),
        30 => Some(if single { Op::Fnmsubs } else { Op::Fnmsub }),
        31 => Some(if single { Op::Fnmadds } else { Op::Fnmadd }),
        _ => None,
    };
    if let Some(op) = a_form {
        return op;
    }
    if single {
        return Op::Unknown;
    }
    match (raw >> 1) & 0x3FF {
        0 => Op::Fcmpu,
        12 => Op::Frsp,
        14 => Op::Fctiw,
        15 => Op::Fctiwz,
        32 => Op::Fcmpo,
        40 => Op::Fneg,
        72 => Op::Fmr,
        136 => Op::Fnabs,
        264 => Op::Fabs,
        583 => Op::Mffs,
        711 => Op::Mtfsf,
        814 => Op::Fctid,
        815 => Op::Fctidz,
        846 => Op::Fcfid,
        _ => Op::Unknown,
    }
}

fn decode_vector(raw: u32) -> Op {
    // VA-form first (6-bit opcode), then the VXR compares (10-bit with the
    // record bit above them), then plain VX (11-bit).
    match raw & 0x3F {
        42 => return Op::Vsel,
        43 => return Op::Vperm,
        44 => return Op::Vsldoi,
        46 => return Op::Vmaddfp,
        47 => return Op::Vnmsubfp,
        _ => {}
    }
    match raw & 0x3FF {
        134 => return Op::Vcmpequw,
        198 => return Op::Vcmpeqfp,
        710 => return Op::Vcmpgtfp,
        _ => {}
    }
    match raw & 0x7FF {
        10 => Op::Vaddfp,
        74 => Op::Vsubfp,
        128 => Op::Vadduwm,
        140 => Op::Vmrghw,
        266 => Op::Vrefp,
        330 => Op::Vrsqrtefp,
        388 => Op::Vslw,
        396 => Op::Vmrglw,
        524 => Op::Vspltb,
        588 => Op::Vsplth,
        644 => Op::Vsrw,
        652 => Op::Vspltw,
        780 => Op::Vspltisb,
        844 => Op::Vspltish,
        900 => Op::Vsraw,
        908 => Op::Vspltisw,
        1028 => Op::Vand,
        1034 => Op::Vmaxfp,
        1092 => Op::Vandc,
        1098 => Op::Vminfp,
        1152 => Op::Vsubuwm,
        1156 => Op::Vor,
        1220 => Op::Vxor,
        1284 => Op::Vnor,
        _ => Op::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_addi() {
        let d = decode(0x3860_002A); // addi r3, r0, 42
        assert_eq!(d.op, Op::Addi);
        assert_eq!(d.rd, 3);
        assert_eq!(d.ra, 0);
        assert_eq!(d.simm, 42);
        assert_eq!(d.category(), Category::Integer);
    }

    #[test]
    fn decodes_branch_displacement() {
        let d = decode(0x4800_0008); // b +8
        assert_eq!(d.op, Op::B);
        assert_eq!(d.li, 8);
        assert!(!d.aa);
        assert!(!d.lk);
        let d = decode(0x4BFF_FFFD); // bl -4
        assert_eq!(d.op, Op::B);
        assert_eq!(d.li, -4);
        assert!(d.lk);
    }

    #[test]
    fn decodes_bc_fields() {
        let d = decode(0x4182_0010); // beq +0x10
        assert_eq!(d.op, Op::Bc);
        assert_eq!(d.bo, 12);
        assert_eq!(d.bi, 2);
        assert_eq!(d.li, 0x10);
    }

    #[test]
    fn decodes_ext31_arithmetic() {
        let d = decode(0x7C63_2214); // add r3, r3, r4
        assert_eq!(d.op, Op::Add);
        assert_eq!(d.rd, 3);
        assert_eq!(d.ra, 3);
        assert_eq!(d.rb, 4);
        assert!(!d.rc);
        let d = decode(0x7C63_2215); // add. r3, r3, r4
        assert_eq!(d.op, Op::Add);
        assert!(d.rc);
        let d = decode(0x7C63_2614); // addo
        assert_eq!(d.op, Op::Add);
        assert!(d.oe);
    }

    #[test]
    fn decodes_logical_and_shifts() {
        assert_eq!(decode(0x7C63_2038).op, Op::And); // and r3, r3, r4
        assert_eq!(decode(0x7C63_2030).op, Op::Slw);
        assert_eq!(decode(0x7C63_2430).op, Op::Srw);
        assert_eq!(decode(0x6000_0000).op, Op::Ori); // the canonical nop
    }

    #[test]
    fn decodes_rotates() {
        let d = decode(0x5463_103A); // rlwinm r3, r3, 2, 0, 29
        assert_eq!(d.op, Op::Rlwinm);
        assert_eq!(d.sh, 2);
        assert_eq!(d.mb, 0);
        assert_eq!(d.me, 29);
    }

    #[test]
    fn decodes_rld_six_bit_fields() {
        // rldicl r3, r4, 34, 30 : sh=34 (sh5 set), mb=30
        // 30<<26 | 4<<21 | 3<<16 | 2<<11 | 30<<6 | 0<<2 | (sh5)1<<1
        let raw = (30u32 << 26) | (4 << 21) | (3 << 16) | (2 << 11) | (30 << 6) | 0x2;
        let d = decode(raw);
        assert_eq!(d.op, Op::Rldicl);
        assert_eq!(d.sh, 34);
        assert_eq!(d.mb, 30);
    }

    #[test]
    fn decodes_loads_and_reservations() {
        assert_eq!(decode(0x8083_0010).op, Op::Lwz); // lwz r4, 0x10(r3)
        assert_eq!(decode(0x7C80_1828).op, Op::Lwarx);
        assert_eq!(decode(0x7CA0_192D).op, Op::Stwcx);
        let d = decode(0xE864_0008); // ld r3, 8(r4)
        assert_eq!(d.op, Op::Ld);
        assert_eq!(d.simm, 8);
    }

    #[test]
    fn decodes_spr_numbers() {
        let d = decode(0x7C08_02A6); // mflr r0
        assert_eq!(d.op, Op::Mfspr);
        assert_eq!(d.spr, 8);
        let d = decode(0x7C09_03A6); // mtctr r0
        assert_eq!(d.op, Op::Mtspr);
        assert_eq!(d.spr, 9);
    }

    #[test]
    fn decodes_sync_flavors() {
        assert_eq!(decode(0x7C00_04AC).op, Op::Sync);
        assert_eq!(decode(0x7C20_04AC).op, Op::Lwsync);
        assert_eq!(decode(0x4C00_012C).op, Op::Isync);
        assert_eq!(decode(0x7C00_06AC).op, Op::Eieio);
    }

    #[test]
    fn decodes_syscall_and_traps() {
        assert_eq!(decode(0x4400_0002).op, Op::Sc);
        assert_eq!(decode(0x7FE0_0008).op, Op::Tw); // trap (tw 31,0,0)
        assert_eq!(decode(0x0FE0_0000).op, Op::Twi);
    }

    #[test]
    fn decodes_vector_subset() {
        // vspltisw v0, 1 : opcd 4, xo 908
        let raw = (4u32 << 26) | (0 << 21) | (1 << 16) | 908;
        assert_eq!(decode(raw).op, Op::Vspltisw);
        // vmaddfp is VA-form
        let raw = (4u32 << 26) | 46;
        assert_eq!(decode(raw).op, Op::Vmaddfp);
    }

    #[test]
    fn unknown_is_trapped_not_misread() {
        let d = decode(0xFFFF_FFFF);
        assert_eq!(d.category(), Category::Unknown);
        let d = decode(0x0000_0000);
        assert_eq!(d.op, Op::Unknown);
    }
}
