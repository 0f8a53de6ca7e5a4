// Dynamic recompiler: PowerPC blocks into ARM64 host code. The dispatcher is
// a host-side loop (lookup-or-compile, call, repeat); emitted blocks keep the
// fixed register roles below and return through a shared epilogue.
//
//   x19  ThreadContext pointer
//   x20  fastmem base
//   x27  JitRuntime pointer
//   x28  remaining cycle budget
//
// Translation covers the hot integer/load-store/branch subset; anything else
// ends the block and the next execution falls back to the interpreter for
// that instruction.

pub mod block;
pub mod cache;
pub mod emitter;
pub mod regalloc;

use crate::context::{interrupt, ThreadContext};
use crate::decoder::{self, DecodedInst, Op};
use crate::error::{Error, Result};
use crate::interp::Interpreter;
use crate::memory::GuestMemory;
use block::{hash_guest_code, BlockLink, CompiledBlock};
use cache::BlockCache;
use emitter::{cond, Arm64Emitter, Reg, X0, X1, X16, X19, X2, X20, X27, X28, X29, X30, SP, XZR};
use log::{debug, warn};
use std::mem::offset_of;
use std::sync::{Arc, Mutex};

pub const MAX_BLOCK_INSTS: usize = 256;
const MAX_BLOCK_CODE: usize = 64 * 1024;

/// PCs at or above this mark are host trampolines (thread exit, APC and DPC
/// returns); execution surrenders to the caller instead of fetching there.
pub const HOST_RETURN_BASE: u32 = 0xFFFF_0000;

// JitRuntime field offsets baked into prologue/epilogue loads.
const RT_OFF_FASTMEM: u32 = 0;
const RT_OFF_CYCLES: u32 = 8;

pub(crate) fn off_gpr(r: usize) -> u32 {
    (offset_of!(ThreadContext, gpr) + r * 8) as u32
}

fn off_lr() -> u32 {
    offset_of!(ThreadContext, lr) as u32
}

fn off_ctr() -> u32 {
    offset_of!(ThreadContext, ctr) as u32
}

fn off_pc() -> u32 {
    offset_of!(ThreadContext, pc) as u32
}

// One byte per CR bit: lt, gt, eq, so.
fn off_cr_byte(bit: u8) -> u32 {
    (offset_of!(ThreadContext, cr) + (bit >> 2) as usize * 4 + (bit & 3) as usize) as u32
}

fn off_xer_so() -> u32 {
    offset_of!(ThreadContext, xer) as u32
}

fn off_xer_ca() -> u32 {
    offset_of!(ThreadContext, xer) as u32 + 2
}

fn off_interrupted() -> u32 {
    offset_of!(ThreadContext, interrupted) as u32
}

fn off_interrupt_reason() -> u32 {
    offset_of!(ThreadContext, interrupt_reason) as u32
}

/// Host instruction-cache maintenance for freshly written or patched code.
#[cfg(target_arch = "aarch64")]
pub fn clear_icache(start: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    unsafe {
        let begin = start as usize & !63;
        let end = start as usize + len;
        let mut p = begin;
        while p < end {
            core::arch::asm!("dc cvau, {0}", in(reg) p);
            p += 64;
        }
        core::arch::asm!("dsb ish");
        let mut p = begin;
        while p < end {
            core::arch::asm!("ic ivau, {0}", in(reg) p);
            p += 64;
        }
        core::arch::asm!("dsb ish", "isb");
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn clear_icache(_start: *const u8, _len: usize) {}

/// The executable code arena. Blocks are bump-allocated; exhaustion flushes
/// the whole cache and starts over.
pub struct CodeArena {
    base: *mut u8,
    size: usize,
    #[cfg(unix)]
    mapped: bool,
    #[cfg(not(unix))]
    _storage: Option<Box<[u8]>>,
}

unsafe impl Send for CodeArena {}
unsafe impl Sync for CodeArena {}

impl CodeArena {
    #[cfg(unix)]
    pub fn executable(size: usize) -> Result<Self> {
        unsafe {
            let base = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if base != libc::MAP_FAILED {
                return Ok(CodeArena { base: base as *mut u8, size, mapped: true });
            }
            // Hosts that refuse writable+executable mappings still get a
            // compile-only arena; dispatch stays on the interpreter there.
            warn!("writable+executable arena refused, falling back to plain memory");
            Ok(Self::plain(size))
        }
    }

    #[cfg(not(unix))]
    pub fn executable(size: usize) -> Result<Self> {
        Ok(Self::plain(size))
    }

    /// Plain read/write arena; enough for compiling and for every test that
    /// never jumps into the code.
    pub fn plain(size: usize) -> Self {
        #[cfg(unix)]
        {
            let mut v = vec![0u8; size].into_boxed_slice();
            let base = v.as_mut_ptr();
            std::mem::forget(v);
            CodeArena { base, size, mapped: false }
        }
        #[cfg(not(unix))]
        {
            let mut v = vec![0u8; size].into_boxed_slice();
            let base = v.as_mut_ptr();
            CodeArena { base, size, _storage: Some(v) }
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        #[cfg(unix)]
        {
            self.mapped
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Mutable window for the compiler. Caller must hold the compiler lock
    /// and stay within `[offset, offset+len)`.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn window(&self, offset: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base.add(offset), len)
    }

    /// Patch one instruction word and flush the host instruction cache for
    /// it. Safe against concurrent execution: the word is either the old or
    /// the new branch, both valid.
    pub fn patch_word(&self, offset: usize, word: u32) {
        unsafe {
            let p = self.base.add(offset) as *mut u32;
            p.write_volatile(word);
        }
        clear_icache(unsafe { self.base.add(offset) }, 4);
    }

    pub fn read_word(&self, offset: usize) -> u32 {
        unsafe { (self.base.add(offset) as *const u32).read() }
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            if self.mapped {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            } else {
                drop(Box::from_raw(std::slice::from_raw_parts_mut(self.base, self.size)));
            }
        }
    }
}

/// Per-invocation state shared with emitted code.
#[repr(C)]
pub struct JitRuntime {
    pub fastmem_base: *mut u8,
    pub remaining_cycles: i64,
    pub memory: *const GuestMemory,
}

#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    pub cache_size_bytes: usize,
    pub max_blocks: usize,
    pub disable_fastmem: bool,
    pub force_interpreter: bool,
    pub trace_blocks: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            cache_size_bytes: 128 * 1024 * 1024,
            max_blocks: cache::DEFAULT_MAX_BLOCKS,
            disable_fastmem: false,
            force_interpreter: false,
            trace_blocks: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JitStats {
    pub blocks_compiled: u64,
    pub code_bytes_used: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub instructions_executed: u64,
    pub interpreter_fallbacks: u64,
    pub cache_flushes: u64,
}

struct JitInner {
    arena: CodeArena,
    arena_pos: usize,
    cache: BlockCache,
    stats: JitStats,
}

pub struct JitCompiler {
    memory: Arc<GuestMemory>,
    interp: Interpreter,
    config: JitConfig,
    // Arena mapped executable and the host can run emitted ARM64.
    native_ok: bool,
    inner: Mutex<JitInner>,
}

// ----- helpers called from emitted code (slow memory path) -----
// Read results come back in host byte order; the fast path byte-reverses
// after its raw load, so both paths meet at the same value.

unsafe extern "C" fn jit_read_u8(rt: *mut JitRuntime, addr: u32) -> u64 {
    (*(*rt).memory).read_u8(addr) as u64
}

unsafe extern "C" fn jit_read_u16(rt: *mut JitRuntime, addr: u32) -> u64 {
    (*(*rt).memory).read_u16(addr) as u64
}

unsafe extern "C" fn jit_read_u32(rt: *mut JitRuntime, addr: u32) -> u64 {
    (*(*rt).memory).read_u32(addr) as u64
}

unsafe extern "C" fn jit_read_u64(rt: *mut JitRuntime, addr: u32) -> u64 {
    (*(*rt).memory).read_u64(addr)
}

unsafe extern "C" fn jit_write_u8(rt: *mut JitRuntime, addr: u32, value: u64) {
    (*(*rt).memory).write_u8(addr, value as u8)
}

unsafe extern "C" fn jit_write_u16(rt: *mut JitRuntime, addr: u32, value: u64) {
    (*(*rt).memory).write_u16(addr, value as u16)
}

unsafe extern "C" fn jit_write_u32(rt: *mut JitRuntime, addr: u32, value: u64) {
    (*(*rt).memory).write_u32(addr, value as u32)
}

unsafe extern "C" fn jit_write_u64(rt: *mut JitRuntime, addr: u32, value: u64) {
    (*(*rt).memory).write_u64(addr, value)
}

#[cfg(target_arch = "aarch64")]
unsafe fn call_block(entry: *const u8, ctx: *mut ThreadContext, rt: *mut JitRuntime) {
    let f: extern "C" fn(*mut ThreadContext, *mut JitRuntime) = std::mem::transmute(entry);
    f(ctx, rt);
}

#[cfg(not(target_arch = "aarch64"))]
unsafe fn call_block(_entry: *const u8, _ctx: *mut ThreadContext, _rt: *mut JitRuntime) {
    unreachable!("native dispatch is aarch64-only");
}

enum Emitted {
    Ok,
    EndsBlock,
    Unsupported,
}

// Size of one load/store width on the fast path.
#[derive(Copy, Clone, PartialEq)]
enum AccessWidth {
    B,
    H,
    W,
    D,
}

struct BlockBuilder<'a> {
    e: Arm64Emitter<'a>,
    ra: regalloc::RegisterAllocator,
    body_offset: u32,
    insts: u32,
    disable_fastmem: bool,
    // Forward branches into the shared epilogue: (emit pos, Some(cond)).
    epilogue_fixups: Vec<(usize, Option<u32>)>,
    // Patchable exit words: (emit pos, guest target, conditional).
    link_sites: Vec<(usize, u32, bool)>,
    exits: Vec<u32>,
}

impl<'a> BlockBuilder<'a> {
    fn new(buf: &'a mut [u8], disable_fastmem: bool) -> Self {
        BlockBuilder {
            e: Arm64Emitter::new(buf),
            ra: regalloc::RegisterAllocator::new(),
            body_offset: 0,
            insts: 0,
            disable_fastmem,
            epilogue_fixups: Vec::new(),
            link_sites: Vec::new(),
            exits: Vec::new(),
        }
    }

    fn prologue(&mut self) {
        let e = &mut self.e;
        e.stp_pre(X29, X30, SP, -96);
        e.add_imm(X29, SP, 0);
        e.stp(X19, X20, SP, 16);
        e.stp(emitter::X21, emitter::X22, SP, 32);
        e.stp(emitter::X23, emitter::X24, SP, 48);
        e.stp(emitter::X25, emitter::X26, SP, 64);
        e.stp(X27, X28, SP, 80);
        e.mov_reg(X19, X0);
        e.mov_reg(X27, X1);
        e.ldr(X20, X27, RT_OFF_FASTMEM);
        e.ldr(X28, X27, RT_OFF_CYCLES);
        self.body_offset = e.pos() as u32;
    }

    fn epilogue(&mut self) {
        // Bind all pending epilogue branches here first.
        let here = self.e.pos();
        let fixups = std::mem::take(&mut self.epilogue_fixups);
        for (pos, c) in fixups {
            let disp = here as i64 - pos as i64;
            let word = match c {
                Some(cc) => emitter::encode_b_cond(cc, disp),
                None => emitter::encode_b(disp),
            };
            match word {
                Some(w) => self.e.patch_at(pos, w),
                None => unreachable!("epilogue within branch range of its block"),
            }
        }
        let e = &mut self.e;
        e.str(X28, X27, RT_OFF_CYCLES);
        e.ldp(X19, X20, SP, 16);
        e.ldp(emitter::X21, emitter::X22, SP, 32);
        e.ldp(emitter::X23, emitter::X24, SP, 48);
        e.ldp(emitter::X25, emitter::X26, SP, 64);
        e.ldp(X27, X28, SP, 80);
        e.ldp_post(X29, X30, SP, 96);
        e.ret();
    }

    fn branch_to_epilogue(&mut self, c: Option<u32>) {
        self.epilogue_fixups.push((self.e.pos(), c));
        // Placeholder; patched when the epilogue is bound.
        self.e.nop();
    }

    /// The patchable exit word: initially a jump to the epilogue, later
    /// possibly a direct jump into the target block's body.
    fn link_site(&mut self, target: u32, conditional: bool) {
        self.link_sites.push((self.e.pos(), target, conditional));
        self.epilogue_fixups.push((self.e.pos(), None));
        self.e.nop();
        self.exits.push(target);
    }

    fn store_pc_const(&mut self, value: u64) {
        let t = self.ra.alloc_temp();
        self.e.mov_imm(t, value);
        self.e.str(t, X19, off_pc());
        self.ra.free_temp(t);
    }

    // Common exit tail: charge cycles, store the PC, bail to the epilogue if
    // the budget is gone, otherwise pass through the patchable link word.
    fn exit_static(&mut self, target: u32, conditional: bool) {
        self.e.sub_imm(X28, X28, self.insts);
        self.store_pc_const(target as u64);
        self.e.cmp_imm(X28, 0);
        self.branch_to_epilogue(Some(cond::LE));
        self.link_site(target, conditional);
    }

    fn exit_dynamic(&mut self, pc_reg: Reg) {
        self.e.sub_imm(X28, X28, self.insts);
        self.e.str(pc_reg, X19, off_pc());
        self.e.cmp_imm(X28, 0);
        self.branch_to_epilogue(Some(cond::LE));
        self.branch_to_epilogue(None);
    }

    // ----- small emission helpers -----

    fn add_immediate(&mut self, dst: Reg, src: Reg, imm: i64) {
        if imm == 0 {
            if dst != src {
                self.e.mov_reg(dst, src);
            }
        } else if (0..4096).contains(&imm) {
            self.e.add_imm(dst, src, imm as u32);
        } else if (-4095..0).contains(&imm) {
            self.e.sub_imm(dst, src, (-imm) as u32);
        } else {
            let t = self.ra.alloc_temp();
            self.e.mov_imm(t, imm as u64);
            self.e.add(dst, src, t);
            self.ra.free_temp(t);
        }
    }

    fn and_mask(&mut self, dst: Reg, src: Reg, mask: u64) {
        if !self.e.and_imm(dst, src, mask) {
            let t = self.ra.alloc_temp();
            self.e.mov_imm(t, mask);
            self.e.and(dst, src, t);
            self.ra.free_temp(t);
        }
    }

    /// CR0 from the signed comparison of a 64-bit result against zero.
    fn record_cr0(&mut self, res: Reg) {
        let t = self.ra.alloc_temp();
        self.e.cmp_imm(res, 0);
        self.e.cset(t, cond::LT);
        self.e.strb(t, X19, off_cr_byte(0));
        self.e.cset(t, cond::GT);
        self.e.strb(t, X19, off_cr_byte(1));
        self.e.cset(t, cond::EQ);
        self.e.strb(t, X19, off_cr_byte(2));
        self.e.ldrb(t, X19, off_xer_so());
        self.e.strb(t, X19, off_cr_byte(3));
        self.ra.free_temp(t);
    }

    fn record_compare(&mut self, crf: u8, lt_cond: u32, gt_cond: u32) {
        let t = self.ra.alloc_temp();
        self.e.cset(t, lt_cond);
        self.e.strb(t, X19, off_cr_byte(crf * 4));
        self.e.cset(t, gt_cond);
        self.e.strb(t, X19, off_cr_byte(crf * 4 + 1));
        self.e.cset(t, cond::EQ);
        self.e.strb(t, X19, off_cr_byte(crf * 4 + 2));
        self.e.ldrb(t, X19, off_xer_so());
        self.e.strb(t, X19, off_cr_byte(crf * 4 + 3));
        self.ra.free_temp(t);
    }

    /// Effective address into a temp, truncated to 32 bits.
    fn effective_address(&mut self, inst: &DecodedInst, indexed: bool) -> Reg {
        let ea = self.ra.alloc_temp();
        if indexed {
            let rb = self.ra.get(&mut self.e, inst.rb as usize);
            if inst.ra == 0 {
                self.e.mov_reg(ea, rb);
            } else {
                let ra = self.ra.get(&mut self.e, inst.ra as usize);
                self.e.add(ea, ra, rb);
            }
        } else if inst.ra == 0 {
            self.e.mov_imm(ea, inst.simm as i64 as u32 as u64);
        } else {
            let ra = self.ra.get(&mut self.e, inst.ra as usize);
            self.add_immediate(ea, ra, inst.simm as i64);
        }
        self.e.uxtw(ea, ea);
        ea
    }

    // Fast path: physical window or cached-virtual mirror, top three address
    // bits 000 or 100, i.e. no bits in 0x60000000. Everything else calls the
    // slow helper, which also covers MMIO unconditionally.
    fn emit_load(&mut self, inst: &DecodedInst, width: AccessWidth, helper: usize) -> Reg {
        let indexed = matches!(
            inst.op,
            Op::Lbzx
                | Op::Lbzux
                | Op::Lhzx
                | Op::Lhzux
                | Op::Lhax
                | Op::Lhaux
                | Op::Lwzx
                | Op::Lwzux
                | Op::Lwax
                | Op::Lwaux
                | Op::Ldx
                | Op::Ldux
        );
        let ea = self.effective_address(inst, indexed);
        let val = self.ra.alloc_temp();
        if self.disable_fastmem {
            self.emit_slow_read(ea, val, helper);
        } else {
            // tst ea, #0x60000000 ; b.ne slow
            let scratch = self.ra.alloc_temp();
            if !self.e.ands_imm(XZR, ea, 0x6000_0000) {
                unreachable!("window mask is a valid bitmask immediate");
            }
            let slow_jump = self.e.pos();
            self.e.nop(); // b.ne slow, patched below
            self.and_mask(scratch, ea, 0x1FFF_FFFF);
            match width {
                AccessWidth::B => self.e.ldrb_reg(val, X20, scratch),
                AccessWidth::H => {
                    self.e.ldrh_reg(val, X20, scratch);
                    self.e.rev16_w(val, val);
                    self.e.uxth(val, val);
                }
                AccessWidth::W => {
                    self.e.ldr_w_reg(val, X20, scratch);
                    self.e.rev_w(val, val);
                }
                AccessWidth::D => {
                    self.e.ldr_reg(val, X20, scratch);
                    self.e.rev(val, val);
                }
            }
            let done_jump = self.e.pos();
            self.e.nop(); // b done, patched below
            let slow_here = self.e.pos();
            self.patch_branch_cond(slow_jump, cond::NE, slow_here);
            self.emit_slow_read(ea, val, helper);
            let done_here = self.e.pos();
            self.patch_branch(done_jump, done_here);
            self.ra.free_temp(scratch);
        }
        self.ra.free_temp(ea);
        val
    }

    fn emit_store(&mut self, inst: &DecodedInst, width: AccessWidth, helper: usize) {
        let indexed = matches!(
            inst.op,
            Op::Stbx
                | Op::Stbux
                | Op::Sthx
                | Op::Sthux
                | Op::Stwx
                | Op::Stwux
                | Op::Stdx
                | Op::Stdux
        );
        let ea = self.effective_address(inst, indexed);
        let src = self.ra.get(&mut self.e, inst.rd as usize);
        if self.disable_fastmem {
            self.emit_slow_write(ea, src, helper);
        } else {
            let scratch = self.ra.alloc_temp();
            let swapped = self.ra.alloc_temp();
            if !self.e.ands_imm(XZR, ea, 0x6000_0000) {
                unreachable!("window mask is a valid bitmask immediate");
            }
            let slow_jump = self.e.pos();
            self.e.nop();
            self.and_mask(scratch, ea, 0x1FFF_FFFF);
            match width {
                AccessWidth::B => self.e.strb_reg(src, X20, scratch),
                AccessWidth::H => {
                    self.e.rev16_w(swapped, src);
                    self.e.strh_reg(swapped, X20, scratch);
                }
                AccessWidth::W => {
                    self.e.rev_w(swapped, src);
                    self.e.str_w_reg(swapped, X20, scratch);
                }
                AccessWidth::D => {
                    self.e.rev(swapped, src);
                    self.e.str_reg(swapped, X20, scratch);
                }
            }
            let done_jump = self.e.pos();
            self.e.nop();
            let slow_here = self.e.pos();
            self.patch_branch_cond(slow_jump, cond::NE, slow_here);
            self.emit_slow_write(ea, src, helper);
            let done_here = self.e.pos();
            self.patch_branch(done_jump, done_here);
            self.ra.free_temp(swapped);
            self.ra.free_temp(scratch);
        }
        self.ra.free_temp(ea);
        // Update forms write the effective address back. The temp above does
        // not survive the helper call, so the address is recomputed from the
        // base registers, which a store never modifies.
        if matches!(
            inst.op,
            Op::Stbu | Op::Stbux | Op::Sthu | Op::Sthux | Op::Stwu | Op::Stwux | Op::Stdu | Op::Stdux
        ) {
            let ea2 = self.effective_address(inst, indexed);
            let ra_host = self.ra.get_dest(&mut self.e, inst.ra as usize);
            self.e.mov_reg(ra_host, ea2);
            self.ra.free_temp(ea2);
        }
    }

    fn emit_slow_read(&mut self, ea: Reg, val: Reg, helper: usize) {
        self.e.mov_reg(X0, X27);
        self.e.mov_reg(X1, ea);
        self.e.mov_imm(X16, helper as u64);
        self.e.blr(X16);
        self.e.mov_reg(val, X0);
    }

    fn emit_slow_write(&mut self, ea: Reg, src: Reg, helper: usize) {
        self.e.mov_reg(X2, src);
        self.e.mov_reg(X0, X27);
        self.e.mov_reg(X1, ea);
        self.e.mov_imm(X16, helper as u64);
        self.e.blr(X16);
    }

    fn patch_branch(&mut self, pos: usize, target: usize) {
        let word = emitter::encode_b(target as i64 - pos as i64).expect("local branch in range");
        self.e.patch_at(pos, word);
    }

    fn patch_branch_cond(&mut self, pos: usize, c: u32, target: usize) {
        let word = emitter::encode_b_cond(c, target as i64 - pos as i64)
            .expect("local branch in range");
        self.e.patch_at(pos, word);
    }

    // Branch condition per BO/BI into a flag register (nonzero = taken).
    // Returns None when the branch is unconditional.
    fn eval_condition(&mut self, bo: u8, bi: u8, decrement_ctr: bool) -> Option<Reg> {
        let skip_cr = bo & 0x10 != 0;
        let skip_ctr = bo & 0x04 != 0;
        let flag = if skip_cr {
            None
        } else {
            let t = self.ra.alloc_temp();
            self.e.ldrb(t, X19, off_cr_byte(bi));
            if bo & 0x08 == 0 {
                if !self.e.eor_imm(t, t, 1) {
                    unreachable!("one-bit immediate");
                }
            }
            Some(t)
        };
        let ctr_flag = if skip_ctr {
            None
        } else {
            let c = self.ra.alloc_temp();
            if decrement_ctr {
                self.e.ldr(c, X19, off_ctr());
                self.e.sub_imm(c, c, 1);
                self.e.str(c, X19, off_ctr());
            } else {
                self.e.ldr(c, X19, off_ctr());
            }
            self.e.cmp_imm(c, 0);
            self.e.cset(c, if bo & 0x02 != 0 { cond::EQ } else { cond::NE });
            Some(c)
        };
        match (flag, ctr_flag) {
            (Some(f), Some(c)) => {
                self.e.and(f, f, c);
                self.ra.free_temp(c);
                Some(f)
            }
            (Some(f), None) => Some(f),
            (None, Some(c)) => Some(c),
            (None, None) => None,
        }
    }

    fn emit_instruction(&mut self, inst: &DecodedInst, pc: u32) -> Emitted {
        let out = self.translate(inst, pc);
        self.ra.free_all_temps();
        self.ra.unpin_all();
        out
    }

    fn translate(&mut self, inst: &DecodedInst, pc: u32) -> Emitted {
        let rd = inst.rd as usize;
        let ra_idx = inst.ra as usize;
        let rb_idx = inst.rb as usize;
        match inst.op {
            // ----- integer arithmetic -----
            Op::Addi => {
                if inst.ra == 0 {
                    let d = self.ra.get_dest(&mut self.e, rd);
                    self.e.mov_imm(d, inst.simm as i64 as u64);
                } else {
                    let a = self.ra.get(&mut self.e, ra_idx);
                    let d = self.ra.get_dest(&mut self.e, rd);
                    self.add_immediate(d, a, inst.simm as i64);
                }
            }
            Op::Addis => {
                let imm = (inst.simm as i64) << 16;
                if inst.ra == 0 {
                    let d = self.ra.get_dest(&mut self.e, rd);
                    self.e.mov_imm(d, imm as u64);
                } else {
                    let a = self.ra.get(&mut self.e, ra_idx);
                    let d = self.ra.get_dest(&mut self.e, rd);
                    self.add_immediate(d, a, imm);
                }
            }
            Op::Add | Op::Subf if !inst.oe => {
                let a = self.ra.get(&mut self.e, ra_idx);
                let b = self.ra.get(&mut self.e, rb_idx);
                let d = self.ra.get_dest(&mut self.e, rd);
                if inst.op == Op::Add {
                    self.e.add(d, a, b);
                } else {
                    self.e.sub(d, b, a);
                }
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            Op::Neg if !inst.oe => {
                let a = self.ra.get(&mut self.e, ra_idx);
                let d = self.ra.get_dest(&mut self.e, rd);
                self.e.neg(d, a);
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            Op::Mullw if !inst.oe => {
                let a = self.ra.get(&mut self.e, ra_idx);
                let b = self.ra.get(&mut self.e, rb_idx);
                let t1 = self.ra.alloc_temp();
                let t2 = self.ra.alloc_temp();
                self.e.sxtw(t1, a);
                self.e.sxtw(t2, b);
                let d = self.ra.get_dest(&mut self.e, rd);
                self.e.mul(d, t1, t2);
                self.ra.free_temp(t2);
                self.ra.free_temp(t1);
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            Op::Mulld if !inst.oe => {
                let a = self.ra.get(&mut self.e, ra_idx);
                let b = self.ra.get(&mut self.e, rb_idx);
                let d = self.ra.get_dest(&mut self.e, rd);
                self.e.mul(d, a, b);
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            // ----- logical -----
            Op::Ori | Op::Oris | Op::Xori | Op::Xoris | Op::Andi | Op::Andis => {
                let s = self.ra.get(&mut self.e, rd);
                let d = self.ra.get_dest(&mut self.e, ra_idx);
                let imm = match inst.op {
                    Op::Oris | Op::Xoris | Op::Andis => (inst.uimm as u64) << 16,
                    _ => inst.uimm as u64,
                };
                let ok = match inst.op {
                    Op::Ori | Op::Oris => imm == 0 || self.e.orr_imm(d, s, imm),
                    Op::Xori | Op::Xoris => imm == 0 || self.e.eor_imm(d, s, imm),
                    _ => self.e.and_imm(d, s, imm),
                };
                if !ok {
                    let t = self.ra.alloc_temp();
                    self.e.mov_imm(t, imm);
                    match inst.op {
                        Op::Ori | Op::Oris => self.e.orr(d, s, t),
                        Op::Xori | Op::Xoris => self.e.eor(d, s, t),
                        _ => self.e.and(d, s, t),
                    }
                    self.ra.free_temp(t);
                } else if imm == 0 && d != s {
                    self.e.mov_reg(d, s);
                }
                if matches!(inst.op, Op::Andi | Op::Andis) {
                    self.record_cr0(d);
                }
            }
            Op::And | Op::Andc | Op::Or | Op::Orc | Op::Xor | Op::Eqv | Op::Nand | Op::Nor => {
                let s = self.ra.get(&mut self.e, rd);
                let b = self.ra.get(&mut self.e, rb_idx);
                let d = self.ra.get_dest(&mut self.e, ra_idx);
                match inst.op {
                    Op::And => self.e.and(d, s, b),
                    Op::Andc => self.e.bic(d, s, b),
                    Op::Or => self.e.orr(d, s, b),
                    Op::Orc => self.e.orn(d, s, b),
                    Op::Xor => self.e.eor(d, s, b),
                    Op::Eqv => self.e.eon(d, s, b),
                    Op::Nand => {
                        self.e.and(d, s, b);
                        self.e.mvn(d, d);
                    }
                    _ => {
                        self.e.orr(d, s, b);
                        self.e.mvn(d, d);
                    }
                }
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            Op::Extsb | Op::Extsh | Op::Extsw => {
                let s = self.ra.get(&mut self.e, rd);
                let d = self.ra.get_dest(&mut self.e, ra_idx);
                match inst.op {
                    Op::Extsb => self.e.sxtb(d, s),
                    Op::Extsh => self.e.sxth(d, s),
                    _ => self.e.sxtw(d, s),
                }
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            Op::Cntlzw => {
                let s = self.ra.get(&mut self.e, rd);
                let d = self.ra.get_dest(&mut self.e, ra_idx);
                self.e.clz_w(d, s);
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            Op::Cntlzd => {
                let s = self.ra.get(&mut self.e, rd);
                let d = self.ra.get_dest(&mut self.e, ra_idx);
                self.e.clz(d, s);
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            // ----- shifts -----
            Op::Slw | Op::Srw => {
                let s = self.ra.get(&mut self.e, rd);
                let b = self.ra.get(&mut self.e, rb_idx);
                let n = self.ra.alloc_temp();
                let v = self.ra.alloc_temp();
                self.and_mask(n, b, 0x3F);
                self.e.uxtw(v, s);
                let d = self.ra.get_dest(&mut self.e, ra_idx);
                if inst.op == Op::Slw {
                    self.e.lslv(v, v, n);
                    self.e.uxtw(d, v);
                } else {
                    self.e.lsrv(d, v, n);
                }
                self.ra.free_temp(v);
                self.ra.free_temp(n);
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            Op::Sld | Op::Srd => {
                let s = self.ra.get(&mut self.e, rd);
                let b = self.ra.get(&mut self.e, rb_idx);
                let n = self.ra.alloc_temp();
                self.and_mask(n, b, 0x7F);
                let d = self.ra.get_dest(&mut self.e, ra_idx);
                if inst.op == Op::Sld {
                    self.e.lslv(d, s, n);
                } else {
                    self.e.lsrv(d, s, n);
                }
                // Shift counts of 64..127 clear the result; lslv wraps mod 64.
                self.e.cmp_imm(n, 64);
                self.e.csel(d, d, XZR, cond::CC);
                self.ra.free_temp(n);
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            Op::Srawi => {
                let s = self.ra.get(&mut self.e, rd);
                let sh = inst.sh as u32 & 0x1F;
                let v = self.ra.alloc_temp();
                self.e.sxtw(v, s);
                let ca = self.ra.alloc_temp();
                if sh == 0 {
                    self.e.mov_imm(ca, 0);
                } else {
                    let sign = self.ra.alloc_temp();
                    self.and_mask(ca, v, (1u64 << sh) - 1);
                    self.e.cmp_imm(ca, 0);
                    self.e.cset(ca, cond::NE);
                    self.e.lsr_imm(sign, v, 63);
                    self.e.and(ca, ca, sign);
                    self.ra.free_temp(sign);
                }
                self.e.strb(ca, X19, off_xer_ca());
                self.ra.free_temp(ca);
                let d = self.ra.get_dest(&mut self.e, ra_idx);
                self.e.asr_imm(d, v, sh);
                self.ra.free_temp(v);
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            Op::Rlwinm => {
                let s = self.ra.get(&mut self.e, rd);
                let t = self.ra.alloc_temp();
                if inst.sh == 0 {
                    self.e.uxtw(t, s);
                } else {
                    self.e.ror_imm_w(t, s, (32 - inst.sh as u32) & 31);
                }
                let d = self.ra.get_dest(&mut self.e, ra_idx);
                let mask = crate::interp::integer::mask32(inst.mb as u32, inst.me as u32) as u64;
                self.and_mask(d, t, mask);
                self.ra.free_temp(t);
                if inst.rc {
                    self.record_cr0(d);
                }
            }
            // ----- compares -----
            Op::Cmpi | Op::Cmpli | Op::Cmp | Op::Cmpl => {
                let l64 = inst.rd & 1 != 0;
                let a = self.ra.get(&mut self.e, ra_idx);
                let signed = matches!(inst.op, Op::Cmpi | Op::Cmp);
                let t = self.ra.alloc_temp();
                let rhs = match inst.op {
                    Op::Cmpi => {
                        self.e.mov_imm(t, inst.simm as i64 as u64);
                        t
                    }
                    Op::Cmpli => {
                        self.e.mov_imm(t, inst.uimm as u64);
                        t
                    }
                    _ => self.ra.get(&mut self.e, rb_idx),
                };
                if l64 {
                    self.e.cmp(a, rhs);
                } else {
                    self.e.cmp_w(a, rhs);
                }
                self.ra.free_temp(t);
                if signed {
                    self.record_compare(inst.crfd, cond::LT, cond::GT);
                } else {
                    self.record_compare(inst.crfd, cond::CC, cond::HI);
                }
            }
            // ----- SPR moves -----
            Op::Mfspr if inst.spr == 8 || inst.spr == 9 => {
                let d = self.ra.get_dest(&mut self.e, rd);
                let off = if inst.spr == 8 { off_lr() } else { off_ctr() };
                self.e.ldr(d, X19, off);
            }
            Op::Mtspr if inst.spr == 8 || inst.spr == 9 => {
                let s = self.ra.get(&mut self.e, rd);
                let off = if inst.spr == 8 { off_lr() } else { off_ctr() };
                self.e.str(s, X19, off);
            }
            // ----- loads -----
            Op::Lbz | Op::Lbzx | Op::Lbzu | Op::Lbzux => {
                let val = self.emit_load(inst, AccessWidth::B, jit_read_u8 as usize);
                self.finish_load(inst, val, false);
            }
            Op::Lhz | Op::Lhzx | Op::Lhzu | Op::Lhzux => {
                let val = self.emit_load(inst, AccessWidth::H, jit_read_u16 as usize);
                self.finish_load(inst, val, false);
            }
            Op::Lha | Op::Lhau | Op::Lhax | Op::Lhaux => {
                let val = self.emit_load(inst, AccessWidth::H, jit_read_u16 as usize);
                self.finish_load(inst, val, true);
            }
            Op::Lwz | Op::Lwzx | Op::Lwzu | Op::Lwzux => {
                let val = self.emit_load(inst, AccessWidth::W, jit_read_u32 as usize);
                self.finish_load(inst, val, false);
            }
            Op::Lwa | Op::Lwax | Op::Lwaux => {
                let val = self.emit_load(inst, AccessWidth::W, jit_read_u32 as usize);
                self.finish_load(inst, val, true);
            }
            Op::Ld | Op::Ldx | Op::Ldu | Op::Ldux => {
                let val = self.emit_load(inst, AccessWidth::D, jit_read_u64 as usize);
                self.finish_load(inst, val, false);
            }
            // ----- stores -----
            Op::Stb | Op::Stbx | Op::Stbu | Op::Stbux => {
                self.emit_store(inst, AccessWidth::B, jit_write_u8 as usize);
            }
            Op::Sth | Op::Sthx | Op::Sthu | Op::Sthux => {
                self.emit_store(inst, AccessWidth::H, jit_write_u16 as usize);
            }
            Op::Stw | Op::Stwx | Op::Stwu | Op::Stwux => {
                self.emit_store(inst, AccessWidth::W, jit_write_u32 as usize);
            }
            Op::Std | Op::Stdx | Op::Stdu | Op::Stdux => {
                self.emit_store(inst, AccessWidth::D, jit_write_u64 as usize);
            }
            // ----- barriers -----
            Op::Sync | Op::Isync => self.e.dmb_ish(),
            Op::Lwsync => self.e.dmb_ish(),
            Op::Eieio => self.e.dmb_ishst(),
            // ----- branches: all end the block -----
            Op::B => {
                let target = if inst.aa {
                    inst.li as u32
                } else {
                    pc.wrapping_add(inst.li as u32)
                };
                if inst.lk {
                    let t = self.ra.alloc_temp();
                    self.e.mov_imm(t, pc.wrapping_add(4) as u64);
                    self.e.str(t, X19, off_lr());
                    self.ra.free_temp(t);
                }
                self.ra.flush_all(&mut self.e);
                self.exit_static(target, false);
                return Emitted::EndsBlock;
            }
            Op::Bc => {
                let target = if inst.aa {
                    inst.li as u32
                } else {
                    pc.wrapping_add(inst.li as u32)
                };
                if inst.lk {
                    let t = self.ra.alloc_temp();
                    self.e.mov_imm(t, pc.wrapping_add(4) as u64);
                    self.e.str(t, X19, off_lr());
                    self.ra.free_temp(t);
                }
                let flag = self.eval_condition(inst.bo, inst.bi, true);
                self.ra.flush_all(&mut self.e);
                match flag {
                    None => self.exit_static(target, false),
                    Some(f) => {
                        self.e.sub_imm(X28, X28, self.insts);
                        let skip = self.e.pos();
                        self.e.nop(); // cbz f -> not taken
                        self.store_pc_const(target as u64);
                        self.e.cmp_imm(X28, 0);
                        self.branch_to_epilogue(Some(cond::LE));
                        self.link_sites.push((self.e.pos(), target, true));
                        self.epilogue_fixups.push((self.e.pos(), None));
                        self.e.nop();
                        self.exits.push(target);
                        // not-taken path
                        let here = self.e.pos();
                        let disp = here as i64 - skip as i64;
                        self.e
                            .patch_at(skip, 0xB400_0000 | ((((disp >> 2) as u32) & 0x7FFFF) << 5) | f);
                        let fallthrough = pc.wrapping_add(4);
                        self.store_pc_const(fallthrough as u64);
                        self.e.cmp_imm(X28, 0);
                        self.branch_to_epilogue(Some(cond::LE));
                        self.link_sites.push((self.e.pos(), fallthrough, true));
                        self.epilogue_fixups.push((self.e.pos(), None));
                        self.e.nop();
                        self.exits.push(fallthrough);
                        self.ra.free_temp(f);
                    }
                }
                return Emitted::EndsBlock;
            }
            Op::Bclr | Op::Bcctr => {
                let target = self.ra.alloc_temp();
                let off = if inst.op == Op::Bclr { off_lr() } else { off_ctr() };
                self.e.ldr(target, X19, off);
                self.and_mask(target, target, !3u64);
                if inst.lk {
                    let t = self.ra.alloc_temp();
                    self.e.mov_imm(t, pc.wrapping_add(4) as u64);
                    self.e.str(t, X19, off_lr());
                    self.ra.free_temp(t);
                }
                // Branch-to-CTR never takes the count-register condition.
                let bo = if inst.op == Op::Bcctr { inst.bo | 0x04 } else { inst.bo };
                let flag = self.eval_condition(bo, inst.bi, inst.op == Op::Bclr);
                self.ra.flush_all(&mut self.e);
                match flag {
                    None => self.exit_dynamic(target),
                    Some(f) => {
                        self.e.sub_imm(X28, X28, self.insts);
                        let skip = self.e.pos();
                        self.e.nop(); // cbz f -> fallthrough
                        self.e.str(target, X19, off_pc());
                        self.e.cmp_imm(X28, 0);
                        self.branch_to_epilogue(Some(cond::LE));
                        self.branch_to_epilogue(None);
                        let here = self.e.pos();
                        let disp = here as i64 - skip as i64;
                        self.e
                            .patch_at(skip, 0xB400_0000 | ((((disp >> 2) as u32) & 0x7FFFF) << 5) | f);
                        let fallthrough = pc.wrapping_add(4);
                        self.store_pc_const(fallthrough as u64);
                        self.e.cmp_imm(X28, 0);
                        self.branch_to_epilogue(Some(cond::LE));
                        self.link_sites.push((self.e.pos(), fallthrough, true));
                        self.epilogue_fixups.push((self.e.pos(), None));
                        self.e.nop();
                        self.exits.push(fallthrough);
                        self.ra.free_temp(f);
                    }
                }
                self.ra.free_temp(target);
                return Emitted::EndsBlock;
            }
            Op::Sc => {
                let t = self.ra.alloc_temp();
                self.e.mov_imm(t, pc.wrapping_add(4) as u64);
                self.e.str(t, X19, off_pc());
                self.e.mov_imm(t, 1);
                self.e.strb(t, X19, off_interrupted());
                self.e.mov_imm(t, interrupt::SYSCALL as u64);
                self.e.str_w(t, X19, off_interrupt_reason());
                self.ra.free_temp(t);
                self.ra.flush_all(&mut self.e);
                self.e.sub_imm(X28, X28, self.insts);
                self.branch_to_epilogue(None);
                return Emitted::EndsBlock;
            }
            _ => return Emitted::Unsupported,
        }
        Emitted::Ok
    }

    fn finish_load(&mut self, inst: &DecodedInst, val: Reg, sign_extend: bool) {
        // Update forms write the EA back first: the address temp did not
        // survive the slow path, so it is recomputed, and that must happen
        // from the base registers before the destination is clobbered
        // (rd may alias rb; rd == ra is architecturally invalid).
        if matches!(
            inst.op,
            Op::Lbzu
                | Op::Lbzux
                | Op::Lhzu
                | Op::Lhzux
                | Op::Lhau
                | Op::Lhaux
                | Op::Lwzu
                | Op::Lwzux
                | Op::Lwaux
                | Op::Ldu
                | Op::Ldux
        ) {
            let indexed = matches!(
                inst.op,
                Op::Lbzux | Op::Lhzux | Op::Lhaux | Op::Lwzux | Op::Lwaux | Op::Ldux
            );
            let ea = self.effective_address(inst, indexed);
            let ra_host = self.ra.get_dest(&mut self.e, inst.ra as usize);
            self.e.mov_reg(ra_host, ea);
            self.ra.free_temp(ea);
        }
        let d = self.ra.get_dest(&mut self.e, inst.rd as usize);
        if sign_extend {
            match inst.op {
                Op::Lha | Op::Lhau | Op::Lhax | Op::Lhaux => self.e.sxth(d, val),
                _ => self.e.sxtw(d, val),
            }
        } else {
            self.e.mov_reg(d, val);
        }
        self.ra.free_temp(val);
    }
}

impl JitCompiler {
    pub fn new(memory: Arc<GuestMemory>, config: JitConfig) -> Result<Self> {
        let arena = CodeArena::executable(config.cache_size_bytes)?;
        let native_ok = Self::native_dispatch_available() && arena.is_executable();
        let mut cache = BlockCache::new(config.max_blocks);
        cache.set_tracing(config.trace_blocks);
        Ok(JitCompiler {
            interp: Interpreter::new(Arc::clone(&memory)),
            memory,
            config,
            native_ok,
            inner: Mutex::new(JitInner {
                arena,
                arena_pos: 0,
                cache,
                stats: JitStats::default(),
            }),
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn stats(&self) -> JitStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = inner.stats;
        stats.cache_hits = inner.cache.stats().lookup_hits;
        stats.cache_misses = inner.cache.stats().lookup_misses;
        stats
    }

    pub fn cache_stats(&self) -> cache::CacheStats {
        self.inner.lock().unwrap().cache.stats()
    }

    /// True when this host can jump into emitted code.
    pub fn native_dispatch_available() -> bool {
        cfg!(target_arch = "aarch64")
    }

    /// Run the context for up to `cycles`. Returns cycles consumed.
    pub fn execute(&self, ctx: &mut ThreadContext, cycles: u64) -> u64 {
        let mut rt = JitRuntime {
            fastmem_base: self.memory.host_fastmem_base(),
            remaining_cycles: cycles as i64,
            memory: &*self.memory,
        };
        let native = self.native_ok && !self.config.force_interpreter;
        while rt.remaining_cycles > 0 && ctx.running && !ctx.interrupted {
            if ctx.pc as u32 >= HOST_RETURN_BASE {
                break;
            }
            if !native {
                self.interp.execute_one(ctx);
                rt.remaining_cycles -= 1;
                continue;
            }
            let pc = ctx.pc as u32;
            match self.lookup_or_compile(pc) {
                Ok(Some(entry)) => unsafe {
                    call_block(entry, ctx, &mut rt);
                },
                Ok(None) => {
                    self.interp.execute_one(ctx);
                    rt.remaining_cycles -= 1;
                    self.inner.lock().unwrap().stats.interpreter_fallbacks += 1;
                }
                Err(err) => {
                    warn!("translation failed at {:#010x}: {}", pc, err);
                    self.interp.execute_one(ctx);
                    rt.remaining_cycles -= 1;
                }
            }
        }
        cycles - rt.remaining_cycles.max(0) as u64
    }

    /// Drop every block overlapping the written range.
    pub fn invalidate(&self, addr: u32, size: u64) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        inner.cache.invalidate(addr, size, &inner.arena);
    }

    pub fn flush_cache(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.cache.clear();
        inner.arena_pos = 0;
        inner.stats.cache_flushes += 1;
        debug!("code cache flushed");
    }

    /// Compile (if necessary) the block at `addr` without executing it.
    /// Returns false when the leading instruction is outside the translated
    /// subset and execution would fall back to the interpreter.
    pub fn compile(&self, addr: u32) -> Result<bool> {
        self.lookup_or_compile(addr).map(|e| e.is_some())
    }

    pub fn block_present(&self, addr: u32) -> bool {
        self.inner.lock().unwrap().cache.peek(addr).is_some()
    }

    fn lookup_or_compile(&self, addr: u32) -> Result<Option<*const u8>> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if let Some(idx) = inner.cache.lookup(addr) {
            let block = inner.cache.get_mut(idx);
            block.execution_count += 1;
            let entry = unsafe { inner.arena.base().add(block.code_offset) };
            return Ok(Some(entry));
        }
        match self.compile_unlocked(inner, addr)? {
            Some(idx) => {
                let block = inner.cache.get(idx);
                let entry = unsafe { inner.arena.base().add(block.code_offset) };
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn compile_unlocked(&self, inner: &mut JitInner, addr: u32) -> Result<Option<u32>> {
        // Fetch and decode the straight-line run.
        let mut words = Vec::with_capacity(32);
        let mut decoded = Vec::with_capacity(32);
        let mut pc = addr;
        for _ in 0..MAX_BLOCK_INSTS {
            let word = self.memory.read_u32(pc);
            let inst = decoder::decode(word);
            words.push(word);
            decoded.push(inst);
            let ends = matches!(inst.op, Op::B | Op::Bc | Op::Bclr | Op::Bcctr | Op::Sc | Op::Rfid);
            pc = pc.wrapping_add(4);
            if ends {
                break;
            }
        }

        if inner.arena_pos + MAX_BLOCK_CODE > inner.arena.size() {
            inner.cache.clear();
            inner.arena_pos = 0;
            inner.stats.cache_flushes += 1;
            debug!("code arena exhausted, cache flushed");
        }

        let code_offset = inner.arena_pos;
        let window = unsafe { inner.arena.window(code_offset, MAX_BLOCK_CODE) };
        let mut builder = BlockBuilder::new(window, self.config.disable_fastmem);
        builder.prologue();

        let mut consumed = 0usize;
        let mut ended = false;
        for (i, inst) in decoded.iter().enumerate() {
            builder.insts = (i + 1) as u32;
            let inst_pc = addr.wrapping_add(i as u32 * 4);
            match builder.emit_instruction(inst, inst_pc) {
                Emitted::Ok => {
                    consumed = i + 1;
                }
                Emitted::EndsBlock => {
                    consumed = i + 1;
                    ended = true;
                    break;
                }
                Emitted::Unsupported => {
                    if i == 0 {
                        return Ok(None);
                    }
                    // End the block before the unsupported instruction.
                    builder.insts = i as u32;
                    builder.ra.flush_all(&mut builder.e);
                    builder.exit_static(inst_pc, false);
                    consumed = i;
                    ended = true;
                    break;
                }
            }
        }
        if !ended {
            // Instruction-count cap: fall through to the next address.
            builder.insts = consumed as u32;
            builder.ra.flush_all(&mut builder.e);
            builder.exit_static(addr.wrapping_add(consumed as u32 * 4), false);
        }
        builder.epilogue();

        if builder.e.overflowed() {
            return Err(Error::CodeCacheFull);
        }

        let code_size = builder.e.pos() as u32;
        let body_offset = builder.body_offset;
        let mut block = CompiledBlock::new(addr, consumed as u32, code_offset, code_size);
        block.body_offset = body_offset;
        block.hash = hash_guest_code(&words[..consumed]);
        block.exits = builder.exits.clone();
        for (pos, target, conditional) in &builder.link_sites {
            block.links.push(BlockLink {
                target: *target,
                patch_offset: *pos as u32,
                orig_word: builder.e.word_at(*pos),
                linked: false,
                conditional: *conditional,
            });
        }

        inner.arena_pos += (code_size as usize + 63) & !63;
        inner.stats.blocks_compiled += 1;
        inner.stats.code_bytes_used = inner.arena_pos as u64;
        clear_icache(unsafe { inner.arena.base().add(code_offset) }, code_size as usize);

        let idx = inner.cache.insert(block, &inner.arena);
        inner.cache.link(idx, &inner.arena);
        if self.config.trace_blocks {
            debug!(
                "compiled {:#010x} ({} insts, {} bytes)",
                addr, consumed, code_size
            );
        }
        Ok(Some(idx))
    }
}
