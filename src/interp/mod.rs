// The interpreter executes one decoded instruction at a time against a
// ThreadContext. It is the authoritative semantics: every translation the
// recompiler produces must leave the context and memory in the same state
// this code does.

mod branch;
mod float;
pub(crate) mod integer;
mod loadstore;
mod system;
mod vector;

use crate::context::ThreadContext;
use crate::decoder::{self, Category, DecodedInst};
use crate::memory::GuestMemory;
use log::trace;
use std::sync::Arc;

// Each instruction costs one scheduling cycle and moves the guest-visible
// time base by four (the Xenon decrementer ratio).
pub const TIME_BASE_STEP: u64 = 4;

pub struct Interpreter {
    memory: Arc<GuestMemory>,
    trace: bool,
}

impl Interpreter {
    pub fn new(memory: Arc<GuestMemory>) -> Self {
        Interpreter { memory, trace: false }
    }

    pub fn with_tracing(memory: Arc<GuestMemory>, trace: bool) -> Self {
        Interpreter { memory, trace }
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    /// Execute the instruction at the context's PC. Returns cycles consumed.
    pub fn execute_one(&self, ctx: &mut ThreadContext) -> u32 {
        let pc = ctx.pc;
        let word = self.memory.read_u32(pc as u32);
        let inst = decoder::decode(word);
        if self.trace {
            trace!("{:#010x}: {:08x} {}", pc, word, inst.mnemonic());
        }
        // PC moves first so branch-and-link and sc observe the next address.
        ctx.pc = pc.wrapping_add(4);
        self.dispatch(ctx, &inst, pc);
        self.memory.advance_time_base(TIME_BASE_STEP);
        ctx.time_base = self.memory.time_base();
        1
    }

    /// Execute until the cycle budget is spent or the context stops running.
    pub fn run(&self, ctx: &mut ThreadContext, cycles: u64) -> u64 {
        let mut executed = 0;
        while executed < cycles && ctx.running && !ctx.interrupted {
            executed += self.execute_one(ctx) as u64;
        }
        executed
    }

    fn dispatch(&self, ctx: &mut ThreadContext, inst: &DecodedInst, pc: u64) {
        match inst.category() {
            Category::Integer => integer::execute(ctx, inst),
            Category::LoadStore => loadstore::execute(&self.memory, ctx, inst),
            Category::Branch => branch::execute(ctx, inst, pc),
            Category::CrLogical => integer::execute_cr(ctx, inst),
            Category::SprMove => system::execute_spr(&self.memory, ctx, inst),
            Category::Float => float::execute(ctx, inst),
            Category::Vector => vector::execute(ctx, inst),
            Category::Trap => system::execute_trap(ctx, inst, pc),
            Category::Syscall => system::execute_syscall(ctx, inst),
            Category::Sync => system::execute_sync(inst),
            Category::Cache => system::execute_cache(&self.memory, ctx, inst),
            Category::Unknown => {
                log::warn!("unknown instruction {:#010x} at {:#010x}, skipped", inst.raw, pc);
            }
        }
    }
}

/// D-form effective address: (ra|0) + simm.
pub(crate) fn ea_d(ctx: &ThreadContext, inst: &DecodedInst) -> u32 {
    let base = if inst.ra == 0 { 0 } else { ctx.gpr[inst.ra as usize] };
    base.wrapping_add(inst.simm as i64 as u64) as u32
}

/// X-form effective address: (ra|0) + rb.
pub(crate) fn ea_x(ctx: &ThreadContext, inst: &DecodedInst) -> u32 {
    let base = if inst.ra == 0 { 0 } else { ctx.gpr[inst.ra as usize] };
    base.wrapping_add(ctx.gpr[inst.rb as usize]) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> (Interpreter, ThreadContext) {
        let memory = Arc::new(GuestMemory::new().unwrap());
        let ctx = ThreadContext::new(0);
        (Interpreter::new(memory), ctx)
    }

    #[test]
    fn addi_round_trip() {
        let (interp, mut ctx) = machine();
        interp.memory().write_u32(0x8200_0000, 0x3860_002A); // addi r3, r0, 42
        ctx.pc = 0x8200_0000;
        interp.execute_one(&mut ctx);
        assert_eq!(ctx.gpr[3], 42);
        assert_eq!(ctx.pc, 0x8200_0004);
    }

    #[test]
    fn big_endian_store_sequence() {
        let (interp, mut ctx) = machine();
        let program: [u32; 5] = [
            0x3C80_8200, // lis r4, 0x8200
            0x6084_0100, // ori r4, r4, 0x0100
            0x3C60_DEAD, // lis r3, 0xDEAD
            0x6063_BEEF, // ori r3, r3, 0xBEEF
            0x9064_0000, // stw r3, 0(r4)
        ];
        for (i, w) in program.iter().enumerate() {
            interp.memory().write_u32(0x8200_1000 + i as u32 * 4, *w);
        }
        ctx.pc = 0x8200_1000;
        for _ in 0..5 {
            interp.execute_one(&mut ctx);
        }
        assert_eq!(interp.memory().read_u32(0x8200_0100), 0xDEAD_BEEF);
        let mut raw = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(
                interp.memory().host_fastmem_base().add(0x0200_0100),
                raw.as_mut_ptr(),
                4,
            );
        }
        assert_eq!(raw, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn unknown_instruction_advances_pc() {
        let (interp, mut ctx) = machine();
        interp.memory().write_u32(0x1000, 0x0000_0000);
        ctx.pc = 0x1000;
        interp.execute_one(&mut ctx);
        assert_eq!(ctx.pc, 0x1004);
    }

    #[test]
    fn time_base_moves_four_per_instruction() {
        let (interp, mut ctx) = machine();
        interp.memory().write_u32(0x1000, 0x6000_0000); // nop
        interp.memory().write_u32(0x1004, 0x6000_0000);
        ctx.pc = 0x1000;
        interp.execute_one(&mut ctx);
        interp.execute_one(&mut ctx);
        assert_eq!(interp.memory().time_base(), 8);
        assert_eq!(ctx.time_base, 8);
    }
}
