// Whole-machine tests: every scenario builds an Engine and drives it the way
// the loader and the guest would.

use em360::context::ThreadContext;
use em360::gpu::backend::{DrawCall, GpuBackend, PrimitiveType};
use em360::gpu::edram::RenderTargetConfig;
use em360::gpu::regs;
use em360::gpu::shaders::PipelineKey;
use em360::kernel::objects::{object_type, DispatcherHeader};
use em360::kernel::threads::{status, CreationFlags, Dpc, ThreadState, INFINITE_TIMEOUT};
use em360::kernel::HleFn;
use em360::memory::{GPU_VIRT_BASE, PHYS_MASK};
use em360::{Configuration, Engine};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn engine() -> Engine {
    Engine::new(Configuration::default()).unwrap()
}

fn load_program(engine: &Engine, base: u32, words: &[u32]) {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    engine.write_bytes(base, &bytes);
}

// ----- memory -----

#[test]
fn physical_and_mirror_round_trips() {
    let e = engine();
    for addr in [0u32, 0x0010_0000, 0x1FFF_FFFC] {
        e.memory.write_u32(addr, 0xA5A5_0000 | addr & 0xFFFF);
        assert_eq!(e.memory.read_u32(addr), 0xA5A5_0000 | addr & 0xFFFF);
    }
    e.memory.write_u32(0x8234_5678 & !3, 0x1357_9BDF);
    assert_eq!(
        e.memory.read_u32(0x8234_5678 & !3),
        e.memory.read_u32((0x8234_5678 & !3) & PHYS_MASK)
    );
}

#[test]
fn mmio_register_unregister_restores_ram() {
    let e = engine();
    let base = 0x4000_0000u32; // outside RAM, MMIO-only range
    let hits = Arc::new(AtomicU32::new(0));
    let h = Arc::clone(&hits);
    e.memory
        .register_mmio(
            base,
            0x100,
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                0x77
            }),
            Arc::new(|_, _| ()),
        )
        .unwrap();
    assert_eq!(e.memory.read_u32(base), 0x77);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    e.memory.unregister_mmio(base).unwrap();
    // Out-of-RAM reads fall back to zero once the window is gone.
    assert_eq!(e.memory.read_u32(base), 0);
}

#[test]
fn reservation_cross_thread_invalidation() {
    let e = engine();
    e.memory.set_reservation(0, 0x0010_0000, 4);
    // A write from any other thread to the reserved range kills it.
    e.memory.write_u32(0x0010_0002, 0xFFFF_FFFF);
    assert!(!e.memory.check_reservation(0, 0x0010_0000, 4));
}

// ----- interpreter scenarios -----

#[test]
fn integer_add_round_trip() {
    let e = engine();
    load_program(&e, 0x8200_0000, &[0x3860_002A]);
    let mut ctx = ThreadContext::new(0);
    ctx.pc = 0x8200_0000;
    e.interpreter.execute_one(&mut ctx);
    assert_eq!(ctx.gpr[3], 42);
    assert_eq!(ctx.pc, 0x8200_0004);
}

#[test]
fn big_endian_store_shows_in_host_bytes() {
    let e = engine();
    load_program(
        &e,
        0x8200_0000,
        &[
            0x3C80_8200, // lis r4, 0x8200
            0x6084_0100, // ori r4, r4, 0x0100
            0x3C60_DEAD, // lis r3, 0xDEAD
            0x6063_BEEF, // ori r3, r3, 0xBEEF
            0x9064_0000, // stw r3, 0(r4)
        ],
    );
    let mut ctx = ThreadContext::new(0);
    ctx.pc = 0x8200_0000;
    for _ in 0..5 {
        e.interpreter.execute_one(&mut ctx);
    }
    assert_eq!(e.memory.read_u32(0x8200_0100), 0xDEAD_BEEF);
    let mut raw = [0u8; 4];
    unsafe {
        std::ptr::copy_nonoverlapping(
            e.memory.host_fastmem_base().add(0x0200_0100),
            raw.as_mut_ptr(),
            4,
        );
    }
    assert_eq!(raw, [0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn branch_targets_mask_low_bits() {
    let e = engine();
    load_program(&e, 0x1000, &[0x4E80_0020]); // blr
    let mut ctx = ThreadContext::new(0);
    ctx.pc = 0x1000;
    ctx.lr = 0x2003;
    e.interpreter.execute_one(&mut ctx);
    assert_eq!(ctx.pc, 0x2000);

    load_program(&e, 0x1000, &[0x4E80_0420]); // bctr
    ctx.pc = 0x1000;
    ctx.ctr = 0x3002;
    e.interpreter.execute_one(&mut ctx);
    assert_eq!(ctx.pc, 0x3000);
}

#[test]
fn store_conditional_fails_after_foreign_write() {
    let e = engine();
    load_program(
        &e,
        0x8200_0000,
        &[
            0x7C60_2028, // lwarx r3, 0, r4
        ],
    );
    let mut ctx = ThreadContext::new(0);
    ctx.pc = 0x8200_0000;
    ctx.gpr[4] = 0x0010_0000;
    e.interpreter.execute_one(&mut ctx);
    assert!(e.memory.check_reservation(0, 0x0010_0000, 4));

    // Another hardware thread stores into the reserved word.
    e.memory.write_u32(0x0010_0000, 0x0BAD_CAFE);

    load_program(&e, 0x8200_0004, &[0x7CA0_212D]); // stwcx. r5, 0, r4
    ctx.gpr[5] = 0x1111_1111;
    e.interpreter.execute_one(&mut ctx);
    assert!(!ctx.cr[0].eq);
    assert!(!e.memory.check_reservation(0, 0x0010_0000, 4));
    assert_eq!(e.memory.read_u32(0x0010_0000), 0x0BAD_CAFE);
}

// ----- JIT and block cache -----

#[test]
fn smc_write_forces_recompilation() {
    let e = engine();
    load_program(&e, 0x8200_0000, &[0x3860_002A, 0x4E80_0020]);
    assert!(e.jit.compile(0x8200_0000).unwrap());
    assert!(e.jit.block_present(0x8200_0000));
    // The guest writes a nop over its own code.
    e.memory.write_u32(0x8200_0000, 0x6000_0000);
    assert!(!e.jit.block_present(0x8200_0000));
    // Recompilation picks up the new bytes.
    assert!(e.jit.compile(0x8200_0000).unwrap());
    assert!(e.jit.block_present(0x8200_0000));
}

#[test]
fn invalidation_is_precise_per_span() {
    let e = engine();
    load_program(&e, 0x8200_0000, &[0x3860_002A, 0x4E80_0020]);
    load_program(&e, 0x8200_0100, &[0x3880_0001, 0x4E80_0020]);
    e.jit.compile(0x8200_0000).unwrap();
    e.jit.compile(0x8200_0100).unwrap();
    // Same page, but only the second block's span is written.
    e.memory.write_u32(0x8200_0104, 0x6000_0000);
    assert!(e.jit.block_present(0x8200_0000));
    assert!(!e.jit.block_present(0x8200_0100));
}

#[cfg(target_arch = "aarch64")]
#[test]
fn jit_equivalence_with_interpreter() {
    let e = engine();
    let program = [
        0x3860_000A, // addi r3, r0, 10
        0x3883_0005, // addi r4, r3, 5
        0x9085_0000, // stw r4, 0(r5)
        0x4E80_0020, // blr
    ];
    load_program(&e, 0x8200_0000, &program);

    // Reference run through the interpreter.
    let mut reference = ThreadContext::new(0);
    reference.pc = 0x8200_0000;
    reference.gpr[5] = 0x0018_0000;
    reference.lr = 0x8300_0000;
    for _ in 0..4 {
        e.interpreter.execute_one(&mut reference);
    }
    let ref_stored = e.memory.read_u32(0x0018_0000);
    e.memory.write_u32(0x0018_0000, 0);

    let mut ctx = ThreadContext::new(0);
    ctx.running = true;
    ctx.pc = 0x8200_0000;
    ctx.gpr[5] = 0x0018_0000;
    ctx.lr = 0x8300_0000;
    e.jit.execute(&mut ctx, 8);

    assert_eq!(ctx.gpr[3], reference.gpr[3]);
    assert_eq!(ctx.gpr[4], reference.gpr[4]);
    assert_eq!(ctx.pc, reference.pc);
    assert_eq!(e.memory.read_u32(0x0018_0000), ref_stored);
    assert_eq!(e.memory.read_u32(0x0018_0000), 15);
}

// ----- scheduler and synchronization -----

#[test]
fn auto_reset_event_wakes_exactly_one_waiter() {
    let e = engine();
    let event = 0x0050_0000u32;
    DispatcherHeader {
        obj_type: object_type::SYNCHRONIZATION_EVENT,
        size: 4,
        inserted: 0,
        signal_state: 0,
    }
    .write(&e.memory, event);

    let a = e.scheduler.create_thread(0x1000, 0, 0, CreationFlags::empty(), 0);
    let b = e.scheduler.create_thread(0x2000, 0, 0, CreationFlags::empty(), 0);

    assert_eq!(e.scheduler.wait_for_object(a, event, INFINITE_TIMEOUT), status::TIMEOUT);
    assert_eq!(e.scheduler.wait_for_object(b, event, INFINITE_TIMEOUT), status::TIMEOUT);
    assert_eq!(e.scheduler.thread_state(a), Some(ThreadState::Waiting));
    assert_eq!(e.scheduler.thread_state(b), Some(ThreadState::Waiting));

    e.scheduler.signal_object(event);

    let a_state = e.scheduler.thread_state(a).unwrap();
    let b_state = e.scheduler.thread_state(b).unwrap();
    let ready = [a_state, b_state]
        .iter()
        .filter(|s| **s == ThreadState::Ready)
        .count();
    assert_eq!(ready, 1);
    assert_eq!(
        [a_state, b_state].iter().filter(|s| **s == ThreadState::Waiting).count(),
        1
    );
    // The event consumed its signal.
    assert_eq!(DispatcherHeader::signal_state(&e.memory, event), 0);
}

#[test]
fn notification_event_wakes_all_waiters() {
    let e = engine();
    let event = 0x0050_0100u32;
    DispatcherHeader {
        obj_type: object_type::NOTIFICATION_EVENT,
        size: 4,
        inserted: 0,
        signal_state: 0,
    }
    .write(&e.memory, event);

    let a = e.scheduler.create_thread(0x1000, 0, 0, CreationFlags::empty(), 0);
    let b = e.scheduler.create_thread(0x2000, 0, 0, CreationFlags::empty(), 0);
    e.scheduler.wait_for_object(a, event, INFINITE_TIMEOUT);
    e.scheduler.wait_for_object(b, event, INFINITE_TIMEOUT);

    e.scheduler.signal_object(event);
    assert_eq!(e.scheduler.thread_state(a), Some(ThreadState::Ready));
    assert_eq!(e.scheduler.thread_state(b), Some(ThreadState::Ready));
    assert_eq!(DispatcherHeader::signal_state(&e.memory, event), 1);
}

#[test]
fn already_signaled_auto_reset_consumes_immediately() {
    let e = engine();
    let event = 0x0050_0200u32;
    DispatcherHeader {
        obj_type: object_type::SYNCHRONIZATION_EVENT,
        size: 4,
        inserted: 0,
        signal_state: 1,
    }
    .write(&e.memory, event);
    let a = e.scheduler.create_thread(0x1000, 0, 0, CreationFlags::empty(), 0);
    assert_eq!(e.scheduler.wait_for_object(a, event, 0), status::SUCCESS);
    assert_eq!(DispatcherHeader::signal_state(&e.memory, event), 0);
    // Second poll with zero timeout reports timeout.
    assert_eq!(e.scheduler.wait_for_object(a, event, 0), status::TIMEOUT);
}

#[test]
fn semaphore_releases_bounded_by_count() {
    let e = engine();
    let sem = 0x0050_0300u32;
    DispatcherHeader {
        obj_type: object_type::SEMAPHORE,
        size: 5,
        inserted: 0,
        signal_state: 0,
    }
    .write(&e.memory, sem);
    e.scheduler.register_object(sem, object_type::SEMAPHORE, 2);

    let a = e.scheduler.create_thread(0x1000, 0, 0, CreationFlags::empty(), 0);
    let b = e.scheduler.create_thread(0x2000, 0, 0, CreationFlags::empty(), 0);
    let c = e.scheduler.create_thread(0x3000, 0, 0, CreationFlags::empty(), 0);
    for tid in [a, b, c] {
        e.scheduler.wait_for_object(tid, sem, INFINITE_TIMEOUT);
    }
    // One release wakes exactly one waiter.
    e.scheduler.signal_object(sem);
    let ready: usize = [a, b, c]
        .iter()
        .filter(|t| e.scheduler.thread_state(**t) == Some(ThreadState::Ready))
        .count();
    assert_eq!(ready, 1);
    assert_eq!(DispatcherHeader::signal_state(&e.memory, sem), 0);
}

#[test]
fn wait_for_multiple_reports_satisfying_index() {
    let e = engine();
    let ev0 = 0x0050_0400u32;
    let ev1 = 0x0050_0440u32;
    for (addr, state) in [(ev0, 0), (ev1, 1)] {
        DispatcherHeader {
            obj_type: object_type::NOTIFICATION_EVENT,
            size: 4,
            inserted: 0,
            signal_state: state,
        }
        .write(&e.memory, addr);
    }
    let a = e.scheduler.create_thread(0x1000, 0, 0, CreationFlags::empty(), 0);
    assert_eq!(e.scheduler.wait_for_multiple(a, &[ev0, ev1], false, 0), 1);
    // wait_all with one unsignaled object times out.
    assert_eq!(
        e.scheduler.wait_for_multiple(a, &[ev0, ev1], true, 0),
        status::TIMEOUT
    );
}

#[test]
fn mutant_transfers_ownership() {
    let e = engine();
    let mutant = 0x0050_0500u32;
    DispatcherHeader {
        obj_type: object_type::MUTANT,
        size: 4,
        inserted: 0,
        signal_state: 1,
    }
    .write(&e.memory, mutant);

    let a = e.scheduler.create_thread(0x1000, 0, 0, CreationFlags::empty(), 0);
    let b = e.scheduler.create_thread(0x2000, 0, 0, CreationFlags::empty(), 0);
    // a acquires, recursively reacquires.
    assert_eq!(e.scheduler.wait_for_object(a, mutant, 0), status::SUCCESS);
    assert_eq!(e.scheduler.wait_for_object(a, mutant, 0), status::SUCCESS);
    // b has to wait.
    assert_eq!(e.scheduler.wait_for_object(b, mutant, INFINITE_TIMEOUT), status::TIMEOUT);
    // First release only unwinds the recursion.
    e.scheduler.signal_object(mutant);
    assert_eq!(e.scheduler.thread_state(b), Some(ThreadState::Waiting));
    // Second release hands the mutant to b.
    e.scheduler.signal_object(mutant);
    assert_eq!(e.scheduler.thread_state(b), Some(ThreadState::Ready));
    assert_eq!(DispatcherHeader::signal_state(&e.memory, mutant), 0);
}

#[test]
fn timer_fires_through_tick() {
    let e = engine();
    let timer = 0x0050_0600u32;
    DispatcherHeader {
        obj_type: object_type::TIMER_NOTIFICATION,
        size: 4,
        inserted: 0,
        signal_state: 0,
    }
    .write(&e.memory, timer);
    let a = e.scheduler.create_thread(0x1000, 0, 0, CreationFlags::empty(), 0);
    e.scheduler.wait_for_object(a, timer, INFINITE_TIMEOUT);
    e.scheduler.set_timer(timer, 0, 0);
    e.scheduler.tick(0);
    assert_eq!(e.scheduler.thread_state(a), Some(ThreadState::Ready));
    assert_eq!(DispatcherHeader::signal_state(&e.memory, timer), 1);
}

#[test]
fn dpc_runs_guest_routine_at_tick() {
    let e = engine();
    // The routine stores its first argument through its context pointer.
    load_program(&e, 0x8210_0000, &[0x9083_0000, 0x4E80_0020]); // stw r4, 0(r3); blr
    e.scheduler.queue_dpc(Dpc {
        routine: 0x8210_0000,
        context: 0x0070_0000,
        arg1: 0x1234_5678,
        arg2: 0,
    });
    e.scheduler.tick(0);
    assert_eq!(e.memory.read_u32(0x0070_0000), 0x1234_5678);
}

// ----- end to end through the workers -----

#[test]
fn guest_program_runs_to_completion() {
    let e = engine();
    // Sum 10..1 into r5, store, exit through import 0001:0001.
    let program = [
        0x3C80_8300, // lis r4, 0x8300
        0x3860_000A, // addi r3, r0, 10
        0x38A0_0000, // addi r5, r0, 0
        0x7CA5_1A14, // add r5, r5, r3
        0x3463_FFFF, // addic. r3, r3, -1
        0x4082_FFF8, // bne -8
        0x90A4_0000, // stw r5, 0(r4)
        0x3C00_0001, // lis r0, 1
        0x6000_0001, // ori r0, r0, 1
        0x4400_0002, // sc
    ];
    load_program(&e, 0x8200_0000, &program);

    let finished = Arc::new(AtomicU32::new(0));
    let flag = Arc::clone(&finished);
    let exit: HleFn = Arc::new(move |ctx, kernel, sched| {
        flag.store(kernel.memory().read_u32(0x8300_0000), Ordering::SeqCst);
        sched.terminate_thread(ctx.thread_id, 0);
        ctx.running = false;
    });
    e.register_hle(1, 1, exit);

    e.start_thread(0, 0x8200_0000, 0x7000_0000);
    e.execute(Some(Duration::from_secs(10))).unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 55);
    assert_eq!(e.memory.read_u32(0x8300_0000), 55);
}

// ----- GPU through the guest-visible windows -----

struct CountingBackend {
    draws: Arc<AtomicU32>,
    frames: Arc<AtomicU32>,
}

impl GpuBackend for CountingBackend {
    fn begin_frame(&mut self) {}
    fn bind_framebuffer(&mut self, _key: u64, _attachments: &[RenderTargetConfig]) {}
    fn bind_pipeline(&mut self, _key: &PipelineKey, _vs: u64, _ps: u64) {}
    fn set_vertex_constants(&mut self, _c: &[f32]) {}
    fn set_pixel_constants(&mut self, _c: &[f32]) {}
    fn set_textures(&mut self, _f: &[em360::gpu::backend::FetchConstant]) {}
    fn draw_indexed(&mut self, draw: &DrawCall) {
        assert_eq!(draw.primitive, PrimitiveType::TriangleList);
        self.draws.fetch_add(1, Ordering::SeqCst);
    }
    fn resolve(&mut self, _a: &RenderTargetConfig, _d: u32, _p: u32) {}
    fn end_frame(&mut self) {
        self.frames.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn ring_buffer_draw_through_gpu_virtual_window() {
    let draws = Arc::new(AtomicU32::new(0));
    let frames = Arc::new(AtomicU32::new(0));
    let backend = CountingBackend { draws: Arc::clone(&draws), frames: Arc::clone(&frames) };
    let e = Engine::new(Configuration {
        gpu_backend: Some(Box::new(backend)),
        ..Configuration::default()
    })
    .unwrap();

    let ring = 0x0060_0000u32;
    let words = [
        (3u32 << 30) | ((4 - 1) << 16) | 0x22, // DRAW_INDX, 4 dwords
        0,
        (4 << 8) | 3, // triangle list, 3 indices
        0,
        0,
        (3u32 << 30) | 0x40, // INTERRUPT, 1 dword
        0,
    ];
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    e.memory.write_bytes(ring, &bytes);

    // Program the ring through the GPU virtual alias, the way titles do.
    e.memory.write_u32(GPU_VIRT_BASE + regs::CP_RB_BASE * 4, ring);
    e.memory.write_u32(GPU_VIRT_BASE + regs::CP_RB_CNTL * 4, 12);
    e.memory.write_u32(GPU_VIRT_BASE + regs::CP_RB_WPTR * 4, words.len() as u32);

    assert_eq!(draws.load(Ordering::SeqCst), 1);
    assert_eq!(frames.load(Ordering::SeqCst), 1);
    assert_eq!(
        e.memory.read_u32(GPU_VIRT_BASE + regs::CP_RB_RPTR * 4),
        words.len() as u32
    );
}
