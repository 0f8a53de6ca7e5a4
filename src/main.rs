// Minimal machine bring-up: hand-assemble a small guest program, register
// one kernel import for it to exit through, and run it on the engine.

use em360::kernel::HleFn;
use em360::{Configuration, Engine};
use std::sync::Arc;
use std::time::Duration;

const LOAD_ADDR: u32 = 0x8200_0000;
const RESULT_ADDR: u32 = 0x8300_0000;

// Sum the integers 10..1, store the result, then call import 0001:0001.
const PROGRAM: [u32; 10] = [
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

fn main() {
    env_logger::init();

    let engine = Engine::new(Configuration::default()).expect("engine construction");

    let bytes: Vec<u8> = PROGRAM.iter().flat_map(|w| w.to_be_bytes()).collect();
    engine.write_bytes(LOAD_ADDR, &bytes);

    let exit: HleFn = Arc::new(|ctx, kernel, sched| {
        let sum = kernel.memory().read_u32(RESULT_ADDR);
        println!("guest finished: sum = {}", sum);
        sched.terminate_thread(ctx.thread_id, sum);
        ctx.running = false;
    });
    engine.register_hle(1, 1, exit);

    engine.start_thread(0, LOAD_ADDR, 0x7000_0000);
    engine.execute(Some(Duration::from_secs(5))).expect("run");

    let jit = engine.jit.stats();
    println!(
        "blocks compiled: {}, cache hits: {}, interpreter fallbacks: {}",
        jit.blocks_compiled, jit.cache_hits, jit.interpreter_fallbacks
    );
}
