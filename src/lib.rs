use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod context;
pub mod decoder;
pub mod error;
pub mod gpu;
pub mod interp;
pub mod jit;
pub mod kernel;
pub mod memory;
pub mod savestate;

pub use context::ThreadContext;
pub use error::{Error, Result};
pub use interp::Interpreter;
pub use jit::JitCompiler;
pub use kernel::threads::Scheduler;
pub use kernel::Kernel;
pub use memory::GuestMemory;

use gpu::backend::{GpuBackend, NullBackend, PresentFn};
use gpu::Gpu;
use jit::JitConfig;
use kernel::threads::CreationFlags;
use log::info;

/// Per-subsystem logging switches, each consulted at most once per relevant
/// operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceFlags {
    pub memory: bool,
    pub blocks: bool,
    pub mmio: bool,
    pub syscalls: bool,
    pub threads: bool,
    pub shaders: bool,
    pub draws: bool,
}

pub struct Configuration {
    pub jit_cache_size_bytes: usize,
    pub max_blocks: usize,
    pub disable_fastmem: bool,
    pub force_interpreter: bool,
    pub trace: TraceFlags,
    pub gpu_backend: Option<Box<dyn GpuBackend>>,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            jit_cache_size_bytes: 128 * 1024 * 1024,
            max_blocks: jit::cache::DEFAULT_MAX_BLOCKS,
            disable_fastmem: false,
            force_interpreter: false,
            trace: TraceFlags::default(),
            gpu_backend: None,
        }
    }
}

/// The long-lived owner of the guest machine: memory, recompiler, kernel,
/// scheduler and GPU front end.
pub struct Engine {
    pub memory: Arc<GuestMemory>,
    pub interpreter: Arc<Interpreter>,
    pub jit: Arc<JitCompiler>,
    pub kernel: Arc<Kernel>,
    pub scheduler: Arc<Scheduler>,
    pub gpu: Arc<Gpu>,
}

impl Engine {
    pub fn new(config: Configuration) -> Result<Engine> {
        let trace = config.trace;
        let memory = Arc::new(GuestMemory::with_tracing(trace.memory, trace.mmio)?);
        let jit = Arc::new(JitCompiler::new(
            Arc::clone(&memory),
            JitConfig {
                cache_size_bytes: config.jit_cache_size_bytes,
                max_blocks: config.max_blocks,
                disable_fastmem: config.disable_fastmem,
                force_interpreter: config.force_interpreter,
                trace_blocks: trace.blocks,
            },
        )?);
        let interpreter = Arc::new(Interpreter::with_tracing(Arc::clone(&memory), trace.blocks));
        let kernel = Arc::new(Kernel::new(Arc::clone(&memory), trace.syscalls));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&memory),
            Arc::clone(&jit),
            Arc::clone(&kernel),
            trace.threads,
        ));
        let backend = config.gpu_backend.unwrap_or_else(|| Box::new(NullBackend::new()));
        let gpu = Arc::new(Gpu::new(Arc::clone(&memory), backend, trace.shaders, trace.draws));
        gpu.attach(&memory)?;

        // Self-modifying code: any write over a compiled block tears it down
        // before the write returns.
        let smc_jit = Arc::clone(&jit);
        memory.track_writes(
            0,
            memory::RAM_SIZE as u64,
            Arc::new(move |addr, size| smc_jit.invalidate(addr, size)),
        );
        // Shader microcode invalidation is queued and drained by the stream.
        let dirty = gpu.stream.lock().unwrap().shader_dirty_queue();
        memory.track_writes(
            1,
            memory::RAM_SIZE as u64 - 1,
            Arc::new(move |addr, size| dirty.lock().unwrap().push((addr, size))),
        );

        info!("engine up: fastmem at {:p}", memory.host_fastmem_base());
        Ok(Engine { memory, interpreter, jit, kernel, scheduler, gpu })
    }

    // ----- loader surface -----

    pub fn allocate(&self, base: u32, size: u64, flags: memory::RegionFlags) -> Result<()> {
        self.memory.allocate(base, size, flags)
    }

    pub fn write_bytes(&self, base: u32, data: &[u8]) {
        self.memory.write_bytes(base, data);
    }

    /// Start a guest thread pinned to one hardware thread. Returns its
    /// kernel handle.
    pub fn start_thread(&self, hw_thread: u32, entry: u32, stack_top: u32) -> u32 {
        let tid = self.scheduler.start_thread(hw_thread, entry, stack_top);
        self.kernel.insert_handle(kernel::HandleObject::Thread(tid))
    }

    pub fn create_thread(&self, entry: u32, param: u64, stack_size: u32, suspended: bool) -> u32 {
        let flags = if suspended { CreationFlags::SUSPENDED } else { CreationFlags::empty() };
        let tid = self.scheduler.create_thread(entry, param, stack_size, flags, 0);
        self.kernel.insert_handle(kernel::HandleObject::Thread(tid))
    }

    pub fn register_hle(&self, module: u16, ordinal: u16, f: kernel::HleFn) {
        self.kernel.register_hle(module, ordinal, f);
    }

    pub fn set_presenter(&self, presenter: PresentFn) {
        self.gpu.set_presenter(presenter);
    }

    // ----- execution -----

    /// Spawn the workers and return immediately.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Top-level entry: run until every guest thread has terminated or the
    /// deadline passes, then stop the workers.
    pub fn execute(&self, deadline: Option<Duration>) -> Result<()> {
        self.scheduler.start();
        let begin = Instant::now();
        while self.scheduler.has_live_threads() {
            if let Some(limit) = deadline {
                if begin.elapsed() > limit {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.scheduler.shutdown();
        self.memory.log_access_counters();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.scheduler.is_stopped() {
            self.scheduler.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_builds_with_defaults() {
        let engine = Engine::new(Configuration::default()).unwrap();
        engine.memory.write_u32(0x8200_0000, 0x6000_0000);
        assert_eq!(engine.memory.read_u32(0x0200_0000), 0x6000_0000);
    }

    #[test]
    fn smc_hook_invalidates_compiled_blocks() {
        let engine = Engine::new(Configuration::default()).unwrap();
        engine.memory.write_u32(0x8200_0000, 0x3860_002A); // addi r3, r0, 42
        engine.memory.write_u32(0x8200_0004, 0x4E80_0020); // blr
        engine.jit.compile(0x8200_0000).unwrap();
        assert!(engine.jit.block_present(0x8200_0000));
        // Writing a nop over the block must drop it before the write returns.
        engine.memory.write_u32(0x8200_0000, 0x6000_0000);
        assert!(!engine.jit.block_present(0x8200_0000));
    }

    #[test]
    fn region_bookkeeping_round_trip() {
        let engine = Engine::new(Configuration::default()).unwrap();
        engine
            .allocate(0x0001_0000, 0x2000, memory::RegionFlags::READ | memory::RegionFlags::WRITE)
            .unwrap();
        assert!(engine.memory.query(0x0001_1000).is_some());
        assert!(engine.allocate(0x0001_1000, 0x1000, memory::RegionFlags::READ).is_err());
        engine.memory.free(0x0001_0000);
        assert!(engine.memory.query(0x0001_1000).is_none());
    }
}
