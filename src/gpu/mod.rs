// GPU front end: the PM4 command stream, the eDRAM surface map and the
// shader/pipeline bridge, glued to guest memory through the two MMIO windows
// (the register file at 0x7FC00000 and its alias in GPU virtual space).

pub mod backend;
pub mod command;
pub mod edram;
pub mod regs;
pub mod shaders;

use crate::error::Result;
use crate::memory::{GuestMemory, GPU_MMIO_BASE, GPU_MMIO_END, GPU_VIRT_BASE, GPU_VIRT_END};
use backend::{GpuBackend, PresentFn};
use command::CommandStream;
use std::sync::{Arc, Mutex};

pub struct Gpu {
    pub stream: Mutex<CommandStream>,
}

impl Gpu {
    pub fn new(
        memory: Arc<GuestMemory>,
        device: Box<dyn GpuBackend>,
        trace_shaders: bool,
        trace_draws: bool,
    ) -> Self {
        Gpu {
            stream: Mutex::new(CommandStream::new(memory, device, trace_shaders, trace_draws)),
        }
    }

    pub fn set_presenter(&self, presenter: PresentFn) {
        self.stream.lock().unwrap().set_presenter(presenter);
    }

    fn register_index(addr: u32) -> Option<u32> {
        if (GPU_MMIO_BASE..GPU_MMIO_END).contains(&addr) {
            Some((addr - GPU_MMIO_BASE) >> 2)
        } else if (GPU_VIRT_BASE..GPU_VIRT_END).contains(&addr) {
            Some((addr - GPU_VIRT_BASE) >> 2)
        } else {
            None
        }
    }

    pub fn mmio_read(&self, addr: u32) -> u32 {
        match Self::register_index(addr) {
            Some(index) => self.stream.lock().unwrap().register(index),
            None => 0,
        }
    }

    pub fn mmio_write(&self, addr: u32, value: u32) {
        if let Some(index) = Self::register_index(addr) {
            self.stream.lock().unwrap().write_register(index, value);
        }
    }

    /// Register both GPU windows on guest memory. Writes into GPU virtual
    /// space route to the same register file as the physical window.
    pub fn attach(self: &Arc<Self>, memory: &GuestMemory) -> Result<()> {
        for (base, end) in [
            (GPU_MMIO_BASE, GPU_MMIO_END),
            (GPU_VIRT_BASE, GPU_VIRT_END),
        ] {
            let read_gpu = Arc::clone(self);
            let write_gpu = Arc::clone(self);
            memory.register_mmio(
                base,
                (end - base) as u64,
                Arc::new(move |addr| read_gpu.mmio_read(addr)),
                Arc::new(move |addr, value| write_gpu.mmio_write(addr, value)),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::backend::NullBackend;
    use super::regs::*;
    use super::*;

    fn machine() -> (Arc<GuestMemory>, Arc<Gpu>) {
        let memory = Arc::new(GuestMemory::new().unwrap());
        let gpu = Arc::new(Gpu::new(
            Arc::clone(&memory),
            Box::new(NullBackend::new()),
            false,
            false,
        ));
        gpu.attach(&memory).unwrap();
        (memory, gpu)
    }

    // Build a ring at `base` out of dwords, returning the write pointer.
    fn fill_ring(mem: &GuestMemory, base: u32, words: &[u32]) -> u32 {
        for (i, w) in words.iter().enumerate() {
            mem.write_u32(base + i as u32 * 4, *w);
        }
        words.len() as u32
    }

    fn type3(opcode: u32, count: u32) -> u32 {
        (3 << 30) | ((count - 1) << 16) | opcode
    }

    #[test]
    fn mmio_windows_alias_the_register_file() {
        let (mem, gpu) = machine();
        mem.write_u32(GPU_MMIO_BASE + RB_SURFACE_INFO * 4, 1280);
        assert_eq!(gpu.mmio_read(GPU_VIRT_BASE + RB_SURFACE_INFO * 4), 1280);
        mem.write_u32(GPU_VIRT_BASE + RB_COLOR_INFO * 4, 0x40000);
        assert_eq!(mem.read_u32(GPU_MMIO_BASE + RB_COLOR_INFO * 4), 0x40000);
    }

    #[test]
    fn type0_packet_writes_register_window() {
        let (mem, gpu) = machine();
        let ring = 0x0060_0000;
        // Type-0: write 2 registers starting at RB_SURFACE_INFO.
        let header = ((2u32 - 1) << 16) | RB_SURFACE_INFO;
        let wptr = fill_ring(&mem, ring, &[header, 640, 0x1234]);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_BASE * 4, ring);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_CNTL * 4, 12); // 4 KB ring
        mem.write_u32(GPU_MMIO_BASE + CP_RB_WPTR * 4, wptr);
        let stream = gpu.stream.lock().unwrap();
        assert_eq!(stream.register(RB_SURFACE_INFO), 640);
        assert_eq!(stream.register(RB_SURFACE_INFO + 1), 0x1234);
        assert_eq!(stream.stats().packets_processed, 1);
    }

    #[test]
    fn draw_packet_reaches_backend_and_interrupt_ends_frame() {
        let (mem, gpu) = machine();
        let ring = 0x0060_0000;
        let words = [
            type3(0x22, 4), // DRAW_INDX
            0x0000_0000,    // initiator: not indexed
            (4 << 8) | 3,   // triangle list, 3 indices
            0,
            0,
            type3(0x40, 1), // INTERRUPT
            0,
        ];
        let wptr = fill_ring(&mem, ring, &words);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_BASE * 4, ring);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_CNTL * 4, 12);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_WPTR * 4, wptr);

        let stream = gpu.stream.lock().unwrap();
        assert_eq!(stream.stats().draws, 1);
        assert_eq!(stream.stats().frames_completed, 1);
    }

    #[test]
    fn mem_write_packet_stores_to_guest() {
        let (mem, gpu) = machine();
        let ring = 0x0060_0000;
        let words = [type3(0x3D, 2), 0x0070_0000, 0xAABB_CCDD];
        let wptr = fill_ring(&mem, ring, &words);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_BASE * 4, ring);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_CNTL * 4, 12);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_WPTR * 4, wptr);
        drop(gpu);
        assert_eq!(mem.read_u32(0x0070_0000), 0xAABB_CCDD);
    }

    #[test]
    fn indirect_buffer_recurses() {
        let (mem, gpu) = machine();
        let ring = 0x0060_0000;
        let ib = 0x0061_0000;
        // Indirect buffer holds a MEM_WRITE.
        fill_ring(&mem, ib, &[type3(0x3D, 2), 0x0070_0000, 0x1111_2222]);
        let words = [type3(0x3F, 2), ib, 3];
        let wptr = fill_ring(&mem, ring, &words);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_BASE * 4, ring);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_CNTL * 4, 12);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_WPTR * 4, wptr);
        drop(gpu);
        assert_eq!(mem.read_u32(0x0070_0000), 0x1111_2222);
    }

    #[test]
    fn event_write_timestamps_guest_memory() {
        let (mem, gpu) = machine();
        let ring = 0x0060_0000;
        let words = [type3(0x46, 3), 0x2B, 0x0070_0010, 0xFEED_0001];
        let wptr = fill_ring(&mem, ring, &words);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_BASE * 4, ring);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_CNTL * 4, 12);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_WPTR * 4, wptr);
        drop(gpu);
        assert_eq!(mem.read_u32(0x0070_0010), 0xFEED_0001);
    }

    #[test]
    fn load_constants_from_memory() {
        let (mem, gpu) = machine();
        let ring = 0x0060_0000;
        let src = 0x0062_0000;
        mem.write_u32(src, 1.5f32.to_bits());
        mem.write_u32(src + 4, 2.5f32.to_bits());
        mem.write_u32(src + 8, 3.5f32.to_bits());
        mem.write_u32(src + 12, 4.5f32.to_bits());
        // LOAD_ALU_CONSTANT: one vec4 into vertex constant 0.
        let words = [type3(0x2F, 2), (1 << 16), src];
        let wptr = fill_ring(&mem, ring, &words);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_BASE * 4, ring);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_CNTL * 4, 12);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_WPTR * 4, wptr);
        let stream = gpu.stream.lock().unwrap();
        assert_eq!(stream.stats().packets_processed, 1);
        assert_eq!(stream.vertex_constant(0), 1.5);
        assert_eq!(stream.vertex_constant(3), 4.5);
    }

    #[test]
    fn presenter_fires_on_frame_completion() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let (mem, gpu) = machine();
        let frames = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&frames);
        gpu.set_presenter(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let ring = 0x0060_0000;
        let words = [type3(0x40, 1), 0];
        let wptr = fill_ring(&mem, ring, &words);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_BASE * 4, ring);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_CNTL * 4, 12);
        mem.write_u32(GPU_MMIO_BASE + CP_RB_WPTR * 4, wptr);
        assert_eq!(frames.load(Ordering::SeqCst), 1);
    }
}
