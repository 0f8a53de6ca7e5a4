// PM4 command stream: drains the ring buffer from the read pointer toward
// the write pointer, executing type-0 register writes, type-2 no-ops and
// type-3 commands. Draws assemble the render state out of the register file
// and hand it to the device backend.

use super::backend::{DrawCall, FetchConstant, GpuBackend, IndexFormat, PresentFn, PrimitiveType};
use super::edram::{MsaaMode, RenderTargetConfig, RenderTargetSurfaceMap, SurfaceFormat};
use super::regs::*;
use super::shaders::{PipelineKey, ShaderKind, ShaderPipelineBridge};
use crate::memory::GuestMemory;
use log::{debug, trace, warn};
use std::sync::{Arc, Mutex};

/// Type-3 opcodes the stream understands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Pm4Opcode {
    Nop,
    Interrupt,
    WaitForIdle,
    WaitRegMem,
    RegRmw,
    LoadAluConstant,
    LoadBoolConstant,
    LoadLoopConstant,
    SetConstant,
    DrawIndx,
    DrawIndx2,
    MemWrite,
    EventWrite,
    IndirectBuffer,
    MeInit,
    InvalidateState,
    Unknown(u8),
}

impl Pm4Opcode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x10 => Pm4Opcode::Nop,
            0x40 => Pm4Opcode::Interrupt,
            0x26 => Pm4Opcode::WaitForIdle,
            0x3C => Pm4Opcode::WaitRegMem,
            0x21 => Pm4Opcode::RegRmw,
            0x2F => Pm4Opcode::LoadAluConstant,
            0x2E => Pm4Opcode::LoadBoolConstant,
            0x30 => Pm4Opcode::LoadLoopConstant,
            0x2D | 0x55 | 0x56 => Pm4Opcode::SetConstant,
            0x22 => Pm4Opcode::DrawIndx,
            0x36 => Pm4Opcode::DrawIndx2,
            0x3D => Pm4Opcode::MemWrite,
            0x46 | 0x58 | 0x59 => Pm4Opcode::EventWrite,
            0x3F | 0x37 => Pm4Opcode::IndirectBuffer,
            0x48 => Pm4Opcode::MeInit,
            0x3B => Pm4Opcode::InvalidateState,
            other => Pm4Opcode::Unknown(other),
        }
    }
}

const EVENT_CACHE_FLUSH_TS: u32 = 0x2B;

#[derive(Debug, Default, Clone, Copy)]
pub struct CommandStats {
    pub packets_processed: u64,
    pub draws: u64,
    pub frames_completed: u64,
}

pub struct CommandStream {
    memory: Arc<GuestMemory>,
    regs: Vec<u32>,
    vertex_constants: Vec<f32>,
    pixel_constants: Vec<f32>,
    bool_constants: [u32; 256],
    loop_constants: [u32; 32],
    vertex_fetch: [FetchConstant; 96],
    texture_fetch: [FetchConstant; 32],
    pub surfaces: RenderTargetSurfaceMap,
    pub bridge: ShaderPipelineBridge,
    backend: Box<dyn GpuBackend>,
    presenter: Option<PresentFn>,
    read_ptr: u32,
    processing: bool,
    in_frame: bool,
    draws_this_frame: u64,
    // Guest writes land here from the memory write-tracking callback; the
    // stream drains them before consulting the shader caches. Queued rather
    // than applied inline because the callback can fire while the stream
    // itself is writing guest memory.
    shader_dirty: Arc<Mutex<Vec<(u32, u64)>>>,
    stats: CommandStats,
    trace_draws: bool,
}

impl CommandStream {
    pub fn new(
        memory: Arc<GuestMemory>,
        backend: Box<dyn GpuBackend>,
        trace_shaders: bool,
        trace_draws: bool,
    ) -> Self {
        CommandStream {
            memory,
            regs: vec![0; REGISTER_COUNT],
            vertex_constants: vec![0.0; 256 * 4],
            pixel_constants: vec![0.0; 256 * 4],
            bool_constants: [0; 256],
            loop_constants: [0; 32],
            vertex_fetch: [FetchConstant::default(); 96],
            texture_fetch: [FetchConstant::default(); 32],
            surfaces: RenderTargetSurfaceMap::new(),
            bridge: ShaderPipelineBridge::new(trace_shaders),
            backend,
            presenter: None,
            read_ptr: 0,
            processing: false,
            in_frame: false,
            draws_this_frame: 0,
            shader_dirty: Arc::new(Mutex::new(Vec::new())),
            stats: CommandStats::default(),
            trace_draws,
        }
    }

    pub fn set_presenter(&mut self, presenter: PresentFn) {
        self.presenter = Some(presenter);
    }

    /// The queue a memory write-tracking callback should push into.
    pub fn shader_dirty_queue(&self) -> Arc<Mutex<Vec<(u32, u64)>>> {
        Arc::clone(&self.shader_dirty)
    }

    fn drain_shader_dirty(&mut self) {
        let pending: Vec<(u32, u64)> = std::mem::take(&mut *self.shader_dirty.lock().unwrap());
        for (addr, size) in pending {
            self.bridge.invalidate_written(addr, size);
        }
    }

    pub fn stats(&self) -> CommandStats {
        self.stats
    }

    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend.as_ref()
    }

    pub fn vertex_constant(&self, index: usize) -> f32 {
        self.vertex_constants.get(index).copied().unwrap_or(0.0)
    }

    pub fn pixel_constant(&self, index: usize) -> f32 {
        self.pixel_constants.get(index).copied().unwrap_or(0.0)
    }

    pub fn bool_constant(&self, index: usize) -> u32 {
        self.bool_constants.get(index).copied().unwrap_or(0)
    }

    pub fn loop_constant(&self, index: usize) -> u32 {
        self.loop_constants.get(index).copied().unwrap_or(0)
    }

    pub fn vertex_fetch(&self, index: usize) -> FetchConstant {
        self.vertex_fetch.get(index).copied().unwrap_or_default()
    }

    // ----- register file -----

    pub fn register(&self, index: u32) -> u32 {
        match index {
            CP_RB_RPTR => self.read_ptr,
            _ => self.regs.get(index as usize).copied().unwrap_or(0),
        }
    }

    /// Register write with side effects; the MMIO window and type-0 packets
    /// both land here.
    pub fn write_register(&mut self, index: u32, value: u32) {
        if let Some(slot) = self.regs.get_mut(index as usize) {
            *slot = value;
        } else {
            return;
        }
        match index {
            CP_RB_WPTR => self.process(),
            CP_RB_BASE | CP_RB_CNTL => {
                self.read_ptr = 0;
                self.regs[CP_RB_RPTR as usize] = 0;
            }
            _ => {}
        }
    }

    fn ring_size_dwords(&self) -> u32 {
        let log2_bytes = self.regs[CP_RB_CNTL as usize] & 0x3F;
        (1u32 << log2_bytes.clamp(4, 26)) / 4
    }

    // ----- ring processing -----

    /// Drain packets until the read pointer catches the write pointer.
    pub fn process(&mut self) {
        // A type-0 packet can poke the write pointer itself; the outer drain
        // loop picks the new value up, so recursion is refused.
        if self.processing {
            return;
        }
        self.processing = true;
        let ring_base = self.regs[CP_RB_BASE as usize];
        let ring_dwords = self.ring_size_dwords();
        loop {
            let write_ptr = self.regs[CP_RB_WPTR as usize] % ring_dwords;
            if self.read_ptr == write_ptr {
                break;
            }
            let addr = ring_base.wrapping_add(self.read_ptr * 4);
            let consumed = self.execute_packet(addr);
            self.read_ptr = (self.read_ptr + consumed) % ring_dwords;
            self.stats.packets_processed += 1;
        }
        self.regs[CP_RB_RPTR as usize] = self.read_ptr;
        self.processing = false;
        let rptr_writeback = self.regs[CP_RB_RPTR_ADDR as usize];
        if rptr_writeback != 0 {
            self.memory.write_u32(rptr_writeback, self.read_ptr);
        }
    }

    fn read_cmd(&self, addr: u32) -> u32 {
        self.memory.read_u32(addr)
    }

    /// Execute one packet; returns dwords consumed.
    fn execute_packet(&mut self, addr: u32) -> u32 {
        let header = self.read_cmd(addr);
        match header >> 30 {
            0 => {
                // Type 0: base register in bits 0..14, count-1 in bits 16..30.
                let base = header & 0x3FFF;
                let count = ((header >> 16) & 0x3FFF) + 1;
                for i in 0..count {
                    let value = self.read_cmd(addr.wrapping_add(4 + i * 4));
                    self.write_register(base + i, value);
                }
                1 + count
            }
            2 => 1,
            3 => {
                let opcode = Pm4Opcode::from_raw((header & 0xFF) as u8);
                let count = ((header >> 16) & 0x3FFF) + 1;
                self.execute_type3(opcode, addr.wrapping_add(4), count);
                1 + count
            }
            _ => {
                warn!("reserved packet type at {:#010x}: {:#010x}", addr, header);
                1
            }
        }
    }

    fn execute_type3(&mut self, opcode: Pm4Opcode, data: u32, count: u32) {
        match opcode {
            Pm4Opcode::Nop | Pm4Opcode::MeInit | Pm4Opcode::InvalidateState => {}
            Pm4Opcode::WaitForIdle | Pm4Opcode::WaitRegMem => {
                // Sequential consumption makes these unconditional no-ops.
            }
            Pm4Opcode::RegRmw => {
                let rmw = self.read_cmd(data);
                let and_mask = self.read_cmd(data.wrapping_add(4));
                let or_mask = self.read_cmd(data.wrapping_add(8));
                let reg = rmw & 0x1FFF;
                let old = self.register(reg);
                self.write_register(reg, (old & and_mask) | or_mask);
            }
            Pm4Opcode::DrawIndx => self.handle_draw_indx(data, count),
            Pm4Opcode::DrawIndx2 => self.handle_draw_indx_2(data),
            Pm4Opcode::LoadAluConstant => self.handle_load_alu_constant(data),
            Pm4Opcode::LoadBoolConstant => self.handle_load_bool_constant(data),
            Pm4Opcode::LoadLoopConstant => self.handle_load_loop_constant(data),
            Pm4Opcode::SetConstant => self.handle_set_constant(data, count),
            Pm4Opcode::EventWrite => self.handle_event_write(data, count),
            Pm4Opcode::MemWrite => {
                let addr = self.read_cmd(data);
                let value = self.read_cmd(data.wrapping_add(4));
                self.memory.write_u32(addr, value);
            }
            Pm4Opcode::IndirectBuffer => self.handle_indirect_buffer(data),
            Pm4Opcode::Interrupt => self.frame_complete(),
            Pm4Opcode::Unknown(op) => {
                trace!("unhandled type-3 opcode {:#04x}", op);
            }
        }
    }

    fn handle_draw_indx(&mut self, data: u32, count: u32) {
        let dw0 = self.read_cmd(data);
        let dw1 = self.read_cmd(data.wrapping_add(4));
        let mut draw = DrawCall {
            primitive: PrimitiveType::from_raw((dw1 >> 8) & 0x3F),
            index_count: dw1 & 0xFFFF,
            indexed: dw0 & 1 != 0,
            index_base: 0,
            index_format: IndexFormat::U16,
        };
        if draw.indexed && count >= 3 {
            draw.index_base = self.read_cmd(data.wrapping_add(8));
            let dw3 = self.read_cmd(data.wrapping_add(12));
            draw.index_format = if (dw3 >> 6) & 1 != 0 { IndexFormat::U32 } else { IndexFormat::U16 };
        }
        self.execute_draw(draw);
    }

    fn handle_draw_indx_2(&mut self, data: u32) {
        let dw0 = self.read_cmd(data);
        // Immediate 16-bit indices follow in the packet body.
        let draw = DrawCall {
            primitive: PrimitiveType::from_raw((dw0 >> 8) & 0x3F),
            index_count: dw0 & 0xFFFF,
            indexed: true,
            index_base: data.wrapping_add(4),
            index_format: IndexFormat::U16,
        };
        self.execute_draw(draw);
    }

    fn handle_load_alu_constant(&mut self, data: u32) {
        let dw0 = self.read_cmd(data);
        let src = self.read_cmd(data.wrapping_add(4));
        let start = dw0 & 0x1FF;
        let num = (dw0 >> 16) & 0x1FF;
        let vertex = dw0 >> 31 == 0;
        for i in 0..num * 4 {
            let raw = self.memory.read_u32(src.wrapping_add(i * 4));
            let slot = (start * 4 + i) as usize;
            let bank = if vertex { &mut self.vertex_constants } else { &mut self.pixel_constants };
            if let Some(c) = bank.get_mut(slot) {
                *c = f32::from_bits(raw);
            }
        }
    }

    fn handle_load_bool_constant(&mut self, data: u32) {
        let dw0 = self.read_cmd(data);
        let src = self.read_cmd(data.wrapping_add(4));
        let start = dw0 & 0xFF;
        let num = ((dw0 >> 16) & 0xFF) + 1;
        for i in 0..num {
            let v = self.memory.read_u32(src.wrapping_add(i * 4));
            if let Some(c) = self.bool_constants.get_mut((start + i) as usize) {
                *c = v;
            }
        }
    }

    fn handle_load_loop_constant(&mut self, data: u32) {
        let dw0 = self.read_cmd(data);
        let src = self.read_cmd(data.wrapping_add(4));
        let start = dw0 & 0x1F;
        let num = ((dw0 >> 16) & 0x1F) + 1;
        for i in 0..num {
            let v = self.memory.read_u32(src.wrapping_add(i * 4));
            if let Some(c) = self.loop_constants.get_mut((start + i) as usize) {
                *c = v;
            }
        }
    }

    // Inline constants: 0x000-0x0FF vertex, 0x100-0x1FF pixel, 0x200-0x2FF
    // fetch constants.
    fn handle_set_constant(&mut self, data: u32, count: u32) {
        let dw0 = self.read_cmd(data);
        let offset = dw0 & 0xFFFF;
        for i in 1..count {
            let value = self.read_cmd(data.wrapping_add(i * 4));
            let reg = offset + (i - 1);
            if reg < 0x100 {
                self.vertex_constants[(reg * 4) as usize] = f32::from_bits(value);
            } else if reg < 0x200 {
                self.pixel_constants[((reg - 0x100) * 4) as usize] = f32::from_bits(value);
            } else if reg < 0x300 {
                let fetch_idx = ((reg - 0x200) / 6) as usize;
                let fetch_word = ((reg - 0x200) % 6) as usize;
                if fetch_idx < self.vertex_fetch.len() {
                    self.vertex_fetch[fetch_idx].data[fetch_word] = value;
                }
            }
        }
    }

    fn handle_event_write(&mut self, data: u32, count: u32) {
        let dw0 = self.read_cmd(data);
        let event = dw0 & 0xFF;
        if event == EVENT_CACHE_FLUSH_TS && count >= 3 {
            let addr = self.read_cmd(data.wrapping_add(4));
            let timestamp = self.read_cmd(data.wrapping_add(8));
            self.memory.write_u32(addr, timestamp);
        }
    }

    fn handle_indirect_buffer(&mut self, data: u32) {
        let ib_addr = self.read_cmd(data);
        let ib_size = self.read_cmd(data.wrapping_add(4)) & 0xFFFFF;
        let mut cursor = 0u32;
        while cursor < ib_size {
            let consumed = self.execute_packet(ib_addr.wrapping_add(cursor * 4));
            cursor += consumed;
        }
    }

    // ----- draw and resolve assembly -----

    fn color_attachment(&self, index: usize) -> RenderTargetConfig {
        let info_reg = match index {
            0 => RB_COLOR_INFO,
            1 => RB_COLOR1_INFO,
            2 => RB_COLOR2_INFO,
            _ => RB_COLOR3_INFO,
        };
        let info = self.register(info_reg);
        let surface = self.register(RB_SURFACE_INFO);
        let pitch_px = (surface & 0x3FFF).max(80);
        let (width, height) = self.draw_dimensions();
        RenderTargetConfig {
            enabled: index == 0 || info != 0,
            edram_base: info & 0xFFF,
            edram_pitch: pitch_px / super::edram::TILE_WIDTH,
            format: SurfaceFormat::from_color_info(info),
            msaa: MsaaMode::from_raw((surface >> 16) & 3),
            width,
            height,
        }
    }

    fn depth_attachment(&self) -> RenderTargetConfig {
        let info = self.register(RB_DEPTH_INFO);
        let surface = self.register(RB_SURFACE_INFO);
        let pitch_px = (surface & 0x3FFF).max(80);
        let (width, height) = self.draw_dimensions();
        RenderTargetConfig {
            enabled: info != 0,
            edram_base: info & 0xFFF,
            edram_pitch: pitch_px / super::edram::TILE_WIDTH,
            format: SurfaceFormat::from_depth_info(info),
            msaa: MsaaMode::from_raw((surface >> 16) & 3),
            width,
            height,
        }
    }

    fn draw_dimensions(&self) -> (u32, u32) {
        let br = self.register(PA_SC_SCREEN_SCISSOR_BR);
        let width = br & 0x7FFF;
        let height = (br >> 16) & 0x7FFF;
        if width == 0 || height == 0 {
            (1280, 720)
        } else {
            (width, height)
        }
    }

    fn execute_draw(&mut self, draw: DrawCall) {
        let mode = self.register(RB_MODECONTROL) & 0x7;
        if mode == 5 {
            self.execute_resolve();
            return;
        }
        self.drain_shader_dirty();
        if !self.in_frame {
            self.backend.begin_frame();
            self.in_frame = true;
        }

        let attachments = [
            self.color_attachment(0),
            self.color_attachment(1),
            self.color_attachment(2),
            self.color_attachment(3),
            self.depth_attachment(),
        ];
        let (width, height) = self.draw_dimensions();
        let fb_key = self.surfaces.framebuffer_key(&attachments, width, height);
        self.backend.bind_framebuffer(fb_key, &attachments);

        let vs_addr = self.register(SQ_VS_PROGRAM);
        let ps_addr = self.register(SQ_PS_PROGRAM);
        let vs_size = self.register(SQ_VS_PROGRAM_SIZE);
        let ps_size = self.register(SQ_PS_PROGRAM_SIZE);
        let vs = self
            .bridge
            .load_shader(&self.memory, ShaderKind::Vertex, vs_addr, if vs_size == 0 { 128 } else { vs_size });
        let ps = self
            .bridge
            .load_shader(&self.memory, ShaderKind::Pixel, ps_addr, if ps_size == 0 { 128 } else { ps_size });

        let su_mode = self.register(PA_SU_SC_MODE_CNTL);
        let depth = self.register(RB_DEPTHCONTROL);
        let blend = self.register(RB_BLENDCONTROL);
        let key = PipelineKey {
            topology: draw.primitive as u8,
            cull_mode: (su_mode & 3) as u8,
            front_face_cw: (su_mode >> 2) & 1 != 0,
            depth_test: (depth >> 1) & 1 != 0,
            depth_write: (depth >> 2) & 1 != 0,
            depth_func: ((depth >> 4) & 7) as u8,
            blend_enable: blend >> 31 != 0,
            src_blend: (blend & 0x1F) as u8,
            dst_blend: ((blend >> 8) & 0x1F) as u8,
            blend_op: ((blend >> 16) & 0x7) as u8,
            vertex_shader: vs,
            pixel_shader: ps,
        };
        self.bridge.pipeline(key);
        self.backend.bind_pipeline(&key, vs, ps);
        self.backend.set_vertex_constants(&self.vertex_constants);
        self.backend.set_pixel_constants(&self.pixel_constants);
        self.backend.set_textures(&self.texture_fetch);
        self.backend.draw_indexed(&draw);
        self.draws_this_frame += 1;
        self.stats.draws += 1;
        if self.trace_draws {
            debug!(
                "draw {:?} x{} (indexed: {})",
                draw.primitive, draw.index_count, draw.indexed
            );
        }
    }

    // Copy mode: dump the selected attachment to guest memory, then close
    // the frame. A resolve delimits a frame just like an interrupt.
    fn execute_resolve(&mut self) {
        let control = self.register(RB_COPY_CONTROL);
        let dest = self.register(RB_COPY_DEST_BASE);
        let pitch = self.register(RB_COPY_DEST_PITCH);
        let attachment = if control & 4 != 0 {
            self.depth_attachment()
        } else {
            self.color_attachment((control & 3) as usize)
        };
        self.surfaces.resolve(&self.memory, &attachment, dest, pitch);
        self.backend.resolve(&attachment, dest, pitch);
        self.frame_complete();
    }

    fn frame_complete(&mut self) {
        if self.in_frame {
            self.backend.end_frame();
        } else {
            // Frames delimited without any draw still present.
            self.backend.begin_frame();
            self.backend.end_frame();
        }
        trace!(
            "frame {} complete ({} draws)",
            self.stats.frames_completed,
            self.draws_this_frame
        );
        self.in_frame = false;
        self.draws_this_frame = 0;
        self.stats.frames_completed += 1;
        if let Some(presenter) = &self.presenter {
            presenter();
        }
    }
}
