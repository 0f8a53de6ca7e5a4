// The device-backend seam. A real renderer sits behind this trait; the
// command stream only ever talks through it. NullBackend records the calls
// so the front end can be exercised headless.

use super::edram::{RenderTargetConfig, SurfaceFormat};
use super::shaders::{PipelineKey, ShaderHash};
use std::sync::Mutex;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrimitiveType {
    None,
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleFan,
    TriangleStrip,
    RectangleList,
    QuadList,
}

impl PrimitiveType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => PrimitiveType::PointList,
            2 => PrimitiveType::LineList,
            3 => PrimitiveType::LineStrip,
            4 => PrimitiveType::TriangleList,
            5 => PrimitiveType::TriangleFan,
            6 => PrimitiveType::TriangleStrip,
            8 => PrimitiveType::RectangleList,
            13 => PrimitiveType::QuadList,
            _ => PrimitiveType::None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

/// One vertex-buffer or texture fetch constant (six dwords in the register
/// file).
#[derive(Debug, Copy, Clone, Default)]
pub struct FetchConstant {
    pub data: [u32; 6],
}

#[derive(Debug, Clone)]
pub struct DrawCall {
    pub primitive: PrimitiveType,
    pub index_count: u32,
    pub indexed: bool,
    pub index_base: u32,
    pub index_format: IndexFormat,
}

pub trait GpuBackend: Send {
    fn begin_frame(&mut self);
    fn bind_framebuffer(&mut self, cache_key: u64, attachments: &[RenderTargetConfig]);
    fn bind_pipeline(&mut self, key: &PipelineKey, vs: ShaderHash, ps: ShaderHash);
    fn set_vertex_constants(&mut self, constants: &[f32]);
    fn set_pixel_constants(&mut self, constants: &[f32]);
    fn set_textures(&mut self, fetches: &[FetchConstant]);
    fn draw_indexed(&mut self, draw: &DrawCall);
    fn resolve(&mut self, attachment: &RenderTargetConfig, dest: u32, pitch: u32);
    fn end_frame(&mut self);
}

/// Presenter hook invoked when the command stream completes a frame.
pub type PresentFn = Box<dyn Fn() + Send + Sync>;

/// Records everything it is asked to do.
#[derive(Default)]
pub struct NullBackend {
    pub draws: Mutex<Vec<DrawCall>>,
    pub frames: Mutex<u32>,
    pub resolves: Mutex<Vec<(u32, u32, SurfaceFormat)>>,
    pub bound_pipelines: Mutex<Vec<(ShaderHash, ShaderHash)>>,
}

impl NullBackend {
    pub fn new() -> Self {
        NullBackend::default()
    }

    pub fn draw_count(&self) -> usize {
        self.draws.lock().unwrap().len()
    }

    pub fn frame_count(&self) -> u32 {
        *self.frames.lock().unwrap()
    }
}

impl GpuBackend for NullBackend {
    fn begin_frame(&mut self) {}

    fn bind_framebuffer(&mut self, _cache_key: u64, _attachments: &[RenderTargetConfig]) {}

    fn bind_pipeline(&mut self, _key: &PipelineKey, vs: ShaderHash, ps: ShaderHash) {
        self.bound_pipelines.lock().unwrap().push((vs, ps));
    }

    fn set_vertex_constants(&mut self, _constants: &[f32]) {}

    fn set_pixel_constants(&mut self, _constants: &[f32]) {}

    fn set_textures(&mut self, _fetches: &[FetchConstant]) {}

    fn draw_indexed(&mut self, draw: &DrawCall) {
        self.draws.lock().unwrap().push(draw.clone());
    }

    fn resolve(&mut self, attachment: &RenderTargetConfig, dest: u32, _pitch: u32) {
        self.resolves.lock().unwrap().push((dest, attachment.edram_base, attachment.format));
    }

    fn end_frame(&mut self) {
        *self.frames.lock().unwrap() += 1;
    }
}
