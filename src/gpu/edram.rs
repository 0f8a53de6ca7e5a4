// Embedded DRAM model: 10 MB of tile-addressed render-target storage. Tiles
// are 80x16 pixels; render targets name a tile offset and a pitch in tiles.
// Resolve converts the tiled layout to linear rows at a guest address.

use crate::memory::GuestMemory;
use log::trace;
use std::collections::HashMap;

pub const EDRAM_SIZE: usize = 10 * 1024 * 1024;
pub const TILE_WIDTH: u32 = 80;
pub const TILE_HEIGHT: u32 = 16;
pub const TILE_PIXELS: u32 = TILE_WIDTH * TILE_HEIGHT;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SurfaceFormat {
    Fmt8,
    Fmt565,
    Fmt1555,
    Fmt8888,
    Fmt2101010,
    Fmt16_16,
    Fmt16_16_16_16,
    Fmt16Float,
    Fmt32Float,
    FmtD24S8,
    FmtD24FS8,
}

impl SurfaceFormat {
    pub fn from_color_info(raw: u32) -> Self {
        match (raw >> 16) & 0xF {
            0 => SurfaceFormat::Fmt8,
            1 => SurfaceFormat::Fmt1555,
            2 => SurfaceFormat::Fmt565,
            4 => SurfaceFormat::Fmt8888,
            5 => SurfaceFormat::Fmt2101010,
            6 => SurfaceFormat::Fmt16_16,
            7 => SurfaceFormat::Fmt16_16_16_16,
            8 => SurfaceFormat::Fmt16Float,
            9 => SurfaceFormat::Fmt32Float,
            _ => SurfaceFormat::Fmt8888,
        }
    }

    pub fn from_depth_info(raw: u32) -> Self {
        if (raw >> 16) & 1 != 0 {
            SurfaceFormat::FmtD24FS8
        } else {
            SurfaceFormat::FmtD24S8
        }
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            SurfaceFormat::Fmt8 => 1,
            SurfaceFormat::Fmt565 | SurfaceFormat::Fmt1555 | SurfaceFormat::Fmt16Float => 2,
            SurfaceFormat::Fmt8888
            | SurfaceFormat::Fmt2101010
            | SurfaceFormat::Fmt16_16
            | SurfaceFormat::Fmt32Float
            | SurfaceFormat::FmtD24S8
            | SurfaceFormat::FmtD24FS8 => 4,
            SurfaceFormat::Fmt16_16_16_16 => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsaaMode {
    X1,
    X2,
    X4,
}

impl MsaaMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw & 3 {
            1 => MsaaMode::X2,
            2 => MsaaMode::X4,
            _ => MsaaMode::X1,
        }
    }
}

/// One bound color or depth attachment.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RenderTargetConfig {
    pub enabled: bool,
    pub edram_base: u32,
    pub edram_pitch: u32,
    pub format: SurfaceFormat,
    pub msaa: MsaaMode,
    pub width: u32,
    pub height: u32,
}

impl Default for RenderTargetConfig {
    fn default() -> Self {
        RenderTargetConfig {
            enabled: false,
            edram_base: 0,
            edram_pitch: 0,
            format: SurfaceFormat::Fmt8888,
            msaa: MsaaMode::X1,
            width: 1280,
            height: 720,
        }
    }
}

// Framebuffers are cached by the attachments' content hash and dimensions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct FramebufferKey {
    attachments: u64,
    width: u32,
    height: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SurfaceStats {
    pub framebuffers_created: u64,
    pub framebuffer_hits: u64,
    pub resolves: u64,
}

/// Tile-layout bookkeeping plus the host model of eDRAM contents.
pub struct RenderTargetSurfaceMap {
    edram: Vec<u8>,
    framebuffers: HashMap<FramebufferKey, u32>,
    next_framebuffer_id: u32,
    stats: SurfaceStats,
}

fn hash_attachment(h: &mut u64, rt: &RenderTargetConfig) {
    let mut mix = |v: u64| {
        *h ^= v;
        *h = h.wrapping_mul(0x0000_0100_0000_01B3);
    };
    mix(rt.enabled as u64);
    mix(rt.edram_base as u64);
    mix(rt.edram_pitch as u64);
    mix(rt.format.bytes_per_pixel() as u64 | (rt.format as u64) << 8);
    mix(rt.msaa as u64);
    mix(((rt.width as u64) << 32) | rt.height as u64);
}

impl RenderTargetSurfaceMap {
    pub fn new() -> Self {
        RenderTargetSurfaceMap {
            edram: vec![0; EDRAM_SIZE],
            framebuffers: HashMap::new(),
            next_framebuffer_id: 1,
            stats: SurfaceStats::default(),
        }
    }

    pub fn stats(&self) -> SurfaceStats {
        self.stats
    }

    /// Stable id for the framebuffer formed by these attachments, creating a
    /// cache entry the first time the combination is seen.
    pub fn framebuffer_key(&mut self, attachments: &[RenderTargetConfig], width: u32, height: u32) -> u64 {
        let mut h = 0xcbf2_9ce4_8422_2325u64;
        for rt in attachments {
            hash_attachment(&mut h, rt);
        }
        let key = FramebufferKey { attachments: h, width, height };
        match self.framebuffers.get(&key) {
            Some(_) => self.stats.framebuffer_hits += 1,
            None => {
                let id = self.next_framebuffer_id;
                self.next_framebuffer_id += 1;
                self.framebuffers.insert(key, id);
                self.stats.framebuffers_created += 1;
                trace!("framebuffer {} created ({}x{})", id, width, height);
            }
        }
        h
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    /// Byte offset of a pixel inside the tiled eDRAM layout.
    fn pixel_offset(rt: &RenderTargetConfig, x: u32, y: u32) -> usize {
        let bpp = rt.format.bytes_per_pixel();
        let tile_x = x / TILE_WIDTH;
        let tile_y = y / TILE_HEIGHT;
        let tile_index = rt.edram_base + tile_y * rt.edram_pitch.max(1) + tile_x;
        let in_tile = (y % TILE_HEIGHT) * TILE_WIDTH + (x % TILE_WIDTH);
        (tile_index as usize * TILE_PIXELS as usize + in_tile as usize) * bpp as usize
    }

    /// Backend write-back into the eDRAM model (one linear row of pixels).
    pub fn write_row(&mut self, rt: &RenderTargetConfig, y: u32, row: &[u8]) {
        let bpp = rt.format.bytes_per_pixel() as usize;
        for x in 0..(row.len() / bpp) as u32 {
            let off = Self::pixel_offset(rt, x, y);
            if off + bpp <= self.edram.len() {
                self.edram[off..off + bpp]
                    .copy_from_slice(&row[x as usize * bpp..x as usize * bpp + bpp]);
            }
        }
    }

    pub fn read_pixel(&self, rt: &RenderTargetConfig, x: u32, y: u32) -> u32 {
        let bpp = rt.format.bytes_per_pixel() as usize;
        let off = Self::pixel_offset(rt, x, y);
        if off + bpp > self.edram.len() {
            return 0;
        }
        let mut v = 0u32;
        for i in 0..bpp {
            v |= (self.edram[off + i] as u32) << (8 * i);
        }
        v
    }

    /// Convert the tiled attachment contents to linear rows at `dest`.
    pub fn resolve(
        &mut self,
        mem: &GuestMemory,
        rt: &RenderTargetConfig,
        dest: u32,
        dest_pitch: u32,
    ) {
        let bpp = rt.format.bytes_per_pixel();
        let row_bytes = rt.width * bpp;
        let pitch = if dest_pitch == 0 { row_bytes } else { dest_pitch };
        let mut row = vec![0u8; row_bytes as usize];
        for y in 0..rt.height {
            for x in 0..rt.width {
                let off = Self::pixel_offset(rt, x, y);
                let dst = (x * bpp) as usize;
                if off + bpp as usize <= self.edram.len() {
                    row[dst..dst + bpp as usize]
                        .copy_from_slice(&self.edram[off..off + bpp as usize]);
                }
            }
            mem.write_bytes(dest.wrapping_add(y * pitch), &row);
        }
        self.stats.resolves += 1;
        trace!(
            "resolved {}x{} tiles@{} to {:#010x}",
            rt.width,
            rt.height,
            rt.edram_base,
            dest
        );
    }

    pub fn clear(&mut self) {
        self.edram.iter_mut().for_each(|b| *b = 0);
        self.framebuffers.clear();
    }
}

impl Default for RenderTargetSurfaceMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn rt() -> RenderTargetConfig {
        RenderTargetConfig {
            enabled: true,
            edram_base: 0,
            edram_pitch: 2,
            format: SurfaceFormat::Fmt8888,
            msaa: MsaaMode::X1,
            width: 160,
            height: 32,
        }
    }

    #[test]
    fn framebuffer_cache_hits_on_same_attachments() {
        let mut map = RenderTargetSurfaceMap::new();
        let rts = [rt()];
        let a = map.framebuffer_key(&rts, 160, 32);
        let b = map.framebuffer_key(&rts, 160, 32);
        assert_eq!(a, b);
        assert_eq!(map.framebuffer_count(), 1);
        assert_eq!(map.stats().framebuffer_hits, 1);

        let mut other = rt();
        other.edram_base = 4;
        map.framebuffer_key(&[other], 160, 32);
        assert_eq!(map.framebuffer_count(), 2);
    }

    #[test]
    fn tiled_offsets_respect_pitch() {
        let cfg = rt();
        // Pixel (80, 0) starts the second tile in the row.
        let first = RenderTargetSurfaceMap::pixel_offset(&cfg, 0, 0);
        let second_tile = RenderTargetSurfaceMap::pixel_offset(&cfg, 80, 0);
        assert_eq!(first, 0);
        assert_eq!(second_tile, TILE_PIXELS as usize * 4);
        // Pixel (0, 16) starts the second tile row: base + pitch tiles.
        let second_row = RenderTargetSurfaceMap::pixel_offset(&cfg, 0, 16);
        assert_eq!(second_row, 2 * TILE_PIXELS as usize * 4);
    }

    #[test]
    fn resolve_linearizes_rows() {
        let mem = Arc::new(GuestMemory::new().unwrap());
        let mut map = RenderTargetSurfaceMap::new();
        let cfg = RenderTargetConfig { width: 160, height: 2, ..rt() };
        // Distinct pixel values across the tile boundary at x=80.
        let mut row = vec![0u8; 160 * 4];
        for x in 0..160u32 {
            row[x as usize * 4..x as usize * 4 + 4].copy_from_slice(&x.to_le_bytes());
        }
        map.write_row(&cfg, 0, &row);
        map.resolve(&mem, &cfg, 0x0050_0000, 0);
        let mut back = vec![0u8; 160 * 4];
        mem.read_bytes(0x0050_0000, &mut back);
        assert_eq!(back, row);
    }
}
