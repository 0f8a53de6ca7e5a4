// Shader and pipeline caching. Microcode is hashed where it sits in guest
// memory; translation itself happens behind the device backend, this bridge
// owns the caches and drops entries when the guest writes over loaded
// microcode.

use crate::memory::GuestMemory;
use log::{debug, trace};
use std::collections::HashMap;

pub type ShaderHash = u64;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Vertex,
    Pixel,
}

/// A translated shader module as the backend knows it.
#[derive(Debug, Clone)]
pub struct ShaderModule {
    pub kind: ShaderKind,
    pub hash: ShaderHash,
    pub guest_addr: u32,
    pub dword_count: u32,
}

/// Everything that selects a device pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub topology: u8,
    pub cull_mode: u8,
    pub front_face_cw: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: u8,
    pub blend_enable: bool,
    pub src_blend: u8,
    pub dst_blend: u8,
    pub blend_op: u8,
    pub vertex_shader: ShaderHash,
    pub pixel_shader: ShaderHash,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeStats {
    pub shaders_translated: u64,
    pub shader_hits: u64,
    pub pipelines_created: u64,
    pub pipeline_hits: u64,
    pub invalidations: u64,
}

pub struct ShaderPipelineBridge {
    shaders: HashMap<ShaderHash, ShaderModule>,
    // Guest ranges holding microcode we translated, for write invalidation.
    loaded_ranges: Vec<(u32, u32, ShaderHash)>,
    pipelines: HashMap<PipelineKey, u32>,
    next_pipeline_id: u32,
    stats: BridgeStats,
    trace_shaders: bool,
}

/// FNV-1a over the microcode dword stream.
pub fn hash_microcode(mem: &GuestMemory, addr: u32, dword_count: u32) -> ShaderHash {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for i in 0..dword_count {
        let w = mem.read_u32(addr.wrapping_add(i * 4));
        for b in w.to_be_bytes().iter() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x0000_0100_0000_01B3);
        }
    }
    h
}

impl ShaderPipelineBridge {
    pub fn new(trace_shaders: bool) -> Self {
        ShaderPipelineBridge {
            shaders: HashMap::new(),
            loaded_ranges: Vec::new(),
            pipelines: HashMap::new(),
            next_pipeline_id: 1,
            stats: BridgeStats::default(),
            trace_shaders,
        }
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Hash the microcode at `addr` and return the cached module, creating
    /// it on first sight.
    pub fn load_shader(
        &mut self,
        mem: &GuestMemory,
        kind: ShaderKind,
        addr: u32,
        dword_count: u32,
    ) -> ShaderHash {
        let dword_count = dword_count.max(1).min(0x4000);
        let hash = hash_microcode(mem, addr, dword_count);
        if self.shaders.contains_key(&hash) {
            self.stats.shader_hits += 1;
            return hash;
        }
        self.shaders.insert(
            hash,
            ShaderModule { kind, hash, guest_addr: addr, dword_count },
        );
        self.loaded_ranges.push((addr, dword_count * 4, hash));
        self.stats.shaders_translated += 1;
        if self.trace_shaders {
            debug!(
                "{:?} shader translated from {:#010x} ({} dwords, hash {:#018x})",
                kind, addr, dword_count, hash
            );
        }
        hash
    }

    pub fn shader(&self, hash: ShaderHash) -> Option<&ShaderModule> {
        self.shaders.get(&hash)
    }

    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    /// Pipeline id for a state key, allocating on first use.
    pub fn pipeline(&mut self, key: PipelineKey) -> u32 {
        match self.pipelines.get(&key) {
            Some(&id) => {
                self.stats.pipeline_hits += 1;
                id
            }
            None => {
                let id = self.next_pipeline_id;
                self.next_pipeline_id += 1;
                self.pipelines.insert(key, id);
                self.stats.pipelines_created += 1;
                trace!("pipeline {} created", id);
                id
            }
        }
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// A guest write landed; drop any shader whose microcode it touched and
    /// the pipelines referring to it.
    pub fn invalidate_written(&mut self, addr: u32, size: u64) {
        let mut dropped = Vec::new();
        self.loaded_ranges.retain(|&(base, len, hash)| {
            let hit = (addr as u64) < base as u64 + len as u64 && (base as u64) < addr as u64 + size;
            if hit {
                dropped.push(hash);
            }
            !hit
        });
        for hash in dropped {
            self.shaders.remove(&hash);
            self.pipelines
                .retain(|key, _| key.vertex_shader != hash && key.pixel_shader != hash);
            self.stats.invalidations += 1;
            debug!("shader {:#018x} invalidated by guest write", hash);
        }
    }
}
