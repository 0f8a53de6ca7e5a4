// Xenos register file indices. The guest programs these through the GPU
// MMIO window (one dword per register) and through type-0 packets.

pub const REGISTER_COUNT: usize = 0x10000;

// Command processor / ring buffer
pub const CP_RB_BASE: u32 = 0x0700;
pub const CP_RB_CNTL: u32 = 0x0701;
pub const CP_RB_RPTR_ADDR: u32 = 0x070C;
pub const CP_RB_RPTR: u32 = 0x070D;
pub const CP_RB_WPTR: u32 = 0x070E;

// Render backend
pub const RB_MODECONTROL: u32 = 0x2210;
pub const RB_SURFACE_INFO: u32 = 0x2211;
pub const RB_COLORCONTROL: u32 = 0x2212;
pub const RB_COLOR_INFO: u32 = 0x2213;
pub const RB_DEPTH_INFO: u32 = 0x2214;
pub const RB_COLOR1_INFO: u32 = 0x2215;
pub const RB_COLOR2_INFO: u32 = 0x2216;
pub const RB_COLOR3_INFO: u32 = 0x2217;
pub const RB_BLENDCONTROL: u32 = 0x2218;
pub const RB_DEPTHCONTROL: u32 = 0x2219;
pub const RB_COPY_CONTROL: u32 = 0x2318;
pub const RB_COPY_DEST_BASE: u32 = 0x2319;
pub const RB_COPY_DEST_PITCH: u32 = 0x231A;

// Shader sequencer
pub const SQ_PROGRAM_CNTL: u32 = 0x2280;
pub const SQ_VS_PROGRAM: u32 = 0x2200;
pub const SQ_PS_PROGRAM: u32 = 0x2201;
pub const SQ_VS_PROGRAM_SIZE: u32 = 0x2202;
pub const SQ_PS_PROGRAM_SIZE: u32 = 0x2203;

// Primitive assembly / viewport
pub const PA_SU_SC_MODE_CNTL: u32 = 0x2205;
pub const PA_CL_VPORT_XSCALE: u32 = 0x2100;
pub const PA_CL_VPORT_XOFFSET: u32 = 0x2101;
pub const PA_CL_VPORT_YSCALE: u32 = 0x2102;
pub const PA_CL_VPORT_YOFFSET: u32 = 0x2103;
pub const PA_CL_VPORT_ZSCALE: u32 = 0x2104;
pub const PA_CL_VPORT_ZOFFSET: u32 = 0x2105;
pub const PA_SC_SCREEN_SCISSOR_TL: u32 = 0x2080;
pub const PA_SC_SCREEN_SCISSOR_BR: u32 = 0x2081;

// Fetch constants (vertex buffers and textures, six dwords each)
pub const FETCH_CONST_BASE: u32 = 0x4800;
