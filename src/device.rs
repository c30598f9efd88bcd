//! The kernel-over-grid abstraction shared by the GPU and CPU backends.
//!
//! A backend owns every field's storage and hands out [`FieldId`]s. One
//! [`KernelPass`] reads up to two input fields and writes every cell of a
//! single output field; nothing else about the graphics API leaks into the
//! solver.

use anyhow::Result;
use bytemuck::{Pod, Zeroable};

use crate::formats::{FormatProbe, TexelFormat};

/// Opaque handle to a device-resident field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Everything needed to allocate a field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TexelFormat,
    /// Channels the solver reads and writes, at most `format.channels()`.
    pub channels: u32,
    pub filter: FilterMode,
}

impl FieldDesc {
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// The fixed set of full-grid kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// `[target] -> target`: radial impulse added to the input.
    Splat,
    /// `[velocity] -> curl`
    Curl,
    /// `[velocity, curl] -> velocity`
    Vorticity,
    /// `[velocity] -> divergence`
    Divergence,
    /// `[pressure] -> pressure`, scaled by `PassParams::value`.
    Clear,
    /// `[pressure, divergence] -> pressure`, one Jacobi round.
    Pressure,
    /// `[pressure, velocity] -> velocity`
    GradientSubtract,
    /// `[velocity, source] -> source`
    Advection,
}

impl Kernel {
    pub const ALL: [Kernel; 8] = [
        Kernel::Splat,
        Kernel::Curl,
        Kernel::Vorticity,
        Kernel::Divergence,
        Kernel::Clear,
        Kernel::Pressure,
        Kernel::GradientSubtract,
        Kernel::Advection,
    ];

    /// Fragment entry point in `shaders/fluid.wgsl`.
    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::Splat => "fs_splat",
            Kernel::Curl => "fs_curl",
            Kernel::Vorticity => "fs_vorticity",
            Kernel::Divergence => "fs_divergence",
            Kernel::Clear => "fs_clear",
            Kernel::Pressure => "fs_pressure",
            Kernel::GradientSubtract => "fs_gradient_subtract",
            Kernel::Advection => "fs_advection",
        }
    }

    pub fn input_count(self) -> usize {
        match self {
            Kernel::Splat | Kernel::Curl | Kernel::Divergence | Kernel::Clear => 1,
            Kernel::Vorticity | Kernel::Pressure | Kernel::GradientSubtract | Kernel::Advection => 2,
        }
    }
}

/// Uniform block shared by every kernel. Layout matches `PassParams` in
/// `shaders/fluid.wgsl` (std140-compatible, 64 bytes).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct PassParams {
    /// Texel size of the simulation grid (velocity back-trace, stencils).
    pub texel_size: [f32; 2],
    /// Texel size of the sampled source field (advection input).
    pub source_texel_size: [f32; 2],
    /// Splat payload.
    pub color: [f32; 4],
    /// Splat centre in normalized coordinates.
    pub point: [f32; 2],
    pub dt: f32,
    pub dissipation: f32,
    /// Curl strength for vorticity, scale for clear.
    pub value: f32,
    pub radius: f32,
    pub aspect_ratio: f32,
    pub _pad: f32,
}

impl Default for PassParams {
    fn default() -> Self {
        Self {
            texel_size: [0.0; 2],
            source_texel_size: [0.0; 2],
            color: [0.0; 4],
            point: [0.0; 2],
            dt: 0.0,
            dissipation: 1.0,
            value: 0.0,
            radius: 0.0,
            aspect_ratio: 1.0,
            _pad: 0.0,
        }
    }
}

/// One full-grid pass: every cell of `output` is written from `inputs`.
#[derive(Debug, Clone)]
pub struct KernelPass<'a> {
    pub kernel: Kernel,
    pub inputs: &'a [FieldId],
    pub output: FieldId,
    pub params: PassParams,
}

/// Field contents read back to the CPU, always widened to four channels.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldData {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<[f32; 4]>,
}

impl FieldData {
    pub fn zeroed(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            texels: vec![[0.0; 4]; width as usize * height as usize],
        }
    }

    pub fn at(&self, x: u32, y: u32) -> [f32; 4] {
        self.texels[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, texel: [f32; 4]) {
        self.texels[(y * self.width + x) as usize] = texel;
    }

    /// Largest absolute component over the whole field.
    pub fn max_abs(&self) -> f32 {
        self.texels
            .iter()
            .flat_map(|t| t.iter())
            .fold(0.0f32, |acc, v| acc.max(v.abs()))
    }
}

/// A device able to hold 2D fields and run full-grid kernels over them.
pub trait GridDevice: FormatProbe {
    /// Allocates a zero-filled field. Failure here is fatal to the solver.
    fn create_field(&mut self, desc: &FieldDesc) -> Result<FieldId>;

    /// Frees the field's storage. Unknown ids are ignored.
    fn release_field(&mut self, id: FieldId);

    fn field_desc(&self, id: FieldId) -> Option<&FieldDesc>;

    /// Records or executes one pass. Passes run in submission order.
    fn run(&mut self, pass: &KernelPass<'_>);

    /// Pushes any recorded passes to the device.
    fn flush(&mut self);

    fn read_field(&mut self, id: FieldId) -> Result<FieldData>;

    fn write_field(&mut self, id: FieldId, data: &FieldData) -> Result<()>;
}
