// ascii-fluid - grid fluid solver behind a pointer-reactive ASCII visual
// Licensed under MIT License

//! Stable-fluids style solver running as a sequence of full-grid passes.
//!
//! Fields live on a [`GridDevice`]: [`GpuDevice`] renders every pass into
//! textures with wgpu, [`CpuDevice`] evaluates the same kernels on the CPU
//! and serves as the reference implementation.

pub mod config;
pub mod cpu;
pub mod device;
pub mod formats;
pub mod gpu;
pub mod grid;
pub mod pipeline;
pub mod splat;

pub use config::FluidConfig;
pub use cpu::CpuDevice;
pub use device::{FieldData, FieldDesc, FieldId, FilterMode, GridDevice, Kernel, KernelPass, PassParams};
pub use formats::{DeviceCaps, DeviceTier, FormatChoice, SupportedFormats, TexelFormat};
pub use gpu::GpuDevice;
pub use grid::{DoubleBuffer, FieldBuffers, FieldKind, SurfaceSize};
pub use pipeline::{FluidSolver, Stage, SIM_DT};
pub use splat::{PointerMotion, PointerTracker, SplatQueue, SplatRequest};
