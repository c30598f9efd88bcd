//! Per-frame stage sequence and the solver that owns the simulation state.

use anyhow::{Context, Result};

use crate::config::FluidConfig;
use crate::device::{FieldData, FieldId, GridDevice, Kernel, KernelPass, PassParams};
use crate::formats::{negotiate, SupportedFormats};
use crate::grid::{grid_size, FieldBuffers, FieldKind, SurfaceSize};
use crate::splat::{DrainedSplats, PointerMotion, SplatQueue, SplatRequest};

/// Fixed advection and vorticity sub-step.
pub const SIM_DT: f32 = 0.016;

/// One entry of the frame plan: `kernel(inputs) -> output`. Inputs always
/// name the committed side of a field; writes into a double-buffered field
/// are committed right after the pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub kernel: Kernel,
    pub inputs: Vec<FieldKind>,
    pub output: FieldKind,
    pub params: PassParams,
}

impl Stage {
    fn new(kernel: Kernel, inputs: &[FieldKind], output: FieldKind, params: PassParams) -> Self {
        Self {
            kernel,
            inputs: inputs.to_vec(),
            output,
            params,
        }
    }
}

fn texel(size: (u32, u32)) -> [f32; 2] {
    [1.0 / size.0 as f32, 1.0 / size.1 as f32]
}

fn splat_stage(target: FieldKind, size: (u32, u32), request: &SplatRequest, color: [f32; 4], radius: f32) -> Stage {
    Stage::new(
        Kernel::Splat,
        &[target],
        target,
        PassParams {
            texel_size: texel(size),
            source_texel_size: texel(size),
            color,
            point: request.position,
            radius,
            aspect_ratio: size.0 as f32 / size.1 as f32,
            ..PassParams::default()
        },
    )
}

/// Builds the full pass list for one frame: every pending splat (velocity
/// then dye, in arrival order) followed by the physical stages.
pub fn frame_stages(
    config: &FluidConfig,
    sim_size: (u32, u32),
    dye_size: (u32, u32),
    splats: &DrainedSplats,
) -> Vec<Stage> {
    use FieldKind::*;

    let sim_texel = texel(sim_size);
    let dye_texel = texel(dye_size);
    let sim = PassParams {
        texel_size: sim_texel,
        source_texel_size: sim_texel,
        ..PassParams::default()
    };

    let mut stages = Vec::with_capacity(splats.requests.len() * 2 + 8 + config.iterations as usize);

    for request in &splats.requests {
        stages.push(splat_stage(
            Velocity,
            sim_size,
            request,
            request.velocity_payload(),
            config.radius,
        ));
        stages.push(splat_stage(
            Dye,
            dye_size,
            request,
            request.dye_payload(splats.activity),
            config.radius,
        ));
    }

    stages.push(Stage::new(Kernel::Curl, &[Velocity], Curl, sim));
    stages.push(Stage::new(
        Kernel::Vorticity,
        &[Velocity, Curl],
        Velocity,
        PassParams {
            value: config.curl_strength,
            dt: SIM_DT,
            ..sim
        },
    ));
    stages.push(Stage::new(Kernel::Divergence, &[Velocity], Divergence, sim));
    stages.push(Stage::new(
        Kernel::Clear,
        &[Pressure],
        Pressure,
        PassParams {
            value: config.pressure_dissipation,
            ..sim
        },
    ));
    for _ in 0..config.iterations {
        stages.push(Stage::new(Kernel::Pressure, &[Pressure, Divergence], Pressure, sim));
    }
    stages.push(Stage::new(Kernel::GradientSubtract, &[Pressure, Velocity], Velocity, sim));
    stages.push(Stage::new(
        Kernel::Advection,
        &[Velocity, Velocity],
        Velocity,
        PassParams {
            dt: SIM_DT,
            dissipation: config.velocity_dissipation,
            ..sim
        },
    ));
    stages.push(Stage::new(
        Kernel::Advection,
        &[Velocity, Dye],
        Dye,
        PassParams {
            texel_size: sim_texel,
            source_texel_size: dye_texel,
            dt: SIM_DT,
            dissipation: config.decay,
            ..PassParams::default()
        },
    ));

    stages
}

/// Runs one stage against the current buffers and commits its output.
pub fn run_stage(device: &mut dyn GridDevice, fields: &mut FieldBuffers, stage: &Stage) {
    let inputs: Vec<FieldId> = stage.inputs.iter().map(|kind| fields.current(*kind)).collect();
    device.run(&KernelPass {
        kernel: stage.kernel,
        inputs: &inputs,
        output: fields.write_target(stage.output),
        params: stage.params,
    });
    fields.commit(stage.output);
}

/// Owns the device, the field set and the pointer queue for one
/// configuration at a time.
pub struct FluidSolver<D: GridDevice> {
    device: D,
    config: FluidConfig,
    formats: SupportedFormats,
    surface: SurfaceSize,
    fields: FieldBuffers,
    /// False once `fields` has been released without a replacement.
    resident: bool,
    splats: SplatQueue,
    frames: u64,
}

impl<D: GridDevice> FluidSolver<D> {
    pub fn new(mut device: D, mut config: FluidConfig, surface: SurfaceSize) -> Result<Self> {
        config.sanitize();
        let formats = negotiate(&mut device);
        let fields = FieldBuffers::allocate(&mut device, &config, &formats, surface)
            .context("allocating fluid fields")?;

        Ok(Self {
            device,
            config,
            formats,
            surface,
            fields,
            resident: true,
            splats: SplatQueue::new(),
            frames: 0,
        })
    }

    /// Advances the simulation by one frame.
    pub fn step(&mut self) {
        let drained = self.splats.drain();
        let stages = frame_stages(
            &self.config,
            self.fields.sim_size(),
            self.fields.dye_size(),
            &drained,
        );
        for stage in &stages {
            run_stage(&mut self.device, &mut self.fields, stage);
        }
        self.device.flush();
        self.frames += 1;

        log::trace!(
            "frame {}: {} splats, {} passes, activity {:.3}",
            self.frames,
            drained.requests.len(),
            stages.len(),
            drained.activity
        );
    }

    /// Handle for pointer producers; may be moved to another thread.
    pub fn splat_queue(&self) -> SplatQueue {
        self.splats.clone()
    }

    pub fn enqueue(&self, motion: PointerMotion) -> Option<SplatRequest> {
        self.splats.enqueue(motion, self.surface)
    }

    pub fn push_splat(&self, request: SplatRequest) {
        self.splats.push(request);
    }

    /// Applies a new configuration. Resolution changes reallocate every field
    /// and reset the simulation; other values apply from the next step.
    pub fn reconfigure(&mut self, mut config: FluidConfig) -> Result<()> {
        config.sanitize();
        let reallocate = self.config.requires_reallocation(&config);
        let previous = std::mem::replace(&mut self.config, config);
        if reallocate {
            if let Err(err) = self.reallocate() {
                self.config = previous;
                self.reallocate()
                    .context("restoring previous fields after failed reconfiguration")?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Matches the grids to a new surface. Reallocates when the grid
    /// dimensions change. On failure the previous surface is kept and its
    /// fields are reallocated empty.
    pub fn resize(&mut self, surface: SurfaceSize) -> Result<()> {
        let surface = SurfaceSize::new(surface.width, surface.height);
        let unchanged = grid_size(self.config.sim_res, surface) == self.fields.sim_size()
            && grid_size(self.config.dye_res, surface) == self.fields.dye_size();
        let previous = std::mem::replace(&mut self.surface, surface);
        if unchanged && self.resident {
            return Ok(());
        }
        if let Err(err) = self.reallocate() {
            self.surface = previous;
            self.reallocate()
                .context("restoring previous fields after failed resize")?;
            return Err(err);
        }
        Ok(())
    }

    /// Drops all simulation state.
    pub fn reset(&mut self) -> Result<()> {
        self.splats.clear();
        self.reallocate()
    }

    /// True while every field id in [`Self::fields`] is backed by storage.
    pub fn is_resident(&self) -> bool {
        self.resident
    }

    fn reallocate(&mut self) -> Result<()> {
        // Only one field set is resident at a time. Until an allocation
        // succeeds the stale ids stay behind and every pass on them is skipped.
        if self.resident {
            self.fields.clone().release(&mut self.device);
            self.resident = false;
        }
        self.fields = FieldBuffers::allocate(&mut self.device, &self.config, &self.formats, self.surface)
            .context("reallocating fluid fields")?;
        self.resident = true;
        log::info!(
            "reallocated for sim_res {} dye_res {}",
            self.config.sim_res,
            self.config.dye_res
        );
        Ok(())
    }

    pub fn set_sim_res(&mut self, sim_res: u32) -> Result<()> {
        self.reconfigure(FluidConfig {
            sim_res,
            ..self.config.clone()
        })
    }

    pub fn set_dye_res(&mut self, dye_res: u32) -> Result<()> {
        self.reconfigure(FluidConfig {
            dye_res,
            ..self.config.clone()
        })
    }

    pub fn set_iterations(&mut self, iterations: u32) {
        self.config.iterations = iterations;
        self.config.sanitize();
    }

    pub fn set_decay(&mut self, decay: f32) {
        self.config.decay = decay;
        self.config.sanitize();
    }

    pub fn set_velocity_dissipation(&mut self, dissipation: f32) {
        self.config.velocity_dissipation = dissipation;
        self.config.sanitize();
    }

    pub fn set_pressure_dissipation(&mut self, dissipation: f32) {
        self.config.pressure_dissipation = dissipation;
        self.config.sanitize();
    }

    pub fn set_curl_strength(&mut self, curl: f32) {
        self.config.curl_strength = curl;
        self.config.sanitize();
    }

    pub fn set_radius(&mut self, radius: f32) {
        self.config.radius = radius;
        self.config.sanitize();
    }

    pub fn config(&self) -> &FluidConfig {
        &self.config
    }

    pub fn formats(&self) -> &SupportedFormats {
        &self.formats
    }

    pub fn surface(&self) -> SurfaceSize {
        self.surface
    }

    pub fn fields(&self) -> &FieldBuffers {
        &self.fields
    }

    /// The committed dye field, sampled by the display stage.
    pub fn dye(&self) -> FieldId {
        self.fields.current(FieldKind::Dye)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn read_field(&mut self, kind: FieldKind) -> Result<FieldData> {
        let id = self.fields.current(kind);
        self.device
            .read_field(id)
            .with_context(|| format!("reading {} field", kind.label()))
    }

    /// Overwrites the committed side of `kind`.
    pub fn write_field(&mut self, kind: FieldKind, data: &FieldData) -> Result<()> {
        let id = self.fields.current(kind);
        self.device
            .write_field(id, data)
            .with_context(|| format!("writing {} field", kind.label()))
    }
}
