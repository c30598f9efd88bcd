//! Reference backend evaluating every kernel on the CPU.
//!
//! The kernels mirror `shaders/fluid.wgsl` line for line: explicit texel
//! loads clamped to the edge, explicit bilinear interpolation, and storage
//! quantized to the field's format so half-float and best-effort formats
//! behave as they do on hardware.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use half::f16;

use crate::device::{FieldData, FieldDesc, FieldId, GridDevice, Kernel, KernelPass, PassParams};
use crate::formats::{DeviceCaps, FormatProbe, TexelFormat};

const PROBE_SIZE: u32 = 4;
const PROBE_VALUE: f32 = 0.5;
const VELOCITY_LIMIT: f32 = 1000.0;

struct CpuField {
    desc: FieldDesc,
    texels: Vec<[f32; 4]>,
}

impl CpuField {
    fn zeroed(desc: &FieldDesc) -> Self {
        Self {
            desc: desc.clone(),
            texels: vec![[0.0; 4]; desc.cell_count()],
        }
    }

    fn load(&self, x: i32, y: i32) -> [f32; 4] {
        let x = x.clamp(0, self.desc.width as i32 - 1) as u32;
        let y = y.clamp(0, self.desc.height as i32 - 1) as u32;
        self.texels[(y * self.desc.width + x) as usize]
    }

    /// Bilinear sample at normalized `uv`, `texel` being this field's texel size.
    fn bilerp(&self, uv: [f32; 2], texel: [f32; 2]) -> [f32; 4] {
        let st = [uv[0] / texel[0] - 0.5, uv[1] / texel[1] - 0.5];
        let ix = st[0].floor();
        let iy = st[1].floor();
        let fx = st[0] - ix;
        let fy = st[1] - iy;
        let (ix, iy) = (ix as i32, iy as i32);

        let a = self.load(ix, iy);
        let b = self.load(ix + 1, iy);
        let c = self.load(ix, iy + 1);
        let d = self.load(ix + 1, iy + 1);
        mix(mix(a, b, fx), mix(c, d, fx), fy)
    }
}

fn mix(a: [f32; 4], b: [f32; 4], t: f32) -> [f32; 4] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

fn scale(a: [f32; 4], s: f32) -> [f32; 4] {
    [a[0] * s, a[1] * s, a[2] * s, a[3] * s]
}

/// Rounds a texel the way `format` would store it.
pub fn quantize(format: TexelFormat, texel: [f32; 4]) -> [f32; 4] {
    let mut out = [0.0; 4];
    for (i, value) in texel.iter().enumerate().take(format.channels() as usize) {
        out[i] = match format {
            TexelFormat::R16Float | TexelFormat::Rg16Float | TexelFormat::Rgba16Float => {
                f16::from_f32(*value).to_f32()
            }
            TexelFormat::R32Float | TexelFormat::Rg32Float | TexelFormat::Rgba32Float => *value,
            TexelFormat::Rgba8Unorm => (value.clamp(0.0, 1.0) * 255.0).round() / 255.0,
        };
    }
    out
}

/// Inputs of one kernel invocation at cell `(x, y)`.
struct Cell<'a> {
    x: i32,
    y: i32,
    uv: [f32; 2],
    inputs: &'a [&'a CpuField],
    params: &'a PassParams,
}

impl Cell<'_> {
    fn input(&self, slot: usize) -> &CpuField {
        self.inputs[slot]
    }

    fn neighbours(&self, slot: usize) -> ([f32; 4], [f32; 4], [f32; 4], [f32; 4]) {
        let field = self.input(slot);
        (
            field.load(self.x - 1, self.y),
            field.load(self.x + 1, self.y),
            field.load(self.x, self.y - 1),
            field.load(self.x, self.y + 1),
        )
    }
}

fn splat(cell: &Cell) -> [f32; 4] {
    let p = cell.params;
    let base = cell.input(0).load(cell.x, cell.y);
    let dx = (cell.uv[0] - p.point[0]) * p.aspect_ratio;
    let dy = cell.uv[1] - p.point[1];
    let d2 = dx * dx + dy * dy;
    let r2 = p.radius * p.radius;
    let weight = if d2 < r2 { (-4.0 * d2 / r2).exp() } else { 0.0 };
    [
        base[0] + p.color[0] * weight,
        base[1] + p.color[1] * weight,
        base[2] + p.color[2] * weight,
        base[3] + p.color[3] * weight,
    ]
}

fn curl(cell: &Cell) -> [f32; 4] {
    let (l, r, b, t) = cell.neighbours(0);
    let vorticity = r[1] - l[1] - t[0] + b[0];
    [0.5 * vorticity, 0.0, 0.0, 0.0]
}

fn vorticity(cell: &Cell) -> [f32; 4] {
    let p = cell.params;
    let (l, r, b, t) = cell.neighbours(1);
    let c = cell.input(1).load(cell.x, cell.y)[0];

    let mut force = [0.5 * (t[0].abs() - b[0].abs()), 0.5 * (r[0].abs() - l[0].abs())];
    let len = (force[0] * force[0] + force[1] * force[1]).sqrt() + 0.0001;
    force[0] = force[0] / len * p.value * c;
    force[1] = -(force[1] / len * p.value * c);

    let v = cell.input(0).load(cell.x, cell.y);
    [
        (v[0] + force[0] * p.dt).clamp(-VELOCITY_LIMIT, VELOCITY_LIMIT),
        (v[1] + force[1] * p.dt).clamp(-VELOCITY_LIMIT, VELOCITY_LIMIT),
        0.0,
        0.0,
    ]
}

fn divergence(cell: &Cell) -> [f32; 4] {
    let field = cell.input(0);
    let (w, h) = (field.desc.width as i32, field.desc.height as i32);
    let (l, r, b, t) = cell.neighbours(0);
    let c = field.load(cell.x, cell.y);

    let left = if cell.x - 1 < 0 { -c[0] } else { l[0] };
    let right = if cell.x + 1 >= w { -c[0] } else { r[0] };
    let bottom = if cell.y - 1 < 0 { -c[1] } else { b[1] };
    let top = if cell.y + 1 >= h { -c[1] } else { t[1] };

    [0.5 * (right - left + top - bottom), 0.0, 0.0, 0.0]
}

fn clear(cell: &Cell) -> [f32; 4] {
    scale(cell.input(0).load(cell.x, cell.y), cell.params.value)
}

fn pressure(cell: &Cell) -> [f32; 4] {
    let (l, r, b, t) = cell.neighbours(0);
    let div = cell.input(1).load(cell.x, cell.y)[0];
    [(l[0] + r[0] + b[0] + t[0] - div) * 0.25, 0.0, 0.0, 0.0]
}

fn gradient_subtract(cell: &Cell) -> [f32; 4] {
    let (l, r, b, t) = cell.neighbours(0);
    let v = cell.input(1).load(cell.x, cell.y);
    [v[0] - (r[0] - l[0]), v[1] - (t[0] - b[0]), 0.0, 0.0]
}

fn advection(cell: &Cell) -> [f32; 4] {
    let p = cell.params;
    let vel = cell.input(0).bilerp(cell.uv, p.texel_size);
    let coord = [
        cell.uv[0] - p.dt * vel[0] * p.texel_size[0],
        cell.uv[1] - p.dt * vel[1] * p.texel_size[1],
    ];
    scale(cell.input(1).bilerp(coord, p.source_texel_size), p.dissipation)
}

fn evaluate(kernel: Kernel, cell: &Cell) -> [f32; 4] {
    match kernel {
        Kernel::Splat => splat(cell),
        Kernel::Curl => curl(cell),
        Kernel::Vorticity => vorticity(cell),
        Kernel::Divergence => divergence(cell),
        Kernel::Clear => clear(cell),
        Kernel::Pressure => pressure(cell),
        Kernel::GradientSubtract => gradient_subtract(cell),
        Kernel::Advection => advection(cell),
    }
}

/// CPU device with an emulated capability set.
pub struct CpuDevice {
    caps: DeviceCaps,
    renderable: HashSet<TexelFormat>,
    filterable: HashSet<TexelFormat>,
    memory_limit: Option<usize>,
    fields: HashMap<FieldId, CpuField>,
    next_id: u32,
    passes_run: u64,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    /// Every float format renders; only half floats filter linearly.
    pub fn new() -> Self {
        Self {
            caps: DeviceCaps::default(),
            renderable: [
                TexelFormat::R16Float,
                TexelFormat::Rg16Float,
                TexelFormat::Rgba16Float,
                TexelFormat::R32Float,
                TexelFormat::Rg32Float,
                TexelFormat::Rgba32Float,
                TexelFormat::Rgba8Unorm,
            ]
            .into_iter()
            .collect(),
            filterable: [
                TexelFormat::R16Float,
                TexelFormat::Rg16Float,
                TexelFormat::Rgba16Float,
                TexelFormat::Rgba8Unorm,
            ]
            .into_iter()
            .collect(),
            memory_limit: None,
            fields: HashMap::new(),
            next_id: 0,
            passes_run: 0,
        }
    }

    pub fn with_caps(mut self, caps: DeviceCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Restricts the formats that pass the render-target probe. The device
    /// default `Rgba8Unorm` always stays allocatable.
    pub fn with_renderable(mut self, formats: &[TexelFormat]) -> Self {
        self.renderable = formats.iter().copied().collect();
        self
    }

    pub fn with_filterable(mut self, formats: &[TexelFormat]) -> Self {
        self.filterable = formats.iter().copied().collect();
        self
    }

    /// Caps the total bytes of live fields; allocations past it fail.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn live_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn passes_run(&self) -> u64 {
        self.passes_run
    }

    fn bytes_in_use(&self) -> usize {
        self.fields
            .values()
            .map(|f| f.desc.cell_count() * f.desc.format.bytes_per_texel() as usize)
            .sum()
    }

    fn can_store(&self, format: TexelFormat) -> bool {
        format == TexelFormat::Rgba8Unorm || self.renderable.contains(&format)
    }
}

impl FormatProbe for CpuDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn probe_render_target(&mut self, format: TexelFormat) -> bool {
        if !self.renderable.contains(&format) {
            return false;
        }
        let desc = FieldDesc {
            label: "format probe",
            width: PROBE_SIZE,
            height: PROBE_SIZE,
            format,
            channels: format.channels(),
            filter: crate::device::FilterMode::Nearest,
        };
        let mut probe = CpuField::zeroed(&desc);
        let written = quantize(format, [PROBE_VALUE; 4]);
        for texel in probe.texels.iter_mut() {
            *texel = written;
        }
        probe.load(1, 1)[0] == PROBE_VALUE
    }

    fn supports_linear_filtering(&self, format: TexelFormat) -> bool {
        self.filterable.contains(&format)
    }
}

impl GridDevice for CpuDevice {
    fn create_field(&mut self, desc: &FieldDesc) -> Result<FieldId> {
        if desc.width == 0 || desc.height == 0 {
            bail!("field {} has zero size", desc.label);
        }
        if !self.can_store(desc.format) {
            bail!("format {:?} cannot back field {}", desc.format, desc.label);
        }
        if let Some(limit) = self.memory_limit {
            let needed = desc.cell_count() * desc.format.bytes_per_texel() as usize;
            if self.bytes_in_use() + needed > limit {
                bail!(
                    "out of memory allocating {} ({} bytes, {} in use, limit {})",
                    desc.label,
                    needed,
                    self.bytes_in_use(),
                    limit
                );
            }
        }

        let id = FieldId(self.next_id);
        self.next_id += 1;
        self.fields.insert(id, CpuField::zeroed(desc));
        Ok(id)
    }

    fn release_field(&mut self, id: FieldId) {
        self.fields.remove(&id);
    }

    fn field_desc(&self, id: FieldId) -> Option<&FieldDesc> {
        self.fields.get(&id).map(|f| &f.desc)
    }

    fn run(&mut self, pass: &KernelPass<'_>) {
        let Some(mut output) = self.fields.remove(&pass.output) else {
            log::warn!("{:?} pass targets unknown field {:?}", pass.kernel, pass.output);
            return;
        };

        {
            let inputs: Vec<&CpuField> = pass.inputs.iter().filter_map(|id| self.fields.get(id)).collect();
            if inputs.len() < pass.kernel.input_count() {
                log::warn!("{:?} pass is missing inputs (or reads its own output)", pass.kernel);
            } else {
                let (w, h) = (output.desc.width, output.desc.height);
                let format = output.desc.format;
                for y in 0..h {
                    for x in 0..w {
                        let cell = Cell {
                            x: x as i32,
                            y: y as i32,
                            uv: [(x as f32 + 0.5) / w as f32, (y as f32 + 0.5) / h as f32],
                            inputs: &inputs,
                            params: &pass.params,
                        };
                        output.texels[(y * w + x) as usize] = quantize(format, evaluate(pass.kernel, &cell));
                    }
                }
                self.passes_run += 1;
            }
        }

        self.fields.insert(pass.output, output);
    }

    fn flush(&mut self) {}

    fn read_field(&mut self, id: FieldId) -> Result<FieldData> {
        let Some(field) = self.fields.get(&id) else {
            bail!("unknown field {:?}", id);
        };
        Ok(FieldData {
            width: field.desc.width,
            height: field.desc.height,
            texels: field.texels.clone(),
        })
    }

    fn write_field(&mut self, id: FieldId, data: &FieldData) -> Result<()> {
        let Some(field) = self.fields.get_mut(&id) else {
            bail!("unknown field {:?}", id);
        };
        if (data.width, data.height) != (field.desc.width, field.desc.height) {
            bail!(
                "size mismatch writing {}: {}x{} into {}x{}",
                field.desc.label,
                data.width,
                data.height,
                field.desc.width,
                field.desc.height
            );
        }
        let format = field.desc.format;
        for (dst, src) in field.texels.iter_mut().zip(data.texels.iter()) {
            *dst = quantize(format, *src);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FilterMode;

    fn field(device: &mut CpuDevice, w: u32, h: u32, format: TexelFormat) -> FieldId {
        device
            .create_field(&FieldDesc {
                label: "test",
                width: w,
                height: h,
                format,
                channels: format.channels(),
                filter: FilterMode::Nearest,
            })
            .unwrap()
    }

    fn filled(
        device: &mut CpuDevice,
        w: u32,
        h: u32,
        format: TexelFormat,
        value: impl Fn(u32, u32) -> [f32; 4],
    ) -> FieldId {
        let id = field(device, w, h, format);
        let mut data = FieldData::zeroed(w, h);
        for y in 0..h {
            for x in 0..w {
                data.set(x, y, value(x, y));
            }
        }
        device.write_field(id, &data).unwrap();
        id
    }

    fn run(device: &mut CpuDevice, kernel: Kernel, inputs: &[FieldId], output: FieldId, params: PassParams) -> FieldData {
        device.run(&KernelPass {
            kernel,
            inputs,
            output,
            params,
        });
        device.read_field(output).unwrap()
    }

    #[test]
    fn quantize_masks_channels_and_precision() {
        assert_eq!(quantize(TexelFormat::R32Float, [1.5, 2.0, 3.0, 4.0]), [1.5, 0.0, 0.0, 0.0]);
        assert_eq!(quantize(TexelFormat::Rgba8Unorm, [2.0, -1.0, 0.5, 1.0])[0..2], [1.0, 0.0]);
        let half = quantize(TexelFormat::Rg16Float, [0.1, 1000.3, 7.0, 7.0]);
        assert!((half[0] - 0.1).abs() < 1e-4);
        assert_eq!(half[1], 1000.5);
        assert_eq!(half[2], 0.0);
    }

    #[test]
    fn clear_scales_every_cell() {
        let mut device = CpuDevice::new();
        let src = field(&mut device, 4, 4, TexelFormat::R32Float);
        let dst = field(&mut device, 4, 4, TexelFormat::R32Float);
        let mut data = FieldData::zeroed(4, 4);
        data.set(2, 1, [3.0, 0.0, 0.0, 0.0]);
        device.write_field(src, &data).unwrap();

        device.run(&KernelPass {
            kernel: Kernel::Clear,
            inputs: &[src],
            output: dst,
            params: PassParams {
                value: 0.5,
                ..PassParams::default()
            },
        });
        let out = device.read_field(dst).unwrap();
        assert_eq!(out.at(2, 1)[0], 1.5);
        assert_eq!(out.at(0, 0)[0], 0.0);
    }

    #[test]
    fn divergence_of_uniform_flow_is_zero_inside_and_reflected_at_walls() {
        let mut device = CpuDevice::new();
        let vel = field(&mut device, 6, 6, TexelFormat::Rg32Float);
        let div = field(&mut device, 6, 6, TexelFormat::R32Float);
        let data = FieldData {
            width: 6,
            height: 6,
            texels: vec![[1.0, 0.0, 0.0, 0.0]; 36],
        };
        device.write_field(vel, &data).unwrap();
        device.run(&KernelPass {
            kernel: Kernel::Divergence,
            inputs: &[vel],
            output: div,
            params: PassParams::default(),
        });
        let out = device.read_field(div).unwrap();
        assert_eq!(out.at(3, 3)[0], 0.0);
        // Outflow through the right wall: R = -C.x.
        assert_eq!(out.at(5, 3)[0], -1.0);
        assert_eq!(out.at(0, 3)[0], 1.0);
    }

    #[test]
    fn bilinear_sampling_interpolates_between_cell_centres() {
        let mut device = CpuDevice::new();
        let id = field(&mut device, 2, 1, TexelFormat::R32Float);
        let mut data = FieldData::zeroed(2, 1);
        data.set(1, 0, [1.0, 0.0, 0.0, 0.0]);
        device.write_field(id, &data).unwrap();
        let f = &device.fields[&id];
        assert_eq!(f.bilerp([0.5, 0.5], [0.5, 1.0])[0], 0.5);
        assert_eq!(f.bilerp([0.25, 0.5], [0.5, 1.0])[0], 0.0);
        assert_eq!(f.bilerp([1.5, 0.5], [0.5, 1.0])[0], 1.0);
    }

    #[test]
    fn probe_rejects_formats_outside_the_renderable_set() {
        let mut device = CpuDevice::new().with_renderable(&[TexelFormat::Rgba32Float]);
        assert!(!device.probe_render_target(TexelFormat::R16Float));
        assert!(device.probe_render_target(TexelFormat::Rgba32Float));
        assert_eq!(device.live_fields(), 0);
    }

    #[test]
    fn memory_limit_fails_allocation() {
        let mut device = CpuDevice::new().with_memory_limit(64);
        let ok = device.create_field(&FieldDesc {
            label: "fits",
            width: 4,
            height: 4,
            format: TexelFormat::R32Float,
            channels: 1,
            filter: FilterMode::Nearest,
        });
        assert!(ok.is_ok());
        let too_big = device.create_field(&FieldDesc {
            label: "spills",
            width: 4,
            height: 4,
            format: TexelFormat::R32Float,
            channels: 1,
            filter: FilterMode::Nearest,
        });
        assert!(too_big.is_err());
    }

    #[test]
    fn pass_reading_its_own_output_is_skipped() {
        let mut device = CpuDevice::new();
        let id = field(&mut device, 2, 2, TexelFormat::R32Float);
        device.run(&KernelPass {
            kernel: Kernel::Clear,
            inputs: &[id],
            output: id,
            params: PassParams::default(),
        });
        assert_eq!(device.passes_run(), 0);
        assert_eq!(device.live_fields(), 1);
    }

    #[test]
    fn advection_carries_dye_downstream() {
        let mut device = CpuDevice::new();
        let vel = filled(&mut device, 20, 4, TexelFormat::Rg32Float, |_, _| [50.0, 0.0, 0.0, 0.0]);
        let dye = filled(&mut device, 20, 4, TexelFormat::Rgba32Float, |x, _| {
            if x == 10 {
                [1.0; 4]
            } else {
                [0.0; 4]
            }
        });
        let out = field(&mut device, 20, 4, TexelFormat::Rgba32Float);

        let texel = [1.0 / 20.0, 1.0 / 4.0];
        let moved = run(
            &mut device,
            Kernel::Advection,
            &[vel, dye],
            out,
            PassParams {
                texel_size: texel,
                source_texel_size: texel,
                dt: 0.016,
                dissipation: 1.0,
                ..PassParams::default()
            },
        );

        // 50 cells/s over 0.016 s is 0.8 cells toward +x.
        assert!((moved.at(10, 2)[0] - 0.2).abs() < 1e-5, "{}", moved.at(10, 2)[0]);
        assert!((moved.at(11, 2)[0] - 0.8).abs() < 1e-5, "{}", moved.at(11, 2)[0]);
        assert_eq!(moved.at(9, 2)[0], 0.0);
        assert_eq!(moved.at(12, 2)[0], 0.0);
    }

    #[test]
    fn gradient_subtract_pushes_flow_down_the_pressure_slope() {
        let mut device = CpuDevice::new();
        let pressure = filled(&mut device, 6, 6, TexelFormat::R32Float, |x, y| {
            [x as f32 + 2.0 * y as f32, 0.0, 0.0, 0.0]
        });
        let vel = field(&mut device, 6, 6, TexelFormat::Rg32Float);
        let out = field(&mut device, 6, 6, TexelFormat::Rg32Float);

        let projected = run(
            &mut device,
            Kernel::GradientSubtract,
            &[pressure, vel],
            out,
            PassParams::default(),
        );
        assert_eq!(projected.at(3, 3)[0..2], [-2.0, -4.0]);
        assert_eq!(projected.at(2, 4)[0..2], [-2.0, -4.0]);
    }

    #[test]
    fn curl_of_counter_clockwise_rotation_is_positive() {
        let mut device = CpuDevice::new();
        let vel = filled(&mut device, 8, 8, TexelFormat::Rg32Float, |x, y| {
            [-(y as f32 - 3.5), x as f32 - 3.5, 0.0, 0.0]
        });
        let curl = field(&mut device, 8, 8, TexelFormat::R32Float);

        let out = run(&mut device, Kernel::Curl, &[vel], curl, PassParams::default());
        assert_eq!(out.at(3, 3)[0], 2.0);
        assert_eq!(out.at(4, 5)[0], 2.0);
    }

    #[test]
    fn vorticity_force_follows_curl_gradient_and_is_clamped() {
        let mut device = CpuDevice::new();
        let vel = field(&mut device, 9, 9, TexelFormat::Rg32Float);
        let curl = filled(&mut device, 9, 9, TexelFormat::R32Float, |x, _| [x as f32, 0.0, 0.0, 0.0]);
        let out = field(&mut device, 9, 9, TexelFormat::Rg32Float);

        let params = PassParams {
            value: 30.0,
            dt: 0.016,
            ..PassParams::default()
        };
        let confined = run(&mut device, Kernel::Vorticity, &[vel, curl], out, params);
        let v = confined.at(4, 4);
        assert_eq!(v[0], 0.0);
        // |curl| grows along +x, so the force is -y scaled by strength and curl.
        assert!((v[1] + 30.0 * 4.0 * 0.016).abs() < 1e-3, "{}", v[1]);

        let huge = PassParams {
            value: 1.0e6,
            ..params
        };
        let clamped = run(&mut device, Kernel::Vorticity, &[vel, curl], out, huge);
        assert_eq!(clamped.at(4, 4)[1], -VELOCITY_LIMIT);
        assert!(clamped.max_abs() <= VELOCITY_LIMIT);
    }

    #[test]
    fn projection_reduces_divergence_of_a_source() {
        let (w, h) = (12, 12);
        let mut device = CpuDevice::new();
        let centre = (w as f32 - 1.0) / 2.0;
        let vel = filled(&mut device, w, h, TexelFormat::Rg32Float, |x, y| {
            let (dx, dy) = (x as f32 - centre, y as f32 - centre);
            let g = (-(dx * dx + dy * dy) / 8.0).exp();
            [dx * g, dy * g, 0.0, 0.0]
        });
        let div = field(&mut device, w, h, TexelFormat::R32Float);
        let mut pressure = [
            field(&mut device, w, h, TexelFormat::R32Float),
            field(&mut device, w, h, TexelFormat::R32Float),
        ];
        let projected = field(&mut device, w, h, TexelFormat::Rg32Float);
        let div_after = field(&mut device, w, h, TexelFormat::R32Float);

        let before = run(&mut device, Kernel::Divergence, &[vel], div, PassParams::default());
        for _ in 0..60 {
            run(&mut device, Kernel::Pressure, &[pressure[0], div], pressure[1], PassParams::default());
            pressure.swap(0, 1);
        }
        run(
            &mut device,
            Kernel::GradientSubtract,
            &[pressure[0], vel],
            projected,
            PassParams::default(),
        );
        let after = run(&mut device, Kernel::Divergence, &[projected], div_after, PassParams::default());

        let energy = |d: &FieldData| d.texels.iter().map(|t| t[0] * t[0]).sum::<f32>();
        assert!(after.max_abs() < 0.8 * before.max_abs(), "{} vs {}", after.max_abs(), before.max_abs());
        assert!(energy(&after) < 0.7 * energy(&before));
    }
}
