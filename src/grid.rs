//! Field storage: double buffers, grid sizing and the per-configuration
//! field set.

use anyhow::{Context, Result};

use crate::config::FluidConfig;
use crate::device::{FieldDesc, FieldId, FilterMode, GridDevice};
use crate::formats::SupportedFormats;

/// Read/write pair. `swap` only exchanges the labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleBuffer<T> {
    read: T,
    write: T,
}

impl<T> DoubleBuffer<T> {
    pub fn new(read: T, write: T) -> Self {
        Self { read, write }
    }

    pub fn read(&self) -> &T {
        &self.read
    }

    pub fn write(&self) -> &T {
        &self.write
    }

    pub fn swap(&mut self) {
        std::mem::swap(&mut self.read, &mut self.write);
    }

    pub fn into_pair(self) -> (T, T) {
        (self.read, self.write)
    }
}

/// Surface size in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    pub fn square(side: u32) -> Self {
        Self::new(side, side)
    }
}

/// Grid dimensions for a resolution setting: `resolution` is the short side,
/// the long side follows the surface aspect ratio.
pub fn grid_size(resolution: u32, surface: SurfaceSize) -> (u32, u32) {
    let w = surface.width as f32;
    let h = surface.height as f32;
    let aspect = if w >= h { w / h } else { h / w };

    let short = resolution.max(1);
    let long = ((short as f32) * aspect).round().max(1.0) as u32;

    if w >= h {
        (long, short)
    } else {
        (short, long)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Velocity,
    Dye,
    Pressure,
    Divergence,
    Curl,
}

impl FieldKind {
    pub const ALL: [FieldKind; 5] = [
        FieldKind::Velocity,
        FieldKind::Dye,
        FieldKind::Pressure,
        FieldKind::Divergence,
        FieldKind::Curl,
    ];

    pub fn channels(self) -> u32 {
        match self {
            FieldKind::Velocity => 2,
            FieldKind::Dye => 4,
            FieldKind::Pressure | FieldKind::Divergence | FieldKind::Curl => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FieldKind::Velocity => "velocity",
            FieldKind::Dye => "dye",
            FieldKind::Pressure => "pressure",
            FieldKind::Divergence => "divergence",
            FieldKind::Curl => "curl",
        }
    }
}

/// The full simulation state for one configuration.
#[derive(Debug, Clone)]
pub struct FieldBuffers {
    pub velocity: DoubleBuffer<FieldId>,
    pub dye: DoubleBuffer<FieldId>,
    pub pressure: DoubleBuffer<FieldId>,
    pub divergence: FieldId,
    pub curl: FieldId,
    sim_size: (u32, u32),
    dye_size: (u32, u32),
}

impl FieldBuffers {
    pub fn allocate(
        device: &mut dyn GridDevice,
        config: &FluidConfig,
        formats: &SupportedFormats,
        surface: SurfaceSize,
    ) -> Result<Self> {
        let sim_size = grid_size(config.sim_res, surface);
        let dye_size = grid_size(config.dye_res, surface);
        let dye_filter = if formats.linear_filtering {
            FilterMode::Linear
        } else {
            FilterMode::Nearest
        };

        let mut created = Vec::new();
        let result = Self::allocate_into(device, formats, sim_size, dye_size, dye_filter, &mut created);
        if result.is_err() {
            for id in created {
                device.release_field(id);
            }
        }
        let fields = result?;

        log::info!(
            "allocated fields: sim {}x{}, dye {}x{} ({:?})",
            sim_size.0,
            sim_size.1,
            dye_size.0,
            dye_size.1,
            dye_filter
        );
        Ok(fields)
    }

    fn allocate_into(
        device: &mut dyn GridDevice,
        formats: &SupportedFormats,
        sim_size: (u32, u32),
        dye_size: (u32, u32),
        dye_filter: FilterMode,
        created: &mut Vec<FieldId>,
    ) -> Result<Self> {
        let mut alloc = |kind: FieldKind, size: (u32, u32), filter: FilterMode| -> Result<FieldId> {
            let desc = FieldDesc {
                label: kind.label(),
                width: size.0,
                height: size.1,
                format: formats.for_channels(kind.channels()).texel_format(),
                channels: kind.channels(),
                filter,
            };
            let id = device
                .create_field(&desc)
                .with_context(|| format!("allocating {} field {}x{}", kind.label(), size.0, size.1))?;
            created.push(id);
            Ok(id)
        };

        let velocity = DoubleBuffer::new(
            alloc(FieldKind::Velocity, sim_size, FilterMode::Nearest)?,
            alloc(FieldKind::Velocity, sim_size, FilterMode::Nearest)?,
        );
        let dye = DoubleBuffer::new(
            alloc(FieldKind::Dye, dye_size, dye_filter)?,
            alloc(FieldKind::Dye, dye_size, dye_filter)?,
        );
        let pressure = DoubleBuffer::new(
            alloc(FieldKind::Pressure, sim_size, FilterMode::Nearest)?,
            alloc(FieldKind::Pressure, sim_size, FilterMode::Nearest)?,
        );
        let divergence = alloc(FieldKind::Divergence, sim_size, FilterMode::Nearest)?;
        let curl = alloc(FieldKind::Curl, sim_size, FilterMode::Nearest)?;

        Ok(Self {
            velocity,
            dye,
            pressure,
            divergence,
            curl,
            sim_size,
            dye_size,
        })
    }

    /// Releases every field. The buffers must not be used afterwards.
    pub fn release(self, device: &mut dyn GridDevice) {
        for id in self.all_ids() {
            device.release_field(id);
        }
    }

    pub fn all_ids(&self) -> [FieldId; 8] {
        let (vr, vw) = self.velocity.into_pair();
        let (dr, dw) = self.dye.into_pair();
        let (pr, pw) = self.pressure.into_pair();
        [vr, vw, dr, dw, pr, pw, self.divergence, self.curl]
    }

    /// The committed (read-side) field for `kind`.
    pub fn current(&self, kind: FieldKind) -> FieldId {
        match kind {
            FieldKind::Velocity => *self.velocity.read(),
            FieldKind::Dye => *self.dye.read(),
            FieldKind::Pressure => *self.pressure.read(),
            FieldKind::Divergence => self.divergence,
            FieldKind::Curl => self.curl,
        }
    }

    /// The field a pass producing `kind` writes into.
    pub fn write_target(&self, kind: FieldKind) -> FieldId {
        match kind {
            FieldKind::Velocity => *self.velocity.write(),
            FieldKind::Dye => *self.dye.write(),
            FieldKind::Pressure => *self.pressure.write(),
            FieldKind::Divergence => self.divergence,
            FieldKind::Curl => self.curl,
        }
    }

    /// Publishes a finished write: swaps double buffers, no-op otherwise.
    pub fn commit(&mut self, kind: FieldKind) {
        match kind {
            FieldKind::Velocity => self.velocity.swap(),
            FieldKind::Dye => self.dye.swap(),
            FieldKind::Pressure => self.pressure.swap(),
            FieldKind::Divergence | FieldKind::Curl => {}
        }
    }

    pub fn sim_size(&self) -> (u32, u32) {
        self.sim_size
    }

    pub fn dye_size(&self) -> (u32, u32) {
        self.dye_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuDevice;
    use crate::formats::negotiate;

    #[test]
    fn swap_twice_restores_identity() {
        let mut buffer = DoubleBuffer::new(FieldId(7), FieldId(9));
        buffer.swap();
        assert_eq!(*buffer.read(), FieldId(9));
        assert_eq!(*buffer.write(), FieldId(7));
        buffer.swap();
        assert_eq!(*buffer.read(), FieldId(7));
        assert_eq!(*buffer.write(), FieldId(9));
    }

    #[test]
    fn grid_size_follows_surface_orientation() {
        assert_eq!(grid_size(128, SurfaceSize::new(1920, 1080)), (228, 128));
        assert_eq!(grid_size(128, SurfaceSize::new(1080, 1920)), (128, 228));
        assert_eq!(grid_size(64, SurfaceSize::square(500)), (64, 64));
    }

    #[test]
    fn simulation_fields_share_dimensions() {
        let mut device = CpuDevice::new();
        let formats = negotiate(&mut device);
        let config = FluidConfig {
            sim_res: 32,
            dye_res: 96,
            ..FluidConfig::default()
        };
        let fields = FieldBuffers::allocate(&mut device, &config, &formats, SurfaceSize::new(800, 600)).unwrap();

        let sim = fields.sim_size();
        for id in [
            *fields.velocity.read(),
            *fields.velocity.write(),
            *fields.pressure.read(),
            *fields.pressure.write(),
            fields.divergence,
            fields.curl,
        ] {
            let desc = device.field_desc(id).unwrap();
            assert_eq!((desc.width, desc.height), sim);
            assert_eq!(desc.filter, FilterMode::Nearest);
        }
        let dye = device.field_desc(*fields.dye.read()).unwrap();
        assert_eq!((dye.width, dye.height), (128, 96));
        assert_eq!(dye.filter, FilterMode::Linear);
    }

    #[test]
    fn release_frees_every_field() {
        let mut device = CpuDevice::new();
        let formats = negotiate(&mut device);
        let config = FluidConfig {
            sim_res: 16,
            dye_res: 32,
            ..FluidConfig::default()
        };
        let fields = FieldBuffers::allocate(&mut device, &config, &formats, SurfaceSize::square(64)).unwrap();
        assert_eq!(device.live_fields(), 8);
        fields.release(&mut device);
        assert_eq!(device.live_fields(), 0);
    }
}
