//! Texture format negotiation.
//!
//! Every field the solver owns must be usable both as a sampled input and as
//! a render target. Devices routinely advertise formats that fail one of the
//! two, so each candidate is checked with a real probe through
//! [`FormatProbe::probe_render_target`] before it is accepted.

/// Storage formats the solver knows how to allocate, read back and emulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexelFormat {
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    /// Device default used when nothing else round-trips. Clamps to [0, 1].
    Rgba8Unorm,
}

impl TexelFormat {
    /// Number of channels physically stored per texel.
    pub fn channels(self) -> u32 {
        match self {
            TexelFormat::R16Float | TexelFormat::R32Float => 1,
            TexelFormat::Rg16Float | TexelFormat::Rg32Float => 2,
            TexelFormat::Rgba16Float | TexelFormat::Rgba32Float | TexelFormat::Rgba8Unorm => 4,
        }
    }

    pub fn bytes_per_channel(self) -> u32 {
        match self {
            TexelFormat::R16Float | TexelFormat::Rg16Float | TexelFormat::Rgba16Float => 2,
            TexelFormat::R32Float | TexelFormat::Rg32Float | TexelFormat::Rgba32Float => 4,
            TexelFormat::Rgba8Unorm => 1,
        }
    }

    pub fn bytes_per_texel(self) -> u32 {
        self.channels() * self.bytes_per_channel()
    }

    pub fn is_half_float(self) -> bool {
        self.bytes_per_channel() == 2
    }

    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            TexelFormat::R16Float => wgpu::TextureFormat::R16Float,
            TexelFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
            TexelFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TexelFormat::R32Float => wgpu::TextureFormat::R32Float,
            TexelFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
            TexelFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TexelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

/// Device generation. Legacy devices cannot render into 1- or 2-channel
/// float targets, so every field is stored in a 4-channel format there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTier {
    Modern,
    Legacy,
}

/// Capability flags reported by the device before any probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub tier: DeviceTier,
    pub half_float: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            tier: DeviceTier::Modern,
            half_float: true,
        }
    }
}

/// Probing seam implemented by every device backend.
pub trait FormatProbe {
    fn caps(&self) -> DeviceCaps;

    /// Allocates a small texture in `format`, renders into it and reports
    /// whether the result is a complete, sampleable render target. The probe
    /// texture is discarded afterwards.
    fn probe_render_target(&mut self, format: TexelFormat) -> bool;

    fn supports_linear_filtering(&self, format: TexelFormat) -> bool;
}

/// A format that passed the probe, together with how many channels the
/// field actually uses inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub format: TexelFormat,
    pub used_channels: u32,
}

impl FormatDescriptor {
    /// True when a narrower field is carried inside a wider format.
    pub fn is_widened(&self) -> bool {
        self.format.channels() > self.used_channels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatChoice {
    Resolved(FormatDescriptor),
    /// No candidate round-tripped; allocate with the device default.
    BestEffort,
}

impl FormatChoice {
    pub fn texel_format(&self) -> TexelFormat {
        match self {
            FormatChoice::Resolved(desc) => desc.format,
            FormatChoice::BestEffort => TexelFormat::Rgba8Unorm,
        }
    }

    pub fn is_best_effort(&self) -> bool {
        matches!(self, FormatChoice::BestEffort)
    }
}

/// Outcome of negotiation for the three channel counts the solver uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedFormats {
    pub rgba: FormatChoice,
    pub rg: FormatChoice,
    pub r: FormatChoice,
    pub linear_filtering: bool,
}

impl SupportedFormats {
    pub fn for_channels(&self, channels: u32) -> FormatChoice {
        match channels {
            1 => self.r,
            2 => self.rg,
            _ => self.rgba,
        }
    }
}

const HALF_CANDIDATES: [TexelFormat; 3] = [
    TexelFormat::R16Float,
    TexelFormat::Rg16Float,
    TexelFormat::Rgba16Float,
];

const FULL_CANDIDATES: [TexelFormat; 3] = [
    TexelFormat::R32Float,
    TexelFormat::Rg32Float,
    TexelFormat::Rgba32Float,
];

/// Ordered candidates for a field with `channels` channels: native half
/// float, wider half float, then the same walk over 32-bit formats.
pub fn candidates(caps: DeviceCaps, channels: u32) -> Vec<TexelFormat> {
    let min_channels = match caps.tier {
        DeviceTier::Modern => channels,
        DeviceTier::Legacy => 4,
    };

    let mut out = Vec::new();
    if caps.half_float {
        out.extend(HALF_CANDIDATES.iter().copied().filter(|f| f.channels() >= min_channels));
    }
    out.extend(FULL_CANDIDATES.iter().copied().filter(|f| f.channels() >= min_channels));
    out
}

fn resolve(probe: &mut dyn FormatProbe, caps: DeviceCaps, channels: u32) -> FormatChoice {
    for format in candidates(caps, channels) {
        if probe.probe_render_target(format) {
            return FormatChoice::Resolved(FormatDescriptor {
                format,
                used_channels: channels,
            });
        }
        log::debug!("{:?} rejected for {}-channel fields", format, channels);
    }
    log::warn!(
        "no float render target for {}-channel fields, using device default",
        channels
    );
    FormatChoice::BestEffort
}

/// Picks a format for each channel count, degrading through the candidate
/// lists. Never fails: a channel count with no working candidate gets
/// [`FormatChoice::BestEffort`].
pub fn negotiate(probe: &mut dyn FormatProbe) -> SupportedFormats {
    let caps = probe.caps();
    let rgba = resolve(probe, caps, 4);
    let rg = resolve(probe, caps, 2);
    let r = resolve(probe, caps, 1);
    let linear_filtering = probe.supports_linear_filtering(rgba.texel_format());

    log::info!(
        "formats: rgba={:?} rg={:?} r={:?} linear={}",
        rgba.texel_format(),
        rg.texel_format(),
        r.texel_format(),
        linear_filtering
    );

    SupportedFormats {
        rgba,
        rg,
        r,
        linear_filtering,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeProbe {
        caps: DeviceCaps,
        working: HashSet<TexelFormat>,
        probed: Vec<TexelFormat>,
    }

    impl FakeProbe {
        fn new(caps: DeviceCaps, working: &[TexelFormat]) -> Self {
            Self {
                caps,
                working: working.iter().copied().collect(),
                probed: Vec::new(),
            }
        }
    }

    impl FormatProbe for FakeProbe {
        fn caps(&self) -> DeviceCaps {
            self.caps
        }

        fn probe_render_target(&mut self, format: TexelFormat) -> bool {
            self.probed.push(format);
            self.working.contains(&format)
        }

        fn supports_linear_filtering(&self, format: TexelFormat) -> bool {
            format.is_half_float()
        }
    }

    #[test]
    fn native_half_float_wins_when_everything_works() {
        let all = [
            TexelFormat::R16Float,
            TexelFormat::Rg16Float,
            TexelFormat::Rgba16Float,
            TexelFormat::R32Float,
            TexelFormat::Rg32Float,
            TexelFormat::Rgba32Float,
        ];
        let mut probe = FakeProbe::new(DeviceCaps::default(), &all);
        let formats = negotiate(&mut probe);
        assert_eq!(formats.r.texel_format(), TexelFormat::R16Float);
        assert_eq!(formats.rg.texel_format(), TexelFormat::Rg16Float);
        assert_eq!(formats.rgba.texel_format(), TexelFormat::Rgba16Float);
        assert!(formats.linear_filtering);
    }

    #[test]
    fn one_channel_falls_back_to_four_channel_half_float() {
        let mut probe = FakeProbe::new(DeviceCaps::default(), &[TexelFormat::Rgba16Float]);
        let formats = negotiate(&mut probe);
        match formats.r {
            FormatChoice::Resolved(desc) => {
                assert_eq!(desc.format, TexelFormat::Rgba16Float);
                assert_eq!(desc.used_channels, 1);
                assert!(desc.is_widened());
            }
            FormatChoice::BestEffort => panic!("a 4-channel fallback exists"),
        }
    }

    #[test]
    fn half_float_is_preferred_over_native_full_float() {
        let mut probe = FakeProbe::new(
            DeviceCaps::default(),
            &[TexelFormat::R32Float, TexelFormat::Rgba16Float],
        );
        assert_eq!(negotiate(&mut probe).r.texel_format(), TexelFormat::Rgba16Float);
    }

    #[test]
    fn full_float_used_without_half_float_support() {
        let caps = DeviceCaps {
            tier: DeviceTier::Modern,
            half_float: false,
        };
        let mut probe = FakeProbe::new(caps, &[TexelFormat::Rgba16Float, TexelFormat::Rg32Float]);
        let formats = negotiate(&mut probe);
        assert_eq!(formats.rg.texel_format(), TexelFormat::Rg32Float);
        assert_eq!(formats.r.texel_format(), TexelFormat::Rg32Float);
        assert!(formats.rgba.is_best_effort());
        assert!(!probe.probed.contains(&TexelFormat::Rgba16Float));
    }

    #[test]
    fn legacy_tier_only_tries_four_channel_formats() {
        let caps = DeviceCaps {
            tier: DeviceTier::Legacy,
            half_float: true,
        };
        assert_eq!(
            candidates(caps, 1),
            vec![TexelFormat::Rgba16Float, TexelFormat::Rgba32Float]
        );
    }

    #[test]
    fn nothing_working_yields_best_effort_for_every_channel_count() {
        let mut probe = FakeProbe::new(DeviceCaps::default(), &[]);
        let formats = negotiate(&mut probe);
        assert!(formats.r.is_best_effort());
        assert!(formats.rg.is_best_effort());
        assert!(formats.rgba.is_best_effort());
        assert_eq!(formats.r.texel_format(), TexelFormat::Rgba8Unorm);
    }

    #[test]
    fn negotiation_is_deterministic() {
        let working = [TexelFormat::Rg16Float, TexelFormat::Rgba32Float];
        let a = negotiate(&mut FakeProbe::new(DeviceCaps::default(), &working));
        let b = negotiate(&mut FakeProbe::new(DeviceCaps::default(), &working));
        assert_eq!(a, b);
        assert_eq!(a.r.texel_format(), TexelFormat::Rg16Float);
        assert_eq!(a.rgba.texel_format(), TexelFormat::Rgba32Float);
    }
}
