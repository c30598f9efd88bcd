//! The wgpu backend against the CPU reference. Skipped without an adapter.

use ascii_fluid::{
    CpuDevice, FieldData, FieldKind, FluidConfig, FluidSolver, GpuDevice, GridDevice, SplatRequest, SurfaceSize,
};

fn gpu() -> Option<GpuDevice> {
    match pollster::block_on(GpuDevice::headless()) {
        Ok(device) => Some(device),
        Err(e) => {
            println!("SKIP: No GPU adapter available ({:#})", e);
            None
        }
    }
}

fn assert_close(kind: FieldKind, gpu: &FieldData, cpu: &FieldData, relative: f32) {
    assert_eq!((gpu.width, gpu.height), (cpu.width, cpu.height));
    let scale = cpu.max_abs().max(1e-3);
    for (i, (g, c)) in gpu.texels.iter().zip(cpu.texels.iter()).enumerate() {
        for ch in 0..4 {
            let diff = (g[ch] - c[ch]).abs();
            assert!(
                diff <= relative * scale,
                "{:?} texel {} channel {}: gpu {} cpu {}",
                kind,
                i,
                ch,
                g[ch],
                c[ch]
            );
        }
    }
}

fn splats() -> [SplatRequest; 3] {
    [
        SplatRequest {
            position: [0.5, 0.5],
            impulse: [10.0, 0.0],
        },
        SplatRequest {
            position: [0.3, 0.6],
            impulse: [-4.0, 7.0],
        },
        SplatRequest {
            position: [0.7, 0.25],
            impulse: [2.0, -9.0],
        },
    ]
}

#[test]
fn full_step_matches_cpu_reference() {
    let Some(gpu) = gpu() else { return };
    let config = FluidConfig {
        sim_res: 32,
        dye_res: 48,
        curl_strength: 0.0,
        ..FluidConfig::default()
    };
    let surface = SurfaceSize::new(320, 240);

    let mut on_gpu = FluidSolver::new(gpu, config.clone(), surface).unwrap();
    if on_gpu.formats().rgba.is_best_effort() {
        println!("SKIP: adapter has no float render targets");
        return;
    }
    let mut on_cpu = FluidSolver::new(CpuDevice::new(), config, surface).unwrap();
    assert_eq!(on_gpu.fields().sim_size(), on_cpu.fields().sim_size());

    for request in splats() {
        on_gpu.push_splat(request);
        on_cpu.push_splat(request);
    }
    for _ in 0..3 {
        on_gpu.step();
        on_cpu.step();
    }

    for kind in [FieldKind::Velocity, FieldKind::Dye, FieldKind::Pressure, FieldKind::Divergence] {
        let g = on_gpu.read_field(kind).unwrap();
        let c = on_cpu.read_field(kind).unwrap();
        assert_close(kind, &g, &c, 0.02);
    }
}

#[test]
fn vorticity_stays_bounded_on_gpu() {
    let Some(gpu) = gpu() else { return };
    let config = FluidConfig {
        sim_res: 32,
        dye_res: 32,
        ..FluidConfig::default()
    };
    let mut solver = FluidSolver::new(gpu, config, SurfaceSize::square(256)).unwrap();
    for request in splats() {
        solver.push_splat(request);
    }
    for _ in 0..10 {
        solver.step();
    }
    let velocity = solver.read_field(FieldKind::Velocity).unwrap();
    assert!(velocity.texels.iter().flatten().all(|v| v.is_finite()));
    assert!(velocity.max_abs() > 0.0);
    assert!(velocity.max_abs() <= 1000.0);
}

#[test]
fn written_fields_read_back_unchanged() {
    let Some(gpu) = gpu() else { return };
    let config = FluidConfig {
        sim_res: 16,
        dye_res: 16,
        ..FluidConfig::default()
    };
    let mut solver = FluidSolver::new(gpu, config, SurfaceSize::square(64)).unwrap();

    let (w, h) = solver.fields().sim_size();
    let mut data = FieldData::zeroed(w, h);
    for y in 0..h {
        for x in 0..w {
            data.set(x, y, [x as f32 * 0.25 - y as f32 * 0.5, y as f32, 0.0, 0.0]);
        }
    }
    solver.write_field(FieldKind::Velocity, &data).unwrap();
    let read = solver.read_field(FieldKind::Velocity).unwrap();

    let id = solver.fields().current(FieldKind::Velocity);
    let format = solver.device().field_desc(id).unwrap().format;
    let expected = FieldData {
        width: w,
        height: h,
        texels: data.texels.iter().map(|t| ascii_fluid::cpu::quantize(format, *t)).collect(),
    };
    assert_eq!(read, expected);
}
