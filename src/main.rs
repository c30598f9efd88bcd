// ascii-fluid - grid fluid solver behind a pointer-reactive ASCII visual
// Licensed under MIT License

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ascii_fluid::gpu::request_device;
use ascii_fluid::{FieldId, FluidConfig, FluidSolver, GpuDevice, PointerTracker, SurfaceSize};
use egui_wgpu::ScreenDescriptor;
use winit::{
    event::{ElementState, Event, KeyEvent, WindowEvent},
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::Window,
};

/// 30 FPS cap.
const FRAME_TIME: Duration = Duration::from_micros(33_333);

/// Draws the dye field over the whole surface.
struct DisplayPass {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    // Dye alternates between its two buffers, so at most two live entries.
    bind_groups: HashMap<FieldId, wgpu::BindGroup>,
}

impl DisplayPass {
    fn new(device: &wgpu::Device, surface_format: wgpu::TextureFormat, filterable: bool) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Display Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/display.wgsl").into()),
        });

        let sampler_type = if filterable {
            wgpu::SamplerBindingType::Filtering
        } else {
            wgpu::SamplerBindingType::NonFiltering
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Display Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(sampler_type),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Display Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Display Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Self {
            pipeline,
            bind_group_layout,
            bind_groups: HashMap::new(),
        }
    }

    /// Builds the bind group for `dye` if this buffer has not been seen yet.
    fn prepare(&mut self, gpu: &GpuDevice, dye: FieldId) {
        if self.bind_groups.contains_key(&dye) {
            return;
        }
        let (Some(view), Some(sampler)) = (gpu.texture_view(dye), gpu.sampler(dye)) else {
            return;
        };
        // Anything cached belongs to a released field set.
        if self.bind_groups.len() >= 2 {
            self.bind_groups.clear();
        }
        let bind_group = gpu.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Display Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        });
        self.bind_groups.insert(dye, bind_group);
    }

    fn draw(&self, rpass: &mut wgpu::RenderPass<'_>, dye: FieldId) {
        if let Some(bind_group) = self.bind_groups.get(&dye) {
            rpass.set_pipeline(&self.pipeline);
            rpass.set_bind_group(0, bind_group, &[]);
            rpass.draw(0..6, 0..1);
        }
    }
}

enum PanelAction {
    Reset,
    Defaults,
    Reload,
}

struct App {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
    solver: FluidSolver<GpuDevice>,
    display: DisplayPass,
    egui_renderer: egui_wgpu::Renderer,

    pointer: PointerTracker,
    started: Instant,
    ui_visible: bool,
    draft: FluidConfig,
    settings_path: PathBuf,
    last_saved_config: FluidConfig,

    last_frame_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    fps: f32,
}

impl App {
    async fn new(window: Arc<Window>) -> Result<Self> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let surface = instance
            .create_surface(window.clone())
            .context("failed to create surface")?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("no compatible GPU adapter found")?;
        let (device, queue) = request_device(&adapter).await?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .unwrap_or(surface_caps.formats[0]);
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let egui_renderer = egui_wgpu::Renderer::new(&device, surface_format, None, 1, false);

        let settings_path = FluidConfig::default_path();
        let config = if settings_path.exists() {
            FluidConfig::load_from_disk(&settings_path).unwrap_or_else(|err| {
                log::warn!("ignoring {:?}: {:#}", settings_path, err);
                FluidConfig::default()
            })
        } else {
            FluidConfig::default()
        };

        let gpu = GpuDevice::new(&adapter, device, queue);
        let solver = FluidSolver::new(
            gpu,
            config,
            SurfaceSize::new(surface_config.width, surface_config.height),
        )?;
        let display = DisplayPass::new(
            solver.device().device(),
            surface_format,
            solver.formats().linear_filtering,
        );

        let draft = solver.config().clone();
        Ok(Self {
            window,
            surface,
            surface_config,
            solver,
            display,
            egui_renderer,
            pointer: PointerTracker::new(),
            started: Instant::now(),
            ui_visible: true,
            last_saved_config: draft.clone(),
            draft,
            settings_path,
            last_frame_time: Instant::now(),
            frame_count: 0,
            last_fps_update: Instant::now(),
            fps: 0.0,
        })
    }

    fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) -> Result<()> {
        if new_size.width == 0 || new_size.height == 0 {
            return Ok(());
        }
        self.surface_config.width = new_size.width;
        self.surface_config.height = new_size.height;
        self.surface.configure(self.solver.device().device(), &self.surface_config);
        self.pointer.reset();
        self.solver
            .resize(SurfaceSize::new(new_size.width, new_size.height))
    }

    fn pointer_moved(&mut self, x: f32, y: f32) {
        let timestamp_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        if let Some(motion) = self.pointer.sample(x, y, timestamp_ms) {
            self.solver.enqueue(motion);
        }
    }

    /// Sleeps off the rest of the frame budget.
    fn limit_frame_rate(&mut self) {
        let elapsed = self.last_frame_time.elapsed();
        if elapsed < FRAME_TIME {
            std::thread::sleep(FRAME_TIME - elapsed);
        }
        self.last_frame_time = Instant::now();

        self.frame_count += 1;
        let since_update = self.last_fps_update.elapsed().as_secs_f32();
        if since_update >= 1.0 {
            self.fps = self.frame_count as f32 / since_update;
            self.window
                .set_title(&format!("ascii-fluid - {:.1} FPS", self.fps));
            self.frame_count = 0;
            self.last_fps_update = Instant::now();
        }
    }

    fn ui(&mut self, ctx: &egui::Context) -> Option<PanelAction> {
        if !self.ui_visible {
            return None;
        }
        let mut action = None;
        let mut resolution_dragging = false;
        let formats = *self.solver.formats();
        let activity = self.solver.splat_queue().activity();
        let (sim_w, sim_h) = self.solver.fields().sim_size();
        let (dye_w, dye_h) = self.solver.fields().dye_size();

        egui::Window::new("Fluid")
            .default_width(280.0)
            .resizable(false)
            .show(ctx, |ui| {
                let draft = &mut self.draft;
                let sim = ui.add(egui::Slider::new(&mut draft.sim_res, 16..=512).text("sim resolution"));
                let dye = ui.add(egui::Slider::new(&mut draft.dye_res, 64..=2048).text("dye resolution"));
                resolution_dragging = sim.dragged() || dye.dragged();
                ui.add(egui::Slider::new(&mut draft.iterations, 0..=60).text("pressure iterations"));
                ui.add(egui::Slider::new(&mut draft.decay, 0.5..=1.0).text("dye decay"));
                ui.add(
                    egui::Slider::new(&mut draft.velocity_dissipation, 0.5..=1.0).text("velocity dissipation"),
                );
                ui.add(
                    egui::Slider::new(&mut draft.pressure_dissipation, 0.0..=1.0).text("pressure dissipation"),
                );
                ui.add(egui::Slider::new(&mut draft.curl_strength, 0.0..=100.0).text("curl"));
                ui.add(egui::Slider::new(&mut draft.radius, 0.01..=0.5).text("splat radius"));

                ui.separator();
                ui.horizontal(|ui| {
                    if ui.button("Reset").clicked() {
                        action = Some(PanelAction::Reset);
                    }
                    if ui.button("Defaults").clicked() {
                        action = Some(PanelAction::Defaults);
                    }
                    if ui.button("Reload settings").clicked() {
                        action = Some(PanelAction::Reload);
                    }
                });

                ui.separator();
                ui.label(format!("grid {}x{}, dye {}x{}", sim_w, sim_h, dye_w, dye_h));
                ui.label(format!(
                    "formats: rgba {:?}, rg {:?}, r {:?}",
                    formats.rgba.texel_format(),
                    formats.rg.texel_format(),
                    formats.r.texel_format()
                ));
                ui.label(format!(
                    "dye filtering: {}",
                    if formats.linear_filtering { "linear" } else { "nearest" }
                ));
                ui.label(format!("activity {:.2}, {:.1} FPS", activity, self.fps));
                ui.label("Space toggles this panel, R resets.");
            });

        if !resolution_dragging && self.draft != *self.solver.config() {
            self.apply_draft();
        }
        action
    }

    fn apply_draft(&mut self) {
        if let Err(err) = self.solver.reconfigure(self.draft.clone()) {
            log::error!("reconfiguration failed: {:#}", err);
        }
        self.draft = self.solver.config().clone();
    }

    fn handle_action(&mut self, action: PanelAction) -> Result<()> {
        match action {
            PanelAction::Reset => self.solver.reset()?,
            PanelAction::Defaults => {
                self.draft = FluidConfig::default();
                self.apply_draft();
            }
            PanelAction::Reload => match FluidConfig::load_from_disk(&self.settings_path) {
                Ok(config) => {
                    self.draft = config;
                    self.apply_draft();
                }
                Err(err) => log::warn!("failed to load {:?}: {:#}", self.settings_path, err),
            },
        }
        Ok(())
    }

    fn persist_settings_if_changed(&mut self) {
        let current = self.solver.config().clone();
        if current != self.last_saved_config {
            if let Err(err) = current.save_to_disk(&self.settings_path) {
                log::warn!("failed to write settings to {:?}: {:#}", self.settings_path, err);
            }
            self.last_saved_config = current;
        }
    }

    fn render(
        &mut self,
        clipped_primitives: Vec<egui::ClippedPrimitive>,
        textures_delta: egui::TexturesDelta,
        screen_descriptor: ScreenDescriptor,
    ) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let dye = self.solver.dye();
        let gpu = self.solver.device();
        let device = gpu.device();
        let queue = gpu.queue();
        self.display.prepare(gpu, dye);

        for (id, image_delta) in &textures_delta.set {
            self.egui_renderer
                .update_texture(device, queue, *id, image_delta);
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Render Encoder"),
        });
        self.egui_renderer.update_buffers(
            device,
            queue,
            &mut encoder,
            &clipped_primitives,
            &screen_descriptor,
        );

        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Dye Display"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            self.display.draw(&mut rpass, dye);
        }

        {
            let mut rpass = encoder
                .begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("egui Render Pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                })
                .forget_lifetime();
            self.egui_renderer
                .render(&mut rpass, &clipped_primitives, &screen_descriptor);
        }

        for id in &textures_delta.free {
            self.egui_renderer.free_texture(id);
        }

        queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}

fn main() -> Result<()> {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    let window = Arc::new(
        event_loop
            .create_window(
                winit::window::WindowAttributes::default()
                    .with_title("ascii-fluid")
                    .with_inner_size(winit::dpi::LogicalSize::new(1024, 640)),
            )
            .context("failed to create window")?,
    );

    let mut app = pollster::block_on(App::new(window.clone()))?;
    let mut egui_state = egui_winit::State::new(
        egui::Context::default(),
        egui::ViewportId::ROOT,
        &window,
        None,
        None,
        None,
    );

    event_loop.run(move |event, target| match event {
        Event::WindowEvent { event, window_id } if window_id == window.id() => {
            let response = egui_state.on_window_event(&window, &event);

            match event {
                WindowEvent::CloseRequested => target.exit(),
                WindowEvent::Resized(physical_size) => {
                    if let Err(err) = app.resize(physical_size) {
                        log::error!("{:#}", err);
                        target.exit();
                    }
                }
                WindowEvent::CursorMoved { position, .. } => {
                    if egui_state.egui_ctx().wants_pointer_input() {
                        app.pointer.reset();
                    } else {
                        app.pointer_moved(position.x as f32, position.y as f32);
                    }
                }
                WindowEvent::CursorLeft { .. } => app.pointer.reset(),
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key,
                            state: ElementState::Pressed,
                            ..
                        },
                    ..
                } if !response.consumed => match physical_key {
                    PhysicalKey::Code(KeyCode::Space) => app.ui_visible = !app.ui_visible,
                    PhysicalKey::Code(KeyCode::KeyR) => {
                        if let Err(err) = app.handle_action(PanelAction::Reset) {
                            log::error!("{:#}", err);
                            target.exit();
                        }
                    }
                    _ => {}
                },
                WindowEvent::RedrawRequested => {
                    app.limit_frame_rate();
                    app.solver.step();

                    let raw_input = egui_state.take_egui_input(&window);
                    let mut action = None;
                    let full_output = egui_state.egui_ctx().run(raw_input, |ctx| {
                        action = app.ui(ctx);
                    });
                    egui_state.handle_platform_output(&window, full_output.platform_output);

                    if let Some(action) = action {
                        if let Err(err) = app.handle_action(action) {
                            log::error!("{:#}", err);
                            target.exit();
                            return;
                        }
                    }
                    app.persist_settings_if_changed();

                    let clipped_primitives = egui_state
                        .egui_ctx()
                        .tessellate(full_output.shapes, full_output.pixels_per_point);
                    let screen_descriptor = ScreenDescriptor {
                        size_in_pixels: [app.surface_config.width, app.surface_config.height],
                        pixels_per_point: window.scale_factor() as f32,
                    };

                    match app.render(clipped_primitives, full_output.textures_delta, screen_descriptor) {
                        Ok(_) => {}
                        Err(wgpu::SurfaceError::Lost) => {
                            if let Err(err) = app.resize(window.inner_size()) {
                                log::error!("{:#}", err);
                                target.exit();
                            }
                        }
                        Err(wgpu::SurfaceError::Outdated) => {}
                        Err(wgpu::SurfaceError::OutOfMemory) => target.exit(),
                        Err(e) => log::warn!("{:?}", e),
                    }
                }
                _ => {}
            }
        }
        Event::AboutToWait => window.request_redraw(),
        _ => {}
    })?;

    Ok(())
}
