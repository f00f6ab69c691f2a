use std::borrow::Cow;
use std::cell::RefCell;
use std::result::{Result as result_Result};

use wgpu::{Adapter, BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingResource, BindingType, BlendState, Color, ColorTargetState, ColorWrites, CommandEncoderDescriptor, CompositeAlphaMode, CreateSurfaceError, Device, FilterMode, FragmentState, Instance, LoadOp, MultisampleState, Operations, PipelineLayoutDescriptor, PresentMode, PrimitiveState, Queue, RenderPassColorAttachment, RenderPassDescriptor, RenderPipeline, RenderPipelineDescriptor, SamplerBindingType, SamplerDescriptor, ShaderModuleDescriptor, ShaderSource, ShaderStages, StoreOp, Surface, SurfaceConfiguration, SurfaceError, SurfaceTarget, SurfaceTexture, TextureSampleType, TextureUsages, TextureView, TextureViewDimension, VertexState};

use crate::asset;

type Result<T> = result_Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    SurfaceError(CreateSurfaceError),
    FormatError,
}

impl From<CreateSurfaceError> for Error {
    fn from(value: CreateSurfaceError) -> Self {
        Error::SurfaceError(value)
    }
}

// Desktop copy of the double-wide eye buffer, squeezed into whatever size the
// window has. One bind group per swapchain image, picked by image index.
pub struct MirrorPresenter {
    device: Device,
    queue: Queue,
    surface: Surface<'static>,
    pipeline: RenderPipeline,
    bgs: Box<[BindGroup]>,
    surface_config: RefCell<SurfaceConfiguration>,
}

impl MirrorPresenter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(instance: &Instance, adapter: &Adapter, device: &Device, queue: &Queue, eye_buffer_views: &[TextureView], surface_target: SurfaceTarget<'static>, width: u32, height: u32) -> Result<Self> {
        assert!(width > 0 && height > 0);

        let surface = instance.create_surface(surface_target)?;

        let surface_caps = surface.get_capabilities(adapter);
        let color_format = *surface_caps.formats.iter().find(|format| format.is_srgb()).ok_or(Error::FormatError)?;

        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: color_format,
            width,
            height,
            present_mode: PresentMode::AutoNoVsync, // Frame pacing comes from the compositor wait, not from the window.
            desired_maximum_frame_latency: 2,
            alpha_mode: CompositeAlphaMode::Opaque,
            view_formats: vec![],
        };
        surface.configure(device, &surface_config);

        // Blit pipeline: a fullscreen triangle generated in the vertex shader,
        // sampling the eye buffer. No vertex buffers needed.

        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: None,
            source: ShaderSource::Wgsl(Cow::Owned(asset::read_file("shader/mirror.wgsl"))),
        });

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });

        let bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: None,
            entries: &[
                BindGroupLayoutEntry { // See fragment shader->@binding().
                    binding: 0,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Sampler(SamplerBindingType::Filtering),
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Texture {
                        sample_type: TextureSampleType::Float { filterable: true },
                        view_dimension: TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });

        let bgs = eye_buffer_views.iter().map(|view| {
            device.create_bind_group(&BindGroupDescriptor {
                label: None,
                layout: &bg_layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: BindingResource::Sampler(&sampler),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: BindingResource::TextureView(view),
                    },
                ],
            })
        }).collect();

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &[&bg_layout], // See vertex/fragment shader->@group().
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: None,
            layout: Some(&pipeline_layout),
            vertex: VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(ColorTargetState { // See fragment shader->@location().
                    format: color_format,
                    blend: Some(BlendState::REPLACE),
                    write_mask: ColorWrites::ALL,
                })],
            }),
            primitive: PrimitiveState::default(),
            depth_stencil: None,
            multisample: MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview_mask: None,
            cache: None,
        });

        Ok(Self {
            device: device.clone(),
            queue: queue.clone(),
            surface,
            pipeline,
            bgs,
            surface_config: RefCell::new(surface_config),
        })
    }

    pub fn resize(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }

        let mut surface_config = self.surface_config.borrow_mut();
        surface_config.width = width;
        surface_config.height = height;
        self.surface.configure(&self.device, &surface_config);
    }

    // Encodes and submits the copy of the swapchain image rendered this
    // frame. The caller presents the returned frame once the compositor owns
    // the eye buffer again.
    pub(crate) fn blit(&self, image_index: usize) -> Option<MirrorFrame> {
        let surface_texture = match self.surface.get_current_texture() {
            Ok(surface_texture) => surface_texture,
            Err(SurfaceError::Lost | SurfaceError::Outdated) => {
                self.surface.configure(&self.device, &self.surface_config.borrow());
                return None;
            },
            Err(err) => {
                log::warn!("Mirror frame skipped: {:?}", err);
                return None;
            },
        };

        let color_view = surface_texture.texture.create_view(&Default::default());

        let mut encoder = self.device.create_command_encoder(&CommandEncoderDescriptor {
            label: None,
        });

        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: None,
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &color_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(Color { r: 0.0, g: 0.0, b: 0.0, a: 1.0 }),
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &self.bgs[image_index], &[]);
            render_pass.draw(0..3, 0..1);
        }

        self.queue.submit([encoder.finish()]);

        Some(MirrorFrame {
            surface_texture,
        })
    }
}

pub struct MirrorFrame {
    surface_texture: SurfaceTexture,
}

impl MirrorFrame {
    pub(crate) fn present(self) {
        self.surface_texture.present();
    }
}
