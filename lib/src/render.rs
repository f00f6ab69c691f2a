use std::borrow::Cow;
use std::cell::Cell;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use bytemuck::{Pod, Zeroable};
use wgpu::{vertex_attr_array, BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingResource, BindingType, BlendState, Buffer, BufferBindingType, BufferDescriptor, BufferSize, BufferUsages, Color, ColorTargetState, ColorWrites, CommandEncoderDescriptor, CompareFunction, DepthStencilState, Device, Face, FilterMode, FragmentState, FrontFace, IndexFormat, LoadOp, MapMode, MipmapFilterMode, MultisampleState, Operations, PipelineLayoutDescriptor, PolygonMode, PrimitiveState, PrimitiveTopology, QuerySet, QuerySetDescriptor, QueryType, RenderPassColorAttachment, RenderPassDepthStencilAttachment, RenderPassDescriptor, RenderPassTimestampWrites, RenderPipeline, RenderPipelineDescriptor, Sampler, SamplerBindingType, SamplerDescriptor, ShaderModuleDescriptor, ShaderSource, ShaderStages, StoreOp, TextureSampleType, TextureViewDimension, VertexAttribute, VertexBufferLayout, VertexState, VertexStepMode};
use wgpu::util::{BufferInitDescriptor, DeviceExt};

use crate::asset;
use crate::config::AppConfig;
use crate::imageset::{EyeImage, ImageSet};
use crate::output::{Eye, FrameTarget, OutputInfoRc, ViewMat};

const QUERY_COUNT: u32 = 2;
const QUERY_SIZE: u64 = QUERY_COUNT as u64 * mem::size_of::<u64>() as u64;

const UNI_SIZE: u64 = mem::size_of::<Uni>() as u64;

const CLEAR_COLOR: Color = Color {
    r: 0.5,
    g: 0.5,
    b: 0.5,
    a: 1.0,
};

const QUAD_Z: f32 = -2.0;

// Unit quad two meters ahead, each corner pinned to a texture corner. The
// oriented images are uploaded row 0 first and v = 0 addresses row 0, so the
// eyes see the last image row at the top of the view.
const QUAD_VERTEXES: [VertexUv; 4] = [
    VertexUv { pos: [-1.0, -1.0, QUAD_Z], uv: [0.0, 0.0] },
    VertexUv { pos: [1.0, -1.0, QUAD_Z], uv: [1.0, 0.0] },
    VertexUv { pos: [1.0, 1.0, QUAD_Z], uv: [1.0, 1.0] },
    VertexUv { pos: [-1.0, 1.0, QUAD_Z], uv: [0.0, 1.0] },
];

const QUAD_INDEXES: [u16; 6] = [0, 1, 2, 2, 3, 0];

const VERTEX_UV_ATTRS: [VertexAttribute; 2] = vertex_attr_array![ // See vertex shader->@location().
    0 => Float32x3, // pos
    1 => Float32x2, // uv
];

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct VertexUv {
    pos: [f32; 3],
    uv: [f32; 2],
}

// Keep render->Uni and quad.wgsl->Uni in-sync.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct Uni {
    view_m: ViewMat,
}

pub struct Render {
    output_info: OutputInfoRc,
    query_set: QuerySet,
    query_resolve_buf: Buffer,
    query_result_buf: Buffer,
    render_time: Arc<AtomicI32>, // [us]
    vertex_buf: Buffer,
    index_buf: Buffer,
    pipeline: RenderPipeline,
    uni_bufs: [Buffer; 2], // [eye]
    uni_bgs: [BindGroup; 2], // [eye]
    texture_bgs: [[BindGroup; 2]; 2], // [eye][quality: 0 = linear, 1 = anisotropic]
    high_quality: Cell<bool>,
    _images: ImageSet, // Keep all four textures resident for the whole session.
}

impl Render {
    pub fn new(output_info: OutputInfoRc, images: ImageSet, config: &AppConfig) -> Self {
        let device = output_info.get_device();

        // Create query set to measure GPU execution time.

        let query_set = device.create_query_set(&QuerySetDescriptor {
            label: None,
            ty: QueryType::Timestamp,
            count: QUERY_COUNT,
        });

        let query_resolve_buf = device.create_buffer(&BufferDescriptor {
            label: None,
            size: QUERY_SIZE,
            usage: BufferUsages::QUERY_RESOLVE | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let query_result_buf = device.create_buffer(&BufferDescriptor {
            label: None,
            size: QUERY_SIZE,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let render_time = Arc::new(AtomicI32::new(0));

        // Create quad buffers.

        let vertex_buf = device.create_buffer_init(&BufferInitDescriptor {
            label: None,
            contents: bytemuck::cast_slice(&QUAD_VERTEXES),
            usage: BufferUsages::VERTEX,
        });

        let index_buf = device.create_buffer_init(&BufferInitDescriptor {
            label: None,
            contents: bytemuck::cast_slice(&QUAD_INDEXES),
            usage: BufferUsages::INDEX,
        });

        // Allocate uniform buffers, one per eye, so both viewports of a pass
        // can use their own matrix.

        let uni_bufs = [0, 1].map(|_| device.create_buffer(&BufferDescriptor {
            label: None,
            size: UNI_SIZE,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));

        let uni_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: None,
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0, // See vertex shader->@binding().
                    visibility: ShaderStages::VERTEX,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }
            ]
        });

        let uni_bgs = [&uni_bufs[0], &uni_bufs[1]].map(|uni_buf| device.create_bind_group(&BindGroupDescriptor {
            label: None,
            layout: &uni_bg_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: uni_buf.as_entire_binding(),
                }
            ]
        }));

        // Samplers for the two quality levels: plain linear, and linear with
        // 4x anisotropy to reduce peripheral artifacts.

        let linear_sampler = device.create_sampler(&SamplerDescriptor {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });

        let aniso_sampler = device.create_sampler(&SamplerDescriptor {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: MipmapFilterMode::Linear, // anisotropy_clamp > 1 requires all-linear filtering.
            anisotropy_clamp: 4,
            ..Default::default()
        });

        let texture_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
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

        // The comparison pair is crossed: the left eye samples the right
        // reference image and the right eye the left one.

        let texture_bgs = [images.get_reference_right(), images.get_reference_left()].map(|image| {
            [
                create_texture_bg(device, &texture_bg_layout, &linear_sampler, image),
                create_texture_bg(device, &texture_bg_layout, &aniso_sampler, image),
            ]
        });

        // Create pipeline.

        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: None,
            source: ShaderSource::Wgsl(Cow::Owned(asset::read_file("shader/quad.wgsl"))),
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &[
                &uni_bg_layout, // See vertex/fragment shader->@group().
                &texture_bg_layout,
            ],
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: None,
            layout: Some(&pipeline_layout),
            vertex: VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[
                    VertexBufferLayout {
                        array_stride: mem::size_of::<VertexUv>().try_into().unwrap(),
                        step_mode: VertexStepMode::Vertex,
                        attributes: &VERTEX_UV_ATTRS,
                    },
                ],
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(ColorTargetState { // See fragment shader->@location().
                    format: output_info.get_color_format(),
                    blend: Some(BlendState::REPLACE),
                    write_mask: ColorWrites::ALL,
                })],
            }),
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: FrontFace::Ccw,
                cull_mode: Some(Face::Back),
                unclipped_depth: false,
                polygon_mode: PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: Some(DepthStencilState {
                format: output_info.get_depth_format(),
                depth_write_enabled: true,
                depth_compare: CompareFunction::Less,
                stencil: Default::default(),
                bias: Default::default(),
            }),
            multisample: MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview_mask: None,
            cache: None,
        });

        Self {
            output_info,
            query_set,
            query_resolve_buf,
            query_result_buf,
            render_time,
            vertex_buf,
            index_buf,
            pipeline,
            uni_bufs,
            uni_bgs,
            texture_bgs,
            high_quality: Cell::new(config.high_quality),
            _images: images,
        }
    }

    pub fn render(&self, frame: &FrameTarget) {
        let queue = self.output_info.get_queue();

        // Fill uniform buffers. From https://docs.rs/wgpu/latest/wgpu/struct.Queue.html#method.write_buffer_with :
        // "Dropping the QueueWriteBufferView does not submit the transfer to the GPU immediately. The transfer begins only on the next call to Queue::submit() after the view is dropped, just before the explicitly submitted commands."

        for eye in Eye::BOTH {
            let mut uni_buf_view = queue.write_buffer_with(&self.uni_bufs[eye.index()], 0, BufferSize::new(UNI_SIZE).unwrap()).unwrap();

            let uni_buf_sl: &mut [Uni] = bytemuck::cast_slice_mut(&mut uni_buf_view[..]);
            uni_buf_sl[0].view_m = frame.get_view_m(eye);
        }

        let mut do_query = false;

        let render_time = self.render_time.load(Ordering::Relaxed);
        if render_time >= 0 {
            do_query = true;
        }

        // Do render pass. Both eyes render in one pass, restricted to their
        // half of the buffer by viewport and scissor.

        let device = self.output_info.get_device();
        let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
            label: None,
        });

        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: None,
                color_attachments: &[Some(RenderPassColorAttachment { // See fragment shader->@location(0).
                    view: frame.get_color_view(),
                    depth_slice: None,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(CLEAR_COLOR),
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(RenderPassDepthStencilAttachment {
                    view: frame.get_depth_view(),
                    depth_ops: Some(Operations {
                        load: LoadOp::Clear(1.0),
                        store: StoreOp::Discard,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: Some(RenderPassTimestampWrites {
                    query_set: &self.query_set,
                    beginning_of_pass_write_index: Some(0),
                    end_of_pass_write_index: Some(1),
                }),
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_vertex_buffer(0, self.vertex_buf.slice(..));
            render_pass.set_index_buffer(self.index_buf.slice(..), IndexFormat::Uint16);

            let quality = self.high_quality.get() as usize;

            for eye in Eye::BOTH {
                let viewport = frame.get_viewport(eye);

                render_pass.set_viewport(viewport.x as f32, viewport.y as f32, viewport.width as f32, viewport.height as f32, 0.0, 1.0);
                render_pass.set_scissor_rect(viewport.x, viewport.y, viewport.width, viewport.height);

                render_pass.set_bind_group(0, &self.uni_bgs[eye.index()], &[]); // See PipelineLayoutDescriptor->bind_group_layouts.
                render_pass.set_bind_group(1, &self.texture_bgs[eye.index()][quality], &[]);
                render_pass.draw_indexed(0..QUAD_INDEXES.len() as u32, 0, 0..1);
            }
        }

        encoder.resolve_query_set(&self.query_set, 0..QUERY_COUNT, &self.query_resolve_buf, 0);

        if do_query {
            encoder.copy_buffer_to_buffer(&self.query_resolve_buf, 0, &self.query_result_buf, 0, None);
        }

        // Submit.

        queue.submit([encoder.finish()]);

        if do_query {
            self.render_time.store(-1, Ordering::Relaxed);

            let query_result_buf = self.query_result_buf.clone();
            let render_time = Arc::clone(&self.render_time);
            let ts_period = self.output_info.get_queue().get_timestamp_period();

            self.query_result_buf.map_async(MapMode::Read, 0..QUERY_SIZE, move |r| {
                r.expect("Unable to map buffer");

                let t;

                {
                    let buf = query_result_buf.slice(0..QUERY_SIZE).get_mapped_range();
                    let values: &[u64] = bytemuck::cast_slice(&buf);
                    let start = values[0];
                    let end = values[1];
                    t = (end.wrapping_sub(start) as f64 * ts_period as f64 / 1_000.0) as i32;
                    assert!(t >= 0);
                }

                query_result_buf.unmap();
                render_time.store(t, Ordering::Relaxed);
            });
        }
    }

    pub fn set_high_quality(&self, high_quality: bool) {
        self.high_quality.set(high_quality);
    }

    pub fn get_render_time(&self) -> i32 {
        self.render_time.load(Ordering::Relaxed)
    }
}

fn create_texture_bg(device: &Device, layout: &BindGroupLayout, sampler: &Sampler, image: &EyeImage) -> BindGroup {
    device.create_bind_group(&BindGroupDescriptor {
        label: None,
        layout,
        entries: &[
            BindGroupEntry {
                binding: 0,
                resource: BindingResource::Sampler(sampler),
            },
            BindGroupEntry {
                binding: 1,
                resource: BindingResource::TextureView(image.get_view()),
            },
        ],
    })
}
