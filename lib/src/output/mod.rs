use std::rc::Rc;

use wgpu::{Device, Extent3d, Features, Limits, Queue, Texture, TextureDescriptor, TextureDimension, TextureFormat, TextureUsages, TextureView};

mod mirror;
pub use mirror::{MirrorFrame, MirrorPresenter};

mod xr;
pub use xr::{HmdInfo, Poll, XROutput};

const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;
const NEAR_Z: f32 = 0.1;
const FAR_Z: f32 = 100.0;

pub type ViewMat = [[f32; 4]; 4];

pub type OutputInfoRc = Rc<OutputInfo>;

pub struct OutputInfo {
    device: Device,
    queue: Queue,
    color_format: TextureFormat,
    depth_format: TextureFormat,
    buffer_width: u32,
    buffer_height: u32,
}

impl OutputInfo {
    fn new(device: &Device, queue: &Queue, color_format: TextureFormat, depth_format: TextureFormat, buffer_width: u32, buffer_height: u32) -> Self {
        assert!(buffer_width > 0);
        assert!(buffer_height > 0);

        Self {
            device: device.clone(),
            queue: queue.clone(),
            color_format,
            depth_format,
            buffer_width,
            buffer_height,
        }
    }

    pub fn get_device(&self) -> &Device {
        &self.device
    }

    pub fn get_queue(&self) -> &Queue {
        &self.queue
    }

    pub fn get_color_format(&self) -> TextureFormat {
        self.color_format
    }

    pub fn get_depth_format(&self) -> TextureFormat {
        self.depth_format
    }

    pub fn get_buffer_width(&self) -> u32 {
        self.buffer_width
    }

    pub fn get_buffer_height(&self) -> u32 {
        self.buffer_height
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EyeViewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

// Partition of the double-wide eye buffer: the left eye owns the left half,
// the right eye the right half.
pub fn eye_viewports(buffer_width: u32, buffer_height: u32) -> [EyeViewport; 2] {
    assert!(buffer_width % 2 == 0);

    let eye_width = buffer_width / 2;

    [
        EyeViewport {
            x: 0,
            y: 0,
            width: eye_width,
            height: buffer_height,
        },
        EyeViewport {
            x: eye_width,
            y: 0,
            width: eye_width,
            height: buffer_height,
        },
    ]
}

// Everything the renderer needs for one frame: the acquired color target,
// the shared depth target and the per-eye viewports and matrices.
pub struct FrameTarget<'a> {
    color_view: &'a TextureView,
    depth_view: &'a TextureView,
    viewports: [EyeViewport; 2],
    view_m: [ViewMat; 2],
}

impl<'a> FrameTarget<'a> {
    fn new(color_view: &'a TextureView, depth_view: &'a TextureView, viewports: [EyeViewport; 2], view_m: [ViewMat; 2]) -> Self {
        Self {
            color_view,
            depth_view,
            viewports,
            view_m,
        }
    }

    pub fn get_color_view(&self) -> &TextureView {
        self.color_view
    }

    pub fn get_depth_view(&self) -> &TextureView {
        self.depth_view
    }

    pub fn get_viewport(&self, eye: Eye) -> EyeViewport {
        self.viewports[eye.index()]
    }

    pub fn get_view_m(&self, eye: Eye) -> ViewMat {
        self.view_m[eye.index()]
    }
}

fn get_default_features() -> Features {
    Features::default() | Features::TIMESTAMP_QUERY
}

fn get_default_limits() -> Limits {
    Limits::default()
}

fn create_texture(device: &Device, width: u32, height: u32, format: TextureFormat) -> Texture {
    device.create_texture(&TextureDescriptor {
        label: None,
        size: Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format,
        usage: TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    })
}
