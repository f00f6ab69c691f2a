use std::io::{Error as io_Error};
use std::path::Path;
use std::result::{Result as result_Result};

use image::{DynamicImage, ImageError, ImageReader};
use wgpu::{Extent3d, Origin3d, TexelCopyBufferLayout, TexelCopyTextureInfo, Texture, TextureAspect, TextureDescriptor, TextureDimension, TextureFormat, TextureUsages, TextureView, TextureViewDescriptor};

use crate::config::EyeImagePaths;
use crate::output::OutputInfo;

type Result<T> = result_Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    OpenError(io_Error),
    DecodeError(ImageError),
}

impl From<io_Error> for Error {
    fn from(value: io_Error) -> Self {
        Error::OpenError(value)
    }
}

impl From<ImageError> for Error {
    fn from(value: ImageError) -> Self {
        Error::DecodeError(value)
    }
}

// Vertical flip followed by a quarter turn clockwise, the orientation the eye
// quads expect. Together they transpose: source pixel (x, y) lands at (y, x).
pub fn orient(img: DynamicImage) -> DynamicImage {
    img.flipv().rotate90()
}

pub struct EyeImage {
    _texture: Texture,
    view: TextureView,
}

impl EyeImage {
    fn load(output_info: &OutputInfo, path: &Path) -> Result<Self> {
        let img = ImageReader::open(path)?.decode()?;
        let rgba = orient(img).to_rgba8();
        let (width, height) = rgba.dimensions();

        log::info!("Loaded {} ({}x{} after orientation)", path.display(), width, height);

        let device = output_info.get_device();
        let queue = output_info.get_queue();

        let size = Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        let texture = device.create_texture(&TextureDescriptor {
            label: None,
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });

        queue.write_texture(
            TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            rgba.as_raw(),
            TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            size,
        );

        let view = texture.create_view(&TextureViewDescriptor::default());

        Ok(Self {
            _texture: texture,
            view,
        })
    }

    pub fn get_view(&self) -> &TextureView {
        &self.view
    }
}

// The four comparison images, decoded, oriented and uploaded once at startup.
pub struct ImageSet {
    reference_left: EyeImage,
    reference_right: EyeImage,
    processed_left: EyeImage,
    processed_right: EyeImage,
}

impl ImageSet {
    pub fn load(output_info: &OutputInfo, paths: &EyeImagePaths) -> Result<Self> {
        Ok(Self {
            reference_left: EyeImage::load(output_info, &paths.reference_left)?,
            reference_right: EyeImage::load(output_info, &paths.reference_right)?,
            processed_left: EyeImage::load(output_info, &paths.processed_left)?,
            processed_right: EyeImage::load(output_info, &paths.processed_right)?,
        })
    }

    pub fn get_reference_left(&self) -> &EyeImage {
        &self.reference_left
    }

    pub fn get_reference_right(&self) -> &EyeImage {
        &self.reference_right
    }

    pub fn get_processed_left(&self) -> &EyeImage {
        &self.processed_left
    }

    pub fn get_processed_right(&self) -> &EyeImage {
        &self.processed_right
    }
}
