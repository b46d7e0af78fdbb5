//! Pixel-layout probing and host/device sample conversion.
//!
//! The device side always works on RGBA. 8-bit images ride `Rgba8Unorm`
//! directly. 16-bit integer samples have no unconditional storage-texture
//! format, so they are widened to f32 on upload and narrowed back on
//! readback; f32 represents every 16-bit value exactly, so permutation
//! round-trips byte-identically. Float images use `Rgba32Float` natively.

use bytemuck::cast_slice;
use image::{DynamicImage, ImageFormat, Rgba32FImage, RgbaImage};

use crate::errors::RenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFormat {
    Rgba8Unorm,
    Rgba32Float,
}

impl DeviceFormat {
    pub fn wgpu_format(self) -> wgpu::TextureFormat {
        match self {
            Self::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            Self::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }

    /// The WGSL storage-texture format name, substituted into the kernel
    /// template at pipeline build time.
    pub fn wgsl_storage_format(self) -> &'static str {
        match self {
            Self::Rgba8Unorm => "rgba8unorm",
            Self::Rgba32Float => "rgba32float",
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8Unorm => 4,
            Self::Rgba32Float => 16,
        }
    }
}

/// Which container the output artifact is encoded into. Lossless
/// high-bit-depth/float/raw sources keep TIFF; everything else gets the
/// more compressed PNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputContainer {
    Png,
    Tiff,
}

impl OutputContainer {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Tiff => "tiff",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelLayout {
    pub width: u32,
    pub height: u32,
    pub bits_per_component: u32,
    pub float: bool,
    /// Whether the source container was TIFF (or another raw-style format).
    pub lossless_source: bool,
}

impl PixelLayout {
    pub fn probe(image: &DynamicImage, source_format: Option<ImageFormat>) -> Result<Self, RenderError> {
        let (bits_per_component, float) = match image {
            DynamicImage::ImageLuma8(_)
            | DynamicImage::ImageLumaA8(_)
            | DynamicImage::ImageRgb8(_)
            | DynamicImage::ImageRgba8(_) => (8, false),
            DynamicImage::ImageLuma16(_)
            | DynamicImage::ImageLumaA16(_)
            | DynamicImage::ImageRgb16(_)
            | DynamicImage::ImageRgba16(_) => (16, false),
            DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => (32, true),
            _ => {
                return Err(RenderError::UnsupportedPixelFormat {
                    bits_per_component: 0,
                    float: false,
                })
            }
        };
        Ok(Self {
            width: image.width(),
            height: image.height(),
            bits_per_component,
            float,
            lossless_source: matches!(source_format, Some(ImageFormat::Tiff)),
        })
    }

    pub fn device_format(&self) -> DeviceFormat {
        if self.bits_per_component == 8 {
            DeviceFormat::Rgba8Unorm
        } else {
            DeviceFormat::Rgba32Float
        }
    }

    pub fn output_container(&self) -> OutputContainer {
        if self.float || self.lossless_source {
            OutputContainer::Tiff
        } else {
            OutputContainer::Png
        }
    }

    pub fn device_bytes_per_row(&self) -> u32 {
        self.width * self.device_format().bytes_per_pixel()
    }

    /// RGBA samples in the device representation, ready for upload.
    pub fn upload_bytes(&self, image: &DynamicImage) -> Vec<u8> {
        match (self.bits_per_component, self.float) {
            (8, _) => image.to_rgba8().into_raw(),
            (16, false) => {
                let widened: Vec<f32> = image
                    .to_rgba16()
                    .into_raw()
                    .into_iter()
                    .map(|value| f32::from(value) / 65535.0)
                    .collect();
                cast_slice(&widened).to_vec()
            }
            _ => cast_slice(&image.to_rgba32f().into_raw()).to_vec(),
        }
    }

    /// Reinterpret device bytes read back from the output buffer as an
    /// image in the source depth.
    pub fn image_from_device_bytes(&self, bytes: Vec<u8>) -> Result<DynamicImage, RenderError> {
        let invalid = || RenderError::TransferFailed("readback size mismatch".to_owned());
        match (self.bits_per_component, self.float) {
            (8, _) => RgbaImage::from_raw(self.width, self.height, bytes)
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(invalid),
            (16, false) => {
                let narrowed: Vec<u16> = float_samples(&bytes)
                    .map(|value| (value.clamp(0.0, 1.0) * 65535.0).round() as u16)
                    .collect();
                image::ImageBuffer::from_raw(self.width, self.height, narrowed)
                    .map(DynamicImage::ImageRgba16)
                    .ok_or_else(invalid)
            }
            _ => {
                let samples: Vec<f32> = float_samples(&bytes).collect();
                Rgba32FImage::from_raw(self.width, self.height, samples)
                    .map(DynamicImage::ImageRgba32F)
                    .ok_or_else(invalid)
            }
        }
    }
}

// Readback buffers carry no alignment guarantee, so decode f32 samples
// bytewise instead of reslicing.
fn float_samples(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_bit_images_stay_on_rgba8() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::new(4, 4));
        let layout = PixelLayout::probe(&image, Some(ImageFormat::Png)).unwrap();
        assert_eq!(layout.device_format(), DeviceFormat::Rgba8Unorm);
        assert_eq!(layout.output_container(), OutputContainer::Png);
        assert_eq!(layout.upload_bytes(&image).len(), 4 * 4 * 4);
    }

    #[test]
    fn sixteen_bit_samples_survive_the_f32_widening_exactly() {
        let mut source = image::ImageBuffer::new(256, 1);
        for (x, _, pixel) in source.enumerate_pixels_mut() {
            let value = (x * 257) as u16;
            *pixel = image::Rgba([value, value ^ 0x00FF, 65535 - value, 65535]);
        }
        let image = DynamicImage::ImageRgba16(source.clone());
        let layout = PixelLayout::probe(&image, None).unwrap();
        assert_eq!(layout.device_format(), DeviceFormat::Rgba32Float);

        let device = layout.upload_bytes(&image);
        let restored = layout.image_from_device_bytes(device).unwrap();
        assert_eq!(restored.to_rgba16().into_raw(), source.into_raw());
    }

    #[test]
    fn float_and_tiff_sources_pick_the_tiff_container() {
        let float_image = DynamicImage::ImageRgba32F(Rgba32FImage::new(2, 2));
        let layout = PixelLayout::probe(&float_image, Some(ImageFormat::Png)).unwrap();
        assert_eq!(layout.output_container(), OutputContainer::Tiff);

        let int_image = DynamicImage::ImageRgba8(RgbaImage::new(2, 2));
        let layout = PixelLayout::probe(&int_image, Some(ImageFormat::Tiff)).unwrap();
        assert_eq!(layout.output_container(), OutputContainer::Tiff);
    }
}
