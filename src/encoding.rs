//! Output-artifact encoding.
//!
//! The core only decides which container to request (see
//! [`PixelLayout::output_container`]) and hands the codec a compression
//! hint; the byte format itself belongs to the `image` crate.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytemuck::cast_slice;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::tiff::TiffEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};

use crate::errors::RenderError;
use crate::layout::{OutputContainer, PixelLayout};

/// Encode `image` into `output_dir` using the container derived from
/// `layout`, returning the written path.
///
/// The directory was prepared when the run started; if it has vanished
/// since, the write is not attempted and [`RenderError::FileModified`] is
/// reported instead.
pub fn write_output(
    output_dir: &Path,
    layout: &PixelLayout,
    image: &DynamicImage,
) -> Result<PathBuf> {
    let container = layout.output_container();
    let path = output_dir.join(format!("output.{}", container.extension()));
    if !output_dir.is_dir() {
        return Err(RenderError::FileModified(output_dir.to_path_buf()))
            .context("output directory disappeared before the write");
    }

    let file = File::create(&path)
        .map_err(|_| RenderError::FileModified(path.clone()))
        .with_context(|| format!("failed creating {}", path.display()))?;
    let writer = BufWriter::new(file);

    let (bytes, color): (&[u8], ExtendedColorType) = match image {
        DynamicImage::ImageRgba8(buffer) => (buffer.as_raw(), ExtendedColorType::Rgba8),
        DynamicImage::ImageRgba16(buffer) => {
            (cast_slice(buffer.as_raw()), ExtendedColorType::Rgba16)
        }
        DynamicImage::ImageRgba32F(buffer) => {
            (cast_slice(buffer.as_raw()), ExtendedColorType::Rgba32F)
        }
        other => {
            return Err(anyhow::anyhow!(
                "engine produced an unexpected pixel buffer: {other:?}"
            ))
        }
    };

    match container {
        OutputContainer::Png => {
            PngEncoder::new_with_quality(writer, CompressionType::Best, FilterType::Adaptive)
                .write_image(bytes, layout.width, layout.height, color)
                .context("failed encoding PNG output")?;
        }
        OutputContainer::Tiff => {
            TiffEncoder::new(writer)
                .write_image(bytes, layout.width, layout.height, color)
                .context("failed encoding TIFF output")?;
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;
    use crate::errors::find_render_error;

    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 0, 128, 255])
            } else {
                Rgba([0, 64, 255, 255])
            }
        }))
    }

    #[test]
    fn writes_png_for_eight_bit_sources() {
        let dir = tempfile::tempdir().unwrap();
        let image = checkerboard(8, 6);
        let layout = PixelLayout::probe(&image, Some(ImageFormat::Png)).unwrap();

        let path = write_output(dir.path(), &layout, &image).unwrap();
        assert_eq!(path.file_name().unwrap(), "output.png");
        let reloaded = image::open(&path).unwrap();
        assert_eq!(reloaded.to_rgba8().as_raw(), image.to_rgba8().as_raw());
    }

    #[test]
    fn tiff_sources_keep_the_tiff_container() {
        let dir = tempfile::tempdir().unwrap();
        let image = checkerboard(4, 4);
        let layout = PixelLayout::probe(&image, Some(ImageFormat::Tiff)).unwrap();

        let path = write_output(dir.path(), &layout, &image).unwrap();
        assert_eq!(path.file_name().unwrap(), "output.tiff");
    }

    #[test]
    fn vanished_output_directory_is_reported_as_file_modified() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nested");
        let image = checkerboard(4, 4);
        let layout = PixelLayout::probe(&image, None).unwrap();

        let err = write_output(&gone, &layout, &image).unwrap_err();
        assert!(matches!(
            find_render_error(&err),
            Some(RenderError::FileModified(_))
        ));
    }
}
