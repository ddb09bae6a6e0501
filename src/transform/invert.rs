//! Colour inversion of raster images.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use tracing::{debug, info};

use super::{Transform, TransformError};

/// JPEG quality used for inverted output.
pub const JPEG_QUALITY: u8 = 95;

/// Writes `{prefix}{payload name}` into `output_dir` with every colour inverted.
#[derive(Debug, Clone)]
pub struct InvertTransform {
    output_dir: PathBuf,
    prefix: String,
}

impl InvertTransform {
    pub fn new(output_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Where the output for `input` is written.
    pub fn output_path(&self, input: &Path) -> Result<PathBuf, TransformError> {
        let name = input
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransformError::Other(format!("bad input path {input:?}")))?;
        Ok(self.output_dir.join(format!("{}{name}", self.prefix)))
    }
}

impl Transform for InvertTransform {
    fn transform(&self, input: &Path) -> Result<PathBuf, TransformError> {
        let output = self.output_path(input)?;
        info!(input = %input.display(), "inverting image");

        let bytes = std::fs::read(input)?;
        let decoded = image::load_from_memory(&bytes)?;

        // Only RGB and greyscale are inverted as-is; everything else goes through RGB.
        let mut img = match decoded {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_) => decoded,
            other => DynamicImage::ImageRgb8(other.to_rgb8()),
        };
        img.invert();

        if let Err(e) = save(&img, &output) {
            let _ = std::fs::remove_file(&output);
            return Err(e);
        }

        debug!(output = %output.display(), "inverted image saved");
        Ok(output)
    }
}

fn save(img: &DynamicImage, output: &Path) -> Result<(), TransformError> {
    let format = ImageFormat::from_path(output)?;
    if format == ImageFormat::Jpeg {
        let writer = BufWriter::new(File::create(output)?);
        img.write_with_encoder(JpegEncoder::new_with_quality(writer, JPEG_QUALITY))?;
    } else {
        img.save_with_format(output, format)?;
    }
    Ok(())
}
