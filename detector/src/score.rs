use std::io::Cursor;

use cam_motion_common::config::MotionConfig;
use cam_motion_common::frame::Frame;
use image::imageops::FilterType;
use image::{GrayImage, ImageReader};
use tracing::debug;

/// Quantifies visual change between two consecutive frames.
///
/// Implementations must be pure: the same pair always yields the same score,
/// and a frame that cannot be analysed scores 0 rather than failing.
pub trait FrameScorer: Send + Sync {
    fn score(&self, previous: &Frame, current: &Frame) -> u64;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Result of comparing two luma grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Difference {
    /// Pixels whose change exceeded the noise threshold.
    pub changed_pixels: u32,
    /// Sum of the absolute differences of those pixels.
    pub score: u64,
}

/// Thresholded absolute-difference scorer over a downsampled luma grid.
///
/// Both frames are decoded, converted to grayscale and resized to a fixed
/// analysis resolution so the cost does not depend on the camera. Only pixels
/// whose difference exceeds `pixel_threshold` contribute, which lets a few
/// strongly changed pixels outweigh sensor noise spread over the whole image.
pub struct MotionScorer {
    width: u32,
    height: u32,
    pixel_threshold: u8,
}

impl MotionScorer {
    pub fn new(width: u32, height: u32, pixel_threshold: u8) -> Self {
        Self {
            width,
            height,
            pixel_threshold,
        }
    }

    pub fn from_config(config: &MotionConfig) -> Self {
        Self::new(
            config.analysis_width,
            config.analysis_height,
            config.pixel_threshold,
        )
    }

    /// Decode `jpeg_data` into the analysis grid. `None` if it does not decode.
    pub fn luma(&self, jpeg_data: &[u8]) -> Option<GrayImage> {
        let img = ImageReader::new(Cursor::new(jpeg_data))
            .with_guessed_format()
            .ok()?
            .decode()
            .ok()?;

        let gray = img.to_luma8();
        if gray.dimensions() == (self.width, self.height) {
            return Some(gray);
        }
        Some(image::imageops::resize(
            &gray,
            self.width,
            self.height,
            FilterType::Nearest,
        ))
    }

    pub fn compare(&self, previous: &GrayImage, current: &GrayImage) -> Difference {
        if previous.dimensions() != current.dimensions() {
            debug!(
                previous = ?previous.dimensions(),
                current = ?current.dimensions(),
                "grid size mismatch, no comparison"
            );
            return Difference::default();
        }

        let threshold = self.pixel_threshold;
        previous
            .as_raw()
            .iter()
            .zip(current.as_raw())
            .map(|(&a, &b)| a.abs_diff(b))
            .filter(|&diff| diff > threshold)
            .fold(Difference::default(), |acc, diff| Difference {
                changed_pixels: acc.changed_pixels + 1,
                score: acc.score + u64::from(diff),
            })
    }
}

impl FrameScorer for MotionScorer {
    fn score(&self, previous: &Frame, current: &Frame) -> u64 {
        let (Some(a), Some(b)) = (self.luma(previous.data()), self.luma(current.data())) else {
            debug!(
                previous_seq = previous.seq,
                current_seq = current.seq,
                "frame failed to decode, scoring as no motion"
            );
            return 0;
        };

        let diff = self.compare(&a, &b);
        debug!(
            seq = current.seq,
            changed_pixels = diff.changed_pixels,
            score = diff.score,
            "frame difference"
        );
        diff.score
    }

    fn name(&self) -> &str {
        "luma-diff"
    }
}
