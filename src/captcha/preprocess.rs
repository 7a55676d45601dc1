use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::contrast::{equalize_histogram, otsu_level};
use imageproc::definitions::Image;
use imageproc::distance_transform::Norm;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use imageproc::geometry::min_area_rect;
use imageproc::integral_image::{integral_image, sum_image_pixels};
use imageproc::morphology::close;
use imageproc::point::Point;
use imageproc::region_labelling::{connected_components, Connectivity};
use tracing::debug;

use super::{CaptchaImage, ImageVariant, PipelineId};
use crate::config::SolverConfig;

pub const INK: u8 = 0;
pub const PAPER: u8 = 255;

/// Skew below this many degrees is left alone.
const MIN_DESKEW_DEGREES: f32 = 0.5;
/// Minimum foreground pixels needed to trust a skew estimate.
const MIN_DESKEW_POINTS: usize = 10;
/// Minimum run length (upscaled pixels) of a stroke treated as a grid line.
const MIN_LINE_RUN: u32 = 25;

#[derive(Debug, Clone, Copy)]
enum Contrast {
    None,
    Equalize,
}

#[derive(Debug, Clone, Copy)]
enum Prefilter {
    None,
    Median(u32),
    Gaussian(f32),
}

#[derive(Debug, Clone, Copy)]
enum Binarize {
    Otsu { invert: bool },
    Adaptive { block_radius: u32, offset: i32 },
}

/// One transformation chain from grayscale to a binary variant.
#[derive(Debug, Clone, Copy)]
struct PipelineSpec {
    id: PipelineId,
    contrast: Contrast,
    prefilter: Prefilter,
    binarize: Binarize,
    min_speck_area: Option<u32>,
    remove_lines: bool,
}

const ADAPTIVE: Binarize = Binarize::Adaptive {
    block_radius: 15,
    offset: 10,
};

/// Ordered from the most to the least reliable chain on the portals seen so far.
const PIPELINES: [PipelineSpec; 6] = [
    PipelineSpec {
        id: PipelineId::EqualizedOtsuLines,
        contrast: Contrast::Equalize,
        prefilter: Prefilter::None,
        binarize: Binarize::Otsu { invert: false },
        min_speck_area: Some(40),
        remove_lines: true,
    },
    // Polarity is restored afterwards, so refining the inverted classes
    // opens the glyphs: narrow gaps between strokes survive instead of being closed.
    PipelineSpec {
        id: PipelineId::EqualizedOtsuInverted,
        contrast: Contrast::Equalize,
        prefilter: Prefilter::None,
        binarize: Binarize::Otsu { invert: true },
        min_speck_area: Some(40),
        remove_lines: false,
    },
    PipelineSpec {
        id: PipelineId::Adaptive,
        contrast: Contrast::None,
        prefilter: Prefilter::None,
        binarize: ADAPTIVE,
        min_speck_area: Some(50),
        remove_lines: false,
    },
    PipelineSpec {
        id: PipelineId::OtsuLines,
        contrast: Contrast::None,
        prefilter: Prefilter::None,
        binarize: Binarize::Otsu { invert: false },
        min_speck_area: None,
        remove_lines: true,
    },
    PipelineSpec {
        id: PipelineId::MedianAdaptive,
        contrast: Contrast::None,
        prefilter: Prefilter::Median(2),
        binarize: ADAPTIVE,
        min_speck_area: Some(60),
        remove_lines: false,
    },
    PipelineSpec {
        id: PipelineId::SmoothedOtsu,
        contrast: Contrast::None,
        prefilter: Prefilter::Gaussian(1.5),
        binarize: Binarize::Otsu { invert: false },
        min_speck_area: Some(40),
        remove_lines: false,
    },
];

/// Turns a raw captcha into a handful of binary variants for the OCR ensemble.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    max_variants: usize,
    upscale: f32,
    deskew: bool,
}

impl ImagePreprocessor {
    pub fn new(max_variants: usize, upscale: f32, deskew: bool) -> Self {
        Self {
            max_variants: max_variants.clamp(1, PIPELINES.len()),
            upscale,
            deskew,
        }
    }

    pub fn from_config(config: &SolverConfig) -> Self {
        Self::new(config.max_pipelines, config.upscale, config.deskew)
    }

    pub fn variants(&self, image: &CaptchaImage) -> Vec<ImageVariant> {
        let mut gray = image.pixels().to_luma8();
        if self.deskew {
            gray = deskew(&gray);
        }
        let gray = upscale(&gray, self.upscale);

        PIPELINES
            .iter()
            .take(self.max_variants)
            .map(|spec| {
                let pixels = run_pipeline(&gray, spec);
                debug!("Pipeline {} produced {}x{} variant", spec.id, pixels.width(), pixels.height());
                ImageVariant {
                    pixels,
                    pipeline: spec.id,
                }
            })
            .collect()
    }
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::from_config(&SolverConfig::default())
    }
}

fn run_pipeline(gray: &GrayImage, spec: &PipelineSpec) -> GrayImage {
    let contrasted = match spec.contrast {
        Contrast::None => gray.clone(),
        Contrast::Equalize => equalize_histogram(gray),
    };

    let filtered = match spec.prefilter {
        Prefilter::None => contrasted,
        Prefilter::Median(radius) => median_filter(&contrasted, radius, radius),
        Prefilter::Gaussian(sigma) => gaussian_blur_f32(&contrasted, sigma),
    };

    let mut binary = match spec.binarize {
        Binarize::Otsu { invert } => otsu_binarize(&filtered, invert),
        Binarize::Adaptive {
            block_radius,
            offset,
        } => adaptive_binarize(&filtered, block_radius, offset),
    };

    if let Some(area) = spec.min_speck_area {
        binary = remove_small_specks(&binary, area);
    }
    if spec.remove_lines {
        binary = remove_lines(&binary);
    }
    let refined = morph_refine(&binary);
    normalize_polarity(refined)
}

pub fn upscale(gray: &GrayImage, factor: f32) -> GrayImage {
    if factor <= 1.0 {
        return gray.clone();
    }
    let width = ((gray.width() as f32) * factor).round().max(1.0) as u32;
    let height = ((gray.height() as f32) * factor).round().max(1.0) as u32;
    imageops::resize(gray, width, height, FilterType::CatmullRom)
}

/// Global Otsu threshold: pixels above the level become paper, the rest ink.
pub fn otsu_binarize(gray: &GrayImage, invert: bool) -> GrayImage {
    let level = otsu_level(gray);
    let (above, below) = if invert { (INK, PAPER) } else { (PAPER, INK) };
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] > level {
            Luma([above])
        } else {
            Luma([below])
        }
    })
}

/// Local mean threshold over a `(2r+1)²` window, minus `offset`.
pub fn adaptive_binarize(gray: &GrayImage, block_radius: u32, offset: i32) -> GrayImage {
    let (width, height) = gray.dimensions();
    let table: Image<Luma<u64>> = integral_image(gray);
    ImageBuffer::from_fn(width, height, |x, y| {
        let x0 = x.saturating_sub(block_radius);
        let y0 = y.saturating_sub(block_radius);
        let x1 = (x + block_radius).min(width - 1);
        let y1 = (y + block_radius).min(height - 1);
        let area = ((x1 - x0 + 1) * (y1 - y0 + 1)) as i64;
        let sum = sum_image_pixels(&table, x0, y0, x1, y1)[0] as i64;
        let mean = sum / area;
        let value = gray.get_pixel(x, y)[0] as i64;
        if value > mean - offset as i64 {
            Luma([PAPER])
        } else {
            Luma([INK])
        }
    })
}

/// Erases 8-connected ink blobs smaller than `min_area` pixels.
pub fn remove_small_specks(binary: &GrayImage, min_area: u32) -> GrayImage {
    let labels = connected_components(binary, Connectivity::Eight, Luma([PAPER]));
    let max_label = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    if max_label == 0 {
        return binary.clone();
    }

    let mut areas = vec![0u32; max_label + 1];
    for p in labels.pixels() {
        areas[p[0] as usize] += 1;
    }

    let mut cleaned = binary.clone();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label != 0 && areas[label] < min_area {
            cleaned.put_pixel(x, y, Luma([PAPER]));
        }
    }
    cleaned
}

/// Erases long horizontal and vertical ink strokes (grid lines).
///
/// Equivalent to a binary opening with a 1xN line element: any straight run
/// of ink at least as long as the threshold is removed.
pub fn remove_lines(binary: &GrayImage) -> GrayImage {
    let (width, height) = binary.dimensions();
    let min_horizontal = MIN_LINE_RUN.max(width / 3);
    let min_vertical = MIN_LINE_RUN.max(height * 4 / 5);
    let is_ink = |x: u32, y: u32| binary.get_pixel(x, y)[0] == INK;

    let mut cleaned = binary.clone();

    for y in 0..height {
        let mut start = 0;
        while start < width {
            if !is_ink(start, y) {
                start += 1;
                continue;
            }
            let mut end = start;
            while end < width && is_ink(end, y) {
                end += 1;
            }
            if end - start >= min_horizontal {
                for x in start..end {
                    cleaned.put_pixel(x, y, Luma([PAPER]));
                }
            }
            start = end;
        }
    }

    for x in 0..width {
        let mut start = 0;
        while start < height {
            if !is_ink(x, start) {
                start += 1;
                continue;
            }
            let mut end = start;
            while end < height && is_ink(x, end) {
                end += 1;
            }
            if end - start >= min_vertical {
                for y in start..end {
                    cleaned.put_pixel(x, y, Luma([PAPER]));
                }
            }
            start = end;
        }
    }

    cleaned
}

/// Closing on the ink class followed by a 3x3 median.
pub fn morph_refine(binary: &GrayImage) -> GrayImage {
    let ink_mask = invert(binary);
    let closed = close(&ink_mask, Norm::LInf, 1);
    median_filter(&invert(&closed), 1, 1)
}

/// Ink must be the minority class; flips the image otherwise.
pub fn normalize_polarity(binary: GrayImage) -> GrayImage {
    let ink = binary.pixels().filter(|p| p[0] == INK).count();
    let total = (binary.width() * binary.height()) as usize;
    if ink * 2 > total {
        invert(&binary)
    } else {
        binary
    }
}

fn invert(binary: &GrayImage) -> GrayImage {
    ImageBuffer::from_fn(binary.width(), binary.height(), |x, y| {
        Luma([PAPER - binary.get_pixel(x, y)[0]])
    })
}

/// Estimated text skew in degrees, normalised to (-45, 45].
pub fn estimate_skew(gray: &GrayImage) -> Option<f32> {
    let level = otsu_level(gray);
    let points: Vec<Point<i32>> = gray
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] <= level)
        .map(|(x, y, _)| Point::new(x as i32, y as i32))
        .collect();

    // A uniformly dark image has no foreground worth measuring.
    if points.len() < MIN_DESKEW_POINTS || points.len() == (gray.width() * gray.height()) as usize
    {
        return None;
    }

    // Measure along the long side; the short side of a thin text band is
    // only a few pixels and its integer corners are too coarse.
    let corners = min_area_rect(&points);
    let edge = |a: usize, b: usize| {
        (
            (corners[b].x - corners[a].x) as f32,
            (corners[b].y - corners[a].y) as f32,
        )
    };
    let (ax, ay) = edge(0, 1);
    let (bx, by) = edge(1, 2);
    let (dx, dy) = if ax * ax + ay * ay >= bx * bx + by * by {
        (ax, ay)
    } else {
        (bx, by)
    };
    if dx == 0.0 && dy == 0.0 {
        return None;
    }

    let mut angle = dy.atan2(dx).to_degrees();
    while angle > 45.0 {
        angle -= 90.0;
    }
    while angle <= -45.0 {
        angle += 90.0;
    }
    Some(angle)
}

pub fn deskew(gray: &GrayImage) -> GrayImage {
    match estimate_skew(gray) {
        Some(angle) if angle.abs() >= MIN_DESKEW_DEGREES => {
            debug!("Deskewing captcha by {:.2} degrees", angle);
            rotate_replicate(gray, -angle)
        }
        _ => gray.clone(),
    }
}

/// Rotates about the centre with bilinear sampling; out-of-range samples
/// repeat the nearest edge pixel.
pub fn rotate_replicate(gray: &GrayImage, degrees: f32) -> GrayImage {
    let (width, height) = gray.dimensions();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;

    ImageBuffer::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        // Inverse mapping from destination to source.
        let sx = (cos * dx + sin * dy + cx).clamp(0.0, max_x);
        let sy = (-sin * dx + cos * dy + cy).clamp(0.0, max_y);

        let x0 = sx.floor() as u32;
        let y0 = sy.floor() as u32;
        let x1 = (x0 + 1).min(width - 1);
        let y1 = (y0 + 1).min(height - 1);
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f32;
        let top = px(x0, y0) * (1.0 - fx) + px(x1, y0) * fx;
        let bottom = px(x0, y1) * (1.0 - fx) + px(x1, y1) * fx;
        Luma([(top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8])
    })
}
