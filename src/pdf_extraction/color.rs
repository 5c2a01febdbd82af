// Color classification of sampled calendar cells
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{ColorConfig, ColorReference};
use crate::types::AvailabilityStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Euclidean distance in RGB space.
    pub fn distance(&self, sample: [f32; 3]) -> f32 {
        let dr = self.r as f32 - sample[0];
        let dg = self.g as f32 - sample[1];
        let db = self.b as f32 - sample[2];
        (dr * dr + dg * dg + db * db).sqrt()
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self { r, g, b }
    }
}

impl From<Rgb> for [u8; 3] {
    fn from(rgb: Rgb) -> Self {
        [rgb.r, rgb.g, rgb.b]
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rgb({}, {}, {})", self.r, self.g, self.b)
    }
}

/// Nearest-reference classifier with a distance cut-off.
#[derive(Debug, Clone)]
pub struct ColorClassifier {
    references: Vec<ColorReference>,
    threshold: f32,
}

impl ColorClassifier {
    pub fn new(config: &ColorConfig) -> Self {
        Self {
            references: config.references.clone(),
            threshold: config.threshold,
        }
    }

    /// Status of the nearest reference, or `Unknown` when every reference is
    /// farther than the threshold. Ties go to the earlier reference.
    pub fn classify(&self, sample: [f32; 3]) -> AvailabilityStatus {
        let mut best: Option<(f32, AvailabilityStatus)> = None;
        for reference in &self.references {
            let distance = reference.rgb.distance(sample);
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, reference.status));
            }
        }
        match best {
            Some((distance, status)) if distance <= self.threshold => status,
            _ => AvailabilityStatus::Unknown,
        }
    }
}

/// Pixel rectangle, half-open on the right and bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    /// Build from float bounds, clipped to a `width` x `height` image.
    pub fn clipped(x0: f32, y0: f32, x1: f32, y1: f32, width: u32, height: u32) -> Option<PixelRect> {
        let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        let rect = PixelRect {
            x0: clamp(x0.min(x1), width),
            y0: clamp(y0.min(y1), height),
            x1: clamp(x0.max(x1), width),
            y1: clamp(y0.max(y1), height),
        };
        (rect.x1 > rect.x0 && rect.y1 > rect.y0).then_some(rect)
    }

    /// Shrink by `fraction` of the width/height on every side, keeping at
    /// least one pixel.
    pub fn inset(&self, fraction: f32) -> PixelRect {
        let dx = ((self.x1 - self.x0) as f32 * fraction) as u32;
        let dy = ((self.y1 - self.y0) as f32 * fraction) as u32;
        let x0 = (self.x0 + dx).min(self.x1 - 1);
        let y0 = (self.y0 + dy).min(self.y1 - 1);
        PixelRect {
            x0,
            y0,
            x1: (self.x1 - dx).max(x0 + 1),
            y1: (self.y1 - dy).max(y0 + 1),
        }
    }

    fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.y0..self.y1).flat_map(move |y| (self.x0..self.x1).map(move |x| (x, y)))
    }

    fn area(&self) -> u32 {
        (self.x1 - self.x0) * (self.y1 - self.y0)
    }
}

/// Mean color of a block.
pub fn average_color(image: &RgbImage, rect: PixelRect) -> Option<[f32; 3]> {
    if rect.x1 > image.width() || rect.y1 > image.height() || rect.area() == 0 {
        return None;
    }
    let mut sum = [0u64; 3];
    for (x, y) in rect.pixels() {
        let pixel = image.get_pixel(x, y);
        for (total, channel) in sum.iter_mut().zip(pixel.0) {
            *total += channel as u64;
        }
    }
    let count = rect.area() as f32;
    Some(sum.map(|total| total as f32 / count))
}

/// Fraction of the block that any fill, stroke or image painted.
pub fn painted_fraction(coverage: &GrayImage, rect: PixelRect) -> f32 {
    if rect.x1 > coverage.width() || rect.y1 > coverage.height() || rect.area() == 0 {
        return 0.0;
    }
    let painted = rect
        .pixels()
        .filter(|&(x, y)| coverage.get_pixel(x, y).0[0] > 0)
        .count();
    painted as f32 / rect.area() as f32
}

/// A cell sample that passed the coverage check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSample {
    pub color: [f32; 3],
    pub coverage: f32,
}

/// Sample the inner block of a cell; None when it is mostly bare page.
pub fn sample_cell(
    image: &RgbImage,
    coverage: &GrayImage,
    cell: PixelRect,
    inset: f32,
    min_coverage: f32,
) -> Option<CellSample> {
    let block = cell.inset(inset);
    let painted = painted_fraction(coverage, block);
    if painted < min_coverage {
        return None;
    }
    average_color(image, block).map(|color| CellSample { color, coverage: painted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb as Pixel};

    fn classifier(references: Vec<ColorReference>, threshold: f32) -> ColorClassifier {
        ColorClassifier::new(&ColorConfig { threshold, references })
    }

    #[test]
    fn test_exact_reference_color_matches() {
        let classifier = ColorClassifier::new(&ColorConfig::default());
        assert_eq!(classifier.classify([0.0, 255.0, 0.0]), AvailabilityStatus::Available);
        assert_eq!(classifier.classify([255.0, 0.0, 0.0]), AvailabilityStatus::FullyBooked);
        assert_eq!(classifier.classify([255.0, 255.0, 0.0]), AvailabilityStatus::DayUseOnly);
        assert_eq!(classifier.classify([255.0, 255.0, 255.0]), AvailabilityStatus::Closed);
    }

    #[test]
    fn test_far_colors_are_unknown() {
        let classifier = ColorClassifier::new(&ColorConfig::default());
        assert_eq!(classifier.classify([123.0, 45.0, 67.0]), AvailabilityStatus::Unknown);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let classifier = classifier(
            vec![ColorReference::new(AvailabilityStatus::Available, [0, 200, 0])],
            80.0,
        );
        assert_eq!(classifier.classify([0.0, 255.0, 0.0]), AvailabilityStatus::Available);
        assert_eq!(classifier.classify([0.0, 120.0, 0.0]), AvailabilityStatus::Available);
        assert_eq!(classifier.classify([0.0, 119.0, 0.0]), AvailabilityStatus::Unknown);
    }

    #[test]
    fn test_ties_prefer_first_reference() {
        let classifier = classifier(
            vec![
                ColorReference::new(AvailabilityStatus::Available, [0, 100, 0]),
                ColorReference::new(AvailabilityStatus::Closed, [0, 200, 0]),
            ],
            100.0,
        );
        assert_eq!(classifier.classify([0.0, 150.0, 0.0]), AvailabilityStatus::Available);
    }

    #[test]
    fn test_average_and_coverage() {
        let mut image = RgbImage::from_pixel(10, 10, Pixel([255, 255, 255]));
        let mut coverage = GrayImage::new(10, 10);
        for y in 0..10 {
            for x in 0..5 {
                image.put_pixel(x, y, Pixel([0, 255, 0]));
                coverage.put_pixel(x, y, Luma([255]));
            }
        }

        let left = PixelRect { x0: 0, y0: 0, x1: 5, y1: 10 };
        assert_eq!(average_color(&image, left), Some([0.0, 255.0, 0.0]));
        assert_eq!(painted_fraction(&coverage, left), 1.0);

        let whole = PixelRect { x0: 0, y0: 0, x1: 10, y1: 10 };
        assert_eq!(average_color(&image, whole), Some([127.5, 255.0, 127.5]));
        assert_eq!(painted_fraction(&coverage, whole), 0.5);

        let right = PixelRect { x0: 6, y0: 0, x1: 10, y1: 10 };
        assert!(sample_cell(&image, &coverage, right, 0.0, 0.5).is_none());
        assert!(sample_cell(&image, &coverage, left, 0.25, 0.5).is_some());
    }

    #[test]
    fn test_pixel_rect_clipping_and_inset() {
        assert_eq!(
            PixelRect::clipped(-5.0, 2.0, 8.0, 30.0, 10, 20),
            Some(PixelRect { x0: 0, y0: 2, x1: 8, y1: 20 })
        );
        assert_eq!(PixelRect::clipped(12.0, 0.0, 15.0, 5.0, 10, 10), None);

        let rect = PixelRect { x0: 0, y0: 0, x1: 20, y1: 8 };
        assert_eq!(rect.inset(0.25), PixelRect { x0: 5, y0: 2, x1: 15, y1: 6 });
        let tiny = PixelRect { x0: 3, y0: 3, x1: 4, y1: 4 };
        assert_eq!(tiny.inset(0.4), tiny);
    }
}
