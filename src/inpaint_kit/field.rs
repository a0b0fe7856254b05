use std::path::Path;

use image::{Luma, Rgb};
use imageproc::definitions::Image;
use itertools::iproduct;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use crate::error::NnfError;
use crate::utils::{Rect, MASK_ALLOWED_THRESHOLD, PATCH_SIDE};

/// Absolute source patch center chosen for one target patch center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point16 {
    pub x: i16,
    pub y: i16,
}

impl Point16 {
    #[inline]
    #[must_use]
    pub const fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }
}

/// Nearest-neighbor field: one chosen source patch center per target pixel.
///
/// Entries are meaningful inside the target's patch-center rectangle; the
/// border entries exist only so the field can be stored and resized as a
/// plain image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetField {
    width: u32,
    height: u32,
    data: Vec<Point16>,
}

/// Collects every patch center the mask allows.
pub(crate) fn allowed_centers(mask: &Image<Luma<u8>>, rect: Rect) -> Vec<Point16> {
    let mut centers = Vec::new();
    iproduct!(rect.top..rect.bottom, rect.left..rect.right).for_each(|(y, x)| {
        if mask.get_pixel(x as u32, y as u32).0[0] >= MASK_ALLOWED_THRESHOLD {
            centers.push(Point16::new(x as i16, y as i16));
        }
    });
    centers
}

impl OffsetField {
    /// Uniform random field over the source patch-center rectangle.
    ///
    /// With a mask, centers are drawn uniformly from the allowed set so no
    /// entry ever points into the removal region.
    ///
    /// # Errors
    ///
    /// * `NnfError::PatchDoesNotFit` - the source cannot hold a single patch
    /// * `NnfError::NoValidSource` - the mask forbids every center
    pub fn random(
        width: u32,
        height: u32,
        source_width: u32,
        source_height: u32,
        source_mask: Option<&Image<Luma<u8>>>,
        seed: u64,
    ) -> Result<Self, NnfError> {
        let source_rect = Rect::patch_centers(source_width, source_height);
        if source_rect.is_empty() {
            return Err(NnfError::PatchDoesNotFit {
                width: source_width,
                height: source_height,
                patch_side: PATCH_SIDE as u32,
            });
        }

        let len = width as usize * height as usize;
        let mut data = Vec::with_capacity(len);
        let mut rng = Pcg32::seed_from_u64(seed);

        match source_mask {
            Some(mask) => {
                let centers = allowed_centers(mask, source_rect);
                if centers.is_empty() {
                    return Err(NnfError::NoValidSource);
                }
                for _ in 0..len {
                    data.push(centers[rng.gen_range(0..centers.len())]);
                }
            }
            None => {
                for _ in 0..len {
                    let x = rng.gen_range(source_rect.left..source_rect.right);
                    let y = rng.gen_range(source_rect.top..source_rect.bottom);
                    data.push(Point16::new(x as i16, y as i16));
                }
            }
        }

        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Identity-like field: every target center maps to itself, clamped into
    /// the source rectangle. Useful when source and target already roughly
    /// align, e.g. right after lifting a solution from a coarser level.
    ///
    /// # Errors
    ///
    /// * `NnfError::PatchDoesNotFit` - the source cannot hold a single patch
    pub fn smooth(
        width: u32,
        height: u32,
        source_width: u32,
        source_height: u32,
    ) -> Result<Self, NnfError> {
        let source_rect = Rect::patch_centers(source_width, source_height);
        if source_rect.is_empty() {
            return Err(NnfError::PatchDoesNotFit {
                width: source_width,
                height: source_height,
                patch_side: PATCH_SIDE as u32,
            });
        }

        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                let (sx, sy) = source_rect.clamp_point(x, y);
                data.push(Point16::new(sx as i16, sy as i16));
            }
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.width && y < self.height);
        (y * self.width + x) as usize
    }

    #[inline]
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Point16 {
        self.data[self.index(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: Point16) {
        let index = self.index(x, y);
        self.data[index] = value;
    }

    pub(crate) fn data_mut(&mut self) -> &mut [Point16] {
        &mut self.data
    }

    /// Nearest-neighbor resize to the given dimensions with every stored
    /// offset doubled, lifting a coarse field onto the next finer level.
    #[must_use]
    pub fn scale_up(&self, width: u32, height: u32) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            let sy = (y / 2).min(self.height - 1);
            for x in 0..width {
                let sx = (x / 2).min(self.width - 1);
                let p = self.get(sx, sy);
                data.push(Point16::new(p.x * 2, p.y * 2));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Clamps every entry into `rect`, restoring field validity after a lift.
    pub fn clamp_to(&mut self, rect: Rect) {
        for point in &mut self.data {
            let (x, y) = rect.clamp_point(i32::from(point.x), i32::from(point.y));
            *point = Point16::new(x as i16, y as i16);
        }
    }

    /// Renders the field for inspection: hue encodes the offset angle and
    /// saturation the offset magnitude relative to the source diagonal.
    #[must_use]
    pub fn to_rgb(&self, source_width: u32, source_height: u32) -> Image<Rgb<u8>> {
        let max_radius = f32::hypot(source_width as f32, source_height as f32).max(1.0);
        let mut out = Image::new(self.width, self.height);
        iproduct!(0..self.height, 0..self.width).for_each(|(y, x)| {
            let p = self.get(x, y);
            let dx = f32::from(p.x) - x as f32;
            let dy = f32::from(p.y) - y as f32;
            let hue = dy.atan2(dx).to_degrees().rem_euclid(360.0);
            let saturation = (f32::hypot(dx, dy) / max_radius).min(1.0);
            out.put_pixel(x, y, hsv_to_rgb(hue, saturation, 1.0));
        });
        out
    }

    /// Saves the rendered field as an image file.
    ///
    /// # Errors
    ///
    /// Returns the underlying encoder error when the file cannot be written.
    pub fn save(
        &self,
        path: &Path,
        source_width: u32,
        source_height: u32,
    ) -> Result<(), image::ImageError> {
        self.to_rgb(source_width, source_height).save(path)
    }
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> Rgb<u8> {
    let c = value * saturation;
    let x = c * (1.0 - ((hue / 60.0) % 2.0 - 1.0).abs());
    let m = value - c;
    let (r, g, b) = match hue as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    Rgb([
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mask_with_hole;

    #[test]
    fn random_field_offsets_stay_inside_the_source_rect() {
        let field = OffsetField::random(20, 20, 31, 17, None, 7).unwrap();
        let rect = Rect::patch_centers(31, 17);
        for y in 0..20 {
            for x in 0..20 {
                let p = field.get(x, y);
                assert!(rect.contains(i32::from(p.x), i32::from(p.y)));
            }
        }
    }

    #[test]
    fn random_field_with_same_seed_is_reproducible() {
        let a = OffsetField::random(16, 16, 16, 16, None, 99).unwrap();
        let b = OffsetField::random(16, 16, 16, 16, None, 99).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn random_field_avoids_masked_centers() {
        let mask = mask_with_hole(32, 32, 8, 8, 12, 12);
        let field = OffsetField::random(32, 32, 32, 32, Some(&mask), 3).unwrap();
        for y in 0..32 {
            for x in 0..32 {
                let p = field.get(x, y);
                let value = mask.get_pixel(p.x as u32, p.y as u32).0[0];
                assert!(value >= MASK_ALLOWED_THRESHOLD);
            }
        }
    }

    #[test]
    fn random_field_with_fully_masked_source_returns_error() {
        let mask: Image<Luma<u8>> = Image::new(32, 32);
        assert!(matches!(
            OffsetField::random(32, 32, 32, 32, Some(&mask), 3),
            Err(NnfError::NoValidSource)
        ));
    }

    #[test]
    fn random_field_with_tiny_source_returns_error() {
        assert!(matches!(
            OffsetField::random(16, 16, 5, 16, None, 0),
            Err(NnfError::PatchDoesNotFit { .. })
        ));
    }

    #[test]
    fn smooth_field_is_identity_inside_the_rect() {
        let field = OffsetField::smooth(20, 20, 20, 20).unwrap();
        assert_eq!(field.get(10, 12), Point16::new(10, 12));
        // Border entries clamp into the patch-center rect.
        assert_eq!(field.get(0, 0), Point16::new(3, 3));
        assert_eq!(field.get(19, 19), Point16::new(16, 16));
    }

    #[test]
    fn scale_up_doubles_offsets_and_resizes() {
        let mut field = OffsetField::smooth(8, 8, 8, 8).unwrap();
        field.set(4, 4, Point16::new(3, 4));
        let up = field.scale_up(16, 16);
        assert_eq!(up.width(), 16);
        assert_eq!(up.height(), 16);
        assert_eq!(up.get(8, 8), Point16::new(6, 8));
        assert_eq!(up.get(9, 9), Point16::new(6, 8));
    }

    #[test]
    fn clamped_lift_is_valid_for_the_reference_rect() {
        let field = OffsetField::random(16, 16, 16, 16, None, 21).unwrap();
        let mut lifted = field.scale_up(33, 31);
        let rect = Rect::patch_centers(33, 31);
        lifted.clamp_to(rect);
        for y in 0..31 {
            for x in 0..33 {
                let p = lifted.get(x, y);
                assert!(rect.contains(i32::from(p.x), i32::from(p.y)));
            }
        }
    }

    #[test]
    fn rendered_field_matches_field_dimensions() {
        let field = OffsetField::smooth(12, 9, 12, 9).unwrap();
        let rendered = field.to_rgb(12, 9);
        assert_eq!(rendered.dimensions(), (12, 9));
    }
}
