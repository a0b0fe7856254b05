use image::{Luma, Pixel, Primitive};
use imageproc::definitions::{Clamp, Image};
use rayon::prelude::*;

use crate::error::NnfError;
use crate::inpaint_kit::field::OffsetField;
use crate::inpaint_kit::nnf::NearestNeighborField;
use crate::utils::{
    validate_matching_dimensions, Rect, MASK_ALLOWED_THRESHOLD, PATCH_HALF,
};

/// Rows per accumulation band in the vote step.
const VOTE_BAND_ROWS: usize = 32;

/// Minimizer of the bidirectional patch similarity between a source and a
/// synthesized target.
///
/// The energy combines completeness (every target patch has a close source
/// patch) and `alpha` times coherence (every source patch has a close target
/// patch). One [`iteration`](Self::iteration) refines both nearest-neighbor
/// fields and rebuilds the target from the overlapping patches they select.
pub struct BidirectionalSimilarity<P: Pixel> {
    pub source: Image<P>,
    pub source_mask: Image<Luma<u8>>,
    pub target: Image<P>,
    /// Maps source patch centers to target patch centers (coherence).
    pub source_to_target: OffsetField,
    /// Maps target patch centers to source patch centers (completeness).
    pub target_to_source: OffsetField,
    /// Inner PatchMatch passes per field per iteration.
    pub nnf_iterations: u32,
    /// Coherence weight in the energy.
    pub alpha: f32,
    /// When set, the vote only replaces pixels inside the removal region.
    pub hole_fill: bool,
    pub seed: u64,
    completeness: f64,
    coherence: f64,
    iteration_index: u64,
}

impl<P> BidirectionalSimilarity<P>
where
    P: Pixel,
    P::Subpixel: Primitive + Clamp<f32> + Send + Sync,
    i64: From<P::Subpixel>,
    f32: From<P::Subpixel>,
{
    pub fn new(
        source: Image<P>,
        source_mask: Image<Luma<u8>>,
        target: Image<P>,
        source_to_target: OffsetField,
        target_to_source: OffsetField,
        seed: u64,
    ) -> Self {
        Self {
            source,
            source_mask,
            target,
            source_to_target,
            target_to_source,
            nnf_iterations: 4,
            alpha: 0.5,
            hole_fill: false,
            seed,
            completeness: 0.0,
            coherence: 0.0,
            iteration_index: 0,
        }
    }

    /// One fixed-point step: refine both fields, then vote a new target.
    ///
    /// # Errors
    ///
    /// Propagates [`NnfError`] from field validation; additionally requires
    /// the mask to cover the target when `hole_fill` is set.
    pub fn iteration(&mut self, parallel: bool) -> Result<(), NnfError> {
        if self.hole_fill {
            validate_matching_dimensions(
                self.target.width(),
                self.target.height(),
                self.source_mask.width(),
                self.source_mask.height(),
                "Hole-fill vote",
            )
            .map_err(|_| NnfError::MaskDimensionMismatch {
                expected: self.target.dimensions(),
                actual: self.source_mask.dimensions(),
            })?;
        }

        let round = self.iteration_index.wrapping_mul(0xA076_1D64_78BD_642F);

        // Completeness: match every target patch into the allowed source.
        let mut nnf = NearestNeighborField::new(
            &self.source,
            Some(&self.source_mask),
            &self.target,
            &mut self.target_to_source,
            self.seed ^ round,
        )?;
        self.completeness = nnf.run(self.nnf_iterations, parallel);

        // Coherence: match every source patch into the current target.
        let mut nnf = NearestNeighborField::new(
            &self.target,
            None,
            &self.source,
            &mut self.source_to_target,
            self.seed ^ round ^ 0xE703_7ED1_A0B4_28DB,
        )?;
        self.coherence = nnf.run(self.nnf_iterations, parallel);

        self.vote(parallel);
        self.iteration_index += 1;
        Ok(())
    }

    /// Energy after the most recent iteration's field refinement.
    #[must_use]
    pub fn energy(&self) -> f64 {
        self.completeness + f64::from(self.alpha) * self.coherence
    }

    /// Rebuilds every target pixel as the uniform-weight average of the
    /// source pixels claimed for it by both fields.
    ///
    /// Contributions whose source pixel lies in the removal region are
    /// skipped, so removed content never votes itself back in. Pixels with no
    /// surviving contribution keep their current value.
    fn vote(&mut self, parallel: bool) {
        let (width_u, height_u) = self.target.dimensions();
        let (width, height) = (width_u as usize, height_u as usize);
        let channels = P::CHANNEL_COUNT as usize;
        let stride = channels + 1;
        let target_rect = Rect::patch_centers(width_u, height_u);
        let source_rect = Rect::patch_centers(self.source.width(), self.source.height());
        if target_rect.is_empty() || source_rect.is_empty() {
            return;
        }

        let source_px: &[P::Subpixel] = self.source.as_raw();
        let source_w = self.source.width() as usize;
        let mask = &self.source_mask;
        let target_to_source = &self.target_to_source;
        let source_to_target = &self.source_to_target;

        // Output pixels are partitioned into row bands; each band scans the
        // entries whose patches can reach it and owns its accumulator slice,
        // so no two tasks ever write the same cell.
        let fill_band = |band_index: usize, band: &mut [f32]| {
            let y_begin = (band_index * VOTE_BAND_ROWS) as i32;
            let y_end = y_begin + (band.len() / (width * stride)) as i32;

            let mut add = |px: i32, py: i32, sx: i32, sy: i32| {
                if mask.get_pixel(sx as u32, sy as u32).0[0] < MASK_ALLOWED_THRESHOLD {
                    return;
                }
                let base = ((py - y_begin) as usize * width + px as usize) * stride;
                let source_base = (sy as usize * source_w + sx as usize) * channels;
                for channel in 0..channels {
                    band[base + channel] += f32::from(source_px[source_base + channel]);
                }
                band[base + channels] += 1.0;
            };

            // Completeness votes: target centers whose patch reaches the band.
            let ty_begin = (y_begin - PATCH_HALF).max(target_rect.top);
            let ty_end = (y_end + PATCH_HALF).min(target_rect.bottom);
            for ty in ty_begin..ty_end {
                for tx in target_rect.left..target_rect.right {
                    let s = target_to_source.get(tx as u32, ty as u32);
                    for dy in -PATCH_HALF..=PATCH_HALF {
                        let py = ty + dy;
                        if py < y_begin || py >= y_end {
                            continue;
                        }
                        for dx in -PATCH_HALF..=PATCH_HALF {
                            add(tx + dx, py, i32::from(s.x) + dx, i32::from(s.y) + dy);
                        }
                    }
                }
            }

            // Coherence votes: source patches claiming pixels in the band.
            for sy in source_rect.top..source_rect.bottom {
                for sx in source_rect.left..source_rect.right {
                    let t = source_to_target.get(sx as u32, sy as u32);
                    let ty = i32::from(t.y);
                    if ty + PATCH_HALF < y_begin || ty - PATCH_HALF >= y_end {
                        continue;
                    }
                    for dy in -PATCH_HALF..=PATCH_HALF {
                        let py = ty + dy;
                        if py < y_begin || py >= y_end {
                            continue;
                        }
                        for dx in -PATCH_HALF..=PATCH_HALF {
                            add(i32::from(t.x) + dx, py, sx + dx, sy + dy);
                        }
                    }
                }
            }
        };

        let mut accumulator = vec![0.0f32; width * height * stride];
        let band_len = width * stride * VOTE_BAND_ROWS;
        if parallel {
            accumulator
                .par_chunks_mut(band_len)
                .enumerate()
                .for_each(|(band_index, band)| fill_band(band_index, band));
        } else {
            for (band_index, band) in accumulator.chunks_mut(band_len).enumerate() {
                fill_band(band_index, band);
            }
        }

        let hole_fill = self.hole_fill;
        for y in 0..height_u {
            for x in 0..width_u {
                let base = (y as usize * width + x as usize) * stride;
                let weight = accumulator[base + channels];
                if weight <= 0.0 {
                    continue;
                }
                if hole_fill
                    && self.source_mask.get_pixel(x, y).0[0] >= MASK_ALLOWED_THRESHOLD
                {
                    continue;
                }
                let pixel = self.target.get_pixel_mut(x, y);
                for (channel, value) in pixel.channels_mut().iter_mut().enumerate() {
                    *value = Clamp::clamp(accumulator[base + channel] / weight);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;
    use crate::test_utils::{constant_rgb, mask_with_hole, noise_rgb};

    fn solver_for(
        source: Image<Rgb<u8>>,
        mask: Image<Luma<u8>>,
        seed: u64,
    ) -> BidirectionalSimilarity<Rgb<u8>> {
        let (w, h) = source.dimensions();
        let target = source.clone();
        let source_to_target = OffsetField::random(w, h, w, h, None, seed).unwrap();
        let target_to_source = OffsetField::random(w, h, w, h, Some(&mask), seed ^ 1).unwrap();
        BidirectionalSimilarity::new(
            source,
            mask,
            target,
            source_to_target,
            target_to_source,
            seed,
        )
    }

    fn full_mask(w: u32, h: u32) -> Image<Luma<u8>> {
        Image::from_pixel(w, h, Luma([255u8]))
    }

    #[test]
    fn iteration_on_constant_image_keeps_the_constant() {
        let color = Rgb([90u8, 40, 160]);
        let mut solver = solver_for(constant_rgb(48, 48, color), full_mask(48, 48), 11);
        solver.nnf_iterations = 2;
        solver.iteration(false).unwrap();
        for pixel in solver.target.pixels() {
            assert_eq!(*pixel, color);
        }
    }

    #[test]
    fn energy_combines_both_directions_with_alpha() {
        let mut solver = solver_for(noise_rgb(48, 48, 3), full_mask(48, 48), 19);
        solver.nnf_iterations = 2;
        solver.iteration(false).unwrap();
        assert!(solver.completeness >= 0.0);
        assert!(solver.coherence >= 0.0);
        let expected = solver.completeness + 0.5 * solver.coherence;
        assert!((solver.energy() - expected).abs() < 1e-6);
    }

    #[test]
    fn hole_fill_vote_only_touches_masked_pixels() {
        let source = noise_rgb(48, 48, 29);
        let mask = mask_with_hole(48, 48, 18, 18, 12, 12);
        let mut solver = solver_for(source.clone(), mask.clone(), 31);
        solver.nnf_iterations = 2;
        solver.hole_fill = true;
        solver.iteration(false).unwrap();
        for y in 0..48 {
            for x in 0..48 {
                if mask.get_pixel(x, y).0[0] >= MASK_ALLOWED_THRESHOLD {
                    assert_eq!(solver.target.get_pixel(x, y), source.get_pixel(x, y));
                }
            }
        }
    }

    #[test]
    fn full_vote_reaches_every_pixel_on_identical_images() {
        // With target == source and allowed everywhere, the vote must find at
        // least one contribution for every pixel, including the corners.
        let source = noise_rgb(40, 40, 41);
        let mut solver = solver_for(source, full_mask(40, 40), 7);
        solver.nnf_iterations = 2;
        solver.iteration(false).unwrap();
        assert_eq!(solver.target.dimensions(), (40, 40));
    }

    #[test]
    fn repeated_iterations_do_not_blow_up_the_energy() {
        let source = noise_rgb(48, 48, 53);
        let mask = mask_with_hole(48, 48, 16, 16, 14, 14);
        let mut solver = solver_for(source, mask, 59);
        solver.nnf_iterations = 3;
        solver.iteration(false).unwrap();
        let first = solver.energy();
        solver.iteration(false).unwrap();
        solver.iteration(false).unwrap();
        let third = solver.energy();
        assert!(third.is_finite());
        assert!(third <= first * 1.5 + 1.0);
    }
}
