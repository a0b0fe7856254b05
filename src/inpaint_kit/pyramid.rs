use std::path::Path;

use image::imageops::{self, FilterType};
use image::{EncodableLayout, Pixel, PixelWithColorType, Primitive};
use imageproc::definitions::{Clamp, Image};
use rayon::prelude::*;

use crate::error::PyramidError;
use crate::utils::{mirror, validate_non_empty_image};

/// 5-tap binomial kernel used for pyramid downsampling.
const KERNEL: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];
const KERNEL_HALF: i32 = 2;
const KERNEL_SUM: f32 = 16.0;

/// Coarse-to-fine chain of images, each level half the size of the previous.
///
/// Level 0 is the original image; level `i + 1` is [`scale_down`] of level
/// `i`. The chain is rebuilt from scratch for every removal operation.
#[derive(Clone)]
pub struct GaussianPyramid<P: Pixel> {
    levels: Vec<Image<P>>,
}

impl<P> std::fmt::Debug for GaussianPyramid<P>
where
    P: Pixel + std::fmt::Debug,
    P::Subpixel: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaussianPyramid")
            .field("levels", &self.levels)
            .finish()
    }
}

impl<P> GaussianPyramid<P>
where
    P: Pixel,
    P::Subpixel: Primitive + Clamp<f32> + Send + Sync,
    f32: From<P::Subpixel>,
{
    /// Builds a pyramid with `levels` levels.
    ///
    /// # Errors
    ///
    /// * `PyramidError::InvalidLevelCount` - when `levels` is zero
    /// * `PyramidError::ImageTooSmall` - when the image is empty or cannot
    ///   be halved `levels - 1` times
    pub fn build(image: &Image<P>, levels: usize) -> Result<Self, PyramidError> {
        if levels == 0 {
            return Err(PyramidError::InvalidLevelCount { levels });
        }
        let (width, height) = image.dimensions();
        validate_non_empty_image(width, height, "Gaussian pyramid").map_err(|_| {
            PyramidError::ImageTooSmall {
                width,
                height,
                levels,
            }
        })?;
        let min_side = width.min(height);
        if levels > 1 && (levels - 1 >= u32::BITS as usize || min_side >> (levels - 1) == 0) {
            return Err(PyramidError::ImageTooSmall {
                width,
                height,
                levels,
            });
        }

        let mut chain = Vec::with_capacity(levels);
        chain.push(image.clone());
        for _ in 1..levels {
            let next = scale_down(chain.last().unwrap_or(image));
            chain.push(next);
        }
        Ok(Self { levels: chain })
    }

    pub fn level(&self, index: usize) -> Option<&Image<P>> {
        self.levels.get(index)
    }

    pub fn levels(&self) -> &[Image<P>] {
        &self.levels
    }

    #[must_use]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }
}

impl<P> GaussianPyramid<P>
where
    P: PixelWithColorType,
    [P::Subpixel]: EncodableLayout,
{
    /// Saves every level next to `path` as `<stem>_<level>.<ext>`.
    ///
    /// Intended for debugging; the naming mirrors the offset-field dumps.
    ///
    /// # Errors
    ///
    /// Returns the underlying encoder error when a level cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), image::ImageError> {
        for (index, level) in self.levels.iter().enumerate() {
            level.save(level_path(path, index))?;
        }
        Ok(())
    }
}

/// Builds `<stem>_<index>.<ext>` next to `path`.
fn level_path(path: &Path, index: usize) -> std::path::PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index}"),
    };
    path.with_file_name(name)
}

/// Halves an image with the separable binomial filter.
///
/// Both passes combine convolution with 2:1 decimation and mirror taps that
/// fall outside the image (reflection without repeating the edge sample).
/// For pixel types with an alpha channel the alpha is not filtered; every
/// output pixel copies the alpha of input pixel `(2x, 2y)`.
///
/// # Panics
///
/// Panics when the input is smaller than 2x2; callers are expected to stop
/// their level chains before that (see [`GaussianPyramid::build`]).
pub fn scale_down<P>(src: &Image<P>) -> Image<P>
where
    P: Pixel,
    P::Subpixel: Primitive + Clamp<f32> + Send + Sync,
    f32: From<P::Subpixel>,
{
    let (width, height) = src.dimensions();
    assert!(
        width >= 2 && height >= 2,
        "scale_down needs at least a 2x2 image"
    );
    let dst_w = (width / 2) as usize;
    let dst_h = (height / 2) as usize;
    let channels = P::CHANNEL_COUNT as usize;
    // Luma and Rgb carry no alpha; LumaA and Rgba keep it in the last channel.
    let alpha_channel = (channels == 2 || channels == 4).then_some(channels - 1);

    let src_raw: &[P::Subpixel] = src;
    let src_w = width as usize;
    let max_x = width as i32 - 1;
    let max_y = height as i32 - 1;

    // Horizontal pass: convolve rows and drop every other column.
    let mut mid = vec![0.0f32; dst_w * height as usize * channels];
    mid.par_chunks_mut(dst_w * channels)
        .enumerate()
        .for_each(|(y, mid_row)| {
            let src_row = &src_raw[y * src_w * channels..(y + 1) * src_w * channels];
            for x in 0..dst_w {
                let mut sums = [0.0f32; 4];
                for (tap, &weight) in KERNEL.iter().enumerate() {
                    let sx = mirror(2 * x as i32 + tap as i32 - KERNEL_HALF, max_x) as usize;
                    let base = sx * channels;
                    for (channel, sum) in sums.iter_mut().enumerate().take(channels) {
                        *sum += weight * f32::from(src_row[base + channel]);
                    }
                }
                let out = &mut mid_row[x * channels..(x + 1) * channels];
                for (channel, value) in out.iter_mut().enumerate() {
                    *value = sums[channel] / KERNEL_SUM;
                }
            }
        });

    // Vertical pass: convolve the intermediate columns and drop every other
    // row. The alpha channel bypasses both filters.
    let mut dst = Image::<P>::new(dst_w as u32, dst_h as u32);
    let dst_raw: &mut [P::Subpixel] = &mut dst;
    dst_raw
        .par_chunks_mut(dst_w * channels)
        .enumerate()
        .for_each(|(y, dst_row)| {
            for x in 0..dst_w {
                let out = &mut dst_row[x * channels..(x + 1) * channels];
                for (channel, value) in out.iter_mut().enumerate() {
                    if alpha_channel == Some(channel) {
                        let base = (2 * y * src_w + 2 * x) * channels;
                        *value = src_raw[base + channel];
                        continue;
                    }
                    let mut sum = 0.0f32;
                    for (tap, &weight) in KERNEL.iter().enumerate() {
                        let sy = mirror(2 * y as i32 + tap as i32 - KERNEL_HALF, max_y) as usize;
                        sum += weight * mid[(sy * dst_w + x) * channels + channel];
                    }
                    *value = Clamp::clamp(sum / KERNEL_SUM);
                }
            }
        });

    dst
}

/// Bilinear upsample to explicit target dimensions.
///
/// The driver lifts a coarse solution onto the next pyramid level, whose
/// dimensions are not always exactly double, so the caller passes them in.
pub fn scale_up<P>(src: &Image<P>, width: u32, height: u32) -> Image<P>
where
    P: Pixel + 'static,
    P::Subpixel: Primitive + 'static,
{
    imageops::resize(src, width, height, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use image::{Luma, Rgb, Rgba};

    use super::*;
    use crate::test_utils::{constant_rgb, gradient_rgb};

    #[test]
    fn scale_down_halves_dimensions() {
        let image = gradient_rgb(11, 7);
        let down = scale_down(&image);
        assert_eq!(down.dimensions(), (5, 3));
    }

    #[test]
    fn scale_down_on_constant_image_keeps_the_constant() {
        let image = constant_rgb(32, 32, Rgb([13, 200, 77]));
        let down = scale_down(&image);
        for pixel in down.pixels() {
            assert_eq!(*pixel, Rgb([13, 200, 77]));
        }
    }

    #[test]
    fn scale_down_on_known_row_matches_hand_computed_taps() {
        // Both rows identical, so the vertical pass averages equal values and
        // the output isolates the horizontal mirrored taps.
        let mut image: Image<Luma<u8>> = Image::new(6, 2);
        for y in 0..2 {
            for (x, value) in [0u8, 16, 32, 48, 64, 80].into_iter().enumerate() {
                image.put_pixel(x as u32, y, Luma([value]));
            }
        }
        let down = scale_down(&image);
        assert_eq!(down.dimensions(), (3, 1));
        // x = 0 mirrors taps -2 and -1 back onto columns 2 and 1.
        assert_eq!(down.get_pixel(0, 0).0[0], 12);
        assert_eq!(down.get_pixel(1, 0).0[0], 32);
        // x = 2 mirrors tap 6 back onto column 4.
        assert_eq!(down.get_pixel(2, 0).0[0], 62);
    }

    #[test]
    fn scale_down_copies_alpha_from_even_input_pixels() {
        let mut image: Image<Rgba<u8>> = Image::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                image.put_pixel(x, y, Rgba([128, 128, 128, (x * 10 + y) as u8]));
            }
        }
        let down = scale_down(&image);
        for y in 0..4 {
            for x in 0..4 {
                let expected = image.get_pixel(2 * x, 2 * y).0[3];
                assert_eq!(down.get_pixel(x, y).0[3], expected);
            }
        }
    }

    #[test]
    fn build_produces_halved_level_chain() {
        let image = gradient_rgb(64, 48);
        let pyramid = GaussianPyramid::build(&image, 4).unwrap();
        let dims: Vec<(u32, u32)> = pyramid.levels().iter().map(Image::dimensions).collect();
        assert_eq!(dims, vec![(64, 48), (32, 24), (16, 12), (8, 6)]);
    }

    #[test]
    fn build_with_zero_levels_returns_error() {
        let image = gradient_rgb(16, 16);
        assert!(matches!(
            GaussianPyramid::build(&image, 0),
            Err(PyramidError::InvalidLevelCount { levels: 0 })
        ));
    }

    #[test]
    fn build_with_empty_image_returns_error() {
        let image: Image<Rgb<u8>> = Image::new(0, 16);
        assert!(matches!(
            GaussianPyramid::build(&image, 1),
            Err(PyramidError::ImageTooSmall { .. })
        ));
    }

    #[test]
    fn build_with_too_many_levels_returns_error() {
        let image = gradient_rgb(8, 8);
        assert!(matches!(
            GaussianPyramid::build(&image, 5),
            Err(PyramidError::ImageTooSmall { .. })
        ));
    }

    #[test]
    fn scale_up_reaches_requested_dimensions() {
        let image = gradient_rgb(9, 5);
        let up = scale_up(&image, 19, 11);
        assert_eq!(up.dimensions(), (19, 11));
    }

    #[test]
    fn level_path_inserts_index_before_extension() {
        let path = level_path(Path::new("/tmp/pyr.png"), 2);
        assert_eq!(path, Path::new("/tmp/pyr_2.png"));
        let bare = level_path(Path::new("dump"), 0);
        assert_eq!(bare, Path::new("dump_0"));
    }
}
