//! Shared constructors for the unit tests.

use image::{Luma, Rgb};
use imageproc::definitions::Image;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

pub fn constant_rgb(width: u32, height: u32, color: Rgb<u8>) -> Image<Rgb<u8>> {
    Image::from_pixel(width, height, color)
}

pub fn gradient_rgb(width: u32, height: u32) -> Image<Rgb<u8>> {
    Image::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) % 256) as u8,
        ])
    })
}

pub fn noise_rgb(width: u32, height: u32, seed: u64) -> Image<Rgb<u8>> {
    let mut rng = Pcg32::seed_from_u64(seed);
    let mut image = Image::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([rng.gen(), rng.gen(), rng.gen()]);
    }
    image
}

/// Mask that allows everything except a `hole_w x hole_h` rectangle at
/// `(hole_x, hole_y)`.
pub fn mask_with_hole(
    width: u32,
    height: u32,
    hole_x: u32,
    hole_y: u32,
    hole_w: u32,
    hole_h: u32,
) -> Image<Luma<u8>> {
    Image::from_fn(width, height, |x, y| {
        let inside =
            x >= hole_x && x < hole_x + hole_w && y >= hole_y && y < hole_y + hole_h;
        Luma([if inside { 0u8 } else { 255u8 }])
    })
}
