//! # inpaint-kit
//!
//! An image completion / object removal engine built on bidirectional patch
//! similarity over a coarse-to-fine Gaussian pyramid, with a randomized
//! PatchMatch-style nearest-neighbor field solver at its core.
//!
//! Given an image and a mask marking pixels to remove (`0` = remove,
//! `255` = usable source content), [`remove_object`] synthesizes a result in
//! which the masked region is replaced by content coherent with its
//! surroundings while every unmasked pixel stays untouched.
//!
//! The building blocks are exported for direct use:
//!
//! - [`GaussianPyramid`], [`scale_down`], [`scale_up`]: separable binomial
//!   downsampling with mirrored boundaries and bilinear lifting
//! - [`OffsetField`], [`NearestNeighborField`]: approximate nearest-neighbor
//!   fields under patch SSD, refined by propagation and random search with a
//!   tiled wavefront for parallel execution
//! - [`BidirectionalSimilarity`]: the completeness + coherence fixed point
//!   that alternates field refinement with a patch-vote reconstruction
//!
//! ## Example Usage
//!
//! ```no_run
//! use image::{Luma, Rgb};
//! use inpaint_kit::{remove_object, CompletionParams, Image};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let image: Image<Rgb<u8>> = Image::new(320, 240);
//! let mut mask = Image::from_pixel(320, 240, Luma([255u8]));
//! for y in 80..120 {
//!     for x in 140..190 {
//!         mask.put_pixel(x, y, Luma([0u8]));
//!     }
//! }
//!
//! let completed = remove_object(&image, &mask, &CompletionParams::default(), None)?;
//! # Ok(())
//! # }
//! ```

mod error;
mod inpaint_kit;
mod utils;

#[cfg(test)]
mod test_utils;

pub use error::{NnfError, PyramidError, RemoveObjectError};
pub use inpaint_kit::bidirectional::BidirectionalSimilarity;
pub use inpaint_kit::field::{OffsetField, Point16};
pub use inpaint_kit::nnf::NearestNeighborField;
pub use inpaint_kit::pyramid::{scale_down, scale_up, GaussianPyramid};
pub use inpaint_kit::remove_object::{
    mix_images, remove_object, CompletionParams, CompletionProgress, MIN_IMAGE_SIDE,
};
pub use utils::{Rect, MASK_ALLOWED_THRESHOLD, PATCH_SIDE};

// Re-export imageproc::definitions::Image for convenience
pub use imageproc::definitions::Image;
