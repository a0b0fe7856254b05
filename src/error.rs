use thiserror::Error;

/// Errors raised while building or resampling Gaussian pyramids.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PyramidError {
    /// A pyramid needs at least one level.
    #[error("Pyramid must have at least one level, requested {levels}")]
    InvalidLevelCount { levels: usize },

    /// The image cannot be halved often enough for the requested level count.
    #[error("Image of {width}x{height} is too small for {levels} pyramid levels")]
    ImageTooSmall {
        width: u32,
        height: u32,
        levels: usize,
    },
}

/// Errors raised by the nearest-neighbor field solver and offset fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NnfError {
    /// One of the images is smaller than the comparison patch.
    #[error("Image of {width}x{height} cannot hold a {patch_side}x{patch_side} patch")]
    PatchDoesNotFit {
        width: u32,
        height: u32,
        patch_side: u32,
    },

    /// Mask and source image dimensions differ.
    #[error("Source mask dimensions {actual:?} do not match the source image {expected:?}")]
    MaskDimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    /// The offset field does not cover the target image.
    #[error("Offset field dimensions {actual:?} do not match the target image {expected:?}")]
    FieldDimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    /// Every patch center in the source is below the mask threshold.
    #[error("Source mask forbids every patch center")]
    NoValidSource,
}

/// Errors raised by the object removal driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoveObjectError {
    /// Image and mask dimensions differ.
    #[error("Mask dimensions {actual:?} do not match the image {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    /// The input is too small for the multi-scale solver.
    #[error("Image of {width}x{height} is below the {min_side}px minimum side length")]
    ImageTooSmall {
        width: u32,
        height: u32,
        min_side: u32,
    },

    #[error(transparent)]
    Pyramid(#[from] PyramidError),

    #[error(transparent)]
    Nnf(#[from] NnfError),
}
