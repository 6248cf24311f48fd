//! Minimum-size and aspect rules for featured images.

/// Narrowest width, in pixels, a featured image may have.
pub const DEFAULT_MIN_WIDTH: u32 = 450;

/// Pure predicate deciding whether an image fits the featured-image slot.
///
/// Width must reach `min_width` and the image must not be taller than it is
/// wide. There is no upper bound on width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizePolicy {
    min_width: u32,
}

impl SizePolicy {
    pub fn new(min_width: u32) -> Self {
        Self { min_width }
    }

    pub fn min_width(&self) -> u32 {
        self.min_width
    }

    pub fn is_acceptable(&self, width: u32, height: u32) -> bool {
        width >= self.min_width && height <= width
    }
}

impl Default for SizePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_WIDTH)
    }
}
