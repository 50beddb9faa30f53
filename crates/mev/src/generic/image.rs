use super::{format::PixelFormat, Extent2};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 0x0000_0001;
        const TRANSFER_DST = 0x0000_0002;
        const SAMPLED = 0x0000_0004;
        const STORAGE = 0x0000_0008;
        const TARGET = 0x0000_0010;
    }
}

/// Image description.
/// Only two-dimensional images are supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageDesc<'a> {
    /// Extent of the base level.
    pub extent: Extent2,

    /// Pixel format.
    pub format: PixelFormat,

    /// Number of mip levels.
    pub levels: u32,

    /// Image usage flags.
    pub usage: ImageUsage,

    /// Image debug name.
    pub name: &'a str,
}

impl<'a> ImageDesc<'a> {
    pub const fn new_2d(
        extent: Extent2,
        format: PixelFormat,
        usage: ImageUsage,
        name: &'a str,
    ) -> Self {
        ImageDesc {
            extent,
            format,
            levels: 1,
            usage,
            name,
        }
    }

    pub const fn with_levels(mut self, levels: u32) -> Self {
        self.levels = levels;
        self
    }

    /// Extent of the specified mip level.
    /// Each level halves the previous one rounding up, never below one texel.
    pub fn level_extent(&self, level: u32) -> Extent2 {
        level_extent(self.extent, level)
    }
}

/// Extent of the mip level `level` of an image with base extent `base`.
pub fn level_extent(base: Extent2, level: u32) -> Extent2 {
    let mut width = base.width();
    let mut height = base.height();
    for _ in 0..level {
        width = ((width + 1) / 2).max(1);
        height = ((height + 1) / 2).max(1);
    }
    Extent2::new(width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_extent_rounds_up() {
        let base = Extent2::new(1920, 1080);
        assert_eq!(level_extent(base, 0), base);
        assert_eq!(level_extent(base, 1), Extent2::new(960, 540));
        assert_eq!(level_extent(base, 3), Extent2::new(240, 135));
        assert_eq!(level_extent(base, 4), Extent2::new(120, 68));
        assert_eq!(level_extent(Extent2::new(1, 3), 5), Extent2::new(1, 1));
    }
}
