//! Records shared between passes and acceleration structure builds.

use bytemuck::{Pod, Zeroable};

/// Distance at which unused boxes are parked.
/// View space looks down `-Z`, so positive `Z` is behind the camera.
pub const PARK_DISTANCE: f32 = 1.0e6;

/// Axis-aligned box in view space.
///
/// Layout matches the AABB stride expected by bottom-level builds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct BoundingVolume {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl BoundingVolume {
    /// Zero-extent box outside any view frustum.
    /// Written for invalid texels and unused slots.
    pub const PARKED: Self = BoundingVolume {
        min: [0.0, 0.0, PARK_DISTANCE],
        max: [0.0, 0.0, PARK_DISTANCE],
    };

    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn from_center_half(center: [f32; 3], half: [f32; 3]) -> Self {
        BoundingVolume {
            min: std::array::from_fn(|i| center[i] - half[i]),
            max: std::array::from_fn(|i| center[i] + half[i]),
        }
    }

    /// Finite components and `min <= max` on every axis.
    pub fn is_well_formed(&self) -> bool {
        (0..3).all(|i| {
            self.min[i].is_finite() && self.max[i].is_finite() && self.min[i] <= self.max[i]
        })
    }

    pub fn is_parked(&self) -> bool {
        *self == Self::PARKED
    }

    pub fn contains(&self, point: [f32; 3], epsilon: f32) -> bool {
        (0..3).all(|i| {
            point[i] >= self.min[i] - epsilon && point[i] <= self.max[i] + epsilon
        })
    }
}

/// Regular grid of boxes covering `[-1, 1]²` in XY and `[0.1, 1]` in Z,
/// one box per texel in row-major order.
pub fn grid(width: u32, height: u32) -> Vec<BoundingVolume> {
    let mut out = Vec::with_capacity(width as usize * height as usize);
    let sx = 2.0 / width.max(1) as f32;
    let sy = 2.0 / height.max(1) as f32;

    for y in 0..height {
        for x in 0..width {
            out.push(BoundingVolume {
                min: [-1.0 + x as f32 * sx, -1.0 + y as f32 * sy, 0.1],
                max: [-1.0 + (x + 1) as f32 * sx, -1.0 + (y + 1) as f32 * sy, 1.0],
            });
        }
    }
    out
}

/// Contents of a freshly created depth structure.
///
/// Texel 0 is stretched far along Z so the very first top-level build
/// never sees a flat bound.
pub fn initial_grid(width: u32, height: u32) -> Vec<BoundingVolume> {
    let mut out = grid(width, height);
    if let Some(first) = out.first_mut() {
        first.min[2] -= 1000.0;
        first.max[2] += 1000.0;
    }
    out
}

/// Work group counts of an indirect dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DispatchArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchArgs {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// One-dimensional dispatch covering `count` invocations.
    pub fn linear(count: u32, group_size: u32) -> Self {
        DispatchArgs {
            x: work_groups(count, group_size),
            y: 1,
            z: 1,
        }
    }
}

/// Number of groups of `group_size` needed to cover `count` items.
pub fn work_groups(count: u32, group_size: u32) -> u32 {
    count.div_ceil(group_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_grid_inflates_first_texel_only() {
        let boxes = initial_grid(4, 3);
        assert_eq!(boxes.len(), 12);
        assert!(boxes.iter().all(BoundingVolume::is_well_formed));

        assert_eq!(boxes[0].min[2], 0.1 - 1000.0);
        assert_eq!(boxes[0].max[2], 1001.0);
        assert_eq!(boxes[1].min[2], 0.1);

        let last = boxes[11];
        approx::assert_abs_diff_eq!(last.max[0], 1.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(last.max[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn parked_is_degenerate_but_well_formed() {
        assert!(BoundingVolume::PARKED.is_well_formed());
        assert_eq!(BoundingVolume::SIZE, 24);

        let nan = BoundingVolume {
            min: [f32::NAN, 0.0, 0.0],
            max: [0.0; 3],
        };
        assert!(!nan.is_well_formed());

        let inverted = BoundingVolume {
            min: [1.0, 0.0, 0.0],
            max: [0.0, 0.0, 0.0],
        };
        assert!(!inverted.is_well_formed());
    }

    #[test]
    fn dispatch_covers_count() {
        assert_eq!(work_groups(0, 64), 0);
        assert_eq!(work_groups(64, 64), 1);
        assert_eq!(work_groups(65, 64), 2);
        assert_eq!(DispatchArgs::linear(80000, 64).x, 1250);
        assert_eq!(DispatchArgs::SIZE, 12);
    }
}
