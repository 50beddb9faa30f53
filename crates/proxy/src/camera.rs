//! Camera parameters and depth reconstruction.
//!
//! View space is right-handed, the camera looks down `-Z` with `+Y` up.
//! Texture coordinates have their origin at the top-left texel corner.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::volume::BoundingVolume;

/// How projective depth maps onto the near and far planes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepthConvention {
    /// `0` at the near plane, `1` at the far plane.
    #[default]
    Forward,

    /// `1` at the near plane, `0` at the far plane.
    Reversed,
}

/// Perspective camera that produced the depth buffer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    /// Vertical field of view in radians.
    pub fovy: f32,

    /// Width over height.
    pub aspect: f32,

    pub z_near: f32,
    pub z_far: f32,
    pub depth: DepthConvention,
}

impl CameraParams {
    pub fn new(fovy: f32, extent: mev::Extent2, z_near: f32, z_far: f32) -> Self {
        CameraParams {
            fovy,
            aspect: extent.width() as f32 / extent.height().max(1) as f32,
            z_near,
            z_far,
            depth: DepthConvention::Forward,
        }
    }

    pub fn with_depth(mut self, depth: DepthConvention) -> Self {
        self.depth = depth;
        self
    }

    /// Constants consumed by kernels.
    pub fn projection(&self) -> Projection {
        Projection {
            tan_half_fovy: (self.fovy * 0.5).tan(),
            aspect: self.aspect,
            z_near: self.z_near,
            z_far: self.z_far,
            reversed: (self.depth == DepthConvention::Reversed) as u32,
            _pad: [0; 3],
        }
    }

    pub fn linear_depth(&self, d: f32) -> f32 {
        self.projection().linear_depth(d)
    }

    pub fn is_background(&self, d: f32) -> bool {
        self.projection().is_background(d)
    }

    pub fn texel_volume(&self, x: u32, y: u32, extent: mev::Extent2, d: f32) -> BoundingVolume {
        self.projection()
            .texel_volume(x, y, [extent.width(), extent.height()], d)
    }

    /// Projection matrix matching the depth convention, mapping view depth to `[0, 1]`.
    pub fn matrix(&self) -> na::Matrix4<f32> {
        let p = self.projection();
        let f = 1.0 / p.tan_half_fovy;
        let (n, far) = (self.z_near, self.z_far);
        let (a, b) = match self.depth {
            DepthConvention::Forward => (far / (n - far), n * far / (n - far)),
            DepthConvention::Reversed => (n / (far - n), n * far / (far - n)),
        };

        #[rustfmt::skip]
        let matrix = na::Matrix4::new(
            f / self.aspect, 0.0, 0.0, 0.0,
            0.0, f, 0.0, 0.0,
            0.0, 0.0, a, b,
            0.0, 0.0, -1.0, 0.0,
        );
        matrix
    }
}

/// Kernel-side copy of [`CameraParams`].
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Projection {
    pub tan_half_fovy: f32,
    pub aspect: f32,
    pub z_near: f32,
    pub z_far: f32,
    pub reversed: u32,
    pub _pad: [u32; 3],
}

impl Projection {
    /// Distance from the camera plane for projective depth `d`.
    pub fn linear_depth(&self, d: f32) -> f32 {
        let (n, f) = (self.z_near, self.z_far);
        if self.reversed != 0 {
            n * f / (n + d * (f - n))
        } else {
            n * f / (f - d * (f - n))
        }
    }

    /// Projective depth for distance `z`. Inverse of [`Projection::linear_depth`].
    pub fn projective_depth(&self, z: f32) -> f32 {
        let (n, f) = (self.z_near, self.z_far);
        let forward = f / (f - n) * (1.0 - n / z);
        if self.reversed != 0 {
            1.0 - forward
        } else {
            forward
        }
    }

    /// Texel carries no surface: it is at the far plane or garbage.
    pub fn is_background(&self, d: f32) -> bool {
        if !d.is_finite() {
            return true;
        }
        if self.reversed != 0 {
            d <= 0.0
        } else {
            d >= 1.0
        }
    }

    /// View-space point at texture coordinates `uv` and distance `z`.
    pub fn view_position(&self, uv: [f32; 2], z: f32) -> [f32; 3] {
        let ndc_x = uv[0] * 2.0 - 1.0;
        let ndc_y = 1.0 - uv[1] * 2.0;
        [
            ndc_x * self.tan_half_fovy * self.aspect * z,
            ndc_y * self.tan_half_fovy * z,
            -z,
        ]
    }

    /// Direction of the camera ray through texture coordinates `uv`.
    pub fn view_ray(&self, uv: [f32; 2]) -> [f32; 3] {
        self.view_position(uv, 1.0)
    }

    /// Size of a texel footprint at distance `z`.
    pub fn footprint(&self, extent: [u32; 2], z: f32) -> [f32; 2] {
        [
            2.0 * self.tan_half_fovy * self.aspect * z / extent[0].max(1) as f32,
            2.0 * self.tan_half_fovy * z / extent[1].max(1) as f32,
        ]
    }

    /// Box around the surface patch texel `(x, y)` of an `extent`-sized level sees.
    ///
    /// XY spans the texel footprint at the reconstructed distance,
    /// Z is as thick as the larger footprint side.
    pub fn texel_volume(&self, x: u32, y: u32, extent: [u32; 2], d: f32) -> BoundingVolume {
        let z = self.linear_depth(d);
        let (w, h) = (extent[0].max(1) as f32, extent[1].max(1) as f32);

        let lo = self.view_position([x as f32 / w, (y + 1) as f32 / h], z);
        let hi = self.view_position([(x + 1) as f32 / w, y as f32 / h], z);

        let [fx, fy] = self.footprint(extent, z);
        let half_thickness = fx.max(fy) * 0.5;

        BoundingVolume {
            min: [lo[0], lo[1], -z - half_thickness],
            max: [hi[0], hi[1], -z + half_thickness],
        }
    }
}

/// Extent of mip `mip` of an image with base `extent`.
pub fn mip_extent(extent: mev::Extent2, mip: u32) -> mev::Extent2 {
    mev::level_extent(extent, mip)
}
