//! Run-time tunables.
//!
//! Every pass receives its section explicitly.
//! Nothing here is global state.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ProxyError;

/// Upper bound for [`TriangleConfig::max_triangles`].
/// Matches the triangle index width of a packed triangle id.
pub const MAX_TRIANGLES_LIMIT: u32 = 1 << 21;

/// Full configuration of the subsystem.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub depth: DepthConfig,
    pub tree: TreeConfig,
    pub ids: IdTableConfig,
    pub triangles: TriangleConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    /// Depth mip converted into boxes.
    pub mip: u32,
}

impl Default for DepthConfig {
    fn default() -> Self {
        DepthConfig { mip: 1 }
    }
}

/// Where the final tree build takes its primitive count from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TreeElementCount {
    /// Every base-level slot, emitted or parked.
    #[default]
    BaseResolution,

    /// Number of boxes actually emitted, read by the device.
    GpuCounter,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Depth mip used as the base level.
    pub base_mip: u32,

    /// Maximum number of levels including the base one.
    pub levels: u32,

    /// Minimal cosine between a child normal and the merged normal.
    pub normal_threshold: f32,

    /// Allowed child distance from the merged plane, relative to node size.
    pub plane_distance: f32,

    /// Allowed depth spread of siblings on the first merge, relative to node size.
    pub gap_threshold: f32,

    /// Box thickness along the plane normal, relative to node size.
    pub thickness: f32,

    pub element_count: TreeElementCount,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            base_mip: 0,
            levels: 5,
            normal_threshold: 0.95,
            plane_distance: 0.25,
            gap_threshold: 2.0,
            thickness: 0.1,
            element_count: TreeElementCount::BaseResolution,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdTableConfig {
    pub num_buckets: u32,
    pub bucket_capacity: u32,

    /// Maximum number of ids in the flattened result.
    pub output_capacity: u32,

    /// Frames between diagnostic count readbacks.
    pub readback_delay_frames: u32,
}

impl Default for IdTableConfig {
    fn default() -> Self {
        IdTableConfig {
            num_buckets: 128,
            bucket_capacity: 1024,
            output_capacity: 1 << 17,
            readback_delay_frames: 300,
        }
    }
}

impl IdTableConfig {
    /// Checks that the table is non-empty and every slot and counter is addressable by a `u32` index.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.num_buckets == 0 || self.bucket_capacity == 0 || self.output_capacity == 0 {
            return Err(invalid(
                "ids.num_buckets, ids.bucket_capacity and ids.output_capacity must be non-zero",
            ));
        }

        // Slots are indexed by `bucket * bucket_capacity + slot`, counters by `bucket * 2 + 1`.
        let addressable = self
            .num_buckets
            .checked_mul(self.bucket_capacity)
            .zip(self.num_buckets.checked_mul(2))
            .zip(self.output_capacity.checked_add(1));
        if addressable.is_none() {
            return Err(invalid(format!(
                "ids table of {} buckets by {} slots with output capacity {} overflows u32 indices",
                self.num_buckets, self.bucket_capacity, self.output_capacity
            )));
        }
        Ok(())
    }

    /// Expected number of distinct ids lost when `distinct_ids` ids
    /// are spread uniformly over the buckets.
    ///
    /// Bucket occupancy is modelled as Poisson with mean `distinct_ids / num_buckets`.
    /// Ids beyond `output_capacity` are lost as well.
    pub fn expected_loss(&self, distinct_ids: u32) -> f64 {
        if self.num_buckets == 0 {
            return distinct_ids as f64;
        }

        let lambda = distinct_ids as f64 / self.num_buckets as f64;
        let capacity = self.bucket_capacity as u64;

        // E[max(K - c, 0)] = lambda - c + sum_{k <= c} (c - k) P(K = k)
        let mut below = 0.0;
        if lambda > 0.0 {
            let ln_lambda = lambda.ln();
            let mut ln_p = -lambda;
            for k in 0..=capacity {
                below += (capacity - k) as f64 * ln_p.exp();
                ln_p += ln_lambda - ((k + 1) as f64).ln();
            }
        } else {
            below = capacity as f64;
        }

        let per_bucket = (lambda - capacity as f64 + below).max(0.0);
        let bucket_loss = per_bucket * self.num_buckets as f64;

        let kept = distinct_ids as f64 - bucket_loss;
        let output_loss = (kept - self.output_capacity as f64).max(0.0);
        bucket_loss + output_loss
    }
}

/// Where the triangle build takes its primitive count from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriangleCountSource {
    /// Count produced on the device, consumed as an indirect build count.
    #[default]
    Gpu,

    /// Always `max_triangles` with an update-mode build.
    ///
    /// Refits stale slots beyond the real count together with live ones.
    /// Kept for comparison with the fixed-cap behavior only.
    FixedCap,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangleConfig {
    pub max_triangles: u32,
    pub count_source: TriangleCountSource,
}

impl Default for TriangleConfig {
    fn default() -> Self {
        TriangleConfig {
            max_triangles: 1 << 17,
            count_source: TriangleCountSource::Gpu,
        }
    }
}

impl ProxyConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ProxyError> {
        let config: ProxyConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let s = std::fs::read_to_string(path).map_err(|source| ProxyError::ConfigIo {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        let tree = &self.tree;
        if tree.levels < 2 {
            return Err(invalid("tree.levels must be at least 2"));
        }
        if !(-1.0..=1.0).contains(&tree.normal_threshold) {
            return Err(invalid("tree.normal_threshold must be within [-1, 1]"));
        }
        for (name, value) in [
            ("tree.plane_distance", tree.plane_distance),
            ("tree.gap_threshold", tree.gap_threshold),
            ("tree.thickness", tree.thickness),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!("{name} must be finite and non-negative")));
            }
        }

        self.ids.validate()?;

        let triangles = &self.triangles;
        if triangles.max_triangles == 0 || triangles.max_triangles > MAX_TRIANGLES_LIMIT {
            return Err(invalid(format!(
                "triangles.max_triangles must be within 1..={MAX_TRIANGLES_LIMIT}"
            )));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ProxyError {
    ProxyError::InvalidConfig(message.into())
}
