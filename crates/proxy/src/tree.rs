//! Hierarchical compression of depth and normals into plane patches.
//!
//! Level 0 holds one plane node per depth texel.
//! Each following level merges 2x2 blocks of the previous one
//! when they lie on a common plane. Blocks that cannot merge emit
//! their pending children as boxes, so every valid texel ends up covered
//! by exactly one emitted box, usually a coarse one.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use mev::{Argument, BufferView, Invocation, KernelContext, PipelineStages, PrimitiveCount};

use crate::{
    accel::DepthAs,
    camera::{mip_extent, CameraParams, Projection},
    config::{TreeConfig, TreeElementCount},
    graph::{FrameGraph, Resource, Usage},
    volume::{work_groups, BoundingVolume},
    ProxyError,
};

const TILE: [u32; 3] = [8, 8, 1];
const LINEAR: [u32; 3] = [64, 1, 1];

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u32 {
        /// Node describes a surface patch.
        const VALID = 1;

        /// Node box is already in the output.
        const EMITTED = 2;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ProcessFlags: u32 {
        /// Reject merges of blocks with depth discontinuities.
        const GAP_CHECK = 1;

        /// Last processed level. Merged nodes emit their own boxes.
        const FINAL = 2;
    }
}

/// Plane patch of one pyramid texel, in view space.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct PlaneNode {
    pub center: [f32; 3],

    /// Octahedral-encoded unit normal, two 16-bit snorm components.
    pub normal: u32,

    /// Half of the patch side.
    pub half_size: f32,

    /// Linear depth of the patch center.
    pub depth: f32,

    pub flags: u32,
    pub _pad: u32,
}

impl PlaneNode {
    pub const INVALID: Self = PlaneNode {
        center: [0.0; 3],
        normal: 0,
        half_size: 0.0,
        depth: 0.0,
        flags: 0,
        _pad: 0,
    };

    pub fn new(center: [f32; 3], normal: [f32; 3], half_size: f32, depth: f32) -> Self {
        PlaneNode {
            center,
            normal: oct_encode(normal),
            half_size,
            depth,
            flags: NodeFlags::VALID.bits(),
            _pad: 0,
        }
    }

    /// Node of depth texel `(x, y)` of an `extent`-sized level.
    /// Invalid for background texels and unusable normals.
    pub fn from_texel(
        projection: &Projection,
        x: u32,
        y: u32,
        extent: [u32; 2],
        d: f32,
        normal: [f32; 3],
    ) -> Self {
        if projection.is_background(d) {
            return PlaneNode::INVALID;
        }
        let z = projection.linear_depth(d);
        if !z.is_finite() || z <= 0.0 {
            return PlaneNode::INVALID;
        }
        let Some(normal) = normalize(normal) else {
            return PlaneNode::INVALID;
        };

        let uv = [
            (x as f32 + 0.5) / extent[0].max(1) as f32,
            (y as f32 + 0.5) / extent[1].max(1) as f32,
        ];
        let [fx, fy] = projection.footprint(extent, z);

        PlaneNode::new(projection.view_position(uv, z), normal, fx.max(fy) * 0.5, z)
    }

    pub fn node_flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.flags)
    }

    pub fn is_valid(&self) -> bool {
        self.node_flags().contains(NodeFlags::VALID)
    }

    /// Valid and not emitted yet.
    pub fn is_pending(&self) -> bool {
        self.node_flags() == NodeFlags::VALID
    }

    pub fn normal(&self) -> [f32; 3] {
        oct_decode(self.normal)
    }

    /// Box enclosing the patch, thickened along the normal by `thickness * half_size`.
    pub fn bounds(&self, thickness: f32) -> BoundingVolume {
        let n = self.normal();
        let h = self.half_size;
        let half = std::array::from_fn(|i| {
            h * (2.0 * (1.0 - n[i] * n[i])).max(0.0).sqrt() + thickness * h
        });
        BoundingVolume::from_center_half(self.center, half)
    }
}

/// Thresholds of the merge rule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MergeParams {
    pub normal_threshold: f32,
    pub plane_distance: f32,
    pub gap_threshold: f32,
}

impl From<&TreeConfig> for MergeParams {
    fn from(config: &TreeConfig) -> Self {
        MergeParams {
            normal_threshold: config.normal_threshold,
            plane_distance: config.plane_distance,
            gap_threshold: config.gap_threshold,
        }
    }
}

/// Merges up to four children into their parent.
/// Returns `None` if they do not form a single plane patch.
pub fn merge(children: &[PlaneNode], params: &MergeParams, gap_check: bool) -> Option<PlaneNode> {
    if children.is_empty() || !children.iter().all(PlaneNode::is_pending) {
        return None;
    }

    let inv = 1.0 / children.len() as f32;
    let mut center = [0.0f32; 3];
    let mut normal = [0.0f32; 3];
    let mut depth = 0.0;
    let mut child_half = 0.0f32;
    let mut min_depth = f32::INFINITY;
    let mut max_depth = f32::NEG_INFINITY;

    for child in children {
        let n = child.normal();
        for i in 0..3 {
            center[i] += child.center[i] * inv;
            normal[i] += n[i] * inv;
        }
        depth += child.depth * inv;
        child_half = child_half.max(child.half_size);
        min_depth = min_depth.min(child.depth);
        max_depth = max_depth.max(child.depth);
    }

    let normal = normalize(normal)?;
    let half_size = 2.0 * child_half;

    if gap_check && max_depth - min_depth > params.gap_threshold * half_size {
        return None;
    }

    for child in children {
        if dot(child.normal(), normal) < params.normal_threshold {
            return None;
        }
        let offset = std::array::from_fn(|i| child.center[i] - center[i]);
        if dot(offset, normal).abs() > params.plane_distance * half_size {
            return None;
        }
    }

    Some(PlaneNode::new(center, normal, half_size, depth))
}

/// Number of pyramid levels for a base of `extent`, including the base.
///
/// Never fewer than two so that at least one merge pass runs.
pub fn level_count(extent: mev::Extent2, max_levels: u32) -> u32 {
    let side = extent.width().min(extent.height()).max(1);
    max_levels.min(side.ilog2() + 1).max(2)
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn normalize(v: [f32; 3]) -> Option<[f32; 3]> {
    let len = dot(v, v).sqrt();
    if !len.is_finite() || len < 1e-6 {
        return None;
    }
    Some(v.map(|c| c / len))
}

fn sign(v: f32) -> f32 {
    if v >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

fn snorm16(v: f32) -> u32 {
    (v.clamp(-1.0, 1.0) * 32767.0).round() as i16 as u16 as u32
}

fn unsnorm16(bits: u32) -> f32 {
    (bits as u16 as i16 as f32 / 32767.0).max(-1.0)
}

pub fn oct_encode(n: [f32; 3]) -> u32 {
    let l1 = n[0].abs() + n[1].abs() + n[2].abs();
    if l1 <= 0.0 || !l1.is_finite() {
        return 0;
    }
    let (mut x, mut y) = (n[0] / l1, n[1] / l1);
    if n[2] < 0.0 {
        (x, y) = ((1.0 - y.abs()) * sign(x), (1.0 - x.abs()) * sign(y));
    }
    snorm16(x) | (snorm16(y) << 16)
}

pub fn oct_decode(bits: u32) -> [f32; 3] {
    let mut x = unsnorm16(bits & 0xFFFF);
    let mut y = unsnorm16(bits >> 16);
    let z = 1.0 - x.abs() - y.abs();
    if z < 0.0 {
        (x, y) = ((1.0 - y.abs()) * sign(x), (1.0 - x.abs()) * sign(y));
    }
    normalize([x, y, z]).unwrap_or([0.0, 0.0, 1.0])
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct ClearConstants {
    count: u32,
}

struct ClearBoxes;

impl mev::Kernel for ClearBoxes {
    fn invoke(&self, cx: &KernelContext, inv: Invocation) {
        let c: ClearConstants = cx.constants();
        if inv.global[0] < c.count {
            cx.buffer(0).write(inv.global[0], &BoundingVolume::PARKED);
        }
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct InitConstants {
    projection: Projection,
    extent: [u32; 2],
    _pad: [u32; 2],
}

struct InitLevel;

impl mev::Kernel for InitLevel {
    fn invoke(&self, cx: &KernelContext, inv: Invocation) {
        let c: InitConstants = cx.constants();
        let [w, h] = c.extent;
        let [x, y, _] = inv.global;
        if x >= w || y >= h {
            return;
        }

        let d = cx.image(0).load(x, y)[0];
        let [nx, ny, nz, _] = cx.image(1).load(x, y);
        let node = PlaneNode::from_texel(&c.projection, x, y, c.extent, d, [nx, ny, nz]);
        cx.buffer(2).write(y * w + x, &node);
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct ProcessConstants {
    src_extent: [u32; 2],
    dst_extent: [u32; 2],
    flags: u32,
    capacity: u32,
    normal_threshold: f32,
    plane_distance: f32,
    gap_threshold: f32,
    thickness: f32,
    _pad: [u32; 2],
}

struct ProcessLevel;

impl ProcessLevel {
    fn emit(aabbs: BufferView, counter: BufferView, c: &ProcessConstants, node: &PlaneNode) {
        let slot = counter.atomic_add(0, 1);
        if slot < c.capacity {
            aabbs.write(slot, &node.bounds(c.thickness));
        }
    }
}

impl mev::Kernel for ProcessLevel {
    fn invoke(&self, cx: &KernelContext, inv: Invocation) {
        let c: ProcessConstants = cx.constants();
        let [sw, sh] = c.src_extent;
        let [dw, dh] = c.dst_extent;
        let [x, y, _] = inv.global;
        if x >= dw || y >= dh {
            return;
        }

        let src = cx.buffer(0);
        let dst = cx.buffer(1);
        let aabbs = cx.buffer(2);
        let counter = cx.buffer(3);
        let flags = ProcessFlags::from_bits_truncate(c.flags);

        let mut children = [PlaneNode::INVALID; 4];
        let mut present = 0;
        for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            let (sx, sy) = (2 * x + dx, 2 * y + dy);
            if sx < sw && sy < sh {
                children[present] = src.read(sy * sw + sx);
                present += 1;
            }
        }
        let children = &children[..present];

        let params = MergeParams {
            normal_threshold: c.normal_threshold,
            plane_distance: c.plane_distance,
            gap_threshold: c.gap_threshold,
        };

        match merge(children, &params, flags.contains(ProcessFlags::GAP_CHECK)) {
            Some(mut parent) => {
                if flags.contains(ProcessFlags::FINAL) {
                    Self::emit(aabbs, counter, &c, &parent);
                    parent.flags |= NodeFlags::EMITTED.bits();
                }
                dst.write(y * dw + x, &parent);
            }
            None => {
                dst.write(y * dw + x, &PlaneNode::INVALID);
                for child in children.iter().filter(|child| child.is_pending()) {
                    Self::emit(aabbs, counter, &c, child);
                }
            }
        }
    }
}

/// Builds the plane pyramid and feeds emitted boxes to the depth acceleration structures.
pub struct HierarchicalDepthCompressor {
    clear: mev::ComputePipeline,
    init: mev::ComputePipeline,
    process: mev::ComputePipeline,
    base_mip: u32,
    extents: Vec<mev::Extent2>,
    levels: Vec<mev::Buffer>,
    aabbs: mev::Buffer,
    counter: mev::Buffer,
}

impl HierarchicalDepthCompressor {
    /// Allocates the pyramid for depth images of `depth_extent`.
    ///
    /// Base mip and level count are taken from `config` here, thresholds on every run.
    pub fn new(
        device: &mev::Device,
        depth_extent: mev::Extent2,
        config: &TreeConfig,
    ) -> Result<Self, ProxyError> {
        let base = mip_extent(depth_extent, config.base_mip);
        let count = level_count(base, config.levels);

        let mut extents = vec![base];
        for _ in 1..count {
            let last = extents[extents.len() - 1];
            extents.push(mip_extent(last, 1));
        }

        let levels = extents
            .iter()
            .map(|extent| {
                device.new_buffer(mev::BufferDesc {
                    size: extent.area() as usize * std::mem::size_of::<PlaneNode>(),
                    usage: mev::BufferUsage::STORAGE | mev::BufferUsage::TRANSFER_DST,
                    memory: mev::Memory::Device,
                    name: "tree-level",
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Plane pyramid levels: {extents:?}");

        let aabbs = device.new_buffer(mev::BufferDesc {
            size: base.area() as usize * BoundingVolume::SIZE,
            usage: mev::BufferUsage::STORAGE | mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: mev::Memory::Device,
            name: "tree-aabbs",
        })?;

        let counter = device.new_buffer(mev::BufferDesc {
            size: 4,
            usage: mev::BufferUsage::STORAGE
                | mev::BufferUsage::TRANSFER_DST
                | mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: mev::Memory::Device,
            name: "tree-counter",
        })?;

        let pipeline = |name: &str, kernel: Arc<dyn mev::Kernel>, work_group_size: [u32; 3]| {
            device.new_compute_pipeline(mev::ComputePipelineDesc {
                name,
                kernel,
                work_group_size,
            })
        };

        Ok(HierarchicalDepthCompressor {
            clear: pipeline("tree_clear", Arc::new(ClearBoxes), LINEAR)?,
            init: pipeline("tree_init", Arc::new(InitLevel), TILE)?,
            process: pipeline("tree_process", Arc::new(ProcessLevel), TILE)?,
            base_mip: config.base_mip,
            extents,
            levels,
            aabbs,
            counter,
        })
    }

    /// Extent of level 0. Depth structures fed by the pyramid must be created for it.
    pub fn base_extent(&self) -> mev::Extent2 {
        self.extents[0]
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn level_extent(&self, level: u32) -> mev::Extent2 {
        self.extents
            .get(level as usize)
            .copied()
            .unwrap_or(mev::Extent2::ZERO)
    }

    pub fn level(&self, level: u32) -> Option<&mev::Buffer> {
        self.levels.get(level as usize)
    }

    pub fn aabbs(&self) -> &mev::Buffer {
        &self.aabbs
    }

    /// Number of emitted boxes, as a single `u32`.
    pub fn counter(&self) -> &mev::Buffer {
        &self.counter
    }

    /// Records the whole pyramid as a single pass.
    pub fn run(
        &mut self,
        graph: &mut impl FrameGraph,
        depth_as: &mut DepthAs,
        depth: &mev::Image,
        normals: &mev::Image,
        camera: &CameraParams,
        config: &TreeConfig,
    ) -> Result<(), ProxyError> {
        let base = self.base_extent();
        for (image, found) in [
            (depth, depth.level_extent(self.base_mip)),
            (normals, normals.level_extent(self.base_mip)),
            (depth, depth_as.extent()),
        ] {
            if found != base {
                tracing::error!("'{}' does not match pyramid base {base:?}", image.name());
                return Err(ProxyError::ExtentMismatch {
                    name: "depth-tree",
                    expected: base,
                    found,
                });
            }
        }

        let mut pass = {
            let tlas = depth_as.tlas().ok_or(ProxyError::NotCreated("depth"))?;
            let mut usage = vec![
                (Resource::Image(depth), Usage::Sample { level: self.base_mip }),
                (Resource::Image(normals), Usage::Sample { level: self.base_mip }),
                (Resource::Buffer(&self.aabbs), Usage::Write),
                (Resource::Buffer(&self.counter), Usage::ReadWrite),
                (Resource::Tlas(tlas), Usage::Build),
            ];
            usage.extend(
                self.levels
                    .iter()
                    .map(|level| (Resource::Buffer(level), Usage::ReadWrite)),
            );
            graph.pass("depth_tree", &usage)
        };

        // CLEAR
        let count = base.area();
        pass.barrier(
            PipelineStages::ALL_COMMANDS,
            PipelineStages::TRANSFER | PipelineStages::COMPUTE_SHADER,
        );
        let mut copy = pass.copy();
        copy.fill_buffer(&self.levels[0], 0);
        copy.fill_buffer(&self.counter, 0);

        let mut compute = pass.compute();
        compute.with_pipeline(&self.clear);
        compute.with_arguments(&[Argument::write(&self.aabbs)]);
        compute.with_constants(&ClearConstants { count });
        compute.dispatch([work_groups(count, LINEAR[0]), 1, 1]);

        pass.barrier(
            PipelineStages::TRANSFER | PipelineStages::COMPUTE_SHADER,
            PipelineStages::COMPUTE_SHADER,
        );

        // INIT
        let mut compute = pass.compute();
        compute.with_pipeline(&self.init);
        compute.with_arguments(&[
            Argument::sampled(depth, self.base_mip),
            Argument::sampled(normals, self.base_mip),
            Argument::write(&self.levels[0]),
        ]);
        compute.with_constants(&InitConstants {
            projection: camera.projection(),
            extent: base.0,
            _pad: [0; 2],
        });
        compute.dispatch([
            work_groups(base.width(), TILE[0]),
            work_groups(base.height(), TILE[1]),
            1,
        ]);

        // PROCESS
        let last = self.levels.len() - 2;
        for k in 0..=last {
            let mut flags = ProcessFlags::empty();
            flags.set(ProcessFlags::GAP_CHECK, k == 0);
            flags.set(ProcessFlags::FINAL, k == last);

            let (src, dst) = (self.extents[k], self.extents[k + 1]);

            pass.barrier(PipelineStages::COMPUTE_SHADER, PipelineStages::COMPUTE_SHADER);
            let mut compute = pass.compute();
            compute.with_pipeline(&self.process);
            compute.with_arguments(&[
                Argument::read(&self.levels[k]),
                Argument::write(&self.levels[k + 1]),
                Argument::write(&self.aabbs),
                Argument::read_write(&self.counter),
            ]);
            compute.with_constants(&ProcessConstants {
                src_extent: src.0,
                dst_extent: dst.0,
                flags: flags.bits(),
                capacity: count,
                normal_threshold: config.normal_threshold,
                plane_distance: config.plane_distance,
                gap_threshold: config.gap_threshold,
                thickness: config.thickness,
                _pad: [0; 2],
            });
            compute.dispatch([
                work_groups(dst.width(), TILE[0]),
                work_groups(dst.height(), TILE[1]),
                1,
            ]);
        }

        // BUILD_AABB_AS
        pass.barrier(
            PipelineStages::COMPUTE_SHADER,
            PipelineStages::ACCELERATION_STRUCTURE_BUILD,
        );
        let elements = match config.element_count {
            TreeElementCount::BaseResolution => PrimitiveCount::Direct(count),
            TreeElementCount::GpuCounter => PrimitiveCount::Indirect(self.counter.slice(..)),
        };
        depth_as.update(&mut pass, elements, self.aabbs.slice(..))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use crate::graph::SequentialGraph;

    use super::*;

    #[test]
    fn octahedral_normals() {
        let normals = [
            [0.0, 0.0, 1.0],
            [0.0, 0.0, -1.0],
            [1.0, 0.0, 0.0],
            [0.267, -0.534, 0.801],
            [-0.577, 0.577, -0.577],
        ];
        for n in normals {
            let n = normalize(n).unwrap();
            let decoded = oct_decode(oct_encode(n));
            assert!(dot(n, decoded) > 0.9999, "{n:?} -> {decoded:?}");
        }
    }

    fn wall(center: [f32; 3], half_size: f32) -> PlaneNode {
        PlaneNode::new(center, [0.0, 0.0, 1.0], half_size, -center[2])
    }

    #[test]
    fn merge_rules() {
        let params = MergeParams::from(&TreeConfig::default());
        let coplanar = [
            wall([-0.5, -0.5, -10.0], 0.5),
            wall([0.5, -0.5, -10.0], 0.5),
            wall([-0.5, 0.5, -10.0], 0.5),
            wall([0.5, 0.5, -10.0], 0.5),
        ];

        let parent = merge(&coplanar, &params, true).unwrap();
        assert!(parent.is_pending());
        assert_eq!(parent.half_size, 1.0);
        assert_abs_diff_eq!(parent.center[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(parent.center[2], -10.0, epsilon = 1e-6);

        // Edge blocks have fewer children.
        assert!(merge(&coplanar[..2], &params, true).is_some());

        let mut holed = coplanar;
        holed[3] = PlaneNode::INVALID;
        assert!(merge(&holed, &params, true).is_none());

        let mut emitted = coplanar;
        emitted[0].flags |= NodeFlags::EMITTED.bits();
        assert!(merge(&emitted, &params, true).is_none());

        let mut bent = coplanar;
        bent[1] = PlaneNode::new(bent[1].center, [0.7, 0.0, 0.7], 0.5, 10.0);
        assert!(merge(&bent, &params, true).is_none());

        let mut stepped = coplanar;
        stepped[2].center[2] = -11.0;
        assert!(merge(&stepped, &params, false).is_none());

        // Depth spread alone is only rejected by the gap check.
        let mut gapped = coplanar;
        gapped[0].depth = 13.0;
        assert!(merge(&gapped, &params, true).is_none());
        assert!(merge(&gapped, &params, false).is_some());
    }

    #[test]
    fn facing_patch_bounds() {
        let node = wall([1.0, 2.0, -10.0], 0.5);
        let b = node.bounds(0.1);
        assert!(b.is_well_formed());
        assert_abs_diff_eq!(b.max[0] - b.min[0], 2.0 * (0.5 * 2f32.sqrt() + 0.05), epsilon = 1e-4);
        assert_abs_diff_eq!(b.max[2] - b.min[2], 0.1, epsilon = 1e-4);
    }

    #[test]
    fn levels() {
        assert_eq!(level_count(mev::Extent2::new(64, 32), 5), 5);
        assert_eq!(level_count(mev::Extent2::new(64, 32), 10), 6);
        assert_eq!(level_count(mev::Extent2::new(4, 4), 10), 3);
        assert_eq!(level_count(mev::Extent2::new(1, 1), 5), 2);
    }

    struct Scene {
        device: mev::Device,
        queue: mev::Queue,
        camera: CameraParams,
        depth: mev::Image,
        normals: mev::Image,
        depth_as: DepthAs,
    }

    const EXTENT: mev::Extent2 = mev::Extent2::new(64, 32);

    /// Wall facing the camera at distance `z(x)` per texel column.
    fn scene(z: impl Fn(u32) -> f32) -> Scene {
        let (device, mut queues) = mev::Instance::new()
            .create(mev::DeviceDesc::default())
            .unwrap();
        let mut queue = queues.remove(0);
        let camera = CameraParams::new(1.0, EXTENT, 0.1, 100.0);
        let projection = camera.projection();

        let image = |format, name| {
            device
                .new_image(mev::ImageDesc::new_2d(
                    EXTENT,
                    format,
                    mev::ImageUsage::SAMPLED,
                    name,
                ))
                .unwrap()
        };
        let depth = image(mev::PixelFormat::D32Float, "depth");
        let normals = image(mev::PixelFormat::Rgba32Float, "normals");

        let mut d = Vec::new();
        let mut n = Vec::new();
        for _y in 0..EXTENT.height() {
            for x in 0..EXTENT.width() {
                d.push(projection.projective_depth(z(x)));
                n.push([0.0f32, 0.0, 1.0, 0.0]);
            }
        }
        depth.write_level(0, &d);
        normals.write_level(0, &n);

        let mut depth_as = DepthAs::new();
        depth_as.create(&device, &mut queue, EXTENT).unwrap();

        Scene {
            device,
            queue,
            camera,
            depth,
            normals,
            depth_as,
        }
    }

    fn run(scene: &mut Scene, config: &TreeConfig) -> (HierarchicalDepthCompressor, Vec<BoundingVolume>) {
        let mut tree = HierarchicalDepthCompressor::new(&scene.device, EXTENT, config).unwrap();
        let mut graph = SequentialGraph::begin(&mut scene.queue).unwrap();
        tree.run(
            &mut graph,
            &mut scene.depth_as,
            &scene.depth,
            &scene.normals,
            &scene.camera,
            config,
        )
        .unwrap();
        graph.submit(&mut scene.queue).unwrap();
        scene.queue.wait_idle().unwrap();

        assert!(scene.queue.hazards().is_empty());
        assert!(scene.queue.validation_errors().is_empty());

        let emitted = tree.counter().read_pod::<u32>(0, 1)[0];
        let boxes = tree.aabbs().read_pod(0, emitted as usize);
        (tree, boxes)
    }

    #[test]
    fn planar_wall_collapses() {
        let mut scene = scene(|_| 10.0);
        let config = TreeConfig::default();
        let (tree, boxes) = run(&mut scene, &config);

        assert_eq!(tree.level_count(), 5);
        assert_eq!(tree.level_extent(4), mev::Extent2::new(4, 2));
        assert_eq!(boxes.len(), 8);
        assert!(boxes.iter().all(BoundingVolume::is_well_formed));

        let all: Vec<BoundingVolume> = tree.aabbs().read_pod(0, EXTENT.area() as usize);
        assert!(all[8..].iter().all(BoundingVolume::is_parked));
        assert_eq!(
            scene.depth_as.blas().unwrap().blas().primitive_count(),
            Some(EXTENT.area())
        );

        let hit = scene
            .depth_as
            .tlas()
            .unwrap()
            .intersect([0.0; 3], [0.0, 0.0, -1.0], 0.0, f32::INFINITY)
            .unwrap();
        assert!(hit.t > 9.5 && hit.t <= 10.0, "hit at {}", hit.t);
    }

    #[test]
    fn gap_keeps_layers_apart() {
        let mut scene = scene(|x| if x < 33 { 5.0 } else { 20.0 });
        let config = TreeConfig {
            element_count: TreeElementCount::GpuCounter,
            ..TreeConfig::default()
        };
        let (_tree, boxes) = run(&mut scene, &config);

        assert!(boxes.len() > 8);
        for b in &boxes {
            assert!(b.is_well_formed());
            assert!(b.max[2] - b.min[2] < 5.0, "box spans layers: {b:?}");
        }
        assert_eq!(
            scene.depth_as.blas().unwrap().blas().primitive_count(),
            Some(boxes.len() as u32)
        );

        let tlas = scene.depth_as.tlas().unwrap();
        let p = scene.camera.projection();
        let near = tlas
            .intersect([0.0; 3], p.view_ray([0.25, 0.5]), 0.0, f32::INFINITY)
            .unwrap();
        let far = tlas
            .intersect([0.0; 3], p.view_ray([0.75, 0.5]), 0.0, f32::INFINITY)
            .unwrap();
        assert!(near.t > 4.0 && near.t <= 5.0, "near hit at {}", near.t);
        assert!(far.t > 18.0 && far.t <= 20.0, "far hit at {}", far.t);
    }
}
