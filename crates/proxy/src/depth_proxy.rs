//! One box per depth texel.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use mev::{Argument, Invocation, KernelContext, PipelineStages, PrimitiveCount};

use crate::{
    accel::DepthAs,
    camera::{CameraParams, Projection},
    graph::{FrameGraph, Resource, Usage},
    volume::BoundingVolume,
    ProxyError,
};

const WORK_GROUP: [u32; 3] = [8, 4, 1];

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Constants {
    projection: Projection,
    extent: [u32; 2],
    _pad: [u32; 2],
}

/// Writes the view-space box of every texel of the bound depth level.
struct BuildDepthAs;

impl mev::Kernel for BuildDepthAs {
    fn invoke(&self, cx: &KernelContext, inv: Invocation) {
        let constants: Constants = cx.constants();
        let [w, h] = constants.extent;
        let [x, y, _] = inv.global;
        if x >= w || y >= h {
            return;
        }

        let d = cx.image(0).load(x, y)[0];
        let projection = &constants.projection;

        let volume = if projection.is_background(d) {
            BoundingVolume::PARKED
        } else {
            let volume = projection.texel_volume(x, y, constants.extent, d);
            if volume.is_well_formed() {
                volume
            } else {
                BoundingVolume::PARKED
            }
        };

        cx.buffer(1).write(y * w + x, &volume);
    }
}

/// Converts a depth mip into boxes and refits the depth acceleration structures over them.
pub struct DepthProxyBuilder {
    pipeline: mev::ComputePipeline,
    aabbs: mev::Buffer,
    capacity: u32,
}

impl DepthProxyBuilder {
    /// Allocates room for one box per texel of `base_extent`, enough for any of its mips.
    pub fn new(device: &mev::Device, base_extent: mev::Extent2) -> Result<Self, ProxyError> {
        let capacity = base_extent.area();
        let pipeline = device.new_compute_pipeline(mev::ComputePipelineDesc {
            name: "build_depth_as",
            kernel: Arc::new(BuildDepthAs),
            work_group_size: WORK_GROUP,
        })?;

        let aabbs = device.new_buffer(mev::BufferDesc {
            size: capacity as usize * BoundingVolume::SIZE,
            usage: mev::BufferUsage::STORAGE | mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: mev::Memory::Device,
            name: "depth-aabbs",
        })?;

        Ok(DepthProxyBuilder {
            pipeline,
            aabbs,
            capacity,
        })
    }

    pub fn aabbs(&self) -> &mev::Buffer {
        &self.aabbs
    }

    /// Records the pass. Returns the primitive count the bottom-level index is updated with.
    pub fn run(
        &mut self,
        graph: &mut impl FrameGraph,
        depth_as: &mut DepthAs,
        depth: &mev::Image,
        mip: u32,
        camera: &CameraParams,
    ) -> Result<u32, ProxyError> {
        let extent = depth.level_extent(mip);
        if extent != depth_as.extent() {
            return Err(ProxyError::ExtentMismatch {
                name: "depth-proxy",
                expected: depth_as.extent(),
                found: extent,
            });
        }

        let count = extent.area();
        if count > self.capacity {
            return Err(ProxyError::CapacityExceeded {
                name: "depth-aabbs".to_owned(),
                count,
                capacity: self.capacity,
            });
        }

        let tlas = depth_as.tlas().ok_or(ProxyError::NotCreated("depth"))?;
        let aabbs = self.aabbs.slice(..count as usize * BoundingVolume::SIZE);

        let mut pass = graph.pass(
            "build_depth_as",
            &[
                (Resource::Image(depth), Usage::Sample { level: mip }),
                (Resource::Buffer(&self.aabbs), Usage::Write),
                (Resource::Tlas(tlas), Usage::Build),
            ],
        );

        // Boxes may still be read by the previous build.
        pass.barrier(PipelineStages::ALL_COMMANDS, PipelineStages::COMPUTE_SHADER);

        let constants = Constants {
            projection: camera.projection(),
            extent: [extent.width(), extent.height()],
            _pad: [0; 2],
        };

        let mut compute = pass.compute();
        compute.with_pipeline(&self.pipeline);
        compute.with_arguments(&[Argument::sampled(depth, mip), Argument::write(aabbs)]);
        compute.with_constants(&constants);
        compute.dispatch([
            extent.width().div_ceil(WORK_GROUP[0]),
            extent.height().div_ceil(WORK_GROUP[1]),
            1,
        ]);

        pass.barrier(
            PipelineStages::COMPUTE_SHADER,
            PipelineStages::ACCELERATION_STRUCTURE_BUILD,
        );

        depth_as.update(&mut pass, PrimitiveCount::Direct(count), aabbs)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::{camera::DepthConvention, graph::SequentialGraph};

    use super::*;

    fn setup() -> (mev::Device, mev::Queue) {
        let (device, mut queues) = mev::Instance::new()
            .create(mev::DeviceDesc::default())
            .unwrap();
        (device, queues.remove(0))
    }

    /// Depth image whose level `level` is filled by `depth(x, y)`.
    fn depth_image(
        device: &mev::Device,
        extent: mev::Extent2,
        level: u32,
        depth: impl Fn(u32, u32) -> f32,
    ) -> mev::Image {
        let image = device
            .new_image(
                mev::ImageDesc::new_2d(
                    extent,
                    mev::PixelFormat::D32Float,
                    mev::ImageUsage::SAMPLED,
                    "depth",
                )
                .with_levels(level + 1),
            )
            .unwrap();

        let level_extent = image.level_extent(level);
        let texels: Vec<f32> = (0..level_extent.height())
            .flat_map(|y| (0..level_extent.width()).map(move |x| (x, y)))
            .map(|(x, y)| depth(x, y))
            .collect();
        image.write_level(level, &texels);
        image
    }

    #[test]
    fn one_box_per_mip_texel() {
        let (device, mut queue) = setup();
        let base = mev::Extent2::new(1920, 1080);
        let camera = CameraParams::new(1.0, base, 0.1, 100.0);
        let d = camera.projection().projective_depth(10.0);
        let depth = depth_image(&device, base, 1, |_, _| d);

        let mut depth_as = DepthAs::new();
        depth_as
            .create(&device, &mut queue, mev::Extent2::new(960, 540))
            .unwrap();
        let mut builder = DepthProxyBuilder::new(&device, base).unwrap();

        let mut graph = SequentialGraph::begin(&mut queue).unwrap();
        let count = builder
            .run(&mut graph, &mut depth_as, &depth, 1, &camera)
            .unwrap();
        graph.submit(&mut queue).unwrap();
        queue.wait_idle().unwrap();

        assert_eq!(count, 518_400);
        assert_eq!(depth_as.blas().unwrap().blas().primitive_count(), Some(518_400));
        assert!(queue.hazards().is_empty());
        assert!(queue.validation_errors().is_empty());

        let boxes: Vec<BoundingVolume> = builder.aabbs().read_pod(0, count as usize);
        assert!(boxes.iter().all(BoundingVolume::is_well_formed));
        assert!(boxes.iter().all(|b| !b.is_parked()));

        let hit = depth_as
            .tlas()
            .unwrap()
            .intersect([0.0; 3], [0.0, 0.0, -1.0], 0.0, f32::INFINITY)
            .unwrap();
        assert!(hit.t > 9.9 && hit.t <= 10.0, "hit at {}", hit.t);
    }

    #[test]
    fn background_is_parked() {
        let (device, mut queue) = setup();
        let extent = mev::Extent2::new(16, 8);
        let camera = CameraParams::new(1.2, extent, 0.1, 50.0).with_depth(DepthConvention::Reversed);
        let near = camera.projection().projective_depth(3.0);

        // Left half is geometry, right half is sky.
        let depth = depth_image(&device, extent, 0, |x, _| if x < 8 { near } else { 0.0 });

        let mut depth_as = DepthAs::new();
        depth_as.create(&device, &mut queue, extent).unwrap();
        let mut builder = DepthProxyBuilder::new(&device, extent).unwrap();

        let mut graph = SequentialGraph::begin(&mut queue).unwrap();
        builder
            .run(&mut graph, &mut depth_as, &depth, 0, &camera)
            .unwrap();
        graph.submit(&mut queue).unwrap();
        queue.wait_idle().unwrap();

        let boxes: Vec<BoundingVolume> = builder.aabbs().read_pod(0, 128);
        for (i, b) in boxes.iter().enumerate() {
            assert!(b.is_well_formed());
            assert_eq!(b.is_parked(), i % 16 >= 8, "texel {i}");
        }

        let tlas = depth_as.tlas().unwrap();
        let p = camera.projection();
        let left = p.view_ray([0.25, 0.5]);
        let right = p.view_ray([0.75, 0.5]);
        assert!(tlas.intersect([0.0; 3], left, 0.0, f32::INFINITY).is_some());
        assert!(tlas.intersect([0.0; 3], right, 0.0, f32::INFINITY).is_none());
    }

    #[test]
    fn rejects_foreign_extent() {
        let (device, mut queue) = setup();
        let extent = mev::Extent2::new(8, 8);
        let camera = CameraParams::new(1.0, extent, 0.1, 10.0);
        let depth = depth_image(&device, extent, 0, |_, _| 0.5);

        let mut depth_as = DepthAs::new();
        let mut builder = DepthProxyBuilder::new(&device, extent).unwrap();
        let mut graph = SequentialGraph::begin(&mut queue).unwrap();

        assert!(matches!(
            builder.run(&mut graph, &mut depth_as, &depth, 0, &camera),
            Err(ProxyError::ExtentMismatch { .. })
        ));

        depth_as
            .create(&device, &mut queue, mev::Extent2::new(4, 4))
            .unwrap();
        assert!(matches!(
            builder.run(&mut graph, &mut depth_as, &depth, 0, &camera),
            Err(ProxyError::ExtentMismatch { .. })
        ));
    }
}
