//! Explicit triangles for the visible, deduplicated triangle ids.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use mev::{Argument, BufferView, BuildMode, Invocation, KernelContext, PipelineStages, PrimitiveCount};

use crate::{
    accel::{TriangleAs, TRIANGLE_VERTEX_SIZE},
    config::{TriangleConfig, TriangleCountSource, MAX_TRIANGLES_LIMIT},
    graph::{FrameGraph, Resource, Usage},
    scene::{
        world_triangle, DrawCall, PrimitiveRecord, SceneCounts, SceneGeometry, SceneReader,
        SceneVertex, Transform,
    },
    volume::{DispatchArgs, PARK_DISTANCE},
    ProxyError,
};

const GROUP_SIZE: u32 = 64;

/// Bytes of dispatch arguments followed by the build count.
const ARGS_SIZE: usize = DispatchArgs::SIZE + 4;

const PARKED_TRIANGLE: [[f32; 3]; 3] = [[0.0, 0.0, PARK_DISTANCE]; 3];

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct ArgsConstants {
    max_triangles: u32,
}

/// Turns the unique id count into dispatch arguments and a build count.
struct IndirectArgs;

impl mev::Kernel for IndirectArgs {
    fn invoke(&self, cx: &KernelContext, inv: Invocation) {
        if inv.global != [0; 3] {
            return;
        }
        let c: ArgsConstants = cx.constants();
        let n = cx.buffer(0).load(0).min(c.max_triangles);

        let args = cx.buffer(1);
        args.write(0, &DispatchArgs::linear(n, GROUP_SIZE));
        args.store(3, n);
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct GenerateConstants {
    view: Transform,
    counts: SceneCounts,
}

struct DeviceScene<'a> {
    counts: SceneCounts,
    draws: BufferView<'a>,
    primitives: BufferView<'a>,
    transforms: BufferView<'a>,
    indices: BufferView<'a>,
    vertices: BufferView<'a>,
}

impl SceneReader for DeviceScene<'_> {
    fn counts(&self) -> SceneCounts {
        self.counts
    }

    fn draw(&self, idx: u32) -> DrawCall {
        self.draws.read(idx)
    }

    fn primitive(&self, idx: u32) -> PrimitiveRecord {
        self.primitives.read(idx)
    }

    fn transform(&self, idx: u32) -> Transform {
        self.transforms.read(idx)
    }

    fn index(&self, idx: u32) -> u32 {
        self.indices.load(idx)
    }

    fn vertex(&self, idx: u32) -> SceneVertex {
        self.vertices.read(idx)
    }
}

/// Writes the view-space triangle of every unique id.
struct Generate;

impl mev::Kernel for Generate {
    fn invoke(&self, cx: &KernelContext, inv: Invocation) {
        let i = inv.global[0];
        if i >= cx.buffer(1).load(3) {
            return;
        }

        let c: GenerateConstants = cx.constants();
        let scene = DeviceScene {
            counts: c.counts,
            draws: cx.buffer(2),
            primitives: cx.buffer(3),
            transforms: cx.buffer(4),
            indices: cx.buffer(5),
            vertices: cx.buffer(6),
        };

        let id = cx.buffer(0).load(1 + i);
        let view = na::Matrix4::from_column_slice(&c.view);
        let triangle = match world_triangle(&scene, id) {
            Some(corners) => corners.map(|p| {
                let p = view.transform_point(&na::Point3::from(p));
                [p.x, p.y, p.z]
            }),
            None => PARKED_TRIANGLE,
        };

        cx.buffer(7).write(i, &triangle);
    }
}

/// Maintains the triangle acceleration structures over the triangles behind unique ids.
pub struct TriangleProxyBuilder {
    config: TriangleConfig,
    indirect_args: mev::ComputePipeline,
    generate: mev::ComputePipeline,
    args: mev::Buffer,
    vertices: mev::Buffer,
}

impl TriangleProxyBuilder {
    pub fn new(device: &mev::Device, config: &TriangleConfig) -> Result<Self, ProxyError> {
        if config.max_triangles == 0 || config.max_triangles > MAX_TRIANGLES_LIMIT {
            return Err(ProxyError::InvalidConfig(format!(
                "max_triangles must be in 1..={MAX_TRIANGLES_LIMIT}"
            )));
        }

        if config.count_source == TriangleCountSource::FixedCap {
            tracing::warn!(
                "Triangle builds use the fixed count {} and refit stale slots",
                config.max_triangles
            );
        }

        let indirect_args = device.new_compute_pipeline(mev::ComputePipelineDesc {
            name: "triangle_indirect_args",
            kernel: Arc::new(IndirectArgs),
            work_group_size: [1, 1, 1],
        })?;
        let generate = device.new_compute_pipeline(mev::ComputePipelineDesc {
            name: "triangle_generate",
            kernel: Arc::new(Generate),
            work_group_size: [GROUP_SIZE, 1, 1],
        })?;

        let args = device.new_buffer(mev::BufferDesc {
            size: ARGS_SIZE,
            usage: mev::BufferUsage::STORAGE
                | mev::BufferUsage::INDIRECT
                | mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: mev::Memory::Device,
            name: "triangle-args",
        })?;

        let vertices = device.new_buffer(mev::BufferDesc {
            size: config.max_triangles as usize * 3 * TRIANGLE_VERTEX_SIZE,
            usage: mev::BufferUsage::STORAGE | mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: mev::Memory::Device,
            name: "triangle-vertices",
        })?;

        Ok(TriangleProxyBuilder {
            config: *config,
            indirect_args,
            generate,
            args,
            vertices,
        })
    }

    pub fn config(&self) -> &TriangleConfig {
        &self.config
    }

    /// Dispatch arguments of the generation pass followed by the triangle count.
    pub fn args(&self) -> &mev::Buffer {
        &self.args
    }

    /// Three view-space vertices per triangle slot.
    pub fn vertices(&self) -> &mev::Buffer {
        &self.vertices
    }

    /// Records triangle generation for ids in `unique` and the structure update over them.
    ///
    /// `unique` holds a count at word 0 followed by ids, as produced by
    /// [`UniqueIdExtractor`](crate::UniqueIdExtractor).
    pub fn run(
        &mut self,
        graph: &mut impl FrameGraph,
        triangle_as: &mut TriangleAs,
        unique: &mev::Buffer,
        scene: &SceneGeometry,
        view: &na::Matrix4<f32>,
    ) -> Result<BuildMode, ProxyError> {
        let max_triangles = self.config.max_triangles;
        if !triangle_as.is_created() {
            return Err(ProxyError::NotCreated("triangles"));
        }
        if triangle_as.capacity() < max_triangles {
            return Err(ProxyError::CapacityExceeded {
                name: "triangle-blas".to_owned(),
                count: max_triangles,
                capacity: triangle_as.capacity(),
            });
        }

        let mut pass = {
            let tlas = triangle_as.tlas().ok_or(ProxyError::NotCreated("triangles"))?;
            graph.pass(
                "build_triangle_as",
                &[
                    (Resource::Buffer(unique), Usage::Read),
                    (Resource::Buffer(&scene.draws), Usage::Read),
                    (Resource::Buffer(&scene.primitives), Usage::Read),
                    (Resource::Buffer(&scene.transforms), Usage::Read),
                    (Resource::Buffer(&scene.indices), Usage::Read),
                    (Resource::Buffer(&scene.vertices), Usage::Read),
                    (Resource::Buffer(&self.args), Usage::ReadWrite),
                    (Resource::Buffer(&self.vertices), Usage::Write),
                    (Resource::Tlas(tlas), Usage::Build),
                ],
            )
        };

        // Arguments and vertices may still be read by the previous build.
        pass.barrier(PipelineStages::ALL_COMMANDS, PipelineStages::COMPUTE_SHADER);

        let mut compute = pass.compute();
        compute.with_pipeline(&self.indirect_args);
        compute.with_arguments(&[Argument::read(unique), Argument::write(&self.args)]);
        compute.with_constants(&ArgsConstants { max_triangles });
        compute.dispatch([1, 1, 1]);

        pass.barrier(
            PipelineStages::COMPUTE_SHADER,
            PipelineStages::DRAW_INDIRECT
                | PipelineStages::COMPUTE_SHADER
                | PipelineStages::ACCELERATION_STRUCTURE_BUILD,
        );

        let mut columns = [0.0; 16];
        columns.copy_from_slice(view.as_slice());

        let mut compute = pass.compute();
        compute.with_pipeline(&self.generate);
        compute.with_arguments(&[
            Argument::read(unique),
            Argument::read(&self.args),
            Argument::read(&scene.draws),
            Argument::read(&scene.primitives),
            Argument::read(&scene.transforms),
            Argument::read(&scene.indices),
            Argument::read(&scene.vertices),
            Argument::write(&self.vertices),
        ]);
        compute.with_constants(&GenerateConstants {
            view: columns,
            counts: scene.counts,
        });
        compute.dispatch_indirect(self.args.slice(..DispatchArgs::SIZE));

        pass.barrier(
            PipelineStages::COMPUTE_SHADER,
            PipelineStages::ACCELERATION_STRUCTURE_BUILD,
        );

        let count = match self.config.count_source {
            TriangleCountSource::Gpu => {
                PrimitiveCount::Indirect(self.args.slice(DispatchArgs::SIZE..ARGS_SIZE))
            }
            TriangleCountSource::FixedCap => PrimitiveCount::Direct(max_triangles),
        };
        triangle_as.update(&mut pass, count, self.vertices.slice(..))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::{
        graph::SequentialGraph,
        scene::{triangle_id, SceneBuilder},
        unique_ids::NO_ID,
    };

    use super::*;

    fn setup() -> (mev::Device, mev::Queue) {
        let (device, mut queues) = mev::Instance::new()
            .create(mev::DeviceDesc::default())
            .unwrap();
        (device, queues.remove(0))
    }

    /// Unit quads at `z` for every entry.
    fn quads(depths: &[f32]) -> SceneBuilder {
        let corner = |x, y| SceneVertex {
            position: [x, y, 0.0],
            normal: [0.0, 0.0, 1.0],
            uv: [0.0; 2],
        };
        let mut scene = SceneBuilder::new();
        let mesh = scene.add_mesh(
            &[corner(-1.0, -1.0), corner(1.0, -1.0), corner(1.0, 1.0), corner(-1.0, 1.0)],
            &[0, 1, 2, 0, 2, 3],
        );
        for &z in depths {
            let transform =
                scene.add_transform(&na::Matrix4::new_translation(&na::Vector3::new(0.0, 0.0, z)));
            scene.add_draw(mesh, transform).unwrap();
        }
        scene
    }

    /// Count word followed by ids.
    fn unique_buffer(device: &mev::Device, ids: &[u32]) -> mev::Buffer {
        let mut words = vec![ids.len() as u32];
        words.extend_from_slice(ids);
        device
            .new_buffer_init(mev::BufferInitDesc {
                data: bytemuck::cast_slice(&words),
                usage: mev::BufferUsage::STORAGE,
                memory: mev::Memory::Device,
                name: "unique",
            })
            .unwrap()
    }

    fn run(
        device: &mev::Device,
        queue: &mut mev::Queue,
        config: &TriangleConfig,
        scene: &SceneBuilder,
        ids: &[u32],
        view: &na::Matrix4<f32>,
    ) -> (TriangleProxyBuilder, TriangleAs, BuildMode) {
        let geometry = scene.upload(device).unwrap();
        let unique = unique_buffer(device, ids);

        let mut triangle_as = TriangleAs::new();
        triangle_as
            .create(device, queue, config.max_triangles)
            .unwrap();
        let mut builder = TriangleProxyBuilder::new(device, config).unwrap();

        let mut graph = SequentialGraph::begin(queue).unwrap();
        let mode = builder
            .run(&mut graph, &mut triangle_as, &unique, &geometry, view)
            .unwrap();
        graph.submit(queue).unwrap();
        queue.wait_idle().unwrap();

        assert!(queue.hazards().is_empty());
        assert!(queue.validation_errors().is_empty());
        (builder, triangle_as, mode)
    }

    #[test]
    fn visible_triangles_only() {
        let (device, mut queue) = setup();
        let scene = quads(&[-5.0, -10.0]);
        let ids = [
            triangle_id(0, 0),
            triangle_id(0, 1),
            triangle_id(1, 0),
            triangle_id(7, 0),
            triangle_id(1, 5),
            NO_ID,
        ];
        let config = TriangleConfig {
            max_triangles: 64,
            ..TriangleConfig::default()
        };
        let view = na::Matrix4::identity();

        let (builder, triangle_as, mode) = run(&device, &mut queue, &config, &scene, &ids, &view);
        assert_eq!(mode, BuildMode::Build);
        assert_eq!(triangle_as.blas().unwrap().blas().primitive_count(), Some(6));

        let args: Vec<u32> = builder.args().read_pod(0, 4);
        assert_eq!(args, [1, 1, 1, 6]);

        let triangles: Vec<[[f32; 3]; 3]> = builder.vertices().read_pod(0, 6);
        for (i, &id) in ids.iter().enumerate() {
            let expected = scene.triangle(id).unwrap_or(PARKED_TRIANGLE);
            assert_eq!(triangles[i], expected, "triangle {i}");
        }

        let hit = triangle_as
            .tlas()
            .unwrap()
            .intersect([0.25, 0.5, 0.0], [0.0, 0.0, -1.0], 0.0, f32::INFINITY)
            .unwrap();
        assert_relative_eq!(hit.t, 5.0, max_relative = 1e-5);
    }

    #[test]
    fn view_transform_is_applied() {
        let (device, mut queue) = setup();
        let scene = quads(&[0.0]);
        let config = TriangleConfig {
            max_triangles: 8,
            ..TriangleConfig::default()
        };
        let view = na::Matrix4::new_translation(&na::Vector3::new(0.0, 0.0, -3.0));

        let (_, triangle_as, _) = run(
            &device,
            &mut queue,
            &config,
            &scene,
            &[triangle_id(0, 0), triangle_id(0, 1)],
            &view,
        );
        let hit = triangle_as
            .tlas()
            .unwrap()
            .intersect([0.0; 3], [0.0, 0.0, -1.0], 0.0, f32::INFINITY)
            .unwrap();
        assert_relative_eq!(hit.t, 3.0, max_relative = 1e-5);
    }

    #[test]
    fn count_is_clamped() {
        let (device, mut queue) = setup();
        let scene = quads(&[-5.0]);
        let config = TriangleConfig {
            max_triangles: 4,
            ..TriangleConfig::default()
        };
        let ids = vec![triangle_id(0, 0); 9];

        let (builder, triangle_as, _) =
            run(&device, &mut queue, &config, &scene, &ids, &na::Matrix4::identity());
        assert_eq!(builder.args().read_pod::<u32>(12, 1), [4]);
        assert_eq!(triangle_as.blas().unwrap().blas().primitive_count(), Some(4));
    }

    #[test]
    fn slots_past_count_are_untouched() {
        const UNTOUCHED: u32 = 0xDEAD_BEEF;

        let (device, mut queue) = setup();
        let scene = quads(&[-5.0]);
        let geometry = scene.upload(&device).unwrap();
        let config = TriangleConfig {
            max_triangles: 256,
            ..TriangleConfig::default()
        };

        // Not a multiple of the work group size.
        let ids: Vec<u32> = (0..100).map(|i| triangle_id(0, i % 2)).collect();
        let unique = unique_buffer(&device, &ids);

        let mut triangle_as = TriangleAs::new();
        triangle_as
            .create(&device, &mut queue, config.max_triangles)
            .unwrap();
        let mut builder = TriangleProxyBuilder::new(&device, &config).unwrap();

        let mut encoder = queue.new_command_encoder().unwrap();
        encoder.copy().fill_buffer(builder.vertices(), UNTOUCHED);
        queue.submit([encoder.finish().unwrap()]).unwrap();

        let mut graph = SequentialGraph::begin(&mut queue).unwrap();
        builder
            .run(
                &mut graph,
                &mut triangle_as,
                &unique,
                &geometry,
                &na::Matrix4::identity(),
            )
            .unwrap();
        graph.submit(&mut queue).unwrap();
        queue.wait_idle().unwrap();
        assert!(queue.hazards().is_empty());

        let words_per_slot = 3 * TRIANGLE_VERTEX_SIZE / 4;
        let words: Vec<u32> = builder
            .vertices()
            .read_pod(0, config.max_triangles as usize * words_per_slot);
        let (written, rest) = words.split_at(ids.len() * words_per_slot);

        assert!(written.iter().all(|&w| w != UNTOUCHED));
        assert!(rest.iter().all(|&w| w == UNTOUCHED));
        assert_eq!(triangle_as.blas().unwrap().blas().primitive_count(), Some(100));
    }

    #[test]
    fn fixed_cap_refits_every_slot() {
        let (device, mut queue) = setup();
        let scene = quads(&[-5.0]);
        let config = TriangleConfig {
            max_triangles: 16,
            count_source: TriangleCountSource::FixedCap,
        };

        let (_, triangle_as, mode) = run(
            &device,
            &mut queue,
            &config,
            &scene,
            &[triangle_id(0, 1)],
            &na::Matrix4::identity(),
        );
        assert_eq!(mode, BuildMode::Update);
        assert_eq!(triangle_as.blas().unwrap().blas().primitive_count(), Some(16));
    }

    #[test]
    fn many_unique_triangles() {
        let (device, mut queue) = setup();

        // 200 x 200 quads facing the camera at z = -10.
        let side = 200u32;
        let mut vertices = Vec::new();
        for y in 0..=side {
            for x in 0..=side {
                vertices.push(SceneVertex {
                    position: [x as f32 / side as f32 - 0.5, y as f32 / side as f32 - 0.5, -10.0],
                    ..SceneVertex::default()
                });
            }
        }
        let mut indices = Vec::new();
        for y in 0..side {
            for x in 0..side {
                let i = y * (side + 1) + x;
                indices.extend_from_slice(&[i, i + 1, i + side + 2, i, i + side + 2, i + side + 1]);
            }
        }

        let mut scene = SceneBuilder::new();
        let mesh = scene.add_mesh(&vertices, &indices);
        let transform = scene.add_transform(&na::Matrix4::identity());
        let draw = scene.add_draw(mesh, transform).unwrap();
        assert_eq!(scene.triangle_count(draw), 80_000);

        let ids: Vec<u32> = (0..80_000).map(|t| triangle_id(draw, t)).collect();
        let (_, triangle_as, _) = run(
            &device,
            &mut queue,
            &TriangleConfig::default(),
            &scene,
            &ids,
            &na::Matrix4::identity(),
        );

        assert_eq!(triangle_as.blas().unwrap().blas().primitive_count(), Some(80_000));
        let hit = triangle_as
            .tlas()
            .unwrap()
            .intersect([0.1, 0.1, 0.0], [0.0, 0.0, -1.0], 0.0, f32::INFINITY)
            .unwrap();
        assert_relative_eq!(hit.t, 10.0, max_relative = 1e-5);
    }
}
