use std::collections::BTreeSet;

use approx::assert_relative_eq;
use depth_rt::{
    accel::{BottomLevelDesc, BottomLevelIndex, DepthAs, GeometryKind, PrimitiveSource, TopLevelIndex, TriangleAs},
    camera::CameraParams,
    graph::SequentialGraph,
    readback::BufferReadback,
    scene::{triangle_id, SceneBuilder, SceneVertex},
    volume::{grid, BoundingVolume},
    DepthProxyBuilder, HierarchicalDepthCompressor, ProxyConfig,
    TriangleProxyBuilder, UniqueIdExtractor,
};
use mev::BuildMode;

const EXTENT: mev::Extent2 = mev::Extent2::new(64, 32);
const WALL_DISTANCE: f32 = 10.0;

/// Wall cells along X and Y. Cells are unit squares centered on the view axis.
const CELLS: [u32; 2] = [24, 12];

/// Host stand-in for the rasterizer: a tessellated wall facing the camera.
struct Frame {
    scene: SceneBuilder,
    depth: Vec<f32>,
    normals: Vec<[f32; 4]>,
    ids: Vec<u32>,
}

fn wall(camera: &CameraParams) -> Frame {
    let [cw, ch] = CELLS;
    let (x0, y0) = (-(cw as f32) / 2.0, -(ch as f32) / 2.0);

    let mut vertices = Vec::new();
    for j in 0..=ch {
        for i in 0..=cw {
            vertices.push(SceneVertex {
                position: [x0 + i as f32, y0 + j as f32, -WALL_DISTANCE],
                normal: [0.0, 0.0, 1.0],
                uv: [i as f32 / cw as f32, j as f32 / ch as f32],
            });
        }
    }
    let mut indices = Vec::new();
    for j in 0..ch {
        for i in 0..cw {
            let v = j * (cw + 1) + i;
            indices.extend_from_slice(&[v, v + 1, v + cw + 2, v, v + cw + 2, v + cw + 1]);
        }
    }

    let mut scene = SceneBuilder::new();
    let mesh = scene.add_mesh(&vertices, &indices);
    let transform = scene.add_transform(&na::Matrix4::identity());
    let draw = scene.add_draw(mesh, transform).unwrap();

    let projection = camera.projection();
    let d = projection.projective_depth(WALL_DISTANCE);

    let mut frame = Frame {
        scene,
        depth: Vec::new(),
        normals: Vec::new(),
        ids: Vec::new(),
    };

    for y in 0..EXTENT.height() {
        for x in 0..EXTENT.width() {
            let uv = [
                (x as f32 + 0.5) / EXTENT.width() as f32,
                (y as f32 + 0.5) / EXTENT.height() as f32,
            ];
            let p = projection.view_position(uv, WALL_DISTANCE);
            let (fx, fy) = (p[0] - x0, p[1] - y0);
            let (cx, cy) = (fx.floor() as u32, fy.floor() as u32);
            let upper = fy.fract() > fx.fract();
            let triangle = (cy * cw + cx) * 2 + upper as u32;

            frame.depth.push(d);
            frame.normals.push([0.0, 0.0, 1.0, 0.0]);
            frame.ids.push(triangle_id(draw, triangle));
        }
    }
    frame
}

fn image<T: bytemuck::Pod>(
    device: &mev::Device,
    format: mev::PixelFormat,
    texels: &[T],
    name: &str,
) -> mev::Image {
    let image = device
        .new_image(mev::ImageDesc::new_2d(
            EXTENT,
            format,
            mev::ImageUsage::SAMPLED,
            name,
        ))
        .unwrap();
    image.write_level(0, texels);
    image
}

#[test]
fn full_frame() {
    let (device, mut queues) = mev::Instance::new()
        .create(mev::DeviceDesc::default())
        .unwrap();
    let queue = &mut queues[0];

    let config = ProxyConfig::from_toml_str(
        r#"
        [depth]
        mip = 0

        [ids]
        readback_delay_frames = 1

        [triangles]
        max_triangles = 1024
        "#,
    )
    .unwrap();

    let camera = CameraParams::new(1.0, EXTENT, 0.1, 100.0);
    let frame = wall(&camera);
    let depth = image(&device, mev::PixelFormat::D32Float, &frame.depth, "depth");
    let normals = image(&device, mev::PixelFormat::Rgba32Float, &frame.normals, "normals");
    let ids = image(&device, mev::PixelFormat::R32Uint, &frame.ids, "ids");
    let geometry = frame.scene.upload(&device).unwrap();
    let visible: BTreeSet<u32> = frame.ids.iter().copied().collect();

    let mut depth_builder = DepthProxyBuilder::new(&device, EXTENT).unwrap();
    let mut tree = HierarchicalDepthCompressor::new(&device, EXTENT, &config.tree).unwrap();
    let mut extractor = UniqueIdExtractor::new(&device, &config.ids).unwrap();
    let mut triangles = TriangleProxyBuilder::new(&device, &config.triangles).unwrap();
    let mut readback = BufferReadback::new(&device);

    let mut depth_as = DepthAs::new();
    let mut tree_as = DepthAs::new();
    let mut triangle_as = TriangleAs::new();
    depth_as.ensure(&device, queue, EXTENT).unwrap();
    tree_as.ensure(&device, queue, tree.base_extent()).unwrap();
    triangle_as
        .create(&device, queue, config.triangles.max_triangles)
        .unwrap();

    for _ in 0..3 {
        let mut graph = SequentialGraph::begin(queue).unwrap();

        let count = depth_builder
            .run(&mut graph, &mut depth_as, &depth, config.depth.mip, &camera)
            .unwrap();
        assert_eq!(count, EXTENT.area());

        tree.run(&mut graph, &mut tree_as, &depth, &normals, &camera, &config.tree)
            .unwrap();

        extractor.run(&mut graph, &ids).unwrap();
        let mode = triangles
            .run(
                &mut graph,
                &mut triangle_as,
                extractor.result(),
                &geometry,
                &na::Matrix4::identity(),
            )
            .unwrap();
        assert_eq!(mode, BuildMode::Build);

        extractor.process_readback(&mut readback, graph.encoder());
        assert!(graph.barriers() > 0);
        graph.submit(queue).unwrap();
        queue.wait_idle().unwrap();
        readback.after_submit(queue);

        assert!(queue.hazards().is_empty(), "{:?}", queue.hazards());
        assert!(queue.validation_errors().is_empty());
    }

    assert_eq!(extractor.last_readback(), Some(visible.len() as u32));

    let boxes: Vec<BoundingVolume> = depth_builder.aabbs().read_pod(0, EXTENT.area() as usize);
    assert!(boxes.iter().all(|b| b.is_well_formed() && !b.is_parked()));

    let emitted = tree.counter().read_pod::<u32>(0, 1)[0];
    assert_eq!(emitted, 8);
    let tree_boxes: Vec<BoundingVolume> = tree.aabbs().read_pod(0, EXTENT.area() as usize);
    assert!(tree_boxes.iter().all(BoundingVolume::is_well_formed));
    assert_eq!(tree_boxes.iter().filter(|b| !b.is_parked()).count(), 8);

    let count = extractor.result().read_pod::<u32>(0, 1)[0];
    let extracted: BTreeSet<u32> = extractor
        .result()
        .read_pod::<u32>(4, count as usize)
        .into_iter()
        .collect();
    assert_eq!(extracted, visible);
    assert_eq!(
        triangle_as.blas().unwrap().blas().primitive_count(),
        Some(visible.len() as u32)
    );

    let projection = camera.projection();
    for uv in [[0.5, 0.5], [0.1, 0.2], [0.9, 0.8], [0.3, 0.7], [0.77, 0.13]] {
        let dir = projection.view_ray(uv);

        let hit = depth_as
            .tlas()
            .unwrap()
            .intersect([0.0; 3], dir, 0.0, f32::INFINITY)
            .unwrap();
        assert!(hit.t > 9.5 && hit.t < 10.1, "depth hit at {} for {uv:?}", hit.t);

        let hit = tree_as
            .tlas()
            .unwrap()
            .intersect([0.0; 3], dir, 0.0, f32::INFINITY)
            .unwrap();
        assert!(hit.t > 9.0 && hit.t <= 10.0, "tree hit at {} for {uv:?}", hit.t);

        let hit = triangle_as
            .tlas()
            .unwrap()
            .intersect([0.0; 3], dir, 0.0, f32::INFINITY)
            .unwrap();
        assert_relative_eq!(hit.t, WALL_DISTANCE, max_relative = 1e-4);
    }
}

#[test]
fn update_matches_build() {
    let (device, mut queues) = mev::Instance::new()
        .create(mev::DeviceDesc::default())
        .unwrap();
    let queue = &mut queues[0];
    let (w, h) = (8, 4);

    let mut updated = DepthAs::new();
    updated.create(&device, queue, mev::Extent2::new(w, h)).unwrap();
    assert_eq!(
        updated.debug_update(&device, queue, w, h).unwrap(),
        BuildMode::Update
    );

    let boxes = grid(w, h);
    let buffer = device
        .new_buffer_init(mev::BufferInitDesc {
            data: bytemuck::cast_slice(&boxes),
            usage: mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: mev::Memory::Device,
            name: "grid",
        })
        .unwrap();
    let built = BottomLevelIndex::create(
        &device,
        queue,
        BottomLevelDesc {
            name: "built",
            kind: GeometryKind::Aabbs,
            primitive_count: w * h,
            allow_update: false,
        },
        PrimitiveSource::Aabbs(buffer.slice(..)),
    )
    .unwrap();
    let built_top = TopLevelIndex::create(&device, queue, "built-top", &[&built]).unwrap();

    let updated = updated.tlas().unwrap();
    for i in 0..64 {
        let x = -1.1 + 2.2 * (i % 8) as f32 / 7.0;
        let y = -1.1 + 2.2 * (i / 8) as f32 / 7.0;
        let origin = [x, y, 5.0];
        let dir = [0.01 * (i % 3) as f32, -0.01 * (i % 5) as f32, -1.0];

        let a = updated.intersect(origin, dir, 0.0, f32::INFINITY);
        let b = built_top.tlas().intersect(origin, dir, 0.0, f32::INFINITY);
        match (a, b) {
            (None, None) => {}
            (Some(a), Some(b)) => {
                assert_relative_eq!(a.t, b.t, max_relative = 1e-6);
                assert_eq!(a.primitive, b.primitive, "ray {i}");
            }
            (a, b) => panic!("ray {i}: updated {a:?}, built {b:?}"),
        }
    }
}
