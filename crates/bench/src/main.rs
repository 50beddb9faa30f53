//! Renders a synthetic scene on the host, feeds the result through every proxy
//! and checks how closely ray queries against the proxies match the raster.

mod error;
mod scene;

use std::{collections::BTreeSet, path::PathBuf};

use clap::Parser;
use depth_rt::{
    accel::{DepthAs, TriangleAs},
    camera::{mip_extent, CameraParams},
    graph::SequentialGraph,
    readback::BufferReadback,
    DepthProxyBuilder, HierarchicalDepthCompressor, ProxyConfig, ProxyError, TriangleProxyBuilder,
    UniqueIdExtractor, NO_ID,
};
use rand::SeedableRng;

use crate::{
    error::{ConfigError, DeviceError, FrameError, SetupError},
    scene::{Raster, World},
};

/// Probe rays per axis.
const PROBES: u32 = 8;

#[derive(Debug, Parser)]
#[command(name = "depth-rt-bench")]
#[command(about = "Ray-tracing proxy bench over a synthetic scene")]
#[command(rename_all = "kebab-case")]
struct Cli {
    /// Path to a TOML configuration file.
    /// Defaults are used when omitted.
    #[arg(long = "config", value_name = "path")]
    config: Option<PathBuf>,

    /// Number of frames to run.
    #[arg(long = "frames", default_value_t = 30)]
    frames: u32,

    #[arg(long = "width", default_value_t = 320)]
    width: u32,

    #[arg(long = "height", default_value_t = 180)]
    height: u32,

    /// Seed of the scene generator.
    #[arg(long = "seed", default_value_t = 1)]
    seed: u64,

    #[arg(long = "cubes", default_value_t = 12)]
    cubes: u32,
}

/// Hits within this relative distance of the raster count as agreeing.
const AGREEMENT: f32 = 0.05;

#[derive(Default)]
struct Agreement {
    depth: u32,
    tree: u32,
    triangles: u32,
    probes: u32,
}

impl Agreement {
    fn report(&self, frames: u32) {
        let rate = |n: u32| 100.0 * n as f64 / self.probes.max(1) as f64;
        println!("frames:    {frames}");
        println!("probes:    {}", self.probes);
        println!("depth:     {:.1}%", rate(self.depth));
        println!("tree:      {:.1}%", rate(self.tree));
        println!("triangles: {:.1}%", rate(self.triangles));
    }
}

fn main() -> miette::Result<()> {
    install_tracing_subscriber();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ProxyConfig::load(path).map_err(|source| ConfigError {
            path: path.clone(),
            source,
        })?,
        None => ProxyConfig::default(),
    };

    let (device, mut queues) = mev::Instance::new()
        .create(mev::DeviceDesc::default())
        .map_err(|source| DeviceError { source })?;
    let queue = &mut queues[0];

    let mut rng = rand::rngs::StdRng::seed_from_u64(cli.seed);
    let world = World::generate(&mut rng, cli.cubes).map_err(|source| SetupError {
        what: "scene",
        source,
    })?;
    tracing::info!("Scene with {} triangles", world.triangle_count());

    let extent = mev::Extent2::new(cli.width, cli.height);
    let camera = CameraParams::new(1.0, extent, 0.1, 100.0);
    let projection = camera.projection();

    let geometry = world.scene.upload(&device).map_err(|source| SetupError {
        what: "scene geometry",
        source,
    })?;

    let setup = |what: &'static str| move |source: ProxyError| SetupError { what, source };

    let mut depth_builder = DepthProxyBuilder::new(&device, extent).map_err(setup("depth proxy"))?;
    let mut tree = HierarchicalDepthCompressor::new(&device, extent, &config.tree)
        .map_err(setup("depth tree"))?;
    let mut extractor =
        UniqueIdExtractor::new(&device, &config.ids).map_err(setup("id extractor"))?;
    let mut triangles = TriangleProxyBuilder::new(&device, &config.triangles)
        .map_err(setup("triangle proxy"))?;
    let mut readback = BufferReadback::new(&device);

    let depth_extent = mip_extent(extent, config.depth.mip);
    let mut depth_as = DepthAs::new();
    let mut tree_as = DepthAs::new();
    let mut triangle_as = TriangleAs::new();
    depth_as
        .ensure(&device, queue, depth_extent)
        .map_err(setup("depth structures"))?;
    tree_as
        .ensure(&device, queue, tree.base_extent())
        .map_err(setup("tree structures"))?;
    triangle_as
        .create(&device, queue, config.triangles.max_triangles)
        .map_err(setup("triangle structures"))?;

    let levels = config.depth.mip.max(config.tree.base_mip) + 1;
    let new_image = |format: mev::PixelFormat, name: &str| {
        let desc = mev::ImageDesc::new_2d(extent, format, mev::ImageUsage::SAMPLED, name)
            .with_levels(levels);
        device.new_image(desc).map_err(ProxyError::from)
    };
    let depth = new_image(mev::PixelFormat::D32Float, "depth").map_err(setup("depth image"))?;
    let normals =
        new_image(mev::PixelFormat::Rgba32Float, "normals").map_err(setup("normals image"))?;
    let ids = new_image(mev::PixelFormat::R32Uint, "ids").map_err(setup("ids image"))?;

    let mut agreement = Agreement::default();

    for frame in 0..cli.frames {
        let angle = frame as f32 * std::f32::consts::TAU / cli.frames.max(1) as f32;
        let eye = na::Point3::new(14.0 * angle.cos(), 6.0, 14.0 * angle.sin());
        let view = na::Matrix4::look_at_rh(&eye, &na::Point3::origin(), &na::Vector3::y());

        let mips: BTreeSet<u32> = [0, config.depth.mip, config.tree.base_mip].into();
        let mut base = None;
        for mip in mips {
            let raster = world.rasterize(&view, &projection, mip_extent(extent, mip));
            depth.write_level(mip, &raster.depth);
            normals.write_level(mip, &raster.normals);
            ids.write_level(mip, &raster.ids);
            if mip == 0 {
                base = Some(raster);
            }
        }
        let Some(raster) = base else {
            continue;
        };

        let frame_error = |source| FrameError { frame, source };

        let mut graph = SequentialGraph::begin(queue).map_err(frame_error)?;
        let boxes = depth_builder
            .run(&mut graph, &mut depth_as, &depth, config.depth.mip, &camera)
            .map_err(frame_error)?;
        tree.run(&mut graph, &mut tree_as, &depth, &normals, &camera, &config.tree)
            .map_err(frame_error)?;
        extractor.run(&mut graph, &ids).map_err(frame_error)?;
        let mode = triangles
            .run(
                &mut graph,
                &mut triangle_as,
                extractor.result(),
                &geometry,
                &view,
            )
            .map_err(frame_error)?;
        extractor.process_readback(&mut readback, graph.encoder());
        graph.submit(queue).map_err(frame_error)?;
        queue
            .wait_idle()
            .map_err(|err| frame_error(ProxyError::from(err)))?;
        readback.after_submit(queue);

        if !queue.hazards().is_empty() {
            tracing::warn!("Frame {frame}: {} hazards", queue.hazards().len());
            for hazard in queue.hazards() {
                tracing::debug!("{hazard:?}");
            }
        }
        queue.clear_diagnostics();

        let visible = raster
            .ids
            .iter()
            .filter(|&&id| id != NO_ID)
            .collect::<BTreeSet<_>>()
            .len();
        probe(
            &raster,
            &projection,
            [&depth_as, &tree_as],
            &triangle_as,
            &mut agreement,
        );

        tracing::info!(
            frame,
            boxes,
            tree_boxes = tree.counter().read_pod::<u32>(0, 1).first().copied().unwrap_or(0),
            visible,
            extracted = ?extractor.last_readback(),
            ?mode,
            "Frame done"
        );
    }

    agreement.report(cli.frames);
    Ok(())
}

/// Casts a grid of view rays and counts proxies whose first hit agrees with the raster.
fn probe(
    raster: &Raster,
    projection: &depth_rt::camera::Projection,
    [depth_as, tree_as]: [&DepthAs; 2],
    triangle_as: &TriangleAs,
    agreement: &mut Agreement,
) {
    let extent = raster.extent;
    for j in 0..PROBES {
        for i in 0..PROBES {
            let uv = [
                (i as f32 + 0.5) / PROBES as f32,
                (j as f32 + 0.5) / PROBES as f32,
            ];
            let x = ((uv[0] * extent.width() as f32) as u32).min(extent.width() - 1);
            let y = ((uv[1] * extent.height() as f32) as u32).min(extent.height() - 1);
            let expected = raster.distance[(y * extent.width() + x) as usize];

            let dir = projection.view_ray(uv);
            let agrees = |tlas: Option<&mev::Tlas>| {
                let hit = tlas.and_then(|tlas| tlas.intersect([0.0; 3], dir, 0.0, f32::INFINITY));
                match hit {
                    None => expected.is_infinite(),
                    Some(hit) => (hit.t - expected).abs() <= AGREEMENT * expected,
                }
            };

            agreement.probes += 1;
            agreement.depth += agrees(depth_as.tlas()) as u32;
            agreement.tree += agrees(tree_as.tlas()) as u32;
            agreement.triangles += agrees(triangle_as.tlas()) as u32;
        }
    }
}

fn install_tracing_subscriber() {
    use tracing_subscriber::layer::SubscriberExt as _;
    if let Err(err) = tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish()
            .with(tracing_error::ErrorLayer::default()),
    ) {
        panic!("Failed to install tracing subscriber: {}", err);
    }
}
