//! Synthetic world and its host-side rasterization.

use std::f32::consts::PI;

use depth_rt::{
    camera::Projection,
    scene::{triangle_id, SceneBuilder, SceneVertex},
    ProxyError, NO_ID,
};
use rand::Rng;

/// Ground quad of half-size 10 and a number of scattered cubes.
pub struct World {
    pub scene: SceneBuilder,

    /// World-space triangles with their ids.
    triangles: Vec<(u32, [[f32; 3]; 3])>,
}

/// One level of rasterized depth, normals and triangle ids.
pub struct Raster {
    pub extent: mev::Extent2,
    pub depth: Vec<f32>,
    pub normals: Vec<[f32; 4]>,
    pub ids: Vec<u32>,

    /// Distance along the view axis, infinite for background.
    pub distance: Vec<f32>,
}

fn vertex(position: [f32; 3], normal: [f32; 3]) -> SceneVertex {
    SceneVertex {
        position,
        normal,
        uv: [0.0; 2],
    }
}

fn ground() -> (Vec<SceneVertex>, Vec<u32>) {
    let up = [0.0, 1.0, 0.0];
    (
        vec![
            vertex([-1.0, 0.0, -1.0], up),
            vertex([-1.0, 0.0, 1.0], up),
            vertex([1.0, 0.0, 1.0], up),
            vertex([1.0, 0.0, -1.0], up),
        ],
        vec![0, 1, 2, 0, 2, 3],
    )
}

fn cube() -> (Vec<SceneVertex>, Vec<u32>) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();

    for axis in 0..3 {
        for sign in [-1.0f32, 1.0] {
            let mut normal = [0.0; 3];
            normal[axis] = sign;
            let (u, v) = ((axis + 1) % 3, (axis + 2) % 3);

            let base = vertices.len() as u32;
            for (a, b) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let mut p = [0.0; 3];
                p[axis] = sign * 0.5;
                p[u] = a * 0.5;
                p[v] = b * 0.5 * sign;
                vertices.push(vertex(p, normal));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
    }
    (vertices, indices)
}

impl World {
    pub fn generate(rng: &mut impl Rng, cubes: u32) -> Result<Self, ProxyError> {
        let mut scene = SceneBuilder::new();

        let (vertices, indices) = ground();
        let ground = scene.add_mesh(&vertices, &indices);
        let (vertices, indices) = cube();
        let cube = scene.add_mesh(&vertices, &indices);

        let floor = scene.add_transform(&na::Matrix4::new_nonuniform_scaling(&na::Vector3::new(
            10.0, 1.0, 10.0,
        )));
        let mut draws = vec![scene.add_draw(ground, floor)?];

        for _ in 0..cubes {
            let size = rng.gen_range(0.5..2.0);
            let position = na::Vector3::new(
                rng.gen_range(-7.0..7.0),
                size * 0.5,
                rng.gen_range(-7.0..7.0),
            );
            let transform = na::Matrix4::new_translation(&position)
                * na::Matrix4::from_axis_angle(&na::Vector3::y_axis(), rng.gen_range(0.0..PI))
                * na::Matrix4::new_scaling(size);
            let transform = scene.add_transform(&transform);
            draws.push(scene.add_draw(cube, transform)?);
        }

        let triangles = draws
            .iter()
            .flat_map(|&draw| (0..scene.triangle_count(draw)).map(move |t| triangle_id(draw, t)))
            .filter_map(|id| Some((id, scene.triangle(id)?)))
            .collect();

        Ok(World { scene, triangles })
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Casts one ray per texel of `extent` from a camera with `view` and `projection`.
    pub fn rasterize(
        &self,
        view: &na::Matrix4<f32>,
        projection: &Projection,
        extent: mev::Extent2,
    ) -> Raster {
        let triangles: Vec<(u32, [[f32; 3]; 3])> = self
            .triangles
            .iter()
            .map(|&(id, corners)| {
                let corners = corners.map(|p| {
                    let p = view.transform_point(&na::Point3::from(p));
                    [p.x, p.y, p.z]
                });
                (id, corners)
            })
            .collect();

        let background = if projection.reversed != 0 { 0.0 } else { 1.0 };
        let area = extent.area() as usize;
        let mut raster = Raster {
            extent,
            depth: Vec::with_capacity(area),
            normals: Vec::with_capacity(area),
            ids: Vec::with_capacity(area),
            distance: Vec::with_capacity(area),
        };

        for y in 0..extent.height() {
            for x in 0..extent.width() {
                let uv = [
                    (x as f32 + 0.5) / extent.width() as f32,
                    (y as f32 + 0.5) / extent.height() as f32,
                ];
                let dir = na::Vector3::from(projection.view_ray(uv));

                let closest = triangles
                    .iter()
                    .filter_map(|(id, corners)| Some((intersect(&dir, corners)?, id, corners)))
                    .filter(|(t, ..)| *t > projection.z_near && *t < projection.z_far)
                    .min_by(|a, b| a.0.total_cmp(&b.0));

                match closest {
                    Some((t, &id, corners)) => {
                        let [a, b, c] = corners.map(na::Vector3::from);
                        let mut n = (b - a).cross(&(c - a)).normalize();
                        if n.dot(&dir) > 0.0 {
                            n = -n;
                        }
                        raster.depth.push(projection.projective_depth(t));
                        raster.normals.push([n.x, n.y, n.z, 0.0]);
                        raster.ids.push(id);
                        raster.distance.push(t);
                    }
                    None => {
                        raster.depth.push(background);
                        raster.normals.push([0.0; 4]);
                        raster.ids.push(NO_ID);
                        raster.distance.push(f32::INFINITY);
                    }
                }
            }
        }
        raster
    }
}

/// Ray from the view origin along `dir`. Returns the ray parameter.
fn intersect(dir: &na::Vector3<f32>, corners: &[[f32; 3]; 3]) -> Option<f32> {
    let [a, b, c] = corners.map(na::Vector3::from);
    let e1 = b - a;
    let e2 = c - a;
    let p = dir.cross(&e2);
    let det = e1.dot(&p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv = 1.0 / det;
    let s = -a;
    let u = s.dot(&p) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(&e1);
    let v = dir.dot(&q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    Some(e2.dot(&q) * inv)
}
