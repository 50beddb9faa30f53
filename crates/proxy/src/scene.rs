//! Scene geometry the triangle proxy resolves ids against.

use bytemuck::{Pod, Zeroable};

use crate::ProxyError;

/// Bits of a [`TriangleId`] holding the triangle index within its draw.
pub const TRIANGLE_BITS: u32 = 21;

/// Draw calls addressable by a [`TriangleId`].
pub const MAX_DRAWCALLS: u32 = 1 << (32 - TRIANGLE_BITS);

/// `(draw_index << 21) | triangle_index`, as rasterized into id images.
///
/// The all-ones id marks background.
pub type TriangleId = u32;

pub fn triangle_id(draw: u32, triangle: u32) -> TriangleId {
    debug_assert!(draw < MAX_DRAWCALLS);
    debug_assert!(triangle < 1 << TRIANGLE_BITS);
    (draw << TRIANGLE_BITS) | triangle
}

/// Splits an id into draw and triangle indices.
pub fn split_triangle_id(id: TriangleId) -> (u32, u32) {
    (id >> TRIANGLE_BITS, id & ((1 << TRIANGLE_BITS) - 1))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct SceneVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// Range of the index buffer forming one mesh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PrimitiveRecord {
    pub first_index: u32,
    pub index_count: u32,

    /// Added to every index of the mesh.
    pub vertex_offset: u32,
    pub _pad: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DrawCall {
    pub transform: u32,
    pub primitive: u32,
}

/// Column-major 4x4 matrix.
pub type Transform = [f32; 16];

/// Element counts of uploaded scene buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SceneCounts {
    pub draws: u32,
    pub primitives: u32,
    pub transforms: u32,
    pub vertices: u32,
    pub indices: u32,
    pub _pad: [u32; 3],
}

/// Random access to scene arrays, on the host or inside kernels.
pub(crate) trait SceneReader {
    fn counts(&self) -> SceneCounts;
    fn draw(&self, idx: u32) -> DrawCall;
    fn primitive(&self, idx: u32) -> PrimitiveRecord;
    fn transform(&self, idx: u32) -> Transform;
    fn index(&self, idx: u32) -> u32;
    fn vertex(&self, idx: u32) -> SceneVertex;
}

/// World-space corners of triangle `id`.
/// `None` if any index along the way is out of range.
pub(crate) fn world_triangle(scene: &impl SceneReader, id: TriangleId) -> Option<[[f32; 3]; 3]> {
    let counts = scene.counts();
    let (draw, triangle) = split_triangle_id(id);
    if draw >= counts.draws {
        return None;
    }

    let draw = scene.draw(draw);
    if draw.primitive >= counts.primitives || draw.transform >= counts.transforms {
        return None;
    }

    let primitive = scene.primitive(draw.primitive);
    if (triangle + 1) * 3 > primitive.index_count {
        return None;
    }

    let transform = na::Matrix4::from_column_slice(&scene.transform(draw.transform));
    let mut corners = [[0.0; 3]; 3];
    for (k, corner) in corners.iter_mut().enumerate() {
        let idx = primitive.first_index.checked_add(triangle * 3 + k as u32)?;
        if idx >= counts.indices {
            return None;
        }
        let vertex = primitive.vertex_offset.checked_add(scene.index(idx))?;
        if vertex >= counts.vertices {
            return None;
        }
        let p = transform.transform_point(&na::Point3::from(scene.vertex(vertex).position));
        *corner = [p.x, p.y, p.z];
    }
    Some(corners)
}

/// Collects meshes, transforms and draw calls on the host.
#[derive(Clone, Debug, Default)]
pub struct SceneBuilder {
    vertices: Vec<SceneVertex>,
    indices: Vec<u32>,
    primitives: Vec<PrimitiveRecord>,
    transforms: Vec<Transform>,
    draws: Vec<DrawCall>,
}

impl SceneBuilder {
    pub fn new() -> Self {
        SceneBuilder::default()
    }

    /// Adds a triangle list and returns its primitive index.
    pub fn add_mesh(&mut self, vertices: &[SceneVertex], indices: &[u32]) -> u32 {
        debug_assert_eq!(indices.len() % 3, 0);

        let record = PrimitiveRecord {
            first_index: self.indices.len() as u32,
            index_count: indices.len() as u32,
            vertex_offset: self.vertices.len() as u32,
            _pad: 0,
        };
        self.vertices.extend_from_slice(vertices);
        self.indices.extend_from_slice(indices);
        self.primitives.push(record);
        self.primitives.len() as u32 - 1
    }

    pub fn add_transform(&mut self, transform: &na::Matrix4<f32>) -> u32 {
        let mut columns = [0.0; 16];
        columns.copy_from_slice(transform.as_slice());
        self.transforms.push(columns);
        self.transforms.len() as u32 - 1
    }

    /// Adds a draw call and returns its index, the draw part of its triangle ids.
    ///
    /// Every triangle of the draw must get an id distinct from other draws and from [`NO_ID`].
    ///
    /// [`NO_ID`]: crate::NO_ID
    pub fn add_draw(&mut self, primitive: u32, transform: u32) -> Result<u32, ProxyError> {
        let count = self.draws.len() as u32;
        if count >= MAX_DRAWCALLS {
            return Err(ProxyError::CapacityExceeded {
                name: "draw-calls".to_owned(),
                count: count + 1,
                capacity: MAX_DRAWCALLS,
            });
        }

        let triangles = self
            .primitives
            .get(primitive as usize)
            .map_or(0, |p| p.index_count / 3);

        // The last id of the last draw is all ones.
        let capacity = if count == MAX_DRAWCALLS - 1 {
            (1 << TRIANGLE_BITS) - 1
        } else {
            1 << TRIANGLE_BITS
        };
        if triangles > capacity {
            return Err(ProxyError::CapacityExceeded {
                name: "draw-triangles".to_owned(),
                count: triangles,
                capacity,
            });
        }

        self.draws.push(DrawCall {
            transform,
            primitive,
        });
        Ok(count)
    }

    /// Number of triangles drawn by `draw`.
    pub fn triangle_count(&self, draw: u32) -> u32 {
        self.draws
            .get(draw as usize)
            .and_then(|d| self.primitives.get(d.primitive as usize))
            .map_or(0, |p| p.index_count / 3)
    }

    /// World-space corners of triangle `id`, computed on the host.
    pub fn triangle(&self, id: TriangleId) -> Option<[[f32; 3]; 3]> {
        world_triangle(self, id)
    }

    pub fn upload(&self, device: &mev::Device) -> Result<SceneGeometry, ProxyError> {
        Ok(SceneGeometry {
            vertices: upload(device, &self.vertices, "scene-vertices")?,
            indices: upload(device, &self.indices, "scene-indices")?,
            primitives: upload(device, &self.primitives, "scene-primitives")?,
            transforms: upload(device, &self.transforms, "scene-transforms")?,
            draws: upload(device, &self.draws, "scene-draws")?,
            counts: self.counts(),
        })
    }
}

impl SceneReader for SceneBuilder {
    fn counts(&self) -> SceneCounts {
        SceneCounts {
            draws: self.draws.len() as u32,
            primitives: self.primitives.len() as u32,
            transforms: self.transforms.len() as u32,
            vertices: self.vertices.len() as u32,
            indices: self.indices.len() as u32,
            _pad: [0; 3],
        }
    }

    fn draw(&self, idx: u32) -> DrawCall {
        self.draws[idx as usize]
    }

    fn primitive(&self, idx: u32) -> PrimitiveRecord {
        self.primitives[idx as usize]
    }

    fn transform(&self, idx: u32) -> Transform {
        self.transforms[idx as usize]
    }

    fn index(&self, idx: u32) -> u32 {
        self.indices[idx as usize]
    }

    fn vertex(&self, idx: u32) -> SceneVertex {
        self.vertices[idx as usize]
    }
}

fn upload<T: Pod>(device: &mev::Device, data: &[T], name: &str) -> Result<mev::Buffer, ProxyError> {
    // Empty arrays still get a binding.
    let bytes: &[u8] = if data.is_empty() {
        &[0; 16]
    } else {
        bytemuck::cast_slice(data)
    };
    let buffer = device.new_buffer_init(mev::BufferInitDesc {
        data: bytes,
        usage: mev::BufferUsage::STORAGE,
        memory: mev::Memory::Device,
        name,
    })?;
    Ok(buffer)
}

/// Device copy of a [`SceneBuilder`].
pub struct SceneGeometry {
    pub vertices: mev::Buffer,
    pub indices: mev::Buffer,
    pub primitives: mev::Buffer,
    pub transforms: mev::Buffer,
    pub draws: mev::Buffer,
    pub counts: SceneCounts,
}

impl SceneGeometry {
    pub fn draw_count(&self) -> u32 {
        self.counts.draws
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> (Vec<SceneVertex>, Vec<u32>) {
        let corner = |x, y| SceneVertex {
            position: [x, y, 0.0],
            normal: [0.0, 0.0, 1.0],
            uv: [x, y],
        };
        (
            vec![corner(-1.0, -1.0), corner(1.0, -1.0), corner(1.0, 1.0), corner(-1.0, 1.0)],
            vec![0, 1, 2, 0, 2, 3],
        )
    }

    #[test]
    fn ids_split_back() {
        let id = triangle_id(2047, (1 << 21) - 2);
        assert_eq!(split_triangle_id(id), (2047, (1 << 21) - 2));
        assert_eq!(split_triangle_id(triangle_id(3, 17)), (3, 17));
        assert_eq!(MAX_DRAWCALLS, 2048);
    }

    #[test]
    fn host_triangles_are_transformed() {
        let (vertices, indices) = quad();
        let mut scene = SceneBuilder::new();
        let mesh = scene.add_mesh(&vertices, &indices);
        let moved = scene.add_transform(&na::Matrix4::new_translation(&na::Vector3::new(0.0, 0.0, -5.0)));
        let draw = scene.add_draw(mesh, moved).unwrap();

        assert_eq!(scene.triangle_count(draw), 2);
        assert_eq!(
            scene.triangle(triangle_id(draw, 1)),
            Some([[-1.0, -1.0, -5.0], [1.0, 1.0, -5.0], [-1.0, 1.0, -5.0]])
        );
        assert_eq!(scene.triangle(triangle_id(draw, 2)), None);
        assert_eq!(scene.triangle(triangle_id(draw + 1, 0)), None);
    }

    #[test]
    fn draw_calls_are_bounded() {
        let (vertices, indices) = quad();
        let mut scene = SceneBuilder::new();
        let mesh = scene.add_mesh(&vertices, &indices);
        let transform = scene.add_transform(&na::Matrix4::identity());
        for _ in 0..MAX_DRAWCALLS {
            scene.add_draw(mesh, transform).unwrap();
        }
        assert!(matches!(
            scene.add_draw(mesh, transform),
            Err(ProxyError::CapacityExceeded { .. })
        ));
    }

    /// Degenerate mesh of `triangles` triangles over a single vertex.
    fn strip(scene: &mut SceneBuilder, triangles: u32) -> u32 {
        let indices = vec![0; triangles as usize * 3];
        scene.add_mesh(&[SceneVertex::default()], &indices)
    }

    #[test]
    fn triangle_ids_stay_unique() {
        let mut scene = SceneBuilder::new();
        let transform = scene.add_transform(&na::Matrix4::identity());
        let full = strip(&mut scene, 1 << TRIANGLE_BITS);
        let oversized = strip(&mut scene, (1 << TRIANGLE_BITS) + 1);

        assert!(matches!(
            scene.add_draw(oversized, transform),
            Err(ProxyError::CapacityExceeded {
                count: 2_097_153,
                capacity: 2_097_152,
                ..
            })
        ));

        for draw in 0..MAX_DRAWCALLS - 1 {
            assert_eq!(scene.add_draw(full, transform).unwrap(), draw);
        }

        // Triangle 2^21 - 1 of the last draw would be the background id.
        assert_eq!(triangle_id(MAX_DRAWCALLS - 1, (1 << TRIANGLE_BITS) - 1), crate::NO_ID);
        assert!(matches!(
            scene.add_draw(full, transform),
            Err(ProxyError::CapacityExceeded {
                capacity: 2_097_151,
                ..
            })
        ));

        let (vertices, indices) = quad();
        let small = scene.add_mesh(&vertices, &indices);
        assert_eq!(scene.add_draw(small, transform).unwrap(), MAX_DRAWCALLS - 1);
    }
}
