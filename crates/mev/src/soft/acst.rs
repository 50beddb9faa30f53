use std::{
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::generic::{
    AccelerationStructureBuildFlags, AccelerationStructureSizes, BlasDesc, BlasGeometryDesc,
    BuildMode, BuildSizesError, Limits, TlasDesc, TlasInstance, VertexFormat,
};

use super::{
    bvh::{intersect_triangle, triangle_bounds, Aabb, Bvh, Ray},
    command::{BlasBuild, Count, Geometry, SliceRef, TlasBuild},
    device::{next_id, DeviceInner, WeakDevice},
    Device,
};

const HEADER_SIZE: usize = 256;
const NODE_SIZE: usize = 32;
const AABB_SIZE: usize = 24;
const TRIANGLE_SIZE: usize = 36;
const INSTANCE_SIZE: usize = 64;
const SIZE_ALIGNMENT: usize = 256;

fn align(size: usize) -> usize {
    size.div_ceil(SIZE_ALIGNMENT) * SIZE_ALIGNMENT
}

fn sizes(
    flags: AccelerationStructureBuildFlags,
    count: u32,
    primitive_size: usize,
) -> AccelerationStructureSizes {
    let count = count as usize;
    let nodes = 2 * count - 1;

    AccelerationStructureSizes {
        size: align(HEADER_SIZE + nodes * NODE_SIZE + count * primitive_size),
        scratch_size: align(count * 16 + nodes * 8),
        update_scratch_size: if flags.contains(AccelerationStructureBuildFlags::ALLOW_UPDATE) {
            align(nodes * 8)
        } else {
            0
        },
    }
}

fn primitive_size(geometry: &BlasGeometryDesc) -> Result<usize, BuildSizesError> {
    match geometry {
        BlasGeometryDesc::Triangles(triangles) => {
            if triangles.vertex_format == VertexFormat::Float32x2 {
                return Err(BuildSizesError::UnsupportedVertexFormat(
                    triangles.vertex_format,
                ));
            }
            let min = triangles.vertex_format.size();
            if triangles.vertex_stride < min {
                return Err(BuildSizesError::InvalidStride {
                    stride: triangles.vertex_stride,
                    min,
                });
            }
            Ok(TRIANGLE_SIZE)
        }
        BlasGeometryDesc::AABBs(aabbs) => {
            if aabbs.box_stride < AABB_SIZE {
                return Err(BuildSizesError::InvalidStride {
                    stride: aabbs.box_stride,
                    min: AABB_SIZE,
                });
            }
            Ok(AABB_SIZE)
        }
    }
}

pub(super) fn blas_sizes(
    limits: &Limits,
    geometry: &BlasGeometryDesc,
    flags: AccelerationStructureBuildFlags,
    count: u32,
) -> Result<AccelerationStructureSizes, BuildSizesError> {
    if count == 0 {
        return Err(BuildSizesError::ZeroPrimitives);
    }
    if count > limits.max_primitive_count {
        return Err(BuildSizesError::TooManyPrimitives {
            count,
            limit: limits.max_primitive_count,
        });
    }
    Ok(sizes(flags, count, primitive_size(geometry)?))
}

pub(super) fn tlas_sizes(
    limits: &Limits,
    flags: AccelerationStructureBuildFlags,
    count: u32,
) -> Result<AccelerationStructureSizes, BuildSizesError> {
    if count == 0 {
        return Err(BuildSizesError::ZeroPrimitives);
    }
    if count > limits.max_instance_count {
        return Err(BuildSizesError::TooManyPrimitives {
            count,
            limit: limits.max_instance_count,
        });
    }
    Ok(sizes(flags, count, INSTANCE_SIZE))
}

/// Result of a ray query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    /// Distance along the ray in units of ray direction.
    pub t: f32,

    /// Index of the instance in the top-level structure.
    pub instance: u32,

    /// Custom index of the instance.
    pub custom_index: u32,

    /// Index of the primitive in the bottom-level structure.
    pub primitive: u32,

    pub kind: HitKind,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HitKind {
    Triangle { barycentrics: [f32; 2] },
    Aabb,
}

enum Primitives {
    Aabbs(Vec<Aabb>),
    Triangles(Vec<[[f32; 3]; 3]>),
}

impl Primitives {
    fn is_triangles(&self) -> bool {
        matches!(self, Primitives::Triangles(_))
    }

    fn len(&self) -> usize {
        match self {
            Primitives::Aabbs(boxes) => boxes.len(),
            Primitives::Triangles(triangles) => triangles.len(),
        }
    }

    fn bounds(&self) -> Vec<Aabb> {
        match self {
            Primitives::Aabbs(boxes) => boxes.clone(),
            Primitives::Triangles(triangles) => triangles.iter().map(triangle_bounds).collect(),
        }
    }
}

struct BlasState {
    flags: AccelerationStructureBuildFlags,
    primitives: Primitives,
    bvh: Bvh,
}

pub(super) struct BlasInner {
    id: u64,
    name: String,
    device: WeakDevice,
    address: u64,
    storage: SliceRef,
    state: Mutex<Option<BlasState>>,
}

impl Drop for BlasInner {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            device.forget_blas(self.address);
        }
    }
}

/// Bottom-level acceleration structure.
/// Contains ray-tracing acceleration structure for geometry.
/// Created for triangle-meshes or procedural geometry.
#[derive(Clone)]
pub struct Blas {
    inner: Arc<BlasInner>,
}

impl fmt::Debug for Blas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blas")
            .field("name", &self.inner.name)
            .field("address", &format_args!("{:#x}", self.inner.address))
            .finish()
    }
}

impl PartialEq for Blas {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Blas {}

impl Blas {
    pub(super) fn new(device: &Device, desc: BlasDesc) -> Self {
        let address = desc.storage.device_address();
        debug_assert_ne!(address, 0, "BLAS storage requires DEVICE_ADDRESS usage");

        let inner = Arc::new(BlasInner {
            id: next_id(),
            name: desc.name.to_owned(),
            device: device.weak(),
            address,
            storage: SliceRef::new(desc.storage),
            state: Mutex::new(None),
        });

        device.inner().register_blas(address, Arc::downgrade(&inner));
        Blas { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Device address referenced by top-level instances.
    pub fn device_address(&self) -> u64 {
        self.inner.address
    }

    pub(super) fn storage(&self) -> &SliceRef {
        &self.inner.storage
    }

    /// Number of primitives in the last successful build. `None` if never built.
    pub fn primitive_count(&self) -> Option<u32> {
        self.inner
            .state
            .lock()
            .as_ref()
            .map(|s| s.primitives.len() as u32)
    }

    /// Bounds of all active primitives. `None` if never built or empty.
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let state = self.inner.state.lock();
        let bounds = state.as_ref()?.bvh.bounds();
        if bounds.is_empty() {
            None
        } else {
            Some((bounds.min, bounds.max))
        }
    }

    /// Casts a ray against this structure alone, in its object space.
    pub fn intersect(
        &self,
        origin: [f32; 3],
        direction: [f32; 3],
        t_min: f32,
        t_max: f32,
    ) -> Option<RayHit> {
        let ray = Ray::new(origin, direction);
        let (t, (primitive, kind)) = intersect_blas(&self.inner, &ray, t_min, t_max)?;
        Some(RayHit {
            t,
            instance: 0,
            custom_index: 0,
            primitive,
            kind,
        })
    }
}

pub(super) fn blas_id(blas: &BlasInner) -> u64 {
    blas.id
}

pub(super) fn blas_name(blas: &BlasInner) -> &str {
    &blas.name
}

fn intersect_blas(
    blas: &BlasInner,
    ray: &Ray,
    t_min: f32,
    t_max: f32,
) -> Option<(f32, (u32, HitKind))> {
    let state = blas.state.lock();
    let state = state.as_ref()?;

    match &state.primitives {
        Primitives::Aabbs(boxes) => state.bvh.closest(ray, t_min, t_max, |prim, t_max| {
            boxes[prim as usize]
                .intersect(ray, t_min, t_max)
                .map(|t| (t, (prim, HitKind::Aabb)))
        }),
        Primitives::Triangles(triangles) => state.bvh.closest(ray, t_min, t_max, |prim, _| {
            intersect_triangle(ray, &triangles[prim as usize])
                .map(|(t, barycentrics)| (t, (prim, HitKind::Triangle { barycentrics })))
        }),
    }
}

fn resolve_count(count: &Count) -> Result<u32, String> {
    match count {
        Count::Direct(count) => Ok(*count),
        Count::Indirect(slice) => slice
            .read_u32(0)
            .ok_or_else(|| "indirect primitive count is out of bounds".to_owned()),
    }
}

fn read_primitives(geometry: &Geometry, count: u32) -> Result<Primitives, String> {
    match geometry {
        Geometry::Aabbs { boxes, box_stride } => {
            let mut out = Vec::with_capacity(count as usize);
            for i in 0..count as usize {
                let [x0, y0, z0, x1, y1, z1] = boxes
                    .read_f32s::<6>(i * box_stride)
                    .ok_or_else(|| format!("AABB {i} is out of bounds of '{}'", boxes.buffer.name()))?;
                out.push(Aabb {
                    min: [x0, y0, z0],
                    max: [x1, y1, z1],
                });
            }
            Ok(Primitives::Aabbs(out))
        }
        Geometry::Triangles {
            indices,
            vertices,
            vertex_stride,
            vertex_format: _,
            transform,
        } => {
            let transform = match transform {
                None => None,
                Some(slice) => Some(
                    slice
                        .read_f32s::<12>(0)
                        .ok_or_else(|| "transform is out of bounds".to_owned())?,
                ),
            };

            let vertex = |index: u32| -> Result<[f32; 3], String> {
                let p = vertices
                    .read_f32s::<3>(index as usize * vertex_stride)
                    .ok_or_else(|| format!("vertex {index} is out of bounds"))?;
                Ok(match transform {
                    None => p,
                    Some(m) => std::array::from_fn(|r| {
                        m[r * 4] * p[0] + m[r * 4 + 1] * p[1] + m[r * 4 + 2] * p[2] + m[r * 4 + 3]
                    }),
                })
            };

            let mut out = Vec::with_capacity(count as usize);
            for i in 0..count {
                let corner = |c: u32| -> Result<u32, String> {
                    match indices {
                        None => Ok(i * 3 + c),
                        Some(indices) => indices
                            .read_u32((i * 3 + c) as usize * 4)
                            .ok_or_else(|| format!("index {} is out of bounds", i * 3 + c)),
                    }
                };
                out.push([vertex(corner(0)?)?, vertex(corner(1)?)?, vertex(corner(2)?)?]);
            }
            Ok(Primitives::Triangles(out))
        }
    }
}

/// Executes a recorded bottom-level build.
pub(super) fn build_blas(
    limits: &Limits,
    blas: &Blas,
    build: &BlasBuild,
    scratch: &SliceRef,
) -> Result<(), String> {
    let count = resolve_count(&build.count)?;

    if count > 0 {
        let primitive_size = match build.geometry {
            Geometry::Triangles { .. } => TRIANGLE_SIZE,
            Geometry::Aabbs { .. } => AABB_SIZE,
        };
        if count > limits.max_primitive_count {
            return Err(format!(
                "{count} primitives exceed the limit of {}",
                limits.max_primitive_count
            ));
        }
        let required = sizes(build.flags, count, primitive_size);
        if blas.storage().size < required.size {
            return Err(format!(
                "storage of {} bytes is too small for {count} primitives, {} required",
                blas.storage().size,
                required.size
            ));
        }
        let scratch_required = match build.mode {
            BuildMode::Build => required.scratch_size,
            BuildMode::Update => required.update_scratch_size,
        };
        if scratch.size < scratch_required {
            return Err(format!(
                "scratch of {} bytes is too small, {scratch_required} required",
                scratch.size
            ));
        }
    }

    let primitives = read_primitives(&build.geometry, count)?;
    let bounds = primitives.bounds();

    let mut state = blas.inner.state.lock();
    match build.mode {
        BuildMode::Build => {
            *state = Some(BlasState {
                flags: build.flags,
                bvh: Bvh::build(&bounds),
                primitives,
            });
        }
        BuildMode::Update => {
            let Some(state) = state.as_mut() else {
                return Err("update of a structure that was never built".to_owned());
            };
            if !state
                .flags
                .contains(AccelerationStructureBuildFlags::ALLOW_UPDATE)
            {
                return Err("update of a structure built without ALLOW_UPDATE".to_owned());
            }
            if state.flags != build.flags {
                return Err("update flags differ from build flags".to_owned());
            }
            if state.primitives.is_triangles() != primitives.is_triangles() {
                return Err("update changes geometry type".to_owned());
            }
            if state.primitives.len() != primitives.len() {
                return Err(format!(
                    "update changes primitive count from {} to {}",
                    state.primitives.len(),
                    primitives.len()
                ));
            }
            state.bvh.refit(&bounds);
            state.primitives = primitives;
        }
    }

    Ok(())
}

struct Affine {
    m: [[f32; 4]; 3],
}

impl Affine {
    fn point(&self, p: [f32; 3]) -> [f32; 3] {
        std::array::from_fn(|r| {
            self.m[r][0] * p[0] + self.m[r][1] * p[1] + self.m[r][2] * p[2] + self.m[r][3]
        })
    }

    fn vector(&self, v: [f32; 3]) -> [f32; 3] {
        std::array::from_fn(|r| self.m[r][0] * v[0] + self.m[r][1] * v[1] + self.m[r][2] * v[2])
    }

    fn inverse(&self) -> Option<Affine> {
        let m = &self.m;
        let c00 = m[1][1] * m[2][2] - m[1][2] * m[2][1];
        let c01 = m[1][2] * m[2][0] - m[1][0] * m[2][2];
        let c02 = m[1][0] * m[2][1] - m[1][1] * m[2][0];
        let det = m[0][0] * c00 + m[0][1] * c01 + m[0][2] * c02;
        if det.abs() < 1e-12 || !det.is_finite() {
            return None;
        }
        let inv_det = 1.0 / det;

        let r = [
            [
                c00 * inv_det,
                (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
                (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
            ],
            [
                c01 * inv_det,
                (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
                (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
            ],
            [
                c02 * inv_det,
                (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
                (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
            ],
        ];

        let t = [m[0][3], m[1][3], m[2][3]];
        let mut out = [[0.0; 4]; 3];
        for i in 0..3 {
            out[i][..3].copy_from_slice(&r[i]);
            out[i][3] = -(r[i][0] * t[0] + r[i][1] * t[1] + r[i][2] * t[2]);
        }
        Some(Affine { m: out })
    }

    fn transform_bounds(&self, bounds: &Aabb) -> Aabb {
        if bounds.is_empty() {
            return Aabb::EMPTY;
        }
        let mut out = Aabb::EMPTY;
        for corner in 0..8 {
            let p = [
                if corner & 1 == 0 { bounds.min[0] } else { bounds.max[0] },
                if corner & 2 == 0 { bounds.min[1] } else { bounds.max[1] },
                if corner & 4 == 0 { bounds.min[2] } else { bounds.max[2] },
            ];
            out.grow(self.point(p));
        }
        out
    }
}

struct Instance {
    blas: Weak<BlasInner>,
    world_to_object: Affine,
    custom_index: u32,
    mask: u8,
}

struct TlasState {
    flags: AccelerationStructureBuildFlags,
    instances: Vec<Instance>,
    bvh: Bvh,
}

struct TlasInner {
    id: u64,
    name: String,
    storage: SliceRef,
    state: Mutex<Option<TlasState>>,
}

/// Top-level acceleration structure.
/// Contains ray-tracing acceleration structure for instances.
/// Created for instances of bottom-level acceleration structures.
#[derive(Clone)]
pub struct Tlas {
    inner: Arc<TlasInner>,
}

impl fmt::Debug for Tlas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tlas")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl PartialEq for Tlas {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Tlas {}

impl Tlas {
    pub(super) fn new(_device: &Device, desc: TlasDesc) -> Self {
        Tlas {
            inner: Arc::new(TlasInner {
                id: next_id(),
                name: desc.name.to_owned(),
                storage: SliceRef::new(desc.storage),
                state: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(super) fn storage(&self) -> &SliceRef {
        &self.inner.storage
    }

    /// Number of instances in the last successful build. `None` if never built.
    pub fn instance_count(&self) -> Option<u32> {
        self.inner
            .state
            .lock()
            .as_ref()
            .map(|s| s.instances.len() as u32)
    }

    /// Casts a ray in world space and returns the closest hit.
    ///
    /// Instances whose bottom-level structure was destroyed are skipped.
    /// Bottom-level contents are read as of the query,
    /// instance bounds as of the last top-level build.
    pub fn intersect(
        &self,
        origin: [f32; 3],
        direction: [f32; 3],
        t_min: f32,
        t_max: f32,
    ) -> Option<RayHit> {
        let state = self.inner.state.lock();
        let state = state.as_ref()?;
        let ray = Ray::new(origin, direction);

        let (t, hit) = state.bvh.closest(&ray, t_min, t_max, |idx, t_max| {
            let instance = &state.instances[idx as usize];
            if instance.mask == 0 {
                return None;
            }
            let blas = instance.blas.upgrade()?;
            let local = Ray::new(
                instance.world_to_object.point(origin),
                instance.world_to_object.vector(direction),
            );
            let (t, (primitive, kind)) = intersect_blas(&blas, &local, t_min, t_max)?;
            Some((
                t,
                RayHit {
                    t,
                    instance: idx,
                    custom_index: instance.custom_index,
                    primitive,
                    kind,
                },
            ))
        })?;

        debug_assert_eq!(t, hit.t);
        Some(hit)
    }
}

/// Executes a recorded top-level build.
/// Unresolvable instances are reported and left out of the structure.
pub(super) fn build_tlas(
    device: &DeviceInner,
    tlas: &Tlas,
    build: &TlasBuild,
    scratch: &SliceRef,
    warnings: &mut Vec<String>,
) -> Result<(), String> {
    let limits = device.limits();
    let count = build.count;

    if count > limits.max_instance_count {
        return Err(format!(
            "{count} instances exceed the limit of {}",
            limits.max_instance_count
        ));
    }

    if count > 0 {
        let required = sizes(build.flags, count, INSTANCE_SIZE);
        if tlas.storage().size < required.size {
            return Err(format!(
                "storage of {} bytes is too small for {count} instances, {} required",
                tlas.storage().size,
                required.size
            ));
        }
        let scratch_required = match build.mode {
            BuildMode::Build => required.scratch_size,
            BuildMode::Update => required.update_scratch_size,
        };
        if scratch.size < scratch_required {
            return Err(format!(
                "scratch of {} bytes is too small, {scratch_required} required",
                scratch.size
            ));
        }
    }

    let record_size = std::mem::size_of::<TlasInstance>();
    if build.instances.size < count as usize * record_size {
        return Err("instance buffer is too small".to_owned());
    }
    let records: Vec<TlasInstance> = build
        .instances
        .buffer
        .read_pod(build.instances.offset, count as usize);

    let mut instances = Vec::with_capacity(records.len());
    let mut bounds = Vec::with_capacity(records.len());

    for (idx, record) in records.iter().enumerate() {
        let object_to_world = Affine {
            m: record.transform,
        };
        let resolved = device.resolve_blas(record.blas_address);
        let inverse = object_to_world.inverse();

        let (blas, world_to_object, instance_bounds) = match (resolved, inverse) {
            (Some(blas), Some(inverse)) => {
                let blas_bounds = blas
                    .state
                    .lock()
                    .as_ref()
                    .map_or(Aabb::EMPTY, |s| s.bvh.bounds());
                (
                    Arc::downgrade(&blas),
                    inverse,
                    object_to_world.transform_bounds(&blas_bounds),
                )
            }
            (None, _) => {
                warnings.push(format!(
                    "instance {idx} references unknown BLAS address {:#x}",
                    record.blas_address
                ));
                (Weak::new(), Affine { m: [[0.0; 4]; 3] }, Aabb::EMPTY)
            }
            (Some(_), None) => {
                warnings.push(format!("instance {idx} has a singular transform"));
                (Weak::new(), Affine { m: [[0.0; 4]; 3] }, Aabb::EMPTY)
            }
        };

        instances.push(Instance {
            blas,
            world_to_object,
            custom_index: record.custom_index(),
            mask: record.mask(),
        });
        bounds.push(instance_bounds);
    }

    let mut state = tlas.inner.state.lock();
    match build.mode {
        BuildMode::Build => {
            *state = Some(TlasState {
                flags: build.flags,
                instances,
                bvh: Bvh::build(&bounds),
            });
        }
        BuildMode::Update => {
            let Some(state) = state.as_mut() else {
                return Err("update of a structure that was never built".to_owned());
            };
            if !state
                .flags
                .contains(AccelerationStructureBuildFlags::ALLOW_UPDATE)
            {
                return Err("update of a structure built without ALLOW_UPDATE".to_owned());
            }
            if state.instances.len() != instances.len() {
                return Err("update changes instance count".to_owned());
            }
            state.bvh.refit(&bounds);
            state.instances = instances;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic::{BlasAABBs, BufferDesc, BufferUsage, Memory};

    #[test]
    fn sizes_depend_on_flags_and_count() {
        let device = Device::new("test", Limits::default());
        let buffer = crate::traits::Device::new_buffer(
            &device,
            BufferDesc {
                size: 1024,
                usage: BufferUsage::ACCELERATION_STRUCTURE_INPUT,
                memory: Memory::Device,
                name: "boxes",
            },
        )
        .unwrap();

        let geometry = BlasGeometryDesc::AABBs(BlasAABBs {
            opaque: true,
            boxes: buffer.slice(..),
            box_stride: 24,
        });

        let limits = Limits::default();
        let plain = blas_sizes(&limits, &geometry, AccelerationStructureBuildFlags::empty(), 100)
            .unwrap();
        assert_eq!(plain.update_scratch_size, 0);
        assert!(plain.size >= 100 * AABB_SIZE);
        assert_eq!(plain.size % SIZE_ALIGNMENT, 0);

        let update = blas_sizes(
            &limits,
            &geometry,
            AccelerationStructureBuildFlags::ALLOW_UPDATE,
            100,
        )
        .unwrap();
        assert!(update.update_scratch_size > 0);

        assert_eq!(
            blas_sizes(&limits, &geometry, AccelerationStructureBuildFlags::empty(), 0),
            Err(BuildSizesError::ZeroPrimitives)
        );

        let small = Limits {
            max_primitive_count: 10,
            ..Limits::default()
        };
        assert!(matches!(
            blas_sizes(&small, &geometry, AccelerationStructureBuildFlags::empty(), 11),
            Err(BuildSizesError::TooManyPrimitives { count: 11, limit: 10 })
        ));
    }

    #[test]
    fn affine_inverse_roundtrip() {
        let m = Affine {
            m: [
                [0.0, -2.0, 0.0, 1.0],
                [1.0, 0.0, 0.0, 2.0],
                [0.0, 0.0, 3.0, 3.0],
            ],
        };
        let inv = m.inverse().unwrap();
        let p = [0.25, -4.0, 7.0];
        let q = inv.point(m.point(p));
        for i in 0..3 {
            assert!((p[i] - q[i]).abs() < 1e-5);
        }

        let singular = Affine { m: [[0.0; 4]; 3] };
        assert!(singular.inverse().is_none());
    }
}
