//! Bottom- and top-level acceleration structures over proxy geometry.

mod blas;
mod owner;
mod tlas;

use std::sync::atomic::{AtomicU64, Ordering};

pub use self::{
    blas::{BottomLevelDesc, BottomLevelIndex},
    owner::{DepthAs, TriangleAs},
    tlas::TopLevelIndex,
};

use crate::volume::BoundingVolume;

/// Size of a triangle vertex consumed by triangle builds.
pub const TRIANGLE_VERTEX_SIZE: usize = 12;

/// Class of primitives a bottom-level index is built over.
/// Fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Aabbs,
    Triangles,
}

/// Device data a bottom-level build reads primitives from.
#[derive(Clone, Copy, Debug)]
pub enum PrimitiveSource<'a> {
    /// Tightly packed [`BoundingVolume`]s.
    Aabbs(mev::BufferSlice<'a>),

    /// Non-indexed triangle list of `[f32; 3]` positions, three per triangle.
    Triangles(mev::BufferSlice<'a>),
}

impl<'a> PrimitiveSource<'a> {
    pub fn kind(&self) -> GeometryKind {
        match self {
            PrimitiveSource::Aabbs(_) => GeometryKind::Aabbs,
            PrimitiveSource::Triangles(_) => GeometryKind::Triangles,
        }
    }

    pub fn slice(&self) -> mev::BufferSlice<'a> {
        match *self {
            PrimitiveSource::Aabbs(slice) | PrimitiveSource::Triangles(slice) => slice,
        }
    }

    /// Number of whole primitives the source holds.
    pub fn capacity(&self) -> u32 {
        let stride = match self {
            PrimitiveSource::Aabbs(_) => BoundingVolume::SIZE,
            PrimitiveSource::Triangles(_) => TRIANGLE_VERTEX_SIZE * 3,
        };
        (self.slice().size() / stride) as u32
    }

    fn geometry(&self) -> mev::BlasGeometryDesc<'a> {
        match *self {
            PrimitiveSource::Aabbs(boxes) => mev::BlasGeometryDesc::AABBs(mev::BlasAABBs {
                opaque: true,
                boxes,
                box_stride: BoundingVolume::SIZE,
            }),
            PrimitiveSource::Triangles(vertices) => {
                mev::BlasGeometryDesc::Triangles(mev::BlasTriangles {
                    opaque: true,
                    indices: None,
                    vertices,
                    vertex_stride: TRIANGLE_VERTEX_SIZE,
                    vertex_format: mev::VertexFormat::Float32x3,
                    transform: None,
                })
            }
        }
    }
}

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// Process-unique generation of a freshly created bottom-level index.
fn next_generation() -> u64 {
    GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Checks the newest validation errors of `queue` after a blocking creation build.
fn check_rejected(queue: &mev::Queue, before: usize) -> Result<(), crate::ProxyError> {
    match queue.validation_errors().get(before) {
        None => Ok(()),
        Some(error) => {
            tracing::error!("Creation build rejected: {error}");
            Err(crate::ProxyError::Rejected(error.clone()))
        }
    }
}
