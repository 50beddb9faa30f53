use std::{error::Error, fmt};

use super::{BufferSlice, VertexFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccelerationStructureSizes {
    pub size: usize,
    pub scratch_size: usize,
    pub update_scratch_size: usize,
}

/// Error returned when the device cannot size an acceleration structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildSizesError {
    /// Acceleration structure must contain at least one primitive.
    ZeroPrimitives,

    /// Primitive or instance count exceeds device limit.
    TooManyPrimitives { count: u32, limit: u32 },

    /// Vertex format cannot be used as acceleration structure input.
    UnsupportedVertexFormat(VertexFormat),

    /// Stride is smaller than the element it steps over.
    InvalidStride { stride: usize, min: usize },
}

impl fmt::Display for BuildSizesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildSizesError::ZeroPrimitives => write!(f, "zero primitives"),
            BuildSizesError::TooManyPrimitives { count, limit } => {
                write!(f, "{count} primitives exceed the limit of {limit}")
            }
            BuildSizesError::UnsupportedVertexFormat(format) => {
                write!(f, "vertex format {format:?} is not supported")
            }
            BuildSizesError::InvalidStride { stride, min } => {
                write!(f, "stride {stride} is smaller than {min}")
            }
        }
    }
}

impl Error for BuildSizesError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationStructurePerformance {
    Default,
    FastTrace,
    FastBuild,
}

bitflags::bitflags! {
    /// These flags are used to specify the build properties of an acceleration structure.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AccelerationStructureBuildFlags: u32 {
        /// Specifies that built acceleration structure could be used as a source
        /// for build with update operation.
        const ALLOW_UPDATE = 0x1;

        /// Specifies that built acceleration structure could be used as a source
        /// for copy operation with `Compact` mode.
        const ALLOW_COMPACTION = 0x2;
    }
}

/// Whether a build constructs new topology or refits the existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildMode {
    /// Full build. Previous contents are discarded.
    Build,

    /// Refit of bounds over previously built topology.
    /// Requires previous build with `ALLOW_UPDATE` and the same primitive count.
    Update,
}

/// Number of primitives consumed by a build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveCount<'a> {
    /// Count known when the command is recorded.
    Direct(u32),

    /// Count read from a `u32` in device memory when the command executes.
    Indirect(BufferSlice<'a>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasTriangles<'a> {
    pub opaque: bool,
    pub indices: Option<BufferSlice<'a>>,
    pub vertices: BufferSlice<'a>,
    pub vertex_stride: usize,
    pub vertex_format: VertexFormat,
    pub transform: Option<BufferSlice<'a>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasAABBs<'a> {
    pub opaque: bool,
    pub boxes: BufferSlice<'a>,
    pub box_stride: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlasGeometryDesc<'a> {
    Triangles(BlasTriangles<'a>),
    AABBs(BlasAABBs<'a>),
}

impl BlasGeometryDesc<'_> {
    pub fn is_triangles(&self) -> bool {
        matches!(self, BlasGeometryDesc::Triangles(_))
    }
}

/// Description of a bottom-level acceleration structure.
/// The structure lives in the given storage slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasDesc<'a> {
    pub name: &'a str,
    pub storage: BufferSlice<'a>,
}

/// Description of a bottom-level acceleration structure build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasBuildDesc<'a> {
    pub performance: AccelerationStructurePerformance,
    pub flags: AccelerationStructureBuildFlags,
    pub mode: BuildMode,
    pub geometry: BlasGeometryDesc<'a>,
    pub count: PrimitiveCount<'a>,
}

/// Description of a top-level acceleration structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TlasDesc<'a> {
    pub name: &'a str,
    pub storage: BufferSlice<'a>,
}

/// Description of a top-level acceleration structure build.
/// Instances are read as [`TlasInstance`] records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TlasBuildDesc<'a> {
    pub flags: AccelerationStructureBuildFlags,
    pub mode: BuildMode,
    pub instances: BufferSlice<'a>,
    pub count: u32,
}

/// Instance record consumed by top-level builds.
/// Layout matches `VkAccelerationStructureInstanceKHR`.
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct TlasInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],

    /// 24 bits of custom index and 8 bits of visibility mask.
    pub custom_index_mask: u32,

    /// 24 bits of shader binding table offset and 8 bits of flags.
    pub sbt_offset_flags: u32,

    /// Device address of the bottom-level acceleration structure.
    pub blas_address: u64,
}

impl TlasInstance {
    pub const IDENTITY: [[f32; 4]; 3] = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ];

    pub fn new(transform: [[f32; 4]; 3], custom_index: u32, mask: u8, blas_address: u64) -> Self {
        debug_assert!(custom_index < (1 << 24));
        TlasInstance {
            transform,
            custom_index_mask: (custom_index & 0xFF_FFFF) | ((mask as u32) << 24),
            sbt_offset_flags: 0,
            blas_address,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_mask & 0xFF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_mask >> 24) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::TlasInstance;

    #[test]
    fn instance_layout() {
        assert_eq!(std::mem::size_of::<TlasInstance>(), 64);

        let instance = TlasInstance::new(TlasInstance::IDENTITY, 0x12_3456, 0xFF, 0xDEAD_0000);
        assert_eq!(instance.custom_index(), 0x12_3456);
        assert_eq!(instance.mask(), 0xFF);

        let bytes = bytemuck::bytes_of(&instance);
        assert_eq!(&bytes[56..64], &0xDEAD_0000u64.to_le_bytes());
    }
}
