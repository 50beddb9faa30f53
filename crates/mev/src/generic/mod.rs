mod acst;
mod buffer;
mod compute_pipeline;
mod format;
mod image;
mod instance;
mod queue;
mod stages;

use std::{error::Error, fmt};

pub use self::{
    acst::{
        AccelerationStructureBuildFlags, AccelerationStructurePerformance,
        AccelerationStructureSizes, BlasAABBs, BlasBuildDesc, BlasDesc, BlasGeometryDesc,
        BlasTriangles, BuildMode, BuildSizesError, PrimitiveCount, TlasBuildDesc, TlasDesc,
        TlasInstance,
    },
    buffer::{AsBufferSlice, BufferDesc, BufferIndex, BufferInitDesc, BufferSlice, BufferUsage, Memory},
    compute_pipeline::{Access, Argument, ComputePipelineDesc, Invocation, Kernel},
    format::{PixelFormat, VertexFormat},
    image::{level_extent, ImageDesc, ImageUsage},
    instance::{
        Capabilities, CreateError, DeviceCapabilities, DeviceDesc, FamilyCapabilities, Limits,
    },
    queue::QueueFlags,
    stages::{PipelineStage, PipelineStages},
};

/// Error that can happen when device's memory is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out of memory")
    }
}

impl Error for OutOfMemory {}

pub enum DeviceError<T = ()> {
    OutOfMemory(T),
    DeviceLost,
}

impl From<OutOfMemory> for DeviceError {
    #[inline(never)]
    fn from(_: OutOfMemory) -> Self {
        DeviceError::OutOfMemory(())
    }
}

impl<T> fmt::Debug for DeviceError<T> {
    #[inline(never)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OutOfMemory(_) => write!(f, "DeviceError::OutOfMemory"),
            DeviceError::DeviceLost => write!(f, "DeviceError::DeviceLost"),
        }
    }
}

impl<T> fmt::Display for DeviceError<T> {
    #[inline(never)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OutOfMemory(_) => write!(f, "out of memory"),
            DeviceError::DeviceLost => write!(f, "device lost"),
        }
    }
}

impl<T> Error for DeviceError<T> {}

/// Command rejected by the device at execution time.
///
/// Real drivers turn these into undefined behavior.
/// The software backend skips the offending command and reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// Index of the command in its command buffer.
    pub command: usize,

    /// Name of the resource the command operated on.
    pub resource: String,

    /// What went wrong.
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command #{} on '{}': {}",
            self.command, self.resource, self.message
        )
    }
}

impl Error for ValidationError {}

pub trait Zero {
    const ZERO: Self;
}

impl Zero for u32 {
    const ZERO: Self = 0;
}

impl Zero for f32 {
    const ZERO: Self = 0.0;
}

pub trait One {
    const ONE: Self;
}

impl One for u32 {
    const ONE: Self = 1;
}

impl One for f32 {
    const ONE: Self = 1.0;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Extent<T, const D: usize>(pub [T; D]);

impl<T, const D: usize> Extent<T, D>
where
    T: Zero,
{
    pub const ZERO: Self = Self([T::ZERO; D]);
}

impl<T, const D: usize> Extent<T, D>
where
    T: One,
{
    pub const ONE: Self = Self([T::ONE; D]);
}

pub type Extent2<T = u32> = Extent<T, 2>;
pub type Extent3<T = u32> = Extent<T, 3>;

impl<T: Copy> Extent2<T> {
    pub const fn new(width: T, height: T) -> Self {
        Self([width, height])
    }

    pub const fn width(&self) -> T {
        self.0[0]
    }

    pub const fn height(&self) -> T {
        self.0[1]
    }

    pub const fn to_3d(&self) -> Extent3<T>
    where
        T: One,
    {
        let [width, height] = self.0;
        Extent3::new(width, height, T::ONE)
    }
}

impl Extent2<u32> {
    /// Number of texels covered by the extent.
    pub const fn area(&self) -> u32 {
        self.0[0] * self.0[1]
    }
}

impl<T: Copy> Extent3<T> {
    pub const fn new(width: T, height: T, depth: T) -> Self {
        Self([width, height, depth])
    }

    pub const fn width(&self) -> T {
        self.0[0]
    }

    pub const fn height(&self) -> T {
        self.0[1]
    }

    pub const fn depth(&self) -> T {
        self.0[2]
    }

    pub const fn to_2d(&self) -> Extent2<T> {
        let [width, height, _] = self.0;
        Extent2::new(width, height)
    }
}
