use std::fmt::Debug;

use crate::generic::{
    AccelerationStructureBuildFlags, AccelerationStructureSizes, Argument, AsBufferSlice,
    BlasBuildDesc, BlasDesc, BlasGeometryDesc, BufferDesc, BufferInitDesc, BuildSizesError,
    Capabilities, ComputePipelineDesc, CreateError, DeviceDesc, DeviceError, Extent2, ImageDesc,
    OutOfMemory, PipelineStages, PixelFormat, TlasBuildDesc, TlasDesc,
};

pub trait Instance: Debug + Send + Sync + 'static {
    fn capabilities(&self) -> &Capabilities;
    fn create(
        &self,
        info: DeviceDesc,
    ) -> Result<(crate::backend::Device, Vec<crate::backend::Queue>), CreateError>;
}

pub trait Device: Clone + Debug + Eq + Send + Sync + 'static {
    /// Create a new compute pipeline.
    fn new_compute_pipeline(
        &self,
        desc: ComputePipelineDesc,
    ) -> Result<crate::backend::ComputePipeline, OutOfMemory>;

    /// Create a new buffer with zeroed contents.
    fn new_buffer(&self, desc: BufferDesc) -> Result<crate::backend::Buffer, OutOfMemory>;

    /// Create a new buffer and initialize it with the given data.
    fn new_buffer_init(&self, desc: BufferInitDesc) -> Result<crate::backend::Buffer, OutOfMemory>;

    /// Create a new image.
    fn new_image(&self, desc: ImageDesc) -> Result<crate::backend::Image, OutOfMemory>;

    /// Returns sizes required to build bottom-level acceleration structure
    /// over up to `primitive_count` primitives of the given geometry.
    fn blas_build_sizes(
        &self,
        geometry: &BlasGeometryDesc,
        flags: AccelerationStructureBuildFlags,
        primitive_count: u32,
    ) -> Result<AccelerationStructureSizes, BuildSizesError>;

    /// Returns sizes required to build top-level acceleration structure
    /// over up to `instance_count` instances.
    fn tlas_build_sizes(
        &self,
        flags: AccelerationStructureBuildFlags,
        instance_count: u32,
    ) -> Result<AccelerationStructureSizes, BuildSizesError>;

    /// Create a new bottom-level acceleration structure.
    fn new_blas(&self, desc: BlasDesc) -> Result<crate::backend::Blas, OutOfMemory>;

    /// Create a new top-level acceleration structure.
    fn new_tlas(&self, desc: TlasDesc) -> Result<crate::backend::Tlas, OutOfMemory>;
}

pub trait Queue: Debug + Send + Sync + 'static {
    /// Get the queue family index.
    fn family(&self) -> u32;

    /// Get the device this queue belongs to.
    fn device(&self) -> &crate::backend::Device;

    /// Create a new command encoder associated with this queue.
    /// The encoder must be submitted to the queue it was created from.
    fn new_command_encoder(&mut self) -> Result<crate::backend::CommandEncoder, OutOfMemory>;

    /// Submit command buffers to the queue.
    ///
    /// Work may complete at any later point,
    /// observe it with [`Queue::completed`] or [`Queue::wait_idle`].
    fn submit<I>(&mut self, command_buffers: I) -> Result<(), DeviceError>
    where
        I: IntoIterator<Item = crate::backend::CommandBuffer>;

    /// Blocks until all submitted work is complete.
    fn wait_idle(&mut self) -> Result<(), DeviceError>;

    /// Number of command buffers submitted so far.
    fn submitted(&self) -> u64;

    /// Number of command buffers completed so far.
    fn completed(&self) -> u64;
}

pub trait CommandEncoder {
    /// Synchronizes the access to the resources.
    /// Commands in `before` stages of subsequent commands will be
    /// executed only after commands in `after` stages of previous commands
    /// are finished.
    fn barrier(&mut self, after: PipelineStages, before: PipelineStages);

    /// Returns encoder for copy commands.
    fn copy(&mut self) -> crate::backend::CopyCommandEncoder<'_>;

    /// Returns encoder for compute commands.
    fn compute(&mut self) -> crate::backend::ComputeCommandEncoder<'_>;

    /// Returns encoder for acceleration structure commands.
    fn acceleration_structure(&mut self)
        -> crate::backend::AccelerationStructureCommandEncoder<'_>;

    /// Finishes encoding and returns the command buffer.
    fn finish(self) -> Result<crate::backend::CommandBuffer, OutOfMemory>;
}

pub trait CopyCommandEncoder {
    /// Synchronizes the access to the resources.
    /// Commands in `before` stages of subsequent commands will be
    /// executed only after commands in `after` stages of previous commands
    /// are finished.
    fn barrier(&mut self, after: PipelineStages, before: PipelineStages);

    /// Writes data to the buffer.
    fn write_buffer_raw(&mut self, slice: impl AsBufferSlice, data: &[u8]);

    /// Writes data to the buffer.
    fn write_buffer(&mut self, slice: impl AsBufferSlice, data: &impl bytemuck::Pod);

    /// Writes data to the buffer.
    fn write_buffer_slice(&mut self, slice: impl AsBufferSlice, data: &[impl bytemuck::Pod]);

    /// Fills the buffer with repeated 32-bit word.
    fn fill_buffer(&mut self, slice: impl AsBufferSlice, data: u32);

    /// Copies bytes from one buffer to another.
    /// Slices must have equal size.
    fn copy_buffer(&mut self, src: impl AsBufferSlice, dst: impl AsBufferSlice);
}

pub trait ComputeCommandEncoder {
    /// Sets the current compute pipeline.
    fn with_pipeline(&mut self, pipeline: &crate::backend::ComputePipeline);

    /// Binds resources for subsequent dispatches.
    fn with_arguments(&mut self, arguments: &[Argument]);

    /// Sets constants for subsequent dispatches.
    fn with_constants(&mut self, constants: &impl bytemuck::Pod);

    /// Dispatches the given number of work groups.
    fn dispatch(&mut self, groups: [u32; 3]);

    /// Dispatches work groups counted by three `u32` in device memory.
    fn dispatch_indirect(&mut self, args: impl AsBufferSlice);
}

pub trait AccelerationStructureCommandEncoder {
    fn build_blas(
        &mut self,
        blas: &crate::backend::Blas,
        desc: BlasBuildDesc,
        scratch: impl AsBufferSlice,
    );

    fn build_tlas(
        &mut self,
        tlas: &crate::backend::Tlas,
        desc: TlasBuildDesc,
        scratch: impl AsBufferSlice,
    );
}

pub trait Buffer: Clone + Debug + Eq + std::hash::Hash + Send + Sync + 'static {
    /// Returns the size of the buffer in bytes.
    fn size(&self) -> usize;

    /// Returns device address of the buffer.
    /// Zero if the buffer has no `DEVICE_ADDRESS` usage.
    fn device_address(&self) -> u64;
}

pub trait Image: Clone + Debug + Eq + std::hash::Hash + Send + Sync + 'static {
    /// Returns the pixel format of the image.
    fn format(&self) -> PixelFormat;

    /// Returns the dimensions of the base level.
    fn extent(&self) -> Extent2;

    /// Returns the number of mip levels in the image.
    fn levels(&self) -> u32;
}
