use crate::generic::{
    Access, AccelerationStructureBuildFlags, Argument, AsBufferSlice, BlasBuildDesc,
    BlasGeometryDesc, BufferSlice, BuildMode, OutOfMemory, PipelineStages, PrimitiveCount,
    TlasBuildDesc, VertexFormat,
};

use super::{Blas, Buffer, ComputePipeline, Device, Image, Tlas};

/// Buffer slice that keeps the buffer alive until the command executes.
#[derive(Clone, Debug)]
pub(super) struct SliceRef {
    pub buffer: Buffer,
    pub offset: usize,
    pub size: usize,
}

impl SliceRef {
    pub fn new(slice: BufferSlice) -> Self {
        SliceRef {
            buffer: slice.buffer.clone(),
            offset: slice.offset,
            size: slice.size,
        }
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }

    pub fn read_u32(&self, at: usize) -> Option<u32> {
        if at + 4 > self.size {
            return None;
        }
        let bytes = self.buffer.read_bytes(self.offset + at, 4);
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_f32s<const N: usize>(&self, at: usize) -> Option<[f32; N]> {
        if at + N * 4 > self.size {
            return None;
        }
        let bytes = self.buffer.read_bytes(self.offset + at, N * 4);
        Some(std::array::from_fn(|i| {
            f32::from_le_bytes([
                bytes[i * 4],
                bytes[i * 4 + 1],
                bytes[i * 4 + 2],
                bytes[i * 4 + 3],
            ])
        }))
    }
}

#[derive(Clone, Debug)]
pub(super) enum BoundArgument {
    Buffer {
        slice: SliceRef,
        access: Access,
    },
    Image {
        image: Image,
        level: u32,
        access: Access,
    },
}

#[derive(Clone, Debug)]
pub(super) enum Groups {
    Direct([u32; 3]),
    Indirect(SliceRef),
}

#[derive(Clone, Debug)]
pub(super) enum Count {
    Direct(u32),
    Indirect(SliceRef),
}

impl Count {
    fn new(count: PrimitiveCount) -> Self {
        match count {
            PrimitiveCount::Direct(count) => Count::Direct(count),
            PrimitiveCount::Indirect(slice) => Count::Indirect(SliceRef::new(slice)),
        }
    }
}

#[derive(Clone, Debug)]
pub(super) enum Geometry {
    Triangles {
        indices: Option<SliceRef>,
        vertices: SliceRef,
        vertex_stride: usize,
        vertex_format: VertexFormat,
        transform: Option<SliceRef>,
    },
    Aabbs {
        boxes: SliceRef,
        box_stride: usize,
    },
}

impl Geometry {
    fn new(geometry: BlasGeometryDesc) -> Self {
        match geometry {
            BlasGeometryDesc::Triangles(triangles) => Geometry::Triangles {
                indices: triangles.indices.map(SliceRef::new),
                vertices: SliceRef::new(triangles.vertices),
                vertex_stride: triangles.vertex_stride,
                vertex_format: triangles.vertex_format,
                transform: triangles.transform.map(SliceRef::new),
            },
            BlasGeometryDesc::AABBs(aabbs) => Geometry::Aabbs {
                boxes: SliceRef::new(aabbs.boxes),
                box_stride: aabbs.box_stride,
            },
        }
    }

    pub fn inputs(&self) -> impl Iterator<Item = &SliceRef> {
        let (a, b, c) = match self {
            Geometry::Triangles {
                indices,
                vertices,
                transform,
                ..
            } => (Some(vertices), indices.as_ref(), transform.as_ref()),
            Geometry::Aabbs { boxes, .. } => (Some(boxes), None, None),
        };
        a.into_iter().chain(b).chain(c)
    }
}

#[derive(Clone, Debug)]
pub(super) struct BlasBuild {
    pub flags: AccelerationStructureBuildFlags,
    pub mode: BuildMode,
    pub geometry: Geometry,
    pub count: Count,
}

#[derive(Clone, Debug)]
pub(super) struct TlasBuild {
    pub flags: AccelerationStructureBuildFlags,
    pub mode: BuildMode,
    pub instances: SliceRef,
    pub count: u32,
}

#[derive(Clone, Debug)]
pub(super) enum Command {
    Barrier {
        after: PipelineStages,
        before: PipelineStages,
    },
    WriteBuffer {
        dst: SliceRef,
        data: Vec<u8>,
    },
    FillBuffer {
        dst: SliceRef,
        data: u32,
    },
    CopyBuffer {
        src: SliceRef,
        dst: SliceRef,
    },
    Dispatch {
        pipeline: ComputePipeline,
        arguments: Vec<BoundArgument>,
        constants: Vec<u8>,
        groups: Groups,
    },
    BuildBlas {
        blas: Blas,
        build: BlasBuild,
        scratch: SliceRef,
    },
    BuildTlas {
        tlas: Tlas,
        build: TlasBuild,
        scratch: SliceRef,
    },
}

/// Recorded commands ready for submission.
#[derive(Debug)]
pub struct CommandBuffer {
    pub(super) commands: Vec<Command>,
    pub(super) device: Device,
}

impl CommandBuffer {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

pub struct CommandEncoder {
    device: Device,
    commands: Vec<Command>,
}

impl CommandEncoder {
    pub(super) fn new(device: Device) -> Self {
        CommandEncoder {
            device,
            commands: Vec::new(),
        }
    }
}

#[hidden_trait::expose]
impl crate::traits::CommandEncoder for CommandEncoder {
    #[inline(never)]
    fn barrier(&mut self, after: PipelineStages, before: PipelineStages) {
        self.commands.push(Command::Barrier { after, before });
    }

    #[inline(never)]
    fn copy(&mut self) -> CopyCommandEncoder<'_> {
        CopyCommandEncoder {
            commands: &mut self.commands,
        }
    }

    #[inline(never)]
    fn compute(&mut self) -> ComputeCommandEncoder<'_> {
        ComputeCommandEncoder {
            commands: &mut self.commands,
            pipeline: None,
            arguments: Vec::new(),
            constants: Vec::new(),
        }
    }

    #[inline(never)]
    fn acceleration_structure(&mut self) -> AccelerationStructureCommandEncoder<'_> {
        AccelerationStructureCommandEncoder {
            commands: &mut self.commands,
        }
    }

    #[inline(never)]
    fn finish(self) -> Result<CommandBuffer, OutOfMemory> {
        Ok(CommandBuffer {
            commands: self.commands,
            device: self.device,
        })
    }
}

pub struct CopyCommandEncoder<'a> {
    commands: &'a mut Vec<Command>,
}

#[hidden_trait::expose]
impl crate::traits::CopyCommandEncoder for CopyCommandEncoder<'_> {
    #[inline(never)]
    fn barrier(&mut self, after: PipelineStages, before: PipelineStages) {
        self.commands.push(Command::Barrier { after, before });
    }

    #[inline(never)]
    fn write_buffer_raw(&mut self, slice: impl AsBufferSlice, data: &[u8]) {
        let slice = slice.as_buffer_slice();
        debug_assert!(data.len() <= slice.size, "write exceeds buffer slice");
        let size = data.len().min(slice.size);
        self.commands.push(Command::WriteBuffer {
            dst: SliceRef::new(slice.slice(..size)),
            data: data[..size].to_vec(),
        });
    }

    #[inline(always)]
    fn write_buffer(&mut self, slice: impl AsBufferSlice, data: &impl bytemuck::Pod) {
        self.write_buffer_raw(slice, bytemuck::bytes_of(data));
    }

    #[inline(always)]
    fn write_buffer_slice(&mut self, slice: impl AsBufferSlice, data: &[impl bytemuck::Pod]) {
        self.write_buffer_raw(slice, bytemuck::cast_slice(data));
    }

    #[inline(never)]
    fn fill_buffer(&mut self, slice: impl AsBufferSlice, data: u32) {
        self.commands.push(Command::FillBuffer {
            dst: SliceRef::new(slice.as_buffer_slice()),
            data,
        });
    }

    #[inline(never)]
    fn copy_buffer(&mut self, src: impl AsBufferSlice, dst: impl AsBufferSlice) {
        let src = src.as_buffer_slice();
        let dst = dst.as_buffer_slice();
        debug_assert_eq!(src.size, dst.size, "copy slices must have equal size");
        let size = src.size.min(dst.size);
        self.commands.push(Command::CopyBuffer {
            src: SliceRef::new(src.slice(..size)),
            dst: SliceRef::new(dst.slice(..size)),
        });
    }
}

pub struct ComputeCommandEncoder<'a> {
    commands: &'a mut Vec<Command>,
    pipeline: Option<ComputePipeline>,
    arguments: Vec<BoundArgument>,
    constants: Vec<u8>,
}

impl ComputeCommandEncoder<'_> {
    fn push_dispatch(&mut self, groups: Groups) {
        let Some(pipeline) = self.pipeline.clone() else {
            tracing::error!("Dispatch requires a pipeline to be bound to the encoder");
            return;
        };

        self.commands.push(Command::Dispatch {
            pipeline,
            arguments: self.arguments.clone(),
            constants: self.constants.clone(),
            groups,
        });
    }
}

#[hidden_trait::expose]
impl crate::traits::ComputeCommandEncoder for ComputeCommandEncoder<'_> {
    #[inline(never)]
    fn with_pipeline(&mut self, pipeline: &ComputePipeline) {
        self.pipeline = Some(pipeline.clone());
    }

    #[inline(never)]
    fn with_arguments(&mut self, arguments: &[Argument]) {
        self.arguments = arguments
            .iter()
            .map(|argument| match *argument {
                Argument::Buffer { slice, access } => BoundArgument::Buffer {
                    slice: SliceRef::new(slice),
                    access,
                },
                Argument::Image {
                    image,
                    level,
                    access,
                } => BoundArgument::Image {
                    image: image.clone(),
                    level,
                    access,
                },
            })
            .collect();
    }

    #[inline(never)]
    fn with_constants(&mut self, constants: &impl bytemuck::Pod) {
        self.constants = bytemuck::bytes_of(constants).to_vec();
    }

    #[inline(never)]
    fn dispatch(&mut self, groups: [u32; 3]) {
        self.push_dispatch(Groups::Direct(groups));
    }

    #[inline(never)]
    fn dispatch_indirect(&mut self, args: impl AsBufferSlice) {
        self.push_dispatch(Groups::Indirect(SliceRef::new(args.as_buffer_slice())));
    }
}

pub struct AccelerationStructureCommandEncoder<'a> {
    commands: &'a mut Vec<Command>,
}

#[hidden_trait::expose]
impl crate::traits::AccelerationStructureCommandEncoder
    for AccelerationStructureCommandEncoder<'_>
{
    #[inline(never)]
    fn build_blas(&mut self, blas: &Blas, desc: BlasBuildDesc, scratch: impl AsBufferSlice) {
        self.commands.push(Command::BuildBlas {
            blas: blas.clone(),
            build: BlasBuild {
                flags: desc.flags,
                mode: desc.mode,
                geometry: Geometry::new(desc.geometry),
                count: Count::new(desc.count),
            },
            scratch: SliceRef::new(scratch.as_buffer_slice()),
        });
    }

    #[inline(never)]
    fn build_tlas(&mut self, tlas: &Tlas, desc: TlasBuildDesc, scratch: impl AsBufferSlice) {
        self.commands.push(Command::BuildTlas {
            tlas: tlas.clone(),
            build: TlasBuild {
                flags: desc.flags,
                mode: desc.mode,
                instances: SliceRef::new(desc.instances),
                count: desc.count,
            },
            scratch: SliceRef::new(scratch.as_buffer_slice()),
        });
    }
}
