use std::sync::Arc;

use crate::backend::{Image, KernelContext};

use super::BufferSlice;

/// Compute program executed by the device once per invocation.
///
/// Invocations of a dispatch may run in any order.
/// Kernels communicate only through bound resources and atomics.
pub trait Kernel: Send + Sync + 'static {
    fn invoke(&self, cx: &KernelContext, inv: Invocation);
}

/// Identifies a single invocation within a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Invocation {
    /// Global invocation id.
    pub global: [u32; 3],

    /// Work group id.
    pub group: [u32; 3],

    /// Invocation id within the work group.
    pub local: [u32; 3],

    /// Flattened `local`.
    pub local_index: u32,
}

/// How a kernel accesses a bound resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn reads(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Resource bound to a compute pipeline.
/// Bindings are numbered by position in the argument list.
#[derive(Clone, Copy, Debug)]
pub enum Argument<'a> {
    Buffer {
        slice: BufferSlice<'a>,
        access: Access,
    },
    Image {
        image: &'a Image,
        level: u32,
        access: Access,
    },
}

impl<'a> Argument<'a> {
    pub fn read(slice: impl Into<BufferSlice<'a>>) -> Self {
        Argument::Buffer {
            slice: slice.into(),
            access: Access::Read,
        }
    }

    pub fn write(slice: impl Into<BufferSlice<'a>>) -> Self {
        Argument::Buffer {
            slice: slice.into(),
            access: Access::Write,
        }
    }

    pub fn read_write(slice: impl Into<BufferSlice<'a>>) -> Self {
        Argument::Buffer {
            slice: slice.into(),
            access: Access::ReadWrite,
        }
    }

    pub fn sampled(image: &'a Image, level: u32) -> Self {
        Argument::Image {
            image,
            level,
            access: Access::Read,
        }
    }
}

pub struct ComputePipelineDesc<'a> {
    pub name: &'a str,
    pub kernel: Arc<dyn Kernel>,
    pub work_group_size: [u32; 3],
}
