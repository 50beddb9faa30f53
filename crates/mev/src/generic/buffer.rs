use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use crate::backend::Buffer;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x0000_0001;
        const TRANSFER_DST = 0x0000_0002;
        const UNIFORM = 0x0000_0004;
        const STORAGE = 0x0000_0008;
        const INDEX = 0x0000_0010;
        const VERTEX = 0x0000_0020;
        const INDIRECT = 0x0000_0040;

        /// Buffer has a device address that shaders and
        /// acceleration structure instances may refer to.
        const DEVICE_ADDRESS = 0x0000_0080;

        /// Buffer may be read by acceleration structure builds.
        const ACCELERATION_STRUCTURE_INPUT = 0x0000_0100;

        /// Buffer may back an acceleration structure.
        const ACCELERATION_STRUCTURE_STORAGE = 0x0000_0200;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Memory {
    Device,
    Shared,
    Upload,
    Download,
}

/// Buffer description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc<'a> {
    /// Buffer size.
    pub size: usize,

    /// Buffer usage flags.
    pub usage: BufferUsage,

    /// Buffer memory type.
    pub memory: Memory,

    /// Buffer debug name.
    pub name: &'a str,
}

/// Buffer description with initial contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferInitDesc<'a> {
    /// Buffer initial contents.
    pub data: &'a [u8],

    /// Buffer usage flags.
    pub usage: BufferUsage,

    /// Buffer memory type.
    pub memory: Memory,

    /// Buffer debug name.
    pub name: &'a str,
}

pub trait BufferIndex {
    fn range(self, size: usize) -> Range<usize>;
}

impl BufferIndex for Range<usize> {
    #[cfg_attr(inline_more, inline(always))]
    fn range(self, size: usize) -> Range<usize> {
        debug_assert!(self.end <= size, "buffer range out of bounds");
        let end = self.end.min(size);
        let start = self.start.min(end);
        start..end
    }
}

impl BufferIndex for RangeFrom<usize> {
    #[cfg_attr(inline_more, inline(always))]
    fn range(self, size: usize) -> Range<usize> {
        debug_assert!(self.start <= size, "buffer range out of bounds");
        let start = self.start.min(size);
        start..size
    }
}

impl BufferIndex for RangeTo<usize> {
    #[cfg_attr(inline_more, inline(always))]
    fn range(self, size: usize) -> Range<usize> {
        debug_assert!(self.end <= size, "buffer range out of bounds");
        let end = self.end.min(size);
        0..end
    }
}

impl BufferIndex for RangeFull {
    #[cfg_attr(inline_more, inline(always))]
    fn range(self, size: usize) -> Range<usize> {
        0..size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferSlice<'a> {
    pub(crate) buffer: &'a Buffer,
    pub(crate) offset: usize,
    pub(crate) size: usize,
}

impl BufferSlice<'_> {
    pub fn buffer(&self) -> &Buffer {
        self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Device address of the first byte of the slice.
    /// Zero if the buffer was created without `DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> u64 {
        match crate::traits::Buffer::device_address(self.buffer) {
            0 => 0,
            address => address + self.offset as u64,
        }
    }
}

impl Buffer {
    /// Returns range of the buffer.
    #[cfg_attr(inline_more, inline)]
    pub fn slice<R>(&self, range: R) -> BufferSlice
    where
        R: BufferIndex,
    {
        let range = range.range(crate::traits::Buffer::size(self));
        BufferSlice {
            buffer: self,
            offset: range.start,
            size: range.end - range.start,
        }
    }
}

impl<'a> BufferSlice<'a> {
    /// Returns sub-range of the buffer range.
    #[cfg_attr(inline_more, inline)]
    pub fn slice<R>(self, range: R) -> BufferSlice<'a>
    where
        R: BufferIndex,
    {
        let range = range.range(self.size);
        BufferSlice {
            buffer: self.buffer,
            offset: self.offset + range.start,
            size: range.end - range.start,
        }
    }
}

impl<'a> From<&'a Buffer> for BufferSlice<'a> {
    #[cfg_attr(inline_more, inline(always))]
    fn from(buffer: &'a Buffer) -> Self {
        BufferSlice {
            offset: 0,
            size: crate::traits::Buffer::size(buffer),
            buffer,
        }
    }
}

/// Trait for taking slice from the buffer.
pub trait AsBufferSlice {
    fn as_buffer_slice(&self) -> BufferSlice;
}

impl AsBufferSlice for BufferSlice<'_> {
    #[cfg_attr(inline_more, inline(always))]
    fn as_buffer_slice(&self) -> BufferSlice {
        *self
    }
}

impl AsBufferSlice for Buffer {
    #[cfg_attr(inline_more, inline(always))]
    fn as_buffer_slice(&self) -> BufferSlice {
        BufferSlice {
            offset: 0,
            size: crate::traits::Buffer::size(self),
            buffer: self,
        }
    }
}

impl<B> AsBufferSlice for &B
where
    B: AsBufferSlice,
{
    #[cfg_attr(inline_more, inline(always))]
    fn as_buffer_slice(&self) -> BufferSlice {
        (*self).as_buffer_slice()
    }
}
