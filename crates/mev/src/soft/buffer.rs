use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::generic::{BufferUsage, Memory};

use super::device::WeakDevice;

struct Inner {
    owner: WeakDevice,
    idx: usize,
    id: u64,
    name: String,
    size: usize,
    usage: BufferUsage,
    memory: Memory,
    address: u64,
    words: Box<[AtomicU32]>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(device) = self.owner.upgrade() {
            device.free(self.idx, self.size);
        }
    }
}

/// Buffer in host memory with word-granular atomic access.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<Inner>,
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Buffer {}

impl Hash for Buffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.inner.name)
            .field("size", &self.inner.size)
            .finish()
    }
}

impl Buffer {
    pub(super) fn new(
        owner: WeakDevice,
        idx: usize,
        id: u64,
        name: &str,
        size: usize,
        usage: BufferUsage,
        memory: Memory,
        address: u64,
    ) -> Self {
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Buffer {
            inner: Arc::new(Inner {
                owner,
                idx,
                id,
                name: name.to_owned(),
                size,
                usage,
                memory,
                address,
                words,
            }),
        }
    }

    /// Unique id of the buffer within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    pub fn memory(&self) -> Memory {
        self.inner.memory
    }

    pub(super) fn words(&self) -> &[AtomicU32] {
        &self.inner.words
    }

    /// Reads bytes directly.
    ///
    /// Every memory type is host-visible on the software device,
    /// but only completed work is guaranteed to be observed.
    pub fn read_bytes(&self, offset: usize, size: usize) -> Vec<u8> {
        let end = (offset + size).min(self.inner.size);
        let words = &self.inner.words;
        (offset.min(end)..end)
            .map(|i| (words[i / 4].load(Ordering::Relaxed) >> ((i % 4) * 8)) as u8)
            .collect()
    }

    /// Reads `count` elements of `T` starting at byte `offset`.
    pub fn read_pod<T: bytemuck::Pod>(&self, offset: usize, count: usize) -> Vec<T> {
        let size = std::mem::size_of::<T>();
        let bytes = self.read_bytes(offset, size * count);
        bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    pub(super) fn write_bytes(&self, offset: usize, data: &[u8]) {
        let end = (offset + data.len()).min(self.inner.size);
        if end <= offset {
            return;
        }
        let data = &data[..end - offset];
        let words = &self.inner.words;

        if offset % 4 == 0 && data.len() % 4 == 0 {
            for (i, chunk) in data.chunks_exact(4).enumerate() {
                let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                words[offset / 4 + i].store(value, Ordering::Relaxed);
            }
            return;
        }

        for (i, &byte) in data.iter().enumerate() {
            let at = offset + i;
            let shift = (at % 4) * 8;
            let mask = !(0xFFu32 << shift);
            let _ = words[at / 4].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
                Some((w & mask) | ((byte as u32) << shift))
            });
        }
    }

    pub(super) fn fill_words(&self, offset: usize, size: usize, value: u32) {
        debug_assert_eq!(offset % 4, 0, "fill offset must be word-aligned");
        let end = (offset + size).min(self.inner.size) / 4;
        for word in &self.inner.words[(offset / 4).min(end)..end] {
            word.store(value, Ordering::Relaxed);
        }
    }
}

#[hidden_trait::expose]
impl crate::traits::Buffer for Buffer {
    #[cfg_attr(inline_more, inline(always))]
    fn size(&self) -> usize {
        self.inner.size
    }

    #[cfg_attr(inline_more, inline(always))]
    fn device_address(&self) -> u64 {
        self.inner.address
    }
}
