use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use smallvec::SmallVec;

use crate::generic::{Extent2, Invocation, Kernel, PixelFormat};

use super::command::BoundArgument;

struct Inner {
    id: u64,
    name: String,
    kernel: Arc<dyn Kernel>,
    work_group_size: [u32; 3],
}

#[derive(Clone)]
pub struct ComputePipeline {
    inner: Arc<Inner>,
}

impl fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("name", &self.inner.name)
            .field("work_group_size", &self.inner.work_group_size)
            .finish()
    }
}

impl ComputePipeline {
    pub(super) fn new(name: &str, kernel: Arc<dyn Kernel>, work_group_size: [u32; 3]) -> Self {
        debug_assert!(
            work_group_size.iter().all(|&s| s > 0),
            "work group size must be non-zero"
        );

        ComputePipeline {
            inner: Arc::new(Inner {
                id: super::device::next_id(),
                name: name.to_owned(),
                kernel,
                work_group_size: work_group_size.map(|s| s.max(1)),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn work_group_size(&self) -> [u32; 3] {
        self.inner.work_group_size
    }

    /// Runs every invocation of `groups` work groups, one group after another.
    pub(super) fn run(&self, arguments: &[BoundArgument], constants: &[u8], groups: [u32; 3]) {
        let bindings = arguments
            .iter()
            .map(|argument| match argument {
                BoundArgument::Buffer { slice, .. } => {
                    debug_assert_eq!(slice.offset % 4, 0, "buffer binding must be word-aligned");
                    let words = slice.buffer.words();
                    let end = ((slice.offset + slice.size) / 4).min(words.len());
                    let start = (slice.offset / 4).min(end);
                    Binding::Buffer(BufferView {
                        words: &words[start..end],
                    })
                }
                BoundArgument::Image { image, level, .. } => Binding::Image(ImageView {
                    texels: image.texels(*level),
                    extent: image.level_extent(*level),
                    format: crate::traits::Image::format(image),
                }),
            })
            .collect();

        let cx = KernelContext {
            bindings,
            constants,
        };

        let [sx, sy, sz] = self.inner.work_group_size;
        for gz in 0..groups[2] {
            for gy in 0..groups[1] {
                for gx in 0..groups[0] {
                    let mut local_index = 0;
                    for lz in 0..sz {
                        for ly in 0..sy {
                            for lx in 0..sx {
                                let inv = Invocation {
                                    global: [gx * sx + lx, gy * sy + ly, gz * sz + lz],
                                    group: [gx, gy, gz],
                                    local: [lx, ly, lz],
                                    local_index,
                                };
                                self.inner.kernel.invoke(&cx, inv);
                                local_index += 1;
                            }
                        }
                    }
                }
            }
        }
    }
}

enum Binding<'a> {
    Buffer(BufferView<'a>),
    Image(ImageView<'a>),
}

/// Resources and constants visible to a kernel invocation.
pub struct KernelContext<'a> {
    bindings: SmallVec<[Binding<'a>; 8]>,
    constants: &'a [u8],
}

impl<'a> KernelContext<'a> {
    /// Buffer bound at `binding`.
    /// Unbound or mismatched bindings yield an empty view.
    pub fn buffer(&self, binding: usize) -> BufferView<'a> {
        match self.bindings.get(binding) {
            Some(Binding::Buffer(view)) => *view,
            _ => {
                debug_assert!(false, "binding {binding} is not a buffer");
                BufferView { words: &[] }
            }
        }
    }

    /// Image level bound at `binding`.
    /// Unbound or mismatched bindings yield an empty view.
    pub fn image(&self, binding: usize) -> ImageView<'a> {
        match self.bindings.get(binding) {
            Some(Binding::Image(view)) => *view,
            _ => {
                debug_assert!(false, "binding {binding} is not an image");
                ImageView {
                    texels: &[],
                    extent: Extent2::ZERO,
                    format: PixelFormat::R32Float,
                }
            }
        }
    }

    /// Push constants. Missing bytes read as zero.
    pub fn constants<T: bytemuck::Pod>(&self) -> T {
        let size = std::mem::size_of::<T>();
        if self.constants.len() >= size {
            bytemuck::pod_read_unaligned(&self.constants[..size])
        } else {
            let mut value = T::zeroed();
            bytemuck::bytes_of_mut(&mut value)[..self.constants.len()]
                .copy_from_slice(self.constants);
            value
        }
    }
}

/// Word-addressed view of a bound buffer slice.
///
/// Access is robust: out-of-bounds loads return zero
/// and out-of-bounds stores are discarded.
#[derive(Clone, Copy)]
pub struct BufferView<'a> {
    words: &'a [AtomicU32],
}

impl<'a> BufferView<'a> {
    /// Number of 32-bit words in the view.
    pub fn len(&self) -> u32 {
        self.words.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn load(&self, index: u32) -> u32 {
        self.words
            .get(index as usize)
            .map_or(0, |w| w.load(Ordering::Relaxed))
    }

    pub fn store(&self, index: u32, value: u32) {
        if let Some(w) = self.words.get(index as usize) {
            w.store(value, Ordering::Relaxed);
        }
    }

    pub fn load_f32(&self, index: u32) -> f32 {
        f32::from_bits(self.load(index))
    }

    pub fn store_f32(&self, index: u32, value: f32) {
        self.store(index, value.to_bits());
    }

    /// Returns previous value.
    pub fn atomic_add(&self, index: u32, value: u32) -> u32 {
        self.words
            .get(index as usize)
            .map_or(0, |w| w.fetch_add(value, Ordering::AcqRel))
    }

    /// Returns previous value.
    pub fn atomic_max(&self, index: u32, value: u32) -> u32 {
        self.words
            .get(index as usize)
            .map_or(0, |w| w.fetch_max(value, Ordering::AcqRel))
    }

    /// Returns previous value.
    pub fn atomic_min(&self, index: u32, value: u32) -> u32 {
        self.words
            .get(index as usize)
            .map_or(0, |w| w.fetch_min(value, Ordering::AcqRel))
    }

    /// Stores `new` if the word equals `current`.
    /// Returns `Ok` with the previous value on success and `Err` with the actual value otherwise.
    pub fn atomic_compare_exchange(&self, index: u32, current: u32, new: u32) -> Result<u32, u32> {
        match self.words.get(index as usize) {
            Some(w) => w.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire),
            None => Err(0),
        }
    }

    /// Reads element `index` of an array of `T`.
    /// `T` must be a whole number of words.
    pub fn read<T: bytemuck::Pod>(&self, index: u32) -> T {
        let words = std::mem::size_of::<T>() / 4;
        debug_assert_eq!(std::mem::size_of::<T>() % 4, 0);

        let mut value = T::zeroed();
        let start = index as usize * words;
        if start + words > self.words.len() {
            return value;
        }

        let bytes = bytemuck::bytes_of_mut(&mut value);
        for (chunk, word) in bytes
            .chunks_exact_mut(4)
            .zip(&self.words[start..start + words])
        {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        value
    }

    /// Writes element `index` of an array of `T`.
    /// `T` must be a whole number of words.
    pub fn write<T: bytemuck::Pod>(&self, index: u32, value: &T) {
        let words = std::mem::size_of::<T>() / 4;
        debug_assert_eq!(std::mem::size_of::<T>() % 4, 0);

        let start = index as usize * words;
        if start + words > self.words.len() {
            return;
        }

        for (chunk, word) in bytemuck::bytes_of(value)
            .chunks_exact(4)
            .zip(&self.words[start..start + words])
        {
            word.store(
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                Ordering::Relaxed,
            );
        }
    }

    /// Number of whole `T` elements in the view.
    pub fn count<T>(&self) -> u32 {
        (self.words.len() * 4 / std::mem::size_of::<T>().max(1)) as u32
    }
}

/// View of one level of a bound image.
/// Out-of-bounds loads return zero.
#[derive(Clone, Copy)]
pub struct ImageView<'a> {
    texels: &'a [AtomicU32],
    extent: Extent2,
    format: PixelFormat,
}

impl ImageView<'_> {
    pub fn extent(&self) -> Extent2 {
        self.extent
    }

    fn component(&self, x: u32, y: u32, c: usize) -> u32 {
        if x >= self.extent.width() || y >= self.extent.height() {
            return 0;
        }
        let components = self.format.components();
        let idx = (y as usize * self.extent.width() as usize + x as usize) * components + c;
        self.texels
            .get(idx)
            .map_or(0, |t| t.load(Ordering::Relaxed))
    }

    /// Loads a texel as floats. Missing components read as `0, 0, 0, 1`.
    pub fn load(&self, x: u32, y: u32) -> [f32; 4] {
        let mut texel = [0.0, 0.0, 0.0, 1.0];
        for (c, value) in texel
            .iter_mut()
            .enumerate()
            .take(self.format.components())
        {
            let bits = self.component(x, y, c);
            *value = if self.format.is_integer() {
                bits as f32
            } else {
                f32::from_bits(bits)
            };
        }
        texel
    }

    /// Loads first component of a texel as raw bits.
    pub fn load_u32(&self, x: u32, y: u32) -> u32 {
        self.component(x, y, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> Vec<AtomicU32> {
        (0..n).map(|_| AtomicU32::new(0)).collect()
    }

    #[test]
    fn robust_access() {
        let storage = words(4);
        let view = BufferView { words: &storage };

        view.store(3, 7);
        view.store(4, 9);
        assert_eq!(view.load(3), 7);
        assert_eq!(view.load(4), 0);
        assert_eq!(view.atomic_add(10, 1), 0);

        view.write(0, &[1.0f32, 2.0]);
        assert_eq!(view.read::<[f32; 2]>(0), [1.0, 2.0]);
        assert_eq!(view.read::<[f32; 3]>(1), [0.0; 3]);
    }

    #[test]
    fn compare_exchange_claims_once() {
        let storage = words(1);
        let view = BufferView { words: &storage };
        view.store(0, u32::MAX);

        assert_eq!(view.atomic_compare_exchange(0, u32::MAX, 5), Ok(u32::MAX));
        assert_eq!(view.atomic_compare_exchange(0, u32::MAX, 6), Err(5));
        assert_eq!(view.load(0), 5);
    }
}
