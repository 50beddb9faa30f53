use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::generic::{level_extent, Extent2, ImageUsage, PixelFormat};

struct Level {
    extent: Extent2,
    texels: Box<[AtomicU32]>,
}

struct Inner {
    id: u64,
    name: String,
    format: PixelFormat,
    extent: Extent2,
    usage: ImageUsage,
    levels: Vec<Level>,
}

#[derive(Clone)]
pub struct Image {
    inner: Arc<Inner>,
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Image {}

impl Hash for Image {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.inner.name)
            .field("format", &self.inner.format)
            .field("extent", &self.inner.extent)
            .finish()
    }
}

impl Image {
    pub(super) fn new(
        id: u64,
        name: &str,
        format: PixelFormat,
        extent: Extent2,
        levels: u32,
        usage: ImageUsage,
    ) -> Self {
        let components = format.components();
        let levels = (0..levels.max(1))
            .map(|level| {
                let extent = level_extent(extent, level);
                let count = extent.area() as usize * components;
                Level {
                    extent,
                    texels: (0..count).map(|_| AtomicU32::new(0)).collect(),
                }
            })
            .collect();

        Image {
            inner: Arc::new(Inner {
                id,
                name: name.to_owned(),
                format,
                extent,
                usage,
                levels,
            }),
        }
    }

    /// Unique id of the image within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn usage(&self) -> ImageUsage {
        self.inner.usage
    }

    /// Extent of the mip level. Zero for missing levels.
    pub fn level_extent(&self, level: u32) -> Extent2 {
        self.inner
            .levels
            .get(level as usize)
            .map_or(Extent2::ZERO, |l| l.extent)
    }

    pub(super) fn texels(&self, level: u32) -> &[AtomicU32] {
        self.inner
            .levels
            .get(level as usize)
            .map_or(&[][..], |l| &l.texels[..])
    }

    /// Uploads texels of one level from the host.
    ///
    /// `data` is tightly packed rows of texels in the image format.
    /// Extra data is ignored, missing texels keep their values.
    pub fn write_level<T: bytemuck::Pod>(&self, level: u32, data: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let texels = self.texels(level);
        debug_assert_eq!(bytes.len(), texels.len() * 4, "level size mismatch");

        for (texel, chunk) in texels.iter().zip(bytes.chunks_exact(4)) {
            let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            texel.store(value, Ordering::Relaxed);
        }
    }

    /// Reads back texels of one level as raw 32-bit components.
    pub fn read_level(&self, level: u32) -> Vec<u32> {
        self.texels(level)
            .iter()
            .map(|t| t.load(Ordering::Relaxed))
            .collect()
    }
}

#[hidden_trait::expose]
impl crate::traits::Image for Image {
    fn format(&self) -> PixelFormat {
        self.inner.format
    }

    fn extent(&self) -> Extent2 {
        self.inner.extent
    }

    fn levels(&self) -> u32 {
        self.inner.levels.len() as u32
    }
}
