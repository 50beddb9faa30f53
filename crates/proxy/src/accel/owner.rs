use mev::{BuildMode, PrimitiveCount};

use crate::{
    volume::{grid, initial_grid, PARK_DISTANCE},
    ProxyError,
};

use super::{
    BottomLevelDesc, BottomLevelIndex, GeometryKind, PrimitiveSource, TopLevelIndex,
    TRIANGLE_VERTEX_SIZE,
};

struct Structures {
    // Declared first to be dropped before the bottom-level index it refers to.
    top: TopLevelIndex,
    bottom: BottomLevelIndex,
}

impl Structures {
    fn update(
        &mut self,
        encoder: &mut mev::CommandEncoder,
        count: PrimitiveCount,
        source: PrimitiveSource,
    ) -> Result<BuildMode, ProxyError> {
        let mode = self.bottom.update(encoder, count, source)?;
        self.top.update(encoder, &[&self.bottom])?;
        Ok(mode)
    }
}

/// Acceleration structures over one box per depth texel.
///
/// Created per resolution. Recreating always replaces both levels.
pub struct DepthAs {
    structures: Option<Structures>,
    extent: mev::Extent2,
}

impl Default for DepthAs {
    fn default() -> Self {
        DepthAs::new()
    }
}

impl DepthAs {
    pub fn new() -> Self {
        DepthAs {
            structures: None,
            extent: mev::Extent2::ZERO,
        }
    }

    /// Creates structures for `extent` texels, replacing existing ones.
    pub fn create(
        &mut self,
        device: &mev::Device,
        queue: &mut mev::Queue,
        extent: mev::Extent2,
    ) -> Result<(), ProxyError> {
        self.close();

        let count = extent.area();
        let boxes = initial_grid(extent.width(), extent.height());
        let buffer = device.new_buffer_init(mev::BufferInitDesc {
            data: bytemuck::cast_slice(&boxes),
            usage: mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: mev::Memory::Upload,
            name: "depth-initial-boxes",
        })?;

        let bottom = BottomLevelIndex::create(
            device,
            queue,
            BottomLevelDesc {
                name: "depth-blas",
                kind: GeometryKind::Aabbs,
                primitive_count: count,
                allow_update: true,
            },
            PrimitiveSource::Aabbs(buffer.slice(..)),
        )?;
        let top = TopLevelIndex::create(device, queue, "depth-tlas", &[&bottom])?;

        self.structures = Some(Structures { top, bottom });
        self.extent = extent;
        Ok(())
    }

    /// Creates structures unless they exist for `extent` already.
    /// Returns `true` if they were (re)created.
    pub fn ensure(
        &mut self,
        device: &mev::Device,
        queue: &mut mev::Queue,
        extent: mev::Extent2,
    ) -> Result<bool, ProxyError> {
        if self.is_created() && self.extent == extent {
            return Ok(false);
        }
        tracing::debug!("Creating depth acceleration structures for {extent:?}");
        self.create(device, queue, extent)?;
        Ok(true)
    }

    /// Releases both levels, top first.
    pub fn close(&mut self) {
        if let Some(Structures { top, bottom }) = self.structures.take() {
            drop(top);
            drop(bottom);
        }
    }

    pub fn is_created(&self) -> bool {
        self.structures.is_some()
    }

    /// Texel extent the structures were created for.
    pub fn extent(&self) -> mev::Extent2 {
        self.extent
    }

    /// Records a bottom-level build or refit over `aabbs` followed by a top-level rebuild.
    pub fn update(
        &mut self,
        encoder: &mut mev::CommandEncoder,
        count: PrimitiveCount,
        aabbs: mev::BufferSlice,
    ) -> Result<BuildMode, ProxyError> {
        let structures = self
            .structures
            .as_mut()
            .ok_or(ProxyError::NotCreated("depth"))?;
        structures.update(encoder, count, PrimitiveSource::Aabbs(aabbs))
    }

    /// Uploads a regular grid of `width * height` boxes and refits over it, blocking until done.
    pub fn debug_update(
        &mut self,
        device: &mev::Device,
        queue: &mut mev::Queue,
        width: u32,
        height: u32,
    ) -> Result<BuildMode, ProxyError> {
        let boxes = grid(width, height);
        let buffer = device.new_buffer_init(mev::BufferInitDesc {
            data: bytemuck::cast_slice(&boxes),
            usage: mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: mev::Memory::Upload,
            name: "depth-debug-boxes",
        })?;

        let mut encoder = queue.new_command_encoder()?;
        let mode = self.update(
            &mut encoder,
            PrimitiveCount::Direct(width * height),
            buffer.slice(..),
        )?;
        queue.submit([encoder.finish()?])?;
        queue.wait_idle()?;
        Ok(mode)
    }

    pub fn tlas(&self) -> Option<&mev::Tlas> {
        self.structures.as_ref().map(|s| s.top.tlas())
    }

    pub fn top(&self) -> Option<&TopLevelIndex> {
        self.structures.as_ref().map(|s| &s.top)
    }

    pub fn blas(&self) -> Option<&BottomLevelIndex> {
        self.structures.as_ref().map(|s| &s.bottom)
    }
}

/// Acceleration structures over explicit triangles of visible scene geometry.
#[derive(Default)]
pub struct TriangleAs {
    structures: Option<Structures>,
}

impl TriangleAs {
    pub fn new() -> Self {
        TriangleAs::default()
    }

    /// Creates structures for up to `max_triangles` triangles, replacing existing ones.
    /// Every slot starts as a degenerate triangle parked out of view.
    pub fn create(
        &mut self,
        device: &mev::Device,
        queue: &mut mev::Queue,
        max_triangles: u32,
    ) -> Result<(), ProxyError> {
        self.close();

        let parked = [0.0, 0.0, PARK_DISTANCE];
        let vertices = vec![parked; max_triangles as usize * 3];
        debug_assert_eq!(std::mem::size_of_val(&parked), TRIANGLE_VERTEX_SIZE);

        let buffer = device.new_buffer_init(mev::BufferInitDesc {
            data: bytemuck::cast_slice(&vertices),
            usage: mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: mev::Memory::Upload,
            name: "triangle-initial-vertices",
        })?;

        let bottom = BottomLevelIndex::create(
            device,
            queue,
            BottomLevelDesc {
                name: "triangle-blas",
                kind: GeometryKind::Triangles,
                primitive_count: max_triangles,
                allow_update: true,
            },
            PrimitiveSource::Triangles(buffer.slice(..)),
        )?;
        let top = TopLevelIndex::create(device, queue, "triangle-tlas", &[&bottom])?;

        self.structures = Some(Structures { top, bottom });
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(Structures { top, bottom }) = self.structures.take() {
            drop(top);
            drop(bottom);
        }
    }

    pub fn is_created(&self) -> bool {
        self.structures.is_some()
    }

    /// Triangle capacity. Zero when closed.
    pub fn capacity(&self) -> u32 {
        self.structures
            .as_ref()
            .map_or(0, |s| s.bottom.capacity())
    }

    /// Records a bottom-level build over `vertices` followed by a top-level rebuild.
    pub fn update(
        &mut self,
        encoder: &mut mev::CommandEncoder,
        count: PrimitiveCount,
        vertices: mev::BufferSlice,
    ) -> Result<BuildMode, ProxyError> {
        let structures = self
            .structures
            .as_mut()
            .ok_or(ProxyError::NotCreated("triangles"))?;
        structures.update(encoder, count, PrimitiveSource::Triangles(vertices))
    }

    pub fn tlas(&self) -> Option<&mev::Tlas> {
        self.structures.as_ref().map(|s| s.top.tlas())
    }

    pub fn top(&self) -> Option<&TopLevelIndex> {
        self.structures.as_ref().map(|s| &s.top)
    }

    pub fn blas(&self) -> Option<&BottomLevelIndex> {
        self.structures.as_ref().map(|s| &s.bottom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (mev::Device, mev::Queue) {
        let (device, mut queues) = mev::Instance::new()
            .create(mev::DeviceDesc::default())
            .unwrap();
        (device, queues.remove(0))
    }

    #[test]
    fn first_build_has_volume() {
        let (device, mut queue) = setup();
        let mut depth = DepthAs::new();
        depth
            .create(&device, &mut queue, mev::Extent2::new(4, 4))
            .unwrap();

        let (min, max) = depth.blas().unwrap().blas().bounds().unwrap();
        assert!(max[2] - min[2] > 1000.0);
        assert_eq!(depth.blas().unwrap().capacity(), 16);
        assert_eq!(depth.top().unwrap().instance_count(), 1);
    }

    #[test]
    fn closed_owner_rejects_updates() {
        let (device, mut queue) = setup();
        let mut depth = DepthAs::new();
        depth
            .create(&device, &mut queue, mev::Extent2::new(2, 2))
            .unwrap();
        depth.close();
        assert!(!depth.is_created());
        assert!(depth.tlas().is_none());

        let err = depth.debug_update(&device, &mut queue, 2, 2).err().unwrap();
        assert!(matches!(err, ProxyError::NotCreated("depth")));
    }

    #[test]
    fn resize_recreates_both_levels() {
        let (device, mut queue) = setup();
        let mut depth = DepthAs::new();
        assert!(depth
            .ensure(&device, &mut queue, mev::Extent2::new(4, 2))
            .unwrap());
        let generation = depth.blas().unwrap().generation();

        assert!(!depth
            .ensure(&device, &mut queue, mev::Extent2::new(4, 2))
            .unwrap());
        assert!(depth
            .ensure(&device, &mut queue, mev::Extent2::new(8, 4))
            .unwrap());
        assert_ne!(depth.blas().unwrap().generation(), generation);
        assert_eq!(depth.extent(), mev::Extent2::new(8, 4));

        assert_eq!(
            depth.debug_update(&device, &mut queue, 8, 4).unwrap(),
            BuildMode::Update
        );
        assert!(queue.validation_errors().is_empty());
    }

    #[test]
    fn triangles_start_parked() {
        let (device, mut queue) = setup();
        let mut triangles = TriangleAs::new();
        triangles.create(&device, &mut queue, 64).unwrap();
        assert_eq!(triangles.capacity(), 64);

        let tlas = triangles.tlas().unwrap();
        assert!(tlas
            .intersect([0.0; 3], [0.0, 0.0, -1.0], 0.0, f32::INFINITY)
            .is_none());
    }
}
