use mev::{
    AccelerationStructureBuildFlags, AccelerationStructurePerformance, AccelerationStructureSizes,
    BuildMode, PipelineStages, PrimitiveCount,
};

use crate::ProxyError;

use super::{check_rejected, next_generation, GeometryKind, PrimitiveSource};

/// Creation parameters of a [`BottomLevelIndex`].
#[derive(Clone, Copy, Debug)]
pub struct BottomLevelDesc<'a> {
    pub name: &'a str,
    pub kind: GeometryKind,

    /// Capacity of the index. Initial build consumes this many primitives.
    pub primitive_count: u32,

    /// Allows refitting builds.
    pub allow_update: bool,
}

/// Bottom-level acceleration structure with its storage and scratch memory.
pub struct BottomLevelIndex {
    name: String,
    kind: GeometryKind,
    capacity: u32,

    /// Primitive count of the last build if known on the host.
    built_count: Option<u32>,

    flags: AccelerationStructureBuildFlags,
    sizes: AccelerationStructureSizes,
    update_scratch: Option<mev::Buffer>,

    /// Allocated for the creation build and kept for rebuilds.
    build_scratch: mev::Buffer,
    blas: mev::Blas,
    _storage: mev::Buffer,
    generation: u64,
}

impl BottomLevelIndex {
    /// Creates the index and builds it over `source`, blocking until done.
    pub fn create(
        device: &mev::Device,
        queue: &mut mev::Queue,
        desc: BottomLevelDesc,
        source: PrimitiveSource,
    ) -> Result<Self, ProxyError> {
        if source.kind() != desc.kind {
            return Err(ProxyError::GeometryMismatch {
                name: desc.name.to_owned(),
                expected: desc.kind,
                found: source.kind(),
            });
        }
        if source.capacity() < desc.primitive_count {
            return Err(ProxyError::CapacityExceeded {
                name: desc.name.to_owned(),
                count: desc.primitive_count,
                capacity: source.capacity(),
            });
        }

        let flags = if desc.allow_update {
            AccelerationStructureBuildFlags::ALLOW_UPDATE
        } else {
            AccelerationStructureBuildFlags::empty()
        };

        let geometry = source.geometry();
        let sizes = device
            .blas_build_sizes(&geometry, flags, desc.primitive_count)
            .map_err(|source| {
                tracing::error!("Failed to get build sizes for '{}': {source}", desc.name);
                ProxyError::BuildSizes {
                    name: desc.name.to_owned(),
                    source,
                }
            })?;

        tracing::info!(
            "BLAS '{}' of {} {:?}: AS size {}, build scratch {}, update scratch {}",
            desc.name,
            desc.primitive_count,
            desc.kind,
            sizes.size,
            sizes.scratch_size,
            sizes.update_scratch_size,
        );

        let storage = device.new_buffer(mev::BufferDesc {
            size: sizes.size,
            usage: mev::BufferUsage::ACCELERATION_STRUCTURE_STORAGE
                | mev::BufferUsage::DEVICE_ADDRESS,
            memory: mev::Memory::Device,
            name: desc.name,
        })?;

        let update_scratch = if sizes.update_scratch_size > 0 {
            Some(scratch_buffer(device, sizes.update_scratch_size, "blas-update-scratch")?)
        } else {
            None
        };

        let blas = device.new_blas(mev::BlasDesc {
            name: desc.name,
            storage: storage.slice(..),
        })?;

        let build_scratch = scratch_buffer(device, sizes.scratch_size, "blas-build-scratch")?;

        let mut encoder = queue.new_command_encoder()?;
        encoder.acceleration_structure().build_blas(
            &blas,
            mev::BlasBuildDesc {
                performance: AccelerationStructurePerformance::FastTrace,
                flags,
                mode: BuildMode::Build,
                geometry,
                count: PrimitiveCount::Direct(desc.primitive_count),
            },
            &build_scratch,
        );

        let before = queue.validation_errors().len();
        queue.submit([encoder.finish()?])?;
        queue.wait_idle()?;
        check_rejected(queue, before)?;

        Ok(BottomLevelIndex {
            name: desc.name.to_owned(),
            kind: desc.kind,
            capacity: desc.primitive_count,
            built_count: Some(desc.primitive_count),
            flags,
            sizes,
            update_scratch,
            build_scratch,
            blas,
            _storage: storage,
            generation: next_generation(),
        })
    }

    /// Chooses how a build over `count` primitives is recorded.
    ///
    /// A refit is only chosen when the host knows the count is unchanged.
    pub fn select_mode(&self, count: PrimitiveCount) -> BuildMode {
        match count {
            PrimitiveCount::Direct(n) if Some(n) == self.built_count => BuildMode::Update,
            PrimitiveCount::Direct(_) | PrimitiveCount::Indirect(_) => BuildMode::Build,
        }
    }

    /// Records a build or refit over `source`.
    ///
    /// Producers of `source` must be fenced by the caller.
    /// Barriers around the build command itself are recorded here.
    pub fn update(
        &mut self,
        encoder: &mut mev::CommandEncoder,
        count: PrimitiveCount,
        source: PrimitiveSource,
    ) -> Result<BuildMode, ProxyError> {
        if source.kind() != self.kind {
            return Err(ProxyError::GeometryMismatch {
                name: self.name.clone(),
                expected: self.kind,
                found: source.kind(),
            });
        }

        if let PrimitiveCount::Direct(n) = count {
            if n > self.capacity || n > source.capacity() {
                return Err(ProxyError::CapacityExceeded {
                    name: self.name.clone(),
                    count: n,
                    capacity: self.capacity.min(source.capacity()),
                });
            }
        }

        let mode = self.select_mode(count);
        let scratch = match mode {
            BuildMode::Update => match &self.update_scratch {
                Some(scratch) => scratch.clone(),
                None => return Err(ProxyError::UpdateNotAllowed(self.name.clone())),
            },
            BuildMode::Build => self.build_scratch.clone(),
        };

        encoder.barrier(
            PipelineStages::ALL_COMMANDS,
            PipelineStages::ACCELERATION_STRUCTURE_BUILD,
        );
        encoder.acceleration_structure().build_blas(
            &self.blas,
            mev::BlasBuildDesc {
                performance: AccelerationStructurePerformance::FastTrace,
                flags: self.flags,
                mode,
                geometry: source.geometry(),
                count,
            },
            &scratch,
        );
        encoder.barrier(
            PipelineStages::ACCELERATION_STRUCTURE_BUILD,
            PipelineStages::ALL_COMMANDS,
        );

        self.built_count = match count {
            PrimitiveCount::Direct(n) => Some(n),
            PrimitiveCount::Indirect(_) => None,
        };

        tracing::trace!("BLAS '{}' {:?} recorded", self.name, mode);
        Ok(mode)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> GeometryKind {
        self.kind
    }

    /// Maximum primitive count of a build.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn sizes(&self) -> AccelerationStructureSizes {
        self.sizes
    }

    pub fn has_update_scratch(&self) -> bool {
        self.update_scratch.is_some()
    }

    pub fn device_address(&self) -> u64 {
        self.blas.device_address()
    }

    /// Changes every time an index is created, never on updates.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn blas(&self) -> &mev::Blas {
        &self.blas
    }
}

fn scratch_buffer(device: &mev::Device, size: usize, name: &str) -> Result<mev::Buffer, ProxyError> {
    Ok(device.new_buffer(mev::BufferDesc {
        size,
        usage: mev::BufferUsage::STORAGE | mev::BufferUsage::DEVICE_ADDRESS,
        memory: mev::Memory::Device,
        name,
    })?)
}

#[cfg(test)]
mod tests {
    use crate::volume::{grid, BoundingVolume};

    use super::*;

    fn setup() -> (mev::Device, mev::Queue) {
        let (device, mut queues) = mev::Instance::new()
            .create(mev::DeviceDesc::default())
            .unwrap();
        (device, queues.remove(0))
    }

    fn boxes(device: &mev::Device, boxes: &[BoundingVolume]) -> mev::Buffer {
        device
            .new_buffer_init(mev::BufferInitDesc {
                data: bytemuck::cast_slice(boxes),
                usage: mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT | mev::BufferUsage::STORAGE,
                memory: mev::Memory::Device,
                name: "boxes",
            })
            .unwrap()
    }

    fn desc(count: u32, allow_update: bool) -> BottomLevelDesc<'static> {
        BottomLevelDesc {
            name: "test-blas",
            kind: GeometryKind::Aabbs,
            primitive_count: count,
            allow_update,
        }
    }

    #[test]
    fn sizes_and_update_scratch() {
        let (device, mut queue) = setup();
        let buffer = boxes(&device, &grid(8, 4));
        let source = PrimitiveSource::Aabbs(buffer.slice(..));

        let plain = BottomLevelIndex::create(&device, &mut queue, desc(32, false), source).unwrap();
        assert!(!plain.has_update_scratch());
        assert_eq!(plain.sizes().update_scratch_size, 0);

        let updatable =
            BottomLevelIndex::create(&device, &mut queue, desc(32, true), source).unwrap();
        assert!(updatable.has_update_scratch());
        assert!(updatable.sizes().size >= 32 * BoundingVolume::SIZE);
        assert_ne!(plain.generation(), updatable.generation());
        assert_eq!(updatable.blas().primitive_count(), Some(32));
    }

    #[test]
    fn zero_primitives_is_fatal() {
        let (device, mut queue) = setup();
        let buffer = boxes(&device, &grid(1, 1));
        let err = BottomLevelIndex::create(
            &device,
            &mut queue,
            desc(0, true),
            PrimitiveSource::Aabbs(buffer.slice(..)),
        )
        .err()
        .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn mode_selection() {
        let (device, mut queue) = setup();
        let buffer = boxes(&device, &grid(4, 4));
        let source = PrimitiveSource::Aabbs(buffer.slice(..));
        let mut index = BottomLevelIndex::create(&device, &mut queue, desc(16, true), source).unwrap();
        let created_scratch = index.build_scratch.clone();

        let count = device
            .new_buffer_init(mev::BufferInitDesc {
                data: bytemuck::bytes_of(&8u32),
                usage: mev::BufferUsage::STORAGE,
                memory: mev::Memory::Device,
                name: "count",
            })
            .unwrap();

        assert_eq!(index.select_mode(PrimitiveCount::Direct(16)), BuildMode::Update);
        assert_eq!(index.select_mode(PrimitiveCount::Direct(8)), BuildMode::Build);
        assert_eq!(
            index.select_mode(PrimitiveCount::Indirect(count.slice(..))),
            BuildMode::Build
        );

        let mut encoder = queue.new_command_encoder().unwrap();
        let mode = index
            .update(&mut encoder, PrimitiveCount::Direct(8), source)
            .unwrap();
        assert_eq!(mode, BuildMode::Build);
        assert_eq!(index.build_scratch, created_scratch);
        let mode = index
            .update(&mut encoder, PrimitiveCount::Direct(8), source)
            .unwrap();
        assert_eq!(mode, BuildMode::Update);
        index
            .update(&mut encoder, PrimitiveCount::Indirect(count.slice(..)), source)
            .unwrap();

        queue.submit([encoder.finish().unwrap()]).unwrap();
        queue.wait_idle().unwrap();
        assert!(queue.validation_errors().is_empty());
        assert!(queue.hazards().is_empty());
        assert_eq!(index.blas().primitive_count(), Some(8));
    }

    #[test]
    fn policy_violations_are_rejected() {
        let (device, mut queue) = setup();
        let buffer = boxes(&device, &grid(4, 4));
        let source = PrimitiveSource::Aabbs(buffer.slice(..));
        let mut index =
            BottomLevelIndex::create(&device, &mut queue, desc(16, false), source).unwrap();
        let mut encoder = queue.new_command_encoder().unwrap();

        assert!(matches!(
            index.update(&mut encoder, PrimitiveCount::Direct(16), source),
            Err(ProxyError::UpdateNotAllowed(_))
        ));
        assert!(matches!(
            index.update(&mut encoder, PrimitiveCount::Direct(17), source),
            Err(ProxyError::CapacityExceeded { count: 17, .. })
        ));
        assert!(matches!(
            index.update(
                &mut encoder,
                PrimitiveCount::Direct(1),
                PrimitiveSource::Triangles(buffer.slice(..))
            ),
            Err(ProxyError::GeometryMismatch {
                expected: GeometryKind::Aabbs,
                found: GeometryKind::Triangles,
                ..
            })
        ));
    }
}
