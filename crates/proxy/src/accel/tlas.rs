use mev::{AccelerationStructureBuildFlags, BuildMode, PipelineStages, TlasInstance};

use crate::ProxyError;

use super::{check_rejected, BottomLevelIndex};

/// Top-level acceleration structure over a fixed set of bottom-level indices.
///
/// Instances refer to bottom-level indices by device address.
/// Each instance remembers the generation of the index it was resolved from,
/// so a recreated bottom-level index is detected instead of traced through.
pub struct TopLevelIndex {
    name: String,
    tlas: mev::Tlas,
    instances: mev::Buffer,
    scratch: mev::Buffer,
    flags: AccelerationStructureBuildFlags,
    resolved: Vec<(u64, u64)>,
    _storage: mev::Buffer,
}

impl TopLevelIndex {
    /// Creates the index with one identity instance per bottom-level index
    /// and builds it, blocking until done.
    pub fn create(
        device: &mev::Device,
        queue: &mut mev::Queue,
        name: &str,
        blases: &[&BottomLevelIndex],
    ) -> Result<Self, ProxyError> {
        let count = blases.len() as u32;
        let flags = AccelerationStructureBuildFlags::ALLOW_UPDATE;

        let sizes = device.tlas_build_sizes(flags, count).map_err(|source| {
            tracing::error!("Failed to get build sizes for '{name}': {source}");
            ProxyError::BuildSizes {
                name: name.to_owned(),
                source,
            }
        })?;

        tracing::info!(
            "TLAS '{name}' of {count} instances: AS size {}, build scratch {}, update scratch {}",
            sizes.size,
            sizes.scratch_size,
            sizes.update_scratch_size,
        );

        let records: Vec<TlasInstance> = blases
            .iter()
            .enumerate()
            .map(|(idx, blas)| {
                TlasInstance::new(TlasInstance::IDENTITY, idx as u32, 0xFF, blas.device_address())
            })
            .collect();

        let instances = device.new_buffer_init(mev::BufferInitDesc {
            data: bytemuck::cast_slice(&records),
            usage: mev::BufferUsage::ACCELERATION_STRUCTURE_INPUT
                | mev::BufferUsage::DEVICE_ADDRESS,
            memory: mev::Memory::Device,
            name: "tlas-instances",
        })?;

        let storage = device.new_buffer(mev::BufferDesc {
            size: sizes.size,
            usage: mev::BufferUsage::ACCELERATION_STRUCTURE_STORAGE
                | mev::BufferUsage::DEVICE_ADDRESS,
            memory: mev::Memory::Device,
            name,
        })?;

        let scratch = device.new_buffer(mev::BufferDesc {
            size: sizes.scratch_size.max(sizes.update_scratch_size),
            usage: mev::BufferUsage::STORAGE | mev::BufferUsage::DEVICE_ADDRESS,
            memory: mev::Memory::Device,
            name: "tlas-scratch",
        })?;

        let tlas = device.new_tlas(mev::TlasDesc {
            name,
            storage: storage.slice(..),
        })?;

        let mut index = TopLevelIndex {
            name: name.to_owned(),
            tlas,
            instances,
            scratch,
            flags,
            resolved: blases
                .iter()
                .map(|blas| (blas.device_address(), blas.generation()))
                .collect(),
            _storage: storage,
        };

        let mut encoder = queue.new_command_encoder()?;
        index.record_build(&mut encoder);

        let before = queue.validation_errors().len();
        queue.submit([encoder.finish()?])?;
        queue.wait_idle()?;
        check_rejected(queue, before)?;

        Ok(index)
    }

    /// Records a rebuild over current contents of the bottom-level indices.
    ///
    /// `blases` must be the same indices, in the same order, the index was created with.
    pub fn update(
        &mut self,
        encoder: &mut mev::CommandEncoder,
        blases: &[&BottomLevelIndex],
    ) -> Result<(), ProxyError> {
        if blases.len() != self.resolved.len() {
            return Err(ProxyError::StaleInstance {
                name: self.name.clone(),
                instance: blases.len().min(self.resolved.len()),
            });
        }

        for (instance, (blas, resolved)) in blases.iter().zip(&self.resolved).enumerate() {
            if (blas.device_address(), blas.generation()) != *resolved {
                return Err(ProxyError::StaleInstance {
                    name: self.name.clone(),
                    instance,
                });
            }
        }

        encoder.barrier(
            PipelineStages::ALL_COMMANDS,
            PipelineStages::ACCELERATION_STRUCTURE_BUILD,
        );
        self.record_build(encoder);
        encoder.barrier(
            PipelineStages::ACCELERATION_STRUCTURE_BUILD,
            PipelineStages::ALL_COMMANDS,
        );
        Ok(())
    }

    fn record_build(&mut self, encoder: &mut mev::CommandEncoder) {
        encoder.acceleration_structure().build_tlas(
            &self.tlas,
            mev::TlasBuildDesc {
                flags: self.flags,
                mode: BuildMode::Build,
                instances: self.instances.slice(..),
                count: self.resolved.len() as u32,
            },
            &self.scratch,
        );
    }

    pub fn tlas(&self) -> &mev::Tlas {
        &self.tlas
    }

    pub fn instance_count(&self) -> u32 {
        self.resolved.len() as u32
    }
}
