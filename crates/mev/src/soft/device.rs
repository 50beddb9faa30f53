use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use slab::Slab;

use crate::generic::{
    AccelerationStructureBuildFlags, AccelerationStructureSizes, BlasDesc, BlasGeometryDesc,
    BufferDesc, BufferInitDesc, BufferUsage, BuildSizesError, ComputePipelineDesc, ImageDesc,
    Limits, OutOfMemory, TlasDesc,
};

use super::{
    acst::{blas_sizes, tlas_sizes, BlasInner},
    Blas, Buffer, ComputePipeline, Image, Tlas,
};

/// Device addresses start away from zero so that zero stays invalid.
const ADDRESS_BASE: u64 = 0x0001_0000_0000;
const ADDRESS_ALIGNMENT: u64 = 256;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for buffers, images, pipelines and acceleration structures.
pub(super) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(super) struct DeviceInner {
    name: String,
    limits: Limits,
    allocations: Mutex<Slab<usize>>,
    allocated: AtomicUsize,
    next_address: AtomicU64,
    blases: Mutex<HashMap<u64, Weak<BlasInner>>>,
}

pub(super) type WeakDevice = Weak<DeviceInner>;

impl DeviceInner {
    fn allocate(&self, size: usize) -> Result<usize, OutOfMemory> {
        let mut allocations = self.allocations.lock();
        let allocated = self.allocated.load(Ordering::Relaxed);
        if allocated + size > self.limits.memory {
            tracing::error!(
                "Device '{}' cannot allocate {} bytes, {} of {} bytes in use",
                self.name,
                size,
                allocated,
                self.limits.memory
            );
            return Err(OutOfMemory);
        }
        self.allocated.store(allocated + size, Ordering::Relaxed);
        Ok(allocations.insert(size))
    }

    pub(super) fn free(&self, idx: usize, size: usize) {
        let mut allocations = self.allocations.lock();
        if allocations.try_remove(idx).is_some() {
            self.allocated.fetch_sub(size, Ordering::Relaxed);
        }
    }

    fn new_address(&self, size: usize) -> u64 {
        let span = (size as u64).div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT + ADDRESS_ALIGNMENT;
        self.next_address.fetch_add(span, Ordering::Relaxed)
    }

    pub(super) fn register_blas(&self, address: u64, blas: Weak<BlasInner>) {
        self.blases.lock().insert(address, blas);
    }

    pub(super) fn resolve_blas(&self, address: u64) -> Option<Arc<BlasInner>> {
        self.blases.lock().get(&address).and_then(Weak::upgrade)
    }

    pub(super) fn forget_blas(&self, address: u64) {
        let mut blases = self.blases.lock();
        if let Some(weak) = blases.get(&address) {
            if weak.strong_count() == 0 {
                blases.remove(&address);
            }
        }
    }

    pub(super) fn limits(&self) -> &Limits {
        &self.limits
    }
}

#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Device {
    pub(super) fn new(name: &str, limits: Limits) -> Self {
        Device {
            inner: Arc::new(DeviceInner {
                name: name.to_owned(),
                limits,
                allocations: Mutex::new(Slab::new()),
                allocated: AtomicUsize::new(0),
                next_address: AtomicU64::new(ADDRESS_BASE),
                blases: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(super) fn inner(&self) -> &Arc<DeviceInner> {
        &self.inner
    }

    pub(super) fn weak(&self) -> WeakDevice {
        Arc::downgrade(&self.inner)
    }

    pub fn limits(&self) -> &Limits {
        &self.inner.limits
    }

    /// Bytes currently allocated for buffers.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

#[hidden_trait::expose]
impl crate::traits::Device for Device {
    fn new_compute_pipeline(
        &self,
        desc: ComputePipelineDesc,
    ) -> Result<ComputePipeline, OutOfMemory> {
        Ok(ComputePipeline::new(
            desc.name,
            desc.kernel,
            desc.work_group_size,
        ))
    }

    fn new_buffer(&self, desc: BufferDesc) -> Result<Buffer, OutOfMemory> {
        let idx = self.inner.allocate(desc.size)?;
        let address = if desc.usage.contains(BufferUsage::DEVICE_ADDRESS) {
            self.inner.new_address(desc.size)
        } else {
            0
        };

        tracing::trace!(
            "Buffer '{}' of {} bytes allocated at {:#x}",
            desc.name,
            desc.size,
            address
        );

        Ok(Buffer::new(
            self.weak(),
            idx,
            next_id(),
            desc.name,
            desc.size,
            desc.usage,
            desc.memory,
            address,
        ))
    }

    fn new_buffer_init(&self, desc: BufferInitDesc) -> Result<Buffer, OutOfMemory> {
        let buffer = self.new_buffer(BufferDesc {
            size: desc.data.len(),
            usage: desc.usage,
            memory: desc.memory,
            name: desc.name,
        })?;
        buffer.write_bytes(0, desc.data);
        Ok(buffer)
    }

    fn new_image(&self, desc: ImageDesc) -> Result<Image, OutOfMemory> {
        Ok(Image::new(
            next_id(),
            desc.name,
            desc.format,
            desc.extent,
            desc.levels,
            desc.usage,
        ))
    }

    fn blas_build_sizes(
        &self,
        geometry: &BlasGeometryDesc,
        flags: AccelerationStructureBuildFlags,
        primitive_count: u32,
    ) -> Result<AccelerationStructureSizes, BuildSizesError> {
        blas_sizes(&self.inner.limits, geometry, flags, primitive_count)
    }

    fn tlas_build_sizes(
        &self,
        flags: AccelerationStructureBuildFlags,
        instance_count: u32,
    ) -> Result<AccelerationStructureSizes, BuildSizesError> {
        tlas_sizes(&self.inner.limits, flags, instance_count)
    }

    fn new_blas(&self, desc: BlasDesc) -> Result<Blas, OutOfMemory> {
        Ok(Blas::new(self, desc))
    }

    fn new_tlas(&self, desc: TlasDesc) -> Result<Tlas, OutOfMemory> {
        Ok(Tlas::new(self, desc))
    }
}
