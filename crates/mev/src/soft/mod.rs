//! Headless backend.
//!
//! Executes everything on the host at submission retirement.
//! Useful for tests and tools that must run without a GPU.

mod acst;
mod buffer;
mod bvh;
mod command;
mod compute;
mod device;
mod image;
mod queue;

use std::fmt;

use crate::generic::{
    Capabilities, CreateError, DeviceCapabilities, DeviceDesc, FamilyCapabilities, Limits,
    QueueFlags,
};

pub use self::{
    acst::{Blas, HitKind, RayHit, Tlas},
    buffer::Buffer,
    command::{
        AccelerationStructureCommandEncoder, CommandBuffer, CommandEncoder,
        ComputeCommandEncoder, CopyCommandEncoder,
    },
    compute::{BufferView, ComputePipeline, ImageView, KernelContext},
    device::Device,
    image::Image,
    queue::{Hazard, HazardKind, Queue},
};

const DEVICE_NAME: &str = "soft";

#[derive(Debug)]
pub(crate) enum CreateErrorKind {
    NoDevice(usize),
    NoFamily(u32),
    TooManyQueues { family: u32, count: usize },
}

impl fmt::Display for CreateErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateErrorKind::NoDevice(idx) => write!(f, "device #{idx} does not exist"),
            CreateErrorKind::NoFamily(family) => {
                write!(f, "queue family #{family} does not exist")
            }
            CreateErrorKind::TooManyQueues { family, count } => {
                write!(f, "{count} queues requested from family #{family}")
            }
        }
    }
}

/// Entry point of the backend.
/// Reports a single device with a single universal queue family.
#[derive(Debug)]
pub struct Instance {
    capabilities: Capabilities,
}

impl Default for Instance {
    fn default() -> Self {
        Instance::new()
    }
}

impl Instance {
    pub fn new() -> Self {
        Instance {
            capabilities: Capabilities {
                devices: vec![DeviceCapabilities {
                    name: DEVICE_NAME.to_owned(),
                    limits: Limits::default(),
                    families: vec![FamilyCapabilities {
                        queue_flags: QueueFlags::COMPUTE
                            | QueueFlags::TRANSFER
                            | QueueFlags::ACCELERATION_STRUCTURE,
                        queue_count: 4,
                    }],
                }],
            },
        }
    }
}

#[hidden_trait::expose]
impl crate::traits::Instance for Instance {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn create(&self, info: DeviceDesc) -> Result<(Device, Vec<Queue>), CreateError> {
        let Some(caps) = self.capabilities.devices.get(info.idx) else {
            return Err(CreateError(CreateErrorKind::NoDevice(info.idx)));
        };

        for &family in info.queues {
            let Some(family_caps) = caps.families.get(family as usize) else {
                return Err(CreateError(CreateErrorKind::NoFamily(family)));
            };
            let count = info.queues.iter().filter(|&&f| f == family).count();
            if count > family_caps.queue_count {
                return Err(CreateError(CreateErrorKind::TooManyQueues { family, count }));
            }
        }

        let limits = match info.limits {
            None => caps.limits,
            Some(limits) => Limits {
                max_primitive_count: limits.max_primitive_count.min(caps.limits.max_primitive_count),
                max_instance_count: limits.max_instance_count.min(caps.limits.max_instance_count),
                memory: limits.memory.min(caps.limits.memory),
            },
        };

        tracing::debug!("Creating device '{}' with {:?}", caps.name, limits);

        let device = Device::new(&caps.name, limits);
        let queues = info
            .queues
            .iter()
            .map(|&family| Queue::new(device.clone(), family, info.latency))
            .collect();

        Ok((device, queues))
    }
}
