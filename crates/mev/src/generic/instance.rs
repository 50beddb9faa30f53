use std::fmt;

use super::queue::QueueFlags;

#[derive(Debug)]
pub struct CreateError(pub(crate) crate::backend::CreateErrorKind);

impl fmt::Display for CreateError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for CreateError {}

/// Capabilities of a queue family of specific device.
#[derive(Clone, Debug)]
pub struct FamilyCapabilities {
    /// Flags that describe the capabilities of the queue family.
    pub queue_flags: QueueFlags,

    /// Number of queues that can be created in the queue family.
    pub queue_count: usize,
}

/// Capabilities of the specific device.
#[derive(Clone, Debug)]
pub struct DeviceCapabilities {
    /// Name of the device.
    pub name: String,

    /// Device limits.
    pub limits: Limits,

    /// List of queue families capabilities.
    pub families: Vec<FamilyCapabilities>,
}

/// Capabilities of the devices.
#[derive(Clone, Debug)]
pub struct Capabilities {
    pub devices: Vec<DeviceCapabilities>,
}

/// Device limits relevant to acceleration structures and memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of primitives in a single bottom-level acceleration structure.
    pub max_primitive_count: u32,

    /// Maximum number of instances in a top-level acceleration structure.
    pub max_instance_count: u32,

    /// Total amount of memory the device may allocate.
    pub memory: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_primitive_count: 1 << 24,
            max_instance_count: 1 << 24,
            memory: 4 << 30,
        }
    }
}

/// Specifies how the device should be created.
pub struct DeviceDesc<'a> {
    /// Index of the device.
    pub idx: usize,

    /// List of families to request queues from.
    pub queues: &'a [u32],

    /// Overrides device limits.
    /// Limits may only be lowered.
    pub limits: Option<Limits>,

    /// Number of submissions a queue may keep in flight
    /// before the oldest one is forced to complete.
    pub latency: u32,
}

impl Default for DeviceDesc<'_> {
    fn default() -> Self {
        DeviceDesc {
            idx: 0,
            queues: &[0],
            limits: None,
            latency: 0,
        }
    }
}
