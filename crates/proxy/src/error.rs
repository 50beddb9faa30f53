//! Error type shared by every component of the crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::accel::GeometryKind;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Device cannot size acceleration structure '{name}'")]
    BuildSizes {
        name: String,

        #[source]
        source: mev::BuildSizesError,
    },

    #[error(transparent)]
    OutOfMemory(#[from] mev::OutOfMemory),

    #[error("Device failure")]
    Device(#[from] mev::DeviceError),

    #[error("Device rejected a creation build")]
    Rejected(#[source] mev::ValidationError),

    #[error("Acceleration structure '{0}' is not created")]
    NotCreated(&'static str),

    #[error("'{name}' is built over {expected:?}, got {found:?}")]
    GeometryMismatch {
        name: String,
        expected: GeometryKind,
        found: GeometryKind,
    },

    #[error("'{name}' holds up to {capacity} primitives, {count} requested")]
    CapacityExceeded {
        name: String,
        count: u32,
        capacity: u32,
    },

    #[error("'{0}' was created without update support")]
    UpdateNotAllowed(String),

    #[error("Instance {instance} of '{name}' refers to a bottom-level index that was recreated")]
    StaleInstance { name: String, instance: usize },

    #[error("'{name}' expects {expected:?} input extent, got {found:?}")]
    ExtentMismatch {
        name: &'static str,
        expected: mev::Extent2,
        found: mev::Extent2,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration")]
    Config(#[from] toml::de::Error),

    #[error("Failed to read configuration file {path}")]
    ConfigIo {
        path: PathBuf,

        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    /// Returns `true` for failures the subsystem cannot run without recovering from,
    /// i.e. it has no acceleration structure to work with.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::BuildSizes { .. }
                | ProxyError::OutOfMemory(_)
                | ProxyError::Device(_)
                | ProxyError::Rejected(_)
        )
    }
}
