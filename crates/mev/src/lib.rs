//! Tiny graphics crate made for nothing but fun.
//!
//! Only the headless `soft` backend is built here.
//! It executes compute kernels, copies and acceleration structure builds
//! on the host, in submission order.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod generic;
pub mod traits;

#[path = "soft/mod.rs"]
pub mod backend;

pub use self::{backend::*, generic::*};

/// Brings backend traits into scope without naming them.
pub mod prelude {
    pub use crate::traits::{
        AccelerationStructureCommandEncoder as _, Buffer as _, CommandEncoder as _,
        ComputeCommandEncoder as _, CopyCommandEncoder as _, Device as _, Image as _,
        Instance as _, Queue as _,
    };
}
