//! Ray-tracing acceleration structures over proxy geometry derived from the rasterized frame.
//!
//! Two proxies are maintained every frame.
//!
//! The depth proxy turns the depth buffer into boxes, either one per texel
//! with [`DepthProxyBuilder`] or a compressed set of plane patches with
//! [`HierarchicalDepthCompressor`], and refits [`accel::DepthAs`] over them.
//!
//! The triangle proxy reduces a triangle-id image to its distinct ids with
//! [`UniqueIdExtractor`], generates those triangles with [`TriangleProxyBuilder`]
//! and rebuilds [`accel::TriangleAs`] over them. The triangle count never leaves the device.
//!
//! Passes are recorded through a [`graph::FrameGraph`].

pub mod accel;
pub mod camera;
pub mod config;
pub mod graph;
pub mod readback;
pub mod scene;
pub mod volume;

mod depth_proxy;
mod error;
mod tree;
mod triangle_proxy;
mod unique_ids;

pub use self::{
    config::{DepthConfig, IdTableConfig, ProxyConfig, TreeConfig, TreeElementCount, TriangleConfig},
    depth_proxy::DepthProxyBuilder,
    error::ProxyError,
    tree::{HierarchicalDepthCompressor, NodeFlags, PlaneNode},
    triangle_proxy::TriangleProxyBuilder,
    unique_ids::{UniqueIdExtractor, NO_ID},
};
