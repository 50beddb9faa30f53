//! Contains error types of the bench.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Device could not be created.
#[derive(Debug, Error, Diagnostic)]
#[error("Failed to create device")]
#[diagnostic(code(bench::device), help("The soft backend exposes device #0 with queue family #0"))]
pub struct DeviceError {
    #[source]
    pub source: mev::CreateError,
}

/// Configuration file is unreadable or invalid.
#[derive(Debug, Error, Diagnostic)]
#[error("Failed to load configuration from {path}")]
#[diagnostic(
    code(bench::config),
    help("Ensure the file exists and holds valid TOML with `depth`, `tree`, `ids` and `triangles` tables")
)]
pub struct ConfigError {
    pub path: PathBuf,

    #[source]
    pub source: depth_rt::ProxyError,
}

/// Proxy pass failed while running frames.
#[derive(Debug, Error, Diagnostic)]
#[error("Frame {frame} failed")]
#[diagnostic(code(bench::frame))]
pub struct FrameError {
    pub frame: u32,

    #[source]
    pub source: depth_rt::ProxyError,
}

/// Proxy resources could not be allocated.
#[derive(Debug, Error, Diagnostic)]
#[error("Failed to set up {what}")]
#[diagnostic(code(bench::setup), help("Try a smaller resolution or fewer triangles"))]
pub struct SetupError {
    pub what: &'static str,

    #[source]
    pub source: depth_rt::ProxyError,
}
