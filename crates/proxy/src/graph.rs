//! Interface to the frame graph that schedules passes.
//!
//! Passes declare what they touch and receive an encoder to record into.
//! [`SequentialGraph`] is a minimal single-encoder implementation.

use std::ops::{Deref, DerefMut};

use hashbrown::HashMap;
use mev::PipelineStages;

use crate::ProxyError;

/// Resource a pass touches.
#[derive(Clone, Copy, Debug)]
pub enum Resource<'a> {
    Buffer(&'a mev::Buffer),
    Image(&'a mev::Image),
    Tlas(&'a mev::Tlas),
}

/// How a pass touches a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Usage {
    Read,
    Write,
    ReadWrite,

    /// Sampled as a texture at the given mip level.
    Sample { level: u32 },

    /// Written by an acceleration structure build.
    Build,
}

impl Usage {
    pub fn writes(&self) -> bool {
        matches!(self, Usage::Write | Usage::ReadWrite | Usage::Build)
    }
}

/// Schedules passes of a frame.
pub trait FrameGraph {
    /// Declares a pass and returns the encoder to record it into.
    ///
    /// Ordering against earlier passes of the frame is the graph's job.
    /// Barriers between commands of the same pass are recorded by the pass.
    fn pass(&mut self, name: &str, usage: &[(Resource<'_>, Usage)]) -> PassEncoder<'_>;
}

/// Command recording context of a single pass.
pub struct PassEncoder<'a> {
    encoder: &'a mut mev::CommandEncoder,
    _span: tracing::span::EnteredSpan,
}

impl<'a> PassEncoder<'a> {
    pub fn new(name: &str, encoder: &'a mut mev::CommandEncoder) -> Self {
        PassEncoder {
            encoder,
            _span: tracing::debug_span!("pass", name).entered(),
        }
    }
}

impl Deref for PassEncoder<'_> {
    type Target = mev::CommandEncoder;

    fn deref(&self) -> &mev::CommandEncoder {
        self.encoder
    }
}

impl DerefMut for PassEncoder<'_> {
    fn deref_mut(&mut self) -> &mut mev::CommandEncoder {
        self.encoder
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Key {
    Buffer(u64),
    Image(u64),
    Tlas(u64),
}

impl Resource<'_> {
    fn key(&self) -> Key {
        match self {
            Resource::Buffer(buffer) => Key::Buffer(buffer.id()),
            Resource::Image(image) => Key::Image(image.id()),
            Resource::Tlas(tlas) => Key::Tlas(tlas.id()),
        }
    }
}

/// Records every pass of a frame into one encoder in declaration order.
///
/// Inserts a full barrier before a pass that conflicts
/// with an access of an earlier pass since the last barrier.
pub struct SequentialGraph {
    encoder: mev::CommandEncoder,
    touched: HashMap<Key, bool>,
    passes: usize,
    barriers: usize,
}

impl SequentialGraph {
    /// Starts a frame on `queue`.
    pub fn begin(queue: &mut mev::Queue) -> Result<Self, ProxyError> {
        Ok(SequentialGraph {
            encoder: queue.new_command_encoder()?,
            touched: HashMap::new(),
            passes: 0,
            barriers: 0,
        })
    }

    /// Encoder for work outside declared passes, such as readbacks.
    pub fn encoder(&mut self) -> &mut mev::CommandEncoder {
        &mut self.encoder
    }

    /// Number of barriers inserted between passes so far.
    pub fn barriers(&self) -> usize {
        self.barriers
    }

    /// Ends the frame and submits it.
    pub fn submit(self, queue: &mut mev::Queue) -> Result<(), ProxyError> {
        tracing::trace!(
            "Submitting frame of {} passes with {} inter-pass barriers",
            self.passes,
            self.barriers
        );
        let cbuf = self.encoder.finish()?;
        queue.submit([cbuf])?;
        Ok(())
    }
}

impl FrameGraph for SequentialGraph {
    fn pass(&mut self, name: &str, usage: &[(Resource<'_>, Usage)]) -> PassEncoder<'_> {
        let conflict = usage.iter().any(|(resource, usage)| {
            match self.touched.get(&resource.key()) {
                None => false,
                Some(&written) => written || usage.writes(),
            }
        });

        if conflict {
            self.encoder
                .barrier(PipelineStages::ALL_COMMANDS, PipelineStages::ALL_COMMANDS);
            self.touched.clear();
            self.barriers += 1;
        }

        for (resource, usage) in usage {
            let written = self.touched.entry(resource.key()).or_insert(false);
            *written |= usage.writes();
        }

        self.passes += 1;
        PassEncoder::new(name, &mut self.encoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_only_on_conflict() {
        let (device, mut queues) = mev::Instance::new()
            .create(mev::DeviceDesc::default())
            .unwrap();
        let queue = &mut queues[0];

        let buffer = |name| {
            device
                .new_buffer(mev::BufferDesc {
                    size: 16,
                    usage: mev::BufferUsage::STORAGE,
                    memory: mev::Memory::Device,
                    name,
                })
                .unwrap()
        };
        let a = buffer("a");
        let b = buffer("b");

        let mut graph = SequentialGraph::begin(queue).unwrap();
        graph.pass("read-a", &[(Resource::Buffer(&a), Usage::Read)]);
        graph.pass("read-a-again", &[(Resource::Buffer(&a), Usage::Read)]);
        assert_eq!(graph.barriers(), 0);

        graph.pass("write-b", &[(Resource::Buffer(&b), Usage::Write)]);
        assert_eq!(graph.barriers(), 0);

        graph.pass(
            "read-b-write-a",
            &[
                (Resource::Buffer(&b), Usage::Read),
                (Resource::Buffer(&a), Usage::Write),
            ],
        );
        assert_eq!(graph.barriers(), 1);

        graph.submit(queue).unwrap();
        assert_eq!(queue.completed(), 1);
    }
}
