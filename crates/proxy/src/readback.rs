//! Deferred reads of device buffers.

use hashbrown::HashMap;
use mev::PipelineStages;

/// Handle of a scheduled read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReadbackId(u64);

impl ReadbackId {
    /// Returned when a read could not be scheduled. Never becomes ready.
    pub const INVALID: Self = ReadbackId(u64::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

/// Schedules copies of device data to the host and hands them out once complete.
pub trait Readback {
    /// Records a copy of `slice` into `encoder`.
    fn submit_read(
        &mut self,
        encoder: &mut mev::CommandEncoder,
        slice: mev::BufferSlice<'_>,
    ) -> ReadbackId;

    /// Returns `true` once the data can be fetched.
    fn is_ready(&self, id: ReadbackId) -> bool;

    /// Takes the data of a ready read.
    /// Returns `None` if the read is unknown or not ready yet.
    fn fetch(&mut self, id: ReadbackId) -> Option<Vec<u8>>;
}

struct PendingRead {
    buffer: mev::Buffer,

    /// Queue submission that carries the copy.
    /// `None` until the recording encoder is submitted.
    submission: Option<u64>,
}

/// [`Readback`] over download buffers and queue completion counters.
///
/// Call [`BufferReadback::after_submit`] after every submission
/// of an encoder that may carry reads.
pub struct BufferReadback {
    device: mev::Device,
    pending: HashMap<ReadbackId, PendingRead>,
    next_id: u64,
    completed: u64,
}

impl BufferReadback {
    pub fn new(device: &mev::Device) -> Self {
        BufferReadback {
            device: device.clone(),
            pending: HashMap::new(),
            next_id: 0,
            completed: 0,
        }
    }

    /// Assigns the latest submission to unsubmitted reads and refreshes completion.
    pub fn after_submit(&mut self, queue: &mev::Queue) {
        let submitted = queue.submitted();
        for read in self.pending.values_mut() {
            if read.submission.is_none() {
                read.submission = Some(submitted);
            }
        }
        self.completed = queue.completed();
    }

    /// Number of reads not fetched yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Readback for BufferReadback {
    fn submit_read(
        &mut self,
        encoder: &mut mev::CommandEncoder,
        slice: mev::BufferSlice<'_>,
    ) -> ReadbackId {
        let buffer = match self.device.new_buffer(mev::BufferDesc {
            size: slice.size(),
            usage: mev::BufferUsage::TRANSFER_DST,
            memory: mev::Memory::Download,
            name: "readback",
        }) {
            Ok(buffer) => buffer,
            Err(err) => {
                tracing::error!("Failed to allocate readback buffer: {err}");
                return ReadbackId::INVALID;
            }
        };

        encoder.barrier(PipelineStages::ALL_COMMANDS, PipelineStages::TRANSFER);
        encoder.copy().copy_buffer(slice, &buffer);

        let id = ReadbackId(self.next_id);
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingRead {
                buffer,
                submission: None,
            },
        );
        id
    }

    fn is_ready(&self, id: ReadbackId) -> bool {
        match self.pending.get(&id) {
            Some(PendingRead {
                submission: Some(submission),
                ..
            }) => self.completed >= *submission,
            _ => false,
        }
    }

    fn fetch(&mut self, id: ReadbackId) -> Option<Vec<u8>> {
        if !self.is_ready(id) {
            return None;
        }
        let read = self.pending.remove(&id)?;
        Some(read.buffer.read_bytes(0, read.buffer.size()))
    }
}
