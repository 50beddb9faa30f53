use std::{collections::VecDeque, fmt, ops::Range};

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::generic::{Access, DeviceError, OutOfMemory, PipelineStages, ValidationError};

use super::{
    acst,
    command::{BoundArgument, Command, CommandBuffer, Groups, SliceRef},
    CommandEncoder, Device,
};

/// Kind of unsynchronized access pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HazardKind {
    ReadAfterWrite,
    WriteAfterRead,
    WriteAfterWrite,
}

/// Access to a resource that no barrier orders
/// against an earlier access in the same submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hazard {
    /// Index of the later command in its command buffer.
    pub command: usize,

    /// Name of the resource.
    pub resource: String,

    pub kind: HazardKind,
}

impl fmt::Display for Hazard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} on '{}' at command #{}",
            self.kind, self.resource, self.command
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ResourceKey {
    Buffer(u64),
    Image(u64),
    Blas(u64),
    Tlas(u64),
}

struct Record {
    range: Range<usize>,
    stage: PipelineStages,
    write: bool,
    command: usize,
    /// Number of barriers recorded before the access.
    epoch: usize,
}

/// Tracks accesses within one command buffer.
/// Barriers are global memory barriers filtered by stage masks.
#[derive(Default)]
struct Tracker {
    barriers: Vec<(PipelineStages, PipelineStages)>,
    resources: HashMap<ResourceKey, (String, Vec<Record>)>,
    hazards: Vec<Hazard>,
}

impl Tracker {
    fn barrier(&mut self, after: PipelineStages, before: PipelineStages) {
        self.barriers.push((after, before));
    }

    fn access(
        &mut self,
        command: usize,
        key: ResourceKey,
        name: &str,
        range: Range<usize>,
        stage: PipelineStages,
        access: Access,
    ) {
        let epoch = self.barriers.len();
        let (_, records) = self
            .resources
            .entry(key)
            .or_insert_with(|| (name.to_owned(), Vec::new()));

        for record in records.iter() {
            if record.command == command {
                continue;
            }
            if record.range.start >= range.end || range.start >= record.range.end {
                continue;
            }
            let kind = match (record.write, access.writes()) {
                (true, true) => HazardKind::WriteAfterWrite,
                (true, false) => HazardKind::ReadAfterWrite,
                (false, true) => HazardKind::WriteAfterRead,
                (false, false) => continue,
            };
            let ordered = self.barriers[record.epoch..]
                .iter()
                .any(|(after, before)| after.contains(record.stage) && before.contains(stage));
            if !ordered {
                self.hazards.push(Hazard {
                    command,
                    resource: name.to_owned(),
                    kind,
                });
            }
        }

        records.push(Record {
            range,
            stage,
            write: access.writes(),
            command,
            epoch,
        });
    }

    fn buffer(&mut self, command: usize, slice: &SliceRef, stage: PipelineStages, access: Access) {
        self.access(
            command,
            ResourceKey::Buffer(slice.buffer.id()),
            slice.buffer.name(),
            slice.range(),
            stage,
            access,
        );
    }
}

pub struct Queue {
    device: Device,
    family: u32,
    latency: usize,
    pending: VecDeque<CommandBuffer>,
    submitted: u64,
    completed: u64,
    hazards: Vec<Hazard>,
    validation_errors: Vec<ValidationError>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("family", &self.family)
            .field("submitted", &self.submitted)
            .field("completed", &self.completed)
            .finish()
    }
}

impl Queue {
    pub(super) fn new(device: Device, family: u32, latency: u32) -> Self {
        Queue {
            device,
            family,
            latency: latency as usize,
            pending: VecDeque::new(),
            submitted: 0,
            completed: 0,
            hazards: Vec::new(),
            validation_errors: Vec::new(),
        }
    }

    /// Hazards detected in executed command buffers.
    pub fn hazards(&self) -> &[Hazard] {
        &self.hazards
    }

    /// Commands rejected in executed command buffers.
    pub fn validation_errors(&self) -> &[ValidationError] {
        &self.validation_errors
    }

    /// Clears collected hazards and validation errors.
    pub fn clear_diagnostics(&mut self) {
        self.hazards.clear();
        self.validation_errors.clear();
    }

    fn retire(&mut self, keep: usize) {
        while self.pending.len() > keep {
            if let Some(cbuf) = self.pending.pop_front() {
                self.execute(cbuf);
            }
        }
    }

    fn execute(&mut self, cbuf: CommandBuffer) {
        let mut tracker = Tracker::default();
        let mut warnings = Vec::new();

        for (idx, command) in cbuf.commands.iter().enumerate() {
            let result =
                self.execute_command(&cbuf.device, &mut tracker, idx, command, &mut warnings);
            if let Err(message) = result {
                let resource = command_resource(command);
                tracing::error!("Command #{} on '{}' rejected: {}", idx, resource, message);
                self.validation_errors.push(ValidationError {
                    command: idx,
                    resource,
                    message,
                });
            }
            for message in warnings.drain(..) {
                let resource = command_resource(command);
                tracing::warn!("Command #{} on '{}': {}", idx, resource, message);
                self.validation_errors.push(ValidationError {
                    command: idx,
                    resource,
                    message,
                });
            }
        }

        for hazard in &tracker.hazards {
            tracing::warn!("Hazard: {}", hazard);
        }
        self.hazards.append(&mut tracker.hazards);
        self.completed += 1;
    }

    fn execute_command(
        &self,
        device: &Device,
        tracker: &mut Tracker,
        idx: usize,
        command: &Command,
        warnings: &mut Vec<String>,
    ) -> Result<(), String> {
        match command {
            Command::Barrier { after, before } => {
                tracker.barrier(*after, *before);
            }
            Command::WriteBuffer { dst, data } => {
                tracker.buffer(idx, dst, PipelineStages::TRANSFER, Access::Write);
                dst.buffer.write_bytes(dst.offset, data);
            }
            Command::FillBuffer { dst, data } => {
                if dst.offset % 4 != 0 || dst.size % 4 != 0 {
                    return Err("fill range must be word-aligned".to_owned());
                }
                tracker.buffer(idx, dst, PipelineStages::TRANSFER, Access::Write);
                dst.buffer.fill_words(dst.offset, dst.size, *data);
            }
            Command::CopyBuffer { src, dst } => {
                tracker.buffer(idx, src, PipelineStages::TRANSFER, Access::Read);
                tracker.buffer(idx, dst, PipelineStages::TRANSFER, Access::Write);
                let bytes = src.buffer.read_bytes(src.offset, src.size);
                dst.buffer.write_bytes(dst.offset, &bytes);
            }
            Command::Dispatch {
                pipeline,
                arguments,
                constants,
                groups,
            } => {
                let groups = match groups {
                    Groups::Direct(groups) => *groups,
                    Groups::Indirect(args) => {
                        tracker.buffer(idx, args, PipelineStages::DRAW_INDIRECT, Access::Read);
                        match (args.read_u32(0), args.read_u32(4), args.read_u32(8)) {
                            (Some(x), Some(y), Some(z)) => [x, y, z],
                            _ => return Err("indirect arguments are out of bounds".to_owned()),
                        }
                    }
                };

                for argument in arguments {
                    match argument {
                        BoundArgument::Buffer { slice, access } => {
                            tracker.buffer(idx, slice, PipelineStages::COMPUTE_SHADER, *access);
                        }
                        BoundArgument::Image {
                            image,
                            level,
                            access,
                        } => {
                            tracker.access(
                                idx,
                                ResourceKey::Image(image.id()),
                                image.name(),
                                *level as usize..*level as usize + 1,
                                PipelineStages::COMPUTE_SHADER,
                                *access,
                            );
                        }
                    }
                }

                let _span = tracing::trace_span!("dispatch", pipeline = pipeline.name()).entered();
                pipeline.run(arguments, constants, groups);
            }
            Command::BuildBlas {
                blas,
                build,
                scratch,
            } => {
                let stage = PipelineStages::ACCELERATION_STRUCTURE_BUILD;
                for input in build.geometry.inputs() {
                    tracker.buffer(idx, input, stage, Access::Read);
                }
                if let super::command::Count::Indirect(count) = &build.count {
                    tracker.buffer(idx, count, stage, Access::Read);
                }
                tracker.buffer(idx, scratch, stage, Access::ReadWrite);
                tracker.buffer(idx, blas.storage(), stage, Access::ReadWrite);
                tracker.access(
                    idx,
                    ResourceKey::Blas(blas.id()),
                    blas.name(),
                    0..1,
                    stage,
                    Access::ReadWrite,
                );

                acst::build_blas(device.limits(), blas, build, scratch)?;
            }
            Command::BuildTlas {
                tlas,
                build,
                scratch,
            } => {
                let stage = PipelineStages::ACCELERATION_STRUCTURE_BUILD;
                tracker.buffer(idx, &build.instances, stage, Access::Read);
                tracker.buffer(idx, scratch, stage, Access::ReadWrite);
                tracker.buffer(idx, tlas.storage(), stage, Access::ReadWrite);
                tracker.access(
                    idx,
                    ResourceKey::Tlas(tlas.id()),
                    tlas.name(),
                    0..1,
                    stage,
                    Access::ReadWrite,
                );

                // Referenced BLASes are read by the build.
                let records: Vec<crate::generic::TlasInstance> = build
                    .instances
                    .buffer
                    .read_pod(build.instances.offset, build.count as usize);
                let mut referenced: SmallVec<[u64; 4]> = SmallVec::new();
                for record in &records {
                    if let Some(blas) = device.inner().resolve_blas(record.blas_address) {
                        if !referenced.contains(&record.blas_address) {
                            referenced.push(record.blas_address);
                            tracker.access(
                                idx,
                                ResourceKey::Blas(acst::blas_id(&blas)),
                                acst::blas_name(&blas),
                                0..1,
                                stage,
                                Access::Read,
                            );
                        }
                    }
                }

                acst::build_tlas(device.inner(), tlas, build, scratch, warnings)?;
            }
        }
        Ok(())
    }
}

fn command_resource(command: &Command) -> String {
    match command {
        Command::Barrier { .. } => "barrier".to_owned(),
        Command::WriteBuffer { dst, .. } | Command::FillBuffer { dst, .. } => {
            dst.buffer.name().to_owned()
        }
        Command::CopyBuffer { dst, .. } => dst.buffer.name().to_owned(),
        Command::Dispatch { pipeline, .. } => pipeline.name().to_owned(),
        Command::BuildBlas { blas, .. } => blas.name().to_owned(),
        Command::BuildTlas { tlas, .. } => tlas.name().to_owned(),
    }
}

#[hidden_trait::expose]
impl crate::traits::Queue for Queue {
    fn family(&self) -> u32 {
        self.family
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn new_command_encoder(&mut self) -> Result<CommandEncoder, OutOfMemory> {
        Ok(CommandEncoder::new(self.device.clone()))
    }

    fn submit<I>(&mut self, command_buffers: I) -> Result<(), DeviceError>
    where
        I: IntoIterator<Item = CommandBuffer>,
    {
        for cbuf in command_buffers {
            if cbuf.device != self.device {
                tracing::error!("Command buffer submitted to a queue of another device");
                return Err(DeviceError::DeviceLost);
            }
            self.pending.push_back(cbuf);
            self.submitted += 1;
        }
        self.retire(self.latency);
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), DeviceError> {
        self.retire(0);
        Ok(())
    }

    fn submitted(&self) -> u64 {
        self.submitted
    }

    fn completed(&self) -> u64 {
        self.completed
    }
}
