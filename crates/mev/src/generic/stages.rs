/// Stages in the pipeline.
#[repr(u16)]
pub enum PipelineStage {
    /// Stage at which indirect arguments are read from buffer.
    DrawIndirect,

    /// Stage at which compute shader is executed.
    ComputeShader,

    /// Stage at which transfer operations are performed.
    Transfer,

    /// Stage at which acceleration structures are built and updated.
    AccelerationStructureBuild,

    /// Pseudo-stage of host access to mapped memory.
    Host,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        /// Bit for [`DrawIndirect`](PipelineStage::DrawIndirect) stage.
        const DRAW_INDIRECT = 1 << PipelineStage::DrawIndirect as u32;
        /// Bit for [`ComputeShader`](PipelineStage::ComputeShader) stage.
        const COMPUTE_SHADER = 1 << PipelineStage::ComputeShader as u32;
        /// Bit for [`Transfer`](PipelineStage::Transfer) stage.
        const TRANSFER = 1 << PipelineStage::Transfer as u32;
        /// Bit for [`AccelerationStructureBuild`](PipelineStage::AccelerationStructureBuild) stage.
        const ACCELERATION_STRUCTURE_BUILD = 1 << PipelineStage::AccelerationStructureBuild as u32;
        /// Bit for [`Host`](PipelineStage::Host) stage.
        const HOST = 1 << PipelineStage::Host as u32;

        /// All device stages.
        const ALL_COMMANDS = Self::DRAW_INDIRECT.bits()
            | Self::COMPUTE_SHADER.bits()
            | Self::TRANSFER.bits()
            | Self::ACCELERATION_STRUCTURE_BUILD.bits();
    }
}
