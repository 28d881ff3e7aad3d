use super::error::{StageError, StagePhase};
use super::types::{OutputId, OutputMode, OutputOptions, OutputSpec};

/// Elementary PIDs usable by the MPEG-TS muxer for stream ids
pub const MPEGTS_PID_RANGE: std::ops::RangeInclusive<u16> = 0x10..=0x1FFE;

/// Ordered collection of requested outputs, frozen at activation
#[derive(Debug, Clone)]
pub struct EncodeSpecRegistry {
    mode: OutputMode,
    specs: Vec<OutputSpec>,
    sealed: bool,
}

impl EncodeSpecRegistry {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            specs: Vec::new(),
            sealed: false,
        }
    }

    /// Append an output. Its position becomes the output index.
    pub fn register(
        &mut self,
        id: impl Into<OutputId>,
        options: OutputOptions,
    ) -> Result<usize, StageError> {
        let id = id.into();

        if self.sealed {
            return Err(StageError::InvalidState {
                action: "register an output",
                phase: StagePhase::Active,
            });
        }

        if self.specs.iter().any(|spec| spec.id == id) {
            return Err(StageError::DuplicateOutput(id));
        }

        if self.mode == OutputMode::Combined && !MPEGTS_PID_RANGE.contains(&id.0) {
            return Err(StageError::InvalidSpec {
                id,
                reason: format!(
                    "stream id must be within {:#x}..={:#x} in combined mode",
                    MPEGTS_PID_RANGE.start(),
                    MPEGTS_PID_RANGE.end()
                ),
            });
        }

        options
            .validate()
            .map_err(|reason| StageError::InvalidSpec { id, reason })?;

        self.specs.push(OutputSpec { id, options });
        Ok(self.specs.len() - 1)
    }

    /// Freeze the registry; later registrations fail
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn specs(&self) -> &[OutputSpec] {
        &self.specs
    }

    pub fn ids(&self) -> impl Iterator<Item = OutputId> + '_ {
        self.specs.iter().map(|spec| spec.id)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
