use std::path::Path;

use crate::error::{Result, UpdateError};
use crate::plan::UpdatePlan;

/// Reports free space on the volume holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, volume: &Path) -> Result<u64>;
}

/// [`SpaceProbe`] backed by the operating system via `fs2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fs2SpaceProbe;

impl SpaceProbe for Fs2SpaceProbe {
    fn available_bytes(&self, volume: &Path) -> Result<u64> {
        fs2::available_space(volume).map_err(|err| UpdateError::fs(volume, err))
    }
}

/// Pre-flight check that the plan fits on the volume.
pub struct SpaceVerifier<'a> {
    probe: &'a dyn SpaceProbe,
    reserve: u64,
}

impl<'a> SpaceVerifier<'a> {
    pub fn new(probe: &'a dyn SpaceProbe, reserve: u64) -> Self {
        Self { probe, reserve }
    }

    /// Bytes that must be free before applying `plan`. Removals are not
    /// credited: a file may be added before the matching one is deleted.
    pub fn required_bytes(&self, plan: &UpdatePlan) -> u64 {
        plan.incoming_bytes.saturating_add(self.reserve)
    }

    pub fn verify(&self, plan: &UpdatePlan, volume: &Path) -> Result<()> {
        let required = self.required_bytes(plan);
        let available = self.probe.available_bytes(volume)?;
        tracing::debug!(required, available, "checked free space");
        if available < required {
            return Err(UpdateError::InsufficientSpace {
                required,
                available,
            });
        }
        Ok(())
    }
}
