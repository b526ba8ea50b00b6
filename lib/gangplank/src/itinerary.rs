// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static itineraries and the transition function that walks them.
//!
//! An itinerary is an ordered pipeline of phases describing one import mode.
//! There are exactly three: a cold import, a warm import, and the
//! compensation pipeline taken once an import has been marked failed. The
//! engine never invents phases; every phase it runs comes from one of these
//! pipelines, and the transition function below is the only way it moves
//! between them.

use gangplank_api_types::Phase;
use thiserror::Error;

/// A named, ordered pipeline of phases.
///
/// Phases within a pipeline are unique and the final entry is always the
/// terminal phase. Itineraries are immutable; the three statics in this
/// module are the only instances.
#[derive(Debug)]
pub struct Itinerary {
    name: &'static str,
    pipeline: &'static [Phase],
}

/// Full stop-start migration: the source VM is powered off before its disks
/// are copied.
pub static COLD: Itinerary = Itinerary {
    name: "ColdImport",
    pipeline: &[
        Phase::Created,
        Phase::Started,
        Phase::Prepare,
        Phase::PowerOffSource,
        Phase::CreateVM,
        Phase::CreateDataVolumes,
        Phase::ImportDisks,
        Phase::ConvertGuest,
        Phase::CleanUp,
        Phase::Completed,
    ],
};

/// Live migration: the same pipeline as [`COLD`] minus the source power-off,
/// so the source VM keeps serving while its disks are copied.
pub static WARM: Itinerary = Itinerary {
    name: "WarmImport",
    pipeline: &[
        Phase::Created,
        Phase::Started,
        Phase::Prepare,
        Phase::CreateVM,
        Phase::CreateDataVolumes,
        Phase::ImportDisks,
        Phase::ConvertGuest,
        Phase::CleanUp,
        Phase::Completed,
    ],
};

/// Compensation path: restore the source VM's original power state, then
/// tear down whatever the import created.
pub static FAILED: Itinerary = Itinerary {
    name: "Failed",
    pipeline: &[
        Phase::ImportFailed,
        Phase::RestoreInitialVMState,
        Phase::CleanUpAfterFailure,
        Phase::Completed,
    ],
};

#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransitionError {
    /// The persisted phase does not belong to the active itinerary. This is
    /// state corruption: the caller must force the terminal phase rather
    /// than retry.
    #[error("phase {phase} is not part of itinerary {itinerary}")]
    PhaseNotInItinerary { itinerary: &'static str, phase: Phase },
}

impl Itinerary {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pipeline(&self) -> &'static [Phase] {
        self.pipeline
    }

    /// The phase a fresh workflow on this itinerary starts in.
    pub fn first(&self) -> Phase {
        self.pipeline[0]
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.pipeline.contains(&phase)
    }

    /// Returns the phase following `current`, or `None` when `current` is
    /// the terminal phase. Pure lookup; the only error is a phase that is
    /// not part of this pipeline at all.
    pub fn next(
        &self,
        current: Phase,
    ) -> Result<Option<Phase>, TransitionError> {
        match self.pipeline.iter().position(|p| *p == current) {
            None => Err(TransitionError::PhaseNotInItinerary {
                itinerary: self.name,
                phase: current,
            }),
            Some(ix) if ix + 1 == self.pipeline.len() => Ok(None),
            Some(ix) => Ok(Some(self.pipeline[ix + 1])),
        }
    }
}
