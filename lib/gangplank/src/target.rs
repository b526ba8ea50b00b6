// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The narrow view of the destination platform the engine needs: CRUD on
//! the target VM resource, the disk transfer resources, and a peek at a
//! transfer's worker.

use gangplank_api_types::{
    TargetVmSpec, TransferSpec, TransferState, WorkerInfo,
};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum TargetError {
    /// Creation collided with a resource of the same name. Phase handlers
    /// treat this as success so a retried create is idempotent.
    #[error("resource {0:?} already exists")]
    AlreadyExists(String),

    #[error("target cluster request failed: {0}")]
    Api(String),
}

/// CRUD surface the phase handlers use on the destination platform.
///
/// Reads express "not found" as `Ok(None)`: a resource this import created
/// that is not visible yet is a transient condition, not an error. Deletes
/// of absent resources succeed, so rollback can re-run to completion.
#[cfg_attr(test, mockall::automock)]
pub trait TargetCluster {
    fn get_vm(&self, name: &str)
        -> Result<Option<TargetVmSpec>, TargetError>;

    fn create_vm(&self, spec: &TargetVmSpec) -> Result<(), TargetError>;

    fn update_vm(&self, spec: &TargetVmSpec) -> Result<(), TargetError>;

    fn delete_vm(&self, name: &str) -> Result<(), TargetError>;

    fn get_transfer(
        &self,
        name: &str,
    ) -> Result<Option<TransferState>, TargetError>;

    fn create_transfer(
        &self,
        name: &str,
        spec: &TransferSpec,
    ) -> Result<(), TargetError>;

    fn delete_transfer(&self, name: &str) -> Result<(), TargetError>;

    /// The worker currently carrying out the named transfer, when one is
    /// visible.
    fn transfer_worker(
        &self,
        transfer_name: &str,
    ) -> Result<Option<WorkerInfo>, TargetError>;
}
