// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-phase-at-a-time execution of an import workflow.
//!
//! A [`Task`] is constructed fresh for every invocation and keeps no state
//! of its own between calls: everything it learns or decides lands in the
//! [`ImportStatus`] record its driver persists. Each `run()` selects the
//! active itinerary (imports carrying the Failed condition run the
//! compensation pipeline), executes the body of the current phase, and
//! classifies the outcome: the phase either advances, stays put waiting on
//! an asynchronous precondition, or fails hard and reroutes the workflow
//! onto the failure itinerary.
//!
//! The returned requeue delay is the only "waiting" the engine ever
//! expresses. It never sleeps or blocks; scheduling belongs to the driver,
//! which persists the status record and re-invokes after the delay (or on
//! any relevant external event, whichever comes first).

use std::collections::BTreeSet;
use std::time::Duration;

use slog::{debug, error, info, o, warn, Logger};
use thiserror::Error;

use gangplank_api_types::{
    keys, Condition, ConditionType, ImportRequest, ImportStatus,
    MigrationMode, Phase, PowerState, TargetVmSpec, TransferPhase,
    UnknownPowerState,
};

use crate::itinerary::{Itinerary, COLD, FAILED, WARM};
use crate::provider::{GuestConverter, Mapper, Provider};
use crate::target::{TargetCluster, TargetError};

/// Default between-invocation delay. Phases with immediate follow-on work
/// ask the driver to come back quickly.
pub const FAST_REQUEUE: Duration = Duration::from_millis(100);

/// Delay while waiting out an asynchronous precondition, such as a copying
/// transfer or a running guest conversion.
pub const POLL_REQUEUE: Duration = Duration::from_secs(3);

/// Tunables for one engine invocation, resolved from configuration by the
/// driver.
#[derive(Clone, Copy, Debug)]
pub struct TaskOptions {
    /// Allow CreateVM to fall back to an empty VM definition when no
    /// template matches the source VM.
    pub import_without_template: bool,

    /// Transfer worker restarts tolerated before the import is declared
    /// crash-looping.
    pub worker_restart_tolerance: u32,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self { import_without_template: false, worker_restart_tolerance: 3 }
    }
}

/// Errors raised by phase bodies. Every one of these is also appended, in
/// rendered form, to the status record's error log before it is returned,
/// so the log remains the authoritative account of why an import failed.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("source power control failed: {0}")]
    PowerControl(String),

    #[error("source provider call failed: {0}")]
    Provider(String),

    #[error("no matching template was found for the source VM")]
    TemplateNotFound,

    #[error("processing template {template} failed: {message}")]
    TemplateProcessing { template: String, message: String },

    #[error("mapping the source VM failed: {0}")]
    Mapping(String),

    #[error("unable to resolve a name for the target VM")]
    UnresolvedTargetName,

    #[error("no target VM has been recorded for this import")]
    TargetNameMissing,

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("disk {0} is not in a transferable state")]
    DiskNotTransferable(String),

    #[error("creating transfer {name} failed: {message}")]
    TransferCreation { name: String, message: String },

    #[error("transfer {0} entered the Failed phase")]
    TransferFailed(String),

    #[error("transfer worker {worker} is crash looping: {restarts} restarts \
             exceeds the tolerance of {tolerance}")]
    WorkerCrashLoop { worker: String, restarts: u32, tolerance: u32 },

    #[error("guest conversion failed: {0}")]
    Conversion(String),

    #[error("source VM power state was never captured in the {0} annotation")]
    InitialStateMissing(&'static str),

    #[error("captured source VM power state is unusable: {0}")]
    InitialStateInvalid(#[from] UnknownPowerState),

    #[error("cleanup finished with errors: {0}")]
    CleanUpIncomplete(String),
}

impl TaskError {
    /// Short machine-readable tag used as the Failed condition's reason.
    fn reason(&self) -> &'static str {
        match self {
            TaskError::PowerControl(_) => "SourcePowerControlFailed",
            TaskError::Provider(_) => "SourceProviderFailed",
            TaskError::TemplateNotFound => "TemplateMatchingFailed",
            TaskError::TemplateProcessing { .. } => "TemplateProcessingFailed",
            TaskError::Mapping(_) => "MappingFailed",
            TaskError::UnresolvedTargetName => "TargetVMNameUnresolved",
            TaskError::TargetNameMissing => "TargetVMNameMissing",
            TaskError::Target(_) => "TargetClusterFailed",
            TaskError::DiskNotTransferable(_) => "DiskValidationFailed",
            TaskError::TransferCreation { .. } => "TransferCreationFailed",
            TaskError::TransferFailed(_) => "DiskTransferFailed",
            TaskError::WorkerCrashLoop { .. } => "DiskTransferCrashLoop",
            TaskError::Conversion(_) => "GuestConversionFailed",
            TaskError::InitialStateMissing(_)
            | TaskError::InitialStateInvalid(_) => "RestoreStateFailed",
            TaskError::CleanUpIncomplete(_) => "CleanUpFailed",
        }
    }
}

/// One invocation of the import engine.
pub struct Task<'a> {
    log: Logger,
    request: &'a ImportRequest,
    status: &'a mut ImportStatus,
    provider: &'a dyn Provider,
    target: &'a dyn TargetCluster,
    converter: Option<&'a dyn GuestConverter>,
    options: TaskOptions,
    itinerary: &'static Itinerary,
    requeue: Option<Duration>,
}

impl<'a> Task<'a> {
    pub fn new(
        log: Logger,
        request: &'a ImportRequest,
        status: &'a mut ImportStatus,
        provider: &'a dyn Provider,
        target: &'a dyn TargetCluster,
        options: TaskOptions,
    ) -> Self {
        let log = log.new(o!("import" => request.name.clone()));
        Self {
            log,
            request,
            status,
            provider,
            target,
            converter: None,
            options,
            itinerary: &COLD,
            requeue: Some(FAST_REQUEUE),
        }
    }

    /// Installs a guest-conversion collaborator. Without one, the
    /// ConvertGuest phase passes through.
    pub fn with_converter(
        mut self,
        converter: &'a dyn GuestConverter,
    ) -> Self {
        self.converter = Some(converter);
        self
    }

    /// The delay after which the driver should re-invoke the engine, or
    /// `None` once the workflow is terminal.
    pub fn requeue(&self) -> Option<Duration> {
        self.requeue
    }

    /// Executes the current phase and classifies its outcome.
    ///
    /// On a hard failure the returned error has already been appended to
    /// the status error log and the workflow rerouted, so the caller only
    /// needs to persist the status and requeue.
    pub fn run(&mut self) -> Result<(), TaskError> {
        self.init();

        info!(self.log, "running phase";
            "phase" => %self.status.phase,
            "itinerary" => self.itinerary.name());

        if !self.itinerary.contains(self.status.phase) {
            // Corrupted state: the persisted phase cannot be reached from
            // the active itinerary. Abandon the workflow at the terminal
            // phase instead of looping; the driver is not asked to retry.
            error!(self.log, "phase is not part of the active itinerary";
                "phase" => %self.status.phase,
                "itinerary" => self.itinerary.name());
            self.status.phase = Phase::Completed;
            self.requeue = None;
            return Ok(());
        }

        match self.status.phase {
            Phase::Created
            | Phase::Started
            | Phase::Prepare
            | Phase::ImportFailed => {
                self.advance();
            }
            Phase::PowerOffSource => match self.power_off_source() {
                Ok(()) => self.advance(),
                Err(e) => return Err(self.fail(e)),
            },
            Phase::CreateVM => match self.create_vm() {
                Ok(()) => self.advance(),
                Err(e) => return Err(self.fail(e)),
            },
            Phase::CreateDataVolumes => match self.create_data_volumes() {
                Ok(true) => self.advance(),
                Ok(false) => self.requeue = Some(POLL_REQUEUE),
                Err(e) => return Err(self.fail(e)),
            },
            Phase::ImportDisks => match self.import_disks() {
                Ok(true) => self.advance(),
                Ok(false) => self.requeue = Some(POLL_REQUEUE),
                Err(e) => return Err(self.fail(e)),
            },
            Phase::ConvertGuest => match self.convert_guest() {
                Ok(true) => self.advance(),
                Ok(false) => self.requeue = Some(POLL_REQUEUE),
                Err(e) => return Err(self.fail(e)),
            },
            Phase::RestoreInitialVMState => {
                match self.restore_initial_vm_state() {
                    Ok(()) => self.advance(),
                    Err(e) => return Err(self.fail(e)),
                }
            }
            Phase::CleanUp => return self.run_clean_up(false),
            Phase::CleanUpAfterFailure => return self.run_clean_up(true),
            Phase::Completed => {
                self.requeue = None;
                if self.itinerary.name() == FAILED.name() {
                    info!(self.log, "compensation complete; import abandoned");
                } else {
                    self.status.set_condition(
                        Condition::new(ConditionType::Succeeded, true)
                            .with_reason("ImportCompleted")
                            .with_message("the import finished successfully"),
                    );
                    info!(self.log, "import completed");
                }
            }
        }

        Ok(())
    }

    /// Re-evaluated on every invocation: pick the itinerary the workflow
    /// should be on and resume or restart accordingly. A switch always
    /// restarts at the new pipeline's head; staying on the same itinerary
    /// resumes at the persisted phase.
    fn init(&mut self) {
        self.requeue = Some(FAST_REQUEUE);
        self.itinerary =
            if self.status.has_condition(ConditionType::Failed) {
                &FAILED
            } else if self.request.mode == MigrationMode::Warm {
                &WARM
            } else {
                &COLD
            };

        if self.status.itinerary.as_deref() != Some(self.itinerary.name()) {
            self.status.itinerary = Some(self.itinerary.name().to_string());
            self.status.phase = self.itinerary.first();
        }
    }

    fn advance(&mut self) {
        match self.itinerary.next(self.status.phase) {
            Ok(Some(next)) => self.status.phase = next,
            Ok(None) => self.status.phase = Phase::Completed,
            Err(e) => {
                error!(self.log, "could not determine the next phase";
                    "error" => %e);
                self.status.phase = Phase::Completed;
                self.requeue = None;
            }
        }
    }

    /// Records a hard failure. Off the compensation pipeline this reroutes
    /// the workflow onto the Failed itinerary; on it, the error is appended
    /// and the pipeline keeps moving, because rerouting again would loop.
    fn fail(&mut self, err: TaskError) -> TaskError {
        warn!(self.log, "phase failed";
            "phase" => %self.status.phase,
            "error" => %err);
        self.status.record_error(err.to_string());

        if self.itinerary.name() == FAILED.name() {
            self.advance();
            return err;
        }

        self.status.set_condition(
            Condition::new(ConditionType::Failed, true)
                .with_reason(err.reason())
                .with_message(err.to_string()),
        );
        self.status.itinerary = Some(FAILED.name().to_string());
        self.status.phase = FAILED.first();
        err
    }

    fn mapper(&self) -> Result<Box<dyn Mapper>, TaskError> {
        self.provider
            .create_mapper()
            .map_err(|e| TaskError::Provider(e.to_string()))
    }

    fn target_vm_name(&self) -> Result<String, TaskError> {
        self.status
            .target_vm_name
            .clone()
            .ok_or(TaskError::TargetNameMissing)
    }

    /// Captures the source VM's power state (at most once per import), then
    /// asks the provider to stop it. The capture must survive retries
    /// untouched: compensation reads it to decide whether the source gets
    /// started back up.
    fn power_off_source(&mut self) -> Result<(), TaskError> {
        if self.status.annotation(keys::SOURCE_VM_INITIAL_STATE).is_none() {
            let state = self
                .provider
                .vm_status()
                .map_err(|e| TaskError::Provider(e.to_string()))?;
            info!(self.log, "captured source VM power state";
                "state" => %state);
            self.status.set_annotation_if_absent(
                keys::SOURCE_VM_INITIAL_STATE,
                state.to_string(),
            );
        }

        self.provider
            .stop_vm()
            .map_err(|e| TaskError::PowerControl(e.to_string()))
    }

    /// Builds the target VM spec and creates it, treating "already exists"
    /// as success so the phase can be re-run to completion.
    fn create_vm(&mut self) -> Result<(), TaskError> {
        let mapper = self.mapper()?;
        let requested = self.request.target_vm_name.as_deref();
        let mut resolved = mapper.resolve_vm_name(requested);

        let template = self
            .provider
            .find_template()
            .map_err(|e| TaskError::Provider(e.to_string()))?;
        let mut spec = match template {
            Some(template) => {
                info!(self.log, "template matched for the source VM";
                    "template" => &template.name);
                match self.provider.process_template(
                    &template,
                    resolved.as_deref(),
                    &self.request.namespace,
                ) {
                    Ok(spec) => {
                        // A template may generate a name when none was
                        // requested.
                        if resolved.is_none() && !spec.name.is_empty() {
                            resolved = Some(spec.name.clone());
                        }
                        spec
                    }
                    Err(e) if self.options.import_without_template => {
                        info!(self.log, "template processing failed; using \
                              an empty VM definition"; "error" => %e);
                        self.empty_vm(mapper.as_ref(), resolved.as_deref())?
                    }
                    Err(e) => {
                        return Err(TaskError::TemplateProcessing {
                            template: template.name,
                            message: e.to_string(),
                        });
                    }
                }
            }
            None if self.options.import_without_template => {
                info!(self.log, "no template matched for the source VM; \
                      using an empty VM definition");
                self.empty_vm(mapper.as_ref(), resolved.as_deref())?
            }
            None => return Err(TaskError::TemplateNotFound),
        };

        let name = resolved.ok_or(TaskError::UnresolvedTargetName)?;
        spec = mapper
            .map_vm(&name, spec)
            .map_err(|e| TaskError::Mapping(e.to_string()))?;

        spec.name = name.clone();
        if spec.namespace.is_empty() {
            spec.namespace = self.request.namespace.clone();
        }
        spec.owner = Some(self.request.owner_ref());
        spec.labels.insert(
            keys::IMPORT_TRACKER.to_string(),
            self.request.tracker_value(),
        );

        match self.target.create_vm(&spec) {
            Ok(()) => {
                info!(self.log, "created target VM"; "vm" => &name);
            }
            Err(TargetError::AlreadyExists(_)) => {
                info!(self.log, "target VM already exists"; "vm" => &name);
            }
            Err(e) => return Err(e.into()),
        }
        self.status.target_vm_name = Some(name);
        Ok(())
    }

    fn empty_vm(
        &self,
        mapper: &dyn Mapper,
        name: Option<&str>,
    ) -> Result<TargetVmSpec, TaskError> {
        match name {
            Some(name) => Ok(mapper.create_empty_vm(name)),
            None => Err(TaskError::UnresolvedTargetName),
        }
    }

    /// Creates the transfer resources the import requires and registers
    /// each one as a disk of the target VM. Returns false while the target
    /// VM is not visible yet.
    fn create_data_volumes(&mut self) -> Result<bool, TaskError> {
        let vm_name = self.target_vm_name()?;
        let mut vm = match self.target.get_vm(&vm_name)? {
            Some(vm) => vm,
            None => {
                debug!(self.log, "target VM not visible yet";
                    "vm" => &vm_name);
                return Ok(false);
            }
        };

        let mapper = self.mapper()?;
        let transfers = mapper
            .map_data_volumes(&vm_name)
            .map_err(|e| TaskError::Mapping(e.to_string()))?;

        for (name, transfer) in &transfers {
            let mut transfer = transfer.clone();
            transfer.owner = Some(self.request.owner_ref());
            transfer.labels.insert(
                keys::IMPORT_TRACKER.to_string(),
                self.request.tracker_value(),
            );

            if self.target.get_transfer(name)?.is_none() {
                let valid = self
                    .provider
                    .validate_disk_status(&transfer.source_disk_id)
                    .map_err(|e| TaskError::Provider(e.to_string()))?;
                if !valid {
                    return Err(TaskError::DiskNotTransferable(
                        transfer.source_disk_id.clone(),
                    ));
                }

                match self.target.create_transfer(name, &transfer) {
                    Ok(()) => {
                        info!(self.log, "created transfer";
                            "transfer" => name.as_str(),
                            "disk" => &transfer.source_disk_id);
                    }
                    Err(TargetError::AlreadyExists(_)) => {}
                    Err(e) => {
                        return Err(TaskError::TransferCreation {
                            name: name.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }

            // Attachment is re-checked separately from creation so a crash
            // between the two leaves nothing permanently unattached.
            if !vm.volumes.iter().any(|v| v == name) {
                mapper.map_disk(&mut vm, name, &transfer);
            }
        }

        self.target.update_vm(&vm)?;
        Ok(true)
    }

    /// Polls every required transfer. Done only when all of them have
    /// succeeded; a failed transfer or a crash-looping worker fails the
    /// import before completion is considered.
    fn import_disks(&mut self) -> Result<bool, TaskError> {
        let vm_name = self.target_vm_name()?;
        let mapper = self.mapper()?;
        let transfers = mapper
            .map_data_volumes(&vm_name)
            .map_err(|e| TaskError::Mapping(e.to_string()))?;

        let total = transfers.len();
        let mut succeeded = 0;
        for name in transfers.keys() {
            let state = match self.target.get_transfer(name)? {
                Some(state) => state,
                None => {
                    debug!(self.log, "transfer not visible yet";
                        "transfer" => name.as_str());
                    continue;
                }
            };

            match state.phase {
                TransferPhase::Succeeded => succeeded += 1,
                TransferPhase::Pending => {
                    debug!(self.log, "transfer pending";
                        "transfer" => name.as_str());
                }
                TransferPhase::Failed => {
                    return Err(TaskError::TransferFailed(name.clone()));
                }
                TransferPhase::InProgress => {
                    if let Some(worker) = self.target.transfer_worker(name)? {
                        if worker.restart_count
                            > self.options.worker_restart_tolerance
                        {
                            return Err(TaskError::WorkerCrashLoop {
                                worker: worker.name,
                                restarts: worker.restart_count,
                                tolerance: self
                                    .options
                                    .worker_restart_tolerance,
                            });
                        }
                    }
                    info!(self.log, "transfer in progress";
                        "transfer" => name.as_str(),
                        "progress_percent" =>
                            state.progress_percent.unwrap_or(0));
                }
            }
        }

        Ok(succeeded == total)
    }

    fn convert_guest(&mut self) -> Result<bool, TaskError> {
        let converter = match self.converter {
            Some(converter) => converter,
            None => return Ok(true),
        };
        let vm_name = self.target_vm_name()?;
        converter
            .convert(&vm_name)
            .map_err(|e| TaskError::Conversion(e.to_string()))
    }

    fn restore_initial_vm_state(&mut self) -> Result<(), TaskError> {
        // A warm import never runs PowerOffSource, so there is no captured
        // state and nothing to restore.
        if self.request.mode == MigrationMode::Warm {
            return Ok(());
        }

        let stored = self
            .status
            .annotation(keys::SOURCE_VM_INITIAL_STATE)
            .ok_or(TaskError::InitialStateMissing(
                keys::SOURCE_VM_INITIAL_STATE,
            ))?;

        match stored.parse::<PowerState>()? {
            PowerState::Up => {
                info!(self.log, "restoring source VM to its running state");
                self.provider
                    .start_vm()
                    .map_err(|e| TaskError::PowerControl(e.to_string()))?;
            }
            PowerState::Down => {
                // The source was already down before the import began.
            }
        }
        Ok(())
    }

    /// Cleanup is best-effort: every sub-error is collected, folded into
    /// one message, and recorded, but the workflow still advances so it
    /// always reaches the terminal phase.
    fn run_clean_up(&mut self, failed: bool) -> Result<(), TaskError> {
        match self.clean_up(failed) {
            Ok(()) => {
                self.advance();
                Ok(())
            }
            Err(e) => {
                warn!(self.log, "cleanup finished with errors";
                    "error" => %e);
                self.status.record_error(e.to_string());
                self.advance();
                Err(e)
            }
        }
    }

    fn clean_up(&mut self, failed: bool) -> Result<(), TaskError> {
        let mut failures = Vec::new();

        if let Err(e) = self.provider.clean_up(failed) {
            failures.push(format!("provider cleanup failed: {}", e));
        }

        if failed {
            self.roll_back(&mut failures);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TaskError::CleanUpIncomplete(failures.join("; ")))
        }
    }

    /// Deletes everything the import created on the target: the transfers
    /// (both those attached to the VM and those the mapper still knows
    /// about, in case creation crashed between the two) and the VM itself.
    fn roll_back(&mut self, failures: &mut Vec<String>) {
        let vm_name = match &self.status.target_vm_name {
            Some(name) => name.clone(),
            None => return,
        };

        let mut transfers: BTreeSet<String> = BTreeSet::new();
        match self.target.get_vm(&vm_name) {
            Ok(Some(vm)) => transfers.extend(vm.volumes.iter().cloned()),
            Ok(None) => {}
            Err(e) => failures.push(format!(
                "looking up VM {} for rollback failed: {}",
                vm_name, e
            )),
        }
        match self
            .provider
            .create_mapper()
            .and_then(|m| m.map_data_volumes(&vm_name))
        {
            Ok(map) => transfers.extend(map.into_keys()),
            Err(e) => {
                debug!(self.log, "mapper unavailable during rollback";
                    "error" => %e);
            }
        }

        for name in transfers {
            if let Err(e) = self.target.delete_transfer(&name) {
                failures
                    .push(format!("deleting transfer {} failed: {}", name, e));
            }
        }
        if let Err(e) = self.target.delete_vm(&vm_name) {
            failures.push(format!("deleting VM {} failed: {}", vm_name, e));
        }
    }
}
