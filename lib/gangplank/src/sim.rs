// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the source hypervisor and the target cluster.
//!
//! [`SimSource`] and [`SimCluster`] implement the collaborator traits well
//! enough to run whole itineraries without any real infrastructure, which
//! is what the integration tests and the standalone harness do. Transfers
//! advance each time they are observed, so the engine's polling is the
//! simulation's clock. [`SimFaults`] injects the interesting failures.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use gangplank_api_types::{
    Condition, ConditionType, PowerState, ResourceMapping, SourceType,
    SourceVmSpec, TargetVmSpec, TransferPhase, TransferSpec, TransferState,
    WorkerInfo,
};

use crate::provider::{
    Credentials, GuestConverter, Mapper, Provider, ProviderError,
    ProviderFactory, TemplateRef,
};
use crate::target::{TargetCluster, TargetError};

/// One disk of the simulated source VM.
#[derive(Clone, Debug)]
pub struct SimDisk {
    pub id: String,
    pub size_bytes: u64,
    /// Storage domain the disk lives in, matched against the request's
    /// resource mapping to pick a storage class.
    pub storage_domain: String,
    /// Whether the disk passes transferability validation.
    pub valid: bool,
}

impl SimDisk {
    pub fn new(id: &str, size_bytes: u64) -> Self {
        Self {
            id: id.to_string(),
            size_bytes,
            storage_domain: "default".to_string(),
            valid: true,
        }
    }

    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }
}

/// Failures the simulation can be told to produce.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimFaults {
    pub fail_stop_vm: bool,
    pub fail_start_vm: bool,
    pub no_template: bool,
    pub fail_template_processing: bool,
    pub fail_map_vm: bool,
}

/// A single injectable fault, parseable from its kebab-case name. Source
/// faults configure [`SimFaults`]; the transfer faults are applied to the
/// [`SimCluster`] instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SimFault {
    StopVm,
    StartVm,
    NoTemplate,
    TemplateProcessing,
    MapVm,
    InvalidDisk,
    TransferFailure,
    CrashLoopingWorker,
}

impl SimFault {
    pub const ALL: &'static [SimFault] = &[
        SimFault::StopVm,
        SimFault::StartVm,
        SimFault::NoTemplate,
        SimFault::TemplateProcessing,
        SimFault::MapVm,
        SimFault::InvalidDisk,
        SimFault::TransferFailure,
        SimFault::CrashLoopingWorker,
    ];
}

impl fmt::Display for SimFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimFault::StopVm => "stop-vm",
            SimFault::StartVm => "start-vm",
            SimFault::NoTemplate => "no-template",
            SimFault::TemplateProcessing => "template-processing",
            SimFault::MapVm => "map-vm",
            SimFault::InvalidDisk => "invalid-disk",
            SimFault::TransferFailure => "transfer-failure",
            SimFault::CrashLoopingWorker => "crash-looping-worker",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
#[error("unrecognized fault {0:?}")]
pub struct UnknownFault(pub String);

impl FromStr for SimFault {
    type Err = UnknownFault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SimFault::ALL
            .iter()
            .copied()
            .find(|fault| fault.to_string() == s)
            .ok_or_else(|| UnknownFault(s.to_string()))
    }
}

/// A simulated source hypervisor holding exactly one VM.
pub struct SimSource {
    vm_name: String,
    power: Cell<PowerState>,
    disks: Vec<SimDisk>,
    mapping: Option<ResourceMapping>,
    faults: SimFaults,
    connected: Cell<bool>,
    stop_calls: Cell<u32>,
    start_calls: Cell<u32>,
    cleaned_up: Cell<bool>,
}

impl SimSource {
    pub fn new(vm_name: &str, power: PowerState) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            power: Cell::new(power),
            disks: Vec::new(),
            mapping: None,
            faults: SimFaults::default(),
            connected: Cell::new(false),
            stop_calls: Cell::new(0),
            start_calls: Cell::new(0),
            cleaned_up: Cell::new(false),
        }
    }

    pub fn with_disks(mut self, disks: Vec<SimDisk>) -> Self {
        self.disks = disks;
        self
    }

    pub fn with_faults(mut self, faults: SimFaults) -> Self {
        self.faults = faults;
        self
    }

    pub fn power_state(&self) -> PowerState {
        self.power.get()
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.get()
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.get()
    }

    pub fn cleaned_up(&self) -> bool {
        self.cleaned_up.get()
    }

    fn generated_name(&self) -> String {
        normalize_name(&self.vm_name)
    }
}

/// Target resource names must be DNS-friendly even when the source VM's
/// name is not.
fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace('_', "-").replace(' ', "-")
}

impl Provider for SimSource {
    fn init(&mut self, _credentials: &Credentials) -> Result<(), ProviderError> {
        self.connected.set(true);
        Ok(())
    }

    fn test_connection(&self) -> Result<(), ProviderError> {
        if self.connected.get() {
            Ok(())
        } else {
            Err("not connected to the source hypervisor".into())
        }
    }

    fn load_source_vm(
        &mut self,
        source_vm: &SourceVmSpec,
    ) -> Result<(), ProviderError> {
        let matches = source_vm.name.as_deref() == Some(self.vm_name.as_str())
            || source_vm.id.is_some();
        if matches {
            Ok(())
        } else {
            Err(format!("no source VM matches {:?}", source_vm).into())
        }
    }

    fn prepare_resource_mapping(
        &mut self,
        mapping: &ResourceMapping,
        _source_vm: &SourceVmSpec,
    ) {
        self.mapping = Some(mapping.clone());
    }

    fn validate(&self) -> Result<Vec<Condition>, ProviderError> {
        Ok(vec![
            Condition::new(ConditionType::Validating, true)
                .with_reason("ValidationCompleted")
                .with_message("the source VM passed validation"),
            Condition::new(ConditionType::MappingRulesVerified, true)
                .with_reason("MappingRulesVerificationCompleted")
                .with_message("all mapping rules checked out"),
        ])
    }

    fn validate_disk_status(&self, disk_id: &str) -> Result<bool, ProviderError> {
        match self.disks.iter().find(|d| d.id == disk_id) {
            Some(disk) => Ok(disk.valid),
            None => Err(format!("unknown disk {:?}", disk_id).into()),
        }
    }

    fn stop_vm(&self) -> Result<(), ProviderError> {
        if self.faults.fail_stop_vm {
            return Err("injected stop failure".into());
        }
        self.stop_calls.set(self.stop_calls.get() + 1);
        self.power.set(PowerState::Down);
        Ok(())
    }

    fn start_vm(&self) -> Result<(), ProviderError> {
        if self.faults.fail_start_vm {
            return Err("injected start failure".into());
        }
        self.start_calls.set(self.start_calls.get() + 1);
        self.power.set(PowerState::Up);
        Ok(())
    }

    fn vm_status(&self) -> Result<PowerState, ProviderError> {
        Ok(self.power.get())
    }

    fn vm_name(&self) -> Result<String, ProviderError> {
        Ok(self.vm_name.clone())
    }

    fn clean_up(&self, _failed: bool) -> Result<(), ProviderError> {
        self.cleaned_up.set(true);
        Ok(())
    }

    fn find_template(&self) -> Result<Option<TemplateRef>, ProviderError> {
        if self.faults.no_template {
            Ok(None)
        } else {
            Ok(Some(TemplateRef {
                name: "sim-template".to_string(),
                namespace: None,
            }))
        }
    }

    fn process_template(
        &self,
        template: &TemplateRef,
        name: Option<&str>,
        namespace: &str,
    ) -> Result<TargetVmSpec, ProviderError> {
        if self.faults.fail_template_processing {
            return Err("injected template processing failure".into());
        }
        Ok(TargetVmSpec {
            name: name.map(str::to_string).unwrap_or_else(|| self.generated_name()),
            namespace: namespace.to_string(),
            cpus: 2,
            memory_mib: 2048,
            template: Some(template.name.clone()),
            ..Default::default()
        })
    }

    fn create_mapper(&self) -> Result<Box<dyn Mapper>, ProviderError> {
        Ok(Box::new(SimMapper {
            vm_name: self.vm_name.clone(),
            disks: self.disks.clone(),
            storage: self
                .mapping
                .as_ref()
                .map(|m| m.storage.clone())
                .unwrap_or_default(),
            fail_map_vm: self.faults.fail_map_vm,
        }))
    }

    fn close(&mut self) {
        self.connected.set(false);
    }
}

/// Mapper over a snapshot of the simulated source.
struct SimMapper {
    vm_name: String,
    disks: Vec<SimDisk>,
    storage: BTreeMap<String, String>,
    fail_map_vm: bool,
}

impl Mapper for SimMapper {
    fn resolve_vm_name(&self, requested: Option<&str>) -> Option<String> {
        match requested {
            Some(name) => Some(name.to_string()),
            None => Some(normalize_name(&self.vm_name)),
        }
    }

    fn create_empty_vm(&self, name: &str) -> TargetVmSpec {
        TargetVmSpec {
            name: name.to_string(),
            cpus: 1,
            memory_mib: 1024,
            ..Default::default()
        }
    }

    fn map_vm(
        &self,
        _target_name: &str,
        spec: TargetVmSpec,
    ) -> Result<TargetVmSpec, ProviderError> {
        if self.fail_map_vm {
            return Err("injected mapping failure".into());
        }
        Ok(spec)
    }

    fn map_data_volumes(
        &self,
        target_name: &str,
    ) -> Result<BTreeMap<String, TransferSpec>, ProviderError> {
        Ok(self
            .disks
            .iter()
            .map(|disk| {
                let name =
                    format!("{}-{}", target_name, normalize_name(&disk.id));
                let spec = TransferSpec {
                    source_disk_id: disk.id.clone(),
                    size_bytes: disk.size_bytes,
                    storage_class: self.storage.get(&disk.storage_domain).cloned(),
                    ..Default::default()
                };
                (name, spec)
            })
            .collect())
    }

    fn map_disk(
        &self,
        spec: &mut TargetVmSpec,
        transfer_name: &str,
        _transfer: &TransferSpec,
    ) {
        if !spec.volumes.iter().any(|v| v == transfer_name) {
            spec.volumes.push(transfer_name.to_string());
        }
    }
}

struct SimTransfer {
    spec: TransferSpec,
    phase: TransferPhase,
    progress: u8,
}

#[derive(Default)]
struct ClusterState {
    vms: BTreeMap<String, TargetVmSpec>,
    transfers: BTreeMap<String, SimTransfer>,
}

/// A simulated target cluster.
///
/// Every transfer starts Pending and moves `copy_rate` percent closer to
/// done each time it is observed through `get_transfer`.
pub struct SimCluster {
    state: RefCell<ClusterState>,
    copy_rate: u8,
    failing: RefCell<BTreeSet<String>>,
    worker_restarts: RefCell<BTreeMap<String, u32>>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(ClusterState::default()),
            copy_rate: 50,
            failing: RefCell::new(BTreeSet::new()),
            worker_restarts: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn with_copy_rate(mut self, percent_per_poll: u8) -> Self {
        self.copy_rate = percent_per_poll.max(1);
        self
    }

    /// Scripts the named transfer to report the Failed phase, whether or
    /// not it exists yet.
    pub fn fail_transfer(&self, name: &str) {
        self.failing.borrow_mut().insert(name.to_string());
    }

    /// Scripts the restart count reported for the named transfer's worker.
    pub fn set_worker_restarts(&self, name: &str, restarts: u32) {
        self.worker_restarts.borrow_mut().insert(name.to_string(), restarts);
    }

    pub fn vm(&self, name: &str) -> Option<TargetVmSpec> {
        self.state.borrow().vms.get(name).cloned()
    }

    pub fn transfer_names(&self) -> Vec<String> {
        self.state.borrow().transfers.keys().cloned().collect()
    }

    pub fn transfer_spec(&self, name: &str) -> Option<TransferSpec> {
        self.state.borrow().transfers.get(name).map(|t| t.spec.clone())
    }

    /// True when nothing the engine created is left on the cluster.
    pub fn is_empty(&self) -> bool {
        let state = self.state.borrow();
        state.vms.is_empty() && state.transfers.is_empty()
    }
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetCluster for SimCluster {
    fn get_vm(&self, name: &str) -> Result<Option<TargetVmSpec>, TargetError> {
        Ok(self.state.borrow().vms.get(name).cloned())
    }

    fn create_vm(&self, spec: &TargetVmSpec) -> Result<(), TargetError> {
        let mut state = self.state.borrow_mut();
        if state.vms.contains_key(&spec.name) {
            return Err(TargetError::AlreadyExists(spec.name.clone()));
        }
        state.vms.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    fn update_vm(&self, spec: &TargetVmSpec) -> Result<(), TargetError> {
        let mut state = self.state.borrow_mut();
        if !state.vms.contains_key(&spec.name) {
            return Err(TargetError::Api(format!(
                "no VM named {:?} to update",
                spec.name
            )));
        }
        state.vms.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    fn delete_vm(&self, name: &str) -> Result<(), TargetError> {
        self.state.borrow_mut().vms.remove(name);
        Ok(())
    }

    fn get_transfer(
        &self,
        name: &str,
    ) -> Result<Option<TransferState>, TargetError> {
        let mut state = self.state.borrow_mut();
        let transfer = match state.transfers.get_mut(name) {
            Some(transfer) => transfer,
            None => return Ok(None),
        };

        if self.failing.borrow().contains(name) {
            transfer.phase = TransferPhase::Failed;
        } else {
            match transfer.phase {
                TransferPhase::Pending => {
                    transfer.phase = TransferPhase::InProgress;
                }
                TransferPhase::InProgress => {
                    transfer.progress =
                        transfer.progress.saturating_add(self.copy_rate);
                    if transfer.progress >= 100 {
                        transfer.progress = 100;
                        transfer.phase = TransferPhase::Succeeded;
                    }
                }
                TransferPhase::Succeeded | TransferPhase::Failed => {}
            }
        }

        Ok(Some(TransferState {
            phase: transfer.phase,
            progress_percent: Some(transfer.progress),
        }))
    }

    fn create_transfer(
        &self,
        name: &str,
        spec: &TransferSpec,
    ) -> Result<(), TargetError> {
        let mut state = self.state.borrow_mut();
        if state.transfers.contains_key(name) {
            return Err(TargetError::AlreadyExists(name.to_string()));
        }
        state.transfers.insert(
            name.to_string(),
            SimTransfer {
                spec: spec.clone(),
                phase: TransferPhase::Pending,
                progress: 0,
            },
        );
        Ok(())
    }

    fn delete_transfer(&self, name: &str) -> Result<(), TargetError> {
        self.state.borrow_mut().transfers.remove(name);
        Ok(())
    }

    fn transfer_worker(
        &self,
        transfer_name: &str,
    ) -> Result<Option<WorkerInfo>, TargetError> {
        let state = self.state.borrow();
        if !state.transfers.contains_key(transfer_name) {
            return Ok(None);
        }
        let restarts = self
            .worker_restarts
            .borrow()
            .get(transfer_name)
            .copied()
            .unwrap_or(0);
        Ok(Some(WorkerInfo {
            name: format!("importer-{}", transfer_name),
            restart_count: restarts,
        }))
    }
}

/// A guest conversion that needs a fixed number of polls to finish.
pub struct SimConverter {
    polls_needed: Cell<u32>,
}

impl SimConverter {
    pub fn new(polls_needed: u32) -> Self {
        Self { polls_needed: Cell::new(polls_needed) }
    }
}

impl GuestConverter for SimConverter {
    fn convert(&self, _vm_name: &str) -> Result<bool, ProviderError> {
        let remaining = self.polls_needed.get();
        if remaining == 0 {
            Ok(true)
        } else {
            self.polls_needed.set(remaining - 1);
            Ok(false)
        }
    }
}

/// Hands out identically configured [`SimSource`] instances for whichever
/// source type is asked for.
pub struct SimFactory {
    pub vm_name: String,
    pub power: PowerState,
    pub disks: Vec<SimDisk>,
    pub faults: SimFaults,
}

impl ProviderFactory for SimFactory {
    fn create(
        &self,
        _source_type: SourceType,
    ) -> Result<Box<dyn Provider>, ProviderError> {
        Ok(Box::new(
            SimSource::new(&self.vm_name, self.power)
                .with_disks(self.disks.clone())
                .with_faults(self.faults),
        ))
    }
}
